//! Numerical kernels behind [`Tensor`](crate::Tensor) and the graph operations.
//!
//! - [`cpu_ops`]: broadcasting arithmetic, batched matmul, transpose, slicing,
//!   concatenation and reductions.
//! - [`transform`]: padding, img2col/col2img and max pooling.
//! - [`jacobian`]: local Jacobian builders and the slice-wise chain rule.
//!
//! Every kernel partitions its output into disjoint (batch, channel) chunks
//! and runs them on the rayon pool.

pub mod cpu_ops;
pub mod jacobian;
pub mod transform;

pub use jacobian::{
    broadcast_jacobi, chain_dense, chain_diagonal, diagonal, diagonal_blocks, diagonal_entries,
    flat_jacobi, identity, special_jacobi, transpose_jacobi, view_jacobi,
};
pub use transform::{add_padding, col2img, img2col, max_pool2d, output_extent, scatter_to_winners, sub_padding};
