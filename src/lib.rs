//! A 4D tensor library with a Jacobian-based computational graph
//!
//! This library provides:
//! - Rank-4 (N, C, H, W) tensors with shared, copy-on-write buffers
//! - Broadcasting arithmetic, matrix products, slicing, padding and img2col kernels
//! - A node graph whose backward pass stores full Jacobian matrices
//! - Layer builders (linear, convolution, max-pool, sigmoid, log-loss) and SGD
//!
//! # Features
//! - `debug_logs` - Prints graph construction, forward and backward traces
//!
//! # Example
//! ```rust
//! use jacobi_graph::{nn, Graph, LogLossConfig, Sgd, Tensor};
//!
//! fn main() -> Result<(), jacobi_graph::Error> {
//!     let mut g = Graph::new();
//!     let x = g.data_node("x", Tensor::from_vec([1, 1, 1, 4], vec![1.0, 2.0, 3.0, 4.0])?);
//!     let y = g.data_node("y", Tensor::scalar(1.0));
//!
//!     let fc = nn::linear(&mut g, "fc", x, 4, 1, &nn::LinearConfig::default())?;
//!     let p = nn::sigmoid(&mut g, "fc", fc.output)?;
//!     let loss = nn::log_loss(&mut g, "out", p, y, &LogLossConfig::default())?;
//!
//!     let mut sgd = Sgd::new(fc.params().to_vec(), 0.1);
//!     g.forward(loss)?;
//!     sgd.step(&mut g, loss)?;
//!     sgd.zero_grad(&mut g);
//!     Ok(())
//! }
//! ```

// --- Central debug_println macro definition ---
/// Conditional logging macro. Prints if 'debug_logs' feature is enabled.
#[cfg(feature = "debug_logs")]
#[macro_export]
macro_rules! debug_println {
    ($($arg:tt)*) => {
        ::std::println!("[DEBUG {}] {}", module_path!(), ::std::format_args!($($arg)*))
    };
}

/// Conditional logging macro (disabled version). Does nothing.
#[cfg(not(feature = "debug_logs"))]
#[macro_export]
macro_rules! debug_println {
    ($($arg:tt)*) => {};
}

pub mod error;
pub mod graph;
pub mod init;
pub mod nn;
pub mod ops;
pub mod optim;
pub mod tensor;
pub mod util;

pub mod test_utils;

pub use error::{Error, Reduction};
pub use graph::{Graph, LabelMatch, LocalJacobi, LogLossConfig, Node, NodeId, NodeKind, Op};
pub use init::InitScheme;
pub use optim::Sgd;
pub use tensor::{Elem, Shape, Tensor};
