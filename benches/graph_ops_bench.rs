use criterion::{black_box, criterion_group, criterion_main, Criterion};
use jacobi_graph::nn::{self, Conv2dConfig};
use jacobi_graph::{ops, Graph, Shape, Tensor};
use rand::prelude::*;
use rand::rng;

// Helper function to create random tensor
fn create_random(shape: Shape) -> Tensor {
    let size = shape.iter().product();
    let mut rng_instance = rng();
    let data: Vec<f64> = (0..size).map(|_| rng_instance.random::<f64>()).collect();
    Tensor::from_vec(shape, data).unwrap()
}

fn bench_matrix_multiply(c: &mut Criterion) {
    let shapes = [([1, 1, 128, 128], "128"), ([8, 4, 64, 64], "8x4x64")];

    let mut group = c.benchmark_group("matrix_multiply");
    for (shape, label) in shapes.iter() {
        let a = create_random(*shape);
        let b = create_random(*shape);
        group.bench_function(format!("matmul_{}", label), |bencher| {
            bencher.iter(|| {
                black_box(black_box(&a).matmul(black_box(&b))).unwrap();
            });
        });
    }
    group.finish();
}

fn bench_transforms(c: &mut Criterion) {
    let mut group = c.benchmark_group("transforms");
    let images = create_random([8, 16, 32, 32]);

    group.bench_function("img2col_3x3", |bencher| {
        bencher.iter(|| {
            black_box(ops::img2col(black_box(&images), (3, 3), 1)).unwrap();
        });
    });

    let cols = ops::img2col(&images, (3, 3), 1).unwrap();
    group.bench_function("col2img_3x3", |bencher| {
        bencher.iter(|| {
            black_box(ops::col2img(black_box(&cols), (3, 3), 1, [8, 16, 32, 32])).unwrap();
        });
    });

    group.bench_function("max_pool_2x2", |bencher| {
        bencher.iter(|| {
            black_box(ops::max_pool2d(black_box(&images), (2, 2), 2)).unwrap();
        });
    });

    let mut square = create_random([8, 16, 32, 32]);
    group.bench_function("transpose_inplace", |bencher| {
        bencher.iter(|| {
            square.transpose().unwrap();
        });
    });
    group.finish();
}

fn bench_graph_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("graph_cycle");
    group.sample_size(10);

    let input_shape = [2, 1, 8, 8];
    let mut g = Graph::new();
    let x = g.data_node("input", create_random(input_shape));
    let cfg = Conv2dConfig {
        padding: (1, 1),
        ..Default::default()
    };
    let conv = nn::conv2d(&mut g, "conv1", x, input_shape, 4, &cfg).unwrap();
    let out = nn::sigmoid(&mut g, "conv1", conv.output).unwrap();

    group.bench_function("conv_forward_backward", |bencher| {
        bencher.iter(|| {
            g.clear_all_jacobi();
            g.forward(out).unwrap();
            g.backward(conv.weight, out).unwrap();
            black_box(g.jacobi(conv.weight).unwrap());
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_matrix_multiply,
    bench_transforms,
    bench_graph_cycle
);
criterion_main!(benches);
