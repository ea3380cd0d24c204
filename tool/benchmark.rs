#![cfg_attr(not(feature = "backend_ndarray"), allow(dead_code))]

#[cfg(feature = "backend_ndarray")]
use burn::{backend::NdArray, prelude::*};
#[cfg(feature = "backend_ndarray")]
use burn_depthconv::{depth_conv, depth_conv_forward, DepthConvOptions};
#[cfg(feature = "backend_ndarray")]
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};

#[cfg(feature = "backend_ndarray")]
type BenchBackend = NdArray<f32>;

#[cfg(feature = "backend_ndarray")]
criterion_group! {
    name = depth_conv_benchmarks;
    config = Criterion::default().sample_size(50);
    targets = forward_benchmark, backward_benchmark,
}
#[cfg(feature = "backend_ndarray")]
criterion_main!(depth_conv_benchmarks);

#[cfg(feature = "backend_ndarray")]
const SHAPES: [([usize; 4], [usize; 4], &str); 3] = [
    ([1, 3, 64, 64], [16, 3, 3, 3], "64px"),
    ([1, 16, 128, 128], [32, 16, 3, 3], "128px"),
    ([4, 32, 64, 64], [32, 32, 3, 3], "batch4"),
];

#[cfg(feature = "backend_ndarray")]
fn operands(
    input_shape: [usize; 4],
    weight_shape: [usize; 4],
    device: &<BenchBackend as Backend>::Device,
) -> (
    Tensor<BenchBackend, 4>,
    Tensor<BenchBackend, 4>,
    Tensor<BenchBackend, 4>,
    Tensor<BenchBackend, 1>,
) {
    use burn::tensor::Distribution;

    let [batch, _, height, width] = input_shape;
    (
        Tensor::random(input_shape, Distribution::Default, device),
        Tensor::random([batch, 1, height, width], Distribution::Uniform(0.5, 4.0), device),
        Tensor::random(weight_shape, Distribution::Default, device),
        Tensor::zeros([weight_shape[0]], device),
    )
}

#[cfg(feature = "backend_ndarray")]
fn forward_benchmark(c: &mut Criterion) {
    let options = DepthConvOptions::default().with_padding([1, 1]).with_alpha(8.3);

    let mut group = c.benchmark_group("depth_conv_forward");
    for (input_shape, weight_shape, name) in SHAPES.iter() {
        group.throughput(Throughput::Elements(input_shape.iter().product::<usize>() as u64));
        group.bench_with_input(BenchmarkId::new("ndarray", name), input_shape, |b, &input_shape| {
            let device = Default::default();
            let (input, depth, weight, bias) = operands(input_shape, *weight_shape, &device);

            b.iter(|| {
                depth_conv(
                    input.clone(),
                    depth.clone(),
                    weight.clone(),
                    bias.clone(),
                    options.clone(),
                )
                .map(|output| output.into_data())
            });
        });
    }
}

#[cfg(feature = "backend_ndarray")]
fn backward_benchmark(c: &mut Criterion) {
    let options = DepthConvOptions::default().with_padding([1, 1]).with_alpha(8.3);

    let mut group = c.benchmark_group("depth_conv_backward");
    for (input_shape, weight_shape, name) in SHAPES.iter() {
        group.throughput(Throughput::Elements(input_shape.iter().product::<usize>() as u64));
        group.bench_with_input(BenchmarkId::new("ndarray", name), input_shape, |b, &input_shape| {
            let device = Default::default();
            let (input, depth, weight, bias) = operands(input_shape, *weight_shape, &device);

            b.iter(|| {
                let (output, mut context) = depth_conv_forward(
                    input.clone(),
                    depth.clone(),
                    weight.clone(),
                    bias.clone(),
                    options.clone(),
                )?;

                context
                    .backward(output.ones_like())
                    .map(|grads| grads.input.into_data())
            });
        });
    }
}

#[cfg(not(feature = "backend_ndarray"))]
fn main() {
    eprintln!(
        "depth_conv benchmark requires `--features backend_ndarray`. \
         Re-run with `cargo bench --features backend_ndarray`."
    );
}
