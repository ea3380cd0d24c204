#![cfg(all(feature = "backend_ndarray", feature = "backend_wgpu"))]

use burn::backend::{ndarray::NdArray, Autodiff};
use burn_depthconv::{
    correctness::{self, ConvCase},
    kernels::depth_conv::jit::DepthConvWgpu,
    DepthConvOptions,
};

type HostBackend = NdArray<f32>;


fn assert_kernels_match_host(case: &ConvCase) {
    let gpu = correctness::run_case::<DepthConvWgpu>(case, &Default::default()).unwrap();
    let host = correctness::run_case::<HostBackend>(case, &Default::default()).unwrap();

    let stats = [
        ("output", correctness::compute_stats(&gpu.output, &host.output)),
        ("grad_input", correctness::compute_stats(&gpu.grad_input, &host.grad_input)),
        ("grad_weight", correctness::compute_stats(&gpu.grad_weight, &host.grad_weight)),
        ("grad_bias", correctness::compute_stats(&gpu.grad_bias, &host.grad_bias)),
    ];

    for (name, stats) in stats {
        assert!(
            stats.within(1e-4, 1e-4),
            "{name} diverges between wgpu and host for {:?}: {stats:?}",
            case.options,
        );
    }
}


#[test]
fn wgpu_kernels_match_host() {
    let configs = [
        DepthConvOptions::default().with_alpha(1.0),
        DepthConvOptions::default().with_padding([1, 1]).with_alpha(8.3),
        DepthConvOptions::default()
            .with_stride([2, 1])
            .with_padding([2, 1])
            .with_dilation([2, 1])
            .with_alpha(3.0),
    ];

    for options in configs {
        let case = ConvCase::synthetic([2, 3, 9, 7], [4, 3, 3, 3], options).unwrap();
        assert_kernels_match_host(&case);
    }
}

#[test]
fn wgpu_uniform_depth_matches_conv2d() {
    let case = ConvCase::synthetic(
        [1, 3, 8, 8],
        [2, 3, 3, 3],
        DepthConvOptions::default().with_padding([1, 1]).with_alpha(8.3),
    )
    .unwrap();

    let stats = correctness::compare_with_conv2d::<Autodiff<DepthConvWgpu>>(&case, 1.25, &Default::default())
        .unwrap();
    assert!(stats.within_defaults(), "{stats:?}");
}
