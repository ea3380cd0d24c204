use std::env;

use burn::backend::{Autodiff, NdArray};
use log::info;

use burn_depthconv::{
    correctness::{
        self,
        ConvCase,
        DepthConvReference,
        GRADIENT_MAX_ABS,
    },
    DepthConvOptions,
};


type HostBackend = NdArray<f32>;
type HostAutodiffBackend = Autodiff<HostBackend>;


fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let device = Default::default();
    let options = DepthConvOptions::default()
        .with_padding([1, 1])
        .with_alpha(1.0);

    let case = ConvCase::synthetic([1, 3, 8, 8], [1, 3, 3, 3], options.clone())?;

    let report = correctness::gradient_check::<HostBackend>(&case, 5e-2, &device)?;
    info!(
        "finite differences: input max_abs={:.6}, weight max_abs={:.6}, bias max_abs={:.6} ({})",
        report.input.max_abs,
        report.weight.max_abs,
        report.bias.max_abs,
        if report.within(GRADIENT_MAX_ABS) { "ok" } else { "FAILED" },
    );

    let stats = correctness::compare_with_conv2d::<HostAutodiffBackend>(&case, 1.0, &device)?;
    info!(
        "uniform depth vs conv2d: output max_abs={:.6}, grad_input max_abs={:.6}, grad_weight max_abs={:.6} ({})",
        stats.output.max_abs,
        stats.grad_input.max_abs,
        stats.grad_weight.max_abs,
        if stats.within_defaults() { "ok" } else { "FAILED" },
    );

    if let Some(path) = env::args().nth(1) {
        let reference = DepthConvReference::load(&path, options)?;
        let stats = correctness::run_reference::<HostBackend>(&reference, &device)?;
        info!(
            "reference {path}: output max_abs={:.6}, mse={:.6} ({})",
            stats.output.max_abs,
            stats.output.mse,
            if stats.within_defaults() { "ok" } else { "FAILED" },
        );
    }

    Ok(())
}
