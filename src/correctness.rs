//! Correctness harness for the depth-aware convolution.
//!
//! Three checks are provided: equivalence with `conv2d` under a uniform depth
//! map, central finite differences against the analytic backward pass, and
//! comparison with reference tensors stored as safetensors.
use std::{fs, path::Path};

use burn::{
    prelude::*,
    tensor::{module::conv2d, ops::ConvOptions},
};
use log::debug;
use safetensors::tensor::{Dtype, SafeTensors, TensorView};
use thiserror::Error;

use crate::kernels::depth_conv::{
    depth_conv,
    depth_conv_forward,
    output_size,
    AutodiffBackend,
    Backend,
    DepthConvError,
    DepthConvOptions,
};


pub const FORWARD_MAX_ABS: f32 = 1e-4;
pub const FORWARD_MAX_REL: f32 = 1e-4;
pub const GRADIENT_MAX_ABS: f32 = 1e-3;


/// Host-side operands of one depth-aware convolution call.
#[derive(Debug, Clone)]
pub struct ConvCase {
    pub input: Vec<f32>,
    pub input_shape: [usize; 4],
    pub depth: Vec<f32>,
    pub weight: Vec<f32>,
    pub weight_shape: [usize; 4],
    pub bias: Vec<f32>,
    /// Upstream gradient used as `grad_output`, shaped like the output.
    pub grad_output: Vec<f32>,
    pub output_shape: [usize; 4],
    pub options: DepthConvOptions,
}

fn wave(len: usize, phase: f32, scale: f32) -> Vec<f32> {
    (0..len)
        .map(|i| ((i as f32) * 0.37 + phase).sin() * scale)
        .collect()
}

impl ConvCase {
    /// Deterministic operands with a non-uniform depth map.
    pub fn synthetic(
        input_shape: [usize; 4],
        weight_shape: [usize; 4],
        options: DepthConvOptions,
    ) -> Result<Self, CorrectnessError> {
        let output_shape = output_size(input_shape, weight_shape, &options)?;
        let [batch, _, height, width] = input_shape;

        Ok(Self {
            input: wave(input_shape.iter().product(), 0.1, 1.0),
            input_shape,
            depth: wave(batch * height * width, 1.9, 1.5)
                .into_iter()
                .map(|d| d + 2.0)
                .collect(),
            weight: wave(weight_shape.iter().product(), 0.7, 0.4),
            weight_shape,
            bias: wave(weight_shape[0], 1.3, 0.5),
            grad_output: wave(output_shape.iter().product(), 2.3, 1.0),
            output_shape,
            options,
        })
    }

    pub fn with_uniform_depth(mut self, value: f32) -> Self {
        self.depth.iter_mut().for_each(|d| *d = value);
        self
    }

    pub fn depth_shape(&self) -> [usize; 4] {
        let [batch, _, height, width] = self.input_shape;
        [batch, 1, height, width]
    }

    fn check(&self) -> Result<(), CorrectnessError> {
        let lengths = [
            ("input", self.input.len(), self.input_shape.iter().product::<usize>()),
            ("depth", self.depth.len(), self.depth_shape().iter().product::<usize>()),
            ("weight", self.weight.len(), self.weight_shape.iter().product::<usize>()),
            ("bias", self.bias.len(), self.weight_shape[0]),
            ("grad_output", self.grad_output.len(), self.output_shape.iter().product::<usize>()),
        ];

        for (tensor, actual, expected) in lengths {
            if actual != expected {
                return Err(CorrectnessError::LengthMismatch {
                    tensor,
                    expected,
                    actual,
                });
            }
        }

        Ok(())
    }
}


#[derive(Debug, Clone)]
pub struct CaseOutputs {
    pub output: Vec<f32>,
    pub grad_input: Vec<f32>,
    pub grad_weight: Vec<f32>,
    pub grad_bias: Vec<f32>,
}

/// Runs forward and the paired backward through the explicit context.
pub fn run_case<B: Backend>(
    case: &ConvCase,
    device: &B::Device,
) -> Result<CaseOutputs, CorrectnessError> {
    case.check()?;

    let (output, mut context) = depth_conv_forward(
        upload::<B, 4>(&case.input, case.input_shape, device),
        upload::<B, 4>(&case.depth, case.depth_shape(), device),
        upload::<B, 4>(&case.weight, case.weight_shape, device),
        upload::<B, 1>(&case.bias, [case.bias.len()], device),
        case.options.clone(),
    )?;

    let grads = context.backward(upload::<B, 4>(&case.grad_output, case.output_shape, device))?;

    Ok(CaseOutputs {
        output: tensor_to_vec(output)?,
        grad_input: tensor_to_vec(grads.input)?,
        grad_weight: tensor_to_vec(grads.weight)?,
        grad_bias: tensor_to_vec(grads.bias)?,
    })
}


#[derive(Debug, Clone)]
pub struct MetricStats {
    pub mean_abs: f32,
    pub max_abs: f32,
    pub max_rel: f32,
    pub mse: f32,
}

impl MetricStats {
    /// Every element is within `max_abs` absolute error, or every element is
    /// within `max_rel` relative error.
    pub fn within(&self, max_abs: f32, max_rel: f32) -> bool {
        self.max_abs <= max_abs || self.max_rel <= max_rel
    }
}

#[derive(Debug, Clone)]
pub struct EquivalenceStats {
    pub output: MetricStats,
    pub grad_input: MetricStats,
    pub grad_weight: MetricStats,
    pub grad_bias: MetricStats,
}

impl EquivalenceStats {
    pub fn within_defaults(&self) -> bool {
        self.output.within(FORWARD_MAX_ABS, FORWARD_MAX_REL)
            && self.grad_input.within(FORWARD_MAX_ABS, FORWARD_MAX_REL)
            && self.grad_weight.within(FORWARD_MAX_ABS, FORWARD_MAX_REL)
            && self.grad_bias.within(FORWARD_MAX_ABS, FORWARD_MAX_REL)
    }

    fn compare(actual: &CaseOutputs, expected: &CaseOutputs) -> Self {
        Self {
            output: compute_stats(&actual.output, &expected.output),
            grad_input: compute_stats(&actual.grad_input, &expected.grad_input),
            grad_weight: compute_stats(&actual.grad_weight, &expected.grad_weight),
            grad_bias: compute_stats(&actual.grad_bias, &expected.grad_bias),
        }
    }
}

/// Compares the operator against `conv2d` after replacing the case's depth
/// map by a constant one, where both must agree.
pub fn compare_with_conv2d<B: AutodiffBackend>(
    case: &ConvCase,
    depth_value: f32,
    device: &B::Device,
) -> Result<EquivalenceStats, CorrectnessError> {
    let case = case.clone().with_uniform_depth(depth_value);
    let depth_outputs = run_case::<B>(&case, device)?;

    let input = upload::<B, 4>(&case.input, case.input_shape, device).require_grad();
    let weight = upload::<B, 4>(&case.weight, case.weight_shape, device).require_grad();
    let bias = upload::<B, 1>(&case.bias, [case.bias.len()], device).require_grad();
    let seed = upload::<B, 4>(&case.grad_output, case.output_shape, device);

    let output = conv2d(
        input.clone(),
        weight.clone(),
        Some(bias.clone()),
        ConvOptions::new(case.options.stride, case.options.padding, case.options.dilation, 1),
    );
    let grads = (output.clone() * seed).sum().backward();

    let conv_outputs = CaseOutputs {
        output: tensor_to_vec(output)?,
        grad_input: tensor_to_vec(input.grad(&grads).ok_or(CorrectnessError::MissingTensor("grad_input"))?)?,
        grad_weight: tensor_to_vec(weight.grad(&grads).ok_or(CorrectnessError::MissingTensor("grad_weight"))?)?,
        grad_bias: tensor_to_vec(bias.grad(&grads).ok_or(CorrectnessError::MissingTensor("grad_bias"))?)?,
    };

    let stats = EquivalenceStats::compare(&depth_outputs, &conv_outputs);
    debug!("uniform depth vs conv2d: {stats:?}");

    Ok(stats)
}


#[derive(Debug, Clone)]
pub struct GradientCheckReport {
    pub input: MetricStats,
    pub weight: MetricStats,
    pub bias: MetricStats,
}

impl GradientCheckReport {
    pub fn within(&self, max_abs: f32) -> bool {
        self.input.max_abs <= max_abs
            && self.weight.max_abs <= max_abs
            && self.bias.max_abs <= max_abs
    }
}

/// Central finite differences of `sum(output * grad_output)` against the
/// analytic gradients. Depth is held fixed.
pub fn gradient_check<B: Backend>(
    case: &ConvCase,
    epsilon: f32,
    device: &B::Device,
) -> Result<GradientCheckReport, CorrectnessError> {
    let analytic = run_case::<B>(case, device)?;

    let numeric_input = central_difference(&case.input, epsilon, |input| {
        objective::<B>(case, input, &case.weight, &case.bias, device)
    })?;
    let numeric_weight = central_difference(&case.weight, epsilon, |weight| {
        objective::<B>(case, &case.input, weight, &case.bias, device)
    })?;
    let numeric_bias = central_difference(&case.bias, epsilon, |bias| {
        objective::<B>(case, &case.input, &case.weight, bias, device)
    })?;

    let report = GradientCheckReport {
        input: compute_stats(&analytic.grad_input, &numeric_input),
        weight: compute_stats(&analytic.grad_weight, &numeric_weight),
        bias: compute_stats(&analytic.grad_bias, &numeric_bias),
    };
    debug!("gradient check: {report:?}");

    Ok(report)
}


fn objective<B: Backend>(
    case: &ConvCase,
    input: &[f32],
    weight: &[f32],
    bias: &[f32],
    device: &B::Device,
) -> Result<f64, CorrectnessError> {
    let output = depth_conv(
        upload::<B, 4>(input, case.input_shape, device),
        upload::<B, 4>(&case.depth, case.depth_shape(), device),
        upload::<B, 4>(weight, case.weight_shape, device),
        upload::<B, 1>(bias, [bias.len()], device),
        case.options.clone(),
    )?;

    Ok(tensor_to_vec(output)?
        .iter()
        .zip(case.grad_output.iter())
        .map(|(&out, &seed)| out as f64 * seed as f64)
        .sum())
}

fn central_difference(
    values: &[f32],
    epsilon: f32,
    mut evaluate: impl FnMut(&[f32]) -> Result<f64, CorrectnessError>,
) -> Result<Vec<f32>, CorrectnessError> {
    let mut perturbed = values.to_vec();
    let mut numeric = Vec::with_capacity(values.len());

    for index in 0..values.len() {
        perturbed[index] = values[index] + epsilon;
        let plus = evaluate(&perturbed)?;
        perturbed[index] = values[index] - epsilon;
        let minus = evaluate(&perturbed)?;
        perturbed[index] = values[index];

        numeric.push(((plus - minus) / (2.0 * epsilon as f64)) as f32);
    }

    Ok(numeric)
}


/// Operands and expected results exported from another implementation.
#[derive(Debug)]
pub struct DepthConvReference {
    pub case: ConvCase,
    pub expected: CaseOutputs,
}

impl DepthConvReference {
    pub fn load(
        path: impl AsRef<Path>,
        options: DepthConvOptions,
    ) -> Result<Self, CorrectnessError> {
        let bytes = fs::read(path.as_ref())?;
        Self::from_bytes(&bytes, options)
    }

    /// Expects f32 tensors `input`, `depth`, `weight`, `bias`, `grad_output`,
    /// `output`, `grad_input`, `grad_weight` and `grad_bias`.
    pub fn from_bytes(
        bytes: &[u8],
        options: DepthConvOptions,
    ) -> Result<Self, CorrectnessError> {
        let tensors = SafeTensors::deserialize(bytes)?;

        let (input, input_shape) = read_tensor::<4>(&tensors, "input")?;
        let (depth, _) = read_tensor::<4>(&tensors, "depth")?;
        let (weight, weight_shape) = read_tensor::<4>(&tensors, "weight")?;
        let (bias, _) = read_tensor::<1>(&tensors, "bias")?;
        let (grad_output, output_shape) = read_tensor::<4>(&tensors, "grad_output")?;

        let case = ConvCase {
            input,
            input_shape,
            depth,
            weight,
            weight_shape,
            bias,
            grad_output,
            output_shape,
            options,
        };
        case.check()?;

        let expected = CaseOutputs {
            output: read_tensor::<4>(&tensors, "output")?.0,
            grad_input: read_tensor::<4>(&tensors, "grad_input")?.0,
            grad_weight: read_tensor::<4>(&tensors, "grad_weight")?.0,
            grad_bias: read_tensor::<1>(&tensors, "grad_bias")?.0,
        };

        Ok(Self { case, expected })
    }
}

pub fn run_reference<B: Backend>(
    reference: &DepthConvReference,
    device: &B::Device,
) -> Result<EquivalenceStats, CorrectnessError> {
    let actual = run_case::<B>(&reference.case, device)?;

    let lengths = [
        ("output", actual.output.len(), reference.expected.output.len()),
        ("grad_input", actual.grad_input.len(), reference.expected.grad_input.len()),
        ("grad_weight", actual.grad_weight.len(), reference.expected.grad_weight.len()),
        ("grad_bias", actual.grad_bias.len(), reference.expected.grad_bias.len()),
    ];
    for (tensor, actual, expected) in lengths {
        if actual != expected {
            return Err(CorrectnessError::LengthMismatch {
                tensor,
                expected,
                actual,
            });
        }
    }

    Ok(EquivalenceStats::compare(&actual, &reference.expected))
}


pub fn compute_stats(actual: &[f32], expected: &[f32]) -> MetricStats {
    let mut sum_abs = 0.0f32;
    let mut max_abs = 0.0f32;
    let mut max_rel = 0.0f32;
    let mut mse = 0.0f32;

    for (&lhs, &rhs) in actual.iter().zip(expected.iter()) {
        let diff = lhs - rhs;
        let abs = diff.abs();
        sum_abs += abs;
        max_abs = max_abs.max(abs);
        // an error on an element expected to be zero is unbounded relative error
        if abs > 0.0 {
            max_rel = max_rel.max(abs / rhs.abs());
        }
        mse += diff.powi(2);
    }

    let len = actual.len().max(1) as f32;
    MetricStats {
        mean_abs: sum_abs / len,
        max_abs,
        max_rel,
        mse: mse / len,
    }
}

fn read_tensor<const D: usize>(
    tensors: &SafeTensors<'_>,
    name: &'static str,
) -> Result<(Vec<f32>, [usize; D]), CorrectnessError> {
    let view = tensors
        .tensor(name)
        .map_err(|_| CorrectnessError::MissingTensor(name))?;

    if view.dtype() != Dtype::F32 {
        return Err(CorrectnessError::UnsupportedDtype {
            tensor: name,
            dtype: format!("{:?}", view.dtype()),
        });
    }

    let shape: [usize; D] =
        view.shape()
            .try_into()
            .map_err(|_| CorrectnessError::UnexpectedRank {
                tensor: name,
                expected: D,
                actual: view.shape().len(),
            })?;

    Ok((tensor_view_to_vec(&view), shape))
}

fn tensor_view_to_vec(view: &TensorView<'_>) -> Vec<f32> {
    view.data()
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn upload<B: Backend, const D: usize>(
    values: &[f32],
    shape: [usize; D],
    device: &B::Device,
) -> Tensor<B, D> {
    Tensor::from_data(TensorData::new(values.to_vec(), shape), device)
}

fn tensor_to_vec<B: burn::tensor::backend::Backend, const D: usize>(
    tensor: Tensor<B, D>,
) -> Result<Vec<f32>, CorrectnessError> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|err| CorrectnessError::TensorData(format!("{err:?}")))
}


#[derive(Debug, Error)]
pub enum CorrectnessError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    #[error("tensor `{0}` missing from reference")]
    MissingTensor(&'static str),

    #[error("tensor `{tensor}` has unsupported dtype {dtype}, expected F32")]
    UnsupportedDtype {
        tensor: &'static str,
        dtype: String,
    },

    #[error("tensor `{tensor}` rank mismatch: expected {expected}, got {actual}")]
    UnexpectedRank {
        tensor: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("tensor `{tensor}` length mismatch: expected {expected}, got {actual}")]
    LengthMismatch {
        tensor: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("tensor serialization error: {0}")]
    TensorData(String),

    #[error(transparent)]
    DepthConv(#[from] DepthConvError),
}
