use burn::tensor::{ops::FloatTensor, Tensor, TensorData, TensorPrimitive};
use log::debug;

pub mod backward;
pub mod error;
pub mod host;
pub mod options;

#[cfg(feature = "backend_wgpu")]
pub mod jit;
#[cfg(feature = "backend_wgpu")]
pub mod kernel;

pub use error::DepthConvError;
pub use options::{output_size, DepthConvOptions};

use host::ConvGeometry;
use options::check_forward;


/// Gradients produced by [`Backend::depth_conv_backward`].
#[derive(Debug)]
pub struct DepthConvBackward<B: burn::tensor::backend::Backend> {
    pub x_grad: FloatTensor<B>,
    pub weight_grad: FloatTensor<B>,
    pub bias_grad: FloatTensor<B>,
}


/// Backend extension providing the depth-aware convolution primitives.
///
/// Both primitives default to the host implementation in [`host`]: operands
/// are read back, computed on the CPU and uploaded to the operand's device.
/// Operands are assumed to be validated; shape violations panic.
pub trait Backend: burn::tensor::backend::Backend {
    fn depth_conv(
        input: FloatTensor<Self>,   // Input tensor: shape [B, C_in, H, W]
        depth: FloatTensor<Self>,   // Depth tensor: shape [B, 1, H, W]
        weight: FloatTensor<Self>,  // Weight tensor: shape [C_out, C_in, K_h, K_w]
        bias: FloatTensor<Self>,    // Bias tensor: shape [C_out]
        options: DepthConvOptions,
    ) -> FloatTensor<Self> {
        let input = float_tensor::<Self, 4>(input);
        let weight = float_tensor::<Self, 4>(weight);
        let device = input.device();
        let geometry = geometry(input.dims(), weight.dims(), &options);

        debug!("host depth_conv forward {:?} -> {:?}", geometry.input_dims(), geometry.output_dims());

        let output = host::forward(
            &geometry,
            &host_data(input),
            &host_data(float_tensor::<Self, 4>(depth)),
            &host_data(weight),
            &host_data(float_tensor::<Self, 1>(bias)),
            options.alpha,
        );

        upload::<Self, 4>(output, geometry.output_dims(), &device)
    }

    fn depth_conv_backward(
        input: FloatTensor<Self>,        // Input tensor: shape [B, C_in, H, W]
        depth: FloatTensor<Self>,        // Depth tensor: shape [B, 1, H, W]
        weight: FloatTensor<Self>,       // Weight tensor: shape [C_out, C_in, K_h, K_w]
        grad_output: FloatTensor<Self>,  // Output gradient: shape [B, C_out, H_out, W_out]
        options: DepthConvOptions,
    ) -> DepthConvBackward<Self> {
        let input = float_tensor::<Self, 4>(input);
        let weight = float_tensor::<Self, 4>(weight);
        let grad_output = float_tensor::<Self, 4>(grad_output);
        let device = input.device();
        let geometry = geometry(input.dims(), weight.dims(), &options);

        assert_eq!(
            grad_output.dims(),
            geometry.output_dims(),
            "grad_output must match the forward output shape",
        );

        debug!("host depth_conv backward {:?} <- {:?}", geometry.input_dims(), geometry.output_dims());

        let grads = host::backward(
            &geometry,
            &host_data(input),
            &host_data(float_tensor::<Self, 4>(depth)),
            &host_data(weight),
            &host_data(grad_output),
            options.alpha,
        );

        DepthConvBackward {
            x_grad: upload::<Self, 4>(grads.input, geometry.input_dims(), &device),
            weight_grad: upload::<Self, 4>(grads.weight, geometry.weight_dims(), &device),
            bias_grad: upload::<Self, 1>(grads.bias, [geometry.out_channels], &device),
        }
    }
}

pub trait AutodiffBackend: Backend + burn::tensor::backend::AutodiffBackend {}


#[cfg(feature = "backend_ndarray")]
impl Backend for burn::backend::NdArray<f32> {}


fn float_tensor<B: burn::tensor::backend::Backend, const D: usize>(
    primitive: FloatTensor<B>,
) -> Tensor<B, D> {
    Tensor::from_primitive(TensorPrimitive::Float(primitive))
}

fn geometry(input: [usize; 4], weight: [usize; 4], options: &DepthConvOptions) -> ConvGeometry {
    ConvGeometry::new(input, weight, options)
        .unwrap_or_else(|err| panic!("depth_conv called with unchecked operands: {err}"))
}

fn host_data<B: burn::tensor::backend::Backend, const D: usize>(tensor: Tensor<B, D>) -> Vec<f32> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .unwrap_or_else(|err| panic!("depth_conv host readback failed: {err:?}"))
}

fn upload<B: burn::tensor::backend::Backend, const D: usize>(
    values: Vec<f32>,
    shape: [usize; D],
    device: &B::Device,
) -> FloatTensor<B> {
    Tensor::<B, D>::from_data(TensorData::new(values, shape), device)
        .into_primitive()
        .tensor()
}


/// Depth-aware convolution of `input` gated by `depth`.
///
/// Operands are validated before any work is dispatched. Under an autodiff
/// backend the result tracks gradients for `input`, `weight` and `bias`;
/// `depth` never receives a gradient.
pub fn depth_conv<B: Backend>(
    input: Tensor<B, 4>,
    depth: Tensor<B, 4>,
    weight: Tensor<B, 4>,
    bias: Tensor<B, 1>,
    options: DepthConvOptions,
) -> Result<Tensor<B, 4>, DepthConvError> {
    check_forward(input.dims(), depth.dims(), weight.dims(), bias.dims(), &options)?;

    let output = B::depth_conv(
        input.into_primitive().tensor(),
        depth.into_primitive().tensor(),
        weight.into_primitive().tensor(),
        bias.into_primitive().tensor(),
        options,
    );

    Ok(Tensor::from_primitive(TensorPrimitive::Float(output)))
}

/// Runs the forward pass and returns the output together with the context
/// required by the paired [`DepthConvContext::backward`] call.
pub fn depth_conv_forward<B: Backend>(
    input: Tensor<B, 4>,
    depth: Tensor<B, 4>,
    weight: Tensor<B, 4>,
    bias: Tensor<B, 1>,
    options: DepthConvOptions,
) -> Result<(Tensor<B, 4>, DepthConvContext<B>), DepthConvError> {
    let output_dims = check_forward(input.dims(), depth.dims(), weight.dims(), bias.dims(), &options)?;

    let output = B::depth_conv(
        input.clone().into_primitive().tensor(),
        depth.clone().into_primitive().tensor(),
        weight.clone().into_primitive().tensor(),
        bias.into_primitive().tensor(),
        options.clone(),
    );

    let context = DepthConvContext {
        saved: Some(SavedForward {
            input,
            depth,
            weight,
            options,
            output_dims,
        }),
    };

    Ok((Tensor::from_primitive(TensorPrimitive::Float(output)), context))
}


#[derive(Debug, Clone)]
struct SavedForward<B: Backend> {
    input: Tensor<B, 4>,
    depth: Tensor<B, 4>,
    weight: Tensor<B, 4>,
    options: DepthConvOptions,
    output_dims: [usize; 4],
}

/// Forward operands saved for exactly one backward call. The bias is not
/// retained, its gradient only depends on `grad_output`.
#[derive(Debug, Clone)]
pub struct DepthConvContext<B: Backend> {
    saved: Option<SavedForward<B>>,
}

impl<B: Backend> Default for DepthConvContext<B> {
    fn default() -> Self {
        Self { saved: None }
    }
}

#[derive(Debug, Clone)]
pub struct DepthConvGradients<B: Backend> {
    pub input: Tensor<B, 4>,
    pub weight: Tensor<B, 4>,
    pub bias: Tensor<B, 1>,
}

impl<B: Backend> DepthConvContext<B> {
    pub fn is_saved(&self) -> bool {
        self.saved.is_some()
    }

    pub fn options(&self) -> Option<&DepthConvOptions> {
        self.saved.as_ref().map(|saved| &saved.options)
    }

    pub fn output_dims(&self) -> Option<[usize; 4]> {
        self.saved.as_ref().map(|saved| saved.output_dims)
    }

    /// Consumes the saved forward state. A second call fails with
    /// [`DepthConvError::MissingContext`].
    pub fn backward(
        &mut self,
        grad_output: Tensor<B, 4>,
    ) -> Result<DepthConvGradients<B>, DepthConvError> {
        let output_dims = self.output_dims().ok_or(DepthConvError::MissingContext)?;

        if grad_output.dims() != output_dims {
            return Err(DepthConvError::shape("grad_output", output_dims, grad_output.dims()));
        }

        let SavedForward {
            input,
            depth,
            weight,
            options,
            ..
        } = self.saved.take().ok_or(DepthConvError::MissingContext)?;

        debug!("depth_conv backward with {options:?}");

        let grads = B::depth_conv_backward(
            input.into_primitive().tensor(),
            depth.into_primitive().tensor(),
            weight.into_primitive().tensor(),
            grad_output.into_primitive().tensor(),
            options,
        );

        Ok(DepthConvGradients {
            input: Tensor::from_primitive(TensorPrimitive::Float(grads.x_grad)),
            weight: Tensor::from_primitive(TensorPrimitive::Float(grads.weight_grad)),
            bias: Tensor::from_primitive(TensorPrimitive::Float(grads.bias_grad)),
        })
    }
}
