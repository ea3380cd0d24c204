pub mod correctness;
pub mod kernels;
pub mod layers;

pub use kernels::depth_conv::{
    depth_conv,
    depth_conv_forward,
    output_size,
    DepthConvContext,
    DepthConvError,
    DepthConvGradients,
    DepthConvOptions,
};

#[cfg(test)]
mod tests {
    use super::*;
    use burn::prelude::*;

    #[cfg(feature = "backend_ndarray")]
    type NdArrayBackend = burn::backend::NdArray<f32>;

    #[cfg(feature = "backend_ndarray")]
    fn operands(
        device: &<NdArrayBackend as Backend>::Device,
    ) -> (
        Tensor<NdArrayBackend, 4>,
        Tensor<NdArrayBackend, 4>,
        Tensor<NdArrayBackend, 4>,
        Tensor<NdArrayBackend, 1>,
    ) {
        (
            Tensor::ones([1, 3, 8, 8], device),
            Tensor::ones([1, 1, 8, 8], device),
            Tensor::ones([2, 3, 3, 3], device),
            Tensor::zeros([2], device),
        )
    }

    #[test]
    #[cfg(feature = "backend_ndarray")]
    fn empty_context_is_missing() {
        let device = <NdArrayBackend as Backend>::Device::default();
        let mut context = DepthConvContext::<NdArrayBackend>::default();
        assert!(!context.is_saved());

        let grad_output = Tensor::<NdArrayBackend, 4>::ones([1, 2, 6, 6], &device);
        assert!(matches!(
            context.backward(grad_output),
            Err(DepthConvError::MissingContext)
        ));
    }

    #[test]
    #[cfg(feature = "backend_ndarray")]
    fn context_is_consumed_by_backward() {
        let device = <NdArrayBackend as Backend>::Device::default();
        let (input, depth, weight, bias) = operands(&device);

        let (output, mut context) =
            depth_conv_forward(input, depth, weight, bias, DepthConvOptions::default()).unwrap();
        assert_eq!(context.output_dims(), Some([1, 2, 6, 6]));

        let grads = context.backward(Tensor::ones_like(&output)).unwrap();
        assert_eq!(grads.input.dims(), [1, 3, 8, 8]);
        assert_eq!(grads.weight.dims(), [2, 3, 3, 3]);
        assert_eq!(grads.bias.dims(), [2]);
        assert!(!context.is_saved());

        assert!(matches!(
            context.backward(Tensor::ones_like(&output)),
            Err(DepthConvError::MissingContext)
        ));
    }

    #[test]
    #[cfg(feature = "backend_ndarray")]
    fn backward_rejects_mismatched_grad_output() {
        let device = <NdArrayBackend as Backend>::Device::default();
        let (input, depth, weight, bias) = operands(&device);

        let (_, mut context) =
            depth_conv_forward(input, depth, weight, bias, DepthConvOptions::default()).unwrap();

        let grad_output = Tensor::<NdArrayBackend, 4>::ones([1, 2, 5, 6], &device);
        assert!(matches!(
            context.backward(grad_output),
            Err(DepthConvError::ShapeMismatch { what: "grad_output", .. })
        ));
        // a rejected call leaves the saved state in place
        assert!(context.is_saved());
    }

    #[test]
    #[cfg(feature = "backend_ndarray")]
    fn forward_rejects_mismatched_depth() {
        let device = <NdArrayBackend as Backend>::Device::default();
        let (input, _, weight, bias) = operands(&device);
        let depth = Tensor::<NdArrayBackend, 4>::ones([1, 1, 8, 6], &device);

        let result = depth_conv(input, depth, weight, bias, DepthConvOptions::default());
        assert!(matches!(
            result,
            Err(DepthConvError::ShapeMismatch { what: "depth", .. })
        ));
    }

    #[test]
    #[cfg(feature = "backend_ndarray")]
    fn forward_rejects_negative_alpha() {
        let device = <NdArrayBackend as Backend>::Device::default();
        let (input, depth, weight, bias) = operands(&device);

        let options = DepthConvOptions::default().with_alpha(-1.0);
        let result = depth_conv(input, depth, weight, bias, options);
        assert!(matches!(
            result,
            Err(DepthConvError::InvalidParameter { name: "alpha", .. })
        ));
    }
}
