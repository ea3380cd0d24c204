use burn::{
    backend::{
        autodiff::{
            checkpoint::{base::Checkpointer, strategy::CheckpointStrategy},
            grads::Gradients,
            ops::{Backward, Ops, OpsKind},
        },
        Autodiff,
    },
    tensor::{ops::FloatTensor, Tensor, TensorPrimitive},
};

use super::{
    AutodiffBackend as DepthConvAutodiffBackend,
    Backend as DepthConvBackend,
    DepthConvBackward,
    DepthConvOptions,
};


#[derive(Debug)]
struct DepthConvBackwardStep;

impl<B: DepthConvBackend> Backward<B, 3> for DepthConvBackwardStep {
    // input, depth, weight, options
    type State = (FloatTensor<B>, FloatTensor<B>, FloatTensor<B>, DepthConvOptions);

    fn backward(
        self,
        ops: Ops<Self::State, 3>,
        grads: &mut Gradients,
        _checkpointer: &mut Checkpointer,
    ) {
        let [node_input, node_weight, node_bias] = ops.parents;
        let grad_output = grads.consume::<B>(&ops.node);
        let (input, depth, weight, options) = ops.state;

        let backward = B::depth_conv_backward(input, depth, weight, grad_output, options);

        if let Some(node) = node_input {
            grads.register::<B>(node.id, backward.x_grad);
        }

        if let Some(node) = node_weight {
            grads.register::<B>(node.id, backward.weight_grad);
        }

        if let Some(node) = node_bias {
            grads.register::<B>(node.id, backward.bias_grad);
        }
    }
}


impl<B: DepthConvBackend, C: CheckpointStrategy> DepthConvBackend for Autodiff<B, C> {
    fn depth_conv(
        input: FloatTensor<Self>,
        depth: FloatTensor<Self>,
        weight: FloatTensor<Self>,
        bias: FloatTensor<Self>,
        options: DepthConvOptions,
    ) -> FloatTensor<Self> {
        // depth gates the taps but is never differentiated
        let depth = depth.primitive;

        match DepthConvBackwardStep
            .prepare::<C>([input.node.clone(), weight.node.clone(), bias.node.clone()])
            .compute_bound()
            .stateful()
        {
            OpsKind::Tracked(prep) => {
                let output = B::depth_conv(
                    input.primitive.clone(),
                    depth.clone(),
                    weight.primitive.clone(),
                    bias.primitive,
                    options.clone(),
                );

                let state = (input.primitive, depth, weight.primitive, options);
                prep.finish(state, output)
            }
            OpsKind::UnTracked(prep) => {
                let output = B::depth_conv(
                    input.primitive,
                    depth,
                    weight.primitive,
                    bias.primitive,
                    options,
                );

                prep.finish(output)
            }
        }
    }

    fn depth_conv_backward(
        input: FloatTensor<Self>,
        depth: FloatTensor<Self>,
        weight: FloatTensor<Self>,
        grad_output: FloatTensor<Self>,
        options: DepthConvOptions,
    ) -> DepthConvBackward<Self> {
        let grads = B::depth_conv_backward(
            inner::<B, C, 4>(input),
            inner::<B, C, 4>(depth),
            inner::<B, C, 4>(weight),
            inner::<B, C, 4>(grad_output),
            options,
        );

        DepthConvBackward {
            x_grad: from_inner::<B, C, 4>(grads.x_grad),
            weight_grad: from_inner::<B, C, 4>(grads.weight_grad),
            bias_grad: from_inner::<B, C, 1>(grads.bias_grad),
        }
    }
}

impl<B: DepthConvBackend, C: CheckpointStrategy> DepthConvAutodiffBackend for Autodiff<B, C> {}


fn inner<B: DepthConvBackend, C: CheckpointStrategy, const D: usize>(
    tensor: FloatTensor<Autodiff<B, C>>,
) -> FloatTensor<B> {
    Tensor::<Autodiff<B, C>, D>::from_primitive(TensorPrimitive::Float(tensor))
        .inner()
        .into_primitive()
        .tensor()
}

fn from_inner<B: DepthConvBackend, C: CheckpointStrategy, const D: usize>(
    tensor: FloatTensor<B>,
) -> FloatTensor<Autodiff<B, C>> {
    Tensor::<Autodiff<B, C>, D>::from_inner(Tensor::from_primitive(TensorPrimitive::Float(tensor)))
        .into_primitive()
        .tensor()
}


#[cfg(all(test, feature = "backend_ndarray"))]
mod tests {
    use approx::assert_relative_eq;
    use burn::{
        backend::{Autodiff, NdArray},
        tensor::{
            module::conv2d,
            ops::ConvOptions,
            Tensor,
            TensorData,
        },
    };

    use crate::kernels::depth_conv::{depth_conv, depth_conv_forward, DepthConvOptions};

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<TestBackend>;

    fn wave<const D: usize>(
        shape: [usize; D],
        phase: f32,
        scale: f32,
    ) -> Tensor<TestAutodiffBackend, D> {
        let len = shape.iter().product();
        let values = (0..len)
            .map(|i| ((i as f32) * 0.37 + phase).sin() * scale)
            .collect::<Vec<f32>>();
        Tensor::from_data(TensorData::new(values, shape), &Default::default())
    }

    fn to_vec<const D: usize>(tensor: Tensor<TestBackend, D>) -> Vec<f32> {
        tensor.into_data().to_vec::<f32>().unwrap()
    }

    fn assert_close(actual: Vec<f32>, expected: Vec<f32>) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected.iter()) {
            assert_relative_eq!(a, e, epsilon = 1e-4, max_relative = 1e-4);
        }
    }

    fn check_uniform_depth_equivalence(options: DepthConvOptions) {
        let _ = env_logger::builder().is_test(true).try_init();
        let device = Default::default();

        let input = wave([2, 3, 9, 8], 0.1, 1.0);
        let weight = wave([4, 3, 3, 3], 0.7, 0.4);
        let bias = wave([4], 1.3, 0.5);
        let depth = Tensor::<TestAutodiffBackend, 4>::full([2, 1, 9, 8], 2.5, &device);

        let depth_input = input.clone().require_grad();
        let depth_weight = weight.clone().require_grad();
        let depth_bias = bias.clone().require_grad();
        let output = depth_conv(
            depth_input.clone(),
            depth,
            depth_weight.clone(),
            depth_bias.clone(),
            options.clone(),
        ).unwrap();

        let conv_input = input.require_grad();
        let conv_weight = weight.require_grad();
        let conv_bias = bias.require_grad();
        let expected = conv2d(
            conv_input.clone(),
            conv_weight.clone(),
            Some(conv_bias.clone()),
            ConvOptions::new(options.stride, options.padding, options.dilation, 1),
        );

        assert_eq!(output.dims(), expected.dims());
        let seed = wave(output.dims(), 2.1, 1.0);

        let grads = (output.clone() * seed.clone()).sum().backward();
        let expected_grads = (expected.clone() * seed).sum().backward();

        assert_close(to_vec(output.inner()), to_vec(expected.inner()));
        assert_close(
            to_vec(depth_input.grad(&grads).unwrap()),
            to_vec(conv_input.grad(&expected_grads).unwrap()),
        );
        assert_close(
            to_vec(depth_weight.grad(&grads).unwrap()),
            to_vec(conv_weight.grad(&expected_grads).unwrap()),
        );
        assert_close(
            to_vec(depth_bias.grad(&grads).unwrap()),
            to_vec(conv_bias.grad(&expected_grads).unwrap()),
        );
    }

    #[test]
    fn uniform_depth_matches_conv2d() {
        check_uniform_depth_equivalence(DepthConvOptions::default().with_alpha(1.0));
    }

    #[test]
    fn uniform_depth_matches_conv2d_strided_padded() {
        check_uniform_depth_equivalence(
            DepthConvOptions::default()
                .with_stride([2, 2])
                .with_padding([1, 1])
                .with_alpha(8.3),
        );
    }

    #[test]
    fn uniform_depth_matches_conv2d_dilated() {
        check_uniform_depth_equivalence(
            DepthConvOptions::default()
                .with_padding([2, 2])
                .with_dilation([2, 2])
                .with_alpha(3.0),
        );
    }

    #[test]
    fn depth_receives_no_gradient() {
        let input = wave([1, 2, 6, 6], 0.0, 1.0).require_grad();
        let depth = wave([1, 1, 6, 6], 0.5, 3.0).require_grad();
        let weight = wave([2, 2, 3, 3], 0.9, 0.5).require_grad();
        let bias = wave([2], 0.2, 1.0).require_grad();

        let output = depth_conv(
            input.clone(),
            depth.clone(),
            weight,
            bias,
            DepthConvOptions::default().with_padding([1, 1]),
        ).unwrap();
        let grads = output.sum().backward();

        assert!(input.grad(&grads).is_some());
        assert!(depth.grad(&grads).is_none());
    }

    #[test]
    fn autodiff_matches_explicit_context() {
        let options = DepthConvOptions::default()
            .with_stride([1, 2])
            .with_padding([1, 1])
            .with_alpha(1.5);

        let input = wave([1, 3, 7, 7], 0.3, 1.0).require_grad();
        let depth = wave([1, 1, 7, 7], 1.7, 2.0);
        let weight = wave([2, 3, 3, 3], 0.1, 0.5).require_grad();
        let bias = wave([2], 0.6, 1.0).require_grad();

        let (output, mut context) = depth_conv_forward(
            input.clone(),
            depth,
            weight.clone(),
            bias.clone(),
            options,
        ).unwrap();
        let seed = wave(output.dims(), 0.8, 1.0);

        let grads = (output * seed.clone()).sum().backward();
        let explicit = context.backward(seed).unwrap();

        assert_close(to_vec(input.grad(&grads).unwrap()), to_vec(explicit.input.inner()));
        assert_close(to_vec(weight.grad(&grads).unwrap()), to_vec(explicit.weight.inner()));
        assert_close(to_vec(bias.grad(&grads).unwrap()), to_vec(explicit.bias.inner()));
    }
}
