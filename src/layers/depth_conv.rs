use burn::{
    prelude::*,
    module::Param,
    nn::Initializer,
};

use crate::kernels::depth_conv::{
    depth_conv,
    Backend,
    DepthConvError,
    DepthConvOptions,
};


#[derive(Config, Debug)]
pub struct DepthConv2dConfig {
    /// `[in_channels, out_channels]`.
    pub channels: [usize; 2],
    pub kernel_size: [usize; 2],
    #[config(default = "[1, 1]")]
    pub stride: [usize; 2],
    #[config(default = "[0, 0]")]
    pub padding: [usize; 2],
    #[config(default = "[1, 1]")]
    pub dilation: [usize; 2],
    #[config(default = 8.3)]
    pub alpha: f32,
    #[config(default = true)]
    pub bias: bool,
    #[config(
        default = "Initializer::KaimingUniform{gain:1.0/3.0f64.sqrt(), fan_out_only:false}"
    )]
    pub initializer: Initializer,
}

impl Default for DepthConv2dConfig {
    fn default() -> Self {
        Self::new([3, 64], [3, 3])
    }
}

impl DepthConv2dConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> DepthConv2d<B> {
        DepthConv2d::new(device, self)
    }

    pub fn options(&self) -> DepthConvOptions {
        DepthConvOptions::new(self.stride, self.padding, self.dilation, self.alpha)
    }
}


/// Convolution whose taps are gated by depth similarity to the kernel center.
#[derive(Module, Debug)]
pub struct DepthConv2d<B: Backend> {
    pub weight: Param<Tensor<B, 4>>,
    pub bias: Option<Param<Tensor<B, 1>>>,
    stride: [usize; 2],
    padding: [usize; 2],
    dilation: [usize; 2],
    alpha: f32,
}

impl<B: Backend> DepthConv2d<B> {
    pub fn new(
        device: &B::Device,
        config: &DepthConv2dConfig,
    ) -> Self {
        let [in_channels, out_channels] = config.channels;
        let [kernel_h, kernel_w] = config.kernel_size;

        let fan_in = in_channels * kernel_h * kernel_w;
        let fan_out = out_channels * kernel_h * kernel_w;

        let weight = config.initializer.init_with(
            [out_channels, in_channels, kernel_h, kernel_w],
            Some(fan_in),
            Some(fan_out),
            device,
        );

        let bias = config.bias.then(|| {
            config.initializer.init_with(
                [out_channels],
                Some(fan_in),
                Some(fan_out),
                device,
            )
        });

        Self {
            weight,
            bias,
            stride: config.stride,
            padding: config.padding,
            dilation: config.dilation,
            alpha: config.alpha,
        }
    }

    pub fn options(&self) -> DepthConvOptions {
        DepthConvOptions::new(self.stride, self.padding, self.dilation, self.alpha)
    }

    pub fn out_channels(&self) -> usize {
        self.weight.shape().dims[0]
    }

    pub fn forward(
        &self,
        input: Tensor<B, 4>,
        depth: Tensor<B, 4>,
    ) -> Result<Tensor<B, 4>, DepthConvError> {
        let bias = match &self.bias {
            Some(bias) => bias.val(),
            None => Tensor::zeros([self.out_channels()], &input.device()),
        };

        depth_conv(input, depth, self.weight.val(), bias, self.options())
    }
}


#[cfg(all(test, feature = "backend_ndarray"))]
mod tests {
    use burn::{
        backend::{Autodiff, NdArray},
        tensor::TensorData,
    };

    use super::*;

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<TestBackend>;

    #[test]
    fn depth_conv2d_output_shape() {
        let device = Default::default();
        let layer = DepthConv2dConfig::new([3, 8], [3, 3])
            .with_padding([1, 1])
            .with_stride([2, 2])
            .init::<TestBackend>(&device);

        let input = Tensor::<TestBackend, 4>::ones([2, 3, 10, 12], &device);
        let depth = Tensor::<TestBackend, 4>::ones([2, 1, 10, 12], &device);
        let output = layer.forward(input, depth).unwrap();

        assert_eq!(output.dims(), [2, 8, 5, 6]);
    }

    #[test]
    fn depth_conv2d_rejects_mismatched_depth() {
        let device = Default::default();
        let layer = DepthConv2dConfig::new([3, 4], [3, 3]).init::<TestBackend>(&device);

        let input = Tensor::<TestBackend, 4>::ones([1, 3, 8, 8], &device);
        let depth = Tensor::<TestBackend, 4>::ones([1, 1, 4, 4], &device);

        assert!(matches!(
            layer.forward(input, depth),
            Err(DepthConvError::ShapeMismatch { what: "depth", .. })
        ));
    }

    #[test]
    fn depth_conv2d_without_bias() {
        let device = Default::default();
        let layer = DepthConv2dConfig::new([1, 2], [3, 3])
            .with_bias(false)
            .with_padding([1, 1])
            .init::<TestBackend>(&device);
        assert!(layer.bias.is_none());

        let input = Tensor::<TestBackend, 4>::zeros([1, 1, 5, 5], &device);
        let depth = Tensor::<TestBackend, 4>::ones([1, 1, 5, 5], &device);
        let output = layer.forward(input, depth).unwrap();

        let max = output.abs().max().into_scalar();
        assert_eq!(max, 0.0);
    }

    #[test]
    fn depth_conv2d_parameters_receive_gradients() {
        let device = Default::default();
        let layer = DepthConv2dConfig::new([2, 3], [3, 3])
            .with_padding([1, 1])
            .with_alpha(2.0)
            .init::<TestAutodiffBackend>(&device);

        let input = Tensor::<TestAutodiffBackend, 4>::ones([1, 2, 6, 6], &device);
        let depth = Tensor::<TestAutodiffBackend, 4>::from_data(
            TensorData::new(
                (0..36).map(|i| (i % 6) as f32 * 0.25).collect::<Vec<f32>>(),
                [1, 1, 6, 6],
            ),
            &device,
        );

        let grads = layer.forward(input, depth).unwrap().sum().backward();

        let weight_grad = layer.weight.val().grad(&grads).unwrap();
        assert_eq!(weight_grad.dims(), [3, 2, 3, 3]);

        let bias_grad = layer.bias.as_ref().unwrap().val().grad(&grads).unwrap();
        let bias_grad = bias_grad.into_data().to_vec::<f32>().unwrap();
        assert_eq!(bias_grad, vec![36.0; 3]);
    }

    #[test]
    fn depth_conv2d_record_roundtrip() {
        let device = Default::default();
        let config = DepthConv2dConfig::new([3, 4], [3, 3]);
        let layer = config.init::<TestBackend>(&device);

        let record = layer.clone().into_record();
        let loaded = config.init::<TestBackend>(&device).load_record(record);

        let expected = layer.weight.val().into_data().to_vec::<f32>().unwrap();
        let actual = loaded.weight.val().into_data().to_vec::<f32>().unwrap();
        assert_eq!(actual, expected);
        assert_eq!(loaded.options(), config.options());
    }
}
