use super::error::DepthConvError;


/// Geometry and depth-gating parameters of a depth-aware convolution.
///
/// Spatial pairs are ordered `[height, width]`. The kernel size is taken
/// from the weight tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct DepthConvOptions {
    pub stride: [usize; 2],
    pub padding: [usize; 2],
    pub dilation: [usize; 2],
    /// Sharpness of the depth-similarity gate, `exp(-alpha * |Δdepth|)`.
    pub alpha: f32,
}

impl Default for DepthConvOptions {
    fn default() -> Self {
        Self::new([1, 1], [0, 0], [1, 1], 1.0)
    }
}

impl DepthConvOptions {
    pub fn new(
        stride: [usize; 2],
        padding: [usize; 2],
        dilation: [usize; 2],
        alpha: f32,
    ) -> Self {
        Self {
            stride,
            padding,
            dilation,
            alpha,
        }
    }

    pub fn with_stride(mut self, stride: [usize; 2]) -> Self {
        self.stride = stride;
        self
    }

    pub fn with_padding(mut self, padding: [usize; 2]) -> Self {
        self.padding = padding;
        self
    }

    pub fn with_dilation(mut self, dilation: [usize; 2]) -> Self {
        self.dilation = dilation;
        self
    }

    pub fn with_alpha(mut self, alpha: f32) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn validate(&self) -> Result<(), DepthConvError> {
        if self.stride.contains(&0) {
            return Err(DepthConvError::parameter(
                "stride",
                format!("must be greater than zero, got {:?}", self.stride),
            ));
        }

        if self.dilation.contains(&0) {
            return Err(DepthConvError::parameter(
                "dilation",
                format!("must be greater than zero, got {:?}", self.dilation),
            ));
        }

        if !self.alpha.is_finite() || self.alpha < 0.0 {
            return Err(DepthConvError::parameter(
                "alpha",
                format!("must be finite and non-negative, got {}", self.alpha),
            ));
        }

        Ok(())
    }
}


fn output_extent(
    axis: &'static str,
    input: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    dilation: usize,
) -> Result<usize, DepthConvError> {
    let receptive = dilation * (kernel - 1) + 1;
    let padded = input + 2 * padding;

    if padded < receptive {
        return Err(DepthConvError::parameter(
            axis,
            format!(
                "padded input extent {padded} is smaller than the dilated kernel extent {receptive}",
            ),
        ));
    }

    Ok((padded - receptive) / stride + 1)
}

/// Output shape `[N, C_out, H_out, W_out]` of a depth-aware convolution.
///
/// `input` is `[N, C_in, H, W]` and `weight` is `[C_out, C_in, K_h, K_w]`.
/// Each spatial axis follows
/// `floor((in + 2 * padding - dilation * (kernel - 1) - 1) / stride) + 1`.
pub fn output_size(
    input: [usize; 4],
    weight: [usize; 4],
    options: &DepthConvOptions,
) -> Result<[usize; 4], DepthConvError> {
    options.validate()?;

    let [batch, in_channels, height, width] = input;
    let [out_channels, weight_channels, kernel_h, kernel_w] = weight;

    if kernel_h == 0 || kernel_w == 0 {
        return Err(DepthConvError::parameter(
            "kernel_size",
            format!("must be greater than zero, got [{kernel_h}, {kernel_w}]"),
        ));
    }

    if weight_channels != in_channels {
        return Err(DepthConvError::shape(
            "weight input channels",
            [in_channels],
            [weight_channels],
        ));
    }

    let out_h = output_extent(
        "height",
        height,
        kernel_h,
        options.stride[0],
        options.padding[0],
        options.dilation[0],
    )?;
    let out_w = output_extent(
        "width",
        width,
        kernel_w,
        options.stride[1],
        options.padding[1],
        options.dilation[1],
    )?;

    Ok([batch, out_channels, out_h, out_w])
}

/// Validates every forward operand and returns the output shape.
pub(crate) fn check_forward(
    input: [usize; 4],
    depth: [usize; 4],
    weight: [usize; 4],
    bias: [usize; 1],
    options: &DepthConvOptions,
) -> Result<[usize; 4], DepthConvError> {
    let [batch, _, height, width] = input;
    let expected_depth = [batch, 1, height, width];

    if depth != expected_depth {
        return Err(DepthConvError::shape("depth", expected_depth, depth));
    }

    let output = output_size(input, weight, options)?;

    if bias[0] != weight[0] {
        return Err(DepthConvError::shape("bias", [weight[0]], bias));
    }

    Ok(output)
}
