use cubecl::{
    prelude::*,
    cube,
};


/// Convolution geometry shared by every depth_conv kernel.
#[derive(CubeLaunch)]
pub struct DepthConvArgs {
    pub stride_h: u32,
    pub stride_w: u32,
    pub padding_h: u32,
    pub padding_w: u32,
    pub dilation_h: u32,
    pub dilation_w: u32,
}


#[cube]
pub fn similarity<F: Float>(center: F, sample: F, alpha: F) -> F {
    F::exp(F::new(0.0) - alpha * F::abs(center - sample))
}

/// Input row/column of the receptive-field center, clamped into the image.
#[cube]
fn center_position(
    out_pos: u32,
    kernel: u32,
    stride: u32,
    padding: u32,
    dilation: u32,
    extent: u32,
) -> u32 {
    let mut pos = out_pos * stride + ((kernel - 1) / 2) * dilation;

    if pos < padding {
        pos = padding;
    }
    pos -= padding;

    if pos >= extent {
        pos = extent - 1;
    }

    pos
}


#[cube(launch)]
pub fn depth_conv_forward_kernel<F: Float>(
    input: &Tensor<F>,      // Input tensor: shape [B, C_in, H, W]
    depth: &Tensor<F>,      // Depth tensor: shape [B, 1, H, W]
    weight: &Tensor<F>,     // Weight tensor: shape [C_out, C_in, K_h, K_w]
    bias: &Tensor<F>,       // Bias tensor: shape [C_out]
    output: &mut Tensor<F>, // Output tensor: shape [B, C_out, H_out, W_out]
    args: DepthConvArgs,
    alpha: F,
) {
    let stride_h = args.stride_h;
    let stride_w = args.stride_w;
    let padding_h = args.padding_h;
    let padding_w = args.padding_w;
    let dilation_h = args.dilation_h;
    let dilation_w = args.dilation_w;

    let oy = ABSOLUTE_POS_X;
    let ox = ABSOLUTE_POS_Y;
    let batch = ABSOLUTE_POS_Z;

    let B = output.shape(0);
    let C_out = output.shape(1);
    let H_out = output.shape(2);
    let W_out = output.shape(3);

    if batch >= B || oy >= H_out || ox >= W_out {
        return;
    }

    let C_in = input.shape(1);
    let H = input.shape(2);
    let W = input.shape(3);
    let K_h = weight.shape(2);
    let K_w = weight.shape(3);

    let depth_base = batch * depth.stride(0);
    let center_y = center_position(oy, K_h, stride_h, padding_h, dilation_h, H);
    let center_x = center_position(ox, K_w, stride_w, padding_w, dilation_w, W);
    let center = depth[depth_base + center_y * depth.stride(2) + center_x * depth.stride(3)];

    for co in 0..C_out {
        let mut output_val = bias[co * bias.stride(0)];

        for ky in 0..K_h {
            let iy = oy * stride_h + ky * dilation_h;

            if iy >= padding_h && iy - padding_h < H {
                let iy = iy - padding_h;

                for kx in 0..K_w {
                    let ix = ox * stride_w + kx * dilation_w;

                    if ix >= padding_w && ix - padding_w < W {
                        let ix = ix - padding_w;
                        let sample = depth[depth_base + iy * depth.stride(2) + ix * depth.stride(3)];
                        let gate = similarity::<F>(center, sample, alpha);

                        for ci in 0..C_in {
                            let idx_input = batch * input.stride(0)
                                            + ci * input.stride(1)
                                            + iy * input.stride(2)
                                            + ix * input.stride(3);

                            let idx_weight = co * weight.stride(0)
                                            + ci * weight.stride(1)
                                            + ky * weight.stride(2)
                                            + kx * weight.stride(3);

                            output_val += weight[idx_weight] * input[idx_input] * gate;
                        }
                    }
                }
            }
        }

        let idx_output = batch * output.stride(0)
                        + co * output.stride(1)
                        + oy * output.stride(2)
                        + ox * output.stride(3);

        output[idx_output] = output_val;
    }
}


/// One thread per input pixel. Iterates the output positions whose taps
/// sample that pixel, so no two threads write the same cell.
#[cube(launch)]
pub fn depth_conv_grad_input_kernel<F: Float>(
    depth: &Tensor<F>,          // Depth tensor: shape [B, 1, H, W]
    weight: &Tensor<F>,         // Weight tensor: shape [C_out, C_in, K_h, K_w]
    grad_output: &Tensor<F>,    // Output gradient: shape [B, C_out, H_out, W_out]
    grad_input: &mut Tensor<F>, // Input gradient: shape [B, C_in, H, W]
    args: DepthConvArgs,
    alpha: F,
) {
    let stride_h = args.stride_h;
    let stride_w = args.stride_w;
    let padding_h = args.padding_h;
    let padding_w = args.padding_w;
    let dilation_h = args.dilation_h;
    let dilation_w = args.dilation_w;

    let iy = ABSOLUTE_POS_X;
    let ix = ABSOLUTE_POS_Y;
    let batch = ABSOLUTE_POS_Z;

    let B = grad_input.shape(0);
    let C_in = grad_input.shape(1);
    let H = grad_input.shape(2);
    let W = grad_input.shape(3);

    if batch >= B || iy >= H || ix >= W {
        return;
    }

    let C_out = grad_output.shape(1);
    let H_out = grad_output.shape(2);
    let W_out = grad_output.shape(3);
    let K_h = weight.shape(2);
    let K_w = weight.shape(3);

    let depth_base = batch * depth.stride(0);
    let sample = depth[depth_base + iy * depth.stride(2) + ix * depth.stride(3)];

    for ci in 0..C_in {
        let mut grad_val = F::new(0.0);

        for ky in 0..K_h {
            // oy * stride_h = iy + padding_h - ky * dilation_h
            let offset_y = iy + padding_h;
            let tap_y = ky * dilation_h;

            if offset_y >= tap_y && (offset_y - tap_y) % stride_h == 0 {
                let oy = (offset_y - tap_y) / stride_h;

                if oy < H_out {
                    let center_y = center_position(oy, K_h, stride_h, padding_h, dilation_h, H);

                    for kx in 0..K_w {
                        let offset_x = ix + padding_w;
                        let tap_x = kx * dilation_w;

                        if offset_x >= tap_x && (offset_x - tap_x) % stride_w == 0 {
                            let ox = (offset_x - tap_x) / stride_w;

                            if ox < W_out {
                                let center_x = center_position(ox, K_w, stride_w, padding_w, dilation_w, W);
                                let center = depth[depth_base + center_y * depth.stride(2) + center_x * depth.stride(3)];
                                let gate = similarity::<F>(center, sample, alpha);

                                for co in 0..C_out {
                                    let idx_weight = co * weight.stride(0)
                                                    + ci * weight.stride(1)
                                                    + ky * weight.stride(2)
                                                    + kx * weight.stride(3);

                                    let idx_grad_output = batch * grad_output.stride(0)
                                                        + co * grad_output.stride(1)
                                                        + oy * grad_output.stride(2)
                                                        + ox * grad_output.stride(3);

                                    grad_val += weight[idx_weight] * gate * grad_output[idx_grad_output];
                                }
                            }
                        }
                    }
                }
            }
        }

        let idx_grad_input = batch * grad_input.stride(0)
                            + ci * grad_input.stride(1)
                            + iy * grad_input.stride(2)
                            + ix * grad_input.stride(3);

        grad_input[idx_grad_input] = grad_val;
    }
}


/// One thread per weight cell, reducing over batch and output positions.
#[cube(launch)]
pub fn depth_conv_grad_weight_kernel<F: Float>(
    input: &Tensor<F>,           // Input tensor: shape [B, C_in, H, W]
    depth: &Tensor<F>,           // Depth tensor: shape [B, 1, H, W]
    grad_output: &Tensor<F>,     // Output gradient: shape [B, C_out, H_out, W_out]
    grad_weight: &mut Tensor<F>, // Weight gradient: shape [C_out, C_in, K_h, K_w]
    args: DepthConvArgs,
    alpha: F,
) {
    let stride_h = args.stride_h;
    let stride_w = args.stride_w;
    let padding_h = args.padding_h;
    let padding_w = args.padding_w;
    let dilation_h = args.dilation_h;
    let dilation_w = args.dilation_w;

    let cell = ABSOLUTE_POS_X;

    let C_out = grad_weight.shape(0);
    let C_in = grad_weight.shape(1);
    let K_h = grad_weight.shape(2);
    let K_w = grad_weight.shape(3);

    if cell >= C_out * C_in * K_h * K_w {
        return;
    }

    let kx = cell % K_w;
    let ky = (cell / K_w) % K_h;
    let ci = (cell / (K_w * K_h)) % C_in;
    let co = cell / (K_w * K_h * C_in);

    let B = input.shape(0);
    let H = input.shape(2);
    let W = input.shape(3);
    let H_out = grad_output.shape(2);
    let W_out = grad_output.shape(3);

    let mut grad_val = F::new(0.0);

    for batch in 0..B {
        let depth_base = batch * depth.stride(0);

        for oy in 0..H_out {
            let iy = oy * stride_h + ky * dilation_h;

            if iy >= padding_h && iy - padding_h < H {
                let iy = iy - padding_h;
                let center_y = center_position(oy, K_h, stride_h, padding_h, dilation_h, H);

                for ox in 0..W_out {
                    let ix = ox * stride_w + kx * dilation_w;

                    if ix >= padding_w && ix - padding_w < W {
                        let ix = ix - padding_w;
                        let center_x = center_position(ox, K_w, stride_w, padding_w, dilation_w, W);

                        let center = depth[depth_base + center_y * depth.stride(2) + center_x * depth.stride(3)];
                        let sample = depth[depth_base + iy * depth.stride(2) + ix * depth.stride(3)];
                        let gate = similarity::<F>(center, sample, alpha);

                        let idx_input = batch * input.stride(0)
                                        + ci * input.stride(1)
                                        + iy * input.stride(2)
                                        + ix * input.stride(3);

                        let idx_grad_output = batch * grad_output.stride(0)
                                            + co * grad_output.stride(1)
                                            + oy * grad_output.stride(2)
                                            + ox * grad_output.stride(3);

                        grad_val += input[idx_input] * gate * grad_output[idx_grad_output];
                    }
                }
            }
        }
    }

    let idx_grad_weight = co * grad_weight.stride(0)
                        + ci * grad_weight.stride(1)
                        + ky * grad_weight.stride(2)
                        + kx * grad_weight.stride(3);

    grad_weight[idx_grad_weight] = grad_val;
}
