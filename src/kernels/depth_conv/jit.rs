use burn_jit::{
    kernel::into_contiguous,
    tensor::JitTensor,
    FloatElement,
    IntElement,
    JitBackend,
    JitRuntime,
};
use burn::tensor::{
    ops::FloatTensor,
    ElementConversion,
    Shape,
    Tensor,
    TensorPrimitive,
};
use cubecl::{
    prelude::ScalarArg,
    CubeCount,
    CubeDim,
};
use burn_wgpu::WgpuRuntime;
use log::trace;

use super::{
    Backend as DepthConvBackend,
    DepthConvBackward,
    DepthConvOptions,
};
use super::kernel::{
    depth_conv_forward_kernel,
    depth_conv_grad_input_kernel,
    depth_conv_grad_weight_kernel,
    DepthConvArgsLaunch,
};

/// Wgpu backend carrying the depth_conv kernels.
///
/// `burn::backend::Wgpu` wraps the JIT backend in `Fusion` once the `fusion`
/// feature is enabled, and fused backends do not expose custom ops in burn
/// 0.15. Use this alias (or `Autodiff<DepthConvWgpu>`) instead.
pub type DepthConvWgpu = JitBackend<WgpuRuntime, f32, i32>;

const PLANE_CUBE: CubeDim = CubeDim { x: 16, y: 16, z: 1 };
const LINEAR_CUBE: CubeDim = CubeDim { x: 256, y: 1, z: 1 };


fn plane_cube_count(rows: usize, cols: usize, depth: usize) -> CubeCount {
    let cubes_needed_in_x = f32::ceil(rows as f32 / PLANE_CUBE.x as f32) as u32;
    let cubes_needed_in_y = f32::ceil(cols as f32 / PLANE_CUBE.y as f32) as u32;
    CubeCount::Static(cubes_needed_in_x, cubes_needed_in_y, depth as u32)
}

fn dims4(shape: &Shape, name: &str) -> [usize; 4] {
    assert_eq!(shape.dims.len(), 4, "{name} must be a rank 4 tensor");
    [shape.dims[0], shape.dims[1], shape.dims[2], shape.dims[3]]
}

fn launch_args<'a, R: JitRuntime>(options: &DepthConvOptions) -> DepthConvArgsLaunch<'a, R> {
    DepthConvArgsLaunch::new(
        ScalarArg::new(options.stride[0] as u32),
        ScalarArg::new(options.stride[1] as u32),
        ScalarArg::new(options.padding[0] as u32),
        ScalarArg::new(options.padding[1] as u32),
        ScalarArg::new(options.dilation[0] as u32),
        ScalarArg::new(options.dilation[1] as u32),
    )
}

fn empty_like<R: JitRuntime, F: FloatElement>(
    reference: &JitTensor<R, F>,
    shape: Shape,
) -> JitTensor<R, F> {
    let buffer = reference
        .client
        .empty(shape.num_elements() * core::mem::size_of::<F>());

    JitTensor::new_contiguous(
        reference.client.clone(),
        reference.device.clone(),
        shape,
        buffer,
    )
}


impl<R: JitRuntime, F: FloatElement, I: IntElement> DepthConvBackend for JitBackend<R, F, I> {
    fn depth_conv(
        input: FloatTensor<Self>,
        depth: FloatTensor<Self>,
        weight: FloatTensor<Self>,
        bias: FloatTensor<Self>,
        options: DepthConvOptions,
    ) -> FloatTensor<Self> {
        input.assert_is_on_same_device(&depth);
        input.assert_is_on_same_device(&weight);
        input.assert_is_on_same_device(&bias);

        let input = into_contiguous(input);
        let depth = into_contiguous(depth);
        let weight = into_contiguous(weight);
        let bias = into_contiguous(bias);

        let input_dims = dims4(&input.shape, "input");
        let weight_dims = dims4(&weight.shape, "weight");
        let [B, C_out, H_out, W_out] = super::output_size(input_dims, weight_dims, &options)
            .unwrap_or_else(|err| panic!("depth_conv called with unchecked operands: {err}"));

        let output = empty_like::<R, F>(&input, Shape::new([B, C_out, H_out, W_out]));
        let cube_count = plane_cube_count(H_out, W_out, B);

        trace!("depth_conv forward launch {:?} over {H_out}x{W_out}x{B}", PLANE_CUBE);

        depth_conv_forward_kernel::launch::<F, R>(
            &input.client,
            cube_count,
            PLANE_CUBE,
            input.as_tensor_arg(1),
            depth.as_tensor_arg(1),
            weight.as_tensor_arg(1),
            bias.as_tensor_arg(1),
            output.as_tensor_arg(1),
            launch_args(&options),
            ScalarArg::new(options.alpha.elem::<F>()),
        );

        output
    }

    fn depth_conv_backward(
        input: FloatTensor<Self>,
        depth: FloatTensor<Self>,
        weight: FloatTensor<Self>,
        grad_output: FloatTensor<Self>,
        options: DepthConvOptions,
    ) -> DepthConvBackward<Self> {
        input.assert_is_on_same_device(&depth);
        input.assert_is_on_same_device(&weight);
        input.assert_is_on_same_device(&grad_output);

        let input = into_contiguous(input);
        let depth = into_contiguous(depth);
        let weight = into_contiguous(weight);
        let grad_output = into_contiguous(grad_output);

        let input_dims = dims4(&input.shape, "input");
        let weight_dims = dims4(&weight.shape, "weight");
        let output_dims = super::output_size(input_dims, weight_dims, &options)
            .unwrap_or_else(|err| panic!("depth_conv called with unchecked operands: {err}"));

        assert_eq!(
            grad_output.shape.dims.as_slice(),
            output_dims.as_slice(),
            "grad_output must match the forward output shape",
        );

        let [B, _C_in, H, W] = input_dims;
        let [C_out, ..] = weight_dims;

        let grad_input = empty_like::<R, F>(&input, Shape::new(input_dims));
        trace!("depth_conv grad_input launch {:?} over {H}x{W}x{B}", PLANE_CUBE);

        depth_conv_grad_input_kernel::launch::<F, R>(
            &input.client,
            plane_cube_count(H, W, B),
            PLANE_CUBE,
            depth.as_tensor_arg(1),
            weight.as_tensor_arg(1),
            grad_output.as_tensor_arg(1),
            grad_input.as_tensor_arg(1),
            launch_args(&options),
            ScalarArg::new(options.alpha.elem::<F>()),
        );

        let cells = weight_dims.iter().product::<usize>();
        let grad_weight = empty_like::<R, F>(&weight, Shape::new(weight_dims));
        let cubes_needed = f32::ceil(cells as f32 / LINEAR_CUBE.x as f32) as u32;
        trace!("depth_conv grad_weight launch {:?} over {cells} cells", LINEAR_CUBE);

        depth_conv_grad_weight_kernel::launch::<F, R>(
            &input.client,
            CubeCount::Static(cubes_needed, 1, 1),
            LINEAR_CUBE,
            input.as_tensor_arg(1),
            depth.as_tensor_arg(1),
            grad_output.as_tensor_arg(1),
            grad_weight.as_tensor_arg(1),
            launch_args(&options),
            ScalarArg::new(options.alpha.elem::<F>()),
        );

        let grad_bias = Tensor::<Self, 4>::from_primitive(TensorPrimitive::Float(grad_output))
            .sum_dim(0)
            .sum_dim(2)
            .sum_dim(3)
            .reshape([C_out])
            .into_primitive()
            .tensor();

        DepthConvBackward {
            x_grad: grad_input,
            weight_grad: grad_weight,
            bias_grad: grad_bias,
        }
    }
}
