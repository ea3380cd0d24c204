//! Host implementation of the depth-aware convolution.
//!
//! Buffers are dense row-major NCHW slices. Work is split so that every
//! rayon task owns the slice it writes: forward over `(n, c_out)` planes,
//! the input gradient over `(n, c_in)` planes, the weight gradient over
//! output channels.
use rayon::prelude::*;

use super::{
    error::DepthConvError,
    options::{output_size, DepthConvOptions},
};


/// Depth-similarity gate applied to a single kernel tap.
#[inline]
pub fn depth_similarity(center: f32, sample: f32, alpha: f32) -> f32 {
    (-alpha * (center - sample).abs()).exp()
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
    pub batch: usize,
    pub in_channels: usize,
    pub height: usize,
    pub width: usize,
    pub out_channels: usize,
    pub kernel: [usize; 2],
    pub out_height: usize,
    pub out_width: usize,
    pub stride: [usize; 2],
    pub padding: [usize; 2],
    pub dilation: [usize; 2],
}

impl ConvGeometry {
    pub fn new(
        input: [usize; 4],
        weight: [usize; 4],
        options: &DepthConvOptions,
    ) -> Result<Self, DepthConvError> {
        let [batch, out_channels, out_height, out_width] = output_size(input, weight, options)?;

        Ok(Self {
            batch,
            in_channels: input[1],
            height: input[2],
            width: input[3],
            out_channels,
            kernel: [weight[2], weight[3]],
            out_height,
            out_width,
            stride: options.stride,
            padding: options.padding,
            dilation: options.dilation,
        })
    }

    pub fn input_dims(&self) -> [usize; 4] {
        [self.batch, self.in_channels, self.height, self.width]
    }

    pub fn weight_dims(&self) -> [usize; 4] {
        [self.out_channels, self.in_channels, self.kernel[0], self.kernel[1]]
    }

    pub fn output_dims(&self) -> [usize; 4] {
        [self.batch, self.out_channels, self.out_height, self.out_width]
    }

    fn plane(&self) -> usize {
        self.height * self.width
    }

    fn out_plane(&self) -> usize {
        self.out_height * self.out_width
    }

    fn taps(&self) -> usize {
        self.kernel[0] * self.kernel[1]
    }

    /// Input coordinate sampled by `tap` of output coordinate `out` on `axis`,
    /// or `None` when it falls into the padding.
    #[inline]
    fn sample(&self, axis: usize, out: usize, tap: usize) -> Option<usize> {
        let extent = if axis == 0 { self.height } else { self.width };
        (out * self.stride[axis] + tap * self.dilation[axis])
            .checked_sub(self.padding[axis])
            .filter(|&pos| pos < extent)
    }

    /// Input coordinate of the receptive-field center, clamped into the image.
    #[inline]
    fn center(&self, axis: usize, out: usize) -> usize {
        let extent = if axis == 0 { self.height } else { self.width };
        let half = (self.kernel[axis] - 1) / 2;
        (out * self.stride[axis] + half * self.dilation[axis])
            .saturating_sub(self.padding[axis])
            .min(extent - 1)
    }

    /// Walks every in-bounds tap of output position `(oy, ox)` with its
    /// flattened tap index, input offset within a plane and similarity.
    #[inline]
    fn for_each_tap(
        &self,
        depth: &[f32],
        alpha: f32,
        oy: usize,
        ox: usize,
        mut visit: impl FnMut(usize, usize, f32),
    ) {
        let center = depth[self.center(0, oy) * self.width + self.center(1, ox)];

        for ky in 0..self.kernel[0] {
            let Some(iy) = self.sample(0, oy, ky) else {
                continue;
            };

            for kx in 0..self.kernel[1] {
                let Some(ix) = self.sample(1, ox, kx) else {
                    continue;
                };

                let offset = iy * self.width + ix;
                let similarity = depth_similarity(center, depth[offset], alpha);
                visit(ky * self.kernel[1] + kx, offset, similarity);
            }
        }
    }
}


pub struct HostGradients {
    pub input: Vec<f32>,
    pub weight: Vec<f32>,
    pub bias: Vec<f32>,
}


pub fn forward(
    geometry: &ConvGeometry,
    input: &[f32],
    depth: &[f32],
    weight: &[f32],
    bias: &[f32],
    alpha: f32,
) -> Vec<f32> {
    let g = geometry;
    let plane = g.plane();
    let taps = g.taps();
    let mut output = vec![0.0; g.batch * g.out_channels * g.out_plane()];

    output
        .par_chunks_mut(g.out_plane())
        .enumerate()
        .for_each(|(index, out)| {
            let n = index / g.out_channels;
            let co = index % g.out_channels;

            let depth_n = &depth[n * plane..(n + 1) * plane];
            let input_n = &input[n * g.in_channels * plane..(n + 1) * g.in_channels * plane];
            let weight_co = &weight[co * g.in_channels * taps..(co + 1) * g.in_channels * taps];

            for oy in 0..g.out_height {
                for ox in 0..g.out_width {
                    let mut acc = bias[co];

                    g.for_each_tap(depth_n, alpha, oy, ox, |tap, offset, similarity| {
                        for ci in 0..g.in_channels {
                            acc += weight_co[ci * taps + tap]
                                * input_n[ci * plane + offset]
                                * similarity;
                        }
                    });

                    out[oy * g.out_width + ox] = acc;
                }
            }
        });

    output
}

pub fn backward(
    geometry: &ConvGeometry,
    input: &[f32],
    depth: &[f32],
    weight: &[f32],
    grad_output: &[f32],
    alpha: f32,
) -> HostGradients {
    HostGradients {
        input: grad_input(geometry, depth, weight, grad_output, alpha),
        weight: grad_weight(geometry, input, depth, grad_output, alpha),
        bias: grad_bias(geometry, grad_output),
    }
}

pub fn grad_input(
    geometry: &ConvGeometry,
    depth: &[f32],
    weight: &[f32],
    grad_output: &[f32],
    alpha: f32,
) -> Vec<f32> {
    let g = geometry;
    let taps = g.taps();
    let out_plane = g.out_plane();
    let mut grad = vec![0.0; g.batch * g.in_channels * g.plane()];

    grad.par_chunks_mut(g.plane())
        .enumerate()
        .for_each(|(index, grad_plane)| {
            let n = index / g.in_channels;
            let ci = index % g.in_channels;
            let depth_n = &depth[n * g.plane()..(n + 1) * g.plane()];

            for co in 0..g.out_channels {
                let go = &grad_output[(n * g.out_channels + co) * out_plane..][..out_plane];
                let w = &weight[(co * g.in_channels + ci) * taps..][..taps];

                for oy in 0..g.out_height {
                    for ox in 0..g.out_width {
                        let upstream = go[oy * g.out_width + ox];
                        if upstream == 0.0 {
                            continue;
                        }

                        g.for_each_tap(depth_n, alpha, oy, ox, |tap, offset, similarity| {
                            grad_plane[offset] += w[tap] * similarity * upstream;
                        });
                    }
                }
            }
        });

    grad
}

pub fn grad_weight(
    geometry: &ConvGeometry,
    input: &[f32],
    depth: &[f32],
    grad_output: &[f32],
    alpha: f32,
) -> Vec<f32> {
    let g = geometry;
    let plane = g.plane();
    let taps = g.taps();
    let out_plane = g.out_plane();
    let mut grad = vec![0.0; g.out_channels * g.in_channels * taps];

    grad.par_chunks_mut(g.in_channels * taps)
        .enumerate()
        .for_each(|(co, grad_co)| {
            for n in 0..g.batch {
                let depth_n = &depth[n * plane..(n + 1) * plane];
                let input_n = &input[n * g.in_channels * plane..(n + 1) * g.in_channels * plane];
                let go = &grad_output[(n * g.out_channels + co) * out_plane..][..out_plane];

                for oy in 0..g.out_height {
                    for ox in 0..g.out_width {
                        let upstream = go[oy * g.out_width + ox];

                        g.for_each_tap(depth_n, alpha, oy, ox, |tap, offset, similarity| {
                            let scale = similarity * upstream;
                            for ci in 0..g.in_channels {
                                grad_co[ci * taps + tap] += input_n[ci * plane + offset] * scale;
                            }
                        });
                    }
                }
            }
        });

    grad
}

pub fn grad_bias(geometry: &ConvGeometry, grad_output: &[f32]) -> Vec<f32> {
    let g = geometry;
    let out_plane = g.out_plane();

    (0..g.out_channels)
        .into_par_iter()
        .map(|co| {
            (0..g.batch)
                .map(|n| {
                    grad_output[(n * g.out_channels + co) * out_plane..][..out_plane]
                        .iter()
                        .sum::<f32>()
                })
                .sum()
        })
        .collect()
}
