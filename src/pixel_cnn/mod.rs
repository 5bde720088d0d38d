//! # Gated PixelCNN
//!
//! Autoregressive pixel decoder conditioned on a float vector. Vertical and
//! horizontal masked stacks avoid the blind spot of plain masked convolutions;
//! every output location only sees the pixels that precede it in raster order.
use tch::{nn, Device, IndexOp, Kind, Tensor};

use crate::losses::RecLossType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskType {
    /// First layer: the current pixel is hidden.
    A,
    /// Later layers: the current location of the previous features is visible.
    B,
}

#[derive(Debug, Clone, Copy)]
pub struct GatedPixelCnnConfig {
    pub input_dim: i64,
    pub output_dim: i64,
    pub dim: i64,
    pub n_layers: i64,
    pub float_condition_size: i64,
    pub last_layer_bias: f64,
    pub output_projection_size: i64,
}

impl Default for GatedPixelCnnConfig {
    fn default() -> Self {
        Self {
            input_dim: 1,
            output_dim: 30,
            dim: 64,
            n_layers: 8,
            float_condition_size: 196,
            last_layer_bias: 0.0,
            output_projection_size: 32,
        }
    }
}

/// `[1, 1, k, k]` masks for the vertical and horizontal stacks.
fn stack_masks(kernel: i64, mask_type: MaskType, device: Device) -> (Tensor, Tensor) {
    let center = kernel / 2;
    let mut vert = vec![0f32; (kernel * kernel) as usize];
    let mut horiz = vec![0f32; (kernel * kernel) as usize];
    for row in 0..kernel {
        for col in 0..kernel {
            let at = (row * kernel + col) as usize;
            let vert_visible = match mask_type {
                MaskType::A => row < center,
                MaskType::B => row <= center,
            };
            let horiz_visible = row == center
                && match mask_type {
                    MaskType::A => col < center,
                    MaskType::B => col <= center,
                };
            vert[at] = vert_visible as u8 as f32;
            horiz[at] = horiz_visible as u8 as f32;
        }
    }
    let view = |mask: Vec<f32>| Tensor::from_slice(&mask).view([1, 1, kernel, kernel]).to_device(device);
    (view(vert), view(horiz))
}

fn gate(xs: &Tensor) -> Tensor {
    let halves = xs.chunk(2, 1);
    halves[0].tanh() * halves[1].sigmoid()
}

#[derive(Debug)]
pub struct GatedMaskedConv2d {
    vert_stack: nn::Conv2D,
    vert_to_horiz: nn::Conv2D,
    horiz_stack: nn::Conv2D,
    horiz_resid: nn::Conv2D,
    condition: nn::Linear,
    vert_mask: Tensor,
    horiz_mask: Tensor,
    padding: i64,
    residual: bool,
}

impl GatedMaskedConv2d {
    pub fn new(vs: nn::Path, mask_type: MaskType, dim: i64, kernel: i64, condition_size: i64) -> Self {
        let padding = kernel / 2;
        let conv_cfg = nn::ConvConfig { padding, ..Default::default() };
        let vert_stack = nn::conv2d(&vs / "vert_stack", dim, 2 * dim, kernel, conv_cfg);
        let horiz_stack = nn::conv2d(&vs / "horiz_stack", dim, 2 * dim, kernel, conv_cfg);
        let vert_to_horiz = nn::conv2d(&vs / "vert_to_horiz", 2 * dim, 2 * dim, 1, Default::default());
        let horiz_resid = nn::conv2d(&vs / "horiz_resid", dim, dim, 1, Default::default());
        let condition = nn::linear(&vs / "condition", condition_size, 2 * dim, Default::default());
        let (vert_mask, horiz_mask) = stack_masks(kernel, mask_type, vs.device());
        Self {
            vert_stack,
            vert_to_horiz,
            horiz_stack,
            horiz_resid,
            condition,
            vert_mask,
            horiz_mask,
            padding,
            residual: mask_type == MaskType::B,
        }
    }

    fn masked(&self, conv: &nn::Conv2D, mask: &Tensor, xs: &Tensor) -> Tensor {
        xs.conv2d(&(&conv.ws * mask), conv.bs.as_ref(), [1, 1], [self.padding, self.padding], [1, 1], 1)
    }

    pub fn forward(&self, x_v: &Tensor, x_h: &Tensor, condition: &Tensor) -> (Tensor, Tensor) {
        let h = condition.apply(&self.condition).unsqueeze(-1).unsqueeze(-1);
        let h_vert = self.masked(&self.vert_stack, &self.vert_mask, x_v);
        let out_v = gate(&(&h_vert + &h));
        let h_horiz = self.masked(&self.horiz_stack, &self.horiz_mask, x_h);
        let v2h = h_vert.apply(&self.vert_to_horiz);
        let out = gate(&(v2h + h_horiz + &h)).apply(&self.horiz_resid);
        let out_h = if self.residual { out + x_h } else { out };
        (out_v, out_h)
    }
}

#[derive(Debug)]
pub struct GatedPixelCnn {
    input_proj: nn::Conv2D,
    layers: Vec<GatedMaskedConv2d>,
    output_proj: nn::Conv2D,
    output: nn::Conv2D,
    pub config: GatedPixelCnnConfig,
}

impl GatedPixelCnn {
    pub fn new(vs: nn::Path, config: GatedPixelCnnConfig) -> Self {
        let input_proj = nn::conv2d(&vs / "input_proj", config.input_dim, config.dim, 1, Default::default());
        let vs_layers = &vs / "layers";
        let layers = (0..config.n_layers)
            .map(|index| {
                let (mask_type, kernel) = if index == 0 { (MaskType::A, 7) } else { (MaskType::B, 3) };
                GatedMaskedConv2d::new(&vs_layers / index, mask_type, config.dim, kernel, config.float_condition_size)
            })
            .collect();
        let output_proj = nn::conv2d(
            &vs / "output_proj",
            config.dim,
            config.output_projection_size,
            1,
            Default::default(),
        );
        let out_cfg = nn::ConvConfig { bs_init: nn::Init::Const(config.last_layer_bias), ..Default::default() };
        let output = nn::conv2d(&vs / "output", config.output_projection_size, config.output_dim, 1, out_cfg);
        Self { input_proj, layers, output_proj, output, config }
    }

    /// Per-pixel distribution parameters for `xs`, conditioned on `condition` (`[B, float_condition_size]`).
    pub fn forward(&self, xs: &Tensor, condition: &Tensor) -> Tensor {
        let xs = xs.apply(&self.input_proj);
        let (mut x_v, mut x_h) = (xs.shallow_clone(), xs);
        for layer in self.layers.iter() {
            (x_v, x_h) = layer.forward(&x_v, &x_h, condition);
        }
        x_h.relu().apply(&self.output_proj).relu().apply(&self.output)
    }

    /// Free-running generation: one full pass per (channel, row, column), each
    /// writing its sampled value back into the canvas before the next pass.
    pub fn generate(
        &self,
        condition: &Tensor,
        shape: (i64, i64, i64),
        loss: RecLossType,
        nr_mix: i64,
        only_mean: bool,
    ) -> Tensor {
        let _no_grad = tch::no_grad_guard();
        let (channels, height, width) = shape;
        let batch = condition.size()[0];
        let canvas = Tensor::zeros([batch, channels, height, width], (Kind::Float, condition.device()));
        for c in 0..channels {
            for i in 0..height {
                for j in 0..width {
                    let output = self.forward(&canvas, condition);
                    let sample = loss.sample(&output, nr_mix, only_mean);
                    let mut pixel = canvas.i((.., c, i, j));
                    pixel.copy_(&sample.i((.., c, i, j)));
                }
            }
        }
        canvas
    }
}
