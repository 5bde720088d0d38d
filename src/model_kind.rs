use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::{AcnError, Result};

/// The closed set of encoder/decoder pairings an ACN can be trained with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum ModelKind {
    /// Two strided convolutions, a Gaussian posterior and a transpose-convolution decoder.
    Deconv,
    /// Three strided convolutions down to a 4x4 grid, mirrored decoder.
    DeconvLarge,
    /// Residual encoder/decoder with a unit-variance spatial posterior.
    Residual,
    /// Residual encoder/decoder with a vector-quantized bottleneck.
    VqResidual,
    /// Residual encoder conditioning a gated PixelCNN decoder.
    PixelCnn,
}

pub(crate) fn conv_out(size: i64, kernel: i64, stride: i64, padding: i64) -> i64 {
    (size + 2 * padding - kernel) / stride + 1
}

pub(crate) fn conv_transpose_out(size: i64, kernel: i64, stride: i64, padding: i64) -> i64 {
    (size - 1) * stride - 2 * padding + kernel
}

impl ModelKind {
    pub fn name(&self) -> &'static str {
        match self {
            ModelKind::Deconv => "deconv",
            ModelKind::DeconvLarge => "deconv_large",
            ModelKind::Residual => "residual",
            ModelKind::VqResidual => "vq_residual",
            ModelKind::PixelCnn => "pixel_cnn",
        }
    }

    pub fn uses_vq(&self) -> bool {
        matches!(self, ModelKind::VqResidual)
    }

    pub fn is_autoregressive(&self) -> bool {
        matches!(self, ModelKind::PixelCnn)
    }

    /// Whether the encoder predicts a log-variance head. Residual encoders only
    /// predict a mean and rely on a unit-variance posterior.
    pub fn has_logvar(&self) -> bool {
        matches!(self, ModelKind::Deconv | ModelKind::DeconvLarge)
    }

    /// Spatial size of the encoder's last feature map for a `height x width` input.
    pub fn encoder_grid(&self, height: i64, width: i64) -> (i64, i64) {
        let down = |size: i64| match self {
            ModelKind::DeconvLarge => {
                let size = conv_out(size, 4, 2, 1);
                let size = conv_out(size, 4, 2, 1);
                conv_out(size, 2, 2, 1)
            }
            _ => conv_out(conv_out(size, 4, 2, 1), 4, 2, 1),
        };
        (down(height), down(width))
    }

    /// Spatial size produced by the decoder from a `side x side` grid.
    pub fn decoder_output(&self, side: i64) -> i64 {
        match self {
            ModelKind::DeconvLarge => {
                let size = conv_transpose_out(side, 4, 2, 1);
                let size = conv_transpose_out(size, 2, 2, 1);
                conv_transpose_out(size, 2, 2, 0)
            }
            _ => conv_transpose_out(conv_transpose_out(side, 4, 2, 1), 4, 2, 1),
        }
    }

    /// Flattened encoder feature size for the deconvolution variants.
    pub fn encoder_output_size(&self, code_length: i64, height: i64, width: i64) -> i64 {
        let (gh, gw) = self.encoder_grid(height, width);
        2 * code_length * gh * gw
    }

    /// `(channels, height, width)` of the spatial latent grid of the residual variants.
    pub fn latent_grid(&self, code_length: i64, height: i64, width: i64) -> Result<(i64, i64, i64)> {
        let (gh, gw) = self.encoder_grid(height, width);
        if gh <= 0 || gw <= 0 || code_length % (gh * gw) != 0 {
            return Err(AcnError::Config(format!(
                "code_length {code_length} is not a multiple of the {gh}x{gw} latent grid of {}",
                self.name()
            )));
        }
        Ok((code_length / (gh * gw), gh, gw))
    }

    /// Side of the square grid the deconvolution decoders reshape into.
    pub fn decoder_grid_side(&self, code_length: i64, encoder_output_size: i64) -> Result<i64> {
        let cells = encoder_output_size / (2 * code_length);
        let side = (cells as f64).sqrt().round() as i64;
        if encoder_output_size % (2 * code_length) != 0 || side * side != cells {
            return Err(AcnError::Config(format!(
                "encoder_output_size {encoder_output_size} does not reshape to a square grid of {} channels",
                2 * code_length
            )));
        }
        Ok(side)
    }
}
