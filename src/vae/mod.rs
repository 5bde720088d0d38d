//! # Variational encoders and decoders
//!
//! Every architecture compresses an image to a flat code of `code_length`
//! floats and decodes it back into per-pixel distribution parameters. The
//! prior of the code is supplied from outside by the neighbour-conditioned
//! prior network.
use tch::{nn, Tensor};

use crate::{
    acn::config::AcnConfig,
    error::Result,
    losses::RecLossType,
    model_kind::ModelKind,
    pixel_cnn::{GatedPixelCnn, GatedPixelCnnConfig},
    vq::{VqEmbedding, VqEmbeddingConfig, VqOutput},
};

pub use self::{
    decoder::{DeconvDecoder, DeconvDecoderConfig, ResDecoder, ResDecoderConfig},
    encoder::{ConvEncoder, ConvEncoderConfig, ResEncoder, ResEncoderConfig},
    res_block::ResBlock,
};

mod decoder;
mod encoder;
mod res_block;

/// Encoder output: a mean and, for the deconvolution variants, a log-variance.
#[derive(Debug)]
pub struct Posterior {
    pub mu: Tensor,
    pub logvar: Option<Tensor>,
}

/// `mu + eps * exp(logvar / 2)` when training, `mu` itself otherwise.
pub fn reparameterize(mu: &Tensor, logvar: &Tensor, train: bool) -> Tensor {
    if train {
        let eps = Tensor::randn_like(logvar);
        mu + eps * (logvar * 0.5).exp()
    } else {
        mu.shallow_clone()
    }
}

/// Quantization tensors of the VQ bottleneck.
#[derive(Debug)]
pub struct Quantized {
    /// Continuous pre-quantization grid.
    pub z_e_x: Tensor,
    pub vq: VqOutput,
}

#[derive(Debug)]
pub struct DecoderOutput {
    /// Per-pixel distribution parameters, `[B, output_dim, H, W]`.
    pub logits: Tensor,
    pub vq: Option<Quantized>,
}

impl DecoderOutput {
    fn plain(logits: Tensor) -> Self {
        Self { logits, vq: None }
    }
}

pub trait LatentCodec {
    fn encode(&self, xs: &Tensor, train: bool) -> Posterior;

    /// Decodes flat codes. `context` is the input image, only read by
    /// autoregressive decoders for teacher forcing.
    fn decode(&self, z: &Tensor, context: &Tensor, train: bool) -> DecoderOutput;

    /// Draws images in the loss domain from flat codes without any context.
    fn generate(&self, z: &Tensor, rec_loss: RecLossType, nr_mix: i64, only_mean: bool) -> Tensor;
}

#[derive(Debug)]
pub struct DeconvVae {
    encoder: ConvEncoder,
    decoder: DeconvDecoder,
}

impl DeconvVae {
    pub fn new(vs: nn::Path, encoder: ConvEncoderConfig, decoder: DeconvDecoderConfig) -> Self {
        Self {
            encoder: ConvEncoder::new(&vs / "encoder", encoder),
            decoder: DeconvDecoder::new(&vs / "decoder", decoder),
        }
    }
}

impl LatentCodec for DeconvVae {
    fn encode(&self, xs: &Tensor, train: bool) -> Posterior {
        self.encoder.forward_t(xs, train)
    }

    fn decode(&self, z: &Tensor, _context: &Tensor, train: bool) -> DecoderOutput {
        DecoderOutput::plain(self.decoder.forward_t(z, train))
    }

    fn generate(&self, z: &Tensor, rec_loss: RecLossType, nr_mix: i64, only_mean: bool) -> Tensor {
        let _no_grad = tch::no_grad_guard();
        rec_loss.sample(&self.decoder.forward_t(z, false), nr_mix, only_mean)
    }
}

/// Shape of the spatial latent grid behind a flat code.
#[derive(Debug, Clone, Copy)]
pub struct LatentGrid {
    pub channels: i64,
    pub height: i64,
    pub width: i64,
}

impl LatentGrid {
    fn unflatten(&self, z: &Tensor) -> Tensor {
        z.view([-1, self.channels, self.height, self.width])
    }
}

#[derive(Debug)]
pub struct ResidualVae {
    encoder: ResEncoder,
    decoder: ResDecoder,
    grid: LatentGrid,
}

impl ResidualVae {
    pub fn new(vs: nn::Path, encoder: ResEncoderConfig, decoder: ResDecoderConfig, grid: LatentGrid) -> Self {
        Self {
            encoder: ResEncoder::new(&vs / "encoder", encoder),
            decoder: ResDecoder::new(&vs / "decoder", decoder),
            grid,
        }
    }
}

impl LatentCodec for ResidualVae {
    fn encode(&self, xs: &Tensor, train: bool) -> Posterior {
        self.encoder.forward_t(xs, train)
    }

    fn decode(&self, z: &Tensor, _context: &Tensor, train: bool) -> DecoderOutput {
        DecoderOutput::plain(self.decoder.forward_t(&self.grid.unflatten(z), train))
    }

    fn generate(&self, z: &Tensor, rec_loss: RecLossType, nr_mix: i64, only_mean: bool) -> Tensor {
        let _no_grad = tch::no_grad_guard();
        rec_loss.sample(&self.decoder.forward_t(&self.grid.unflatten(z), false), nr_mix, only_mean)
    }
}

/// Residual encoder, 1x1 projection to the codebook dimension, straight-through
/// quantization and a residual decoder.
#[derive(Debug)]
pub struct VqResidualVae {
    encoder: ResEncoder,
    to_z: nn::Conv2D,
    vq: VqEmbedding,
    decoder: ResDecoder,
    grid: LatentGrid,
}

impl VqResidualVae {
    pub fn new(
        vs: nn::Path,
        encoder: ResEncoderConfig,
        vq: VqEmbeddingConfig,
        decoder: ResDecoderConfig,
        grid: LatentGrid,
    ) -> Self {
        let to_z = nn::conv2d(&vs / "to_z", grid.channels, vq.embedding_dim, 1, Default::default());
        Self {
            encoder: ResEncoder::new(&vs / "encoder", encoder),
            to_z,
            vq: VqEmbedding::new(&vs / "vq", vq),
            decoder: ResDecoder::new(&vs / "decoder", ResDecoderConfig { input_channels: vq.embedding_dim, ..decoder }),
            grid,
        }
    }

    fn quantize(&self, z: &Tensor) -> Quantized {
        let z_e_x = self.grid.unflatten(z).apply(&self.to_z);
        let vq = self.vq.straight_through(&z_e_x);
        Quantized { z_e_x, vq }
    }
}

impl LatentCodec for VqResidualVae {
    fn encode(&self, xs: &Tensor, train: bool) -> Posterior {
        self.encoder.forward_t(xs, train)
    }

    fn decode(&self, z: &Tensor, _context: &Tensor, train: bool) -> DecoderOutput {
        let quantized = self.quantize(z);
        let logits = self.decoder.forward_t(&quantized.vq.z_q_x_st, train);
        DecoderOutput { logits, vq: Some(quantized) }
    }

    fn generate(&self, z: &Tensor, rec_loss: RecLossType, nr_mix: i64, only_mean: bool) -> Tensor {
        let _no_grad = tch::no_grad_guard();
        let quantized = self.quantize(z);
        rec_loss.sample(&self.decoder.forward_t(&quantized.vq.z_q_x_st, false), nr_mix, only_mean)
    }
}

/// Residual encoder whose flat code conditions a gated PixelCNN.
#[derive(Debug)]
pub struct PixelCnnVae {
    encoder: ResEncoder,
    pixel_cnn: GatedPixelCnn,
    image_shape: (i64, i64, i64),
}

impl PixelCnnVae {
    pub fn new(
        vs: nn::Path,
        encoder: ResEncoderConfig,
        pixel_cnn: GatedPixelCnnConfig,
        image_shape: (i64, i64, i64),
    ) -> Self {
        Self {
            encoder: ResEncoder::new(&vs / "encoder", encoder),
            pixel_cnn: GatedPixelCnn::new(&vs / "pixel_cnn", pixel_cnn),
            image_shape,
        }
    }
}

impl LatentCodec for PixelCnnVae {
    fn encode(&self, xs: &Tensor, train: bool) -> Posterior {
        self.encoder.forward_t(xs, train)
    }

    fn decode(&self, z: &Tensor, context: &Tensor, _train: bool) -> DecoderOutput {
        DecoderOutput::plain(self.pixel_cnn.forward(context, z))
    }

    fn generate(&self, z: &Tensor, rec_loss: RecLossType, nr_mix: i64, only_mean: bool) -> Tensor {
        self.pixel_cnn.generate(z, self.image_shape, rec_loss, nr_mix, only_mean)
    }
}

/// The architecture selected by `AcnConfig::architecture`.
#[derive(Debug)]
pub enum AcnModel {
    Deconv(DeconvVae),
    Residual(ResidualVae),
    VqResidual(VqResidualVae),
    PixelCnn(PixelCnnVae),
}

impl AcnModel {
    /// Builds the configured architecture for `height x width` images. The
    /// configuration must have passed `AcnConfig::validate` for that size.
    pub fn new(vs: nn::Path, config: &AcnConfig, height: i64, width: i64) -> Result<Self> {
        let kind = config.architecture;
        let output_dim = config.rec_loss.output_dim(config.target_channels, config.nr_logistic_mix);
        let last_layer_bias = config.rec_loss.last_layer_bias();
        let model = match kind {
            ModelKind::Deconv | ModelKind::DeconvLarge => {
                let large = kind == ModelKind::DeconvLarge;
                let encoder = ConvEncoderConfig {
                    input_channels: config.input_channels,
                    code_length: config.code_length,
                    encoder_output_size: config.encoder_output_size,
                    large,
                };
                let decoder = DeconvDecoderConfig {
                    code_length: config.code_length,
                    encoder_output_size: config.encoder_output_size,
                    grid_side: kind.decoder_grid_side(config.code_length, config.encoder_output_size)?,
                    output_dim,
                    last_layer_bias,
                    large,
                };
                AcnModel::Deconv(DeconvVae::new(vs, encoder, decoder))
            }
            ModelKind::Residual | ModelKind::VqResidual | ModelKind::PixelCnn => {
                let (channels, gh, gw) = kind.latent_grid(config.code_length, height, width)?;
                let grid = LatentGrid { channels, height: gh, width: gw };
                let encoder = ResEncoderConfig {
                    input_channels: config.input_channels,
                    hidden_size: config.hidden_size,
                    latent_channels: channels,
                };
                let decoder = ResDecoderConfig {
                    input_channels: channels,
                    hidden_size: config.hidden_size,
                    output_dim,
                    last_layer_bias,
                };
                match kind {
                    ModelKind::Residual => AcnModel::Residual(ResidualVae::new(vs, encoder, decoder, grid)),
                    ModelKind::VqResidual => {
                        let vq = VqEmbeddingConfig { num_clusters: config.num_vqk, embedding_dim: config.num_z };
                        AcnModel::VqResidual(VqResidualVae::new(vs, encoder, vq, decoder, grid))
                    }
                    _ => {
                        let pixel_cnn = GatedPixelCnnConfig {
                            input_dim: config.input_channels,
                            output_dim,
                            dim: config.pixel_cnn_dim,
                            n_layers: config.num_pcnn_layers,
                            float_condition_size: config.code_length,
                            last_layer_bias,
                            output_projection_size: config.output_projection_size,
                        };
                        let image_shape = (config.target_channels, height, width);
                        AcnModel::PixelCnn(PixelCnnVae::new(vs, encoder, pixel_cnn, image_shape))
                    }
                }
            }
        };
        Ok(model)
    }

    fn codec(&self) -> &dyn LatentCodec {
        match self {
            AcnModel::Deconv(model) => model,
            AcnModel::Residual(model) => model,
            AcnModel::VqResidual(model) => model,
            AcnModel::PixelCnn(model) => model,
        }
    }
}

impl LatentCodec for AcnModel {
    fn encode(&self, xs: &Tensor, train: bool) -> Posterior {
        self.codec().encode(xs, train)
    }

    fn decode(&self, z: &Tensor, context: &Tensor, train: bool) -> DecoderOutput {
        self.codec().decode(z, context, train)
    }

    fn generate(&self, z: &Tensor, rec_loss: RecLossType, nr_mix: i64, only_mean: bool) -> Tensor {
        self.codec().generate(z, rec_loss, nr_mix, only_mean)
    }
}
