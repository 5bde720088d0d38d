use tch::{nn, Tensor};

use super::{res_block::ResBlock, Posterior};

#[derive(Debug, Clone, Copy)]
pub struct ConvEncoderConfig {
    pub input_channels: i64,
    pub code_length: i64,
    pub encoder_output_size: i64,
    /// Adds a third strided convolution, leaving a 4x4 grid on 28x28 inputs.
    pub large: bool,
}

impl Default for ConvEncoderConfig {
    fn default() -> Self {
        Self { input_channels: 1, code_length: 48, encoder_output_size: 4704, large: false }
    }
}

fn conv_bn_relu(vs: &nn::Path, name: &str, c_in: i64, c_out: i64, k: i64, cfg: nn::ConvConfig) -> nn::SequentialT {
    nn::seq_t()
        .add(nn::conv2d(vs / name, c_in, c_out, k, cfg))
        .add(nn::batch_norm2d(vs / format!("{name}_bn"), c_out, Default::default()))
        .add_fn(|xs| xs.relu())
}

/// Strided convolutions followed by mean and log-variance heads.
#[derive(Debug)]
pub struct ConvEncoder {
    features: nn::SequentialT,
    fc_mu: nn::Linear,
    fc_logvar: nn::Linear,
    pub config: ConvEncoderConfig,
}

impl ConvEncoder {
    pub fn new(vs: nn::Path, config: ConvEncoderConfig) -> Self {
        let down = nn::ConvConfig { stride: 2, padding: 1, ..Default::default() };
        let cl2 = 2 * config.code_length;
        let features = if config.large {
            nn::seq_t()
                .add(conv_bn_relu(&vs, "conv1", config.input_channels, 16, 4, down))
                .add(conv_bn_relu(&vs, "conv2", 16, 16, 4, down))
                .add(conv_bn_relu(&vs, "conv3", 16, 16, 2, down))
                .add(conv_bn_relu(&vs, "conv4", 16, cl2, 1, Default::default()))
        } else {
            nn::seq_t()
                .add(conv_bn_relu(&vs, "conv1", config.input_channels, 16, 4, down))
                .add(conv_bn_relu(&vs, "conv2", 16, 32, 4, down))
                .add(conv_bn_relu(&vs, "conv3", 32, cl2, 1, Default::default()))
        };
        let fc_mu = nn::linear(&vs / "fc_mu", config.encoder_output_size, config.code_length, Default::default());
        let fc_logvar =
            nn::linear(&vs / "fc_logvar", config.encoder_output_size, config.code_length, Default::default());
        Self { features, fc_mu, fc_logvar, config }
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Posterior {
        let hidden = xs.apply_t(&self.features, train).flatten(1, -1);
        Posterior { mu: hidden.apply(&self.fc_mu), logvar: Some(hidden.apply(&self.fc_logvar)) }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ResEncoderConfig {
    pub input_channels: i64,
    pub hidden_size: i64,
    pub latent_channels: i64,
}

impl Default for ResEncoderConfig {
    fn default() -> Self {
        Self { input_channels: 1, hidden_size: 256, latent_channels: 4 }
    }
}

/// Residual encoder producing a `[B, latent_channels, H/4, W/4]` grid.
#[derive(Debug)]
pub struct ResEncoder {
    layers: nn::SequentialT,
    pub config: ResEncoderConfig,
}

impl ResEncoder {
    pub fn new(vs: nn::Path, config: ResEncoderConfig) -> Self {
        let down = nn::ConvConfig { stride: 2, padding: 1, ..Default::default() };
        let hidden = config.hidden_size;
        let layers = nn::seq_t()
            .add(conv_bn_relu(&vs, "conv1", config.input_channels, hidden, 4, down))
            .add(nn::conv2d(&vs / "conv2", hidden, hidden, 4, down))
            .add(nn::batch_norm2d(&vs / "conv2_bn", hidden, Default::default()))
            .add(ResBlock::new(&vs / "res1", hidden))
            .add(ResBlock::new(&vs / "res2", hidden))
            .add(nn::conv2d(&vs / "conv_out", hidden, config.latent_channels, 1, Default::default()));
        Self { layers, config }
    }

    /// The spatial latent grid.
    pub fn grid(&self, xs: &Tensor, train: bool) -> Tensor {
        xs.apply_t(&self.layers, train)
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Posterior {
        Posterior { mu: self.grid(xs, train).flatten(1, -1), logvar: None }
    }
}
