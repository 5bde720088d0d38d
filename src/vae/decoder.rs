use tch::{nn, Tensor};

use super::res_block::ResBlock;

#[derive(Debug, Clone, Copy)]
pub struct DeconvDecoderConfig {
    pub code_length: i64,
    pub encoder_output_size: i64,
    /// Side of the square grid the projected code is reshaped into.
    pub grid_side: i64,
    pub output_dim: i64,
    pub last_layer_bias: f64,
    pub large: bool,
}

impl Default for DeconvDecoderConfig {
    fn default() -> Self {
        Self {
            code_length: 48,
            encoder_output_size: 4704,
            grid_side: 7,
            output_dim: 1,
            last_layer_bias: 0.5,
            large: false,
        }
    }
}

fn deconv_bn_relu(
    vs: &nn::Path,
    name: &str,
    c_in: i64,
    c_out: i64,
    k: i64,
    cfg: nn::ConvTransposeConfig,
) -> nn::SequentialT {
    nn::seq_t()
        .add(nn::conv_transpose2d(vs / name, c_in, c_out, k, cfg))
        .add(nn::batch_norm2d(vs / format!("{name}_bn"), c_out, Default::default()))
        .add_fn(|xs| xs.relu())
}

fn up(kernel_stride: i64, padding: i64) -> nn::ConvTransposeConfig {
    nn::ConvTransposeConfig { stride: kernel_stride, padding, ..Default::default() }
}

/// Projects a code back to a spatial grid and upsamples it with transpose convolutions.
#[derive(Debug)]
pub struct DeconvDecoder {
    fc: nn::Linear,
    layers: nn::SequentialT,
    pub config: DeconvDecoderConfig,
}

impl DeconvDecoder {
    pub fn new(vs: nn::Path, config: DeconvDecoderConfig) -> Self {
        let fc = nn::linear(&vs / "fc", config.code_length, config.encoder_output_size, Default::default());
        let cl2 = 2 * config.code_length;
        let out_cfg = nn::ConvTransposeConfig { bs_init: nn::Init::Const(config.last_layer_bias), ..Default::default() };
        let layers = if config.large {
            nn::seq_t()
                .add(deconv_bn_relu(&vs, "deconv1", cl2, 16, 1, Default::default()))
                .add(deconv_bn_relu(&vs, "deconv2", 16, 16, 4, up(2, 1)))
                .add(deconv_bn_relu(&vs, "deconv3", 16, 16, 2, up(2, 1)))
                .add(deconv_bn_relu(&vs, "deconv4", 16, 16, 2, up(2, 0)))
                .add(nn::conv_transpose2d(&vs / "deconv_out", 16, config.output_dim, 1, out_cfg))
        } else {
            let out_cfg = nn::ConvTransposeConfig { stride: 2, padding: 1, ..out_cfg };
            nn::seq_t()
                .add(deconv_bn_relu(&vs, "deconv1", cl2, 32, 1, Default::default()))
                .add(deconv_bn_relu(&vs, "deconv2", 32, 16, 4, up(2, 1)))
                .add(nn::conv_transpose2d(&vs / "deconv_out", 16, config.output_dim, 4, out_cfg))
        };
        Self { fc, layers, config }
    }

    pub fn forward_t(&self, code: &Tensor, train: bool) -> Tensor {
        let side = self.config.grid_side;
        code.apply(&self.fc)
            .relu()
            .view([-1, 2 * self.config.code_length, side, side])
            .apply_t(&self.layers, train)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ResDecoderConfig {
    pub input_channels: i64,
    pub hidden_size: i64,
    pub output_dim: i64,
    pub last_layer_bias: f64,
}

impl Default for ResDecoderConfig {
    fn default() -> Self {
        Self { input_channels: 4, hidden_size: 256, output_dim: 30, last_layer_bias: 0.0 }
    }
}

/// Residual decoder upsampling a spatial latent grid by four.
#[derive(Debug)]
pub struct ResDecoder {
    layers: nn::SequentialT,
    pub config: ResDecoderConfig,
}

impl ResDecoder {
    pub fn new(vs: nn::Path, config: ResDecoderConfig) -> Self {
        let hidden = config.hidden_size;
        let out_cfg = nn::ConvTransposeConfig {
            stride: 2,
            padding: 1,
            bs_init: nn::Init::Const(config.last_layer_bias),
            ..Default::default()
        };
        let layers = nn::seq_t()
            .add(nn::conv2d(&vs / "conv_in", config.input_channels, hidden, 1, Default::default()))
            .add(ResBlock::new(&vs / "res1", hidden))
            .add(ResBlock::new(&vs / "res2", hidden))
            .add_fn(|xs| xs.relu())
            .add(deconv_bn_relu(&vs, "deconv1", hidden, hidden, 4, up(2, 1)))
            .add(nn::conv_transpose2d(&vs / "deconv_out", hidden, config.output_dim, 4, out_cfg));
        Self { layers, config }
    }

    pub fn forward_t(&self, grid: &Tensor, train: bool) -> Tensor {
        grid.apply_t(&self.layers, train)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{nn::VarStore, Device, Kind};

    #[test]
    fn test_deconv_decoder_shapes() {
        let vs = VarStore::new(Device::Cpu);
        let config = DeconvDecoderConfig {
            code_length: 8,
            encoder_output_size: 784,
            grid_side: 7,
            output_dim: 1,
            last_layer_bias: 0.5,
            large: false,
        };
        let decoder = DeconvDecoder::new(vs.root(), config);
        let code = Tensor::randn([3, 8], (Kind::Float, Device::Cpu));
        assert_eq!(decoder.forward_t(&code, true).size(), vec![3, 1, 28, 28]);
    }

    #[test]
    fn test_large_deconv_decoder_shapes() {
        let vs = VarStore::new(Device::Cpu);
        let config = DeconvDecoderConfig {
            code_length: 8,
            encoder_output_size: 256,
            grid_side: 4,
            output_dim: 30,
            last_layer_bias: 0.0,
            large: true,
        };
        let decoder = DeconvDecoder::new(vs.root(), config);
        let code = Tensor::randn([2, 8], (Kind::Float, Device::Cpu));
        assert_eq!(decoder.forward_t(&code, false).size(), vec![2, 30, 28, 28]);
    }

    #[test]
    fn test_res_decoder_shapes() {
        let vs = VarStore::new(Device::Cpu);
        let config = ResDecoderConfig { input_channels: 4, hidden_size: 16, output_dim: 6, last_layer_bias: 0.0 };
        let decoder = ResDecoder::new(vs.root(), config);
        let grid = Tensor::randn([2, 4, 7, 7], (Kind::Float, Device::Cpu));
        assert_eq!(decoder.forward_t(&grid, true).size(), vec![2, 6, 28, 28]);
    }
}
