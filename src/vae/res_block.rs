use tch::{nn, nn::ModuleT, Tensor};

/// `x + BN(conv1x1(ReLU(BN(conv3x3(ReLU(x))))))`
#[derive(Debug)]
pub struct ResBlock {
    conv1: nn::Conv2D,
    norm1: nn::BatchNorm,
    conv2: nn::Conv2D,
    norm2: nn::BatchNorm,
}

impl ResBlock {
    pub fn new(vs: nn::Path, dim: i64) -> Self {
        let conv_cfg = nn::ConvConfig { padding: 1, ..Default::default() };
        let conv1 = nn::conv2d(&vs / "conv1", dim, dim, 3, conv_cfg);
        let norm1 = nn::batch_norm2d(&vs / "norm1", dim, Default::default());
        let conv2 = nn::conv2d(&vs / "conv2", dim, dim, 1, Default::default());
        let norm2 = nn::batch_norm2d(&vs / "norm2", dim, Default::default());
        Self { conv1, norm1, conv2, norm2 }
    }
}

impl ModuleT for ResBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let ys = xs
            .relu()
            .apply(&self.conv1)
            .apply_t(&self.norm1, train)
            .relu()
            .apply(&self.conv2)
            .apply_t(&self.norm2, train);
        xs + ys
    }
}
