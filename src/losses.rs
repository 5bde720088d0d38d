//! # Loss composition
//!
//! The ACN objective is the KL divergence between the posterior and the
//! neighbour-conditioned prior, plus a reconstruction term, plus the codebook
//! and commitment terms when the bottleneck is vector-quantized.
use std::collections::BTreeMap;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tch::{Kind, Reduction, Tensor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum LossReduction {
    Sum,
    Mean,
}

impl LossReduction {
    pub fn reduce(&self, xs: &Tensor) -> Tensor {
        match self {
            LossReduction::Sum => xs.sum(Kind::Float),
            LossReduction::Mean => xs.mean(Kind::Float),
        }
    }

    pub fn to_tch(&self) -> Reduction {
        match self {
            LossReduction::Sum => Reduction::Sum,
            LossReduction::Mean => Reduction::Mean,
        }
    }
}

/// How reconstructions are scored and how pixels are drawn from the decoder output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum RecLossType {
    /// Per-pixel Bernoulli cross-entropy, data in `[0, 1]`.
    Bce,
    /// Discretized mixture of logistics, data in `[-1, 1]`.
    Dml,
}

impl RecLossType {
    pub fn name(&self) -> &'static str {
        match self {
            RecLossType::Bce => "bce",
            RecLossType::Dml => "dml",
        }
    }

    /// Number of decoder output channels for images with `channels` channels.
    pub fn output_dim(&self, channels: i64, nr_mix: i64) -> i64 {
        match self {
            RecLossType::Bce => channels,
            RecLossType::Dml => 3 * nr_mix * channels,
        }
    }

    /// Initial bias of the decoder's last layer.
    pub fn last_layer_bias(&self) -> f64 {
        match self {
            RecLossType::Bce => 0.5,
            RecLossType::Dml => 0.0,
        }
    }

    /// Maps `[0, 1]` pixel data into the domain of the loss.
    pub fn rescale(&self, xs: &Tensor) -> Tensor {
        match self {
            RecLossType::Bce => xs.shallow_clone(),
            RecLossType::Dml => (xs - 0.5) * 2.,
        }
    }

    pub fn rescale_inv(&self, xs: &Tensor) -> Tensor {
        match self {
            RecLossType::Bce => xs.shallow_clone(),
            RecLossType::Dml => xs * 0.5 + 0.5,
        }
    }

    pub fn loss(&self, prediction: &Tensor, target: &Tensor, nr_mix: i64, reduction: LossReduction) -> Tensor {
        match self {
            RecLossType::Bce => prediction.binary_cross_entropy_with_logits::<Tensor>(
                target,
                None,
                None,
                reduction.to_tch(),
            ),
            RecLossType::Dml => discretized_mix_logistic_loss(prediction, target, nr_mix, reduction),
        }
    }

    /// Draws an image in the loss domain from a decoder output.
    pub fn sample(&self, prediction: &Tensor, nr_mix: i64, only_mean: bool) -> Tensor {
        match self {
            RecLossType::Bce => {
                let probs = prediction.sigmoid();
                if only_mean {
                    probs
                } else {
                    probs.bernoulli()
                }
            }
            RecLossType::Dml => sample_from_discretized_mix_logistic(prediction, nr_mix, only_mean),
        }
    }
}

/// KL divergence between the diagonal Gaussians `N(u_q, exp(s_q))` and
/// `N(u_p, exp(s_p))`, where `s_q` and `s_p` are log standard deviations.
pub fn kl_loss(u_q: &Tensor, s_q: &Tensor, u_p: &Tensor, s_p: &Tensor, reduction: LossReduction) -> Tensor {
    let kl = s_p - s_q - 0.5
        + ((s_q * 2.).exp() + (u_q - u_p).square()) / ((s_p * 2.).exp() * 2.);
    reduction.reduce(&kl)
}

/// Codebook loss: moves the selected embeddings towards the (fixed) encoder outputs.
pub fn vq_loss(z_q_x: &Tensor, z_e_x: &Tensor, reduction: LossReduction) -> Tensor {
    z_q_x.mse_loss(&z_e_x.detach(), reduction.to_tch())
}

/// Commitment loss: keeps the encoder outputs close to their (fixed) embeddings.
pub fn commitment_loss(z_e_x: &Tensor, z_q_x: &Tensor, beta: f64, reduction: LossReduction) -> Tensor {
    z_e_x.mse_loss(&z_q_x.detach(), reduction.to_tch()) * beta
}

/// Splits a `[B, C * 3 * nr_mix, H, W]` prediction into mixture logits, means
/// and clamped log scales, each `[B, C, nr_mix, H, W]`.
fn split_mixture(prediction: &Tensor, nr_mix: i64) -> (Tensor, Tensor, Tensor) {
    let size = prediction.size();
    let (b, h, w) = (size[0], size[2], size[3]);
    let channels = size[1] / (3 * nr_mix);
    let params = prediction.view([b, channels, 3 * nr_mix, h, w]);
    let logit_probs = params.narrow(2, 0, nr_mix);
    let means = params.narrow(2, nr_mix, nr_mix);
    let log_scales = params.narrow(2, 2 * nr_mix, nr_mix).clamp_min(-7.);
    (logit_probs, means, log_scales)
}

/// Negative log-likelihood of `target` (values in `[-1, 1]`, 8-bit quantized)
/// under a per-channel discretized mixture of logistics.
pub fn discretized_mix_logistic_loss(
    prediction: &Tensor,
    target: &Tensor,
    nr_mix: i64,
    reduction: LossReduction,
) -> Tensor {
    let (logit_probs, means, log_scales) = split_mixture(prediction, nr_mix);
    let x = target.unsqueeze(2);
    let centered = &x - &means;
    let inv_stdv = (-&log_scales).exp();
    let plus_in = &inv_stdv * (&centered + 1. / 255.);
    let cdf_plus = plus_in.sigmoid();
    let min_in = &inv_stdv * (&centered - 1. / 255.);
    let cdf_min = min_in.sigmoid();
    // log probability for the edge cases of 0 and 255
    let log_cdf_plus = &plus_in - plus_in.softplus();
    let log_one_minus_cdf_min = -min_in.softplus();
    let cdf_delta = cdf_plus - cdf_min;
    let mid_in = &inv_stdv * &centered;
    let log_pdf_mid = &mid_in - &log_scales - mid_in.softplus() * 2.;

    let inner = cdf_delta
        .clamp_min(1e-12)
        .log()
        .where_self(&cdf_delta.gt(1e-5), &(log_pdf_mid - 127.5f64.ln()));
    let inner = log_one_minus_cdf_min.where_self(&x.gt(0.999), &inner);
    let log_probs = log_cdf_plus.where_self(&x.lt(-0.999), &inner);
    let log_probs = log_probs + logit_probs.log_softmax(2, Kind::Float);
    let nll = -log_probs.logsumexp([2], false);
    reduction.reduce(&nll)
}

/// Samples `[B, C, H, W]` pixels in `[-1, 1]`. The mixture component is picked
/// with the Gumbel-max trick; `only_mean` returns its mean instead of adding
/// logistic noise.
pub fn sample_from_discretized_mix_logistic(prediction: &Tensor, nr_mix: i64, only_mean: bool) -> Tensor {
    let (logit_probs, means, log_scales) = split_mixture(prediction, nr_mix);
    let u = Tensor::rand_like(&logit_probs).clamp(1e-5, 1. - 1e-5);
    let selected = (logit_probs - (-u.log()).log()).argmax(2, true);
    let means = means.gather(2, &selected, false).squeeze_dim(2);
    if only_mean {
        return means.clamp(-1., 1.);
    }
    let log_scales = log_scales.gather(2, &selected, false).squeeze_dim(2);
    let u = Tensor::rand_like(&means).clamp(1e-5, 1. - 1e-5);
    let x = means + log_scales.exp() * (u.log() - (-u + 1.).log());
    x.clamp(-1., 1.)
}

/// Running per-example loss sums for one phase.
#[derive(Debug, Clone, Default)]
pub struct LossTotals {
    pub running: i64,
    sums: BTreeMap<String, f64>,
}

impl LossTotals {
    pub fn add(&mut self, name: &str, value: f64) {
        *self.sums.entry(name.to_string()).or_insert(0.) += value;
    }

    pub fn add_examples(&mut self, n: i64) {
        self.running += n;
    }

    /// Sums divided by the number of examples seen so far.
    pub fn averages(&self) -> BTreeMap<String, f64> {
        let running = self.running.max(1) as f64;
        self.sums.iter().map(|(k, v)| (k.clone(), v / running)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    #[test]
    fn test_kl_zero_for_identical_gaussians() {
        let u = Tensor::randn([4, 8], (Kind::Float, Device::Cpu));
        let s = Tensor::randn([4, 8], (Kind::Float, Device::Cpu)) * 0.1;
        let kl = kl_loss(&u, &s, &u, &s, LossReduction::Sum);
        assert!(kl.double_value(&[]).abs() < 1e-5);
    }

    #[test]
    fn test_kl_unit_posterior() {
        // KL(N(1, 1) || N(0, 1)) = 0.5 per dimension
        let u_q = Tensor::ones([2, 3], (Kind::Float, Device::Cpu));
        let zeros = Tensor::zeros([2, 3], (Kind::Float, Device::Cpu));
        let kl = kl_loss(&u_q, &zeros, &zeros, &zeros, LossReduction::Mean);
        assert!((kl.double_value(&[]) - 0.5).abs() < 1e-6);
        let kl = kl_loss(&u_q, &zeros, &zeros, &zeros, LossReduction::Sum);
        assert!((kl.double_value(&[]) - 3.).abs() < 1e-5);
    }

    #[test]
    fn test_dml_loss_is_finite_and_positive() {
        let nr_mix = 3;
        let prediction = Tensor::randn([2, 3 * nr_mix, 5, 5], (Kind::Float, Device::Cpu));
        let target = Tensor::rand([2, 1, 5, 5], (Kind::Float, Device::Cpu)) * 2. - 1.;
        let loss = discretized_mix_logistic_loss(&prediction, &target, nr_mix, LossReduction::Sum);
        let loss = loss.double_value(&[]);
        assert!(loss.is_finite());
        assert!(loss > 0.);
    }

    #[test]
    fn test_dml_prefers_matching_means() {
        let nr_mix = 1;
        let target = Tensor::full([1, 1, 2, 2], 0.5, (Kind::Float, Device::Cpu));
        let build = |mean: f64| {
            Tensor::cat(
                &[
                    Tensor::zeros([1, 1, 2, 2], (Kind::Float, Device::Cpu)),
                    Tensor::full([1, 1, 2, 2], mean, (Kind::Float, Device::Cpu)),
                    Tensor::full([1, 1, 2, 2], -4., (Kind::Float, Device::Cpu)),
                ],
                1,
            )
        };
        let near = discretized_mix_logistic_loss(&build(0.5), &target, nr_mix, LossReduction::Sum);
        let far = discretized_mix_logistic_loss(&build(-0.5), &target, nr_mix, LossReduction::Sum);
        assert!(near.double_value(&[]) < far.double_value(&[]));
    }

    #[test]
    fn test_dml_sample_range_and_shape() {
        let nr_mix = 4;
        let prediction = Tensor::randn([3, 3 * nr_mix, 6, 6], (Kind::Float, Device::Cpu)) * 3.;
        for only_mean in [true, false] {
            let sample = sample_from_discretized_mix_logistic(&prediction, nr_mix, only_mean);
            assert_eq!(sample.size(), vec![3, 1, 6, 6]);
            assert!(sample.max().double_value(&[]) <= 1.);
            assert!(sample.min().double_value(&[]) >= -1.);
        }
    }

    #[test]
    fn test_rescale_roundtrip() {
        let xs = Tensor::from_slice(&[0f32, 0.25, 1.]);
        let scaled = RecLossType::Dml.rescale(&xs);
        assert_eq!(Vec::<f32>::try_from(&scaled).unwrap(), vec![-1., -0.5, 1.]);
        let back = RecLossType::Dml.rescale_inv(&scaled);
        assert!(back.equal(&xs));
        assert_eq!(RecLossType::Dml.output_dim(1, 10), 30);
        assert_eq!(RecLossType::Bce.output_dim(1, 10), 1);
    }

    #[test]
    fn test_loss_totals_average_per_example() {
        let mut totals = LossTotals::default();
        totals.add_examples(4);
        totals.add("kl", 8.);
        totals.add_examples(4);
        totals.add("kl", 8.);
        assert_eq!(totals.averages()["kl"], 2.);
    }
}
