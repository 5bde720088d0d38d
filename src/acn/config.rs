use std::{io::Read, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
    data::DatasetKind,
    error::{AcnError, Result},
    losses::{LossReduction, RecLossType},
    model_kind::ModelKind,
    utils::file_open,
};

/// Hyperparameters of one training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcnConfig {
    pub architecture: ModelKind,
    pub dataset: DatasetKind,
    pub base_datadir: String,
    pub model_savedir: String,
    pub exp_name: String,
    pub cuda: bool,
    pub seed: i64,
    /// Intra-op threads of the tensor backend.
    pub num_threads: i64,
    /// Neighbour search workers, all cores when 0.
    pub knn_threads: usize,
    pub save_every_epochs: u64,
    pub batch_size: usize,
    pub lr: f64,
    pub input_channels: i64,
    pub target_channels: i64,
    pub num_examples_to_train: u64,
    pub dropout: f64,
    pub reduction: LossReduction,
    pub rec_loss: RecLossType,
    pub nr_logistic_mix: i64,
    pub code_length: i64,
    pub num_k: usize,
    pub hidden_size: i64,
    pub prior_hidden_size: i64,
    pub prior_seed: u64,
    pub encoder_output_size: i64,
    pub sample_mean: bool,
    pub vq_commitment_beta: f64,
    pub num_vqk: i64,
    pub num_z: i64,
    pub pixel_cnn_dim: i64,
    pub num_pcnn_layers: i64,
    pub output_projection_size: i64,
    pub grad_clip: f64,
    pub num_walk_steps: i64,
}

impl Default for AcnConfig {
    fn default() -> Self {
        Self {
            architecture: ModelKind::VqResidual,
            dataset: DatasetKind::FashionMnist,
            base_datadir: "../dataset/".to_string(),
            model_savedir: "../model_savedir".to_string(),
            exp_name: "acn".to_string(),
            cuda: false,
            seed: 394,
            num_threads: 2,
            knn_threads: 0,
            save_every_epochs: 5,
            batch_size: 84,
            lr: 1e-4,
            input_channels: 1,
            target_channels: 1,
            num_examples_to_train: 50_000_000,
            dropout: 0.0,
            reduction: LossReduction::Sum,
            rec_loss: RecLossType::Dml,
            nr_logistic_mix: 10,
            code_length: 196,
            num_k: 5,
            hidden_size: 256,
            prior_hidden_size: 512,
            prior_seed: 4543,
            encoder_output_size: 784,
            sample_mean: false,
            vq_commitment_beta: 0.25,
            num_vqk: 512,
            num_z: 64,
            pixel_cnn_dim: 64,
            num_pcnn_layers: 8,
            output_projection_size: 32,
            grad_clip: 10.0,
            num_walk_steps: 40,
        }
    }
}

fn check(ok: bool, message: impl FnOnce() -> String) -> Result<()> {
    if ok {
        Ok(())
    } else {
        Err(AcnError::Config(message()))
    }
}

impl AcnConfig {
    pub fn from_file<T: AsRef<std::path::Path>>(path: T) -> Result<Self> {
        let mut file = String::new();
        file_open(path)?.read_to_string(&mut file)?;
        let cfg: AcnConfig = toml::from_str(&file)?;
        Ok(cfg)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string(self)?)
    }

    /// `<exp_name>_<dataset>_<architecture>_<rec_loss>`
    pub fn run_name(&self) -> String {
        format!(
            "{}_{}_{}_{}",
            self.exp_name,
            self.dataset.name(),
            self.architecture.name(),
            self.rec_loss.name()
        )
    }

    /// Directory, and file name prefix, of this run's checkpoints.
    pub fn base_filepath(&self) -> PathBuf {
        PathBuf::from(&self.model_savedir).join(self.run_name())
    }

    /// Checks that the hyperparameters describe a buildable model for images of
    /// `(channels, height, width)`.
    pub fn validate(&self, image_shape: (i64, i64, i64)) -> Result<()> {
        let (channels, height, width) = image_shape;
        check(self.batch_size > 0, || "batch_size must be positive".to_string())?;
        check(self.code_length > 0, || "code_length must be positive".to_string())?;
        check(self.num_k > 0, || "num_k must be positive".to_string())?;
        check(self.save_every_epochs > 0, || "save_every_epochs must be positive".to_string())?;
        check((0.0..1.0).contains(&self.dropout), || format!("dropout {} not in [0, 1)", self.dropout))?;
        check(self.grad_clip > 0.0, || "grad_clip must be positive".to_string())?;
        check(self.input_channels == channels, || {
            format!("input_channels {} but images have {channels} channels", self.input_channels)
        })?;
        check(self.target_channels == channels, || {
            format!("target_channels {} but images have {channels} channels", self.target_channels)
        })?;
        if self.rec_loss == RecLossType::Dml {
            check(self.nr_logistic_mix > 0, || "nr_logistic_mix must be positive".to_string())?;
        }
        let kind = self.architecture;
        let side = match kind {
            ModelKind::Deconv | ModelKind::DeconvLarge => {
                let expected = kind.encoder_output_size(self.code_length, height, width);
                check(self.encoder_output_size == expected, || {
                    format!(
                        "encoder_output_size {} does not match the {expected} features {} produces",
                        self.encoder_output_size,
                        kind.name()
                    )
                })?;
                kind.decoder_grid_side(self.code_length, self.encoder_output_size)?
            }
            ModelKind::Residual | ModelKind::VqResidual | ModelKind::PixelCnn => {
                check(self.hidden_size > 0, || "hidden_size must be positive".to_string())?;
                let (_, gh, gw) = kind.latent_grid(self.code_length, height, width)?;
                check(gh == gw, || format!("latent grid {gh}x{gw} is not square"))?;
                gh
            }
        };
        if !kind.is_autoregressive() {
            let out = kind.decoder_output(side);
            check(out == height && out == width, || {
                format!("{} decodes {out}x{out} images, not {height}x{width}", kind.name())
            })?;
        }
        if kind.uses_vq() {
            check(self.num_vqk > 0 && self.num_z > 0, || "num_vqk and num_z must be positive".to_string())?;
        }
        if kind.is_autoregressive() {
            check(self.pixel_cnn_dim > 0 && self.num_pcnn_layers > 0, || {
                "pixel_cnn_dim and num_pcnn_layers must be positive".to_string()
            })?;
        }
        Ok(())
    }

    /// Configuration of a resumed run. Operational settings come from `self`
    /// (the command line); everything that shapes the model or the
    /// optimisation comes from the checkpoint.
    pub fn merge_resume(&self, checkpoint: &AcnConfig) -> AcnConfig {
        let AcnConfig {
            architecture,
            dataset,
            base_datadir,
            model_savedir: _,
            exp_name,
            cuda: _,
            seed: _,
            num_threads: _,
            knn_threads: _,
            save_every_epochs: _,
            batch_size: _,
            lr,
            input_channels,
            target_channels,
            num_examples_to_train,
            dropout,
            reduction,
            rec_loss,
            nr_logistic_mix,
            code_length,
            num_k,
            hidden_size,
            prior_hidden_size,
            prior_seed,
            encoder_output_size,
            sample_mean,
            vq_commitment_beta,
            num_vqk,
            num_z,
            pixel_cnn_dim,
            num_pcnn_layers,
            output_projection_size,
            grad_clip,
            num_walk_steps: _,
        } = checkpoint.clone();
        AcnConfig {
            architecture,
            dataset,
            base_datadir,
            model_savedir: self.model_savedir.clone(),
            exp_name,
            cuda: self.cuda,
            seed: self.seed,
            num_threads: self.num_threads,
            knn_threads: self.knn_threads,
            save_every_epochs: self.save_every_epochs,
            batch_size: self.batch_size,
            lr,
            input_channels,
            target_channels,
            num_examples_to_train,
            dropout,
            reduction,
            rec_loss,
            nr_logistic_mix,
            code_length,
            num_k,
            hidden_size,
            prior_hidden_size,
            prior_seed,
            encoder_output_size,
            sample_mean,
            vq_commitment_beta,
            num_vqk,
            num_z,
            pixel_cnn_dim,
            num_pcnn_layers,
            output_projection_size,
            grad_clip,
            num_walk_steps: self.num_walk_steps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_file_matches_defaults() {
        let cfg = AcnConfig::from_file("src/acn/config.default.toml").unwrap();
        assert_eq!(cfg, AcnConfig::default());
        cfg.validate((1, 28, 28)).unwrap();
    }

    #[test]
    fn test_toml_roundtrip_and_partial_files() {
        let cfg = AcnConfig { architecture: ModelKind::PixelCnn, batch_size: 32, ..Default::default() };
        let parsed: AcnConfig = toml::from_str(&cfg.to_toml().unwrap()).unwrap();
        assert_eq!(parsed, cfg);
        let partial: AcnConfig = toml::from_str("architecture = \"deconv\"\ncode_length = 48").unwrap();
        assert_eq!(partial.architecture, ModelKind::Deconv);
        assert_eq!(partial.batch_size, 84);
    }

    #[test]
    fn test_validate() {
        let deconv = AcnConfig {
            architecture: ModelKind::Deconv,
            code_length: 48,
            encoder_output_size: ModelKind::Deconv.encoder_output_size(48, 28, 28),
            ..Default::default()
        };
        deconv.validate((1, 28, 28)).unwrap();
        let bad_flatten = AcnConfig { encoder_output_size: 1000, ..deconv.clone() };
        assert!(matches!(bad_flatten.validate((1, 28, 28)), Err(AcnError::Config(_))));
        assert!(deconv.validate((3, 28, 28)).is_err());
        let bad_grid = AcnConfig { architecture: ModelKind::Residual, code_length: 100, ..Default::default() };
        assert!(bad_grid.validate((1, 28, 28)).is_err());
        let zero_batch = AcnConfig { batch_size: 0, ..Default::default() };
        assert!(zero_batch.validate((1, 28, 28)).is_err());
    }

    #[test]
    fn test_merge_resume_precedence() {
        let saved = AcnConfig {
            architecture: ModelKind::PixelCnn,
            lr: 2e-4,
            batch_size: 64,
            cuda: true,
            model_savedir: "/old".to_string(),
            num_walk_steps: 10,
            ..Default::default()
        };
        let flags = AcnConfig {
            architecture: ModelKind::Deconv,
            lr: 1.0,
            batch_size: 16,
            cuda: false,
            model_savedir: "/new".to_string(),
            knn_threads: 3,
            num_walk_steps: 80,
            ..Default::default()
        };
        let merged = flags.merge_resume(&saved);
        assert_eq!(merged.architecture, ModelKind::PixelCnn);
        assert_eq!(merged.lr, 2e-4);
        assert_eq!(merged.batch_size, 16);
        assert!(!merged.cuda);
        assert_eq!(merged.model_savedir, "/new");
        assert_eq!(merged.knn_threads, 3);
        assert_eq!(merged.num_walk_steps, 80);
    }

    #[test]
    fn test_run_name() {
        let cfg = AcnConfig::default();
        assert_eq!(cfg.run_name(), "acn_FashionMNIST_vq_residual_dml");
        assert_eq!(cfg.base_filepath(), PathBuf::from("../model_savedir/acn_FashionMNIST_vq_residual_dml"));
    }
}
