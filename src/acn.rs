//! # Associative Compression Network trainer
//!
//! Ties the encoder/decoder, the neighbour-conditioned prior, the code table
//! and its KNN index together and runs the training and validation phases.
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use tch::{nn, nn::OptimizerConfig, Device, Kind, Tensor};
use tracing::{debug, info, warn};

use crate::{
    checkpoint::{self, RunInfo},
    data::{Batch, DataSplits, ImageDataset},
    error::{AcnError, Result},
    losses::{commitment_loss, kl_loss, vq_loss, LossTotals},
    prior::{CodeTable, KnnIndex, PriorNetwork},
    utils::{checkpoint_filename, count_nan, is_finite, output_filename, run_name, save_image_grid},
    vae::{reparameterize, AcnModel, DecoderOutput, LatentCodec},
};

pub mod builder;
pub mod config;

use self::config::AcnConfig;

/// Images kept from one batch for plotting.
const NUM_PLOT: i64 = 10;
const LOG_EVERY: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Train,
    Valid,
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Train => "train",
            Phase::Valid => "valid",
        }
    }

    pub fn is_train(&self) -> bool {
        *self == Phase::Train
    }
}

/// Tensors of one forward pass.
#[derive(Debug)]
pub struct ForwardOutput {
    /// Input after dropout, also the context of autoregressive decoders.
    pub data: Tensor,
    pub target: Tensor,
    pub u_q: Tensor,
    /// Posterior log standard deviation.
    pub s_q: Tensor,
    pub u_p: Tensor,
    pub s_p: Tensor,
    pub decoded: DecoderOutput,
}

/// Target and reconstruction images in `[0, 1]`.
#[derive(Debug)]
pub struct Example {
    pub target: Tensor,
    pub reconstruction: Tensor,
}

impl Example {
    /// Targets on the first row, reconstructions on the second.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let n = self.target.size()[0];
        save_image_grid(&Tensor::cat(&[&self.target, &self.reconstruction], 0), n, path)
    }
}

#[derive(Debug)]
pub struct PhaseResult {
    /// Per-example loss averages.
    pub losses: BTreeMap<String, f64>,
    pub example: Option<Example>,
}

pub struct Acn {
    pub config: AcnConfig,
    pub device: Device,
    pub vs: nn::VarStore,
    pub model: AcnModel,
    pub prior: PriorNetwork,
    pub table: CodeTable,
    pub knn: KnnIndex,
    pub info: RunInfo,
    opt: nn::Optimizer,
    zero_log_std: Option<Tensor>,
}

impl std::fmt::Debug for Acn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acn")
            .field("config", &self.config)
            .field("device", &self.device)
            .field("model", &self.model)
            .field("knn", &self.knn)
            .finish()
    }
}

impl Acn {
    pub(crate) fn new(
        config: AcnConfig,
        vs: nn::VarStore,
        model: AcnModel,
        prior: PriorNetwork,
        table: CodeTable,
        info: RunInfo,
    ) -> Result<Self> {
        let opt = nn::Adam::default().build(&vs, config.lr)?;
        let mut knn = KnnIndex::new(config.knn_threads)?;
        knn.refit(&table);
        Ok(Self { device: vs.device(), config, vs, model, prior, table, knn, info, opt, zero_log_std: None })
    }

    /// Zero log standard deviation for posteriors without a variance head,
    /// reallocated whenever the batch size changes.
    pub fn zero_log_std(&mut self, batch_size: i64) -> Tensor {
        if let Some(zeros) = &self.zero_log_std {
            if zeros.size()[0] == batch_size {
                return zeros.shallow_clone();
            }
        }
        debug!("allocating zero log std for batch size {batch_size}");
        let zeros = Tensor::zeros([batch_size, self.config.code_length], (Kind::Float, self.device));
        self.zero_log_std = Some(zeros.shallow_clone());
        zeros
    }

    /// Posterior means of `images` in evaluation mode.
    pub fn encode(&self, images: &Tensor) -> Tensor {
        let _no_grad = tch::no_grad_guard();
        self.model.encode(&images.to_device(self.device), false).mu
    }

    pub fn forward_pass(&mut self, batch: &Batch, phase: Phase) -> Result<ForwardOutput> {
        let train = phase.is_train();
        let target = batch.images.to_device(self.device);
        let bs = target.size()[0];
        // input dropout stays active in every phase
        let data = target.dropout(self.config.dropout, true);
        let posterior = self.model.encode(&data, train);
        let (logvar, s_q) = match posterior.logvar {
            Some(logvar) => {
                let s_q = &logvar * 0.5;
                (logvar, s_q)
            }
            None => {
                let zeros = self.zero_log_std(bs);
                (zeros.shallow_clone(), zeros)
            }
        };
        let z = reparameterize(&posterior.mu, &logvar, train);
        let u_q = posterior.mu.view([bs, self.config.code_length]);
        if train {
            self.table.update(&batch.indices, &u_q.detach())?;
            self.knn.refit(&self.table);
        }
        let decoded = self.model.decode(&z, &data, train);
        let (u_p, s_p) = self.prior.forward(&self.knn, &u_q.detach(), train)?;
        Ok(ForwardOutput { data, target, u_q, s_q, u_p, s_p, decoded })
    }

    /// Named loss terms of one forward pass; `"loss"` is their sum.
    fn losses(&self, out: &ForwardOutput) -> Vec<(String, Tensor)> {
        let cfg = &self.config;
        let kl = kl_loss(&out.u_q, &out.s_q, &out.u_p, &out.s_p, cfg.reduction);
        let rec = cfg.rec_loss.loss(&out.decoded.logits, &out.target, cfg.nr_logistic_mix, cfg.reduction);
        let mut loss = &kl + &rec;
        let mut terms = vec![("kl".to_string(), kl), (format!("rec_{}", cfg.rec_loss.name()), rec)];
        if let Some(quantized) = &out.decoded.vq {
            let vq = vq_loss(&quantized.vq.z_q_x, &quantized.z_e_x, cfg.reduction);
            let commit =
                commitment_loss(&quantized.z_e_x, &quantized.vq.z_q_x, cfg.vq_commitment_beta, cfg.reduction);
            loss = loss + &vq + &commit;
            terms.push(("vq".to_string(), vq));
            terms.push(("commit".to_string(), commit));
        }
        terms.push(("loss".to_string(), loss));
        terms
    }

    fn example(&self, out: &ForwardOutput) -> Example {
        let cfg = &self.config;
        let n = out.target.size()[0].min(NUM_PLOT);
        let sampled = cfg.rec_loss.sample(&out.decoded.logits.detach(), cfg.nr_logistic_mix, cfg.sample_mean);
        Example {
            target: cfg.rec_loss.rescale_inv(&out.target.narrow(0, 0, n)).to_device(Device::Cpu),
            reconstruction: cfg.rec_loss.rescale_inv(&sampled.narrow(0, 0, n)).to_device(Device::Cpu),
        }
    }

    /// One pass over `data`. Training batches update the code table and take
    /// one clipped Adam step; validation batches run without gradients.
    pub fn run(&mut self, data: &ImageDataset, phase: Phase) -> Result<PhaseResult> {
        let _no_grad = (!phase.is_train()).then(tch::no_grad_guard);
        let num_batches = data.num_batches(self.config.batch_size);
        let example_batch = num_batches.saturating_sub(2);
        let mut totals = LossTotals::default();
        let mut example = None;
        for (idx, batch) in data.batches(self.config.batch_size, phase.is_train()).enumerate() {
            let out = self.forward_pass(&batch, phase)?;
            let terms = self.losses(&out);
            let loss = &terms[terms.len() - 1].1;
            if !is_finite(loss) {
                warn!("{} NaN posterior means in batch {idx}", count_nan(&out.u_q));
                return Err(AcnError::NonFiniteLoss {
                    phase: phase.name().to_string(),
                    batch: idx,
                    value: loss.double_value(&[]),
                });
            }
            for (name, value) in terms.iter() {
                totals.add(name, value.double_value(&[]));
            }
            totals.add_examples(out.target.size()[0]);
            if phase.is_train() {
                self.opt.backward_step_clip(loss, self.config.grad_clip);
            }
            if idx == example_batch {
                example = Some(self.example(&out));
            }
            if idx % LOG_EVERY == 0 {
                debug!("{} {} batch {idx}/{num_batches} {:?}", phase.name(), self.info.train_cnt, totals.averages());
            }
        }
        let losses = totals.averages();
        info!("finished {} at cnt {}: {:?}", phase.name(), self.info.train_cnt, losses);
        Ok(PhaseResult { losses, example })
    }

    /// Trains until `num_examples_to_train` examples have been seen, validating
    /// and checkpointing after the first epoch and every `save_every_epochs`.
    pub fn train(&mut self, data: &DataSplits) -> Result<()> {
        self.write_config()?;
        while self.info.train_cnt < self.config.num_examples_to_train {
            let train = self.run(&data.train, Phase::Train)?;
            self.info.epoch_cnt += 1;
            self.info.train_cnt += self.info.size_training_set;
            let epoch = self.info.epoch_cnt;
            if epoch == 1 || epoch % self.config.save_every_epochs == 0 {
                info!("starting valid phase after epoch {epoch}");
                let valid = self.run(&data.valid, Phase::Valid)?;
                self.info.record(&train.losses, &valid.losses);
                let path = checkpoint_filename(&self.info.base_filepath, self.info.train_cnt);
                self.save(&path)?;
                if let Some(example) = train.example {
                    example.save(output_filename(&path, "_train_rec.png"))?;
                }
                if let Some(example) = valid.example {
                    example.save(output_filename(&path, "_valid_rec.png"))?;
                }
            }
        }
        Ok(())
    }

    /// Writes the run configuration to `<base_filepath>/<run>_config.toml`.
    pub fn write_config(&self) -> Result<PathBuf> {
        let base = Path::new(&self.info.base_filepath);
        fs::create_dir_all(base)?;
        let path = base.join(format!("{}_config.toml", run_name(base)));
        fs::write(&path, self.config.to_toml()?)?;
        info!("wrote {}", path.display());
        Ok(path)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        checkpoint::save(path, &self.vs, &self.table, &self.info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{acn::builder::AcnBuilder, model_kind::ModelKind};

    fn tiny_config(architecture: ModelKind) -> AcnConfig {
        let code_length = 196;
        AcnConfig {
            architecture,
            batch_size: 4,
            code_length,
            encoder_output_size: architecture.encoder_output_size(code_length, 28, 28),
            hidden_size: 8,
            prior_hidden_size: 16,
            num_vqk: 8,
            num_z: 4,
            pixel_cnn_dim: 8,
            num_pcnn_layers: 2,
            output_projection_size: 4,
            nr_logistic_mix: 2,
            num_k: 2,
            knn_threads: 1,
            num_threads: 1,
            ..Default::default()
        }
    }

    fn toy_data(n: i64) -> ImageDataset {
        let images = Tensor::rand([n, 1, 28, 28], (Kind::Float, Device::Cpu)) * 2. - 1.;
        let labels = Tensor::zeros([n], (Kind::Int64, Device::Cpu));
        ImageDataset::new(images, labels)
    }

    #[test]
    fn test_zero_log_std_follows_batch_size() {
        let data = toy_data(6);
        let mut acn = AcnBuilder::new(tiny_config(ModelKind::Residual)).build((1, 28, 28), data.len()).unwrap();
        assert_eq!(acn.zero_log_std(4).size(), vec![4, 196]);
        assert_eq!(acn.zero_log_std(4).size(), vec![4, 196]);
        assert_eq!(acn.zero_log_std(2).size(), vec![2, 196]);
        assert_eq!(acn.zero_log_std(4).sum(Kind::Float).double_value(&[]), 0.);
    }

    #[test]
    fn test_validation_leaves_table_untouched() {
        tch::manual_seed(0);
        let train = toy_data(6);
        let valid = toy_data(5);
        let mut acn = AcnBuilder::new(tiny_config(ModelKind::VqResidual)).build((1, 28, 28), train.len()).unwrap();
        let before = acn.table.clone();
        let result = acn.run(&valid, Phase::Valid).unwrap();
        assert_eq!(acn.table.as_slice(), before.as_slice());
        for name in ["kl", "rec_dml", "vq", "commit", "loss"] {
            assert!(result.losses.contains_key(name), "{name}");
        }
        assert!(result.example.is_some());
    }

    #[test]
    fn test_training_writes_batch_codes() {
        tch::manual_seed(0);
        let train = toy_data(6);
        let mut acn = AcnBuilder::new(tiny_config(ModelKind::Deconv)).build((1, 28, 28), train.len()).unwrap();
        let before = acn.table.clone();
        let batch = train.batches(3, false).next().unwrap();
        let out = acn.forward_pass(&batch, Phase::Train).unwrap();
        let codes = Vec::<f32>::try_from(&out.u_q.detach().view(-1)).unwrap();
        assert_eq!(&acn.table.as_slice()[..3 * 196], codes.as_slice());
        assert_eq!(&acn.table.as_slice()[3 * 196..], &before.as_slice()[3 * 196..]);
        assert_eq!(out.u_p.size(), vec![3, 196]);
        assert_eq!(out.s_q.size(), vec![3, 196]);
    }

    #[test]
    fn test_train_writes_checkpoint() {
        tch::manual_seed(0);
        let dir = std::env::temp_dir().join(format!("acn_train_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let config = AcnConfig {
            model_savedir: dir.to_string_lossy().into_owned(),
            num_examples_to_train: 6,
            ..tiny_config(ModelKind::Residual)
        };
        let data = DataSplits { train: toy_data(6), valid: toy_data(4) };
        let mut acn = AcnBuilder::new(config).build((1, 28, 28), data.train.len()).unwrap();
        acn.train(&data).unwrap();
        assert_eq!(acn.info.epoch_cnt, 1);
        assert_eq!(acn.info.train_cnts, vec![6]);
        let latest = checkpoint::latest_in(&acn.info.base_filepath).unwrap().unwrap();
        assert!(latest.to_string_lossy().ends_with("_0000000006ex.safetensors"));
        let base = Path::new(&acn.info.base_filepath);
        let written = AcnConfig::from_file(base.join(format!("{}_config.toml", run_name(base)))).unwrap();
        assert_eq!(written, acn.config);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_diverged_loss_aborts_before_any_step() {
        tch::manual_seed(0);
        let dir = std::env::temp_dir().join(format!("acn_nan_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let config = AcnConfig {
            model_savedir: dir.to_string_lossy().into_owned(),
            num_examples_to_train: 6,
            ..tiny_config(ModelKind::Residual)
        };
        let data = DataSplits { train: toy_data(6), valid: toy_data(4) };
        let mut acn = AcnBuilder::new(config).build((1, 28, 28), data.train.len()).unwrap();
        let poisoned = "prior.fc1.weight";
        let mut variables = acn.vs.variables();
        tch::no_grad(|| {
            variables.get_mut(poisoned).unwrap().fill_(f64::NAN);
        });
        let trainable: Vec<(String, Tensor)> = acn
            .vs
            .variables()
            .into_iter()
            .filter(|(name, var)| name != poisoned && var.requires_grad())
            .map(|(name, var)| (name, var.copy()))
            .collect();
        assert!(!trainable.is_empty());

        let err = acn.run(&data.train, Phase::Train).unwrap_err();
        assert!(matches!(err, AcnError::NonFiniteLoss { batch: 0, .. }), "{err}");
        let after = acn.vs.variables();
        for (name, before) in trainable.iter() {
            assert!(after[name].equal(before), "{name} was updated");
        }

        assert!(matches!(acn.train(&data), Err(AcnError::NonFiniteLoss { .. })));
        assert_eq!(acn.info.epoch_cnt, 0);
        assert_eq!(checkpoint::latest_in(&acn.info.base_filepath).unwrap(), None);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
