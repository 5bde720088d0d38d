use std::path::{Path, PathBuf};

use tch::nn;
use tracing::info;

use super::{config::AcnConfig, Acn};
use crate::{
    checkpoint::{Checkpoint, RunInfo},
    error::{AcnError, Result},
    prior::{CodeTable, PriorNetwork, PriorNetworkConfig},
    utils::get_device,
    vae::AcnModel,
};

/// Builds a trainer from a configuration, optionally resuming a checkpoint.
#[derive(Debug, Clone)]
pub struct AcnBuilder {
    config: AcnConfig,
    model_loadpath: Option<PathBuf>,
}

impl AcnBuilder {
    pub fn new(config: AcnConfig) -> Self {
        Self { config, model_loadpath: None }
    }

    /// Resumes from the checkpoint at `path`.
    pub fn load<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.model_loadpath = Some(path.as_ref().to_path_buf());
        self
    }

    /// Builds every model for images of `image_shape` and a training set of
    /// `size_training_set` examples.
    pub fn build(self, image_shape: (i64, i64, i64), size_training_set: usize) -> Result<Acn> {
        let checkpoint = match &self.model_loadpath {
            Some(path) => {
                info!("loading checkpoint {}", path.display());
                Some(Checkpoint::load(path)?)
            }
            None => None,
        };
        let config = match &checkpoint {
            Some(checkpoint) => self.config.merge_resume(&checkpoint.info.config),
            None => self.config,
        };
        config.validate(image_shape)?;
        if size_training_set == 0 {
            return Err(AcnError::Config("the training set is empty".to_string()));
        }
        if config.num_k > size_training_set {
            return Err(AcnError::Config(format!(
                "num_k {} exceeds the {size_training_set} training examples",
                config.num_k
            )));
        }
        tch::manual_seed(config.seed);
        tch::set_num_threads(config.num_threads as i32);

        let device = get_device(config.cuda);
        let mut vs = nn::VarStore::new(device);
        let (_, height, width) = image_shape;
        let model = AcnModel::new(&vs.root() / "acn", &config, height, width)?;
        let prior_config = PriorNetworkConfig {
            code_length: config.code_length,
            n_hidden: config.prior_hidden_size,
            k: config.num_k,
            seed: config.prior_seed,
        };
        let prior = PriorNetwork::new(&vs.root() / "prior", prior_config);

        let (table, info) = match checkpoint {
            Some(checkpoint) => {
                checkpoint.restore(&mut vs)?;
                let table = checkpoint.code_table()?;
                if table.rows() != size_training_set || table.dim() != config.code_length as usize {
                    return Err(AcnError::ShapeMismatch {
                        name: "code_table".to_string(),
                        expected: vec![size_training_set as i64, config.code_length],
                        got: vec![table.rows() as i64, table.dim() as i64],
                    });
                }
                let mut info = checkpoint.info;
                // a resumed run keeps writing next to the checkpoint it was loaded from
                if let Some(dir) = checkpoint.path.parent() {
                    info.base_filepath = dir.to_string_lossy().into_owned();
                }
                info.config = config.clone();
                info.args.push(config.clone());
                info!("resuming {} at {} examples", config.run_name(), info.train_cnt);
                (table, info)
            }
            None => {
                let table = CodeTable::new(size_training_set, config.code_length as usize, config.prior_seed);
                (table, RunInfo::new(config.clone(), size_training_set as u64))
            }
        };
        info!(
            "built {} on {:?} with {} variables",
            config.architecture.name(),
            device,
            vs.variables().len()
        );
        Acn::new(config, vs, model, prior, table, info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_kind::ModelKind;

    fn small_config(model_savedir: &Path) -> AcnConfig {
        AcnConfig {
            architecture: ModelKind::Residual,
            model_savedir: model_savedir.to_string_lossy().into_owned(),
            hidden_size: 8,
            prior_hidden_size: 16,
            knn_threads: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let config = AcnConfig { code_length: 100, ..small_config(Path::new("/tmp")) };
        assert!(matches!(AcnBuilder::new(config).build((1, 28, 28), 10), Err(AcnError::Config(_))));
    }

    #[test]
    fn test_resume_restores_state() {
        let dir = std::env::temp_dir().join(format!("acn_builder_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let mut first = AcnBuilder::new(small_config(&dir)).build((1, 28, 28), 10).unwrap();
        first.info.train_cnt = 20;
        first.info.epoch_cnt = 2;
        for (_, mut var) in first.vs.variables() {
            tch::no_grad(|| {
                var.fill_(0.25);
            });
        }
        let ones = tch::Tensor::ones([1, 196], (tch::Kind::Float, tch::Device::Cpu));
        first.table.update(&tch::Tensor::from_slice(&[3i64]), &ones).unwrap();
        let path = dir.join("resume_0000000020ex.safetensors");
        first.save(&path).unwrap();

        let flags = AcnConfig { batch_size: 7, lr: 0.5, ..small_config(&dir) };
        let resumed = AcnBuilder::new(flags).load(&path).build((1, 28, 28), 10).unwrap();
        assert_eq!(resumed.config.batch_size, 7);
        assert_eq!(resumed.config.lr, first.config.lr);
        assert_eq!(resumed.info.train_cnt, 20);
        assert_eq!(resumed.info.args.len(), 2);
        assert_eq!(resumed.table.as_slice(), first.table.as_slice());
        let (a, b) = (first.vs.variables(), resumed.vs.variables());
        for (name, var) in a.iter() {
            assert!(var.equal(&b[name]), "{name}");
        }
        assert!(AcnBuilder::new(small_config(&dir)).load(&path).build((1, 28, 28), 11).is_err());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_resume_keeps_checkpoint_directory() {
        let root = std::env::temp_dir().join(format!("acn_builder_dir_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&root);
        let run_dir = root.join("runs").join("acn_run");
        let first = AcnBuilder::new(small_config(&run_dir)).build((1, 28, 28), 10).unwrap();
        let path = crate::utils::checkpoint_filename(run_dir.to_str().unwrap(), 0);
        first.save(&path).unwrap();

        let elsewhere = root.join("elsewhere");
        let resumed = AcnBuilder::new(small_config(&elsewhere)).load(&path).build((1, 28, 28), 10).unwrap();
        assert_eq!(resumed.config.model_savedir, elsewhere.to_string_lossy());
        assert_eq!(Path::new(&resumed.info.base_filepath), run_dir.as_path());
        let next = crate::utils::checkpoint_filename(&resumed.info.base_filepath, 10);
        assert_eq!(next.parent(), path.parent());
        assert_eq!(next, run_dir.join("acn_run_0000000010ex.safetensors"));
        std::fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_build_rejects_unusable_training_sets() {
        let config = small_config(Path::new("/tmp"));
        assert!(matches!(AcnBuilder::new(config.clone()).build((1, 28, 28), 0), Err(AcnError::Config(_))));
        let config = AcnConfig { num_k: 5, ..config };
        assert!(matches!(AcnBuilder::new(config.clone()).build((1, 28, 28), 4), Err(AcnError::Config(_))));
        assert!(AcnBuilder::new(config).build((1, 28, 28), 5).is_ok());
    }
}
