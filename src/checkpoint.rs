//! # Checkpoints
//!
//! A checkpoint is one safetensors archive holding every variable of the
//! model store, the code table under `code_table`, and the run metadata as a
//! TOML document in the header metadata under `info`.
use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::{Path, PathBuf},
};

use safetensors::{tensor::TensorView, Dtype, SafeTensors};
use serde::{Deserialize, Serialize};
use tch::{nn::VarStore, Device, Kind, Tensor};
use tracing::{debug, info};

use crate::{
    acn::config::AcnConfig,
    error::{AcnError, Result},
    prior::CodeTable,
    utils::to_host_vec,
};

const CODE_TABLE: &str = "code_table";
const INFO: &str = "info";
const EXTENSION: &str = "safetensors";

/// Everything about a run that is not a tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    pub base_filepath: String,
    pub size_training_set: u64,
    /// Examples trained on so far.
    pub train_cnt: u64,
    pub epoch_cnt: u64,
    /// `train_cnt` at every validation.
    pub train_cnts: Vec<u64>,
    pub config: AcnConfig,
    pub train_losses: BTreeMap<String, Vec<f64>>,
    pub valid_losses: BTreeMap<String, Vec<f64>>,
    /// Configuration of the first session and of every resume.
    pub args: Vec<AcnConfig>,
}

impl RunInfo {
    pub fn new(config: AcnConfig, size_training_set: u64) -> Self {
        Self {
            base_filepath: config.base_filepath().to_string_lossy().into_owned(),
            args: vec![config.clone()],
            config,
            size_training_set,
            train_cnt: 0,
            epoch_cnt: 0,
            train_cnts: vec![],
            train_losses: BTreeMap::new(),
            valid_losses: BTreeMap::new(),
        }
    }

    /// Appends one validation point to the loss history.
    pub fn record(&mut self, train: &BTreeMap<String, f64>, valid: &BTreeMap<String, f64>) {
        self.train_cnts.push(self.train_cnt);
        for (name, value) in train {
            self.train_losses.entry(name.clone()).or_default().push(*value);
        }
        for (name, value) in valid {
            self.valid_losses.entry(name.clone()).or_default().push(*value);
        }
    }
}

fn to_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Writes the model variables, the code table and `info` to `path`.
pub fn save<P: AsRef<Path>>(path: P, vs: &VarStore, table: &CodeTable, info: &RunInfo) -> Result<()> {
    let path = path.as_ref();
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let mut buffers: Vec<(String, Vec<usize>, Vec<u8>)> = vec![];
    for (name, var) in vs.variables() {
        let shape = var.size().iter().map(|&d| d as usize).collect();
        buffers.push((name, shape, to_bytes(&to_host_vec(&var)?)));
    }
    buffers.push((CODE_TABLE.to_string(), vec![table.rows(), table.dim()], to_bytes(table.as_slice())));
    let mut views = Vec::with_capacity(buffers.len());
    for (name, shape, bytes) in buffers.iter() {
        views.push((name.as_str(), TensorView::new(Dtype::F32, shape.clone(), bytes)?));
    }
    let metadata = Some(HashMap::from([(INFO.to_string(), toml::to_string(info)?)]));
    safetensors::serialize_to_file(views, &metadata, path)?;
    info!("saved checkpoint {}", path.display());
    Ok(())
}

#[derive(Debug)]
pub struct Checkpoint {
    pub path: PathBuf,
    pub info: RunInfo,
    tensors: HashMap<String, Tensor>,
}

impl Checkpoint {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let buffer = fs::read(path)?;
        let (_, metadata) = SafeTensors::read_metadata(&buffer)?;
        let info = metadata
            .metadata()
            .as_ref()
            .and_then(|m| m.get(INFO))
            .ok_or_else(|| AcnError::Checkpoint(format!("{} has no run info", path.display())))?;
        let info: RunInfo = toml::from_str(info)?;
        let archive = SafeTensors::deserialize(&buffer)?;
        let mut tensors = HashMap::new();
        for (name, view) in archive.tensors() {
            if view.dtype() != Dtype::F32 {
                return Err(AcnError::Checkpoint(format!("{name} is {:?}, expected F32", view.dtype())));
            }
            let shape: Vec<i64> = view.shape().iter().map(|&d| d as i64).collect();
            tensors.insert(name, Tensor::from_data_size(view.data(), &shape, Kind::Float));
        }
        debug!("read {} tensors from {}", tensors.len(), path.display());
        Ok(Self { path: path.to_path_buf(), info, tensors })
    }

    /// Copies the stored values into every variable of `vs`.
    pub fn restore(&self, vs: &mut VarStore) -> Result<()> {
        let device = vs.device();
        for (name, mut var) in vs.variables() {
            let value = self
                .tensors
                .get(&name)
                .ok_or_else(|| AcnError::Checkpoint(format!("{} misses variable {name}", self.path.display())))?;
            if value.size() != var.size() {
                return Err(AcnError::ShapeMismatch { name, expected: var.size(), got: value.size() });
            }
            tch::no_grad(|| var.copy_(&value.to_device(device)));
        }
        Ok(())
    }

    pub fn code_table(&self) -> Result<CodeTable> {
        let table = self
            .tensors
            .get(CODE_TABLE)
            .ok_or_else(|| AcnError::Checkpoint(format!("{} has no code table", self.path.display())))?;
        CodeTable::from_tensor(&table.to_device(Device::Cpu))
    }
}

/// The checkpoint with the most training examples in `dir`, if any.
pub fn latest_in<P: AsRef<Path>>(dir: P) -> Result<Option<PathBuf>> {
    let mut checkpoints = vec![];
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().map_or(false, |ext| ext == EXTENSION) {
            checkpoints.push(path);
        }
    }
    // counts are zero padded, so names sort by count
    checkpoints.sort();
    Ok(checkpoints.pop())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::checkpoint_filename;
    use tch::nn;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("acn_checkpoint_{name}_{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = scratch_dir("roundtrip");
        let vs = VarStore::new(Device::Cpu);
        let _linear = nn::linear(vs.root() / "fc", 3, 2, Default::default());
        let table = CodeTable::new(5, 2, 1);
        let mut info = RunInfo::new(AcnConfig::default(), 5);
        info.train_cnt = 10;
        info.record(&BTreeMap::from([("kl".to_string(), 1.5)]), &BTreeMap::from([("kl".to_string(), 2.5)]));
        let path = checkpoint_filename(dir.to_str().unwrap(), info.train_cnt);
        save(&path, &vs, &table, &info).unwrap();

        let checkpoint = Checkpoint::load(&path).unwrap();
        assert_eq!(checkpoint.info, info);
        assert_eq!(checkpoint.code_table().unwrap().as_slice(), table.as_slice());

        let mut restored = VarStore::new(Device::Cpu);
        let _linear = nn::linear(restored.root() / "fc", 3, 2, Default::default());
        checkpoint.restore(&mut restored).unwrap();
        let (a, b) = (vs.variables(), restored.variables());
        for (name, var) in a.iter() {
            assert!(var.equal(&b[name]), "{name}");
        }
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_restore_rejects_other_architecture() {
        let dir = scratch_dir("mismatch");
        let vs = VarStore::new(Device::Cpu);
        let _linear = nn::linear(vs.root() / "fc", 3, 2, Default::default());
        let path = dir.join("run_0000000000ex.safetensors");
        save(&path, &vs, &CodeTable::new(1, 1, 0), &RunInfo::new(AcnConfig::default(), 1)).unwrap();
        let checkpoint = Checkpoint::load(&path).unwrap();
        let mut other = VarStore::new(Device::Cpu);
        let _linear = nn::linear(other.root() / "fc", 4, 2, Default::default());
        assert!(checkpoint.restore(&mut other).is_err());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_latest_in() {
        let dir = scratch_dir("latest");
        fs::create_dir_all(&dir).unwrap();
        for name in ["run_0000000200ex.safetensors", "run_0000001000ex.safetensors", "run_pca.csv"] {
            fs::write(dir.join(name), b"").unwrap();
        }
        assert_eq!(latest_in(&dir).unwrap(), Some(dir.join("run_0000001000ex.safetensors")));
        fs::remove_dir_all(&dir).unwrap();
    }
}
