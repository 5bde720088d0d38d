//! # Neighbour-conditioned prior
//!
//! The prior of an example's code is a Gaussian predicted from the code of one
//! of its nearest neighbours in the table of previously seen codes.
use rand::{rngs::StdRng, Rng, SeedableRng};
use tch::{nn, Tensor};

use crate::{error::Result, utils::to_host_vec};

pub use self::{code_table::CodeTable, knn::KnnIndex};

mod code_table;
mod knn;

#[derive(Debug, Clone, Copy)]
pub struct PriorNetworkConfig {
    pub code_length: i64,
    pub n_hidden: i64,
    /// Neighbours retrieved per query.
    pub k: usize,
    pub seed: u64,
}

impl Default for PriorNetworkConfig {
    fn default() -> Self {
        Self { code_length: 196, n_hidden: 512, k: 5, seed: 4543 }
    }
}

/// MLP mapping a neighbour's code to the mean and log standard deviation of the prior.
#[derive(Debug)]
pub struct PriorNetwork {
    fc1: nn::Linear,
    fc2_u: nn::Linear,
    fc2_s: nn::Linear,
    rng: StdRng,
    pub config: PriorNetworkConfig,
}

impl PriorNetwork {
    pub fn new(vs: nn::Path, config: PriorNetworkConfig) -> Self {
        let fc1 = nn::linear(&vs / "fc1", config.code_length, config.n_hidden, Default::default());
        let fc2_u = nn::linear(&vs / "fc2_u", config.n_hidden, config.code_length, Default::default());
        let fc2_s = nn::linear(&vs / "fc2_s", config.n_hidden, config.code_length, Default::default());
        let rng = StdRng::seed_from_u64(config.seed);
        Self { fc1, fc2_u, fc2_s, rng, config }
    }

    /// One neighbour code per row of `codes`: a uniformly random one of the
    /// `k` nearest while training, the nearest otherwise.
    pub fn pick_neighbors(&mut self, index: &KnnIndex, codes: &Tensor, train: bool) -> Result<Tensor> {
        let queries = to_host_vec(codes)?;
        let neighbors = index.kneighbors(&queries, self.config.k)?;
        let picked: Vec<usize> = neighbors
            .iter()
            .map(|rows| if train { rows[self.rng.gen_range(0..rows.len())] } else { rows[0] })
            .collect();
        Ok(index.gather(&picked, codes.device()))
    }

    /// `(mu, log_std)` of the prior given a neighbour's code.
    pub fn encode(&self, prev_code: &Tensor) -> (Tensor, Tensor) {
        let hidden = prev_code.apply(&self.fc1).relu();
        (hidden.apply(&self.fc2_u), hidden.apply(&self.fc2_s))
    }

    pub fn forward(&mut self, index: &KnnIndex, codes: &Tensor, train: bool) -> Result<(Tensor, Tensor)> {
        let prev_code = self.pick_neighbors(index, codes, train)?;
        Ok(self.encode(&prev_code))
    }
}
