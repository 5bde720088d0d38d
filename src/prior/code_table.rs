use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};
use tch::{Device, Kind, Tensor};

use crate::{
    error::{AcnError, Result},
    utils::to_host_vec,
};

/// Latest posterior mean of every training example, row `i` belonging to the
/// example with identity `i`. The number of rows never changes.
#[derive(Debug, Clone)]
pub struct CodeTable {
    rows: usize,
    dim: usize,
    data: Vec<f32>,
}

impl CodeTable {
    /// A table filled from `N(0, 1)` with a seeded generator.
    pub fn new(rows: usize, dim: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let data: Vec<f32> = (0..rows * dim).map(|_| StandardNormal.sample(&mut rng)).collect();
        Self { rows, dim, data }
    }

    pub fn from_vec(rows: usize, dim: usize, data: Vec<f32>) -> Result<Self> {
        if data.len() != rows * dim {
            return Err(AcnError::ShapeMismatch {
                name: "code_table".to_string(),
                expected: vec![rows as i64, dim as i64],
                got: vec![data.len() as i64],
            });
        }
        Ok(Self { rows, dim, data })
    }

    /// Rebuilds a table from a `[rows, dim]` float tensor.
    pub fn from_tensor(xs: &Tensor) -> Result<Self> {
        let (rows, dim) = xs.size2()?;
        Self::from_vec(rows as usize, dim as usize, to_host_vec(xs)?)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn row(&self, index: usize) -> &[f32] {
        &self.data[index * self.dim..(index + 1) * self.dim]
    }

    /// Overwrites the rows named by `indices` (int64, `[B]`) with `codes`
    /// (`[B, dim]`). Nothing is written unless every index is in range.
    pub fn update(&mut self, indices: &Tensor, codes: &Tensor) -> Result<()> {
        let indices = Vec::<i64>::try_from(&indices.to_device(Device::Cpu).to_kind(Kind::Int64).view(-1))?;
        let expected = vec![indices.len() as i64, self.dim as i64];
        if codes.size() != expected {
            return Err(AcnError::ShapeMismatch { name: "codes".to_string(), expected, got: codes.size() });
        }
        if let Some(&index) = indices.iter().find(|&&i| i < 0 || i as usize >= self.rows) {
            return Err(AcnError::IndexOutOfRange { index, len: self.rows });
        }
        let codes = to_host_vec(codes)?;
        for (code, &index) in codes.chunks_exact(self.dim).zip(indices.iter()) {
            let start = index as usize * self.dim;
            self.data[start..start + self.dim].copy_from_slice(code);
        }
        Ok(())
    }

    pub fn to_tensor(&self) -> Tensor {
        Tensor::from_slice(&self.data).view([self.rows as i64, self.dim as i64])
    }
}
