use rayon::prelude::*;
use tch::{Device, Tensor};

use super::CodeTable;
use crate::error::{AcnError, Result};

/// Brute-force Euclidean neighbour search over a snapshot of the code table.
///
/// Neighbours are ordered by `(squared distance, row index)`, so equidistant
/// rows come back lowest index first. Queries are spread over a dedicated
/// rayon pool.
pub struct KnnIndex {
    snapshot: Vec<f32>,
    rows: usize,
    dim: usize,
    pool: rayon::ThreadPool,
}

impl std::fmt::Debug for KnnIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnnIndex")
            .field("rows", &self.rows)
            .field("dim", &self.dim)
            .field("threads", &self.pool.current_num_threads())
            .finish()
    }
}

fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

impl KnnIndex {
    /// An empty index whose queries run on `threads` workers, all cores when 0.
    pub fn new(threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new().num_threads(threads).build()?;
        Ok(Self { snapshot: vec![], rows: 0, dim: 0, pool })
    }

    /// Replaces the snapshot with the current contents of `table`.
    pub fn refit(&mut self, table: &CodeTable) {
        self.snapshot.clear();
        self.snapshot.extend_from_slice(table.as_slice());
        self.rows = table.rows();
        self.dim = table.dim();
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    /// `[rows.len(), dim]` tensor of snapshot rows.
    pub fn gather(&self, rows: &[usize], device: Device) -> Tensor {
        let mut codes = Vec::with_capacity(rows.len() * self.dim);
        for &row in rows {
            codes.extend_from_slice(&self.snapshot[row * self.dim..(row + 1) * self.dim]);
        }
        Tensor::from_slice(&codes).view([rows.len() as i64, self.dim as i64]).to_device(device)
    }

    fn nearest(&self, query: &[f32], k: usize) -> Vec<usize> {
        let mut scored: Vec<(f32, usize)> = self
            .snapshot
            .chunks_exact(self.dim)
            .enumerate()
            .map(|(row, code)| (squared_distance(query, code), row))
            .collect();
        let order = |a: &(f32, usize), b: &(f32, usize)| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1));
        if k < scored.len() {
            scored.select_nth_unstable_by(k - 1, order);
            scored.truncate(k);
        }
        scored.sort_unstable_by(order);
        scored.into_iter().map(|(_, row)| row).collect()
    }

    /// Row indices of the `k` nearest snapshot rows of every query, where
    /// `queries` holds row-major codes of the snapshot's width.
    pub fn kneighbors(&self, queries: &[f32], k: usize) -> Result<Vec<Vec<usize>>> {
        if k == 0 || k > self.rows {
            return Err(AcnError::InvalidNeighborCount { k, rows: self.rows });
        }
        if queries.len() % self.dim != 0 {
            return Err(AcnError::ShapeMismatch {
                name: "knn queries".to_string(),
                expected: vec![-1, self.dim as i64],
                got: vec![queries.len() as i64],
            });
        }
        let neighbors: Vec<Vec<usize>> = self
            .pool
            .install(|| queries.par_chunks(self.dim).map(|query| self.nearest(query, k)).collect());
        Ok(neighbors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_of(rows: usize, dim: usize, data: Vec<f32>) -> KnnIndex {
        let table = CodeTable::from_vec(rows, dim, data).unwrap();
        let mut index = KnnIndex::new(2).unwrap();
        index.refit(&table);
        index
    }

    #[test]
    fn test_kneighbors_ordering() {
        let index = index_of(4, 2, vec![0., 0., 10., 10., 1., 1., -5., -5.]);
        let neighbors = index.kneighbors(&[0.5, 0.5], 2).unwrap();
        assert_eq!(neighbors, vec![vec![0, 2]]);
        let first = index.gather(&[neighbors[0][0]], Device::Cpu);
        assert_eq!(Vec::<f32>::try_from(&first.view(-1)).unwrap(), vec![0., 0.]);
    }

    #[test]
    fn test_ties_break_on_lowest_row() {
        let index = index_of(4, 1, vec![3., 1., -1., 1.]);
        let neighbors = index.kneighbors(&[0., 2.], 3).unwrap();
        assert_eq!(neighbors[0], vec![1, 2, 3]);
        assert_eq!(neighbors[1], vec![0, 1, 3]);
    }

    #[test]
    fn test_exactly_k_neighbors() {
        let table = CodeTable::new(50, 4, 9);
        let mut index = KnnIndex::new(0).unwrap();
        index.refit(&table);
        let queries = table.as_slice()[..12].to_vec();
        let neighbors = index.kneighbors(&queries, 5).unwrap();
        assert_eq!(neighbors.len(), 3);
        for (query, found) in queries.chunks(4).zip(neighbors.iter()) {
            assert_eq!(found.len(), 5);
            let best = (0..50)
                .map(|row| squared_distance(query, table.row(row)))
                .fold(f32::INFINITY, f32::min);
            assert_eq!(squared_distance(query, table.row(found[0])), best);
        }
        // a table row queried against itself finds itself first
        assert_eq!(neighbors[0][0], 0);
    }

    #[test]
    fn test_invalid_requests() {
        let index = index_of(3, 2, vec![0.; 6]);
        assert!(matches!(index.kneighbors(&[0., 0.], 4), Err(AcnError::InvalidNeighborCount { k: 4, rows: 3 })));
        assert!(index.kneighbors(&[0., 0.], 0).is_err());
        assert!(index.kneighbors(&[0., 0., 0.], 1).is_err());
    }

    #[test]
    fn test_refit_sees_updates() {
        let mut table = CodeTable::from_vec(2, 1, vec![0., 5.]).unwrap();
        let mut index = KnnIndex::new(1).unwrap();
        index.refit(&table);
        assert_eq!(index.kneighbors(&[4.], 1).unwrap(), vec![vec![1]]);
        table
            .update(&tch::Tensor::from_slice(&[0i64]), &tch::Tensor::from_slice(&[4f32]).view([1, 1]))
            .unwrap();
        assert_eq!(index.kneighbors(&[4.], 1).unwrap(), vec![vec![1]]);
        index.refit(&table);
        assert_eq!(index.kneighbors(&[4.], 1).unwrap(), vec![vec![0]]);
    }
}
