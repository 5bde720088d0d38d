//! Image datasets with stable example identities.
use std::path::Path;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tch::{Device, Kind, Tensor};
use tracing::info;

use crate::{error::Result, losses::RecLossType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum DatasetKind {
    Mnist,
    FashionMnist,
}

impl DatasetKind {
    pub fn name(&self) -> &'static str {
        match self {
            DatasetKind::Mnist => "MNIST",
            DatasetKind::FashionMnist => "FashionMNIST",
        }
    }
}

/// One mini-batch. `indices` are the examples' positions in their dataset and
/// address the code table.
#[derive(Debug)]
pub struct Batch {
    pub images: Tensor,
    pub labels: Tensor,
    pub indices: Tensor,
}

#[derive(Debug)]
pub struct ImageDataset {
    /// `[N, C, H, W]` float images.
    pub images: Tensor,
    /// `[N]` int64 class labels.
    pub labels: Tensor,
}

impl ImageDataset {
    pub fn new(images: Tensor, labels: Tensor) -> Self {
        Self { images, labels }
    }

    pub fn len(&self) -> usize {
        self.images.size()[0] as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(channels, height, width)` of every image.
    pub fn image_shape(&self) -> (i64, i64, i64) {
        let size = self.images.size();
        (size[1], size[2], size[3])
    }

    pub fn num_batches(&self, batch_size: usize) -> usize {
        (self.len() + batch_size - 1) / batch_size
    }

    /// Iterates over the dataset once, in a random order when `shuffle` is set.
    /// Every example appears exactly once; the last batch may be smaller.
    pub fn batches(&self, batch_size: usize, shuffle: bool) -> BatchIter<'_> {
        let n = self.len() as i64;
        let order = if shuffle {
            Tensor::randperm(n, (Kind::Int64, Device::Cpu))
        } else {
            Tensor::arange(n, (Kind::Int64, Device::Cpu))
        };
        BatchIter { dataset: self, order, batch_size: batch_size.max(1) as i64, position: 0 }
    }
}

#[derive(Debug)]
pub struct BatchIter<'a> {
    dataset: &'a ImageDataset,
    order: Tensor,
    batch_size: i64,
    position: i64,
}

impl Iterator for BatchIter<'_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        let total = self.order.size()[0];
        if self.position >= total {
            return None;
        }
        let size = self.batch_size.min(total - self.position);
        let indices = self.order.narrow(0, self.position, size);
        self.position += size;
        Some(Batch {
            images: self.dataset.images.index_select(0, &indices),
            labels: self.dataset.labels.index_select(0, &indices),
            indices,
        })
    }
}

#[derive(Debug)]
pub struct DataSplits {
    pub train: ImageDataset,
    pub valid: ImageDataset,
}

impl DataSplits {
    /// Reads the IDX files under `<base_datadir>/<dataset>/raw` and maps the
    /// pixels into the domain of the reconstruction loss.
    pub fn load<P: AsRef<Path>>(base_datadir: P, kind: DatasetKind, rec_loss: RecLossType) -> Result<Self> {
        let dir = base_datadir.as_ref().join(kind.name()).join("raw");
        info!("loading {} from {}", kind.name(), dir.display());
        let dataset = tch::vision::mnist::load_dir(&dir)?;
        let as_images = |xs: &Tensor| rec_loss.rescale(&xs.view([-1, 1, 28, 28]));
        let train = ImageDataset::new(as_images(&dataset.train_images), dataset.train_labels);
        let valid = ImageDataset::new(as_images(&dataset.test_images), dataset.test_labels);
        info!("{} train and {} valid examples", train.len(), valid.len());
        Ok(Self { train, valid })
    }
}
