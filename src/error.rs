//! Error types for training and evaluating associative compression networks.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AcnError {
    /// Hyperparameters that cannot produce a consistent architecture.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("shape mismatch for {name}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<i64>,
        got: Vec<i64>,
    },

    #[error("example index {index} out of range for code table of {len} rows")]
    IndexOutOfRange { index: i64, len: usize },

    #[error("cannot query {k} neighbors from a table of {rows} codes")]
    InvalidNeighborCount { k: usize, rows: usize },

    /// The loss diverged; the run is aborted rather than continuing on NaNs.
    #[error("non-finite loss {value} in {phase} phase at batch {batch}")]
    NonFiniteLoss {
        phase: String,
        batch: usize,
        value: f64,
    },

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error(transparent)]
    Tch(#[from] tch::TchError),

    #[error(transparent)]
    SafeTensor(#[from] safetensors::SafeTensorError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    TomlDe(#[from] toml::de::Error),

    #[error(transparent)]
    TomlSer(#[from] toml::ser::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

pub type Result<T> = std::result::Result<T, AcnError>;
