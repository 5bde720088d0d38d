pub mod acn;
pub mod actions;
pub mod checkpoint;
pub mod data;
pub mod error;
pub mod losses;
pub mod model_kind;
pub mod pixel_cnn;
pub mod prior;
pub mod utils;
pub mod vae;
pub mod vq;

pub use error::{AcnError, Result};
