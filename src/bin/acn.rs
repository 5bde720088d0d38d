//! Trains an associative compression network, or runs a post-training action
//! on a saved checkpoint.
//!
//! ```bash
//! # train from the defaults, overriding a few hyperparameters
//! acn --architecture pixel_cnn --batch-size 64
//!
//! # resume the newest checkpoint of a run directory
//! acn --load-last-model ../model_savedir/acn_FashionMNIST_vq_residual_dml
//!
//! # latent walks from a checkpoint
//! acn --model-loadpath run_0000060000ex.safetensors --walk
//! ```
use std::path::PathBuf;

use acn_rs::{
    acn::{builder::AcnBuilder, config::AcnConfig},
    actions::Action,
    checkpoint,
    data::{DataSplits, DatasetKind},
    losses::{LossReduction, RecLossType},
    model_kind::ModelKind,
};
use anyhow::{bail, Context};
use clap::{ArgGroup, Parser};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(group(ArgGroup::new("action").args(["pca", "walk", "sample"])))]
#[command(group(ArgGroup::new("resume").args(["model_loadpath", "load_last_model"])))]
struct Args {
    /// TOML file with the base configuration; flags override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Checkpoint to resume from or to run an action on.
    #[arg(long)]
    model_loadpath: Option<PathBuf>,

    /// Resume the newest checkpoint in this directory.
    #[arg(long)]
    load_last_model: Option<PathBuf>,

    /// Write principal-component projections of the codes.
    #[arg(long)]
    pca: bool,

    /// Write latent walks between pairs of training images.
    #[arg(long)]
    walk: bool,

    /// Write reconstruction and sample grids.
    #[arg(long)]
    sample: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[arg(long, value_enum)]
    architecture: Option<ModelKind>,

    #[arg(long, value_enum)]
    dataset: Option<DatasetKind>,

    #[arg(long)]
    base_datadir: Option<String>,

    #[arg(long)]
    model_savedir: Option<String>,

    #[arg(long)]
    exp_name: Option<String>,

    #[arg(long)]
    cuda: bool,

    #[arg(long)]
    seed: Option<i64>,

    #[arg(long)]
    num_threads: Option<i64>,

    #[arg(long)]
    knn_threads: Option<usize>,

    #[arg(long)]
    save_every_epochs: Option<u64>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    lr: Option<f64>,

    #[arg(long)]
    num_examples_to_train: Option<u64>,

    #[arg(long)]
    dropout: Option<f64>,

    #[arg(long, value_enum)]
    reduction: Option<LossReduction>,

    #[arg(long, value_enum)]
    rec_loss: Option<RecLossType>,

    #[arg(long)]
    nr_logistic_mix: Option<i64>,

    #[arg(long)]
    code_length: Option<i64>,

    #[arg(long)]
    num_k: Option<usize>,

    #[arg(long)]
    input_channels: Option<i64>,

    #[arg(long)]
    target_channels: Option<i64>,

    #[arg(long)]
    hidden_size: Option<i64>,

    #[arg(long)]
    prior_hidden_size: Option<i64>,

    /// Seed of the code table and of neighbour picking.
    #[arg(long)]
    prior_seed: Option<u64>,

    #[arg(long)]
    encoder_output_size: Option<i64>,

    /// Use the mixture means instead of sampling pixels.
    #[arg(long)]
    sample_mean: bool,

    #[arg(long)]
    vq_commitment_beta: Option<f64>,

    #[arg(long)]
    num_vqk: Option<i64>,

    #[arg(long)]
    num_z: Option<i64>,

    #[arg(long)]
    pixel_cnn_dim: Option<i64>,

    #[arg(long)]
    num_pcnn_layers: Option<i64>,

    #[arg(long)]
    output_projection_size: Option<i64>,

    #[arg(long)]
    grad_clip: Option<f64>,

    #[arg(long)]
    num_walk_steps: Option<i64>,
}

macro_rules! override_fields {
    ($config:ident, $args:expr, $($field:ident),* $(,)?) => {
        $(
            if let Some(value) = $args.$field.clone() {
                $config.$field = value;
            }
        )*
    };
}

impl Args {
    fn action(&self) -> Option<Action> {
        if self.pca {
            Some(Action::Pca)
        } else if self.walk {
            Some(Action::Walk)
        } else if self.sample {
            Some(Action::Sample)
        } else {
            None
        }
    }

    fn to_config(&self) -> anyhow::Result<AcnConfig> {
        let mut config = match &self.config {
            Some(path) => AcnConfig::from_file(path)
                .with_context(|| format!("reading configuration {}", path.display()))?,
            None => AcnConfig::default(),
        };
        override_fields!(
            config,
            self,
            architecture,
            dataset,
            base_datadir,
            model_savedir,
            exp_name,
            seed,
            num_threads,
            knn_threads,
            save_every_epochs,
            batch_size,
            lr,
            num_examples_to_train,
            dropout,
            reduction,
            rec_loss,
            nr_logistic_mix,
            code_length,
            num_k,
            input_channels,
            target_channels,
            hidden_size,
            prior_hidden_size,
            prior_seed,
            encoder_output_size,
            vq_commitment_beta,
            num_vqk,
            num_z,
            pixel_cnn_dim,
            num_pcnn_layers,
            output_projection_size,
            grad_clip,
            num_walk_steps,
        );
        config.cuda |= self.cuda;
        config.sample_mean |= self.sample_mean;
        Ok(config)
    }

    fn checkpoint(&self) -> anyhow::Result<Option<PathBuf>> {
        if let Some(path) = &self.model_loadpath {
            return Ok(Some(path.clone()));
        }
        match &self.load_last_model {
            Some(dir) => match checkpoint::latest_in(dir)? {
                Some(path) => Ok(Some(path)),
                None => bail!("no checkpoint in {}", dir.display()),
            },
            None => Ok(None),
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).with_target(true).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = args.to_config()?;
    let loadpath = args.checkpoint()?;
    let action = args.action();
    if action.is_some() && loadpath.is_none() {
        bail!("--pca, --walk and --sample need --model-loadpath or --load-last-model");
    }
    // the data layout of a resumed run comes from its checkpoint
    if let Some(path) = &loadpath {
        let saved = checkpoint::Checkpoint::load(path)?.info.config;
        config.dataset = saved.dataset;
        config.rec_loss = saved.rec_loss;
    }

    let data = DataSplits::load(&config.base_datadir, config.dataset, config.rec_loss)
        .with_context(|| format!("loading {} from {}", config.dataset.name(), config.base_datadir))?;
    let mut builder = AcnBuilder::new(config);
    if let Some(path) = &loadpath {
        builder = builder.load(path);
    }
    let mut acn = builder.build(data.train.image_shape(), data.train.len())?;

    match (action, loadpath) {
        (Some(action), Some(path)) => {
            let written = action.run(&acn, &data, &path)?;
            info!("{action:?} wrote {} files", written.len());
        }
        _ => acn.train(&data)?,
    }
    Ok(())
}
