//! Post-training actions run on a loaded checkpoint in evaluation mode.
use std::{
    fmt::Write as _,
    fs,
    path::{Path, PathBuf},
};

use image::{codecs::gif::GifEncoder, Delay, Frame, Rgba, RgbaImage};
use tch::{Device, Kind, Tensor};
use tracing::info;

use crate::{
    acn::Acn,
    data::{DataSplits, ImageDataset},
    error::{AcnError, Result},
    utils::{output_filename, save_image_grid},
    vae::LatentCodec,
};

const NUM_PLOT: usize = 10;
const NUM_WALKS: i64 = 5;
const FRAME_MS: u32 = 100;
/// Repeats of the two endpoint images around a walk.
const HOLD_FRAMES: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Pca,
    Walk,
    Sample,
}

impl Action {
    /// Runs the action and returns the files it wrote next to `checkpoint`.
    pub fn run(&self, acn: &Acn, data: &DataSplits, checkpoint: &Path) -> Result<Vec<PathBuf>> {
        match self {
            Action::Pca => pca(acn, data, checkpoint),
            Action::Walk => walk(acn, &data.train, checkpoint),
            Action::Sample => sample(acn, data, checkpoint),
        }
    }
}

fn first_batch(dataset: &ImageDataset, size: usize) -> Result<(Tensor, Tensor)> {
    let batch = dataset
        .batches(size, false)
        .next()
        .ok_or_else(|| AcnError::Config("dataset is empty".to_string()))?;
    Ok((batch.images, batch.labels))
}

/// `[N, 2]` projection of `codes` on their two leading principal components.
pub fn principal_components(codes: &Tensor) -> Tensor {
    let centered = codes - codes.mean_dim(0, true, Kind::Float);
    let (_, _, v) = centered.svd(true, true);
    let components = v.size()[1].min(2);
    centered.mm(&v.narrow(1, 0, components))
}

/// Writes `x,y,label` CSV files of the first batch of each split.
pub fn pca(acn: &Acn, data: &DataSplits, checkpoint: &Path) -> Result<Vec<PathBuf>> {
    let mut written = vec![];
    for (name, dataset) in [("valid", &data.valid), ("train", &data.train)] {
        let (images, labels) = first_batch(dataset, acn.config.batch_size)?;
        let projected = principal_components(&acn.encode(&images).to_device(Device::Cpu));
        let points = Vec::<f32>::try_from(&projected.contiguous().view(-1))?;
        let labels = Vec::<i64>::try_from(&labels.to_kind(Kind::Int64))?;
        let width = projected.size()[1] as usize;
        let mut csv = String::from("x,y,label\n");
        for (point, label) in points.chunks(width).zip(labels) {
            let y = point.get(1).copied().unwrap_or(0.);
            let _ = writeln!(csv, "{},{},{}", point[0], y, label);
        }
        let path = output_filename(checkpoint, &format!("_pca_{name}.csv"));
        fs::write(&path, csv)?;
        info!("wrote {}", path.display());
        written.push(path);
    }
    Ok(written)
}

fn to_rgba(frame: &Tensor) -> Result<RgbaImage> {
    let (c, h, w) = frame.size3()?;
    let rgb = if c == 1 { frame.repeat([3, 1, 1]) } else { frame.shallow_clone() };
    let bytes = (rgb.clamp(0., 1.) * 255.).to_kind(Kind::Uint8).permute([1, 2, 0]).contiguous().view(-1);
    let bytes = Vec::<u8>::try_from(&bytes)?;
    Ok(RgbaImage::from_fn(w as u32, h as u32, |x, y| {
        let at = (y as usize * w as usize + x as usize) * 3;
        Rgba([bytes[at], bytes[at + 1], bytes[at + 2], 255])
    }))
}

fn write_gif(frames: &Tensor, path: &Path) -> Result<()> {
    let mut encoder = GifEncoder::new(fs::File::create(path)?);
    for index in 0..frames.size()[0] {
        let frame = to_rgba(&frames.get(index))?;
        encoder.encode_frame(Frame::from_parts(frame, 0, 0, Delay::from_numer_denom_ms(FRAME_MS, 1)))?;
    }
    Ok(())
}

/// Linear interpolation between the codes of consecutive example pairs,
/// decoded and written as a GIF and a PNG strip per pair.
pub fn walk(acn: &Acn, dataset: &ImageDataset, checkpoint: &Path) -> Result<Vec<PathBuf>> {
    let cfg = &acn.config;
    let (images, labels) = first_batch(dataset, (2 * NUM_WALKS) as usize)?;
    let pairs = images.size()[0] / 2;
    if pairs == 0 {
        return Err(AcnError::Config("a latent walk needs at least two examples".to_string()));
    }
    let codes = acn.encode(&images);
    let labels = Vec::<i64>::try_from(&labels.to_kind(Kind::Int64))?;
    let steps = Tensor::linspace(0., 1., cfg.num_walk_steps, (Kind::Float, acn.device)).unsqueeze(1);
    let mut written = vec![];
    for pair in 0..pairs {
        let (si, ei) = (2 * pair, 2 * pair + 1);
        let (start, end) = (codes.get(si), codes.get(ei));
        let latents = &start + &steps * (&end - &start);
        let decoded = acn.model.generate(&latents, cfg.rec_loss, cfg.nr_logistic_mix, cfg.sample_mean);
        let decoded = cfg.rec_loss.rescale_inv(&decoded).to_device(Device::Cpu);
        let first = cfg.rec_loss.rescale_inv(&images.narrow(0, si, 1));
        let last = cfg.rec_loss.rescale_inv(&images.narrow(0, ei, 1));
        let mut frames: Vec<Tensor> = (0..HOLD_FRAMES).map(|_| first.shallow_clone()).collect();
        frames.push(decoded.shallow_clone());
        frames.extend((0..HOLD_FRAMES).map(|_| last.shallow_clone()));
        let frames = Tensor::cat(&frames, 0);

        let stem = format!("_walk{pair}_s{}_e{}", labels[si as usize], labels[ei as usize]);
        let gif = output_filename(checkpoint, &format!("{stem}.gif"));
        write_gif(&frames, &gif)?;
        let png = output_filename(checkpoint, &format!("{stem}.png"));
        save_image_grid(&decoded, cfg.num_walk_steps, &png)?;
        info!("wrote {} and {}", gif.display(), png.display());
        written.extend([gif, png]);
    }
    Ok(written)
}

/// Rows of true images, teacher-forced reconstructions and, for
/// autoregressive decoders, free samples from the same codes.
pub fn sample(acn: &Acn, data: &DataSplits, checkpoint: &Path) -> Result<Vec<PathBuf>> {
    let _no_grad = tch::no_grad_guard();
    let cfg = &acn.config;
    let mut written = vec![];
    for (name, dataset) in [("valid", &data.valid), ("train", &data.train)] {
        let (images, _) = first_batch(dataset, NUM_PLOT)?;
        let images = images.to_device(acn.device);
        let codes = acn.encode(&images);
        let logits = acn.model.decode(&codes, &images, false).logits;
        let forced = cfg.rec_loss.sample(&logits, cfg.nr_logistic_mix, cfg.sample_mean);
        let mut rows = vec![cfg.rec_loss.rescale_inv(&images), cfg.rec_loss.rescale_inv(&forced)];
        if cfg.architecture.is_autoregressive() {
            let sampled = acn.model.generate(&codes, cfg.rec_loss, cfg.nr_logistic_mix, cfg.sample_mean);
            rows.push(cfg.rec_loss.rescale_inv(&sampled));
        }
        let path = output_filename(checkpoint, &format!("_{name}_samples.png"));
        save_image_grid(&Tensor::cat(&rows, 0), images.size()[0], &path)?;
        info!("wrote {}", path.display());
        written.push(path);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        acn::{builder::AcnBuilder, config::AcnConfig},
        model_kind::ModelKind,
    };

    #[test]
    fn test_principal_components_follow_variance() {
        // points spread along the first axis only
        let codes = Tensor::from_slice(&[-2f32, 0., 0., -1., 0., 0., 1., 0., 0., 2., 0., 0.]).view([4, 3]);
        let projected = principal_components(&codes);
        assert_eq!(projected.size(), vec![4, 2]);
        let first = Vec::<f32>::try_from(&projected.select(1, 0).abs()).unwrap();
        for (got, want) in first.iter().zip([2f32, 1., 1., 2.]) {
            assert!((got - want).abs() < 1e-4);
        }
    }

    #[test]
    fn test_actions_write_files() {
        tch::manual_seed(0);
        let dir = std::env::temp_dir().join(format!("acn_actions_{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        let config = AcnConfig {
            architecture: ModelKind::Residual,
            batch_size: 4,
            hidden_size: 8,
            prior_hidden_size: 16,
            knn_threads: 1,
            num_walk_steps: 3,
            nr_logistic_mix: 2,
            ..Default::default()
        };
        let images = Tensor::rand([6, 1, 28, 28], (Kind::Float, Device::Cpu)) * 2. - 1.;
        let labels = Tensor::arange(6, (Kind::Int64, Device::Cpu));
        let data = DataSplits {
            train: ImageDataset::new(images.shallow_clone(), labels.shallow_clone()),
            valid: ImageDataset::new(images, labels),
        };
        let acn = AcnBuilder::new(config).build((1, 28, 28), 6).unwrap();
        let checkpoint = dir.join("run_0000000006ex.safetensors");
        for action in [Action::Pca, Action::Walk, Action::Sample] {
            for path in action.run(&acn, &data, &checkpoint).unwrap() {
                assert!(path.exists(), "{}", path.display());
            }
        }
        let csv = fs::read_to_string(dir.join("run_0000000006ex_pca_valid.csv")).unwrap();
        assert_eq!(csv.lines().count(), 5);
        fs::remove_dir_all(&dir).unwrap();
    }
}
