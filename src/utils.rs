use std::path::{Path, PathBuf};

use tch::{Device, Kind, Tensor};

use crate::error::{AcnError, Result};

pub(crate) fn file_open<P: AsRef<Path>>(path: P) -> Result<std::fs::File> {
    std::fs::File::open(path.as_ref()).map_err(|e| {
        let context = format!("error opening {:?}: {e}", path.as_ref().to_string_lossy());
        AcnError::Io(std::io::Error::new(e.kind(), context))
    })
}

/// Picks the accelerator when one is requested and present, the CPU otherwise.
pub fn get_device(cuda: bool) -> Device {
    if !cuda {
        return Device::Cpu;
    }
    if tch::utils::has_mps() {
        Device::Mps
    } else {
        Device::cuda_if_available()
    }
}

/// `<dir>/<run>_<examples>ex.safetensors`, the name under which a run stores the
/// checkpoint taken after `train_cnt` examples.
pub fn checkpoint_filename(base_filepath: &str, train_cnt: u64) -> PathBuf {
    let base = Path::new(base_filepath);
    let run_name = run_name(base);
    base.join(format!("{run_name}_{train_cnt:010}ex.safetensors"))
}

/// Sibling output path of a checkpoint, e.g. `run_0000060000ex_pca_valid.csv`.
pub fn output_filename(checkpoint: &Path, suffix: &str) -> PathBuf {
    let stem = checkpoint
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    checkpoint.with_file_name(format!("{stem}{suffix}"))
}

pub(crate) fn run_name(base: &Path) -> String {
    base.file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "acn".to_string())
}

pub fn is_finite(xs: &Tensor) -> bool {
    xs.isfinite().all().to_kind(Kind::Int64).int64_value(&[]) == 1
}

pub fn count_nan(xs: &Tensor) -> i64 {
    xs.isnan().to_kind(Kind::Int64).sum(Kind::Int64).int64_value(&[])
}

/// Copies a tensor to host memory as a flat `f32` vector.
pub fn to_host_vec(xs: &Tensor) -> Result<Vec<f32>> {
    let flat = xs
        .detach()
        .to_device(Device::Cpu)
        .to_kind(Kind::Float)
        .contiguous()
        .view(-1);
    Ok(Vec::<f32>::try_from(&flat)?)
}

/// Lays out a `[N, C, H, W]` batch with values in `[0, 1]` as a `[3, rows*H, cols*W]`
/// uint8 image.
pub fn image_grid(images: &Tensor, ncols: i64) -> Result<Tensor> {
    let (n, c, h, w) = images.size4()?;
    let ncols = ncols.clamp(1, n.max(1));
    let nrows = (n + ncols - 1) / ncols;
    let images = images.detach().to_device(Device::Cpu).to_kind(Kind::Float);
    let images = if c == 1 { images.repeat([1, 3, 1, 1]) } else { images };
    let padded = Tensor::zeros([nrows * ncols, 3, h, w], (Kind::Float, Device::Cpu));
    let mut head = padded.narrow(0, 0, n);
    head.copy_(&images);
    let grid = padded
        .view([nrows, ncols, 3, h, w])
        .permute([2, 0, 3, 1, 4])
        .reshape([3, nrows * h, ncols * w]);
    Ok((grid.clamp(0., 1.) * 255.).to_kind(Kind::Uint8))
}

pub fn save_image_grid<P: AsRef<Path>>(images: &Tensor, ncols: i64, path: P) -> Result<()> {
    let grid = image_grid(images, ncols)?;
    tch::vision::image::save(&grid, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_filename() {
        let path = checkpoint_filename("../model_savedir/acn_FashionMNIST_dml", 60000);
        assert_eq!(
            path,
            Path::new("../model_savedir/acn_FashionMNIST_dml/acn_FashionMNIST_dml_0000060000ex.safetensors")
        );
        let csv = output_filename(&path, "_pca_valid.csv");
        assert!(csv.ends_with("acn_FashionMNIST_dml_0000060000ex_pca_valid.csv"));
    }

    #[test]
    fn test_is_finite() {
        let xs = Tensor::from_slice(&[1f32, 2., 3.]);
        assert!(is_finite(&xs));
        let xs = Tensor::from_slice(&[1f32, f32::NAN, f32::INFINITY]);
        assert!(!is_finite(&xs));
        assert_eq!(count_nan(&xs), 1);
    }

    #[test]
    fn test_image_grid_shape() {
        let images = Tensor::rand([5, 1, 4, 6], (Kind::Float, Device::Cpu));
        let grid = image_grid(&images, 2).unwrap();
        assert_eq!(grid.size(), vec![3, 12, 12]);
        assert_eq!(grid.kind(), Kind::Uint8);
    }
}
