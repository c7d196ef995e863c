//! Profile image branch of the full model.

use std::path::{Path, PathBuf};

use tch::nn::{self, ModuleT};
use tch::vision::{densenet, image};
use tch::{Device, Kind, Tensor};

use crate::consts::IMAGE_SIZE;
use crate::error::{DemographerError, Result};

/// DenseNet-161 backbone whose classifier emits the vision feature vector.
///
/// Parameters live under `img_model.features.*` and `img_model.classifier.*`.
pub struct VisionEncoder {
    net: Box<dyn ModuleT>,
    output_dim: i64,
}

impl std::fmt::Debug for VisionEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisionEncoder")
            .field("output_dim", &self.output_dim)
            .finish()
    }
}

impl VisionEncoder {
    pub fn new(root: &nn::Path, output_dim: i64) -> Self {
        VisionEncoder {
            net: Box::new(densenet::densenet161(&(root / "img_model"), output_dim)),
            output_dim,
        }
    }

    pub fn output_dim(&self) -> i64 {
        self.output_dim
    }

    /// `[batch, 3, 224, 224]` in `[0, 1]` → `[batch, output_dim]`.
    pub fn forward(&self, images: &Tensor) -> Tensor {
        self.net.forward_t(images, false)
    }
}

/// Loads profile images into batch tensors, substituting a placeholder for
/// records without one.
#[derive(Debug, Clone, Default)]
pub struct ImageLoader {
    default_image: Option<PathBuf>,
}

impl ImageLoader {
    pub fn new(default_image: Option<PathBuf>) -> Self {
        Self { default_image }
    }

    pub fn default_image(&self) -> Option<&Path> {
        self.default_image.as_deref()
    }

    /// Read and resize one image to `[3, 224, 224]` floats in `[0, 1]`.
    pub fn load(path: &Path) -> Result<Tensor> {
        if !path.is_file() {
            return Err(DemographerError::MissingImage(path.to_path_buf()));
        }
        let pixels = image::load_and_resize(path, IMAGE_SIZE, IMAGE_SIZE)?;
        Ok(pixels.to_kind(Kind::Float) / 255.0)
    }

    fn placeholder(&self) -> Result<Tensor> {
        match &self.default_image {
            Some(path) => Self::load(path),
            None => Ok(Tensor::zeros(
                [3, IMAGE_SIZE, IMAGE_SIZE],
                (Kind::Float, Device::Cpu),
            )),
        }
    }

    /// Stack the images of a batch into `[batch, 3, 224, 224]` on `device`.
    pub fn batch(&self, paths: &[Option<&Path>], device: Device) -> Result<Tensor> {
        let mut placeholder: Option<Tensor> = None;
        let mut images = Vec::with_capacity(paths.len());
        for path in paths {
            let image = match path {
                Some(path) => Self::load(path)?,
                None => match &placeholder {
                    Some(image) => image.shallow_clone(),
                    None => {
                        let image = self.placeholder()?;
                        placeholder = Some(image.shallow_clone());
                        image
                    }
                },
            };
            images.push(image);
        }
        Ok(Tensor::stack(&images, 0).to_device(device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_image_is_an_error() {
        let err = ImageLoader::load(Path::new("/nonexistent/picture.png")).unwrap_err();
        assert!(matches!(err, DemographerError::MissingImage(_)));
    }

    #[test]
    fn test_placeholder_without_default() {
        let loader = ImageLoader::default();
        let batch = loader.batch(&[None, None], Device::Cpu).unwrap();
        assert_eq!(batch.size(), vec![2, 3, 224, 224]);
        assert_eq!(batch.abs().sum(Kind::Float).double_value(&[]), 0.0);
    }

    #[test]
    fn test_placeholder_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("default.png");
        let pixels = Tensor::full([3, 10, 12], 255i64, (Kind::Uint8, Device::Cpu));
        image::save(&pixels, &path).unwrap();

        let loader = ImageLoader::new(Some(path));
        let batch = loader.batch(&[None], Device::Cpu).unwrap();
        assert_eq!(batch.size(), vec![1, 3, 224, 224]);
        let mean = batch.mean(Kind::Float).double_value(&[]);
        assert!((mean - 1.0).abs() < 1e-3);
    }
}
