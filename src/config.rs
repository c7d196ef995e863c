//! Engine configuration.
//!
//! [`PredictorConfig`] is the builder used by the library API. [`ConfigFile`]
//! is its TOML form with `[model]`, `[vocab]` and `[inference]` sections;
//! every key is optional.
//!
//! ```toml
//! [model]
//! variant = "text_model"
//! model_dir = "models"
//!
//! [inference]
//! batch_size = 32
//! use_cuda = false
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::consts::{BATCH_SIZE, DEFAULT_MODEL_DIR, DEFAULT_VOCAB_PATH};
use crate::error::{DemographerError, Result};
use crate::model::ModelDims;
use crate::model_loader::ModelVariant;

/// Settings for building a [`crate::Predictor`].
#[derive(Debug, Clone, PartialEq)]
pub struct PredictorConfig {
    /// Checkpoint cache directory.
    pub model_dir: PathBuf,
    pub variant: ModelVariant,
    /// Load pretrained weights. When `false` the parameters keep their
    /// random initialisation.
    pub pretrained: bool,
    /// Local weights to load instead of resolving the published checkpoint.
    pub checkpoint: Option<PathBuf>,
    pub auto_download: bool,
    pub vocab_path: PathBuf,
    /// Use CUDA when a device is available.
    pub use_cuda: bool,
    /// Split batches across replicas.
    pub parallel: bool,
    /// Replica count in parallel mode; defaults to one per GPU.
    pub replicas: Option<usize>,
    /// Image used for records without one.
    pub default_image: Option<PathBuf>,
    pub batch_size: usize,
    pub dims: ModelDims,
    pub seed: Option<i64>,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from(DEFAULT_MODEL_DIR),
            variant: ModelVariant::Full,
            pretrained: true,
            checkpoint: None,
            auto_download: cfg!(feature = "auto-download"),
            vocab_path: PathBuf::from(DEFAULT_VOCAB_PATH),
            use_cuda: true,
            parallel: false,
            replicas: None,
            default_image: None,
            batch_size: BATCH_SIZE,
            dims: ModelDims::default(),
            seed: Some(0),
        }
    }
}

impl PredictorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.model_dir = dir.into();
        self
    }

    pub fn with_variant(mut self, variant: ModelVariant) -> Self {
        self.variant = variant;
        self
    }

    pub fn with_pretrained(mut self, pretrained: bool) -> Self {
        self.pretrained = pretrained;
        self
    }

    pub fn with_checkpoint(mut self, path: impl Into<PathBuf>) -> Self {
        self.checkpoint = Some(path.into());
        self
    }

    pub fn with_auto_download(mut self, enable: bool) -> Self {
        self.auto_download = enable;
        self
    }

    pub fn with_vocab_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.vocab_path = path.into();
        self
    }

    pub fn with_cuda(mut self, use_cuda: bool) -> Self {
        self.use_cuda = use_cuda;
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_replicas(mut self, replicas: usize) -> Self {
        self.replicas = Some(replicas);
        self
    }

    pub fn with_default_image(mut self, path: impl Into<PathBuf>) -> Self {
        self.default_image = Some(path.into());
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_dims(mut self, dims: ModelDims) -> Self {
        self.dims = dims;
        self
    }

    pub fn with_seed(mut self, seed: Option<i64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(DemographerError::Config(
                "batch_size must be at least 1".to_string(),
            ));
        }
        if self.replicas == Some(0) {
            return Err(DemographerError::Config(
                "replicas must be at least 1".to_string(),
            ));
        }
        if let Some(image) = &self.default_image {
            if !image.is_file() {
                return Err(DemographerError::MissingImage(image.clone()));
            }
        }
        Ok(())
    }
}

/// `[model]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSection {
    pub variant: ModelVariant,
    pub model_dir: PathBuf,
    pub pretrained: bool,
    pub checkpoint: Option<PathBuf>,
    pub auto_download: bool,
    pub seed: Option<i64>,
}

impl Default for ModelSection {
    fn default() -> Self {
        let defaults = PredictorConfig::default();
        Self {
            variant: defaults.variant,
            model_dir: defaults.model_dir,
            pretrained: defaults.pretrained,
            checkpoint: defaults.checkpoint,
            auto_download: defaults.auto_download,
            seed: defaults.seed,
        }
    }
}

/// `[vocab]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VocabSection {
    pub path: PathBuf,
}

impl Default for VocabSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_VOCAB_PATH),
        }
    }
}

/// `[inference]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceSection {
    pub batch_size: usize,
    pub use_cuda: bool,
    pub parallel: bool,
    pub replicas: Option<usize>,
    pub default_image: Option<PathBuf>,
}

impl Default for InferenceSection {
    fn default() -> Self {
        Self {
            batch_size: BATCH_SIZE,
            use_cuda: true,
            parallel: false,
            replicas: None,
            default_image: None,
        }
    }
}

/// Configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub model: ModelSection,
    pub vocab: VocabSection,
    pub inference: InferenceSection,
}

impl ConfigFile {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Like [`ConfigFile::load`], but a missing file yields the defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            info!(path = %path.display(), "config file not found, using defaults");
            Ok(Self::default())
        }
    }

    pub fn into_predictor_config(self) -> PredictorConfig {
        PredictorConfig {
            model_dir: self.model.model_dir,
            variant: self.model.variant,
            pretrained: self.model.pretrained,
            checkpoint: self.model.checkpoint,
            auto_download: self.model.auto_download,
            vocab_path: self.vocab.path,
            use_cuda: self.inference.use_cuda,
            parallel: self.inference.parallel,
            replicas: self.inference.replicas,
            default_image: self.inference.default_image,
            batch_size: self.inference.batch_size,
            dims: ModelDims::default(),
            seed: self.model.seed,
        }
    }
}
