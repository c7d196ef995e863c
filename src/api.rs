//! High-level API for demographic inference
//!
//! This module provides the batch inference driver: load a vocabulary and a
//! checkpoint once, then run records through it in order-preserving batches.
//!
//! # Quick Start
//!
//! ```no_run
//! use demographer::{Predictor, ProfileRecord};
//!
//! let mut predictor = Predictor::new()?;
//! let records = vec![
//!     ProfileRecord::new("720389270335135745", "en", "Zijian Wang", "zijwang", "PhD student")
//!         .with_image("images/zijwang_224x224.jpg"),
//! ];
//! let result = predictor.predict_batch(&records)?;
//! println!("{}", result.to_json()?);
//! # Ok::<(), demographer::DemographerError>(())
//! ```
//!
//! # Features
//!
//! ## Auto-Download
//!
//! Enable the `auto-download` feature to fetch missing checkpoints from the
//! public mirrors:
//!
//! ```toml
//! [dependencies]
//! demographer = { version = "0.1", features = ["auto-download"] }
//! ```
//!
//! Without it, place `full_model.mdl` or `text_model.mdl` in the model
//! directory yourself. Cached files are always checked against their MD5
//! digest.
//!
//! # Examples
//!
//! ## Text-only model on CPU
//!
//! ```no_run
//! use demographer::{ModelVariant, Predictor, PredictorConfig};
//!
//! let config = PredictorConfig::new()
//!     .with_variant(ModelVariant::Text)
//!     .with_model_dir("/custom/path")
//!     .with_cuda(false);
//!
//! let mut predictor = Predictor::with_config(config)?;
//! let records = demographer::record::load_jsonl("profiles.jsonl")?;
//! let result = predictor.infer(&records, 32, false)?;
//! # Ok::<(), demographer::DemographerError>(())
//! ```
//!
//! ## Single attribute
//!
//! ```no_run
//! # use demographer::{Label, Predictor};
//! # let mut predictor = Predictor::new()?;
//! # let records = Vec::new();
//! let org = predictor.infer_label(&records, 16, Label::Org)?;
//! for (id, dist) in org.iter() {
//!     println!("{}: {}", id, dist.top());
//! }
//! # Ok::<(), demographer::DemographerError>(())
//! ```

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::PredictorConfig;
use crate::encoder::{EncodedRecord, FeatureEncoder};
use crate::error::{DemographerError, Result};
use crate::model::{ImageLoader, Label, ReplicaSet};
use crate::model_loader::{ModelResolver, ModelVariant, ResolutionReport};
use crate::output::{ById, Distribution, LabelResult, Prediction, PredictionResult};
use crate::record::{load_jsonl, ProfileRecord};
use crate::vocab::Vocabulary;

/// Main inference interface.
#[derive(Debug)]
pub struct Predictor {
    encoder: FeatureEncoder,
    replicas: ReplicaSet,
    images: ImageLoader,
    config: PredictorConfig,
    resolution: Option<ResolutionReport>,
}

impl Predictor {
    /// Create a predictor with the default configuration
    ///
    /// This will:
    /// - Read the vocabulary from `models/vocab.json`
    /// - Resolve the full model checkpoint into `models/`
    /// - Run on the first CUDA device when one is available
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The vocabulary is missing or does not fit the embedding table
    /// - The checkpoint is missing and cannot be downloaded
    /// - The cached checkpoint fails its checksum
    pub fn new() -> Result<Self> {
        Self::with_config(PredictorConfig::default())
    }

    /// Create a predictor with a custom configuration.
    pub fn with_config(config: PredictorConfig) -> Result<Self> {
        let vocab = Vocabulary::load(&config.vocab_path)?;
        Self::with_vocabulary(config, vocab)
    }

    /// Create a predictor around an already loaded vocabulary.
    pub fn with_vocabulary(config: PredictorConfig, vocab: Vocabulary) -> Result<Self> {
        config.validate()?;
        vocab.check_fits(config.dims.char_vocab)?;

        if let Some(seed) = config.seed {
            tch::manual_seed(seed);
        }

        let devices = ReplicaSet::devices(config.use_cuda, config.parallel, config.replicas);
        info!(variant = %config.variant, devices = ?devices, "building model");
        let build = |checkpoint: Option<&Path>| {
            ReplicaSet::build(config.variant, &config.dims, &devices, checkpoint)
        };

        let (replicas, resolution) = match (&config.checkpoint, config.pretrained) {
            (_, false) => {
                info!("no pretrained weights will be loaded");
                (build(None)?, None)
            }
            (Some(path), true) => (build(Some(path.as_path()))?, None),
            (None, true) => {
                let resolver = ModelResolver::new(&config.model_dir)
                    .with_auto_download(config.auto_download);
                let (report, result) = resolver
                    .resolve_and_load(&config.variant.checkpoint(), |path| build(Some(path)));
                (result?, Some(report))
            }
        };

        Ok(Self {
            encoder: FeatureEncoder::new(Arc::new(vocab)),
            replicas,
            images: ImageLoader::new(config.default_image.clone()),
            config,
            resolution,
        })
    }

    /// How the published checkpoint was resolved and loaded. `None` when the
    /// weights are random or come from an explicit checkpoint path.
    pub fn resolution(&self) -> Option<&ResolutionReport> {
        self.resolution.as_ref()
    }

    pub fn config(&self) -> &PredictorConfig {
        &self.config
    }

    pub fn encoder(&self) -> &FeatureEncoder {
        &self.encoder
    }

    /// Predict all attributes.
    ///
    /// Records are processed in batches of `batch_size` in input order. The
    /// result holds one entry per distinct id; for a repeated id the first
    /// record wins. `use_image` requires the full model.
    pub fn infer(
        &mut self,
        records: &[ProfileRecord],
        batch_size: usize,
        use_image: bool,
    ) -> Result<PredictionResult> {
        self.drive(records, batch_size, use_image, |replicas, batch, images| {
            Prediction::from_outputs(&replicas.run(batch, images)?)
        })
    }

    /// Predict one attribute only.
    pub fn infer_label(
        &mut self,
        records: &[ProfileRecord],
        batch_size: usize,
        label: Label,
    ) -> Result<LabelResult> {
        let use_image = self.config.variant.uses_image();
        self.drive(records, batch_size, use_image, |replicas, batch, images| {
            Distribution::from_tensor(label, &replicas.run_label(batch, images, label)?)
        })
    }

    /// [`Predictor::infer`] with the configured batch size, using images when
    /// the model has an image branch.
    pub fn predict_batch(&mut self, records: &[ProfileRecord]) -> Result<PredictionResult> {
        let batch_size = self.config.batch_size;
        let use_image = self.config.variant.uses_image();
        self.infer(records, batch_size, use_image)
    }

    /// Predict every record of a JSON Lines file.
    pub fn predict_file<P: AsRef<Path>>(&mut self, path: P) -> Result<PredictionResult> {
        let records = load_jsonl(path)?;
        self.predict_batch(&records)
    }

    fn drive<T, F>(
        &mut self,
        records: &[ProfileRecord],
        batch_size: usize,
        use_image: bool,
        mut run: F,
    ) -> Result<ById<T>>
    where
        F: FnMut(&mut ReplicaSet, &[EncodedRecord], Option<&ImageLoader>) -> Result<Vec<T>>,
    {
        if batch_size == 0 {
            return Err(DemographerError::Config(
                "batch_size must be at least 1".to_string(),
            ));
        }
        let variant = self.replicas.variant();
        if use_image && !variant.uses_image() {
            return Err(DemographerError::Config(format!(
                "{} has no image branch; use full_model to infer with images",
                variant
            )));
        }

        let images = variant.uses_image().then_some(&self.images);
        let batches = (records.len() + batch_size - 1) / batch_size;
        info!(records = records.len(), batches, batch_size, "predicting");

        let mut result = ById::new();
        for (i, batch) in records.chunks(batch_size).enumerate() {
            let encoded = self.encoder.encode_batch(batch, use_image);
            let outputs = run(&mut self.replicas, &encoded, images)?;
            for (record, output) in batch.iter().zip(outputs) {
                result.insert(record.id.as_str(), output);
            }
            debug!(batch = i + 1, of = batches, "batch done");
        }
        Ok(result)
    }

    /// Save the current parameters. A `.safetensors` path writes safetensors,
    /// anything else a libtorch archive; name it `.ot` to load it back as a
    /// checkpoint.
    pub fn save_weights<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.replicas.primary().var_store().save(path)?;
        Ok(())
    }

    /// Get information about the loaded model
    pub fn model_info(&self) -> ModelInfo {
        ModelInfo {
            variant: self.replicas.variant(),
            devices: self
                .replicas
                .devices_in_use()
                .iter()
                .map(|device| format!("{:?}", device))
                .collect(),
            vocab_size: self.encoder.vocabulary().len(),
            pretrained: self.config.pretrained,
        }
    }
}

/// Information about the loaded model
#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub variant: ModelVariant,
    /// One entry per replica.
    pub devices: Vec<String>,
    pub vocab_size: usize,
    pub pretrained: bool,
}

impl fmt::Display for ModelInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Variant: {}", self.variant)?;
        writeln!(f, "Replicas: {} ({})", self.devices.len(), self.devices.join(", "))?;
        writeln!(f, "Vocabulary: {} entries", self.vocab_size)?;
        write!(
            f,
            "Weights: {}",
            if self.pretrained { "pretrained" } else { "random" }
        )
    }
}
