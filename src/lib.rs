//! # Demographer - Demographic Inference for Social Media Profiles
//!
//! Gender, age bracket and organization-vs-person inference from public
//! profile fields (display name, screen name, biography, language and an
//! optional profile image) with multi-branch recurrent networks on libtorch.
//!
//! ## Features
//!
//! - **Three heads**: gender (2), age bracket (4) and organization (2)
//!   probability distributions per profile
//! - **Character-level encoders**: per-field bidirectional LSTMs over
//!   length-sorted batches, conditioned on the profile language
//! - **Unicode fallback**: unseen characters map to their general category
//! - **Image branch**: DenseNet-161 over 224x224 profile images (full model)
//! - **Verified checkpoints**: MD5-checked cache, optional mirror download
//! - **Data parallel**: batches split across identical model replicas
//!
//! ## Quick Start
//!
//! Add to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! # With checkpoint download from the public mirrors
//! demographer = { version = "0.1", features = ["auto-download"] }
//!
//! # Or minimal (requires pre-downloaded checkpoints)
//! demographer = { version = "0.1", default-features = false }
//! ```
//!
//! ### Basic Usage
//!
//! ```no_run
//! use demographer::{Predictor, ProfileRecord};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut predictor = Predictor::new()?;
//!
//!     let records = vec![
//!         ProfileRecord::new("1", "en", "Ada Lovelace", "ada", "Analyst & metaphysician")
//!             .with_image("images/ada_224x224.png"),
//!     ];
//!     let result = predictor.predict_batch(&records)?;
//!
//!     let ada = result.get("1").unwrap();
//!     println!("female: {:.4}", ada.gender.get("female").unwrap());
//!     println!("age: {}", ada.age.top());
//!     Ok(())
//! }
//! ```
//!
//! ### Text-Only Model
//!
//! ```no_run
//! # use demographer::{ModelVariant, Predictor, PredictorConfig};
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = PredictorConfig::new()
//!     .with_variant(ModelVariant::Text)
//!     .with_model_dir("custom_models")
//!     .with_auto_download(true);
//!
//! let mut predictor = Predictor::with_config(config)?;
//! let result = predictor.predict_file("profiles.jsonl")?;
//! result.write_csv(std::io::stdout())?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! ### Available Cargo Features
//!
//! | Feature | Description | Default |
//! |---------|-------------|---------|
//! | `cli` | Include CLI binary | ✓ |
//! | `auto-download` | Download checkpoints from the public mirrors | ✗ |
//!
//! CUDA is picked at runtime: the first visible device is used when libtorch
//! was built with CUDA support, unless `PredictorConfig::with_cuda(false)`.
//!
//! ## Manual Model Download
//!
//! Without `auto-download`, put the checkpoint for your variant and the
//! character vocabulary in the model directory:
//!
//! ```bash
//! mkdir -p models && cd models
//! wget https://nlp.stanford.edu/~zijwang/m3inference/text_model.mdl
//! ```
//!
//! The checkpoint is verified against its published MD5 digest before use.
//! It is a PyTorch pickled state dict and is loaded as is, so do not convert
//! or re-save it.
//!
//! ### Character vocabulary
//!
//! The username and description branches need the character table the
//! checkpoints were trained with, at `models/vocab.json` by default. It is a
//! JSON object mapping single characters, Unicode general category labels
//! and the `<empty>` token to embedding indices:
//!
//! ```json
//! {"<empty>": 1, "a": 2, "e": 3, "Lu": 40, "Po": 57}
//! ```
//!
//! The table ships as `data/emb.pkl` in the `m3inference` Python package and
//! can be exported once with
//!
//! ```bash
//! python -c "import json, pickle, m3inference, os; \
//!   d = os.path.join(os.path.dirname(m3inference.__file__), 'data', 'emb.pkl'); \
//!   json.dump(pickle.load(open(d, 'rb')), open('models/vocab.json', 'w'))"
//! ```
//!
//! ## Requirements
//!
//! - **PyTorch/libtorch**: Required for neural network inference
//! - **CUDA** (optional): For GPU acceleration
//!
//! ```bash
//! export LIBTORCH_USE_PYTORCH=1
//! export LIBTORCH_BYPASS_VERSION_CHECK=1
//! ```
//!
//! ## Model Information
//!
//! - **Text branches**: username (30 chars), screen name (16 ASCII bytes),
//!   description (200 chars), each a 2-layer biLSTM with 256 hidden units
//! - **Language embedding**: 34 language codes plus padding, 8 dims
//! - **Fusion**: dense 256 + ReLU, then one softmax head per attribute
//! - **Full model**: adds a 2048-wide DenseNet-161 image vector
//!
//! ## Performance Tips
//!
//! 1. **Reuse predictor instances**: resolving and loading a checkpoint is
//!    expensive
//! 2. **Use larger batches** on GPU, and `with_parallel(true)` with several
//!    devices
//!
//! ## Error Handling
//!
//! ```rust,no_run
//! use demographer::{DemographerError, Predictor};
//!
//! match Predictor::new() {
//!     Ok(predictor) => println!("{}", predictor.model_info()),
//!     Err(DemographerError::DownloadDisabled(path)) => {
//!         eprintln!("Checkpoint missing at {}", path.display());
//!         eprintln!("Enable 'auto-download' or download it manually");
//!     }
//!     Err(e) => eprintln!("Failed to load model: {}", e),
//! }
//! ```
//!
//! ## Examples
//!
//! ```bash
//! cargo run --example simple --features auto-download
//! cargo run --example batch --features auto-download -- profiles.jsonl
//! ```
//!
//! ## License
//!
//! GNU General Public License v3.0 (GPLv3)

// Public API modules
pub mod api;
pub mod config;
pub mod model_loader;

// Core modules
pub mod consts;
pub mod encoder;
pub mod error;
pub mod model;
pub mod output;
pub mod record;
pub mod vocab;

// Re-export commonly used types for convenience
pub use api::{ModelInfo, Predictor};
pub use config::{ConfigFile, PredictorConfig};
pub use encoder::{EncodedField, EncodedRecord, FeatureEncoder};
pub use error::{DemographerError, Result};
pub use model::{Label, ModelDims};
pub use model_loader::{resolve, verify_checksum, ModelResolver, ModelVariant};
pub use output::{Distribution, LabelResult, Prediction, PredictionResult};
pub use record::{LanguageDetector, ProfileRecord};
pub use vocab::Vocabulary;
