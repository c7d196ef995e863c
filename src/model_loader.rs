//! Checkpoint resolution with optional auto-download from the public mirrors
//!
//! A checkpoint is cached as `{cache_dir}/{variant}.mdl`. A cached file is
//! always verified against the registry MD5 digest; a mismatch is an error
//! and nothing is re-downloaded. On a cache miss the mirrors are tried in
//! random order when the `auto-download` feature is enabled.
//!
//! The published files are PyTorch pickled state dicts. They keep their
//! `.mdl` name so the digest stays valid, and [`load_state_dict`] reads them
//! with the pickle reader whatever the extension.
//!
//! # Examples
//!
//! ## Resolve the text model into the default cache
//!
//! ```no_run
//! use demographer::model_loader::resolve;
//!
//! let path = resolve("text_model", "models")?;
//! println!("checkpoint at {}", path.display());
//! # Ok::<(), demographer::DemographerError>(())
//! ```
//!
//! ## Inspect the resolution steps
//!
//! ```no_run
//! use demographer::model_loader::ModelResolver;
//!
//! let resolver = ModelResolver::new("/custom/models").with_auto_download(false);
//! let (report, result) = resolver.resolve_with_report("full_model");
//! for state in report.states() {
//!     println!("{:?}", state);
//! }
//! # let _ = result;
//! ```

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tch::{nn, Device, Tensor};
use tracing::{debug, error, info};

use crate::consts::{FULL_MODEL_MD5, FULL_MODEL_MIRRORS, TEXT_MODEL_MD5, TEXT_MODEL_MIRRORS};
use crate::error::{DemographerError, Result};

const CHECKPOINT_EXTENSION: &str = "mdl";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Published parameter sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelVariant {
    /// Text branches plus the profile image branch.
    #[serde(rename = "full_model")]
    Full,
    /// Text branches only.
    #[serde(rename = "text_model")]
    Text,
}

impl ModelVariant {
    pub const ALL: [ModelVariant; 2] = [ModelVariant::Full, ModelVariant::Text];

    pub fn name(&self) -> &'static str {
        match self {
            ModelVariant::Full => "full_model",
            ModelVariant::Text => "text_model",
        }
    }

    pub fn uses_image(&self) -> bool {
        matches!(self, ModelVariant::Full)
    }

    pub fn checkpoint(&self) -> CheckpointSpec {
        let (mirrors, md5): (&[&str], &str) = match self {
            ModelVariant::Full => (&FULL_MODEL_MIRRORS, FULL_MODEL_MD5),
            ModelVariant::Text => (&TEXT_MODEL_MIRRORS, TEXT_MODEL_MD5),
        };
        CheckpointSpec {
            name: self.name().to_string(),
            mirrors: mirrors.iter().map(|m| m.to_string()).collect(),
            md5: md5.to_string(),
        }
    }
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ModelVariant {
    type Err = DemographerError;

    fn from_str(s: &str) -> Result<Self> {
        ModelVariant::ALL
            .into_iter()
            .find(|variant| variant.name() == s)
            .ok_or_else(|| DemographerError::UnknownVariant(s.to_string()))
    }
}

/// Where a checkpoint comes from and what it must hash to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointSpec {
    pub name: String,
    pub mirrors: Vec<String>,
    /// Lowercase hex MD5 digest.
    pub md5: String,
}

impl CheckpointSpec {
    /// Registry lookup by variant name.
    pub fn lookup(name: &str) -> Result<Self> {
        Ok(name.parse::<ModelVariant>()?.checkpoint())
    }

    pub fn file_name(&self) -> String {
        format!("{}.{}", self.name, CHECKPOINT_EXTENSION)
    }
}

/// Steps taken while resolving one checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionState {
    Unresolved,
    Downloading { mirror: String },
    Verifying,
    /// The file matches its digest.
    Verified,
    /// The parameters were copied into a model.
    Loaded,
    Failed,
}

/// The sequence of [`ResolutionState`]s one resolution went through.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolutionReport {
    states: Vec<ResolutionState>,
}

impl ResolutionReport {
    fn push(&mut self, state: ResolutionState) {
        debug!(?state, "checkpoint resolution");
        self.states.push(state);
    }

    pub fn states(&self) -> &[ResolutionState] {
        &self.states
    }

    pub fn last(&self) -> Option<&ResolutionState> {
        self.states.last()
    }

    /// Mirrors attempted, in order.
    pub fn mirrors_tried(&self) -> Vec<&str> {
        self.states
            .iter()
            .filter_map(|state| match state {
                ResolutionState::Downloading { mirror } => Some(mirror.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// Resolves checkpoints into a cache directory.
#[derive(Debug, Clone)]
pub struct ModelResolver {
    cache_dir: PathBuf,
    auto_download: bool,
    timeout: Duration,
}

impl ModelResolver {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            auto_download: cfg!(feature = "auto-download"),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_auto_download(mut self, enable: bool) -> Self {
        self.auto_download = enable;
        self
    }

    /// Per-request network timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn checkpoint_path(&self, spec: &CheckpointSpec) -> PathBuf {
        self.cache_dir.join(spec.file_name())
    }

    /// Path of a verified local copy of `variant`.
    pub fn resolve(&self, variant: &str) -> Result<PathBuf> {
        self.resolve_with_report(variant).1
    }

    pub fn resolve_with_report(&self, variant: &str) -> (ResolutionReport, Result<PathBuf>) {
        let mut report = ResolutionReport::default();
        let result = match CheckpointSpec::lookup(variant) {
            Ok(spec) => return self.resolve_spec(&spec),
            Err(err) => {
                report.push(ResolutionState::Unresolved);
                Err(err)
            }
        };
        self.finish(&mut report, variant, &result);
        (report, result)
    }

    /// Resolve an explicit checkpoint description.
    pub fn resolve_spec(&self, spec: &CheckpointSpec) -> (ResolutionReport, Result<PathBuf>) {
        let mut report = ResolutionReport::default();
        report.push(ResolutionState::Unresolved);
        let result = self.locate(spec, &mut report);
        self.finish(&mut report, &spec.name, &result);
        (report, result)
    }

    /// Resolve `spec`, then hand the verified file to `load`.
    ///
    /// [`ResolutionState::Loaded`] is only recorded once `load` succeeds.
    pub fn resolve_and_load<T, F>(
        &self,
        spec: &CheckpointSpec,
        load: F,
    ) -> (ResolutionReport, Result<T>)
    where
        F: FnOnce(&Path) -> Result<T>,
    {
        let (mut report, resolved) = self.resolve_spec(spec);
        let path = match resolved {
            Ok(path) => path,
            Err(err) => return (report, Err(err)),
        };

        let result = load(&path);
        match &result {
            Ok(_) => {
                info!(variant = %spec.name, path = %path.display(), "checkpoint loaded");
                report.push(ResolutionState::Loaded);
            }
            Err(err) => {
                error!(variant = %spec.name, error = %err, "loading checkpoint failed");
                report.push(ResolutionState::Failed);
            }
        }
        (report, result)
    }

    fn finish(&self, report: &mut ResolutionReport, name: &str, result: &Result<PathBuf>) {
        match result {
            Ok(path) => {
                info!(variant = name, path = %path.display(), "checkpoint verified");
                report.push(ResolutionState::Verified);
            }
            Err(err) => {
                error!(variant = name, error = %err, "checkpoint resolution failed");
                report.push(ResolutionState::Failed);
            }
        }
    }

    fn locate(&self, spec: &CheckpointSpec, report: &mut ResolutionReport) -> Result<PathBuf> {
        fs::create_dir_all(&self.cache_dir)?;
        let target = self.checkpoint_path(spec);

        if target.is_file() {
            debug!(path = %target.display(), "using cached checkpoint");
            report.push(ResolutionState::Verifying);
            verify_checksum(&target, &spec.md5)?;
            return Ok(target);
        }

        if !self.auto_download {
            return Err(DemographerError::DownloadDisabled(target));
        }
        self.download(spec, &target, report)?;
        Ok(target)
    }

    #[cfg(feature = "auto-download")]
    fn download(
        &self,
        spec: &CheckpointSpec,
        target: &Path,
        report: &mut ResolutionReport,
    ) -> Result<()> {
        use rand::seq::SliceRandom;
        use rand::thread_rng;
        use tracing::warn;

        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()?;

        let mut mirrors: Vec<&str> = spec.mirrors.iter().map(String::as_str).collect();
        mirrors.shuffle(&mut thread_rng());

        for mirror in &mirrors {
            report.push(ResolutionState::Downloading {
                mirror: mirror.to_string(),
            });
            info!(variant = %spec.name, mirror, "downloading checkpoint");
            match self.fetch(&client, mirror, spec, target, report) {
                Ok(()) => return Ok(()),
                Err(err) => warn!(mirror, error = %err, "mirror failed"),
            }
        }

        Err(DemographerError::MirrorsExhausted {
            variant: spec.name.clone(),
            attempts: mirrors.len(),
        })
    }

    #[cfg(not(feature = "auto-download"))]
    fn download(
        &self,
        _spec: &CheckpointSpec,
        target: &Path,
        _report: &mut ResolutionReport,
    ) -> Result<()> {
        Err(DemographerError::DownloadDisabled(target.to_path_buf()))
    }

    /// Stream one mirror into a temporary file, verify it, then move it into
    /// the cache. The cache never holds an unverified file.
    #[cfg(feature = "auto-download")]
    fn fetch(
        &self,
        client: &reqwest::blocking::Client,
        mirror: &str,
        spec: &CheckpointSpec,
        target: &Path,
        report: &mut ResolutionReport,
    ) -> Result<()> {
        let mut response = client.get(mirror).send()?.error_for_status()?;
        let expected = response.content_length();

        let mut temp = tempfile::NamedTempFile::new_in(&self.cache_dir)?;
        let received = response.copy_to(temp.as_file_mut())?;
        if let Some(expected) = expected {
            if received != expected {
                return Err(DemographerError::IncompleteDownload { expected, received });
            }
        }
        temp.as_file().sync_all()?;

        report.push(ResolutionState::Verifying);
        verify_checksum(temp.path(), &spec.md5)?;
        temp.persist(target).map_err(|err| err.error)?;
        Ok(())
    }
}

impl Default for ModelResolver {
    fn default() -> Self {
        Self::new(crate::consts::DEFAULT_MODEL_DIR)
    }
}

/// Resolve `variant` into `cache_dir` with the default resolver settings.
pub fn resolve(variant: &str, cache_dir: impl Into<PathBuf>) -> Result<PathBuf> {
    ModelResolver::new(cache_dir).resolve(variant)
}

/// Lowercase hex MD5 of a file, streamed in 1 MiB chunks.
pub fn file_md5(path: &Path) -> Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut context = md5::Context::new();
    let mut buffer = vec![0u8; 1 << 20];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        context.consume(&buffer[..read]);
    }
    Ok(format!("{:x}", context.compute()))
}

/// Fails with [`DemographerError::ChecksumMismatch`] unless `path` hashes to
/// `expected`.
pub fn verify_checksum(path: &Path, expected: &str) -> Result<()> {
    let actual = file_md5(path)?;
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(DemographerError::ChecksumMismatch {
            path: path.to_path_buf(),
            expected: expected.to_lowercase(),
            actual,
        })
    }
}

/// Named tensors of a parameter file.
///
/// `.safetensors` and libtorch archives (`.ot`) are read by their own
/// readers. Anything else, the published `.mdl` files included, is read as a
/// PyTorch pickled state dict.
pub fn read_state_dict(path: &Path, device: Device) -> Result<Vec<(String, Tensor)>> {
    let named = match path.extension().and_then(|ext| ext.to_str()) {
        Some("safetensors") => Tensor::read_safetensors(path)?,
        Some("ot") => Tensor::load_multi_with_device(path, device)?,
        _ => Tensor::loadz_multi_with_device(path, device)?,
    };
    Ok(named)
}

/// Copy the state dict at `path` into `vs`.
///
/// Every variable of `vs` must be present with the same shape. Entries the
/// model has no variable for are ignored.
pub fn load_state_dict(vs: &nn::VarStore, path: &Path) -> Result<()> {
    let mut state: HashMap<String, Tensor> =
        read_state_dict(path, vs.device())?.into_iter().collect();

    let mut variables: Vec<(String, Tensor)> = vs.variables().into_iter().collect();
    variables.sort_by(|a, b| a.0.cmp(&b.0));

    tch::no_grad(|| -> Result<()> {
        for (name, mut variable) in variables {
            let source = state.remove(&name).ok_or_else(|| {
                DemographerError::Checkpoint(format!("{} has no `{}`", path.display(), name))
            })?;
            if source.size() != variable.size() {
                return Err(DemographerError::Checkpoint(format!(
                    "`{}` has shape {:?} in {}, the model expects {:?}",
                    name,
                    source.size(),
                    path.display(),
                    variable.size()
                )));
            }
            variable.f_copy_(&source)?;
        }
        Ok(())
    })?;

    if !state.is_empty() {
        let mut unused: Vec<_> = state.into_keys().collect();
        unused.sort();
        debug!(?unused, "ignoring checkpoint entries without a variable");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO_MD5: &str = "5d41402abc4b2a76b9719d911017c592";

    fn spec(mirrors: &[&str]) -> CheckpointSpec {
        CheckpointSpec {
            name: "tiny_model".to_string(),
            mirrors: mirrors.iter().map(|m| m.to_string()).collect(),
            md5: HELLO_MD5.to_string(),
        }
    }

    #[test]
    fn test_file_md5() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.bin");
        fs::write(&path, b"hello").unwrap();
        assert_eq!(file_md5(&path).unwrap(), HELLO_MD5);
    }

    #[test]
    fn test_single_altered_byte_fails_verification() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.bin");
        fs::write(&path, b"hellp").unwrap();

        let err = verify_checksum(&path, HELLO_MD5).unwrap_err();
        assert!(matches!(err, DemographerError::ChecksumMismatch { .. }));
        assert!(verify_checksum(&path, &file_md5(&path).unwrap()).is_ok());
    }

    #[test]
    fn test_cache_hit() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = ModelResolver::new(dir.path()).with_auto_download(false);
        let spec = spec(&[]);
        fs::write(resolver.checkpoint_path(&spec), b"hello").unwrap();

        let (report, result) = resolver.resolve_spec(&spec);
        assert_eq!(result.unwrap(), dir.path().join("tiny_model.mdl"));
        assert_eq!(
            report.states(),
            &[
                ResolutionState::Unresolved,
                ResolutionState::Verifying,
                ResolutionState::Verified
            ]
        );
    }

    #[test]
    fn test_loaded_only_after_load_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = ModelResolver::new(dir.path()).with_auto_download(false);
        let spec = spec(&[]);
        fs::write(resolver.checkpoint_path(&spec), b"hello").unwrap();

        let (report, result) =
            resolver.resolve_and_load(&spec, |path| fs::read(path).map_err(Into::into));
        assert_eq!(result.unwrap(), b"hello");
        assert_eq!(report.last(), Some(&ResolutionState::Loaded));

        let (report, result) = resolver.resolve_and_load(&spec, |_| -> Result<()> {
            Err(DemographerError::Checkpoint("unreadable".to_string()))
        });
        assert!(matches!(result, Err(DemographerError::Checkpoint(_))));
        assert_eq!(
            report.states(),
            &[
                ResolutionState::Unresolved,
                ResolutionState::Verifying,
                ResolutionState::Verified,
                ResolutionState::Failed
            ]
        );
    }

    #[test]
    fn test_load_never_runs_on_unverified_file() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = ModelResolver::new(dir.path()).with_auto_download(false);
        let spec = spec(&[]);
        fs::write(resolver.checkpoint_path(&spec), b"jello").unwrap();

        let (report, result) = resolver.resolve_and_load(&spec, |_| -> Result<()> {
            panic!("loaded a file that failed verification")
        });
        assert!(matches!(result, Err(DemographerError::ChecksumMismatch { .. })));
        assert_eq!(report.last(), Some(&ResolutionState::Failed));
    }

    #[test]
    fn test_state_dict_must_cover_every_variable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.safetensors");

        let source = nn::VarStore::new(Device::Cpu);
        let _ = source.root().zeros("weight", &[2, 3]);
        source.save(&path).unwrap();

        let target = nn::VarStore::new(Device::Cpu);
        let weight = target.root().ones("weight", &[2, 3]);
        load_state_dict(&target, &path).unwrap();
        assert_eq!(weight.sum(tch::Kind::Float).double_value(&[]), 0.0);

        let wider = nn::VarStore::new(Device::Cpu);
        let _ = wider.root().ones("weight", &[3, 3]);
        assert!(matches!(
            load_state_dict(&wider, &path),
            Err(DemographerError::Checkpoint(_))
        ));

        let extra = nn::VarStore::new(Device::Cpu);
        let _ = extra.root().ones("weight", &[2, 3]);
        let _ = extra.root().ones("bias", &[3]);
        assert!(matches!(
            load_state_dict(&extra, &path),
            Err(DemographerError::Checkpoint(_))
        ));
    }

    #[test]
    fn test_corrupted_cache_is_not_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = ModelResolver::new(dir.path()).with_auto_download(true);
        let spec = spec(&["http://127.0.0.1:9/tiny_model.mdl"]);
        fs::write(resolver.checkpoint_path(&spec), b"jello").unwrap();

        let (report, result) = resolver.resolve_spec(&spec);
        assert!(matches!(
            result,
            Err(DemographerError::ChecksumMismatch { .. })
        ));
        assert_eq!(report.last(), Some(&ResolutionState::Failed));
        assert!(report.mirrors_tried().is_empty());
        assert_eq!(fs::read(resolver.checkpoint_path(&spec)).unwrap(), b"jello");
    }

    #[test]
    fn test_unknown_variant() {
        let dir = tempfile::tempdir().unwrap();
        let (report, result) = ModelResolver::new(dir.path()).resolve_with_report("tiny_model");
        assert!(matches!(result, Err(DemographerError::UnknownVariant(_))));
        assert_eq!(
            report.states(),
            &[ResolutionState::Unresolved, ResolutionState::Failed]
        );
    }

    #[test]
    fn test_download_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("nested/cache");
        let resolver = ModelResolver::new(&cache).with_auto_download(false);

        let err = resolver.resolve("text_model").unwrap_err();
        assert!(matches!(err, DemographerError::DownloadDisabled(_)));
        assert!(cache.is_dir());
    }

    #[test]
    fn test_registry() {
        let full = CheckpointSpec::lookup("full_model").unwrap();
        assert_eq!(full.md5, FULL_MODEL_MD5);
        assert_eq!(full.mirrors.len(), 2);
        assert_eq!(full.file_name(), "full_model.mdl");

        assert_eq!("text_model".parse::<ModelVariant>().unwrap(), ModelVariant::Text);
        assert!(!ModelVariant::Text.uses_image());
        assert!(ModelVariant::Full.uses_image());
        assert!("Full".parse::<ModelVariant>().is_err());
    }

    #[cfg(feature = "auto-download")]
    #[test]
    fn test_all_mirrors_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = ModelResolver::new(dir.path())
            .with_auto_download(true)
            .with_timeout(Duration::from_secs(2));
        let spec = spec(&[
            "http://127.0.0.1:9/a/tiny_model.mdl",
            "http://127.0.0.1:9/b/tiny_model.mdl",
        ]);

        let (report, result) = resolver.resolve_spec(&spec);
        match result {
            Err(DemographerError::MirrorsExhausted { variant, attempts }) => {
                assert_eq!(variant, "tiny_model");
                assert_eq!(attempts, 2);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(report.mirrors_tried().len(), 2);
        assert_eq!(report.last(), Some(&ResolutionState::Failed));
        assert!(!resolver.checkpoint_path(&spec).exists());
    }
}
