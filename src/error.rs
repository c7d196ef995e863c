//! Error types shared across the crate.

use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DemographerError>;

/// Everything that can go wrong while loading or running the engine.
///
/// Encoding never produces an error: unknown characters fall back to
/// category or out-of-vocabulary indices and over-long fields are truncated.
#[derive(Error, Debug)]
pub enum DemographerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("torch error: {0}")]
    Tch(#[from] tch::TchError),

    #[cfg(feature = "auto-download")]
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unknown model variant `{0}` (expected one of: full_model, text_model)")]
    UnknownVariant(String),

    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("download of `{variant}` failed on all {attempts} mirrors")]
    MirrorsExhausted { variant: String, attempts: usize },

    #[error("incomplete download: expected {expected} bytes, received {received}")]
    IncompleteDownload { expected: u64, received: u64 },

    #[error("checkpoint {0} not found and auto-download is disabled")]
    DownloadDisabled(PathBuf),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("vocabulary error: {0}")]
    Vocabulary(String),

    #[error("shape error: {0}")]
    Shape(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("image not found: {0}")]
    MissingImage(PathBuf),
}
