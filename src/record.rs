//! Input profile records and their text normalization.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::consts::{UNKNOWN_LANG, URL_PATTERN, URL_SENTINEL};
use crate::error::{DemographerError, Result};

/// One account profile to run inference on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub id: String,
    /// Detected language code of the biography.
    #[serde(rename = "lang", default = "unknown_lang")]
    pub language: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub screen_name: String,
    #[serde(default)]
    pub description: String,
    /// Locally resolved 224x224 profile image (full model only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub img_path: Option<PathBuf>,
}

fn unknown_lang() -> String {
    UNKNOWN_LANG.to_string()
}

impl ProfileRecord {
    pub fn new(
        id: impl Into<String>,
        language: impl Into<String>,
        name: impl Into<String>,
        screen_name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            language: language.into(),
            name: name.into(),
            screen_name: screen_name.into(),
            description: description.into(),
            img_path: None,
        }
    }

    pub fn with_image(mut self, path: impl Into<PathBuf>) -> Self {
        self.img_path = Some(path.into());
        self
    }

    /// Build a record from a Twitter-style user object, or a tweet object
    /// carrying one under `user`.
    ///
    /// The language comes from `options.lang_key` when present, else `un` for
    /// an empty biography, else from the detector. The image comes from
    /// `options.img_path_key` when present, else the default placeholder when
    /// the account uses the default profile image. Fetching or resizing
    /// remote images is left to the caller.
    pub fn from_user_object(
        input: &Value,
        options: &UserObjectOptions<'_>,
        detector: &dyn LanguageDetector,
    ) -> Result<Self> {
        let user = input.get("user").unwrap_or(input);

        let id = string_field(user, "id_str")?;
        let bio = match user.get("description") {
            Some(Value::String(s)) => s.clone(),
            _ => String::new(),
        };

        let language = match options.lang_key.and_then(|key| lookup(user, input, key)) {
            Some(Value::String(code)) => code.clone(),
            _ if bio.is_empty() => UNKNOWN_LANG.to_string(),
            _ => detector
                .detect(&bio)
                .unwrap_or_else(|| UNKNOWN_LANG.to_string()),
        };

        let img_path = match options.img_path_key.and_then(|key| lookup(user, input, key)) {
            Some(Value::String(path)) => Some(PathBuf::from(path)),
            _ if user.get("default_profile_image") == Some(&Value::Bool(true)) => {
                options.default_image.map(Path::to_path_buf)
            }
            _ => None,
        };

        Ok(Self {
            id,
            language,
            name: string_field(user, "name")?,
            screen_name: string_field(user, "screen_name")?,
            description: bio,
            img_path,
        })
    }
}

fn lookup<'a>(user: &'a Value, input: &'a Value, key: &str) -> Option<&'a Value> {
    user.get(key).or_else(|| input.get(key))
}

fn string_field(user: &Value, key: &str) -> Result<String> {
    match user.get(key) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Null) | None => Err(DemographerError::Config(format!(
            "user object is missing `{}`",
            key
        ))),
        Some(other) => Ok(other.to_string()),
    }
}

/// Key overrides used by [`ProfileRecord::from_user_object`].
#[derive(Debug, Default, Clone, Copy)]
pub struct UserObjectOptions<'a> {
    pub img_path_key: Option<&'a str>,
    pub lang_key: Option<&'a str>,
    pub default_image: Option<&'a Path>,
}

/// Black-box language identification.
pub trait LanguageDetector {
    /// Returns a language code such as `"en"`, or `None` when undecided.
    fn detect(&self, text: &str) -> Option<String>;
}

/// Detector that never decides; every record falls back to `un`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDetection;

impl LanguageDetector for NoDetection {
    fn detect(&self, _text: &str) -> Option<String> {
        None
    }
}

impl<F> LanguageDetector for F
where
    F: Fn(&str) -> Option<String>,
{
    fn detect(&self, text: &str) -> Option<String> {
        self(text)
    }
}

/// Replace tab, newline and carriage return with a space.
pub fn normalize_space(text: &str) -> String {
    text.replace(['\t', '\n', '\r'], " ")
}

/// Text normalization applied before encoding.
#[derive(Debug, Clone)]
pub struct TextNormalizer {
    url: Regex,
}

impl Default for TextNormalizer {
    fn default() -> Self {
        Self {
            url: Regex::new(URL_PATTERN).expect("URL pattern is a valid regex"),
        }
    }
}

impl TextNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collapse every URL into a single sentinel character.
    pub fn normalize_url(&self, text: &str) -> String {
        let mut sentinel = [0u8; 4];
        let sentinel = URL_SENTINEL.encode_utf8(&mut sentinel);
        self.url.replace_all(text, &*sentinel).into_owned()
    }

    pub fn name(&self, text: &str) -> String {
        normalize_space(text)
    }

    pub fn description(&self, text: &str) -> String {
        self.normalize_url(&normalize_space(text))
    }
}

/// Load profile records from a JSON Lines file (one object per line).
///
/// # Example
/// ```no_run
/// use demographer::record::load_jsonl;
///
/// let records = load_jsonl("data/profiles.jsonl")?;
/// println!("Loaded {} records", records.len());
/// # Ok::<(), demographer::DemographerError>(())
/// ```
pub fn load_jsonl<P: AsRef<Path>>(path: P) -> Result<Vec<ProfileRecord>> {
    let file = File::open(path.as_ref())?;
    let reader = BufReader::new(file);

    let mut records = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str(&line)?);
    }

    tracing::info!(
        path = %path.as_ref().display(),
        count = records.len(),
        "records loaded"
    );
    Ok(records)
}

/// Load profile records from a JSON array file.
pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Vec<ProfileRecord>> {
    let file = File::open(path.as_ref())?;
    let records: Vec<ProfileRecord> = serde_json::from_reader(BufReader::new(file))?;
    Ok(records)
}
