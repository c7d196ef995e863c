//! Fixed architecture and data constants of the pretrained models.

/// Default inference batch size.
pub const BATCH_SIZE: usize = 16;

/// Character embedding table size shared by the username and description branches.
pub const EMBEDDING_INPUT_SIZE: i64 = 3035;
pub const EMBEDDING_OUTPUT_SIZE: i64 = 128;

/// Screen names are embedded byte-wise over the ASCII range.
pub const EMBEDDING_INPUT_SIZE_ASCII: i64 = 128;
pub const EMBEDDING_OUTPUT_SIZE_ASCII: i64 = 16;

pub const EMBEDDING_OUTPUT_SIZE_LANGS: i64 = 8;

pub const LSTM_LAYERS: i64 = 2;
pub const LSTM_HIDDEN_SIZE: i64 = 256;

/// Width of the shared layer feeding the three heads.
pub const MERGE_DENSE_SIZE: i64 = 256;

/// Width of the vision branch output.
pub const VISION_OUTPUT_SIZE: i64 = 2048;
pub const IMAGE_SIZE: i64 = 224;

pub const USERNAME_LEN: usize = 30;
pub const SCREENNAME_LEN: usize = 16;
pub const DES_LEN: usize = 200;

/// Screen name placeholder for empty input (ASCII space).
pub const EMPTY_SCREENNAME_CODE: i64 = 32;
/// Non-ASCII screen name characters collapse to `?`.
pub const NON_ASCII_SCREENNAME_CODE: i64 = 63;

/// Sentinel substituted for every URL found in a description.
pub const URL_SENTINEL: char = '\u{20CC}';
pub const URL_PATTERN: &str =
    r"http[s]?://(?:[a-zA-Z]|[0-9]|[$-_@.&+]|[!*\(\),]|(?:%[0-9a-fA-F][0-9a-fA-F]))+";

pub const EMPTY_TOKEN: &str = "<empty>";
pub const UNKNOWN_TOKEN: &str = "<unknown>";

/// Language codes known to the language embedding, in index order.
/// The last entry is the reserved "unknown" code.
pub const LANGS: [&str; 34] = [
    "en", "cs", "fr", "nl", "ar", "ro", "bs", "da", "it", "pt", "no", "es", "hr", "tr", "de", "fi",
    "el", "he", "ru", "bg", "hu", "sk", "et", "pl", "lv", "sl", "lt", "ga", "eu", "mt", "cy", "rm",
    "is", "un",
];
pub const UNKNOWN_LANG: &str = "un";
pub const EMBEDDING_INPUT_SIZE_LANGS: i64 = LANGS.len() as i64 + 1;

pub const GENDER_CATS: [&str; 2] = ["male", "female"];
pub const AGE_CATS: [&str; 4] = ["<=18", "19-29", "30-39", ">=40"];
pub const ORG_CATS: [&str; 2] = ["non-org", "is-org"];

/// Mirrors and MD5 digests of the published checkpoints.
pub const FULL_MODEL_MIRRORS: [&str; 2] = [
    "https://nlp.stanford.edu/~zijwang/m3inference/full_model.mdl",
    "https://blablablab.si.umich.edu/projects/m3/models/full_model.mdl",
];
pub const FULL_MODEL_MD5: &str = "7dd11b9d89d7fd209e3baa0058baa4a1";

pub const TEXT_MODEL_MIRRORS: [&str; 2] = [
    "https://nlp.stanford.edu/~zijwang/m3inference/text_model.mdl",
    "https://blablablab.si.umich.edu/projects/m3/models/text_model.mdl",
];
pub const TEXT_MODEL_MD5: &str = "c9a9fbd953b3ad5d84e792c3c50392ad";

pub const DEFAULT_MODEL_DIR: &str = "models";
pub const DEFAULT_VOCAB_PATH: &str = "models/vocab.json";
