//! Character and language lookup tables.
//!
//! The [`Vocabulary`] maps single characters, Unicode general category labels
//! (`"Lu"`, `"Po"`, ...) and the special tokens `<empty>` / `<unknown>` to
//! embedding indices. It is loaded once from a JSON object and never mutated.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use unicode_general_category::{get_general_category, GeneralCategory};

use crate::consts::{EMPTY_TOKEN, LANGS, UNKNOWN_LANG};
use crate::error::{DemographerError, Result};

/// Immutable token → index table shared by the username and description branches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Vocabulary {
    table: HashMap<String, i64>,
}

impl Vocabulary {
    /// Build a vocabulary from an explicit table.
    ///
    /// The table must contain the `<empty>` token.
    pub fn from_table(table: HashMap<String, i64>) -> Result<Self> {
        if !table.contains_key(EMPTY_TOKEN) {
            return Err(DemographerError::Vocabulary(format!(
                "missing required token {}",
                EMPTY_TOKEN
            )));
        }
        if let Some((token, index)) = table.iter().find(|(_, &index)| index < 0) {
            return Err(DemographerError::Vocabulary(format!(
                "negative index {} for token {:?}",
                index, token
            )));
        }
        Ok(Self { table })
    }

    /// Load a vocabulary stored as a JSON object (`{"a": 12, "Lu": 3, ...}`).
    ///
    /// A missing file is reported as [`DemographerError::Vocabulary`] naming
    /// the expected path.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = match std::fs::read_to_string(path.as_ref()) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(DemographerError::Vocabulary(format!(
                    "no vocabulary at {}; export the m3inference `emb.pkl` table as a JSON \
                     object of token to index (see the crate docs)",
                    path.as_ref().display()
                )));
            }
            Err(err) => return Err(err.into()),
        };
        let table: HashMap<String, i64> = serde_json::from_str(&content)?;
        let vocab = Self::from_table(table)?;
        tracing::info!(
            path = %path.as_ref().display(),
            entries = vocab.len(),
            "vocabulary loaded"
        );
        Ok(vocab)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Index of the `<empty>` placeholder.
    pub fn empty_index(&self) -> i64 {
        self.table[EMPTY_TOKEN]
    }

    /// Index used when neither the character nor its category is known.
    pub fn oov_index(&self) -> i64 {
        self.table.len() as i64 + 1
    }

    /// Largest index this vocabulary can produce.
    pub fn max_index(&self) -> i64 {
        let max_entry = self.table.values().copied().max().unwrap_or(0);
        max_entry.max(self.oov_index())
    }

    /// Resolve one character: exact entry, then general category, then OOV.
    pub fn index_of(&self, c: char) -> i64 {
        let mut buf = [0u8; 4];
        if let Some(&index) = self.table.get(&*c.encode_utf8(&mut buf)) {
            return index;
        }
        match self.table.get(category_label(c)) {
            Some(&index) => index,
            None => self.oov_index(),
        }
    }

    /// Fail if any index produced by this table falls outside an embedding of
    /// `embedding_size` rows.
    pub fn check_fits(&self, embedding_size: i64) -> Result<()> {
        let max_index = self.max_index();
        if max_index >= embedding_size {
            return Err(DemographerError::Vocabulary(format!(
                "index {} does not fit an embedding table of {} rows",
                max_index, embedding_size
            )));
        }
        Ok(())
    }
}

/// Two-letter Unicode general category label of a character.
#[allow(unreachable_patterns)]
pub fn category_label(c: char) -> &'static str {
    use GeneralCategory::*;

    match get_general_category(c) {
        UppercaseLetter => "Lu",
        LowercaseLetter => "Ll",
        TitlecaseLetter => "Lt",
        ModifierLetter => "Lm",
        OtherLetter => "Lo",
        NonspacingMark => "Mn",
        SpacingMark => "Mc",
        EnclosingMark => "Me",
        DecimalNumber => "Nd",
        LetterNumber => "Nl",
        OtherNumber => "No",
        ConnectorPunctuation => "Pc",
        DashPunctuation => "Pd",
        OpenPunctuation => "Ps",
        ClosePunctuation => "Pe",
        InitialPunctuation => "Pi",
        FinalPunctuation => "Pf",
        OtherPunctuation => "Po",
        MathSymbol => "Sm",
        CurrencySymbol => "Sc",
        ModifierSymbol => "Sk",
        OtherSymbol => "So",
        SpaceSeparator => "Zs",
        LineSeparator => "Zl",
        ParagraphSeparator => "Zp",
        Control => "Cc",
        Format => "Cf",
        Surrogate => "Cs",
        PrivateUse => "Co",
        Unassigned => "Cn",
        _ => "Cn",
    }
}

/// Maps detected language codes onto the language embedding rows.
#[derive(Debug, Clone)]
pub struct LanguageTable {
    index: HashMap<&'static str, i64>,
    unknown: i64,
}

impl Default for LanguageTable {
    fn default() -> Self {
        let index: HashMap<&'static str, i64> = LANGS
            .iter()
            .enumerate()
            .map(|(i, &code)| (code, i as i64))
            .collect();
        let unknown = index[UNKNOWN_LANG];
        Self { index, unknown }
    }
}

impl LanguageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of `code`, or of the reserved unknown entry.
    pub fn index_of(&self, code: &str) -> i64 {
        self.index.get(code).copied().unwrap_or(self.unknown)
    }

    pub fn unknown_index(&self) -> i64 {
        self.unknown
    }

    pub fn is_known(&self, code: &str) -> bool {
        self.index.contains_key(code)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Small table used by the encoder and model tests.
    pub(crate) fn sample_vocab() -> Vocabulary {
        let mut table = HashMap::new();
        table.insert("<empty>".to_string(), 1);
        table.insert("<unknown>".to_string(), 2);
        for (i, c) in "abcdefghijklmnopqrstuvwxyz ".chars().enumerate() {
            table.insert(c.to_string(), 3 + i as i64);
        }
        table.insert("Lu".to_string(), 40);
        table.insert("Po".to_string(), 41);
        table.insert("Nd".to_string(), 42);
        Vocabulary::from_table(table).unwrap()
    }

    #[test]
    fn test_exact_lookup() {
        let vocab = sample_vocab();
        assert_eq!(vocab.index_of('a'), 3);
        assert_eq!(vocab.index_of(' '), 29);
    }

    #[test]
    fn test_category_fallback() {
        let vocab = sample_vocab();
        assert_eq!(vocab.index_of('Q'), 40);
        assert_eq!(vocab.index_of('!'), 41);
        assert_eq!(vocab.index_of('7'), 42);
    }

    #[test]
    fn test_oov_when_category_unmapped() {
        let vocab = sample_vocab();
        // Math symbol, category "Sm" is not registered
        assert_eq!(vocab.index_of('+'), vocab.len() as i64 + 1);
        assert_eq!(vocab.index_of('+'), vocab.oov_index());
    }

    #[test]
    fn test_missing_empty_token_rejected() {
        let mut table = HashMap::new();
        table.insert("a".to_string(), 1);
        assert!(Vocabulary::from_table(table).is_err());
    }

    #[test]
    fn test_check_fits() {
        let vocab = sample_vocab();
        assert!(vocab.check_fits(3035).is_ok());
        assert!(vocab.check_fits(10).is_err());
    }

    #[test]
    fn test_load_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vocab.json");
        std::fs::write(&path, r#"{"<empty>": 1, "x": 2, "Ll": 3}"#).unwrap();

        let vocab = Vocabulary::load(&path).unwrap();
        assert_eq!(vocab.len(), 3);
        assert_eq!(vocab.index_of('x'), 2);
        assert_eq!(vocab.index_of('y'), 3);
        assert_eq!(vocab.empty_index(), 1);
    }

    #[test]
    fn test_missing_file_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vocab.json");
        match Vocabulary::load(&path) {
            Err(DemographerError::Vocabulary(message)) => {
                assert!(message.contains(&path.display().to_string()));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_category_labels() {
        assert_eq!(category_label('A'), "Lu");
        assert_eq!(category_label('a'), "Ll");
        assert_eq!(category_label('.'), "Po");
        assert_eq!(category_label('('), "Ps");
        assert_eq!(category_label('$'), "Sc");
        assert_eq!(category_label('\u{20CC}'), "Cn");
        assert_eq!(category_label('\t'), "Cc");
    }

    #[test]
    fn test_language_table() {
        let langs = LanguageTable::new();
        assert_eq!(langs.len(), 34);
        assert_eq!(langs.index_of("en"), 0);
        assert_eq!(langs.index_of("fr"), 2);
        assert_eq!(langs.index_of("un"), 33);
        assert_eq!(langs.index_of("zz"), langs.unknown_index());
        assert!(!langs.is_known("zz"));
    }
}
