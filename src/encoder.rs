//! Feature encoding: profile text → fixed-length index sequences.
//!
//! Every field is encoded into a sequence of exactly `capacity` indices plus
//! a `valid_length` in `1..=capacity`. Positions past `valid_length` hold the
//! padding index `0`. Encoding is a pure function of the record and the
//! vocabulary and never fails.

use std::path::PathBuf;
use std::sync::Arc;

use rayon::prelude::*;

use crate::consts::{
    DES_LEN, EMPTY_SCREENNAME_CODE, EMBEDDING_INPUT_SIZE_ASCII, NON_ASCII_SCREENNAME_CODE,
    SCREENNAME_LEN, USERNAME_LEN,
};
use crate::error::{DemographerError, Result};
use crate::record::{ProfileRecord, TextNormalizer};
use crate::vocab::{LanguageTable, Vocabulary};

/// A fixed-capacity encoded text field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedField {
    indices: Vec<i64>,
    valid_length: usize,
}

impl EncodedField {
    /// Encode `text`, truncating to `capacity`.
    ///
    /// `empty_index` is written at position 0 when the text is blank.
    fn build<I>(text: &str, capacity: usize, empty_index: i64, map: I) -> Self
    where
        I: Fn(char) -> i64,
    {
        let mut indices = vec![0i64; capacity];

        if text.trim_matches(' ').is_empty() {
            indices[0] = empty_index;
            return Self {
                indices,
                valid_length: 1,
            };
        }

        let mut valid_length = 0;
        for (slot, c) in indices.iter_mut().zip(text.chars()) {
            *slot = map(c);
            valid_length += 1;
        }

        Self {
            indices,
            valid_length,
        }
    }

    pub fn indices(&self) -> &[i64] {
        &self.indices
    }

    pub fn valid_length(&self) -> usize {
        self.valid_length
    }

    pub fn capacity(&self) -> usize {
        self.indices.len()
    }
}

/// All model inputs derived from one [`ProfileRecord`].
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedRecord {
    pub language_id: i64,
    pub username: EncodedField,
    pub screen_name: EncodedField,
    pub description: EncodedField,
    /// Image to feed the vision branch; `None` means the placeholder image.
    pub image: Option<PathBuf>,
}

/// Field capacities of the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldCapacities {
    pub username: usize,
    pub screen_name: usize,
    pub description: usize,
}

impl Default for FieldCapacities {
    fn default() -> Self {
        Self {
            username: USERNAME_LEN,
            screen_name: SCREENNAME_LEN,
            description: DES_LEN,
        }
    }
}

/// Turns records into [`EncodedRecord`]s with an immutable vocabulary.
#[derive(Debug, Clone)]
pub struct FeatureEncoder {
    vocab: Arc<Vocabulary>,
    languages: LanguageTable,
    normalizer: TextNormalizer,
    capacities: FieldCapacities,
}

impl FeatureEncoder {
    pub fn new(vocab: Arc<Vocabulary>) -> Self {
        Self {
            vocab,
            languages: LanguageTable::new(),
            normalizer: TextNormalizer::new(),
            capacities: FieldCapacities::default(),
        }
    }

    /// Override the field capacities. Every capacity must be at least 1,
    /// since a blank field still occupies one position.
    pub fn with_capacities(mut self, capacities: FieldCapacities) -> Result<Self> {
        let FieldCapacities {
            username,
            screen_name,
            description,
        } = capacities;
        if username == 0 || screen_name == 0 || description == 0 {
            return Err(DemographerError::Config(format!(
                "field capacities must be at least 1, got {:?}",
                capacities
            )));
        }
        self.capacities = capacities;
        Ok(self)
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocab
    }

    pub fn capacities(&self) -> FieldCapacities {
        self.capacities
    }

    pub fn encode(&self, record: &ProfileRecord, use_image: bool) -> EncodedRecord {
        let name = self.normalizer.name(&record.name);
        let screen_name = self.normalizer.name(&record.screen_name);
        let description = self.normalizer.description(&record.description);

        EncodedRecord {
            language_id: self.languages.index_of(&record.language),
            username: self.encode_text(&name, self.capacities.username),
            screen_name: self.encode_screen_name(&screen_name),
            description: self.encode_text(&description, self.capacities.description),
            image: if use_image {
                record.img_path.clone()
            } else {
                None
            },
        }
    }

    /// Encode a batch on the rayon pool. Output order matches input order.
    pub fn encode_batch(&self, records: &[ProfileRecord], use_image: bool) -> Vec<EncodedRecord> {
        records
            .par_iter()
            .map(|record| self.encode(record, use_image))
            .collect()
    }

    /// Username/description encoding through the vocabulary.
    pub(crate) fn encode_text(&self, text: &str, capacity: usize) -> EncodedField {
        EncodedField::build(text, capacity, self.vocab.empty_index(), |c| {
            self.vocab.index_of(c)
        })
    }

    /// Byte-wise ASCII encoding used by the screen name branch.
    pub fn encode_screen_name(&self, text: &str) -> EncodedField {
        EncodedField::build(
            text,
            self.capacities.screen_name,
            EMPTY_SCREENNAME_CODE,
            |c| {
                let code = c as i64;
                if code < EMBEDDING_INPUT_SIZE_ASCII {
                    code
                } else {
                    NON_ASCII_SCREENNAME_CODE
                }
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vocab::tests::sample_vocab;

    fn encoder() -> FeatureEncoder {
        FeatureEncoder::new(Arc::new(sample_vocab()))
    }

    fn assert_well_formed(field: &EncodedField) {
        assert!(field.valid_length() >= 1);
        assert!(field.valid_length() <= field.capacity());
        assert!(field.indices()[field.valid_length()..].iter().all(|&i| i == 0));
    }

    #[test]
    fn test_zero_capacity_is_rejected() {
        let zero = FieldCapacities {
            screen_name: 0,
            ..FieldCapacities::default()
        };
        assert!(matches!(
            encoder().with_capacities(zero),
            Err(DemographerError::Config(_))
        ));

        let short = FieldCapacities {
            username: 1,
            screen_name: 1,
            description: 1,
        };
        let enc = encoder().with_capacities(short).unwrap();
        let encoded = enc.encode(&ProfileRecord::new("1", "en", "", "", ""), false);
        assert_eq!(encoded.username.indices(), &[enc.vocabulary().empty_index()]);
        assert_eq!(encoded.screen_name.indices(), &[EMPTY_SCREENNAME_CODE]);

        let encoded = enc.encode(&ProfileRecord::new("2", "en", "ann", "ann", "hi"), false);
        assert_eq!(encoded.description.valid_length(), 1);
        assert_well_formed(&encoded.screen_name);
    }

    #[test]
    fn test_empty_description() {
        let enc = encoder();
        let record = ProfileRecord::new("1", "en", "ann", "ann", "");
        let encoded = enc.encode(&record, false);

        assert_eq!(encoded.description.valid_length(), 1);
        assert_eq!(encoded.description.indices()[0], enc.vocabulary().empty_index());
        assert_eq!(encoded.description.capacity(), DES_LEN);
        assert_well_formed(&encoded.description);
    }

    #[test]
    fn test_blank_username_uses_empty_token() {
        let enc = encoder();
        let field = enc.encode_text("   ", USERNAME_LEN);
        assert_eq!(field.valid_length(), 1);
        assert_eq!(field.indices()[0], 1);
    }

    #[test]
    fn test_screen_name_ascii() {
        let enc = encoder();
        let field = enc.encode_screen_name("abc");

        let mut expected = vec![0i64; SCREENNAME_LEN];
        expected[..3].copy_from_slice(&[97, 98, 99]);
        assert_eq!(field.indices(), expected.as_slice());
        assert_eq!(field.valid_length(), 3);
    }

    #[test]
    fn test_empty_screen_name_is_space() {
        let enc = encoder();
        let field = enc.encode_screen_name("");
        assert_eq!(field.indices()[0], 32);
        assert_eq!(field.valid_length(), 1);
        assert_well_formed(&field);
    }

    #[test]
    fn test_non_ascii_screen_name_stays_in_range() {
        let enc = encoder();
        let field = enc.encode_screen_name("é_1");
        assert_eq!(field.indices()[..3], [63i64, 95, 49]);
    }

    #[test]
    fn test_username_truncated() {
        let enc = encoder();
        let long_name = "abcdefghij".repeat(5);
        let record = ProfileRecord::new("1", "en", long_name, "x", "y");
        let encoded = enc.encode(&record, false);

        assert_eq!(encoded.username.valid_length(), USERNAME_LEN);
        assert_eq!(encoded.username.capacity(), USERNAME_LEN);
        assert!(encoded.username.indices().iter().all(|&i| i != 0));
    }

    #[test]
    fn test_truncation_counts_characters() {
        let enc = encoder();
        let field = enc.encode_text(&"é".repeat(40), USERNAME_LEN);
        assert_eq!(field.valid_length(), USERNAME_LEN);
    }

    #[test]
    fn test_whitespace_and_url_normalized() {
        let enc = encoder();
        let record = ProfileRecord::new("1", "en", "a\tb", "x", "go https://t.co/abc");
        let encoded = enc.encode(&record, false);

        // tab becomes a space
        assert_eq!(encoded.username.indices()[1], enc.vocabulary().index_of(' '));
        // "go " + one sentinel
        assert_eq!(encoded.description.valid_length(), 4);
        assert_eq!(
            encoded.description.indices()[3],
            enc.vocabulary().index_of('\u{20CC}')
        );
    }

    #[test]
    fn test_fallback_chain() {
        let enc = encoder();
        let field = enc.encode_text("aQ!+", USERNAME_LEN);
        let vocab = enc.vocabulary();
        assert_eq!(field.indices()[..4], [3, 40, 41, vocab.oov_index()]);
    }

    #[test]
    fn test_unknown_language() {
        let enc = encoder();
        let record = ProfileRecord::new("1", "xx", "a", "b", "c");
        assert_eq!(enc.encode(&record, false).language_id, 33);
        let record = ProfileRecord::new("1", "de", "a", "b", "c");
        assert_eq!(enc.encode(&record, false).language_id, 14);
    }

    #[test]
    fn test_image_only_when_requested() {
        let enc = encoder();
        let record = ProfileRecord::new("1", "en", "a", "b", "c").with_image("a.png");
        assert!(enc.encode(&record, false).image.is_none());
        assert_eq!(enc.encode(&record, true).image, Some(PathBuf::from("a.png")));
    }

    #[test]
    fn test_deterministic_and_batch_order() {
        let enc = encoder();
        let records: Vec<ProfileRecord> = (0..50)
            .map(|i| {
                ProfileRecord::new(
                    i.to_string(),
                    "en",
                    format!("user {}", i),
                    format!("u{}", i),
                    "x".repeat(i),
                )
            })
            .collect();

        let first = enc.encode_batch(&records, false);
        let second = enc.encode_batch(&records, false);
        assert_eq!(first, second);

        for (record, encoded) in records.iter().zip(&first) {
            assert_eq!(encoded, &enc.encode(record, false));
            assert_well_formed(&encoded.username);
            assert_well_formed(&encoded.screen_name);
            assert_well_formed(&encoded.description);
        }
    }
}
