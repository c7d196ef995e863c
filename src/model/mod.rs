//! The multi-branch network: per-field recurrent encoders, an optional
//! vision branch and the fusion heads, plus the replica set that runs it.

pub mod branch;
pub mod fusion;
pub mod lstm;
pub mod network;
pub mod packing;
pub mod replica;
pub mod vision;

pub use fusion::{HeadOutputs, Label};
pub use network::{BatchInput, DemographicModel};
pub use replica::{Replica, ReplicaSet};
pub use vision::ImageLoader;

use crate::consts::{
    EMBEDDING_INPUT_SIZE, EMBEDDING_INPUT_SIZE_ASCII, EMBEDDING_INPUT_SIZE_LANGS,
    EMBEDDING_OUTPUT_SIZE, EMBEDDING_OUTPUT_SIZE_ASCII, EMBEDDING_OUTPUT_SIZE_LANGS,
    LSTM_HIDDEN_SIZE, LSTM_LAYERS, MERGE_DENSE_SIZE, VISION_OUTPUT_SIZE,
};
use branch::BranchDims;

/// Layer sizes of a [`DemographicModel`].
///
/// The defaults match the published checkpoints. Smaller values are only
/// useful for randomly initialised engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelDims {
    /// Character table shared by the username and description branches.
    pub char_vocab: i64,
    pub char_embed: i64,
    /// Byte table of the screen name branch.
    pub ascii_vocab: i64,
    pub ascii_embed: i64,
    pub lang_vocab: i64,
    pub lang_embed: i64,
    pub hidden: i64,
    pub layers: i64,
    pub merge: i64,
    pub vision_out: i64,
}

impl Default for ModelDims {
    fn default() -> Self {
        Self {
            char_vocab: EMBEDDING_INPUT_SIZE,
            char_embed: EMBEDDING_OUTPUT_SIZE,
            ascii_vocab: EMBEDDING_INPUT_SIZE_ASCII,
            ascii_embed: EMBEDDING_OUTPUT_SIZE_ASCII,
            lang_vocab: EMBEDDING_INPUT_SIZE_LANGS,
            lang_embed: EMBEDDING_OUTPUT_SIZE_LANGS,
            hidden: LSTM_HIDDEN_SIZE,
            layers: LSTM_LAYERS,
            merge: MERGE_DENSE_SIZE,
            vision_out: VISION_OUTPUT_SIZE,
        }
    }
}

impl ModelDims {
    pub(crate) fn char_branch(&self) -> BranchDims {
        BranchDims {
            vocab_size: self.char_vocab,
            embed_dim: self.char_embed,
            lang_vocab_size: self.lang_vocab,
            lang_embed_dim: self.lang_embed,
            hidden: self.hidden,
            layers: self.layers,
        }
    }

    pub(crate) fn ascii_branch(&self) -> BranchDims {
        BranchDims {
            vocab_size: self.ascii_vocab,
            embed_dim: self.ascii_embed,
            ..self.char_branch()
        }
    }

    /// Width of the concatenated branch vectors.
    pub fn fusion_input(&self, with_vision: bool) -> i64 {
        let text = 3 * 2 * self.hidden;
        if with_vision {
            text + self.vision_out
        } else {
            text
        }
    }

    /// Small layers for fast forward passes in tests.
    #[cfg(test)]
    pub(crate) fn tiny() -> Self {
        Self {
            char_vocab: 48,
            char_embed: 6,
            ascii_vocab: EMBEDDING_INPUT_SIZE_ASCII,
            ascii_embed: 4,
            lang_vocab: EMBEDDING_INPUT_SIZE_LANGS,
            lang_embed: 3,
            hidden: 5,
            layers: 2,
            merge: 7,
            vision_out: 8,
        }
    }
}
