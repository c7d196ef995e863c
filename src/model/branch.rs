//! Language-conditioned recurrent encoder for one text field.

use tch::nn::{self, Module};
use tch::Tensor;

use super::lstm::PackedBiLstm;
use super::packing::LengthSort;
use crate::error::{DemographerError, Result};

/// Sizes of one branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchDims {
    pub vocab_size: i64,
    pub embed_dim: i64,
    pub lang_vocab_size: i64,
    pub lang_embed_dim: i64,
    pub hidden: i64,
    pub layers: i64,
}

/// Embedding → language concat → dense → packed biLSTM.
///
/// Parameters live under `{name}_lang_embed`, `{name}_embed`, `{name}_dense`
/// and `{name}_lstm`.
#[derive(Debug)]
pub struct BranchEncoder {
    name: &'static str,
    lang_embed: nn::Embedding,
    embed: nn::Embedding,
    dense: nn::Linear,
    lstm: PackedBiLstm,
    lang_embed_dim: i64,
}

impl BranchEncoder {
    pub fn new(root: &nn::Path, name: &'static str, dims: BranchDims) -> Self {
        let lang_embed = nn::embedding(
            root / format!("{}_lang_embed", name),
            dims.lang_vocab_size,
            dims.lang_embed_dim,
            Default::default(),
        );
        let embed = nn::embedding(
            root / format!("{}_embed", name),
            dims.vocab_size,
            dims.embed_dim,
            Default::default(),
        );
        let dense = nn::linear(
            root / format!("{}_dense", name),
            dims.embed_dim + dims.lang_embed_dim,
            dims.embed_dim,
            Default::default(),
        );
        let lstm = PackedBiLstm::new(
            &(root / format!("{}_lstm", name)),
            dims.embed_dim,
            dims.hidden,
            dims.layers,
        );

        BranchEncoder {
            name,
            lang_embed,
            embed,
            dense,
            lstm,
            lang_embed_dim: dims.lang_embed_dim,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Width of the vector produced per record.
    pub fn output_dim(&self) -> i64 {
        2 * self.lstm.hidden_size()
    }

    /// Encode a batch.
    ///
    /// * `lang` - `[batch]` language ids
    /// * `chars` - `[batch, capacity]` field indices
    /// * `lengths` - valid length of every row, each in `1..=capacity`
    ///
    /// Returns `[batch, 2 * hidden]` in the original row order.
    pub fn forward(&self, lang: &Tensor, chars: &Tensor, lengths: &[usize]) -> Result<Tensor> {
        let size = chars.size();
        let (batch, capacity) = (size[0], size[1]);
        if lengths.len() as i64 != batch {
            return Err(DemographerError::Shape(format!(
                "{} branch: {} lengths for a batch of {}",
                self.name,
                lengths.len(),
                batch
            )));
        }
        if let Some(&len) = lengths.iter().find(|&&len| len as i64 > capacity) {
            return Err(DemographerError::Shape(format!(
                "{} branch: length {} exceeds capacity {}",
                self.name, len, capacity
            )));
        }

        let lang_embedded = self
            .lang_embed
            .forward(lang)
            .unsqueeze(1)
            .expand([batch, capacity, self.lang_embed_dim], false);
        let embedded = self.embed.forward(chars);
        let projected = self
            .dense
            .forward(&Tensor::cat(&[embedded, lang_embedded], 2));

        let sort = LengthSort::new(lengths)?;
        let encoded = self
            .lstm
            .forward(&sort.sort_tensor(&projected), &sort.active_counts());
        Ok(sort.unsort_tensor(&encoded))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    fn dims() -> BranchDims {
        BranchDims {
            vocab_size: 50,
            embed_dim: 6,
            lang_vocab_size: 35,
            lang_embed_dim: 2,
            hidden: 5,
            layers: 2,
        }
    }

    fn inputs() -> (Tensor, Tensor, Vec<usize>) {
        let lang = Tensor::from_slice(&[0i64, 3, 33, 0]);
        let chars = Tensor::randint(50, [4, 7], (Kind::Int64, Device::Cpu));
        (lang, chars, vec![2, 7, 2, 5])
    }

    #[test]
    fn test_output_shape_and_names() {
        tch::manual_seed(1);
        let vs = nn::VarStore::new(Device::Cpu);
        let branch = BranchEncoder::new(&vs.root(), "username", dims());
        let (lang, chars, lengths) = inputs();

        let out = tch::no_grad(|| branch.forward(&lang, &chars, &lengths)).unwrap();
        assert_eq!(out.size(), vec![4, branch.output_dim()]);

        let vars = vs.variables();
        assert!(vars.contains_key("username_embed.weight"));
        assert!(vars.contains_key("username_lang_embed.weight"));
        assert!(vars.contains_key("username_dense.bias"));
        assert!(vars.contains_key("username_lstm.weight_ih_l0"));
    }

    #[test]
    fn test_output_follows_input_order() {
        tch::manual_seed(2);
        let vs = nn::VarStore::new(Device::Cpu);
        let branch = BranchEncoder::new(&vs.root(), "des", dims());
        let (lang, chars, lengths) = inputs();

        let full = tch::no_grad(|| branch.forward(&lang, &chars, &lengths)).unwrap();
        for row in 0..4i64 {
            let single = tch::no_grad(|| {
                branch.forward(
                    &lang.narrow(0, row, 1),
                    &chars.narrow(0, row, 1),
                    &lengths[row as usize..row as usize + 1],
                )
            })
            .unwrap();
            assert!(full.narrow(0, row, 1).allclose(&single, 1e-5, 1e-5, false));
        }
    }

    #[test]
    fn test_rejects_bad_lengths() {
        let vs = nn::VarStore::new(Device::Cpu);
        let branch = BranchEncoder::new(&vs.root(), "screenname", dims());
        let (lang, chars, _) = inputs();

        assert!(branch.forward(&lang, &chars, &[1, 1, 1]).is_err());
        assert!(branch.forward(&lang, &chars, &[1, 8, 1, 1]).is_err());
        assert!(branch.forward(&lang, &chars, &[1, 0, 1, 1]).is_err());
    }
}
