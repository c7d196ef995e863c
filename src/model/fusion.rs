//! Branch fusion and the three classification heads.

use std::fmt;
use std::str::FromStr;

use tch::nn::{self, Module};
use tch::{Device, Kind, Tensor};

use crate::consts::{AGE_CATS, GENDER_CATS, ORG_CATS};
use crate::error::{DemographerError, Result};

/// One of the three predicted attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Label {
    Gender,
    Age,
    Org,
}

impl Label {
    pub const ALL: [Label; 3] = [Label::Gender, Label::Age, Label::Org];

    pub fn as_str(&self) -> &'static str {
        match self {
            Label::Gender => "gender",
            Label::Age => "age",
            Label::Org => "org",
        }
    }

    /// Category names in output order.
    pub fn categories(&self) -> &'static [&'static str] {
        match self {
            Label::Gender => &GENDER_CATS,
            Label::Age => &AGE_CATS,
            Label::Org => &ORG_CATS,
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Label {
    type Err = DemographerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gender" => Ok(Label::Gender),
            "age" => Ok(Label::Age),
            "org" => Ok(Label::Org),
            other => Err(DemographerError::Config(format!(
                "unknown label `{}` (expected gender, age or org)",
                other
            ))),
        }
    }
}

/// Softmax outputs of the three heads, `[batch, categories]` each.
#[derive(Debug)]
pub struct HeadOutputs {
    pub gender: Tensor,
    pub age: Tensor,
    pub org: Tensor,
}

impl HeadOutputs {
    pub fn get(&self, label: Label) -> &Tensor {
        match label {
            Label::Gender => &self.gender,
            Label::Age => &self.age,
            Label::Org => &self.org,
        }
    }

    pub fn to_device(&self, device: Device) -> Self {
        HeadOutputs {
            gender: self.gender.to_device(device),
            age: self.age.to_device(device),
            org: self.org.to_device(device),
        }
    }

    /// Concatenate sub-batch outputs along the batch dimension, in order.
    pub fn cat(parts: &[HeadOutputs]) -> Self {
        let field = |label| parts.iter().map(|part| part.get(label)).collect::<Vec<_>>();
        HeadOutputs {
            gender: Tensor::cat(&field(Label::Gender), 0),
            age: Tensor::cat(&field(Label::Age), 0),
            org: Tensor::cat(&field(Label::Org), 0),
        }
    }
}

/// Shared dense + ReLU projection followed by independent softmax heads.
#[derive(Debug)]
pub struct FusionHeads {
    merge: nn::Linear,
    gender: nn::Linear,
    age: nn::Linear,
    org: nn::Linear,
}

impl FusionHeads {
    pub fn new(root: &nn::Path, input_dim: i64, hidden: i64) -> Self {
        FusionHeads {
            merge: nn::linear(root / "merge_dense", input_dim, hidden, Default::default()),
            gender: nn::linear(
                root / "gender_out_dense",
                hidden,
                GENDER_CATS.len() as i64,
                Default::default(),
            ),
            age: nn::linear(
                root / "age_out_dense",
                hidden,
                AGE_CATS.len() as i64,
                Default::default(),
            ),
            org: nn::linear(
                root / "org_out_dense",
                hidden,
                ORG_CATS.len() as i64,
                Default::default(),
            ),
        }
    }

    fn shared(&self, branches: &[Tensor]) -> Tensor {
        self.merge.forward(&Tensor::cat(branches, 1)).relu()
    }

    fn head(&self, label: Label) -> &nn::Linear {
        match label {
            Label::Gender => &self.gender,
            Label::Age => &self.age,
            Label::Org => &self.org,
        }
    }

    /// All three distributions for `[batch, *]` branch vectors.
    pub fn forward(&self, branches: &[Tensor]) -> HeadOutputs {
        let dense = self.shared(branches);
        let dist = |label| self.head(label).forward(&dense).softmax(1, Kind::Float);
        HeadOutputs {
            gender: dist(Label::Gender),
            age: dist(Label::Age),
            org: dist(Label::Org),
        }
    }

    /// A single distribution, for partial inference.
    pub fn forward_label(&self, branches: &[Tensor], label: Label) -> Tensor {
        let dense = self.shared(branches);
        self.head(label).forward(&dense).softmax(1, Kind::Float)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distributions_sum_to_one() {
        tch::manual_seed(3);
        let vs = nn::VarStore::new(Device::Cpu);
        let heads = FusionHeads::new(&vs.root(), 12, 8);
        let branches = [
            Tensor::randn([5, 4], (Kind::Float, Device::Cpu)),
            Tensor::randn([5, 8], (Kind::Float, Device::Cpu)),
        ];

        let out = tch::no_grad(|| heads.forward(&branches));
        for label in Label::ALL {
            let dist = out.get(label);
            assert_eq!(dist.size(), vec![5, label.categories().len() as i64]);
            assert!(dist.min().double_value(&[]) >= 0.0);
            let sums = dist.sum_dim_intlist(&[1i64][..], false, Kind::Float);
            let ones = Tensor::ones([5], (Kind::Float, Device::Cpu));
            assert!(sums.allclose(&ones, 1e-4, 1e-4, false));
        }
    }

    #[test]
    fn test_single_label_matches_full() {
        tch::manual_seed(4);
        let vs = nn::VarStore::new(Device::Cpu);
        let heads = FusionHeads::new(&vs.root(), 6, 4);
        let branches = [Tensor::randn([3, 6], (Kind::Float, Device::Cpu))];

        let full = tch::no_grad(|| heads.forward(&branches));
        let age = tch::no_grad(|| heads.forward_label(&branches, Label::Age));
        assert!(age.allclose(&full.age, 1e-6, 1e-6, false));
    }

    #[test]
    fn test_label_parsing() {
        assert_eq!("org".parse::<Label>().unwrap(), Label::Org);
        assert!("income".parse::<Label>().is_err());
        assert_eq!(Label::Age.categories(), &["<=18", "19-29", "30-39", ">=40"]);
    }
}
