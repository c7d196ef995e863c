//! Prediction results keyed by record id.

use std::collections::HashMap;
use std::io::Write;

use ndarray::Array2;
use serde::ser::{SerializeMap, SerializeStruct};
use serde::{Serialize, Serializer};
use tch::{Kind, Tensor};
use tracing::warn;

use crate::error::{DemographerError, Result};
use crate::model::{HeadOutputs, Label};

fn round4(value: f64) -> f64 {
    (value * 1e4).round() / 1e4
}

/// Probabilities over one label's categories, in [`Label::categories`] order.
///
/// Serializes as a `category -> probability` map rounded to four decimals.
#[derive(Debug, Clone, PartialEq)]
pub struct Distribution {
    label: Label,
    scores: Vec<f64>,
}

impl Distribution {
    pub fn new(label: Label, scores: Vec<f64>) -> Result<Self> {
        if scores.len() != label.categories().len() {
            return Err(DemographerError::Shape(format!(
                "{} needs {} scores, got {}",
                label,
                label.categories().len(),
                scores.len()
            )));
        }
        Ok(Self { label, scores })
    }

    pub fn label(&self) -> Label {
        self.label
    }

    pub fn scores(&self) -> &[f64] {
        &self.scores
    }

    pub fn get(&self, category: &str) -> Option<f64> {
        let position = self.label.categories().iter().position(|&c| c == category)?;
        Some(self.scores[position])
    }

    /// Most likely category.
    pub fn top(&self) -> &'static str {
        let best = self
            .scores
            .iter()
            .enumerate()
            .fold(0, |best, (i, &score)| if score > self.scores[best] { i } else { best });
        self.label.categories()[best]
    }

    /// Split a `[rows, categories]` softmax tensor into per-row distributions.
    pub fn from_tensor(label: Label, tensor: &Tensor) -> Result<Vec<Self>> {
        let width = label.categories().len();
        let flat = Vec::<f64>::try_from(tensor.to_kind(Kind::Double).contiguous().view([-1]))?;
        if flat.len() % width != 0 {
            return Err(DemographerError::Shape(format!(
                "{} scores do not divide into rows of {}",
                flat.len(),
                width
            )));
        }
        flat.chunks_exact(width)
            .map(|row| Self::new(label, row.to_vec()))
            .collect()
    }
}

impl Serialize for Distribution {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.scores.len()))?;
        for (category, &score) in self.label.categories().iter().zip(&self.scores) {
            map.serialize_entry(category, &round4(score))?;
        }
        map.end()
    }
}

/// All three distributions for one record.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub gender: Distribution,
    pub age: Distribution,
    pub org: Distribution,
}

impl Prediction {
    pub fn get(&self, label: Label) -> &Distribution {
        match label {
            Label::Gender => &self.gender,
            Label::Age => &self.age,
            Label::Org => &self.org,
        }
    }

    /// Scores in [`Prediction::columns`] order.
    pub fn values(&self) -> Vec<f64> {
        Label::ALL
            .iter()
            .flat_map(|&label| self.get(label).scores().iter().copied())
            .collect()
    }

    /// Flat column names, `gender_male` through `org_is-org`.
    pub fn columns() -> Vec<String> {
        Label::ALL
            .iter()
            .flat_map(|label| {
                label
                    .categories()
                    .iter()
                    .map(move |category| format!("{}_{}", label, category))
            })
            .collect()
    }

    /// One prediction per row of the head outputs.
    pub fn from_outputs(outputs: &HeadOutputs) -> Result<Vec<Self>> {
        let gender = Distribution::from_tensor(Label::Gender, &outputs.gender)?;
        let age = Distribution::from_tensor(Label::Age, &outputs.age)?;
        let org = Distribution::from_tensor(Label::Org, &outputs.org)?;
        if gender.len() != age.len() || age.len() != org.len() {
            return Err(DemographerError::Shape(format!(
                "head row counts differ: {}, {}, {}",
                gender.len(),
                age.len(),
                org.len()
            )));
        }

        Ok(gender
            .into_iter()
            .zip(age)
            .zip(org)
            .map(|((gender, age), org)| Prediction { gender, age, org })
            .collect())
    }
}

impl Serialize for Prediction {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Prediction", 3)?;
        state.serialize_field("gender", &self.gender)?;
        state.serialize_field("age", &self.age)?;
        state.serialize_field("org", &self.org)?;
        state.end()
    }
}

/// Id → value mapping that keeps first-insertion order.
///
/// The first value inserted for an id wins; later ones are dropped with a
/// warning.
#[derive(Debug, Clone)]
pub struct ById<T> {
    entries: Vec<(String, T)>,
    index: HashMap<String, usize>,
}

impl<T> Default for ById<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<T> ById<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when `id` was already present.
    pub fn insert(&mut self, id: impl Into<String>, value: T) -> bool {
        let id = id.into();
        if self.index.contains_key(&id) {
            warn!(id = %id, "duplicate id, keeping the first prediction");
            return false;
        }
        self.index.insert(id.clone(), self.entries.len());
        self.entries.push((id, value));
        true
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        self.index.get(id).map(|&i| &self.entries[i].1)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(id, _)| id.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.entries.iter().map(|(id, value)| (id.as_str(), value))
    }
}

impl<T: Serialize> Serialize for ById<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (id, value) in &self.entries {
            map.serialize_entry(id, value)?;
        }
        map.end()
    }
}

impl<T: Serialize> ById<T> {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Full inference output.
pub type PredictionResult = ById<Prediction>;

/// Output of single-label inference.
pub type LabelResult = ById<Distribution>;

impl ById<Prediction> {
    /// Ids in row order and a `[records, 8]` score matrix.
    pub fn to_table(&self) -> (Vec<String>, Array2<f64>) {
        let columns = Prediction::columns().len();
        let mut table = Array2::zeros((self.len(), columns));
        for (mut row, (_, prediction)) in table.rows_mut().into_iter().zip(self.iter()) {
            for (cell, value) in row.iter_mut().zip(prediction.values()) {
                *cell = value;
            }
        }
        (self.ids().map(str::to_string).collect(), table)
    }

    /// CSV with an `id` column followed by [`Prediction::columns`], values
    /// rounded to four decimals.
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<()> {
        let mut csv = csv::Writer::from_writer(writer);
        let mut header = vec!["id".to_string()];
        header.extend(Prediction::columns());
        csv.write_record(&header)?;

        for (id, prediction) in self.iter() {
            let mut record = vec![id.to_string()];
            record.extend(prediction.values().into_iter().map(|v| round4(v).to_string()));
            csv.write_record(&record)?;
        }
        csv.flush()?;
        Ok(())
    }
}
