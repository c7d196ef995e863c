//! Length-sorted batch packing.
//!
//! Recurrent branches process a batch sorted by descending valid length so
//! that at every time step the sequences still running form a prefix of the
//! batch. [`LengthSort`] holds that permutation and its inverse.

use tch::Tensor;

use crate::error::{DemographerError, Result};

/// Stable descending sort of a batch by sequence length.
///
/// `order()[j]` is the original row placed at sorted position `j`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LengthSort {
    order: Vec<usize>,
    inverse: Vec<usize>,
    sorted_lengths: Vec<usize>,
}

impl LengthSort {
    /// Fails on an empty batch or on any zero length.
    pub fn new(lengths: &[usize]) -> Result<Self> {
        if lengths.is_empty() {
            return Err(DemographerError::Shape("empty batch".to_string()));
        }
        if let Some(row) = lengths.iter().position(|&len| len == 0) {
            return Err(DemographerError::Shape(format!(
                "row {} has a zero valid length",
                row
            )));
        }

        let mut order: Vec<usize> = (0..lengths.len()).collect();
        // sort_by is stable: equal lengths keep their relative order
        order.sort_by(|&a, &b| lengths[b].cmp(&lengths[a]));

        let mut inverse = vec![0; order.len()];
        for (position, &row) in order.iter().enumerate() {
            inverse[row] = position;
        }

        let sorted_lengths = order.iter().map(|&row| lengths[row]).collect();

        Ok(Self {
            order,
            inverse,
            sorted_lengths,
        })
    }

    pub fn order(&self) -> &[usize] {
        &self.order
    }

    /// `inverse()[i]` is the sorted position of original row `i`.
    pub fn inverse(&self) -> &[usize] {
        &self.inverse
    }

    pub fn sorted_lengths(&self) -> &[usize] {
        &self.sorted_lengths
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Number of rows still running at each step, `max_len` entries.
    ///
    /// Non-increasing, and the first entry is the batch size.
    pub fn active_counts(&self) -> Vec<usize> {
        let max_len = self.sorted_lengths[0];
        (0..max_len)
            .map(|step| self.sorted_lengths.iter().take_while(|&&len| len > step).count())
            .collect()
    }

    pub fn sort<T: Clone>(&self, items: &[T]) -> Vec<T> {
        self.order.iter().map(|&row| items[row].clone()).collect()
    }

    pub fn unsort<T: Clone>(&self, sorted: &[T]) -> Vec<T> {
        self.inverse
            .iter()
            .map(|&position| sorted[position].clone())
            .collect()
    }

    /// Reorder the rows (dim 0) of `xs` into sorted order.
    pub fn sort_tensor(&self, xs: &Tensor) -> Tensor {
        xs.index_select(0, &index_tensor(&self.order, xs))
    }

    /// Restore the original row order of a sorted tensor.
    pub fn unsort_tensor(&self, xs: &Tensor) -> Tensor {
        xs.index_select(0, &index_tensor(&self.inverse, xs))
    }
}

fn index_tensor(rows: &[usize], like: &Tensor) -> Tensor {
    let rows: Vec<i64> = rows.iter().map(|&row| row as i64).collect();
    Tensor::from_slice(&rows).to_device(like.device())
}
