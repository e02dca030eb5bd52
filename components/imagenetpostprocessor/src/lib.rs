//! Turns a classifier's raw output into a class index, a label and a ranked
//! list of classifications.
//!
//! Designed around ImageNet-1k models producing 1000 logits, e.g.
//! * https://github.com/onnx/models/tree/main/vision/classification
//!     - see the [ONNX labels](https://github.com/onnx/models/blob/main/vision/classification/synset.txt)

use ml_types::{MlError, Tensor};
use ndarray::{Array, ArrayBase, Ix1};
use serde::Serialize;

mod labels;

pub use labels::{IndexLabels, LabelError, LabelSource, LabelTable};

/// Number of ranked classes reported alongside the argmax.
pub const DEFAULT_TOP_K: usize = 5;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Classification {
    pub index: usize,
    pub label: String,
    pub probability: f32,
}

/// Index of the first maximum in `values`.
///
/// A single linear scan; on ties the earliest index wins. `NaN` entries never
/// win. Returns `None` for an empty slice or one without any comparable value.
pub fn argmax(values: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;

    for (index, value) in values.iter().copied().enumerate() {
        if value.is_nan() {
            continue;
        }
        match best {
            Some((_, current)) if value <= current => {}
            _ => best = Some((index, value)),
        }
    }

    best.map(|(index, _)| index)
}

/// Softmax over `logits` followed by a descending sort, truncated to `k`.
pub fn top_k(logits: &[f32], k: usize, labels: &dyn LabelSource) -> Vec<Classification> {
    let scores: Array<f32, Ix1> = Array::from(logits.to_vec());

    let mut probabilities: Vec<(usize, f32)> = scores
        .softmax(ndarray::Axis(0))
        .into_iter()
        .enumerate()
        .collect();

    probabilities.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

    probabilities
        .into_iter()
        .take(k)
        .map(|(index, probability)| Classification {
            index,
            label: label_or_fallback(labels, index),
            probability,
        })
        .collect()
}

/// Label for `index`, or `class <index>` when the source has none.
pub fn label_or_fallback(labels: &dyn LabelSource, index: usize) -> String {
    labels
        .lookup(index)
        .map(String::from)
        .unwrap_or_else(|| format!("class {}", index))
}

/// The argmax of an output tensor together with its ranked classes.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Prediction {
    pub class_index: usize,
    pub label: String,
    pub classifications: Vec<Classification>,
}

pub fn classify(
    tensor: &Tensor,
    labels: &dyn LabelSource,
    k: usize,
) -> Result<Prediction, ClassificationError> {
    let logits = tensor.to_f32_vec()?;

    let class_index = argmax(&logits).ok_or(ClassificationError::EmptyOutput)?;

    log::debug!(
        "classified output of {} values, argmax {}",
        logits.len(),
        class_index
    );

    Ok(Prediction {
        class_index,
        label: label_or_fallback(labels, class_index),
        classifications: top_k(&logits, k, labels),
    })
}

#[derive(Debug, thiserror::Error)]
pub enum ClassificationError {
    #[error("output tensor holds no comparable values")]
    EmptyOutput,

    #[error("unreadable output tensor: {0}")]
    Tensor(#[from] MlError),
}

pub trait NdArrayTensor<S, T, D> {
    /// https://en.wikipedia.org/wiki/Softmax_function
    fn softmax(&self, axis: ndarray::Axis) -> Array<T, D>
    where
        D: ndarray::RemoveAxis,
        S: ndarray::RawData + ndarray::Data + ndarray::RawData<Elem = T>,
        <S as ndarray::RawData>::Elem: std::clone::Clone,
        T: ndarray::NdFloat + std::ops::SubAssign + std::ops::DivAssign;
}

impl<S, T, D> NdArrayTensor<S, T, D> for ArrayBase<S, D>
where
    D: ndarray::RemoveAxis,
    S: ndarray::RawData + ndarray::Data + ndarray::RawData<Elem = T>,
    <S as ndarray::RawData>::Elem: std::clone::Clone,
    T: ndarray::NdFloat + std::ops::SubAssign + std::ops::DivAssign,
{
    fn softmax(&self, axis: ndarray::Axis) -> Array<T, D> {
        // shift by the max so large logits do not overflow exp()
        let max = self.fold(T::neg_infinity(), |acc, v| if *v > acc { *v } else { acc });
        let mut new_array: Array<T, D> = self.to_owned();
        new_array.map_inplace(|v| *v = (*v - max).exp());
        let sum = new_array.sum_axis(axis).insert_axis(axis);
        new_array /= &sum;

        new_array
    }
}
