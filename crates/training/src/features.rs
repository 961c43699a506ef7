//! Host-side embedding matrices.

use crate::error::{to_host, TrainResult, TrainingError};
use burn::tensor::backend::Backend;
use group_data::{BatchIter, SpuriousDataset};
use models::ImageClassifier;

/// Row-major `[rows, dim]` matrix of `f32` features.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    data: Vec<f32>,
    rows: usize,
    dim: usize,
}

impl FeatureMatrix {
    pub fn from_vec(data: Vec<f32>, rows: usize, dim: usize) -> TrainResult<Self> {
        if data.len() != rows * dim {
            return Err(TrainingError::Tensor(format!(
                "feature buffer has {} values, expected {rows}x{dim}",
                data.len()
            )));
        }
        Ok(Self { data, rows, dim })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.dim..(i + 1) * self.dim]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Copy the given rows, in order.
    pub fn select(&self, rows: &[usize]) -> Self {
        let mut data = Vec::with_capacity(rows.len() * self.dim);
        for &r in rows {
            data.extend_from_slice(self.row(r));
        }
        Self {
            data,
            rows: rows.len(),
            dim: self.dim,
        }
    }

    pub(crate) fn row_mut(&mut self, i: usize) -> &mut [f32] {
        &mut self.data[i * self.dim..(i + 1) * self.dim]
    }
}

/// Embed `indices` of `dataset` with the frozen feature extractor, preserving order.
pub fn extract_embeddings<B: Backend, M: ImageClassifier<B>>(
    model: &M,
    dataset: &SpuriousDataset,
    indices: &[usize],
    batch_size: usize,
    device: &B::Device,
) -> TrainResult<FeatureMatrix> {
    let dim = model.embedding_dim();
    let mut data = Vec::with_capacity(indices.len() * dim);
    let mut iter = BatchIter::new(indices.to_vec(), batch_size, None);
    while let Some(batch) = iter.next_batch::<B>(dataset, device)? {
        data.extend(to_host(model.embed(batch.images))?);
    }
    FeatureMatrix::from_vec(data, indices.len(), dim)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_copies_rows_in_order() {
        let m = FeatureMatrix::from_vec((0..6).map(|v| v as f32).collect(), 3, 2).unwrap();
        let s = m.select(&[2, 0]);
        assert_eq!(s.as_slice(), &[4.0, 5.0, 0.0, 1.0]);
        assert!(FeatureMatrix::from_vec(vec![1.0; 5], 2, 2).is_err());
    }
}
