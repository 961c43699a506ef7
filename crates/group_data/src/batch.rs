//! Batch iteration producing Burn tensors.

use crate::dataset::SpuriousDataset;
use crate::types::{DataResult, GroupDataError};
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, TensorData};
use rand::{seq::SliceRandom, SeedableRng};
use rayon::prelude::*;

pub struct GroupBatch<B: Backend> {
    /// Images, shape `[batch, c, h, w]`.
    pub images: Tensor<B, 4>,
    /// Class labels, shape `[batch]`.
    pub labels: Tensor<B, 1, Int>,
    /// Dataset index of every row.
    pub indices: Vec<usize>,
}

pub struct BatchIter {
    indices: Vec<usize>,
    cursor: usize,
    batch_size: usize,
    images_buf: Vec<f32>,
}

impl BatchIter {
    /// Iterate `indices` in order, or shuffled when `shuffle_seed` is set.
    pub fn new(mut indices: Vec<usize>, batch_size: usize, shuffle_seed: Option<u64>) -> Self {
        if let Some(seed) = shuffle_seed {
            let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
            indices.shuffle(&mut rng);
        }
        Self {
            indices,
            cursor: 0,
            batch_size: batch_size.max(1),
            images_buf: Vec::new(),
        }
    }

    pub fn over_dataset(dataset: &SpuriousDataset, batch_size: usize, shuffle_seed: Option<u64>) -> Self {
        Self::new((0..dataset.len()).collect(), batch_size, shuffle_seed)
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn num_batches(&self) -> usize {
        self.indices.len().div_ceil(self.batch_size)
    }

    pub fn next_batch<B: Backend>(
        &mut self,
        dataset: &SpuriousDataset,
        device: &B::Device,
    ) -> DataResult<Option<GroupBatch<B>>> {
        if self.cursor >= self.indices.len() {
            return Ok(None);
        }
        let end = (self.cursor + self.batch_size).min(self.indices.len());
        let slice = &self.indices[self.cursor..end];
        self.cursor = end;

        let [c, h, w] = dataset.image_shape();
        let per_image = c * h * w;
        let loaded: Vec<DataResult<Vec<f32>>> = slice
            .par_iter()
            .map(|&idx| dataset.load_image(idx))
            .collect();

        self.images_buf.clear();
        self.images_buf.reserve(slice.len() * per_image);
        for (res, &idx) in loaded.into_iter().zip(slice) {
            let img = res?;
            if img.len() != per_image {
                return Err(GroupDataError::Config(format!(
                    "example {idx} has {} values, expected {per_image} for shape {:?}",
                    img.len(),
                    [c, h, w]
                )));
            }
            self.images_buf.extend_from_slice(&img);
        }

        let batch_len = slice.len();
        let labels: Vec<i64> = slice.iter().map(|&i| dataset.label(i) as i64).collect();
        let images = Tensor::<B, 1>::from_floats(self.images_buf.as_slice(), device)
            .reshape([batch_len, c, h, w]);
        let labels = Tensor::<B, 1, Int>::from_data(TensorData::new(labels, [batch_len]), device);

        Ok(Some(GroupBatch {
            images,
            labels,
            indices: slice.to_vec(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::SyntheticGroups;
    use crate::types::{Split, SpuriousLabelType};
    use burn::backend::NdArray;

    #[test]
    fn batches_cover_every_index_once() {
        let ds = SyntheticGroups {
            examples_per_class: 10,
            ..Default::default()
        }
        .generate(Split::Train, SpuriousLabelType::Both)
        .unwrap();
        let device = Default::default();
        let mut iter = BatchIter::over_dataset(&ds, 7, Some(3));
        let mut seen = Vec::new();
        while let Some(batch) = iter.next_batch::<NdArray<f32>>(&ds, &device).unwrap() {
            let dims = batch.images.dims();
            assert_eq!(dims[0], batch.indices.len());
            assert_eq!(&dims[1..], &ds.image_shape());
            seen.extend(batch.indices);
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..ds.len()).collect::<Vec<_>>());
    }

    #[test]
    fn shuffle_is_reproducible() {
        let a = BatchIter::new((0..50).collect(), 8, Some(11));
        let b = BatchIter::new((0..50).collect(), 8, Some(11));
        assert_eq!(a.indices, b.indices);
        assert_ne!(a.indices, (0..50).collect::<Vec<_>>());
        assert_eq!(a.num_batches(), 7);
    }
}
