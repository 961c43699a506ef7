//! Group-annotated dataset with an explicit initialization step.

use crate::partition::{build_partition, GroupPartition, GroupWeights};
use crate::transform::ImageTransform;
use crate::types::{DataResult, Example, GroupDataError, Split, SpuriousLabelType};
use rand::{Rng, SeedableRng};
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub enum ImageSource {
    /// Decoded lazily from disk and passed through the transform.
    Files {
        paths: Vec<PathBuf>,
        transform: ImageTransform,
    },
    /// Already-preprocessed CHW buffers.
    InMemory { images: Vec<Vec<f32>>, shape: [usize; 3] },
}

#[derive(Debug, Clone)]
struct GroupIndex {
    partition: GroupPartition,
    weights: GroupWeights,
}

#[derive(Debug, Clone)]
pub struct SpuriousDataset {
    name: String,
    split: Split,
    label_type: SpuriousLabelType,
    labels: Vec<usize>,
    spurious: Vec<Vec<usize>>,
    num_classes: usize,
    source: ImageSource,
    groups: Option<GroupIndex>,
}

impl SpuriousDataset {
    pub fn new(
        name: impl Into<String>,
        split: Split,
        label_type: SpuriousLabelType,
        labels: Vec<usize>,
        spurious: Vec<Vec<usize>>,
        source: ImageSource,
    ) -> DataResult<Self> {
        let name = name.into();
        if labels.len() != spurious.len() {
            return Err(GroupDataError::Config(format!(
                "{name}/{split}: {} labels but {} spurious annotations",
                labels.len(),
                spurious.len()
            )));
        }
        let source_len = match &source {
            ImageSource::Files { paths, .. } => paths.len(),
            ImageSource::InMemory { images, .. } => images.len(),
        };
        if source_len != labels.len() {
            return Err(GroupDataError::Config(format!(
                "{name}/{split}: {} labels but {source_len} images",
                labels.len()
            )));
        }
        let num_classes = labels.iter().copied().max().map(|m| m + 1).unwrap_or(0);
        Ok(Self {
            name,
            split,
            label_type,
            labels,
            spurious,
            num_classes,
            source,
            groups: None,
        })
    }

    /// Declare the class count explicitly (a split may not contain every class).
    pub fn with_num_classes(mut self, num_classes: usize) -> Self {
        self.num_classes = self.num_classes.max(num_classes);
        self
    }

    /// Flip each binary spurious attribute with probability `p`.
    pub fn with_spurious_noise(mut self, p: f32, seed: u64) -> DataResult<Self> {
        if !(0.0..=1.0).contains(&p) {
            return Err(GroupDataError::Config(format!(
                "label noise must lie in [0, 1], got {p}"
            )));
        }
        if self.groups.is_some() {
            return Err(GroupDataError::Config(format!(
                "{}/{}: noise must be applied before initialize()",
                self.name, self.split
            )));
        }
        if p == 0.0 {
            return Ok(self);
        }
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let mut flipped = 0usize;
        for attrs in self.spurious.iter_mut() {
            for a in attrs.iter_mut() {
                if rng.random_range(0.0..1.0) < p {
                    *a = 1 - (*a).min(1);
                    flipped += 1;
                }
            }
        }
        tracing::info!(
            "{}/{}: flipped {flipped} spurious attributes (p={p})",
            self.name,
            self.split
        );
        Ok(self)
    }

    /// Compute the group partition and weights; idempotent.
    pub fn initialize(&mut self) -> DataResult<()> {
        if self.groups.is_some() {
            return Ok(());
        }
        if self.labels.is_empty() {
            return Err(GroupDataError::Empty(format!(
                "{}/{} contains no examples",
                self.name, self.split
            )));
        }
        let partition = build_partition(&self.labels, &self.spurious);
        let weights = GroupWeights::from_partition(&partition);
        tracing::info!(
            "{}/{}: {} examples in {} groups",
            self.name,
            self.split,
            self.labels.len(),
            partition.len()
        );
        for (key, idx) in &partition {
            tracing::debug!("  group {key}: {} examples", idx.len());
        }
        self.groups = Some(GroupIndex { partition, weights });
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.groups.is_some()
    }

    pub fn group_partition(&self) -> DataResult<&GroupPartition> {
        self.groups
            .as_ref()
            .map(|g| &g.partition)
            .ok_or_else(|| self.not_initialized())
    }

    pub fn group_weights(&self) -> DataResult<&GroupWeights> {
        self.groups
            .as_ref()
            .map(|g| &g.weights)
            .ok_or_else(|| self.not_initialized())
    }

    fn not_initialized(&self) -> GroupDataError {
        GroupDataError::NotInitialized(format!("{}/{}", self.name, self.split))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn split(&self) -> Split {
        self.split
    }

    pub fn label_type(&self) -> SpuriousLabelType {
        self.label_type
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    pub fn label(&self, idx: usize) -> usize {
        self.labels[idx]
    }

    pub fn spurious(&self, idx: usize) -> &[usize] {
        &self.spurious[idx]
    }

    pub fn image_shape(&self) -> [usize; 3] {
        match &self.source {
            ImageSource::Files { transform, .. } => transform.output_shape(),
            ImageSource::InMemory { shape, .. } => *shape,
        }
    }

    pub fn load_image(&self, idx: usize) -> DataResult<Vec<f32>> {
        match &self.source {
            ImageSource::Files { paths, transform } => {
                let path = &paths[idx];
                let img = image::open(path)
                    .map_err(|source| GroupDataError::Image {
                        path: path.clone(),
                        source,
                    })?
                    .to_rgb8();
                Ok(transform.apply(&img))
            }
            ImageSource::InMemory { images, .. } => Ok(images[idx].clone()),
        }
    }

    pub fn get(&self, idx: usize) -> DataResult<Example> {
        Ok(Example {
            image_chw: self.load_image(idx)?,
            label: self.labels[idx],
            spurious: self.spurious[idx].clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny(labels: Vec<usize>, spurious: Vec<Vec<usize>>) -> SpuriousDataset {
        let images = vec![vec![0.0; 3]; labels.len()];
        SpuriousDataset::new(
            "tiny",
            Split::Train,
            SpuriousLabelType::Both,
            labels,
            spurious,
            ImageSource::InMemory {
                images,
                shape: [3, 1, 1],
            },
        )
        .unwrap()
    }

    #[test]
    fn partition_requires_initialize() {
        let mut ds = tiny(vec![0, 1], vec![vec![0, 0], vec![1, 1]]);
        assert!(matches!(
            ds.group_partition(),
            Err(GroupDataError::NotInitialized(_))
        ));
        ds.initialize().unwrap();
        assert_eq!(ds.group_partition().unwrap().len(), 2);
        assert!((ds.group_weights().unwrap().total() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn empty_dataset_fails_to_initialize() {
        let mut ds = tiny(vec![], vec![]);
        assert!(matches!(ds.initialize(), Err(GroupDataError::Empty(_))));
    }

    #[test]
    fn noise_is_seeded_and_rejected_after_initialize() {
        let labels = vec![0; 64];
        let spurious = vec![vec![0, 0]; 64];
        let a = tiny(labels.clone(), spurious.clone())
            .with_spurious_noise(0.5, 7)
            .unwrap();
        let b = tiny(labels.clone(), spurious.clone())
            .with_spurious_noise(0.5, 7)
            .unwrap();
        assert_eq!(a.spurious, b.spurious);
        assert!(a.spurious.iter().flatten().any(|v| *v == 1));

        let mut c = tiny(labels, spurious);
        c.initialize().unwrap();
        assert!(c.with_spurious_noise(0.1, 0).is_err());
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let err = SpuriousDataset::new(
            "bad",
            Split::Val,
            SpuriousLabelType::Both,
            vec![0, 1],
            vec![vec![0, 0]],
            ImageSource::InMemory {
                images: vec![vec![0.0]; 2],
                shape: [1, 1, 1],
            },
        );
        assert!(err.is_err());
    }
}
