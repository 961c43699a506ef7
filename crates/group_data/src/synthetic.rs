//! Synthetic 2-class dataset with two binary spurious attributes.
//!
//! Channel 0 carries the class signal, channel 1 the background attribute and
//! channel 2 the co-occurring attribute. Majority groups are those whose
//! attributes both agree with the label.
//!
//! The defaults keep the class signal weak relative to the pixel noise while
//! the spurious channels stay strong, so a model fitted on the skewed
//! training split leans on the spurious attributes and fails on minority
//! groups.

use crate::dataset::{ImageSource, SpuriousDataset};
use crate::types::{DataResult, GroupDataError, Split, SpuriousLabelType};
use rand::{Rng, SeedableRng};

#[derive(Debug, Clone)]
pub struct SyntheticGroups {
    pub examples_per_class: usize,
    /// Share of each class that lands in its majority group; the rest is split
    /// evenly over the three minority groups. 0.25 gives balanced groups.
    pub majority_fraction: f32,
    pub side: usize,
    pub core_amplitude: f32,
    pub spurious_amplitude: f32,
    pub noise: f32,
    pub seed: u64,
}

impl Default for SyntheticGroups {
    fn default() -> Self {
        Self {
            examples_per_class: 200,
            majority_fraction: 0.9,
            side: 4,
            core_amplitude: 0.1,
            spurious_amplitude: 2.0,
            noise: 1.5,
            seed: 0,
        }
    }
}

impl SyntheticGroups {
    pub fn balanced(mut self) -> Self {
        self.majority_fraction = 0.25;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Number of examples per `(label, background, co_occur)` group for one class.
    fn group_sizes(&self) -> DataResult<[usize; 4]> {
        if !(0.0..=1.0).contains(&self.majority_fraction) {
            return Err(GroupDataError::Config(format!(
                "majority_fraction must lie in [0, 1], got {}",
                self.majority_fraction
            )));
        }
        let n = self.examples_per_class;
        let majority = (n as f32 * self.majority_fraction).round() as usize;
        let rest = n.saturating_sub(majority);
        let minority = (rest / 3).max(1);
        Ok([majority.max(1), minority, minority, minority])
    }

    pub fn generate(&self, split: Split, label_type: SpuriousLabelType) -> DataResult<SpuriousDataset> {
        let sizes = self.group_sizes()?;
        let plane = self.side * self.side;
        let mut rng = rand::rngs::StdRng::seed_from_u64(self.seed ^ split_salt(split));

        let mut labels = Vec::new();
        let mut spurious = Vec::new();
        let mut images = Vec::new();
        for label in 0..2usize {
            let other = 1 - label;
            // Majority first, then the three minority combinations.
            let combos = [(label, label), (label, other), (other, label), (other, other)];
            for ((bg, co), count) in combos.into_iter().zip(sizes) {
                for _ in 0..count {
                    let mut img = vec![0.0f32; plane * 3];
                    let signals = [
                        sign(label) * self.core_amplitude,
                        sign(bg) * self.spurious_amplitude,
                        sign(co) * self.spurious_amplitude,
                    ];
                    for (c, signal) in signals.iter().enumerate() {
                        for px in img[c * plane..(c + 1) * plane].iter_mut() {
                            let jitter = if self.noise > 0.0 {
                                rng.random_range(-self.noise..self.noise)
                            } else {
                                0.0
                            };
                            *px = signal + jitter;
                        }
                    }
                    images.push(img);
                    labels.push(label);
                    spurious.push(label_type.project(bg, co));
                }
            }
        }

        SpuriousDataset::new(
            "synthetic",
            split,
            label_type,
            labels,
            spurious,
            ImageSource::InMemory {
                images,
                shape: [3, self.side, self.side],
            },
        )
        .map(|ds| ds.with_num_classes(2))
    }
}

fn sign(v: usize) -> f32 {
    if v == 0 {
        -1.0
    } else {
        1.0
    }
}

fn split_salt(split: Split) -> u64 {
    match split {
        Split::Train => 0x7472_6169_6e00,
        Split::Val => 0x7661_6c00,
        Split::Test => 0x7465_7374_00,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GroupKey;

    #[test]
    fn skewed_groups_have_majority() {
        let mut ds = SyntheticGroups::default()
            .generate(Split::Train, SpuriousLabelType::Both)
            .unwrap();
        ds.initialize().unwrap();
        let partition = ds.group_partition().unwrap();
        assert_eq!(partition.len(), 8);
        let majority = partition[&GroupKey::new(0, vec![0, 0])].len();
        let minority = partition[&GroupKey::new(0, vec![1, 0])].len();
        assert_eq!(majority, 180);
        assert!(minority < majority);
    }

    #[test]
    fn balanced_groups_are_even() {
        let mut ds = SyntheticGroups::default()
            .balanced()
            .generate(Split::Val, SpuriousLabelType::Both)
            .unwrap();
        ds.initialize().unwrap();
        let sizes: Vec<usize> = ds.group_partition().unwrap().values().map(Vec::len).collect();
        assert!(sizes.iter().all(|s| *s == sizes[0]));
    }

    #[test]
    fn coarse_label_types_merge_groups() {
        let mut ds = SyntheticGroups::default()
            .generate(Split::Val, SpuriousLabelType::Background)
            .unwrap();
        ds.initialize().unwrap();
        assert_eq!(ds.group_partition().unwrap().len(), 4);
    }
}
