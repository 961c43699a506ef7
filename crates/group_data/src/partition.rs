//! Group partitions and group frequency weights.

use crate::types::{DataResult, GroupDataError, GroupKey, SpuriousLabelType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Group key -> ascending example indices. Only non-empty groups are present.
pub type GroupPartition = BTreeMap<GroupKey, Vec<usize>>;

pub fn build_partition(labels: &[usize], spurious: &[Vec<usize>]) -> GroupPartition {
    let mut partition = GroupPartition::new();
    for (idx, (label, attrs)) in labels.iter().zip(spurious).enumerate() {
        partition
            .entry(GroupKey::new(*label, attrs.clone()))
            .or_default()
            .push(idx);
    }
    partition
}

/// Frequency of each group within a reference distribution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupWeights(BTreeMap<GroupKey, f64>);

impl GroupWeights {
    /// `|g| / n` for every group of the partition.
    pub fn from_partition(partition: &GroupPartition) -> Self {
        let total: usize = partition.values().map(Vec::len).sum();
        if total == 0 {
            return Self::default();
        }
        Self(
            partition
                .iter()
                .map(|(k, idx)| (k.clone(), idx.len() as f64 / total as f64))
                .collect(),
        )
    }

    pub fn from_map(map: BTreeMap<GroupKey, f64>) -> Self {
        Self(map)
    }

    pub fn get(&self, key: &GroupKey) -> Option<f64> {
        self.0.get(key).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&GroupKey, &f64)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn total(&self) -> f64 {
        self.0.values().sum()
    }

    /// Sum weights over the attribute positions not listed in `keep`.
    pub fn marginalize(&self, keep: &[usize]) -> DataResult<Self> {
        let mut out: BTreeMap<GroupKey, f64> = BTreeMap::new();
        for (key, w) in &self.0 {
            let mut attrs = Vec::with_capacity(keep.len());
            for &pos in keep {
                let value = key.spurious.get(pos).copied().ok_or_else(|| {
                    GroupDataError::Config(format!(
                        "cannot keep attribute {pos} of group {key}: only {} attributes",
                        key.spurious.len()
                    ))
                })?;
                attrs.push(value);
            }
            *out.entry(GroupKey::new(key.label, attrs)).or_insert(0.0) += w;
        }
        Ok(Self(out))
    }
}

/// Re-express weights computed with both attributes at the granularity of `label_type`.
pub fn project_group_weights(
    weights_both: &GroupWeights,
    label_type: SpuriousLabelType,
) -> DataResult<GroupWeights> {
    match label_type {
        SpuriousLabelType::Both => Ok(weights_both.clone()),
        other => weights_both.marginalize(other.attribute_positions()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn skewed() -> GroupPartition {
        // label, (background, co_occur)
        let labels = vec![0, 0, 0, 0, 0, 1, 1, 1, 1, 1];
        let spurious = vec![
            vec![0, 0],
            vec![0, 0],
            vec![0, 0],
            vec![0, 1],
            vec![1, 0],
            vec![1, 1],
            vec![1, 1],
            vec![1, 1],
            vec![1, 0],
            vec![0, 1],
        ];
        build_partition(&labels, &spurious)
    }

    #[test]
    fn weights_sum_to_one() {
        let w = GroupWeights::from_partition(&skewed());
        assert!((w.total() - 1.0).abs() < 1e-12);
        assert_eq!(w.get(&GroupKey::new(0, vec![0, 0])), Some(0.3));
    }

    #[test]
    fn background_projection_sums_over_co_occur() {
        let w = GroupWeights::from_partition(&skewed());
        let bg = project_group_weights(&w, SpuriousLabelType::Background).unwrap();
        assert!((bg.total() - 1.0).abs() < 1e-12);
        // label 0, background 0: (0,0)=0.3 + (0,1)=0.1
        assert!((bg.get(&GroupKey::new(0, vec![0])).unwrap() - 0.4).abs() < 1e-12);
        // label 1, background 1: (1,1)=0.3 + (1,0)=0.1
        assert!((bg.get(&GroupKey::new(1, vec![1])).unwrap() - 0.4).abs() < 1e-12);
    }

    #[test]
    fn co_occur_projection_sums_over_background() {
        let w = GroupWeights::from_partition(&skewed());
        let co = project_group_weights(&w, SpuriousLabelType::CoOccur).unwrap();
        assert!((co.total() - 1.0).abs() < 1e-12);
        // label 0, co_occur 0: (0,0)=0.3 + (1,0)=0.1
        assert!((co.get(&GroupKey::new(0, vec![0])).unwrap() - 0.4).abs() < 1e-12);
        // label 1, co_occur 1: (1,1)=0.3 + (0,1)=0.1
        assert!((co.get(&GroupKey::new(1, vec![1])).unwrap() - 0.4).abs() < 1e-12);
        assert_eq!(co.len(), 4);
    }

    #[test]
    fn marginalize_rejects_missing_positions() {
        let w = GroupWeights::from_partition(&skewed())
            .marginalize(&[0])
            .unwrap();
        assert!(w.marginalize(&[1]).is_err());
    }
}
