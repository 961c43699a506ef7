//! Attach explicit group ids to the examples of a dataset.

use crate::dataset::SpuriousDataset;
use crate::partition::GroupPartition;
use crate::types::{DataResult, GroupDataError, GroupKey};

pub struct GroupLabeled<'a> {
    dataset: &'a SpuriousDataset,
    groups: Vec<GroupKey>,
    /// Dataset indices covered by the partition, ascending.
    indices: Vec<usize>,
    /// Group id per entry of `indices`.
    group_ids: Vec<usize>,
}

impl<'a> GroupLabeled<'a> {
    pub fn new(dataset: &'a SpuriousDataset, partition: &GroupPartition) -> DataResult<Self> {
        let mut pairs = Vec::new();
        let groups: Vec<GroupKey> = partition.keys().cloned().collect();
        for (gid, members) in partition.values().enumerate() {
            for &idx in members {
                if idx >= dataset.len() {
                    return Err(GroupDataError::Config(format!(
                        "partition index {idx} out of range for dataset of {}",
                        dataset.len()
                    )));
                }
                pairs.push((idx, gid));
            }
        }
        if pairs.is_empty() {
            return Err(GroupDataError::Empty(
                "group-labeled set has no examples".to_string(),
            ));
        }
        pairs.sort_unstable();
        pairs.dedup_by_key(|(idx, _)| *idx);
        let (indices, group_ids) = pairs.into_iter().unzip();
        Ok(Self {
            dataset,
            groups,
            indices,
            group_ids,
        })
    }

    /// Group-label a dataset with its own initialized partition.
    pub fn from_dataset(dataset: &'a SpuriousDataset) -> DataResult<Self> {
        Self::new(dataset, dataset.group_partition()?)
    }

    pub fn dataset(&self) -> &SpuriousDataset {
        self.dataset
    }

    pub fn groups(&self) -> &[GroupKey] {
        &self.groups
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    /// Group id of the `pos`-th covered example.
    pub fn group_of(&self, pos: usize) -> usize {
        self.group_ids[pos]
    }

    pub fn group_ids(&self) -> &[usize] {
        &self.group_ids
    }

    pub fn labels(&self) -> Vec<usize> {
        self.indices.iter().map(|&i| self.dataset.label(i)).collect()
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}
