//! Group-wise evaluation: per-group accuracy, worst group and weighted average.

use crate::error::{to_host, TrainResult, TrainingError};
use crate::features::FeatureMatrix;
use crate::probe::LinearProbe;
use crate::results::ResultRecord;
use burn::tensor::backend::Backend;
use group_data::{BatchIter, GroupDataError, GroupKey, GroupPartition, GroupWeights, SpuriousDataset};
use models::ImageClassifier;
use std::collections::BTreeMap;

/// Index of the largest value in each row of a row-major `[n, k]` buffer.
/// Ties resolve to the first maximum.
pub fn argmax_rows(values: &[f32], num_classes: usize) -> Vec<usize> {
    values
        .chunks(num_classes.max(1))
        .map(|row| {
            let mut best = 0;
            for (j, v) in row.iter().enumerate().skip(1) {
                if *v > row[best] {
                    best = j;
                }
            }
            best
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvalReport {
    pub group_acc: BTreeMap<GroupKey, f64>,
    pub group_sizes: BTreeMap<GroupKey, usize>,
    pub worst_group: GroupKey,
    pub worst_group_acc: f64,
    /// `Σ w_g·acc_g / Σ w_g` over the evaluated groups.
    pub avg_acc: f64,
    pub num_examples: usize,
}

impl EvalReport {
    /// Summarize per-example correctness (indexed by dataset index) over `partition`.
    pub fn from_correct(
        partition: &GroupPartition,
        weights: &GroupWeights,
        correct: &[bool],
    ) -> TrainResult<Self> {
        let mut group_acc = BTreeMap::new();
        let mut group_sizes = BTreeMap::new();
        let mut num_examples = 0;
        for (key, members) in partition {
            if members.is_empty() {
                continue;
            }
            let mut hits = 0usize;
            for &idx in members {
                match correct.get(idx) {
                    Some(true) => hits += 1,
                    Some(false) => {}
                    None => {
                        return Err(GroupDataError::Config(format!(
                            "partition index {idx} has no prediction ({} available)",
                            correct.len()
                        ))
                        .into())
                    }
                }
            }
            group_acc.insert(key.clone(), hits as f64 / members.len() as f64);
            group_sizes.insert(key.clone(), members.len());
            num_examples += members.len();
        }

        let mut worst: Option<(&GroupKey, f64)> = None;
        for (key, &acc) in &group_acc {
            match worst {
                Some((_, w)) if acc >= w => {}
                _ => worst = Some((key, acc)),
            }
        }
        let (worst_group, worst_group_acc) = match worst {
            Some((key, acc)) => (key.clone(), acc),
            None => {
                return Err(GroupDataError::Empty("no examples to evaluate".to_string()).into())
            }
        };

        let avg_acc = weighted_average(&group_acc, weights);
        Ok(Self {
            group_acc,
            group_sizes,
            worst_group,
            worst_group_acc,
            avg_acc,
            num_examples,
        })
    }

    /// Add `<prefix>_wg_acc`, `<prefix>_avg_acc`, `<prefix>_worst_group` and one
    /// `<prefix>_acc_<group>` column per group.
    pub fn append_to(&self, record: &mut ResultRecord, prefix: &str) {
        record.push(format!("{prefix}_wg_acc"), format!("{:.6}", self.worst_group_acc));
        record.push(format!("{prefix}_avg_acc"), format!("{:.6}", self.avg_acc));
        record.push(format!("{prefix}_worst_group"), self.worst_group.to_string());
        for (key, acc) in &self.group_acc {
            record.push(format!("{prefix}_acc_{key}"), format!("{acc:.6}"));
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        let groups: serde_json::Map<String, serde_json::Value> = self
            .group_acc
            .iter()
            .map(|(k, v)| (k.to_string(), serde_json::json!(v)))
            .collect();
        serde_json::json!({
            "wga": self.worst_group_acc,
            "avg_acc": self.avg_acc,
            "worst_group": self.worst_group.to_string(),
            "num_examples": self.num_examples,
            "group_acc": groups,
        })
    }
}

fn weighted_average(group_acc: &BTreeMap<GroupKey, f64>, weights: &GroupWeights) -> f64 {
    let mut num = 0.0;
    let mut den = 0.0;
    for (key, acc) in group_acc {
        let w = match weights.get(key) {
            Some(w) => w,
            None => {
                tracing::warn!("group {key} has no weight; counting it with weight 0");
                0.0
            }
        };
        num += w * acc;
        den += w;
    }
    if den > 0.0 {
        num / den
    } else {
        tracing::warn!("all group weights are zero; using the unweighted mean accuracy");
        group_acc.values().sum::<f64>() / group_acc.len().max(1) as f64
    }
}

/// Evaluates a classifier (or a retrained probe on its embeddings) group by group.
#[derive(Debug, Clone)]
pub struct Evaluator {
    batch_size: usize,
    partition: GroupPartition,
    weights: GroupWeights,
    verbose: bool,
}

impl Evaluator {
    pub fn new(partition: GroupPartition, weights: GroupWeights) -> Self {
        Self {
            batch_size: 256,
            partition,
            weights,
            verbose: false,
        }
    }

    /// Evaluate with the dataset's own partition and group frequencies.
    pub fn for_dataset(dataset: &SpuriousDataset) -> Result<Self, GroupDataError> {
        Ok(Self::new(
            dataset.group_partition()?.clone(),
            dataset.group_weights()?.clone(),
        ))
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn partition(&self) -> &GroupPartition {
        &self.partition
    }

    pub fn weights(&self) -> &GroupWeights {
        &self.weights
    }

    /// Predicted class for every example covered by the partition, indexed by
    /// dataset index (`None` for uncovered examples).
    pub fn predict<B: Backend, M: ImageClassifier<B>>(
        &self,
        model: &M,
        dataset: &SpuriousDataset,
        probe: Option<&LinearProbe>,
        device: &B::Device,
    ) -> TrainResult<Vec<Option<usize>>> {
        let mut indices: Vec<usize> = self.partition.values().flatten().copied().collect();
        indices.sort_unstable();
        indices.dedup();

        let mut preds = vec![None; dataset.len()];
        let mut iter = BatchIter::new(indices, self.batch_size, None);
        while let Some(batch) = iter.next_batch::<B>(dataset, device)? {
            let rows = batch.indices.len();
            let batch_preds = match probe {
                Some(probe) => {
                    let embeddings = model.embed(batch.images);
                    let dim = embeddings.dims()[1];
                    let features = FeatureMatrix::from_vec(to_host(embeddings)?, rows, dim)?;
                    probe.predict(&features)?
                }
                None => {
                    let logits = model.forward(batch.images);
                    let k = logits.dims()[1];
                    argmax_rows(&to_host(logits)?, k)
                }
            };
            for (&idx, pred) in batch.indices.iter().zip(batch_preds) {
                let slot = preds.get_mut(idx).ok_or_else(|| {
                    TrainingError::Tensor(format!("prediction index {idx} out of range"))
                })?;
                *slot = Some(pred);
            }
        }
        Ok(preds)
    }

    pub fn evaluate<B: Backend, M: ImageClassifier<B>>(
        &self,
        model: &M,
        dataset: &SpuriousDataset,
        probe: Option<&LinearProbe>,
        device: &B::Device,
    ) -> TrainResult<EvalReport> {
        let preds = self.predict::<B, M>(model, dataset, probe, device)?;
        let correct: Vec<bool> = preds
            .iter()
            .enumerate()
            .map(|(idx, pred)| *pred == Some(dataset.label(idx)))
            .collect();
        let report = EvalReport::from_correct(&self.partition, &self.weights, &correct)?;
        if self.verbose {
            for (key, acc) in &report.group_acc {
                tracing::info!("{} group {key}: acc {acc:.4}", dataset.name());
            }
            tracing::info!(
                "{}: worst-group acc {:.4} ({}), weighted avg acc {:.4}",
                dataset.name(),
                report.worst_group_acc,
                report.worst_group,
                report.avg_acc
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use group_data::build_partition;

    fn toy() -> (GroupPartition, GroupWeights) {
        let labels = [0, 0, 0, 0, 1, 1];
        let spurious = vec![vec![0], vec![0], vec![0], vec![1], vec![1], vec![0]];
        let partition = build_partition(&labels, &spurious);
        let weights = GroupWeights::from_partition(&partition);
        (partition, weights)
    }

    #[test]
    fn argmax_prefers_first_maximum() {
        assert_eq!(argmax_rows(&[0.5, 0.5, 0.1, 0.2, 0.9, 0.9], 3), vec![0, 1]);
    }

    #[test]
    fn worst_group_and_weighted_average() {
        let (partition, weights) = toy();
        let correct = [true, true, false, false, true, true];
        let report = EvalReport::from_correct(&partition, &weights, &correct).unwrap();
        assert_eq!(report.worst_group, GroupKey::new(0, vec![1]));
        assert_eq!(report.worst_group_acc, 0.0);
        // (3/6)(2/3) + (1/6)(0) + (1/6)(1) + (1/6)(1)
        assert!((report.avg_acc - 4.0 / 6.0).abs() < 1e-12);
        assert!(report.worst_group_acc <= report.avg_acc);
        assert_eq!(report.num_examples, 6);
    }

    #[test]
    fn missing_weights_count_as_zero() {
        let (partition, _) = toy();
        let mut map = BTreeMap::new();
        map.insert(GroupKey::new(0, vec![0]), 1.0);
        let weights = GroupWeights::from_map(map);
        let correct = [true, false, false, true, true, true];
        let report = EvalReport::from_correct(&partition, &weights, &correct).unwrap();
        assert!((report.avg_acc - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn zero_weights_fall_back_to_unweighted_mean() {
        let (partition, _) = toy();
        let weights = GroupWeights::from_map(BTreeMap::new());
        let correct = [true, true, true, false, false, true];
        let report = EvalReport::from_correct(&partition, &weights, &correct).unwrap();
        assert!((report.avg_acc - 0.5).abs() < 1e-12);
    }

    #[test]
    fn report_columns() {
        let (partition, weights) = toy();
        let report = EvalReport::from_correct(&partition, &weights, &[true; 6]).unwrap();
        let mut record = ResultRecord::new();
        report.append_to(&mut record, "test");
        assert_eq!(record.get("test_wg_acc"), Some("1.000000"));
        assert_eq!(record.get("test_acc_(1, 0)"), Some("1.000000"));
    }
}
