//! DISPEL-style last-layer retraining.
//!
//! The feature extractor stays frozen. Embeddings of the group-labeled set are
//! standardized, then for every `(s, alpha)` grid point a group-balanced
//! logistic-regression probe is trained on mixed embeddings and scored by its
//! worst-group accuracy under group-stratified cross-validation. The best
//! point is refit on the whole group-labeled set.
//!
//! Mixing: with probability `alpha` an embedding `z_i` is replaced by
//! `s·z_i + (1 - s)·z_j`, where `j` has the same class as `i` but belongs to
//! another group (any member of the class when it has a single group).

use crate::error::{TrainResult, TrainingError};
use crate::features::{extract_embeddings, FeatureMatrix};
use crate::probe::{LinearProbe, LogisticRegression, ProbeConfig, ProbeError};
use crate::scaler::StandardScaler;
use burn::tensor::backend::AutodiffBackend;
use group_data::{GroupDataError, GroupLabeled, SpuriousDataset};
use models::ImageClassifier;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// `[1.0, 0.9, ..., 0.1]`
pub fn default_s_range() -> Vec<f64> {
    (1..=10).rev().map(|i| i as f64 / 10.0).collect()
}

pub fn default_alpha_range() -> Vec<f64> {
    vec![1.0, 0.8, 0.6, 0.4, 0.2]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispelConfig {
    /// Weight of the example's own embedding in a mix.
    pub s_range: Vec<f64>,
    /// Probability that an example is mixed.
    pub alpha_range: Vec<f64>,
    pub probe: ProbeConfig,
    pub cv_folds: usize,
    pub seed: u64,
    pub batch_size: usize,
    pub verbose: bool,
}

impl Default for DispelConfig {
    fn default() -> Self {
        Self {
            s_range: default_s_range(),
            alpha_range: default_alpha_range(),
            probe: ProbeConfig::default(),
            cv_folds: 2,
            seed: 0,
            batch_size: 256,
            verbose: true,
        }
    }
}

impl DispelConfig {
    pub fn validate(&self) -> TrainResult<()> {
        let bad = |msg: String| Err(TrainingError::Data(GroupDataError::Config(msg)));
        if self.s_range.is_empty() || self.alpha_range.is_empty() {
            return bad("s_range and alpha_range must not be empty".to_string());
        }
        if let Some(v) = self
            .s_range
            .iter()
            .chain(&self.alpha_range)
            .find(|v| !(0.0..=1.0).contains(*v))
        {
            return bad(format!("grid value {v} outside [0, 1]"));
        }
        if self.cv_folds < 2 {
            return bad(format!("cv_folds must be at least 2, got {}", self.cv_folds));
        }
        if self.probe.c.is_nan() || self.probe.c <= 0.0 {
            return bad(format!("probe C must be positive, got {}", self.probe.c));
        }
        Ok(())
    }

    /// Grid points in selection order (`s` outer, `alpha` inner).
    pub fn grid(&self) -> Vec<GridPoint> {
        self.s_range
            .iter()
            .flat_map(|&s| self.alpha_range.iter().map(move |&alpha| GridPoint { s, alpha }))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridPoint {
    pub s: f64,
    pub alpha: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GridScore {
    pub point: GridPoint,
    /// Mean held-out worst-group accuracy; `None` when a fold failed to fit
    /// (`fold_wga` is then empty).
    pub score: Option<f64>,
    pub fold_wga: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct DispelOutcome {
    pub probe: LinearProbe,
    pub selected: GridPoint,
    pub cv_wga: f64,
    pub scores: Vec<GridScore>,
}

/// Split positions `0..group_ids.len()` into `k` folds so every group is
/// spread evenly across folds. Each fold is sorted.
pub fn group_stratified_folds(group_ids: &[usize], k: usize, seed: u64) -> Vec<Vec<usize>> {
    let k = k.max(1);
    let mut by_group: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (pos, &g) in group_ids.iter().enumerate() {
        by_group.entry(g).or_default().push(pos);
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let mut folds = vec![Vec::new(); k];
    let mut next = 0;
    for members in by_group.values_mut() {
        members.shuffle(&mut rng);
        for &pos in members.iter() {
            folds[next % k].push(pos);
            next += 1;
        }
    }
    for fold in &mut folds {
        fold.sort_unstable();
    }
    folds
}

/// Mixed copies of `rows` of `z` (labels and groups indexed like `z`'s rows).
pub fn mix_features(
    z: &FeatureMatrix,
    rows: &[usize],
    labels: &[usize],
    groups: &[usize],
    point: GridPoint,
    rng: &mut StdRng,
) -> FeatureMatrix {
    let mut by_class: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for &r in rows {
        by_class.entry(labels[r]).or_default().push(r);
    }
    let mut partners: BTreeMap<(usize, usize), Vec<usize>> = BTreeMap::new();
    for &r in rows {
        let key = (labels[r], groups[r]);
        if partners.contains_key(&key) {
            continue;
        }
        let same_class = &by_class[&labels[r]];
        let mut other: Vec<usize> = same_class
            .iter()
            .copied()
            .filter(|&j| groups[j] != groups[r])
            .collect();
        if other.is_empty() {
            other = same_class.clone();
        }
        partners.insert(key, other);
    }

    let mut out = z.select(rows);
    let s = point.s as f32;
    for (pos, &r) in rows.iter().enumerate() {
        if !rng.random_bool(point.alpha) {
            continue;
        }
        let candidates = &partners[&(labels[r], groups[r])];
        let j = candidates[rng.random_range(0..candidates.len())];
        let partner = z.row(j);
        for (v, p) in out.row_mut(pos).iter_mut().zip(partner) {
            *v = s * *v + (1.0 - s) * p;
        }
    }
    out
}

/// Per-example weights so that every group contributes equally.
pub fn group_balanced_weights(groups: &[usize]) -> Vec<f32> {
    let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
    for &g in groups {
        *counts.entry(g).or_default() += 1;
    }
    let n = groups.len() as f32;
    let num_groups = counts.len().max(1) as f32;
    groups
        .iter()
        .map(|g| n / (num_groups * counts[g] as f32))
        .collect()
}

/// Minimum per-group accuracy over the groups present in `groups`.
pub fn worst_group_accuracy(preds: &[usize], labels: &[usize], groups: &[usize]) -> f64 {
    let mut tally: BTreeMap<usize, (usize, usize)> = BTreeMap::new();
    for ((p, y), g) in preds.iter().zip(labels).zip(groups) {
        let entry = tally.entry(*g).or_default();
        entry.1 += 1;
        if p == y {
            entry.0 += 1;
        }
    }
    tally
        .values()
        .map(|&(hit, total)| hit as f64 / total as f64)
        .fold(f64::INFINITY, f64::min)
}

/// Score every grid point with `score_folds` (one worst-group accuracy per
/// fold). A point whose scoring fails keeps `score: None` and takes no part
/// in selection.
pub(crate) fn search_grid<F>(grid: &[GridPoint], verbose: bool, mut score_folds: F) -> Vec<GridScore>
where
    F: FnMut(usize, GridPoint) -> Result<Vec<f64>, ProbeError>,
{
    grid.iter()
        .enumerate()
        .map(|(p, &point)| match score_folds(p, point) {
            Ok(fold_wga) if !fold_wga.is_empty() => {
                let score = fold_wga.iter().sum::<f64>() / fold_wga.len() as f64;
                if verbose {
                    tracing::info!(
                        "s={:.2} alpha={:.2}: cv worst-group acc {score:.4}",
                        point.s,
                        point.alpha
                    );
                }
                GridScore {
                    point,
                    score: Some(score),
                    fold_wga,
                }
            }
            Ok(_) => {
                tracing::debug!("s={} alpha={} excluded: no folds scored", point.s, point.alpha);
                GridScore {
                    point,
                    score: None,
                    fold_wga: Vec::new(),
                }
            }
            Err(e) => {
                tracing::debug!("s={} alpha={} excluded: {e}", point.s, point.alpha);
                GridScore {
                    point,
                    score: None,
                    fold_wga: Vec::new(),
                }
            }
        })
        .collect()
}

/// Highest score wins; ties go to the earlier grid point.
pub(crate) fn select_best(scores: &[GridScore]) -> Option<(GridPoint, f64)> {
    let mut best: Option<(GridPoint, f64)> = None;
    for entry in scores {
        if let Some(score) = entry.score {
            match best {
                Some((_, b)) if score <= b => {}
                _ => best = Some((entry.point, score)),
            }
        }
    }
    best
}

fn mix_seed(seed: u64, point: usize, fold: usize) -> u64 {
    seed.wrapping_mul(0x9E37_79B9_7F4A_7C15)
        .wrapping_add(((point as u64) << 16) | fold as u64)
}

pub struct Dispel {
    config: DispelConfig,
}

impl Dispel {
    pub fn new(config: DispelConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DispelConfig {
        &self.config
    }

    /// Retrain the decision head of `model` on `group_labeled`. The scaler is
    /// fitted on `data_for_scaler` embeddings when given, otherwise on the
    /// group-labeled embeddings.
    pub fn fit<B, M>(
        &self,
        model: &M,
        group_labeled: &GroupLabeled,
        data_for_scaler: Option<&SpuriousDataset>,
        device: &B::Device,
    ) -> TrainResult<DispelOutcome>
    where
        B: AutodiffBackend,
        M: ImageClassifier<B::InnerBackend>,
    {
        self.config.validate()?;
        let dataset = group_labeled.dataset();
        let bs = self.config.batch_size;
        let z = extract_embeddings::<B::InnerBackend, M>(
            model,
            dataset,
            group_labeled.indices(),
            bs,
            device,
        )?;
        let scaler_source = match data_for_scaler {
            Some(ds) => {
                let all: Vec<usize> = (0..ds.len()).collect();
                Some(extract_embeddings::<B::InnerBackend, M>(model, ds, &all, bs, device)?)
            }
            None => None,
        };
        self.fit_features::<B>(
            &z,
            &group_labeled.labels(),
            group_labeled.group_ids(),
            dataset.num_classes(),
            scaler_source.as_ref(),
            device,
        )
    }

    /// Grid search and refit on precomputed raw embeddings.
    pub fn fit_features<B: AutodiffBackend>(
        &self,
        z: &FeatureMatrix,
        labels: &[usize],
        groups: &[usize],
        num_classes: usize,
        scaler_source: Option<&FeatureMatrix>,
        device: &B::Device,
    ) -> TrainResult<DispelOutcome> {
        let cfg = &self.config;
        cfg.validate()?;
        if z.rows() != labels.len() || z.rows() != groups.len() {
            return Err(TrainingError::Tensor(format!(
                "{} embeddings for {} labels and {} group ids",
                z.rows(),
                labels.len(),
                groups.len()
            )));
        }
        let scaler = StandardScaler::fit(scaler_source.unwrap_or(z))?;
        let zs = scaler.transform(z)?;
        let folds = group_stratified_folds(groups, cfg.cv_folds, cfg.seed);

        let grid = cfg.grid();
        let scores = search_grid(&grid, cfg.verbose, |p, point| {
            folds
                .iter()
                .enumerate()
                .map(|(f, held_out)| {
                    let train: Vec<usize> = (0..zs.rows())
                        .filter(|r| held_out.binary_search(r).is_err())
                        .collect();
                    self.score_fold::<B>(
                        &zs,
                        labels,
                        groups,
                        num_classes,
                        &train,
                        held_out,
                        point,
                        mix_seed(cfg.seed, p, f),
                        device,
                    )
                })
                .collect()
        });
        let (selected, cv_wga) = select_best(&scores).ok_or(TrainingError::NoViableConfiguration {
            tried: grid.len(),
        })?;
        if cfg.verbose {
            tracing::info!(
                "selected s={} alpha={} (cv worst-group acc {cv_wga:.4})",
                selected.s,
                selected.alpha
            );
        }

        let all: Vec<usize> = (0..zs.rows()).collect();
        let selected_idx = grid.iter().position(|p| *p == selected).unwrap_or(0);
        let mut rng = StdRng::seed_from_u64(mix_seed(cfg.seed, selected_idx, folds.len()));
        let mixed = mix_features(&zs, &all, labels, groups, selected, &mut rng);
        let head = LogisticRegression::fit::<B>(
            &mixed,
            labels,
            &group_balanced_weights(groups),
            num_classes,
            &cfg.probe,
            device,
        )?;

        Ok(DispelOutcome {
            probe: LinearProbe::new(scaler, head),
            selected,
            cv_wga,
            scores,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn score_fold<B: AutodiffBackend>(
        &self,
        zs: &FeatureMatrix,
        labels: &[usize],
        groups: &[usize],
        num_classes: usize,
        train: &[usize],
        held_out: &[usize],
        point: GridPoint,
        seed: u64,
        device: &B::Device,
    ) -> Result<f64, ProbeError> {
        if train.is_empty() || held_out.is_empty() {
            return Err(ProbeError::Empty("empty cross-validation fold".to_string()));
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let mixed = mix_features(zs, train, labels, groups, point, &mut rng);
        let train_labels: Vec<usize> = train.iter().map(|&r| labels[r]).collect();
        let train_groups: Vec<usize> = train.iter().map(|&r| groups[r]).collect();
        let head = LogisticRegression::fit::<B>(
            &mixed,
            &train_labels,
            &group_balanced_weights(&train_groups),
            num_classes,
            &self.config.probe,
            device,
        )?;
        let preds = head.predict(&zs.select(held_out))?;
        let test_labels: Vec<usize> = held_out.iter().map(|&r| labels[r]).collect();
        let test_groups: Vec<usize> = held_out.iter().map(|&r| groups[r]).collect();
        Ok(worst_group_accuracy(&preds, &test_labels, &test_groups))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};

    type B = Autodiff<NdArray<f32>>;

    /// Two classes separable on feature 0; feature 1 is a spurious attribute
    /// that agrees with the class in the majority groups.
    fn toy() -> (FeatureMatrix, Vec<usize>, Vec<usize>) {
        let mut rng = StdRng::seed_from_u64(5);
        let mut data = Vec::new();
        let mut labels = Vec::new();
        let mut groups = Vec::new();
        for (label, attr, count) in [(0usize, 0usize, 24), (0, 1, 6), (1, 1, 24), (1, 0, 6)] {
            for _ in 0..count {
                let core = if label == 1 { 1.0 } else { -1.0 };
                let spur = if attr == 1 { 2.0 } else { -2.0 };
                data.push(core + rng.random_range(-0.3..0.3));
                data.push(spur + rng.random_range(-0.3..0.3));
                labels.push(label);
                groups.push(label * 2 + attr);
            }
        }
        let rows = labels.len();
        (FeatureMatrix::from_vec(data, rows, 2).unwrap(), labels, groups)
    }

    fn small_config() -> DispelConfig {
        DispelConfig {
            s_range: vec![1.0, 0.5],
            alpha_range: vec![1.0, 0.5],
            seed: 3,
            verbose: false,
            ..Default::default()
        }
    }

    #[test]
    fn folds_cover_each_group_evenly() {
        let groups = [0, 0, 0, 0, 1, 1, 2, 2, 2];
        let folds = group_stratified_folds(&groups, 2, 7);
        let mut all: Vec<usize> = folds.concat();
        all.sort_unstable();
        assert_eq!(all, (0..groups.len()).collect::<Vec<_>>());
        for g in 0..3 {
            let per_fold: Vec<usize> = folds
                .iter()
                .map(|f| f.iter().filter(|&&p| groups[p] == g).count())
                .collect();
            let diff = per_fold[0].abs_diff(per_fold[1]);
            assert!(diff <= 1, "group {g} split {per_fold:?}");
        }
    }

    #[test]
    fn mixing_respects_s_and_alpha() {
        let (z, labels, groups) = toy();
        let rows: Vec<usize> = (0..z.rows()).collect();
        let mut rng = StdRng::seed_from_u64(1);
        let same = mix_features(&z, &rows, &labels, &groups, GridPoint { s: 1.0, alpha: 1.0 }, &mut rng);
        assert_eq!(same, z);
        let untouched = mix_features(&z, &rows, &labels, &groups, GridPoint { s: 0.5, alpha: 0.0 }, &mut rng);
        assert_eq!(untouched, z);
        // Fully mixed halfway: the spurious coordinate of a majority example
        // moves toward its class's minority group.
        let mixed = mix_features(&z, &rows, &labels, &groups, GridPoint { s: 0.5, alpha: 1.0 }, &mut rng);
        for r in 0..24 {
            assert!(mixed.row(r)[1].abs() < 0.6);
        }
    }

    #[test]
    fn balanced_weights_equalize_groups() {
        let w = group_balanced_weights(&[0, 0, 0, 1]);
        assert!((w[0] * 3.0 - w[3]).abs() < 1e-6);
        assert!((w.iter().sum::<f32>() - 4.0).abs() < 1e-5);
    }

    #[test]
    fn grid_search_is_deterministic() {
        let (z, labels, groups) = toy();
        let device = Default::default();
        let dispel = Dispel::new(small_config());
        let a = dispel.fit_features::<B>(&z, &labels, &groups, 2, None, &device).unwrap();
        let b = dispel.fit_features::<B>(&z, &labels, &groups, 2, None, &device).unwrap();
        assert_eq!(a.selected, b.selected);
        assert_eq!(a.probe, b.probe);
        assert_eq!(a.scores, b.scores);
        assert_eq!(a.scores.len(), 4);
        assert!(a.cv_wga > 0.5);
    }

    #[test]
    fn no_viable_configuration_when_every_fit_fails() {
        let (z, _, groups) = toy();
        let labels = vec![0; z.rows()];
        let device = Default::default();
        let err = Dispel::new(small_config())
            .fit_features::<B>(&z, &labels, &groups, 2, None, &device)
            .unwrap_err();
        assert!(matches!(err, TrainingError::NoViableConfiguration { tried: 4 }));
    }

    #[test]
    fn failed_grid_points_are_excluded_while_the_rest_compete() {
        let grid = small_config().grid();
        // Every point with s < 1 fails; among the rest the later one scores higher.
        let scores = search_grid(&grid, false, |p, point| {
            if point.s < 1.0 {
                Err(ProbeError::NonFinite {
                    iter: 0,
                    loss: f32::NAN,
                })
            } else {
                Ok(vec![0.5 + p as f64 * 0.1, 0.5])
            }
        });
        assert_eq!(scores.len(), 4);
        let failed: Vec<GridPoint> = scores
            .iter()
            .filter(|g| g.score.is_none())
            .map(|g| g.point)
            .collect();
        assert_eq!(
            failed,
            vec![GridPoint { s: 0.5, alpha: 1.0 }, GridPoint { s: 0.5, alpha: 0.5 }]
        );
        assert!(scores.iter().filter(|g| g.score.is_none()).all(|g| g.fold_wga.is_empty()));

        let (selected, score) = select_best(&scores).unwrap();
        assert_eq!(selected, GridPoint { s: 1.0, alpha: 0.5 });
        assert!((score - 0.55).abs() < 1e-12);
    }

    #[test]
    fn ties_keep_the_earliest_grid_point() {
        let grid = small_config().grid();
        let scores = search_grid(&grid, false, |p, _| match p {
            0 => Err(ProbeError::SingleClass(0)),
            _ => Ok(vec![0.75]),
        });
        assert_eq!(select_best(&scores).map(|(p, _)| p), Some(grid[1]));
        assert_eq!(select_best(&scores[..1]), None);
    }

    #[test]
    fn invalid_grid_is_rejected() {
        let cfg = DispelConfig {
            s_range: vec![1.5],
            ..small_config()
        };
        assert!(cfg.validate().is_err());
        let cfg = DispelConfig {
            cv_folds: 1,
            ..small_config()
        };
        assert!(cfg.validate().is_err());
    }
}
