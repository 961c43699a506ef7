//! Mini-batch SGD on a classification loss (cross entropy by default).

use crate::error::{to_host, TrainResult, TrainingError};
use crate::evaluate::argmax_rows;
use burn::module::AutodiffModule;
use burn::nn::loss::CrossEntropyLossConfig;
use burn::optim::decay::WeightDecayConfig;
use burn::optim::momentum::MomentumConfig;
use burn::optim::{GradientsParams, Optimizer, SgdConfig};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{Int, Tensor};
use group_data::{BatchIter, SpuriousDataset};
use models::ImageClassifier;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerConfig {
    pub batch_size: usize,
    pub num_epochs: usize,
    /// Base seed for the per-epoch shuffle (epoch `e` uses `shuffle_seed + e`).
    pub shuffle_seed: u64,
    pub verbose: bool,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            batch_size: 128,
            num_epochs: 1,
            shuffle_seed: 0,
            verbose: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SgdSettings {
    pub lr: f64,
    pub weight_decay: f64,
    pub momentum: f64,
}

impl Default for SgdSettings {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            weight_decay: 1e-4,
            momentum: 0.9,
        }
    }
}

impl SgdSettings {
    pub fn optimizer_config(&self) -> SgdConfig {
        let mut cfg = SgdConfig::new();
        if self.weight_decay > 0.0 {
            cfg = cfg.with_weight_decay(Some(WeightDecayConfig::new(self.weight_decay as f32)));
        }
        if self.momentum > 0.0 {
            cfg = cfg.with_momentum(Some(
                MomentumConfig::new()
                    .with_momentum(self.momentum)
                    .with_dampening(0.0),
            ));
        }
        cfg
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub mean_loss: f32,
    pub train_acc: f64,
    /// Validation worst-group accuracy, when a validation evaluator ran.
    pub val_wga: Option<f64>,
    pub val_avg_acc: Option<f64>,
}

/// Receives metrics after every epoch (e.g. an experiment-tracking sink).
pub trait EpochObserver {
    fn on_epoch(&mut self, metrics: &EpochMetrics) -> TrainResult<()>;
}

/// Mean loss of a mini-batch given logits `[n, k]` and class targets `[n]`.
pub trait ClassificationLoss {
    fn forward<B: Backend>(&self, logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> Tensor<B, 1>;
}

/// Cross entropy on logits, with optional label smoothing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CrossEntropy {
    pub smoothing: Option<f32>,
}

impl ClassificationLoss for CrossEntropy {
    fn forward<B: Backend>(&self, logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> Tensor<B, 1> {
        CrossEntropyLossConfig::new()
            .with_smoothing(self.smoothing)
            .init::<B>(&logits.device())
            .forward(logits, targets)
    }
}

pub struct Trainer<L = CrossEntropy> {
    config: TrainerConfig,
    sgd: SgdSettings,
    loss: L,
}

impl Trainer {
    pub fn new(config: TrainerConfig, sgd: SgdSettings) -> Self {
        Self {
            config,
            sgd,
            loss: CrossEntropy::default(),
        }
    }
}

impl<L: ClassificationLoss> Trainer<L> {
    /// Replace the training objective.
    pub fn with_loss<L2: ClassificationLoss>(self, loss: L2) -> Trainer<L2> {
        Trainer {
            config: self.config,
            sgd: self.sgd,
            loss,
        }
    }

    pub fn loss(&self) -> &L {
        &self.loss
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn sgd(&self) -> &SgdSettings {
        &self.sgd
    }

    /// One pass over `dataset`; one optimizer step per mini-batch.
    pub fn run_epoch<B, M, O>(
        &self,
        mut model: M,
        optim: &mut O,
        dataset: &SpuriousDataset,
        epoch: usize,
        device: &B::Device,
    ) -> TrainResult<(M, EpochMetrics)>
    where
        B: AutodiffBackend,
        M: ImageClassifier<B> + AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        let seed = self.config.shuffle_seed.wrapping_add(epoch as u64);
        let mut iter = BatchIter::over_dataset(dataset, self.config.batch_size, Some(seed));
        let mut losses = Vec::with_capacity(iter.num_batches());
        let mut correct = 0usize;
        let mut seen = 0usize;

        while let Some(batch) = iter.next_batch::<B>(dataset, device)? {
            let logits = model.forward(batch.images);
            let loss = self.loss.forward(logits.clone(), batch.labels);
            let loss_val = to_host(loss.clone().detach())?
                .first()
                .copied()
                .unwrap_or(f32::NAN);
            if !loss_val.is_finite() {
                return Err(TrainingError::Diverged {
                    epoch,
                    loss: loss_val,
                });
            }

            let k = logits.dims()[1];
            let preds = argmax_rows(&to_host(logits.detach())?, k);
            correct += preds
                .iter()
                .zip(&batch.indices)
                .filter(|(p, idx)| **p == dataset.label(**idx))
                .count();
            seen += batch.indices.len();

            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optim.step(self.sgd.lr, model, grads);
            losses.push(loss_val);
        }

        let mean_loss = if losses.is_empty() {
            0.0
        } else {
            losses.iter().sum::<f32>() / losses.len() as f32
        };
        let train_acc = if seen == 0 {
            0.0
        } else {
            correct as f64 / seen as f64
        };
        Ok((
            model,
            EpochMetrics {
                epoch,
                mean_loss,
                train_acc,
                val_wga: None,
                val_avg_acc: None,
            },
        ))
    }

    /// Train for `num_epochs` epochs with SGD; no early stopping or model selection.
    pub fn train<B, M>(
        &self,
        model: M,
        dataset: &SpuriousDataset,
        device: &B::Device,
        observer: Option<&mut dyn EpochObserver>,
    ) -> TrainResult<(M, Vec<EpochMetrics>)>
    where
        B: AutodiffBackend,
        M: ImageClassifier<B> + AutodiffModule<B>,
    {
        self.train_with::<B, M, _>(model, dataset, device, observer, |_, _| Ok(()))
    }

    /// Like [`Trainer::train`], calling `after_epoch` with the updated model
    /// before the epoch is logged and reported, so it can fill in
    /// validation metrics.
    pub fn train_with<B, M, F>(
        &self,
        mut model: M,
        dataset: &SpuriousDataset,
        device: &B::Device,
        mut observer: Option<&mut dyn EpochObserver>,
        mut after_epoch: F,
    ) -> TrainResult<(M, Vec<EpochMetrics>)>
    where
        B: AutodiffBackend,
        M: ImageClassifier<B> + AutodiffModule<B>,
        F: FnMut(&M, &mut EpochMetrics) -> TrainResult<()>,
    {
        let mut optim = self.sgd.optimizer_config().init::<B, M>();
        let mut history = Vec::with_capacity(self.config.num_epochs);
        for epoch in 0..self.config.num_epochs {
            let (next, mut metrics) =
                self.run_epoch::<B, M, _>(model, &mut optim, dataset, epoch, device)?;
            model = next;
            after_epoch(&model, &mut metrics)?;
            if self.config.verbose {
                match (metrics.val_wga, metrics.val_avg_acc) {
                    (Some(wga), Some(avg)) => tracing::info!(
                        "epoch {epoch}: avg loss {:.4}, train acc {:.4}, val wga {wga:.4}, val avg acc {avg:.4}",
                        metrics.mean_loss,
                        metrics.train_acc
                    ),
                    _ => tracing::info!(
                        "epoch {epoch}: avg loss {:.4}, train acc {:.4}",
                        metrics.mean_loss,
                        metrics.train_acc
                    ),
                }
            }
            if let Some(obs) = observer.as_deref_mut() {
                obs.on_epoch(&metrics)?;
            }
            history.push(metrics);
        }
        Ok((model, history))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use group_data::{Split, SpuriousLabelType, SyntheticGroups};
    use models::{ClassifierInit, Mlp};
    use std::cell::Cell;

    type B = Autodiff<NdArray<f32>>;

    /// Cross entropy that counts how often it is evaluated.
    #[derive(Default)]
    struct CountingLoss {
        calls: Cell<usize>,
    }

    impl ClassificationLoss for CountingLoss {
        fn forward<Q: Backend>(&self, logits: Tensor<Q, 2>, targets: Tensor<Q, 1, Int>) -> Tensor<Q, 1> {
            self.calls.set(self.calls.get() + 1);
            CrossEntropy::default().forward(logits, targets)
        }
    }

    #[derive(Default)]
    struct Epochs(Vec<usize>);

    impl EpochObserver for Epochs {
        fn on_epoch(&mut self, metrics: &EpochMetrics) -> TrainResult<()> {
            self.0.push(metrics.epoch);
            Ok(())
        }
    }

    #[test]
    fn train_runs_every_epoch_with_the_given_loss() {
        let mut ds = SyntheticGroups {
            examples_per_class: 20,
            ..Default::default()
        }
        .generate(Split::Train, SpuriousLabelType::Both)
        .unwrap();
        ds.initialize().unwrap();

        let device = Default::default();
        let trainer = Trainer::new(
            TrainerConfig {
                batch_size: 16,
                num_epochs: 2,
                shuffle_seed: 4,
                verbose: false,
            },
            SgdSettings {
                lr: 0.01,
                ..Default::default()
            },
        )
        .with_loss(CountingLoss::default());
        let model = Mlp::<B>::init(ds.image_shape(), ds.num_classes(), &device);
        let mut epochs = Epochs::default();
        let (_, history) = trainer
            .train::<B, _>(model, &ds, &device, Some(&mut epochs))
            .unwrap();

        assert_eq!(history.len(), 2);
        assert_eq!(epochs.0, vec![0, 1]);
        assert_eq!(trainer.loss().calls.get(), 2 * ds.len().div_ceil(16));
        for m in &history {
            assert!(m.mean_loss.is_finite() && m.mean_loss > 0.0);
            assert!((0.0..=1.0).contains(&m.train_acc));
            assert!(m.val_wga.is_none());
        }
    }

    #[test]
    fn label_smoothing_changes_the_loss() {
        let device = Default::default();
        let logits = Tensor::<NdArray<f32>, 2>::from_floats([[4.0, -4.0], [-4.0, 4.0]], &device);
        let targets = Tensor::<NdArray<f32>, 1, Int>::from_ints([0, 1], &device);
        let plain = CrossEntropy::default()
            .forward(logits.clone(), targets.clone())
            .into_scalar();
        let smoothed = CrossEntropy {
            smoothing: Some(0.2),
        }
        .forward(logits, targets)
        .into_scalar();
        assert!(smoothed > plain);
    }

    #[test]
    fn sgd_settings_map_to_optimizer_config() {
        let cfg = SgdSettings {
            lr: 0.1,
            weight_decay: 0.0,
            momentum: 0.0,
        }
        .optimizer_config();
        assert!(cfg.weight_decay.is_none());
        assert!(cfg.momentum.is_none());

        let cfg = SgdSettings::default().optimizer_config();
        assert!(cfg.weight_decay.is_some());
        assert_eq!(cfg.momentum.as_ref().map(|m| m.dampening), Some(0.0));
    }
}
