//! Stage 1: empirical risk minimization of the full classifier.

use crate::error::TrainResult;
use crate::evaluate::Evaluator;
use crate::trainer::{
    ClassificationLoss, CrossEntropy, EpochMetrics, EpochObserver, SgdSettings, Trainer,
    TrainerConfig,
};
use burn::module::AutodiffModule;
use burn::tensor::backend::AutodiffBackend;
use group_data::SpuriousDataset;
use models::ImageClassifier;

pub struct Erm<L = CrossEntropy> {
    trainer: Trainer<L>,
    val_evaluator: Option<Evaluator>,
}

impl Erm {
    pub fn new(config: TrainerConfig, sgd: SgdSettings) -> Self {
        Self {
            trainer: Trainer::new(config, sgd),
            val_evaluator: None,
        }
    }
}

impl<L: ClassificationLoss> Erm<L> {
    pub fn with_loss<L2: ClassificationLoss>(self, loss: L2) -> Erm<L2> {
        Erm {
            trainer: self.trainer.with_loss(loss),
            val_evaluator: self.val_evaluator,
        }
    }

    /// Evaluate the validation split after every epoch. Results are only
    /// logged and reported; they never influence training.
    pub fn with_val_evaluator(mut self, evaluator: Evaluator) -> Self {
        self.val_evaluator = Some(evaluator);
        self
    }

    pub fn trainer(&self) -> &Trainer<L> {
        &self.trainer
    }

    pub fn fit<B, M>(
        &self,
        model: M,
        train: &SpuriousDataset,
        val: Option<&SpuriousDataset>,
        device: &B::Device,
        observer: Option<&mut dyn EpochObserver>,
    ) -> TrainResult<(M, Vec<EpochMetrics>)>
    where
        B: AutodiffBackend,
        M: ImageClassifier<B> + AutodiffModule<B>,
        M::InnerModule: ImageClassifier<B::InnerBackend>,
    {
        let validation = self.val_evaluator.as_ref().zip(val);
        self.trainer
            .train_with::<B, M, _>(model, train, device, observer, |model, metrics| {
                if let Some((evaluator, val)) = validation {
                    let report = evaluator.evaluate::<B::InnerBackend, _>(
                        &model.valid(),
                        val,
                        None,
                        device,
                    )?;
                    metrics.val_wga = Some(report.worst_group_acc);
                    metrics.val_avg_acc = Some(report.avg_acc);
                }
                Ok(())
            })
    }
}
