//! ERM then DISPEL on the synthetic grouped dataset.

use burn::backend::{Autodiff, NdArray};
use burn::module::AutodiffModule;
use group_data::{
    project_group_weights, GroupLabeled, Split, SpuriousDataset, SpuriousLabelType,
    SyntheticGroups,
};
use models::{ClassifierInit, Mlp};
use training::util::seed_backend;
use training::{
    Dispel, DispelConfig, EpochMetrics, EpochObserver, Erm, Evaluator, SgdSettings, TrainResult,
    TrainerConfig,
};

type Inner = NdArray<f32>;
type B = Autodiff<Inner>;

fn split(split: Split, label_type: SpuriousLabelType, balanced: bool) -> SpuriousDataset {
    let generator = SyntheticGroups::default().with_seed(11);
    let generator = if balanced {
        generator.balanced()
    } else {
        generator
    };
    let mut ds = generator.generate(split, label_type).unwrap();
    ds.initialize().unwrap();
    ds
}

#[derive(Default)]
struct Recorder(Vec<EpochMetrics>);

impl EpochObserver for Recorder {
    fn on_epoch(&mut self, metrics: &EpochMetrics) -> TrainResult<()> {
        self.0.push(metrics.clone());
        Ok(())
    }
}

#[test]
fn retraining_lifts_worst_group_accuracy_over_erm() {
    let train = split(Split::Train, SpuriousLabelType::Both, false);
    let val = split(Split::Val, SpuriousLabelType::Both, true);
    let test = split(Split::Test, SpuriousLabelType::Both, true);
    let device = Default::default();

    let val_eval = Evaluator::new(
        val.group_partition().unwrap().clone(),
        project_group_weights(train.group_weights().unwrap(), val.label_type()).unwrap(),
    );
    let test_eval = Evaluator::new(
        test.group_partition().unwrap().clone(),
        train.group_weights().unwrap().clone(),
    );

    let erm = Erm::new(
        TrainerConfig {
            batch_size: 32,
            num_epochs: 4,
            shuffle_seed: 1,
            verbose: false,
        },
        SgdSettings {
            lr: 0.05,
            weight_decay: 1e-4,
            momentum: 0.9,
        },
    )
    .with_val_evaluator(val_eval.clone());
    seed_backend::<B>(0, &device);
    let model = Mlp::<B>::init(train.image_shape(), train.num_classes(), &device);
    let mut recorder = Recorder::default();
    let (model, history) = erm
        .fit::<B, _>(model, &train, Some(&val), &device, Some(&mut recorder))
        .unwrap();
    assert_eq!(history.len(), 4);
    assert_eq!(recorder.0, history);
    assert!(history.iter().all(|m| m.mean_loss.is_finite() && m.val_wga.is_some()));

    let inference = model.valid();
    let erm_test = test_eval
        .evaluate::<Inner, _>(&inference, &test, None, &device)
        .unwrap();

    let group_labeled = GroupLabeled::from_dataset(&val).unwrap();
    let outcome = Dispel::new(DispelConfig {
        s_range: vec![1.0, 0.7],
        alpha_range: vec![1.0, 0.5],
        seed: 2,
        verbose: false,
        ..Default::default()
    })
    .fit::<B, _>(&inference, &group_labeled, Some(&train), &device)
    .unwrap();
    assert_eq!(outcome.scores.len(), 4);

    let retrained = test_eval
        .evaluate::<Inner, _>(&inference, &test, Some(&outcome.probe), &device)
        .unwrap();
    assert!(
        erm_test.worst_group_acc < 0.3,
        "ERM should fail a minority group, got wga {}",
        erm_test.worst_group_acc
    );
    assert!(
        retrained.worst_group_acc > erm_test.worst_group_acc,
        "retrained wga {} vs ERM wga {}",
        retrained.worst_group_acc,
        erm_test.worst_group_acc
    );
    assert!(retrained.worst_group_acc <= retrained.avg_acc + 1e-12);
    assert!(retrained.avg_acc > 0.5, "avg acc {}", retrained.avg_acc);
}

#[test]
fn coarse_validation_groups_are_weighted_by_training_frequency() {
    let train = split(Split::Train, SpuriousLabelType::Both, false);
    let val = split(Split::Val, SpuriousLabelType::Background, true);
    let weights =
        project_group_weights(train.group_weights().unwrap(), val.label_type()).unwrap();
    assert_eq!(weights.len(), val.group_partition().unwrap().len());
    assert!((weights.total() - 1.0).abs() < 1e-9);
}
