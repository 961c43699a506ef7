use burn::backend::NdArray;
use group_data::{Split, SpuriousLabelType, SyntheticGroups};
use models::{ClassifierInit, Mlp};
use training::Evaluator;

type B = NdArray<f32>;

#[test]
fn report_is_independent_of_batch_size() {
    let mut ds = SyntheticGroups {
        examples_per_class: 40,
        ..Default::default()
    }
    .generate(Split::Test, SpuriousLabelType::Both)
    .unwrap();
    ds.initialize().unwrap();

    let device = Default::default();
    let model = Mlp::<B>::init(ds.image_shape(), ds.num_classes(), &device);
    let small = Evaluator::for_dataset(&ds)
        .unwrap()
        .with_batch_size(7)
        .evaluate::<B, _>(&model, &ds, None, &device)
        .unwrap();
    let large = Evaluator::for_dataset(&ds)
        .unwrap()
        .with_batch_size(1000)
        .evaluate::<B, _>(&model, &ds, None, &device)
        .unwrap();

    assert_eq!(small, large);
    assert_eq!(small.num_examples, ds.len());
    assert!(small.worst_group_acc <= small.avg_acc + 1e-12);
}

#[test]
fn restricted_partition_only_counts_its_groups() {
    let mut ds = SyntheticGroups {
        examples_per_class: 40,
        ..Default::default()
    }
    .generate(Split::Val, SpuriousLabelType::Background)
    .unwrap();
    ds.initialize().unwrap();

    let mut partition = ds.group_partition().unwrap().clone();
    let first = partition.keys().next().cloned().unwrap();
    let kept = partition.remove(&first).unwrap();

    let device = Default::default();
    let model = Mlp::<B>::init(ds.image_shape(), ds.num_classes(), &device);
    let report = Evaluator::new(partition.clone(), ds.group_weights().unwrap().clone())
        .evaluate::<B, _>(&model, &ds, None, &device)
        .unwrap();
    assert_eq!(report.group_acc.len(), partition.len());
    assert_eq!(report.num_examples, ds.len() - kept.len());
    assert!(!report.group_acc.contains_key(&first));
}
