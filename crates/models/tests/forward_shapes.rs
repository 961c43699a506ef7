use burn::backend::NdArray;
use burn::tensor::Tensor;
use models::{
    load_pretrained, load_record, save_record, Architecture, ClassifierInit, ImageClassifier, Mlp,
    ModelError, ResNet18, ResNet50, ResNet50Config, SmallCnn,
};

type B = NdArray<f32>;

#[test]
fn mlp_and_cnn_shapes() {
    let device = Default::default();
    let images = Tensor::<B, 4>::zeros([5, 3, 8, 8], &device);

    let mlp = Mlp::<B>::init([3, 8, 8], 2, &device);
    assert_eq!(mlp.embed(images.clone()).dims(), [5, mlp.embedding_dim()]);
    assert_eq!(mlp.forward(images.clone()).dims(), [5, 2]);

    let cnn = SmallCnn::<B>::init([3, 8, 8], 3, &device);
    assert_eq!(cnn.embed(images.clone()).dims(), [5, 64]);
    assert_eq!(cnn.forward(images).dims(), [5, 3]);
}

#[test]
fn resnet18_shapes_and_fresh_head() {
    let device = Default::default();
    let images = Tensor::<B, 4>::zeros([2, 3, 32, 32], &device);

    let model = ResNet18::<B>::init([3, 32, 32], 2, &device);
    assert_eq!(model.embedding_dim(), 512);
    assert_eq!(model.embed(images.clone()).dims(), [2, 512]);
    assert_eq!(model.forward(images.clone()).dims(), [2, 2]);

    let model = model.with_fresh_head(4, &device);
    assert_eq!(model.num_classes(), 4);
    assert_eq!(model.embed(images.clone()).dims(), [2, 512]);
    assert_eq!(model.forward(images).dims(), [2, 4]);
}

#[test]
fn resnet50_bottleneck_shapes() {
    assert_eq!(ResNet50Config::default().embedding_dim(), 2048);

    let device = Default::default();
    let images = Tensor::<B, 4>::zeros([2, 3, 32, 32], &device);
    let cfg = ResNet50Config {
        widths: [8, 16, 32, 64],
        blocks_per_stage: [1, 2, 1, 1],
        expansion: 4,
        norm_groups: 4,
    };
    let model = ResNet50::<B>::new(cfg, [3, 32, 32], 3, &device);
    assert_eq!(model.embedding_dim(), 256);
    assert_eq!(model.embed(images.clone()).dims(), [2, 256]);
    assert_eq!(model.forward(images.clone()).dims(), [2, 3]);

    let model = model.with_fresh_head(2, &device);
    assert_eq!(model.forward(images).dims(), [2, 2]);
}

#[test]
fn record_round_trip_preserves_outputs() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("nested").join("mlp.bin");
    let device = Default::default();
    let images = Tensor::<B, 4>::ones([2, 3, 4, 4], &device);

    let model = Mlp::<B>::init([3, 4, 4], 2, &device);
    let before = model.forward(images.clone()).into_data().to_vec::<f32>().unwrap();
    save_record(model, &path).unwrap();

    let fresh = Mlp::<B>::init([3, 4, 4], 2, &device);
    let loaded = load_record(fresh, &path, &device).unwrap();
    let after = loaded.forward(images).into_data().to_vec::<f32>().unwrap();
    for (a, b) in before.iter().zip(&after) {
        assert!((a - b).abs() < 1e-6);
    }
}

#[test]
fn pretrained_weights_replace_the_head() {
    let tmp = tempfile::tempdir().unwrap();
    let device = Default::default();
    let backbone = Mlp::<B>::init([3, 4, 4], 2, &device);
    save_record(backbone, &Architecture::Mlp.weights_path(tmp.path())).unwrap();

    let model = load_pretrained(
        Mlp::<B>::init([3, 4, 4], 2, &device),
        Architecture::Mlp,
        tmp.path(),
        5,
        &device,
    )
    .unwrap();
    assert_eq!(model.num_classes(), 5);

    let err = load_pretrained(
        SmallCnn::<B>::init([3, 4, 4], 2, &device),
        Architecture::Cnn,
        tmp.path(),
        2,
        &device,
    )
    .unwrap_err();
    assert!(matches!(err, ModelError::MissingWeights { .. }));
}

#[test]
fn architecture_parses_names() {
    assert_eq!("ResNet18".parse::<Architecture>().unwrap(), Architecture::Resnet18);
    assert_eq!("resnet50".parse::<Architecture>().unwrap(), Architecture::Resnet50);
    assert_eq!(Architecture::Resnet50.to_string(), "resnet50");
    assert!("vit".parse::<Architecture>().is_err());
}
