//! Command-line arguments and pipelines shared by the `lrmix`, `erm` and
//! `eval` binaries.

use crate::dispel::{default_alpha_range, default_s_range, Dispel, DispelConfig, DispelOutcome};
use crate::erm::Erm;
use crate::error::{TrainResult, TrainingError};
use crate::evaluate::{EvalReport, Evaluator};
use crate::probe::ProbeConfig;
use crate::results::{append_csv, ResultRecord};
use crate::tracking::JsonlTracker;
use crate::trainer::{EpochObserver, SgdSettings, TrainerConfig};
use crate::util::{default_checkpoint_path, resolve_device, seed_backend, BackendKind, RunDevice};
#[cfg(feature = "backend-wgpu")]
use crate::AccelBackend;
use crate::HostBackend;
use burn::backend::Autodiff;
use burn::module::AutodiffModule;
use burn::tensor::backend::{AutodiffBackend, Backend};
use clap::{Args, Parser, ValueEnum};
use cli_support::{confirm_overwrite, init_logging, OutputArgs, TrackingArgs};
use group_data::{
    project_group_weights, GroupLabeled, ImageTransform, Split, SpuriousDataset,
    SpuriousLabelType, SyntheticGroups, UrbanCars,
};
use models::{
    load_pretrained, load_record, save_record, Architecture, ClassifierInit, ImageClassifier, Mlp,
    ResNet18, ResNet50, SmallCnn,
};
use std::path::{Path, PathBuf};

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetKind {
    /// `<root-dir>/{train,val,test}/metadata.csv` folder layout.
    Urbancars,
    /// Generated in memory; `--root-dir` and `--image-size` are ignored.
    Synthetic,
}

impl DatasetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetKind::Urbancars => "urbancars",
            DatasetKind::Synthetic => "synthetic",
        }
    }
}

/// Options shared by every experiment binary.
#[derive(Debug, Clone, Args)]
pub struct CommonArgs {
    /// Accelerator index (WGPU backend only).
    #[arg(long, default_value_t = 0)]
    pub gpu: usize,
    /// Backend to use; wgpu needs the backend-wgpu feature and a usable
    /// adapter, otherwise the run falls back to ndarray.
    #[arg(long, value_enum, default_value_t = BackendKind::NdArray)]
    pub backend: BackendKind,
    #[arg(long, default_value_t = 0)]
    pub seed: u64,
    /// Dataset root containing train/, val/ and test/.
    #[arg(long, default_value = "data/urbancars")]
    pub root_dir: PathBuf,
    #[arg(long, value_enum, default_value_t = DatasetKind::Urbancars)]
    pub dataset: DatasetKind,
    /// Spurious attributes that define validation groups (both, bg, co_occur).
    #[arg(long, default_value_t = SpuriousLabelType::Both)]
    pub spurious_label_type: SpuriousLabelType,
    /// Probability of flipping each spurious attribute of the validation split.
    #[arg(long, default_value_t = 0.0)]
    pub label_noise: f32,
    /// Model architecture (mlp, cnn, resnet18, resnet50).
    #[arg(long, default_value_t = Architecture::Resnet50)]
    pub arch: Architecture,
    /// Center-crop size; images are first resized to 256/224 of it.
    #[arg(long, default_value_t = 224)]
    pub image_size: u32,
    #[arg(long, default_value_t = 128)]
    pub batch_size: usize,
    /// Initialize the backbone from <weights-dir>/<arch>.bin.
    #[arg(long, default_value_t = false)]
    pub pretrained: bool,
    #[arg(long, default_value = "weights")]
    pub weights_dir: PathBuf,
}

impl CommonArgs {
    fn append_to(&self, record: &mut ResultRecord) {
        record.push("gpu", self.gpu);
        record.push("backend", self.backend.as_str());
        record.push("seed", self.seed);
        record.push("root_dir", self.root_dir.display());
        record.push("dataset", self.dataset.as_str());
        record.push("spurious_label_type", self.spurious_label_type);
        record.push("label_noise", self.label_noise);
        record.push("arch", self.arch);
        record.push("image_size", self.image_size);
        record.push("batch_size", self.batch_size);
        record.push("pretrained", self.pretrained);
        record.push("weights_dir", self.weights_dir.display());
    }
}

/// Stage-1 optimization options.
#[derive(Debug, Clone, Args)]
pub struct ErmArgs {
    #[arg(long, default_value_t = 300)]
    pub num_epochs: usize,
    #[arg(long, default_value_t = 1e-3)]
    pub erm_lr: f64,
    #[arg(long, default_value_t = 1e-4)]
    pub erm_weight_decay: f64,
    #[arg(long, default_value_t = 0.9)]
    pub momentum: f64,
}

impl ErmArgs {
    pub fn sgd(&self) -> SgdSettings {
        SgdSettings {
            lr: self.erm_lr,
            weight_decay: self.erm_weight_decay,
            momentum: self.momentum,
        }
    }

    pub fn trainer_config(&self, common: &CommonArgs) -> TrainerConfig {
        TrainerConfig {
            batch_size: common.batch_size,
            num_epochs: self.num_epochs,
            shuffle_seed: common.seed,
            verbose: true,
        }
    }

    fn append_to(&self, record: &mut ResultRecord) {
        record.push("num_epochs", self.num_epochs);
        record.push("erm_lr", self.erm_lr);
        record.push("erm_weight_decay", self.erm_weight_decay);
        record.push("momentum", self.momentum);
    }
}

fn join_floats(values: &[f64]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[derive(Parser, Debug)]
#[command(
    name = "lrmix",
    about = "ERM followed by DISPEL last-layer retraining on the group-labeled validation split"
)]
pub struct LrmixArgs {
    #[command(flatten)]
    pub common: CommonArgs,
    #[command(flatten)]
    pub erm: ErmArgs,
    #[command(flatten)]
    pub output: OutputArgs,
    #[command(flatten)]
    pub tracking: TrackingArgs,
    /// Load the stage-1 model from this checkpoint instead of training it.
    #[arg(long)]
    pub erm_model_path: Option<PathBuf>,
    /// Save the trained stage-1 model (to --erm-model-path or checkpoints/erm_<arch>_seed<seed>.bin).
    #[arg(long, default_value_t = false)]
    pub save_erm_model: bool,
    /// Weights of an example's own embedding searched by DISPEL.
    #[arg(long, value_delimiter = ',', default_values_t = default_s_range())]
    pub s_range: Vec<f64>,
    /// Mixing probabilities searched by DISPEL.
    #[arg(long, value_delimiter = ',', default_values_t = default_alpha_range())]
    pub alpha_range: Vec<f64>,
    /// Inverse regularization strength of the logistic-regression probe.
    #[arg(long, default_value_t = 1.0)]
    pub probe_c: f64,
    /// Group-stratified cross-validation folds used to score each grid point.
    #[arg(long, default_value_t = 2)]
    pub cv_folds: usize,
}

impl LrmixArgs {
    pub fn config_record(&self) -> ResultRecord {
        let mut record = ResultRecord::new();
        self.common.append_to(&mut record);
        self.erm.append_to(&mut record);
        record.push("results_csv", self.output.results_csv.display());
        record.push("stdout_file", self.output.stdout_file.display());
        record.push("track", self.tracking.track);
        record.push(
            "erm_model_path",
            self.erm_model_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
        );
        record.push("save_erm_model", self.save_erm_model);
        record.push("s_range", join_floats(&self.s_range));
        record.push("alpha_range", join_floats(&self.alpha_range));
        record.push("probe_c", self.probe_c);
        record.push("cv_folds", self.cv_folds);
        record
    }

    pub fn dispel_config(&self) -> DispelConfig {
        DispelConfig {
            s_range: self.s_range.clone(),
            alpha_range: self.alpha_range.clone(),
            probe: ProbeConfig {
                c: self.probe_c,
                ..Default::default()
            },
            cv_folds: self.cv_folds,
            seed: self.common.seed,
            batch_size: self.common.batch_size,
            verbose: true,
        }
    }
}

/// Train, validation and test splits, initialized.
pub struct Splits {
    pub train: SpuriousDataset,
    pub val: SpuriousDataset,
    pub test: SpuriousDataset,
}

/// Train and test use both attributes; validation uses the requested
/// spurious-label type and optional attribute noise.
pub fn load_splits(common: &CommonArgs) -> TrainResult<Splits> {
    let label_type = common.spurious_label_type;
    let (train, val, test) = match common.dataset {
        DatasetKind::Urbancars => {
            let transform = ImageTransform::for_size(common.image_size);
            tracing::info!("preprocessing: {}", transform.describe());
            let open = |split, lt| UrbanCars::open(&common.root_dir, split, lt, transform.clone());
            (
                open(Split::Train, SpuriousLabelType::Both)?,
                open(Split::Val, label_type)?,
                open(Split::Test, SpuriousLabelType::Both)?,
            )
        }
        DatasetKind::Synthetic => {
            let generator = SyntheticGroups::default().with_seed(common.seed);
            let balanced = generator.clone().balanced();
            (
                generator.generate(Split::Train, SpuriousLabelType::Both)?,
                balanced.generate(Split::Val, label_type)?,
                balanced.generate(Split::Test, SpuriousLabelType::Both)?,
            )
        }
    };
    tracing::info!("using {label_type} spurious labels for validation");
    let mut val = val.with_spurious_noise(common.label_noise, common.seed)?;

    let mut train = train;
    let mut test = test;
    for ds in [&mut train, &mut val, &mut test] {
        ds.initialize()?;
        tracing::info!(
            "{}/{}: {} examples, {} groups",
            ds.name(),
            ds.split(),
            ds.len(),
            ds.group_partition()?.len()
        );
    }
    Ok(Splits { train, val, test })
}

/// Validation and test evaluators. Both weight groups by their training
/// frequency, projected to the validation spurious-label granularity.
pub fn build_evaluators(splits: &Splits, batch_size: usize) -> TrainResult<(Evaluator, Evaluator)> {
    let train_weights = splits.train.group_weights()?;
    let val_weights = project_group_weights(train_weights, splits.val.label_type())?;
    let val = Evaluator::new(splits.val.group_partition()?.clone(), val_weights)
        .with_batch_size(batch_size);
    let test = Evaluator::new(splits.test.group_partition()?.clone(), train_weights.clone())
        .with_batch_size(batch_size);
    Ok((val, test))
}

fn init_model<B, M>(common: &CommonArgs, train: &SpuriousDataset, device: &B::Device) -> TrainResult<M>
where
    B: AutodiffBackend,
    M: ClassifierInit<B> + AutodiffModule<B>,
{
    let model = M::init(train.image_shape(), train.num_classes(), device);
    if common.pretrained {
        return Ok(load_pretrained(
            model,
            common.arch,
            &common.weights_dir,
            train.num_classes(),
            device,
        )?);
    }
    Ok(model)
}

fn install_logging(args: &LrmixArgs) -> anyhow::Result<()> {
    if args.tracking.track {
        return init_logging(None);
    }
    let path = &args.output.stdout_file;
    let stdin = std::io::stdin();
    let proceed = confirm_overwrite(path, args.output.yes, &mut stdin.lock(), &mut std::io::stdout())?;
    if !proceed {
        return Err(TrainingError::Aborted(format!("{} already exists", path.display())).into());
    }
    init_logging(Some(path))
}

fn resolve_logged(common: &CommonArgs) -> RunDevice {
    let device = resolve_device(common.backend, common.gpu);
    tracing::info!("backend: {}", device.kind().as_str());
    device
}

/// Run the full experiment and persist one result row.
pub fn run_lrmix(args: LrmixArgs) -> anyhow::Result<()> {
    install_logging(&args)?;
    let config = args.config_record();
    tracing::info!("configuration: {}", config.to_json());
    let device = resolve_logged(&args.common);

    let mut tracker = if args.tracking.track {
        let mut tracker = JsonlTracker::create(&args.tracking.run_path())?;
        let mut payload = config.to_json();
        if let Some(entity) = &args.tracking.tracking_entity {
            payload["entity"] = serde_json::Value::String(entity.clone());
        }
        tracker.log_config(payload)?;
        Some(tracker)
    } else {
        None
    };

    let splits = load_splits(&args.common)?;
    let mut record = match &device {
        RunDevice::Host(d) => {
            lrmix_on::<Autodiff<HostBackend>>(&args, &splits, d, tracker.as_mut())?
        }
        #[cfg(feature = "backend-wgpu")]
        RunDevice::Wgpu(d) => {
            lrmix_on::<Autodiff<AccelBackend>>(&args, &splits, d, tracker.as_mut())?
        }
    };

    let summary = format!(
        "val wga {} | val avg acc {} | test wga {} | test avg acc {}",
        record.get("val_wg_acc").unwrap_or("-"),
        record.get("val_avg_acc").unwrap_or("-"),
        record.get("test_wg_acc").unwrap_or("-"),
        record.get("test_avg_acc").unwrap_or("-"),
    );
    match tracker.as_mut() {
        Some(tracker) => {
            tracker.log_result(&record)?;
            println!("{summary}; run logged to {}", tracker.path().display());
        }
        None => {
            record.push("alg", "lrmix");
            record.push(
                "timestamp",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.6f"),
            );
            for column in config.columns() {
                record.push(column, config.get(column).unwrap_or_default());
            }
            append_csv(&args.output.results_csv, &record)?;
            tracing::info!("results saved to {}", args.output.results_csv.display());
            println!("{summary}; results saved to {}", args.output.results_csv.display());
        }
    }
    Ok(())
}

fn lrmix_on<B: AutodiffBackend>(
    args: &LrmixArgs,
    splits: &Splits,
    device: &B::Device,
    tracker: Option<&mut JsonlTracker>,
) -> TrainResult<ResultRecord> {
    seed_backend::<B>(args.common.seed, device);
    match args.common.arch {
        Architecture::Mlp => lrmix_pipeline::<B, Mlp<B>>(args, splits, device, tracker),
        Architecture::Cnn => lrmix_pipeline::<B, SmallCnn<B>>(args, splits, device, tracker),
        Architecture::Resnet18 => lrmix_pipeline::<B, ResNet18<B>>(args, splits, device, tracker),
        Architecture::Resnet50 => lrmix_pipeline::<B, ResNet50<B>>(args, splits, device, tracker),
    }
}

fn lrmix_pipeline<B, M>(
    args: &LrmixArgs,
    splits: &Splits,
    device: &B::Device,
    mut tracker: Option<&mut JsonlTracker>,
) -> TrainResult<ResultRecord>
where
    B: AutodiffBackend,
    M: ImageClassifier<B> + ClassifierInit<B> + AutodiffModule<B>,
    M::InnerModule: ImageClassifier<B::InnerBackend>,
{
    let (val_eval, test_eval) = build_evaluators(splits, args.common.batch_size)?;
    let model = init_model::<B, M>(&args.common, &splits.train, device)?;

    let model = match &args.erm_model_path {
        Some(path) if path.is_file() || !args.save_erm_model => {
            tracing::info!("loading ERM model from {}", path.display());
            load_record::<B, M>(model, path, device)?
        }
        _ => {
            let erm = Erm::new(args.erm.trainer_config(&args.common), args.erm.sgd())
                .with_val_evaluator(val_eval.clone());
            let observer = tracker
                .as_deref_mut()
                .map(|t| t as &mut dyn EpochObserver);
            let (model, _) =
                erm.fit::<B, M>(model, &splits.train, Some(&splits.val), device, observer)?;
            if args.save_erm_model {
                let path = args
                    .erm_model_path
                    .clone()
                    .unwrap_or_else(|| default_checkpoint_path(args.common.arch, args.common.seed));
                save_record::<B, M>(model.clone(), &path)?;
                tracing::info!("saved ERM model to {}", path.display());
            }
            model
        }
    };

    let inference = model.valid();
    let erm_val = val_eval.evaluate::<B::InnerBackend, _>(&inference, &splits.val, None, device)?;
    let erm_test = test_eval.evaluate::<B::InnerBackend, _>(&inference, &splits.test, None, device)?;
    tracing::info!(
        "ERM: val wga {:.4}, test wga {:.4}, test avg acc {:.4}",
        erm_val.worst_group_acc,
        erm_test.worst_group_acc,
        erm_test.avg_acc
    );

    let group_labeled = GroupLabeled::from_dataset(&splits.val)?;
    let outcome = Dispel::new(args.dispel_config()).fit::<B, _>(
        &inference,
        &group_labeled,
        Some(&splits.train),
        device,
    )?;

    let val_report = val_eval.clone().with_verbose(true).evaluate::<B::InnerBackend, _>(
        &inference,
        &splits.val,
        Some(&outcome.probe),
        device,
    )?;
    let test_report = test_eval.clone().with_verbose(true).evaluate::<B::InnerBackend, _>(
        &inference,
        &splits.test,
        Some(&outcome.probe),
        device,
    )?;

    if let Some(tracker) = tracker.as_deref_mut() {
        tracker.log_summary("erm_val", erm_val.to_json())?;
        tracker.log_summary("erm_test", erm_test.to_json())?;
        tracker.log_summary("val", val_report.to_json())?;
        tracker.log_summary("test", test_report.to_json())?;
    }
    Ok(result_record(&val_report, &test_report, &erm_val, &erm_test, &outcome))
}

fn result_record(
    val: &EvalReport,
    test: &EvalReport,
    erm_val: &EvalReport,
    erm_test: &EvalReport,
    outcome: &DispelOutcome,
) -> ResultRecord {
    let mut record = ResultRecord::new();
    record.push("val_wg_acc", format!("{:.6}", val.worst_group_acc));
    record.push("val_avg_acc", format!("{:.6}", val.avg_acc));
    record.push("test_wg_acc", format!("{:.6}", test.worst_group_acc));
    record.push("test_avg_acc", format!("{:.6}", test.avg_acc));
    record.push("selected_s", outcome.selected.s);
    record.push("selected_alpha", outcome.selected.alpha);
    record.push("cv_wg_acc", format!("{:.6}", outcome.cv_wga));
    erm_val.append_to(&mut record, "erm_val");
    erm_test.append_to(&mut record, "erm_test");
    test.append_to(&mut record, "test");
    record
}

#[derive(Parser, Debug)]
#[command(name = "erm", about = "Train a classifier with ERM and save a checkpoint")]
pub struct ErmRunArgs {
    #[command(flatten)]
    pub common: CommonArgs,
    #[command(flatten)]
    pub erm: ErmArgs,
    /// Checkpoint output path (defaults to checkpoints/erm_<arch>_seed<seed>.bin).
    #[arg(long)]
    pub checkpoint_out: Option<PathBuf>,
    /// Write logs to this file instead of stdout.
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

pub fn run_erm(args: ErmRunArgs) -> anyhow::Result<()> {
    init_logging(args.log_file.as_deref())?;
    let device = resolve_logged(&args.common);
    let splits = load_splits(&args.common)?;
    let ckpt_path = args
        .checkpoint_out
        .clone()
        .unwrap_or_else(|| default_checkpoint_path(args.common.arch, args.common.seed));

    let (val, test) = match &device {
        RunDevice::Host(d) => erm_on::<Autodiff<HostBackend>>(&args, &splits, d, &ckpt_path)?,
        #[cfg(feature = "backend-wgpu")]
        RunDevice::Wgpu(d) => erm_on::<Autodiff<AccelBackend>>(&args, &splits, d, &ckpt_path)?,
    };
    println!(
        "Saved checkpoint to {} (val wga {:.4}, test wga {:.4}, test avg acc {:.4})",
        ckpt_path.display(),
        val.worst_group_acc,
        test.worst_group_acc,
        test.avg_acc
    );
    Ok(())
}

fn erm_on<B: AutodiffBackend>(
    args: &ErmRunArgs,
    splits: &Splits,
    device: &B::Device,
    ckpt_path: &Path,
) -> TrainResult<(EvalReport, EvalReport)> {
    seed_backend::<B>(args.common.seed, device);
    match args.common.arch {
        Architecture::Mlp => erm_pipeline::<B, Mlp<B>>(args, splits, device, ckpt_path),
        Architecture::Cnn => erm_pipeline::<B, SmallCnn<B>>(args, splits, device, ckpt_path),
        Architecture::Resnet18 => erm_pipeline::<B, ResNet18<B>>(args, splits, device, ckpt_path),
        Architecture::Resnet50 => erm_pipeline::<B, ResNet50<B>>(args, splits, device, ckpt_path),
    }
}

fn erm_pipeline<B, M>(
    args: &ErmRunArgs,
    splits: &Splits,
    device: &B::Device,
    ckpt_path: &Path,
) -> TrainResult<(EvalReport, EvalReport)>
where
    B: AutodiffBackend,
    M: ImageClassifier<B> + ClassifierInit<B> + AutodiffModule<B>,
    M::InnerModule: ImageClassifier<B::InnerBackend>,
{
    let (val_eval, test_eval) = build_evaluators(splits, args.common.batch_size)?;
    let model = init_model::<B, M>(&args.common, &splits.train, device)?;
    let erm = Erm::new(args.erm.trainer_config(&args.common), args.erm.sgd())
        .with_val_evaluator(val_eval.clone());
    let (model, _) = erm.fit::<B, M>(model, &splits.train, Some(&splits.val), device, None)?;
    save_record::<B, M>(model.clone(), ckpt_path)?;

    let inference = model.valid();
    let val = val_eval
        .with_verbose(true)
        .evaluate::<B::InnerBackend, _>(&inference, &splits.val, None, device)?;
    let test = test_eval
        .with_verbose(true)
        .evaluate::<B::InnerBackend, _>(&inference, &splits.test, None, device)?;
    Ok((val, test))
}

#[derive(Parser, Debug)]
#[command(
    name = "eval",
    about = "Evaluate a checkpoint's own head: per-group, worst-group and weighted average accuracy"
)]
pub struct EvalArgs {
    #[command(flatten)]
    pub common: CommonArgs,
    /// Checkpoint saved by `erm` or `lrmix --save-erm-model`.
    #[arg(long)]
    pub checkpoint: PathBuf,
}

pub fn run_eval(args: EvalArgs) -> anyhow::Result<()> {
    init_logging(None)?;
    let device = resolve_logged(&args.common);
    let splits = load_splits(&args.common)?;
    let (val, test) = match &device {
        RunDevice::Host(d) => eval_on::<HostBackend>(&args, &splits, d)?,
        #[cfg(feature = "backend-wgpu")]
        RunDevice::Wgpu(d) => eval_on::<AccelBackend>(&args, &splits, d)?,
    };
    println!(
        "Eval complete: val wga={:.4}, val avg acc={:.4}, test wga={:.4} ({}), test avg acc={:.4}",
        val.worst_group_acc, val.avg_acc, test.worst_group_acc, test.worst_group, test.avg_acc
    );
    Ok(())
}

fn eval_on<B: Backend>(
    args: &EvalArgs,
    splits: &Splits,
    device: &B::Device,
) -> TrainResult<(EvalReport, EvalReport)> {
    match args.common.arch {
        Architecture::Mlp => eval_pipeline::<B, Mlp<B>>(args, splits, device),
        Architecture::Cnn => eval_pipeline::<B, SmallCnn<B>>(args, splits, device),
        Architecture::Resnet18 => eval_pipeline::<B, ResNet18<B>>(args, splits, device),
        Architecture::Resnet50 => eval_pipeline::<B, ResNet50<B>>(args, splits, device),
    }
}

fn eval_pipeline<B, M>(
    args: &EvalArgs,
    splits: &Splits,
    device: &B::Device,
) -> TrainResult<(EvalReport, EvalReport)>
where
    B: Backend,
    M: ImageClassifier<B> + ClassifierInit<B>,
{
    let (val_eval, test_eval) = build_evaluators(splits, args.common.batch_size)?;
    let model = M::init(splits.train.image_shape(), splits.train.num_classes(), device);
    let model = load_record::<B, M>(model, &args.checkpoint, device)?;
    let val = val_eval
        .with_verbose(true)
        .evaluate::<B, _>(&model, &splits.val, None, device)?;
    let test = test_eval
        .with_verbose(true)
        .evaluate::<B, _>(&model, &splits.test, None, device)?;
    Ok((val, test))
}
