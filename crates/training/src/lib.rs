#![recursion_limit = "256"]
//! Group-robust training on top of Burn: ERM, DISPEL last-layer retraining,
//! group-wise evaluation and result persistence.

pub mod dispel;
pub mod erm;
pub mod error;
pub mod evaluate;
pub mod experiment;
pub mod features;
pub mod probe;
pub mod results;
pub mod scaler;
pub mod tracking;
pub mod trainer;
pub mod util;

pub use dispel::{Dispel, DispelConfig, DispelOutcome, GridPoint, GridScore};
pub use erm::Erm;
pub use error::{TrainResult, TrainingError};
pub use evaluate::{EvalReport, Evaluator};
pub use features::{extract_embeddings, FeatureMatrix};
pub use probe::{LinearProbe, LogisticRegression, ProbeConfig, ProbeError};
pub use results::{append_csv, ResultRecord};
pub use scaler::StandardScaler;
pub use tracking::JsonlTracker;
pub use trainer::{
    ClassificationLoss, CrossEntropy, EpochMetrics, EpochObserver, SgdSettings, Trainer,
    TrainerConfig,
};
pub use util::{resolve_device, validate_backend_choice, BackendKind, RunDevice};

/// Host backend; always compiled in and used whenever no accelerator runs.
pub type HostBackend = burn_ndarray::NdArray<f32>;
/// Accelerator backend, available with the `backend-wgpu` feature.
#[cfg(feature = "backend-wgpu")]
pub type AccelBackend = burn_wgpu::Wgpu<f32>;
