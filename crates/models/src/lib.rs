//! Burn image classifiers for group-robustness experiments.
//!
//! Every model is split into a feature extractor (`embed`) and a linear
//! classification head (`classify`) so that the head can be replaced by a
//! retrained probe:
//! - `Mlp`: flatten + two hidden layers.
//! - `SmallCnn`: two conv/pool stages with global average pooling.
//! - `ResNet18`: basic-block ResNet-18 using group normalization.
//! - `ResNet50`: bottleneck ResNet-50 using group normalization.

use burn::module::Module;
use burn::record::{BinFileRecorder, FullPrecisionSettings};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

pub mod cnn;
pub mod mlp;
pub mod resnet;

pub use cnn::{SmallCnn, SmallCnnConfig};
pub use mlp::{Mlp, MlpConfig};
pub use resnet::{ResNet18, ResNet18Config, ResNet50, ResNet50Config};

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("failed to access weights at {path}: {msg}")]
    Record { path: PathBuf, msg: String },
    #[error("pretrained weights not found at {path}")]
    MissingWeights { path: PathBuf },
    #[error("unknown architecture '{0}' (expected mlp, cnn, resnet18 or resnet50)")]
    UnknownArchitecture(String),
}

/// Image classifier with a separable feature extractor and linear head.
pub trait ImageClassifier<B: Backend>: Module<B> {
    /// Images `[n, c, h, w]` to embeddings `[n, d]`.
    fn embed(&self, images: Tensor<B, 4>) -> Tensor<B, 2>;
    /// Embeddings `[n, d]` to class logits `[n, k]`.
    fn classify(&self, embeddings: Tensor<B, 2>) -> Tensor<B, 2>;
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.classify(self.embed(images))
    }
    fn embedding_dim(&self) -> usize;
    fn num_classes(&self) -> usize;
}

/// Construction from an input shape, shared by all architectures.
pub trait ClassifierInit<B: Backend>: Sized {
    fn init(input_shape: [usize; 3], num_classes: usize, device: &B::Device) -> Self;
    /// Replace the classification head with a freshly initialized one.
    fn with_fresh_head(self, num_classes: usize, device: &B::Device) -> Self;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Architecture {
    Mlp,
    Cnn,
    Resnet18,
    Resnet50,
}

impl Architecture {
    pub fn as_str(&self) -> &'static str {
        match self {
            Architecture::Mlp => "mlp",
            Architecture::Cnn => "cnn",
            Architecture::Resnet18 => "resnet18",
            Architecture::Resnet50 => "resnet50",
        }
    }

    /// Path of the pretrained record for this architecture inside `weights_dir`.
    pub fn weights_path(&self, weights_dir: &Path) -> PathBuf {
        weights_dir.join(format!("{}.bin", self.as_str()))
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Architecture {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mlp" => Ok(Architecture::Mlp),
            "cnn" => Ok(Architecture::Cnn),
            "resnet18" => Ok(Architecture::Resnet18),
            "resnet50" => Ok(Architecture::Resnet50),
            other => Err(ModelError::UnknownArchitecture(other.to_string())),
        }
    }
}

/// Save a model record (full precision, binary).
pub fn save_record<B: Backend, M: Module<B>>(model: M, path: &Path) -> Result<(), ModelError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ModelError::Record {
            path: path.to_path_buf(),
            msg: e.to_string(),
        })?;
    }
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    model
        .save_file(path, &recorder)
        .map_err(|e| ModelError::Record {
            path: path.to_path_buf(),
            msg: e.to_string(),
        })
}

/// Load a record saved by [`save_record`] into `model`.
pub fn load_record<B: Backend, M: Module<B>>(
    model: M,
    path: &Path,
    device: &B::Device,
) -> Result<M, ModelError> {
    if !path.is_file() {
        return Err(ModelError::MissingWeights {
            path: path.to_path_buf(),
        });
    }
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    model
        .load_file(path, &recorder, device)
        .map_err(|e| ModelError::Record {
            path: path.to_path_buf(),
            msg: e.to_string(),
        })
}

/// Load `<weights_dir>/<arch>.bin` and re-initialize the head for `num_classes`.
pub fn load_pretrained<B: Backend, M: ClassifierInit<B> + Module<B>>(
    model: M,
    arch: Architecture,
    weights_dir: &Path,
    num_classes: usize,
    device: &B::Device,
) -> Result<M, ModelError> {
    let path = arch.weights_path(weights_dir);
    let model = load_record(model, &path, device)?;
    tracing::info!("loaded pretrained {arch} backbone from {}", path.display());
    Ok(model.with_fresh_head(num_classes, device))
}
