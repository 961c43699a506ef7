use crate::probe::ProbeError;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use group_data::GroupDataError;
use models::ModelError;
use std::path::PathBuf;
use thiserror::Error;

pub type TrainResult<T> = Result<T, TrainingError>;

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error(transparent)]
    Data(#[from] GroupDataError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("training diverged at epoch {epoch}: loss {loss}")]
    Diverged { epoch: usize, loss: f32 },
    #[error("tensor conversion failed: {0}")]
    Tensor(String),
    #[error("linear probe: {0}")]
    Probe(#[from] ProbeError),
    #[error("no viable (s, alpha) configuration among {tried} grid points")]
    NoViableConfiguration { tried: usize },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("csv error at {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("json encoding failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("aborted: {0}")]
    Aborted(String),
}

/// Copy a tensor to a host `f32` buffer.
pub(crate) fn to_host<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> TrainResult<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| TrainingError::Tensor(format!("{e:?}")))
}
