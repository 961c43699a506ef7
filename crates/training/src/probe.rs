//! Multinomial logistic-regression probe fitted on frozen embeddings.
//!
//! The probe is trained full-batch with Adam from a zero initialization on
//!
//! ```text
//! mean_i(w_i · CE(x_i W + b, y_i)) + ||W||² / (2·c·n)
//! ```
//!
//! so identical inputs always yield identical weights. Prediction runs on the
//! host.

use crate::evaluate::argmax_rows;
use crate::features::FeatureMatrix;
use crate::scaler::StandardScaler;
use burn::module::Module;
use burn::nn::{Initializer, Linear, LinearConfig};
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::tensor::activation::log_softmax;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{Tensor, TensorData};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProbeError {
    #[error("{0}")]
    Empty(String),
    #[error("training targets contain a single class ({0})")]
    SingleClass(usize),
    #[error("label {label} out of range for {num_classes} classes")]
    InvalidLabel { label: usize, num_classes: usize },
    #[error("feature dimension mismatch: expected {expected}, got {got}")]
    Shape { expected: usize, got: usize },
    #[error("non-finite loss {loss} at iteration {iter}")]
    NonFinite { iter: usize, loss: f32 },
    #[error("tensor conversion failed: {0}")]
    Tensor(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Inverse regularization strength.
    pub c: f64,
    pub max_iter: usize,
    /// Stop once the loss changes by less than this between iterations.
    pub tol: f64,
    pub lr: f64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            c: 1.0,
            max_iter: 200,
            tol: 1e-6,
            lr: 0.05,
        }
    }
}

#[derive(Module, Debug)]
pub struct LogisticHead<B: Backend> {
    linear: Linear<B>,
}

fn host<B: Backend, const D: usize>(t: Tensor<B, D>) -> Result<Vec<f32>, ProbeError> {
    t.into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| ProbeError::Tensor(format!("{e:?}")))
}

/// Logistic-regression weights `[dim, num_classes]` plus bias, kept on the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticRegression {
    weight: Vec<f32>,
    bias: Vec<f32>,
    dim: usize,
    num_classes: usize,
}

impl LogisticRegression {
    /// Fit on `x` with per-example `sample_weight` (rescaled to mean 1).
    pub fn fit<B: AutodiffBackend>(
        x: &FeatureMatrix,
        y: &[usize],
        sample_weight: &[f32],
        num_classes: usize,
        cfg: &ProbeConfig,
        device: &B::Device,
    ) -> Result<Self, ProbeError> {
        let (n, d) = (x.rows(), x.dim());
        if n == 0 {
            return Err(ProbeError::Empty("probe fit on zero rows".to_string()));
        }
        if y.len() != n || sample_weight.len() != n {
            return Err(ProbeError::Shape {
                expected: n,
                got: y.len().min(sample_weight.len()),
            });
        }
        if let Some(&label) = y.iter().find(|&&l| l >= num_classes) {
            return Err(ProbeError::InvalidLabel { label, num_classes });
        }
        let classes: BTreeSet<usize> = y.iter().copied().collect();
        if classes.len() < 2 {
            return Err(ProbeError::SingleClass(y[0]));
        }

        let total: f32 = sample_weight.iter().sum();
        if total.is_nan() || total <= 0.0 {
            return Err(ProbeError::Empty("sample weights sum to zero".to_string()));
        }
        let weights: Vec<f32> = sample_weight.iter().map(|w| w * n as f32 / total).collect();
        let mut one_hot = vec![0.0f32; n * num_classes];
        for (i, &label) in y.iter().enumerate() {
            one_hot[i * num_classes + label] = 1.0;
        }

        let inputs = Tensor::<B, 2>::from_data(TensorData::new(x.as_slice().to_vec(), [n, d]), device);
        let targets = Tensor::<B, 2>::from_data(TensorData::new(one_hot, [n, num_classes]), device);
        let weights = Tensor::<B, 2>::from_data(TensorData::new(weights, [n, 1]), device);
        let penalty = (1.0 / (2.0 * cfg.c * n as f64)) as f32;

        let mut head = LogisticHead {
            linear: LinearConfig::new(d, num_classes)
                .with_initializer(Initializer::Zeros)
                .init(device),
        };
        let mut optim = AdamConfig::new().init::<B, LogisticHead<B>>();
        let mut prev = f32::INFINITY;
        for iter in 0..cfg.max_iter {
            let log_probs = log_softmax(head.linear.forward(inputs.clone()), 1);
            let nll = (log_probs * targets.clone()).sum_dim(1).neg();
            let w = head.linear.weight.val();
            let loss = (nll * weights.clone()).mean() + (w.clone() * w).sum().mul_scalar(penalty);

            let value = host(loss.clone().detach())?.first().copied().unwrap_or(f32::NAN);
            if !value.is_finite() {
                return Err(ProbeError::NonFinite { iter, loss: value });
            }
            let grads = GradientsParams::from_grads(loss.backward(), &head);
            head = optim.step(cfg.lr, head, grads);
            if ((prev - value) as f64).abs() < cfg.tol {
                break;
            }
            prev = value;
        }

        let weight = host(head.linear.weight.val())?;
        let bias = match &head.linear.bias {
            Some(b) => host(b.val())?,
            None => vec![0.0; num_classes],
        };
        Ok(Self {
            weight,
            bias,
            dim: d,
            num_classes,
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn weight(&self) -> &[f32] {
        &self.weight
    }

    pub fn bias(&self) -> &[f32] {
        &self.bias
    }

    /// Row-major `[rows, num_classes]` logits.
    pub fn logits(&self, x: &FeatureMatrix) -> Result<Vec<f32>, ProbeError> {
        if x.dim() != self.dim {
            return Err(ProbeError::Shape {
                expected: self.dim,
                got: x.dim(),
            });
        }
        let k = self.num_classes;
        let mut out = Vec::with_capacity(x.rows() * k);
        for i in 0..x.rows() {
            let mut row = self.bias.clone();
            for (j, v) in x.row(i).iter().enumerate() {
                let w = &self.weight[j * k..(j + 1) * k];
                for (acc, wc) in row.iter_mut().zip(w) {
                    *acc += v * wc;
                }
            }
            out.extend(row);
        }
        Ok(out)
    }

    pub fn predict(&self, x: &FeatureMatrix) -> Result<Vec<usize>, ProbeError> {
        Ok(argmax_rows(&self.logits(x)?, self.num_classes))
    }
}

/// Decision head replacing the model's own classifier: standardize the raw
/// embeddings, then apply the logistic regression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearProbe {
    scaler: StandardScaler,
    head: LogisticRegression,
}

impl LinearProbe {
    pub fn new(scaler: StandardScaler, head: LogisticRegression) -> Self {
        Self { scaler, head }
    }

    pub fn scaler(&self) -> &StandardScaler {
        &self.scaler
    }

    pub fn head(&self) -> &LogisticRegression {
        &self.head
    }

    /// Predict classes for raw (unscaled) embeddings.
    pub fn predict(&self, embeddings: &FeatureMatrix) -> Result<Vec<usize>, ProbeError> {
        self.head.predict(&self.scaler.transform(embeddings)?)
    }
}
