use crate::features::FeatureMatrix;
use crate::probe::ProbeError;
use serde::{Deserialize, Serialize};

/// Per-feature standardization `(x - mean) / std` (population std; constant
/// features keep a scale of 1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    mean: Vec<f32>,
    scale: Vec<f32>,
}

impl StandardScaler {
    pub fn fit(x: &FeatureMatrix) -> Result<Self, ProbeError> {
        if x.is_empty() {
            return Err(ProbeError::Empty("scaler fit on zero rows".to_string()));
        }
        let n = x.rows() as f64;
        let mut mean = vec![0.0f64; x.dim()];
        for i in 0..x.rows() {
            for (m, v) in mean.iter_mut().zip(x.row(i)) {
                *m += *v as f64;
            }
        }
        mean.iter_mut().for_each(|m| *m /= n);
        let mut var = vec![0.0f64; x.dim()];
        for i in 0..x.rows() {
            for ((acc, v), m) in var.iter_mut().zip(x.row(i)).zip(&mean) {
                let d = *v as f64 - m;
                *acc += d * d;
            }
        }
        let scale = var
            .iter()
            .map(|v| {
                let std = (v / n).sqrt();
                if std > 1e-12 {
                    std as f32
                } else {
                    1.0
                }
            })
            .collect();
        Ok(Self {
            mean: mean.into_iter().map(|m| m as f32).collect(),
            scale,
        })
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    pub fn transform(&self, x: &FeatureMatrix) -> Result<FeatureMatrix, ProbeError> {
        if x.dim() != self.dim() {
            return Err(ProbeError::Shape {
                expected: self.dim(),
                got: x.dim(),
            });
        }
        let mut out = x.clone();
        for i in 0..out.rows() {
            for ((v, m), s) in out.row_mut(i).iter_mut().zip(&self.mean).zip(&self.scale) {
                *v = (*v - m) / s;
            }
        }
        Ok(out)
    }
}
