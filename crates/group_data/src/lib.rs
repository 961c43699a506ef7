//! Group-annotated image datasets for spurious-correlation experiments.
//!
//! This crate provides:
//! - Group keys (class label + spurious attribute tuple), partitions and weights
//! - An UrbanCars-style folder loader and a synthetic grouped dataset
//! - Image preprocessing (resize, center crop, normalization)
//! - Burn-compatible batch iteration

pub mod batch;
pub mod dataset;
pub mod grouped;
pub mod partition;
pub mod synthetic;
pub mod transform;
pub mod types;
pub mod urbancars;

pub use batch::{BatchIter, GroupBatch};
pub use dataset::{ImageSource, SpuriousDataset};
pub use grouped::GroupLabeled;
pub use partition::{build_partition, project_group_weights, GroupPartition, GroupWeights};
pub use synthetic::SyntheticGroups;
pub use transform::{ImageTransform, ImageTransformBuilder};
pub use types::*;
pub use urbancars::UrbanCars;
