//! Core types, error definitions, and group keys for group_data.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

pub type DataResult<T> = Result<T, GroupDataError>;

#[derive(Debug, Error)]
pub enum GroupDataError {
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
    #[error("image decode error at {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("dataset root {path} does not exist or is not a directory")]
    MissingRoot { path: PathBuf },
    #[error("expected file missing: {path}")]
    MissingFile { path: PathBuf },
    #[error("invalid row {line} in {path}: {msg}")]
    InvalidRow {
        path: PathBuf,
        line: usize,
        msg: String,
    },
    #[error("dataset {0} used before initialize()")]
    NotInitialized(String),
    #[error("{0}")]
    Empty(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("tensor conversion failed: {0}")]
    Tensor(String),
}

/// A class label together with one configuration of spurious attributes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupKey {
    pub label: usize,
    pub spurious: Vec<usize>,
}

impl GroupKey {
    pub fn new(label: usize, spurious: impl Into<Vec<usize>>) -> Self {
        Self {
            label,
            spurious: spurious.into(),
        }
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let attrs = self
            .spurious
            .iter()
            .map(|a| a.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        if self.spurious.len() == 1 {
            write!(f, "({}, {})", self.label, attrs)
        } else {
            write!(f, "({}, ({}))", self.label, attrs)
        }
    }
}

/// Which spurious attributes make up a group key.
///
/// `Both` orders the attribute tuple as `(background, co_occur)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpuriousLabelType {
    Both,
    Background,
    CoOccur,
}

impl SpuriousLabelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpuriousLabelType::Both => "both",
            SpuriousLabelType::Background => "bg",
            SpuriousLabelType::CoOccur => "co_occur",
        }
    }

    /// Positions of the kept attributes within the `Both` tuple.
    pub fn attribute_positions(&self) -> &'static [usize] {
        match self {
            SpuriousLabelType::Both => &[0, 1],
            SpuriousLabelType::Background => &[0],
            SpuriousLabelType::CoOccur => &[1],
        }
    }

    pub fn project(&self, background: usize, co_occur: usize) -> Vec<usize> {
        match self {
            SpuriousLabelType::Both => vec![background, co_occur],
            SpuriousLabelType::Background => vec![background],
            SpuriousLabelType::CoOccur => vec![co_occur],
        }
    }
}

impl fmt::Display for SpuriousLabelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SpuriousLabelType {
    type Err = GroupDataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "both" => Ok(SpuriousLabelType::Both),
            "bg" | "background" => Ok(SpuriousLabelType::Background),
            "co_occur" | "co-occur" | "cooccur" => Ok(SpuriousLabelType::CoOccur),
            other => Err(GroupDataError::Config(format!(
                "unknown spurious label type '{other}' (expected both, bg or co_occur)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Split {
    Train,
    Val,
    Test,
}

impl Split {
    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Val => "val",
            Split::Test => "test",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Split {
    type Err = GroupDataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "train" => Ok(Split::Train),
            "val" | "valid" | "validation" => Ok(Split::Val),
            "test" => Ok(Split::Test),
            other => Err(GroupDataError::Config(format!("unknown split '{other}'"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Example {
    /// Image in CHW layout after the dataset transform.
    pub image_chw: Vec<f32>,
    pub label: usize,
    pub spurious: Vec<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_keys_order_by_label_then_attributes() {
        let mut keys = vec![
            GroupKey::new(1, vec![0, 0]),
            GroupKey::new(0, vec![1, 0]),
            GroupKey::new(0, vec![0, 1]),
        ];
        keys.sort();
        assert_eq!(keys[0], GroupKey::new(0, vec![0, 1]));
        assert_eq!(keys[2], GroupKey::new(1, vec![0, 0]));
    }

    #[test]
    fn group_key_display_matches_tuple_form() {
        assert_eq!(GroupKey::new(1, vec![0, 1]).to_string(), "(1, (0, 1))");
        assert_eq!(GroupKey::new(0, vec![1]).to_string(), "(0, 1)");
    }

    #[test]
    fn label_type_parses_aliases() {
        assert_eq!(
            "bg".parse::<SpuriousLabelType>().unwrap(),
            SpuriousLabelType::Background
        );
        assert_eq!(
            "co-occur".parse::<SpuriousLabelType>().unwrap(),
            SpuriousLabelType::CoOccur
        );
        assert!("colour".parse::<SpuriousLabelType>().is_err());
    }
}
