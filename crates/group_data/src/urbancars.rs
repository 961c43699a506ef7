//! UrbanCars-style folder layout: `<root>/<split>/metadata.csv` plus images.
//!
//! The metadata header is `image,label,background,co_occur`; image paths are
//! relative to the split directory. Labels and attributes are binary
//! (0 = urban, 1 = country).

use crate::dataset::{ImageSource, SpuriousDataset};
use crate::transform::ImageTransform;
use crate::types::{DataResult, GroupDataError, Split, SpuriousLabelType};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const METADATA_FILE: &str = "metadata.csv";
pub const NUM_CLASSES: usize = 2;

#[derive(Debug, Deserialize)]
struct MetadataRow {
    image: String,
    label: usize,
    background: usize,
    co_occur: usize,
}

pub struct UrbanCars;

impl UrbanCars {
    pub fn open(
        root: &Path,
        split: Split,
        label_type: SpuriousLabelType,
        transform: ImageTransform,
    ) -> DataResult<SpuriousDataset> {
        if !root.is_dir() {
            return Err(GroupDataError::MissingRoot {
                path: root.to_path_buf(),
            });
        }
        let split_dir = root.join(split.as_str());
        if !split_dir.is_dir() {
            return Err(GroupDataError::MissingFile { path: split_dir });
        }
        let metadata_path = split_dir.join(METADATA_FILE);
        if !metadata_path.is_file() {
            return Err(GroupDataError::MissingFile {
                path: metadata_path,
            });
        }

        let rows = read_metadata(&metadata_path)?;
        let mut paths = Vec::with_capacity(rows.len());
        let mut labels = Vec::with_capacity(rows.len());
        let mut spurious = Vec::with_capacity(rows.len());
        for (line, row) in rows {
            for (field, value) in [
                ("label", row.label),
                ("background", row.background),
                ("co_occur", row.co_occur),
            ] {
                if value > 1 {
                    return Err(GroupDataError::InvalidRow {
                        path: metadata_path.clone(),
                        line,
                        msg: format!("{field} must be 0 or 1, got {value}"),
                    });
                }
            }
            let image_path = split_dir.join(row.image.trim());
            if !image_path.is_file() {
                return Err(GroupDataError::MissingFile { path: image_path });
            }
            paths.push(image_path);
            labels.push(row.label);
            spurious.push(label_type.project(row.background, row.co_occur));
        }

        tracing::info!(
            "loaded {} {} examples from {} ({})",
            labels.len(),
            split,
            root.display(),
            transform.describe()
        );
        Ok(SpuriousDataset::new(
            "urbancars",
            split,
            label_type,
            labels,
            spurious,
            ImageSource::Files { paths, transform },
        )?
        .with_num_classes(NUM_CLASSES))
    }
}

fn read_metadata(path: &PathBuf) -> DataResult<Vec<(usize, MetadataRow)>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|source| GroupDataError::Csv {
            path: path.clone(),
            source,
        })?;
    let mut rows = Vec::new();
    for (i, record) in reader.deserialize::<MetadataRow>().enumerate() {
        // Header is line 1.
        let line = i + 2;
        let row = record.map_err(|e| GroupDataError::InvalidRow {
            path: path.clone(),
            line,
            msg: e.to_string(),
        })?;
        rows.push((line, row));
    }
    Ok(rows)
}
