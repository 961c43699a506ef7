//! Result rows and their CSV persistence.

use crate::error::{TrainResult, TrainingError};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

/// One result row: ordered `(column, value)` pairs. Pushing an existing
/// column replaces its value in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultRecord {
    columns: Vec<(String, String)>,
}

impl ResultRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, column: impl Into<String>, value: impl ToString) {
        let column = column.into();
        let value = value.to_string();
        match self.columns.iter_mut().find(|(c, _)| *c == column) {
            Some(slot) => slot.1 = value,
            None => self.columns.push((column, value)),
        }
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.columns
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, v)| v.as_str())
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(c, _)| c.as_str())
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .columns
            .iter()
            .map(|(c, v)| (c.clone(), serde_json::Value::String(v.clone())))
            .collect();
        serde_json::Value::Object(map)
    }
}

fn csv_err(path: &Path) -> impl Fn(csv::Error) -> TrainingError + '_ {
    move |source| TrainingError::Csv {
        path: path.to_path_buf(),
        source,
    }
}

/// Append `record` to the CSV at `path`, creating it (and its parent
/// directories) if needed. Columns missing from the existing header are
/// added at the end and earlier rows get empty cells for them; no existing
/// row is dropped.
pub fn append_csv(path: &Path, record: &ResultRecord) -> TrainResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| TrainingError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let existing = path.is_file()
        && fs::metadata(path)
            .map(|m| m.len() > 0)
            .unwrap_or(false);
    let (mut header, rows) = if existing {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(path)
            .map_err(csv_err(path))?;
        let header: Vec<String> = reader
            .headers()
            .map_err(csv_err(path))?
            .iter()
            .map(str::to_string)
            .collect();
        let rows = reader
            .records()
            .collect::<Result<Vec<csv::StringRecord>, _>>()
            .map_err(csv_err(path))?;
        (header, rows)
    } else {
        (Vec::new(), Vec::new())
    };

    let old_width = header.len();
    for column in record.columns() {
        if !header.iter().any(|h| h == column) {
            header.push(column.to_string());
        }
    }
    let new_row: Vec<&str> = header
        .iter()
        .map(|h| record.get(h).unwrap_or(""))
        .collect();

    if existing && header.len() == old_width {
        let file = OpenOptions::new()
            .append(true)
            .open(path)
            .map_err(|source| TrainingError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(&new_row).map_err(csv_err(path))?;
        writer.flush().map_err(|source| TrainingError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        return Ok(());
    }

    if existing {
        tracing::info!(
            "extending header of {} with {} new column(s)",
            path.display(),
            header.len() - old_width
        );
    }
    // Rewrite next to the target and rename over it so a failure midway
    // leaves the previous file intact.
    let tmp = temp_sibling(path);
    let written = write_rows(&tmp, &header, &rows, &new_row).and_then(|()| {
        fs::rename(&tmp, path).map_err(|source| TrainingError::Io {
            path: path.to_path_buf(),
            source,
        })
    });
    if written.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    written
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "results.csv".to_string());
    path.with_file_name(format!(".{name}.tmp"))
}

fn write_rows(
    path: &Path,
    header: &[String],
    rows: &[csv::StringRecord],
    new_row: &[&str],
) -> TrainResult<()> {
    let mut writer = csv::Writer::from_path(path).map_err(csv_err(path))?;
    writer.write_record(header).map_err(csv_err(path))?;
    for row in rows {
        let cells: Vec<&str> = (0..header.len()).map(|i| row.get(i).unwrap_or("")).collect();
        writer.write_record(&cells).map_err(csv_err(path))?;
    }
    writer.write_record(new_row).map_err(csv_err(path))?;
    writer.flush().map_err(|source| TrainingError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_replaces_existing_column() {
        let mut r = ResultRecord::new();
        r.push("a", 1);
        r.push("b", "x");
        r.push("a", 2);
        assert_eq!(r.len(), 2);
        assert_eq!(r.get("a"), Some("2"));
        assert_eq!(r.columns().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(r.to_json()["b"], "x");
    }

    #[test]
    fn rewrite_goes_through_a_hidden_sibling() {
        assert_eq!(
            temp_sibling(Path::new("out/results.csv")),
            PathBuf::from("out/.results.csv.tmp")
        );
    }
}
