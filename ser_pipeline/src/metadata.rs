//! Reading of the competition metadata tables.

use std::path::{Path, PathBuf};

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("Could not read metadata table {path:?}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("Row {id} in {path:?} has no label")]
    MissingLabel { path: PathBuf, id: String },
    #[error("Row {id} in {path:?} has label {label}, expected one of 0..{num_labels}")]
    LabelOutOfRange {
        path: PathBuf,
        id: String,
        label: usize,
        num_labels: usize,
    },
}

/// One row of a metadata table: an audio clip and, for training data, its label.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MetadataRow {
    pub id: String,
    /// Clip location, relative to the data directory.
    pub path: String,
    #[serde(default)]
    pub label: Option<usize>,
}

impl MetadataRow {
    /// Resolve the clip location against `data_dir`.
    pub fn resolve(&self, data_dir: &Path) -> PathBuf {
        let relative = self.path.strip_prefix("./").unwrap_or(&self.path);
        data_dir.join(relative)
    }
}

/// Read a table where every row must carry a label in `0..num_labels`.
pub fn read_labeled(path: impl AsRef<Path>, num_labels: usize) -> Result<Vec<MetadataRow>, MetadataError> {
    let path = path.as_ref();
    let rows = read_rows(path)?;

    for row in &rows {
        match row.label {
            None => {
                return Err(MetadataError::MissingLabel {
                    path: path.to_path_buf(),
                    id: row.id.clone(),
                });
            }
            Some(label) if label >= num_labels => {
                return Err(MetadataError::LabelOutOfRange {
                    path: path.to_path_buf(),
                    id: row.id.clone(),
                    label,
                    num_labels,
                });
            }
            Some(_) => {}
        }
    }

    tracing::debug!(?path, rows = rows.len(), "Read labeled metadata");
    Ok(rows)
}

/// Read a table without labels, any label column is ignored.
pub fn read_unlabeled(path: impl AsRef<Path>) -> Result<Vec<MetadataRow>, MetadataError> {
    let path = path.as_ref();
    let rows = read_rows(path)?
        .into_iter()
        .map(|row| MetadataRow { label: None, ..row })
        .collect::<Vec<_>>();

    tracing::debug!(?path, rows = rows.len(), "Read unlabeled metadata");
    Ok(rows)
}

fn read_rows(path: &Path) -> Result<Vec<MetadataRow>, MetadataError> {
    let csv_err = |source| MetadataError::Csv {
        path: path.to_path_buf(),
        source,
    };

    csv::Reader::from_path(path)
        .map_err(csv_err)?
        .deserialize()
        .collect::<Result<Vec<MetadataRow>, _>>()
        .map_err(csv_err)
}
