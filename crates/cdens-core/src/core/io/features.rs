use crate::core::models::frame::{Trajectory, TrajectoryError};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum FeatureFileError {
    #[error("CSV error in '{path}': {source}", path = path.display())]
    Csv { path: PathBuf, source: csv::Error },
    #[error("Invalid number '{value}' in '{path}' at row {row}, column {column}", path = path.display())]
    InvalidNumber {
        path: PathBuf,
        row: usize,
        column: usize,
        value: String,
    },
    #[error("Invalid trajectory in '{path}': {source}", path = path.display())]
    Trajectory {
        path: PathBuf,
        source: TrajectoryError,
    },
}

/// Reads one replica's per-frame feature vectors from a CSV file.
///
/// Each row is a frame in time order and every column a feature. A first row
/// that is not fully numeric is treated as a header and skipped; lines
/// starting with `#` are comments.
pub fn read_feature_table(path: &Path, replica: usize) -> Result<Trajectory, FeatureFileError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .comment(Some(b'#'))
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|source| FeatureFileError::Csv {
            path: path.to_path_buf(),
            source,
        })?;

    let mut rows = Vec::new();
    for (row_idx, record) in reader.records().enumerate() {
        let record = record.map_err(|source| FeatureFileError::Csv {
            path: path.to_path_buf(),
            source,
        })?;

        let parsed: Result<Vec<f64>, (usize, String)> = record
            .iter()
            .enumerate()
            .map(|(col, field)| field.parse::<f64>().map_err(|_| (col, field.to_string())))
            .collect();

        match parsed {
            Ok(values) => rows.push(values),
            Err(_) if row_idx == 0 => {
                debug!("Skipping header row of feature table {:?}", path);
            }
            Err((column, value)) => {
                return Err(FeatureFileError::InvalidNumber {
                    path: path.to_path_buf(),
                    row: row_idx + 1,
                    column: column + 1,
                    value,
                });
            }
        }
    }

    Trajectory::from_features(replica, rows).map_err(|source| FeatureFileError::Trajectory {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn reads_table_with_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rep0.csv");
        fs::write(&path, "phi,psi\n-60.0,-45.0\n-120.0,130.0\n").unwrap();

        let traj = read_feature_table(&path, 4).unwrap();
        assert_eq!(traj.replica(), 4);
        assert_eq!(traj.len(), 2);
        assert_eq!(traj.frames()[1].features(), &[-120.0, 130.0]);
    }

    #[test]
    fn reads_table_without_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rep1.csv");
        fs::write(&path, "# dihedral features\n1.0,2.0\n3.0,4.0\n5.0,6.0\n").unwrap();
        let traj = read_feature_table(&path, 0).unwrap();
        assert_eq!(traj.len(), 3);
    }

    #[test]
    fn non_numeric_data_row_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.csv");
        fs::write(&path, "a,b\n1.0,2.0\n3.0,x\n").unwrap();
        let err = read_feature_table(&path, 0).unwrap_err();
        assert!(matches!(
            err,
            FeatureFileError::InvalidNumber {
                row: 3,
                column: 2,
                ..
            }
        ));
    }

    #[test]
    fn missing_file_is_a_csv_error() {
        let dir = tempdir().unwrap();
        let result = read_feature_table(&dir.path().join("none.csv"), 0);
        assert!(matches!(result, Err(FeatureFileError::Csv { .. })));
    }
}
