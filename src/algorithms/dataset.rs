//! The local feature slice of a party.
//!
//! Files are comma separated with a header line. One column holds the sample ids, the label
//! holder additionally has a label column, every other column is a numeric feature.

use std::collections::{HashMap, HashSet};

use super::AlgorithmError;

/// A parsed but untyped CSV file.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    header: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    /// Parses a CSV file. Blank lines are skipped.
    ///
    /// # Errors
    /// Fails if the file is not UTF-8, has no header, or a row has the wrong number of cells.
    pub fn parse(file: &[u8]) -> Result<Self, AlgorithmError> {
        let text = std::str::from_utf8(file)
            .map_err(|_| AlgorithmError::Dataset("file is not valid UTF-8".into()))?;
        let mut lines = text.lines().filter(|line| !line.trim().is_empty());
        let header = lines
            .next()
            .map(split_line)
            .ok_or_else(|| AlgorithmError::Dataset("file has no header".into()))?;

        let rows = lines
            .enumerate()
            .map(|(idx, line)| {
                let row = split_line(line);
                if row.len() == header.len() {
                    Ok(row)
                } else {
                    Err(AlgorithmError::Dataset(format!(
                        "row {} has {} cells, expected {}",
                        idx + 1,
                        row.len(),
                        header.len()
                    )))
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { header, rows })
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Returns the position of a column.
    pub fn column(&self, name: &str) -> Result<usize, AlgorithmError> {
        self.header
            .iter()
            .position(|col| col == name)
            .ok_or_else(|| AlgorithmError::Dataset(format!("column {} not found", name)))
    }

    /// Returns the values of the id column.
    pub fn ids(&self, id_name: &str) -> Result<Vec<String>, AlgorithmError> {
        let idx = self.column(id_name)?;
        Ok(self.rows.iter().map(|row| row[idx].clone()).collect())
    }

    /// Returns the numeric values of a column, keyed by sample id.
    pub fn numeric_by_id(
        &self,
        id_name: &str,
        column: &str,
    ) -> Result<HashMap<String, f64>, AlgorithmError> {
        let id_idx = self.column(id_name)?;
        let idx = self.column(column)?;
        self.rows
            .iter()
            .map(|row| Ok((row[id_idx].clone(), parse_cell(&row[idx], column)?)))
            .collect()
    }

    /// Keeps the rows whose id is in `ids`.
    pub fn retain_ids(&self, id_name: &str, ids: &HashSet<String>) -> Result<Self, AlgorithmError> {
        let idx = self.column(id_name)?;
        Ok(Self {
            header: self.header.clone(),
            rows: self
                .rows
                .iter()
                .filter(|row| ids.contains(&row[idx]))
                .cloned()
                .collect(),
        })
    }

    pub fn to_csv(&self) -> Vec<u8> {
        let mut out = self.header.join(",");
        out.push('\n');
        for row in &self.rows {
            out.push_str(&row.join(","));
            out.push('\n');
        }
        out.into_bytes()
    }
}

fn split_line(line: &str) -> Vec<String> {
    line.split(',').map(|cell| cell.trim().to_string()).collect()
}

fn parse_cell(cell: &str, column: &str) -> Result<f64, AlgorithmError> {
    cell.parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
        .ok_or_else(|| {
            AlgorithmError::Dataset(format!("invalid value {:?} in column {}", cell, column))
        })
}

/// Numeric samples ordered by id.
///
/// Every party orders its samples the same way, so row `i` refers to the same sample on all
/// parties.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub ids: Vec<String>,
    pub features: Vec<String>,
    /// Row major feature values.
    pub rows: Vec<Vec<f64>>,
    pub labels: Option<Vec<f64>>,
}

impl Dataset {
    /// Extracts the samples of a table.
    ///
    /// If `features` is `None`, every column except the id and label columns is a feature.
    pub fn from_table(
        table: &Table,
        id_name: &str,
        label: Option<&str>,
        features: Option<&[String]>,
    ) -> Result<Self, AlgorithmError> {
        if table.is_empty() {
            return Err(AlgorithmError::Dataset("file has no samples".into()));
        }
        let id_idx = table.column(id_name)?;
        let label_idx = label.map(|label| table.column(label)).transpose()?;
        let features = match features {
            Some(features) => features.to_vec(),
            None => table
                .header()
                .iter()
                .enumerate()
                .filter(|(idx, _)| *idx != id_idx && Some(*idx) != label_idx)
                .map(|(_, col)| col.clone())
                .collect(),
        };
        let feature_idx = features
            .iter()
            .map(|col| table.column(col))
            .collect::<Result<Vec<_>, _>>()?;

        let mut samples = table
            .rows
            .iter()
            .map(|row| {
                let values = feature_idx
                    .iter()
                    .zip(&features)
                    .map(|(idx, col)| parse_cell(&row[*idx], col))
                    .collect::<Result<Vec<_>, _>>()?;
                let label = label_idx
                    .zip(label)
                    .map(|(idx, col)| parse_cell(&row[idx], col))
                    .transpose()?;
                Ok((row[id_idx].clone(), values, label))
            })
            .collect::<Result<Vec<_>, AlgorithmError>>()?;
        samples.sort_by(|a, b| a.0.cmp(&b.0));
        if samples.windows(2).any(|pair| pair[0].0 == pair[1].0) {
            return Err(AlgorithmError::Dataset("duplicate sample id".into()));
        }

        let mut ids = Vec::with_capacity(samples.len());
        let mut rows = Vec::with_capacity(samples.len());
        let mut labels = Vec::with_capacity(samples.len());
        for (id, values, label) in samples {
            ids.push(id);
            rows.push(values);
            if let Some(label) = label {
                labels.push(label);
            }
        }
        Ok(Self {
            ids,
            features,
            rows,
            labels: label_idx.map(|_| labels),
        })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Returns the mean and the standard deviation of every feature. A constant feature gets a
    /// deviation of `1`.
    pub fn moments(&self) -> (Vec<f64>, Vec<f64>) {
        let n = self.len() as f64;
        let dims = self.features.len();
        let mut means = vec![0.0; dims];
        for row in &self.rows {
            for (mean, value) in means.iter_mut().zip(row) {
                *mean += value / n;
            }
        }
        let mut stds = vec![0.0; dims];
        for row in &self.rows {
            for ((std, value), mean) in stds.iter_mut().zip(row).zip(&means) {
                *std += (value - mean).powi(2) / n;
            }
        }
        for std in stds.iter_mut() {
            *std = std.sqrt();
            if *std < f64::EPSILON {
                *std = 1.0;
            }
        }
        (means, stds)
    }

    /// Standardizes the features in place.
    pub fn standardize(&mut self, means: &[f64], stds: &[f64]) {
        for row in self.rows.iter_mut() {
            for ((value, mean), std) in row.iter_mut().zip(means).zip(stds) {
                *value = (*value - mean) / std;
            }
        }
    }
}
