//! Fitted feature encoder: maps raw JSON feature rows onto the numeric matrix
//! the model was trained on.

use serde::Deserialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::model::FeatureMatrix;

pub type Row = Map<String, Value>;

#[derive(Debug, Error)]
pub enum EncoderError {
    #[error("column '{0}' is missing from input")]
    MissingColumn(String),
    #[error("column '{column}' expected a numeric value, got {found}")]
    NotNumeric { column: String, found: Value },
    #[error("column '{column}' found unknown category {value}")]
    UnknownCategory { column: String, value: Value },
    #[error("invalid encoder artifact: {0}")]
    Invalid(String),
    #[error("encoder artifact {} failed integrity check: expected sha256 {expected}, got {actual}", path.display())]
    Integrity { path: PathBuf, expected: String, actual: String },
    #[error("failed to read encoder artifact {}: {source}", path.display())]
    Io { path: PathBuf, source: std::io::Error },
    #[error("failed to parse encoder artifact: {0}")]
    Parse(#[from] serde_json::Error),
}

/// A fitted transform from raw rows to a feature matrix.
pub trait Encoder: Send + Sync + std::fmt::Debug {
    fn transform(&self, rows: &[Row]) -> Result<FeatureMatrix, EncoderError>;
    fn n_features_out(&self) -> usize;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleUnknown { #[default] Error, Ignore }

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ColumnSpec {
    Passthrough { name: String },
    Standard { name: String, mean: f64, scale: f64 },
    OneHot {
        name: String,
        categories: Vec<Value>,
        #[serde(default)]
        handle_unknown: HandleUnknown,
    },
}

impl ColumnSpec {
    pub fn name(&self) -> &str {
        match self { Self::Passthrough { name } | Self::Standard { name, .. } | Self::OneHot { name, .. } => name }
    }
    fn width(&self) -> usize {
        match self { Self::OneHot { categories, .. } => categories.len(), _ => 1 }
    }

    fn encode_into(&self, row: &Row, out: &mut Vec<f64>) -> Result<(), EncoderError> {
        let value = row.get(self.name()).ok_or_else(|| EncoderError::MissingColumn(self.name().to_string()))?;
        match self {
            Self::Passthrough { name } => out.push(numeric(name, value)?),
            Self::Standard { name, mean, scale } => {
                let scale = if *scale == 0.0 { 1.0 } else { *scale };
                out.push((numeric(name, value)? - mean) / scale);
            }
            Self::OneHot { name, categories, handle_unknown } => {
                let hit = categories.iter().position(|c| same_category(c, value));
                if hit.is_none() && *handle_unknown == HandleUnknown::Error {
                    return Err(EncoderError::UnknownCategory { column: name.clone(), value: value.clone() });
                }
                out.extend((0..categories.len()).map(|i| if Some(i) == hit { 1.0 } else { 0.0 }));
            }
        }
        Ok(())
    }
}

fn numeric(column: &str, value: &Value) -> Result<f64, EncoderError> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }.ok_or_else(|| EncoderError::NotNumeric { column: column.to_string(), found: value.clone() })
}

// 30 and 30.0 are the same category
fn same_category(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Column-wise encoder fitted offline and shipped as `encoder.json`.
/// Input keys not named by any column are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct ColumnEncoder {
    columns: Vec<ColumnSpec>,
}

impl ColumnEncoder {
    pub fn new(columns: Vec<ColumnSpec>) -> Result<Self, EncoderError> {
        let enc = Self { columns };
        enc.validate()?;
        Ok(enc)
    }

    /// Read the artifact, verifying its sha256 first when `expected_sha256` is given.
    pub fn from_path(path: &Path, expected_sha256: Option<&str>) -> Result<Self, EncoderError> {
        let bytes = std::fs::read(path).map_err(|source| EncoderError::Io { path: path.to_path_buf(), source })?;
        if let Some(expected) = expected_sha256.filter(|e| !e.is_empty()) {
            let actual = format!("{:x}", Sha256::digest(&bytes));
            if !expected.eq_ignore_ascii_case(&actual) {
                return Err(EncoderError::Integrity { path: path.to_path_buf(), expected: expected.to_string(), actual });
            }
        }
        let enc: Self = serde_json::from_slice(&bytes)?;
        enc.validate()?;
        Ok(enc)
    }

    pub fn columns(&self) -> &[ColumnSpec] { &self.columns }

    fn validate(&self) -> Result<(), EncoderError> {
        if self.columns.is_empty() { return Err(EncoderError::Invalid("no columns".into())); }
        let mut seen = HashSet::new();
        for c in &self.columns {
            if !seen.insert(c.name()) { return Err(EncoderError::Invalid(format!("duplicate column '{}'", c.name()))); }
            match c {
                ColumnSpec::Standard { mean, scale, .. } if !(mean.is_finite() && scale.is_finite()) => {
                    return Err(EncoderError::Invalid(format!("column '{}' has non-finite scaling", c.name())));
                }
                ColumnSpec::OneHot { categories, .. } if categories.is_empty() => {
                    return Err(EncoderError::Invalid(format!("column '{}' has no categories", c.name())));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl Encoder for ColumnEncoder {
    fn transform(&self, rows: &[Row]) -> Result<FeatureMatrix, EncoderError> {
        let width = self.n_features_out();
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mut encoded = Vec::with_capacity(width);
            for c in &self.columns { c.encode_into(row, &mut encoded)?; }
            out.push(encoded);
        }
        FeatureMatrix::from_rows(out).map_err(|e| EncoderError::Invalid(e.to_string()))
    }

    fn n_features_out(&self) -> usize { self.columns.iter().map(ColumnSpec::width).sum() }
}
