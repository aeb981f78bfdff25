//! Inference capability and the built-in `linear` flavor.
//!
//! A `linear` model is a set of coefficient rows plus intercepts, exported from
//! a fitted linear/logistic regressor. Without `classes` it regresses; with
//! `classes` it classifies (binary logistic or multinomial softmax).

use anyhow::{anyhow, bail, Result};
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;

/// Dense row-major feature matrix handed from the encoder to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl FeatureMatrix {
    pub fn from_rows(rows: Vec<Vec<f64>>) -> Result<Self> {
        let cols = rows.first().map(|r| r.len()).unwrap_or(0);
        if let Some((i, r)) = rows.iter().enumerate().find(|(_, r)| r.len() != cols) {
            bail!("row {i} has {} values, expected {cols}", r.len());
        }
        let n = rows.len();
        Ok(Self { rows: n, cols, data: rows.into_iter().flatten().collect() })
    }
    pub fn rows(&self) -> usize { self.rows }
    pub fn cols(&self) -> usize { self.cols }
    pub fn row(&self, i: usize) -> &[f64] { &self.data[i * self.cols..(i + 1) * self.cols] }
    pub fn as_slice(&self) -> &[f64] { &self.data }
}

/// A loaded model: one output value per input row.
pub trait Model: Send + Sync + std::fmt::Debug {
    fn predict(&self, features: &FeatureMatrix) -> Result<Vec<Value>>;
    fn flavor(&self) -> &'static str;
}

#[derive(Debug, Clone, Deserialize)]
pub struct LinearModel {
    coefficients: Vec<Vec<f64>>,
    intercepts: Vec<f64>,
    #[serde(default)]
    classes: Option<Vec<Value>>,
}

impl LinearModel {
    pub fn new(coefficients: Vec<Vec<f64>>, intercepts: Vec<f64>, classes: Option<Vec<Value>>) -> Result<Self> {
        let m = Self { coefficients, intercepts, classes };
        m.validate()?;
        Ok(m)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| anyhow!("failed to read {}: {e}", path.display()))?;
        let m: Self = serde_json::from_slice(&bytes)?;
        m.validate()?;
        Ok(m)
    }

    fn validate(&self) -> Result<()> {
        let n = self.n_features();
        if self.coefficients.is_empty() || n == 0 { bail!("linear model has no coefficients"); }
        if self.coefficients.iter().any(|r| r.len() != n) { bail!("coefficient rows have differing lengths"); }
        if self.intercepts.len() != self.coefficients.len() {
            bail!("expected {} intercepts, found {}", self.coefficients.len(), self.intercepts.len());
        }
        if let Some(classes) = &self.classes {
            // a single decision row is binary logistic over two classes
            let expected = if self.coefficients.len() == 1 { 2 } else { self.coefficients.len() };
            if classes.len() != expected {
                bail!("expected {expected} classes for {} coefficient rows, found {}", self.coefficients.len(), classes.len());
            }
        }
        Ok(())
    }

    pub fn n_features(&self) -> usize { self.coefficients.first().map(|r| r.len()).unwrap_or(0) }

    fn decision(&self, x: &[f64]) -> Vec<f64> {
        self.coefficients.iter().zip(&self.intercepts)
            .map(|(w, b)| w.iter().zip(x).map(|(w, x)| w * x).sum::<f64>() + b)
            .collect()
    }

    fn output_for(&self, scores: Vec<f64>) -> Value {
        match &self.classes {
            None if scores.len() == 1 => number(scores[0]),
            None => Value::Array(scores.into_iter().map(number).collect()),
            Some(classes) if scores.len() == 1 => {
                let idx = if sigmoid(scores[0]) >= 0.5 { 1 } else { 0 };
                classes[idx].clone()
            }
            Some(classes) => {
                let mut probs = scores;
                softmax(&mut probs);
                let idx = probs.iter().enumerate()
                    .max_by(|a, b| a.1.total_cmp(b.1))
                    .map(|(i, _)| i)
                    .unwrap_or(0);
                classes[idx].clone()
            }
        }
    }
}

impl Model for LinearModel {
    fn predict(&self, features: &FeatureMatrix) -> Result<Vec<Value>> {
        let expected = self.n_features();
        if features.cols() != expected {
            bail!("X has {} features, but model is expecting {expected} features as input", features.cols());
        }
        Ok((0..features.rows()).map(|i| self.output_for(self.decision(features.row(i)))).collect())
    }

    fn flavor(&self) -> &'static str { "linear" }
}

pub(crate) fn number(v: f64) -> Value { serde_json::Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null) }

fn sigmoid(x: f64) -> f64 { 1.0 / (1.0 + (-x).exp()) }

pub(crate) fn softmax(v: &mut [f64]) {
    if v.is_empty() { return; }
    let max = v.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let mut sum = 0.0;
    for x in v.iter_mut() { *x = (*x - max).exp(); sum += *x; }
    if sum > 0.0 { for x in v.iter_mut() { *x /= sum; } }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn one_row(v: Vec<f64>) -> FeatureMatrix { FeatureMatrix::from_rows(vec![v]).unwrap() }

    #[test]
    fn softmax_basic() {
        let mut v = vec![1.0, 2.0, 3.0];
        softmax(&mut v);
        let s: f64 = v.iter().sum();
        assert!((s - 1.0).abs() < 1e-9);
        assert!(v[2] > v[1] && v[1] > v[0]);
    }

    #[test]
    fn ragged_rows_rejected() {
        assert!(FeatureMatrix::from_rows(vec![vec![1.0, 2.0], vec![1.0]]).is_err());
    }

    #[test]
    fn regression_single_output() {
        let m = LinearModel::new(vec![vec![2.0, 0.5]], vec![1.0], None).unwrap();
        let out = m.predict(&one_row(vec![3.0, 4.0])).unwrap();
        assert_eq!(out, vec![json!(9.0)]);
    }

    #[test]
    fn regression_multi_output_is_array() {
        let m = LinearModel::new(vec![vec![1.0], vec![-1.0]], vec![0.0, 0.0], None).unwrap();
        let out = m.predict(&one_row(vec![2.0])).unwrap();
        assert_eq!(out, vec![json!([2.0, -2.0])]);
    }

    #[test]
    fn binary_logistic_picks_class() {
        let m = LinearModel::new(vec![vec![1.0]], vec![0.0], Some(vec![json!("no"), json!("yes")])).unwrap();
        assert_eq!(m.predict(&one_row(vec![3.0])).unwrap(), vec![json!("yes")]);
        assert_eq!(m.predict(&one_row(vec![-3.0])).unwrap(), vec![json!("no")]);
    }

    #[test]
    fn multinomial_argmax() {
        let m = LinearModel::new(
            vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![0.0, 0.0]],
            vec![0.0, 0.0, 0.5],
            Some(vec![json!(0), json!(1), json!(2)]),
        ).unwrap();
        assert_eq!(m.predict(&one_row(vec![0.0, 3.0])).unwrap(), vec![json!(1)]);
        assert_eq!(m.predict(&one_row(vec![0.0, 0.0])).unwrap(), vec![json!(2)]);
    }

    #[test]
    fn feature_count_mismatch() {
        let m = LinearModel::new(vec![vec![1.0, 1.0]], vec![0.0], None).unwrap();
        let err = m.predict(&one_row(vec![1.0])).unwrap_err();
        assert!(err.to_string().contains("X has 1 features, but model is expecting 2"));
    }

    #[test]
    fn invalid_shapes_rejected() {
        assert!(LinearModel::new(vec![], vec![], None).is_err());
        assert!(LinearModel::new(vec![vec![1.0]], vec![], None).is_err());
        assert!(LinearModel::new(vec![vec![1.0], vec![1.0]], vec![0.0, 0.0], Some(vec![json!("a")])).is_err());
    }
}
