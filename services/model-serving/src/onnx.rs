//! `onnx` flavor backed by tract. Compiled only with the `onnx` feature.

use anyhow::{anyhow, Result};
use serde_json::Value;
use std::path::Path;
use tract_onnx::prelude::*;

use crate::model::{number, FeatureMatrix, Model};

pub struct OnnxModel {
    plan: TypedRunnableModel<TypedModel>,
    input_dim: usize,
}

impl std::fmt::Debug for OnnxModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxModel").field("input_dim", &self.input_dim).finish()
    }
}

impl OnnxModel {
    /// Load and optimize the graph. `input_dim` pins the input fact to `[1, input_dim]`
    /// for graphs exported with symbolic dimensions.
    pub fn load(path: &Path, input_dim: Option<usize>) -> Result<Self> {
        let mut model = tract_onnx::onnx().model_for_path(path)?;
        if let Some(dim) = input_dim {
            model = model.with_input_fact(0, f32::fact([1, dim]).into())?;
        }
        let plan = model.into_optimized()?.into_runnable()?;
        // Determine input dim from the first input fact when not pinned
        let input_dim = input_dim.or_else(|| {
            plan.model()
                .input_outlets().ok()
                .and_then(|outlets| outlets.first().copied())
                .and_then(|o| plan.model().outlet_fact(o).ok())
                .and_then(|f| f.shape.as_concrete().map(|s| s.iter().skip(1).product::<usize>()))
        }).ok_or_else(|| anyhow!("cannot infer input dimension of {}; set input_dim in MLmodel", path.display()))?;
        Ok(Self { plan, input_dim })
    }
}

impl Model for OnnxModel {
    fn predict(&self, features: &FeatureMatrix) -> Result<Vec<Value>> {
        if features.cols() != self.input_dim {
            return Err(anyhow!(
                "X has {} features, but model is expecting {} features as input",
                features.cols(),
                self.input_dim
            ));
        }
        let flat: Vec<f32> = features.as_slice().iter().map(|v| *v as f32).collect();
        let tensor = Tensor::from_shape(&[features.rows(), features.cols()], &flat)?;
        let outputs = self.plan.run(tvec!(tensor.into()))?;
        let out = outputs.first().ok_or_else(|| anyhow!("model produced no outputs"))?;
        // classifiers commonly emit int64 labels first; regressors emit f32
        let values: Vec<Value> = if let Ok(view) = out.to_array_view::<i64>() {
            view.iter().map(|v| Value::from(*v)).collect()
        } else {
            out.to_array_view::<f32>()?.iter().map(|v| number(*v as f64)).collect()
        };
        let per_row = values.len() / features.rows().max(1);
        if per_row == 0 { return Err(anyhow!("model output is empty")); }
        Ok(values.chunks(per_row).map(|chunk| {
            if chunk.len() == 1 { chunk[0].clone() } else { Value::Array(chunk.to_vec()) }
        }).collect())
    }

    fn flavor(&self) -> &'static str { "onnx" }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Graph whose output is its `[1, 3]` input.
    fn identity() -> OnnxModel {
        let mut model = TypedModel::default();
        let x = model.add_source("x", f32::fact([1, 3])).unwrap();
        model.set_output_outlets(&[x]).unwrap();
        OnnxModel { plan: model.into_runnable().unwrap(), input_dim: 3 }
    }

    #[test]
    fn feature_count_mismatch_is_reported() {
        let m = FeatureMatrix::from_rows(vec![vec![1.0, 2.0]]).unwrap();
        let err = identity().predict(&m).unwrap_err();
        assert_eq!(err.to_string(), "X has 2 features, but model is expecting 3 features as input");
    }

    #[test]
    fn runs_one_row() {
        let m = FeatureMatrix::from_rows(vec![vec![1.0, 2.5, -1.0]]).unwrap();
        let out = identity().predict(&m).unwrap();
        assert_eq!(out, vec![serde_json::json!([1.0, 2.5, -1.0])]);
        assert_eq!(identity().flavor(), "onnx");
    }
}
