//! Service metric families, registered on a registry owned by the service.

use anyhow::Result;
use prometheus::{Histogram, HistogramOpts, IntCounterVec, Opts, Registry};

#[derive(Debug, Clone)]
pub struct ServingMetrics {
    registry: Registry,
    /// outcome: success | not_loaded | preprocessing_error | inference_error
    pub predictions: IntCounterVec,
    pub prediction_seconds: Histogram,
    /// source: cache | registry; outcome: success | failure
    pub model_loads: IntCounterVec,
    pub model_load_seconds: Histogram,
}

impl ServingMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let predictions = IntCounterVec::new(
            Opts::new("model_serving_predictions_total", "Prediction requests by outcome"),
            &["outcome"],
        )?;
        let prediction_seconds = Histogram::with_opts(HistogramOpts::new(
            "model_serving_prediction_seconds",
            "Time spent in preprocessing plus inference",
        ).buckets(vec![0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]))?;
        let model_loads = IntCounterVec::new(
            Opts::new("model_serving_model_loads_total", "Model load attempts by source and outcome"),
            &["source", "outcome"],
        )?;
        let model_load_seconds = Histogram::with_opts(HistogramOpts::new(
            "model_serving_model_load_seconds",
            "Wall time of model load attempts",
        ).buckets(vec![0.01, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]))?;

        registry.register(Box::new(predictions.clone()))?;
        registry.register(Box::new(prediction_seconds.clone()))?;
        registry.register(Box::new(model_loads.clone()))?;
        registry.register(Box::new(model_load_seconds.clone()))?;
        Ok(Self { registry, predictions, prediction_seconds, model_loads, model_load_seconds })
    }

    pub fn registry(&self) -> &Registry { &self.registry }

    pub fn record_prediction(&self, outcome: &str) { self.predictions.with_label_values(&[outcome]).inc(); }

    pub fn record_load(&self, source: &str, outcome: &str, secs: f64) {
        self.model_loads.with_label_values(&[source, outcome]).inc();
        self.model_load_seconds.observe(secs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn families_render_after_use() {
        let m = ServingMetrics::new().unwrap();
        m.record_prediction("success");
        m.record_load("cache", "success", 0.2);
        let text = String::from_utf8(serving_core::render_metrics(m.registry()).unwrap()).unwrap();
        assert!(text.contains("model_serving_predictions_total{outcome=\"success\"} 1"));
        assert!(text.contains("model_serving_model_loads_total{outcome=\"success\",source=\"cache\"} 1"));
        assert!(text.contains("model_serving_model_load_seconds_count 1"));
    }

    #[test]
    fn instances_do_not_share_state() {
        let a = ServingMetrics::new().unwrap();
        let b = ServingMetrics::new().unwrap();
        a.record_prediction("success");
        assert_eq!(b.predictions.with_label_values(&["success"]).get(), 0);
    }
}
