//! External ML service boundary.
//!
//! The backend never trains or scores a model itself; it talks to the ML
//! service over HTTP. Per-record scoring goes through the `Predictor` trait
//! so the engine can be driven by a stub in tests, mirroring how the live
//! client stands behind the same seam in production.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::models::{DateRanges, PredictionLabel};

/// Label + confidence returned by the classifier for one feature set.
#[derive(Debug, Clone, Deserialize)]
pub struct Prediction {
    #[serde(rename = "prediction")]
    pub label: PredictionLabel,
    pub confidence: f64,
}

/// Per-record classification boundary. Single-shot: callers never retry a
/// failed record, they log and move on.
#[async_trait]
pub trait Predictor: Send + Sync {
    async fn predict(&self, features: &Map<String, Value>) -> Result<Prediction>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainRequest {
    pub date_ranges: DateRanges,
    /// Full processed dataset, synthetic timestamps included; the service
    /// windows the rows itself.
    pub records: Vec<Map<String, Value>>,
}

#[derive(Serialize)]
struct PredictRequest<'a> {
    features: &'a Map<String, Value>,
}

/// Metrics reported by the ML service after training, passed through to the
/// caller verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelMetrics {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
    pub confusion_matrix: ConfusionMatrix,
    pub training_history: TrainingHistory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfusionMatrix {
    pub true_positive: u64,
    pub true_negative: u64,
    pub false_positive: u64,
    pub false_negative: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingHistory {
    pub epochs: Vec<u32>,
    pub accuracy: Vec<f64>,
    pub loss: Vec<f64>,
}

/// HTTP client for the ML service.
pub struct MlServiceClient {
    http: reqwest::Client,
    base_url: String,
}

impl MlServiceClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    pub async fn train(&self, request: &TrainRequest) -> Result<ModelMetrics> {
        let url = format!("{}/train", self.base_url);
        info!(url = %url, records = request.records.len(), "requesting model training");

        let response = self
            .http
            .post(&url)
            .json(request)
            .send()
            .await
            .context("ML service training request failed")?;

        let status = response.status();
        let body = response
            .text()
            .await
            .context("failed to read ML service response")?;
        if !status.is_success() {
            bail!("ML service error: {status} - {body}");
        }

        let metrics: ModelMetrics =
            serde_json::from_str(&body).context("ML service returned malformed training metrics")?;
        info!(
            accuracy = metrics.accuracy,
            f1 = metrics.f1_score,
            "model training completed"
        );
        Ok(metrics)
    }

    /// Readiness probe; any transport or non-2xx outcome maps to not-ready.
    pub async fn model_ready(&self) -> bool {
        let url = format!("{}/model/status", self.base_url);
        match self.http.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl Predictor for MlServiceClient {
    async fn predict(&self, features: &Map<String, Value>) -> Result<Prediction> {
        let url = format!("{}/predict", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&PredictRequest { features })
            .send()
            .await
            .context("ML prediction request failed")?;

        let status = response.status();
        let body = response
            .text()
            .await
            .context("failed to read ML prediction response")?;
        if !status.is_success() {
            bail!("ML prediction error: {status} - {body}");
        }

        let prediction: Prediction =
            serde_json::from_str(&body).context("ML service returned malformed prediction")?;
        debug!(
            label = prediction.label.as_str(),
            confidence = prediction.confidence,
            "prediction completed"
        );
        Ok(prediction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_prediction_deserializes_service_payload() {
        let prediction: Prediction =
            serde_json::from_str(r#"{"prediction": "Pass", "confidence": 0.87}"#).unwrap();
        assert_eq!(prediction.label, PredictionLabel::Pass);
        assert!((prediction.confidence - 0.87).abs() < f64::EPSILON);

        let fail: Prediction =
            serde_json::from_str(r#"{"prediction": "Fail", "confidence": 0.55}"#).unwrap();
        assert!(!fail.label.is_pass());
    }

    #[test]
    fn test_unknown_label_is_rejected() {
        assert!(
            serde_json::from_str::<Prediction>(r#"{"prediction": "Maybe", "confidence": 0.5}"#)
                .is_err()
        );
    }

    #[test]
    fn test_train_request_wire_casing() {
        let range = |s, e| crate::models::DateRange {
            start: Utc.with_ymd_and_hms(2024, 1, s, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 1, e, 0, 0, 0).unwrap(),
        };
        let request = TrainRequest {
            date_ranges: DateRanges {
                training: range(1, 4),
                testing: range(4, 6),
                simulation: range(6, 10),
            },
            records: vec![Map::new()],
        };

        let json: Value = serde_json::to_value(&request).unwrap();
        assert!(json.get("dateRanges").is_some());
        assert!(json["dateRanges"].get("training").is_some());
        assert!(json["dateRanges"]["training"].get("start").is_some());
        assert_eq!(json["records"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_model_metrics_roundtrip() {
        let payload = r#"{
            "accuracy": 0.91, "precision": 0.88, "recall": 0.9, "f1Score": 0.89,
            "confusionMatrix": {"truePositive": 120, "trueNegative": 800, "falsePositive": 30, "falseNegative": 22},
            "trainingHistory": {"epochs": [1, 2], "accuracy": [0.8, 0.9], "loss": [0.4, 0.2]}
        }"#;
        let metrics: ModelMetrics = serde_json::from_str(payload).unwrap();
        assert_eq!(metrics.confusion_matrix.true_negative, 800);
        assert_eq!(metrics.training_history.epochs, vec![1, 2]);
    }
}
