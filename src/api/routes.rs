//! HTTP route handlers.
//!
//! Thin layer over the dataset store, the ML client, and the simulation
//! engine: precondition failures map to 400, missing state to 404, and
//! validation outcomes are always a 200 with the structured result.

use axum::{
    extract::{Json as AxumJson, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    dataset::DataRecord,
    ml::{ModelMetrics, TrainRequest},
    models::{DatasetMetadata, DateRange, DateRanges, SimulationStatus, ValidationResult},
    AppState,
};

// ===== Request/Response Types =====

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadDatasetRequest {
    pub name: String,
    /// Source column order, as parsed from the file by the upload layer.
    pub columns: Vec<String>,
    pub records: Vec<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelStatusResponse {
    pub is_ready: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentWindowResponse {
    pub total_records: usize,
    pub date_range: DateRange,
    pub sample_data: Vec<SamplePreview>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SamplePreview {
    pub timestamp: String,
    pub features: serde_json::Map<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_response: Option<String>,
}

// ===== Dataset =====

pub async fn upload_dataset(
    State(state): State<AppState>,
    AxumJson(request): AxumJson<UploadDatasetRequest>,
) -> Result<Json<DatasetMetadata>, ApiError> {
    let metadata = state
        .datasets
        .ingest(&request.name, &request.columns, request.records)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    Ok(Json(metadata))
}

pub async fn get_dataset_metadata(
    State(state): State<AppState>,
) -> Result<Json<DatasetMetadata>, ApiError> {
    state
        .datasets
        .metadata()
        .map(|m| Json((*m).clone()))
        .ok_or_else(|| ApiError::NotFound("No dataset has been uploaded yet".to_string()))
}

/// Validation is never an error response: both outcomes are a 200 with the
/// structured result so the caller can render every violated rule.
pub async fn validate_ranges(
    State(state): State<AppState>,
    AxumJson(ranges): AxumJson<DateRanges>,
) -> Json<ValidationResult> {
    Json(state.datasets.validate_and_store(&ranges))
}

pub async fn get_validated_ranges(
    State(state): State<AppState>,
) -> Result<Json<DateRanges>, ApiError> {
    state
        .datasets
        .validated_partition()
        .map(|p| Json(p.ranges))
        .ok_or_else(|| {
            ApiError::NotFound(
                "No validated date ranges found. Please validate date ranges first.".to_string(),
            )
        })
}

// ===== Model =====

pub async fn train_model(
    State(state): State<AppState>,
    AxumJson(ranges): AxumJson<DateRanges>,
) -> Result<Json<ModelMetrics>, ApiError> {
    let Some(dataset) = state.datasets.dataset() else {
        return Err(ApiError::BadRequest(
            "No dataset has been uploaded yet".to_string(),
        ));
    };

    let request = TrainRequest {
        date_ranges: ranges,
        records: dataset.export_rows(),
    };
    let metrics = state.ml.train(&request).await?;
    Ok(Json(metrics))
}

pub async fn get_model_status(State(state): State<AppState>) -> Json<ModelStatusResponse> {
    Json(ModelStatusResponse {
        is_ready: state.ml.model_ready().await,
    })
}

// ===== Simulation =====

pub async fn start_simulation(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state
        .engine
        .start()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    Ok(StatusCode::OK)
}

pub async fn stop_simulation(State(state): State<AppState>) -> StatusCode {
    state.engine.stop();
    StatusCode::OK
}

pub async fn reset_simulation(State(state): State<AppState>) -> StatusCode {
    state.engine.reset();
    StatusCode::OK
}

pub async fn get_simulation_status(State(state): State<AppState>) -> Json<SimulationStatus> {
    Json(state.engine.status())
}

pub async fn get_current_window_data(
    State(state): State<AppState>,
) -> Result<Json<CurrentWindowResponse>, ApiError> {
    let slice = state
        .datasets
        .simulation_records()
        .map_err(|e| ApiError::NotFound(e.to_string()))?;

    let sample_data = slice
        .records
        .iter()
        .take(3)
        .map(|record| {
            sample_preview(
                record,
                slice.dataset.columns(),
                slice.dataset.response_column(),
            )
        })
        .collect();

    Ok(Json(CurrentWindowResponse {
        total_records: slice.records.len(),
        date_range: slice.window,
        sample_data,
    }))
}

fn sample_preview(
    record: &DataRecord,
    columns: &[String],
    response_column: &str,
) -> SamplePreview {
    let mut features = serde_json::Map::new();
    for column in columns {
        if column == response_column {
            continue;
        }
        features.insert(
            column.clone(),
            serde_json::Value::String(record.value(column).to_string()),
        );
    }
    SamplePreview {
        timestamp: record.timestamp.to_rfc3339(),
        features,
        actual_response: record.values.get(response_column).cloned(),
    }
}

// ===== Error Handling =====

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::Internal(err) => {
                tracing::error!("internal error: {err:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion() {
        let err = anyhow::anyhow!("ML service unreachable");
        let api_err: ApiError = err.into();

        match api_err {
            ApiError::Internal(_) => (),
            _ => panic!("Expected Internal error"),
        }
    }

    #[test]
    fn test_upload_request_wire_casing() {
        let request: UploadDatasetRequest = serde_json::from_str(
            r#"{
                "name": "line4.csv",
                "columns": ["Id", "sensor_a", "Response"],
                "records": [{"Id": "S0", "sensor_a": 1.5, "Response": "0"}]
            }"#,
        )
        .unwrap();
        assert_eq!(request.name, "line4.csv");
        assert_eq!(request.columns.len(), 3);
        assert_eq!(request.records.len(), 1);
    }
}
