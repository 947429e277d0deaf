use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub ml_service_url: String,
    pub simulation_tick_ms: u64,
    pub http_timeout_secs: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .unwrap_or(8080);

        let ml_service_url = std::env::var("ML_SERVICE_URL")
            .unwrap_or_else(|_| "http://ml-service:8000".to_string())
            .trim_end_matches('/')
            .to_string();

        let simulation_tick_ms = std::env::var("SIMULATION_TICK_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|&v| v > 0)
            .unwrap_or(1000);

        let http_timeout_secs = std::env::var("HTTP_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|&v| v > 0)
            .unwrap_or(10);

        Ok(Self {
            port,
            ml_service_url,
            simulation_tick_ms,
            http_timeout_secs,
        })
    }
}

/// Summary of an ingested dataset. Immutable; a new ingestion replaces the
/// whole value, never a field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetMetadata {
    pub record_count: u64,
    pub column_count: u64,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub pass_rate: f64,
    pub pass_count: u64,
    pub fail_count: u64,
    pub name: String,
    pub ingested_at: DateTime<Utc>,
}

/// A single time window, `start < end`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    /// Whole-day span, exclusive of the end day (`end - start` in days).
    pub fn day_span(&self) -> i64 {
        (self.end - self.start).num_days()
    }

    /// Calendar days covered, counting both endpoints.
    pub fn days_inclusive(&self) -> i64 {
        self.day_span() + 1
    }
}

/// The three-way training/testing/simulation partition.
///
/// Invariant once validated: `training.end == testing.start` and
/// `testing.end == simulation.start`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DateRanges {
    pub training: DateRange,
    pub testing: DateRange,
    pub simulation: DateRange,
}

/// Outcome of date-range validation. Either all rules pass and the
/// distribution is present, or every violated rule is listed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub is_valid: bool,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_distribution: Option<DataDistribution>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataDistribution {
    pub training_records: u64,
    pub testing_records: u64,
    pub simulation_records: u64,
    pub monthly_distribution: Vec<MonthlyData>,
}

/// Per-month day counts, keyed "YYYY-MM" and sorted ascending.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthlyData {
    pub month: String,
    pub month_name: String,
    pub training_count: u64,
    pub testing_count: u64,
    pub simulation_count: u64,
    pub total_count: u64,
}

/// Classifier verdict for one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PredictionLabel {
    Pass,
    Fail,
}

impl PredictionLabel {
    pub fn is_pass(&self) -> bool {
        matches!(self, PredictionLabel::Pass)
    }

    pub fn as_str(&self) -> &str {
        match self {
            PredictionLabel::Pass => "Pass",
            PredictionLabel::Fail => "Fail",
        }
    }
}

/// Live aggregate state of the simulation run.
///
/// Exactly one instance exists process-wide, behind the lock in
/// `simulation::state`. Readers always get a snapshot copy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationStatus {
    pub is_running: bool,
    pub total_predictions: u64,
    pub pass_count: u64,
    pub fail_count: u64,
    pub average_confidence: f64,
    pub expected_count: Option<u64>,
}

/// One per-record result pushed to subscribers. Ephemeral; only a short
/// ring of recent events is kept for late joiners.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionEvent {
    pub sample_id: String,
    /// Assigned simulation date (window start + record index days), RFC 3339.
    pub timestamp: String,
    pub prediction: PredictionLabel,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_response: Option<String>,
    pub features: serde_json::Map<String, serde_json::Value>,
}

/// Events fanned out to WebSocket subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum WsServerEvent {
    PredictionUpdate(PredictionEvent),
    StatusUpdate(SimulationStatus),
}
