//! In-memory dataset store.
//!
//! Ingestion turns parsed tabular rows into a timestamped record sequence
//! (one synthetic day per row, fixed base date) plus an immutable descriptor.
//! The descriptor and the active validated partition are replace-wholesale
//! values: swapped atomically on success, readable without locking.

pub mod validate;

use anyhow::{bail, Context, Result};
use arc_swap::ArcSwapOption;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::models::{DatasetMetadata, DateRange, DateRanges, ValidationResult};

/// Synthetic timeline base; row `i` is stamped `BASE + i days`.
fn timeline_base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// Header names that designate the sample identifier, in preference order.
const SAMPLE_ID_COLUMNS: &[&str] = &["Id", "ID", "SampleId"];

/// One ingested row: assigned timestamp plus raw column values.
#[derive(Debug, Clone)]
pub struct DataRecord {
    pub timestamp: DateTime<Utc>,
    pub values: HashMap<String, String>,
}

impl DataRecord {
    pub fn value(&self, column: &str) -> &str {
        self.values.get(column).map(String::as_str).unwrap_or("")
    }
}

/// The processed dataset: column order, resolved special columns, and the
/// record sequence in ascending timestamp order.
#[derive(Debug)]
pub struct TabularDataset {
    columns: Vec<String>,
    response_column: String,
    sample_id_column: String,
    records: Vec<DataRecord>,
}

impl TabularDataset {
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn response_column(&self) -> &str {
        &self.response_column
    }

    pub fn sample_id_column(&self) -> &str {
        &self.sample_id_column
    }

    pub fn records(&self) -> &[DataRecord] {
        &self.records
    }

    /// Records whose timestamp falls inside the window, both ends inclusive.
    pub fn records_in_window(&self, window: &DateRange) -> Vec<DataRecord> {
        self.records
            .iter()
            .filter(|r| r.timestamp >= window.start && r.timestamp <= window.end)
            .cloned()
            .collect()
    }

    /// Rows in wire form for the training request: source columns plus the
    /// synthetic timestamp column the ML service windows on.
    pub fn export_rows(&self) -> Vec<Map<String, Value>> {
        self.records
            .iter()
            .map(|record| {
                let mut row = Map::new();
                for column in &self.columns {
                    row.insert(
                        column.clone(),
                        Value::String(record.value(column).to_string()),
                    );
                }
                row.insert(
                    "synthetic_timestamp".to_string(),
                    Value::String(record.timestamp.to_rfc3339()),
                );
                row
            })
            .collect()
    }
}

/// A successfully validated partition plus the pre-computed record count the
/// engine will pace through.
#[derive(Debug, Clone)]
pub struct ValidatedPartition {
    pub ranges: DateRanges,
    pub simulation_record_count: u64,
}

/// The simulation window's slice of the dataset, resolved for one run.
pub struct SimulationSlice {
    pub dataset: Arc<TabularDataset>,
    pub window: DateRange,
    pub records: Vec<DataRecord>,
}

#[derive(Default)]
pub struct DatasetStore {
    metadata: ArcSwapOption<DatasetMetadata>,
    dataset: ArcSwapOption<TabularDataset>,
    partition: ArcSwapOption<ValidatedPartition>,
}

impl DatasetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process a parsed dataset: assign synthetic daily timestamps, tally the
    /// response column, and publish a fresh descriptor. Replaces any previous
    /// dataset wholesale.
    pub fn ingest(
        &self,
        name: &str,
        columns: &[String],
        rows: Vec<Map<String, Value>>,
    ) -> Result<DatasetMetadata> {
        if columns.is_empty() {
            bail!("Dataset has no columns");
        }
        if rows.is_empty() {
            bail!("Dataset is empty");
        }

        let response_column = columns
            .iter()
            .find(|c| c.eq_ignore_ascii_case("response"))
            .cloned()
            .context("Dataset must contain a 'Response' column")?;

        let sample_id_column = SAMPLE_ID_COLUMNS
            .iter()
            .find(|candidate| columns.iter().any(|c| c == *candidate))
            .map(|c| c.to_string())
            .unwrap_or_else(|| columns[0].clone());

        let base = timeline_base();
        let mut pass_count = 0u64;
        let mut records = Vec::with_capacity(rows.len());

        for (i, row) in rows.into_iter().enumerate() {
            let mut values = HashMap::with_capacity(columns.len());
            for column in columns {
                let value = row.get(column).map(value_to_string).unwrap_or_default();
                values.insert(column.clone(), value);
            }

            // Bosch convention for the response column: 0 = no defect = Pass.
            if values.get(&response_column).map(String::as_str) == Some("0") {
                pass_count += 1;
            }

            records.push(DataRecord {
                timestamp: base + Duration::days(i as i64),
                values,
            });
        }

        let record_count = records.len() as u64;
        let fail_count = record_count - pass_count;
        let metadata = DatasetMetadata {
            record_count,
            // +1 for the synthetic timestamp column added during processing.
            column_count: columns.len() as u64 + 1,
            start_date: base,
            end_date: base + Duration::days(record_count as i64 - 1),
            pass_rate: pass_count as f64 / record_count as f64,
            pass_count,
            fail_count,
            name: name.to_string(),
            ingested_at: Utc::now(),
        };

        self.dataset.store(Some(Arc::new(TabularDataset {
            columns: columns.to_vec(),
            response_column,
            sample_id_column,
            records,
        })));
        self.metadata.store(Some(Arc::new(metadata.clone())));

        info!(
            name = %metadata.name,
            records = metadata.record_count,
            columns = metadata.column_count,
            pass_rate = metadata.pass_rate,
            "dataset ingested"
        );

        Ok(metadata)
    }

    pub fn metadata(&self) -> Option<Arc<DatasetMetadata>> {
        self.metadata.load_full()
    }

    pub fn dataset(&self) -> Option<Arc<TabularDataset>> {
        self.dataset.load_full()
    }

    pub fn validated_partition(&self) -> Option<Arc<ValidatedPartition>> {
        self.partition.load_full()
    }

    /// Validate a proposed partition; on success it becomes the single active
    /// partition (overwriting the previous one) with its pre-computed
    /// simulation record count. A failed validation touches nothing.
    pub fn validate_and_store(&self, proposed: &DateRanges) -> ValidationResult {
        let Some(metadata) = self.metadata() else {
            return ValidationResult {
                is_valid: false,
                errors: vec!["No dataset has been uploaded yet".to_string()],
                message: None,
                data_distribution: None,
            };
        };

        let result = validate::validate_date_ranges(proposed, &metadata);
        if result.is_valid {
            let simulation_record_count = proposed.simulation.day_span().max(0) as u64;
            self.partition.store(Some(Arc::new(ValidatedPartition {
                ranges: *proposed,
                simulation_record_count,
            })));
            info!(
                simulation_records = simulation_record_count,
                "date ranges validated and stored"
            );
        }
        result
    }

    /// Resolve the simulation window's records for a run. Fails when no
    /// dataset has been ingested or no partition validated yet.
    pub fn simulation_records(&self) -> Result<SimulationSlice> {
        let dataset = self
            .dataset
            .load_full()
            .context("no processed dataset available")?;
        let partition = self
            .partition
            .load_full()
            .context("no validated date ranges available")?;

        let window = partition.ranges.simulation;
        let records = dataset.records_in_window(&window);
        Ok(SimulationSlice {
            dataset,
            window,
            records,
        })
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
