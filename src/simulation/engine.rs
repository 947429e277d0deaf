//! Simulation engine.
//!
//! Replays the simulation window as a throttled stream: one record per tick,
//! each scored by the prediction service, aggregated into the shared state,
//! and fanned out to subscribers. Exactly one run may be active; the run is
//! a detached task that outlives the request which started it and stops
//! cooperatively at iteration boundaries.

use anyhow::{bail, Result};
use serde_json::{Map, Value};
use std::{sync::Arc, time::Duration};
use tracing::{debug, error, info, warn};

use crate::{
    dataset::{DataRecord, DatasetStore, TabularDataset},
    hub::SimulationHub,
    ml::Predictor,
    models::{PredictionEvent, SimulationStatus, WsServerEvent},
    simulation::state::SharedSimulationState,
};

/// Feature keys carried in each prediction event.
const EVENT_FEATURE_LIMIT: usize = 5;

#[derive(Clone)]
pub struct SimulationEngine {
    datasets: Arc<DatasetStore>,
    predictor: Arc<dyn Predictor>,
    hub: Arc<SimulationHub>,
    state: Arc<SharedSimulationState>,
    tick: Duration,
}

impl SimulationEngine {
    pub fn new(
        datasets: Arc<DatasetStore>,
        predictor: Arc<dyn Predictor>,
        hub: Arc<SimulationHub>,
        state: Arc<SharedSimulationState>,
        tick: Duration,
    ) -> Self {
        Self {
            datasets,
            predictor,
            hub,
            state,
            tick,
        }
    }

    /// Validate the workflow preconditions and launch the pacing loop as a
    /// detached task. Rejection leaves the shared state untouched.
    pub fn start(&self) -> Result<()> {
        if self.datasets.metadata().is_none() {
            bail!("Step 1 incomplete: No dataset uploaded. Please upload a dataset first.");
        }
        let Some(partition) = self.datasets.validated_partition() else {
            bail!("Step 2 incomplete: Date ranges not validated. Please validate date ranges first.");
        };
        let expected_count = partition.simulation_record_count;
        if expected_count == 0 {
            bail!("Step 3 incomplete: No valid simulation data found. Please complete model training first.");
        }
        // Check-and-set: the not-running verification and the flip to running
        // happen in one critical section inside `begin_run`.
        if !self.state.begin_run(expected_count) {
            bail!("Simulation is already running. Please stop the current simulation before starting a new one.");
        }

        info!(expected_count, "simulation started; all prerequisites validated");

        let engine = self.clone();
        tokio::spawn(async move { engine.run(expected_count).await });
        Ok(())
    }

    /// Signal the pacing loop to stop at its next iteration boundary.
    pub fn stop(&self) {
        self.state.stop();
        info!("simulation stopped");
    }

    /// Discard the whole simulation state, halting any active loop.
    pub fn reset(&self) {
        self.state.reset();
        self.hub.clear_recent();
        info!("simulation state reset");
    }

    pub fn status(&self) -> SimulationStatus {
        self.state.snapshot()
    }

    async fn run(&self, expected_count: u64) {
        let slice = match self.datasets.simulation_records() {
            Ok(slice) => slice,
            Err(e) => {
                error!(error = %e, "record source unavailable; aborting run");
                self.state.stop();
                return;
            }
        };
        if slice.records.is_empty() {
            warn!("no simulation data available for the selected date range");
            self.state.stop();
            return;
        }

        let window_start = slice.window.start;
        info!(
            records = slice.records.len(),
            start = %window_start,
            "starting pacing loop"
        );

        let mut confidence_sum = 0.0f64;

        for (record_index, record) in slice.records.iter().take(expected_count as usize).enumerate()
        {
            if !self.state.is_running() {
                break;
            }
            // Policy: a run nobody observes is cancelled rather than completed
            // headless.
            if self.hub.active_subscribers() == 0 {
                info!("no subscribers connected; stopping simulation automatically");
                self.state.stop();
                break;
            }

            // Contiguous one-per-day progression regardless of source gaps:
            // the emitted date is assigned from the window start, not taken
            // from the record.
            let simulation_timestamp = window_start + chrono::Duration::days(record_index as i64);
            let features = prediction_features(&slice.dataset, record);

            match self.predictor.predict(&features).await {
                Ok(prediction) => {
                    confidence_sum += prediction.confidence;
                    let status = self
                        .state
                        .record_prediction(prediction.label.is_pass(), confidence_sum);

                    let event = PredictionEvent {
                        sample_id: sample_id(&slice.dataset, record),
                        timestamp: simulation_timestamp.to_rfc3339(),
                        prediction: prediction.label,
                        confidence: prediction.confidence,
                        actual_response: record
                            .values
                            .get(slice.dataset.response_column())
                            .cloned(),
                        features: event_features(&features),
                    };

                    debug!(
                        index = record_index,
                        sample_id = %event.sample_id,
                        date = %simulation_timestamp.format("%Y-%m-%d"),
                        prediction = prediction.label.as_str(),
                        confidence = prediction.confidence,
                        "record processed"
                    );

                    // Fixed order within a step: the prediction, then the
                    // status snapshot it produced.
                    self.hub.publish(WsServerEvent::PredictionUpdate(event));
                    self.hub.publish(WsServerEvent::StatusUpdate(status));
                }
                Err(e) => {
                    // One bad record never aborts the run; the date cursor
                    // still advances with the loop index.
                    warn!(
                        index = record_index,
                        error = %e,
                        "prediction failed; continuing with next record"
                    );
                }
            }

            tokio::time::sleep(self.tick).await;
        }

        self.state.stop();
        let final_status = self.state.snapshot();
        info!(
            total = final_status.total_predictions,
            expected = expected_count,
            "simulation run finished"
        );
    }
}

/// Build the predictor input: every column except the sample identifier, the
/// ground-truth response, and environmental telemetry, with numeric-looking
/// values sent as numbers.
fn prediction_features(dataset: &TabularDataset, record: &DataRecord) -> Map<String, Value> {
    let mut features = Map::new();
    for column in dataset.columns() {
        if column == dataset.response_column()
            || column == dataset.sample_id_column()
            || is_environmental(column)
        {
            continue;
        }
        let raw = record.value(column);
        let value = match raw.parse::<f64>() {
            Ok(n) => serde_json::Number::from_f64(n)
                .map(Value::Number)
                .unwrap_or_else(|| Value::String(raw.to_string())),
            Err(_) => Value::String(raw.to_string()),
        };
        features.insert(column.clone(), value);
    }
    features
}

fn is_environmental(column: &str) -> bool {
    let column = column.to_ascii_lowercase();
    column.contains("temperature") || column.contains("humidity") || column.contains("pressure")
}

/// Bounded feature subset carried in the broadcast event.
fn event_features(features: &Map<String, Value>) -> Map<String, Value> {
    features
        .iter()
        .take(EVENT_FEATURE_LIMIT)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn sample_id(dataset: &TabularDataset, record: &DataRecord) -> String {
    let id = record.value(dataset.sample_id_column());
    if id.is_empty() {
        "Unknown".to_string()
    } else {
        id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::Prediction;
    use crate::models::{DateRange, DateRanges, PredictionLabel};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubPredictor {
        calls: AtomicUsize,
        fail_on_call: Option<usize>,
        label: PredictionLabel,
        confidence: f64,
    }

    impl StubPredictor {
        fn passing(confidence: f64) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_on_call: None,
                label: PredictionLabel::Pass,
                confidence,
            }
        }
    }

    #[async_trait]
    impl Predictor for StubPredictor {
        async fn predict(&self, _features: &Map<String, Value>) -> Result<Prediction> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_on_call == Some(call) {
                bail!("stub prediction failure");
            }
            Ok(Prediction {
                label: self.label,
                confidence: self.confidence,
            })
        }
    }

    fn utc(d: u32) -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap()
    }

    /// Store with a 10-day dataset and a validated partition whose simulation
    /// window spans 5 days (expected count 5).
    fn prepared_store() -> Arc<DatasetStore> {
        let store = Arc::new(DatasetStore::new());
        let columns: Vec<String> = ["Id", "sensor_a", "Temperature", "Response"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let rows = (0..10)
            .map(|i| {
                let mut row = Map::new();
                row.insert("Id".into(), Value::String(format!("S{i}")));
                row.insert("sensor_a".into(), Value::from(i as f64));
                row.insert("Temperature".into(), Value::from(21.5));
                row.insert(
                    "Response".into(),
                    Value::String(if i % 2 == 0 { "0" } else { "1" }.to_string()),
                );
                row
            })
            .collect();
        store.ingest("line.csv", &columns, rows).unwrap();

        let ranges = DateRanges {
            training: DateRange { start: utc(1), end: utc(3) },
            testing: DateRange { start: utc(3), end: utc(5) },
            simulation: DateRange { start: utc(5), end: utc(10) },
        };
        let result = store.validate_and_store(&ranges);
        assert!(result.is_valid, "errors: {:?}", result.errors);
        store
    }

    fn engine_with(
        store: Arc<DatasetStore>,
        predictor: Arc<dyn Predictor>,
        hub: Arc<SimulationHub>,
    ) -> Arc<SimulationEngine> {
        Arc::new(SimulationEngine::new(
            store,
            predictor,
            hub,
            Arc::new(SharedSimulationState::new()),
            Duration::from_millis(1),
        ))
    }

    async fn wait_until_stopped(engine: &SimulationEngine) -> SimulationStatus {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if !engine.status().is_running {
                    return engine.status();
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("run did not finish in time")
    }

    #[tokio::test]
    async fn test_full_run_aggregates_all_records() {
        let store = prepared_store();
        let hub = Arc::new(SimulationHub::new(64));
        let _subscription = hub.join();
        let engine = engine_with(store, Arc::new(StubPredictor::passing(1.0)), hub);

        engine.start().unwrap();
        let status = wait_until_stopped(&engine).await;

        assert_eq!(status.total_predictions, 5);
        assert_eq!(status.pass_count, 5);
        assert_eq!(status.fail_count, 0);
        assert!((status.average_confidence - 1.0).abs() < 1e-9);
        assert_eq!(status.expected_count, Some(5));
    }

    #[tokio::test]
    async fn test_events_carry_assigned_dates_in_order() {
        let store = prepared_store();
        let hub = Arc::new(SimulationHub::new(64));
        let mut subscription = hub.join();
        let engine = engine_with(store, Arc::new(StubPredictor::passing(0.9)), hub.clone());

        engine.start().unwrap();
        wait_until_stopped(&engine).await;

        // Events alternate prediction/status; the prediction dates progress
        // one day per record from the simulation window start.
        let mut dates = Vec::new();
        while let Ok(event) = subscription.rx.try_recv() {
            if let WsServerEvent::PredictionUpdate(prediction) = event {
                dates.push(prediction.timestamp);
            }
        }
        assert_eq!(dates.len(), 5);
        assert!(dates[0].starts_with("2024-01-05"));
        assert!(dates[4].starts_with("2024-01-09"));
        assert!(dates.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_second_start_is_rejected_while_running() {
        let store = prepared_store();
        let hub = Arc::new(SimulationHub::new(64));
        let _subscription = hub.join();
        let engine = Arc::new(SimulationEngine::new(
            store,
            Arc::new(StubPredictor::passing(0.8)),
            hub,
            Arc::new(SharedSimulationState::new()),
            Duration::from_millis(50),
        ));

        engine.start().unwrap();
        let err = engine.start().unwrap_err();
        assert!(err.to_string().contains("already running"));

        engine.stop();
        wait_until_stopped(&engine).await;
    }

    #[tokio::test]
    async fn test_start_preconditions_are_ordered() {
        let hub = Arc::new(SimulationHub::new(64));
        let empty = Arc::new(DatasetStore::new());
        let engine = engine_with(empty, Arc::new(StubPredictor::passing(0.8)), hub.clone());
        let err = engine.start().unwrap_err();
        assert!(err.to_string().contains("Step 1 incomplete"));

        let store = Arc::new(DatasetStore::new());
        let columns: Vec<String> = ["Id", "Response"].iter().map(|s| s.to_string()).collect();
        let rows = vec![{
            let mut row = Map::new();
            row.insert("Id".into(), Value::String("S0".into()));
            row.insert("Response".into(), Value::String("0".into()));
            row
        }];
        store.ingest("tiny.csv", &columns, rows).unwrap();
        let engine = engine_with(store, Arc::new(StubPredictor::passing(0.8)), hub);
        let err = engine.start().unwrap_err();
        assert!(err.to_string().contains("Step 2 incomplete"));
    }

    #[tokio::test]
    async fn test_auto_stop_without_subscribers() {
        let store = prepared_store();
        let hub = Arc::new(SimulationHub::new(64));
        // Nobody joins: the loop must halt before processing any record.
        let engine = engine_with(store, Arc::new(StubPredictor::passing(0.9)), hub);

        engine.start().unwrap();
        let status = wait_until_stopped(&engine).await;
        assert_eq!(status.total_predictions, 0);
        assert!(!status.is_running);
    }

    #[tokio::test]
    async fn test_auto_stop_when_last_subscriber_leaves_mid_run() {
        let store = prepared_store();
        let hub = Arc::new(SimulationHub::new(64));
        let subscription = hub.join();
        let engine = Arc::new(SimulationEngine::new(
            store,
            Arc::new(StubPredictor::passing(0.9)),
            hub.clone(),
            Arc::new(SharedSimulationState::new()),
            Duration::from_millis(50),
        ));

        engine.start().unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while engine.status().total_predictions == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("no record processed in time");
        hub.leave(subscription.id);

        let status = wait_until_stopped(&engine).await;
        assert!(!status.is_running);
        assert!(status.total_predictions < 5, "run must halt before completing");
    }

    #[tokio::test]
    async fn test_prediction_failure_is_isolated() {
        let store = prepared_store();
        let hub = Arc::new(SimulationHub::new(64));
        let _subscription = hub.join();
        let predictor = Arc::new(StubPredictor {
            calls: AtomicUsize::new(0),
            fail_on_call: Some(1),
            label: PredictionLabel::Fail,
            confidence: 0.5,
        });
        let engine = engine_with(store, predictor, hub);

        engine.start().unwrap();
        let status = wait_until_stopped(&engine).await;

        // The second record failed; the other four were still processed.
        assert_eq!(status.total_predictions, 4);
        assert_eq!(status.fail_count, 4);
        assert!((status.average_confidence - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_reset_mid_run_discards_state() {
        let store = prepared_store();
        let hub = Arc::new(SimulationHub::new(64));
        let _subscription = hub.join();
        let engine = Arc::new(SimulationEngine::new(
            store,
            Arc::new(StubPredictor::passing(0.7)),
            hub,
            Arc::new(SharedSimulationState::new()),
            Duration::from_millis(20),
        ));

        engine.start().unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        engine.reset();

        let status = wait_until_stopped(&engine).await;
        assert_eq!(status.expected_count, None);
        assert_eq!(status.total_predictions, 0);
    }

    #[test]
    fn test_prediction_features_exclude_admin_columns() {
        let store = prepared_store();
        let dataset = store.dataset().unwrap();
        let record = &dataset.records()[0];

        let features = prediction_features(&dataset, record);
        assert!(!features.contains_key("Id"));
        assert!(features.contains_key("sensor_a"));
        assert!(!features.contains_key("Response"));
        assert!(!features.contains_key("Temperature"));
        assert!(features["sensor_a"].is_number());
    }
}
