//! Shared simulation state.
//!
//! The one piece of mutable shared state in the process. Every read is a
//! snapshot copy taken under the lock; every write is a whole transition
//! inside one critical section, so callers never observe torn state and two
//! overlapping Start calls cannot both win the not-running check.

use parking_lot::Mutex;

use crate::models::SimulationStatus;

#[derive(Default)]
pub struct SharedSimulationState {
    inner: Mutex<SimulationStatus>,
}

impl SharedSimulationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot copy under the lock; never blocks on the pacing loop.
    pub fn snapshot(&self) -> SimulationStatus {
        self.inner.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().is_running
    }

    /// Single-flight check-and-set: verifies not-running and flips to running
    /// with fresh counters in one indivisible critical section. Returns false
    /// when a run is already active.
    pub fn begin_run(&self, expected_count: u64) -> bool {
        let mut status = self.inner.lock();
        if status.is_running {
            return false;
        }
        *status = SimulationStatus {
            is_running: true,
            expected_count: Some(expected_count),
            ..Default::default()
        };
        true
    }

    /// Clears the running flag; idempotent. The pacing loop observes this at
    /// its next iteration boundary (cooperative cancellation).
    pub fn stop(&self) {
        self.inner.lock().is_running = false;
    }

    /// Replaces the whole state with the quiesced default. Callable mid-run:
    /// clearing the running flag signals the loop exactly like `stop`.
    pub fn reset(&self) {
        *self.inner.lock() = SimulationStatus::default();
    }

    /// Applies one successful prediction. `confidence_sum` is the caller's
    /// running double-precision sum including the new sample, so the average
    /// never compounds rounding error. Returns the post-update snapshot.
    pub fn record_prediction(&self, passed: bool, confidence_sum: f64) -> SimulationStatus {
        let mut status = self.inner.lock();
        status.total_predictions += 1;
        if passed {
            status.pass_count += 1;
        } else {
            status.fail_count += 1;
        }
        status.average_confidence = confidence_sum / status.total_predictions as f64;
        status.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_begin_run_is_single_flight() {
        let state = SharedSimulationState::new();
        assert!(state.begin_run(5));
        assert!(!state.begin_run(5), "second start must lose the check-and-set");

        let status = state.snapshot();
        assert!(status.is_running);
        assert_eq!(status.expected_count, Some(5));
        assert_eq!(status.total_predictions, 0);
    }

    #[test]
    fn test_concurrent_starts_have_one_winner() {
        let state = Arc::new(SharedSimulationState::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let state = Arc::clone(&state);
                std::thread::spawn(move || state.begin_run(3))
            })
            .collect();

        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&w| w)
            .count();
        assert_eq!(wins, 1);
    }

    #[test]
    fn test_reset_is_idempotent() {
        let state = SharedSimulationState::new();
        assert!(state.begin_run(10));
        state.record_prediction(true, 0.9);

        state.reset();
        let once = state.snapshot();
        state.reset();
        let twice = state.snapshot();

        assert!(!once.is_running);
        assert_eq!(once.total_predictions, 0);
        assert_eq!(once.expected_count, None);
        assert_eq!(format!("{once:?}"), format!("{twice:?}"));
    }

    #[test]
    fn test_stop_is_idempotent_and_preserves_counters() {
        let state = SharedSimulationState::new();
        assert!(state.begin_run(2));
        state.record_prediction(false, 0.4);

        state.stop();
        state.stop();

        let status = state.snapshot();
        assert!(!status.is_running);
        assert_eq!(status.total_predictions, 1);
        assert_eq!(status.fail_count, 1);
    }

    #[test]
    fn test_running_mean_matches_true_mean() {
        let state = SharedSimulationState::new();
        assert!(state.begin_run(100));

        let confidences = [0.1, 0.735, 0.9999, 0.42, 0.88, 0.3333333];
        let mut sum = 0.0f64;
        for (i, c) in confidences.iter().enumerate() {
            sum += c;
            let status = state.record_prediction(true, sum);
            let expected = confidences[..=i].iter().sum::<f64>() / (i + 1) as f64;
            assert!(
                (status.average_confidence - expected).abs() < 1e-9,
                "after {} samples: {} vs {}",
                i + 1,
                status.average_confidence,
                expected
            );
        }
    }
}
