//! Date-range validation and partitioning.
//!
//! Pure functions: given a proposed training/testing/simulation partition and
//! the descriptor of the ingested dataset, either reject it with the full
//! list of violated rules or accept it and report the day-granularity
//! distribution across calendar months. The simulation window's day span is
//! what the engine later uses as its expected record count.

use chrono::{Datelike, Days, NaiveDate};
use std::collections::BTreeMap;

use crate::models::{
    DataDistribution, DatasetMetadata, DateRange, DateRanges, MonthlyData, ValidationResult,
};

#[derive(Clone, Copy)]
enum WindowKind {
    Training,
    Testing,
    Simulation,
}

/// Validate a proposed partition against the dataset bounds.
///
/// All rules are checked; every violation lands in `errors` so the caller can
/// fix them in one round trip. Rules, in order: each window start strictly
/// before its end, the partition inside the dataset bounds, and the three
/// windows contiguous with zero gap or overlap.
pub fn validate_date_ranges(
    proposed: &DateRanges,
    dataset: &DatasetMetadata,
) -> ValidationResult {
    let mut errors = Vec::new();

    if proposed.training.start >= proposed.training.end {
        errors.push("Training start date must be before end date".to_string());
    }
    if proposed.testing.start >= proposed.testing.end {
        errors.push("Testing start date must be before end date".to_string());
    }
    if proposed.simulation.start >= proposed.simulation.end {
        errors.push("Simulation start date must be before end date".to_string());
    }

    if proposed.training.start < dataset.start_date {
        errors.push(format!(
            "Training start date cannot be before dataset start date ({})",
            dataset.start_date.format("%Y-%m-%d")
        ));
    }
    if proposed.simulation.end > dataset.end_date {
        errors.push(format!(
            "Simulation end date cannot be after dataset end date ({})",
            dataset.end_date.format("%Y-%m-%d")
        ));
    }

    if proposed.training.end != proposed.testing.start {
        errors.push(
            "Testing period must start immediately after training period ends (no gaps or overlaps)"
                .to_string(),
        );
    }
    if proposed.testing.end != proposed.simulation.start {
        errors.push(
            "Simulation period must start immediately after testing period ends (no gaps or overlaps)"
                .to_string(),
        );
    }

    if !errors.is_empty() {
        return ValidationResult {
            is_valid: false,
            errors,
            message: None,
            data_distribution: None,
        };
    }

    ValidationResult {
        is_valid: true,
        errors: Vec::new(),
        message: Some("Date ranges are valid and continuous".to_string()),
        data_distribution: Some(build_distribution(proposed)),
    }
}

/// Day-granularity distribution: one synthetic record per calendar day, so
/// per-window record counts equal inclusive day counts, and each day
/// increments its (year, month) bucket.
fn build_distribution(ranges: &DateRanges) -> DataDistribution {
    let mut buckets: BTreeMap<String, MonthlyData> = BTreeMap::new();

    add_window_days(&mut buckets, &ranges.training, WindowKind::Training);
    add_window_days(&mut buckets, &ranges.testing, WindowKind::Testing);
    add_window_days(&mut buckets, &ranges.simulation, WindowKind::Simulation);

    DataDistribution {
        training_records: ranges.training.days_inclusive().max(0) as u64,
        testing_records: ranges.testing.days_inclusive().max(0) as u64,
        simulation_records: ranges.simulation.days_inclusive().max(0) as u64,
        // BTreeMap iteration is already ascending by the "YYYY-MM" key.
        monthly_distribution: buckets.into_values().collect(),
    }
}

fn add_window_days(
    buckets: &mut BTreeMap<String, MonthlyData>,
    window: &DateRange,
    kind: WindowKind,
) {
    let mut day = window.start.date_naive();
    let last = window.end.date_naive();

    while day <= last {
        let bucket = buckets
            .entry(month_key(&day))
            .or_insert_with(|| MonthlyData {
                month: month_key(&day),
                month_name: day.format("%b %Y").to_string(),
                training_count: 0,
                testing_count: 0,
                simulation_count: 0,
                total_count: 0,
            });

        match kind {
            WindowKind::Training => bucket.training_count += 1,
            WindowKind::Testing => bucket.testing_count += 1,
            WindowKind::Simulation => bucket.simulation_count += 1,
        }
        bucket.total_count += 1;

        day = day + Days::new(1);
    }
}

fn month_key(day: &NaiveDate) -> String {
    format!("{:04}-{:02}", day.year(), day.month())
}
