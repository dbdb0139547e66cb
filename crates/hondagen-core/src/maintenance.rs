use std::collections::BTreeMap;

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::schedule::{Interval, Schedule, ServiceItem, ServiceKind};

/// Slack allowed when recording a completion below the known runtime
/// hours, to absorb meter rounding.
pub const HISTORY_TOLERANCE_HOURS: f64 = 0.5;

/// Per-item service history. Persisted by the caller, written through
/// by the tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub last_service_hours: f64,
    pub last_service_date: NaiveDate,
    pub completed_once: bool,
}

impl ServiceRecord {
    fn first_seen(date: NaiveDate) -> Self {
        Self {
            last_service_hours: 0.0,
            last_service_date: date,
            completed_once: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalSource {
    BreakIn,
    Regular,
}

/// Derived due state. Recomputed on every snapshot update, never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceDueState {
    pub kind: ServiceKind,
    pub label: &'static str,
    pub due: bool,
    /// Negative means overdue by that many hours.
    pub hours_remaining: Option<f64>,
    /// Negative means overdue by that many days.
    pub days_remaining: Option<i64>,
    pub estimated_due_date: Option<NaiveDate>,
    /// Hours per day since the last service.
    pub usage_rate: f64,
    pub interval_source: IntervalSource,
    pub dealer_service: bool,
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("completion at {at_hours}h is below known runtime hours {known_hours}h")]
    HistoryRegression { at_hours: f64, known_hours: f64 },
    #[error("service item {0:?} is not in this model's schedule")]
    UnknownServiceItem(ServiceKind),
    #[error("no device identified yet")]
    DeviceUnknown,
}

/// Pure due-state computation for a single item. Due when any defined
/// remaining value reaches zero, whichever threshold arrives first.
pub fn evaluate(
    item: &ServiceItem,
    record: &ServiceRecord,
    current_hours: f64,
    today: NaiveDate,
) -> ServiceDueState {
    let (interval, source) = effective_interval(item, record);

    let hours_remaining = interval
        .hours
        .map(|h| record.last_service_hours + h - current_hours);
    let due_by_days = interval
        .days
        .and_then(|d| record.last_service_date.checked_add_days(Days::new(d.into())));
    let days_remaining = due_by_days.map(|d| (d - today).num_days());

    let due = hours_remaining.is_some_and(|h| h <= 0.0)
        || days_remaining.is_some_and(|d| d <= 0);

    let days_since = (today - record.last_service_date).num_days().max(1);
    let usage_rate = (current_hours - record.last_service_hours).max(0.0) / days_since as f64;

    let estimated_due_date = match hours_remaining {
        Some(h) if usage_rate > 0.0 => {
            let offset = (h / usage_rate).ceil() as i64;
            today.checked_add_signed(chrono::Duration::days(offset))
        }
        _ => due_by_days,
    };

    ServiceDueState {
        kind: item.kind,
        label: item.kind.label(),
        due,
        hours_remaining,
        days_remaining,
        estimated_due_date,
        usage_rate,
        interval_source: source,
        dealer_service: item.dealer_service,
    }
}

fn effective_interval(item: &ServiceItem, record: &ServiceRecord) -> (Interval, IntervalSource) {
    match item.break_in {
        Some(break_in) if !record.completed_once => (break_in, IntervalSource::BreakIn),
        _ => (item.interval, IntervalSource::Regular),
    }
}

/// Owns the service record table for one device. Holds no session
/// resources; evaluation is re-entrant and runs on every snapshot.
#[derive(Debug)]
pub struct MaintenanceTracker {
    schedule: Schedule,
    records: BTreeMap<ServiceKind, ServiceRecord>,
    /// Runtime-hour high-water mark across all observations.
    observed_hours: Option<f64>,
    first_seen: Option<NaiveDate>,
}

impl MaintenanceTracker {
    pub fn new(schedule: Schedule) -> Self {
        Self {
            schedule,
            records: BTreeMap::new(),
            observed_hours: None,
            first_seen: None,
        }
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn observed_hours(&self) -> Option<f64> {
        self.observed_hours
    }

    pub fn first_seen(&self) -> Option<NaiveDate> {
        self.first_seen
    }

    /// Feed one runtime-hours reading. Initialises missing records with
    /// first-seen defaults so intervals start counting from the first
    /// sighting of the generator.
    pub fn observe(&mut self, runtime_hours: f64, today: NaiveDate) {
        if self.first_seen.is_none() {
            self.first_seen = Some(today);
            info!(runtime_hours, %today, "first runtime hours observation");
        }
        let high_water = self.observed_hours.get_or_insert(runtime_hours);
        if runtime_hours > *high_water {
            *high_water = runtime_hours;
        } else if runtime_hours < *high_water {
            // Hour meters do not run backwards; keep the floor.
            debug!(
                runtime_hours,
                high_water = *high_water,
                "hour meter regression, keeping high-water mark"
            );
        }
        for item in self.schedule.items() {
            self.records
                .entry(item.kind)
                .or_insert_with(|| ServiceRecord::first_seen(today));
        }
    }

    pub fn evaluate_all(&self, today: NaiveDate) -> Vec<ServiceDueState> {
        let current_hours = self.observed_hours.unwrap_or(0.0);
        self.schedule
            .items()
            .iter()
            .map(|item| {
                let fallback = ServiceRecord::first_seen(self.first_seen.unwrap_or(today));
                let record = self.records.get(&item.kind).unwrap_or(&fallback);
                evaluate(item, record, current_hours, today)
            })
            .collect()
    }

    pub fn record(&self, kind: ServiceKind) -> Option<&ServiceRecord> {
        self.records.get(&kind)
    }

    /// Record a completed service. Rejects hours below the known runtime
    /// high-water mark (minus tolerance) so bogus history cannot be
    /// written through; prior state is left untouched on rejection.
    pub fn mark_complete(
        &mut self,
        kind: ServiceKind,
        at_hours: f64,
        at_date: NaiveDate,
    ) -> Result<(), ValidationError> {
        if self.schedule.item(kind).is_none() {
            return Err(ValidationError::UnknownServiceItem(kind));
        }
        if let Some(known) = self.observed_hours {
            if at_hours < known - HISTORY_TOLERANCE_HOURS {
                return Err(ValidationError::HistoryRegression {
                    at_hours,
                    known_hours: known,
                });
            }
        }
        self.write_record(kind, at_hours, at_date);
        info!(?kind, at_hours, %at_date, "service marked complete");
        Ok(())
    }

    /// Unchecked import variant for callers restoring historical records.
    pub fn import_record(
        &mut self,
        kind: ServiceKind,
        at_hours: f64,
        at_date: NaiveDate,
    ) -> Result<(), ValidationError> {
        if self.schedule.item(kind).is_none() {
            return Err(ValidationError::UnknownServiceItem(kind));
        }
        self.write_record(kind, at_hours, at_date);
        debug!(?kind, at_hours, %at_date, "service record imported");
        Ok(())
    }

    fn write_record(&mut self, kind: ServiceKind, at_hours: f64, at_date: NaiveDate) {
        let high_water = self.observed_hours.get_or_insert(at_hours);
        if at_hours > *high_water {
            *high_water = at_hours;
        }
        self.records.insert(
            kind,
            ServiceRecord {
                last_service_hours: at_hours,
                last_service_date: at_date,
                completed_once: true,
            },
        );
    }

    /// Current record table, for write-through persistence.
    pub fn records(&self) -> &BTreeMap<ServiceKind, ServiceRecord> {
        &self.records
    }

    /// Restore a previously persisted record table.
    pub fn load_records(&mut self, records: BTreeMap<ServiceKind, ServiceRecord>) {
        for record in records.values() {
            let high_water = self.observed_hours.get_or_insert(record.last_service_hours);
            if record.last_service_hours > *high_water {
                *high_water = record.last_service_hours;
            }
        }
        self.records = records;
    }

    pub fn load_observed_hours(&mut self, hours: f64, seen: NaiveDate) {
        let high_water = self.observed_hours.get_or_insert(hours);
        if hours > *high_water {
            *high_water = hours;
        }
        if self.first_seen.is_none() {
            self.first_seen = Some(seen);
        }
    }
}

#[cfg(test)]
#[path = "maintenance_tests.rs"]
mod maintenance_tests;
