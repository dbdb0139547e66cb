use chrono::NaiveDate;
use rand::{Rng, SeedableRng};

use super::*;
use crate::model::Model;
use crate::schedule::{Interval, Schedule, ScheduleError, ServiceItem, ServiceKind};

fn day(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn find(states: &[ServiceDueState], kind: ServiceKind) -> &ServiceDueState {
    states.iter().find(|s| s.kind == kind).unwrap()
}

#[test]
fn oil_change_break_in_then_regular() {
    let t0 = day(2026, 3, 1);
    let mut tracker = MaintenanceTracker::new(Schedule::for_model(Model::Eu2200i));
    tracker.observe(0.0, t0);

    // Five days and 21 hours into the break-in window the 20 h
    // threshold is already crossed.
    let t5 = day(2026, 3, 6);
    tracker.observe(21.0, t5);
    let states = tracker.evaluate_all(t5);
    let oil = find(&states, ServiceKind::OilChange);
    assert!(oil.due);
    assert_eq!(oil.interval_source, IntervalSource::BreakIn);
    assert_eq!(oil.hours_remaining, Some(-1.0));
    assert_eq!(oil.days_remaining, Some(25));
    assert!((oil.usage_rate - 4.2).abs() < 1e-9);

    // Completing it switches the item to the regular interval.
    tracker.mark_complete(ServiceKind::OilChange, 21.0, t5).unwrap();
    let states = tracker.evaluate_all(t5);
    let oil = find(&states, ServiceKind::OilChange);
    assert!(!oil.due);
    assert_eq!(oil.interval_source, IntervalSource::Regular);
    assert_eq!(oil.hours_remaining, Some(100.0));
    assert_eq!(oil.days_remaining, Some(180));
}

#[test]
fn due_when_either_threshold_hits_first() {
    let t0 = day(2026, 1, 1);
    let mut tracker = MaintenanceTracker::new(Schedule::for_model(Model::Eu2200i));
    tracker.observe(0.0, t0);
    tracker.mark_complete(ServiceKind::AirFilterClean, 0.0, t0).unwrap();

    // Barely any engine hours, but 91 calendar days past a 90-day item.
    tracker.observe(2.0, day(2026, 4, 2));
    let states = tracker.evaluate_all(day(2026, 4, 2));
    let filter = find(&states, ServiceKind::AirFilterClean);
    assert!(filter.due);
    assert_eq!(filter.days_remaining, Some(-1));
    assert_eq!(filter.hours_remaining, Some(48.0));
}

#[test]
fn threshold_tie_counts_as_due() {
    let item = ServiceItem {
        kind: ServiceKind::SparkPlugCheck,
        interval: Interval::new(Some(100.0), None),
        break_in: None,
        dealer_service: false,
    };
    let record = ServiceRecord {
        last_service_hours: 0.0,
        last_service_date: day(2026, 1, 1),
        completed_once: true,
    };
    let state = evaluate(&item, &record, 100.0, day(2026, 2, 1));
    assert_eq!(state.hours_remaining, Some(0.0));
    assert!(state.due);
}

#[test]
fn estimated_due_date_extrapolates_usage() {
    let item = ServiceItem {
        kind: ServiceKind::OilChange,
        interval: Interval::new(Some(100.0), Some(180)),
        break_in: None,
        dealer_service: false,
    };
    let record = ServiceRecord {
        last_service_hours: 0.0,
        last_service_date: day(2026, 5, 1),
        completed_once: true,
    };
    // 50 h in 10 days = 5 h/day; 50 h left = 10 more days.
    let state = evaluate(&item, &record, 50.0, day(2026, 5, 11));
    assert!((state.usage_rate - 5.0).abs() < 1e-9);
    assert_eq!(state.estimated_due_date, Some(day(2026, 5, 21)));
}

#[test]
fn idle_generator_estimate_falls_back_to_date_threshold() {
    let item = ServiceItem {
        kind: ServiceKind::OilChange,
        interval: Interval::new(Some(100.0), Some(180)),
        break_in: None,
        dealer_service: false,
    };
    let record = ServiceRecord {
        last_service_hours: 10.0,
        last_service_date: day(2026, 5, 1),
        completed_once: true,
    };
    let state = evaluate(&item, &record, 10.0, day(2026, 5, 11));
    assert_eq!(state.usage_rate, 0.0);
    assert_eq!(state.estimated_due_date, Some(day(2026, 10, 28)));
}

#[test]
fn mark_complete_rejects_hour_regression() {
    let t0 = day(2026, 6, 1);
    let mut tracker = MaintenanceTracker::new(Schedule::for_model(Model::Eu2200i));
    tracker.observe(50.0, t0);

    match tracker.mark_complete(ServiceKind::OilChange, 40.0, t0) {
        Err(ValidationError::HistoryRegression {
            at_hours,
            known_hours,
        }) => {
            assert_eq!(at_hours, 40.0);
            assert_eq!(known_hours, 50.0);
        }
        other => panic!("expected regression error, got {other:?}"),
    }
    // The rejected write left the record untouched.
    assert!(!tracker.record(ServiceKind::OilChange).unwrap().completed_once);

    // Within meter-rounding tolerance it is accepted.
    tracker.mark_complete(ServiceKind::OilChange, 49.6, t0).unwrap();
    assert!(tracker.record(ServiceKind::OilChange).unwrap().completed_once);
}

#[test]
fn import_record_bypasses_regression_check() {
    let t0 = day(2026, 6, 1);
    let mut tracker = MaintenanceTracker::new(Schedule::for_model(Model::Eu2200i));
    tracker.observe(50.0, t0);

    tracker
        .import_record(ServiceKind::OilChange, 10.0, day(2025, 12, 1))
        .unwrap();
    let record = tracker.record(ServiceKind::OilChange).unwrap();
    assert_eq!(record.last_service_hours, 10.0);
    assert!(record.completed_once);
}

#[test]
fn unknown_item_is_rejected() {
    let mut tracker = MaintenanceTracker::new(Schedule::for_model(Model::Eu2200i));
    // The EU2200i schedule has no timing belt.
    match tracker.mark_complete(ServiceKind::TimingBelt, 10.0, day(2026, 1, 1)) {
        Err(ValidationError::UnknownServiceItem(ServiceKind::TimingBelt)) => {}
        other => panic!("expected unknown item error, got {other:?}"),
    }
}

#[test]
fn observed_hours_track_the_high_water_mark() {
    let mut tracker = MaintenanceTracker::new(Schedule::for_model(Model::Eu3200i));
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    let mut max_seen = 0.0f64;
    let t0 = day(2026, 1, 1);

    for _ in 0..1000 {
        // Noisy readings, including regressions from corrupt transfers.
        let reading = rng.gen_range(0.0..200.0);
        max_seen = max_seen.max(reading);
        tracker.observe(reading, t0);
        assert_eq!(tracker.observed_hours(), Some(max_seen));
    }
}

#[test]
fn record_table_round_trips() {
    let t0 = day(2026, 2, 1);
    let mut tracker = MaintenanceTracker::new(Schedule::for_model(Model::Em5000sx));
    tracker.observe(30.0, t0);
    tracker.mark_complete(ServiceKind::OilChange, 30.0, t0).unwrap();
    let saved = tracker.records().clone();

    let mut restored = MaintenanceTracker::new(Schedule::for_model(Model::Em5000sx));
    restored.load_records(saved);
    let record = restored.record(ServiceKind::OilChange).unwrap();
    assert_eq!(record.last_service_hours, 30.0);
    assert!(record.completed_once);
    // Loading history also raises the hour floor.
    assert_eq!(restored.observed_hours(), Some(30.0));
}

#[test]
fn schedule_rejects_empty_interval() {
    let items = vec![ServiceItem {
        kind: ServiceKind::FuelSystemCheck,
        interval: Interval::new(None, None),
        break_in: None,
        dealer_service: true,
    }];
    assert_eq!(
        Schedule::new(items).unwrap_err(),
        ScheduleError::UndefinedInterval(ServiceKind::FuelSystemCheck)
    );
}
