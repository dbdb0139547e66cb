use std::time::Duration;

use chrono::{NaiveDate, Utc};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use std::collections::BTreeMap;

use crate::codec::CommandKind;
use crate::config::SupervisorConfig;
use crate::driver::{DriverError, GeneratorDriver};
use crate::maintenance::{MaintenanceTracker, ServiceDueState, ServiceRecord, ValidationError};
use crate::schedule::{Schedule, ServiceKind};
use crate::snapshot::DeviceSnapshot;

/// Persisted history handed back to a fresh supervisor so intervals
/// and the last known reading survive restarts.
#[derive(Debug, Default, Clone)]
pub struct MaintenanceHistory {
    pub records: BTreeMap<ServiceKind, ServiceRecord>,
    pub observed_hours: Option<f64>,
    pub first_seen: Option<NaiveDate>,
    pub last_snapshot: Option<DeviceSnapshot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Authenticating,
    Active,
    /// Connected but recent cycles failed; last data may be stale.
    Degraded,
    Reconnecting,
    /// Terminal. Requires operator intervention (wrong password, or
    /// the reconnect budget is spent).
    Failed,
}

/// What a consumer should display right now.
#[derive(Debug, PartialEq)]
pub enum SnapshotView<'a> {
    /// Nothing received yet.
    Pending,
    Live(&'a DeviceSnapshot),
    /// Stale data from before the current disruption.
    LastKnown(&'a DeviceSnapshot),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Snapshot(DeviceSnapshot),
    Degraded,
    Failed,
}

/// Drives one generator's connection lifecycle. The caller owns the
/// loop: `run_cycle` once, sleep `next_delay`, repeat. Keeping the
/// sleep outside means shutdown can cancel it.
pub struct Supervisor<D: GeneratorDriver> {
    driver: D,
    config: SupervisorConfig,
    state: ConnectionState,
    last_snapshot: Option<DeviceSnapshot>,
    tracker: Option<MaintenanceTracker>,
    pending_history: Option<MaintenanceHistory>,
    grace_until: Option<Instant>,
    consecutive_failures: u32,
    /// Reconnect attempts since the last successful snapshot.
    reconnect_cycles: u32,
    /// Authentication has succeeded; later link setups are reconnects.
    connected_once: bool,
    /// At least one live snapshot was delivered this run.
    ever_active: bool,
    backoff: Option<Duration>,
}

impl<D: GeneratorDriver> Supervisor<D> {
    pub fn new(driver: D, config: SupervisorConfig) -> Self {
        let grace_until = Some(Instant::now() + config.startup_grace);
        Self {
            driver,
            config,
            state: ConnectionState::Idle,
            last_snapshot: None,
            tracker: None,
            pending_history: None,
            grace_until,
            consecutive_failures: 0,
            reconnect_cycles: 0,
            connected_once: false,
            ever_active: false,
            backoff: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Connection state with grace-window masking applied. During the
    /// startup and post-reconnect windows a struggling link is shown as
    /// still connecting (or still active, once data exists) so brief
    /// radio hiccups do not flap the reported status.
    pub fn visible_state(&self) -> ConnectionState {
        match self.state {
            ConnectionState::Degraded | ConnectionState::Reconnecting if self.in_grace() => {
                // A preloaded snapshot from a previous run does not make
                // a never-connected link look alive.
                if self.last_snapshot.is_some() && self.ever_active {
                    ConnectionState::Active
                } else {
                    ConnectionState::Connecting
                }
            }
            state => state,
        }
    }

    fn in_grace(&self) -> bool {
        self.grace_until.is_some_and(|until| Instant::now() < until)
    }

    pub fn snapshot(&self) -> SnapshotView<'_> {
        match (&self.last_snapshot, self.state) {
            (None, _) => SnapshotView::Pending,
            (Some(s), ConnectionState::Active) => SnapshotView::Live(s),
            (Some(s), _) => SnapshotView::LastKnown(s),
        }
    }

    /// Queue history to load into the tracker once the device model is
    /// known, and restore the last persisted snapshot so consumers see
    /// it instead of Pending while the first connection comes up. Must
    /// be called before the first cycle to take effect.
    pub fn preload_history(&mut self, mut history: MaintenanceHistory) {
        if self.last_snapshot.is_none() {
            self.last_snapshot = history.last_snapshot.take();
        }
        self.pending_history = Some(history);
    }

    pub fn maintenance(&self) -> Option<&MaintenanceTracker> {
        self.tracker.as_ref()
    }

    pub fn maintenance_mut(&mut self) -> Option<&mut MaintenanceTracker> {
        self.tracker.as_mut()
    }

    pub fn due_states(&self, today: NaiveDate) -> Vec<ServiceDueState> {
        self.tracker
            .as_ref()
            .map(|t| t.evaluate_all(today))
            .unwrap_or_default()
    }

    pub fn mark_service_complete(
        &mut self,
        kind: ServiceKind,
        at_hours: f64,
        at_date: NaiveDate,
    ) -> Result<(), ValidationError> {
        self.tracker
            .as_mut()
            .ok_or(ValidationError::DeviceUnknown)?
            .mark_complete(kind, at_hours, at_date)
    }

    pub fn import_service_record(
        &mut self,
        kind: ServiceKind,
        at_hours: f64,
        at_date: NaiveDate,
    ) -> Result<(), ValidationError> {
        self.tracker
            .as_mut()
            .ok_or(ValidationError::DeviceUnknown)?
            .import_record(kind, at_hours, at_date)
    }

    /// Record table for write-through persistence, once a device has
    /// been identified.
    pub fn service_records(&self) -> Option<&BTreeMap<ServiceKind, ServiceRecord>> {
        self.tracker.as_ref().map(|t| t.records())
    }

    /// One monitoring cycle: ensure the link, then pull one snapshot.
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        if self.state == ConnectionState::Failed {
            return CycleOutcome::Failed;
        }

        if self.driver.identity().is_none() || !self.driver.is_connected().await {
            if let Some(outcome) = self.reconnect().await {
                return outcome;
            }
        }

        match self.driver.next_snapshot().await {
            Ok(snapshot) => {
                self.on_snapshot(&snapshot);
                CycleOutcome::Snapshot(snapshot)
            }
            Err(err) if err.is_auth_rejection() => self.fail("authentication rejected"),
            Err(err) => {
                self.consecutive_failures += 1;
                warn!(
                    error = %err,
                    consecutive_failures = self.consecutive_failures,
                    "cycle failed"
                );
                if matches!(
                    err,
                    DriverError::StreamStalled
                        | DriverError::Conn(crate::transport::ConnError::Disconnected)
                ) {
                    // Force a clean reconnect on the next cycle.
                    self.driver.close().await;
                }
                self.state = ConnectionState::Degraded;
                CycleOutcome::Degraded
            }
        }
    }

    /// Returns an outcome when the connection attempt itself settles
    /// the cycle; None means connected, proceed to read.
    async fn reconnect(&mut self) -> Option<CycleOutcome> {
        let first = !self.connected_once;
        self.state = if first {
            ConnectionState::Connecting
        } else {
            ConnectionState::Reconnecting
        };
        if !first {
            self.reconnect_cycles += 1;
            if let Some(max) = self.config.max_reconnect_cycles {
                if self.reconnect_cycles > max {
                    return Some(self.fail("reconnect budget exhausted"));
                }
            }
        }

        if let Err(err) = self.driver.connect().await {
            if err.is_auth_rejection() {
                return Some(self.fail("authentication rejected"));
            }
            self.consecutive_failures += 1;
            debug!(error = %err, "connect attempt failed");
            self.state = ConnectionState::Degraded;
            return Some(CycleOutcome::Degraded);
        }

        self.state = ConnectionState::Authenticating;
        match self.driver.authenticate().await {
            Ok(()) => {
                self.connected_once = true;
                if let (Some(identity), None) = (self.driver.identity(), &self.tracker) {
                    let mut tracker =
                        MaintenanceTracker::new(Schedule::for_model(identity.model));
                    if let Some(history) = self.pending_history.take() {
                        tracker.load_records(history.records);
                        if let (Some(hours), Some(seen)) =
                            (history.observed_hours, history.first_seen)
                        {
                            tracker.load_observed_hours(hours, seen);
                        }
                    }
                    self.tracker = Some(tracker);
                }
                if !first {
                    self.grace_until = Some(Instant::now() + self.config.reconnect_grace);
                    info!(cycle = self.reconnect_cycles, "reconnected");
                }
                None
            }
            Err(err) if err.is_auth_rejection() => Some(self.fail("authentication rejected")),
            Err(err) => {
                self.consecutive_failures += 1;
                debug!(error = %err, "connect attempt failed");
                self.state = ConnectionState::Degraded;
                Some(CycleOutcome::Degraded)
            }
        }
    }

    fn on_snapshot(&mut self, snapshot: &DeviceSnapshot) {
        self.state = ConnectionState::Active;
        self.ever_active = true;
        self.consecutive_failures = 0;
        // A delivered snapshot ends the disruption; the reconnect
        // budget only counts attempts in a row.
        self.reconnect_cycles = 0;
        self.backoff = None;
        if let Some(tracker) = &mut self.tracker {
            tracker.observe(snapshot.runtime_hours, Utc::now().date_naive());
        }
        self.last_snapshot = Some(snapshot.clone());
    }

    fn fail(&mut self, reason: &str) -> CycleOutcome {
        error!(reason, "supervisor entering failed state");
        self.state = ConnectionState::Failed;
        CycleOutcome::Failed
    }

    /// Delay before the next cycle: the configured interval while
    /// healthy, otherwise an exponential backoff capped at the maximum.
    pub fn next_delay(&mut self) -> Duration {
        if self.state == ConnectionState::Active {
            return self.config.scan_interval;
        }
        let delay = self.backoff.unwrap_or(self.config.backoff_initial);
        self.backoff = Some((delay * 2).min(self.config.backoff_max));
        delay
    }

    pub async fn send_command(&mut self, command: CommandKind) -> Result<(), DriverError> {
        self.driver.send_command(command).await
    }

    pub async fn shutdown(&mut self) {
        self.driver.close().await;
        self.state = ConnectionState::Idle;
        info!("supervisor shut down");
    }
}

#[cfg(test)]
#[path = "supervisor_tests.rs"]
mod supervisor_tests;
