//! BLE monitoring and maintenance scheduling for Honda portable
//! generators.
//!
//! The crate splits into a wire layer ([`transport`], [`codec`]), the
//! per-architecture drivers ([`driver`]), the connection lifecycle
//! ([`supervisor`]) and the pure maintenance engine ([`schedule`],
//! [`maintenance`]).

pub mod codec;
pub mod config;
pub mod driver;
pub mod maintenance;
pub mod model;
pub mod schedule;
pub mod snapshot;
pub mod supervisor;
pub mod transport;

pub use codec::CommandKind;
pub use config::SupervisorConfig;
pub use driver::{Driver, DriverError, GeneratorDriver, PollDriver, PushDriver};
pub use maintenance::{MaintenanceTracker, ServiceDueState, ServiceRecord, ValidationError};
pub use model::{Architecture, Model, ModelSpec};
pub use schedule::{Interval, Schedule, ServiceItem, ServiceKind};
pub use snapshot::{DeviceIdentity, DeviceSnapshot, FuelReadings};
pub use supervisor::{
    ConnectionState, CycleOutcome, MaintenanceHistory, SnapshotView, Supervisor,
};
pub use transport::{BleSession, ConnError, DiscoveredDevice, DiscoveryCache, TransportSession};
