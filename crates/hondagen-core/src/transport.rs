use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::config::SupervisorConfig;
use crate::model::{architecture_for_device_name, Architecture, Model};

/// GATT characteristics exposed by the generator control units. The
/// poll models carry the 066B/B4EF services; the push models carry
/// 01B6/92CD.
pub mod uuids {
    use uuid::Uuid;

    pub const ENGINE_CONTROL: Uuid = Uuid::from_u128(0x066B0002_5D90_4939_A7BA_7B9222F53E81);
    pub const ENGINE_STATUS: Uuid = Uuid::from_u128(0x066B0003_5D90_4939_A7BA_7B9222F53E81);
    pub const SERIAL_NUMBER: Uuid = Uuid::from_u128(0x066B0005_5D90_4939_A7BA_7B9222F53E81);
    pub const POLL_AUTH: Uuid = Uuid::from_u128(0x066B0006_5D90_4939_A7BA_7B9222F53E81);

    pub const DIAG_COMMAND: Uuid = Uuid::from_u128(0xB4EF0002_62D2_483C_8293_119E2A99A82B);
    pub const DIAG_RESPONSE: Uuid = Uuid::from_u128(0xB4EF0003_62D2_483C_8293_119E2A99A82B);
    pub const FIRMWARE: Uuid = Uuid::from_u128(0xB4EF0004_62D2_483C_8293_119E2A99A82B);

    pub const DATA_REQUEST: Uuid = Uuid::from_u128(0x01B60002_875A_4C56_B8BF_5103CAFAEEC7);
    pub const DATA_RESPONSE: Uuid = Uuid::from_u128(0x01B60003_875A_4C56_B8BF_5103CAFAEEC7);
    pub const CAN_STREAM: Uuid = Uuid::from_u128(0x01B60004_875A_4C56_B8BF_5103CAFAEEC7);

    pub const PUSH_AUTH: Uuid = Uuid::from_u128(0x92CD0002_4F59_4599_A73C_C92C4AC7AADE);
    pub const PUSH_SERIAL: Uuid = Uuid::from_u128(0x92CD0007_4F59_4599_A73C_C92C4AC7AADE);
}

#[derive(Debug, Error)]
pub enum ConnError {
    #[error("device rejected authentication")]
    AuthRejected,
    #[error("link disconnected")]
    Disconnected,
    #[error("operation timed out")]
    Timeout,
    #[error("characteristic {0} not present on device")]
    MissingCharacteristic(Uuid),
    #[error("no bluetooth adapter available")]
    NoAdapter,
    #[error("device {0} not found")]
    DeviceNotFound(String),
    #[error("bluetooth error: {0}")]
    Ble(String),
}

impl From<btleplug::Error> for ConnError {
    fn from(err: btleplug::Error) -> Self {
        match err {
            btleplug::Error::NotConnected => ConnError::Disconnected,
            other => ConnError::Ble(other.to_string()),
        }
    }
}

/// Low-level link to one generator. Exactly one live session per
/// device; drivers own the session and never share it.
#[async_trait]
pub trait TransportSession: Send + Sync {
    /// Establish the link and discover services. Does not authenticate.
    async fn connect(&mut self) -> Result<(), ConnError>;

    /// Present the device password. Must run before any data access;
    /// the firmware silently drops reads from unauthenticated centrals.
    async fn authenticate(&mut self, password: &str) -> Result<(), ConnError>;

    async fn read(&mut self, characteristic: Uuid) -> Result<Vec<u8>, ConnError>;

    async fn write(&mut self, characteristic: Uuid, payload: &[u8]) -> Result<(), ConnError>;

    /// Subscribe to notifications on one characteristic. The returned
    /// channel closes when the link drops.
    async fn subscribe(
        &mut self,
        characteristic: Uuid,
    ) -> Result<mpsc::Receiver<Vec<u8>>, ConnError>;

    async fn is_connected(&self) -> bool;

    /// Tear the link down. Safe to call on an already-closed session.
    async fn close(&mut self);

    fn address(&self) -> String;

    fn device_name(&self) -> Option<String>;

    fn architecture(&self) -> Architecture;
}

const NOTIFY_CHANNEL_CAPACITY: usize = 64;

/// btleplug-backed session against a real generator.
pub struct BleSession {
    peripheral: Peripheral,
    name: Option<String>,
    architecture: Architecture,
    read_timeout: Duration,
    write_timeout: Duration,
    characteristics: HashMap<Uuid, Characteristic>,
    forwarders: Vec<JoinHandle<()>>,
}

impl BleSession {
    pub fn new(peripheral: Peripheral, name: Option<String>, config: &SupervisorConfig) -> Self {
        let architecture = architecture_for_device_name(name.as_deref());
        Self {
            peripheral,
            name,
            architecture,
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
            characteristics: HashMap::new(),
            forwarders: Vec::new(),
        }
    }

    /// Look the named device up and wrap it in a session. `target`
    /// matches either the BLE address or the advertised name. The cache
    /// is consulted first and only refreshed with a new scan window
    /// when its last result has gone stale.
    pub async fn discover(
        target: &str,
        config: &SupervisorConfig,
        cache: &mut DiscoveryCache,
    ) -> Result<Self, ConnError> {
        let adapter = default_adapter().await?;
        if cache.is_stale(DISCOVERY_TTL) || cache.find(target).is_none() {
            cache.update(scan(&adapter, config.scan_interval).await?);
        }
        let found = cache
            .find(target)
            .cloned()
            .ok_or_else(|| ConnError::DeviceNotFound(target.to_string()))?;
        let peripherals = adapter.peripherals().await?;
        for peripheral in peripherals {
            if peripheral.address().to_string() == found.address {
                return Ok(Self::new(peripheral, found.name, config));
            }
        }
        Err(ConnError::DeviceNotFound(target.to_string()))
    }

    fn characteristic(&self, uuid: Uuid) -> Result<&Characteristic, ConnError> {
        self.characteristics
            .get(&uuid)
            .ok_or(ConnError::MissingCharacteristic(uuid))
    }

    fn auth_characteristic(&self) -> Uuid {
        match self.architecture {
            Architecture::Poll => uuids::POLL_AUTH,
            Architecture::Push => uuids::PUSH_AUTH,
        }
    }
}

#[async_trait]
impl TransportSession for BleSession {
    async fn connect(&mut self) -> Result<(), ConnError> {
        tokio::time::timeout(self.read_timeout.max(Duration::from_secs(5)), async {
            self.peripheral.connect().await?;
            self.peripheral.discover_services().await?;
            Ok::<_, ConnError>(())
        })
        .await
        .map_err(|_| ConnError::Timeout)??;

        self.characteristics = self
            .peripheral
            .characteristics()
            .into_iter()
            .map(|c| (c.uuid, c))
            .collect();
        debug!(
            address = %self.peripheral.address(),
            characteristics = self.characteristics.len(),
            "link established"
        );
        Ok(())
    }

    async fn authenticate(&mut self, password: &str) -> Result<(), ConnError> {
        let auth_char = self.auth_characteristic();
        let mut packet = vec![0x01];
        packet.extend_from_slice(password.as_bytes());
        self.write(auth_char, &packet).await?;

        // The firmware echoes the accepted state back on the same
        // characteristic; anything else is a rejection.
        let response = self.read(auth_char).await?;
        if response.first() != Some(&0x01) {
            warn!(address = %self.peripheral.address(), "authentication rejected");
            return Err(ConnError::AuthRejected);
        }
        Ok(())
    }

    async fn read(&mut self, characteristic: Uuid) -> Result<Vec<u8>, ConnError> {
        let c = self.characteristic(characteristic)?.clone();
        let data = tokio::time::timeout(self.read_timeout, self.peripheral.read(&c))
            .await
            .map_err(|_| ConnError::Timeout)??;
        trace!(%characteristic, len = data.len(), "read");
        Ok(data)
    }

    async fn write(&mut self, characteristic: Uuid, payload: &[u8]) -> Result<(), ConnError> {
        let c = self.characteristic(characteristic)?.clone();
        let write_type = if c.properties.contains(CharPropFlags::WRITE) {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        tokio::time::timeout(
            self.write_timeout,
            self.peripheral.write(&c, payload, write_type),
        )
        .await
        .map_err(|_| ConnError::Timeout)??;
        trace!(%characteristic, len = payload.len(), "write");
        Ok(())
    }

    async fn subscribe(
        &mut self,
        characteristic: Uuid,
    ) -> Result<mpsc::Receiver<Vec<u8>>, ConnError> {
        let c = self.characteristic(characteristic)?.clone();
        self.peripheral.subscribe(&c).await?;
        let mut notifications = self.peripheral.notifications().await?;
        let (tx, rx) = mpsc::channel(NOTIFY_CHANNEL_CAPACITY);
        let handle = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != characteristic {
                    continue;
                }
                // A lagging receiver drops the stream rather than
                // buffering stale frames unboundedly.
                if tx.send(notification.value).await.is_err() {
                    break;
                }
            }
        });
        self.forwarders.push(handle);
        Ok(rx)
    }

    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn close(&mut self) {
        for handle in self.forwarders.drain(..) {
            handle.abort();
        }
        self.characteristics.clear();
        if let Err(err) = self.peripheral.disconnect().await {
            debug!(error = %err, "disconnect on close");
        }
    }

    fn address(&self) -> String {
        self.peripheral.address().to_string()
    }

    fn device_name(&self) -> Option<String> {
        self.name.clone()
    }

    fn architecture(&self) -> Architecture {
        self.architecture
    }
}

/// A generator seen during a scan.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct DiscoveredDevice {
    pub address: String,
    pub name: Option<String>,
    pub model: Model,
    pub architecture: Architecture,
}

/// Advertised names are the serial prefix, so a known model prefix
/// identifies a generator.
pub fn is_generator_name(name: &str) -> bool {
    Model::from_serial(name) != Model::Unknown
}

pub async fn default_adapter() -> Result<Adapter, ConnError> {
    let manager = Manager::new().await?;
    manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or(ConnError::NoAdapter)
}

/// One scan window. Returns every peripheral whose advertised name
/// matches a known generator prefix.
pub async fn scan(adapter: &Adapter, window: Duration) -> Result<Vec<DiscoveredDevice>, ConnError> {
    adapter.start_scan(ScanFilter::default()).await?;
    tokio::time::sleep(window).await;
    adapter.stop_scan().await?;

    let mut devices = Vec::new();
    for peripheral in adapter.peripherals().await? {
        let Some(props) = peripheral.properties().await? else {
            continue;
        };
        let Some(name) = props.local_name else {
            continue;
        };
        if !is_generator_name(&name) {
            continue;
        }
        devices.push(DiscoveredDevice {
            address: peripheral.address().to_string(),
            model: Model::from_serial(&name),
            architecture: architecture_for_device_name(Some(&name)),
            name: Some(name),
        });
    }
    debug!(count = devices.len(), "scan window complete");
    Ok(devices)
}

/// How long one scan window's result stays valid for lookups.
pub const DISCOVERY_TTL: Duration = Duration::from_secs(60);

/// Last scan result, kept so repeated lookups do not re-open the radio.
#[derive(Debug, Default)]
pub struct DiscoveryCache {
    devices: Vec<DiscoveredDevice>,
    refreshed: Option<tokio::time::Instant>,
}

impl DiscoveryCache {
    pub fn update(&mut self, devices: Vec<DiscoveredDevice>) {
        self.devices = devices;
        self.refreshed = Some(tokio::time::Instant::now());
    }

    pub fn devices(&self) -> &[DiscoveredDevice] {
        &self.devices
    }

    /// Match by BLE address or advertised name.
    pub fn find(&self, target: &str) -> Option<&DiscoveredDevice> {
        self.devices
            .iter()
            .find(|d| d.address == target || d.name.as_deref() == Some(target))
    }

    pub fn is_stale(&self, ttl: Duration) -> bool {
        match self.refreshed {
            Some(at) => at.elapsed() > ttl,
            None => true,
        }
    }

    pub fn clear(&mut self) {
        self.devices.clear();
        self.refreshed = None;
    }
}
