//! Platform BLE backends.
//!
//! The manager never talks to a Bluetooth stack directly; it drives a
//! [`BleBackend`]. [`BtleplugBackend`] is the production implementation.

pub mod platform;

#[cfg(test)]
pub(crate) mod fake;

use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::ble::advertising::Advertisement;
use crate::ble::catalog::DiscoveredService;
use crate::error::Result;

pub use self::platform::BtleplugBackend;

/// Power state of the local adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AdapterState {
    /// State could not be determined.
    #[default]
    Unknown,
    /// The adapter is on.
    PoweredOn,
    /// The adapter is off.
    PoweredOff,
}

impl AdapterState {
    /// Check if the adapter can be used.
    pub fn is_on(&self) -> bool {
        matches!(self, Self::PoweredOn)
    }
}

/// How a characteristic value is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteType {
    /// Acknowledged write request.
    WithResponse,
    /// Write command, not acknowledged.
    WithoutResponse,
}

/// Filter handed to the platform scan.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScanFilter {
    /// Only report devices advertising one of these services. Empty means all.
    pub services: Vec<Uuid>,
}

/// One advertisement sighting.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanReport {
    /// Platform address of the advertiser.
    pub address: String,
    /// Name known to the platform, if any.
    pub name: Option<String>,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
    /// Decoded advertising data.
    pub advertisement: Advertisement,
}

/// Asynchronous events raised by a backend.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    /// A device advertised while scanning.
    Advertisement(ScanReport),
    /// The link to a device went down, requested or not.
    Disconnected {
        /// Address of the device.
        address: String,
    },
    /// A subscribed characteristic pushed a value.
    Notification {
        /// Address of the device.
        address: String,
        /// The characteristic that changed.
        characteristic: Uuid,
        /// The new value.
        value: Vec<u8>,
    },
    /// The adapter changed power state.
    AdapterState(AdapterState),
}

/// Operations the session manager needs from a Bluetooth stack.
///
/// Every async method resolves when the platform reports completion of the
/// operation. Devices are identified by their platform address as it
/// appears in [`ScanReport::address`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BleBackend: Send + Sync + 'static {
    /// Current adapter power state.
    async fn adapter_state(&self) -> Result<AdapterState>;

    /// Start scanning for advertisements.
    async fn start_scan(&self, filter: &ScanFilter) -> Result<()>;

    /// Stop scanning.
    async fn stop_scan(&self) -> Result<()>;

    /// Subscribe to backend events.
    fn events(&self) -> broadcast::Receiver<BackendEvent>;

    /// Establish a link to a device.
    async fn connect(&self, address: &str) -> Result<()>;

    /// Tear down the link to a device.
    async fn disconnect(&self, address: &str) -> Result<()>;

    /// Discover the GATT table of a connected device.
    async fn discover_services(&self, address: &str) -> Result<Vec<DiscoveredService>>;

    /// Read a characteristic value.
    async fn read(&self, address: &str, service: Uuid, characteristic: Uuid) -> Result<Vec<u8>>;

    /// Write a characteristic value.
    async fn write(
        &self,
        address: &str,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
        write_type: WriteType,
    ) -> Result<()>;

    /// Enable or disable notifications/indications of a characteristic.
    async fn set_notify(
        &self,
        address: &str,
        service: Uuid,
        characteristic: Uuid,
        enable: bool,
    ) -> Result<()>;

    /// Read the signal strength of a connected device in dBm.
    async fn read_rssi(&self, address: &str) -> Result<i16>;

    /// Request an ATT MTU; resolves with the negotiated value.
    async fn request_mtu(&self, address: &str, mtu: u16) -> Result<u16>;
}
