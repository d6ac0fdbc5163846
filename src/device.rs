//! Snapshot of a remote BLE device.

use chrono::{DateTime, Utc};

use crate::backend::ScanReport;
use crate::ble::advertising::Advertisement;
use crate::utils::normalize_address;

/// A remote device as seen by the manager.
///
/// This is a value snapshot: it is produced by scans and connection events
/// and does not update itself. Query the manager for current state.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BleDevice {
    /// Normalized device address.
    pub address: String,
    /// Device name, if advertised.
    pub name: Option<String>,
    /// Last received signal strength in dBm.
    pub rssi: Option<i16>,
    /// Whether the device was connected when the snapshot was taken.
    pub connected: bool,
    /// Last decoded advertisement.
    pub advertisement: Advertisement,
    /// When the device was last heard from.
    pub last_seen: DateTime<Utc>,
}

impl BleDevice {
    /// Create a device known only by address.
    pub fn new(address: &str) -> Self {
        Self {
            address: normalize_address(address),
            name: None,
            rssi: None,
            connected: false,
            advertisement: Advertisement::default(),
            last_seen: Utc::now(),
        }
    }

    pub(crate) fn from_report(report: &ScanReport) -> Self {
        Self {
            address: normalize_address(&report.address),
            name: report
                .name
                .clone()
                .or_else(|| report.advertisement.local_name.clone()),
            rssi: report.rssi,
            connected: false,
            advertisement: report.advertisement.clone(),
            last_seen: Utc::now(),
        }
    }

    /// Refresh from a later sighting. A missing name or RSSI keeps the old one.
    pub(crate) fn update_from_report(&mut self, report: &ScanReport) {
        if let Some(name) = report
            .name
            .as_ref()
            .or(report.advertisement.local_name.as_ref())
        {
            self.name = Some(name.clone());
        }
        if report.rssi.is_some() {
            self.rssi = report.rssi;
        }
        self.advertisement = report.advertisement.clone();
        self.last_seen = Utc::now();
    }

    /// Name for display, falling back to the address.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.address)
    }
}

impl std::fmt::Display for BleDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({}) {}",
            self.display_name(),
            self.address,
            if self.connected {
                "connected"
            } else {
                "disconnected"
            }
        )
    }
}
