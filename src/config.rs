//! Manager configuration.
//!
//! All options have sensible defaults and fluent setters, so a typical
//! setup is
//!
//! ```
//! use easyble::{ConnectOptions, ManagerConfig, ScanOptions};
//! use std::time::Duration;
//!
//! let config = ManagerConfig::default()
//!     .with_scan(ScanOptions::default().scan_period(Duration::from_secs(8)))
//!     .with_connect(ConnectOptions::default().connect_timeout(Duration::from_secs(12)));
//! assert_eq!(config.connect.max_connections, 7);
//! ```

use std::time::Duration;

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::utils::normalize_address;

/// Options for a discovery scan.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScanOptions {
    /// How long a scan runs before it finishes on its own.
    pub scan_period: Duration,
    /// Only report devices advertising exactly this name.
    pub device_name: Option<String>,
    /// Only report the device with this address.
    pub device_address: Option<String>,
    /// Only report devices advertising at least one of these services.
    pub service_uuids: Vec<Uuid>,
}

impl ScanOptions {
    /// Default scan period (12 seconds).
    pub const DEFAULT_SCAN_PERIOD: Duration = Duration::from_secs(12);

    /// Set the scan period.
    pub fn scan_period(mut self, period: Duration) -> Self {
        self.scan_period = period;
        self
    }

    /// Filter by advertised name; `None` disables the filter.
    pub fn device_name(mut self, name: Option<&str>) -> Self {
        self.device_name = name.map(str::to_string);
        self
    }

    /// Filter by address; `None` disables the filter.
    pub fn device_address(mut self, address: Option<&str>) -> Self {
        self.device_address = address.map(normalize_address);
        self
    }

    /// Filter by advertised services; empty disables the filter.
    pub fn service_uuids(mut self, uuids: Vec<Uuid>) -> Self {
        self.service_uuids = uuids;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.scan_period.is_zero() {
            return Err(Error::invalid_parameter("scan_period", "0s"));
        }
        Ok(())
    }
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            scan_period: Self::DEFAULT_SCAN_PERIOD,
            device_name: None,
            device_address: None,
            service_uuids: Vec::new(),
        }
    }
}

/// Options for establishing connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConnectOptions {
    /// Upper bound for link establishment plus service discovery.
    pub connect_timeout: Duration,
    /// Maximum number of devices connected or connecting at once.
    pub max_connections: usize,
}

impl ConnectOptions {
    /// Default connect timeout (10 seconds).
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    /// Default connection limit, matching what most controllers support.
    pub const DEFAULT_MAX_CONNECTIONS: usize = 7;

    /// Set the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the connection limit.
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.connect_timeout.is_zero() {
            return Err(Error::invalid_parameter("connect_timeout", "0s"));
        }
        if self.max_connections == 0 {
            return Err(Error::invalid_parameter("max_connections", 0));
        }
        Ok(())
    }
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
            max_connections: Self::DEFAULT_MAX_CONNECTIONS,
        }
    }
}

/// Top level configuration of a [`BleManager`](crate::BleManager).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ManagerConfig {
    /// Scan defaults, used by [`BleManager::start_scan`](crate::BleManager::start_scan).
    pub scan: ScanOptions,
    /// Connection options.
    pub connect: ConnectOptions,
    /// Timeout of a single GATT operation (read, write, notify, RSSI, MTU).
    pub operation_timeout: Duration,
}

impl ManagerConfig {
    /// Default GATT operation timeout (5 seconds).
    pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

    /// Replace the scan options.
    pub fn with_scan(mut self, scan: ScanOptions) -> Self {
        self.scan = scan;
        self
    }

    /// Replace the connect options.
    pub fn with_connect(mut self, connect: ConnectOptions) -> Self {
        self.connect = connect;
        self
    }

    /// Set the GATT operation timeout.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Check all values are usable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] naming the first bad value.
    pub fn validate(&self) -> Result<()> {
        self.scan.validate()?;
        self.connect.validate()?;
        if self.operation_timeout.is_zero() {
            return Err(Error::invalid_parameter("operation_timeout", "0s"));
        }
        Ok(())
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            scan: ScanOptions::default(),
            connect: ConnectOptions::default(),
            operation_timeout: Self::DEFAULT_OPERATION_TIMEOUT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ManagerConfig::default();
        assert_eq!(config.scan.scan_period, Duration::from_secs(12));
        assert_eq!(config.connect.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.operation_timeout, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builders() {
        let scan = ScanOptions::default()
            .scan_period(Duration::from_millis(8000))
            .device_name(Some("ESP32"))
            .device_address(Some("aa:bb:cc:dd:ee:ff"));
        assert_eq!(scan.device_address.as_deref(), Some("AA:BB:CC:DD:EE:FF"));
        assert_eq!(scan.device_name.as_deref(), Some("ESP32"));

        let scan = scan.device_name(None);
        assert!(scan.device_name.is_none());
    }

    #[test]
    fn test_validate_rejects_zero() {
        let config = ManagerConfig::default().with_operation_timeout(Duration::ZERO);
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidParameter { ref name, .. }) if name == "operation_timeout"
        ));

        let config = ManagerConfig::default()
            .with_connect(ConnectOptions::default().max_connections(0));
        assert!(config.validate().is_err());

        let config =
            ManagerConfig::default().with_scan(ScanOptions::default().scan_period(Duration::ZERO));
        assert!(config.validate().is_err());
    }
}
