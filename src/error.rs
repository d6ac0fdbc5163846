//! Error types for the easyble crate.

use std::time::Duration;

use thiserror::Error;

/// Coarse failure category reported alongside failed operations.
///
/// Every [`Error`] maps onto one of these through [`Error::fail_code`], which
/// is what connection and I/O failure events carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FailCode {
    /// The device is not connected, or the link went away mid-operation.
    Disconnected,
    /// Establishing the connection took longer than the connect timeout.
    ConnectTimeout,
    /// A GATT operation took longer than the operation timeout.
    OperationTimeout,
    /// The requested service is not part of the device's catalog.
    ServiceNotFound,
    /// The requested characteristic is not part of the device's catalog.
    CharacteristicNotFound,
    /// The characteristic does not support the requested operation.
    PropertyNotSupported,
    /// The caller passed an out-of-range argument.
    InvalidParameter,
    /// Anything else.
    Other,
}

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// A scan is already running.
    #[error("Scan already in progress")]
    ScanInProgress,

    /// The backend does not know a device with this address.
    #[error("Device not found: {address}")]
    DeviceNotFound {
        /// The address that was looked up.
        address: String,
    },

    /// Operation requires a connection but the device is not connected.
    #[error("Device not connected: {address}")]
    NotConnected {
        /// Address of the device.
        address: String,
    },

    /// The device is already connected.
    #[error("Device already connected: {address}")]
    AlreadyConnected {
        /// Address of the device.
        address: String,
    },

    /// A connect or disconnect for this device is still running.
    #[error("Connection already in progress: {address}")]
    ConnectionInProgress {
        /// Address of the device.
        address: String,
    },

    /// No more simultaneous connections are allowed.
    #[error("Maximum connections ({max}) already in use")]
    MaxConnectionsReached {
        /// The configured connection limit.
        max: usize,
    },

    /// Failed to establish a connection to the device.
    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        /// Description of why the connection failed.
        reason: String,
    },

    /// The connection attempt did not finish in time.
    #[error("Connect timeout after {timeout:?}")]
    ConnectTimeout {
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// The connection attempt was cancelled by a disconnect request.
    #[error("Connection cancelled")]
    ConnectionCancelled,

    /// The connection to the device was lost.
    #[error("Connection lost")]
    ConnectionLost,

    /// Service discovery failed after the link came up.
    #[error("Service discovery failed: {reason}")]
    ServiceDiscoveryFailed {
        /// Description of the failure.
        reason: String,
    },

    /// A GATT operation did not complete in time.
    #[error("{operation} timed out after {timeout:?}")]
    OperationTimeout {
        /// The operation that timed out.
        operation: &'static str,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// Invalid data was received from the device or backend.
    #[error("Invalid data received: {context}")]
    InvalidData {
        /// Description of what was invalid about the data.
        context: String,
    },

    /// The payload does not fit into a single ATT packet.
    #[error("Data too long: {len} bytes, at most {max} allowed")]
    DataTooLong {
        /// Length of the rejected payload.
        len: usize,
        /// Largest payload the current MTU allows.
        max: usize,
    },

    /// The characteristic lacks the property the operation needs.
    #[error("Characteristic {uuid} does not support {property}")]
    PropertyNotSupported {
        /// The characteristic UUID.
        uuid: String,
        /// The missing property.
        property: &'static str,
    },

    /// The requested operation is not supported.
    #[error("Operation not supported: {operation}")]
    NotSupported {
        /// Description of the unsupported operation.
        operation: String,
    },

    /// An invalid parameter was provided.
    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter {
        /// The name of the parameter.
        name: String,
        /// The invalid value that was provided.
        value: String,
    },

    /// Characteristic not found on the device.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: String,
    },

    /// Service not found on the device.
    #[error("Service not found: {uuid}")]
    ServiceNotFound {
        /// The UUID of the service that was not found.
        uuid: String,
    },
}

impl Error {
    /// Map this error to the failure category reported in events.
    pub fn fail_code(&self) -> FailCode {
        match self {
            Self::NotConnected { .. }
            | Self::ConnectionCancelled
            | Self::ConnectionLost
            | Self::BluetoothUnavailable => FailCode::Disconnected,
            Self::ConnectTimeout { .. } => FailCode::ConnectTimeout,
            Self::OperationTimeout { .. } => FailCode::OperationTimeout,
            Self::ServiceNotFound { .. } => FailCode::ServiceNotFound,
            Self::CharacteristicNotFound { .. } => FailCode::CharacteristicNotFound,
            Self::PropertyNotSupported { .. } | Self::NotSupported { .. } => {
                FailCode::PropertyNotSupported
            }
            Self::InvalidParameter { .. } | Self::DataTooLong { .. } => FailCode::InvalidParameter,
            _ => FailCode::Other,
        }
    }

    pub(crate) fn invalid_parameter(name: &str, value: impl std::fmt::Display) -> Self {
        Self::InvalidParameter {
            name: name.to_string(),
            value: value.to_string(),
        }
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
