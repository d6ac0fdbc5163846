// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # easyble
//!
//! A cross-platform Bluetooth Low Energy session manager for the central
//! role, built on [btleplug](https://crates.io/crates/btleplug).
//!
//! ## Features
//!
//! - **Discovery**: Timed scans with name, address and service filters
//! - **Connections**: Connect with a timeout, cancel, detect link loss
//! - **Service Catalog**: Query discovered services by capability
//! - **Characteristic I/O**: Serialized, timed reads, writes and batched writes
//! - **Notifications**: Subscribe to notify/indicate characteristics
//! - **Link Queries**: RSSI and MTU negotiation
//! - **Multi-device**: Manage several connections at once
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use easyble::{BleManager, ManagerConfig, Result, ScanEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let manager = BleManager::new(ManagerConfig::default()).await?;
//!     let mut events = manager.subscribe_scan();
//!     manager.start_scan().await?;
//!
//!     while let Ok(event) = events.recv().await {
//!         match event {
//!             ScanEvent::DeviceFound(device) => println!("Found {}", device),
//!             ScanEvent::Finished => break,
//!             _ => {}
//!         }
//!     }
//!
//!     if let Some(device) = manager.discovered_devices().first() {
//!         manager.connect(&device.address).await?;
//!         for (service, characteristic) in manager.device_services(&device.address)?.readable() {
//!             let value = manager.read(&device.address, service, characteristic).await?;
//!             println!("{}: {:?}", characteristic, value);
//!         }
//!     }
//!
//!     manager.shutdown().await
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps. Devices are identified by
//! CoreBluetooth UUIDs instead of MAC addresses.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Logging
//!
//! The crate logs through `tracing`. Install a subscriber (for example
//! `tracing-subscriber` with `RUST_LOG=easyble=debug`) to see it.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for data types

// Public modules
pub mod backend;
pub mod ble;
pub mod callback;
pub mod config;
pub mod device;
pub mod error;
pub mod manager;
pub mod utils;

// Re-exports for convenience
pub use backend::{AdapterState, BackendEvent, BleBackend, BtleplugBackend, WriteType};
pub use callback::CallbackHandle;
pub use config::{ConnectOptions, ManagerConfig, ScanOptions};
pub use device::BleDevice;
pub use error::{Error, FailCode, Result};
pub use manager::BleManager;
pub use utils::normalize_address;

// Re-export commonly used types from submodules
pub use ble::advertising::Advertisement;
pub use ble::catalog::{
    CharacteristicInfo, CharacteristicProperties, Property, ServiceCatalog, ServiceInfo,
};
pub use ble::connection::{
    ConnectionEvent, ConnectionEventKind, ConnectionState, DisconnectReason,
};
pub use ble::scanner::ScanEvent;
pub use ble::session::NotificationEvent;
pub use bytes::Bytes;
pub use uuid::Uuid;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_exports() {
        // Verify that key types are exported
        let _ = std::any::TypeId::of::<BleManager>();
        let _ = std::any::TypeId::of::<BleDevice>();
        let _ = std::any::TypeId::of::<Error>();
        let _ = std::any::TypeId::of::<ServiceCatalog>();
        let _ = std::any::TypeId::of::<ConnectionEvent>();
        let _ = std::any::TypeId::of::<NotificationEvent>();
        let _ = std::any::TypeId::of::<ScanEvent>();
    }

    #[test]
    fn test_address_normalization_export() {
        assert_eq!(normalize_address("aa:bb"), "AA:BB");
    }
}
