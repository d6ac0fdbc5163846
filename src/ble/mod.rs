//! BLE building blocks.
//!
//! Scanning, connection management, the per-device service catalog and
//! GATT I/O. [`BleManager`](crate::BleManager) ties them together.

pub mod advertising;
pub mod catalog;
pub mod connection;
pub mod link;
pub mod scanner;
pub mod session;
pub mod uuids;

pub use advertising::Advertisement;
pub use catalog::{
    CharacteristicInfo, CharacteristicProperties, DiscoveredService, Property, ServiceCatalog,
    ServiceInfo,
};
pub use connection::{
    Connection, ConnectionEvent, ConnectionEventKind, ConnectionManager, ConnectionState,
    DisconnectReason, DEFAULT_MTU,
};
pub use link::{MAX_MTU, MIN_MTU};
pub use scanner::{ScanEvent, Scanner};
pub use session::{GattSession, NotificationEvent};
