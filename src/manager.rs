//! The session manager facade.
//!
//! [`BleManager`] owns the scanner, the connection table and the GATT
//! session layer, and routes backend events (link loss, notifications) to
//! them. Devices are addressed by their address string everywhere.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{AdapterState, BackendEvent, BleBackend, BtleplugBackend};
use crate::ble::catalog::ServiceCatalog;
use crate::ble::connection::{ConnectionEvent, ConnectionManager, ConnectionState};
use crate::ble::scanner::{ScanEvent, Scanner};
use crate::ble::session::{GattSession, NotificationEvent};
use crate::callback::{spawn_callback, CallbackHandle};
use crate::config::{ManagerConfig, ScanOptions};
use crate::device::BleDevice;
use crate::error::Result;
use crate::utils::normalize_address;

/// Central manager for scanning, connecting and talking to BLE devices.
pub struct BleManager {
    /// Backend shared by all components.
    backend: Arc<dyn BleBackend>,
    /// Configuration the manager was built with.
    config: ManagerConfig,
    /// Device discovery.
    scanner: Scanner,
    /// Connection table.
    connections: Arc<ConnectionManager>,
    /// GATT operations.
    session: Arc<GattSession>,
    /// Callback ID counter.
    callback_counter: AtomicU64,
    /// Task routing backend events.
    listener_handle: Mutex<Option<JoinHandle<()>>>,
}

impl BleManager {
    /// Create a manager on the platform's first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BluetoothUnavailable`](crate::Error::BluetoothUnavailable)
    /// if there is no adapter, or [`Error::InvalidParameter`](crate::Error::InvalidParameter)
    /// for a bad configuration.
    pub async fn new(config: ManagerConfig) -> Result<Self> {
        config.validate()?;
        let backend = BtleplugBackend::new().await?;
        Self::with_backend(Arc::new(backend), config)
    }

    /// Create a manager on any backend.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn with_backend(backend: Arc<dyn BleBackend>, config: ManagerConfig) -> Result<Self> {
        config.validate()?;

        let connections = Arc::new(ConnectionManager::new(backend.clone(), config.connect));
        let session = Arc::new(GattSession::new(
            backend.clone(),
            connections.clone(),
            config.operation_timeout,
        ));

        let listener = tokio::spawn(Self::route_backend_events(
            backend.events(),
            connections.clone(),
            session.clone(),
        ));

        debug!("BLE manager created with {:?}", config);

        Ok(Self {
            scanner: Scanner::new(backend.clone()),
            backend,
            config,
            connections,
            session,
            callback_counter: AtomicU64::new(0),
            listener_handle: Mutex::new(Some(listener)),
        })
    }

    /// The configuration in use.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Current adapter power state.
    pub async fn adapter_state(&self) -> Result<AdapterState> {
        self.backend.adapter_state().await
    }

    /// Check whether the adapter is powered on.
    pub async fn is_bluetooth_on(&self) -> bool {
        match self.backend.adapter_state().await {
            Ok(state) => state.is_on(),
            Err(e) => {
                warn!("Failed to query adapter state: {}", e);
                false
            }
        }
    }

    // Scanning

    /// Start a scan with the configured scan options.
    pub async fn start_scan(&self) -> Result<()> {
        self.scanner.start_scan(&self.config.scan).await
    }

    /// Start a scan with explicit options.
    pub async fn start_scan_with(&self, options: &ScanOptions) -> Result<()> {
        self.scanner.start_scan(options).await
    }

    /// Stop the running scan.
    pub async fn stop_scan(&self) -> Result<()> {
        self.scanner.stop_scan().await
    }

    /// Check if a scan is running.
    pub fn is_scanning(&self) -> bool {
        self.scanner.is_scanning()
    }

    /// Devices found by the current or last scan.
    pub fn discovered_devices(&self) -> Vec<BleDevice> {
        self.scanner.discovered_devices()
    }

    // Connections

    /// Connect to a device and discover its services.
    ///
    /// The device does not have to be found by a scan first.
    pub async fn connect(&self, address: &str) -> Result<BleDevice> {
        let device = self
            .scanner
            .device(address)
            .unwrap_or_else(|| BleDevice::new(address));
        self.connections.connect(device).await
    }

    /// Disconnect a device, or cancel a pending connect to it.
    pub async fn disconnect(&self, address: &str) -> Result<()> {
        self.connections.disconnect(address).await
    }

    /// Disconnect every device.
    pub async fn disconnect_all(&self) {
        self.connections.disconnect_all().await
    }

    /// Connected devices in connection order.
    pub fn connected_devices(&self) -> Vec<BleDevice> {
        self.connections.connected_devices()
    }

    /// Check if a device is connected.
    pub fn is_connected(&self, address: &str) -> bool {
        self.connections.is_connected(address)
    }

    /// Connection state of a device.
    pub fn connection_state(&self, address: &str) -> ConnectionState {
        self.connections.state(address)
    }

    /// Services discovered on a connected device.
    pub fn device_services(&self, address: &str) -> Result<ServiceCatalog> {
        Ok(self.connections.connected(address)?.catalog())
    }

    /// Current ATT MTU of a connected device.
    pub fn mtu(&self, address: &str) -> Result<u16> {
        Ok(self.connections.connected(address)?.mtu())
    }

    // GATT

    /// Read a characteristic.
    pub async fn read(&self, address: &str, service: Uuid, characteristic: Uuid) -> Result<Bytes> {
        self.session.read(address, service, characteristic).await
    }

    /// Write a characteristic.
    pub async fn write(
        &self,
        address: &str,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<()> {
        self.session
            .write(address, service, characteristic, data)
            .await
    }

    /// Write `data` in packets of `packet_len` bytes, `interval` apart.
    pub async fn write_by_batch(
        &self,
        address: &str,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
        packet_len: usize,
        interval: Duration,
    ) -> Result<usize> {
        self.session
            .write_by_batch(address, service, characteristic, data, packet_len, interval)
            .await
    }

    /// Enable notifications of a characteristic.
    pub async fn notify(&self, address: &str, service: Uuid, characteristic: Uuid) -> Result<()> {
        self.session.notify(address, service, characteristic).await
    }

    /// Disable notifications of a characteristic.
    pub async fn cancel_notify(
        &self,
        address: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<()> {
        self.session
            .cancel_notify(address, service, characteristic)
            .await
    }

    /// Read the signal strength of a connected device.
    pub async fn read_rssi(&self, address: &str) -> Result<i16> {
        self.session.read_rssi(address).await
    }

    /// Request an MTU; returns the negotiated value.
    pub async fn set_mtu(&self, address: &str, mtu: u16) -> Result<u16> {
        self.session.set_mtu(address, mtu).await
    }

    // Events

    /// Subscribe to scan events.
    pub fn subscribe_scan(&self) -> broadcast::Receiver<ScanEvent> {
        self.scanner.subscribe()
    }

    /// Subscribe to connection events.
    pub fn subscribe_connection(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.connections.subscribe()
    }

    /// Subscribe to notifications of all devices.
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<NotificationEvent> {
        self.session.subscribe()
    }

    /// Register a callback for scan events.
    pub fn on_scan_event<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(ScanEvent) + Send + Sync + 'static,
    {
        spawn_callback(self.next_callback_id(), self.scanner.subscribe(), callback)
    }

    /// Register a callback for connection events.
    pub fn on_connection_event<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(ConnectionEvent) + Send + Sync + 'static,
    {
        spawn_callback(
            self.next_callback_id(),
            self.connections.subscribe(),
            callback,
        )
    }

    /// Register a callback for the values of one characteristic of one device.
    ///
    /// The characteristic still has to be subscribed with [`notify`](Self::notify).
    pub fn on_notification<F>(&self, address: &str, characteristic: Uuid, callback: F) -> CallbackHandle
    where
        F: Fn(Bytes) + Send + Sync + 'static,
    {
        let address = normalize_address(address);
        spawn_callback(
            self.next_callback_id(),
            self.session.subscribe(),
            move |event: NotificationEvent| {
                if event.address == address && event.characteristic == characteristic {
                    callback(event.value);
                }
            },
        )
    }

    /// Stop scanning and disconnect every device.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down BLE manager");

        self.stop_scan().await?;
        self.disconnect_all().await;

        Ok(())
    }

    fn next_callback_id(&self) -> u64 {
        self.callback_counter.fetch_add(1, Ordering::SeqCst)
    }

    async fn route_backend_events(
        mut events: broadcast::Receiver<BackendEvent>,
        connections: Arc<ConnectionManager>,
        session: Arc<GattSession>,
    ) {
        loop {
            match events.recv().await {
                Ok(BackendEvent::Disconnected { address }) => {
                    connections.handle_link_lost(&address);
                }
                Ok(BackendEvent::Notification {
                    address,
                    characteristic,
                    value,
                }) => {
                    session.dispatch(&address, characteristic, value);
                }
                Ok(BackendEvent::AdapterState(state)) => {
                    info!("Adapter state changed to {:?}", state);
                }
                Ok(BackendEvent::Advertisement(_)) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Backend event listener dropped {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }

        debug!("Backend event listener ended");
    }
}

impl Drop for BleManager {
    fn drop(&mut self) {
        if let Some(handle) = self.listener_handle.lock().take() {
            handle.abort();
        }
    }
}
