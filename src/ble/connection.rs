//! BLE connection management.
//!
//! Tracks the connection state of every device the manager talks to and
//! drives connect/disconnect through the backend. A device is `Connected`
//! only once its services have been discovered.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backend::BleBackend;
use crate::ble::catalog::ServiceCatalog;
use crate::config::ConnectOptions;
use crate::device::BleDevice;
use crate::error::{Error, FailCode, Result};
use crate::utils::normalize_address;

/// Default ATT MTU before any negotiation.
pub const DEFAULT_MTU: u16 = 23;

/// Upper bound for the backend disconnect issued after a failed connect.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(2);

/// Connection state for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionState {
    /// Not connected to the device.
    #[default]
    Disconnected,
    /// Currently attempting to connect.
    Connecting,
    /// Connected and services discovered.
    Connected,
    /// Currently disconnecting.
    Disconnecting,
}

impl ConnectionState {
    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if in a transitional state.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Connecting | Self::Disconnecting)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// Why a connected device went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DisconnectReason {
    /// [`ConnectionManager::disconnect`] was called.
    Requested,
    /// The link dropped without being asked to.
    LinkLost,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Requested => write!(f, "disconnected by request"),
            Self::LinkLost => write!(f, "link lost"),
        }
    }
}

/// What happened to a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEventKind {
    /// Outcome of a connect request, before the link is up.
    Started {
        /// Whether the attempt is under way.
        success: bool,
        /// Human readable detail.
        info: String,
    },
    /// Link established and services discovered.
    Connected,
    /// A connected device went away.
    Disconnected {
        /// Why.
        reason: DisconnectReason,
    },
    /// A connection attempt failed.
    Failed {
        /// Failure category.
        code: FailCode,
        /// Human readable detail.
        info: String,
    },
}

/// Event for connection state changes.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionEvent {
    /// Snapshot of the device at the time of the event.
    pub device: BleDevice,
    /// What happened.
    pub kind: ConnectionEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Abort {
    Requested,
    LinkLost,
}

impl Abort {
    fn into_error(self) -> Error {
        match self {
            Self::Requested => Error::ConnectionCancelled,
            Self::LinkLost => Error::ConnectionLost,
        }
    }
}

/// One device's connection.
pub struct Connection {
    device: BleDevice,
    state: RwLock<ConnectionState>,
    catalog: RwLock<ServiceCatalog>,
    mtu: AtomicU16,
    /// Subscribed `(service, characteristic)` pairs.
    notifying: RwLock<HashSet<(Uuid, Uuid)>>,
    /// Serializes GATT operations; the ATT bearer allows one outstanding request.
    op_lock: tokio::sync::Mutex<()>,
    abort: Notify,
    abort_reason: Mutex<Option<Abort>>,
    seq: u64,
}

impl Connection {
    fn new(device: BleDevice, seq: u64) -> Self {
        Self {
            device,
            state: RwLock::new(ConnectionState::Connecting),
            catalog: RwLock::new(ServiceCatalog::default()),
            mtu: AtomicU16::new(DEFAULT_MTU),
            notifying: RwLock::new(HashSet::new()),
            op_lock: tokio::sync::Mutex::new(()),
            abort: Notify::new(),
            abort_reason: Mutex::new(None),
            seq,
        }
    }

    /// Normalized device address.
    pub fn address(&self) -> &str {
        &self.device.address
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Discovered services; empty until connected.
    pub fn catalog(&self) -> ServiceCatalog {
        self.catalog.read().clone()
    }

    /// Current ATT MTU.
    pub fn mtu(&self) -> u16 {
        self.mtu.load(Ordering::SeqCst)
    }

    /// Largest value that fits into one write.
    pub fn max_payload(&self) -> usize {
        usize::from(self.mtu()).saturating_sub(3)
    }

    /// Snapshot of the device with its current connected flag.
    pub fn device(&self) -> BleDevice {
        let mut device = self.device.clone();
        device.connected = self.is_connected();
        device
    }

    /// Check whether values of `characteristic` in `service` are being delivered.
    pub fn is_notifying(&self, service: &Uuid, characteristic: &Uuid) -> bool {
        self.notifying.read().contains(&(*service, *characteristic))
    }

    /// Subscribed services carrying `characteristic`, in catalog order.
    pub(crate) fn notifying_services(&self, characteristic: &Uuid) -> Vec<Uuid> {
        let notifying = self.notifying.read();
        let catalog = self.catalog.read();
        catalog
            .services()
            .iter()
            .map(|s| s.service.uuid)
            .filter(|service| notifying.contains(&(*service, *characteristic)))
            .collect()
    }

    pub(crate) fn with_catalog<R>(&self, f: impl FnOnce(&ServiceCatalog) -> R) -> R {
        f(&self.catalog.read())
    }

    pub(crate) fn set_mtu(&self, mtu: u16) {
        self.mtu.store(mtu, Ordering::SeqCst);
    }

    pub(crate) fn set_notifying(&self, service: Uuid, characteristic: Uuid, enabled: bool) {
        let mut notifying = self.notifying.write();
        if enabled {
            notifying.insert((service, characteristic));
        } else {
            notifying.remove(&(service, characteristic));
        }
    }

    pub(crate) async fn lock_operations(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.op_lock.lock().await
    }

    fn set_state(&self, new_state: ConnectionState) {
        let old_state = std::mem::replace(&mut *self.state.write(), new_state);
        if old_state != new_state {
            debug!(
                "Connection state of {} changed: {} -> {}",
                self.device.address, old_state, new_state
            );
        }
    }

    /// Move from `from` to `to`; false if the state was something else.
    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        let mut state = self.state.write();
        if *state != from {
            return false;
        }
        *state = to;
        drop(state);
        debug!(
            "Connection state of {} changed: {} -> {}",
            self.device.address, from, to
        );
        true
    }

    /// Abort a pending connect. False once the attempt has left `Connecting`.
    fn abort_if_connecting(&self, reason: Abort) -> bool {
        // Held so the attempt cannot complete between the check and the abort.
        let state = self.state.read();
        if *state != ConnectionState::Connecting {
            return false;
        }
        self.abort_reason.lock().get_or_insert(reason);
        self.abort.notify_one();
        true
    }

    /// Move `Connecting -> Connected` unless an abort got there first.
    fn complete(&self) -> std::result::Result<(), Abort> {
        let mut state = self.state.write();
        if let Some(abort) = self.abort_requested() {
            return Err(abort);
        }
        if *state != ConnectionState::Connecting {
            return Err(Abort::Requested);
        }
        *state = ConnectionState::Connected;
        drop(state);
        debug!(
            "Connection state of {} changed: {} -> {}",
            self.device.address,
            ConnectionState::Connecting,
            ConnectionState::Connected
        );
        Ok(())
    }

    fn abort_requested(&self) -> Option<Abort> {
        *self.abort_reason.lock()
    }

    async fn aborted(&self) -> Abort {
        self.abort.notified().await;
        self.abort_requested().unwrap_or(Abort::Requested)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.device.address)
            .field("state", &self.state())
            .field("mtu", &self.mtu())
            .finish()
    }
}

/// Manages the connections to all devices.
pub struct ConnectionManager {
    /// Backend performing the link operations.
    backend: Arc<dyn BleBackend>,
    /// Connection options.
    options: ConnectOptions,
    /// Active (connecting, connected, disconnecting) connections by address.
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    /// Orders connections by when they were requested.
    next_seq: AtomicU64,
    /// Channel for connection events.
    event_tx: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionManager {
    /// Create a connection manager.
    pub fn new(backend: Arc<dyn BleBackend>, options: ConnectOptions) -> Self {
        let (event_tx, _) = broadcast::channel(64);

        Self {
            backend,
            options,
            connections: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            event_tx,
        }
    }

    /// Subscribe to connection events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.event_tx.subscribe()
    }

    /// Connection state of a device.
    pub fn state(&self, address: &str) -> ConnectionState {
        self.connection(address)
            .map(|c| c.state())
            .unwrap_or_default()
    }

    /// Check if a device is connected.
    pub fn is_connected(&self, address: &str) -> bool {
        self.state(address).is_connected()
    }

    /// Connected devices, in the order their connections were requested.
    pub fn connected_devices(&self) -> Vec<BleDevice> {
        let mut connected: Vec<_> = self
            .connections
            .read()
            .values()
            .filter(|c| c.is_connected())
            .cloned()
            .collect();
        connected.sort_by_key(|c| c.seq);
        connected.iter().map(|c| c.device()).collect()
    }

    /// Look up an active connection.
    pub fn connection(&self, address: &str) -> Option<Arc<Connection>> {
        self.connections
            .read()
            .get(&normalize_address(address))
            .cloned()
    }

    /// Look up a connection that is fully established.
    ///
    /// # Errors
    ///
    /// [`Error::NotConnected`] if the device is not `Connected`.
    pub fn connected(&self, address: &str) -> Result<Arc<Connection>> {
        self.connection(address)
            .filter(|c| c.is_connected())
            .ok_or_else(|| Error::NotConnected {
                address: normalize_address(address),
            })
    }

    /// Connect to a device and discover its services.
    ///
    /// Progress is published as [`ConnectionEvent`]s: `Started`, then either
    /// `Connected` or `Failed`.
    ///
    /// # Errors
    ///
    /// Rejections ([`Error::AlreadyConnected`], [`Error::ConnectionInProgress`],
    /// [`Error::MaxConnectionsReached`]), [`Error::ConnectTimeout`],
    /// [`Error::ConnectionCancelled`], [`Error::ConnectionLost`] or the
    /// backend's error.
    pub async fn connect(&self, mut device: BleDevice) -> Result<BleDevice> {
        device.address = normalize_address(&device.address);
        device.connected = false;

        let connection = match self.reserve(&device) {
            Ok(c) => c,
            Err(e) => {
                debug!("Rejected connect to {}: {}", device.address, e);
                self.emit(
                    device,
                    ConnectionEventKind::Started {
                        success: false,
                        info: e.to_string(),
                    },
                );
                return Err(e);
            }
        };

        info!("Connecting to {}", connection.address());
        self.emit(
            connection.device(),
            ConnectionEventKind::Started {
                success: true,
                info: "connecting".to_string(),
            },
        );

        let timeout = self.options.connect_timeout;
        let outcome = tokio::select! {
            result = tokio::time::timeout(timeout, self.establish(&connection)) => match result {
                Ok(result) => result,
                Err(_) => Err(Error::ConnectTimeout { timeout }),
            },
            abort = connection.aborted() => Err(abort.into_error()),
        };

        let outcome = outcome.and_then(|catalog| {
            *connection.catalog.write() = catalog;
            connection.complete().map_err(Abort::into_error)
        });

        match outcome {
            Ok(()) => {
                info!("Connected to {}", connection.address());

                let device = connection.device();
                self.emit(device.clone(), ConnectionEventKind::Connected);
                Ok(device)
            }
            Err(e) => {
                warn!("Connection to {} failed: {}", connection.address(), e);

                self.release(&connection);
                self.emit(
                    connection.device(),
                    ConnectionEventKind::Failed {
                        code: e.fail_code(),
                        info: e.to_string(),
                    },
                );

                // A cancelling disconnect already tore the link down.
                if connection.abort_requested() != Some(Abort::Requested) {
                    if let Err(disconnect_err) = self
                        .backend_disconnect(connection.address(), CLEANUP_TIMEOUT)
                        .await
                    {
                        debug!(
                            "Cleanup disconnect of {} failed: {}",
                            connection.address(),
                            disconnect_err
                        );
                    }
                }
                Err(e)
            }
        }
    }

    /// Disconnect from a device.
    ///
    /// Unknown devices are ignored. A connect in progress is cancelled. A
    /// connected device emits `Disconnected` even when the backend reports an
    /// error, which is then returned.
    pub async fn disconnect(&self, address: &str) -> Result<()> {
        let Some(connection) = self.connection(address) else {
            debug!("Disconnect of unknown device {} ignored", address);
            return Ok(());
        };

        if connection.abort_if_connecting(Abort::Requested) {
            info!("Cancelling connect to {}", connection.address());
            if let Err(e) = self
                .backend_disconnect(connection.address(), CLEANUP_TIMEOUT)
                .await
            {
                debug!("Backend disconnect while cancelling failed: {}", e);
            }
            return Ok(());
        }

        // Either connected, or someone else is already tearing it down.
        if !connection.transition(ConnectionState::Connected, ConnectionState::Disconnecting) {
            return Ok(());
        }

        let result = self
            .backend_disconnect(connection.address(), self.options.connect_timeout)
            .await;
        match &result {
            Ok(()) => info!("Disconnected from {}", connection.address()),
            Err(e) => error!("Failed to disconnect {}: {}", connection.address(), e),
        }

        self.finish(&connection, DisconnectReason::Requested);
        result
    }

    /// Disconnect every active device, logging failures.
    pub async fn disconnect_all(&self) {
        let addresses: Vec<String> = self.connections.read().keys().cloned().collect();
        for address in addresses {
            if let Err(e) = self.disconnect(&address).await {
                warn!("Error disconnecting {}: {}", address, e);
            }
        }
    }

    /// React to the backend reporting that a link went down.
    pub fn handle_link_lost(&self, address: &str) {
        let Some(connection) = self.connection(address) else {
            return;
        };

        if connection.abort_if_connecting(Abort::LinkLost) {
            warn!("Link to {} lost while connecting", connection.address());
        } else if connection.transition(ConnectionState::Connected, ConnectionState::Disconnecting)
        {
            warn!("Connection to {} lost", connection.address());
            self.finish(&connection, DisconnectReason::LinkLost);
        }
    }

    fn reserve(&self, device: &BleDevice) -> Result<Arc<Connection>> {
        let mut connections = self.connections.write();

        if let Some(existing) = connections.get(&device.address) {
            return Err(match existing.state() {
                ConnectionState::Connected => Error::AlreadyConnected {
                    address: device.address.clone(),
                },
                _ => Error::ConnectionInProgress {
                    address: device.address.clone(),
                },
            });
        }

        if connections.len() >= self.options.max_connections {
            return Err(Error::MaxConnectionsReached {
                max: self.options.max_connections,
            });
        }

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let connection = Arc::new(Connection::new(device.clone(), seq));
        connections.insert(device.address.clone(), connection.clone());
        Ok(connection)
    }

    async fn establish(&self, connection: &Connection) -> Result<ServiceCatalog> {
        let address = connection.address();

        self.backend.connect(address).await?;
        debug!("Link to {} up, discovering services", address);

        let services = self
            .backend
            .discover_services(address)
            .await
            .map_err(|e| match e {
                Error::ServiceDiscoveryFailed { .. } => e,
                other => Error::ServiceDiscoveryFailed {
                    reason: other.to_string(),
                },
            })?;

        Ok(ServiceCatalog::new(services))
    }

    async fn backend_disconnect(&self, address: &str, limit: Duration) -> Result<()> {
        match tokio::time::timeout(limit, self.backend.disconnect(address)).await {
            Ok(result) => result,
            Err(_) => Err(Error::OperationTimeout {
                operation: "disconnect",
                timeout: limit,
            }),
        }
    }

    /// Drop a connection from the table if it is still the current one.
    fn release(&self, connection: &Arc<Connection>) {
        let mut connections = self.connections.write();
        if connections
            .get(connection.address())
            .is_some_and(|c| Arc::ptr_eq(c, connection))
        {
            connections.remove(connection.address());
        }
        drop(connections);

        connection.set_state(ConnectionState::Disconnected);
        connection.notifying.write().clear();
    }

    fn finish(&self, connection: &Arc<Connection>, reason: DisconnectReason) {
        self.release(connection);
        self.emit(
            connection.device(),
            ConnectionEventKind::Disconnected { reason },
        );
    }

    fn emit(&self, device: BleDevice, kind: ConnectionEventKind) {
        let _ = self.event_tx.send(ConnectionEvent { device, kind });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::{ConnectBehaviour, FakeBackend};
    use crate::ble::catalog::tests::sample_services;
    use pretty_assertions::assert_eq;
    use tokio_test::assert_ok;

    const A: &str = "AA:00:00:00:00:01";
    const B: &str = "AA:00:00:00:00:02";

    fn setup(options: ConnectOptions) -> (Arc<FakeBackend>, Arc<ConnectionManager>) {
        let backend = Arc::new(FakeBackend::new());
        backend.add_peripheral(A, sample_services());
        backend.add_peripheral(B, sample_services());
        let manager = Arc::new(ConnectionManager::new(backend.clone(), options));
        (backend, manager)
    }

    async fn next_kind(rx: &mut broadcast::Receiver<ConnectionEvent>) -> ConnectionEventKind {
        tokio::time::timeout(Duration::from_secs(60), rx.recv())
            .await
            .expect("no connection event")
            .expect("connection channel closed")
            .kind
    }

    #[test]
    fn test_connection_state() {
        assert!(!ConnectionState::Disconnected.is_connected());
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Connecting.is_connected());

        assert!(ConnectionState::Connecting.is_transitioning());
        assert!(ConnectionState::Disconnecting.is_transitioning());
        assert!(!ConnectionState::Connected.is_transitioning());
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(format!("{}", ConnectionState::Connected), "Connected");
        assert_eq!(format!("{}", ConnectionState::Disconnected), "Disconnected");
        assert_eq!(DisconnectReason::LinkLost.to_string(), "link lost");
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_discovers_services() {
        let (_backend, manager) = setup(ConnectOptions::default());
        let mut rx = manager.subscribe();

        let device = assert_ok!(manager.connect(BleDevice::new("aa:00:00:00:00:01")).await);
        assert_eq!(device.address, A);
        assert!(device.connected);

        assert!(matches!(
            next_kind(&mut rx).await,
            ConnectionEventKind::Started { success: true, .. }
        ));
        assert_eq!(next_kind(&mut rx).await, ConnectionEventKind::Connected);

        let connection = manager.connected(A).unwrap();
        assert_eq!(connection.catalog().len(), 2);
        assert_eq!(connection.mtu(), DEFAULT_MTU);
        assert_eq!(connection.max_payload(), 20);
        assert_eq!(manager.state(A), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_twice_rejected() {
        let (_backend, manager) = setup(ConnectOptions::default());
        assert_ok!(manager.connect(BleDevice::new(A)).await);

        let mut rx = manager.subscribe();
        assert!(matches!(
            manager.connect(BleDevice::new(A)).await,
            Err(Error::AlreadyConnected { .. })
        ));
        assert!(matches!(
            next_kind(&mut rx).await,
            ConnectionEventKind::Started { success: false, .. }
        ));
        assert!(manager.is_connected(A));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let (backend, manager) = setup(ConnectOptions::default().connect_timeout(Duration::from_secs(12)));
        backend.with_peripheral(A, |p| p.connect = ConnectBehaviour::Hang);
        let mut rx = manager.subscribe();

        let result = manager.connect(BleDevice::new(A)).await;
        assert!(matches!(result, Err(Error::ConnectTimeout { .. })));

        let _ = next_kind(&mut rx).await;
        match next_kind(&mut rx).await {
            ConnectionEventKind::Failed { code, .. } => assert_eq!(code, FailCode::ConnectTimeout),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(manager.state(A), ConnectionState::Disconnected);
        assert!(manager.connection(A).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_failure_reported() {
        let (backend, manager) = setup(ConnectOptions::default());
        backend.with_peripheral(A, |p| p.connect = ConnectBehaviour::Fail);
        let mut rx = manager.subscribe();

        assert!(matches!(
            manager.connect(BleDevice::new(A)).await,
            Err(Error::ConnectionFailed { .. })
        ));
        let _ = next_kind(&mut rx).await;
        assert!(matches!(
            next_kind(&mut rx).await,
            ConnectionEventKind::Failed {
                code: FailCode::Other,
                ..
            }
        ));

        // A failed attempt frees the slot.
        backend.with_peripheral(A, |p| p.connect = ConnectBehaviour::Succeed);
        assert_ok!(manager.connect(BleDevice::new(A)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_connect() {
        let (backend, manager) = setup(ConnectOptions::default());
        backend.with_peripheral(A, |p| p.connect = ConnectBehaviour::Hang);
        let mut rx = manager.subscribe();

        let task = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.connect(BleDevice::new(A)).await })
        };
        assert!(matches!(
            next_kind(&mut rx).await,
            ConnectionEventKind::Started { success: true, .. }
        ));
        assert_eq!(manager.state(A), ConnectionState::Connecting);

        // A second attempt while the first is pending is rejected.
        assert!(matches!(
            manager.connect(BleDevice::new(A)).await,
            Err(Error::ConnectionInProgress { .. })
        ));
        let _ = next_kind(&mut rx).await;

        assert_ok!(manager.disconnect(A).await);
        let result = task.await.unwrap();
        assert!(matches!(result, Err(Error::ConnectionCancelled)));
        assert!(matches!(
            next_kind(&mut rx).await,
            ConnectionEventKind::Failed {
                code: FailCode::Disconnected,
                ..
            }
        ));
        assert_eq!(manager.state(A), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_lost() {
        let (backend, manager) = setup(ConnectOptions::default());
        assert_ok!(manager.connect(BleDevice::new(A)).await);
        let mut rx = manager.subscribe();

        backend.drop_link(A);
        manager.handle_link_lost(A);

        assert_eq!(
            next_kind(&mut rx).await,
            ConnectionEventKind::Disconnected {
                reason: DisconnectReason::LinkLost
            }
        );
        assert!(!manager.is_connected(A));
        assert!(matches!(manager.connected(A), Err(Error::NotConnected { .. })));

        // Unknown addresses are ignored.
        manager.handle_link_lost(B);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_connections() {
        let (_backend, manager) = setup(ConnectOptions::default().max_connections(1));
        assert_ok!(manager.connect(BleDevice::new(A)).await);
        assert!(matches!(
            manager.connect(BleDevice::new(B)).await,
            Err(Error::MaxConnectionsReached { max: 1 })
        ));

        assert_ok!(manager.disconnect(A).await);
        assert_ok!(manager.connect(BleDevice::new(B)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_all_in_order() {
        let (_backend, manager) = setup(ConnectOptions::default());
        assert_ok!(manager.connect(BleDevice::new(B)).await);
        assert_ok!(manager.connect(BleDevice::new(A)).await);

        let addresses: Vec<_> = manager
            .connected_devices()
            .into_iter()
            .map(|d| d.address)
            .collect();
        assert_eq!(addresses, vec![B.to_string(), A.to_string()]);

        let mut rx = manager.subscribe();
        manager.disconnect_all().await;
        assert!(manager.connected_devices().is_empty());

        for _ in 0..2 {
            assert_eq!(
                next_kind(&mut rx).await,
                ConnectionEventKind::Disconnected {
                    reason: DisconnectReason::Requested
                }
            );
        }

        // Disconnecting an unknown device is a no-op.
        assert_ok!(manager.disconnect(A).await);
    }

    #[test]
    fn test_abort_and_completion_exclusive() {
        let connection = Connection::new(BleDevice::new(A), 0);
        assert!(connection.abort_if_connecting(Abort::Requested));
        assert_eq!(connection.complete(), Err(Abort::Requested));
        assert_eq!(connection.state(), ConnectionState::Connecting);

        let connection = Connection::new(BleDevice::new(A), 1);
        assert_eq!(connection.complete(), Ok(()));
        assert!(!connection.abort_if_connecting(Abort::LinkLost));
        assert_eq!(connection.state(), ConnectionState::Connected);
        assert_eq!(connection.abort_requested(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_connect_releases_before_cleanup() {
        let (backend, manager) = setup(ConnectOptions::default().connect_timeout(Duration::from_secs(12)));
        backend.with_peripheral(A, |p| {
            p.connect = ConnectBehaviour::Hang;
            p.hang_disconnect = true;
        });
        let mut rx = manager.subscribe();

        let task = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.connect(BleDevice::new(A)).await })
        };

        let _ = next_kind(&mut rx).await;
        match next_kind(&mut rx).await {
            ConnectionEventKind::Failed { code, .. } => assert_eq!(code, FailCode::ConnectTimeout),
            other => panic!("unexpected event {:?}", other),
        }
        // The slot is free while the cleanup disconnect is still stuck.
        assert_eq!(manager.state(A), ConnectionState::Disconnected);
        assert!(manager.connection(A).is_none());

        let result = task.await.unwrap();
        assert!(matches!(result, Err(Error::ConnectTimeout { .. })));

        backend.with_peripheral(A, |p| {
            p.connect = ConnectBehaviour::Succeed;
            p.hang_disconnect = false;
        });
        assert_ok!(manager.connect(BleDevice::new(A)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_lost_while_connecting() {
        let (backend, manager) = setup(ConnectOptions::default());
        backend.with_peripheral(A, |p| p.connect = ConnectBehaviour::Hang);
        let mut rx = manager.subscribe();

        let task = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.connect(BleDevice::new(A)).await })
        };
        assert!(matches!(
            next_kind(&mut rx).await,
            ConnectionEventKind::Started { success: true, .. }
        ));

        manager.handle_link_lost(A);
        let result = task.await.unwrap();
        assert!(matches!(result, Err(Error::ConnectionLost)));
        assert!(matches!(
            next_kind(&mut rx).await,
            ConnectionEventKind::Failed {
                code: FailCode::Disconnected,
                ..
            }
        ));
        assert_eq!(manager.state(A), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_error_still_reported() {
        let (backend, manager) = setup(ConnectOptions::default());
        assert_ok!(manager.connect(BleDevice::new(A)).await);
        backend.with_peripheral(A, |p| p.fail_disconnect = true);
        let mut rx = manager.subscribe();

        assert!(matches!(
            manager.disconnect(A).await,
            Err(Error::NotSupported { .. })
        ));
        assert_eq!(
            next_kind(&mut rx).await,
            ConnectionEventKind::Disconnected {
                reason: DisconnectReason::Requested
            }
        );
        assert!(manager.connection(A).is_none());
        assert!(!manager.is_connected(A));
    }
}
