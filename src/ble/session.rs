//! GATT I/O on connected devices.
//!
//! Every operation resolves its characteristic in the device's
//! [`ServiceCatalog`](crate::ble::catalog::ServiceCatalog), holds the
//! device's operation lock and runs under the operation timeout.

use bytes::Bytes;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::backend::{BleBackend, WriteType};
use crate::ble::catalog::{CharacteristicProperties, Property};
use crate::ble::connection::{Connection, ConnectionManager};
use crate::error::{Error, Result};
use crate::utils::{normalize_address, to_hex_string};

/// A value pushed by a subscribed characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEvent {
    /// Address of the device.
    pub address: String,
    /// Service the characteristic belongs to.
    pub service: Uuid,
    /// The characteristic that sent the value.
    pub characteristic: Uuid,
    /// The value.
    pub value: Bytes,
}

/// Reads, writes and subscriptions on connected devices.
pub struct GattSession {
    /// Backend performing the GATT operations.
    backend: Arc<dyn BleBackend>,
    /// Source of connection state and catalogs.
    connections: Arc<ConnectionManager>,
    /// Upper bound for a single operation.
    operation_timeout: Duration,
    /// Channel for notification events.
    notification_tx: broadcast::Sender<NotificationEvent>,
}

impl GattSession {
    /// Create a session layer over a connection manager.
    pub fn new(
        backend: Arc<dyn BleBackend>,
        connections: Arc<ConnectionManager>,
        operation_timeout: Duration,
    ) -> Self {
        let (notification_tx, _) = broadcast::channel(256);

        Self {
            backend,
            connections,
            operation_timeout,
            notification_tx,
        }
    }

    /// Subscribe to notification events of all devices.
    pub fn subscribe(&self) -> broadcast::Receiver<NotificationEvent> {
        self.notification_tx.subscribe()
    }

    /// Read a characteristic.
    pub async fn read(&self, address: &str, service: Uuid, characteristic: Uuid) -> Result<Bytes> {
        let connection = self.connections.connected(address)?;
        Self::resolve(&connection, service, characteristic, Property::Readable)?;

        let data = self
            .guarded(
                &connection,
                "read",
                self.backend
                    .read(connection.address(), service, characteristic),
            )
            .await?;

        trace!(
            "Read {} from {} on {}",
            to_hex_string(&data),
            characteristic,
            connection.address()
        );
        Ok(Bytes::from(data))
    }

    /// Write a characteristic.
    ///
    /// Uses write-with-response when the characteristic supports it.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidParameter`] for empty data, [`Error::DataTooLong`] if
    /// `data` does not fit into the current MTU.
    pub async fn write(
        &self,
        address: &str,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<()> {
        if data.is_empty() {
            return Err(Error::invalid_parameter("data", "empty"));
        }

        let connection = self.connections.connected(address)?;
        let properties = Self::resolve(&connection, service, characteristic, Property::Writable)?;

        let max = connection.max_payload();
        if data.len() > max {
            return Err(Error::DataTooLong {
                len: data.len(),
                max,
            });
        }

        let write_type = if properties.contains(CharacteristicProperties::WRITE) {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };

        self.guarded(
            &connection,
            "write",
            self.backend.write(
                connection.address(),
                service,
                characteristic,
                data,
                write_type,
            ),
        )
        .await?;

        trace!(
            "Wrote {} to {} on {} ({:?})",
            to_hex_string(data),
            characteristic,
            connection.address(),
            write_type
        );
        Ok(())
    }

    /// Write `data` in packets of at most `packet_len` bytes, `interval` apart.
    ///
    /// Packets are additionally capped to what the MTU allows. Stops at the
    /// first failing packet. Returns the number of packets written.
    pub async fn write_by_batch(
        &self,
        address: &str,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
        packet_len: usize,
        interval: Duration,
    ) -> Result<usize> {
        if data.is_empty() {
            return Err(Error::invalid_parameter("data", "empty"));
        }
        if packet_len == 0 {
            return Err(Error::invalid_parameter("packet_len", 0));
        }

        let connection = self.connections.connected(address)?;
        let packet_len = packet_len.min(connection.max_payload()).max(1);

        let mut written = 0;
        for (index, packet) in data.chunks(packet_len).enumerate() {
            if index > 0 && !interval.is_zero() {
                tokio::time::sleep(interval).await;
            }
            self.write(address, service, characteristic, packet)
                .await
                .map_err(|e| {
                    warn!(
                        "Batch write to {} stopped at packet {}: {}",
                        connection.address(),
                        index,
                        e
                    );
                    e
                })?;
            written += 1;
        }

        debug!(
            "Wrote {} bytes in {} packets to {}",
            data.len(),
            written,
            characteristic
        );
        Ok(written)
    }

    /// Enable notifications (or indications) of a characteristic.
    ///
    /// Calling this for an already subscribed characteristic does nothing.
    pub async fn notify(&self, address: &str, service: Uuid, characteristic: Uuid) -> Result<()> {
        let connection = self.connections.connected(address)?;
        Self::resolve(&connection, service, characteristic, Property::Notifiable)?;

        if connection.is_notifying(&service, &characteristic) {
            trace!("Already subscribed to {}", characteristic);
            return Ok(());
        }

        self.guarded(
            &connection,
            "notify",
            self.backend
                .set_notify(connection.address(), service, characteristic, true),
        )
        .await?;

        connection.set_notifying(service, characteristic, true);
        debug!(
            "Subscribed to {} on {}",
            characteristic,
            connection.address()
        );
        Ok(())
    }

    /// Disable notifications of a characteristic and stop delivering its values.
    pub async fn cancel_notify(
        &self,
        address: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<()> {
        let connection = self.connections.connected(address)?;
        Self::resolve(&connection, service, characteristic, Property::Notifiable)?;

        if !connection.is_notifying(&service, &characteristic) {
            return Ok(());
        }

        // Stop delivery first; the peer may keep sending until it sees the CCCD write.
        connection.set_notifying(service, characteristic, false);

        if let Err(e) = self
            .guarded(
                &connection,
                "cancel_notify",
                self.backend
                    .set_notify(connection.address(), service, characteristic, false),
            )
            .await
        {
            warn!(
                "Failed to unsubscribe from {} on {}: {}",
                characteristic,
                connection.address(),
                e
            );
            if connection.is_connected() {
                connection.set_notifying(service, characteristic, true);
            }
            return Err(e);
        }

        debug!(
            "Unsubscribed from {} on {}",
            characteristic,
            connection.address()
        );
        Ok(())
    }

    /// Deliver a value pushed by the backend to subscribers.
    ///
    /// Dropped unless the device is connected and the characteristic is
    /// subscribed.
    pub(crate) fn dispatch(&self, address: &str, characteristic: Uuid, value: Vec<u8>) {
        let Some(connection) = self.connections.connection(address) else {
            trace!("Dropping value from unknown device {}", address);
            return;
        };
        if !connection.is_connected() {
            trace!("Dropping value from {} while not connected", address);
            return;
        }
        let services = connection.notifying_services(&characteristic);
        if services.is_empty() {
            trace!("Dropping value of unsubscribed {}", characteristic);
            return;
        }

        trace!(
            "Notification from {} on {}: {}",
            characteristic,
            address,
            to_hex_string(&value)
        );

        let address = normalize_address(address);
        let value = Bytes::from(value);
        for service in services {
            let _ = self.notification_tx.send(NotificationEvent {
                address: address.clone(),
                service,
                characteristic,
                value: value.clone(),
            });
        }
    }

    pub(crate) fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub(crate) fn backend(&self) -> &dyn BleBackend {
        self.backend.as_ref()
    }

    fn resolve(
        connection: &Connection,
        service: Uuid,
        characteristic: Uuid,
        property: Property,
    ) -> Result<CharacteristicProperties> {
        connection.with_catalog(|catalog| {
            catalog
                .require(&service, &characteristic, property)
                .map(|info| info.properties)
        })
    }

    /// Run one GATT operation under the device's operation lock and timeout.
    pub(crate) async fn guarded<T>(
        &self,
        connection: &Connection,
        operation: &'static str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let _guard = connection.lock_operations().await;

        // The link may have gone while we waited for the lock.
        if !connection.is_connected() {
            return Err(Error::NotConnected {
                address: connection.address().to_string(),
            });
        }

        let timeout = self.operation_timeout;
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "{} on {} timed out after {:?}",
                    operation,
                    connection.address(),
                    timeout
                );
                Err(Error::OperationTimeout { operation, timeout })
            }
        }
    }
}
