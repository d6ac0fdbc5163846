//! btleplug backed implementation of [`BleBackend`].

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
    ScanFilter as PlatformScanFilter, WriteType as PlatformWriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::backend::{AdapterState, BackendEvent, BleBackend, ScanFilter, ScanReport, WriteType};
use crate::ble::advertising::Advertisement;
use crate::ble::catalog::{
    CharacteristicInfo, CharacteristicProperties, DiscoveredService, ServiceInfo,
};
use crate::error::{Error, Result};
use crate::utils::normalize_address;

type PeripheralMap = Arc<RwLock<HashMap<String, Peripheral>>>;

/// Backend driving the first adapter of the platform's Bluetooth stack.
pub struct BtleplugBackend {
    /// The BLE adapter.
    adapter: Adapter,
    /// Peripherals seen so far, keyed by normalized address.
    peripherals: PeripheralMap,
    /// Channel for backend events.
    event_tx: broadcast::Sender<BackendEvent>,
    /// Handle to the adapter event pump.
    pump_handle: RwLock<Option<JoinHandle<()>>>,
    /// Notification pumps of connected peripherals.
    notification_handles: Arc<RwLock<HashMap<String, JoinHandle<()>>>>,
}

impl BtleplugBackend {
    /// Open the first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BluetoothUnavailable`] if there is no adapter.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapters = manager.adapters().await.map_err(Error::Bluetooth)?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Self::with_adapter(adapter).await
    }

    /// Create a backend on a specific adapter.
    pub async fn with_adapter(adapter: Adapter) -> Result<Self> {
        let (event_tx, _) = broadcast::channel(256);
        let peripherals: PeripheralMap = Arc::new(RwLock::new(HashMap::new()));
        let notification_handles = Arc::new(RwLock::new(HashMap::new()));

        let mut events = adapter.events().await.map_err(Error::Bluetooth)?;

        let pump_adapter = adapter.clone();
        let pump_peripherals = peripherals.clone();
        let pump_tx = event_tx.clone();
        let pump_notifications = notification_handles.clone();

        let handle = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                Self::handle_event(
                    event,
                    &pump_adapter,
                    &pump_peripherals,
                    &pump_notifications,
                    &pump_tx,
                )
                .await;
            }

            debug!("Adapter event stream ended");
        });

        Ok(Self {
            adapter,
            peripherals,
            event_tx,
            pump_handle: RwLock::new(Some(handle)),
            notification_handles,
        })
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    async fn handle_event(
        event: CentralEvent,
        adapter: &Adapter,
        peripherals: &PeripheralMap,
        notification_handles: &Arc<RwLock<HashMap<String, JoinHandle<()>>>>,
        event_tx: &broadcast::Sender<BackendEvent>,
    ) {
        match event {
            CentralEvent::DeviceDiscovered(id)
            | CentralEvent::DeviceUpdated(id)
            | CentralEvent::ManufacturerDataAdvertisement { id, .. }
            | CentralEvent::ServiceDataAdvertisement { id, .. }
            | CentralEvent::ServicesAdvertisement { id, .. } => {
                trace!("Advertisement from {:?}", id);
                Self::process_peripheral(adapter, id, peripherals, event_tx).await;
            }
            CentralEvent::DeviceConnected(id) => {
                debug!("Device connected: {:?}", id);
            }
            CentralEvent::DeviceDisconnected(id) => {
                let address = address_of(&id);
                debug!("Device disconnected: {}", address);

                if let Some(handle) = notification_handles.write().remove(&address) {
                    handle.abort();
                }
                let _ = event_tx.send(BackendEvent::Disconnected { address });
            }
            CentralEvent::StateUpdate(state) => {
                let _ = event_tx.send(BackendEvent::AdapterState(adapter_state(state)));
            }
            #[allow(unreachable_patterns)]
            _ => {}
        }
    }

    async fn process_peripheral(
        adapter: &Adapter,
        id: PeripheralId,
        peripherals: &PeripheralMap,
        event_tx: &broadcast::Sender<BackendEvent>,
    ) {
        let peripheral = match adapter.peripheral(&id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return;
            }
        };

        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            _ => return,
        };

        let address = address_of(&id);
        peripherals.write().insert(address.clone(), peripheral);

        let advertisement = Advertisement {
            local_name: properties.local_name.clone(),
            tx_power: properties
                .tx_power_level
                .and_then(|p| i8::try_from(p).ok()),
            flags: None,
            service_uuids: properties.services.clone(),
            manufacturer_data: properties.manufacturer_data.into_iter().collect(),
            service_data: properties.service_data.into_iter().collect(),
        };

        let _ = event_tx.send(BackendEvent::Advertisement(ScanReport {
            address,
            name: properties.local_name,
            rssi: properties.rssi,
            advertisement,
        }));
    }

    async fn peripheral(&self, address: &str) -> Result<Peripheral> {
        let address = normalize_address(address);

        if let Some(p) = self.peripherals.read().get(&address).cloned() {
            return Ok(p);
        }

        let known = self.adapter.peripherals().await.map_err(Error::Bluetooth)?;
        let peripheral = known
            .into_iter()
            .find(|p| address_of(&p.id()) == address)
            .ok_or_else(|| Error::DeviceNotFound {
                address: address.clone(),
            })?;

        self.peripherals
            .write()
            .insert(address, peripheral.clone());
        Ok(peripheral)
    }

    async fn characteristic(
        &self,
        address: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(Peripheral, Characteristic)> {
        let peripheral = self.peripheral(address).await?;
        let found = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic && c.service_uuid == service)
            .ok_or_else(|| Error::CharacteristicNotFound {
                uuid: characteristic.to_string(),
            })?;
        Ok((peripheral, found))
    }

    /// Forward the peripheral's notification stream as backend events.
    async fn start_notification_pump(&self, address: &str, peripheral: &Peripheral) -> Result<()> {
        let mut notifications = peripheral.notifications().await.map_err(Error::Bluetooth)?;
        let event_tx = self.event_tx.clone();
        let owner = address.to_string();

        let handle = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                trace!(
                    "Notification from {} on {}: {} bytes",
                    owner,
                    notification.uuid,
                    notification.value.len()
                );
                let _ = event_tx.send(BackendEvent::Notification {
                    address: owner.clone(),
                    characteristic: notification.uuid,
                    value: notification.value,
                });
            }
            debug!("Notification stream of {} ended", owner);
        });

        if let Some(old) = self
            .notification_handles
            .write()
            .insert(address.to_string(), handle)
        {
            old.abort();
        }

        Ok(())
    }
}

#[async_trait]
impl BleBackend for BtleplugBackend {
    async fn adapter_state(&self) -> Result<AdapterState> {
        let state = self.adapter.adapter_state().await.map_err(Error::Bluetooth)?;
        Ok(adapter_state(state))
    }

    async fn start_scan(&self, filter: &ScanFilter) -> Result<()> {
        self.adapter
            .start_scan(PlatformScanFilter {
                services: filter.services.clone(),
            })
            .await
            .map_err(Error::Bluetooth)
    }

    async fn stop_scan(&self) -> Result<()> {
        self.adapter.stop_scan().await.map_err(Error::Bluetooth)
    }

    fn events(&self) -> broadcast::Receiver<BackendEvent> {
        self.event_tx.subscribe()
    }

    async fn connect(&self, address: &str) -> Result<()> {
        let peripheral = self.peripheral(address).await?;

        if !peripheral.is_connected().await.unwrap_or(false) {
            peripheral.connect().await.map_err(Error::Bluetooth)?;
        } else {
            info!("Peripheral {} already connected at BLE level", address);
        }

        self.start_notification_pump(&normalize_address(address), &peripheral)
            .await
    }

    async fn disconnect(&self, address: &str) -> Result<()> {
        if let Some(handle) = self
            .notification_handles
            .write()
            .remove(&normalize_address(address))
        {
            handle.abort();
        }

        let peripheral = self.peripheral(address).await?;
        peripheral.disconnect().await.map_err(Error::Bluetooth)
    }

    async fn discover_services(&self, address: &str) -> Result<Vec<DiscoveredService>> {
        let peripheral = self.peripheral(address).await?;
        peripheral
            .discover_services()
            .await
            .map_err(|e| Error::ServiceDiscoveryFailed {
                reason: e.to_string(),
            })?;

        let services = peripheral
            .services()
            .into_iter()
            .map(|service| DiscoveredService {
                service: ServiceInfo {
                    uuid: service.uuid,
                    primary: service.primary,
                },
                characteristics: service
                    .characteristics
                    .into_iter()
                    .map(|c| CharacteristicInfo {
                        uuid: c.uuid,
                        properties: CharacteristicProperties::from_bits(c.properties.bits()),
                        descriptors: c.descriptors.into_iter().map(|d| d.uuid).collect(),
                    })
                    .collect(),
            })
            .collect::<Vec<_>>();

        debug!("Discovered {} services on {}", services.len(), address);

        Ok(services)
    }

    async fn read(&self, address: &str, service: Uuid, characteristic: Uuid) -> Result<Vec<u8>> {
        let (peripheral, c) = self.characteristic(address, service, characteristic).await?;
        peripheral.read(&c).await.map_err(Error::Bluetooth)
    }

    async fn write(
        &self,
        address: &str,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
        write_type: WriteType,
    ) -> Result<()> {
        let (peripheral, c) = self.characteristic(address, service, characteristic).await?;
        let write_type = match write_type {
            WriteType::WithResponse => PlatformWriteType::WithResponse,
            WriteType::WithoutResponse => PlatformWriteType::WithoutResponse,
        };
        peripheral
            .write(&c, data, write_type)
            .await
            .map_err(Error::Bluetooth)
    }

    async fn set_notify(
        &self,
        address: &str,
        service: Uuid,
        characteristic: Uuid,
        enable: bool,
    ) -> Result<()> {
        let (peripheral, c) = self.characteristic(address, service, characteristic).await?;
        let result = if enable {
            peripheral.subscribe(&c).await
        } else {
            peripheral.unsubscribe(&c).await
        };
        result.map_err(|e| {
            warn!("Failed to toggle notifications on {}: {}", characteristic, e);
            Error::Bluetooth(e)
        })
    }

    async fn read_rssi(&self, address: &str) -> Result<i16> {
        let peripheral = self.peripheral(address).await?;
        peripheral
            .properties()
            .await
            .map_err(Error::Bluetooth)?
            .and_then(|p| p.rssi)
            .ok_or_else(|| Error::NotSupported {
                operation: format!("RSSI of {} is not reported by the adapter", address),
            })
    }

    async fn request_mtu(&self, _address: &str, _mtu: u16) -> Result<u16> {
        Err(Error::NotSupported {
            operation: "MTU negotiation".to_string(),
        })
    }
}

impl Drop for BtleplugBackend {
    fn drop(&mut self) {
        if let Some(handle) = self.pump_handle.write().take() {
            handle.abort();
        }
        for (_, handle) in self.notification_handles.write().drain() {
            handle.abort();
        }
    }
}

fn address_of(id: &PeripheralId) -> String {
    normalize_address(&id.to_string())
}

fn adapter_state(state: CentralState) -> AdapterState {
    match state {
        CentralState::PoweredOn => AdapterState::PoweredOn,
        CentralState::PoweredOff => AdapterState::PoweredOff,
        _ => AdapterState::Unknown,
    }
}
