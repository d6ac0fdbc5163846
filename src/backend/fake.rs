//! In-memory backend used by the unit tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::backend::{AdapterState, BackendEvent, BleBackend, ScanFilter, ScanReport, WriteType};
use crate::ble::advertising::Advertisement;
use crate::ble::catalog::DiscoveredService;
use crate::error::{Error, Result};

/// How the fake answers a connect request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum ConnectBehaviour {
    #[default]
    Succeed,
    Fail,
    Hang,
}

#[derive(Debug, Default)]
pub(crate) struct FakePeripheral {
    pub services: Vec<DiscoveredService>,
    pub values: HashMap<Uuid, Vec<u8>>,
    pub written: Vec<(Uuid, Vec<u8>, WriteType)>,
    pub subscribed: HashSet<Uuid>,
    pub connect: ConnectBehaviour,
    pub hang_reads: bool,
    pub hang_disconnect: bool,
    pub fail_disconnect: bool,
    pub fail_set_notify: bool,
    pub connected: bool,
    pub rssi: i16,
    pub max_mtu: u16,
}

#[derive(Debug)]
struct FakeState {
    adapter: AdapterState,
    scanning: bool,
    scan_starts: usize,
    scan_filter: Option<ScanFilter>,
    scan_start_delay: Duration,
    peripherals: HashMap<String, FakePeripheral>,
}

pub(crate) struct FakeBackend {
    event_tx: broadcast::Sender<BackendEvent>,
    state: Mutex<FakeState>,
}

impl FakeBackend {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            event_tx,
            state: Mutex::new(FakeState {
                adapter: AdapterState::PoweredOn,
                scanning: false,
                scan_starts: 0,
                scan_filter: None,
                scan_start_delay: Duration::ZERO,
                peripherals: HashMap::new(),
            }),
        }
    }

    pub fn set_adapter_state(&self, state: AdapterState) {
        self.state.lock().adapter = state;
    }

    pub fn add_peripheral(&self, address: &str, services: Vec<DiscoveredService>) {
        self.state.lock().peripherals.insert(
            address.to_string(),
            FakePeripheral {
                services,
                rssi: -60,
                max_mtu: 247,
                ..Default::default()
            },
        );
    }

    pub fn with_peripheral<R>(&self, address: &str, f: impl FnOnce(&mut FakePeripheral) -> R) -> R {
        let mut state = self.state.lock();
        let peripheral = state
            .peripherals
            .get_mut(address)
            .expect("unknown fake peripheral");
        f(peripheral)
    }

    pub fn events_sender(&self) -> &broadcast::Sender<BackendEvent> {
        &self.event_tx
    }

    pub fn is_scanning(&self) -> bool {
        self.state.lock().scanning
    }

    pub fn scan_starts(&self) -> usize {
        self.state.lock().scan_starts
    }

    /// Filter passed to the last `start_scan`.
    pub fn scan_filter(&self) -> Option<ScanFilter> {
        self.state.lock().scan_filter.clone()
    }

    /// Make `start_scan` take this long before the platform reports success.
    pub fn set_scan_start_delay(&self, delay: Duration) {
        self.state.lock().scan_start_delay = delay;
    }

    pub fn advertise(&self, address: &str, name: Option<&str>, rssi: i16) {
        self.advertise_with(address, name, rssi, Advertisement::default());
    }

    pub fn advertise_with(&self, address: &str, name: Option<&str>, rssi: i16, adv: Advertisement) {
        let _ = self.event_tx.send(BackendEvent::Advertisement(ScanReport {
            address: address.to_string(),
            name: name.map(str::to_string),
            rssi: Some(rssi),
            advertisement: adv,
        }));
    }

    /// Simulate the remote side dropping the link.
    pub fn drop_link(&self, address: &str) {
        if let Some(p) = self.state.lock().peripherals.get_mut(address) {
            p.connected = false;
            p.subscribed.clear();
        }
        let _ = self.event_tx.send(BackendEvent::Disconnected {
            address: address.to_string(),
        });
    }

    /// Push a value from a characteristic.
    pub fn push_notification(&self, address: &str, characteristic: Uuid, value: &[u8]) {
        let _ = self.event_tx.send(BackendEvent::Notification {
            address: address.to_string(),
            characteristic,
            value: value.to_vec(),
        });
    }

    fn connected(&self, address: &str) -> Result<()> {
        let state = self.state.lock();
        match state.peripherals.get(address) {
            Some(p) if p.connected => Ok(()),
            Some(_) => Err(Error::NotConnected {
                address: address.to_string(),
            }),
            None => Err(Error::DeviceNotFound {
                address: address.to_string(),
            }),
        }
    }
}

#[async_trait]
impl BleBackend for FakeBackend {
    async fn adapter_state(&self) -> Result<AdapterState> {
        Ok(self.state.lock().adapter)
    }

    async fn start_scan(&self, filter: &ScanFilter) -> Result<()> {
        let delay = self.state.lock().scan_start_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        state.scanning = true;
        state.scan_starts += 1;
        state.scan_filter = Some(filter.clone());
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.state.lock().scanning = false;
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<BackendEvent> {
        self.event_tx.subscribe()
    }

    async fn connect(&self, address: &str) -> Result<()> {
        let behaviour = {
            let state = self.state.lock();
            state
                .peripherals
                .get(address)
                .map(|p| p.connect)
                .ok_or_else(|| Error::DeviceNotFound {
                    address: address.to_string(),
                })?
        };

        match behaviour {
            ConnectBehaviour::Succeed => {
                self.with_peripheral(address, |p| p.connected = true);
                Ok(())
            }
            ConnectBehaviour::Fail => Err(Error::ConnectionFailed {
                reason: "gatt error 133".to_string(),
            }),
            ConnectBehaviour::Hang => std::future::pending().await,
        }
    }

    async fn disconnect(&self, address: &str) -> Result<()> {
        let (hang, fail) = {
            let mut state = self.state.lock();
            match state.peripherals.get_mut(address) {
                Some(p) => {
                    p.connected = false;
                    p.subscribed.clear();
                    (p.hang_disconnect, p.fail_disconnect)
                }
                None => (false, false),
            }
        };

        if hang {
            std::future::pending::<()>().await;
        }
        if fail {
            return Err(Error::NotSupported {
                operation: "disconnect rejected by adapter".to_string(),
            });
        }
        Ok(())
    }

    async fn discover_services(&self, address: &str) -> Result<Vec<DiscoveredService>> {
        self.connected(address)?;
        Ok(self.with_peripheral(address, |p| p.services.clone()))
    }

    async fn read(&self, address: &str, _service: Uuid, characteristic: Uuid) -> Result<Vec<u8>> {
        self.connected(address)?;
        if self.with_peripheral(address, |p| p.hang_reads) {
            std::future::pending::<()>().await;
        }
        Ok(self.with_peripheral(address, |p| {
            p.values.get(&characteristic).cloned().unwrap_or_default()
        }))
    }

    async fn write(
        &self,
        address: &str,
        _service: Uuid,
        characteristic: Uuid,
        data: &[u8],
        write_type: WriteType,
    ) -> Result<()> {
        self.connected(address)?;
        self.with_peripheral(address, |p| {
            p.written.push((characteristic, data.to_vec(), write_type));
            p.values.insert(characteristic, data.to_vec());
        });
        Ok(())
    }

    async fn set_notify(
        &self,
        address: &str,
        _service: Uuid,
        characteristic: Uuid,
        enable: bool,
    ) -> Result<()> {
        self.connected(address)?;
        if self.with_peripheral(address, |p| p.fail_set_notify) {
            return Err(Error::NotSupported {
                operation: "CCCD write rejected".to_string(),
            });
        }
        self.with_peripheral(address, |p| {
            if enable {
                p.subscribed.insert(characteristic);
            } else {
                p.subscribed.remove(&characteristic);
            }
        });
        Ok(())
    }

    async fn read_rssi(&self, address: &str) -> Result<i16> {
        self.connected(address)?;
        Ok(self.with_peripheral(address, |p| p.rssi))
    }

    async fn request_mtu(&self, address: &str, mtu: u16) -> Result<u16> {
        self.connected(address)?;
        Ok(self.with_peripheral(address, |p| mtu.min(p.max_mtu)))
    }
}
