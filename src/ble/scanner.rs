//! BLE scanning functionality.
//!
//! A scan runs for a fixed period, reports each device once and finishes
//! with exactly one [`ScanEvent::Finished`].

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::backend::{AdapterState, BackendEvent, BleBackend, ScanFilter, ScanReport};
use crate::config::ScanOptions;
use crate::device::BleDevice;
use crate::error::{Error, Result};
use crate::utils::normalize_address;

/// Event emitted during a scan.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    /// Outcome of a start request.
    Started {
        /// Whether the scan is now running.
        success: bool,
        /// Human readable detail.
        info: String,
    },
    /// A device matching the filters was seen for the first time in this scan.
    DeviceFound(BleDevice),
    /// The scan ended, by timeout, by request or because the adapter went away.
    Finished,
}

/// Devices seen in the current scan, in first-seen order.
#[derive(Debug, Default)]
struct Discovered {
    devices: HashMap<String, BleDevice>,
    order: Vec<String>,
}

impl Discovered {
    fn clear(&mut self) {
        self.devices.clear();
        self.order.clear();
    }

    /// Insert or refresh; returns the device if it is new.
    fn upsert(&mut self, report: &ScanReport) -> Option<BleDevice> {
        let address = normalize_address(&report.address);
        match self.devices.get_mut(&address) {
            Some(device) => {
                device.update_from_report(report);
                None
            }
            None => {
                let device = BleDevice::from_report(report);
                self.order.push(address.clone());
                self.devices.insert(address, device.clone());
                Some(device)
            }
        }
    }

    fn snapshot(&self) -> Vec<BleDevice> {
        self.order
            .iter()
            .filter_map(|a| self.devices.get(a).cloned())
            .collect()
    }
}

/// Timed, de-duplicating device discovery.
pub struct Scanner {
    /// The backend to scan with.
    backend: Arc<dyn BleBackend>,
    /// Whether scanning is currently active.
    is_scanning: Arc<AtomicBool>,
    /// Devices found by the current (or last) scan.
    discovered: Arc<RwLock<Discovered>>,
    /// Channel for scan events.
    event_tx: broadcast::Sender<ScanEvent>,
    /// Signals the running scan task to stop.
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    /// Handle to the scanning task.
    scan_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scanner {
    /// Create a scanner on a backend.
    pub fn new(backend: Arc<dyn BleBackend>) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            backend,
            is_scanning: Arc::new(AtomicBool::new(false)),
            discovered: Arc::new(RwLock::new(Discovered::default())),
            event_tx,
            stop_tx: Mutex::new(None),
            scan_handle: Mutex::new(None),
        }
    }

    /// Start a scan.
    ///
    /// The outcome is also published as [`ScanEvent::Started`].
    ///
    /// # Errors
    ///
    /// [`Error::ScanInProgress`] if a scan is running,
    /// [`Error::BluetoothUnavailable`] if the adapter is off, or the backend's
    /// error if the platform refuses to scan.
    pub async fn start_scan(&self, options: &ScanOptions) -> Result<()> {
        if let Err(e) = options.validate() {
            self.emit_start_failure(&e);
            return Err(e);
        }

        if self
            .is_scanning
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Already scanning, rejecting start request");
            let e = Error::ScanInProgress;
            self.emit_start_failure(&e);
            return Err(e);
        }

        // Stored up front so a stop issued while the scan is starting still lands.
        let (stop_tx, stop_rx) = oneshot::channel();
        *self.stop_tx.lock() = Some(stop_tx);

        match self.begin(options, stop_rx).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.stop_tx.lock().take();
                self.is_scanning.store(false, Ordering::SeqCst);
                self.emit_start_failure(&e);
                Err(e)
            }
        }
    }

    async fn begin(&self, options: &ScanOptions, stop_rx: oneshot::Receiver<()>) -> Result<()> {
        if !self.backend.adapter_state().await?.is_on() {
            return Err(Error::BluetoothUnavailable);
        }

        info!("Starting BLE scan for {:?}", options.scan_period);

        // Subscribe before the platform starts reporting.
        let events = self.backend.events();

        self.backend
            .start_scan(&ScanFilter {
                services: options.service_uuids.clone(),
            })
            .await?;

        self.discovered.write().clear();
        let _ = self.event_tx.send(ScanEvent::Started {
            success: true,
            info: "scan started".to_string(),
        });

        let handle = tokio::spawn(Self::run(
            self.backend.clone(),
            events,
            stop_rx,
            options.clone(),
            self.is_scanning.clone(),
            self.discovered.clone(),
            self.event_tx.clone(),
        ));

        *self.scan_handle.lock() = Some(handle);

        Ok(())
    }

    /// Stop the running scan and wait until it has finished.
    pub async fn stop_scan(&self) -> Result<()> {
        let stop_tx = self.stop_tx.lock().take();
        let handle = self.scan_handle.lock().take();

        if stop_tx.is_none() && handle.is_none() {
            debug!("Not scanning, ignoring stop request");
            return Ok(());
        }

        info!("Stopping BLE scan");

        if let Some(tx) = stop_tx {
            let _ = tx.send(());
        }
        match handle {
            Some(handle) => {
                let _ = handle.await;
            }
            // Still starting; the scan ends as soon as its event loop runs.
            None => debug!("Stop requested while the scan is starting"),
        }

        Ok(())
    }

    /// Check if currently scanning.
    pub fn is_scanning(&self) -> bool {
        self.is_scanning.load(Ordering::SeqCst)
    }

    /// Devices found by the current or last scan, in first-seen order.
    pub fn discovered_devices(&self) -> Vec<BleDevice> {
        self.discovered.read().snapshot()
    }

    /// Look up a device found by the current or last scan.
    pub fn device(&self, address: &str) -> Option<BleDevice> {
        self.discovered
            .read()
            .devices
            .get(&normalize_address(address))
            .cloned()
    }

    /// Subscribe to scan events.
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.event_tx.subscribe()
    }

    fn emit_start_failure(&self, error: &Error) {
        let _ = self.event_tx.send(ScanEvent::Started {
            success: false,
            info: error.to_string(),
        });
    }

    async fn run(
        backend: Arc<dyn BleBackend>,
        mut events: broadcast::Receiver<BackendEvent>,
        mut stop_rx: oneshot::Receiver<()>,
        options: ScanOptions,
        is_scanning: Arc<AtomicBool>,
        discovered: Arc<RwLock<Discovered>>,
        event_tx: broadcast::Sender<ScanEvent>,
    ) {
        let deadline = tokio::time::Instant::now() + options.scan_period;

        loop {
            tokio::select! {
                biased;
                _ = &mut stop_rx => break,
                _ = tokio::time::sleep_until(deadline) => {
                    debug!("Scan period elapsed");
                    break;
                }
                event = events.recv() => match event {
                    Ok(BackendEvent::Advertisement(report)) => {
                        Self::handle_report(&report, &options, &discovered, &event_tx);
                    }
                    Ok(BackendEvent::AdapterState(state)) if state != AdapterState::PoweredOn => {
                        warn!("Adapter state changed to {:?}, ending scan", state);
                        break;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Scan dropped {} backend events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        if let Err(e) = backend.stop_scan().await {
            warn!("Failed to stop platform scan: {}", e);
        }

        is_scanning.store(false, Ordering::SeqCst);
        let _ = event_tx.send(ScanEvent::Finished);

        debug!("Scan event loop ended");
    }

    fn handle_report(
        report: &ScanReport,
        options: &ScanOptions,
        discovered: &RwLock<Discovered>,
        event_tx: &broadcast::Sender<ScanEvent>,
    ) {
        if !matches_filters(report, options) {
            trace!("Filtered out advertisement from {}", report.address);
            return;
        }

        let found = discovered.write().upsert(report);
        if let Some(device) = found {
            debug!("Found device {}", device);
            let _ = event_tx.send(ScanEvent::DeviceFound(device));
        }
    }
}

impl Drop for Scanner {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.lock().take() {
            let _ = tx.send(());
        }
    }
}

fn matches_filters(report: &ScanReport, options: &ScanOptions) -> bool {
    if let Some(wanted) = &options.device_name {
        let name = report
            .name
            .as_ref()
            .or(report.advertisement.local_name.as_ref());
        if name != Some(wanted) {
            return false;
        }
    }

    if let Some(wanted) = &options.device_address {
        if normalize_address(&report.address) != normalize_address(wanted) {
            return false;
        }
    }

    options.service_uuids.is_empty() || report.advertisement.advertises_any(&options.service_uuids)
}
