//! End-to-end sample
//!
//! Walks through a typical session:
//! - Scan for 8 seconds
//! - Connect to a device with a 12 second timeout
//! - Subscribe to a notifiable characteristic
//! - Write to a writable characteristic
//! - Read RSSI and request a larger MTU
//! - Disconnect everything
//!
//! Run with: cargo run --example sample
//!
//! To pick a device by name or address:
//!   cargo run --example sample -- --name ESP32
//!   cargo run --example sample -- --address C4:7F:51:00:1A:2B

use easyble::{
    BleManager, ConnectOptions, ConnectionEventKind, Error, ManagerConfig, Result, ScanEvent,
    ScanOptions,
};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,easyble=debug".into()),
        )
        .init();

    println!("easyble sample");
    println!("==============\n");

    // Parse command line arguments
    let args: Vec<String> = std::env::args().collect();
    let arg = |flag: &str| {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .cloned()
    };
    let name = arg("--name");
    let address = arg("--address");

    let config = ManagerConfig::default()
        .with_scan(
            ScanOptions::default()
                .scan_period(Duration::from_secs(8))
                .device_name(name.as_deref())
                .device_address(address.as_deref()),
        )
        .with_connect(ConnectOptions::default().connect_timeout(Duration::from_secs(12)));

    let manager = BleManager::new(config).await?;
    if !manager.is_bluetooth_on().await {
        println!("Bluetooth is off, turn it on and try again.");
        return Err(Error::BluetoothUnavailable);
    }

    let _connection_events = manager.on_connection_event(|event| match event.kind {
        ConnectionEventKind::Started { success, info } => {
            println!("[{}] connect started: {} ({})", event.device.address, success, info)
        }
        ConnectionEventKind::Connected => println!("[{}] connected", event.device.address),
        ConnectionEventKind::Disconnected { reason } => {
            println!("[{}] {}", event.device.address, reason)
        }
        ConnectionEventKind::Failed { code, info } => {
            println!("[{}] failed: {:?} {}", event.device.address, code, info)
        }
    });

    // Scan
    let mut scan_events = manager.subscribe_scan();
    manager.start_scan().await?;
    println!("Scanning for 8 seconds...\n");

    while let Ok(event) = scan_events.recv().await {
        match event {
            ScanEvent::DeviceFound(device) => {
                println!(
                    "  {} rssi={}",
                    device,
                    device.rssi.map_or("?".to_string(), |r| r.to_string())
                );
            }
            ScanEvent::Finished => break,
            ScanEvent::Started { .. } => {}
        }
    }

    let Some(device) = manager.discovered_devices().into_iter().next() else {
        println!("\nNo devices found.");
        return Ok(());
    };

    // Connect
    println!("\nConnecting to {}...", device.display_name());
    let device = manager.connect(&device.address).await?;
    let catalog = manager.device_services(&device.address)?;

    println!("\n=== Services ===");
    for service in catalog.services() {
        println!("{}", service.service.uuid);
        for characteristic in &service.characteristics {
            println!("  {} [{}]", characteristic.uuid, characteristic.properties);
        }
    }

    // Notify
    if let Some((service, characteristic)) = catalog.notifiable().into_iter().next() {
        let address = device.address.clone();
        let _handle = manager.on_notification(&device.address, characteristic, move |value| {
            println!("[{}] notification {:02X?}", address, value.as_ref());
        });
        manager.notify(&device.address, service, characteristic).await?;
        println!("\nSubscribed to {}", characteristic);

        // Give the device a moment to push something
        tokio::time::sleep(Duration::from_secs(2)).await;
    }

    // Write
    if let Some((service, characteristic)) = catalog.writable().into_iter().next() {
        match manager
            .write(&device.address, service, characteristic, b"TestWriteData001")
            .await
        {
            Ok(()) => println!("Wrote TestWriteData001 to {}", characteristic),
            Err(e) => println!("Write failed: {} ({:?})", e, e.fail_code()),
        }
    }

    // Link quality
    match manager.read_rssi(&device.address).await {
        Ok(rssi) => println!("RSSI: {} dBm", rssi),
        Err(e) => println!("RSSI read failed: {}", e),
    }
    match manager.set_mtu(&device.address, 128).await {
        Ok(mtu) => println!("MTU: {}", mtu),
        Err(e) => println!("MTU request failed: {}", e),
    }

    println!("\nDisconnecting...");
    manager.disconnect_all().await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    Ok(())
}
