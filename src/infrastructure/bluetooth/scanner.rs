//! BLE Scanner Module
//!
//! Handles discovery of sensors advertising the Heart Rate Service.

use crate::domain::models::ScannedDevice;
use crate::infrastructure::bluetooth::protocol::HEART_RATE_SERVICE_UUID;
use crate::infrastructure::bluetooth::BluetoothError;
use btleplug::api::{Central, CentralEvent, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Peripheral};
use futures::StreamExt;
use std::collections::HashSet;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// A discovered sensor together with its platform handle
#[derive(Clone)]
pub struct FoundPeripheral {
    pub device: ScannedDevice,
    pub peripheral: Peripheral,
}

/// BLE Scanner for discovering heart rate sensors
pub struct BleScanner {
    adapter: Adapter,
    task: Option<JoinHandle<()>>,
}

impl BleScanner {
    pub fn new(adapter: Adapter) -> Self {
        Self {
            adapter,
            task: None,
        }
    }

    /// Start scanning. Each sensor is reported once per scan on `found`.
    pub async fn start(
        &mut self,
        found: mpsc::UnboundedSender<FoundPeripheral>,
    ) -> Result<(), BluetoothError> {
        // Stop any existing scan
        self.stop().await?;

        info!(
            "Starting BLE scan for service UUID: {}",
            HEART_RATE_SERVICE_UUID
        );

        let mut events = self.adapter.events().await?;
        self.adapter
            .start_scan(ScanFilter {
                services: vec![HEART_RATE_SERVICE_UUID],
            })
            .await?;

        let adapter = self.adapter.clone();
        self.task = Some(tokio::spawn(async move {
            let mut seen = HashSet::new();

            while let Some(event) = events.next().await {
                // Names and service lists often arrive in a later update
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => continue,
                };
                let key = format!("{:?}", id);
                if seen.contains(&key) {
                    continue;
                }

                let peripheral = match adapter.peripheral(&id).await {
                    Ok(p) => p,
                    Err(e) => {
                        debug!("Peripheral {} vanished: {}", key, e);
                        continue;
                    }
                };

                let Some(device) = describe(&peripheral, &key).await else {
                    continue;
                };

                info!("Found device: {} - {}", device.name, device.address);
                seen.insert(key);
                if found.send(FoundPeripheral { device, peripheral }).is_err() {
                    break;
                }
            }
        }));

        Ok(())
    }

    /// Stop scanning
    pub async fn stop(&mut self) -> Result<(), BluetoothError> {
        if let Some(task) = self.task.take() {
            info!("Stopping BLE scan...");
            task.abort();
            self.adapter.stop_scan().await?;
        }
        Ok(())
    }

    /// Check if currently scanning
    pub fn is_scanning(&self) -> bool {
        self.task.is_some()
    }
}

impl Drop for BleScanner {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Build a [`ScannedDevice`] for peripherals advertising the heart rate service.
async fn describe(peripheral: &Peripheral, id: &str) -> Option<ScannedDevice> {
    let props = peripheral.properties().await.ok().flatten()?;

    // Some backends ignore the scan filter
    if !props.services.contains(&HEART_RATE_SERVICE_UUID) {
        return None;
    }

    Some(ScannedDevice {
        id: id.to_string(),
        name: props
            .local_name
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "Unknown".to_string()),
        address: props.address.to_string(),
        signal_strength: props.rssi,
    })
}
