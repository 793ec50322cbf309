//! Bluetooth Service Module
//!
//! Main service that coordinates scanning, connection and reconnection.
//! It owns the adapter and runs as a single task driven by
//! [`BluetoothCommand`]s; everything it observes goes out as
//! [`AppEvent`]s.

use crate::domain::models::{AppEvent, ConnectionState, MessageSeverity, ScannedDevice, StatusMessage};
use crate::domain::settings::BluetoothSettings;
use crate::infrastructure::bluetooth::connection::BleConnection;
use crate::infrastructure::bluetooth::scanner::{BleScanner, FoundPeripheral};
use crate::infrastructure::bluetooth::session::{supervise, PeripheralLink};
use crate::infrastructure::bluetooth::BluetoothError;
use btleplug::api::Manager as _;
use btleplug::platform::Manager;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BluetoothCommand {
    StartScan,
    StopScan,
    /// Connect to a previously discovered device by id
    Connect(String),
    Disconnect,
}

/// What the command loop should do next
enum Step {
    Command(Option<BluetoothCommand>),
    Found(FoundPeripheral),
    ScanTimedOut,
}

/// Main Bluetooth service coordinating all BLE operations
pub struct BluetoothService {
    scanner: BleScanner,
    connection: BleConnection,
    event_sender: mpsc::UnboundedSender<AppEvent>,
    settings: BluetoothSettings,
    auto_connect: bool,
    known_devices: HashMap<String, FoundPeripheral>,
}

impl BluetoothService {
    /// Create the service on the first available adapter.
    ///
    /// With `auto_connect` the first sensor matching the preferred device
    /// filter is connected as soon as it is discovered.
    pub async fn new(
        event_sender: mpsc::UnboundedSender<AppEvent>,
        settings: BluetoothSettings,
        auto_connect: bool,
    ) -> Result<Self, BluetoothError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(BluetoothError::NoAdapter)?;

        Ok(Self {
            scanner: BleScanner::new(adapter),
            connection: BleConnection::new(event_sender.clone(), (&settings).into()),
            event_sender,
            settings,
            auto_connect,
            known_devices: HashMap::new(),
        })
    }

    /// Run until the command channel closes.
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<BluetoothCommand>) {
        let (found_tx, mut found_rx) = mpsc::unbounded_channel();
        let mut scan_deadline: Option<Instant> = None;

        loop {
            let step = tokio::select! {
                command = commands.recv() => Step::Command(command),
                Some(found) = found_rx.recv() => Step::Found(found),
                _ = wait_for(scan_deadline) => Step::ScanTimedOut,
            };

            match step {
                Step::Command(None) => break,
                Step::Command(Some(BluetoothCommand::StartScan)) => {
                    match self.scanner.start(found_tx.clone()).await {
                        Ok(()) => {
                            self.send_log("Scanning for heart rate sensors...", MessageSeverity::Info);
                            scan_deadline = scan_timeout(&self.settings).map(|t| Instant::now() + t);
                        }
                        Err(e) => {
                            error!("Failed to start scan: {}", e);
                            self.set_state(ConnectionState::Error {
                                message: format!("Scan failed: {}", e),
                            });
                        }
                    }
                }
                Step::Command(Some(BluetoothCommand::StopScan)) => {
                    scan_deadline = None;
                    self.stop_scan().await;
                }
                Step::Command(Some(BluetoothCommand::Connect(id))) => {
                    match self.known_devices.get(&id).cloned() {
                        Some(found) => {
                            scan_deadline = None;
                            self.stop_scan().await;
                            self.run_session(found, &mut commands).await;
                        }
                        None => warn!("Unknown device id: {}", id),
                    }
                }
                Step::Command(Some(BluetoothCommand::Disconnect)) => {
                    info!("Disconnect requested while not connected");
                }
                Step::Found(found) => {
                    let _ = self
                        .event_sender
                        .send(AppEvent::DeviceFound(found.device.clone()));
                    self.known_devices
                        .insert(found.device.id.clone(), found.clone());

                    if self.auto_connect && self.is_preferred(&found.device) {
                        scan_deadline = None;
                        self.stop_scan().await;
                        self.run_session(found, &mut commands).await;
                    }
                }
                Step::ScanTimedOut => {
                    scan_deadline = None;
                    self.stop_scan().await;
                    warn!("No heart rate sensor found before the scan timed out");
                    self.send_log("No heart rate sensor found", MessageSeverity::Warning);
                }
            }
        }

        self.stop_scan().await;
        info!("Bluetooth service stopped");
    }

    /// Keep one device connected, reconnecting after unexpected link loss.
    async fn run_session(
        &self,
        found: FoundPeripheral,
        commands: &mut mpsc::UnboundedReceiver<BluetoothCommand>,
    ) {
        let FoundPeripheral { device, peripheral } = found;
        info!("Connecting to device: {} ({})", device.name, device.address);

        let mut link = PeripheralLink::new(&self.connection, peripheral);
        supervise(&mut link, &self.settings.reconnect, &self.event_sender, commands).await;
    }

    async fn stop_scan(&mut self) {
        if !self.scanner.is_scanning() {
            return;
        }
        if let Err(e) = self.scanner.stop().await {
            error!("Failed to stop scan: {}", e);
        }
    }

    fn is_preferred(&self, device: &ScannedDevice) -> bool {
        matches_filter(self.settings.preferred_device.as_deref(), device)
    }

    fn set_state(&self, state: ConnectionState) {
        self.connection.set_state(state);
    }

    fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self.event_sender.send(AppEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}

/// Whether `device` matches a user supplied name/address/id filter.
/// No filter accepts any sensor.
pub fn matches_filter(filter: Option<&str>, device: &ScannedDevice) -> bool {
    let Some(filter) = filter.map(str::trim).filter(|f| !f.is_empty()) else {
        return true;
    };
    let needle = filter.to_lowercase();
    device.id == filter
        || device.address.eq_ignore_ascii_case(filter)
        || device.name.to_lowercase().contains(&needle)
}

fn scan_timeout(settings: &BluetoothSettings) -> Option<Duration> {
    (settings.scan_timeout_secs > 0).then(|| Duration::from_secs(settings.scan_timeout_secs))
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
