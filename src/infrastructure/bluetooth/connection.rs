//! BLE Connection Module
//!
//! Handles device connection, GATT discovery, subscription to the Heart Rate
//! Measurement characteristic and forwarding of its notifications.

use crate::domain::models::{
    AppEvent, ConnectionState, MessageSeverity, SensorContact, StatusMessage,
};
use crate::domain::settings::BluetoothSettings;
use crate::infrastructure::bluetooth::protocol::{
    CLIENT_CHARACTERISTIC_CONFIG_UUID, HEART_RATE_MEASUREMENT_UUID, HEART_RATE_SERVICE_UUID,
};
use crate::infrastructure::bluetooth::service::BluetoothCommand;
use crate::infrastructure::bluetooth::BluetoothError;
use btleplug::api::{Characteristic, Peripheral as _};
use btleplug::platform::Peripheral;
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Upper bound for connect and service discovery
    pub connect_timeout: Duration,
    /// Link is treated as lost after this long without a notification
    pub notification_timeout: Duration,
    pub debug_raw_data_logging: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            notification_timeout: Duration::from_secs(30),
            debug_raw_data_logging: false,
        }
    }
}

impl From<&BluetoothSettings> for ConnectionConfig {
    fn from(settings: &BluetoothSettings) -> Self {
        Self {
            notification_timeout: Duration::from_secs(settings.notification_timeout_secs.max(1)),
            debug_raw_data_logging: settings.debug_raw_data_logging,
            ..Self::default()
        }
    }
}

/// Why a notification stream ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEnd {
    /// Disconnect requested, or the command channel closed
    Closed,
    /// Radio link dropped or went silent
    Lost,
}

/// BLE Connection handler
pub struct BleConnection {
    event_sender: mpsc::UnboundedSender<AppEvent>,
    config: ConnectionConfig,
}

impl BleConnection {
    /// Create a new connection handler
    pub fn new(event_sender: mpsc::UnboundedSender<AppEvent>, config: ConnectionConfig) -> Self {
        Self {
            event_sender,
            config,
        }
    }

    /// Connect and subscribe to heart rate notifications.
    ///
    /// Emits `Connected`, `Discovering` and finally `Connected` once
    /// notifications are enabled. The caller announces `Connecting` or
    /// `Reconnecting` beforehand.
    pub async fn connect(&self, peripheral: &Peripheral) -> Result<Characteristic, BluetoothError> {
        info!("Connecting to heart rate sensor {}", peripheral.address());

        // Step 1: Connect to BLE device
        if !peripheral.is_connected().await? {
            timeout(self.config.connect_timeout, peripheral.connect())
                .await
                .map_err(|_| BluetoothError::Timeout("connecting"))??;
        }
        info!("Connected to GATT server");
        self.set_state(ConnectionState::Connected);

        // Step 2: Discover services
        timeout(self.config.connect_timeout, peripheral.discover_services())
            .await
            .map_err(|_| BluetoothError::Timeout("discovering services"))??;
        debug!("Services discovered");
        self.set_state(ConnectionState::Discovering);

        // Step 3: Find the measurement characteristic
        if !peripheral
            .services()
            .iter()
            .any(|s| s.uuid == HEART_RATE_SERVICE_UUID)
        {
            return Err(BluetoothError::ServiceNotFound);
        }
        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == HEART_RATE_MEASUREMENT_UUID)
            .ok_or(BluetoothError::CharacteristicNotFound)?;

        if !characteristic
            .descriptors
            .iter()
            .any(|d| d.uuid == CLIENT_CHARACTERISTIC_CONFIG_UUID)
        {
            // Some stacks hide the CCC descriptor but still accept subscribe
            warn!("Client characteristic configuration descriptor not listed");
        }

        // Step 4: Enable notifications
        peripheral.subscribe(&characteristic).await?;
        info!("Notifications enabled for heart rate characteristic");
        self.send_log("Connection established!", MessageSeverity::Success);
        self.set_state(ConnectionState::Connected);

        Ok(characteristic)
    }

    /// Forward notifications until the link ends or a disconnect is requested.
    pub async fn stream(
        &self,
        peripheral: &Peripheral,
        commands: &mut mpsc::UnboundedReceiver<BluetoothCommand>,
    ) -> LinkEnd {
        let mut notifications = match peripheral.notifications().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Failed to get notification stream: {}", e);
                return LinkEnd::Lost;
            }
        };
        let mut last_contact = None;

        loop {
            tokio::select! {
                notification = notifications.next() => {
                    let Some(notification) = notification else {
                        warn!("Notification stream ended");
                        return LinkEnd::Lost;
                    };
                    if notification.uuid != HEART_RATE_MEASUREMENT_UUID {
                        continue;
                    }
                    if self.config.debug_raw_data_logging {
                        trace!("Raw packet: {:02X?}", notification.value);
                    }
                    if let Some(&flag_byte) = notification.value.first() {
                        let contact = SensorContact::from_flags(flag_byte);
                        if last_contact != Some(contact) {
                            debug!("Sensor contact: {:?}", contact);
                            last_contact = Some(contact);
                        }
                    }
                    if self.event_sender.send(AppEvent::Measurement(notification.value)).is_err() {
                        return LinkEnd::Closed;
                    }
                }
                command = commands.recv() => match command {
                    Some(BluetoothCommand::Disconnect) | None => return LinkEnd::Closed,
                    Some(other) => debug!("Ignoring {:?} while connected", other),
                },
                _ = tokio::time::sleep(self.config.notification_timeout) => {
                    warn!(
                        "No heart rate data received in {} seconds",
                        self.config.notification_timeout.as_secs()
                    );
                    return LinkEnd::Lost;
                }
            }
        }
    }

    /// Unsubscribe and drop the link. Errors are logged only.
    pub async fn disconnect(&self, peripheral: &Peripheral, characteristic: Option<&Characteristic>) {
        if let Some(characteristic) = characteristic {
            if let Err(e) = peripheral.unsubscribe(characteristic).await {
                debug!("Unsubscribe failed: {}", e);
            }
        }
        match timeout(self.config.connect_timeout, peripheral.disconnect()).await {
            Ok(Ok(())) => info!("Disconnected from {}", peripheral.address()),
            Ok(Err(e)) => warn!("Disconnect failed: {}", e),
            Err(_) => warn!("Disconnect timed out"),
        }
    }

    pub fn set_state(&self, state: ConnectionState) {
        let _ = self.event_sender.send(AppEvent::ConnectionState(state));
    }

    /// Send a log message
    pub fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self.event_sender.send(AppEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}
