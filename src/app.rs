//! Application bridge
//!
//! Drains [`AppEvent`]s from the Bluetooth side into the observable state
//! and wires that state to the pulse generator and the OSC sender.

use crate::domain::models::{AppEvent, ConnectionState, MessageSeverity, ScannedDevice};
use crate::domain::pulse::PulseGenerator;
use crate::domain::settings::OscSettings;
use crate::domain::signal::Signal;
use crate::infrastructure::bluetooth::protocol::{parse_heart_rate_measurement, rr_to_millis};
use crate::infrastructure::osc::{OscEndpoint, OscSender};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Latest sensor values and link state.
pub struct HeartRateState {
    /// `None` while no sensor is connected
    pub heart_rate: Signal<Option<u16>>,
    pub energy_expended: Signal<Option<u16>>,
    /// RR batch of the latest notification in 1/1024 s units
    pub rr_intervals: Signal<Vec<u16>>,
    pub connection_state: Signal<ConnectionState>,
    pub discovered_devices: Signal<Vec<ScannedDevice>>,
}

impl HeartRateState {
    pub fn new() -> Self {
        Self {
            heart_rate: Signal::new(None),
            energy_expended: Signal::new(None),
            rr_intervals: Signal::new(Vec::new()),
            connection_state: Signal::new(ConnectionState::Disconnected),
            discovered_devices: Signal::new(Vec::new()),
        }
    }

    /// Decode a measurement notification and publish its fields.
    pub fn on_characteristic_changed(&self, bytes: &[u8]) {
        let measurement = parse_heart_rate_measurement(bytes);
        let rr_ms: Vec<f32> = measurement.rr_intervals.iter().copied().map(rr_to_millis).collect();
        debug!(
            "Heart rate: {} bpm, energy: {:?} kJ, rr: {:?} ms",
            measurement.heart_rate, measurement.energy_expended, rr_ms
        );

        self.heart_rate.set(Some(measurement.heart_rate));
        self.energy_expended.set(measurement.energy_expended);
        self.rr_intervals.set(measurement.rr_intervals);
    }

    /// Record a discovered sensor. Returns true for a device not seen before;
    /// a repeat only refreshes its signal strength.
    pub fn on_scan_result(&self, device: ScannedDevice) -> bool {
        let mut devices = self.discovered_devices.get();
        let is_new = match devices.iter_mut().find(|d| d.id == device.id) {
            Some(existing) => {
                existing.signal_strength = device.signal_strength;
                false
            }
            None => {
                devices.push(device);
                true
            }
        };
        self.discovered_devices.set(devices);
        is_new
    }

    pub fn on_connection_state(&self, state: ConnectionState) {
        if matches!(
            state,
            ConnectionState::Disconnected | ConnectionState::Error { .. }
        ) {
            self.heart_rate.set(None);
            self.energy_expended.set(None);
            self.rr_intervals.set(Vec::new());
        }
        if self.connection_state.set(state.clone()) {
            info!("Connection state: {}", state);
        }
    }
}

impl Default for HeartRateState {
    fn default() -> Self {
        Self::new()
    }
}

type SharedSender = Arc<Mutex<Option<OscSender>>>;

/// Owns the state layer, the pulse generator, the OSC sender and the
/// inbound event channel until [`spawn`](Self::spawn) hands them to tasks.
pub struct HeartRateBridge {
    state: Arc<HeartRateState>,
    pulse: Arc<PulseGenerator>,
    osc: SharedSender,
    settings: OscSettings,
    event_sender: mpsc::UnboundedSender<AppEvent>,
    event_receiver: mpsc::UnboundedReceiver<AppEvent>,
}

impl HeartRateBridge {
    /// Must be called from within a tokio runtime.
    pub fn new(settings: OscSettings) -> anyhow::Result<Self> {
        settings.validate()?;

        let pulse = Arc::new(PulseGenerator::new());
        pulse.set_pulse_duration(settings.pulse_duration_ms);
        let sender = OscSender::from_settings(&settings, &pulse)?;
        let (event_sender, event_receiver) = mpsc::unbounded_channel();

        Ok(Self {
            state: Arc::new(HeartRateState::new()),
            pulse,
            osc: Arc::new(Mutex::new(Some(sender))),
            settings,
            event_sender,
            event_receiver,
        })
    }

    pub fn spawn(self) -> BridgeHandle {
        let Self {
            state,
            pulse,
            osc,
            settings,
            event_sender,
            event_receiver,
        } = self;
        let (settings_tx, settings_rx) = watch::channel(settings);

        // Subscribe before spawning so nothing published from here on is missed
        let heart_rates = state.heart_rate.subscribe();
        let connection_states = state.connection_state.subscribe();

        let tasks = vec![
            tokio::spawn(drain_events(event_receiver, state.clone())),
            tokio::spawn(forward_heart_rate(heart_rates, pulse.clone(), osc.clone())),
            tokio::spawn(forward_connection_state(
                connection_states,
                pulse.clone(),
                osc.clone(),
            )),
            tokio::spawn(apply_settings(
                settings_rx,
                state.clone(),
                pulse.clone(),
                osc.clone(),
            )),
        ];
        info!("Heart rate bridge started");

        BridgeHandle {
            state,
            pulse,
            osc,
            event_sender,
            settings_tx,
            tasks,
        }
    }
}

/// Lifecycle handle for a running bridge. Dropping it shuts the bridge down.
pub struct BridgeHandle {
    state: Arc<HeartRateState>,
    pulse: Arc<PulseGenerator>,
    osc: SharedSender,
    event_sender: mpsc::UnboundedSender<AppEvent>,
    settings_tx: watch::Sender<OscSettings>,
    tasks: Vec<JoinHandle<()>>,
}

impl BridgeHandle {
    /// Channel the Bluetooth service reports into
    pub fn event_sender(&self) -> mpsc::UnboundedSender<AppEvent> {
        self.event_sender.clone()
    }

    pub fn state(&self) -> &HeartRateState {
        &self.state
    }

    pub fn pulse(&self) -> &PulseGenerator {
        &self.pulse
    }

    /// Destination of the current OSC sender, if one is open
    pub fn osc_endpoint(&self) -> Option<OscEndpoint> {
        lock(&self.osc).as_ref().map(|sender| sender.endpoint().clone())
    }

    /// Replace the OSC sender and pulse duration with new settings.
    pub fn reconfigure(&self, settings: OscSettings) -> anyhow::Result<()> {
        settings.validate()?;
        self.settings_tx.send_replace(settings);
        Ok(())
    }

    /// Cancel all tasks and release the sender and generator. Idempotent.
    pub fn shutdown(&mut self) {
        if self.tasks.is_empty() {
            return;
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(sender) = lock(&self.osc).take() {
            sender.cleanup();
        }
        self.pulse.cleanup();
        info!("Heart rate bridge stopped");
    }
}

impl Drop for BridgeHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn lock(osc: &Mutex<Option<OscSender>>) -> MutexGuard<'_, Option<OscSender>> {
    osc.lock().unwrap_or_else(|e| e.into_inner())
}

async fn drain_events(mut events: mpsc::UnboundedReceiver<AppEvent>, state: Arc<HeartRateState>) {
    while let Some(event) = events.recv().await {
        match event {
            AppEvent::Measurement(bytes) => state.on_characteristic_changed(&bytes),
            AppEvent::ConnectionState(connection_state) => {
                state.on_connection_state(connection_state)
            }
            AppEvent::DeviceFound(device) => {
                let name = device.name.clone();
                if state.on_scan_result(device) {
                    debug!("Discovered {}", name);
                }
            }
            AppEvent::LogMessage(msg) => match msg.severity {
                MessageSeverity::Info | MessageSeverity::Success => info!("{}", msg.message),
                MessageSeverity::Warning => warn!("{}", msg.message),
                MessageSeverity::Error => error!("{}", msg.message),
            },
        }
    }
}

async fn forward_heart_rate(
    mut heart_rates: broadcast::Receiver<Option<u16>>,
    pulse: Arc<PulseGenerator>,
    osc: SharedSender,
) {
    loop {
        let bpm = match heart_rates.recv().await {
            Ok(bpm) => bpm,
            Err(RecvError::Lagged(skipped)) => {
                warn!("Heart rate observer lagged, skipped {} values", skipped);
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        if let Some(sender) = lock(&osc).as_ref() {
            sender.update_heart_rate(bpm);
        }
        match bpm {
            Some(bpm) if bpm > 0 => pulse.start(bpm),
            _ => pulse.stop(),
        }
    }
}

async fn forward_connection_state(
    mut states: broadcast::Receiver<ConnectionState>,
    pulse: Arc<PulseGenerator>,
    osc: SharedSender,
) {
    loop {
        let state = match states.recv().await {
            Ok(state) => state,
            Err(RecvError::Lagged(skipped)) => {
                warn!("Connection observer lagged, skipped {} values", skipped);
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        if let Some(sender) = lock(&osc).as_ref() {
            sender.update_connection_state(state.reports_connected());
        }
        if !state.is_link_up() && !matches!(state, ConnectionState::Reconnecting { .. }) {
            pulse.stop();
        }
    }
}

async fn apply_settings(
    mut settings: watch::Receiver<OscSettings>,
    state: Arc<HeartRateState>,
    pulse: Arc<PulseGenerator>,
    osc: SharedSender,
) {
    while settings.changed().await.is_ok() {
        let updated = settings.borrow_and_update().clone();
        pulse.set_pulse_duration(updated.pulse_duration_ms);

        let mut current = lock(&osc);
        if let Some(old) = current.take() {
            old.cleanup();
        }
        match OscSender::from_settings(&updated, &pulse) {
            Ok(sender) => {
                sender.update_connection_state(state.connection_state.get().reports_connected());
                sender.update_heart_rate(state.heart_rate.get());
                info!("OSC target changed to {}:{}", updated.host, updated.port);
                *current = Some(sender);
            }
            Err(e) => error!("Failed to open OSC sender: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::osc::codec::OscMessage;
    use std::time::Duration;
    use tokio::net::UdpSocket;

    const RECV_TIMEOUT: Duration = Duration::from_secs(2);

    fn device(id: &str, rssi: i16) -> ScannedDevice {
        ScannedDevice {
            id: id.to_string(),
            name: "Polar H10".to_string(),
            address: "AA:BB:CC:DD:EE:FF".to_string(),
            signal_strength: Some(rssi),
        }
    }

    async fn receiver() -> (UdpSocket, OscSettings) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let settings = OscSettings {
            host: "127.0.0.1".to_string(),
            port: socket.local_addr().unwrap().port(),
            ..OscSettings::default()
        };
        (socket, settings)
    }

    async fn recv(socket: &UdpSocket) -> Vec<u8> {
        let mut buf = [0u8; 256];
        let (len, _) = tokio::time::timeout(RECV_TIMEOUT, socket.recv_from(&mut buf))
            .await
            .expect("timed out waiting for datagram")
            .unwrap();
        buf[..len].to_vec()
    }

    /// Receive until a datagram equal to `expected` arrives.
    async fn recv_until(socket: &UdpSocket, expected: &[u8]) {
        for _ in 0..32 {
            if recv(socket).await == expected {
                return;
            }
        }
        panic!("expected datagram never arrived");
    }

    #[test]
    fn test_measurement_updates_state() {
        let state = HeartRateState::new();
        state.on_characteristic_changed(&[0x19, 0x4B, 0x00, 0x10, 0x00, 0xE8, 0x03]);

        assert_eq!(state.heart_rate.get(), Some(75));
        assert_eq!(state.energy_expended.get(), Some(16));
        assert_eq!(state.rr_intervals.get(), vec![1000]);
    }

    #[test]
    fn test_fields_follow_latest_packet_only() {
        let state = HeartRateState::new();
        state.on_characteristic_changed(&[0x18, 70, 0x10, 0x00, 0x00, 0x04]);
        assert_eq!(state.energy_expended.get(), Some(16));
        assert_eq!(state.rr_intervals.get(), vec![1024]);

        state.on_characteristic_changed(&[0x00, 71]);

        assert_eq!(state.heart_rate.get(), Some(71));
        assert_eq!(state.energy_expended.get(), None);
        assert!(state.rr_intervals.get().is_empty());
    }

    #[test]
    fn test_disconnect_clears_measurements() {
        let state = HeartRateState::new();
        state.on_connection_state(ConnectionState::Connected);
        state.on_characteristic_changed(&[0x18, 80, 0x10, 0x00, 0x00, 0x04]);

        state.on_connection_state(ConnectionState::Disconnected);

        assert_eq!(state.heart_rate.get(), None);
        assert_eq!(state.energy_expended.get(), None);
        assert!(state.rr_intervals.get().is_empty());
        assert_eq!(state.connection_state.get(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_reconnecting_keeps_last_heart_rate() {
        let state = HeartRateState::new();
        state.on_characteristic_changed(&[0x00, 90]);
        state.on_connection_state(ConnectionState::Reconnecting {
            attempt: 1,
            max_attempts: 5,
        });
        assert_eq!(state.heart_rate.get(), Some(90));
    }

    #[test]
    fn test_scan_results_deduplicated_by_id() {
        let state = HeartRateState::new();
        assert!(state.on_scan_result(device("a", -70)));
        assert!(!state.on_scan_result(device("a", -50)));
        assert!(state.on_scan_result(device("b", -80)));

        let devices = state.discovered_devices.get();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].signal_strength, Some(-50));
    }

    #[tokio::test]
    async fn test_invalid_settings_rejected() {
        let settings = OscSettings {
            port: 0,
            ..OscSettings::default()
        };
        assert!(HeartRateBridge::new(settings).is_err());
    }

    #[tokio::test]
    async fn test_events_reach_osc() {
        let (socket, settings) = receiver().await;
        let mut bridge = HeartRateBridge::new(settings).unwrap().spawn();
        let events = bridge.event_sender();

        events
            .send(AppEvent::ConnectionState(ConnectionState::Connected))
            .unwrap();
        assert_eq!(
            recv(&socket).await,
            OscMessage::bool("/avatar/parameters/isHRConnected", true).encode().unwrap()
        );

        events.send(AppEvent::Measurement(vec![0x00, 75])).unwrap();
        assert_eq!(
            recv(&socket).await,
            OscMessage::int("/avatar/parameters/HR", 75).encode().unwrap()
        );

        // First beat lands a quarter interval later
        recv_until(
            &socket,
            &OscMessage::bool("/avatar/parameters/HeartBeatToggle", true).encode().unwrap(),
        )
        .await;
        assert!(bridge.pulse().is_running());
        assert_eq!(bridge.pulse().current_bpm(), 75);

        bridge.shutdown();
        bridge.shutdown();
    }

    #[tokio::test]
    async fn test_disconnect_stops_pulse() {
        let (socket, settings) = receiver().await;
        let mut bridge = HeartRateBridge::new(settings).unwrap().spawn();
        let events = bridge.event_sender();

        events
            .send(AppEvent::ConnectionState(ConnectionState::Connected))
            .unwrap();
        events.send(AppEvent::Measurement(vec![0x00, 120])).unwrap();
        recv_until(
            &socket,
            &OscMessage::int("/avatar/parameters/HR", 120).encode().unwrap(),
        )
        .await;

        events
            .send(AppEvent::ConnectionState(ConnectionState::Disconnected))
            .unwrap();
        recv_until(
            &socket,
            &OscMessage::bool("/avatar/parameters/isHRConnected", false).encode().unwrap(),
        )
        .await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!bridge.pulse().is_running());
        assert!(!bridge.pulse().toggle_state());
        assert_eq!(bridge.state().heart_rate.get(), None);

        bridge.shutdown();
    }

    #[tokio::test]
    async fn test_reconnecting_keeps_link_reported_and_pulse_running() {
        let (socket, settings) = receiver().await;
        let mut bridge = HeartRateBridge::new(settings).unwrap().spawn();
        let events = bridge.event_sender();
        let connected_true = OscMessage::bool("/avatar/parameters/isHRConnected", true)
            .encode()
            .unwrap();

        events
            .send(AppEvent::ConnectionState(ConnectionState::Connected))
            .unwrap();
        assert_eq!(recv(&socket).await, connected_true);
        events.send(AppEvent::Measurement(vec![0x00, 120])).unwrap();
        assert_eq!(
            recv(&socket).await,
            OscMessage::int("/avatar/parameters/HR", 120).encode().unwrap()
        );

        events
            .send(AppEvent::ConnectionState(ConnectionState::Reconnecting {
                attempt: 1,
                max_attempts: 5,
            }))
            .unwrap();
        recv_until(&socket, &connected_true).await;

        // Beats keep coming while the link is being restored
        let mut toggles = bridge.pulse().subscribe_toggle();
        assert!(tokio::time::timeout(RECV_TIMEOUT, toggles.recv())
            .await
            .is_ok());
        assert!(matches!(
            bridge.state().connection_state.get(),
            ConnectionState::Reconnecting { attempt: 1, .. }
        ));
        assert!(bridge.pulse().is_running());
        assert_eq!(bridge.pulse().current_bpm(), 120);
        assert_eq!(bridge.state().heart_rate.get(), Some(120));

        bridge.shutdown();
    }

    #[tokio::test]
    async fn test_reconfigure_primes_new_target() {
        let (_old_socket, settings) = receiver().await;
        let mut bridge = HeartRateBridge::new(settings).unwrap().spawn();
        bridge
            .event_sender()
            .send(AppEvent::ConnectionState(ConnectionState::Connected))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (new_socket, new_settings) = receiver().await;
        let new_port = new_settings.port;
        bridge
            .reconfigure(OscSettings {
                pulse_duration_ms: 120,
                ..new_settings
            })
            .unwrap();

        assert_eq!(
            recv(&new_socket).await,
            OscMessage::bool("/avatar/parameters/isHRConnected", true).encode().unwrap()
        );
        assert_eq!(bridge.osc_endpoint().map(|e| e.port), Some(new_port));
        assert_eq!(bridge.pulse().pulse_duration(), Duration::from_millis(120));

        bridge.shutdown();
    }

    #[tokio::test]
    async fn test_reconfigure_rejects_blank_host() {
        let (_socket, settings) = receiver().await;
        let mut bridge = HeartRateBridge::new(settings.clone()).unwrap().spawn();

        let result = bridge.reconfigure(OscSettings {
            host: "  ".to_string(),
            ..settings
        });
        assert!(result.is_err());
        assert!(bridge.osc_endpoint().is_some());

        bridge.shutdown();
    }
}
