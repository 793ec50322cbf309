//! Sensor Session Module
//!
//! Keeps one sensor connected for as long as the user wants it, reconnecting
//! with backoff after an unexpected link loss. The radio side sits behind
//! [`SensorLink`] so the state sequence does not depend on a live adapter.

use crate::domain::models::{AppEvent, ConnectionState};
use crate::domain::settings::ReconnectPolicy;
use crate::infrastructure::bluetooth::connection::{BleConnection, LinkEnd};
use crate::infrastructure::bluetooth::service::BluetoothCommand;
use crate::infrastructure::bluetooth::BluetoothError;
use btleplug::api::Characteristic;
use btleplug::platform::Peripheral;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{error, info, warn};

/// One sensor connection as driven by [`supervise`]
pub(crate) trait SensorLink {
    /// Connect and enable notifications
    async fn open(&mut self) -> Result<(), BluetoothError>;

    /// Forward data until the link ends or a disconnect is requested
    async fn stream(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<BluetoothCommand>,
    ) -> LinkEnd;

    /// Release the link. Errors are logged only.
    async fn close(&mut self);
}

/// [`SensorLink`] over a btleplug peripheral
pub(crate) struct PeripheralLink<'a> {
    connection: &'a BleConnection,
    peripheral: Peripheral,
    characteristic: Option<Characteristic>,
}

impl<'a> PeripheralLink<'a> {
    pub(crate) fn new(connection: &'a BleConnection, peripheral: Peripheral) -> Self {
        Self {
            connection,
            peripheral,
            characteristic: None,
        }
    }
}

impl SensorLink for PeripheralLink<'_> {
    async fn open(&mut self) -> Result<(), BluetoothError> {
        self.characteristic = Some(self.connection.connect(&self.peripheral).await?);
        Ok(())
    }

    async fn stream(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<BluetoothCommand>,
    ) -> LinkEnd {
        self.connection.stream(&self.peripheral, commands).await
    }

    async fn close(&mut self) {
        let characteristic = self.characteristic.take();
        self.connection
            .disconnect(&self.peripheral, characteristic.as_ref())
            .await;
    }
}

/// Run one session until the user disconnects or reconnection gives up.
///
/// Emits `Connecting` first, `Reconnecting` before every retry and ends with
/// `Disconnected` or `Error`. A failed first connect is not retried; a
/// successful reconnect starts the attempt count over.
pub(crate) async fn supervise<L: SensorLink>(
    link: &mut L,
    policy: &ReconnectPolicy,
    events: &mpsc::UnboundedSender<AppEvent>,
    commands: &mut mpsc::UnboundedReceiver<BluetoothCommand>,
) {
    let mut attempt = 0u32;
    let mut was_connected = false;

    send_state(events, ConnectionState::Connecting);

    loop {
        match link.open().await {
            Ok(()) => {
                was_connected = true;
                attempt = 0;
                match link.stream(commands).await {
                    LinkEnd::Closed => {
                        link.close().await;
                        send_state(events, ConnectionState::Disconnected);
                        return;
                    }
                    LinkEnd::Lost => warn!("Sensor link lost"),
                }
            }
            Err(e) => {
                error!("Connection failed: {}", e);
                if !was_connected {
                    link.close().await;
                    send_state(
                        events,
                        ConnectionState::Error {
                            message: e.to_string(),
                        },
                    );
                    return;
                }
            }
        }

        attempt += 1;
        link.close().await;

        let Some(delay) = policy.delay_for_attempt(attempt) else {
            send_state(
                events,
                ConnectionState::Error {
                    message: format!("Reconnection failed after {} attempts", policy.max_attempts),
                },
            );
            return;
        };

        send_state(
            events,
            ConnectionState::Reconnecting {
                attempt,
                max_attempts: policy.max_attempts,
            },
        );
        info!(
            "Reconnecting in {}ms (attempt {}/{})",
            delay.as_millis(),
            attempt,
            policy.max_attempts
        );

        if cancelled_during(delay, commands).await {
            send_state(events, ConnectionState::Disconnected);
            return;
        }
    }
}

fn send_state(events: &mpsc::UnboundedSender<AppEvent>, state: ConnectionState) {
    let _ = events.send(AppEvent::ConnectionState(state));
}

/// Sleep for `delay` unless a disconnect arrives first. Returns true when
/// cancelled.
async fn cancelled_during(
    delay: Duration,
    commands: &mut mpsc::UnboundedReceiver<BluetoothCommand>,
) -> bool {
    let deadline = Instant::now() + delay;
    loop {
        tokio::select! {
            _ = sleep_until(deadline) => return false,
            command = commands.recv() => match command {
                Some(BluetoothCommand::Disconnect) | None => return true,
                Some(other) => info!("Ignoring {:?} while reconnecting", other),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Scripted link: each `open` and `stream` call takes the next outcome.
    struct ScriptedLink {
        opens: VecDeque<bool>,
        ends: VecDeque<LinkEnd>,
        closes: usize,
    }

    impl ScriptedLink {
        fn new(opens: &[bool], ends: &[LinkEnd]) -> Self {
            Self {
                opens: opens.iter().copied().collect(),
                ends: ends.iter().copied().collect(),
                closes: 0,
            }
        }
    }

    impl SensorLink for ScriptedLink {
        async fn open(&mut self) -> Result<(), BluetoothError> {
            if self.opens.pop_front().unwrap_or(false) {
                Ok(())
            } else {
                Err(BluetoothError::Timeout("connecting"))
            }
        }

        async fn stream(
            &mut self,
            _commands: &mut mpsc::UnboundedReceiver<BluetoothCommand>,
        ) -> LinkEnd {
            self.ends.pop_front().unwrap_or(LinkEnd::Closed)
        }

        async fn close(&mut self) {
            self.closes += 1;
        }
    }

    fn states(events: &mut mpsc::UnboundedReceiver<AppEvent>) -> Vec<ConnectionState> {
        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let AppEvent::ConnectionState(state) = event {
                states.push(state);
            }
        }
        states
    }

    fn reconnecting(attempt: u32) -> ConnectionState {
        ConnectionState::Reconnecting {
            attempt,
            max_attempts: 5,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_gives_up_after_max_attempts() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (_commands_tx, mut commands) = mpsc::unbounded_channel();
        let mut link = ScriptedLink::new(&[true], &[LinkEnd::Lost]);
        let started = Instant::now();

        supervise(&mut link, &ReconnectPolicy::default(), &events_tx, &mut commands).await;

        assert_eq!(
            states(&mut events_rx),
            vec![
                ConnectionState::Connecting,
                reconnecting(1),
                reconnecting(2),
                reconnecting(3),
                reconnecting(4),
                reconnecting(5),
                ConnectionState::Error {
                    message: "Reconnection failed after 5 attempts".to_string(),
                },
            ]
        );
        // 1 + 2 + 4 + 8 + 16 seconds of backoff
        assert!(started.elapsed() >= Duration::from_secs(31));
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_reconnect_resets_attempts() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (_commands_tx, mut commands) = mpsc::unbounded_channel();
        let mut link = ScriptedLink::new(
            &[true, false, true, true],
            &[LinkEnd::Lost, LinkEnd::Lost, LinkEnd::Closed],
        );

        supervise(&mut link, &ReconnectPolicy::default(), &events_tx, &mut commands).await;

        assert_eq!(
            states(&mut events_rx),
            vec![
                ConnectionState::Connecting,
                reconnecting(1),
                reconnecting(2),
                reconnecting(1),
                ConnectionState::Disconnected,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_first_connect_is_not_retried() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (_commands_tx, mut commands) = mpsc::unbounded_channel();
        let mut link = ScriptedLink::new(&[false], &[]);

        supervise(&mut link, &ReconnectPolicy::default(), &events_tx, &mut commands).await;

        assert_eq!(
            states(&mut events_rx),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Error {
                    message: "Timed out while connecting".to_string(),
                },
            ]
        );
        assert_eq!(link.closes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_during_backoff_stops_session() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (commands_tx, mut commands) = mpsc::unbounded_channel();
        let mut link = ScriptedLink::new(&[true, true], &[LinkEnd::Lost]);
        commands_tx.send(BluetoothCommand::Disconnect).unwrap();

        supervise(&mut link, &ReconnectPolicy::default(), &events_tx, &mut commands).await;

        assert_eq!(
            states(&mut events_rx),
            vec![
                ConnectionState::Connecting,
                reconnecting(1),
                ConnectionState::Disconnected,
            ]
        );
        // Only the lost link was opened
        assert_eq!(link.opens.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_wait_ignores_other_commands() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(BluetoothCommand::StartScan).unwrap();
        tx.send(BluetoothCommand::Disconnect).unwrap();
        assert!(cancelled_during(Duration::from_secs(4), &mut rx).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_wait_elapses() {
        let (_tx, mut rx) = mpsc::unbounded_channel();
        let started = Instant::now();
        assert!(!cancelled_during(Duration::from_secs(2), &mut rx).await);
        assert!(started.elapsed() >= Duration::from_secs(2));
    }
}
