use std::fmt;

/// One decoded Heart Rate Measurement notification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeartRateMeasurement {
    pub heart_rate: u16,
    /// Cumulative energy expended in kJ, when the sensor reports it
    pub energy_expended: Option<u16>,
    /// RR intervals in 1/1024 s units, oldest first
    pub rr_intervals: Vec<u16>,
}

/// Sensor contact status carried in flag bits 1-2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorContact {
    NotSupported,
    NotDetected,
    Detected,
}

/// Link state as reported by the Bluetooth side.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Discovering,
    Reconnecting {
        attempt: u32,
        max_attempts: u32,
    },
    Error {
        message: String,
    },
}

impl ConnectionState {
    /// True while the sensor link is usable for data.
    pub fn is_link_up(&self) -> bool {
        matches!(self, Self::Connected | Self::Discovering)
    }

    /// Value mirrored to the connection OSC parameter.
    ///
    /// A reconnect in progress keeps reporting `true` so avatars do not
    /// flicker on short radio drops.
    pub fn reports_connected(&self) -> bool {
        self.is_link_up() || matches!(self, Self::Reconnecting { .. })
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Discovering => write!(f, "Discovering"),
            Self::Reconnecting {
                attempt,
                max_attempts,
            } => write!(f, "Reconnecting ({}/{})", attempt, max_attempts),
            Self::Error { message } => write!(f, "Error: {}", message),
        }
    }
}

/// A heart rate sensor seen during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedDevice {
    /// Platform peripheral id, rendered as a string
    pub id: String,
    pub name: String,
    pub address: String,
    pub signal_strength: Option<i16>,
}

/// Events flowing from the Bluetooth side into the bridge.
#[derive(Debug, Clone)]
pub enum AppEvent {
    DeviceFound(ScannedDevice),
    ConnectionState(ConnectionState),
    /// Raw Heart Rate Measurement characteristic value
    Measurement(Vec<u8>),
    LogMessage(StatusMessage),
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_mapping() {
        assert!(ConnectionState::Connected.reports_connected());
        assert!(ConnectionState::Discovering.reports_connected());
        assert!(ConnectionState::Reconnecting {
            attempt: 1,
            max_attempts: 5
        }
        .reports_connected());
        assert!(!ConnectionState::Connecting.reports_connected());
        assert!(!ConnectionState::Disconnected.reports_connected());
        assert!(!ConnectionState::Error {
            message: "lost".into()
        }
        .reports_connected());
    }

    #[test]
    fn test_display() {
        let state = ConnectionState::Reconnecting {
            attempt: 2,
            max_attempts: 5,
        };
        assert_eq!(state.to_string(), "Reconnecting (2/5)");
    }
}
