//! OSC Sender
//!
//! Mirrors heart rate, connection state and the heartbeat signals onto four
//! OSC addresses. Every change becomes one UDP datagram; datagrams are
//! handed to a background writer so callers never wait on the network.

use crate::domain::pulse::PulseGenerator;
use crate::domain::settings::OscSettings;
use crate::infrastructure::osc::codec::OscMessage;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Error)]
pub enum OscError {
    #[error("invalid OSC endpoint {host}:{port}")]
    InvalidEndpoint { host: String, port: u16 },
    #[error("failed to open UDP socket: {0}")]
    Socket(#[from] std::io::Error),
}

/// Destination of all datagrams of one sender
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OscEndpoint {
    pub host: String,
    pub port: u16,
}

/// Parameter addresses for the four mirrored values
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OscAddresses {
    pub heart_rate: String,
    pub connected: String,
    pub heartbeat_toggle: String,
    pub heartbeat_pulse: String,
}

impl From<&OscSettings> for OscEndpoint {
    fn from(settings: &OscSettings) -> Self {
        Self {
            host: settings.host.trim().to_string(),
            port: settings.port,
        }
    }
}

impl From<&OscSettings> for OscAddresses {
    fn from(settings: &OscSettings) -> Self {
        Self {
            heart_rate: settings.hr_param.clone(),
            connected: settings.hr_connected_param.clone(),
            heartbeat_toggle: settings.heartbeat_toggle_param.clone(),
            heartbeat_pulse: settings.heartbeat_pulse_param.clone(),
        }
    }
}

type Outbox = mpsc::UnboundedSender<Vec<u8>>;

pub struct OscSender {
    endpoint: OscEndpoint,
    addresses: Arc<OscAddresses>,
    local_addr: SocketAddr,
    /// `None` once cleaned up
    outbox: Mutex<Option<Outbox>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    last_heart_rate: Mutex<Option<u16>>,
    connected: Arc<AtomicBool>,
}

impl OscSender {
    /// Open the socket and subscribe to the generator's toggle and pulse.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        endpoint: OscEndpoint,
        addresses: OscAddresses,
        pulse_generator: &PulseGenerator,
    ) -> Result<Self, OscError> {
        if endpoint.host.is_empty() || endpoint.port == 0 {
            return Err(OscError::InvalidEndpoint {
                host: endpoint.host,
                port: endpoint.port,
            });
        }

        let socket = bind_socket(&endpoint.host)?;
        let local_addr = socket.local_addr()?;
        let addresses = Arc::new(addresses);
        let connected = Arc::new(AtomicBool::new(false));
        let (outbox, datagrams) = mpsc::unbounded_channel();

        let writer = tokio::spawn(run_writer(socket, endpoint.clone(), datagrams));
        let toggle_task = tokio::spawn(forward_toggle(
            pulse_generator.subscribe_toggle(),
            outbox.clone(),
            addresses.clone(),
            connected.clone(),
        ));
        let pulse_task = tokio::spawn(forward_pulse(
            pulse_generator.subscribe_pulse(),
            outbox.clone(),
            addresses.clone(),
        ));

        info!("OSC sender initialized for {}:{}", endpoint.host, endpoint.port);

        Ok(Self {
            endpoint,
            addresses,
            local_addr,
            outbox: Mutex::new(Some(outbox)),
            tasks: Mutex::new(vec![toggle_task, pulse_task, writer]),
            last_heart_rate: Mutex::new(None),
            connected,
        })
    }

    pub fn from_settings(
        settings: &OscSettings,
        pulse_generator: &PulseGenerator,
    ) -> Result<Self, OscError> {
        Self::new(settings.into(), settings.into(), pulse_generator)
    }

    pub fn endpoint(&self) -> &OscEndpoint {
        &self.endpoint
    }

    /// Local address of the sending socket
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.outbox).is_none()
    }

    /// Send the heart rate if it differs from the last value seen.
    /// `None` is remembered but not sent.
    pub fn update_heart_rate(&self, bpm: Option<u16>) {
        let Some(outbox) = self.outbox() else {
            debug!("OSC sender closed, dropping heart rate update");
            return;
        };

        {
            let mut last = lock(&self.last_heart_rate);
            if *last == bpm {
                return;
            }
            *last = bpm;
        }

        if let Some(bpm) = bpm {
            queue(
                &outbox,
                OscMessage::int(&self.addresses.heart_rate, i32::from(bpm)),
            );
            debug!("Sent HR: {} bpm", bpm);
        }
    }

    /// Always sends; callers decide which transitions matter.
    pub fn update_connection_state(&self, connected: bool) {
        let Some(outbox) = self.outbox() else {
            debug!("OSC sender closed, dropping connection update");
            return;
        };

        self.connected.store(connected, Ordering::SeqCst);
        queue(&outbox, OscMessage::bool(&self.addresses.connected, connected));
        debug!("Sent {}: {}", self.addresses.connected, connected);
    }

    /// Cancel subscriptions and close the socket. Idempotent.
    pub fn cleanup(&self) {
        if lock(&self.outbox).take().is_none() {
            return;
        }
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        info!(
            "OSC sender for {}:{} cleaned up",
            self.endpoint.host, self.endpoint.port
        );
    }

    fn outbox(&self) -> Option<Outbox> {
        lock(&self.outbox).clone()
    }
}

impl Drop for OscSender {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Bind an ephemeral socket of the family matching an IP literal host.
/// Hostnames get an IPv4 socket.
fn bind_socket(host: &str) -> Result<UdpSocket, OscError> {
    let unspecified = match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(_)) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        _ => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
    };
    let socket = std::net::UdpSocket::bind(SocketAddr::new(unspecified, 0))?;
    socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(socket)?)
}

fn queue(outbox: &Outbox, message: OscMessage<'_>) {
    let datagram = match message.encode() {
        Ok(datagram) => datagram,
        Err(e) => {
            error!("Failed to encode OSC message {}: {}", message.address, e);
            return;
        }
    };
    if outbox.send(datagram).is_err() {
        trace!("OSC writer gone, dropped {}", message.address);
    }
}

/// Owns the socket; it is closed when this task ends or is aborted.
async fn run_writer(
    socket: UdpSocket,
    endpoint: OscEndpoint,
    mut datagrams: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    let mut target: Option<SocketAddr> = None;

    while let Some(datagram) = datagrams.recv().await {
        let addr = match target {
            Some(addr) => addr,
            None => match resolve(&endpoint).await {
                Some(addr) => {
                    target = Some(addr);
                    addr
                }
                None => continue,
            },
        };

        match socket.send_to(&datagram, addr).await {
            Ok(_) => trace!("Sent {} byte OSC datagram to {}", datagram.len(), addr),
            Err(e) => {
                error!(
                    "Failed to send OSC message to {}:{}: {}",
                    endpoint.host, endpoint.port, e
                );
                // Resolve again next time in case the host moved
                target = None;
            }
        }
    }
}

async fn resolve(endpoint: &OscEndpoint) -> Option<SocketAddr> {
    match tokio::net::lookup_host((endpoint.host.as_str(), endpoint.port)).await {
        Ok(mut addrs) => {
            let addr = addrs.next();
            if addr.is_none() {
                error!("No address found for OSC host {}", endpoint.host);
            }
            addr
        }
        Err(e) => {
            error!("Failed to resolve OSC host {}: {}", endpoint.host, e);
            None
        }
    }
}

async fn forward_toggle(
    mut toggles: broadcast::Receiver<bool>,
    outbox: Outbox,
    addresses: Arc<OscAddresses>,
    connected: Arc<AtomicBool>,
) {
    loop {
        match toggles.recv().await {
            Ok(state) => {
                queue(&outbox, OscMessage::bool(&addresses.heartbeat_toggle, state));
                // Connection state rides along with every heartbeat
                queue(
                    &outbox,
                    OscMessage::bool(&addresses.connected, connected.load(Ordering::SeqCst)),
                );
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!("Heartbeat toggle observer lagged, skipped {} values", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn forward_pulse(
    mut pulses: broadcast::Receiver<bool>,
    outbox: Outbox,
    addresses: Arc<OscAddresses>,
) {
    loop {
        match pulses.recv().await {
            Ok(state) => queue(&outbox, OscMessage::bool(&addresses.heartbeat_pulse, state)),
            Err(RecvError::Lagged(skipped)) => {
                warn!("Heartbeat pulse observer lagged, skipped {} values", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}
