use anyhow::Context;
use clap::Parser;
use heart_osc::app::HeartRateBridge;
use heart_osc::domain::models::{ConnectionState, ScannedDevice};
use heart_osc::domain::settings::{Settings, SettingsService};
use heart_osc::infrastructure::bluetooth::{BluetoothCommand, BluetoothService};
use heart_osc::infrastructure::logging::init_logger;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Settings file (defaults to the per-user config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// OSC destination host
    #[arg(long)]
    host: Option<String>,

    /// OSC destination port
    #[arg(long)]
    port: Option<u16>,

    /// Connect only to a sensor whose name, address or id matches
    #[arg(long)]
    device: Option<String>,

    /// List sensors without connecting
    #[arg(long)]
    scan_only: bool,

    /// How long the beat pulse parameter stays on
    #[arg(long)]
    pulse_duration_ms: Option<u64>,
}

impl Cli {
    fn apply(&self, settings: &mut Settings) {
        if let Some(host) = &self.host {
            settings.osc.host = host.clone();
        }
        if let Some(port) = self.port {
            settings.osc.port = port;
        }
        if let Some(duration) = self.pulse_duration_ms {
            settings.osc.pulse_duration_ms = duration;
        }
        if let Some(device) = &self.device {
            settings.bluetooth.preferred_device = Some(device.clone());
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings_service = match &cli.config {
        Some(path) => SettingsService::load(path.clone()),
        None => SettingsService::new()?,
    };
    if !settings_service.path().exists() {
        if let Err(e) = settings_service.save() {
            eprintln!("Failed to write default settings: {}", e);
        }
    }
    cli.apply(settings_service.get_mut());
    let settings = settings_service.get().clone();

    let _logging_guard = init_logger(&settings.log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    info!("Starting heart_osc");
    info!("Settings file: {}", settings_service.path().display());
    info!(
        "Sending to {}:{} (pulse {}ms)",
        settings.osc.host, settings.osc.port, settings.osc.pulse_duration_ms
    );

    let mut bridge = HeartRateBridge::new(settings.osc.clone())
        .context("Failed to start OSC bridge")?
        .spawn();

    let bluetooth = BluetoothService::new(
        bridge.event_sender(),
        settings.bluetooth.clone(),
        !cli.scan_only,
    )
    .await
    .context("Failed to open Bluetooth adapter")?;

    let (commands, command_receiver) = mpsc::unbounded_channel();
    let bluetooth_task = tokio::spawn(bluetooth.run(command_receiver));

    let status_task = tokio::spawn(report_status(
        bridge.state().discovered_devices.subscribe(),
        bridge.state().connection_state.subscribe(),
    ));

    commands.send(BluetoothCommand::StartScan)?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Shutting down");

    let _ = commands.send(BluetoothCommand::Disconnect);
    drop(commands);
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, bluetooth_task)
        .await
        .is_err()
    {
        warn!("Bluetooth service did not stop in time");
    }

    status_task.abort();
    bridge.shutdown();
    Ok(())
}

/// Print discovered sensors and link changes for the user.
async fn report_status(
    mut devices: broadcast::Receiver<Vec<ScannedDevice>>,
    mut states: broadcast::Receiver<ConnectionState>,
) {
    let mut reported = 0;
    loop {
        tokio::select! {
            list = devices.recv() => match list {
                Ok(list) => {
                    for device in list.iter().skip(reported) {
                        println!(
                            "Found {} [{}] rssi {:?} (id: {})",
                            device.name, device.address, device.signal_strength, device.id
                        );
                    }
                    reported = reported.max(list.len());
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
            state = states.recv() => match state {
                Ok(ConnectionState::Error { message }) => error!("Sensor error: {}", message),
                Ok(state) => println!("Sensor: {}", state),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}
