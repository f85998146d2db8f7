use std::path::PathBuf;
use std::sync::Arc;
use clap::{Parser, Subcommand};
use futures::channel::mpsc::{unbounded, UnboundedReceiver};
use futures::StreamExt;
use log::{info, LevelFilter};
use tokio::time::{sleep, Duration};

use crate::config::credentials::{CredentialStore, FileCredentialStore, MemoryCredentialStore, CREDENTIALS_FILE_NAME};
use crate::config::io::ConfigIO;
use crate::config::types::Config;
use crate::device::btle::BtleTransport;
use crate::device::fake::FakeTransport;
use crate::device::session::SessionManager;
use crate::device::transport::Transport;
use crate::device::types::{CommandResult, ConnectionState, DeviceRecord, SessionCallbacks, SessionEvent};
use crate::error::{AppRunError, SessionError};

// cadence of the simulated sensor
const DEMO_FEED_INTERVAL: u64 = 100;

#[derive(Debug, Parser)]
#[command(name = "sensor-link", version, about = "Scan for, log in to and stream from BLE sensors")]
pub struct Cli {
    /// Use a simulated sensor instead of the bluetooth adapter
    #[arg(long, global = true)]
    pub simulate: bool,

    /// Config file to use instead of the default location
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log debug output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List nearby sensors
    Scan {
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Log in to a sensor and print its measurements
    Connect {
        device: String,
        #[arg(long)]
        credential: String,
        /// How long to stream before logging out
        #[arg(long, default_value_t = 10)]
        seconds: u64,
    },
    /// Log in to a sensor and send it a single free-form command
    Aux {
        device: String,
        #[arg(long)]
        credential: String,
        command: String,
    },
}

impl Cli {
    pub fn log_level(&self) -> LevelFilter {
        if self.verbose { LevelFilter::Debug } else { LevelFilter::Info }
    }
}

pub fn run(cli: Cli) -> Result<(), AppRunError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|source| AppRunError::Runtime { source })?;

    runtime.block_on(run_session(cli))
}

async fn run_session(cli: Cli) -> Result<(), AppRunError> {
    let config_io = ConfigIO::new_sync(cli.config.clone())?;
    // obtain an exclusive file lock so that only one instance drives the adapter
    let mut locker = config_io.locker()?;
    let _guard = locker.lock()?;

    let config = match config_io.read().await {
        Ok(config) => config,
        Err(err) if err.is_file_not_found_error() => {
            info!("Config file not found, using defaults");
            Config::default()
        },
        Err(err) => return Err(err.into()),
    };

    let (transport, credentials): (Arc<dyn Transport>, Arc<dyn CredentialStore>) = if cli.simulate {
        info!("Using simulated sensor");
        (
            Arc::new(FakeTransport::demo(Duration::from_millis(DEMO_FEED_INTERVAL))),
            Arc::new(MemoryCredentialStore::new()),
        )
    } else {
        let transport = BtleTransport::new(config.write_timeout()).await.map_err(SessionError::from)?;
        let credentials_path = config_io.directory().join(CREDENTIALS_FILE_NAME);
        (Arc::new(transport), Arc::new(FileCredentialStore::new(credentials_path)))
    };

    let (sender, mut events) = unbounded();
    let session = SessionManager::new(transport, credentials, config)
        .with_callbacks(SessionCallbacks::channel(sender));

    let result = match cli.command {
        Command::Scan { timeout_ms } => scan(&session, &mut events, timeout_ms.map(Duration::from_millis)).await,
        Command::Connect { device, credential, seconds } => {
            stream(&session, &mut events, &device, &credential, Duration::from_secs(seconds)).await.map(|count| {
                info!("Received {} measurement(s)", count);
            })
        },
        Command::Aux { device, credential, command } => {
            aux(&session, &mut events, &device, &credential, &command).await
        },
    };

    session.dispose().await;
    Ok(result?)
}

fn print_devices(devices: &[DeviceRecord]) {
    println!("{:<20} {:>8}  {:<24} {}", "ADDRESS", "RSSI", "NAME", "SAVED");
    for device in devices {
        println!(
            "{:<20} {:>4} dBm  {:<24} {}",
            device.id,
            device.signal_strength,
            device.display_name,
            if device.stored_credential.is_some() { "yes" } else { "" },
        );
    }
}

fn print_result(action: &str, result: &CommandResult) {
    let outcome = if result.success { "succeeded" } else { "failed" };
    println!("{} {}: {}", action, outcome, result.message);
}

async fn scan(session: &SessionManager, events: &mut UnboundedReceiver<SessionEvent>, timeout: Option<Duration>) -> Result<(), SessionError> {
    session.scan_for_devices(timeout).await?;

    while let Some(event) = events.next().await {
        match event {
            SessionEvent::DevicesFound(devices) => info!("{} device(s) found", devices.len()),
            SessionEvent::StateChange(ConnectionState::Disconnected) => break,
            _ => {},
        }
    }

    print_devices(&session.get_available_devices());
    Ok(())
}

/// Scan until `device_id` shows up or the scan times out.
async fn find_device(session: &SessionManager, events: &mut UnboundedReceiver<SessionEvent>, device_id: &str) -> Result<(), SessionError> {
    session.scan_for_devices(None).await?;

    while let Some(event) = events.next().await {
        match event {
            SessionEvent::DevicesFound(devices) if devices.iter().any(|device| device.id == device_id) => {
                session.stop_scan().await;
                return Ok(());
            },
            SessionEvent::StateChange(ConnectionState::Disconnected) => break,
            _ => {},
        }
    }

    Err(SessionError::DeviceNotFound(device_id.to_string()))
}

async fn log_in(session: &SessionManager, events: &mut UnboundedReceiver<SessionEvent>, device_id: &str, credential: &str) -> Result<bool, SessionError> {
    find_device(session, events, device_id).await?;

    let result = session.connect_with_credential(device_id, credential).await?;
    print_result("Login", &result);
    Ok(result.success)
}

/// Drop what was queued before now; those state changes are already handled.
fn discard_pending(events: &mut UnboundedReceiver<SessionEvent>) {
    while let Ok(Some(_)) = events.try_next() {}
}

/// Log in and print measurements for `duration`. Returns how many were printed.
async fn stream(
    session: &SessionManager,
    events: &mut UnboundedReceiver<SessionEvent>,
    device_id: &str,
    credential: &str,
    duration: Duration,
) -> Result<usize, SessionError> {
    if !log_in(session, events, device_id, credential).await? {
        return Ok(0);
    }
    discard_pending(events);

    let mut count = 0;
    let deadline = sleep(duration);
    tokio::pin!(deadline);

    'mainloop: loop {
        tokio::select! {
            _ = &mut deadline => break 'mainloop,
            event = events.next() => match event {
                Some(SessionEvent::Measurement(measurement)) => {
                    println!(
                        "{} {:>10.2} {}",
                        humantime::format_rfc3339_millis(measurement.captured_at),
                        measurement.value,
                        measurement.unit,
                    );
                    count += 1;
                },
                Some(SessionEvent::StateChange(ConnectionState::Disconnected)) | None => break 'mainloop,
                Some(_) => {},
            },
        }
    }

    if session.state() == ConnectionState::Authenticated {
        let result = session.disconnect_with_credential(credential).await?;
        print_result("Logout", &result);
    }
    Ok(count)
}

async fn aux(
    session: &SessionManager,
    events: &mut UnboundedReceiver<SessionEvent>,
    device_id: &str,
    credential: &str,
    command: &str,
) -> Result<(), SessionError> {
    if !log_in(session, events, device_id, credential).await? {
        return Ok(());
    }

    session.trigger_auxiliary_command(command).await?;
    println!("Sent {:?}", command);

    let result = session.disconnect_with_credential(credential).await?;
    print_result("Logout", &result);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEMO_SENSOR: &str = "00:11:22:33:44:55";

    fn demo_session() -> (SessionManager, UnboundedReceiver<SessionEvent>) {
        let (sender, events) = unbounded();
        let session = SessionManager::new(
            Arc::new(FakeTransport::demo(Duration::from_millis(DEMO_FEED_INTERVAL))),
            Arc::new(MemoryCredentialStore::new()),
            Config::default(),
        ).with_callbacks(SessionCallbacks::channel(sender));
        (session, events)
    }

    #[tokio::test(start_paused = true)]
    async fn connect_streams_until_the_deadline() {
        let (session, mut events) = demo_session();

        let started = tokio::time::Instant::now();
        let count = stream(&session, &mut events, DEMO_SENSOR, "1234", Duration::from_secs(1)).await.unwrap();

        assert!(count >= 5, "only {} measurements", count);
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert_eq!(session.state(), ConnectionState::Connected);
        session.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn connect_to_missing_sensor_fails_after_the_scan() {
        let (session, mut events) = demo_session();

        let result = stream(&session, &mut events, "AA:AA:AA:AA:AA:AA", "1234", Duration::from_secs(1)).await;

        assert!(matches!(result, Err(SessionError::DeviceNotFound(_))));
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn aux_logs_in_sends_and_logs_out() {
        let (session, mut events) = demo_session();

        aux(&session, &mut events, DEMO_SENSOR, "1234", "BLINK").await.unwrap();

        assert_eq!(session.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn scan_lists_only_sensors() {
        let (session, mut events) = demo_session();

        scan(&session, &mut events, Some(Duration::from_millis(500))).await.unwrap();

        let devices = session.get_available_devices();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id, DEMO_SENSOR);
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }
}
