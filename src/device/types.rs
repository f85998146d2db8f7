use std::fmt;
use std::time::SystemTime;
use futures::channel::mpsc::UnboundedSender;
use serde::Serialize;

use crate::error::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Scanning,
    Connecting,
    Connected,
    Authenticated,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let result = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Scanning => "scanning",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Authenticated => "authenticated",
            ConnectionState::Error => "in error",
        };

        write!(f, "{}", result)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AdapterState {
    PoweredOn,
    PoweredOff,
    Unauthorized,
    Unsupported,
    Unknown,
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let result = match self {
            AdapterState::PoweredOn => "powered on",
            AdapterState::PoweredOff => "powered off",
            AdapterState::Unauthorized => "unauthorized",
            AdapterState::Unsupported => "unsupported",
            AdapterState::Unknown => "unknown",
        };

        write!(f, "{}", result)
    }
}

/// A peer that passed the name filter during the current scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub id: String,
    pub display_name: String,
    pub signal_strength: i16,
    pub stored_credential: Option<String>,
}

/// Raw advertisement as reported by the transport, before filtering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovery {
    pub id: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Measurement {
    pub value: f64,
    pub captured_at: SystemTime,
    pub unit: String,
}

/// Outcome of a connect/disconnect exchange, meant for direct display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandResult {
    pub success: bool,
    pub message: String,
}

impl CommandResult {
    pub fn ok(message: impl Into<String>) -> Self {
        CommandResult { success: true, message: message.into() }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        CommandResult { success: false, message: message.into() }
    }
}

pub type MeasurementCallback = Box<dyn Fn(Measurement) + Send + Sync>;
pub type StateCallback = Box<dyn Fn(ConnectionState) + Send + Sync>;
pub type DevicesCallback = Box<dyn Fn(Vec<DeviceRecord>) + Send + Sync>;
pub type ErrorCallback = Box<dyn Fn(&SessionError) + Send + Sync>;

/// Presentation-layer hooks. Callbacks run inline on the task that caused the
/// event and must not block.
#[derive(Default)]
pub struct SessionCallbacks {
    pub on_measurement: Option<MeasurementCallback>,
    pub on_state_change: Option<StateCallback>,
    pub on_devices_found: Option<DevicesCallback>,
    pub on_error: Option<ErrorCallback>,
}

impl SessionCallbacks {
    pub fn measurement(&self, measurement: Measurement) {
        if let Some(callback) = &self.on_measurement {
            callback(measurement);
        }
    }

    pub fn state_change(&self, state: ConnectionState) {
        if let Some(callback) = &self.on_state_change {
            callback(state);
        }
    }

    pub fn devices_found(&self, devices: Vec<DeviceRecord>) {
        if let Some(callback) = &self.on_devices_found {
            callback(devices);
        }
    }

    pub fn error(&self, error: &SessionError) {
        if let Some(callback) = &self.on_error {
            callback(error);
        }
    }
}

impl SessionCallbacks {
    /// Forward every notification into a channel, for consumers that prefer a stream.
    pub fn channel(sender: UnboundedSender<SessionEvent>) -> Self {
        let measurement = sender.clone();
        let state = sender.clone();
        let devices = sender.clone();
        let error = sender;

        // a closed receiver only means nobody is listening anymore
        SessionCallbacks {
            on_measurement: Some(Box::new(move |m| {
                let _ = measurement.unbounded_send(SessionEvent::Measurement(m));
            })),
            on_state_change: Some(Box::new(move |s| {
                let _ = state.unbounded_send(SessionEvent::StateChange(s));
            })),
            on_devices_found: Some(Box::new(move |d| {
                let _ = devices.unbounded_send(SessionEvent::DevicesFound(d));
            })),
            on_error: Some(Box::new(move |e| {
                let _ = error.unbounded_send(SessionEvent::Error(e.to_string()));
            })),
        }
    }
}

impl fmt::Debug for SessionCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCallbacks")
            .field("on_measurement", &self.on_measurement.is_some())
            .field("on_state_change", &self.on_state_change.is_some())
            .field("on_devices_found", &self.on_devices_found.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// The same notifications as [`SessionCallbacks`], as a single value that can be sent
/// over a channel.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChange(ConnectionState),
    Measurement(Measurement),
    DevicesFound(Vec<DeviceRecord>),
    Error(String),
}
