use std::io;
use std::str::Utf8Error;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;
use btleplug;
use serde_json;

use crate::device::types::{AdapterState, ConnectionState};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to determine path to config file")]
    NoConfigPath,

    #[error("Failed to acquire file lock on config file: {source}")]
    CanNotLock { source: io::Error },

    #[error("Failed to encode/decode config as utf-8: {source}")]
    Utf8Error { #[from] source: Utf8Error },

    #[error("Failed to read/write config file: {source}")]
    IOError { #[from] source: io::Error },

    #[error("Failed to parse/build config file: {source}")]
    JsonError { #[from] source: serde_json::Error },
}

impl ConfigError {
    pub fn is_file_not_found_error(&self) -> bool {
        match self {
            ConfigError::IOError { source } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Error communicating with device (btleplug): {source}")]
    Btle { #[from] source: btleplug::Error },

    #[error("No bluetooth adapter is available")]
    NoAdapter,

    #[error("Unknown device {0}")]
    UnknownDevice(String),

    #[error("Characteristic {0} is not available on this connection")]
    UnknownChannel(Uuid),

    #[error("Unknown subscription {0}")]
    UnknownSubscription(u64),

    #[error("Connection to {0} is closed")]
    Closed(String),

    #[error("Write to characteristic {0} took too long")]
    WriteTimeout(Uuid),
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Bluetooth is not available (adapter is {0})")]
    TransportUnavailable(AdapterState),

    #[error("Device {0} was not found; scan for devices first")]
    DeviceNotFound(String),

    #[error("Invalid credential format")]
    InvalidCredentialFormat,

    #[error("Connecting took longer than {0:?}")]
    ConnectionTimeout(Duration),

    #[error("A required bluetooth characteristic is not available: {0}")]
    MissingCapability(Uuid),

    #[error("No response to command within {0:?}")]
    CommandTimeout(Duration),

    #[error("Device rejected the credential: {0}")]
    AuthenticationRejected(String),

    #[error("Transport fault: {source}")]
    TransportFault { #[from] source: TransportError },

    #[error("Another command is still waiting for its response")]
    CommandInFlight,

    #[error("Operation was cancelled by a disconnect")]
    Cancelled,

    #[error("Operation is not possible while {0}")]
    InvalidState(ConnectionState),

    #[error("Credential store failure: {source}")]
    CredentialStore { #[from] source: ConfigError },
}

impl SessionError {
    /// Faults of the link itself, as opposed to rejected input or protocol outcomes.
    pub fn is_transport_fault(&self) -> bool {
        matches!(self, SessionError::TransportFault { .. })
    }
}

#[derive(Error, Debug)]
pub enum AppRunError {
    #[error("Failed to start application (config): {source}")]
    ConfigError { #[from] source: ConfigError },

    #[error("Session failed: {source}")]
    Session { #[from] source: SessionError },

    #[error("Failed to start async runtime: {source}")]
    Runtime { source: io::Error },
}
