use serde::{Deserialize, Serialize};
use tokio::time::Duration;
use uuid::Uuid;

use crate::device::constants::{
    make_sensor_control_uuid, make_sensor_data_uuid, make_sensor_service_uuid, COMMAND_DEADLINE,
    CONNECT_DEADLINE, CREDENTIAL_MAX_LEN, CREDENTIAL_MIN_LEN, DEVICE_NAME_MARKER, MEASUREMENT_UNIT,
    SCAN_TIMEOUT, STREAM_LOG_INTERVAL, WRITE_DEADLINE,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Only peers whose advertised name contains this (case-insensitive) are listed
    pub device_name_marker: String,
    pub service_uuid: Uuid,
    pub data_characteristic_uuid: Uuid,
    pub control_characteristic_uuid: Uuid,
    /// Ask the adapter to only report peers advertising `service_uuid`.
    /// Many sensors do not advertise their services, so this is off by default.
    pub filter_scan_by_service: bool,
    pub scan_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub command_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub measurement_unit: String,
    pub stream_diagnostics: bool,
    pub credential_min_len: usize,
    pub credential_max_len: usize,
}

impl Config {
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn stream_log_interval(&self) -> Duration {
        Duration::from_millis(STREAM_LOG_INTERVAL)
    }

    /// Credentials are sent as `VERB:<credential>`, so only plain alphanumerics are allowed.
    pub fn is_valid_credential(&self, credential: &str) -> bool {
        (self.credential_min_len..=self.credential_max_len).contains(&credential.len())
            && credential.chars().all(|c| c.is_ascii_alphanumeric())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            device_name_marker: DEVICE_NAME_MARKER.to_string(),
            service_uuid: make_sensor_service_uuid(),
            data_characteristic_uuid: make_sensor_data_uuid(),
            control_characteristic_uuid: make_sensor_control_uuid(),
            filter_scan_by_service: false,
            scan_timeout_ms: SCAN_TIMEOUT,
            connect_timeout_ms: CONNECT_DEADLINE,
            command_timeout_ms: COMMAND_DEADLINE,
            write_timeout_ms: WRITE_DEADLINE,
            measurement_unit: MEASUREMENT_UNIT.to_string(),
            stream_diagnostics: false,
            credential_min_len: CREDENTIAL_MIN_LEN,
            credential_max_len: CREDENTIAL_MAX_LEN,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: Config = serde_json::from_str(r#"{"deviceNameMarker": "scale", "commandTimeoutMs": 1500}"#).unwrap();

        assert_eq!(config.device_name_marker, "scale");
        assert_eq!(config.command_timeout(), Duration::from_millis(1500));
        assert_eq!(config.connect_timeout(), Duration::from_millis(CONNECT_DEADLINE));
        assert_eq!(config.data_characteristic_uuid, make_sensor_data_uuid());
    }

    #[test]
    fn credential_format() {
        let config = Config::default();

        assert!(config.is_valid_credential("1234"));
        assert!(config.is_valid_credential("abcDEF123456"));
        assert!(!config.is_valid_credential("BAD-FORMAT"));
        assert!(!config.is_valid_credential("123"));
        assert!(!config.is_valid_credential("12:34"));
        assert!(!config.is_valid_credential(""));
        assert!(!config.is_valid_credential(&"9".repeat(33)));
    }
}
