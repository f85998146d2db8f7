use uuid::Uuid;

/**
 * Default substring (case-insensitive) that an advertised name must contain to be listed.
 */
pub const DEVICE_NAME_MARKER: &str = "SENSOR";

/**
 * How long (milliseconds) a scan runs when the caller does not pass a timeout.
 */
pub const SCAN_TIMEOUT: u64 = 10_000;

/**
 * How long (milliseconds) connecting and discovering channels may take.
 */
pub const CONNECT_DEADLINE: u64 = 15_000;

/**
 * How long (milliseconds) to wait for the response to a control command.
 */
pub const COMMAND_DEADLINE: u64 = 5_000;

/**
 * How long (milliseconds) a write to a characteristic may take.
 */
pub const WRITE_DEADLINE: u64 = 2_000;

/**
 * Minimum interval (milliseconds) between two diagnostic log lines on the data stream.
 */
pub const STREAM_LOG_INTERVAL: u64 = 500;

/**
 * The UUID of the Bluetooth BLE service exposing the data and control characteristics
 */
pub const SENSOR_SERVICE: &str = "6e400001-b5a3-f393-e0a9-e50e24dcca9e";

/**
 * The UUID of the characteristic that notifies measurement values.
 */
pub const SENSOR_DATA_CHARACTERISTIC: &str = "6e400003-b5a3-f393-e0a9-e50e24dcca9e";

/**
 * The UUID of the characteristic used for commands and their responses.
 */
pub const SENSOR_CONTROL_CHARACTERISTIC: &str = "6e400002-b5a3-f393-e0a9-e50e24dcca9e";

pub const COMMAND_CONNECT: &str = "CONNECT";
pub const COMMAND_DISCONNECT: &str = "DISCONNECT";
// Fire-and-forget acknowledgement after a fresh login, the device blinks its LED
pub const COMMAND_ACK: &str = "ACK";

pub const RESPONSE_CONNECTED: &str = "CONNECTED";
pub const RESPONSE_ALREADY_CONNECTED: &str = "ALREADY_CONNECTED";
pub const RESPONSE_DISCONNECTED: &str = "DISCONNECTED";

pub const CREDENTIAL_MIN_LEN: usize = 4;
pub const CREDENTIAL_MAX_LEN: usize = 32;

pub const MEASUREMENT_UNIT: &str = "g";

pub fn make_sensor_service_uuid() -> Uuid {
    Uuid::parse_str(SENSOR_SERVICE).unwrap()
}

pub fn make_sensor_data_uuid() -> Uuid {
    Uuid::parse_str(SENSOR_DATA_CHARACTERISTIC).unwrap()
}

pub fn make_sensor_control_uuid() -> Uuid {
    Uuid::parse_str(SENSOR_CONTROL_CHARACTERISTIC).unwrap()
}
