use std::collections::HashMap;
use indexmap::IndexMap;
use log::debug;

use crate::device::types::{DeviceRecord, Discovery};

// BLE reports -127 dBm when the signal strength is not available
const UNKNOWN_RSSI: i16 = -127;

/// Peers found during the current scan, in order of first discovery.
#[derive(Debug)]
pub struct DeviceRegistry {
    // lowercase
    name_marker: String,
    devices: IndexMap<String, DeviceRecord>,
    // deviceId -> credential, as loaded from the credential store when the scan started
    credentials: HashMap<String, String>,
}

impl DeviceRegistry {
    pub fn new(name_marker: &str) -> Self {
        DeviceRegistry {
            name_marker: name_marker.to_lowercase(),
            devices: IndexMap::new(),
            credentials: HashMap::new(),
        }
    }

    /// Forget every device and start over with a fresh credential snapshot.
    pub fn reset(&mut self, credentials: HashMap<String, String>) {
        self.devices.clear();
        self.credentials = credentials;
    }

    pub fn clear(&mut self) {
        self.devices.clear();
    }

    pub fn accepts(&self, name: &str) -> bool {
        name.to_lowercase().contains(&self.name_marker)
    }

    /// Record a discovery. Returns false when the peer is filtered out.
    ///
    /// A device that is already known keeps its position in the list; only its
    /// name and signal strength are refreshed.
    pub fn observe(&mut self, discovery: Discovery) -> bool {
        let name = match discovery.name {
            Some(name) if self.accepts(&name) => name,
            _ => return false,
        };

        let signal_strength = match (discovery.rssi, self.devices.get(&discovery.id)) {
            (Some(rssi), _) => rssi,
            (None, Some(existing)) => existing.signal_strength,
            (None, None) => UNKNOWN_RSSI,
        };

        let record = DeviceRecord {
            stored_credential: self.credentials.get(&discovery.id).cloned(),
            id: discovery.id.clone(),
            display_name: name,
            signal_strength,
        };

        if self.devices.insert(discovery.id.clone(), record).is_none() {
            debug!("New device {} (total {})", discovery.id, self.devices.len());
        }
        true
    }

    #[cfg(test)]
    pub fn get(&self, id: &str) -> Option<&DeviceRecord> {
        self.devices.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.devices.contains_key(id)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn snapshot(&self) -> Vec<DeviceRecord> {
        self.devices.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn discovery(id: &str, name: &str, rssi: i16) -> Discovery {
        Discovery { id: id.to_string(), name: Some(name.to_string()), rssi: Some(rssi) }
    }

    #[test]
    fn rediscovery_updates_in_place() {
        let mut registry = DeviceRegistry::new("SENSOR");

        assert!(registry.observe(discovery("X", "Sensor-1", -70)));
        assert!(registry.observe(discovery("Y", "SENSOR-2", -80)));
        assert!(registry.observe(discovery("X", "Sensor-1", -60)));

        let devices = registry.snapshot();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].id, "X");
        assert_eq!(devices[0].signal_strength, -60);
        assert_eq!(devices[1].id, "Y");
    }

    #[test]
    fn filters_on_name_marker_case_insensitively() {
        let mut registry = DeviceRegistry::new("Sensor");

        assert!(registry.observe(discovery("A", "my-sensor", -50)));
        assert!(!registry.observe(discovery("B", "Headphones", -50)));
        assert!(!registry.observe(Discovery { id: "C".to_string(), name: None, rssi: Some(-40) }));

        assert_eq!(registry.len(), 1);
        assert!(registry.contains("A"));
        assert!(!registry.contains("B"));
    }

    #[test]
    fn missing_rssi_keeps_previous_value() {
        let mut registry = DeviceRegistry::new("sensor");

        registry.observe(Discovery { id: "A".to_string(), name: Some("sensor".to_string()), rssi: None });
        assert_eq!(registry.get("A").unwrap().signal_strength, UNKNOWN_RSSI);

        registry.observe(discovery("A", "sensor", -65));
        registry.observe(Discovery { id: "A".to_string(), name: Some("sensor".to_string()), rssi: None });
        assert_eq!(registry.get("A").unwrap().signal_strength, -65);
    }

    #[test]
    fn enriches_with_credential_snapshot() {
        let mut registry = DeviceRegistry::new("sensor");
        let mut credentials = HashMap::new();
        credentials.insert("A".to_string(), "1234".to_string());
        registry.reset(credentials);

        registry.observe(discovery("A", "sensor", -50));
        registry.observe(discovery("B", "sensor", -50));

        assert_eq!(registry.get("A").unwrap().stored_credential.as_deref(), Some("1234"));
        assert_eq!(registry.get("B").unwrap().stored_credential, None);
    }

    #[test]
    fn reset_forgets_devices() {
        let mut registry = DeviceRegistry::new("sensor");
        registry.observe(discovery("A", "sensor", -50));

        registry.reset(HashMap::new());
        assert!(registry.is_empty());
        assert!(registry.snapshot().is_empty());
    }
}
