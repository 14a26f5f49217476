//! Telemetry configuration.

use uuid::Uuid;

use crate::ble::uuids::{FUEL_LEVEL_CHARACTERISTIC_UUID, FUEL_SERVICE_UUID};

/// UDP port every collector listens on.
pub const TELEMETRY_PORT: u16 = 50000;

/// Built-in collector hosts.
pub const DEFAULT_HOSTS: [&str; 4] = [
    "34.221.26.86",
    "54.189.190.202",
    "54.71.123.233",
    "52.43.44.128",
];

/// Host used for the override slot until the user supplies one.
pub const DEFAULT_OVERRIDE_HOST: &str = "10.121.64.123";

/// Configuration for the telemetry bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TelemetryConfig {
    /// Six hex characters identifying this device. Empty until configured.
    pub device_id: String,
    /// User-supplied host for the override slot.
    pub host_override: Option<String>,
    /// Fixed collector hosts, sent to in order.
    pub default_hosts: Vec<String>,
    /// Host in the override slot when no override is set.
    pub override_slot_default: String,
    /// Destination UDP port.
    pub port: u16,
    /// Service owning the fuel level characteristic.
    pub fuel_service_uuid: Uuid,
    /// The fuel level characteristic.
    pub fuel_characteristic_uuid: Uuid,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            host_override: None,
            default_hosts: DEFAULT_HOSTS.iter().map(|h| h.to_string()).collect(),
            override_slot_default: DEFAULT_OVERRIDE_HOST.to_string(),
            port: TELEMETRY_PORT,
            fuel_service_uuid: FUEL_SERVICE_UUID,
            fuel_characteristic_uuid: FUEL_LEVEL_CHARACTERISTIC_UUID,
        }
    }
}

impl TelemetryConfig {
    /// Set the six hex character device id.
    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = device_id.into();
        self
    }

    /// Put a host in the override slot.
    pub fn with_host_override(mut self, host: impl Into<String>) -> Self {
        self.host_override = Some(host.into());
        self
    }

    /// Replace the fixed host list.
    pub fn with_default_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.default_hosts = hosts.into_iter().map(Into::into).collect();
        self
    }

    /// Set the host the override slot falls back to.
    pub fn with_override_slot_default(mut self, host: impl Into<String>) -> Self {
        self.override_slot_default = host.into();
        self
    }

    /// Set the collector port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Use a different fuel level characteristic.
    pub fn with_fuel_characteristic(mut self, service: Uuid, characteristic: Uuid) -> Self {
        self.fuel_service_uuid = service;
        self.fuel_characteristic_uuid = characteristic;
        self
    }
}
