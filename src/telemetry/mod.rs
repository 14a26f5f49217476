//! Telemetry records and their delivery.
//!
//! - [`encoder`]: the binary record built from a device id, a location fix
//!   and the latest fuel level
//! - [`transmitter`]: UDP fan-out to the collector hosts
//! - [`config`]: hosts, port and fuel characteristic settings

pub mod config;
pub mod encoder;
pub mod transmitter;

pub use config::{TelemetryConfig, DEFAULT_HOSTS, DEFAULT_OVERRIDE_HOST, TELEMETRY_PORT};
pub use encoder::{encode_telemetry, DeviceId, LocationFix, TelemetryRecord, RECORD_HEADER_LEN};
pub use transmitter::{
    DnsResolver, HostResolver, HostRoster, SendFailure, TelemetryTransmitter, TransmitReport,
};
