// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # ble-fuel-telemetry
//!
//! Bridges a Bluetooth Low Energy fuel level sensor to remote telemetry
//! collectors over UDP.
//!
//! ## Features
//!
//! - **GATT Session Management**: Connect, discover services, read, write
//!   and request MTU changes through a per-peripheral state machine
//! - **Notifications**: Enable or disable notifications and indications,
//!   with subscriptions recorded only once the peripheral confirms them
//! - **Typed Events**: Hardware callbacks republished as
//!   [`ConnectionEvent`]s to any number of listeners
//! - **Telemetry Encoding**: Device id, GPS fix and fuel level packed into
//!   a big-endian binary record
//! - **UDP Fan-out**: Each record sent to every collector host, with
//!   per-host failure reporting
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ble_fuel_telemetry::{
//!     callback_channel, BtleplugBackend, ConnectionStateMachine, LocationFix,
//!     PeripheralAddress, TelemetryBridge, TelemetryConfig, Result,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let (sink, rx) = callback_channel();
//!     let backend = BtleplugBackend::from_default_adapter(sink.clone()).await?;
//!     let machine = ConnectionStateMachine::new(backend, sink);
//!     machine.spawn_event_loop(rx);
//!
//!     let config = TelemetryConfig::default().with_device_id("0A1B2C");
//!     let bridge = TelemetryBridge::new(&machine, &config);
//!     bridge.connect(&PeripheralAddress::from("AA:BB:CC:DD:EE:FF"))?;
//!
//!     // Wait for the first fuel level reading
//!     tokio::time::sleep(std::time::Duration::from_secs(5)).await;
//!
//!     let report = bridge.on_location(&LocationFix::now(37.7749, -122.4194)).await?;
//!     println!("Delivered to {} host(s)", report.delivered.len());
//!     Ok(())
//! }
//! ```
//!
//! ## Event Delivery
//!
//! Listeners run on the task that drains the callback channel, normally the
//! one started by [`ConnectionStateMachine::spawn_event_loop`].
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for configuration and data types

// Public modules
pub mod ble;
pub mod bridge;
pub mod error;
pub mod telemetry;
pub mod utils;

// Re-exports for convenience
pub use bridge::TelemetryBridge;
pub use error::{Error, Result};
pub use utils::{fuel_percent, to_hex_string};

// Re-export commonly used types from submodules
pub use ble::{
    callback_channel, BtleplugBackend, CallbackKind, CallbackReceiver, CallbackSink,
    CharacteristicKey, CharacteristicProperties, CharacteristicRef, CharacteristicSelector,
    ConnectionEvent, ConnectionEventKind, ConnectionState, ConnectionStateMachine,
    DescriptorPermissions, GattBackend, GattCallback, GattStatus, ListenerHandle, ListenerId,
    NotificationController, PeripheralAddress, SessionId,
};
pub use telemetry::{
    encode_telemetry, DeviceId, HostResolver, HostRoster, LocationFix, SendFailure,
    TelemetryConfig, TelemetryRecord, TelemetryTransmitter, TransmitReport,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_exports() {
        // Verify that key types are exported
        let _ = std::any::TypeId::of::<Error>();
        let _ = std::any::TypeId::of::<ConnectionState>();
        let _ = std::any::TypeId::of::<ConnectionEvent>();
        let _ = std::any::TypeId::of::<TelemetryRecord>();
        let _ = std::any::TypeId::of::<TelemetryConfig>();
        let _ = std::any::TypeId::of::<HostRoster>();
        let _ = std::any::TypeId::of::<ConnectionStateMachine<BtleplugBackend>>();
    }

    #[test]
    fn test_hex_dump() {
        assert_eq!(to_hex_string(&[0x0A, 0x1B, 0x2C]), "0x0A 1B 2C");
        assert_eq!(fuel_percent(&[0x32]), Some(50));
    }
}
