//! BLE communication module.
//!
//! This module provides the GATT client used to reach the fuel sensor:
//! a per-peripheral connection state machine, notification subscription
//! management, and a btleplug-backed hardware layer.

pub mod backend;
pub mod capabilities;
pub mod connection;
pub mod events;
pub mod gatt;
pub mod notifications;
pub mod platform;
pub mod session;
pub mod uuids;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::GattBackend;
pub use capabilities::{CharacteristicProperties, DescriptorPermissions};
pub use connection::{ConnectionStateMachine, WeakConnectionStateMachine};
pub use events::{ConnectionEvent, ConnectionEventKind, ListenerHandle, ListenerId};
pub use gatt::{
    callback_channel, CallbackKind, CallbackReceiver, CallbackSink, CharacteristicKey,
    CharacteristicRef, CharacteristicSelector, DescriptorRef, GattCallback, GattStatus,
    PeripheralAddress, ServiceRef, SessionId, WriteType,
};
pub use notifications::{enable_value, NotificationController};
pub use platform::{BtleplugBackend, DEFAULT_CONNECT_TIMEOUT};
pub use session::ConnectionState;
pub use uuids::*;
