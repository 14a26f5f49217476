//! GATT data model and hardware callbacks.
//!
//! Discovery snapshots ([`ServiceRef`], [`CharacteristicRef`],
//! [`DescriptorRef`]) are immutable once taken. Hardware completions
//! arrive as [`GattCallback`]s pushed through a [`CallbackSink`].

use std::fmt;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::ble::capabilities::{CharacteristicProperties, DescriptorPermissions};

/// Platform identifier of a peripheral (MAC address or OS-assigned id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PeripheralAddress(String);

impl PeripheralAddress {
    /// Create an address from its platform string.
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// Get the address string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeripheralAddress {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

impl From<String> for PeripheralAddress {
    fn from(address: String) -> Self {
        Self(address)
    }
}

/// Identifies one connection session. A new id is issued on every connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Service-scoped characteristic identity.
///
/// Characteristic UUIDs are only unique within a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CharacteristicKey {
    /// UUID of the owning service.
    pub service: Uuid,
    /// UUID of the characteristic.
    pub uuid: Uuid,
}

impl CharacteristicKey {
    /// Create a key from service and characteristic UUIDs.
    pub fn new(service: Uuid, uuid: Uuid) -> Self {
        Self { service, uuid }
    }
}

impl fmt::Display for CharacteristicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.uuid)
    }
}

/// Selects a characteristic within a session, optionally scoped to a service.
///
/// An unscoped selector matches the first characteristic with that UUID in
/// discovery order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicSelector {
    pub service: Option<Uuid>,
    pub uuid: Uuid,
}

impl CharacteristicSelector {
    /// Select by characteristic UUID alone.
    pub fn any(uuid: Uuid) -> Self {
        Self {
            service: None,
            uuid,
        }
    }

    /// Select by service and characteristic UUID.
    pub fn scoped(service: Uuid, uuid: Uuid) -> Self {
        Self {
            service: Some(service),
            uuid,
        }
    }

    /// Check whether a discovered characteristic matches.
    pub fn matches(&self, characteristic: &CharacteristicRef) -> bool {
        characteristic.uuid == self.uuid
            && self
                .service
                .map_or(true, |service| service == characteristic.service_uuid)
    }
}

impl From<Uuid> for CharacteristicSelector {
    fn from(uuid: Uuid) -> Self {
        Self::any(uuid)
    }
}

impl From<(Uuid, Uuid)> for CharacteristicSelector {
    fn from((service, uuid): (Uuid, Uuid)) -> Self {
        Self::scoped(service, uuid)
    }
}

impl From<CharacteristicKey> for CharacteristicSelector {
    fn from(key: CharacteristicKey) -> Self {
        Self::scoped(key.service, key.uuid)
    }
}

/// Snapshot of a descriptor taken at discovery time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorRef {
    pub uuid: Uuid,
    pub permissions: DescriptorPermissions,
}

impl DescriptorRef {
    /// Create a descriptor snapshot.
    pub fn new(uuid: Uuid, permissions: impl Into<DescriptorPermissions>) -> Self {
        Self {
            uuid,
            permissions: permissions.into(),
        }
    }
}

/// Snapshot of a characteristic taken at discovery time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicRef {
    /// UUID of the characteristic.
    pub uuid: Uuid,
    /// UUID of the owning service.
    pub service_uuid: Uuid,
    /// Supported operations.
    pub properties: CharacteristicProperties,
    /// Descriptors attached to the characteristic.
    pub descriptors: Vec<DescriptorRef>,
}

impl CharacteristicRef {
    /// Create a characteristic snapshot with no descriptors.
    pub fn new(
        service_uuid: Uuid,
        uuid: Uuid,
        properties: impl Into<CharacteristicProperties>,
    ) -> Self {
        Self {
            uuid,
            service_uuid,
            properties: properties.into(),
            descriptors: Vec::new(),
        }
    }

    /// Attach a descriptor.
    pub fn with_descriptor(mut self, descriptor: DescriptorRef) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    /// Service-scoped identity of this characteristic.
    pub fn key(&self) -> CharacteristicKey {
        CharacteristicKey::new(self.service_uuid, self.uuid)
    }

    /// Look up a descriptor by UUID.
    pub fn descriptor(&self, uuid: &Uuid) -> Option<&DescriptorRef> {
        self.descriptors.iter().find(|d| d.uuid == *uuid)
    }
}

/// Snapshot of a service and its characteristics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRef {
    pub uuid: Uuid,
    pub characteristics: Vec<CharacteristicRef>,
}

impl ServiceRef {
    /// Create a service snapshot.
    pub fn new(uuid: Uuid, characteristics: Vec<CharacteristicRef>) -> Self {
        Self {
            uuid,
            characteristics,
        }
    }
}

/// Outcome reported by the hardware for an operation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum GattStatus {
    #[default]
    Success,
    /// Non-success status with a platform description.
    Failure(String),
}

impl GattStatus {
    /// Check if the operation succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure(reason) => write!(f, "failure ({})", reason),
        }
    }
}

/// Write type for characteristic writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteType {
    WithResponse,
    WithoutResponse,
}

/// A hardware completion or unsolicited hardware event.
#[derive(Debug, Clone, PartialEq)]
pub struct GattCallback {
    /// Peripheral the callback belongs to.
    pub address: PeripheralAddress,
    /// Session that issued the request.
    pub session: SessionId,
    /// What happened.
    pub kind: CallbackKind,
}

impl GattCallback {
    /// Create a callback tagged with the session it belongs to.
    pub fn new(address: PeripheralAddress, session: SessionId, kind: CallbackKind) -> Self {
        Self {
            address,
            session,
            kind,
        }
    }
}

/// The payload of a [`GattCallback`].
#[derive(Debug, Clone, PartialEq)]
pub enum CallbackKind {
    /// Link-level connection state change.
    ConnectionStateChanged {
        status: GattStatus,
        connected: bool,
    },
    /// Service discovery finished.
    ServicesDiscovered {
        status: GattStatus,
        services: Vec<ServiceRef>,
    },
    /// A requested read completed.
    CharacteristicRead {
        characteristic: CharacteristicKey,
        status: GattStatus,
        value: Vec<u8>,
    },
    /// A requested write completed.
    CharacteristicWritten {
        characteristic: CharacteristicKey,
        status: GattStatus,
    },
    /// The peripheral pushed a new value.
    CharacteristicChanged {
        characteristic: CharacteristicKey,
        value: Vec<u8>,
    },
    /// A descriptor write was confirmed or rejected.
    DescriptorWritten {
        characteristic: CharacteristicKey,
        descriptor: Uuid,
        status: GattStatus,
        value: Vec<u8>,
    },
    /// ATT MTU negotiation finished.
    MtuChanged { mtu: u16, status: GattStatus },
}

/// Items consumed by the connection event loop.
#[derive(Debug)]
pub(crate) enum Inbound {
    Hardware(GattCallback),
    /// A session was torn down locally; listeners hear `Disconnected`
    /// unless a newer session for the address is already live.
    TornDown {
        address: PeripheralAddress,
        session: SessionId,
    },
}

/// Sending half of the hardware callback channel.
#[derive(Debug, Clone)]
pub struct CallbackSink {
    tx: mpsc::UnboundedSender<Inbound>,
}

impl CallbackSink {
    /// Deliver a hardware callback to the event loop.
    ///
    /// Returns `false` if the event loop has shut down.
    pub fn deliver(&self, callback: GattCallback) -> bool {
        self.tx.send(Inbound::Hardware(callback)).is_ok()
    }

    pub(crate) fn torn_down(&self, address: PeripheralAddress, session: SessionId) -> bool {
        self.tx.send(Inbound::TornDown { address, session }).is_ok()
    }
}

/// Receiving half of the hardware callback channel.
#[derive(Debug)]
pub struct CallbackReceiver {
    rx: mpsc::UnboundedReceiver<Inbound>,
}

impl CallbackReceiver {
    pub(crate) async fn recv(&mut self) -> Option<Inbound> {
        self.rx.recv().await
    }

    pub(crate) fn try_recv(&mut self) -> Option<Inbound> {
        self.rx.try_recv().ok()
    }
}

/// Create the channel that carries hardware callbacks into a
/// [`ConnectionStateMachine`](crate::ble::ConnectionStateMachine).
pub fn callback_channel() -> (CallbackSink, CallbackReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (CallbackSink { tx }, CallbackReceiver { rx })
}
