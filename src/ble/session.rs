//! Per-peripheral session state.

use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::ble::gatt::{
    CharacteristicKey, CharacteristicRef, CharacteristicSelector, PeripheralAddress, ServiceRef,
    SessionId,
};

/// Connection state for a peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No session.
    #[default]
    Disconnected,
    /// Link requested, waiting for the hardware.
    Connecting,
    /// Link up, discovery not requested yet.
    Connected,
    /// Waiting for service discovery to finish.
    ServicesDiscovering,
    /// Characteristics known, reads, writes and subscriptions allowed.
    Ready,
}

impl ConnectionState {
    /// Check if reads, writes and subscriptions are allowed.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Check if a session is being set up.
    pub fn is_transitioning(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Connected | Self::ServicesDiscovering
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::ServicesDiscovering => write!(f, "ServicesDiscovering"),
            Self::Ready => write!(f, "Ready"),
        }
    }
}

/// Characteristic UUIDs confirmed as notifying.
pub(crate) type SubscriptionSet = HashSet<CharacteristicKey>;

/// A live connection session.
#[derive(Debug)]
pub(crate) struct Session {
    pub(crate) id: SessionId,
    pub(crate) address: PeripheralAddress,
    pub(crate) state: ConnectionState,
    /// Discovered characteristics in discovery order.
    pub(crate) characteristics: Vec<CharacteristicRef>,
    /// Outstanding reads and writes.
    pub(crate) in_flight: HashSet<CharacteristicKey>,
    /// Outstanding descriptor writes, with the value written.
    pub(crate) pending_descriptors: HashMap<CharacteristicKey, Vec<u8>>,
    pub(crate) subscriptions: SubscriptionSet,
}

impl Session {
    pub(crate) fn new(id: SessionId, address: PeripheralAddress) -> Self {
        Self {
            id,
            address,
            state: ConnectionState::Connecting,
            characteristics: Vec::new(),
            in_flight: HashSet::new(),
            pending_descriptors: HashMap::new(),
            subscriptions: SubscriptionSet::new(),
        }
    }

    pub(crate) fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            tracing::debug!(
                "Session {} for {}: {} -> {}",
                self.id,
                self.address,
                self.state,
                state
            );
            self.state = state;
        }
    }

    pub(crate) fn store_services(&mut self, services: Vec<ServiceRef>) {
        self.characteristics = services
            .into_iter()
            .flat_map(|service| {
                let service_uuid = service.uuid;
                service.characteristics.into_iter().map(move |mut c| {
                    c.service_uuid = service_uuid;
                    c
                })
            })
            .collect();
    }

    pub(crate) fn find(&self, selector: &CharacteristicSelector) -> Option<&CharacteristicRef> {
        self.characteristics.iter().find(|c| selector.matches(c))
    }

    /// Whether any read, write or descriptor write is outstanding.
    pub(crate) fn is_busy(&self, key: &CharacteristicKey) -> bool {
        self.in_flight.contains(key) || self.pending_descriptors.contains_key(key)
    }

    pub(crate) fn subscribed_uuids(&self) -> Vec<Uuid> {
        let mut uuids: Vec<Uuid> = self.subscriptions.iter().map(|k| k.uuid).collect();
        uuids.sort();
        uuids
    }
}
