//! Connection events and listener fan-out.
//!
//! Hardware callbacks are republished as [`ConnectionEvent`]s to every
//! registered listener. Dispatch works on a snapshot of the listener list,
//! so a listener may unregister itself (or others) while being invoked.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::trace;
use uuid::Uuid;

use crate::ble::gatt::PeripheralAddress;

/// What happened on a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEventKind {
    /// Connection established and services discovered.
    SetupComplete,
    /// The session ended, by request, error or link loss.
    Disconnected,
    /// A requested read completed.
    CharacteristicRead { uuid: Uuid, value: Vec<u8> },
    /// The peripheral pushed a new value.
    CharacteristicChanged { uuid: Uuid, value: Vec<u8> },
    /// A requested write completed.
    CharacteristicWrite { uuid: Uuid },
    /// ATT MTU changed.
    MtuChanged { mtu: u16 },
    /// The peripheral confirmed notifications/indications are on.
    NotificationsEnabled { uuid: Uuid },
    /// The peripheral confirmed notifications/indications are off.
    NotificationsDisabled { uuid: Uuid },
}

/// An event emitted by the connection state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    /// The peripheral the event concerns.
    pub address: PeripheralAddress,
    /// The event itself.
    pub kind: ConnectionEventKind,
}

impl ConnectionEvent {
    /// Create an event for an address.
    pub fn new(address: PeripheralAddress, kind: ConnectionEventKind) -> Self {
        Self { address, kind }
    }
}

/// Identifier of a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;

/// The set of registered listeners.
#[derive(Default)]
pub(crate) struct ListenerRegistry {
    listeners: RwLock<Vec<(ListenerId, Listener)>>,
    counter: AtomicU64,
}

impl ListenerRegistry {
    pub(crate) fn register<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.counter.fetch_add(1, Ordering::SeqCst));
        self.listeners.write().push((id, Arc::new(listener)));
        id
    }

    /// Returns `true` if the listener was registered.
    pub(crate) fn unregister(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// Deliver an event to every listener registered at the time of the call.
    pub(crate) fn dispatch(&self, event: &ConnectionEvent) {
        let snapshot: Vec<(ListenerId, Listener)> = self.listeners.read().clone();

        trace!(
            "Dispatching {:?} for {} to {} listeners",
            event.kind,
            event.address,
            snapshot.len()
        );

        for (id, listener) in snapshot {
            // Skip listeners removed earlier in this same dispatch.
            if !self.listeners.read().iter().any(|(existing, _)| *existing == id) {
                continue;
            }
            listener(event);
        }
    }
}

/// Handle for unregistering a listener.
///
/// Dropping the handle unregisters the listener. Use [`ListenerHandle::detach`]
/// to keep it registered for the lifetime of the state machine.
pub struct ListenerHandle {
    id: ListenerId,
    registry: Option<Weak<ListenerRegistry>>,
}

impl ListenerHandle {
    pub(crate) fn new(id: ListenerId, registry: &Arc<ListenerRegistry>) -> Self {
        Self {
            id,
            registry: Some(Arc::downgrade(registry)),
        }
    }

    /// Unregister this listener.
    pub fn unregister(mut self) {
        self.release();
    }

    /// Keep the listener registered and give up the handle.
    pub fn detach(mut self) -> ListenerId {
        self.registry = None;
        self.id
    }

    /// Get the listener ID.
    pub fn id(&self) -> ListenerId {
        self.id
    }

    fn release(&mut self) {
        if let Some(registry) = self.registry.take().and_then(|weak| weak.upgrade()) {
            registry.unregister(self.id);
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle").field("id", &self.id).finish()
    }
}
