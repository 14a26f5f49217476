//! Connection state machine.
//!
//! Owns one session per peripheral address and drives it through
//! `Disconnected -> Connecting -> Connected -> ServicesDiscovering -> Ready`.
//! Requests are handed to a [`GattBackend`] and return immediately; the
//! hardware's answers come back as [`GattCallback`]s and are republished as
//! [`ConnectionEvent`]s to registered listeners.
//!
//! # Delivery context
//!
//! Hardware callbacks and locally generated events (teardown) travel
//! through one channel. Listeners are invoked on whichever task drains it:
//! the task started by [`ConnectionStateMachine::spawn_event_loop`], or the
//! caller of [`ConnectionStateMachine::process_pending`].
//!
//! A teardown's `Disconnected` is dropped if the address has been connected
//! again by the time it is drained.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::ble::backend::GattBackend;
use crate::ble::events::{
    ConnectionEvent, ConnectionEventKind, ListenerHandle, ListenerId, ListenerRegistry,
};
use crate::ble::gatt::{
    CallbackKind, CallbackReceiver, CallbackSink, CharacteristicKey, CharacteristicRef,
    CharacteristicSelector, GattCallback, Inbound, PeripheralAddress, SessionId, WriteType,
};
use crate::ble::notifications::{apply_descriptor_write, DescriptorOutcome, NotificationController};
use crate::ble::session::{ConnectionState, Session};
use crate::error::{Error, Result};

/// State shared by the state machine and its notification controller.
pub(crate) struct Shared<B> {
    pub(crate) backend: B,
    pub(crate) sessions: RwLock<HashMap<PeripheralAddress, Session>>,
    pub(crate) listeners: Arc<ListenerRegistry>,
    pub(crate) sink: CallbackSink,
    session_counter: AtomicU64,
}

/// What a callback asks the state machine to do once the session lock is released.
#[derive(Default)]
struct Outcome {
    events: Vec<ConnectionEventKind>,
    discover: bool,
    failed: bool,
}

impl Outcome {
    fn emit(kind: ConnectionEventKind) -> Self {
        Self {
            events: vec![kind],
            ..Self::default()
        }
    }

    fn fail() -> Self {
        Self {
            failed: true,
            ..Self::default()
        }
    }
}

/// Drives GATT sessions and fans hardware callbacks out to listeners.
pub struct ConnectionStateMachine<B: GattBackend> {
    shared: Arc<Shared<B>>,
}

impl<B: GattBackend> Clone for ConnectionStateMachine<B> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

/// Non-owning reference to a [`ConnectionStateMachine`].
pub struct WeakConnectionStateMachine<B: GattBackend> {
    shared: Weak<Shared<B>>,
}

impl<B: GattBackend> WeakConnectionStateMachine<B> {
    /// Get the machine back if it is still alive.
    pub fn upgrade(&self) -> Option<ConnectionStateMachine<B>> {
        self.shared
            .upgrade()
            .map(|shared| ConnectionStateMachine { shared })
    }
}

impl<B: GattBackend> Clone for WeakConnectionStateMachine<B> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<B: GattBackend> ConnectionStateMachine<B> {
    /// Create a state machine over a backend.
    ///
    /// `sink` must feed the same channel the backend reports into.
    pub fn new(backend: B, sink: CallbackSink) -> Self {
        Self {
            shared: Arc::new(Shared {
                backend,
                sessions: RwLock::new(HashMap::new()),
                listeners: Arc::new(ListenerRegistry::default()),
                sink,
                session_counter: AtomicU64::new(1),
            }),
        }
    }

    /// Get a weak reference, for listeners that call back into the machine.
    pub fn downgrade(&self) -> WeakConnectionStateMachine<B> {
        WeakConnectionStateMachine {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Get the backend.
    pub fn backend(&self) -> &B {
        &self.shared.backend
    }

    /// Get the notification controller for this machine's sessions.
    pub fn notifications(&self) -> NotificationController<B> {
        NotificationController::new(self.shared.clone())
    }

    /// Get the connection state for an address.
    pub fn state(&self, address: &PeripheralAddress) -> ConnectionState {
        self.shared
            .sessions
            .read()
            .get(address)
            .map(|s| s.state)
            .unwrap_or_default()
    }

    /// Check if the session for an address is ready.
    pub fn is_ready(&self, address: &PeripheralAddress) -> bool {
        self.state(address).is_ready()
    }

    /// Characteristics discovered on the session, in discovery order.
    pub fn characteristics(&self, address: &PeripheralAddress) -> Vec<CharacteristicRef> {
        self.shared
            .sessions
            .read()
            .get(address)
            .map(|s| s.characteristics.clone())
            .unwrap_or_default()
    }

    /// Look up a discovered characteristic.
    pub fn find_characteristic(
        &self,
        address: &PeripheralAddress,
        selector: impl Into<CharacteristicSelector>,
    ) -> Option<CharacteristicRef> {
        let selector = selector.into();
        self.shared
            .sessions
            .read()
            .get(address)
            .and_then(|s| s.find(&selector).cloned())
    }

    /// Check if the peripheral confirmed notifications for a characteristic.
    pub fn is_notifying(&self, address: &PeripheralAddress, uuid: &Uuid) -> bool {
        self.shared
            .sessions
            .read()
            .get(address)
            .map_or(false, |s| s.subscriptions.iter().any(|k| k.uuid == *uuid))
    }

    /// Characteristic UUIDs currently notifying, sorted.
    pub fn subscriptions(&self, address: &PeripheralAddress) -> Vec<Uuid> {
        self.shared
            .sessions
            .read()
            .get(address)
            .map(|s| s.subscribed_uuids())
            .unwrap_or_default()
    }

    /// Start a session with a peripheral.
    ///
    /// Returns once the request is enqueued. `SetupComplete` or
    /// `Disconnected` follows. Connecting an address that is already ready
    /// is a no-op.
    pub fn connect(&self, address: &PeripheralAddress) -> Result<()> {
        let session_id = {
            let mut sessions = self.shared.sessions.write();

            if let Some(existing) = sessions.get(address) {
                if existing.state.is_ready() {
                    debug!("Already connected to {}", address);
                    return Ok(());
                }
                return Err(Error::AlreadyConnecting {
                    address: address.to_string(),
                });
            }

            let id = SessionId(self.shared.session_counter.fetch_add(1, Ordering::SeqCst));
            sessions.insert(address.clone(), Session::new(id, address.clone()));
            id
        };

        info!("Connecting to {} (session {})", address, session_id);

        if let Err(e) = self.shared.backend.connect(address, session_id) {
            warn!("Failed to start connection to {}: {}", address, e);
            self.release_session(address, session_id);
            return Err(e);
        }

        Ok(())
    }

    /// Request a characteristic read. `CharacteristicRead` follows.
    pub fn read_characteristic(
        &self,
        address: &PeripheralAddress,
        selector: impl Into<CharacteristicSelector>,
    ) -> Result<()> {
        let selector = selector.into();
        let (session_id, characteristic) = self.reserve(address, &selector, |c| {
            if c.properties.is_readable() {
                Ok(())
            } else {
                Err("read")
            }
        })?;

        trace!("Reading {} on {}", characteristic.key(), address);

        if let Err(e) = self
            .shared
            .backend
            .read_characteristic(address, session_id, &characteristic)
        {
            self.clear_in_flight(address, session_id, &characteristic.key());
            return Err(e);
        }

        Ok(())
    }

    /// Request a characteristic write. `CharacteristicWrite` follows.
    ///
    /// Uses a write with response when the characteristic allows it.
    pub fn write_characteristic(
        &self,
        address: &PeripheralAddress,
        selector: impl Into<CharacteristicSelector>,
        value: &[u8],
    ) -> Result<()> {
        let selector = selector.into();
        let (session_id, characteristic) = self.reserve(address, &selector, |c| {
            if c.properties.is_writable() || c.properties.is_writable_without_response() {
                Ok(())
            } else {
                Err("write")
            }
        })?;

        let write_type = if characteristic.properties.is_writable() {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };

        trace!(
            "Writing {} bytes to {} on {} ({:?})",
            value.len(),
            characteristic.key(),
            address,
            write_type
        );

        if let Err(e) = self.shared.backend.write_characteristic(
            address,
            session_id,
            &characteristic,
            value,
            write_type,
        ) {
            self.clear_in_flight(address, session_id, &characteristic.key());
            return Err(e);
        }

        Ok(())
    }

    /// Request a larger ATT MTU. `MtuChanged` follows if the backend supports it.
    pub fn request_mtu(&self, address: &PeripheralAddress, mtu: u16) -> Result<()> {
        let session_id = self
            .shared
            .sessions
            .read()
            .get(address)
            .filter(|s| s.state.is_ready())
            .map(|s| s.id)
            .ok_or(Error::NotConnected)?;

        self.shared.backend.request_mtu(address, session_id, mtu)
    }

    /// End the session for an address and release its native resources.
    ///
    /// Idempotent. Pending reads, writes and subscriptions are discarded;
    /// their late callbacks are dropped as stale.
    pub fn teardown(&self, address: &PeripheralAddress) {
        let removed = self.shared.sessions.write().remove(address);
        self.shared.backend.disconnect(address);

        match removed {
            Some(session) => {
                info!("Tore down session {} for {}", session.id, address);
                self.shared.sink.torn_down(address.clone(), session.id);
            }
            None => debug!("Teardown of {}: no live session", address),
        }
    }

    /// Register a listener for every event of every session.
    pub fn register_listener<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        let id = self.shared.listeners.register(listener);
        debug!("Registered connection listener {:?}", id);
        ListenerHandle::new(id, &self.shared.listeners)
    }

    /// Unregister a listener by ID. Safe to call from inside a listener.
    pub fn unregister_listener(&self, id: ListenerId) -> bool {
        self.shared.listeners.unregister(id)
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.shared.listeners.len()
    }

    /// Apply one hardware callback and notify listeners on the calling task.
    pub fn handle_callback(&self, callback: GattCallback) {
        let GattCallback {
            address,
            session: session_id,
            kind,
        } = callback;

        let outcome = {
            let mut sessions = self.shared.sessions.write();
            let session = match sessions.get_mut(&address) {
                Some(session) if session.id == session_id => session,
                Some(session) => {
                    debug!(
                        "Dropping stale callback for {} (session {}, live {})",
                        address, session_id, session.id
                    );
                    return;
                }
                None => {
                    debug!(
                        "Dropping callback for {} (session {}): no live session",
                        address, session_id
                    );
                    return;
                }
            };
            Self::apply(session, kind)
        };

        for kind in outcome.events {
            self.shared
                .listeners
                .dispatch(&ConnectionEvent::new(address.clone(), kind));
        }

        if outcome.discover {
            if let Err(e) = self.shared.backend.discover_services(&address, session_id) {
                warn!("Failed to start service discovery on {}: {}", address, e);
                self.fail_session(&address, session_id);
            }
        }

        if outcome.failed {
            self.fail_session(&address, session_id);
        }
    }

    /// Drain everything queued on `rx` on the calling task.
    ///
    /// Returns the number of items processed.
    pub fn process_pending(&self, rx: &mut CallbackReceiver) -> usize {
        let mut processed = 0;
        while let Some(item) = rx.try_recv() {
            self.process(item);
            processed += 1;
        }
        processed
    }

    /// Run the event loop until the channel closes or the machine is dropped.
    ///
    /// Only a weak reference is held while waiting, so dropping every
    /// other handle to the machine ends the loop.
    pub async fn run(self, mut rx: CallbackReceiver) {
        let weak = self.downgrade();
        drop(self);

        while let Some(item) = rx.recv().await {
            match weak.upgrade() {
                Some(machine) => machine.process(item),
                None => break,
            }
        }

        debug!("Connection event loop ended");
    }

    /// Spawn [`run`](Self::run) on the current tokio runtime.
    pub fn spawn_event_loop(&self, rx: CallbackReceiver) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.clone().run(rx))
    }

    fn process(&self, item: Inbound) {
        match item {
            Inbound::Hardware(callback) => self.handle_callback(callback),
            Inbound::TornDown { address, session } => self.announce_teardown(address, session),
        }
    }

    fn announce_teardown(&self, address: PeripheralAddress, session: SessionId) {
        if let Some(live) = self.shared.sessions.read().get(&address) {
            debug!(
                "Dropping teardown notice for {} (session {}, live {})",
                address, session, live.id
            );
            return;
        }
        self.shared
            .listeners
            .dispatch(&ConnectionEvent::new(address, ConnectionEventKind::Disconnected));
    }

    fn apply(session: &mut Session, kind: CallbackKind) -> Outcome {
        match kind {
            CallbackKind::ConnectionStateChanged { status, connected } => {
                if !status.is_success() {
                    warn!(
                        "Connection error on {}: {}, disconnecting",
                        session.address, status
                    );
                    return Outcome::fail();
                }
                if !connected {
                    info!("Disconnected from {}", session.address);
                    return Outcome::fail();
                }
                if session.state != ConnectionState::Connecting {
                    debug!(
                        "Ignoring connected callback for {} in state {}",
                        session.address, session.state
                    );
                    return Outcome::default();
                }
                info!("Connected to {}", session.address);
                session.set_state(ConnectionState::Connected);
                session.set_state(ConnectionState::ServicesDiscovering);
                Outcome {
                    discover: true,
                    ..Outcome::default()
                }
            }
            CallbackKind::ServicesDiscovered { status, services } => {
                if session.state != ConnectionState::ServicesDiscovering {
                    debug!(
                        "Ignoring discovery result for {} in state {}",
                        session.address, session.state
                    );
                    return Outcome::default();
                }
                if !status.is_success() {
                    warn!("Service discovery failed on {}: {}", session.address, status);
                    return Outcome::fail();
                }
                info!(
                    "Discovered {} services on {}",
                    services.len(),
                    session.address
                );
                session.store_services(services);
                for c in &session.characteristics {
                    debug!(
                        "  {} properties {:#04x}",
                        c.key(),
                        c.properties.bits()
                    );
                }
                session.set_state(ConnectionState::Ready);
                Outcome::emit(ConnectionEventKind::SetupComplete)
            }
            CallbackKind::CharacteristicRead {
                characteristic,
                status,
                value,
            } => {
                if !Self::complete_in_flight(session, &characteristic) {
                    return Outcome::default();
                }
                if !status.is_success() {
                    warn!(
                        "Read of {} on {} failed: {}",
                        characteristic, session.address, status
                    );
                    return Outcome::fail();
                }
                Outcome::emit(ConnectionEventKind::CharacteristicRead {
                    uuid: characteristic.uuid,
                    value,
                })
            }
            CallbackKind::CharacteristicWritten {
                characteristic,
                status,
            } => {
                if !Self::complete_in_flight(session, &characteristic) {
                    return Outcome::default();
                }
                if !status.is_success() {
                    warn!(
                        "Write to {} on {} failed: {}",
                        characteristic, session.address, status
                    );
                    return Outcome::fail();
                }
                Outcome::emit(ConnectionEventKind::CharacteristicWrite {
                    uuid: characteristic.uuid,
                })
            }
            CallbackKind::CharacteristicChanged {
                characteristic,
                value,
            } => {
                trace!(
                    "Value changed on {}: {} bytes",
                    characteristic,
                    value.len()
                );
                Outcome::emit(ConnectionEventKind::CharacteristicChanged {
                    uuid: characteristic.uuid,
                    value,
                })
            }
            CallbackKind::DescriptorWritten {
                characteristic,
                descriptor,
                status,
                value,
            } => match apply_descriptor_write(
                session,
                &characteristic,
                &descriptor,
                &status,
                &value,
            ) {
                DescriptorOutcome::Event(kind) => Outcome::emit(kind),
                DescriptorOutcome::Ignored => Outcome::default(),
                DescriptorOutcome::Failed => Outcome::fail(),
            },
            CallbackKind::MtuChanged { mtu, status } => {
                if !status.is_success() {
                    warn!("MTU change on {} failed: {}", session.address, status);
                    return Outcome::fail();
                }
                debug!("MTU on {} is now {}", session.address, mtu);
                Outcome::emit(ConnectionEventKind::MtuChanged { mtu })
            }
        }
    }

    /// Returns `false` if the completion does not match an outstanding request.
    fn complete_in_flight(session: &mut Session, key: &CharacteristicKey) -> bool {
        if session.in_flight.remove(key) {
            true
        } else {
            debug!(
                "Ignoring uncorrelated completion for {} on {}",
                key, session.address
            );
            false
        }
    }

    fn reserve(
        &self,
        address: &PeripheralAddress,
        selector: &CharacteristicSelector,
        allowed: impl FnOnce(&CharacteristicRef) -> std::result::Result<(), &'static str>,
    ) -> Result<(SessionId, CharacteristicRef)> {
        let mut sessions = self.shared.sessions.write();
        let session = sessions
            .get_mut(address)
            .filter(|s| s.state.is_ready())
            .ok_or(Error::NotConnected)?;

        let characteristic =
            session
                .find(selector)
                .cloned()
                .ok_or_else(|| Error::CharacteristicNotFound {
                    uuid: selector.uuid.to_string(),
                })?;

        if let Err(operation) = allowed(&characteristic) {
            return Err(Error::UnsupportedOperation {
                uuid: characteristic.uuid.to_string(),
                operation: operation.to_string(),
            });
        }

        let key = characteristic.key();
        if session.is_busy(&key) {
            return Err(Error::OperationInFlight {
                uuid: characteristic.uuid.to_string(),
            });
        }
        session.in_flight.insert(key);

        Ok((session.id, characteristic))
    }

    fn clear_in_flight(
        &self,
        address: &PeripheralAddress,
        session_id: SessionId,
        key: &CharacteristicKey,
    ) {
        if let Some(session) = self.shared.sessions.write().get_mut(address) {
            if session.id == session_id {
                session.in_flight.remove(key);
            }
        }
    }

    /// Remove the session if it is still the live one. Returns whether it was.
    fn release_session(&self, address: &PeripheralAddress, session_id: SessionId) -> bool {
        let mut sessions = self.shared.sessions.write();
        match sessions.get(address) {
            Some(session) if session.id == session_id => {
                sessions.remove(address);
                true
            }
            _ => false,
        }
    }

    /// Error exit: release the session, drop the link and emit `Disconnected`.
    fn fail_session(&self, address: &PeripheralAddress, session_id: SessionId) {
        if !self.release_session(address, session_id) {
            return;
        }
        self.shared.backend.disconnect(address);
        self.shared.listeners.dispatch(&ConnectionEvent::new(
            address.clone(),
            ConnectionEventKind::Disconnected,
        ));
    }
}
