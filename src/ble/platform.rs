//! [`GattBackend`] implementation on top of btleplug.
//!
//! Each request is run as a tokio task that reports back through the
//! [`CallbackSink`]. Per connection, two more tasks run until disconnect:
//! one forwarding value notifications and one watching the adapter for
//! link loss.

use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, Service,
    WriteType as BtWriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::ble::backend::GattBackend;
use crate::ble::capabilities::{CharacteristicProperties, DescriptorPermissions};
use crate::ble::gatt::{
    CallbackKind, CallbackSink, CharacteristicKey, CharacteristicRef, DescriptorRef, GattCallback,
    GattStatus, PeripheralAddress, ServiceRef, SessionId, WriteType,
};
use crate::ble::uuids::{is_cccd, CCCD_UUID, DISABLE_NOTIFICATION_VALUE};
use crate::error::{Error, Result};

/// Default time to wait for an address to appear in the adapter's list.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between peripheral list polls while looking for an address.
const LOOKUP_POLL_INTERVAL: Duration = Duration::from_millis(200);

type PeripheralMap = Arc<RwLock<HashMap<PeripheralAddress, Peripheral>>>;
type TaskMap = Arc<RwLock<HashMap<PeripheralAddress, Vec<JoinHandle<()>>>>>;

/// What a finished connect attempt may do with its link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Claim {
    /// The session is still wanted and its link was installed.
    Current,
    /// A newer session owns the address; leave the link alone.
    Superseded,
    /// Nobody wants the address any more; drop the link.
    Abandoned,
}

/// The session each address is being connected for.
#[derive(Debug, Default)]
struct Claims {
    wanted: RwLock<HashMap<PeripheralAddress, SessionId>>,
}

impl Claims {
    fn want(&self, address: &PeripheralAddress, session: SessionId) {
        self.wanted.write().insert(address.clone(), session);
    }

    fn release(&self, address: &PeripheralAddress) -> Option<SessionId> {
        self.wanted.write().remove(address)
    }

    /// Run `install` only while `session` is still the one wanted for `address`.
    ///
    /// The claim stays locked during `install`, so a concurrent release
    /// either happens first or sees what was installed.
    fn install_if_current(
        &self,
        address: &PeripheralAddress,
        session: SessionId,
        install: impl FnOnce(),
    ) -> Claim {
        let wanted = self.wanted.read();
        match wanted.get(address) {
            Some(current) if *current == session => {
                install();
                Claim::Current
            }
            Some(_) => Claim::Superseded,
            None => Claim::Abandoned,
        }
    }
}

/// btleplug-backed GATT client.
pub struct BtleplugBackend {
    /// The BLE adapter used for lookups and connections.
    adapter: Adapter,
    /// Runtime the request tasks are spawned on.
    runtime: Handle,
    /// Where completions are reported.
    sink: CallbackSink,
    /// Connected peripherals by address.
    peripherals: PeripheralMap,
    /// Notification and link-watch tasks by address.
    tasks: TaskMap,
    /// Sessions whose connect attempt may still install a link.
    claims: Arc<Claims>,
    /// How long `connect` waits for the address to show up.
    connect_timeout: Duration,
}

impl BtleplugBackend {
    /// Create a backend on a specific adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if called outside a tokio runtime.
    pub fn new(adapter: Adapter, sink: CallbackSink) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::Internal(format!("no tokio runtime: {}", e)))?;

        Ok(Self {
            adapter,
            runtime,
            sink,
            peripherals: Arc::new(RwLock::new(HashMap::new())),
            tasks: Arc::new(RwLock::new(HashMap::new())),
            claims: Arc::new(Claims::default()),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        })
    }

    /// Create a backend on the first available adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn from_default_adapter(sink: CallbackSink) -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapters = manager.adapters().await.map_err(Error::Bluetooth)?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Self::new(adapter, sink)
    }

    /// Set how long `connect` waits for the address to show up.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    fn peripheral(&self, address: &PeripheralAddress) -> Result<Peripheral> {
        self.peripherals
            .read()
            .get(address)
            .cloned()
            .ok_or(Error::NotConnected)
    }

    /// Resolve a discovery snapshot back to btleplug's characteristic.
    fn resolve(
        &self,
        address: &PeripheralAddress,
        characteristic: &CharacteristicRef,
    ) -> Result<(Peripheral, Characteristic)> {
        let peripheral = self.peripheral(address)?;
        let native = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic.uuid && c.service_uuid == characteristic.service_uuid)
            .ok_or_else(|| Error::CharacteristicNotFound {
                uuid: characteristic.uuid.to_string(),
            })?;
        Ok((peripheral, native))
    }

    fn report(sink: &CallbackSink, address: PeripheralAddress, session: SessionId, kind: CallbackKind) {
        if !sink.deliver(GattCallback::new(address, session, kind)) {
            debug!("Callback dropped: connection event loop has stopped");
        }
    }

    /// Find the peripheral for an address, scanning until the timeout if needed.
    async fn find_peripheral(
        adapter: &Adapter,
        address: &PeripheralAddress,
        timeout: Duration,
    ) -> Result<Peripheral> {
        if let Some(peripheral) = Self::lookup(adapter, address).await? {
            return Ok(peripheral);
        }

        debug!("{} not known yet, scanning", address);
        adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(Error::Bluetooth)?;

        let deadline = Instant::now() + timeout;
        let found = loop {
            if let Some(peripheral) = Self::lookup(adapter, address).await? {
                break Some(peripheral);
            }
            if Instant::now() >= deadline {
                break None;
            }
            tokio::time::sleep(LOOKUP_POLL_INTERVAL).await;
        };

        if let Err(e) = adapter.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }

        found.ok_or_else(|| Error::PeripheralNotFound {
            address: address.to_string(),
        })
    }

    async fn lookup(adapter: &Adapter, address: &PeripheralAddress) -> Result<Option<Peripheral>> {
        let peripherals = adapter.peripherals().await.map_err(Error::Bluetooth)?;
        Ok(peripherals.into_iter().find(|p| {
            p.address().to_string().eq_ignore_ascii_case(address.as_str())
                || format!("{:?}", p.id()) == address.as_str()
        }))
    }

    async fn establish(
        adapter: &Adapter,
        address: &PeripheralAddress,
        timeout: Duration,
    ) -> Result<Peripheral> {
        let peripheral = Self::find_peripheral(adapter, address, timeout).await?;

        if peripheral.is_connected().await.unwrap_or(false) {
            info!("Peripheral {} already connected at BLE level", address);
        } else {
            peripheral.connect().await.map_err(Error::Bluetooth)?;
        }

        Ok(peripheral)
    }
}

impl GattBackend for BtleplugBackend {
    fn connect(&self, address: &PeripheralAddress, session: SessionId) -> Result<()> {
        let adapter = self.adapter.clone();
        let sink = self.sink.clone();
        let peripherals = self.peripherals.clone();
        let tasks = self.tasks.clone();
        let claims = self.claims.clone();
        let timeout = self.connect_timeout;
        let address = address.clone();

        self.claims.want(&address, session);

        self.runtime.spawn(async move {
            let status = match Self::establish(&adapter, &address, timeout).await {
                Ok(peripheral) => {
                    let claim = claims.install_if_current(&address, session, || {
                        let handles = vec![
                            spawn_notification_pump(
                                peripheral.clone(),
                                sink.clone(),
                                address.clone(),
                                session,
                            ),
                            spawn_disconnect_watch(
                                adapter.clone(),
                                peripheral.id(),
                                sink.clone(),
                                address.clone(),
                                session,
                            ),
                        ];
                        if let Some(stale) = tasks.write().insert(address.clone(), handles) {
                            stale.iter().for_each(JoinHandle::abort);
                        }
                        peripherals.write().insert(address.clone(), peripheral.clone());
                    });

                    match claim {
                        Claim::Current => GattStatus::Success,
                        Claim::Superseded => {
                            debug!(
                                "Session {} for {} superseded by a newer session",
                                session, address
                            );
                            return;
                        }
                        Claim::Abandoned => {
                            info!(
                                "Session {} for {} torn down while connecting",
                                session, address
                            );
                            if let Err(e) = peripheral.disconnect().await {
                                error!("Failed to disconnect from {}: {}", address, e);
                            }
                            return;
                        }
                    }
                }
                Err(e) => {
                    warn!("Connection to {} failed: {}", address, e);
                    GattStatus::Failure(e.to_string())
                }
            };

            let connected = status.is_success();
            BtleplugBackend::report(
                &sink,
                address,
                session,
                CallbackKind::ConnectionStateChanged { status, connected },
            );
        });

        Ok(())
    }

    fn discover_services(&self, address: &PeripheralAddress, session: SessionId) -> Result<()> {
        let peripheral = self.peripheral(address)?;
        let sink = self.sink.clone();
        let address = address.clone();

        self.runtime.spawn(async move {
            let kind = match peripheral.discover_services().await {
                Ok(()) => {
                    let services = peripheral.services().iter().map(service_ref).collect();
                    CallbackKind::ServicesDiscovered {
                        status: GattStatus::Success,
                        services,
                    }
                }
                Err(e) => {
                    warn!("Failed to discover services on {}: {}", address, e);
                    CallbackKind::ServicesDiscovered {
                        status: GattStatus::Failure(e.to_string()),
                        services: Vec::new(),
                    }
                }
            };
            Self::report(&sink, address, session, kind);
        });

        Ok(())
    }

    fn set_notification(
        &self,
        address: &PeripheralAddress,
        characteristic: &CharacteristicRef,
        enabled: bool,
    ) -> bool {
        // The notification pump runs for the whole connection; local delivery
        // only needs the peripheral to be connected.
        let connected = self.peripherals.read().contains_key(address);
        trace!(
            "Local notifications {} for {}: {}",
            if enabled { "on" } else { "off" },
            characteristic.uuid,
            connected
        );
        connected
    }

    fn write_descriptor(
        &self,
        address: &PeripheralAddress,
        session: SessionId,
        characteristic: &CharacteristicRef,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<()> {
        let (peripheral, native) = self.resolve(address, characteristic)?;
        let sink = self.sink.clone();
        let address = address.clone();
        let key = characteristic.key();
        let value = value.to_vec();

        self.runtime.spawn(async move {
            // btleplug owns the CCCD: subscribe/unsubscribe write it for us.
            let result = if is_cccd(&descriptor) {
                if value == DISABLE_NOTIFICATION_VALUE {
                    peripheral.unsubscribe(&native).await
                } else {
                    peripheral.subscribe(&native).await
                }
            } else {
                match native.descriptors.iter().find(|d| d.uuid == descriptor) {
                    Some(d) => peripheral.write_descriptor(d, &value).await,
                    None => Err(btleplug::Error::NoSuchCharacteristic),
                }
            };

            let status = match result {
                Ok(()) => GattStatus::Success,
                Err(e) => {
                    warn!("Descriptor write {} on {} failed: {}", descriptor, key, e);
                    GattStatus::Failure(e.to_string())
                }
            };

            Self::report(
                &sink,
                address,
                session,
                CallbackKind::DescriptorWritten {
                    characteristic: key,
                    descriptor,
                    status,
                    value,
                },
            );
        });

        Ok(())
    }

    fn read_characteristic(
        &self,
        address: &PeripheralAddress,
        session: SessionId,
        characteristic: &CharacteristicRef,
    ) -> Result<()> {
        let (peripheral, native) = self.resolve(address, characteristic)?;
        let sink = self.sink.clone();
        let address = address.clone();
        let key = characteristic.key();

        self.runtime.spawn(async move {
            let (status, value) = match peripheral.read(&native).await {
                Ok(data) => {
                    trace!("Read {} bytes from characteristic {}", data.len(), key);
                    (GattStatus::Success, data)
                }
                Err(e) => (GattStatus::Failure(e.to_string()), Vec::new()),
            };

            Self::report(
                &sink,
                address,
                session,
                CallbackKind::CharacteristicRead {
                    characteristic: key,
                    status,
                    value,
                },
            );
        });

        Ok(())
    }

    fn write_characteristic(
        &self,
        address: &PeripheralAddress,
        session: SessionId,
        characteristic: &CharacteristicRef,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<()> {
        let (peripheral, native) = self.resolve(address, characteristic)?;
        let sink = self.sink.clone();
        let address = address.clone();
        let key = characteristic.key();
        let data = value.to_vec();
        let write_type = match write_type {
            WriteType::WithResponse => BtWriteType::WithResponse,
            WriteType::WithoutResponse => BtWriteType::WithoutResponse,
        };

        self.runtime.spawn(async move {
            let status = match peripheral.write(&native, &data, write_type).await {
                Ok(()) => {
                    trace!("Wrote {} bytes to characteristic {}", data.len(), key);
                    GattStatus::Success
                }
                Err(e) => GattStatus::Failure(e.to_string()),
            };

            Self::report(
                &sink,
                address,
                session,
                CallbackKind::CharacteristicWritten {
                    characteristic: key,
                    status,
                },
            );
        });

        Ok(())
    }

    fn disconnect(&self, address: &PeripheralAddress) {
        if let Some(session) = self.claims.release(address) {
            trace!("Released claim of session {} on {}", session, address);
        }

        if let Some(handles) = self.tasks.write().remove(address) {
            for handle in handles {
                handle.abort();
            }
        }

        let Some(peripheral) = self.peripherals.write().remove(address) else {
            return;
        };

        let address = address.clone();
        self.runtime.spawn(async move {
            match peripheral.disconnect().await {
                Ok(()) => info!("Successfully disconnected from {}", address),
                Err(e) => error!("Failed to disconnect from {}: {}", address, e),
            }
        });
    }
}

impl Drop for BtleplugBackend {
    fn drop(&mut self) {
        for (_, handles) in self.tasks.write().drain() {
            for handle in handles {
                handle.abort();
            }
        }
    }
}

/// Forward value pushes for the lifetime of the connection.
fn spawn_notification_pump(
    peripheral: Peripheral,
    sink: CallbackSink,
    address: PeripheralAddress,
    session: SessionId,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut notifications = match peripheral.notifications().await {
            Ok(n) => n,
            Err(e) => {
                error!("Failed to get notifications stream for {}: {}", address, e);
                return;
            }
        };

        while let Some(notification) = notifications.next().await {
            trace!(
                "Notification from {} on {}: {:02X?}",
                address,
                notification.uuid,
                notification.value
            );

            let service = peripheral
                .characteristics()
                .into_iter()
                .find(|c| c.uuid == notification.uuid)
                .map(|c| c.service_uuid)
                .unwrap_or_else(Uuid::nil);

            BtleplugBackend::report(
                &sink,
                address.clone(),
                session,
                CallbackKind::CharacteristicChanged {
                    characteristic: CharacteristicKey::new(service, notification.uuid),
                    value: notification.value,
                },
            );
        }

        debug!("Notification stream for {} ended", address);
    })
}

/// Report link loss for the lifetime of the connection.
fn spawn_disconnect_watch(
    adapter: Adapter,
    id: PeripheralId,
    sink: CallbackSink,
    address: PeripheralAddress,
    session: SessionId,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut events = match adapter.events().await {
            Ok(events) => events,
            Err(e) => {
                error!("Failed to get adapter events: {}", e);
                return;
            }
        };

        while let Some(event) = events.next().await {
            if let CentralEvent::DeviceDisconnected(disconnected) = event {
                if disconnected == id {
                    info!("Link to {} lost", address);
                    BtleplugBackend::report(
                        &sink,
                        address.clone(),
                        session,
                        CallbackKind::ConnectionStateChanged {
                            status: GattStatus::Success,
                            connected: false,
                        },
                    );
                    break;
                }
            }
        }
    })
}

fn service_ref(service: &Service) -> ServiceRef {
    ServiceRef::new(
        service.uuid,
        service.characteristics.iter().map(characteristic_ref).collect(),
    )
}

fn characteristic_ref(native: &Characteristic) -> CharacteristicRef {
    // btleplug does not expose descriptor permissions.
    let permissions = DescriptorPermissions::READ | DescriptorPermissions::WRITE;
    let properties = CharacteristicProperties::from_bits(native.properties.bits());

    let mut characteristic = CharacteristicRef::new(native.service_uuid, native.uuid, properties);
    for descriptor in &native.descriptors {
        characteristic = characteristic.with_descriptor(DescriptorRef::new(descriptor.uuid, permissions));
    }

    // Some platforms keep the CCCD out of the descriptor list and manage it
    // through subscribe/unsubscribe.
    if properties.supports_notifications() && characteristic.descriptor(&CCCD_UUID).is_none() {
        characteristic = characteristic.with_descriptor(DescriptorRef::new(CCCD_UUID, permissions));
    }

    characteristic
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::uuids::{FUEL_LEVEL_CHARACTERISTIC_UUID, FUEL_SERVICE_UUID};
    use btleplug::api::{CharPropFlags, Descriptor};
    use std::collections::BTreeSet;

    fn native(properties: CharPropFlags, descriptors: &[Uuid]) -> Characteristic {
        Characteristic {
            uuid: FUEL_LEVEL_CHARACTERISTIC_UUID,
            service_uuid: FUEL_SERVICE_UUID,
            properties,
            descriptors: descriptors
                .iter()
                .map(|uuid| Descriptor {
                    uuid: *uuid,
                    service_uuid: FUEL_SERVICE_UUID,
                    characteristic_uuid: FUEL_LEVEL_CHARACTERISTIC_UUID,
                })
                .collect::<BTreeSet<_>>(),
        }
    }

    #[test]
    fn test_characteristic_ref_maps_properties() {
        let c = characteristic_ref(&native(CharPropFlags::READ | CharPropFlags::NOTIFY, &[CCCD_UUID]));

        assert_eq!(c.key(), CharacteristicKey::new(FUEL_SERVICE_UUID, FUEL_LEVEL_CHARACTERISTIC_UUID));
        assert!(c.properties.is_readable());
        assert!(c.properties.is_notifiable());
        assert!(!c.properties.is_writable());
        assert_eq!(c.descriptors.len(), 1);
        assert!(c.descriptor(&CCCD_UUID).unwrap().permissions.is_writable());
    }

    #[test]
    fn test_characteristic_ref_adds_hidden_cccd() {
        let c = characteristic_ref(&native(CharPropFlags::INDICATE, &[]));
        assert!(c.descriptor(&CCCD_UUID).is_some());

        let plain = characteristic_ref(&native(CharPropFlags::READ, &[]));
        assert!(plain.descriptor(&CCCD_UUID).is_none());
    }

    fn addr() -> PeripheralAddress {
        PeripheralAddress::from("AA:BB:CC:DD:EE:FF")
    }

    #[test]
    fn test_claim_installs_current_session() {
        let claims = Claims::default();
        let mut installed = false;

        claims.want(&addr(), SessionId(1));
        let claim = claims.install_if_current(&addr(), SessionId(1), || installed = true);

        assert_eq!(claim, Claim::Current);
        assert!(installed);
    }

    #[test]
    fn test_claim_released_while_connecting() {
        let claims = Claims::default();
        let mut installed = false;

        claims.want(&addr(), SessionId(1));
        assert_eq!(claims.release(&addr()), Some(SessionId(1)));
        let claim = claims.install_if_current(&addr(), SessionId(1), || installed = true);

        assert_eq!(claim, Claim::Abandoned);
        assert!(!installed);
    }

    #[test]
    fn test_stale_attempt_leaves_newer_session_alone() {
        let claims = Claims::default();
        let mut installed = Vec::new();

        claims.want(&addr(), SessionId(1));
        claims.release(&addr());
        claims.want(&addr(), SessionId(2));

        let newer = claims.install_if_current(&addr(), SessionId(2), || installed.push(2));
        let stale = claims.install_if_current(&addr(), SessionId(1), || installed.push(1));

        assert_eq!(newer, Claim::Current);
        assert_eq!(stale, Claim::Superseded);
        assert_eq!(installed, vec![2]);
    }

    #[test]
    fn test_service_ref() {
        let service = Service {
            uuid: FUEL_SERVICE_UUID,
            primary: true,
            characteristics: [native(CharPropFlags::READ, &[])].into_iter().collect(),
        };

        let mapped = service_ref(&service);
        assert_eq!(mapped.uuid, FUEL_SERVICE_UUID);
        assert_eq!(mapped.characteristics.len(), 1);
    }
}
