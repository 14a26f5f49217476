//! Fuel sensor to telemetry collector bridge.
//!
//! [`TelemetryBridge`] listens to a [`ConnectionStateMachine`] and sequences
//! the fuel characteristic on events rather than timers:
//!
//! 1. `SetupComplete`: enable notifications on the fuel characteristic, or
//!    read it directly if it cannot notify
//! 2. `NotificationsEnabled`: read the fuel characteristic
//! 3. `CharacteristicRead` / `CharacteristicChanged`: cache the fuel bytes
//!
//! Each location fix is then encoded with the cached fuel bytes and sent to
//! every collector host.

use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::ble::connection::{ConnectionStateMachine, WeakConnectionStateMachine};
use crate::ble::events::{ConnectionEvent, ConnectionEventKind, ListenerHandle};
use crate::ble::gatt::{CharacteristicKey, CharacteristicSelector, PeripheralAddress};
use crate::ble::uuids::CCCD_UUID;
use crate::ble::GattBackend;
use crate::error::Result;
use crate::telemetry::config::TelemetryConfig;
use crate::telemetry::encoder::{encode_telemetry, LocationFix};
use crate::telemetry::transmitter::{
    DnsResolver, HostResolver, HostRoster, TelemetryTransmitter, TransmitReport,
};
use crate::utils::{fuel_percent, to_hex_string};

/// State shared between the bridge and its connection listener.
#[derive(Debug)]
struct BridgeState {
    device_id: RwLock<String>,
    latest_fuel: RwLock<Option<Bytes>>,
    fuel: CharacteristicSelector,
    /// The fuel characteristic resolved on the current session.
    resolved: RwLock<Option<CharacteristicKey>>,
}

/// Connects the fuel sensor session to the telemetry transmitter.
pub struct TelemetryBridge<B: GattBackend, R: HostResolver = DnsResolver> {
    machine: ConnectionStateMachine<B>,
    state: Arc<BridgeState>,
    transmitter: TelemetryTransmitter<R>,
    _listener: ListenerHandle,
}

impl<B: GattBackend> TelemetryBridge<B, DnsResolver> {
    /// Create a bridge that resolves collector hosts through DNS.
    pub fn new(machine: &ConnectionStateMachine<B>, config: &TelemetryConfig) -> Self {
        Self::with_resolver(machine, config, DnsResolver)
    }
}

impl<B: GattBackend, R: HostResolver> TelemetryBridge<B, R> {
    /// Create a bridge with a custom host resolver.
    pub fn with_resolver(
        machine: &ConnectionStateMachine<B>,
        config: &TelemetryConfig,
        resolver: R,
    ) -> Self {
        let state = Arc::new(BridgeState {
            device_id: RwLock::new(config.device_id.clone()),
            latest_fuel: RwLock::new(None),
            fuel: CharacteristicSelector::scoped(
                config.fuel_service_uuid,
                config.fuel_characteristic_uuid,
            ),
            resolved: RwLock::new(None),
        });

        let roster = Arc::new(HostRoster::from_config(config));
        let transmitter = TelemetryTransmitter::with_resolver(roster, resolver);

        let weak = machine.downgrade();
        let listener_state = state.clone();
        let listener = machine.register_listener(move |event| {
            on_event(&weak, &listener_state, event);
        });

        Self {
            machine: machine.clone(),
            state,
            transmitter,
            _listener: listener,
        }
    }

    /// Start a session with the fuel sensor.
    pub fn connect(&self, address: &PeripheralAddress) -> Result<()> {
        self.machine.connect(address)
    }

    /// End the session with the fuel sensor.
    pub fn disconnect(&self, address: &PeripheralAddress) {
        self.machine.teardown(address);
    }

    /// Get the state machine this bridge listens to.
    pub fn machine(&self) -> &ConnectionStateMachine<B> {
        &self.machine
    }

    /// The device id sent with each record.
    pub fn device_id(&self) -> String {
        self.state.device_id.read().clone()
    }

    /// Replace the device id. Validated on the next location fix.
    pub fn set_device_id(&self, device_id: impl Into<String>) {
        *self.state.device_id.write() = device_id.into();
    }

    /// Replace the override host. A blank host restores the default.
    pub fn set_host_override(&self, host: &str) {
        self.transmitter.roster().set_override_host(host);
    }

    /// Get the collector host roster.
    pub fn roster(&self) -> &Arc<HostRoster> {
        self.transmitter.roster()
    }

    /// The most recently observed fuel level bytes.
    pub fn latest_fuel(&self) -> Option<Bytes> {
        self.state.latest_fuel.read().clone()
    }

    /// Encode a location fix with the latest fuel level and send it.
    ///
    /// # Errors
    ///
    /// Returns an error if the device id is invalid, no fuel level has been
    /// observed yet, or no local socket could be bound. Per-host failures
    /// are reported in the [`TransmitReport`].
    pub async fn on_location(&self, fix: &LocationFix) -> Result<TransmitReport> {
        let device_id = self.device_id();
        let fuel = self.latest_fuel();

        let record = encode_telemetry(&device_id, fix, fuel.as_deref())?;
        debug!("Telemetry record: {}", to_hex_string(&record));

        self.transmitter.send(&record).await
    }
}

fn on_event<B: GattBackend>(
    machine: &WeakConnectionStateMachine<B>,
    state: &BridgeState,
    event: &ConnectionEvent,
) {
    match &event.kind {
        ConnectionEventKind::SetupComplete => {
            if let Some(machine) = machine.upgrade() {
                start_fuel_updates(&machine, state, &event.address);
            }
        }
        ConnectionEventKind::NotificationsEnabled { uuid } if *uuid == state.fuel.uuid => {
            info!("Fuel level notifications enabled on {}", event.address);
            if let Some(machine) = machine.upgrade() {
                let fuel = state
                    .resolved
                    .read()
                    .map_or(state.fuel, CharacteristicSelector::from);
                if let Err(e) = machine.read_characteristic(&event.address, fuel) {
                    warn!("Failed to read fuel level: {}", e);
                }
            }
        }
        ConnectionEventKind::CharacteristicRead { uuid, value }
        | ConnectionEventKind::CharacteristicChanged { uuid, value }
            if *uuid == state.fuel.uuid =>
        {
            match fuel_percent(value) {
                Some(percent) => info!("Gasoline level: {}%", percent),
                None => debug!("Empty fuel level payload"),
            }
            *state.latest_fuel.write() = Some(Bytes::copy_from_slice(value));
        }
        ConnectionEventKind::Disconnected => {
            info!("Fuel sensor {} disconnected", event.address);
        }
        _ => {}
    }
}

fn start_fuel_updates<B: GattBackend>(
    machine: &ConnectionStateMachine<B>,
    state: &BridgeState,
    address: &PeripheralAddress,
) {
    let fuel = machine
        .find_characteristic(address, state.fuel)
        .or_else(|| machine.find_characteristic(address, state.fuel.uuid));

    let Some(fuel) = fuel else {
        warn!("{} has no fuel level characteristic", address);
        return;
    };
    *state.resolved.write() = Some(fuel.key());

    if fuel.properties.supports_notifications() && fuel.descriptor(&CCCD_UUID).is_some() {
        match machine.notifications().enable(address, &fuel) {
            Ok(()) => return,
            Err(e) => warn!("Failed to enable fuel level notifications: {}", e),
        }
    }

    debug!("Reading fuel level directly");
    if let Err(e) = machine.read_characteristic(address, fuel.key()) {
        warn!("Failed to read fuel level: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::capabilities::{CharacteristicProperties, DescriptorPermissions};
    use crate::ble::gatt::{
        callback_channel, CallbackKind, CharacteristicRef, DescriptorRef,
        GattCallback, GattStatus, ServiceRef, SessionId,
    };
    use crate::ble::testing::{FakeBackend, Request};
    use crate::ble::uuids::*;
    use crate::error::Error;
    use crate::telemetry::config::DEFAULT_OVERRIDE_HOST;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::io;
    use std::net::SocketAddr;
    use tokio::net::UdpSocket;

    struct LoopbackResolver(SocketAddr);

    #[async_trait]
    impl HostResolver for LoopbackResolver {
        async fn resolve(&self, _host: &str, _port: u16) -> io::Result<SocketAddr> {
            Ok(self.0)
        }
    }

    fn addr() -> PeripheralAddress {
        PeripheralAddress::from("11:22:33:44:55:66")
    }

    fn fuel_key() -> CharacteristicKey {
        CharacteristicKey::new(FUEL_SERVICE_UUID, FUEL_LEVEL_CHARACTERISTIC_UUID)
    }

    fn fuel_service(properties: u8) -> ServiceRef {
        ServiceRef::new(
            FUEL_SERVICE_UUID,
            vec![CharacteristicRef::new(
                FUEL_SERVICE_UUID,
                FUEL_LEVEL_CHARACTERISTIC_UUID,
                properties,
            )
            .with_descriptor(DescriptorRef::new(CCCD_UUID, DescriptorPermissions::WRITE))],
        )
    }

    fn bring_up(machine: &ConnectionStateMachine<FakeBackend>, service: ServiceRef) -> SessionId {
        machine.connect(&addr()).unwrap();
        let session = machine.backend().last_session().unwrap();
        machine.handle_callback(GattCallback::new(
            addr(),
            session,
            CallbackKind::ConnectionStateChanged {
                status: GattStatus::Success,
                connected: true,
            },
        ));
        machine.handle_callback(GattCallback::new(
            addr(),
            session,
            CallbackKind::ServicesDiscovered {
                status: GattStatus::Success,
                services: vec![service],
            },
        ));
        session
    }

    fn reads(machine: &ConnectionStateMachine<FakeBackend>) -> usize {
        machine
            .backend()
            .requests()
            .iter()
            .filter(|r| **r == Request::Read(fuel_key()))
            .count()
    }

    #[test]
    fn test_read_waits_for_notifications_enabled() {
        let (sink, _rx) = callback_channel();
        let machine = ConnectionStateMachine::new(FakeBackend::default(), sink);
        let bridge = TelemetryBridge::new(&machine, &TelemetryConfig::default());

        let session = bring_up(
            &machine,
            fuel_service(CharacteristicProperties::READ | CharacteristicProperties::NOTIFY),
        );

        assert!(machine.backend().requests().contains(&Request::WriteDescriptor {
            characteristic: fuel_key(),
            descriptor: CCCD_UUID,
            value: ENABLE_NOTIFICATION_VALUE.to_vec(),
        }));
        assert_eq!(reads(&machine), 0);

        machine.handle_callback(GattCallback::new(
            addr(),
            session,
            CallbackKind::DescriptorWritten {
                characteristic: fuel_key(),
                descriptor: CCCD_UUID,
                status: GattStatus::Success,
                value: ENABLE_NOTIFICATION_VALUE.to_vec(),
            },
        ));
        assert_eq!(reads(&machine), 1);

        machine.handle_callback(GattCallback::new(
            addr(),
            session,
            CallbackKind::CharacteristicRead {
                characteristic: fuel_key(),
                status: GattStatus::Success,
                value: vec![0x42, 0x00, 0x00, 0x00],
            },
        ));
        assert_eq!(
            bridge.latest_fuel(),
            Some(Bytes::from_static(&[0x42, 0x00, 0x00, 0x00]))
        );

        machine.handle_callback(GattCallback::new(
            addr(),
            session,
            CallbackKind::CharacteristicChanged {
                characteristic: fuel_key(),
                value: vec![0x32],
            },
        ));
        assert_eq!(bridge.latest_fuel(), Some(Bytes::from_static(&[0x32])));
    }

    #[test]
    fn test_read_follows_characteristic_found_under_other_service() {
        let (sink, _rx) = callback_channel();
        let machine = ConnectionStateMachine::new(FakeBackend::default(), sink);
        let _bridge = TelemetryBridge::new(&machine, &TelemetryConfig::default());

        let other_service = expand_uuid16(0x1800);
        let key = CharacteristicKey::new(other_service, FUEL_LEVEL_CHARACTERISTIC_UUID);
        let service = ServiceRef::new(
            other_service,
            vec![CharacteristicRef::new(
                other_service,
                FUEL_LEVEL_CHARACTERISTIC_UUID,
                CharacteristicProperties::READ | CharacteristicProperties::NOTIFY,
            )
            .with_descriptor(DescriptorRef::new(CCCD_UUID, DescriptorPermissions::WRITE))],
        );
        let session = bring_up(&machine, service);

        machine.handle_callback(GattCallback::new(
            addr(),
            session,
            CallbackKind::DescriptorWritten {
                characteristic: key,
                descriptor: CCCD_UUID,
                status: GattStatus::Success,
                value: ENABLE_NOTIFICATION_VALUE.to_vec(),
            },
        ));

        assert!(machine.backend().requests().contains(&Request::Read(key)));
        assert!(machine.is_ready(&addr()));
    }

    #[test]
    fn test_reads_directly_without_notify() {
        let (sink, _rx) = callback_channel();
        let machine = ConnectionStateMachine::new(FakeBackend::default(), sink);
        let _bridge = TelemetryBridge::new(&machine, &TelemetryConfig::default());

        bring_up(&machine, fuel_service(CharacteristicProperties::READ));

        assert_eq!(reads(&machine), 1);
        assert!(!machine
            .backend()
            .requests()
            .iter()
            .any(|r| matches!(r, Request::WriteDescriptor { .. })));
    }

    #[test]
    fn test_ignores_other_characteristics() {
        let (sink, _rx) = callback_channel();
        let machine = ConnectionStateMachine::new(FakeBackend::default(), sink);
        let bridge = TelemetryBridge::new(&machine, &TelemetryConfig::default());

        let other = expand_uuid16(0x2A6E);
        let service = ServiceRef::new(
            FUEL_SERVICE_UUID,
            vec![CharacteristicRef::new(FUEL_SERVICE_UUID, other, CharacteristicProperties::NOTIFY)],
        );
        let session = bring_up(&machine, service);

        machine.handle_callback(GattCallback::new(
            addr(),
            session,
            CallbackKind::CharacteristicChanged {
                characteristic: CharacteristicKey::new(FUEL_SERVICE_UUID, other),
                value: vec![0x10],
            },
        ));
        assert_eq!(bridge.latest_fuel(), None);
    }

    #[test]
    fn test_device_id_and_override() {
        let (sink, _rx) = callback_channel();
        let machine = ConnectionStateMachine::new(FakeBackend::default(), sink);
        let bridge = TelemetryBridge::new(&machine, &TelemetryConfig::default().with_device_id("0A1B2C"));

        assert_eq!(bridge.device_id(), "0A1B2C");
        bridge.set_device_id("ABCDEF");
        assert_eq!(bridge.device_id(), "ABCDEF");

        bridge.set_host_override("192.168.4.1");
        assert_eq!(&*bridge.roster().override_host(), "192.168.4.1");
        bridge.set_host_override("");
        assert_eq!(&*bridge.roster().override_host(), DEFAULT_OVERRIDE_HOST);
    }

    #[test]
    fn test_listener_released_with_bridge() {
        let (sink, _rx) = callback_channel();
        let machine = ConnectionStateMachine::new(FakeBackend::default(), sink);
        let bridge = TelemetryBridge::new(&machine, &TelemetryConfig::default());
        assert_eq!(machine.listener_count(), 1);

        drop(bridge);
        assert_eq!(machine.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_on_location_requires_fuel() {
        let (sink, _rx) = callback_channel();
        let machine = ConnectionStateMachine::new(FakeBackend::default(), sink);
        let bridge = TelemetryBridge::new(&machine, &TelemetryConfig::default().with_device_id("010203"));

        let result = bridge.on_location(&LocationFix::new(1.0, 2.0, 3_000)).await;
        assert!(matches!(result, Err(Error::NoFuelDataYet)));
    }

    #[tokio::test]
    async fn test_on_location_rejects_bad_device_id() {
        let (sink, _rx) = callback_channel();
        let machine = ConnectionStateMachine::new(FakeBackend::default(), sink);
        let bridge = TelemetryBridge::new(&machine, &TelemetryConfig::default().with_device_id("ZZ1B2C"));

        let result = bridge.on_location(&LocationFix::new(1.0, 2.0, 3_000)).await;
        assert!(matches!(result, Err(Error::InvalidHexDigit('Z'))));
    }

    #[tokio::test]
    async fn test_on_location_sends_record() {
        let collector = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = TelemetryConfig::default()
            .with_device_id("010203")
            .with_default_hosts(Vec::<String>::new());

        let (sink, _rx) = callback_channel();
        let machine = ConnectionStateMachine::new(FakeBackend::default(), sink);
        let bridge = TelemetryBridge::with_resolver(
            &machine,
            &config,
            LoopbackResolver(collector.local_addr().unwrap()),
        );

        let session = bring_up(&machine, fuel_service(CharacteristicProperties::READ));
        machine.handle_callback(GattCallback::new(
            addr(),
            session,
            CallbackKind::CharacteristicRead {
                characteristic: fuel_key(),
                status: GattStatus::Success,
                value: vec![0x42, 0x00, 0x00, 0x00],
            },
        ));

        let report = bridge
            .on_location(&LocationFix::new(37.7749, -122.4194, 1_700_000_000_000))
            .await
            .unwrap();
        assert_eq!(report.delivered, vec![DEFAULT_OVERRIDE_HOST.to_string()]);
        assert!(report.is_complete());

        let mut buf = [0u8; 64];
        let (len, _) = collector.recv_from(&mut buf).await.unwrap();
        assert_eq!(
            buf[..len].to_vec(),
            vec![
                0x01, 0x02, 0x03, 0x42, 0x17, 0x19, 0x7F, 0xC2, 0xF4, 0xD6, 0xBC, 0x65, 0x53,
                0xF1, 0x00, 0x42, 0x00, 0x00, 0x00,
            ]
        );
    }
}
