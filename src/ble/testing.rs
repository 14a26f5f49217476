//! Recording backend for unit tests.

use parking_lot::Mutex;
use uuid::Uuid;

use crate::ble::backend::GattBackend;
use crate::ble::gatt::{CharacteristicKey, CharacteristicRef, PeripheralAddress, SessionId, WriteType};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Request {
    Connect(SessionId),
    DiscoverServices(SessionId),
    SetNotification {
        characteristic: CharacteristicKey,
        enabled: bool,
    },
    WriteDescriptor {
        characteristic: CharacteristicKey,
        descriptor: Uuid,
        value: Vec<u8>,
    },
    Read(CharacteristicKey),
    Write {
        characteristic: CharacteristicKey,
        value: Vec<u8>,
        write_type: WriteType,
    },
    Disconnect,
}

/// Accepts every request and records it.
#[derive(Default)]
pub(crate) struct FakeBackend {
    requests: Mutex<Vec<Request>>,
}

impl FakeBackend {
    pub(crate) fn requests(&self) -> Vec<Request> {
        self.requests.lock().clone()
    }

    /// Session id of the most recent connect request.
    pub(crate) fn last_session(&self) -> Option<SessionId> {
        self.requests.lock().iter().rev().find_map(|r| match r {
            Request::Connect(session) => Some(*session),
            _ => None,
        })
    }

    fn record(&self, request: Request) {
        self.requests.lock().push(request);
    }
}

impl GattBackend for FakeBackend {
    fn connect(&self, _address: &PeripheralAddress, session: SessionId) -> Result<()> {
        self.record(Request::Connect(session));
        Ok(())
    }

    fn discover_services(&self, _address: &PeripheralAddress, session: SessionId) -> Result<()> {
        self.record(Request::DiscoverServices(session));
        Ok(())
    }

    fn set_notification(
        &self,
        _address: &PeripheralAddress,
        characteristic: &CharacteristicRef,
        enabled: bool,
    ) -> bool {
        self.record(Request::SetNotification {
            characteristic: characteristic.key(),
            enabled,
        });
        true
    }

    fn write_descriptor(
        &self,
        _address: &PeripheralAddress,
        _session: SessionId,
        characteristic: &CharacteristicRef,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<()> {
        self.record(Request::WriteDescriptor {
            characteristic: characteristic.key(),
            descriptor,
            value: value.to_vec(),
        });
        Ok(())
    }

    fn read_characteristic(
        &self,
        _address: &PeripheralAddress,
        _session: SessionId,
        characteristic: &CharacteristicRef,
    ) -> Result<()> {
        self.record(Request::Read(characteristic.key()));
        Ok(())
    }

    fn write_characteristic(
        &self,
        _address: &PeripheralAddress,
        _session: SessionId,
        characteristic: &CharacteristicRef,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<()> {
        self.record(Request::Write {
            characteristic: characteristic.key(),
            value: value.to_vec(),
            write_type,
        });
        Ok(())
    }

    fn disconnect(&self, _address: &PeripheralAddress) {
        self.record(Request::Disconnect);
    }
}
