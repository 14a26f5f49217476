//! The seam between the connection state machine and a platform BLE stack.

use uuid::Uuid;

use crate::ble::gatt::{CharacteristicRef, PeripheralAddress, SessionId, WriteType};
use crate::error::{Error, Result};

/// Non-blocking access to a platform GATT client.
///
/// Every request method only enqueues work and returns. The outcome is
/// reported later as a [`GattCallback`](crate::ble::GattCallback) carrying
/// the same `session` through the backend's
/// [`CallbackSink`](crate::ble::CallbackSink). An `Err` return means the
/// request was never enqueued.
#[cfg_attr(test, mockall::automock)]
pub trait GattBackend: Send + Sync + 'static {
    /// Start connecting to a peripheral.
    fn connect(&self, address: &PeripheralAddress, session: SessionId) -> Result<()>;

    /// Start service discovery on a connected peripheral.
    fn discover_services(&self, address: &PeripheralAddress, session: SessionId) -> Result<()>;

    /// Toggle local delivery of value pushes for a characteristic.
    ///
    /// Returns `false` if the platform refuses.
    fn set_notification(
        &self,
        address: &PeripheralAddress,
        characteristic: &CharacteristicRef,
        enabled: bool,
    ) -> bool;

    /// Write a descriptor value.
    fn write_descriptor(
        &self,
        address: &PeripheralAddress,
        session: SessionId,
        characteristic: &CharacteristicRef,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<()>;

    /// Read a characteristic value.
    fn read_characteristic(
        &self,
        address: &PeripheralAddress,
        session: SessionId,
        characteristic: &CharacteristicRef,
    ) -> Result<()>;

    /// Write a characteristic value.
    fn write_characteristic(
        &self,
        address: &PeripheralAddress,
        session: SessionId,
        characteristic: &CharacteristicRef,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<()>;

    /// Request a larger ATT MTU.
    fn request_mtu(&self, address: &PeripheralAddress, session: SessionId, mtu: u16) -> Result<()> {
        let _ = (address, session, mtu);
        Err(Error::NotSupported {
            operation: "MTU request".to_string(),
        })
    }

    /// Drop the link and release every native resource held for the address.
    ///
    /// Must be safe to call for an address that is not connected.
    fn disconnect(&self, address: &PeripheralAddress);
}
