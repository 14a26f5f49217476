//! BLE Service, Characteristic and Descriptor UUIDs.
//!
//! The fuel sender reuses the standard Battery Service layout: the fuel
//! level lives in the Battery Level characteristic.

use uuid::Uuid;

/// Battery Service UUID, hosting the fuel-level characteristic.
pub const FUEL_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_180f_0000_1000_8000_00805f9b34fb);
/// Battery Level characteristic UUID, carrying the fuel level (Read, Notify).
pub const FUEL_LEVEL_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0000_2a19_0000_1000_8000_00805f9b34fb);

/// Client Characteristic Configuration descriptor UUID.
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x0000_2902_0000_1000_8000_00805f9b34fb);

/// CCCD value enabling notifications.
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];
/// CCCD value enabling indications.
pub const ENABLE_INDICATION_VALUE: [u8; 2] = [0x02, 0x00];
/// CCCD value disabling both notifications and indications.
pub const DISABLE_NOTIFICATION_VALUE: [u8; 2] = [0x00, 0x00];

/// Expand a 16-bit Bluetooth SIG assigned number into a full UUID.
pub const fn expand_uuid16(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_00805f9b34fb)
}

/// Check if a descriptor UUID is the CCCD.
pub fn is_cccd(uuid: &Uuid) -> bool {
    *uuid == CCCD_UUID
}
