//! Error types for the ble-fuel-telemetry crate.

use thiserror::Error;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// No peripheral with the given address is known to the adapter.
    #[error("Peripheral not found: {address}")]
    PeripheralNotFound {
        /// The address that was searched for.
        address: String,
    },

    /// Operation requires a ready session but the peripheral is not connected.
    #[error("Peripheral not connected")]
    NotConnected,

    /// A session for this address is already being set up.
    #[error("Connection to {address} already in progress")]
    AlreadyConnecting {
        /// The address of the peripheral.
        address: String,
    },

    /// Characteristic not found in the session's discovered set.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: String,
    },

    /// A read, write or descriptor write is still outstanding on this characteristic.
    #[error("Operation already in flight on characteristic {uuid}")]
    OperationInFlight {
        /// The UUID of the busy characteristic.
        uuid: String,
    },

    /// The characteristic's properties do not allow the requested operation.
    #[error("Characteristic {uuid} does not support {operation}")]
    UnsupportedOperation {
        /// The UUID of the characteristic.
        uuid: String,
        /// Description of the refused operation.
        operation: String,
    },

    /// The session refused to toggle local notification delivery.
    #[error("Local notification toggle failed for {uuid}")]
    LocalEnableFailed {
        /// The UUID of the characteristic.
        uuid: String,
    },

    /// The characteristic has no Client Characteristic Configuration descriptor.
    #[error("Characteristic {uuid} has no CCC descriptor")]
    MissingDescriptor {
        /// The UUID of the characteristic.
        uuid: String,
    },

    /// The backend does not implement the requested operation.
    #[error("Operation not supported: {operation}")]
    NotSupported {
        /// Description of the unsupported operation.
        operation: String,
    },

    /// A device id character is not a hexadecimal digit.
    #[error("Invalid hexadecimal character: {0}")]
    InvalidHexDigit(char),

    /// A device id does not have exactly six hex characters.
    #[error("Device id must be 6 hex characters, got {len}")]
    InvalidDeviceIdLength {
        /// Number of characters supplied.
        len: usize,
    },

    /// A telemetry record was requested before any fuel level was observed.
    #[error("No fuel level has been observed yet")]
    NoFuelDataYet,

    /// I/O error while setting up a transmission.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An invalid parameter was provided.
    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter {
        /// The name of the parameter.
        name: String,
        /// The invalid value that was provided.
        value: String,
    },

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_hex_digit_names_character() {
        let err = Error::InvalidHexDigit('Z');
        assert_eq!(err.to_string(), "Invalid hexadecimal character: Z");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::AddrInUse, "busy");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
