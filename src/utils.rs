//! Utility functions for the ble-fuel-telemetry crate.

/// Format bytes as a hex dump for logs.
///
/// The first byte carries a `0x` prefix and the rest are separated by
/// spaces. An empty slice yields an empty string.
///
/// # Example
///
/// ```
/// use ble_fuel_telemetry::to_hex_string;
///
/// assert_eq!(to_hex_string(&[0x0A, 0x1B, 0x2C]), "0x0A 1B 2C");
/// ```
pub fn to_hex_string(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return String::new();
    }

    let body = bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ");
    format!("0x{}", body)
}

/// Interpret a fuel level payload as a percentage.
///
/// # Arguments
///
/// * `payload` - Raw bytes read from the fuel level characteristic
///
/// # Returns
///
/// The first byte clamped to 0..=100, or `None` for an empty payload
///
/// # Example
///
/// ```
/// use ble_fuel_telemetry::fuel_percent;
///
/// assert_eq!(fuel_percent(&[0x32, 0x00, 0x00, 0x00]), Some(50));
/// ```
#[inline]
pub fn fuel_percent(payload: &[u8]) -> Option<u8> {
    payload.first().map(|level| (*level).min(100))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_hex_string() {
        assert_eq!(to_hex_string(&[0x0A, 0x1B, 0x2C]), "0x0A 1B 2C");
        assert_eq!(to_hex_string(&[0xFF]), "0xFF");
        assert_eq!(to_hex_string(&[]), "");
    }

    #[test]
    fn test_fuel_percent() {
        assert_eq!(fuel_percent(&[0x42, 0x00, 0x00, 0x00]), Some(66));
        assert_eq!(fuel_percent(&[0x00]), Some(0));
        assert_eq!(fuel_percent(&[0xC8]), Some(100));
        assert_eq!(fuel_percent(&[]), None);
    }
}
