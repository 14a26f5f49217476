//! Telemetry record encoding.
//!
//! Record layout, all multi-byte fields big-endian:
//! - Device id (3 bytes)
//! - Latitude (f32)
//! - Longitude (f32)
//! - Timestamp in epoch seconds (i32)
//! - Fuel level payload, verbatim (usually 4 bytes)

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Size of the fixed part of a record, before the fuel payload.
pub const RECORD_HEADER_LEN: usize = 15;

/// A 3-byte device identifier, written as six hex characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceId([u8; 3]);

impl DeviceId {
    /// Create a device id from raw bytes.
    pub const fn new(bytes: [u8; 3]) -> Self {
        Self(bytes)
    }

    /// Get the raw id bytes.
    pub const fn as_bytes(&self) -> &[u8; 3] {
        &self.0
    }
}

impl FromStr for DeviceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(bad) = s.chars().find(|c| !c.is_ascii_hexdigit()) {
            return Err(Error::InvalidHexDigit(bad));
        }

        let len = s.len();
        if len != 6 {
            return Err(Error::InvalidDeviceIdLength { len });
        }

        let mut bytes = [0u8; 3];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| Error::Internal(format!("hex decode: {}", e)))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode_upper(self.0))
    }
}

/// A position fix from the positioning collaborator.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LocationFix {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// Fix time in milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
}

impl LocationFix {
    /// Create a fix from degrees and an epoch-millisecond timestamp.
    pub fn new(latitude: f64, longitude: f64, timestamp_ms: i64) -> Self {
        Self {
            latitude,
            longitude,
            timestamp_ms,
        }
    }

    /// Create a fix stamped with a UTC time.
    pub fn from_datetime(latitude: f64, longitude: f64, time: DateTime<Utc>) -> Self {
        Self::new(latitude, longitude, time.timestamp_millis())
    }

    /// A fix stamped with the current time.
    pub fn now(latitude: f64, longitude: f64) -> Self {
        Self::from_datetime(latitude, longitude, Utc::now())
    }

    /// Fix time in whole seconds, truncated toward zero.
    pub fn timestamp_seconds(&self) -> i32 {
        (self.timestamp_ms / 1000) as i32
    }
}

/// One telemetry sample, ready to encode.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryRecord {
    pub device_id: DeviceId,
    pub latitude: f32,
    pub longitude: f32,
    pub timestamp_seconds: i32,
    pub fuel_payload: Bytes,
}

impl TelemetryRecord {
    /// Build a record from a fix and the last observed fuel level.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoFuelDataYet`] if no fuel level has been observed.
    pub fn new(device_id: DeviceId, fix: &LocationFix, fuel: Option<&[u8]>) -> Result<Self> {
        let fuel = fuel.ok_or(Error::NoFuelDataYet)?;

        Ok(Self {
            device_id,
            latitude: fix.latitude as f32,
            longitude: fix.longitude as f32,
            timestamp_seconds: fix.timestamp_seconds(),
            fuel_payload: Bytes::copy_from_slice(fuel),
        })
    }

    /// Length of the encoded record.
    pub fn encoded_len(&self) -> usize {
        RECORD_HEADER_LEN + self.fuel_payload.len()
    }

    /// Encode the record into its wire form.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_slice(self.device_id.as_bytes());
        buf.put_f32(self.latitude);
        buf.put_f32(self.longitude);
        buf.put_i32(self.timestamp_seconds);
        buf.put_slice(&self.fuel_payload);
        buf.freeze()
    }
}

/// Parse the device id, build the record, and encode it.
pub fn encode_telemetry(device_id: &str, fix: &LocationFix, fuel: Option<&[u8]>) -> Result<Bytes> {
    let device_id: DeviceId = device_id.parse()?;
    Ok(TelemetryRecord::new(device_id, fix, fuel)?.encode())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    const FUEL: [u8; 4] = [0x42, 0x00, 0x00, 0x00];

    fn sample_fix() -> LocationFix {
        LocationFix::new(37.7749, -122.4194, 1_700_000_000_000)
    }

    #[test]
    fn test_device_id_decode() {
        let id: DeviceId = "0A1B2C".parse().unwrap();
        assert_eq!(id.as_bytes(), &[0x0A, 0x1B, 0x2C]);
        assert_eq!(id.to_string(), "0A1B2C");

        let lower: DeviceId = "0a1b2c".parse().unwrap();
        assert_eq!(lower, id);
    }

    #[test]
    fn test_device_id_invalid_digit() {
        let err = "ZZ1B2C".parse::<DeviceId>().unwrap_err();
        assert!(matches!(err, Error::InvalidHexDigit('Z')));

        let err = "0A1B2G".parse::<DeviceId>().unwrap_err();
        assert!(matches!(err, Error::InvalidHexDigit('G')));

        // A bad digit is reported even when the length is also wrong.
        let err = "ZZ".parse::<DeviceId>().unwrap_err();
        assert!(matches!(err, Error::InvalidHexDigit('Z')));
    }

    #[test]
    fn test_device_id_invalid_length() {
        assert!(matches!(
            "0A1B".parse::<DeviceId>(),
            Err(Error::InvalidDeviceIdLength { len: 4 })
        ));
        assert!(matches!(
            "".parse::<DeviceId>(),
            Err(Error::InvalidDeviceIdLength { len: 0 })
        ));
    }

    #[test]
    fn test_encode_known_vector() {
        let record =
            TelemetryRecord::new(DeviceId::new([0x01, 0x02, 0x03]), &sample_fix(), Some(&FUEL)).unwrap();

        let expected: Vec<u8> = vec![
            0x01, 0x02, 0x03, // id
            0x42, 0x17, 0x19, 0x7F, // latitude
            0xC2, 0xF4, 0xD6, 0xBC, // longitude
            0x65, 0x53, 0xF1, 0x00, // timestamp
            0x42, 0x00, 0x00, 0x00, // fuel
        ];

        assert_eq!(record.encoded_len(), 19);
        assert_eq!(record.encode().to_vec(), expected);
    }

    #[test]
    fn test_encode_is_deterministic() {
        let first = encode_telemetry("010203", &sample_fix(), Some(&FUEL)).unwrap();
        let second = encode_telemetry("010203", &sample_fix(), Some(&FUEL)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_encode_without_fuel() {
        let result = encode_telemetry("010203", &sample_fix(), None);
        assert!(matches!(result, Err(Error::NoFuelDataYet)));
    }

    #[test]
    fn test_encode_variable_fuel_length() {
        let short = encode_telemetry("010203", &sample_fix(), Some(&[0x32])).unwrap();
        assert_eq!(short.len(), 16);
        assert_eq!(short[15], 0x32);

        let empty = encode_telemetry("010203", &sample_fix(), Some(&[])).unwrap();
        assert_eq!(empty.len(), RECORD_HEADER_LEN);
    }

    #[test]
    fn test_timestamp_truncates_toward_zero() {
        assert_eq!(LocationFix::new(0.0, 0.0, 1_700_000_000_999).timestamp_seconds(), 1_700_000_000);
        assert_eq!(LocationFix::new(0.0, 0.0, -1_500).timestamp_seconds(), -1);
    }

    #[test]
    fn test_location_fix_from_datetime() {
        let time = Utc.timestamp_opt(1_700_000_000, 250_000_000).unwrap();
        let fix = LocationFix::from_datetime(1.0, 2.0, time);
        assert_eq!(fix.timestamp_ms, 1_700_000_000_250);
        assert_eq!(fix.timestamp_seconds(), 1_700_000_000);
    }

    proptest! {
        #[test]
        fn prop_device_id_round_trips_hex(bytes in any::<[u8; 3]>()) {
            let text = hex::encode(bytes);
            let id: DeviceId = text.parse().unwrap();
            prop_assert_eq!(id.as_bytes(), &bytes);
        }

        #[test]
        fn prop_encoded_len_tracks_fuel(
            lat in -90.0f64..90.0,
            lon in -180.0f64..180.0,
            ts in 0i64..4_000_000_000_000,
            fuel in proptest::collection::vec(any::<u8>(), 0..8),
        ) {
            let fix = LocationFix::new(lat, lon, ts);
            let encoded = encode_telemetry("ABCDEF", &fix, Some(&fuel)).unwrap();
            prop_assert_eq!(encoded.len(), RECORD_HEADER_LEN + fuel.len());
            prop_assert_eq!(&encoded[..3], &[0xAB, 0xCD, 0xEF]);
            prop_assert_eq!(&encoded[RECORD_HEADER_LEN..], &fuel[..]);
        }
    }
}
