//! Heart Rate Service Protocol
//!
//! UUIDs of the standard Bluetooth SIG Heart Rate Service and the decoder
//! for its Heart Rate Measurement characteristic.

use crate::domain::models::{HeartRateMeasurement, SensorContact};
use uuid::Uuid;

/// Heart Rate Service
pub const HEART_RATE_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000180d_0000_1000_8000_00805f9b34fb);

/// Heart Rate Measurement characteristic (notify only)
pub const HEART_RATE_MEASUREMENT_UUID: Uuid =
    Uuid::from_u128(0x00002a37_0000_1000_8000_00805f9b34fb);

/// Client Characteristic Configuration descriptor
pub const CLIENT_CHARACTERISTIC_CONFIG_UUID: Uuid =
    Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// Flag bits of the first payload byte
pub mod flags {
    /// Heart rate value is u16 instead of u8
    pub const HR_FORMAT_U16: u8 = 0x01;
    /// Sensor contact detected
    pub const CONTACT_DETECTED: u8 = 0x02;
    /// Sensor contact feature supported
    pub const CONTACT_SUPPORTED: u8 = 0x04;
    pub const ENERGY_EXPENDED_PRESENT: u8 = 0x08;
    pub const RR_INTERVALS_PRESENT: u8 = 0x10;
}

/// Parse a Heart Rate Measurement payload
///
/// # Payload Structure
///
/// ```text
/// [0]     : Flags
///           bit 0: heart rate format (0 = u8, 1 = u16)
///           bit 1-2: sensor contact status
///           bit 3: energy expended present
///           bit 4: RR intervals present
/// [1..]   : Heart rate (u8, or u16 little-endian)
/// [..]    : Energy expended (u16 little-endian, kJ) if flagged
/// [..]    : RR intervals (u16 little-endian each, 1/1024 s) if flagged,
///           repeated until the end of the payload
/// ```
///
/// Never fails: truncated payloads yield whatever fields were complete.
pub fn parse_heart_rate_measurement(bytes: &[u8]) -> HeartRateMeasurement {
    let Some((&flag_byte, rest)) = bytes.split_first() else {
        return HeartRateMeasurement::default();
    };

    let mut reader = LeReader::new(rest);

    let heart_rate = if flag_byte & flags::HR_FORMAT_U16 != 0 {
        reader.read_u16()
    } else {
        reader.read_u8().map(u16::from)
    };
    let Some(heart_rate) = heart_rate else {
        return HeartRateMeasurement::default();
    };

    let energy_expended = if flag_byte & flags::ENERGY_EXPENDED_PRESENT != 0 {
        reader.read_u16()
    } else {
        None
    };

    let mut rr_intervals = Vec::new();
    if flag_byte & flags::RR_INTERVALS_PRESENT != 0 {
        while let Some(rr) = reader.read_u16() {
            rr_intervals.push(rr);
        }
    }

    HeartRateMeasurement {
        heart_rate,
        energy_expended,
        rr_intervals,
    }
}

impl SensorContact {
    /// Decode bits 1-2 of the flags byte
    pub fn from_flags(flag_byte: u8) -> Self {
        if flag_byte & flags::CONTACT_SUPPORTED == 0 {
            Self::NotSupported
        } else if flag_byte & flags::CONTACT_DETECTED != 0 {
            Self::Detected
        } else {
            Self::NotDetected
        }
    }
}

/// Convert an RR interval from 1/1024 s units to milliseconds
pub fn rr_to_millis(rr: u16) -> f32 {
    f32::from(rr) * 1000.0 / 1024.0
}

/// Cursor over little-endian fields
struct LeReader<'a> {
    bytes: &'a [u8],
}

impl<'a> LeReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn read_u8(&mut self) -> Option<u8> {
        let (&value, rest) = self.bytes.split_first()?;
        self.bytes = rest;
        Some(value)
    }

    fn read_u16(&mut self) -> Option<u16> {
        match self.bytes {
            [lo, hi, rest @ ..] => {
                self.bytes = rest;
                Some(u16::from_le_bytes([*lo, *hi]))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_payload() {
        assert_eq!(
            parse_heart_rate_measurement(&[]),
            HeartRateMeasurement {
                heart_rate: 0,
                energy_expended: None,
                rr_intervals: vec![],
            }
        );
    }

    #[test]
    fn test_u8_heart_rate() {
        let m = parse_heart_rate_measurement(&[0x00, 75]);
        assert_eq!(m.heart_rate, 75);
        assert_eq!(m.energy_expended, None);
        assert!(m.rr_intervals.is_empty());
    }

    #[test]
    fn test_u16_energy_and_rr() {
        let m = parse_heart_rate_measurement(&[0x19, 0x4B, 0x00, 0x10, 0x00, 0xE8, 0x03]);
        assert_eq!(
            m,
            HeartRateMeasurement {
                heart_rate: 75,
                energy_expended: Some(16),
                rr_intervals: vec![1000],
            }
        );
    }

    #[test]
    fn test_u16_heart_rate_high_byte() {
        let m = parse_heart_rate_measurement(&[0x01, 0x2C, 0x01]);
        assert_eq!(m.heart_rate, 300);
    }

    #[test]
    fn test_batched_rr_intervals_in_wire_order() {
        let m = parse_heart_rate_measurement(&[0x10, 80, 0x00, 0x03, 0x10, 0x03, 0x20, 0x03]);
        assert_eq!(m.heart_rate, 80);
        assert_eq!(m.rr_intervals, vec![0x0300, 0x0310, 0x0320]);
    }

    #[test]
    fn test_rr_trailing_odd_byte_ignored() {
        let m = parse_heart_rate_measurement(&[0x10, 80, 0xE8, 0x03, 0x07]);
        assert_eq!(m.rr_intervals, vec![1000]);
    }

    #[test]
    fn test_truncated_heart_rate() {
        let m = parse_heart_rate_measurement(&[0x19, 0x4B]);
        assert_eq!(m, HeartRateMeasurement::default());

        let m = parse_heart_rate_measurement(&[0x00]);
        assert_eq!(m.heart_rate, 0);
    }

    #[test]
    fn test_truncated_energy_is_absent() {
        let m = parse_heart_rate_measurement(&[0x08, 60, 0x10]);
        assert_eq!(m.heart_rate, 60);
        assert_eq!(m.energy_expended, None);
    }

    #[test]
    fn test_energy_flag_without_rr_flag_ignores_tail() {
        let m = parse_heart_rate_measurement(&[0x08, 60, 0x10, 0x00, 0xE8, 0x03]);
        assert_eq!(m.energy_expended, Some(16));
        assert!(m.rr_intervals.is_empty());
    }

    #[test]
    fn test_parse_is_total() {
        // Every flag combination against every length up to 8 bytes
        for flag_byte in 0..=u8::MAX {
            for len in 0..8 {
                let mut payload = vec![flag_byte];
                payload.extend((0..len).map(|i| (i as u8).wrapping_mul(37)));
                let m = parse_heart_rate_measurement(&payload);
                assert!(m.rr_intervals.len() <= len / 2);
            }
        }
    }

    #[test]
    fn test_sensor_contact() {
        assert_eq!(SensorContact::from_flags(0x00), SensorContact::NotSupported);
        assert_eq!(SensorContact::from_flags(0x02), SensorContact::NotSupported);
        assert_eq!(SensorContact::from_flags(0x04), SensorContact::NotDetected);
        assert_eq!(SensorContact::from_flags(0x06), SensorContact::Detected);
    }

    #[test]
    fn test_rr_to_millis() {
        assert_eq!(rr_to_millis(1024), 1000.0);
        assert_eq!(rr_to_millis(512), 500.0);
    }

    #[test]
    fn test_uuids() {
        assert_eq!(
            HEART_RATE_SERVICE_UUID.to_string(),
            "0000180d-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            HEART_RATE_MEASUREMENT_UUID.to_string(),
            "00002a37-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            CLIENT_CHARACTERISTIC_CONFIG_UUID.to_string(),
            "00002902-0000-1000-8000-00805f9b34fb"
        );
    }
}
