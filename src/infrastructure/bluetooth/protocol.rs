//! KICKR Wheel Circumference Protocol
//!
//! Identifiers and the command codec for the trainer's vendor configuration
//! characteristic. The opcode and byte order were found by packet logging.

use crate::domain::error::EncodeError;
use anyhow::Result;
use uuid::Uuid;

/// Cycling Power service (0x1818), used as the advertisement filter
pub const CYCLING_POWER_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x0000_1818_0000_1000_8000_0080_5f9b_34fb);

/// Vendor configuration characteristic holding the wheel circumference
pub const WHEEL_CONFIG_CHAR_UUID: Uuid = Uuid::from_u128(0xa026_e005_0a7d_4ab3_97fa_f150_0f9f_eb8b);

/// Advertised name fragment identifying a trainer
pub const DEVICE_NAME_TOKEN: &str = "KICKR";

/// "Set wheel circumference" opcode
pub const SET_CIRCUMFERENCE_OPCODE: u8 = 0x48;

/// Exclusive upper bound: the field is a u16 of tenths of a millimeter
pub const MAX_CIRCUMFERENCE_M: f64 = 6.5535;

const TENTHS_OF_MM_PER_M: f64 = 10_000.0;

/// Check that a circumference can be represented on the wire
pub fn validate_circumference(meters: f64) -> Result<(), EncodeError> {
    // Written so that NaN fails as well
    if (0.0..MAX_CIRCUMFERENCE_M).contains(&meters) {
        Ok(())
    } else {
        Err(EncodeError::OutOfRange { meters })
    }
}

/// Encode a circumference into the 3-byte command
///
/// # Payload Structure (3 bytes)
///
/// ```text
/// [0]   : Opcode 0x48 (set wheel circumference)
/// [1-2] : Circumference in tenths of a millimeter (u16 little-endian)
/// ```
pub fn encode_circumference(meters: f64) -> Result<[u8; 3], EncodeError> {
    validate_circumference(meters)?;

    let raw = (meters * TENTHS_OF_MM_PER_M).round() as u16;
    let [low, high] = raw.to_le_bytes();
    Ok([SET_CIRCUMFERENCE_OPCODE, low, high])
}

/// Decode a payload produced by [`encode_circumference`]
pub fn decode_circumference(payload: &[u8]) -> Option<f64> {
    match payload {
        [SET_CIRCUMFERENCE_OPCODE, low, high] => {
            Some(u16::from_le_bytes([*low, *high]) as f64 / TENTHS_OF_MM_PER_M)
        }
        _ => None,
    }
}

/// Parse a UUID string from settings
pub fn parse_uuid(uuid_str: &str) -> Result<Uuid> {
    Uuid::parse_str(uuid_str.trim())
        .map_err(|e| anyhow::anyhow!("Invalid UUID format '{}': {}", uuid_str, e))
}
