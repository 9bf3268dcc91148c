use std::str::FromStr;

use uuid::Uuid;

use crate::{Error, Result};

const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;

// Const so apps can declare const Uuids for the assigned numbers they use

pub const fn uuid_from_u16(v: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((v as u128) << 96))
}
pub const fn uuid_from_u32(v: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((v as u128) << 96))
}

/// Parses a UUID as written in a server configuration.
///
/// Besides the full 128-bit form this accepts the 16-bit ("180d") and 32-bit
/// ("0000180d") short forms, optionally prefixed with "0x", which are expanded
/// against the Bluetooth base UUID.
pub fn parse_uuid(s: &str) -> Result<Uuid> {
    let trimmed = s.trim();
    let digits = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")).unwrap_or(trimmed);

    let short = match digits.len() {
        4 => u16::from_str_radix(digits, 16).ok().map(uuid_from_u16),
        8 => u32::from_str_radix(digits, 16).ok().map(uuid_from_u32),
        _ => None,
    };
    if let Some(uuid) = short {
        return Ok(uuid);
    }

    Uuid::from_str(trimmed).map_err(|_| Error::InvalidArgument(format!("Invalid UUID \"{}\"", s)))
}
