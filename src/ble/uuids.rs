//! Bluetooth SIG UUID helpers.
//!
//! Short (16/32-bit) assigned numbers expand into the Bluetooth base UUID
//! `0000xxxx-0000-1000-8000-00805f9b34fb`.

use uuid::Uuid;

use crate::error::{Error, Result};

/// The Bluetooth base UUID that short UUIDs are expanded into.
pub const BLUETOOTH_BASE_UUID: Uuid = Uuid::from_u128(0x0000_0000_0000_1000_8000_00805f9b34fb);

const BASE_MASK: u128 = 0x0000_0000_ffff_ffff_ffff_ffffffffffff;

// Standard services
/// Generic Access service UUID.
pub const GENERIC_ACCESS_SERVICE_UUID: Uuid = uuid_from_u16(0x1800);
/// Generic Attribute service UUID.
pub const GENERIC_ATTRIBUTE_SERVICE_UUID: Uuid = uuid_from_u16(0x1801);
/// Device Information service UUID.
pub const DEVICE_INFO_SERVICE_UUID: Uuid = uuid_from_u16(0x180a);
/// Battery service UUID.
pub const BATTERY_SERVICE_UUID: Uuid = uuid_from_u16(0x180f);

// Standard characteristics
/// Device Name characteristic UUID.
pub const DEVICE_NAME_UUID: Uuid = uuid_from_u16(0x2a00);
/// Battery Level characteristic UUID.
pub const BATTERY_LEVEL_UUID: Uuid = uuid_from_u16(0x2a19);
/// Manufacturer Name characteristic UUID.
pub const MANUFACTURER_NAME_UUID: Uuid = uuid_from_u16(0x2a29);
/// Firmware Revision characteristic UUID.
pub const FIRMWARE_REVISION_UUID: Uuid = uuid_from_u16(0x2a26);

/// Client Characteristic Configuration descriptor, written to enable
/// notifications and indications.
pub const CLIENT_CHARACTERISTIC_CONFIG_UUID: Uuid = uuid_from_u16(0x2902);

/// Expand a 16-bit assigned number into a full UUID.
pub const fn uuid_from_u16(short: u16) -> Uuid {
    uuid_from_u32(short as u32)
}

/// Expand a 32-bit assigned number into a full UUID.
pub const fn uuid_from_u32(short: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID.as_u128() | ((short as u128) << 96))
}

/// Return the 16-bit short form if `uuid` is based on the Bluetooth base UUID.
pub fn short_uuid(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    if value & BASE_MASK != BLUETOOTH_BASE_UUID.as_u128() {
        return None;
    }
    u16::try_from(value >> 96).ok()
}

/// Parse a UUID given either in full form or as a 4/8 hex digit short form.
///
/// ```
/// use easyble::ble::uuids::{parse_uuid, BATTERY_SERVICE_UUID};
///
/// assert_eq!(parse_uuid("180F").unwrap(), BATTERY_SERVICE_UUID);
/// assert_eq!(
///     parse_uuid("0000180f-0000-1000-8000-00805f9b34fb").unwrap(),
///     BATTERY_SERVICE_UUID
/// );
/// ```
pub fn parse_uuid(input: &str) -> Result<Uuid> {
    let trimmed = input.trim();
    let invalid = || Error::invalid_parameter("uuid", input);

    match trimmed.len() {
        4 => u16::from_str_radix(trimmed, 16)
            .map(uuid_from_u16)
            .map_err(|_| invalid()),
        8 => u32::from_str_radix(trimmed, 16)
            .map(uuid_from_u32)
            .map_err(|_| invalid()),
        _ => Uuid::parse_str(trimmed).map_err(|_| invalid()),
    }
}
