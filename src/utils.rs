//! Utility functions for the easyble crate.

/// Normalize a device address for comparison and map keys.
///
/// Surrounding whitespace is trimmed and the address is upper-cased, so
/// `"aa:bb:cc:dd:ee:ff "` and `"AA:BB:CC:DD:EE:FF"` refer to the same device.
/// Platform identifiers that are not MAC addresses (e.g. CoreBluetooth UUIDs)
/// go through the same transformation.
///
/// # Example
///
/// ```
/// use easyble::normalize_address;
///
/// assert_eq!(normalize_address(" c4:7f:51:00:1a:2b"), "C4:7F:51:00:1A:2B");
/// ```
pub fn normalize_address(address: &str) -> String {
    address.trim().to_ascii_uppercase()
}

/// Format bytes as space separated upper-case hex, e.g. `"0A FF 10"`.
pub fn to_hex_string(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
