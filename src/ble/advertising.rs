//! Advertising data parsing.
//!
//! Backends that only hand out raw scan records (the payload of an
//! advertising or scan-response PDU) are decoded with [`Advertisement::parse`].
//! Backends that already decode advertisements (btleplug) fill the struct
//! directly.

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::ble::uuids::{uuid_from_u16, uuid_from_u32};
use crate::error::{Error, Result};

/// AD type: flags.
pub const AD_FLAGS: u8 = 0x01;
/// AD type: incomplete list of 16-bit service UUIDs.
pub const AD_INCOMPLETE_16_BIT_UUIDS: u8 = 0x02;
/// AD type: complete list of 16-bit service UUIDs.
pub const AD_COMPLETE_16_BIT_UUIDS: u8 = 0x03;
/// AD type: incomplete list of 32-bit service UUIDs.
pub const AD_INCOMPLETE_32_BIT_UUIDS: u8 = 0x04;
/// AD type: complete list of 32-bit service UUIDs.
pub const AD_COMPLETE_32_BIT_UUIDS: u8 = 0x05;
/// AD type: incomplete list of 128-bit service UUIDs.
pub const AD_INCOMPLETE_128_BIT_UUIDS: u8 = 0x06;
/// AD type: complete list of 128-bit service UUIDs.
pub const AD_COMPLETE_128_BIT_UUIDS: u8 = 0x07;
/// AD type: shortened local name.
pub const AD_SHORT_LOCAL_NAME: u8 = 0x08;
/// AD type: complete local name.
pub const AD_COMPLETE_LOCAL_NAME: u8 = 0x09;
/// AD type: TX power level.
pub const AD_TX_POWER_LEVEL: u8 = 0x0A;
/// AD type: service data with a 16-bit UUID.
pub const AD_SERVICE_DATA_16_BIT: u8 = 0x16;
/// AD type: service data with a 32-bit UUID.
pub const AD_SERVICE_DATA_32_BIT: u8 = 0x20;
/// AD type: service data with a 128-bit UUID.
pub const AD_SERVICE_DATA_128_BIT: u8 = 0x21;
/// AD type: manufacturer specific data.
pub const AD_MANUFACTURER_DATA: u8 = 0xFF;

/// Decoded advertising data of a device.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Advertisement {
    /// Advertised local name (complete name wins over the shortened one).
    pub local_name: Option<String>,
    /// Advertised TX power in dBm.
    pub tx_power: Option<i8>,
    /// Advertising flags (LE discoverability, BR/EDR support).
    pub flags: Option<u8>,
    /// Advertised service UUIDs, in the order they appeared.
    pub service_uuids: Vec<Uuid>,
    /// Manufacturer data keyed by company identifier.
    pub manufacturer_data: BTreeMap<u16, Vec<u8>>,
    /// Service data keyed by service UUID.
    pub service_data: BTreeMap<Uuid, Vec<u8>>,
}

impl Advertisement {
    /// Parse a raw scan record.
    ///
    /// Parsing stops at the first zero length byte, which is how controllers
    /// pad scan records.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidData`] when an AD structure runs past the end of
    /// `data` or a fixed-size field has the wrong length.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut adv = Self::default();
        let mut short_name = None;
        let mut offset = 0;

        while offset < data.len() {
            let len = data[offset] as usize;
            if len == 0 {
                break;
            }

            let end = offset + 1 + len;
            if end > data.len() {
                return Err(Error::InvalidData {
                    context: format!(
                        "AD structure at offset {} needs {} bytes, {} available",
                        offset,
                        len,
                        data.len() - offset - 1
                    ),
                });
            }

            let ad_type = data[offset + 1];
            let payload = &data[offset + 2..end];
            adv.apply(ad_type, payload, &mut short_name)?;

            offset = end;
        }

        if adv.local_name.is_none() {
            adv.local_name = short_name;
        }

        Ok(adv)
    }

    fn apply(&mut self, ad_type: u8, payload: &[u8], short_name: &mut Option<String>) -> Result<()> {
        match ad_type {
            AD_FLAGS => self.flags = payload.first().copied(),
            AD_INCOMPLETE_16_BIT_UUIDS | AD_COMPLETE_16_BIT_UUIDS => {
                let uuids = chunks(payload, 2, ad_type)?
                    .map(|c| uuid_from_u16(u16::from_le_bytes([c[0], c[1]])));
                self.push_services(uuids);
            }
            AD_INCOMPLETE_32_BIT_UUIDS | AD_COMPLETE_32_BIT_UUIDS => {
                let uuids = chunks(payload, 4, ad_type)?
                    .map(|c| uuid_from_u32(u32::from_le_bytes([c[0], c[1], c[2], c[3]])));
                self.push_services(uuids);
            }
            AD_INCOMPLETE_128_BIT_UUIDS | AD_COMPLETE_128_BIT_UUIDS => {
                let uuids = chunks(payload, 16, ad_type)?.map(uuid_from_le_slice);
                self.push_services(uuids);
            }
            AD_SHORT_LOCAL_NAME => {
                *short_name = Some(String::from_utf8_lossy(payload).into_owned());
            }
            AD_COMPLETE_LOCAL_NAME => {
                self.local_name = Some(String::from_utf8_lossy(payload).into_owned());
            }
            AD_TX_POWER_LEVEL => self.tx_power = payload.first().map(|&b| b as i8),
            AD_SERVICE_DATA_16_BIT => {
                let (uuid, rest) = split_uuid(payload, 2, ad_type)?;
                self.service_data
                    .insert(uuid_from_u16(u16::from_le_bytes([uuid[0], uuid[1]])), rest.to_vec());
            }
            AD_SERVICE_DATA_32_BIT => {
                let (uuid, rest) = split_uuid(payload, 4, ad_type)?;
                let short = u32::from_le_bytes([uuid[0], uuid[1], uuid[2], uuid[3]]);
                self.service_data.insert(uuid_from_u32(short), rest.to_vec());
            }
            AD_SERVICE_DATA_128_BIT => {
                let (uuid, rest) = split_uuid(payload, 16, ad_type)?;
                self.service_data.insert(uuid_from_le_slice(uuid), rest.to_vec());
            }
            AD_MANUFACTURER_DATA => {
                let (company, rest) = split_uuid(payload, 2, ad_type)?;
                self.manufacturer_data
                    .insert(u16::from_le_bytes([company[0], company[1]]), rest.to_vec());
            }
            _ => {}
        }
        Ok(())
    }

    fn push_services(&mut self, uuids: impl Iterator<Item = Uuid>) {
        for uuid in uuids {
            if !self.service_uuids.contains(&uuid) {
                self.service_uuids.push(uuid);
            }
        }
    }

    /// Check whether any of `services` is advertised.
    pub fn advertises_any(&self, services: &[Uuid]) -> bool {
        services.iter().any(|s| self.service_uuids.contains(s))
    }
}

fn chunks(payload: &[u8], size: usize, ad_type: u8) -> Result<std::slice::ChunksExact<'_, u8>> {
    if payload.len() % size != 0 {
        return Err(Error::InvalidData {
            context: format!(
                "AD type {:#04x}: {} bytes is not a multiple of {}",
                ad_type,
                payload.len(),
                size
            ),
        });
    }
    Ok(payload.chunks_exact(size))
}

fn split_uuid(payload: &[u8], size: usize, ad_type: u8) -> Result<(&[u8], &[u8])> {
    if payload.len() < size {
        return Err(Error::InvalidData {
            context: format!("AD type {:#04x}: payload shorter than {} bytes", ad_type, size),
        });
    }
    Ok(payload.split_at(size))
}

/// UUIDs travel little-endian over the air.
fn uuid_from_le_slice(bytes: &[u8]) -> Uuid {
    let mut be = [0u8; 16];
    for (dst, src) in be.iter_mut().zip(bytes.iter().rev()) {
        *dst = *src;
    }
    Uuid::from_bytes(be)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::uuids::{BATTERY_SERVICE_UUID, DEVICE_INFO_SERVICE_UUID};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn test_parse_typical_record() {
        let record = [
            0x02, 0x01, 0x06, // flags
            0x05, 0x03, 0x0F, 0x18, 0x0A, 0x18, // 16-bit uuids
            0x06, 0x09, b'E', b'S', b'P', b'3', b'2', // complete name
            0x02, 0x0A, 0xF4, // tx power -12
            0x05, 0xFF, 0xE5, 0x02, 0x01, 0x02, // manufacturer 0x02E5
            0x00, 0x00, 0x00, // padding
        ];

        let adv = Advertisement::parse(&record).unwrap();

        assert_eq!(adv.flags, Some(0x06));
        assert_eq!(
            adv.service_uuids,
            vec![BATTERY_SERVICE_UUID, DEVICE_INFO_SERVICE_UUID]
        );
        assert_eq!(adv.local_name.as_deref(), Some("ESP32"));
        assert_eq!(adv.tx_power, Some(-12));
        assert_eq!(adv.manufacturer_data.get(&0x02E5), Some(&vec![0x01, 0x02]));
        assert!(adv.advertises_any(&[DEVICE_INFO_SERVICE_UUID]));
    }

    #[test]
    fn test_short_name_fallback() {
        let record = [0x03, 0x08, b'H', b'i'];
        let adv = Advertisement::parse(&record).unwrap();
        assert_eq!(adv.local_name.as_deref(), Some("Hi"));

        let record = [0x03, 0x08, b'H', b'i', 0x04, 0x09, b'H', b'e', b'y'];
        let adv = Advertisement::parse(&record).unwrap();
        assert_eq!(adv.local_name.as_deref(), Some("Hey"));
    }

    #[test]
    fn test_parse_128_bit_uuid_and_service_data() {
        // Nordic UART service, little-endian on air
        let nus = Uuid::parse_str("6e400001-b5a3-f393-e0a9-e50e24dcca9e").unwrap();
        let mut record = vec![0x11, AD_COMPLETE_128_BIT_UUIDS];
        record.extend(nus.as_bytes().iter().rev());
        record.extend([0x04, AD_SERVICE_DATA_16_BIT, 0x0F, 0x18, 0x64]);

        let adv = Advertisement::parse(&record).unwrap();
        assert_eq!(adv.service_uuids, vec![nus]);
        assert_eq!(adv.service_data.get(&BATTERY_SERVICE_UUID), Some(&vec![0x64]));
    }

    #[test]
    fn test_truncated_record() {
        let record = [0x05, 0x09, b'a', b'b'];
        assert!(matches!(
            Advertisement::parse(&record),
            Err(Error::InvalidData { .. })
        ));
    }

    #[test]
    fn test_odd_uuid_list() {
        let record = [0x04, AD_COMPLETE_16_BIT_UUIDS, 0x0F, 0x18, 0x0A];
        assert!(Advertisement::parse(&record).is_err());
    }

    #[test]
    fn test_empty_record() {
        assert_eq!(Advertisement::parse(&[]).unwrap(), Advertisement::default());
    }

    proptest! {
        #[test]
        fn parse_never_panics(data in proptest::collection::vec(any::<u8>(), 0..62)) {
            let _ = Advertisement::parse(&data);
        }
    }
}
