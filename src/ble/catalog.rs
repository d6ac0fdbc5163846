//! Discovered GATT services and characteristics.

use std::fmt;

use uuid::Uuid;

use crate::error::{Error, Result};

/// GATT characteristic property bits, as found in the characteristic
/// declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CharacteristicProperties(u8);

impl CharacteristicProperties {
    /// Broadcast.
    pub const BROADCAST: Self = Self(0x01);
    /// Read.
    pub const READ: Self = Self(0x02);
    /// Write without response.
    pub const WRITE_WITHOUT_RESPONSE: Self = Self(0x04);
    /// Write with response.
    pub const WRITE: Self = Self(0x08);
    /// Notify.
    pub const NOTIFY: Self = Self(0x10);
    /// Indicate.
    pub const INDICATE: Self = Self(0x20);
    /// Authenticated signed writes.
    pub const AUTHENTICATED_SIGNED_WRITES: Self = Self(0x40);
    /// Extended properties descriptor present.
    pub const EXTENDED_PROPERTIES: Self = Self(0x80);

    /// Create from the raw property byte.
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Get the raw property byte.
    pub const fn bits(&self) -> u8 {
        self.0
    }

    /// Check whether all bits of `other` are set.
    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Check whether the characteristic can be read.
    pub fn readable(&self) -> bool {
        self.contains(Self::READ)
    }

    /// Check whether the characteristic can be written, with or without response.
    pub fn writable(&self) -> bool {
        self.contains(Self::WRITE) || self.contains(Self::WRITE_WITHOUT_RESPONSE)
    }

    /// Check whether the characteristic supports notifications.
    pub fn notify(&self) -> bool {
        self.contains(Self::NOTIFY)
    }

    /// Check whether the characteristic supports indications.
    pub fn indicative(&self) -> bool {
        self.contains(Self::INDICATE)
    }
}

impl std::ops::BitOr for CharacteristicProperties {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for CharacteristicProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::BROADCAST, "broadcast"),
            (Self::READ, "read"),
            (Self::WRITE_WITHOUT_RESPONSE, "write-without-response"),
            (Self::WRITE, "write"),
            (Self::NOTIFY, "notify"),
            (Self::INDICATE, "indicate"),
            (Self::AUTHENTICATED_SIGNED_WRITES, "signed-write"),
            (Self::EXTENDED_PROPERTIES, "extended"),
        ];
        let set: Vec<_> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "{}", set.join("|"))
    }
}

/// Capability a caller can search the catalog for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Property {
    /// Readable characteristics.
    Readable,
    /// Writable characteristics (with or without response).
    Writable,
    /// Characteristics that can push values, by notification or indication.
    Notifiable,
    /// Characteristics that support indications.
    Indicative,
}

impl Property {
    /// Check whether `properties` satisfies this capability.
    pub fn matches(&self, properties: CharacteristicProperties) -> bool {
        match self {
            Self::Readable => properties.readable(),
            Self::Writable => properties.writable(),
            Self::Notifiable => properties.notify() || properties.indicative(),
            Self::Indicative => properties.indicative(),
        }
    }

    /// Name used in error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Readable => "read",
            Self::Writable => "write",
            Self::Notifiable => "notify",
            Self::Indicative => "indicate",
        }
    }
}

/// A discovered GATT service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ServiceInfo {
    /// Service UUID.
    pub uuid: Uuid,
    /// Whether this is a primary service.
    pub primary: bool,
}

/// A discovered GATT characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CharacteristicInfo {
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// Declared properties.
    pub properties: CharacteristicProperties,
    /// UUIDs of the characteristic's descriptors.
    pub descriptors: Vec<Uuid>,
}

impl CharacteristicInfo {
    /// Create a characteristic without descriptors.
    pub fn new(uuid: Uuid, properties: CharacteristicProperties) -> Self {
        Self {
            uuid,
            properties,
            descriptors: Vec::new(),
        }
    }

    /// Check whether the characteristic can be read.
    pub fn readable(&self) -> bool {
        self.properties.readable()
    }

    /// Check whether the characteristic can be written.
    pub fn writable(&self) -> bool {
        self.properties.writable()
    }

    /// Check whether the characteristic supports notifications.
    pub fn notify(&self) -> bool {
        self.properties.notify()
    }

    /// Check whether the characteristic supports indications.
    pub fn indicative(&self) -> bool {
        self.properties.indicative()
    }
}

/// A service together with its characteristics, as reported by discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DiscoveredService {
    /// The service.
    pub service: ServiceInfo,
    /// Its characteristics in discovery order.
    pub characteristics: Vec<CharacteristicInfo>,
}

/// The service/characteristic table of a connected device.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ServiceCatalog {
    services: Vec<DiscoveredService>,
}

impl ServiceCatalog {
    /// Build a catalog from discovery results, keeping discovery order.
    pub fn new(services: Vec<DiscoveredService>) -> Self {
        Self { services }
    }

    /// All services and their characteristics.
    pub fn services(&self) -> &[DiscoveredService] {
        &self.services
    }

    /// Number of services.
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Check whether no service was discovered.
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Look up a service.
    pub fn service(&self, uuid: &Uuid) -> Option<&DiscoveredService> {
        self.services.iter().find(|s| s.service.uuid == *uuid)
    }

    /// Characteristics of a service, empty if the service is unknown.
    pub fn characteristics(&self, service: &Uuid) -> &[CharacteristicInfo] {
        self.service(service)
            .map(|s| s.characteristics.as_slice())
            .unwrap_or_default()
    }

    /// Look up a characteristic within a service.
    pub fn characteristic(&self, service: &Uuid, characteristic: &Uuid) -> Option<&CharacteristicInfo> {
        self.characteristics(service)
            .iter()
            .find(|c| c.uuid == *characteristic)
    }

    /// Look up a characteristic in any service; returns the owning service UUID too.
    pub fn find_characteristic(&self, characteristic: &Uuid) -> Option<(Uuid, &CharacteristicInfo)> {
        self.services.iter().find_map(|s| {
            s.characteristics
                .iter()
                .find(|c| c.uuid == *characteristic)
                .map(|c| (s.service.uuid, c))
        })
    }

    /// Resolve a characteristic and check it supports `property`.
    ///
    /// # Errors
    ///
    /// [`Error::ServiceNotFound`], [`Error::CharacteristicNotFound`] or
    /// [`Error::PropertyNotSupported`].
    pub fn require(
        &self,
        service: &Uuid,
        characteristic: &Uuid,
        property: Property,
    ) -> Result<&CharacteristicInfo> {
        let entry = self.service(service).ok_or_else(|| Error::ServiceNotFound {
            uuid: service.to_string(),
        })?;

        let info = entry
            .characteristics
            .iter()
            .find(|c| c.uuid == *characteristic)
            .ok_or_else(|| Error::CharacteristicNotFound {
                uuid: characteristic.to_string(),
            })?;

        if !property.matches(info.properties) {
            return Err(Error::PropertyNotSupported {
                uuid: characteristic.to_string(),
                property: property.name(),
            });
        }

        Ok(info)
    }

    /// All `(service, characteristic)` pairs supporting `property`.
    pub fn with_property(&self, property: Property) -> Vec<(Uuid, Uuid)> {
        self.services
            .iter()
            .flat_map(|s| {
                s.characteristics
                    .iter()
                    .filter(move |c| property.matches(c.properties))
                    .map(move |c| (s.service.uuid, c.uuid))
            })
            .collect()
    }

    /// Readable characteristics.
    pub fn readable(&self) -> Vec<(Uuid, Uuid)> {
        self.with_property(Property::Readable)
    }

    /// Writable characteristics.
    pub fn writable(&self) -> Vec<(Uuid, Uuid)> {
        self.with_property(Property::Writable)
    }

    /// Characteristics supporting notifications or indications.
    pub fn notifiable(&self) -> Vec<(Uuid, Uuid)> {
        self.with_property(Property::Notifiable)
    }

    /// Characteristics supporting indications.
    pub fn indicative(&self) -> Vec<(Uuid, Uuid)> {
        self.with_property(Property::Indicative)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ble::uuids::{uuid_from_u16, BATTERY_LEVEL_UUID, BATTERY_SERVICE_UUID};
    use pretty_assertions::assert_eq;

    pub(crate) const UART_SERVICE: Uuid = Uuid::from_u128(0x6e40_0001_b5a3_f393_e0a9_e50e24dcca9e);
    pub(crate) const UART_RX: Uuid = Uuid::from_u128(0x6e40_0002_b5a3_f393_e0a9_e50e24dcca9e);
    pub(crate) const UART_TX: Uuid = Uuid::from_u128(0x6e40_0003_b5a3_f393_e0a9_e50e24dcca9e);

    /// Battery service plus a Nordic UART style service.
    pub(crate) fn sample_services() -> Vec<DiscoveredService> {
        vec![
            DiscoveredService {
                service: ServiceInfo {
                    uuid: BATTERY_SERVICE_UUID,
                    primary: true,
                },
                characteristics: vec![CharacteristicInfo::new(
                    BATTERY_LEVEL_UUID,
                    CharacteristicProperties::READ | CharacteristicProperties::NOTIFY,
                )],
            },
            DiscoveredService {
                service: ServiceInfo {
                    uuid: UART_SERVICE,
                    primary: true,
                },
                characteristics: vec![
                    CharacteristicInfo::new(
                        UART_RX,
                        CharacteristicProperties::WRITE
                            | CharacteristicProperties::WRITE_WITHOUT_RESPONSE,
                    ),
                    CharacteristicInfo {
                        uuid: UART_TX,
                        properties: CharacteristicProperties::INDICATE,
                        descriptors: vec![uuid_from_u16(0x2902)],
                    },
                ],
            },
        ]
    }

    #[test]
    fn test_properties() {
        let props = CharacteristicProperties::from_bits(0x1A);
        assert!(props.readable());
        assert!(props.writable());
        assert!(props.notify());
        assert!(!props.indicative());
        assert_eq!(props.to_string(), "read|write|notify");

        let wwr = CharacteristicProperties::WRITE_WITHOUT_RESPONSE;
        assert!(wwr.writable());
        assert!(!wwr.contains(CharacteristicProperties::WRITE));
    }

    #[test]
    fn test_queries() {
        let catalog = ServiceCatalog::new(sample_services());

        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.readable(), vec![(BATTERY_SERVICE_UUID, BATTERY_LEVEL_UUID)]);
        assert_eq!(catalog.writable(), vec![(UART_SERVICE, UART_RX)]);
        assert_eq!(
            catalog.notifiable(),
            vec![(BATTERY_SERVICE_UUID, BATTERY_LEVEL_UUID), (UART_SERVICE, UART_TX)]
        );
        assert_eq!(catalog.indicative(), vec![(UART_SERVICE, UART_TX)]);

        let (service, info) = catalog.find_characteristic(&UART_TX).unwrap();
        assert_eq!(service, UART_SERVICE);
        assert_eq!(info.descriptors.len(), 1);
        assert!(catalog.characteristics(&uuid_from_u16(0x1234)).is_empty());
    }

    #[test]
    fn test_require() {
        let catalog = ServiceCatalog::new(sample_services());

        assert!(catalog
            .require(&UART_SERVICE, &UART_RX, Property::Writable)
            .is_ok());
        assert!(matches!(
            catalog.require(&UART_SERVICE, &UART_RX, Property::Readable),
            Err(Error::PropertyNotSupported { property: "read", .. })
        ));
        assert!(matches!(
            catalog.require(&UART_SERVICE, &BATTERY_LEVEL_UUID, Property::Readable),
            Err(Error::CharacteristicNotFound { .. })
        ));
        assert!(matches!(
            catalog.require(&uuid_from_u16(0x1234), &UART_RX, Property::Writable),
            Err(Error::ServiceNotFound { .. })
        ));
    }
}
