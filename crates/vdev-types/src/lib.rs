// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fundamental types shared by the vdev crates.
//!
//! This crate defines the small value types that the device library, the TOML
//! configuration crate and the CLI all need to agree on: controller classes,
//! SCSI controller flavors and sharing modes, and the `class:bus:unit` device
//! address used to relocate a device before the hypervisor has assigned it a
//! key.

use std::fmt::Display;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use strum::{EnumString, IntoStaticStr};
use thiserror::Error;

/// The class of controller a device is addressed through.
///
/// All SCSI controller flavors share the `scsi` class for addressing
/// purposes.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    EnumString,
    IntoStaticStr,
    Serialize,
    Deserialize,
    JsonSchema,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ControllerClass {
    Ide,
    Sata,
    Scsi,
    Pci,
}

impl ControllerClass {
    pub const ALL: [ControllerClass; 4] = [
        ControllerClass::Ide,
        ControllerClass::Sata,
        ControllerClass::Scsi,
        ControllerClass::Pci,
    ];

    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

impl Display for ControllerClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The flavor of a SCSI controller.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    EnumString,
    IntoStaticStr,
    Serialize,
    Deserialize,
    JsonSchema,
)]
pub enum ScsiControllerType {
    /// VMware paravirtual SCSI.
    #[strum(serialize = "pvscsi")]
    #[serde(rename = "pvscsi")]
    ParaVirtual,

    /// LSI Logic parallel.
    #[strum(serialize = "lsilogic")]
    #[serde(rename = "lsilogic")]
    LsiLogic,

    /// LSI Logic SAS.
    #[strum(serialize = "lsilogic-sas")]
    #[serde(rename = "lsilogic-sas")]
    LsiLogicSas,

    /// BusLogic parallel.
    #[strum(serialize = "buslogic")]
    #[serde(rename = "buslogic")]
    BusLogic,
}

impl ScsiControllerType {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

impl Display for ScsiControllerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The bus sharing mode of a SCSI controller.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    EnumString,
    IntoStaticStr,
    Serialize,
    Deserialize,
    JsonSchema,
)]
#[strum(serialize_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub enum ScsiSharing {
    #[default]
    NoSharing,
    PhysicalSharing,
    VirtualSharing,
}

impl ScsiSharing {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

impl Display for ScsiSharing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced while decoding a [`DeviceAddress`].
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DeviceAddressError {
    #[error("invalid device address {0:?}")]
    Malformed(String),

    #[error("invalid controller type {0:?} found in device address")]
    InvalidClass(String),

    #[error("invalid bus number {0:?} found in device address")]
    InvalidBus(String),

    #[error("invalid unit number {0:?} found in device address")]
    InvalidUnit(String),
}

/// A controller class/bus/unit triple. Supports conversion from a string
/// formatted as "class:bus:unit", e.g. "scsi:0:1".
///
/// Device keys are only stable once the hypervisor has created a device, so
/// this address is what lets the same logical device be found again across
/// plan and apply before a key exists.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, JsonSchema,
)]
pub struct DeviceAddress {
    class: ControllerClass,
    bus: u32,
    unit: u32,
}

impl DeviceAddress {
    pub fn new(class: ControllerClass, bus: u32, unit: u32) -> Self {
        Self { class, bus, unit }
    }

    #[inline]
    pub fn class(&self) -> ControllerClass {
        self.class
    }

    #[inline]
    pub fn bus(&self) -> u32 {
        self.bus
    }

    #[inline]
    pub fn unit(&self) -> u32 {
        self.unit
    }
}

impl FromStr for DeviceAddress {
    type Err = DeviceAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split(':').collect();
        if fields.len() < 3 {
            return Err(DeviceAddressError::Malformed(s.to_owned()));
        }

        let (class, bus, unit) = (fields[0], fields[1], fields[2]);
        let class = ControllerClass::from_str(class)
            .map_err(|_| DeviceAddressError::InvalidClass(class.to_owned()))?;
        let bus = u32::from_str(bus)
            .map_err(|_| DeviceAddressError::InvalidBus(bus.to_owned()))?;
        let unit = u32::from_str(unit)
            .map_err(|_| DeviceAddressError::InvalidUnit(unit.to_owned()))?;

        Ok(Self { class, bus, unit })
    }
}

impl Display for DeviceAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.class, self.bus, self.unit)
    }
}

impl Serialize for DeviceAddress {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(format!("{}", self).as_str())
    }
}

impl<'d> Deserialize<'d> for DeviceAddress {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'d>,
    {
        let s = String::deserialize(deserializer)?;
        FromStr::from_str(&s).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_test::{assert_tokens, Token};

    const TEST_CASES: &[(&str, Result<DeviceAddress, ()>)] = &[
        (
            "scsi:0:1",
            Ok(DeviceAddress { class: ControllerClass::Scsi, bus: 0, unit: 1 }),
        ),
        (
            "ide:1:0",
            Ok(DeviceAddress { class: ControllerClass::Ide, bus: 1, unit: 0 }),
        ),
        (
            "sata:3:29",
            Ok(DeviceAddress {
                class: ControllerClass::Sata,
                bus: 3,
                unit: 29,
            }),
        ),
        (
            "pci:0:7",
            Ok(DeviceAddress { class: ControllerClass::Pci, bus: 0, unit: 7 }),
        ),
        ("scsi:x:1", Err(())),
        ("scsi:0:y", Err(())),
        ("bogus:0:1", Err(())),
        ("pvscsi:0:1", Err(())),
        ("scsi:-1:0", Err(())),
        ("scsi:0", Err(())),
        ("", Err(())),
        ("scsi.0.1", Err(())),
    ];

    #[test]
    fn device_address_from_str() {
        for (input, expected) in TEST_CASES {
            match DeviceAddress::from_str(input) {
                Ok(addr) => assert_eq!(addr, expected.unwrap()),
                Err(_) => assert!(
                    expected.is_err(),
                    "Expected error parsing device address {}",
                    input
                ),
            }
        }
    }

    #[test]
    fn device_address_error_kinds() {
        assert_eq!(
            DeviceAddress::from_str("scsi:x:1"),
            Err(DeviceAddressError::InvalidBus("x".to_owned()))
        );
        assert_eq!(
            DeviceAddress::from_str("bogus:0:1"),
            Err(DeviceAddressError::InvalidClass("bogus".to_owned()))
        );
        assert_eq!(
            DeviceAddress::from_str("scsi:0:z"),
            Err(DeviceAddressError::InvalidUnit("z".to_owned()))
        );
        assert_eq!(
            DeviceAddress::from_str("scsi:0"),
            Err(DeviceAddressError::Malformed("scsi:0".to_owned()))
        );
    }

    #[test]
    fn every_class_addresses_round_trip() {
        let names: Vec<_> =
            ControllerClass::ALL.iter().map(ControllerClass::as_str).collect();
        assert_eq!(names, ["ide", "sata", "scsi", "pci"]);

        for class in ControllerClass::ALL {
            assert_eq!(ControllerClass::from_str(class.as_str()), Ok(class));
            let addr = DeviceAddress::new(class, 1, 5);
            let s = addr.to_string();
            assert_eq!(s, format!("{class}:1:5"));
            assert_eq!(DeviceAddress::from_str(&s), Ok(addr));
        }
    }

    #[test]
    fn device_address_ignores_trailing_fields() {
        let addr = DeviceAddress::from_str("sata:0:2:extra").unwrap();
        assert_eq!(addr, DeviceAddress::new(ControllerClass::Sata, 0, 2));
    }

    #[test]
    fn device_address_serialization() {
        for (input, expected) in TEST_CASES {
            match expected {
                Ok(addr) => {
                    assert_tokens(addr, &[Token::Str(input)]);
                }
                Err(_) => {
                    let tokens = [Token::Str(input)];
                    let mut de = serde_test::Deserializer::new(&tokens);
                    assert!(DeviceAddress::deserialize(&mut de).is_err());
                }
            }
        }
    }

    #[test]
    fn scsi_type_names() {
        for (name, ty) in [
            ("pvscsi", ScsiControllerType::ParaVirtual),
            ("lsilogic", ScsiControllerType::LsiLogic),
            ("lsilogic-sas", ScsiControllerType::LsiLogicSas),
            ("buslogic", ScsiControllerType::BusLogic),
        ] {
            assert_eq!(ScsiControllerType::from_str(name).unwrap(), ty);
            assert_eq!(ty.to_string(), name);
            assert_eq!(
                serde_json::to_string(&ty).unwrap(),
                format!("\"{name}\"")
            );
        }
        assert!(ScsiControllerType::from_str("megaraid").is_err());
    }

    #[test]
    fn scsi_sharing_names() {
        assert_eq!(
            ScsiSharing::from_str("physicalSharing").unwrap(),
            ScsiSharing::PhysicalSharing
        );
        assert_eq!(ScsiSharing::NoSharing.to_string(), "noSharing");
        assert_eq!(
            serde_json::to_string(&ScsiSharing::VirtualSharing).unwrap(),
            "\"virtualSharing\""
        );
        assert!(ScsiSharing::from_str("sometimes").is_err());
    }
}
