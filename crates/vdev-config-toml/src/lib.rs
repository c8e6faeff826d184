// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeMap;
use std::path::Path;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

pub mod inventory;

/// A virtual machine's device inventory and declared bus layout.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub bus: Bus,

    #[serde(default, rename = "controller")]
    pub controllers: Vec<Controller>,

    #[serde(default, rename = "device")]
    pub devices: Vec<Device>,

    #[serde(default, rename = "subresource")]
    pub subresources: Vec<Subresource>,
}

/// The declared controller layout. Keys are the machine's bus fields
/// (`scsi_controller_count`, `scsi_type`, ...); absent keys take their
/// defaults.
#[derive(Default, Serialize, Deserialize, Debug, PartialEq)]
pub struct Bus {
    #[serde(flatten, default)]
    pub options: BTreeMap<String, toml::Value>,
}

/// A storage or system controller present on the machine.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Controller {
    pub key: i32,

    /// The controller kind: `ide`, `ahci`, `pci`, a SCSI flavor such as
    /// `pvscsi`, or one of the system controllers.
    #[serde(rename = "type")]
    pub ctype: String,

    #[serde(default)]
    pub bus: u32,

    /// SCSI bus sharing mode; only meaningful for SCSI controllers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sharing: Option<String>,
}

/// A device attached to one of the machine's controllers.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Device {
    pub key: i32,

    #[serde(rename = "type")]
    pub dtype: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<u32>,

    #[serde(flatten, default)]
    pub options: BTreeMap<String, toml::Value>,
}

impl Device {
    pub fn get_string<S: AsRef<str>>(&self, key: S) -> Option<&str> {
        self.options.get(key.as_ref())?.as_str()
    }
}

/// The configured state of one disk, network interface or CD-ROM.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Subresource {
    #[serde(rename = "type")]
    pub srtype: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_address: Option<String>,

    /// The previously applied state, if there is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<BTreeMap<String, toml::Value>>,

    #[serde(flatten, default)]
    pub options: BTreeMap<String, toml::Value>,
}

/// Errors which may be returned when parsing an inventory file.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parses a TOML file into a configuration object.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let cfg = toml::from_str::<Config>(&contents)?;
    Ok(cfg)
}

#[cfg(test)]
pub(crate) const SAMPLE: &str = r#"
[bus]
scsi_controller_count = 2
scsi_type = "pvscsi"
scsi_bus_sharing = "noSharing"

[[controller]]
key = 100
type = "pci"

[[controller]]
key = 200
type = "ide"

[[controller]]
key = 1000
type = "lsilogic"
bus = 0
sharing = "noSharing"

[[device]]
key = 2000
type = "disk"
controller = 1000
unit = 0
capacity_kb = 33554432
file_name = "[datastore1] vm/vm.vmdk"

[[device]]
key = 4000
type = "ethernet"
controller = 100
unit = 7
adapter_type = "e1000"

[[device]]
key = 3000
type = "cdrom"
controller = 200
unit = 0

[[subresource]]
type = "disk"
key = 2000
device_address = "scsi:0:0"
label = "disk0"
size = 32

[subresource.old]
key = 2000
device_address = "scsi:0:0"
label = "disk0"
size = 16

[[subresource]]
type = "network_interface"
device_address = "pci:0:7"
network_id = "network-1"
"#;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn config_can_be_serialized_as_toml() {
        let dummy_config = Config { ..Default::default() };
        let serialized = toml::ser::to_string(&dummy_config).unwrap();
        let deserialized: Config = toml::de::from_str(&serialized).unwrap();
        assert_eq!(dummy_config, deserialized);
    }

    #[test]
    fn parse_sample_config() {
        let cfg: Config = toml::de::from_str(SAMPLE).unwrap();

        use toml::Value;

        assert_eq!(
            cfg.bus.options.get("scsi_type").and_then(Value::as_str),
            Some("pvscsi")
        );
        assert_eq!(cfg.controllers.len(), 3);
        assert_eq!(
            cfg.controllers[2],
            Controller {
                key: 1000,
                ctype: "lsilogic".to_owned(),
                bus: 0,
                sharing: Some("noSharing".to_owned()),
            }
        );
        // Bus defaults to 0 when omitted.
        assert_eq!(cfg.controllers[0].bus, 0);

        let disk = &cfg.devices[0];
        assert_eq!(disk.dtype, "disk");
        assert_eq!(disk.controller, Some(1000));
        assert_eq!(disk.unit, Some(0));
        assert_eq!(
            disk.get_string("file_name"),
            Some("[datastore1] vm/vm.vmdk")
        );
        assert_eq!(
            disk.options.get("capacity_kb").and_then(Value::as_integer),
            Some(33554432)
        );
        assert_eq!(cfg.devices[1].get_string("adapter_type"), Some("e1000"));

        let sr = &cfg.subresources[0];
        assert_eq!(sr.srtype, "disk");
        assert_eq!(sr.key, Some(2000));
        assert_eq!(sr.device_address.as_deref(), Some("scsi:0:0"));
        assert_eq!(
            sr.options.get("label").and_then(Value::as_str),
            Some("disk0")
        );
        assert!(!sr.options.contains_key("old"));
        let old = sr.old.as_ref().unwrap();
        assert_eq!(old.get("size").and_then(Value::as_integer), Some(16));

        let nic = &cfg.subresources[1];
        assert_eq!(nic.key, None);
        assert!(nic.old.is_none());
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = parse("/nonexistent/vdev-inventory.toml").unwrap_err();
        assert!(matches!(err, ParseError::Io(_)));
    }
}
