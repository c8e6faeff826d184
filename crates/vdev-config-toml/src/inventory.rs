// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Functions for converting a [`super::Config`] into a device list, bus
//! target and subresource states.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::str::FromStr;

use thiserror::Error;
use vdev::bus::{BusError, BusTarget};
use vdev::context::{FieldMap, ResourceData};
use vdev::device::{
    ControllerKind, DeviceKey, DeviceKind, Disk, NetworkAdapter,
    ScsiController, VirtualDevice, VirtualDeviceList,
};
use vdev::subresource::{SubresourceType, DEVICE_ADDRESS_FIELD, KEY_FIELD};
use vdev_types::{ScsiControllerType, ScsiSharing};

const DEFAULT_ADAPTER_TYPE: &str = "vmxnet3";

#[derive(Debug, Error)]
pub enum TomlToInventoryError {
    #[error("unrecognized controller type {kind:?} for controller {key}")]
    UnrecognizedControllerType { kind: String, key: DeviceKey },

    #[error("invalid sharing mode {sharing:?} for controller {key}")]
    InvalidSharing { sharing: String, key: DeviceKey },

    #[error("controller {0} is not a SCSI controller but has a sharing mode")]
    SharingOnNonScsi(DeviceKey),

    #[error("duplicate device key {0}")]
    DuplicateKey(DeviceKey),

    #[error("device {device} is attached to unknown controller {controller}")]
    UnknownController { device: DeviceKey, controller: DeviceKey },

    #[error("invalid value for option {option:?} of device {device}")]
    InvalidOption { device: DeviceKey, option: &'static str },

    #[error("unrecognized subresource type {0:?}")]
    UnrecognizedSubresourceType(String),

    #[error("failed to convert value of {0:?}")]
    ValueConversion(String, #[source] serde_json::Error),

    #[error("invalid bus layout")]
    Bus(#[from] BusError),
}

/// The configured state of one subresource, ready to be wrapped in a
/// [`vdev::Subresource`].
#[derive(Clone, Debug, PartialEq)]
pub struct SubresourceState {
    pub srtype: SubresourceType,

    /// Position among the subresources of the same type.
    pub index: usize,
    pub data: FieldMap,
    pub olddata: Option<FieldMap>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Inventory {
    pub devices: VirtualDeviceList,
    pub bus: BusTarget,
    pub subresources: Vec<SubresourceState>,
}

impl TryFrom<&super::Config> for Inventory {
    type Error = TomlToInventoryError;

    fn try_from(config: &super::Config) -> Result<Self, Self::Error> {
        let bus_fields = to_field_map(&config.bus.options)?;
        let bus_data = ResourceData::new("bus", FieldMap::new(), bus_fields);
        let bus = BusTarget::from_fields(&bus_data)?;

        let mut keys = BTreeSet::new();
        let mut devices = Vec::new();
        for ctlr in config.controllers.iter() {
            if !keys.insert(ctlr.key) {
                return Err(TomlToInventoryError::DuplicateKey(ctlr.key));
            }
            devices.push(VirtualDevice::controller(
                ctlr.key,
                ctlr.bus,
                controller_kind(ctlr)?,
            ));
        }

        for dev in config.devices.iter() {
            if !keys.insert(dev.key) {
                return Err(TomlToInventoryError::DuplicateKey(dev.key));
            }
            if let Some(ctlr) = dev.controller {
                if !config.controllers.iter().any(|c| c.key == ctlr) {
                    return Err(TomlToInventoryError::UnknownController {
                        device: dev.key,
                        controller: ctlr,
                    });
                }
            }
            devices.push(VirtualDevice {
                key: dev.key,
                controller_key: dev.controller,
                unit_number: dev.unit,
                kind: device_kind(dev)?,
            });
        }

        let mut counts: HashMap<SubresourceType, usize> = HashMap::new();
        let mut subresources = Vec::new();
        for sr in config.subresources.iter() {
            let srtype = SubresourceType::from_str(&sr.srtype).map_err(|_| {
                TomlToInventoryError::UnrecognizedSubresourceType(
                    sr.srtype.clone(),
                )
            })?;
            let index = counts.entry(srtype).or_default();

            let mut data = to_field_map(&sr.options)?;
            if let Some(key) = sr.key {
                data.insert(KEY_FIELD.to_owned(), key.into());
            }
            if let Some(addr) = &sr.device_address {
                data.insert(
                    DEVICE_ADDRESS_FIELD.to_owned(),
                    addr.clone().into(),
                );
            }
            let olddata = sr.old.as_ref().map(to_field_map).transpose()?;

            subresources.push(SubresourceState {
                srtype,
                index: *index,
                data,
                olddata,
            });
            *index += 1;
        }

        Ok(Inventory {
            devices: VirtualDeviceList::new(devices),
            bus,
            subresources,
        })
    }
}

fn controller_kind(
    ctlr: &super::Controller,
) -> Result<ControllerKind, TomlToInventoryError> {
    let kind = match ctlr.ctype.as_str() {
        "ide" => ControllerKind::Ide,
        "ahci" | "sata" => ControllerKind::Sata,
        "pci" => ControllerKind::Pci,
        "nvme" => ControllerKind::Nvme,
        "usb" => ControllerKind::Usb,
        "ps2" => ControllerKind::Ps2,
        "sio" => ControllerKind::Sio,
        other => {
            let subtype = ScsiControllerType::from_str(other).map_err(|_| {
                TomlToInventoryError::UnrecognizedControllerType {
                    kind: other.to_owned(),
                    key: ctlr.key,
                }
            })?;
            let sharing = match &ctlr.sharing {
                None => ScsiSharing::default(),
                Some(s) => ScsiSharing::from_str(s).map_err(|_| {
                    TomlToInventoryError::InvalidSharing {
                        sharing: s.clone(),
                        key: ctlr.key,
                    }
                })?,
            };
            return Ok(ControllerKind::Scsi(ScsiController {
                subtype,
                sharing,
            }));
        }
    };

    if ctlr.sharing.is_some() {
        return Err(TomlToInventoryError::SharingOnNonScsi(ctlr.key));
    }
    Ok(kind)
}

fn device_kind(
    dev: &super::Device,
) -> Result<DeviceKind, TomlToInventoryError> {
    let invalid = |option| TomlToInventoryError::InvalidOption {
        device: dev.key,
        option,
    };

    let kind = match dev.dtype.as_str() {
        "disk" => {
            let capacity_kb = match dev.options.get("capacity_kb") {
                None => 0,
                Some(v) => v
                    .as_integer()
                    .and_then(|n| u64::try_from(n).ok())
                    .ok_or_else(|| invalid("capacity_kb"))?,
            };
            let file_name = optional_string(dev, "file_name")?;
            let has_parent = match dev.options.get("has_parent") {
                None => false,
                Some(v) => v.as_bool().ok_or_else(|| invalid("has_parent"))?,
            };
            DeviceKind::Disk(Disk { capacity_kb, file_name, has_parent })
        }
        "ethernet" => DeviceKind::NetworkAdapter(NetworkAdapter {
            adapter_type: optional_string(dev, "adapter_type")?
                .unwrap_or_else(|| DEFAULT_ADAPTER_TYPE.to_owned()),
            mac_address: optional_string(dev, "mac_address")?,
        }),
        "cdrom" => DeviceKind::Cdrom,
        other => DeviceKind::Other(other.to_owned()),
    };
    Ok(kind)
}

fn optional_string(
    dev: &super::Device,
    option: &'static str,
) -> Result<Option<String>, TomlToInventoryError> {
    if !dev.options.contains_key(option) {
        return Ok(None);
    }
    dev.get_string(option)
        .map(|s| Some(s.to_owned()))
        .ok_or(TomlToInventoryError::InvalidOption { device: dev.key, option })
}

fn to_field_map(
    options: &BTreeMap<String, toml::Value>,
) -> Result<FieldMap, TomlToInventoryError> {
    options
        .iter()
        .map(|(k, v)| {
            serde_json::to_value(v).map(|v| (k.clone(), v)).map_err(|e| {
                TomlToInventoryError::ValueConversion(k.clone(), e)
            })
        })
        .collect()
}
