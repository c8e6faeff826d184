// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Virtual devices managed as pseudo-resources.
//!
//! A [`Subresource`] mirrors the configuration of a single disk, network
//! interface or CD-ROM attached to a virtual machine. It lives for one
//! plan/apply/read cycle: it is built from the current and previous field
//! values of one element of the machine's device collection, used to locate
//! (or create) the live device, and then dropped.
//!
//! Each subresource tracks two identities for its device. The `key` is the
//! hypervisor's identity and is authoritative once the device exists. The
//! `device_address` ("class:bus:unit") lets the same logical device be found
//! before a key is known, or after the hypervisor has renumbered keys.

use std::fmt::Display;
use std::str::FromStr;

use serde_json::Value;
use slog::{o, Logger};
use strum::{EnumString, IntoStaticStr};
use thiserror::Error;
use vdev_types::{ControllerClass, DeviceAddress, DeviceAddressError};

use crate::context::{FieldMap, RestartFlag};
use crate::device::{DeviceKey, VirtualDevice, VirtualDeviceList};

pub mod schema;

use schema::{normalize_value, Schema};

pub const KEY_FIELD: &str = "key";
pub const DEVICE_ADDRESS_FIELD: &str = "device_address";

/// The kinds of device that are managed as subresources.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, EnumString, IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum SubresourceType {
    Disk,
    NetworkInterface,
    Cdrom,
}

impl SubresourceType {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }

    pub fn schema(&self) -> &'static Schema {
        match self {
            SubresourceType::Disk => &schema::DISK_SCHEMA,
            SubresourceType::NetworkInterface => {
                &schema::NETWORK_INTERFACE_SCHEMA
            }
            SubresourceType::Cdrom => &schema::CDROM_SCHEMA,
        }
    }
}

impl Display for SubresourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while resolving or updating a subresource.
#[derive(Debug, Error)]
pub enum SubresourceError {
    #[error("could not find device with key {0}")]
    DeviceNotFound(DeviceKey),

    #[error("invalid device key {0}")]
    InvalidKey(Value),

    #[error(transparent)]
    InvalidDeviceAddress(#[from] DeviceAddressError),

    #[error(
        "invalid controller result - {count} results returned (expected 1): \
         type {class}, bus number: {bus}"
    )]
    ControllerLookup { count: usize, class: ControllerClass, bus: u32 },

    #[error(
        "invalid device result - {count} results returned (expected 1): \
         controller key {controller_key}, unit number: {unit}"
    )]
    DeviceLookup { count: usize, controller_key: DeviceKey, unit: u32 },

    #[error("device {0} is not an IDE, SATA, SCSI or PCI controller")]
    UnclassifiableController(String),

    #[error("device {0} has no unit number")]
    NoUnitNumber(String),

    #[error("cannot change the value of {key:?} - (old: {old} new: {new})")]
    ImmutableField { key: String, old: String, new: String },

    #[error("could not find an available {class} controller on bus {bus}")]
    NoControllerAvailable { class: ControllerClass, bus: u32 },

    #[error("there are no available slots on the primary {0} controller")]
    PrimaryControllerFull(ControllerClass),
}

/// One virtual device's configuration, tracked as a pseudo-resource.
pub struct Subresource<'a> {
    log: Logger,
    srtype: SubresourceType,
    index: usize,
    data: FieldMap,
    olddata: Option<FieldMap>,
    restart: &'a dyn RestartFlag,
}

impl<'a> Subresource<'a> {
    /// Builds the subresource at position `index` of its collection.
    /// `olddata` is `None` when there is no prior state for this element.
    ///
    /// Both maps are normalized the same way [`Subresource::set`] normalizes
    /// a single value.
    pub fn new(
        log: &Logger,
        srtype: SubresourceType,
        restart: &'a dyn RestartFlag,
        data: FieldMap,
        olddata: Option<FieldMap>,
        index: usize,
    ) -> Self {
        let log = log.new(o!("subresource" => format!("{srtype}.{index}")));
        let schema = srtype.schema();
        let data = normalize_fields(schema, data);
        let olddata = olddata.map(|old| normalize_fields(schema, old));
        Self { log, srtype, index, data, olddata, restart }
    }

    pub fn srtype(&self) -> SubresourceType {
        self.srtype
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// The subresource's address within the machine, e.g. "disk.0".
    pub fn addr(&self) -> String {
        format!("{}.{}", self.srtype, self.index)
    }

    pub fn schema(&self) -> &'static Schema {
        self.srtype.schema()
    }

    pub fn data(&self) -> &FieldMap {
        &self.data
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Stores `value` under `key` after normalizing it.
    ///
    /// If nothing is left after normalization (a null, say), this is a
    /// no-op and the previous value stays in place.
    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        let ty = self.schema().field(key).map(|f| f.ty);
        if let Some(v) = normalize_value(ty, value.into()) {
            self.data.insert(key.to_owned(), v);
        }
    }

    /// Returns the previous and current values of `key`. With no previous
    /// state, the current value is reported for both.
    pub fn get_change(&self, key: &str) -> (Option<&Value>, Option<&Value>) {
        let new = self.data.get(key);
        match &self.olddata {
            Some(old) => (old.get(key), new),
            None => (new, new),
        }
    }

    pub fn has_change(&self, key: &str) -> bool {
        let (old, new) = self.get_change(key);
        old != new
    }

    /// Returns the value of `key`, flagging the owning machine for a restart
    /// if the value has changed.
    pub fn get_with_restart(&self, key: &str) -> Option<&Value> {
        if self.has_change(key) {
            self.set_restart(key);
        }
        self.get(key)
    }

    pub fn set_restart(&self, key: &str) {
        slog::debug!(self.log, "argument requires a VM restart";
            "field" => key, "subresource" => %self);
        self.restart.flag_restart();
    }

    /// Returns the value of `key`, or an error if it changed: the device
    /// would have to be replaced to apply the change.
    pub fn get_with_veto(
        &self,
        key: &str,
    ) -> Result<Option<&Value>, SubresourceError> {
        if self.has_change(key) {
            let (old, new) = self.get_change(key);
            return Err(SubresourceError::ImmutableField {
                key: key.to_owned(),
                old: display_value(old),
                new: display_value(new),
            });
        }
        Ok(self.get(key))
    }

    /// The device key recorded for this subresource, 0 if none.
    pub fn key(&self) -> Result<DeviceKey, SubresourceError> {
        match self.get(KEY_FIELD) {
            None => Ok(0),
            Some(v) => v
                .as_i64()
                .and_then(|k| DeviceKey::try_from(k).ok())
                .ok_or_else(|| SubresourceError::InvalidKey(v.clone())),
        }
    }

    /// The device address recorded for this subresource, empty if none.
    pub fn dev_addr(&self) -> &str {
        self.get(DEVICE_ADDRESS_FIELD).and_then(Value::as_str).unwrap_or("")
    }

    /// Records the identity of `device`, which is attached to `ctlr`.
    pub fn save_dev_ids(
        &mut self,
        device: &VirtualDevice,
        ctlr: &VirtualDevice,
    ) -> Result<(), SubresourceError> {
        let addr = compute_dev_addr(device, ctlr)?;
        self.set(KEY_FIELD, device.key);
        self.set(DEVICE_ADDRESS_FIELD, addr.to_string());
        slog::debug!(self.log, "saved device identity";
            "key" => device.key, "device_address" => %addr);
        Ok(())
    }

    /// Locates this subresource's device in `list`: by key if one has been
    /// recorded, by device address otherwise.
    pub fn find_virtual_device<'l>(
        &self,
        list: &'l VirtualDeviceList,
    ) -> Result<&'l VirtualDevice, SubresourceError> {
        let key = self.key()?;
        if key > 0 {
            slog::debug!(self.log, "looking for device by key"; "key" => key);
            return list
                .find_by_key(key)
                .ok_or(SubresourceError::DeviceNotFound(key));
        }
        self.find_virtual_device_by_addr(list)
    }

    /// Locates this subresource's device in `list` by its device address.
    ///
    /// Exactly one controller must match the address's class and bus, and
    /// exactly one device on that controller must match its unit.
    pub fn find_virtual_device_by_addr<'l>(
        &self,
        list: &'l VirtualDeviceList,
    ) -> Result<&'l VirtualDevice, SubresourceError> {
        slog::debug!(self.log, "looking for device by address";
            "device_address" => self.dev_addr());
        let addr = split_dev_addr(self.dev_addr())?;

        let ctlrs = list.select(|d| {
            d.controller_class() == Some(addr.class())
                && d.as_controller().map(|c| c.bus_number) == Some(addr.bus())
        });
        let ctlr = match ctlrs.as_slice() {
            [ctlr] => *ctlr,
            _ => {
                return Err(SubresourceError::ControllerLookup {
                    count: ctlrs.len(),
                    class: addr.class(),
                    bus: addr.bus(),
                })
            }
        };

        let devices = list.select(|d| {
            d.controller_key == Some(ctlr.key)
                && d.unit_number == Some(addr.unit())
        });
        match devices.as_slice() {
            [device] => Ok(*device),
            _ => Err(SubresourceError::DeviceLookup {
                count: devices.len(),
                controller_key: ctlr.key,
                unit: addr.unit(),
            }),
        }
    }

    /// Finds the controller a new or updated device of this subresource
    /// should attach to.
    ///
    /// SCSI and SATA devices go to the controller of that class on `bus`.
    /// IDE and PCI devices go to the first controller with room, which must
    /// be the primary (bus 0) controller.
    pub fn controller_for_create_update<'l>(
        &self,
        list: &'l VirtualDeviceList,
        class: ControllerClass,
        bus: u32,
    ) -> Result<&'l VirtualDevice, SubresourceError> {
        slog::debug!(self.log, "looking for controller";
            "class" => %class, "bus" => bus);
        let ctlr = match class {
            ControllerClass::Scsi | ControllerClass::Sata => {
                list.iter().find(|d| {
                    d.controller_class() == Some(class)
                        && d.as_controller().map(|c| c.bus_number)
                            == Some(bus)
                        && list.has_free_slot(d)
                })
            }
            ControllerClass::Ide | ControllerClass::Pci => {
                list.pick_controller(class)
            }
        }
        .ok_or(SubresourceError::NoControllerAvailable { class, bus })?;

        let on_primary = ctlr.as_controller().map(|c| c.bus_number) == Some(0);
        if matches!(class, ControllerClass::Ide | ControllerClass::Pci)
            && !on_primary
        {
            return Err(SubresourceError::PrimaryControllerFull(class));
        }

        slog::debug!(self.log, "found controller"; "controller" => ctlr.name());
        Ok(ctlr)
    }

    /// A structural hash of this subresource's fields.
    pub fn hash(&self) -> u64 {
        self.schema().hash(&self.data)
    }
}

impl Display for Subresource<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let key = self.get(KEY_FIELD).and_then(Value::as_i64).unwrap_or(0);
        let addr = match self.dev_addr() {
            "" => "<new device>",
            addr => addr,
        };
        write!(f, "{} (key {} at {})", self.addr(), key, addr)
    }
}

/// Computes the device address of `device`, which is attached to `ctlr`.
pub fn compute_dev_addr(
    device: &VirtualDevice,
    ctlr: &VirtualDevice,
) -> Result<DeviceAddress, SubresourceError> {
    let unclassifiable =
        || SubresourceError::UnclassifiableController(ctlr.name());
    let class = ctlr.controller_class().ok_or_else(unclassifiable)?;
    let bus = ctlr
        .as_controller()
        .map(|c| c.bus_number)
        .ok_or_else(unclassifiable)?;
    let unit = device
        .unit_number
        .ok_or_else(|| SubresourceError::NoUnitNumber(device.name()))?;
    Ok(DeviceAddress::new(class, bus, unit))
}

/// Decodes a device address string.
pub fn split_dev_addr(addr: &str) -> Result<DeviceAddress, SubresourceError> {
    Ok(DeviceAddress::from_str(addr)?)
}

fn normalize_fields(schema: &Schema, fields: FieldMap) -> FieldMap {
    fields
        .into_iter()
        .filter_map(|(k, v)| {
            let ty = schema.field(&k).map(|f| f.ty);
            normalize_value(ty, v).map(|v| (k, v))
        })
        .collect()
}

fn display_value(v: Option<&Value>) -> String {
    match v {
        Some(Value::String(s)) => s.clone(),
        Some(v) => v.to_string(),
        None => "<none>".to_owned(),
    }
}
