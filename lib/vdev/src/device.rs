// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory model of a hypervisor's virtual device inventory.
//!
//! A [`VirtualDeviceList`] mirrors the device array the hypervisor reports
//! for a virtual machine. Devices that the hypervisor has created carry a
//! positive key; devices staged locally for creation carry a negative key
//! allocated by [`VirtualDeviceList::new_key`].

use serde::Serialize;
use thiserror::Error;
use vdev_types::{ControllerClass, ScsiControllerType, ScsiSharing};

/// The hypervisor-assigned identity of a device.
pub type DeviceKey = i32;

/// Keys handed out to locally staged devices count down from here.
const NEW_KEY_BASE: DeviceKey = -200;

/// SCSI controllers occupy this unit on their own bus.
pub const SCSI_CONTROLLER_UNIT: u32 = 7;

const MAX_SCSI_BUSES: u32 = 4;
const MAX_SATA_BUSES: u32 = 4;
const MAX_IDE_BUSES: u32 = 2;

/// Errors returned by the device list primitives.
#[derive(Debug, Error)]
pub enum DeviceListError {
    #[error("{kind} bus number {bus} outside range of 0-{}", .max - 1)]
    BusNumberOutOfRange { kind: &'static str, bus: u32, max: u32 },

    #[error("no device with key {0} in device list")]
    NoSuchDevice(DeviceKey),

    #[error("device {0} is not a controller")]
    NotAController(String),

    #[error("controller {0} has no free unit numbers")]
    ControllerFull(String),

    #[error("no device keys left below {0}")]
    KeySpaceExhausted(DeviceKey),
}

/// A SCSI controller's flavor and bus sharing mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ScsiController {
    pub subtype: ScsiControllerType,
    pub sharing: ScsiSharing,
}

/// The closed set of controller kinds a device list can contain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerKind {
    Ide,
    Sata,
    Scsi(ScsiController),
    Pci,
    Nvme,
    Usb,
    Ps2,
    Sio,
}

impl ControllerKind {
    /// Returns the addressing class of this controller, or `None` for
    /// controllers that devices managed here are never attached through.
    pub fn class(&self) -> Option<ControllerClass> {
        match self {
            ControllerKind::Ide => Some(ControllerClass::Ide),
            ControllerKind::Sata => Some(ControllerClass::Sata),
            ControllerKind::Scsi(_) => Some(ControllerClass::Scsi),
            ControllerKind::Pci => Some(ControllerClass::Pci),
            ControllerKind::Nvme
            | ControllerKind::Usb
            | ControllerKind::Ps2
            | ControllerKind::Sio => None,
        }
    }

    /// The number of devices the controller accepts before it is considered
    /// full, if it is bounded at all.
    pub fn capacity(&self) -> Option<usize> {
        match self {
            ControllerKind::Ide => Some(2),
            ControllerKind::Sata => Some(30),
            ControllerKind::Scsi(_) => Some(15),
            ControllerKind::Nvme => Some(8),
            ControllerKind::Pci
            | ControllerKind::Usb
            | ControllerKind::Ps2
            | ControllerKind::Sio => None,
        }
    }

    /// The number of unit numbers on this controller's bus.
    fn unit_slots(&self) -> u32 {
        match self {
            ControllerKind::Ide => 2,
            ControllerKind::Scsi(_) => 16,
            ControllerKind::Pci => 32,
            ControllerKind::Sata
            | ControllerKind::Nvme
            | ControllerKind::Usb
            | ControllerKind::Ps2
            | ControllerKind::Sio => 30,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ControllerKind::Ide => "ide",
            ControllerKind::Sata => "ahci",
            ControllerKind::Scsi(scsi) => scsi.subtype.as_str(),
            ControllerKind::Pci => "pci",
            ControllerKind::Nvme => "nvme",
            ControllerKind::Usb => "usb",
            ControllerKind::Ps2 => "ps2",
            ControllerKind::Sio => "sio",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Controller {
    pub bus_number: u32,
    pub kind: ControllerKind,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Disk {
    pub capacity_kb: u64,

    /// Path of the backing file, if the disk is file-backed.
    pub file_name: Option<String>,

    /// Whether the backing is a delta disk with a parent (a linked clone).
    pub has_parent: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct NetworkAdapter {
    pub adapter_type: String,
    pub mac_address: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Controller(Controller),
    Disk(Disk),
    NetworkAdapter(NetworkAdapter),
    Cdrom,
    Other(String),
}

/// A single piece of virtual hardware.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VirtualDevice {
    pub key: DeviceKey,
    pub controller_key: Option<DeviceKey>,
    pub unit_number: Option<u32>,
    pub kind: DeviceKind,
}

impl VirtualDevice {
    pub fn new(key: DeviceKey, kind: DeviceKind) -> Self {
        Self { key, controller_key: None, unit_number: None, kind }
    }

    /// Builds a device attached to `controller_key` at `unit`.
    pub fn attached(
        key: DeviceKey,
        kind: DeviceKind,
        controller_key: DeviceKey,
        unit: u32,
    ) -> Self {
        Self {
            key,
            controller_key: Some(controller_key),
            unit_number: Some(unit),
            kind,
        }
    }

    pub fn controller(
        key: DeviceKey,
        bus_number: u32,
        kind: ControllerKind,
    ) -> Self {
        Self::new(key, DeviceKind::Controller(Controller { bus_number, kind }))
    }

    pub fn as_controller(&self) -> Option<&Controller> {
        match &self.kind {
            DeviceKind::Controller(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_controller_mut(&mut self) -> Option<&mut Controller> {
        match &mut self.kind {
            DeviceKind::Controller(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_scsi_controller(&self) -> Option<&ScsiController> {
        match self.as_controller()?.kind {
            ControllerKind::Scsi(ref scsi) => Some(scsi),
            _ => None,
        }
    }

    /// The addressing class of this device, if it is a controller of one of
    /// the classes in [`ControllerClass`].
    pub fn controller_class(&self) -> Option<ControllerClass> {
        self.as_controller()?.kind.class()
    }

    pub fn is_disk(&self) -> bool {
        matches!(self.kind, DeviceKind::Disk(_))
    }

    /// A short name for the type of this device, e.g. "pvscsi" or "disk".
    pub fn type_name(&self) -> &str {
        match &self.kind {
            DeviceKind::Controller(c) => c.kind.type_name(),
            DeviceKind::Disk(_) => "disk",
            DeviceKind::NetworkAdapter(_) => "ethernet",
            DeviceKind::Cdrom => "cdrom",
            DeviceKind::Other(name) => name.as_str(),
        }
    }

    /// A label for the device for use in logs and error messages.
    pub fn name(&self) -> String {
        format!("{}-{}", self.type_name(), self.key)
    }
}

/// An ordered list of virtual devices.
///
/// Mutating operations consume the list and hand back its successor;
/// callers must not keep using a list they have passed along.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct VirtualDeviceList(Vec<VirtualDevice>);

impl VirtualDeviceList {
    pub fn new(devices: Vec<VirtualDevice>) -> Self {
        Self(devices)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, VirtualDevice> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> Vec<VirtualDevice> {
        self.0
    }

    pub(crate) fn devices_mut(&mut self) -> &mut Vec<VirtualDevice> {
        &mut self.0
    }

    pub fn find_by_key(&self, key: DeviceKey) -> Option<&VirtualDevice> {
        self.0.iter().find(|d| d.key == key)
    }

    /// Returns every device for which `pred` holds, in list order.
    pub fn select<F>(&self, pred: F) -> Vec<&VirtualDevice>
    where
        F: Fn(&VirtualDevice) -> bool,
    {
        self.0.iter().filter(|d| pred(d)).collect()
    }

    /// Returns the devices attached to the controller with key `ctlr_key`.
    pub fn attached_to(&self, ctlr_key: DeviceKey) -> Vec<&VirtualDevice> {
        self.select(|d| d.controller_key == Some(ctlr_key))
    }

    /// Allocates a key for a device that has not been created yet. Staged
    /// keys are negative and never collide with one already in the list.
    pub fn new_key(&self) -> Result<DeviceKey, DeviceListError> {
        let lowest = self.0.iter().map(|d| d.key).min().unwrap_or(0);
        let base = lowest.min(NEW_KEY_BASE);
        base.checked_sub(1).ok_or(DeviceListError::KeySpaceExhausted(base))
    }

    /// Builds a new SCSI controller at `bus`. The controller is not added to
    /// the list.
    pub fn create_scsi_controller(
        &self,
        subtype: ScsiControllerType,
        sharing: ScsiSharing,
        bus: u32,
    ) -> Result<VirtualDevice, DeviceListError> {
        check_bus("scsi", bus, MAX_SCSI_BUSES)?;
        Ok(VirtualDevice::controller(
            self.new_key()?,
            bus,
            ControllerKind::Scsi(ScsiController { subtype, sharing }),
        ))
    }

    /// Builds a new SATA (AHCI) controller at `bus`. The controller is not
    /// added to the list.
    pub fn create_sata_controller(
        &self,
        bus: u32,
    ) -> Result<VirtualDevice, DeviceListError> {
        check_bus("sata", bus, MAX_SATA_BUSES)?;
        let key = self.new_key()?;
        Ok(VirtualDevice::controller(key, bus, ControllerKind::Sata))
    }

    /// Builds a new IDE controller at `bus`. The controller is not added to
    /// the list.
    pub fn create_ide_controller(
        &self,
        bus: u32,
    ) -> Result<VirtualDevice, DeviceListError> {
        check_bus("ide", bus, MAX_IDE_BUSES)?;
        let key = self.new_key()?;
        Ok(VirtualDevice::controller(key, bus, ControllerKind::Ide))
    }

    /// Returns the first controller of `class` that still has room for
    /// another device.
    pub fn pick_controller(
        &self,
        class: ControllerClass,
    ) -> Option<&VirtualDevice> {
        self.0.iter().find(|d| {
            d.controller_class() == Some(class) && self.has_free_slot(d)
        })
    }

    pub(crate) fn has_free_slot(&self, ctlr: &VirtualDevice) -> bool {
        match ctlr.as_controller().and_then(|c| c.kind.capacity()) {
            Some(cap) => self.attached_to(ctlr.key).len() < cap,
            None => ctlr.as_controller().is_some(),
        }
    }

    /// Returns the lowest unit number on `ctlr` not taken by an attached
    /// device, if any.
    pub fn new_unit_number(&self, ctlr: &VirtualDevice) -> Option<u32> {
        let c = ctlr.as_controller()?;
        let mut used = vec![false; c.kind.unit_slots() as usize];
        if let ControllerKind::Scsi(_) = c.kind {
            used[SCSI_CONTROLLER_UNIT as usize] = true;
        }
        for d in self.attached_to(ctlr.key) {
            if let Some(slot) =
                d.unit_number.and_then(|u| used.get_mut(u as usize))
            {
                *slot = true;
            }
        }
        used.iter().position(|u| !u).map(|u| u as u32)
    }

    /// Points `device` at the controller with key `ctlr_key`, giving it the
    /// next free unit number on that controller.
    pub fn assign_controller(
        &self,
        device: &mut VirtualDevice,
        ctlr_key: DeviceKey,
    ) -> Result<(), DeviceListError> {
        let ctlr = self
            .find_by_key(ctlr_key)
            .ok_or(DeviceListError::NoSuchDevice(ctlr_key))?;
        if ctlr.as_controller().is_none() {
            return Err(DeviceListError::NotAController(ctlr.name()));
        }
        if !self.has_free_slot(ctlr) {
            return Err(DeviceListError::ControllerFull(ctlr.name()));
        }
        let unit = self
            .new_unit_number(ctlr)
            .ok_or_else(|| DeviceListError::ControllerFull(ctlr.name()))?;

        device.controller_key = Some(ctlr_key);
        device.unit_number = Some(unit);
        Ok(())
    }
}

fn check_bus(
    kind: &'static str,
    bus: u32,
    max: u32,
) -> Result<(), DeviceListError> {
    if bus >= max {
        return Err(DeviceListError::BusNumberOutOfRange { kind, bus, max });
    }
    Ok(())
}

impl From<Vec<VirtualDevice>> for VirtualDeviceList {
    fn from(devices: Vec<VirtualDevice>) -> Self {
        Self(devices)
    }
}

impl FromIterator<VirtualDevice> for VirtualDeviceList {
    fn from_iter<I: IntoIterator<Item = VirtualDevice>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for VirtualDeviceList {
    type Item = VirtualDevice;
    type IntoIter = std::vec::IntoIter<VirtualDevice>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a VirtualDeviceList {
    type Item = &'a VirtualDevice;
    type IntoIter = std::slice::Iter<'a, VirtualDevice>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Renders the names of every device in `list`, for logging.
pub fn device_list_string(list: &VirtualDeviceList) -> String {
    list.iter().map(VirtualDevice::name).collect::<Vec<_>>().join(",")
}
