// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device change operations and their application to a device list.

use serde::Serialize;

use crate::device::{DeviceKind, VirtualDevice, VirtualDeviceList};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    Add,
    Edit,
    Remove,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Add => "add",
            Operation::Edit => "edit",
            Operation::Remove => "remove",
        }
    }
}

/// What the hypervisor should do with a disk's backing file as part of a
/// change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FileOperation {
    Create,
    Replace,
    Destroy,
}

/// One pending change to a VM's device list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeviceConfigSpec {
    pub operation: Operation,
    pub file_operation: Option<FileOperation>,
    pub device: VirtualDevice,
}

impl std::fmt::Display for DeviceConfigSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "({}: {} at key {})",
            self.operation.as_str(),
            self.device.type_name(),
            self.device.key
        )
    }
}

impl VirtualDeviceList {
    /// Builds one change of kind `op` for every device in this list.
    ///
    /// Disks get a matching file operation, except for an add of a disk with
    /// no capacity that is not a linked clone: that attaches an existing
    /// backing file, which must be left alone.
    pub fn config_spec(&self, op: Operation) -> Vec<DeviceConfigSpec> {
        let fop = match op {
            Operation::Add => FileOperation::Create,
            Operation::Edit => FileOperation::Replace,
            Operation::Remove => FileOperation::Destroy,
        };

        self.iter()
            .map(|device| {
                let file_operation = match &device.kind {
                    DeviceKind::Disk(disk)
                        if op == Operation::Add
                            && disk.capacity_kb == 0
                            && !disk.has_parent =>
                    {
                        None
                    }
                    DeviceKind::Disk(_) => Some(fop),
                    _ => None,
                };
                DeviceConfigSpec {
                    operation: op,
                    file_operation,
                    device: device.clone(),
                }
            })
            .collect()
    }
}

/// Applies `specs` in order to `list`, returning the updated list.
///
/// Adds append, edits replace the device with the same key, removes drop
/// every device with the removed key.
pub fn apply_device_change(
    list: VirtualDeviceList,
    specs: &[DeviceConfigSpec],
) -> VirtualDeviceList {
    let mut list = list;
    for spec in specs {
        let devices = list.devices_mut();
        match spec.operation {
            Operation::Add => devices.push(spec.device.clone()),
            Operation::Edit => {
                for device in devices.iter_mut() {
                    if device.key == spec.device.key {
                        *device = spec.device.clone();
                    }
                }
            }
            Operation::Remove => {
                devices.retain(|device| device.key != spec.device.key)
            }
        }
    }
    list
}

/// Renders a list of changes, for logging.
pub fn device_change_string(specs: &[DeviceConfigSpec]) -> String {
    specs.iter().map(ToString::to_string).collect::<Vec<_>>().join(",")
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::device::test_util::*;
    use crate::device::Disk;

    #[test]
    fn disk_file_operations() {
        let list = VirtualDeviceList::new(vec![disk(2000, 1000, 0)]);
        assert_eq!(
            list.config_spec(Operation::Add)[0].file_operation,
            Some(FileOperation::Create)
        );
        assert_eq!(
            list.config_spec(Operation::Edit)[0].file_operation,
            Some(FileOperation::Replace)
        );
        assert_eq!(
            list.config_spec(Operation::Remove)[0].file_operation,
            Some(FileOperation::Destroy)
        );

        let ctlrs = VirtualDeviceList::new(vec![lsilogic(1000, 0)]);
        assert_eq!(ctlrs.config_spec(Operation::Add)[0].file_operation, None);
    }

    #[test]
    fn attaching_existing_disk_has_no_file_operation() {
        let existing = VirtualDevice::attached(
            -201,
            DeviceKind::Disk(Disk {
                capacity_kb: 0,
                file_name: Some("[datastore1] other/data.vmdk".to_owned()),
                has_parent: false,
            }),
            1000,
            3,
        );
        let mut linked = existing.clone();
        linked.key = -202;
        if let DeviceKind::Disk(ref mut d) = linked.kind {
            d.has_parent = true;
        }

        let specs = VirtualDeviceList::new(vec![existing, linked])
            .config_spec(Operation::Add);
        assert_eq!(specs[0].file_operation, None);
        assert_eq!(specs[1].file_operation, Some(FileOperation::Create));
    }

    #[test]
    fn apply_changes_in_order() {
        let list = basic_list();
        let before = list.len();

        let new_ctlr = list
            .create_scsi_controller(
                vdev_types::ScsiControllerType::ParaVirtual,
                vdev_types::ScsiSharing::NoSharing,
                1,
            )
            .unwrap();
        let mut moved = list.find_by_key(2001).unwrap().clone();
        moved.controller_key = Some(new_ctlr.key);

        let mut specs = VirtualDeviceList::new(vec![new_ctlr.clone()])
            .config_spec(Operation::Add);
        specs.extend(
            VirtualDeviceList::new(vec![moved]).config_spec(Operation::Edit),
        );
        let cdrom = list.find_by_key(3000).unwrap().clone();
        specs.extend(
            VirtualDeviceList::new(vec![cdrom]).config_spec(Operation::Remove),
        );

        let list = apply_device_change(list, &specs);
        assert_eq!(list.len(), before);
        assert!(list.find_by_key(3000).is_none());
        assert_eq!(list.find_by_key(new_ctlr.key), Some(&new_ctlr));
        let moved = list.find_by_key(2001).unwrap();
        assert_eq!(moved.controller_key, Some(new_ctlr.key));
        assert_eq!(moved.unit_number, Some(1));
        assert_eq!(
            device_change_string(&specs),
            "(add: pvscsi at key -201),(edit: disk at key 2001),\
             (remove: cdrom at key 3000)"
        );
    }
}
