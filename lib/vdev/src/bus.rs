// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reconciling a machine's storage controllers with its declared bus layout.
//!
//! A machine declares how many SCSI, SATA and IDE controllers it has, and
//! which SCSI flavor and sharing mode its SCSI controllers use. The first N
//! controllers of each kind are brought in line with that declaration;
//! controllers on bus numbers at or beyond the declared count are left
//! alone.

use std::fmt::Display;
use std::str::FromStr;

use serde_json::Value;
use slog::Logger;
use thiserror::Error;
use vdev_types::{ScsiControllerType, ScsiSharing};

use crate::config_spec::{
    apply_device_change, device_change_string, DeviceConfigSpec, Operation,
};
use crate::context::FieldReader;
use crate::device::{
    device_list_string, ControllerKind, DeviceKey, DeviceListError,
    VirtualDevice, VirtualDeviceList,
};

pub const SCSI_CONTROLLER_COUNT: &str = "scsi_controller_count";
pub const SCSI_TYPE: &str = "scsi_type";
pub const SCSI_BUS_SHARING: &str = "scsi_bus_sharing";
pub const SATA_CONTROLLER_COUNT: &str = "sata_controller_count";
pub const IDE_CONTROLLER_COUNT: &str = "ide_controller_count";

#[derive(Debug, Error)]
pub enum BusError {
    #[error("{0} must be a non-negative integer, got {1}")]
    InvalidCount(&'static str, Value),

    #[error("unsupported SCSI controller type {0}")]
    UnsupportedScsiType(Value),

    #[error("unsupported SCSI bus sharing mode {0}")]
    UnsupportedScsiSharing(Value),

    #[error("device {0} is not a SCSI controller")]
    NotScsiController(String),

    #[error(transparent)]
    DeviceList(#[from] DeviceListError),
}

/// The declared controller layout of a machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BusTarget {
    pub scsi_count: u32,
    pub scsi_type: ScsiControllerType,
    pub scsi_sharing: ScsiSharing,
    pub sata_count: u32,
    pub ide_count: u32,
}

impl Default for BusTarget {
    fn default() -> Self {
        Self {
            scsi_count: 1,
            scsi_type: ScsiControllerType::ParaVirtual,
            scsi_sharing: ScsiSharing::NoSharing,
            sata_count: 0,
            ide_count: 2,
        }
    }
}

impl BusTarget {
    /// Reads the layout from the machine's fields. Absent fields take their
    /// defaults; present fields must be well-formed.
    pub fn from_fields(d: &dyn FieldReader) -> Result<Self, BusError> {
        let defaults = Self::default();
        Ok(Self {
            scsi_count: read_count(d, SCSI_CONTROLLER_COUNT)?
                .unwrap_or(defaults.scsi_count),
            scsi_type: read_enum(d, SCSI_TYPE, BusError::UnsupportedScsiType)?
                .unwrap_or(defaults.scsi_type),
            scsi_sharing: read_enum(
                d,
                SCSI_BUS_SHARING,
                BusError::UnsupportedScsiSharing,
            )?
            .unwrap_or(defaults.scsi_sharing),
            sata_count: read_count(d, SATA_CONTROLLER_COUNT)?
                .unwrap_or(defaults.sata_count),
            ide_count: read_count(d, IDE_CONTROLLER_COUNT)?
                .unwrap_or(defaults.ide_count),
        })
    }
}

fn read_count(
    d: &dyn FieldReader,
    key: &'static str,
) -> Result<Option<u32>, BusError> {
    d.get(key)
        .map(|v| {
            v.as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or(BusError::InvalidCount(key, v))
        })
        .transpose()
}

fn read_enum<T: FromStr>(
    d: &dyn FieldReader,
    key: &str,
    err: fn(Value) -> BusError,
) -> Result<Option<T>, BusError> {
    d.get(key)
        .map(|v| v.as_str().and_then(|s| T::from_str(s).ok()).ok_or(err(v)))
        .transpose()
}

/// The uniform value of a property across a run of controllers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BusState<T> {
    /// The first controller in the run is missing.
    Unknown,
    /// Controllers disagree, or one past the first is missing.
    Mixed,
    Uniform(T),
}

impl<T: Display> Display for BusState<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BusState::Unknown => f.write_str("unknown"),
            BusState::Mixed => f.write_str("mixed"),
            BusState::Uniform(t) => t.fmt(f),
        }
    }
}

/// Indexes the controllers of each bus kind by bus number, keeping only
/// those below the declared count.
struct ControllerSlots {
    scsi: Vec<Option<DeviceKey>>,
    sata: Vec<Option<DeviceKey>>,
    ide: Vec<Option<DeviceKey>>,
}

impl ControllerSlots {
    fn collect(
        list: &VirtualDeviceList,
        scsi_count: u32,
        sata_count: u32,
        ide_count: u32,
    ) -> Self {
        let mut slots = Self {
            scsi: vec![None; scsi_count as usize],
            sata: vec![None; sata_count as usize],
            ide: vec![None; ide_count as usize],
        };
        for dev in list.iter() {
            let Some(ctlr) = dev.as_controller() else {
                continue;
            };
            let bucket = match ctlr.kind {
                ControllerKind::Scsi(_) => &mut slots.scsi,
                ControllerKind::Sata => &mut slots.sata,
                ControllerKind::Ide => &mut slots.ide,
                ControllerKind::Pci
                | ControllerKind::Nvme
                | ControllerKind::Usb
                | ControllerKind::Ps2
                | ControllerKind::Sio => continue,
            };
            if let Some(slot) = bucket.get_mut(ctlr.bus_number as usize) {
                *slot = Some(dev.key);
            }
        }
        slots
    }
}

fn slots_string(
    slots: &[Option<DeviceKey>],
    list: &VirtualDeviceList,
) -> String {
    slots
        .iter()
        .map(|s| match s.and_then(|k| list.find_by_key(k)) {
            Some(d) => d.name(),
            None => "<new device>".to_owned(),
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Brings the first controllers of each bus kind in `list` in line with
/// `target`.
///
/// Returns the updated list along with the changes that produce it, in
/// order: SCSI buses first, then SATA, then IDE. A SCSI controller of the
/// wrong flavor is replaced by one of the right flavor on the same bus, and
/// every device attached to it is moved across with its unit number intact.
///
/// On error nothing is returned; the caller must not apply a partial set of
/// changes.
pub fn normalize_bus(
    log: &Logger,
    list: VirtualDeviceList,
    target: &BusTarget,
) -> Result<(VirtualDeviceList, Vec<DeviceConfigSpec>), BusError> {
    let mut list = list;
    let mut spec = Vec::new();
    let slots = ControllerSlots::collect(
        &list,
        target.scsi_count,
        target.sata_count,
        target.ide_count,
    );
    slog::debug!(log, "normalizing bus";
        "scsi" => slots_string(&slots.scsi, &list),
        "sata" => slots_string(&slots.sata, &list),
        "ide" => slots_string(&slots.ide, &list),
        "target" => ?target);

    for (bus, slot) in slots.scsi.iter().enumerate() {
        let bus = bus as u32;
        let cspec = match slot.and_then(|k| list.find_by_key(k)) {
            None => {
                slog::debug!(log, "creating SCSI controller";
                    "type" => %target.scsi_type, "bus" => bus);
                let (l, cspec) = create_scsi_controller(
                    list,
                    target.scsi_type,
                    target.scsi_sharing,
                    bus,
                )?;
                list = l;
                cspec
            }
            Some(ctlr) => {
                let ctlr = ctlr.clone();
                let current = ctlr
                    .as_scsi_controller()
                    .ok_or_else(|| BusError::NotScsiController(ctlr.name()))?;
                if current.subtype == target.scsi_type {
                    let (l, cspec) =
                        set_scsi_bus_sharing(list, ctlr, target.scsi_sharing)?;
                    list = l;
                    cspec
                } else {
                    let cspec = swap_scsi_device(
                        log,
                        &list,
                        &ctlr,
                        target.scsi_type,
                        target.scsi_sharing,
                    )?;
                    list = apply_device_change(list, &cspec);
                    cspec
                }
            }
        };
        spec.extend(cspec);
    }

    for (bus, slot) in slots.sata.iter().enumerate() {
        if slot.is_none() {
            let bus = bus as u32;
            slog::debug!(log, "creating SATA controller"; "bus" => bus);
            let ctlr = list.create_sata_controller(bus)?;
            let cspec = add_spec(ctlr);
            list = apply_device_change(list, &cspec);
            spec.extend(cspec);
        }
    }

    for (bus, slot) in slots.ide.iter().enumerate() {
        if slot.is_none() {
            let bus = bus as u32;
            slog::debug!(log, "creating IDE controller"; "bus" => bus);
            let ctlr = list.create_ide_controller(bus)?;
            let cspec = add_spec(ctlr);
            list = apply_device_change(list, &cspec);
            spec.extend(cspec);
        }
    }

    slog::debug!(log, "normalized bus";
        "devices" => device_list_string(&list),
        "changes" => device_change_string(&spec));
    Ok((list, spec))
}

fn add_spec(device: VirtualDevice) -> Vec<DeviceConfigSpec> {
    VirtualDeviceList::new(vec![device]).config_spec(Operation::Add)
}

fn create_scsi_controller(
    list: VirtualDeviceList,
    subtype: ScsiControllerType,
    sharing: ScsiSharing,
    bus: u32,
) -> Result<(VirtualDeviceList, Vec<DeviceConfigSpec>), BusError> {
    let ctlr = list.create_scsi_controller(subtype, sharing, bus)?;
    let cspec = add_spec(ctlr);
    Ok((apply_device_change(list, &cspec), cspec))
}

/// Edits the sharing mode of `ctlr` in place if it differs from `sharing`.
fn set_scsi_bus_sharing(
    list: VirtualDeviceList,
    mut ctlr: VirtualDevice,
    sharing: ScsiSharing,
) -> Result<(VirtualDeviceList, Vec<DeviceConfigSpec>), BusError> {
    let name = ctlr.name();
    let scsi = match ctlr.as_controller_mut().map(|c| &mut c.kind) {
        Some(ControllerKind::Scsi(scsi)) => scsi,
        _ => return Err(BusError::NotScsiController(name)),
    };
    if scsi.sharing == sharing {
        return Ok((list, Vec::new()));
    }
    scsi.sharing = sharing;

    let cspec =
        VirtualDeviceList::new(vec![ctlr]).config_spec(Operation::Edit);
    Ok((apply_device_change(list, &cspec), cspec))
}

/// Builds the changes that replace SCSI controller `old` with a controller
/// of flavor `subtype` on the same bus: remove the old controller, add the
/// new one, then re-point each attached device at the new controller.
///
/// Moving a device between controllers leaves its backing alone, so the
/// file operation on each device edit is cleared.
fn swap_scsi_device(
    log: &Logger,
    list: &VirtualDeviceList,
    old: &VirtualDevice,
    subtype: ScsiControllerType,
    sharing: ScsiSharing,
) -> Result<Vec<DeviceConfigSpec>, BusError> {
    let bus = old
        .as_controller()
        .map(|c| c.bus_number)
        .ok_or_else(|| BusError::NotScsiController(old.name()))?;
    slog::debug!(log, "swapping SCSI controller";
        "controller" => old.name(), "bus" => bus, "type" => %subtype);

    let mut spec = VirtualDeviceList::new(vec![old.clone()])
        .config_spec(Operation::Remove);

    let new = list.create_scsi_controller(subtype, sharing, bus)?;
    let new_key = new.key;
    spec.extend(add_spec(new));

    for device in list.iter().filter(|d| d.controller_key == Some(old.key)) {
        let mut moved = device.clone();
        moved.controller_key = Some(new_key);
        let mut cspec =
            VirtualDeviceList::new(vec![moved]).config_spec(Operation::Edit);
        for c in cspec.iter_mut() {
            c.file_operation = None;
        }
        spec.extend(cspec);
    }

    slog::debug!(log, "swapped SCSI controller";
        "changes" => device_change_string(&spec));
    Ok(spec)
}

/// Reports the SCSI flavor shared by the controllers on buses
/// `0..count`.
pub fn read_scsi_bus_type(
    list: &VirtualDeviceList,
    count: u32,
) -> BusState<ScsiControllerType> {
    read_scsi_bus_state(list, count, |scsi| scsi.subtype)
}

/// Reports the sharing mode shared by the SCSI controllers on buses
/// `0..count`.
pub fn read_scsi_bus_sharing(
    list: &VirtualDeviceList,
    count: u32,
) -> BusState<ScsiSharing> {
    read_scsi_bus_state(list, count, |scsi| scsi.sharing)
}

fn read_scsi_bus_state<T, F>(
    list: &VirtualDeviceList,
    count: u32,
    prop: F,
) -> BusState<T>
where
    T: PartialEq,
    F: Fn(&crate::device::ScsiController) -> T,
{
    let slots = ControllerSlots::collect(list, count, 0, 0);
    let values: Vec<Option<T>> = slots
        .scsi
        .iter()
        .map(|s| {
            s.and_then(|k| list.find_by_key(k))
                .and_then(VirtualDevice::as_scsi_controller)
                .map(&prop)
        })
        .collect();

    let mut values = values.into_iter();
    let first = match values.next() {
        Some(Some(first)) => first,
        _ => return BusState::Unknown,
    };
    for v in values {
        if v.as_ref() != Some(&first) {
            return BusState::Mixed;
        }
    }
    BusState::Uniform(first)
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;
    use crate::context::ResourceData;
    use crate::device::test_util::*;
    use crate::device::{Controller, DeviceKind};
    use crate::subresource::test_util::test_logger;

    fn target(
        scsi_count: u32,
        scsi_type: ScsiControllerType,
        scsi_sharing: ScsiSharing,
    ) -> BusTarget {
        BusTarget {
            scsi_count,
            scsi_type,
            scsi_sharing,
            sata_count: 0,
            ide_count: 0,
        }
    }

    fn two_lsilogic() -> VirtualDeviceList {
        VirtualDeviceList::new(vec![
            lsilogic(1000, 0),
            lsilogic(1001, 1),
            disk(2000, 1000, 0),
            disk(2001, 1000, 1),
            disk(2002, 1001, 3),
        ])
    }

    #[test]
    fn swaps_controllers_of_the_wrong_type() {
        let list = two_lsilogic();
        let (list, spec) = normalize_bus(
            &test_logger(),
            list,
            &target(2, ScsiControllerType::ParaVirtual, ScsiSharing::NoSharing),
        )
        .unwrap();

        let ops: Vec<(Operation, DeviceKey)> =
            spec.iter().map(|c| (c.operation, c.device.key)).collect();
        assert_eq!(
            ops,
            vec![
                (Operation::Remove, 1000),
                (Operation::Add, -201),
                (Operation::Edit, 2000),
                (Operation::Edit, 2001),
                (Operation::Remove, 1001),
                (Operation::Add, -202),
                (Operation::Edit, 2002),
            ]
        );

        // Device edits are logical moves and carry no file operation.
        assert!(spec.iter().all(|c| c.file_operation.is_none()));

        for (new_key, bus) in [(-201, 0), (-202, 1)] {
            let ctlr = list.find_by_key(new_key).unwrap();
            assert_eq!(
                ctlr.kind,
                DeviceKind::Controller(Controller {
                    bus_number: bus,
                    kind: ControllerKind::Scsi(crate::device::ScsiController {
                        subtype: ScsiControllerType::ParaVirtual,
                        sharing: ScsiSharing::NoSharing,
                    }),
                })
            );
        }
        assert!(list.find_by_key(1000).is_none());
        assert!(list.find_by_key(1001).is_none());

        let moves = [(2000, -201, 0), (2001, -201, 1), (2002, -202, 3)];
        for (key, ctlr, unit) in moves {
            let d = list.find_by_key(key).unwrap();
            assert_eq!(d.controller_key, Some(ctlr));
            assert_eq!(d.unit_number, Some(unit));
        }
    }

    #[test]
    fn sharing_change_only_edits() {
        let list = VirtualDeviceList::new(vec![
            scsi(
                1000,
                0,
                ScsiControllerType::ParaVirtual,
                ScsiSharing::NoSharing,
            ),
            scsi(
                1001,
                1,
                ScsiControllerType::ParaVirtual,
                ScsiSharing::VirtualSharing,
            ),
            scsi(
                1002,
                2,
                ScsiControllerType::ParaVirtual,
                ScsiSharing::NoSharing,
            ),
            disk(2000, 1000, 0),
        ]);
        let (list, spec) = normalize_bus(
            &test_logger(),
            list,
            &target(
                3,
                ScsiControllerType::ParaVirtual,
                ScsiSharing::VirtualSharing,
            ),
        )
        .unwrap();

        assert_eq!(spec.len(), 2);
        assert!(spec.iter().all(|c| c.operation == Operation::Edit));
        let keys: Vec<_> = spec.iter().map(|c| c.device.key).collect();
        assert_eq!(keys, vec![1000, 1002]);
        assert_eq!(
            read_scsi_bus_sharing(&list, 3),
            BusState::Uniform(ScsiSharing::VirtualSharing)
        );
        assert_eq!(list.len(), 4);
    }

    #[test]
    fn matching_bus_is_untouched() {
        let list = basic_list();
        let (after, spec) = normalize_bus(
            &test_logger(),
            list.clone(),
            &BusTarget {
                scsi_count: 1,
                scsi_type: ScsiControllerType::LsiLogic,
                scsi_sharing: ScsiSharing::NoSharing,
                sata_count: 0,
                ide_count: 2,
            },
        )
        .unwrap();
        assert!(spec.is_empty());
        assert_eq!(after, list);
    }

    #[test]
    fn creates_missing_controllers_in_bus_order() {
        let list = basic_list();
        let (list, spec) = normalize_bus(
            &test_logger(),
            list,
            &BusTarget {
                scsi_count: 2,
                scsi_type: ScsiControllerType::LsiLogic,
                scsi_sharing: ScsiSharing::NoSharing,
                sata_count: 2,
                ide_count: 2,
            },
        )
        .unwrap();

        let added: Vec<(&str, u32)> = spec
            .iter()
            .map(|c| {
                assert_eq!(c.operation, Operation::Add);
                (
                    c.device.type_name(),
                    c.device.as_controller().unwrap().bus_number,
                )
            })
            .collect();
        assert_eq!(added, vec![("lsilogic", 1), ("ahci", 0), ("ahci", 1)]);
        assert_eq!(read_scsi_bus_type(&list, 2).to_string(), "lsilogic");
    }

    #[test]
    fn controllers_beyond_count_are_ignored() {
        let list = VirtualDeviceList::new(vec![
            lsilogic(1000, 0),
            lsilogic(1001, 1),
            disk(2000, 1001, 0),
        ]);
        let (list, spec) = normalize_bus(
            &test_logger(),
            list,
            &target(1, ScsiControllerType::ParaVirtual, ScsiSharing::NoSharing),
        )
        .unwrap();

        assert_eq!(spec.len(), 2);
        assert_eq!(list.find_by_key(1001).unwrap().type_name(), "lsilogic");
        assert_eq!(list.find_by_key(2000).unwrap().controller_key, Some(1001));
        assert_eq!(read_scsi_bus_type(&list, 2), BusState::Mixed);
    }

    #[test]
    fn too_many_scsi_controllers_fails() {
        let result = normalize_bus(
            &test_logger(),
            basic_list(),
            &target(5, ScsiControllerType::ParaVirtual, ScsiSharing::NoSharing),
        );
        assert!(matches!(
            result,
            Err(BusError::DeviceList(DeviceListError::BusNumberOutOfRange {
                bus: 4,
                ..
            }))
        ));
    }

    #[test]
    fn exhausted_key_space_fails_swap() {
        let list =
            VirtualDeviceList::new(vec![lsilogic(DeviceKey::MIN, 0)]);
        let result = normalize_bus(
            &test_logger(),
            list,
            &target(1, ScsiControllerType::ParaVirtual, ScsiSharing::NoSharing),
        );
        assert!(matches!(
            result,
            Err(BusError::DeviceList(DeviceListError::KeySpaceExhausted(_)))
        ));
    }

    #[test]
    fn target_from_fields() {
        let d = ResourceData::default();
        assert_eq!(BusTarget::from_fields(&d).unwrap(), BusTarget::default());

        d.set(SCSI_CONTROLLER_COUNT, 3);
        d.set(SCSI_TYPE, "lsilogic-sas");
        d.set(SCSI_BUS_SHARING, "physicalSharing");
        d.set(SATA_CONTROLLER_COUNT, 1);
        d.set(IDE_CONTROLLER_COUNT, 0);
        assert_eq!(
            BusTarget::from_fields(&d).unwrap(),
            BusTarget {
                scsi_count: 3,
                scsi_type: ScsiControllerType::LsiLogicSas,
                scsi_sharing: ScsiSharing::PhysicalSharing,
                sata_count: 1,
                ide_count: 0,
            }
        );

        d.set(SCSI_TYPE, "megaraid");
        assert!(matches!(
            BusTarget::from_fields(&d),
            Err(BusError::UnsupportedScsiType(v)) if v == json!("megaraid")
        ));

        d.set(SCSI_TYPE, "pvscsi");
        d.set(SATA_CONTROLLER_COUNT, -1);
        assert!(matches!(
            BusTarget::from_fields(&d),
            Err(BusError::InvalidCount(SATA_CONTROLLER_COUNT, _))
        ));
    }

    #[test]
    fn bus_state_reporting() {
        let list = basic_list();
        assert_eq!(
            read_scsi_bus_type(&list, 1),
            BusState::Uniform(ScsiControllerType::LsiLogic)
        );
        assert_eq!(read_scsi_bus_type(&list, 2), BusState::Mixed);
        assert_eq!(read_scsi_bus_type(&list, 0), BusState::Unknown);
        assert_eq!(read_scsi_bus_sharing(&list, 1).to_string(), "noSharing");

        let empty = VirtualDeviceList::default();
        assert_eq!(read_scsi_bus_type(&empty, 1).to_string(), "unknown");
    }
}
