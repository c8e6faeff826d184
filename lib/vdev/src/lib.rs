// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client-side management of a virtual machine's hardware devices.
//!
//! Disks, network interfaces and CD-ROMs are managed as subresources of a
//! machine, each with its own change tracking and identity, while the
//! machine's storage controllers are reconciled against a declared bus
//! layout. Everything here operates on an in-memory copy of the hypervisor's
//! device list; the resulting device changes are applied to the hypervisor
//! by the caller.

pub mod bus;
pub mod config_spec;
pub mod context;
pub mod device;
pub mod subresource;

pub use vdev_types;

pub use bus::{normalize_bus, BusError, BusTarget};
pub use config_spec::{apply_device_change, DeviceConfigSpec, Operation};
pub use device::{VirtualDevice, VirtualDeviceList};
pub use subresource::{Subresource, SubresourceError, SubresourceType};
