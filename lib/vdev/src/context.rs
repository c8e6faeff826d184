// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-field storage of the owning virtual machine resource.
//!
//! The resource framework hands out field storage in two shapes: an apply
//! context, in which fields are written with `set`, and a diff context, in
//! which computed fields are written with `set_new`. Subresources only ever
//! need to raise the machine's restart flag, so both shapes implement
//! [`RestartFlag`] and the subresource is handed one of them at construction.

use std::cell::RefCell;
use std::collections::BTreeMap;

use serde_json::Value;

/// The field on the owning machine that records a pending restart.
pub const REBOOT_REQUIRED: &str = "reboot_required";

/// A field map, keyed by schema field name.
pub type FieldMap = BTreeMap<String, Value>;

/// Capability to mark the owning virtual machine as requiring a restart.
pub trait RestartFlag {
    fn flag_restart(&self);
}

/// Read access to a resource's top-level fields.
pub trait FieldReader {
    fn id(&self) -> &str;
    fn get(&self, key: &str) -> Option<Value>;
    fn has_change(&self, key: &str) -> bool;
}

/// Field storage during apply.
#[derive(Debug, Default)]
pub struct ResourceData {
    id: String,
    old: FieldMap,
    values: RefCell<FieldMap>,
}

impl ResourceData {
    pub fn new(id: impl Into<String>, old: FieldMap, new: FieldMap) -> Self {
        Self { id: id.into(), old, values: RefCell::new(new) }
    }

    pub fn set(&self, key: &str, value: impl Into<Value>) {
        self.values.borrow_mut().insert(key.to_owned(), value.into());
    }
}

impl FieldReader for ResourceData {
    fn id(&self) -> &str {
        &self.id
    }

    fn get(&self, key: &str) -> Option<Value> {
        self.values.borrow().get(key).cloned()
    }

    fn has_change(&self, key: &str) -> bool {
        self.old.get(key) != self.values.borrow().get(key)
    }
}

impl RestartFlag for ResourceData {
    fn flag_restart(&self) {
        self.set(REBOOT_REQUIRED, true);
    }
}

/// Field storage during plan.
#[derive(Debug, Default)]
pub struct ResourceDiff {
    id: String,
    old: FieldMap,
    new: FieldMap,
    computed: RefCell<FieldMap>,
}

impl ResourceDiff {
    pub fn new(id: impl Into<String>, old: FieldMap, new: FieldMap) -> Self {
        Self { id: id.into(), old, new, computed: RefCell::default() }
    }

    /// Sets the planned value of a computed field.
    pub fn set_new(&self, key: &str, value: impl Into<Value>) {
        self.computed.borrow_mut().insert(key.to_owned(), value.into());
    }

    pub fn get_old(&self, key: &str) -> Option<Value> {
        self.old.get(key).cloned()
    }
}

impl FieldReader for ResourceDiff {
    fn id(&self) -> &str {
        &self.id
    }

    fn get(&self, key: &str) -> Option<Value> {
        self.computed
            .borrow()
            .get(key)
            .or_else(|| self.new.get(key))
            .cloned()
    }

    fn has_change(&self, key: &str) -> bool {
        self.old.get(key) != self.get(key).as_ref()
    }
}

impl RestartFlag for ResourceDiff {
    fn flag_restart(&self) {
        self.set_new(REBOOT_REQUIRED, true);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn fields(pairs: &[(&str, Value)]) -> FieldMap {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn apply_context_flags_restart_with_set() {
        let d = ResourceData::new(
            "vm-42",
            fields(&[("memory", json!(1024))]),
            fields(&[("memory", json!(2048))]),
        );
        assert!(d.has_change("memory"));
        assert!(!d.has_change(REBOOT_REQUIRED));

        d.flag_restart();
        assert_eq!(d.get(REBOOT_REQUIRED), Some(json!(true)));
        assert!(d.has_change(REBOOT_REQUIRED));
    }

    #[test]
    fn diff_context_flags_restart_with_set_new() {
        let d = ResourceDiff::new(
            "vm-42",
            fields(&[(REBOOT_REQUIRED, json!(false))]),
            fields(&[(REBOOT_REQUIRED, json!(false))]),
        );
        assert!(!d.has_change(REBOOT_REQUIRED));

        d.flag_restart();
        assert_eq!(d.get(REBOOT_REQUIRED), Some(json!(true)));
        assert_eq!(d.get_old(REBOOT_REQUIRED), Some(json!(false)));
        assert!(d.has_change(REBOOT_REQUIRED));
        assert_eq!(d.id(), "vm-42");
    }
}
