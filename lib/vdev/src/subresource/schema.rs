// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Field schemas for each kind of subresource, value normalization, and
//! structural hashing.

use serde_json::{Number, Value};
use xxhash_rust::xxh3::Xxh3;

use crate::context::FieldMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldType {
    Bool,
    Int,
    Float,
    String,
    List,
    Map,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FieldDefault {
    None,
    Bool(bool),
    Int(i64),
    Str(&'static str),
}

impl FieldDefault {
    fn to_value(self) -> Value {
        match self {
            FieldDefault::None => Value::Null,
            FieldDefault::Bool(b) => Value::Bool(b),
            FieldDefault::Int(i) => Value::from(i),
            FieldDefault::Str(s) => Value::from(s),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Field {
    pub name: &'static str,
    pub ty: FieldType,
    pub default: FieldDefault,
}

const fn field(name: &'static str, ty: FieldType) -> Field {
    Field { name, ty, default: FieldDefault::None }
}

const fn field_or(
    name: &'static str,
    ty: FieldType,
    default: FieldDefault,
) -> Field {
    Field { name, ty, default }
}

/// The ordered set of fields a subresource carries.
#[derive(Debug)]
pub struct Schema {
    fields: &'static [Field],
}

impl Schema {
    pub fn fields(&self) -> &'static [Field] {
        self.fields
    }

    pub fn field(&self, name: &str) -> Option<&'static Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Hashes `data` field by field in schema order. Fields absent from
    /// `data` hash as their default; fields outside the schema are ignored.
    pub fn hash(&self, data: &FieldMap) -> u64 {
        let mut hasher = Xxh3::new();
        for f in self.fields {
            let value = data
                .get(f.name)
                .cloned()
                .unwrap_or_else(|| f.default.to_value());
            hasher.update(f.name.as_bytes());
            hasher.update(b"=");
            // Object keys serialize sorted, so equal values encode equally.
            hasher.update(value.to_string().as_bytes());
            hasher.update(b";");
        }
        hasher.digest()
    }
}

/// Normalizes a value before it is stored for field `ty`, returning `None`
/// if nothing remains to store.
///
/// Nulls vanish (recursively inside lists and maps), integral floats become
/// integers, and strings holding a number or boolean are coerced when the
/// field is typed as such.
pub fn normalize_value(ty: Option<FieldType>, value: Value) -> Option<Value> {
    match (ty, value) {
        (_, Value::Null) => None,
        (Some(FieldType::Int), Value::String(s)) => {
            match s.trim().parse::<i64>() {
                Ok(i) => Some(Value::from(i)),
                Err(_) => Some(Value::String(s)),
            }
        }
        (Some(FieldType::Float), Value::String(s)) => {
            match s.trim().parse::<f64>().ok().and_then(Number::from_f64) {
                Some(n) => normalize_value(ty, Value::Number(n)),
                None => Some(Value::String(s)),
            }
        }
        (Some(FieldType::Bool), Value::String(s)) => match s.as_str() {
            "true" => Some(Value::Bool(true)),
            "false" => Some(Value::Bool(false)),
            _ => Some(Value::String(s)),
        },
        (_, Value::Number(n)) => Some(Value::Number(normalize_number(n))),
        (_, Value::Array(items)) => Some(Value::Array(
            items
                .into_iter()
                .filter_map(|v| normalize_value(None, v))
                .collect(),
        )),
        (_, Value::Object(map)) => Some(Value::Object(
            map.into_iter()
                .filter_map(|(k, v)| normalize_value(None, v).map(|v| (k, v)))
                .collect(),
        )),
        (_, v) => Some(v),
    }
}

fn normalize_number(n: Number) -> Number {
    match n.as_f64() {
        Some(f)
            if n.is_f64()
                && f.fract() == 0.0
                && f >= i64::MIN as f64
                && f <= i64::MAX as f64 =>
        {
            Number::from(f as i64)
        }
        _ => n,
    }
}

const KEY: Field = field(super::KEY_FIELD, FieldType::Int);
const DEVICE_ADDRESS: Field =
    field(super::DEVICE_ADDRESS_FIELD, FieldType::String);

pub static DISK_SCHEMA: Schema = Schema {
    fields: &[
        KEY,
        DEVICE_ADDRESS,
        field("label", FieldType::String),
        field("path", FieldType::String),
        field("size", FieldType::Int),
        field_or("unit_number", FieldType::Int, FieldDefault::Int(0)),
        field_or(
            "controller_type",
            FieldType::String,
            FieldDefault::Str("scsi"),
        ),
        field("datastore_id", FieldType::String),
        field_or(
            "disk_mode",
            FieldType::String,
            FieldDefault::Str("persistent"),
        ),
        field_or("thin_provisioned", FieldType::Bool, FieldDefault::Bool(true)),
        field_or("eagerly_scrub", FieldType::Bool, FieldDefault::Bool(false)),
        field_or("keep_on_remove", FieldType::Bool, FieldDefault::Bool(false)),
        field_or("attach", FieldType::Bool, FieldDefault::Bool(false)),
        field_or("io_limit", FieldType::Int, FieldDefault::Int(-1)),
        field_or("io_reservation", FieldType::Int, FieldDefault::Int(0)),
        field_or(
            "io_share_level",
            FieldType::String,
            FieldDefault::Str("normal"),
        ),
        field_or("io_share_count", FieldType::Int, FieldDefault::Int(0)),
        field("storage_policy_id", FieldType::String),
        field("uuid", FieldType::String),
    ],
};

pub static NETWORK_INTERFACE_SCHEMA: Schema = Schema {
    fields: &[
        KEY,
        DEVICE_ADDRESS,
        field("network_id", FieldType::String),
        field_or(
            "adapter_type",
            FieldType::String,
            FieldDefault::Str("vmxnet3"),
        ),
        field_or("use_static_mac", FieldType::Bool, FieldDefault::Bool(false)),
        field("mac_address", FieldType::String),
        field_or("bandwidth_limit", FieldType::Int, FieldDefault::Int(-1)),
        field_or("bandwidth_reservation", FieldType::Int, FieldDefault::Int(0)),
        field_or(
            "bandwidth_share_level",
            FieldType::String,
            FieldDefault::Str("normal"),
        ),
        field_or("bandwidth_share_count", FieldType::Int, FieldDefault::Int(0)),
        field("ovf_mapping", FieldType::String),
    ],
};

pub static CDROM_SCHEMA: Schema = Schema {
    fields: &[
        KEY,
        DEVICE_ADDRESS,
        field("datastore_id", FieldType::String),
        field("path", FieldType::String),
        field_or("client_device", FieldType::Bool, FieldDefault::Bool(false)),
    ],
};

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn nulls_are_dropped() {
        assert_eq!(normalize_value(None, Value::Null), None);
        assert_eq!(
            normalize_value(None, json!({"a": null, "b": [1, null, 2]})),
            Some(json!({"b": [1, 2]}))
        );
    }

    #[test]
    fn numeric_coercions() {
        assert_eq!(normalize_value(None, json!(4.0)), Some(json!(4)));
        assert_eq!(normalize_value(None, json!(4.5)), Some(json!(4.5)));
        assert_eq!(
            normalize_value(Some(FieldType::Int), json!(" 32 ")),
            Some(json!(32))
        );
        assert_eq!(
            normalize_value(Some(FieldType::Int), json!("lots")),
            Some(json!("lots"))
        );
        assert_eq!(
            normalize_value(Some(FieldType::Float), json!("2.0")),
            Some(json!(2))
        );
        assert_eq!(
            normalize_value(Some(FieldType::Bool), json!("true")),
            Some(json!(true))
        );
        // Strings are left alone when the field is not numeric.
        assert_eq!(
            normalize_value(Some(FieldType::String), json!("32")),
            Some(json!("32"))
        );
    }

    #[test]
    fn hash_tracks_every_field() {
        let mut data = FieldMap::new();
        data.insert("label".to_owned(), json!("disk0"));
        data.insert("size".to_owned(), json!(32));
        let base = DISK_SCHEMA.hash(&data);
        assert_eq!(base, DISK_SCHEMA.hash(&data.clone()));

        for f in DISK_SCHEMA.fields() {
            let mut changed = data.clone();
            let value = match f.ty {
                FieldType::Bool => json!(!matches!(
                    f.default,
                    FieldDefault::Bool(true)
                )),
                FieldType::Int | FieldType::Float => json!(12345),
                _ => json!("changed"),
            };
            changed.insert(f.name.to_owned(), value);
            assert_ne!(
                DISK_SCHEMA.hash(&changed),
                base,
                "changing {} did not change the hash",
                f.name
            );
        }
    }

    #[test]
    fn hash_ignores_fields_outside_schema() {
        let mut data = FieldMap::new();
        data.insert("path".to_owned(), json!("/iso/install.iso"));
        let base = CDROM_SCHEMA.hash(&data);
        data.insert("size".to_owned(), json!(12));
        assert_eq!(CDROM_SCHEMA.hash(&data), base);
    }
}
