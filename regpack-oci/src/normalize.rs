//! Image config normalization for the `docker load` archive format.
//!
//! Registries hand out configs whose mapping fields are sometimes encoded as
//! `[]` or missing entirely.  Strict loaders want `{}` for every mapping and
//! a few fields to be present.  Normalization is pure and idempotent: the
//! archive names the config file after the SHA-256 of the normalized bytes.

use serde_json::{Map, Value};

/// Top-level sections that carry a container configuration.
const SECTIONS: [&str; 2] = ["config", "container_config"];

/// Mapping fields whose values are always erased to `{}`.
const VALUE_ERASED_FIELDS: [&str; 2] = ["ExposedPorts", "Volumes"];

/// Rewrite `config` into the shape the archive format expects.
///
/// For both `config` and `container_config` (when they are objects):
/// `ExposedPorts` and `Volumes` keep their keys but every value becomes
/// `{}`, and an empty `Labels` becomes `{}`.  Under `config` only, a
/// missing `Labels` is added as `{}` and a missing or null `OnBuild` is set
/// to `[]`.
pub fn normalize(mut config: Value) -> Value {
    let Some(root) = config.as_object_mut() else {
        return config;
    };

    for section in SECTIONS {
        if let Some(Value::Object(obj)) = root.get_mut(section) {
            for field in VALUE_ERASED_FIELDS {
                if let Some(value) = obj.get_mut(field) {
                    erase_values(value);
                }
            }
            if let Some(labels) = obj.get_mut("Labels") {
                if is_empty_collection(labels) {
                    *labels = Value::Object(Map::new());
                }
            }
        }
    }

    let section = root.entry("config").or_insert(Value::Null);
    if section.is_null() {
        *section = Value::Object(Map::new());
    }
    if let Value::Object(obj) = section {
        if obj.get("Labels").map_or(true, Value::is_null) {
            obj.insert("Labels".to_string(), Value::Object(Map::new()));
        }
        if obj.get("OnBuild").map_or(true, Value::is_null) {
            obj.insert("OnBuild".to_string(), Value::Array(Vec::new()));
        }
    }

    config
}

/// Serialize a config exactly as it is written into the archive.
/// `serde_json` never escapes `/`, and key order is preserved.
pub fn to_archive_bytes(config: &Value) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(config)
}

/// The `rootfs.diff_ids` of an image config, in layer order.  Missing or
/// malformed entries yield an empty list.
pub fn diff_ids(config: &Value) -> Vec<String> {
    config
        .pointer("/rootfs/diff_ids")
        .and_then(Value::as_array)
        .map(|ids| {
            ids.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Replace every value of a mapping with `{}`.  A list (the empty-mapping
/// encoding some producers emit) is turned into a mapping keyed by its
/// string elements.  Anything else is left alone.
fn erase_values(value: &mut Value) {
    let keys: Vec<String> = match value {
        Value::Object(map) => map.keys().cloned().collect(),
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => return,
    };

    let mut erased = Map::new();
    for key in keys {
        erased.insert(key, Value::Object(Map::new()));
    }
    *value = Value::Object(erased);
}

fn is_empty_collection(value: &Value) -> bool {
    match value {
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
