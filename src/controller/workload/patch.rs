//! JSON merge patches computed against the last-observed object
//!
//! Workload mutations never overwrite the whole object. The driver mutates a
//! copy of what it last read, diffs the two (RFC 7386), and pins the patch to
//! the observed `resourceVersion` so a concurrent writer turns the patch into
//! a 409 Conflict instead of being silently clobbered.

use serde::Serialize;
use serde_json::{Map, Value};

/// Compute the RFC 7386 merge patch that turns `base` into `desired`
///
/// Objects are diffed key by key; removed keys become `null`; arrays and
/// scalars are replaced wholesale when they differ.
pub fn create_merge_patch(base: &Value, desired: &Value) -> Value {
    match (base, desired) {
        (Value::Object(base_map), Value::Object(desired_map)) => {
            let mut patch = Map::new();

            for (key, desired_value) in desired_map {
                match base_map.get(key) {
                    Some(base_value) if base_value == desired_value => {}
                    Some(base_value) if base_value.is_object() && desired_value.is_object() => {
                        let nested = create_merge_patch(base_value, desired_value);
                        if !is_empty_object(&nested) {
                            patch.insert(key.clone(), nested);
                        }
                    }
                    _ => {
                        patch.insert(key.clone(), desired_value.clone());
                    }
                }
            }

            for key in base_map.keys() {
                if !desired_map.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }

            Value::Object(patch)
        }
        _ => desired.clone(),
    }
}

/// Diff two typed objects and pin the result to `resource_version`
pub fn merge_patch_from<T: Serialize>(
    base: &T,
    desired: &T,
    resource_version: Option<&str>,
) -> Result<Value, serde_json::Error> {
    let base = serde_json::to_value(base)?;
    let desired = serde_json::to_value(desired)?;
    let mut patch = create_merge_patch(&base, &desired);

    if let (Some(rv), Value::Object(map)) = (resource_version, &mut patch) {
        let metadata = map
            .entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(metadata) = metadata {
            metadata.insert("resourceVersion".to_string(), Value::String(rv.to_string()));
        }
    }

    Ok(patch)
}

fn is_empty_object(value: &Value) -> bool {
    matches!(value, Value::Object(map) if map.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_identical_objects_produce_empty_patch() {
        let obj = json!({"spec": {"replicas": 3, "paused": true}});
        assert_eq!(create_merge_patch(&obj, &obj), json!({}));
    }

    #[test]
    fn test_nested_change_only_carries_changed_fields() {
        let base = json!({"metadata": {"name": "web"}, "spec": {"replicas": 3, "paused": true}});
        let desired = json!({"metadata": {"name": "web"}, "spec": {"replicas": 5, "paused": true}});

        assert_eq!(
            create_merge_patch(&base, &desired),
            json!({"spec": {"replicas": 5}})
        );
    }

    #[test]
    fn test_removed_key_becomes_null() {
        let base = json!({"spec": {"replicas": 3, "paused": true}});
        let desired = json!({"spec": {"replicas": 3}});

        assert_eq!(
            create_merge_patch(&base, &desired),
            json!({"spec": {"paused": null}})
        );
    }

    #[test]
    fn test_arrays_are_replaced_wholesale() {
        let base = json!({"metadata": {"ownerReferences": [{"uid": "a"}]}});
        let desired = json!({"metadata": {"ownerReferences": [{"uid": "a"}, {"uid": "b"}]}});

        assert_eq!(
            create_merge_patch(&base, &desired),
            json!({"metadata": {"ownerReferences": [{"uid": "a"}, {"uid": "b"}]}})
        );
    }

    #[test]
    fn test_merge_patch_from_pins_resource_version() {
        let base = json!({"spec": {"replicas": 1}});
        let desired = json!({"spec": {"replicas": 2}});

        let patch = merge_patch_from(&base, &desired, Some("42")).unwrap();
        assert_eq!(
            patch,
            json!({"metadata": {"resourceVersion": "42"}, "spec": {"replicas": 2}})
        );
    }

    #[test]
    fn test_applying_diff_reaches_desired() {
        let mut base = json!({
            "metadata": {"name": "web", "labels": {"app": "web", "tier": "fe"}},
            "spec": {"replicas": 1, "paused": true}
        });
        let desired = json!({
            "metadata": {"name": "web", "labels": {"app": "web"}},
            "spec": {"replicas": 4, "paused": false}
        });

        let patch = create_merge_patch(&base, &desired);
        json_patch::merge(&mut base, &patch);
        assert_eq!(base, desired);
    }
}
