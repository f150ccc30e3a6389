//! Dotted-path access into JSON values.
//!
//! Paths are dot separated keys; numeric segments index arrays
//! (`contained.0.id`). An empty segment applied to an array maps the rest of
//! the path over every element, so `entry..resource` yields the list of
//! entry resources.

use serde_json::{Map, Value};

/// Reads the value at `path`.
///
/// An empty path returns the whole value. Returns `None` when any segment is
/// missing. The result is owned because `..` segments build new arrays.
#[must_use]
pub fn get_path(value: &Value, path: &str) -> Option<Value> {
    let path = path.trim();
    if path.is_empty() {
        return Some(value.clone());
    }
    let segments: Vec<&str> = path.split('.').collect();
    walk(value, &segments)
}

fn walk(value: &Value, segments: &[&str]) -> Option<Value> {
    let Some((key, rest)) = segments.split_first() else {
        return Some(value.clone());
    };

    if key.is_empty()
        && let Value::Array(items) = value
    {
        return Some(Value::Array(
            items
                .iter()
                .map(|item| walk(item, rest).unwrap_or(Value::Null))
                .collect(),
        ));
    }

    child(value, key).and_then(|next| walk(next, rest))
}

fn child<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    match value {
        Value::Object(map) => map.get(key),
        Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    }
}

/// Writes `new_value` at `path`.
///
/// Intermediate containers are created only when `create_empty` is set: an
/// array when the following segment is numeric, an object otherwise. Writing
/// past the end of an array pads it with `null`. Returns `false` when the
/// path could not be reached.
pub fn set_path(target: &mut Value, path: &str, new_value: Value, create_empty: bool) -> bool {
    let segments: Vec<&str> = path.trim().split('.').collect();
    let Some((last, parents)) = segments.split_last() else {
        return false;
    };

    let mut current = target;
    for (idx, key) in parents.iter().enumerate() {
        let next_is_index = segments[idx + 1].parse::<usize>().is_ok();
        let Some(next) = child_mut(current, key, create_empty, next_is_index) else {
            return false;
        };
        current = next;
    }

    match current {
        Value::Object(map) => {
            map.insert((*last).to_string(), new_value);
            true
        }
        Value::Array(items) => match last.parse::<usize>() {
            Ok(i) => {
                if i >= items.len() {
                    items.resize(i + 1, Value::Null);
                }
                items[i] = new_value;
                true
            }
            Err(_) => false,
        },
        _ => false,
    }
}

fn child_mut<'a>(
    value: &'a mut Value,
    key: &str,
    create_empty: bool,
    next_is_index: bool,
) -> Option<&'a mut Value> {
    let empty = || {
        if next_is_index {
            Value::Array(Vec::new())
        } else {
            Value::Object(Map::new())
        }
    };

    match value {
        Value::Object(map) => {
            if create_empty && !map.contains_key(key) {
                map.insert(key.to_string(), empty());
            }
            map.get_mut(key)
        }
        Value::Array(items) => {
            let i = key.parse::<usize>().ok()?;
            if create_empty && i >= items.len() {
                items.resize(i + 1, Value::Null);
            }
            let slot = items.get_mut(i)?;
            if create_empty && slot.is_null() {
                *slot = empty();
            }
            Some(slot)
        }
        _ => None,
    }
}
