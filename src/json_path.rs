//! Dotted-path access into dynamic JSON values
//!
//! Free-form trees (tool parameter schemas, provider payloads, the config knob
//! bag) are plain `serde_json::Value`s. Paths are dotted, and a segment that
//! parses as an integer indexes into arrays: `choices.0.delta.content`.
//! Bracketed indices (`choices[0].delta`) are accepted too.

use serde_json::{Map, Value};

#[derive(Clone, Debug, PartialEq, Eq)]
enum PathSeg {
    Key(String),
    Index(usize),
}

fn parse_path(path: &str) -> Vec<PathSeg> {
    let mut segs = Vec::new();
    for part in path.split('.') {
        if part.is_empty() {
            continue;
        }
        let (key, rest) = match part.find('[') {
            Some(pos) => (&part[..pos], &part[pos..]),
            None => (part, ""),
        };
        if !key.is_empty() {
            // A bare numeric segment is an index; object keys that look
            // numeric are still reachable because `get` falls back to a key lookup.
            match key.parse::<usize>() {
                Ok(i) => segs.push(PathSeg::Index(i)),
                Err(_) => segs.push(PathSeg::Key(key.to_string())),
            }
        }
        for idx in rest.split('[').filter(|s| !s.is_empty()) {
            if let Ok(i) = idx.trim_end_matches(']').parse::<usize>() {
                segs.push(PathSeg::Index(i));
            }
        }
    }
    segs
}

/// Read the value at `path`, or `None` if any segment is missing or mistyped.
pub fn get_nested_value<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cur = value;
    for seg in parse_path(path) {
        cur = match (seg, cur) {
            (PathSeg::Key(k), Value::Object(map)) => map.get(&k)?,
            (PathSeg::Index(i), Value::Array(arr)) => arr.get(i)?,
            (PathSeg::Index(i), Value::Object(map)) => map.get(&i.to_string())?,
            _ => return None,
        };
    }
    Some(cur)
}

pub fn get_str<'a>(value: &'a Value, path: &str) -> Option<&'a str> {
    get_nested_value(value, path).and_then(Value::as_str)
}

pub fn get_u64(value: &Value, path: &str) -> Option<u64> {
    get_nested_value(value, path).and_then(Value::as_u64)
}

/// Write `new_value` at `path`, creating intermediate objects as needed.
///
/// Arrays are never grown; writing past the end of an array, or through a
/// scalar, returns `false` and leaves the tree untouched.
pub fn set_nested_value(value: &mut Value, path: &str, new_value: Value) -> bool {
    let segs = parse_path(path);
    let Some((last, parents)) = segs.split_last() else {
        return false;
    };

    let mut cur = value;
    for seg in parents {
        cur = match seg {
            PathSeg::Key(k) => {
                if cur.is_null() {
                    *cur = Value::Object(Map::new());
                }
                let Value::Object(map) = cur else {
                    return false;
                };
                map.entry(k.clone())
                    .or_insert_with(|| Value::Object(Map::new()))
            }
            PathSeg::Index(i) => match cur {
                Value::Array(arr) => match arr.get_mut(*i) {
                    Some(v) => v,
                    None => return false,
                },
                _ => return false,
            },
        };
    }

    match (last, cur) {
        (PathSeg::Key(k), slot) => {
            if slot.is_null() {
                *slot = Value::Object(Map::new());
            }
            match slot {
                Value::Object(map) => {
                    map.insert(k.clone(), new_value);
                    true
                }
                _ => false,
            }
        }
        (PathSeg::Index(i), Value::Array(arr)) => match arr.get_mut(*i) {
            Some(slot) => {
                *slot = new_value;
                true
            }
            None => false,
        },
        _ => false,
    }
}
