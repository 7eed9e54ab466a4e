// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Dotted/bracketed path grammar shared by the template resolver and the
//! `ResumeTask` dotted-field setter.
//!
//! `path := segment ( ('.' segment) | ('[' int ']') )*` where `segment` is
//! an identifier. Both `.`-separated names and `[N]` list indices are
//! accepted, uniformly, so `a.b` and `a[0].b` resolve the same way.

use serde_json::Value;

/// One step of a parsed path: either a named object key, or a list index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

/// Splits a dotted/bracketed path into its segments.
///
/// `a.b[0].c` -> `[Key("a"), Key("b"), Index(0), Key("c")]`.
pub fn parse(path: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = path.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '.' => {
                if !current.is_empty() {
                    segments.push(Segment::Key(std::mem::take(&mut current)));
                }
            }
            '[' => {
                if !current.is_empty() {
                    segments.push(Segment::Key(std::mem::take(&mut current)));
                }
                let mut digits = String::new();
                for d in chars.by_ref() {
                    if d == ']' {
                        break;
                    }
                    digits.push(d);
                }
                if let Ok(idx) = digits.parse::<usize>() {
                    segments.push(Segment::Index(idx));
                }
            }
            other => current.push(other),
        }
    }
    if !current.is_empty() {
        segments.push(Segment::Key(current));
    }
    segments
}

/// Reads the value reached by applying `path` to `root`.
///
/// Returns `None` if any intermediate segment is missing or type-mismatched
/// (object segment against an array, index segment against an object, or
/// out-of-bounds index).
pub fn get<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    get_by_segments(root, &parse(path))
}

/// Same as [`get`] but takes already-parsed segments, for callers that need
/// to split the step-id segment from the rest of the path themselves.
pub fn get_by_segments<'a>(root: &'a Value, segments: &[Segment]) -> Option<&'a Value> {
    let mut current = root;
    for segment in segments {
        current = match (segment, current) {
            (Segment::Key(k), Value::Object(map)) => map.get(k)?,
            (Segment::Index(i), Value::Array(arr)) => arr.get(*i)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Writes `value` at `path` under `root`, creating intermediate objects and
/// arrays as needed. Used by `ResumeTask`'s dotted-field setter.
pub fn set(root: &mut Value, path: &str, value: Value) {
    let segments = parse(path);
    set_segments(root, &segments, value);
}

fn set_segments(root: &mut Value, segments: &[Segment], value: Value) {
    let Some((head, rest)) = segments.split_first() else {
        *root = value;
        return;
    };

    match head {
        Segment::Key(key) => {
            if !root.is_object() {
                *root = Value::Object(serde_json::Map::new());
            }
            let map = root.as_object_mut().expect("just ensured object");
            let entry = map
                .entry(key.clone())
                .or_insert_with(|| default_container(rest));
            set_segments(entry, rest, value);
        }
        Segment::Index(idx) => {
            if !root.is_array() {
                *root = Value::Array(Vec::new());
            }
            let arr = root.as_array_mut().expect("just ensured array");
            while arr.len() <= *idx {
                arr.push(Value::Null);
            }
            if arr[*idx].is_null() {
                arr[*idx] = default_container(rest);
            }
            set_segments(&mut arr[*idx], rest, value);
        }
    }
}

fn default_container(rest: &[Segment]) -> Value {
    match rest.first() {
        Some(Segment::Index(_)) => Value::Array(Vec::new()),
        Some(Segment::Key(_)) => Value::Object(serde_json::Map::new()),
        None => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_dotted_and_bracketed() {
        assert_eq!(
            parse("a.b[0].c"),
            vec![
                Segment::Key("a".into()),
                Segment::Key("b".into()),
                Segment::Index(0),
                Segment::Key("c".into()),
            ]
        );
    }

    #[test]
    fn get_nested_value() {
        let root = json!({"output": [{"_id": "f1"}, {"_id": "f2"}]});
        assert_eq!(
            get(&root, "output[0]._id"),
            Some(&Value::String("f1".into()))
        );
    }

    #[test]
    fn get_missing_intermediate_is_none() {
        let root = json!({"output": []});
        assert_eq!(get(&root, "output[0]._id"), None);
    }

    #[test]
    fn set_creates_intermediate_maps() {
        let mut root = Value::Null;
        set(&mut root, "source", json!("Acme"));
        assert_eq!(root, json!({"source": "Acme"}));
    }

    #[test]
    fn set_creates_intermediate_arrays() {
        let mut root = Value::Null;
        set(&mut root, "items[1].name", json!("widget"));
        assert_eq!(root, json!({"items": [null, {"name": "widget"}]}));
    }
}
