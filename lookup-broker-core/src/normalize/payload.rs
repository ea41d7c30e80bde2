//! Payload decoding and entry-list extraction.

use serde_json::{Map, Value};

use crate::source::RawPayload;

/// Entry lists are cut to this many source entries.
pub const MAX_ENTRIES: usize = 50;

/// Tried after a kind's own paths, in this order.
const COMMON_PATHS: [&str; 6] = ["data", "result", "results", "records", "data.data", "data.result"];

/// A provider body, classified before any field is read.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Object(Map<String, Value>),
    List(Vec<Value>),
    /// Strings, numbers, booleans, null. Text-mode bodies land here as strings.
    Scalar(Value),
    /// Not valid JSON; carries the parser message.
    Malformed(String),
}

impl Payload {
    pub fn decode(raw: &RawPayload) -> Self {
        match raw {
            RawPayload::Text(text) => Payload::Scalar(Value::String(text.clone())),
            RawPayload::Json(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => {
                Payload::Scalar(Value::Null)
            }
            RawPayload::Json(bytes) => match serde_json::from_slice::<Value>(bytes) {
                Ok(value) => Payload::from_value(value),
                Err(e) => Payload::Malformed(e.to_string()),
            },
        }
    }

    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Payload::Object(map),
            Value::Array(items) => Payload::List(items),
            other => Payload::Scalar(other),
        }
    }
}

/// Outcome of looking for the entry list of a list-shaped kind.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Entries {
    Found {
        entries: Vec<Map<String, Value>>,
        dropped: usize,
    },
    Empty,
    Malformed,
}

pub(crate) fn extract_entries(payload: &Payload, kind_paths: &[&str], core_keys: &[&str]) -> Entries {
    match payload {
        Payload::List(items) => from_list(items),
        Payload::Object(map) if map.is_empty() => Entries::Empty,
        Payload::Object(map) => {
            let by_path = kind_paths
                .iter()
                .chain(COMMON_PATHS.iter())
                .filter_map(|path| value_at_path(map, path).and_then(Value::as_array));
            let candidates: Vec<&Vec<Value>> = by_path
                .chain(map.values().filter_map(Value::as_array))
                .collect();

            if let Some(items) = candidates.iter().find(|items| holds_entries(items)) {
                return from_list(items);
            }
            if has_any_key(map, core_keys) {
                return Entries::Found {
                    entries: vec![map.clone()],
                    dropped: 0,
                };
            }
            // Only lists of scalars on offer.
            if candidates.iter().any(|items| !items.is_empty()) {
                return Entries::Malformed;
            }
            Entries::Empty
        }
        Payload::Scalar(value) if is_blank(value) => Entries::Empty,
        Payload::Scalar(_) | Payload::Malformed(_) => Entries::Malformed,
    }
}

/// A list qualifies as an entry list when an object sits within the capped window.
fn holds_entries(items: &[Value]) -> bool {
    items.iter().take(MAX_ENTRIES).any(Value::is_object)
}

fn from_list(items: &[Value]) -> Entries {
    if items.is_empty() {
        return Entries::Empty;
    }
    let dropped = items.len().saturating_sub(MAX_ENTRIES);
    let entries: Vec<_> = items
        .iter()
        .take(MAX_ENTRIES)
        .filter_map(Value::as_object)
        .cloned()
        .collect();
    if entries.is_empty() {
        return Entries::Malformed;
    }
    Entries::Found { entries, dropped }
}

/// Dotted path lookup through nested objects.
pub(crate) fn value_at_path<'a>(map: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = map.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// The object single-object kinds read from: `data` when the core keys are
/// not at the top level and `data` is an object.
pub(crate) fn unwrap_data<'a>(map: &'a Map<String, Value>, core_keys: &[&str]) -> &'a Map<String, Value> {
    if has_any_key(map, core_keys) {
        return map;
    }
    map.get("data").and_then(Value::as_object).unwrap_or(map)
}

pub(crate) fn has_any_key(map: &Map<String, Value>, keys: &[&str]) -> bool {
    keys.iter().any(|key| map.get(*key).is_some_and(|v| !is_blank(v)))
}

/// null, whitespace-only strings and empty containers.
pub(crate) fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}
