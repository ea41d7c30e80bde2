//! Field extraction tables.

use serde_json::{Map, Value};

use super::Field;

pub(crate) const NOT_AVAILABLE: &str = "N/A";
pub(crate) const FLAG_SET: &str = "✅";
pub(crate) const FLAG_UNSET: &str = "❌";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Style {
    Plain,
    /// `!` separators become `, `.
    Address,
    /// Rendered as a check or a cross; absence counts as unset.
    Flag,
}

/// One output field: a label, the alternate source keys in priority order,
/// and what to print when none of them has a value.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FieldSpec {
    pub label: &'static str,
    pub keys: &'static [&'static str],
    pub placeholder: &'static str,
    pub style: Style,
}

impl FieldSpec {
    pub const fn plain(label: &'static str, keys: &'static [&'static str]) -> Self {
        Self {
            label,
            keys,
            placeholder: NOT_AVAILABLE,
            style: Style::Plain,
        }
    }

    pub const fn address(label: &'static str, keys: &'static [&'static str]) -> Self {
        Self {
            style: Style::Address,
            ..Self::plain(label, keys)
        }
    }

    pub const fn flag(label: &'static str, keys: &'static [&'static str]) -> Self {
        Self {
            style: Style::Flag,
            ..Self::plain(label, keys)
        }
    }

    pub const fn or(self, placeholder: &'static str) -> Self {
        Self {
            placeholder,
            ..self
        }
    }

    pub fn extract(&self, entry: &Map<String, Value>) -> Field {
        Field::new(self.label, self.value(entry))
    }

    fn value(&self, entry: &Map<String, Value>) -> String {
        match self.style {
            Style::Flag => {
                let set = self
                    .keys
                    .iter()
                    .find_map(|key| entry.get(*key).filter(|v| !v.is_null()))
                    .is_some_and(is_truthy);
                flag(set).to_string()
            }
            Style::Plain => first_text(entry, self.keys).unwrap_or_else(|| self.placeholder.to_string()),
            Style::Address => first_text(entry, self.keys)
                .map(|raw| clean_address(&raw))
                .filter(|cleaned| !cleaned.is_empty())
                .unwrap_or_else(|| self.placeholder.to_string()),
        }
    }
}

pub(crate) fn flag(set: bool) -> &'static str {
    if set {
        FLAG_SET
    } else {
        FLAG_UNSET
    }
}

/// First key whose value is present, non-null and non-empty, as display text.
pub(crate) fn first_text(entry: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| entry.get(*key).and_then(value_text))
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(items) if items.is_empty() => None,
        Value::Object(map) if map.is_empty() => None,
        nested => Some(nested.to_string()),
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => {
            let s = s.trim().to_ascii_lowercase();
            !matches!(s.as_str(), "" | "false" | "no" | "n" | "0" | "off")
        }
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

pub(crate) fn clean_address(raw: &str) -> String {
    raw.replace('!', ", ")
        .trim_matches(|c: char| c == ',' || c.is_whitespace())
        .to_string()
}
