//! Response normalizer
//!
//! Turns whatever a provider sent back into a [`CanonicalReport`]: an ordered
//! list of labelled fields grouped into sections, plus a status. Degraded input
//! never fails; it shows up as [`ReportStatus::Empty`] or
//! [`ReportStatus::MalformedSource`].
//!
//! Pipeline: decode the body into a [`Payload`], find the entry list (or the
//! single object), pull each field through its alternate keys, clean up text,
//! cap the list, assemble sections in source order.

mod fields;
pub mod payload;
mod templates;

pub use payload::{Payload, MAX_ENTRIES};

use serde::Serialize;
use std::fmt;

use crate::lookup::LookupKind;
use crate::source::RawPayload;

const RULE: &str = "━━━━━━━━━━━━━━━━━━━";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReportStatus {
    Found,
    Empty,
    MalformedSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Field {
    pub label: String,
    pub value: String,
}

impl Field {
    pub fn new(label: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Section {
    pub title: String,
    pub fields: Vec<Field>,
}

impl Section {
    pub fn new(title: impl Into<String>, fields: Vec<Field>) -> Self {
        Self {
            title: title.into(),
            fields,
        }
    }

    /// Value of the first field with this label.
    pub fn get(&self, label: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.label == label)
            .map(|f| f.value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CanonicalReport {
    pub kind: LookupKind,
    /// The sanitized query the report answers.
    pub query: String,
    pub title: String,
    pub status: ReportStatus,
    /// Fields shown above the sections, e.g. the queried number.
    pub preamble: Vec<Field>,
    pub sections: Vec<Section>,
    /// Source entries cut by the list cap.
    pub dropped: usize,
    pub footer: Option<String>,
}

impl CanonicalReport {
    pub fn new(kind: LookupKind, title: impl Into<String>) -> Self {
        Self {
            kind,
            query: String::new(),
            title: title.into(),
            status: ReportStatus::Empty,
            preamble: Vec::new(),
            sections: Vec::new(),
            dropped: 0,
            footer: None,
        }
    }

    pub fn is_found(&self) -> bool {
        self.status == ReportStatus::Found
    }

    pub fn section(&self, title: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.title == title)
    }

    /// Plain-text rendering with the footer, if any, appended once.
    pub fn render_text(&self) -> String {
        self.to_string()
    }

    fn status_line(&self) -> Option<&'static str> {
        match self.status {
            ReportStatus::Found => None,
            ReportStatus::Empty => Some(templates::empty_message(self.kind)),
            ReportStatus::MalformedSource => {
                Some("❌ The provider returned a response that could not be read.")
            }
        }
    }
}

impl fmt::Display for CanonicalReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{RULE}")?;
        writeln!(f, "{}", self.title)?;
        writeln!(f, "{RULE}")?;

        if !self.preamble.is_empty() {
            writeln!(f)?;
            for field in &self.preamble {
                writeln!(f, "{}: {}", field.label, field.value)?;
            }
        }

        if let Some(line) = self.status_line() {
            writeln!(f)?;
            writeln!(f, "{line}")?;
        }

        for section in &self.sections {
            writeln!(f)?;
            writeln!(f, "{}", section.title)?;
            for field in &section.fields {
                writeln!(f, "{}: {}", field.label, field.value)?;
            }
        }

        if self.dropped > 0 {
            writeln!(f)?;
            writeln!(f, "({} more entries not shown)", self.dropped)?;
        }

        if let Some(footer) = &self.footer {
            writeln!(f)?;
            write!(f, "{footer}")?;
        }
        Ok(())
    }
}

/// Normalize without a footer.
pub fn normalize(kind: LookupKind, query: &str, raw: &RawPayload) -> CanonicalReport {
    let payload = Payload::decode(raw);
    if let Payload::Malformed(reason) = &payload {
        tracing::debug!(%kind, %reason, "provider body is not valid JSON");
    }
    CanonicalReport {
        query: query.to_string(),
        ..templates::assemble(kind, query, &payload)
    }
}

/// Normalizer carrying the branding footer.
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    footer: Option<String>,
}

impl Normalizer {
    pub fn new(footer: impl Into<String>) -> Self {
        let footer = footer.into();
        Self {
            footer: (!footer.trim().is_empty()).then_some(footer),
        }
    }

    pub fn normalize(&self, kind: LookupKind, query: &str, raw: &RawPayload) -> CanonicalReport {
        let mut report = normalize(kind, query, raw);
        report.footer = self.footer.clone();
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_number_payload_fills_placeholders() {
        let raw = RawPayload::json(r#"{"data": {"data": [{"mobile": "9990001111"}]}}"#);
        let report = normalize(LookupKind::Number, "9990001111", &raw);

        assert_eq!(report.status, ReportStatus::Found);
        assert_eq!(report.sections.len(), 1);
        let entry = &report.sections[0];
        assert_eq!(entry.title, "NUMBER DETAILS #1");
        assert_eq!(entry.get("MOBILE"), Some("9990001111"));
        for field in entry.fields.iter().filter(|f| f.label != "MOBILE") {
            assert_eq!(field.value, "N/A", "{}", field.label);
        }
    }

    #[test]
    fn status_codes_list_does_not_hide_entries() {
        let raw = RawPayload::json(r#"{"codes": [200], "rows": [{"mobile": "9990001111"}]}"#);
        let report = normalize(LookupKind::Number, "9990001111", &raw);

        assert_eq!(report.status, ReportStatus::Found);
        assert_eq!(report.sections.len(), 1);
        assert_eq!(report.sections[0].get("MOBILE"), Some("9990001111"));
    }

    #[test]
    fn empty_list_and_object_are_empty() {
        for body in ["[]", "{}"] {
            let report = normalize(LookupKind::Number, "1", &RawPayload::json(body));
            assert_eq!(report.status, ReportStatus::Empty);
            assert!(report.sections.is_empty());
        }
    }

    #[test]
    fn invalid_json_is_malformed_not_a_panic() {
        let report = normalize(LookupKind::Aadhaar, "1", &RawPayload::json("<html>502</html>"));
        assert_eq!(report.status, ReportStatus::MalformedSource);
        assert!(report.sections.is_empty());
        assert!(report.render_text().contains("could not be read"));
    }

    #[test]
    fn footer_is_rendered_exactly_once() {
        let normalizer = Normalizer::new("-- footer --");
        let raw = RawPayload::json(r#"[{"mobile": "1"}, {"mobile": "2"}]"#);
        let text = normalizer.normalize(LookupKind::Number, "1", &raw).render_text();
        assert_eq!(text.matches("-- footer --").count(), 1);
        assert!(text.ends_with("-- footer --"));

        let empty = normalizer.normalize(LookupKind::Number, "1", &RawPayload::json("[]"));
        assert_eq!(empty.render_text().matches("-- footer --").count(), 1);
    }

    #[test]
    fn blank_footer_is_dropped() {
        let report = Normalizer::new("  ").normalize(LookupKind::Ip, "1.1.1.1", &RawPayload::text("x"));
        assert_eq!(report.footer, None);
    }

    #[test]
    fn dropped_count_is_rendered() {
        let calls: Vec<String> = (0..60).map(|i| format!(r#"{{"call_date": "d{i}"}}"#)).collect();
        let raw = RawPayload::json(format!(r#"{{"calls": [{}]}}"#, calls.join(",")));
        let report = normalize(LookupKind::CallHistory, "9990001111", &raw);
        assert_eq!(report.sections.len(), 50);
        assert_eq!(report.dropped, 10);
        assert!(report.render_text().contains("(10 more entries not shown)"));
    }
}
