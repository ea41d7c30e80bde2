//! Per-kind report templates.

use serde_json::{Map, Value};

use super::fields::{first_text, FieldSpec, NOT_AVAILABLE};
use super::payload::{extract_entries, has_any_key, is_blank, unwrap_data, Entries, Payload, MAX_ENTRIES};
use super::{CanonicalReport, Field, ReportStatus, Section};
use crate::lookup::LookupKind;

/// A list-shaped kind: entries found anywhere in the payload, one section each.
struct ListTemplate {
    title: &'static str,
    entry_title: &'static str,
    /// Searched before the common candidate paths.
    paths: &'static [&'static str],
    /// A bare object carrying one of these is treated as a single entry.
    core_keys: &'static [&'static str],
    /// Preamble label for the query itself.
    echo_query: Option<&'static str>,
    fields: &'static [FieldSpec],
}

const NUMBER: ListTemplate = ListTemplate {
    title: "NUMBER TO INFO RESULT",
    entry_title: "NUMBER DETAILS",
    paths: &[],
    core_keys: &["mobile", "name", "id_number", "address"],
    echo_query: None,
    fields: &[
        FieldSpec::plain("MOBILE", &["mobile"]),
        FieldSpec::plain("ALT MOBILE", &["alt_mobile", "alt"]),
        FieldSpec::plain("NAME", &["name"]),
        FieldSpec::plain("FATHER NAME", &["father_name", "fname"]),
        FieldSpec::address("ADDRESS", &["address"]),
        FieldSpec::plain("CIRCLE", &["circle"]),
        FieldSpec::plain("ID", &["id"]),
        FieldSpec::plain("ID NUMBER", &["id_number"]),
        FieldSpec::plain("EMAIL", &["email"]),
    ],
};

const AADHAAR: ListTemplate = ListTemplate {
    title: "AADHAAR TO INFO RESULT",
    entry_title: "AADHAAR ENTRY",
    paths: &[],
    core_keys: &["mobile", "name", "id_number", "address"],
    echo_query: None,
    fields: &[
        FieldSpec::plain("NAME", &["name"]),
        FieldSpec::plain("FATHER", &["father_name", "fname"]),
        FieldSpec::plain("MOBILE", &["mobile"]),
        FieldSpec::plain("ALT MOBILE", &["alt_mobile", "alt"]),
        FieldSpec::address("ADDRESS", &["address"]),
        FieldSpec::plain("CIRCLE", &["circle"]),
        FieldSpec::plain("ID", &["id"]),
        FieldSpec::plain("ID NUMBER", &["id_number"]),
        FieldSpec::plain("EMAIL", &["email"]),
    ],
};

const PAKISTAN: ListTemplate = ListTemplate {
    title: "PAKISTAN NUMBER TO INFO RESULT",
    entry_title: "RESULT",
    paths: &["results"],
    core_keys: &["Name", "name", "CNIC", "cnic", "Mobile", "mobile"],
    echo_query: None,
    fields: &[
        FieldSpec::plain("NAME", &["Name", "name"]),
        FieldSpec::plain("CNIC", &["CNIC", "cnic"]),
        FieldSpec::plain("MOBILE", &["Mobile", "mobile"]),
        FieldSpec::address("ADDRESS", &["Address", "address"]).or("Not Available"),
    ],
};

const CALL_HISTORY: ListTemplate = ListTemplate {
    title: "CALL HISTORY RESULT",
    entry_title: "CALL",
    paths: &["calls", "history"],
    core_keys: &["call_date", "caller_number", "receiver_number", "call_type"],
    echo_query: Some("NUMBER"),
    fields: &[
        FieldSpec::plain("DATE", &["call_date", "date", "time", "callDate"]),
        FieldSpec::plain("CATEGORY", &["call_category", "category"]),
        FieldSpec::plain("TYPE", &["call_type", "type"]),
        FieldSpec::plain("STATUS", &["call_status", "status"]),
        FieldSpec::plain("CALLER", &["caller_number", "caller", "caller_no"]),
        FieldSpec::plain("RECEIVER", &["receiver_number", "receiver", "receiver_no"]),
        FieldSpec::plain("DURATION", &["duration", "call_duration"]),
        FieldSpec::plain("CHARGE", &["call_charge", "charge", "cost"]),
    ],
};

const UPI_BANK: &[FieldSpec] = &[
    FieldSpec::plain("ADDRESS", &["ADDRESS"]),
    FieldSpec::plain("BANK", &["BANK"]),
    FieldSpec::plain("BANKCODE", &["BANKCODE"]),
    FieldSpec::plain("BRANCH", &["BRANCH"]),
    FieldSpec::plain("CENTRE", &["CENTRE"]),
    FieldSpec::plain("CITY", &["CITY"]),
    FieldSpec::plain("DISTRICT", &["DISTRICT"]),
    FieldSpec::plain("STATE", &["STATE"]),
    FieldSpec::plain("IFSC", &["IFSC"]),
    FieldSpec::plain("MICR", &["MICR"]),
    FieldSpec::flag("IMPS", &["IMPS"]),
    FieldSpec::flag("NEFT", &["NEFT"]),
    FieldSpec::flag("RTGS", &["RTGS"]),
    FieldSpec::flag("UPI", &["UPI"]),
    FieldSpec::plain("SWIFT", &["SWIFT"]),
];

const FAMILY_CARD: &[FieldSpec] = &[
    FieldSpec::plain("DISTRICT", &["homeDistName"]),
    FieldSpec::plain("STATE", &["homeStateName"]),
    FieldSpec::plain("FPS ID", &["fpsId"]),
];

const TELEGRAM_STATS: &[FieldSpec] = &[
    FieldSpec::plain("TOTAL GROUPS", &["total_groups"]).or("0"),
    FieldSpec::plain("ADMIN IN GROUPS", &["adm_in_groups"]).or("0"),
    FieldSpec::plain("TOTAL MESSAGES", &["total_msg_count"]).or("0"),
    FieldSpec::plain("MESSAGES IN GROUPS", &["msg_in_groups_count"]).or("0"),
    FieldSpec::plain("FIRST MSG DATE", &["first_msg_date"]),
    FieldSpec::plain("LAST MSG DATE", &["last_msg_date"]),
    FieldSpec::plain("NAME CHANGES", &["names_count"]).or("0"),
    FieldSpec::plain("USERNAME CHANGES", &["usernames_count"]).or("0"),
];

const UPI_KEYS: &[&str] = &["bank_details_raw", "vpa_details"];
const FAMILY_KEYS: &[&str] = &["rcId", "schemeName", "memberDetailsList", "members"];
const TELEGRAM_KEYS: &[&str] = &["first_name", "name", "id", "user_id"];

pub(crate) fn assemble(kind: LookupKind, query: &str, payload: &Payload) -> CanonicalReport {
    match kind {
        LookupKind::Number => list_report(&NUMBER, kind, query, payload),
        LookupKind::Aadhaar => list_report(&AADHAAR, kind, query, payload),
        LookupKind::Pakistan => list_report(&PAKISTAN, kind, query, payload),
        LookupKind::CallHistory => list_report(&CALL_HISTORY, kind, query, payload),
        LookupKind::Upi => upi_report(query, payload),
        LookupKind::AadhaarFamily => family_report(payload),
        LookupKind::Telegram => telegram_report(payload),
        LookupKind::Ip => ip_report(payload),
    }
}

pub(crate) fn empty_message(kind: LookupKind) -> &'static str {
    match kind {
        LookupKind::Number | LookupKind::Pakistan => "❌ No information found for this number.",
        LookupKind::Aadhaar => "❌ No information found for this Aadhaar.",
        LookupKind::AadhaarFamily => "❌ No family information found.",
        LookupKind::CallHistory => "❌ No call history found.",
        LookupKind::Telegram => "❌ No information found for this user.",
        LookupKind::Upi => "❌ No information found for this UPI ID.",
        LookupKind::Ip => "❌ No information found for this IP.",
    }
}

fn title_for(kind: LookupKind) -> &'static str {
    match kind {
        LookupKind::Number => NUMBER.title,
        LookupKind::Aadhaar => AADHAAR.title,
        LookupKind::Pakistan => PAKISTAN.title,
        LookupKind::CallHistory => CALL_HISTORY.title,
        LookupKind::Upi => "UPI TO INFO RESULT",
        LookupKind::AadhaarFamily => "AADHAAR FAMILY INFO RESULT",
        LookupKind::Telegram => "TELEGRAM USER STATS",
        LookupKind::Ip => "IP TO INFO RESULT",
    }
}

fn list_report(
    template: &ListTemplate,
    kind: LookupKind,
    query: &str,
    payload: &Payload,
) -> CanonicalReport {
    let mut report = CanonicalReport::new(kind, template.title);
    if let Some(label) = template.echo_query {
        report.preamble.push(Field::new(label, query));
    }

    match extract_entries(payload, template.paths, template.core_keys) {
        Entries::Found { entries, dropped } => {
            report.sections = entries
                .iter()
                .enumerate()
                .map(|(idx, entry)| {
                    Section::new(
                        format!("{} #{}", template.entry_title, idx + 1),
                        template.fields.iter().map(|spec| spec.extract(entry)).collect(),
                    )
                })
                .collect();
            report.dropped = dropped;
            report.status = ReportStatus::Found;
        }
        Entries::Empty => report.status = ReportStatus::Empty,
        Entries::Malformed => report.status = ReportStatus::MalformedSource,
    }
    report
}

fn text_or_na(map: &Map<String, Value>, keys: &[&str]) -> String {
    first_text(map, keys).unwrap_or_else(|| NOT_AVAILABLE.to_string())
}

/// The top-level object of a single-object kind, or the status to report.
fn single_object(payload: &Payload) -> Result<&Map<String, Value>, ReportStatus> {
    match payload {
        Payload::Object(map) if map.is_empty() => Err(ReportStatus::Empty),
        Payload::Object(map) => Ok(map),
        Payload::List(items) if items.is_empty() => Err(ReportStatus::Empty),
        Payload::Scalar(value) if is_blank(value) => Err(ReportStatus::Empty),
        Payload::List(_) | Payload::Scalar(_) | Payload::Malformed(_) => {
            Err(ReportStatus::MalformedSource)
        }
    }
}

fn status_only(kind: LookupKind, status: ReportStatus) -> CanonicalReport {
    CanonicalReport {
        status,
        ..CanonicalReport::new(kind, title_for(kind))
    }
}

fn upi_report(query: &str, payload: &Payload) -> CanonicalReport {
    let kind = LookupKind::Upi;
    let map = match single_object(payload) {
        Ok(map) => unwrap_data(map, UPI_KEYS),
        Err(status) => return status_only(kind, status),
    };

    let bank = map.get("bank_details_raw").and_then(Value::as_object);
    let vpa = map.get("vpa_details").and_then(Value::as_object);
    if bank.is_none() && vpa.is_none() {
        return status_only(kind, ReportStatus::Empty);
    }

    let none = Map::new();
    let bank = bank.unwrap_or(&none);
    let vpa = vpa.unwrap_or(&none);

    let holder = vec![
        Field::new("NAME", text_or_na(vpa, &["name"])),
        Field::new("VPA", first_text(vpa, &["vpa"]).unwrap_or_else(|| query.to_string())),
    ];

    let mut report = CanonicalReport::new(kind, title_for(kind));
    report.sections = vec![
        Section::new("BANK DETAILS", UPI_BANK.iter().map(|spec| spec.extract(bank)).collect()),
        Section::new("ACCOUNT HOLDER", holder),
    ];
    report.status = ReportStatus::Found;
    report
}

fn family_report(payload: &Payload) -> CanonicalReport {
    let kind = LookupKind::AadhaarFamily;
    let map = match single_object(payload) {
        Ok(map) => unwrap_data(map, FAMILY_KEYS),
        Err(status) => return status_only(kind, status),
    };
    if !has_any_key(map, FAMILY_KEYS) {
        return status_only(kind, ReportStatus::Empty);
    }

    let mut card = vec![
        Field::new("RC ID", text_or_na(map, &["rcId"])),
        Field::new(
            "SCHEME",
            format!("{} ({})", text_or_na(map, &["schemeName"]), text_or_na(map, &["schemeId"])),
        ),
    ];
    card.extend(FAMILY_CARD.iter().map(|spec| spec.extract(map)));

    let members: &[Value] = ["memberDetailsList", "members"]
        .iter()
        .find_map(|key| map.get(*key).and_then(Value::as_array))
        .map(Vec::as_slice)
        .unwrap_or_default();

    let listed: Vec<Field> = members
        .iter()
        .take(MAX_ENTRIES)
        .filter_map(Value::as_object)
        .enumerate()
        .map(|(idx, member)| {
            let name = first_text(member, &["memberName", "member_name"]);
            let relation = first_text(member, &["releationship_name", "relationship"]);
            Field::new(
                format!("#{}", idx + 1),
                format!(
                    "{} — {}",
                    name.as_deref().unwrap_or(NOT_AVAILABLE),
                    relation.as_deref().unwrap_or(NOT_AVAILABLE)
                ),
            )
        })
        .collect();

    let mut report = CanonicalReport::new(kind, title_for(kind));
    report.sections = vec![
        Section::new("CARD", card),
        Section::new("FAMILY MEMBERS", listed),
    ];
    report.dropped = members.len().saturating_sub(MAX_ENTRIES);
    report.status = ReportStatus::Found;
    report
}

fn telegram_report(payload: &Payload) -> CanonicalReport {
    let kind = LookupKind::Telegram;
    let map = match single_object(payload) {
        Ok(map) => map,
        Err(status) => return status_only(kind, status),
    };
    if map.get("success") == Some(&Value::Bool(false)) {
        return status_only(kind, ReportStatus::Empty);
    }

    let user = map.get("data").and_then(Value::as_object).unwrap_or(map);
    if !has_any_key(user, TELEGRAM_KEYS) {
        return status_only(kind, ReportStatus::Empty);
    }

    let first = text_or_na(user, &["first_name", "name"]);
    let name = match first_text(user, &["last_name", "surname"]) {
        Some(last) => format!("{first} {last}"),
        None => first,
    };

    let info = vec![
        Field::new("NAME", name),
        Field::new("USER ID", text_or_na(user, &["id", "user_id"])),
        FieldSpec::flag("IS BOT", &["is_bot"]).extract(user),
        FieldSpec::flag("ACTIVE", &["is_active"]).extract(user),
    ];

    let mut report = CanonicalReport::new(kind, title_for(kind));
    report.sections = vec![
        Section::new("USER INFO", info),
        Section::new("STATS", TELEGRAM_STATS.iter().map(|spec| spec.extract(user)).collect()),
    ];
    report.status = ReportStatus::Found;
    report
}

fn ip_report(payload: &Payload) -> CanonicalReport {
    let kind = LookupKind::Ip;
    let fields = match payload {
        Payload::Scalar(Value::String(text)) if !text.trim().is_empty() => {
            vec![Field::new("INFO", text.trim())]
        }
        Payload::Scalar(value @ (Value::Number(_) | Value::Bool(_))) => {
            vec![Field::new("INFO", value.to_string())]
        }
        // A JSON-mode provider override: keep its keys in provider order.
        Payload::Object(map) if !map.is_empty() => map
            .iter()
            .map(|(key, _)| Field::new(key.to_ascii_uppercase(), text_or_na(map, &[key.as_str()])))
            .collect(),
        other => {
            let status = single_object(other).err().unwrap_or(ReportStatus::Empty);
            return status_only(kind, status);
        }
    };

    let mut report = CanonicalReport::new(kind, title_for(kind));
    report.sections = vec![Section::new("RESULT", fields)];
    report.status = ReportStatus::Found;
    report
}
