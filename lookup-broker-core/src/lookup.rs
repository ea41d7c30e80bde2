//! Lookup kinds
//!
//! The closed set of lookups the broker can route, with the per-kind facts the
//! rest of the crate keys off: response mode, premium flag, default timeout and
//! query sanitation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// How a provider's body is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseMode {
    Json,
    Text,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupKind {
    Number,
    Upi,
    Ip,
    Telegram,
    Pakistan,
    Aadhaar,
    AadhaarFamily,
    CallHistory,
}

impl LookupKind {
    pub const ALL: [LookupKind; 8] = [
        LookupKind::Number,
        LookupKind::Upi,
        LookupKind::Ip,
        LookupKind::Telegram,
        LookupKind::Pakistan,
        LookupKind::Aadhaar,
        LookupKind::AadhaarFamily,
        LookupKind::CallHistory,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LookupKind::Number => "number",
            LookupKind::Upi => "upi",
            LookupKind::Ip => "ip",
            LookupKind::Telegram => "telegram",
            LookupKind::Pakistan => "pakistan",
            LookupKind::Aadhaar => "aadhaar",
            LookupKind::AadhaarFamily => "aadhaar_family",
            LookupKind::CallHistory => "call_history",
        }
    }

    /// Premium kinds are never paid for out of the generic balance.
    pub fn is_premium(&self) -> bool {
        matches!(self, LookupKind::CallHistory)
    }

    pub fn response_mode(&self) -> ResponseMode {
        match self {
            LookupKind::Ip => ResponseMode::Text,
            _ => ResponseMode::Json,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        match self {
            LookupKind::CallHistory => Duration::from_secs(20),
            _ => Duration::from_secs(15),
        }
    }

    /// Normalize a raw query the way providers expect it.
    pub fn sanitize_query(&self, raw: &str) -> String {
        let trimmed = raw.trim();
        match self {
            LookupKind::Number => strip_whitespace(trimmed)
                .trim_start_matches("+91")
                .replace('+', ""),
            LookupKind::Pakistan
            | LookupKind::Aadhaar
            | LookupKind::AadhaarFamily
            | LookupKind::CallHistory => strip_whitespace(trimmed),
            LookupKind::Telegram => trimmed.replace('@', ""),
            LookupKind::Upi | LookupKind::Ip => trimmed.to_string(),
        }
    }
}

fn strip_whitespace(s: &str) -> String {
    s.chars().filter(|c| !c.is_whitespace()).collect()
}

impl fmt::Display for LookupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown lookup kind: {0}")]
pub struct UnknownLookupKind(pub String);

impl FromStr for LookupKind {
    type Err = UnknownLookupKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "number" | "num" => Ok(LookupKind::Number),
            "upi" => Ok(LookupKind::Upi),
            "ip" => Ok(LookupKind::Ip),
            "telegram" | "tg" => Ok(LookupKind::Telegram),
            "pakistan" | "pak" => Ok(LookupKind::Pakistan),
            "aadhaar" | "aadhar" => Ok(LookupKind::Aadhaar),
            "aadhaar_family" | "aadhar_family" | "aadhar2fam" => Ok(LookupKind::AadhaarFamily),
            "call_history" | "callhis" => Ok(LookupKind::CallHistory),
            other => Err(UnknownLookupKind(other.to_string())),
        }
    }
}
