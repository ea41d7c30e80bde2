//! Broker configuration
//!
//! Defines the serde schema for `config/broker.yaml`. Secrets never live in the
//! file: the database URL and provider keys are referenced by environment
//! variable name and resolved at startup.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;

use crate::ledger::AccountId;
use crate::lookup::{LookupKind, ResponseMode};

/// Longest per-request timeout a provider may be configured with.
pub const MAX_TIMEOUT_SECS: u64 = 30;

const ENDPOINT_PLACEHOLDERS: [&str; 2] = ["query", "key"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("{kind}: timeout {secs}s outside 1..={max}s", max = MAX_TIMEOUT_SECS)]
    TimeoutOutOfRange { kind: LookupKind, secs: u64 },

    #[error("{kind}: unknown endpoint placeholder {{{placeholder}}}")]
    UnknownPlaceholder {
        kind: LookupKind,
        placeholder: String,
    },

    #[error("{kind}: endpoint uses {{key}} but no key_env is set")]
    MissingKeyEnv { kind: LookupKind },

    #[error("{kind}: invalid endpoint: {reason}")]
    InvalidEndpoint { kind: LookupKind, reason: String },

    #[error("policy.{field} must be non-negative, got {value}")]
    NegativeAmount { field: &'static str, value: i64 },

    #[error("policy.report_inline_limit must be positive")]
    ZeroInlineLimit,
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub policy: PolicyConfig,

    #[serde(default)]
    pub branding: BrandingConfig,

    /// One endpoint per lookup kind; kinds without one fail as unconfigured.
    #[serde(default)]
    pub providers: BTreeMap<LookupKind, ProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Environment variable that overrides `url` when set.
    #[serde(default = "default_url_env")]
    pub url_env: Option<String>,

    #[serde(default = "default_database_url")]
    pub url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_url_env() -> Option<String> {
    Some("BROKER_DATABASE_URL".to_string())
}

fn default_database_url() -> String {
    "sqlite://broker.db".to_string()
}

fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url_env: default_url_env(),
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

impl DatabaseConfig {
    pub fn resolve_url(&self) -> String {
        self.url_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|url| !url.trim().is_empty())
            .unwrap_or_else(|| self.url.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// The super-identity: privileged, and the only caller allowed to look up
    /// protected identifiers.
    #[serde(default)]
    pub owner_id: Option<AccountId>,

    /// Additional privileged callers.
    #[serde(default)]
    pub sudo_ids: Vec<AccountId>,

    /// Contexts (e.g. group chats) where lookups are never charged.
    #[serde(default)]
    pub free_contexts: Vec<i64>,

    #[serde(default = "default_starting_balance")]
    pub starting_balance: i64,

    #[serde(default = "default_referral_bonus")]
    pub referral_bonus: i64,

    /// Rendered reports longer than this many characters go out as attachments.
    #[serde(default = "default_inline_limit")]
    pub report_inline_limit: usize,
}

fn default_starting_balance() -> i64 {
    2
}

fn default_referral_bonus() -> i64 {
    1
}

fn default_inline_limit() -> usize {
    3500
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            owner_id: None,
            sudo_ids: Vec::new(),
            free_contexts: Vec::new(),
            starting_balance: default_starting_balance(),
            referral_bonus: default_referral_bonus(),
            report_inline_limit: default_inline_limit(),
        }
    }
}

impl PolicyConfig {
    pub fn is_privileged(&self, caller: AccountId) -> bool {
        self.owner_id == Some(caller) || self.sudo_ids.contains(&caller)
    }

    pub fn is_free_context(&self, context: Option<i64>) -> bool {
        context.is_some_and(|ctx| self.free_contexts.contains(&ctx))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrandingConfig {
    #[serde(default = "default_footer")]
    pub footer: String,
}

fn default_footer() -> String {
    "── lookup-broker ──".to_string()
}

impl Default for BrandingConfig {
    fn default() -> Self {
        Self {
            footer: default_footer(),
        }
    }
}

/// Endpoint for one lookup kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// URL template; `{query}` and `{key}` are substituted URL-encoded.
    pub endpoint: String,

    /// Environment variable holding the static API key.
    #[serde(default)]
    pub key_env: Option<String>,

    /// Overrides the kind's default response mode.
    #[serde(default)]
    pub mode: Option<ResponseMode>,

    /// Overrides the kind's default timeout.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl ProviderConfig {
    pub fn response_mode(&self, kind: LookupKind) -> ResponseMode {
        self.mode.unwrap_or_else(|| kind.response_mode())
    }

    pub fn timeout(&self, kind: LookupKind) -> Duration {
        self.timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| kind.default_timeout())
    }

    /// `Ok(None)` when no key is configured; `Err(name)` when the named
    /// variable is unset or blank.
    pub fn resolve_key(&self) -> std::result::Result<Option<String>, String> {
        match &self.key_env {
            None => Ok(None),
            Some(name) => std::env::var(name)
                .ok()
                .filter(|key| !key.trim().is_empty())
                .map(Some)
                .ok_or_else(|| name.clone()),
        }
    }

    fn validate(&self, kind: LookupKind) -> Result<()> {
        if let Some(secs) = self.timeout_secs {
            if secs == 0 || secs > MAX_TIMEOUT_SECS {
                return Err(ConfigError::TimeoutOutOfRange { kind, secs });
            }
        }

        let mut uses_key = false;
        for cap in PLACEHOLDER_RE.captures_iter(&self.endpoint) {
            let name = &cap[1];
            if !ENDPOINT_PLACEHOLDERS.contains(&name) {
                return Err(ConfigError::UnknownPlaceholder {
                    kind,
                    placeholder: name.to_string(),
                });
            }
            uses_key |= name == "key";
        }
        if uses_key && self.key_env.is_none() {
            return Err(ConfigError::MissingKeyEnv { kind });
        }

        let probe = PLACEHOLDER_RE.replace_all(&self.endpoint, "x");
        let url = url::Url::parse(&probe).map_err(|e| ConfigError::InvalidEndpoint {
            kind,
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidEndpoint {
                kind,
                reason: format!("unsupported scheme {}", url.scheme()),
            });
        }
        Ok(())
    }
}

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{([^{}]*)\}").unwrap());

impl BrokerConfig {
    /// Load and validate configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    /// Load and validate configuration from a YAML string
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: BrokerConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.policy.starting_balance < 0 {
            return Err(ConfigError::NegativeAmount {
                field: "starting_balance",
                value: self.policy.starting_balance,
            });
        }
        if self.policy.referral_bonus < 0 {
            return Err(ConfigError::NegativeAmount {
                field: "referral_bonus",
                value: self.policy.referral_bonus,
            });
        }
        if self.policy.report_inline_limit == 0 {
            return Err(ConfigError::ZeroInlineLimit);
        }
        for (kind, provider) in &self.providers {
            provider.validate(*kind)?;
        }
        Ok(())
    }
}
