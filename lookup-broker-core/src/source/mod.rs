//! Source adapters
//!
//! A [`SourceAdapter`] turns `(kind, query)` into the provider's raw body or a
//! typed [`FetchFailure`]. Shape interpretation is left to the normalizer.

pub mod fixture;
pub mod http;

pub use fixture::FixtureSource;
pub use http::{Endpoint, HttpSourceAdapter};

use async_trait::async_trait;
use thiserror::Error;

use crate::lookup::LookupKind;

/// Provider body, read according to the endpoint's response mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawPayload {
    Json(Vec<u8>),
    Text(String),
}

impl RawPayload {
    pub fn json(body: impl Into<Vec<u8>>) -> Self {
        RawPayload::Json(body.into())
    }

    pub fn text(body: impl Into<String>) -> Self {
        RawPayload::Text(body.into())
    }

    pub fn len(&self) -> usize {
        match self {
            RawPayload::Json(bytes) => bytes.len(),
            RawPayload::Text(text) => text.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchFailure {
    #[error("provider timed out")]
    Timeout,

    #[error("provider returned status {0}")]
    Status(u16),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("could not read provider body: {0}")]
    Decode(String),

    #[error("no provider configured for {0}")]
    Unconfigured(LookupKind),
}

impl FetchFailure {
    /// Stable label for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchFailure::Timeout => "timeout",
            FetchFailure::Status(_) => "non-200-status",
            FetchFailure::Transport(_) => "transport-error",
            FetchFailure::Decode(_) => "decode-error",
            FetchFailure::Unconfigured(_) => "unconfigured",
        }
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    async fn fetch(&self, kind: LookupKind, query: &str) -> Result<RawPayload, FetchFailure>;

    /// Release pooled connections. A later fetch may reopen them.
    async fn shutdown(&self) {}
}
