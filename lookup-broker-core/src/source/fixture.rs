//! Canned source for tests and dry runs.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::{FetchFailure, RawPayload, SourceAdapter};
use crate::lookup::LookupKind;

/// Answers every fetch of a kind with the same canned result.
#[derive(Default)]
pub struct FixtureSource {
    responses: HashMap<LookupKind, Result<RawPayload, FetchFailure>>,
    calls: AtomicUsize,
    seen: Mutex<Vec<(LookupKind, String)>>,
}

impl FixtureSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_payload(mut self, kind: LookupKind, payload: RawPayload) -> Self {
        self.responses.insert(kind, Ok(payload));
        self
    }

    pub fn with_json(self, kind: LookupKind, body: &str) -> Self {
        self.with_payload(kind, RawPayload::json(body))
    }

    pub fn with_failure(mut self, kind: LookupKind, failure: FetchFailure) -> Self {
        self.responses.insert(kind, Err(failure));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every `(kind, query)` fetched so far, in order.
    pub fn seen(&self) -> Vec<(LookupKind, String)> {
        self.seen.lock().map(|seen| seen.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl SourceAdapter for FixtureSource {
    async fn fetch(&self, kind: LookupKind, query: &str) -> Result<RawPayload, FetchFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut seen) = self.seen.lock() {
            seen.push((kind, query.to_string()));
        }
        self.responses
            .get(&kind)
            .cloned()
            .unwrap_or(Err(FetchFailure::Unconfigured(kind)))
    }
}
