//! lookup-broker-core
//!
//! Request brokering for an information-lookup service: a credit ledger with
//! access control, an entitlement gate, provider adapters, and a normalizer
//! that turns loosely-shaped provider responses into canonical reports.
//!
//! Data flow per request:
//!
//! ```text
//! transport -> Dispatcher -> EntitlementGate (allow/deny + debit)
//!                         -> SourceAdapter (fetch)
//!                         -> Normalizer (shape) -> transport
//! ```

pub mod config;
pub mod dispatcher;
pub mod gate;
pub mod ledger;
pub mod lookup;
pub mod normalize;
pub mod source;

pub use config::{BrokerConfig, ConfigError, PolicyConfig};
pub use dispatcher::{
    attachment_name, classify_input, Delivery, DispatchError, Dispatcher, LookupOutcome,
    LookupRequest, OnboardOutcome,
};
pub use gate::{Decision, DenyReason, EntitlementGate, GateError, GateRequest};
pub use ledger::{
    Account, AccountId, BalanceMode, BalanceOutcome, InsertOutcome, LedgerError, LedgerStats,
    LedgerStore, MemoryLedger, RedeemOutcome, SqliteLedger,
};
pub use lookup::{LookupKind, ResponseMode};
pub use normalize::{normalize, CanonicalReport, Field, Normalizer, ReportStatus, Section};
pub use source::{FetchFailure, FixtureSource, HttpSourceAdapter, RawPayload, SourceAdapter};
