//! Launch history
//!
//! Every attempt is persisted with its outcome so later sessions can start
//! close to a configuration that worked before.

pub mod store;
pub mod types;

pub use store::{HistoryStore, MatchOptions};
pub use types::{
    args_fingerprint, LaunchRecord, Outcome, OutcomeTag, RecordKey, RecordSummary, RememberedConfig, UnknownTag,
    Upsert, UserAction,
};
