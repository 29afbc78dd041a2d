//! offloadtune - adaptive GPU/CPU offload tuning for local inference servers
//!
//! Finds a working split of model tensors between accelerator and host
//! memory by launching the server at successive offload levels, watching how
//! each attempt ends, and remembering outcomes for the next run.
//!
//! # Architecture
//!
//! - **offload**: attempt level → tensor placement policy
//! - **history**: persisted outcomes and fuzzy retrieval
//! - **launch**: command building, spawning and monitoring
//! - **tuning**: heuristics, session state and the controller loop

pub mod errors;

pub use errors::{Result, TuneError};

pub mod history;
pub mod launch;
pub mod models;
pub mod offload;
pub mod tuning;
pub mod vram;

// Interface layer
pub mod cli;
pub mod config;
pub mod telemetry;
