//! Launching and watching the server
//!
//! This module provides:
//! - Typed launch arguments with layered merging
//! - Command construction from a profile and an offload policy
//! - Output line classification (success pattern, failure keywords)
//! - The `LaunchMonitor` that spawns, watches and classifies one attempt

pub mod args;
pub mod command;
pub mod monitor;
pub mod process;
pub mod signals;

pub use args::{LaunchArgs, Tunable};
pub use command::LaunchCommand;
pub use monitor::{LaunchMonitor, LaunchReport, MonitorSettings, ReaderSignal};
pub use signals::{LineSignal, SignalMatcher, DEFAULT_OOM_KEYWORDS, DEFAULT_SUCCESS_PATTERN};
