//! Adaptive offload tuning
//!
//! The controller drives a [`TuningSession`] through the [`TuningState`]
//! machine, starting from a heuristic level and moving one step at a time.

pub mod controller;
pub mod heuristics;
pub mod session;
pub mod state;

pub use controller::{
    AbandonReason, AttemptView, AutoDecider, ControllerSettings, Decision, DecisionSource, TuningController,
    TuningResult,
};
pub use heuristics::{HeuristicConstants, StartPlan};
pub use session::{LevelShift, SuccessfulRun, TuningSession};
pub use state::{TuningEvent, TuningState};
