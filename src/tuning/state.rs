//! Tuning session state machine
//!
//! Valid transitions:
//! 1. Initializing → Attempting   (on: Start)
//! 2. Initializing → Abandoned    (on: Abandon)
//! 3. Attempting   → Classifying  (on: AttemptFinished)
//! 4. Classifying  → Accepted     (on: Accept)
//! 5. Classifying  → Continuing   (on: Continue)
//! 6. Classifying  → Abandoned    (on: Abandon)
//! 7. Continuing   → Attempting   (on: NextAttempt)
//! 8. Continuing   → Abandoned    (on: Abandon)
//! 9. Attempting   → Abandoned    (on: Fault)
//!
//! Accepted and Abandoned are terminal; any event from them is an error.

use crate::errors::{Result, TuneError};
use serde::{Deserialize, Serialize};

/// Controller states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TuningState {
    /// Bounds and start level being chosen
    Initializing,
    /// A server is being launched and watched
    Attempting,
    /// Waiting for the decision on a classified attempt
    Classifying,
    /// A configuration was accepted (terminal)
    Accepted,
    /// Moving on to another attempt
    Continuing,
    /// Tuning ended without acceptance (terminal)
    Abandoned,
}

/// Events driving the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TuningEvent {
    Start,
    AttemptFinished,
    Accept,
    Continue,
    NextAttempt,
    Abandon,
    Fault,
}

impl TuningState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TuningState::Accepted | TuningState::Abandoned)
    }

    /// Validated transition
    pub fn transition(&self, event: TuningEvent) -> Result<TuningState> {
        use TuningEvent::*;
        use TuningState::*;

        let next = match (self, event) {
            (Initializing, Start) => Attempting,
            (Initializing, Abandon) => Abandoned,

            (Attempting, AttemptFinished) => Classifying,
            (Attempting, Fault) => Abandoned,

            (Classifying, Accept) => Accepted,
            (Classifying, Continue) => Continuing,
            (Classifying, Abandon) => Abandoned,

            (Continuing, NextAttempt) => Attempting,
            (Continuing, Abandon) => Abandoned,

            (from, event) => {
                let reason = if from.is_terminal() {
                    "Session already finished".to_string()
                } else {
                    format!("No transition from {:?} on {:?}", from, event)
                };
                return Err(TuneError::InvalidTransition {
                    from: format!("{:?}", from),
                    to: format!("(via {:?})", event),
                    reason,
                });
            }
        };

        Ok(next)
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            TuningState::Initializing => "Initializing",
            TuningState::Attempting => "Launching",
            TuningState::Classifying => "Awaiting decision",
            TuningState::Accepted => "Accepted",
            TuningState::Continuing => "Continuing",
            TuningState::Abandoned => "Abandoned",
        }
    }
}
