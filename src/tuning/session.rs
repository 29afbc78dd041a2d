//! Per-model tuning session

use crate::launch::{LaunchArgs, LaunchCommand};
use crate::models::ModelProfile;
use crate::offload::LevelBounds;
use crate::tuning::state::{TuningEvent, TuningState};
use crate::errors::Result;
use tracing::debug;

/// Result of a level move
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelShift {
    Moved { from: i32, to: i32 },
    /// The move would leave the bounds; nothing changed
    AtLimit { level: i32 },
}

/// Last attempt that loaded
#[derive(Debug, Clone, PartialEq)]
pub struct SuccessfulRun {
    pub level: i32,
    pub command: LaunchCommand,
    pub approx_vram_used_mb: Option<u64>,
}

/// Mutable tuning state for one model, owned by the controller loop
#[derive(Debug, Clone)]
pub struct TuningSession {
    pub profile: ModelProfile,
    pub bounds: LevelBounds,
    current_level: i32,
    /// Arguments layered last, on top of config defaults
    pub session_overrides: LaunchArgs,
    pub last_successful: Option<SuccessfulRun>,
    pub attempts: u32,
    state: TuningState,
}

impl TuningSession {
    pub fn new(profile: ModelProfile, bounds: LevelBounds, start_level: i32) -> Self {
        Self {
            profile,
            bounds,
            current_level: bounds.clamp(start_level),
            session_overrides: LaunchArgs::default(),
            last_successful: None,
            attempts: 0,
            state: TuningState::Initializing,
        }
    }

    pub fn current_level(&self) -> i32 {
        self.current_level
    }

    pub fn state(&self) -> TuningState {
        self.state
    }

    /// Apply a state machine event
    pub fn advance(&mut self, event: TuningEvent) -> Result<TuningState> {
        let next = self.state.transition(event)?;
        debug!(from = ?self.state, to = ?next, ?event, "session transition");
        self.state = next;
        Ok(next)
    }

    /// Move by `delta`; a move past `min`/`max` is a reported no-op
    pub fn shift_level(&mut self, delta: i32) -> LevelShift {
        let from = self.current_level;
        let target = from.saturating_add(delta);
        if delta == 0 || !self.bounds.contains(target) {
            return LevelShift::AtLimit { level: from };
        }
        self.current_level = target;
        LevelShift::Moved { from, to: target }
    }

    /// Jump to an explicit level, clamped
    pub fn set_level(&mut self, level: i32) {
        self.current_level = self.bounds.clamp(level);
    }

    pub fn remember_success(&mut self, command: LaunchCommand, approx_vram_used_mb: Option<u64>) {
        self.last_successful = Some(SuccessfulRun {
            level: self.current_level,
            command,
            approx_vram_used_mb,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(start: i32) -> TuningSession {
        let profile = ModelProfile::new("m.gguf", Some(30.0), "Q4_K_M", true, 48);
        TuningSession::new(profile, LevelBounds::MOE, start)
    }

    #[test]
    fn test_start_level_is_clamped() {
        assert_eq!(session(-40).current_level(), -25);
        assert_eq!(session(25).current_level(), 10);
        assert_eq!(session(-10).state(), TuningState::Initializing);
    }

    #[test]
    fn test_shift_within_bounds() {
        let mut s = session(-10);
        assert_eq!(s.shift_level(1), LevelShift::Moved { from: -10, to: -9 });
        assert_eq!(s.shift_level(-2), LevelShift::Moved { from: -9, to: -11 });
        assert_eq!(s.current_level(), -11);
    }

    #[test]
    fn test_shift_past_limits_is_noop() {
        let mut s = session(10);
        assert_eq!(s.shift_level(1), LevelShift::AtLimit { level: 10 });
        assert_eq!(s.current_level(), 10);

        let mut s = session(-25);
        assert_eq!(s.shift_level(-1), LevelShift::AtLimit { level: -25 });
    }

    #[test]
    fn test_advance_validates_transitions() {
        let mut s = session(0);
        assert!(s.advance(TuningEvent::Accept).is_err());
        assert_eq!(s.state(), TuningState::Initializing);
        assert_eq!(s.advance(TuningEvent::Start).unwrap(), TuningState::Attempting);
    }
}
