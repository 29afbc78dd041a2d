//! Records kept by the history store

use crate::models::ModelProfile;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Stored tag text that names no known variant
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown tag '{0}'")]
pub struct UnknownTag(pub String);

/// How one launch attempt concluded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeTag {
    /// Process could not even start
    LaunchFailedSetup,
    /// Process exited before any signal
    PrematureExit,
    /// Failure keyword matched
    OomCrash,
    /// Wall-clock exceeded with no match
    TimeoutNoSignal,
    SuccessLoadVramOk,
    SuccessLoadVramTight,
    /// Success, but no usable VRAM reading
    SuccessLoadNoVramCheck,
    SuccessUserConfirmed,
    SuccessUserDirectLaunch,
}

impl OutcomeTag {
    pub const ALL: [OutcomeTag; 9] = [
        OutcomeTag::LaunchFailedSetup,
        OutcomeTag::PrematureExit,
        OutcomeTag::OomCrash,
        OutcomeTag::TimeoutNoSignal,
        OutcomeTag::SuccessLoadVramOk,
        OutcomeTag::SuccessLoadVramTight,
        OutcomeTag::SuccessLoadNoVramCheck,
        OutcomeTag::SuccessUserConfirmed,
        OutcomeTag::SuccessUserDirectLaunch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeTag::LaunchFailedSetup => "LAUNCH_FAILED_SETUP",
            OutcomeTag::PrematureExit => "PREMATURE_EXIT",
            OutcomeTag::OomCrash => "OOM_CRASH",
            OutcomeTag::TimeoutNoSignal => "TIMEOUT_NO_SIGNAL",
            OutcomeTag::SuccessLoadVramOk => "SUCCESS_LOAD_VRAM_OK",
            OutcomeTag::SuccessLoadVramTight => "SUCCESS_LOAD_VRAM_TIGHT",
            OutcomeTag::SuccessLoadNoVramCheck => "SUCCESS_LOAD_NO_VRAM_CHECK",
            OutcomeTag::SuccessUserConfirmed => "SUCCESS_USER_CONFIRMED",
            OutcomeTag::SuccessUserDirectLaunch => "SUCCESS_USER_DIRECT_LAUNCH",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self,
            OutcomeTag::SuccessLoadVramOk
                | OutcomeTag::SuccessLoadVramTight
                | OutcomeTag::SuccessLoadNoVramCheck
                | OutcomeTag::SuccessUserConfirmed
                | OutcomeTag::SuccessUserDirectLaunch
        )
    }

    /// Outcomes that count against a level in later history lookups
    pub fn is_memory_pressure(&self) -> bool {
        matches!(self, OutcomeTag::OomCrash | OutcomeTag::SuccessLoadVramTight)
    }
}

impl FromStr for OutcomeTag {
    type Err = UnknownTag;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownTag(s.to_string()))
    }
}

impl fmt::Display for OutcomeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the operator did after seeing a classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserAction {
    MarkedAsBest,
    SavedGoodGpu,
    AcceptedTuned,
    LaunchedRisky,
    WantsMoreGpu,
    WantsMoreCpu,
    AutoAdjustCpu,
    TriedCpuAfterFail,
    ReturnedToMenu,
}

impl UserAction {
    pub const ALL: [UserAction; 9] = [
        UserAction::MarkedAsBest,
        UserAction::SavedGoodGpu,
        UserAction::AcceptedTuned,
        UserAction::LaunchedRisky,
        UserAction::WantsMoreGpu,
        UserAction::WantsMoreCpu,
        UserAction::AutoAdjustCpu,
        UserAction::TriedCpuAfterFail,
        UserAction::ReturnedToMenu,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            UserAction::MarkedAsBest => "USER_MARKED_AS_BEST",
            UserAction::SavedGoodGpu => "USER_SAVED_GOOD_GPU",
            UserAction::AcceptedTuned => "USER_ACCEPTED_TUNED",
            UserAction::LaunchedRisky => "USER_LAUNCHED_RISKY",
            UserAction::WantsMoreGpu => "USER_WANTS_MORE_GPU",
            UserAction::WantsMoreCpu => "USER_WANTS_MORE_CPU",
            UserAction::AutoAdjustCpu => "USER_AUTO_ADJUST_CPU",
            UserAction::TriedCpuAfterFail => "USER_TRIED_CPU_AFTER_FAIL",
            UserAction::ReturnedToMenu => "USER_RETURNED_TO_MENU",
        }
    }
}

impl FromStr for UserAction {
    type Err = UnknownTag;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| UnknownTag(s.to_string()))
    }
}

/// Classification plus the operator's follow-up, if any
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Outcome {
    pub base: OutcomeTag,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_action: Option<UserAction>,
}

impl Outcome {
    pub fn new(base: OutcomeTag) -> Self {
        Self {
            base,
            user_action: None,
        }
    }

    pub fn with_action(self, action: UserAction) -> Self {
        Self {
            user_action: Some(action),
            ..self
        }
    }

    pub fn is_success(&self) -> bool {
        self.base.is_success()
    }

    /// The operator kept or vouched for this config
    pub fn endorsed(&self) -> bool {
        matches!(
            self.user_action,
            Some(UserAction::MarkedAsBest)
                | Some(UserAction::SavedGoodGpu)
                | Some(UserAction::AcceptedTuned)
                | Some(UserAction::LaunchedRisky)
        )
    }

    /// The operator or the tuner moved away from this config toward CPU
    pub fn pushed_toward_cpu(&self) -> bool {
        matches!(
            self.user_action,
            Some(UserAction::AutoAdjustCpu) | Some(UserAction::TriedCpuAfterFail)
        )
    }
}

impl From<OutcomeTag> for Outcome {
    fn from(base: OutcomeTag) -> Self {
        Outcome::new(base)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.user_action {
            Some(action) => write!(f, "{} ({})", self.base, action.as_str()),
            None => write!(f, "{}", self.base),
        }
    }
}

/// Stable 64-bit FNV-1a fingerprint of a server argv, as hex
pub fn args_fingerprint(args: &[String]) -> String {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = OFFSET;
    for arg in args {
        for byte in arg.bytes().chain(std::iter::once(0u8)) {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(PRIME);
        }
    }
    format!("{:016x}", hash)
}

/// Uniqueness key of a record
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    pub model_filepath: String,
    pub vram_at_decision_mb: Option<u64>,
    pub args_fingerprint: String,
    pub attempt_level: i32,
}

/// One persisted attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchRecord {
    pub id: Uuid,
    pub model_filepath: String,
    pub model_size_b: Option<f64>,
    pub quant: String,
    pub is_moe: bool,
    /// Free VRAM when the attempt was decided; `None` without a reading
    pub vram_at_decision_mb: Option<u64>,
    pub args_fingerprint: String,
    /// Server argv (without executable) used for the attempt
    pub launch_args: Vec<String>,
    pub attempt_level: i32,
    pub outcome: Outcome,
    pub approx_vram_used_mb: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

impl LaunchRecord {
    pub fn new(
        profile: &ModelProfile,
        vram_at_decision_mb: Option<u64>,
        launch_args: Vec<String>,
        attempt_level: i32,
        outcome: Outcome,
        approx_vram_used_mb: Option<u64>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            model_filepath: profile.path_key(),
            model_size_b: profile.size_b,
            quant: profile.quant.clone(),
            is_moe: profile.is_moe,
            vram_at_decision_mb,
            args_fingerprint: args_fingerprint(&launch_args),
            launch_args,
            attempt_level,
            outcome,
            approx_vram_used_mb,
            timestamp: Utc::now(),
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey {
            model_filepath: self.model_filepath.clone(),
            vram_at_decision_mb: self.vram_at_decision_mb,
            args_fingerprint: self.args_fingerprint.clone(),
            attempt_level: self.attempt_level,
        }
    }
}

/// Result of `HistoryStore::record`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Updated,
}

/// Best prior configuration for a model
#[derive(Debug, Clone, PartialEq)]
pub struct RememberedConfig {
    pub attempt_level: i32,
    pub launch_args: Vec<String>,
    pub outcome: Outcome,
    pub approx_vram_used_mb: Option<u64>,
    pub vram_at_decision_mb: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

impl From<&LaunchRecord> for RememberedConfig {
    fn from(r: &LaunchRecord) -> Self {
        Self {
            attempt_level: r.attempt_level,
            launch_args: r.launch_args.clone(),
            outcome: r.outcome,
            approx_vram_used_mb: r.approx_vram_used_mb,
            vram_at_decision_mb: r.vram_at_decision_mb,
            timestamp: r.timestamp,
        }
    }
}

/// Condensed view of a record for listings
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordSummary {
    pub model_filepath: String,
    pub attempt_level: i32,
    pub outcome: Outcome,
    pub vram_at_decision_mb: Option<u64>,
    pub approx_vram_used_mb: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

impl From<&LaunchRecord> for RecordSummary {
    fn from(r: &LaunchRecord) -> Self {
        Self {
            model_filepath: r.model_filepath.clone(),
            attempt_level: r.attempt_level,
            outcome: r.outcome,
            vram_at_decision_mb: r.vram_at_decision_mb,
            approx_vram_used_mb: r.approx_vram_used_mb,
            timestamp: r.timestamp,
        }
    }
}
