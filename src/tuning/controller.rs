//! Tuning controller
//!
//! Walks the level scale for one model: pick a start level, launch, record
//! the outcome, ask a [`DecisionSource`] what to do, move. Every attempt is
//! persisted before the decision is requested.

use crate::errors::{Result, TuneError};
use crate::history::{HistoryStore, LaunchRecord, Outcome, OutcomeTag, RecordKey, UserAction};
use crate::launch::args::DEFAULT_PORT;
use crate::launch::{process, LaunchArgs, LaunchCommand, LaunchMonitor, LaunchReport, SignalMatcher};
use crate::models::ModelProfile;
use crate::offload::{LevelBounds, StrategyGenerator};
use crate::telemetry::{TelemetryCollector, TelemetryEvent};
use crate::tuning::heuristics::{self, HeuristicConstants, StartPlan};
use crate::tuning::session::{LevelShift, SuccessfulRun, TuningSession};
use crate::tuning::state::TuningEvent;
use crate::vram::{VramOracle, VramSnapshot};
use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::time::Instant;
use tokio::process::Child;
use tracing::{debug, info, warn};

/// Operator (or automatic) choice after a classified attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Keep the running server
    Accept,
    /// Default transition for the classification
    Continue,
    MoreGpu,
    MoreCpu,
    /// Remember this run as good, then try one step toward GPU
    SaveGoodAndMoreGpu,
    /// Keep a tight run, or start the failed config unmonitored
    LaunchAnyway,
    ReturnToMenu,
    Abandon,
    NewModel,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Decision::Accept => "accept",
            Decision::Continue => "continue",
            Decision::MoreGpu => "more GPU",
            Decision::MoreCpu => "more CPU",
            Decision::SaveGoodAndMoreGpu => "save good, more GPU",
            Decision::LaunchAnyway => "launch anyway",
            Decision::ReturnToMenu => "return to menu",
            Decision::Abandon => "abandon",
            Decision::NewModel => "new model",
        };
        f.write_str(name)
    }
}

/// What a decision source gets to see
#[derive(Debug, Clone)]
pub struct AttemptView {
    pub attempt: u32,
    pub level: i32,
    pub bounds: LevelBounds,
    pub description: String,
    pub command: LaunchCommand,
    pub report: LaunchReport,
    /// Used for empty input and by [`AutoDecider`]
    pub default_decision: Decision,
    /// Why the previous decision was not applied
    pub note: Option<String>,
}

impl AttemptView {
    pub fn can_accept(&self) -> bool {
        self.report.is_success()
    }
}

/// Supplies decisions and observes attempts
#[async_trait]
pub trait DecisionSource: Send {
    async fn decide(&mut self, view: &AttemptView) -> Result<Decision>;

    /// Called right before a monitored launch
    fn attempt_started(&mut self, _attempt: u32, _level: i32, _description: &str) {}

    /// Called once the attempt is classified
    fn attempt_finished(&mut self, _report: &LaunchReport) {}
}

/// Accepts the first VRAM-ok success, otherwise takes the default transition
#[derive(Debug, Default, Clone)]
pub struct AutoDecider;

#[async_trait]
impl DecisionSource for AutoDecider {
    async fn decide(&mut self, view: &AttemptView) -> Result<Decision> {
        Ok(view.default_decision)
    }
}

/// Why tuning ended without acceptance
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbandonReason {
    UserAbandoned,
    ReturnedToMenu,
    /// The default transition would leave the level bounds
    LimitReached { level: i32 },
    AttemptsExhausted { attempts: u32 },
}

impl fmt::Display for AbandonReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbandonReason::UserAbandoned => write!(f, "abandoned by user"),
            AbandonReason::ReturnedToMenu => write!(f, "returned to menu"),
            AbandonReason::LimitReached { level } => write!(f, "level limit {} reached", level),
            AbandonReason::AttemptsExhausted { attempts } => write!(f, "gave up after {} attempts", attempts),
        }
    }
}

/// How a tuning run ended
#[derive(Debug)]
pub enum TuningResult {
    Accepted {
        level: i32,
        command: LaunchCommand,
        /// The running server, owned by the caller from here on
        child: Option<Child>,
    },
    Abandoned {
        reason: AbandonReason,
        last_success: Option<SuccessfulRun>,
    },
    NewModelRequested,
}

/// Controller configuration
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub executable: PathBuf,
    /// Config layers already merged (builtin, global, model-specific)
    pub base_args: LaunchArgs,
    pub success_pattern: String,
    pub oom_keywords: Vec<String>,
    pub heuristics: HeuristicConstants,
    pub max_attempts: u32,
}

pub struct TuningController {
    generator: StrategyGenerator,
    store: HistoryStore,
    oracle: Box<dyn VramOracle>,
    monitor: LaunchMonitor,
    settings: ControllerSettings,
    telemetry: TelemetryCollector,
}

/// One finished attempt, as persisted
struct Attempt {
    command: LaunchCommand,
    report: LaunchReport,
    key: RecordKey,
    record: LaunchRecord,
}

enum Step {
    Shift(i32),
    Finish(TuningResult),
}

impl TuningController {
    /// Fails only when the success pattern does not compile
    pub fn new(
        generator: StrategyGenerator,
        store: HistoryStore,
        oracle: Box<dyn VramOracle>,
        monitor: LaunchMonitor,
        settings: ControllerSettings,
        telemetry: TelemetryCollector,
    ) -> Result<Self> {
        SignalMatcher::new(&settings.success_pattern, &settings.oom_keywords, 0)?;
        Ok(Self {
            generator,
            store,
            oracle,
            monitor,
            settings,
            telemetry,
        })
    }

    pub fn store(&self) -> &HistoryStore {
        &self.store
    }

    pub fn generator(&self) -> &StrategyGenerator {
        &self.generator
    }

    pub fn telemetry(&self) -> &TelemetryCollector {
        &self.telemetry
    }

    /// Bounds, start level and remembered arguments for `profile`
    pub fn start(&mut self, profile: ModelProfile) -> Result<(TuningSession, StartPlan)> {
        let bounds = self.generator.bounds(&profile);
        let vram = self.oracle.query()?;
        let c = &self.settings.heuristics;

        let mut level = heuristics::base_level(&profile, c);
        let mut notes = vec![format!("{} default start level {}", profile.class(), level)];

        let (adjusted, note) = heuristics::budget_adjusted(level, &profile, &vram, c);
        level = adjusted;
        notes.extend(note);

        let mut overrides = LaunchArgs::default();
        if let Some(remembered) = self.store.best_match(&profile, vram.free_mb)? {
            let (from_history, note) = heuristics::history_adjusted(&remembered, vram.free_mb, bounds, c);
            level = from_history;
            notes.push(note);
            match LaunchArgs::from_argv(&remembered.launch_args) {
                Ok(args) => overrides = args,
                Err(e) => warn!(error = %e, "remembered arguments ignored"),
            }
        }

        let mut session = TuningSession::new(profile, bounds, level);
        session.session_overrides = overrides;
        let level = session.current_level();

        info!(model = %session.profile.display_name(), level, "tuning session started");
        self.telemetry.record(TelemetryEvent::SessionStarted {
            model: session.profile.display_name(),
            start_level: level,
            timestamp: Instant::now(),
        });
        Ok((session, StartPlan { level, notes }))
    }

    /// Arguments for the session: config layers, then session overrides
    pub fn effective_args(&self, session: &TuningSession) -> LaunchArgs {
        self.settings.base_args.merge(&session.session_overrides)
    }

    /// Command for the session's current level
    pub fn command_for(&self, session: &TuningSession) -> LaunchCommand {
        let policy = self.generator.policy(&session.profile, session.current_level());
        LaunchCommand::build(
            &self.settings.executable,
            &session.profile,
            &self.effective_args(session),
            Some(&policy),
        )
    }

    /// Drive the session until acceptance, abandonment or a model change
    pub async fn run(&mut self, session: &mut TuningSession, decider: &mut dyn DecisionSource) -> Result<TuningResult> {
        session.advance(TuningEvent::Start)?;

        loop {
            let attempt = match self.attempt(session, decider).await {
                Ok(attempt) => attempt,
                Err(e) => {
                    self.monitor.stop().await;
                    session.advance(TuningEvent::Fault)?;
                    return Err(e);
                }
            };
            session.advance(TuningEvent::AttemptFinished)?;

            let step = match self.decide(session, decider, attempt).await {
                Ok(step) => step,
                Err(e) => {
                    self.monitor.stop().await;
                    return Err(e);
                }
            };

            match step {
                Step::Finish(result) => {
                    let event = match result {
                        TuningResult::Accepted { .. } => TuningEvent::Accept,
                        _ => TuningEvent::Abandon,
                    };
                    session.advance(event)?;
                    if let TuningResult::Abandoned { reason, .. } = &result {
                        info!(%reason, "tuning ended");
                    }
                    return Ok(result);
                }
                Step::Shift(delta) => {
                    session.advance(TuningEvent::Continue)?;
                    match session.shift_level(delta) {
                        LevelShift::Moved { from, to } => {
                            debug!(from, to, "level shift");
                            self.telemetry.record(TelemetryEvent::LevelShift {
                                from,
                                to,
                                timestamp: Instant::now(),
                            });
                        }
                        LevelShift::AtLimit { level } => {
                            self.limit_reached(level);
                            session.advance(TuningEvent::Abandon)?;
                            return Ok(TuningResult::Abandoned {
                                reason: AbandonReason::LimitReached { level },
                                last_success: session.last_successful.clone(),
                            });
                        }
                    }

                    if session.attempts >= self.settings.max_attempts {
                        warn!(attempts = session.attempts, "attempt limit reached");
                        session.advance(TuningEvent::Abandon)?;
                        return Ok(TuningResult::Abandoned {
                            reason: AbandonReason::AttemptsExhausted {
                                attempts: session.attempts,
                            },
                            last_success: session.last_successful.clone(),
                        });
                    }
                    session.advance(TuningEvent::NextAttempt)?;
                }
            }
        }
    }

    /// Launch, classify and persist one attempt at the current level
    async fn attempt(&mut self, session: &mut TuningSession, decider: &mut dyn DecisionSource) -> Result<Attempt> {
        session.attempts += 1;
        let level = session.current_level();
        let policy = self.generator.policy(&session.profile, level);
        let description = self.generator.description(&session.profile, level, &policy);
        let args = self.effective_args(session);
        let command = LaunchCommand::build(&self.settings.executable, &session.profile, &args, Some(&policy));
        let matcher = SignalMatcher::new(
            &self.settings.success_pattern,
            &self.settings.oom_keywords,
            args.port.unwrap_or(DEFAULT_PORT),
        )?;

        info!(attempt = session.attempts, level, %description, "launching");
        self.telemetry.record(TelemetryEvent::AttemptStarted {
            level,
            attempt: session.attempts,
            timestamp: Instant::now(),
        });
        decider.attempt_started(session.attempts, level, &description);

        let before = self.oracle.query()?;
        let report = self
            .monitor
            .launch_and_watch(&command, &matcher, self.oracle.as_ref(), &before)
            .await?;
        decider.attempt_finished(&report);

        self.telemetry.record(TelemetryEvent::AttemptClassified {
            level,
            outcome: report.outcome,
            approx_vram_used_mb: report.approx_vram_used_mb,
            duration_ms: report.elapsed.as_millis() as u64,
            timestamp: Instant::now(),
        });

        let record = LaunchRecord::new(
            &session.profile,
            decision_vram(&before),
            command.server_args.clone(),
            level,
            Outcome::new(report.outcome),
            report.approx_vram_used_mb,
        );
        let key = record.key();
        self.store.record(record.clone())?;

        if report.is_success() {
            session.remember_success(command.clone(), report.approx_vram_used_mb);
        }
        Ok(Attempt {
            command,
            report,
            key,
            record,
        })
    }

    /// Ask for decisions until one can be applied
    async fn decide(
        &mut self,
        session: &mut TuningSession,
        decider: &mut dyn DecisionSource,
        attempt: Attempt,
    ) -> Result<Step> {
        let outcome = attempt.report.outcome;
        let level = session.current_level();
        let policy = self.generator.policy(&session.profile, level);
        let mut view = AttemptView {
            attempt: session.attempts,
            level,
            bounds: session.bounds,
            description: self.generator.description(&session.profile, level, &policy),
            command: attempt.command.clone(),
            report: attempt.report.clone(),
            default_decision: default_decision(outcome),
            note: None,
        };

        loop {
            let decision = decider.decide(&view).await?;
            debug!(%decision, level, "decision");
            self.telemetry.record(TelemetryEvent::Decision {
                decision: decision.to_string(),
                level,
                timestamp: Instant::now(),
            });

            match decision {
                Decision::Accept if outcome.is_success() => {
                    let mut confirmed = attempt.record.clone();
                    confirmed.outcome = Outcome::new(OutcomeTag::SuccessUserConfirmed).with_action(UserAction::AcceptedTuned);
                    confirmed.timestamp = chrono::Utc::now();
                    self.store.record(confirmed)?;
                    return Ok(Step::Finish(self.accept(level, attempt.command)));
                }
                Decision::LaunchAnyway if outcome.is_success() => {
                    self.store.annotate(&attempt.key, UserAction::LaunchedRisky)?;
                    return Ok(Step::Finish(self.accept(level, attempt.command)));
                }
                Decision::Accept => {
                    view.note = Some("Only a loaded server can be accepted".to_string());
                }
                Decision::LaunchAnyway => {
                    let (command, child) = self.launch_direct(session)?;
                    return Ok(Step::Finish(TuningResult::Accepted {
                        level,
                        command,
                        child: Some(child),
                    }));
                }
                Decision::Continue => {
                    let (delta, action) = default_shift(outcome);
                    if outcome.is_success() && !session.bounds.contains(level + delta) {
                        // The loaded server stays up; only a failure ends the run at a bound
                        self.limit_reached(level);
                        view.note = Some(format!(
                            "Already at the {} limit ({}); the server is still running",
                            limit_side(delta),
                            level
                        ));
                        view.default_decision = if outcome == OutcomeTag::SuccessLoadVramTight {
                            Decision::LaunchAnyway
                        } else {
                            Decision::Accept
                        };
                        continue;
                    }
                    self.store.annotate(&attempt.key, action)?;
                    self.monitor.stop().await;
                    return Ok(Step::Shift(delta));
                }
                Decision::MoreGpu | Decision::MoreCpu | Decision::SaveGoodAndMoreGpu => {
                    if decision == Decision::SaveGoodAndMoreGpu && !outcome.is_success() {
                        view.note = Some("Only a loaded server can be saved as good".to_string());
                        continue;
                    }
                    let delta = if decision == Decision::MoreCpu { 1 } else { -1 };
                    if !session.bounds.contains(level + delta) {
                        self.limit_reached(level);
                        view.note = Some(format!("Already at the {} limit ({})", limit_side(delta), level));
                        continue;
                    }
                    let action = match decision {
                        Decision::MoreGpu => UserAction::WantsMoreGpu,
                        Decision::MoreCpu => UserAction::WantsMoreCpu,
                        _ => UserAction::SavedGoodGpu,
                    };
                    self.store.annotate(&attempt.key, action)?;
                    self.monitor.stop().await;
                    return Ok(Step::Shift(delta));
                }
                Decision::ReturnToMenu => {
                    self.store.annotate(&attempt.key, UserAction::ReturnedToMenu)?;
                    self.monitor.stop().await;
                    return Ok(Step::Finish(TuningResult::Abandoned {
                        reason: AbandonReason::ReturnedToMenu,
                        last_success: session.last_successful.clone(),
                    }));
                }
                Decision::Abandon => {
                    self.monitor.stop().await;
                    return Ok(Step::Finish(TuningResult::Abandoned {
                        reason: AbandonReason::UserAbandoned,
                        last_success: session.last_successful.clone(),
                    }));
                }
                Decision::NewModel => {
                    self.monitor.stop().await;
                    return Ok(Step::Finish(TuningResult::NewModelRequested));
                }
            }
        }
    }

    fn accept(&mut self, level: i32, command: LaunchCommand) -> TuningResult {
        let child = self.monitor.release();
        info!(level, pid = ?child.as_ref().and_then(|c| c.id()), "configuration accepted");
        TuningResult::Accepted { level, command, child }
    }

    fn limit_reached(&self, level: i32) {
        info!(level, "level limit reached");
        self.telemetry.record(TelemetryEvent::LimitReached {
            level,
            timestamp: Instant::now(),
        });
    }

    /// Start the session's current command without monitoring
    ///
    /// Recorded as a direct user launch. Fails with `MonitorBusy` while a
    /// monitored server is still alive.
    pub fn launch_direct(&mut self, session: &TuningSession) -> Result<(LaunchCommand, Child)> {
        if self.monitor.is_busy() {
            return Err(TuneError::MonitorBusy { pid: self.monitor.pid() });
        }
        let command = self.command_for(session);
        let vram = self.oracle.query()?;
        let child = process::spawn_unmonitored(&command)?;
        info!(pid = ?child.id(), command = %command, "direct launch");

        let record = LaunchRecord::new(
            &session.profile,
            decision_vram(&vram),
            command.server_args.clone(),
            session.current_level(),
            Outcome::new(OutcomeTag::SuccessUserDirectLaunch),
            None,
        );
        self.store.record(record)?;
        Ok((command, child))
    }

    /// Stop whatever the monitor still holds
    pub async fn shutdown(&mut self) {
        self.monitor.stop().await;
    }
}

/// Hardware free VRAM, when there is a reading
fn decision_vram(snapshot: &VramSnapshot) -> Option<u64> {
    snapshot.has_reading().then_some(snapshot.free_mb)
}

fn limit_side(delta: i32) -> &'static str {
    if delta < 0 {
        "GPU"
    } else {
        "CPU"
    }
}

/// Decision offered by default for a classification
pub fn default_decision(outcome: OutcomeTag) -> Decision {
    match outcome {
        OutcomeTag::SuccessLoadVramOk | OutcomeTag::SuccessLoadNoVramCheck => Decision::Accept,
        _ => Decision::Continue,
    }
}

/// Level delta and recorded action of the default transition
pub fn default_shift(outcome: OutcomeTag) -> (i32, UserAction) {
    match outcome {
        OutcomeTag::SuccessLoadVramOk
        | OutcomeTag::SuccessLoadNoVramCheck
        | OutcomeTag::SuccessUserConfirmed
        | OutcomeTag::SuccessUserDirectLaunch => (-1, UserAction::WantsMoreGpu),
        OutcomeTag::SuccessLoadVramTight => (1, UserAction::AutoAdjustCpu),
        OutcomeTag::OomCrash
        | OutcomeTag::PrematureExit
        | OutcomeTag::TimeoutNoSignal
        | OutcomeTag::LaunchFailedSetup => (1, UserAction::TriedCpuAfterFail),
    }
}
