//! Tuning telemetry
//!
//! Structured events collected over one CLI run, a colored end-of-run
//! summary, and the `tracing` subscriber setup.

use crate::cli::Verbosity;
use crate::history::OutcomeTag;
use colored::Colorize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// Telemetry event types
#[derive(Debug, Clone)]
pub enum TelemetryEvent {
    SessionStarted {
        model: String,
        start_level: i32,
        timestamp: Instant,
    },
    AttemptStarted {
        level: i32,
        attempt: u32,
        timestamp: Instant,
    },
    AttemptClassified {
        level: i32,
        outcome: OutcomeTag,
        approx_vram_used_mb: Option<u64>,
        duration_ms: u64,
        timestamp: Instant,
    },
    LevelShift {
        from: i32,
        to: i32,
        timestamp: Instant,
    },
    LimitReached {
        level: i32,
        timestamp: Instant,
    },
    Decision {
        decision: String,
        level: i32,
        timestamp: Instant,
    },
}

/// Telemetry statistics
#[derive(Debug, Clone, Default)]
pub struct TelemetryStats {
    pub sessions: usize,
    pub attempts: usize,
    pub successes: usize,
    pub memory_failures: usize,
    pub timeouts: usize,
    pub other_failures: usize,
    pub level_shifts: usize,
    pub limits_reached: usize,
    pub decisions: usize,
    /// Total wall-clock time spent inside monitored attempts
    pub attempt_time_ms: u64,
}

/// Telemetry collector
#[derive(Debug, Clone)]
pub struct TelemetryCollector {
    events: Arc<Mutex<Vec<TelemetryEvent>>>,
    stats: Arc<Mutex<TelemetryStats>>,
    start_time: Instant,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl TelemetryCollector {
    pub fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            stats: Arc::new(Mutex::new(TelemetryStats::default())),
            start_time: Instant::now(),
        }
    }

    /// Record an event
    pub fn record(&self, event: TelemetryEvent) {
        {
            let mut stats = lock(&self.stats);
            match &event {
                TelemetryEvent::SessionStarted { .. } => stats.sessions += 1,
                TelemetryEvent::AttemptStarted { .. } => stats.attempts += 1,
                TelemetryEvent::AttemptClassified {
                    outcome, duration_ms, ..
                } => {
                    stats.attempt_time_ms += duration_ms;
                    match outcome {
                        o if o.is_success() => stats.successes += 1,
                        OutcomeTag::TimeoutNoSignal => stats.timeouts += 1,
                        OutcomeTag::OomCrash | OutcomeTag::PrematureExit => stats.memory_failures += 1,
                        _ => stats.other_failures += 1,
                    }
                }
                TelemetryEvent::LevelShift { .. } => stats.level_shifts += 1,
                TelemetryEvent::LimitReached { .. } => stats.limits_reached += 1,
                TelemetryEvent::Decision { .. } => stats.decisions += 1,
            }
        }

        lock(&self.events).push(event);
    }

    pub fn get_stats(&self) -> TelemetryStats {
        lock(&self.stats).clone()
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn event_count(&self) -> usize {
        lock(&self.events).len()
    }

    /// Last `n` events, oldest first
    pub fn recent_events(&self, n: usize) -> Vec<TelemetryEvent> {
        let events = lock(&self.events);
        let start = events.len().saturating_sub(n);
        events[start..].to_vec()
    }

    /// Fraction of classified attempts that loaded
    pub fn success_rate(&self) -> f64 {
        let stats = lock(&self.stats);
        let total = stats.successes + stats.memory_failures + stats.timeouts + stats.other_failures;
        if total == 0 {
            0.0
        } else {
            stats.successes as f64 / total as f64
        }
    }

    /// Levels tried, in attempt order
    pub fn levels_tried(&self) -> Vec<i32> {
        lock(&self.events)
            .iter()
            .filter_map(|e| match e {
                TelemetryEvent::AttemptStarted { level, .. } => Some(*level),
                _ => None,
            })
            .collect()
    }
}

impl Default for TelemetryCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// End-of-run summary printer
pub struct TelemetryDisplay {
    collector: TelemetryCollector,
    verbosity: Verbosity,
}

impl TelemetryDisplay {
    pub fn new(collector: TelemetryCollector, verbosity: Verbosity) -> Self {
        Self { collector, verbosity }
    }

    pub fn display_summary(&self) {
        if !self.verbosity.show_progress() {
            return;
        }
        let stats = self.collector.get_stats();
        if stats.attempts == 0 {
            return;
        }

        println!("\n{}", "Tuning summary".bold());
        println!("─────────────────────────────────────");
        println!("Duration:          {:.1?}", self.collector.elapsed());
        println!("Attempts:          {}", stats.attempts);
        println!(
            "Loaded:            {}  ({:.0}%)",
            stats.successes.to_string().green(),
            self.collector.success_rate() * 100.0
        );
        println!("Out of memory:     {}", stats.memory_failures.to_string().red());
        println!("Timed out:         {}", stats.timeouts.to_string().yellow());
        if stats.other_failures > 0 {
            println!("Other failures:    {}", stats.other_failures);
        }
        println!("Time in attempts:  {:.1}s", stats.attempt_time_ms as f64 / 1000.0);
        if stats.limits_reached > 0 {
            println!("Level limits hit:  {}", stats.limits_reached);
        }

        if self.should_show_details() {
            let levels: Vec<String> = self.collector.levels_tried().iter().map(|l| l.to_string()).collect();
            println!("Levels tried:      {}", levels.join(" → "));
        }
        println!();
    }

    pub fn should_show_details(&self) -> bool {
        self.verbosity.show_events()
    }
}

/// Install the global `tracing` subscriber
///
/// `RUST_LOG` wins over the verbosity flags. Server output lines live under
/// the `server` target at trace level and show up with `-vv`.
pub fn init_tracing(verbosity: Verbosity) {
    let default = match verbosity {
        Verbosity::Quiet => "error",
        Verbosity::Normal => "warn",
        Verbosity::Verbose => "offloadtune=debug,info",
        Verbosity::VeryVerbose => "offloadtune=trace,server=trace,debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    // Ignore a second initialisation (tests, embedding)
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbosity.show_events())
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classified(outcome: OutcomeTag, ms: u64) -> TelemetryEvent {
        TelemetryEvent::AttemptClassified {
            level: 0,
            outcome,
            approx_vram_used_mb: None,
            duration_ms: ms,
            timestamp: Instant::now(),
        }
    }

    #[test]
    fn test_collector_creation() {
        let collector = TelemetryCollector::new();
        assert_eq!(collector.event_count(), 0);
        assert_eq!(collector.get_stats().attempts, 0);
        assert_eq!(collector.success_rate(), 0.0);
    }

    #[test]
    fn test_classification_counters() {
        let collector = TelemetryCollector::new();
        collector.record(classified(OutcomeTag::SuccessLoadVramOk, 1200));
        collector.record(classified(OutcomeTag::OomCrash, 300));
        collector.record(classified(OutcomeTag::PrematureExit, 100));
        collector.record(classified(OutcomeTag::TimeoutNoSignal, 60_000));
        collector.record(classified(OutcomeTag::LaunchFailedSetup, 0));

        let stats = collector.get_stats();
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.memory_failures, 2);
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.other_failures, 1);
        assert_eq!(stats.attempt_time_ms, 61_600);
        assert!((collector.success_rate() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_levels_tried_in_order() {
        let collector = TelemetryCollector::new();
        for (attempt, level) in [(1, -10), (2, -9), (3, -10)] {
            collector.record(TelemetryEvent::AttemptStarted {
                level,
                attempt,
                timestamp: Instant::now(),
            });
        }
        collector.record(TelemetryEvent::LimitReached {
            level: 10,
            timestamp: Instant::now(),
        });
        assert_eq!(collector.levels_tried(), vec![-10, -9, -10]);
        assert_eq!(collector.get_stats().attempts, 3);
        assert_eq!(collector.get_stats().limits_reached, 1);
    }

    #[test]
    fn test_recent_events() {
        let collector = TelemetryCollector::new();
        for i in 0..10 {
            collector.record(TelemetryEvent::LevelShift {
                from: i,
                to: i + 1,
                timestamp: Instant::now(),
            });
        }
        let recent = collector.recent_events(3);
        assert_eq!(recent.len(), 3);
        assert!(matches!(recent[2], TelemetryEvent::LevelShift { from: 9, .. }));
    }

    #[test]
    fn test_clones_share_state() {
        let collector = TelemetryCollector::new();
        let other = collector.clone();
        other.record(TelemetryEvent::Decision {
            decision: "Accept".into(),
            level: -3,
            timestamp: Instant::now(),
        });
        assert_eq!(collector.get_stats().decisions, 1);
    }
}
