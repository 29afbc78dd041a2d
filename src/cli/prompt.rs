//! Interactive decisions on the terminal
//!
//! Uses rustyline for input and an indicatif spinner while an attempt is
//! being monitored.

use crate::cli::Verbosity;
use crate::errors::{Result, TuneError};
use crate::history::OutcomeTag;
use crate::launch::LaunchReport;
use crate::tuning::{AttemptView, Decision, DecisionSource};
use async_trait::async_trait;
use colored::{ColoredString, Colorize};
use indicatif::{ProgressBar, ProgressStyle};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::time::Duration;

/// Lines of server output shown after a failed attempt
const FAILURE_TAIL: usize = 8;

/// Terminal-driven [`DecisionSource`]
pub struct InteractiveDecider {
    verbosity: Verbosity,
    spinner: Option<ProgressBar>,
}

impl InteractiveDecider {
    pub fn new(verbosity: Verbosity) -> Self {
        Self {
            verbosity,
            spinner: None,
        }
    }

    fn show(&self, view: &AttemptView) {
        let report = &view.report;
        println!();
        println!(
            "{} attempt {} at level {} [{}..{}]",
            outcome_label(report.outcome),
            view.attempt,
            view.level.to_string().bold(),
            view.bounds.min,
            view.bounds.max
        );
        println!("  {}", view.description.dimmed());
        println!("  took {:.1}s", report.elapsed.as_secs_f64());

        if let Some(used) = report.approx_vram_used_mb {
            let free = report.vram_after.as_ref().map(|v| v.budgeted_free_mb()).unwrap_or(0);
            println!("  VRAM used ≈ {} MB, {} MB free after load", used, free);
        }
        if let Some((keyword, line)) = &report.failure {
            println!("  matched '{}' in: {}", keyword.red(), line.trim());
        }
        if let Some(status) = &report.exit_status {
            println!("  server exited: {}", status);
        }
        if !report.is_success() && !report.tail.is_empty() {
            let start = report.tail.len().saturating_sub(FAILURE_TAIL);
            println!("  last output:");
            for line in &report.tail[start..] {
                println!("    {}", line.dimmed());
            }
        }
        if self.verbosity.show_events() {
            println!("  command: {}", view.command);
        }
        if let Some(note) = &view.note {
            println!("  {}", note.yellow());
        }
    }

    fn menu(view: &AttemptView) -> String {
        let mut items = Vec::new();
        if view.can_accept() {
            items.push("[a]ccept");
        }
        items.push("[c]ontinue");
        items.push("more [g]pu");
        items.push("more c[p]u");
        if view.can_accept() {
            items.push("[s]ave good + more gpu");
        }
        items.push("[l]aunch anyway");
        items.push("[m]enu");
        items.push("[n]ew model");
        items.push("[q]uit");
        format!("{}  (enter = {}) > ", items.join("  "), view.default_decision)
    }
}

/// Map one line of input to a decision; empty input takes `default`
pub fn parse_choice(input: &str, default: Decision) -> Option<Decision> {
    let choice = match input.trim().to_lowercase().as_str() {
        "" => default,
        "a" | "accept" => Decision::Accept,
        "c" | "continue" => Decision::Continue,
        "g" | "gpu" => Decision::MoreGpu,
        "p" | "cpu" => Decision::MoreCpu,
        "s" | "save" => Decision::SaveGoodAndMoreGpu,
        "l" | "launch" => Decision::LaunchAnyway,
        "m" | "menu" => Decision::ReturnToMenu,
        "n" | "new" => Decision::NewModel,
        "q" | "quit" | "abandon" => Decision::Abandon,
        _ => return None,
    };
    Some(choice)
}

fn outcome_label(outcome: OutcomeTag) -> ColoredString {
    let text = outcome.as_str();
    match outcome {
        OutcomeTag::SuccessLoadVramOk | OutcomeTag::SuccessUserConfirmed => text.green().bold(),
        OutcomeTag::SuccessLoadVramTight | OutcomeTag::SuccessLoadNoVramCheck => text.yellow().bold(),
        OutcomeTag::SuccessUserDirectLaunch => text.cyan().bold(),
        _ => text.red().bold(),
    }
}

async fn read_line(prompt: String) -> Result<Option<String>> {
    let joined = tokio::task::spawn_blocking(move || {
        let mut editor = DefaultEditor::new()?;
        editor.readline(&prompt)
    })
    .await
    .map_err(|e| TuneError::Generic(format!("input task failed: {}", e)))?;

    match joined {
        Ok(line) => Ok(Some(line)),
        Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => Ok(None),
        Err(err) => Err(TuneError::Generic(format!("Readline error: {}", err))),
    }
}

#[async_trait]
impl DecisionSource for InteractiveDecider {
    async fn decide(&mut self, view: &AttemptView) -> Result<Decision> {
        self.show(view);
        loop {
            let Some(line) = read_line(Self::menu(view)).await? else {
                return Ok(Decision::Abandon);
            };
            match parse_choice(&line, view.default_decision) {
                Some(decision) => return Ok(decision),
                None => println!("{}", "Unknown choice".yellow()),
            }
        }
    }

    fn attempt_started(&mut self, attempt: u32, level: i32, description: &str) {
        if !self.verbosity.show_progress() {
            return;
        }
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg} [{elapsed}]") {
            pb.set_style(style);
        }
        pb.set_message(format!("Attempt {} at level {}: {}", attempt, level, description));
        pb.enable_steady_tick(Duration::from_millis(100));
        self.spinner = Some(pb);
    }

    fn attempt_finished(&mut self, _report: &LaunchReport) {
        if let Some(pb) = self.spinner.take() {
            pb.finish_and_clear();
        }
    }
}
