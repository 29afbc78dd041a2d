//! offloadtune - main CLI entry point

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use offloadtune::cli::{Args, Commands, InteractiveDecider, ProfileArgs, Verbosity};
use offloadtune::config::TuneConfig;
use offloadtune::history::HistoryStore;
use offloadtune::launch::process::{self, TERMINATION_GRACE};
use offloadtune::launch::LaunchMonitor;
use offloadtune::models::{FilenameAnalyzer, ModelAnalyzer, ModelProfile};
use offloadtune::offload::{StrategyGenerator, TensorSelector};
use offloadtune::telemetry::{self, TelemetryCollector, TelemetryDisplay};
use offloadtune::tuning::{
    AutoDecider, ControllerSettings, DecisionSource, TuningController, TuningResult, TuningSession,
};
use offloadtune::vram::{BudgetedOracle, NvidiaSmiOracle, VramOracle};
use std::path::{Path, PathBuf};
use tokio::process::Child;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let verbosity = args.verbosity();
    telemetry::init_tracing(verbosity);

    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => TuneConfig::default_path()?,
    };
    let config = TuneConfig::load(Some(&config_path))?;

    match &args.command {
        Commands::Tune {
            model,
            profile,
            auto,
            level,
        } => {
            run_tune(&config, verbosity, model, profile, *auto, *level).await?;
        }
        Commands::Launch { model, profile, level } => {
            run_launch(&config, verbosity, model, profile, *level).await?;
        }
        Commands::Plan { model, profile } => {
            show_plan(&analyze(model, profile)?, verbosity);
        }
        Commands::Classify {
            model,
            profile,
            selector,
        } => {
            classify(&analyze(model, profile)?, selector)?;
        }
        Commands::History { model, limit } => {
            show_history(&config, model.as_deref(), *limit)?;
        }
        Commands::Status => {
            show_status(&config)?;
        }
        Commands::Config => {
            show_config(&config, &config_path)?;
        }
    }

    Ok(())
}

fn analyze(model: &Path, overrides: &ProfileArgs) -> Result<ModelProfile> {
    let analyzer = FilenameAnalyzer::new()?;
    Ok(overrides.apply(analyzer.analyze(model)))
}

fn oracle(config: &TuneConfig) -> BudgetedOracle<NvidiaSmiOracle> {
    BudgetedOracle::new(NvidiaSmiOracle::new(config.vram.gpu_index), config.vram.budget_mb)
}

fn build_controller(
    config: &TuneConfig,
    profile: &ModelProfile,
    telemetry: TelemetryCollector,
) -> Result<TuningController> {
    let history_path = config.history_path()?;
    let store = HistoryStore::open(&history_path, config.match_options())
        .with_context(|| format!("Failed to open history at {}", history_path.display()))?;

    let settings = ControllerSettings {
        executable: config.server.executable.clone(),
        base_args: config.launch_args_for(profile),
        success_pattern: config.server.success_pattern.clone(),
        oom_keywords: config.server.oom_keywords.clone(),
        heuristics: config.heuristics(),
        max_attempts: config.tuning.max_attempts,
    };

    Ok(TuningController::new(
        StrategyGenerator::default(),
        store,
        Box::new(oracle(config)),
        LaunchMonitor::new(config.monitor_settings()),
        settings,
        telemetry,
    )?)
}

fn start_session(
    controller: &mut TuningController,
    profile: ModelProfile,
    level: Option<i32>,
    verbosity: Verbosity,
) -> Result<TuningSession> {
    let (mut session, plan) = controller.start(profile)?;
    if let Some(level) = level {
        session.set_level(level);
    }

    if verbosity.show_progress() {
        println!("{} {}", "Model:".bold(), session.profile);
        for note in &plan.notes {
            println!("  {}", note.dimmed());
        }
        println!(
            "  starting at level {} of [{}..{}]",
            session.current_level().to_string().bold(),
            session.bounds.min,
            session.bounds.max
        );
    }
    Ok(session)
}

async fn run_tune(
    config: &TuneConfig,
    verbosity: Verbosity,
    model: &Path,
    overrides: &ProfileArgs,
    auto: bool,
    level: Option<i32>,
) -> Result<()> {
    let profile = analyze(model, overrides)?;
    let telemetry = TelemetryCollector::new();
    let mut controller = build_controller(config, &profile, telemetry.clone())?;
    let mut session = start_session(&mut controller, profile, level, verbosity)?;

    let mut interactive = InteractiveDecider::new(verbosity);
    let mut automatic = AutoDecider;
    let decider: &mut dyn DecisionSource = if auto { &mut automatic } else { &mut interactive };

    let result = controller.run(&mut session, decider).await;
    TelemetryDisplay::new(telemetry, verbosity).display_summary();

    match result? {
        TuningResult::Accepted { level, command, child } => {
            println!("{} level {}", "Accepted".green().bold(), level);
            println!("  {}", command);
            if let Some(child) = child {
                serve(child).await;
            }
        }
        TuningResult::Abandoned { reason, last_success } => {
            println!("{} ({})", "Tuning stopped".yellow().bold(), reason);
            if let Some(run) = last_success {
                println!("  last working level {}: {}", run.level, run.command);
            }
        }
        TuningResult::NewModelRequested => {
            println!("Run `offloadtune tune <MODEL>` with the next model.");
        }
    }
    Ok(())
}

async fn run_launch(
    config: &TuneConfig,
    verbosity: Verbosity,
    model: &Path,
    overrides: &ProfileArgs,
    level: Option<i32>,
) -> Result<()> {
    let profile = analyze(model, overrides)?;
    let mut controller = build_controller(config, &profile, TelemetryCollector::new())?;
    let session = start_session(&mut controller, profile, level, verbosity)?;

    let (command, child) = controller.launch_direct(&session)?;
    println!("{} {}", "Launched".green().bold(), command);
    serve(child).await;
    Ok(())
}

/// Keep the server in the foreground until it exits or Ctrl-C
async fn serve(mut child: Child) {
    println!("{}", "Server running; Ctrl-C stops it.".dimmed());
    let interrupted = tokio::select! {
        status = child.wait() => {
            match status {
                Ok(status) => println!("Server exited: {}", status),
                Err(e) => eprintln!("Waiting for the server failed: {}", e),
            }
            false
        }
        _ = tokio::signal::ctrl_c() => true,
    };
    if interrupted {
        println!("\nStopping server...");
        process::terminate(&mut child, TERMINATION_GRACE).await;
    }
}

fn show_plan(profile: &ModelProfile, verbosity: Verbosity) {
    let generator = StrategyGenerator::default();
    println!("{} {}\n", "Offload ladder for".bold(), profile);
    for row in generator.plan(profile) {
        let level = format!("{:>4}", row.level);
        let level = if row.is_rung { level.bold() } else { level.dimmed() };
        println!("{}  layers {:>3}  {}", level, row.gpu_layers, row.description);
        if verbosity.show_events() {
            if let Some(selector) = row.selector {
                println!("               {}", selector.dimmed());
            }
        }
    }
}

fn classify(profile: &ModelProfile, text: &str) -> Result<()> {
    let text = text.trim();
    let text = if text.ends_with("=CPU") {
        text.to_string()
    } else {
        format!("{}=CPU", text)
    };
    let selector = TensorSelector::parse(&text)?;

    let generator = StrategyGenerator::default();
    let level = generator.level_from_selector(Some(&selector), profile);
    let policy = generator.policy(profile, level);
    println!("Level {}: {}", level.to_string().bold(), generator.description(profile, level, &policy));
    Ok(())
}

fn show_history(config: &TuneConfig, model: Option<&Path>, limit: usize) -> Result<()> {
    let path = config.history_path()?;
    let store = HistoryStore::open(&path, config.match_options())?;

    let rows = match model {
        Some(model) => store.for_model(&model.to_string_lossy(), limit)?,
        None => store.recent(limit)?,
    };
    if rows.is_empty() {
        println!("No launches recorded in {}", path.display());
        return Ok(());
    }

    for row in rows {
        let name = PathBuf::from(&row.model_filepath)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| row.model_filepath.clone());
        let outcome = if row.outcome.is_success() {
            row.outcome.to_string().green()
        } else {
            row.outcome.to_string().red()
        };
        println!(
            "{}  {:<40} level {:>4}  vram {:>6}  used {:>6}  {}",
            row.timestamp.format("%Y-%m-%d %H:%M"),
            name,
            row.attempt_level,
            row.vram_at_decision_mb.map(|v| v.to_string()).unwrap_or_else(|| "-".into()),
            row.approx_vram_used_mb.map(|v| v.to_string()).unwrap_or_else(|| "-".into()),
            outcome
        );
    }

    println!();
    for (outcome, count) in store.outcome_counts()? {
        println!("  {:<28} {}", outcome.as_str(), count);
    }
    Ok(())
}

fn show_status(config: &TuneConfig) -> Result<()> {
    let snapshot = oracle(config).query()?;
    println!("{}", "VRAM".bold());
    println!("  Vendor:  {}", snapshot.vendor);
    if snapshot.has_reading() {
        println!("  Free:    {} MB", snapshot.free_mb);
        println!("  Total:   {} MB", snapshot.total_mb);
        if snapshot.budget_total_mb.is_some() {
            println!("  Budget:  {} MB free of {} MB", snapshot.budgeted_free_mb(), snapshot.budgeted_total_mb());
        }
    }
    println!("  {}", snapshot.message.dimmed());
    Ok(())
}

fn show_config(config: &TuneConfig, path: &Path) -> Result<()> {
    println!("{} {}\n", "Configuration:".bold(), path.display());
    println!("{}", toml::to_string_pretty(config).context("Failed to serialize config")?);
    println!("History: {}", config.history_path()?.display());
    Ok(())
}
