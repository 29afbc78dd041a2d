//! Command-line argument parsing
//!
//! Provides clap-based CLI with subcommands and verbosity control.

use crate::models::ModelProfile;
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

/// offloadtune - find a working GPU/CPU split for local GGUF models
#[derive(Parser, Debug)]
#[command(name = "offloadtune")]
#[command(version)]
#[command(about = "Tune tensor offloading for a local inference server", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbosity level: -q (quiet), default (normal), -v (verbose), -vv (very verbose)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode (errors only)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Tune a model by launching the server at successive offload levels
    Tune {
        model: PathBuf,
        #[command(flatten)]
        profile: ProfileArgs,
        /// Decide automatically: accept the first VRAM-ok load
        #[arg(long)]
        auto: bool,
        /// Start at this level instead of the heuristic one
        #[arg(long, allow_hyphen_values = true)]
        level: Option<i32>,
    },

    /// Launch a model with its remembered (or heuristic) configuration
    Launch {
        model: PathBuf,
        #[command(flatten)]
        profile: ProfileArgs,
        #[arg(long, allow_hyphen_values = true)]
        level: Option<i32>,
    },

    /// Print the offload ladder for a model
    Plan {
        model: PathBuf,
        #[command(flatten)]
        profile: ProfileArgs,
    },

    /// Map a tensor override selector back onto the level scale
    Classify {
        model: PathBuf,
        #[command(flatten)]
        profile: ProfileArgs,
        /// Selector text, with or without the `=CPU` suffix
        #[arg(long)]
        selector: String,
    },

    /// Show remembered launch outcomes
    History {
        /// Only this model
        #[arg(long)]
        model: Option<PathBuf>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Query the VRAM oracle
    Status,

    /// Display the resolved configuration
    Config,
}

/// Overrides for the inferred model profile
#[derive(ClapArgs, Debug, Clone, Default)]
pub struct ProfileArgs {
    /// Parameter count in billions
    #[arg(long)]
    pub size_b: Option<f64>,
    /// Quantization tag, e.g. Q4_K_M
    #[arg(long)]
    pub quant: Option<String>,
    /// Treat as mixture-of-experts
    #[arg(long)]
    pub moe: bool,
    /// Number of layers
    #[arg(long)]
    pub layers: Option<u32>,
}

impl ProfileArgs {
    pub fn apply(&self, mut profile: ModelProfile) -> ModelProfile {
        if let Some(size) = self.size_b {
            profile.size_b = Some(size);
        }
        if let Some(quant) = &self.quant {
            profile.quant = quant.clone();
        }
        if self.moe {
            profile.is_moe = true;
        }
        if let Some(layers) = self.layers {
            profile.num_layers = layers;
        }
        profile
    }
}

/// Verbosity level enum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Quiet,
    Normal,
    Verbose,
    VeryVerbose,
}

impl Args {
    pub fn verbosity(&self) -> Verbosity {
        if self.quiet {
            Verbosity::Quiet
        } else {
            match self.verbose {
                0 => Verbosity::Normal,
                1 => Verbosity::Verbose,
                _ => Verbosity::VeryVerbose,
            }
        }
    }
}

impl Verbosity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verbosity::Quiet => "quiet",
            Verbosity::Normal => "normal",
            Verbosity::Verbose => "verbose",
            Verbosity::VeryVerbose => "very_verbose",
        }
    }

    /// Check if should show progress spinners and summaries
    pub fn show_progress(&self) -> bool {
        !matches!(self, Verbosity::Quiet)
    }

    /// Check if should show detailed events
    pub fn show_events(&self) -> bool {
        matches!(self, Verbosity::Verbose | Verbosity::VeryVerbose)
    }

    /// Check if should echo server output
    pub fn show_server_output(&self) -> bool {
        matches!(self, Verbosity::VeryVerbose)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_verbosity_flags() {
        assert_eq!(parse(&["offloadtune", "status"]).verbosity(), Verbosity::Normal);
        assert_eq!(parse(&["offloadtune", "-q", "status"]).verbosity(), Verbosity::Quiet);
        assert_eq!(parse(&["offloadtune", "-v", "status"]).verbosity(), Verbosity::Verbose);
        assert_eq!(parse(&["offloadtune", "status", "-vv"]).verbosity(), Verbosity::VeryVerbose);
    }

    #[test]
    fn test_tune_with_overrides() {
        let args = parse(&[
            "offloadtune",
            "tune",
            "/m/model.gguf",
            "--size-b",
            "30",
            "--moe",
            "--auto",
            "--level",
            "-12",
        ]);
        let Commands::Tune {
            model,
            profile,
            auto,
            level,
        } = args.command
        else {
            panic!("expected tune");
        };
        assert_eq!(model, PathBuf::from("/m/model.gguf"));
        assert!(auto);
        assert_eq!(level, Some(-12));

        let base = ModelProfile::new("/m/model.gguf", None, "Q4_K_M", false, 32);
        let applied = profile.apply(base);
        assert_eq!(applied.size_b, Some(30.0));
        assert!(applied.is_moe);
        assert_eq!(applied.num_layers, 32);
    }

    #[test]
    fn test_classify_requires_selector() {
        assert!(Args::try_parse_from(["offloadtune", "classify", "/m/x.gguf"]).is_err());
        let args = parse(&["offloadtune", "classify", "/m/x.gguf", "--selector", "blk\\.\\d+\\.ffn_up=CPU"]);
        assert!(matches!(args.command, Commands::Classify { .. }));
    }

    #[test]
    fn test_history_defaults() {
        let args = parse(&["offloadtune", "history"]);
        assert!(matches!(
            args.command,
            Commands::History { model: None, limit: 20 }
        ));
    }

    #[test]
    fn test_verbosity_methods() {
        assert!(!Verbosity::Quiet.show_progress());
        assert!(Verbosity::Normal.show_progress());
        assert!(!Verbosity::Normal.show_events());
        assert!(Verbosity::Verbose.show_events());
        assert!(!Verbosity::Verbose.show_server_output());
        assert!(Verbosity::VeryVerbose.show_server_output());
    }
}
