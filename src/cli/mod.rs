//! CLI module
//!
//! Command-line parsing and the interactive decision prompt.

pub mod args;
pub mod prompt;

pub use args::{Args, Commands, ProfileArgs, Verbosity};
pub use prompt::{parse_choice, InteractiveDecider};
