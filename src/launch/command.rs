//! Server command construction

use crate::history::args_fingerprint;
use crate::launch::args::LaunchArgs;
use crate::models::ModelProfile;
use crate::offload::OffloadPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::process::Stdio;

/// Interpreter used for script executables
const PYTHON: &str = "python3";

/// Fully built server invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchCommand {
    pub program: String,
    /// Arguments preceding the server arguments (the script path for `.py`)
    pub prefix: Vec<String>,
    /// Server arguments, `--model` first
    pub server_args: Vec<String>,
}

impl LaunchCommand {
    /// Arbitrary program, used for wrappers and tests
    pub fn raw(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            prefix: Vec::new(),
            server_args: args,
        }
    }

    /// Build the invocation for `profile` at an optional offload policy
    pub fn build(executable: &Path, profile: &ModelProfile, args: &LaunchArgs, policy: Option<&OffloadPolicy>) -> Self {
        let total_layers = profile.effective_layers();
        let selector = policy.and_then(|p| p.selector_text(total_layers));

        let mut server_args = vec!["--model".to_string(), profile.path_key()];
        server_args.extend(args.to_argv(profile, policy.map(|p| p.gpu_layers), selector.as_deref()));

        let exe = executable.to_string_lossy().into_owned();
        let is_script = executable
            .extension()
            .map(|e| e.eq_ignore_ascii_case("py"))
            .unwrap_or(false);

        if is_script {
            Self {
                program: PYTHON.to_string(),
                prefix: vec![exe],
                server_args,
            }
        } else {
            Self {
                program: exe,
                prefix: Vec::new(),
                server_args,
            }
        }
    }

    /// Every argument after the program
    pub fn argv(&self) -> Vec<String> {
        self.prefix.iter().chain(self.server_args.iter()).cloned().collect()
    }

    /// Fingerprint of the server arguments, the history key component
    pub fn fingerprint(&self) -> String {
        args_fingerprint(&self.server_args)
    }

    /// Value passed for `flag`, if present
    pub fn flag_value(&self, flag: &str) -> Option<&str> {
        self.server_args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.server_args.get(i + 1))
            .map(String::as_str)
    }

    /// Tokio command with both output streams piped
    pub fn to_tokio(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(self.argv())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

impl fmt::Display for LaunchCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let quote = |s: &str| {
            if s.is_empty() || s.chars().any(|c| c.is_whitespace() || "\"'\\|()$*".contains(c)) {
                format!("'{}'", s.replace('\'', r"'\''"))
            } else {
                s.to_string()
            }
        };
        write!(f, "{}", quote(&self.program))?;
        for arg in self.argv() {
            write!(f, " {}", quote(&arg))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offload::StrategyGenerator;

    fn profile() -> ModelProfile {
        ModelProfile::new("/models/qwen 14b-Q4_K_M.gguf", Some(14.0), "Q4_K_M", false, 48)
    }

    #[test]
    fn test_build_with_policy() {
        let gen = StrategyGenerator::default();
        let policy = gen.policy(&profile(), 0);
        let cmd = LaunchCommand::build(Path::new("/opt/koboldcpp"), &profile(), &LaunchArgs::builtin(), Some(&policy));

        assert_eq!(cmd.program, "/opt/koboldcpp");
        assert_eq!(cmd.server_args[0], "--model");
        assert_eq!(cmd.flag_value("--gpulayers"), Some("999"));
        assert!(cmd.flag_value("--overridetensors").unwrap().ends_with("=CPU"));
    }

    #[test]
    fn test_script_runs_through_python() {
        let cmd = LaunchCommand::build(Path::new("koboldcpp.py"), &profile(), &LaunchArgs::default(), None);
        assert_eq!(cmd.program, PYTHON);
        assert_eq!(cmd.argv()[0], "koboldcpp.py");
        assert!(cmd.flag_value("--overridetensors").is_none());
    }

    #[test]
    fn test_fingerprint_ignores_executable() {
        let a = LaunchCommand::build(Path::new("/a/koboldcpp"), &profile(), &LaunchArgs::builtin(), None);
        let b = LaunchCommand::build(Path::new("/b/koboldcpp.py"), &profile(), &LaunchArgs::builtin(), None);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_display_quotes_special_args() {
        let cmd = LaunchCommand::raw("srv", vec!["--model".into(), "/m/a b.gguf".into(), r"blk\.\d+".into()]);
        assert_eq!(cmd.to_string(), r"srv --model '/m/a b.gguf' 'blk\.\d+'");
    }
}
