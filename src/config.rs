//! Configuration file
//!
//! TOML at `<config_dir>/offloadtune/config.toml`, created with defaults on
//! first use. Every section and field is optional in the file.

use crate::history::MatchOptions;
use crate::launch::{LaunchArgs, MonitorSettings, DEFAULT_OOM_KEYWORDS, DEFAULT_SUCCESS_PATTERN};
use crate::models::ModelProfile;
use crate::tuning::HeuristicConstants;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR: &str = "offloadtune";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuneConfig {
    pub server: ServerConfig,
    pub vram: VramConfig,
    pub history: HistoryConfig,
    pub tuning: TuningConfig,
    /// Global launch-argument overrides
    pub default_args: LaunchArgs,
    /// Per-model overrides keyed by model path
    pub model_args: BTreeMap<String, LaunchArgs>,
}

/// Inference server and its output signals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub executable: PathBuf,
    pub success_pattern: String,
    pub oom_keywords: Vec<String>,
    pub loading_timeout_secs: u64,
    pub stabilisation_secs: u64,
    pub tail_lines: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VramConfig {
    pub safety_buffer_mb: u64,
    pub min_free_after_load_mb: u64,
    /// Manual total VRAM budget; unset uses the hardware total
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget_mb: Option<u64>,
    pub gpu_index: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Store file; unset uses `<data_dir>/offloadtune/history.db`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    pub size_tolerance_b: f64,
    pub vram_tolerance: f64,
    pub failure_margin: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningConfig {
    pub max_attempts: u32,
    pub heuristics: HeuristicConstants,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("koboldcpp"),
            success_pattern: DEFAULT_SUCCESS_PATTERN.to_string(),
            oom_keywords: DEFAULT_OOM_KEYWORDS.iter().map(|k| k.to_string()).collect(),
            loading_timeout_secs: 60,
            stabilisation_secs: 3,
            tail_lines: 40,
        }
    }
}

impl Default for VramConfig {
    fn default() -> Self {
        Self {
            safety_buffer_mb: 768,
            min_free_after_load_mb: 512,
            budget_mb: None,
            gpu_index: 0,
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        let m = MatchOptions::default();
        Self {
            file: None,
            size_tolerance_b: m.size_tolerance_b,
            vram_tolerance: m.vram_tolerance,
            failure_margin: m.failure_margin,
        }
    }
}

impl TuneConfig {
    /// Load from `path`, or from the default location
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_path()?,
        };
        Self::load_or_create(&path)
    }

    /// Read `path`, writing defaults there first if it does not exist
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if !path.exists() {
            let config = TuneConfig::default();
            config.save_to(path)?;
            return Ok(config);
        }

        let contents =
            fs::read_to_string(path).with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: TuneConfig =
            toml::from_str(&contents).with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, toml_string).context("Failed to write config file")?;
        Ok(())
    }

    pub fn default_path() -> Result<PathBuf> {
        let dir = dirs::config_dir().context("Could not determine config directory")?;
        Ok(dir.join(APP_DIR).join("config.toml"))
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.loading_timeout_secs == 0 {
            bail!("server.loading_timeout_secs must be greater than 0");
        }
        if let Err(e) = regex::Regex::new(&self.server.success_pattern) {
            bail!("server.success_pattern is not a valid regex: {}", e);
        }
        if !(self.history.vram_tolerance > 0.0 && self.history.vram_tolerance <= 1.0) {
            bail!("history.vram_tolerance must be in (0, 1]");
        }
        if self.history.size_tolerance_b < 0.0 {
            bail!("history.size_tolerance_b must not be negative");
        }
        if self.tuning.max_attempts == 0 {
            bail!("tuning.max_attempts must be greater than 0");
        }
        Ok(())
    }

    pub fn history_path(&self) -> Result<PathBuf> {
        if let Some(file) = &self.history.file {
            return Ok(file.clone());
        }
        let dir = dirs::data_dir().context("Could not determine data directory")?;
        Ok(dir.join(APP_DIR).join("history.db"))
    }

    /// Builtin, then global, then model-specific arguments
    pub fn launch_args_for(&self, profile: &ModelProfile) -> LaunchArgs {
        let model = self.model_args.get(&profile.path_key());
        LaunchArgs::layered([&LaunchArgs::builtin(), &self.default_args].into_iter().chain(model))
    }

    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            loading_timeout: Duration::from_secs(self.server.loading_timeout_secs),
            stabilisation: Duration::from_secs(self.server.stabilisation_secs),
            min_free_after_load_mb: self.vram.min_free_after_load_mb,
            tail_lines: self.server.tail_lines,
            ..MonitorSettings::default()
        }
    }

    pub fn match_options(&self) -> MatchOptions {
        MatchOptions {
            size_tolerance_b: self.history.size_tolerance_b,
            vram_tolerance: self.history.vram_tolerance,
            safety_buffer_mb: self.vram.safety_buffer_mb,
            failure_margin: self.history.failure_margin,
        }
    }

    /// Heuristic constants with the margins of the `vram` section
    pub fn heuristics(&self) -> HeuristicConstants {
        HeuristicConstants {
            safety_buffer_mb: self.vram.safety_buffer_mb,
            min_free_after_load_mb: self.vram.min_free_after_load_mb,
            ..self.tuning.heuristics.clone()
        }
    }
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            max_attempts: 12,
            heuristics: HeuristicConstants::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launch::Tunable;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = TuneConfig::default();
        assert_eq!(config.server.loading_timeout_secs, 60);
        assert_eq!(config.vram.safety_buffer_mb, 768);
        assert_eq!(config.tuning.max_attempts, 12);
        assert!(config.validate().is_ok());
        assert_eq!(config.monitor_settings().loading_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_missing_file_is_created() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = TuneConfig::load(Some(&path)).unwrap();
        assert!(path.exists());
        assert_eq!(config, TuneConfig::default());

        let again = TuneConfig::load(Some(&path)).unwrap();
        assert_eq!(again, config);
    }

    #[test]
    fn test_partial_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[server]
executable = "/opt/kobold/koboldcpp.py"
loading_timeout_secs = 120

[vram]
budget_mb = 10000

[default_args]
threads = "auto"
contextsize = 8192

[model_args."/models/big.gguf"]
gpulayers = "off"
"#,
        )
        .unwrap();

        let config = TuneConfig::load(Some(&path)).unwrap();
        assert_eq!(config.server.loading_timeout_secs, 120);
        assert_eq!(config.server.stabilisation_secs, 3);
        assert_eq!(config.vram.budget_mb, Some(10_000));
        assert_eq!(config.default_args.threads, Some(Tunable::Auto));

        let big = ModelProfile::new("/models/big.gguf", Some(70.0), "Q4_K_M", false, 80);
        let args = config.launch_args_for(&big);
        assert_eq!(args.contextsize, Some(8192));
        assert_eq!(args.gpulayers, Some(Tunable::Off));
        assert_eq!(args.port, Some(5000));

        let other = ModelProfile::new("/models/small.gguf", Some(7.0), "Q4_K_M", false, 32);
        assert_eq!(config.launch_args_for(&other).gpulayers, Some(Tunable::Auto));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[tuning]\nmax_attempts = 0\n").unwrap();
        assert!(TuneConfig::load(Some(&path)).is_err());

        fs::write(&path, "[server]\nsuccess_pattern = \"(\"\n").unwrap();
        assert!(TuneConfig::load(Some(&path)).is_err());

        fs::write(&path, "not toml at all [").unwrap();
        assert!(TuneConfig::load(Some(&path)).is_err());
    }

    #[test]
    fn test_vram_section_feeds_heuristics_and_matching() {
        let mut config = TuneConfig::default();
        config.vram.safety_buffer_mb = 1024;
        assert_eq!(config.heuristics().safety_buffer_mb, 1024);
        assert_eq!(config.match_options().safety_buffer_mb, 1024);
    }

    #[test]
    fn test_explicit_history_file() {
        let mut config = TuneConfig::default();
        config.history.file = Some(PathBuf::from("/tmp/h.db"));
        assert_eq!(config.history_path().unwrap(), PathBuf::from("/tmp/h.db"));
    }
}
