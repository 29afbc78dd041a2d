//! Type definitions for model profiles
//!
//! A profile is the immutable description of one GGUF model that the tuner
//! works against. It is produced once per model selection and passed by
//! reference everywhere else.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Layer count assumed when a profile carries none
pub const FALLBACK_LAYER_COUNT: u32 = 32;

/// Architecture class; each class is tuned on its own level scale
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelClass {
    /// Mixture-of-experts model with per-layer expert tensors
    Moe,
    /// Dense transformer
    Dense,
}

impl fmt::Display for ModelClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelClass::Moe => write!(f, "MoE"),
            ModelClass::Dense => write!(f, "Dense"),
        }
    }
}

/// Description of a model file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelProfile {
    /// Path to the GGUF file
    pub filepath: PathBuf,

    /// Parameter count in billions, if it could be inferred
    #[serde(default)]
    pub size_b: Option<f64>,

    /// Quantization tag (e.g. "Q4_K_M"), "UNKNOWN" when not detected
    pub quant: String,

    /// Mixture-of-experts flag
    pub is_moe: bool,

    /// Number of transformer blocks
    pub num_layers: u32,
}

impl ModelProfile {
    /// Create a profile with explicit values
    pub fn new(
        filepath: impl Into<PathBuf>,
        size_b: Option<f64>,
        quant: impl Into<String>,
        is_moe: bool,
        num_layers: u32,
    ) -> Self {
        Self {
            filepath: filepath.into(),
            size_b,
            quant: quant.into(),
            is_moe,
            num_layers,
        }
    }

    /// Level scale this model is tuned on
    pub fn class(&self) -> ModelClass {
        if self.is_moe {
            ModelClass::Moe
        } else {
            ModelClass::Dense
        }
    }

    /// Layer count, falling back to 32 for a zero count
    pub fn effective_layers(&self) -> u32 {
        if self.num_layers == 0 {
            FALLBACK_LAYER_COUNT
        } else {
            self.num_layers
        }
    }

    /// Key used to identify the model in the history store
    pub fn path_key(&self) -> String {
        self.filepath.to_string_lossy().into_owned()
    }

    /// File name for display
    pub fn display_name(&self) -> String {
        self.filepath
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path_key())
    }

    /// Upper-cased quant tag
    pub fn quant_upper(&self) -> String {
        self.quant.to_uppercase()
    }
}

impl fmt::Display for ModelProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let size = self
            .size_b
            .map(|s| format!("{}B", s))
            .unwrap_or_else(|| "?B".to_string());
        write!(
            f,
            "{} ({} {}, {}, {} layers)",
            self.display_name(),
            size,
            self.quant,
            self.class(),
            self.effective_layers()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_follows_moe_flag() {
        let moe = ModelProfile::new("m.gguf", Some(47.0), "Q4_K_M", true, 32);
        let dense = ModelProfile::new("d.gguf", Some(8.0), "Q4_K_M", false, 32);
        assert_eq!(moe.class(), ModelClass::Moe);
        assert_eq!(dense.class(), ModelClass::Dense);
    }

    #[test]
    fn test_effective_layers_fallback() {
        let profile = ModelProfile::new("m.gguf", None, "UNKNOWN", false, 0);
        assert_eq!(profile.effective_layers(), FALLBACK_LAYER_COUNT);
    }

    #[test]
    fn test_display_name() {
        let profile = ModelProfile::new("/models/qwen-7b.Q4_K_M.gguf", Some(7.0), "Q4_K_M", false, 32);
        assert_eq!(profile.display_name(), "qwen-7b.Q4_K_M.gguf");
        assert!(profile.to_string().contains("7B"));
    }
}
