//! Model profile producers
//!
//! The tuner only depends on the [`ModelAnalyzer`] contract. The bundled
//! [`FilenameAnalyzer`] infers a profile from naming conventions used by
//! GGUF publishers; it never opens the file.

use crate::errors::Result;
use crate::models::types::{ModelProfile, FALLBACK_LAYER_COUNT};
use regex::Regex;
use std::path::Path;

/// Producer of model profiles; must be deterministic for a given path
pub trait ModelAnalyzer {
    fn analyze(&self, filepath: &Path) -> ModelProfile;
}

/// Filename-based profile inference
pub struct FilenameAnalyzer {
    quant: Regex,
    size: Regex,
    active_params: Regex,
    layers: Regex,
}

impl FilenameAnalyzer {
    pub fn new() -> Result<Self> {
        Ok(Self {
            quant: Regex::new(
                r"(?i)(iq[1-4](?:_[smlx]{1,2})?|q[2-8](?:_[0-9a-z]{1,2}){0,2}|bf16|fp16|f16|f32)",
            )?,
            size: Regex::new(r"(?:^|[^a-z0-9.])(\d{1,3}(?:\.\d{1,2})?)b(?:$|[^a-z0-9])")?,
            active_params: Regex::new(r"-a\d+(?:\.\d+)?b")?,
            layers: Regex::new(r"(\d{1,3})[-_]?layers")?,
        })
    }

    fn detect_moe(&self, name: &str) -> bool {
        name.contains("moe")
            || name.contains("mixtral")
            || name.contains("grok")
            || self.active_params.is_match(name)
    }

    fn detect_quant(&self, name: &str) -> String {
        self.quant
            .captures(name)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_uppercase().replace("FP16", "F16"))
            .unwrap_or_else(|| "UNKNOWN".to_string())
    }

    fn detect_size(&self, name: &str) -> Option<f64> {
        self.size
            .captures(name)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<f64>().ok())
            .filter(|s| *s > 0.0)
    }

    fn detect_layers(&self, name: &str, size_b: Option<f64>) -> u32 {
        if let Some(explicit) = self
            .layers
            .captures(name)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u32>().ok())
            .filter(|l| *l > 0)
        {
            return explicit;
        }
        size_b.map(layers_for_size).unwrap_or(FALLBACK_LAYER_COUNT)
    }
}

impl ModelAnalyzer for FilenameAnalyzer {
    fn analyze(&self, filepath: &Path) -> ModelProfile {
        let name = filepath
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        let is_moe = self.detect_moe(&name);
        let quant = self.detect_quant(&name);
        let size_b = self.detect_size(&name);
        let num_layers = self.detect_layers(&name, size_b);

        ModelProfile::new(filepath, size_b, quant, is_moe, num_layers)
    }
}

/// Typical block count for a parameter-count bucket
pub fn layers_for_size(size_b: f64) -> u32 {
    match size_b {
        s if s <= 1.5 => 22,
        s if s <= 3.0 => 26,
        s if s <= 7.0 => 32,
        s if s <= 13.0 => 40,
        s if s <= 20.0 => 48,
        s if s <= 35.0 => 60,
        s if s <= 70.0 => 80,
        _ => 96,
    }
}

/// Approximate GB of VRAM per billion parameters when fully GPU-resident.
///
/// Empirical values; exact matches are tried first, then substring matches
/// in table order.
const VRAM_GB_PER_B_PARAM: &[(&str, f64)] = &[
    ("F32", 4.5),
    ("BF16", 2.5),
    ("F16", 2.5),
    ("Q8_0", 1.5),
    ("Q6_K", 1.1),
    ("Q5_K_M", 0.95),
    ("Q5_K_S", 0.90),
    ("Q5_0", 0.90),
    ("Q5_1", 0.95),
    ("Q4_K_M", 0.8),
    ("Q4_K_S", 0.75),
    ("Q4_0", 0.70),
    ("Q3_K_L", 0.65),
    ("Q3_K_M", 0.60),
    ("Q3_K_S", 0.55),
    ("Q2_K", 0.50),
    ("Q2_0", 0.50),
    ("IQ4_XS", 0.75),
    ("IQ3_XS", 0.60),
    ("IQ2_XS", 0.50),
    ("IQ1_S", 0.40),
];

const UNKNOWN_QUANT_GB_PER_B: f64 = 0.9;
const MOE_FOOTPRINT_FACTOR: f64 = 1.2;

/// Estimated VRAM in MB to hold the whole model on the GPU
///
/// Returns `None` when the parameter count is unknown.
pub fn estimated_full_gpu_mb(profile: &ModelProfile) -> Option<f64> {
    let size_b = profile.size_b.filter(|s| *s > 0.0)?;
    let quant = profile.quant_upper();

    let factor = VRAM_GB_PER_B_PARAM
        .iter()
        .find(|(k, _)| *k == quant)
        .or_else(|| VRAM_GB_PER_B_PARAM.iter().find(|(k, _)| quant.contains(k)))
        .map(|(_, v)| *v)
        .unwrap_or(UNKNOWN_QUANT_GB_PER_B);

    let mut gb = size_b * factor;
    if profile.is_moe {
        gb *= MOE_FOOTPRINT_FACTOR;
    }
    Some(gb * 1024.0)
}
