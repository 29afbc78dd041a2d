//! Start-level heuristics
//!
//! Three layers applied in order of increasing specificity: a class/size
//! default, a VRAM budget adjustment, and an override from history. The
//! numbers are empirical and live in [`HeuristicConstants`].

use crate::history::{OutcomeTag, RememberedConfig, UserAction};
use crate::models::{estimated_full_gpu_mb, ModelProfile};
use crate::offload::LevelBounds;
use crate::vram::VramSnapshot;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Tunable constants of the start-level heuristics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeuristicConstants {
    pub moe_start: i32,
    /// `(min_size_b, level)` for dense models, largest size first
    pub dense_start: Vec<(f64, i32)>,
    pub dense_fallback_start: i32,
    /// Footprint above budget × this pushes toward CPU
    pub over_budget_factor: f64,
    /// Footprint below budget × this pulls toward GPU
    pub headroom_factor: f64,
    pub dense_over_budget_floor: i32,
    pub moe_over_budget_floor: i32,
    pub dense_headroom_ceiling: i32,
    pub moe_headroom_ceiling: i32,
    pub safety_buffer_mb: u64,
    pub min_free_after_load_mb: u64,
}

impl Default for HeuristicConstants {
    fn default() -> Self {
        Self {
            moe_start: -10,
            dense_start: vec![(30.0, -3), (20.0, -5)],
            dense_fallback_start: -7,
            over_budget_factor: 1.1,
            headroom_factor: 0.7,
            dense_over_budget_floor: -3,
            moe_over_budget_floor: -6,
            dense_headroom_ceiling: -12,
            moe_headroom_ceiling: -18,
            safety_buffer_mb: 768,
            min_free_after_load_mb: 512,
        }
    }
}

/// Chosen start level and how it was reached
#[derive(Debug, Clone, PartialEq)]
pub struct StartPlan {
    pub level: i32,
    pub notes: Vec<String>,
}

/// Coarse default by class and size bucket
pub fn base_level(profile: &ModelProfile, c: &HeuristicConstants) -> i32 {
    if profile.is_moe {
        return c.moe_start;
    }
    let size = profile.size_b.unwrap_or(0.0);
    c.dense_start
        .iter()
        .find(|(min_size, _)| size >= *min_size)
        .map(|(_, level)| *level)
        .unwrap_or(c.dense_fallback_start)
}

/// Push toward CPU when the model clearly exceeds the budget, toward GPU
/// when there is ample headroom
pub fn budget_adjusted(level: i32, profile: &ModelProfile, vram: &VramSnapshot, c: &HeuristicConstants) -> (i32, Option<String>) {
    let Some(needed) = estimated_full_gpu_mb(profile).filter(|n| *n > 0.0) else {
        return (level, None);
    };
    if vram.budgeted_free_mb() == 0 {
        return (level, None);
    }

    let budget = vram.budgeted_total_mb() as f64 - c.safety_buffer_mb as f64 - c.min_free_after_load_mb as f64;
    if needed > budget * c.over_budget_factor {
        let floor = if profile.is_moe {
            c.moe_over_budget_floor
        } else {
            c.dense_over_budget_floor
        };
        let adjusted = level.max(floor);
        let note = format!(
            "Estimated {:.0} MB exceeds the {:.0} MB budget; starting toward CPU at {}",
            needed, budget, adjusted
        );
        (adjusted, Some(note))
    } else if needed < budget * c.headroom_factor {
        let ceiling = if profile.is_moe {
            c.moe_headroom_ceiling
        } else {
            c.dense_headroom_ceiling
        };
        let adjusted = level.min(ceiling);
        let note = format!(
            "Estimated {:.0} MB leaves ample room in the {:.0} MB budget; starting toward GPU at {}",
            needed, budget, adjusted
        );
        (adjusted, Some(note))
    } else {
        (level, None)
    }
}

/// Start from a remembered run, nudged by how it went
///
/// `actual_free_mb` is the hardware free VRAM, not the budgeted one.
pub fn history_adjusted(
    remembered: &RememberedConfig,
    actual_free_mb: u64,
    bounds: LevelBounds,
    c: &HeuristicConstants,
) -> (i32, String) {
    let hist = remembered.attempt_level;
    let toward_gpu = bounds.clamp((hist - 1).max(bounds.min));
    let toward_cpu = bounds.clamp((hist + 1).min(bounds.max));
    let outcome = remembered.outcome;

    let fits_today = remembered
        .approx_vram_used_mb
        .map(|used| used + c.safety_buffer_mb < actual_free_mb)
        .unwrap_or(false);

    let remembered_good = matches!(
        outcome.base,
        OutcomeTag::SuccessLoadVramOk | OutcomeTag::SuccessUserConfirmed
    ) || outcome.user_action == Some(UserAction::SavedGoodGpu);

    let remembered_bad = outcome.pushed_toward_cpu()
        || matches!(outcome.base, OutcomeTag::OomCrash | OutcomeTag::SuccessLoadVramTight);

    let (level, why) = if fits_today {
        (toward_gpu, "its measured usage fits today's free VRAM")
    } else if remembered_good {
        (toward_gpu, "it loaded well")
    } else if remembered_bad {
        (toward_cpu, "it ran out of memory or was tight")
    } else {
        (bounds.clamp(hist), "as remembered")
    };

    debug!(hist, level, outcome = %outcome, "history adjustment");
    let note = format!("Remembered level {} ({}); starting at {} because {}", hist, outcome, level, why);
    (level, note)
}
