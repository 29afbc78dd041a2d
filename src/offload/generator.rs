//! Strategy generation
//!
//! Maps `(ModelProfile, level)` to an [`OffloadPolicy`]. Pure: no state is
//! kept between calls and no I/O is performed.

use crate::models::{ModelClass, ModelProfile};
use crate::offload::ladder::{Ladder, LevelBounds, Rung, FULL_GPU_LAYERS};
use crate::offload::tensors::TensorSelector;
use serde::{Deserialize, Serialize};

/// Placement decision for one attempt level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OffloadPolicy {
    /// Clamped level the policy was generated for
    pub level: i32,
    /// Tensors pinned to host memory; `None` lets the layer count decide
    pub selector: Option<TensorSelector>,
    /// Requested accelerator layers
    pub gpu_layers: u32,
}

impl OffloadPolicy {
    /// Selector text as passed to the server, without the `=CPU` suffix
    pub fn selector_text(&self, total_layers: u32) -> Option<String> {
        self.selector
            .as_ref()
            .and_then(|s| s.render(total_layers))
            .and_then(|s| s.strip_suffix("=CPU").map(str::to_string))
    }
}

/// One row of a printed ladder
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanRow {
    pub level: i32,
    pub is_rung: bool,
    pub description: String,
    pub selector: Option<String>,
    pub gpu_layers: u32,
}

/// Ladder-backed strategy generator
#[derive(Debug, Clone)]
pub struct StrategyGenerator {
    moe: Ladder,
    dense: Ladder,
}

impl Default for StrategyGenerator {
    fn default() -> Self {
        Self::new(Ladder::moe(), Ladder::dense())
    }
}

impl StrategyGenerator {
    pub fn new(moe: Ladder, dense: Ladder) -> Self {
        Self { moe, dense }
    }

    pub fn ladder(&self, class: ModelClass) -> &Ladder {
        match class {
            ModelClass::Moe => &self.moe,
            ModelClass::Dense => &self.dense,
        }
    }

    pub fn bounds(&self, profile: &ModelProfile) -> LevelBounds {
        self.ladder(profile.class()).bounds
    }

    /// Policy for `level`, clamped to the model's bounds first
    pub fn policy(&self, profile: &ModelProfile, level: i32) -> OffloadPolicy {
        let ladder = self.ladder(profile.class());
        let level = ladder.bounds.clamp(level);
        let selector = ladder.rung_at(level).selector(profile.effective_layers());

        let gpu_layers = if selector.is_some() {
            FULL_GPU_LAYERS
        } else {
            self.gpu_layer_count(profile, level)
        };

        OffloadPolicy {
            level,
            selector,
            gpu_layers,
        }
    }

    /// GPU layer count for a level, independent of any selector
    pub fn gpu_layer_count(&self, profile: &ModelProfile, level: i32) -> u32 {
        self.ladder(profile.class())
            .layer_share(level)
            .layers(profile.effective_layers())
    }

    /// Human-readable strategy text
    pub fn description(&self, profile: &ModelProfile, level: i32, policy: &OffloadPolicy) -> String {
        let ladder = self.ladder(profile.class());
        let level = ladder.bounds.clamp(level);
        let rung = ladder.rung_at(level);

        let name = if rung.level == level {
            rung.name.clone()
        } else {
            match ladder.next_rung_above(level) {
                Some(above) => format!(
                    "{} Level {} (between '{}' and '{}')",
                    ladder.class, level, rung.name, above.name
                ),
                None => format!("{} Level {} (beyond '{}')", ladder.class, level, rung.name),
            }
        };

        let total = profile.effective_layers();
        let layers = if policy.selector.is_some() {
            format!("GPU layers: {} (tensor overrides decide placement)", policy.gpu_layers)
        } else if policy.gpu_layers >= FULL_GPU_LAYERS {
            format!("GPU layers: all ({})", FULL_GPU_LAYERS)
        } else {
            format!("GPU layers: {}/{}", policy.gpu_layers, total)
        };

        format!("{} | {}", name, layers)
    }

    /// Place a remembered selector back onto the ladder
    ///
    /// An exact rendering match wins; otherwise the highest rung whose
    /// pinned classes are all pinned by `selector`; otherwise the lowest
    /// rung that pins anything.
    pub fn level_from_selector(&self, selector: Option<&TensorSelector>, profile: &ModelProfile) -> i32 {
        let ladder = self.ladder(profile.class());
        let selector = match selector {
            Some(s) if !s.rules().is_empty() => s,
            _ => return ladder.bounds.min,
        };

        let total = profile.effective_layers();
        let wanted = selector.render(total);
        if let Some(rung) = ladder
            .rungs
            .iter()
            .find(|r| r.selector(total).and_then(|s| s.render(total)) == wanted)
        {
            return rung.level;
        }

        let classes = selector.pinned_classes();
        let pinning = || ladder.rungs.iter().filter(|r| !r.rules.is_empty());

        pinning()
            .filter(|r| r.classes().is_subset(&classes))
            .map(|r| r.level)
            .max()
            .or_else(|| pinning().map(|r| r.level).min())
            .unwrap_or(ladder.bounds.min)
    }

    /// Every level of the model's ladder with its policy
    pub fn plan(&self, profile: &ModelProfile) -> Vec<PlanRow> {
        let ladder = self.ladder(profile.class());
        let total = profile.effective_layers();
        (ladder.bounds.min..=ladder.bounds.max)
            .map(|level| {
                let policy = self.policy(profile, level);
                PlanRow {
                    level,
                    is_rung: ladder.rungs.iter().any(|r: &Rung| r.level == level),
                    description: self.description(profile, level, &policy),
                    selector: policy.selector_text(total),
                    gpu_layers: policy.gpu_layers,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offload::tensors::{LayerStride, TensorClass};
    use quickcheck_macros::quickcheck;

    fn moe() -> ModelProfile {
        ModelProfile::new("/m/Qwen3-30B-A3B-Q4_K_M.gguf", Some(30.0), "Q4_K_M", true, 48)
    }

    fn dense(layers: u32) -> ModelProfile {
        ModelProfile::new("/m/llama-8b-Q4_K_M.gguf", Some(8.0), "Q4_K_M", false, layers)
    }

    #[test]
    fn test_moe_max_gpu_has_no_selector() {
        let gen = StrategyGenerator::default();
        let policy = gen.policy(&moe(), -25);
        assert!(policy.selector.is_none());
        assert_eq!(policy.gpu_layers, FULL_GPU_LAYERS);
        assert_eq!(gen.gpu_layer_count(&moe(), -25), FULL_GPU_LAYERS);
    }

    #[test]
    fn test_dense_level_zero_pins_all_ffn_everywhere() {
        let gen = StrategyGenerator::default();
        let profile = dense(32);
        let policy = gen.policy(&profile, 0);
        let selector = policy.selector.expect("selector at level 0");

        for class in [TensorClass::FfnUp, TensorClass::FfnDown, TensorClass::FfnGate] {
            assert!(selector.pinned_classes().contains(&class));
        }
        assert!(selector.rules().iter().all(|r| r.layers == LayerStride::All));
        assert_eq!(gen.gpu_layer_count(&profile, 0), 16);
        assert_eq!(policy.gpu_layers, FULL_GPU_LAYERS);
    }

    #[test]
    fn test_out_of_range_levels_are_clamped() {
        let gen = StrategyGenerator::default();
        let profile = dense(32);
        assert_eq!(gen.policy(&profile, 100), gen.policy(&profile, 9));
        assert_eq!(gen.policy(&profile, -100).level, -17);
    }

    #[test]
    fn test_description_between_rungs() {
        let gen = StrategyGenerator::default();
        let profile = moe();
        let exact = gen.description(&profile, -10, &gen.policy(&profile, -10));
        assert!(exact.starts_with("MoE GPU Focus"));

        let gap = gen.description(&profile, -9, &gen.policy(&profile, -9));
        assert!(gap.starts_with("MoE Level -9 (between 'MoE GPU Focus' and 'MoE CPU/GPU Bal+')"));
    }

    #[test]
    fn test_description_without_selector_reports_layers() {
        let gen = StrategyGenerator::default();
        let profile = ModelProfile::new("m.gguf", Some(47.0), "Q4_K_M", true, 40);
        let policy = gen.policy(&profile, -22);
        assert!(policy.selector.is_none());
        assert_eq!(policy.gpu_layers, 38);
        let text = gen.description(&profile, -22, &policy);
        assert!(text.contains("GPU layers: 38/40"), "{}", text);
        assert!(text.starts_with("MoE Level -22 (between 'MoE MAX GPU' and 'MoE GPU++++')"));
    }

    #[test]
    fn test_level_from_selector_exact_rung() {
        let gen = StrategyGenerator::default();
        let profile = moe();
        for level in [-21, -12, -4, 0, 6, 10] {
            let policy = gen.policy(&profile, level);
            assert_eq!(gen.level_from_selector(policy.selector.as_ref(), &profile), level);
        }
    }

    #[test]
    fn test_level_from_selector_fallbacks() {
        let gen = StrategyGenerator::default();
        let profile = dense(32);
        assert_eq!(gen.level_from_selector(None, &profile), -17);

        // Pins up+down everywhere plus an unrelated norm: superset of rung -1
        let text = r"(blk\.\d+\.(ffn_up|ffn_down)\.weight|blk\.\d+\.attn_norm\.weight)=CPU";
        let selector = TensorSelector::parse(text).unwrap();
        assert_eq!(gen.level_from_selector(Some(&selector), &profile), -1);

        // Nothing in the ladder is a subset of a lone attn_k rule
        let selector = TensorSelector::parse(r"blk\.\d+\.attn_k\.weight=CPU").unwrap();
        assert_eq!(gen.level_from_selector(Some(&selector), &profile), -14);
    }

    #[test]
    fn test_plan_covers_every_level() {
        let gen = StrategyGenerator::default();
        let rows = gen.plan(&moe());
        assert_eq!(rows.len(), 36);
        assert_eq!(rows.iter().filter(|r| r.is_rung).count(), 17);
        assert!(rows[0].selector.is_none());
        assert!(rows.last().unwrap().selector.as_ref().unwrap().contains("ffn_norm"));
    }

    #[quickcheck]
    fn prop_policy_is_deterministic(level: i32, layers: u8, is_moe: bool) -> bool {
        let gen = StrategyGenerator::default();
        let profile = ModelProfile::new("p.gguf", Some(14.0), "Q4_K_M", is_moe, layers as u32);
        gen.policy(&profile, level) == gen.policy(&profile, level)
    }

    #[quickcheck]
    fn prop_pinned_classes_and_layers_are_monotone(layers: u8, is_moe: bool) -> bool {
        let gen = StrategyGenerator::default();
        let profile = ModelProfile::new("p.gguf", None, "Q4_K_M", is_moe, layers as u32);
        let bounds = gen.bounds(&profile);

        let classes = |level| {
            gen.policy(&profile, level)
                .selector
                .map(|s| s.pinned_classes())
                .unwrap_or_default()
        };

        (bounds.min..bounds.max).all(|level| {
            classes(level).is_subset(&classes(level + 1))
                && gen.gpu_layer_count(&profile, level) >= gen.gpu_layer_count(&profile, level + 1)
        })
    }
}
