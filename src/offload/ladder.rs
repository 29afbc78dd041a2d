//! Offload ladders
//!
//! Each model class owns an ordered list of rungs. A rung names the tensor
//! classes pinned to host memory from that level upwards until the next rung.
//! The numeric levels, strides and layer shares are empirical and kept here
//! as plain tables.

use crate::models::ModelClass;
use crate::offload::tensors::{LayerStride, OffloadRule, TensorClass, TensorSelector};
use serde::{Deserialize, Serialize};

use TensorClass::*;

/// GPU layer count meaning "all layers"
pub const FULL_GPU_LAYERS: u32 = 999;

/// Inclusive level range of a ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelBounds {
    pub min: i32,
    pub max: i32,
}

impl LevelBounds {
    pub const MOE: LevelBounds = LevelBounds { min: -25, max: 10 };
    pub const DENSE: LevelBounds = LevelBounds { min: -17, max: 9 };

    pub fn for_class(class: ModelClass) -> Self {
        match class {
            ModelClass::Moe => Self::MOE,
            ModelClass::Dense => Self::DENSE,
        }
    }

    pub fn clamp(&self, level: i32) -> i32 {
        level.clamp(self.min, self.max)
    }

    pub fn contains(&self, level: i32) -> bool {
        (self.min..=self.max).contains(&level)
    }
}

/// Block coverage of a rung rule, resolved against the model's layer count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Span {
    /// Every block
    All,
    /// Even blocks
    Even,
    /// Roughly one block in `n`
    Fraction(u32),
    /// A fixed number of evenly spread blocks
    Groups(u32),
}

impl Span {
    pub fn resolve(&self, total_layers: u32) -> LayerStride {
        match self {
            Span::All => LayerStride::All,
            Span::Even => LayerStride::EveryNth(2),
            Span::Fraction(n) => {
                LayerStride::spread(total_layers, (total_layers / (*n).max(1)).max(1))
            }
            Span::Groups(g) => LayerStride::spread(total_layers, *g),
        }
    }
}

/// Tensor classes pinned over a span
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub tensors: Vec<TensorClass>,
    pub span: Span,
}

impl RuleSpec {
    fn new(tensors: &[TensorClass], span: Span) -> Self {
        Self {
            tensors: tensors.to_vec(),
            span,
        }
    }
}

/// One named step of a ladder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rung {
    pub level: i32,
    pub name: String,
    pub rules: Vec<RuleSpec>,
}

impl Rung {
    fn new(level: i32, name: &str, rules: Vec<RuleSpec>) -> Self {
        Self {
            level,
            name: name.to_string(),
            rules,
        }
    }

    /// Concrete selector for a model, `None` when nothing is pinned
    pub fn selector(&self, total_layers: u32) -> Option<TensorSelector> {
        if self.rules.is_empty() {
            return None;
        }
        let rules = self
            .rules
            .iter()
            .map(|r| OffloadRule::new(r.tensors.clone(), r.span.resolve(total_layers)))
            .collect();
        Some(TensorSelector::new(rules))
    }

    pub fn classes(&self) -> std::collections::BTreeSet<TensorClass> {
        self.rules.iter().flat_map(|r| r.tensors.iter().copied()).collect()
    }
}

/// Share of model layers requested on the GPU
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum LayerShare {
    Full,
    Fraction(f64),
}

impl LayerShare {
    pub fn layers(&self, total_layers: u32) -> u32 {
        match self {
            LayerShare::Full => FULL_GPU_LAYERS,
            LayerShare::Fraction(f) => (total_layers as f64 * f).max(0.0) as u32,
        }
    }
}

/// Rungs plus GPU-layer buckets for one model class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ladder {
    pub class: ModelClass,
    pub bounds: LevelBounds,
    /// Sorted by ascending level; the first rung sits at `bounds.min`
    pub rungs: Vec<Rung>,
    /// `(upper_level_inclusive, share)` sorted ascending
    pub layer_buckets: Vec<(i32, LayerShare)>,
    /// Share above the last bucket
    pub layer_fallback: LayerShare,
}

impl Ladder {
    /// Rung in effect at `level` (nearest rung at or below it)
    pub fn rung_at(&self, level: i32) -> &Rung {
        let level = self.bounds.clamp(level);
        self.rungs
            .iter()
            .rev()
            .find(|r| r.level <= level)
            .unwrap_or(&self.rungs[0])
    }

    /// Rung strictly above the one in effect at `level`
    pub fn next_rung_above(&self, level: i32) -> Option<&Rung> {
        self.rungs.iter().find(|r| r.level > level)
    }

    pub fn layer_share(&self, level: i32) -> LayerShare {
        let level = self.bounds.clamp(level);
        self.layer_buckets
            .iter()
            .find(|(upper, _)| level <= *upper)
            .map(|(_, share)| *share)
            .unwrap_or(self.layer_fallback)
    }

    /// Mixture-of-experts ladder
    pub fn moe() -> Self {
        const EXPS: &[TensorClass] = &[FfnDownExps, FfnUpExps, FfnGateExps];
        const DENSE_FFN: &[TensorClass] = &[FfnDown, FfnUp, FfnGate];

        let all_ffn = || {
            vec![
                RuleSpec::new(EXPS, Span::All),
                RuleSpec::new(DENSE_FFN, Span::All),
            ]
        };
        let with = |mut base: Vec<RuleSpec>, extra: &[RuleSpec]| {
            base.extend_from_slice(extra);
            base
        };

        let rungs = vec![
            Rung::new(-25, "MoE MAX GPU", vec![]),
            Rung::new(-21, "MoE GPU++++", vec![RuleSpec::new(&[FfnDownExps], Span::Groups(16))]),
            Rung::new(-18, "MoE GPU+++", vec![RuleSpec::new(&[FfnDownExps], Span::Groups(8))]),
            Rung::new(-15, "MoE GPU++", vec![RuleSpec::new(&[FfnDownExps], Span::Fraction(4))]),
            Rung::new(-12, "MoE GPU+", vec![RuleSpec::new(&[FfnDownExps], Span::Even)]),
            Rung::new(-10, "MoE GPU Focus", vec![RuleSpec::new(&[FfnDownExps], Span::All)]),
            Rung::new(
                -8,
                "MoE CPU/GPU Bal+",
                vec![
                    RuleSpec::new(&[FfnDownExps], Span::All),
                    RuleSpec::new(&[FfnUpExps], Span::Even),
                ],
            ),
            Rung::new(
                -6,
                "MoE CPU/GPU Bal++",
                vec![RuleSpec::new(&[FfnDownExps, FfnUpExps], Span::All)],
            ),
            Rung::new(
                -4,
                "MoE CPU+",
                vec![
                    RuleSpec::new(&[FfnDownExps, FfnUpExps], Span::All),
                    RuleSpec::new(&[FfnGateExps], Span::Even),
                ],
            ),
            Rung::new(-2, "MoE CPU++", vec![RuleSpec::new(EXPS, Span::All)]),
            Rung::new(
                0,
                "MoE MAX EXPERT CPU",
                vec![
                    RuleSpec::new(EXPS, Span::All),
                    RuleSpec::new(&[FfnDown], Span::All),
                ],
            ),
            Rung::new(1, "MoE SUPER MAX EXPERT CPU", all_ffn()),
            Rung::new(
                2,
                "MoE SUPER CPU",
                with(all_ffn(), &[RuleSpec::new(&[AttnQ], Span::Fraction(4))]),
            ),
            Rung::new(
                4,
                "MoE SUPER CPU+",
                with(all_ffn(), &[RuleSpec::new(&[AttnQ], Span::Fraction(3))]),
            ),
            Rung::new(
                6,
                "MoE SUPER CPU++",
                with(all_ffn(), &[RuleSpec::new(&[AttnQ, AttnK], Span::Even)]),
            ),
            Rung::new(
                8,
                "MoE SUPER MAX CPU",
                with(
                    all_ffn(),
                    &[RuleSpec::new(&[AttnQ, AttnK, AttnV, AttnOutput], Span::All)],
                ),
            ),
            Rung::new(
                10,
                "MoE ULTRA MAX CPU",
                with(
                    all_ffn(),
                    &[
                        RuleSpec::new(&[AttnQ, AttnK, AttnV, AttnOutput], Span::All),
                        RuleSpec::new(&[AttnNorm], Span::All),
                        RuleSpec::new(&[FfnNorm], Span::All),
                    ],
                ),
            ),
        ];

        Self {
            class: ModelClass::Moe,
            bounds: LevelBounds::MOE,
            rungs,
            layer_buckets: vec![
                (-23, LayerShare::Full),
                (-19, LayerShare::Fraction(0.95)),
                (-16, LayerShare::Fraction(0.90)),
                (-13, LayerShare::Fraction(0.85)),
                (-10, LayerShare::Fraction(0.80)),
                (-7, LayerShare::Fraction(0.75)),
                (-4, LayerShare::Fraction(0.70)),
                (-1, LayerShare::Fraction(0.60)),
                (2, LayerShare::Fraction(0.50)),
                (5, LayerShare::Fraction(0.40)),
                (8, LayerShare::Fraction(0.30)),
            ],
            layer_fallback: LayerShare::Fraction(0.20),
        }
    }

    /// Dense-model ladder
    pub fn dense() -> Self {
        const FFN: &[TensorClass] = &[FfnDown, FfnUp, FfnGate];
        const ATTN: &[TensorClass] = &[AttnQ, AttnK, AttnV, AttnOutput];

        let ffn_plus = |extra: Vec<RuleSpec>| {
            let mut rules = vec![RuleSpec::new(FFN, Span::All)];
            rules.extend(extra);
            rules
        };

        let rungs = vec![
            Rung::new(-17, "Dense MAX GPU", vec![]),
            Rung::new(-14, "Dense GPU++++", vec![RuleSpec::new(&[FfnUp], Span::Groups(16))]),
            Rung::new(-11, "Dense GPU+++", vec![RuleSpec::new(&[FfnUp], Span::Groups(8))]),
            Rung::new(-9, "Dense GPU++", vec![RuleSpec::new(&[FfnUp], Span::Fraction(4))]),
            Rung::new(-7, "Dense GPU+", vec![RuleSpec::new(&[FfnUp], Span::Fraction(3))]),
            Rung::new(-5, "Dense GPU Focus", vec![RuleSpec::new(&[FfnUp], Span::All)]),
            Rung::new(
                -3,
                "Dense CPU+",
                vec![
                    RuleSpec::new(&[FfnUp], Span::All),
                    RuleSpec::new(&[FfnDown], Span::Even),
                ],
            ),
            Rung::new(-1, "Dense CPU++", vec![RuleSpec::new(&[FfnDown, FfnUp], Span::All)]),
            Rung::new(0, "Dense MAX FFN CPU", ffn_plus(vec![])),
            Rung::new(
                1,
                "Dense FFN CPU + Attn Light",
                ffn_plus(vec![RuleSpec::new(&[AttnQ], Span::Fraction(4))]),
            ),
            Rung::new(
                3,
                "Dense SUPER CPU-",
                ffn_plus(vec![RuleSpec::new(&[AttnQ], Span::Fraction(3))]),
            ),
            Rung::new(
                5,
                "Dense SUPER CPU",
                ffn_plus(vec![RuleSpec::new(&[AttnQ, AttnK], Span::Even)]),
            ),
            Rung::new(
                7,
                "Dense SUPER MAX CPU",
                ffn_plus(vec![RuleSpec::new(ATTN, Span::All)]),
            ),
            Rung::new(
                9,
                "Dense ULTRA MAX CPU",
                ffn_plus(vec![
                    RuleSpec::new(ATTN, Span::All),
                    RuleSpec::new(&[AttnNorm], Span::All),
                    RuleSpec::new(&[FfnNorm], Span::All),
                    RuleSpec::new(&[TokenEmbeddings, Output], Span::All),
                ]),
            ),
        ];

        Self {
            class: ModelClass::Dense,
            bounds: LevelBounds::DENSE,
            rungs,
            layer_buckets: vec![
                (-15, LayerShare::Full),
                (-12, LayerShare::Fraction(0.95)),
                (-10, LayerShare::Fraction(0.90)),
                (-8, LayerShare::Fraction(0.85)),
                (-6, LayerShare::Fraction(0.80)),
                (-4, LayerShare::Fraction(0.70)),
                (-2, LayerShare::Fraction(0.60)),
                (0, LayerShare::Fraction(0.50)),
                (2, LayerShare::Fraction(0.40)),
                (4, LayerShare::Fraction(0.30)),
                (7, LayerShare::Fraction(0.20)),
            ],
            layer_fallback: LayerShare::Fraction(0.10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rungs_start_at_min_and_ascend() {
        for ladder in [Ladder::moe(), Ladder::dense()] {
            assert_eq!(ladder.rungs[0].level, ladder.bounds.min);
            assert!(ladder.rungs.windows(2).all(|w| w[0].level < w[1].level));
            assert_eq!(ladder.rungs.last().unwrap().level, ladder.bounds.max);
        }
    }

    #[test]
    fn test_rung_classes_never_shrink() {
        for ladder in [Ladder::moe(), Ladder::dense()] {
            for pair in ladder.rungs.windows(2) {
                assert!(
                    pair[0].classes().is_subset(&pair[1].classes()),
                    "{} -> {}",
                    pair[0].name,
                    pair[1].name
                );
            }
        }
    }

    #[test]
    fn test_rung_at_uses_floor() {
        let moe = Ladder::moe();
        assert_eq!(moe.rung_at(-20).level, -21);
        assert_eq!(moe.rung_at(3).level, 2);
        assert_eq!(moe.rung_at(-100).level, -25);
        assert_eq!(moe.rung_at(100).level, 10);
    }

    #[test]
    fn test_layer_share_buckets() {
        let dense = Ladder::dense();
        assert_eq!(dense.layer_share(-17), LayerShare::Full);
        assert_eq!(dense.layer_share(0), LayerShare::Fraction(0.50));
        assert_eq!(dense.layer_share(9), LayerShare::Fraction(0.10));
        assert_eq!(LayerShare::Fraction(0.5).layers(40), 20);
        assert_eq!(LayerShare::Full.layers(40), FULL_GPU_LAYERS);
    }

    #[test]
    fn test_fraction_span_resolution() {
        assert_eq!(
            Span::Fraction(4).resolve(32),
            LayerStride::ExplicitSet(vec![0, 4, 8, 12, 16, 20, 24, 28])
        );
        assert_eq!(Span::Even.resolve(32), LayerStride::EveryNth(2));
    }
}
