//! Typed tensor selectors
//!
//! A selector is a list of rules, each naming tensor classes and the blocks
//! they apply to. Rendering to the server's `--overridetensors` regex syntax
//! happens only at the command-building boundary; `parse` is its inverse and
//! exists so remembered command lines can be mapped back onto the ladder.

use crate::errors::{Result, TuneError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Placement target appended to rendered selectors
const HOST_SUFFIX: &str = "=CPU";
const BLOCK_PREFIX: &str = r"blk\.";
const ALL_BLOCKS: &str = r"\d+\.";
const EVEN_BLOCKS: &str = r"\d*[02468]\.";
const WEIGHT_SUFFIX: &str = r"\.weight";

/// Tensor classes the tuner can pin to host memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TensorClass {
    AttnQ,
    AttnK,
    AttnV,
    AttnOutput,
    AttnNorm,
    FfnUp,
    FfnDown,
    FfnGate,
    FfnNorm,
    FfnUpExps,
    FfnDownExps,
    FfnGateExps,
    TokenEmbeddings,
    Output,
}

impl TensorClass {
    pub const ALL: [TensorClass; 14] = [
        TensorClass::AttnQ,
        TensorClass::AttnK,
        TensorClass::AttnV,
        TensorClass::AttnOutput,
        TensorClass::AttnNorm,
        TensorClass::FfnUp,
        TensorClass::FfnDown,
        TensorClass::FfnGate,
        TensorClass::FfnNorm,
        TensorClass::FfnUpExps,
        TensorClass::FfnDownExps,
        TensorClass::FfnGateExps,
        TensorClass::TokenEmbeddings,
        TensorClass::Output,
    ];

    /// GGUF tensor name stem (without block prefix and `.weight`)
    pub fn gguf_name(&self) -> &'static str {
        match self {
            TensorClass::AttnQ => "attn_q",
            TensorClass::AttnK => "attn_k",
            TensorClass::AttnV => "attn_v",
            TensorClass::AttnOutput => "attn_output",
            TensorClass::AttnNorm => "attn_norm",
            TensorClass::FfnUp => "ffn_up",
            TensorClass::FfnDown => "ffn_down",
            TensorClass::FfnGate => "ffn_gate",
            TensorClass::FfnNorm => "ffn_norm",
            TensorClass::FfnUpExps => "ffn_up_exps",
            TensorClass::FfnDownExps => "ffn_down_exps",
            TensorClass::FfnGateExps => "ffn_gate_exps",
            TensorClass::TokenEmbeddings => "token_embd",
            TensorClass::Output => "output",
        }
    }

    pub fn from_gguf_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.gguf_name() == name)
    }

    /// Whether the tensor exists once per block
    pub fn is_per_layer(&self) -> bool {
        !matches!(self, TensorClass::TokenEmbeddings | TensorClass::Output)
    }

    /// Whether this is a mixture-of-experts expert tensor
    pub fn is_expert(&self) -> bool {
        matches!(
            self,
            TensorClass::FfnUpExps | TensorClass::FfnDownExps | TensorClass::FfnGateExps
        )
    }
}

impl fmt::Display for TensorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.gguf_name())
    }
}

/// Which blocks a rule applies to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayerStride {
    All,
    EveryNth(u32),
    ExplicitSet(Vec<u32>),
}

impl LayerStride {
    /// `groups` blocks spread evenly from block 0
    pub fn spread(total_layers: u32, groups: u32) -> Self {
        let total = total_layers.max(1);
        let groups = groups.max(1);
        let step = (total / groups).max(1);
        let blocks = (0..total).step_by(step as usize).take(groups as usize).collect();
        LayerStride::ExplicitSet(blocks)
    }

    /// Block indices covered in a model with `total_layers` blocks
    pub fn layers(&self, total_layers: u32) -> Vec<u32> {
        match self {
            LayerStride::All => (0..total_layers).collect(),
            LayerStride::EveryNth(n) => (0..total_layers).step_by((*n).max(1) as usize).collect(),
            LayerStride::ExplicitSet(set) => {
                set.iter().copied().filter(|b| *b < total_layers).collect()
            }
        }
    }

    fn render_prefix(&self, total_layers: u32) -> String {
        match self {
            LayerStride::All => format!("{}{}", BLOCK_PREFIX, ALL_BLOCKS),
            LayerStride::EveryNth(2) => format!("{}{}", BLOCK_PREFIX, EVEN_BLOCKS),
            other => {
                let blocks: Vec<String> = other
                    .layers(total_layers)
                    .iter()
                    .map(|b| b.to_string())
                    .collect();
                format!(r"{}({})\.", BLOCK_PREFIX, blocks.join("|"))
            }
        }
    }
}

/// One selector rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffloadRule {
    pub tensors: Vec<TensorClass>,
    pub layers: LayerStride,
}

impl OffloadRule {
    pub fn new(tensors: Vec<TensorClass>, layers: LayerStride) -> Self {
        Self { tensors, layers }
    }

    fn render(&self, total_layers: u32) -> Option<String> {
        if self.tensors.is_empty() {
            return None;
        }
        if let LayerStride::ExplicitSet(set) = &self.layers {
            if set.is_empty() {
                return None;
            }
        }

        let names: Vec<&str> = self.tensors.iter().map(|t| t.gguf_name()).collect();
        let group = if names.len() == 1 {
            names[0].to_string()
        } else {
            format!("({})", names.join("|"))
        };

        let per_layer = self.tensors.iter().all(|t| t.is_per_layer());
        let prefix = if per_layer {
            self.layers.render_prefix(total_layers)
        } else {
            String::new()
        };
        Some(format!("{}{}{}", prefix, group, WEIGHT_SUFFIX))
    }
}

/// Set of rules pinning tensors to host memory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorSelector {
    rules: Vec<OffloadRule>,
}

impl TensorSelector {
    pub fn new(rules: Vec<OffloadRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[OffloadRule] {
        &self.rules
    }

    /// Tensor classes pinned in at least one block
    pub fn pinned_classes(&self) -> BTreeSet<TensorClass> {
        self.rules
            .iter()
            .flat_map(|r| r.tensors.iter().copied())
            .collect()
    }

    /// Whether `class` in block `layer` is pinned to host memory
    pub fn pins(&self, class: TensorClass, layer: u32, total_layers: u32) -> bool {
        self.rules.iter().any(|r| {
            r.tensors.contains(&class)
                && (!class.is_per_layer() || r.layers.layers(total_layers).contains(&layer))
        })
    }

    /// Render as an `--overridetensors` value
    pub fn render(&self, total_layers: u32) -> Option<String> {
        let parts: Vec<String> = self
            .rules
            .iter()
            .filter_map(|r| r.render(total_layers))
            .collect();
        match parts.len() {
            0 => None,
            1 => Some(format!("{}{}", parts[0], HOST_SUFFIX)),
            _ => Some(format!("({}){}", parts.join("|"), HOST_SUFFIX)),
        }
    }

    /// Parse text produced by [`TensorSelector::render`]
    pub fn parse(text: &str) -> Result<Self> {
        let invalid = |reason: &str| TuneError::InvalidSelector {
            text: text.to_string(),
            reason: reason.to_string(),
        };

        let body = text
            .trim()
            .strip_suffix(HOST_SUFFIX)
            .ok_or_else(|| invalid("missing '=CPU' placement"))?;

        let body = if body.starts_with('(') && closing_paren(body, 0) == Some(body.len() - 1) {
            &body[1..body.len() - 1]
        } else {
            body
        };

        let rules = split_top_level(body)
            .into_iter()
            .map(|part| parse_rule(part).map_err(|reason| invalid(&reason)))
            .collect::<Result<Vec<_>>>()?;

        if rules.is_empty() {
            return Err(invalid("no rules"));
        }
        Ok(Self { rules })
    }
}

fn closing_paren(text: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, ch) in text.char_indices().skip_while(|(i, _)| *i < open) {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn split_top_level(text: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0usize;
    for (i, ch) in text.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => depth -= 1,
            '|' if depth == 0 => {
                parts.push(&text[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&text[start..]);
    parts.into_iter().filter(|p| !p.is_empty()).collect()
}

fn parse_rule(part: &str) -> std::result::Result<OffloadRule, String> {
    let (layers, rest) = match part.strip_prefix(BLOCK_PREFIX) {
        Some(after) => parse_blocks(after)?,
        None => (LayerStride::All, part),
    };

    let names = rest
        .strip_suffix(WEIGHT_SUFFIX)
        .ok_or_else(|| format!("'{}' does not end in a weight tensor", part))?;
    let names: Vec<&str> = match names.strip_prefix('(').and_then(|n| n.strip_suffix(')')) {
        Some(inner) => inner.split('|').collect(),
        None => vec![names],
    };

    let tensors = names
        .iter()
        .map(|n| TensorClass::from_gguf_name(n).ok_or_else(|| format!("unknown tensor '{}'", n)))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let global = part.strip_prefix(BLOCK_PREFIX).is_none();
    if global && tensors.iter().any(|t| t.is_per_layer()) {
        return Err(format!("'{}' names block tensors without a block prefix", part));
    }

    Ok(OffloadRule { tensors, layers })
}

fn parse_blocks(after: &str) -> std::result::Result<(LayerStride, &str), String> {
    if let Some(rest) = after.strip_prefix(ALL_BLOCKS) {
        return Ok((LayerStride::All, rest));
    }
    if let Some(rest) = after.strip_prefix(EVEN_BLOCKS) {
        return Ok((LayerStride::EveryNth(2), rest));
    }
    if after.starts_with('(') {
        let close = closing_paren(after, 0).ok_or("unbalanced block list")?;
        let blocks = after[1..close]
            .split('|')
            .map(|b| b.parse::<u32>().map_err(|_| format!("bad block index '{}'", b)))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let rest = after[close + 1..]
            .strip_prefix(r"\.")
            .ok_or("block list not followed by '\\.'")?;
        return Ok((LayerStride::ExplicitSet(blocks), rest));
    }
    Err(format!("unrecognised block pattern '{}'", after))
}
