//! Offload strategy generation
//!
//! This module provides:
//! - Typed tensor selectors rendered to the server's override syntax
//! - Per-class offload ladders with their level bounds
//! - The `StrategyGenerator` mapping attempt levels to placement policies

pub mod generator;
pub mod ladder;
pub mod tensors;

pub use generator::{OffloadPolicy, PlanRow, StrategyGenerator};
pub use ladder::{Ladder, LevelBounds, FULL_GPU_LAYERS};
pub use tensors::{LayerStride, OffloadRule, TensorClass, TensorSelector};
