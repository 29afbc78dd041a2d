//! Model profiles
//!
//! This module provides:
//! - The immutable `ModelProfile` the tuner works against
//! - The `ModelAnalyzer` producer contract and a filename-based analyzer
//! - Full-GPU footprint estimation used by the start-level heuristics

pub mod analyzer;
pub mod types;

// Re-export key types for convenience
pub use analyzer::{estimated_full_gpu_mb, FilenameAnalyzer, ModelAnalyzer};
pub use types::{ModelClass, ModelProfile};
