//! VRAM oracle
//!
//! Each query is a fresh snapshot of free/total accelerator memory. Callers
//! may poll cheaply and repeatedly; nothing here caches.

use crate::errors::{Result, TuneError};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::process::Command;
use std::sync::{Arc, Mutex};
use sysinfo::System;
use tracing::debug;

/// GPU vendor behind a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Unknown,
}

impl fmt::Display for GpuVendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GpuVendor::Nvidia => "NVIDIA",
            GpuVendor::Amd => "AMD",
            GpuVendor::Intel => "Intel",
            GpuVendor::Apple => "Apple",
            GpuVendor::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

/// One reading of accelerator memory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VramSnapshot {
    pub free_mb: u64,
    pub total_mb: u64,
    pub vendor: GpuVendor,
    pub message: String,
    /// Manual cap on usable VRAM
    #[serde(default)]
    pub budget_total_mb: Option<u64>,
}

impl VramSnapshot {
    pub fn new(free_mb: u64, total_mb: u64, vendor: GpuVendor) -> Self {
        Self {
            free_mb: free_mb.min(total_mb),
            total_mb,
            vendor,
            message: format!("{} GPU: {} MB free of {} MB", vendor, free_mb.min(total_mb), total_mb),
            budget_total_mb: None,
        }
    }

    /// Snapshot for a machine without a usable GPU reading
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            free_mb: 0,
            total_mb: 0,
            vendor: GpuVendor::Unknown,
            message: message.into(),
            budget_total_mb: None,
        }
    }

    pub fn has_reading(&self) -> bool {
        self.budgeted_total_mb() > 0
    }

    pub fn used_mb(&self) -> u64 {
        self.total_mb.saturating_sub(self.free_mb)
    }

    /// Total VRAM after applying the manual budget
    pub fn budgeted_total_mb(&self) -> u64 {
        match self.budget_total_mb {
            Some(budget) if self.total_mb > 0 => budget.min(self.total_mb),
            Some(budget) => budget,
            None => self.total_mb,
        }
    }

    /// Free VRAM within the budget
    pub fn budgeted_free_mb(&self) -> u64 {
        self.budgeted_total_mb().saturating_sub(self.used_mb())
    }
}

/// Source of VRAM snapshots
pub trait VramOracle: Send + Sync {
    fn query(&self) -> Result<VramSnapshot>;
}

impl<T: VramOracle + ?Sized> VramOracle for Arc<T> {
    fn query(&self) -> Result<VramSnapshot> {
        (**self).query()
    }
}

impl<T: VramOracle + ?Sized> VramOracle for Box<T> {
    fn query(&self) -> Result<VramSnapshot> {
        (**self).query()
    }
}

/// Oracle backed by `nvidia-smi`
#[derive(Debug, Clone, Default)]
pub struct NvidiaSmiOracle {
    gpu_index: u32,
}

impl NvidiaSmiOracle {
    pub fn new(gpu_index: u32) -> Self {
        Self { gpu_index }
    }

    fn system_ram_message() -> String {
        let mut sys = System::new();
        sys.refresh_memory();
        let mb = |bytes: u64| bytes / (1024 * 1024);
        format!(
            "No NVIDIA GPU detected; system RAM {} MB available of {} MB",
            mb(sys.available_memory()),
            mb(sys.total_memory())
        )
    }
}

impl VramOracle for NvidiaSmiOracle {
    fn query(&self) -> Result<VramSnapshot> {
        let output = Command::new("nvidia-smi")
            .args([
                "--query-gpu=memory.free,memory.total,name",
                "--format=csv,noheader,nounits",
                &format!("--id={}", self.gpu_index),
            ])
            .output();

        let output = match output {
            Ok(out) if out.status.success() => out,
            Ok(out) => {
                debug!(status = ?out.status, "nvidia-smi reported failure");
                return Ok(VramSnapshot::unavailable(Self::system_ram_message()));
            }
            Err(e) => {
                debug!(error = %e, "nvidia-smi not available");
                return Ok(VramSnapshot::unavailable(Self::system_ram_message()));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_nvidia_smi(&stdout)
    }
}

fn parse_nvidia_smi(stdout: &str) -> Result<VramSnapshot> {
    let line = stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| TuneError::Oracle("nvidia-smi returned no rows".to_string()))?;

    let parts: Vec<&str> = line.split(',').map(|s| s.trim()).collect();
    if parts.len() < 2 {
        return Err(TuneError::Oracle(format!("unexpected nvidia-smi row: {}", line)));
    }

    let parse = |s: &str| {
        s.parse::<u64>()
            .map_err(|_| TuneError::Oracle(format!("unexpected nvidia-smi value '{}'", s)))
    };
    let free = parse(parts[0])?;
    let total = parse(parts[1])?;

    let mut snapshot = VramSnapshot::new(free, total, GpuVendor::Nvidia);
    if let Some(name) = parts.get(2).filter(|n| !n.is_empty()) {
        snapshot.message = format!("{}: {} MB free of {} MB", name, snapshot.free_mb, total);
    }
    Ok(snapshot)
}

/// Oracle returning scripted readings; the last entry repeats forever
#[derive(Debug)]
pub struct StaticOracle {
    script: Mutex<VecDeque<std::result::Result<VramSnapshot, String>>>,
}

impl StaticOracle {
    pub fn new(snapshot: VramSnapshot) -> Self {
        Self::scripted(vec![Ok(snapshot)])
    }

    pub fn fixed(free_mb: u64, total_mb: u64) -> Self {
        Self::new(VramSnapshot::new(free_mb, total_mb, GpuVendor::Unknown))
    }

    /// `Err` entries surface as oracle faults
    pub fn scripted(script: Vec<std::result::Result<VramSnapshot, String>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
        }
    }
}

impl VramOracle for StaticOracle {
    fn query(&self) -> Result<VramSnapshot> {
        let mut script = self
            .script
            .lock()
            .map_err(|_| TuneError::Oracle("scripted oracle poisoned".to_string()))?;

        let next = if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().cloned()
        };

        match next {
            Some(Ok(snapshot)) => Ok(snapshot),
            Some(Err(message)) => Err(TuneError::Oracle(message)),
            None => Ok(VramSnapshot::unavailable("no scripted reading")),
        }
    }
}

/// Wraps another oracle and applies a manual VRAM budget
pub struct BudgetedOracle<O> {
    inner: O,
    budget_mb: Option<u64>,
}

impl<O: VramOracle> BudgetedOracle<O> {
    pub fn new(inner: O, budget_mb: Option<u64>) -> Self {
        Self { inner, budget_mb }
    }
}

impl<O: VramOracle> VramOracle for BudgetedOracle<O> {
    fn query(&self) -> Result<VramSnapshot> {
        let mut snapshot = self.inner.query()?;
        if let Some(budget) = self.budget_mb.filter(|b| *b > 0) {
            snapshot.budget_total_mb = Some(budget);
            snapshot.message = format!("{} (budget {} MB)", snapshot.message, budget);
        }
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nvidia_smi_row() {
        let snap = parse_nvidia_smi("10240, 24576, NVIDIA GeForce RTX 4090\n").unwrap();
        assert_eq!(snap.free_mb, 10240);
        assert_eq!(snap.total_mb, 24576);
        assert_eq!(snap.vendor, GpuVendor::Nvidia);
        assert!(snap.message.contains("RTX 4090"));
    }

    #[test]
    fn test_parse_nvidia_smi_garbage() {
        assert!(parse_nvidia_smi("").is_err());
        assert!(parse_nvidia_smi("[N/A], 24576").is_err());
    }

    #[test]
    fn test_budget_caps_free_memory() {
        let mut snap = VramSnapshot::new(20_000, 24_000, GpuVendor::Nvidia);
        assert_eq!(snap.budgeted_free_mb(), 20_000);

        snap.budget_total_mb = Some(12_000);
        assert_eq!(snap.budgeted_total_mb(), 12_000);
        // 4000 MB already used elsewhere
        assert_eq!(snap.budgeted_free_mb(), 8_000);
    }

    #[test]
    fn test_budget_without_reading() {
        let mut snap = VramSnapshot::unavailable("none");
        assert!(!snap.has_reading());
        snap.budget_total_mb = Some(8192);
        assert_eq!(snap.budgeted_free_mb(), 8192);
    }

    #[test]
    fn test_scripted_oracle_repeats_last() {
        let oracle = StaticOracle::scripted(vec![
            Ok(VramSnapshot::new(10_000, 12_000, GpuVendor::Amd)),
            Err("driver reset".to_string()),
            Ok(VramSnapshot::new(4_000, 12_000, GpuVendor::Amd)),
        ]);
        assert_eq!(oracle.query().unwrap().free_mb, 10_000);
        assert!(matches!(oracle.query(), Err(TuneError::Oracle(_))));
        assert_eq!(oracle.query().unwrap().free_mb, 4_000);
        assert_eq!(oracle.query().unwrap().free_mb, 4_000);
    }

    #[test]
    fn test_budgeted_oracle() {
        let oracle = BudgetedOracle::new(StaticOracle::fixed(8_000, 16_000), Some(10_000));
        let snap = oracle.query().unwrap();
        assert_eq!(snap.budgeted_total_mb(), 10_000);
        assert_eq!(snap.budgeted_free_mb(), 2_000);
        assert!(snap.message.contains("budget"));
    }
}
