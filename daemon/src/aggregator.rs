//! Per-rule totals across every matched process

use crate::collector::ProcessSample;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Totals {
    /// Summed, not averaged: two processes at 20% give 40%.
    pub cpu_pct: f64,
    pub memory_mb: f64,
    pub disk_bytes_per_sec: u64,
    pub gpu_pct: f64,
    pub net_bytes_per_sec: u64,
    pub count: usize,
}

impl Totals {
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Unavailable readings count as zero.
pub fn aggregate(samples: &[ProcessSample]) -> Totals {
    samples.iter().fold(Totals::default(), |mut totals, s| {
        totals.cpu_pct += s.cpu_percent.value_or_zero();
        totals.memory_mb += s.memory_mb;
        totals.disk_bytes_per_sec = totals
            .disk_bytes_per_sec
            .saturating_add(s.disk_bytes_per_sec.value_or_zero());
        totals.gpu_pct += s.gpu_percent.value_or_zero();
        totals.net_bytes_per_sec = totals
            .net_bytes_per_sec
            .saturating_add(s.net_bytes_per_sec.value_or_zero());
        totals.count += 1;
        totals
    })
}
