//! Threshold evaluation and sustain tracking

use crate::aggregator::Totals;
use crate::config::Thresholds;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Cpu,
    Memory,
    Disk,
    Gpu,
    Network,
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Metric::Cpu => "cpu",
            Metric::Memory => "memory",
            Metric::Disk => "disk",
            Metric::Gpu => "gpu",
            Metric::Network => "network",
        };
        f.write_str(name)
    }
}

/// Per-metric outcome of comparing totals with thresholds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub cpu: bool,
    pub memory: bool,
    pub disk: bool,
    pub gpu: bool,
    pub network: bool,
}

impl Verdict {
    /// A threshold of 0 never counts, whatever the totals.
    pub fn evaluate(totals: &Totals, th: &Thresholds) -> Self {
        Verdict {
            cpu: th.cpu_pct > 0.0 && totals.cpu_pct > th.cpu_pct,
            memory: th.memory_mb > 0 && totals.memory_mb > th.memory_mb as f64,
            disk: th.disk_bytes_per_sec > 0 && totals.disk_bytes_per_sec > th.disk_bytes_per_sec,
            gpu: th.gpu_pct > 0.0 && totals.gpu_pct > th.gpu_pct,
            network: th.net_bytes_per_sec > 0 && totals.net_bytes_per_sec > th.net_bytes_per_sec,
        }
    }

    /// Any single metric over its limit is enough.
    pub fn exceeded(&self) -> bool {
        self.cpu || self.memory || self.disk || self.gpu || self.network
    }

    pub fn breached(&self) -> Vec<Metric> {
        [
            (self.cpu, Metric::Cpu),
            (self.memory, Metric::Memory),
            (self.disk, Metric::Disk),
            (self.gpu, Metric::Gpu),
            (self.network, Metric::Network),
        ]
        .into_iter()
        .filter_map(|(hit, metric)| hit.then_some(metric))
        .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceedState {
    Clear,
    Exceeding { since: DateTime<Utc> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub verdict: Verdict,
    /// How long the rule has been continuously over; zero when clear.
    pub sustained: Duration,
    pub required: Duration,
    /// Enforce now. The tracker is already back to `Clear` when this is set.
    pub fire: bool,
}

impl Decision {
    fn clear() -> Self {
        Decision {
            verdict: Verdict::default(),
            sustained: Duration::ZERO,
            required: Duration::ZERO,
            fire: false,
        }
    }
}

/// When each rule's totals first went over its thresholds.
///
/// Keys are process names, compared case-insensitively.
#[derive(Debug, Default)]
pub struct ExceedTracker {
    since: HashMap<String, DateTime<Utc>>,
}

impl ExceedTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, key: &str) -> ExceedState {
        match self.since.get(&key.to_lowercase()) {
            Some(since) => ExceedState::Exceeding { since: *since },
            None => ExceedState::Clear,
        }
    }

    pub fn clear(&mut self, key: &str) {
        self.since.remove(&key.to_lowercase());
    }

    /// Forget every key not in `keys` (lowercase).
    pub fn retain_keys(&mut self, keys: &HashSet<String>) {
        self.since.retain(|key, _| keys.contains(key));
    }

    pub fn len(&self) -> usize {
        self.since.len()
    }

    pub fn is_empty(&self) -> bool {
        self.since.is_empty()
    }

    /// Advance one rule by one sample.
    ///
    /// Any sample under the limits resets the timer; there is no partial
    /// credit. No matched process also resets it.
    pub fn observe(
        &mut self,
        key: &str,
        totals: &Totals,
        th: &Thresholds,
        now: DateTime<Utc>,
    ) -> Decision {
        let key = key.to_lowercase();
        if totals.is_empty() {
            self.since.remove(&key);
            return Decision::clear();
        }

        let verdict = Verdict::evaluate(totals, th);
        let required = th.sustain();
        if !verdict.exceeded() {
            self.since.remove(&key);
            return Decision {
                verdict,
                required,
                ..Decision::clear()
            };
        }

        let since = *self.since.entry(key.clone()).or_insert(now);
        let sustained = (now - since).to_std().unwrap_or(Duration::ZERO);
        let fire = required.is_zero() || sustained >= required;
        if fire {
            self.since.remove(&key);
        }
        Decision {
            verdict,
            sustained,
            required,
            fire,
        }
    }
}
