//! Process metric collector (reads /proc on Linux)

mod linux;
pub mod procfs;

pub use linux::{LinuxSampler, SystemParams};

use crate::error::Result;
use serde::{Deserialize, Serialize};

/// One metric read: a value, or a marker that the source could not be read.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum Reading<T> {
    Value(T),
    Unavailable,
}

impl<T: Copy + Default> Reading<T> {
    pub fn value_or_zero(&self) -> T {
        match self {
            Reading::Value(v) => *v,
            Reading::Unavailable => T::default(),
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Reading::Value(_))
    }
}

impl<T> From<Option<T>> for Reading<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => Reading::Value(v),
            None => Reading::Unavailable,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSample {
    pub pid: u32,
    /// Start time in clock ticks after boot; tells a reused pid apart.
    pub start_time: u64,
    pub name: String,
    /// Percent of the whole machine, 0-100.
    pub cpu_percent: Reading<f64>,
    pub memory_mb: f64,
    pub disk_bytes_per_sec: Reading<u64>,
    /// Sum over GPU engines, clamped to 0-100.
    pub gpu_percent: Reading<f64>,
    /// Non-storage character IO; an approximation of network traffic.
    pub net_bytes_per_sec: Reading<u64>,
}

pub trait ProcessSampler: Send + Sync {
    /// Sample every process whose name matches `pattern`.
    ///
    /// Processes that vanish or deny access mid-scan are left out of the
    /// result. Only a failure to enumerate processes at all is an error.
    fn sample(&self, pattern: &str) -> Result<Vec<ProcessSample>>;
}

/// Base executable name: no directories, no trailing `.exe`, trimmed.
pub fn normalize_process_name(name: &str) -> String {
    let name = name.trim();
    let base = name.rsplit(|c| c == '/' || c == '\\').next().unwrap_or(name);
    let stripped = match base.len().checked_sub(4) {
        Some(cut) if base.is_char_boundary(cut) && base[cut..].eq_ignore_ascii_case(".exe") => {
            &base[..cut]
        }
        _ => base,
    };
    stripped.to_string()
}

/// Case-insensitive comparison of a process name against a rule pattern.
pub fn name_matches(name: &str, pattern: &str) -> bool {
    let pattern = normalize_process_name(pattern);
    !pattern.is_empty() && normalize_process_name(name).eq_ignore_ascii_case(&pattern)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_path_and_exe() {
        assert_eq!(normalize_process_name("/usr/bin/firefox"), "firefox");
        assert_eq!(normalize_process_name("C:\\x\\App.exe"), "App");
        assert_eq!(normalize_process_name("python3.11"), "python3.11");
        assert_eq!(normalize_process_name(".exe"), "");
    }

    #[test]
    fn matching_ignores_case() {
        assert!(name_matches("Firefox", "firefox"));
        assert!(name_matches("/opt/app/APP", "app.exe"));
        assert!(!name_matches("firefox-esr", "firefox"));
        assert!(!name_matches("anything", ""));
    }

    #[test]
    fn reading_defaults_to_zero_when_unavailable() {
        assert_eq!(Reading::<u64>::Unavailable.value_or_zero(), 0);
        assert_eq!(Reading::Value(4.5).value_or_zero(), 4.5);
        assert!(!Reading::<f64>::from(None).is_available());
    }
}
