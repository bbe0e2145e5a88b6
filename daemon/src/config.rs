//! Configuration management (TOML)
//!
//! `Settings` is the value the monitor works on: global thresholds plus the
//! rule list. `Config` wraps it with the daemon's own knobs and is what gets
//! written to disk.

use crate::collector::normalize_process_name;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

pub const SETTINGS_VERSION: u32 = 1;
pub const MIN_INTERVAL_SECS: u64 = 1;
pub const MAX_INTERVAL_SECS: u64 = 3600;

/// Clamp a sampling interval to `[1, 3600]` seconds.
pub fn clamp_interval(seconds: u64) -> u64 {
    seconds.clamp(MIN_INTERVAL_SECS, MAX_INTERVAL_SECS)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub settings: Settings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub sample_interval_seconds: u64,
    pub kill_grace_seconds: u64,
    pub start_monitoring: bool,
    pub notify_on_kill: bool,
}

/// Limits for one rule. A value of 0 disables that metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub cpu_pct: f64,
    pub memory_mb: u64,
    pub disk_bytes_per_sec: u64,
    pub gpu_pct: f64,
    pub net_bytes_per_sec: u64,
    pub sustain_seconds: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: Uuid,
    pub display_name: String,
    pub process_name: String,
    #[serde(default)]
    pub executable_path: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub use_global_thresholds: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thresholds: Option<Thresholds>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub global_thresholds: Thresholds,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

fn default_true() -> bool {
    true
}

fn default_version() -> u32 {
    SETTINGS_VERSION
}

impl Default for GeneralConfig {
    fn default() -> Self {
        GeneralConfig {
            sample_interval_seconds: 5,
            kill_grace_seconds: 3,
            start_monitoring: true,
            notify_on_kill: true,
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Thresholds {
            cpu_pct: 30.0,
            memory_mb: 2048,
            disk_bytes_per_sec: 0,
            gpu_pct: 0.0,
            net_bytes_per_sec: 0,
            sustain_seconds: 5,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            version: SETTINGS_VERSION,
            global_thresholds: Thresholds::default(),
            rules: vec![],
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            general: GeneralConfig::default(),
            settings: Settings::default(),
        }
    }
}

impl Thresholds {
    /// Thresholds with every metric disabled.
    pub fn disabled() -> Self {
        Thresholds {
            cpu_pct: 0.0,
            memory_mb: 0,
            disk_bytes_per_sec: 0,
            gpu_pct: 0.0,
            net_bytes_per_sec: 0,
            sustain_seconds: 0,
        }
    }

    /// Negative sustain becomes 0; negative or NaN percentages become 0 (disabled).
    pub fn normalized(&self) -> Self {
        fn pct(v: f64) -> f64 {
            if v.is_nan() || v < 0.0 {
                0.0
            } else {
                v
            }
        }
        Thresholds {
            cpu_pct: pct(self.cpu_pct),
            gpu_pct: pct(self.gpu_pct),
            sustain_seconds: self.sustain_seconds.max(0),
            ..self.clone()
        }
    }

    pub fn sustain(&self) -> Duration {
        Duration::from_secs(self.sustain_seconds.max(0) as u64)
    }
}

impl Rule {
    /// New enabled rule on global thresholds. The display name falls back to
    /// the process name when blank.
    pub fn new(process_name: &str, display_name: &str) -> Result<Self> {
        let process_name = normalize_process_name(process_name);
        if process_name.is_empty() {
            return Err(Error::InvalidRule("process name is empty".to_string()));
        }
        let display_name = match display_name.trim() {
            "" => process_name.clone(),
            name => name.to_string(),
        };
        Ok(Rule {
            id: Uuid::new_v4(),
            display_name,
            process_name,
            executable_path: String::new(),
            enabled: true,
            use_global_thresholds: true,
            thresholds: None,
        })
    }

    pub fn with_thresholds(mut self, thresholds: Thresholds) -> Self {
        self.use_global_thresholds = false;
        self.thresholds = Some(thresholds);
        self
    }

    pub fn with_executable_path(mut self, path: &str) -> Self {
        self.executable_path = path.to_string();
        self
    }

    /// Thresholds this rule is evaluated against, already normalized.
    pub fn effective_thresholds(&self, global: &Thresholds) -> Thresholds {
        match (&self.thresholds, self.use_global_thresholds) {
            (Some(own), false) => own.normalized(),
            _ => global.normalized(),
        }
    }

    /// Key for per-rule state: the normalized process name, lowercased.
    pub fn key(&self) -> String {
        normalize_process_name(&self.process_name).to_lowercase()
    }
}

impl Settings {
    pub fn enabled_rules(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter().filter(|r| r.enabled)
    }

    pub fn rule(&self, id: Uuid) -> Option<&Rule> {
        self.rules.iter().find(|r| r.id == id)
    }

    pub fn rule_mut(&mut self, id: Uuid) -> Result<&mut Rule> {
        self.rules
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(Error::UnknownRule(id))
    }

    /// Append a rule. Process names are normalized and unique, compared
    /// case-insensitively.
    pub fn add_rule(&mut self, mut rule: Rule) -> Result<Uuid> {
        rule.process_name = normalize_process_name(&rule.process_name);
        if rule.process_name.is_empty() {
            return Err(Error::InvalidRule("process name is empty".to_string()));
        }
        let key = rule.key();
        if self.rules.iter().any(|r| r.key() == key) {
            return Err(Error::DuplicateRule(rule.process_name));
        }
        let id = rule.id;
        self.rules.push(rule);
        Ok(id)
    }

    /// Normalize every process name, dropping blank and duplicate rules.
    /// The first rule for a name wins.
    pub fn normalize_rules(&mut self) {
        let rules = std::mem::take(&mut self.rules);
        for rule in rules {
            let name = rule.process_name.clone();
            if let Err(e) = self.add_rule(rule) {
                warn!("Dropping rule for '{}': {}", name, e);
            }
        }
    }

    pub fn remove_rule(&mut self, id: Uuid) -> Result<Rule> {
        let index = self
            .rules
            .iter()
            .position(|r| r.id == id)
            .ok_or(Error::UnknownRule(id))?;
        Ok(self.rules.remove(index))
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.general.sample_interval_seconds =
            clamp_interval(config.general.sample_interval_seconds);
        config.settings.normalize_rules();
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        directories::ProjectDirs::from("", "", "capguard")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .unwrap_or_else(|| PathBuf::from("config.toml"))
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.general.kill_grace_seconds)
    }
}
