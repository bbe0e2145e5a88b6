//! IPC protocol definitions (JSON messages) and monitor events

use crate::aggregator::Totals;
use crate::config::{Settings, Thresholds};
use crate::detector::Metric;
use crate::executor::KillOutcome;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Structured events published by the monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    Started {
        interval_seconds: u64,
    },
    Stopped,
    IntervalChanged {
        interval_seconds: u64,
    },
    ThresholdExceeded {
        rule: String,
        process_name: String,
        metrics: Vec<Metric>,
        totals: Totals,
        sustained_seconds: f64,
        pids: Vec<u32>,
    },
    ProcessKilled {
        rule: String,
        pid: u32,
        outcome: KillOutcome,
    },
    /// A tick fired while the previous one was still running.
    TickSkipped,
    Status {
        line: String,
    },
    TickFailed {
        message: String,
        elapsed_ms: u64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
    Ping,
    StartMonitoring,
    StopMonitoring,
    GetStatus,
    GetSettings,
    AddRule { params: AddRuleParams },
    RemoveRule { params: RuleIdParams },
    SetRuleEnabled { params: SetRuleEnabledParams },
    SetRuleThresholds { params: SetRuleThresholdsParams },
    SetGlobalThresholds { params: Thresholds },
    SetInterval { params: SetIntervalParams },
    SaveSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddRuleParams {
    pub process_name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub executable_path: String,
    /// Private thresholds; the rule uses the global ones when absent.
    #[serde(default)]
    pub thresholds: Option<Thresholds>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleIdParams {
    pub id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetRuleEnabledParams {
    pub id: Uuid,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetRuleThresholdsParams {
    pub id: Uuid,
    /// `None` switches the rule back to the global thresholds.
    pub thresholds: Option<Thresholds>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetIntervalParams {
    pub seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Pong,
    Ok { data: serde_json::Value },
    Error { message: String },
    Status { data: StatusData },
    Settings { data: Settings },
    Event { data: Event },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusData {
    pub running: bool,
    pub interval_seconds: u64,
    pub tick_in_flight: bool,
    pub enabled_rules: usize,
    pub status: String,
}

impl Response {
    pub fn ok(data: serde_json::Value) -> Self {
        Response::Ok { data }
    }

    pub fn error(message: impl ToString) -> Self {
        Response::Error {
            message: message.to_string(),
        }
    }
}
