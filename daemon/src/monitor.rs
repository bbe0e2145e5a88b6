//! One monitoring cycle: sample, aggregate, evaluate and enforce every rule.
//!
//! Nothing here schedules or sleeps; `service` decides when a cycle runs and
//! `run_cycle` does the work against an explicit `MonitorState`.

use crate::aggregator::{aggregate, Totals};
use crate::collector::ProcessSampler;
use crate::config::{Rule, Settings, Thresholds};
use crate::detector::{Decision, ExceedTracker};
use crate::executor::{Enforcer, KillOutcome};
use crate::protocol::Event;
use chrono::{DateTime, Utc};
use std::any::Any;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

pub const NO_RULES_STATUS: &str = "no enabled rules";
pub const ERROR_STATUS: &str = "monitoring error";

/// State carried from one cycle to the next.
#[derive(Debug, Default)]
pub struct MonitorState {
    pub tracker: ExceedTracker,
    pub cycles: u64,
}

impl MonitorState {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RuleOutcome {
    NoProcess,
    SampleFailed(String),
    /// Checking the rule panicked; kills already made by other rules still count.
    Failed(String),
    Evaluated {
        totals: Totals,
        thresholds: Thresholds,
        decision: Decision,
        pids: Vec<u32>,
        kills: Vec<(u32, KillOutcome)>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuleReport {
    pub display_name: String,
    pub process_name: String,
    pub outcome: RuleOutcome,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub rules: Vec<RuleReport>,
    pub elapsed: Duration,
}

impl RuleReport {
    fn status_segment(&self) -> String {
        let name = &self.display_name;
        match &self.outcome {
            RuleOutcome::NoProcess => format!("{name}: no process"),
            RuleOutcome::SampleFailed(_) | RuleOutcome::Failed(_) => format!("{name}: error"),
            RuleOutcome::Evaluated {
                totals,
                thresholds: th,
                decision,
                kills,
                ..
            } => {
                let mut line = format!(
                    "{name}: {} procs, CPU {:.1}%/{:.1}%, mem {:.0}MB/{}MB, disk {}B/s/{}B/s, GPU {:.1}%/{:.1}%, net {}B/s/{}B/s",
                    totals.count,
                    totals.cpu_pct,
                    th.cpu_pct,
                    totals.memory_mb,
                    th.memory_mb,
                    totals.disk_bytes_per_sec,
                    th.disk_bytes_per_sec,
                    totals.gpu_pct,
                    th.gpu_pct,
                    totals.net_bytes_per_sec,
                    th.net_bytes_per_sec,
                );
                if decision.verdict.exceeded() {
                    line.push_str(&format!(
                        ", sustained {}/{}s",
                        decision.sustained.as_secs(),
                        decision.required.as_secs()
                    ));
                }
                if !kills.is_empty() {
                    let ok = kills.iter().filter(|(_, o)| o.is_success()).count();
                    line.push_str(&format!(", killed {ok}/{}", kills.len()));
                }
                line
            }
        }
    }
}

impl CycleReport {
    /// Rule segments joined by " | ", in rule order.
    pub fn status_line(&self) -> String {
        if self.rules.is_empty() {
            return NO_RULES_STATUS.to_string();
        }
        self.rules
            .iter()
            .map(RuleReport::status_segment)
            .collect::<Vec<_>>()
            .join(" | ")
    }

    pub fn kills(&self) -> impl Iterator<Item = (&RuleReport, u32, &KillOutcome)> {
        self.rules.iter().flat_map(|rule| {
            let kills: &[(u32, KillOutcome)] = match &rule.outcome {
                RuleOutcome::Evaluated { kills, .. } => kills,
                _ => &[],
            };
            kills.iter().map(move |(pid, outcome)| (rule, *pid, outcome))
        })
    }

    /// Exceed and kill events followed by the status line.
    pub fn events(&self) -> Vec<Event> {
        let mut events = Vec::new();
        for rule in &self.rules {
            let RuleOutcome::Evaluated {
                totals,
                decision,
                pids,
                kills,
                ..
            } = &rule.outcome
            else {
                continue;
            };
            if !decision.fire {
                continue;
            }
            events.push(Event::ThresholdExceeded {
                rule: rule.display_name.clone(),
                process_name: rule.process_name.clone(),
                metrics: decision.verdict.breached(),
                totals: totals.clone(),
                sustained_seconds: decision.sustained.as_secs_f64(),
                pids: pids.clone(),
            });
            events.extend(kills.iter().map(|(pid, outcome)| Event::ProcessKilled {
                rule: rule.display_name.clone(),
                pid: *pid,
                outcome: outcome.clone(),
            }));
        }
        events.push(Event::Status {
            line: self.status_line(),
        });
        events
    }
}

/// Run every enabled rule once, in list order.
pub fn run_cycle(
    sampler: &dyn ProcessSampler,
    enforcer: &dyn Enforcer,
    state: &mut MonitorState,
    settings: &Settings,
    now: DateTime<Utc>,
) -> CycleReport {
    let started = Instant::now();
    state.cycles += 1;

    // Timers of removed or disabled rules must not survive until re-enabled.
    let keys: HashSet<String> = settings.enabled_rules().map(Rule::key).collect();
    state.tracker.retain_keys(&keys);

    let rules = settings
        .enabled_rules()
        .map(|rule| RuleReport {
            display_name: rule.display_name.clone(),
            process_name: rule.process_name.clone(),
            outcome: guarded_check(sampler, enforcer, &mut state.tracker, settings, rule, now),
        })
        .collect::<Vec<_>>();

    CycleReport {
        rules,
        elapsed: started.elapsed(),
    }
}

/// A panic while checking one rule is contained to that rule.
fn guarded_check(
    sampler: &dyn ProcessSampler,
    enforcer: &dyn Enforcer,
    tracker: &mut ExceedTracker,
    settings: &Settings,
    rule: &Rule,
    now: DateTime<Utc>,
) -> RuleOutcome {
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        check_rule(sampler, enforcer, tracker, settings, rule, now)
    }));
    result.unwrap_or_else(|payload| {
        let message = panic_message(payload.as_ref());
        error!("[{}] Check panicked: {}", rule.process_name, message);
        RuleOutcome::Failed(message)
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn check_rule(
    sampler: &dyn ProcessSampler,
    enforcer: &dyn Enforcer,
    tracker: &mut ExceedTracker,
    settings: &Settings,
    rule: &Rule,
    now: DateTime<Utc>,
) -> RuleOutcome {
    let samples = match sampler.sample(&rule.process_name) {
        Ok(samples) => samples,
        Err(e) => {
            error!("[{}] Failed to sample processes: {}", rule.process_name, e);
            return RuleOutcome::SampleFailed(e.to_string());
        }
    };

    let key = rule.key();
    if samples.is_empty() {
        tracker.clear(&key);
        return RuleOutcome::NoProcess;
    }

    let totals = aggregate(&samples);
    let thresholds = rule.effective_thresholds(&settings.global_thresholds);
    let decision = tracker.observe(&key, &totals, &thresholds, now);
    let pids: Vec<u32> = samples.iter().map(|s| s.pid).collect();

    let mut kills = Vec::new();
    if decision.fire {
        warn!(
            "[{}] Thresholds exceeded ({:?}): CPU={:.1}%>{:.1}% mem={:.0}MB>{}MB disk={}B/s>{}B/s GPU={:.1}%>{:.1}% net={}B/s>{}B/s, terminating {} processes",
            rule.process_name,
            decision.verdict.breached(),
            totals.cpu_pct,
            thresholds.cpu_pct,
            totals.memory_mb,
            thresholds.memory_mb,
            totals.disk_bytes_per_sec,
            thresholds.disk_bytes_per_sec,
            totals.gpu_pct,
            thresholds.gpu_pct,
            totals.net_bytes_per_sec,
            thresholds.net_bytes_per_sec,
            pids.len(),
        );
        // Every matched process goes, not only the heaviest one.
        for sample in &samples {
            let pid = sample.pid;
            let outcome = enforcer.kill(pid, sample.start_time);
            match &outcome {
                KillOutcome::Terminated => info!("[{}] Terminated pid {}", rule.process_name, pid),
                KillOutcome::TimedOut => warn!(
                    "[{}] Pid {} still running after terminate request",
                    rule.process_name, pid
                ),
                KillOutcome::Failed(reason) => warn!(
                    "[{}] Failed to terminate pid {}: {}",
                    rule.process_name, pid, reason
                ),
            }
            kills.push((pid, outcome));
        }
    }

    RuleOutcome::Evaluated {
        totals,
        thresholds,
        decision,
        pids,
        kills,
    }
}

/// Sampler, enforcer and state bundled for the blocking tick task.
pub struct Engine {
    sampler: Arc<dyn ProcessSampler>,
    enforcer: Arc<dyn Enforcer>,
    state: Mutex<MonitorState>,
}

impl Engine {
    pub fn new(sampler: Arc<dyn ProcessSampler>, enforcer: Arc<dyn Enforcer>) -> Self {
        Self {
            sampler,
            enforcer,
            state: Mutex::new(MonitorState::new()),
        }
    }

    /// A panic in an earlier cycle poisons the lock; the state is still usable.
    pub fn run_cycle(&self, settings: &Settings, now: DateTime<Utc>) -> CycleReport {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        run_cycle(
            self.sampler.as_ref(),
            self.enforcer.as_ref(),
            &mut state,
            settings,
            now,
        )
    }

    pub fn cycles(&self) -> u64 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cycles
    }
}
