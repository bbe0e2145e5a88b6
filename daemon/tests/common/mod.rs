//! Fakes shared by the integration tests.
#![allow(dead_code)]

use capguard_daemon::collector::{ProcessSample, ProcessSampler, Reading};
use capguard_daemon::executor::{Enforcer, KillOutcome};
use capguard_daemon::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Mutex;

pub fn sample(pid: u32, name: &str, cpu: f64, memory_mb: f64) -> ProcessSample {
    ProcessSample {
        pid,
        start_time: 1000 + pid as u64,
        name: name.to_string(),
        cpu_percent: Reading::Value(cpu),
        memory_mb,
        disk_bytes_per_sec: Reading::Value(0),
        gpu_percent: Reading::Value(0.0),
        net_bytes_per_sec: Reading::Value(0),
    }
}

/// Returns whatever samples were last set for a pattern.
#[derive(Default)]
pub struct FakeSampler {
    samples: Mutex<HashMap<String, Vec<ProcessSample>>>,
    failing: Mutex<HashSet<String>>,
    calls: Mutex<Vec<String>>,
}

impl FakeSampler {
    pub fn set(&self, pattern: &str, samples: Vec<ProcessSample>) {
        self.samples
            .lock()
            .unwrap()
            .insert(pattern.to_lowercase(), samples);
    }

    pub fn fail(&self, pattern: &str) {
        self.failing.lock().unwrap().insert(pattern.to_lowercase());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl ProcessSampler for FakeSampler {
    fn sample(&self, pattern: &str) -> Result<Vec<ProcessSample>> {
        let key = pattern.to_lowercase();
        self.calls.lock().unwrap().push(key.clone());
        if self.failing.lock().unwrap().contains(&key) {
            return Err(Error::Enumerate {
                path: "/proc".to_string(),
                source: io::Error::new(io::ErrorKind::Other, "boom"),
            });
        }
        Ok(self
            .samples
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .unwrap_or_default())
    }
}

/// Records every kill; pids in `failing` report a failure.
#[derive(Default)]
pub struct RecordingEnforcer {
    killed: Mutex<Vec<u32>>,
    start_times: Mutex<Vec<u64>>,
    failing: Mutex<HashSet<u32>>,
}

impl RecordingEnforcer {
    pub fn fail_for(&self, pid: u32) {
        self.failing.lock().unwrap().insert(pid);
    }

    pub fn killed(&self) -> Vec<u32> {
        self.killed.lock().unwrap().clone()
    }

    pub fn start_times(&self) -> Vec<u64> {
        self.start_times.lock().unwrap().clone()
    }
}

impl Enforcer for RecordingEnforcer {
    fn kill(&self, pid: u32, start_time: u64) -> KillOutcome {
        self.killed.lock().unwrap().push(pid);
        self.start_times.lock().unwrap().push(start_time);
        if self.failing.lock().unwrap().contains(&pid) {
            KillOutcome::Failed("operation not permitted".to_string())
        } else {
            KillOutcome::Terminated
        }
    }
}
