//! Process termination

use crate::collector::procfs::ProcFs;
use serde::{Deserialize, Serialize};
use std::io;
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", content = "reason", rename_all = "snake_case")]
pub enum KillOutcome {
    /// The process exited within the grace period.
    Terminated,
    /// Terminate was delivered but the process outlived the grace period.
    /// There is no escalation to SIGKILL.
    TimedOut,
    Failed(String),
}

impl KillOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, KillOutcome::Terminated)
    }
}

pub trait Enforcer: Send + Sync {
    /// Terminate `pid`, but only if it is still the process that started at
    /// `start_time` (clock ticks after boot, as sampled).
    fn kill(&self, pid: u32, start_time: u64) -> KillOutcome;
}

pub fn terminate(pid: u32) -> io::Result<()> {
    let pid = i32::try_from(pid)
        .ok()
        .filter(|p| *p > 0)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid pid"))?;
    let result = unsafe { libc::kill(pid, libc::SIGTERM) };
    if result == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// SIGTERM, then wait up to `grace` for the process to go away.
pub struct SignalEnforcer {
    grace: Duration,
    procfs: ProcFs,
}

impl SignalEnforcer {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            procfs: ProcFs::new(),
        }
    }

    /// Zombies count as gone: they hold no resources and only wait for a reaper.
    /// A different start time means the pid now belongs to another process.
    fn is_alive(&self, pid: u32, start_time: u64) -> bool {
        match self.procfs.stat(pid) {
            Some(stat) => {
                stat.start_time == start_time && !matches!(stat.state, 'Z' | 'X' | 'x')
            }
            None => false,
        }
    }
}

impl Default for SignalEnforcer {
    fn default() -> Self {
        Self::new(Duration::from_secs(3))
    }
}

impl Enforcer for SignalEnforcer {
    fn kill(&self, pid: u32, start_time: u64) -> KillOutcome {
        if pid == std::process::id() {
            return KillOutcome::Failed("refusing to terminate the watchdog itself".to_string());
        }
        match self.procfs.stat(pid) {
            None => return KillOutcome::Failed("process already exited".to_string()),
            Some(stat) if stat.start_time != start_time => {
                return KillOutcome::Failed(format!(
                    "pid reused since sampling (start time {} != {})",
                    stat.start_time, start_time
                ));
            }
            Some(_) => {}
        }
        if let Err(e) = terminate(pid) {
            return KillOutcome::Failed(e.to_string());
        }
        let deadline = Instant::now() + self.grace;
        loop {
            if !self.is_alive(pid, start_time) {
                return KillOutcome::Terminated;
            }
            if Instant::now() >= deadline {
                return KillOutcome::TimedOut;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    fn start_time(pid: u32) -> u64 {
        ProcFs::new().stat(pid).unwrap().start_time
    }

    #[test]
    fn terminates_child_process() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let enforcer = SignalEnforcer::new(Duration::from_secs(3));
        let outcome = enforcer.kill(child.id(), start_time(child.id()));
        assert_eq!(outcome, KillOutcome::Terminated);
        child.wait().unwrap();
    }

    #[test]
    fn reports_timeout_for_process_ignoring_term() {
        let mut child = Command::new("sh")
            .args(["-c", "trap '' TERM; sleep 30"])
            .spawn()
            .unwrap();
        thread::sleep(Duration::from_millis(300));
        let enforcer = SignalEnforcer::new(Duration::from_millis(300));
        let outcome = enforcer.kill(child.id(), start_time(child.id()));
        assert_eq!(outcome, KillOutcome::TimedOut);
        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn refuses_pid_with_different_start_time() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let enforcer = SignalEnforcer::new(Duration::from_millis(200));
        let stale = start_time(child.id()).wrapping_sub(1);
        let outcome = enforcer.kill(child.id(), stale);
        assert!(matches!(outcome, KillOutcome::Failed(reason) if reason.contains("reused")));
        // Not signalled: still running.
        assert!(child.try_wait().unwrap().is_none());
        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn missing_process_fails() {
        let enforcer = SignalEnforcer::default();
        let outcome = enforcer.kill(999_999_999, 0);
        assert!(matches!(outcome, KillOutcome::Failed(_)));
    }

    #[test]
    fn never_kills_itself() {
        let enforcer = SignalEnforcer::default();
        let pid = std::process::id();
        let outcome = enforcer.kill(pid, start_time(pid));
        assert!(matches!(outcome, KillOutcome::Failed(_)));
    }
}
