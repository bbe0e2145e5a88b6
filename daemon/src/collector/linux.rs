use super::procfs::{DrmClient, IoCounters, ProcFs};
use super::{name_matches, normalize_process_name, ProcessSample, ProcessSampler, Reading};
use crate::error::Result;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

/// Samples between rescans of a process that had no DRM clients.
const GPU_RESCAN_EVERY: u32 = 10;

#[derive(Debug, Clone, Copy)]
pub struct SystemParams {
    pub clock_ticks: u64,
    pub page_size: u64,
    pub num_cpus: u64,
}

impl SystemParams {
    pub fn detect() -> Self {
        let clock_ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let num_cpus = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
        Self {
            clock_ticks: if clock_ticks > 0 { clock_ticks as u64 } else { 100 },
            page_size: if page_size > 0 { page_size as u64 } else { 4096 },
            num_cpus: (num_cpus.max(1)) as u64,
        }
    }
}

#[derive(Default)]
struct GpuCounters {
    /// Resolved DRM client fds; `None` until resolved or after invalidation.
    fds: Option<Vec<u32>>,
    samples_since_scan: u32,
    /// Busy nanoseconds per client/engine at the previous sample.
    busy: Option<(HashMap<String, u64>, Instant)>,
}

/// Counter baselines for one incarnation of a pid.
struct PidCounters {
    start_time: u64,
    cpu: Option<(u64, Instant)>,
    io: Option<(IoCounters, Instant)>,
    gpu: GpuCounters,
}

impl PidCounters {
    fn new(start_time: u64) -> Self {
        Self {
            start_time,
            cpu: None,
            io: None,
            gpu: GpuCounters::default(),
        }
    }
}

pub struct LinuxSampler {
    procfs: ProcFs,
    params: SystemParams,
    counters: Mutex<HashMap<u32, PidCounters>>,
}

impl LinuxSampler {
    pub fn new() -> Self {
        Self::with_procfs(ProcFs::new(), SystemParams::detect())
    }

    pub fn with_procfs(procfs: ProcFs, params: SystemParams) -> Self {
        Self {
            procfs,
            params,
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// Pids that currently hold counter state.
    pub fn tracked_pids(&self) -> Vec<u32> {
        let counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        let mut pids: Vec<u32> = counters.keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    pub fn sample_at(&self, pattern: &str, now: Instant) -> Result<Vec<ProcessSample>> {
        let pattern = normalize_process_name(pattern);
        if pattern.is_empty() {
            return Ok(Vec::new());
        }
        let pids = self.procfs.pids()?;
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);

        let alive: HashSet<u32> = pids.iter().copied().collect();
        let before = counters.len();
        counters.retain(|pid, _| alive.contains(pid));
        if counters.len() != before {
            debug!("Dropped counters for {} exited processes", before - counters.len());
        }

        let mut samples = Vec::new();
        for pid in pids {
            let Some(stat) = self.procfs.stat(pid) else {
                continue;
            };
            if stat.state == 'Z' {
                continue;
            }
            let exe = self.procfs.exe_name(pid);
            let matched = name_matches(&stat.comm, &pattern)
                || exe.as_deref().is_some_and(|n| name_matches(n, &pattern));
            if !matched {
                continue;
            }

            let entry = counters
                .entry(pid)
                .or_insert_with(|| PidCounters::new(stat.start_time));
            if entry.start_time != stat.start_time {
                // Pid was reused; the old baselines belong to another process.
                *entry = PidCounters::new(stat.start_time);
            }

            let cpu_percent = self.cpu_percent(entry, stat.cpu_ticks, now);
            let (disk_bytes_per_sec, net_bytes_per_sec) = match self.procfs.io(pid) {
                Some(io) => {
                    let (disk, net) = io_rates(entry, io, now);
                    (Reading::Value(disk), Reading::Value(net))
                }
                None => (Reading::Unavailable, Reading::Unavailable),
            };
            let gpu_percent = self.gpu_percent(pid, &mut entry.gpu, now);

            samples.push(ProcessSample {
                pid,
                start_time: stat.start_time,
                name: exe.map(|n| normalize_process_name(&n)).unwrap_or(stat.comm),
                cpu_percent: Reading::Value(cpu_percent),
                memory_mb: (stat.rss_pages * self.params.page_size) as f64 / (1024.0 * 1024.0),
                disk_bytes_per_sec,
                gpu_percent,
                net_bytes_per_sec,
            });
        }
        Ok(samples)
    }

    /// First sample of a pid is 0 and only records the baseline.
    fn cpu_percent(&self, entry: &mut PidCounters, ticks: u64, now: Instant) -> f64 {
        let previous = entry.cpu.replace((ticks, now));
        let Some((prev_ticks, prev_at)) = previous else {
            return 0.0;
        };
        let elapsed = now.saturating_duration_since(prev_at).as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        let cpu_seconds = ticks.saturating_sub(prev_ticks) as f64 / self.params.clock_ticks as f64;
        let percent = (cpu_seconds / elapsed) * 100.0 / self.params.num_cpus as f64;
        percent.clamp(0.0, 100.0)
    }

    fn gpu_percent(&self, pid: u32, gpu: &mut GpuCounters, now: Instant) -> Reading<f64> {
        gpu.samples_since_scan = gpu.samples_since_scan.saturating_add(1);
        let rescan_empty =
            matches!(&gpu.fds, Some(fds) if fds.is_empty()) && gpu.samples_since_scan >= GPU_RESCAN_EVERY;

        let clients = match gpu.fds.take() {
            Some(fds) if !rescan_empty => {
                let mut clients = Vec::with_capacity(fds.len());
                let mut stale = false;
                for fd in &fds {
                    match self.procfs.drm_client(pid, *fd) {
                        Ok(Some(client)) => clients.push((*fd, client)),
                        _ => stale = true,
                    }
                }
                // A closed or reused fd forces a rescan on the next sample.
                if !stale {
                    gpu.fds = Some(fds);
                }
                clients
            }
            _ => match self.resolve_drm_clients(pid) {
                Some(found) => {
                    gpu.fds = Some(found.iter().map(|(fd, _)| *fd).collect());
                    gpu.samples_since_scan = 0;
                    found
                }
                None => return Reading::Unavailable,
            },
        };

        let busy = engine_busy(&clients);
        let previous = gpu.busy.replace((busy.clone(), now));
        let Some((prev_busy, prev_at)) = previous else {
            return Reading::Value(0.0);
        };
        let wall_ns = now.saturating_duration_since(prev_at).as_nanos() as f64;
        if wall_ns <= 0.0 {
            return Reading::Value(0.0);
        }
        let total: f64 = busy
            .iter()
            .filter_map(|(engine, ns)| {
                let prev = prev_busy.get(engine)?;
                Some(ns.saturating_sub(*prev) as f64 / wall_ns * 100.0)
            })
            .sum();
        // Summing engines can pass 100; the clamp is a deliberate approximation.
        Reading::Value(total.clamp(0.0, 100.0))
    }

    /// Scan every fdinfo entry of a pid for DRM clients.
    fn resolve_drm_clients(&self, pid: u32) -> Option<Vec<(u32, DrmClient)>> {
        let fds = self.procfs.fds(pid).ok()?;
        Some(
            fds.into_iter()
                .filter_map(|fd| match self.procfs.drm_client(pid, fd) {
                    Ok(Some(client)) => Some((fd, client)),
                    _ => None,
                })
                .collect(),
        )
    }
}

impl Default for LinuxSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSampler for LinuxSampler {
    fn sample(&self, pattern: &str) -> Result<Vec<ProcessSample>> {
        self.sample_at(pattern, Instant::now())
    }
}

/// Disk and non-storage byte rates since the previous sample; 0 on the first.
fn io_rates(entry: &mut PidCounters, io: IoCounters, now: Instant) -> (u64, u64) {
    let Some((prev, prev_at)) = entry.io.replace((io, now)) else {
        return (0, 0);
    };
    let elapsed = now.saturating_duration_since(prev_at);
    if elapsed == Duration::ZERO {
        return (0, 0);
    }
    let secs = elapsed.as_secs_f64();
    let disk = io.storage_bytes().saturating_sub(prev.storage_bytes()) as f64 / secs;
    let other = io.other_bytes().saturating_sub(prev.other_bytes()) as f64 / secs;
    (disk as u64, other as u64)
}

/// Busy time per client/engine, counting each DRM client once.
fn engine_busy(clients: &[(u32, DrmClient)]) -> HashMap<String, u64> {
    let mut seen = HashSet::new();
    let mut busy = HashMap::new();
    for (fd, client) in clients {
        let key = client
            .client_key
            .clone()
            .unwrap_or_else(|| format!("fd{fd}"));
        if !seen.insert(key.clone()) {
            continue;
        }
        for (engine, ns) in &client.engines {
            *busy.entry(format!("{key}/{engine}")).or_insert(0) += ns;
        }
    }
    busy
}
