//! Readers for the /proc files the sampler needs.
//!
//! Every reader takes the procfs root from `ProcFs`, so tests can point it at
//! a temporary directory laid out like /proc.

use crate::error::{Error, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq)]
pub struct Stat {
    pub comm: String,
    pub state: char,
    /// utime + stime, in clock ticks.
    pub cpu_ticks: u64,
    /// Start time after boot, in clock ticks. Identifies a pid incarnation.
    pub start_time: u64,
    pub rss_pages: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct IoCounters {
    pub rchar: u64,
    pub wchar: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
}

impl IoCounters {
    pub fn storage_bytes(&self) -> u64 {
        self.read_bytes.saturating_add(self.write_bytes)
    }

    /// Character IO that did not go to block storage.
    pub fn other_bytes(&self) -> u64 {
        self.rchar
            .saturating_add(self.wchar)
            .saturating_sub(self.storage_bytes())
    }
}

/// A DRM client as exposed through `fdinfo`.
#[derive(Debug, Clone, PartialEq)]
pub struct DrmClient {
    /// `drm-pdev` plus `drm-client-id`; several fds can share one client.
    pub client_key: Option<String>,
    /// Engine name and accumulated busy time in nanoseconds.
    pub engines: Vec<(String, u64)>,
}

#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcFs {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn pid_dir(&self, pid: u32) -> PathBuf {
        self.root.join(pid.to_string())
    }

    /// Every numeric entry under the root.
    pub fn pids(&self) -> Result<Vec<u32>> {
        let entries = fs::read_dir(&self.root).map_err(|source| Error::Enumerate {
            path: self.root.display().to_string(),
            source,
        })?;
        Ok(entries
            .flatten()
            .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
            .collect())
    }

    pub fn stat(&self, pid: u32) -> Option<Stat> {
        let content = fs::read_to_string(self.pid_dir(pid).join("stat")).ok()?;
        parse_stat(&content)
    }

    /// Base name of argv[0], if the process has a command line.
    pub fn exe_name(&self, pid: u32) -> Option<String> {
        let raw = fs::read(self.pid_dir(pid).join("cmdline")).ok()?;
        let argv0 = raw.split(|b| *b == 0).next()?;
        let argv0 = String::from_utf8_lossy(argv0);
        let base = argv0.rsplit('/').next()?.trim();
        if base.is_empty() {
            None
        } else {
            Some(base.to_string())
        }
    }

    pub fn io(&self, pid: u32) -> Option<IoCounters> {
        let content = fs::read_to_string(self.pid_dir(pid).join("io")).ok()?;
        parse_io(&content)
    }

    pub fn fds(&self, pid: u32) -> io::Result<Vec<u32>> {
        let entries = fs::read_dir(self.pid_dir(pid).join("fdinfo"))?;
        Ok(entries
            .flatten()
            .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
            .collect())
    }

    /// `Ok(None)` when the fd is not a DRM client.
    pub fn drm_client(&self, pid: u32, fd: u32) -> io::Result<Option<DrmClient>> {
        let path = self.pid_dir(pid).join("fdinfo").join(fd.to_string());
        let content = fs::read_to_string(path)?;
        Ok(parse_fdinfo(&content))
    }
}

pub fn parse_stat(content: &str) -> Option<Stat> {
    // comm may contain spaces and parentheses; it ends at the last ')'.
    let open = content.find('(')?;
    let close = content.rfind(')')?;
    if close < open {
        return None;
    }
    let comm = content[open + 1..close].to_string();
    let rest: Vec<&str> = content[close + 1..].split_whitespace().collect();
    // rest[0] is field 3 (state); field N lives at rest[N - 3].
    if rest.len() < 22 {
        return None;
    }
    let utime: u64 = rest[11].parse().ok()?;
    let stime: u64 = rest[12].parse().ok()?;
    Some(Stat {
        comm,
        state: rest[0].chars().next().unwrap_or('?'),
        cpu_ticks: utime.saturating_add(stime),
        start_time: rest[19].parse().ok()?,
        rss_pages: rest[21].parse().ok()?,
    })
}

pub fn parse_io(content: &str) -> Option<IoCounters> {
    let mut counters = IoCounters::default();
    let mut seen = 0;
    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let Ok(value) = value.trim().parse::<u64>() else {
            continue;
        };
        let slot = match key.trim() {
            "rchar" => &mut counters.rchar,
            "wchar" => &mut counters.wchar,
            "read_bytes" => &mut counters.read_bytes,
            "write_bytes" => &mut counters.write_bytes,
            _ => continue,
        };
        *slot = value;
        seen += 1;
    }
    (seen == 4).then_some(counters)
}

pub fn parse_fdinfo(content: &str) -> Option<DrmClient> {
    let mut is_drm = false;
    let mut pdev = None;
    let mut client_id = None;
    let mut engines = Vec::new();
    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        match key {
            "drm-driver" => is_drm = true,
            "drm-pdev" => pdev = Some(value.to_string()),
            "drm-client-id" => client_id = Some(value.to_string()),
            _ => {
                if let Some(engine) = key.strip_prefix("drm-engine-") {
                    if engine.starts_with("capacity-") {
                        continue;
                    }
                    let busy = value.trim_end_matches("ns").trim();
                    if let Ok(ns) = busy.parse::<u64>() {
                        engines.push((engine.to_string(), ns));
                    }
                }
            }
        }
    }
    if !is_drm {
        return None;
    }
    let client_key = client_id.map(|id| match pdev {
        Some(pdev) => format!("{pdev}/{id}"),
        None => id,
    });
    Some(DrmClient { client_key, engines })
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT: &str = "4242 (my (odd) app) S 1 4242 4242 0 -1 4194560 1000 0 0 0 150 50 0 0 20 0 4 0 98765 1000000 2560 18446744073709551615 0 0 0 0 0 0 0 0 0 0 0 0 17 3 0 0 0 0 0";

    #[test]
    fn stat_handles_parens_in_comm() {
        let stat = parse_stat(STAT).unwrap();
        assert_eq!(stat.comm, "my (odd) app");
        assert_eq!(stat.state, 'S');
        assert_eq!(stat.cpu_ticks, 200);
        assert_eq!(stat.start_time, 98765);
        assert_eq!(stat.rss_pages, 2560);
    }

    #[test]
    fn stat_rejects_truncated_content() {
        assert!(parse_stat("12 (x) R 1 2 3").is_none());
        assert!(parse_stat("garbage").is_none());
    }

    #[test]
    fn io_requires_all_counters() {
        let io = parse_io(
            "rchar: 5000\nwchar: 3000\nsyscr: 10\nsyscw: 5\nread_bytes: 1000\nwrite_bytes: 2000\ncancelled_write_bytes: 0\n",
        )
        .unwrap();
        assert_eq!(io.storage_bytes(), 3000);
        assert_eq!(io.other_bytes(), 5000);
        assert!(parse_io("rchar: 1\n").is_none());
    }

    #[test]
    fn fdinfo_parses_drm_engines() {
        let content = "pos:\t0\nflags:\t02100002\nmnt_id:\t25\ndrm-driver:\tamdgpu\ndrm-pdev:\t0000:03:00.0\ndrm-client-id:\t17\ndrm-engine-gfx:\t1500000 ns\ndrm-engine-compute:\t500 ns\ndrm-engine-capacity-gfx:\t2\n";
        let client = parse_fdinfo(content).unwrap();
        assert_eq!(client.client_key.as_deref(), Some("0000:03:00.0/17"));
        assert_eq!(
            client.engines,
            vec![("gfx".to_string(), 1_500_000), ("compute".to_string(), 500)]
        );
        assert!(parse_fdinfo("pos:\t0\nflags:\t02\n").is_none());
    }
}
