//! Observation of the launched process tree.
//!
//! The launched command may itself be a wrapper (shell script,
//! launcher jar) that forks or execs the real runtime, so the pid
//! returned at spawn time cannot be trusted. Resolution walks a
//! snapshot of the process table and picks the descendant whose
//! command line matches the runtime signature. The walk is a pure
//! function over an injectable snapshot; only the snapshot itself
//! touches `/proc`.

use std::{
    collections::HashMap,
    sync::OnceLock,
    time::Duration,
};

use hearth_process::{ProcessHandle, ResourceSample, SupervisorError};

use crate::launcher::RawLaunch;
use crate::support;

/// Maximum wrapper nesting considered during resolution. Anything
/// deeper than script -> launcher -> jvm is not a layout we manage.
const MAX_TREE_DEPTH: usize = 5;

/// One row of a process-table snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcEntry {
    pub pid: u32,
    pub ppid: u32,
    pub cmdline: String,
}

/// What the real runtime process looks like, e.g. name `java` with
/// arg hint `server.jar` to skip over a launcher shell script.
#[derive(Debug, Clone)]
pub struct RuntimeSignature {
    pub process_name: String,
    pub arg_hint: Option<String>,
}

impl RuntimeSignature {
    pub fn new(process_name: impl Into<String>) -> Self {
        Self {
            process_name: process_name.into(),
            arg_hint: None,
        }
    }

    pub fn with_arg_hint(mut self, hint: impl Into<String>) -> Self {
        self.arg_hint = Some(hint.into());
        self
    }

    fn matches(&self, cmdline: &str) -> bool {
        let lower = cmdline.to_ascii_lowercase();
        if !lower.contains(&self.process_name.to_ascii_lowercase()) {
            return false;
        }
        match &self.arg_hint {
            Some(hint) => lower.contains(&hint.to_ascii_lowercase()),
            None => true,
        }
    }
}

/// Breadth-first, depth-bounded search of the tree rooted at `root`
/// for the first entry matching `signature`. The root itself counts:
/// a wrapper that execs the runtime keeps its pid.
pub fn resolve_runtime_pid(
    table: &[ProcEntry],
    root: u32,
    signature: &RuntimeSignature,
    max_depth: usize,
) -> Option<u32> {
    let by_pid: HashMap<u32, &ProcEntry> = table.iter().map(|e| (e.pid, e)).collect();
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for entry in table {
        children.entry(entry.ppid).or_default().push(entry.pid);
    }

    let mut frontier = vec![root];
    for _depth in 0..=max_depth {
        let mut next = Vec::new();
        for pid in &frontier {
            if let Some(entry) = by_pid.get(pid)
                && signature.matches(&entry.cmdline)
            {
                return Some(*pid);
            }
            if let Some(kids) = children.get(pid) {
                next.extend_from_slice(kids);
            }
        }
        if next.is_empty() {
            return None;
        }
        frontier = next;
    }
    None
}

#[cfg(target_os = "linux")]
pub fn read_proc_table() -> Vec<ProcEntry> {
    let mut out = Vec::new();
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return out;
    };

    for dir in entries.flatten() {
        let Some(pid) = dir
            .file_name()
            .to_str()
            .and_then(|n| n.parse::<u32>().ok())
        else {
            continue;
        };

        let Ok(stat) = std::fs::read_to_string(dir.path().join("stat")) else {
            continue;
        };
        let Some(ppid) = parse_stat_ppid(&stat) else {
            continue;
        };

        // cmdline is NUL-separated; kernel threads have none.
        let cmdline = std::fs::read(dir.path().join("cmdline"))
            .ok()
            .map(|raw| {
                raw.split(|b| *b == 0)
                    .filter(|part| !part.is_empty())
                    .map(|part| String::from_utf8_lossy(part).into_owned())
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .unwrap_or_default();

        out.push(ProcEntry { pid, ppid, cmdline });
    }
    out
}

#[cfg(not(target_os = "linux"))]
pub fn read_proc_table() -> Vec<ProcEntry> {
    Vec::new()
}

/// Extracts the ppid from `/proc/<pid>/stat`, skipping past the
/// parenthesized comm field which may itself contain spaces.
fn parse_stat_ppid(stat: &str) -> Option<u32> {
    let end = stat.rfind(')')?;
    let rest = stat.get((end + 2)..)?;
    let mut it = rest.split_whitespace();
    let _state = it.next()?;
    it.next()?.parse().ok()
}

/// Polls the process table until the runtime process appears, or the
/// resolve timeout elapses.
pub async fn resolve(
    raw: &RawLaunch,
    signature: &RuntimeSignature,
) -> Result<ProcessHandle, SupervisorError> {
    let timeout = support::resolve_timeout();
    let poll = support::resolve_poll_interval();
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        let table = read_proc_table();
        if let Some(pid) =
            resolve_runtime_pid(&table, raw.launcher_pid, signature, MAX_TREE_DEPTH)
        {
            tracing::info!(pid, launcher_pid = raw.launcher_pid, "runtime process resolved");
            return Ok(ProcessHandle {
                pid,
                pgid: raw.pgid,
                started_at_unix_ms: raw.launched_at_unix_ms,
            });
        }

        if tokio::time::Instant::now() >= deadline {
            return Err(SupervisorError::ProcessNotFound {
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        tokio::time::sleep(poll).await;
    }
}

#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    // Signal 0 probes existence without delivering anything. EPERM
    // still means the process exists.
    let rc = unsafe { libc::kill(pid as i32, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn is_alive(_pid: u32) -> bool {
    false
}

#[cfg(target_os = "linux")]
fn ticks_per_sec() -> u64 {
    static TICKS: OnceLock<u64> = OnceLock::new();
    *TICKS.get_or_init(|| unsafe {
        let v = libc::sysconf(libc::_SC_CLK_TCK);
        if v <= 0 { 100 } else { v as u64 }
    })
}

#[cfg(not(target_os = "linux"))]
fn ticks_per_sec() -> u64 {
    100
}

#[cfg(target_os = "linux")]
fn page_size() -> u64 {
    static PAGE: OnceLock<u64> = OnceLock::new();
    *PAGE.get_or_init(|| unsafe {
        let v = libc::sysconf(libc::_SC_PAGESIZE);
        if v <= 0 { 4096 } else { v as u64 }
    })
}

#[cfg(not(target_os = "linux"))]
fn page_size() -> u64 {
    4096
}

#[cfg(target_os = "linux")]
async fn read_proc_cpu_ticks(pid: u32) -> Option<u64> {
    let s = tokio::fs::read_to_string(format!("/proc/{pid}/stat"))
        .await
        .ok()?;
    let end = s.rfind(')')?;
    let rest = s.get((end + 2)..)?;
    let parts: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = parts.get(11)?.parse().ok()?;
    let stime: u64 = parts.get(12)?.parse().ok()?;
    Some(utime.saturating_add(stime))
}

#[cfg(not(target_os = "linux"))]
async fn read_proc_cpu_ticks(_pid: u32) -> Option<u64> {
    None
}

#[cfg(target_os = "linux")]
async fn read_proc_rss_bytes(pid: u32) -> Option<u64> {
    let s = tokio::fs::read_to_string(format!("/proc/{pid}/statm"))
        .await
        .ok()?;
    let mut it = s.split_whitespace();
    let _size_pages = it.next()?;
    let resident_pages: u64 = it.next()?.parse().ok()?;
    Some(resident_pages.saturating_mul(page_size()))
}

#[cfg(not(target_os = "linux"))]
async fn read_proc_rss_bytes(_pid: u32) -> Option<u64> {
    None
}

fn cpu_percent_x100(prev_ticks: u64, ticks: u64, elapsed: Duration) -> u32 {
    let dt = elapsed.as_secs_f64();
    if dt <= 0.0 {
        return 0;
    }
    let delta_ticks = ticks.saturating_sub(prev_ticks) as f64;
    let cpu = (delta_ticks / ticks_per_sec() as f64) / dt * 100.0;
    let x100 = (cpu * 100.0).round();
    if x100.is_finite() {
        x100.clamp(0.0, u32::MAX as f64) as u32
    } else {
        0
    }
}

/// Current CPU/memory/liveness for the resolved pid. CPU is a quick
/// two-point sample over 100ms. A vanished process reports
/// `alive = false` rather than an error.
pub async fn sample(handle: &ProcessHandle) -> ResourceSample {
    let Some(first) = read_proc_cpu_ticks(handle.pid).await else {
        return ResourceSample {
            alive: is_alive(handle.pid),
            ..ResourceSample::default()
        };
    };

    let interval = Duration::from_millis(100);
    tokio::time::sleep(interval).await;

    let second = read_proc_cpu_ticks(handle.pid).await;
    let rss_bytes = read_proc_rss_bytes(handle.pid).await.unwrap_or(0);

    match second {
        Some(ticks) => ResourceSample {
            alive: true,
            cpu_percent_x100: cpu_percent_x100(first, ticks, interval),
            rss_bytes,
        },
        // Exited between the two readings.
        None => ResourceSample {
            alive: false,
            ..ResourceSample::default()
        },
    }
}
