//! Detached launch of the server process.
//!
//! The child gets its own session (so the whole subtree can be
//! signaled as one group), its stdout/stderr appended to the log file,
//! and no controlling terminal. The supervisor deliberately does not
//! tie the child to its own lifetime: restarting the web process must
//! not signal a running game server.

use std::{path::Path, process::Stdio};

use hearth_process::{LaunchId, LaunchSpec, SupervisorError};
use tokio::{io::AsyncWriteExt as _, process::Command};

use crate::support;

/// Whatever the OS handed back at spawn time. `launcher_pid` may be a
/// wrapper script, not the final runtime pid; the monitor resolves
/// the real one.
#[derive(Debug, Clone)]
pub struct RawLaunch {
    pub launch_id: LaunchId,
    pub launcher_pid: u32,
    pub pgid: i32,
    pub launched_at_unix_ms: u64,
}

/// Launch record dropped next to the server for post-mortem debugging,
/// written atomically via rename.
#[derive(Debug, serde::Serialize)]
struct LaunchRecord<'a> {
    launch_id: &'a str,
    launcher_pid: u32,
    pgid: i32,
    launched_at_unix_ms: u64,
    exec: String,
    args: &'a [String],
    cwd: String,
    log_file: String,
    agent_version: &'static str,
}

fn validate(spec: &LaunchSpec) -> Result<(), SupervisorError> {
    if !spec.working_dir.is_dir() {
        return Err(SupervisorError::Launch(format!(
            "working directory does not exist: {}",
            spec.working_dir.display()
        )));
    }

    // A bare command name is resolved through PATH; only explicit
    // paths can be checked up front.
    if spec.executable.parent().is_some_and(|p| !p.as_os_str().is_empty())
        && !spec.executable.exists()
    {
        return Err(SupervisorError::Launch(format!(
            "executable does not exist: {}",
            spec.executable.display()
        )));
    }

    Ok(())
}

async fn open_log(path: &Path) -> std::io::Result<(std::fs::File, std::fs::File)> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let out = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    let err = out.try_clone()?;
    Ok((out, err))
}

async fn write_launch_record(dir: &Path, record: &LaunchRecord<'_>) -> anyhow::Result<()> {
    let path = dir.join("hearth-run.json");
    let tmp = dir.join("hearth-run.json.tmp");
    let data = serde_json::to_vec_pretty(record)?;
    let mut f = tokio::fs::File::create(&tmp).await?;
    f.write_all(&data).await?;
    f.flush().await.ok();
    tokio::fs::rename(&tmp, &path).await?;
    Ok(())
}

pub async fn launch(spec: &LaunchSpec) -> Result<RawLaunch, SupervisorError> {
    validate(spec)?;

    let (stdout_log, stderr_log) = open_log(&spec.log_file).await.map_err(|e| {
        SupervisorError::Launch(format!("open log file {}: {e}", spec.log_file.display()))
    })?;

    let mut cmd = Command::new(&spec.executable);
    cmd.args(&spec.args)
        .current_dir(&spec.working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout_log))
        .stderr(Stdio::from(stderr_log));

    #[cfg(unix)]
    {
        unsafe {
            cmd.pre_exec(|| {
                // New session: detaches from any controlling terminal
                // and makes the child its own process-group leader.
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    let mut child = cmd.spawn().map_err(|e| {
        SupervisorError::Launch(format!(
            "spawn {} (cwd {}): {e}",
            spec.executable.display(),
            spec.working_dir.display()
        ))
    })?;

    let launcher_pid = child
        .id()
        .ok_or_else(|| SupervisorError::Launch("spawned process has no pid".to_string()))?;
    // setsid made the child the leader of a fresh session and group.
    let pgid = launcher_pid as i32;

    let raw = RawLaunch {
        launch_id: LaunchId::new(),
        launcher_pid,
        pgid,
        launched_at_unix_ms: support::now_unix_ms(),
    };

    let record = LaunchRecord {
        launch_id: &raw.launch_id.0,
        launcher_pid,
        pgid,
        launched_at_unix_ms: raw.launched_at_unix_ms,
        exec: spec.executable.display().to_string(),
        args: &spec.args,
        cwd: spec.working_dir.display().to_string(),
        log_file: spec.log_file.display().to_string(),
        agent_version: env!("CARGO_PKG_VERSION"),
    };
    if let Err(err) = write_launch_record(&spec.working_dir, &record).await {
        tracing::warn!(error = %err, "failed to write launch record");
    }

    tracing::info!(
        pid = launcher_pid,
        pgid,
        exec = %spec.executable.display(),
        "server process launched"
    );

    // Reap the immediate child when it exits so it never lingers as a
    // zombie. Dropping the handle does not signal the process.
    tokio::spawn(async move {
        let _ = child.wait().await;
    });

    Ok(raw)
}
