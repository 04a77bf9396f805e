use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub(crate) fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse::<u64>().ok())
}

/// How long status() may serve a cached snapshot.
pub(crate) fn status_cache_ttl() -> Duration {
    Duration::from_millis(
        env_u64("HEARTH_STATUS_CACHE_TTL_MS")
            .map(|v| v.clamp(250, 60_000))
            .unwrap_or(5_000),
    )
}

/// How long to wait for the real runtime process to appear in the
/// process tree after the launcher was spawned.
pub(crate) fn resolve_timeout() -> Duration {
    Duration::from_millis(
        env_u64("HEARTH_RESOLVE_TIMEOUT_MS")
            .map(|v| v.clamp(1_000, 10 * 60 * 1000))
            .unwrap_or(60_000),
    )
}

pub(crate) fn resolve_poll_interval() -> Duration {
    Duration::from_millis(
        env_u64("HEARTH_RESOLVE_POLL_MS")
            .map(|v| v.clamp(50, 10_000))
            .unwrap_or(250),
    )
}

/// The managed runtime initializes asynchronously after its process
/// starts; this bounds the alive-to-ready window.
pub(crate) fn ready_timeout() -> Duration {
    Duration::from_millis(
        env_u64("HEARTH_READY_TIMEOUT_MS")
            .map(|v| v.clamp(5_000, 30 * 60 * 1000))
            .unwrap_or(300_000),
    )
}

pub(crate) fn ready_poll_interval() -> Duration {
    Duration::from_millis(
        env_u64("HEARTH_READY_POLL_MS")
            .map(|v| v.clamp(250, 60_000))
            .unwrap_or(2_000),
    )
}

/// Grace period a graceful stop gets before escalating to a forced
/// kill of the whole process group.
pub(crate) fn stop_grace() -> Duration {
    Duration::from_secs(
        env_u64("HEARTH_STOP_GRACE_SEC")
            .map(|v| v.clamp(1, 10 * 60))
            .unwrap_or(30),
    )
}

/// Brief liveness poll after a forced kill. Kill is best-effort: the
/// state lands in Stopped whether or not this confirms the exit.
pub(crate) fn kill_wait() -> Duration {
    Duration::from_millis(
        env_u64("HEARTH_KILL_WAIT_MS")
            .map(|v| v.clamp(100, 30_000))
            .unwrap_or(2_000),
    )
}

pub(crate) fn rcon_timeout() -> Duration {
    Duration::from_millis(
        env_u64("HEARTH_RCON_TIMEOUT_MS")
            .map(|v| v.clamp(500, 60_000))
            .unwrap_or(10_000),
    )
}

/// Shorter budget for the opportunistic player-count query inside
/// status refresh; a slow console must not stall status polling.
pub(crate) fn player_query_timeout() -> Duration {
    Duration::from_millis(
        env_u64("HEARTH_PLAYER_QUERY_TIMEOUT_MS")
            .map(|v| v.clamp(250, 10_000))
            .unwrap_or(2_000),
    )
}
