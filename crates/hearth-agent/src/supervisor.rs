//! Lifecycle supervisor for the managed server process.
//!
//! One instance owns the authoritative state. Transition decisions
//! happen under a single lock held only for the decision itself;
//! launch, resolution, readiness probing and shutdown all run as
//! background tasks, and callers poll `status()` for completion.
//!
//! An epoch counter, bumped on every `start`, lets background tasks
//! from a superseded launch detect that they are stale before they
//! touch shared state.

use std::{path::PathBuf, sync::Arc, time::Duration};

use hearth_process::{
    Ack, LaunchSpec, ProcessHandle, RconEndpoint, RconError, StatusSnapshot, SupervisorError,
    SupervisorState, format_uptime,
};
use tokio::sync::Mutex;

use crate::monitor::{self, RuntimeSignature};
use crate::rcon_session::RconSession;
use crate::server_properties::{DEFAULT_MAX_PLAYERS, ServerProperties};
use crate::{launcher, support};

/// Where RCON credentials come from. The managed server's own
/// `server.properties` is the normal source; a static endpoint exists
/// for tests and unusual deployments.
#[derive(Debug, Clone)]
pub enum RconSource {
    Static(RconEndpoint),
    Properties { path: PathBuf, host: String },
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub launch: LaunchSpec,
    pub signature: RuntimeSignature,
    pub rcon: RconSource,
    /// Console command that asks the server to shut itself down.
    pub stop_command: String,
    /// Grace period before a graceful stop escalates to a group kill.
    pub stop_grace: Duration,
    /// How long `status()` may serve a cached snapshot.
    pub status_ttl: Duration,
}

impl SupervisorConfig {
    pub fn new(launch: LaunchSpec, signature: RuntimeSignature, rcon: RconSource) -> Self {
        Self {
            launch,
            signature,
            rcon,
            stop_command: "stop".to_string(),
            stop_grace: support::stop_grace(),
            status_ttl: support::status_cache_ttl(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
    Start,
    Launched,
    Ready,
    Stop,
    Kill,
    Exited,
}

impl Event {
    fn name(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Launched => "commit launch",
            Self::Ready => "mark ready",
            Self::Stop => "stop",
            Self::Kill => "kill",
            Self::Exited => "mark exited",
        }
    }
}

/// The transition table. Total over (state, event): every pair either
/// yields the next state or an `InvalidState` error naming both sides.
/// Nothing is ever silently ignored.
pub(crate) fn transition(
    current: SupervisorState,
    event: Event,
) -> Result<SupervisorState, SupervisorError> {
    use SupervisorState as S;

    let next = match (current, event) {
        (S::Stopped, Event::Start) => S::Starting,
        (S::Starting, Event::Launched) => S::Running { ready: false },
        (S::Running { ready: false }, Event::Ready) => S::Running { ready: true },
        (S::Starting | S::Running { .. }, Event::Stop) => S::Stopping,
        // Kill is accepted from every live state, including a kill
        // already in flight.
        (S::Starting | S::Running { .. } | S::Stopping | S::Killing, Event::Kill) => S::Killing,
        (S::Starting | S::Running { .. } | S::Stopping | S::Killing, Event::Exited) => S::Stopped,
        (current, event) => {
            return Err(SupervisorError::InvalidState {
                current,
                requested: event.name(),
            });
        }
    };
    Ok(next)
}

#[derive(Debug)]
struct Inner {
    state: SupervisorState,
    handle: Option<ProcessHandle>,
    session: Option<Arc<RconSession>>,
    epoch: u64,
    message: Option<String>,
    max_players: u32,
}

#[derive(Clone)]
pub struct Supervisor {
    config: Arc<SupervisorConfig>,
    inner: Arc<Mutex<Inner>>,
    cache: Arc<Mutex<Option<(StatusSnapshot, tokio::time::Instant)>>>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config: Arc::new(config),
            inner: Arc::new(Mutex::new(Inner {
                state: SupervisorState::Stopped,
                handle: None,
                session: None,
                epoch: 0,
                message: None,
                max_players: DEFAULT_MAX_PLAYERS,
            })),
            cache: Arc::new(Mutex::new(None)),
        }
    }

    async fn invalidate_cache(&self) {
        *self.cache.lock().await = None;
    }

    /// Commits `Starting` and returns immediately; the actual launch
    /// and runtime resolution continue in the background. A second
    /// `start` while live is rejected, never a duplicate launch.
    pub async fn start(&self) -> Result<Ack, SupervisorError> {
        let epoch = {
            let mut inner = self.inner.lock().await;
            inner.state = transition(inner.state, Event::Start)?;
            inner.epoch += 1;
            inner.handle = None;
            inner.session = None;
            inner.message = Some("starting...".to_string());
            inner.epoch
        };
        self.invalidate_cache().await;
        tracing::info!(epoch, "start requested");

        let sup = self.clone();
        tokio::spawn(async move {
            sup.run_start(epoch).await;
        });

        Ok(Ack::with_message(SupervisorState::Starting, "start requested"))
    }

    async fn run_start(&self, epoch: u64) {
        self.refresh_max_players().await;

        let raw = match launcher::launch(&self.config.launch).await {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(error = %err, "launch failed");
                self.fail_start(epoch, err.to_string()).await;
                return;
            }
        };

        let handle = match monitor::resolve(&raw, &self.config.signature).await {
            Ok(handle) => handle,
            Err(err) => {
                tracing::warn!(error = %err, "runtime never resolved; terminating launcher group");
                force_kill_group(raw.pgid);
                self.fail_start(epoch, err.to_string()).await;
                return;
            }
        };

        {
            let mut inner = self.inner.lock().await;
            if inner.epoch != epoch || !matches!(inner.state, SupervisorState::Starting) {
                // A stop or kill raced the launch. Nothing owns this
                // process group anymore, so take it down with us.
                drop(inner);
                tracing::warn!("start superseded before commit; terminating launched group");
                force_kill_group(raw.pgid);
                return;
            }
            match transition(inner.state, Event::Launched) {
                Ok(next) => {
                    inner.state = next;
                    inner.handle = Some(handle);
                    inner.message = None;
                }
                Err(_) => return,
            }
        }
        self.invalidate_cache().await;
        tracing::info!(pid = handle.pid, "server process running; probing readiness");

        self.probe_readiness(epoch).await;
    }

    async fn fail_start(&self, epoch: u64, message: String) {
        {
            let mut inner = self.inner.lock().await;
            if inner.epoch != epoch || !matches!(inner.state, SupervisorState::Starting) {
                return;
            }
            inner.state = match transition(inner.state, Event::Exited) {
                Ok(next) => next,
                Err(_) => return,
            };
            inner.handle = None;
            inner.message = Some(message);
        }
        self.invalidate_cache().await;
    }

    /// Alive is not ready: the runtime initializes asynchronously
    /// after its process exists. Ready means the console answers an
    /// authenticated handshake. On timeout the state stays
    /// `Running { ready: false }` with a warning message; there is no
    /// automatic retry.
    async fn probe_readiness(&self, epoch: u64) {
        let deadline = tokio::time::Instant::now() + support::ready_timeout();
        let poll = support::ready_poll_interval();

        loop {
            {
                let inner = self.inner.lock().await;
                if inner.epoch != epoch
                    || !matches!(inner.state, SupervisorState::Running { ready: false })
                {
                    return;
                }
            }

            match self.open_session().await {
                Ok(session) => {
                    let committed = {
                        let mut inner = self.inner.lock().await;
                        if inner.epoch == epoch
                            && let Ok(next) = transition(inner.state, Event::Ready)
                        {
                            inner.state = next;
                            inner.session = Some(session.clone());
                            inner.message = None;
                            true
                        } else {
                            false
                        }
                    };
                    if committed {
                        self.invalidate_cache().await;
                        tracing::info!("server is ready for traffic");
                    } else {
                        session.close().await;
                    }
                    return;
                }
                Err(err) => {
                    tracing::debug!(error = %err, "readiness probe not yet successful");
                }
            }

            if tokio::time::Instant::now() >= deadline {
                let mut inner = self.inner.lock().await;
                if inner.epoch == epoch {
                    inner.message = Some(
                        "server started but never became ready (console probe timed out)"
                            .to_string(),
                    );
                }
                tracing::warn!("readiness probe timed out; server stays not-ready");
                return;
            }
            tokio::time::sleep(poll).await;
        }
    }

    async fn rcon_endpoint(&self) -> Result<RconEndpoint, RconError> {
        match &self.config.rcon {
            RconSource::Static(endpoint) => Ok(endpoint.clone()),
            RconSource::Properties { path, host } => ServerProperties::load(path)
                .await
                .and_then(|props| props.rcon_endpoint(host))
                .map_err(|err| RconError::Connection(err.to_string())),
        }
    }

    async fn refresh_max_players(&self) {
        if let RconSource::Properties { path, .. } = &self.config.rcon
            && let Ok(props) = ServerProperties::load(path).await
        {
            self.inner.lock().await.max_players = props.max_players();
        }
    }

    /// Connects and authenticates a fresh console session.
    async fn open_session(&self) -> Result<Arc<RconSession>, RconError> {
        let endpoint = self.rcon_endpoint().await?;
        let timeout = support::rcon_timeout();
        let session = RconSession::connect(endpoint, timeout).await?;
        session.authenticate(timeout).await?;
        Ok(Arc::new(session))
    }

    /// Graceful stop: ask the server to shut itself down over the
    /// console, wait out the grace period, then escalate to a group
    /// kill if it is still alive. `graceful = false` goes straight to
    /// `kill`. Stopping an already stopped server is a no-op success.
    pub async fn stop(&self, graceful: bool) -> Result<Ack, SupervisorError> {
        if !graceful {
            return self.kill().await;
        }

        let (epoch, handle, session) = {
            let mut inner = self.inner.lock().await;
            if inner.state.is_stopped() {
                return Ok(Ack::with_message(SupervisorState::Stopped, "already stopped"));
            }
            inner.state = transition(inner.state, Event::Stop)?;
            inner.message = Some("stopping...".to_string());
            (inner.epoch, inner.handle, inner.session.clone())
        };
        self.invalidate_cache().await;
        tracing::info!("graceful stop requested");

        let sup = self.clone();
        tokio::spawn(async move {
            sup.run_graceful_stop(epoch, handle, session).await;
        });

        Ok(Ack::with_message(SupervisorState::Stopping, "stop requested"))
    }

    async fn run_graceful_stop(
        &self,
        epoch: u64,
        handle: Option<ProcessHandle>,
        session: Option<Arc<RconSession>>,
    ) {
        let shutdown = async {
            let session = match session {
                Some(s) if s.is_authenticated().await => s,
                _ => self.open_session().await?,
            };
            session
                .execute(&self.config.stop_command, support::rcon_timeout())
                .await
        };

        match shutdown.await {
            Ok(_) => tracing::info!(command = %self.config.stop_command, "shutdown command sent"),
            Err(err) => {
                // No retries here: a server that cannot take the stop
                // command gets killed at the end of the grace period.
                tracing::warn!(error = %err, "shutdown command failed; will escalate");
            }
        }

        if let Some(handle) = handle {
            let deadline = tokio::time::Instant::now() + self.config.stop_grace;
            loop {
                if !monitor::is_alive(handle.pid) {
                    break;
                }
                if tokio::time::Instant::now() >= deadline {
                    tracing::warn!(
                        pid = handle.pid,
                        "grace period elapsed; escalating to group kill"
                    );
                    {
                        let mut inner = self.inner.lock().await;
                        if inner.epoch == epoch
                            && let Ok(next) = transition(inner.state, Event::Kill)
                        {
                            inner.state = next;
                            inner.message = Some("killing...".to_string());
                        }
                    }
                    self.invalidate_cache().await;
                    force_kill_group(handle.pgid);
                    wait_for_death(handle.pid, support::kill_wait()).await;
                    break;
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }

        self.finish_stop(epoch, "stopped").await;
    }

    /// Forced termination of the whole process group. Best-effort:
    /// after a short liveness poll the state lands in `Stopped`
    /// regardless, since a process surviving SIGKILL is an OS-level
    /// anomaly outside this system's remit.
    pub async fn kill(&self) -> Result<Ack, SupervisorError> {
        let (epoch, handle) = {
            let mut inner = self.inner.lock().await;
            if inner.state.is_stopped() {
                return Ok(Ack::with_message(SupervisorState::Stopped, "already stopped"));
            }
            inner.state = transition(inner.state, Event::Kill)?;
            inner.message = Some("killing...".to_string());
            (inner.epoch, inner.handle)
        };
        self.invalidate_cache().await;

        if let Some(handle) = handle {
            tracing::info!(pid = handle.pid, pgid = handle.pgid, "killing process group");
            force_kill_group(handle.pgid);
            wait_for_death(handle.pid, support::kill_wait()).await;
        }

        self.finish_stop(epoch, "killed").await;
        Ok(Ack::with_message(SupervisorState::Stopped, "killed"))
    }

    async fn finish_stop(&self, epoch: u64, message: &str) {
        let session = {
            let mut inner = self.inner.lock().await;
            if inner.epoch != epoch {
                return;
            }
            inner.state = match transition(inner.state, Event::Exited) {
                Ok(next) => next,
                Err(_) => SupervisorState::Stopped,
            };
            inner.handle = None;
            inner.message = Some(message.to_string());
            inner.session.take()
        };
        if let Some(session) = session {
            session.close().await;
        }
        self.invalidate_cache().await;
        tracing::info!(message, "server is stopped");
    }

    /// Serves a cached snapshot while it is younger than the TTL;
    /// otherwise resamples the process and, when ready, asks the
    /// console for the player count.
    ///
    /// The cache lock is held across the recompute: a burst of pollers
    /// arriving at TTL expiry produces exactly one fresh sample, and
    /// the rest reuse it.
    pub async fn status(&self) -> StatusSnapshot {
        let mut cache = self.cache.lock().await;
        if let Some((snap, at)) = cache.as_ref()
            && at.elapsed() < self.config.status_ttl
        {
            return snap.clone();
        }

        let snap = self.recompute_status().await;
        *cache = Some((snap.clone(), tokio::time::Instant::now()));
        snap
    }

    async fn recompute_status(&self) -> StatusSnapshot {
        let (state, handle, session, epoch, message, max_players) = {
            let inner = self.inner.lock().await;
            (
                inner.state,
                inner.handle,
                inner.session.clone(),
                inner.epoch,
                inner.message.clone(),
                inner.max_players,
            )
        };

        let Some(handle) = handle else {
            let mut snap = StatusSnapshot::stopped(max_players, message);
            snap.state = state;
            return snap;
        };

        let sample = monitor::sample(&handle).await;

        if !sample.alive && matches!(state, SupervisorState::Running { .. }) {
            // The process died behind our back (crash, external kill).
            self.mark_exited(epoch, handle).await;
            return StatusSnapshot::stopped(
                max_players,
                Some("server process exited unexpectedly".to_string()),
            );
        }

        let uptime_secs = support::now_unix_ms()
            .saturating_sub(handle.started_at_unix_ms)
            / 1000;

        let mut players = None;
        let mut max = max_players;
        if matches!(state, SupervisorState::Running { ready: true })
            && let Some(session) = session
            && let Ok(reply) = session.execute("list", support::player_query_timeout()).await
            && let Some((online, capacity)) = parse_player_count(&reply)
        {
            players = Some(online);
            max = capacity;
        }

        StatusSnapshot {
            state,
            pid: Some(handle.pid),
            uptime_secs,
            uptime: format_uptime(uptime_secs),
            cpu_percent_x100: sample.cpu_percent_x100,
            rss_bytes: sample.rss_bytes,
            ready: matches!(state, SupervisorState::Running { ready: true }),
            players,
            max_players: max,
            message,
        }
    }

    /// Runs inside `status()` while the cache lock is held, so it must
    /// not touch the cache itself; the caller stores the fresh stopped
    /// snapshot right after.
    async fn mark_exited(&self, epoch: u64, handle: ProcessHandle) {
        let session = {
            let mut inner = self.inner.lock().await;
            if inner.epoch != epoch || inner.handle != Some(handle) {
                return;
            }
            if let Ok(next) = transition(inner.state, Event::Exited) {
                inner.state = next;
            }
            inner.handle = None;
            inner.message = Some("server process exited unexpectedly".to_string());
            inner.session.take()
        };
        if let Some(session) = session {
            session.close().await;
        }
        tracing::warn!(pid = handle.pid, "server process exited outside supervisor control");
    }

    /// Relays an operator command to the live console session.
    /// Requires `Running { ready: true }`. If the held session died
    /// earlier, one reconnect is attempted here; retry policy belongs
    /// to the supervisor, never to the session.
    pub async fn run_command(&self, command: &str) -> Result<String, RconError> {
        let session = {
            let inner = self.inner.lock().await;
            match inner.state {
                SupervisorState::Running { ready: true } => inner.session.clone(),
                _ => return Err(RconError::NotReady),
            }
        };

        let session = match session {
            Some(s) if s.is_authenticated().await => s,
            _ => {
                let fresh = self.open_session().await?;
                let mut inner = self.inner.lock().await;
                if matches!(inner.state, SupervisorState::Running { ready: true }) {
                    inner.session = Some(fresh.clone());
                }
                fresh
            }
        };

        session.execute(command, support::rcon_timeout()).await
    }
}

#[cfg(unix)]
fn force_kill_group(pgid: i32) {
    // Negative pid addresses the whole group, catching children the
    // wrapper may have spawned.
    unsafe {
        libc::kill(-pgid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn force_kill_group(_pgid: i32) {}

async fn wait_for_death(pid: u32, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    while monitor::is_alive(pid) && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Parses the vanilla `list` reply, both the modern
/// "There are 3 of a max of 20 players online" form and the legacy
/// "There are 3/20 players online" form.
fn parse_player_count(reply: &str) -> Option<(u32, u32)> {
    let rest = reply.trim().strip_prefix("There are ")?;

    if let Some((online, tail)) = rest.split_once(" of a max of ") {
        let online = online.trim().parse().ok()?;
        let max = tail.split_whitespace().next()?.parse().ok()?;
        return Some((online, max));
    }

    let (online, tail) = rest.split_once('/')?;
    let online = online.trim().parse().ok()?;
    let max = tail
        .split_whitespace()
        .next()?
        .trim_end_matches(':')
        .parse()
        .ok()?;
    Some((online, max))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table_valid_paths() {
        use SupervisorState as S;

        assert_eq!(transition(S::Stopped, Event::Start).unwrap(), S::Starting);
        assert_eq!(
            transition(S::Starting, Event::Launched).unwrap(),
            S::Running { ready: false }
        );
        assert_eq!(
            transition(S::Running { ready: false }, Event::Ready).unwrap(),
            S::Running { ready: true }
        );
        assert_eq!(
            transition(S::Running { ready: true }, Event::Stop).unwrap(),
            S::Stopping
        );
        assert_eq!(transition(S::Starting, Event::Stop).unwrap(), S::Stopping);
        assert_eq!(transition(S::Stopping, Event::Kill).unwrap(), S::Killing);
        assert_eq!(transition(S::Killing, Event::Exited).unwrap(), S::Stopped);
    }

    #[test]
    fn transition_table_rejects_undefined_pairs() {
        use SupervisorState as S;

        let invalid = [
            (S::Starting, Event::Start),
            (S::Running { ready: false }, Event::Start),
            (S::Running { ready: true }, Event::Start),
            (S::Stopping, Event::Start),
            (S::Killing, Event::Start),
            (S::Stopped, Event::Stop),
            (S::Stopping, Event::Stop),
            (S::Killing, Event::Stop),
            (S::Stopped, Event::Kill),
            (S::Stopped, Event::Exited),
            (S::Stopped, Event::Launched),
            (S::Running { ready: true }, Event::Ready),
            (S::Stopped, Event::Ready),
        ];
        for (state, event) in invalid {
            let err = transition(state, event).unwrap_err();
            match err {
                SupervisorError::InvalidState { current, .. } => assert_eq!(current, state),
                other => panic!("expected InvalidState, got {other}"),
            }
        }
    }

    #[test]
    fn kill_is_accepted_from_every_live_state() {
        use SupervisorState as S;
        for state in [
            S::Starting,
            S::Running { ready: false },
            S::Running { ready: true },
            S::Stopping,
            S::Killing,
        ] {
            assert_eq!(transition(state, Event::Kill).unwrap(), S::Killing);
        }
    }

    #[test]
    fn parse_player_count_modern_format() {
        assert_eq!(
            parse_player_count("There are 3 of a max of 20 players online: a, b, c"),
            Some((3, 20))
        );
        assert_eq!(
            parse_player_count("There are 0 of a max of 12 players online"),
            Some((0, 12))
        );
    }

    #[test]
    fn parse_player_count_legacy_format() {
        assert_eq!(
            parse_player_count("There are 5/30 players online: someone"),
            Some((5, 30))
        );
    }

    #[test]
    fn parse_player_count_rejects_noise() {
        assert_eq!(parse_player_count("Unknown command"), None);
        assert_eq!(parse_player_count(""), None);
        assert_eq!(parse_player_count("There are many players"), None);
    }
}

#[cfg(all(test, target_os = "linux"))]
mod lifecycle_tests {
    use super::*;
    use crate::rcon_codec::{Frame, read_frame, write_frame};
    use std::{
        path::{Path, PathBuf},
        sync::atomic::{AtomicU64, Ordering},
        time::{SystemTime, UNIX_EPOCH},
    };
    use tokio::net::TcpListener;

    fn temp_dir_for(test_name: &str) -> PathBuf {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let mut dir = std::env::temp_dir();
        dir.push(format!(
            "hearth-supervisor-{test_name}-{}-{n}-{ts}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn sleeper_spec(dir: &Path) -> LaunchSpec {
        LaunchSpec {
            executable: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), "exec sleep 600".to_string()],
            working_dir: dir.to_path_buf(),
            log_file: dir.join("console.log"),
        }
    }

    fn sleeper_signature() -> RuntimeSignature {
        RuntimeSignature::new("sleep").with_arg_hint("600")
    }

    fn unreachable_rcon() -> RconSource {
        RconSource::Static(RconEndpoint {
            host: "127.0.0.1".to_string(),
            port: 1,
            password: "unused".to_string(),
        })
    }

    /// Console mock that accepts any number of connections, grants
    /// every authentication, and answers every command with `reply`.
    async fn mock_console(reply: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let Ok(auth) = read_frame(&mut sock).await else {
                        return;
                    };
                    if write_frame(&mut sock, &Frame::command(auth.request_id, ""))
                        .await
                        .is_err()
                    {
                        return;
                    }
                    loop {
                        let Ok(cmd) = read_frame(&mut sock).await else {
                            return;
                        };
                        let Ok(probe) = read_frame(&mut sock).await else {
                            return;
                        };
                        let _ = write_frame(&mut sock, &Frame::response(cmd.request_id, reply)).await;
                        let _ = write_frame(&mut sock, &Frame::response(probe.request_id, "")).await;
                    }
                });
            }
        });

        port
    }

    async fn wait_for_state<F>(sup: &Supervisor, what: &str, mut pred: F) -> StatusSnapshot
    where
        F: FnMut(&StatusSnapshot) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
        loop {
            let snap = sup.status().await;
            if pred(&snap) {
                return snap;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {what}; last state: {}",
                snap.state
            );
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    #[tokio::test]
    async fn start_resolves_then_kill_lands_in_stopped() {
        let dir = temp_dir_for("start-kill");
        let config = SupervisorConfig::new(
            sleeper_spec(&dir),
            sleeper_signature(),
            unreachable_rcon(),
        );
        let sup = Supervisor::new(config);

        let ack = sup.start().await.unwrap();
        assert_eq!(ack.state, SupervisorState::Starting);

        // Duplicate start is rejected while the first is in flight.
        let err = sup.start().await.unwrap_err();
        assert!(matches!(err, SupervisorError::InvalidState { .. }));

        let snap = wait_for_state(&sup, "running", |s| {
            matches!(s.state, SupervisorState::Running { .. })
        })
        .await;
        let pid = snap.pid.unwrap();
        assert!(monitor::is_alive(pid));

        let ack = sup.kill().await.unwrap();
        assert_eq!(ack.state, SupervisorState::Stopped);
        assert!(!monitor::is_alive(pid));

        // Idempotent once stopped.
        assert!(sup.kill().await.is_ok());
        assert!(sup.stop(true).await.is_ok());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn graceful_stop_escalates_to_kill_when_ignored() {
        let dir = temp_dir_for("stop-escalate");
        // The sleeper has no console, so the shutdown command cannot
        // be delivered and the grace period must expire.
        let mut config = SupervisorConfig::new(
            sleeper_spec(&dir),
            sleeper_signature(),
            unreachable_rcon(),
        );
        config.stop_grace = Duration::from_secs(1);
        let sup = Supervisor::new(config);

        sup.start().await.unwrap();
        let snap = wait_for_state(&sup, "running", |s| {
            matches!(s.state, SupervisorState::Running { .. })
        })
        .await;
        let pid = snap.pid.unwrap();

        let ack = sup.stop(true).await.unwrap();
        assert_eq!(ack.state, SupervisorState::Stopping);

        wait_for_state(&sup, "stopped", |s| s.state.is_stopped()).await;
        assert!(!monitor::is_alive(pid));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn readiness_flips_once_console_authenticates() {
        let dir = temp_dir_for("readiness");
        let port = mock_console("There are 2 of a max of 20 players online: alice, bob").await;
        let config = SupervisorConfig::new(
            sleeper_spec(&dir),
            sleeper_signature(),
            RconSource::Static(RconEndpoint {
                host: "127.0.0.1".to_string(),
                port,
                password: "pw".to_string(),
            }),
        );
        let sup = Supervisor::new(config);

        sup.start().await.unwrap();
        let snap = wait_for_state(&sup, "ready", |s| {
            matches!(s.state, SupervisorState::Running { ready: true })
        })
        .await;
        assert!(snap.ready);
        assert_eq!(snap.players, Some(2));
        assert_eq!(snap.max_players, 20);

        // Operator command relay goes through the live session.
        let reply = sup.run_command("list").await.unwrap();
        assert!(reply.contains("2 of a max of 20"));

        sup.kill().await.unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn run_command_requires_readiness() {
        let dir = temp_dir_for("not-ready");
        let config = SupervisorConfig::new(
            sleeper_spec(&dir),
            sleeper_signature(),
            unreachable_rcon(),
        );
        let sup = Supervisor::new(config);

        // Stopped: no console to talk to.
        let err = sup.run_command("list").await.unwrap_err();
        assert!(matches!(err, RconError::NotReady));

        sup.start().await.unwrap();
        wait_for_state(&sup, "running", |s| {
            matches!(s.state, SupervisorState::Running { .. })
        })
        .await;

        // Alive but not ready: still rejected.
        let err = sup.run_command("list").await.unwrap_err();
        assert!(matches!(err, RconError::NotReady));

        sup.kill().await.unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn status_within_ttl_is_served_from_cache() {
        let dir = temp_dir_for("status-cache");
        let config = SupervisorConfig::new(
            sleeper_spec(&dir),
            sleeper_signature(),
            unreachable_rcon(),
        );
        let sup = Supervisor::new(config);

        sup.start().await.unwrap();
        wait_for_state(&sup, "running", |s| {
            matches!(s.state, SupervisorState::Running { .. })
        })
        .await;

        // Back-to-back reads: a recomputation would produce a fresh
        // CPU sample and uptime, so bit-identical snapshots prove the
        // cache answered.
        let a = sup.status().await;
        let b = sup.status().await;
        assert_eq!(a, b);

        sup.kill().await.unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn status_beyond_ttl_takes_a_fresh_sample() {
        let dir = temp_dir_for("status-ttl-expiry");
        let mut config = SupervisorConfig::new(
            sleeper_spec(&dir),
            sleeper_signature(),
            unreachable_rcon(),
        );
        config.status_ttl = Duration::from_millis(250);
        let sup = Supervisor::new(config);

        sup.start().await.unwrap();
        wait_for_state(&sup, "running", |s| {
            matches!(s.state, SupervisorState::Running { .. })
        })
        .await;

        let a = sup.status().await;
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        let b = sup.status().await;

        // The second read recomputed: the server aged visibly.
        assert!(b.uptime_secs > a.uptime_secs);

        sup.kill().await.unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn concurrent_status_burst_shares_one_sample() {
        let dir = temp_dir_for("status-burst");
        let mut config = SupervisorConfig::new(
            sleeper_spec(&dir),
            sleeper_signature(),
            unreachable_rcon(),
        );
        config.status_ttl = Duration::from_millis(250);
        let sup = Supervisor::new(config);

        sup.start().await.unwrap();
        wait_for_state(&sup, "running", |s| {
            matches!(s.state, SupervisorState::Running { .. })
        })
        .await;

        // Let the last cached snapshot go stale, then poll from three
        // tasks at once. Only one may recompute; the others must get
        // the exact same snapshot, not their own CPU sample.
        tokio::time::sleep(Duration::from_millis(400)).await;
        let (a, b, c) = tokio::join!(sup.status(), sup.status(), sup.status());
        assert_eq!(a, b);
        assert_eq!(b, c);

        sup.kill().await.unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn failed_launch_lands_back_in_stopped() {
        let dir = temp_dir_for("failed-launch");
        let mut spec = sleeper_spec(&dir);
        spec.executable = dir.join("no-such-binary");
        let config = SupervisorConfig::new(spec, sleeper_signature(), unreachable_rcon());
        let sup = Supervisor::new(config);

        // The ack is optimistic; the launch failure surfaces through
        // the state machine shortly after.
        let ack = sup.start().await.unwrap();
        assert_eq!(ack.state, SupervisorState::Starting);

        let snap = wait_for_state(&sup, "stopped", |s| s.state.is_stopped()).await;
        assert!(snap.message.as_deref().unwrap_or("").contains("executable"));

        // A failed start leaves the supervisor usable: start again.
        assert!(sup.start().await.is_ok());
        sup.kill().await.unwrap();

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn external_process_death_is_observed_as_stopped() {
        let dir = temp_dir_for("external-death");
        let config = SupervisorConfig::new(
            sleeper_spec(&dir),
            sleeper_signature(),
            unreachable_rcon(),
        );
        let sup = Supervisor::new(config);

        sup.start().await.unwrap();
        let snap = wait_for_state(&sup, "running", |s| {
            matches!(s.state, SupervisorState::Running { .. })
        })
        .await;
        let pid = snap.pid.unwrap();

        // Someone kills the server outside the dashboard.
        unsafe {
            libc::kill(pid as i32, libc::SIGKILL);
        }

        let snap = wait_for_state(&sup, "stopped", |s| s.state.is_stopped()).await;
        assert!(snap.message.as_deref().unwrap_or("").contains("unexpectedly"));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
