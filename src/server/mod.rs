//! Local inference server supervision.
//!
//! [`ServerSupervisor`] owns the lifecycle of the local server process:
//! it locates and spawns the executable, waits for the HTTP health probe
//! to come up, tears the process down again, and clears orphans left by
//! a crashed session. Exactly one healthy process exists while callers
//! need it; none afterwards.
//!
//! The state machine is
//!
//! ```text
//! Stopped ─start()→ Starting ─probe ok→ Running ─stop()→ Stopping ─→ Stopped
//! ```
//!
//! Transitions are serialized by an async mutex on the process slot, so a
//! `start()` racing another `start()` blocks and then observes the same
//! healthy server instead of spawning a duplicate.

pub mod launcher;

pub use launcher::{NativeLauncher, ProcessLauncher, ServerProcess, native_launcher};

use crate::config::ServerConfig;
use crate::error::{Result, RuntimeError};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Interval between exit polls while waiting out the stop grace period.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Lifecycle state of the supervised server process.
///
/// Tracks the process this supervisor spawned. A server started outside
/// the supervisor can be `Running` per [`ServerSupervisor::is_running`]
/// while the state here stays `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    /// No supervised process.
    Stopped,
    /// Spawned, waiting for the health probe to come up.
    Starting,
    /// Spawned and healthy.
    Running,
    /// Graceful shutdown in progress.
    Stopping,
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        };
        f.write_str(label)
    }
}

/// Wire shape of the `GET /api/version` payload.
#[derive(Debug, Deserialize)]
struct VersionResponse {
    version: String,
}

/// Supervises the local inference server process.
pub struct ServerSupervisor {
    config: ServerConfig,
    client: reqwest::Client,
    launcher: Arc<dyn ProcessLauncher>,
    state: StdMutex<ServerState>,
    // Also the transition lock: held across spawn/poll/stop so concurrent
    // callers serialize on it.
    process: Mutex<Option<Box<dyn ServerProcess>>>,
}

impl ServerSupervisor {
    /// Create a supervisor with the native process launcher.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_launcher(config, native_launcher())
    }

    /// Create a supervisor with an injected launcher.
    pub fn with_launcher(config: ServerConfig, launcher: Arc<dyn ProcessLauncher>) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            launcher,
            state: StdMutex::new(ServerState::Stopped),
            process: Mutex::new(None),
        }
    }

    /// The server configuration this supervisor was built with.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Snapshot of the supervised process state.
    pub fn state(&self) -> ServerState {
        match self.state.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_state(&self, next: ServerState) {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *guard != next {
            debug!(from = %*guard, to = %next, "server state transition");
            *guard = next;
        }
    }

    /// Whether the server answers its health probe.
    ///
    /// Issues a short-timeout `GET /api/version`. Never errors: any
    /// failure (unreachable, timeout, non-success status) is `false`.
    pub async fn is_running(&self) -> bool {
        let url = format!("{}/api/version", self.config.base_url());
        let timeout = Duration::from_secs(self.config.probe_timeout_secs);
        match self.client.get(&url).timeout(timeout).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    /// The server's build version from the health endpoint.
    ///
    /// # Errors
    ///
    /// Returns a transient error when the server is unreachable, or a
    /// protocol error when the payload is not the expected shape.
    pub async fn version(&self) -> Result<String> {
        let url = format!("{}/api/version", self.config.base_url());
        let timeout = Duration::from_secs(self.config.probe_timeout_secs);
        let resp = self
            .client
            .get(&url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| crate::retry::classify_reqwest_error(&e))?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(RuntimeError::HttpStatus {
                status: status.as_u16(),
                detail,
            });
        }
        let payload: VersionResponse = resp
            .json()
            .await
            .map_err(|e| RuntimeError::Protocol(format!("invalid version payload: {e}")))?;
        Ok(payload.version)
    }

    /// Start the server if it is not already answering its probe.
    ///
    /// Resolves the executable, spawns it, and polls the health probe
    /// every `health_poll_interval_ms` until it answers or the start
    /// window elapses. No-ops when the server is already running. A
    /// concurrent `start()` blocks on the transition lock and then
    /// observes the same healthy server; it never spawns a second
    /// process.
    ///
    /// # Errors
    ///
    /// - [`RuntimeError::ExecutableNotFound`] when no executable exists.
    /// - [`RuntimeError::SpawnFailed`] when the spawn itself fails or the
    ///   process exits before becoming healthy.
    /// - [`RuntimeError::StartTimeout`] when the probe stays down for the
    ///   whole start window; the half-started process is killed so a
    ///   later `start()` begins from a clean slate.
    pub async fn start(&self) -> Result<()> {
        let mut slot = self.process.lock().await;

        if self.is_running().await {
            debug!("server already running; start is a no-op");
            return Ok(());
        }

        // A held handle whose probe is down is a crashed or wedged
        // process; clear it before respawning.
        if let Some(mut stale) = slot.take() {
            warn!(pid = stale.id(), "clearing unhealthy server process before restart");
            if let Err(e) = stale.kill() {
                warn!(error = %e, "failed to kill stale server process");
            }
        }

        self.set_state(ServerState::Starting);
        match self.spawn_and_wait_ready(&mut slot).await {
            Ok(()) => {
                self.set_state(ServerState::Running);
                info!("server is ready");
                Ok(())
            }
            Err(e) => {
                if let Some(mut process) = slot.take() {
                    warn!(pid = process.id(), "start failed; killing spawned process");
                    if let Err(kill_err) = process.kill() {
                        warn!(error = %kill_err, "failed to kill spawned process");
                    }
                }
                self.set_state(ServerState::Stopped);
                Err(e)
            }
        }
    }

    async fn spawn_and_wait_ready(
        &self,
        slot: &mut Option<Box<dyn ServerProcess>>,
    ) -> Result<()> {
        let executable = self.launcher.resolve_executable(&self.config)?;
        info!(executable = %executable.display(), "starting server");
        *slot = Some(self.launcher.spawn(&executable, &self.config)?);

        let deadline = Instant::now() + Duration::from_secs(self.config.start_timeout_secs);
        let poll = Duration::from_millis(self.config.health_poll_interval_ms);
        loop {
            if self.is_running().await {
                return Ok(());
            }
            if let Some(process) = slot.as_mut()
                && process.has_exited()
            {
                return Err(RuntimeError::SpawnFailed(
                    "server process exited before becoming healthy".into(),
                ));
            }
            if Instant::now() >= deadline {
                return Err(RuntimeError::StartTimeout(self.config.start_timeout_secs));
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Start the server iff the health probe says it is down.
    ///
    /// Idempotent; safe to call before every operation.
    ///
    /// # Errors
    ///
    /// Propagates [`ServerSupervisor::start`] errors.
    pub async fn ensure_running(&self) -> Result<()> {
        if self.is_running().await {
            return Ok(());
        }
        self.start().await
    }

    /// Stop the supervised process.
    ///
    /// Sends the graceful termination signal, waits up to the configured
    /// grace period, then force-kills. Failures are logged, never
    /// surfaced: shutdown must not be blocked. Internal state is cleared
    /// on every path; a supervisor with no process handle is a no-op.
    pub async fn stop(&self) {
        let mut slot = self.process.lock().await;
        let Some(mut process) = slot.take() else {
            self.set_state(ServerState::Stopped);
            return;
        };

        self.set_state(ServerState::Stopping);
        let pid = process.id();
        info!(pid, "stopping server");

        if let Err(e) = process.terminate() {
            warn!(pid, error = %e, "graceful termination signal failed");
        }

        let deadline = Instant::now() + Duration::from_secs(self.config.stop_grace_secs);
        let mut exited = false;
        while Instant::now() < deadline {
            if process.has_exited() {
                exited = true;
                break;
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }

        if !exited {
            warn!(pid, "server did not exit within grace period; force killing");
            if let Err(e) = process.kill() {
                warn!(pid, error = %e, "force kill failed");
            }
        }

        self.set_state(ServerState::Stopped);
        info!(pid, "server stopped");
    }

    /// Force-kill processes matching the server executable name.
    ///
    /// Intended to run once at application startup to clear processes a
    /// crashed session left behind. Failures are logged and swallowed.
    /// Returns the number of processes killed.
    pub async fn kill_orphan_processes(&self) -> usize {
        match self
            .launcher
            .kill_orphans(&self.config.executable_name)
            .await
        {
            Ok(0) => 0,
            Ok(count) => {
                info!(count, "killed orphaned server processes");
                count
            }
            Err(e) => {
                warn!(error = %e, "orphan cleanup failed");
                0
            }
        }
    }
}

impl std::fmt::Debug for ServerSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSupervisor")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
