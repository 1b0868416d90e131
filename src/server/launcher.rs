//! Server process launching and platform-specific process control.
//!
//! All platform branching for the supervisor lives here, behind the
//! [`ProcessLauncher`] and [`ServerProcess`] traits. The supervisor only
//! ever talks to the traits, so tests substitute fakes and the state
//! machine stays platform-free.

use crate::config::ServerConfig;
use crate::error::{Result, RuntimeError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use tracing::{debug, warn};

/// Subcommand that puts the runtime into serving mode.
const SERVE_SUBCOMMAND: &str = "serve";

/// Environment applied when GPU offload is enabled (the default). The
/// runtime offloads as many layers as fit.
const GPU_OFFLOAD_ENV: &[(&str, &str)] = &[("OLLAMA_NUM_GPU", "999")];

/// Handle to a spawned server process.
///
/// Abstracts `std::process::Child` so tests can substitute fakes.
pub trait ServerProcess: Send {
    /// OS process id.
    fn id(&self) -> u32;

    /// Non-blocking exit check.
    fn has_exited(&mut self) -> bool;

    /// Send the platform's graceful termination request.
    ///
    /// # Errors
    ///
    /// Returns an error if the signal could not be delivered.
    fn terminate(&mut self) -> Result<()>;

    /// Force-kill the process and reap it.
    ///
    /// # Errors
    ///
    /// Returns an error if the kill failed.
    fn kill(&mut self) -> Result<()>;
}

/// Locates, spawns, and cleans up server processes.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Locate the server executable for this machine.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::ExecutableNotFound`] when no candidate
    /// exists.
    fn resolve_executable(&self, config: &ServerConfig) -> Result<PathBuf>;

    /// Spawn the server process in serving mode.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::SpawnFailed`] when the process could not
    /// be started.
    fn spawn(&self, executable: &Path, config: &ServerConfig) -> Result<Box<dyn ServerProcess>>;

    /// Enumerate processes matching `process_name` and force-kill each.
    ///
    /// Returns the number of processes killed.
    ///
    /// # Errors
    ///
    /// Returns an error when enumeration itself fails; individual kill
    /// failures are skipped.
    async fn kill_orphans(&self, process_name: &str) -> Result<usize>;
}

/// The real launcher: `std::process` spawning plus per-platform signal
/// and enumeration mechanics.
#[derive(Debug, Default)]
pub struct NativeLauncher;

/// Launcher used by [`crate::server::ServerSupervisor`] unless a fake is
/// injected.
pub fn native_launcher() -> Arc<dyn ProcessLauncher> {
    Arc::new(NativeLauncher)
}

#[async_trait]
impl ProcessLauncher for NativeLauncher {
    fn resolve_executable(&self, config: &ServerConfig) -> Result<PathBuf> {
        if let Some(path) = &config.executable_path {
            if path.exists() {
                return Ok(path.clone());
            }
            return Err(RuntimeError::ExecutableNotFound(format!(
                "configured path {} does not exist",
                path.display()
            )));
        }

        let candidates = bundled_candidates(&config.executable_name);
        for candidate in &candidates {
            if candidate.exists() {
                debug!(path = %candidate.display(), "found bundled server executable");
                return Ok(candidate.clone());
            }
        }

        // Fall back to $PATH lookup.
        if let Ok(found) = which::which(&config.executable_name) {
            return Ok(found);
        }

        let searched: Vec<String> = candidates
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        Err(RuntimeError::ExecutableNotFound(format!(
            "{} is not on PATH and no bundled copy exists (searched {})",
            config.executable_name,
            searched.join(", ")
        )))
    }

    fn spawn(&self, executable: &Path, config: &ServerConfig) -> Result<Box<dyn ServerProcess>> {
        let child = Command::new(executable)
            .arg(SERVE_SUBCOMMAND)
            .envs(build_environment(config))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                RuntimeError::SpawnFailed(format!("{}: {e}", executable.display()))
            })?;
        Ok(Box::new(NativeProcess { child }))
    }

    #[cfg(unix)]
    async fn kill_orphans(&self, process_name: &str) -> Result<usize> {
        // pgrep -x matches the executable name exactly; exit code 1 means
        // no processes matched.
        let output = tokio::process::Command::new("pgrep")
            .args(["-x", process_name])
            .output()
            .await?;
        if !output.status.success() {
            return Ok(0);
        }

        let mut killed = 0usize;
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            let Ok(pid) = line.trim().parse::<i32>() else {
                continue;
            };
            // SAFETY: sending SIGKILL to an arbitrary pid has no memory
            // safety implications.
            let rc = unsafe { libc::kill(pid, libc::SIGKILL) };
            if rc == 0 {
                killed += 1;
            } else {
                warn!(pid, "failed to kill orphaned process");
            }
        }
        Ok(killed)
    }

    #[cfg(windows)]
    async fn kill_orphans(&self, process_name: &str) -> Result<usize> {
        let image = platform_binary_name(process_name);
        let output = tokio::process::Command::new("taskkill")
            .args(["/F", "/T", "/IM", &image])
            .output()
            .await?;
        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            return Ok(stdout.matches("SUCCESS").count());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        // "not found" is the no-orphans case, not a failure.
        if stderr.to_lowercase().contains("not found") {
            return Ok(0);
        }
        Err(RuntimeError::Io(std::io::Error::other(format!(
            "taskkill failed: {}",
            stderr.trim()
        ))))
    }

    #[cfg(not(any(unix, windows)))]
    async fn kill_orphans(&self, _process_name: &str) -> Result<usize> {
        Err(RuntimeError::UnsupportedPlatform(
            "orphan process cleanup is only implemented for unix and windows".into(),
        ))
    }
}

/// A spawned server child process.
struct NativeProcess {
    child: std::process::Child,
}

impl ServerProcess for NativeProcess {
    fn id(&self) -> u32 {
        self.child.id()
    }

    fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> Result<()> {
        // SAFETY: kill(2) with SIGTERM has no memory safety implications.
        let rc = unsafe { libc::kill(self.child.id() as i32, libc::SIGTERM) };
        if rc == 0 {
            Ok(())
        } else {
            Err(RuntimeError::Io(std::io::Error::last_os_error()))
        }
    }

    #[cfg(windows)]
    fn terminate(&mut self) -> Result<()> {
        // Without /F this asks the process to close rather than killing it.
        let status = Command::new("taskkill")
            .args(["/PID", &self.child.id().to_string()])
            .status()?;
        if status.success() {
            Ok(())
        } else {
            Err(RuntimeError::Io(std::io::Error::other(
                "taskkill returned a failure status",
            )))
        }
    }

    #[cfg(not(any(unix, windows)))]
    fn terminate(&mut self) -> Result<()> {
        // No graceful mechanism available; fall through to a hard kill.
        self.kill()
    }

    fn kill(&mut self) -> Result<()> {
        self.child.kill()?;
        // Reap so the pid does not linger as a zombie.
        let _ = self.child.wait();
        Ok(())
    }
}

/// Environment for the spawned server: bind address, GPU offload when
/// enabled, then config overrides (applied last, so they win).
pub(crate) fn build_environment(config: &ServerConfig) -> Vec<(String, String)> {
    let mut env = vec![("OLLAMA_HOST".to_string(), config.bind_address())];
    if config.gpu_offload {
        for (key, value) in GPU_OFFLOAD_ENV {
            env.push(((*key).to_string(), (*value).to_string()));
        }
    }
    for (key, value) in &config.extra_env {
        env.push((key.clone(), value.clone()));
    }
    env
}

/// Conventional install locations checked before `$PATH`, bundled copies
/// first.
fn bundled_candidates(name: &str) -> Vec<PathBuf> {
    let binary = platform_binary_name(name);
    let mut candidates = Vec::new();

    // A copy shipped alongside the host application's own binary.
    if let Ok(current) = std::env::current_exe()
        && let Some(dir) = current.parent()
    {
        candidates.push(dir.join(&binary));
        #[cfg(target_os = "macos")]
        candidates.push(dir.join("../Resources").join(&binary));
    }

    #[cfg(unix)]
    {
        candidates.push(PathBuf::from("/usr/local/bin").join(&binary));
        candidates.push(PathBuf::from("/usr/bin").join(&binary));
    }

    #[cfg(windows)]
    if let Some(local) = dirs::data_local_dir() {
        candidates.push(local.join("Programs").join(name).join(&binary));
    }

    candidates
}

#[cfg(windows)]
fn platform_binary_name(name: &str) -> String {
    format!("{name}.exe")
}

#[cfg(not(windows))]
fn platform_binary_name(name: &str) -> String {
    name.to_string()
}
