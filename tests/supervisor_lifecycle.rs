//! Server Supervisor Lifecycle Tests
//!
//! These tests drive the full start/stop state machine against a fake
//! process launcher and a mock health endpoint. Focus: readiness
//! polling, timeout handling, graceful-then-forced shutdown, and the
//! single-spawn guarantee under concurrent starts.

use async_trait::async_trait;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use stoker::config::ServerConfig;
use stoker::error::{RuntimeError, error_codes};
use stoker::server::{ProcessLauncher, ServerProcess, ServerState, ServerSupervisor};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// ────────────────────────────────────────────────────────────────────────────
// Fake launcher
// ────────────────────────────────────────────────────────────────────────────

/// Observable side effects of the fake launcher and its processes.
///
/// `exited` seeds the exit flag of the next spawned process; each
/// process then tracks its own exit so a killed stale handle does not
/// mark its replacement as dead.
#[derive(Clone, Default)]
struct Probes {
    spawn_count: Arc<AtomicUsize>,
    exited: Arc<AtomicBool>,
    terminated: Arc<AtomicBool>,
    killed: Arc<AtomicBool>,
}

struct FakeProcess {
    probes: Probes,
    exited: AtomicBool,
    exit_on_terminate: bool,
}

impl ServerProcess for FakeProcess {
    fn id(&self) -> u32 {
        4242
    }

    fn has_exited(&mut self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    fn terminate(&mut self) -> stoker::Result<()> {
        self.probes.terminated.store(true, Ordering::SeqCst);
        if self.exit_on_terminate {
            self.exited.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    fn kill(&mut self) -> stoker::Result<()> {
        self.probes.killed.store(true, Ordering::SeqCst);
        self.exited.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeLauncher {
    probes: Probes,
    exit_on_terminate: bool,
    orphan_count: usize,
}

#[async_trait]
impl ProcessLauncher for FakeLauncher {
    fn resolve_executable(&self, _config: &ServerConfig) -> stoker::Result<PathBuf> {
        Ok(PathBuf::from("/fake/bin/ollama"))
    }

    fn spawn(
        &self,
        _executable: &Path,
        _config: &ServerConfig,
    ) -> stoker::Result<Box<dyn ServerProcess>> {
        self.probes.spawn_count.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeProcess {
            exited: AtomicBool::new(self.probes.exited.load(Ordering::SeqCst)),
            probes: self.probes.clone(),
            exit_on_terminate: self.exit_on_terminate,
        }))
    }

    async fn kill_orphans(&self, _process_name: &str) -> stoker::Result<usize> {
        Ok(self.orphan_count)
    }
}

fn fake_launcher(exit_on_terminate: bool) -> (Arc<dyn ProcessLauncher>, Probes) {
    let probes = Probes::default();
    let launcher = Arc::new(FakeLauncher {
        probes: probes.clone(),
        exit_on_terminate,
        orphan_count: 0,
    });
    (launcher, probes)
}

fn fast_config(server: &MockServer) -> ServerConfig {
    ServerConfig::default()
        .with_host("127.0.0.1")
        .with_port(server.address().port())
        .with_probe_timeout_secs(1)
        .with_health_poll_interval_ms(50)
        .with_start_timeout_secs(5)
        .with_stop_grace_secs(1)
}

/// Serve the health probe: the first `failures` requests get 500, the
/// rest 200. A fresh spawn looks exactly like this, down at most of the
/// time and then up once the process finishes booting.
async fn mount_probe(server: &MockServer, failures: u64) {
    if failures > 0 {
        Mock::given(method("GET"))
            .and(path("/api/version"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(failures)
            .with_priority(1)
            .mount(server)
            .await;
    }
    Mock::given(method("GET"))
        .and(path("/api/version"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"version": "0.6.2"})))
        .mount(server)
        .await;
}

// ────────────────────────────────────────────────────────────────────────────
// Start
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_start_spawns_and_waits_for_health_probe() {
    let server = MockServer::start().await;
    mount_probe(&server, 2).await;

    let (launcher, probes) = fake_launcher(true);
    let supervisor = ServerSupervisor::with_launcher(fast_config(&server), launcher);

    supervisor.start().await.expect("start should succeed");

    assert_eq!(supervisor.state(), ServerState::Running);
    assert_eq!(probes.spawn_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_start_is_noop_when_server_already_healthy() {
    let server = MockServer::start().await;
    mount_probe(&server, 0).await;

    let (launcher, probes) = fake_launcher(true);
    let supervisor = ServerSupervisor::with_launcher(fast_config(&server), launcher);

    supervisor.start().await.expect("start should succeed");

    // An externally managed server: reachable, but never spawned here.
    assert_eq!(probes.spawn_count.load(Ordering::SeqCst), 0);
    assert!(supervisor.is_running().await);
}

#[tokio::test]
async fn test_start_times_out_and_kills_half_started_process() {
    let server = MockServer::start().await;
    // Probe never comes up.
    Mock::given(method("GET"))
        .and(path("/api/version"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let (launcher, probes) = fake_launcher(true);
    let config = fast_config(&server).with_start_timeout_secs(1);
    let supervisor = ServerSupervisor::with_launcher(config, launcher);

    let err = supervisor.start().await.expect_err("start should time out");

    assert!(matches!(err, RuntimeError::StartTimeout(_)));
    assert_eq!(err.code(), error_codes::START_TIMEOUT);
    assert!(probes.killed.load(Ordering::SeqCst), "spawned process must be killed");
    assert_eq!(supervisor.state(), ServerState::Stopped);
}

#[tokio::test]
async fn test_start_reports_process_that_exits_before_healthy() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/version"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let (launcher, probes) = fake_launcher(true);
    // The process is dead the moment the readiness loop first looks.
    probes.exited.store(true, Ordering::SeqCst);
    let supervisor = ServerSupervisor::with_launcher(fast_config(&server), launcher);

    let err = supervisor.start().await.expect_err("start should fail");

    assert!(matches!(err, RuntimeError::SpawnFailed(_)));
    assert_eq!(supervisor.state(), ServerState::Stopped);
}

#[tokio::test]
async fn test_concurrent_starts_spawn_exactly_one_process() {
    let server = MockServer::start().await;
    mount_probe(&server, 1).await;

    let (launcher, probes) = fake_launcher(true);
    let supervisor = Arc::new(ServerSupervisor::with_launcher(fast_config(&server), launcher));

    let a = tokio::spawn({
        let supervisor = Arc::clone(&supervisor);
        async move { supervisor.start().await }
    });
    let b = tokio::spawn({
        let supervisor = Arc::clone(&supervisor);
        async move { supervisor.start().await }
    });

    let (a, b) = tokio::join!(a, b);
    a.expect("join").expect("first start should succeed");
    b.expect("join").expect("second start should succeed");

    assert_eq!(
        probes.spawn_count.load(Ordering::SeqCst),
        1,
        "racing starts must share one process"
    );
}

#[tokio::test]
async fn test_start_replaces_crashed_process() {
    let server = MockServer::start().await;
    mount_probe(&server, 1).await;

    let (launcher, probes) = fake_launcher(true);
    let supervisor = ServerSupervisor::with_launcher(fast_config(&server), launcher);
    supervisor.start().await.expect("first start");
    assert_eq!(probes.spawn_count.load(Ordering::SeqCst), 1);

    // The server wedges behind our back: the probe goes dark while the
    // handle is still held.
    server.reset().await;
    mount_probe(&server, 1).await;

    supervisor.start().await.expect("restart");

    assert!(probes.killed.load(Ordering::SeqCst), "stale handle must be reaped");
    assert_eq!(probes.spawn_count.load(Ordering::SeqCst), 2);
    assert_eq!(supervisor.state(), ServerState::Running);
}

// ────────────────────────────────────────────────────────────────────────────
// Ensure-running
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_ensure_running_starts_then_becomes_noop() {
    let server = MockServer::start().await;
    mount_probe(&server, 1).await;

    let (launcher, probes) = fake_launcher(true);
    let supervisor = ServerSupervisor::with_launcher(fast_config(&server), launcher);

    supervisor.ensure_running().await.expect("first ensure");
    supervisor.ensure_running().await.expect("second ensure");

    assert_eq!(probes.spawn_count.load(Ordering::SeqCst), 1);
}

// ────────────────────────────────────────────────────────────────────────────
// Stop
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_stop_terminates_gracefully() {
    let server = MockServer::start().await;
    mount_probe(&server, 1).await;

    let (launcher, probes) = fake_launcher(true);
    let supervisor = ServerSupervisor::with_launcher(fast_config(&server), launcher);
    supervisor.start().await.expect("start");

    supervisor.stop().await;

    assert!(probes.terminated.load(Ordering::SeqCst));
    assert!(!probes.killed.load(Ordering::SeqCst), "graceful exit needs no force kill");
    assert_eq!(supervisor.state(), ServerState::Stopped);
}

#[tokio::test]
async fn test_stop_force_kills_after_grace_period() {
    let server = MockServer::start().await;
    mount_probe(&server, 1).await;

    // Process ignores the termination signal.
    let (launcher, probes) = fake_launcher(false);
    let supervisor = ServerSupervisor::with_launcher(fast_config(&server), launcher);
    supervisor.start().await.expect("start");

    supervisor.stop().await;

    assert!(probes.terminated.load(Ordering::SeqCst));
    assert!(probes.killed.load(Ordering::SeqCst), "stubborn process must be force killed");
    assert_eq!(supervisor.state(), ServerState::Stopped);
}

#[tokio::test]
async fn test_stop_without_process_is_noop() {
    let (launcher, probes) = fake_launcher(true);
    let config = ServerConfig::default().with_port(9).with_probe_timeout_secs(1);
    let supervisor = ServerSupervisor::with_launcher(config, launcher);

    supervisor.stop().await;

    assert_eq!(supervisor.state(), ServerState::Stopped);
    assert!(!probes.terminated.load(Ordering::SeqCst));
}

// ────────────────────────────────────────────────────────────────────────────
// Orphans and version
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_kill_orphans_reports_count() {
    let probes = Probes::default();
    let launcher = Arc::new(FakeLauncher {
        probes,
        exit_on_terminate: true,
        orphan_count: 3,
    });
    let config = ServerConfig::default().with_port(9).with_probe_timeout_secs(1);
    let supervisor = ServerSupervisor::with_launcher(config, launcher);

    assert_eq!(supervisor.kill_orphan_processes().await, 3);
}

#[tokio::test]
async fn test_version_parses_health_payload() {
    let server = MockServer::start().await;
    mount_probe(&server, 0).await;

    let (launcher, _probes) = fake_launcher(true);
    let supervisor = ServerSupervisor::with_launcher(fast_config(&server), launcher);

    let version = supervisor.version().await.expect("version should parse");
    assert_eq!(version, "0.6.2");
}

#[tokio::test]
async fn test_version_surfaces_http_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/version"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let (launcher, _probes) = fake_launcher(true);
    let supervisor = ServerSupervisor::with_launcher(fast_config(&server), launcher);

    let err = supervisor.version().await.expect_err("version should fail");
    assert!(matches!(err, RuntimeError::HttpStatus { status: 500, .. }));
}
