mod common;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tokio_test::{assert_err, assert_ok};
use warden::error::{UnavailableReason, WardenError};
use warden::health::HealthMonitor;
use warden::orchestrator::{Availability, AvailabilityOrchestrator};
use warden::supervisor::{
    ManagedProcess, ProcessLauncher, ProcessSupervisor, ServerLogSink, StartOutcome, StaticLocator,
    VerifySchedule,
};
use warden::transport::Transport;

use common::{MockServer, Reply, closed_port_url, fast_checks, tags_json};

struct FakeProcess {
    alive: bool,
    terminated: Arc<AtomicBool>,
    // Keeps the fake server listening for as long as the "process" lives.
    _server: Option<MockServer>,
}

impl ManagedProcess for FakeProcess {
    fn pid(&self) -> Option<u32> {
        Some(4242)
    }

    fn is_alive(&mut self) -> bool {
        self.alive && !self.terminated.load(Ordering::SeqCst)
    }

    fn terminate(&mut self) -> Result<(), WardenError> {
        self.terminated.store(true, Ordering::SeqCst);
        self._server = None;
        Ok(())
    }
}

/// Launcher that "starts the server" by binding `port` in-process. The first
/// `unhealthy_first` probes get 503.
#[derive(Clone)]
struct FakeLauncher {
    port: Option<u16>,
    unhealthy_first: usize,
    alive: bool,
    launches: Arc<AtomicUsize>,
    terminated: Arc<AtomicBool>,
}

impl FakeLauncher {
    fn serving(port: u16, unhealthy_first: usize) -> Self {
        Self {
            port: Some(port),
            unhealthy_first,
            alive: true,
            launches: Arc::new(AtomicUsize::new(0)),
            terminated: Arc::new(AtomicBool::new(false)),
        }
    }

    fn silent(alive: bool) -> Self {
        Self {
            port: None,
            unhealthy_first: 0,
            alive,
            launches: Arc::new(AtomicUsize::new(0)),
            terminated: Arc::new(AtomicBool::new(false)),
        }
    }

    fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

impl ProcessLauncher for FakeLauncher {
    fn launch(
        &self,
        _binary: &Path,
        _sink: Arc<dyn ServerLogSink>,
    ) -> Result<Box<dyn ManagedProcess>, WardenError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let server = self.port.map(|port| {
            let std_listener = std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();
            std_listener.set_nonblocking(true).unwrap();
            let listener = tokio::net::TcpListener::from_std(std_listener).unwrap();
            let unhealthy_first = self.unhealthy_first;
            MockServer::serve(listener, move |_, index| {
                if index < unhealthy_first {
                    Reply::Json(503, "{}".to_string())
                } else {
                    Reply::Json(200, tags_json(&["llama3:latest"]))
                }
            })
        });
        Ok(Box::new(FakeProcess {
            alive: self.alive,
            terminated: self.terminated.clone(),
            _server: server,
        }))
    }
}

fn quick_schedule(n: usize) -> VerifySchedule {
    VerifySchedule {
        waits: vec![Duration::from_millis(20); n],
    }
}

fn installed() -> StaticLocator {
    StaticLocator(Some(PathBuf::from("/usr/local/bin/ollama")))
}

fn supervisor(url: &str, launcher: &FakeLauncher, locator: StaticLocator) -> ProcessSupervisor {
    ProcessSupervisor::new(Transport::new(url).unwrap(), "ollama")
        .with_locator(locator)
        .with_launcher(launcher.clone())
        .with_schedule(quick_schedule(5))
}

fn orchestrator(url: &str, supervisor: ProcessSupervisor, auto_start: bool) -> AvailabilityOrchestrator {
    let monitor = Arc::new(HealthMonitor::new(Transport::new(url).unwrap()));
    AvailabilityOrchestrator::new(monitor, Arc::new(supervisor), auto_start).with_check_options(fast_checks())
}

#[tokio::test]
async fn healthy_server_needs_no_spawn() {
    let server = MockServer::start(|_, _| Reply::Json(200, tags_json(&["llama3:latest"]))).await;
    let launcher = FakeLauncher::silent(true);
    let orch = orchestrator(&server.url, supervisor(&server.url, &launcher, installed()), true);

    let availability = assert_ok!(orch.ensure_available(Some("llama3")).await);
    assert!(availability.is_ok());
    assert_eq!(launcher.launches(), 0);
}

#[tokio::test]
async fn not_installed_never_spawns() {
    let (url, _) = closed_port_url();
    let launcher = FakeLauncher::silent(true);
    let orch = orchestrator(&url, supervisor(&url, &launcher, StaticLocator(None)), true);

    let availability = assert_ok!(orch.ensure_available(None).await);
    assert_eq!(availability, Availability::Unavailable(UnavailableReason::NotInstalled));
    assert_eq!(launcher.launches(), 0);
}

#[tokio::test]
async fn auto_start_disabled_reports_installed() {
    let (url, _) = closed_port_url();
    let launcher = FakeLauncher::silent(true);
    let orch = orchestrator(&url, supervisor(&url, &launcher, installed()), false);

    let availability = assert_ok!(orch.ensure_available(None).await);
    assert_eq!(availability.reason(), Some(&UnavailableReason::AutoStartDisabled));
    assert_eq!(launcher.launches(), 0);
}

#[tokio::test]
async fn unhealthy_server_is_not_restarted() {
    let server = MockServer::start(|_, _| Reply::Json(500, "{}".to_string())).await;
    let launcher = FakeLauncher::silent(true);
    let orch = orchestrator(&server.url, supervisor(&server.url, &launcher, installed()), true);

    let availability = assert_ok!(orch.ensure_available(None).await);
    assert_eq!(
        availability,
        Availability::Unavailable(UnavailableReason::Unhealthy { status: Some(500) })
    );
    assert_eq!(launcher.launches(), 0);
}

#[tokio::test]
async fn auto_start_verifies_on_third_attempt() {
    let (url, port) = closed_port_url();
    let launcher = FakeLauncher::serving(port, 2);
    let sup = supervisor(&url, &launcher, installed());

    let outcome = assert_ok!(sup.ensure_process_running().await);
    assert_eq!(
        outcome,
        StartOutcome::Started {
            pid: Some(4242),
            attempt: 3
        }
    );
    assert_eq!(launcher.launches(), 1);
    assert_eq!(sup.spawned_pid(), Some(4242));
}

#[tokio::test]
async fn orchestrator_auto_starts_then_reports_ready() {
    let (url, port) = closed_port_url();
    let launcher = FakeLauncher::serving(port, 2);
    let orch = orchestrator(&url, supervisor(&url, &launcher, installed()), true);

    let availability = assert_ok!(orch.ensure_available(Some("llama3")).await);
    match availability {
        Availability::Ready(status) => assert_eq!(status.model_present, Some(true)),
        other => panic!("expected Ready, got {other:?}"),
    }
    assert_eq!(launcher.launches(), 1);
}

#[tokio::test]
async fn concurrent_starts_spawn_once() {
    let (url, port) = closed_port_url();
    let launcher = FakeLauncher::serving(port, 0);
    let sup = supervisor(&url, &launcher, installed());

    let (a, b) = tokio::join!(sup.ensure_process_running(), sup.ensure_process_running());
    let outcomes = [assert_ok!(a), assert_ok!(b)];
    assert_eq!(launcher.launches(), 1);
    assert!(outcomes.iter().all(StartOutcome::is_running));
    assert!(outcomes.contains(&StartOutcome::AlreadyRunning));
}

#[tokio::test]
async fn silent_process_is_left_running_unverified() {
    let (url, _) = closed_port_url();
    let launcher = FakeLauncher::silent(true);
    let sup = supervisor(&url, &launcher, installed()).with_schedule(quick_schedule(3));

    let outcome = assert_ok!(sup.ensure_process_running().await);
    assert!(matches!(outcome, StartOutcome::Unverified { pid: Some(4242), .. }));
    assert!(!launcher.terminated.load(Ordering::SeqCst));
    assert_eq!(sup.spawned_pid(), Some(4242));

    // A second call reuses the live process instead of spawning again.
    assert_ok!(sup.ensure_process_running().await);
    assert_eq!(launcher.launches(), 1);
}

#[tokio::test]
async fn process_exiting_during_startup_fails() {
    let (url, _) = closed_port_url();
    let launcher = FakeLauncher::silent(false);
    let sup = supervisor(&url, &launcher, installed());

    let err = assert_err!(sup.ensure_process_running().await);
    assert!(matches!(err, WardenError::ProcessSpawnFailed(_)));
    assert_eq!(sup.spawned_pid(), None);
}

#[tokio::test]
async fn missing_binary_is_not_installed() {
    let (url, _) = closed_port_url();
    let launcher = FakeLauncher::silent(true);
    let sup = supervisor(&url, &launcher, StaticLocator(None));

    let err = assert_err!(sup.ensure_process_running().await);
    assert!(matches!(err, WardenError::NotInstalled));
    assert_eq!(launcher.launches(), 0);
}

#[tokio::test]
async fn stop_terminates_only_our_process() {
    let (url, port) = closed_port_url();
    let launcher = FakeLauncher::serving(port, 0);
    let sup = supervisor(&url, &launcher, installed());

    assert!(!assert_ok!(sup.stop().await), "nothing spawned yet");
    assert_ok!(sup.ensure_process_running().await);
    assert!(assert_ok!(sup.stop().await));
    assert!(launcher.terminated.load(Ordering::SeqCst));
    assert!(!assert_ok!(sup.stop().await));
}

#[tokio::test]
async fn pid_query_does_not_wait_for_a_start_in_flight() {
    let (url, _) = closed_port_url();
    let launcher = FakeLauncher::silent(true);
    let sup = Arc::new(supervisor(&url, &launcher, installed()).with_schedule(VerifySchedule {
        waits: vec![Duration::from_secs(2); 5],
    }));

    let starting = {
        let sup = sup.clone();
        tokio::spawn(async move { sup.ensure_process_running().await })
    };
    while launcher.launches() == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(sup.is_starting());
    let start = std::time::Instant::now();
    assert_eq!(sup.spawned_pid(), None);
    assert!(start.elapsed() < Duration::from_millis(100));

    starting.abort();
    let _ = starting.await;
    assert!(!sup.is_starting());
    assert_eq!(sup.spawned_pid(), Some(4242));
}
