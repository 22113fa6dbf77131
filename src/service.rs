use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::batcher::ChunkSink;
use crate::config::Config;
use crate::error::WardenError;
use crate::generation::{GenerationClient, PullOutcome, PullProgress, StreamOutcome};
use crate::health::{HealthCheckOptions, HealthMonitor, HealthStatus, ServerModel};
use crate::orchestrator::{Availability, AvailabilityOrchestrator};
use crate::poller::{DEFAULT_INTERVAL, PollerStatus, StatusPoller, StatusPollerHandle};
use crate::supervisor::{ProcessSupervisor, StartOutcome};
use crate::tracker::RequestTracker;
use crate::transport::Transport;

/// Snapshot for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub api_url: String,
    pub health: Option<HealthStatus>,
    pub unreachable: Option<String>,
    pub poller: Option<PollerStatus>,
    pub live_requests: usize,
    /// A server start is being verified; `spawned_pid` is not known yet.
    pub starting: bool,
    pub spawned_pid: Option<u32>,
}

/// Everything wired together from one [`Config`]. Must be built inside a
/// tokio runtime when status polling is enabled.
pub struct Warden {
    config: Config,
    monitor: Arc<HealthMonitor>,
    supervisor: Arc<ProcessSupervisor>,
    orchestrator: Arc<AvailabilityOrchestrator>,
    generation: Arc<GenerationClient>,
    tracker: Arc<RequestTracker>,
    poller: Option<StatusPollerHandle>,
    shutdown: CancellationToken,
    next_id: AtomicU64,
}

impl Warden {
    pub fn new(config: Config) -> Result<Self, WardenError> {
        let binary = config.server_binary.clone();
        Self::assemble(config, move |transport| ProcessSupervisor::new(transport, binary))
    }

    /// Like [`new`](Self::new) but with a caller-built supervisor, e.g. one
    /// with a custom locator or launcher.
    pub fn assemble(
        config: Config,
        make_supervisor: impl FnOnce(Transport) -> ProcessSupervisor,
    ) -> Result<Self, WardenError> {
        let transport = Transport::new(config.api_url.clone())?;
        let monitor = Arc::new(HealthMonitor::new(transport.clone()));
        let supervisor = Arc::new(make_supervisor(transport.clone()));
        let orchestrator = Arc::new(
            AvailabilityOrchestrator::new(monitor.clone(), supervisor.clone(), config.auto_start_server)
                .with_force_recheck(config.force_recheck),
        );
        let generation = Arc::new(GenerationClient::new(transport, orchestrator.clone(), &config));

        let shutdown = CancellationToken::new();
        let poller = config
            .status_poll_enabled
            .then(|| StatusPoller::spawn(monitor.clone(), DEFAULT_INTERVAL, &shutdown));

        tracing::info!(
            api_url = %config.api_url,
            model = %config.default_model,
            auto_start = config.auto_start_server,
            status_poll = config.status_poll_enabled,
            "warden ready"
        );

        Ok(Self {
            config,
            monitor,
            supervisor,
            orchestrator,
            generation,
            tracker: Arc::new(RequestTracker::new()),
            poller,
            shutdown,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    pub fn tracker(&self) -> &Arc<RequestTracker> {
        &self.tracker
    }

    /// Status transitions from the background poller, if enabled.
    pub fn subscribe_status(&self) -> Option<watch::Receiver<PollerStatus>> {
        self.poller.as_ref().map(StatusPollerHandle::subscribe)
    }

    fn resolve_model<'a>(&'a self, model: Option<&'a str>) -> &'a str {
        model.filter(|m| !m.trim().is_empty()).unwrap_or(self.config.default_model.as_str())
    }

    pub async fn ensure_available(&self, model: Option<&str>) -> Result<Availability, WardenError> {
        self.orchestrator.ensure_available(model).await
    }

    /// Streamed generation under `request_id`. A live request with the same
    /// id is cancelled first.
    pub async fn generate<S: ChunkSink>(
        &self,
        request_id: Option<&str>,
        model: Option<&str>,
        prompt: &str,
        sink: S,
    ) -> Result<StreamOutcome, WardenError> {
        let id = match request_id {
            Some(id) => id.to_string(),
            None => format!("req-{}", self.next_id.fetch_add(1, Ordering::Relaxed)),
        };
        let model = self.resolve_model(model);
        let handle = self.tracker.create_request(&id);
        let opts = self.generation.default_stream_options();

        let result = self
            .generation
            .generate_stream(model, prompt, sink, handle.token(), &opts)
            .await;
        self.tracker.complete(&handle);
        result
    }

    pub async fn generate_once(&self, model: Option<&str>, prompt: &str) -> Result<String, WardenError> {
        self.generation.generate_once(self.resolve_model(model), prompt).await
    }

    /// Cancel a live request. False if the id is unknown or already finished.
    pub fn cancel(&self, request_id: &str) -> bool {
        self.tracker.abort_request(request_id)
    }

    pub async fn pull(
        &self,
        model: &str,
        progress: mpsc::Sender<PullProgress>,
    ) -> Result<PullOutcome, WardenError> {
        let handle = self.tracker.create_request(&format!("pull:{model}"));
        let result = self.generation.pull_model(model, progress, handle.token()).await;
        self.tracker.complete(&handle);
        result
    }

    pub async fn list_models(&self, bypass_cache: bool) -> Result<Arc<Vec<ServerModel>>, WardenError> {
        self.monitor.list_models(bypass_cache).await
    }

    pub async fn start_server(&self) -> Result<StartOutcome, WardenError> {
        let outcome = self.supervisor.ensure_process_running().await?;
        self.monitor.invalidate();
        if let Some(poller) = &self.poller {
            poller.refresh();
        }
        Ok(outcome)
    }

    pub async fn status(&self, model: Option<&str>) -> ServiceStatus {
        let opts = HealthCheckOptions::no_retry();
        let (health, unreachable) = match self.monitor.check_health(model, &opts).await {
            Ok(status) => (Some(status), None),
            Err(e) => (None, Some(e.user_message())),
        };
        ServiceStatus {
            api_url: self.config.api_url.clone(),
            health,
            unreachable,
            poller: self.poller.as_ref().map(StatusPollerHandle::current),
            live_requests: self.tracker.len(),
            starting: self.supervisor.is_starting(),
            spawned_pid: self.supervisor.spawned_pid(),
        }
    }

    /// Abort requests, stop polling, drop caches. A spawned server keeps
    /// running.
    pub async fn shutdown(mut self) {
        self.dispose().await;
    }

    async fn dispose(&mut self) {
        self.tracker.abort_all();
        self.shutdown.cancel();
        if let Some(poller) = self.poller.take() {
            poller.stop().await;
        }
        self.monitor.invalidate();
        tracing::debug!("warden disposed");
    }

    /// Tear this instance down and build a fresh one from `config`.
    pub async fn reconfigure(mut self, config: Config) -> Result<Warden, WardenError> {
        tracing::info!("reconfiguring");
        self.dispose().await;
        Warden::new(config)
    }
}

impl Drop for Warden {
    fn drop(&mut self) {
        self.tracker.abort_all();
        self.shutdown.cancel();
    }
}
