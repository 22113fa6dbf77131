use std::sync::Arc;

use crate::error::{UnavailableReason, WardenError};
use crate::health::{HealthCheckOptions, HealthMonitor, HealthStatus};
use crate::supervisor::{ProcessSupervisor, StartOutcome};

/// Outcome of [`AvailabilityOrchestrator::ensure_available`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    Ready(HealthStatus),
    Unavailable(UnavailableReason),
}

impl Availability {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    pub fn reason(&self) -> Option<&UnavailableReason> {
        match self {
            Self::Ready(_) => None,
            Self::Unavailable(r) => Some(r),
        }
    }
}

/// Probe, diagnose, auto-start, and otherwise hand back a decision token.
/// Never prompts anyone itself.
pub struct AvailabilityOrchestrator {
    monitor: Arc<HealthMonitor>,
    supervisor: Arc<ProcessSupervisor>,
    auto_start: bool,
    force_recheck: bool,
    check_options: HealthCheckOptions,
}

impl AvailabilityOrchestrator {
    pub fn new(
        monitor: Arc<HealthMonitor>,
        supervisor: Arc<ProcessSupervisor>,
        auto_start: bool,
    ) -> Self {
        Self {
            monitor,
            supervisor,
            auto_start,
            force_recheck: false,
            check_options: HealthCheckOptions::default(),
        }
    }

    /// Skip the health cache on the first probe of every call.
    pub fn with_force_recheck(mut self, force: bool) -> Self {
        self.force_recheck = force;
        self
    }

    pub fn with_check_options(mut self, opts: HealthCheckOptions) -> Self {
        self.check_options = opts;
        self
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    pub async fn ensure_available(&self, model: Option<&str>) -> Result<Availability, WardenError> {
        let mut opts = self.check_options.clone();
        opts.bypass_cache |= self.force_recheck;

        // 1. probe
        match self.monitor.check_health(model, &opts).await {
            Ok(status) if status.is_healthy() => return Ok(Availability::Ready(status)),
            Ok(status) => {
                // Server is there but unhappy; restarting it is not our call.
                tracing::warn!(state = ?status.state, http_status = ?status.http_status, "server unhealthy");
                return Ok(Availability::Unavailable(UnavailableReason::Unhealthy {
                    status: status.http_status,
                }));
            }
            Err(e) if e.is_unreachable() => {
                tracing::info!("server unreachable, checking for a local install");
            }
            Err(e) => {
                return Err(WardenError::UnexpectedFailure(format!("health check: {e}")));
            }
        }

        // 2. diagnose
        let Some(binary) = self.supervisor.locate_binary() else {
            tracing::info!("server binary not found");
            return Ok(Availability::Unavailable(UnavailableReason::NotInstalled));
        };

        if !self.auto_start {
            tracing::info!(binary = %binary.display(), "server installed but auto-start disabled");
            return Ok(Availability::Unavailable(UnavailableReason::AutoStartDisabled));
        }

        // 3. auto-start, then one more look
        let detail = match self.supervisor.ensure_process_running().await {
            Ok(StartOutcome::Unverified { detail, .. }) => Some(detail),
            Ok(_) => None,
            Err(WardenError::NotInstalled) => {
                return Ok(Availability::Unavailable(UnavailableReason::NotInstalled));
            }
            Err(e) => Some(e.to_string()),
        };

        self.monitor.invalidate();
        let recheck = HealthCheckOptions::no_retry().bypassing_cache();
        match self.monitor.check_health(model, &recheck).await {
            Ok(status) if status.is_healthy() => Ok(Availability::Ready(status)),
            Ok(status) => Ok(Availability::Unavailable(UnavailableReason::StartFailed {
                detail: detail.unwrap_or_else(|| format!("server unhealthy after start: {:?}", status.state)),
            })),
            // 4. still nothing
            Err(e) => Ok(Availability::Unavailable(UnavailableReason::StartFailed {
                detail: detail.unwrap_or_else(|| e.to_string()),
            })),
        }
    }
}
