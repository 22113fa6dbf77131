//! Background health polling on a self-tuning interval.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::health::{HealthCheckOptions, HealthMonitor, HealthState};

pub const MIN_INTERVAL: Duration = Duration::from_secs(5);
pub const MAX_INTERVAL: Duration = Duration::from_secs(300);
pub const ERROR_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

/// Identical observations needed before the interval starts growing.
const STABLE_THRESHOLD: u32 = 3;
const GROWTH_FACTOR: f64 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Running,
    NotRunning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollerState {
    Checking,
    StableHealthy,
    StableUnhealthy,
    Error,
}

impl From<Classification> for PollerState {
    fn from(c: Classification) -> Self {
        match c {
            Classification::Running => Self::StableHealthy,
            Classification::NotRunning => Self::StableUnhealthy,
            Classification::Error => Self::Error,
        }
    }
}

/// Interval bookkeeping. Owned by the poll loop alone.
#[derive(Debug, Clone)]
pub struct PollingState {
    interval: Duration,
    last: Option<Classification>,
    same_count: u32,
}

impl PollingState {
    pub fn new(initial: Duration) -> Self {
        Self {
            interval: initial.clamp(MIN_INTERVAL, MAX_INTERVAL),
            last: None,
            same_count: 0,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn same_count(&self) -> u32 {
        self.same_count
    }

    /// Fold in one observation and return the interval to wait next.
    pub fn observe(&mut self, class: Classification) -> Duration {
        let previous = self.last.replace(class);
        match previous {
            Some(prev) if prev == class => {
                self.same_count = (self.same_count + 1).min(STABLE_THRESHOLD);
                if self.same_count >= STABLE_THRESHOLD {
                    self.interval = self.interval.mul_f64(GROWTH_FACTOR).min(MAX_INTERVAL);
                }
            }
            // First observation only sets the baseline.
            None => self.same_count = 1,
            Some(_) => {
                self.same_count = 1;
                self.interval = (self.interval / 2).max(MIN_INTERVAL);
            }
        }
        if class == Classification::Error {
            self.interval = ERROR_INTERVAL;
        }
        self.interval
    }
}

/// Something the poller can ask "is the server up?".
pub trait StatusSource: Send + Sync + 'static {
    fn classify(&self, bypass_cache: bool) -> impl Future<Output = Classification> + Send;
}

impl StatusSource for HealthMonitor {
    async fn classify(&self, bypass_cache: bool) -> Classification {
        let mut opts = HealthCheckOptions::no_retry();
        opts.bypass_cache = bypass_cache;
        match self.check_health(None, &opts).await {
            Ok(status) => match status.state {
                HealthState::Healthy => Classification::Running,
                HealthState::Unhealthy => Classification::NotRunning,
                HealthState::Error | HealthState::Unknown => Classification::Error,
            },
            Err(e) if e.is_unreachable() => Classification::NotRunning,
            Err(e) => {
                tracing::debug!("status poll failed: {e}");
                Classification::Error
            }
        }
    }
}

/// Published after every check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PollerStatus {
    pub state: PollerState,
    pub classification: Option<Classification>,
    #[serde(rename = "interval_ms", serialize_with = "as_millis")]
    pub interval: Duration,
    pub checks: u64,
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

pub struct StatusPollerHandle {
    status: watch::Receiver<PollerStatus>,
    refresh: Arc<Notify>,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl StatusPollerHandle {
    pub fn subscribe(&self) -> watch::Receiver<PollerStatus> {
        self.status.clone()
    }

    pub fn current(&self) -> PollerStatus {
        self.status.borrow().clone()
    }

    /// Check now instead of waiting out the interval. Skips the health cache.
    pub fn refresh(&self) {
        self.refresh.notify_one();
    }

    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.task.await
            && e.is_panic()
        {
            tracing::warn!("status poller panicked: {e}");
        }
    }
}

pub struct StatusPoller;

impl StatusPoller {
    /// Start the loop. It ends when `cancel` (or the handle's own token) fires.
    pub fn spawn<S: StatusSource>(
        source: Arc<S>,
        initial: Duration,
        cancel: &CancellationToken,
    ) -> StatusPollerHandle {
        let token = cancel.child_token();
        let refresh = Arc::new(Notify::new());
        let mut state = PollingState::new(initial);
        let (tx, rx) = watch::channel(PollerStatus {
            state: PollerState::Checking,
            classification: None,
            interval: state.interval(),
            checks: 0,
        });

        let task = {
            let token = token.clone();
            let refresh = refresh.clone();
            tokio::spawn(async move {
                let mut forced = false;
                let mut checks = 0u64;
                loop {
                    let class = tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        class = source.classify(forced) => class,
                    };
                    checks += 1;
                    let before = state.interval();
                    let interval = state.observe(class);
                    if interval != before {
                        tracing::debug!(
                            ?class,
                            interval_ms = interval.as_millis() as u64,
                            "status poll interval changed"
                        );
                    }
                    tx.send_replace(PollerStatus {
                        state: class.into(),
                        classification: Some(class),
                        interval,
                        checks,
                    });

                    // Fresh timer every round, so a changed interval takes effect now.
                    forced = tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        _ = refresh.notified() => true,
                        _ = tokio::time::sleep(interval) => false,
                    };
                }
                tracing::debug!("status poller stopped");
            })
        };

        StatusPollerHandle {
            status: rx,
            refresh,
            token,
            task,
        }
    }
}
