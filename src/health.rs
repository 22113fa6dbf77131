use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::cache::{HEALTH_TTL, TtlCache};
use crate::error::WardenError;
use crate::transport::{RequestOptions, Transport};

/// Model listing endpoint, doubles as the liveness probe.
pub const TAGS_PATH: &str = "/api/tags";

/// Upper bound on any single retry delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Per-probe connection timeout.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// An installed model as reported by the server. Snapshots are replaced
/// wholesale on every successful probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerModel {
    pub name: String,
    #[serde(rename = "size", default)]
    pub size_bytes: i64,
    /// RFC 3339 timestamp as sent by the server.
    #[serde(default)]
    pub modified_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ServerModel>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Unknown,
    Healthy,
    Unhealthy,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthStatus {
    pub state: HealthState,
    /// Model the caller asked about, if any.
    pub checked_model: Option<String>,
    /// `Some(false)` means the server is healthy but lacks `checked_model`.
    pub model_present: Option<bool>,
    /// Last HTTP status seen, for unhealthy results.
    pub http_status: Option<u16>,
    pub detail: Option<String>,
}

impl HealthStatus {
    pub fn unknown() -> Self {
        Self {
            state: HealthState::Unknown,
            checked_model: None,
            model_present: None,
            http_status: None,
            detail: None,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.state == HealthState::Healthy
    }

    pub fn is_missing_model(&self) -> bool {
        self.is_healthy() && self.model_present == Some(false)
    }
}

#[derive(Debug, Clone)]
pub struct HealthCheckOptions {
    pub retry: bool,
    /// Additional attempts after the first.
    pub retry_count: u32,
    pub retry_delay: Duration,
    pub bypass_cache: bool,
}

impl Default for HealthCheckOptions {
    fn default() -> Self {
        Self {
            retry: true,
            retry_count: 2,
            retry_delay: Duration::from_millis(1500),
            bypass_cache: false,
        }
    }
}

impl HealthCheckOptions {
    /// Single probe, still cache-aware.
    pub fn no_retry() -> Self {
        Self {
            retry: false,
            ..Self::default()
        }
    }

    pub fn bypassing_cache(mut self) -> Self {
        self.bypass_cache = true;
        self
    }
}

/// Cached outcome of a probe. Failures are cached too, so a dead server is
/// not re-probed on every call inside the TTL window.
#[derive(Debug, Clone)]
enum CachedProbe {
    Status(HealthStatus),
    Unreachable { attempts: u32, last_error: String },
}

enum ProbeOutcome {
    Listed(Vec<ServerModel>),
    HttpStatus(u16),
    Malformed(String),
    Transport(WardenError),
}

/// Exponential backoff with jitter: `base * 2^(attempt-1) * (1 + 0.1*jitter)`,
/// capped at [`MAX_BACKOFF`]. `attempt` is 1-based; `jitter` is in `[0, 1)`.
pub fn backoff_delay(base: Duration, attempt: u32, jitter: f64) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16) as i32;
    let factor = 2f64.powi(exponent) * (1.0 + 0.1 * jitter.clamp(0.0, 1.0));
    base.mul_f64(factor).min(MAX_BACKOFF)
}

/// `llama3` matches `llama3:latest` and `llama3:8b`; a tagged request must
/// match exactly.
pub fn model_matches(installed: &str, requested: &str) -> bool {
    if installed == requested {
        return true;
    }
    if requested.contains(':') {
        return false;
    }
    installed
        .strip_prefix(requested)
        .is_some_and(|rest| rest.starts_with(':'))
}

pub struct HealthMonitor {
    transport: Transport,
    status_cache: TtlCache<Option<String>, CachedProbe>,
    models_cache: TtlCache<(), Arc<Vec<ServerModel>>>,
}

impl HealthMonitor {
    pub fn new(transport: Transport) -> Self {
        Self::with_ttl(transport, HEALTH_TTL)
    }

    pub fn with_ttl(transport: Transport, ttl: Duration) -> Self {
        Self {
            transport,
            status_cache: TtlCache::new(ttl),
            models_cache: TtlCache::new(ttl),
        }
    }

    pub fn base_url(&self) -> &str {
        self.transport.base_url()
    }

    /// Is the server responsive, and (if `model` is given) does it have it?
    ///
    /// Returns `Err(ServerUnreachable)` when every attempt failed at the
    /// transport level. HTTP errors after exhausting retries come back as an
    /// `Unhealthy` status instead, since the server is demonstrably there.
    pub async fn check_health(
        &self,
        model: Option<&str>,
        opts: &HealthCheckOptions,
    ) -> Result<HealthStatus, WardenError> {
        let key = model.map(str::to_string);

        if !opts.bypass_cache
            && let Some(cached) = self.status_cache.get(&key)
        {
            tracing::debug!(model = ?model, "health check served from cache");
            return match cached {
                CachedProbe::Status(status) => Ok(status),
                CachedProbe::Unreachable {
                    attempts,
                    last_error,
                } => Err(WardenError::ServerUnreachable {
                    attempts,
                    last_error,
                }),
            };
        }

        let max_attempts = if opts.retry { 1 + opts.retry_count } else { 1 };
        let mut attempt = 0;

        let outcome = loop {
            attempt += 1;
            let outcome = self.probe().await;

            let retryable = matches!(
                outcome,
                ProbeOutcome::HttpStatus(_) | ProbeOutcome::Transport(_)
            );
            if !retryable || attempt >= max_attempts {
                break outcome;
            }

            let delay = backoff_delay(opts.retry_delay, attempt, rand::thread_rng().r#gen());
            tracing::debug!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                "health probe failed, retrying"
            );
            tokio::time::sleep(delay).await;
        };

        let cached = match outcome {
            ProbeOutcome::Listed(models) => {
                let model_present = model.map(|m| models.iter().any(|s| model_matches(&s.name, m)));
                if model_present == Some(false) {
                    tracing::info!(model = ?model, "server healthy but model not installed");
                }
                self.models_cache.insert((), Arc::new(models));
                CachedProbe::Status(HealthStatus {
                    state: HealthState::Healthy,
                    checked_model: key.clone(),
                    model_present,
                    http_status: Some(200),
                    detail: None,
                })
            }
            ProbeOutcome::HttpStatus(status) => {
                tracing::warn!(status, attempts = attempt, "server answered with HTTP error");
                CachedProbe::Status(HealthStatus {
                    state: HealthState::Unhealthy,
                    checked_model: key.clone(),
                    model_present: None,
                    http_status: Some(status),
                    detail: Some(format!("HTTP {status}")),
                })
            }
            ProbeOutcome::Malformed(detail) => {
                tracing::warn!("model listing was not valid JSON: {detail}");
                CachedProbe::Status(HealthStatus {
                    state: HealthState::Error,
                    checked_model: key.clone(),
                    model_present: None,
                    http_status: Some(200),
                    detail: Some(detail),
                })
            }
            ProbeOutcome::Transport(err) => {
                tracing::info!(attempts = attempt, "server unreachable: {err}");
                CachedProbe::Unreachable {
                    attempts: attempt,
                    last_error: err.to_string(),
                }
            }
        };

        self.status_cache.insert(key, cached.clone());
        match cached {
            CachedProbe::Status(status) => Ok(status),
            CachedProbe::Unreachable {
                attempts,
                last_error,
            } => Err(WardenError::ServerUnreachable {
                attempts,
                last_error,
            }),
        }
    }

    /// Installed models from the last successful probe, probing if the cached
    /// list is missing or expired.
    pub async fn list_models(&self, bypass_cache: bool) -> Result<Arc<Vec<ServerModel>>, WardenError> {
        if !bypass_cache && let Some(models) = self.models_cache.get(&()) {
            return Ok(models);
        }
        match self.probe().await {
            ProbeOutcome::Listed(models) => {
                let models = Arc::new(models);
                self.models_cache.insert((), models.clone());
                Ok(models)
            }
            ProbeOutcome::HttpStatus(status) => Err(WardenError::ServerError {
                status,
                message: "model listing failed".to_string(),
            }),
            ProbeOutcome::Malformed(detail) => Err(WardenError::MalformedResponse(detail)),
            ProbeOutcome::Transport(err) => Err(err),
        }
    }

    /// Drop all cached results, e.g. after starting the server.
    pub fn invalidate(&self) {
        self.status_cache.clear();
        self.models_cache.clear();
    }

    async fn probe(&self) -> ProbeOutcome {
        let opts = RequestOptions::with_timeout(PROBE_TIMEOUT);
        match self.transport.get(TAGS_PATH, &opts).await {
            Ok(resp) if resp.is_success() => match serde_json::from_slice::<TagsResponse>(&resp.body) {
                Ok(tags) => ProbeOutcome::Listed(tags.models),
                Err(e) => ProbeOutcome::Malformed(e.to_string()),
            },
            Ok(resp) => ProbeOutcome::HttpStatus(resp.status),
            Err(e) => ProbeOutcome::Transport(e),
        }
    }
}
