use thiserror::Error;

/// Install page surfaced when the server binary cannot be found.
pub const INSTALL_URL: &str = "https://ollama.com/download";

/// Why the orchestrator could not make the server available.
///
/// This is a decision token: the orchestrator never talks to the user, it
/// returns one of these and the caller decides how to present it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnavailableReason {
    /// No server binary on this machine. Caller should offer the install link.
    NotInstalled,
    /// Binary exists but auto-start is off. Caller should offer "start now".
    AutoStartDisabled,
    /// A start was attempted but the server never answered its health probe.
    StartFailed { detail: String },
    /// Server answered but with a non-success status (not a reachability issue).
    Unhealthy { status: Option<u16> },
}

impl UnavailableReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotInstalled => "NotInstalled",
            Self::AutoStartDisabled => "AutoStartDisabled",
            Self::StartFailed { .. } => "StartFailed",
            Self::Unhealthy { .. } => "Unhealthy",
        }
    }
}

impl std::fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StartFailed { detail } => write!(f, "StartFailed: {detail}"),
            Self::Unhealthy { status: Some(s) } => write!(f, "Unhealthy: HTTP {s}"),
            other => f.write_str(other.as_str()),
        }
    }
}

#[derive(Debug, Error)]
pub enum WardenError {
    #[error("connection refused by {url}")]
    ConnectionRefused { url: String },

    #[error("timed out after {0}ms")]
    ConnectionTimeout(u64),

    #[error("server error {status}: {message}")]
    ServerError { status: u16, message: String },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("model not found: {model}")]
    ModelNotFound { model: String },

    #[error("server binary not installed")]
    NotInstalled,

    #[error("failed to spawn server process: {0}")]
    ProcessSpawnFailed(String),

    #[error("cancelled")]
    Cancelled,

    #[error("server unreachable after {attempts} attempts: {last_error}")]
    ServerUnreachable { attempts: u32, last_error: String },

    #[error("server unavailable: {0}")]
    Unavailable(UnavailableReason),

    #[error("unexpected failure: {0}")]
    UnexpectedFailure(String),
}

impl WardenError {
    /// Classify a reqwest failure at the transport boundary.
    pub fn from_reqwest(err: reqwest::Error, url: &str, timeout_ms: u64) -> Self {
        if err.is_timeout() {
            Self::ConnectionTimeout(timeout_ms)
        } else if err.is_connect() {
            Self::ConnectionRefused {
                url: url.to_string(),
            }
        } else if err.is_decode() {
            Self::MalformedResponse(err.to_string())
        } else if let Some(status) = err.status() {
            Self::ServerError {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            // Reset / incomplete message: the peer went away mid-exchange.
            Self::ConnectionRefused {
                url: url.to_string(),
            }
        }
    }

    /// Returns true for transient errors that may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConnectionRefused { .. } => true,
            Self::ConnectionTimeout(_) => true,
            // 5xx = server error (retryable), 4xx = client error (not retryable)
            Self::ServerError { status, .. } => *status >= 500,
            Self::ServerUnreachable { .. } => true,
            _ => false,
        }
    }

    /// True when the server could not be reached at all, as opposed to
    /// answering with an HTTP error. Only these escalate to the supervisor.
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionRefused { .. }
                | Self::ConnectionTimeout(_)
                | Self::ServerUnreachable { .. }
        )
    }

    /// Produce a message safe to show to a human operator, with the next step
    /// they can take.
    pub fn user_message(&self) -> String {
        match self {
            Self::ConnectionRefused { .. } | Self::ServerUnreachable { .. } => {
                "cannot reach the local model server. Start it with: ollama serve".to_string()
            }
            Self::ConnectionTimeout(ms) => format!("request timed out after {ms}ms"),
            Self::ServerError { status, message } => {
                format!("model server returned HTTP {status}: {message}")
            }
            Self::MalformedResponse(_) => "failed to parse model server response".to_string(),
            Self::ModelNotFound { model } => {
                format!("model '{model}' is not installed. Pull it with: ollama pull {model}")
            }
            Self::NotInstalled => {
                format!("the model server is not installed. Download it from {INSTALL_URL}")
            }
            Self::ProcessSpawnFailed(msg) => {
                format!("could not start the model server ({msg}). Start it manually with: ollama serve")
            }
            Self::Cancelled => "cancelled".to_string(),
            Self::Unavailable(reason) => match reason {
                UnavailableReason::NotInstalled => WardenError::NotInstalled.user_message(),
                UnavailableReason::AutoStartDisabled => {
                    "the model server is installed but not running, and auto-start is disabled. \
                     Start it with: ollama serve"
                        .to_string()
                }
                UnavailableReason::StartFailed { detail } => {
                    WardenError::ProcessSpawnFailed(detail.clone()).user_message()
                }
                UnavailableReason::Unhealthy { status } => match status {
                    Some(s) => format!("the model server is running but unhealthy (HTTP {s})"),
                    None => "the model server is running but unhealthy".to_string(),
                },
            },
            Self::UnexpectedFailure(msg) => format!("unexpected failure: {msg}"),
        }
    }
}
