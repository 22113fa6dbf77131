use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

pub const DEFAULT_API_URL: &str = "http://localhost:11434";
pub const DEFAULT_MODEL: &str = "llama3.2";
pub const DEFAULT_SERVER_BINARY: &str = "ollama";

/// Hard cap for a streamed generation (20 minutes).
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 1200;

/// Settings consumed by the core. Owned by whoever constructs the `Warden`;
/// the core never writes back to it.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub api_url: String,
    pub default_model: String,
    pub request_timeout_secs: u64,
    pub temperature: f64,
    pub max_tokens: u32,
    pub auto_start_server: bool,
    pub force_recheck: bool,
    pub status_poll_enabled: bool,
    /// Executable name (or absolute path) used for binary discovery.
    pub server_binary: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            default_model: DEFAULT_MODEL.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            temperature: 0.7,
            max_tokens: 2048,
            auto_start_server: true,
            force_recheck: false,
            status_poll_enabled: true,
            server_binary: DEFAULT_SERVER_BINARY.to_string(),
        }
    }
}

/// On-disk shape. Every field optional so a partial file overlays defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    api_url: Option<String>,
    default_model: Option<String>,
    request_timeout_secs: Option<u64>,
    temperature: Option<f64>,
    max_tokens: Option<u32>,
    auto_start_server: Option<bool>,
    force_recheck: Option<bool>,
    status_poll_enabled: Option<bool>,
    server_binary: Option<String>,
}

impl Config {
    /// Defaults, then the TOML file (if any), then environment overrides.
    pub fn load() -> Self {
        let mut config = Self::default();
        if let Some(path) = config_path() {
            match std::fs::read_to_string(&path) {
                Ok(text) => match Self::apply_toml(&mut config, &text) {
                    Ok(()) => tracing::info!(path = %path.display(), "loaded config file"),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), "ignoring invalid config file: {e}")
                    }
                },
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(path = %path.display(), "cannot read config file: {e}"),
            }
        }
        config.apply_env();
        config
    }

    /// Overlay a TOML document onto `self`.
    pub fn apply_toml(&mut self, text: &str) -> Result<(), toml::de::Error> {
        let file: FileConfig = toml::from_str(text)?;
        if let Some(v) = file.api_url {
            self.api_url = v;
        }
        if let Some(v) = file.default_model {
            self.default_model = v;
        }
        if let Some(v) = file.request_timeout_secs {
            self.request_timeout_secs = v;
        }
        if let Some(v) = file.temperature {
            self.temperature = v;
        }
        if let Some(v) = file.max_tokens {
            self.max_tokens = v;
        }
        if let Some(v) = file.auto_start_server {
            self.auto_start_server = v;
        }
        if let Some(v) = file.force_recheck {
            self.force_recheck = v;
        }
        if let Some(v) = file.status_poll_enabled {
            self.status_poll_enabled = v;
        }
        if let Some(v) = file.server_binary {
            self.server_binary = v;
        }
        self.sanitize();
        Ok(())
    }

    fn apply_env(&mut self) {
        // OLLAMA_HOST is what the server itself reads; honour it so client and
        // server agree, but an explicit WARDEN_API_URL wins.
        if let Ok(host) = env::var("OLLAMA_HOST") {
            self.api_url = normalize_host(&host);
        }
        if let Ok(url) = env::var("WARDEN_API_URL") {
            self.api_url = url;
        }
        if let Ok(model) = env::var("WARDEN_MODEL") {
            self.default_model = model;
        }
        if let Some(v) = parse_env("WARDEN_TIMEOUT_SECS") {
            self.request_timeout_secs = v;
        }
        if let Some(v) = parse_env("WARDEN_TEMPERATURE") {
            self.temperature = v;
        }
        if let Some(v) = parse_env("WARDEN_MAX_TOKENS") {
            self.max_tokens = v;
        }
        if let Some(v) = parse_env_bool("WARDEN_AUTO_START") {
            self.auto_start_server = v;
        }
        if let Some(v) = parse_env_bool("WARDEN_FORCE_RECHECK") {
            self.force_recheck = v;
        }
        if let Some(v) = parse_env_bool("WARDEN_STATUS_POLL") {
            self.status_poll_enabled = v;
        }
        if let Ok(bin) = env::var("WARDEN_SERVER_BINARY") {
            self.server_binary = bin;
        }
        self.sanitize();
    }

    /// Replace out-of-range values with defaults instead of failing.
    fn sanitize(&mut self) {
        let defaults = Self::default();
        self.api_url = self.api_url.trim_end_matches('/').to_string();
        if self.api_url.is_empty() {
            tracing::warn!("empty api_url, using {DEFAULT_API_URL}");
            self.api_url = defaults.api_url;
        }
        if self.default_model.trim().is_empty() {
            tracing::warn!("empty default_model, using {DEFAULT_MODEL}");
            self.default_model = defaults.default_model;
        }
        if self.request_timeout_secs == 0 {
            tracing::warn!("request_timeout_secs must be > 0, using default");
            self.request_timeout_secs = defaults.request_timeout_secs;
        }
        if !self.temperature.is_finite() || !(0.0..=2.0).contains(&self.temperature) {
            tracing::warn!(temperature = self.temperature, "temperature out of range, using default");
            self.temperature = defaults.temperature;
        }
        if self.max_tokens == 0 {
            tracing::warn!("max_tokens must be > 0, using default");
            self.max_tokens = defaults.max_tokens;
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn config_path() -> Option<PathBuf> {
    if let Ok(p) = env::var("WARDEN_CONFIG") {
        return Some(PathBuf::from(p));
    }
    let base = env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
    Some(base.join("warden").join("config.toml"))
}

/// `OLLAMA_HOST` may be `0.0.0.0:11434`, `host`, or a full URL.
fn normalize_host(host: &str) -> String {
    let host = host.trim();
    if host.starts_with("http://") || host.starts_with("https://") {
        return host.to_string();
    }
    let host = host.replace("0.0.0.0", "127.0.0.1");
    if host.contains(':') {
        format!("http://{host}")
    } else {
        format!("http://{host}:11434")
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("{key}={raw} is not valid, ignoring");
            None
        }
    }
}

fn parse_env_bool(key: &str) -> Option<bool> {
    let raw = env::var(key).ok()?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            tracing::warn!("{key}={raw} is not a boolean, ignoring");
            None
        }
    }
}
