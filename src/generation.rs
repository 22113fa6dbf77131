//! One-shot and streaming text generation against the local server.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::batcher::{BatchReport, BatcherConfig, ChunkBatcher, ChunkSink};
use crate::config::Config;
use crate::error::WardenError;
use crate::orchestrator::{Availability, AvailabilityOrchestrator};
use crate::transport::{RequestOptions, Transport};

pub const GENERATE_PATH: &str = "/api/generate";
pub const PULL_PATH: &str = "/api/pull";

pub const MAX_PROMPT_CHARS: usize = 8000;
pub const PROMPT_TRUNCATION_MARKER: &str = "\n\n[Prompt truncated: exceeded 8000 characters]";

/// Bound on a non-streaming generation.
pub const ONE_SHOT_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on waiting for response headers of a pull.
pub const PULL_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Fraction of the hard timeout at which the advisory fires.
pub const SOFT_TIMEOUT_RATIO: f64 = 0.8;

pub const SLOW_GENERATION_NOTICE: &str =
    "\n\n_Still generating... this is taking longer than usual._\n\n";

/// Final in-band chunk when the hard timeout ends a stream.
pub fn timeout_notice(timeout: Duration) -> String {
    format!(
        "\n\n_Error: generation timed out after {}s. Try a shorter prompt or a smaller model._",
        timeout.as_secs()
    )
}

fn failure_notice(message: &str) -> String {
    format!("\n\n_Error: {message}_")
}

/// Cut `prompt` to [`MAX_PROMPT_CHARS`] characters and append the marker.
/// Prompts within the limit are returned untouched.
pub fn truncate_prompt(prompt: &str) -> Cow<'_, str> {
    match prompt.char_indices().nth(MAX_PROMPT_CHARS) {
        None => Cow::Borrowed(prompt),
        Some((byte_idx, _)) => {
            Cow::Owned(format!("{}{PROMPT_TRUNCATION_MARKER}", &prompt[..byte_idx]))
        }
    }
}

/// Sampling options, serialized with the server's field names.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationOptions {
    #[serde(rename = "num_predict")]
    pub max_tokens: u32,
    pub temperature: f64,
    pub top_k: u32,
    pub top_p: f64,
    pub repeat_penalty: f64,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            max_tokens: 2048,
            temperature: 0.7,
            top_k: 40,
            top_p: 0.9,
            repeat_penalty: 1.1,
        }
    }
}

impl GenerationOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationRequest {
    pub model: String,
    pub prompt: String,
    pub stream: bool,
    pub options: GenerationOptions,
}

impl GenerationRequest {
    /// Builds the wire request; the prompt is truncated here.
    pub fn new(model: &str, prompt: &str, stream: bool, options: GenerationOptions) -> Self {
        let truncated = truncate_prompt(prompt);
        if matches!(truncated, Cow::Owned(_)) {
            tracing::info!(max_chars = MAX_PROMPT_CHARS, "prompt truncated");
        }
        Self {
            model: model.to_string(),
            prompt: truncated.into_owned(),
            stream,
            options,
        }
    }
}

/// One NDJSON line of a streaming generation.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamChunk {
    #[serde(rename = "response", default)]
    pub response_text: Option<String>,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub done_reason: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub eval_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct OneShotResponse {
    response: String,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Hard cap on the whole stream.
    pub timeout: Duration,
    pub batcher: BatcherConfig,
}

impl StreamOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            batcher: BatcherConfig::default(),
        }
    }
}

/// How a stream ended. Only failures before the first byte are `Err`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed(BatchReport),
    /// Cancelled by the caller. Nothing further was delivered.
    Cancelled,
    /// Hard timeout; the consumer got a final diagnostic chunk.
    TimedOut(BatchReport),
    /// Server or network failure mid-stream; the consumer got an `Error:` chunk.
    Failed { message: String, report: BatchReport },
    /// The consumer went away. The request was dropped and everything it had
    /// not taken is in `undelivered`.
    ConsumerClosed(BatchReport),
}

impl StreamOutcome {
    pub fn report(&self) -> Option<&BatchReport> {
        match self {
            Self::Completed(r)
            | Self::TimedOut(r)
            | Self::ConsumerClosed(r)
            | Self::Failed { report: r, .. } => Some(r),
            Self::Cancelled => None,
        }
    }
}

/// One progress event from a model pull.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PullProgress {
    pub status: String,
    #[serde(default)]
    pub digest: Option<String>,
    #[serde(default)]
    pub completed: Option<u64>,
    #[serde(default)]
    pub total: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct PullLine {
    #[serde(default)]
    error: Option<String>,
    #[serde(flatten)]
    progress: Option<PullProgress>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    Completed,
    Cancelled,
}

/// Map an HTTP error from the generate/pull endpoints to the taxonomy.
fn classify_status(status: u16, body: &str, model: &str) -> WardenError {
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v["error"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.trim().chars().take(500).collect());
    if status == 404 && message.contains("not found") {
        return WardenError::ModelNotFound {
            model: model.to_string(),
        };
    }
    WardenError::ServerError { status, message }
}

fn refine(err: WardenError, model: &str) -> WardenError {
    match err {
        WardenError::ServerError { status, message } => classify_status(status, &message, model),
        other => other,
    }
}

/// Dropping the stream on return closes the connection, which stops the
/// server generating for nobody.
fn consumer_closed(model: &str, mut report: BatchReport, rejected: Option<String>) -> StreamOutcome {
    if let Some(text) = rejected {
        report.undelivered.push_str(&text);
    }
    tracing::debug!(model, undelivered = report.undelivered.len(), "consumer closed, ending stream");
    StreamOutcome::ConsumerClosed(report)
}

pub struct GenerationClient {
    transport: Transport,
    orchestrator: Arc<AvailabilityOrchestrator>,
    options: GenerationOptions,
    stream_timeout: Duration,
}

impl GenerationClient {
    pub fn new(transport: Transport, orchestrator: Arc<AvailabilityOrchestrator>, config: &Config) -> Self {
        Self {
            transport,
            orchestrator,
            options: GenerationOptions::from_config(config),
            stream_timeout: config.request_timeout(),
        }
    }

    pub fn options(&self) -> &GenerationOptions {
        &self.options
    }

    /// Stream options using the configured hard timeout.
    pub fn default_stream_options(&self) -> StreamOptions {
        StreamOptions::with_timeout(self.stream_timeout)
    }

    async fn require_available(&self, model: Option<&str>) -> Result<(), WardenError> {
        match self.orchestrator.ensure_available(model).await? {
            Availability::Ready(status) if status.is_missing_model() => Err(WardenError::ModelNotFound {
                model: model.unwrap_or_default().to_string(),
            }),
            Availability::Ready(_) => Ok(()),
            Availability::Unavailable(reason) => Err(WardenError::Unavailable(reason)),
        }
    }

    /// Non-streaming generation, bounded by [`ONE_SHOT_TIMEOUT`].
    pub async fn generate_once(&self, model: &str, prompt: &str) -> Result<String, WardenError> {
        self.require_available(Some(model)).await?;

        let body = GenerationRequest::new(model, prompt, false, self.options.clone());
        let opts = RequestOptions::with_timeout(ONE_SHOT_TIMEOUT);

        let resp = self.transport.post_json(GENERATE_PATH, &body, &opts).await?;
        if !resp.is_success() {
            return Err(classify_status(resp.status, &resp.text_lossy(), model));
        }

        let parsed: OneShotResponse = serde_json::from_slice(&resp.body)
            .map_err(|e| WardenError::MalformedResponse(format!("generate response: {e}")))?;
        if let Some(error) = parsed.error {
            return Err(WardenError::ServerError {
                status: resp.status,
                message: error,
            });
        }
        Ok(parsed.response)
    }

    /// Streaming generation. Text deltas go through a [`ChunkBatcher`] to
    /// `sink`; cancelling `cancel` ends the request silently.
    pub async fn generate_stream<S: ChunkSink>(
        &self,
        model: &str,
        prompt: &str,
        sink: S,
        cancel: &CancellationToken,
        opts: &StreamOptions,
    ) -> Result<StreamOutcome, WardenError> {
        if cancel.is_cancelled() {
            return Ok(StreamOutcome::Cancelled);
        }
        self.require_available(Some(model)).await?;

        let body = GenerationRequest::new(model, prompt, true, self.options.clone());
        let batcher = ChunkBatcher::spawn(opts.batcher.clone(), sink, cancel);

        // Both timers cover the wait for headers: the server sends none until
        // the model is loaded.
        let hard = tokio::time::sleep(opts.timeout);
        tokio::pin!(hard);
        let soft = tokio::time::sleep(opts.timeout.mul_f64(SOFT_TIMEOUT_RATIO));
        tokio::pin!(soft);
        let mut soft_fired = false;

        let connect_opts = RequestOptions::with_timeout(opts.timeout).cancel_on(cancel.clone());
        let open = self.transport.post_ndjson(GENERATE_PATH, &body, &connect_opts);
        tokio::pin!(open);
        let opened = loop {
            tokio::select! {
                biased;
                _ = &mut hard => {
                    tracing::warn!(model, timeout_secs = opts.timeout.as_secs(), "no response before hard timeout");
                    batcher.push_status(timeout_notice(opts.timeout));
                    return Ok(StreamOutcome::TimedOut(batcher.finish().await));
                }
                _ = &mut soft, if !soft_fired => {
                    soft_fired = true;
                    if !batcher.push_status(SLOW_GENERATION_NOTICE) {
                        return Ok(consumer_closed(model, batcher.finish().await, None));
                    }
                }
                result = &mut open => break result,
            }
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(WardenError::Cancelled) => {
                batcher.abort().await;
                return Ok(StreamOutcome::Cancelled);
            }
            Err(e) => {
                batcher.abort().await;
                return Err(refine(e, model));
            }
        };

        tracing::debug!(model, "generation stream opened");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!(model, "generation cancelled");
                    batcher.abort().await;
                    return Ok(StreamOutcome::Cancelled);
                }
                _ = &mut hard => {
                    tracing::warn!(model, timeout_secs = opts.timeout.as_secs(), "generation hit hard timeout");
                    batcher.push_status(timeout_notice(opts.timeout));
                    return Ok(StreamOutcome::TimedOut(batcher.finish().await));
                }
                _ = &mut soft, if !soft_fired => {
                    soft_fired = true;
                    if !batcher.push_status(SLOW_GENERATION_NOTICE) {
                        return Ok(consumer_closed(model, batcher.finish().await, None));
                    }
                }
                line = stream.next_line() => {
                    // Output read after cancellation is discarded.
                    if cancel.is_cancelled() {
                        batcher.abort().await;
                        return Ok(StreamOutcome::Cancelled);
                    }
                    let line = match line {
                        None => {
                            tracing::debug!(model, "stream ended without done marker");
                            return Ok(StreamOutcome::Completed(batcher.finish().await));
                        }
                        Some(Ok(line)) => line,
                        Some(Err(e)) => {
                            let message = e.user_message();
                            tracing::warn!(model, "generation stream failed: {e}");
                            batcher.push_status(failure_notice(&message));
                            let report = batcher.finish().await;
                            return Ok(StreamOutcome::Failed { message, report });
                        }
                    };

                    let chunk: StreamChunk = match serde_json::from_str(&line) {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            tracing::warn!(model, "skipping unparsable stream line: {e}");
                            continue;
                        }
                    };

                    if let Some(message) = chunk.error {
                        tracing::warn!(model, "server reported error mid-stream: {message}");
                        batcher.push_status(failure_notice(&message));
                        let report = batcher.finish().await;
                        return Ok(StreamOutcome::Failed { message, report });
                    }
                    if let Some(text) = chunk.response_text
                        && let Err(text) = batcher.try_push(text)
                    {
                        return Ok(consumer_closed(model, batcher.finish().await, Some(text)));
                    }
                    if chunk.done {
                        tracing::debug!(model, reason = ?chunk.done_reason, tokens = ?chunk.eval_count, "generation done");
                        return Ok(StreamOutcome::Completed(batcher.finish().await));
                    }
                }
            }
        }
    }

    /// Download a model, forwarding progress events. Progress delivery is
    /// best-effort: events are dropped if `progress` is full.
    pub async fn pull_model(
        &self,
        model: &str,
        progress: mpsc::Sender<PullProgress>,
        cancel: &CancellationToken,
    ) -> Result<PullOutcome, WardenError> {
        self.require_available(None).await?;

        let body = serde_json::json!({ "model": model, "stream": true });
        let opts = RequestOptions::with_timeout(PULL_CONNECT_TIMEOUT).cancel_on(cancel.clone());
        let mut stream = match self.transport.post_ndjson(PULL_PATH, &body, &opts).await {
            Ok(s) => s,
            Err(WardenError::Cancelled) => return Ok(PullOutcome::Cancelled),
            Err(e) => return Err(refine(e, model)),
        };

        loop {
            let line = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(PullOutcome::Cancelled),
                line = stream.next_line() => line,
            };
            let line = match line {
                None => {
                    return Err(WardenError::MalformedResponse(
                        "pull stream ended before success".to_string(),
                    ));
                }
                Some(line) => line?,
            };
            let event: PullLine = match serde_json::from_str(&line) {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!(model, "skipping unparsable pull line: {e}");
                    continue;
                }
            };
            if let Some(message) = event.error {
                tracing::warn!(model, "pull failed: {message}");
                return Err(WardenError::ServerError { status: 200, message });
            }
            if let Some(p) = event.progress {
                let done = p.status == "success";
                let _ = progress.try_send(p);
                if done {
                    tracing::info!(model, "model pulled");
                    self.orchestrator.monitor().invalidate();
                    return Ok(PullOutcome::Completed);
                }
            }
        }
    }
}
