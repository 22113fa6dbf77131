//! Thin HTTP primitives over `reqwest`: bounded GET/POST and an NDJSON line
//! stream. No retry or availability policy lives here.

use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use reqwest::Client;
use tokio_util::sync::CancellationToken;

use crate::error::WardenError;

/// Cap on buffered (non-streaming) response bodies.
pub const MAX_RESPONSE_BYTES: usize = 2 * 1024 * 1024; // 2MB

/// Cap on a single NDJSON line. A line this long without a newline is not
/// something the server sends; treat it as malformed rather than buffering forever.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Per-call knobs.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub timeout: Duration,
    pub headers: Vec<(String, String)>,
    /// Aborts the call when cancelled. Surfaces as `WardenError::Cancelled`.
    pub cancel: Option<CancellationToken>,
}

impl RequestOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            headers: Vec::new(),
            cancel: None,
        }
    }

    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Buffered response.
#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Clone)]
pub struct Transport {
    client: Client,
    base_url: String,
}

impl Transport {
    pub fn new(base_url: impl Into<String>) -> Result<Self, WardenError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(4)
            .build()
            .map_err(|e| WardenError::UnexpectedFailure(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn get(&self, path: &str, opts: &RequestOptions) -> Result<HttpResponse, WardenError> {
        let url = self.url(path);
        let mut req = self.client.get(&url).timeout(opts.timeout);
        for (k, v) in &opts.headers {
            req = req.header(k, v);
        }
        self.execute(req, &url, opts).await
    }

    pub async fn post_json<B: serde::Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
        opts: &RequestOptions,
    ) -> Result<HttpResponse, WardenError> {
        let url = self.url(path);
        let mut req = self.client.post(&url).timeout(opts.timeout).json(body);
        for (k, v) in &opts.headers {
            req = req.header(k, v);
        }
        self.execute(req, &url, opts).await
    }

    /// Open a streaming POST. `opts.timeout` bounds only the wait for response
    /// headers; the body is read for as long as the caller keeps pulling lines.
    pub async fn post_ndjson<B: serde::Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
        opts: &RequestOptions,
    ) -> Result<NdjsonStream, WardenError> {
        let url = self.url(path);
        let mut req = self.client.post(&url).json(body);
        for (k, v) in &opts.headers {
            req = req.header(k, v);
        }

        let timeout_ms = opts.timeout.as_millis() as u64;
        let send = async {
            match tokio::time::timeout(opts.timeout, req.send()).await {
                Ok(result) => result.map_err(|e| WardenError::from_reqwest(e, &url, timeout_ms)),
                Err(_) => Err(WardenError::ConnectionTimeout(timeout_ms)),
            }
        };
        let response = with_cancel(send, opts.cancel.as_ref()).await?;

        let status = response.status();
        if !status.is_success() {
            let message = read_capped(response).await.unwrap_or_default();
            return Err(WardenError::ServerError {
                status: status.as_u16(),
                message: String::from_utf8_lossy(&message).trim().to_string(),
            });
        }

        Ok(NdjsonStream {
            inner: response
                .bytes_stream()
                .map(|chunk| chunk.map(|b| b.to_vec()))
                .boxed(),
            decoder: LineDecoder::default(),
            url,
            ended: false,
        })
    }

    async fn execute(
        &self,
        req: reqwest::RequestBuilder,
        url: &str,
        opts: &RequestOptions,
    ) -> Result<HttpResponse, WardenError> {
        let timeout_ms = opts.timeout.as_millis() as u64;
        let call = async {
            let response = req
                .send()
                .await
                .map_err(|e| WardenError::from_reqwest(e, url, timeout_ms))?;
            let status = response.status().as_u16();
            let body = read_capped(response)
                .await
                .map_err(|e| WardenError::from_reqwest(e, url, timeout_ms))?;
            if body.len() > MAX_RESPONSE_BYTES {
                return Err(WardenError::MalformedResponse(format!(
                    "response too large: {} bytes (max {MAX_RESPONSE_BYTES})",
                    body.len()
                )));
            }
            Ok(HttpResponse { status, body })
        };
        with_cancel(call, opts.cancel.as_ref()).await
    }
}

/// Read a body but stop accumulating once past the cap (+1 so callers can detect overflow).
async fn read_capped(response: reqwest::Response) -> Result<Vec<u8>, reqwest::Error> {
    let mut stream = response.bytes_stream();
    let mut buf = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        let room = (MAX_RESPONSE_BYTES + 1).saturating_sub(buf.len());
        buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
        if buf.len() > MAX_RESPONSE_BYTES {
            break;
        }
    }
    Ok(buf)
}

async fn with_cancel<T>(
    fut: impl std::future::Future<Output = Result<T, WardenError>>,
    cancel: Option<&CancellationToken>,
) -> Result<T, WardenError> {
    match cancel {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => Err(WardenError::Cancelled),
            result = fut => result,
        },
        None => fut.await,
    }
}

/// Streaming NDJSON body. Yields one raw line at a time; parsing is the
/// caller's job so a bad line can be skipped without ending the stream.
pub struct NdjsonStream {
    inner: BoxStream<'static, Result<Vec<u8>, reqwest::Error>>,
    decoder: LineDecoder,
    url: String,
    ended: bool,
}

impl NdjsonStream {
    /// Next non-empty line, or `None` at end of body.
    ///
    /// Cancel-safe: dropping the future between polls loses no data, since
    /// bytes already read stay in the decoder.
    pub async fn next_line(&mut self) -> Option<Result<String, WardenError>> {
        loop {
            if let Some(line) = self.decoder.next_line() {
                return Some(Ok(line));
            }
            if self.ended {
                return self.decoder.finish().map(Ok);
            }
            match self.inner.next().await {
                Some(Ok(bytes)) => {
                    self.decoder.push(&bytes);
                    if self.decoder.pending_len() > MAX_LINE_BYTES {
                        self.ended = true;
                        self.decoder.clear();
                        return Some(Err(WardenError::MalformedResponse(format!(
                            "stream line exceeds {MAX_LINE_BYTES} bytes"
                        ))));
                    }
                }
                Some(Err(e)) => {
                    self.ended = true;
                    return Some(Err(WardenError::from_reqwest(e, &self.url, 0)));
                }
                None => self.ended = true,
            }
        }
    }
}

/// Splits a byte stream on `\n`. Buffers raw bytes, not `String`, so a UTF-8
/// sequence split across network packets is decoded intact.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buf: Vec<u8>,
}

impl LineDecoder {
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn next_line(&mut self) -> Option<String> {
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            let line = line.trim();
            if !line.is_empty() {
                return Some(line.to_string());
            }
        }
        None
    }

    /// Trailing data after the last newline, if any.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buf);
        let line = String::from_utf8_lossy(&rest).trim().to_string();
        (!line.is_empty()).then_some(line)
    }

    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}
