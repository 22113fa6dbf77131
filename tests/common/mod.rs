//! Raw-socket mock of the inference server's HTTP surface.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use warden::config::Config;
use warden::generation::GenerationClient;
use warden::health::{HealthCheckOptions, HealthMonitor};
use warden::orchestrator::AvailabilityOrchestrator;
use warden::supervisor::{ProcessSupervisor, StaticLocator};
use warden::transport::Transport;

#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub body: String,
}

impl Request {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body).unwrap()
    }
}

pub enum Reply {
    Json(u16, String),
    /// NDJSON lines, each written after its delay in ms, then the connection closes.
    Ndjson(Vec<(u64, String)>),
    /// Like `Ndjson` but the connection stays open until the client leaves.
    NdjsonHang(Vec<(u64, String)>),
    /// Sends no headers for this many ms, then streams the lines.
    Stall(u64, Vec<(u64, String)>),
}

type Handler = dyn Fn(&Request, usize) -> Reply + Send + Sync;

/// Accepts connections until dropped. The handler gets the request and how
/// many earlier requests hit the same path.
pub struct MockServer {
    pub url: String,
    pub port: u16,
    requests: Arc<Mutex<Vec<Request>>>,
    task: JoinHandle<()>,
}

impl MockServer {
    pub async fn start(handler: impl Fn(&Request, usize) -> Reply + Send + Sync + 'static) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self::serve(listener, handler)
    }

    pub fn serve(
        listener: TcpListener,
        handler: impl Fn(&Request, usize) -> Reply + Send + Sync + 'static,
    ) -> Self {
        let port = listener.local_addr().unwrap().port();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let handler: Arc<Handler> = Arc::new(handler);
        let task = {
            let requests = requests.clone();
            tokio::spawn(async move {
                while let Ok((socket, _)) = listener.accept().await {
                    let handler = handler.clone();
                    let requests = requests.clone();
                    tokio::spawn(async move { handle(socket, handler, requests).await });
                }
            })
        };
        Self {
            url: format!("http://127.0.0.1:{port}"),
            port,
            requests,
            task,
        }
    }

    pub fn hits(&self, path: &str) -> usize {
        self.requests.lock().unwrap().iter().filter(|r| r.path == path).count()
    }

    pub fn requests(&self, path: &str) -> Vec<Request> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.path == path)
            .cloned()
            .collect()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn handle(mut socket: TcpStream, handler: Arc<Handler>, requests: Arc<Mutex<Vec<Request>>>) {
    let Some(req) = read_request(&mut socket).await else {
        return;
    };
    let index = {
        let mut log = requests.lock().unwrap();
        let n = log.iter().filter(|r| r.path == req.path).count();
        log.push(req.clone());
        n
    };

    match handler(&req, index) {
        Reply::Json(status, body) => {
            let head = format!(
                "HTTP/1.1 {status} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                reason(status),
                body.len()
            );
            let _ = socket.write_all(head.as_bytes()).await;
            let _ = socket.write_all(body.as_bytes()).await;
        }
        Reply::Ndjson(lines) => {
            write_lines(&mut socket, lines).await;
        }
        Reply::Stall(delay_ms, lines) => {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            write_lines(&mut socket, lines).await;
        }
        Reply::NdjsonHang(lines) => {
            write_lines(&mut socket, lines).await;
            let mut buf = [0u8; 64];
            while let Ok(n) = socket.read(&mut buf).await {
                if n == 0 {
                    break;
                }
            }
        }
    }
    let _ = socket.shutdown().await;
}

async fn write_lines(socket: &mut TcpStream, lines: Vec<(u64, String)>) {
    let head = "HTTP/1.1 200 OK\r\nContent-Type: application/x-ndjson\r\nConnection: close\r\n\r\n";
    if socket.write_all(head.as_bytes()).await.is_err() {
        return;
    }
    for (delay_ms, line) in lines {
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        if socket.write_all(format!("{line}\n").as_bytes()).await.is_err() {
            return;
        }
        let _ = socket.flush().await;
    }
}

async fn read_request(socket: &mut TcpStream) -> Option<Request> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut parts = head.lines().next()?.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();
    let content_length = head
        .lines()
        .filter_map(|l| l.split_once(':'))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.trim().parse::<usize>().ok())
        .unwrap_or(0);

    while buf.len() < header_end + content_length {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let body = String::from_utf8_lossy(&buf[header_end..]).to_string();
    Some(Request { method, path, body })
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        404 => "Not Found",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

pub fn tags_json(names: &[&str]) -> String {
    let models: Vec<_> = names
        .iter()
        .map(|n| serde_json::json!({"name": n, "size": 1_000_000, "modified_at": "2024-05-01T10:00:00Z"}))
        .collect();
    serde_json::json!({ "models": models }).to_string()
}

pub fn chunk(text: &str) -> String {
    serde_json::json!({"model": "llama3", "response": text, "done": false}).to_string()
}

pub fn done() -> String {
    serde_json::json!({"model": "llama3", "response": "", "done": true, "done_reason": "stop"}).to_string()
}

/// A healthy server with `llama3:latest`, delegating `/api/generate` and
/// `/api/pull` to `on_call`.
pub async fn ollama(on_call: impl Fn(&Request, usize) -> Reply + Send + Sync + 'static) -> MockServer {
    MockServer::start(move |req, index| {
        if req.path == "/api/tags" {
            Reply::Json(200, tags_json(&["llama3:latest"]))
        } else {
            on_call(req, index)
        }
    })
    .await
}

/// A URL nothing listens on.
pub fn closed_port_url() -> (String, u16) {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    (format!("http://127.0.0.1:{port}"), port)
}

pub fn fast_checks() -> HealthCheckOptions {
    HealthCheckOptions {
        retry: true,
        retry_count: 2,
        retry_delay: Duration::from_millis(10),
        bypass_cache: false,
    }
}

/// Generation client whose orchestrator never auto-starts.
pub fn generation_client(url: &str) -> GenerationClient {
    let transport = Transport::new(url).unwrap();
    let monitor = std::sync::Arc::new(HealthMonitor::new(transport.clone()));
    let supervisor = std::sync::Arc::new(
        ProcessSupervisor::new(transport.clone(), "ollama").with_locator(StaticLocator(None)),
    );
    let orchestrator = std::sync::Arc::new(
        AvailabilityOrchestrator::new(monitor, supervisor, false).with_check_options(fast_checks()),
    );
    let config = Config {
        api_url: url.to_string(),
        ..Config::default()
    };
    GenerationClient::new(transport, orchestrator, &config)
}

/// Drain whatever the consumer side holds once the sender is gone.
pub async fn collect(mut rx: tokio::sync::mpsc::UnboundedReceiver<String>) -> Vec<String> {
    let mut out = Vec::new();
    while let Some(batch) = rx.recv().await {
        out.push(batch);
    }
    out
}
