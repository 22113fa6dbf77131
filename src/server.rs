use std::sync::Arc;
use std::time::Instant;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{
    CallToolResult, Implementation, ProgressNotificationParam, ProgressToken, ServerCapabilities,
    ServerInfo,
};
use rmcp::service::RequestContext;
use rmcp::{ErrorData as McpError, RoleServer, ServerHandler, tool, tool_handler, tool_router};
use tokio::sync::mpsc;

use crate::error::WardenError;
use crate::generation::{PullOutcome, StreamOutcome};
use crate::response::{ToolMetadata, ToolResponse};
use crate::service::Warden;
use crate::supervisor::StartOutcome;
use crate::tools::generate::{CancelRequest, GenerateRequest};
use crate::tools::listmodels::{ListModelsResponse, ModelInfo};
use crate::tools::pull::{self, PullRequest};
use crate::tools::status::StatusRequest;

/// Pull progress events buffered between the stream and the collector.
const PULL_PROGRESS_BUFFER: usize = 256;

#[derive(Clone)]
pub struct WardenServer {
    warden: Arc<Warden>,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl WardenServer {
    pub fn new(warden: Warden) -> Self {
        Self {
            warden: Arc::new(warden),
            tool_router: Self::tool_router(),
        }
    }

    pub fn warden(&self) -> &Arc<Warden> {
        &self.warden
    }

    #[tool(
        name = "generate",
        description = "Generate text with a local model. Starts the local server if it is installed but not running. Pass `request_id` to make the call cancellable with `cancel`. With a progress token, batched output is sent as progress notifications while it streams.",
        annotations(read_only_hint = true)
    )]
    async fn generate(
        &self,
        Parameters(req): Parameters<GenerateRequest>,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        if req.prompt.trim().is_empty() {
            return Err(McpError::invalid_params("prompt must not be empty", None));
        }

        let start = Instant::now();
        let model = req
            .model()
            .unwrap_or(self.warden.config().default_model.as_str())
            .to_string();
        let request_id = req.request_id().map(str::to_string);
        let metadata = |start: Instant| {
            ToolMetadata::new("generate", start.elapsed().as_secs_f64())
                .with_model(model.clone())
                .with_request_id(request_id.clone())
        };

        if req.stream == Some(false) {
            let response = match self.warden.generate_once(Some(model.as_str()), &req.prompt).await {
                Ok(text) => ToolResponse::success(text, metadata(start)),
                Err(e) => {
                    tracing::warn!(model = %model, "generate failed: {e}");
                    ToolResponse::error(e.user_message(), metadata(start))
                }
            };
            return Ok(response.into_call_tool_result());
        }

        let (tx, rx) = mpsc::unbounded_channel::<String>();
        let (result, delivered) = tokio::join!(
            self.warden
                .generate(request_id.as_deref(), Some(model.as_str()), &req.prompt, tx),
            forward_batches(rx, &context)
        );

        let response = match result {
            Ok(StreamOutcome::Completed(_)) => ToolResponse::success(delivered, metadata(start)),
            Ok(StreamOutcome::Cancelled) => ToolResponse::cancelled(delivered, metadata(start)),
            Ok(StreamOutcome::TimedOut(_)) | Ok(StreamOutcome::Failed { .. }) => {
                ToolResponse::error(delivered, metadata(start))
            }
            // Our own receiver outlives the stream, so this only happens if
            // the forwarder died; hand back what it missed.
            Ok(StreamOutcome::ConsumerClosed(report)) => {
                ToolResponse::error(format!("{delivered}{}", report.undelivered), metadata(start))
            }
            Err(e) => {
                tracing::warn!(model = %model, "generate failed: {e}");
                ToolResponse::error(e.user_message(), metadata(start))
            }
        };
        Ok(response.into_call_tool_result())
    }

    #[tool(
        name = "cancel",
        description = "Cancel a running `generate` call by its request_id. Partial output is returned by the cancelled call.",
        annotations(idempotent_hint = true)
    )]
    async fn cancel(
        &self,
        Parameters(req): Parameters<CancelRequest>,
    ) -> Result<CallToolResult, McpError> {
        let content = if self.warden.cancel(&req.request_id) {
            format!("cancelled request {}", req.request_id)
        } else {
            format!("no live request with id {}", req.request_id)
        };
        let metadata = ToolMetadata::new("cancel", 0.0).with_request_id(Some(req.request_id));
        Ok(ToolResponse::success(content, metadata).into_call_tool_result())
    }

    #[tool(
        name = "status",
        description = "Report local server health, model presence, background poll state, and live requests.",
        annotations(read_only_hint = true)
    )]
    async fn status(
        &self,
        Parameters(req): Parameters<StatusRequest>,
    ) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let model = req.model.as_deref().filter(|m| !m.trim().is_empty());
        let status = self.warden.status(model).await;
        let json = serde_json::to_string_pretty(&status)
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;

        let mut metadata = ToolMetadata::new("status", start.elapsed().as_secs_f64());
        if let Some(m) = model {
            metadata = metadata.with_model(m);
        }
        Ok(ToolResponse::json(json, metadata).into_call_tool_result())
    }

    #[tool(
        name = "listmodels",
        description = "List models installed on the local server with size and modification time.",
        annotations(read_only_hint = true)
    )]
    async fn listmodels(&self) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let response = match self.warden.list_models(false).await {
            Ok(models) => {
                let mut models: Vec<ModelInfo> = models.iter().map(ModelInfo::from).collect();
                models.sort_by(|a, b| a.name.cmp(&b.name));
                ToolResponse::success(
                    ListModelsResponse { models }.to_markdown(),
                    ToolMetadata::new("listmodels", start.elapsed().as_secs_f64()),
                )
            }
            Err(e) => ToolResponse::error(
                e.user_message(),
                ToolMetadata::new("listmodels", start.elapsed().as_secs_f64()),
            ),
        };
        Ok(response.into_call_tool_result())
    }

    #[tool(
        name = "start_server",
        description = "Start the local inference server if it is installed and not already running."
    )]
    async fn start_server(&self) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let metadata = || ToolMetadata::new("start_server", start.elapsed().as_secs_f64());
        let response = match self.warden.start_server().await {
            Ok(StartOutcome::AlreadyRunning) => {
                ToolResponse::success("server already running".to_string(), metadata())
            }
            Ok(StartOutcome::Started { pid, attempt }) => ToolResponse::success(
                format!(
                    "server started (pid {}), healthy after {attempt} check(s)",
                    display_pid(pid)
                ),
                metadata(),
            ),
            Ok(StartOutcome::Unverified { pid, detail }) => ToolResponse::error(
                format!(
                    "server spawned (pid {}) but not yet healthy: {detail}",
                    display_pid(pid)
                ),
                metadata(),
            ),
            Err(e) => ToolResponse::error(e.user_message(), metadata()),
        };
        Ok(response.into_call_tool_result())
    }

    #[tool(
        name = "pull",
        description = "Download a model to the local server. Blocks until the download completes."
    )]
    async fn pull(
        &self,
        Parameters(req): Parameters<PullRequest>,
    ) -> Result<CallToolResult, McpError> {
        if req.model.trim().is_empty() {
            return Err(McpError::invalid_params("model must not be empty", None));
        }
        let start = Instant::now();
        let (tx, mut rx) = mpsc::channel(PULL_PROGRESS_BUFFER);
        let collect = async {
            let mut events = Vec::new();
            while let Some(event) = rx.recv().await {
                events.push(event);
            }
            events
        };
        let (result, events) = tokio::join!(self.warden.pull(&req.model, tx), collect);
        let summary = pull::summarize(&events);
        let metadata = ToolMetadata::new("pull", start.elapsed().as_secs_f64()).with_model(req.model.clone());

        let response = match result {
            Ok(PullOutcome::Completed) => ToolResponse::success(summary, metadata),
            Ok(PullOutcome::Cancelled) => ToolResponse::cancelled(summary, metadata),
            Err(e @ WardenError::ServerError { .. }) => {
                tracing::warn!(model = %req.model, "pull failed: {e}");
                ToolResponse::error(format!("{summary}\nError: {}", e.user_message()), metadata)
            }
            Err(e) => ToolResponse::error(e.user_message(), metadata),
        };
        Ok(response.into_call_tool_result())
    }
}

fn display_pid(pid: Option<u32>) -> String {
    pid.map_or_else(|| "unknown".to_string(), |p| p.to_string())
}

/// The batch text rides in `message`; `progress` counts batches.
fn batch_progress(token: &ProgressToken, batches: u32, batch: &str) -> ProgressNotificationParam {
    ProgressNotificationParam {
        progress_token: token.clone(),
        progress: f64::from(batches),
        total: None,
        message: Some(batch.to_string()),
    }
}

/// Collect batches until the stream's sink is dropped. If the caller sent a
/// progress token, each batch also goes out as a progress notification.
async fn forward_batches(
    mut rx: mpsc::UnboundedReceiver<String>,
    context: &RequestContext<RoleServer>,
) -> String {
    let progress_token = context.meta.get_progress_token();
    let mut delivered = String::new();
    let mut batches = 0u32;
    while let Some(batch) = rx.recv().await {
        batches += 1;
        if let Some(token) = &progress_token {
            let param = batch_progress(token, batches, &batch);
            if let Err(e) = context.peer.notify_progress(param).await {
                tracing::debug!("progress notification failed: {e}");
            }
        }
        delivered.push_str(&batch);
    }
    delivered
}

#[tool_handler]
impl ServerHandler for WardenServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            server_info: Implementation {
                name: "warden".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            instructions: Some(
                "Warden: local LLM inference with automatic server management.\n\n\
                 1. `status` shows whether the local server is up and which model is checked.\n\
                 2. `listmodels` for installed model names; `pull` to download one.\n\
                 3. `generate` runs a prompt. Set `request_id` to cancel it later with `cancel`.\n\
                 Text starting and ending with `_` is a status line; text containing `Error:` marks a failed request."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}
