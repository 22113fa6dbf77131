use schemars::JsonSchema;
use serde::Deserialize;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct GenerateRequest {
    /// The prompt to send. Prompts over 8000 characters are truncated with a marker.
    pub prompt: String,
    /// Installed model name, e.g. "llama3.2" or "llama3:8b". Defaults to the configured model.
    pub model: Option<String>,
    /// Caller-chosen id for `cancel`. Reusing the id of a running request cancels that request.
    pub request_id: Option<String>,
    /// Stream through the batching pipeline (default true). `false` makes one bounded 30s call.
    pub stream: Option<bool>,
}

impl GenerateRequest {
    pub fn model(&self) -> Option<&str> {
        self.model.as_deref().filter(|m| !m.trim().is_empty())
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref().filter(|id| !id.trim().is_empty())
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CancelRequest {
    /// The `request_id` passed to `generate`.
    pub request_id: String,
}
