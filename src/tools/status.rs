use schemars::JsonSchema;
use serde::Deserialize;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct StatusRequest {
    /// Also report whether this model is installed.
    pub model: Option<String>,
}
