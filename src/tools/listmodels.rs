use serde::Serialize;

use crate::health::ServerModel;

#[derive(Serialize)]
pub struct ModelInfo {
    pub name: String,
    pub size_bytes: i64,
    pub modified_at: Option<String>,
}

impl From<&ServerModel> for ModelInfo {
    fn from(m: &ServerModel) -> Self {
        Self {
            name: m.name.clone(),
            size_bytes: m.size_bytes,
            modified_at: m.modified_at.clone(),
        }
    }
}

#[derive(Serialize)]
pub struct ListModelsResponse {
    pub models: Vec<ModelInfo>,
}

fn human_size(bytes: i64) -> String {
    const GB: f64 = 1024.0 * 1024.0 * 1024.0;
    const MB: f64 = 1024.0 * 1024.0;
    let b = bytes.max(0) as f64;
    if b >= GB {
        format!("{:.1} GB", b / GB)
    } else {
        format!("{:.0} MB", b / MB)
    }
}

impl ListModelsResponse {
    pub fn to_markdown(&self) -> String {
        if self.models.is_empty() {
            return "No models installed. Run `ollama pull <model>` or use the `pull` tool.".to_string();
        }
        let mut out = String::from("| Model | Size | Modified |\n|---|---|---|\n");
        for m in &self.models {
            out.push_str(&format!(
                "| {} | {} | {} |\n",
                m.name,
                human_size(m.size_bytes),
                m.modified_at.as_deref().unwrap_or("-"),
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markdown_lists_each_model() {
        let list = ListModelsResponse {
            models: vec![ModelInfo {
                name: "llama3:latest".to_string(),
                size_bytes: 4_661_224_676,
                modified_at: None,
            }],
        };
        let md = list.to_markdown();
        assert!(md.contains("| llama3:latest | 4.3 GB | - |"), "{md}");
    }

    #[test]
    fn empty_list_suggests_pull() {
        let md = ListModelsResponse { models: vec![] }.to_markdown();
        assert!(md.contains("ollama pull"));
    }
}
