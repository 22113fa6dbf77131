use schemars::JsonSchema;
use serde::Deserialize;

use crate::generation::PullProgress;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct PullRequest {
    /// Model to download, e.g. "llama3.2".
    pub model: String,
}

/// One line per distinct status, with a percentage when the server sent sizes.
pub fn summarize(events: &[PullProgress]) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut last_status: Option<&str> = None;
    for event in events {
        if last_status == Some(event.status.as_str()) {
            continue;
        }
        last_status = Some(event.status.as_str());
        let line = match (event.completed, event.total) {
            (Some(done), Some(total)) if total > 0 => {
                format!("{} ({}%)", event.status, done.saturating_mul(100) / total)
            }
            _ => event.status.clone(),
        };
        lines.push(line);
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(status: &str, completed: Option<u64>, total: Option<u64>) -> PullProgress {
        PullProgress {
            status: status.to_string(),
            digest: None,
            completed,
            total,
        }
    }

    #[test]
    fn repeated_statuses_collapse() {
        let events = vec![
            event("pulling manifest", None, None),
            event("downloading", Some(10), Some(100)),
            event("downloading", Some(90), Some(100)),
            event("success", None, None),
        ];
        assert_eq!(summarize(&events), "pulling manifest\ndownloading (10%)\nsuccess");
    }
}
