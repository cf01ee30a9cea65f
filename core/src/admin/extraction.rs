//! Free-text task/event extraction: submit an extraction prompt to the
//! LLM queue, parse its JSON reply, and persist whatever survives.

use std::sync::Arc;

use serde::Deserialize;
use tracing::warn;

use crate::admin::prompts::extraction_prompt;
use crate::llm::{ChatRequest, LlmQueue, PRIORITY_ADMIN};
use crate::storage::events::Frequency;
use crate::storage::Storage;

#[derive(Debug, Default, Deserialize)]
pub struct ExtractedTask {
    pub title: String,
    pub due_date: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ExtractedEvent {
    pub title: String,
    pub start_time: String,
    pub end_time: Option<String>,
    pub frequency: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ExtractedItems {
    #[serde(default)]
    pub tasks: Vec<ExtractedTask>,
    #[serde(default)]
    pub events: Vec<ExtractedEvent>,
}

/// Strip a leading ` ```json ` / trailing ` ``` ` code fence, if present.
fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let without_lead = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_lead.strip_suffix("```").unwrap_or(without_lead).trim()
}

/// Submit an extraction prompt at ADMIN priority; any failure (LLM error
/// or JSON parse failure) yields empty lists rather than propagating.
pub async fn extract_items(text: &str, llm: &Arc<LlmQueue>) -> ExtractedItems {
    let request = ChatRequest {
        prompt: extraction_prompt(text),
        temperature: 0.1,
        command: Some("extract".to_string()),
        ..ChatRequest::new(String::new())
    };
    let reply = match llm.submit(request, PRIORITY_ADMIN).await {
        Ok(reply) => reply,
        Err(e) => {
            warn!(error = %e, "extraction llm call failed");
            return ExtractedItems::default();
        }
    };
    match serde_json::from_str::<ExtractedItems>(strip_code_fences(&reply)) {
        Ok(items) => items,
        Err(e) => {
            warn!(error = %e, "extraction response was not valid json");
            ExtractedItems::default()
        }
    }
}

/// Create tasks and events via the stores, returning a human-readable
/// summary line per item created.
pub fn apply_extracted_items(items: &ExtractedItems, storage: &Storage) -> Vec<String> {
    let mut summaries = Vec::new();
    let tasks = storage.tasks();
    for task in &items.tasks {
        if task.title.trim().is_empty() {
            continue;
        }
        match tasks.create(&task.title, task.due_date.as_deref()) {
            Ok(id) => {
                let mut line = format!("Created task #{id}: {}", task.title);
                if let Some(due) = &task.due_date {
                    line.push_str(&format!(" (due {due})"));
                }
                summaries.push(line);
            }
            Err(e) => warn!(error = %e, "failed to create extracted task"),
        }
    }

    let events = storage.events();
    for event in &items.events {
        if event.title.trim().is_empty() || event.start_time.trim().is_empty() {
            continue;
        }
        let frequency = event.frequency.as_deref().and_then(|f| match f {
            "daily" => Some(Frequency::Daily),
            "weekly" => Some(Frequency::Weekly),
            "monthly" => Some(Frequency::Monthly),
            "yearly" => Some(Frequency::Yearly),
            _ => None,
        });
        match events.create(
            &event.title,
            &event.start_time,
            event.end_time.as_deref(),
            None,
            None,
            frequency,
            1,
            None,
        ) {
            Ok(id) => {
                let mut line = format!("Created event #{id}: {} at {}", event.title, event.start_time);
                if let Some(freq) = &event.frequency {
                    line.push_str(&format!(" ({freq})"));
                }
                summaries.push(line);
            }
            Err(e) => warn!(error = %e, "failed to create extracted event"),
        }
    }

    summaries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_code_fences_removes_json_fence() {
        let fenced = "```json\n{\"tasks\": []}\n```";
        assert_eq!(strip_code_fences(fenced), "{\"tasks\": []}");
    }

    #[test]
    fn strip_code_fences_is_noop_without_fence() {
        assert_eq!(strip_code_fences("{\"tasks\": []}"), "{\"tasks\": []}");
    }

    #[test]
    fn apply_extracted_items_skips_blank_titles() {
        let dir = tempfile::tempdir().unwrap();
        let paths = crate::config::Paths::new(dir.path());
        let storage = Storage::open_in_memory(&paths).unwrap();
        let items = ExtractedItems {
            tasks: vec![ExtractedTask { title: "".to_string(), due_date: None }],
            events: vec![],
        };
        let summaries = apply_extracted_items(&items, &storage);
        assert!(summaries.is_empty());
    }

    #[test]
    fn apply_extracted_items_creates_and_summarizes() {
        let dir = tempfile::tempdir().unwrap();
        let paths = crate::config::Paths::new(dir.path());
        let storage = Storage::open_in_memory(&paths).unwrap();
        let items = ExtractedItems {
            tasks: vec![ExtractedTask { title: "Buy milk".to_string(), due_date: Some("2099-01-01".to_string()) }],
            events: vec![],
        };
        let summaries = apply_extracted_items(&items, &storage);
        assert_eq!(summaries.len(), 1);
        assert!(summaries[0].contains("Buy milk"));
        assert!(summaries[0].contains("2099-01-01"));
    }
}
