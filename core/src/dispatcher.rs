//! Service dispatcher: translates `service.request` envelopes into
//! calls on the storage stores and LLM queue, replying with
//! `service.response` or `service.error`.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::warn;

use crate::envelope::{Envelope, MSG_SERVICE_ERROR, MSG_SERVICE_RESPONSE};
use crate::llm::{ChatRequest, LlmQueue, PRIORITY_AGENT};
use crate::storage::events::Frequency;
use crate::storage::notes::NoteLogEntry;
use crate::storage::Storage;

pub struct ServiceDispatcher {
    storage: Arc<Storage>,
    llm: Arc<LlmQueue>,
}

impl ServiceDispatcher {
    pub fn new(storage: Arc<Storage>, llm: Arc<LlmQueue>) -> Self {
        ServiceDispatcher { storage, llm }
    }

    pub async fn dispatch(&self, msg: &Envelope) -> Envelope {
        let service = msg.payload.get("service").and_then(|v| v.as_str()).unwrap_or_default();
        let action = msg.payload.get("action").and_then(|v| v.as_str()).unwrap_or_default();
        let params = msg.payload.get("params").cloned().unwrap_or(Value::Object(Default::default()));
        let requester = msg.sender.clone();

        let result = match service {
            "tasks" => self.handle_tasks(action, &params).await,
            "events" => self.handle_events(action, &params).await,
            "articles" => self.handle_articles(action, &params).await,
            "storage" => self.handle_storage(action, &params, &requester).await,
            "settings" => self.handle_settings(action, &params).await,
            "llm" => self.handle_llm(action, &params).await,
            other => Err(format!("unknown service: {other}")),
        };

        match result {
            Ok(value) => {
                let mut payload = BTreeMap::new();
                payload.insert("result".to_string(), value);
                Envelope::reply(msg, "broker", MSG_SERVICE_RESPONSE, payload)
            }
            Err(error) => {
                warn!(service, action, %error, "service dispatch failed");
                let mut payload = BTreeMap::new();
                payload.insert("error".to_string(), Value::String(error));
                Envelope::reply(msg, "broker", MSG_SERVICE_ERROR, payload)
            }
        }
    }

    async fn handle_tasks(&self, action: &str, params: &Value) -> Result<Value, String> {
        let storage = self.storage.clone();
        let action = action.to_string();
        let params = params.clone();
        tokio::task::spawn_blocking(move || {
            let store = storage.tasks();
            match action.as_str() {
                "create" => {
                    let title = str_field(&params, "title")?;
                    let due_date = opt_str_field(&params, "due_date");
                    let id = store.create(&title, due_date.as_deref()).map_err(|e| e.to_string())?;
                    Ok(json!({ "task_id": id }))
                }
                "list" => {
                    let include_done = bool_field(&params, "include_done").unwrap_or(false);
                    let tasks = store.list(include_done).map_err(|e| e.to_string())?;
                    Ok(json!(tasks))
                }
                "get" => {
                    let id = i64_field(&params, "id")?;
                    let task = store.get(id).map_err(|e| e.to_string())?;
                    task.map(|t| json!(t)).ok_or_else(|| format!("no task with id {id}"))
                }
                "update" => {
                    let id = i64_field(&params, "id")?;
                    let title = opt_str_field(&params, "title");
                    let status = opt_str_field(&params, "status")
                        .map(|s| parse_task_status(&s))
                        .transpose()?;
                    let has_due = params.get("due_date").is_some();
                    let due_date = has_due.then(|| opt_str_field(&params, "due_date"));
                    let updated = store
                        .update(id, title.as_deref(), status, due_date.as_ref().map(|d| d.as_deref()))
                        .map_err(|e| e.to_string())?;
                    Ok(json!({ "updated": updated }))
                }
                "delete" => {
                    let id = i64_field(&params, "id")?;
                    let deleted = store.delete(id).map_err(|e| e.to_string())?;
                    Ok(json!({ "deleted": deleted }))
                }
                "upcoming" => {
                    let days = i64_field(&params, "days").unwrap_or(7);
                    let limit = i64_field(&params, "limit").unwrap_or(10);
                    let tasks = store.get_upcoming(days, limit).map_err(|e| e.to_string())?;
                    Ok(json!(tasks))
                }
                other => Err(format!("unknown tasks action: {other}")),
            }
        })
        .await
        .map_err(|e| e.to_string())?
    }

    async fn handle_events(&self, action: &str, params: &Value) -> Result<Value, String> {
        let storage = self.storage.clone();
        let action = action.to_string();
        let params = params.clone();
        tokio::task::spawn_blocking(move || {
            let store = storage.events();
            match action.as_str() {
                "create" => {
                    let title = str_field(&params, "title")?;
                    let start_time = str_field(&params, "start_time")?;
                    let end_time = opt_str_field(&params, "end_time");
                    let location = opt_str_field(&params, "location");
                    let notes = opt_str_field(&params, "notes");
                    let frequency = opt_str_field(&params, "frequency")
                        .map(|f| parse_frequency(&f))
                        .transpose()?;
                    let interval = i64_field(&params, "interval").unwrap_or(1);
                    let end_date = opt_str_field(&params, "end_date");
                    let id = store
                        .create(
                            &title,
                            &start_time,
                            end_time.as_deref(),
                            location.as_deref(),
                            notes.as_deref(),
                            frequency,
                            interval,
                            end_date.as_deref(),
                        )
                        .map_err(|e| e.to_string())?;
                    Ok(json!({ "event_id": id }))
                }
                "list" => Ok(json!(store.list().map_err(|e| e.to_string())?)),
                "get" => {
                    let id = i64_field(&params, "id")?;
                    let event = store.get(id).map_err(|e| e.to_string())?;
                    event.map(|e| json!(e)).ok_or_else(|| format!("no event with id {id}"))
                }
                "update" => {
                    let id = i64_field(&params, "id")?;
                    let title = opt_str_field(&params, "title");
                    let start_time = opt_str_field(&params, "start_time");
                    let end_time = params.get("end_time").is_some().then(|| opt_str_field(&params, "end_time"));
                    let location = params.get("location").is_some().then(|| opt_str_field(&params, "location"));
                    let notes = params.get("notes").is_some().then(|| opt_str_field(&params, "notes"));
                    let updated = store
                        .update(
                            id,
                            title.as_deref(),
                            start_time.as_deref(),
                            end_time.as_ref().map(|e| e.as_deref()),
                            location.as_ref().map(|l| l.as_deref()),
                            notes.as_ref().map(|n| n.as_deref()),
                        )
                        .map_err(|e| e.to_string())?;
                    Ok(json!({ "updated": updated }))
                }
                "delete" => {
                    let id = i64_field(&params, "id")?;
                    Ok(json!({ "deleted": store.delete(id).map_err(|e| e.to_string())? }))
                }
                "upcoming" => {
                    let days = i64_field(&params, "days").unwrap_or(7);
                    let limit = i64_field(&params, "limit").unwrap_or(10);
                    Ok(json!(store.get_upcoming(days, limit).map_err(|e| e.to_string())?))
                }
                other => Err(format!("unknown events action: {other}")),
            }
        })
        .await
        .map_err(|e| e.to_string())?
    }

    async fn handle_articles(&self, action: &str, params: &Value) -> Result<Value, String> {
        let storage = self.storage.clone();
        let action = action.to_string();
        let params = params.clone();
        tokio::task::spawn_blocking(move || {
            let store = storage.articles();
            match action.as_str() {
                "create" => {
                    let title = str_field(&params, "title")?;
                    let authors: Vec<String> = params
                        .get("authors")
                        .and_then(|v| v.as_array())
                        .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
                        .unwrap_or_default();
                    let abstract_text = opt_str_field(&params, "abstract");
                    let year = i64_field(&params, "year").ok();
                    let source_url = opt_str_field(&params, "source_url");
                    let arxiv_id = opt_str_field(&params, "arxiv_id");
                    let s2_id = opt_str_field(&params, "s2_id");
                    let id = store
                        .create(
                            &title,
                            &authors,
                            abstract_text.as_deref(),
                            year,
                            source_url.as_deref(),
                            arxiv_id.as_deref(),
                            s2_id.as_deref(),
                        )
                        .map_err(|e| e.to_string())?;
                    Ok(json!({ "article_id": id }))
                }
                "list" => {
                    let tag = opt_str_field(&params, "tag");
                    Ok(json!(store.list(tag.as_deref()).map_err(|e| e.to_string())?))
                }
                "get" => {
                    let id = i64_field(&params, "id")?;
                    let article = store.get(id).map_err(|e| e.to_string())?;
                    article.map(|a| json!(a)).ok_or_else(|| format!("no article with id {id}"))
                }
                "update" => {
                    let id = i64_field(&params, "id")?;
                    let title = opt_str_field(&params, "title");
                    let authors: Option<Vec<String>> = params.get("authors").and_then(|v| v.as_array()).map(|a| {
                        a.iter().filter_map(|v| v.as_str().map(String::from)).collect()
                    });
                    let abstract_text =
                        params.get("abstract").is_some().then(|| opt_str_field(&params, "abstract"));
                    let updated = store
                        .update(id, title.as_deref(), authors.as_deref(), abstract_text.as_ref().map(|a| a.as_deref()))
                        .map_err(|e| e.to_string())?;
                    Ok(json!({ "updated": updated }))
                }
                "delete" => {
                    let id = i64_field(&params, "id")?;
                    Ok(json!({ "deleted": store.delete(id).map_err(|e| e.to_string())? }))
                }
                "add_tag" => {
                    let id = i64_field(&params, "id")?;
                    let tag = str_field(&params, "tag")?;
                    store.add_tag(id, &tag).map_err(|e| e.to_string())?;
                    Ok(json!({ "ok": true }))
                }
                "remove_tag" => {
                    let id = i64_field(&params, "id")?;
                    let tag = str_field(&params, "tag")?;
                    store.remove_tag(id, &tag).map_err(|e| e.to_string())?;
                    Ok(json!({ "ok": true }))
                }
                "list_tags" => Ok(json!(store.list_tags().map_err(|e| e.to_string())?)),
                other => Err(format!("unknown articles action: {other}")),
            }
        })
        .await
        .map_err(|e| e.to_string())?
    }

    /// Every `storage` action is scoped to the requesting agent's id.
    async fn handle_storage(&self, action: &str, params: &Value, requester: &str) -> Result<Value, String> {
        let storage = self.storage.clone();
        let action = action.to_string();
        let params = params.clone();
        let requester = requester.to_string();
        tokio::task::spawn_blocking(move || {
            let notes = storage.notes_for(&requester);
            match action.as_str() {
                "save_raw_input" => {
                    let text = str_field(&params, "text")?;
                    let source = opt_str_field(&params, "source").unwrap_or_else(|| "agent".to_string());
                    notes.save_raw_input(&text, &source).map_err(|e| e.to_string())?;
                    Ok(json!({ "ok": true }))
                }
                "parse_buffer" => Ok(json!(notes.parse_buffer())),
                "clear_buffer" => {
                    notes.clear_buffer().map_err(|e| e.to_string())?;
                    Ok(json!({ "ok": true }))
                }
                "write_buffer" => {
                    let entries: Vec<NoteLogEntry> = params
                        .get("entries")
                        .cloned()
                        .map(serde_json::from_value)
                        .transpose()
                        .map_err(|e: serde_json::Error| e.to_string())?
                        .unwrap_or_default();
                    notes.write_buffer(&entries).map_err(|e| e.to_string())?;
                    Ok(json!({ "ok": true }))
                }
                "load_topic_index" => Ok(json!(notes.load_topic_index())),
                "add_topic" => {
                    let name = str_field(&params, "name")?;
                    let slug = opt_str_field(&params, "slug")
                        .unwrap_or_else(|| crate::storage::notes::slugify(&name));
                    Ok(json!(notes.add_topic(&name, &slug).map_err(|e| e.to_string())?))
                }
                "find_topic" => {
                    let identifier = str_field(&params, "identifier")?;
                    notes
                        .find_topic(&identifier)
                        .map(|t| json!(t))
                        .ok_or_else(|| format!("no topic matching {identifier}"))
                }
                "load_topic_buffer" => {
                    let slug = str_field(&params, "slug")?;
                    Ok(json!(notes.load_topic_buffer(&slug)))
                }
                "append_to_topic_buffer" => {
                    let slug = str_field(&params, "slug")?;
                    let text = str_field(&params, "text")?;
                    let source = opt_str_field(&params, "source").unwrap_or_else(|| "agent".to_string());
                    notes.append_to_topic_buffer(&slug, &text, &source).map_err(|e| e.to_string())?;
                    Ok(json!({ "ok": true }))
                }
                "load_topic_note_feed" => {
                    let slug = str_field(&params, "slug")?;
                    Ok(json!(notes.load_topic_note_feed(&slug)))
                }
                "save_topic_note_feed" => {
                    let slug = str_field(&params, "slug")?;
                    let content = str_field(&params, "content")?;
                    notes.save_topic_note_feed(&slug, &content).map_err(|e| e.to_string())?;
                    Ok(json!({ "ok": true }))
                }
                "load_topic_synthesis" => {
                    let slug = str_field(&params, "slug")?;
                    Ok(json!(notes.load_topic_synthesis(&slug)))
                }
                "save_topic_synthesis" => {
                    let slug = str_field(&params, "slug")?;
                    let content = str_field(&params, "content")?;
                    notes.save_topic_synthesis(&slug, &content).map_err(|e| e.to_string())?;
                    Ok(json!({ "ok": true }))
                }
                "list_drafts" => Ok(json!(notes.list_drafts())),
                "load_draft" => {
                    let filename = str_field(&params, "filename")?;
                    Ok(json!(notes.load_draft(&filename)))
                }
                "save_draft" => {
                    let filename = str_field(&params, "filename")?;
                    let content = str_field(&params, "content")?;
                    notes.save_draft(&filename, &content).map_err(|e| e.to_string())?;
                    Ok(json!({ "ok": true }))
                }
                "create_draft" => {
                    let title = str_field(&params, "title")?;
                    Ok(json!({ "filename": notes.create_draft(&title).map_err(|e| e.to_string())? }))
                }
                "list_topic_notes" => {
                    let slug = str_field(&params, "slug")?;
                    Ok(json!(notes.list_topic_notes(&slug)))
                }
                "load_topic_note" => {
                    let slug = str_field(&params, "slug")?;
                    let filename = str_field(&params, "filename")?;
                    Ok(json!(notes.load_topic_note(&slug, &filename)))
                }
                "save_topic_note" => {
                    let slug = str_field(&params, "slug")?;
                    let filename = str_field(&params, "filename")?;
                    let content = str_field(&params, "content")?;
                    notes.save_topic_note(&slug, &filename, &content).map_err(|e| e.to_string())?;
                    Ok(json!({ "ok": true }))
                }
                "create_topic_note" => {
                    let slug = str_field(&params, "slug")?;
                    let title = str_field(&params, "title")?;
                    Ok(json!({ "filename": notes.create_topic_note(&slug, &title).map_err(|e| e.to_string())? }))
                }
                "merge_topics" => {
                    let source = str_field(&params, "source")?;
                    let target = str_field(&params, "target")?;
                    let moved = notes.merge_topics(&source, &target).map_err(|e| e.to_string())?;
                    Ok(json!({ "moved": moved }))
                }
                "get_last_aggregate_time" => Ok(json!(notes.get_last_aggregate_time())),
                "set_last_aggregate_time" => {
                    let timestamp = str_field(&params, "timestamp")?;
                    notes.set_last_aggregate_time(&timestamp).map_err(|e| e.to_string())?;
                    Ok(json!({ "ok": true }))
                }
                "get_last_sync_time" => Ok(json!(notes.get_last_sync_time())),
                "set_last_sync_time" => {
                    let timestamp = str_field(&params, "timestamp")?;
                    notes.set_last_sync_time(&timestamp).map_err(|e| e.to_string())?;
                    Ok(json!({ "ok": true }))
                }
                other => Err(format!("unknown storage action: {other}")),
            }
        })
        .await
        .map_err(|e| e.to_string())?
    }

    async fn handle_settings(&self, action: &str, params: &Value) -> Result<Value, String> {
        let mut settings = self.storage.settings.lock().expect("settings mutex poisoned");
        match action {
            "get" => {
                let key = str_field(params, "key")?;
                Ok(settings.get(&key).cloned().unwrap_or(Value::Null))
            }
            "set" => {
                let key = str_field(params, "key")?;
                let value = params.get("value").cloned().unwrap_or(Value::Null);
                settings.set(&key, value).map_err(|e| e.to_string())?;
                Ok(json!({ "ok": true }))
            }
            "get_model" => {
                let command = opt_str_field(params, "command");
                Ok(json!(settings.get_model(command.as_deref())))
            }
            "load_all" => Ok(json!(settings.load_all())),
            "is_valid_key" => {
                let key = str_field(params, "key")?;
                Ok(json!(crate::storage::settings::Settings::is_valid_key(&key)))
            }
            other => Err(format!("unknown settings action: {other}")),
        }
    }

    async fn handle_llm(&self, action: &str, params: &Value) -> Result<Value, String> {
        match action {
            "chat" => {
                let prompt = str_field(params, "prompt")?;
                let model = opt_str_field(params, "model");
                let command = opt_str_field(params, "command");
                let temperature = params.get("temperature").and_then(|v| v.as_f64()).unwrap_or(0.3) as f32;
                let system = opt_str_field(params, "system");
                let request = ChatRequest { prompt, model, command, temperature, system };
                let text = self.llm.submit(request, PRIORITY_AGENT).await.map_err(|e| e.to_string())?;
                Ok(json!({ "text": text }))
            }
            other => Err(format!("unknown llm action: {other}")),
        }
    }
}

fn str_field(params: &Value, key: &str) -> Result<String, String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(String::from)
        .ok_or_else(|| format!("missing required field: {key}"))
}

fn opt_str_field(params: &Value, key: &str) -> Option<String> {
    params.get(key).and_then(|v| v.as_str()).map(String::from)
}

fn i64_field(params: &Value, key: &str) -> Result<i64, String> {
    params.get(key).and_then(|v| v.as_i64()).ok_or_else(|| format!("missing required field: {key}"))
}

fn bool_field(params: &Value, key: &str) -> Option<bool> {
    params.get(key).and_then(|v| v.as_bool())
}

fn parse_frequency(s: &str) -> Result<Frequency, String> {
    match s {
        "daily" => Ok(Frequency::Daily),
        "weekly" => Ok(Frequency::Weekly),
        "monthly" => Ok(Frequency::Monthly),
        "yearly" => Ok(Frequency::Yearly),
        other => Err(format!("unknown frequency: {other}")),
    }
}

fn parse_task_status(s: &str) -> Result<crate::storage::tasks::TaskStatus, String> {
    use crate::storage::tasks::TaskStatus;
    match s {
        "todo" => Ok(TaskStatus::Todo),
        "done" => Ok(TaskStatus::Done),
        "cancelled" => Ok(TaskStatus::Cancelled),
        other => Err(format!("unknown task status: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Paths;
    use crate::llm::{HttpLlmClient, LlmQueue};

    async fn test_dispatcher() -> ServiceDispatcher {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path());
        let storage = Arc::new(Storage::open_in_memory(&paths).unwrap());
        let client = Arc::new(HttpLlmClient::new("http://127.0.0.1:0", Arc::clone(&storage)));
        let llm = LlmQueue::new(client, 1);
        ServiceDispatcher::new(storage, llm)
    }

    fn service_request(service: &str, action: &str, params: Value) -> Envelope {
        let mut payload = BTreeMap::new();
        payload.insert("service".to_string(), Value::String(service.to_string()));
        payload.insert("action".to_string(), Value::String(action.to_string()));
        payload.insert("params".to_string(), params);
        Envelope::create("service.request", "agent-0", "broker", payload)
    }

    #[tokio::test]
    async fn task_create_then_list_round_trip() {
        let dispatcher = test_dispatcher().await;
        let create = service_request("tasks", "create", json!({ "title": "Buy milk" }));
        let reply = dispatcher.dispatch(&create).await;
        assert_eq!(reply.r#type, MSG_SERVICE_RESPONSE);
        assert_eq!(reply.payload["result"]["task_id"], json!(1));

        let list = service_request("tasks", "list", json!({}));
        let reply = dispatcher.dispatch(&list).await;
        let tasks = reply.payload["result"].as_array().unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0]["title"], json!("Buy milk"));
    }

    #[tokio::test]
    async fn settings_set_then_get_round_trip() {
        let dispatcher = test_dispatcher().await;
        let set = service_request("settings", "set", json!({ "key": "model", "value": "llama3" }));
        dispatcher.dispatch(&set).await;

        let get = service_request("settings", "get", json!({ "key": "model" }));
        let reply = dispatcher.dispatch(&get).await;
        assert_eq!(reply.payload["result"], json!("llama3"));
    }

    #[tokio::test]
    async fn storage_is_isolated_per_agent() {
        let dispatcher = test_dispatcher().await;
        let mut save_a = service_request("storage", "save_raw_input", json!({ "text": "from a" }));
        save_a.sender = "agent-a".to_string();
        dispatcher.dispatch(&save_a).await;

        let mut save_b = service_request("storage", "save_raw_input", json!({ "text": "from b" }));
        save_b.sender = "agent-b".to_string();
        dispatcher.dispatch(&save_b).await;

        let mut parse_a = service_request("storage", "parse_buffer", json!({}));
        parse_a.sender = "agent-a".to_string();
        let reply = dispatcher.dispatch(&parse_a).await;
        let entries = reply.payload["result"].as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["text"], json!("from a"));
    }

    #[tokio::test]
    async fn unknown_service_returns_service_error() {
        let dispatcher = test_dispatcher().await;
        let req = service_request("bogus", "create", json!({}));
        let reply = dispatcher.dispatch(&req).await;
        assert_eq!(reply.r#type, MSG_SERVICE_ERROR);
    }
}
