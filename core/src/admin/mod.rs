//! The in-process privileged admin agent: parses input, routes commands
//! by `@mention` or manifest lookup, handles its own command set, and
//! reflects on free text with optional task/event extraction.

pub mod extraction;
pub mod prompts;

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::warn;

use crate::config::Paths;
use crate::envelope::{Envelope, MSG_ERROR, MSG_RESPONSE};
use crate::llm::{ChatRequest, LlmQueue, PRIORITY_ADMIN};
use crate::registry::{Manifest, ManifestCommand};
use crate::router::MessageRouter;
use crate::storage::Storage;

const OWN_COMMANDS: [&str; 7] = ["help", "status", "agents", "tasks", "events", "settings", "set"];

pub fn manifest() -> Manifest {
    Manifest {
        name: "admin".to_string(),
        description: Some("Routes commands and reflects on free text".to_string()),
        commands: OWN_COMMANDS
            .iter()
            .map(|c| ManifestCommand::Detailed { name: c.to_string(), description: None, args: None })
            .collect(),
        panels: json!([{ "id": "chat", "label": "MIST", "type": "chat", "default": true }]),
    }
}

pub struct AdminAgent {
    agent_id: RwLock<String>,
    storage: Arc<Storage>,
    llm: Arc<LlmQueue>,
    paths: Paths,
}

impl AdminAgent {
    pub fn new(storage: Arc<Storage>, llm: Arc<LlmQueue>, paths: Paths) -> Self {
        AdminAgent { agent_id: RwLock::new(String::new()), storage, llm, paths }
    }

    /// Register with the registry as a privileged in-process agent and
    /// remember the assigned id.
    pub fn register(&self, router: &MessageRouter) {
        let entry = router.registry().register(None, manifest(), true);
        *self.agent_id.write().expect("agent_id lock poisoned") = entry.agent_id;
    }

    fn agent_id(&self) -> String {
        self.agent_id.read().expect("agent_id lock poisoned").clone()
    }
}

#[async_trait]
impl crate::router::AdminHandler for AdminAgent {
    async fn handle(&self, router: &MessageRouter, msg: Envelope) {
        let command_field = msg.payload.get("command").and_then(|v| v.as_str()).map(str::to_string);
        let text_field = msg.payload.get("text").and_then(|v| v.as_str()).map(str::to_string);
        let args = msg.payload.get("args").cloned().unwrap_or(Value::Object(Default::default()));

        let (command, text) = normalize_input(command_field, text_field);

        if let Some(command) = &command {
            if let Some(agent_name) = command.strip_prefix('@') {
                self.route_by_mention(router, &msg, agent_name);
                return;
            }
            if let Some(owner) = router.registry().find_command_owner(command) {
                if owner.agent_id != self.agent_id() {
                    router.forward_command(&owner.agent_id, msg);
                    return;
                }
            }
            if OWN_COMMANDS.contains(&command.as_str()) {
                self.handle_own_command(router, &msg, command, &text, &args).await;
                return;
            }
        }

        self.handle_free_text(router, &msg, &text).await;
    }
}

fn normalize_input(command: Option<String>, text: Option<String>) -> (Option<String>, String) {
    if let Some(command) = command {
        return (Some(command), text.unwrap_or_default());
    }
    let Some(text) = text else { return (None, String::new()) };
    let mut parts = text.splitn(2, char::is_whitespace);
    let first = parts.next().unwrap_or("").to_string();
    let rest = parts.next().unwrap_or("").trim_start().to_string();
    if OWN_COMMANDS.contains(&first.as_str()) || first.starts_with('@') {
        (Some(first), rest)
    } else {
        (None, text)
    }
}

impl AdminAgent {
    fn route_by_mention(&self, router: &MessageRouter, msg: &Envelope, agent_name: &str) {
        let target = router
            .registry()
            .all_agents()
            .into_iter()
            .find(|e| e.name == agent_name || e.agent_id == agent_name);
        match target {
            Some(entry) => router.forward_command(&entry.agent_id, msg.clone()),
            None => self.respond_error(router, msg, &format!("No agent named '{agent_name}'")),
        }
    }

    async fn handle_own_command(
        &self,
        router: &MessageRouter,
        msg: &Envelope,
        command: &str,
        text: &str,
        args: &Value,
    ) {
        match command {
            "help" => self.handle_help(router, msg),
            "status" => self.handle_status(router, msg),
            "agents" => self.handle_agents(router, msg),
            "tasks" => self.handle_tasks(router, msg, args),
            "events" => self.handle_events(router, msg, args),
            "settings" => self.handle_settings(router, msg),
            "set" => self.handle_set(router, msg, text, args),
            other => self.respond_error(router, msg, &format!("unknown admin command: {other}")),
        }
    }

    fn handle_help(&self, router: &MessageRouter, msg: &Envelope) {
        let mut lines = vec!["Admin commands:".to_string()];
        for c in OWN_COMMANDS {
            lines.push(format!("  {c}"));
        }
        let self_id = self.agent_id();
        for entry in router.registry().all_agents() {
            if entry.agent_id == self_id {
                continue;
            }
            lines.push(format!("\n{} ({}):", entry.name, entry.agent_id));
            for command in &entry.manifest.commands {
                match command.description() {
                    Some(desc) => lines.push(format!("  {} - {desc}", command.name())),
                    None => lines.push(format!("  {}", command.name())),
                }
            }
        }
        lines.push("\nUse @<name> to address an agent directly.".to_string());
        self.respond_text(router, msg, &lines.join("\n"));
    }

    fn handle_status(&self, router: &MessageRouter, msg: &Envelope) {
        let self_id = self.agent_id();
        let connected = router.registry().all_agents().into_iter().filter(|e| e.agent_id != self_id).count();
        let open_tasks = self.storage.tasks().list(false).map(|t| t.len()).unwrap_or(0);
        let upcoming_events = self.storage.events().get_upcoming(7, i64::MAX).map(|e| e.len()).unwrap_or(0);
        let text = format!(
            "Agents: {connected} connected / Tasks: {open_tasks} open / Events: {upcoming_events} upcoming (7d)"
        );
        self.respond_text(router, msg, &text);
    }

    fn handle_agents(&self, router: &MessageRouter, msg: &Envelope) {
        let items: Vec<String> = router
            .registry()
            .all_agents()
            .into_iter()
            .map(|e| {
                let privileged = if e.privileged { " (privileged)" } else { "" };
                let state = if e.connection.is_some() { " [connected]" } else { " [in-process]" };
                format!("{}: {}{privileged}{state}", e.agent_id, e.name)
            })
            .collect();
        self.respond_list(router, msg, items, "Connected agents");
    }

    fn handle_tasks(&self, router: &MessageRouter, msg: &Envelope, args: &Value) {
        let include_done = args.get("all").and_then(|v| v.as_bool()).unwrap_or(false);
        let tasks = self.storage.tasks().list(include_done).unwrap_or_default();
        let rows: Vec<Vec<String>> = tasks
            .iter()
            .map(|t| {
                vec![
                    t.id.to_string(),
                    t.title.clone(),
                    format!("{:?}", t.status).to_lowercase(),
                    t.due_date.clone().unwrap_or_default(),
                ]
            })
            .collect();
        self.respond_table(router, msg, vec!["ID", "Title", "Status", "Due"], rows, "Tasks");
    }

    fn handle_events(&self, router: &MessageRouter, msg: &Envelope, args: &Value) {
        let days = args.get("days").and_then(|v| v.as_i64()).unwrap_or(7);
        let events = self.storage.events().get_upcoming(days, i64::MAX).unwrap_or_default();
        let rows: Vec<Vec<String>> = events
            .iter()
            .map(|e| {
                vec![
                    e.event_id.to_string(),
                    e.title.clone(),
                    e.start_time.clone(),
                    e.frequency.clone().unwrap_or_default(),
                ]
            })
            .collect();
        self.respond_table(router, msg, vec!["ID", "Title", "Start", "Frequency"], rows, "Events");
    }

    fn handle_settings(&self, router: &MessageRouter, msg: &Envelope) {
        let settings = self.storage.settings.lock().expect("settings mutex poisoned");
        let all = settings.load_all();
        let lines: Vec<String> = all.iter().map(|(k, v)| format!("{k} = {v}")).collect();
        drop(settings);
        self.respond_text(router, msg, &lines.join("\n"));
    }

    fn handle_set(&self, router: &MessageRouter, msg: &Envelope, text: &str, args: &Value) {
        let (key, raw_value) = if let (Some(k), Some(v)) =
            (args.get("key").and_then(|v| v.as_str()), args.get("value"))
        {
            (k.to_string(), v.clone())
        } else {
            let mut parts = text.splitn(2, char::is_whitespace);
            let key = parts.next().unwrap_or("").to_string();
            let value = parts.next().unwrap_or("").to_string();
            (key, Value::String(value))
        };

        let value = match &raw_value {
            Value::String(s) => s.parse::<i64>().map(Value::from).unwrap_or_else(|_| raw_value.clone()),
            other => other.clone(),
        };

        let mut warning = String::new();
        if !crate::storage::settings::Settings::is_valid_key(&key) {
            warning = format!(" (warning: '{key}' is not a recognised setting)");
        }

        let mut settings = self.storage.settings.lock().expect("settings mutex poisoned");
        if let Err(e) = settings.set(&key, value.clone()) {
            warn!(error = %e, "failed to persist setting");
        }
        drop(settings);

        self.respond_text(router, msg, &format!("Set {key} = {value}{warning}"));
    }

    async fn handle_free_text(&self, router: &MessageRouter, msg: &Envelope, text: &str) {
        let persona = prompts::load_persona(&self.paths.agent_persona_path(&self.agent_id()));
        let system = prompts::system_prompt(&persona, "", "");
        let request = ChatRequest {
            prompt: prompts::user_prompt(text),
            system: Some(system),
            command: Some("reflect".to_string()),
            ..ChatRequest::new(String::new())
        };

        let reflection = match self.llm.submit(request, PRIORITY_ADMIN).await {
            Ok(reply) => reply,
            Err(_) => {
                self.respond_error(router, msg, "LLM request failed");
                return;
            }
        };
        self.respond_text(router, msg, &reflection);

        let agency_mode = {
            let settings = self.storage.settings.lock().expect("settings mutex poisoned");
            settings.get("agency_mode").and_then(|v| v.as_str()).unwrap_or("suggest").to_string()
        };
        if agency_mode == "off" {
            return;
        }

        let items = extraction::extract_items(text, &self.llm).await;
        let summaries = extraction::apply_extracted_items(&items, &self.storage);
        if !summaries.is_empty() {
            self.respond_text(router, msg, &format!("Created from your note:\n{}", summaries.join("\n")));
        }
    }

    fn respond_text(&self, router: &MessageRouter, original: &Envelope, text: &str) {
        let payload = response_payload("text", json!({ "text": text, "format": "plain" }));
        router.deliver_response(Envelope::reply(original, &self.agent_id(), MSG_RESPONSE, payload));
    }

    fn respond_table(&self, router: &MessageRouter, original: &Envelope, columns: Vec<&str>, rows: Vec<Vec<String>>, title: &str) {
        let payload = response_payload("table", json!({ "columns": columns, "rows": rows, "title": title }));
        router.deliver_response(Envelope::reply(original, &self.agent_id(), MSG_RESPONSE, payload));
    }

    fn respond_list(&self, router: &MessageRouter, original: &Envelope, items: Vec<String>, title: &str) {
        let payload = response_payload("list", json!({ "items": items, "title": title }));
        router.deliver_response(Envelope::reply(original, &self.agent_id(), MSG_RESPONSE, payload));
    }

    fn respond_error(&self, router: &MessageRouter, original: &Envelope, message: &str) {
        let payload = response_payload("error", json!({ "message": message, "code": "admin_error" }));
        router.deliver_response(Envelope::reply(original, &self.agent_id(), MSG_ERROR, payload));
    }
}

fn response_payload(kind: &str, content: Value) -> BTreeMap<String, Value> {
    let mut payload = BTreeMap::new();
    payload.insert("type".to_string(), Value::String(kind.to_string()));
    payload.insert("content".to_string(), content);
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_input_splits_command_from_text() {
        let (command, text) = normalize_input(None, Some("status now please".to_string()));
        assert_eq!(command, Some("status".to_string()));
        assert_eq!(text, "now please");
    }

    #[test]
    fn normalize_input_falls_back_to_free_text() {
        let (command, text) = normalize_input(None, Some("how are you today".to_string()));
        assert_eq!(command, None);
        assert_eq!(text, "how are you today");
    }

    #[test]
    fn normalize_input_recognises_mentions() {
        let (command, _) = normalize_input(None, Some("@notes remind me".to_string()));
        assert_eq!(command, Some("@notes".to_string()));
    }
}
