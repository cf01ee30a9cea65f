//! JSON-file-backed settings with per-command model overrides.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::Result;

pub const DEFAULT_MODEL: &str = "gemma3:1b";

/// Command tags that accept a `model_<tag>` override.
pub const MODEL_COMMANDS: &[&str] = &[
    "reflect",
    "recall",
    "sync",
    "resynth",
    "synthesis",
    "aggregate",
    "extract",
    "persona",
    "profile",
    "review",
];

fn defaults() -> BTreeMap<String, Value> {
    BTreeMap::from([
        ("agency_mode".to_string(), Value::String("suggest".to_string())),
        ("context_tasks_days".to_string(), Value::from(7)),
        ("context_events_days".to_string(), Value::from(3)),
        ("model".to_string(), Value::String(String::new())),
    ])
}

fn valid_keys() -> Vec<String> {
    let mut keys: Vec<String> = defaults().into_keys().collect();
    keys.extend(MODEL_COMMANDS.iter().map(|c| format!("model_{c}")));
    keys
}

/// Settings mapping, persisted as JSON at a fixed path.
pub struct Settings {
    path: PathBuf,
    values: BTreeMap<String, Value>,
}

impl Settings {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut values = defaults();
        if let Ok(contents) = std::fs::read_to_string(&path) {
            if let Ok(stored) = serde_json::from_str::<BTreeMap<String, Value>>(&contents) {
                values.extend(stored);
            }
        }
        Ok(Settings { path, values })
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(&self.values)?;
        std::fs::write(&self.path, contents)?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn set(&mut self, key: &str, value: Value) -> Result<()> {
        self.values.insert(key.to_string(), value);
        self.save()
    }

    pub fn load_all(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    pub fn is_valid_key(key: &str) -> bool {
        valid_keys().iter().any(|k| k == key)
    }

    /// Model resolution order: explicit argument, then
    /// `settings.model_<command>`, then `settings.model`, then the
    /// built-in default.
    pub fn get_model(&self, command: Option<&str>) -> String {
        if let Some(command) = command {
            let key = format!("model_{command}");
            if let Some(Value::String(m)) = self.values.get(&key) {
                if !m.is_empty() {
                    return m.clone();
                }
            }
        }
        if let Some(Value::String(m)) = self.values.get("model") {
            if !m.is_empty() {
                return m.clone();
            }
        }
        DEFAULT_MODEL.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let mut settings = Settings::load(&path).unwrap();
        settings.set("model", Value::String("llama3".to_string())).unwrap();
        assert_eq!(settings.get("model").unwrap(), &Value::String("llama3".to_string()));

        let reloaded = Settings::load(&path).unwrap();
        assert_eq!(reloaded.get("model").unwrap(), &Value::String("llama3".to_string()));
    }

    #[test]
    fn load_all_merges_defaults_with_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let mut settings = Settings::load(&path).unwrap();
        settings.set("agency_mode", Value::String("off".to_string())).unwrap();
        let all = settings.load_all();
        assert_eq!(all.get("agency_mode").unwrap(), &Value::String("off".to_string()));
        assert_eq!(all.get("context_tasks_days").unwrap(), &Value::from(7));
    }

    #[test]
    fn model_resolution_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let mut settings = Settings::load(&path).unwrap();
        assert_eq!(settings.get_model(Some("reflect")), DEFAULT_MODEL);

        settings.set("model", Value::String("global-model".to_string())).unwrap();
        assert_eq!(settings.get_model(Some("reflect")), "global-model");

        settings.set("model_reflect", Value::String("reflect-model".to_string())).unwrap();
        assert_eq!(settings.get_model(Some("reflect")), "reflect-model");
        assert_eq!(settings.get_model(Some("extract")), "global-model");
    }

    #[test]
    fn is_valid_key_recognises_model_overrides() {
        assert!(Settings::is_valid_key("model_reflect"));
        assert!(Settings::is_valid_key("agency_mode"));
        assert!(!Settings::is_valid_key("bogus"));
    }
}
