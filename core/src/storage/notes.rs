//! Per-agent note tree: root buffer, topic index, per-topic buffers,
//! note feeds, syntheses, long-form notes, and drafts.
//!
//! Every operation here is scoped to a single agent's root directory;
//! cross-agent isolation is by distinct path roots, not locking.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoteLogEntry {
    pub time: String,
    pub source: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicInfo {
    pub id: i64,
    pub name: String,
    pub slug: String,
    pub created: String,
}

/// Lowercase, collapse non-alphanumerics to `-`, strip leading/trailing
/// hyphens; falls back to `"untitled"` if the result would be empty.
pub fn slugify(input: &str) -> String {
    let mut slug = String::new();
    let mut last_was_dash = false;
    for ch in input.to_lowercase().chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch);
            last_was_dash = false;
        } else if !last_was_dash {
            slug.push('-');
            last_was_dash = true;
        }
    }
    let trimmed = slug.trim_matches('-').to_string();
    if trimmed.is_empty() {
        "untitled".to_string()
    } else {
        trimmed
    }
}

fn now_iso() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string()
}

fn append_jsonl(path: &Path, entry: &NoteLogEntry) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut contents = fs::read_to_string(path).unwrap_or_default();
    contents.push_str(&serde_json::to_string(entry)?);
    contents.push('\n');
    fs::write(path, contents)?;
    Ok(())
}

fn parse_jsonl(path: &Path) -> Vec<NoteLogEntry> {
    let Ok(contents) = fs::read_to_string(path) else { return Vec::new() };
    contents
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect()
}

fn write_jsonl(path: &Path, entries: &[NoteLogEntry]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut contents = String::new();
    for entry in entries {
        contents.push_str(&serde_json::to_string(entry)?);
        contents.push('\n');
    }
    fs::write(path, contents)?;
    Ok(())
}

/// Scoped to a single agent's root directory under `<data-dir>/agents/<agent_id>/notes`.
pub struct NoteStorage {
    root: PathBuf,
}

impl NoteStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        NoteStorage { root: root.into() }
    }

    fn buffer_path(&self) -> PathBuf {
        self.root.join("noteBuffer.jsonl")
    }

    fn topic_index_path(&self) -> PathBuf {
        self.root.join("topics.json")
    }

    fn topic_dir(&self, slug: &str) -> PathBuf {
        self.root.join("topics").join(slug)
    }

    fn drafts_dir(&self) -> PathBuf {
        self.root.join("drafts")
    }

    pub fn save_raw_input(&self, text: &str, source: &str) -> Result<()> {
        append_jsonl(
            &self.buffer_path(),
            &NoteLogEntry { time: now_iso(), source: source.to_string(), text: text.to_string() },
        )
    }

    pub fn parse_buffer(&self) -> Vec<NoteLogEntry> {
        parse_jsonl(&self.buffer_path())
    }

    pub fn clear_buffer(&self) -> Result<()> {
        write_jsonl(&self.buffer_path(), &[])
    }

    pub fn write_buffer(&self, entries: &[NoteLogEntry]) -> Result<()> {
        write_jsonl(&self.buffer_path(), entries)
    }

    pub fn load_topic_index(&self) -> Vec<TopicInfo> {
        let Ok(contents) = fs::read_to_string(self.topic_index_path()) else { return Vec::new() };
        serde_json::from_str(&contents).unwrap_or_default()
    }

    pub fn save_topic_index(&self, index: &[TopicInfo]) -> Result<()> {
        if let Some(parent) = self.topic_index_path().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(self.topic_index_path(), serde_json::to_string_pretty(index)?)?;
        Ok(())
    }

    pub fn add_topic(&self, name: &str, slug: &str) -> Result<TopicInfo> {
        let mut index = self.load_topic_index();
        let next_id = index.iter().map(|t| t.id).max().unwrap_or(0) + 1;
        let topic = TopicInfo {
            id: next_id,
            name: name.to_string(),
            slug: slug.to_string(),
            created: now_iso(),
        };
        index.push(topic.clone());
        self.save_topic_index(&index)?;

        fs::create_dir_all(self.topic_dir(slug))?;
        write_jsonl(&self.topic_dir(slug).join("noteBuffer.jsonl"), &[])?;
        Ok(topic)
    }

    /// Try an id match first (if `identifier` parses as an integer),
    /// falling back to a case-insensitive slug match.
    pub fn find_topic(&self, identifier: &str) -> Option<TopicInfo> {
        let index = self.load_topic_index();
        if let Ok(id) = identifier.parse::<i64>() {
            if let Some(found) = index.iter().find(|t| t.id == id) {
                return Some(found.clone());
            }
        }
        let lowered = identifier.to_lowercase();
        index.into_iter().find(|t| t.slug.to_lowercase() == lowered)
    }

    pub fn append_to_topic_buffer(&self, slug: &str, text: &str, source: &str) -> Result<()> {
        append_jsonl(
            &self.topic_dir(slug).join("noteBuffer.jsonl"),
            &NoteLogEntry { time: now_iso(), source: source.to_string(), text: text.to_string() },
        )
    }

    pub fn load_topic_buffer(&self, slug: &str) -> Vec<NoteLogEntry> {
        parse_jsonl(&self.topic_dir(slug).join("noteBuffer.jsonl"))
    }

    pub fn load_topic_note_feed(&self, slug: &str) -> String {
        fs::read_to_string(self.topic_dir(slug).join("noteFeed.md")).unwrap_or_default()
    }

    pub fn save_topic_note_feed(&self, slug: &str, content: &str) -> Result<()> {
        let dir = self.topic_dir(slug);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join("noteFeed.md"), ensure_trailing_newline(content))?;
        Ok(())
    }

    pub fn load_topic_synthesis(&self, slug: &str) -> String {
        fs::read_to_string(self.topic_dir(slug).join("synthesis.md")).unwrap_or_default()
    }

    pub fn save_topic_synthesis(&self, slug: &str, content: &str) -> Result<()> {
        let dir = self.topic_dir(slug);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join("synthesis.md"), ensure_trailing_newline(content))?;
        Ok(())
    }

    pub fn create_draft(&self, title: &str) -> Result<String> {
        let slug = slugify(title);
        let date = Utc::now().format("%Y-%m-%d").to_string();
        let filename = format!("{date}-{slug}.md");
        let dir = self.drafts_dir();
        fs::create_dir_all(&dir)?;
        let path = dir.join(&filename);
        if !path.exists() {
            fs::write(&path, format!("# {title}\n\n"))?;
        }
        Ok(filename)
    }

    pub fn list_drafts(&self) -> Vec<String> {
        list_markdown_files(&self.drafts_dir())
    }

    pub fn load_draft(&self, filename: &str) -> String {
        fs::read_to_string(self.drafts_dir().join(filename)).unwrap_or_default()
    }

    pub fn save_draft(&self, filename: &str, content: &str) -> Result<()> {
        fs::create_dir_all(self.drafts_dir())?;
        fs::write(self.drafts_dir().join(filename), content)?;
        Ok(())
    }

    fn topic_notes_dir(&self, slug: &str) -> PathBuf {
        self.topic_dir(slug).join("notes")
    }

    pub fn create_topic_note(&self, slug: &str, title: &str) -> Result<String> {
        let note_slug = slugify(title);
        let date = Utc::now().format("%Y-%m-%d").to_string();
        let filename = format!("{date}-{note_slug}.md");
        let dir = self.topic_notes_dir(slug);
        fs::create_dir_all(&dir)?;
        let path = dir.join(&filename);
        if !path.exists() {
            fs::write(&path, format!("# {title}\n\n"))?;
        }
        Ok(filename)
    }

    pub fn list_topic_notes(&self, slug: &str) -> Vec<String> {
        list_markdown_files(&self.topic_notes_dir(slug))
    }

    pub fn load_topic_note(&self, slug: &str, filename: &str) -> String {
        fs::read_to_string(self.topic_notes_dir(slug).join(filename)).unwrap_or_default()
    }

    pub fn save_topic_note(&self, slug: &str, filename: &str, content: &str) -> Result<()> {
        let dir = self.topic_notes_dir(slug);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(filename), content)?;
        Ok(())
    }

    /// Move `source`'s buffer entries and long-form notes into `target`,
    /// concatenate synthesis text, and remove `source` from the index.
    /// Returns the number of buffer entries moved.
    pub fn merge_topics(&self, source_slug: &str, target_slug: &str) -> Result<usize> {
        let source_entries = self.load_topic_buffer(source_slug);
        let mut target_entries = self.load_topic_buffer(target_slug);
        target_entries.extend(source_entries.iter().cloned());
        write_jsonl(&self.topic_dir(target_slug).join("noteBuffer.jsonl"), &target_entries)?;

        let source_notes_dir = self.topic_notes_dir(source_slug);
        let target_notes_dir = self.topic_notes_dir(target_slug);
        if source_notes_dir.exists() {
            fs::create_dir_all(&target_notes_dir)?;
            for entry in fs::read_dir(&source_notes_dir)?.flatten() {
                let file_name = entry.file_name();
                let mut dest = target_notes_dir.join(&file_name);
                if dest.exists() {
                    dest = target_notes_dir.join(format!(
                        "{source_slug}--{}",
                        file_name.to_string_lossy()
                    ));
                }
                fs::rename(entry.path(), dest)?;
            }
        }

        let target_synthesis = self.load_topic_synthesis(target_slug);
        let source_synthesis = self.load_topic_synthesis(source_slug);
        let merged_synthesis = match (target_synthesis.trim().is_empty(), source_synthesis.trim().is_empty()) {
            (true, true) => String::new(),
            (true, false) => source_synthesis,
            (false, true) => target_synthesis,
            (false, false) => format!("{}\n\n---\n\n{}", target_synthesis.trim_end(), source_synthesis.trim_end()),
        };
        if !merged_synthesis.is_empty() {
            self.save_topic_synthesis(target_slug, &merged_synthesis)?;
        }

        let mut index = self.load_topic_index();
        index.retain(|t| t.slug != source_slug);
        self.save_topic_index(&index)?;

        let source_dir = self.topic_dir(source_slug);
        if source_dir.exists() {
            fs::remove_dir_all(source_dir)?;
        }

        Ok(source_entries.len())
    }

    pub fn get_last_aggregate_time(&self) -> Option<String> {
        read_timestamp(&self.root.join("last_aggregate.txt"))
    }

    pub fn set_last_aggregate_time(&self, timestamp: &str) -> Result<()> {
        write_timestamp(&self.root.join("last_aggregate.txt"), timestamp)
    }

    pub fn get_last_sync_time(&self) -> Option<String> {
        read_timestamp(&self.root.join("last_sync.txt"))
    }

    pub fn set_last_sync_time(&self, timestamp: &str) -> Result<()> {
        write_timestamp(&self.root.join("last_sync.txt"), timestamp)
    }
}

fn ensure_trailing_newline(content: &str) -> String {
    let trimmed = content.trim_end();
    format!("{trimmed}\n")
}

fn list_markdown_files(dir: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(dir) else { return Vec::new() };
    let mut names: Vec<String> = entries
        .flatten()
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().to_string();
            name.ends_with(".md").then_some(name)
        })
        .collect();
    names.sort();
    names
}

fn read_timestamp(path: &Path) -> Option<String> {
    let contents = fs::read_to_string(path).ok()?;
    let trimmed = contents.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn write_timestamp(path: &Path, timestamp: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, timestamp)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_collapses_and_trims() {
        assert_eq!(slugify("Hello, World!"), "hello-world");
        assert_eq!(slugify("   "), "untitled");
        assert_eq!(slugify("--Leading"), "leading");
    }

    #[test]
    fn save_raw_input_then_parse_buffer_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let storage = NoteStorage::new(dir.path());
        storage.save_raw_input("hello", "cli").unwrap();
        let entries = storage.parse_buffer();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].text, "hello");
        assert_eq!(entries[0].source, "cli");
    }

    #[test]
    fn add_topic_then_find_by_slug_or_id() {
        let dir = tempfile::tempdir().unwrap();
        let storage = NoteStorage::new(dir.path());
        let topic = storage.add_topic("Rust", "rust").unwrap();
        assert_eq!(topic.id, 1);

        let by_slug = storage.find_topic("Rust").unwrap();
        assert_eq!(by_slug.slug, "rust");
        let by_id = storage.find_topic("1").unwrap();
        assert_eq!(by_id.slug, "rust");
    }

    #[test]
    fn merge_topics_preserves_total_entry_count() {
        let dir = tempfile::tempdir().unwrap();
        let storage = NoteStorage::new(dir.path());
        storage.add_topic("Rust", "rust").unwrap();
        storage.add_topic("Systems", "systems").unwrap();
        storage.append_to_topic_buffer("rust", "borrow checker", "chat").unwrap();
        storage.append_to_topic_buffer("systems", "schedulers", "chat").unwrap();

        let moved = storage.merge_topics("rust", "systems").unwrap();
        assert_eq!(moved, 1);

        let index = storage.load_topic_index();
        assert!(!index.iter().any(|t| t.slug == "rust"));
        let merged = storage.load_topic_buffer("systems");
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn last_sync_time_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let storage = NoteStorage::new(dir.path());
        assert!(storage.get_last_sync_time().is_none());
        storage.set_last_sync_time("2024-06-01T00:00:00").unwrap();
        assert_eq!(storage.get_last_sync_time().unwrap(), "2024-06-01T00:00:00");
    }
}
