//! Typed access to shared storage: tasks, events, articles, settings
//! (shared SQLite database and JSON settings file), and per-agent
//! note trees.

pub mod articles;
pub mod db;
pub mod events;
pub mod notes;
pub mod settings;
pub mod tasks;

use std::sync::Mutex;

use crate::config::Paths;
use crate::error::Result;

use db::Database;
use notes::NoteStorage;
use settings::Settings;

/// Owns the shared database, the settings file, and lazily-created
/// per-agent note storage values.
pub struct Storage {
    pub db: Database,
    pub settings: Mutex<Settings>,
    paths: Paths,
}

impl Storage {
    pub fn open(paths: &Paths) -> Result<Self> {
        std::fs::create_dir_all(paths.root())?;
        let db = Database::open(paths.db_path())?;
        let settings = Settings::load(paths.settings_path())?;
        Ok(Storage { db, settings: Mutex::new(settings), paths: paths.clone() })
    }

    pub fn open_in_memory(paths: &Paths) -> Result<Self> {
        let db = Database::open_in_memory()?;
        let settings = Settings::load(paths.settings_path())?;
        Ok(Storage { db, settings: Mutex::new(settings), paths: paths.clone() })
    }

    /// Per-agent note storage, rooted at `<data-dir>/agents/<agent_id>/notes`.
    pub fn notes_for(&self, agent_id: &str) -> NoteStorage {
        NoteStorage::new(self.paths.agent_notes_root(agent_id))
    }

    pub fn tasks(&self) -> tasks::TaskStore<'_> {
        tasks::TaskStore::new(&self.db)
    }

    pub fn events(&self) -> events::EventStore<'_> {
        events::EventStore::new(&self.db)
    }

    pub fn articles(&self) -> articles::ArticleStore<'_> {
        articles::ArticleStore::new(&self.db)
    }
}
