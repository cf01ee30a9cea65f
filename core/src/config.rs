//! CLI arguments and on-disk path derivation.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "mist-core", about = "MIST broker core process")]
pub struct Args {
    /// Root directory for all on-disk state.
    #[arg(long, default_value_os_t = default_data_dir())]
    pub data_dir: PathBuf,

    /// Host the WebSocket listener binds to.
    #[arg(long, default_value = "127.0.0.1")]
    pub ws_host: String,

    /// Port the WebSocket listener binds to.
    #[arg(long, default_value_t = 8765)]
    pub ws_port: u16,

    /// Raise the log level to debug.
    #[arg(short, long)]
    pub verbose: bool,
}

fn default_data_dir() -> PathBuf {
    dirs_home().join(".mist")
}

fn dirs_home() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Every on-disk location the core needs, derived from a single root.
#[derive(Debug, Clone)]
pub struct Paths {
    root: PathBuf,
}

impl Paths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Paths { root: root.into() }
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    pub fn socket_path(&self) -> PathBuf {
        self.root.join("mist.sock")
    }

    pub fn db_path(&self) -> PathBuf {
        self.root.join("mist.db")
    }

    pub fn settings_path(&self) -> PathBuf {
        self.root.join("settings.json")
    }

    pub fn agents_dir(&self) -> PathBuf {
        self.root.join("agents")
    }

    pub fn agent_dir(&self, agent_id: &str) -> PathBuf {
        self.agents_dir().join(agent_id)
    }

    pub fn agent_persona_path(&self, agent_id: &str) -> PathBuf {
        self.agent_dir(agent_id).join("config").join("persona.md")
    }

    pub fn agent_notes_root(&self, agent_id: &str) -> PathBuf {
        self.agent_dir(agent_id).join("notes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_derive_from_root() {
        let paths = Paths::new("/tmp/mist-test");
        assert_eq!(paths.socket_path(), PathBuf::from("/tmp/mist-test/mist.sock"));
        assert_eq!(paths.db_path(), PathBuf::from("/tmp/mist-test/mist.db"));
        assert_eq!(
            paths.agent_persona_path("admin-0"),
            PathBuf::from("/tmp/mist-test/agents/admin-0/config/persona.md")
        );
    }
}
