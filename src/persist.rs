//! Session list persistence
//!
//! The ordered list of open sessions is saved to
//! `~/.termshell/sessions.toml` so the next launch can recreate them. Only
//! identity survives a restart: scrollback, history and working directory
//! start fresh.
//!
//! ```toml
//! [[sessions]]
//! id = 1
//! title = "shell"
//!
//! [[sessions]]
//! id = 2
//! title = "build box"
//! remote = "deploy@build:2222"
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::core::session::SessionId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub title: String,
    /// `[user@]host[:port]` for SSH sessions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SessionFile {
    #[serde(default)]
    sessions: Vec<SessionRecord>,
}

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to serialize session list: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Reads and writes the session list at a fixed path
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store under the data directory, if there is one
    pub fn default_location() -> Option<Self> {
        crate::config::data_dir().map(|dir| Self::new(dir.join("sessions.toml")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Saved records in order; a missing or unreadable file is an empty list
    pub fn load(&self) -> Vec<SessionRecord> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!("Could not read {}: {}", self.path.display(), e);
                return Vec::new();
            }
        };
        match toml::from_str::<SessionFile>(&content) {
            Ok(file) => file.sessions,
            Err(e) => {
                warn!("Ignoring invalid session list {}: {}", self.path.display(), e);
                Vec::new()
            }
        }
    }

    pub fn save(&self, records: &[SessionRecord]) -> Result<(), PersistError> {
        let file = SessionFile {
            sessions: records.to_vec(),
        };
        let content = toml::to_string_pretty(&file)?;
        fs::write(&self.path, content).map_err(|source| PersistError::Write {
            path: self.path.clone(),
            source,
        })?;
        debug!(count = records.len(), "saved session list");
        Ok(())
    }
}
