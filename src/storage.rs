//! Local persistence for the agent.
//!
//! Everything lives under one storage root:
//!
//! ```text
//! <root>/
//!   state.sqlite        # Heartbeat state and the run-request flag
//!   observations.jsonl  # Append-only observation log
//!   status.txt          # Latest status line
//!   agent.lock          # Held by the running agent
//! ```

mod event_log;
mod state;

use std::{
    fs::{self, File, OpenOptions},
    io,
    path::PathBuf,
};

use fs2::FileExt;
use tracing::debug;

pub use event_log::{EventLog, EventSink, SinkError};
pub use state::{
    SqliteStore, StateStore, clear_heartbeat, is_service_requested, is_stop_requested,
    load_heartbeat, save_heartbeat, set_service_requested,
};

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("corrupt data: {0}")]
    Corrupt(String),

    #[error("an agent is already running on {0}")]
    AlreadyRunning(String),
}

pub type Result<T> = core::result::Result<T, StorageError>;

/// The agent's storage root.
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    /// Creates a new storage instance rooted at the given directory.
    ///
    /// The directory is created if it doesn't exist.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Returns the default storage root: `~/.cellwatch/`.
    pub fn default_root() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".cellwatch"))
    }

    /// Opens (creating if needed) the persistent state database.
    pub fn open_state(&self) -> Result<SqliteStore> {
        SqliteStore::open(self.root.join("state.sqlite"))
    }

    /// The append-only observation log.
    pub fn event_log(&self) -> EventLog {
        EventLog::new(self.root.join("observations.jsonl"))
    }

    /// Where the latest status line is written.
    pub fn status_path(&self) -> PathBuf {
        self.root.join("status.txt")
    }

    /// Takes the exclusive agent lock without waiting.
    ///
    /// Only one agent may run per storage root. The lock is released when
    /// the returned guard is dropped or the process exits.
    pub fn lock_agent(&self) -> Result<AgentLock> {
        let path = self.root.join("agent.lock");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!(path = %path.display(), "Acquired agent lock");
                Ok(AgentLock { _file: file })
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                Err(StorageError::AlreadyRunning(self.root.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Guard for the agent lock.
pub struct AgentLock {
    _file: File,
}
