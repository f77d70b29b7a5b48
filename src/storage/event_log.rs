//! Event log: the append-only observation log.
//!
//! One JSON line per observation in `observations.jsonl`. A header line is
//! written when the file is created. Appends are serialized through a single
//! writer lock so the header check, the write and the flush never interleave
//! between producers.
//!
//! A line cut short by a crash is skipped on load, and the next append
//! starts on a fresh line.

use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

// Traits must be in scope for `.lines()` on `BufReader` and `.write_all()` on `File`.
use io::{BufRead, Read, Seek, SeekFrom, Write};

use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::model::{Observation, ObservationSource};

use super::{Result, StorageError};

/// Current on-disk format version, recorded in the header line.
const FORMAT_VERSION: u32 = 1;

/// Errors from appending to the log.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Append-only destination for observations.
pub trait EventSink: Send + Sync {
    /// Appends one observation. Returns only after the line is flushed.
    fn append(&self, observation: &Observation) -> core::result::Result<(), SinkError>;
}

/// A line of the log file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LogLine {
    /// First line of every log file.
    Header { header: LogHeader },

    Observation(Observation),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogHeader {
    pub format: u32,
    pub created_at: Timestamp,
}

/// File-backed event log.
pub struct EventLog {
    path: PathBuf,
    writer: Mutex<WriterState>,
}

/// State guarded by the writer lock.
#[derive(Default)]
struct WriterState {
    /// Last timestamp written per source in this process.
    last_written: HashMap<ObservationSource, Timestamp>,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: Mutex::new(WriterState::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads every observation in the log, skipping header lines.
    ///
    /// Returns an empty vec if the log doesn't exist yet. Lines that don't
    /// parse are skipped with a warning.
    pub fn load(&self) -> Result<Vec<Observation>> {
        let file = match fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let reader = io::BufReader::new(file);
        let mut observations = Vec::new();
        let mut skipped = 0usize;
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let parsed = match serde_json::from_str(&line) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(line = index + 1, error = %e, "Skipping unreadable log line");
                    skipped += 1;
                    continue;
                }
            };
            match parsed {
                LogLine::Observation(obs) => observations.push(obs),
                LogLine::Header { header } if header.format > FORMAT_VERSION => {
                    return Err(StorageError::Corrupt(format!(
                        "unsupported log format {} in {}",
                        header.format,
                        self.path.display()
                    )));
                }
                LogLine::Header { .. } => {}
            }
        }
        if skipped > 0 {
            warn!(path = %self.path.display(), skipped, "Log contains unreadable lines");
        }
        Ok(observations)
    }
}

impl EventSink for EventLog {
    fn append(&self, observation: &Observation) -> core::result::Result<(), SinkError> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);

        // Keep each source's timestamps non-decreasing even if the wall
        // clock steps backwards between two observations.
        let source = observation.source();
        let mut observation = observation.clone();
        if let Some(&last) = writer.last_written.get(&source)
            && observation.observed_at < last
        {
            observation.observed_at = last;
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)?;

        let mut buf = String::new();
        let len = file.metadata()?.len();
        if len == 0 {
            let header = LogLine::Header {
                header: LogHeader {
                    format: FORMAT_VERSION,
                    created_at: Timestamp::now(),
                },
            };
            buf.push_str(&serde_json::to_string(&header)?);
            buf.push('\n');
        } else if !ends_with_newline(&mut file)? {
            buf.push('\n');
        }
        buf.push_str(&serde_json::to_string(&observation)?);
        buf.push('\n');

        file.write_all(buf.as_bytes())?;
        file.flush()?;
        file.sync_data()?;

        writer.last_written.insert(source, observation.observed_at);
        Ok(())
    }
}

fn ends_with_newline(file: &mut fs::File) -> io::Result<bool> {
    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}
