//! Status display: a best-effort one-line summary of what the agent is doing.

use std::{fs, io, path::PathBuf};

use jiff::SignedDuration;

/// Somewhere to show the latest status line.
///
/// Failures are reported to the caller, which logs and drops them.
pub trait StatusDisplay: Send + Sync {
    fn show(&self, text: &str) -> io::Result<()>;
}

/// Writes the status line to a file, replacing the previous one.
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl StatusDisplay for StatusFile {
    fn show(&self, text: &str) -> io::Result<()> {
        // Write-then-rename so readers never see a half-written line.
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, format!("{text}\n"))?;
        fs::rename(tmp, &self.path)
    }
}

/// Formats the status line: serving cell and last fix result.
pub fn status_line(cell: Option<&str>, last_fix: &str) -> String {
    format!("Tower: {} | Last Fix: {last_fix}", cell.unwrap_or("N/A"))
}

/// Truncates to whole seconds, for display.
pub fn whole_secs(d: SignedDuration) -> SignedDuration {
    SignedDuration::from_secs(d.as_secs())
}
