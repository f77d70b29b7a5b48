//! Command tier: sources backed by external programs.
//!
//! - The fix command runs once per request and prints one JSON fix
//!   (`{"latitude":..,"longitude":..,"accuracy":..,"time":".."}`) on stdout.
//!   Printing nothing or `null` means "no fix".
//! - The attachment command runs for as long as the listener is registered
//!   and prints one JSON array of cell candidates per line.
//!
//! Children are killed when the request or the listener is dropped.

use std::{
    io,
    process::Stdio,
    sync::{Mutex, PoisonError},
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::model::{CellCandidate, Fix};

use super::{AttachmentSource, BatchSender, FixSource, SourceError};

pub struct CommandFixSource {
    program: String,
    args: Vec<String>,
}

impl CommandFixSource {
    pub fn new(program: impl Into<String>, args: &[String]) -> Self {
        Self {
            program: program.into(),
            args: args.to_vec(),
        }
    }
}

#[async_trait]
impl FixSource for CommandFixSource {
    async fn request_fix(&self) -> Result<Fix, SourceError> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| spawn_error(&self.program, &e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SourceError::Failed(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        parse_fix(&String::from_utf8_lossy(&output.stdout))
    }
}

fn parse_fix(stdout: &str) -> Result<Fix, SourceError> {
    let text = stdout.trim();
    if text.is_empty() || text == "null" {
        return Err(SourceError::NoFix);
    }
    serde_json::from_str(text).map_err(|e| SourceError::Failed(format!("invalid fix: {e}")))
}

pub struct CommandAttachmentSource {
    program: String,
    args: Vec<String>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl CommandAttachmentSource {
    pub fn new(program: impl Into<String>, args: &[String]) -> Self {
        Self {
            program: program.into(),
            args: args.to_vec(),
            listener: Mutex::new(None),
        }
    }
}

impl AttachmentSource for CommandAttachmentSource {
    fn register(&self, batches: BatchSender) -> Result<(), SourceError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| SourceError::Unavailable("no async runtime".into()))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(&self.program, &e))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SourceError::Failed("attachment command stdout not captured".into()))?;
        let program = self.program.clone();

        let task = runtime.spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => {}
                    Ok(Some(line)) => match serde_json::from_str::<Vec<CellCandidate>>(&line) {
                        Ok(batch) => {
                            if batches.send(batch).await.is_err() {
                                debug!(%program, "Attachment receiver closed");
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(%program, error = %e, "Skipping malformed attachment batch");
                        }
                    },
                    Ok(None) => {
                        warn!(%program, "Attachment command closed its output");
                        break;
                    }
                    Err(e) => {
                        warn!(%program, error = %e, "Failed to read attachment command output");
                        break;
                    }
                }
            }
            // Dropping the child kills it if it is still running. Dropping
            // `batches` tells the agent this listener is gone.
            drop(child);
        });

        let mut slot = self.listener.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = slot.replace(task) {
            previous.abort();
        }
        Ok(())
    }

    fn unregister(&self) {
        let mut slot = self.listener.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = slot.take() {
            task.abort();
        }
    }
}

impl Drop for CommandAttachmentSource {
    fn drop(&mut self) {
        self.unregister();
    }
}

fn spawn_error(program: &str, e: &io::Error) -> SourceError {
    match e.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => {
            SourceError::Unavailable(format!("{program}: {e}"))
        }
        _ => SourceError::Failed(format!("{program}: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use jiff::Timestamp;
    use tokio::sync::mpsc;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[test]
    fn parse_fix_reads_json() {
        let fix = parse_fix(
            r#"{"latitude":52.52,"longitude":13.405,"accuracy":8.5,"time":"2024-05-01T12:00:00Z"}"#,
        )
        .unwrap();
        assert!((fix.latitude - 52.52).abs() < f64::EPSILON);
        assert_eq!(fix.accuracy, Some(8.5));
        assert_eq!(fix.time, "2024-05-01T12:00:00Z".parse::<Timestamp>().unwrap());
    }

    #[test]
    fn parse_fix_empty_or_null_is_no_fix() {
        assert!(matches!(parse_fix(""), Err(SourceError::NoFix)));
        assert!(matches!(parse_fix("null\n"), Err(SourceError::NoFix)));
    }

    #[test]
    fn parse_fix_garbage_is_failure() {
        assert!(matches!(parse_fix("lat=1"), Err(SourceError::Failed(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn fix_command_success() {
        let source = CommandFixSource::new(
            "sh",
            &sh(r#"echo '{"latitude":1.0,"longitude":2.0,"time":"2024-05-01T12:00:00Z"}'"#),
        );
        let fix = source.request_fix().await.unwrap();
        assert!((fix.longitude - 2.0).abs() < f64::EPSILON);
        assert_eq!(fix.accuracy, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn fix_command_nonzero_exit_is_failure() {
        let source = CommandFixSource::new("sh", &sh("echo 'no gps' >&2; exit 3"));
        let err = source.request_fix().await.unwrap_err();
        assert!(matches!(err, SourceError::Failed(msg) if msg.contains("no gps")));
    }

    #[tokio::test]
    async fn missing_program_is_unavailable() {
        let source = CommandFixSource::new("/nonexistent/cellwatch-fix", &[]);
        let err = source.request_fix().await.unwrap_err();
        assert!(matches!(err, SourceError::Unavailable(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn attachment_command_delivers_batches() {
        let source = CommandAttachmentSource::new(
            "sh",
            &sh(r#"echo 'not json'; echo '[{"identifier":"11","isPrimary":true},{"identifier":"12"}]'; sleep 5"#),
        );
        let (tx, mut rx) = mpsc::channel(4);

        source.register(tx).unwrap();

        let batch = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.len(), 2);
        assert!(batch[0].is_primary);

        source.unregister();
    }

    #[tokio::test]
    async fn attachment_missing_program_is_unavailable() {
        let source = CommandAttachmentSource::new("/nonexistent/cellwatch-cells", &[]);
        let (tx, _rx) = mpsc::channel(1);
        assert!(matches!(
            source.register(tx),
            Err(SourceError::Unavailable(_))
        ));
    }
}
