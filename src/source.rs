//! Signal sources: where attachment batches and fixes come from.
//!
//! Each source is a trait with one implementation per capability tier.
//! The tier is chosen once, at startup, from configuration.

mod command;
mod unavailable;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::info;

pub use command::{CommandAttachmentSource, CommandFixSource};
pub use unavailable::UnavailableSource;

use crate::config::SourcesConfig;
use crate::model::{CellCandidate, Fix};

/// Channel on which attachment batches are delivered.
pub type BatchSender = mpsc::Sender<Vec<CellCandidate>>;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// Permission or hardware denial. Not retried by the caller.
    #[error("source unavailable: {0}")]
    Unavailable(String),

    /// The source answered, but without a position.
    #[error("no fix available")]
    NoFix,

    #[error("request failed: {0}")]
    Failed(String),
}

/// Answers bounded, on-demand position requests.
///
/// Dropping the returned future cancels the request.
#[async_trait]
pub trait FixSource: Send + Sync {
    async fn request_fix(&self) -> Result<Fix, SourceError>;
}

/// Delivers a batch whenever the network attachment changes.
pub trait AttachmentSource: Send + Sync {
    /// Starts delivering batches to `batches`, replacing any previous listener.
    fn register(&self, batches: BatchSender) -> Result<(), SourceError>;

    /// Stops delivering batches.
    fn unregister(&self);
}

/// The sources selected for this process.
#[derive(Clone)]
pub struct Sources {
    pub fix: Arc<dyn FixSource>,
    pub attachment: Arc<dyn AttachmentSource>,
}

/// Picks a capability tier for each source from configuration.
pub fn select(config: &SourcesConfig) -> Sources {
    let fix: Arc<dyn FixSource> = match config.fix_command.split_first() {
        Some((program, args)) => {
            info!(%program, "Fix source: command");
            Arc::new(CommandFixSource::new(program, args))
        }
        None => {
            info!("Fix source: unavailable (no fix-command configured)");
            Arc::new(UnavailableSource::new("no fix-command configured"))
        }
    };
    let attachment: Arc<dyn AttachmentSource> = match config.attachment_command.split_first() {
        Some((program, args)) => {
            info!(%program, "Attachment source: command");
            Arc::new(CommandAttachmentSource::new(program, args))
        }
        None => {
            info!("Attachment source: unavailable (no attachment-command configured)");
            Arc::new(UnavailableSource::new("no attachment-command configured"))
        }
    };
    Sources { fix, attachment }
}
