//! The tier used when a source isn't configured or isn't permitted.

use async_trait::async_trait;

use crate::model::Fix;

use super::{AttachmentSource, BatchSender, FixSource, SourceError};

/// A source that refuses every request with [`SourceError::Unavailable`].
pub struct UnavailableSource {
    reason: String,
}

impl UnavailableSource {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl FixSource for UnavailableSource {
    async fn request_fix(&self) -> Result<Fix, SourceError> {
        Err(SourceError::Unavailable(self.reason.clone()))
    }
}

impl AttachmentSource for UnavailableSource {
    fn register(&self, _batches: BatchSender) -> Result<(), SourceError> {
        Err(SourceError::Unavailable(self.reason.clone()))
    }

    fn unregister(&self) {}
}
