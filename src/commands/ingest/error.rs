use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

use crate::model::ErrorKind;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("source unavailable: {0:#}")]
    SourceUnavailable(anyhow::Error),
    #[error("malformed input: {0:#}")]
    MalformedInput(anyhow::Error),
    #[error("store unavailable: {0:#}")]
    StoreUnavailable(anyhow::Error),
    #[error("cancelled by operator")]
    Cancelled,
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SourceUnavailable(_) => ErrorKind::SourceUnavailable,
            Self::MalformedInput(_) => ErrorKind::MalformedInput,
            Self::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedInput(anyhow::anyhow!(message.into()))
    }

    pub fn source_unavailable(message: impl Into<String>) -> Self {
        Self::SourceUnavailable(anyhow::anyhow!(message.into()))
    }
}

/// Tags an untyped failure with the error kind the orchestrator reports.
pub(crate) trait StageResultExt<T> {
    fn or_source_unavailable(self) -> Result<T, PipelineError>;
    fn or_malformed(self) -> Result<T, PipelineError>;
    fn or_store_unavailable(self) -> Result<T, PipelineError>;
}

impl<T, E> StageResultExt<T> for Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn or_source_unavailable(self) -> Result<T, PipelineError> {
        self.map_err(|err| PipelineError::SourceUnavailable(err.into()))
    }

    fn or_malformed(self) -> Result<T, PipelineError> {
        self.map_err(|err| PipelineError::MalformedInput(err.into()))
    }

    fn or_store_unavailable(self) -> Result<T, PipelineError> {
        self.map_err(|err| PipelineError::StoreUnavailable(err.into()))
    }
}

#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    cancelled: Arc<AtomicBool>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), PipelineError> {
        if self.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        Ok(())
    }
}
