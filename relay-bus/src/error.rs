use std::sync::Arc;

use crate::frame::SourceId;

/// Failures surfaced by the relay. A viewer disconnecting and a frame dropped
/// for a slow viewer are ordinary events and have no variant here.
#[derive(Clone, Debug, thiserror::Error)]
pub enum RelayError {
    #[error("source {source_id} unavailable: {reason}")]
    SourceUnavailable { source_id: SourceId, reason: String },

    #[error("upstream of {source_id} lost: {reason}")]
    UpstreamLost { source_id: SourceId, reason: String },

    #[error("unknown source: {0}")]
    UnknownSource(SourceId),

    #[error("framing error: {0}")]
    Framing(String),

    #[error("io error: {0}")]
    Io(Arc<std::io::Error>),
}

impl RelayError {
    pub fn source_unavailable(source_id: &SourceId, reason: impl Into<String>) -> Self {
        Self::SourceUnavailable {
            source_id: source_id.clone(),
            reason: reason.into(),
        }
    }

    pub fn upstream_lost(source_id: &SourceId, reason: impl Into<String>) -> Self {
        Self::UpstreamLost {
            source_id: source_id.clone(),
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}
