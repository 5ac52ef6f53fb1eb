use thiserror::Error;

use crate::channel::ChannelHandle;
use crate::record::RecordKind;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("a consumer is already registered")]
    AlreadyRegistered,

    #[error("notification channel {0} could not be resolved")]
    InvalidChannel(ChannelHandle),

    #[error("no consumer is connected")]
    NotConnected,

    #[error("no records are queued")]
    Empty,

    #[error("buffer too small: record needs {required} bytes")]
    TooSmall { required: usize },

    #[error("unknown record type tag {0:#x}")]
    UnknownRecordType(u32),

    #[error("{kind:?} payload must be {expected} bytes, got {actual}")]
    PayloadSize {
        kind: RecordKind,
        expected: usize,
        actual: usize,
    },

    #[error("record truncated: need {needed} bytes, have {actual}")]
    Truncated { needed: usize, actual: usize },

    #[error("request queue module already initialised")]
    AlreadyInitialized,

    #[error("request queue module not initialised")]
    NotInitialized,
}

impl QueueError {
    /// Size hint echoed back by `get`: `0` when the queue was empty, the exact
    /// record size when the buffer was too small.
    pub fn required_size(&self) -> Option<usize> {
        match self {
            QueueError::Empty => Some(0),
            QueueError::TooSmall { required } => Some(*required),
            _ => None,
        }
    }
}
