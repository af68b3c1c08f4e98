//! Errors - エラー型と分類
//!
//! worq の fallible な操作はすべて [`WorqError`] を返します。ディスパッチループが
//! 区別するのは [`WorqError::TaskNotFound`] と [`WorqError::TaskRejected`] の二つだけで、
//! handler が返すそれ以外のエラーは一時的なものとして扱います。

use thiserror::Error;

/// ErrorKind groups errors by how they propagate.
///
/// - Configuration / Transport: surfaced to the caller of `register`,
///   `start`, or `enqueue`.
/// - Envelope / Application / Rejection: contained inside per-message
///   handling; only the ack/nack outcome is affected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Transport,
    Envelope,
    Application,
    Rejection,
}

#[derive(Debug, Error)]
pub enum WorqError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("missing field: {field}")]
    MissingField { field: &'static str },

    #[error("unsupported content type: {0:?}")]
    UnsupportedContentType(String),

    #[error("decode: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("cannot find task {0:?}")]
    TaskNotFound(String),

    #[error("task rejected; requeue: {requeue}")]
    TaskRejected { requeue: bool },

    #[error("consumer is closed")]
    ConsumerClosed,

    #[error("message requested before the consumer was advanced")]
    NoCurrentMessage,

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("transport: {0}")]
    Transport(String),

    #[error("{0}")]
    Handler(String),
}

impl WorqError {
    /// Shorthand for handler failures that should be retried.
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler(message.into())
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) | Self::Conflict(_) => ErrorKind::Configuration,
            Self::Transport(_) | Self::ConsumerClosed | Self::NoCurrentMessage => {
                ErrorKind::Transport
            }
            Self::MissingField { .. }
            | Self::UnsupportedContentType(_)
            | Self::Decode(_)
            | Self::MalformedMessage(_)
            | Self::TaskNotFound(_) => ErrorKind::Envelope,
            Self::TaskRejected { .. } => ErrorKind::Rejection,
            Self::Handler(_) => ErrorKind::Application,
        }
    }
}
