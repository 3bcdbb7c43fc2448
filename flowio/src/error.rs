//! Error types for streams and the runtime

use std::error::Error as StdError;
use std::sync::Arc;

use crate::idgen::StreamId;

/// Shared, thread-safe cause carried by stream errors
pub type Cause = Arc<dyn StdError + Send + Sync>;

/// Errors delivered through the `error` event of a stream
///
/// Cloneable: the same error may reach several listeners, and a pipe
/// forwards it from the source to the target.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StreamError {
    /// A producer failed to generate data
    #[error("source failed: {0}")]
    Source(Cause),

    /// A consumer failed to accept data
    #[error("target failed: {0}")]
    Target(Cause),

    /// A transformation callback failed
    #[error("transform failed: {0}")]
    Transform(Cause),

    /// A source error forwarded through a pipe
    #[error("piped from stream {origin}: {inner}")]
    Pipe {
        origin: StreamId,
        inner: Box<StreamError>,
    },

    #[error("write after end")]
    WriteAfterEnd,

    #[error("write to an errored stream")]
    Errored,
}

impl StreamError {
    pub fn from_source<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Source(Arc::new(error))
    }

    pub fn from_target<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Target(Arc::new(error))
    }

    pub fn from_transform<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Transform(Arc::new(error))
    }

    /// Source error from a plain message
    pub fn source_msg(msg: impl Into<String>) -> Self {
        Self::Source(Arc::new(Message(msg.into())))
    }

    /// Target error from a plain message
    pub fn target_msg(msg: impl Into<String>) -> Self {
        Self::Target(Arc::new(Message(msg.into())))
    }

    /// Transform error from a plain message
    pub fn transform_msg(msg: impl Into<String>) -> Self {
        Self::Transform(Arc::new(Message(msg.into())))
    }

    /// Wrap for forwarding through a pipe.
    ///
    /// An error that already went through a pipe keeps its original origin,
    /// so chained pipes never nest the wrapper.
    #[must_use]
    pub fn wrap_for_pipe(self, origin: StreamId) -> Self {
        match self {
            Self::Pipe { .. } => self,
            other => Self::Pipe {
                origin,
                inner: Box::new(other),
            },
        }
    }

    /// The stream that raised a piped error
    #[must_use]
    pub fn pipe_origin(&self) -> Option<StreamId> {
        match self {
            Self::Pipe { origin, .. } => Some(*origin),
            _ => None,
        }
    }

    /// The error without any pipe wrapper
    #[must_use]
    pub fn root(&self) -> &StreamError {
        match self {
            Self::Pipe { inner, .. } => inner.root(),
            other => other,
        }
    }
}

/// Plain text error cause
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct Message(pub String);

/// Errors of the runtime context itself
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    #[error("runtime torn down with {0} pending operations")]
    PendingWork(usize),

    #[error("runtime torn down with {0} queued continuations")]
    QueuedTasks(usize),

    #[error("runtime is already running")]
    AlreadyRunning,
}
