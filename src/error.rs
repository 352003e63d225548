//! Error and flow-control signal types.
//!
//! The channel distinguishes retryable flow-control signals (the non-blocking
//! contract) from terminal failures. `ChannelError::is_retryable` is the
//! dividing line: retryable variants never invalidate the channel, everything
//! else does.

use crate::engine::{EngineError, Task};
use std::io;

/// Errors and flow-control signals raised by a channel operation.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The transport must become readable before the operation can make
    /// progress. Retry after read readiness.
    #[error("transport read readiness required")]
    NeedsRead,

    /// The transport must accept more bytes before the operation can make
    /// progress. Retry after write readiness.
    #[error("transport write readiness required")]
    NeedsWrite,

    /// Delegated handshake tasks must run before the operation can make
    /// progress. Run the carried tasks, then retry.
    #[error("delegated handshake tasks must be run")]
    NeedsTask(Vec<Task>),

    /// The channel is closed or invalid; no further operations will succeed.
    #[error("channel is closed")]
    Closed,

    /// The caller supplied an argument the operation cannot honor.
    #[error("invalid argument: {0}")]
    InvalidInput(&'static str),

    /// A protocol or cryptographic failure. Fatal to the channel.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A transport I/O failure. Fatal to the channel.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl ChannelError {
    /// True for flow-control signals: the operation may be retried once the
    /// signaled condition is satisfied, and the channel remains usable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChannelError::NeedsRead | ChannelError::NeedsWrite | ChannelError::NeedsTask(_)
        )
    }
}

impl From<EngineError> for ChannelError {
    fn from(e: EngineError) -> Self {
        ChannelError::Protocol(e.to_string())
    }
}

/// Failures reported to asynchronous completion handlers.
///
/// Timeouts and cancellations are their own conditions, never conflated with
/// transport errors.
#[derive(Debug, thiserror::Error)]
pub enum GroupError {
    /// The operation's deadline passed before it completed.
    #[error("operation timed out")]
    Timeout,

    /// The operation was cancelled (explicitly or by closing the channel).
    #[error("operation cancelled")]
    Cancelled,

    /// A read is already pending on this channel.
    #[error("a read is already pending on this channel")]
    ReadPending,

    /// A write is already pending on this channel.
    #[error("a write is already pending on this channel")]
    WritePending,

    /// The group is shut down and not accepting work.
    #[error("channel group is shut down")]
    Shutdown,

    /// The underlying channel operation failed.
    #[error(transparent)]
    Channel(#[from] ChannelError),
}
