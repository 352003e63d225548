//! Handshake engine boundary.
//!
//! The channel delegates all cryptography to an opaque, stateful engine that
//! consumes and produces protocol records one at a time: `wrap` turns
//! plaintext into ciphertext, `unwrap` turns ciphertext back into plaintext,
//! and either may advance the handshake state machine as a side effect. Any
//! concrete TLS implementation (for example a bindings layer over a native
//! TLS library, or the `rustls` adapter behind the `rustls` feature) can
//! satisfy this trait; the channel never looks inside a record.

use crate::vectored::{GatherBuf, ScatterBuf};
use std::fmt;

/// Outcome classification of a single `wrap` or `unwrap` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    /// The record was processed.
    Ok,
    /// The destination cannot hold the output; grow it and retry.
    BufferOverflow,
    /// The source does not hold a complete record; feed more bytes and retry.
    BufferUnderflow,
    /// The close-notification record was processed (unwrap) or emitted (wrap).
    Closed,
}

/// What the engine needs next to make handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// No handshake in progress.
    NotHandshaking,
    /// The engine must produce a record; call `wrap`.
    NeedWrap,
    /// The engine must consume a record; call `unwrap`.
    NeedUnwrap,
    /// A delegated task must run to completion before the handshake can
    /// continue.
    NeedTask,
    /// The handshake just completed.
    Finished,
}

/// Result of a single `wrap` or `unwrap` call.
#[derive(Debug, Clone, Copy)]
pub struct EngineResult {
    pub status: EngineStatus,
    pub handshake: HandshakeStatus,
    /// Bytes consumed from the source.
    pub consumed: usize,
    /// Bytes produced into the destination.
    pub produced: usize,
}

/// A protocol or cryptographic failure reported by the engine.
///
/// Always fatal to the channel: malformed records and failed verification
/// have no retry path.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct EngineError {
    message: String,
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        EngineError {
            message: message.into(),
        }
    }
}

/// A unit of CPU-bound work delegated by the engine.
///
/// Engines that offload expensive computation (certificate verification, key
/// derivation) surface it as tasks; the handshake reports `NeedTask` until
/// every outstanding task has run.
pub struct Task(Box<dyn FnOnce() + Send>);

impl Task {
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Task(Box::new(f))
    }

    /// Run the task to completion on the calling thread.
    pub fn run(self) {
        (self.0)()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Task")
    }
}

/// The opaque record-layer codec plus key-exchange state machine.
///
/// # Contract
///
/// - `wrap` consumes plaintext from `src` (advancing it by `consumed`) and
///   writes at most one record into `dst`, returning `BufferOverflow` with
///   nothing written when `dst` is too small. During a handshake, `wrap`
///   produces handshake records and consumes nothing.
/// - `unwrap` consumes at most one record from the front of `src` and writes
///   the recovered plaintext into `dst`. `BufferUnderflow` means `src` does
///   not yet hold a complete record; `BufferOverflow` means `dst` cannot
///   hold the record's plaintext and must grow before retrying. Bytes the
///   engine reports as consumed are owned by the engine from that point on:
///   a retry after `BufferOverflow` must not re-feed them.
/// - `Closed` from `unwrap` reports the peer's close-notification; `Closed`
///   from `wrap` reports that the outbound side is closed and the
///   close-notification record (if any remained) has been produced.
pub trait HandshakeEngine: Send {
    /// Encrypt plaintext from `src` into `dst`.
    fn wrap(&mut self, src: &mut GatherBuf<'_>, dst: &mut [u8]) -> Result<EngineResult, EngineError>;

    /// Decrypt one record from `src` into `dst`.
    fn unwrap(
        &mut self,
        src: &[u8],
        dst: &mut ScatterBuf<'_, '_>,
    ) -> Result<EngineResult, EngineError>;

    /// What the engine needs next.
    fn handshake_status(&self) -> HandshakeStatus;

    /// Start (or restart) a handshake. Restarting after the initial
    /// handshake is a renegotiation; engines that do not support it fail.
    fn begin_handshake(&mut self) -> Result<(), EngineError>;

    /// Take one outstanding delegated task, if any.
    fn take_task(&mut self) -> Option<Task>;

    /// Mark the outbound side closed. Subsequent `wrap` calls produce the
    /// close-notification record and then report `Closed`.
    fn close_outbound(&mut self);

    /// True once the close-notification has been produced by `wrap`.
    fn is_outbound_done(&self) -> bool;

    /// True once the peer's close-notification has been consumed by
    /// `unwrap`.
    fn is_inbound_done(&self) -> bool;

    /// Largest wire record `wrap` can produce. Sizes the ciphertext buffers.
    fn max_record_size(&self) -> usize;

    /// Largest plaintext payload a single record can carry. Sizes the
    /// plaintext spill buffer.
    fn max_plaintext_size(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_task_runs_once() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let task = Task::new(move || {
            flag.store(true, Ordering::Release);
        });
        task.run();
        assert!(ran.load(Ordering::Acquire));
    }

    #[test]
    fn test_task_debug() {
        let task = Task::new(|| {});
        assert_eq!(format!("{:?}", task), "Task");
    }

    #[test]
    fn test_engine_error_display() {
        let err = EngineError::new("bad record mac");
        assert_eq!(err.to_string(), "bad record mac");
    }

    #[test]
    fn test_status_equality() {
        assert_eq!(EngineStatus::Ok, EngineStatus::Ok);
        assert_ne!(EngineStatus::Ok, EngineStatus::Closed);
        assert_eq!(HandshakeStatus::NeedWrap, HandshakeStatus::NeedWrap);
        assert_ne!(HandshakeStatus::NeedWrap, HandshakeStatus::NeedUnwrap);
    }
}
