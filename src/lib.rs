//! tls-channel - Streaming secure channels over an opaque handshake engine.
//!
//! This crate adapts a record-oriented TLS handshake engine (anything that
//! can wrap plaintext into records and unwrap records into plaintext) into a
//! byte-channel abstraction with correct partial I/O, handshake
//! interleaving, and orderly shutdown, in three modes:
//!
//! - **Blocking**: `TlsChannel` over a blocking transport reads and writes
//!   like a socket.
//! - **Non-blocking**: the same channel over a non-blocking transport raises
//!   flow-control signals (`NeedsRead`, `NeedsWrite`, `NeedsTask`) instead
//!   of blocking; the caller retries after readiness.
//! - **Asynchronous**: a `ChannelGroup` multiplexes many channels from one
//!   selector thread, running I/O attempts and completion callbacks on a
//!   bounded worker pool with per-operation timeouts and cancellation.
//!
//! # Quick Start
//!
//! ```ignore
//! use tls_channel::{ChannelGroup, TlsChannel};
//!
//! // Blocking mode: the channel drives the handshake on first use.
//! let channel = TlsChannel::builder(stream, engine).build();
//! channel.write_buf(b"hello")?;
//! let mut buf = [0u8; 1024];
//! let n = channel.read_buf(&mut buf)?;
//!
//! // Asynchronous mode: register with a group and start operations.
//! let group = ChannelGroup::builder().workers(4).build()?;
//! let handle = group.register(channel)?;
//! group.start_read(&handle, bufs, Some(timeout), |bufs, result| {
//!     // runs on a worker thread, exactly once
//! })?;
//! ```
//!
//! # Features
//!
//! - `tls`: a concrete `HandshakeEngine` backed by rustls
//!   (`tls_channel::tls::RustlsEngine`).
//!
//! The cryptographic protocol itself is out of scope: the engine is an
//! opaque capability, and transports are plain duplex byte streams.

pub mod alloc;
pub mod arena;
mod channel;
pub mod engine;
mod error;
mod group;
mod timer;
pub mod transport;
pub mod vectored;

#[cfg(feature = "tls")]
pub mod tls;

// Public API re-exports
pub use alloc::{AllocStats, BufferAllocator, HeapAllocator, TrackingAllocator, ZeroingAllocator};
pub use channel::{ChannelBuilder, TlsChannel};
pub use engine::{EngineError, EngineResult, EngineStatus, HandshakeEngine, HandshakeStatus, Task};
pub use error::{ChannelError, GroupError};
pub use group::{ChannelGroup, CompletionHandler, GroupBuilder, RegisteredChannel};
pub use transport::Duplex;
pub use vectored::{GatherBuf, ScatterBuf};
