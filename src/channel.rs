//! The secure channel state machine.
//!
//! `TlsChannel` turns a handshake engine's record-level signals (needs more
//! ciphertext, needs to emit ciphertext, needs a CPU task, produced
//! plaintext) into a byte-channel read/write contract with correct partial
//! I/O, handshake interleaving, and orderly shutdown. The same code paths
//! serve blocking and non-blocking transports: a blocking transport simply
//! never raises `WouldBlock`, so the flow-control signals never fire.
//!
//! # Locking
//!
//! The channel is safe for concurrent callers through three cooperating
//! locks plus a short-lived engine lock, always acquired in this order:
//!
//! 1. `init_lock`: serializes handshake initiation;
//! 2. `read_state`: incoming ciphertext and plaintext spillover;
//! 3. `write_state`: outgoing ciphertext;
//! 4. `engine`: one wrap/unwrap call at a time, never held across a
//!    transport call.
//!
//! A read and a write proceed concurrently except during a handshake, which
//! holds both sides for its duration; a concurrent writer can therefore
//! block behind a reader's handshake step and vice versa.

use crate::alloc::{BufferAllocator, HeapAllocator, ZeroingAllocator};
use crate::arena::{BufferArena, ReadBuffers, WriteBuffers};
use crate::engine::{EngineResult, EngineStatus, HandshakeEngine, HandshakeStatus};
use crate::error::ChannelError;
use crate::transport::Duplex;
use crate::vectored::{GatherBuf, ScatterBuf};
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, trace};

type SessionCallback = Box<dyn Fn() + Send + Sync>;

/// Builder for a `TlsChannel`.
///
/// # Example
///
/// ```ignore
/// let channel = TlsChannel::builder(stream, engine)
///     .run_tasks(false)
///     .wait_close_notify(true)
///     .session_established(|| println!("session up"))
///     .build();
/// ```
pub struct ChannelBuilder<S> {
    io: S,
    engine: Box<dyn HandshakeEngine>,
    run_tasks: bool,
    wait_close_notify: bool,
    release_buffers: bool,
    cipher_alloc: Arc<dyn BufferAllocator>,
    plain_alloc: Arc<dyn BufferAllocator>,
    session_cb: Option<SessionCallback>,
}

impl<S: Duplex> ChannelBuilder<S> {
    /// Run delegated engine tasks inline on the calling thread (default)
    /// instead of surfacing them through `ChannelError::NeedsTask`.
    pub fn run_tasks(mut self, run: bool) -> Self {
        self.run_tasks = run;
        self
    }

    /// Wait for the peer's close-notification during `close()`.
    pub fn wait_close_notify(mut self, wait: bool) -> Self {
        self.wait_close_notify = wait;
        self
    }

    /// Release channel buffers back to their allocators whenever they drain.
    pub fn release_buffers(mut self, release: bool) -> Self {
        self.release_buffers = release;
        self
    }

    /// Allocator for ciphertext buffers. Default: plain heap.
    pub fn ciphertext_allocator(mut self, alloc: Arc<dyn BufferAllocator>) -> Self {
        self.cipher_alloc = alloc;
        self
    }

    /// Allocator for plaintext buffers. Default: zeroing heap, so decrypted
    /// bytes are scrubbed on free.
    pub fn plaintext_allocator(mut self, alloc: Arc<dyn BufferAllocator>) -> Self {
        self.plain_alloc = alloc;
        self
    }

    /// Callback invoked once, the first time a handshake completes.
    pub fn session_established(mut self, cb: impl Fn() + Send + Sync + 'static) -> Self {
        self.session_cb = Some(Box::new(cb));
        self
    }

    pub fn build(self) -> TlsChannel<S> {
        let max_record = self.engine.max_record_size();
        let max_plaintext = self.engine.max_plaintext_size();
        let arena = BufferArena::new(
            self.cipher_alloc,
            self.plain_alloc,
            max_record,
            max_plaintext,
            self.release_buffers,
        );
        let (read, write) = arena.split();
        TlsChannel {
            io: self.io,
            engine: Mutex::new(self.engine),
            read_state: Mutex::new(read),
            write_state: Mutex::new(write),
            init_lock: Mutex::new(()),
            negotiated: AtomicBool::new(false),
            invalid: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown_sent: AtomicBool::new(false),
            shutdown_received: AtomicBool::new(false),
            run_tasks: self.run_tasks,
            wait_close_notify: self.wait_close_notify,
            session_cb: self.session_cb,
        }
    }
}

/// Outcome of one attempt to decode buffered ciphertext.
enum ReadStep {
    /// Plaintext was delivered to the caller's destination.
    Produced(usize),
    /// The stream ended (close-notification or transport EOF).
    Eof,
    /// Progress was made (or more ciphertext arrived); decode again.
    Again,
    /// The engine wants the handshake driven before more plaintext flows.
    Handshake,
}

enum Fill {
    Bytes(usize),
    Eof,
}

/// A secure byte channel over a duplex transport.
pub struct TlsChannel<S> {
    io: S,
    engine: Mutex<Box<dyn HandshakeEngine>>,
    read_state: Mutex<ReadBuffers>,
    write_state: Mutex<WriteBuffers>,
    init_lock: Mutex<()>,
    /// A handshake has completed at least once.
    negotiated: AtomicBool,
    /// Unrecoverable transport or protocol failure; terminal.
    invalid: AtomicBool,
    /// `close()` was called; terminal.
    closed: AtomicBool,
    /// Our close-notification has been sent.
    shutdown_sent: AtomicBool,
    /// The peer's close-notification has been received.
    shutdown_received: AtomicBool,
    run_tasks: bool,
    wait_close_notify: bool,
    session_cb: Option<SessionCallback>,
}

impl<S: Duplex> TlsChannel<S> {
    /// Start building a channel over `io` driven by `engine`.
    pub fn builder(io: S, engine: impl HandshakeEngine + 'static) -> ChannelBuilder<S> {
        ChannelBuilder {
            io,
            engine: Box::new(engine),
            run_tasks: true,
            wait_close_notify: false,
            release_buffers: false,
            cipher_alloc: Arc::new(HeapAllocator),
            plain_alloc: Arc::new(ZeroingAllocator),
            session_cb: None,
        }
    }

    /// The underlying transport.
    pub fn get_ref(&self) -> &S {
        &self.io
    }

    /// True once a handshake has completed.
    pub fn is_negotiated(&self) -> bool {
        self.negotiated.load(Ordering::Acquire)
    }

    /// True once the peer's close-notification has been received.
    pub fn shutdown_received(&self) -> bool {
        self.shutdown_received.load(Ordering::Acquire)
    }

    /// True once our close-notification has been sent.
    pub fn shutdown_sent(&self) -> bool {
        self.shutdown_sent.load(Ordering::Acquire)
    }

    /// Read decrypted bytes into `dst`.
    ///
    /// Returns the number of bytes read, or `Ok(0)` at end-of-stream (after
    /// the peer's close-notification) and for zero-length destinations.
    /// Drives the handshake transparently when the engine requires it.
    pub fn read(&self, dst: &mut ScatterBuf<'_, '_>) -> Result<usize, ChannelError> {
        if dst.remaining() == 0 {
            return Ok(0);
        }
        self.ensure_open()?;
        loop {
            // Deliver spilled plaintext before anything else.
            {
                let mut rs = self.read_state.lock();
                if !rs.in_plain.is_empty() {
                    let n = dst.put(rs.in_plain.data());
                    rs.in_plain.consume(n);
                    rs.in_plain.maybe_release();
                    return Ok(n);
                }
            }

            self.handshake_if_needed()?;

            let mut rs = self.read_state.lock();
            if !rs.in_plain.is_empty() {
                // The handshake step spilled plaintext; restart to drain it.
                continue;
            }
            if self.shutdown_received.load(Ordering::Acquire) {
                return Ok(0);
            }

            loop {
                match self.read_step(&mut rs, dst)? {
                    ReadStep::Produced(n) => return Ok(n),
                    ReadStep::Eof => return Ok(0),
                    ReadStep::Again => {
                        if !rs.in_plain.is_empty() {
                            let n = dst.put(rs.in_plain.data());
                            rs.in_plain.consume(n);
                            rs.in_plain.maybe_release();
                            return Ok(n);
                        }
                    }
                    ReadStep::Handshake => break,
                }
            }
            // Release the read state before driving the handshake.
        }
    }

    /// Read into a single contiguous buffer.
    pub fn read_buf(&self, dst: &mut [u8]) -> Result<usize, ChannelError> {
        let mut slices: [&mut [u8]; 1] = [dst];
        let mut scatter = ScatterBuf::new(&mut slices);
        self.read(&mut scatter)
    }

    /// Write plaintext from `src`, encrypting record by record.
    ///
    /// Returns the number of source bytes consumed. A short count means the
    /// transport accepted fewer bytes than were produced; the remaining
    /// ciphertext is flushed by the next call. On a non-blocking transport a
    /// call that makes no progress raises `NeedsWrite` instead.
    pub fn write(&self, src: &mut GatherBuf<'_>) -> Result<usize, ChannelError> {
        if src.remaining() == 0 {
            return Ok(0);
        }
        self.ensure_open()?;
        let mut total = 0usize;
        let result = loop {
            if let Err(e) = self.handshake_if_needed() {
                break Err(e);
            }
            let mut ws = self.write_state.lock();

            // Finish flushing ciphertext left over from an earlier short
            // write before wrapping more.
            if !ws.out_cipher.is_empty() {
                if let Err(e) = self.flush(&mut ws) {
                    break Err(e);
                }
                if !ws.out_cipher.is_empty() {
                    break Err(ChannelError::NeedsWrite);
                }
            }

            if src.remaining() == 0 {
                break Ok(());
            }

            let res = {
                let mut engine = self.engine.lock();
                match engine.wrap(src, ws.out_cipher.spare()) {
                    Ok(r) => r,
                    Err(e) => break Err(self.fatal(e.into())),
                }
            };
            ws.out_cipher.commit(res.produced);
            total += res.consumed;
            trace!(
                consumed = res.consumed,
                produced = res.produced,
                "wrapped record"
            );

            match res.status {
                EngineStatus::Ok => {
                    if let Err(e) = self.flush(&mut ws) {
                        break Err(e);
                    }
                    if !ws.out_cipher.is_empty() {
                        break Err(ChannelError::NeedsWrite);
                    }
                    if matches!(
                        res.handshake,
                        HandshakeStatus::NeedUnwrap | HandshakeStatus::NeedTask
                    ) {
                        // The engine wants the read side; release the write
                        // lock and drive the handshake from the top.
                        continue;
                    }
                    if src.remaining() == 0 {
                        break Ok(());
                    }
                }
                EngineStatus::BufferOverflow => {
                    if !ws.out_cipher.grow() {
                        // At the cap; only a flush can make space.
                        if let Err(e) = self.flush(&mut ws) {
                            break Err(e);
                        }
                        if !ws.out_cipher.is_empty() {
                            break Err(ChannelError::NeedsWrite);
                        }
                    }
                }
                EngineStatus::BufferUnderflow => {
                    unreachable!("handshake engine reported buffer underflow from wrap")
                }
                EngineStatus::Closed => break Err(ChannelError::Closed),
            }
        };
        match result {
            Ok(()) => Ok(total),
            // Partial progress is reported as a short write; the caller
            // retries for the remainder. NeedsTask always propagates: the
            // carried tasks must reach the caller.
            Err(ChannelError::NeedsRead | ChannelError::NeedsWrite) if total > 0 => Ok(total),
            Err(e) => Err(e),
        }
    }

    /// Write a single contiguous buffer.
    pub fn write_buf(&self, src: &[u8]) -> Result<usize, ChannelError> {
        let slices: [&[u8]; 1] = [src];
        let mut gather = GatherBuf::new(&slices);
        self.write(&mut gather)
    }

    /// Run the initial handshake if it has not completed yet.
    pub fn handshake(&self) -> Result<(), ChannelError> {
        self.ensure_open()?;
        if self.negotiated.load(Ordering::Acquire) {
            return Ok(());
        }
        self.handshake_impl(true)
    }

    /// Start a new handshake over an established session.
    pub fn renegotiate(&self) -> Result<(), ChannelError> {
        self.ensure_open()?;
        let _init = self.init_lock.lock();
        let mut rs = self.read_state.lock();
        let mut ws = self.write_state.lock();
        {
            let mut engine = self.engine.lock();
            if let Err(e) = engine.begin_handshake() {
                return Err(self.fatal(e.into()));
            }
        }
        self.handshake_loop(&mut rs, &mut ws)
    }

    /// Send our close-notification and report whether the bidirectional
    /// close has completed.
    ///
    /// The first successful call sends the close record and returns true only
    /// if the peer's close-notification was already received. Subsequent
    /// calls read until the peer's notification arrives; on a non-blocking
    /// transport this raises `NeedsRead` and must be retried. Idempotent once
    /// it has returned true.
    pub fn shutdown(&self) -> Result<bool, ChannelError> {
        if self.invalid.load(Ordering::Acquire) || self.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        self.shutdown_inner()
    }

    /// Close the channel: best-effort close-notification, then close both
    /// transport directions and release buffers. Never fails; safe to call
    /// repeatedly.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if !self.invalid.load(Ordering::Acquire) {
            let _ = self.shutdown_inner();
            if self.wait_close_notify {
                let _ = self.shutdown_inner();
            }
        }
        let _ = self.io.shutdown();
        self.read_state.lock().release_all();
        self.write_state.lock().release_all();
        debug!("channel closed");
    }

    // ── internals ────────────────────────────────────────────────────────

    fn ensure_open(&self) -> Result<(), ChannelError> {
        if self.invalid.load(Ordering::Acquire) || self.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        Ok(())
    }

    /// Mark the channel unusable and pass the error through. Flow-control
    /// signals never come through here.
    fn fatal(&self, e: ChannelError) -> ChannelError {
        debug_assert!(!e.is_retryable());
        self.invalid.store(true, Ordering::Release);
        e
    }

    fn handshake_if_needed(&self) -> Result<(), ChannelError> {
        if !self.negotiated.load(Ordering::Acquire) {
            return self.handshake_impl(true);
        }
        let status = self.engine.lock().handshake_status();
        match status {
            HandshakeStatus::NeedWrap | HandshakeStatus::NeedUnwrap | HandshakeStatus::NeedTask => {
                self.handshake_impl(false)
            }
            _ => Ok(()),
        }
    }

    fn handshake_impl(&self, begin_if_idle: bool) -> Result<(), ChannelError> {
        let _init = self.init_lock.lock();
        let mut rs = self.read_state.lock();
        let mut ws = self.write_state.lock();
        if begin_if_idle && !self.negotiated.load(Ordering::Acquire) {
            let mut engine = self.engine.lock();
            if engine.handshake_status() == HandshakeStatus::NotHandshaking {
                if let Err(e) = engine.begin_handshake() {
                    drop(engine);
                    return Err(self.fatal(e.into()));
                }
            }
        }
        self.handshake_loop(&mut rs, &mut ws)
    }

    /// Drive the handshake until the engine reports it is done. Holds both
    /// the read and write state: wrap and unwrap may occur on either side
    /// regardless of which operation the caller invoked.
    fn handshake_loop(
        &self,
        rs: &mut ReadBuffers,
        ws: &mut WriteBuffers,
    ) -> Result<(), ChannelError> {
        loop {
            let status = self.engine.lock().handshake_status();
            match status {
                HandshakeStatus::NotHandshaking | HandshakeStatus::Finished => {
                    if !self.negotiated.swap(true, Ordering::AcqRel) {
                        debug!("handshake complete");
                        if let Some(cb) = &self.session_cb {
                            cb();
                        }
                    }
                    return Ok(());
                }
                HandshakeStatus::NeedTask => {
                    if self.run_tasks {
                        loop {
                            let task = self.engine.lock().take_task();
                            match task {
                                Some(t) => t.run(),
                                None => break,
                            }
                        }
                    } else {
                        let mut tasks = Vec::new();
                        let mut engine = self.engine.lock();
                        while let Some(t) = engine.take_task() {
                            tasks.push(t);
                        }
                        return Err(ChannelError::NeedsTask(tasks));
                    }
                }
                HandshakeStatus::NeedWrap => {
                    let res = {
                        let mut engine = self.engine.lock();
                        let empty: [&[u8]; 0] = [];
                        let mut src = GatherBuf::new(&empty);
                        match engine.wrap(&mut src, ws.out_cipher.spare()) {
                            Ok(r) => r,
                            Err(e) => return Err(self.fatal(e.into())),
                        }
                    };
                    ws.out_cipher.commit(res.produced);
                    match res.status {
                        EngineStatus::Ok | EngineStatus::Closed => {
                            self.flush(ws)?;
                            if !ws.out_cipher.is_empty() {
                                return Err(ChannelError::NeedsWrite);
                            }
                        }
                        EngineStatus::BufferOverflow => {
                            if !ws.out_cipher.grow() {
                                self.flush(ws)?;
                                if !ws.out_cipher.is_empty() {
                                    return Err(ChannelError::NeedsWrite);
                                }
                            }
                        }
                        EngineStatus::BufferUnderflow => {
                            unreachable!("handshake engine reported buffer underflow from wrap")
                        }
                    }
                }
                HandshakeStatus::NeedUnwrap => {
                    let res = self.unwrap_into_plain(rs)?;
                    match res.status {
                        EngineStatus::BufferUnderflow => match self.fill_cipher(rs)? {
                            Fill::Bytes(_) => {}
                            Fill::Eof => {
                                return Err(self.fatal(ChannelError::Io(io::Error::new(
                                    io::ErrorKind::UnexpectedEof,
                                    "transport closed during handshake",
                                ))));
                            }
                        },
                        EngineStatus::Closed => {
                            self.shutdown_received.store(true, Ordering::Release);
                            if !self.negotiated.load(Ordering::Acquire) {
                                return Err(self.fatal(ChannelError::Protocol(
                                    "peer closed during handshake".into(),
                                )));
                            }
                            return Ok(());
                        }
                        _ => {
                            if res.consumed == 0 && res.produced == 0 {
                                // No progress on buffered bytes; need more.
                                match self.fill_cipher(rs)? {
                                    Fill::Bytes(_) => {}
                                    Fill::Eof => {
                                        return Err(self.fatal(ChannelError::Io(io::Error::new(
                                            io::ErrorKind::UnexpectedEof,
                                            "transport closed during handshake",
                                        ))));
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    /// One decode attempt against the caller's destination.
    fn read_step(
        &self,
        rs: &mut ReadBuffers,
        dst: &mut ScatterBuf<'_, '_>,
    ) -> Result<ReadStep, ChannelError> {
        let res = {
            let mut engine = self.engine.lock();
            match engine.unwrap(rs.in_cipher.data(), dst) {
                Ok(r) => r,
                Err(e) => return Err(self.fatal(e.into())),
            }
        };
        rs.in_cipher.consume(res.consumed);
        trace!(
            consumed = res.consumed,
            produced = res.produced,
            "unwrapped record"
        );

        match res.status {
            EngineStatus::Closed => {
                self.shutdown_received.store(true, Ordering::Release);
                if res.produced > 0 {
                    Ok(ReadStep::Produced(res.produced))
                } else {
                    Ok(ReadStep::Eof)
                }
            }
            EngineStatus::BufferUnderflow => match self.fill_cipher(rs)? {
                Fill::Bytes(_) => Ok(ReadStep::Again),
                Fill::Eof => Ok(ReadStep::Eof),
            },
            EngineStatus::BufferOverflow => {
                // The record does not fit the caller's destination: spill
                // through in_plain, sized at least twice the destination so
                // grow/retry cycles stay logarithmic.
                rs.in_plain.grow_to(dst.capacity().saturating_mul(2));
                let spilled = self.unwrap_into_plain(rs)?;
                match spilled.status {
                    EngineStatus::Closed => {
                        self.shutdown_received.store(true, Ordering::Release);
                        if rs.in_plain.is_empty() {
                            Ok(ReadStep::Eof)
                        } else {
                            Ok(ReadStep::Again)
                        }
                    }
                    EngineStatus::BufferUnderflow => match self.fill_cipher(rs)? {
                        Fill::Bytes(_) => Ok(ReadStep::Again),
                        Fill::Eof => Ok(ReadStep::Eof),
                    },
                    _ => {
                        if matches!(
                            spilled.handshake,
                            HandshakeStatus::NeedWrap | HandshakeStatus::NeedTask
                        ) {
                            Ok(ReadStep::Handshake)
                        } else {
                            Ok(ReadStep::Again)
                        }
                    }
                }
            }
            EngineStatus::Ok => {
                if res.produced > 0 {
                    return Ok(ReadStep::Produced(res.produced));
                }
                if matches!(
                    res.handshake,
                    HandshakeStatus::NeedWrap | HandshakeStatus::NeedTask
                ) {
                    return Ok(ReadStep::Handshake);
                }
                if rs.in_cipher.is_empty() || res.consumed == 0 {
                    match self.fill_cipher(rs)? {
                        Fill::Bytes(_) => Ok(ReadStep::Again),
                        Fill::Eof => Ok(ReadStep::Eof),
                    }
                } else {
                    Ok(ReadStep::Again)
                }
            }
        }
    }

    /// Decode into `in_plain`, growing it as the engine demands.
    fn unwrap_into_plain(&self, rs: &mut ReadBuffers) -> Result<EngineResult, ChannelError> {
        loop {
            if rs.in_plain.spare().is_empty() && !rs.in_plain.grow() {
                return Err(self.fatal(ChannelError::Protocol(
                    "plaintext record exceeds engine maximum".into(),
                )));
            }
            let res = {
                let ReadBuffers { in_cipher, in_plain } = rs;
                let mut slices: [&mut [u8]; 1] = [in_plain.spare()];
                let mut dst = ScatterBuf::new(&mut slices);
                let mut engine = self.engine.lock();
                match engine.unwrap(in_cipher.data(), &mut dst) {
                    Ok(r) => r,
                    Err(e) => return Err(self.fatal(e.into())),
                }
            };
            rs.in_cipher.consume(res.consumed);
            rs.in_plain.commit(res.produced);
            if res.status == EngineStatus::BufferOverflow {
                if !rs.in_plain.grow() {
                    return Err(self.fatal(ChannelError::Protocol(
                        "plaintext record exceeds engine maximum".into(),
                    )));
                }
                continue;
            }
            return Ok(res);
        }
    }

    /// Pull more ciphertext from the transport into `in_cipher`.
    fn fill_cipher(&self, rs: &mut ReadBuffers) -> Result<Fill, ChannelError> {
        if rs.in_cipher.spare().is_empty() && !rs.in_cipher.grow() {
            return Err(self.fatal(ChannelError::Protocol(
                "incoming record exceeds engine maximum".into(),
            )));
        }
        match self.io.read(rs.in_cipher.spare()) {
            Ok(0) => Ok(Fill::Eof),
            Ok(n) => {
                rs.in_cipher.commit(n);
                Ok(Fill::Bytes(n))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(ChannelError::NeedsRead),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(Fill::Bytes(0)),
            Err(e) => Err(self.fatal(e.into())),
        }
    }

    /// Push buffered ciphertext to the transport. Stops without error when
    /// the transport cannot accept more; the caller inspects `out_cipher`.
    fn flush(&self, ws: &mut WriteBuffers) -> Result<(), ChannelError> {
        while !ws.out_cipher.is_empty() {
            match self.io.write(ws.out_cipher.data()) {
                Ok(0) => break,
                Ok(n) => ws.out_cipher.consume(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.fatal(e.into())),
            }
        }
        if ws.out_cipher.is_empty() {
            ws.out_cipher.maybe_release();
        }
        Ok(())
    }

    fn shutdown_inner(&self) -> Result<bool, ChannelError> {
        if !self.shutdown_sent.load(Ordering::Acquire) {
            let mut ws = self.write_state.lock();
            self.engine.lock().close_outbound();
            loop {
                let res = {
                    let mut engine = self.engine.lock();
                    let empty: [&[u8]; 0] = [];
                    let mut src = GatherBuf::new(&empty);
                    match engine.wrap(&mut src, ws.out_cipher.spare()) {
                        Ok(r) => r,
                        Err(e) => return Err(self.fatal(e.into())),
                    }
                };
                ws.out_cipher.commit(res.produced);
                match res.status {
                    EngineStatus::Ok | EngineStatus::Closed => {
                        self.flush(&mut ws)?;
                        if !ws.out_cipher.is_empty() {
                            return Err(ChannelError::NeedsWrite);
                        }
                        if self.engine.lock().is_outbound_done() {
                            break;
                        }
                    }
                    EngineStatus::BufferOverflow => {
                        if !ws.out_cipher.grow() {
                            self.flush(&mut ws)?;
                            if !ws.out_cipher.is_empty() {
                                return Err(ChannelError::NeedsWrite);
                            }
                        }
                    }
                    EngineStatus::BufferUnderflow => {
                        unreachable!("handshake engine reported buffer underflow from wrap")
                    }
                }
            }
            self.shutdown_sent.store(true, Ordering::Release);
            debug!("close notification sent");
            return Ok(self.shutdown_received.load(Ordering::Acquire));
        }

        if self.shutdown_received.load(Ordering::Acquire) {
            return Ok(true);
        }

        // Our notification is out; read until the peer's arrives.
        let mut rs = self.read_state.lock();
        loop {
            let res = self.unwrap_into_plain(&mut rs)?;
            match res.status {
                EngineStatus::Closed => {
                    self.shutdown_received.store(true, Ordering::Release);
                    return Ok(true);
                }
                EngineStatus::BufferUnderflow => match self.fill_cipher(&mut rs)? {
                    Fill::Bytes(_) => {}
                    Fill::Eof => {
                        return Err(self.fatal(ChannelError::Io(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "transport closed before close notification",
                        ))));
                    }
                },
                // Application data while waiting lands in in_plain and stays
                // readable.
                _ => {
                    if res.consumed == 0 && res.produced == 0 {
                        match self.fill_cipher(&mut rs)? {
                            Fill::Bytes(_) => {}
                            Fill::Eof => {
                                return Err(self.fatal(ChannelError::Io(io::Error::new(
                                    io::ErrorKind::UnexpectedEof,
                                    "transport closed before close notification",
                                ))));
                            }
                        }
                    }
                }
            }
        }
    }
}

impl<S> Drop for TlsChannel<S> {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            self.read_state.lock().release_all();
            self.write_state.lock().release_all();
        }
    }
}
