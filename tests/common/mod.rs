//! Shared test fixtures: a deterministic record engine and in-memory duplex
//! pipes.
//!
//! The mock engine frames records as `[type: u8][len: u32 BE][payload]` with
//! an XOR "cipher", a two-message HELLO/ACK handshake (optionally gated on a
//! delegated task), renegotiation, and a close record. It exercises every
//! status the channel reacts to without any real cryptography.
#![allow(dead_code)]

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tls_channel::engine::{
    EngineError, EngineResult, EngineStatus, HandshakeEngine, HandshakeStatus, Task,
};
use tls_channel::transport::Duplex;
use tls_channel::vectored::{GatherBuf, ScatterBuf};
use tls_channel::TlsChannel;

const HEADER: usize = 5;
const MAX_PAYLOAD: usize = 4096;
const MASK: u8 = 0x5A;

const REC_HELLO: u8 = 1;
const REC_ACK: u8 = 2;
const REC_DATA: u8 = 3;
const REC_CLOSE: u8 = 4;

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

enum Phase {
    /// Handshake not started.
    Idle,
    /// Client: must send HELLO.
    SendHello,
    /// Client: waiting for the server's ACK.
    AwaitAck,
    /// Server: waiting for the client's HELLO.
    AwaitHello,
    /// Server: a delegated task gates the ACK.
    TaskBeforeAck { done: Arc<AtomicBool>, taken: bool },
    /// Server: must send ACK.
    SendAck,
    /// Handshake complete; data flows.
    Established,
}

pub struct MockEngine {
    role: Role,
    phase: Phase,
    use_task: bool,
    outbound_closed: bool,
    close_sent: bool,
    inbound_closed: bool,
}

impl MockEngine {
    pub fn client() -> Self {
        MockEngine::new(Role::Client, false)
    }

    pub fn server() -> Self {
        MockEngine::new(Role::Server, false)
    }

    /// Server variant whose handshake requires a delegated task before the
    /// ACK goes out.
    pub fn server_with_task() -> Self {
        MockEngine::new(Role::Server, true)
    }

    fn new(role: Role, use_task: bool) -> Self {
        MockEngine {
            role,
            phase: Phase::Idle,
            use_task,
            outbound_closed: false,
            close_sent: false,
            inbound_closed: false,
        }
    }

    fn frame(dst: &mut [u8], kind: u8, payload_len: usize) {
        dst[0] = kind;
        dst[1..HEADER].copy_from_slice(&(payload_len as u32).to_be_bytes());
    }

    fn result(&self, status: EngineStatus, consumed: usize, produced: usize) -> EngineResult {
        EngineResult {
            status,
            handshake: self.status_for_phase(),
            consumed,
            produced,
        }
    }

    fn status_for_phase(&self) -> HandshakeStatus {
        match &self.phase {
            Phase::Idle | Phase::Established => HandshakeStatus::NotHandshaking,
            Phase::SendHello | Phase::SendAck => HandshakeStatus::NeedWrap,
            Phase::AwaitAck | Phase::AwaitHello => HandshakeStatus::NeedUnwrap,
            Phase::TaskBeforeAck { done, .. } => {
                if done.load(Ordering::Acquire) {
                    HandshakeStatus::NeedWrap
                } else {
                    HandshakeStatus::NeedTask
                }
            }
        }
    }

    fn handshake_record_kind(&mut self) -> Option<u8> {
        match &self.phase {
            Phase::SendHello => Some(REC_HELLO),
            Phase::SendAck => Some(REC_ACK),
            Phase::TaskBeforeAck { done, .. } if done.load(Ordering::Acquire) => Some(REC_ACK),
            _ => None,
        }
    }
}

impl HandshakeEngine for MockEngine {
    fn wrap(&mut self, src: &mut GatherBuf<'_>, dst: &mut [u8]) -> Result<EngineResult, EngineError> {
        if self.outbound_closed {
            if self.close_sent {
                return Ok(self.result(EngineStatus::Closed, 0, 0));
            }
            if dst.len() < HEADER {
                return Ok(self.result(EngineStatus::BufferOverflow, 0, 0));
            }
            Self::frame(dst, REC_CLOSE, 0);
            self.close_sent = true;
            return Ok(self.result(EngineStatus::Closed, 0, HEADER));
        }

        if let Some(kind) = self.handshake_record_kind() {
            if dst.len() < HEADER {
                return Ok(self.result(EngineStatus::BufferOverflow, 0, 0));
            }
            Self::frame(dst, kind, 0);
            self.phase = match kind {
                REC_HELLO => Phase::AwaitAck,
                _ => Phase::Established,
            };
            return Ok(self.result(EngineStatus::Ok, 0, HEADER));
        }

        match &self.phase {
            Phase::Established => {
                if src.is_empty() {
                    return Ok(self.result(EngineStatus::Ok, 0, 0));
                }
                if dst.len() < HEADER + 1 {
                    return Ok(self.result(EngineStatus::BufferOverflow, 0, 0));
                }
                let payload = src
                    .remaining()
                    .min(MAX_PAYLOAD)
                    .min(dst.len() - HEADER);
                let mut tmp = vec![0u8; payload];
                let copied = src.copy_to(&mut tmp);
                assert_eq!(copied, payload);
                for (i, byte) in tmp.iter().enumerate() {
                    dst[HEADER + i] = byte ^ MASK;
                }
                Self::frame(dst, REC_DATA, payload);
                Ok(self.result(EngineStatus::Ok, payload, HEADER + payload))
            }
            // Mid-handshake wrap with nothing to send.
            _ => Ok(self.result(EngineStatus::Ok, 0, 0)),
        }
    }

    fn unwrap(
        &mut self,
        src: &[u8],
        dst: &mut ScatterBuf<'_, '_>,
    ) -> Result<EngineResult, EngineError> {
        if src.len() < HEADER {
            return Ok(self.result(EngineStatus::BufferUnderflow, 0, 0));
        }
        let kind = src[0];
        let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if len > MAX_PAYLOAD {
            return Err(EngineError::new("oversized record"));
        }
        if src.len() < HEADER + len {
            return Ok(self.result(EngineStatus::BufferUnderflow, 0, 0));
        }
        let consumed = HEADER + len;

        match kind {
            REC_HELLO => {
                self.phase = if self.use_task {
                    Phase::TaskBeforeAck {
                        done: Arc::new(AtomicBool::new(false)),
                        taken: false,
                    }
                } else {
                    Phase::SendAck
                };
                Ok(self.result(EngineStatus::Ok, consumed, 0))
            }
            REC_ACK => {
                self.phase = Phase::Established;
                Ok(self.result(EngineStatus::Ok, consumed, 0))
            }
            REC_CLOSE => {
                self.inbound_closed = true;
                Ok(self.result(EngineStatus::Closed, consumed, 0))
            }
            REC_DATA => {
                if dst.remaining() < len {
                    return Ok(self.result(EngineStatus::BufferOverflow, 0, 0));
                }
                let plain: Vec<u8> = src[HEADER..consumed].iter().map(|b| b ^ MASK).collect();
                let put = dst.put(&plain);
                assert_eq!(put, len);
                Ok(self.result(EngineStatus::Ok, consumed, len))
            }
            _ => Err(EngineError::new("unknown record type")),
        }
    }

    fn handshake_status(&self) -> HandshakeStatus {
        self.status_for_phase()
    }

    fn begin_handshake(&mut self) -> Result<(), EngineError> {
        match self.phase {
            Phase::Idle | Phase::Established => {
                self.phase = match self.role {
                    Role::Client => Phase::SendHello,
                    Role::Server => Phase::AwaitHello,
                };
                Ok(())
            }
            // Already handshaking.
            _ => Ok(()),
        }
    }

    fn take_task(&mut self) -> Option<Task> {
        if let Phase::TaskBeforeAck { done, taken } = &mut self.phase {
            if !*taken && !done.load(Ordering::Acquire) {
                *taken = true;
                let done = done.clone();
                return Some(Task::new(move || {
                    done.store(true, Ordering::Release);
                }));
            }
        }
        None
    }

    fn close_outbound(&mut self) {
        self.outbound_closed = true;
    }

    fn is_outbound_done(&self) -> bool {
        self.close_sent
    }

    fn is_inbound_done(&self) -> bool {
        self.inbound_closed
    }

    fn max_record_size(&self) -> usize {
        HEADER + MAX_PAYLOAD
    }

    fn max_plaintext_size(&self) -> usize {
        MAX_PAYLOAD
    }
}

// ── in-memory duplex pipes ──────────────────────────────────────────────

struct Lane {
    queue: Mutex<(VecDeque<u8>, bool)>,
    readable: Condvar,
}

impl Lane {
    fn new() -> Arc<Lane> {
        Arc::new(Lane {
            queue: Mutex::new((VecDeque::new(), false)),
            readable: Condvar::new(),
        })
    }
}

/// One end of an in-memory duplex byte stream.
///
/// `chunk` caps how many bytes a single `write` accepts, simulating a
/// transport that fragments aggressively; `nonblocking` turns empty reads
/// into `WouldBlock` instead of waiting.
pub struct PipeEnd {
    incoming: Arc<Lane>,
    outgoing: Arc<Lane>,
    chunk: usize,
    nonblocking: bool,
}

impl Clone for PipeEnd {
    fn clone(&self) -> Self {
        PipeEnd {
            incoming: self.incoming.clone(),
            outgoing: self.outgoing.clone(),
            chunk: self.chunk,
            nonblocking: self.nonblocking,
        }
    }
}

pub fn pipe_pair(chunk: usize, nonblocking: bool) -> (PipeEnd, PipeEnd) {
    let a_to_b = Lane::new();
    let b_to_a = Lane::new();
    let a = PipeEnd {
        incoming: b_to_a.clone(),
        outgoing: a_to_b.clone(),
        chunk,
        nonblocking,
    };
    let b = PipeEnd {
        incoming: a_to_b,
        outgoing: b_to_a,
        chunk,
        nonblocking,
    };
    (a, b)
}

impl Duplex for PipeEnd {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut guard = self.incoming.queue.lock();
        loop {
            let (queue, closed) = &mut *guard;
            if !queue.is_empty() {
                let n = buf.len().min(queue.len());
                for slot in buf.iter_mut().take(n) {
                    *slot = queue.pop_front().unwrap();
                }
                return Ok(n);
            }
            if *closed {
                return Ok(0);
            }
            if self.nonblocking {
                return Err(io::Error::from(io::ErrorKind::WouldBlock));
            }
            self.incoming.readable.wait(&mut guard);
        }
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self.outgoing.queue.lock();
        let (queue, closed) = &mut *guard;
        if *closed {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        let n = buf.len().min(self.chunk);
        queue.extend(&buf[..n]);
        self.outgoing.readable.notify_all();
        Ok(n)
    }

    fn shutdown(&self) -> io::Result<()> {
        for lane in [&self.incoming, &self.outgoing] {
            let mut guard = lane.queue.lock();
            guard.1 = true;
            lane.readable.notify_all();
        }
        Ok(())
    }
}

/// A connected client/server channel pair over in-memory pipes.
pub fn channel_pair(chunk: usize) -> (TlsChannel<PipeEnd>, TlsChannel<PipeEnd>) {
    let (a, b) = pipe_pair(chunk, false);
    let client = TlsChannel::builder(a, MockEngine::client()).build();
    let server = TlsChannel::builder(b, MockEngine::server()).build();
    (client, server)
}

/// A connected pair of non-blocking std TCP streams on loopback.
pub fn tcp_pair() -> (std::net::TcpStream, std::net::TcpStream) {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = std::net::TcpStream::connect(addr).unwrap();
    let (server, _) = listener.accept().unwrap();
    client.set_nonblocking(true).unwrap();
    server.set_nonblocking(true).unwrap();
    client.set_nodelay(true).unwrap();
    server.set_nodelay(true).unwrap();
    (client, server)
}
