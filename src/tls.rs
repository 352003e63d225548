//! Handshake engine backed by rustls.
//!
//! `RustlsEngine` adapts a `rustls::Connection` (client or server) to the
//! `HandshakeEngine` contract: ciphertext moves through `read_tls` /
//! `write_tls`, plaintext through the connection's reader and writer, and
//! the handshake status is derived from the connection's wants. rustls does
//! not support renegotiation or delegated tasks; `begin_handshake` on an
//! established session fails and `take_task` is always empty.

use crate::engine::{
    EngineError, EngineResult, EngineStatus, HandshakeEngine, HandshakeStatus, Task,
};
use crate::vectored::{GatherBuf, ScatterBuf};
use rustls::pki_types::ServerName;
use std::io::{Read, Write};
use std::sync::Arc;

/// Largest TLS record on the wire (plaintext limit plus header, MAC, and
/// padding headroom).
const MAX_WIRE_RECORD: usize = 16 * 1024 + 512;

/// Largest plaintext payload a single record carries.
const MAX_PLAINTEXT: usize = 16 * 1024;

/// A `HandshakeEngine` over a rustls client or server connection.
pub struct RustlsEngine {
    conn: rustls::Connection,
    outbound_closed: bool,
    inbound_closed: bool,
}

impl RustlsEngine {
    /// Client-mode engine for the given server name.
    pub fn client(config: Arc<rustls::ClientConfig>, server_name: &str) -> Result<Self, EngineError> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|e| EngineError::new(format!("invalid server name: {e}")))?;
        let conn = rustls::ClientConnection::new(config, name)
            .map_err(|e| EngineError::new(e.to_string()))?;
        Ok(RustlsEngine {
            conn: conn.into(),
            outbound_closed: false,
            inbound_closed: false,
        })
    }

    /// Server-mode engine.
    pub fn server(config: Arc<rustls::ServerConfig>) -> Result<Self, EngineError> {
        let conn =
            rustls::ServerConnection::new(config).map_err(|e| EngineError::new(e.to_string()))?;
        Ok(RustlsEngine {
            conn: conn.into(),
            outbound_closed: false,
            inbound_closed: false,
        })
    }

    /// Client configuration trusting the bundled web PKI roots.
    pub fn client_config() -> Arc<rustls::ClientConfig> {
        let root_store =
            rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        )
    }

    /// Client configuration with ALPN protocols.
    pub fn client_config_with_alpn(protocols: Vec<Vec<u8>>) -> Arc<rustls::ClientConfig> {
        let root_store =
            rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let mut config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        config.alpn_protocols = protocols;
        Arc::new(config)
    }

    /// The negotiated ALPN protocol, if any.
    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        self.conn.alpn_protocol()
    }

    fn hs_status(&self) -> HandshakeStatus {
        if self.conn.is_handshaking() {
            if self.conn.wants_write() {
                HandshakeStatus::NeedWrap
            } else {
                HandshakeStatus::NeedUnwrap
            }
        } else {
            HandshakeStatus::NotHandshaking
        }
    }
}

impl HandshakeEngine for RustlsEngine {
    fn wrap(&mut self, src: &mut GatherBuf<'_>, dst: &mut [u8]) -> Result<EngineResult, EngineError> {
        let mut consumed = 0;
        if !self.conn.is_handshaking() && !self.outbound_closed {
            // Feed at most one record's worth of plaintext per call.
            let mut quota = MAX_PLAINTEXT.min(src.remaining());
            while quota > 0 {
                let Some(chunk) = src.chunk() else { break };
                let take = chunk.len().min(quota);
                let n = self
                    .conn
                    .writer()
                    .write(&chunk[..take])
                    .map_err(|e| EngineError::new(format!("tls write: {e}")))?;
                src.advance(n);
                consumed += n;
                quota -= n;
                if n < take {
                    break;
                }
            }
        }

        let mut produced = 0;
        {
            let mut sink: &mut [u8] = dst;
            while self.conn.wants_write() {
                match self.conn.write_tls(&mut sink) {
                    Ok(0) => {
                        // Destination full with records still queued.
                        if produced == 0 && consumed == 0 {
                            return Ok(EngineResult {
                                status: EngineStatus::BufferOverflow,
                                handshake: self.hs_status(),
                                consumed,
                                produced,
                            });
                        }
                        break;
                    }
                    Ok(n) => produced += n,
                    Err(e) => return Err(EngineError::new(format!("tls write: {e}"))),
                }
            }
        }

        let status = if self.outbound_closed && !self.conn.wants_write() {
            EngineStatus::Closed
        } else {
            EngineStatus::Ok
        };
        Ok(EngineResult {
            status,
            handshake: self.hs_status(),
            consumed,
            produced,
        })
    }

    fn unwrap(
        &mut self,
        src: &[u8],
        dst: &mut ScatterBuf<'_, '_>,
    ) -> Result<EngineResult, EngineError> {
        let mut consumed = 0;
        if !src.is_empty() {
            let mut rd: &[u8] = src;
            consumed = self
                .conn
                .read_tls(&mut rd)
                .map_err(|e| EngineError::new(format!("tls read: {e}")))?;
        }

        let state = self
            .conn
            .process_new_packets()
            .map_err(|e| EngineError::new(e.to_string()))?;

        let mut produced = 0;
        let mut available = state.plaintext_bytes_to_read();
        while available > 0 {
            let Some(chunk) = dst.chunk_mut() else { break };
            match self.conn.reader().read(chunk) {
                Ok(0) => break,
                Ok(n) => {
                    dst.advance(n);
                    produced += n;
                    available -= n.min(available);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(EngineError::new(format!("tls read: {e}"))),
            }
        }

        if state.peer_has_closed() {
            self.inbound_closed = true;
        }

        // Never report overflow after delivering bytes: rustls keeps the
        // remainder buffered and the next call picks it up.
        let status = if produced == 0 && available > 0 {
            EngineStatus::BufferOverflow
        } else if state.peer_has_closed() && available == 0 && produced == 0 {
            EngineStatus::Closed
        } else if consumed == 0 && produced == 0 && self.conn.wants_read() {
            EngineStatus::BufferUnderflow
        } else {
            EngineStatus::Ok
        };
        Ok(EngineResult {
            status,
            handshake: self.hs_status(),
            consumed,
            produced,
        })
    }

    fn handshake_status(&self) -> HandshakeStatus {
        self.hs_status()
    }

    fn begin_handshake(&mut self) -> Result<(), EngineError> {
        if self.conn.is_handshaking() {
            return Ok(());
        }
        Err(EngineError::new("renegotiation is not supported by rustls"))
    }

    fn take_task(&mut self) -> Option<Task> {
        None
    }

    fn close_outbound(&mut self) {
        if !self.outbound_closed {
            self.conn.send_close_notify();
            self.outbound_closed = true;
        }
    }

    fn is_outbound_done(&self) -> bool {
        self.outbound_closed && !self.conn.wants_write()
    }

    fn is_inbound_done(&self) -> bool {
        self.inbound_closed
    }

    fn max_record_size(&self) -> usize {
        MAX_WIRE_RECORD
    }

    fn max_plaintext_size(&self) -> usize {
        MAX_PLAINTEXT
    }
}
