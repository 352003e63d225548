//! Transport boundary.
//!
//! The channel moves ciphertext over a byte-oriented duplex transport. The
//! contract follows the standard library's conventions: `Ok(0)` from `read`
//! is end-of-stream, and `WouldBlock` from either direction means a
//! non-blocking transport cannot make progress right now (the channel turns
//! it into a flow-control signal instead of blocking).
//!
//! Receivers take `&self` so a reader and a writer can drive the same
//! transport concurrently, the way `&TcpStream` implements `Read` and
//! `Write`.

use std::io::{self, Read, Write};
use std::net::Shutdown;

/// A duplex byte stream.
pub trait Duplex: Send + Sync {
    /// Read available bytes into `buf`. Returns `Ok(0)` at end-of-stream and
    /// `WouldBlock` when a non-blocking transport has no data.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write bytes from `buf`. Returns `WouldBlock` (or `Ok(0)`) when a
    /// non-blocking transport has no buffer space.
    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Close both directions of the transport.
    fn shutdown(&self) -> io::Result<()>;
}

impl Duplex for std::net::TcpStream {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut stream = self;
        Read::read(&mut stream, buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let mut stream = self;
        Write::write(&mut stream, buf)
    }

    fn shutdown(&self) -> io::Result<()> {
        match std::net::TcpStream::shutdown(self, Shutdown::Both) {
            Ok(()) => Ok(()),
            // Already closed by the peer; nothing left to do.
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Duplex for mio::net::TcpStream {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut stream = self;
        Read::read(&mut stream, buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let mut stream = self;
        Write::write(&mut stream, buf)
    }

    fn shutdown(&self) -> io::Result<()> {
        match mio::net::TcpStream::shutdown(self, Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e),
        }
    }
}
