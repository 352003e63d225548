//! Per-channel buffer arena.
//!
//! Each channel owns three growable buffers: `in_cipher` accumulates
//! ciphertext read from the transport until a full record is available,
//! `in_plain` holds decrypted bytes that did not fit the caller's destination
//! (overflow spillover), and `out_cipher` accumulates ciphertext pending a
//! transport write. Buffers are allocated lazily, grow geometrically up to an
//! engine-derived cap, and are reallocated in place: contents are copied to a
//! fresh allocation and the old one is returned to the allocator (which, for
//! plaintext, zero-fills it).
//!
//! The arena splits into a read half and a write half so a concurrent reader
//! and writer never contend on each other's buffers.

use crate::alloc::BufferAllocator;
use bytes::BytesMut;
use std::sync::Arc;

/// Initial capacity for lazily-allocated buffers. Grows on demand; most
/// handshake records fit without growth.
const INITIAL_CAPACITY: usize = 4096;

/// One lazily-allocated, growable buffer with a consumed-prefix cursor.
///
/// Data lives in `buf[read_pos..len]`; `spare`/`commit` expose the tail for
/// transport reads and engine output, `data`/`consume` the head for engine
/// input and caller copies.
pub struct BufSlot {
    alloc: Arc<dyn BufferAllocator>,
    buf: Option<BytesMut>,
    read_pos: usize,
    initial: usize,
    max: usize,
    release_empty: bool,
}

impl BufSlot {
    fn new(alloc: Arc<dyn BufferAllocator>, initial: usize, max: usize, release_empty: bool) -> Self {
        BufSlot {
            alloc,
            buf: None,
            read_pos: 0,
            initial: initial.min(max),
            max,
            release_empty,
        }
    }

    /// Unconsumed bytes held by the slot.
    pub fn len(&self) -> usize {
        self.buf.as_ref().map_or(0, |b| b.len() - self.read_pos)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current allocation size, zero if not yet allocated.
    pub fn capacity(&self) -> usize {
        self.buf.as_ref().map_or(0, |b| b.capacity())
    }

    /// Maximum size this slot may grow to.
    pub fn max_size(&self) -> usize {
        self.max
    }

    pub fn is_allocated(&self) -> bool {
        self.buf.is_some()
    }

    /// The unconsumed bytes.
    pub fn data(&self) -> &[u8] {
        self.buf.as_ref().map_or(&[], |b| &b[self.read_pos..])
    }

    /// Mark `n` bytes consumed from the front. Resets the cursor once the
    /// slot drains so the full capacity is reusable.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the unconsumed length.
    pub fn consume(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        let buf = self.buf.as_mut().expect("consume on unallocated slot");
        assert!(self.read_pos + n <= buf.len(), "consume past end of slot");
        self.read_pos += n;
        if self.read_pos == buf.len() {
            buf.clear();
            self.read_pos = 0;
        }
    }

    /// The writable tail of the buffer, allocating lazily.
    pub fn spare(&mut self) -> &mut [u8] {
        self.ensure();
        let buf = self.buf.as_mut().unwrap();
        let len = buf.len();
        let cap = buf.capacity();
        // Safety: the spare capacity is exclusively ours until `commit`
        // records how much of it was written; mirrors the loan discipline of
        // a kernel-owned recv buffer.
        unsafe { std::slice::from_raw_parts_mut(buf.as_mut_ptr().add(len), cap - len) }
    }

    /// Record `n` bytes written into the slice returned by `spare`.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the spare capacity.
    pub fn commit(&mut self, n: usize) {
        let buf = self.buf.as_mut().expect("commit on unallocated slot");
        assert!(
            buf.len() + n <= buf.capacity(),
            "commit exceeds spare capacity"
        );
        // Safety: `n` bytes past `len` were just written via `spare`.
        unsafe {
            buf.set_len(buf.len() + n);
        }
    }

    /// Double the capacity (bounded by the slot maximum). Returns false when
    /// already at the maximum.
    pub fn grow(&mut self) -> bool {
        let target = match self.capacity() {
            0 => self.initial,
            cap => cap.saturating_mul(2),
        };
        self.grow_to(target)
    }

    /// Grow to at least `target` bytes, bounded by the slot maximum.
    /// Contents are copied into the fresh allocation and the old buffer is
    /// returned to the allocator. Returns false if no growth was possible.
    pub fn grow_to(&mut self, target: usize) -> bool {
        let target = target.min(self.max);
        if target <= self.capacity() && self.is_allocated() {
            return false;
        }
        let mut fresh = self.alloc.allocate(target);
        if let Some(old) = self.buf.take() {
            fresh.extend_from_slice(&old[self.read_pos..]);
            self.alloc.free(old);
        }
        self.read_pos = 0;
        self.buf = Some(fresh);
        true
    }

    /// Release the allocation if the slot is empty and opportunistic release
    /// is configured.
    pub fn maybe_release(&mut self) {
        if self.release_empty && self.is_allocated() && self.is_empty() {
            self.release();
        }
    }

    /// Unconditionally return the allocation to the allocator.
    pub fn release(&mut self) {
        if let Some(old) = self.buf.take() {
            self.alloc.free(old);
        }
        self.read_pos = 0;
    }

    fn ensure(&mut self) {
        if self.buf.is_none() {
            self.buf = Some(self.alloc.allocate(self.initial));
        }
    }
}

/// Read-side buffers: incoming ciphertext and plaintext spillover.
pub struct ReadBuffers {
    pub in_cipher: BufSlot,
    pub in_plain: BufSlot,
}

impl ReadBuffers {
    pub fn release_all(&mut self) {
        self.in_cipher.release();
        self.in_plain.release();
    }
}

/// Write-side buffer: outgoing ciphertext pending a transport write.
pub struct WriteBuffers {
    pub out_cipher: BufSlot,
}

impl WriteBuffers {
    pub fn release_all(&mut self) {
        self.out_cipher.release();
    }
}

/// The per-channel buffer set, sized from the engine's record limits.
pub struct BufferArena {
    pub read: ReadBuffers,
    pub write: WriteBuffers,
}

impl BufferArena {
    /// Build an arena. `max_record` bounds the ciphertext buffers,
    /// `max_plaintext` bounds the plaintext spillover. Plaintext goes through
    /// `plain_alloc` (normally zeroing), ciphertext through `cipher_alloc`.
    pub fn new(
        cipher_alloc: Arc<dyn BufferAllocator>,
        plain_alloc: Arc<dyn BufferAllocator>,
        max_record: usize,
        max_plaintext: usize,
        release_empty: bool,
    ) -> Self {
        BufferArena {
            read: ReadBuffers {
                in_cipher: BufSlot::new(
                    cipher_alloc.clone(),
                    INITIAL_CAPACITY,
                    max_record,
                    release_empty,
                ),
                in_plain: BufSlot::new(plain_alloc, INITIAL_CAPACITY, max_plaintext, release_empty),
            },
            write: WriteBuffers {
                out_cipher: BufSlot::new(cipher_alloc, INITIAL_CAPACITY, max_record, release_empty),
            },
        }
    }

    /// Split into the read half and write half, each guarded by its own lock
    /// in the channel.
    pub fn split(self) -> (ReadBuffers, WriteBuffers) {
        (self.read, self.write)
    }
}
