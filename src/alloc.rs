//! Pluggable buffer allocation.
//!
//! Channels do not allocate their buffers directly; they go through a
//! `BufferAllocator` chosen at construction time. The default pairing is a
//! plain heap allocator for ciphertext and a zeroing allocator for plaintext,
//! so decrypted data never lingers in freed memory. A tracking decorator adds
//! lock-free statistics for allocators shared across many channels.

use bytes::BytesMut;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Allocation strategy for channel buffers.
///
/// Implementations must be thread-safe: a single allocator may serve many
/// channels concurrently.
pub trait BufferAllocator: Send + Sync {
    /// Allocate an empty buffer with at least `capacity` bytes of capacity.
    fn allocate(&self, capacity: usize) -> BytesMut;

    /// Return a buffer. The allocator decides whether to recycle, scrub, or
    /// simply drop it.
    fn free(&self, buf: BytesMut);
}

/// Plain heap allocation. Buffers are dropped on free.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapAllocator;

impl BufferAllocator for HeapAllocator {
    fn allocate(&self, capacity: usize) -> BytesMut {
        BytesMut::with_capacity(capacity)
    }

    fn free(&self, buf: BytesMut) {
        drop(buf);
    }
}

/// Heap allocation that zero-fills the buffer's full capacity on free.
///
/// Used for plaintext buffers so decrypted bytes do not survive in freed
/// memory.
#[derive(Debug, Default, Clone, Copy)]
pub struct ZeroingAllocator;

impl BufferAllocator for ZeroingAllocator {
    fn allocate(&self, capacity: usize) -> BytesMut {
        BytesMut::with_capacity(capacity)
    }

    fn free(&self, mut buf: BytesMut) {
        let capacity = buf.capacity();
        buf.clear();
        buf.resize(capacity, 0);
        drop(buf);
    }
}

/// Counters maintained by `TrackingAllocator`.
///
/// All accumulation is lock-free so a shared allocator never becomes a
/// serialization point.
#[derive(Debug, Default)]
pub struct AllocStats {
    allocations: AtomicU64,
    frees: AtomicU64,
    bytes_in_use: AtomicUsize,
    peak_bytes: AtomicUsize,
}

impl AllocStats {
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    pub fn frees(&self) -> u64 {
        self.frees.load(Ordering::Relaxed)
    }

    pub fn bytes_in_use(&self) -> usize {
        self.bytes_in_use.load(Ordering::Relaxed)
    }

    pub fn peak_bytes(&self) -> usize {
        self.peak_bytes.load(Ordering::Relaxed)
    }

    fn record_alloc(&self, bytes: usize) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
        let in_use = self.bytes_in_use.fetch_add(bytes, Ordering::Relaxed) + bytes;
        self.peak_bytes.fetch_max(in_use, Ordering::Relaxed);
    }

    fn record_free(&self, bytes: usize) {
        self.frees.fetch_add(1, Ordering::Relaxed);
        self.bytes_in_use.fetch_sub(bytes, Ordering::Relaxed);
    }
}

/// Decorator that counts allocations, frees, and outstanding bytes.
pub struct TrackingAllocator<A> {
    inner: A,
    stats: AllocStats,
}

impl<A: BufferAllocator> TrackingAllocator<A> {
    pub fn new(inner: A) -> Self {
        TrackingAllocator {
            inner,
            stats: AllocStats::default(),
        }
    }

    pub fn stats(&self) -> &AllocStats {
        &self.stats
    }
}

impl<A: BufferAllocator> BufferAllocator for TrackingAllocator<A> {
    fn allocate(&self, capacity: usize) -> BytesMut {
        let buf = self.inner.allocate(capacity);
        self.stats.record_alloc(buf.capacity());
        buf
    }

    fn free(&self, buf: BytesMut) {
        self.stats.record_free(buf.capacity());
        self.inner.free(buf);
    }
}
