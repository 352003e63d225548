//! Vectored buffer views.
//!
//! `GatherBuf` and `ScatterBuf` present an ordered sequence of discontiguous
//! byte slices as one logical stream, so the rest of the crate never needs
//! buffer-count-specific code paths. A `GatherBuf` is a read cursor over
//! immutable slices (the source side of a gather write); a `ScatterBuf` is a
//! write cursor over mutable slices (the destination side of a scatter read).
//!
//! Both are pure views: they never resize or reallocate the underlying
//! buffers, and they are constructed fresh for each I/O call.

use std::io;

/// Read cursor over an ordered sequence of byte slices.
///
/// The cursor tracks a position across the whole set; copy operations advance
/// it and short-circuit once the destination is exhausted.
pub struct GatherBuf<'a> {
    slices: &'a [&'a [u8]],
    /// Index of the slice holding the next unconsumed byte.
    idx: usize,
    /// Offset of that byte within `slices[idx]`.
    off: usize,
}

impl<'a> GatherBuf<'a> {
    /// Create a gather view over `slices`. Empty slices are permitted and
    /// skipped transparently.
    pub fn new(slices: &'a [&'a [u8]]) -> Self {
        let mut buf = GatherBuf {
            slices,
            idx: 0,
            off: 0,
        };
        buf.skip_exhausted();
        buf
    }

    /// Total unconsumed bytes across the remaining slices.
    pub fn remaining(&self) -> usize {
        if self.idx >= self.slices.len() {
            return 0;
        }
        let head = self.slices[self.idx].len() - self.off;
        head + self.slices[self.idx + 1..].iter().map(|s| s.len()).sum::<usize>()
    }

    /// True if no unconsumed bytes remain.
    pub fn is_empty(&self) -> bool {
        self.idx >= self.slices.len()
    }

    /// The current contiguous chunk, or `None` if the set is exhausted.
    pub fn chunk(&self) -> Option<&'a [u8]> {
        if self.idx < self.slices.len() {
            let slice: &'a [u8] = self.slices[self.idx];
            Some(&slice[self.off..])
        } else {
            None
        }
    }

    /// Consume `n` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the remaining bytes.
    pub fn advance(&mut self, n: usize) {
        let mut left = n;
        while left > 0 {
            assert!(self.idx < self.slices.len(), "advance past end of gather set");
            let avail = self.slices[self.idx].len() - self.off;
            let take = avail.min(left);
            self.off += take;
            left -= take;
            if self.off == self.slices[self.idx].len() {
                self.idx += 1;
                self.off = 0;
            }
        }
        self.skip_exhausted();
    }

    /// Copy as many bytes as fit into `dst`, advancing the cursor. Returns
    /// the number of bytes copied.
    pub fn copy_to(&mut self, dst: &mut [u8]) -> usize {
        let mut copied = 0;
        while copied < dst.len() {
            let Some(chunk) = self.chunk() else { break };
            let n = chunk.len().min(dst.len() - copied);
            dst[copied..copied + n].copy_from_slice(&chunk[..n]);
            copied += n;
            self.advance(n);
        }
        copied
    }

    /// Copy exactly `dst.len()` bytes into `dst`.
    ///
    /// Fails with `InvalidInput` if the set holds fewer bytes, in which case
    /// the cursor is not advanced.
    pub fn copy_exact_to(&mut self, dst: &mut [u8]) -> io::Result<()> {
        if self.remaining() < dst.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "insufficient data in gather set",
            ));
        }
        let n = self.copy_to(dst);
        debug_assert_eq!(n, dst.len());
        Ok(())
    }

    fn skip_exhausted(&mut self) {
        while self.idx < self.slices.len() && self.off >= self.slices[self.idx].len() {
            self.idx += 1;
            self.off = 0;
        }
    }
}

/// Write cursor over an ordered sequence of mutable byte slices.
pub struct ScatterBuf<'a, 'b> {
    slices: &'a mut [&'b mut [u8]],
    idx: usize,
    off: usize,
    /// Total length of all slices, captured at construction. Used by callers
    /// that size spill buffers relative to the destination.
    capacity: usize,
}

impl<'a, 'b> ScatterBuf<'a, 'b> {
    /// Create a scatter view over `slices`.
    pub fn new(slices: &'a mut [&'b mut [u8]]) -> Self {
        let capacity = slices.iter().map(|s| s.len()).sum();
        let mut buf = ScatterBuf {
            slices,
            idx: 0,
            off: 0,
            capacity,
        };
        buf.skip_exhausted();
        buf
    }

    /// Total space remaining across the set.
    pub fn remaining(&self) -> usize {
        if self.idx >= self.slices.len() {
            return 0;
        }
        let head = self.slices[self.idx].len() - self.off;
        head + self.slices[self.idx + 1..].iter().map(|s| s.len()).sum::<usize>()
    }

    /// True if no space remains.
    pub fn is_full(&self) -> bool {
        self.idx >= self.slices.len()
    }

    /// Total length of the set, regardless of how much has been written.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes written so far.
    pub fn written(&self) -> usize {
        self.capacity - self.remaining()
    }

    /// The current contiguous writable chunk, or `None` if the set is full.
    pub fn chunk_mut(&mut self) -> Option<&mut [u8]> {
        if self.idx < self.slices.len() {
            let off = self.off;
            Some(&mut self.slices[self.idx][off..])
        } else {
            None
        }
    }

    /// Mark `n` bytes as written.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the remaining space.
    pub fn advance(&mut self, n: usize) {
        let mut left = n;
        while left > 0 {
            assert!(self.idx < self.slices.len(), "advance past end of scatter set");
            let avail = self.slices[self.idx].len() - self.off;
            let take = avail.min(left);
            self.off += take;
            left -= take;
            if self.off == self.slices[self.idx].len() {
                self.idx += 1;
                self.off = 0;
            }
        }
        self.skip_exhausted();
    }

    /// Copy as much of `src` as fits, advancing the cursor. Returns the
    /// number of bytes copied.
    pub fn put(&mut self, src: &[u8]) -> usize {
        let mut copied = 0;
        while copied < src.len() {
            let Some(chunk) = self.chunk_mut() else { break };
            let n = chunk.len().min(src.len() - copied);
            chunk[..n].copy_from_slice(&src[copied..copied + n]);
            copied += n;
            self.advance(n);
        }
        copied
    }

    /// Copy all of `src` into the set.
    ///
    /// Fails with `InvalidInput` if the set lacks the space, in which case
    /// the cursor is not advanced.
    pub fn put_exact(&mut self, src: &[u8]) -> io::Result<()> {
        if self.remaining() < src.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "insufficient space in scatter set",
            ));
        }
        let n = self.put(src);
        debug_assert_eq!(n, src.len());
        Ok(())
    }

    fn skip_exhausted(&mut self) {
        while self.idx < self.slices.len() && self.off >= self.slices[self.idx].len() {
            self.idx += 1;
            self.off = 0;
        }
    }
}
