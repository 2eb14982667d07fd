//! Segment-chained byte buffers for scatter-gather I/O.
//!
//! A [`BufVec`] is an ordered chain of memory segments with a read cursor at
//! the front and a write cursor somewhere in the chain. Writes grow the chain
//! by appending fixed-capacity owned segments; fully-drained owned segments
//! are recycled to the tail so the chain behaves like a ring under steady
//! traffic. Externally-owned memory (an `mmap`ed file, a cache segment) can
//! be spliced in as a *foreign* segment carrying a release closure, which
//! lets a response be assembled around a large body without copying it.
//!
//! `BufVec` is not internally synchronized: each instance is owned by exactly
//! one connection and touched by at most one task at a time.

use std::collections::VecDeque;

/// Default capacity of each owned segment.
pub const DEFAULT_SEGMENT_CAPACITY: usize = 4 * 1024;

/// Release closure for a foreign segment, invoked with the base pointer and
/// the adopted length. Called exactly once, when the segment is destroyed.
pub type ReleaseFn = Box<dyn FnOnce(*mut u8, usize) + Send>;

enum Backing {
    Owned(Box<[u8]>),
    Foreign {
        ptr: *mut u8,
        release: Option<ReleaseFn>,
    },
}

/// A single contiguous region in the chain.
///
/// `begin` and `len` delimit the usable window within the backing memory:
/// a fresh owned segment exposes its whole capacity, a sealed one is trimmed
/// to the bytes actually written.
struct Segment {
    backing: Backing,
    cap: usize,
    begin: usize,
    len: usize,
    readonly: bool,
}

// A Segment exclusively owns its backing memory (owned or foreign), and the
// release closure is itself Send, so moving a segment between threads is
// sound even though the foreign variant holds a raw pointer.
unsafe impl Send for Segment {}

impl Segment {
    fn owned(cap: usize) -> Self {
        Segment {
            backing: Backing::Owned(vec![0u8; cap].into_boxed_slice()),
            cap,
            begin: 0,
            len: cap,
            readonly: false,
        }
    }

    fn foreign(ptr: *mut u8, len: usize, release: ReleaseFn, readonly: bool) -> Self {
        Segment {
            backing: Backing::Foreign {
                ptr,
                release: Some(release),
            },
            cap: len,
            begin: 0,
            len,
            readonly,
        }
    }

    fn base(&self) -> *const u8 {
        match &self.backing {
            Backing::Owned(buf) => buf.as_ptr(),
            Backing::Foreign { ptr, .. } => *ptr,
        }
    }

    fn slice(&self, off: usize, n: usize) -> &[u8] {
        debug_assert!(off + n <= self.len);
        unsafe { std::slice::from_raw_parts(self.base().add(self.begin + off), n) }
    }

    /// Copy up to `dst.len()` bytes starting at `off` within the usable window.
    fn read(&self, dst: &mut [u8], off: usize) -> usize {
        let n = dst.len().min(self.len - off);
        dst[..n].copy_from_slice(self.slice(off, n));
        n
    }

    /// Copy up to `src.len()` bytes into the usable window starting at `off`.
    /// Read-only segments reject writes.
    fn write(&mut self, src: &[u8], off: usize) -> usize {
        if self.readonly {
            return 0;
        }
        let n = src.len().min(self.len - off);
        let at = self.begin + off;
        match &mut self.backing {
            Backing::Owned(buf) => buf[at..at + n].copy_from_slice(&src[..n]),
            Backing::Foreign { ptr, .. } => unsafe {
                std::ptr::copy_nonoverlapping(src.as_ptr(), ptr.add(at), n);
            },
        }
        n
    }

    /// Move the start of the usable window forward by `n` bytes.
    fn trim_front(&mut self, n: usize) {
        debug_assert!(n <= self.len);
        self.begin += n;
        self.len -= n;
    }

    /// Restore the full capacity for rewriting. Read-only segments are never
    /// reused after being consumed.
    fn reset(&mut self) -> bool {
        if self.readonly {
            return false;
        }
        match self.backing {
            Backing::Owned(_) => {
                self.begin = 0;
                self.len = self.cap;
                true
            }
            Backing::Foreign { .. } => false,
        }
    }

    fn iovec(&self, off: usize, len: usize) -> libc::iovec {
        debug_assert!(off + len <= self.len);
        libc::iovec {
            iov_base: unsafe { self.base().add(self.begin + off) as *mut libc::c_void },
            iov_len: len,
        }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if let Backing::Foreign { ptr, release } = &mut self.backing
            && let Some(release) = release.take()
        {
            release(*ptr, self.cap);
        }
    }
}

/// An ordered chain of segments with a read cursor and a write cursor.
///
/// Readable bytes span from the read cursor (front segment, `read_off`) to
/// the write cursor (`write_idx`, `write_off`); everything past the write
/// cursor is writable. One empty writable segment is always present.
pub struct BufVec {
    segs: VecDeque<Segment>,
    seg_cap: usize,
    /// Bytes already consumed within the front segment's usable window.
    read_off: usize,
    /// Index of the segment the write cursor points at.
    write_idx: usize,
    /// Bytes written within that segment's usable window.
    write_off: usize,
}

impl BufVec {
    pub fn new() -> Self {
        Self::with_segment_capacity(DEFAULT_SEGMENT_CAPACITY)
    }

    /// `capacity` is the size of each owned segment appended by writes.
    pub fn with_segment_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "segment capacity must be non-zero");
        let mut segs = VecDeque::with_capacity(4);
        segs.push_back(Segment::owned(capacity));
        BufVec {
            segs,
            seg_cap: capacity,
            read_off: 0,
            write_idx: 0,
            write_off: 0,
        }
    }

    /// Number of bytes between the read and write cursors.
    pub fn readable_len(&self) -> usize {
        if self.write_idx == 0 {
            return self.write_off - self.read_off;
        }
        let mut total = self.segs[0].len - self.read_off;
        for seg in self.segs.iter().take(self.write_idx).skip(1) {
            total += seg.len;
        }
        total + self.write_off
    }

    /// Number of bytes that can be written without growing the chain.
    pub fn writable_len(&self) -> usize {
        let mut total = self.segs[self.write_idx].len - self.write_off;
        for seg in self.segs.iter().skip(self.write_idx + 1) {
            total += seg.len;
        }
        total
    }

    pub fn is_empty(&self) -> bool {
        self.write_idx == 0 && self.write_off == self.read_off
    }

    pub fn segment_count(&self) -> usize {
        self.segs.len()
    }

    /// Grow the chain until at least `n` bytes are writable.
    pub fn ensure_writable(&mut self, n: usize) {
        let avail = self.writable_len();
        if avail > n {
            return;
        }
        let missing = (n - avail) / self.seg_cap + 1;
        for _ in 0..missing {
            self.segs.push_back(Segment::owned(self.seg_cap));
        }
    }

    /// Append bytes at the write cursor, growing the chain as needed.
    pub fn write(&mut self, mut src: &[u8]) {
        self.ensure_writable(src.len());
        while !src.is_empty() {
            let off = self.write_off;
            let n = self.segs[self.write_idx].write(src, off);
            src = &src[n..];
            self.write_off += n;
            if self.write_off == self.segs[self.write_idx].len {
                self.advance_writer();
            }
        }
    }

    /// Splice an externally-owned region in at the write cursor.
    ///
    /// Any partially-written current segment is sealed (its usable length
    /// trimmed to the bytes written) and the write cursor ends up past the
    /// new segment. `release` is invoked exactly once, with `(ptr, len)`,
    /// when the segment is destroyed — this is the only way a foreign region
    /// is freed.
    ///
    /// # Safety
    ///
    /// `ptr` must stay valid for `len` bytes until `release` runs, and no
    /// other alias may touch the region while the buffer holds it.
    pub unsafe fn adopt(&mut self, ptr: *mut u8, len: usize, release: ReleaseFn, readonly: bool) {
        self.seal_current();
        self.segs
            .insert(self.write_idx, Segment::foreign(ptr, len, release, readonly));
        self.write_idx += 1;
        debug_assert!(self.write_idx < self.segs.len());
    }

    /// Copy up to `dst.len()` readable bytes out, retiring drained segments.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let want = dst.len().min(self.readable_len());
        let mut got = 0;
        while got < want {
            let front_avail = if self.write_idx == 0 {
                self.write_off - self.read_off
            } else {
                self.segs[0].len - self.read_off
            };
            let n = (want - got).min(front_avail);
            self.segs[0].read(&mut dst[got..got + n], self.read_off);
            got += n;
            self.read_off += n;
            if self.write_idx > 0 && self.read_off == self.segs[0].len {
                self.retire_front();
            }
        }
        got
    }

    /// Advance the read cursor by `n` bytes without copying.
    ///
    /// Consuming everything (or more) resets the buffer.
    pub fn consume(&mut self, n: usize) {
        if n >= self.readable_len() {
            self.clear();
            return;
        }
        let mut left = n;
        while left > 0 {
            let front_avail = if self.write_idx == 0 {
                self.write_off - self.read_off
            } else {
                self.segs[0].len - self.read_off
            };
            let step = left.min(front_avail);
            self.read_off += step;
            left -= step;
            if self.write_idx > 0 && self.read_off == self.segs[0].len {
                self.retire_front();
            }
        }
    }

    /// Drop all foreign segments, reset cursors, and keep at most one empty
    /// owned segment.
    pub fn clear(&mut self) {
        self.segs.retain_mut(|seg| seg.reset());
        self.segs.truncate(1);
        if self.segs.is_empty() {
            self.segs.push_back(Segment::owned(self.seg_cap));
        }
        self.read_off = 0;
        self.write_idx = 0;
        self.write_off = 0;
    }

    /// Gather vector over the readable region, suitable for `writev`.
    pub fn readable_iovecs(&self) -> Vec<libc::iovec> {
        if self.is_empty() {
            return Vec::new();
        }
        if self.write_idx == 0 {
            return vec![
                self.segs[0].iovec(self.read_off, self.write_off - self.read_off),
            ];
        }
        let mut out = Vec::with_capacity(self.write_idx + 1);
        out.push(self.segs[0].iovec(self.read_off, self.segs[0].len - self.read_off));
        for seg in self.segs.iter().take(self.write_idx).skip(1) {
            out.push(seg.iovec(0, seg.len));
        }
        if self.write_off > 0 {
            out.push(self.segs[self.write_idx].iovec(0, self.write_off));
        }
        out
    }

    /// Gather vector over the writable region, suitable for `readv`.
    pub fn writable_iovecs(&self) -> Vec<libc::iovec> {
        let mut out = Vec::with_capacity(self.segs.len() - self.write_idx);
        let cur = &self.segs[self.write_idx];
        if cur.len > self.write_off {
            out.push(cur.iovec(self.write_off, cur.len - self.write_off));
        }
        for seg in self.segs.iter().skip(self.write_idx + 1) {
            out.push(seg.iovec(0, seg.len));
        }
        out
    }

    /// Record that `n` bytes were written directly into the writable iovecs
    /// (e.g. by `readv`) and advance the write cursor over them.
    pub fn commit(&mut self, mut n: usize) {
        debug_assert!(n <= self.writable_len());
        while n > 0 {
            let room = self.segs[self.write_idx].len - self.write_off;
            let step = n.min(room);
            self.write_off += step;
            n -= step;
            if self.write_off == self.segs[self.write_idx].len {
                self.advance_writer();
            }
        }
    }

    /// Move the readable contents of `other` to this buffer's write cursor
    /// without copying. `other` is left empty but usable.
    pub fn append(&mut self, other: &mut BufVec) {
        if other.is_empty() {
            return;
        }
        self.seal_current();

        // Trim other's front to its unread region and seal its write segment
        // to the bytes actually written.
        let written = if other.write_idx == 0 {
            other.write_off - other.read_off
        } else {
            other.write_off
        };
        other.segs[0].trim_front(other.read_off);
        let take = if other.write_off > 0 {
            other.segs[other.write_idx].len = written;
            other.write_idx + 1
        } else {
            other.write_idx
        };

        for _ in 0..take {
            let seg = other.segs.pop_front().expect("segment accounting");
            if seg.len > 0 {
                self.segs.insert(self.write_idx, seg);
                self.write_idx += 1;
            }
        }
        if self.write_idx == self.segs.len() {
            self.segs.push_back(Segment::owned(self.seg_cap));
        }

        other.read_off = 0;
        other.write_idx = 0;
        other.write_off = 0;
        if other.segs.is_empty() {
            other.segs.push_back(Segment::owned(other.seg_cap));
        }
    }

    /// Copy the readable region into a `Vec` without consuming it.
    pub fn peek_to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.readable_len());
        for iov in self.readable_iovecs() {
            let part =
                unsafe { std::slice::from_raw_parts(iov.iov_base as *const u8, iov.iov_len) };
            out.extend_from_slice(part);
        }
        out
    }

    /// Seal the partially-written current segment and move the write cursor
    /// past it. No-op when nothing was written into it.
    fn seal_current(&mut self) {
        if self.write_off == 0 {
            return;
        }
        self.segs[self.write_idx].len = self.write_off;
        self.write_idx += 1;
        self.write_off = 0;
        if self.write_idx == self.segs.len() {
            self.segs.push_back(Segment::owned(self.seg_cap));
        }
    }

    fn advance_writer(&mut self) {
        if self.write_off == 0 {
            return;
        }
        self.write_idx += 1;
        self.write_off = 0;
        if self.write_idx == self.segs.len() {
            self.segs.push_back(Segment::owned(self.seg_cap));
        }
    }

    /// Pop the fully-drained front segment. Owned segments are recycled to
    /// the tail; read-only and foreign segments are dropped, firing their
    /// release closures.
    fn retire_front(&mut self) {
        let mut seg = self.segs.pop_front().expect("front segment");
        self.write_idx -= 1;
        self.read_off = 0;
        if seg.reset() {
            self.segs.push_back(seg);
        }
    }
}

impl Default for BufVec {
    fn default() -> Self {
        Self::new()
    }
}
