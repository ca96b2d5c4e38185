//! Owned byte buffer with head/tail slack for in-place prepend/strip.
//!
//! Mirrors the allocation shape of a C `malloc`'d region with a `data`
//! pointer that can slide within `[base, base+capacity)`: we keep the
//! backing storage in a `Vec<u8>` and track the payload as `[head, head+len)`
//! inside it. `pull_head`/`push_head` slide that window without touching the
//! backing allocation, so prepending a header never copies payload bytes.

/// A programming-error boundary: callers are expected to never under/overflow
/// the buffer's head or tail space. Hitting it means a caller miscomputed a
/// header or AEAD-overhead size; crashing loudly is the contract, matching
/// fastd's own abort-on-misuse buffer handling.
fn bug(msg: &str) -> ! {
    panic!("vex-core: buffer invariant violated: {msg}");
}

/// Owned byte region `[0, capacity)` with a payload sub-range `[head,
/// head+len)`. Invariant: `head <= head+len <= capacity`.
#[derive(Clone)]
pub struct Buffer {
    storage: Vec<u8>,
    head: usize,
    len: usize,
}

impl Buffer {
    /// Allocate a buffer with `len` payload bytes (zeroed), `head_space`
    /// bytes of free space before the payload and `tail_space` after.
    pub fn alloc(len: usize, head_space: usize, tail_space: usize) -> Self {
        let capacity = head_space + len + tail_space;
        Self {
            storage: vec![0u8; capacity],
            head: head_space,
            len,
        }
    }

    /// Wrap an existing byte vector as the payload with no head/tail slack.
    pub fn from_vec(data: Vec<u8>) -> Self {
        let len = data.len();
        Self {
            storage: data,
            head: 0,
            len,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.storage[self.head..self.head + self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.storage[self.head..self.head + self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn head_space(&self) -> usize {
        self.head
    }

    pub fn tail_space(&self) -> usize {
        self.storage.len() - self.head - self.len
    }

    /// Widen the payload leftward by `n` bytes, exposing `n` bytes of
    /// (unspecified) head space as payload. Aborts if `n` exceeds the
    /// available head space.
    pub fn pull_head(&mut self, n: usize) {
        if n > self.head {
            bug("pull_head underflow");
        }
        self.head -= n;
        self.len += n;
    }

    /// Like [`pull_head`](Self::pull_head), but copies `src` into the
    /// newly exposed region.
    pub fn pull_head_from(&mut self, src: &[u8], n: usize) {
        if src.len() < n {
            bug("pull_head_from source too short");
        }
        self.pull_head(n);
        self.storage[self.head..self.head + n].copy_from_slice(&src[..n]);
    }

    /// Narrow the payload rightward by `n` bytes, i.e. strip `n` bytes from
    /// the front. Aborts if `n` exceeds the current payload length.
    pub fn push_head(&mut self, n: usize) {
        if n > self.len {
            bug("push_head overflow");
        }
        self.head += n;
        self.len -= n;
    }

    /// Like [`push_head`](Self::push_head), but copies the stripped bytes
    /// into `dst` first.
    pub fn push_head_to(&mut self, dst: &mut [u8], n: usize) {
        if dst.len() < n {
            bug("push_head_to destination too short");
        }
        if n > self.len {
            bug("push_head_to overflow");
        }
        dst[..n].copy_from_slice(&self.storage[self.head..self.head + n]);
        self.push_head(n);
    }

    /// Append bytes to the tail of the payload, consuming tail space.
    pub fn push_tail_from(&mut self, src: &[u8]) {
        let end = self.head + self.len;
        if src.len() > self.storage.len() - end {
            bug("push_tail_from overflow");
        }
        self.storage[end..end + src.len()].copy_from_slice(src);
        self.len += src.len();
    }

    /// Shrink the payload from the tail by `n` bytes.
    pub fn truncate_tail(&mut self, n: usize) {
        if n > self.len {
            bug("truncate_tail overflow");
        }
        self.len -= n;
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.as_slice().to_vec()
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("head", &self.head)
            .field("len", &self.len)
            .field("capacity", &self.storage.len())
            .finish()
    }
}
