//! Sample buffers handed from the capture source to its consumer.
//!
//! A [`SampleBuffer`] is an owning handle: while the consumer holds it, the
//! capture source cannot touch the bytes.  Giving it back is a move, either
//! through [`SampleBuffer::release`] or by dropping the handle, so a buffer is
//! returned exactly once.  Pull-mode buffers go back to the [`BufferPool`];
//! push-mode buffers are freed.

use std::sync::Weak;

// ---------------------------------------------------------------------------
// BufferMeta
// ---------------------------------------------------------------------------

/// Timing attached to every captured buffer (all values in microseconds).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferMeta {
    /// Session time of the first sample in the buffer.
    pub time_us: i64,
    /// Session start time; only present on the first buffer of a session.
    pub anchor_time_us: Option<i64>,
    /// Wall time elapsed between the first read of the session and this one.
    pub drift_time_us: i64,
}

/// Where a buffer's storage goes when the consumer returns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferOrigin {
    /// Borrowed from the source's fixed pool (pull mode).
    Pool,
    /// Allocated for a single device callback (push mode).
    Heap,
}

/// Receives buffer storage back from the consumer.
pub(crate) trait BufferRecycler: Send + Sync {
    fn recycle(&self, data: Vec<u8>, origin: BufferOrigin);
}

// ---------------------------------------------------------------------------
// SampleBuffer
// ---------------------------------------------------------------------------

/// A block of native-endian 16-bit PCM owned by the consumer.
#[derive(Debug)]
pub struct SampleBuffer {
    data: Vec<u8>,
    offset: usize,
    len: usize,
    meta: BufferMeta,
    origin: BufferOrigin,
    owner: Option<Weak<dyn BufferRecycler>>,
}

impl SampleBuffer {
    pub(crate) fn new(
        data: Vec<u8>,
        len: usize,
        meta: BufferMeta,
        origin: BufferOrigin,
        owner: Weak<dyn BufferRecycler>,
    ) -> Self {
        assert!(len <= data.len(), "range {len} exceeds buffer of {}", data.len());
        Self {
            data,
            offset: 0,
            len,
            meta,
            origin,
            owner: Some(owner),
        }
    }

    /// Bytes within the logical range.
    pub fn data(&self) -> &[u8] {
        &self.data[self.offset..self.offset + self.len]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.offset..self.offset + self.len]
    }

    /// Decode the logical range as 16-bit samples.
    pub fn samples(&self) -> impl Iterator<Item = i16> + '_ {
        self.data()
            .chunks_exact(2)
            .map(|b| i16::from_ne_bytes([b[0], b[1]]))
    }

    /// Logical range as `(offset, length)`.
    pub fn range(&self) -> (usize, usize) {
        (self.offset, self.len)
    }

    /// Narrow or move the logical range.
    ///
    /// # Panics
    ///
    /// Panics if the range does not fit inside the buffer's storage.
    pub fn set_range(&mut self, offset: usize, len: usize) {
        assert!(
            offset + len <= self.data.len(),
            "range {offset}+{len} exceeds buffer of {}",
            self.data.len()
        );
        self.offset = offset;
        self.len = len;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size of the underlying storage.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn meta(&self) -> &BufferMeta {
        &self.meta
    }

    pub fn origin(&self) -> BufferOrigin {
        self.origin
    }

    /// Hand the buffer back to the capture source.
    ///
    /// Dropping the handle does the same; this just makes the return visible
    /// at the call site.
    pub fn release(self) {}
}

impl Drop for SampleBuffer {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.take().and_then(|weak| weak.upgrade()) {
            owner.recycle(std::mem::take(&mut self.data), self.origin);
        }
    }
}

// ---------------------------------------------------------------------------
// BufferPool
// ---------------------------------------------------------------------------

/// A fixed set of equally sized byte buffers for pull-mode reads.
///
/// The pool never grows: once every buffer is out, [`acquire`](Self::acquire)
/// returns `None` until one is given back.
#[derive(Debug)]
pub struct BufferPool {
    free: Vec<Vec<u8>>,
    size: usize,
    capacity: usize,
}

impl BufferPool {
    /// Create `size` buffers of `capacity` bytes each.
    pub fn new(size: usize, capacity: usize) -> Self {
        Self {
            free: (0..size).map(|_| vec![0; capacity]).collect(),
            size,
            capacity,
        }
    }

    pub fn acquire(&mut self) -> Option<Vec<u8>> {
        self.free.pop()
    }

    /// Return a buffer obtained from [`acquire`](Self::acquire).
    pub fn give_back(&mut self, mut buffer: Vec<u8>) {
        if self.free.len() >= self.size {
            log::warn!("buffer pool: ignoring return beyond pool size {}", self.size);
            return;
        }
        buffer.resize(self.capacity, 0);
        self.free.push(buffer);
    }

}

#[cfg(test)]
impl BufferPool {
    fn available(&self) -> usize {
        self.free.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Collector {
        returned: Mutex<Vec<(usize, BufferOrigin)>>,
    }

    impl BufferRecycler for Collector {
        fn recycle(&self, data: Vec<u8>, origin: BufferOrigin) {
            self.returned.lock().unwrap().push((data.len(), origin));
        }
    }

    fn buffer(owner: &Arc<Collector>, bytes: &[u8]) -> SampleBuffer {
        let weak: Weak<dyn BufferRecycler> = Arc::downgrade(owner) as Weak<dyn BufferRecycler>;
        SampleBuffer::new(bytes.to_vec(), bytes.len(), BufferMeta::default(), BufferOrigin::Heap, weak)
    }

    #[test]
    fn release_returns_storage_once() {
        let owner = Arc::new(Collector::default());
        let buf = buffer(&owner, &[0; 8]);
        buf.release();
        assert_eq!(*owner.returned.lock().unwrap(), vec![(8, BufferOrigin::Heap)]);
    }

    #[test]
    fn drop_also_returns_storage() {
        let owner = Arc::new(Collector::default());
        {
            let _buf = buffer(&owner, &[0; 4]);
        }
        assert_eq!(owner.returned.lock().unwrap().len(), 1);
    }

    #[test]
    fn dropping_after_owner_is_gone_is_harmless() {
        let owner = Arc::new(Collector::default());
        let buf = buffer(&owner, &[0; 4]);
        drop(owner);
        buf.release();
    }

    #[test]
    fn range_narrows_visible_bytes() {
        let owner = Arc::new(Collector::default());
        let mut buf = buffer(&owner, &[1, 2, 3, 4, 5, 6]);
        buf.set_range(2, 2);
        assert_eq!(buf.data(), &[3, 4]);
        assert_eq!(buf.range(), (2, 2));
        assert_eq!(buf.capacity(), 6);

        buf.data_mut()[0] = 9;
        assert_eq!(buf.data(), &[9, 4]);
    }

    #[test]
    #[should_panic(expected = "exceeds buffer")]
    fn range_past_end_panics() {
        let owner = Arc::new(Collector::default());
        let mut buf = buffer(&owner, &[0; 4]);
        buf.set_range(2, 4);
    }

    #[test]
    fn samples_decode_native_endian() {
        let owner = Arc::new(Collector::default());
        let bytes: Vec<u8> = [7_i16, -7].iter().flat_map(|s| s.to_ne_bytes()).collect();
        let buf = buffer(&owner, &bytes);
        assert_eq!(buf.samples().collect::<Vec<_>>(), vec![7, -7]);
    }

    #[test]
    fn pool_hands_out_fixed_number_of_buffers() {
        let mut pool = BufferPool::new(2, 64);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
        assert_eq!(a.len(), 64);

        pool.give_back(a);
        assert_eq!(pool.available(), 1);
        pool.give_back(b);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn pool_ignores_foreign_returns() {
        let mut pool = BufferPool::new(1, 16);
        pool.give_back(vec![0; 16]);
        assert_eq!(pool.available(), 1);
    }
}
