//! SPSC ring buffer for writer-side message staging.
//!
//! One ring per output channel: the application thread pushes
//! [`StreamingMessage`]s, the writer loop drains them front-to-back into
//! bundles. The ring also carries a detachable *transient buffer*: a byte
//! area holding exactly one bundle's wire image between collection and
//! flush, so a bundle that hits back-pressure is retried without
//! re-serializing and without blocking further pushes.
//!
//! # Synchronization protocol
//!
//! Unbounded `u64` sequence numbers for `head` and `tail`; the slot index is
//! `sequence % capacity`, so wrap-around of the counters is a non-issue.
//!
//! - Producer: load `tail` Relaxed (single writer), check cached `head`,
//!   refresh with an Acquire load only when the cache says full, write the
//!   slot, publish with a Release store of `tail`.
//! - Consumer: load `head` Relaxed (single writer), check cached `tail`,
//!   refresh with an Acquire load only when the cache says empty, read the
//!   slot, publish with a Release store of `head`.
//!
//! `cached_head`, `cached_tail` and the transient buffer live in
//! `UnsafeCell`s with exactly one writing side each: the producer for
//! `cached_head`, the consumer for the other two.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::message::StreamingMessage;

/// State of the transient serialization staging area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientState {
    /// No staged bundle.
    Empty,
    /// A bundle image is being serialized into the buffer.
    Filling,
    /// A complete bundle image is staged and awaiting flush.
    Ready,
}

struct TransientBuffer {
    bytes: Vec<u8>,
    state: TransientState,
}

/// Bounded single-producer single-consumer ring of message handles.
pub struct RingBuffer {
    // === PRODUCER HOT ===
    /// Tail index (written by producer, read by consumer).
    tail: CacheAligned<AtomicU64>,
    /// Producer's cached view of head (avoids cross-core reads).
    cached_head: CacheAligned<UnsafeCell<u64>>,

    // === CONSUMER HOT ===
    /// Head index (written by consumer, read by producer).
    head: CacheAligned<AtomicU64>,
    /// Consumer's cached view of tail (avoids cross-core reads).
    cached_tail: CacheAligned<UnsafeCell<u64>>,

    /// Staging area for one bundle's wire image. Consumer-side only.
    transient: UnsafeCell<TransientBuffer>,

    capacity: usize,
    buffer: Box<[UnsafeCell<Option<StreamingMessage>>]>,
}

// Safety: the SPSC discipline gives every UnsafeCell exactly one writing
// side, and slot hand-off is ordered by the Release/Acquire pairs on
// head/tail.
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// Creates a ring with room for `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be positive");
        let mut buffer = Vec::with_capacity(capacity);
        buffer.resize_with(capacity, || UnsafeCell::new(None));
        Self {
            tail: CacheAligned::new(AtomicU64::new(0)),
            cached_head: CacheAligned::new(UnsafeCell::new(0)),
            head: CacheAligned::new(AtomicU64::new(0)),
            cached_tail: CacheAligned::new(UnsafeCell::new(0)),
            transient: UnsafeCell::new(TransientBuffer {
                bytes: Vec::new(),
                state: TransientState::Empty,
            }),
            capacity,
            buffer: buffer.into_boxed_slice(),
        }
    }

    /// Ring capacity in messages. The transient buffer does not count
    /// against it.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current number of messages in the ring.
    #[inline]
    pub fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Relaxed);
        tail.wrapping_sub(head) as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tail.load(Ordering::Relaxed) == self.head.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    // ---------------------------------------------------------------------
    // PRODUCER API
    // ---------------------------------------------------------------------

    /// Pushes a message, returning it back when the ring is full.
    ///
    /// The caller (the application-facing write path) owns the wait policy;
    /// the ring itself never blocks.
    pub fn try_push(&self, message: StreamingMessage) -> Result<(), StreamingMessage> {
        let tail = self.tail.load(Ordering::Relaxed);

        // Fast path: check cached head.
        // SAFETY: cached_head is only written by the producer (this code
        // path), so this unsynchronized read is safe.
        let cached_head = unsafe { *self.cached_head.get() };
        if tail.wrapping_sub(cached_head) as usize >= self.capacity {
            // Slow path: refresh cache.
            let head = self.head.load(Ordering::Acquire);
            // SAFETY: single producer writer; the Acquire load above
            // synchronizes with the consumer's Release store of head.
            unsafe {
                *self.cached_head.get() = head;
            }
            if tail.wrapping_sub(head) as usize >= self.capacity {
                return Err(message);
            }
        }

        let idx = (tail as usize) % self.capacity;
        // SAFETY: the slot at `tail` is outside [head, tail) so the consumer
        // is not reading it; only the producer writes slots at tail.
        unsafe {
            *self.buffer[idx].get() = Some(message);
        }
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // CONSUMER API
    // ---------------------------------------------------------------------

    /// Number of messages visible to the consumer, refreshing the cached
    /// tail when it reads empty.
    fn available(&self) -> usize {
        let head = self.head.load(Ordering::Relaxed);
        // SAFETY: cached_tail is only written by the consumer (this code path).
        let mut cached_tail = unsafe { *self.cached_tail.get() };
        let mut avail = cached_tail.wrapping_sub(head) as usize;
        if avail == 0 {
            cached_tail = self.tail.load(Ordering::Acquire);
            // SAFETY: single consumer writer; the Acquire load synchronizes
            // with the producer's Release store of tail.
            unsafe {
                *self.cached_tail.get() = cached_tail;
            }
            avail = cached_tail.wrapping_sub(head) as usize;
        }
        avail
    }

    /// Peeks at the oldest message without removing it. Consumer side only.
    pub fn front(&self) -> Option<&StreamingMessage> {
        if self.available() == 0 {
            return None;
        }
        let head = self.head.load(Ordering::Relaxed);
        let idx = (head as usize) % self.capacity;
        // SAFETY: the slot at `head` was published by the producer's Release
        // store and cannot be overwritten until head advances past it.
        unsafe { (*self.buffer[idx].get()).as_ref() }
    }

    /// Removes and returns the oldest message. Consumer side only.
    pub fn pop(&self) -> Option<StreamingMessage> {
        if self.available() == 0 {
            return None;
        }
        let head = self.head.load(Ordering::Relaxed);
        let idx = (head as usize) % self.capacity;
        // SAFETY: as in `front`; taking the value leaves the slot None for
        // the producer to reuse once head advances.
        let message = unsafe { (*self.buffer[idx].get()).take() };
        self.head.store(head.wrapping_add(1), Ordering::Release);
        message
    }

    // ---------------------------------------------------------------------
    // TRANSIENT BUFFER (consumer side only)
    // ---------------------------------------------------------------------
    //
    // All transient accessors share one invariant: they are called only by
    // the consuming writer loop, never concurrently with each other. The
    // ring stays writable by the producer the whole time.

    /// Resizes the staging area for a new bundle image and marks it Filling.
    pub fn realloc_transient(&self, len: usize) {
        // SAFETY: consumer-only access per the module invariant.
        let transient = unsafe { &mut *self.transient.get() };
        transient.bytes.clear();
        transient.bytes.resize(len, 0);
        transient.state = TransientState::Filling;
    }

    /// Mutable view of the staging area for serialization.
    #[allow(clippy::mut_from_ref)] // single consumer-side writer, see module docs
    pub fn transient_mut(&self) -> &mut [u8] {
        // SAFETY: consumer-only access per the module invariant.
        let transient = unsafe { &mut *self.transient.get() };
        &mut transient.bytes
    }

    /// Marks the staged image complete and flushable.
    pub fn seal_transient(&self) {
        // SAFETY: consumer-only access per the module invariant.
        let transient = unsafe { &mut *self.transient.get() };
        debug_assert_eq!(transient.state, TransientState::Filling);
        transient.state = TransientState::Ready;
    }

    /// Read view of the staged image.
    pub fn transient(&self) -> &[u8] {
        // SAFETY: consumer-only access per the module invariant.
        let transient = unsafe { &*self.transient.get() };
        &transient.bytes
    }

    /// Returns `true` if a complete bundle image is staged.
    pub fn is_transient_ready(&self) -> bool {
        // SAFETY: consumer-only access per the module invariant.
        unsafe { (*self.transient.get()).state == TransientState::Ready }
    }

    /// Releases the staged image.
    ///
    /// With `force` the backing allocation is dropped too; a Barrier bundle
    /// may have grown the staging area well past the usual bundle size.
    pub fn free_transient(&self, force: bool) {
        // SAFETY: consumer-only access per the module invariant.
        let transient = unsafe { &mut *self.transient.get() };
        transient.state = TransientState::Empty;
        if force {
            transient.bytes = Vec::new();
        } else {
            transient.bytes.clear();
        }
    }
}

/// Wrapper type that ensures 128-byte alignment to prevent prefetcher-induced
/// false sharing on Intel/AMD CPUs (which may prefetch adjacent cache lines).
#[repr(align(128))]
struct CacheAligned<T> {
    value: T,
}

impl<T> CacheAligned<T> {
    const fn new(value: T) -> Self {
        Self { value }
    }
}

impl<T> std::ops::Deref for CacheAligned<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;

    fn msg(seq: u64) -> StreamingMessage {
        StreamingMessage::new(seq, MessageType::Message, vec![seq as u8])
    }

    #[test]
    fn test_push_pop_fifo() {
        let ring = RingBuffer::new(8);
        for i in 1..=5 {
            ring.try_push(msg(i)).unwrap();
        }
        assert_eq!(ring.len(), 5);
        assert_eq!(ring.front().unwrap().seq_id, 1);

        for i in 1..=5 {
            assert_eq!(ring.pop().unwrap().seq_id, i);
        }
        assert!(ring.is_empty());
        assert!(ring.pop().is_none());
    }

    #[test]
    fn test_full_rejects_and_returns_message() {
        let ring = RingBuffer::new(2);
        ring.try_push(msg(1)).unwrap();
        ring.try_push(msg(2)).unwrap();
        assert!(ring.is_full());

        let rejected = ring.try_push(msg(3)).unwrap_err();
        assert_eq!(rejected.seq_id, 3);

        ring.pop().unwrap();
        ring.try_push(rejected).unwrap();
        assert_eq!(ring.pop().unwrap().seq_id, 2);
        assert_eq!(ring.pop().unwrap().seq_id, 3);
    }

    #[test]
    fn test_wraparound_preserves_order() {
        let ring = RingBuffer::new(3);
        let mut next = 1u64;
        let mut expect = 1u64;
        for _ in 0..10 {
            while ring.try_push(msg(next)).is_ok() {
                next += 1;
            }
            while let Some(popped) = ring.pop() {
                assert_eq!(popped.seq_id, expect);
                expect += 1;
            }
        }
    }

    #[test]
    fn test_transient_lifecycle() {
        let ring = RingBuffer::new(4);
        assert!(!ring.is_transient_ready());

        ring.realloc_transient(16);
        ring.transient_mut().copy_from_slice(&[0xaa; 16]);
        assert!(!ring.is_transient_ready());
        ring.seal_transient();
        assert!(ring.is_transient_ready());
        assert_eq!(ring.transient(), &[0xaa; 16]);

        ring.free_transient(false);
        assert!(!ring.is_transient_ready());
        assert!(ring.transient().is_empty());
    }

    #[test]
    fn test_transient_does_not_consume_ring_capacity() {
        let ring = RingBuffer::new(2);
        ring.realloc_transient(1 << 16);
        ring.seal_transient();
        ring.try_push(msg(1)).unwrap();
        ring.try_push(msg(2)).unwrap();
        assert!(ring.is_full());
        assert!(ring.is_transient_ready());
    }

    #[test]
    fn test_cross_thread_spsc() {
        use std::sync::Arc;

        let ring = Arc::new(RingBuffer::new(16));
        let producer = Arc::clone(&ring);
        let handle = std::thread::spawn(move || {
            for i in 1..=1000u64 {
                let mut m = msg(i);
                loop {
                    match producer.try_push(m) {
                        Ok(()) => break,
                        Err(back) => {
                            m = back;
                            std::thread::yield_now();
                        }
                    }
                }
            }
        });

        let mut expect = 1u64;
        while expect <= 1000 {
            if let Some(popped) = ring.pop() {
                assert_eq!(popped.seq_id, expect);
                expect += 1;
            } else {
                std::thread::yield_now();
            }
        }
        handle.join().unwrap();
    }
}
