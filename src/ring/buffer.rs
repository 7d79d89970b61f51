//! The producer/consumer synchronization core
//!
//! A single producer publishes frames into preallocated slots; one logical
//! consumer drains them. `put` never blocks: when the ring is full the
//! overflow policy decides which frame loses. Cursor and publication state
//! live inside the pool mapping as atomics, so the identical protocol works
//! whether the two sides are threads or separate processes.
//!
//! Torn reads are impossible: each slot carries a seqlock word. A consumer
//! that copied bytes the producer was concurrently overwriting detects the
//! lap and retries at the new tail; index gaps are the only drop signal a
//! consumer ever sees.

use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam::utils::{Backoff, CachePadded};
use metrics::counter;
use serde::{Deserialize, Serialize};

use crate::capture::frame::{Frame, FrameShape, Image, PixelDepth};
use crate::error::{BufferError, TryGetError};
use crate::ring::layout::{seq_published, seq_writing, RingLayout};
use crate::ring::pool::SlotPool;

/// Sleep slice once the adaptive backoff gives up spinning
const WAIT_SLICE: Duration = Duration::from_micros(500);

/// What `put` does once every slot holds an unread frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverflowPolicy {
    /// Overwrite the oldest unread frame. Acquisition has priority: a
    /// stalled consumer must never stall hardware frame delivery.
    #[default]
    DropOldest,
    /// Discard the incoming frame and leave stored frames untouched.
    DropNewest,
}

/// Whether consumers take defensive copies or leases into slot storage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetrievalMode {
    /// `get`: owning copy, safe to hold indefinitely
    #[default]
    Copy,
    /// `get_view`: borrowed lease, single-use before the next retrieval
    View,
}

/// Snapshot of one handle's frame counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub written: u64,
    pub read: u64,
    pub dropped: u64,
}

#[derive(Default)]
struct Stats {
    written: AtomicU64,
    read: AtomicU64,
    dropped: AtomicU64,
}

/// Bounded, lossy frame queue over a preallocated slot pool
pub struct RingBuffer {
    pool: SlotPool,
    overflow: OverflowPolicy,
    /// Per-handle counters; cross-process peers each keep their own
    stats: CachePadded<Stats>,
}

impl RingBuffer {
    /// In-process buffer over an anonymous mapping
    pub fn new(capacity: u32, shape: FrameShape, depth: PixelDepth) -> Result<Self, BufferError> {
        let layout = RingLayout::new(capacity, shape, depth)?;
        Ok(Self::from_pool(SlotPool::anonymous(layout)?))
    }

    /// Create a named cross-process buffer. The creating handle owns the
    /// segment name and unlinks it on drop.
    pub fn create(
        name: &str,
        capacity: u32,
        shape: FrameShape,
        depth: PixelDepth,
    ) -> Result<Self, BufferError> {
        let layout = RingLayout::new(capacity, shape, depth)?;
        Ok(Self::from_pool(SlotPool::create(name, layout)?))
    }

    /// Attach to a buffer another process created
    pub fn attach(name: &str) -> Result<Self, BufferError> {
        Ok(Self::from_pool(SlotPool::attach(name)?))
    }

    fn from_pool(pool: SlotPool) -> Self {
        Self {
            pool,
            overflow: OverflowPolicy::default(),
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Replace the overflow policy (default: drop-oldest)
    pub fn with_overflow(mut self, policy: OverflowPolicy) -> Self {
        self.overflow = policy;
        self
    }

    pub fn capacity(&self) -> u32 {
        self.pool.layout().capacity
    }

    pub fn shape(&self) -> FrameShape {
        self.pool.layout().shape
    }

    pub fn depth(&self) -> PixelDepth {
        self.pool.layout().depth
    }

    pub fn overflow(&self) -> OverflowPolicy {
        self.overflow
    }

    /// Occupied slot count. Racy by nature in a concurrent system: use for
    /// monitoring and telemetry, never for control decisions.
    pub fn occupied(&self) -> usize {
        let header = self.pool.header();
        let head = header.head.load(Ordering::Acquire);
        let tail = header.tail.load(Ordering::Acquire);
        head.saturating_sub(tail) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.occupied() == 0
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            written: self.stats.written.load(Ordering::Relaxed),
            read: self.stats.read.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
        }
    }

    /// Producer: publish a frame. Never blocks.
    ///
    /// A frame whose geometry does not match this buffer is refused with
    /// `InvalidShape` - a resolution change means the producer must be
    /// stopped and a new buffer built (there is no in-place reshape).
    pub fn put(&self, frame: &Frame) -> Result<(), BufferError> {
        let layout = self.pool.layout();
        if frame.image.shape() != layout.shape || frame.image.depth() != layout.depth {
            return Err(BufferError::InvalidShape(format!(
                "frame is {}x{}x{} {:?} but buffer holds {}x{}x{} {:?}; rebuild the buffer",
                frame.image.shape().height,
                frame.image.shape().width,
                frame.image.shape().channels,
                frame.image.depth(),
                layout.shape.height,
                layout.shape.width,
                layout.shape.channels,
                layout.depth,
            )));
        }
        self.publish(frame.index, frame.timestamp, |dst| {
            dst.copy_from_slice(frame.image.bytes())
        });
        Ok(())
    }

    /// Producer: claim a slot and let the caller serialize pixels directly
    /// into it, skipping the intermediate frame allocation. The slice handed
    /// to `fill` is exactly one frame long.
    pub fn put_with<F>(&self, index: u64, timestamp: f64, fill: F)
    where
        F: FnOnce(&mut [u8]),
    {
        self.publish(index, timestamp, fill);
    }

    fn publish<F>(&self, index: u64, timestamp: f64, fill: F)
    where
        F: FnOnce(&mut [u8]),
    {
        let header = self.pool.header();
        let layout = self.pool.layout();
        let capacity = layout.capacity as u64;
        // Exactly one producer holds write authority, so head is stable here
        let head = header.head.load(Ordering::Relaxed);

        loop {
            let tail = header.tail.load(Ordering::Acquire);
            assert!(
                head >= tail && head - tail <= capacity,
                "ring cursors out of range (head={head}, tail={tail}, capacity={capacity})"
            );
            if head - tail < capacity {
                break;
            }
            match self.overflow {
                OverflowPolicy::DropOldest => {
                    // Evict the oldest unread frame. A concurrent get may
                    // claim it first; either way a slot frees up.
                    if header
                        .tail
                        .compare_exchange(tail, tail + 1, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                        counter!("frames_dropped").increment(1);
                    }
                }
                OverflowPolicy::DropNewest => {
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    counter!("frames_dropped").increment(1);
                    return;
                }
            }
        }

        let (slot, payload) = self.pool.slot(head);
        unsafe {
            // Seqlock write: mark the slot in-flight before touching its
            // bytes, publish with a release store afterwards.
            (*slot).seq.store(seq_writing(head), Ordering::Relaxed);
            fence(Ordering::Release);
            (*slot).index = index;
            (*slot).timestamp = timestamp;
            fill(std::slice::from_raw_parts_mut(payload, layout.frame_bytes));
            (*slot).seq.store(seq_published(head), Ordering::Release);
        }
        header.head.store(head + 1, Ordering::Release);
        self.stats.written.fetch_add(1, Ordering::Relaxed);
        counter!("frames_written").increment(1);
    }

    /// Consumer: non-blocking poll. `Empty` immediately when no frame is
    /// available; callers retry in their own loop or use `get_timeout`.
    pub fn get(&self) -> Result<Frame, TryGetError> {
        let header = self.pool.header();
        loop {
            let pos = match self.claim(header) {
                Some(pos) => pos,
                None => return Err(TryGetError::Empty),
            };
            match self.copy_slot(pos) {
                Some(frame) => {
                    self.stats.read.fetch_add(1, Ordering::Relaxed);
                    counter!("frames_read").increment(1);
                    return Ok(frame);
                }
                None => {
                    // The claimed frame was lapped while we copied it; it
                    // was the oldest, so this is one more drop-oldest loss.
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    counter!("frames_dropped").increment(1);
                }
            }
        }
    }

    /// Consumer: wait up to `timeout` for a frame, then `Empty`
    pub fn get_timeout(&self, timeout: Duration) -> Result<Frame, TryGetError> {
        let deadline = Instant::now() + timeout;
        let backoff = Backoff::new();
        loop {
            match self.get() {
                Ok(frame) => return Ok(frame),
                Err(TryGetError::Empty) => {}
            }
            if Instant::now() >= deadline {
                return Err(TryGetError::Empty);
            }
            if backoff.is_completed() {
                thread::sleep(WAIT_SLICE);
            } else {
                backoff.snooze();
            }
        }
    }

    /// Consumer: zero-copy retrieval. The lease borrows the slot bytes
    /// in place; `release` reports whether they stayed intact. Single-use
    /// before the next retrieval.
    pub fn get_view(&self) -> Result<FrameLease<'_>, TryGetError> {
        let header = self.pool.header();
        let layout = self.pool.layout();
        loop {
            let pos = match self.claim(header) {
                Some(pos) => pos,
                None => return Err(TryGetError::Empty),
            };
            let want = seq_published(pos);
            let (slot, payload) = self.pool.slot(pos);
            unsafe {
                if (*slot).seq.load(Ordering::Acquire) != want {
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    counter!("frames_dropped").increment(1);
                    continue;
                }
                let index = std::ptr::read(&(*slot).index);
                let timestamp = std::ptr::read(&(*slot).timestamp);
                fence(Ordering::Acquire);
                if (*slot).seq.load(Ordering::Relaxed) != want {
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    counter!("frames_dropped").increment(1);
                    continue;
                }
                self.stats.read.fetch_add(1, Ordering::Relaxed);
                counter!("frames_read").increment(1);
                return Ok(FrameLease {
                    ring: self,
                    pos,
                    index,
                    timestamp,
                    payload: std::slice::from_raw_parts(payload as *const u8, layout.frame_bytes),
                });
            }
        }
    }

    /// Zero-copy counterpart of `get_timeout`
    pub fn get_view_timeout(&self, timeout: Duration) -> Result<FrameLease<'_>, TryGetError> {
        let deadline = Instant::now() + timeout;
        let backoff = Backoff::new();
        loop {
            match self.get_view() {
                Ok(lease) => return Ok(lease),
                Err(TryGetError::Empty) => {}
            }
            if Instant::now() >= deadline {
                return Err(TryGetError::Empty);
            }
            if backoff.is_completed() {
                thread::sleep(WAIT_SLICE);
            } else {
                backoff.snooze();
            }
        }
    }

    /// Claim the position at the read cursor, racing the producer's
    /// drop-oldest eviction. `None` when the ring is empty.
    fn claim(&self, header: &crate::ring::layout::RingHeader) -> Option<u64> {
        loop {
            let tail = header.tail.load(Ordering::Acquire);
            let head = header.head.load(Ordering::Acquire);
            debug_assert!(head >= tail, "read cursor overtook write cursor");
            if head == tail {
                return None;
            }
            if header
                .tail
                .compare_exchange(tail, tail + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(tail);
            }
        }
    }

    /// Seqlock read of one slot into an owning frame. `None` when the
    /// producer lapped the ring while we copied.
    fn copy_slot(&self, pos: u64) -> Option<Frame> {
        let layout = self.pool.layout();
        let want = seq_published(pos);
        let (slot, payload) = self.pool.slot(pos);
        unsafe {
            if (*slot).seq.load(Ordering::Acquire) != want {
                return None;
            }
            let index = std::ptr::read(&(*slot).index);
            let timestamp = std::ptr::read(&(*slot).timestamp);
            let mut data = vec![0u8; layout.frame_bytes];
            std::ptr::copy_nonoverlapping(payload as *const u8, data.as_mut_ptr(), layout.frame_bytes);
            fence(Ordering::Acquire);
            if (*slot).seq.load(Ordering::Relaxed) != want {
                return None;
            }
            let image = Image::from_pool_bytes(layout.shape, layout.depth, Bytes::from(data));
            Some(Frame::new(index, timestamp, image))
        }
    }
}

/// Borrowed view of one published frame
///
/// Valid until the producer laps the ring over this slot; `is_intact` and
/// `release` detect that. Callers in view mode must not hold a lease past
/// their callback's synchronous extent.
pub struct FrameLease<'a> {
    ring: &'a RingBuffer,
    pos: u64,
    index: u64,
    timestamp: f64,
    payload: &'a [u8],
}

impl FrameLease<'_> {
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    /// The slot bytes in place. Only trustworthy if the lease is intact.
    pub fn image(&self) -> &[u8] {
        self.payload
    }

    pub fn shape(&self) -> FrameShape {
        self.ring.shape()
    }

    pub fn depth(&self) -> PixelDepth {
        self.ring.depth()
    }

    /// Whether the producer has overwritten this slot since the lease was
    /// taken
    pub fn is_intact(&self) -> bool {
        let (slot, _) = self.ring.pool.slot(self.pos);
        fence(Ordering::Acquire);
        unsafe { (*slot).seq.load(Ordering::Relaxed) == seq_published(self.pos) }
    }

    /// Copy the lease out into an owning frame, revalidating afterwards.
    /// `None` if the slot was overwritten mid-copy.
    pub fn to_frame(&self) -> Option<Frame> {
        let image = Image::from_pool_bytes(
            self.shape(),
            self.depth(),
            Bytes::copy_from_slice(self.payload),
        );
        if self.is_intact() {
            Some(Frame::new(self.index, self.timestamp, image))
        } else {
            None
        }
    }

    /// Consume the lease; true if the bytes stayed intact for its lifetime
    pub fn release(self) -> bool {
        self.is_intact()
    }
}
