//! Bounded single-producer/single-consumer queue of transport frames.
//!
//! The transport reader thread enqueues raw 64-byte reads stamped with the
//! capture clock; the decoder drains them from the UI thread. The queue is
//! lock-free: the producer owns `tail` and the overflow counter, the
//! consumer owns `head`, and slot contents are published with a release
//! store of `tail` (matched by the consumer's acquire load). When the ring
//! is full the incoming frame is dropped and counted, so a stalled viewer
//! costs trace data rather than probe throughput.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// Number of slots in the packet ring. One slot is kept free to tell a
/// full ring from an empty one, so at most 127 frames are buffered.
pub const RING_CAPACITY: usize = 128;

/// Largest transport read, matching the probe's bulk endpoint size.
pub const FRAME_CAPACITY: usize = 64;

/// One transport read: up to 64 raw trace bytes and the capture timestamp
/// in seconds.
#[derive(Debug, Clone, Copy)]
pub struct PacketFrame {
    bytes: [u8; FRAME_CAPACITY],
    len: usize,
    pub timestamp: f64,
}

impl PacketFrame {
    /// Builds a frame from up to 64 raw bytes; longer slices are
    /// truncated.
    pub fn new(data: &[u8], timestamp: f64) -> PacketFrame {
        let len = data.len().min(FRAME_CAPACITY);
        let mut bytes = [0; FRAME_CAPACITY];
        bytes[..len].copy_from_slice(&data[..len]);
        PacketFrame {
            bytes,
            len,
            timestamp,
        }
    }

    const fn empty() -> PacketFrame {
        PacketFrame {
            bytes: [0; FRAME_CAPACITY],
            len: 0,
            timestamp: 0.0,
        }
    }

    /// The occupied prefix of the frame.
    pub fn data(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

/// The frame queue between the transport reader and the decoder.
///
/// # Safety discipline
///
/// `enqueue` must only ever be called from one thread at a time (the
/// transport reader, or the session owner while no reader is attached) and
/// `dequeue` only from the UI thread. Under that discipline the producer
/// writes a slot strictly before publishing it via `tail`, and the
/// consumer reads a slot strictly before releasing it via `head`, so the
/// `UnsafeCell` accesses never alias.
pub(crate) struct PacketRing {
    slots: [UnsafeCell<PacketFrame>; RING_CAPACITY],
    /// Consumer cursor; next slot to read.
    head: AtomicUsize,
    /// Producer cursor; next slot to write.
    tail: AtomicUsize,
    /// Frames dropped because the ring was full.
    overflow: AtomicU32,
}

// Slots are handed across threads under the SPSC discipline above.
unsafe impl Sync for PacketRing {}

impl PacketRing {
    pub fn new() -> PacketRing {
        PacketRing {
            slots: std::array::from_fn(|_| UnsafeCell::new(PacketFrame::empty())),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            overflow: AtomicU32::new(0),
        }
    }

    /// Producer side. Copies `data` into the next free slot; on a full
    /// ring the frame is dropped (drop-newest) and counted. Returns
    /// whether the frame was accepted.
    pub fn enqueue(&self, data: &[u8], timestamp: f64) -> bool {
        let tail = self.tail.load(Ordering::Relaxed);
        let next = (tail + 1) % RING_CAPACITY;
        if next == self.head.load(Ordering::Acquire) {
            self.overflow.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        unsafe {
            *self.slots[tail].get() = PacketFrame::new(data, timestamp);
        }
        self.tail.store(next, Ordering::Release);
        true
    }

    /// Consumer side. Copies the oldest frame out of its slot, or returns
    /// `None` on an empty ring.
    pub fn dequeue(&self) -> Option<PacketFrame> {
        let head = self.head.load(Ordering::Relaxed);
        if head == self.tail.load(Ordering::Acquire) {
            return None;
        }
        let frame = unsafe { *self.slots[head].get() };
        self.head.store((head + 1) % RING_CAPACITY, Ordering::Release);
        Some(frame)
    }

    /// Number of frames currently buffered.
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        (tail + RING_CAPACITY - head) % RING_CAPACITY
    }

    /// Frames dropped since the counter was last taken.
    pub fn overflow(&self) -> u32 {
        self.overflow.load(Ordering::Relaxed)
    }

    /// Returns the overflow counter and resets it to zero.
    pub fn overflow_take(&self) -> u32 {
        self.overflow.swap(0, Ordering::Relaxed)
    }

    /// Drops all buffered frames and zeroes the cursors and the overflow
    /// counter. Only valid once the producer thread has exited.
    pub fn reset(&self) {
        self.head.store(0, Ordering::Relaxed);
        self.tail.store(0, Ordering::Relaxed);
        self.overflow.store(0, Ordering::Relaxed);
    }
}
