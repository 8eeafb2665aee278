//! Frame pool for stream segments.
//!
//! Streams are built from fixed 512-byte frames. Frames are recycled through a
//! two-level pool so a busy connection does not hit the allocator per message:
//!
//! - Each thread keeps a small cache of frames (no locking on the hot path)
//! - Overflow and refills go through one process-wide pool behind a mutex
//!
//! A separate pool keeps the frame vectors of released streams (each holding
//! just frame 0), so acquiring a stream usually costs no allocation at all.
//!
//! # Usage
//!
//! ```ignore
//! use echowire::protocol::frame_pool::{acquire_frame, release_frame};
//!
//! let frame = acquire_frame();
//! // Use frame as a stream segment...
//! release_frame(frame);
//! ```

use std::cell::RefCell;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use super::wire_format::FRAME_SIZE;

/// One stream segment.
pub type Frame = Box<[u8; FRAME_SIZE]>;

/// Frames kept per thread before spilling to the global pool.
pub const LOCAL_CACHE_SIZE: usize = 64;

/// Frames kept in the global pool (32 MiB worth); extras are freed.
pub const GLOBAL_POOL_SIZE: usize = 65_536;

/// Released stream bodies kept for reuse.
pub const STREAM_POOL_SIZE: usize = 16_384;

/// Number of frames moved between the local cache and the global pool at once.
const REFILL_BATCH: usize = LOCAL_CACHE_SIZE / 2;

/// A bounded pool of frames.
pub struct FramePool {
    frames: Vec<Frame>,
    capacity: usize,
}

impl FramePool {
    /// Create an empty pool that holds at most `capacity` frames.
    pub const fn new(capacity: usize) -> Self {
        Self {
            frames: Vec::new(),
            capacity,
        }
    }

    /// Take a frame from the pool, if any.
    ///
    /// The frame content is NOT cleared - it may contain old data.
    #[inline]
    pub fn acquire(&mut self) -> Option<Frame> {
        self.frames.pop()
    }

    /// Return a frame. Returns it back if the pool is full.
    #[inline]
    pub fn release(&mut self, frame: Frame) -> Option<Frame> {
        if self.frames.len() >= self.capacity {
            return Some(frame);
        }
        self.frames.push(frame);
        None
    }

    /// Number of pooled frames.
    #[inline]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Check if the pool is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

static GLOBAL_FRAMES: Lazy<Mutex<FramePool>> =
    Lazy::new(|| Mutex::new(FramePool::new(GLOBAL_POOL_SIZE)));

static GLOBAL_STREAMS: Lazy<Mutex<Vec<Vec<Frame>>>> = Lazy::new(|| Mutex::new(Vec::new()));

// Thread-local cache for truly zero-contention access
thread_local! {
    static LOCAL_FRAMES: RefCell<FramePool> =
        const { RefCell::new(FramePool::new(LOCAL_CACHE_SIZE)) };
}

#[inline]
fn new_frame() -> Frame {
    Box::new([0u8; FRAME_SIZE])
}

/// Acquire a frame, preferring the thread-local cache.
pub fn acquire_frame() -> Frame {
    let cached = LOCAL_FRAMES
        .try_with(|local| {
            let mut local = local.borrow_mut();
            if let Some(frame) = local.acquire() {
                return Some(frame);
            }
            // refill from the global pool in one lock
            let mut global = GLOBAL_FRAMES.lock();
            for _ in 0..REFILL_BATCH {
                match global.acquire() {
                    Some(frame) => {
                        let _ = local.release(frame);
                    }
                    None => break,
                }
            }
            drop(global);
            local.acquire()
        })
        .ok()
        .flatten();

    cached.unwrap_or_else(new_frame)
}

/// Return a frame to the pool.
pub fn release_frame(frame: Frame) {
    let spilled = LOCAL_FRAMES
        .try_with(|local| local.borrow_mut().release(frame))
        .unwrap_or_else(|_| None);

    // local cache full (or thread shutting down): spill to the global pool
    if let Some(frame) = spilled {
        let _ = GLOBAL_FRAMES.lock().release(frame);
    }
}

/// Return many frames at once.
pub fn release_frames(frames: impl Iterator<Item = Frame>) {
    for frame in frames {
        release_frame(frame);
    }
}

/// Take a pooled stream body (a frame vector holding exactly frame 0).
pub(crate) fn acquire_stream_frames() -> Vec<Frame> {
    if let Some(frames) = GLOBAL_STREAMS.lock().pop() {
        return frames;
    }
    let mut frames = Vec::with_capacity(4);
    frames.push(acquire_frame());
    frames
}

/// Return a stream body. `frames` must hold exactly frame 0.
pub(crate) fn release_stream_frames(frames: Vec<Frame>) {
    debug_assert_eq!(frames.len(), 1);
    let mut pool = GLOBAL_STREAMS.lock();
    if pool.len() < STREAM_POOL_SIZE {
        pool.push(frames);
        return;
    }
    drop(pool);
    release_frames(frames.into_iter());
}

/// Number of frames in the global pool (for diagnostics).
pub fn global_pool_len() -> usize {
    GLOBAL_FRAMES.lock().len()
}
