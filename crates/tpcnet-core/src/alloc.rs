//! Frame pools.
//!
//! Two allocators with the same free-list-by-capacity-class scheme:
//!
//! - [`FrameAllocator`] — reactor-local, no synchronization. Used for
//!   inbound (request-side) frames, which never leave their reactor.
//! - [`ParallelFrameAllocator`] — thread-safe, for response frames that
//!   may cross a reactor boundary. Frames allocated here remember their
//!   home pool so whoever finishes with them can route them back.
//!
//! Capacity classes are powers of two starting at 64 bytes. `allocate`
//! returns a frame with zeroed cursors and at least the requested
//! capacity; `release` walks `next` chains and returns every link.
//! The allocation/release counters back the pool-balance invariant
//! `allocations == releases + in_flight`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

use crate::frame::Frame;

/// Smallest pooled capacity (class 0).
const MIN_CLASS: usize = 64;
/// Number of capacity classes: 64 B .. 2 GiB.
const NUM_CLASSES: usize = 26;
/// Frames kept per class before releases start dropping storage.
const DEFAULT_POOL_LIMIT: usize = 1024;

#[inline]
fn class_of(capacity: usize) -> usize {
    let c = capacity.max(MIN_CLASS).next_power_of_two();
    (c.trailing_zeros() - MIN_CLASS.trailing_zeros()) as usize
}

#[inline]
fn class_capacity(class: usize) -> usize {
    MIN_CLASS << class
}

/// Reactor-local frame pool. Not `Sync` — the owning reactor thread is
/// the only caller.
pub struct FrameAllocator {
    classes: Vec<Vec<Box<Frame>>>,
    pool_limit: usize,
    allocations: u64,
    releases: u64,
}

impl FrameAllocator {
    pub fn new() -> Self {
        Self::with_pool_limit(DEFAULT_POOL_LIMIT)
    }

    pub fn with_pool_limit(pool_limit: usize) -> Self {
        Self {
            classes: (0..NUM_CLASSES).map(|_| Vec::new()).collect(),
            pool_limit,
            allocations: 0,
            releases: 0,
        }
    }

    /// Allocate a frame with capacity for at least `size` bytes.
    /// Cursors are zeroed; storage may be recycled.
    pub fn allocate(&mut self, size: usize) -> Box<Frame> {
        let class = class_of(size);
        self.allocations += 1;
        match self.classes[class].pop() {
            Some(frame) => frame,
            None => Box::new(Frame::with_capacity(class_capacity(class))),
        }
    }

    /// Allocate and fill a complete message frame in one step.
    pub fn allocate_message(&mut self, flags: u32, payload: &[u8]) -> Box<Frame> {
        let size = crate::frame::HEADER_SIZE + payload.len();
        let mut frame = self.allocate(size);
        frame.write_header(size as u32, flags);
        frame.write(payload);
        frame
    }

    /// Return a frame (and everything chained behind it) to the pool.
    pub fn release(&mut self, frame: Box<Frame>) {
        let mut cur = Some(frame);
        while let Some(mut f) = cur {
            cur = f.next.take();
            self.release_one(f);
        }
    }

    fn release_one(&mut self, mut frame: Box<Frame>) {
        self.releases += 1;
        frame.reset();
        let class = class_of(frame.capacity());
        if self.classes[class].len() < self.pool_limit {
            self.classes[class].push(frame);
        }
        // else: drop, the class is saturated
    }

    pub fn allocations(&self) -> u64 {
        self.allocations
    }

    pub fn releases(&self) -> u64 {
        self.releases
    }

    /// Frames handed out and not yet returned. Saturating: the pool
    /// may adopt frames other allocators produced.
    pub fn in_flight(&self) -> u64 {
        self.allocations.saturating_sub(self.releases)
    }
}

impl Default for FrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe frame pool for response-side frames.
///
/// Free lists are lock-free bounded queues; a saturated class drops
/// storage on release, exactly like the local allocator.
pub struct ParallelFrameAllocator {
    classes: Vec<ArrayQueue<Box<Frame>>>,
    allocations: AtomicU64,
    releases: AtomicU64,
}

impl ParallelFrameAllocator {
    pub fn new() -> Arc<Self> {
        Self::with_pool_limit(DEFAULT_POOL_LIMIT)
    }

    pub fn with_pool_limit(pool_limit: usize) -> Arc<Self> {
        Arc::new(Self {
            classes: (0..NUM_CLASSES)
                .map(|_| ArrayQueue::new(pool_limit))
                .collect(),
            allocations: AtomicU64::new(0),
            releases: AtomicU64::new(0),
        })
    }

    /// Allocate a frame that remembers this pool as its home.
    pub fn allocate(self: &Arc<Self>, size: usize) -> Box<Frame> {
        let class = class_of(size);
        self.allocations.fetch_add(1, Ordering::Relaxed);
        let mut frame = match self.classes[class].pop() {
            Some(frame) => frame,
            None => Box::new(Frame::with_capacity(class_capacity(class))),
        };
        frame.home = Some(Arc::clone(self));
        frame
    }

    /// Allocate and fill a complete message frame in one step.
    pub fn allocate_message(self: &Arc<Self>, flags: u32, payload: &[u8]) -> Box<Frame> {
        let size = crate::frame::HEADER_SIZE + payload.len();
        let mut frame = self.allocate(size);
        frame.write_header(size as u32, flags);
        frame.write(payload);
        frame
    }

    /// Return a frame chain to the pool. The home reference is cleared
    /// before pooling so pooled frames never keep the pool alive.
    pub fn release(&self, frame: Box<Frame>) {
        let mut cur = Some(frame);
        while let Some(mut f) = cur {
            cur = f.next.take();
            self.release_one(f);
        }
    }

    fn release_one(&self, mut frame: Box<Frame>) {
        self.releases.fetch_add(1, Ordering::Relaxed);
        // reset() drops the home Arc, so pooled frames never keep the
        // pool alive.
        frame.reset();
        let class = class_of(frame.capacity());
        let _ = self.classes[class].push(frame);
    }

    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    pub fn releases(&self) -> u64 {
        self.releases.load(Ordering::Relaxed)
    }

    pub fn in_flight(&self) -> u64 {
        self.allocations().saturating_sub(self.releases())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FLAG_OP_RESPONSE, HEADER_SIZE};

    #[test]
    fn classes_round_up_to_powers_of_two() {
        assert_eq!(class_of(1), 0);
        assert_eq!(class_of(64), 0);
        assert_eq!(class_of(65), 1);
        assert_eq!(class_of(128), 1);
        assert_eq!(class_capacity(class_of(1000)), 1024);
    }

    #[test]
    fn allocate_recycles_storage() {
        let mut pool = FrameAllocator::new();
        let f = pool.allocate(100);
        assert_eq!(f.capacity(), 128);
        pool.release(f);
        let g = pool.allocate(120);
        assert_eq!(g.capacity(), 128);
        assert_eq!(g.position(), 0);
        assert_eq!(pool.allocations(), 2);
        assert_eq!(pool.releases(), 1);
        assert_eq!(pool.in_flight(), 1);
    }

    #[test]
    fn release_walks_chains() {
        let mut pool = FrameAllocator::new();
        let mut a = pool.allocate(64);
        let mut b = pool.allocate(64);
        b.next = Some(pool.allocate(64));
        a.next = Some(b);
        pool.release(a);
        assert_eq!(pool.releases(), 3);
        assert_eq!(pool.in_flight(), 0);
    }

    #[test]
    fn allocate_message_builds_complete_frame() {
        let mut pool = FrameAllocator::new();
        let f = pool.allocate_message(FLAG_OP_RESPONSE, &[9, 8, 7]);
        assert!(f.is_complete());
        assert_eq!(f.size(), HEADER_SIZE + 3);
        assert!(f.flag_raised(FLAG_OP_RESPONSE));
        assert_eq!(f.payload(), &[9, 8, 7]);
    }

    #[test]
    fn parallel_pool_balance_across_threads() {
        let pool = ParallelFrameAllocator::new();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let pool = Arc::clone(&pool);
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    let mut f = pool.allocate(256);
                    let home = f.take_home().expect("parallel frames carry a home");
                    home.release(f);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(pool.allocations(), 400);
        assert_eq!(pool.releases(), 400);
        assert_eq!(pool.in_flight(), 0);
    }

    #[test]
    fn parallel_release_clears_home() {
        let pool = ParallelFrameAllocator::new();
        let f = pool.allocate(64);
        pool.release(f);
        let mut g = pool.allocate(64);
        assert!(g.take_home().is_some());
        pool.release(g);
        // Dropping the last external Arc must free the pool even with
        // pooled frames inside (no frame->pool cycle).
        assert_eq!(Arc::strong_count(&pool), 1);
    }
}
