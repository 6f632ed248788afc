//! `IoVector` — bounded staging area for one gather write.
//!
//! Holds up to [`IOV_MAX`] frames and the running `pending` byte count
//! (the sum of `remaining()` over every staged frame). The owning
//! channel fills it from its unflushed queue, materialises an iovec
//! array for the WRITEV submission, and compacts it by however many
//! bytes the kernel reported written.
//!
//! Invariants: `len() <= IOV_MAX`; `pending == Σ frame.remaining()`.

use std::collections::VecDeque;

use crossbeam_queue::ArrayQueue;

use crate::frame::Frame;

/// Kernel limit on iovec entries per writev.
pub const IOV_MAX: usize = 1024;

pub struct IoVector {
    frames: VecDeque<Box<Frame>>,
    pending: usize,
}

impl IoVector {
    pub fn new() -> Self {
        Self {
            frames: VecDeque::new(),
            pending: 0,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Number of staged frames.
    #[inline]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Unwritten bytes across all staged frames.
    #[inline]
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Free slots before the vector is full.
    #[inline]
    pub fn free(&self) -> usize {
        IOV_MAX - self.frames.len()
    }

    /// Stage one frame. Hands the frame back when the vector is full.
    pub fn add(&mut self, frame: Box<Frame>) -> std::result::Result<(), Box<Frame>> {
        if self.frames.len() == IOV_MAX {
            return Err(frame);
        }
        self.pending += frame.remaining();
        self.frames.push_back(frame);
        Ok(())
    }

    /// Move frames off `queue` until the vector is full or the queue is
    /// empty. Returns how many were moved.
    pub fn fill(&mut self, queue: &ArrayQueue<Box<Frame>>) -> usize {
        let mut moved = 0;
        while self.frames.len() < IOV_MAX {
            match queue.pop() {
                Some(frame) => {
                    self.pending += frame.remaining();
                    self.frames.push_back(frame);
                    moved += 1;
                }
                None => break,
            }
        }
        moved
    }

    /// Materialise `(base, len)` pairs for every staged frame into
    /// `out`. The pointers stay valid as long as the frames stay staged.
    pub fn fill_iov(&self, out: &mut Vec<libc::iovec>) {
        out.clear();
        for frame in &self.frames {
            out.push(libc::iovec {
                iov_base: frame.read_ptr() as *mut libc::c_void,
                iov_len: frame.remaining(),
            });
        }
    }

    /// Account for `written` bytes leaving the wire: fully consumed
    /// frames are handed to `release` (with zero bytes remaining), the
    /// first partially consumed frame has its read cursor advanced.
    pub fn compact<F: FnMut(Box<Frame>)>(&mut self, written: usize, mut release: F) {
        debug_assert!(written <= self.pending);
        if written == self.pending {
            for mut frame in self.frames.drain(..) {
                let rest = frame.remaining();
                frame.advance_read(rest);
                release(frame);
            }
            self.pending = 0;
            return;
        }

        let mut w = written;
        while w > 0 {
            let first_remaining = match self.frames.front() {
                Some(frame) => frame.remaining(),
                None => break,
            };
            if w < first_remaining {
                self.frames
                    .front_mut()
                    .expect("front checked above")
                    .advance_read(w);
                w = 0;
            } else {
                let mut frame = self.frames.pop_front().expect("front checked above");
                frame.advance_read(first_remaining);
                w -= first_remaining;
                release(frame);
            }
        }
        self.pending -= written;
    }

    /// Unstage everything (channel close); frames go to `release` with
    /// whatever they still carry.
    pub fn drain<F: FnMut(Box<Frame>)>(&mut self, mut release: F) {
        for frame in self.frames.drain(..) {
            release(frame);
        }
        self.pending = 0;
    }
}

impl Default for IoVector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::FrameAllocator;

    fn frame_of(pool: &mut FrameAllocator, total: usize) -> Box<Frame> {
        let payload = vec![0xA5u8; total - crate::frame::HEADER_SIZE];
        pool.allocate_message(0, &payload)
    }

    #[test]
    fn fill_respects_iov_max() {
        let mut pool = FrameAllocator::new();
        let queue = ArrayQueue::new(2048);
        for _ in 0..2000 {
            queue.push(frame_of(&mut pool, 16)).unwrap();
        }
        let mut iov = IoVector::new();
        assert_eq!(iov.fill(&queue), IOV_MAX);
        assert_eq!(iov.len(), IOV_MAX);
        assert_eq!(iov.pending(), IOV_MAX * 16);
        assert_eq!(queue.len(), 2000 - IOV_MAX);
        // Another fill on a full vector moves nothing.
        assert_eq!(iov.fill(&queue), 0);
    }

    #[test]
    fn add_hands_back_when_full() {
        let mut pool = FrameAllocator::new();
        let mut iov = IoVector::new();
        for _ in 0..IOV_MAX {
            iov.add(frame_of(&mut pool, 16)).unwrap();
        }
        let spare = frame_of(&mut pool, 16);
        assert!(iov.add(spare).is_err());
    }

    #[test]
    fn compact_full_write_releases_everything() {
        let mut pool = FrameAllocator::new();
        let mut iov = IoVector::new();
        for _ in 0..3 {
            iov.add(frame_of(&mut pool, 100)).unwrap();
        }
        let mut released = Vec::new();
        iov.compact(300, |f| released.push(f));
        assert_eq!(released.len(), 3);
        assert!(released.iter().all(|f| f.remaining() == 0));
        assert!(iov.is_empty());
        assert_eq!(iov.pending(), 0);
    }

    #[test]
    fn compact_partial_write() {
        // Three 1000-byte frames, kernel reports 1500 written: frame 0
        // released, frame 1 half consumed, frame 2 untouched.
        let mut pool = FrameAllocator::new();
        let mut iov = IoVector::new();
        for _ in 0..3 {
            iov.add(frame_of(&mut pool, 1000)).unwrap();
        }
        let mut released = 0;
        iov.compact(1500, |_| released += 1);
        assert_eq!(released, 1);
        assert_eq!(iov.len(), 2);
        assert_eq!(iov.pending(), 1500);
        assert_eq!(iov.frames[0].remaining(), 500);
        assert_eq!(iov.frames[1].remaining(), 1000);

        // Finishing the write drains the rest.
        let mut released = 0;
        iov.compact(1500, |_| released += 1);
        assert_eq!(released, 2);
        assert!(iov.is_empty());
        assert_eq!(iov.pending(), 0);
    }

    #[test]
    fn compact_sub_frame_writes_accumulate() {
        let mut pool = FrameAllocator::new();
        let mut iov = IoVector::new();
        iov.add(frame_of(&mut pool, 1000)).unwrap();
        iov.compact(100, |_| panic!("nothing fully consumed"));
        iov.compact(200, |_| panic!("nothing fully consumed"));
        assert_eq!(iov.pending(), 700);
        let mut released = 0;
        iov.compact(700, |_| released += 1);
        assert_eq!(released, 1);
        assert!(iov.is_empty());
    }

    #[test]
    fn iov_materialisation_matches_cursors() {
        let mut pool = FrameAllocator::new();
        let mut iov = IoVector::new();
        iov.add(frame_of(&mut pool, 100)).unwrap();
        iov.add(frame_of(&mut pool, 50)).unwrap();
        iov.compact(30, |_| {});
        let mut vecs = Vec::new();
        iov.fill_iov(&mut vecs);
        assert_eq!(vecs.len(), 2);
        assert_eq!(vecs[0].iov_len, 70);
        assert_eq!(vecs[1].iov_len, 50);
    }
}
