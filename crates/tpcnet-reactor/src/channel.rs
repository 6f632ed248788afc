//! Per-connection transport state.
//!
//! A channel is split along the ownership boundary:
//!
//! - [`ChannelShared`] is the producer-facing half behind an `Arc`: the
//!   lock-free unflushed queue, the dirty gate and the closed flag. Any
//!   thread may touch it.
//! - [`Channel`] is the reactor-local half: socket fd, receive buffer
//!   cursors, the frame being parsed, the bound [`IoVector`] and the
//!   counters. Only the owning reactor thread touches it, and only the
//!   owning reactor submits I/O against the fd.
//!
//! The dirty gate invariant: `flushed == true` iff the channel sits in
//! the reactor's dirty list. Producers CAS it false→true to win the
//! right to enqueue the channel exactly once per flush cycle.

use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

use tpcnet_core::error::{Result, TpcError};
use tpcnet_core::frame::{Frame, HEADER_SIZE};
use tpcnet_core::id::{ChannelId, ConnectionId};
use tpcnet_core::iovec::IoVector;

use crate::reactor::ReactorShared;

// ── shared half ──────────────────────────────────────────────────────

pub struct ChannelShared {
    id: ChannelId,
    local: SocketAddr,
    remote: SocketAddr,
    /// Producer-facing outbound queue (MPSC: any thread pushes, the
    /// reactor pops).
    pub(crate) unflushed: ArrayQueue<Box<Frame>>,
    /// Dirty gate: true iff the channel is in the reactor's dirty list.
    flushed: AtomicBool,
    closed: AtomicBool,
}

impl ChannelShared {
    pub(crate) fn new(
        id: ChannelId,
        local: SocketAddr,
        remote: SocketAddr,
        queue_capacity: usize,
    ) -> Self {
        Self {
            id,
            local,
            remote,
            unflushed: ArrayQueue::new(queue_capacity),
            flushed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn id(&self) -> ChannelId {
        self.id
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    #[inline]
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Win the dirty gate. True means the caller must enqueue the
    /// channel into the reactor's dirty list.
    #[inline]
    pub(crate) fn try_raise_dirty(&self) -> bool {
        self.flushed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Drop the dirty gate after the channel was popped off the list.
    #[inline]
    pub(crate) fn lower_dirty(&self) {
        self.flushed.store(false, Ordering::Release);
    }
}

// ── public producer handle ───────────────────────────────────────────

/// Cross-thread handle to one channel. Cheap to clone.
#[derive(Clone)]
pub struct ChannelRef {
    shared: Arc<ChannelShared>,
    reactor: Arc<ReactorShared>,
}

impl ChannelRef {
    pub(crate) fn new(shared: Arc<ChannelShared>, reactor: Arc<ReactorShared>) -> Self {
        Self { shared, reactor }
    }

    #[inline]
    pub fn id(&self) -> ChannelId {
        self.shared.id()
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr()
    }

    #[inline]
    pub fn remote_addr(&self) -> SocketAddr {
        self.shared.remote_addr()
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Enqueue without scheduling a flush. Pair with [`flush`].
    ///
    /// [`flush`]: ChannelRef::flush
    pub fn write(&self, frame: Box<Frame>) -> Result<()> {
        if self.shared.is_closed() {
            return Err(TpcError::ChannelClosed);
        }
        self.shared
            .unflushed
            .push(frame)
            .map_err(|_| TpcError::QueueFull)
    }

    /// Make the reactor notice queued frames: raise the dirty gate and
    /// wake the loop if it is parked.
    pub fn flush(&self) {
        if self.shared.try_raise_dirty() {
            self.reactor.enqueue_dirty(self.shared.id());
            self.reactor.wakeup();
        }
    }

    /// Non-blocking enqueue + flush. The transmit order of frames from
    /// one producer is their enqueue order.
    pub fn write_and_flush(&self, frame: Box<Frame>) -> Result<()> {
        self.write(frame)?;
        self.flush();
        Ok(())
    }
}

// ── reactor-local half ───────────────────────────────────────────────

/// Scratch array of iovecs for the in-flight WRITEV.
///
/// Safety of the `Send` impl: the iovecs point into frames staged in
/// the same channel's `IoVector`, and the whole channel only ever moves
/// between threads while no WRITEV is in flight (reactor startup).
pub(crate) struct IovScratch(pub Vec<libc::iovec>);

unsafe impl Send for IovScratch {}

pub(crate) struct Channel {
    pub fd: RawFd,
    pub shared: Arc<ChannelShared>,
    /// Logical peer bound by the service; stamped onto parsed frames.
    pub connection: ConnectionId,

    // Inbound: receive buffer with kernel-write cursor `recv_w` and
    // parser-read cursor `recv_r`, plus the frame under reassembly.
    recv_buf: Box<[u8]>,
    recv_w: usize,
    recv_r: usize,
    pub inbound: Option<Box<Frame>>,

    // Outbound: the bound IoVector is the reactor-local staging for the
    // in-flight WRITEV; `iov_scratch` is the materialised iovec array
    // the SQE points at.
    pub iovec: IoVector,
    pub iov_scratch: IovScratch,

    pub read_pending: bool,
    pub writev_pending: bool,
    pub closing: bool,

    pub bytes_read: u64,
    pub bytes_written: u64,
    pub frames_read: u64,
    pub frames_written: u64,
    pub read_events: u64,
}

impl Channel {
    pub fn new(fd: RawFd, shared: Arc<ChannelShared>, receive_buffer_size: usize) -> Self {
        Self {
            fd,
            shared,
            connection: ConnectionId::NONE,
            recv_buf: vec![0u8; receive_buffer_size].into_boxed_slice(),
            recv_w: 0,
            recv_r: 0,
            inbound: None,
            iovec: IoVector::new(),
            iov_scratch: IovScratch(Vec::new()),
            read_pending: false,
            writev_pending: false,
            closing: false,
            bytes_read: 0,
            bytes_written: 0,
            frames_read: 0,
            frames_written: 0,
            read_events: 0,
        }
    }

    /// Unparsed bytes the kernel has delivered.
    #[inline]
    pub fn readable(&self) -> &[u8] {
        &self.recv_buf[self.recv_r..self.recv_w]
    }

    #[inline]
    pub fn readable_len(&self) -> usize {
        self.recv_w - self.recv_r
    }

    /// Parser consumed `n` bytes.
    #[inline]
    pub fn consume(&mut self, n: usize) {
        debug_assert!(self.recv_r + n <= self.recv_w);
        self.recv_r += n;
    }

    /// Kernel wrote `n` bytes at the write cursor.
    #[inline]
    pub fn note_received(&mut self, n: usize) {
        debug_assert!(self.recv_w + n <= self.recv_buf.len());
        self.recv_w += n;
    }

    /// Room left for the next READ.
    #[inline]
    pub fn recv_free(&self) -> usize {
        self.recv_buf.len() - self.recv_w
    }

    /// Where the next READ lands.
    #[inline]
    pub fn recv_ptr(&mut self) -> *mut u8 {
        self.recv_buf[self.recv_w..].as_mut_ptr()
    }

    /// Peek at a frame header without consuming it. Requires 8 readable
    /// bytes.
    pub fn peek_header(&self) -> (usize, u32) {
        let b = self.readable();
        debug_assert!(b.len() >= HEADER_SIZE);
        let size = u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as usize;
        let flags = u32::from_be_bytes([b[4], b[5], b[6], b[7]]);
        (size, flags)
    }

    /// Discard the consumed prefix of the receive buffer. Must only run
    /// while no READ is in flight (the kernel holds a pointer at
    /// `recv_w` otherwise).
    pub fn compact_recv(&mut self) {
        debug_assert!(!self.read_pending);
        if self.recv_r == self.recv_w {
            self.recv_r = 0;
            self.recv_w = 0;
        } else if self.recv_r > 0 {
            self.recv_buf.copy_within(self.recv_r..self.recv_w, 0);
            self.recv_w -= self.recv_r;
            self.recv_r = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared() -> Arc<ChannelShared> {
        Arc::new(ChannelShared::new(
            ChannelId::new(0),
            "127.0.0.1:1".parse().unwrap(),
            "127.0.0.1:2".parse().unwrap(),
            64,
        ))
    }

    #[test]
    fn dirty_gate_is_won_once() {
        let sh = shared();
        assert!(sh.try_raise_dirty());
        assert!(!sh.try_raise_dirty());
        sh.lower_dirty();
        assert!(sh.try_raise_dirty());
    }

    #[test]
    fn recv_cursor_accounting() {
        let mut ch = Channel::new(-1, shared(), 64);
        assert_eq!(ch.recv_free(), 64);
        // Pretend the kernel delivered 16 bytes.
        ch.recv_buf[..16].copy_from_slice(&[7u8; 16]);
        ch.note_received(16);
        assert_eq!(ch.readable_len(), 16);
        ch.consume(10);
        assert_eq!(ch.readable_len(), 6);
        ch.compact_recv();
        assert_eq!(ch.readable_len(), 6);
        assert_eq!(ch.recv_free(), 58);
        assert_eq!(ch.readable(), &[7u8; 6]);
    }

    #[test]
    fn compact_resets_empty_buffer() {
        let mut ch = Channel::new(-1, shared(), 64);
        ch.note_received(20);
        ch.consume(20);
        ch.compact_recv();
        assert_eq!(ch.recv_free(), 64);
        assert_eq!(ch.readable_len(), 0);
    }

    #[test]
    fn peek_header_reads_big_endian() {
        let mut ch = Channel::new(-1, shared(), 64);
        ch.recv_buf[..8].copy_from_slice(&[0, 0, 0, 32, 0, 0, 0, 1]);
        ch.note_received(8);
        let (size, flags) = ch.peek_header();
        assert_eq!(size, 32);
        assert_eq!(flags, 1);
    }
}
