//! `Ring` — the reactor's view of io_uring.
//!
//! Wraps `io_uring::IoUring` with the four SQE shapes the reactor
//! submits (READ, WRITEV, ACCEPT, and READ on the eventfd) plus the
//! submit / submit-and-wait / drain plumbing. Every SQE's user_data
//! packs the operation kind in the high byte and a table index in the
//! low bits, so the completion pump can dispatch without any lookup
//! state.
//!
//! Nothing here blocks except [`Ring::submit_and_wait`], which is the
//! reactor's single designated parking point.

use std::os::unix::io::RawFd;

use io_uring::{opcode, squeue, types, IoUring};

use tpcnet_core::error::{Result, TpcError};

// ── user_data tag encoding ───────────────────────────────────────────

const OP_SHIFT: u32 = 56;
const IDX_MASK: u64 = (1u64 << OP_SHIFT) - 1;

const CODE_READ: u64 = 1;
const CODE_WRITEV: u64 = 2;
const CODE_ACCEPT: u64 = 3;
const CODE_EVENTFD: u64 = 4;

/// Operation kind carried in an SQE's user_data. The set is closed:
/// dispatch is a `match`, not a handler table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// READ on a channel socket.
    Read,
    /// WRITEV on a channel socket.
    Writev,
    /// ACCEPT on a listener socket.
    Accept,
    /// READ on the wakeup eventfd.
    EventFd,
    /// Anything else — logged and dropped.
    Unknown(u8),
}

#[inline]
pub fn tag(op: Op, idx: u32) -> u64 {
    let code = match op {
        Op::Read => CODE_READ,
        Op::Writev => CODE_WRITEV,
        Op::Accept => CODE_ACCEPT,
        Op::EventFd => CODE_EVENTFD,
        Op::Unknown(c) => c as u64,
    };
    (code << OP_SHIFT) | idx as u64
}

#[inline]
pub fn decode(user_data: u64) -> (Op, u32) {
    let idx = (user_data & IDX_MASK) as u32;
    let op = match user_data >> OP_SHIFT {
        CODE_READ => Op::Read,
        CODE_WRITEV => Op::Writev,
        CODE_ACCEPT => Op::Accept,
        CODE_EVENTFD => Op::EventFd,
        other => Op::Unknown(other as u8),
    };
    (op, idx)
}

// ── completion entry ─────────────────────────────────────────────────

/// A drained CQE, decoupled from the ring's borrow.
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    pub user_data: u64,
    pub result: i32,
    pub flags: u32,
}

// ── ring wrapper ─────────────────────────────────────────────────────

pub struct Ring {
    ring: IoUring,
    /// SQEs pushed but not yet handed to the kernel.
    pending: u32,
    /// Submitted, completion not yet drained.
    inflight: usize,
    /// Beyond this many in-flight ops, new SQEs get the ASYNC hint so
    /// the kernel punts them to io-wq instead of inline issue.
    async_threshold: u32,
}

impl Ring {
    pub fn new(entries: u32, async_threshold: u32) -> Result<Self> {
        let ring = IoUring::builder()
            .build(entries)
            .map_err(|e| TpcError::RingSetup(e.raw_os_error().unwrap_or(-1)))?;
        Ok(Self {
            ring,
            pending: 0,
            inflight: 0,
            async_threshold,
        })
    }

    /// Queue one SQE. `Err(RingFull)` when the SQ has no free slot;
    /// the caller backs off one tick and retries.
    pub fn push(&mut self, sqe: squeue::Entry) -> Result<()> {
        let sqe = if self.inflight as u32 + self.pending > self.async_threshold {
            sqe.flags(squeue::Flags::ASYNC)
        } else {
            sqe
        };
        // Safety: every SQE built by this module points into memory the
        // reactor keeps alive until the matching completion is drained
        // (receive buffers, iovec scratch, accept memory, eventfd buf).
        unsafe {
            self.ring
                .submission()
                .push(&sqe)
                .map_err(|_| TpcError::RingFull)?;
        }
        self.pending += 1;
        Ok(())
    }

    /// Hand queued SQEs to the kernel without blocking.
    pub fn submit(&mut self) -> Result<usize> {
        if self.pending == 0 {
            return Ok(0);
        }
        let n = self
            .ring
            .submit()
            .map_err(|e| TpcError::Submit(e.raw_os_error().unwrap_or(-1)))?;
        self.note_submitted(n);
        Ok(n)
    }

    /// Submit queued SQEs and block until at least `want` completions
    /// are available. EINTR is a spurious wakeup, not an error.
    pub fn submit_and_wait(&mut self, want: usize) -> Result<usize> {
        match self.ring.submit_and_wait(want) {
            Ok(n) => {
                self.note_submitted(n);
                Ok(n)
            }
            Err(e) if e.raw_os_error() == Some(libc::EINTR) => Ok(0),
            Err(e) => Err(TpcError::Submit(e.raw_os_error().unwrap_or(-1))),
        }
    }

    fn note_submitted(&mut self, n: usize) {
        self.inflight += n;
        self.pending = self.pending.saturating_sub(n as u32);
    }

    /// Whether the completion queue has entries ready.
    pub fn has_completions(&mut self) -> bool {
        !self.ring.completion().is_empty()
    }

    /// Drain up to `max` CQEs into `out`. Returns how many were drained.
    pub fn pop_completions(&mut self, out: &mut Vec<Completion>, max: usize) -> usize {
        let mut n = 0;
        for cqe in self.ring.completion() {
            if n == max {
                break;
            }
            out.push(Completion {
                user_data: cqe.user_data(),
                result: cqe.result(),
                flags: cqe.flags(),
            });
            n += 1;
        }
        self.inflight = self.inflight.saturating_sub(n);
        n
    }

    pub fn inflight(&self) -> usize {
        self.inflight
    }
}

// ── SQE builders ─────────────────────────────────────────────────────

pub fn read_sqe(fd: RawFd, buf: *mut u8, len: u32, user_data: u64) -> squeue::Entry {
    opcode::Read::new(types::Fd(fd), buf, len)
        .build()
        .user_data(user_data)
}

pub fn writev_sqe(
    fd: RawFd,
    iov: *const libc::iovec,
    iovcnt: u32,
    user_data: u64,
) -> squeue::Entry {
    opcode::Writev::new(types::Fd(fd), iov, iovcnt)
        .build()
        .user_data(user_data)
}

pub fn accept_sqe(
    fd: RawFd,
    addr: *mut libc::sockaddr,
    addrlen: *mut libc::socklen_t,
    user_data: u64,
) -> squeue::Entry {
    opcode::Accept::new(types::Fd(fd), addr, addrlen)
        .flags(libc::SOCK_CLOEXEC)
        .build()
        .user_data(user_data)
}

/// Whether this kernel/environment lets us set up an io_uring at all.
/// Containers and seccomp filters sometimes mask the syscall; callers
/// (tests, demos) can degrade gracefully.
pub fn uring_available() -> bool {
    IoUring::new(8).is_ok()
}
