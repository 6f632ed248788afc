//! The reactor: one single-threaded event loop per pinned CPU.
//!
//! Per iteration the loop (a) drains and runs public tasks, (b) gives
//! the cooperative scheduler one tick, (c) flushes dirty channels with
//! one WRITEV each, then (d) consults the completion queue: drain and
//! dispatch if entries are ready, otherwise submit — blocking on
//! submit-and-wait only when spin mode is off, the scheduler reported
//! no more work, and the public queue is empty.
//!
//! ## Wakeup discipline
//!
//! `wakeup()` is a no-op in spin mode or when called from the reactor
//! thread. Otherwise `wakeup_needed.load() && CAS(true -> false)` gates
//! a single eventfd write per blocking window, so producer storms cost
//! at most one syscall. Missed-wakeup freedom comes from ordering: the
//! loop raises `wakeup_needed` *before* testing the public queue, and
//! producers push *before* testing `wakeup_needed` (SeqCst on both
//! sides). The reactor keeps exactly one READ on the eventfd in flight
//! and re-arms it on completion.

use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam_channel::bounded;
use crossbeam_queue::ArrayQueue;
use tracing::{debug, info, trace, warn};

use tpcnet_core::alloc::FrameAllocator;
use tpcnet_core::config::ReactorConfig;
use tpcnet_core::error::{Result, TpcError};
use tpcnet_core::frame::{Frame, FLAG_OP_RESPONSE, HEADER_SIZE};
use tpcnet_core::id::{ChannelId, ConnectionId, ListenerId};

use crate::channel::{Channel, ChannelRef, ChannelShared};
use crate::listener::Listener;
use crate::scheduler::{Scheduler, TICK_BUDGET};
use crate::service::Service;
use crate::sockets;
use crate::uring::{self, Completion, Op, Ring};
use crate::wakeup::EventFd;

/// Work posted onto a reactor from any thread.
pub type Task = Box<dyn FnOnce(&mut Reactor) + Send + 'static>;

const COMPLETION_BATCH: usize = 256;

// ── shared state ─────────────────────────────────────────────────────

/// The cross-thread face of a reactor: task ingress, the dirty list
/// and the wakeup machinery. Everything else is thread-local to the
/// reactor.
pub struct ReactorShared {
    run_queue: ArrayQueue<Task>,
    dirty: ArrayQueue<ChannelId>,
    running: AtomicBool,
    wakeup_needed: AtomicBool,
    spin: bool,
    evfd: EventFd,
    thread_id: OnceLock<ThreadId>,
}

impl ReactorShared {
    /// Post a task for the reactor thread. Wakes the loop if parked.
    pub fn execute(&self, task: Task) -> Result<()> {
        if !self.running.load(Ordering::Acquire) {
            return Err(TpcError::ReactorGone);
        }
        self.run_queue
            .push(task)
            .map_err(|_| TpcError::QueueFull)?;
        self.wakeup();
        Ok(())
    }

    /// Break the reactor out of a blocking completion wait. No-op in
    /// spin mode or when called on the reactor thread. The CAS bounds
    /// the cost to one eventfd write per blocking window.
    pub fn wakeup(&self) {
        if self.spin {
            return;
        }
        if let Some(id) = self.thread_id.get() {
            if *id == thread::current().id() {
                return;
            }
        }
        if self.wakeup_needed.load(Ordering::SeqCst)
            && self
                .wakeup_needed
                .compare_exchange(true, false, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
        {
            let _ = self.evfd.notify();
        }
    }

    /// Put a channel on the dirty list. Callers must have won the
    /// channel's dirty gate first; the gate guarantees at most one
    /// entry per channel, which the queue capacity relies on.
    pub(crate) fn enqueue_dirty(&self, id: ChannelId) {
        let _ = self.dirty.push(id);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

// ── the reactor ──────────────────────────────────────────────────────

pub struct Reactor {
    // Field order is drop order: the ring goes down first so in-flight
    // kernel ops are cancelled before buffers they reference drop.
    ring: Ring,
    cfg: ReactorConfig,
    shared: Arc<ReactorShared>,
    channels: Vec<Option<Channel>>,
    free_channels: Vec<u32>,
    listeners: Vec<Option<Listener>>,
    request_pool: FrameAllocator,
    service: Box<dyn Service>,
    scheduler: Scheduler<Task>,
    evfd_buf: Box<[u8; 8]>,
    comp_buf: Vec<Completion>,
}

impl Reactor {
    /// Create a reactor, pin it to its CPU and run it on a fresh
    /// thread. Setup errors (ring, eventfd, bad config) surface here
    /// synchronously.
    pub fn start(cfg: ReactorConfig, service: Box<dyn Service>) -> Result<ReactorHandle> {
        cfg.validate()?;
        let ring = Ring::new(cfg.ring_size, cfg.iosqe_async_threshold)?;
        let evfd = EventFd::create()?;
        let shared = Arc::new(ReactorShared {
            run_queue: ArrayQueue::new(cfg.run_queue_capacity),
            dirty: ArrayQueue::new(cfg.max_channels),
            running: AtomicBool::new(true),
            wakeup_needed: AtomicBool::new(false),
            spin: cfg.spin,
            evfd,
            thread_id: OnceLock::new(),
        });

        let name = cfg.name.clone();
        let cpu = cfg.cpu;
        let max_channels = cfg.max_channels;
        let mut reactor = Reactor {
            ring,
            cfg,
            shared: Arc::clone(&shared),
            channels: (0..max_channels).map(|_| None).collect(),
            free_channels: (0..max_channels as u32).rev().collect(),
            listeners: Vec::new(),
            request_pool: FrameAllocator::new(),
            service,
            scheduler: Scheduler::new(),
            evfd_buf: Box::new([0u8; 8]),
            comp_buf: Vec::with_capacity(COMPLETION_BATCH),
        };

        let join = thread::Builder::new()
            .name(name)
            .spawn(move || {
                if let Some(cpu) = cpu {
                    if core_affinity::set_for_current(core_affinity::CoreId { id: cpu }) {
                        info!(cpu, "reactor pinned");
                    } else {
                        warn!(cpu, "failed to pin reactor thread");
                    }
                }
                let _ = reactor.shared.thread_id.set(thread::current().id());
                reactor.run();
            })
            .map_err(|_| TpcError::Os(libc::EAGAIN))?;

        Ok(ReactorHandle {
            shared,
            join: Some(join),
        })
    }

    // ── event loop ───────────────────────────────────────────────────

    fn run(&mut self) {
        info!(name = %self.cfg.name, spin = self.cfg.spin, "reactor running");
        self.arm_eventfd();
        let shared = Arc::clone(&self.shared);
        while shared.running.load(Ordering::Acquire) {
            self.run_public_tasks();
            let more_work = self.tick_scheduler();
            self.flush_dirty_channels();

            if self.ring.has_completions() {
                self.drain_completions();
            } else if self.cfg.spin || more_work {
                if let Err(e) = self.ring.submit() {
                    warn!(%e, "submit failed");
                }
            } else {
                shared.wakeup_needed.store(true, Ordering::SeqCst);
                // Producers enqueue (task or dirty channel) before they
                // test wakeup_needed; testing both queues after raising
                // it closes the missed-wakeup window from either path.
                if shared.run_queue.is_empty() && shared.dirty.is_empty() {
                    if let Err(e) = self.ring.submit_and_wait(1) {
                        warn!(%e, "submit-and-wait failed");
                    }
                } else if let Err(e) = self.ring.submit() {
                    warn!(%e, "submit failed");
                }
                shared.wakeup_needed.store(false, Ordering::SeqCst);
            }
        }
        self.teardown();
    }

    /// Run the cross-thread tasks visible right now. New arrivals wait
    /// for the next iteration so producers cannot starve the loop.
    fn run_public_tasks(&mut self) {
        let shared = Arc::clone(&self.shared);
        let visible = shared.run_queue.len();
        for _ in 0..visible {
            match shared.run_queue.pop() {
                Some(task) => task(self),
                None => break,
            }
        }
    }

    /// One scheduler tick: up to `TICK_BUDGET` units, then report
    /// whether work remains (the loop's dont-block hint).
    fn tick_scheduler(&mut self) -> bool {
        for _ in 0..TICK_BUDGET {
            match self.scheduler.pop() {
                Some(task) => task(self),
                None => return false,
            }
        }
        self.scheduler.has_work()
    }

    fn flush_dirty_channels(&mut self) {
        let shared = Arc::clone(&self.shared);
        let visible = shared.dirty.len();
        for _ in 0..visible {
            match shared.dirty.pop() {
                Some(id) => self.handle_write(id),
                None => break,
            }
        }
    }

    fn drain_completions(&mut self) {
        let mut buf = std::mem::take(&mut self.comp_buf);
        loop {
            buf.clear();
            if self.ring.pop_completions(&mut buf, COMPLETION_BATCH) == 0 {
                break;
            }
            for i in 0..buf.len() {
                let c = buf[i];
                match uring::decode(c.user_data) {
                    (Op::EventFd, _) => self.arm_eventfd(),
                    (Op::Read, idx) => self.handle_read(ChannelId::new(idx), c.result),
                    (Op::Writev, idx) => self.handle_writev(ChannelId::new(idx), c.result),
                    (Op::Accept, idx) => self.handle_accept(ListenerId::new(idx), c.result),
                    (Op::Unknown(op), _) => warn!(op, "unknown completion opcode, dropped"),
                }
            }
        }
        self.comp_buf = buf;
    }

    // ── submission arming ────────────────────────────────────────────

    fn arm_eventfd(&mut self) {
        let fd = self.shared.evfd.fd();
        let sqe = uring::read_sqe(
            fd,
            self.evfd_buf.as_mut_ptr(),
            8,
            uring::tag(Op::EventFd, 0),
        );
        if self.ring.push(sqe).is_err() {
            // Without this READ in flight wakeups are lost; retry next
            // tick.
            self.scheduler
                .schedule(Box::new(|r: &mut Reactor| r.arm_eventfd()));
        }
    }

    fn arm_read(&mut self, id: ChannelId) {
        let idx = id.as_usize();
        let (fd, ptr, free) = {
            let Some(ch) = self.channels.get_mut(idx).and_then(Option::as_mut) else {
                return;
            };
            if ch.read_pending || ch.closing {
                return;
            }
            (ch.fd, ch.recv_ptr(), ch.recv_free())
        };
        if free == 0 {
            // The parser drains the buffer into the inbound frame every
            // read, so a full buffer means a header we can never hold.
            self.close_channel(id, Some(TpcError::Protocol("receive buffer exhausted")));
            return;
        }
        let sqe = uring::read_sqe(fd, ptr, free as u32, uring::tag(Op::Read, id.as_u32()));
        match self.ring.push(sqe) {
            Ok(()) => {
                if let Some(ch) = self.channels.get_mut(idx).and_then(Option::as_mut) {
                    ch.read_pending = true;
                }
            }
            Err(_) => {
                trace!(channel = %id, "SQ full, retrying read arm next tick");
                self.scheduler
                    .schedule(Box::new(move |r: &mut Reactor| r.arm_read(id)));
            }
        }
    }

    fn arm_accept(&mut self, lid: ListenerId) {
        let lidx = lid.as_usize();
        let Some(listener) = self.listeners.get_mut(lidx).and_then(Option::as_mut) else {
            return;
        };
        listener.reset_accept_mem();
        let fd = listener.fd;
        let (addr_ptr, len_ptr) = listener.accept_ptrs();
        let sqe = uring::accept_sqe(fd, addr_ptr, len_ptr, uring::tag(Op::Accept, lid.as_u32()));
        if self.ring.push(sqe).is_err() {
            trace!(listener = ?lid, "SQ full, retrying accept arm next tick");
            self.scheduler
                .schedule(Box::new(move |r: &mut Reactor| r.arm_accept(lid)));
        }
    }

    // ── completion handlers ──────────────────────────────────────────

    fn handle_accept(&mut self, lid: ListenerId, res: i32) {
        // Read the peer address out of the accept memory before the
        // re-arm resets it.
        let peer = self
            .listeners
            .get(lid.as_usize())
            .and_then(Option::as_ref)
            .and_then(|l| l.accepted_peer());
        self.arm_accept(lid);

        if res < 0 {
            warn!(listener = ?lid, errno = -res, "accept failed");
            return;
        }
        let fd = res as RawFd;
        if let Err(e) = sockets::apply_socket_options(fd, &self.cfg) {
            warn!(fd, %e, "socket configure failed, dropping connection");
            unsafe { libc::close(fd) };
            return;
        }
        let local = sockets::local_addr(fd).unwrap_or_else(|_| unspecified());
        let peer = peer.unwrap_or_else(unspecified);
        let id = match self.register_channel(fd, local, peer) {
            Ok(id) => id,
            Err(e) => {
                warn!(%e, %peer, "dropping connection");
                unsafe { libc::close(fd) };
                return;
            }
        };
        debug!(channel = %id, %peer, "accepted");
        self.arm_read(id);
        self.service.on_accept(id, peer);
    }

    fn handle_read(&mut self, id: ChannelId, res: i32) {
        let idx = id.as_usize();
        let Some(ch) = self.channels.get_mut(idx).and_then(Option::as_mut) else {
            return;
        };
        ch.read_pending = false;
        if ch.closing {
            self.finish_close(id);
            return;
        }
        if res == 0 {
            trace!(channel = %id, "peer closed");
            self.close_channel(id, None);
            return;
        }
        if res < 0 {
            let errno = -res;
            if errno == libc::EAGAIN || errno == libc::EINTR {
                self.arm_read(id);
                return;
            }
            self.close_channel(id, Some(TpcError::Os(errno)));
            return;
        }

        let Some(ch) = self.channels.get_mut(idx).and_then(Option::as_mut) else {
            return;
        };
        ch.note_received(res as usize);
        ch.read_events += 1;
        ch.bytes_read += res as u64;

        // Parse (which compacts the receive buffer) before re-arming:
        // the next READ must target the compacted write cursor.
        self.parse_inbound(id);
        self.arm_read(id);
    }

    fn handle_writev(&mut self, id: ChannelId, res: i32) {
        let idx = id.as_usize();
        let Some(ch) = self.channels.get_mut(idx).and_then(Option::as_mut) else {
            return;
        };
        ch.writev_pending = false;
        if ch.closing {
            self.finish_close(id);
            return;
        }
        if res < 0 {
            self.close_channel(id, Some(TpcError::Os(-res)));
            return;
        }

        let Some(ch) = self.channels.get_mut(idx).and_then(Option::as_mut) else {
            return;
        };
        let written = res as usize;
        ch.bytes_written += written as u64;
        let pool = &mut self.request_pool;
        let mut finished = 0u64;
        ch.iovec.compact(written, |f| {
            release_frame(pool, f);
            finished += 1;
        });
        ch.frames_written += finished;

        // Partial write or frames queued behind the batch: resubmit.
        if !ch.iovec.is_empty() || !ch.shared.unflushed.is_empty() {
            self.handle_write(id);
        }
    }

    // ── outbound path ────────────────────────────────────────────────

    /// Flush one dirty channel: stage frames into the IoVector and
    /// submit one WRITEV. Precondition: the channel was just popped off
    /// the dirty list (its gate is still raised).
    pub(crate) fn handle_write(&mut self, id: ChannelId) {
        let idx = id.as_usize();
        let Some(ch) = self.channels.get_mut(idx).and_then(Option::as_mut) else {
            return;
        };
        if ch.closing {
            ch.shared.lower_dirty();
            return;
        }
        if !ch.writev_pending {
            ch.iovec.fill(&ch.shared.unflushed);
            if !ch.iovec.is_empty() {
                ch.iovec.fill_iov(&mut ch.iov_scratch.0);
                let sqe = uring::writev_sqe(
                    ch.fd,
                    ch.iov_scratch.0.as_ptr(),
                    ch.iov_scratch.0.len() as u32,
                    uring::tag(Op::Writev, id.as_u32()),
                );
                match self.ring.push(sqe) {
                    Ok(()) => ch.writev_pending = true,
                    Err(_) => {
                        trace!(channel = %id, "SQ full, retrying writev next tick");
                        self.scheduler
                            .schedule(Box::new(move |r: &mut Reactor| r.redirty(id)));
                    }
                }
            }
        }
        // The channel left the dirty list: lower the gate, then
        // re-raise if frames raced in and no completion will resubmit.
        ch.shared.lower_dirty();
        if !ch.writev_pending && !ch.shared.unflushed.is_empty() && ch.shared.try_raise_dirty() {
            self.shared.enqueue_dirty(id);
        }
    }

    fn redirty(&mut self, id: ChannelId) {
        let Some(ch) = self.channels.get(id.as_usize()).and_then(Option::as_ref) else {
            return;
        };
        if ch.closing {
            return;
        }
        if ch.shared.try_raise_dirty() {
            self.shared.enqueue_dirty(id);
        }
    }

    /// Enqueue a frame on a channel owned by this reactor and mark it
    /// dirty. The inline reply path for services; producers on other
    /// threads go through [`ChannelRef::write_and_flush`].
    pub fn send(&mut self, id: ChannelId, frame: Box<Frame>) -> Result<()> {
        let Some(ch) = self.channels.get(id.as_usize()).and_then(Option::as_ref) else {
            return Err(TpcError::ChannelClosed);
        };
        if ch.closing {
            return Err(TpcError::ChannelClosed);
        }
        ch.shared
            .unflushed
            .push(frame)
            .map_err(|_| TpcError::QueueFull)?;
        if ch.shared.try_raise_dirty() {
            self.shared.enqueue_dirty(id);
        }
        Ok(())
    }

    // ── inbound frame parser ─────────────────────────────────────────

    /// Reassemble frames from the channel's receive buffer. Survives
    /// arbitrary TCP segmentation: split headers, split payloads and
    /// coalesced frames all restart cleanly at the stored cursor.
    fn parse_inbound(&mut self, id: ChannelId) {
        let idx = id.as_usize();
        let max_frame = self.cfg.max_frame_size;

        let mut requests: Vec<Box<Frame>> = Vec::new();
        let mut responses: Vec<Box<Frame>> = Vec::new();
        let mut violation: Option<&'static str> = None;

        {
            let Some(ch) = self.channels.get_mut(idx).and_then(Option::as_mut) else {
                return;
            };
            let pool = &mut self.request_pool;
            loop {
                let mut frame = match ch.inbound.take() {
                    Some(f) => f,
                    None => {
                        if ch.readable_len() < HEADER_SIZE {
                            break;
                        }
                        let (size, flags) = ch.peek_header();
                        if size < HEADER_SIZE {
                            violation = Some("declared frame size below header");
                            break;
                        }
                        if size > max_frame {
                            violation = Some("declared frame size above configured max");
                            break;
                        }
                        let mut f = pool.allocate(size);
                        f.write_header(size as u32, flags);
                        f.channel = id;
                        f.connection = ch.connection;
                        ch.consume(HEADER_SIZE);
                        f
                    }
                };

                let copied = frame.write(ch.readable());
                ch.consume(copied);

                if !frame.is_complete() {
                    ch.inbound = Some(frame);
                    break;
                }

                frame.rewind_to_payload();
                ch.frames_read += 1;
                if frame.flag_raised(FLAG_OP_RESPONSE) {
                    responses.push(frame);
                } else {
                    requests.push(frame);
                }
            }
            ch.compact_recv();
        }

        for frame in requests {
            if let Some(reply) = self.service.on_request(frame) {
                if let Err(e) = self.send(id, reply) {
                    debug!(channel = %id, %e, "reply dropped");
                }
            }
        }

        if !responses.is_empty() {
            // Chain in final-byte arrival order.
            let mut chain: Option<Box<Frame>> = None;
            for mut f in responses.into_iter().rev() {
                f.next = chain.take();
                chain = Some(f);
            }
            if let Some(chain) = chain {
                self.service.on_responses(chain);
            }
        }

        if let Some(msg) = violation {
            warn!(channel = %id, msg, "protocol violation");
            self.close_channel(id, Some(TpcError::Protocol(msg)));
        }
    }

    // ── channel lifecycle ────────────────────────────────────────────

    fn register_channel(
        &mut self,
        fd: RawFd,
        local: SocketAddr,
        remote: SocketAddr,
    ) -> Result<ChannelId> {
        let slot = self.free_channels.pop().ok_or(TpcError::TableFull)?;
        let id = ChannelId::new(slot);
        let shared = Arc::new(ChannelShared::new(
            id,
            local,
            remote,
            self.cfg.channel_queue_capacity,
        ));
        self.channels[slot as usize] =
            Some(Channel::new(fd, shared, self.cfg.receive_buffer_size));
        Ok(id)
    }

    /// Open an outbound channel. The connect itself is a blocking
    /// syscall on the reactor thread; once established, a READ is
    /// armed and the channel behaves like any accepted one.
    pub fn connect(&mut self, addr: SocketAddr) -> Result<ChannelRef> {
        let fd = sockets::connect_blocking(addr, &self.cfg)?;
        let local = sockets::local_addr(fd)?;
        let id = match self.register_channel(fd, local, addr) {
            Ok(id) => id,
            Err(e) => {
                unsafe { libc::close(fd) };
                return Err(e);
            }
        };
        debug!(channel = %id, remote = %addr, "connected");
        self.arm_read(id);
        Ok(self.channel_ref(id).expect("channel just registered"))
    }

    /// Bind + listen and arm the ACCEPT. Returns the id and the actual
    /// bound address (for port 0 binds).
    pub fn register_accept(&mut self, addr: SocketAddr) -> Result<(ListenerId, SocketAddr)> {
        let listener = Listener::open(addr, &self.cfg)?;
        let local = listener.local;
        let lid = ListenerId::new(self.listeners.len() as u32);
        self.listeners.push(Some(listener));
        self.arm_accept(lid);
        info!(listener = ?lid, %local, "listening");
        Ok((lid, local))
    }

    /// Producer handle for a live channel.
    pub fn channel_ref(&self, id: ChannelId) -> Option<ChannelRef> {
        self.channels
            .get(id.as_usize())
            .and_then(Option::as_ref)
            .map(|ch| ChannelRef::new(Arc::clone(&ch.shared), Arc::clone(&self.shared)))
    }

    /// Bind the service's logical peer id to a channel; parsed frames
    /// carry it from then on.
    pub fn set_connection(&mut self, id: ChannelId, connection: ConnectionId) {
        if let Some(ch) = self.channels.get_mut(id.as_usize()).and_then(Option::as_mut) {
            ch.connection = connection;
        }
    }

    /// The reactor-local request pool.
    pub fn pool(&mut self) -> &mut FrameAllocator {
        &mut self.request_pool
    }

    /// Defer work to a later scheduler tick. This is how a handler
    /// waits: it must not block, so it posts a continuation instead.
    pub fn schedule(&mut self, task: Task) {
        self.scheduler.schedule(task);
    }

    /// Close a channel: producers are cut off, queued frames released,
    /// the partially parsed inbound frame dropped. State the kernel
    /// still references (in-flight READ/WRITEV) is freed when those
    /// completions drain.
    pub fn close_channel(&mut self, id: ChannelId, err: Option<TpcError>) {
        let idx = id.as_usize();
        {
            let Some(ch) = self.channels.get_mut(idx).and_then(Option::as_mut) else {
                return;
            };
            if ch.closing {
                return;
            }
            ch.closing = true;
            ch.shared.mark_closed();
            unsafe { libc::close(ch.fd) };
            ch.fd = -1;
            debug!(
                channel = %id,
                bytes_read = ch.bytes_read,
                bytes_written = ch.bytes_written,
                frames_read = ch.frames_read,
                frames_written = ch.frames_written,
                read_events = ch.read_events,
                ?err,
                "channel closed"
            );
            let pool = &mut self.request_pool;
            while let Some(f) = ch.shared.unflushed.pop() {
                release_frame(pool, f);
            }
            if let Some(f) = ch.inbound.take() {
                release_frame(pool, f);
            }
        }
        self.service.on_close(id, err);
        self.finish_close(id);
    }

    /// Free the channel slot once no kernel op references it.
    fn finish_close(&mut self, id: ChannelId) {
        let idx = id.as_usize();
        let quiescent = {
            let Some(ch) = self.channels.get(idx).and_then(Option::as_ref) else {
                return;
            };
            ch.closing && !ch.read_pending && !ch.writev_pending
        };
        if !quiescent {
            return;
        }
        if let Some(mut ch) = self.channels[idx].take() {
            let pool = &mut self.request_pool;
            ch.iovec.drain(|f| release_frame(pool, f));
        }
        self.free_channels.push(idx as u32);
    }

    fn teardown(&mut self) {
        let ids: Vec<ChannelId> = self
            .channels
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|_| ChannelId::new(i as u32)))
            .collect();
        for id in ids {
            self.close_channel(id, None);
        }
        // Slots still holding in-flight kernel ops stay allocated; they
        // drop with the reactor, after the ring (field order) has torn
        // the ring down and released its references.
        self.listeners.clear();
        info!(
            name = %self.cfg.name,
            frames_in_flight = self.request_pool.in_flight(),
            "reactor terminated"
        );
    }
}

fn unspecified() -> SocketAddr {
    "0.0.0.0:0".parse().expect("static addr")
}

/// Route a frame back to its pool: the thread-safe home pool if it has
/// one, the reactor's request pool otherwise.
fn release_frame(pool: &mut FrameAllocator, mut frame: Box<Frame>) {
    match frame.take_home() {
        Some(home) => home.release(frame),
        None => pool.release(frame),
    }
}

// ── handle ───────────────────────────────────────────────────────────

/// Owner's handle to a running reactor. Dropping it shuts the reactor
/// down and joins the thread.
pub struct ReactorHandle {
    shared: Arc<ReactorShared>,
    join: Option<JoinHandle<()>>,
}

impl ReactorHandle {
    /// Post a closure to run on the reactor thread.
    pub fn execute<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Reactor) + Send + 'static,
    {
        self.shared.execute(Box::new(f))
    }

    /// Bind + listen on `addr`; resolves once the reactor has armed the
    /// ACCEPT. Returns the listener id and the actual bound address.
    pub fn register_accept(&self, addr: SocketAddr) -> Result<(ListenerId, SocketAddr)> {
        let (tx, rx) = bounded(1);
        self.execute(move |r| {
            let _ = tx.send(r.register_accept(addr));
        })?;
        rx.recv().map_err(|_| TpcError::ReactorGone)?
    }

    /// Connect to a peer; resolves once the reactor established the
    /// connection and armed its READ.
    pub fn connect(&self, addr: SocketAddr) -> Result<ChannelRef> {
        let (tx, rx) = bounded(1);
        self.execute(move |r| {
            let _ = tx.send(r.connect(addr));
        })?;
        rx.recv().map_err(|_| TpcError::ReactorGone)?
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Shared state for building `ChannelRef`s or waking the reactor.
    pub fn shared(&self) -> Arc<ReactorShared> {
        Arc::clone(&self.shared)
    }

    /// Stop the loop, drain and join. Idempotent via Drop.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        // A no-op task makes the park check observe a non-empty queue;
        // wakeup() covers the already-parked case.
        let _ = self.shared.run_queue.push(Box::new(|_r: &mut Reactor| {}));
        self.shared.wakeup();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for ReactorHandle {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}
