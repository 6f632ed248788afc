//! # tpcnet-reactor — the per-core event loop
//!
//! One [`reactor::Reactor`] per pinned CPU. The reactor owns its
//! io_uring ring, its sockets, its frame pool and its channel table;
//! nothing inside it is shared. The only cross-thread surfaces are the
//! public run-queue, each channel's unflushed frame queue, and the
//! eventfd wakeup — all reachable through [`reactor::ReactorHandle`]
//! and [`channel::ChannelRef`].
//!
//! Control flow per loop iteration: drain public tasks, give the
//! cooperative scheduler one tick, flush dirty channels with one WRITEV
//! each, then either drain completions or park on submit-and-wait
//! behind the eventfd.

pub mod channel;
pub mod listener;
pub mod reactor;
pub mod scheduler;
pub mod service;
pub mod sockets;
pub mod uring;
pub mod wakeup;

pub use channel::ChannelRef;
pub use reactor::{Reactor, ReactorHandle, ReactorShared, Task};
pub use service::{NullService, Service};
pub use uring::uring_available;

pub use tpcnet_core::{
    ChannelId, ConnectionId, Frame, FrameAllocator, IoVector, ListenerId,
    ParallelFrameAllocator, ReactorConfig, Result, TpcError, FLAG_OP_RESPONSE, HEADER_SIZE,
};
