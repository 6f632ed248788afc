//! # tpcnet-core — data types for the tpcnet substrate
//!
//! This crate holds everything a reactor manipulates that is not the
//! event loop itself: the length-prefixed [`frame::Frame`], the pooled
//! [`alloc::FrameAllocator`] (and its thread-safe
//! [`alloc::ParallelFrameAllocator`] sibling), the bounded gather-write
//! staging [`iovec::IoVector`], identity handles, configuration and the
//! shared error type.
//!
//! ## Design principle
//!
//! Components refer to each other by identity handles (`ChannelId`,
//! `ListenerId`), never by back-pointers. A frame knows *which* channel
//! it belongs to, not *where* the reactor lives.

pub mod alloc;
pub mod config;
pub mod env;
pub mod error;
pub mod frame;
pub mod id;
pub mod iovec;

pub use alloc::{FrameAllocator, ParallelFrameAllocator};
pub use config::ReactorConfig;
pub use error::{Result, TpcError};
pub use frame::{Frame, FLAG_OP_RESPONSE, HEADER_SIZE};
pub use id::{ChannelId, ConnectionId, ListenerId};
pub use iovec::{IoVector, IOV_MAX};
