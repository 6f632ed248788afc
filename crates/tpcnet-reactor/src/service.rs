//! The request-service seam.
//!
//! The reactor is transport only; everything above frame boundaries is
//! behind this trait. Implementations run on the reactor thread and
//! must not block — a handler that needs to wait posts a continuation
//! through `ReactorHandle::execute` instead.

use std::net::SocketAddr;

use tpcnet_core::error::TpcError;
use tpcnet_core::frame::Frame;
use tpcnet_core::id::ChannelId;

pub trait Service: Send {
    /// A channel was accepted on one of this reactor's listeners.
    fn on_accept(&mut self, _id: ChannelId, _peer: SocketAddr) {}

    /// A complete request frame arrived. The read cursor is positioned
    /// at the payload. Returning a frame enqueues it on the same
    /// channel (the synchronous reply path); services that respond
    /// later keep the frame's `channel` id and send through a handle.
    fn on_request(&mut self, _frame: Box<Frame>) -> Option<Box<Frame>> {
        None
    }

    /// A batch of response frames, linked through `next`, in the order
    /// their final bytes arrived.
    fn on_responses(&mut self, _chain: Box<Frame>) {}

    /// The channel closed. `err` is `None` for a clean peer close.
    fn on_close(&mut self, _id: ChannelId, _err: Option<TpcError>) {}
}

/// Service that drops everything; useful for pure-producer reactors.
pub struct NullService;

impl Service for NullService {}
