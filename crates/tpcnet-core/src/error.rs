//! tpcnet error types.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TpcError {
    /// Submission queue is full, cannot queue another entry.
    RingFull,
    /// io_uring setup failed.
    RingSetup(i32),
    /// io_uring_enter failed during submit.
    Submit(i32),
    /// OS error with errno (socket setup, eventfd, connect).
    Os(i32),
    /// Peer violated the wire protocol (bad frame header).
    Protocol(&'static str),
    /// The channel is closed; the frame was not accepted.
    ChannelClosed,
    /// A bounded producer queue is full (backpressure).
    QueueFull,
    /// The channel table has no free slot.
    TableFull,
    /// Configuration rejected by validation.
    InvalidConfig(&'static str),
    /// The reactor thread is gone; the request cannot be delivered.
    ReactorGone,
}

impl fmt::Display for TpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RingFull => write!(f, "submission queue full"),
            Self::RingSetup(e) => write!(f, "io_uring setup: errno {}", e),
            Self::Submit(e) => write!(f, "io_uring submit: errno {}", e),
            Self::Os(e) => write!(f, "OS error: errno {}", e),
            Self::Protocol(msg) => write!(f, "protocol violation: {}", msg),
            Self::ChannelClosed => write!(f, "channel closed"),
            Self::QueueFull => write!(f, "outbound queue full"),
            Self::TableFull => write!(f, "channel table full"),
            Self::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
            Self::ReactorGone => write!(f, "reactor is gone"),
        }
    }
}

impl std::error::Error for TpcError {}

pub type Result<T> = std::result::Result<T, TpcError>;

impl TpcError {
    /// Capture the calling thread's errno as an `Os` error.
    pub fn last_os() -> Self {
        Self::Os(unsafe { *libc::__errno_location() })
    }
}
