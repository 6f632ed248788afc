//! Reactor configuration.
//!
//! Compile-time defaults, builder methods for programmatic overrides,
//! `from_env()` for runtime overrides, and `validate()` before a
//! reactor starts. Environment variables:
//!
//! - `TPC_SPIN` — busy-poll instead of blocking waits (0/1)
//! - `TPC_RING_SIZE` — io_uring entries (power of two)
//! - `TPC_IOSQE_ASYNC_THRESHOLD` — in-flight count beyond which SQEs
//!   are flagged for async kernel punting
//! - `TPC_RECEIVE_BUFFER_SIZE` / `TPC_SEND_BUFFER_SIZE` — per-socket
//!   SO_RCVBUF/SO_SNDBUF and the reactor's receive buffer size
//! - `TPC_TCP_NODELAY` / `TPC_TCP_QUICKACK` — socket options (0/1)
//! - `TPC_LISTEN_BACKLOG` — listen(2) backlog
//! - `TPC_MAX_FRAME_SIZE` — inbound frame cap, protocol error beyond
//! - `TPC_CHANNEL_QUEUE_CAPACITY` — per-channel unflushed queue depth
//! - `TPC_RUN_QUEUE_CAPACITY` — public task queue depth
//! - `TPC_MAX_CHANNELS` — channel table size

use crate::env::{env_get, env_get_bool};
use crate::error::TpcError;

mod defaults {
    pub const SPIN: bool = false;
    pub const RING_SIZE: u32 = 4096;
    pub const IOSQE_ASYNC_THRESHOLD: u32 = 25;
    pub const RECEIVE_BUFFER_SIZE: usize = 128 * 1024;
    pub const SEND_BUFFER_SIZE: usize = 128 * 1024;
    pub const TCP_NODELAY: bool = true;
    pub const TCP_QUICKACK: bool = true;
    pub const LISTEN_BACKLOG: i32 = 10;
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
    pub const CHANNEL_QUEUE_CAPACITY: usize = 16384;
    pub const RUN_QUEUE_CAPACITY: usize = 16384;
    pub const MAX_CHANNELS: usize = 4096;
}

#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Busy-poll the completion queue instead of parking.
    pub spin: bool,
    /// io_uring SQ size (power of two).
    pub ring_size: u32,
    /// In-flight count beyond which SQEs get the ASYNC hint.
    pub iosqe_async_threshold: u32,
    /// SO_RCVBUF and the reactor-side receive buffer size.
    pub receive_buffer_size: usize,
    /// SO_SNDBUF.
    pub send_buffer_size: usize,
    pub tcp_no_delay: bool,
    pub tcp_quick_ack: bool,
    /// listen(2) backlog.
    pub listen_backlog: i32,
    /// Largest declared inbound frame before the channel is closed with
    /// a protocol error.
    pub max_frame_size: usize,
    /// Per-channel unflushed (producer-facing) queue depth.
    pub channel_queue_capacity: usize,
    /// Public run-queue depth.
    pub run_queue_capacity: usize,
    /// Channel table size; also bounds the dirty list.
    pub max_channels: usize,
    /// CPU to pin the reactor thread to (None = unpinned).
    pub cpu: Option<usize>,
    /// Thread name.
    pub name: String,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ReactorConfig {
    /// Compile-time defaults, no environment override.
    pub fn new() -> Self {
        Self {
            spin: defaults::SPIN,
            ring_size: defaults::RING_SIZE,
            iosqe_async_threshold: defaults::IOSQE_ASYNC_THRESHOLD,
            receive_buffer_size: defaults::RECEIVE_BUFFER_SIZE,
            send_buffer_size: defaults::SEND_BUFFER_SIZE,
            tcp_no_delay: defaults::TCP_NODELAY,
            tcp_quick_ack: defaults::TCP_QUICKACK,
            listen_backlog: defaults::LISTEN_BACKLOG,
            max_frame_size: defaults::MAX_FRAME_SIZE,
            channel_queue_capacity: defaults::CHANNEL_QUEUE_CAPACITY,
            run_queue_capacity: defaults::RUN_QUEUE_CAPACITY,
            max_channels: defaults::MAX_CHANNELS,
            cpu: None,
            name: "tpc-reactor".to_string(),
        }
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        Self {
            spin: env_get_bool("TPC_SPIN", defaults::SPIN),
            ring_size: env_get("TPC_RING_SIZE", defaults::RING_SIZE),
            iosqe_async_threshold: env_get(
                "TPC_IOSQE_ASYNC_THRESHOLD",
                defaults::IOSQE_ASYNC_THRESHOLD,
            ),
            receive_buffer_size: env_get(
                "TPC_RECEIVE_BUFFER_SIZE",
                defaults::RECEIVE_BUFFER_SIZE,
            ),
            send_buffer_size: env_get("TPC_SEND_BUFFER_SIZE", defaults::SEND_BUFFER_SIZE),
            tcp_no_delay: env_get_bool("TPC_TCP_NODELAY", defaults::TCP_NODELAY),
            tcp_quick_ack: env_get_bool("TPC_TCP_QUICKACK", defaults::TCP_QUICKACK),
            listen_backlog: env_get("TPC_LISTEN_BACKLOG", defaults::LISTEN_BACKLOG),
            max_frame_size: env_get("TPC_MAX_FRAME_SIZE", defaults::MAX_FRAME_SIZE),
            channel_queue_capacity: env_get(
                "TPC_CHANNEL_QUEUE_CAPACITY",
                defaults::CHANNEL_QUEUE_CAPACITY,
            ),
            run_queue_capacity: env_get("TPC_RUN_QUEUE_CAPACITY", defaults::RUN_QUEUE_CAPACITY),
            max_channels: env_get("TPC_MAX_CHANNELS", defaults::MAX_CHANNELS),
            cpu: None,
            name: "tpc-reactor".to_string(),
        }
    }

    // Builder methods

    pub fn spin(mut self, spin: bool) -> Self {
        self.spin = spin;
        self
    }

    pub fn ring_size(mut self, entries: u32) -> Self {
        self.ring_size = entries;
        self
    }

    pub fn iosqe_async_threshold(mut self, threshold: u32) -> Self {
        self.iosqe_async_threshold = threshold;
        self
    }

    pub fn receive_buffer_size(mut self, bytes: usize) -> Self {
        self.receive_buffer_size = bytes;
        self
    }

    pub fn send_buffer_size(mut self, bytes: usize) -> Self {
        self.send_buffer_size = bytes;
        self
    }

    pub fn tcp_no_delay(mut self, enable: bool) -> Self {
        self.tcp_no_delay = enable;
        self
    }

    pub fn tcp_quick_ack(mut self, enable: bool) -> Self {
        self.tcp_quick_ack = enable;
        self
    }

    pub fn listen_backlog(mut self, backlog: i32) -> Self {
        self.listen_backlog = backlog;
        self
    }

    pub fn max_frame_size(mut self, bytes: usize) -> Self {
        self.max_frame_size = bytes;
        self
    }

    pub fn channel_queue_capacity(mut self, depth: usize) -> Self {
        self.channel_queue_capacity = depth;
        self
    }

    pub fn run_queue_capacity(mut self, depth: usize) -> Self {
        self.run_queue_capacity = depth;
        self
    }

    pub fn max_channels(mut self, n: usize) -> Self {
        self.max_channels = n;
        self
    }

    pub fn cpu(mut self, cpu: usize) -> Self {
        self.cpu = Some(cpu);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn validate(&self) -> Result<(), TpcError> {
        if self.ring_size == 0 || !self.ring_size.is_power_of_two() {
            return Err(TpcError::InvalidConfig("ring_size must be a power of two"));
        }
        if self.receive_buffer_size < crate::frame::HEADER_SIZE {
            return Err(TpcError::InvalidConfig(
                "receive_buffer_size must hold at least a frame header",
            ));
        }
        if self.send_buffer_size == 0 {
            return Err(TpcError::InvalidConfig("send_buffer_size must be > 0"));
        }
        if self.listen_backlog <= 0 {
            return Err(TpcError::InvalidConfig("listen_backlog must be > 0"));
        }
        if self.max_frame_size < crate::frame::HEADER_SIZE {
            return Err(TpcError::InvalidConfig(
                "max_frame_size must be >= the 8-byte header",
            ));
        }
        if self.max_frame_size > 1 << 30 {
            return Err(TpcError::InvalidConfig("max_frame_size must be <= 1 GiB"));
        }
        if self.channel_queue_capacity == 0 {
            return Err(TpcError::InvalidConfig(
                "channel_queue_capacity must be > 0",
            ));
        }
        if self.run_queue_capacity == 0 {
            return Err(TpcError::InvalidConfig("run_queue_capacity must be > 0"));
        }
        if self.max_channels == 0 {
            return Err(TpcError::InvalidConfig("max_channels must be > 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = ReactorConfig::new();
        assert!(config.validate().is_ok());
        assert_eq!(config.ring_size, 4096);
        assert_eq!(config.listen_backlog, 10);
        assert_eq!(config.max_frame_size, 16 * 1024 * 1024);
        assert!(!config.spin);
    }

    #[test]
    fn builder_overrides() {
        let config = ReactorConfig::new()
            .spin(true)
            .ring_size(1024)
            .cpu(3)
            .name("r0");
        assert!(config.spin);
        assert_eq!(config.ring_size, 1024);
        assert_eq!(config.cpu, Some(3));
        assert_eq!(config.name, "r0");
    }

    #[test]
    fn validation_rejects_bad_values() {
        assert!(ReactorConfig::new().ring_size(1000).validate().is_err());
        assert!(ReactorConfig::new().max_frame_size(4).validate().is_err());
        assert!(ReactorConfig::new().listen_backlog(0).validate().is_err());
        assert!(ReactorConfig::new()
            .channel_queue_capacity(0)
            .validate()
            .is_err());
    }
}
