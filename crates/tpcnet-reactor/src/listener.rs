//! Server-socket lifecycle and the accept memory block.
//!
//! Each listener keeps one ACCEPT SQE outstanding. The kernel fills the
//! listener's `AcceptMem` (a sockaddr_storage plus its length field)
//! with the peer address on completion; the reactor reads it out, then
//! resets the length and re-arms.

use std::net::SocketAddr;
use std::os::unix::io::RawFd;

use tpcnet_core::config::ReactorConfig;
use tpcnet_core::error::Result;

use crate::sockets;

/// Kernel-written accept address block. Boxed so its address is stable
/// for the lifetime of the outstanding ACCEPT SQE.
pub(crate) struct AcceptMem {
    pub storage: libc::sockaddr_storage,
    pub len: libc::socklen_t,
}

pub(crate) struct Listener {
    pub fd: RawFd,
    pub local: SocketAddr,
    accept_mem: Box<AcceptMem>,
}

impl Listener {
    /// Bind and listen on `addr` (port 0 picks a free port).
    pub fn open(addr: SocketAddr, cfg: &ReactorConfig) -> Result<Listener> {
        let (fd, local) = sockets::bind_listen(addr, cfg.listen_backlog)?;
        Ok(Listener {
            fd,
            local,
            accept_mem: Box::new(AcceptMem {
                storage: unsafe { std::mem::zeroed() },
                // accept(2) wants the length initialized to the full
                // storage size before each call.
                len: std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t,
            }),
        })
    }

    /// Reset the length field ahead of re-arming the ACCEPT.
    pub fn reset_accept_mem(&mut self) {
        self.accept_mem.len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    }

    /// Pointers the ACCEPT SQE carries.
    pub fn accept_ptrs(&mut self) -> (*mut libc::sockaddr, *mut libc::socklen_t) {
        (
            &mut self.accept_mem.storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
            &mut self.accept_mem.len as *mut libc::socklen_t,
        )
    }

    /// Peer address of the connection just accepted, parsed out of the
    /// accept memory.
    pub fn accepted_peer(&self) -> Option<SocketAddr> {
        sockets::from_storage(&self.accept_mem.storage)
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
            self.fd = -1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_binds_a_real_port() {
        let cfg = ReactorConfig::new();
        let listener = Listener::open("127.0.0.1:0".parse().unwrap(), &cfg).unwrap();
        assert_ne!(listener.local.port(), 0);
    }

    #[test]
    fn open_rejects_unroutable_bind() {
        let cfg = ReactorConfig::new();
        // 198.51.100.1 (TEST-NET-2) is not a local interface.
        let res = Listener::open("198.51.100.1:0".parse().unwrap(), &cfg);
        assert!(res.is_err());
    }

    #[test]
    fn accepted_peer_parses_storage() {
        let cfg = ReactorConfig::new();
        let mut listener = Listener::open("127.0.0.1:0".parse().unwrap(), &cfg).unwrap();
        let peer: SocketAddr = "10.0.0.9:4242".parse().unwrap();
        let (storage, len) = sockets::to_storage(peer);
        listener.accept_mem.storage = storage;
        listener.accept_mem.len = len;
        assert_eq!(listener.accepted_peer(), Some(peer));
        listener.reset_accept_mem();
        assert_eq!(
            listener.accept_mem.len as usize,
            std::mem::size_of::<libc::sockaddr_storage>()
        );
    }
}
