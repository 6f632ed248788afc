//! Raw socket plumbing: listener setup, blocking connect, per-socket
//! options, and sockaddr conversions.
//!
//! Everything here runs at startup or on the reactor thread; steady
//! state I/O never touches these paths.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::RawFd;

use tracing::debug;

use tpcnet_core::config::ReactorConfig;
use tpcnet_core::error::{Result, TpcError};

fn set_opt(fd: RawFd, level: libc::c_int, opt: libc::c_int, val: libc::c_int) -> Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            opt,
            &val as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(TpcError::last_os());
    }
    Ok(())
}

/// Apply the per-channel socket options from the config. Called at
/// accept and connect time.
pub(crate) fn apply_socket_options(fd: RawFd, cfg: &ReactorConfig) -> Result<()> {
    set_opt(
        fd,
        libc::IPPROTO_TCP,
        libc::TCP_NODELAY,
        cfg.tcp_no_delay as libc::c_int,
    )?;
    set_opt(
        fd,
        libc::IPPROTO_TCP,
        libc::TCP_QUICKACK,
        cfg.tcp_quick_ack as libc::c_int,
    )?;
    set_opt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_SNDBUF,
        cfg.send_buffer_size as libc::c_int,
    )?;
    set_opt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_RCVBUF,
        cfg.receive_buffer_size as libc::c_int,
    )?;
    debug!(
        fd,
        tcp_no_delay = cfg.tcp_no_delay,
        tcp_quick_ack = cfg.tcp_quick_ack,
        snd_buf = cfg.send_buffer_size,
        rcv_buf = cfg.receive_buffer_size,
        "socket configured"
    );
    Ok(())
}

fn new_stream_socket(v6: bool) -> Result<RawFd> {
    let domain = if v6 { libc::AF_INET6 } else { libc::AF_INET };
    let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(TpcError::last_os());
    }
    Ok(fd)
}

/// Bind + listen. Returns the fd and the actual bound address (port 0
/// resolves to the kernel's pick).
pub(crate) fn bind_listen(addr: SocketAddr, backlog: i32) -> Result<(RawFd, SocketAddr)> {
    let fd = new_stream_socket(addr.is_ipv6())?;
    if let Err(e) = set_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1) {
        unsafe { libc::close(fd) };
        return Err(e);
    }
    let (storage, len) = to_storage(addr);
    let ret = unsafe {
        libc::bind(
            fd,
            &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
            len,
        )
    };
    if ret < 0 {
        let err = TpcError::last_os();
        unsafe { libc::close(fd) };
        return Err(err);
    }
    if unsafe { libc::listen(fd, backlog) } < 0 {
        let err = TpcError::last_os();
        unsafe { libc::close(fd) };
        return Err(err);
    }
    let local = local_addr(fd)?;
    Ok((fd, local))
}

/// Blocking connect, used synchronously on the reactor thread for
/// outbound channels. The fd comes back connected and configured.
pub(crate) fn connect_blocking(addr: SocketAddr, cfg: &ReactorConfig) -> Result<RawFd> {
    let fd = new_stream_socket(addr.is_ipv6())?;
    if let Err(e) = apply_socket_options(fd, cfg) {
        unsafe { libc::close(fd) };
        return Err(e);
    }
    let (storage, len) = to_storage(addr);
    let ret = unsafe {
        libc::connect(
            fd,
            &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
            len,
        )
    };
    if ret < 0 {
        let err = TpcError::last_os();
        unsafe { libc::close(fd) };
        return Err(err);
    }
    Ok(fd)
}

pub(crate) fn local_addr(fd: RawFd) -> Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockname(
            fd,
            &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
            &mut len,
        )
    };
    if ret < 0 {
        return Err(TpcError::last_os());
    }
    from_storage(&storage).ok_or(TpcError::Os(libc::EAFNOSUPPORT))
}

/// SocketAddr → sockaddr_storage for bind/connect.
pub(crate) fn to_storage(addr: SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(
                    &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in,
                    sin,
                );
            }
            (
                storage,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::write(
                    &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in6,
                    sin6,
                );
            }
            (
                storage,
                std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        }
    }
}

/// sockaddr_storage → SocketAddr. `None` for non-INET families.
pub(crate) fn from_storage(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = unsafe {
                &*(storage as *const libc::sockaddr_storage as *const libc::sockaddr_in)
            };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Some(SocketAddr::V4(SocketAddrV4::new(
                ip,
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe {
                &*(storage as *const libc::sockaddr_storage as *const libc::sockaddr_in6)
            };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_round_trip_v4() {
        let addr: SocketAddr = "192.168.1.20:5701".parse().unwrap();
        let (storage, _) = to_storage(addr);
        assert_eq!(from_storage(&storage), Some(addr));
    }

    #[test]
    fn storage_round_trip_v6() {
        let addr: SocketAddr = "[2001:db8::1]:9000".parse().unwrap();
        let (storage, _) = to_storage(addr);
        assert_eq!(from_storage(&storage), Some(addr));
    }

    #[test]
    fn unknown_family_rejected() {
        let storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        assert!(from_storage(&storage).is_none());
    }

    #[test]
    fn bind_listen_resolves_port_zero() {
        let (fd, local) = bind_listen("127.0.0.1:0".parse().unwrap(), 10).unwrap();
        assert_ne!(local.port(), 0);
        unsafe { libc::close(fd) };
    }
}
