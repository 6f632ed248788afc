//! `EventFd` — cross-thread wakeup for a parked reactor.
//!
//! The reactor keeps one READ on this fd in flight at all times; a
//! producer that needs to break the reactor out of submit-and-wait
//! writes 1 to it. Multiple notifies before the read completes coalesce
//! into a single wakeup (eventfd counter semantics).

use std::os::unix::io::RawFd;

use tpcnet_core::error::{Result, TpcError};

pub struct EventFd {
    fd: RawFd,
}

impl EventFd {
    pub fn create() -> Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(TpcError::last_os());
        }
        Ok(Self { fd })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Signal the reactor. Never blocks.
    pub fn notify(&self) -> Result<()> {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let errno = unsafe { *libc::__errno_location() };
            // EAGAIN means the counter would overflow, which implies a
            // wakeup is already pending. That's fine.
            if errno == libc::EAGAIN {
                return Ok(());
            }
            return Err(TpcError::Os(errno));
        }
        Ok(())
    }
}

impl Drop for EventFd {
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
    fn notify_accumulates_and_reads_back() {
        let efd = EventFd::create().unwrap();
        efd.notify().unwrap();
        efd.notify().unwrap();
        let mut val: u64 = 0;
        let ret = unsafe {
            libc::read(
                efd.fd(),
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        assert_eq!(ret, 8);
        assert_eq!(val, 2);
    }

    #[test]
    fn notify_survives_saturation() {
        let efd = EventFd::create().unwrap();
        for _ in 0..100 {
            efd.notify().unwrap();
        }
    }
}
