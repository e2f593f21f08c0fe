//! Pty allocation: open, grant, and unlock a master; resolve and open the
//! matching slave from the subject side once it has its own session.

use std::ffi::CStr;
use std::io;
use std::os::unix::io::RawFd;

/// Open a pty master with read-write access, no controlling-terminal side
/// effect, and close-on-exec, then grant and unlock its slave. Run on the
/// driver side before `fork`.
pub(crate) fn open_master() -> io::Result<RawFd> {
    let fd = unsafe { libc::posix_openpt(libc::O_RDWR | libc::O_NOCTTY) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::grantpt(fd) } != 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }
    if unsafe { libc::unlockpt(fd) } != 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }
    set_cloexec(fd)?;
    Ok(fd)
}

fn set_cloexec(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Resolve the slave path from `master_fd`, open it read-write, and attach
/// it as the controlling terminal for the calling process's session.
///
/// Must be called on the subject side after `setsid()`. Linux has no
/// `tcsetsid(3)`; `ioctl(fd, TIOCSCTTY, 0)` is the real-world substitute,
/// matching both this crate's nearest prior art and the BSD original this
/// behavior was ported from (which calls `tcsetsid` directly).
pub(crate) fn open_slave_for_session(master_fd: RawFd) -> io::Result<RawFd> {
    let mut name_buf = [0i8; 64];
    if unsafe { libc::ptsname_r(master_fd, name_buf.as_mut_ptr(), name_buf.len()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let name = unsafe { CStr::from_ptr(name_buf.as_ptr()) };

    let slave_fd = unsafe { libc::open(name.as_ptr(), libc::O_RDWR) };
    if slave_fd < 0 {
        return Err(io::Error::last_os_error());
    }

    #[cfg(target_os = "linux")]
    {
        if unsafe { libc::ioctl(slave_fd, libc::TIOCSCTTY as _, 0) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(slave_fd) };
            return Err(err);
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        if unsafe { libc::tcsetsid(slave_fd, libc::getpid()) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(slave_fd) };
            return Err(err);
        }
    }

    Ok(slave_fd)
}

/// Capture the slave's termios right after opening it, for later
/// `TERMIOS_INQUIRY` replies.
pub(crate) fn capture_termios(slave_fd: RawFd) -> io::Result<libc::termios> {
    let mut term: libc::termios = unsafe { std::mem::zeroed() };
    if unsafe { libc::tcgetattr(slave_fd, &mut term) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(term)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_master_returns_a_usable_fd() {
        let fd = open_master().expect("posix_openpt should succeed in test sandboxes");
        assert!(fd >= 0);
        unsafe { libc::close(fd) };
    }
}
