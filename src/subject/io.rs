//! Post-release I/O surface: read-with-callback-and-timeout, blocking
//! write, and the bidirectional proxy loop. Everything here runs
//! synchronously on the caller's thread, per the single-threaded,
//! alarm-driven concurrency model.

use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use crate::error::{Result, SubjectError};

use super::Subject;

const LINE_MAX: usize = 4096;
const PROXY_PULSE_MS: i32 = 1000;

impl Subject {
    /// Read from the pty master, invoking `cb` with each chunk (or `None`
    /// on EOF) until `cb` returns `true` or the timeout expires.
    ///
    /// `timeout` is floored to 1 second if positive; `None` blocks
    /// forever. Returns `Ok(true)` on timeout or EOF (neither is an
    /// error); `Err` only on a transport failure or a termination
    /// anomaly discovered while reaping at EOF.
    pub fn read<F: FnMut(Option<&[u8]>) -> bool>(&mut self, mut cb: F, timeout: Option<u64>) -> Result<bool> {
        if !self.released {
            return Err(SubjectError::NotYetReleased);
        }
        let budget = timeout.map(|t| if t > 0 { t.max(1) } else { 0 });
        let deadline = budget.map(|secs| Instant::now() + Duration::from_secs(secs));

        loop {
            let remaining_ms = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Ok(true);
                    }
                    (d - now).as_millis().min(i32::MAX as u128) as i32
                }
                None => -1,
            };

            let mut pfd = libc::pollfd {
                fd: self.pty_master,
                events: libc::POLLIN,
                revents: 0,
            };
            let rc = unsafe { libc::poll(&mut pfd, 1, remaining_ms) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    if self.draining {
                        return Ok(true);
                    }
                    continue;
                }
                return Err(SubjectError::Io(err));
            }
            if rc == 0 {
                return Ok(true);
            }

            let mut buf = [0u8; LINE_MAX];
            let n = unsafe {
                libc::read(self.pty_master, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };

            if n == 0 || (n < 0 && io::Error::last_os_error().raw_os_error() == Some(libc::EIO)) {
                return self.handle_read_eof(&mut cb);
            }
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(SubjectError::Io(err));
            }

            if cb(Some(&buf[..n as usize])) {
                return Ok(true);
            }
        }
    }

    fn handle_read_eof<F: FnMut(Option<&[u8]>) -> bool>(&mut self, cb: &mut F) -> Result<bool> {
        self.eof = true;
        if self.pty_master >= 0 {
            unsafe { libc::close(self.pty_master) };
            self.pty_master = -1;
        }
        let anomaly = match self.try_reap(false)? {
            Some(status) if status.is_signaled() && !self.draining => {
                let signo = status.signal().unwrap_or(0);
                (signo != self.last_signal).then_some(signo)
            }
            _ => None,
        };
        cb(None);
        match anomaly {
            Some(signo) => Err(SubjectError::KilledBySignal(signo)),
            None => Ok(true),
        }
    }

    /// Write every byte, looping across `EINTR` and short writes.
    pub fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        if !self.released {
            return Err(SubjectError::NotYetReleased);
        }
        let mut remaining = bytes;
        let total = bytes.len();
        while !remaining.is_empty() {
            let n = unsafe {
                libc::write(self.pty_master, remaining.as_ptr() as *const libc::c_void, remaining.len())
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EINTR) => continue,
                    Some(libc::EAGAIN) => {
                        let mut pfd = libc::pollfd {
                            fd: self.pty_master,
                            events: libc::POLLOUT,
                            revents: 0,
                        };
                        unsafe { libc::poll(&mut pfd, 1, -1) };
                        continue;
                    }
                    _ => return Err(SubjectError::Io(err)),
                }
            }
            remaining = &remaining[n as usize..];
        }
        Ok(total)
    }

    /// Bidirectional relay between the pty master and `stream_fd`.
    ///
    /// Returns `Ok(true)` if the loop ended cleanly (pulse said stop), or
    /// `Ok(false)` if it bailed (subject died non-zero, couldn't be
    /// reaped, or the input stream errored). `pulse` is polled every
    /// second when supplied; with no `pulse`, the loop blocks forever on
    /// readiness. Does not restore the input stream's termios on exit
    /// (matching behavior carried over unchanged, see design notes).
    pub fn proxy<FOut, FIn, FPulse>(
        &mut self,
        stream_fd: RawFd,
        mut out_cb: FOut,
        mut in_cb: FIn,
        mut pulse: Option<FPulse>,
    ) -> Result<bool>
    where
        FOut: FnMut(&[u8]),
        FIn: FnMut(Option<&[u8]>),
        FPulse: FnMut() -> bool,
    {
        if !self.released {
            return Err(SubjectError::NotYetReleased);
        }
        prepare_stream_termios(stream_fd);

        // Poll a dup of the caller's stream fd, per the documented 2-entry
        // readiness array over (pty_master, dup(stream)), rather than the
        // fd the caller still owns.
        let stream_dup = DupGuard(unsafe { libc::dup(stream_fd) });
        if stream_dup.0 < 0 {
            return Err(SubjectError::Io(io::Error::last_os_error()));
        }

        let timeout_ms = if pulse.is_some() { PROXY_PULSE_MS } else { -1 };
        let mut bailed = false;
        let mut pty_eof = false;

        loop {
            if pty_eof || self.pty_master < 0 {
                in_cb(None);
                break;
            }

            let mut pfds = [
                libc::pollfd { fd: self.pty_master, events: libc::POLLIN, revents: 0 },
                libc::pollfd { fd: stream_dup.0, events: libc::POLLIN, revents: 0 },
            ];
            let rc = unsafe { libc::poll(pfds.as_mut_ptr(), 2, timeout_ms) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(SubjectError::Io(err));
            }
            if rc == 0 {
                if let Some(p) = pulse.as_mut() {
                    if !p() {
                        bailed = true;
                        break;
                    }
                }
                continue;
            }

            if pfds[0].revents & libc::POLLIN != 0 {
                let mut buf = [0u8; LINE_MAX];
                let n = unsafe {
                    libc::read(self.pty_master, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
                };
                if n > 0 {
                    out_cb(&buf[..n as usize]);
                } else {
                    pty_eof = true;
                    self.eof = true;
                    if self.pty_master >= 0 {
                        unsafe { libc::close(self.pty_master) };
                        self.pty_master = -1;
                    }
                    match self.try_reap(false) {
                        Ok(Some(status)) => {
                            if !status.is_exited() || status.exit_code() != Some(0) {
                                bailed = true;
                            }
                        }
                        Ok(None) => bailed = true,
                        Err(_) => bailed = true,
                    }
                }
            }

            if pfds[1].revents & libc::POLLIN != 0 {
                let mut buf = [0u8; LINE_MAX];
                let n = unsafe { libc::read(stream_dup.0, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
                if n > 0 {
                    in_cb(Some(&buf[..n as usize]));
                } else {
                    bailed = true;
                    in_cb(None);
                }
            }
        }

        Ok(!bailed)
    }
}

/// Closes its held fd on drop, so `proxy`'s `dup(stream)` is never leaked
/// across an early return.
struct DupGuard(RawFd);

impl Drop for DupGuard {
    fn drop(&mut self) {
        if self.0 >= 0 {
            unsafe { libc::close(self.0) };
        }
    }
}

/// If `stream_fd` refers to a tty, clear `ICANON`/`ISIG` for the duration
/// of the proxy loop. Per design notes, the original termios is not
/// restored on exit; this is carried over unchanged, not fixed here.
fn prepare_stream_termios(stream_fd: RawFd) {
    let mut term: libc::termios = unsafe { std::mem::zeroed() };
    if unsafe { libc::tcgetattr(stream_fd, &mut term) } != 0 {
        return;
    }
    term.c_lflag &= !(libc::ICANON | libc::ISIG);
    unsafe { libc::tcsetattr(stream_fd, libc::TCSANOW, &term) };
}
