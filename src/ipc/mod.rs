//! Length-tagged message transport over a socket-pair, used for the
//! pre-exec handshake between driver and subject.
//!
//! Every frame is `(tag: u32, length: u32)` followed by `length` payload
//! bytes, all host-endian since both ends of the pair live on the same
//! machine. The endpoint reassembles headers and payloads across short
//! reads and exposes the four primitives the handshake is built from:
//! `send`, `recv`, `wait`, and `register`. `send_acked` layers a
//! synchronous request/ACK exchange on top, used by every pre-exec driver
//! operation that must confirm its configuration took effect.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use crate::error::{Result, SubjectError};

#[cfg(test)]
mod tests;

/// The closed set of message tags exchanged on the pre-exec socket-pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Tag {
    Release = 0,
    Error = 1,
    TermiosInquiry = 2,
    TermiosSet = 3,
    TermiosAck = 4,
    EnvSetup = 5,
    EnvAck = 6,
    Chdir = 7,
    ChdirAck = 8,
    Setgroups = 9,
    SetgroupsAck = 10,
    Setid = 11,
    SetidAck = 12,
    Setmask = 13,
    SetmaskAck = 14,
    Sigcatch = 15,
    SigcatchAck = 16,
}

impl Tag {
    /// The ACK tag that answers this request tag, if any.
    pub fn ack_tag(self) -> Option<Tag> {
        match self {
            // TERMIOS_INQUIRY is answered by a bare TERMIOS_SET carrying the
            // current termios, not a TERMIOS_ACK; term() awaits it directly.
            Tag::TermiosInquiry => None,
            Tag::TermiosSet => Some(Tag::TermiosAck),
            Tag::EnvSetup => Some(Tag::EnvAck),
            Tag::Chdir => Some(Tag::ChdirAck),
            Tag::Setgroups => Some(Tag::SetgroupsAck),
            Tag::Setid => Some(Tag::SetidAck),
            Tag::Setmask => Some(Tag::SetmaskAck),
            Tag::Sigcatch => Some(Tag::SigcatchAck),
            Tag::Release | Tag::Error => None,
            _ => None,
        }
    }
}

impl TryFrom<u32> for Tag {
    type Error = SubjectError;

    fn try_from(value: u32) -> std::result::Result<Self, Self::Error> {
        Ok(match value {
            0 => Tag::Release,
            1 => Tag::Error,
            2 => Tag::TermiosInquiry,
            3 => Tag::TermiosSet,
            4 => Tag::TermiosAck,
            5 => Tag::EnvSetup,
            6 => Tag::EnvAck,
            7 => Tag::Chdir,
            8 => Tag::ChdirAck,
            9 => Tag::Setgroups,
            10 => Tag::SetgroupsAck,
            11 => Tag::Setid,
            12 => Tag::SetidAck,
            13 => Tag::Setmask,
            14 => Tag::SetmaskAck,
            15 => Tag::Sigcatch,
            16 => Tag::SigcatchAck,
            other => return Err(SubjectError::UnexpectedMessage(other)),
        })
    }
}

/// A single `(tag, payload)` frame.
#[derive(Debug, Clone)]
pub struct IpcMessage {
    pub tag: Tag,
    pub payload: Vec<u8>,
}

impl IpcMessage {
    pub fn new(tag: Tag, payload: Vec<u8>) -> Self {
        Self { tag, payload }
    }

    pub fn empty(tag: Tag) -> Self {
        Self { tag, payload: Vec::new() }
    }

    /// Build an ACK payload carrying a single errno (0 = success).
    pub fn ack(tag: Tag, errno: i32) -> Self {
        Self { tag, payload: errno.to_ne_bytes().to_vec() }
    }

    /// Decode this message's payload as a single errno, per the ACK schema.
    pub fn errno(&self) -> Result<i32> {
        let bytes: [u8; 4] = self
            .payload
            .as_slice()
            .try_into()
            .map_err(|_| SubjectError::UnexpectedMessage(self.tag as u32))?;
        Ok(i32::from_ne_bytes(bytes))
    }
}

const HEADER_LEN: usize = 8;

type Handler = Box<dyn FnMut(&IpcMessage) -> i32 + Send>;

/// One half of the pre-exec socket-pair.
///
/// Owns the raw fd and closes it on drop, matching the plain-`RawFd` +
/// manual `libc::close` idiom used throughout this crate's pty handling.
pub struct Endpoint {
    fd: RawFd,
    inbuf: Vec<u8>,
    handlers: HashMap<u32, Handler>,
    stopped: bool,
}

impl Endpoint {
    /// Wrap an already-open, already-nonblocking socket-pair fd.
    pub(crate) fn new(fd: RawFd) -> Self {
        Self {
            fd,
            inbuf: Vec::new(),
            handlers: HashMap::new(),
            stopped: false,
        }
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd
    }

    /// True once the peer has shut down the pair.
    pub fn stopped(&self) -> bool {
        self.stopped
    }

    /// Install a handler invoked by the dispatch loop for `tag`. Returns 0
    /// on success, an errno on failure; a handler failure propagates out
    /// of `wait`/`dispatch_once`.
    pub fn register<F>(&mut self, tag: Tag, handler: F)
    where
        F: FnMut(&IpcMessage) -> i32 + Send + 'static,
    {
        self.handlers.insert(tag as u32, Box::new(handler));
    }

    /// Write one full frame, looping across `EINTR` and short writes.
    pub fn send(&mut self, msg: &IpcMessage) -> Result<()> {
        send_frame(self.fd, msg)
    }

    /// Try to pull one complete frame out of the accumulator without
    /// blocking on the fd; returns `Ok(None)` if a full frame isn't
    /// buffered yet.
    fn try_take_frame(&mut self) -> Result<Option<IpcMessage>> {
        if self.inbuf.len() < HEADER_LEN {
            return Ok(None);
        }
        let tag_raw = u32::from_ne_bytes(self.inbuf[0..4].try_into().unwrap());
        let len = u32::from_ne_bytes(self.inbuf[4..8].try_into().unwrap()) as usize;
        if self.inbuf.len() < HEADER_LEN + len {
            return Ok(None);
        }
        let payload = self.inbuf[HEADER_LEN..HEADER_LEN + len].to_vec();
        self.inbuf.drain(0..HEADER_LEN + len);
        let tag = Tag::try_from(tag_raw)?;
        Ok(Some(IpcMessage::new(tag, payload)))
    }

    fn fill_buffer_once(&mut self) -> Result<bool> {
        let mut chunk = [0u8; 4096];
        let n = unsafe {
            libc::read(self.fd, chunk.as_mut_ptr() as *mut libc::c_void, chunk.len())
        };
        if n > 0 {
            self.inbuf.extend_from_slice(&chunk[..n as usize]);
            return Ok(true);
        }
        if n == 0 {
            self.stopped = true;
            return Ok(false);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => Ok(false),
            Some(libc::EAGAIN) => Ok(false),
            _ => Err(SubjectError::Io(err)),
        }
    }

    /// Non-blocking: return a complete frame if one is already fully
    /// buffered or immediately readable, else `None`.
    pub fn recv(&mut self) -> Result<Option<IpcMessage>> {
        if let Some(msg) = self.try_take_frame()? {
            return Ok(Some(msg));
        }
        self.fill_buffer_once()?;
        self.try_take_frame()
    }

    /// Block (subject to `deadline`) until the fd is readable or the peer
    /// has shut down, then run the dispatch loop once: any buffered
    /// message with a registered handler is consumed and dispatched; the
    /// first unhandled message is returned to the caller.
    pub fn wait(&mut self, deadline: Option<Instant>) -> Result<Option<IpcMessage>> {
        loop {
            if let Some(msg) = self.try_take_frame()? {
                if let Some(mut handler) = self.handlers.remove(&(msg.tag as u32)) {
                    let rc = handler(&msg);
                    self.handlers.insert(msg.tag as u32, handler);
                    if rc != 0 {
                        return Err(SubjectError::Errno(rc));
                    }
                    continue;
                }
                return Ok(Some(msg));
            }
            if self.stopped {
                return Ok(None);
            }
            let timeout_ms = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Ok(None);
                    }
                    (d - now).as_millis().min(i32::MAX as u128) as i32
                }
                None => -1,
            };
            let mut pfd = libc::pollfd { fd: self.fd, events: libc::POLLIN, revents: 0 };
            let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(SubjectError::Io(err));
            }
            if rc == 0 {
                return Ok(None);
            }
            self.fill_buffer_once()?;
        }
    }

    /// Send `request`, then drive the dispatch loop until `ack_tag`
    /// arrives, returning its embedded errno. The only mechanism driver
    /// operations use to confirm pre-exec configuration took effect.
    ///
    /// Must not be re-entered for the same `ack_tag` while already
    /// awaiting it on this endpoint.
    pub fn send_acked(&mut self, request: &IpcMessage, ack_tag: Tag) -> Result<i32> {
        self.send(request)?;
        loop {
            match self.wait(None)? {
                Some(msg) if msg.tag as u32 == ack_tag as u32 => return msg.errno(),
                Some(msg) if msg.tag == Tag::Error => {
                    return Err(SubjectError::Fatal(
                        String::from_utf8_lossy(&msg.payload).into_owned(),
                    ))
                }
                Some(msg) => return Err(SubjectError::UnexpectedMessage(msg.tag as u32)),
                None => {
                    return Err(SubjectError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed before ack",
                    )))
                }
            }
        }
    }

    /// Block until a specific tag arrives (used by the driver to await
    /// `RELEASE` without going through `send_acked`).
    pub fn expect(&mut self, tag: Tag, timeout: Option<Duration>) -> Result<IpcMessage> {
        let deadline = timeout.map(|d| Instant::now() + d);
        match self.wait(deadline)? {
            Some(msg) if msg.tag == tag => Ok(msg),
            Some(msg) if msg.tag == Tag::Error => Err(SubjectError::Fatal(
                String::from_utf8_lossy(&msg.payload).into_owned(),
            )),
            Some(msg) => Err(SubjectError::UnexpectedMessage(msg.tag as u32)),
            None => Err(SubjectError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed before expected message",
            ))),
        }
    }
}

/// Encode and write one full frame to a raw fd, looping across `EINTR` and
/// short writes. Used by `Endpoint::send` and, directly, by subject-side
/// handlers registered through `Endpoint::register` that need to reply
/// without taking a second mutable borrow of the `Endpoint` that is
/// already dispatching them.
pub(crate) fn send_frame(fd: RawFd, msg: &IpcMessage) -> Result<()> {
    let mut buf = Vec::with_capacity(HEADER_LEN + msg.payload.len());
    buf.extend_from_slice(&(msg.tag as u32).to_ne_bytes());
    buf.extend_from_slice(&(msg.payload.len() as u32).to_ne_bytes());
    buf.extend_from_slice(&msg.payload);
    write_all_to_fd(fd, &buf)
}

fn write_all_to_fd(fd: RawFd, mut buf: &[u8]) -> Result<()> {
    while !buf.is_empty() {
        let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => {
                    block_until_writable(fd)?;
                    continue;
                }
                _ => return Err(SubjectError::Io(err)),
            }
        }
        buf = &buf[n as usize..];
    }
    Ok(())
}

fn block_until_writable(fd: RawFd) -> Result<()> {
    let mut pfd = libc::pollfd { fd, events: libc::POLLOUT, revents: 0 };
    loop {
        let rc = unsafe { libc::poll(&mut pfd, 1, -1) };
        if rc >= 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(SubjectError::Io(err));
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe { libc::close(self.fd) };
        }
    }
}

/// Open a `socketpair(AF_UNIX, SOCK_STREAM)` with close-on-exec and
/// non-blocking set on both ends, following the fallback ladder the
/// original implementation uses where the combined `SOCK_CLOEXEC` /
/// `SOCK_NONBLOCK` type flags aren't available.
pub(crate) fn open_pair() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0i32; 2];
    #[cfg(any(target_os = "linux", target_os = "freebsd", target_os = "android"))]
    let sock_type = libc::SOCK_STREAM | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK;
    #[cfg(not(any(target_os = "linux", target_os = "freebsd", target_os = "android")))]
    let sock_type = libc::SOCK_STREAM;

    let rc = unsafe { libc::socketpair(libc::AF_UNIX, sock_type, 0, fds.as_mut_ptr()) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    #[cfg(not(any(target_os = "linux", target_os = "freebsd", target_os = "android")))]
    for fd in fds {
        set_cloexec_nonblocking(fd)?;
    }

    Ok((fds[0], fds[1]))
}

#[cfg(not(any(target_os = "linux", target_os = "freebsd", target_os = "android")))]
fn set_cloexec_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
