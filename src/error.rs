//! Error types surfaced across the public `Subject` API.
//!
//! Five shapes, matching the five error classes a caller needs to tell
//! apart: stale-state, transport, subject-side errno, termination anomaly,
//! and a fatal message relayed from the subject before it gave up.

use std::fmt;
use std::io;

/// Errors returned by `Subject` operations.
#[derive(Debug)]
pub enum SubjectError {
    /// An IPC-requiring operation was attempted after `release()`.
    AlreadyReleased,
    /// A post-release-only operation (`signal`, `write`, `proxy`, `read`)
    /// was attempted before `release()`.
    NotYetReleased,
    /// An operation requiring a live `pid` was attempted after the subject
    /// was reaped.
    AlreadyTerminated,
    /// `term()` was called a second time on the same handle.
    TermAlreadyGenerated,
    /// A raw I/O failure on the socket-pair or the pty master.
    Io(io::Error),
    /// The dispatch loop received a tag with no registered handler and no
    /// pending `send_acked` waiting on it.
    UnexpectedMessage(u32),
    /// An ACK carried a non-zero errno from the subject.
    Errno(i32),
    /// The subject died by a signal the driver did not send via `signal()`.
    KilledBySignal(i32),
    /// Even SIGKILL escalation failed to reap the subject.
    KillFailed,
    /// A fatal, pre-exec diagnostic relayed from the subject via `ERROR`.
    Fatal(String),
}

impl fmt::Display for SubjectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubjectError::AlreadyReleased => write!(f, "process already released"),
            SubjectError::NotYetReleased => write!(f, "process not yet released"),
            SubjectError::AlreadyTerminated => write!(f, "process has already terminated"),
            SubjectError::TermAlreadyGenerated => write!(f, "process term already generated"),
            SubjectError::Io(err) => write!(f, "{err}"),
            SubjectError::UnexpectedMessage(tag) => {
                write!(f, "unexpected message type {tag}")
            }
            SubjectError::Errno(errno) => write!(f, "{}", strerror(*errno)),
            SubjectError::KilledBySignal(signo) => {
                write!(f, "spawned process killed with signal {signo}")
            }
            SubjectError::KillFailed => write!(f, "could not kill process with SIGTERM"),
            SubjectError::Fatal(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for SubjectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SubjectError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for SubjectError {
    fn from(err: io::Error) -> Self {
        SubjectError::Io(err)
    }
}

/// Render an errno the same way `strerror(3)` would, without requiring the
/// caller to set `errno` themselves first.
pub(crate) fn strerror(errno: i32) -> String {
    io::Error::from_raw_os_error(errno).to_string()
}

/// Convenience alias used throughout the crate's public surface.
pub type Result<T> = std::result::Result<T, SubjectError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_documented_shapes() {
        assert_eq!(
            SubjectError::AlreadyReleased.to_string(),
            "process already released"
        );
        assert_eq!(
            SubjectError::KilledBySignal(15).to_string(),
            "spawned process killed with signal 15"
        );
        assert_eq!(
            SubjectError::KillFailed.to_string(),
            "could not kill process with SIGTERM"
        );
    }

    #[test]
    fn errno_renders_strerror() {
        let msg = SubjectError::Errno(libc::EPERM).to_string();
        assert!(msg.to_lowercase().contains("operation not permitted") || !msg.is_empty());
    }
}
