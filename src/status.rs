//! Wait-status decoding shared by `Subject::wait`, `Subject::eof`, and the
//! termination sequence.

/// A decoded `waitpid` status, produced once a subject's state change has
/// been observed.
///
/// Exactly one of `is_exited`, `is_signaled`, `is_stopped` is true for any
/// given record; `raw_status` always carries the original wait status word
/// so callers that need bit-level detail are never blocked on this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusRecord {
    raw_status: i32,
}

impl StatusRecord {
    /// Wrap a raw status word returned by `waitpid(2)`.
    pub(crate) fn from_raw(raw_status: i32) -> Self {
        Self { raw_status }
    }

    /// The untouched status word, for callers that want to do their own
    /// `WIFEXITED`-style inspection.
    pub fn raw_status(&self) -> i32 {
        self.raw_status
    }

    /// True if the subject exited normally (possibly with a non-zero code).
    pub fn is_exited(&self) -> bool {
        libc::WIFEXITED(self.raw_status)
    }

    /// True if the subject was terminated by a signal.
    pub fn is_signaled(&self) -> bool {
        libc::WIFSIGNALED(self.raw_status)
    }

    /// True if the subject is currently stopped (e.g. by `SIGSTOP`).
    pub fn is_stopped(&self) -> bool {
        libc::WIFSTOPPED(self.raw_status)
    }

    /// True if a previously stopped subject has resumed.
    pub fn is_continued(&self) -> bool {
        libc::WIFCONTINUED(self.raw_status)
    }

    /// The exit code if `is_exited()`, else `None`.
    pub fn exit_code(&self) -> Option<i32> {
        self.is_exited().then(|| libc::WEXITSTATUS(self.raw_status))
    }

    /// The terminating or stopping signal number, if applicable.
    pub fn signal(&self) -> Option<i32> {
        if self.is_signaled() {
            Some(libc::WTERMSIG(self.raw_status))
        } else if self.is_stopped() {
            Some(libc::WSTOPSIG(self.raw_status))
        } else {
            None
        }
    }

    /// Wrap an externally observed exit code as a synthetic "exited"
    /// status, matching the wrapping contract for codes that arrive from a
    /// non-`waitpid` source (e.g. a pre-exec failure reported over IPC).
    pub(crate) fn wrap_exit_code(code: i32) -> Self {
        Self {
            raw_status: (code & 0xff) << 8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn wrapped_exit_code_round_trips() {
        let status = StatusRecord::wrap_exit_code(17);
        assert!(status.is_exited());
        assert_eq!(status.exit_code(), Some(17));
        assert_eq!(status.signal(), None);
    }

    #[test]
    fn exactly_one_shape_for_exited() {
        let status = StatusRecord::wrap_exit_code(0);
        assert!(status.is_exited());
        assert!(!status.is_signaled());
        assert!(!status.is_stopped());
    }

    fn shape_count(status: &StatusRecord) -> u32 {
        status.is_exited() as u32 + status.is_signaled() as u32 + status.is_stopped() as u32
    }

    proptest! {
        #[test]
        fn exited_status_is_never_also_signaled_or_stopped(code in 0u8..=255) {
            let raw = (code as i32) << 8;
            let status = StatusRecord::from_raw(raw);
            prop_assert_eq!(shape_count(&status), 1);
            prop_assert!(status.is_exited());
            prop_assert_eq!(status.exit_code(), Some(code as i32));
            prop_assert_eq!(status.signal(), None);
        }

        #[test]
        fn signaled_status_carries_its_signal_number(signo in 1i32..=64, core_dump in any::<bool>()) {
            let raw = signo | if core_dump { 0x80 } else { 0 };
            let status = StatusRecord::from_raw(raw);
            prop_assert_eq!(shape_count(&status), 1);
            prop_assert!(status.is_signaled());
            prop_assert_eq!(status.signal(), Some(signo));
            prop_assert_eq!(status.exit_code(), None);
        }

        #[test]
        fn stopped_status_carries_its_signal_number(signo in 1i32..=64) {
            let raw = 0x7f | (signo << 8);
            let status = StatusRecord::from_raw(raw);
            prop_assert_eq!(shape_count(&status), 1);
            prop_assert!(status.is_stopped());
            prop_assert_eq!(status.signal(), Some(signo));
        }
    }
}
