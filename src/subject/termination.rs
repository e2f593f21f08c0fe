//! Kill escalation, at-most-once reap, and the blocking/semantic wait
//! primitives the public contract builds on.

use std::io;
use std::time::{Duration, Instant};

use crate::error::{Result, SubjectError};
use crate::status::StatusRecord;

use super::Subject;

const KILL_ESCALATION_BUDGET: Duration = Duration::from_secs(5);

extern "C" fn noop_sigalrm_handler(_signo: libc::c_int) {}

/// Installs via `sigaction` rather than `signal`: on Linux, `signal()`
/// installs with `SA_RESTART` set, which would make the alarm-interrupted
/// `waitpid` in `wait_bounded` restart instead of returning `EINTR`, and
/// the whole kill-escalation deadline would never fire.
fn install_noop_sigalrm() -> libc::sigaction {
    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction = noop_sigalrm_handler as libc::sighandler_t;
    unsafe { libc::sigemptyset(&mut action.sa_mask) };
    action.sa_flags = 0;
    let mut previous: libc::sigaction = unsafe { std::mem::zeroed() };
    unsafe { libc::sigaction(libc::SIGALRM, &action, &mut previous) };
    previous
}

fn restore_sigalrm(previous: libc::sigaction) {
    unsafe { libc::sigaction(libc::SIGALRM, &previous, std::ptr::null_mut()) };
}

pub(crate) fn reap_with_kill(pid: libc::pid_t) {
    unsafe { libc::kill(pid, libc::SIGKILL) };
    let mut status: libc::c_int = 0;
    loop {
        let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
        if rc >= 0 {
            return;
        }
        if io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
            return;
        }
    }
}

impl Subject {
    /// Non-blocking (`hang=false`) or blocking (`hang=true`) reap. On
    /// success, clears `pid` and captures the raw status. Used by `eof`,
    /// `close`, and the proxy EOF path.
    pub(crate) fn try_reap(&mut self, hang: bool) -> Result<Option<StatusRecord>> {
        if self.pid == 0 {
            return Ok(None);
        }
        let flags = if hang { 0 } else { libc::WNOHANG };
        let mut status: libc::c_int = 0;
        loop {
            let rc = unsafe { libc::waitpid(self.pid, &mut status, flags) };
            if rc == self.pid {
                let record = StatusRecord::from_raw(status);
                self.pid = 0;
                self.status = Some(record);
                return Ok(Some(record));
            }
            if rc == 0 {
                return Ok(None);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::ECHILD) => {
                    self.pid = 0;
                    return Ok(None);
                }
                _ => return Err(SubjectError::Io(err)),
            }
        }
    }

    /// Blocking wait bounded by `deadline`, relying on the pending
    /// `SIGALRM` to interrupt the syscall once the deadline passes.
    fn wait_bounded(&mut self, deadline: Instant) -> Result<Option<StatusRecord>> {
        let mut status: libc::c_int = 0;
        loop {
            let rc = unsafe { libc::waitpid(self.pid, &mut status, 0) };
            if rc == self.pid {
                let record = StatusRecord::from_raw(status);
                self.pid = 0;
                self.status = Some(record);
                return Ok(Some(record));
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => {
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                    continue;
                }
                Some(libc::ECHILD) => {
                    self.pid = 0;
                    return Ok(None);
                }
                _ => return Err(SubjectError::Io(err)),
            }
        }
    }

    /// Semantic wait: loops across `EINTR`; returns once the subject
    /// exits, is signaled, or (if requested) stops/continues.
    pub(crate) fn wait_semantic(&mut self, report_stopped: bool, report_continued: bool) -> Result<StatusRecord> {
        debug_assert!(!(report_stopped && report_continued));
        let flags = if report_stopped {
            libc::WUNTRACED
        } else if report_continued {
            libc::WCONTINUED
        } else {
            0
        };
        let mut status: libc::c_int = 0;
        loop {
            let rc = unsafe { libc::waitpid(self.pid, &mut status, flags) };
            if rc == self.pid {
                let record = StatusRecord::from_raw(status);
                if report_stopped && !record.is_stopped() && !record.is_exited() && !record.is_signaled() {
                    continue;
                }
                if report_continued && !record.is_continued() && !record.is_exited() && !record.is_signaled() {
                    continue;
                }
                if record.is_exited() || record.is_signaled() {
                    self.pid = 0;
                }
                self.status = Some(record);
                return Ok(record);
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(SubjectError::Io(err));
        }
    }

    fn abandon_pty_master(&mut self) {
        if self.pty_master >= 0 {
            unsafe { libc::close(self.pty_master) };
            self.pty_master = -1;
        }
    }

    /// The canonical destructor. Idempotent: a second call on an already
    /// closed handle returns success without side effects.
    pub fn close<F: FnMut() -> bool>(&mut self, mut drain: F) -> Result<()> {
        if self.pid == 0 {
            self.finish_close();
            return Ok(());
        }

        if let Some(status) = self.try_reap(false)? {
            self.finish_close();
            return self.check_anomaly(status);
        }

        let prev_handler = install_noop_sigalrm();
        unsafe { libc::kill(self.pid, libc::SIGTERM) };
        self.last_signal = libc::SIGTERM;
        unsafe { libc::alarm(KILL_ESCALATION_BUDGET.as_secs() as libc::c_uint) };
        let deadline = Instant::now() + KILL_ESCALATION_BUDGET;

        self.draining = true;
        while !drain() {
            if Instant::now() >= deadline {
                break;
            }
        }
        self.draining = false;

        let reaped = self.wait_bounded(deadline)?;
        unsafe { libc::alarm(0) };
        restore_sigalrm(prev_handler);

        let status = match reaped {
            Some(status) => status,
            None => {
                self.abandon_pty_master();
                unsafe { libc::kill(self.pid, libc::SIGKILL) };
                self.last_signal = libc::SIGKILL;
                match self.wait_bounded(Instant::now() + KILL_ESCALATION_BUDGET)? {
                    Some(status) => status,
                    None => {
                        self.finish_close();
                        return Err(SubjectError::KillFailed);
                    }
                }
            }
        };

        self.finish_close();
        self.check_anomaly(status)
    }

    fn check_anomaly(&self, status: StatusRecord) -> Result<()> {
        if status.is_signaled() {
            let signo = status.signal().unwrap_or(0);
            if signo != self.last_signal {
                return Err(SubjectError::KilledBySignal(signo));
            }
        }
        Ok(())
    }

    fn finish_close(&mut self) {
        self.pid = 0;
        self.ipc = None;
        self.abandon_pty_master();
    }

    /// Returns `(true, status)` if the subject had already reached EOF and
    /// is reaped within `timeout` (0 = poll, `None` = block forever);
    /// `(false, None)` if no EOF has been observed yet.
    pub fn eof(&mut self, timeout: Option<Duration>) -> Result<(bool, Option<StatusRecord>)> {
        if !self.eof {
            return Ok((false, None));
        }
        if self.pid == 0 {
            return Ok((true, self.status));
        }
        match timeout {
            Some(Duration::ZERO) => Ok((true, self.try_reap(false)?)),
            Some(budget) => {
                let prev = install_noop_sigalrm();
                unsafe { libc::alarm(budget.as_secs().max(1) as libc::c_uint) };
                let deadline = Instant::now() + budget;
                let result = self.wait_bounded(deadline);
                unsafe { libc::alarm(0) };
                restore_sigalrm(prev);
                Ok((true, result?))
            }
            None => Ok((true, Some(self.try_reap(true)?.expect("blocking reap always yields a status")))),
        }
    }

    /// Send a signal to the subject, recording it as `last_signal` so a
    /// subsequent death by that signal isn't reported as an anomaly.
    pub fn signal(&mut self, signo: libc::c_int) -> Result<()> {
        if !self.released {
            return Err(SubjectError::NotYetReleased);
        }
        if self.pid == 0 {
            return Err(SubjectError::AlreadyTerminated);
        }
        self.last_signal = signo;
        if unsafe { libc::kill(self.pid, signo) } != 0 {
            return Err(SubjectError::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Send `SIGSTOP` and wait for `WIFSTOPPED`.
    pub fn stop(&mut self) -> Result<()> {
        if self.pid == 0 {
            return Err(SubjectError::AlreadyTerminated);
        }
        unsafe { libc::kill(self.pid, libc::SIGSTOP) };
        let status = self.wait_semantic(true, false)?;
        if status.is_stopped() {
            Ok(())
        } else {
            Err(SubjectError::AlreadyTerminated)
        }
    }

    /// Optionally send `SIGCONT`, then wait for `WIFCONTINUED`.
    pub fn continue_(&mut self, send: bool) -> Result<()> {
        if self.pid == 0 {
            return Err(SubjectError::AlreadyTerminated);
        }
        if send {
            unsafe { libc::kill(self.pid, libc::SIGCONT) };
        }
        let status = self.wait_semantic(false, true)?;
        if status.is_continued() {
            Ok(())
        } else {
            Err(SubjectError::AlreadyTerminated)
        }
    }
}
