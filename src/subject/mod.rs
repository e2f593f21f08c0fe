//! The driver-side handle: spawns a subject, runs the pre-exec
//! configuration handshake, releases it, and exposes the post-release I/O
//! and control surface.

mod child;
mod io;
mod termination;

use std::ffi::CString;
use std::io as stdio;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::env_spec::EnvSpec;
use crate::error::{Result, SubjectError};
use crate::ipc::{self, Endpoint, IpcMessage, Tag};
use crate::logging::log_debug;
use crate::pty;
use crate::sigtable::{self, SigTable};
use crate::status::StatusRecord;
use crate::termios::Termios;

/// A user or group identifier given either numerically or by name.
#[derive(Debug, Clone)]
pub enum IdArg {
    Id(u32),
    Name(String),
}

impl From<u32> for IdArg {
    fn from(id: u32) -> Self {
        IdArg::Id(id)
    }
}

impl From<&str> for IdArg {
    fn from(name: &str) -> Self {
        IdArg::Name(name.to_string())
    }
}

/// The driver-side handle for one spawned subject.
///
/// Not `Clone`: the handle exclusively owns `pty_master` and the IPC
/// endpoint. Dropping it runs the same termination sequence as
/// `close(noop_drain)`, so scope exit never leaks a pty or a zombie.
pub struct Subject {
    pid: libc::pid_t,
    pty_master: RawFd,
    ipc: Option<Endpoint>,
    released: bool,
    eof: bool,
    status: Option<StatusRecord>,
    last_signal: libc::c_int,
    uid: Option<libc::uid_t>,
    gid: Option<libc::gid_t>,
    sig_mask: SigTable,
    sig_caught_mask: SigTable,
    draining: bool,
    term: Option<Termios>,
}

impl Subject {
    /// Fork a subject running `argv`, hand it a fresh pty, and block until
    /// its first `RELEASE`. On failure, the partially-started child is
    /// reaped with `SIGKILL`.
    pub fn spawn(argv: &[&str]) -> Result<Subject> {
        if argv.is_empty() {
            return Err(SubjectError::Fatal("spawn requires a non-empty argv".into()));
        }
        let argv_cstrings: Vec<CString> = argv
            .iter()
            .map(|s| CString::new(*s).map_err(|_| SubjectError::Fatal("argv entry contains a NUL byte".into())))
            .collect::<std::result::Result<_, _>>()?;

        let master_fd = pty::open_master()?;
        let (driver_fd, subject_fd) = ipc::open_pair()?;

        let pid = unsafe { libc::fork() };
        if pid < 0 {
            let err = stdio::Error::last_os_error();
            unsafe {
                libc::close(master_fd);
                libc::close(driver_fd);
                libc::close(subject_fd);
            }
            return Err(SubjectError::Io(err));
        }

        if pid == 0 {
            unsafe { libc::close(driver_fd) };
            let endpoint = Endpoint::new(subject_fd);
            child::run_subject_loop(endpoint, master_fd, argv_cstrings);
        }

        unsafe { libc::close(subject_fd) };
        let mut endpoint = Endpoint::new(driver_fd);

        match endpoint.expect(Tag::Release, None) {
            Ok(_) => {
                log_debug(&format!("subject {pid} released first handshake"));
                Ok(Subject {
                    pid,
                    pty_master: master_fd,
                    ipc: Some(endpoint),
                    released: false,
                    eof: false,
                    status: None,
                    last_signal: 0,
                    uid: None,
                    gid: None,
                    sig_mask: SigTable::new(),
                    sig_caught_mask: SigTable::new(),
                    draining: false,
                    term: None,
                })
            }
            Err(e) => {
                termination::reap_with_kill(pid);
                unsafe { libc::close(master_fd) };
                Err(e)
            }
        }
    }

    fn endpoint(&mut self) -> Result<&mut Endpoint> {
        self.ipc.as_mut().ok_or(SubjectError::AlreadyReleased)
    }

    /// Change the subject's working directory before exec.
    pub fn chdir(&mut self, path: &str) -> Result<()> {
        let mut payload = path.as_bytes().to_vec();
        payload.push(0);
        let errno = self.endpoint()?.send_acked(&IpcMessage::new(Tag::Chdir, payload), Tag::ChdirAck)?;
        ok_or_errno(errno)
    }

    /// Apply an environment spec immediately (outside of `release`).
    pub fn env(&mut self, spec: &EnvSpec) -> Result<()> {
        let errno = self
            .endpoint()?
            .send_acked(&IpcMessage::new(Tag::EnvSetup, spec.to_payload()), Tag::EnvAck)?;
        ok_or_errno(errno)
    }

    /// Set the subject's supplementary groups by numeric gid.
    pub fn setgroups(&mut self, gids: &[libc::gid_t]) -> Result<()> {
        let mut payload = Vec::with_capacity(4 + gids.len() * 4);
        payload.extend_from_slice(&(gids.len() as u32).to_ne_bytes());
        for &gid in gids {
            payload.extend_from_slice(&(gid as u32).to_ne_bytes());
        }
        let errno = self
            .endpoint()?
            .send_acked(&IpcMessage::new(Tag::Setgroups, payload), Tag::SetgroupsAck)?;
        if errno == 0 {
            if groups_fold_into_effective_gid() {
                if let Some(&first) = gids.first() {
                    self.gid = Some(first);
                }
            }
            Ok(())
        } else {
            Err(SubjectError::Errno(errno))
        }
    }

    /// Resolve group names via the name service and apply them.
    pub fn setgroups_named(&mut self, names: &[&str]) -> Result<()> {
        let mut gids = Vec::with_capacity(names.len());
        for name in names {
            gids.push(child::resolve_gid(name)?);
        }
        self.setgroups(&gids)
    }

    /// Adopt `uid`/`gid`, skipping slots that already match the cached
    /// value. Applies gid before uid on the subject side.
    pub fn setid(&mut self, uid: Option<IdArg>, gid: Option<IdArg>) -> Result<(libc::uid_t, libc::gid_t)> {
        let resolved_uid = match uid {
            Some(IdArg::Id(id)) => Some(id as libc::uid_t),
            Some(IdArg::Name(name)) => Some(child::resolve_uid(&name)?),
            None => None,
        };
        let resolved_gid = match gid {
            Some(IdArg::Id(id)) => Some(id as libc::gid_t),
            Some(IdArg::Name(name)) => Some(child::resolve_gid(&name)?),
            None => None,
        };

        let mut flags: u32 = 0;
        let uid_value = resolved_uid.filter(|&u| Some(u) != self.uid).inspect(|_| flags |= 0b01);
        let gid_value = resolved_gid.filter(|&g| Some(g) != self.gid).inspect(|_| flags |= 0b10);

        if flags != 0 {
            let mut payload = Vec::with_capacity(12);
            payload.extend_from_slice(&flags.to_ne_bytes());
            payload.extend_from_slice(&(uid_value.unwrap_or(0) as u32).to_ne_bytes());
            payload.extend_from_slice(&(gid_value.unwrap_or(0) as u32).to_ne_bytes());
            let errno = self
                .endpoint()?
                .send_acked(&IpcMessage::new(Tag::Setid, payload), Tag::SetidAck)?;
            if errno != 0 {
                return Err(SubjectError::Errno(errno));
            }
        }

        if let Some(uid) = resolved_uid {
            self.uid = Some(uid);
        }
        if let Some(gid) = resolved_gid {
            self.gid = Some(gid);
        }
        Ok((self.uid.unwrap_or(0), self.gid.unwrap_or(0)))
    }

    /// Read or set the subject's signal mask. `None` reads the cached
    /// mask back; `Some(table)` installs a new mask.
    pub fn sigmask(&mut self, table: Option<SigTable>) -> Result<SigTable> {
        match table {
            None => Ok(self.sig_mask.clone()),
            Some(table) => {
                let set = sigtable::table_to_sigset(&table);
                let payload = sigtable::sigset_to_bytes(&set);
                let errno = self
                    .endpoint()?
                    .send_acked(&IpcMessage::new(Tag::Setmask, payload), Tag::SetmaskAck)?;
                if errno != 0 {
                    return Err(SubjectError::Errno(errno));
                }
                self.sig_mask = table.clone();
                Ok(table)
            }
        }
    }

    /// Clear the signal mask entirely (the `sigmask(0)` contract).
    pub fn sigmask_clear(&mut self) -> Result<()> {
        self.sigmask(Some(SigTable::new())).map(|_| ())
    }

    /// Read or set which signals the subject ignores (`catch=false`) vs.
    /// restores to default disposition (`catch=true`).
    pub fn sigcatch(&mut self, catch: Option<bool>, table: Option<SigTable>) -> Result<SigTable> {
        match (catch, table) {
            (None, _) => Ok(self.sig_caught_mask.clone()),
            (Some(catch), Some(table)) => {
                let set = sigtable::table_to_sigset(&table);
                let mut payload = sigtable::sigset_to_bytes(&set);
                payload.push(catch as u8);
                let errno = self
                    .endpoint()?
                    .send_acked(&IpcMessage::new(Tag::Sigcatch, payload), Tag::SigcatchAck)?;
                if errno != 0 {
                    return Err(SubjectError::Errno(errno));
                }
                self.sig_caught_mask = table.clone();
                Ok(table)
            }
            (Some(_), None) => Ok(self.sig_caught_mask.clone()),
        }
    }

    /// Inquire the subject's current termios. One-shot per handle: a
    /// second call fails with `TermAlreadyGenerated`.
    pub fn term(&mut self) -> Result<Termios> {
        if self.term.is_some() {
            return Err(SubjectError::TermAlreadyGenerated);
        }
        let endpoint = self.endpoint()?;
        endpoint.send(&IpcMessage::empty(Tag::TermiosInquiry))?;
        let msg = endpoint.expect(Tag::TermiosSet, None)?;
        let term = Termios::from_bytes(&msg.payload).ok_or(SubjectError::UnexpectedMessage(Tag::TermiosSet as u32))?;
        self.term = Some(term);
        Ok(term)
    }

    /// Apply an optional env spec, then send the final `RELEASE` and close
    /// the IPC channel.
    pub fn release(&mut self, env: Option<&EnvSpec>) -> Result<()> {
        if let Some(spec) = env {
            if !spec.is_empty() {
                self.env(spec)?;
            }
        }
        let endpoint = self.endpoint()?;
        endpoint.send(&IpcMessage::empty(Tag::Release))?;
        self.ipc = None;
        self.released = true;
        Ok(())
    }

    pub fn released(&self) -> bool {
        self.released
    }

    pub fn uid(&self) -> Option<libc::uid_t> {
        self.uid
    }

    pub fn gid(&self) -> Option<libc::gid_t> {
        self.gid
    }

    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }

    pub fn has_reached_eof(&self) -> bool {
        self.eof
    }

    pub fn last_status(&self) -> Option<StatusRecord> {
        self.status
    }
}

impl Drop for Subject {
    fn drop(&mut self) {
        let _ = self.close(|| true);
    }
}

fn ok_or_errno(errno: i32) -> Result<()> {
    if errno == 0 {
        Ok(())
    } else {
        Err(SubjectError::Errno(errno))
    }
}

/// FreeBSD folds the first supplementary group into the effective gid on
/// `setgroups`; other platforms leave the cached gid untouched.
fn groups_fold_into_effective_gid() -> bool {
    cfg!(target_os = "freebsd")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_echo_round_trip() {
        let mut subject = Subject::spawn(&["cat"]).expect("spawn cat");
        subject.release(None).expect("release");
        subject.write(b"hello\n").expect("write");

        let mut collected = Vec::new();
        subject
            .read(
                |chunk| {
                    if let Some(bytes) = chunk {
                        collected.extend_from_slice(bytes);
                    }
                    collected.len() >= 5
                },
                Some(2),
            )
            .expect("read");
        assert!(collected.starts_with(b"hello"));

        subject.signal(libc::SIGTERM).expect("signal");
        subject.close(|| true).expect("close");
        let status = subject.last_status().expect("status recorded");
        assert!(status.is_signaled());
        assert_eq!(status.signal(), Some(libc::SIGTERM));
    }

    #[test]
    fn spawn_exit_code_is_observed_after_eof() {
        let mut subject = Subject::spawn(&["sh", "-c", "exit 7"]).expect("spawn sh");
        subject.release(None).expect("release");
        subject.read(|_| true, None).expect("drain to eof");
        let (reached, status) = subject.eof(None).expect("eof");
        assert!(reached);
        let status = status.expect("status");
        assert!(status.is_exited());
        assert_eq!(status.exit_code(), Some(7));
    }

    #[test]
    fn pre_exec_chdir_is_observed_by_subject() {
        let mut subject = Subject::spawn(&["pwd"]).expect("spawn pwd");
        subject.chdir("/tmp").expect("chdir");
        subject.release(None).expect("release");

        let mut line = Vec::new();
        subject
            .read(
                |chunk| {
                    if let Some(bytes) = chunk {
                        line.extend_from_slice(bytes);
                    }
                    line.contains(&b'\n')
                },
                Some(2),
            )
            .expect("read");
        let text = String::from_utf8_lossy(&line);
        assert!(text.trim().ends_with("/tmp"));
        subject.close(|| true).ok();
    }

    #[test]
    fn pre_exec_setid_failure_does_not_block_release() {
        if unsafe { libc::geteuid() } == 0 {
            return; // meaningless as an unprivileged-failure check when run as root
        }
        let mut subject = Subject::spawn(&["true"]).expect("spawn true");
        let err = subject.setid(Some(IdArg::Id(0)), None).unwrap_err();
        match err {
            SubjectError::Errno(errno) => assert_eq!(errno, libc::EPERM),
            other => panic!("expected EPERM, got {other:?}"),
        }
        subject.release(None).expect("release still succeeds");
    }

    #[test]
    fn kill_escalation_reaches_sigkill() {
        let mut subject = Subject::spawn(&["sh", "-c", "trap '' TERM; sleep 30"]).expect("spawn");
        subject.release(None).expect("release");
        std::thread::sleep(Duration::from_millis(200));
        subject.close(|| true).expect("close escalates to SIGKILL");
        let status = subject.last_status().expect("status recorded");
        assert!(status.is_signaled());
        assert_eq!(status.signal(), Some(libc::SIGKILL));
    }

    #[test]
    fn stop_then_continue_round_trip() {
        let mut subject = Subject::spawn(&["cat"]).expect("spawn cat");
        subject.release(None).expect("release");

        subject.stop().expect("stop");
        let timed_out = subject.read(|_| true, Some(1)).expect("read while stopped");
        assert!(timed_out);

        subject.continue_(true).expect("continue");
        subject.write(b"x\n").expect("write");
        let mut collected = Vec::new();
        subject
            .read(
                |chunk| {
                    if let Some(bytes) = chunk {
                        collected.extend_from_slice(bytes);
                    }
                    collected.contains(&b'x')
                },
                Some(2),
            )
            .expect("read");
        assert!(collected.contains(&b'x'));

        subject.signal(libc::SIGTERM).ok();
        subject.close(|| true).ok();
    }

    #[test]
    fn env_round_trip_is_observed_by_subject() {
        let spec = EnvSpec::new()
            .clear(true)
            .set("A", "1")
            .set("B", "2")
            .unset("C");
        let mut subject = Subject::spawn(&["sh", "-c", "env"]).expect("spawn sh");
        subject.release(Some(&spec)).expect("release with env");

        let mut out = Vec::new();
        subject
            .read(
                |chunk| match chunk {
                    Some(bytes) => {
                        out.extend_from_slice(bytes);
                        false
                    }
                    None => true,
                },
                Some(2),
            )
            .ok();
        let text = String::from_utf8_lossy(&out);
        let vars: std::collections::HashSet<&str> = text.lines().collect();
        assert!(vars.contains("A=1"));
        assert!(vars.contains("B=2"));
        assert!(!text.contains("C="));
    }

    #[test]
    fn sigmask_read_after_write_round_trips() {
        let mut subject = Subject::spawn(&["cat"]).expect("spawn cat");
        let mut table = SigTable::new();
        table.insert(libc::SIGUSR1, true);
        table.insert(libc::SIGUSR2, true);
        subject.sigmask(Some(table.clone())).expect("set mask");
        let read_back = subject.sigmask(None).expect("read mask");
        assert_eq!(read_back, table);
        subject.release(None).expect("release");
        subject.signal(libc::SIGTERM).ok();
        subject.close(|| true).ok();
    }
}
