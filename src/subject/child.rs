//! Subject-side pre-exec loop: runs only in the forked child, never
//! returns. Every exit path is either a successful `exec` or
//! `libc::_exit(1)` after reporting an `ERROR` message.

use std::ffi::CString;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

use crate::ipc::{self, Endpoint, IpcMessage, Tag};
use crate::pty;
use crate::sigtable;
use crate::termios::Termios;

pub(crate) fn run_subject_loop(mut endpoint: Endpoint, master_fd: RawFd, argv: Vec<CString>) -> ! {
    if unsafe { libc::setsid() } < 0 {
        fail(&mut endpoint, format!("setsid: {}", io::Error::last_os_error()));
    }

    let slave_fd = match pty::open_slave_for_session(master_fd) {
        Ok(fd) => fd,
        Err(e) => fail(&mut endpoint, format!("open pty slave: {e}")),
    };

    let term = match pty::capture_termios(slave_fd) {
        Ok(raw) => Termios::from_raw(raw),
        Err(e) => fail(&mut endpoint, format!("tcgetattr: {e}")),
    };

    unsafe { libc::close(master_fd) };

    for target in 0..=2 {
        if unsafe { libc::dup2(slave_fd, target) } < 0 {
            fail(&mut endpoint, format!("dup2: {}", io::Error::last_os_error()));
        }
    }
    if slave_fd > 2 {
        unsafe { libc::close(slave_fd) };
    }

    if endpoint.send(&IpcMessage::empty(Tag::Release)).is_err() {
        unsafe { libc::_exit(1) };
    }

    register_handlers(&mut endpoint, term);

    loop {
        match endpoint.wait(None) {
            Ok(Some(msg)) if msg.tag == Tag::Release => break,
            Ok(Some(msg)) => fail(&mut endpoint, format!("unexpected message type {:?}", msg.tag as u32)),
            Ok(None) => unsafe { libc::_exit(1) },
            Err(e) => fail(&mut endpoint, format!("dispatch: {e}")),
        }
    }

    unsafe { libc::signal(libc::SIGTERM, libc::SIG_DFL) };

    let mut argv_ptrs: Vec<*const libc::c_char> = argv.iter().map(|s| s.as_ptr()).collect();
    argv_ptrs.push(std::ptr::null());

    unsafe { libc::execvp(argv_ptrs[0], argv_ptrs.as_ptr()) };
    let err = io::Error::last_os_error();
    fail(&mut endpoint, format!("execvp: {err}"));
}

/// Register the eight pre-exec tag handlers through `Endpoint::register`,
/// mirroring `porch_child_*`'s table-dispatch. Each closure always returns
/// 0 (a nonzero return aborts the whole dispatch loop in `Endpoint::wait`);
/// the requested operation's own errno, if any, travels in the ACK payload
/// instead, so e.g. a failed `setid` doesn't block a later `release`.
fn register_handlers(endpoint: &mut Endpoint, term: Termios) {
    let fd = endpoint.raw_fd();
    let term = Arc::new(Mutex::new(term));

    {
        let term = term.clone();
        endpoint.register(Tag::TermiosInquiry, move |_msg| {
            let bytes = term.lock().unwrap().to_bytes();
            let _ = ipc::send_frame(fd, &IpcMessage::new(Tag::TermiosSet, bytes));
            0
        });
    }
    {
        let term = term.clone();
        endpoint.register(Tag::TermiosSet, move |msg| {
            let errno = match Termios::from_bytes(&msg.payload) {
                Some(new_term) => {
                    if unsafe { libc::tcsetattr(1, libc::TCSANOW, new_term.raw()) } == 0 {
                        *term.lock().unwrap() = new_term;
                        0
                    } else {
                        last_errno()
                    }
                }
                None => libc::EINVAL,
            };
            let _ = ipc::send_frame(fd, &IpcMessage::ack(Tag::TermiosAck, errno));
            0
        });
    }
    endpoint.register(Tag::EnvSetup, move |msg| {
        let errno = handle_env_setup(&msg.payload);
        let _ = ipc::send_frame(fd, &IpcMessage::ack(Tag::EnvAck, errno));
        0
    });
    endpoint.register(Tag::Chdir, move |msg| {
        let errno = handle_chdir(&msg.payload);
        let _ = ipc::send_frame(fd, &IpcMessage::ack(Tag::ChdirAck, errno));
        0
    });
    endpoint.register(Tag::Setgroups, move |msg| {
        let errno = handle_setgroups(&msg.payload);
        let _ = ipc::send_frame(fd, &IpcMessage::ack(Tag::SetgroupsAck, errno));
        0
    });
    endpoint.register(Tag::Setid, move |msg| {
        let errno = handle_setid(&msg.payload);
        let _ = ipc::send_frame(fd, &IpcMessage::ack(Tag::SetidAck, errno));
        0
    });
    endpoint.register(Tag::Setmask, move |msg| {
        let errno = handle_setmask(&msg.payload);
        let _ = ipc::send_frame(fd, &IpcMessage::ack(Tag::SetmaskAck, errno));
        0
    });
    endpoint.register(Tag::Sigcatch, move |msg| {
        let errno = handle_sigcatch(&msg.payload);
        let _ = ipc::send_frame(fd, &IpcMessage::ack(Tag::SigcatchAck, errno));
        0
    });
}

fn fail(endpoint: &mut Endpoint, detail: String) -> ! {
    let _ = endpoint.send(&IpcMessage::new(Tag::Error, detail.into_bytes()));
    unsafe { libc::_exit(1) }
}

fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(libc::EINVAL)
}

fn split_nul_terminated(bytes: &[u8]) -> impl Iterator<Item = &[u8]> {
    bytes.split(|&b| b == 0).filter(|s| !s.is_empty())
}

fn handle_env_setup(payload: &[u8]) -> i32 {
    if payload.len() < 9 {
        return libc::EINVAL;
    }
    let clear = payload[0] != 0;
    let set_len = u32::from_ne_bytes(payload[1..5].try_into().unwrap()) as usize;
    let unset_len = u32::from_ne_bytes(payload[5..9].try_into().unwrap()) as usize;
    if payload.len() < 9 + set_len + unset_len {
        return libc::EINVAL;
    }
    let set_block = &payload[9..9 + set_len];
    let unset_block = &payload[9 + set_len..9 + set_len + unset_len];

    if clear {
        unsafe { libc::clearenv() };
    }
    for name in split_nul_terminated(unset_block) {
        if let Ok(cname) = CString::new(name) {
            unsafe { libc::unsetenv(cname.as_ptr()) };
        }
    }
    let mut errno = 0;
    for pair in split_nul_terminated(set_block) {
        let Some(eq) = pair.iter().position(|&b| b == b'=') else {
            continue;
        };
        let (name, value) = (&pair[..eq], &pair[eq + 1..]);
        if let (Ok(cname), Ok(cvalue)) = (CString::new(name), CString::new(value)) {
            if unsafe { libc::setenv(cname.as_ptr(), cvalue.as_ptr(), 1) } != 0 {
                errno = last_errno();
            }
        }
    }
    errno
}

fn handle_chdir(payload: &[u8]) -> i32 {
    let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    match CString::new(&payload[..end]) {
        Ok(path) => {
            if unsafe { libc::chdir(path.as_ptr()) } == 0 {
                0
            } else {
                last_errno()
            }
        }
        Err(_) => libc::EINVAL,
    }
}

fn handle_setgroups(payload: &[u8]) -> i32 {
    if payload.len() < 4 {
        return libc::EINVAL;
    }
    let count = u32::from_ne_bytes(payload[0..4].try_into().unwrap()) as usize;
    let gid_size = std::mem::size_of::<libc::gid_t>();
    if payload.len() < 4 + count * gid_size {
        return libc::EINVAL;
    }
    let mut gids = Vec::with_capacity(count);
    for i in 0..count {
        let start = 4 + i * gid_size;
        let raw = u32::from_ne_bytes(payload[start..start + 4].try_into().unwrap());
        gids.push(raw as libc::gid_t);
    }
    let rc = unsafe { libc::setgroups(gids.len() as libc::size_t, gids.as_ptr()) };
    if rc == 0 {
        0
    } else {
        last_errno()
    }
}

const SETID_SETUID_FLAG: u32 = 0b01;
const SETID_SETGID_FLAG: u32 = 0b10;

fn handle_setid(payload: &[u8]) -> i32 {
    if payload.len() < 12 {
        return libc::EINVAL;
    }
    let flags = u32::from_ne_bytes(payload[0..4].try_into().unwrap());
    let uid = u32::from_ne_bytes(payload[4..8].try_into().unwrap()) as libc::uid_t;
    let gid = u32::from_ne_bytes(payload[8..12].try_into().unwrap()) as libc::gid_t;

    // setgid before setuid: once uid is dropped, gid changes may no longer
    // be permitted.
    if flags & SETID_SETGID_FLAG != 0 && unsafe { libc::setgid(gid) } != 0 {
        return last_errno();
    }
    if flags & SETID_SETUID_FLAG != 0 && unsafe { libc::setuid(uid) } != 0 {
        return last_errno();
    }
    0
}

fn handle_setmask(payload: &[u8]) -> i32 {
    match sigtable::bytes_to_sigset(payload) {
        Some(set) => {
            let rc = unsafe { libc::sigprocmask(libc::SIG_SETMASK, &set, std::ptr::null_mut()) };
            if rc == 0 {
                0
            } else {
                last_errno()
            }
        }
        None => libc::EINVAL,
    }
}

fn handle_sigcatch(payload: &[u8]) -> i32 {
    if payload.is_empty() {
        return libc::EINVAL;
    }
    let (set_bytes, catch_byte) = payload.split_at(payload.len() - 1);
    let catch = catch_byte[0] != 0;
    let set = match sigtable::bytes_to_sigset(set_bytes) {
        Some(set) => set,
        None => return libc::EINVAL,
    };
    for (signo, present) in sigtable::sigset_to_table(&set) {
        if !present {
            continue;
        }
        let handler = if catch { libc::SIG_DFL } else { libc::SIG_IGN };
        if unsafe { libc::signal(signo, handler) } == libc::SIG_ERR {
            return last_errno();
        }
    }
    0
}

/// Used by `Subject::setid`/`setgroups` name resolution on the driver side,
/// but kept here since it shares the `getpwnam_r`/`getgrnam_r` buffer-sizing
/// dance with nothing else in the crate.
pub(crate) fn resolve_uid(name: &str) -> io::Result<libc::uid_t> {
    let cname = CString::new(name).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut buf = vec![0i8; 4096];
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    let rc = unsafe {
        libc::getpwnam_r(cname.as_ptr(), &mut pwd, buf.as_mut_ptr(), buf.len(), &mut result)
    };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }
    if result.is_null() {
        return Err(io::Error::new(io::ErrorKind::NotFound, "unknown user"));
    }
    Ok(pwd.pw_uid)
}

pub(crate) fn resolve_gid(name: &str) -> io::Result<libc::gid_t> {
    let cname = CString::new(name).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    let mut grp: libc::group = unsafe { std::mem::zeroed() };
    let mut buf = vec![0i8; 4096];
    let mut result: *mut libc::group = std::ptr::null_mut();
    let rc = unsafe {
        libc::getgrnam_r(cname.as_ptr(), &mut grp, buf.as_mut_ptr(), buf.len(), &mut result)
    };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }
    if result.is_null() {
        return Err(io::Error::new(io::ErrorKind::NotFound, "unknown group"));
    }
    Ok(grp.gr_gid)
}
