use std::os::unix::io::RawFd;

use subjectpty::{SubjectError, Subject};

fn make_pipe() -> (RawFd, RawFd) {
    let mut fds = [0i32; 2];
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(rc, 0, "pipe() failed");
    (fds[0], fds[1])
}

#[test]
fn term_reports_a_sane_slave_termios() {
    let mut subject = Subject::spawn(&["cat"]).expect("spawn cat");
    let term = subject.term().expect("term");
    assert_ne!(term.raw().c_cflag, 0);

    let err = subject.term().unwrap_err();
    assert!(matches!(err, SubjectError::TermAlreadyGenerated));

    subject.release(None).expect("release");
    subject.signal(libc::SIGTERM).ok();
    subject.close(|| true).ok();
}

#[test]
fn proxy_relays_pty_output_to_a_pipe_until_eof() {
    let mut subject = Subject::spawn(&["sh", "-c", "echo hi; exit 0"]).expect("spawn sh");
    subject.release(None).expect("release");

    let (read_fd, write_fd) = make_pipe();
    let mut relayed = Vec::new();
    let mut input_closed = false;

    let clean = subject
        .proxy(
            write_fd,
            |chunk| relayed.extend_from_slice(chunk),
            |chunk| {
                if chunk.is_none() {
                    input_closed = true;
                }
            },
            None::<fn() -> bool>,
        )
        .expect("proxy");

    unsafe {
        libc::close(read_fd);
        libc::close(write_fd);
    }

    assert!(clean, "subject exited cleanly, proxy should report no bail");
    assert!(input_closed, "proxy must signal pty eof on the input side");
    assert!(String::from_utf8_lossy(&relayed).contains("hi"));

    let (reached, status) = subject.eof(None).expect("eof");
    assert!(reached);
    assert_eq!(status.expect("status").exit_code(), Some(0));
}

#[test]
fn setgroups_named_resolves_and_applies_before_release() {
    let mut subject = Subject::spawn(&["true"]).expect("spawn true");
    match subject.setgroups_named(&["nogroup"]).or_else(|_| subject.setgroups_named(&["nobody"])) {
        Ok(()) => {}
        Err(SubjectError::Errno(_)) | Err(SubjectError::Io(_)) => {
            // name service unavailable in this environment; not what's under test.
        }
        Err(other) => panic!("unexpected error: {other:?}"),
    }
    subject.release(None).expect("release");
    subject.read(|_| true, Some(2)).ok();
}
