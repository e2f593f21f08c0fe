use super::*;

fn endpoint_pair() -> (Endpoint, Endpoint) {
    let (a, b) = open_pair().expect("socketpair");
    (Endpoint::new(a), Endpoint::new(b))
}

#[test]
fn send_recv_round_trips_a_frame() {
    let (mut a, mut b) = endpoint_pair();
    a.send(&IpcMessage::new(Tag::Chdir, b"/tmp\0".to_vec())).unwrap();

    let deadline = Instant::now() + Duration::from_secs(1);
    let msg = b.wait(Some(deadline)).unwrap().expect("frame arrived");
    assert_eq!(msg.tag, Tag::Chdir);
    assert_eq!(msg.payload, b"/tmp\0");
}

#[test]
fn send_acked_returns_embedded_errno() {
    let (mut driver, mut subject) = endpoint_pair();
    std::thread::scope(|scope| {
        scope.spawn(|| {
            let received = subject
                .wait(Some(Instant::now() + Duration::from_secs(1)))
                .unwrap()
                .unwrap();
            assert_eq!(received.tag, Tag::Chdir);
            subject.send(&IpcMessage::ack(Tag::ChdirAck, 0)).unwrap();
        });
        let errno = driver
            .send_acked(&IpcMessage::empty(Tag::Chdir), Tag::ChdirAck)
            .unwrap();
        assert_eq!(errno, 0);
    });
}

#[test]
fn send_acked_surfaces_nonzero_errno() {
    let (mut driver, mut subject) = endpoint_pair();
    std::thread::scope(|scope| {
        scope.spawn(|| {
            let msg = subject
                .wait(Some(Instant::now() + Duration::from_secs(1)))
                .unwrap()
                .unwrap();
            assert_eq!(msg.tag, Tag::Setid);
            subject
                .send(&IpcMessage::ack(Tag::SetidAck, libc::EPERM))
                .unwrap();
        });
        let errno = driver
            .send_acked(&IpcMessage::empty(Tag::Setid), Tag::SetidAck)
            .unwrap();
        assert_eq!(errno, libc::EPERM);
    });
}

#[test]
fn send_acked_reports_error_tag_as_fatal() {
    let (mut driver, mut subject) = endpoint_pair();
    std::thread::scope(|scope| {
        scope.spawn(|| {
            let _ = subject
                .wait(Some(Instant::now() + Duration::from_secs(1)))
                .unwrap()
                .unwrap();
            subject
                .send(&IpcMessage::new(Tag::Error, b"setsid failed".to_vec()))
                .unwrap();
        });
        let err = driver
            .send_acked(&IpcMessage::empty(Tag::Chdir), Tag::ChdirAck)
            .unwrap_err();
        match err {
            SubjectError::Fatal(msg) => assert_eq!(msg, "setsid failed"),
            other => panic!("expected Fatal, got {other:?}"),
        }
    });
}

#[test]
fn registered_handler_intercepts_matching_tag() {
    let (mut a, mut b) = endpoint_pair();
    let seen = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let seen_in_handler = seen.clone();
    b.register(Tag::TermiosInquiry, move |_msg| {
        seen_in_handler.store(true, std::sync::atomic::Ordering::SeqCst);
        0
    });

    a.send(&IpcMessage::empty(Tag::TermiosInquiry)).unwrap();
    a.send(&IpcMessage::empty(Tag::Release)).unwrap();

    let msg = b
        .wait(Some(Instant::now() + Duration::from_secs(1)))
        .unwrap()
        .expect("unhandled RELEASE surfaces to caller");
    assert_eq!(msg.tag, Tag::Release);
    assert!(seen.load(std::sync::atomic::Ordering::SeqCst));
}

#[test]
fn wait_returns_none_when_peer_closes() {
    let (a, mut b) = endpoint_pair();
    drop(a);
    let result = b.wait(Some(Instant::now() + Duration::from_secs(1))).unwrap();
    assert!(result.is_none());
    assert!(b.stopped());
}
