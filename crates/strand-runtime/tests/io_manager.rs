//! Integration tests for the IoManager reactor

mod common;

use rand::Rng;
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use strand_runtime::{Error, Event, IoManager, Readiness};

fn socket_pair() -> (UnixStream, UnixStream) {
    let (a, b) = UnixStream::pair().unwrap();
    a.set_nonblocking(true).unwrap();
    b.set_nonblocking(true).unwrap();
    (a, b)
}

#[test]
fn test_read_event_fires_once() {
    common::init_tracing();
    let io = IoManager::new(2, false, "read_once").unwrap();
    let (a, mut b) = socket_pair();

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    io.add_event(a.as_raw_fd(), Event::READ, move |readiness| {
        assert_eq!(readiness, Readiness::Ready);
        counter.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();
    assert_eq!(io.pending_events(), 1);

    b.write_all(b"ping").unwrap();
    assert!(common::wait_until(Duration::from_secs(5), || {
        fired.load(Ordering::SeqCst) == 1
    }));

    // one-shot: more data does not fire again
    b.write_all(b"pong").unwrap();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(io.pending_events(), 0);

    io.stop();
}

#[test]
fn test_write_event_on_writable_socket() {
    common::init_tracing();
    let io = IoManager::new(1, false, "writable").unwrap();
    let (a, _b) = socket_pair();

    let (tx, rx) = crossbeam::channel::bounded(1);
    io.add_event(a.as_raw_fd(), Event::WRITE, move |readiness| {
        tx.send(readiness).unwrap();
    })
    .unwrap();

    let readiness = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(readiness, Readiness::Ready);
    io.stop();
}

#[test]
fn test_read_and_write_on_same_fd() {
    common::init_tracing();
    let io = IoManager::new(1, false, "both").unwrap();
    let (a, mut b) = socket_pair();
    let fd = a.as_raw_fd();

    let (tx, rx) = crossbeam::channel::unbounded();
    let read_tx = tx.clone();
    io.add_event(fd, Event::READ, move |r| read_tx.send(("read", r)).unwrap())
        .unwrap();
    io.add_event(fd, Event::WRITE, move |r| tx.send(("write", r)).unwrap())
        .unwrap();

    let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(first, ("write", Readiness::Ready));
    assert_eq!(io.pending_events(), 1);

    b.write_all(b"x").unwrap();
    let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(second, ("read", Readiness::Ready));

    io.stop();
}

#[test]
fn test_cancel_event_resumes_with_cancelled() {
    common::init_tracing();
    let io = IoManager::new(2, false, "cancel").unwrap();
    let (a, _b) = socket_pair();
    let fd = a.as_raw_fd();

    let (tx, rx) = crossbeam::channel::bounded(1);
    io.add_event(fd, Event::READ, move |r| tx.send(r).unwrap())
        .unwrap();

    assert!(io.cancel_event(fd, Event::READ));
    assert!(!io.cancel_event(fd, Event::READ));

    let readiness = rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(readiness, Readiness::Cancelled);
    assert_eq!(io.pending_events(), 0);
    io.stop();
}

#[test]
fn test_del_event_drops_callback() {
    common::init_tracing();
    let io = IoManager::new(1, false, "del").unwrap();
    let (a, mut b) = socket_pair();
    let fd = a.as_raw_fd();

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    io.add_event(fd, Event::READ, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();

    assert!(io.del_event(fd, Event::READ));
    assert!(!io.del_event(fd, Event::READ));
    assert!(!io.del_event(fd, Event::WRITE));

    b.write_all(b"ignored").unwrap();
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    io.stop();
}

#[test]
fn test_cancel_all() {
    common::init_tracing();
    let io = IoManager::new(1, false, "cancel_all").unwrap();
    let (a, b) = socket_pair();
    let fd = a.as_raw_fd();

    // fill the send buffer so WRITE stays pending
    let mut writer = &a;
    let chunk = [0u8; 4096];
    while writer.write(&chunk).is_ok() {}

    let (tx, rx) = crossbeam::channel::unbounded();
    let read_tx = tx.clone();
    io.add_event(fd, Event::READ, move |r| read_tx.send(r).unwrap())
        .unwrap();
    io.add_event(fd, Event::WRITE, move |r| tx.send(r).unwrap())
        .unwrap();
    assert_eq!(io.pending_events(), 2);

    assert!(io.cancel_all(fd));
    assert!(!io.cancel_all(fd));
    for _ in 0..2 {
        let r = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(r, Readiness::Cancelled);
    }
    assert_eq!(io.pending_events(), 0);

    drop(b);
    io.stop();
}

#[test]
fn test_double_registration_panics() {
    common::init_tracing();
    let io = IoManager::new(1, false, "double").unwrap();
    let (a, _b) = socket_pair();
    let fd = a.as_raw_fd();

    io.add_event(fd, Event::READ, |_| {}).unwrap();
    let second = panic::catch_unwind(AssertUnwindSafe(|| {
        io.add_event(fd, Event::READ, |_| {}).unwrap();
    }));
    assert!(second.is_err());

    assert!(io.del_event(fd, Event::READ));
    io.stop();
}

#[test]
fn test_register_invalid_fd() {
    common::init_tracing();
    let io = IoManager::new(1, false, "invalid_fd").unwrap();

    let err = io.add_event(-1, Event::READ, |_| {}).unwrap_err();
    assert!(matches!(err, Error::Register { fd: -1, .. }));

    // regular files cannot be polled: epoll_ctl fails with EPERM
    let file = tempfile::tempfile().unwrap();
    let err = io.add_event(file.as_raw_fd(), Event::READ, |_| {}).unwrap_err();
    match err {
        Error::Register { source, .. } => assert_eq!(source.raw_os_error(), Some(libc::EPERM)),
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(io.pending_events(), 0);

    io.stop();
}

#[test]
fn test_wait_event_in_fiber() {
    common::init_tracing();
    let io = IoManager::new(2, false, "wait_event").unwrap();
    let (mut a, mut b) = socket_pair();

    let (tx, rx) = crossbeam::channel::bounded(1);
    io.schedule(move || {
        let io = IoManager::current().unwrap();
        let readiness = io.wait_event(a.as_raw_fd(), Event::READ).unwrap();
        let mut buf = [0u8; 16];
        let n = a.read(&mut buf).unwrap();
        tx.send((readiness, buf[..n].to_vec())).unwrap();
    });

    assert!(common::wait_until(Duration::from_secs(5), || io.pending_events() == 1));
    b.write_all(b"hello").unwrap();

    let (readiness, data) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(readiness, Readiness::Ready);
    assert_eq!(data, b"hello");
    io.stop();
}

#[test]
fn test_wait_event_cancelled() {
    common::init_tracing();
    let io = IoManager::new(2, false, "wait_cancel").unwrap();
    let (a, _b) = socket_pair();
    let fd = a.as_raw_fd();

    let (tx, rx) = crossbeam::channel::bounded(1);
    io.schedule(move || {
        let io = IoManager::current().unwrap();
        let readiness = io.wait_event(a.as_raw_fd(), Event::READ).unwrap();
        tx.send(readiness).unwrap();
    });

    assert!(common::wait_until(Duration::from_secs(5), || io.pending_events() == 1));
    let start = Instant::now();
    assert!(io.cancel_event(fd, Event::READ));

    let readiness = rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(readiness, Readiness::Cancelled);
    assert!(start.elapsed() < Duration::from_secs(1));
    io.stop();
}

#[test]
fn test_wait_event_outside_fiber() {
    let io = IoManager::new(1, false, "outside").unwrap();
    let (a, _b) = socket_pair();

    let err = io.wait_event(a.as_raw_fd(), Event::READ).unwrap_err();
    assert!(matches!(err, Error::NotInFiber("wait_event")));
    let err = io.add_event_fiber(a.as_raw_fd(), Event::READ).unwrap_err();
    assert!(matches!(err, Error::NotInFiber(_)));
    assert_eq!(io.pending_events(), 0);
    io.stop();
}

#[test]
fn test_current_io_manager() {
    common::init_tracing();
    let io = IoManager::new(1, false, "current_io").unwrap();
    assert!(IoManager::current().is_none());

    let (tx, rx) = crossbeam::channel::bounded(1);
    io.schedule(move || {
        let name = IoManager::current().map(|io| io.name().to_string());
        tx.send(name).unwrap();
    });
    let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(name.as_deref(), Some("current_io"));

    // a plain scheduler is not an IoManager
    let plain = strand_runtime::Scheduler::new(1, false, "plain");
    plain.start().unwrap();
    let (tx, rx) = crossbeam::channel::bounded(1);
    plain.schedule(move || tx.send(IoManager::current().is_none()).unwrap());
    assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    plain.stop();

    io.stop();
}

#[test]
fn test_thousand_random_timers_fire_once() {
    common::init_tracing();
    let io = IoManager::new(2, false, "timers_1000").unwrap();

    let fired: Arc<Vec<AtomicUsize>> = Arc::new((0..1000).map(|_| AtomicUsize::new(0)).collect());
    let mut rng = rand::thread_rng();
    for i in 0..1000 {
        let delay = Duration::from_millis(rng.gen_range(0..=50));
        let fired = fired.clone();
        io.add_timer(
            delay,
            move || {
                fired[i].fetch_add(1, Ordering::SeqCst);
            },
            false,
        );
    }

    std::thread::sleep(Duration::from_millis(60));
    assert!(common::wait_until(Duration::from_millis(500), || {
        fired.iter().all(|count| count.load(Ordering::SeqCst) == 1)
    }));
    assert!(!io.has_timer());

    io.stop();
    assert!(fired.iter().all(|count| count.load(Ordering::SeqCst) == 1));
}

#[test]
fn test_timer_never_fires_early() {
    common::init_tracing();
    let io = IoManager::new(1, false, "not_early").unwrap();

    let (tx, rx) = crossbeam::channel::bounded(1);
    let start = Instant::now();
    io.add_timer(
        Duration::from_millis(100),
        move || {
            let _ = tx.send(start.elapsed());
        },
        false,
    );

    let elapsed = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(elapsed >= Duration::from_millis(100), "fired after {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(300), "fired after {:?}", elapsed);
    io.stop();
}

#[test]
fn test_earlier_timer_interrupts_long_wait() {
    common::init_tracing();
    let io = IoManager::new(1, false, "front").unwrap();

    // reactor blocks for ~10s on this one
    let far = io.add_timer(Duration::from_secs(10), || {}, false);
    std::thread::sleep(Duration::from_millis(20));

    let (tx, rx) = crossbeam::channel::bounded(1);
    let start = Instant::now();
    io.add_timer(
        Duration::from_millis(20),
        move || {
            let _ = tx.send(start.elapsed());
        },
        false,
    );

    let elapsed = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(elapsed < Duration::from_millis(500));
    assert!(far.cancel());
    io.stop();
}

#[test]
fn test_sleep_in_fiber() {
    common::init_tracing();
    let io = IoManager::new(1, false, "sleep").unwrap();

    let (tx, rx) = crossbeam::channel::bounded(1);
    io.schedule(move || {
        let io = IoManager::current().unwrap();
        let start = Instant::now();
        io.sleep(Duration::from_millis(30)).unwrap();
        tx.send(start.elapsed()).unwrap();
    });

    let elapsed = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(elapsed >= Duration::from_millis(30));
    io.stop();
}

#[test]
fn test_stop_waits_for_pending_timer() {
    common::init_tracing();
    let io = IoManager::new(2, false, "stop_timer").unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    io.add_timer(
        Duration::from_millis(30),
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
        },
        false,
    );

    io.stop();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    io.stop();
}

#[test]
fn test_use_caller_io_manager() {
    common::init_tracing();
    std::thread::spawn(|| {
        let io = IoManager::new(1, true, "io_caller").unwrap();
        let (a, mut b) = socket_pair();

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        io.add_event(a.as_raw_fd(), Event::READ, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        b.write_all(b"wake").unwrap();

        // the caller thread is the only worker: events fire inside stop()
        io.stop();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    })
    .join()
    .unwrap();
}
