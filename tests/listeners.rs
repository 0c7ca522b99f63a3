use std::cell::{Cell, RefCell};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::Duration;

use fiberhub::{Direction, Error, Hub, HubBuilder, Readiness, sleep};

fn socket_pair() -> (UnixStream, UnixStream) {
    let (a, b) = UnixStream::pair().unwrap();
    a.set_nonblocking(true).unwrap();
    b.set_nonblocking(true).unwrap();
    (a, b)
}

fn primaries(hub: &Hub) -> usize {
    hub.get_readers().len() + hub.get_writers().len()
}

#[test]
fn second_primary_is_refused_under_single_owner() {
    let hub = Hub::current();
    let (a, _b) = socket_pair();
    let fd = a.as_raw_fd();

    let installed = Rc::new(Cell::new(false));
    let first = hub.add(Direction::Read, fd, |_| {}).unwrap();

    let flag = installed.clone();
    let err = hub.add(Direction::Read, fd, move |_| flag.set(true)).unwrap_err();
    assert!(matches!(
        err,
        Error::ConflictingListener { direction: Direction::Read, fd: conflict, .. } if conflict == fd
    ));

    assert_eq!(hub.get_readers().len(), 1);
    assert_eq!(hub.listener_count(fd), 1);
    assert_eq!(hub.get_readers()[0].id, first.id());

    hub.remove(&first);
    assert!(!hub.is_registered(fd));
    assert!(!installed.get());
}

#[test]
fn secondary_is_promoted_when_primary_is_removed() {
    let hub = HubBuilder::new().single_owner(false).build().unwrap();
    let (a, _b) = socket_pair();
    let fd = a.as_raw_fd();

    let first = hub.add(Direction::Read, fd, |_| {}).unwrap();
    let second = hub.add(Direction::Read, fd, |_| {}).unwrap();
    assert_eq!(hub.get_readers().len(), 1);
    assert_eq!(hub.listener_count(fd), 2);

    hub.remove(&first);
    let readers = hub.get_readers();
    assert_eq!(readers.len(), 1);
    assert_eq!(readers[0].fd, fd);
    assert_eq!(readers[0].id, second.id());
    assert_eq!(hub.listener_count(fd), 1);

    hub.remove(&second);
    assert!(hub.get_readers().is_empty());
}

#[test]
fn primary_count_tracks_add_and_remove() {
    let hub = HubBuilder::new().single_owner(false).build().unwrap();
    let pairs: Vec<_> = (0..3).map(|_| socket_pair()).collect();

    let mut handles = Vec::new();
    for (a, b) in &pairs {
        handles.push(hub.add(Direction::Read, a.as_raw_fd(), |_| {}).unwrap());
        handles.push(hub.add(Direction::Write, a.as_raw_fd(), |_| {}).unwrap());
        handles.push(hub.add(Direction::Read, b.as_raw_fd(), |_| {}).unwrap());
        handles.push(hub.add(Direction::Read, b.as_raw_fd(), |_| {}).unwrap());
    }
    assert_eq!(primaries(&hub), 9);

    // Removing a primary promotes its secondary, so the count holds.
    hub.remove(&handles[2]);
    assert_eq!(primaries(&hub), 9);

    hub.remove(&handles[3]);
    hub.remove(&handles[3]);
    assert_eq!(primaries(&hub), 8);

    for handle in &handles {
        hub.remove(handle);
    }
    assert_eq!(primaries(&hub), 0);
}

#[test]
fn listener_fires_on_readiness() {
    let hub = Hub::current();
    let (a, mut b) = socket_pair();

    let seen = Rc::new(RefCell::new(Vec::new()));
    let log = seen.clone();
    let handle = hub
        .add(Direction::Read, a.as_raw_fd(), move |readiness| log.borrow_mut().push(readiness))
        .unwrap();

    sleep(Duration::from_millis(5)).unwrap();
    assert!(seen.borrow().is_empty());

    b.write_all(b"ping").unwrap();
    sleep(Duration::from_millis(5)).unwrap();
    assert!(!seen.borrow().is_empty());
    assert!(seen.borrow().iter().all(|r| *r == Readiness::Ready));

    hub.remove(&handle);
}

#[test]
fn remove_descriptor_notifies_every_listener_once() {
    let hub = HubBuilder::new().single_owner(false).install().unwrap();
    let (a, _b) = socket_pair();
    let fd = a.as_raw_fd();

    let closed = Rc::new(RefCell::new(Vec::new()));
    for id in 0..3 {
        let log = closed.clone();
        let direction = if id == 2 { Direction::Write } else { Direction::Read };
        hub.add(direction, fd, move |readiness| {
            log.borrow_mut().push((id, readiness));
            if id == 0 {
                panic!("listener failed");
            }
        })
        .unwrap();
    }

    let errors = Rc::new(Cell::new(0));
    let count = errors.clone();
    hub.set_exception_hook(move |_| count.set(count.get() + 1));

    hub.remove_descriptor(fd);

    let mut closed = closed.borrow().clone();
    closed.sort_by_key(|(id, _)| *id);
    assert_eq!(
        closed,
        vec![(0, Readiness::Closed), (1, Readiness::Closed), (2, Readiness::Closed)]
    );
    assert_eq!(errors.get(), 1);
    assert!(!hub.is_registered(fd));

    hub.remove_descriptor(fd);
}

#[test]
fn notify_close_defers_to_next_iteration() {
    let hub = Hub::current();
    let (a, _b) = socket_pair();
    let fd = a.as_raw_fd();

    let closed = Rc::new(Cell::new(false));
    let flag = closed.clone();
    hub.add(Direction::Read, fd, move |readiness| {
        assert_eq!(readiness, Readiness::Closed);
        flag.set(true);
    })
    .unwrap();

    hub.notify_close(fd);
    assert!(!hub.is_registered(fd));
    assert!(!closed.get());

    drop(a);
    sleep(Duration::ZERO).unwrap();
    assert!(closed.get());
}

#[test]
fn debug_listeners_report_registration_site() {
    let hub = Hub::current();
    hub.set_debug_listeners(true);
    let (a, _b) = socket_pair();
    let fd = a.as_raw_fd();

    let handle = hub.add(Direction::Write, fd, |_| {}).unwrap();
    assert!(hub.get_writers()[0].registered_at.is_some());

    match hub.add(Direction::Write, fd, |_| {}) {
        Err(Error::ConflictingListener { registered_at, .. }) => assert!(registered_at.is_some()),
        other => panic!("expected a conflict, got {:?}", other),
    }

    hub.remove(&handle);
}

#[cfg(any(target_os = "linux", target_os = "android"))]
#[test]
fn adding_invalid_descriptor_fails_on_epoll() {
    let hub = HubBuilder::new()
        .backend(fiberhub::BackendKind::Epoll)
        .build()
        .unwrap();

    let err = hub.add(Direction::Read, 987, |_| {}).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EBADF));
    assert!(!hub.is_registered(987));
}
