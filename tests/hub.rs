use std::cell::{Cell, RefCell};
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

use fiberhub::{
    Backend, BackendKind, Error, Hub, HubBuilder, Interest, PollEvent, sleep, spawn,
};

#[test]
fn wake_handle_aborts_from_another_thread() {
    let hub = Hub::current();
    let handle = hub.wake_handle();

    let aborter = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        handle.abort();
    });

    let start = Instant::now();
    hub.run().unwrap();
    assert!(start.elapsed() < Duration::from_secs(5));
    assert!(!hub.is_running());

    aborter.join().unwrap();
}

#[test]
fn abort_from_a_fiber_stops_run() {
    let hub = Hub::current();
    let finished = Rc::new(Cell::new(false));

    let flag = finished.clone();
    spawn(move || {
        sleep(Duration::from_millis(5))?;
        flag.set(true);
        Hub::current().abort(false)
    });

    hub.run().unwrap();
    assert!(finished.get());
    assert!(!hub.is_running());
}

#[test]
fn waiting_abort_from_the_hub_is_refused() {
    let hub = Hub::current();
    let outcome = Rc::new(RefCell::new(None));

    let slot = outcome.clone();
    hub.schedule_call_global(Duration::ZERO, move || {
        *slot.borrow_mut() = Some(Hub::current().abort(true));
    });
    sleep(Duration::from_millis(1)).unwrap();

    assert!(matches!(*outcome.borrow(), Some(Err(Error::AbortFromHub))));
}

#[test]
fn abort_and_wait_from_root_stops_the_loop() {
    let hub = Hub::current();
    hub.schedule_call_global(Duration::from_secs(30), || {});

    sleep(Duration::ZERO).unwrap();
    assert!(hub.is_running());

    hub.abort(true).unwrap();
    assert!(!hub.is_running());
    // Leaving the loop drops every timer.
    assert_eq!(hub.timer_count(), 0);
}

#[test]
fn loop_restarts_after_abort() {
    let hub = Hub::current();
    sleep(Duration::ZERO).unwrap();
    hub.abort(true).unwrap();

    let fiber = spawn(|| Ok("again"));
    assert_eq!(fiber.wait().unwrap(), "again");
}

#[test]
fn blocking_callbacks_are_reported() {
    let hub = Hub::current();
    let reports = Rc::new(RefCell::new(Vec::new()));

    let seen = reports.clone();
    hub.set_exception_hook(move |err| seen.borrow_mut().push(err.clone()));
    hub.set_debug_blocking(Some(Duration::from_millis(5)));

    hub.schedule_call_global(Duration::ZERO, || thread::sleep(Duration::from_millis(30)));
    sleep(Duration::from_millis(1)).unwrap();

    let reports = reports.borrow();
    assert_eq!(reports.len(), 1);
    assert!(matches!(reports[0], Error::Blocked(elapsed) if elapsed >= Duration::from_millis(30)));
}

/// Backend that can be told to fail.
struct Flaky {
    fail: Rc<Cell<bool>>,
}

impl Backend for Flaky {
    fn kind(&self) -> BackendKind {
        BackendKind::Poll
    }

    fn register(&mut self, _fd: RawFd, _interest: Interest) -> io::Result<()> {
        Ok(())
    }

    fn deregister(&mut self, _fd: RawFd) -> io::Result<()> {
        Ok(())
    }

    fn wait(&mut self, timeout: Duration, _events: &mut Vec<PollEvent>) -> io::Result<()> {
        if self.fail.get() {
            return Err(io::Error::other("backend broke"));
        }
        thread::sleep(timeout.min(Duration::from_millis(1)));
        Ok(())
    }
}

#[test]
fn hub_fiber_failure_reaches_root_and_hub_recovers() {
    let fail = Rc::new(Cell::new(true));
    let hub = HubBuilder::new()
        .with_backend(Box::new(Flaky { fail: fail.clone() }))
        .build()
        .unwrap();

    hub.enter(|| {
        match sleep(Duration::from_millis(5)) {
            Err(Error::HubExited(inner)) => assert_eq!(inner.to_string(), "backend broke"),
            other => panic!("expected the hub to exit, got {:?}", other),
        }
        assert!(!hub.is_running());

        fail.set(false);
        sleep(Duration::from_millis(5)).unwrap();
        assert!(hub.is_running());
    });
}

#[test]
fn enter_installs_the_hub_for_free_functions() {
    let hub = HubBuilder::new()
        .backend(BackendKind::Poll)
        .build()
        .unwrap();
    let outer = Hub::current();

    hub.enter(|| {
        assert_eq!(Hub::current().backend_kind(), BackendKind::Poll);
        let fiber = spawn(|| Ok(Hub::current().backend_kind()));
        assert_eq!(fiber.wait().unwrap(), BackendKind::Poll);
    });

    assert_eq!(Hub::current().backend_kind(), outer.backend_kind());
}

#[test]
fn built_hub_hosts_blocking_fibers_without_enter() {
    let hub = HubBuilder::new().build().unwrap();
    let seen = Rc::new(RefCell::new(None));

    let owner = hub.clone();
    let slot = seen.clone();
    hub.spawn(move || {
        sleep(Duration::from_millis(1))?;
        *slot.borrow_mut() = Some(Hub::current() == owner);
        Hub::current().abort(false)
    });

    let start = Instant::now();
    hub.run().unwrap();
    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(*seen.borrow(), Some(true));

    // Waiting from the root drives the fiber's own hub.
    let fiber = hub.spawn(|| {
        sleep(Duration::from_millis(1))?;
        Ok(5)
    });
    assert_eq!(fiber.wait().unwrap(), 5);
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn fiber_suspends_and_resumes_repeatedly() {
    let fiber = spawn(|| {
        let mut rounds = 0;
        for _ in 0..10 {
            sleep(Duration::from_millis(1))?;
            rounds += 1;
        }
        Ok(rounds)
    });

    assert_eq!(fiber.wait().unwrap(), 10);
}
