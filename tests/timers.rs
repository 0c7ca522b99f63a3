use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use fiberhub::{Error, Hub, TimerKind, sleep, spawn};

fn recorder() -> Rc<RefCell<Vec<u32>>> {
    Rc::new(RefCell::new(Vec::new()))
}

#[test]
fn zero_delay_timers_fire_in_call_order() {
    let hub = Hub::current();
    let log = recorder();

    for id in 1..=2 {
        let log = log.clone();
        hub.schedule_call_global(Duration::ZERO, move || log.borrow_mut().push(id));
    }

    sleep(Duration::ZERO).unwrap();
    assert_eq!(*log.borrow(), vec![1, 2]);
}

#[test]
fn shorter_delay_fires_first() {
    let hub = Hub::current();
    let log = recorder();

    let slow = log.clone();
    hub.schedule_call_global(Duration::from_millis(20), move || slow.borrow_mut().push(20));
    let fast = log.clone();
    hub.schedule_call_global(Duration::from_millis(10), move || fast.borrow_mut().push(10));

    sleep(Duration::from_millis(50)).unwrap();
    assert_eq!(*log.borrow(), vec![10, 20]);
}

#[test]
fn canceled_timer_never_fires() {
    let hub = Hub::current();
    let fired = Rc::new(Cell::new(0));

    let counter = fired.clone();
    let timer = hub.schedule_call_global(Duration::ZERO, move || counter.set(counter.get() + 1));
    assert!(timer.is_pending());
    timer.cancel();
    assert!(!timer.is_pending());

    for _ in 0..5 {
        sleep(Duration::from_millis(1)).unwrap();
    }
    assert_eq!(fired.get(), 0);
}

#[test]
fn double_cancel_is_harmless() {
    let hub = Hub::current();
    let log = recorder();

    let first = log.clone();
    let timer = hub.schedule_call_global(Duration::from_millis(1), move || first.borrow_mut().push(1));
    let second = log.clone();
    hub.schedule_call_global(Duration::from_millis(2), move || second.borrow_mut().push(2));

    timer.cancel();
    timer.cancel();

    sleep(Duration::from_millis(10)).unwrap();
    assert_eq!(*log.borrow(), vec![2]);
}

#[test]
fn pending_timers_are_listed_by_due_time() {
    let hub = Hub::current();

    let late = hub.schedule_call_global(Duration::from_secs(20), || {});
    let early = hub.schedule_call_local(Duration::from_secs(10), || {});

    let pending = hub.pending_timers();
    assert_eq!(hub.timer_count(), 2);
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].kind, TimerKind::Local);
    assert_eq!(Some(pending[0].due), early.due());
    assert_eq!(Some(pending[1].due), late.due());

    late.cancel();
    assert_eq!(hub.timer_count(), 1);
}

#[test]
fn panicking_timer_is_reported_and_loop_continues() {
    let hub = Hub::current();
    let errors = Rc::new(RefCell::new(Vec::new()));

    let seen = errors.clone();
    hub.set_exception_hook(move |err| seen.borrow_mut().push(err.to_string()));

    hub.schedule_call_global(Duration::ZERO, || panic!("timer exploded"));
    let after = Rc::new(Cell::new(false));
    let flag = after.clone();
    hub.schedule_call_global(Duration::ZERO, move || flag.set(true));

    sleep(Duration::from_millis(1)).unwrap();
    assert!(after.get());
    assert_eq!(errors.borrow().len(), 1);
    assert!(errors.borrow()[0].contains("timer exploded"));
}

#[test]
fn timer_exceptions_can_be_silenced() {
    let hub = Hub::current();
    let reported = Rc::new(Cell::new(0));

    let count = reported.clone();
    hub.set_exception_hook(move |_| count.set(count.get() + 1));
    hub.set_timer_exceptions(false);

    hub.schedule_call_global(Duration::ZERO, || panic!("quiet"));
    sleep(Duration::from_millis(1)).unwrap();

    assert_eq!(reported.get(), 0);
}

#[test]
fn local_timer_of_finished_fiber_is_skipped() {
    let fired = Rc::new(Cell::new(false));

    let flag = fired.clone();
    let fiber = spawn(move || {
        Hub::current().schedule_call_local(Duration::from_millis(5), move || flag.set(true));
        Ok(())
    });
    fiber.wait().unwrap();

    sleep(Duration::from_millis(20)).unwrap();
    assert!(!fired.get());
}

#[test]
fn local_timer_of_live_fiber_fires() {
    let fired = Rc::new(Cell::new(false));

    let flag = fired.clone();
    let fiber = spawn(move || {
        Hub::current().schedule_call_local(Duration::from_millis(5), move || flag.set(true));
        sleep(Duration::from_millis(20))
    });

    fiber.wait().unwrap();
    assert!(fired.get());
}

#[test]
fn switching_from_a_timer_is_refused() {
    let hub = Hub::current();
    let outcome = Rc::new(RefCell::new(None));

    let slot = outcome.clone();
    hub.schedule_call_global(Duration::ZERO, move || {
        *slot.borrow_mut() = Some(Hub::current().switch());
    });

    sleep(Duration::from_millis(1)).unwrap();
    assert!(matches!(*outcome.borrow(), Some(Err(Error::BlockingInHub))));
}

#[test]
fn unbounded_delay_stays_pending() {
    let hub = Hub::current();
    let fired = Rc::new(Cell::new(false));

    let flag = fired.clone();
    let timer = hub.schedule_call_global(Duration::MAX, move || flag.set(true));
    assert!(timer.is_pending());

    sleep(Duration::from_millis(1)).unwrap();
    assert!(!fired.get());

    timer.cancel();
    assert!(!timer.is_pending());
}
