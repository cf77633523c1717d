use std::{
    any::Any,
    cell::{Cell, RefCell},
    rc::Rc,
    sync::{Arc, Mutex},
    time::Duration,
};

use evtimer::{EventLoop, LoopErrorKind, Timer, TimerError};

fn counter(count: &Rc<Cell<usize>>) -> impl FnMut(&Timer, Option<Rc<dyn Any>>) + 'static {
    let count = Rc::clone(count);
    move |_, _| count.set(count.get() + 1)
}

#[test]
fn zero_timeout_one_shot_fires_once_then_idle() {
    let lp = EventLoop::new();
    let timer = Timer::new(&lp);
    let count = Rc::new(Cell::new(0));

    timer.start(counter(&count), Duration::ZERO, Duration::ZERO, None).unwrap();
    assert!(timer.is_active());

    let more = lp.run_once().unwrap();

    assert_eq!(count.get(), 1);
    assert!(!more);
    assert!(!timer.is_active());
    assert!(!timer.is_closed());
    // the native resource is retained for re-arming
    assert_eq!(lp.alive_timers(), 1);
}

#[test]
fn stop_before_due_never_fires() {
    let lp = EventLoop::new();
    let timer = Timer::new(&lp);
    let count = Rc::new(Cell::new(0));

    timer
        .start(counter(&count), Duration::from_millis(10), Duration::from_millis(10), None)
        .unwrap();
    timer.stop().unwrap();

    // run the loop past the original due time
    std::thread::sleep(Duration::from_millis(15));
    assert!(!lp.run_once().unwrap());

    assert_eq!(count.get(), 0);
    assert!(!timer.is_active());
}

#[test]
fn repeating_fires_until_closed_from_callback() {
    let lp = EventLoop::new();
    let timer = Timer::new(&lp);
    let count = Rc::new(Cell::new(0));

    let c = Rc::clone(&count);
    timer
        .start(
            move |t, _| {
                c.set(c.get() + 1);
                if c.get() == 5 {
                    t.close();
                }
            },
            Duration::ZERO,
            Duration::from_millis(1),
            None,
        )
        .unwrap();

    lp.run().unwrap();

    assert_eq!(count.get(), 5);
    assert!(timer.is_closed());
    assert_eq!(lp.alive_timers(), 0);
}

#[test]
fn close_is_idempotent_and_releases_once() {
    let lp = EventLoop::new();
    let timer = Timer::new(&lp);
    let count = Rc::new(Cell::new(0));

    timer.start(counter(&count), Duration::ZERO, Duration::ZERO, None).unwrap();
    timer.close();
    timer.close();
    assert!(timer.is_closed());
    assert_eq!(lp.alive_timers(), 1);

    lp.run().unwrap();

    // the firing was already due, but close strictly precedes it
    assert_eq!(count.get(), 0);
    assert_eq!(lp.alive_timers(), 0);

    timer.close();
    assert_eq!(lp.alive_timers(), 0);
}

#[test]
fn close_twice_from_callback() {
    let lp = EventLoop::new();
    let timer = Timer::new(&lp);
    let count = Rc::new(Cell::new(0));

    let c = Rc::clone(&count);
    timer
        .start(
            move |t, _| {
                c.set(c.get() + 1);
                t.close();
                t.close();
            },
            Duration::ZERO,
            Duration::from_millis(1),
            None,
        )
        .unwrap();

    lp.run().unwrap();

    assert_eq!(count.get(), 1);
    assert!(timer.is_closed());
    assert_eq!(lp.alive_timers(), 0);
}

#[test]
fn stop_from_callback_keeps_resource() {
    let lp = EventLoop::new();
    let timer = Timer::new(&lp);
    let count = Rc::new(Cell::new(0));

    let c = Rc::clone(&count);
    timer
        .start(
            move |t, _| {
                c.set(c.get() + 1);
                if c.get() == 3 {
                    t.stop().unwrap();
                }
            },
            Duration::ZERO,
            Duration::from_millis(1),
            None,
        )
        .unwrap();

    lp.run().unwrap();

    assert_eq!(count.get(), 3);
    assert!(!timer.is_active());
    assert!(!timer.is_closed());
    assert_eq!(lp.alive_timers(), 1);

    timer.close();
    lp.run().unwrap();
    assert_eq!(lp.alive_timers(), 0);
}

fn rearming(t: &Timer, data: Option<Rc<dyn Any>>) {
    let count = data.unwrap().downcast::<Cell<usize>>().ok().unwrap();
    count.set(count.get() + 1);
    if count.get() < 3 {
        t.start(rearming, Duration::ZERO, Duration::ZERO, Some(count as Rc<dyn Any>)).unwrap();
    }
}

#[test]
fn start_from_callback_rearms_one_shot() {
    let lp = EventLoop::new();
    let timer = Timer::new(&lp);
    let count = Rc::new(Cell::new(0_usize));

    timer
        .start(rearming, Duration::ZERO, Duration::ZERO, Some(Rc::clone(&count) as Rc<dyn Any>))
        .unwrap();
    lp.run().unwrap();

    assert_eq!(count.get(), 3);
    assert!(!timer.is_active());
    assert_eq!(lp.alive_timers(), 1);
}

#[test]
fn start_while_armed_keeps_original_callback() {
    let lp = EventLoop::new();
    let timer = Timer::new(&lp);
    let original = Rc::new(Cell::new(0));
    let replacement = Rc::new(Cell::new(0));

    timer
        .start(counter(&original), Duration::from_millis(1), Duration::ZERO, None)
        .unwrap();
    let r = timer.start(counter(&replacement), Duration::ZERO, Duration::ZERO, None);
    assert_eq!(r, Err(TimerError::AlreadyActive));
    assert!(timer.is_active());

    lp.run().unwrap();

    assert_eq!(original.get(), 1);
    assert_eq!(replacement.get(), 0);
}

#[test]
fn stop_then_restart_reuses_resource() {
    let lp = EventLoop::new();
    let timer = Timer::new(&lp);
    let first = Rc::new(Cell::new(0));
    let second = Rc::new(Cell::new(0));

    timer.start(counter(&first), Duration::from_millis(50), Duration::ZERO, None).unwrap();
    timer.stop().unwrap();
    assert_eq!(lp.alive_timers(), 1);

    timer.start(counter(&second), Duration::ZERO, Duration::ZERO, None).unwrap();
    lp.run().unwrap();

    assert_eq!(first.get(), 0);
    assert_eq!(second.get(), 1);
    assert_eq!(lp.alive_timers(), 1);
}

#[test]
fn again_rearms_with_repeat_as_timeout() {
    let lp = EventLoop::new();
    let timer = Timer::new(&lp);
    let count = Rc::new(Cell::new(0));

    let c = Rc::clone(&count);
    timer
        .start(
            move |t, _| {
                c.set(c.get() + 1);
                t.close();
            },
            Duration::from_millis(50),
            Duration::from_millis(1),
            None,
        )
        .unwrap();
    timer.stop().unwrap();

    timer.again().unwrap();
    assert!(timer.is_active());

    lp.run().unwrap();
    assert_eq!(count.get(), 1);
}

#[test]
fn again_with_zero_repeat_is_noop() {
    let lp = EventLoop::new();
    let timer = Timer::new(&lp);
    let count = Rc::new(Cell::new(0));

    timer.start(counter(&count), Duration::from_millis(50), Duration::ZERO, None).unwrap();
    timer.stop().unwrap();

    timer.again().unwrap();
    assert!(!timer.is_active());
    assert!(!lp.run_once().unwrap());
    assert_eq!(count.get(), 0);
}

#[test]
fn repeat_roundtrip_truncates_to_millis() {
    let lp = EventLoop::new();
    let timer = Timer::new(&lp);

    timer
        .start(|_, _| {}, Duration::from_millis(10), Duration::from_micros(2500), None)
        .unwrap();
    assert_eq!(timer.repeat().unwrap(), Duration::from_millis(2));

    timer.set_repeat(Duration::from_millis(25)).unwrap();
    assert_eq!(timer.repeat().unwrap(), Duration::from_millis(25));

    timer.set_repeat(Duration::from_micros(900)).unwrap();
    assert_eq!(timer.repeat().unwrap(), Duration::ZERO);

    timer.close();
    assert_eq!(timer.repeat(), Err(TimerError::Closed));
    assert_eq!(timer.set_repeat(Duration::ZERO), Err(TimerError::Closed));
}

#[test]
fn set_repeat_from_callback() {
    let lp = EventLoop::new();
    let timer = Timer::new(&lp);
    let count = Rc::new(Cell::new(0));

    let c = Rc::clone(&count);
    timer
        .start(
            move |t, _| {
                c.set(c.get() + 1);
                if c.get() == 1 {
                    t.set_repeat(Duration::from_millis(2)).unwrap();
                    assert_eq!(t.repeat().unwrap(), Duration::from_millis(2));
                }
                if c.get() == 3 {
                    t.close();
                }
            },
            Duration::ZERO,
            Duration::from_millis(1),
            None,
        )
        .unwrap();

    lp.run().unwrap();
    assert_eq!(count.get(), 3);
}

#[test]
fn same_iteration_firings_are_delivered_in_due_order() {
    let lp = EventLoop::new();
    let order = Rc::new(RefCell::new(Vec::new()));

    let a = Timer::new(&lp);
    let o = Rc::clone(&order);
    a.start(move |_, _| o.borrow_mut().push("a"), Duration::ZERO, Duration::ZERO, None)
        .unwrap();

    let b = Timer::new(&lp);
    let o = Rc::clone(&order);
    b.start(move |_, _| o.borrow_mut().push("b"), Duration::ZERO, Duration::ZERO, None)
        .unwrap();

    lp.run_once().unwrap();
    assert_eq!(*order.borrow(), vec!["a", "b"]);
}

#[test]
fn firings_across_iterations_follow_due_instants() {
    let lp = EventLoop::new();
    let order = Rc::new(RefCell::new(Vec::new()));

    let late = Timer::new(&lp);
    let o = Rc::clone(&order);
    late.start(move |_, _| o.borrow_mut().push("late"), Duration::from_millis(5), Duration::ZERO, None)
        .unwrap();

    let early = Timer::new(&lp);
    let o = Rc::clone(&order);
    early
        .start(move |_, _| o.borrow_mut().push("early"), Duration::from_millis(1), Duration::ZERO, None)
        .unwrap();

    lp.run().unwrap();
    assert_eq!(*order.borrow(), vec!["early", "late"]);
}

#[test]
fn data_is_passed_to_each_invocation() {
    let lp = EventLoop::new();
    let timer = Timer::new(&lp);
    let got = Rc::new(Cell::new(0_u32));

    let g = Rc::clone(&got);
    timer
        .start(
            move |_, data| g.set(*data.unwrap().downcast_ref::<u32>().unwrap()),
            Duration::ZERO,
            Duration::ZERO,
            Some(Rc::new(7_u32)),
        )
        .unwrap();

    lp.run().unwrap();
    assert_eq!(got.get(), 7);
    assert_eq!(*timer.data().unwrap().downcast_ref::<u32>().unwrap(), 7);
}

#[test]
fn resource_limit_is_enforced_until_close_completes() {
    let lp = EventLoop::with_capacity(1);
    let first = Timer::new(&lp);
    let second = Timer::new(&lp);

    first.start(|_, _| {}, Duration::from_millis(50), Duration::ZERO, None).unwrap();
    let r = second.start(|_, _| {}, Duration::ZERO, Duration::ZERO, None);
    assert_eq!(r, Err(TimerError::ResourceExhausted));

    first.close();
    lp.run().unwrap();
    assert_eq!(lp.alive_timers(), 0);

    second.start(|_, _| {}, Duration::from_millis(50), Duration::ZERO, None).unwrap();
    second.stop().unwrap();
}

#[test]
fn running_the_loop_from_a_callback_is_busy() {
    let lp = EventLoop::new();
    let timer = Timer::new(&lp);
    let seen = Rc::new(Cell::new(None));

    let inner = lp.clone();
    let s = Rc::clone(&seen);
    timer
        .start(
            move |_, _| s.set(inner.run_once().err().map(|e| e.kind())),
            Duration::ZERO,
            Duration::ZERO,
            None,
        )
        .unwrap();

    lp.run().unwrap();
    assert_eq!(seen.get(), Some(LoopErrorKind::Busy));
}

#[test]
fn callback_panic_is_contained_and_reported() {
    let captured = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&captured);
    evtimer::set_unraisable_hook(move |e| sink.lock().unwrap().push(e.message().to_owned()));

    let lp = EventLoop::new();
    let bad = Timer::new(&lp);
    bad.start(|_, _| panic!("boom-contained-93"), Duration::ZERO, Duration::ZERO, None)
        .unwrap();

    let good = Timer::new(&lp);
    let count = Rc::new(Cell::new(0));
    good.start(counter(&count), Duration::ZERO, Duration::ZERO, None).unwrap();

    lp.run().unwrap();

    // the panicking callback did not abort dispatch of the other timer
    assert_eq!(count.get(), 1);
    assert!(captured.lock().unwrap().iter().any(|m| m.contains("boom-contained-93")));

    evtimer::take_unraisable_hook();
}
