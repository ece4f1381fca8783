use objmon::{
    threading::{current_small_id, InterruptSource}, Collaborators, InterruptRegistry, LockOwner, MonitorConfig,
    MonitorOps, ObjectMonitor, ObjectRef, Timeout, WaitOutcome,
};
use std::{
    sync::{mpsc, Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(1));
    }
}

fn waiting(monitor: &ObjectMonitor) -> usize {
    monitor
        .dump_locks(true)
        .records
        .iter()
        .map(|r| r.waiting_threads.len())
        .sum()
}

fn interruptible_monitor() -> (Arc<InterruptRegistry>, Arc<ObjectMonitor>) {
    let registry = Arc::new(InterruptRegistry::new());
    let monitor = ObjectMonitor::with_collaborators(
        MonitorConfig::default(),
        Collaborators::with_interrupts(registry.clone()),
    );
    (registry, Arc::new(monitor))
}

#[test]
fn test_scenario_wait_then_pulse() {
    let monitor = Arc::new(ObjectMonitor::default());
    let x = ObjectRef::new_object("X");
    let (ready_tx, ready_rx) = mpsc::channel();

    let t1 = {
        let (monitor, x) = (monitor.clone(), x.clone());
        thread::spawn(move || {
            monitor.enter(&x).unwrap();
            ready_tx.send(()).unwrap();
            let outcome = monitor.wait(&x, Timeout::Infinite, false).unwrap();
            assert!(monitor.is_entered_by_current(&x).unwrap());
            monitor.exit(&x).unwrap();
            outcome
        })
    };

    ready_rx.recv().unwrap();
    monitor.enter(&x).unwrap();
    monitor.pulse(&x).unwrap();
    monitor.exit(&x).unwrap();

    assert_eq!(t1.join().unwrap(), WaitOutcome::Pulsed);
    assert_eq!(monitor.metrics().pulses_delivered, 1);
    assert!(!monitor.is_entered_by_anyone(&x).unwrap());
}

#[test]
fn test_pulse_all_wakes_every_waiter() {
    for n in [1, 4, 16] {
        let monitor = Arc::new(ObjectMonitor::default());
        let obj = ObjectRef::new_object("Cond");

        let waiters: Vec<_> = (0..n)
            .map(|_| {
                let (monitor, obj) = (monitor.clone(), obj.clone());
                thread::spawn(move || {
                    monitor.enter(&obj).unwrap();
                    let outcome = monitor.wait(&obj, Timeout::Infinite, false).unwrap();
                    monitor.exit(&obj).unwrap();
                    outcome
                })
            })
            .collect();

        eventually("all threads to wait", || waiting(&monitor) == n);
        monitor.enter(&obj).unwrap();
        monitor.pulse_all(&obj).unwrap();
        monitor.exit(&obj).unwrap();

        for waiter in waiters {
            assert_eq!(waiter.join().unwrap(), WaitOutcome::Pulsed);
        }
        assert_eq!(monitor.metrics().pulses_delivered, n as u64);
        assert_eq!(waiting(&monitor), 0);
    }
}

#[test]
fn test_pulse_wakes_longest_waiting_first() {
    let monitor = Arc::new(ObjectMonitor::default());
    let obj = ObjectRef::new_object("Queue");
    let woken = Arc::new(Mutex::new(Vec::new()));

    let mut waiters = Vec::new();
    for i in 0..3 {
        let (m, o, w) = (monitor.clone(), obj.clone(), woken.clone());
        waiters.push(thread::spawn(move || {
            m.enter(&o).unwrap();
            let outcome = m.wait(&o, Timeout::Infinite, false).unwrap();
            w.lock().unwrap().push(i);
            m.exit(&o).unwrap();
            outcome
        }));
        eventually("the waiter to queue", || waiting(&monitor) == i + 1);
    }

    for expected_len in 1..=3 {
        monitor.enter(&obj).unwrap();
        monitor.pulse(&obj).unwrap();
        monitor.exit(&obj).unwrap();
        eventually("the pulsed waiter to run", || {
            woken.lock().unwrap().len() == expected_len
        });
    }

    for waiter in waiters {
        assert_eq!(waiter.join().unwrap(), WaitOutcome::Pulsed);
    }
    assert_eq!(*woken.lock().unwrap(), vec![0, 1, 2]);
}

#[test]
fn test_timed_wait_restores_nesting() {
    let monitor = ObjectMonitor::default();
    let obj = ObjectRef::new_object("Foo");
    monitor.enter(&obj).unwrap();
    monitor.enter(&obj).unwrap();

    let started = Instant::now();
    assert_eq!(
        monitor.wait(&obj, Timeout::Millis(30), false).unwrap(),
        WaitOutcome::TimedOut
    );
    assert!(started.elapsed() >= Duration::from_millis(25));
    assert_eq!(
        monitor.lock_owner(&obj).unwrap(),
        Some(LockOwner {
            thread: current_small_id(),
            nest: 2
        })
    );
    assert_eq!(waiting(&monitor), 0);
    assert_eq!(monitor.metrics().wait_timeouts, 1);

    monitor.exit(&obj).unwrap();
    monitor.exit(&obj).unwrap();
    assert!(!monitor.is_entered_by_anyone(&obj).unwrap());
}

#[test]
fn test_pulse_without_waiters_is_harmless() {
    let monitor = ObjectMonitor::default();
    let obj = ObjectRef::new_object("Foo");
    monitor.enter(&obj).unwrap();
    monitor.wait(&obj, Timeout::ZERO, false).unwrap();
    monitor.pulse(&obj).unwrap();
    monitor.pulse_all(&obj).unwrap();
    monitor.exit(&obj).unwrap();
    assert_eq!(monitor.metrics().pulses_delivered, 0);
}

#[test]
fn test_interrupted_wait_is_cancelled_cleanly() {
    let (registry, monitor) = interruptible_monitor();
    let obj = ObjectRef::new_object("Foo");
    let (id_tx, id_rx) = mpsc::channel();

    let waiter = {
        let (monitor, obj) = (monitor.clone(), obj.clone());
        thread::spawn(move || {
            id_tx.send(current_small_id()).unwrap();
            monitor.enter(&obj).unwrap();
            monitor.enter(&obj).unwrap();
            let outcome = monitor.wait(&obj, Timeout::Infinite, true).unwrap();
            let owner = monitor.lock_owner(&obj).unwrap();
            monitor.exit(&obj).unwrap();
            monitor.exit(&obj).unwrap();
            (outcome, owner)
        })
    };
    let waiter_id = id_rx.recv().unwrap();

    eventually("the thread to wait", || waiting(&monitor) == 1);
    registry.interrupt(waiter_id);

    let (outcome, owner) = waiter.join().unwrap();
    assert_eq!(outcome, WaitOutcome::Cancelled);
    assert_eq!(
        owner,
        Some(LockOwner {
            thread: waiter_id,
            nest: 2
        })
    );
    assert!(!registry.is_interrupt_pending(waiter_id));

    // Nothing left behind for a later pulse to find.
    monitor.enter(&obj).unwrap();
    monitor.pulse(&obj).unwrap();
    monitor.exit(&obj).unwrap();
    let snapshot = monitor.metrics();
    assert_eq!(snapshot.pulses_delivered, 0);
    assert_eq!(snapshot.wait_cancellations, 1);
    assert_eq!(monitor.dump_locks(true).records[0].entry_waiters, 0);
}

#[test]
fn test_pending_interrupt_cancels_wait_immediately() {
    let (registry, monitor) = interruptible_monitor();
    let obj = ObjectRef::new_object("Foo");
    let me = current_small_id();

    assert!(!registry.interrupt(me));
    monitor.enter(&obj).unwrap();
    let started = Instant::now();
    assert_eq!(
        monitor.wait(&obj, Timeout::Infinite, true).unwrap(),
        WaitOutcome::Cancelled
    );
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(monitor.is_entered_by_current(&obj).unwrap());
    assert!(!registry.is_interrupt_pending(me));
    monitor.exit(&obj).unwrap();
}

#[test]
fn test_uninterruptible_wait_ignores_interrupt() {
    let (registry, monitor) = interruptible_monitor();
    let obj = ObjectRef::new_object("Foo");
    let (id_tx, id_rx) = mpsc::channel();

    let waiter = {
        let (monitor, obj) = (monitor.clone(), obj.clone());
        thread::spawn(move || {
            id_tx.send(current_small_id()).unwrap();
            monitor.enter(&obj).unwrap();
            let outcome = monitor.wait(&obj, Timeout::Millis(100), false).unwrap();
            monitor.exit(&obj).unwrap();
            outcome
        })
    };
    let waiter_id = id_rx.recv().unwrap();

    eventually("the thread to wait", || waiting(&monitor) == 1);
    assert!(!registry.interrupt(waiter_id));
    assert_eq!(waiter.join().unwrap(), WaitOutcome::TimedOut);
    assert!(registry.is_interrupt_pending(waiter_id));
}
