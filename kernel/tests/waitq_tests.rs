//! Wait queue tests: blocking, banked wakeups, timeouts and interruption.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use common::{Harness, assert_pending, recv};
use nos_kcore::{SleepResult, SynchFlags, WaitQueue, WakeMode};

fn sleeper(
    h: &Harness,
    wq: &Arc<WaitQueue>,
    timeout: Option<Duration>,
    flags: SynchFlags,
) -> (Arc<nos_kcore::Thread>, std::sync::mpsc::Receiver<SleepResult>) {
    let wq = wq.clone();
    let (thread, rx) = h.start("sleeper", move |k| wq.sleep(k, timeout, flags));
    h.wait_sleeping(&thread);
    (thread, rx)
}

#[test]
fn wakeup_releases_blocked_sleeper() {
    let h = Harness::new(1);
    let wq = Arc::new(WaitQueue::new());
    let (_, rx) = sleeper(&h, &wq, None, SynchFlags::empty());

    assert_eq!(wq.sleepers(), 1);
    assert_pending(&rx);
    assert_eq!(wq.wakeup(&h.kernel, WakeMode::First), 1);

    assert_eq!(recv(&rx), SleepResult::OkBlocked);
    assert_eq!(wq.sleepers(), 0);
    assert_eq!(wq.missed_wakeups(), 0);
}

#[test]
fn wakeup_without_sleeper_is_banked() {
    let h = Harness::new(1);
    let wq = Arc::new(WaitQueue::new());

    assert_eq!(wq.wakeup(&h.kernel, WakeMode::First), 0);
    assert_eq!(wq.missed_wakeups(), 1);

    let q = wq.clone();
    let rc = h.run(move |k| q.sleep(k, None, SynchFlags::empty()));
    assert_eq!(rc, SleepResult::OkAtomic);
    assert_eq!(wq.missed_wakeups(), 0);
}

#[test]
fn non_blocking_sleep_needs_a_banked_wakeup() {
    let h = Harness::new(1);
    let wq = WaitQueue::new();

    assert_eq!(wq.sleep(&h.kernel, None, SynchFlags::NON_BLOCKING), SleepResult::WouldBlock);
    wq.wakeup(&h.kernel, WakeMode::First);
    assert_eq!(wq.sleep(&h.kernel, None, SynchFlags::NON_BLOCKING), SleepResult::OkAtomic);
    assert_eq!(wq.sleep(&h.kernel, None, SynchFlags::NON_BLOCKING), SleepResult::WouldBlock);
}

#[test]
fn sleep_times_out_on_the_hundredth_tick() {
    let h = Harness::new(1);
    let wq = Arc::new(WaitQueue::new());
    let (_, rx) = sleeper(&h, &wq, Some(Duration::from_millis(100)), SynchFlags::empty());
    assert_eq!(h.kernel.cpu(0).unwrap().armed_timeouts(), 1);

    h.ticks(99);
    assert_pending(&rx);
    assert_eq!(wq.sleepers(), 1);

    h.tick();
    assert_eq!(recv(&rx), SleepResult::Timeout);
    assert_eq!(wq.sleepers(), 0);
    assert_eq!(h.kernel.cpu(0).unwrap().armed_timeouts(), 0);
}

#[test]
fn wakeup_cancels_pending_timeout() {
    let h = Harness::new(1);
    let wq = Arc::new(WaitQueue::new());
    let (tx, rx) = std::sync::mpsc::channel();
    let q = wq.clone();
    let (thread, _) = h.start("sleeper", move |k| {
        let _ = tx.send(q.sleep(k, Some(Duration::from_millis(50)), SynchFlags::empty()));
        let _ = tx.send(q.sleep(k, None, SynchFlags::empty()));
    });
    h.wait_sleeping(&thread);

    h.ticks(10);
    wq.wakeup(&h.kernel, WakeMode::First);
    assert_eq!(recv(&rx), SleepResult::OkBlocked);

    // The second sleep is not cut short by the first one's timeout.
    h.wait_sleeping(&thread);
    assert_eq!(h.kernel.cpu(0).unwrap().armed_timeouts(), 0);
    h.ticks(100);
    assert_pending(&rx);
    wq.wakeup(&h.kernel, WakeMode::First);
    assert_eq!(recv(&rx), SleepResult::OkBlocked);
}

#[test]
fn sleepers_are_woken_in_arrival_order() {
    let h = Harness::new(1);
    let wq = Arc::new(WaitQueue::new());
    let (_, first) = sleeper(&h, &wq, None, SynchFlags::empty());
    let (_, second) = sleeper(&h, &wq, None, SynchFlags::empty());
    let (_, third) = sleeper(&h, &wq, None, SynchFlags::empty());

    wq.wakeup(&h.kernel, WakeMode::First);
    assert_eq!(recv(&first), SleepResult::OkBlocked);
    assert_pending(&second);
    assert_pending(&third);

    wq.wakeup(&h.kernel, WakeMode::First);
    assert_eq!(recv(&second), SleepResult::OkBlocked);
    assert_pending(&third);

    wq.wakeup(&h.kernel, WakeMode::First);
    assert_eq!(recv(&third), SleepResult::OkBlocked);
}

#[test]
fn wake_all_releases_everyone_and_forgets_banked_wakeups() {
    let h = Harness::new(2);
    let wq = Arc::new(WaitQueue::new());
    let sleepers: Vec<_> = (0..3).map(|_| sleeper(&h, &wq, None, SynchFlags::empty())).collect();

    assert_eq!(wq.wakeup(&h.kernel, WakeMode::All), 3);
    for (_, rx) in &sleepers {
        assert_eq!(recv(rx), SleepResult::OkBlocked);
    }

    wq.wakeup(&h.kernel, WakeMode::First);
    wq.wakeup(&h.kernel, WakeMode::First);
    assert_eq!(wq.missed_wakeups(), 2);
    assert_eq!(wq.wakeup(&h.kernel, WakeMode::All), 0);
    assert_eq!(wq.missed_wakeups(), 0);
}

#[test]
fn interrupt_only_affects_interruptible_sleeps() {
    let h = Harness::new(1);
    let wq = Arc::new(WaitQueue::new());

    let (plain, plain_rx) = sleeper(&h, &wq, None, SynchFlags::empty());
    assert!(!h.kernel.thread_interrupt(&plain));
    assert_pending(&plain_rx);

    let (soft, soft_rx) = sleeper(&h, &wq, None, SynchFlags::INTERRUPTIBLE);
    assert!(h.kernel.thread_interrupt(&soft));
    assert_eq!(recv(&soft_rx), SleepResult::Interrupted);
    assert_eq!(wq.sleepers(), 1);

    // Interrupting a thread that no longer sleeps does nothing.
    assert!(!h.kernel.thread_interrupt(&soft));

    wq.wakeup(&h.kernel, WakeMode::First);
    assert_eq!(recv(&plain_rx), SleepResult::OkBlocked);
}

#[test]
fn interrupt_disarms_the_timeout() {
    let h = Harness::new(1);
    let wq = Arc::new(WaitQueue::new());
    let (thread, rx) = sleeper(&h, &wq, Some(Duration::from_millis(30)), SynchFlags::INTERRUPTIBLE);

    assert!(h.kernel.thread_interrupt(&thread));
    assert_eq!(recv(&rx), SleepResult::Interrupted);
    assert_eq!(h.kernel.cpu(0).unwrap().armed_timeouts(), 0);
    h.ticks(40);
    assert_eq!(wq.sleepers(), 0);
}

#[test]
fn killed_task_fails_later_interruptible_sleeps() {
    let h = Harness::new(1);
    let task = h.task("victim");
    let gate = Arc::new(WaitQueue::new());
    let trap = Arc::new(WaitQueue::new());

    let (tx, rx) = std::sync::mpsc::channel();
    let thread = {
        let gate = gate.clone();
        let trap = trap.clone();
        h.spawn(&task, "victim", move |k| {
            let first = gate.sleep(k, None, SynchFlags::empty());
            let second = trap.sleep(k, None, SynchFlags::INTERRUPTIBLE);
            let _ = tx.send((first, second));
        })
    };
    h.wait_sleeping(&thread);

    h.kernel.task_kill(&task);
    assert!(thread.is_interrupted());
    assert!(!task.accepts_new_threads());
    assert_pending(&rx);

    gate.wakeup(&h.kernel, WakeMode::First);
    assert_eq!(recv(&rx), (SleepResult::OkBlocked, SleepResult::Interrupted));
    assert_eq!(trap.sleepers(), 0);
}

#[test]
fn prepared_sleep_can_drop_stale_wakeups() {
    let h = Harness::new(1);
    let wq = Arc::new(WaitQueue::new());
    wq.wakeup(&h.kernel, WakeMode::First);

    let q = wq.clone();
    let (thread, rx) = h.start("prepared", move |k| {
        let mut prepared = q.sleep_prepare(k);
        prepared.clear_missed_wakeups();
        prepared.sleep(Some(Duration::from_millis(5)), SynchFlags::empty())
    });
    h.wait_sleeping(&thread);
    assert_eq!(wq.missed_wakeups(), 0);

    h.ticks(5);
    assert_eq!(recv(&rx), SleepResult::Timeout);
}

#[test]
fn thread_sleep_lasts_the_requested_time() {
    let h = Harness::new(1);
    let (thread, rx) = h.start("napper", |k| k.thread_sleep(Duration::from_millis(20)));
    h.wait_sleeping(&thread);

    h.ticks(19);
    assert_pending(&rx);
    h.tick();
    assert_eq!(recv(&rx), SleepResult::Timeout);
}

#[test]
fn racing_wakeup_timeout_and_interrupt_end_each_sleep_once() {
    const SLEEPERS: usize = 8;
    const SLEEPS: usize = 4;

    for round in 0..10 {
        let h = Harness::new(2);
        let wq = Arc::new(WaitQueue::new());
        let (tx, rx) = mpsc::channel();
        let sleepers: Vec<_> = (0..SLEEPERS)
            .map(|_| {
                let (wq, tx) = (wq.clone(), tx.clone());
                h.spawn(h.default_task(), "racer", move |k| {
                    // Back-to-back sleeps start while the last timeout may
                    // still be running on the other CPU.
                    for _ in 0..SLEEPS {
                        let rc = wq.sleep(k, Some(Duration::from_millis(3)), SynchFlags::INTERRUPTIBLE);
                        let _ = tx.send(rc);
                    }
                })
            })
            .collect();
        drop(tx);

        let done = AtomicBool::new(false);
        let (results, woken, interrupted) = thread::scope(|s| {
            s.spawn(|| {
                while !done.load(Ordering::SeqCst) {
                    h.tick();
                    thread::sleep(Duration::from_micros(200));
                }
            });
            let waker = s.spawn(|| {
                let mut woken = 0;
                while !done.load(Ordering::SeqCst) {
                    woken += wq.wakeup(&h.kernel, WakeMode::First);
                    thread::sleep(Duration::from_micros(300));
                }
                woken
            });
            let interrupter = s.spawn(|| {
                let mut interrupted = 0;
                while !done.load(Ordering::SeqCst) {
                    for thread in &sleepers {
                        if h.kernel.thread_interrupt(thread) {
                            interrupted += 1;
                        }
                    }
                    thread::sleep(Duration::from_micros(500));
                }
                interrupted
            });

            let results: Vec<SleepResult> = (0..SLEEPERS * SLEEPS).map(|_| recv(&rx)).collect();
            done.store(true, Ordering::SeqCst);
            (results, waker.join().unwrap(), interrupter.join().unwrap())
        });

        for thread in &sleepers {
            h.wait_dead(thread);
        }
        assert!(rx.try_recv().is_err(), "round {}: a sleep ended twice", round);

        let count = |rc: SleepResult| results.iter().filter(|r| **r == rc).count();
        assert_eq!(count(SleepResult::OkBlocked), woken, "round {}", round);
        assert_eq!(count(SleepResult::Interrupted), interrupted, "round {}", round);
        assert_eq!(count(SleepResult::WouldBlock), 0, "round {}", round);
        assert_eq!(
            count(SleepResult::OkBlocked)
                + count(SleepResult::OkAtomic)
                + count(SleepResult::Interrupted)
                + count(SleepResult::Timeout),
            SLEEPERS * SLEEPS,
            "round {}",
            round
        );
    }
}
