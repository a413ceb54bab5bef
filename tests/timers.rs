use evloop::{EventLoop, Timestamp};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[test]
fn one_shot_timer_fires_within_tolerance() {
    let mut event_loop = EventLoop::new();
    let handle = event_loop.handle();

    let fired_at = Arc::new(Mutex::new(Timestamp::invalid()));
    let scheduled_for = Timestamp::now().add_seconds(0.2);
    {
        let fired_at = fired_at.clone();
        let handle = handle.clone();
        event_loop.run_at(scheduled_for, move || {
            *fired_at.lock().unwrap() = Timestamp::now();
            handle.quit();
        });
    }
    event_loop.run();

    let fired_at = *fired_at.lock().unwrap();
    assert!(fired_at.is_valid(), "timer never fired");
    let lateness = fired_at.seconds_since(scheduled_for);
    assert!(lateness >= 0.0, "fired {}s early", -lateness);
    assert!(lateness < 0.05, "fired {}s late", lateness);
}

#[test]
fn zero_delay_timer_fires_in_the_next_iteration() {
    let mut event_loop = EventLoop::new();
    let handle = event_loop.handle();

    let fired = Arc::new(AtomicU32::new(0));
    {
        let fired = fired.clone();
        event_loop.run_at(Timestamp::now(), move || {
            fired.fetch_add(1, Ordering::SeqCst);
        });
    }
    {
        let handle = handle.clone();
        event_loop.run_after(0.1, move || handle.quit());
    }

    let started = Instant::now();
    event_loop.run();

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[test]
fn repeating_timer_cancelled_from_its_own_callback() {
    let mut event_loop = EventLoop::new();
    let handle = event_loop.handle();

    let count = Arc::new(AtomicU32::new(0));
    let id_slot = Arc::new(Mutex::new(None));
    {
        let count = count.clone();
        let id_slot_inner = id_slot.clone();
        let handle = handle.clone();
        let id = event_loop.run_every(0.01, move || {
            let fired = count.fetch_add(1, Ordering::SeqCst) + 1;
            if fired == 3 {
                let id = id_slot_inner.lock().unwrap().unwrap();
                handle.cancel(id);
                let quit_handle = handle.clone();
                handle.run_after(0.1, move || quit_handle.quit());
            }
        });
        *id_slot.lock().unwrap() = Some(id);
    }
    event_loop.run();

    assert_eq!(
        count.load(Ordering::SeqCst),
        3,
        "a repeat cancelled from its own callback must not be re-inserted"
    );
}

#[test]
fn cancelled_timer_never_fires() {
    let mut event_loop = EventLoop::new();
    let handle = event_loop.handle();

    let fired = Arc::new(AtomicU32::new(0));
    let id = {
        let fired = fired.clone();
        event_loop.run_after(0.05, move || {
            fired.fetch_add(1, Ordering::SeqCst);
        })
    };
    event_loop.cancel(id);
    {
        let handle = handle.clone();
        event_loop.run_after(0.15, move || handle.quit());
    }
    event_loop.run();

    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn run_every_repeats_until_the_loop_quits() {
    let mut event_loop = EventLoop::new();
    let handle = event_loop.handle();

    let count = Arc::new(AtomicU32::new(0));
    {
        let count = count.clone();
        event_loop.run_every(0.02, move || {
            count.fetch_add(1, Ordering::SeqCst);
        });
    }
    {
        let handle = handle.clone();
        event_loop.run_after(0.15, move || handle.quit());
    }
    event_loop.run();

    assert!(
        count.load(Ordering::SeqCst) >= 3,
        "expected several repeats, saw {}",
        count.load(Ordering::SeqCst)
    );
}

#[test]
fn timer_ids_are_unique_and_increasing() {
    let event_loop = EventLoop::new();

    let first = event_loop.run_after(10.0, || {});
    let second = event_loop.run_after(10.0, || {});
    assert!(second.sequence() > first.sequence());

    event_loop.cancel(first);
    event_loop.cancel(second);
}
