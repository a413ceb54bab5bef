use evloop::{current_thread, EventLoopThread, LoopHandle};
use std::sync::mpsc;
use std::time::Duration;

#[test]
fn never_started_thread_drops_cleanly() {
    let thread = EventLoopThread::new("idle-loop");
    drop(thread);
}

#[test]
fn run_in_loop_executes_on_the_loop_thread() {
    let mut thread = EventLoopThread::new("dispatch-loop");
    let handle = thread.start_loop();

    let (sender, receiver) = mpsc::channel();
    let probe = handle.clone();
    handle.run_in_loop(move || {
        let current = LoopHandle::current().expect("loop registered on its own thread");
        sender
            .send((current_thread::tid(), current == probe))
            .unwrap();
    });

    let (loop_tid, same_loop) = receiver
        .recv_timeout(Duration::from_secs(5))
        .expect("task should run on the loop thread");
    assert_ne!(loop_tid, current_thread::tid());
    assert!(same_loop, "the task must observe the loop it was sent to");
}

#[test]
fn quit_from_inside_joins_promptly() {
    let mut thread = EventLoopThread::new("quitting-loop");
    let handle = thread.start_loop();

    handle.run_in_loop(|| {
        LoopHandle::current().expect("loop registered").quit();
    });

    // The destructor joins; a missed quit would hang the test harness here.
    drop(thread);
}

#[test]
fn init_callback_runs_before_the_loop() {
    let (sender, receiver) = mpsc::channel();
    let mut thread = EventLoopThread::with_init("init-loop", move |event_loop| {
        sender.send(event_loop.iteration()).unwrap();
    });
    let _handle = thread.start_loop();

    let iteration_at_init = receiver
        .recv_timeout(Duration::from_secs(5))
        .expect("init callback should run");
    assert_eq!(iteration_at_init, 0, "init runs before the first poller wait");
}

#[test]
fn handles_of_different_loops_are_distinct() {
    let mut first = EventLoopThread::new("loop-a");
    let mut second = EventLoopThread::new("loop-b");
    let first_handle = first.start_loop();
    let second_handle = second.start_loop();

    assert_eq!(first_handle, first_handle.clone());
    assert_ne!(first_handle, second_handle);
}
