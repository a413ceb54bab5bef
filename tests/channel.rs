use evloop::{Channel, EventLoop};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

#[test]
fn readable_data_reaches_the_read_callback() {
    let mut event_loop = EventLoop::new();
    let handle = event_loop.handle();
    let (mut writer, reader) = UnixStream::pair().unwrap();
    reader.set_nonblocking(true).unwrap();

    let reads = Arc::new(AtomicU32::new(0));
    let channel = Channel::new(&event_loop, reader.as_raw_fd());
    {
        let reads = reads.clone();
        let handle = handle.clone();
        channel.borrow_mut().set_read_callback(move |receive_time| {
            assert!(receive_time.is_valid());
            reads.fetch_add(1, Ordering::SeqCst);
            handle.quit();
        });
    }
    channel.borrow_mut().enable_reading();

    writer.write_all(b"ping").unwrap();
    event_loop.run();

    assert_eq!(reads.load(Ordering::SeqCst), 1);
    channel.borrow_mut().disable_all();
    channel.borrow_mut().remove();
}

#[test]
fn tie_to_a_dropped_anchor_suppresses_callbacks() {
    let mut event_loop = EventLoop::new();
    let handle = event_loop.handle();
    let (mut writer, reader) = UnixStream::pair().unwrap();
    reader.set_nonblocking(true).unwrap();

    let reads = Arc::new(AtomicU32::new(0));
    let channel = Channel::new(&event_loop, reader.as_raw_fd());
    {
        let reads = reads.clone();
        channel.borrow_mut().set_read_callback(move |_receive_time| {
            reads.fetch_add(1, Ordering::SeqCst);
        });
    }
    let anchor = Rc::new(());
    channel.borrow_mut().tie(&anchor);
    channel.borrow_mut().enable_reading();
    drop(anchor);

    writer.write_all(b"ping").unwrap();
    {
        let handle = handle.clone();
        event_loop.run_after(0.05, move || handle.quit());
    }
    event_loop.run();

    assert_eq!(
        reads.load(Ordering::SeqCst),
        0,
        "a dead anchor must suppress every callback"
    );
    channel.borrow_mut().disable_all();
    channel.borrow_mut().remove();
}

#[test]
fn interest_mask_round_trips() {
    let event_loop = EventLoop::new();
    let (_writer, reader) = UnixStream::pair().unwrap();

    let channel = Channel::new(&event_loop, reader.as_raw_fd());
    let before = channel.borrow().events();

    channel.borrow_mut().enable_reading();
    assert!(channel.borrow().is_reading());
    assert!(!channel.borrow().is_writing());

    // pushing an unchanged interest mask is idempotent
    let enabled = channel.borrow().events();
    channel.borrow_mut().enable_reading();
    assert_eq!(channel.borrow().events(), enabled);

    channel.borrow_mut().disable_reading();
    assert_eq!(channel.borrow().events(), before);
    assert!(channel.borrow().is_none_event());

    channel.borrow_mut().remove();
}

#[test]
fn zero_interest_channel_receives_nothing() {
    let mut event_loop = EventLoop::new();
    let handle = event_loop.handle();
    let (mut writer, reader) = UnixStream::pair().unwrap();
    reader.set_nonblocking(true).unwrap();

    let reads = Arc::new(AtomicU32::new(0));
    let channel = Channel::new(&event_loop, reader.as_raw_fd());
    {
        let reads = reads.clone();
        channel.borrow_mut().set_read_callback(move |_receive_time| {
            reads.fetch_add(1, Ordering::SeqCst);
        });
    }
    // interest never enabled: the poller must not see this fd

    writer.write_all(b"ping").unwrap();
    {
        let handle = handle.clone();
        event_loop.run_after(0.05, move || handle.quit());
    }
    event_loop.run();

    assert_eq!(reads.load(Ordering::SeqCst), 0);
}

#[test]
fn write_interest_fires_the_write_callback() {
    let mut event_loop = EventLoop::new();
    let handle = event_loop.handle();
    let (writer, _reader) = UnixStream::pair().unwrap();
    writer.set_nonblocking(true).unwrap();

    let writes = Arc::new(AtomicU32::new(0));
    let channel = Channel::new(&event_loop, writer.as_raw_fd());
    {
        let writes = writes.clone();
        let handle = handle.clone();
        channel.borrow_mut().set_write_callback(move || {
            writes.fetch_add(1, Ordering::SeqCst);
            handle.quit();
        });
    }
    channel.borrow_mut().enable_writing();

    // An idle socket buffer is writable straight away.
    event_loop.run();

    assert_eq!(writes.load(Ordering::SeqCst), 1);
    channel.borrow_mut().disable_all();
    channel.borrow_mut().remove();
}
