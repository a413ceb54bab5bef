//! An event loop hosted on a dedicated OS thread.

use super::{EventLoop, LoopHandle};

use log::error;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

type InitCallback = Box<dyn FnOnce(&mut EventLoop) + Send>;

/// Owns one thread running one [`EventLoop`].
///
/// [`start_loop`](EventLoopThread::start_loop) spawns the thread and
/// blocks until the loop is fully constructed, so the returned handle is
/// always usable. Dropping the `EventLoopThread` quits the loop and joins
/// the thread; dropping one that was never started does nothing.
pub struct EventLoopThread {
    name: String,
    thread: Option<thread::JoinHandle<()>>,
    published: Arc<(Mutex<Option<LoopHandle>>, Condvar)>,
    init_callback: Option<InitCallback>,
}

impl EventLoopThread {
    pub fn new(name: impl Into<String>) -> EventLoopThread {
        EventLoopThread {
            name: name.into(),
            thread: None,
            published: Arc::new((Mutex::new(None), Condvar::new())),
            init_callback: None,
        }
    }

    /// Like [`new`](EventLoopThread::new), with a callback that runs on
    /// the new thread once the loop exists and before it starts looping.
    /// Channels that must live on that loop are registered there.
    pub fn with_init(
        name: impl Into<String>,
        init: impl FnOnce(&mut EventLoop) + Send + 'static,
    ) -> EventLoopThread {
        let mut this = EventLoopThread::new(name);
        this.init_callback = Some(Box::new(init));
        this
    }

    /// Spawns the loop thread and returns its handle once the loop is
    /// initialized. The handle stays valid for the life of this object.
    ///
    /// # Panics
    ///
    /// Panics when called twice, or when the OS refuses to spawn a thread.
    pub fn start_loop(&mut self) -> LoopHandle {
        assert!(self.thread.is_none(), "event loop thread started twice");

        let published = self.published.clone();
        let init_callback = self.init_callback.take();
        let thread = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let mut event_loop = EventLoop::new();
                if let Some(init) = init_callback {
                    init(&mut event_loop);
                }
                {
                    let (slot, ready) = &*published;
                    *slot.lock().unwrap() = Some(event_loop.handle());
                    ready.notify_one();
                }
                event_loop.run();
                // The loop is gone; late callers must not quit a corpse.
                let (slot, _) = &*published;
                *slot.lock().unwrap() = None;
            })
            .expect("failed to spawn event loop thread");
        self.thread = Some(thread);

        let (slot, ready) = &*self.published;
        let mut guard = slot.lock().unwrap();
        while guard.is_none() {
            guard = ready.wait(guard).unwrap();
        }
        guard.clone().expect("loop handle published")
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let handle = self.published.0.lock().unwrap().clone();
            if let Some(handle) = handle {
                handle.quit();
            }
            if thread.join().is_err() {
                error!("event loop thread '{}' panicked", self.name);
            }
        }
    }
}
