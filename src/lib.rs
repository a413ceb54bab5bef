//! Reactor-style event loop library for single-host network services.
//!
//! One loop per thread waits for fd readiness, dispatches callbacks, and
//! fires timers; other threads hand it work through a cloneable handle.
//!
//! # Architecture
//!
//! - **EventLoop**: per-thread reactor owning the poller, timer queue and
//!   wakeup eventfd; runs callbacks to completion, no preemption
//! - **Channel**: per-fd adapter binding interest flags to callbacks
//! - **Poller**: poll(2) and epoll readiness backends
//! - **TimerQueue**: timerfd-backed ordered timers with repeat and cancel
//! - **LoopHandle**: cross-thread task submission, timers and quit
//! - **EventLoopThread**: a loop hosted on its own thread, published to
//!   the caller only after it is fully initialized
//! - **http**: the thin request model carried by server code upstack
//!
//! Linux only: the crate leans on epoll, timerfd and eventfd directly.

mod channel;
pub mod current_thread;
mod event_loop;
pub mod http;
mod poller;
pub mod time;
mod timer;

pub use channel::Channel;
pub use event_loop::thread::EventLoopThread;
pub use event_loop::{EventLoop, LoopHandle};
pub use time::Timestamp;
pub use timer::TimerId;
