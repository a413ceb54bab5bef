//! Cached kernel thread id for the calling thread.
//!
//! The id is fetched with `gettid` once per thread and memoized in
//! thread-local storage, so identity checks on the event-loop hot path
//! cost a thread-local read instead of a syscall.

use std::cell::Cell;

thread_local! {
    /// Kernel tid of this thread, 0 until first use.
    static CACHED_TID: Cell<libc::pid_t> = const { Cell::new(0) };
}

/// Returns the kernel thread id of the calling thread.
///
/// The first call on a thread performs the `gettid` syscall; later calls
/// return the cached value.
pub fn tid() -> libc::pid_t {
    CACHED_TID.with(|cell| {
        let mut tid = cell.get();
        if tid == 0 {
            tid = unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t };
            cell.set(tid);
        }
        tid
    })
}
