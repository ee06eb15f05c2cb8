//! Linux platform helpers

use std::cell::Cell;

thread_local! {
    static CACHED_TID: Cell<i64> = const { Cell::new(-1) };
}

/// Kernel thread id of the calling thread.
///
/// Cached per thread; the raw syscall is only made once.
#[inline]
pub fn current_tid() -> i64 {
    CACHED_TID.with(|cell| {
        let tid = cell.get();
        if tid != -1 {
            return tid;
        }
        let tid = unsafe { libc::syscall(libc::SYS_gettid) as i64 };
        cell.set(tid);
        tid
    })
}

/// Monotonic clock reading in milliseconds.
#[inline]
pub fn now_ms() -> u64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1000 + ts.tv_nsec as u64 / 1_000_000
}
