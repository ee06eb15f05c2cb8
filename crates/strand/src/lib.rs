//! # strand - stackful fibers with transparent blocking-call hooking
//!
//! Code written in ordinary blocking style - reading from sockets,
//! sleeping, connecting - actually suspends the current fiber and yields
//! the OS thread to other work, resuming when the I/O is ready or a timer
//! fires.
//!
//! ## Quick start
//!
//! ```ignore
//! use strand::{IoManager, ANY_THREAD};
//!
//! fn main() {
//!     let iom = IoManager::new(4, false, "app");
//!
//!     iom.scheduler().schedule(
//!         || {
//!             // Hooked: parks this fiber for a second, the worker
//!             // thread keeps running other fibers.
//!             unsafe { libc::sleep(1) };
//!             println!("one second later");
//!         },
//!         ANY_THREAD,
//!     );
//!
//!     // ... submit more work ...
//!     iom.stop();
//! }
//! ```
//!
//! ## What gets hooked
//!
//! `sleep`, `usleep`, `nanosleep`, `socket`, `connect`, `accept`, `read`,
//! `readv`, `recv`, `recvfrom`, `recvmsg`, `write`, `writev`, `send`,
//! `sendto`, `sendmsg`, `close`, `fcntl`, `ioctl`, `getsockopt`,
//! `setsockopt`. A thread that does not belong to a scheduler sees
//! bit-identical pass-through behavior.
//!
//! ## Pieces
//!
//! - [`Fiber`] - stackful coroutine with resume/yield/reset
//! - [`Scheduler`] - FIFO task queue over a worker pool, optional caller
//!   thread participation, per-thread pinning
//! - [`IoManager`] - scheduler + epoll reactor + timers; the embedding
//!   entry point for most programs

pub use strand_core::{
    env_get, env_get_bool, env_get_opt, Event, EventSet, FiberId, FiberState, SchedError,
    SchedResult,
};

pub use strand_runtime::{
    connect_with_timeout, fd_manager, hook_enabled, runtime_config, set_connect_timeout,
    set_hook_enabled, Fiber, FiberFn, IoManager, RuntimeConfig, Scheduler, TimeoutKind, Timer,
    TimerCallback, TimerCondition, TimerManager, ANY_THREAD, NO_TIMEOUT,
};

/// Raw hook layer, including `origin::*` pass-through syscalls.
pub use strand_runtime::hook;
