//! # strand-runtime - fibers, scheduler, I/O manager, syscall hooks
//!
//! A user-space concurrency runtime that multiplexes stackful cooperative
//! fibers onto a small pool of OS threads, driven by an epoll reactor.
//! Blocking-style code really suspends its fiber: hooked POSIX calls park
//! the fiber on the fd and free the worker thread for other work.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        User Code                            │
//! │        read()/write()/connect()/sleep() - blocking style    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ hooked symbols
//!                              ▼
//! ┌──────────────┐   EAGAIN   ┌─────────────────────────────────┐
//! │  FdManager   │◄──────────►│            IoManager            │
//! │ per-fd state │            │  epoll reactor + timer wheel    │
//! └──────────────┘            └─────────────────────────────────┘
//!                                  │ park / resurrect fibers
//!                                  ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Scheduler                            │
//! │        FIFO task queue, worker pool, idle fibers            │
//! └─────────────────────────────────────────────────────────────┘
//!          │                   │                   │
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │  Worker   │      │  Worker   │      │  Caller   │
//!    │  thread   │      │  thread   │      │  thread   │
//!    └───────────┘      └───────────┘      └───────────┘
//! ```
//!
//! Scheduling is strictly cooperative: a fiber runs until it yields or
//! returns. The only blocking call in the runtime is the reactor wait
//! inside each worker's idle fiber.

pub mod arch;
pub mod config;
pub mod fd;
pub mod fiber;
pub mod hook;
pub mod io_manager;
pub mod logging;
pub mod platform;
pub mod scheduler;
pub mod stack;
pub mod timer;

pub use config::{runtime_config, RuntimeConfig};
pub use fd::{fd_manager, FdCtx, FdManager, TimeoutKind, NO_TIMEOUT};
pub use fiber::{Fiber, FiberFn};
pub use hook::{connect_with_timeout, hook_enabled, set_connect_timeout, set_hook_enabled};
pub use io_manager::IoManager;
pub use scheduler::{Scheduler, ANY_THREAD};
pub use stack::FiberStack;
pub use timer::{Timer, TimerCallback, TimerCondition, TimerManager};
