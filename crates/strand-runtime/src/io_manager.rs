//! I/O manager
//!
//! Couples the scheduler with an epoll reactor and the timer set. Parking a
//! fiber on a file descriptor reduces to storing it in the fd's event slot
//! and yielding; the reactor poll, running in each worker's idle fiber,
//! resurrects it by scheduling it back onto its scheduler.
//!
//! A self-pipe registered with the reactor breaks the poll when new tasks
//! or soon deadlines appear while every worker is blocked.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use log::{debug, trace, warn};

use strand_core::error::{SchedError, SchedResult};
use strand_core::event::{Event, EventSet};
use strand_core::state::FiberState;

use crate::config::runtime_config;
use crate::fiber::{Fiber, FiberFn};
use crate::hook::origin;
use crate::logging;
use crate::scheduler::{Scheduler, ANY_THREAD};
use crate::timer::{Timer, TimerCallback, TimerCondition, TimerManager};

/// Upper bound on a single reactor wait, so deadlines armed by other
/// threads are noticed even if a tickle byte is lost.
const MAX_EVENTS_TIMEOUT_MS: u64 = 3000;

/// Where a parked waiter goes when its event fires.
struct EventSlot {
    /// Scheduler captured at registration time; the waiter is re-queued
    /// there, not on whichever worker polled the reactor.
    scheduler: Weak<Scheduler>,
    fiber: Option<Arc<Fiber>>,
    cb: Option<FiberFn>,
}

impl EventSlot {
    const fn empty() -> Self {
        EventSlot {
            scheduler: Weak::new(),
            fiber: None,
            cb: None,
        }
    }

    fn reset(&mut self) {
        self.scheduler = Weak::new();
        self.fiber = None;
        self.cb = None;
    }
}

/// Registered-event bookkeeping for one fd, guarded by its own mutex.
struct FdEvents {
    registered: EventSet,
    read: EventSlot,
    write: EventSlot,
}

impl FdEvents {
    fn slot_mut(&mut self, event: Event) -> &mut EventSlot {
        match event {
            Event::Read => &mut self.read,
            Event::Write => &mut self.write,
        }
    }

    /// Consume the slot for `event`: unregister it and schedule whatever
    /// waiter it holds.
    fn trigger(&mut self, event: Event, pending: &AtomicUsize) {
        debug_assert!(self.registered.contains(event));
        self.registered = self.registered.removed(event);

        let slot = self.slot_mut(event);
        let scheduler = slot.scheduler.upgrade();
        let fiber = slot.fiber.take();
        let cb = slot.cb.take();
        slot.reset();

        if let Some(scheduler) = scheduler {
            if let Some(fiber) = fiber {
                scheduler.schedule_fiber(fiber, ANY_THREAD);
            } else if let Some(cb) = cb {
                scheduler.schedule(cb, ANY_THREAD);
            }
        }
        pending.fetch_sub(1, Ordering::AcqRel);
    }
}

struct FdContext {
    fd: RawFd,
    inner: Mutex<FdEvents>,
}

impl FdContext {
    fn new(fd: RawFd) -> Self {
        FdContext {
            fd,
            inner: Mutex::new(FdEvents {
                registered: EventSet::NONE,
                read: EventSlot::empty(),
                write: EventSlot::empty(),
            }),
        }
    }
}

/// Scheduler specialization with a readiness reactor and timers.
pub struct IoManager {
    scheduler: Arc<Scheduler>,
    timers: TimerManager,
    epfd: RawFd,
    /// Self-pipe; index 0 is the read end registered with the reactor.
    tickle_fds: [RawFd; 2],
    /// Populated event slots across all fd contexts.
    pending_events: AtomicUsize,
    fd_contexts: RwLock<Vec<Option<Arc<FdContext>>>>,
    max_events: usize,
}

impl IoManager {
    /// Create the reactor and self-pipe, then start the scheduler.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<IoManager> {
        logging::initialize();
        let config = runtime_config();

        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        assert!(epfd >= 0, "epoll_create1 failed: {}", last_errno());

        let mut pipe_fds = [0; 2];
        let rc = unsafe {
            libc::pipe2(
                pipe_fds.as_mut_ptr(),
                libc::O_NONBLOCK | libc::O_CLOEXEC,
            )
        };
        assert_eq!(rc, 0, "pipe2 failed: {}", last_errno());

        // Register the wake pipe straight with the reactor; it has no
        // event slots and is handled inline in the idle loop.
        let mut ev = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET) as u32,
            u64: pipe_fds[0] as u64,
        };
        let rc = unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, pipe_fds[0], &mut ev) };
        assert_eq!(rc, 0, "epoll_ctl(self-pipe) failed: {}", last_errno());

        let scheduler = Scheduler::new(threads, use_caller, name);
        let iom = Arc::new(IoManager {
            scheduler,
            timers: TimerManager::new(),
            epfd,
            tickle_fds: pipe_fds,
            pending_events: AtomicUsize::new(0),
            fd_contexts: RwLock::new(Vec::new()),
            max_events: config.max_events,
        });

        iom.scheduler.set_driver(Arc::downgrade(&iom));
        iom.scheduler.start();
        debug!("io manager {} started", iom.scheduler.name());
        iom
    }

    /// The I/O manager driving the current thread's scheduler, if any.
    pub fn current() -> Option<Arc<IoManager>> {
        Scheduler::current()?.driver()
    }

    #[inline]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Request shutdown and join the workers. With `use_caller` this must
    /// run on the constructing thread.
    pub fn stop(&self) {
        self.scheduler.stop();
    }

    // ── Event registration ──

    /// Register interest in `event` on `fd`.
    ///
    /// The waiter is `cb` when given, otherwise the calling fiber, which is
    /// expected to yield right after this returns. Registering an event
    /// that is already present fails.
    pub fn add_event(&self, fd: RawFd, event: Event, cb: Option<FiberFn>) -> SchedResult<()> {
        if fd < 0 {
            return Err(SchedError::Platform(libc::EBADF));
        }
        let ctx = self
            .fd_context(fd, true)
            .ok_or(SchedError::Platform(libc::EBADF))?;

        let mut inner = ctx.inner.lock().unwrap();
        if inner.registered.contains(event) {
            warn!("fd {} {:?} already registered", fd, event);
            return Err(SchedError::EventExists);
        }

        let op = if inner.registered.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mask = inner.registered | event;
        self.epoll_update(op, fd, mask)?;

        self.pending_events.fetch_add(1, Ordering::AcqRel);
        inner.registered = mask;

        let slot = inner.slot_mut(event);
        slot.scheduler = Scheduler::current()
            .map(|s| Arc::downgrade(&s))
            .unwrap_or_else(|| Arc::downgrade(&self.scheduler));
        if let Some(cb) = cb {
            slot.cb = Some(cb);
        } else {
            let current = Fiber::current();
            debug_assert_eq!(current.state(), FiberState::Running);
            slot.fiber = Some(current);
        }
        trace!("fd {} {:?} registered", fd, event);
        Ok(())
    }

    /// Unregister `event` from `fd`, dropping any stored waiter without
    /// scheduling it.
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(ctx) = self.fd_context(fd, false) else {
            return false;
        };
        let mut inner = ctx.inner.lock().unwrap();
        if !inner.registered.contains(event) {
            return false;
        }

        let mask = inner.registered.removed(event);
        let op = if mask.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        if let Err(e) = self.epoll_update(op, fd, mask) {
            warn!("del_event epoll update failed for fd {}: {}", fd, e);
            return false;
        }

        inner.registered = mask;
        inner.slot_mut(event).reset();
        self.pending_events.fetch_sub(1, Ordering::AcqRel);
        true
    }

    /// Unregister `event` from `fd` and schedule its stored waiter.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(ctx) = self.fd_context(fd, false) else {
            return false;
        };
        let mut inner = ctx.inner.lock().unwrap();
        if !inner.registered.contains(event) {
            return false;
        }

        let mask = inner.registered.removed(event);
        let op = if mask.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        if let Err(e) = self.epoll_update(op, fd, mask) {
            warn!("cancel_event epoll update failed for fd {}: {}", fd, e);
        }

        inner.trigger(event, &self.pending_events);
        true
    }

    /// Cancel every registered event on `fd`, scheduling the waiters.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let Some(ctx) = self.fd_context(fd, false) else {
            return false;
        };
        let mut inner = ctx.inner.lock().unwrap();
        if inner.registered.is_empty() {
            return false;
        }

        if let Err(e) = self.epoll_update(libc::EPOLL_CTL_DEL, fd, EventSet::NONE) {
            warn!("cancel_all epoll update failed for fd {}: {}", fd, e);
        }

        if inner.registered.contains(Event::Read) {
            inner.trigger(Event::Read, &self.pending_events);
        }
        if inner.registered.contains(Event::Write) {
            inner.trigger(Event::Write, &self.pending_events);
        }
        debug_assert!(inner.registered.is_empty());
        true
    }

    // ── Timers ──

    /// Schedule `cb` to run `ms` milliseconds from now.
    pub fn add_timer(&self, ms: u64, cb: TimerCallback, recurring: bool) -> Arc<Timer> {
        let (timer, at_front) = self.timers.add_timer(ms, cb, recurring);
        if at_front {
            self.tickle();
        }
        timer
    }

    /// Schedule `cb` with a weak condition; see [`TimerManager`].
    pub fn add_condition_timer(
        &self,
        ms: u64,
        cb: TimerCallback,
        condition: Weak<TimerCondition>,
        recurring: bool,
    ) -> Arc<Timer> {
        let (timer, at_front) = self.timers.add_condition_timer(ms, cb, condition, recurring);
        if at_front {
            self.tickle();
        }
        timer
    }

    pub fn cancel_timer(&self, timer: &Arc<Timer>) -> bool {
        self.timers.cancel(timer)
    }

    // ── Scheduler driver surface ──

    /// Wake one blocked reactor wait, if any worker is idle.
    pub(crate) fn tickle(&self) {
        if !self.scheduler.has_idle_threads() {
            return;
        }
        let byte = [b'T'];
        unsafe {
            origin::write(self.tickle_fds[1], byte.as_ptr().cast(), 1);
        }
    }

    /// Done when the scheduler is done and no waiter or timer remains.
    pub(crate) fn stopping(&self) -> bool {
        self.pending_events.load(Ordering::Acquire) == 0
            && !self.timers.has_timers()
            && self.scheduler.base_stopping()
    }

    /// Body of every worker's idle fiber: poll the reactor, fire ready
    /// events and due timers, then yield back to the scheduling loop.
    pub(crate) fn idle(&self) {
        let mut events =
            vec![libc::epoll_event { events: 0, u64: 0 }; self.max_events];

        loop {
            if self.stopping() {
                debug!("io manager {} idle exiting", self.scheduler.name());
                // Pass the wakeup on so sibling workers notice promptly
                // instead of riding out their poll timeout.
                let byte = [b'T'];
                unsafe {
                    origin::write(self.tickle_fds[1], byte.as_ptr().cast(), 1);
                }
                break;
            }

            let timeout = self
                .timers
                .next_timeout()
                .map(|ms| ms.min(MAX_EVENTS_TIMEOUT_MS))
                .unwrap_or(MAX_EVENTS_TIMEOUT_MS) as i32;

            let n = unsafe {
                libc::epoll_wait(
                    self.epfd,
                    events.as_mut_ptr(),
                    self.max_events as i32,
                    timeout,
                )
            };
            if n < 0 {
                if last_errno() != libc::EINTR {
                    warn!("epoll_wait failed: {}", last_errno());
                }
                continue;
            }

            for ev in &events[..n as usize] {
                let fd = { ev.u64 } as RawFd;
                if fd == self.tickle_fds[0] {
                    self.drain_tickle_pipe();
                    continue;
                }

                let Some(ctx) = self.fd_context(fd, false) else {
                    continue;
                };
                let mut inner = ctx.inner.lock().unwrap();

                let mut bits = { ev.events };
                // Error or hangup fires every registered interest so the
                // retrying waiter observes the real errno.
                if bits & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                    bits |= (libc::EPOLLIN | libc::EPOLLOUT) as u32;
                }
                let real = EventSet::from_bits_truncate(bits).intersect(inner.registered);
                if real.is_empty() {
                    continue;
                }

                let left = inner.registered.subtract(real);
                let op = if left.is_empty() {
                    libc::EPOLL_CTL_DEL
                } else {
                    libc::EPOLL_CTL_MOD
                };
                if let Err(e) = self.epoll_update(op, ctx.fd, left) {
                    warn!("idle epoll update failed for fd {}: {}", ctx.fd, e);
                    continue;
                }

                for event in real.iter() {
                    inner.trigger(event, &self.pending_events);
                }
            }

            for cb in self.timers.take_expired() {
                self.scheduler.schedule(move || cb(), ANY_THREAD);
            }

            // Let the worker rescan the task queue, then come back and
            // re-poll.
            Fiber::current().yield_now();
        }
    }

    // ── Internals ──

    fn drain_tickle_pipe(&self) {
        let mut buf = [0u8; 256];
        loop {
            let n = unsafe {
                origin::read(self.tickle_fds[0], buf.as_mut_ptr().cast(), buf.len())
            };
            if n <= 0 {
                break;
            }
        }
    }

    fn epoll_update(&self, op: libc::c_int, fd: RawFd, mask: EventSet) -> SchedResult<()> {
        let mut ev = libc::epoll_event {
            events: libc::EPOLLET as u32 | mask.bits(),
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rc != 0 {
            return Err(SchedError::Platform(last_errno()));
        }
        Ok(())
    }

    /// Per-fd context lookup; grows the table under the exclusive lock when
    /// `create` is set.
    fn fd_context(&self, fd: RawFd, create: bool) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;
        {
            let contexts = self.fd_contexts.read().unwrap();
            if let Some(Some(ctx)) = contexts.get(idx) {
                return Some(ctx.clone());
            }
        }
        if !create {
            return None;
        }

        let mut contexts = self.fd_contexts.write().unwrap();
        if contexts.len() <= idx {
            let target = std::cmp::max(idx * 3 / 2, idx + 1);
            contexts.resize_with(target, || None);
        }
        if contexts[idx].is_none() {
            contexts[idx] = Some(Arc::new(FdContext::new(fd)));
        }
        contexts[idx].clone()
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        if !self.scheduler.base_stopping() {
            warn!(
                "io manager {} dropped without stop()",
                self.scheduler.name()
            );
        }
        unsafe {
            origin::close(self.epfd);
            origin::close(self.tickle_fds[0]);
            origin::close(self.tickle_fds[1]);
        }
    }
}

#[inline]
fn last_errno() -> i32 {
    unsafe { *libc::__errno_location() }
}
