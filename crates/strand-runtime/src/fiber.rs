//! Stackful fibers
//!
//! A fiber is an independently allocated stack plus a saved machine
//! context. Three fiber roles coexist per thread: the *main* fiber wrapping
//! the thread's native stack, the *scheduling* fiber running the scheduler
//! loop, and task fibers. `run_in_scheduler` selects which of the first two
//! a task fiber swaps back to on yield.

use std::cell::{RefCell, UnsafeCell};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{trace, warn};

use strand_core::error::{SchedError, SchedResult};
use strand_core::id::FiberId;
use strand_core::state::FiberState;

use crate::arch::current_arch;
use crate::arch::SavedContext;
use crate::config::runtime_config;
use crate::stack::FiberStack;

/// Task payload executed on a fiber's own stack.
pub type FiberFn = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    /// Fiber currently executing on this thread.
    static CURRENT: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// This thread's main fiber, created on first access.
    static MAIN: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// Scheduling fiber of this thread. Non-owning; the scheduler (or, on
    /// the caller thread, the main fiber's surroundings) keeps it alive.
    static SCHEDULE: RefCell<Weak<Fiber>> = const { RefCell::new(Weak::new()) };
}

/// A stackful cooperative fiber.
///
/// Shared by `Arc` between the scheduler queue and any I/O event slot that
/// parks it; the storage lives as long as the longest holder. Resumes are
/// serialized by an internal lock; state is inspectable from any thread.
pub struct Fiber {
    id: FiberId,
    state: AtomicU8,
    /// On yield, swap back to the scheduling fiber rather than the main
    /// fiber.
    run_in_scheduler: bool,
    /// None for main fibers, which execute on the thread's native stack.
    stack: Option<FiberStack>,
    ctx: UnsafeCell<SavedContext>,
    /// True from the moment a switch away from this fiber begins until its
    /// context is fully saved. The context must not be loaded while set.
    ctx_busy: AtomicBool,
    entry: Mutex<Option<FiberFn>>,
    /// Serializes resume and reset against each other.
    resume_lock: Mutex<()>,
}

// The saved context is only touched by the thread currently driving the
// fiber; cross-thread handoff is ordered by `state` + `ctx_busy`.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a task fiber that will run `f` when first resumed.
    ///
    /// `stack_size` of 0 selects the configured default.
    pub fn new<F>(f: F, stack_size: usize, run_in_scheduler: bool) -> SchedResult<Arc<Fiber>>
    where
        F: FnOnce() + Send + 'static,
    {
        let size = if stack_size == 0 {
            runtime_config().stack_size
        } else {
            stack_size
        };
        let stack = FiberStack::new(size)?;

        let fiber = Arc::new(Fiber {
            id: FiberId::next(),
            state: AtomicU8::new(FiberState::Ready as u8),
            run_in_scheduler,
            stack: Some(stack),
            ctx: UnsafeCell::new(SavedContext::zeroed()),
            ctx_busy: AtomicBool::new(false),
            entry: Mutex::new(Some(Box::new(f))),
            resume_lock: Mutex::new(()),
        });

        unsafe {
            current_arch::init_context(
                fiber.ctx.get(),
                fiber.stack.as_ref().unwrap().top(),
                fiber_entry as usize,
                Arc::as_ptr(&fiber) as usize,
            );
        }

        trace!("fiber {} created", fiber.id);
        Ok(fiber)
    }

    /// The fiber currently executing on this thread.
    ///
    /// On first call from a thread this creates the thread's main fiber.
    pub fn current() -> Arc<Fiber> {
        if let Some(f) = CURRENT.with(|c| c.borrow().clone()) {
            return f;
        }
        let main = Self::thread_main();
        CURRENT.with(|c| *c.borrow_mut() = Some(main.clone()));
        main
    }

    /// This thread's main fiber, created on first access.
    pub(crate) fn thread_main() -> Arc<Fiber> {
        MAIN.with(|m| {
            let mut m = m.borrow_mut();
            if let Some(f) = &*m {
                return f.clone();
            }
            let f = Arc::new(Fiber {
                id: FiberId::next(),
                state: AtomicU8::new(FiberState::Running as u8),
                run_in_scheduler: false,
                stack: None,
                ctx: UnsafeCell::new(SavedContext::zeroed()),
                ctx_busy: AtomicBool::new(false),
                entry: Mutex::new(None),
                resume_lock: Mutex::new(()),
            });
            *m = Some(f.clone());
            f
        })
    }

    /// Install this thread's scheduling fiber.
    pub(crate) fn set_scheduler_fiber(f: &Arc<Fiber>) {
        SCHEDULE.with(|s| *s.borrow_mut() = Arc::downgrade(f));
    }

    /// This thread's scheduling fiber, if one is installed and alive.
    pub(crate) fn scheduler_fiber() -> Option<Arc<Fiber>> {
        SCHEDULE.with(|s| s.borrow().upgrade())
    }

    #[inline]
    pub fn id(&self) -> FiberId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        FiberState::from(self.state.load(Ordering::Acquire))
    }

    /// Switch from the calling fiber to this one.
    ///
    /// Must be called from the fiber this one yields back to: the scheduling
    /// fiber when `run_in_scheduler` is set, the thread main fiber
    /// otherwise. Resuming a `Term` fiber is a fatal error. If the fiber was
    /// scheduled by a readiness trigger racing its own yield, this waits for
    /// the yield to finish publishing the context.
    pub fn resume(self: &Arc<Self>) {
        let _serialize = self.resume_lock.lock().unwrap();

        loop {
            match self.state() {
                FiberState::Ready if !self.ctx_busy.load(Ordering::Acquire) => break,
                FiberState::Term => panic!("resume of TERM fiber {}", self.id),
                _ => std::hint::spin_loop(),
            }
        }

        let from = if self.run_in_scheduler {
            Self::scheduler_fiber().expect("resume: no scheduling fiber on this thread")
        } else {
            Self::thread_main()
        };

        CURRENT.with(|c| *c.borrow_mut() = Some(self.clone()));
        self.state.store(FiberState::Running as u8, Ordering::Release);

        from.ctx_busy.store(true, Ordering::Release);
        unsafe {
            current_arch::context_switch(from.ctx.get(), self.ctx.get(), from.ctx_busy.as_ptr() as *mut u8);
        }
        // Back here once the fiber yields or terminates.
    }

    /// Cooperatively yield this fiber back to its owner fiber.
    ///
    /// Valid from `Running` (suspends, becomes `Ready`) and from `Term`
    /// (terminal switch out). Must be called on the current fiber.
    pub fn yield_now(self: &Arc<Self>) {
        let st = self.state();
        assert!(
            st == FiberState::Running || st == FiberState::Term,
            "yield from {} fiber {}",
            st,
            self.id
        );
        debug_assert!(
            CURRENT.with(|c| c.borrow().as_ref().map(|f| Arc::as_ptr(f)) == Some(Arc::as_ptr(self))),
            "yield of a non-current fiber"
        );

        let target = if self.run_in_scheduler {
            Self::scheduler_fiber().expect("yield: no scheduling fiber on this thread")
        } else {
            Self::thread_main()
        };
        CURRENT.with(|c| *c.borrow_mut() = Some(target.clone()));

        // Mark the context in flight before becoming schedulable; resume
        // spins until the switch below has finished the save.
        self.ctx_busy.store(true, Ordering::Release);
        if st == FiberState::Running {
            self.state.store(FiberState::Ready as u8, Ordering::Release);
        }

        unsafe {
            current_arch::context_switch(self.ctx.get(), target.ctx.get(), self.ctx_busy.as_ptr() as *mut u8);
        }
        // Back here on the next resume.
    }

    /// Reuse a terminated fiber's stack for a new callable.
    ///
    /// Only valid in `Term`; main fibers cannot be reset.
    pub fn reset<F>(self: &Arc<Self>, f: F) -> SchedResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let _serialize = self.resume_lock.lock().unwrap();
        if self.state() != FiberState::Term {
            return Err(SchedError::InvalidFiberState);
        }
        let stack = self.stack.as_ref().ok_or(SchedError::InvalidFiberState)?;

        *self.entry.lock().unwrap() = Some(Box::new(f));
        unsafe {
            current_arch::init_context(
                self.ctx.get(),
                stack.top(),
                fiber_entry as usize,
                Arc::as_ptr(self) as usize,
            );
        }
        self.ctx_busy.store(false, Ordering::Release);
        self.state.store(FiberState::Ready as u8, Ordering::Release);
        trace!("fiber {} reset", self.id);
        Ok(())
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        if self.stack.is_some() && FiberState::from(self.state.load(Ordering::Acquire)) != FiberState::Term
        {
            // Dropping a suspended fiber abandons its stack frames; locals
            // on that stack do not run destructors.
            warn!("fiber {} dropped while {}", self.id, self.state());
        }
    }
}

/// Entry point executed on the fiber's own stack.
///
/// Runs the callable, transitions to `Term`, and switches out for the last
/// time. Control never returns here.
extern "C" fn fiber_entry(arg: usize) {
    let fiber = unsafe { &*(arg as *const Fiber) };

    let entry = fiber.entry.lock().unwrap().take();
    if let Some(f) = entry {
        f();
    }

    fiber.state.store(FiberState::Term as u8, Ordering::Release);
    terminal_switch(fiber);
}

/// The last switch out of a terminated fiber.
///
/// This frame is abandoned, so it must not own an `Arc` when it switches
/// away: a strong count held here would never be released. The owner
/// fiber's `Arc` is parked in the CURRENT thread-local instead.
fn terminal_switch(fiber: &Fiber) -> ! {
    let target = if fiber.run_in_scheduler {
        Fiber::scheduler_fiber().expect("terminal yield: no scheduling fiber on this thread")
    } else {
        Fiber::thread_main()
    };
    let target_ctx = target.ctx.get() as *const SavedContext;
    CURRENT.with(|c| *c.borrow_mut() = Some(target));

    fiber.ctx_busy.store(true, Ordering::Release);
    unsafe {
        current_arch::context_switch(fiber.ctx.get(), target_ctx, fiber.ctx_busy.as_ptr() as *mut u8);
    }
    unreachable!("terminated fiber {} resumed", fiber.id());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_resume_yield_resume() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log2 = log.clone();

        let fiber = Fiber::new(
            move || {
                log2.lock().unwrap().push(1);
                Fiber::current().yield_now();
                log2.lock().unwrap().push(3);
            },
            0,
            false,
        )
        .unwrap();

        assert_eq!(fiber.state(), FiberState::Ready);
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Ready);
        log.lock().unwrap().push(2);
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);
        assert_eq!(*log.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_reset_reuses_stack() {
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        let fiber = Fiber::new(move || { h.fetch_add(1, Ordering::Relaxed); }, 0, false).unwrap();
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);

        let h = hits.clone();
        fiber.reset(move || { h.fetch_add(10, Ordering::Relaxed); }).unwrap();
        assert_eq!(fiber.state(), FiberState::Ready);
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);
        assert_eq!(hits.load(Ordering::Relaxed), 11);
    }

    #[test]
    fn test_reset_requires_term() {
        let fiber = Fiber::new(|| {}, 0, false).unwrap();
        assert_eq!(fiber.reset(|| {}), Err(SchedError::InvalidFiberState));
    }

    #[test]
    fn test_current_is_stable_main() {
        let a = Fiber::current();
        let b = Fiber::current();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.state(), FiberState::Running);
    }

    #[test]
    fn test_fibers_nest_on_one_thread() {
        let inner_ran = Arc::new(AtomicUsize::new(0));
        let flag = inner_ran.clone();
        let outer = Fiber::new(
            move || {
                // A fiber may construct and drive another fiber.
                let f2 = flag.clone();
                let inner = Fiber::new(move || { f2.fetch_add(1, Ordering::Relaxed); }, 0, false).unwrap();
                // Careful: inner yields back to the thread main fiber, which
                // is suspended inside outer.resume(); drive it from outside
                // instead. Here we only check construction works.
                assert_eq!(inner.state(), FiberState::Ready);
                drop(inner);
            },
            0,
            false,
        )
        .unwrap();
        outer.resume();
        assert_eq!(outer.state(), FiberState::Term);
        assert_eq!(inner_ran.load(Ordering::Relaxed), 0);
    }
}
