//! Fiber scheduler
//!
//! Owns a worker thread pool and a FIFO queue of runnable things: existing
//! fibers, or bare callbacks that get wrapped in a fresh (or recycled)
//! fiber. Each worker runs the scheduling loop; when the queue is empty it
//! resumes an idle fiber, whose body is supplied by the I/O manager when
//! one is attached.
//!
//! With `use_caller`, the constructing thread contributes one worker: a
//! scheduling fiber is created on it whose body is the same loop, and it is
//! driven to completion inside `stop`.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex, OnceLock, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, trace};

use strand_core::state::FiberState;

use crate::fiber::{Fiber, FiberFn};
use crate::hook;
use crate::io_manager::IoManager;
use crate::platform;

/// Target thread id meaning "any worker".
pub const ANY_THREAD: i64 = -1;

enum TaskPayload {
    Fiber(Arc<Fiber>),
    Call(FiberFn),
}

struct Task {
    payload: TaskPayload,
    /// Kernel tid of the worker this task is pinned to, or [`ANY_THREAD`].
    thread: i64,
}

thread_local! {
    static CURRENT_SCHEDULER: RefCell<Weak<Scheduler>> = const { RefCell::new(Weak::new()) };
}

/// A cooperative fiber scheduler over a pool of OS threads.
pub struct Scheduler {
    name: String,
    /// Worker count, excluding the caller thread's scheduling fiber.
    thread_count: usize,
    use_caller: bool,
    /// Kernel tid of the caller thread, -1 when `use_caller` is false.
    root_tid: i64,

    tasks: Mutex<VecDeque<Task>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    thread_ids: Mutex<Vec<i64>>,

    /// Workers currently executing a task.
    active_count: AtomicUsize,
    /// Workers currently inside their idle fiber.
    idle_count: AtomicUsize,
    stopping: AtomicBool,

    /// Scheduling fiber hosted on the caller thread (`use_caller` only).
    scheduler_fiber: Mutex<Option<Arc<Fiber>>>,

    /// Attached I/O manager supplying tickle/idle/stopping behavior.
    driver: OnceLock<Weak<IoManager>>,
}

impl Scheduler {
    /// Create a scheduler with `threads` workers.
    ///
    /// With `use_caller`, one worker slot is taken by the calling thread;
    /// `stop` must later be invoked from that same thread. At most one
    /// scheduler may be active per thread.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<Scheduler> {
        assert!(threads > 0, "scheduler needs at least one thread");
        assert!(
            Self::current().is_none(),
            "a scheduler is already active on this thread"
        );

        let mut thread_count = threads;
        let mut root_tid = -1;

        let sched = Arc::new_cyclic(|weak: &Weak<Scheduler>| {
            let scheduler_fiber = if use_caller {
                thread_count -= 1;
                root_tid = platform::current_tid();
                // Materialize this thread's main fiber before anything can
                // swap away from it.
                Fiber::current();
                let w = weak.clone();
                let fiber = Fiber::new(
                    move || {
                        if let Some(s) = w.upgrade() {
                            s.run();
                        }
                    },
                    0,
                    false,
                )
                .expect("scheduling fiber allocation");
                Some(fiber)
            } else {
                None
            };

            Scheduler {
                name: name.to_string(),
                thread_count,
                use_caller,
                root_tid,
                tasks: Mutex::new(VecDeque::new()),
                threads: Mutex::new(Vec::new()),
                thread_ids: Mutex::new(if use_caller { vec![root_tid] } else { Vec::new() }),
                active_count: AtomicUsize::new(0),
                idle_count: AtomicUsize::new(0),
                stopping: AtomicBool::new(false),
                scheduler_fiber: Mutex::new(scheduler_fiber),
                driver: OnceLock::new(),
            }
        });

        CURRENT_SCHEDULER.with(|c| *c.borrow_mut() = Arc::downgrade(&sched));
        if let Some(f) = sched.scheduler_fiber.lock().unwrap().as_ref() {
            Fiber::set_scheduler_fiber(f);
        }

        debug!("scheduler {} created, {} workers", sched.name, sched.thread_count);
        sched
    }

    /// The scheduler owning the current thread, if any.
    pub fn current() -> Option<Arc<Scheduler>> {
        CURRENT_SCHEDULER.with(|c| c.borrow().upgrade())
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kernel tids of all scheduling threads, caller thread first when
    /// `use_caller`. Complete once `start` has returned.
    pub fn thread_ids(&self) -> Vec<i64> {
        self.thread_ids.lock().unwrap().clone()
    }

    /// Attach the I/O manager that supplies tickle/idle/stopping behavior.
    pub(crate) fn set_driver(&self, driver: Weak<IoManager>) {
        let _ = self.driver.set(driver);
    }

    pub(crate) fn driver(&self) -> Option<Arc<IoManager>> {
        self.driver.get().and_then(|w| w.upgrade())
    }

    /// Spawn the worker threads.
    ///
    /// Returns once every worker has published its thread id.
    pub fn start(self: &Arc<Self>) {
        let mut handles = self.threads.lock().unwrap();
        if self.stopping.load(Ordering::Acquire) {
            debug!("scheduler {} start() after stop, ignored", self.name);
            return;
        }
        assert!(handles.is_empty(), "scheduler {} started twice", self.name);

        let (tx, rx) = mpsc::channel();
        for i in 0..self.thread_count {
            let me = Arc::clone(self);
            let tx = tx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{}-{}", self.name, i))
                .spawn(move || {
                    let _ = tx.send(platform::current_tid());
                    drop(tx);
                    me.run();
                })
                .expect("failed to spawn scheduler worker");
            handles.push(handle);
        }
        drop(tx);

        let mut ids = self.thread_ids.lock().unwrap();
        for _ in 0..self.thread_count {
            if let Ok(tid) = rx.recv() {
                ids.push(tid);
            }
        }
    }

    /// Queue a callback to run on a fiber.
    ///
    /// `thread` pins the task to a specific scheduling thread;
    /// [`ANY_THREAD`] lets any worker take it.
    pub fn schedule<F>(&self, cb: F, thread: i64)
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Task {
            payload: TaskPayload::Call(Box::new(cb)),
            thread,
        });
    }

    /// Queue an existing fiber for resumption.
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>, thread: i64) {
        self.submit(Task {
            payload: TaskPayload::Fiber(fiber),
            thread,
        });
    }

    fn submit(&self, task: Task) {
        let was_empty = {
            let mut q = self.tasks.lock().unwrap();
            let was_empty = q.is_empty();
            q.push_back(task);
            was_empty
        };
        if was_empty {
            self.tickle();
        }
    }

    /// Wake an idle worker. Delegates to the attached I/O manager; a bare
    /// scheduler has no blocked waiters to wake.
    fn tickle(&self) {
        if let Some(iom) = self.driver() {
            iom.tickle();
        } else {
            trace!("scheduler {} tickle (noop)", self.name);
        }
    }

    /// Whether the scheduler should wind down, including driver state.
    fn stopping(&self) -> bool {
        if let Some(iom) = self.driver() {
            iom.stopping()
        } else {
            self.base_stopping()
        }
    }

    /// Stop was requested, the queue is drained, and no worker is mid-task.
    pub(crate) fn base_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
            && self.tasks.lock().unwrap().is_empty()
            && self.active_count.load(Ordering::Acquire) == 0
    }

    pub(crate) fn has_idle_threads(&self) -> bool {
        self.idle_count.load(Ordering::Acquire) > 0
    }

    /// Request shutdown and join every worker.
    ///
    /// With `use_caller` this must run on the constructing thread; the
    /// caller-hosted scheduling fiber drains remaining work inline.
    pub fn stop(self: &Arc<Self>) {
        if self.stopping() {
            return;
        }
        self.stopping.store(true, Ordering::Release);

        if self.use_caller {
            assert_eq!(
                platform::current_tid(),
                self.root_tid,
                "stop of a use_caller scheduler must run on the caller thread"
            );
        }

        for _ in 0..self.thread_count {
            self.tickle();
        }
        let scheduler_fiber = self.scheduler_fiber.lock().unwrap().clone();
        if scheduler_fiber.is_some() {
            self.tickle();
        }

        if let Some(fiber) = scheduler_fiber {
            fiber.resume();
            debug!("scheduler {} caller fiber finished", self.name);
        }

        let handles: Vec<_> = self.threads.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        debug!("scheduler {} stopped", self.name);
    }

    /// The scheduling loop. Body of every worker thread and of the
    /// caller-hosted scheduling fiber.
    fn run(self: Arc<Self>) {
        hook::set_hook_enabled(true);
        CURRENT_SCHEDULER.with(|c| *c.borrow_mut() = Arc::downgrade(&self));

        let tid = platform::current_tid();
        let main = Fiber::current();
        if tid != self.root_tid {
            // Workers schedule out of their main fiber.
            Fiber::set_scheduler_fiber(&main);
        }

        let me = Arc::downgrade(&self);
        let idle_fiber = Fiber::new(
            move || {
                if let Some(s) = me.upgrade() {
                    s.idle_entry();
                }
            },
            0,
            true,
        )
        .expect("idle fiber allocation");

        // Terminated callback fiber kept around for stack reuse.
        let mut recycled: Option<Arc<Fiber>> = None;

        debug!("scheduler {} loop starting on tid {}", self.name, tid);
        loop {
            let mut task = None;
            let mut tickle_me = false;
            {
                let mut q = self.tasks.lock().unwrap();
                let mut i = 0;
                while i < q.len() {
                    let pinned_elsewhere = {
                        let t = &q[i];
                        t.thread != ANY_THREAD && t.thread != tid
                    };
                    if pinned_elsewhere {
                        tickle_me = true;
                        i += 1;
                        continue;
                    }
                    task = q.remove(i);
                    self.active_count.fetch_add(1, Ordering::AcqRel);
                    break;
                }
                if task.is_none() {
                    tickle_me = tickle_me || !q.is_empty();
                }
            }

            if tickle_me {
                self.tickle();
            }

            match task.map(|t| t.payload) {
                Some(TaskPayload::Fiber(fiber)) => {
                    if fiber.state() != FiberState::Term {
                        fiber.resume();
                    }
                    self.active_count.fetch_sub(1, Ordering::AcqRel);
                }
                Some(TaskPayload::Call(cb)) => {
                    let fiber = match recycled.take() {
                        Some(f) if f.state() == FiberState::Term => {
                            f.reset(cb).expect("recycled fiber reset");
                            f
                        }
                        _ => Fiber::new(cb, 0, true).expect("callback fiber allocation"),
                    };
                    fiber.resume();
                    if fiber.state() == FiberState::Term {
                        recycled = Some(fiber);
                    }
                    self.active_count.fetch_sub(1, Ordering::AcqRel);
                }
                None => {
                    if idle_fiber.state() == FiberState::Term {
                        break;
                    }
                    self.idle_count.fetch_add(1, Ordering::AcqRel);
                    idle_fiber.resume();
                    self.idle_count.fetch_sub(1, Ordering::AcqRel);
                }
            }
        }
        debug!("scheduler {} loop ending on tid {}", self.name, tid);
    }

    /// Body of the idle fiber.
    fn idle_entry(&self) {
        if let Some(iom) = self.driver() {
            iom.idle();
        } else {
            self.default_idle();
        }
    }

    /// Idle behavior without an I/O manager: nap briefly, then yield so the
    /// worker can rescan the queue.
    fn default_idle(&self) {
        while !self.base_stopping() {
            std::thread::sleep(Duration::from_millis(10));
            Fiber::current().yield_now();
        }
    }
}
