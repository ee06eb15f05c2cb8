//! Timer manager
//!
//! A min-ordered set of absolute deadlines (monotonic milliseconds) with
//! optional repeat periods and optional weak conditions. The I/O manager
//! asks for the soonest deadline to bound its reactor wait and harvests
//! expired callbacks after each poll.
//!
//! Cancellation is lazy about the callback: cancelling clears the stored
//! callable, so a handle that already left the set is still inert.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::platform::now_ms;

/// Callback invoked when a timer fires. Shared so recurring timers can
/// fire repeatedly.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

/// Clock regressions larger than this are treated as a rollback of the
/// monotonic source; all deadlines are then considered expired.
const ROLLOVER_WINDOW_MS: u64 = 60 * 60 * 1000;

/// Cancellation ticket used as the weak condition of I/O timeout timers.
///
/// The timer holds only a `Weak` reference: once the operation that created
/// the ticket completes and drops it, the timer silently becomes a no-op.
pub struct TimerCondition {
    code: AtomicI32,
}

impl TimerCondition {
    pub fn new() -> Self {
        TimerCondition {
            code: AtomicI32::new(0),
        }
    }

    /// Mark the condition cancelled with an errno-style code, first writer
    /// wins.
    pub fn cancel_with(&self, code: i32) -> bool {
        self.code
            .compare_exchange(0, code, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    pub fn code(&self) -> i32 {
        self.code.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.code() != 0
    }
}

impl Default for TimerCondition {
    fn default() -> Self {
        Self::new()
    }
}

/// A scheduled timer. Shared between the manager's set and any holder that
/// intends to cancel it.
pub struct Timer {
    seq: u64,
    deadline_ms: AtomicU64,
    /// 0 = one-shot.
    period_ms: u64,
    cb: Mutex<Option<TimerCallback>>,
    condition: Option<Weak<TimerCondition>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TimerKey {
    deadline: u64,
    seq: u64,
}

/// Min-ordered timer set.
pub struct TimerManager {
    set: RwLock<BTreeMap<TimerKey, Arc<Timer>>>,
    seq: AtomicU64,
    last_now: AtomicU64,
}

impl TimerManager {
    pub fn new() -> Self {
        TimerManager {
            set: RwLock::new(BTreeMap::new()),
            seq: AtomicU64::new(0),
            last_now: AtomicU64::new(now_ms()),
        }
    }

    /// Insert a timer firing `ms` from now.
    ///
    /// Returns the timer and whether it became the soonest deadline, in
    /// which case a blocked reactor wait must be re-armed.
    pub fn add_timer(&self, ms: u64, cb: TimerCallback, recurring: bool) -> (Arc<Timer>, bool) {
        self.insert(ms, cb, recurring, None)
    }

    /// Insert a timer that only fires while `condition` still resolves to a
    /// live, non-cancelled referent.
    pub fn add_condition_timer(
        &self,
        ms: u64,
        cb: TimerCallback,
        condition: Weak<TimerCondition>,
        recurring: bool,
    ) -> (Arc<Timer>, bool) {
        self.insert(ms, cb, recurring, Some(condition))
    }

    fn insert(
        &self,
        ms: u64,
        cb: TimerCallback,
        recurring: bool,
        condition: Option<Weak<TimerCondition>>,
    ) -> (Arc<Timer>, bool) {
        let deadline = now_ms().saturating_add(ms);
        let timer = Arc::new(Timer {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            deadline_ms: AtomicU64::new(deadline),
            period_ms: if recurring { ms.max(1) } else { 0 },
            cb: Mutex::new(Some(cb)),
            condition,
        });

        let key = TimerKey {
            deadline,
            seq: timer.seq,
        };
        let mut set = self.set.write().unwrap();
        set.insert(key, timer.clone());
        let at_front = set.first_key_value().map(|(k, _)| *k) == Some(key);
        (timer, at_front)
    }

    /// Cancel a timer. Clears the callable, so this is safe to call after
    /// the timer fired; returns false in that case on the second call.
    pub fn cancel(&self, timer: &Arc<Timer>) -> bool {
        let mut set = self.set.write().unwrap();
        let had_cb = timer.cb.lock().unwrap().take().is_some();
        let key = TimerKey {
            deadline: timer.deadline_ms.load(Ordering::Acquire),
            seq: timer.seq,
        };
        set.remove(&key);
        had_cb
    }

    /// Milliseconds until the soonest deadline; `None` when no timers
    /// exist, 0 when one is already due (or the clock rolled back).
    pub fn next_timeout(&self) -> Option<u64> {
        let set = self.set.read().unwrap();
        let (key, _) = set.first_key_value()?;
        let now = now_ms();
        if self.rolled_over(now) || key.deadline <= now {
            Some(0)
        } else {
            Some(key.deadline - now)
        }
    }

    pub fn has_timers(&self) -> bool {
        !self.set.read().unwrap().is_empty()
    }

    /// Pop every timer whose deadline has passed and return the callbacks
    /// to run. Recurring timers are re-armed at `now + period`, so a stall
    /// does not produce a catch-up burst. Cancelled and condition-dead
    /// timers are discarded silently.
    pub fn take_expired(&self) -> Vec<TimerCallback> {
        let now = now_ms();
        let rollover = self.rolled_over(now);
        let mut due = Vec::new();

        let mut set = self.set.write().unwrap();
        while let Some((key, _)) = set.first_key_value() {
            if !rollover && key.deadline > now {
                break;
            }
            let key = *key;
            let timer = set.remove(&key).expect("first key vanished");

            let cb = match timer.cb.lock().unwrap().clone() {
                Some(cb) => cb,
                None => continue,
            };

            if let Some(cond) = &timer.condition {
                let live = cond.upgrade().map(|c| !c.is_cancelled()).unwrap_or(false);
                if !live {
                    continue;
                }
            }

            if timer.period_ms > 0 {
                let next = now + timer.period_ms;
                timer.deadline_ms.store(next, Ordering::Release);
                set.insert(
                    TimerKey {
                        deadline: next,
                        seq: timer.seq,
                    },
                    timer.clone(),
                );
            }

            due.push(cb);
        }
        due
    }

    fn rolled_over(&self, now: u64) -> bool {
        let prev = self.last_now.swap(now, Ordering::AcqRel);
        now < prev && prev - now > ROLLOVER_WINDOW_MS
    }

    #[cfg(test)]
    fn force_last_now(&self, v: u64) {
        self.last_now.store(v, Ordering::Release);
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn counting_cb(counter: &Arc<AtomicUsize>) -> TimerCallback {
        let c = counter.clone();
        Arc::new(move || {
            c.fetch_add(1, Ordering::Relaxed);
        })
    }

    #[test]
    fn test_expiry_in_deadline_order() {
        let mgr = TimerManager::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (ms, tag) in [(30u64, 3), (10, 1), (20, 2)] {
            let o = order.clone();
            mgr.add_timer(ms, Arc::new(move || o.lock().unwrap().push(tag)), false);
        }
        assert!(mgr.next_timeout().unwrap() <= 10);

        std::thread::sleep(Duration::from_millis(50));
        for cb in mgr.take_expired() {
            cb();
        }
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
        assert!(!mgr.has_timers());
        assert_eq!(mgr.next_timeout(), None);
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let (timer, at_front) = mgr.add_timer(5, counting_cb(&hits), false);
        assert!(at_front);

        assert!(mgr.cancel(&timer));
        assert!(!mgr.cancel(&timer));

        std::thread::sleep(Duration::from_millis(10));
        assert!(mgr.take_expired().is_empty());
        assert_eq!(hits.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_recurring_rearms_from_now() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        mgr.add_timer(10, counting_cb(&hits), true);

        std::thread::sleep(Duration::from_millis(15));
        let first = mgr.take_expired();
        assert_eq!(first.len(), 1);
        // Re-armed relative to harvest time, still pending.
        assert!(mgr.has_timers());
        assert!(mgr.next_timeout().unwrap() <= 10);

        std::thread::sleep(Duration::from_millis(15));
        assert_eq!(mgr.take_expired().len(), 1);
    }

    #[test]
    fn test_condition_timer_dies_with_referent() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let cond = Arc::new(TimerCondition::new());
        mgr.add_condition_timer(5, counting_cb(&hits), Arc::downgrade(&cond), false);
        drop(cond);

        std::thread::sleep(Duration::from_millis(10));
        assert!(mgr.take_expired().is_empty());
    }

    #[test]
    fn test_condition_timer_skipped_when_cancelled() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let cond = Arc::new(TimerCondition::new());
        mgr.add_condition_timer(5, counting_cb(&hits), Arc::downgrade(&cond), false);
        assert!(cond.cancel_with(libc_etimedout()));
        assert!(!cond.cancel_with(1));
        assert_eq!(cond.code(), libc_etimedout());

        std::thread::sleep(Duration::from_millis(10));
        assert!(mgr.take_expired().is_empty());
    }

    fn libc_etimedout() -> i32 {
        110
    }

    #[test]
    fn test_clock_rollback_expires_everything() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        mgr.add_timer(1_000_000, counting_cb(&hits), false);

        // Pretend the previous observation was far in the future.
        mgr.force_last_now(now_ms() + 2 * ROLLOVER_WINDOW_MS);
        let due = mgr.take_expired();
        assert_eq!(due.len(), 1);
    }

    #[test]
    fn test_front_insert_flag() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let (_t1, front1) = mgr.add_timer(1000, counting_cb(&hits), false);
        let (_t2, front2) = mgr.add_timer(2000, counting_cb(&hits), false);
        let (_t3, front3) = mgr.add_timer(10, counting_cb(&hits), false);
        assert!(front1);
        assert!(!front2);
        assert!(front3);
    }
}
