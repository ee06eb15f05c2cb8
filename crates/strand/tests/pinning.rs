//! Task pinning: a task with a target thread id only runs there.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{ensure, Result};
use strand::{IoManager, ANY_THREAD};

fn gettid() -> i64 {
    unsafe { libc::syscall(libc::SYS_gettid) as i64 }
}

#[test]
fn pinned_tasks_stay_on_their_worker() -> Result<()> {
    let iom = IoManager::new(4, false, "pin-io");
    let worker_ids = iom.scheduler().thread_ids();
    ensure!(worker_ids.len() == 4, "expected 4 workers");
    let pinned_to = worker_ids[2];

    let done = Arc::new(AtomicUsize::new(0));
    let pinned_tids = Arc::new(Mutex::new(Vec::new()));
    let unpinned_tids = Arc::new(Mutex::new(Vec::new()));

    for _ in 0..100 {
        let d = done.clone();
        let seen = pinned_tids.clone();
        iom.scheduler().schedule(
            move || {
                seen.lock().unwrap().push(gettid());
                d.fetch_add(1, Ordering::AcqRel);
            },
            pinned_to,
        );

        let d = done.clone();
        let seen = unpinned_tids.clone();
        iom.scheduler().schedule(
            move || {
                seen.lock().unwrap().push(gettid());
                d.fetch_add(1, Ordering::AcqRel);
            },
            ANY_THREAD,
        );
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    while done.load(Ordering::Acquire) < 200 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    iom.stop();

    ensure!(done.load(Ordering::Acquire) == 200, "not all tasks completed");

    let pinned = pinned_tids.lock().unwrap();
    ensure!(pinned.len() == 100);
    ensure!(
        pinned.iter().all(|tid| *tid == pinned_to),
        "pinned task escaped its worker"
    );

    // Unpinned tasks run on scheduler threads only.
    let workers: HashSet<i64> = worker_ids.iter().copied().collect();
    let unpinned = unpinned_tids.lock().unwrap();
    ensure!(unpinned.len() == 100);
    ensure!(unpinned.iter().all(|tid| workers.contains(tid)));
    Ok(())
}
