//! connect_with_timeout against a listener whose accept queue is full.

use std::mem;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{ensure, Result};
use strand::{connect_with_timeout, IoManager, ANY_THREAD};

fn loopback_addr(port: u16) -> libc::sockaddr_in {
    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_addr.s_addr = u32::from_ne_bytes([127, 0, 0, 1]);
    addr.sin_port = port.to_be();
    addr
}

/// Listener with backlog 1 that is never accepted from; pre-filling the
/// queue makes later handshakes hang, which is as close to an unreachable
/// address as loopback gets.
fn saturated_listener() -> Result<(i32, u16, Vec<i32>)> {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        ensure!(fd >= 0);

        let mut addr = loopback_addr(0);
        let rc = libc::bind(
            fd,
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        );
        ensure!(rc == 0, "bind failed");
        ensure!(libc::listen(fd, 1) == 0, "listen failed");

        let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        ensure!(
            libc::getsockname(
                fd,
                &mut addr as *mut libc::sockaddr_in as *mut libc::sockaddr,
                &mut len,
            ) == 0
        );
        let port = u16::from_be(addr.sin_port);

        // Raw non-blocking connects from the test thread fill the queue.
        let mut plugs = Vec::new();
        for _ in 0..8 {
            let s = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
            ensure!(s >= 0);
            libc::fcntl(s, libc::F_SETFL, libc::O_NONBLOCK);
            let target = loopback_addr(port);
            libc::connect(
                s,
                &target as *const libc::sockaddr_in as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            );
            plugs.push(s);
        }
        std::thread::sleep(Duration::from_millis(100));
        Ok((fd, port, plugs))
    }
}

#[test]
fn connect_times_out_against_full_backlog() -> Result<()> {
    let (listen_fd, port, plugs) = saturated_listener()?;

    let iom = IoManager::new(1, false, "connect-io");

    let result = Arc::new(AtomicI32::new(0));
    let err = Arc::new(AtomicI32::new(0));
    let elapsed_ms = Arc::new(AtomicI64::new(-1));
    let done = Arc::new(AtomicUsize::new(0));

    let (r, e, el, d) = (result.clone(), err.clone(), elapsed_ms.clone(), done.clone());
    iom.scheduler().schedule(
        move || unsafe {
            let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
            assert!(fd >= 0);
            let addr = loopback_addr(port);

            let t0 = Instant::now();
            let rc = connect_with_timeout(
                fd,
                &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                500,
            );
            el.store(t0.elapsed().as_millis() as i64, Ordering::Release);
            r.store(rc, Ordering::Release);
            e.store(
                std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
                Ordering::Release,
            );
            libc::close(fd);
            d.fetch_add(1, Ordering::AcqRel);
        },
        ANY_THREAD,
    );

    let deadline = Instant::now() + Duration::from_secs(5);
    while done.load(Ordering::Acquire) < 1 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    iom.stop();

    for plug in plugs {
        unsafe { libc::close(plug) };
    }
    unsafe { libc::close(listen_fd) };

    ensure!(done.load(Ordering::Acquire) == 1, "connect never returned");
    ensure!(result.load(Ordering::Acquire) == -1, "connect unexpectedly succeeded");
    ensure!(
        err.load(Ordering::Acquire) == libc::ETIMEDOUT,
        "errno {}",
        err.load(Ordering::Acquire)
    );
    let elapsed = elapsed_ms.load(Ordering::Acquire);
    ensure!(elapsed >= 500, "timed out early: {}ms", elapsed);
    ensure!(elapsed < 1500, "timed out late: {}ms", elapsed);
    Ok(())
}
