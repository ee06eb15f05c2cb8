//! # strand echo server
//!
//! A listening socket registered for READ readiness with a callback that
//! accepts one connection, hands the client fd to its own READ callback,
//! and re-registers itself. Client handlers are plain blocking-style code;
//! the runtime parks them on readiness under the hood.
//!
//! ## Usage
//!
//!     cargo run -p strand-echo --release -- [--port 8080] [--workers 4]
//!
//! ## Benchmark
//!
//!     wrk -t4 -c100 -d10s http://127.0.0.1:8080/

use std::mem;
use std::net::SocketAddr;
use std::os::fd::IntoRawFd;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use log::info;
use socket2::{Domain, Socket, Type};
use strand::{Event, IoManager};

const RECV_BUF_SIZE: usize = 4096;

static LISTEN_FD: AtomicI32 = AtomicI32::new(-1);
static TOTAL_CONNECTIONS: AtomicU64 = AtomicU64::new(0);
static TOTAL_REQUESTS: AtomicU64 = AtomicU64::new(0);

// ── HTTP response ──

const BODY: &[u8] = b"Hello, World!";

fn make_response() -> Vec<u8> {
    format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n",
        BODY.len()
    )
    .into_bytes()
    .into_iter()
    .chain(BODY.iter().copied())
    .collect()
}

// ── Accept loop ──

/// Accept one pending connection and re-register the listener. Readiness
/// registrations are one-shot, so the callback re-arms itself each time.
fn watch_accept() {
    let listen_fd = LISTEN_FD.load(Ordering::Acquire);
    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

    let fd = unsafe {
        libc::accept(
            listen_fd,
            &mut addr as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut len,
        )
    };
    if fd >= 0 {
        TOTAL_CONNECTIONS.fetch_add(1, Ordering::Relaxed);
        let iom = IoManager::current().expect("accept callback off a worker");
        if iom
            .add_event(fd, Event::Read, Some(Box::new(move || serve_client(fd))))
            .is_err()
        {
            unsafe { libc::close(fd) };
        }
    }

    let iom = IoManager::current().expect("accept callback off a worker");
    iom.add_event(listen_fd, Event::Read, Some(Box::new(watch_accept)))
        .expect("listener re-registration");
}

/// One response per connection, blocking style.
fn serve_client(fd: i32) {
    let response = make_response();
    let mut buf = [0u8; RECV_BUF_SIZE];

    let n = unsafe { libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), 0) };
    if n > 0 {
        TOTAL_REQUESTS.fetch_add(1, Ordering::Relaxed);
        unsafe { libc::send(fd, response.as_ptr().cast(), response.len(), 0) };
    }
    unsafe { libc::close(fd) };
}

// ── Setup ──

fn parse_args() -> (u16, usize) {
    let mut port = 8080u16;
    let mut workers = 4usize;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--port" => {
                port = args
                    .next()
                    .and_then(|v| v.parse().ok())
                    .expect("--port needs a number");
            }
            "--workers" => {
                workers = args
                    .next()
                    .and_then(|v| v.parse().ok())
                    .expect("--workers needs a number");
            }
            other => {
                eprintln!("unknown argument: {}", other);
                eprintln!("usage: strand-echo [--port 8080] [--workers 4]");
                std::process::exit(2);
            }
        }
    }
    (port, workers)
}

fn listener_fd(port: u16) -> Result<i32> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    let addr: SocketAddr = format!("0.0.0.0:{}", port)
        .parse()
        .context("bad listen address")?;
    socket.bind(&addr.into()).context("bind")?;
    socket.listen(1024).context("listen")?;
    socket.set_nonblocking(true)?;
    Ok(socket.into_raw_fd())
}

fn main() -> Result<()> {
    let (port, workers) = parse_args();

    let iom = IoManager::new(workers, false, "echo");
    let fd = listener_fd(port)?;
    LISTEN_FD.store(fd, Ordering::Release);
    iom.add_event(fd, Event::Read, Some(Box::new(watch_accept)))?;

    info!("echo server listening on port {} with {} workers", port, workers);
    loop {
        std::thread::sleep(Duration::from_secs(10));
        info!(
            "connections: {} requests: {}",
            TOTAL_CONNECTIONS.load(Ordering::Relaxed),
            TOTAL_REQUESTS.load(Ordering::Relaxed),
        );
    }
}
