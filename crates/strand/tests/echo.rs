//! Callback-driven echo server: a listening socket registered for READ,
//! whose callback accepts, serves one response per connection, and
//! re-registers itself.

use std::io::{Read, Write};
use std::mem;
use std::net::TcpStream;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use anyhow::{ensure, Result};
use strand::{Event, IoManager};

const RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 13\r\n\r\nHello, World!";
const CLIENTS: usize = 100;

static LISTEN_FD: AtomicI32 = AtomicI32::new(-1);

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
        unsafe { libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK) };
        let iom = IoManager::current().expect("callback runs on an io manager worker");
        iom.add_event(fd, Event::Read, Some(Box::new(move || serve_client(fd))))
            .expect("register client fd");
    }

    // Keep listening; each readiness registration is one-shot.
    let iom = IoManager::current().expect("callback runs on an io manager worker");
    iom.add_event(listen_fd, Event::Read, Some(Box::new(watch_accept)))
        .expect("re-register listener");
}

fn serve_client(fd: i32) {
    let mut buf = [0u8; 1024];
    loop {
        let n = unsafe { libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), 0) };
        if n > 0 {
            unsafe {
                libc::send(fd, RESPONSE.as_ptr().cast(), RESPONSE.len(), 0);
                libc::close(fd);
            }
            break;
        }
        if n == 0 {
            unsafe { libc::close(fd) };
            break;
        }
        let err = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        if err != libc::EAGAIN {
            unsafe { libc::close(fd) };
            break;
        }
    }
}

fn raw_listener() -> Result<(i32, u16)> {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        ensure!(fd >= 0, "socket failed");

        let yes: libc::c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &yes as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        );

        let mut addr: libc::sockaddr_in = mem::zeroed();
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_addr.s_addr = u32::from_ne_bytes([127, 0, 0, 1]);
        addr.sin_port = 0;
        let rc = libc::bind(
            fd,
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        );
        ensure!(rc == 0, "bind failed");
        ensure!(libc::listen(fd, 1024) == 0, "listen failed");
        ensure!(libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK) != -1, "fcntl failed");

        let mut bound: libc::sockaddr_in = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let rc = libc::getsockname(
            fd,
            &mut bound as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut len,
        );
        ensure!(rc == 0, "getsockname failed");
        Ok((fd, u16::from_be(bound.sin_port)))
    }
}

#[test]
fn hundred_concurrent_clients_all_get_the_response() -> Result<()> {
    let iom = IoManager::new(4, false, "echo-io");

    let (listen_fd, port) = raw_listener()?;
    LISTEN_FD.store(listen_fd, Ordering::Release);
    iom.add_event(listen_fd, Event::Read, Some(Box::new(watch_accept)))
        .expect("register listener");

    let mut clients = Vec::new();
    for _ in 0..CLIENTS {
        clients.push(std::thread::spawn(move || -> Result<Vec<u8>> {
            let mut stream = TcpStream::connect(("127.0.0.1", port))?;
            stream.set_read_timeout(Some(Duration::from_secs(10)))?;
            stream.write_all(b"X")?;
            let mut reply = Vec::new();
            stream.read_to_end(&mut reply)?;
            Ok(reply)
        }));
    }

    let mut ok = 0;
    for client in clients {
        let reply = client.join().expect("client thread panicked")?;
        ensure!(
            reply == RESPONSE,
            "bad reply: {:?}",
            String::from_utf8_lossy(&reply)
        );
        ok += 1;
    }
    ensure!(ok == CLIENTS, "{}/{} clients served", ok, CLIENTS);

    // The listener re-registers itself after each accept; let the last
    // callback settle, then drop the registration without firing it so
    // shutdown can drain.
    std::thread::sleep(Duration::from_millis(300));
    for _ in 0..10 {
        if iom.del_event(listen_fd, Event::Read) {
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    iom.stop();
    unsafe { libc::close(listen_fd) };
    Ok(())
}
