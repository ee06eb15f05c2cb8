//! Syscall hook layer
//!
//! Replaces the process's resolution of a fixed set of POSIX symbols with
//! fiber-aware wrappers. Worker threads enable the per-thread hook flag;
//! on every other thread each wrapper is a straight pass-through to the
//! original symbol.
//!
//! The shared I/O template: try the raw call once (retrying `EINTR`); on
//! `EAGAIN` register readiness interest plus an optional condition timer
//! keyed to the fd's configured timeout, yield the fiber, and on resume
//! either surface `ETIMEDOUT` or retry.

pub mod origin;

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use libc::{c_int, c_long, c_uint, c_ulong, c_void, size_t, socklen_t, ssize_t};
use log::warn;

use strand_core::event::Event;

use crate::config::runtime_config;
use crate::fd::{fd_manager, TimeoutKind, NO_TIMEOUT};
use crate::fiber::Fiber;
use crate::io_manager::IoManager;
use crate::scheduler::ANY_THREAD;
use crate::timer::TimerCondition;

// Not exposed by the vendored `libc` crate on this target; values match
// glibc's `bits/fcntl-linux.h` (and upstream `libc` on targets that do
// provide them).
const F_SETSIG: c_int = 10;
const F_GETSIG: c_int = 11;
const F_SETOWN_EX: c_int = 15;
const F_GETOWN_EX: c_int = 16;

thread_local! {
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };
}

/// Whether hooked syscalls on this thread suspend fibers.
#[inline]
pub fn hook_enabled() -> bool {
    HOOK_ENABLED.with(|c| c.get())
}

/// Enable or disable fiber-aware syscalls for this thread. Scheduler
/// workers enable this on entry.
#[inline]
pub fn set_hook_enabled(enabled: bool) {
    HOOK_ENABLED.with(|c| c.set(enabled));
}

#[inline]
unsafe fn errno() -> c_int {
    *libc::__errno_location()
}

#[inline]
unsafe fn set_errno(v: c_int) {
    *libc::__errno_location() = v;
}

fn connect_timeout_cell() -> &'static AtomicU64 {
    static CELL: OnceLock<AtomicU64> = OnceLock::new();
    CELL.get_or_init(|| {
        AtomicU64::new(runtime_config().connect_timeout_ms.unwrap_or(NO_TIMEOUT))
    })
}

/// Override the default timeout applied by the hooked `connect`.
pub fn set_connect_timeout(ms: Option<u64>) {
    connect_timeout_cell().store(ms.unwrap_or(NO_TIMEOUT), Ordering::Release);
}

/// The shared I/O template for read- and write-like calls.
///
/// # Safety
///
/// `raw` must wrap the original syscall with pointers valid for its whole
/// lifetime, including retries after the fiber is resumed.
unsafe fn do_io<F>(fd: c_int, name: &str, event: Event, kind: TimeoutKind, raw: F) -> ssize_t
where
    F: Fn() -> ssize_t,
{
    if !hook_enabled() {
        return raw();
    }
    let Some(ctx) = fd_manager().get(fd, false) else {
        return raw();
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    // The user owns non-blockingness on non-sockets and opted-in fds.
    if !ctx.is_socket() || ctx.user_nonblock() {
        return raw();
    }

    let timeout = ctx.timeout(kind);
    let ticket = Arc::new(TimerCondition::new());

    loop {
        // A concurrent close marks the context before waking us; checking
        // here keeps the retry from re-parking on a dying fd.
        if ctx.is_closed() {
            set_errno(libc::EBADF);
            return -1;
        }
        let mut n = raw();
        while n == -1 && errno() == libc::EINTR {
            n = raw();
        }
        if !(n == -1 && errno() == libc::EAGAIN) {
            return n;
        }

        let Some(iom) = IoManager::current() else {
            // Hooked thread without an I/O manager: nothing to park on.
            return n;
        };

        let timer = if timeout != NO_TIMEOUT {
            let weak_ticket = Arc::downgrade(&ticket);
            let weak_iom = Arc::downgrade(&iom);
            Some(iom.add_condition_timer(
                timeout,
                Arc::new(move || {
                    let Some(ticket) = weak_ticket.upgrade() else {
                        return;
                    };
                    if !ticket.cancel_with(libc::ETIMEDOUT) {
                        return;
                    }
                    if let Some(iom) = weak_iom.upgrade() {
                        iom.cancel_event(fd, event);
                    }
                }),
                Arc::downgrade(&ticket),
                false,
            ))
        } else {
            None
        };

        if let Err(e) = iom.add_event(fd, event, None) {
            warn!("{}: add_event({}, {:?}) failed: {}", name, fd, event, e);
            if let Some(timer) = &timer {
                iom.cancel_timer(timer);
            }
            return -1;
        }

        Fiber::current().yield_now();
        // Resumed by readiness or by the timeout, never both.
        if let Some(timer) = &timer {
            iom.cancel_timer(timer);
        }
        if ticket.code() == libc::ETIMEDOUT {
            set_errno(libc::ETIMEDOUT);
            return -1;
        }
    }
}

/// `connect` with an explicit timeout in milliseconds; [`NO_TIMEOUT`]
/// disables the deadline.
///
/// # Safety
///
/// `addr` must point to a valid socket address of length `addrlen`.
pub unsafe fn connect_with_timeout(
    fd: c_int,
    addr: *const libc::sockaddr,
    addrlen: socklen_t,
    timeout_ms: u64,
) -> c_int {
    if !hook_enabled() {
        return origin::connect(fd, addr, addrlen);
    }
    let Some(ctx) = fd_manager().get(fd, false) else {
        set_errno(libc::EBADF);
        return -1;
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return origin::connect(fd, addr, addrlen);
    }

    let n = origin::connect(fd, addr, addrlen);
    if n == 0 {
        return 0;
    }
    if n != -1 || errno() != libc::EINPROGRESS {
        return n;
    }

    let Some(iom) = IoManager::current() else {
        return n;
    };
    let ticket = Arc::new(TimerCondition::new());
    let timer = if timeout_ms != NO_TIMEOUT {
        let weak_ticket = Arc::downgrade(&ticket);
        let weak_iom = Arc::downgrade(&iom);
        Some(iom.add_condition_timer(
            timeout_ms,
            Arc::new(move || {
                let Some(ticket) = weak_ticket.upgrade() else {
                    return;
                };
                if !ticket.cancel_with(libc::ETIMEDOUT) {
                    return;
                }
                if let Some(iom) = weak_iom.upgrade() {
                    iom.cancel_event(fd, Event::Write);
                }
            }),
            Arc::downgrade(&ticket),
            false,
        ))
    } else {
        None
    };

    match iom.add_event(fd, Event::Write, None) {
        Ok(()) => {
            Fiber::current().yield_now();
            if let Some(timer) = &timer {
                iom.cancel_timer(timer);
            }
            if ticket.is_cancelled() {
                set_errno(ticket.code());
                return -1;
            }
        }
        Err(e) => {
            if let Some(timer) = &timer {
                iom.cancel_timer(timer);
            }
            warn!("connect: add_event({}, WRITE) failed: {}", fd, e);
        }
    }

    // The connection finished one way or the other; ask the kernel which.
    let mut err: c_int = 0;
    let mut len = std::mem::size_of::<c_int>() as socklen_t;
    if origin::getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut err as *mut c_int as *mut c_void,
        &mut len,
    ) == -1
    {
        return -1;
    }
    if err == 0 {
        0
    } else {
        set_errno(err);
        -1
    }
}

// ── Hooked symbols ──

#[unsafe(no_mangle)]
pub unsafe extern "C" fn sleep(seconds: c_uint) -> c_uint {
    if !hook_enabled() {
        return origin::sleep(seconds);
    }
    let Some(iom) = IoManager::current() else {
        return origin::sleep(seconds);
    };

    let fiber = Fiber::current();
    let parked = fiber.clone();
    let scheduler = Arc::downgrade(iom.scheduler());
    iom.add_timer(
        seconds as u64 * 1000,
        Arc::new(move || {
            if let Some(s) = scheduler.upgrade() {
                s.schedule_fiber(parked.clone(), ANY_THREAD);
            }
        }),
        false,
    );
    fiber.yield_now();
    0
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn usleep(usec: c_uint) -> c_int {
    if !hook_enabled() {
        return origin::usleep(usec);
    }
    let Some(iom) = IoManager::current() else {
        return origin::usleep(usec);
    };

    let fiber = Fiber::current();
    let parked = fiber.clone();
    let scheduler = Arc::downgrade(iom.scheduler());
    iom.add_timer(
        usec as u64 / 1000,
        Arc::new(move || {
            if let Some(s) = scheduler.upgrade() {
                s.schedule_fiber(parked.clone(), ANY_THREAD);
            }
        }),
        false,
    );
    fiber.yield_now();
    0
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn nanosleep(req: *const libc::timespec, rem: *mut libc::timespec) -> c_int {
    if !hook_enabled() {
        return origin::nanosleep(req, rem);
    }
    if req.is_null() {
        set_errno(libc::EINVAL);
        return -1;
    }
    let Some(iom) = IoManager::current() else {
        return origin::nanosleep(req, rem);
    };

    let ms = (*req).tv_sec as u64 * 1000 + (*req).tv_nsec as u64 / 1_000_000;
    let fiber = Fiber::current();
    let parked = fiber.clone();
    let scheduler = Arc::downgrade(iom.scheduler());
    iom.add_timer(
        ms,
        Arc::new(move || {
            if let Some(s) = scheduler.upgrade() {
                s.schedule_fiber(parked.clone(), ANY_THREAD);
            }
        }),
        false,
    );
    fiber.yield_now();
    0
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    if !hook_enabled() {
        return origin::socket(domain, ty, protocol);
    }
    let fd = origin::socket(domain, ty, protocol);
    if fd == -1 {
        warn!("socket({}, {}, {}) failed: errno {}", domain, ty, protocol, errno());
        return fd;
    }
    fd_manager().get(fd, true);
    fd
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn connect(fd: c_int, addr: *const libc::sockaddr, addrlen: socklen_t) -> c_int {
    connect_with_timeout(fd, addr, addrlen, connect_timeout_cell().load(Ordering::Acquire))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn accept(fd: c_int, addr: *mut libc::sockaddr, addrlen: *mut socklen_t) -> c_int {
    let n = do_io(fd, "accept", Event::Read, TimeoutKind::Recv, || {
        origin::accept(fd, addr, addrlen) as ssize_t
    });
    let new_fd = n as c_int;
    if new_fd >= 0 {
        fd_manager().get(new_fd, true);
    }
    new_fd
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    do_io(fd, "read", Event::Read, TimeoutKind::Recv, || {
        origin::read(fd, buf, count)
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn readv(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> ssize_t {
    do_io(fd, "readv", Event::Read, TimeoutKind::Recv, || {
        origin::readv(fd, iov, iovcnt)
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn recv(fd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(fd, "recv", Event::Read, TimeoutKind::Recv, || {
        origin::recv(fd, buf, len, flags)
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn recvfrom(
    fd: c_int,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    src_addr: *mut libc::sockaddr,
    addrlen: *mut socklen_t,
) -> ssize_t {
    do_io(fd, "recvfrom", Event::Read, TimeoutKind::Recv, || {
        origin::recvfrom(fd, buf, len, flags, src_addr, addrlen)
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn recvmsg(fd: c_int, msg: *mut libc::msghdr, flags: c_int) -> ssize_t {
    do_io(fd, "recvmsg", Event::Read, TimeoutKind::Recv, || {
        origin::recvmsg(fd, msg, flags)
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    do_io(fd, "write", Event::Write, TimeoutKind::Send, || {
        origin::write(fd, buf, count)
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn writev(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> ssize_t {
    do_io(fd, "writev", Event::Write, TimeoutKind::Send, || {
        origin::writev(fd, iov, iovcnt)
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn send(fd: c_int, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(fd, "send", Event::Write, TimeoutKind::Send, || {
        origin::send(fd, buf, len, flags)
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn sendto(
    fd: c_int,
    buf: *const c_void,
    len: size_t,
    flags: c_int,
    dest_addr: *const libc::sockaddr,
    addrlen: socklen_t,
) -> ssize_t {
    do_io(fd, "sendto", Event::Write, TimeoutKind::Send, || {
        origin::sendto(fd, buf, len, flags, dest_addr, addrlen)
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn sendmsg(fd: c_int, msg: *const libc::msghdr, flags: c_int) -> ssize_t {
    do_io(fd, "sendmsg", Event::Write, TimeoutKind::Send, || {
        origin::sendmsg(fd, msg, flags)
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn close(fd: c_int) -> c_int {
    if !hook_enabled() {
        return origin::close(fd);
    }
    if let Some(ctx) = fd_manager().get(fd, false) {
        ctx.set_closed(true);
        if let Some(iom) = IoManager::current() {
            // Parked fibers are rescheduled without an error flag; their
            // next raw call observes EBADF.
            iom.cancel_all(fd);
        }
        fd_manager().del(fd);
    }
    origin::close(fd)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn fcntl(fd: c_int, cmd: c_int, arg: c_long) -> c_int {
    match cmd {
        libc::F_SETFL => {
            let Some(ctx) = fd_manager().get(fd, false) else {
                return origin::fcntl(fd, cmd, arg);
            };
            if ctx.is_closed() || !ctx.is_socket() {
                return origin::fcntl(fd, cmd, arg);
            }
            let mut flags = arg as c_int;
            ctx.set_user_nonblock(flags & libc::O_NONBLOCK != 0);
            // The kernel flag tracks the runtime's needs, not the user's.
            if ctx.sys_nonblock() {
                flags |= libc::O_NONBLOCK;
            } else {
                flags &= !libc::O_NONBLOCK;
            }
            origin::fcntl(fd, cmd, flags as c_long)
        }
        libc::F_GETFL => {
            let flags = origin::fcntl(fd, cmd, 0);
            let Some(ctx) = fd_manager().get(fd, false) else {
                return flags;
            };
            if ctx.is_closed() || !ctx.is_socket() {
                return flags;
            }
            // Report the user's view, not the forced kernel state.
            if ctx.user_nonblock() {
                flags | libc::O_NONBLOCK
            } else {
                flags & !libc::O_NONBLOCK
            }
        }
        // Integer-argument commands: the vararg is an int, so only the low
        // 32 bits of the register are meaningful.
        libc::F_DUPFD
        | libc::F_DUPFD_CLOEXEC
        | libc::F_SETFD
        | libc::F_SETOWN
        | F_SETSIG
        | libc::F_SETLEASE
        | libc::F_NOTIFY
        | libc::F_SETPIPE_SZ => origin::fcntl(fd, cmd, arg as c_int as c_long),

        // Commands that take no argument.
        libc::F_GETFD
        | libc::F_GETOWN
        | F_GETSIG
        | libc::F_GETLEASE
        | libc::F_GETPIPE_SZ => origin::fcntl(fd, cmd, 0),

        // struct flock* argument, forwarded at full register width.
        libc::F_SETLK | libc::F_SETLKW | libc::F_GETLK => origin::fcntl(fd, cmd, arg),

        // struct f_owner_ex* argument.
        F_SETOWN_EX | F_GETOWN_EX => origin::fcntl(fd, cmd, arg),

        _ => origin::fcntl(fd, cmd, arg),
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn ioctl(fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int {
    if request == libc::FIONBIO && !arg.is_null() {
        let user_nonblock = *(arg as *const c_int) != 0;
        if let Some(ctx) = fd_manager().get(fd, false) {
            if !ctx.is_closed() && ctx.is_socket() {
                ctx.set_user_nonblock(user_nonblock);
            }
        }
    }
    origin::ioctl(fd, request, arg)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn getsockopt(
    fd: c_int,
    level: c_int,
    optname: c_int,
    optval: *mut c_void,
    optlen: *mut socklen_t,
) -> c_int {
    origin::getsockopt(fd, level, optname, optval, optlen)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn setsockopt(
    fd: c_int,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: socklen_t,
) -> c_int {
    if !hook_enabled() {
        return origin::setsockopt(fd, level, optname, optval, optlen);
    }
    if level == libc::SOL_SOCKET && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO) {
        if let Some(ctx) = fd_manager().get(fd, false) {
            let tv = &*(optval as *const libc::timeval);
            let ms = tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000;
            let kind = if optname == libc::SO_RCVTIMEO {
                TimeoutKind::Recv
            } else {
                TimeoutKind::Send
            };
            ctx.set_timeout(kind, ms);
        }
    }
    origin::setsockopt(fd, level, optname, optval, optlen)
}
