//! Per-fd context table
//!
//! A process-wide sparse table indexed by file descriptor, recording what
//! the hook layer needs to know about each fd: whether it is a socket,
//! whose non-blocking flag is whose, and the configured I/O timeouts.
//!
//! Sockets are forced into `O_NONBLOCK` when first seen; the user's own
//! non-blocking intent is tracked separately and reflected back through
//! `fcntl`, never read from the kernel.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

use crate::hook::origin;

/// Timeout sentinel meaning "no timeout".
pub const NO_TIMEOUT: u64 = u64::MAX;

/// Which per-fd timeout a hooked call consults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// Read-family calls (`SO_RCVTIMEO`).
    Recv,
    /// Write-family calls (`SO_SNDTIMEO`).
    Send,
}

/// Hook-layer metadata for one file descriptor.
pub struct FdCtx {
    fd: RawFd,
    is_init: bool,
    is_socket: bool,
    sys_nonblock: AtomicBool,
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
}

impl FdCtx {
    /// Probe the fd and set up socket bookkeeping.
    ///
    /// A failed `fstat` leaves the context uninitialized; the hook layer
    /// treats that as "not eligible, pass through".
    fn new(fd: RawFd) -> FdCtx {
        let mut stat = std::mem::MaybeUninit::<libc::stat>::uninit();
        let rc = unsafe { libc::fstat(fd, stat.as_mut_ptr()) };

        let (is_init, is_socket) = if rc == -1 {
            (false, false)
        } else {
            let mode = unsafe { stat.assume_init() }.st_mode;
            (true, mode & libc::S_IFMT == libc::S_IFSOCK)
        };

        let mut sys_nonblock = false;
        if is_socket {
            unsafe {
                let flags = origin::fcntl(fd, libc::F_GETFL, 0);
                if flags & libc::O_NONBLOCK as libc::c_int == 0 {
                    origin::fcntl(fd, libc::F_SETFL, (flags | libc::O_NONBLOCK) as libc::c_long);
                }
            }
            sys_nonblock = true;
        }

        FdCtx {
            fd,
            is_init,
            is_socket,
            sys_nonblock: AtomicBool::new(sys_nonblock),
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout_ms: AtomicU64::new(NO_TIMEOUT),
            send_timeout_ms: AtomicU64::new(NO_TIMEOUT),
        }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn is_init(&self) -> bool {
        self.is_init
    }

    #[inline]
    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_closed(&self, v: bool) {
        self.closed.store(v, Ordering::Release);
    }

    /// Whether the runtime forced `O_NONBLOCK` on the real fd.
    #[inline]
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Acquire)
    }

    /// The user's own non-blocking intent, never the kernel state.
    #[inline]
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_user_nonblock(&self, v: bool) {
        self.user_nonblock.store(v, Ordering::Release);
    }

    pub fn set_timeout(&self, kind: TimeoutKind, ms: u64) {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.store(ms, Ordering::Release),
            TimeoutKind::Send => self.send_timeout_ms.store(ms, Ordering::Release),
        }
    }

    pub fn timeout(&self, kind: TimeoutKind) -> u64 {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.load(Ordering::Acquire),
            TimeoutKind::Send => self.send_timeout_ms.load(Ordering::Acquire),
        }
    }
}

/// Process-wide fd table. Reader lock on the hot lookup path; exclusive
/// only to grow the vector or install a new entry.
pub struct FdManager {
    slots: RwLock<Vec<Option<Arc<FdCtx>>>>,
}

impl FdManager {
    fn new() -> FdManager {
        FdManager {
            slots: RwLock::new(Vec::new()),
        }
    }

    /// Look up the context for `fd`, creating it when `auto_create` is set.
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdCtx>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;
        {
            let slots = self.slots.read().unwrap();
            if let Some(Some(ctx)) = slots.get(idx) {
                return Some(ctx.clone());
            }
        }
        if !auto_create {
            return None;
        }

        let mut slots = self.slots.write().unwrap();
        if slots.len() <= idx {
            let target = std::cmp::max(idx * 3 / 2, idx + 1);
            slots.resize_with(target, || None);
        }
        if slots[idx].is_none() {
            slots[idx] = Some(Arc::new(FdCtx::new(fd)));
        }
        slots[idx].clone()
    }

    /// Drop the context for `fd`. The vector never shrinks; fds reuse
    /// slots.
    pub fn del(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let mut slots = self.slots.write().unwrap();
        if let Some(slot) = slots.get_mut(fd as usize) {
            *slot = None;
        }
    }
}

/// The process-wide fd table. Lives until process exit; no teardown.
pub fn fd_manager() -> &'static FdManager {
    static MANAGER: OnceLock<FdManager> = OnceLock::new();
    MANAGER.get_or_init(FdManager::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_without_autocreate() {
        assert!(fd_manager().get(-1, true).is_none());
        // A huge fd that is certainly not open.
        assert!(fd_manager().get(100_000, false).is_none());
    }

    #[test]
    fn test_pipe_fd_is_not_a_socket() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        let ctx = fd_manager().get(fds[0], true).unwrap();
        assert!(ctx.is_init());
        assert!(!ctx.is_socket());
        assert!(!ctx.sys_nonblock());

        fd_manager().del(fds[0]);
        assert!(fd_manager().get(fds[0], false).is_none());
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_socket_fd_forced_nonblocking() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);

        let ctx = fd_manager().get(fd, true).unwrap();
        assert!(ctx.is_socket());
        assert!(ctx.sys_nonblock());
        assert!(!ctx.user_nonblock());

        // The kernel flag really is set.
        let flags = unsafe { origin::fcntl(fd, libc::F_GETFL, 0) };
        assert!(flags & libc::O_NONBLOCK != 0);

        fd_manager().del(fd);
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_timeout_storage() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let ctx = fd_manager().get(fds[1], true).unwrap();

        assert_eq!(ctx.timeout(TimeoutKind::Recv), NO_TIMEOUT);
        assert_eq!(ctx.timeout(TimeoutKind::Send), NO_TIMEOUT);
        ctx.set_timeout(TimeoutKind::Recv, 250);
        assert_eq!(ctx.timeout(TimeoutKind::Recv), 250);
        assert_eq!(ctx.timeout(TimeoutKind::Send), NO_TIMEOUT);

        fd_manager().del(fds[1]);
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
