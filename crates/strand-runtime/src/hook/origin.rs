//! Original symbol resolution
//!
//! The hook layer exports unmangled definitions of the POSIX symbols it
//! intercepts, so the runtime itself must reach the real implementations
//! through `dlsym(RTLD_NEXT, ...)`. Each symbol is resolved once, on first
//! use, and cached.

use libc::{c_char, c_int, c_long, c_uint, c_ulong, c_void, size_t, socklen_t, ssize_t};
use std::sync::OnceLock;

fn resolve(symbol: &'static str) -> usize {
    // `symbol` must carry its NUL terminator.
    let addr = unsafe { libc::dlsym(libc::RTLD_NEXT, symbol.as_ptr() as *const c_char) };
    assert!(
        !addr.is_null(),
        "dlsym(RTLD_NEXT, {:?}) failed",
        &symbol[..symbol.len() - 1]
    );
    addr as usize
}

macro_rules! origin_syscalls {
    ($(fn $name:ident($($arg:ident: $ty:ty),*) -> $ret:ty;)+) => {$(
        /// Call the libc implementation of the identically named symbol.
        ///
        /// # Safety
        ///
        /// Same contract as the underlying syscall.
        pub unsafe fn $name($($arg: $ty),*) -> $ret {
            type Raw = unsafe extern "C" fn($($ty),*) -> $ret;
            static ADDR: OnceLock<usize> = OnceLock::new();
            let addr = *ADDR.get_or_init(|| resolve(concat!(stringify!($name), "\0")));
            let raw: Raw = std::mem::transmute(addr);
            raw($($arg),*)
        }
    )+};
}

origin_syscalls! {
    fn sleep(seconds: c_uint) -> c_uint;
    fn usleep(usec: c_uint) -> c_int;
    fn nanosleep(req: *const libc::timespec, rem: *mut libc::timespec) -> c_int;
    fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int;
    fn connect(fd: c_int, addr: *const libc::sockaddr, addrlen: socklen_t) -> c_int;
    fn accept(fd: c_int, addr: *mut libc::sockaddr, addrlen: *mut socklen_t) -> c_int;
    fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t;
    fn readv(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> ssize_t;
    fn recv(fd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t;
    fn recvfrom(
        fd: c_int,
        buf: *mut c_void,
        len: size_t,
        flags: c_int,
        src_addr: *mut libc::sockaddr,
        addrlen: *mut socklen_t
    ) -> ssize_t;
    fn recvmsg(fd: c_int, msg: *mut libc::msghdr, flags: c_int) -> ssize_t;
    fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t;
    fn writev(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> ssize_t;
    fn send(fd: c_int, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t;
    fn sendto(
        fd: c_int,
        buf: *const c_void,
        len: size_t,
        flags: c_int,
        dest_addr: *const libc::sockaddr,
        addrlen: socklen_t
    ) -> ssize_t;
    fn sendmsg(fd: c_int, msg: *const libc::msghdr, flags: c_int) -> ssize_t;
    fn close(fd: c_int) -> c_int;
    fn fcntl(fd: c_int, cmd: c_int, arg: c_long) -> c_int;
    fn ioctl(fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int;
    fn getsockopt(
        fd: c_int,
        level: c_int,
        optname: c_int,
        optval: *mut c_void,
        optlen: *mut socklen_t
    ) -> c_int;
    fn setsockopt(
        fd: c_int,
        level: c_int,
        optname: c_int,
        optval: *const c_void,
        optlen: socklen_t
    ) -> c_int;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolved_write_reaches_kernel() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        let payload = b"ping";
        let n = unsafe { write(fds[1], payload.as_ptr().cast(), payload.len()) };
        assert_eq!(n, 4);

        let mut buf = [0u8; 8];
        let n = unsafe { read(fds[0], buf.as_mut_ptr().cast(), buf.len()) };
        assert_eq!(n, 4);
        assert_eq!(&buf[..4], payload);

        unsafe {
            close(fds[0]);
            close(fds[1]);
        }
    }
}
