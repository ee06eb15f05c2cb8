//! Fiber stack allocation
//!
//! Each task fiber owns an mmap'd stack with a `PROT_NONE` guard page below
//! the usable region, so overflow faults instead of corrupting a neighbor.

use strand_core::error::{SchedError, SchedResult};

/// An owned, page-aligned fiber stack.
///
/// Layout, low to high addresses: one guard page, then `usable` bytes of
/// read-write memory. The stack grows down from [`FiberStack::top`].
pub struct FiberStack {
    base: *mut u8,
    total: usize,
    usable: usize,
}

unsafe impl Send for FiberStack {}
unsafe impl Sync for FiberStack {}

impl FiberStack {
    /// Allocate a stack with at least `size` usable bytes.
    pub fn new(size: usize) -> SchedResult<FiberStack> {
        let page = page_size();
        let usable = size.div_ceil(page) * page;
        let total = usable + page;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(SchedError::StackAllocation);
        }

        // Guard page at the low end.
        let rc = unsafe { libc::mprotect(base, page, libc::PROT_NONE) };
        if rc != 0 {
            unsafe { libc::munmap(base, total) };
            return Err(SchedError::StackAllocation);
        }

        Ok(FiberStack {
            base: base as *mut u8,
            total,
            usable,
        })
    }

    /// Highest address of the stack; the initial stack pointer starts here.
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.total) }
    }

    /// Usable bytes between guard page and top.
    #[inline]
    pub fn usable_size(&self) -> usize {
        self.usable
    }
}

impl Drop for FiberStack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.total);
        }
    }
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_rounding_and_top() {
        let stack = FiberStack::new(1000).unwrap();
        let page = page_size();
        assert_eq!(stack.usable_size() % page, 0);
        assert!(stack.usable_size() >= 1000);
        assert_eq!(stack.top() as usize % page, 0);
    }

    #[test]
    fn test_stack_is_writable_below_top() {
        let stack = FiberStack::new(64 * 1024).unwrap();
        unsafe {
            let p = stack.top().sub(8);
            p.write_bytes(0xAB, 8);
            assert_eq!(*p, 0xAB);
        }
    }
}
