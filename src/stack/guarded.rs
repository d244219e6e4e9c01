// The MIT License (MIT)
//
// Copyright (c) 2015 Rustcc Developers

use std::io;
use std::ptr;

use super::round_to_pages;

/// Returns the OS page size, queried once and memoized for the lifetime of the process.
pub fn page_size() -> usize {
    use std::sync::OnceLock;
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize })
}

/// A coroutine's stack: a reserved-but-mostly-uncommitted region of virtual memory, growing
/// downward from `upper` toward a guard page at the low end of `area`.
///
/// `area` is never itself accessible — `[area, area + page_size)` is the permanent guard page.
/// `[lower, area + size)` is committed (readable/writable); `[area + page_size, lower)` is
/// reserved but not yet backed, and will be committed on demand by the guard-page fault handler.
pub struct Stack {
    area: *mut u8,
    size: usize,
    lower: usize,
    upper: usize,
}

unsafe impl Send for Stack {}

impl Stack {
    /// Reserve `size` bytes (rounded up to whole pages, floored at one page) and commit only the
    /// topmost page. `header_size` bytes are carved off the top of that committed page for the
    /// caller's control block; the returned `upper()` points just below them.
    pub fn new(size: usize, header_size: usize) -> io::Result<Stack> {
        let page_size = page_size();
        let size = round_to_pages(size, page_size);

        let area = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if area == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let area = area as *mut u8;

        // commit the topmost page: the stack grows from the high end downward.
        let top_page = unsafe { area.add(size - page_size) };
        let rc = unsafe {
            libc::mprotect(
                top_page as *mut libc::c_void,
                page_size,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if rc != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::munmap(area as *mut libc::c_void, size) };
            return Err(err);
        }

        let area_addr = area as usize;
        Ok(Stack {
            area,
            size,
            lower: area_addr + size - page_size,
            upper: area_addr + size - header_size,
        })
    }

    /// Base address of the reserved region (the guard page starts here).
    pub fn area(&self) -> usize {
        self.area as usize
    }

    /// Total reserved size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Lowest address currently committed (readable/writable).
    pub fn lower(&self) -> usize {
        self.lower
    }

    /// One past the highest address usable by the coroutine (stack top minus the header).
    pub fn upper(&self) -> usize {
        self.upper
    }

    pub fn page_size(&self) -> usize {
        page_size()
    }

    /// Commit `[new_lower, self.lower)` and update `self.lower`. Caller must have already
    /// validated `new_lower` via [`guard::decide`].
    ///
    /// # Safety
    /// `new_lower` must be page-aligned and satisfy `self.area() + page_size <= new_lower <
    /// self.lower()`.
    pub unsafe fn commit_down_to(&mut self, new_lower: usize) -> io::Result<()> {
        let grow_len = self.lower - new_lower;
        let rc = libc::mprotect(
            new_lower as *mut libc::c_void,
            grow_len,
            libc::PROT_READ | libc::PROT_WRITE,
        );
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        self.lower = new_lower;
        Ok(())
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.area as *mut libc::c_void, self.size);
        }
    }
}

/// Pure address-range arithmetic shared by the real signal handler and its unit tests (a literal
/// guard-page trap would abort the test binary, so the decision logic is tested in isolation —
/// see DESIGN.md).
pub mod guard {
    /// Decide whether a fault at `addr` should grow the stack, and if so, the new `lower` bound
    /// to commit down to.
    ///
    /// Mirrors `fiber.c`'s `ef_fiber_expand_stack`: accept the fault iff the page containing
    /// `addr` lies strictly above the guard page and strictly below the currently committed
    /// region.
    pub fn decide(area: usize, page_size: usize, lower: usize, addr: usize) -> Option<usize> {
        let page = addr & !(page_size - 1);
        if page >= area + page_size && page < lower {
            Some(page)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserves_and_commits_top_page() {
        let stack = Stack::new(4 * page_size(), 64).expect("stack alloc");
        assert_eq!(stack.size(), 4 * page_size());
        assert_eq!(stack.lower(), stack.area() + stack.size() - page_size());
        assert_eq!(stack.upper(), stack.area() + stack.size() - 64);
    }

    #[test]
    fn zero_size_rounds_to_one_page() {
        let stack = Stack::new(0, 64).expect("stack alloc");
        assert_eq!(stack.size(), page_size());
    }

    #[test]
    fn commit_down_to_grows_lower_bound() {
        let mut stack = Stack::new(8 * page_size(), 64).expect("stack alloc");
        let target = stack.lower() - page_size();
        unsafe { stack.commit_down_to(target).expect("commit") };
        assert_eq!(stack.lower(), target);
    }

    #[test]
    fn guard_decide_accepts_reserved_uncommitted_region() {
        let area = 0x1000_0000usize;
        let page = 0x1000;
        let lower = area + 5 * page;
        // one page below the current commit boundary, still above the guard page
        let fault = lower - 1;
        assert_eq!(guard::decide(area, page, lower, fault), Some(lower - page));
    }

    #[test]
    fn guard_decide_rejects_guard_page_itself() {
        let area = 0x1000_0000usize;
        let page = 0x1000;
        let lower = area + 5 * page;
        let fault = area; // the guard page
        assert_eq!(guard::decide(area, page, lower, fault), None);
    }

    #[test]
    fn guard_decide_rejects_already_committed_region() {
        let area = 0x1000_0000usize;
        let page = 0x1000;
        let lower = area + 5 * page;
        let fault = lower + 10; // already committed, above lower
        assert_eq!(guard::decide(area, page, lower, fault), None);
    }

    #[test]
    fn guard_decide_rejects_out_of_reserved_range() {
        let area = 0x1000_0000usize;
        let page = 0x1000;
        let lower = area + 5 * page;
        let fault = area - page; // below the reserved region entirely
        assert_eq!(guard::decide(area, page, lower, fault), None);
    }
}
