//! OS page plumbing for the executable heap.
//!
//! Everything that touches mmap/VirtualAlloc lives here: page
//! reservation and commit, the W^X protection flips, the debug fill, and
//! the CFG registration hook on windows. The heap above deals only in
//! committed read-write-or-execute pages; it never sees a raw syscall.
//!
//! Code pages spend their life execute-read. The only sanctioned way to
//! write one is [`WritableGuard`], which flips the pages read-write and
//! restores execute-read on every exit path. A protection flip that the
//! OS refuses leaves the process with pages in an unknown state, so it
//! is treated as fatal rather than surfaced as an error.

use std::ptr::NonNull;

use crate::core::error::fatal_error;
use crate::heap::bitmap::PAGE_SIZE;

#[cfg(unix)]
mod platform {
    use std::ptr;

    pub unsafe fn reserve(size: usize) -> *mut u8 {
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            ptr::null_mut()
        } else {
            ptr as *mut u8
        }
    }

    pub unsafe fn alloc_rw(size: usize) -> *mut u8 {
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            ptr::null_mut()
        } else {
            ptr as *mut u8
        }
    }

    pub unsafe fn commit_rw(ptr: *mut u8, size: usize) -> bool {
        unsafe { libc::mprotect(ptr as *mut _, size, libc::PROT_READ | libc::PROT_WRITE) == 0 }
    }

    pub unsafe fn protect_rw(ptr: *mut u8, size: usize) -> bool {
        unsafe { libc::mprotect(ptr as *mut _, size, libc::PROT_READ | libc::PROT_WRITE) == 0 }
    }

    pub unsafe fn protect_rx(ptr: *mut u8, size: usize) -> bool {
        unsafe { libc::mprotect(ptr as *mut _, size, libc::PROT_READ | libc::PROT_EXEC) == 0 }
    }

    pub unsafe fn decommit(ptr: *mut u8, size: usize) {
        unsafe {
            libc::madvise(ptr as *mut _, size, libc::MADV_DONTNEED);
            libc::mprotect(ptr as *mut _, size, libc::PROT_NONE);
        }
    }

    pub unsafe fn release(ptr: *mut u8, size: usize) {
        unsafe {
            libc::munmap(ptr as *mut _, size);
        }
    }
}

#[cfg(windows)]
mod platform {
    use std::ptr;
    use windows_sys::Win32::System::Memory::{
        VirtualAlloc, VirtualFree, VirtualProtect, MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE,
        MEM_RESERVE, PAGE_EXECUTE_READ, PAGE_NOACCESS, PAGE_READWRITE,
    };

    pub unsafe fn reserve(size: usize) -> *mut u8 {
        unsafe { VirtualAlloc(ptr::null(), size, MEM_RESERVE, PAGE_NOACCESS) as *mut u8 }
    }

    pub unsafe fn alloc_rw(size: usize) -> *mut u8 {
        unsafe {
            VirtualAlloc(ptr::null(), size, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) as *mut u8
        }
    }

    pub unsafe fn commit_rw(ptr: *mut u8, size: usize) -> bool {
        unsafe { !VirtualAlloc(ptr as *mut _, size, MEM_COMMIT, PAGE_READWRITE).is_null() }
    }

    pub unsafe fn protect_rw(ptr: *mut u8, size: usize) -> bool {
        let mut old = 0;
        unsafe { VirtualProtect(ptr as *mut _, size, PAGE_READWRITE, &mut old) != 0 }
    }

    pub unsafe fn protect_rx(ptr: *mut u8, size: usize) -> bool {
        let mut old = 0;
        unsafe { VirtualProtect(ptr as *mut _, size, PAGE_EXECUTE_READ, &mut old) != 0 }
    }

    pub unsafe fn decommit(ptr: *mut u8, size: usize) {
        unsafe {
            VirtualFree(ptr as *mut _, size, MEM_DECOMMIT);
        }
    }

    pub unsafe fn release(ptr: *mut u8, _size: usize) {
        unsafe {
            VirtualFree(ptr as *mut _, 0, MEM_RELEASE);
        }
    }
}

/// Register a fresh code page as a valid indirect-call target with
/// Control Flow Guard. A no-op where CFG does not exist.
#[cfg(windows)]
pub fn register_cfg_page(base: *mut u8, size: usize) {
    use windows_sys::Win32::System::Memory::{
        SetProcessValidCallTargets, CFG_CALL_TARGET_INFO, CFG_CALL_TARGET_VALID,
    };
    use windows_sys::Win32::System::Threading::GetCurrentProcess;

    let mut target = CFG_CALL_TARGET_INFO {
        Offset: 0,
        Flags: CFG_CALL_TARGET_VALID as usize,
    };
    let ok = unsafe {
        SetProcessValidCallTargets(GetCurrentProcess(), base as *const _, size, 1, &mut target)
    };
    if ok == 0 {
        // CFG not enabled for this process; nothing to register.
        log::trace!("CFG registration skipped for page {base:p}");
    }
}

#[cfg(not(windows))]
pub fn register_cfg_page(_base: *mut u8, _size: usize) {}

/// Fill bytes with the x86 breakpoint opcode so a stray jump into
/// unused heap space traps instead of executing garbage.
pub fn debug_break_fill(bytes: &mut [u8]) {
    bytes.fill(0xCC);
}

/// A contiguous address range reserved up front and committed one page
/// at a time, so all jitted code lands close together.
pub struct PreReservedRegion {
    base: NonNull<u8>,
    pages: usize,
    committed: usize,
}

impl PreReservedRegion {
    pub fn new(pages: usize) -> Option<Self> {
        let base = unsafe { platform::reserve(pages * PAGE_SIZE) };
        let base = NonNull::new(base)?;
        log::debug!("pre-reserved {pages} code pages at {base:p}");
        Some(Self {
            base,
            pages,
            committed: 0,
        })
    }

    /// Commit the next reserved page read-write. `None` once the region
    /// is exhausted; the heap then falls back to standalone pages.
    pub fn commit_page(&mut self) -> Option<NonNull<u8>> {
        if self.committed == self.pages {
            return None;
        }
        let ptr = unsafe { self.base.as_ptr().add(self.committed * PAGE_SIZE) };
        if !unsafe { platform::commit_rw(ptr, PAGE_SIZE) } {
            return None;
        }
        self.committed += 1;
        NonNull::new(ptr)
    }

    pub fn contains(&self, addr: usize) -> bool {
        let base = self.base.as_ptr() as usize;
        addr >= base && addr < base + self.pages * PAGE_SIZE
    }
}

impl Drop for PreReservedRegion {
    fn drop(&mut self) {
        unsafe {
            platform::release(self.base.as_ptr(), self.pages * PAGE_SIZE);
        }
    }
}

// The region hands out raw pages; the heap's lock serializes access.
unsafe impl Send for PreReservedRegion {}

/// One committed OS page and where it came from, which decides how it
/// goes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OsPage {
    pub base: NonNull<u8>,
    pub from_reserved: bool,
}

impl OsPage {
    pub fn addr(&self) -> usize {
        self.base.as_ptr() as usize
    }
}

/// Obtain a committed read-write page, preferring the pre-reserved
/// region. `None` means the OS is out of memory.
pub fn alloc_page(pre_reserved: Option<&mut PreReservedRegion>) -> Option<OsPage> {
    if let Some(region) = pre_reserved {
        if let Some(base) = region.commit_page() {
            return Some(OsPage {
                base,
                from_reserved: true,
            });
        }
    }
    let ptr = unsafe { platform::alloc_rw(PAGE_SIZE) };
    NonNull::new(ptr).map(|base| OsPage {
        base,
        from_reserved: false,
    })
}

/// Return a page to the OS. Reserved-region pages are decommitted in
/// place (the region keeps the address space); standalone pages are
/// unmapped.
pub fn free_page(page: OsPage) {
    unsafe {
        if page.from_reserved {
            platform::decommit(page.base.as_ptr(), PAGE_SIZE);
        } else {
            platform::release(page.base.as_ptr(), PAGE_SIZE);
        }
    }
}

/// Obtain a contiguous committed read-write span for a large object.
pub fn alloc_span(pages: usize) -> Option<NonNull<u8>> {
    let ptr = unsafe { platform::alloc_rw(pages * PAGE_SIZE) };
    NonNull::new(ptr)
}

/// Unmap a large-object span.
pub fn free_span(base: NonNull<u8>, pages: usize) {
    unsafe {
        platform::release(base.as_ptr(), pages * PAGE_SIZE);
    }
}

/// Decommit a span's backing store without giving up its address.
pub fn decommit_span(base: NonNull<u8>, pages: usize) {
    unsafe {
        platform::decommit(base.as_ptr(), pages * PAGE_SIZE);
    }
}

/// Decommit a page's backing store without giving up its address.
pub fn decommit_page(page: &OsPage) {
    unsafe {
        platform::decommit(page.base.as_ptr(), PAGE_SIZE);
    }
}

/// Flip pages to execute-read.
pub fn protect_execute_read(base: *mut u8, size: usize) {
    if !unsafe { platform::protect_rx(base, size) } {
        fatal_error(&format!("failed to protect {size} bytes at {base:p} execute-read"));
    }
}

/// Temporary read-write window over otherwise execute-read pages.
/// Restores execute-read when dropped, including on unwind.
pub struct WritableGuard {
    base: *mut u8,
    size: usize,
}

impl WritableGuard {
    /// `base`/`size` must cover whole committed pages owned by the heap.
    pub unsafe fn new(base: *mut u8, size: usize) -> Self {
        if !unsafe { platform::protect_rw(base, size) } {
            fatal_error(&format!("failed to open writable window at {base:p}"));
        }
        Self { base, size }
    }

    pub fn slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.base, self.size) }
    }
}

impl Drop for WritableGuard {
    fn drop(&mut self) {
        protect_execute_read(self.base, self.size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_round_trip() {
        let page = alloc_page(None).expect("out of memory");
        unsafe {
            page.base.as_ptr().write(0xAB);
            assert_eq!(page.base.as_ptr().read(), 0xAB);
        }
        free_page(page);
    }

    #[test]
    fn writable_guard_restores_execute() {
        let page = alloc_page(None).expect("out of memory");
        protect_execute_read(page.base.as_ptr(), PAGE_SIZE);

        // ret; readable through the guard afterwards.
        {
            let mut guard = unsafe { WritableGuard::new(page.base.as_ptr(), PAGE_SIZE) };
            let slice = guard.slice();
            debug_break_fill(slice);
            slice[0] = 0xC3;
        }

        let first = unsafe { page.base.as_ptr().read() };
        assert_eq!(first, 0xC3);
        let second = unsafe { page.base.as_ptr().add(1).read() };
        assert_eq!(second, 0xCC);
        free_page(page);
    }

    #[test]
    fn pre_reserved_commits_in_order() {
        let mut region = PreReservedRegion::new(3).expect("reserve failed");
        let a = region.commit_page().unwrap();
        let b = region.commit_page().unwrap();
        let c = region.commit_page().unwrap();
        assert_eq!(a.as_ptr() as usize + PAGE_SIZE, b.as_ptr() as usize);
        assert_eq!(b.as_ptr() as usize + PAGE_SIZE, c.as_ptr() as usize);
        assert!(region.commit_page().is_none());

        assert!(region.contains(a.as_ptr() as usize));
        assert!(region.contains(c.as_ptr() as usize + PAGE_SIZE - 1));
        assert!(!region.contains(c.as_ptr() as usize + PAGE_SIZE));
    }

    #[test]
    fn reserved_pages_are_writable_after_commit() {
        let mut region = PreReservedRegion::new(1).expect("reserve failed");
        let page = region.commit_page().unwrap();
        unsafe {
            page.as_ptr().write(0x5A);
            assert_eq!(page.as_ptr().read(), 0x5A);
        }
    }
}
