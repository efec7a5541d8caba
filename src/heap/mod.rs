//! Bucketed executable heap.
//!
//! Code allocations are served from 4096-byte execute-read pages carved
//! at 128-byte granularity. Each page belongs to a power-of-two bucket
//! (256..=4096 bytes) that records the allocation size class it serves;
//! requests above a page become large objects with their own contiguous
//! span. Every page carries a small plain-memory secondary arena for
//! unwind data, granted alongside the code run so the pair lives and
//! dies together.
//!
//! All state sits behind one mutex, so compile threads can share a heap.
//! OS exhaustion is an error the caller handles; a bitmap that disagrees
//! with the allocation records is corruption and aborts.

pub mod bitmap;
pub mod page_alloc;

use std::ptr::NonNull;

use parking_lot::Mutex;

use crate::core::error::{fatal_error, JitError, JitResult};
use crate::heap::bitmap::{chunks_for, FreeBitmap};
use crate::heap::page_alloc::{
    alloc_page, alloc_span, debug_break_fill, decommit_page, decommit_span, free_page, free_span,
    protect_execute_read, register_cfg_page, OsPage, PreReservedRegion, WritableGuard,
};

pub use crate::heap::bitmap::{CHUNK_SIZE, PAGE_SIZE};

/// Allocation size classes; requests above the last become large objects.
pub const BUCKET_SIZES: [usize; 5] = [256, 512, 1024, 2048, 4096];

/// Smallest bucket whose class covers `bytes`, or `None` for large
/// objects.
fn bucket_for(bytes: usize) -> Option<usize> {
    BUCKET_SIZES.iter().position(|&b| bytes <= b)
}

#[derive(Debug, Clone, Copy)]
pub struct HeapOptions {
    /// Pages to reserve up front so jitted code clusters; 0 disables the
    /// region.
    pub pre_reserve_pages: usize,
    /// Secondary (unwind data) arena bytes attached to each page.
    pub secondary_capacity: usize,
}

impl Default for HeapOptions {
    fn default() -> Self {
        Self {
            pre_reserve_pages: 0,
            secondary_capacity: 512,
        }
    }
}

/// Unwind-data grant carved from a page's secondary arena. Plain
/// read-write memory owned by the heap; valid until the paired code
/// allocation is freed.
#[derive(Debug)]
pub struct SecondaryGrant {
    ptr: NonNull<u8>,
    size: usize,
}

impl SecondaryGrant {
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) }
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }
}

unsafe impl Send for SecondaryGrant {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AllocKind {
    Bucket {
        page_idx: usize,
        first_chunk: u32,
        chunks: u32,
    },
    Large {
        pages: usize,
    },
}

/// Handle to one live code allocation. Freeing goes back through
/// [`ExecutableHeap::free`]; dropping the handle alone leaks the space
/// until `free_all`.
#[derive(Debug)]
pub struct HeapAllocation {
    addr: usize,
    size: usize,
    kind: AllocKind,
    pub secondary: Option<SecondaryGrant>,
}

impl HeapAllocation {
    pub fn addr(&self) -> usize {
        self.addr
    }

    /// Rounded size actually reserved (size class or whole pages).
    pub fn size(&self) -> usize {
        self.size
    }
}

unsafe impl Send for HeapAllocation {}

struct Page {
    os: OsPage,
    map: FreeBitmap,
    bucket: usize,
    /// Demoted: the secondary arena ran dry, so no further code
    /// allocations land here even though chunks are free.
    demoted: bool,
    secondary: Box<[u8]>,
    secondary_used: usize,
}

impl Page {
    fn grant_secondary(&mut self, need: usize) -> Option<SecondaryGrant> {
        if need == 0 {
            return Some(SecondaryGrant {
                ptr: NonNull::dangling(),
                size: 0,
            });
        }
        let need = (need + 7) & !7;
        if self.secondary_used + need > self.secondary.len() {
            return None;
        }
        let ptr = unsafe {
            NonNull::new_unchecked(self.secondary.as_mut_ptr().add(self.secondary_used))
        };
        self.secondary_used += need;
        Some(SecondaryGrant { ptr, size: need })
    }
}

struct LargeObject {
    base: NonNull<u8>,
    pages: usize,
    secondary: Box<[u8]>,
}

struct HeapInner {
    opts: HeapOptions,
    pre_reserved: Option<PreReservedRegion>,
    /// Page slab; freed slots are recycled.
    pages: Vec<Option<Page>>,
    free_slots: Vec<usize>,
    /// Page indices with free chunks, per bucket.
    buckets: [Vec<usize>; BUCKET_SIZES.len()],
    /// Demoted pages, kept aside until they empty out completely.
    demoted: Vec<usize>,
    large: hashbrown::HashMap<usize, LargeObject>,
    stats: HeapStats,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub live_pages: usize,
    pub large_objects: usize,
    pub allocations: u64,
    pub frees: u64,
    pub demotions: u64,
}

impl HeapInner {
    fn page(&mut self, idx: usize) -> &mut Page {
        match self.pages.get_mut(idx) {
            Some(Some(page)) => page,
            _ => fatal_error(&format!("heap page slot {idx} is dead")),
        }
    }

    fn new_page(&mut self, bucket: usize) -> Option<usize> {
        let os = alloc_page(self.pre_reserved.as_mut())?;
        {
            // Fresh pages trap on stray execution until code lands.
            let mut guard = unsafe { WritableGuard::new(os.base.as_ptr(), PAGE_SIZE) };
            debug_break_fill(guard.slice());
        }
        register_cfg_page(os.base.as_ptr(), PAGE_SIZE);

        let page = Page {
            os,
            map: FreeBitmap::all_free(),
            bucket,
            demoted: false,
            secondary: vec![0u8; self.opts.secondary_capacity].into_boxed_slice(),
            secondary_used: 0,
        };
        let idx = match self.free_slots.pop() {
            Some(idx) => {
                self.pages[idx] = Some(page);
                idx
            }
            None => {
                self.pages.push(Some(page));
                self.pages.len() - 1
            }
        };
        self.buckets[bucket].push(idx);
        self.stats.live_pages += 1;
        log::debug!("new code page {:p} in bucket {}", os.base, BUCKET_SIZES[bucket]);
        Some(idx)
    }

    fn alloc_large(&mut self, bytes: usize, secondary_need: usize) -> JitResult<HeapAllocation> {
        let pages = bytes.div_ceil(PAGE_SIZE);
        let base = alloc_span(pages).ok_or(JitError::OutOfExecutableMemory { requested: bytes })?;
        let size = pages * PAGE_SIZE;
        unsafe {
            debug_break_fill(std::slice::from_raw_parts_mut(base.as_ptr(), size));
        }
        register_cfg_page(base.as_ptr(), size);
        protect_execute_read(base.as_ptr(), size);

        let mut secondary_buf = vec![0u8; secondary_need.max(8)].into_boxed_slice();
        let secondary = if secondary_need > 0 {
            Some(SecondaryGrant {
                ptr: unsafe { NonNull::new_unchecked(secondary_buf.as_mut_ptr()) },
                size: secondary_need,
            })
        } else {
            None
        };
        self.large.insert(
            base.as_ptr() as usize,
            LargeObject {
                base,
                pages,
                secondary: secondary_buf,
            },
        );
        self.stats.large_objects += 1;
        self.stats.allocations += 1;
        log::debug!("large code object: {pages} pages at {base:p}");
        Ok(HeapAllocation {
            addr: base.as_ptr() as usize,
            size,
            kind: AllocKind::Large { pages },
            secondary,
        })
    }

    /// Reserve a run on `idx` and carve its secondary grant. On arena
    /// exhaustion the page is demoted and the caller moves on.
    fn try_page(
        &mut self,
        idx: usize,
        chunks: u32,
        secondary_need: usize,
    ) -> Option<(u32, SecondaryGrant)> {
        let page = self.page(idx);
        let first = page.map.find_run(chunks)?;
        match page.grant_secondary(secondary_need) {
            Some(grant) => {
                page.map.reserve(first, chunks);
                Some((first, grant))
            }
            None => {
                page.demoted = true;
                self.demote(idx);
                self.stats.demotions += 1;
                log::debug!("page slot {idx} demoted: secondary arena exhausted");
                None
            }
        }
    }

    fn demote(&mut self, idx: usize) {
        for bucket in self.buckets.iter_mut() {
            bucket.retain(|&i| i != idx);
        }
        self.demoted.push(idx);
    }

    fn alloc(
        &mut self,
        bytes: usize,
        secondary_count: u32,
        secondary_size: usize,
        is_jitted: bool,
    ) -> JitResult<HeapAllocation> {
        let secondary_need = secondary_count as usize * secondary_size;
        let Some(bucket) = bucket_for(bytes.max(1)) else {
            return self.alloc_large(bytes, secondary_need);
        };
        // Grants round up to 8 bytes; a request no page arena can ever
        // serve fails up front instead of demoting every page it visits.
        if (secondary_need + 7) & !7 > self.opts.secondary_capacity {
            return Err(JitError::UnwindAllocation {
                requested: secondary_need,
            });
        }
        let chunks = chunks_for(BUCKET_SIZES[bucket]);

        // Same-bucket pages first, then steal a fitting run from a larger
        // bucket's page and re-bucket it down, then a fresh page.
        let mut found: Option<(usize, u32, SecondaryGrant)> = None;
        'search: for b in bucket..BUCKET_SIZES.len() {
            let candidates: Vec<usize> = self.buckets[b].clone();
            for idx in candidates {
                if let Some((first, grant)) = self.try_page(idx, chunks, secondary_need) {
                    if b != bucket {
                        self.buckets[b].retain(|&i| i != idx);
                        self.buckets[bucket].push(idx);
                        self.page(idx).bucket = bucket;
                    }
                    found = Some((idx, first, grant));
                    break 'search;
                }
            }
        }
        let (idx, first, grant) = match found {
            Some(hit) => hit,
            None => {
                let idx = self
                    .new_page(bucket)
                    .ok_or(JitError::OutOfExecutableMemory { requested: bytes })?;
                let (first, grant) = self
                    .try_page(idx, chunks, secondary_need)
                    .ok_or(JitError::UnwindAllocation {
                        requested: secondary_need,
                    })?;
                (idx, first, grant)
            }
        };

        let page = self.page(idx);
        let addr = page.os.addr() + first as usize * CHUNK_SIZE;
        if page.map.is_full() {
            let bucket = page.bucket;
            self.buckets[bucket].retain(|&i| i != idx);
        }
        self.stats.allocations += 1;
        let _ = is_jitted;
        log::trace!(
            "code alloc: {bytes} bytes -> {addr:#x} (bucket {}, chunk {first})",
            BUCKET_SIZES[bucket]
        );
        Ok(HeapAllocation {
            addr,
            size: BUCKET_SIZES[bucket],
            kind: AllocKind::Bucket {
                page_idx: idx,
                first_chunk: first,
                chunks,
            },
            secondary: (grant.size > 0).then_some(grant),
        })
    }

    fn free(&mut self, alloc: HeapAllocation) {
        match alloc.kind {
            AllocKind::Large { pages } => {
                let Some(large) = self.large.remove(&alloc.addr) else {
                    fatal_error(&format!("freeing unknown large object {:#x}", alloc.addr));
                };
                debug_assert_eq!(large.pages, pages);
                free_span(large.base, large.pages);
                self.stats.large_objects -= 1;
                self.stats.frees += 1;
            }
            AllocKind::Bucket {
                page_idx,
                first_chunk,
                chunks,
            } => {
                let page = self.page(page_idx);
                if !page.map.is_run_allocated(first_chunk, chunks) {
                    fatal_error(&format!(
                        "freeing non-live run at {:#x}: bitmap disagrees",
                        alloc.addr
                    ));
                }
                {
                    let mut guard =
                        unsafe { WritableGuard::new(page.os.base.as_ptr(), PAGE_SIZE) };
                    let start = first_chunk as usize * CHUNK_SIZE;
                    let end = start + chunks as usize * CHUNK_SIZE;
                    debug_break_fill(&mut guard.slice()[start..end]);
                }
                page.map.release(first_chunk, chunks);
                let was_full_bucket_page = page.map.free_chunks() == chunks && !page.demoted;
                if page.map.is_empty() {
                    self.release_page(page_idx);
                } else if was_full_bucket_page {
                    // Page had dropped off its bucket list when it filled.
                    let bucket = self.page(page_idx).bucket;
                    if !self.buckets[bucket].contains(&page_idx) {
                        self.buckets[bucket].push(page_idx);
                    }
                }
                self.stats.frees += 1;
            }
        }
    }

    fn release_page(&mut self, idx: usize) {
        for bucket in self.buckets.iter_mut() {
            bucket.retain(|&i| i != idx);
        }
        self.demoted.retain(|&i| i != idx);
        let page = self.pages[idx].take().unwrap_or_else(|| {
            fatal_error(&format!("releasing dead page slot {idx}"));
        });
        log::debug!("releasing empty code page {:p}", page.os.base);
        free_page(page.os);
        self.free_slots.push(idx);
        self.stats.live_pages -= 1;
    }

    fn is_in_heap(&self, addr: usize) -> bool {
        let in_pages = self.pages.iter().flatten().any(|p| {
            let base = p.os.addr();
            addr >= base && addr < base + PAGE_SIZE
        });
        in_pages
            || self.large.values().any(|l| {
                let base = l.base.as_ptr() as usize;
                addr >= base && addr < base + l.pages * PAGE_SIZE
            })
    }

    fn decommit_all(&mut self) {
        for page in self.pages.iter().flatten() {
            decommit_page(&page.os);
        }
        for large in self.large.values() {
            decommit_span(large.base, large.pages);
        }
    }

    fn free_all(&mut self) {
        for page in self.pages.iter_mut().filter_map(Option::take) {
            free_page(page.os);
        }
        for (_, large) in self.large.drain() {
            free_span(large.base, large.pages);
        }
        self.free_slots.clear();
        for bucket in self.buckets.iter_mut() {
            bucket.clear();
        }
        self.demoted.clear();
        self.stats.live_pages = 0;
        self.stats.large_objects = 0;
    }
}

/// Thread-safe executable code heap.
pub struct ExecutableHeap {
    inner: Mutex<HeapInner>,
}

impl ExecutableHeap {
    pub fn new(opts: HeapOptions) -> Self {
        let pre_reserved = if opts.pre_reserve_pages > 0 {
            PreReservedRegion::new(opts.pre_reserve_pages)
        } else {
            None
        };
        Self {
            inner: Mutex::new(HeapInner {
                opts,
                pre_reserved,
                pages: Vec::new(),
                free_slots: Vec::new(),
                buckets: Default::default(),
                demoted: Vec::new(),
                large: hashbrown::HashMap::new(),
                stats: HeapStats::default(),
            }),
        }
    }

    /// Reserve executable space for `bytes` of code plus
    /// `secondary_count` unwind records of `secondary_size` bytes each.
    pub fn alloc(
        &self,
        bytes: usize,
        secondary_count: u32,
        secondary_size: usize,
        is_jitted: bool,
    ) -> JitResult<HeapAllocation> {
        self.inner
            .lock()
            .alloc(bytes, secondary_count, secondary_size, is_jitted)
    }

    /// Free a live allocation. The freed range is refilled with trap
    /// bytes; a fully empty page goes back to the OS.
    pub fn free(&self, alloc: HeapAllocation) {
        self.inner.lock().free(alloc)
    }

    /// Open a writable window over the allocation and run `f` on its
    /// bytes. Pages revert to execute-read before this returns.
    pub fn write(&self, alloc: &HeapAllocation, f: impl FnOnce(&mut [u8])) {
        let inner = self.inner.lock();
        match alloc.kind {
            AllocKind::Bucket { page_idx, .. } => {
                let Some(Some(page)) = inner.pages.get(page_idx) else {
                    fatal_error(&format!("writing through dead page slot {page_idx}"));
                };
                let base = page.os.base.as_ptr();
                let offset = alloc.addr - page.os.addr();
                let mut guard = unsafe { WritableGuard::new(base, PAGE_SIZE) };
                f(&mut guard.slice()[offset..offset + alloc.size]);
            }
            AllocKind::Large { pages } => {
                let mut guard =
                    unsafe { WritableGuard::new(alloc.addr as *mut u8, pages * PAGE_SIZE) };
                f(&mut guard.slice()[..alloc.size]);
            }
        }
    }

    /// Whether `addr` falls inside a live code page or large object.
    /// Page granular: an address on a committed page answers true even
    /// between that page's allocations, and false the moment the page is
    /// released. Uncommitted pre-reserved space is not in the heap.
    pub fn is_in_heap(&self, addr: usize) -> bool {
        self.inner.lock().is_in_heap(addr)
    }

    /// Drop the backing store of every page while keeping the address
    /// space (low-memory response).
    pub fn decommit_all(&self) {
        self.inner.lock().decommit_all()
    }

    /// Release everything back to the OS.
    pub fn free_all(&self) {
        self.inner.lock().free_all()
    }

    pub fn stats(&self) -> HeapStats {
        self.inner.lock().stats
    }
}

impl Drop for ExecutableHeap {
    fn drop(&mut self) {
        self.inner.lock().free_all();
    }
}

impl Default for ExecutableHeap {
    fn default() -> Self {
        Self::new(HeapOptions::default())
    }
}

unsafe impl Send for ExecutableHeap {}
unsafe impl Sync for ExecutableHeap {}
