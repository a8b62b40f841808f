//! Page level heap management.
//!
//! The page allocator owns the address space reservation, the arena table
//! and the span pool. Free page runs are kept in an address ordered index
//! and handed out first fit, coalescing on free. Per page bitsets record
//! which free pages have been returned to the OS (scavenged) and which
//! pages have ever been written (dirty, and so need zeroing on reuse).

use std::{
    collections::BTreeMap,
    io,
    sync::atomic::{AtomicUsize, Ordering},
    time::{Duration, Instant},
};

use crate::{
    base::{
        bitmap::AtomicBitmap,
        virtual_memory::{page_size, VirtualMemory, RELEASE_ZEROES},
    },
    fatal::Fatal,
    sync::lock_rank::{LockRank, RankedMutex},
};

use super::{
    arena::ArenaTable,
    size_classes::SpanClass,
    span::{Span, SpanId, SpanPool},
    Address, ARENA_SIZE, PAGES_PER_ARENA, PAGE_SHIFT, PAGE_SIZE,
};

#[derive(Clone, Copy, Debug)]
struct FreeRun {
    npages: usize,
    free_since: Instant,
}

struct PageState {
    /// First page number -> run. Runs never overlap or touch.
    free: BTreeMap<usize, FreeRun>,
    arenas_committed: usize,
    next_span: u32,
    free_span_ids: Vec<SpanId>,
    scavenged: AtomicBitmap,
    dirty: AtomicBitmap,
}

/// Description of a free run, for diagnostics and tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FreeRunInfo {
    pub base: Address,
    pub npages: usize,
    pub scavenged_pages: usize,
}

pub struct PageAllocator {
    vm: VirtualMemory,
    arenas: ArenaTable,
    spans: SpanPool,
    state: RankedMutex<PageState>,
    heap_sys: AtomicUsize,
    heap_inuse: AtomicUsize,
    heap_released: AtomicUsize,
}

impl PageAllocator {
    pub fn new(address_space: usize) -> io::Result<Self> {
        let vm = VirtualMemory::reserve(address_space, ARENA_SIZE)?;
        let total_pages = vm.size() >> PAGE_SHIFT;
        let arenas = ArenaTable::new(vm.start(), vm.size());
        Ok(Self {
            arenas,
            spans: SpanPool::new(total_pages),
            state: RankedMutex::new(
                LockRank::PageAlloc,
                PageState {
                    free: BTreeMap::new(),
                    arenas_committed: 0,
                    next_span: 0,
                    free_span_ids: Vec::new(),
                    scavenged: AtomicBitmap::new(total_pages),
                    dirty: AtomicBitmap::new(total_pages),
                },
            ),
            vm,
            heap_sys: AtomicUsize::new(0),
            heap_inuse: AtomicUsize::new(0),
            heap_released: AtomicUsize::new(0),
        })
    }

    #[inline]
    pub fn reservation(&self) -> &VirtualMemory {
        &self.vm
    }

    #[inline]
    pub fn arenas(&self) -> &ArenaTable {
        &self.arenas
    }

    #[inline]
    pub fn spans(&self) -> &SpanPool {
        &self.spans
    }

    #[inline]
    fn page_of(&self, addr: usize) -> usize {
        (addr - self.vm.start()) >> PAGE_SHIFT
    }

    #[inline]
    fn page_addr(&self, page: usize) -> usize {
        self.vm.start() + (page << PAGE_SHIFT)
    }

    /// Span owning `addr`, if any. `addr` may be anywhere.
    pub fn span_of(&self, addr: usize) -> Option<&Span> {
        if !self.vm.contains(addr) {
            return None;
        }
        let id = self.arenas.get(addr)?.span_at(addr)?;
        Some(self.spans.get(id))
    }

    pub fn alloc_span(
        &self,
        npages: usize,
        spanclass: SpanClass,
        elemsize: usize,
        nelems: usize,
        sweepgen: u32,
    ) -> Result<&Span, Fatal> {
        let mut st = self.state.lock();
        let (start, run) = match Self::find_run(&st, npages) {
            Some(found) => found,
            None => {
                self.grow(&mut st, npages)?;
                Self::find_run(&st, npages).ok_or(Fatal::OutOfAddressSpace {
                    requested: npages << PAGE_SHIFT,
                })?
            }
        };

        st.free.remove(&start);
        if run.npages > npages {
            st.free.insert(
                start + npages,
                FreeRun {
                    npages: run.npages - npages,
                    free_since: run.free_since,
                },
            );
        }

        let end = start + npages;
        let mut reused = 0;
        let mut result = Ok(());
        for_each_set_range(&st.scavenged, start, end, |lo, hi| {
            if result.is_ok() {
                result = self
                    .vm
                    .reuse(self.page_addr(lo), (hi - lo) << PAGE_SHIFT)
                    .map_err(Fatal::OsMemory);
                reused += hi - lo;
            }
        });
        result?;
        st.scavenged.set_range_to(start, end, false);
        self.heap_released
            .fetch_sub(reused << PAGE_SHIFT, Ordering::Relaxed);

        let needzero = (start..end).any(|p| st.dirty.get(p));
        st.dirty.set_range_to(start, end, true);

        let id = match st.free_span_ids.pop() {
            Some(id) => id,
            None => {
                let id = SpanId::from_index(st.next_span);
                st.next_span += 1;
                id
            }
        };
        drop(st);

        let span = self.spans.slot(id);
        span.init(
            self.page_addr(start),
            npages,
            spanclass,
            elemsize,
            nelems,
            sweepgen,
            needzero,
        );
        self.set_span_pages(start, npages, Some(id));
        self.spans.note_alloc();
        self.heap_inuse
            .fetch_add(npages << PAGE_SHIFT, Ordering::Relaxed);
        Ok(span)
    }

    /// Returns the pages of `span` to the free index.
    pub fn free_span(&self, span: &Span) {
        let mut st = self.state.lock();
        span.retire();
        let start = self.page_of(span.base());
        let npages = span.npages();
        self.set_span_pages(start, npages, None);

        let overlaps = st.free.range(start..start + npages).next().is_some()
            || st
                .free
                .range(..start)
                .next_back()
                .map_or(false, |(&s, r)| s + r.npages > start);
        if overlaps {
            drop(st);
            crate::fatal::throw(Fatal::DoubleFree { addr: span.base() });
        }

        let mut run_start = start;
        let mut run_pages = npages;
        if let Some((&prev, prev_run)) = st.free.range(..start).next_back() {
            if prev + prev_run.npages == start {
                run_start = prev;
                run_pages += prev_run.npages;
            }
        }
        if run_start != start {
            st.free.remove(&run_start);
        }
        if let Some(next) = st.free.remove(&(start + npages)) {
            run_pages += next.npages;
        }
        st.free.insert(
            run_start,
            FreeRun {
                npages: run_pages,
                free_since: Instant::now(),
            },
        );
        st.free_span_ids.push(span.id());
        self.spans.note_free();
        self.heap_inuse
            .fetch_sub(npages << PAGE_SHIFT, Ordering::Relaxed);
    }

    fn find_run(st: &PageState, npages: usize) -> Option<(usize, FreeRun)> {
        st.free
            .iter()
            .find(|(_, run)| run.npages >= npages)
            .map(|(&start, &run)| (start, run))
    }

    /// Commits enough new arenas at the end of the heap for a run of
    /// `npages` pages.
    fn grow(&self, st: &mut PageState, npages: usize) -> Result<(), Fatal> {
        let committed_end = st.arenas_committed * PAGES_PER_ARENA;
        let tail = st
            .free
            .range(..committed_end)
            .next_back()
            .filter(|&(&s, r)| s + r.npages == committed_end)
            .map(|(&s, r)| (s, r.npages));
        let needed = npages - tail.map_or(0, |(_, n)| n);
        let narenas = (needed + PAGES_PER_ARENA - 1) / PAGES_PER_ARENA;

        if st.arenas_committed + narenas > self.arenas.capacity() {
            return Err(Fatal::OutOfAddressSpace {
                requested: npages << PAGE_SHIFT,
            });
        }

        let base = self.arenas.arena_base(st.arenas_committed);
        self.vm
            .commit(base, narenas * ARENA_SIZE)
            .map_err(Fatal::OsMemory)?;
        for index in st.arenas_committed..st.arenas_committed + narenas {
            self.arenas.install(index);
        }
        st.arenas_committed += narenas;

        let new_pages = narenas * PAGES_PER_ARENA;
        // Fresh memory is not backed by physical pages yet.
        st.scavenged
            .set_range_to(committed_end, committed_end + new_pages, true);
        self.heap_released
            .fetch_add(new_pages << PAGE_SHIFT, Ordering::Relaxed);
        self.heap_sys
            .fetch_add(narenas * ARENA_SIZE, Ordering::Relaxed);

        let (run_start, run_pages) = match tail {
            Some((s, n)) => {
                st.free.remove(&s);
                (s, n + new_pages)
            }
            None => (committed_end, new_pages),
        };
        st.free.insert(
            run_start,
            FreeRun {
                npages: run_pages,
                free_since: Instant::now(),
            },
        );
        log::debug!(target: "gc", "heap grown by {} arena(s), {} committed", narenas, crate::base::formatted_size(st.arenas_committed * ARENA_SIZE));
        Ok(())
    }

    fn set_span_pages(&self, start: usize, npages: usize, span: Option<SpanId>) {
        let end = start + npages;
        let mut page = start;
        while page < end {
            let addr = self.page_addr(page);
            let arena = match self.arenas.get(addr) {
                Some(arena) => arena,
                None => crate::fatal::throw(Fatal::SpanCorruption {
                    span: span.map_or(u32::MAX, |s| s.index() as u32),
                    detail: "span pages outside committed arenas",
                }),
            };
            let first = arena.page_index(addr);
            let n = (end - page).min(PAGES_PER_ARENA - first);
            arena.set_page_spans(first, n, span);
            page += n;
        }
    }

    /// Releases up to `max_bytes` of free memory to the OS, highest address
    /// first. With `min_idle` only runs that have been free at least that
    /// long are considered. Returns the number of bytes released.
    pub fn scavenge(&self, max_bytes: usize, min_idle: Option<Duration>) -> Result<usize, Fatal> {
        let st = self.state.lock();
        let now = Instant::now();
        let unit = (page_size().max(PAGE_SIZE)) >> PAGE_SHIFT;
        let mut released = 0usize;

        for (&start, run) in st.free.iter().rev() {
            if released >= max_bytes {
                break;
            }
            if let Some(idle) = min_idle {
                if now.duration_since(run.free_since) < idle {
                    continue;
                }
            }

            let mut page = start + run.npages;
            while page > start && released < max_bytes {
                page -= 1;
                if st.scavenged.get(page) {
                    continue;
                }
                let hi = page + 1;
                let mut lo = page;
                while lo > start
                    && !st.scavenged.get(lo - 1)
                    && ((hi - lo) << PAGE_SHIFT) < max_bytes - released
                {
                    lo -= 1;
                }
                page = lo;

                let lo_aligned = (lo + unit - 1) / unit * unit;
                let hi_aligned = hi / unit * unit;
                if lo_aligned >= hi_aligned {
                    continue;
                }

                self.vm
                    .release(
                        self.page_addr(lo_aligned),
                        (hi_aligned - lo_aligned) << PAGE_SHIFT,
                    )
                    .map_err(Fatal::OsMemory)?;
                st.scavenged.set_range_to(lo_aligned, hi_aligned, true);
                if RELEASE_ZEROES {
                    st.dirty.set_range_to(lo_aligned, hi_aligned, false);
                }
                let bytes = (hi_aligned - lo_aligned) << PAGE_SHIFT;
                released += bytes;
                self.heap_released.fetch_add(bytes, Ordering::Relaxed);
            }
        }
        Ok(released)
    }

    /// Bytes of address space committed to the heap.
    pub fn heap_sys(&self) -> usize {
        self.heap_sys.load(Ordering::Relaxed)
    }

    /// Bytes in pages owned by spans.
    pub fn heap_inuse(&self) -> usize {
        self.heap_inuse.load(Ordering::Relaxed)
    }

    /// Bytes in free pages.
    pub fn heap_idle(&self) -> usize {
        self.heap_sys() - self.heap_inuse()
    }

    /// Bytes of free pages not backed by physical memory: pages returned
    /// to the OS plus committed pages never handed out.
    pub fn heap_released(&self) -> usize {
        self.heap_released.load(Ordering::Relaxed)
    }

    /// Bytes the heap keeps physically resident.
    pub fn retained(&self) -> usize {
        self.heap_sys() - self.heap_released()
    }

    pub fn free_runs(&self) -> Vec<FreeRunInfo> {
        let st = self.state.lock();
        st.free
            .iter()
            .map(|(&start, run)| FreeRunInfo {
                base: Address::from_usize(self.page_addr(start)),
                npages: run.npages,
                scavenged_pages: (start..start + run.npages)
                    .filter(|&p| st.scavenged.get(p))
                    .count(),
            })
            .collect()
    }

    pub fn metadata_bytes(&self) -> usize {
        self.arenas.iter().map(|a| a.metadata_bytes()).sum()
    }
}

/// Calls `f(lo, hi)` for every maximal run of set bits in `[from, to)`.
fn for_each_set_range(bits: &AtomicBitmap, from: usize, to: usize, mut f: impl FnMut(usize, usize)) {
    let mut i = from;
    while i < to {
        if !bits.get(i) {
            i += 1;
            continue;
        }
        let lo = i;
        while i < to && bits.get(i) {
            i += 1;
        }
        f(lo, i);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::span::SpanState;

    fn pages() -> PageAllocator {
        PageAllocator::new(16 * ARENA_SIZE).unwrap()
    }

    #[test]
    fn first_fit_and_coalescing() {
        let pa = pages();
        let a = pa.alloc_span(1, SpanClass::new(6, false), 64, 128, 0).unwrap();
        let b = pa.alloc_span(4, SpanClass::LARGE_SCAN, 4 * PAGE_SIZE, 1, 0).unwrap();
        let c = pa.alloc_span(1, SpanClass::new(6, false), 64, 128, 0).unwrap();
        assert_eq!(b.base(), a.end());
        assert_eq!(c.base(), b.end());
        assert_eq!(pa.spans().in_use(), 3);
        assert_eq!(pa.heap_inuse(), 6 * PAGE_SIZE);
        assert_eq!(pa.heap_sys(), ARENA_SIZE);

        let b_base = b.base();
        pa.free_span(b);
        assert_eq!(pa.spans().in_use(), 2);
        // The hole is reused first fit.
        let d = pa.alloc_span(2, SpanClass::LARGE_SCAN, 2 * PAGE_SIZE, 1, 0).unwrap();
        assert_eq!(d.base(), b_base);
        assert!(d.needzero.load(Ordering::Relaxed));

        pa.free_span(d);
        pa.free_span(a);
        pa.free_span(c);
        let runs = pa.free_runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].npages, PAGES_PER_ARENA);
        assert_eq!(pa.heap_inuse(), 0);
    }

    #[test]
    fn span_lookup() {
        let pa = pages();
        let s = pa.alloc_span(3, SpanClass::LARGE_NOSCAN, 3 * PAGE_SIZE, 1, 0).unwrap();
        assert_eq!(s.state(), SpanState::InUse);
        let found = pa.span_of(s.base() + 2 * PAGE_SIZE + 100).unwrap();
        assert_eq!(found.id(), s.id());
        assert!(pa.span_of(s.end()).is_none());
        assert!(pa.span_of(8).is_none());
        pa.free_span(s);
        assert!(pa.span_of(s.base()).is_none());
    }

    #[test]
    fn large_runs_span_arenas() {
        let pa = pages();
        let s = pa
            .alloc_span(PAGES_PER_ARENA + 10, SpanClass::LARGE_NOSCAN, 0, 1, 0)
            .unwrap();
        assert_eq!(pa.heap_sys(), 2 * ARENA_SIZE);
        assert!(!s.needzero.load(Ordering::Relaxed));
        assert_eq!(
            pa.span_of(s.base() + (PAGES_PER_ARENA + 5) * PAGE_SIZE).map(|s| s.id()),
            Some(s.id())
        );
    }

    #[test]
    fn address_space_exhaustion_is_reported() {
        let pa = PageAllocator::new(2 * ARENA_SIZE).unwrap();
        assert!(matches!(
            pa.alloc_span(3 * PAGES_PER_ARENA, SpanClass::LARGE_NOSCAN, 0, 1, 0),
            Err(Fatal::OutOfAddressSpace { .. })
        ));
    }

    #[test]
    fn scavenge_releases_idle_pages() {
        let pa = pages();
        let s = pa.alloc_span(64, SpanClass::LARGE_NOSCAN, 64 * PAGE_SIZE, 1, 0).unwrap();
        let base = s.base();
        unsafe {
            std::ptr::write_bytes(base as *mut u8, 0xab, 64 * PAGE_SIZE);
        }
        pa.free_span(s);
        let released_before = pa.heap_released();

        // Just freed, not idle long enough.
        assert_eq!(pa.scavenge(usize::MAX, Some(Duration::from_secs(60))).unwrap(), 0);
        assert_eq!(pa.heap_released(), released_before);

        let mut total = 0;
        loop {
            let n = pa.scavenge(64 * 1024, None).unwrap();
            if n == 0 {
                break;
            }
            assert!(n <= 64 * 1024);
            total += n;
        }
        assert_eq!(total, 64 * PAGE_SIZE);
        assert_eq!(pa.heap_released(), pa.heap_sys());

        let s = pa.alloc_span(64, SpanClass::LARGE_NOSCAN, 64 * PAGE_SIZE, 1, 0).unwrap();
        assert_eq!(s.needzero.load(Ordering::Relaxed), !RELEASE_ZEROES);
        if RELEASE_ZEROES {
            unsafe { assert_eq!(*(s.base() as *const u8), 0) };
        }
    }
}
