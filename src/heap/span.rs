//! Spans and the slot pool that owns them.
//!
//! Spans are never referenced by pointer. Everything that needs one (page
//! table, central lists, thread caches) stores a [`SpanId`], an index into
//! [`SpanPool`]. All span fields are atomics so that the marker can resolve
//! pointers while the owning cache allocates from the span.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};

use once_cell::sync::OnceCell;

use crate::fatal::{throw, Fatal};

use super::{size_classes::SpanClass, Address, PAGE_SHIFT};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct SpanId(u32);

impl SpanId {
    pub const fn from_index(index: u32) -> Self {
        Self(index)
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Encoding used by the page table, where 0 means "no span".
    pub const fn to_raw(self) -> u32 {
        self.0 + 1
    }

    pub const fn from_raw(raw: u32) -> Option<Self> {
        if raw == 0 {
            None
        } else {
            Some(Self(raw - 1))
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum SpanState {
    /// Slot never handed out.
    Free,
    /// Owns pages and objects.
    InUse,
    /// Pages went back to the page allocator; the slot waits for reuse.
    Retired,
}

pub struct Span {
    id: SpanId,
    base: AtomicUsize,
    npages: AtomicUsize,
    state: AtomicU8,
    spanclass: AtomicU8,
    elemsize: AtomicUsize,
    nelems: AtomicUsize,
    pub(crate) sweepgen: AtomicU32,
    pub(crate) alloc_count: AtomicUsize,
    pub(crate) free_index: AtomicUsize,
    pub(crate) needzero: AtomicBool,
    /// Finalizers or cleanups are registered for objects in this span.
    pub(crate) has_specials: AtomicBool,
}

impl Span {
    fn new(id: SpanId) -> Self {
        Self {
            id,
            base: AtomicUsize::new(0),
            npages: AtomicUsize::new(0),
            state: AtomicU8::new(SpanState::Free as u8),
            spanclass: AtomicU8::new(0),
            elemsize: AtomicUsize::new(0),
            nelems: AtomicUsize::new(0),
            sweepgen: AtomicU32::new(0),
            alloc_count: AtomicUsize::new(0),
            free_index: AtomicUsize::new(0),
            needzero: AtomicBool::new(false),
            has_specials: AtomicBool::new(false),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn init(
        &self,
        base: usize,
        npages: usize,
        spanclass: SpanClass,
        elemsize: usize,
        nelems: usize,
        sweepgen: u32,
        needzero: bool,
    ) {
        if self.state() == SpanState::InUse {
            throw(Fatal::SpanCorruption {
                span: self.id.0,
                detail: "initialising a span that is in use",
            });
        }
        self.base.store(base, Ordering::Relaxed);
        self.npages.store(npages, Ordering::Relaxed);
        self.spanclass.store(spanclass.0, Ordering::Relaxed);
        self.elemsize.store(elemsize, Ordering::Relaxed);
        self.nelems.store(nelems, Ordering::Relaxed);
        self.sweepgen.store(sweepgen, Ordering::Relaxed);
        self.alloc_count.store(0, Ordering::Relaxed);
        self.free_index.store(0, Ordering::Relaxed);
        self.needzero.store(needzero, Ordering::Relaxed);
        self.has_specials.store(false, Ordering::Relaxed);
        self.state.store(SpanState::InUse as u8, Ordering::Release);
    }

    pub(crate) fn retire(&self) {
        if self
            .state
            .compare_exchange(
                SpanState::InUse as u8,
                SpanState::Retired as u8,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_err()
        {
            throw(Fatal::DoubleFree { addr: self.base() });
        }
    }

    pub fn id(&self) -> SpanId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> SpanState {
        match self.state.load(Ordering::Acquire) {
            0 => SpanState::Free,
            1 => SpanState::InUse,
            _ => SpanState::Retired,
        }
    }

    #[inline]
    pub fn base(&self) -> usize {
        self.base.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn npages(&self) -> usize {
        self.npages.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn bytes(&self) -> usize {
        self.npages() << PAGE_SHIFT
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.base() + self.bytes()
    }

    #[inline]
    pub fn spanclass(&self) -> SpanClass {
        SpanClass(self.spanclass.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn elemsize(&self) -> usize {
        self.elemsize.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn nelems(&self) -> usize {
        self.nelems.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn allocated(&self) -> usize {
        self.alloc_count.load(Ordering::Acquire)
    }

    pub fn is_full(&self) -> bool {
        self.allocated() == self.nelems()
    }

    pub fn free_bytes(&self) -> usize {
        (self.nelems() - self.allocated()) * self.elemsize()
    }

    /// Slot index of `addr`, or `None` for the tail that no object covers.
    #[inline]
    pub fn object_index(&self, addr: usize) -> Option<usize> {
        let index = (addr - self.base()) / self.elemsize();
        if index < self.nelems() {
            Some(index)
        } else {
            None
        }
    }

    #[inline]
    pub fn object_base(&self, index: usize) -> Address {
        Address::from_usize(self.base() + index * self.elemsize())
    }

    /// Addresses of every slot in the span.
    pub fn slots(&self) -> impl Iterator<Item = Address> {
        let base = self.base();
        let elemsize = self.elemsize();
        (0..self.nelems()).map(move |i| Address::from_usize(base + i * elemsize))
    }
}

const SPANS_PER_CHUNK: usize = 1024;

/// Arena of span slots addressed by [`SpanId`]. Chunks are allocated on
/// first use and live as long as the heap. Handing out and recycling ids is
/// the page allocator's job; the pool only stores the slots.
pub struct SpanPool {
    chunks: Box<[OnceCell<Box<[Span]>>]>,
    live: AtomicUsize,
}

impl SpanPool {
    pub fn new(max_spans: usize) -> Self {
        let nchunks = (max_spans + SPANS_PER_CHUNK - 1) / SPANS_PER_CHUNK;
        Self {
            chunks: (0..nchunks.max(1)).map(|_| OnceCell::new()).collect(),
            live: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.chunks.len() * SPANS_PER_CHUNK
    }

    #[inline]
    pub fn get(&self, id: SpanId) -> &Span {
        let chunk = match self
            .chunks
            .get(id.index() / SPANS_PER_CHUNK)
            .and_then(|c| c.get())
        {
            Some(chunk) => chunk,
            None => throw(Fatal::SpanCorruption {
                span: id.0,
                detail: "span id outside the pool",
            }),
        };
        &chunk[id.index() % SPANS_PER_CHUNK]
    }

    /// Slot for `id`, allocating its chunk if needed.
    pub(crate) fn slot(&self, id: SpanId) -> &Span {
        let chunk_index = id.index() / SPANS_PER_CHUNK;
        let chunk = self.chunks[chunk_index].get_or_init(|| {
            (0..SPANS_PER_CHUNK)
                .map(|i| Span::new(SpanId((chunk_index * SPANS_PER_CHUNK + i) as u32)))
                .collect()
        });
        &chunk[id.index() % SPANS_PER_CHUNK]
    }

    pub(crate) fn note_alloc(&self) {
        self.live.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_free(&self) {
        self.live.fetch_sub(1, Ordering::Relaxed);
    }

    /// Spans currently in use.
    pub fn in_use(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_and_objects() {
        let pool = SpanPool::new(10);
        let id = SpanId::from_index(3);
        let span = pool.slot(id);
        assert_eq!(span.state(), SpanState::Free);

        span.init(0x10000, 1, SpanClass::new(6, false), 64, 128, 4, false);
        assert_eq!(pool.get(id).state(), SpanState::InUse);
        assert_eq!(span.object_index(0x10000 + 130), Some(2));
        assert_eq!(span.object_base(2).to_usize(), 0x10000 + 128);
        assert_eq!(span.slots().count(), 128);
        assert_eq!(span.free_bytes(), 8192);

        span.retire();
        assert_eq!(span.state(), SpanState::Retired);
        assert_eq!(SpanId::from_raw(id.to_raw()), Some(id));
        assert_eq!(SpanId::from_raw(0), None);
    }

    #[test]
    fn tail_waste_is_not_an_object() {
        let pool = SpanPool::new(1);
        let span = pool.slot(SpanId::from_index(0));
        // 48 byte objects leave 32 bytes unused at the end of a page.
        span.init(0x20000, 1, SpanClass::new(5, true), 48, 170, 0, false);
        assert_eq!(span.object_index(0x20000 + 170 * 48), None);
        assert_eq!(span.object_index(0x20000 + 169 * 48 + 47), Some(169));
    }
}
