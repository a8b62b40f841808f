//! Allocation paths.
//!
//! Requests take one of three routes. Tiny pointer-free requests are
//! packed into a shared 16 byte block, other small requests take a slot of
//! their size class from the thread cache, and large ones get a dedicated
//! span straight from the page allocator. The fast routes never leave the
//! cache; [`alloc_slow`] refills it.

use std::sync::atomic::Ordering;

use crate::{
    base::{div_round_up, WORD_SIZE},
    fatal::Fatal,
};

use super::{
    cache::ThreadCache,
    heap::Heap,
    heap_bits::{write_pointer_bits, ObjectBits, PointerLayout},
    size_classes::{class_npages, class_size, large_npages, size_to_class, SpanClass},
    span::Span,
    Address, ARENA_SIZE, MAX_SMALL_SIZE, PAGE_SHIFT, TINY_SIZE,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SizeKind {
    Tiny,
    Small(SpanClass),
    Large { npages: usize, noscan: bool },
}

impl SizeKind {
    pub(crate) fn of(size: usize, noscan: bool) -> Self {
        if noscan && size < TINY_SIZE {
            SizeKind::Tiny
        } else if size <= MAX_SMALL_SIZE {
            SizeKind::Small(SpanClass::new(size_to_class(size), noscan))
        } else {
            SizeKind::Large {
                npages: large_npages(size),
                noscan,
            }
        }
    }

    /// Upper bound of the live heap growth a slow path allocation causes.
    pub(crate) fn refill_bytes(self) -> usize {
        match self {
            SizeKind::Tiny => class_npages(tiny_class().sizeclass()) << PAGE_SHIFT,
            SizeKind::Small(spanclass) => class_npages(spanclass.sizeclass()) << PAGE_SHIFT,
            SizeKind::Large { npages, .. } => npages << PAGE_SHIFT,
        }
    }
}

#[inline]
fn tiny_class() -> SpanClass {
    SpanClass::new(size_to_class(TINY_SIZE), true)
}

/// Allocates from what the cache already holds.
pub(crate) fn alloc_fast(
    heap: &Heap,
    cache: &mut ThreadCache,
    size: usize,
    layout: &PointerLayout,
    kind: SizeKind,
) -> Option<Address> {
    match kind {
        SizeKind::Tiny => {
            if let Some(addr) = cache.tiny_alloc(size) {
                return Some(addr);
            }
            let spanclass = tiny_class();
            let (block, span) = cache.next_free(heap, spanclass)?;
            init_object(heap, cache, block, span, TINY_SIZE, layout);
            cache.offer_tiny(block, size);
            Some(block)
        }
        SizeKind::Small(spanclass) => {
            let (obj, span) = cache.next_free(heap, spanclass)?;
            init_object(heap, cache, obj, span, size, layout);
            Some(obj)
        }
        SizeKind::Large { .. } => None,
    }
}

/// Refills the cache (or carves a large span) and allocates.
pub(crate) fn alloc_slow(
    heap: &Heap,
    cache: &mut ThreadCache,
    size: usize,
    layout: &PointerLayout,
    kind: SizeKind,
) -> Address {
    match kind {
        SizeKind::Tiny | SizeKind::Small(_) => {
            let spanclass = match kind {
                SizeKind::Small(spanclass) => spanclass,
                _ => tiny_class(),
            };
            let span = cache.refill(heap, spanclass);
            match alloc_fast(heap, cache, size, layout, kind) {
                Some(addr) => addr,
                None => heap.throw(Fatal::SpanCorruption {
                    span: span.id().index() as u32,
                    detail: "fresh cache span has no free slot",
                }),
            }
        }
        SizeKind::Large { npages, noscan } => alloc_large(heap, cache, size, npages, noscan, layout),
    }
}

fn alloc_large(
    heap: &Heap,
    cache: &mut ThreadCache,
    size: usize,
    npages: usize,
    noscan: bool,
    layout: &PointerLayout,
) -> Address {
    let spanclass = if noscan {
        SpanClass::LARGE_NOSCAN
    } else {
        SpanClass::LARGE_SCAN
    };
    let sweepgen = heap.sweepgen();
    let span = match heap
        .pages()
        .alloc_span(npages, spanclass, npages << PAGE_SHIFT, 1, sweepgen)
    {
        Ok(span) => span,
        Err(err) => heap.throw(err),
    };
    heap.pacer().add_live(span.bytes());

    let obj = Address::from_usize(span.base());
    ObjectBits::of(heap.arena_for(span.base()), obj.to_usize()).set_allocated(true);
    span.alloc_count.store(1, Ordering::Release);
    span.free_index.store(1, Ordering::Relaxed);
    init_object(heap, cache, obj, span, size, layout);
    heap.central(spanclass).add_large(sweepgen, span);

    cache.local.large_alloc += span.bytes() as u64;
    cache.local.large_allocs += 1;
    obj
}

/// Prepares a freshly claimed slot: zeroes it if needed, records its
/// pointer words and marks it with the current polarity. During a cycle
/// that makes it black; otherwise the next polarity flip makes it white.
fn init_object(
    heap: &Heap,
    cache: &mut ThreadCache,
    obj: Address,
    span: &Span,
    size: usize,
    layout: &PointerLayout,
) {
    let elemsize = span.elemsize();
    if span.needzero.load(Ordering::Relaxed) {
        // SAFETY: the slot lies in committed memory of an in-use span and
        // is not reachable by anyone yet.
        unsafe { std::ptr::write_bytes(obj.to_usize() as *mut u8, 0, elemsize) };
    }

    if !span.spanclass().noscan() {
        write_object_bits(heap, obj, size, elemsize, layout);
    }

    let bits = ObjectBits::of(heap.arena_for(obj.to_usize()), obj.to_usize());
    bits.set_marked(heap.mark_polarity());
    if heap.phase().in_cycle() {
        heap.pacer().note_mark_work(elemsize, 0);
    }

    if !span.spanclass().is_large() {
        cache.local.nmalloc[span.spanclass().sizeclass() as usize] += 1;
    }
}

fn write_object_bits(heap: &Heap, obj: Address, size: usize, elemsize: usize, layout: &PointerLayout) {
    let start = obj.to_usize();
    let arena = heap.arena_for(start);
    if start + elemsize <= arena.base() + ARENA_SIZE {
        write_pointer_bits(arena, start, size, elemsize, layout);
        return;
    }

    let nwords = div_round_up(size, WORD_SIZE);
    let end = start + elemsize;
    let mut addr = start;
    let mut word = 0;
    while addr < end {
        let arena = heap.arena_for(addr);
        let chunk_end = end.min(arena.base() + ARENA_SIZE);
        while addr < chunk_end {
            arena
                .ptr_bits
                .set_to(arena.word_index(addr), word < nwords && layout.is_pointer(word));
            addr += WORD_SIZE;
            word += 1;
        }
    }
}

/// Rounded size a request of `size` bytes occupies.
pub fn alloc_size(size: usize, noscan: bool) -> usize {
    match SizeKind::of(size.max(1), noscan) {
        SizeKind::Tiny => size.max(1),
        SizeKind::Small(spanclass) => class_size(spanclass.sizeclass()),
        SizeKind::Large { npages, .. } => npages << PAGE_SHIFT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::PAGE_SIZE;

    #[test]
    fn routes() {
        assert_eq!(SizeKind::of(8, true), SizeKind::Tiny);
        assert_eq!(SizeKind::of(15, true), SizeKind::Tiny);
        assert!(matches!(SizeKind::of(8, false), SizeKind::Small(c) if !c.noscan()));
        assert!(matches!(SizeKind::of(16, true), SizeKind::Small(c) if c.noscan()));
        assert_eq!(
            SizeKind::of(MAX_SMALL_SIZE + 1, false),
            SizeKind::Large {
                npages: 5,
                noscan: false
            }
        );
    }

    #[test]
    fn rounded_sizes() {
        assert_eq!(alloc_size(0, true), 1);
        assert_eq!(alloc_size(60, false), 64);
        assert_eq!(alloc_size(33 * 1024, false), 5 * PAGE_SIZE);
        assert_eq!(SizeKind::of(64, false).refill_bytes(), PAGE_SIZE);
    }
}
