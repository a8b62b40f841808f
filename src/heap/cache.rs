//! Per mutator allocation cache.
//!
//! A [`ThreadCache`] owns at most one span per span class and hands out
//! its free slots without touching any shared lock. Spans come from and go
//! back to the class's [`SpanCentral`](super::central::SpanCentral). The
//! free space of a span counts as live heap from the moment it is cached,
//! so the pacer sees allocation in span sized steps.

use std::sync::atomic::Ordering;

use super::{
    heap::Heap,
    heap_bits::ObjectBits,
    size_classes::{SpanClass, NUM_SPAN_CLASSES},
    span::{Span, SpanId},
    stats::LocalStats,
    Address, TINY_SIZE,
};

pub struct ThreadCache {
    spans: Box<[Option<SpanId>]>,
    /// Current tiny block and the offset of its first free byte.
    tiny: Address,
    tiny_offset: usize,
    pub(crate) local: LocalStats,
}

impl ThreadCache {
    pub fn new() -> Self {
        Self {
            spans: vec![None; NUM_SPAN_CLASSES].into_boxed_slice(),
            tiny: Address::NULL,
            tiny_offset: 0,
            local: LocalStats::new(),
        }
    }

    pub fn cached(&self, spanclass: SpanClass) -> Option<SpanId> {
        self.spans[spanclass.index()]
    }

    /// Claims the next free slot of the cached span of `spanclass`. The
    /// slot's allocation bit is set; everything else is up to the caller.
    pub(crate) fn next_free<'h>(
        &mut self,
        heap: &'h Heap,
        spanclass: SpanClass,
    ) -> Option<(Address, &'h Span)> {
        let span = heap.pages().spans().get(self.spans[spanclass.index()]?);
        let arena = heap.arena_for(span.base());
        let nelems = span.nelems();
        let mut index = span.free_index.load(Ordering::Relaxed);
        while index < nelems {
            let obj = span.object_base(index);
            let bits = ObjectBits::of(arena, obj.to_usize());
            index += 1;
            if !bits.is_allocated() {
                bits.set_allocated(true);
                span.free_index.store(index, Ordering::Relaxed);
                span.alloc_count.fetch_add(1, Ordering::AcqRel);
                return Some((obj, span));
            }
        }
        span.free_index.store(nelems, Ordering::Relaxed);
        None
    }

    /// Swaps the exhausted span of `spanclass` for one with free slots.
    pub(crate) fn refill<'h>(&mut self, heap: &'h Heap, spanclass: SpanClass) -> &'h Span {
        if let Some(id) = self.spans[spanclass.index()].take() {
            self.uncache(heap, heap.pages().spans().get(id));
        }
        heap.stats().flush_local(&mut self.local);

        let span = heap.central(spanclass).cache_span(heap);
        heap.pacer().add_live(span.free_bytes());
        self.spans[spanclass.index()] = Some(span.id());
        span
    }

    fn uncache(&mut self, heap: &Heap, span: &Span) {
        heap.pacer().sub_live(span.free_bytes());
        heap.central(span.spanclass()).uncache_span(heap, span);
    }

    /// Sub-allocates `size` bytes from the current tiny block.
    pub(crate) fn tiny_alloc(&mut self, size: usize) -> Option<Address> {
        if self.tiny.is_null() {
            return None;
        }
        let offset = align_tiny(self.tiny_offset, size);
        if offset + size > TINY_SIZE {
            return None;
        }
        self.tiny_offset = offset + size;
        self.local.tiny_allocs += 1;
        Some(self.tiny.add(offset))
    }

    /// Offers a fresh tiny block of which the first `used` bytes are taken.
    /// It replaces the current block when it has more room left.
    pub(crate) fn offer_tiny(&mut self, block: Address, used: usize) {
        if self.tiny.is_null() || used < self.tiny_offset {
            self.tiny = block;
            self.tiny_offset = used;
        }
    }

    pub(crate) fn reset_tiny(&mut self) {
        self.tiny = Address::NULL;
        self.tiny_offset = 0;
    }

    /// Gives every cached span back to its central list and folds local
    /// statistics into the heap's.
    pub(crate) fn release_all(&mut self, heap: &Heap) {
        for i in 0..self.spans.len() {
            if let Some(id) = self.spans[i].take() {
                self.uncache(heap, heap.pages().spans().get(id));
            }
        }
        self.reset_tiny();
        heap.stats().flush_local(&mut self.local);
    }

    pub fn is_empty(&self) -> bool {
        self.spans.iter().all(Option::is_none) && self.tiny.is_null()
    }
}

impl Default for ThreadCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Aligns a tiny offset to the natural alignment of `size`.
fn align_tiny(offset: usize, size: usize) -> usize {
    if size & 7 == 0 {
        (offset + 7) & !7
    } else if size & 3 == 0 {
        (offset + 3) & !3
    } else if size & 1 == 0 {
        (offset + 1) & !1
    } else {
        offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiny_alignment() {
        assert_eq!(align_tiny(1, 8), 8);
        assert_eq!(align_tiny(1, 4), 4);
        assert_eq!(align_tiny(5, 2), 6);
        assert_eq!(align_tiny(5, 3), 5);
        assert_eq!(align_tiny(0, 8), 0);
    }

    #[test]
    fn tiny_block_packing() {
        let mut cache = ThreadCache::new();
        assert_eq!(cache.tiny_alloc(4), None);

        let block = Address::from_usize(0x1000);
        cache.offer_tiny(block, 3);
        assert_eq!(cache.tiny_alloc(4), Some(Address::from_usize(0x1004)));
        assert_eq!(cache.tiny_alloc(1), Some(Address::from_usize(0x1008)));
        assert_eq!(cache.tiny_alloc(8), None);
        assert_eq!(cache.tiny_alloc(7), Some(Address::from_usize(0x1009)));
        assert_eq!(cache.local.tiny_allocs, 3);

        // A full block is replaced by any fresh one.
        cache.offer_tiny(Address::from_usize(0x2000), 15);
        assert_eq!(cache.tiny_alloc(1), Some(Address::from_usize(0x200f)));
        cache.offer_tiny(Address::from_usize(0x3000), 8);
        // A block with less room left does not replace the current one.
        cache.offer_tiny(Address::from_usize(0x4000), 12);
        assert_eq!(cache.tiny_alloc(8), Some(Address::from_usize(0x3008)));

        cache.reset_tiny();
        assert!(cache.is_empty());
    }
}
