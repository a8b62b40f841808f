//! Arenas: 4 MiB committed chunks of the reservation with their side tables.
//!
//! Each arena carries one bit per heap word in three bitmaps:
//! `ptr_bits` (the word holds a pointer), `mark_bits` (set at an object's
//! first word, compared against the heap's mark polarity) and `alloc_bits`
//! (set at an object's first word while the slot is allocated). The
//! page table maps each of the 512 pages to the span that owns it.

use std::sync::atomic::{AtomicU32, Ordering};

use once_cell::sync::OnceCell;

use crate::base::{bitmap::AtomicBitmap, WORD_SIZE_LOG2};

use super::{span::SpanId, ARENA_SIZE, PAGES_PER_ARENA, PAGE_SHIFT, WORDS_PER_ARENA};

pub struct Arena {
    base: usize,
    pub ptr_bits: AtomicBitmap,
    pub mark_bits: AtomicBitmap,
    pub alloc_bits: AtomicBitmap,
    check_marks: OnceCell<AtomicBitmap>,
    page_spans: Box<[AtomicU32]>,
}

impl Arena {
    pub fn new(base: usize) -> Self {
        Self {
            base,
            ptr_bits: AtomicBitmap::new(WORDS_PER_ARENA),
            mark_bits: AtomicBitmap::new(WORDS_PER_ARENA),
            alloc_bits: AtomicBitmap::new(WORDS_PER_ARENA),
            check_marks: OnceCell::new(),
            page_spans: (0..PAGES_PER_ARENA).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    #[inline(always)]
    pub fn word_index(&self, addr: usize) -> usize {
        (addr - self.base) >> WORD_SIZE_LOG2
    }

    #[inline(always)]
    pub fn page_index(&self, addr: usize) -> usize {
        (addr - self.base) >> PAGE_SHIFT
    }

    #[inline]
    pub fn span_at(&self, addr: usize) -> Option<SpanId> {
        SpanId::from_raw(self.page_spans[self.page_index(addr)].load(Ordering::Acquire))
    }

    /// Points pages `[first, first + npages)` of this arena at `span`.
    pub fn set_page_spans(&self, first: usize, npages: usize, span: Option<SpanId>) {
        let raw = span.map(SpanId::to_raw).unwrap_or(0);
        for page in &self.page_spans[first..first + npages] {
            page.store(raw, Ordering::Release);
        }
    }

    /// Bits used by checkmark verification. Allocated the first time a
    /// verification pass runs.
    pub fn check_marks(&self) -> &AtomicBitmap {
        self.check_marks
            .get_or_init(|| AtomicBitmap::new(WORDS_PER_ARENA))
    }

    /// Bytes of side metadata kept for this arena.
    pub fn metadata_bytes(&self) -> usize {
        let bitmap = WORDS_PER_ARENA / 8;
        let checks = if self.check_marks.get().is_some() { bitmap } else { 0 };
        3 * bitmap + checks + PAGES_PER_ARENA * std::mem::size_of::<AtomicU32>()
    }
}

/// Arena slots covering the whole reservation. A slot is filled once, when
/// its arena is committed, and never emptied.
pub struct ArenaTable {
    start: usize,
    slots: Box<[OnceCell<Box<Arena>>]>,
}

impl ArenaTable {
    pub fn new(start: usize, size: usize) -> Self {
        Self {
            start,
            slots: (0..size / ARENA_SIZE).map(|_| OnceCell::new()).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn index_of(&self, addr: usize) -> usize {
        (addr - self.start) / ARENA_SIZE
    }

    pub fn arena_base(&self, index: usize) -> usize {
        self.start + index * ARENA_SIZE
    }

    /// Arena containing `addr`, if committed. `addr` must be inside the
    /// reservation.
    #[inline]
    pub fn get(&self, addr: usize) -> Option<&Arena> {
        self.slots
            .get(self.index_of(addr))
            .and_then(|slot| slot.get())
            .map(|arena| &**arena)
    }

    pub fn install(&self, index: usize) -> &Arena {
        let base = self.arena_base(index);
        self.slots[index].get_or_init(|| Box::new(Arena::new(base)))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arena> {
        self.slots
            .iter()
            .filter_map(|slot| slot.get())
            .map(|arena| &**arena)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::PAGE_SIZE;

    #[test]
    fn page_table() {
        let start = 64 * ARENA_SIZE;
        let table = ArenaTable::new(start, 4 * ARENA_SIZE);
        assert_eq!(table.capacity(), 4);
        assert!(table.get(start + ARENA_SIZE).is_none());

        let arena = table.install(1);
        assert_eq!(arena.base(), start + ARENA_SIZE);
        let id = SpanId::from_index(7);
        arena.set_page_spans(3, 2, Some(id));

        let arena = table.get(start + ARENA_SIZE + 4 * PAGE_SIZE + 16).unwrap();
        assert_eq!(arena.span_at(arena.base() + 3 * PAGE_SIZE), Some(id));
        assert_eq!(arena.span_at(arena.base() + 4 * PAGE_SIZE + 8), Some(id));
        assert_eq!(arena.span_at(arena.base() + 5 * PAGE_SIZE), None);
        assert_eq!(arena.word_index(arena.base() + 24), 3);
        assert_eq!(table.iter().count(), 1);
    }
}
