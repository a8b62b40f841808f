//! Per word heap metadata.
//!
//! Pointer bits are written at allocation from a [`PointerLayout`] and read
//! by the marker. Allocation and mark bits live at an object's first word;
//! [`ObjectBits`] is the view the allocator, marker and sweeper use.

use crate::base::WORD_SIZE;

use super::arena::Arena;

/// Which words of an object hold pointers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PointerLayout {
    /// No word is a pointer.
    Scalar,
    /// Every word is a pointer.
    AllPointers,
    /// Word `i` is a pointer when `pattern[i % pattern.len()]` is set, so a
    /// pattern describing one element also describes an array of them. An
    /// empty pattern has no pointers.
    Pattern(Box<[bool]>),
}

impl PointerLayout {
    pub fn from_words(words: &[bool]) -> Self {
        if words.iter().all(|&w| !w) {
            PointerLayout::Scalar
        } else if words.iter().all(|&w| w) {
            PointerLayout::AllPointers
        } else {
            PointerLayout::Pattern(words.into())
        }
    }

    /// Layout of an object of `nwords` words with pointers at `indices`.
    pub fn with_pointers_at(nwords: usize, indices: &[usize]) -> Self {
        let mut words = vec![false; nwords];
        for &i in indices {
            words[i] = true;
        }
        Self::from_words(&words)
    }

    pub fn has_pointers(&self) -> bool {
        match self {
            PointerLayout::Scalar => false,
            PointerLayout::AllPointers => true,
            PointerLayout::Pattern(p) => p.contains(&true),
        }
    }

    #[inline]
    pub fn is_pointer(&self, word: usize) -> bool {
        match self {
            PointerLayout::Scalar => false,
            PointerLayout::AllPointers => true,
            PointerLayout::Pattern(p) => !p.is_empty() && p[word % p.len()],
        }
    }
}

/// Records the pointer words of a fresh object. Words of the slot past
/// `size` are cleared so stale bits from a previous occupant never leak.
pub(crate) fn write_pointer_bits(
    arena: &Arena,
    obj: usize,
    size: usize,
    elemsize: usize,
    layout: &PointerLayout,
) {
    let first = arena.word_index(obj);
    let nwords = (size + WORD_SIZE - 1) / WORD_SIZE;
    let slot_words = elemsize / WORD_SIZE;
    match layout {
        PointerLayout::Scalar => arena.ptr_bits.set_range_to(first, first + slot_words, false),
        PointerLayout::AllPointers => {
            arena.ptr_bits.set_range_to(first, first + nwords, true);
            arena
                .ptr_bits
                .set_range_to(first + nwords, first + slot_words, false);
        }
        PointerLayout::Pattern(_) => {
            for w in 0..slot_words {
                arena
                    .ptr_bits
                    .set_to(first + w, w < nwords && layout.is_pointer(w));
            }
        }
    }
}

#[inline]
pub(crate) fn is_pointer_word(arena: &Arena, addr: usize) -> bool {
    arena.ptr_bits.get(arena.word_index(addr))
}

/// Allocation and mark state of one object.
#[derive(Clone, Copy)]
pub struct ObjectBits<'a> {
    arena: &'a Arena,
    index: usize,
}

impl<'a> ObjectBits<'a> {
    #[inline]
    pub fn of(arena: &'a Arena, obj: usize) -> Self {
        Self {
            arena,
            index: arena.word_index(obj),
        }
    }

    #[inline]
    pub fn is_allocated(self) -> bool {
        self.arena.alloc_bits.get(self.index)
    }

    #[inline]
    pub fn set_allocated(self, value: bool) {
        self.arena.alloc_bits.set_to(self.index, value)
    }

    /// An object is marked when its bit equals the heap's polarity.
    #[inline]
    pub fn is_marked(self, polarity: bool) -> bool {
        self.arena.mark_bits.get(self.index) == polarity
    }

    #[inline]
    pub fn set_marked(self, polarity: bool) {
        self.arena.mark_bits.set_to(self.index, polarity)
    }

    /// Marks the object. Returns `true` only for the first marker.
    #[inline]
    pub fn try_mark(self, polarity: bool) -> bool {
        self.arena.mark_bits.try_set_to(self.index, polarity)
    }

    #[inline]
    pub fn try_check_mark(self) -> bool {
        self.arena.check_marks().try_set_to(self.index, true)
    }
}
