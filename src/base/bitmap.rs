use std::sync::atomic::{AtomicUsize, Ordering};

use super::BITS_PER_WORD;

/// Fixed size bitmap whose bits can be flipped concurrently.
pub struct AtomicBitmap {
    words: Box<[AtomicUsize]>,
    nbits: usize,
}

#[inline(always)]
const fn split(bit: usize) -> (usize, usize) {
    (bit / BITS_PER_WORD, 1 << (bit % BITS_PER_WORD))
}

impl AtomicBitmap {
    pub fn new(nbits: usize) -> Self {
        let words = (0..(nbits + BITS_PER_WORD - 1) / BITS_PER_WORD)
            .map(|_| AtomicUsize::new(0))
            .collect();
        Self { words, nbits }
    }

    pub fn len(&self) -> usize {
        self.nbits
    }

    pub fn is_empty(&self) -> bool {
        self.nbits == 0
    }

    #[inline]
    pub fn get(&self, bit: usize) -> bool {
        let (word, mask) = split(bit);
        self.words[word].load(Ordering::Acquire) & mask != 0
    }

    #[inline]
    pub fn set(&self, bit: usize) {
        let (word, mask) = split(bit);
        self.words[word].fetch_or(mask, Ordering::AcqRel);
    }

    #[inline]
    pub fn clear(&self, bit: usize) {
        let (word, mask) = split(bit);
        self.words[word].fetch_and(!mask, Ordering::AcqRel);
    }

    #[inline]
    pub fn set_to(&self, bit: usize, value: bool) {
        if value {
            self.set(bit)
        } else {
            self.clear(bit)
        }
    }

    /// Atomically moves the bit to `value`. Returns `true` only for the caller
    /// that actually changed it.
    #[inline]
    pub fn try_set_to(&self, bit: usize, value: bool) -> bool {
        let (word, mask) = split(bit);
        let word = &self.words[word];
        if value {
            if word.load(Ordering::Relaxed) & mask != 0 {
                return false;
            }
            word.fetch_or(mask, Ordering::AcqRel) & mask == 0
        } else {
            if word.load(Ordering::Relaxed) & mask == 0 {
                return false;
            }
            word.fetch_and(!mask, Ordering::AcqRel) & mask != 0
        }
    }

    pub fn set_range_to(&self, from: usize, to: usize, value: bool) {
        let mut bit = from;
        while bit < to {
            let (word, _) = split(bit);
            let start = bit % BITS_PER_WORD;
            let end = (to - word * BITS_PER_WORD).min(BITS_PER_WORD);
            let mask = if end - start == BITS_PER_WORD {
                usize::MAX
            } else {
                ((1usize << (end - start)) - 1) << start
            };
            if value {
                self.words[word].fetch_or(mask, Ordering::AcqRel);
            } else {
                self.words[word].fetch_and(!mask, Ordering::AcqRel);
            }
            bit = (word + 1) * BITS_PER_WORD;
        }
    }

    pub fn clear_all(&self) {
        for word in self.words.iter() {
            word.store(0, Ordering::Relaxed);
        }
    }

    pub fn count_ones(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_bits() {
        let bm = AtomicBitmap::new(200);
        assert!(!bm.get(130));
        assert!(bm.try_set_to(130, true));
        assert!(!bm.try_set_to(130, true));
        assert!(bm.get(130));
        assert!(bm.try_set_to(130, false));
        assert!(!bm.get(130));
        assert_eq!(bm.count_ones(), 0);
    }

    #[test]
    fn ranges() {
        let bm = AtomicBitmap::new(300);
        bm.set_range_to(3, 260, true);
        assert_eq!(bm.count_ones(), 257);
        assert!(!bm.get(2));
        assert!(bm.get(3));
        assert!(bm.get(259));
        assert!(!bm.get(260));
        bm.set_range_to(64, 128, false);
        assert_eq!(bm.count_ones(), 257 - 64);
        bm.clear_all();
        assert_eq!(bm.count_ones(), 0);
    }
}
