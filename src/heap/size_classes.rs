//! Static size class table.
//!
//! Class 0 stands for "large": such objects get a dedicated span. Every
//! other class fixes the object stride and the span length. A span class
//! is `class << 1 | noscan`, so objects without pointers are kept apart
//! and never need scanning.

use once_cell::sync::Lazy;

use super::{MAX_SMALL_SIZE, PAGE_SHIFT, PAGE_SIZE};

pub const NUM_SIZE_CLASSES: usize = 68;
pub const NUM_SPAN_CLASSES: usize = NUM_SIZE_CLASSES << 1;

const SMALL_SIZE_DIV: usize = 8;
const SMALL_SIZE_MAX: usize = 1024;
const LARGE_SIZE_DIV: usize = 128;

pub static CLASS_TO_SIZE: [u16; NUM_SIZE_CLASSES] = [
    0, 8, 16, 24, 32, 48, 64, 80, 96, 112, 128, 144, 160, 176, 192, 208, 224, 240, 256, 288, 320,
    352, 384, 416, 448, 480, 512, 576, 640, 704, 768, 896, 1024, 1152, 1280, 1408, 1536, 1792,
    2048, 2304, 2688, 3072, 3200, 3456, 4096, 4864, 5376, 6144, 6528, 6784, 6912, 8192, 9472,
    9728, 10240, 10880, 12288, 13568, 14336, 16384, 18432, 19072, 20480, 21760, 24576, 27264,
    28672, 32768,
];

pub static CLASS_TO_NPAGES: [u8; NUM_SIZE_CLASSES] = [
    0, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1,
    1, 1, 1, 1, 2, 1, 2, 1, 2, 1, 3, 2, 3, 1, 3, 2, 3, 4, 5, 6, 1, 7, 6, 5, 4, 3, 5, 7, 2, 9, 7,
    5, 8, 3, 10, 7, 4,
];

static SIZE_TO_CLASS8: Lazy<Box<[u8]>> = Lazy::new(|| {
    (0..=SMALL_SIZE_MAX / SMALL_SIZE_DIV)
        .map(|i| smallest_class_for(i * SMALL_SIZE_DIV))
        .collect()
});

static SIZE_TO_CLASS128: Lazy<Box<[u8]>> = Lazy::new(|| {
    (0..=(MAX_SMALL_SIZE - SMALL_SIZE_MAX) / LARGE_SIZE_DIV)
        .map(|i| smallest_class_for(SMALL_SIZE_MAX + i * LARGE_SIZE_DIV))
        .collect()
});

fn smallest_class_for(size: usize) -> u8 {
    CLASS_TO_SIZE
        .iter()
        .enumerate()
        .skip(1)
        .find(|(_, &s)| s as usize >= size)
        .map(|(class, _)| class as u8)
        .unwrap_or(0)
}

/// Size class for a small allocation of `size` bytes (`1..=MAX_SMALL_SIZE`).
#[inline]
pub fn size_to_class(size: usize) -> u8 {
    debug_assert!(size > 0 && size <= MAX_SMALL_SIZE);
    if size <= SMALL_SIZE_MAX {
        SIZE_TO_CLASS8[(size + SMALL_SIZE_DIV - 1) / SMALL_SIZE_DIV]
    } else {
        SIZE_TO_CLASS128[(size - SMALL_SIZE_MAX + LARGE_SIZE_DIV - 1) / LARGE_SIZE_DIV]
    }
}

#[inline]
pub fn class_size(class: u8) -> usize {
    CLASS_TO_SIZE[class as usize] as usize
}

#[inline]
pub fn class_npages(class: u8) -> usize {
    CLASS_TO_NPAGES[class as usize] as usize
}

#[inline]
pub fn class_nelems(class: u8) -> usize {
    (class_npages(class) << PAGE_SHIFT) / class_size(class)
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct SpanClass(pub u8);

impl SpanClass {
    pub const LARGE_SCAN: Self = Self(0);
    pub const LARGE_NOSCAN: Self = Self(1);

    #[inline]
    pub const fn new(sizeclass: u8, noscan: bool) -> Self {
        Self(sizeclass << 1 | noscan as u8)
    }

    #[inline]
    pub const fn sizeclass(self) -> u8 {
        self.0 >> 1
    }

    #[inline]
    pub const fn noscan(self) -> bool {
        self.0 & 1 != 0
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub const fn is_large(self) -> bool {
        self.sizeclass() == 0
    }
}

/// Pages needed for a large object of `size` bytes.
pub fn large_npages(size: usize) -> usize {
    (size + PAGE_SIZE - 1) >> PAGE_SHIFT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_consistent() {
        for class in 1..NUM_SIZE_CLASSES as u8 {
            let size = class_size(class);
            assert!(size % 8 == 0, "class {} size {}", class, size);
            assert!(class_nelems(class) >= 1);
            if class > 1 {
                assert!(size > class_size(class - 1));
            }
            // Tail waste never exceeds one object.
            let span_bytes = class_npages(class) * PAGE_SIZE;
            assert!(span_bytes - class_nelems(class) * size < size);
        }
        assert_eq!(class_size(NUM_SIZE_CLASSES as u8 - 1), MAX_SMALL_SIZE);
    }

    #[test]
    fn lookup_picks_smallest_fitting_class() {
        for size in 1..=MAX_SMALL_SIZE {
            let class = size_to_class(size);
            assert!(class > 0);
            assert!(class_size(class) >= size);
            assert!(class == 1 || class_size(class - 1) < size, "size {}", size);
        }
        assert_eq!(class_size(size_to_class(64)), 64);
        assert_eq!(class_nelems(size_to_class(64)), 128);
        assert_eq!(class_size(size_to_class(1025)), 1152);
    }

    #[test]
    fn span_classes() {
        let sc = SpanClass::new(5, true);
        assert_eq!(sc.sizeclass(), 5);
        assert!(sc.noscan());
        assert!(!SpanClass::new(5, false).noscan());
        assert!(SpanClass::LARGE_NOSCAN.is_large());
        assert_eq!(large_npages(PAGE_SIZE + 1), 2);
    }
}
