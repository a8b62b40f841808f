//! Low level helpers shared by every collector component.

pub mod bitmap;
pub mod utils;
pub mod virtual_memory;

#[cfg(target_pointer_width = "64")]
pub const WORD_SIZE_LOG2: usize = 3;
#[cfg(target_pointer_width = "32")]
pub const WORD_SIZE_LOG2: usize = 2;

pub const WORD_SIZE: usize = 1 << WORD_SIZE_LOG2;
pub const BITS_PER_WORD: usize = WORD_SIZE * 8;

#[inline(always)]
pub const fn align_down(addr: usize, align: usize) -> usize {
    addr & !align.wrapping_sub(1)
}

/// rounds the given value `val` up to the nearest multiple
/// of `align`.
#[inline(always)]
pub const fn align_usize(value: usize, align: usize) -> usize {
    ((value.wrapping_add(align).wrapping_sub(1)).wrapping_div(align)).wrapping_mul(align)
}

#[inline(always)]
pub const fn is_aligned(addr: usize, align: usize) -> bool {
    addr & align.wrapping_sub(1) == 0
}

#[inline(always)]
pub const fn div_round_up(n: usize, d: usize) -> usize {
    (n + d - 1) / d
}

pub struct FormattedSize {
    pub size: f64,
}

impl std::fmt::Display for FormattedSize {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let ksize = self.size / 1024f64;

        if ksize < 1f64 {
            return write!(f, "{}B", self.size);
        }

        let msize = ksize / 1024f64;

        if msize < 1f64 {
            return write!(f, "{:.1}K", ksize);
        }

        let gsize = msize / 1024f64;

        if gsize < 8f64 {
            write!(f, "{:.1}M", msize)
        } else {
            write!(f, "{:.1}G", gsize)
        }
    }
}

impl std::fmt::Debug for FormattedSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

pub fn formatted_size(size: usize) -> FormattedSize {
    FormattedSize { size: size as f64 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_usize(13, 8), 16);
        assert_eq!(align_usize(16, 8), 16);
        assert_eq!(align_down(4097, 4096), 4096);
        assert!(is_aligned(8192, 8192));
        assert!(!is_aligned(8200, 8192));
        assert_eq!(div_round_up(8193, 8192), 2);
    }

    #[test]
    fn formatted_sizes() {
        assert_eq!(formatted_size(512).to_string(), "512B");
        assert_eq!(formatted_size(2048).to_string(), "2.0K");
        assert_eq!(formatted_size(3 * 1024 * 1024).to_string(), "3.0M");
    }
}
