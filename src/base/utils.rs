//! Environment variable readers.
//!
//! Sizes accept an optional `K`, `M` or `G` suffix (and a trailing `B`), so
//! `GC_MEMORY_LIMIT=512M` and `GC_MEMORY_LIMIT=536870912` are equivalent.

/// Splits `value` into the numeric part and a multiplier derived from its suffix.
pub fn parse_float_and_factor(value: &str) -> Option<(f64, usize)> {
    let mut value = value.trim();
    if value.is_empty() {
        return None;
    }

    if value.len() > 1 && (value.ends_with('b') || value.ends_with('B')) {
        value = &value[..value.len() - 1];
    }

    let (digits, factor) = match value.as_bytes()[value.len() - 1] {
        b'g' | b'G' => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        b'm' | b'M' => (&value[..value.len() - 1], 1024 * 1024),
        b'k' | b'K' => (&value[..value.len() - 1], 1024),
        _ => (value, 1),
    };

    match digits.trim().parse::<f64>() {
        Ok(x) if x.is_finite() => Some((x, factor)),
        _ => None,
    }
}

pub fn parse_size(value: &str) -> Option<usize> {
    let (value, factor) = parse_float_and_factor(value)?;
    if value < 0.0 {
        return None;
    }
    Some((value * factor as f64) as usize)
}

pub fn read_uint_from_env(var: &str) -> Option<usize> {
    parse_size(&std::env::var(var).ok()?)
}

pub fn read_string_from_env(var: &str) -> Option<String> {
    std::env::var(var).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_with_suffixes() {
        assert_eq!(parse_size("4096"), Some(4096));
        assert_eq!(parse_size("4K"), Some(4096));
        assert_eq!(parse_size("4kb"), Some(4096));
        assert_eq!(parse_size("1.5M"), Some(1024 * 1024 * 3 / 2));
        assert_eq!(parse_size("2G"), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_size(""), None);
        assert_eq!(parse_size("lots"), None);
        assert_eq!(parse_size("-3M"), None);
    }
}
