use std::time::Duration;

use crate::base::{
    formatted_size,
    utils::{parse_size, read_string_from_env},
};

pub const DEFAULT_GC_PERCENT: i32 = 100;
pub const DEFAULT_HEAP_MINIMUM: usize = 4 * 1024 * 1024;
pub const DEFAULT_ADDRESS_SPACE: usize = 1024 * 1024 * 1024;

/// `GC_DEBUG` toggles.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DebugOptions {
    /// 0: concurrent collection, 1: mark with the world stopped,
    /// 2: mark and sweep with the world stopped.
    pub gc_stop_the_world: u8,
    /// Re-traverse the heap at mark termination and verify every reachable
    /// object was marked.
    pub gc_checkmark: bool,
    /// Abort when a pointer slot holds an address inside the reservation
    /// that is not a live object.
    pub invalid_ptr: bool,
}

impl Default for DebugOptions {
    fn default() -> Self {
        Self {
            gc_stop_the_world: 0,
            gc_checkmark: false,
            invalid_ptr: true,
        }
    }
}

impl DebugOptions {
    /// Parses a comma separated `name=value` list. Unknown names and bad
    /// values are reported and skipped.
    pub fn parse(value: &str) -> Self {
        let mut opts = Self::default();
        for item in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (name, val) = match item.split_once('=') {
                Some((name, val)) => (name.trim(), val.trim()),
                None => {
                    log::warn!(target: "gc", "GC_DEBUG: ignoring malformed entry {:?}", item);
                    continue;
                }
            };
            let val = match val.parse::<u8>() {
                Ok(v) => v,
                Err(_) => {
                    log::warn!(target: "gc", "GC_DEBUG: {} expects a number, got {:?}", name, val);
                    continue;
                }
            };
            match name {
                "gcstoptheworld" if val <= 2 => opts.gc_stop_the_world = val,
                "gccheckmark" if val <= 1 => opts.gc_checkmark = val == 1,
                "invalidptr" if val <= 1 => opts.invalid_ptr = val == 1,
                _ => log::warn!(target: "gc", "GC_DEBUG: unknown setting {}={}", name, val),
            }
        }
        opts
    }
}

#[derive(Clone, Debug)]
pub struct GcOptions {
    /// Heap growth percentage. Negative values disable heap triggered
    /// collection.
    pub gc_percent: i32,
    pub memory_limit: Option<usize>,
    pub procs: usize,
    pub address_space: usize,
    pub heap_minimum: usize,
    pub debug: DebugOptions,
    /// Free pages idle for longer than this are returned to the OS.
    pub scavenge_idle: Duration,
    /// Share of one CPU the scavenger may use.
    pub scavenge_cpu_fraction: f64,
    /// Share of `procs` given to background mark workers.
    pub mark_utilization: f64,
}

impl Default for GcOptions {
    fn default() -> Self {
        Self {
            gc_percent: DEFAULT_GC_PERCENT,
            memory_limit: None,
            procs: num_cpus::get().max(1),
            address_space: DEFAULT_ADDRESS_SPACE,
            heap_minimum: DEFAULT_HEAP_MINIMUM,
            debug: DebugOptions::default(),
            scavenge_idle: Duration::from_secs(5),
            scavenge_cpu_fraction: 0.01,
            mark_utilization: 0.25,
        }
    }
}

/// Parses `GC_PERCENT`. `off` disables the collector trigger and zero
/// degrades to the default.
pub fn parse_gc_percent(value: &str) -> Option<i32> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("off") {
        return Some(-1);
    }
    match value.parse::<i32>() {
        Ok(0) => {
            log::warn!(target: "gc", "GC_PERCENT=0 is not supported, using {}", DEFAULT_GC_PERCENT);
            Some(DEFAULT_GC_PERCENT)
        }
        Ok(pct) => Some(pct),
        Err(_) => None,
    }
}

impl GcOptions {
    pub fn from_env() -> Self {
        Self::from_lookup(read_string_from_env)
    }

    /// Builds options from a variable lookup function, so configuration can
    /// be supplied from somewhere other than the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(v) = lookup("GC_PERCENT") {
            match parse_gc_percent(&v) {
                Some(pct) => config.gc_percent = pct,
                None => log::warn!(target: "gc", "invalid GC_PERCENT {:?}, using {}", v, config.gc_percent),
            }
        }

        if let Some(v) = lookup("GC_MEMORY_LIMIT") {
            match parse_size(&v) {
                Some(limit) if limit > 0 => config.memory_limit = Some(limit),
                _ => log::warn!(target: "gc", "invalid GC_MEMORY_LIMIT {:?}, memory limit disabled", v),
            }
        }

        if let Some(v) = lookup("GC_PROCS") {
            match v.trim().parse::<usize>() {
                Ok(n) if n > 0 => config.procs = n,
                _ => log::warn!(target: "gc", "invalid GC_PROCS {:?}, using {}", v, config.procs),
            }
        }

        if let Some(v) = lookup("GC_ADDRESS_SPACE") {
            match parse_size(&v) {
                Some(size) if size >= 2 * super::ARENA_SIZE => config.address_space = size,
                _ => log::warn!(
                    target: "gc",
                    "invalid GC_ADDRESS_SPACE {:?}, using {}",
                    v,
                    formatted_size(config.address_space)
                ),
            }
        }

        if let Some(v) = lookup("GC_HEAP_MINIMUM") {
            match parse_size(&v) {
                Some(size) if size >= super::PAGE_SIZE => config.heap_minimum = size,
                _ => log::warn!(
                    target: "gc",
                    "invalid GC_HEAP_MINIMUM {:?}, using {}",
                    v,
                    formatted_size(config.heap_minimum)
                ),
            }
        }

        if let Some(v) = lookup("GC_DEBUG") {
            config.debug = DebugOptions::parse(&v);
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_without_variables() {
        let opts = GcOptions::from_lookup(lookup(&[]));
        assert_eq!(opts.gc_percent, 100);
        assert_eq!(opts.memory_limit, None);
        assert_eq!(opts.heap_minimum, DEFAULT_HEAP_MINIMUM);
        assert_eq!(opts.debug, DebugOptions::default());
    }

    #[test]
    fn reads_variables() {
        let opts = GcOptions::from_lookup(lookup(&[
            ("GC_PERCENT", "50"),
            ("GC_MEMORY_LIMIT", "64M"),
            ("GC_PROCS", "3"),
            ("GC_ADDRESS_SPACE", "256M"),
            ("GC_DEBUG", "gcstoptheworld=2, gccheckmark=1,invalidptr=0"),
        ]));
        assert_eq!(opts.gc_percent, 50);
        assert_eq!(opts.memory_limit, Some(64 * 1024 * 1024));
        assert_eq!(opts.procs, 3);
        assert_eq!(opts.address_space, 256 * 1024 * 1024);
        assert_eq!(opts.debug.gc_stop_the_world, 2);
        assert!(opts.debug.gc_checkmark);
        assert!(!opts.debug.invalid_ptr);
    }

    #[test]
    fn bad_values_degrade() {
        let opts = GcOptions::from_lookup(lookup(&[
            ("GC_PERCENT", "lots"),
            ("GC_PROCS", "0"),
            ("GC_MEMORY_LIMIT", "-1"),
            ("GC_DEBUG", "gcstoptheworld=7,bogus"),
        ]));
        assert_eq!(opts.gc_percent, 100);
        assert!(opts.procs > 0);
        assert_eq!(opts.memory_limit, None);
        assert_eq!(opts.debug.gc_stop_the_world, 0);
    }

    #[test]
    fn gc_percent_forms() {
        assert_eq!(parse_gc_percent("off"), Some(-1));
        assert_eq!(parse_gc_percent("0"), Some(100));
        assert_eq!(parse_gc_percent("-5"), Some(-5));
        assert_eq!(parse_gc_percent("x"), None);
    }
}
