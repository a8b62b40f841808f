use std::{
    fmt,
    sync::atomic::{AtomicU8, Ordering},
    time::Instant,
};

use crate::fatal::{throw, Fatal};

use self::heap::Heap;

pub mod arena;
pub mod cache;
pub mod central;
pub mod concurrent_gc;
pub mod concurrent_thread;
pub mod controller;
pub mod finalizer;
pub mod heap;
pub mod heap_bits;
pub mod malloc;
pub mod mark;
pub mod mutator;
pub mod options;
pub mod pacer;
pub mod page_alloc;
pub mod safepoint;
pub mod scavenger;
pub mod shared_vars;
pub mod size_classes;
pub mod span;
pub mod stats;
pub mod sweeper;
pub mod work;
pub mod write_barrier;

pub const PAGE_SHIFT: usize = 13;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
pub const PAGES_PER_ARENA: usize = 512;
pub const ARENA_SIZE: usize = PAGE_SIZE * PAGES_PER_ARENA;
pub const WORDS_PER_ARENA: usize = ARENA_SIZE / crate::base::WORD_SIZE;

/// Largest object served from a size class. Anything bigger gets a
/// dedicated span.
pub const MAX_SMALL_SIZE: usize = 32 * 1024;
/// Size of the block that tiny allocations are packed into.
pub const TINY_SIZE: usize = 16;

/// Address of a word inside the heap reservation (or null).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Address(usize);

impl Address {
    pub const NULL: Self = Self(0);

    #[inline(always)]
    pub const fn from_usize(addr: usize) -> Self {
        Self(addr)
    }

    #[inline(always)]
    pub const fn to_usize(self) -> usize {
        self.0
    }

    #[inline(always)]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline(always)]
    pub const fn add(self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }

    /// Address of the `index`-th word starting at `self`.
    #[inline(always)]
    pub const fn word(self, index: usize) -> Self {
        Self(self.0 + index * crate::base::WORD_SIZE)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Collection cycle state machine.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum GcPhase {
    Off,
    MarkStart,
    Marking,
    MarkTermination,
}

impl GcPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => GcPhase::Off,
            1 => GcPhase::MarkStart,
            2 => GcPhase::Marking,
            _ => GcPhase::MarkTermination,
        }
    }

    #[inline]
    pub fn in_cycle(self) -> bool {
        self != GcPhase::Off
    }

    pub fn name(self) -> &'static str {
        match self {
            GcPhase::Off => "off",
            GcPhase::MarkStart => "mark start",
            GcPhase::Marking => "marking",
            GcPhase::MarkTermination => "mark termination",
        }
    }
}

pub struct PhaseCell(AtomicU8);

impl PhaseCell {
    pub const fn new() -> Self {
        Self(AtomicU8::new(GcPhase::Off as u8))
    }

    #[inline]
    pub fn get(&self) -> GcPhase {
        GcPhase::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Moves from `from` to `to`. Any other current state is a fatal error.
    pub fn transition(&self, from: GcPhase, to: GcPhase) {
        if let Err(found) =
            self.0
                .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
        {
            throw(Fatal::InvalidPhase {
                expected: from.name(),
                found: GcPhase::from_u8(found).name(),
            });
        }
    }

    #[inline]
    pub fn in_cycle(&self) -> bool {
        self.get().in_cycle()
    }
}

pub struct ConcurrentPhase<'a> {
    heap: &'a Heap,
    name: &'static str,
    start: Instant,
}

pub struct PausePhase<'a> {
    heap: &'a Heap,
    name: &'static str,
    start: Instant,
}

impl<'a> ConcurrentPhase<'a> {
    pub fn new(heap: &'a Heap, name: &'static str) -> Self {
        Self {
            heap,
            name,
            start: Instant::now(),
        }
    }
}

impl Drop for ConcurrentPhase<'_> {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        log::info!(target: "gc", "GC({}) Concurrent {} {}ms", self.heap.gc_id(), self.name, elapsed.as_micros() as f64 / 1000.0);
    }
}

impl<'a> PausePhase<'a> {
    pub fn new(heap: &'a Heap, name: &'static str) -> Self {
        Self {
            heap,
            name,
            start: Instant::now(),
        }
    }
}

impl Drop for PausePhase<'_> {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        log::info!(target: "gc", "GC({}) Pause {} {}ms", self.heap.gc_id(), self.name, elapsed.as_micros() as f64 / 1000.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_cycle() {
        assert!(!GcPhase::Off.in_cycle());
        assert!(GcPhase::Marking.in_cycle());

        let phase = PhaseCell::new();
        assert_eq!(phase.get(), GcPhase::Off);
        assert!(!phase.in_cycle());
        phase.transition(GcPhase::Off, GcPhase::MarkStart);
        phase.transition(GcPhase::MarkStart, GcPhase::Marking);
        assert!(phase.in_cycle());
        phase.transition(GcPhase::Marking, GcPhase::MarkTermination);
        phase.transition(GcPhase::MarkTermination, GcPhase::Off);
        assert_eq!(phase.get(), GcPhase::Off);
    }

    #[test]
    fn address_arithmetic() {
        let a = Address::from_usize(0x1000);
        assert_eq!(a.word(2).to_usize(), 0x1010);
        assert_eq!(a.add(3).to_usize(), 0x1003);
        assert!(Address::NULL.is_null());
        assert_eq!(format!("{}", a), "0x1000");
    }
}
