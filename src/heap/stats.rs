//! Allocation and collection statistics.

use std::{
    collections::VecDeque,
    fmt,
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use crate::{
    base::formatted_size,
    sync::lock_rank::{LockRank, RankedMutex},
    utils::number_seq::TruncatedSeq,
};

use super::size_classes::{class_size, SpanClass, NUM_SIZE_CLASSES};

const PAUSE_HISTORY: usize = 256;
const CYCLE_HISTORY: usize = 64;

/// Why a cycle ran.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GcCause {
    /// The live heap reached the pacer's trigger.
    HeapTrigger,
    /// `GC()` was called.
    Explicit,
    /// Part of releasing all free memory to the OS.
    FreeOsMemory,
    /// Driven phase by phase through the stepping API.
    Stepped,
}

impl GcCause {
    pub fn is_forced(self) -> bool {
        matches!(self, GcCause::Explicit | GcCause::FreeOsMemory)
    }
}

/// Pacing facts of one completed cycle.
#[derive(Clone, Copy, Debug)]
pub struct CycleRecord {
    pub gc_id: u64,
    pub cause: GcCause,
    pub heap_live_at_start: usize,
    pub goal_at_start: usize,
    pub trigger_at_start: usize,
    pub heap_marked: usize,
    pub next_goal: usize,
    pub next_trigger: usize,
    pub duration: Duration,
}

/// Allocation counters kept by a thread cache and folded into
/// [`HeapStats`] when the cache refills or is flushed.
pub struct LocalStats {
    pub nmalloc: Box<[u64]>,
    pub large_alloc: u64,
    pub large_allocs: u64,
    pub tiny_allocs: u64,
}

impl LocalStats {
    pub fn new() -> Self {
        Self {
            nmalloc: vec![0; NUM_SIZE_CLASSES].into_boxed_slice(),
            large_alloc: 0,
            large_allocs: 0,
            tiny_allocs: 0,
        }
    }
}

impl Default for LocalStats {
    fn default() -> Self {
        Self::new()
    }
}

struct History {
    pauses: VecDeque<Duration>,
    pause_seq: TruncatedSeq,
    cycles: VecDeque<CycleRecord>,
}

pub struct HeapStats {
    nmalloc: Box<[AtomicU64]>,
    nfree: Box<[AtomicU64]>,
    large_alloc: AtomicU64,
    large_allocs: AtomicU64,
    large_free: AtomicU64,
    large_frees: AtomicU64,
    tiny_allocs: AtomicU64,
    num_gc: AtomicU32,
    num_forced_gc: AtomicU32,
    pause_total_ns: AtomicU64,
    last_gc_unix_ns: AtomicU64,
    gc_cpu_ns: AtomicU64,
    created: Instant,
    history: RankedMutex<History>,
}

fn counters(n: usize) -> Box<[AtomicU64]> {
    (0..n).map(|_| AtomicU64::new(0)).collect()
}

impl HeapStats {
    pub fn new() -> Self {
        Self {
            nmalloc: counters(NUM_SIZE_CLASSES),
            nfree: counters(NUM_SIZE_CLASSES),
            large_alloc: AtomicU64::new(0),
            large_allocs: AtomicU64::new(0),
            large_free: AtomicU64::new(0),
            large_frees: AtomicU64::new(0),
            tiny_allocs: AtomicU64::new(0),
            num_gc: AtomicU32::new(0),
            num_forced_gc: AtomicU32::new(0),
            pause_total_ns: AtomicU64::new(0),
            last_gc_unix_ns: AtomicU64::new(0),
            gc_cpu_ns: AtomicU64::new(0),
            created: Instant::now(),
            history: RankedMutex::new(
                LockRank::History,
                History {
                    pauses: VecDeque::with_capacity(PAUSE_HISTORY),
                    pause_seq: TruncatedSeq::new(16, 0.3),
                    cycles: VecDeque::with_capacity(CYCLE_HISTORY),
                },
            ),
        }
    }

    pub(crate) fn flush_local(&self, local: &mut LocalStats) {
        for (class, n) in local.nmalloc.iter_mut().enumerate() {
            if *n != 0 {
                self.nmalloc[class].fetch_add(*n, Ordering::Relaxed);
                *n = 0;
            }
        }
        if local.large_allocs != 0 {
            self.large_alloc
                .fetch_add(local.large_alloc, Ordering::Relaxed);
            self.large_allocs
                .fetch_add(local.large_allocs, Ordering::Relaxed);
            local.large_alloc = 0;
            local.large_allocs = 0;
        }
        if local.tiny_allocs != 0 {
            self.tiny_allocs
                .fetch_add(local.tiny_allocs, Ordering::Relaxed);
            local.tiny_allocs = 0;
        }
    }

    pub(crate) fn note_freed(&self, spanclass: SpanClass, n: usize, elemsize: usize) {
        if spanclass.is_large() {
            self.large_free
                .fetch_add((n * elemsize) as u64, Ordering::Relaxed);
            self.large_frees.fetch_add(n as u64, Ordering::Relaxed);
        } else {
            self.nfree[spanclass.sizeclass() as usize].fetch_add(n as u64, Ordering::Relaxed);
        }
    }

    pub(crate) fn note_pause(&self, pause: Duration) {
        self.pause_total_ns
            .fetch_add(pause.as_nanos() as u64, Ordering::Relaxed);
        let mut history = self.history.lock();
        if history.pauses.len() == PAUSE_HISTORY {
            history.pauses.pop_front();
        }
        history.pauses.push_back(pause);
        history.pause_seq.add(pause.as_secs_f64() * 1000.0);
    }

    pub(crate) fn note_gc_cpu(&self, cpu: Duration) {
        self.gc_cpu_ns
            .fetch_add(cpu.as_nanos() as u64, Ordering::Relaxed);
    }

    pub(crate) fn note_cycle(&self, record: CycleRecord) {
        self.num_gc.fetch_add(1, Ordering::Relaxed);
        if record.cause.is_forced() {
            self.num_forced_gc.fetch_add(1, Ordering::Relaxed);
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        self.last_gc_unix_ns.store(now, Ordering::Relaxed);

        let mut history = self.history.lock();
        if history.cycles.len() == CYCLE_HISTORY {
            history.cycles.pop_front();
        }
        history.cycles.push_back(record);
    }

    pub fn num_gc(&self) -> u32 {
        self.num_gc.load(Ordering::Relaxed)
    }

    pub fn cycles(&self) -> Vec<CycleRecord> {
        self.history.lock().cycles.iter().copied().collect()
    }

    /// Smoothed recent pause time in milliseconds.
    pub fn average_pause_ms(&self) -> f64 {
        self.history.lock().pause_seq.davg()
    }

    /// Fills the object and collection counters of `out`.
    pub(crate) fn fill(&self, out: &mut MemStats, procs: usize) {
        let mut mallocs = 0u64;
        let mut frees = 0u64;
        let mut alloc = 0u64;
        let mut total = 0u64;
        out.by_size.clear();
        for class in 1..NUM_SIZE_CLASSES {
            let size = class_size(class as u8) as u64;
            let m = self.nmalloc[class].load(Ordering::Relaxed);
            let f = self.nfree[class].load(Ordering::Relaxed);
            mallocs += m;
            frees += f;
            total += m * size;
            alloc += m.saturating_sub(f) * size;
            out.by_size.push(SizeClassStats {
                size: size as usize,
                mallocs: m,
                frees: f,
            });
        }
        let large_alloc = self.large_alloc.load(Ordering::Relaxed);
        let large_allocs = self.large_allocs.load(Ordering::Relaxed);
        let large_free = self.large_free.load(Ordering::Relaxed);
        let large_frees = self.large_frees.load(Ordering::Relaxed);
        let tiny = self.tiny_allocs.load(Ordering::Relaxed);

        out.heap_objects = (mallocs + large_allocs).saturating_sub(frees + large_frees);
        out.mallocs = mallocs + large_allocs + tiny;
        out.frees = frees + large_frees + tiny;
        out.total_alloc = total + large_alloc;
        out.heap_alloc = alloc + large_alloc.saturating_sub(large_free);
        out.alloc = out.heap_alloc;

        out.num_gc = self.num_gc.load(Ordering::Relaxed);
        out.num_forced_gc = self.num_forced_gc.load(Ordering::Relaxed);
        out.pause_total = Duration::from_nanos(self.pause_total_ns.load(Ordering::Relaxed));
        out.last_gc_unix_ns = self.last_gc_unix_ns.load(Ordering::Relaxed);
        out.recent_pauses = self.history.lock().pauses.iter().copied().collect();

        let wall = self.created.elapsed().as_nanos() as f64 * procs.max(1) as f64;
        out.gc_cpu_fraction = if wall > 0.0 {
            self.gc_cpu_ns.load(Ordering::Relaxed) as f64 / wall
        } else {
            0.0
        };
    }
}

impl Default for HeapStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SizeClassStats {
    pub size: usize,
    pub mallocs: u64,
    pub frees: u64,
}

/// Snapshot returned by `read_mem_stats`.
#[derive(Clone, Debug, Default)]
pub struct MemStats {
    /// Bytes of allocated heap objects.
    pub alloc: u64,
    /// Cumulative bytes allocated for heap objects.
    pub total_alloc: u64,
    /// Bytes obtained from the OS, including metadata.
    pub sys: u64,
    pub mallocs: u64,
    pub frees: u64,
    pub heap_alloc: u64,
    pub heap_sys: u64,
    pub heap_idle: u64,
    pub heap_inuse: u64,
    pub heap_released: u64,
    pub heap_objects: u64,
    pub spans_in_use: u64,
    /// Heap goal of the next cycle.
    pub next_gc: u64,
    pub last_gc_unix_ns: u64,
    pub pause_total: Duration,
    pub recent_pauses: Vec<Duration>,
    pub num_gc: u32,
    pub num_forced_gc: u32,
    pub gc_cpu_fraction: f64,
    pub by_size: Vec<SizeClassStats>,
}

impl fmt::Display for MemStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "heap statistics:")?;
        writeln!(f, "  alloc: {}", formatted_size(self.alloc as usize))?;
        writeln!(f, "  total alloc: {}", formatted_size(self.total_alloc as usize))?;
        writeln!(f, "  sys: {}", formatted_size(self.sys as usize))?;
        writeln!(f, "  mallocs: {} frees: {}", self.mallocs, self.frees)?;
        writeln!(f, "  heap objects: {}", self.heap_objects)?;
        writeln!(
            f,
            "  heap sys: {} idle: {} in use: {} released: {}",
            formatted_size(self.heap_sys as usize),
            formatted_size(self.heap_idle as usize),
            formatted_size(self.heap_inuse as usize),
            formatted_size(self.heap_released as usize)
        )?;
        writeln!(f, "  spans in use: {}", self.spans_in_use)?;
        writeln!(f, "  next gc: {}", formatted_size(self.next_gc as usize))?;
        writeln!(
            f,
            "  gc count: {} ({} forced), pause total {}ms",
            self.num_gc,
            self.num_forced_gc,
            self.pause_total.as_micros() as f64 / 1000.0
        )?;
        write!(f, "  gc cpu fraction: {:.4}", self.gc_cpu_fraction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::size_classes::size_to_class;

    #[test]
    fn object_counters() {
        let stats = HeapStats::new();
        let class = size_to_class(64);
        let mut local = LocalStats::new();
        local.nmalloc[class as usize] = 10;
        local.tiny_allocs = 3;
        local.large_alloc = 40960;
        local.large_allocs = 1;
        stats.flush_local(&mut local);
        assert_eq!(local.nmalloc[class as usize], 0);

        stats.note_freed(SpanClass::new(class, false), 4, 64);
        stats.note_freed(SpanClass::LARGE_NOSCAN, 1, 40960);

        let mut out = MemStats::default();
        stats.fill(&mut out, 1);
        assert_eq!(out.heap_objects, 6);
        assert_eq!(out.mallocs, 14);
        assert_eq!(out.frees, 8);
        assert_eq!(out.heap_alloc, 6 * 64);
        assert_eq!(out.total_alloc, 10 * 64 + 40960);
        let row = out.by_size.iter().find(|s| s.size == 64).unwrap();
        assert_eq!((row.mallocs, row.frees), (10, 4));
    }

    #[test]
    fn bounded_histories() {
        let stats = HeapStats::new();
        for i in 0..(PAUSE_HISTORY + 10) {
            stats.note_pause(Duration::from_micros(i as u64));
        }
        for i in 0..(CYCLE_HISTORY + 5) {
            stats.note_cycle(CycleRecord {
                gc_id: i as u64,
                cause: if i % 2 == 0 { GcCause::Explicit } else { GcCause::HeapTrigger },
                heap_live_at_start: 0,
                goal_at_start: 0,
                trigger_at_start: 0,
                heap_marked: 0,
                next_goal: 0,
                next_trigger: 0,
                duration: Duration::ZERO,
            });
        }
        let mut out = MemStats::default();
        stats.fill(&mut out, 1);
        assert_eq!(out.recent_pauses.len(), PAUSE_HISTORY);
        assert_eq!(out.num_gc as usize, CYCLE_HISTORY + 5);
        assert_eq!(out.num_forced_gc, 35);
        assert_eq!(stats.cycles().len(), CYCLE_HISTORY);
        assert_eq!(stats.cycles()[0].gc_id, 5);
        assert!(out.to_string().contains("gc count"));
    }
}
