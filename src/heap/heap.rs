use std::{
    fmt, io,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::{Duration, Instant},
};

use scoped_thread_pool::Pool;

use crate::{
    base::formatted_size,
    fatal::{throw, Fatal},
    sync::{
        lock_rank::{LockRank, RankedMutex},
        monitor::Monitor,
    },
};

use super::{
    arena::Arena,
    central::SpanCentral,
    concurrent_gc,
    finalizer::{FinalizerQueue, Specials},
    heap_bits::ObjectBits,
    mutator::{Mutator, MutatorShared},
    options::GcOptions,
    pacer::{CycleStart, Pacer, NO_LIMIT},
    page_alloc::PageAllocator,
    safepoint::{Safepoint, StwReason},
    shared_vars::SharedFlag,
    size_classes::{SpanClass, NUM_SPAN_CLASSES},
    span::{Span, SpanState},
    stats::{GcCause, HeapStats, MemStats},
    sweeper::{finish_sweep, Sweeper},
    work::WorkQueue,
    Address, GcPhase, PhaseCell,
};

/// Roots enumerated by code outside the heap, such as an interpreter's
/// own stacks. Called with the world stopped at mark start and mark
/// termination.
pub trait RootSource: Send + Sync {
    fn roots(&self, visit: &mut dyn FnMut(Address));
}

/// A heap object found from an address that points into it.
#[derive(Clone, Copy)]
pub(crate) struct ObjectRef<'a> {
    pub(crate) base: Address,
    pub(crate) span: &'a Span,
    pub(crate) arena: &'a Arena,
}

/// Book keeping of the cycle holding the collection slot.
pub(crate) struct CycleInfo {
    pub(crate) cause: GcCause,
    pub(crate) begun: Instant,
    pub(crate) pacing: Option<CycleStart>,
}

#[derive(Default)]
struct GcRequest {
    pending: bool,
    forced: bool,
}

#[derive(Default)]
struct GlobalSlots {
    values: Vec<usize>,
    free: Vec<usize>,
}

pub struct Heap {
    options: GcOptions,
    pages: PageAllocator,
    centrals: Box<[SpanCentral]>,
    sweeper: Sweeper,
    specials: Specials,
    finalizer_queue: FinalizerQueue,
    stats: HeapStats,
    pacer: Pacer,
    safepoint: Safepoint,

    phase: PhaseCell,
    sweepgen: AtomicU32,
    /// Value of the mark bit that means "marked" in the current cycle.
    polarity: AtomicBool,
    barrier: SharedFlag,
    work_queue: WorkQueue,
    workers: Pool,
    background_marking: SharedFlag,

    mutators: RankedMutex<Vec<Arc<MutatorShared>>>,
    globals: RankedMutex<GlobalSlots>,
    root_sources: RankedMutex<Vec<Arc<dyn RootSource>>>,

    /// `Some` while a cycle runs, from before mark start to the end of
    /// mark termination.
    cycle: Monitor<Option<CycleInfo>>,
    cycles_started: Monitor<u64>,
    gc_id: AtomicU64,

    controller: SharedFlag,
    gc_request: Monitor<GcRequest>,
    scavenger_wakeup: Monitor<bool>,
}

impl Heap {
    pub fn new(options: GcOptions) -> io::Result<Arc<Self>> {
        let pages = PageAllocator::new(options.address_space)?;
        let centrals = (0..NUM_SPAN_CLASSES)
            .map(|i| SpanCentral::new(SpanClass(i as u8)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let nworkers = mark_worker_count(&options);

        log::info!(
            target: "gc",
            "Heap reserved {} at {:#x}, gc percent {}, {} mark worker(s)",
            formatted_size(pages.reservation().size()),
            pages.reservation().start(),
            options.gc_percent,
            nworkers
        );
        if let Some(limit) = options.memory_limit {
            log::info!(target: "gc", "Memory limit {}", formatted_size(limit));
        }

        Ok(Arc::new(Self {
            pacer: Pacer::new(&options),
            pages,
            centrals,
            sweeper: Sweeper::new(),
            specials: Specials::new(),
            finalizer_queue: FinalizerQueue::new(),
            stats: HeapStats::new(),
            safepoint: Safepoint::new(),
            phase: PhaseCell::new(),
            sweepgen: AtomicU32::new(0),
            polarity: AtomicBool::new(false),
            barrier: SharedFlag::new(),
            work_queue: WorkQueue::new(),
            workers: Pool::new(nworkers),
            background_marking: SharedFlag::new(),
            mutators: RankedMutex::new(LockRank::Mutators, Vec::new()),
            globals: RankedMutex::new(LockRank::Globals, GlobalSlots::default()),
            root_sources: RankedMutex::new(LockRank::Globals, Vec::new()),
            cycle: Monitor::new(LockRank::Cycle, None),
            cycles_started: Monitor::new(LockRank::Service, 0),
            gc_id: AtomicU64::new(0),
            controller: SharedFlag::new(),
            gc_request: Monitor::new(LockRank::Service, GcRequest::default()),
            scavenger_wakeup: Monitor::new(LockRank::Service, false),
            options,
        }))
    }

    /// Attaches the calling thread to the heap.
    pub fn mutator(self: &Arc<Self>) -> Mutator {
        Mutator::attach(self.clone())
    }

    pub fn options(&self) -> &GcOptions {
        &self.options
    }

    pub fn pages(&self) -> &PageAllocator {
        &self.pages
    }

    #[inline]
    pub fn central(&self, spanclass: SpanClass) -> &SpanCentral {
        &self.centrals[spanclass.index()]
    }

    pub(crate) fn central_by_index(&self, index: usize) -> &SpanCentral {
        &self.centrals[index]
    }

    pub fn sweeper(&self) -> &Sweeper {
        &self.sweeper
    }

    pub fn specials(&self) -> &Specials {
        &self.specials
    }

    pub fn finalizer_queue(&self) -> &FinalizerQueue {
        &self.finalizer_queue
    }

    pub fn stats(&self) -> &HeapStats {
        &self.stats
    }

    pub fn pacer(&self) -> &Pacer {
        &self.pacer
    }

    pub fn safepoint(&self) -> &Safepoint {
        &self.safepoint
    }

    pub(crate) fn work_queue(&self) -> &WorkQueue {
        &self.work_queue
    }

    pub(crate) fn workers(&self) -> &Pool {
        &self.workers
    }

    pub(crate) fn mutators(&self) -> &RankedMutex<Vec<Arc<MutatorShared>>> {
        &self.mutators
    }

    #[inline]
    pub fn phase(&self) -> GcPhase {
        self.phase.get()
    }

    pub(crate) fn phase_cell(&self) -> &PhaseCell {
        &self.phase
    }

    #[inline]
    pub fn sweepgen(&self) -> u32 {
        self.sweepgen.load(Ordering::Acquire)
    }

    pub(crate) fn advance_sweepgen(&self) {
        self.sweepgen.fetch_add(2, Ordering::AcqRel);
    }

    #[inline]
    pub fn mark_polarity(&self) -> bool {
        self.polarity.load(Ordering::Acquire)
    }

    pub(crate) fn flip_polarity(&self) {
        self.polarity.fetch_xor(true, Ordering::AcqRel);
    }

    #[inline(always)]
    pub fn barrier_enabled(&self) -> bool {
        self.barrier.is_set()
    }

    pub(crate) fn set_barrier(&self, enabled: bool) {
        self.barrier.set_cond(enabled);
    }

    pub fn gc_id(&self) -> u64 {
        self.gc_id.load(Ordering::Relaxed)
    }

    pub(crate) fn next_gc_id(&self) -> u64 {
        self.gc_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Number of dedicated background mark workers.
    pub fn mark_workers(&self) -> usize {
        mark_worker_count(&self.options)
    }

    /// CPU share of the single mark worker when the utilization goal is
    /// below one whole processor.
    pub(crate) fn fractional_mark_utilization(&self) -> Option<f64> {
        let goal = self.options.procs as f64 * self.options.mark_utilization;
        if goal < 1.0 {
            Some(goal.max(0.01))
        } else {
            None
        }
    }

    pub(crate) fn background_marking(&self) -> bool {
        self.background_marking.is_set()
    }

    pub(crate) fn set_background_marking(&self, active: bool) {
        self.background_marking.set_cond(active);
    }

    /// Arena holding `addr`. Aborts when `addr` is not in committed heap
    /// memory.
    #[inline]
    pub(crate) fn arena_for(&self, addr: usize) -> &Arena {
        let arena = if self.pages.reservation().contains(addr) {
            self.pages.arenas().get(addr)
        } else {
            None
        };
        match arena {
            Some(arena) => arena,
            None => self.throw(Fatal::BadPointer {
                value: addr,
                reason: "address outside committed heap arenas",
            }),
        }
    }

    /// The live object `value` points into, if any.
    pub(crate) fn find_object(&self, value: usize) -> Option<ObjectRef<'_>> {
        let span = self.pages.span_of(value)?;
        if span.state() != SpanState::InUse {
            return None;
        }
        let base = span.object_base(span.object_index(value)?);
        let arena = self.pages.arenas().get(base.to_usize())?;
        if !ObjectBits::of(arena, base.to_usize()).is_allocated() {
            return None;
        }
        Some(ObjectRef { base, span, arena })
    }

    /// Like [`Heap::find_object`], for values read from pointer slots and
    /// roots. Values outside the heap are ignored; with `invalidptr` on, a
    /// value inside the heap that names no live object is fatal.
    #[inline]
    pub(crate) fn resolve(&self, value: usize) -> Option<ObjectRef<'_>> {
        if !self.pages.reservation().contains(value) {
            return None;
        }
        match self.find_object(value) {
            Some(object) => Some(object),
            None if self.options.debug.invalid_ptr => self.throw(Fatal::BadPointer {
                value,
                reason: "pointer to unallocated heap memory",
            }),
            None => None,
        }
    }

    /// The heap word at `addr`.
    #[inline(always)]
    pub(crate) fn word_unchecked(&self, addr: usize) -> &std::sync::atomic::AtomicUsize {
        debug_assert!(self.pages.reservation().contains(addr));
        // SAFETY: callers pass word aligned addresses inside a span that
        // owns committed memory, and heap words are only ever accessed
        // atomically.
        unsafe { &*(addr as *const std::sync::atomic::AtomicUsize) }
    }

    /// Whether `obj` is an allocated heap object that the current mark bits
    /// record as marked.
    pub fn is_marked(&self, obj: Address) -> bool {
        match self.find_object(obj.to_usize()) {
            Some(object) => {
                ObjectBits::of(object.arena, object.base.to_usize()).is_marked(self.mark_polarity())
            }
            None => false,
        }
    }

    /// Whether `obj` points into an allocated heap object.
    pub fn is_allocated(&self, obj: Address) -> bool {
        self.find_object(obj.to_usize()).is_some()
    }

    /// Registers a global root slot holding `value`.
    pub fn global(self: &Arc<Self>, value: Address) -> GlobalRoot {
        let mut globals = self.globals.lock();
        let index = match globals.free.pop() {
            Some(index) => {
                globals.values[index] = value.to_usize();
                index
            }
            None => {
                globals.values.push(value.to_usize());
                globals.values.len() - 1
            }
        };
        GlobalRoot {
            heap: Arc::downgrade(self),
            index,
        }
    }

    pub(crate) fn global_values(&self) -> Vec<usize> {
        self.globals.lock().values.clone()
    }

    pub fn add_root_source(&self, source: Arc<dyn RootSource>) {
        self.root_sources.lock().push(source);
    }

    pub fn remove_root_source(&self, source: &Arc<dyn RootSource>) -> bool {
        let mut sources = self.root_sources.lock();
        let before = sources.len();
        sources.retain(|s| !Arc::ptr_eq(s, source));
        sources.len() != before
    }

    pub(crate) fn root_sources(&self) -> Vec<Arc<dyn RootSource>> {
        self.root_sources.lock().clone()
    }

    /// Sets the growth percentage, returning the old one. See
    /// [`Pacer::set_gc_percent`].
    pub fn set_gc_percent(&self, pct: i32) -> i32 {
        let old = self.pacer.set_gc_percent(pct);
        log::info!(target: "gc", "GC percent {} -> {}", old, self.pacer.gc_percent());
        if self.pacer.should_start_cycle() && self.has_controller() {
            self.request_gc(false);
        }
        old
    }

    /// Sets or clears the soft memory limit, returning the old one.
    pub fn set_memory_limit(&self, limit: Option<usize>) -> Option<usize> {
        let old = self.pacer.set_memory_limit(limit);
        if self.pacer.should_start_cycle() && self.has_controller() {
            self.request_gc(false);
        }
        self.scavenger_wakeup();
        old
    }

    pub fn has_controller(&self) -> bool {
        self.controller.is_set()
    }

    pub(crate) fn set_controller(&self, running: bool) {
        self.controller.set_cond(running);
    }

    /// Asks the control thread for a cycle. `forced` starts one even when
    /// the live heap has not reached the trigger.
    pub(crate) fn request_gc(&self, forced: bool) {
        let mut request = self.gc_request.lock();
        request.pending = true;
        request.forced |= forced;
        request.notify_all();
    }

    /// Waits up to `timeout` for a cycle request. Returns `(pending, forced)`.
    pub(crate) fn take_gc_request(&self, timeout: Duration) -> (bool, bool) {
        let mut request = self.gc_request.lock();
        if !request.pending {
            request.wait_for(timeout);
        }
        let taken = (request.pending, request.forced);
        *request = GcRequest::default();
        taken
    }

    pub(crate) fn wake_controller(&self) {
        self.gc_request.notify_all();
    }

    pub fn cycles_started(&self) -> u64 {
        *self.cycles_started.lock()
    }

    pub(crate) fn note_cycle_started(&self) {
        let mut started = self.cycles_started.lock();
        *started += 1;
        started.notify_all();
    }

    /// Waits until more than `started` cycles have started. Returns `false`
    /// on timeout.
    pub(crate) fn wait_cycle_started(&self, started: u64, timeout: Duration) -> bool {
        let mut count = self.cycles_started.lock();
        if *count > started {
            return true;
        }
        count.wait_for(timeout);
        *count > started
    }

    pub fn scavenger_wakeup(&self) {
        let mut pending = self.scavenger_wakeup.lock();
        *pending = true;
        pending.notify_all();
    }

    pub(crate) fn scavenger_wait(&self, timeout: Duration) {
        let mut pending = self.scavenger_wakeup.lock();
        if !*pending {
            pending.wait_for(timeout);
        }
        *pending = false;
    }

    /// Claims the collection slot for a cycle with `cause`, waiting for a
    /// running cycle to finish first.
    pub(crate) fn acquire_cycle(&self, cause: GcCause) {
        let mut slot = self.cycle.lock();
        slot.wait_while(|slot| slot.is_some());
        *slot = Some(CycleInfo {
            cause,
            begun: Instant::now(),
            pacing: None,
        });
    }

    fn try_acquire_triggered(&self) -> bool {
        let mut slot = self.cycle.lock();
        slot.wait_while(|slot| slot.is_some());
        if !self.pacer.should_start_cycle() {
            return false;
        }
        *slot = Some(CycleInfo {
            cause: GcCause::HeapTrigger,
            begun: Instant::now(),
            pacing: None,
        });
        true
    }

    pub(crate) fn cycle_cause(&self) -> Option<GcCause> {
        self.cycle.lock().as_ref().map(|info| info.cause)
    }

    pub(crate) fn set_cycle_pacing(&self, start: CycleStart) {
        if let Some(info) = self.cycle.lock().as_mut() {
            info.pacing = Some(start);
        }
    }

    pub(crate) fn release_cycle(&self) -> Option<CycleInfo> {
        let mut slot = self.cycle.lock();
        let info = slot.take();
        slot.notify_all();
        info
    }

    /// Runs a whole cycle on the calling thread, which must not be a
    /// running mutator.
    pub fn collect(&self, cause: GcCause) {
        self.acquire_cycle(cause);
        concurrent_gc::run_cycle(self);
    }

    /// Runs a cycle if the live heap is still past the trigger once the
    /// collection slot is free. Returns whether a cycle ran.
    pub(crate) fn collect_triggered(&self) -> bool {
        if !self.try_acquire_triggered() {
            return false;
        }
        concurrent_gc::run_cycle(self);
        true
    }

    /// Full collection followed by a complete sweep.
    pub fn gc(&self) {
        self.collect(GcCause::Explicit);
        finish_sweep(self);
    }

    /// Collects, sweeps and returns every free page to the OS. Returns the
    /// number of bytes released.
    pub fn free_os_memory(&self) -> usize {
        self.collect(GcCause::FreeOsMemory);
        finish_sweep(self);
        match self.pages.scavenge(usize::MAX, None) {
            Ok(released) => {
                log::info!(target: "gc-scavenger", "released {} to the OS", formatted_size(released));
                released
            }
            Err(err) => self.throw(err),
        }
    }

    /// Marking step of the stepping API: claims the collection slot and
    /// runs mark start.
    pub fn gc_start(&self) {
        self.acquire_cycle(GcCause::Stepped);
        finish_sweep(self);
        concurrent_gc::mark_start(self);
    }

    /// Runs concurrent marking to completion on the background workers.
    pub fn gc_mark_concurrent(&self) {
        concurrent_gc::concurrent_mark(self);
    }

    /// Finishes the cycle begun with [`Heap::gc_start`].
    pub fn gc_mark_termination(&self) {
        concurrent_gc::mark_termination(self);
    }

    /// Snapshot of the heap statistics. Stops the world briefly to fold in
    /// every mutator's local counters.
    pub fn read_mem_stats(&self) -> MemStats {
        let mut out = MemStats::default();
        {
            let _stw = self.safepoint.stop_the_world(StwReason::ReadMemStats, &self.stats);
            for mutator in self.mutators.lock().iter() {
                let mut cache = mutator.cache.lock();
                self.stats.flush_local(&mut cache.local);
            }
            self.stats.fill(&mut out, self.options.procs);
        }

        let heap_sys = self.pages.heap_sys() as u64;
        out.heap_sys = heap_sys;
        out.heap_inuse = self.pages.heap_inuse() as u64;
        out.heap_idle = self.pages.heap_idle() as u64;
        out.heap_released = self.pages.heap_released() as u64;
        out.sys = heap_sys + self.pages.metadata_bytes() as u64;
        out.spans_in_use = self.pages.spans().in_use() as u64;
        let goal = self.pacer.goal();
        out.next_gc = if goal == NO_LIMIT { 0 } else { goal as u64 };
        out
    }

    /// Writes a one screen summary of the heap.
    pub fn print_on(&self, out: &mut impl fmt::Write) -> fmt::Result {
        writeln!(
            out,
            "Heap: GC({}) phase {}, sweepgen {}",
            self.gc_id(),
            self.phase().name(),
            self.sweepgen()
        )?;
        writeln!(
            out,
            " reserved {} at {:#x}, committed {}, in use {}, released {}",
            formatted_size(self.pages.reservation().size()),
            self.pages.reservation().start(),
            formatted_size(self.pages.heap_sys()),
            formatted_size(self.pages.heap_inuse()),
            formatted_size(self.pages.heap_released())
        )?;
        writeln!(out, " spans in use {}", self.pages.spans().in_use())?;
        let goal = self.pacer.goal();
        if goal == NO_LIMIT {
            write!(out, " live {}, no goal", formatted_size(self.pacer.heap_live()))
        } else {
            write!(
                out,
                " live {}, trigger {}, goal {}",
                formatted_size(self.pacer.heap_live()),
                formatted_size(self.pacer.trigger()),
                formatted_size(goal)
            )
        }
    }

    /// Reports `fatal` with a heap summary and aborts.
    #[cold]
    pub fn throw(&self, fatal: Fatal) -> ! {
        let mut summary = String::new();
        if self.print_on(&mut summary).is_ok() {
            log::error!(target: "gc", "{}", summary);
            eprintln!("{}", summary);
        }
        throw(fatal)
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        self.workers.shutdown();
        log::debug!(target: "gc", "Heap dropped after {} cycle(s)", self.stats.num_gc());
    }
}

fn mark_worker_count(options: &GcOptions) -> usize {
    let goal = options.procs as f64 * options.mark_utilization;
    (goal.floor() as usize).max(1)
}

/// A root slot owned by the embedder. The value it holds stays reachable
/// until the slot is dropped.
pub struct GlobalRoot {
    heap: Weak<Heap>,
    index: usize,
}

impl GlobalRoot {
    pub fn get(&self) -> Address {
        match self.heap.upgrade() {
            Some(heap) => Address::from_usize(heap.globals.lock().values[self.index]),
            None => Address::NULL,
        }
    }

    /// Replaces the value. Global slots are rescanned with the world
    /// stopped, so no barrier is needed.
    pub fn set(&self, value: Address) {
        if let Some(heap) = self.heap.upgrade() {
            heap.globals.lock().values[self.index] = value.to_usize();
        }
    }
}

impl Drop for GlobalRoot {
    fn drop(&mut self) {
        if let Some(heap) = self.heap.upgrade() {
            let mut globals = heap.globals.lock();
            globals.values[self.index] = 0;
            globals.free.push(self.index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::options::DebugOptions;

    fn small_heap() -> Arc<Heap> {
        Heap::new(GcOptions {
            address_space: 64 * 1024 * 1024,
            procs: 2,
            debug: DebugOptions::default(),
            ..GcOptions::default()
        })
        .unwrap()
    }

    #[test]
    fn resolves_interior_pointers() {
        let heap = small_heap();
        let mut m = heap.mutator();
        let obj = m.alloc(48, true);
        let found = heap.find_object(obj.to_usize() + 17).unwrap();
        assert_eq!(found.base, obj);
        assert!(heap.resolve(0).is_none());
        assert!(heap.resolve(0x10).is_none());
        assert!(heap.is_allocated(obj));
    }

    #[test]
    fn global_slots_are_reused() {
        let heap = small_heap();
        let a = heap.global(Address::from_usize(0x1000));
        let b = heap.global(Address::NULL);
        assert_eq!(a.get().to_usize(), 0x1000);
        b.set(Address::from_usize(0x2000));
        assert_eq!(heap.global_values(), vec![0x1000, 0x2000]);
        drop(a);
        assert_eq!(heap.global_values(), vec![0, 0x2000]);
        let c = heap.global(Address::from_usize(0x3000));
        assert_eq!(heap.global_values(), vec![0x3000, 0x2000]);
        drop(c);
    }

    #[test]
    fn worker_split() {
        let mut options = GcOptions {
            procs: 8,
            ..GcOptions::default()
        };
        assert_eq!(mark_worker_count(&options), 2);
        options.procs = 2;
        assert_eq!(mark_worker_count(&options), 1);
    }

    #[test]
    fn summary_mentions_phase() {
        let heap = small_heap();
        let mut out = String::new();
        heap.print_on(&mut out).unwrap();
        assert!(out.contains("phase off"));
        assert!(out.contains("spans in use 0"));
    }

    #[test]
    fn cycle_requests() {
        let heap = small_heap();
        assert_eq!(heap.take_gc_request(Duration::from_millis(1)), (false, false));
        heap.request_gc(false);
        heap.request_gc(true);
        assert_eq!(heap.take_gc_request(Duration::ZERO), (true, true));
        assert!(!heap.wait_cycle_started(0, Duration::from_millis(1)));
        heap.note_cycle_started();
        assert!(heap.wait_cycle_started(0, Duration::ZERO));
    }
}
