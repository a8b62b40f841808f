//! Span sweeping.
//!
//! A span needs sweeping when its generation is two behind the heap's. The
//! sweeper claims it (generation `sg - 2` to `sg - 1`), frees every
//! allocated object whose mark bit does not match the current polarity,
//! and publishes the span as swept (`sg`). Spans left without objects go
//! back to the page allocator. Every span is swept before the next cycle
//! may start, either by a cache refill that needs it, by the background
//! sweeper, or by `finish_sweep`.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use crate::{
    fatal::{throw, Fatal},
    sync::{lock_rank::LockRank, monitor::Monitor},
};

use super::{
    concurrent_thread::{ConcurrentGCThread, ServiceFlags},
    heap::Heap,
    heap_bits::ObjectBits,
    size_classes::NUM_SPAN_CLASSES,
    span::Span,
    Address,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepResult {
    pub freed_objects: usize,
    pub reclaimed_bytes: usize,
    /// The span had no live objects left and was returned to the page
    /// allocator.
    pub span_freed: bool,
}

pub struct Sweeper {
    active: AtomicUsize,
    next_class: AtomicUsize,
    wakeup: Monitor<bool>,
}

/// Held while a thread may be sweeping a span it took off a central list.
pub struct SweepingToken<'a>(&'a Sweeper);

impl Drop for SweepingToken<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Sweeper {
    pub fn new() -> Self {
        Self {
            active: AtomicUsize::new(0),
            next_class: AtomicUsize::new(0),
            wakeup: Monitor::new(LockRank::Service, false),
        }
    }

    pub fn begin(&self) -> SweepingToken<'_> {
        self.active.fetch_add(1, Ordering::AcqRel);
        SweepingToken(self)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn wake(&self) {
        let mut pending = self.wakeup.lock();
        *pending = true;
        pending.notify_all();
    }

    fn wait(&self, timeout: Duration) {
        let mut pending = self.wakeup.lock();
        if !*pending {
            pending.wait_for(timeout);
        }
        *pending = false;
    }
}

impl Default for Sweeper {
    fn default() -> Self {
        Self::new()
    }
}

/// Sweeps `span`, which the caller took off an unswept list. With
/// `preserve` an empty span is kept for the caller instead of being freed.
///
/// Only for callers that cannot race with mark termination, i.e. mutators
/// outside a blocking region.
pub(crate) fn sweep_span(heap: &Heap, span: &Span, preserve: bool) -> SweepResult {
    match try_sweep_span(heap, span, heap.sweepgen(), preserve) {
        Some(result) => result,
        None => throw(Fatal::SpanCorruption {
            span: span.id().index() as u32,
            detail: "sweeping a span that is not waiting for it",
        }),
    }
}

/// Sweeps `span` if it still needs sweeping under generation `sg`.
/// Returns `None`, leaving the span untouched, when it does not.
pub(crate) fn try_sweep_span(
    heap: &Heap,
    span: &Span,
    sg: u32,
    preserve: bool,
) -> Option<SweepResult> {
    if span
        .sweepgen
        .compare_exchange(
            sg.wrapping_sub(2),
            sg.wrapping_sub(1),
            Ordering::AcqRel,
            Ordering::Relaxed,
        )
        .is_err()
    {
        return None;
    }

    let polarity = heap.mark_polarity();
    let arena = heap.arena_for(span.base());
    let elemsize = span.elemsize();
    let mut freed = 0;

    let mut free = |bits: ObjectBits<'_>| {
        bits.set_allocated(false);
        freed += 1;
    };

    if span.has_specials.load(Ordering::Acquire) {
        let dead: Vec<(Address, ObjectBits<'_>)> = span
            .slots()
            .map(|obj| (obj, ObjectBits::of(arena, obj.to_usize())))
            .filter(|(_, bits)| bits.is_allocated() && !bits.is_marked(polarity))
            .collect();
        let resurrected = heap.specials().sweep_dead(heap, span, &dead, polarity);
        for (obj, bits) in dead {
            if !resurrected.contains(&obj) {
                free(bits);
            }
        }
    } else {
        for obj in span.slots() {
            let bits = ObjectBits::of(arena, obj.to_usize());
            if bits.is_allocated() && !bits.is_marked(polarity) {
                free(bits);
            }
        }
    }

    let result = SweepResult {
        freed_objects: freed,
        reclaimed_bytes: freed * elemsize,
        span_freed: false,
    };

    if freed > 0 {
        span.alloc_count.fetch_sub(freed, Ordering::AcqRel);
        span.needzero.store(true, Ordering::Relaxed);
        heap.stats().note_freed(span.spanclass(), freed, elemsize);
    }
    span.free_index.store(0, Ordering::Relaxed);
    span.sweepgen.store(sg, Ordering::Release);

    if !preserve && span.allocated() == 0 {
        heap.pages().free_span(span);
        return Some(SweepResult {
            span_freed: true,
            ..result
        });
    }
    Some(result)
}

/// Sweeps one span of any class. Returns `None` once nothing is left to
/// sweep.
///
/// Background sweepers are not stopped for mark termination, so the
/// generation may advance while this walks the centrals. A span popped
/// under the stale generation came off what is now a swept list; it is
/// filed back and the walk restarts. Our token keeps the next cycle from
/// starting, so the generation moves at most once.
pub fn sweep_one(heap: &Heap) -> Option<SweepResult> {
    let _sweeping = heap.sweeper().begin();
    'walk: loop {
        let sg = heap.sweepgen();
        let start = heap.sweeper().next_class.fetch_add(1, Ordering::Relaxed);
        for i in 0..NUM_SPAN_CLASSES {
            let central = heap.central_by_index((start + i) % NUM_SPAN_CLASSES);
            if let Some(id) = central.pop_unswept(sg) {
                let span = heap.pages().spans().get(id);
                match try_sweep_span(heap, span, sg, false) {
                    Some(result) => {
                        central.file_swept(heap, span, result);
                        return Some(result);
                    }
                    None => {
                        central.refile(heap, span);
                        continue 'walk;
                    }
                }
            }
        }
        if heap.sweepgen() == sg {
            return None;
        }
    }
}

/// Sweeps everything left over from the last cycle and waits for sweeps
/// in progress elsewhere. Returns the number of spans this call swept.
pub fn finish_sweep(heap: &Heap) -> usize {
    let mut swept = 0;
    while sweep_one(heap).is_some() {
        swept += 1;
    }
    while heap.sweeper().active() > 0 {
        std::thread::yield_now();
    }
    swept
}

pub struct BackgroundSweeper {
    heap: Arc<Heap>,
    flags: ServiceFlags,
}

impl BackgroundSweeper {
    pub fn new(heap: Arc<Heap>) -> Self {
        Self {
            heap,
            flags: ServiceFlags::default(),
        }
    }
}

impl ConcurrentGCThread for BackgroundSweeper {
    fn name(&self) -> &'static str {
        "gc-sweeper"
    }

    fn flags(&self) -> &ServiceFlags {
        &self.flags
    }

    fn run_service(&self) {
        while !self.should_terminate() {
            self.heap.sweeper().wait(Duration::from_secs(1));

            let start = Instant::now();
            let mut spans = 0usize;
            let mut reclaimed = 0usize;
            let mut freed_spans = 0usize;
            while !self.should_terminate() {
                match sweep_one(&self.heap) {
                    Some(result) => {
                        spans += 1;
                        reclaimed += result.reclaimed_bytes;
                        freed_spans += result.span_freed as usize;
                    }
                    None => break,
                }
                if spans % 64 == 0 {
                    std::thread::yield_now();
                }
            }

            if spans > 0 {
                log::debug!(
                    target: "gc-sweeper",
                    "GC({}) swept {} spans, freed {} spans, reclaimed {} in {}ms",
                    self.heap.gc_id(),
                    spans,
                    freed_spans,
                    crate::base::formatted_size(reclaimed),
                    start.elapsed().as_micros() as f64 / 1000.0
                );
                self.heap.scavenger_wakeup();
            }
        }
    }

    fn stop_service(&self) {
        self.heap.sweeper().wake();
    }
}
