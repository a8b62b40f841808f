//! Tri-color marking.
//!
//! Grey objects live in [`GcWork`] buffers. Draining pops an object, scans
//! its pointer words and shades every heap object they refer to: the mark
//! bit is set with a compare-and-swap, and only the marker that flips it
//! pushes the object. A second marker racing on the same object just
//! drops it.
//!
//! The same traversal verifies a finished mark in checkmark mode, writing
//! a separate bit set instead of the mark bits (see [`MarkSet`]).

use std::{
    sync::atomic::{AtomicUsize, Ordering},
    thread,
    time::{Duration, Instant},
};

use crate::{base::WORD_SIZE, fatal::Fatal};

use super::{
    heap::Heap,
    heap_bits::{is_pointer_word, ObjectBits},
    span::Span,
    work::{GcWork, WorkQueue},
    Address, ARENA_SIZE,
};

/// Scan work a background worker does between pacer updates.
const BACKGROUND_CHUNK: usize = 64 * 1024;

/// Which bit a traversal sets on the objects it reaches.
pub(crate) trait MarkSet: Sync {
    /// Marks `obj`, returning `true` if this call marked it.
    fn mark(&self, heap: &Heap, obj: Address, bits: ObjectBits<'_>) -> bool;
}

/// The mark bits of the running cycle.
pub(crate) struct CycleMarks {
    polarity: bool,
}

impl CycleMarks {
    pub(crate) fn new(heap: &Heap) -> Self {
        Self {
            polarity: heap.mark_polarity(),
        }
    }
}

impl MarkSet for CycleMarks {
    #[inline]
    fn mark(&self, _heap: &Heap, _obj: Address, bits: ObjectBits<'_>) -> bool {
        bits.try_mark(self.polarity)
    }
}

/// Check bits, used to verify that the cycle marked everything reachable.
pub(crate) struct CheckMarks {
    polarity: bool,
}

impl MarkSet for CheckMarks {
    fn mark(&self, heap: &Heap, obj: Address, bits: ObjectBits<'_>) -> bool {
        if !bits.try_check_mark() {
            return false;
        }
        if !bits.is_marked(self.polarity) {
            heap.throw(Fatal::MissedMark {
                object: obj.to_usize(),
            });
        }
        true
    }
}

/// Greys the object `value` points into, if any.
#[inline]
pub(crate) fn shade<M: MarkSet>(heap: &Heap, marks: &M, gcw: &mut GcWork<'_>, value: usize) {
    let object = match heap.resolve(value) {
        Some(object) => object,
        None => return,
    };
    let bits = ObjectBits::of(object.arena, object.base.to_usize());
    if marks.mark(heap, object.base, bits) {
        gcw.bytes_marked += object.span.elemsize();
        if !object.span.spanclass().noscan() {
            gcw.put(object.base);
        }
    }
}

/// Shades everything the pointer words of `obj` refer to.
pub(crate) fn scan_object<M: MarkSet>(
    heap: &Heap,
    marks: &M,
    gcw: &mut GcWork<'_>,
    obj: Address,
    span: &Span,
) {
    if span.spanclass().noscan() {
        return;
    }
    let size = span.elemsize();
    let end = obj.to_usize() + size;
    let mut addr = obj.to_usize();
    // Large objects may cross arenas, and pointer bits live per arena.
    while addr < end {
        let arena = heap.arena_for(addr);
        let chunk_end = end.min(arena.base() + ARENA_SIZE);
        while addr < chunk_end {
            if is_pointer_word(arena, addr) {
                let value = heap.word_unchecked(addr).load(Ordering::Acquire);
                if value != 0 {
                    shade(heap, marks, gcw, value);
                }
            }
            addr += WORD_SIZE;
        }
    }
    gcw.scan_work += size;
}

/// Scans grey objects until there are none left or `budget` bytes were
/// scanned. Returns the scan work done.
pub(crate) fn drain<M: MarkSet>(
    heap: &Heap,
    marks: &M,
    gcw: &mut GcWork<'_>,
    budget: usize,
) -> usize {
    let before = gcw.scan_work;
    while let Some(obj) = gcw.try_get() {
        match heap.pages().span_of(obj.to_usize()) {
            Some(span) => scan_object(heap, marks, gcw, obj, span),
            None => heap.throw(Fatal::BadPointer {
                value: obj.to_usize(),
                reason: "grey object outside any span",
            }),
        }
        if gcw.scan_work - before >= budget {
            break;
        }
    }
    gcw.scan_work - before
}

/// Greys the root set: mutator root stacks, globals, external root
/// sources, the referents of finalizable objects, cleanup arguments and
/// everything queued for the finalizer thread.
pub(crate) fn mark_roots<M: MarkSet>(heap: &Heap, marks: &M, gcw: &mut GcWork<'_>) {
    for mutator in heap.mutators().lock().iter() {
        for &root in mutator.roots.lock().iter() {
            shade(heap, marks, gcw, root);
        }
    }

    for value in heap.global_values() {
        shade(heap, marks, gcw, value);
    }

    for source in heap.root_sources() {
        source.roots(&mut |addr| shade(heap, marks, gcw, addr.to_usize()));
    }

    let mut finalizable = Vec::new();
    let mut cleanup_args = Vec::new();
    heap.specials()
        .for_each_root(|obj| finalizable.push(obj), |arg| cleanup_args.push(arg));
    // An object with a finalizer keeps what it refers to, not itself.
    for obj in finalizable {
        if let Some(object) = heap.resolve(obj.to_usize()) {
            scan_object(heap, marks, gcw, object.base, object.span);
        }
    }
    for arg in cleanup_args {
        shade(heap, marks, gcw, arg);
    }

    let mut queued = Vec::new();
    heap.finalizer_queue().for_each_root(|value| queued.push(value));
    for value in queued {
        shade(heap, marks, gcw, value);
    }
}

/// Counts marking workers that are still looking for work.
pub struct Terminator {
    nworkers: AtomicUsize,
}

impl Terminator {
    pub fn new(nworkers: usize) -> Self {
        Self {
            nworkers: AtomicUsize::new(nworkers),
        }
    }

    /// Called by a worker that ran out of local work. Returns `true` once
    /// every worker is idle and the shared queue is empty, `false` when
    /// new work showed up and the caller should drain again.
    pub fn try_terminate(&self, queue: &WorkQueue) -> bool {
        self.nworkers.fetch_sub(1, Ordering::SeqCst);
        loop {
            if !queue.is_empty() {
                self.nworkers.fetch_add(1, Ordering::SeqCst);
                return false;
            }
            if self.nworkers.load(Ordering::SeqCst) == 0 {
                return true;
            }
            thread::sleep(Duration::from_micros(1));
        }
    }
}

/// Runs the background mark workers until the grey set is empty.
pub(crate) fn mark_in_background(heap: &Heap) {
    let nworkers = heap.mark_workers();
    let fractional = heap.fractional_mark_utilization();
    let terminator = Terminator::new(nworkers);
    let marks = CycleMarks::new(heap);

    // Blocks until every task is done.
    heap.workers().scoped(|scope| {
        for _ in 0..nworkers {
            let terminator = &terminator;
            let marks = &marks;
            scope.execute(move || background_worker(heap, marks, terminator, fractional));
        }
    });
}

fn background_worker(
    heap: &Heap,
    marks: &CycleMarks,
    terminator: &Terminator,
    fractional: Option<f64>,
) {
    let mut gcw = GcWork::new(heap.work_queue());
    let mut busy = Duration::ZERO;
    loop {
        loop {
            let chunk = Instant::now();
            let work = drain(heap, marks, &mut gcw, BACKGROUND_CHUNK);
            if work == 0 {
                break;
            }
            let elapsed = chunk.elapsed();
            busy += elapsed;
            heap.pacer().add_background_credit(work);
            if let Some(utilization) = fractional {
                // Idle long enough to keep this worker at its CPU share.
                thread::sleep(elapsed.mul_f64(1.0 / utilization - 1.0));
            }
        }
        if terminator.try_terminate(gcw.queue()) {
            break;
        }
    }
    let (bytes_marked, scan_work) = gcw.dispose();
    heap.pacer().note_mark_work(bytes_marked, scan_work);
    heap.pacer().note_mark_time(busy);
}

/// Marking done by an allocating mutator to pay for its allocation.
/// Returns the scan work performed, at most about `work`.
pub(crate) fn assist_mark(heap: &Heap, work: usize) -> usize {
    let start = Instant::now();
    let marks = CycleMarks::new(heap);
    let mut gcw = GcWork::new(heap.work_queue());
    let done = drain(heap, &marks, &mut gcw, work);
    let (bytes_marked, scan_work) = gcw.dispose();
    heap.pacer().note_mark_work(bytes_marked, scan_work);
    heap.pacer().note_assist_time(start.elapsed());
    done
}

/// Drains the grey set on the calling thread. Used with the world
/// stopped.
pub(crate) fn mark_exhaustively(heap: &Heap, regrey_roots: bool) {
    let marks = CycleMarks::new(heap);
    let mut gcw = GcWork::new(heap.work_queue());
    if regrey_roots {
        mark_roots(heap, &marks, &mut gcw);
    }
    drain(heap, &marks, &mut gcw, usize::MAX);
    let (bytes_marked, scan_work) = gcw.dispose();
    heap.pacer().note_mark_work(bytes_marked, scan_work);
}

/// Re-traverses the heap from the roots into the check bits and aborts on
/// any reachable object the cycle left unmarked. Needs the world stopped
/// and the grey set empty.
pub(crate) fn verify_marks(heap: &Heap) -> usize {
    for arena in heap.pages().arenas().iter() {
        arena.check_marks().clear_all();
    }
    let marks = CheckMarks {
        polarity: heap.mark_polarity(),
    };
    let mut gcw = GcWork::new(heap.work_queue());
    mark_roots(heap, &marks, &mut gcw);
    drain(heap, &marks, &mut gcw, usize::MAX);
    let (bytes_checked, _) = gcw.dispose();
    bytes_checked
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn single_worker_terminates() {
        let queue = WorkQueue::new();
        let terminator = Terminator::new(1);
        assert!(terminator.try_terminate(&queue));
    }

    #[test]
    fn workers_rejoin_for_late_work() {
        let queue = Arc::new(WorkQueue::new());
        let terminator = Arc::new(Terminator::new(2));

        let waiter = {
            let queue = queue.clone();
            let terminator = terminator.clone();
            thread::spawn(move || {
                let mut rounds = 0;
                while !terminator.try_terminate(&queue) {
                    rounds += 1;
                    let mut gcw = GcWork::new(&queue);
                    while gcw.try_get().is_some() {}
                }
                rounds
            })
        };

        {
            let mut gcw = GcWork::new(&queue);
            gcw.put(Address::from_usize(64));
            gcw.flush();
        }
        // Whoever picks the buffer up, termination only happens once it
        // is drained.
        let mut gcw = GcWork::new(&queue);
        while gcw.try_get().is_some() {}
        drop(gcw);
        while !terminator.try_terminate(&queue) {
            let mut gcw = GcWork::new(&queue);
            while gcw.try_get().is_some() {}
        }
        waiter.join().unwrap();
        assert!(queue.is_empty());
    }
}
