//! Collection cycle driver.
//!
//! A cycle runs on the thread holding the collection slot:
//!
//! 1. finish sweeping the previous cycle,
//! 2. mark start (world stopped): flip the mark polarity, turn the write
//!    barrier on and grey the roots,
//! 3. concurrent mark on the background workers, with mutators assisting
//!    and flushing their barrier buffers,
//! 4. mark termination (world stopped): re-scan the roots, drain what is
//!    left, settle the pacer, advance the sweep generation and turn the
//!    barrier off.
//!
//! Sweeping then happens lazily in the allocators and in the background
//! sweeper. In `gcstoptheworld` debug mode steps 2 to 4 run in a single
//! pause, and with level 2 the sweep does too.

use crate::{base::formatted_size, fatal::Fatal};

use super::{
    heap::Heap,
    mark::{mark_exhaustively, mark_in_background, mark_roots, verify_marks, CycleMarks},
    pacer::{CycleEnd, CycleStart},
    safepoint::{StwGuard, StwReason},
    stats::CycleRecord,
    sweeper::finish_sweep,
    work::GcWork,
    ConcurrentPhase, GcPhase, PausePhase,
};

/// Runs the cycle whose slot the caller holds.
pub(crate) fn run_cycle(heap: &Heap) {
    finish_sweep(heap);
    match heap.options().debug.gc_stop_the_world {
        0 => {
            mark_start(heap);
            concurrent_mark(heap);
            mark_termination(heap);
        }
        level => stop_the_world_cycle(heap, level >= 2),
    }
}

/// Flips the polarity, enables the barrier and greys the roots. The world
/// must be stopped.
fn begin_marking(heap: &Heap) -> CycleStart {
    heap.phase_cell().transition(GcPhase::Off, GcPhase::MarkStart);
    heap.flip_polarity();
    heap.set_barrier(true);
    let start = heap.pacer().start_cycle();

    let marks = CycleMarks::new(heap);
    let mut gcw = GcWork::new(heap.work_queue());
    mark_roots(heap, &marks, &mut gcw);
    let (bytes_marked, scan_work) = gcw.dispose();
    heap.pacer().note_mark_work(bytes_marked, scan_work);

    heap.phase_cell().transition(GcPhase::MarkStart, GcPhase::Marking);
    start
}

pub(crate) fn mark_start(heap: &Heap) {
    let gc_id = heap.next_gc_id();
    log::info!(target: "gc", "GC({}) Start ({:?})", gc_id, heap.cycle_cause());
    let start = {
        let stw = heap
            .safepoint()
            .stop_the_world(StwReason::GcMarkStart, heap.stats());
        let _phase = PausePhase::new(heap, "Mark Start");
        let start = begin_marking(heap);
        note_pause_cpu(heap, &stw);
        start
    };
    heap.set_cycle_pacing(start);
    heap.note_cycle_started();
}

/// Moves every mutator's barrier buffer to the shared queue. Returns the
/// number of objects moved.
fn flush_barrier_buffers(heap: &Heap) -> usize {
    let mut flushed = 0;
    for mutator in heap.mutators().lock().iter() {
        flushed += mutator.wbuf.lock().flush(heap.work_queue());
    }
    flushed
}

pub(crate) fn concurrent_mark(heap: &Heap) {
    let phase = heap.phase();
    if phase != GcPhase::Marking {
        heap.throw(Fatal::InvalidPhase {
            expected: GcPhase::Marking.name(),
            found: phase.name(),
        });
    }

    let _phase = ConcurrentPhase::new(heap, "Mark");
    heap.set_background_marking(true);
    let mut rounds = 0;
    loop {
        rounds += 1;
        mark_in_background(heap);
        // Buffers left behind by mutators are picked up here or, at the
        // latest, at mark termination.
        if flush_barrier_buffers(heap) == 0 && heap.work_queue().is_empty() {
            break;
        }
    }
    heap.set_background_marking(false);
    heap.pacer().notify_waiters();
    log::debug!(
        target: "gc",
        "GC({}) concurrent mark done after {} round(s), {} marked",
        heap.gc_id(),
        rounds,
        formatted_size(heap.pacer().bytes_marked())
    );
}

/// Ends marking. The world must be stopped.
fn finish_marking(heap: &Heap) -> CycleEnd {
    heap.phase_cell()
        .transition(GcPhase::Marking, GcPhase::MarkTermination);

    for mutator in heap.mutators().lock().iter() {
        mutator.cache.lock().release_all(heap);
    }
    flush_barrier_buffers(heap);
    mark_exhaustively(heap, true);

    if heap.options().debug.gc_checkmark {
        let checked = verify_marks(heap);
        log::debug!(
            target: "gc",
            "GC({}) checkmark verified {}",
            heap.gc_id(),
            formatted_size(checked)
        );
    }

    let end = heap.pacer().end_cycle();
    heap.advance_sweepgen();
    heap.set_barrier(false);
    heap.phase_cell()
        .transition(GcPhase::MarkTermination, GcPhase::Off);
    end
}

pub(crate) fn mark_termination(heap: &Heap) {
    let end = {
        let stw = heap
            .safepoint()
            .stop_the_world(StwReason::GcMarkTermination, heap.stats());
        let _phase = PausePhase::new(heap, "Mark Termination");
        let end = finish_marking(heap);
        note_pause_cpu(heap, &stw);
        end
    };
    end_cycle(heap, end);
}

fn stop_the_world_cycle(heap: &Heap, sweep: bool) {
    let gc_id = heap.next_gc_id();
    log::info!(target: "gc", "GC({}) Start ({:?}, world stopped)", gc_id, heap.cycle_cause());
    let (start, end) = {
        let stw = heap
            .safepoint()
            .stop_the_world(StwReason::GcStopTheWorld, heap.stats());
        let _phase = PausePhase::new(heap, "Full Mark");
        let start = begin_marking(heap);
        heap.note_cycle_started();
        let end = finish_marking(heap);
        note_pause_cpu(heap, &stw);
        (start, end)
    };
    heap.set_cycle_pacing(start);

    if sweep {
        let stw = heap
            .safepoint()
            .stop_the_world(StwReason::ForceSweep, heap.stats());
        let _phase = PausePhase::new(heap, "Sweep");
        finish_sweep(heap);
        note_pause_cpu(heap, &stw);
    }
    end_cycle(heap, end);
}

fn note_pause_cpu(heap: &Heap, stw: &StwGuard<'_>) {
    heap.stats()
        .note_gc_cpu(stw.elapsed() * heap.options().procs as u32);
}

/// Gives up the collection slot and records the cycle.
fn end_cycle(heap: &Heap, end: CycleEnd) {
    heap.stats().note_gc_cpu(heap.pacer().mark_cpu_time());
    let info = heap.release_cycle();
    if let Some(info) = info {
        let start = info.pacing.unwrap_or(CycleStart {
            heap_live: 0,
            goal: 0,
            trigger: 0,
        });
        let duration = info.begun.elapsed();
        heap.stats().note_cycle(CycleRecord {
            gc_id: heap.gc_id(),
            cause: info.cause,
            heap_live_at_start: start.heap_live,
            goal_at_start: start.goal,
            trigger_at_start: start.trigger,
            heap_marked: end.heap_marked,
            next_goal: end.next_goal,
            next_trigger: end.next_trigger,
            duration,
        });
        log::info!(
            target: "gc",
            "GC({}) {:?}: {}->{} (goal {}) {}ms",
            heap.gc_id(),
            info.cause,
            formatted_size(start.heap_live),
            formatted_size(end.heap_marked),
            formatted_size(end.next_goal),
            duration.as_micros() as f64 / 1000.0
        );
    }
    heap.sweeper().wake();
    heap.scavenger_wakeup();
}
