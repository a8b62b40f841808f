//! Write barrier.
//!
//! Every store of a pointer into a heap object goes through
//! [`write_barrier`] before the store itself. While a cycle is marking
//! this is a Dijkstra insertion barrier: the new value is marked right
//! away, so an object can never hide behind a slot the markers already
//! scanned. Marked objects that contain pointers still need scanning; they
//! are collected in the mutator's [`WriteBarrierBuffer`] and handed to the
//! markers in batches.
//!
//! Root stacks are not barriered. Mark termination re-scans them with the
//! world stopped.

use super::{
    heap::Heap,
    heap_bits::ObjectBits,
    work::{WorkBuf, WorkQueue, WORK_BUF_CAPACITY},
    Address,
};

pub const WBUF_CAPACITY: usize = WORK_BUF_CAPACITY;

/// Fixed capacity buffer of objects greyed by the write barrier.
pub struct WriteBarrierBuffer {
    entries: Vec<Address>,
}

impl WriteBarrierBuffer {
    pub fn new() -> Self {
        Self {
            entries: Vec::with_capacity(WBUF_CAPACITY),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Records `obj`, flushing to `queue` first if the buffer is full.
    pub fn record(&mut self, queue: &WorkQueue, obj: Address) {
        if self.entries.len() == WBUF_CAPACITY {
            self.flush(queue);
        }
        self.entries.push(obj);
    }

    /// Moves every entry to the shared grey queue. Returns how many moved.
    pub fn flush(&mut self, queue: &WorkQueue) -> usize {
        let n = self.entries.len();
        if n != 0 {
            let entries = std::mem::replace(&mut self.entries, Vec::with_capacity(WBUF_CAPACITY));
            queue.put_full(Box::new(WorkBuf::from_vec(entries)));
        }
        n
    }
}

impl Default for WriteBarrierBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Called with the slot about to be written, its current value and the
/// value being stored. Only `new` is shaded; the overwritten value is left
/// to the markers. Cheap when no cycle is marking: one flag check.
#[inline]
pub(crate) fn write_barrier(
    heap: &Heap,
    wbuf: &mut WriteBarrierBuffer,
    _slot: usize,
    _old: usize,
    new: usize,
) {
    if !heap.barrier_enabled() || new == 0 {
        return;
    }
    shade_slow(heap, wbuf, new);
}

#[inline(never)]
fn shade_slow(heap: &Heap, wbuf: &mut WriteBarrierBuffer, new: usize) {
    let object = match heap.resolve(new) {
        Some(object) => object,
        None => return,
    };
    let bits = ObjectBits::of(object.arena, object.base.to_usize());
    if bits.try_mark(heap.mark_polarity()) {
        heap.pacer().note_mark_work(object.span.elemsize(), 0);
        if !object.span.spanclass().noscan() {
            wbuf.record(heap.work_queue(), object.base);
        }
    }
}
