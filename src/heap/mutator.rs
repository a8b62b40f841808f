//! Mutator contexts.
//!
//! A [`Mutator`] is what a thread uses to touch the heap: it allocates
//! through its own cache, stores pointers through the write barrier and
//! keeps its references on an explicit root stack, which is what the
//! collector scans as this thread's stack. Mutators cooperate with
//! stop-the-world requests by polling at every allocation and at
//! [`Mutator::safepoint`]; a thread about to block outside the heap wraps
//! the wait in [`Mutator::blocking`].
//!
//! Only addresses held in roots (or reachable from them) survive a
//! collection, and any allocation may collect.

use std::{
    sync::{
        atomic::Ordering,
        Arc,
    },
    time::Duration,
};

use crate::{
    base::WORD_SIZE,
    fatal::Fatal,
    sync::lock_rank::{LockRank, RankedMutex},
};

use super::{
    cache::ThreadCache,
    finalizer::{run_one, Cleanup, SpecialError},
    heap::Heap,
    heap_bits::{is_pointer_word, PointerLayout},
    malloc::{alloc_fast, alloc_slow, SizeKind},
    mark::assist_mark,
    safepoint::Safepoint,
    stats::{GcCause, MemStats},
    write_barrier::{write_barrier, WriteBarrierBuffer},
    Address, GcPhase,
};

/// Smallest piece of marking an assist bothers to do.
const MIN_ASSIST_WORK: usize = 64 * 1024;

/// The parts of a mutator the collector reaches from other threads.
pub(crate) struct MutatorShared {
    pub(crate) cache: RankedMutex<ThreadCache>,
    pub(crate) wbuf: RankedMutex<WriteBarrierBuffer>,
    pub(crate) roots: RankedMutex<Vec<usize>>,
}

impl MutatorShared {
    fn new() -> Self {
        Self {
            cache: RankedMutex::new(LockRank::ThreadCache, ThreadCache::new()),
            wbuf: RankedMutex::new(LockRank::WriteBarrierBuf, WriteBarrierBuffer::new()),
            roots: RankedMutex::new(LockRank::Roots, Vec::new()),
        }
    }
}

pub struct Mutator {
    heap: Arc<Heap>,
    shared: Arc<MutatorShared>,
    /// Allocation bytes already paid for with mark work. Negative is debt.
    assist_bytes: isize,
    assist_cycle: u64,
}

impl Mutator {
    pub(crate) fn attach(heap: Arc<Heap>) -> Self {
        let shared = Arc::new(MutatorShared::new());
        heap.safepoint().register();
        heap.mutators().lock().push(shared.clone());
        Self {
            heap,
            shared,
            assist_bytes: 0,
            assist_cycle: 0,
        }
    }

    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    /// Polls for a stop-the-world request.
    #[inline]
    pub fn safepoint(&mut self) {
        if self.heap.safepoint().is_requested() {
            self.heap.safepoint().park();
        }
    }

    /// Runs `f` in a safe region: the collector may stop the world while
    /// `f` runs without waiting for this thread. `f` must not touch heap
    /// objects.
    pub fn blocking<R>(&mut self, f: impl FnOnce(&Arc<Heap>) -> R) -> R {
        let _region = SafeRegion::enter(self.heap.safepoint());
        f(&self.heap)
    }

    /// Allocates `size` bytes. With `has_pointers` every word of the object
    /// is a pointer slot, otherwise none is. The memory is zeroed.
    pub fn alloc(&mut self, size: usize, has_pointers: bool) -> Address {
        let layout = if has_pointers {
            PointerLayout::AllPointers
        } else {
            PointerLayout::Scalar
        };
        self.alloc_with_layout(size, &layout)
    }

    pub fn alloc_with_layout(&mut self, size: usize, layout: &PointerLayout) -> Address {
        self.safepoint();
        let size = size.max(1);
        if size > self.heap.pages().reservation().size() {
            self.heap.throw(Fatal::OutOfAddressSpace { requested: size });
        }

        match self.heap.phase() {
            GcPhase::Marking => self.assist(size),
            GcPhase::Off if self.heap.pacer().should_start_cycle() => self.trigger_gc(),
            _ => {}
        }

        let kind = SizeKind::of(size, !layout.has_pointers());
        let mut paced = false;
        loop {
            let heap = &*self.heap;
            let mut cache = self.shared.cache.lock();
            if let Some(addr) = alloc_fast(heap, &mut cache, size, layout, kind) {
                return addr;
            }
            if !paced
                && heap.phase() == GcPhase::Off
                && heap.pacer().would_exceed_goal(kind.refill_bytes())
            {
                drop(cache);
                paced = true;
                self.wait_for_cycle();
                continue;
            }
            return alloc_slow(heap, &mut cache, size, layout, kind);
        }
    }

    /// Starts a cycle because the live heap crossed the trigger.
    fn trigger_gc(&mut self) {
        if self.heap.has_controller() {
            self.heap.request_gc(false);
        } else {
            self.blocking(|heap| heap.collect_triggered());
        }
    }

    /// Blocks until a cycle starts. Growing the heap now would cross the
    /// goal before the collector had a chance to run.
    fn wait_for_cycle(&mut self) {
        let started = self.heap.cycles_started();
        loop {
            if !self.heap.has_controller() {
                self.blocking(|heap| heap.collect(GcCause::HeapTrigger));
                return;
            }
            self.heap.request_gc(true);
            let begun = self.blocking(|heap| {
                heap.wait_cycle_started(started, Duration::from_millis(10))
            });
            if begun {
                return;
            }
        }
    }

    /// Pays for `size` bytes allocated during marking.
    fn assist(&mut self, size: usize) {
        let heap = self.heap.clone();
        let cycle = heap.cycles_started();
        if self.assist_cycle != cycle {
            self.assist_cycle = cycle;
            self.assist_bytes = 0;
        }
        self.assist_bytes -= size as isize;
        if self.assist_bytes >= 0 {
            return;
        }

        let pacer = heap.pacer();
        let mut debt = pacer.assist_credit(self.assist_bytes.unsigned_abs());
        let mut work_done = pacer.steal_background_credit(debt);
        debt -= work_done;

        while debt > 0 && heap.phase() == GcPhase::Marking {
            let done = assist_mark(&heap, debt.max(MIN_ASSIST_WORK));
            work_done += done;
            debt = debt.saturating_sub(done);
            if done == 0 && debt > 0 {
                if !heap.background_marking() {
                    // Nobody will earn credit for us; owe it.
                    break;
                }
                self.blocking(|heap| heap.pacer().wait_for_credit(Duration::from_millis(1)));
                let stolen = pacer.steal_background_credit(debt);
                work_done += stolen;
                debt -= stolen;
            }
        }

        let paid = pacer.bytes_for_work(work_done).min(isize::MAX as usize / 2);
        self.assist_bytes = self.assist_bytes.saturating_add(paid as isize);
    }

    /// Address of word `index` of the object `obj` points into.
    fn object_word(&self, obj: Address, index: usize) -> usize {
        let object = match self.heap.find_object(obj.to_usize()) {
            Some(object) => object,
            None => self.heap.throw(Fatal::BadPointer {
                value: obj.to_usize(),
                reason: "field access through an address that is not an object",
            }),
        };
        let slot = obj.word(index).to_usize();
        let end = object.base.to_usize() + object.span.elemsize();
        if slot % WORD_SIZE != 0 || slot + WORD_SIZE > end {
            self.heap.throw(Fatal::BadPointer {
                value: slot,
                reason: "field outside the object or misaligned",
            });
        }
        slot
    }

    pub fn read_ptr(&self, obj: Address, index: usize) -> Address {
        Address::from_usize(self.read_word(obj, index))
    }

    /// Stores `value` into pointer slot `index` of `obj`.
    pub fn write_ptr(&mut self, obj: Address, index: usize, value: Address) {
        let slot = self.object_word(obj, index);
        if !is_pointer_word(self.heap.arena_for(slot), slot) {
            self.heap.throw(Fatal::BadPointer {
                value: value.to_usize(),
                reason: "pointer stored into a scalar word",
            });
        }
        let word = self.heap.word_unchecked(slot);
        let mut wbuf = self.shared.wbuf.lock();
        write_barrier(
            &self.heap,
            &mut wbuf,
            slot,
            word.load(Ordering::Relaxed),
            value.to_usize(),
        );
        word.store(value.to_usize(), Ordering::Release);
    }

    pub fn read_word(&self, obj: Address, index: usize) -> usize {
        let slot = self.object_word(obj, index);
        self.heap.word_unchecked(slot).load(Ordering::Acquire)
    }

    /// Stores a scalar. Pointer slots only accept null here; use
    /// [`Mutator::write_ptr`] for pointers.
    pub fn write_word(&mut self, obj: Address, index: usize, value: usize) {
        let slot = self.object_word(obj, index);
        if value != 0 && is_pointer_word(self.heap.arena_for(slot), slot) {
            self.heap.throw(Fatal::BadPointer {
                value,
                reason: "scalar stored into a pointer word",
            });
        }
        self.heap.word_unchecked(slot).store(value, Ordering::Release);
    }

    /// Pushes a root and returns its index.
    pub fn push_root(&mut self, value: Address) -> usize {
        let mut roots = self.shared.roots.lock();
        roots.push(value.to_usize());
        roots.len() - 1
    }

    pub fn pop_root(&mut self) -> Option<Address> {
        self.shared.roots.lock().pop().map(Address::from_usize)
    }

    pub fn root(&self, index: usize) -> Address {
        Address::from_usize(self.shared.roots.lock()[index])
    }

    pub fn set_root(&mut self, index: usize, value: Address) {
        self.shared.roots.lock()[index] = value.to_usize();
    }

    pub fn roots_len(&self) -> usize {
        self.shared.roots.lock().len()
    }

    pub fn truncate_roots(&mut self, len: usize) {
        self.shared.roots.lock().truncate(len);
    }

    /// Runs a full collection and finishes sweeping before returning.
    pub fn gc(&mut self) {
        self.blocking(|heap| heap.gc());
    }

    pub fn read_mem_stats(&mut self) -> MemStats {
        self.blocking(|heap| heap.read_mem_stats())
    }

    pub fn set_finalizer(
        &mut self,
        obj: Address,
        f: impl FnOnce(&mut Mutator, Address) + Send + 'static,
    ) -> Result<(), SpecialError> {
        self.heap
            .specials()
            .set_finalizer(&self.heap, obj, Box::new(f))
    }

    pub fn clear_finalizer(&mut self, obj: Address) -> bool {
        self.heap.specials().clear_finalizer(obj)
    }

    /// Runs `f(arg)` once `obj` has been freed. `arg` stays reachable until
    /// then and must not refer to `obj`.
    pub fn add_cleanup(
        &mut self,
        obj: Address,
        arg: usize,
        f: impl FnOnce(usize) + Send + 'static,
    ) -> Result<Cleanup, SpecialError> {
        let id = self
            .heap
            .specials()
            .add_cleanup(&self.heap, obj, arg, Box::new(f))?;
        Ok(Cleanup::new(&self.heap, obj, id))
    }

    /// Runs queued finalizers and cleanups on this mutator. Returns how many
    /// ran.
    pub fn run_finalizers(&mut self) -> usize {
        let mut ran = 0;
        while run_one(self) {
            ran += 1;
        }
        ran
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        self.shared.cache.lock().release_all(&self.heap);
        self.shared.wbuf.lock().flush(self.heap.work_queue());
        self.heap
            .mutators()
            .lock()
            .retain(|m| !Arc::ptr_eq(m, &self.shared));
        self.heap.safepoint().deregister();
    }
}

struct SafeRegion<'a>(&'a Safepoint);

impl<'a> SafeRegion<'a> {
    fn enter(safepoint: &'a Safepoint) -> Self {
        safepoint.enter_safe_region();
        Self(safepoint)
    }
}

impl Drop for SafeRegion<'_> {
    fn drop(&mut self) {
        self.0.leave_safe_region();
    }
}
