//! Finalizers and cleanups.
//!
//! Both are "specials": records attached to a heap object and kept in an
//! address ordered map. While a finalizer is registered, marking treats
//! the object's referents as roots but not the object itself. When the
//! sweeper finds such an object dead it queues the finalizer and marks the
//! object again, so it lives one more cycle for the finalizer to look at.
//! Cleanups never resurrect: they are queued with their argument once the
//! object is freed. Queued work runs on the finalizer thread.

use std::{
    collections::{BTreeMap, VecDeque},
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use crate::sync::{
    lock_rank::{LockRank, RankedMutex},
    monitor::Monitor,
};

use super::{
    concurrent_thread::{ConcurrentGCThread, ServiceFlags},
    heap::Heap,
    heap_bits::ObjectBits,
    mutator::Mutator,
    span::Span,
    Address,
};

pub type Finalizer = Box<dyn FnOnce(&mut Mutator, Address) + Send>;
pub type CleanupFn = Box<dyn FnOnce(usize) + Send>;

enum Special {
    Finalizer(Finalizer),
    Cleanup { id: u64, arg: usize, f: CleanupFn },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialError {
    /// The address does not point into a live heap object.
    NotAnObject(Address),
    /// Finalizers must be attached to the first byte of an object.
    NotObjectStart(Address),
    AlreadySet(Address),
    /// The cleanup argument refers to the object it is attached to, which
    /// would keep the object alive forever.
    SelfReference(Address),
}

impl fmt::Display for SpecialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpecialError::NotAnObject(a) => write!(f, "{} is not a heap object", a),
            SpecialError::NotObjectStart(a) => {
                write!(f, "{} does not point to the start of an object", a)
            }
            SpecialError::AlreadySet(a) => write!(f, "finalizer already set for {}", a),
            SpecialError::SelfReference(a) => {
                write!(f, "cleanup argument {} points into the object it cleans up", a)
            }
        }
    }
}

impl std::error::Error for SpecialError {}

/// Work queued by the sweeper for the finalizer thread.
pub enum Finalization {
    Finalizer { obj: Address, f: Finalizer },
    Cleanup { arg: usize, f: CleanupFn },
}

pub struct Specials {
    map: RankedMutex<BTreeMap<usize, Vec<Special>>>,
    next_cleanup: AtomicU64,
}

impl Specials {
    pub fn new() -> Self {
        Self {
            map: RankedMutex::new(LockRank::Specials, BTreeMap::new()),
            next_cleanup: AtomicU64::new(1),
        }
    }

    pub(crate) fn set_finalizer(
        &self,
        heap: &Heap,
        obj: Address,
        f: Finalizer,
    ) -> Result<(), SpecialError> {
        let object = heap
            .find_object(obj.to_usize())
            .ok_or(SpecialError::NotAnObject(obj))?;
        if object.base != obj {
            return Err(SpecialError::NotObjectStart(obj));
        }

        let mut map = self.map.lock();
        let list = map.entry(obj.to_usize()).or_default();
        if list.iter().any(|s| matches!(s, Special::Finalizer(_))) {
            return Err(SpecialError::AlreadySet(obj));
        }
        list.push(Special::Finalizer(f));
        object.span.has_specials.store(true, Ordering::Release);
        Ok(())
    }

    pub(crate) fn clear_finalizer(&self, obj: Address) -> bool {
        let mut map = self.map.lock();
        let list = match map.get_mut(&obj.to_usize()) {
            Some(list) => list,
            None => return false,
        };
        let before = list.len();
        list.retain(|s| !matches!(s, Special::Finalizer(_)));
        let removed = list.len() != before;
        if list.is_empty() {
            map.remove(&obj.to_usize());
        }
        removed
    }

    pub(crate) fn add_cleanup(
        &self,
        heap: &Heap,
        obj: Address,
        arg: usize,
        f: CleanupFn,
    ) -> Result<u64, SpecialError> {
        let object = heap
            .find_object(obj.to_usize())
            .ok_or(SpecialError::NotAnObject(obj))?;
        if let Some(arg_object) = heap.find_object(arg) {
            if arg_object.base == object.base {
                return Err(SpecialError::SelfReference(Address::from_usize(arg)));
            }
        }

        let id = self.next_cleanup.fetch_add(1, Ordering::Relaxed);
        self.map
            .lock()
            .entry(obj.to_usize())
            .or_default()
            .push(Special::Cleanup { id, arg, f });
        object.span.has_specials.store(true, Ordering::Release);
        Ok(id)
    }

    pub(crate) fn stop_cleanup(&self, obj: Address, id: u64) -> bool {
        let mut map = self.map.lock();
        let list = match map.get_mut(&obj.to_usize()) {
            Some(list) => list,
            None => return false,
        };
        let before = list.len();
        list.retain(|s| !matches!(s, Special::Cleanup { id: i, .. } if *i == id));
        let removed = list.len() != before;
        if list.is_empty() {
            map.remove(&obj.to_usize());
        }
        removed
    }

    /// Calls `finalizable` for every object with a finalizer and
    /// `cleanup_arg` for every registered cleanup argument.
    pub(crate) fn for_each_root(
        &self,
        mut finalizable: impl FnMut(Address),
        mut cleanup_arg: impl FnMut(usize),
    ) {
        let map = self.map.lock();
        for (&addr, list) in map.iter() {
            for special in list {
                match special {
                    Special::Finalizer(_) => finalizable(Address::from_usize(addr)),
                    Special::Cleanup { arg, .. } => cleanup_arg(*arg),
                }
            }
        }
    }

    /// Handles the specials of the dead objects `dead` of `span`. Returns
    /// the objects that were resurrected for their finalizer.
    pub(crate) fn sweep_dead(
        &self,
        heap: &Heap,
        span: &Span,
        dead: &[(Address, ObjectBits<'_>)],
        polarity: bool,
    ) -> Vec<Address> {
        let mut resurrected = Vec::new();
        let mut queued = Vec::new();
        let elemsize = span.elemsize();
        let mut map = self.map.lock();

        for &(obj, bits) in dead {
            let range = obj.to_usize()..obj.to_usize() + elemsize;
            let keys: Vec<usize> = map.range(range).map(|(&k, _)| k).collect();
            if keys.is_empty() {
                continue;
            }

            let has_finalizer = keys.iter().any(|k| {
                map[k]
                    .iter()
                    .any(|s| matches!(s, Special::Finalizer(_)))
            });

            for key in keys {
                let list = match map.get_mut(&key) {
                    Some(list) => list,
                    None => continue,
                };
                let mut kept = Vec::new();
                for special in list.drain(..) {
                    match special {
                        Special::Finalizer(f) => queued.push(Finalization::Finalizer {
                            obj: Address::from_usize(key),
                            f,
                        }),
                        Special::Cleanup { arg, f, .. } if !has_finalizer => {
                            queued.push(Finalization::Cleanup { arg, f })
                        }
                        other => kept.push(other),
                    }
                }
                if kept.is_empty() {
                    map.remove(&key);
                } else {
                    *list = kept;
                }
            }

            if has_finalizer {
                bits.set_marked(polarity);
                resurrected.push(obj);
            }
        }

        if map.range(span.base()..span.end()).next().is_none() {
            span.has_specials.store(false, Ordering::Release);
        }
        drop(map);

        if !queued.is_empty() {
            heap.finalizer_queue().push_all(queued);
        }
        resurrected
    }

    pub fn len(&self) -> usize {
        self.map.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Specials {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a registered cleanup.
pub struct Cleanup {
    heap: Weak<Heap>,
    obj: Address,
    id: u64,
}

impl Cleanup {
    pub(crate) fn new(heap: &Arc<Heap>, obj: Address, id: u64) -> Self {
        Self {
            heap: Arc::downgrade(heap),
            obj,
            id,
        }
    }

    /// Cancels the cleanup. Returns `false` if it already ran or was queued.
    pub fn stop(&self) -> bool {
        match self.heap.upgrade() {
            Some(heap) => heap.specials().stop_cleanup(self.obj, self.id),
            None => false,
        }
    }
}

pub struct FinalizerQueue {
    queue: Monitor<VecDeque<Finalization>>,
}

impl FinalizerQueue {
    pub fn new() -> Self {
        Self {
            queue: Monitor::new(LockRank::FinalizerQueue, VecDeque::new()),
        }
    }

    pub(crate) fn push_all(&self, items: Vec<Finalization>) {
        let mut q = self.queue.lock();
        q.extend(items);
        q.notify_all();
    }

    pub(crate) fn pop(&self) -> Option<Finalization> {
        self.queue.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Blocks until work is queued or `timeout` elapses.
    pub(crate) fn wait(&self, timeout: Duration) {
        let mut q = self.queue.lock();
        if q.is_empty() {
            q.wait_for(timeout);
        }
    }

    pub(crate) fn wake(&self) {
        self.queue.notify_all();
    }

    /// Queued objects and cleanup arguments stay reachable until run.
    pub(crate) fn for_each_root(&self, mut f: impl FnMut(usize)) {
        let q = self.queue.lock();
        for item in q.iter() {
            match item {
                Finalization::Finalizer { obj, .. } => f(obj.to_usize()),
                Finalization::Cleanup { arg, .. } => f(*arg),
            }
        }
    }
}

impl Default for FinalizerQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs one queued finalizer or cleanup on `mutator`. Returns `false` when
/// the queue was empty.
pub(crate) fn run_one(mutator: &mut Mutator) -> bool {
    let item = match mutator.heap().finalizer_queue().pop() {
        Some(item) => item,
        None => return false,
    };
    match item {
        Finalization::Finalizer { obj, f } => {
            let depth = mutator.roots_len();
            mutator.push_root(obj);
            f(mutator, obj);
            mutator.truncate_roots(depth);
        }
        Finalization::Cleanup { arg, f } => f(arg),
    }
    true
}

pub struct FinalizerThread {
    heap: Arc<Heap>,
    flags: ServiceFlags,
}

impl FinalizerThread {
    pub fn new(heap: Arc<Heap>) -> Self {
        Self {
            heap,
            flags: ServiceFlags::default(),
        }
    }
}

impl ConcurrentGCThread for FinalizerThread {
    fn name(&self) -> &'static str {
        "gc-finalizer"
    }

    fn flags(&self) -> &ServiceFlags {
        &self.flags
    }

    fn run_service(&self) {
        let mut mutator = self.heap.mutator();
        let mut ran = 0usize;
        while !self.should_terminate() {
            if run_one(&mut mutator) {
                ran += 1;
                continue;
            }
            if ran > 0 {
                log::debug!(target: "gc-finalizer", "ran {} finalizers", ran);
                ran = 0;
            }
            mutator.blocking(|heap| heap.finalizer_queue().wait(Duration::from_millis(100)));
        }
    }

    fn stop_service(&self) {
        self.heap.finalizer_queue().wake();
    }
}
