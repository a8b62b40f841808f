//! Grey object work buffers.
//!
//! Each marker owns a [`GcWork`], a local buffer of objects waiting to be
//! scanned. Full buffers move to the shared [`WorkQueue`] where idle
//! markers pick them up; a buffer is only ever owned by one marker at a
//! time.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_deque::{Injector, Steal};
use crossbeam_queue::SegQueue;

use super::Address;

pub const WORK_BUF_CAPACITY: usize = 256;

pub struct WorkBuf {
    objs: Vec<Address>,
}

impl WorkBuf {
    pub fn new() -> Self {
        Self {
            objs: Vec::with_capacity(WORK_BUF_CAPACITY),
        }
    }

    pub(crate) fn from_vec(objs: Vec<Address>) -> Self {
        debug_assert!(objs.len() <= WORK_BUF_CAPACITY);
        Self { objs }
    }

    /// Returns `false` when the buffer is full.
    #[inline]
    pub fn push(&mut self, obj: Address) -> bool {
        if self.objs.len() == WORK_BUF_CAPACITY {
            return false;
        }
        self.objs.push(obj);
        true
    }

    #[inline]
    pub fn pop(&mut self) -> Option<Address> {
        self.objs.pop()
    }

    pub fn len(&self) -> usize {
        self.objs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objs.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.objs.len() == WORK_BUF_CAPACITY
    }

    fn split_off_half(&mut self) -> WorkBuf {
        let at = self.objs.len() / 2;
        WorkBuf {
            objs: self.objs.split_off(at),
        }
    }
}

impl Default for WorkBuf {
    fn default() -> Self {
        Self::new()
    }
}

pub struct WorkQueue {
    full: Injector<Box<WorkBuf>>,
    empty: SegQueue<Box<WorkBuf>>,
    nfull: AtomicUsize,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self {
            full: Injector::new(),
            empty: SegQueue::new(),
            nfull: AtomicUsize::new(0),
        }
    }

    pub fn put_full(&self, buf: Box<WorkBuf>) {
        if buf.is_empty() {
            self.empty.push(buf);
            return;
        }
        self.nfull.fetch_add(1, Ordering::SeqCst);
        self.full.push(buf);
    }

    pub fn try_get_full(&self) -> Option<Box<WorkBuf>> {
        loop {
            match self.full.steal() {
                Steal::Success(buf) => {
                    self.nfull.fetch_sub(1, Ordering::SeqCst);
                    return Some(buf);
                }
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }

    pub fn get_empty(&self) -> Box<WorkBuf> {
        self.empty.pop().unwrap_or_default()
    }

    pub fn put_empty(&self, buf: Box<WorkBuf>) {
        debug_assert!(buf.is_empty());
        self.empty.push(buf);
    }

    /// Number of buffers waiting to be scanned.
    pub fn pending(&self) -> usize {
        self.nfull.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.pending() == 0
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// A marker's view of the grey set, plus the work it has done.
pub struct GcWork<'a> {
    queue: &'a WorkQueue,
    buf: Box<WorkBuf>,
    /// Bytes of objects this marker blackened.
    pub bytes_marked: usize,
    /// Bytes of objects this marker scanned.
    pub scan_work: usize,
    pushes: usize,
}

impl<'a> GcWork<'a> {
    pub fn new(queue: &'a WorkQueue) -> Self {
        Self {
            buf: queue.get_empty(),
            queue,
            bytes_marked: 0,
            scan_work: 0,
            pushes: 0,
        }
    }

    pub fn queue(&self) -> &'a WorkQueue {
        self.queue
    }

    #[inline]
    pub fn put(&mut self, obj: Address) {
        if !self.buf.push(obj) {
            let full = std::mem::replace(&mut self.buf, self.queue.get_empty());
            self.queue.put_full(full);
            self.buf.push(obj);
        }
        self.pushes += 1;
        if self.pushes % 64 == 0 {
            self.balance();
        }
    }

    /// Shares half of a large local buffer when nobody else has work.
    fn balance(&mut self) {
        if self.buf.len() > 4 && self.queue.is_empty() {
            let half = self.buf.split_off_half();
            self.queue.put_full(Box::new(half));
        }
    }

    #[inline]
    pub fn try_get(&mut self) -> Option<Address> {
        if let Some(obj) = self.buf.pop() {
            return Some(obj);
        }
        let full = self.queue.try_get_full()?;
        let empty = std::mem::replace(&mut self.buf, full);
        self.queue.put_empty(empty);
        self.buf.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Publishes the local buffer so other markers can drain it.
    pub fn flush(&mut self) {
        if !self.buf.is_empty() {
            let full = std::mem::replace(&mut self.buf, self.queue.get_empty());
            self.queue.put_full(full);
        }
    }

    /// Flushes and returns `(bytes_marked, scan_work)`.
    pub fn dispose(mut self) -> (usize, usize) {
        self.flush();
        let counters = (self.bytes_marked, self.scan_work);
        self.bytes_marked = 0;
        self.scan_work = 0;
        counters
    }
}

impl Drop for GcWork<'_> {
    fn drop(&mut self) {
        self.flush();
        let buf = std::mem::take(&mut self.buf);
        self.queue.put_empty(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_goes_to_the_queue() {
        let queue = WorkQueue::new();
        let mut gcw = GcWork::new(&queue);
        for i in 0..(WORK_BUF_CAPACITY * 2 + 10) {
            gcw.put(Address::from_usize((i + 1) * 8));
        }
        assert!(queue.pending() >= 2);

        let mut seen = 0;
        while gcw.try_get().is_some() {
            seen += 1;
        }
        assert_eq!(seen, WORK_BUF_CAPACITY * 2 + 10);
        assert!(queue.is_empty());
    }

    #[test]
    fn work_moves_between_markers() {
        let queue = WorkQueue::new();
        let mut a = GcWork::new(&queue);
        a.put(Address::from_usize(8));
        a.put(Address::from_usize(16));
        a.flush();
        assert_eq!(queue.pending(), 1);

        let mut b = GcWork::new(&queue);
        assert_eq!(b.try_get(), Some(Address::from_usize(16)));
        assert_eq!(b.try_get(), Some(Address::from_usize(8)));
        assert_eq!(b.try_get(), None);

        b.bytes_marked = 32;
        assert_eq!(b.dispose(), (32, 0));
    }
}
