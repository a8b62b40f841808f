//! Ranked locks.
//!
//! Every collector lock carries a [`LockRank`]. A thread may only acquire a
//! lock whose rank is strictly greater than every rank it already holds.
//! Debug builds keep a per-thread stack of held ranks and abort on a
//! violation; release builds compile the bookkeeping away.

use std::ops::{Deref, DerefMut};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};

/// Acquisition order, lowest first.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[repr(u8)]
pub enum LockRank {
    Cycle,
    Workers,
    Safepoint,
    Mutators,
    ThreadCache,
    WriteBarrierBuf,
    Roots,
    Central,
    Specials,
    FinalizerQueue,
    PageAlloc,
    Pacer,
    Globals,
    History,
    /// Wake up channels of background services. Never held while taking
    /// another lock.
    Service,
}

#[cfg(debug_assertions)]
mod held {
    use super::LockRank;
    use std::cell::RefCell;

    thread_local! {
        static HELD: RefCell<Vec<LockRank>> = RefCell::new(Vec::new());
    }

    pub fn acquire(rank: LockRank) {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(&top) = held.iter().max() {
                if top >= rank {
                    drop(held);
                    crate::fatal::throw(crate::fatal::Fatal::LockOrder {
                        held: top,
                        acquiring: rank,
                    });
                }
            }
            held.push(rank);
        })
    }

    pub fn release(rank: LockRank) {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held.iter().rposition(|&r| r == rank) {
                held.remove(pos);
            }
        })
    }
}

#[cfg(not(debug_assertions))]
mod held {
    use super::LockRank;

    #[inline(always)]
    pub fn acquire(_rank: LockRank) {}
    #[inline(always)]
    pub fn release(_rank: LockRank) {}
}

pub struct RankedMutex<T> {
    rank: LockRank,
    inner: Mutex<T>,
}

impl<T> RankedMutex<T> {
    pub const fn new(rank: LockRank, value: T) -> Self {
        Self {
            rank,
            inner: Mutex::new(value),
        }
    }

    pub fn rank(&self) -> LockRank {
        self.rank
    }

    pub fn lock(&self) -> RankedMutexGuard<'_, T> {
        held::acquire(self.rank);
        RankedMutexGuard {
            rank: self.rank,
            guard: self.inner.lock(),
        }
    }

    pub fn try_lock(&self) -> Option<RankedMutexGuard<'_, T>> {
        held::acquire(self.rank);
        match self.inner.try_lock() {
            Some(guard) => Some(RankedMutexGuard {
                rank: self.rank,
                guard,
            }),
            None => {
                held::release(self.rank);
                None
            }
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

pub struct RankedMutexGuard<'a, T> {
    rank: LockRank,
    guard: MutexGuard<'a, T>,
}

impl<'a, T> RankedMutexGuard<'a, T> {
    pub fn wait(&mut self, cv: &Condvar) {
        cv.wait(&mut self.guard);
    }

    /// Returns `true` if the wait timed out.
    pub fn wait_for(&mut self, cv: &Condvar, timeout: Duration) -> bool {
        cv.wait_for(&mut self.guard, timeout).timed_out()
    }
}

impl<'a, T> Deref for RankedMutexGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<'a, T> DerefMut for RankedMutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<'a, T> Drop for RankedMutexGuard<'a, T> {
    fn drop(&mut self) {
        held::release(self.rank);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordered_acquisition() {
        let central = RankedMutex::new(LockRank::Central, 1);
        let pages = RankedMutex::new(LockRank::PageAlloc, 2);
        let a = central.lock();
        let b = pages.lock();
        assert_eq!(*a + *b, 3);
        drop(b);
        drop(a);

        // Released ranks can be taken again in any order.
        let b = pages.lock();
        drop(b);
        let a = central.lock();
        drop(a);
    }

    #[test]
    fn try_lock_contended() {
        let m = RankedMutex::new(LockRank::History, ());
        let g = m.lock();
        std::thread::scope(|s| {
            s.spawn(|| assert!(m.try_lock().is_none()));
        });
        drop(g);
        assert!(m.try_lock().is_some());
    }
}
