use std::{
    ops::{Deref, DerefMut},
    time::Duration,
};

use parking_lot::Condvar;

use super::lock_rank::{LockRank, RankedMutex, RankedMutexGuard};

/// Ranked mutex paired with a condition variable.
pub struct Monitor<T> {
    mutex: RankedMutex<T>,
    cv: Condvar,
}

impl<T> Monitor<T> {
    pub const fn new(rank: LockRank, val: T) -> Self {
        Self {
            mutex: RankedMutex::new(rank, val),
            cv: Condvar::new(),
        }
    }

    pub fn lock(&self) -> MonitorLocker<'_, T> {
        MonitorLocker {
            guard: self.mutex.lock(),
            cv: &self.cv,
        }
    }

    pub fn notify_all(&self) -> usize {
        self.cv.notify_all()
    }

    pub fn notify_one(&self) -> bool {
        self.cv.notify_one()
    }
}

pub struct MonitorLocker<'a, T> {
    cv: &'a Condvar,
    guard: RankedMutexGuard<'a, T>,
}

impl<'a, T> MonitorLocker<'a, T> {
    pub fn wait(&mut self) {
        self.guard.wait(self.cv);
    }

    /// Returns `true` when the timeout elapsed.
    pub fn wait_for(&mut self, timeout: Duration) -> bool {
        self.guard.wait_for(self.cv, timeout)
    }

    pub fn wait_while(&mut self, mut condition: impl FnMut(&mut T) -> bool) {
        while condition(&mut *self.guard) {
            self.guard.wait(self.cv);
        }
    }

    pub fn notify_all(&self) -> usize {
        self.cv.notify_all()
    }
}

impl<'a, T> Deref for MonitorLocker<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<'a, T> DerefMut for MonitorLocker<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn wait_and_notify() {
        let monitor = Arc::new(Monitor::new(LockRank::Service, false));
        let m2 = monitor.clone();
        let t = std::thread::spawn(move || {
            let mut ml = m2.lock();
            ml.wait_while(|ready| !*ready);
            true
        });

        {
            let mut ml = monitor.lock();
            *ml = true;
            ml.notify_all();
        }
        assert!(t.join().unwrap());
    }

    #[test]
    fn wait_for_times_out() {
        let monitor = Monitor::new(LockRank::Service, ());
        let mut ml = monitor.lock();
        assert!(ml.wait_for(Duration::from_millis(1)));
    }
}
