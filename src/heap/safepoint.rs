//! Cooperative stop-the-world.
//!
//! Mutators poll [`Safepoint::is_requested`] at allocation and at explicit
//! safepoints. A stop request waits until no registered mutator is
//! running: each one is either parked at a poll or inside a safe region
//! (blocked outside the heap, see `Mutator::blocking`). A thread asking
//! for a stop must not itself be a running mutator.

use std::time::{Duration, Instant};

use crate::sync::{lock_rank::LockRank, monitor::Monitor};

use super::{shared_vars::SharedFlag, stats::HeapStats};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StwReason {
    GcMarkStart,
    GcMarkTermination,
    /// Whole cycle with the world stopped (`gcstoptheworld` debug mode).
    GcStopTheWorld,
    ReadMemStats,
    /// Sweeping with the world stopped (`gcstoptheworld=2`).
    ForceSweep,
}

struct SafepointState {
    stopped: Option<StwReason>,
    running: usize,
    registered: usize,
}

pub struct Safepoint {
    requested: SharedFlag,
    state: Monitor<SafepointState>,
}

impl Safepoint {
    pub fn new() -> Self {
        Self {
            requested: SharedFlag::new(),
            state: Monitor::new(
                LockRank::Safepoint,
                SafepointState {
                    stopped: None,
                    running: 0,
                    registered: 0,
                },
            ),
        }
    }

    #[inline(always)]
    pub fn is_requested(&self) -> bool {
        self.requested.is_set()
    }

    /// Counts a new mutator as running, waiting out a stop in progress.
    pub(crate) fn register(&self) {
        let mut st = self.state.lock();
        st.wait_while(|st| st.stopped.is_some());
        st.registered += 1;
        st.running += 1;
    }

    pub(crate) fn deregister(&self) {
        let mut st = self.state.lock();
        st.registered -= 1;
        st.running -= 1;
        st.notify_all();
    }

    /// Slow path of a poll: stays parked until the world restarts.
    pub(crate) fn park(&self) {
        let mut st = self.state.lock();
        if st.stopped.is_none() {
            return;
        }
        st.running -= 1;
        st.notify_all();
        st.wait_while(|st| st.stopped.is_some());
        st.running += 1;
    }

    pub(crate) fn enter_safe_region(&self) {
        let mut st = self.state.lock();
        st.running -= 1;
        st.notify_all();
    }

    pub(crate) fn leave_safe_region(&self) {
        let mut st = self.state.lock();
        st.wait_while(|st| st.stopped.is_some());
        st.running += 1;
    }

    pub fn registered(&self) -> usize {
        self.state.lock().registered
    }

    /// Stops every mutator. The world restarts when the guard drops.
    pub fn stop_the_world<'a>(&'a self, reason: StwReason, stats: &'a HeapStats) -> StwGuard<'a> {
        let start = Instant::now();
        let mut st = self.state.lock();
        st.wait_while(|st| st.stopped.is_some());
        st.stopped = Some(reason);
        self.requested.set();
        st.wait_while(|st| st.running > 0);
        drop(st);

        let stopped = Instant::now();
        log::trace!(target: "gc-safepoint", "Safepoint {:?}: reached in {}us", reason, (stopped - start).as_micros());
        StwGuard {
            safepoint: self,
            stats,
            reason,
            start,
        }
    }

    fn start_the_world(&self) {
        let mut st = self.state.lock();
        st.stopped = None;
        self.requested.unset();
        st.notify_all();
    }
}

impl Default for Safepoint {
    fn default() -> Self {
        Self::new()
    }
}

pub struct StwGuard<'a> {
    safepoint: &'a Safepoint,
    stats: &'a HeapStats,
    reason: StwReason,
    start: Instant,
}

impl StwGuard<'_> {
    pub fn reason(&self) -> StwReason {
        self.reason
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for StwGuard<'_> {
    fn drop(&mut self) {
        let pause = self.start.elapsed();
        self.safepoint.start_the_world();
        self.stats.note_pause(pause);
        log::debug!(target: "gc-safepoint", "Safepoint {:?}: total {}ms", self.reason, pause.as_micros() as f64 / 1000.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    };

    #[test]
    fn stops_polling_threads() {
        let _ = env_logger::builder().is_test(true).try_init();
        let sp = Arc::new(Safepoint::new());
        let stats = HeapStats::new();
        let stop = Arc::new(AtomicBool::new(false));
        let counter = Arc::new(AtomicUsize::new(0));

        let handles = (0..4)
            .map(|_| {
                let sp = sp.clone();
                let stop = stop.clone();
                let counter = counter.clone();
                sp.register();
                std::thread::spawn(move || {
                    while !stop.load(Ordering::Acquire) {
                        counter.fetch_add(1, Ordering::Relaxed);
                        if sp.is_requested() {
                            sp.park();
                        }
                    }
                    sp.deregister();
                })
            })
            .collect::<Vec<_>>();

        for _ in 0..10 {
            let guard = sp.stop_the_world(StwReason::ReadMemStats, &stats);
            let before = counter.load(Ordering::Relaxed);
            std::thread::sleep(Duration::from_millis(2));
            // Every mutator is parked, so nobody counts.
            assert_eq!(counter.load(Ordering::Relaxed), before);
            drop(guard);
        }

        stop.store(true, Ordering::Release);
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(sp.registered(), 0);
    }

    #[test]
    fn safe_regions_do_not_block_a_stop() {
        let sp = Safepoint::new();
        let stats = HeapStats::new();
        sp.register();
        sp.enter_safe_region();
        let guard = sp.stop_the_world(StwReason::GcMarkStart, &stats);
        assert_eq!(guard.reason(), StwReason::GcMarkStart);
        drop(guard);
        sp.leave_safe_region();
        sp.deregister();
    }
}
