//! Background return of free pages to the OS.
//!
//! The scavenger keeps the retained heap (committed minus released) near
//! a little above the heap goal, and never above the memory limit. Below
//! that target it still releases runs that have sat idle for
//! `scavenge_idle`. It works in small batches and sleeps in between so
//! that it uses no more than `scavenge_cpu_fraction` of one CPU.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use crate::{
    base::formatted_size,
    sync::{lock_rank::LockRank, monitor::Monitor},
    utils::number_seq::TruncatedSeq,
};

use super::{
    concurrent_thread::{ConcurrentGCThread, ServiceFlags},
    heap::Heap,
};

/// Bytes released per batch.
pub const SCAVENGE_BATCH: usize = 64 * 1024;
/// Headroom kept above the heap goal.
const RETAINED_GOAL_FACTOR: f64 = 1.1;
const IDLE_WAIT: Duration = Duration::from_millis(1000);
const MAX_SLEEP: Duration = Duration::from_millis(100);

pub struct Scavenger {
    heap: Arc<Heap>,
    flags: ServiceFlags,
    /// Recent batch times in seconds.
    batch_times: Monitor<TruncatedSeq>,
}

impl Scavenger {
    pub fn new(heap: Arc<Heap>) -> Self {
        Self {
            heap,
            flags: ServiceFlags::default(),
            batch_times: Monitor::new(LockRank::Service, TruncatedSeq::new(16, 0.3)),
        }
    }

    /// Retained bytes the scavenger steers towards.
    pub fn retained_goal(&self) -> usize {
        retained_goal(self.heap.pacer().goal(), self.heap.pacer().memory_limit())
    }

    /// Releases one batch. Returns the bytes released.
    pub fn run_once(&self) -> usize {
        let pages = self.heap.pages();
        let min_idle = if pages.retained() > self.retained_goal() {
            None
        } else {
            Some(self.heap.options().scavenge_idle)
        };

        let start = Instant::now();
        let released = match pages.scavenge(SCAVENGE_BATCH, min_idle) {
            Ok(released) => released,
            Err(err) => self.heap.throw(err),
        };
        if released > 0 {
            self.batch_times.lock().add(start.elapsed().as_secs_f64());
        }
        released
    }

    /// Pause after a batch that keeps the CPU share below the configured
    /// fraction.
    fn pause(&self) -> Duration {
        let fraction = self.heap.options().scavenge_cpu_fraction.clamp(0.0001, 1.0);
        let batch = self.batch_times.lock().davg();
        Duration::from_secs_f64(batch * (1.0 / fraction - 1.0)).min(MAX_SLEEP)
    }
}

pub(crate) fn retained_goal(heap_goal: usize, memory_limit: Option<usize>) -> usize {
    let goal = (heap_goal as f64 * RETAINED_GOAL_FACTOR) as usize;
    match memory_limit {
        Some(limit) => goal.min(limit),
        None => goal,
    }
}

impl ConcurrentGCThread for Scavenger {
    fn name(&self) -> &'static str {
        "gc-scavenger"
    }

    fn flags(&self) -> &ServiceFlags {
        &self.flags
    }

    fn run_service(&self) {
        while !self.should_terminate() {
            self.heap.scavenger_wait(IDLE_WAIT);

            let mut total = 0;
            while !self.should_terminate() {
                let released = self.run_once();
                if released == 0 {
                    break;
                }
                total += released;
                let pause = self.pause();
                if !pause.is_zero() {
                    self.heap.scavenger_wait(pause);
                }
            }
            if total > 0 {
                log::debug!(
                    target: "gc-scavenger",
                    "released {}, retained {} (goal {})",
                    formatted_size(total),
                    formatted_size(self.heap.pages().retained()),
                    formatted_size(self.retained_goal())
                );
            }
        }
    }

    fn stop_service(&self) {
        self.heap.scavenger_wakeup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn goal_is_capped_by_the_limit() {
        assert_eq!(retained_goal(1000, None), 1100);
        assert_eq!(retained_goal(1000, Some(1050)), 1050);
        assert_eq!(retained_goal(0, Some(64)), 0);
    }
}
