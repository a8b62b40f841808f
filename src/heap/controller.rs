use std::{sync::Arc, time::Duration};

use super::{
    concurrent_thread::{ConcurrentGCThread, ServiceFlags},
    heap::Heap,
    stats::GcCause,
};

/// How often the control thread looks at the trigger without being asked.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Runs heap triggered cycles off the mutator threads. Mutators crossing
/// the trigger only post a request; the cycle itself, including its
/// background marking, runs here.
pub struct ControlThread {
    heap: Arc<Heap>,
    flags: ServiceFlags,
}

impl ControlThread {
    pub fn new(heap: Arc<Heap>) -> Self {
        Self {
            heap,
            flags: ServiceFlags::default(),
        }
    }
}

impl ConcurrentGCThread for ControlThread {
    fn name(&self) -> &'static str {
        "gc-control"
    }

    fn flags(&self) -> &ServiceFlags {
        &self.flags
    }

    fn run_service(&self) {
        self.heap.set_controller(true);
        while !self.should_terminate() {
            let (requested, forced) = self.heap.take_gc_request(POLL_INTERVAL);
            if self.should_terminate() {
                break;
            }

            if forced {
                log::debug!(target: "gc", "Control thread: cycle requested by a pacing mutator");
                self.heap.collect(GcCause::HeapTrigger);
            } else if requested || self.heap.pacer().should_start_cycle() {
                self.heap.collect_triggered();
            }
        }
        self.heap.set_controller(false);
        log::debug!(target: "gc", "Control thread stopped after {} cycle(s)", self.heap.stats().num_gc());
    }

    fn stop_service(&self) {
        self.heap.wake_controller();
    }
}
