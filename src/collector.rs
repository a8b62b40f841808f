//! A heap together with its service threads.

use std::{io, sync::Arc};

use crate::heap::{
    concurrent_thread::ServiceThread,
    controller::ControlThread,
    finalizer::FinalizerThread,
    heap::Heap,
    mutator::Mutator,
    options::GcOptions,
    scavenger::Scavenger,
    stats::MemStats,
    sweeper::BackgroundSweeper,
};

/// Owns a [`Heap`] and runs the control, sweeper, scavenger and finalizer
/// threads for it. Dropping the collector stops the threads; the heap
/// lives on while mutators hold it.
pub struct Collector {
    heap: Arc<Heap>,
    services: Vec<ServiceThread>,
}

impl Collector {
    pub fn new(options: GcOptions) -> io::Result<Self> {
        let heap = Heap::new(options)?;
        heap.set_controller(true);

        let mut services = Vec::with_capacity(4);
        let started = (|| -> io::Result<()> {
            services.push(ServiceThread::start(Arc::new(ControlThread::new(heap.clone())))?);
            services.push(ServiceThread::start(Arc::new(BackgroundSweeper::new(heap.clone())))?);
            services.push(ServiceThread::start(Arc::new(Scavenger::new(heap.clone())))?);
            services.push(ServiceThread::start(Arc::new(FinalizerThread::new(heap.clone())))?);
            Ok(())
        })();

        let mut collector = Self { heap, services };
        if let Err(err) = started {
            collector.shutdown();
            return Err(err);
        }
        log::debug!(
            target: "gc",
            "collector started: {}",
            collector
                .services
                .iter()
                .map(ServiceThread::name)
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(collector)
    }

    /// Starts a collector configured from the environment.
    pub fn from_env() -> io::Result<Self> {
        Self::new(GcOptions::from_env())
    }

    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    /// Attaches the calling thread.
    pub fn mutator(&self) -> Mutator {
        self.heap.mutator()
    }

    /// Must not be called from a thread with an attached mutator outside
    /// [`Mutator::blocking`]; use [`Mutator::gc`] there.
    pub fn gc(&self) {
        self.heap.gc();
    }

    pub fn free_os_memory(&self) -> usize {
        self.heap.free_os_memory()
    }

    pub fn read_mem_stats(&self) -> MemStats {
        self.heap.read_mem_stats()
    }

    fn shutdown(&mut self) {
        for mut service in self.services.drain(..) {
            service.stop();
        }
        self.heap.set_controller(false);
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        self.shutdown();
    }
}
