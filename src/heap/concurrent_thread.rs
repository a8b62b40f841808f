//! Background service threads.

use std::{
    io,
    sync::Arc,
    thread::{self, JoinHandle},
};

use super::shared_vars::SharedFlag;

#[derive(Default)]
pub struct ServiceFlags {
    should_terminate: SharedFlag,
    has_terminated: SharedFlag,
}

/// A collector service running on its own thread until asked to stop.
pub trait ConcurrentGCThread: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn flags(&self) -> &ServiceFlags;

    /// Body of the thread. Must return soon after `should_terminate`
    /// becomes true.
    fn run_service(&self);

    /// Wakes the service up so it can observe the termination request.
    fn stop_service(&self);

    fn should_terminate(&self) -> bool {
        self.flags().should_terminate.is_set()
    }

    fn has_terminated(&self) -> bool {
        self.flags().has_terminated.is_set()
    }
}

/// Owner of a running service. Dropping it stops and joins the thread.
pub struct ServiceThread {
    service: Arc<dyn ConcurrentGCThread>,
    handle: Option<JoinHandle<()>>,
}

impl ServiceThread {
    pub fn start<S: ConcurrentGCThread>(service: Arc<S>) -> io::Result<Self> {
        let thread_service = service.clone();
        let handle = thread::Builder::new()
            .name(service.name().to_string())
            .spawn(move || {
                thread_service.run_service();
                thread_service.flags().has_terminated.set();
            })?;
        Ok(Self {
            service,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &'static str {
        self.service.name()
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.service.flags().should_terminate.set();
            self.service.stop_service();
            if handle.join().is_err() {
                log::error!(target: "gc", "{} thread panicked", self.service.name());
            }
        }
    }
}

impl Drop for ServiceThread {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::{lock_rank::LockRank, monitor::Monitor};
    use std::time::Duration;

    struct Ticker {
        flags: ServiceFlags,
        ticks: Monitor<usize>,
    }

    impl ConcurrentGCThread for Ticker {
        fn name(&self) -> &'static str {
            "ticker"
        }

        fn flags(&self) -> &ServiceFlags {
            &self.flags
        }

        fn run_service(&self) {
            while !self.should_terminate() {
                let mut ticks = self.ticks.lock();
                *ticks += 1;
                ticks.wait_for(Duration::from_millis(50));
            }
        }

        fn stop_service(&self) {
            self.ticks.notify_all();
        }
    }

    #[test]
    fn start_and_stop() {
        let ticker = Arc::new(Ticker {
            flags: ServiceFlags::default(),
            ticks: Monitor::new(LockRank::Service, 0),
        });
        let mut thread = ServiceThread::start(ticker.clone()).unwrap();
        assert_eq!(thread.name(), "ticker");
        while *ticker.ticks.lock() == 0 {
            std::thread::yield_now();
        }
        thread.stop();
        assert!(ticker.has_terminated());
    }
}
