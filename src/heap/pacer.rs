//! Collection pacing.
//!
//! The pacer decides when a cycle starts and how much mark work
//! allocating mutators owe while one runs. The heap goal of the next cycle
//! is the live heap marked by the last one grown by `gc_percent`; the
//! trigger sits somewhere between the two, moved after every cycle by a
//! feedback controller so that marking tends to finish right at the goal
//! while using its CPU share.
//!
//! During a cycle, assists are tax-and-spend: background workers earn scan
//! credit, allocating mutators spend it, and when there is none left they
//! do the marking themselves.

use std::{
    sync::atomic::{AtomicI32, AtomicIsize, AtomicU64, AtomicUsize},
    time::{Duration, Instant},
};

use atomic::{Atomic, Ordering};

use crate::{
    base::formatted_size,
    sync::{
        lock_rank::{LockRank, RankedMutex},
        monitor::Monitor,
    },
};

use super::{
    options::{GcOptions, DEFAULT_GC_PERCENT},
    shared_vars::SharedFlag,
};

/// CPU share of marking the trigger controller aims for (background
/// workers plus assists).
const GOAL_UTILIZATION: f64 = 0.30;
const MIN_TRIGGER_FRACTION: f64 = 0.6;
const MAX_TRIGGER_FRACTION: f64 = 0.95;
const INITIAL_TRIGGER_FRACTION: f64 = 7.0 / 8.0;
/// Memory limit share available to the heap.
const MEMORY_LIMIT_HEAP_SHARE: f64 = 0.95;
/// Heap room always left above the marked heap under a memory limit.
const MEMORY_LIMIT_MIN_RUNWAY: usize = 1024 * 1024;
/// Scan work assumed for the very first cycle.
const INITIAL_SCAN_WORK: usize = 64 * 1024;

/// Unlimited goal or trigger.
pub const NO_LIMIT: usize = usize::MAX;

/// A zero growth percentage would put the goal at zero.
fn sanitize_gc_percent(pct: i32) -> i32 {
    if pct == 0 {
        log::warn!(
            target: "gc-pacer",
            "gc percent 0 is not supported, using {}",
            DEFAULT_GC_PERCENT
        );
        DEFAULT_GC_PERCENT
    } else {
        pct
    }
}

struct CycleState {
    start: Instant,
    heap_live_at_start: usize,
    goal_at_start: usize,
    trigger_at_start: usize,
}

/// Pacing numbers of a cycle as seen when it started.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CycleStart {
    pub heap_live: usize,
    pub goal: usize,
    pub trigger: usize,
}

/// Pacing numbers decided when a cycle ends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CycleEnd {
    pub heap_marked: usize,
    pub next_goal: usize,
    pub next_trigger: usize,
}

pub struct Pacer {
    gc_percent: AtomicI32,
    /// `NO_LIMIT` when unset.
    memory_limit: AtomicUsize,
    heap_minimum: usize,
    procs: usize,

    heap_live: AtomicUsize,
    heap_marked: AtomicUsize,
    last_scan_work: AtomicUsize,
    goal: AtomicUsize,
    trigger: AtomicUsize,
    trigger_fraction: Atomic<f64>,

    bytes_marked: AtomicUsize,
    scan_work: AtomicUsize,
    bg_scan_credit: AtomicIsize,
    mark_time_ns: AtomicU64,
    assist_time_ns: AtomicU64,
    cycle: RankedMutex<Option<CycleState>>,

    credit_monitor: Monitor<()>,
    need_notify_waiters: SharedFlag,
}

impl Pacer {
    pub fn new(options: &GcOptions) -> Self {
        let pacer = Self {
            gc_percent: AtomicI32::new(sanitize_gc_percent(options.gc_percent)),
            memory_limit: AtomicUsize::new(options.memory_limit.unwrap_or(NO_LIMIT)),
            heap_minimum: options.heap_minimum,
            procs: options.procs.max(1),
            heap_live: AtomicUsize::new(0),
            heap_marked: AtomicUsize::new(0),
            last_scan_work: AtomicUsize::new(INITIAL_SCAN_WORK),
            goal: AtomicUsize::new(NO_LIMIT),
            trigger: AtomicUsize::new(NO_LIMIT),
            trigger_fraction: Atomic::new(INITIAL_TRIGGER_FRACTION),
            bytes_marked: AtomicUsize::new(0),
            scan_work: AtomicUsize::new(0),
            bg_scan_credit: AtomicIsize::new(0),
            mark_time_ns: AtomicU64::new(0),
            assist_time_ns: AtomicU64::new(0),
            cycle: RankedMutex::new(LockRank::Pacer, None),
            credit_monitor: Monitor::new(LockRank::Pacer, ()),
            need_notify_waiters: SharedFlag::new(),
        };
        pacer.commit();
        pacer
    }

    pub fn gc_percent(&self) -> i32 {
        self.gc_percent.load(Ordering::Relaxed)
    }

    /// Sets the growth percentage and returns the previous one. Zero is
    /// treated as the default of 100, a negative value disables heap
    /// triggered collection.
    pub fn set_gc_percent(&self, pct: i32) -> i32 {
        let old = self
            .gc_percent
            .swap(sanitize_gc_percent(pct), Ordering::Relaxed);
        self.commit();
        old
    }

    pub fn memory_limit(&self) -> Option<usize> {
        match self.memory_limit.load(Ordering::Relaxed) {
            NO_LIMIT => None,
            limit => Some(limit),
        }
    }

    pub fn set_memory_limit(&self, limit: Option<usize>) -> Option<usize> {
        let old = self
            .memory_limit
            .swap(limit.unwrap_or(NO_LIMIT), Ordering::Relaxed);
        self.commit();
        match old {
            NO_LIMIT => None,
            old => Some(old),
        }
    }

    #[inline]
    pub fn heap_live(&self) -> usize {
        self.heap_live.load(Ordering::Relaxed)
    }

    pub fn heap_marked(&self) -> usize {
        self.heap_marked.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn goal(&self) -> usize {
        self.goal.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn trigger(&self) -> usize {
        self.trigger.load(Ordering::Relaxed)
    }

    pub fn trigger_fraction(&self) -> f64 {
        self.trigger_fraction.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn add_live(&self, bytes: usize) {
        self.heap_live.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn sub_live(&self, bytes: usize) {
        let mut live = self.heap_live.load(Ordering::Relaxed);
        loop {
            match self.heap_live.compare_exchange_weak(
                live,
                live.saturating_sub(bytes),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(cur) => live = cur,
            }
        }
    }

    /// Whether adding `bytes` to the live heap would cross the goal.
    /// Mutators check this before growing their cache while no cycle runs,
    /// so concurrent refills may overshoot by at most a span each.
    pub(crate) fn would_exceed_goal(&self, bytes: usize) -> bool {
        let goal = self.goal();
        goal != NO_LIMIT && self.heap_live().saturating_add(bytes) > goal
    }

    pub fn should_start_cycle(&self) -> bool {
        let trigger = self.trigger();
        trigger != NO_LIMIT && self.heap_live() >= trigger
    }

    /// Recomputes goal and trigger from the last marked heap.
    fn commit(&self) {
        let marked = self.heap_marked();
        let pct = self.gc_percent();
        let limit = self.memory_limit.load(Ordering::Relaxed);

        let mut goal = if pct < 0 {
            NO_LIMIT
        } else {
            let growth = (marked as f64 * (1.0 + pct as f64 / 100.0)) as usize;
            let heap_min = (self.heap_minimum as f64 * pct as f64 / 100.0) as usize;
            growth.max(heap_min)
        };
        if limit != NO_LIMIT {
            let limited = ((limit as f64 * MEMORY_LIMIT_HEAP_SHARE) as usize)
                .max(marked + MEMORY_LIMIT_MIN_RUNWAY);
            goal = goal.min(limited);
        }

        let trigger = if goal == NO_LIMIT {
            NO_LIMIT
        } else {
            let runway = goal.saturating_sub(marked);
            marked + (runway as f64 * self.trigger_fraction()) as usize
        };

        self.goal.store(goal, Ordering::Relaxed);
        self.trigger.store(trigger, Ordering::Relaxed);
    }

    /// Resets the per cycle counters at mark start.
    pub(crate) fn start_cycle(&self) -> CycleStart {
        self.bytes_marked.store(0, Ordering::Relaxed);
        self.scan_work.store(0, Ordering::Relaxed);
        self.bg_scan_credit.store(0, Ordering::Relaxed);
        self.mark_time_ns.store(0, Ordering::Relaxed);
        self.assist_time_ns.store(0, Ordering::Relaxed);

        let start = CycleStart {
            heap_live: self.heap_live(),
            goal: self.goal(),
            trigger: self.trigger(),
        };
        *self.cycle.lock() = Some(CycleState {
            start: Instant::now(),
            heap_live_at_start: start.heap_live,
            goal_at_start: start.goal,
            trigger_at_start: start.trigger,
        });
        log::debug!(
            target: "gc-pacer",
            "cycle start: live {}, goal {}, trigger {}, expected scan work {}",
            formatted_size(start.heap_live),
            formatted_size(start.goal),
            formatted_size(start.trigger),
            formatted_size(self.last_scan_work.load(Ordering::Relaxed))
        );
        start
    }

    /// Feeds the cycle that just finished marking back into the trigger,
    /// and sets the next goal. Called at mark termination.
    pub(crate) fn end_cycle(&self) -> CycleEnd {
        let marked = self.bytes_marked.load(Ordering::Relaxed);
        let scanned = self.scan_work.load(Ordering::Relaxed);
        let live = self.heap_live();
        let last_marked = self.heap_marked();

        if let Some(cycle) = self.cycle.lock().take() {
            let pct = self.gc_percent();
            if pct > 0 && last_marked > 0 && cycle.goal_at_start != NO_LIMIT {
                let goal_ratio = pct as f64 / 100.0;
                let trigger_ratio = cycle.trigger_at_start.saturating_sub(last_marked) as f64
                    / last_marked as f64;
                let actual_ratio = live as f64 / last_marked as f64 - 1.0;

                let wall = cycle.start.elapsed().as_nanos() as f64 * self.procs as f64;
                let busy = (self.mark_time_ns.load(Ordering::Relaxed)
                    + self.assist_time_ns.load(Ordering::Relaxed)) as f64;
                let utilization = if wall > 0.0 { busy / wall } else { GOAL_UTILIZATION };

                let fraction = next_trigger_fraction(
                    goal_ratio,
                    trigger_ratio,
                    actual_ratio,
                    utilization,
                );
                self.trigger_fraction.store(fraction, Ordering::Relaxed);
                log::debug!(
                    target: "gc-pacer",
                    "feedback: live at start {}, growth {:.3} of {:.3}, utilization {:.3}, trigger fraction {:.3}",
                    formatted_size(cycle.heap_live_at_start),
                    actual_ratio,
                    goal_ratio,
                    utilization,
                    fraction
                );
            }
        }

        self.heap_marked.store(marked, Ordering::Relaxed);
        self.heap_live.store(marked, Ordering::Relaxed);
        self.last_scan_work
            .store(scanned.max(INITIAL_SCAN_WORK), Ordering::Relaxed);
        self.commit();
        self.notify_waiters();

        CycleEnd {
            heap_marked: marked,
            next_goal: self.goal(),
            next_trigger: self.trigger(),
        }
    }

    pub(crate) fn note_mark_work(&self, bytes_marked: usize, scan_work: usize) {
        if bytes_marked != 0 {
            self.bytes_marked.fetch_add(bytes_marked, Ordering::Relaxed);
        }
        if scan_work != 0 {
            self.scan_work.fetch_add(scan_work, Ordering::Relaxed);
        }
    }

    pub fn bytes_marked(&self) -> usize {
        self.bytes_marked.load(Ordering::Relaxed)
    }

    pub(crate) fn note_mark_time(&self, time: Duration) {
        self.mark_time_ns
            .fetch_add(time.as_nanos() as u64, Ordering::Relaxed);
    }

    pub(crate) fn note_assist_time(&self, time: Duration) {
        self.assist_time_ns
            .fetch_add(time.as_nanos() as u64, Ordering::Relaxed);
    }

    /// CPU time spent marking in the current or last cycle, background
    /// workers and assists together.
    pub fn mark_cpu_time(&self) -> Duration {
        Duration::from_nanos(
            self.mark_time_ns.load(Ordering::Relaxed) + self.assist_time_ns.load(Ordering::Relaxed),
        )
    }

    /// Scan work owed per allocated byte in the current cycle.
    pub fn assist_work_per_byte(&self) -> f64 {
        let mut expected = self.last_scan_work.load(Ordering::Relaxed);
        let mut goal = self.goal();
        let done = self.scan_work.load(Ordering::Relaxed);
        if done >= expected {
            // More work than estimated: the whole live heap may need
            // scanning, against a goal with some headroom.
            expected = self.heap_live().max(done + INITIAL_SCAN_WORK);
            goal = goal.saturating_add(goal / 10);
        }
        let remaining_work = expected.saturating_sub(done).max(1);
        let remaining_heap = goal.saturating_sub(self.heap_live()).max(1);
        remaining_work as f64 / remaining_heap as f64
    }

    /// Converts allocation of `bytes` during a cycle into mark work owed.
    pub fn assist_credit(&self, bytes: usize) -> usize {
        (bytes as f64 * self.assist_work_per_byte()).ceil() as usize
    }

    /// Converts scan work into allocation bytes it pays for.
    pub fn bytes_for_work(&self, work: usize) -> usize {
        let per_byte = self.assist_work_per_byte();
        if per_byte <= 0.0 {
            return usize::MAX;
        }
        (work as f64 / per_byte) as usize
    }

    /// Background workers bank the work they do for assists to steal.
    pub(crate) fn add_background_credit(&self, work: usize) {
        self.bg_scan_credit
            .fetch_add(work as isize, Ordering::Relaxed);
        self.notify_waiters();
    }

    /// Takes up to `work` units of banked credit.
    pub(crate) fn steal_background_credit(&self, work: usize) -> usize {
        let mut credit = self.bg_scan_credit.load(Ordering::Relaxed);
        loop {
            if credit <= 0 {
                return 0;
            }
            let take = (credit as usize).min(work);
            match self.bg_scan_credit.compare_exchange_weak(
                credit,
                credit - take as isize,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return take,
                Err(cur) => credit = cur,
            }
        }
    }

    pub(crate) fn notify_waiters(&self) {
        if self.need_notify_waiters.try_unset() {
            self.credit_monitor.notify_all();
        }
    }

    /// Waits a little for background credit to show up.
    pub(crate) fn wait_for_credit(&self, time: Duration) {
        let mut locker = self.credit_monitor.lock();
        self.need_notify_waiters.set();
        locker.wait_for(time);
    }
}

/// One step of the trigger controller:
/// `e = h_g - h_T - (u_a / u_g)(h_a - h_T)`, `h_T += 0.5 e`,
/// returned as a fraction of the goal ratio.
fn next_trigger_fraction(goal_ratio: f64, trigger_ratio: f64, actual_ratio: f64, utilization: f64) -> f64 {
    let error = goal_ratio
        - trigger_ratio
        - utilization / GOAL_UTILIZATION * (actual_ratio - trigger_ratio);
    let next = trigger_ratio + 0.5 * error;
    (next / goal_ratio).clamp(MIN_TRIGGER_FRACTION, MAX_TRIGGER_FRACTION)
}
