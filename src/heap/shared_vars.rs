use std::sync::atomic::{AtomicBool, Ordering};

/// Boolean read on hot paths (write barrier, safepoint polls) and flipped
/// rarely by the collector.
pub struct SharedFlag(AtomicBool);

impl SharedFlag {
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn unset(&self) {
        self.0.store(false, Ordering::Release);
    }

    #[inline(always)]
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn is_unset(&self) -> bool {
        !self.is_set()
    }

    pub fn set_cond(&self, c: bool) {
        if c {
            self.set();
        } else {
            self.unset();
        }
    }

    /// Returns `true` only for the caller that moved the flag to set.
    pub fn try_set(&self) -> bool {
        if self.is_set() {
            return false;
        }

        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    pub fn try_unset(&self) -> bool {
        if self.is_unset() {
            return false;
        }

        self.0
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }
}

impl Default for SharedFlag {
    fn default() -> Self {
        Self::new()
    }
}
