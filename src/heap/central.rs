//! Per span class broker between thread caches and the page allocator.
//!
//! Spans not owned by a cache sit in one of four lists: partial or full,
//! swept or unswept. Which physical list is "swept" depends on the heap's
//! sweep generation, so advancing the generation by two at mark
//! termination turns every swept list into an unswept one without
//! touching the spans.

use crate::{
    fatal::{throw, Fatal},
    sync::lock_rank::{LockRank, RankedMutex},
};

use super::{
    heap::Heap,
    size_classes::{class_nelems, class_npages, class_size, SpanClass},
    span::{Span, SpanId},
    sweeper::{sweep_span, SweepResult},
};

/// Unswept full spans a cache refill may sweep before giving up and
/// growing the heap instead.
const FULL_SWEEP_BUDGET: usize = 100;

#[derive(Default)]
struct CentralLists {
    partial: [Vec<SpanId>; 2],
    full: [Vec<SpanId>; 2],
}

#[inline]
fn swept(sweepgen: u32) -> usize {
    (sweepgen / 2 % 2) as usize
}

#[inline]
fn unswept(sweepgen: u32) -> usize {
    1 - swept(sweepgen)
}

pub struct SpanCentral {
    spanclass: SpanClass,
    lists: RankedMutex<CentralLists>,
}

/// Span counts of one central, for diagnostics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CentralCounts {
    pub partial_swept: usize,
    pub partial_unswept: usize,
    pub full_swept: usize,
    pub full_unswept: usize,
}

impl CentralCounts {
    pub fn unswept(&self) -> usize {
        self.partial_unswept + self.full_unswept
    }

    pub fn total(&self) -> usize {
        self.partial_swept + self.partial_unswept + self.full_swept + self.full_unswept
    }
}

impl SpanCentral {
    pub fn new(spanclass: SpanClass) -> Self {
        Self {
            spanclass,
            lists: RankedMutex::new(LockRank::Central, CentralLists::default()),
        }
    }

    pub fn spanclass(&self) -> SpanClass {
        self.spanclass
    }

    /// Files a swept span that no cache owns.
    pub(crate) fn push_swept(&self, sweepgen: u32, span: &Span) {
        let mut lists = self.lists.lock();
        if span.is_full() {
            lists.full[swept(sweepgen)].push(span.id());
        } else {
            lists.partial[swept(sweepgen)].push(span.id());
        }
    }

    /// Files a span taken off a list it no longer belongs to, according to
    /// its own generation.
    pub(crate) fn refile(&self, heap: &Heap, span: &Span) {
        let sg = heap.sweepgen();
        let state = span.sweepgen.load(std::sync::atomic::Ordering::Acquire);
        let i = if state == sg {
            swept(sg)
        } else if state == sg.wrapping_sub(2) {
            unswept(sg)
        } else {
            throw(Fatal::SpanCorruption {
                span: span.id().index() as u32,
                detail: "span on a central list is being swept",
            })
        };
        let mut lists = self.lists.lock();
        if span.is_full() {
            lists.full[i].push(span.id());
        } else {
            lists.partial[i].push(span.id());
        }
    }

    /// Takes one span that still needs sweeping, partial ones first.
    pub(crate) fn pop_unswept(&self, sweepgen: u32) -> Option<SpanId> {
        let mut lists = self.lists.lock();
        let i = unswept(sweepgen);
        lists.partial[i].pop().or_else(|| lists.full[i].pop())
    }

    pub fn counts(&self, sweepgen: u32) -> CentralCounts {
        let lists = self.lists.lock();
        CentralCounts {
            partial_swept: lists.partial[swept(sweepgen)].len(),
            partial_unswept: lists.partial[unswept(sweepgen)].len(),
            full_swept: lists.full[swept(sweepgen)].len(),
            full_unswept: lists.full[unswept(sweepgen)].len(),
        }
    }

    /// Hands a span with at least one free slot to a thread cache.
    pub(crate) fn cache_span<'h>(&self, heap: &'h Heap) -> &'h Span {
        let sg = heap.sweepgen();
        let spans = heap.pages().spans();

        if let Some(id) = self.lists.lock().partial[swept(sg)].pop() {
            return spans.get(id);
        }

        {
            let _sweeping = heap.sweeper().begin();
            loop {
                let id = match self.lists.lock().partial[unswept(sg)].pop() {
                    Some(id) => id,
                    None => break,
                };
                let span = spans.get(id);
                sweep_span(heap, span, true);
                if !span.is_full() {
                    return span;
                }
                self.push_swept(sg, span);
            }

            for _ in 0..FULL_SWEEP_BUDGET {
                let id = match self.lists.lock().full[unswept(sg)].pop() {
                    Some(id) => id,
                    None => break,
                };
                let span = spans.get(id);
                sweep_span(heap, span, true);
                if !span.is_full() {
                    return span;
                }
                self.push_swept(sg, span);
            }
        }

        self.grow(heap)
    }

    /// Takes back a span from a thread cache.
    pub(crate) fn uncache_span(&self, heap: &Heap, span: &Span) {
        let sg = heap.sweepgen();
        if span.sweepgen.load(std::sync::atomic::Ordering::Relaxed) != sg {
            throw(Fatal::SpanCorruption {
                span: span.id().index() as u32,
                detail: "cached span has a stale sweep generation",
            });
        }
        self.push_swept(sg, span);
    }

    fn grow<'h>(&self, heap: &'h Heap) -> &'h Span {
        let class = self.spanclass.sizeclass();
        match heap.pages().alloc_span(
            class_npages(class),
            self.spanclass,
            class_size(class),
            class_nelems(class),
            heap.sweepgen(),
        ) {
            Ok(span) => span,
            Err(err) => heap.throw(err),
        }
    }

    /// Files a freshly allocated large span, which is full by definition.
    pub(crate) fn add_large(&self, sweepgen: u32, span: &Span) {
        debug_assert!(self.spanclass.is_large());
        self.lists.lock().full[swept(sweepgen)].push(span.id());
    }

    /// Puts a span swept outside of [`SpanCentral::cache_span`] back where
    /// it belongs.
    pub(crate) fn file_swept(&self, heap: &Heap, span: &Span, result: SweepResult) {
        if !result.span_freed {
            self.push_swept(heap.sweepgen(), span);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_parity_follows_sweepgen() {
        assert_eq!(swept(0), 0);
        assert_eq!(unswept(0), 1);
        assert_eq!(swept(2), 1);
        assert_eq!(unswept(2), 0);
        assert_eq!(swept(4), 0);
    }

    #[test]
    fn counts_add_up() {
        let c = CentralCounts {
            partial_swept: 1,
            partial_unswept: 2,
            full_swept: 3,
            full_unswept: 4,
        };
        assert_eq!(c.unswept(), 6);
        assert_eq!(c.total(), 10);
    }
}
