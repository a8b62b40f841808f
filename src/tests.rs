use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread,
};

use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    heap::{
        heap::{Heap, RootSource},
        heap_bits::PointerLayout,
        mutator::Mutator,
        options::{DebugOptions, GcOptions},
        scavenger::{Scavenger, SCAVENGE_BATCH},
        stats::GcCause,
        sweeper::{finish_sweep, sweep_one},
        Address, GcPhase, PAGE_SIZE,
    },
    Collector, SpecialError,
};

fn options() -> GcOptions {
    GcOptions {
        address_space: 256 * 1024 * 1024,
        procs: 2,
        ..GcOptions::default()
    }
}

fn heap_with(options: GcOptions) -> Arc<Heap> {
    Heap::new(options).unwrap()
}

/// `next` pointer followed by a scalar payload.
fn node_layout() -> PointerLayout {
    PointerLayout::Pattern(vec![true, false].into_boxed_slice())
}

/// Builds a rooted list of `len` nodes whose payloads count down to 1.
/// Returns the root index of the head.
fn build_list(m: &mut Mutator, len: usize) -> usize {
    let layout = node_layout();
    let head = m.push_root(Address::NULL);
    for i in 1..=len {
        let node = m.alloc_with_layout(16, &layout);
        m.write_word(node, 1, i);
        let next = m.root(head);
        m.write_ptr(node, 0, next);
        m.set_root(head, node);
    }
    head
}

fn list_sum(m: &Mutator, mut node: Address) -> (usize, usize) {
    let (mut len, mut sum) = (0, 0);
    while !node.is_null() {
        len += 1;
        sum += m.read_word(node, 1);
        node = m.read_ptr(node, 0);
    }
    (len, sum)
}

fn alloc_garbage(m: &mut Mutator, count: usize, size: usize) {
    for _ in 0..count {
        m.alloc(size, false);
    }
}

#[test]
fn unreachable_objects_are_freed() {
    let heap = heap_with(options());
    let mut m = heap.mutator();
    alloc_garbage(&mut m, 1000, 64);

    let before = m.read_mem_stats();
    assert_eq!(before.heap_objects, 1000);
    assert!(before.spans_in_use > 0);

    m.gc();
    let after = m.read_mem_stats();
    assert_eq!(after.heap_objects, 0);
    assert_eq!(after.spans_in_use, 0);
    assert_eq!(after.frees, 1000);
    assert_eq!(after.num_gc, 1);
}

#[test]
fn reachable_list_survives() {
    let heap = heap_with(options());
    let mut m = heap.mutator();
    let head = build_list(&mut m, 500);
    alloc_garbage(&mut m, 2000, 48);

    for _ in 0..3 {
        m.gc();
        let (len, sum) = list_sum(&m, m.root(head));
        assert_eq!(len, 500);
        assert_eq!(sum, 500 * 501 / 2);
    }
    assert_eq!(m.read_mem_stats().heap_objects, 500);
}

#[test]
fn barrier_shades_pointer_stored_during_marking() {
    let heap = heap_with(options());
    let mut m = heap.mutator();
    let a = m.alloc(16, true);
    m.push_root(a);
    let x = m.alloc(16, true);
    m.push_root(x);
    let b = m.alloc(64, false);
    m.write_ptr(x, 0, b);

    m.blocking(|heap| heap.gc_start());
    assert_eq!(heap.phase(), GcPhase::Marking);
    assert!(heap.barrier_enabled());

    // b is only reachable through x. Move it into a, whose scan may
    // already be done, and cut the old path.
    m.write_ptr(a, 0, b);
    assert!(heap.is_marked(b));
    m.write_ptr(x, 0, Address::NULL);

    m.blocking(|heap| {
        heap.gc_mark_concurrent();
        heap.gc_mark_termination();
        finish_sweep(heap);
    });
    assert_eq!(heap.phase(), GcPhase::Off);
    assert!(!heap.barrier_enabled());
    assert!(heap.is_allocated(b));
    assert_eq!(m.read_ptr(a, 0), b);
    assert_eq!(heap.stats().cycles()[0].cause, GcCause::Stepped);
}

#[test]
fn overwritten_value_is_left_to_the_markers() {
    let heap = heap_with(options());
    let mut m = heap.mutator();
    let a = m.alloc(16, true);
    m.push_root(a);
    let c = m.alloc(64, false);
    m.write_ptr(a, 0, c);

    m.blocking(|heap| heap.gc_start());
    m.write_ptr(a, 0, Address::NULL);
    assert!(!heap.is_marked(c));

    m.blocking(|heap| {
        heap.gc_mark_concurrent();
        heap.gc_mark_termination();
        finish_sweep(heap);
    });
    assert!(!heap.is_allocated(c));
    assert!(heap.is_allocated(a));
}

#[test]
fn objects_allocated_during_marking_survive() {
    let heap = heap_with(options());
    let mut m = heap.mutator();
    m.blocking(|heap| heap.gc_start());
    let fresh = m.alloc(128, false);
    assert!(heap.is_marked(fresh));
    m.blocking(|heap| {
        heap.gc_mark_concurrent();
        heap.gc_mark_termination();
        finish_sweep(heap);
    });
    assert!(heap.is_allocated(fresh));

    // Unrooted, so the next cycle takes it.
    m.gc();
    assert!(!heap.is_allocated(fresh));
}

#[test]
fn repeated_cycles_do_not_leak_spans() {
    let heap = heap_with(options());
    let mut m = heap.mutator();
    for round in 0..10 {
        alloc_garbage(&mut m, 300, 24);
        alloc_garbage(&mut m, 100, 1024);
        alloc_garbage(&mut m, 4, 40 * 1024);
        for size in 1..16 {
            m.alloc(size, false);
        }
        m.gc();
        let stats = m.read_mem_stats();
        assert_eq!(stats.spans_in_use, 0, "round {}", round);
        assert_eq!(stats.heap_inuse, 0, "round {}", round);
        assert_eq!(stats.heap_objects, 0, "round {}", round);
    }
    assert_eq!(heap.stats().num_gc(), 10);
}

#[test]
fn pacing_keeps_live_heap_under_goal() {
    let heap_minimum = 256 * 1024;
    let heap = heap_with(GcOptions {
        heap_minimum,
        ..options()
    });
    let mut m = heap.mutator();
    let window = 256;
    let base = m.roots_len();
    for _ in 0..window {
        m.push_root(Address::NULL);
    }
    for i in 0..40_000 {
        let obj = m.alloc(64, false);
        m.set_root(base + i % window, obj);
    }

    let cycles = heap.stats().cycles();
    assert!(!cycles.is_empty());
    let mut prev_marked = 0;
    for record in &cycles {
        assert_eq!(record.cause, GcCause::HeapTrigger);
        assert!(
            record.heap_live_at_start <= record.goal_at_start + PAGE_SIZE,
            "live {} over goal {}",
            record.heap_live_at_start,
            record.goal_at_start
        );
        assert!(record.goal_at_start <= (2 * prev_marked).max(heap_minimum));
        assert!(record.trigger_at_start <= record.goal_at_start);
        prev_marked = record.heap_marked;
    }
}

#[test]
fn gc_percent_off_disables_triggered_cycles() {
    let heap = heap_with(GcOptions {
        heap_minimum: 128 * 1024,
        gc_percent: -1,
        ..options()
    });
    let mut m = heap.mutator();
    alloc_garbage(&mut m, 20_000, 64);
    assert_eq!(heap.stats().num_gc(), 0);

    heap.set_gc_percent(100);
    m.alloc(64, false);
    assert!(heap.stats().num_gc() > 0);
}

#[test]
fn zero_gc_percent_falls_back_to_default() {
    let heap = heap_with(GcOptions {
        gc_percent: 0,
        ..options()
    });
    assert_eq!(heap.pacer().gc_percent(), 100);
    assert!(heap.pacer().goal() > 0);
    let mut m = heap.mutator();
    alloc_garbage(&mut m, 50, 64);
    assert_eq!(heap.stats().num_gc(), 0);
}

#[test]
fn marking_is_idempotent() {
    let heap = heap_with(options());
    let mut m = heap.mutator();
    build_list(&mut m, 300);
    m.gc();
    m.gc();
    m.gc();
    let cycles = heap.stats().cycles();
    let n = cycles.len();
    assert_eq!(cycles[n - 1].heap_marked, cycles[n - 2].heap_marked);
    assert_eq!(cycles[n - 1].heap_marked, 300 * 16);
}

#[test]
fn finalizer_resurrects_once() {
    let heap = heap_with(options());
    let mut m = heap.mutator();
    let layout = node_layout();
    let obj = m.alloc_with_layout(16, &layout);
    m.push_root(obj);
    let child = m.alloc(32, false);
    m.write_ptr(obj, 0, child);
    m.write_word(obj, 1, 42);

    let seen = Arc::new(AtomicUsize::new(0));
    let seen2 = seen.clone();
    m.set_finalizer(obj, move |m, obj| {
        seen2.store(m.read_word(obj, 1), Ordering::SeqCst);
    })
    .unwrap();
    assert_eq!(
        m.set_finalizer(obj, |_, _| {}),
        Err(SpecialError::AlreadySet(obj))
    );
    assert_eq!(
        m.set_finalizer(obj.add(8), |_, _| {}),
        Err(SpecialError::NotObjectStart(obj.add(8)))
    );

    m.pop_root();
    m.gc();
    // Dead but resurrected for its finalizer, with what it refers to.
    assert!(heap.is_allocated(obj));
    assert!(heap.is_allocated(child));
    assert_eq!(heap.finalizer_queue().len(), 1);
    assert!(heap.specials().is_empty());

    // Queued finalizers keep their object alive.
    m.gc();
    assert!(heap.is_allocated(obj));

    assert_eq!(m.run_finalizers(), 1);
    assert_eq!(seen.load(Ordering::SeqCst), 42);

    m.gc();
    assert!(!heap.is_allocated(obj));
    assert!(!heap.is_allocated(child));
}

#[test]
fn cleared_finalizer_does_not_run() {
    let heap = heap_with(options());
    let mut m = heap.mutator();
    let obj = m.alloc(64, false);
    m.set_finalizer(obj, |_, _| panic!("cleared finalizer ran"))
        .unwrap();
    assert!(m.clear_finalizer(obj));
    assert!(!m.clear_finalizer(obj));
    m.gc();
    assert!(!heap.is_allocated(obj));
    assert_eq!(m.run_finalizers(), 0);
}

#[test]
fn cleanups_run_after_free() {
    let heap = heap_with(options());
    let mut m = heap.mutator();
    let ran = Arc::new(AtomicUsize::new(0));

    let a = m.alloc(64, false);
    let ran2 = ran.clone();
    let _kept = m
        .add_cleanup(a, 7, move |arg| {
            ran2.fetch_add(arg, Ordering::SeqCst);
        })
        .unwrap();

    let b = m.alloc(64, false);
    let stopped = m
        .add_cleanup(b, 100, |_| panic!("stopped cleanup ran"))
        .unwrap();
    assert!(stopped.stop());
    assert!(!stopped.stop());

    assert_eq!(
        m.add_cleanup(a, a.add(8).to_usize(), |_| {}).err(),
        Some(SpecialError::SelfReference(a.add(8)))
    );

    m.gc();
    assert!(!heap.is_allocated(a));
    assert!(!heap.is_allocated(b));
    assert_eq!(m.run_finalizers(), 1);
    assert_eq!(ran.load(Ordering::SeqCst), 7);
}

#[test]
fn cleanup_argument_stays_reachable() {
    let heap = heap_with(options());
    let mut m = heap.mutator();
    let owner = m.alloc(64, false);
    m.push_root(owner);
    let resource = m.alloc(64, false);
    m.add_cleanup(owner, resource.to_usize(), |_| {}).unwrap();

    m.gc();
    assert!(heap.is_allocated(resource));
    m.pop_root();
    m.gc();
    assert!(!heap.is_allocated(owner));
    // Held by the queued cleanup until it runs.
    assert!(heap.is_allocated(resource));
    assert_eq!(m.run_finalizers(), 1);
    m.gc();
    assert!(!heap.is_allocated(resource));
}

fn run_debug_workload(debug: DebugOptions) {
    let heap = heap_with(GcOptions {
        debug,
        heap_minimum: 256 * 1024,
        ..options()
    });
    let mut m = heap.mutator();
    let head = build_list(&mut m, 200);
    for _ in 0..4 {
        alloc_garbage(&mut m, 5000, 64);
        m.gc();
        assert_eq!(list_sum(&m, m.root(head)), (200, 200 * 201 / 2));
    }
    assert_eq!(m.read_mem_stats().heap_objects, 200);
    assert!(heap.stats().num_gc() >= 4);
}

#[test]
fn checkmark_accepts_concurrent_marks() {
    run_debug_workload(DebugOptions {
        gc_checkmark: true,
        ..DebugOptions::default()
    });
}

#[test]
fn stop_the_world_marking() {
    run_debug_workload(DebugOptions {
        gc_stop_the_world: 1,
        gc_checkmark: true,
        ..DebugOptions::default()
    });
}

#[test]
fn stop_the_world_marking_and_sweeping() {
    run_debug_workload(DebugOptions {
        gc_stop_the_world: 2,
        ..DebugOptions::default()
    });
}

#[test]
fn global_roots_keep_objects() {
    let heap = heap_with(options());
    let mut m = heap.mutator();
    let obj = m.alloc(64, false);
    let global = heap.global(obj);
    m.gc();
    assert!(heap.is_allocated(obj));
    assert_eq!(global.get(), obj);

    let other = m.alloc(64, false);
    global.set(other);
    m.gc();
    assert!(!heap.is_allocated(obj));
    assert!(heap.is_allocated(other));

    drop(global);
    m.gc();
    assert!(!heap.is_allocated(other));
}

struct Registry(Mutex<Vec<Address>>);

impl RootSource for Registry {
    fn roots(&self, visit: &mut dyn FnMut(Address)) {
        for &addr in self.0.lock().iter() {
            visit(addr);
        }
    }
}

#[test]
fn root_sources_are_scanned() {
    let heap = heap_with(options());
    let mut m = heap.mutator();
    let obj = m.alloc(48, true);
    let leaf = m.alloc(16, false);
    m.write_ptr(obj, 2, leaf);

    let registry: Arc<dyn RootSource> = Arc::new(Registry(Mutex::new(vec![obj])));
    heap.add_root_source(registry.clone());
    m.gc();
    assert!(heap.is_allocated(obj));
    assert!(heap.is_allocated(leaf));

    assert!(heap.remove_root_source(&registry));
    assert!(!heap.remove_root_source(&registry));
    m.gc();
    assert!(!heap.is_allocated(obj));
    assert!(!heap.is_allocated(leaf));
}

#[test]
fn sweeping_races_mark_termination() {
    let heap = heap_with(options());
    let stop = Arc::new(AtomicBool::new(false));
    let sweeper = {
        let heap = heap.clone();
        let stop = stop.clone();
        thread::spawn(move || {
            let mut swept = 0usize;
            while !stop.load(Ordering::Acquire) {
                match sweep_one(&heap) {
                    Some(_) => swept += 1,
                    None => thread::yield_now(),
                }
            }
            swept
        })
    };

    let mut m = heap.mutator();
    let head = build_list(&mut m, 100);
    let mut rng = StdRng::seed_from_u64(19);
    for _ in 0..400 {
        for _ in 0..32 {
            m.alloc(rng.gen_range(16..=2048), false);
        }
        m.gc();
    }
    stop.store(true, Ordering::Release);
    sweeper.join().unwrap();

    let (len, sum) = list_sum(&m, m.root(head));
    assert_eq!(len, 100);
    assert_eq!(sum, 100 * 101 / 2);
    assert!(heap.stats().num_gc() >= 400);
    m.gc();
    assert_eq!(m.read_mem_stats().heap_objects, 100);
}

#[test]
fn free_os_memory_releases_pages() {
    let heap = heap_with(options());
    let mut m = heap.mutator();
    alloc_garbage(&mut m, 40, 100 * 1024);
    alloc_garbage(&mut m, 4000, 256);

    // Never touched pages already count as released.
    let released_before = heap.pages().heap_released();
    let released = m.blocking(|heap| heap.free_os_memory());
    assert!(released > 0);
    let stats = m.read_mem_stats();
    assert_eq!(stats.heap_inuse, 0);
    assert_eq!(stats.heap_released, (released_before + released) as u64);
    assert!(stats.heap_released <= stats.heap_sys);
    assert!(heap.pages().free_runs().iter().any(|run| run.scavenged_pages > 0));

    // Released pages are handed out again.
    let obj = m.alloc(100 * 1024, true);
    m.write_ptr(obj, 0, obj);
    assert_eq!(m.read_ptr(obj, 0), obj);
}

#[test]
fn scavenger_honours_memory_limit() {
    let heap = heap_with(options());
    let mut m = heap.mutator();
    alloc_garbage(&mut m, 20, 200 * 1024);
    m.gc();

    heap.set_memory_limit(Some(1));
    let scavenger = Scavenger::new(heap.clone());
    assert_eq!(scavenger.retained_goal(), 1);
    let released_before = heap.pages().heap_released();
    let released = scavenger.run_once();
    assert!(released > 0 && released <= SCAVENGE_BATCH);
    assert_eq!(heap.pages().heap_released(), released_before + released);

    // Below the goal only long idle runs go back to the OS.
    heap.set_memory_limit(None);
    assert_eq!(scavenger.run_once(), 0);
}

#[test]
fn random_graph_under_checkmark() {
    let heap = heap_with(GcOptions {
        heap_minimum: 512 * 1024,
        debug: DebugOptions {
            gc_checkmark: true,
            ..DebugOptions::default()
        },
        ..options()
    });
    let mut m = heap.mutator();
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let slots = 64;
    let base = m.roots_len();
    let mut scan = vec![false; slots];
    for _ in 0..slots {
        m.push_root(Address::NULL);
    }

    for step in 0..20_000 {
        let i = rng.gen_range(0..slots);
        if rng.gen_bool(0.6) {
            let has_pointers = rng.gen_bool(0.5);
            let size = rng.gen_range(8..=4096);
            let obj = m.alloc(size, has_pointers);
            m.set_root(base + i, obj);
            scan[i] = has_pointers;
        } else if scan[i] {
            let j = rng.gen_range(0..slots);
            let target = m.root(base + j);
            let obj = m.root(base + i);
            m.write_ptr(obj, 0, target);
        } else {
            m.set_root(base + i, Address::NULL);
        }
        if step % 5000 == 4999 {
            m.gc();
        }
    }
    m.gc();

    for i in 0..slots {
        let obj = m.root(base + i);
        if obj.is_null() {
            continue;
        }
        assert!(heap.is_allocated(obj));
        if scan[i] {
            let child = m.read_ptr(obj, 0);
            assert!(child.is_null() || heap.is_allocated(child));
        }
    }
    assert!(heap.stats().num_gc() >= 4);
}

fn build_tree(m: &mut Mutator, layout: &PointerLayout, depth: usize) -> Address {
    if depth == 0 {
        let leaf = m.alloc_with_layout(24, layout);
        m.write_word(leaf, 2, 1);
        return leaf;
    }
    let base = m.roots_len();
    let left = build_tree(m, layout, depth - 1);
    m.push_root(left);
    let right = build_tree(m, layout, depth - 1);
    m.push_root(right);
    let node = m.alloc_with_layout(24, layout);
    m.write_ptr(node, 0, left);
    m.write_ptr(node, 1, right);
    m.write_word(node, 2, 1);
    m.truncate_roots(base);
    node
}

fn tree_size(m: &Mutator, node: Address) -> usize {
    if node.is_null() {
        return 0;
    }
    m.read_word(node, 2) + tree_size(m, m.read_ptr(node, 0)) + tree_size(m, m.read_ptr(node, 1))
}

#[test]
fn mutators_on_many_threads() {
    let collector = Collector::new(GcOptions {
        heap_minimum: 1024 * 1024,
        procs: 4,
        ..options()
    })
    .unwrap();

    let threads: Vec<_> = (0..4)
        .map(|_| {
            let heap = collector.heap().clone();
            thread::spawn(move || {
                let mut m = heap.mutator();
                let layout = PointerLayout::Pattern(vec![true, true, false].into_boxed_slice());
                let long_lived = build_tree(&mut m, &layout, 10);
                m.push_root(long_lived);
                for _ in 0..40 {
                    let tree = build_tree(&mut m, &layout, 8);
                    assert_eq!(tree_size(&m, tree), 511);
                }
                assert_eq!(tree_size(&m, m.root(0)), 2047);
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    assert!(collector.heap().stats().num_gc() > 0);
    collector.gc();
    let stats = collector.read_mem_stats();
    assert_eq!(stats.heap_objects, 0);
    assert!(stats.num_gc >= 2);
}

#[test]
fn collector_shuts_down_cleanly() {
    let collector = Collector::new(options()).unwrap();
    assert!(collector.heap().has_controller());
    let heap = collector.heap().clone();
    {
        let mut m = collector.mutator();
        alloc_garbage(&mut m, 100, 64);
        m.gc();
    }
    drop(collector);
    assert!(!heap.has_controller());
    assert_eq!(heap.read_mem_stats().heap_objects, 0);
}
