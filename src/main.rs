use spangc::{
    base::utils::read_uint_from_env, formatted_size, Address, Collector, Mutator, PointerLayout,
};

const LEFT: usize = 0;
const RIGHT: usize = 1;
const ITEM: usize = 2;

fn node_layout() -> PointerLayout {
    PointerLayout::Pattern(vec![true, true, false].into_boxed_slice())
}

fn bottom_up_tree(m: &mut Mutator, layout: &PointerLayout, depth: usize) -> Address {
    if depth == 0 {
        return m.alloc_with_layout(24, layout);
    }

    let roots = m.roots_len();
    let left = bottom_up_tree(m, layout, depth - 1);
    m.push_root(left);
    let right = bottom_up_tree(m, layout, depth - 1);
    m.push_root(right);

    let node = m.alloc_with_layout(24, layout);
    m.write_ptr(node, LEFT, left);
    m.write_ptr(node, RIGHT, right);
    m.write_word(node, ITEM, depth);
    m.truncate_roots(roots);
    node
}

fn check_tree(m: &Mutator, node: Address) -> usize {
    let left = m.read_ptr(node, LEFT);
    if left.is_null() {
        return 1;
    }
    check_tree(m, left) + check_tree(m, m.read_ptr(node, RIGHT)) + 1
}

fn main() {
    env_logger::init();

    let max_depth = read_uint_from_env("BINARYTREES_DEPTH").unwrap_or(16).max(6);
    let collector = match Collector::from_env() {
        Ok(collector) => collector,
        Err(err) => {
            eprintln!("failed to start the collector: {}", err);
            std::process::exit(1);
        }
    };
    let mut m = collector.mutator();
    let layout = node_layout();
    let start = std::time::Instant::now();

    let stretch = bottom_up_tree(&mut m, &layout, max_depth + 1);
    println!(
        "stretch tree of depth {}\t check: {}",
        max_depth + 1,
        check_tree(&m, stretch)
    );

    let long_lived = bottom_up_tree(&mut m, &layout, max_depth);
    let long_lived_root = m.push_root(long_lived);

    let mut depth = 4;
    while depth <= max_depth {
        let iterations = 1 << (max_depth - depth + 4);
        let mut check = 0;
        for _ in 0..iterations {
            let tree = bottom_up_tree(&mut m, &layout, depth);
            check += check_tree(&m, tree);
        }
        println!("{}\t trees of depth {}\t check: {}", iterations, depth, check);
        depth += 2;
    }

    println!(
        "long lived tree of depth {}\t check: {}",
        max_depth,
        check_tree(&m, m.root(long_lived_root))
    );
    println!(
        "binary trees took: {} secs",
        start.elapsed().as_micros() as f64 / 1000.0 / 1000.0
    );

    let stats = m.read_mem_stats();
    println!("{}", stats);
    println!(
        "{} cycles, average pause {:.3}ms, heap in use {}",
        stats.num_gc,
        collector.heap().stats().average_pause_ms(),
        formatted_size(stats.heap_inuse as usize)
    );
}
