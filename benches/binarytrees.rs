use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use spangc::{base::utils::read_uint_from_env, Collector, GcOptions};

mod spangc_ {
    use spangc::{Address, Mutator, PointerLayout};

    pub fn layout() -> PointerLayout {
        PointerLayout::Pattern(vec![true, true, false].into_boxed_slice())
    }

    fn create_tree(m: &mut Mutator, layout: &PointerLayout, depth: usize) -> Address {
        let node = m.alloc_with_layout(24, layout);
        m.write_word(node, 2, depth);
        if depth > 0 {
            let root = m.push_root(node);
            let left = create_tree(m, layout, depth - 1);
            m.write_ptr(m.root(root), 0, left);
            let right = create_tree(m, layout, depth - 1);
            m.write_ptr(m.root(root), 1, right);
            m.truncate_roots(root);
        }
        node
    }

    fn check_tree(m: &Mutator, node: Address) -> usize {
        let left = m.read_ptr(node, 0);
        if left.is_null() {
            return 1;
        }
        check_tree(m, left) + check_tree(m, m.read_ptr(node, 1)) + 1
    }

    pub fn trees(m: &mut Mutator, max_depth: usize) -> usize {
        let layout = layout();
        let long_lived = create_tree(m, &layout, max_depth);
        let root = m.push_root(long_lived);

        let mut check = 0;
        let mut depth = 4;
        while depth <= max_depth {
            let iterations = 1 << (max_depth - depth + 4);
            for _ in 0..iterations {
                let tree = create_tree(m, &layout, depth);
                check += check_tree(m, tree);
            }
            depth += 2;
        }
        check += check_tree(m, m.root(root));
        m.truncate_roots(root);
        check
    }
}

mod rc {
    use std::rc::Rc;

    pub struct TreeNode {
        left: Option<Rc<Self>>,
        right: Option<Rc<Self>>,
    }

    impl TreeNode {
        fn check_tree(&self) -> usize {
            match (self.left.as_ref(), self.right.as_ref()) {
                (Some(left), Some(right)) => left.check_tree() + right.check_tree() + 1,
                _ => 1,
            }
        }
    }

    fn create_tree(depth: usize) -> Rc<TreeNode> {
        if depth > 0 {
            Rc::new(TreeNode {
                left: Some(create_tree(depth - 1)),
                right: Some(create_tree(depth - 1)),
            })
        } else {
            Rc::new(TreeNode {
                left: None,
                right: None,
            })
        }
    }

    pub fn trees(max_depth: usize) -> usize {
        let long_lived = create_tree(max_depth);
        let mut check = 0;
        let mut depth = 4;
        while depth <= max_depth {
            let iterations = 1 << (max_depth - depth + 4);
            for _ in 0..iterations {
                check += create_tree(depth).check_tree();
            }
            depth += 2;
        }
        check + long_lived.check_tree()
    }
}

fn criterion_benchmark(c: &mut Criterion) {
    let max_depth = read_uint_from_env("BINARYTREES_DEPTH").unwrap_or(12);
    let collector = Collector::new(GcOptions::default()).unwrap();
    let mut m = collector.mutator();

    let mut group = c.benchmark_group("binarytrees");
    group.sample_size(10);
    for depth in [max_depth.saturating_sub(2).max(4), max_depth] {
        group.bench_with_input(BenchmarkId::new("spangc", depth), &depth, |b, &depth| {
            b.iter(|| spangc_::trees(&mut m, depth))
        });
        group.bench_with_input(BenchmarkId::new("rc", depth), &depth, |b, &depth| {
            b.iter(|| rc::trees(depth))
        });
    }
    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
