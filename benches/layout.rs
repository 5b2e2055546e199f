//! Benchmarks for the block layout strategies.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use reforge::{
    binary::{SizeEstimator, SymbolTable},
    cfg::{BinaryFunction, BlockId, BranchInfo, CondCode, ExecCount, Instruction, Operation},
    passes::{ClusterVariant, GreedyObjective, ReorderStrategy},
};

/// Builds a chain of diamonds: entry -> (hot | cold) -> join, repeated.
fn synthetic_function(symbols: &SymbolTable, diamonds: usize) -> BinaryFunction {
    let mut f = BinaryFunction::new("bench", 0x1000);
    let block_count = diamonds * 3 + 1;
    let labels: Vec<_> = (0..block_count)
        .map(|i| symbols.intern(&format!("bench.bb{i}"), None))
        .collect();
    let blocks: Vec<BlockId> = labels.iter().map(|&l| f.add_basic_block(l)).collect();

    f.block_mut(blocks[0]).set_entry_point(true);
    for d in 0..diamonds {
        let head = blocks[d * 3];
        let cold = blocks[d * 3 + 1];
        let hot = blocks[d * 3 + 2];
        let join = blocks[d * 3 + 3];

        let branch = Instruction::with_target(
            Operation::Branch {
                cond: Some(CondCode::Eq),
            },
            labels[d * 3 + 2],
        );
        f.block_mut(head).add_instruction(branch);
        f.block_mut(head).set_execution_count(ExecCount::new(1000));
        f.add_edge(head, hot, BranchInfo::new(900, 30));
        f.add_edge(head, cold, BranchInfo::new(100, 5));

        for (block, label, count) in [(cold, d * 3 + 3, 100), (hot, d * 3 + 3, 900)] {
            let jump = Instruction::with_target(Operation::Branch { cond: None }, labels[label]);
            f.block_mut(block).add_instruction(jump);
            f.block_mut(block).set_execution_count(ExecCount::new(count));
            f.add_edge(block, join, BranchInfo::new(count, 0));
        }
    }
    let last = blocks[block_count - 1];
    f.block_mut(last)
        .add_instruction(Instruction::new(Operation::Return { rep_prefix: false }));
    f.block_mut(last).set_execution_count(ExecCount::new(1000));
    f.set_valid_profile(true);
    f
}

fn bench_layout_strategies(c: &mut Criterion) {
    let symbols = SymbolTable::new();
    let mut group = c.benchmark_group("layout");

    for diamonds in [3usize, 10, 30] {
        let function = synthetic_function(&symbols, diamonds);
        let estimator = SizeEstimator::new(&symbols);

        group.bench_with_input(
            BenchmarkId::new("greedy", diamonds),
            &function,
            |b, function| {
                let strategy = ReorderStrategy::Greedy {
                    variant: ClusterVariant::ProfileGreedy,
                    objective: GreedyObjective::TakenBranches,
                };
                b.iter(|| strategy.compute_order(function, &estimator));
            },
        );
        group.bench_with_input(
            BenchmarkId::new("ext-tsp", diamonds),
            &function,
            |b, function| {
                b.iter(|| ReorderStrategy::ExtTsp.compute_order(function, &estimator));
            },
        );
        if diamonds <= 3 {
            group.bench_with_input(
                BenchmarkId::new("exact-tsp", diamonds),
                &function,
                |b, function| {
                    b.iter(|| ReorderStrategy::ExactTsp.compute_order(function, &estimator));
                },
            );
        }
    }
    group.finish();
}

criterion_group!(benches, bench_layout_strategies);
criterion_main!(benches);
