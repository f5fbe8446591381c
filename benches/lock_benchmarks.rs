use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rs_locktable::table::{LockingTable, OptimizedLockingTable, StandardLockingTable};
use rs_locktable::transactions::{IsolationLevel, Transaction, TransactionKind};
use rs_locktable::{Simulation, SimulationConfig, TableConfig, TableVariant};
use std::time::Duration;

fn table_config() -> TableConfig {
    TableConfig::default()
        .with_tuples(1000)
        .with_tasks(10)
        .with_write_cost(Duration::ZERO)
}

fn bench_uncontended_read_lock(c: &mut Criterion) {
    let standard = StandardLockingTable::new(table_config());
    let optimized = OptimizedLockingTable::new(table_config());
    let reader = Transaction::reader(1, TransactionKind::FullScanRead, Vec::new());

    c.bench_function("standard_read_lock_release", |b| {
        b.iter(|| {
            standard.get_read_lock(black_box(7), &reader).unwrap();
            reader.release_read(&standard, 7);
        });
    });

    c.bench_function("optimized_read_lock_release", |b| {
        b.iter(|| {
            optimized.get_read_lock(black_box(7), &reader).unwrap();
            reader.release_read(&optimized, 7);
        });
    });
}

fn bench_write_cycle(c: &mut Criterion) {
    let table = StandardLockingTable::new(table_config());

    c.bench_function("write_lock_update_commit_10_rows", |b| {
        b.iter(|| {
            let writer = Transaction::writer(2, TransactionKind::Write, (0..10).collect());
            for row in 0..10 {
                table.get_write_lock(row, &writer).unwrap();
                writer.record_update(&table, row, black_box(1.0)).unwrap();
            }
            writer.commit_and_release(&table).unwrap();
        });
    });
}

fn bench_full_scan_repeatable_read(c: &mut Criterion) {
    let table = StandardLockingTable::new(table_config().with_isolation_level(IsolationLevel::RepeatableRead));

    c.bench_function("repeatable_read_full_scan_1000_rows", |b| {
        b.iter(|| {
            let reader = Transaction::reader(3, TransactionKind::FullScanRead, Vec::new());
            black_box(reader.execute_read(&table).unwrap());
        });
    });
}

fn bench_small_simulation(c: &mut Criterion) {
    let mut group = c.benchmark_group("simulation");
    group.sample_size(10);

    for variant in [TableVariant::Standard, TableVariant::Optimized] {
        let config = SimulationConfig::default()
            .with_tuples(500)
            .with_tasks(8)
            .with_rows_per_writer(20)
            .with_lock_timeout_ms(20)
            .with_write_cost_ms(0)
            .with_isolation_level(IsolationLevel::ReadCommitted)
            .with_variant(variant);
        let sim = Simulation::new(config).unwrap();
        group.bench_function(variant.to_string(), |b| {
            b.iter(|| sim.run().unwrap());
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_uncontended_read_lock,
    bench_write_cycle,
    bench_full_scan_repeatable_read,
    bench_small_simulation
);
criterion_main!(benches);
