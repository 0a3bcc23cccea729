use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use online_infer::atom_table::{AtomState, AtomTable};
use online_infer::model::{AtomKey, Constant};
use online_infer::page_store::{DiskStats, PageWriter, StoreOptions, TermPageStore};
use online_infer::reasoner::{Reasoner, ReasonerOptions};
use online_infer::term::{DcdTerm, ObjectiveTerm, PageTerm, SgdTerm};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tempfile::TempDir;

const ATOMS: u32 = 1000;
const TERMS: u32 = 10_000;

fn write_cache<T: PageTerm>(dir: &TempDir, capacity: usize, make: impl Fn(ObjectiveTerm) -> T) {
    let mut writer = PageWriter::<T>::create(dir.path(), capacity, DiskStats::new()).unwrap();
    for i in 0..TERMS {
        let a = i % ATOMS;
        let b = (i * 7 + 1) % ATOMS;
        writer
            .push(make(ObjectiveTerm::new(1.0, 0.0, false, true, &[(1.0, a), (-1.0, b)])))
            .unwrap();
    }
    writer.finish().unwrap();
}

fn atoms() -> Arc<AtomTable> {
    let mut table = AtomTable::new();
    for i in 0..ATOMS {
        table
            .insert(AtomKey::new(0, vec![Constant::Int(i as i64)]), AtomState::random_variable(0.5))
            .unwrap();
    }
    Arc::new(table)
}

fn bench_epoch_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("epoch_scan");

    for capacity in [100usize, 1000, 10_000] {
        let temp_dir = TempDir::new().unwrap();
        write_cache(&temp_dir, capacity, SgdTerm::new);
        let mut store =
            TermPageStore::<SgdTerm>::open(temp_dir.path(), StoreOptions::default(), DiskStats::new()).unwrap();

        group.bench_with_input(BenchmarkId::new("page_capacity", capacity), &capacity, |b, _| {
            b.iter(|| {
                let mut epoch = store.open_epoch();
                let mut weight = 0.0f32;
                while let Some(term) = epoch.next().unwrap() {
                    weight += term.objective().weight;
                }
                black_box(weight)
            });
        });
    }

    group.finish();
}

fn bench_reasoner_epoch(c: &mut Criterion) {
    let mut group = c.benchmark_group("reasoner_epoch");
    let stop = AtomicBool::new(false);

    let sgd_dir = TempDir::new().unwrap();
    write_cache(&sgd_dir, 1000, SgdTerm::new);
    let store = TermPageStore::<SgdTerm>::open(sgd_dir.path(), StoreOptions::default(), DiskStats::new()).unwrap();
    let mut sgd = Reasoner::new(store, atoms(), ReasonerOptions::default());
    group.bench_function("sgd", |b| b.iter(|| black_box(sgd.run_epoch(&stop).unwrap())));

    let dcd_dir = TempDir::new().unwrap();
    write_cache(&dcd_dir, 1000, DcdTerm::new);
    let store = TermPageStore::<DcdTerm>::open(dcd_dir.path(), StoreOptions::default(), DiskStats::new()).unwrap();
    let mut dcd = Reasoner::new(store, atoms(), ReasonerOptions::default());
    group.bench_function("dcd_with_volatile_writes", |b| b.iter(|| black_box(dcd.run_epoch(&stop).unwrap())));

    group.finish();
}

criterion_group!(benches, bench_epoch_scan, bench_reasoner_epoch);
criterion_main!(benches);
