use criterion::{criterion_group, criterion_main, Criterion};
use rowtable::{DedupKey, RowTable};

const N: i64 = 10_000;

fn rowtable_put(c: &mut Criterion) {
    c.bench_function("rowtable_put_10k", |b| {
        b.iter(|| {
            let mut t = RowTable::new();
            for i in 0..N {
                t.put(DedupKey::new(i * 1_000_000, format!("p{}", i % 16)), i as f64, 1);
            }
        });
    });
}

fn rowtable_overwrite(c: &mut Criterion) {
    c.bench_function("rowtable_overwrite_half_10k", |b| {
        b.iter(|| {
            let mut t = RowTable::new();
            for i in 0..N {
                t.put(DedupKey::new(i, "p"), i as f64, 0);
            }
            for i in (0..N).step_by(2) {
                t.put(DedupKey::new(i, "p"), -1.0, 1);
            }
            criterion::black_box(t.len());
        });
    });
}

criterion_group!(benches, rowtable_put, rowtable_overwrite);
criterion_main!(benches);
