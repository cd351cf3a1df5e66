// SPDX-License-Identifier: Apache-2.0

use cellstm::{run, run_read_only, Cell};
use criterion::{criterion_group, criterion_main, Criterion};

fn single_cell_commit(c: &mut Criterion) {
    let cell = Cell::new(0i64);
    c.bench_function("single cell read-write commit", |b| {
        b.iter(|| {
            run(|| {
                let v = cell.read()?;
                cell.write(v + 1)
            })
            .unwrap();
        });
    });
}

fn read_only_fast_path(c: &mut Criterion) {
    let cell = Cell::new(0i64);
    c.bench_function("read-only transaction", |b| {
        b.iter(|| {
            run_read_only(|| cell.read()).unwrap();
        });
    });
}

fn four_cell_transfer(c: &mut Criterion) {
    let accounts: Vec<Cell<i64>> = (0..4).map(|_| Cell::new(1000)).collect();
    c.bench_function("four cell transfer commit", |b| {
        b.iter(|| {
            run(|| {
                let a = accounts[0].read()?;
                let bal = accounts[1].read()?;
                accounts[0].write(a - 1)?;
                accounts[1].write(bal + 1)
            })
            .unwrap();
        });
    });
}

criterion_group!(benches, single_cell_commit, read_only_fast_path, four_cell_transfer);
criterion_main!(benches);
