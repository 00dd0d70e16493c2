#[macro_use]
extern crate criterion;

use criterion::{black_box, Criterion};

use afs::store::{BlockStore, MemStore};
use afs::{Afs, AfsTime, CaseSensitivity, ObjId};

fn write_one_block(store: &mut MemStore) {
    let mut batch = store.begin_journaled_write().unwrap();
    batch.add_new_block(vec![0x42; store.block_size() as usize]);
    store.complete_journaled_write(batch).unwrap();
}

fn file_write_4k(fs: &mut Afs<MemStore>, id: ObjId, data: &[u8]) {
    fs.file_write(id, 0, data, AfsTime::now()).unwrap();
}

fn criterion_benchmark(c: &mut Criterion) {
    c.bench_function("MemStore single-block journaled write", |b| {
        let mut store = MemStore::new(4096, 1_000_000);
        b.iter(|| write_one_block(black_box(&mut store)));
    });

    c.bench_function("Afs file_write 4KiB (mini-to-tree growth)", |b| {
        let store = MemStore::new(256, 1_000_000);
        let mut fs = Afs::new(store, CaseSensitivity::Insensitive);
        fs.init(b"", AfsTime::now()).unwrap();
        let (_, id) = fs.file_create(ObjId::root(), "bench", b"", AfsTime::now()).unwrap();
        let id = id.unwrap();
        let data = vec![0xabu8; 4096];
        b.iter(|| file_write_4k(black_box(&mut fs), id, black_box(&data)));
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
