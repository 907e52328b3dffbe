use cellstore::btree::{CellBTreeEngine, EngineKind, IndexDefinition, Key, KeyType};
use cellstore::{Rid, Setting, Storage};
use criterion::{criterion_group, criterion_main, Criterion};
use rand::seq::SliceRandom;
use rand::SeedableRng;

criterion_group!(benches, insert_benchmark, lookup_benchmark);
criterion_main!(benches);

fn keys() -> Vec<String> {
    (0..100000).map(|i| format!("key{i:05}")).collect()
}

pub fn insert_benchmark(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let storage = Storage::open(dir.path(), Setting::default()).unwrap();

    let items = keys();
    let mut rng = rand::rngs::StdRng::seed_from_u64(0);

    for (name, kind) in [
        ("single_value", EngineKind::SingleValue),
        ("multi_value", EngineKind::MultiValue),
    ] {
        let definition = IndexDefinition::new(name, kind, 2, vec![KeyType::String]);
        let index = storage.create_index(&definition).unwrap();
        let mut position = 0i64;

        c.bench_function(&format!("insert_{name}"), |b| {
            b.iter(|| {
                let key = items.choose(&mut rng).unwrap();
                position += 1;
                storage
                    .execute(|op| {
                        index.put(op, Some(&Key::from(key.as_str())), Rid::new(1, position))
                    })
                    .unwrap();
            })
        });
    }

    storage.shutdown().unwrap();
}

pub fn lookup_benchmark(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let storage = Storage::open(dir.path(), Setting::default()).unwrap();

    let items = keys();
    let definition =
        IndexDefinition::new("lookup", EngineKind::SingleValue, 1, vec![KeyType::String]);
    let index = storage.create_index(&definition).unwrap();
    for chunk in items.chunks(1000) {
        storage
            .execute(|op| {
                for key in chunk {
                    index.put(op, Some(&Key::from(key.as_str())), Rid::new(1, 0))?;
                }
                Ok(())
            })
            .unwrap();
    }

    let mut rng = rand::rngs::StdRng::seed_from_u64(0);
    c.bench_function("lookup_single_value", |b| {
        b.iter(|| {
            let key = items.choose(&mut rng).unwrap();
            index.get(Some(&Key::from(key.as_str()))).unwrap()
        })
    });

    storage.shutdown().unwrap();
}
