use cellstore::btree::{CellBTreeEngine, EngineKind, IndexDefinition, IndexEngine, Key, KeyType};
use cellstore::{Rid, Setting, Storage, StorageError};
use rand::rngs::StdRng;
use rand::{thread_rng, Rng, SeedableRng};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::thread::sleep;
use std::time::Duration;

const WORKER_ENV: &str = "CELLSTORE_TEST_WORKER";
const ROUNDS_ENV: &str = "CELLSTORE_CRASH_ROUNDS";
const GROUP_SIZE: i64 = 10;

fn main() {
    let is_worker = std::env::var(WORKER_ENV).unwrap_or_default();
    if is_worker == "1" {
        return worker();
    }
    env_logger::init();

    let dir = tempfile::tempdir().unwrap();
    println!("test started on {:?}", dir.path());

    let myself = std::env::args().next().expect("missing first arg");
    let rounds = std::env::var(ROUNDS_ENV)
        .ok()
        .and_then(|rounds| rounds.parse::<usize>().ok())
        .unwrap_or(5);

    let t = std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64;
    println!("seed {t}");
    let rng = Arc::new(Mutex::new(StdRng::seed_from_u64(t)));

    for round in 0..rounds {
        println!("restarting storage test round={round}");

        let child = Arc::new(Mutex::new(
            Command::new(&myself)
                .arg(dir.path())
                .env(WORKER_ENV, "1")
                .spawn()
                .expect("command failed to start"),
        ));

        std::thread::scope(|s| {
            let (send, recv) = std::sync::mpsc::channel::<()>();

            let handle = {
                let child = child.clone();
                let rng = rng.clone();
                s.spawn(move || {
                    let ms = rng.lock().unwrap().gen_range(500..3 * 1000);
                    let res = recv.recv_timeout(Duration::from_millis(ms));
                    if matches!(res, Err(std::sync::mpsc::RecvTimeoutError::Timeout)) {
                        child.lock().unwrap().kill().expect("cannot kill child");
                    }
                })
            };

            let status = loop {
                let Some(status) = child.lock().unwrap().try_wait().unwrap() else {
                    sleep(Duration::from_millis(100));
                    continue;
                };
                break status;
            };
            drop(send);
            assert_eq!(0, status.code().unwrap_or_default());

            handle.join().unwrap();
        });

        verify(dir.path());
    }
}

fn setting() -> Setting {
    Setting {
        page_size: 0x1000,
        read_cache_pages: 1024,
        max_dirty_pages: 256,
        checkpoint_period: Duration::from_secs(5),
        flush_interval: Duration::from_millis(50),
        ..Setting::default()
    }
}

fn definition() -> IndexDefinition {
    IndexDefinition::new("groups", EngineKind::MultiValue, 2, vec![KeyType::Long])
}

fn open_index(storage: &Storage) -> IndexEngine {
    match storage.load_index(&definition()) {
        Ok(index) => index,
        Err(err)
            if matches!(
                err.downcast_ref::<StorageError>(),
                Some(StorageError::NotFound(_))
            ) =>
        {
            storage.create_index(&definition()).unwrap()
        }
        Err(err) => panic!("cannot load index: {err}"),
    }
}

/// Every committed operation inserted a whole group, so each key holds a multiple of
/// `GROUP_SIZE` rids.
fn verify(path: &Path) {
    let storage = Storage::open(path, setting()).unwrap();
    let index = open_index(&storage);

    let mut total = 0u64;
    let mut current: Option<(Key, i64)> = None;
    let entries = index
        .iterate_entries_major(&Key::from(i64::MIN), true, true)
        .unwrap();
    for entry in entries {
        let (key, _) = entry.unwrap();
        total += 1;
        match &mut current {
            Some((last, count)) if *last == key => *count += 1,
            _ => {
                if let Some((last, count)) = current.take() {
                    assert_eq!(0, count % GROUP_SIZE, "partial group under {last}");
                }
                current = Some((key, 1));
            }
        }
    }
    if let Some((last, count)) = current {
        assert_eq!(0, count % GROUP_SIZE, "partial group under {last}");
    }
    assert_eq!(total, index.size().unwrap());
    println!("verified entries={total}");

    storage.shutdown().unwrap();
}

fn worker() {
    env_logger::init();

    let path = std::env::args().nth(1).unwrap();
    let storage = Arc::new(Storage::open(&PathBuf::from(path), setting()).unwrap());
    let index = Arc::new(open_index(&storage));

    let mut handles = vec![];
    for t in 0..8i16 {
        let storage = storage.clone();
        let index = index.clone();
        handles.push(std::thread::spawn(move || {
            let mut rng = thread_rng();
            // rids must stay unique across worker restarts
            let mut sequence = std::time::SystemTime::now()
                .duration_since(std::time::SystemTime::UNIX_EPOCH)
                .unwrap()
                .as_nanos() as i64;
            loop {
                let group = rng.gen_range(0..1_000_000i64);
                let commit = rng.gen_bool(0.5);
                let result = storage.execute(|op| {
                    for _ in 0..GROUP_SIZE {
                        sequence += 1;
                        index.put(op, Some(&Key::from(group)), Rid::new(t, sequence))?;
                    }
                    if commit {
                        Ok(())
                    } else {
                        Err(anyhow::anyhow!("rollback requested"))
                    }
                });
                assert_eq!(commit, result.is_ok(), "{result:?}");
            }
        }));
    }

    for handle in handles {
        handle.join().unwrap();
    }
}
