use crate::atomic::{AtomicOperation, AtomicOperationsManager, ComponentLocks};
use crate::btree::{create_engine, load_engine, IndexDefinition, IndexEngine, TreeContext};
use crate::buffer_pool::ByteBufferPool;
use crate::cache::{FileWriteCache, LruReadCache, PageCachePolicy, ReadCache, WriteCache};
use crate::co::ClusterStorage;
use crate::file_lock::FileLock;
use crate::id::Lsn;
use crate::page::{check_page_size, DEFAULT_PAGE_SIZE};
use crate::recovery::recover;
use crate::wal::{DiskWal, MemoryWal, WalFlushPolicy, WriteAheadLog};
use anyhow::anyhow;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const LOCK_FILE: &str = "lock";
const WAL_NAME: &str = "wal";

pub struct Setting {
    pub page_size: usize,
    /// Pages kept by the shared read cache.
    pub read_cache_pages: usize,
    /// Dirty pages above which a commit flushes the write cache.
    pub max_dirty_pages: usize,
    /// Page buffers kept for reuse once released.
    pub buffer_pool_limit: usize,
    /// Page buffers alive at once, unbounded when `None`. Waiting for a buffer is bounded by
    /// `lock_timeout`.
    pub buffer_memory_limit: Option<usize>,
    pub page_cache_policy: PageCachePolicy,
    pub wal_flush_policy: WalFlushPolicy,
    pub wal_segment_size: u64,
    /// When false the log lives in memory and nothing survives a crash.
    pub durable: bool,
    pub checkpoint_period: Duration,
    pub flush_interval: Duration,
    pub low_disk_space_threshold: u64,
    pub lock_timeout: Duration,
}

impl std::default::Default for Setting {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            read_cache_pages: 4096,
            max_dirty_pages: 16384,
            buffer_pool_limit: 1024,
            buffer_memory_limit: None,
            page_cache_policy: PageCachePolicy::Lru { hot: 16, cold: 16 },
            wal_flush_policy: WalFlushPolicy::Sync,
            wal_segment_size: 64 << 20,
            durable: true,
            checkpoint_period: Duration::from_secs(60 * 60),
            flush_interval: Duration::from_secs(1),
            low_disk_space_threshold: 256 << 20,
            lock_timeout: Duration::from_secs(10),
        }
    }
}

impl Setting {
    fn validate(&self) -> anyhow::Result<()> {
        check_page_size(self.page_size)?;
        if self.read_cache_pages < 16 {
            return Err(anyhow!("read cache can't hold less than 16 pages"));
        }
        if let Some(limit) = self.buffer_memory_limit {
            if limit <= self.read_cache_pages {
                return Err(anyhow!(
                    "buffer memory limit must be above the read cache capacity"
                ));
            }
        }
        if self.max_dirty_pages == 0 {
            return Err(anyhow!("max dirty pages can't be zero"));
        }
        let policy_slots = match self.page_cache_policy {
            PageCachePolicy::PassThrough => 1,
            PageCachePolicy::Tiny(slots) => slots,
            PageCachePolicy::Lru { hot, cold } => hot.min(cold),
        };
        if policy_slots == 0 {
            return Err(anyhow!("page cache policy needs at least one slot"));
        }
        if self.wal_segment_size < 64 * 1024 {
            return Err(anyhow!("wal segment size can't be less than 64KiB"));
        }
        if self.checkpoint_period.as_secs() < 5 {
            return Err(anyhow!("checkpoint period can't be less than 5 seconds"));
        }
        if self.flush_interval < Duration::from_millis(10) {
            return Err(anyhow!("flush interval can't be less than 10 milliseconds"));
        }
        if self.lock_timeout.is_zero() {
            return Err(anyhow!("lock timeout can't be zero"));
        }
        Ok(())
    }
}

/// A directory of page files plus the log protecting them.
///
/// Opening runs recovery, then a full checkpoint. While open, a background thread makes a fuzzy
/// checkpoint every `checkpoint_period` and the write cache flushes dirty pages every
/// `flush_interval`.
pub struct Storage {
    path: PathBuf,
    _lock: File,

    wal: Arc<dyn WriteAheadLog>,
    write_cache: Arc<FileWriteCache>,
    manager: Arc<AtomicOperationsManager>,
    context: TreeContext,

    background_chan: Sender<()>,
    background_thread: JoinHandle<()>,
}

impl Storage {
    pub fn open(path: &Path, setting: Setting) -> anyhow::Result<Self> {
        Self::open_with_clusters(path, setting, None)
    }

    /// Opens the storage with the cluster storage component operations are replayed against.
    pub fn open_with_clusters(
        path: &Path,
        setting: Setting,
        clusters: Option<Arc<dyn ClusterStorage>>,
    ) -> anyhow::Result<Self> {
        setting.validate()?;

        if !path.exists() {
            std::fs::create_dir_all(path)?;
        }
        if !path.is_dir() {
            return Err(anyhow!("path is not a directory"));
        }

        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?
            .acquire_lock()?;

        let wal: Arc<dyn WriteAheadLog> = if setting.durable {
            Arc::new(DiskWal::open(
                path,
                WAL_NAME,
                setting.wal_flush_policy,
                setting.wal_segment_size,
            )?)
        } else {
            Arc::new(MemoryWal::new())
        };
        let write_cache = Arc::new(FileWriteCache::open(
            path,
            ByteBufferPool::with_limit(
                setting.page_size,
                setting.buffer_pool_limit,
                setting.buffer_memory_limit,
                setting.lock_timeout,
            ),
            wal.clone(),
            setting.max_dirty_pages,
            setting.low_disk_space_threshold,
        )?);
        let read_cache = Arc::new(LruReadCache::new(
            setting.read_cache_pages,
            setting.page_size,
        ));

        let result = recover(
            wal.as_ref(),
            read_cache.as_ref(),
            write_cache.as_ref(),
            clusters.as_deref(),
        )?;
        log::debug!(
            "storage_recovered path={path:?} redone={} rolled_back_units={} next_unit_id={}",
            result.redone,
            result.rolled_back_units,
            result.next_unit_id
        );

        let manager = Arc::new(AtomicOperationsManager::new(
            wal.clone(),
            read_cache,
            write_cache.clone(),
            clusters,
            setting.page_cache_policy,
            Arc::new(ComponentLocks::new(setting.lock_timeout)),
            result.next_unit_id,
        ));

        // recovery may have left compensations and redone pages in the write cache only
        Self::full_checkpoint(&manager)?;
        write_cache.start_background_flush(setting.flush_interval);

        let (sender, receiver) = channel();
        let background_thread = {
            let manager = manager.clone();
            std::thread::spawn(move || loop {
                let Err(err) = receiver.recv_timeout(setting.checkpoint_period) else {
                    break;
                };
                if err != RecvTimeoutError::Timeout {
                    break;
                }

                if let Err(err) = Self::fuzzy_checkpoint(&manager) {
                    log::error!("periodic_checkpoint_failed err={err}");
                }
            })
        };

        let context = TreeContext::new(&manager);
        Ok(Self {
            path: path.to_path_buf(),
            _lock: lock,
            wal,
            write_cache,
            manager,
            context,
            background_chan: sender,
            background_thread,
        })
    }

    fn fuzzy_checkpoint(manager: &AtomicOperationsManager) -> anyhow::Result<Lsn> {
        let _freeze = manager.freeze_commits();
        manager
            .write_cache()
            .make_fuzzy_checkpoint(manager.next_unit_id())
    }

    /// Flushes every dirty page, then logs a checkpoint that recovery can start from directly.
    fn full_checkpoint(manager: &AtomicOperationsManager) -> anyhow::Result<Lsn> {
        let _freeze = manager.freeze_commits();
        let wal = manager.wal();
        manager.write_cache().flush()?;
        let start = wal.log_full_checkpoint_start(manager.next_unit_id())?;
        let end = wal.log_full_checkpoint_end(start)?;
        wal.flush()?;
        let cut = wal.cut_till(start)?;
        log::debug!("full_checkpoint start={start} end={end} cut={cut}");
        Ok(end)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn manager(&self) -> &AtomicOperationsManager {
        &self.manager
    }

    pub fn context(&self) -> &TreeContext {
        &self.context
    }

    pub fn write_cache(&self) -> &Arc<dyn WriteCache> {
        self.manager.write_cache()
    }

    pub fn read_cache(&self) -> &Arc<dyn ReadCache> {
        self.manager.read_cache()
    }

    pub fn start_atomic_operation(&self) -> anyhow::Result<AtomicOperation> {
        self.manager.start_atomic_operation()
    }

    pub fn commit(&self, operation: AtomicOperation) -> anyhow::Result<Option<Lsn>> {
        self.manager.commit(operation)
    }

    pub fn rollback(&self, operation: AtomicOperation) -> anyhow::Result<()> {
        self.manager.rollback(operation)
    }

    /// Runs `f` inside an atomic operation, committed when `f` returns `Ok` and rolled back
    /// otherwise.
    pub fn execute<T>(
        &self,
        f: impl FnOnce(&mut AtomicOperation) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        self.manager.execute(f)
    }

    /// Creates the files of a new index in its own atomic operation.
    pub fn create_index(&self, definition: &IndexDefinition) -> anyhow::Result<IndexEngine> {
        self.manager
            .execute(|op| create_engine(op, &self.context, definition))
    }

    /// Creates a new index as part of `op`.
    pub fn create_index_in(
        &self,
        op: &mut AtomicOperation,
        definition: &IndexDefinition,
    ) -> anyhow::Result<IndexEngine> {
        create_engine(op, &self.context, definition)
    }

    pub fn load_index(&self, definition: &IndexDefinition) -> anyhow::Result<IndexEngine> {
        load_engine(&self.context, definition)
    }

    pub fn force_checkpoint(&self) -> anyhow::Result<()> {
        Self::full_checkpoint(&self.manager)?;
        Ok(())
    }

    pub fn shutdown(self) -> anyhow::Result<()> {
        self.background_chan.send(())?;
        if self.background_thread.join().is_err() {
            return Err(anyhow!("cannot join background thread"));
        }

        // Owning self means no atomic operation borrows the storage anymore and the background
        // thread is gone, so nothing can commit while the last checkpoint runs.
        Self::full_checkpoint(&self.manager)?;
        self.write_cache.close()?;
        self.wal.close()?;
        log::debug!("storage_closed path={:?}", self.path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::{CellBTreeEngine, EngineKind, Key, KeyType};
    use crate::error::StorageError;
    use crate::id::Rid;

    fn setting() -> Setting {
        Setting {
            page_size: 0x1000,
            read_cache_pages: 256,
            ..Setting::default()
        }
    }

    #[test]
    fn test_setting_validation() {
        assert!(setting().validate().is_ok());
        let invalid = [
            Setting {
                page_size: 3000,
                ..setting()
            },
            Setting {
                page_size: 0x800,
                ..setting()
            },
            Setting {
                read_cache_pages: 4,
                ..setting()
            },
            Setting {
                page_cache_policy: PageCachePolicy::Tiny(0),
                ..setting()
            },
            Setting {
                checkpoint_period: Duration::from_secs(1),
                ..setting()
            },
            Setting {
                buffer_memory_limit: Some(16),
                ..setting()
            },
            Setting {
                lock_timeout: Duration::ZERO,
                ..setting()
            },
        ];
        for setting in invalid {
            assert!(setting.validate().is_err());
        }
    }

    #[test]
    fn test_directory_is_locked() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = Storage::open(dir.path(), setting())?;

        let Err(err) = Storage::open(dir.path(), setting()) else {
            panic!("the storage was opened twice");
        };
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::InvalidState(_))
        ));

        storage.shutdown()?;
        Storage::open(dir.path(), setting())?.shutdown()?;
        Ok(())
    }

    #[test]
    fn test_index_survives_reopen() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let definition = IndexDefinition::new(
            "people",
            EngineKind::MultiValue,
            2,
            vec![KeyType::String],
        );

        let storage = Storage::open(dir.path(), setting())?;
        let index = storage.create_index(&definition)?;
        storage.execute(|op| {
            for i in 0..200 {
                let key = Key::from(format!("name-{}", i % 20));
                index.put(op, Some(&key), Rid::new(1, i))?;
            }
            Ok(())
        })?;
        storage.force_checkpoint()?;
        storage.execute(|op| {
            index.put(op, None, Rid::new(2, 1))?;
            Ok(())
        })?;
        index.close()?;
        storage.shutdown()?;

        let storage = Storage::open(dir.path(), setting())?;
        let index = storage.load_index(&definition)?;
        assert_eq!(201, index.size()?);
        assert_eq!(10, index.get(Some(&Key::from("name-7")))?.len());
        assert_eq!(vec![Rid::new(2, 1)], index.get(None)?);
        storage.shutdown()?;
        Ok(())
    }

    #[test]
    fn test_crash_keeps_committed_operations_only() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let definition =
            IndexDefinition::new("ids", EngineKind::SingleValue, 1, vec![KeyType::Long]);

        let storage = Storage::open(dir.path(), setting())?;
        let index = storage.create_index(&definition)?;
        storage.execute(|op| {
            for i in 0..500i64 {
                index.put(op, Some(&Key::from(i)), Rid::new(1, i))?;
            }
            Ok(())
        })?;

        let mut op = storage.start_atomic_operation()?;
        for i in 500..1000i64 {
            index.put(&mut op, Some(&Key::from(i)), Rid::new(1, i))?;
        }
        drop(op);
        drop(index);
        // no shutdown: nothing is flushed besides the synced log
        drop(storage);

        let storage = Storage::open(dir.path(), setting())?;
        let index = storage.load_index(&definition)?;
        assert_eq!(500, index.size()?);
        assert_eq!(vec![Rid::new(1, 42)], index.get(Some(&Key::from(42i64)))?);
        assert!(index.get(Some(&Key::from(700i64)))?.is_empty());
        storage.shutdown()?;
        Ok(())
    }

    #[test]
    fn test_failed_execute_is_rolled_back() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let definition =
            IndexDefinition::new("ids", EngineKind::SingleValue, 3, vec![KeyType::Integer]);
        let storage = Storage::open(dir.path(), setting())?;
        let index = storage.create_index(&definition)?;

        let result: anyhow::Result<()> = storage.execute(|op| {
            index.put(op, Some(&Key::from(1)), Rid::new(1, 1))?;
            Err(anyhow!("abort"))
        });
        assert!(result.is_err());
        assert!(index.get(Some(&Key::from(1)))?.is_empty());
        assert_eq!(0, index.size()?);
        storage.shutdown()?;
        Ok(())
    }
}
