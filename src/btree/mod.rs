//! Cell B-tree indexes: one generic tree plus the single-value and multi-value engines built on
//! top of it.

pub(crate) mod bucket;
mod cursor;
mod engine;
pub(crate) mod entry_point;
mod key;
mod multi_value;
pub(crate) mod null_bucket;
mod single_value;
mod tree;

pub use cursor::{EntryCursor, KeyCursor};
pub use engine::{
    create_engine, load_engine, CellBTreeEngine, EngineKind, IndexDefinition, IndexEngine,
    SUPPORTED_VERSIONS,
};
pub use key::{Encryption, Key, KeySerializer, KeyType, KeyValue, MemcomparableSerializer};
pub use multi_value::MultiValueTree;
pub use null_bucket::NullBucketKind;
pub use single_value::SingleValueTree;

use crate::atomic::{AtomicOperationsManager, ComponentLocks};
use crate::cache::{ReadCache, SharedPages, WriteCache};
use std::sync::Arc;

/// Shared state trees need to read committed data outside of atomic operations.
#[derive(Clone)]
pub struct TreeContext {
    locks: Arc<ComponentLocks>,
    read_cache: Arc<dyn ReadCache>,
    write_cache: Arc<dyn WriteCache>,
}

impl TreeContext {
    pub fn new(manager: &AtomicOperationsManager) -> Self {
        Self {
            locks: manager.locks().clone(),
            read_cache: manager.read_cache().clone(),
            write_cache: manager.write_cache().clone(),
        }
    }

    pub(crate) fn read_cache(&self) -> &Arc<dyn ReadCache> {
        &self.read_cache
    }

    pub(crate) fn write_cache(&self) -> &Arc<dyn WriteCache> {
        &self.write_cache
    }

    /// Runs `f` over the committed pages while holding the shared lock of `component`.
    pub(crate) fn read<R>(
        &self,
        component: &str,
        f: impl FnOnce(&mut SharedPages) -> anyhow::Result<R>,
    ) -> anyhow::Result<R> {
        let _guard = self.locks.acquire_shared(component)?;
        let mut pages = SharedPages::new(self.read_cache.clone(), self.write_cache.clone());
        f(&mut pages)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::buffer_pool::ByteBufferPool;
    use crate::cache::{FileWriteCache, LruReadCache, PageCachePolicy};
    use crate::wal::MemoryWal;
    use std::time::Duration;

    pub(crate) struct Fixture {
        pub(crate) _dir: tempfile::TempDir,
        pub(crate) write_cache: Arc<FileWriteCache>,
        pub(crate) manager: AtomicOperationsManager,
        pub(crate) context: TreeContext,
    }

    pub(crate) fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let wal = Arc::new(MemoryWal::new());
        let write_cache = Arc::new(
            FileWriteCache::open(
                dir.path(),
                ByteBufferPool::new(4096, 64),
                wal.clone(),
                100_000,
                0,
            )
            .unwrap(),
        );
        let manager = AtomicOperationsManager::new(
            wal,
            Arc::new(LruReadCache::new(256, 4096)),
            write_cache.clone(),
            None,
            PageCachePolicy::Tiny(4),
            Arc::new(ComponentLocks::new(Duration::from_millis(200))),
            1,
        );
        let context = TreeContext::new(&manager);
        Fixture {
            _dir: dir,
            write_cache,
            manager,
            context,
        }
    }
}
