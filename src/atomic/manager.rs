use super::lock::{ComponentLocks, SharedLockGuard};
use super::operation::AtomicOperation;
use crate::cache::{LocalPageCache, PageCachePolicy, ReadCache, SharedPages, WriteCache};
use crate::co::ClusterStorage;
use crate::error::StorageError;
use crate::id::{Lsn, OperationUnitId};
use crate::wal::WriteAheadLog;
use parking_lot::{RwLock, RwLockWriteGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Hands out atomic operations and drives their commit.
pub struct AtomicOperationsManager {
    wal: Arc<dyn WriteAheadLog>,
    read_cache: Arc<dyn ReadCache>,
    write_cache: Arc<dyn WriteCache>,
    clusters: Option<Arc<dyn ClusterStorage>>,
    policy: PageCachePolicy,
    next_unit_id: AtomicU64,
    commit_barrier: Arc<RwLock<()>>,
    locks: Arc<ComponentLocks>,
}

/// While alive no atomic operation can commit.
pub struct CommitFreeze<'a> {
    _guard: RwLockWriteGuard<'a, ()>,
}

impl AtomicOperationsManager {
    pub fn new(
        wal: Arc<dyn WriteAheadLog>,
        read_cache: Arc<dyn ReadCache>,
        write_cache: Arc<dyn WriteCache>,
        clusters: Option<Arc<dyn ClusterStorage>>,
        policy: PageCachePolicy,
        locks: Arc<ComponentLocks>,
        next_unit_id: u64,
    ) -> Self {
        Self {
            wal,
            read_cache,
            write_cache,
            clusters,
            policy,
            next_unit_id: AtomicU64::new(next_unit_id.max(1)),
            commit_barrier: Arc::new(RwLock::new(())),
            locks,
        }
    }

    pub fn wal(&self) -> &Arc<dyn WriteAheadLog> {
        &self.wal
    }

    pub fn read_cache(&self) -> &Arc<dyn ReadCache> {
        &self.read_cache
    }

    pub fn write_cache(&self) -> &Arc<dyn WriteCache> {
        &self.write_cache
    }

    pub fn locks(&self) -> &Arc<ComponentLocks> {
        &self.locks
    }

    /// Id the next atomic operation will get.
    pub fn next_unit_id(&self) -> u64 {
        self.next_unit_id.load(Ordering::SeqCst)
    }

    pub fn start_atomic_operation(&self) -> anyhow::Result<AtomicOperation> {
        let id = self.next_unit_id.fetch_add(1, Ordering::SeqCst);
        let Some(unit) = OperationUnitId::new(id) else {
            return Err(StorageError::ResourceExhausted("operation unit ids".to_string()).into());
        };
        log::trace!("atomic_operation_started unit={unit}");
        Ok(AtomicOperation::new(
            unit,
            LocalPageCache::new(
                self.policy,
                self.read_cache.clone(),
                self.write_cache.clone(),
            ),
            self.clusters.clone(),
            self.locks.clone(),
            self.commit_barrier.clone(),
        ))
    }

    pub fn commit(&self, mut operation: AtomicOperation) -> anyhow::Result<Option<Lsn>> {
        operation.commit_changes(self.wal.as_ref())
    }

    pub fn rollback(&self, mut operation: AtomicOperation) -> anyhow::Result<()> {
        operation.rollback(self.wal.as_ref())
    }

    /// Runs `f` inside a new atomic operation. The operation commits when `f` succeeds and rolls
    /// back when it fails.
    pub fn execute<T>(
        &self,
        f: impl FnOnce(&mut AtomicOperation) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let mut operation = self.start_atomic_operation()?;
        match f(&mut operation) {
            Ok(value) => {
                operation.commit_changes(self.wal.as_ref())?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = operation.rollback(self.wal.as_ref()) {
                    log::error!(
                        "atomic_operation_rollback_failed unit={} err={rollback_err}",
                        operation.unit_id()
                    );
                }
                Err(err)
            }
        }
    }

    /// Page source over committed state, used by readers outside any operation.
    pub fn shared_pages(&self) -> SharedPages {
        SharedPages::new(self.read_cache.clone(), self.write_cache.clone())
    }

    pub fn acquire_shared_lock(&self, component: &str) -> anyhow::Result<SharedLockGuard> {
        self.locks.acquire_shared(component)
    }

    /// Waits for in-flight commits and blocks new ones until the returned guard is dropped.
    pub fn freeze_commits(&self) -> CommitFreeze<'_> {
        CommitFreeze {
            _guard: self.commit_barrier.write(),
        }
    }
}
