//! Page cache local to one atomic operation.
//!
//! A locally cached page holds exactly one reference on the shared read cache, whatever the number
//! of times the operation loaded it. Its usage counter goes up on every local hit and down on every
//! release; a negative counter records releases owed to the read cache, they are paid when the
//! page leaves the local cache.

use super::{CacheEntry, ReadCache, WriteCache};
use crate::id::FileId;
use indexmap::{IndexMap, IndexSet};
use std::sync::Arc;

type PageKey = (FileId, u64);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PageCachePolicy {
    /// Every call goes to the read cache.
    PassThrough,
    /// `n` slots, the victim is the oldest slot whose page is not in use.
    Tiny(usize),
    /// Segmented LRU: new pages enter a probation segment of `cold` slots, a hit promotes the
    /// page to a protected segment of `hot` slots.
    Lru { hot: usize, cold: usize },
}

impl PageCachePolicy {
    fn capacity(&self) -> usize {
        match self {
            PageCachePolicy::PassThrough => 0,
            PageCachePolicy::Tiny(n) => *n,
            PageCachePolicy::Lru { hot, cold } => hot + cold,
        }
    }
}

struct LocalPage {
    entry: CacheEntry,
    usage: i64,
}

pub struct LocalPageCache {
    policy: PageCachePolicy,
    read_cache: Arc<dyn ReadCache>,
    write_cache: Arc<dyn WriteCache>,

    pages: IndexMap<PageKey, LocalPage>,
    /// tiny slots, or the probation segment of the LRU policy
    probation: IndexSet<PageKey>,
    protected: IndexSet<PageKey>,
}

impl LocalPageCache {
    pub fn new(
        policy: PageCachePolicy,
        read_cache: Arc<dyn ReadCache>,
        write_cache: Arc<dyn WriteCache>,
    ) -> Self {
        Self {
            policy,
            read_cache,
            write_cache,
            pages: IndexMap::new(),
            probation: IndexSet::new(),
            protected: IndexSet::new(),
        }
    }

    pub fn policy(&self) -> PageCachePolicy {
        self.policy
    }

    pub fn read_cache(&self) -> &Arc<dyn ReadCache> {
        &self.read_cache
    }

    pub fn write_cache(&self) -> &Arc<dyn WriteCache> {
        &self.write_cache
    }

    pub fn load(
        &mut self,
        file_id: FileId,
        page_index: u64,
        check_pinned: bool,
        page_count: usize,
    ) -> anyhow::Result<Option<CacheEntry>> {
        let key = (file_id, page_index);
        if let Some(page) = self.pages.get_mut(&key) {
            page.usage += 1;
            let entry = page.entry.clone();
            if matches!(self.policy, PageCachePolicy::Lru { .. }) {
                self.touch(key);
            }
            return Ok(Some(entry));
        }

        let Some(entry) = self.read_cache.load(
            file_id,
            page_index,
            check_pinned,
            self.write_cache.as_ref(),
            page_count,
        )?
        else {
            return Ok(None);
        };
        if self.policy == PageCachePolicy::PassThrough {
            return Ok(Some(entry));
        }

        if self.pages.len() >= self.policy.capacity() {
            let Some(victim) = self.victim() else {
                return Ok(Some(entry));
            };
            self.evict(victim)?;
        }
        self.admit(key, entry.clone());
        Ok(Some(entry))
    }

    /// New pages are not cached locally.
    pub fn allocate_new_page(&mut self, file_id: FileId) -> anyhow::Result<CacheEntry> {
        self.read_cache
            .allocate_new_page(file_id, self.write_cache.as_ref())
    }

    pub fn release(&mut self, entry: CacheEntry) -> anyhow::Result<()> {
        let key = (entry.file_id(), entry.page_index());
        if let Some(page) = self.pages.get_mut(&key) {
            if page.entry.same(&entry) {
                page.usage -= 1;
                return Ok(());
            }
        }
        self.read_cache.release(entry, self.write_cache.as_ref())
    }

    /// Releases everything still cached.
    pub fn reset(&mut self) -> anyhow::Result<()> {
        let keys = self.pages.keys().copied().collect::<Vec<_>>();
        let mut result = Ok(());
        for key in keys {
            if let Err(err) = self.evict(key) {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        self.probation.clear();
        self.protected.clear();
        result
    }

    fn admit(&mut self, key: PageKey, entry: CacheEntry) {
        self.pages.insert(key, LocalPage { entry, usage: 1 });
        self.probation.insert(key);
    }

    fn victim(&self) -> Option<PageKey> {
        let evictable = |key: &&PageKey| self.pages.get(*key).is_some_and(|page| page.usage <= 0);
        self.probation
            .iter()
            .find(evictable)
            .or_else(|| self.protected.iter().find(evictable))
            .copied()
    }

    fn evict(&mut self, key: PageKey) -> anyhow::Result<()> {
        self.probation.shift_remove(&key);
        self.protected.shift_remove(&key);
        let Some(page) = self.pages.shift_remove(&key) else {
            return Ok(());
        };
        let owed = 1 + (-page.usage).max(0);
        for _ in 0..owed {
            self.read_cache
                .release(page.entry.clone(), self.write_cache.as_ref())?;
        }
        Ok(())
    }

    fn touch(&mut self, key: PageKey) {
        let PageCachePolicy::Lru { hot, .. } = self.policy else {
            return;
        };
        if self.probation.shift_remove(&key) {
            self.protected.insert(key);
            if self.protected.len() > hot {
                if let Some(demoted) = self.protected.shift_remove_index(0) {
                    self.probation.insert(demoted);
                }
            }
        } else {
            self.protected.shift_remove(&key);
            self.protected.insert(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_pool::ByteBufferPool;
    use crate::cache::{
        BackgroundExceptionListener, CachePointer, LowDiskSpaceListener, StoreFuture,
    };
    use crate::atomic::{AtomicOperation, AtomicOperationsManager, ComponentLocks};
    use crate::id::Lsn;
    use crate::page::PAGE_PAYLOAD_OFFSET;
    use crate::po::PageOperation;
    use crate::wal::MemoryWal;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Write cache counting page creations, loads and stores.
    struct CountingWriteCache {
        pool: ByteBufferPool,
        size: Mutex<u64>,
        created: AtomicUsize,
        loaded: AtomicUsize,
        stored: AtomicUsize,
    }

    impl WriteCache for CountingWriteCache {
        fn page_size(&self) -> usize {
            self.pool.page_size()
        }
        fn add_file(&self, _: &str, _: Option<FileId>) -> anyhow::Result<FileId> {
            unimplemented!()
        }
        fn book_file_id(&self, _: &str) -> anyhow::Result<FileId> {
            unimplemented!()
        }
        fn load_file(&self, _: &str) -> anyhow::Result<FileId> {
            unimplemented!()
        }
        fn exists(&self, _: &str) -> bool {
            true
        }
        fn exists_id(&self, _: FileId) -> bool {
            true
        }
        fn file_id(&self, _: &str) -> Option<FileId> {
            None
        }
        fn file_name(&self, _: FileId) -> Option<String> {
            None
        }
        fn load(
            &self,
            file_id: FileId,
            start_page_index: u64,
            _: usize,
            add_new_pages: bool,
            _: &mut bool,
        ) -> anyhow::Result<Vec<Arc<CachePointer>>> {
            let mut size = self.size.lock();
            if start_page_index < *size {
                self.loaded.fetch_add(1, Ordering::SeqCst);
            } else if add_new_pages {
                let created = start_page_index - *size + 1;
                self.created.fetch_add(created as usize, Ordering::SeqCst);
                *size += created;
            } else {
                return Ok(vec![]);
            }
            let buffer = self.pool.acquire_direct(true)?;
            Ok(vec![Arc::new(CachePointer::new(
                file_id,
                start_page_index,
                buffer,
            ))])
        }
        fn store(&self, _: FileId, _: u64, _: &Arc<CachePointer>) -> anyhow::Result<StoreFuture> {
            self.stored.fetch_add(1, Ordering::SeqCst);
            Ok(StoreFuture::default())
        }
        fn flush(&self) -> anyhow::Result<()> {
            Ok(())
        }
        fn flush_file(&self, _: FileId) -> anyhow::Result<()> {
            Ok(())
        }
        fn filled_up_to(&self, _: FileId) -> anyhow::Result<u64> {
            Ok(*self.size.lock())
        }
        fn check_low_disk_space(&self) -> anyhow::Result<bool> {
            Ok(false)
        }
        fn make_fuzzy_checkpoint(&self, _: u64) -> anyhow::Result<Lsn> {
            unimplemented!()
        }
        fn truncate_file(&self, _: FileId) -> anyhow::Result<()> {
            unimplemented!()
        }
        fn delete_file(&self, _: FileId) -> anyhow::Result<()> {
            unimplemented!()
        }
        fn close_file(&self, _: FileId, _: bool) -> anyhow::Result<()> {
            unimplemented!()
        }
        fn add_low_disk_space_listener(&self, _: Arc<dyn LowDiskSpaceListener>) {}
        fn remove_low_disk_space_listener(&self, _: &Arc<dyn LowDiskSpaceListener>) {}
        fn add_background_exception_listener(&self, _: Arc<dyn BackgroundExceptionListener>) {}
        fn remove_background_exception_listener(
            &self,
            _: &Arc<dyn BackgroundExceptionListener>,
        ) {
        }
        fn close(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    /// Read cache without caching, every load goes to the write cache.
    #[derive(Default)]
    struct CountingReadCache {
        released: AtomicUsize,
    }

    impl ReadCache for CountingReadCache {
        fn load(
            &self,
            file_id: FileId,
            page_index: u64,
            _: bool,
            write_cache: &dyn WriteCache,
            _: usize,
        ) -> anyhow::Result<Option<CacheEntry>> {
            let mut hit = false;
            let pointers = write_cache.load(file_id, page_index, 1, false, &mut hit)?;
            Ok(pointers.into_iter().next().map(CacheEntry::new))
        }
        fn allocate_new_page(
            &self,
            file_id: FileId,
            write_cache: &dyn WriteCache,
        ) -> anyhow::Result<CacheEntry> {
            let page_index = write_cache.filled_up_to(file_id)?;
            let mut hit = false;
            let mut pointers = write_cache.load(file_id, page_index, 1, true, &mut hit)?;
            Ok(CacheEntry::new(pointers.remove(0)))
        }
        fn release(&self, entry: CacheEntry, write_cache: &dyn WriteCache) -> anyhow::Result<()> {
            self.released.fetch_add(1, Ordering::SeqCst);
            if entry.is_dirty() {
                if let Some(pointer) = entry.pointer() {
                    write_cache.store(entry.file_id(), entry.page_index(), pointer)?;
                }
            }
            Ok(())
        }
        fn pin_page(&self, _: &CacheEntry) -> anyhow::Result<()> {
            Ok(())
        }
        fn truncate_file(&self, _: FileId, _: &dyn WriteCache) -> anyhow::Result<()> {
            Ok(())
        }
        fn close_file(&self, _: FileId, _: bool, _: &dyn WriteCache) -> anyhow::Result<()> {
            Ok(())
        }
        fn delete_file(&self, _: FileId, _: &dyn WriteCache) -> anyhow::Result<()> {
            Ok(())
        }
        fn clear(&self) -> anyhow::Result<()> {
            Ok(())
        }
        fn used_memory(&self) -> usize {
            0
        }
    }

    type Counters = [usize; 4];

    fn mark(op: &mut AtomicOperation, entry: &CacheEntry) {
        op.changes(entry)
            .unwrap()
            .apply(PageOperation::WriteBytes {
                offset: PAGE_PAYLOAD_OFFSET as u32,
                old: vec![0],
                new: vec![1],
            })
            .unwrap();
    }

    /// Runs the same atomic operation under a policy and returns
    /// `[created, loaded, released, stored]` after every step. The operation modifies pages 0
    /// and 1 and appends page 6, then commits.
    fn run_scenario(policy: PageCachePolicy) -> Vec<Counters> {
        let file_id = FileId::new(1);
        let wc = Arc::new(CountingWriteCache {
            pool: ByteBufferPool::new(4096, 64),
            size: Mutex::new(0),
            created: AtomicUsize::new(0),
            loaded: AtomicUsize::new(0),
            stored: AtomicUsize::new(0),
        });
        let rc = Arc::new(CountingReadCache::default());
        for _ in 0..6 {
            rc.allocate_new_page(file_id, wc.as_ref()).unwrap();
        }

        let manager = AtomicOperationsManager::new(
            Arc::new(MemoryWal::new()),
            rc.clone(),
            wc.clone(),
            None,
            policy,
            Arc::new(ComponentLocks::new(Duration::from_millis(50))),
            1,
        );
        let mut op = manager.start_atomic_operation().unwrap();
        let mut steps = Vec::new();
        let mut step = || {
            steps.push([
                wc.created.load(Ordering::SeqCst),
                wc.loaded.load(Ordering::SeqCst),
                rc.released.load(Ordering::SeqCst),
                wc.stored.load(Ordering::SeqCst),
            ])
        };
        let load = |op: &mut AtomicOperation, page_index| {
            op.load_page(file_id, page_index, false, 1).unwrap().unwrap()
        };
        step();

        let p0 = load(&mut op, 0);
        mark(&mut op, &p0);
        step();
        let p0 = load(&mut op, 0);
        step();
        let p1 = load(&mut op, 1);
        step();
        let p1 = load(&mut op, 1);
        step();
        let p0 = load(&mut op, 0);
        step();
        let p2 = load(&mut op, 2);
        step();
        op.release_page(p1.clone()).unwrap();
        step();
        let p2 = load(&mut op, 2);
        step();
        op.release_page(p1).unwrap();
        step();
        let p2 = load(&mut op, 2);
        step();
        op.release_page(p2.clone()).unwrap();
        step();
        op.release_page(p2.clone()).unwrap();
        step();
        let p3 = load(&mut op, 3);
        step();
        let p1 = load(&mut op, 1);
        let p2 = load(&mut op, 2);
        step();
        let p4 = load(&mut op, 4);
        step();
        op.release_page(p4).unwrap();
        step();
        let _p5 = load(&mut op, 5);
        step();
        mark(&mut op, &p1);
        op.release_page(p1).unwrap();
        step();
        let p5 = load(&mut op, 5);
        step();

        for entry in [&p0, &p0, &p0, &p2, &p2, &p3, &p5, &p5] {
            op.release_page(entry.clone()).unwrap();
        }
        let p6 = op.add_page(file_id).unwrap();
        assert_eq!(6, p6.page_index());
        mark(&mut op, &p6);
        op.release_page(p6).unwrap();

        assert!(manager.commit(op).unwrap().is_some());
        step();
        drop(step);
        steps
    }

    #[test]
    fn test_pass_through_accounting() {
        let expected: Vec<Counters> = vec![
            [6, 0, 0, 0],
            [6, 1, 0, 0],
            [6, 2, 0, 0],
            [6, 3, 0, 0],
            [6, 4, 0, 0],
            [6, 5, 0, 0],
            [6, 6, 0, 0],
            [6, 6, 1, 0],
            [6, 7, 1, 0],
            [6, 7, 2, 0],
            [6, 8, 2, 0],
            [6, 8, 3, 0],
            [6, 8, 4, 0],
            [6, 9, 4, 0],
            [6, 11, 4, 0],
            [6, 12, 4, 0],
            [6, 12, 5, 0],
            [6, 13, 5, 0],
            [6, 13, 6, 0],
            [6, 14, 6, 0],
            [7, 16, 17, 3],
        ];
        assert_eq!(expected, run_scenario(PageCachePolicy::PassThrough));
    }

    #[test]
    fn test_tiny_accounting() {
        let expected: Vec<Counters> = vec![
            [6, 0, 0, 0],
            [6, 1, 0, 0],
            [6, 1, 0, 0],
            [6, 2, 0, 0],
            [6, 2, 0, 0],
            [6, 2, 0, 0],
            [6, 3, 0, 0],
            [6, 3, 0, 0],
            [6, 4, 0, 0],
            [6, 4, 0, 0],
            [6, 5, 1, 0],
            [6, 5, 1, 0],
            [6, 5, 1, 0],
            [6, 6, 3, 0],
            [6, 8, 3, 0],
            [6, 9, 3, 0],
            [6, 9, 4, 0],
            [6, 10, 4, 0],
            [6, 10, 5, 0],
            [6, 11, 5, 0],
            [7, 12, 13, 3],
        ];
        assert_eq!(expected, run_scenario(PageCachePolicy::Tiny(2)));
    }

    #[test]
    fn test_lru_accounting() {
        let expected: Vec<Counters> = vec![
            [6, 0, 0, 0],
            [6, 1, 0, 0],
            [6, 1, 0, 0],
            [6, 2, 0, 0],
            [6, 2, 0, 0],
            [6, 2, 0, 0],
            [6, 3, 0, 0],
            [6, 3, 0, 0],
            [6, 3, 0, 0],
            [6, 3, 0, 0],
            [6, 3, 0, 0],
            [6, 3, 0, 0],
            [6, 3, 0, 0],
            [6, 4, 0, 0],
            [6, 4, 0, 0],
            [6, 5, 0, 0],
            [6, 5, 1, 0],
            [6, 6, 1, 0],
            [6, 6, 1, 0],
            [6, 7, 2, 0],
            [7, 8, 9, 3],
        ];
        assert_eq!(expected, run_scenario(PageCachePolicy::Lru { hot: 2, cold: 2 }));
    }

    #[test]
    fn test_hit_does_not_touch_read_cache() {
        let file_id = FileId::new(1);
        let wc = Arc::new(CountingWriteCache {
            pool: ByteBufferPool::new(4096, 4),
            size: Mutex::new(1),
            created: AtomicUsize::new(0),
            loaded: AtomicUsize::new(0),
            stored: AtomicUsize::new(0),
        });
        let rc = Arc::new(CountingReadCache::default());
        let mut cache = LocalPageCache::new(PageCachePolicy::Tiny(1), rc.clone(), wc.clone());
        let a = cache.load(file_id, 0, false, 1).unwrap().unwrap();
        let b = cache.load(file_id, 0, false, 1).unwrap().unwrap();
        assert!(a.same(&b));
        assert_eq!(1, wc.loaded.load(Ordering::SeqCst));
        cache.release(a).unwrap();
        cache.release(b).unwrap();
        assert_eq!(0, rc.released.load(Ordering::SeqCst));
        cache.reset().unwrap();
        assert_eq!(1, rc.released.load(Ordering::SeqCst));
    }
}
