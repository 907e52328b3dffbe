mod page_cache;
mod read_cache;
mod source;
mod write_cache;

pub use page_cache::{LocalPageCache, PageCachePolicy};
pub use read_cache::LruReadCache;
pub use source::{PageRef, PageSource, SharedPages};
pub use write_cache::FileWriteCache;

use crate::buffer_pool::PageBuffer;
use crate::id::{FileId, Lsn};
use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// In-memory image of one page, shared by the read cache and the write cache.
pub struct CachePointer {
    file_id: FileId,
    page_index: u64,
    buffer: RwLock<PageBuffer>,
    version: AtomicU64,
    /// LSN of the first record applied since the page was last written, 0 when clean.
    dirty_since: AtomicU64,
}

impl CachePointer {
    pub(crate) fn new(file_id: FileId, page_index: u64, buffer: PageBuffer) -> Self {
        Self {
            file_id,
            page_index,
            buffer: RwLock::new(buffer),
            version: AtomicU64::new(0),
            dirty_since: AtomicU64::new(0),
        }
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn page_index(&self) -> u64 {
        self.page_index
    }

    pub fn read(&self) -> RwLockReadGuard<'_, PageBuffer> {
        self.buffer.read()
    }

    /// Every write lock counts as a modification, flushes compare versions to find out whether a
    /// page changed while it was being written.
    pub fn write(&self) -> RwLockWriteGuard<'_, PageBuffer> {
        let guard = self.buffer.write();
        self.version.fetch_add(1, Ordering::SeqCst);
        guard
    }

    pub(crate) fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Must be called while holding the write lock.
    pub(crate) fn mark_dirty_since(&self, lsn: Lsn) {
        let _ = self
            .dirty_since
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                if current == 0 || lsn.get() < current {
                    Some(lsn.get())
                } else {
                    None
                }
            });
    }

    pub(crate) fn dirty_since(&self) -> Option<Lsn> {
        Lsn::new(self.dirty_since.load(Ordering::SeqCst))
    }

    pub(crate) fn clear_dirty_since(&self) {
        self.dirty_since.store(0, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for CachePointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachePointer")
            .field("file_id", &self.file_id)
            .field("page_index", &self.page_index)
            .finish()
    }
}

/// Handle on a page handed out by a read cache load. Every load returns a fresh handle, two
/// handles on the same page compare equal with [`CacheEntry::same`] only when they are the same
/// acquisition.
#[derive(Clone, Debug)]
pub struct CacheEntry(Arc<EntryInner>);

#[derive(Debug)]
struct EntryInner {
    file_id: FileId,
    page_index: u64,
    pointer: Option<Arc<CachePointer>>,
    dirty: AtomicBool,
}

impl CacheEntry {
    pub(crate) fn new(pointer: Arc<CachePointer>) -> Self {
        Self(Arc::new(EntryInner {
            file_id: pointer.file_id(),
            page_index: pointer.page_index(),
            pointer: Some(pointer),
            dirty: AtomicBool::new(false),
        }))
    }

    /// Entry of a page which only exists inside an atomic operation so far.
    pub(crate) fn detached(file_id: FileId, page_index: u64) -> Self {
        Self(Arc::new(EntryInner {
            file_id,
            page_index,
            pointer: None,
            dirty: AtomicBool::new(false),
        }))
    }

    pub fn file_id(&self) -> FileId {
        self.0.file_id
    }

    pub fn page_index(&self) -> u64 {
        self.0.page_index
    }

    pub fn pointer(&self) -> Option<&Arc<CachePointer>> {
        self.0.pointer.as_ref()
    }

    pub fn is_detached(&self) -> bool {
        self.0.pointer.is_none()
    }

    pub fn mark_dirty(&self) {
        self.0.dirty.store(true, Ordering::SeqCst);
    }

    pub fn is_dirty(&self) -> bool {
        self.0.dirty.load(Ordering::SeqCst)
    }

    pub fn same(&self, other: &CacheEntry) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Completes once the page it was returned for has been written to disk.
#[derive(Clone, Default)]
pub struct StoreFuture {
    inner: Arc<FutureInner>,
}

#[derive(Default)]
struct FutureInner {
    done: Mutex<bool>,
    cond: Condvar,
}

impl StoreFuture {
    pub(crate) fn complete(&self) {
        *self.inner.done.lock() = true;
        self.inner.cond.notify_all();
    }

    pub fn is_done(&self) -> bool {
        *self.inner.done.lock()
    }

    pub fn wait(&self) {
        let mut done = self.inner.done.lock();
        while !*done {
            self.inner.cond.wait(&mut done);
        }
    }

    /// Returns whether the write completed within `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut done = self.inner.done.lock();
        if !*done {
            self.inner.cond.wait_for(&mut done, timeout);
        }
        *done
    }
}

pub trait LowDiskSpaceListener: Send + Sync {
    fn low_disk_space(&self, available: u64, required: u64);
}

pub trait BackgroundExceptionListener: Send + Sync {
    fn background_exception(&self, err: &anyhow::Error);
}

/// Owner of the page files: file registry, disk I/O and the dirty page table.
pub trait WriteCache: Send + Sync {
    fn page_size(&self) -> usize;

    /// Registers and creates a file. With `file_id` the given id is used, as done by recovery and
    /// by atomic operations that booked an id in advance.
    fn add_file(&self, name: &str, file_id: Option<FileId>) -> anyhow::Result<FileId>;

    /// Reserves an id for a file that will be added later.
    fn book_file_id(&self, name: &str) -> anyhow::Result<FileId>;

    /// Opens a registered file which was closed.
    fn load_file(&self, name: &str) -> anyhow::Result<FileId>;

    fn exists(&self, name: &str) -> bool;

    fn exists_id(&self, file_id: FileId) -> bool;

    fn file_id(&self, name: &str) -> Option<FileId>;

    fn file_name(&self, file_id: FileId) -> Option<String>;

    /// Loads up to `page_count` consecutive pages starting at `start_page_index`. When the start
    /// page is past the end of the file the result is empty, unless `add_new_pages` is set, then
    /// the file grows up to and including the start page. `cache_hit` tells whether the first
    /// page was served from memory.
    fn load(
        &self,
        file_id: FileId,
        start_page_index: u64,
        page_count: usize,
        add_new_pages: bool,
        cache_hit: &mut bool,
    ) -> anyhow::Result<Vec<Arc<CachePointer>>>;

    fn store(
        &self,
        file_id: FileId,
        page_index: u64,
        pointer: &Arc<CachePointer>,
    ) -> anyhow::Result<StoreFuture>;

    fn flush(&self) -> anyhow::Result<()>;

    fn flush_file(&self, file_id: FileId) -> anyhow::Result<()>;

    /// Number of pages of the file.
    fn filled_up_to(&self, file_id: FileId) -> anyhow::Result<u64>;

    /// Notifies the listeners and returns true when free space drops under the threshold.
    fn check_low_disk_space(&self) -> anyhow::Result<bool>;

    /// Writes a fuzzy checkpoint whose redo start is the oldest change not yet on disk, then cuts
    /// the WAL up to it. Returns the LSN of the checkpoint end record.
    fn make_fuzzy_checkpoint(&self, next_unit_id: u64) -> anyhow::Result<Lsn>;

    fn truncate_file(&self, file_id: FileId) -> anyhow::Result<()>;

    fn delete_file(&self, file_id: FileId) -> anyhow::Result<()>;

    fn close_file(&self, file_id: FileId, flush: bool) -> anyhow::Result<()>;

    fn add_low_disk_space_listener(&self, listener: Arc<dyn LowDiskSpaceListener>);

    fn remove_low_disk_space_listener(&self, listener: &Arc<dyn LowDiskSpaceListener>);

    fn add_background_exception_listener(&self, listener: Arc<dyn BackgroundExceptionListener>);

    fn remove_background_exception_listener(
        &self,
        listener: &Arc<dyn BackgroundExceptionListener>,
    );

    /// Flushes everything and closes all files.
    fn close(&self) -> anyhow::Result<()>;
}

/// Shared page cache in front of a [`WriteCache`]: reference counting, pinning and eviction.
pub trait ReadCache: Send + Sync {
    fn load(
        &self,
        file_id: FileId,
        page_index: u64,
        check_pinned: bool,
        write_cache: &dyn WriteCache,
        page_count: usize,
    ) -> anyhow::Result<Option<CacheEntry>>;

    /// Grows the file by one page and returns it.
    fn allocate_new_page(
        &self,
        file_id: FileId,
        write_cache: &dyn WriteCache,
    ) -> anyhow::Result<CacheEntry>;

    /// Drops one reference. Dirty entries are handed to the write cache.
    fn release(&self, entry: CacheEntry, write_cache: &dyn WriteCache) -> anyhow::Result<()>;

    /// Keeps a page in memory until its file is closed.
    fn pin_page(&self, entry: &CacheEntry) -> anyhow::Result<()>;

    fn truncate_file(&self, file_id: FileId, write_cache: &dyn WriteCache)
        -> anyhow::Result<()>;

    fn close_file(
        &self,
        file_id: FileId,
        flush: bool,
        write_cache: &dyn WriteCache,
    ) -> anyhow::Result<()>;

    fn delete_file(&self, file_id: FileId, write_cache: &dyn WriteCache) -> anyhow::Result<()>;

    /// Forgets every unreferenced page.
    fn clear(&self) -> anyhow::Result<()>;

    fn used_memory(&self) -> usize;
}

/// Removes `listener` from `listeners` by identity.
fn remove_listener<T: ?Sized>(listeners: &mut Vec<Arc<T>>, listener: &Arc<T>) {
    listeners.retain(|l| !Arc::ptr_eq(l, listener));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_pool::ByteBufferPool;

    #[test]
    fn test_dirty_since_keeps_minimum() {
        let pool = ByteBufferPool::new(4096, 1);
        let pointer = CachePointer::new(FileId::new(1), 3, pool.acquire_direct(true).unwrap());
        assert_eq!(None, pointer.dirty_since());

        let guard = pointer.write();
        pointer.mark_dirty_since(Lsn::new(200).unwrap());
        pointer.mark_dirty_since(Lsn::new(100).unwrap());
        pointer.mark_dirty_since(Lsn::new(300).unwrap());
        drop(guard);
        assert_eq!(Some(Lsn::new(100).unwrap()), pointer.dirty_since());
        assert_eq!(1, pointer.version());

        pointer.clear_dirty_since();
        assert_eq!(None, pointer.dirty_since());
    }

    #[test]
    fn test_entries_are_distinct_acquisitions() {
        let pool = ByteBufferPool::new(4096, 1);
        let pointer = Arc::new(CachePointer::new(
            FileId::new(1),
            0,
            pool.acquire_direct(true).unwrap(),
        ));
        let a = CacheEntry::new(pointer.clone());
        let b = CacheEntry::new(pointer);
        assert!(a.same(&a.clone()));
        assert!(!a.same(&b));

        let detached = CacheEntry::detached(FileId::new(1), 9);
        assert!(detached.is_detached());
        assert_eq!(9, detached.page_index());
    }

    #[test]
    fn test_store_future() {
        let future = StoreFuture::default();
        assert!(!future.wait_timeout(Duration::from_millis(1)));
        let waiter = {
            let future = future.clone();
            std::thread::spawn(move || future.wait())
        };
        future.complete();
        waiter.join().unwrap();
        assert!(future.is_done());
    }
}
