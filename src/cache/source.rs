use super::{CacheEntry, ReadCache, WriteCache};
use crate::buffer_pool::PageBuffer;
use crate::error::StorageError;
use crate::id::FileId;
use parking_lot::RwLockReadGuard;
use std::ops::Deref;
use std::sync::Arc;

/// Read access to a page, either a private image of an atomic operation or the shared buffer.
pub enum PageRef<'a> {
    Local(&'a [u8]),
    Shared(RwLockReadGuard<'a, PageBuffer>),
}

impl Deref for PageRef<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            PageRef::Local(buff) => buff,
            PageRef::Shared(guard) => guard,
        }
    }
}

/// Where a component reads its pages from.
pub trait PageSource {
    fn load_page(&mut self, file_id: FileId, page_index: u64)
        -> anyhow::Result<Option<CacheEntry>>;

    fn read_page<'a>(&'a self, entry: &'a CacheEntry) -> anyhow::Result<PageRef<'a>>;

    fn release_page(&mut self, entry: CacheEntry) -> anyhow::Result<()>;

    fn filled_up_to(&self, file_id: FileId) -> anyhow::Result<u64>;

    /// Loads a page, runs `f` on its content and releases it.
    fn with_page<R>(
        &mut self,
        file_id: FileId,
        page_index: u64,
        f: impl FnOnce(&[u8]) -> anyhow::Result<R>,
    ) -> anyhow::Result<R>
    where
        Self: Sized,
    {
        let Some(entry) = self.load_page(file_id, page_index)? else {
            return Err(StorageError::NotFound(format!(
                "page {page_index} of file {file_id}"
            ))
            .into());
        };
        let result = match self.read_page(&entry) {
            Ok(page) => f(&page),
            Err(err) => Err(err),
        };
        self.release_page(entry)?;
        result
    }
}

/// Reads the committed state straight from the shared caches.
pub struct SharedPages {
    read_cache: Arc<dyn ReadCache>,
    write_cache: Arc<dyn WriteCache>,
}

impl SharedPages {
    pub fn new(read_cache: Arc<dyn ReadCache>, write_cache: Arc<dyn WriteCache>) -> Self {
        Self {
            read_cache,
            write_cache,
        }
    }
}

impl PageSource for SharedPages {
    fn load_page(
        &mut self,
        file_id: FileId,
        page_index: u64,
    ) -> anyhow::Result<Option<CacheEntry>> {
        self.read_cache
            .load(file_id, page_index, false, self.write_cache.as_ref(), 1)
    }

    fn read_page<'a>(&'a self, entry: &'a CacheEntry) -> anyhow::Result<PageRef<'a>> {
        let Some(pointer) = entry.pointer() else {
            return Err(StorageError::InvalidState(format!(
                "page {} of file {} has no shared buffer",
                entry.page_index(),
                entry.file_id()
            ))
            .into());
        };
        Ok(PageRef::Shared(pointer.read()))
    }

    fn release_page(&mut self, entry: CacheEntry) -> anyhow::Result<()> {
        self.read_cache.release(entry, self.write_cache.as_ref())
    }

    fn filled_up_to(&self, file_id: FileId) -> anyhow::Result<u64> {
        self.write_cache.filled_up_to(file_id)
    }
}
