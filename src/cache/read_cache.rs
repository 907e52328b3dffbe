use super::{CacheEntry, CachePointer, ReadCache, WriteCache};
use crate::error::StorageError;
use crate::id::FileId;
use anyhow::anyhow;
use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

type PageKey = (FileId, u64);

/// Read cache evicting the least recently released unreferenced page.
///
/// Pinned pages live outside the LRU table and are only dropped with their file.
pub struct LruReadCache {
    capacity: usize,
    page_size: usize,
    state: Mutex<State>,
    allocation: Mutex<()>,
}

struct State {
    pages: IndexMap<PageKey, Slot>,
    pinned: HashMap<PageKey, Slot>,
    /// unreferenced pages of `pages`, least recently released first
    free: IndexSet<PageKey>,
}

struct Slot {
    pointer: Arc<CachePointer>,
    refs: usize,
}

impl LruReadCache {
    pub fn new(capacity: usize, page_size: usize) -> Self {
        Self {
            capacity,
            page_size,
            state: Mutex::new(State {
                pages: IndexMap::with_capacity(capacity.min(1 << 16)),
                pinned: HashMap::new(),
                free: IndexSet::new(),
            }),
            allocation: Mutex::new(()),
        }
    }

    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.pages.len() + state.pinned.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn acquire(state: &mut State, key: PageKey, check_pinned: bool) -> Option<CacheEntry> {
        if check_pinned {
            if let Some(slot) = state.pinned.get_mut(&key) {
                slot.refs += 1;
                return Some(CacheEntry::new(slot.pointer.clone()));
            }
        }
        if let Some(slot) = state.pages.get_mut(&key) {
            slot.refs += 1;
            state.free.shift_remove(&key);
            return Some(CacheEntry::new(slot.pointer.clone()));
        }
        // pinned pages must be found even when the caller did not ask for them first
        if let Some(slot) = state.pinned.get_mut(&key) {
            slot.refs += 1;
            return Some(CacheEntry::new(slot.pointer.clone()));
        }
        None
    }

    /// Adds loaded pages to the table. Pages another thread loaded in the meantime win, both
    /// images come from the same source.
    fn admit(state: &mut State, pointers: Vec<Arc<CachePointer>>) {
        for pointer in pointers {
            let key = (pointer.file_id(), pointer.page_index());
            if state.pages.contains_key(&key) || state.pinned.contains_key(&key) {
                continue;
            }
            state.pages.insert(key, Slot { pointer, refs: 0 });
            state.free.insert(key);
        }
    }

    fn evict(&self, state: &mut State) {
        while state.pages.len() > self.capacity {
            let Some(key) = state.free.shift_remove_index(0) else {
                log::trace!(
                    "read_cache_over_capacity size={} capacity={}",
                    state.pages.len(),
                    self.capacity
                );
                break;
            };
            state.pages.shift_remove(&key);
            log::trace!("page_evicted file_id={} page_index={}", key.0, key.1);
        }
    }

    fn remove_file_pages(&self, file_id: FileId) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        let in_use = state
            .pages
            .iter()
            .chain(state.pinned.iter())
            .any(|((id, _), slot)| *id == file_id && slot.refs > 0);
        if in_use {
            return Err(StorageError::InvalidState(format!(
                "pages of file {file_id} are still in use"
            ))
            .into());
        }
        state.pages.retain(|(id, _), _| *id != file_id);
        state.pinned.retain(|(id, _), _| *id != file_id);
        state.free.retain(|(id, _)| *id != file_id);
        Ok(())
    }
}

impl ReadCache for LruReadCache {
    fn load(
        &self,
        file_id: FileId,
        page_index: u64,
        check_pinned: bool,
        write_cache: &dyn WriteCache,
        page_count: usize,
    ) -> anyhow::Result<Option<CacheEntry>> {
        let key = (file_id, page_index);
        if let Some(entry) = Self::acquire(&mut self.state.lock(), key, check_pinned) {
            return Ok(Some(entry));
        }

        let mut cache_hit = false;
        let pointers = write_cache.load(file_id, page_index, page_count, false, &mut cache_hit)?;
        if pointers.is_empty() {
            return Ok(None);
        }
        log::trace!(
            "page_loaded file_id={file_id} page_index={page_index} count={} hit={cache_hit}",
            pointers.len()
        );

        let mut state = self.state.lock();
        Self::admit(&mut state, pointers);
        let entry = Self::acquire(&mut state, key, check_pinned);
        self.evict(&mut state);
        Ok(entry)
    }

    fn allocate_new_page(
        &self,
        file_id: FileId,
        write_cache: &dyn WriteCache,
    ) -> anyhow::Result<CacheEntry> {
        let _allocation = self.allocation.lock();
        let page_index = write_cache.filled_up_to(file_id)?;
        let mut cache_hit = false;
        let mut pointers = write_cache.load(file_id, page_index, 1, true, &mut cache_hit)?;
        if pointers.len() != 1 {
            return Err(anyhow!(
                "cannot allocate page {page_index} of file {file_id}"
            ));
        }
        let pointer = pointers.remove(0);

        let mut state = self.state.lock();
        let key = (file_id, page_index);
        state.free.shift_remove(&key);
        state.pages.insert(
            key,
            Slot {
                pointer: pointer.clone(),
                refs: 1,
            },
        );
        self.evict(&mut state);
        Ok(CacheEntry::new(pointer))
    }

    fn release(&self, entry: CacheEntry, write_cache: &dyn WriteCache) -> anyhow::Result<()> {
        let key = (entry.file_id(), entry.page_index());
        let Some(pointer) = entry.pointer() else {
            return Err(StorageError::InvalidState(format!(
                "page {} of file {} was never loaded",
                key.1, key.0
            ))
            .into());
        };
        // stored before the reference goes, so the page can't be evicted before the write cache
        // knows about it
        if entry.is_dirty() {
            write_cache.store(key.0, key.1, pointer)?;
        }

        let mut state = self.state.lock();
        let unbalanced = || StorageError::UnbalancedRelease {
            file_id: key.0,
            page_index: key.1,
        };
        if let Some(slot) = state.pinned.get_mut(&key) {
            if !Arc::ptr_eq(&slot.pointer, pointer) || slot.refs == 0 {
                return Err(unbalanced().into());
            }
            slot.refs -= 1;
            return Ok(());
        }
        let Some(slot) = state.pages.get_mut(&key) else {
            return Err(unbalanced().into());
        };
        if !Arc::ptr_eq(&slot.pointer, pointer) || slot.refs == 0 {
            return Err(unbalanced().into());
        }
        slot.refs -= 1;
        if slot.refs == 0 {
            state.free.insert(key);
            self.evict(&mut state);
        }
        Ok(())
    }

    fn pin_page(&self, entry: &CacheEntry) -> anyhow::Result<()> {
        let key = (entry.file_id(), entry.page_index());
        let mut state = self.state.lock();
        if state.pinned.contains_key(&key) {
            return Ok(());
        }
        let Some(slot) = state.pages.shift_remove(&key) else {
            return Err(StorageError::InvalidState(format!(
                "page {} of file {} is not cached",
                key.1, key.0
            ))
            .into());
        };
        state.free.shift_remove(&key);
        state.pinned.insert(key, slot);
        Ok(())
    }

    fn truncate_file(
        &self,
        file_id: FileId,
        write_cache: &dyn WriteCache,
    ) -> anyhow::Result<()> {
        self.remove_file_pages(file_id)?;
        write_cache.truncate_file(file_id)
    }

    fn close_file(
        &self,
        file_id: FileId,
        flush: bool,
        write_cache: &dyn WriteCache,
    ) -> anyhow::Result<()> {
        self.remove_file_pages(file_id)?;
        write_cache.close_file(file_id, flush)
    }

    fn delete_file(&self, file_id: FileId, write_cache: &dyn WriteCache) -> anyhow::Result<()> {
        self.remove_file_pages(file_id)?;
        write_cache.delete_file(file_id)
    }

    fn clear(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        state.pages.retain(|_, slot| slot.refs > 0);
        state.pinned.retain(|_, slot| slot.refs > 0);
        state.free.clear();
        Ok(())
    }

    fn used_memory(&self) -> usize {
        self.len() * self.page_size
    }
}
