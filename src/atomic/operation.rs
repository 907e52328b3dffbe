use super::lock::ComponentLocks;
use crate::cache::{CacheEntry, LocalPageCache, PageRef, PageSource};
use crate::co::{ClusterStorage, ComponentOperation};
use crate::error::StorageError;
use crate::id::{FileId, Lsn, OperationUnitId};
use crate::page::set_page_lsn;
use crate::po::PageOperation;
use crate::wal::{WalRecord, WriteAheadLog};
use anyhow::anyhow;
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;

type PageKey = (FileId, u64);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OperationState {
    Started,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
}

/// Private image of a page plus the operations that produced it from the shared image.
struct PageChanges {
    image: Vec<u8>,
    operations: Vec<PageOperation>,
    is_new: bool,
}

/// Position of a recorded operation, in mutation order.
#[derive(Copy, Clone)]
enum Recorded {
    Page(PageKey, usize),
    Component(usize),
}

/// Unit of durability. Mutations are kept private to the operation until commit, when they are
/// logged and then applied to the shared cache.
pub struct AtomicOperation {
    unit: OperationUnitId,
    state: OperationState,
    page_size: usize,
    page_cache: LocalPageCache,
    clusters: Option<Arc<dyn ClusterStorage>>,
    locks: Arc<ComponentLocks>,
    commit_barrier: Arc<RwLock<()>>,

    changes: IndexMap<PageKey, PageChanges>,
    components: Vec<ComponentOperation>,
    order: Vec<Recorded>,
    new_files: IndexMap<FileId, String>,
    deleted_files: Vec<FileId>,
    metadata: Vec<(String, Vec<u8>)>,
    acquired: Vec<CacheEntry>,
}

/// Delta-tracking view of one page of an atomic operation.
pub struct ChangesCollector<'a> {
    key: PageKey,
    page: &'a mut PageChanges,
    order: &'a mut Vec<Recorded>,
}

impl ChangesCollector<'_> {
    pub fn file_id(&self) -> FileId {
        self.key.0
    }

    pub fn page_index(&self) -> u64 {
        self.key.1
    }

    pub fn buffer(&self) -> &[u8] {
        &self.page.image
    }

    /// Applies `operation` to the private image and records it.
    pub fn apply(&mut self, operation: PageOperation) -> anyhow::Result<()> {
        operation.redo(&mut self.page.image)?;
        self.order
            .push(Recorded::Page(self.key, self.page.operations.len()));
        self.page.operations.push(operation);
        Ok(())
    }
}

impl AtomicOperation {
    pub(crate) fn new(
        unit: OperationUnitId,
        page_cache: LocalPageCache,
        clusters: Option<Arc<dyn ClusterStorage>>,
        locks: Arc<ComponentLocks>,
        commit_barrier: Arc<RwLock<()>>,
    ) -> Self {
        let page_size = page_cache.write_cache().page_size();
        Self {
            unit,
            state: OperationState::Started,
            page_size,
            page_cache,
            clusters,
            locks,
            commit_barrier,
            changes: IndexMap::new(),
            components: Vec::new(),
            order: Vec::new(),
            new_files: IndexMap::new(),
            deleted_files: Vec::new(),
            metadata: Vec::new(),
            acquired: Vec::new(),
        }
    }

    pub fn unit_id(&self) -> OperationUnitId {
        self.unit
    }

    pub fn state(&self) -> OperationState {
        self.state
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    fn check_started(&self) -> anyhow::Result<()> {
        if self.state != OperationState::Started {
            return Err(StorageError::InvalidState(format!(
                "atomic operation {} is {:?}",
                self.unit, self.state
            ))
            .into());
        }
        Ok(())
    }

    pub fn load_page(
        &mut self,
        file_id: FileId,
        page_index: u64,
        check_pinned: bool,
        page_count: usize,
    ) -> anyhow::Result<Option<CacheEntry>> {
        self.check_started()?;
        let key = (file_id, page_index);
        let entry = if self.changes.get(&key).is_some_and(|page| page.is_new) {
            CacheEntry::detached(file_id, page_index)
        } else if self.new_files.contains_key(&file_id) || self.deleted_files.contains(&file_id) {
            return Ok(None);
        } else {
            match self
                .page_cache
                .load(file_id, page_index, check_pinned, page_count)?
            {
                Some(entry) => entry,
                None => return Ok(None),
            }
        };
        self.acquired.push(entry.clone());
        Ok(Some(entry))
    }

    /// Appends a page to the file. The page only exists in this operation until commit.
    pub fn add_page(&mut self, file_id: FileId) -> anyhow::Result<CacheEntry> {
        self.check_started()?;
        let page_index = self.filled_up_to(file_id)?;
        self.changes.insert(
            (file_id, page_index),
            PageChanges {
                image: vec![0; self.page_size],
                operations: Vec::new(),
                is_new: true,
            },
        );
        let entry = CacheEntry::detached(file_id, page_index);
        self.acquired.push(entry.clone());
        Ok(entry)
    }

    pub fn release_page(&mut self, entry: CacheEntry) -> anyhow::Result<()> {
        let Some(position) = self.acquired.iter().position(|e| e.same(&entry)) else {
            return Err(StorageError::UnbalancedRelease {
                file_id: entry.file_id(),
                page_index: entry.page_index(),
            }
            .into());
        };
        self.acquired.swap_remove(position);
        if entry.is_detached() {
            return Ok(());
        }
        self.page_cache.release(entry)
    }

    /// Number of pages of the file as seen by this operation.
    pub fn filled_up_to(&self, file_id: FileId) -> anyhow::Result<u64> {
        let shared = if self.new_files.contains_key(&file_id) {
            0
        } else {
            self.page_cache.write_cache().filled_up_to(file_id)?
        };
        let local = self
            .changes
            .iter()
            .filter(|((id, _), page)| *id == file_id && page.is_new)
            .map(|((_, page_index), _)| page_index + 1)
            .max()
            .unwrap_or(0);
        Ok(shared.max(local))
    }

    pub fn changes(&mut self, entry: &CacheEntry) -> anyhow::Result<ChangesCollector<'_>> {
        self.check_started()?;
        let key = (entry.file_id(), entry.page_index());
        if !self.changes.contains_key(&key) {
            let Some(pointer) = entry.pointer() else {
                return Err(StorageError::InvalidState(format!(
                    "page {} of file {} is not part of the operation",
                    key.1, key.0
                ))
                .into());
            };
            let image = pointer.read().to_vec();
            self.changes.insert(
                key,
                PageChanges {
                    image,
                    operations: Vec::new(),
                    is_new: false,
                },
            );
        }
        let Some(page) = self.changes.get_mut(&key) else {
            return Err(anyhow!("changes of page {} of file {} vanished", key.1, key.0));
        };
        Ok(ChangesCollector {
            key,
            page,
            order: &mut self.order,
        })
    }

    /// Runs a cluster operation now and records it, so it is logged at commit and reverted if
    /// the operation does not commit.
    pub fn apply_component_operation(
        &mut self,
        operation: ComponentOperation,
    ) -> anyhow::Result<()> {
        self.check_started()?;
        let Some(clusters) = &self.clusters else {
            return Err(StorageError::InvalidState(
                "no cluster storage is registered".to_string(),
            )
            .into());
        };
        operation.redo(clusters.as_ref())?;
        self.order.push(Recorded::Component(self.components.len()));
        self.components.push(operation);
        Ok(())
    }

    /// Books an id for a new file. The file is created when the operation commits.
    pub fn add_file(&mut self, name: &str) -> anyhow::Result<FileId> {
        self.check_started()?;
        if self.new_files.values().any(|n| n == name) {
            return Err(anyhow!("file {name} is already added"));
        }
        let file_id = self.page_cache.write_cache().book_file_id(name)?;
        self.new_files.insert(file_id, name.to_string());
        Ok(file_id)
    }

    /// The file is removed once the operation is durably committed.
    pub fn delete_file(&mut self, file_id: FileId) -> anyhow::Result<()> {
        self.check_started()?;
        self.changes.retain(|(id, _), _| *id != file_id);
        self.order.retain(|recorded| match recorded {
            Recorded::Page((id, _), _) => *id != file_id,
            Recorded::Component(_) => true,
        });
        if self.new_files.shift_remove(&file_id).is_none() {
            if !self.page_cache.write_cache().exists_id(file_id) {
                return Err(StorageError::NotFound(format!("file {file_id}")).into());
            }
            self.deleted_files.push(file_id);
        }
        Ok(())
    }

    pub fn file_id(&self, name: &str) -> Option<FileId> {
        if let Some((file_id, _)) = self.new_files.iter().find(|(_, n)| *n == name) {
            return Some(*file_id);
        }
        self.page_cache
            .write_cache()
            .file_id(name)
            .filter(|file_id| !self.deleted_files.contains(file_id))
    }

    pub fn is_file_exists(&self, name: &str) -> bool {
        self.file_id(name).is_some()
    }

    /// Metadata travels with the end record of the operation.
    pub fn add_metadata(&mut self, name: &str, value: Vec<u8>) {
        self.metadata.retain(|(n, _)| n != name);
        self.metadata.push((name.to_string(), value));
    }

    pub fn metadata(&self, name: &str) -> Option<&[u8]> {
        self.metadata
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, value)| value.as_slice())
    }

    /// Takes the component lock for the rest of the operation.
    pub fn acquire_exclusive_lock(&mut self, component: &str) -> anyhow::Result<()> {
        self.check_started()?;
        self.locks.acquire_exclusive(component, self.unit)?;
        Ok(())
    }

    fn has_changes(&self) -> bool {
        !self.order.is_empty()
            || !self.new_files.is_empty()
            || !self.deleted_files.is_empty()
            || !self.metadata.is_empty()
    }

    /// Logs every recorded operation, applies the pages to the shared cache and writes the end
    /// record. Returns the LSN of the end record, `None` when there was nothing to log.
    ///
    /// On failure the operation is rolled back, compensated if needed, and has no visible effect.
    pub fn commit_changes(&mut self, wal: &dyn WriteAheadLog) -> anyhow::Result<Option<Lsn>> {
        self.check_started()?;
        self.state = OperationState::Committing;
        let barrier = self.commit_barrier.clone();
        let _barrier = barrier.read();
        self.release_outstanding();

        if !self.has_changes() {
            self.finish(OperationState::Committed)?;
            return Ok(None);
        }

        let end = match self.log_and_apply(wal) {
            Ok(end) => end,
            Err(err) => {
                log::debug!("atomic_operation_failed unit={} err={err}", self.unit);
                self.undo_components();
                if let Err(reset_err) = self.finish(OperationState::RolledBack) {
                    log::error!(
                        "atomic_operation_cleanup_failed unit={} err={reset_err}",
                        self.unit
                    );
                }
                return Err(err);
            }
        };
        self.finish(OperationState::Committed)?;

        if !self.deleted_files.is_empty() {
            wal.flush_till(end)?;
            let write_cache = self.page_cache.write_cache().clone();
            for file_id in std::mem::take(&mut self.deleted_files) {
                self.page_cache
                    .read_cache()
                    .delete_file(file_id, write_cache.as_ref())?;
            }
        }
        log::trace!("atomic_operation_committed unit={} end={end}", self.unit);
        Ok(Some(end))
    }

    fn log_and_apply(&mut self, wal: &dyn WriteAheadLog) -> anyhow::Result<Lsn> {
        let unit = self.unit;
        let start = wal.log_atomic_operation_start_record(unit)?;
        for (file_id, name) in &self.new_files {
            wal.log(&WalRecord::FileCreated {
                unit,
                file_id: *file_id,
                name: name.clone(),
            })?;
        }
        let mut lsns = Vec::with_capacity(self.order.len());
        for recorded in &self.order {
            let record = match *recorded {
                Recorded::Page((file_id, page_index), i) => WalRecord::Page {
                    unit,
                    file_id,
                    page_index,
                    operation: self.changes[&(file_id, page_index)].operations[i].clone(),
                },
                Recorded::Component(i) => WalRecord::Component {
                    unit,
                    operation: self.components[i].clone(),
                },
            };
            lsns.push(wal.log(&record)?);
        }
        for file_id in &self.deleted_files {
            wal.log(&WalRecord::FileDeleted {
                unit,
                file_id: *file_id,
            })?;
        }

        let mut applied = HashSet::new();
        if let Err(err) = self.apply_pages(&lsns, &mut applied) {
            if let Err(compensation_err) = self.compensate(wal, start, &lsns, &applied) {
                log::error!(
                    "atomic_operation_compensation_failed unit={unit} err={compensation_err}"
                );
            }
            return Err(err);
        }

        wal.log_atomic_operation_end_record(unit, false, Some(start), self.metadata.clone())
    }

    fn apply_pages(
        &mut self,
        lsns: &[Lsn],
        applied: &mut HashSet<PageKey>,
    ) -> anyhow::Result<()> {
        let write_cache = self.page_cache.write_cache().clone();
        for (file_id, name) in &self.new_files {
            write_cache.add_file(name, Some(*file_id))?;
        }

        let mut bounds: IndexMap<PageKey, (Lsn, Lsn)> = IndexMap::new();
        for (recorded, lsn) in self.order.iter().zip(lsns) {
            if let Recorded::Page(key, _) = recorded {
                bounds
                    .entry(*key)
                    .and_modify(|(_, last)| *last = *lsn)
                    .or_insert((*lsn, *lsn));
            }
        }

        for (key, (first, last)) in bounds {
            let entry = load_for_commit(&mut self.page_cache, key)?;
            let operations = &self.changes[&key].operations;
            let result = apply_to_entry(&entry, operations.iter(), first, last);
            if result.is_ok() {
                entry.mark_dirty();
                applied.insert(key);
            }
            self.page_cache.release(entry)?;
            result?;
        }
        Ok(())
    }

    /// Logs the inverse of every logged page operation in reverse order and reverts the pages
    /// that were already applied, then closes the unit as rolled back.
    fn compensate(
        &mut self,
        wal: &dyn WriteAheadLog,
        start: Lsn,
        lsns: &[Lsn],
        applied: &HashSet<PageKey>,
    ) -> anyhow::Result<()> {
        let unit = self.unit;
        let logged = &self.order[..lsns.len()];
        for recorded in logged.iter().rev() {
            let Recorded::Page(key, i) = *recorded else {
                continue;
            };
            let inverse = self.changes[&key].operations[i].inverse();
            let lsn = wal.log(&WalRecord::Page {
                unit,
                file_id: key.0,
                page_index: key.1,
                operation: inverse.clone(),
            })?;
            if !applied.contains(&key) {
                continue;
            }
            let entry = load_for_commit(&mut self.page_cache, key)?;
            let result = apply_to_entry(&entry, std::iter::once(&inverse), lsn, lsn);
            if result.is_ok() {
                entry.mark_dirty();
            }
            self.page_cache.release(entry)?;
            result?;
        }
        wal.log_atomic_operation_end_record(unit, true, Some(start), vec![])?;
        Ok(())
    }

    fn undo_components(&mut self) {
        let Some(clusters) = &self.clusters else {
            return;
        };
        for operation in self.components.iter().rev() {
            if let Err(err) = operation.undo(clusters.as_ref()) {
                log::error!("component_undo_failed unit={} err={err}", self.unit);
            }
        }
        self.components.clear();
    }

    fn release_outstanding(&mut self) {
        if self.acquired.is_empty() {
            return;
        }
        log::warn!(
            "atomic_operation_pages_not_released unit={} count={}",
            self.unit,
            self.acquired.len()
        );
        for entry in std::mem::take(&mut self.acquired) {
            if entry.is_detached() {
                continue;
            }
            if let Err(err) = self.page_cache.release(entry) {
                log::error!("page_release_failed unit={} err={err}", self.unit);
            }
        }
    }

    /// Ends the operation: local pages go back to the shared cache, locks are released and files
    /// created by a failed commit are removed.
    fn finish(&mut self, state: OperationState) -> anyhow::Result<()> {
        self.release_outstanding();
        let result = self.page_cache.reset();
        if state == OperationState::RolledBack {
            let write_cache = self.page_cache.write_cache().clone();
            for (file_id, _) in std::mem::take(&mut self.new_files) {
                if write_cache.exists_id(file_id) {
                    if let Err(err) = self
                        .page_cache
                        .read_cache()
                        .delete_file(file_id, write_cache.as_ref())
                    {
                        log::error!("created_file_cleanup_failed file_id={file_id} err={err}");
                    }
                }
            }
        }
        self.changes.clear();
        self.order.clear();
        self.locks.release_all(self.unit);
        self.state = state;
        result
    }

    /// Discards every change and writes a rolled back unit to the log.
    pub fn rollback(&mut self, wal: &dyn WriteAheadLog) -> anyhow::Result<()> {
        self.check_started()?;
        self.state = OperationState::RollingBack;
        self.undo_components();
        self.new_files.clear();
        self.deleted_files.clear();
        let result = self.finish(OperationState::RolledBack);

        let start = wal.log_atomic_operation_start_record(self.unit)?;
        wal.log_atomic_operation_end_record(self.unit, true, Some(start), vec![])?;
        log::trace!("atomic_operation_rolled_back unit={}", self.unit);
        result
    }
}

/// Loads a page for commit, growing the file until it exists.
fn load_for_commit(page_cache: &mut LocalPageCache, key: PageKey) -> anyhow::Result<CacheEntry> {
    let (file_id, page_index) = key;
    if let Some(entry) = page_cache.load(file_id, page_index, false, 1)? {
        return Ok(entry);
    }
    loop {
        let entry = page_cache.allocate_new_page(file_id)?;
        if entry.page_index() == page_index {
            return Ok(entry);
        }
        let allocated = entry.page_index();
        page_cache.release(entry)?;
        if allocated > page_index {
            return Err(anyhow!(
                "page {page_index} of file {file_id} was allocated as {allocated}"
            ));
        }
    }
}

/// Replays operations on the shared page. The page is only changed when all of them apply.
fn apply_to_entry<'a>(
    entry: &CacheEntry,
    operations: impl Iterator<Item = &'a PageOperation>,
    first: Lsn,
    last: Lsn,
) -> anyhow::Result<()> {
    let Some(pointer) = entry.pointer() else {
        return Err(anyhow!("page {} has no shared buffer", entry.page_index()));
    };
    let mut guard = pointer.write();
    let mut image = guard.to_vec();
    for operation in operations {
        operation.redo(&mut image)?;
    }
    set_page_lsn(&mut image, last);
    guard.copy_from_slice(&image);
    pointer.mark_dirty_since(first);
    Ok(())
}

impl PageSource for AtomicOperation {
    fn load_page(
        &mut self,
        file_id: FileId,
        page_index: u64,
    ) -> anyhow::Result<Option<CacheEntry>> {
        AtomicOperation::load_page(self, file_id, page_index, false, 1)
    }

    fn read_page<'a>(&'a self, entry: &'a CacheEntry) -> anyhow::Result<PageRef<'a>> {
        let key = (entry.file_id(), entry.page_index());
        if let Some(page) = self.changes.get(&key) {
            return Ok(PageRef::Local(&page.image));
        }
        let Some(pointer) = entry.pointer() else {
            return Err(StorageError::InvalidState(format!(
                "page {} of file {} is not part of the operation",
                key.1, key.0
            ))
            .into());
        };
        Ok(PageRef::Shared(pointer.read()))
    }

    fn release_page(&mut self, entry: CacheEntry) -> anyhow::Result<()> {
        AtomicOperation::release_page(self, entry)
    }

    fn filled_up_to(&self, file_id: FileId) -> anyhow::Result<u64> {
        AtomicOperation::filled_up_to(self, file_id)
    }
}

impl Drop for AtomicOperation {
    fn drop(&mut self) {
        if self.state != OperationState::Started {
            return;
        }
        log::warn!("atomic_operation_abandoned unit={}", self.unit);
        self.undo_components();
        self.new_files.clear();
        if let Err(err) = self.finish(OperationState::RolledBack) {
            log::error!("atomic_operation_cleanup_failed unit={} err={err}", self.unit);
        }
    }
}
