use crate::cache::{CacheEntry, ReadCache, WriteCache};
use crate::co::{ClusterStorage, ComponentOperation};
use crate::id::{FileId, Lsn, OperationUnitId};
use crate::page::{page_lsn, set_page_lsn};
use crate::po::PageOperation;
use crate::wal::{iterate_from, WalRecord, WriteAheadLog};
use anyhow::{anyhow, Context};
use indexmap::IndexMap;

#[derive(Debug)]
pub(crate) struct RecoveryResult {
    pub(crate) next_unit_id: u64,
    pub(crate) redone: usize,
    pub(crate) rolled_back_units: usize,
}

/// Records of a unit that may have to be undone, in log order.
#[derive(Default)]
struct UnitLog {
    undoable: Vec<(Lsn, WalRecord)>,
    components: Vec<ComponentOperation>,
    deleted_files: Vec<FileId>,
}

struct Recovery<'a> {
    wal: &'a dyn WriteAheadLog,
    read_cache: &'a dyn ReadCache,
    write_cache: &'a dyn WriteCache,
    clusters: Option<&'a dyn ClusterStorage>,
    units: IndexMap<OperationUnitId, UnitLog>,
    next_unit_id: u64,
    redone: usize,
}

/// Brings the page files back to the state of the last completed atomic operations.
///
/// The log is replayed forward from the redo start of the last checkpoint, repeating history for
/// every unit. Units without an end record are then undone in reverse order, each undo being
/// logged as a compensation record, so running recovery again replays the undo instead of
/// repeating it.
pub(crate) fn recover(
    wal: &dyn WriteAheadLog,
    read_cache: &dyn ReadCache,
    write_cache: &dyn WriteCache,
    clusters: Option<&dyn ClusterStorage>,
) -> anyhow::Result<RecoveryResult> {
    let mut recovery = Recovery {
        wal,
        read_cache,
        write_cache,
        clusters,
        units: IndexMap::new(),
        next_unit_id: 1,
        redone: 0,
    };

    let start = recovery.analyze()?;
    log::debug!("recovery_redo_started start={start:?}");
    recovery.redo(start)?;
    log::debug!(
        "recovery_redo_finished redone={} incomplete={}",
        recovery.redone,
        recovery.units.len()
    );

    let rolled_back_units = recovery.units.len();
    recovery.undo()?;
    wal.flush()?;
    log::debug!("recovery_finished rolled_back_units={rolled_back_units}");

    Ok(RecoveryResult {
        next_unit_id: recovery.next_unit_id,
        redone: recovery.redone,
        rolled_back_units,
    })
}

impl Recovery<'_> {
    /// Finds where replay starts.
    fn analyze(&mut self) -> anyhow::Result<Option<Lsn>> {
        let begin = self.wal.begin()?;
        let Some(checkpoint) = self.wal.last_checkpoint() else {
            return Ok(begin);
        };

        let start = match self.wal.read(checkpoint)? {
            Some(WalRecord::FullCheckpointEnd { start })
            | Some(WalRecord::FuzzyCheckpointEnd { start }) => start,
            record => {
                log::warn!("recovery_checkpoint_unreadable lsn={checkpoint} record={record:?}");
                return Ok(begin);
            }
        };
        let redo_start = match self.wal.read(start)? {
            Some(WalRecord::FullCheckpointStart { next_unit_id }) => {
                self.next_unit_id = self.next_unit_id.max(next_unit_id);
                start
            }
            Some(WalRecord::FuzzyCheckpointStart {
                redo_start,
                next_unit_id,
            }) => {
                self.next_unit_id = self.next_unit_id.max(next_unit_id);
                redo_start.unwrap_or(start).min(start)
            }
            record => {
                log::warn!("recovery_checkpoint_unreadable lsn={start} record={record:?}");
                return Ok(begin);
            }
        };
        log::debug!("recovery_checkpoint_found end={checkpoint} start={start} redo={redo_start}");

        Ok(match begin {
            Some(begin) if begin > redo_start => Some(begin),
            _ => Some(redo_start),
        })
    }

    fn see_unit(&mut self, unit: OperationUnitId) {
        self.next_unit_id = self.next_unit_id.max(unit.get() + 1);
    }

    fn redo(&mut self, start: Option<Lsn>) -> anyhow::Result<()> {
        let wal = self.wal;
        for item in iterate_from(wal, start) {
            let (lsn, record) = item?;
            log::trace!("recovery_redo lsn={lsn} record={record:?}");
            if let Some(unit) = record.unit() {
                self.see_unit(unit);
            }

            match record {
                WalRecord::AtomicUnitStart { unit } => {
                    self.units.insert(unit, UnitLog::default());
                }
                WalRecord::AtomicUnitEnd { unit, rollback, .. } => {
                    let log = self.units.shift_remove(&unit).unwrap_or_default();
                    if rollback {
                        self.remove_created_files(&log)?;
                    } else {
                        self.finish_committed(unit, log)?;
                    }
                }
                WalRecord::FileCreated {
                    unit,
                    file_id,
                    ref name,
                } => {
                    if !self.write_cache.exists_id(file_id) {
                        self.write_cache
                            .add_file(name, Some(file_id))
                            .with_context(|| format!("cannot recreate file {name}"))?;
                    }
                    self.units
                        .entry(unit)
                        .or_default()
                        .undoable
                        .push((lsn, record));
                }
                WalRecord::FileDeleted { unit, file_id } => {
                    self.units.entry(unit).or_default().deleted_files.push(file_id);
                }
                WalRecord::Page {
                    unit,
                    file_id,
                    page_index,
                    ref operation,
                } => {
                    if self.redo_page(lsn, file_id, page_index, operation)? {
                        self.redone += 1;
                    }
                    self.units
                        .entry(unit)
                        .or_default()
                        .undoable
                        .push((lsn, record));
                }
                WalRecord::Component { unit, operation } => {
                    self.units.entry(unit).or_default().components.push(operation);
                }
                WalRecord::FullCheckpointStart { next_unit_id }
                | WalRecord::FuzzyCheckpointStart { next_unit_id, .. } => {
                    self.next_unit_id = self.next_unit_id.max(next_unit_id);
                }
                WalRecord::FullCheckpointEnd { .. }
                | WalRecord::FuzzyCheckpointEnd { .. }
                | WalRecord::Empty => (),
            }
        }
        Ok(())
    }

    /// Cluster operations and file deletions are only replayed once the unit is known to be
    /// committed.
    fn finish_committed(&mut self, unit: OperationUnitId, log: UnitLog) -> anyhow::Result<()> {
        if !log.components.is_empty() {
            let Some(clusters) = self.clusters else {
                return Err(anyhow!(
                    "unit {unit} holds cluster operations but no cluster storage is registered"
                ));
            };
            for operation in &log.components {
                operation.redo(clusters)?;
            }
        }
        for file_id in log.deleted_files {
            if self.write_cache.exists_id(file_id) {
                self.read_cache.delete_file(file_id, self.write_cache)?;
            }
        }
        Ok(())
    }

    fn remove_created_files(&self, log: &UnitLog) -> anyhow::Result<()> {
        for (_, record) in &log.undoable {
            if let WalRecord::FileCreated { file_id, .. } = record {
                if self.write_cache.exists_id(*file_id) {
                    self.read_cache.delete_file(*file_id, self.write_cache)?;
                }
            }
        }
        Ok(())
    }

    /// Returns whether the page needed the record.
    fn redo_page(
        &self,
        lsn: Lsn,
        file_id: FileId,
        page_index: u64,
        operation: &PageOperation,
    ) -> anyhow::Result<bool> {
        if !self.write_cache.exists_id(file_id) {
            log::trace!("recovery_redo_skipped file_id={file_id} reason=deleted");
            return Ok(false);
        }

        let entry = self.load_or_allocate(file_id, page_index)?;
        let result = apply(&entry, lsn, operation, true).with_context(|| {
            format!("cannot redo record {lsn} on page {page_index} of file {file_id}")
        });
        self.read_cache.release(entry, self.write_cache)?;
        result
    }

    fn load_or_allocate(&self, file_id: FileId, page_index: u64) -> anyhow::Result<CacheEntry> {
        if let Some(entry) = self
            .read_cache
            .load(file_id, page_index, false, self.write_cache, 1)?
        {
            return Ok(entry);
        }
        loop {
            let entry = self.read_cache.allocate_new_page(file_id, self.write_cache)?;
            let allocated = entry.page_index();
            if allocated == page_index {
                return Ok(entry);
            }
            self.read_cache.release(entry, self.write_cache)?;
            if allocated > page_index {
                return Err(anyhow!(
                    "page {page_index} of file {file_id} was allocated as {allocated}"
                ));
            }
        }
    }

    /// Undoes every unit without an end record, newest record first.
    fn undo(&mut self) -> anyhow::Result<()> {
        let units = std::mem::take(&mut self.units);
        let mut pending = units
            .iter()
            .flat_map(|(unit, log)| {
                log.undoable
                    .iter()
                    .map(move |(lsn, record)| (*lsn, *unit, record))
            })
            .collect::<Vec<_>>();
        pending.sort_by(|a, b| b.0.cmp(&a.0));

        for (lsn, unit, record) in pending {
            log::trace!("recovery_undo unit={unit} lsn={lsn}");
            match record {
                WalRecord::Page {
                    file_id,
                    page_index,
                    operation,
                    ..
                } => {
                    if !self.write_cache.exists_id(*file_id) {
                        continue;
                    }
                    let inverse = operation.inverse();
                    let clr = self.wal.log(&WalRecord::Page {
                        unit,
                        file_id: *file_id,
                        page_index: *page_index,
                        operation: inverse.clone(),
                    })?;
                    let entry = self.load_or_allocate(*file_id, *page_index)?;
                    let result = apply(&entry, clr, &inverse, false).with_context(|| {
                        format!("cannot undo record {lsn} on page {page_index} of file {file_id}")
                    });
                    self.read_cache.release(entry, self.write_cache)?;
                    result?;
                }
                WalRecord::FileCreated { file_id, .. } => {
                    if self.write_cache.exists_id(*file_id) {
                        self.read_cache.delete_file(*file_id, self.write_cache)?;
                    }
                }
                _ => (),
            }
        }

        for (unit, log) in units {
            if let Some(clusters) = self.clusters {
                for operation in log.components.iter().rev() {
                    operation.undo(clusters)?;
                }
            }
            self.wal
                .log_atomic_operation_end_record(unit, true, None, vec![])?;
            log::debug!("recovery_unit_rolled_back unit={unit}");
        }
        Ok(())
    }
}

/// Applies `operation` and stamps the page with `lsn`. During redo a page already carrying the
/// record is left untouched.
fn apply(
    entry: &CacheEntry,
    lsn: Lsn,
    operation: &PageOperation,
    skip_applied: bool,
) -> anyhow::Result<bool> {
    let Some(pointer) = entry.pointer() else {
        return Err(anyhow!("page {} has no shared buffer", entry.page_index()));
    };
    let mut page = pointer.write();
    if skip_applied && page_lsn(&page).is_some_and(|page_lsn| page_lsn >= lsn) {
        return Ok(false);
    }
    operation.redo(&mut page)?;
    set_page_lsn(&mut page, lsn);
    pointer.mark_dirty_since(lsn);
    drop(page);
    entry.mark_dirty();
    Ok(true)
}
