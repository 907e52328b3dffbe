mod disk;
mod memory;
mod record;

pub use disk::DiskWal;
pub use memory::MemoryWal;
pub use record::WalRecord;
pub(crate) use record::{frame_size_from_header, WalDecodeResult, MIN_FRAME_SIZE};

use crate::id::{Lsn, OperationUnitId};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// When log records are forced to disk.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WalFlushPolicy {
    /// Every atomic unit end record is fsynced before the commit returns.
    Sync,
    /// Records are fsynced when the buffer fills up, on explicit flush, and before the pages they
    /// describe are written.
    Buffered,
}

/// Append-only log of atomic units. LSNs handed out by `log` strictly increase.
///
/// Once an I/O error happens the instance is poisoned and every following call fails with
/// [`crate::StorageError::WalFailed`].
pub trait WriteAheadLog: Send + Sync {
    fn log(&self, record: &WalRecord) -> anyhow::Result<Lsn>;

    fn log_atomic_operation_start_record(&self, unit: OperationUnitId) -> anyhow::Result<Lsn> {
        self.log(&WalRecord::AtomicUnitStart { unit })
    }

    fn log_atomic_operation_end_record(
        &self,
        unit: OperationUnitId,
        rollback: bool,
        start_lsn: Option<Lsn>,
        metadata: Vec<(String, Vec<u8>)>,
    ) -> anyhow::Result<Lsn> {
        self.log(&WalRecord::AtomicUnitEnd {
            unit,
            rollback,
            start_lsn,
            metadata,
        })
    }

    fn log_full_checkpoint_start(&self, next_unit_id: u64) -> anyhow::Result<Lsn> {
        self.log(&WalRecord::FullCheckpointStart { next_unit_id })
    }

    fn log_full_checkpoint_end(&self, start: Lsn) -> anyhow::Result<Lsn> {
        self.log(&WalRecord::FullCheckpointEnd { start })
    }

    fn log_fuzzy_checkpoint_start(
        &self,
        redo_start: Option<Lsn>,
        next_unit_id: u64,
    ) -> anyhow::Result<Lsn> {
        self.log(&WalRecord::FuzzyCheckpointStart {
            redo_start,
            next_unit_id,
        })
    }

    fn log_fuzzy_checkpoint_end(&self, start: Lsn) -> anyhow::Result<Lsn> {
        self.log(&WalRecord::FuzzyCheckpointEnd { start })
    }

    /// LSN of the first record still stored, `None` when the log is empty.
    fn begin(&self) -> anyhow::Result<Option<Lsn>>;

    /// LSN of the last record logged, `None` when the log is empty.
    fn end(&self) -> Option<Lsn>;

    fn read(&self, lsn: Lsn) -> anyhow::Result<Option<WalRecord>>;

    /// LSN of the record following the one at `lsn`.
    fn next(&self, lsn: Lsn) -> anyhow::Result<Option<Lsn>>;

    fn flush(&self) -> anyhow::Result<()>;

    /// Makes every record up to and including `lsn` durable.
    fn flush_till(&self, lsn: Lsn) -> anyhow::Result<()>;

    /// LSN of the last durable record.
    fn flushed_lsn(&self) -> Option<Lsn>;

    /// Removes whole non-active segments whose records all precede `lsn`. Cut limits are honored.
    /// Returns whether anything was removed.
    fn cut_till(&self, lsn: Lsn) -> anyhow::Result<bool>;

    fn cut_limits(&self) -> &Arc<CutLimits>;

    fn add_cut_till_limit(&self, lsn: Lsn) {
        self.cut_limits().add(lsn);
    }

    fn remove_cut_till_limit(&self, lsn: Lsn) {
        self.cut_limits().remove(lsn);
    }

    /// Keeps every record from `lsn` on for as long as the guard lives.
    fn prevent_cut_till(&self, lsn: Lsn) -> CutTillGuard {
        self.cut_limits().add(lsn);
        CutTillGuard {
            limits: self.cut_limits().clone(),
            lsn,
        }
    }

    /// LSN of the end record of the last completed checkpoint.
    fn last_checkpoint(&self) -> Option<Lsn>;

    /// Closes the active segment and starts a new one, returns the new segment number.
    fn new_segment(&self) -> anyhow::Result<u64>;

    /// Segments before the active one, starting at `from_segment`.
    fn non_active_segments(&self, from_segment: u64) -> Vec<u64>;

    fn active_segment(&self) -> u64;

    fn close(&self) -> anyhow::Result<()>;
}

/// Counted set of LSNs below which the log must not be cut.
#[derive(Default)]
pub struct CutLimits {
    limits: Mutex<BTreeMap<Lsn, usize>>,
}

impl CutLimits {
    pub fn add(&self, lsn: Lsn) {
        *self.limits.lock().entry(lsn).or_insert(0) += 1;
    }

    pub fn remove(&self, lsn: Lsn) {
        let mut limits = self.limits.lock();
        if let Some(count) = limits.get_mut(&lsn) {
            *count -= 1;
            if *count == 0 {
                limits.remove(&lsn);
            }
        }
    }

    pub fn min(&self) -> Option<Lsn> {
        self.limits.lock().keys().next().copied()
    }

    /// The LSN a cut requested up to `lsn` can actually go to.
    pub(crate) fn bound(&self, lsn: Lsn) -> Lsn {
        match self.min() {
            Some(limit) if limit < lsn => limit,
            _ => lsn,
        }
    }
}

pub struct CutTillGuard {
    limits: Arc<CutLimits>,
    lsn: Lsn,
}

impl CutTillGuard {
    pub fn lsn(&self) -> Lsn {
        self.lsn
    }
}

impl Drop for CutTillGuard {
    fn drop(&mut self) {
        self.limits.remove(self.lsn);
    }
}

/// Iterates the log forward starting at `from`.
pub(crate) fn iterate_from(
    wal: &dyn WriteAheadLog,
    from: Option<Lsn>,
) -> impl Iterator<Item = anyhow::Result<(Lsn, WalRecord)>> + '_ {
    let mut next = from;
    std::iter::from_fn(move || {
        let lsn = next?;
        let result = (|| -> anyhow::Result<Option<(Lsn, WalRecord)>> {
            let record = wal.read(lsn)?;
            next = wal.next(lsn)?;
            Ok(record.map(|record| (lsn, record)))
        })();
        match result {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                next = None;
                None
            }
            Err(err) => {
                next = None;
                Some(Err(err))
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cut_limits_are_counted() {
        let limits = CutLimits::default();
        let lsn = |v| Lsn::new(v).unwrap();
        limits.add(lsn(100));
        limits.add(lsn(100));
        limits.add(lsn(200));
        assert_eq!(lsn(100), limits.bound(lsn(300)));
        assert_eq!(lsn(50), limits.bound(lsn(50)));

        limits.remove(lsn(100));
        assert_eq!(Some(lsn(100)), limits.min());
        limits.remove(lsn(100));
        assert_eq!(Some(lsn(200)), limits.min());
        limits.remove(lsn(200));
        assert_eq!(None, limits.min());
    }
}
