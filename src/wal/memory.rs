use super::{CutLimits, WalRecord, WriteAheadLog};
use crate::id::Lsn;
use anyhow::anyhow;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

const FIRST_LSN: u64 = 32;

/// WAL kept in memory: LSNs and segments behave as on disk, nothing survives the process.
pub struct MemoryWal {
    cut_limits: Arc<CutLimits>,
    internal: Mutex<MemoryWalInternal>,
}

struct MemoryWalInternal {
    records: BTreeMap<Lsn, WalRecord>,
    /// segment number to its first lsn
    segments: BTreeMap<u64, u64>,
    active: u64,
    next: u64,
    last_checkpoint: Option<Lsn>,
}

impl Default for MemoryWal {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryWal {
    pub fn new() -> Self {
        Self {
            cut_limits: Arc::new(CutLimits::default()),
            internal: Mutex::new(MemoryWalInternal {
                records: BTreeMap::new(),
                segments: BTreeMap::from([(1, FIRST_LSN)]),
                active: 1,
                next: FIRST_LSN,
                last_checkpoint: None,
            }),
        }
    }

    fn append(internal: &mut MemoryWalInternal, record: &WalRecord) -> anyhow::Result<Lsn> {
        let size = record.encode().len() as u64;
        let lsn = Lsn::new(internal.next).ok_or_else(|| anyhow!("zero lsn"))?;
        internal.next += size;
        internal.records.insert(lsn, record.clone());
        if record.is_checkpoint_end() {
            internal.last_checkpoint = Some(lsn);
        }
        Ok(lsn)
    }
}

impl WriteAheadLog for MemoryWal {
    fn log(&self, record: &WalRecord) -> anyhow::Result<Lsn> {
        let lsn = Self::append(&mut self.internal.lock(), record)?;
        log::trace!("wal_appended lsn={lsn}");
        Ok(lsn)
    }

    fn begin(&self) -> anyhow::Result<Option<Lsn>> {
        Ok(self.internal.lock().records.keys().next().copied())
    }

    fn end(&self) -> Option<Lsn> {
        self.internal.lock().records.keys().next_back().copied()
    }

    fn read(&self, lsn: Lsn) -> anyhow::Result<Option<WalRecord>> {
        Ok(self.internal.lock().records.get(&lsn).cloned())
    }

    fn next(&self, lsn: Lsn) -> anyhow::Result<Option<Lsn>> {
        let internal = self.internal.lock();
        Ok(internal
            .records
            .range((Bound::Excluded(lsn), Bound::Unbounded))
            .next()
            .map(|(lsn, _)| *lsn))
    }

    fn flush(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn flush_till(&self, _: Lsn) -> anyhow::Result<()> {
        Ok(())
    }

    fn flushed_lsn(&self) -> Option<Lsn> {
        self.end()
    }

    fn cut_till(&self, lsn: Lsn) -> anyhow::Result<bool> {
        let bound = self.cut_limits.bound(lsn).get();
        let mut internal = self.internal.lock();
        let starts = internal.segments.iter().map(|(n, s)| (*n, *s)).collect::<Vec<_>>();
        let mut removed = false;
        for window in starts.windows(2) {
            let (number, _) = window[0];
            let (_, next_start) = window[1];
            if number == internal.active || next_start > bound {
                break;
            }
            let Some(split) = Lsn::new(next_start) else {
                break;
            };
            internal.segments.remove(&number);
            internal.records = internal.records.split_off(&split);
            removed = true;
        }
        Ok(removed)
    }

    fn cut_limits(&self) -> &Arc<CutLimits> {
        &self.cut_limits
    }

    fn last_checkpoint(&self) -> Option<Lsn> {
        self.internal.lock().last_checkpoint
    }

    fn new_segment(&self) -> anyhow::Result<u64> {
        let mut internal = self.internal.lock();
        if internal.segments[&internal.active] == internal.next {
            Self::append(&mut internal, &WalRecord::Empty)?;
        }
        let number = internal.active + 1;
        let start = internal.next;
        internal.segments.insert(number, start);
        internal.active = number;
        Self::append(&mut internal, &WalRecord::Empty)?;
        Ok(number)
    }

    fn non_active_segments(&self, from_segment: u64) -> Vec<u64> {
        let internal = self.internal.lock();
        internal
            .segments
            .range(from_segment..)
            .map(|(number, _)| *number)
            .filter(|number| *number != internal.active)
            .collect()
    }

    fn active_segment(&self) -> u64 {
        self.internal.lock().active
    }

    fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
