use super::record::{frame_size_from_header, WalDecodeResult, MIN_FRAME_SIZE};
use super::{CutLimits, WalFlushPolicy, WalRecord, WriteAheadLog};
use crate::bins::SliceExt;
use crate::error::StorageError;
use crate::id::Lsn;
use crate::page::MAXIMUM_PAGE_SIZE;
use anyhow::{anyhow, Context};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const SEGMENT_HEADER_SIZE: u64 = 32;
const SEGMENT_MAGIC: &[u8; 8] = b"cellwal\0";
const BUFFER_LIMIT: usize = MAXIMUM_PAGE_SIZE * 16;

/// WAL stored as a sequence of segment files `<name>.<segment>.wal`.
///
/// The LSN of a record is its offset in the log address space: segment `n` starts where segment
/// `n - 1` ends, and every segment begins with a 32 byte header, so LSN zero is never used.
/// Records never span segments.
pub struct DiskWal {
    dir: PathBuf,
    name: String,
    flush_policy: WalFlushPolicy,
    segment_size: u64,
    cut_limits: Arc<CutLimits>,
    failed: AtomicBool,
    internal: Mutex<DiskWalInternal>,
}

struct DiskWalInternal {
    /// segment number to the offset of its header
    segments: BTreeMap<u64, u64>,
    active: u64,
    active_file: File,
    /// bytes of the active segment already written, header included
    active_written: u64,
    buffer: Vec<u8>,

    next: u64,
    last_lsn: Option<Lsn>,
    flushed_lsn: Option<Lsn>,
    last_checkpoint: Option<Lsn>,
}

struct SegmentHeader {
    segment: u64,
    start: u64,
}

impl SegmentHeader {
    fn encode(&self) -> [u8; SEGMENT_HEADER_SIZE as usize] {
        let mut buff = [0u8; SEGMENT_HEADER_SIZE as usize];
        buff[0..8].copy_from_slice(SEGMENT_MAGIC);
        buff[8..16].copy_from_slice(&self.segment.to_be_bytes());
        buff[16..24].copy_from_slice(&self.start.to_be_bytes());
        let checksum = crc64::crc64(0x1d0f, &buff[0..24]);
        buff[24..32].copy_from_slice(&checksum.to_be_bytes());
        buff
    }

    fn decode(buff: &[u8]) -> Option<Self> {
        if buff.len() < SEGMENT_HEADER_SIZE as usize || &buff[0..8] != SEGMENT_MAGIC {
            return None;
        }
        let stored_checksum = buff[24..].read_u64();
        if stored_checksum != crc64::crc64(0x1d0f, &buff[0..24]) {
            return None;
        }
        Some(Self {
            segment: buff[8..].read_u64(),
            start: buff[16..].read_u64(),
        })
    }
}

fn segment_path(dir: &Path, name: &str, segment: u64) -> PathBuf {
    dir.join(format!("{name}.{segment}.wal"))
}

fn create_segment(dir: &Path, name: &str, segment: u64, start: u64) -> anyhow::Result<File> {
    let path = segment_path(dir, name, segment);
    let f = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(&path)
        .with_context(|| format!("cannot create wal segment {path:?}"))?;
    f.write_all_at(&SegmentHeader { segment, start }.encode(), 0)?;
    f.sync_all()?;
    log::debug!("wal_segment_created segment={segment} start={start}");
    Ok(f)
}

struct ScannedSegment {
    number: u64,
    start: u64,
    file: File,
    valid_len: u64,
}

impl DiskWal {
    pub fn open(
        dir: &Path,
        name: &str,
        flush_policy: WalFlushPolicy,
        segment_size: u64,
    ) -> anyhow::Result<Self> {
        std::fs::create_dir_all(dir)?;

        let mut numbers = Vec::new();
        let prefix = format!("{name}.");
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            let Some(number) = file_name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(".wal"))
                .and_then(|number| number.parse::<u64>().ok())
            else {
                continue;
            };
            numbers.push(number);
        }
        numbers.sort_unstable();

        let mut scanned: Vec<ScannedSegment> = Vec::with_capacity(numbers.len());
        let mut last_lsn = None;
        let mut last_checkpoint = None;
        let segment_count = numbers.len();
        for (i, number) in numbers.into_iter().enumerate() {
            let is_last = i + 1 == segment_count;
            let path = segment_path(dir, name, number);
            let file = OpenOptions::new().read(true).write(true).open(&path)?;
            let mut content = Vec::new();
            std::io::Read::read_to_end(&mut &file, &mut content)?;

            let Some(header) = SegmentHeader::decode(&content) else {
                if is_last && !scanned.is_empty() {
                    log::warn!("wal_segment_header_torn segment={number}, removing it");
                    drop(file);
                    std::fs::remove_file(&path)?;
                    continue;
                }
                return Err(anyhow!("wal segment {path:?} has a corrupted header"));
            };
            if header.segment != number {
                return Err(anyhow!(
                    "wal segment {path:?} claims to be segment {}",
                    header.segment
                ));
            }
            if let Some(prev) = scanned.last() {
                if prev.start + prev.valid_len != header.start {
                    return Err(anyhow!(
                        "wal segment {number} does not continue segment {}",
                        prev.number
                    ));
                }
            }

            let mut offset = SEGMENT_HEADER_SIZE as usize;
            loop {
                match WalRecord::decode(&content[offset..]) {
                    WalDecodeResult::Ok(record, size) => {
                        let lsn = Lsn::new(header.start + offset as u64)
                            .ok_or_else(|| anyhow!("zero lsn"))?;
                        if record.is_checkpoint_end() {
                            last_checkpoint = Some(lsn);
                        }
                        last_lsn = Some(lsn);
                        offset += size;
                    }
                    WalDecodeResult::NeedMoreBytes | WalDecodeResult::Incomplete => break,
                    WalDecodeResult::Err(err) => return Err(err),
                }
            }

            if offset < content.len() {
                if !is_last {
                    return Err(anyhow!(
                        "wal segment {number} has {} undecodable bytes",
                        content.len() - offset
                    ));
                }
                log::warn!(
                    "wal_torn_tail segment={number} valid={offset} found={}, truncating",
                    content.len()
                );
                file.set_len(offset as u64)?;
                file.sync_all()?;
            }

            scanned.push(ScannedSegment {
                number,
                start: header.start,
                file,
                valid_len: offset as u64,
            });
        }

        let active = match scanned.pop() {
            Some(active) => active,
            None => {
                let number = 1;
                ScannedSegment {
                    number,
                    start: 0,
                    file: create_segment(dir, name, number, 0)?,
                    valid_len: SEGMENT_HEADER_SIZE,
                }
            }
        };

        let mut segments: BTreeMap<u64, u64> =
            scanned.iter().map(|s| (s.number, s.start)).collect();
        segments.insert(active.number, active.start);

        log::debug!(
            "wal_opened segments={} active={} last_lsn={last_lsn:?} last_checkpoint={last_checkpoint:?}",
            segments.len(),
            active.number,
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            name: name.to_string(),
            flush_policy,
            segment_size,
            cut_limits: Arc::new(CutLimits::default()),
            failed: AtomicBool::new(false),
            internal: Mutex::new(DiskWalInternal {
                segments,
                active: active.number,
                active_file: active.file,
                active_written: active.valid_len,
                buffer: Vec::with_capacity(BUFFER_LIMIT),
                next: active.start + active.valid_len,
                last_lsn,
                flushed_lsn: last_lsn,
                last_checkpoint,
            }),
        })
    }

    fn check(&self) -> anyhow::Result<()> {
        if self.failed.load(Ordering::SeqCst) {
            return Err(StorageError::WalFailed.into());
        }
        Ok(())
    }

    fn poison_on_error<T>(&self, result: anyhow::Result<T>) -> anyhow::Result<T> {
        if let Err(err) = &result {
            log::error!("wal_failed err={err}");
            self.failed.store(true, Ordering::SeqCst);
        }
        result
    }

    fn flush_buffer(internal: &mut DiskWalInternal) -> anyhow::Result<()> {
        if internal.buffer.is_empty() {
            return Ok(());
        }
        internal
            .active_file
            .write_all_at(&internal.buffer, internal.active_written)?;
        internal.active_file.sync_data()?;
        internal.active_written += internal.buffer.len() as u64;
        internal.buffer.clear();
        internal.flushed_lsn = internal.last_lsn;
        log::trace!(
            "wal_flushed segment={} flushed_lsn={:?}",
            internal.active,
            internal.flushed_lsn
        );
        Ok(())
    }

    fn active_start(internal: &DiskWalInternal) -> u64 {
        internal.segments[&internal.active]
    }

    fn active_is_empty(internal: &DiskWalInternal) -> bool {
        internal.next == Self::active_start(internal) + SEGMENT_HEADER_SIZE
    }

    fn start_segment(&self, internal: &mut DiskWalInternal) -> anyhow::Result<u64> {
        Self::flush_buffer(internal)?;
        let number = internal.active + 1;
        let start = internal.next;
        let file = create_segment(&self.dir, &self.name, number, start)?;
        internal.segments.insert(number, start);
        internal.active = number;
        internal.active_file = file;
        internal.active_written = SEGMENT_HEADER_SIZE;
        internal.next = start + SEGMENT_HEADER_SIZE;
        Ok(number)
    }

    fn append(&self, internal: &mut DiskWalInternal, record: &WalRecord) -> anyhow::Result<Lsn> {
        let buff = record.encode();
        let used = internal.next - Self::active_start(internal);
        if used + buff.len() as u64 > self.segment_size && !Self::active_is_empty(internal) {
            self.start_segment(internal)?;
        }

        let lsn = Lsn::new(internal.next).ok_or_else(|| anyhow!("zero lsn"))?;
        internal.buffer.extend_from_slice(&buff);
        internal.next += buff.len() as u64;
        internal.last_lsn = Some(lsn);
        if record.is_checkpoint_end() {
            internal.last_checkpoint = Some(lsn);
        }
        log::trace!("wal_appended lsn={lsn} size={}", buff.len());

        let force = self.flush_policy == WalFlushPolicy::Sync
            && matches!(record, WalRecord::AtomicUnitEnd { .. });
        if force || internal.buffer.len() >= BUFFER_LIMIT {
            Self::flush_buffer(internal)?;
        }
        Ok(lsn)
    }

    /// Reads the raw frame stored at `lsn`, `None` when no record starts there.
    fn read_frame(
        internal: &DiskWalInternal,
        dir: &Path,
        name: &str,
        lsn: u64,
    ) -> anyhow::Result<Option<Vec<u8>>> {
        if lsn >= internal.next {
            return Ok(None);
        }

        let flushed_end = Self::active_start(internal) + internal.active_written;
        if lsn >= flushed_end {
            let offset = (lsn - flushed_end) as usize;
            let buff = &internal.buffer[offset..];
            let size = frame_size_from_header(buff)
                .ok_or_else(|| anyhow!("no wal record at lsn {lsn}"))?;
            return Ok(Some(buff[..size].to_vec()));
        }

        let Some((&number, &start)) = internal
            .segments
            .iter()
            .rev()
            .find(|(_, start)| **start <= lsn)
        else {
            // the segment was cut
            return Ok(None);
        };
        if lsn < start + SEGMENT_HEADER_SIZE {
            return Err(anyhow!("lsn {lsn} points into the header of segment {number}"));
        }

        let offset = lsn - start;
        let read = |f: &File| -> anyhow::Result<Vec<u8>> {
            let mut header = [0u8; MIN_FRAME_SIZE];
            f.read_exact_at(&mut header, offset)?;
            let size = frame_size_from_header(&header)
                .ok_or_else(|| anyhow!("no wal record at lsn {lsn}"))?;
            let mut frame = vec![0u8; size];
            f.read_exact_at(&mut frame, offset)?;
            Ok(frame)
        };

        let frame = if number == internal.active {
            read(&internal.active_file)?
        } else {
            let f = File::open(segment_path(dir, name, number))?;
            read(&f)?
        };
        Ok(Some(frame))
    }
}

impl WriteAheadLog for DiskWal {
    fn log(&self, record: &WalRecord) -> anyhow::Result<Lsn> {
        self.check()?;
        let mut internal = self.internal.lock();
        let result = self.append(&mut internal, record);
        self.poison_on_error(result)
    }

    fn begin(&self) -> anyhow::Result<Option<Lsn>> {
        self.check()?;
        let internal = self.internal.lock();
        let Some((&number, &start)) = internal.segments.iter().next() else {
            return Ok(None);
        };
        if number == internal.active && Self::active_is_empty(&internal) {
            return Ok(None);
        }
        Ok(Lsn::new(start + SEGMENT_HEADER_SIZE))
    }

    fn end(&self) -> Option<Lsn> {
        self.internal.lock().last_lsn
    }

    fn read(&self, lsn: Lsn) -> anyhow::Result<Option<WalRecord>> {
        self.check()?;
        let internal = self.internal.lock();
        let Some(frame) = Self::read_frame(&internal, &self.dir, &self.name, lsn.get())? else {
            return Ok(None);
        };
        match WalRecord::decode(&frame) {
            WalDecodeResult::Ok(record, _) => Ok(Some(record)),
            WalDecodeResult::NeedMoreBytes | WalDecodeResult::Incomplete => {
                Err(anyhow!("wal record at lsn {lsn} is corrupted"))
            }
            WalDecodeResult::Err(err) => Err(err),
        }
    }

    fn next(&self, lsn: Lsn) -> anyhow::Result<Option<Lsn>> {
        self.check()?;
        let internal = self.internal.lock();
        let Some(frame) = Self::read_frame(&internal, &self.dir, &self.name, lsn.get())? else {
            return Ok(None);
        };
        let mut next = lsn.get() + frame.len() as u64;
        if next >= internal.next {
            return Ok(None);
        }
        if internal.segments.values().any(|start| *start == next) {
            next += SEGMENT_HEADER_SIZE;
        }
        Ok(Lsn::new(next))
    }

    fn flush(&self) -> anyhow::Result<()> {
        self.check()?;
        let mut internal = self.internal.lock();
        let result = Self::flush_buffer(&mut internal);
        self.poison_on_error(result)
    }

    fn flush_till(&self, lsn: Lsn) -> anyhow::Result<()> {
        self.check()?;
        let mut internal = self.internal.lock();
        if internal.flushed_lsn.is_some_and(|flushed| flushed >= lsn) {
            return Ok(());
        }
        let result = Self::flush_buffer(&mut internal);
        self.poison_on_error(result)
    }

    fn flushed_lsn(&self) -> Option<Lsn> {
        self.internal.lock().flushed_lsn
    }

    fn cut_till(&self, lsn: Lsn) -> anyhow::Result<bool> {
        self.check()?;
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
            std::fs::remove_file(segment_path(&self.dir, &self.name, number))?;
            internal.segments.remove(&number);
            removed = true;
            log::debug!("wal_segment_cut segment={number}");
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
        self.check()?;
        let mut internal = self.internal.lock();
        let result = (|| -> anyhow::Result<u64> {
            if Self::active_is_empty(&internal) {
                self.append(&mut internal, &WalRecord::Empty)?;
            }
            let number = self.start_segment(&mut internal)?;
            self.append(&mut internal, &WalRecord::Empty)?;
            Ok(number)
        })();
        self.poison_on_error(result)
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
        self.flush()?;
        log::debug!("wal_closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{FileId, OperationUnitId};
    use crate::po::PageOperation;

    fn unit(id: u64) -> OperationUnitId {
        OperationUnitId::new(id).unwrap()
    }

    fn page_record(id: u64, len: usize) -> WalRecord {
        WalRecord::Page {
            unit: unit(id),
            file_id: FileId::new(1),
            page_index: id,
            operation: PageOperation::WriteBytes {
                offset: 100,
                new: vec![1; len],
                old: vec![0; len],
            },
        }
    }

    fn collect(wal: &DiskWal) -> Vec<(Lsn, WalRecord)> {
        super::super::iterate_from(wal, wal.begin().unwrap())
            .collect::<anyhow::Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn test_log_and_reopen() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;

        let records = vec![
            WalRecord::AtomicUnitStart { unit: unit(1) },
            page_record(1, 10),
            WalRecord::AtomicUnitEnd {
                unit: unit(1),
                rollback: false,
                start_lsn: Lsn::new(32),
                metadata: vec![],
            },
        ];

        {
            let wal = DiskWal::open(dir.path(), "db", WalFlushPolicy::Sync, 1 << 20)?;
            assert_eq!(None, wal.begin()?);
            let mut lsns = vec![];
            for record in &records {
                lsns.push(wal.log(record)?);
            }
            assert_eq!(32, lsns[0].get());
            assert!(lsns.windows(2).all(|w| w[0] < w[1]));
            assert_eq!(wal.end(), wal.flushed_lsn(), "end record forces a flush");
            assert_eq!(Some(records[1].clone()), wal.read(lsns[1])?);
        }

        let wal = DiskWal::open(dir.path(), "db", WalFlushPolicy::Sync, 1 << 20)?;
        let found = collect(&wal);
        assert_eq!(
            records,
            found.into_iter().map(|(_, r)| r).collect::<Vec<_>>()
        );
        Ok(())
    }

    #[test]
    fn test_segments_and_cut() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let wal = DiskWal::open(dir.path(), "db", WalFlushPolicy::Buffered, 512)?;

        let mut lsns = vec![];
        for i in 1..=40 {
            lsns.push(wal.log(&page_record(i, 50))?);
        }
        wal.flush()?;
        assert!(wal.active_segment() > 3);
        let found = collect(&wal);
        assert_eq!(lsns, found.iter().map(|(lsn, _)| *lsn).collect::<Vec<_>>());

        let guard = wal.prevent_cut_till(lsns[10]);
        assert!(wal.cut_till(lsns[30])?);
        let begin = wal.begin()?.unwrap();
        assert!(begin <= lsns[10]);
        assert!(wal.read(lsns[10])?.is_some());

        drop(guard);
        wal.cut_till(lsns[30])?;
        let begin = wal.begin()?.unwrap();
        assert!(begin > lsns[10] && begin <= lsns[30]);
        assert_eq!(None, wal.read(lsns[0])?);

        let active = wal.active_segment();
        assert!(!wal.non_active_segments(0).contains(&active));
        let new_segment = wal.new_segment()?;
        assert_eq!(active + 1, new_segment);
        assert_eq!(Some(WalRecord::Empty), wal.read(wal.end().unwrap())?);
        Ok(())
    }

    #[test]
    fn test_torn_tail_is_truncated() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let last = {
            let wal = DiskWal::open(dir.path(), "db", WalFlushPolicy::Buffered, 1 << 20)?;
            wal.log(&page_record(1, 10))?;
            let lsn = wal.log_full_checkpoint_start(2)?;
            let last = wal.log_full_checkpoint_end(lsn)?;
            wal.flush()?;
            last
        };

        let path = segment_path(dir.path(), "db", 1);
        let f = OpenOptions::new().write(true).open(&path)?;
        let len = f.metadata()?.len();
        let torn = page_record(2, 30).encode();
        f.write_all_at(&torn[..torn.len() / 2], len)?;
        drop(f);

        let wal = DiskWal::open(dir.path(), "db", WalFlushPolicy::Buffered, 1 << 20)?;
        assert_eq!(Some(last), wal.end());
        assert_eq!(Some(last), wal.last_checkpoint());
        assert_eq!(len, std::fs::metadata(&path)?.len());

        let lsn = wal.log(&page_record(3, 10))?;
        assert_eq!(len, lsn.get());
        assert_eq!(4, collect(&wal).len());
        Ok(())
    }
}
