//! Null buckets hold the value(s) associated with the null key, outside of the ordered tree.
//!
//! Single-value layout: `[marker u32][present u8][rid]`.
//! Multi-value layout: `[marker u32][set id u64][embedded count u32][total size u32][rid]*`,
//! embedded rids are kept sorted.

use crate::bins::SliceExt;
use crate::id::Rid;
use crate::page::PAGE_PAYLOAD_OFFSET;
use anyhow::anyhow;

pub(crate) const NULL_BUCKET_PAGE: u64 = 0;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NullBucketKind {
    Single,
    Multi,
}

impl NullBucketKind {
    pub(crate) fn marker(self) -> u32 {
        match self {
            NullBucketKind::Single => 0x4e55_4c31,
            NullBucketKind::Multi => 0x4e55_4c32,
        }
    }

    pub(crate) fn from_marker(marker: u32) -> anyhow::Result<Self> {
        match marker {
            0x4e55_4c31 => Ok(NullBucketKind::Single),
            0x4e55_4c32 => Ok(NullBucketKind::Multi),
            _ => Err(anyhow!("page is not a null bucket, marker {marker:#x}")),
        }
    }
}

const MARKER_OFFSET: usize = PAGE_PAYLOAD_OFFSET;

const PRESENT_OFFSET: usize = PAGE_PAYLOAD_OFFSET + 4;
const SINGLE_RID_OFFSET: usize = PAGE_PAYLOAD_OFFSET + 5;
const SINGLE_END: usize = SINGLE_RID_OFFSET + Rid::SIZE;

const MID_OFFSET: usize = PAGE_PAYLOAD_OFFSET + 4;
const EMBEDDED_COUNT_OFFSET: usize = PAGE_PAYLOAD_OFFSET + 12;
const TOTAL_SIZE_OFFSET: usize = PAGE_PAYLOAD_OFFSET + 16;
const RIDS_OFFSET: usize = PAGE_PAYLOAD_OFFSET + 20;

/// Number of rids a multi-value null bucket page can embed.
pub(crate) fn page_capacity(page_size: usize) -> usize {
    (page_size - RIDS_OFFSET) / Rid::SIZE
}

fn header_end(kind: NullBucketKind) -> usize {
    match kind {
        NullBucketKind::Single => SINGLE_END,
        NullBucketKind::Multi => RIDS_OFFSET,
    }
}

pub(crate) struct NullBucketRead<'a> {
    buff: &'a [u8],
}

impl<'a> NullBucketRead<'a> {
    pub(crate) fn new(buff: &'a [u8], kind: NullBucketKind) -> anyhow::Result<Self> {
        let found = NullBucketKind::from_marker(buff[MARKER_OFFSET..].read_u32())?;
        if found != kind {
            return Err(anyhow!("expected {kind:?} null bucket, found {found:?}"));
        }
        Ok(Self { buff })
    }

    pub(crate) fn value(&self) -> Option<Rid> {
        if self.buff[PRESENT_OFFSET] == 0 {
            None
        } else {
            Some(Rid::decode(&self.buff[SINGLE_RID_OFFSET..]))
        }
    }

    pub(crate) fn mid(&self) -> u64 {
        self.buff[MID_OFFSET..].read_u64()
    }

    pub(crate) fn embedded_count(&self) -> usize {
        self.buff[EMBEDDED_COUNT_OFFSET..].read_u32() as usize
    }

    pub(crate) fn size(&self) -> u32 {
        self.buff[TOTAL_SIZE_OFFSET..].read_u32()
    }

    pub(crate) fn rid(&self, index: usize) -> Rid {
        Rid::decode(&self.buff[RIDS_OFFSET + index * Rid::SIZE..])
    }

    pub(crate) fn rids(&self) -> Vec<Rid> {
        (0..self.embedded_count()).map(|i| self.rid(i)).collect()
    }

    /// Binary search among the embedded rids.
    pub(crate) fn search(&self, rid: &Rid) -> Result<usize, usize> {
        let (mut lo, mut hi) = (0, self.embedded_count());
        while lo < hi {
            let mid = (lo + hi) / 2;
            match self.rid(mid).cmp(rid) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Ok(mid),
            }
        }
        Err(lo)
    }
}

pub(crate) struct NullBucketWrite<'a> {
    buff: &'a mut [u8],
}

impl<'a> NullBucketWrite<'a> {
    pub(crate) fn new(buff: &'a mut [u8]) -> Self {
        Self { buff }
    }

    pub(crate) fn init(&mut self, kind: NullBucketKind) -> anyhow::Result<()> {
        if self.buff[MARKER_OFFSET..header_end(kind)]
            .iter()
            .any(|b| *b != 0)
        {
            return Err(anyhow!("null bucket is already initialized"));
        }
        self.buff[MARKER_OFFSET..MARKER_OFFSET + 4].copy_from_slice(&kind.marker().to_be_bytes());
        Ok(())
    }

    pub(crate) fn clear(&mut self, kind: NullBucketKind) -> anyhow::Result<()> {
        let bucket = NullBucketRead::new(self.buff, kind)?;
        let is_empty = match kind {
            NullBucketKind::Single => bucket.value().is_none(),
            NullBucketKind::Multi => {
                bucket.embedded_count() == 0 && bucket.size() == 0 && bucket.mid() == 0
            }
        };
        if !is_empty {
            return Err(anyhow!("only an empty null bucket can be cleared"));
        }
        self.buff[MARKER_OFFSET..header_end(kind)].fill(0);
        Ok(())
    }

    pub(crate) fn set_value(&mut self, expected: Option<Rid>, rid: Rid) -> anyhow::Result<()> {
        let current = NullBucketRead::new(self.buff, NullBucketKind::Single)?.value();
        if current != expected {
            return Err(anyhow!("null value is {current:?}, expected {expected:?}"));
        }
        self.buff[PRESENT_OFFSET] = 1;
        rid.encode(&mut self.buff[SINGLE_RID_OFFSET..SINGLE_END]);
        Ok(())
    }

    pub(crate) fn remove_value(&mut self, expected: Rid) -> anyhow::Result<()> {
        let current = NullBucketRead::new(self.buff, NullBucketKind::Single)?.value();
        if current != Some(expected) {
            return Err(anyhow!("null value is {current:?}, expected {expected}"));
        }
        self.buff[PRESENT_OFFSET..SINGLE_END].fill(0);
        Ok(())
    }

    pub(crate) fn add_rid(&mut self, index: usize, rid: Rid) -> anyhow::Result<()> {
        let bucket = NullBucketRead::new(self.buff, NullBucketKind::Multi)?;
        let count = bucket.embedded_count();
        if index > count {
            return Err(anyhow!("null bucket index {index} out of bounds, count is {count}"));
        }
        if count >= page_capacity(self.buff.len()) {
            return Err(anyhow!("null bucket page is full"));
        }
        let start = RIDS_OFFSET + index * Rid::SIZE;
        let end = RIDS_OFFSET + count * Rid::SIZE;
        self.buff.copy_within(start..end, start + Rid::SIZE);
        rid.encode(&mut self.buff[start..start + Rid::SIZE]);
        self.set_embedded_count(count + 1);
        Ok(())
    }

    pub(crate) fn remove_rid(&mut self, index: usize, rid: Rid) -> anyhow::Result<()> {
        let bucket = NullBucketRead::new(self.buff, NullBucketKind::Multi)?;
        let count = bucket.embedded_count();
        if index >= count || bucket.rid(index) != rid {
            return Err(anyhow!("rid {rid} is not stored at null bucket index {index}"));
        }
        let start = RIDS_OFFSET + index * Rid::SIZE;
        let end = RIDS_OFFSET + count * Rid::SIZE;
        self.buff.copy_within(start + Rid::SIZE..end, start);
        self.buff[end - Rid::SIZE..end].fill(0);
        self.set_embedded_count(count - 1);
        Ok(())
    }

    fn set_embedded_count(&mut self, count: usize) {
        self.buff[EMBEDDED_COUNT_OFFSET..EMBEDDED_COUNT_OFFSET + 4]
            .copy_from_slice(&(count as u32).to_be_bytes());
    }

    pub(crate) fn add_size(&mut self, delta: i32) -> anyhow::Result<()> {
        let size = NullBucketRead::new(self.buff, NullBucketKind::Multi)?.size();
        let Some(size) = size.checked_add_signed(delta) else {
            return Err(anyhow!("null bucket size {size} cannot change by {delta}"));
        };
        self.buff[TOTAL_SIZE_OFFSET..TOTAL_SIZE_OFFSET + 4].copy_from_slice(&size.to_be_bytes());
        Ok(())
    }

    pub(crate) fn set_mid(&mut self, expected: u64, mid: u64) -> anyhow::Result<()> {
        let current = NullBucketRead::new(self.buff, NullBucketKind::Multi)?.mid();
        if current != expected {
            return Err(anyhow!("null bucket set id is {current}, expected {expected}"));
        }
        self.buff[MID_OFFSET..MID_OFFSET + 8].copy_from_slice(&mid.to_be_bytes());
        Ok(())
    }
}
