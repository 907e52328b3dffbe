//! Page operations: physical, page-local deltas recorded by an atomic operation and written to the
//! WAL. Each operation carries enough state to be inverted, and `undo` is defined as the redo of
//! the inverse so both directions share one code path.

use crate::bins::{BuffExt, ByteReader};
use crate::btree::bucket::{self, BucketRead, BucketWrite};
use crate::btree::entry_point::EntryPointWrite;
use crate::btree::null_bucket::{NullBucketKind, NullBucketWrite};
use crate::id::Rid;
use crate::page::PAGE_PAYLOAD_OFFSET;
use anyhow::anyhow;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageOperation {
    WriteBytes {
        offset: u32,
        new: Vec<u8>,
        old: Vec<u8>,
    },

    BucketInit {
        leaf: bool,
    },
    BucketClear {
        leaf: bool,
    },
    BucketSwitchType {
        leaf: bool,
    },
    BucketAddLeafEntry {
        index: u32,
        entry: Vec<u8>,
    },
    BucketRemoveLeafEntry {
        index: u32,
        entry: Vec<u8>,
    },
    BucketAddNonLeafEntry {
        index: u32,
        key: Vec<u8>,
        left: u64,
        right: u64,
        next_left_before: Option<u64>,
    },
    BucketRemoveNonLeafEntry {
        index: u32,
        key: Vec<u8>,
        left: u64,
        right: u64,
        next_left_before: Option<u64>,
    },
    BucketUpdateValue {
        index: u32,
        new: Vec<u8>,
        old: Vec<u8>,
    },
    BucketAppendEntries {
        entries: Vec<Vec<u8>>,
    },
    /// Drops the trailing `removed.len()` entries.
    BucketTruncate {
        removed: Vec<Vec<u8>>,
    },
    BucketSetLeftSibling {
        new: Option<u64>,
        old: Option<u64>,
    },
    BucketSetRightSibling {
        new: Option<u64>,
        old: Option<u64>,
    },

    EntryPointInit {
        version: u32,
    },
    EntryPointClear {
        version: u32,
    },
    EntryPointSetTreeSize {
        new: u64,
        old: u64,
    },
    EntryPointSetEntryId {
        new: u64,
        old: u64,
    },

    NullBucketInit {
        kind: NullBucketKind,
    },
    NullBucketClear {
        kind: NullBucketKind,
    },
    SingleNullSetValue {
        new: Rid,
        old: Option<Rid>,
    },
    SingleNullRemoveValue {
        old: Rid,
    },
    NullAddValue {
        index: u32,
        rid: Rid,
    },
    NullRemoveValue {
        index: u32,
        rid: Rid,
    },
    NullIncrementSize,
    NullDecrementSize,
    NullSetMid {
        new: u64,
        old: u64,
    },
}

const PO_WRITE_BYTES_KIND: u8 = 0;
const PO_BUCKET_INIT_KIND: u8 = 1;
const PO_BUCKET_CLEAR_KIND: u8 = 2;
const PO_BUCKET_SWITCH_TYPE_KIND: u8 = 3;
const PO_BUCKET_ADD_LEAF_ENTRY_KIND: u8 = 4;
const PO_BUCKET_REMOVE_LEAF_ENTRY_KIND: u8 = 5;
const PO_BUCKET_ADD_NON_LEAF_ENTRY_KIND: u8 = 6;
const PO_BUCKET_REMOVE_NON_LEAF_ENTRY_KIND: u8 = 7;
const PO_BUCKET_UPDATE_VALUE_KIND: u8 = 8;
const PO_BUCKET_APPEND_ENTRIES_KIND: u8 = 9;
const PO_BUCKET_TRUNCATE_KIND: u8 = 10;
const PO_BUCKET_SET_LEFT_SIBLING_KIND: u8 = 11;
const PO_BUCKET_SET_RIGHT_SIBLING_KIND: u8 = 12;

const PO_ENTRY_POINT_INIT_KIND: u8 = 20;
const PO_ENTRY_POINT_CLEAR_KIND: u8 = 21;
const PO_ENTRY_POINT_SET_TREE_SIZE_KIND: u8 = 22;
const PO_ENTRY_POINT_SET_ENTRY_ID_KIND: u8 = 23;

const PO_NULL_BUCKET_INIT_KIND: u8 = 30;
const PO_NULL_BUCKET_CLEAR_KIND: u8 = 31;
const PO_SINGLE_NULL_SET_VALUE_KIND: u8 = 32;
const PO_SINGLE_NULL_REMOVE_VALUE_KIND: u8 = 33;
const PO_NULL_ADD_VALUE_KIND: u8 = 34;
const PO_NULL_REMOVE_VALUE_KIND: u8 = 35;
const PO_NULL_INCREMENT_SIZE_KIND: u8 = 36;
const PO_NULL_DECREMENT_SIZE_KIND: u8 = 37;
const PO_NULL_SET_MID_KIND: u8 = 38;

/// Page operation kinds must stay below this bound, the WAL record kind is derived from them.
pub(crate) const PO_KIND_LIMIT: u8 = 64;

fn put_page(buff: &mut Vec<u8>, page: Option<u64>) {
    buff.put_u64(page.unwrap_or(u64::MAX));
}

fn get_page(reader: &mut ByteReader) -> anyhow::Result<Option<u64>> {
    let page = reader.get_u64()?;
    Ok(if page == u64::MAX { None } else { Some(page) })
}

fn put_rid(buff: &mut Vec<u8>, rid: &Rid) {
    buff.put_i16(rid.cluster_id);
    buff.put_i64(rid.cluster_position);
}

fn get_rid(reader: &mut ByteReader) -> anyhow::Result<Rid> {
    let cluster_id = reader.get_i16()?;
    let cluster_position = reader.get_i64()?;
    Ok(Rid::new(cluster_id, cluster_position))
}

fn put_entries(buff: &mut Vec<u8>, entries: &[Vec<u8>]) {
    buff.put_u32(entries.len() as u32);
    for entry in entries {
        buff.put_bytes(entry);
    }
}

fn get_entries(reader: &mut ByteReader) -> anyhow::Result<Vec<Vec<u8>>> {
    let count = reader.get_u32()? as usize;
    let mut entries = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        entries.push(reader.get_bytes()?);
    }
    Ok(entries)
}

fn put_kind(buff: &mut Vec<u8>, kind: NullBucketKind) {
    buff.put_u32(kind.marker());
}

fn get_kind(reader: &mut ByteReader) -> anyhow::Result<NullBucketKind> {
    NullBucketKind::from_marker(reader.get_u32()?)
}

impl PageOperation {
    pub(crate) fn kind(&self) -> u8 {
        match self {
            PageOperation::WriteBytes { .. } => PO_WRITE_BYTES_KIND,
            PageOperation::BucketInit { .. } => PO_BUCKET_INIT_KIND,
            PageOperation::BucketClear { .. } => PO_BUCKET_CLEAR_KIND,
            PageOperation::BucketSwitchType { .. } => PO_BUCKET_SWITCH_TYPE_KIND,
            PageOperation::BucketAddLeafEntry { .. } => PO_BUCKET_ADD_LEAF_ENTRY_KIND,
            PageOperation::BucketRemoveLeafEntry { .. } => PO_BUCKET_REMOVE_LEAF_ENTRY_KIND,
            PageOperation::BucketAddNonLeafEntry { .. } => PO_BUCKET_ADD_NON_LEAF_ENTRY_KIND,
            PageOperation::BucketRemoveNonLeafEntry { .. } => PO_BUCKET_REMOVE_NON_LEAF_ENTRY_KIND,
            PageOperation::BucketUpdateValue { .. } => PO_BUCKET_UPDATE_VALUE_KIND,
            PageOperation::BucketAppendEntries { .. } => PO_BUCKET_APPEND_ENTRIES_KIND,
            PageOperation::BucketTruncate { .. } => PO_BUCKET_TRUNCATE_KIND,
            PageOperation::BucketSetLeftSibling { .. } => PO_BUCKET_SET_LEFT_SIBLING_KIND,
            PageOperation::BucketSetRightSibling { .. } => PO_BUCKET_SET_RIGHT_SIBLING_KIND,
            PageOperation::EntryPointInit { .. } => PO_ENTRY_POINT_INIT_KIND,
            PageOperation::EntryPointClear { .. } => PO_ENTRY_POINT_CLEAR_KIND,
            PageOperation::EntryPointSetTreeSize { .. } => PO_ENTRY_POINT_SET_TREE_SIZE_KIND,
            PageOperation::EntryPointSetEntryId { .. } => PO_ENTRY_POINT_SET_ENTRY_ID_KIND,
            PageOperation::NullBucketInit { .. } => PO_NULL_BUCKET_INIT_KIND,
            PageOperation::NullBucketClear { .. } => PO_NULL_BUCKET_CLEAR_KIND,
            PageOperation::SingleNullSetValue { .. } => PO_SINGLE_NULL_SET_VALUE_KIND,
            PageOperation::SingleNullRemoveValue { .. } => PO_SINGLE_NULL_REMOVE_VALUE_KIND,
            PageOperation::NullAddValue { .. } => PO_NULL_ADD_VALUE_KIND,
            PageOperation::NullRemoveValue { .. } => PO_NULL_REMOVE_VALUE_KIND,
            PageOperation::NullIncrementSize => PO_NULL_INCREMENT_SIZE_KIND,
            PageOperation::NullDecrementSize => PO_NULL_DECREMENT_SIZE_KIND,
            PageOperation::NullSetMid { .. } => PO_NULL_SET_MID_KIND,
        }
    }

    pub(crate) fn encode(&self, buff: &mut Vec<u8>) {
        match self {
            PageOperation::WriteBytes { offset, new, old } => {
                buff.put_u32(*offset);
                buff.put_bytes(new);
                buff.put_bytes(old);
            }
            PageOperation::BucketInit { leaf }
            | PageOperation::BucketClear { leaf }
            | PageOperation::BucketSwitchType { leaf } => buff.put_u8(*leaf as u8),
            PageOperation::BucketAddLeafEntry { index, entry }
            | PageOperation::BucketRemoveLeafEntry { index, entry } => {
                buff.put_u32(*index);
                buff.put_bytes(entry);
            }
            PageOperation::BucketAddNonLeafEntry {
                index,
                key,
                left,
                right,
                next_left_before,
            }
            | PageOperation::BucketRemoveNonLeafEntry {
                index,
                key,
                left,
                right,
                next_left_before,
            } => {
                buff.put_u32(*index);
                buff.put_bytes(key);
                buff.put_u64(*left);
                buff.put_u64(*right);
                put_page(buff, *next_left_before);
            }
            PageOperation::BucketUpdateValue { index, new, old } => {
                buff.put_u32(*index);
                buff.put_bytes(new);
                buff.put_bytes(old);
            }
            PageOperation::BucketAppendEntries { entries } => put_entries(buff, entries),
            PageOperation::BucketTruncate { removed } => put_entries(buff, removed),
            PageOperation::BucketSetLeftSibling { new, old }
            | PageOperation::BucketSetRightSibling { new, old } => {
                put_page(buff, *new);
                put_page(buff, *old);
            }
            PageOperation::EntryPointInit { version }
            | PageOperation::EntryPointClear { version } => buff.put_u32(*version),
            PageOperation::EntryPointSetTreeSize { new, old }
            | PageOperation::EntryPointSetEntryId { new, old }
            | PageOperation::NullSetMid { new, old } => {
                buff.put_u64(*new);
                buff.put_u64(*old);
            }
            PageOperation::NullBucketInit { kind } | PageOperation::NullBucketClear { kind } => {
                put_kind(buff, *kind)
            }
            PageOperation::SingleNullSetValue { new, old } => {
                put_rid(buff, new);
                match old {
                    Some(old) => {
                        buff.put_u8(1);
                        put_rid(buff, old);
                    }
                    None => buff.put_u8(0),
                }
            }
            PageOperation::SingleNullRemoveValue { old } => put_rid(buff, old),
            PageOperation::NullAddValue { index, rid }
            | PageOperation::NullRemoveValue { index, rid } => {
                buff.put_u32(*index);
                put_rid(buff, rid);
            }
            PageOperation::NullIncrementSize | PageOperation::NullDecrementSize => (),
        }
    }

    pub(crate) fn decode(kind: u8, reader: &mut ByteReader) -> anyhow::Result<Self> {
        let operation = match kind {
            PO_WRITE_BYTES_KIND => PageOperation::WriteBytes {
                offset: reader.get_u32()?,
                new: reader.get_bytes()?,
                old: reader.get_bytes()?,
            },
            PO_BUCKET_INIT_KIND => PageOperation::BucketInit {
                leaf: reader.get_bool()?,
            },
            PO_BUCKET_CLEAR_KIND => PageOperation::BucketClear {
                leaf: reader.get_bool()?,
            },
            PO_BUCKET_SWITCH_TYPE_KIND => PageOperation::BucketSwitchType {
                leaf: reader.get_bool()?,
            },
            PO_BUCKET_ADD_LEAF_ENTRY_KIND => PageOperation::BucketAddLeafEntry {
                index: reader.get_u32()?,
                entry: reader.get_bytes()?,
            },
            PO_BUCKET_REMOVE_LEAF_ENTRY_KIND => PageOperation::BucketRemoveLeafEntry {
                index: reader.get_u32()?,
                entry: reader.get_bytes()?,
            },
            PO_BUCKET_ADD_NON_LEAF_ENTRY_KIND => PageOperation::BucketAddNonLeafEntry {
                index: reader.get_u32()?,
                key: reader.get_bytes()?,
                left: reader.get_u64()?,
                right: reader.get_u64()?,
                next_left_before: get_page(reader)?,
            },
            PO_BUCKET_REMOVE_NON_LEAF_ENTRY_KIND => PageOperation::BucketRemoveNonLeafEntry {
                index: reader.get_u32()?,
                key: reader.get_bytes()?,
                left: reader.get_u64()?,
                right: reader.get_u64()?,
                next_left_before: get_page(reader)?,
            },
            PO_BUCKET_UPDATE_VALUE_KIND => PageOperation::BucketUpdateValue {
                index: reader.get_u32()?,
                new: reader.get_bytes()?,
                old: reader.get_bytes()?,
            },
            PO_BUCKET_APPEND_ENTRIES_KIND => PageOperation::BucketAppendEntries {
                entries: get_entries(reader)?,
            },
            PO_BUCKET_TRUNCATE_KIND => PageOperation::BucketTruncate {
                removed: get_entries(reader)?,
            },
            PO_BUCKET_SET_LEFT_SIBLING_KIND => PageOperation::BucketSetLeftSibling {
                new: get_page(reader)?,
                old: get_page(reader)?,
            },
            PO_BUCKET_SET_RIGHT_SIBLING_KIND => PageOperation::BucketSetRightSibling {
                new: get_page(reader)?,
                old: get_page(reader)?,
            },
            PO_ENTRY_POINT_INIT_KIND => PageOperation::EntryPointInit {
                version: reader.get_u32()?,
            },
            PO_ENTRY_POINT_CLEAR_KIND => PageOperation::EntryPointClear {
                version: reader.get_u32()?,
            },
            PO_ENTRY_POINT_SET_TREE_SIZE_KIND => PageOperation::EntryPointSetTreeSize {
                new: reader.get_u64()?,
                old: reader.get_u64()?,
            },
            PO_ENTRY_POINT_SET_ENTRY_ID_KIND => PageOperation::EntryPointSetEntryId {
                new: reader.get_u64()?,
                old: reader.get_u64()?,
            },
            PO_NULL_BUCKET_INIT_KIND => PageOperation::NullBucketInit {
                kind: get_kind(reader)?,
            },
            PO_NULL_BUCKET_CLEAR_KIND => PageOperation::NullBucketClear {
                kind: get_kind(reader)?,
            },
            PO_SINGLE_NULL_SET_VALUE_KIND => {
                let new = get_rid(reader)?;
                let old = if reader.get_bool()? {
                    Some(get_rid(reader)?)
                } else {
                    None
                };
                PageOperation::SingleNullSetValue { new, old }
            }
            PO_SINGLE_NULL_REMOVE_VALUE_KIND => PageOperation::SingleNullRemoveValue {
                old: get_rid(reader)?,
            },
            PO_NULL_ADD_VALUE_KIND => PageOperation::NullAddValue {
                index: reader.get_u32()?,
                rid: get_rid(reader)?,
            },
            PO_NULL_REMOVE_VALUE_KIND => PageOperation::NullRemoveValue {
                index: reader.get_u32()?,
                rid: get_rid(reader)?,
            },
            PO_NULL_INCREMENT_SIZE_KIND => PageOperation::NullIncrementSize,
            PO_NULL_DECREMENT_SIZE_KIND => PageOperation::NullDecrementSize,
            PO_NULL_SET_MID_KIND => PageOperation::NullSetMid {
                new: reader.get_u64()?,
                old: reader.get_u64()?,
            },
            _ => return Err(anyhow!("invalid page operation kind {kind}")),
        };
        Ok(operation)
    }

    /// Returns the operation that reverts this one.
    pub fn inverse(&self) -> PageOperation {
        match self.clone() {
            PageOperation::WriteBytes { offset, new, old } => PageOperation::WriteBytes {
                offset,
                new: old,
                old: new,
            },
            PageOperation::BucketInit { leaf } => PageOperation::BucketClear { leaf },
            PageOperation::BucketClear { leaf } => PageOperation::BucketInit { leaf },
            PageOperation::BucketSwitchType { leaf } => {
                PageOperation::BucketSwitchType { leaf: !leaf }
            }
            PageOperation::BucketAddLeafEntry { index, entry } => {
                PageOperation::BucketRemoveLeafEntry { index, entry }
            }
            PageOperation::BucketRemoveLeafEntry { index, entry } => {
                PageOperation::BucketAddLeafEntry { index, entry }
            }
            PageOperation::BucketAddNonLeafEntry {
                index,
                key,
                left,
                right,
                next_left_before,
            } => PageOperation::BucketRemoveNonLeafEntry {
                index,
                key,
                left,
                right,
                next_left_before,
            },
            PageOperation::BucketRemoveNonLeafEntry {
                index,
                key,
                left,
                right,
                next_left_before,
            } => PageOperation::BucketAddNonLeafEntry {
                index,
                key,
                left,
                right,
                next_left_before,
            },
            PageOperation::BucketUpdateValue { index, new, old } => {
                PageOperation::BucketUpdateValue {
                    index,
                    new: old,
                    old: new,
                }
            }
            PageOperation::BucketAppendEntries { entries } => {
                PageOperation::BucketTruncate { removed: entries }
            }
            PageOperation::BucketTruncate { removed } => {
                PageOperation::BucketAppendEntries { entries: removed }
            }
            PageOperation::BucketSetLeftSibling { new, old } => {
                PageOperation::BucketSetLeftSibling { new: old, old: new }
            }
            PageOperation::BucketSetRightSibling { new, old } => {
                PageOperation::BucketSetRightSibling { new: old, old: new }
            }
            PageOperation::EntryPointInit { version } => PageOperation::EntryPointClear { version },
            PageOperation::EntryPointClear { version } => PageOperation::EntryPointInit { version },
            PageOperation::EntryPointSetTreeSize { new, old } => {
                PageOperation::EntryPointSetTreeSize { new: old, old: new }
            }
            PageOperation::EntryPointSetEntryId { new, old } => {
                PageOperation::EntryPointSetEntryId { new: old, old: new }
            }
            PageOperation::NullBucketInit { kind } => PageOperation::NullBucketClear { kind },
            PageOperation::NullBucketClear { kind } => PageOperation::NullBucketInit { kind },
            PageOperation::SingleNullSetValue { new, old } => match old {
                Some(old) => PageOperation::SingleNullSetValue {
                    new: old,
                    old: Some(new),
                },
                None => PageOperation::SingleNullRemoveValue { old: new },
            },
            PageOperation::SingleNullRemoveValue { old } => {
                PageOperation::SingleNullSetValue { new: old, old: None }
            }
            PageOperation::NullAddValue { index, rid } => {
                PageOperation::NullRemoveValue { index, rid }
            }
            PageOperation::NullRemoveValue { index, rid } => {
                PageOperation::NullAddValue { index, rid }
            }
            PageOperation::NullIncrementSize => PageOperation::NullDecrementSize,
            PageOperation::NullDecrementSize => PageOperation::NullIncrementSize,
            PageOperation::NullSetMid { new, old } => {
                PageOperation::NullSetMid { new: old, old: new }
            }
        }
    }

    pub fn undo(&self, page: &mut [u8]) -> anyhow::Result<()> {
        self.inverse().redo(page)
    }

    pub fn redo(&self, page: &mut [u8]) -> anyhow::Result<()> {
        match self {
            PageOperation::WriteBytes { offset, new, old } => {
                let offset = *offset as usize;
                if offset < PAGE_PAYLOAD_OFFSET || offset + new.len() > page.len() {
                    return Err(anyhow!(
                        "write of {} bytes at offset {offset} is outside of the page payload",
                        new.len()
                    ));
                }
                if new.len() != old.len() || page[offset..offset + old.len()] != old[..] {
                    return Err(anyhow!("page content at offset {offset} does not match"));
                }
                page[offset..offset + new.len()].copy_from_slice(new);
            }

            PageOperation::BucketInit { leaf } => BucketWrite::new(page).init(*leaf)?,
            PageOperation::BucketClear { leaf } => BucketWrite::new(page).clear(*leaf)?,
            PageOperation::BucketSwitchType { leaf } => {
                BucketWrite::new(page).switch_type(*leaf)?
            }
            PageOperation::BucketAddLeafEntry { index, entry } => {
                if !BucketRead::new(page).is_leaf() {
                    return Err(anyhow!("cannot add a leaf entry to a non-leaf bucket"));
                }
                BucketWrite::new(page).insert(*index as usize, entry)?;
            }
            PageOperation::BucketRemoveLeafEntry { index, entry } => {
                let removed = BucketWrite::new(page).remove(*index as usize)?;
                if removed != *entry {
                    return Err(anyhow!("removed leaf entry does not match the logged one"));
                }
            }
            PageOperation::BucketAddNonLeafEntry {
                index,
                key,
                left,
                right,
                next_left_before,
            } => {
                let index = *index as usize;
                let bucket = BucketRead::new(page);
                if bucket.is_leaf() {
                    return Err(anyhow!("cannot add a non-leaf entry to a leaf bucket"));
                }
                let next_left = (index < bucket.size()).then(|| bucket.left_child(index));
                if next_left != *next_left_before {
                    return Err(anyhow!("left child of the next entry does not match"));
                }
                let mut bucket = BucketWrite::new(page);
                bucket.insert(index, &bucket::non_leaf_entry(key, *left, *right))?;
                if next_left.is_some() {
                    bucket.set_left_child(index + 1, *right);
                }
            }
            PageOperation::BucketRemoveNonLeafEntry {
                index,
                key,
                left,
                right,
                next_left_before,
            } => {
                let index = *index as usize;
                let mut bucket = BucketWrite::new(page);
                let removed = bucket.remove(index)?;
                if removed != bucket::non_leaf_entry(key, *left, *right) {
                    return Err(anyhow!("removed non-leaf entry does not match the logged one"));
                }
                if let Some(next_left) = next_left_before {
                    bucket.set_left_child(index, *next_left);
                }
            }
            PageOperation::BucketUpdateValue { index, new, old } => {
                let index = *index as usize;
                let bucket = BucketRead::new(page);
                if !bucket.is_leaf() || index >= bucket.size() {
                    return Err(anyhow!("no leaf entry at index {index}"));
                }
                if bucket.value(index) != &old[..] {
                    return Err(anyhow!("value at index {index} does not match"));
                }
                let raw = bucket::leaf_entry(bucket.key(index), new);
                BucketWrite::new(page).replace(index, &raw)?;
            }
            PageOperation::BucketAppendEntries { entries } => {
                BucketWrite::new(page).append(entries)?
            }
            PageOperation::BucketTruncate { removed } => {
                let size = BucketRead::new(page).size();
                if size < removed.len() {
                    return Err(anyhow!("bucket has only {size} entries"));
                }
                let actual = BucketWrite::new(page).truncate(size - removed.len())?;
                if actual != *removed {
                    return Err(anyhow!("truncated entries do not match the logged ones"));
                }
            }
            PageOperation::BucketSetLeftSibling { new, old } => {
                if BucketRead::new(page).left_sibling() != *old {
                    return Err(anyhow!("left sibling does not match"));
                }
                BucketWrite::new(page).set_left_sibling(*new);
            }
            PageOperation::BucketSetRightSibling { new, old } => {
                if BucketRead::new(page).right_sibling() != *old {
                    return Err(anyhow!("right sibling does not match"));
                }
                BucketWrite::new(page).set_right_sibling(*new);
            }

            PageOperation::EntryPointInit { version } => EntryPointWrite::new(page).init(*version)?,
            PageOperation::EntryPointClear { version } => {
                EntryPointWrite::new(page).clear(*version)?
            }
            PageOperation::EntryPointSetTreeSize { new, old } => {
                EntryPointWrite::new(page).set_tree_size(*old, *new)?
            }
            PageOperation::EntryPointSetEntryId { new, old } => {
                EntryPointWrite::new(page).set_entry_id(*old, *new)?
            }

            PageOperation::NullBucketInit { kind } => NullBucketWrite::new(page).init(*kind)?,
            PageOperation::NullBucketClear { kind } => NullBucketWrite::new(page).clear(*kind)?,
            PageOperation::SingleNullSetValue { new, old } => {
                NullBucketWrite::new(page).set_value(*old, *new)?
            }
            PageOperation::SingleNullRemoveValue { old } => {
                NullBucketWrite::new(page).remove_value(*old)?
            }
            PageOperation::NullAddValue { index, rid } => {
                NullBucketWrite::new(page).add_rid(*index as usize, *rid)?
            }
            PageOperation::NullRemoveValue { index, rid } => {
                NullBucketWrite::new(page).remove_rid(*index as usize, *rid)?
            }
            PageOperation::NullIncrementSize => NullBucketWrite::new(page).add_size(1)?,
            PageOperation::NullDecrementSize => NullBucketWrite::new(page).add_size(-1)?,
            PageOperation::NullSetMid { new, old } => {
                NullBucketWrite::new(page).set_mid(*old, *new)?
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::bucket::leaf_entry;

    const PAGE_SIZE: usize = 4096;

    fn apply_all(page: &mut [u8], ops: &[PageOperation]) {
        for op in ops {
            op.redo(page).unwrap();
        }
    }

    /// Applies `ops` on top of `setup`, then undoes them in reverse order and expects the page to
    /// be byte-identical to the state right after `setup`.
    fn check_round_trip(setup: &[PageOperation], ops: &[PageOperation]) {
        let mut page = vec![0u8; PAGE_SIZE];
        apply_all(&mut page, setup);
        let before = page.clone();

        apply_all(&mut page, ops);
        assert_ne!(before, page, "operations should change the page");

        for op in ops.iter().rev() {
            op.undo(&mut page).unwrap();
        }
        assert_eq!(before, page);

        for op in ops {
            let mut buff = Vec::new();
            op.encode(&mut buff);
            let mut reader = ByteReader::new(&buff);
            let decoded = PageOperation::decode(op.kind(), &mut reader).unwrap();
            reader.finish().unwrap();
            assert_eq!(op, &decoded);
        }
    }

    #[test]
    fn test_bucket_operations_round_trip() {
        let setup = vec![
            PageOperation::BucketInit { leaf: true },
            PageOperation::BucketAddLeafEntry {
                index: 0,
                entry: leaf_entry(b"b", b"2"),
            },
            PageOperation::BucketAddLeafEntry {
                index: 1,
                entry: leaf_entry(b"d", b"4"),
            },
        ];
        let ops = vec![
            PageOperation::BucketAddLeafEntry {
                index: 1,
                entry: leaf_entry(b"c", b"3"),
            },
            PageOperation::BucketUpdateValue {
                index: 0,
                new: b"a much longer value".to_vec(),
                old: b"2".to_vec(),
            },
            PageOperation::BucketRemoveLeafEntry {
                index: 2,
                entry: leaf_entry(b"d", b"4"),
            },
            PageOperation::BucketSetRightSibling {
                new: Some(7),
                old: None,
            },
            PageOperation::BucketSetLeftSibling {
                new: Some(3),
                old: None,
            },
            PageOperation::BucketTruncate {
                removed: vec![leaf_entry(b"c", b"3")],
            },
            PageOperation::BucketAppendEntries {
                entries: vec![leaf_entry(b"x", b"9"), leaf_entry(b"y", b"10")],
            },
        ];
        check_round_trip(&setup, &ops);
    }

    #[test]
    fn test_non_leaf_operations_round_trip() {
        let setup = vec![
            PageOperation::BucketInit { leaf: false },
            PageOperation::BucketAddNonLeafEntry {
                index: 0,
                key: b"m".to_vec(),
                left: 2,
                right: 3,
                next_left_before: None,
            },
        ];
        let ops = vec![
            PageOperation::BucketAddNonLeafEntry {
                index: 0,
                key: b"f".to_vec(),
                left: 2,
                right: 4,
                next_left_before: Some(2),
            },
            PageOperation::BucketAddNonLeafEntry {
                index: 2,
                key: b"t".to_vec(),
                left: 3,
                right: 5,
                next_left_before: None,
            },
        ];
        check_round_trip(&setup, &ops);

        let mut page = vec![0u8; PAGE_SIZE];
        apply_all(&mut page, &setup);
        apply_all(&mut page, &ops);
        let bucket = BucketRead::new(&page);
        assert_eq!(3, bucket.size());
        assert_eq!(
            vec![(2, 4), (4, 3), (3, 5)],
            (0..3)
                .map(|i| (bucket.left_child(i), bucket.right_child(i)))
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_switch_type_and_clear() {
        let ops = vec![
            PageOperation::BucketInit { leaf: true },
            PageOperation::BucketSwitchType { leaf: false },
        ];
        check_round_trip(&[], &ops);

        let mut page = vec![0u8; PAGE_SIZE];
        apply_all(&mut page, &ops);
        PageOperation::BucketAddNonLeafEntry {
            index: 0,
            key: b"k".to_vec(),
            left: 1,
            right: 2,
            next_left_before: None,
        }
        .redo(&mut page)
        .unwrap();
        assert!(PageOperation::BucketSwitchType { leaf: true }
            .redo(&mut page)
            .is_err());
    }

    #[test]
    fn test_entry_point_round_trip() {
        let setup = vec![PageOperation::EntryPointInit { version: 3 }];
        let ops = vec![
            PageOperation::EntryPointSetTreeSize { new: 1, old: 0 },
            PageOperation::EntryPointSetTreeSize { new: 2, old: 1 },
            PageOperation::EntryPointSetEntryId { new: 5, old: 0 },
        ];
        check_round_trip(&setup, &ops);
        check_round_trip(&[], &setup);
    }

    #[test]
    fn test_single_null_bucket_round_trip() {
        let setup = vec![PageOperation::NullBucketInit {
            kind: NullBucketKind::Single,
        }];
        let ops = vec![
            PageOperation::SingleNullSetValue {
                new: Rid::new(1, 1),
                old: None,
            },
            PageOperation::SingleNullSetValue {
                new: Rid::new(2, 9),
                old: Some(Rid::new(1, 1)),
            },
            PageOperation::SingleNullRemoveValue {
                old: Rid::new(2, 9),
            },
            PageOperation::SingleNullSetValue {
                new: Rid::new(3, 3),
                old: None,
            },
        ];
        check_round_trip(&setup, &ops);
    }

    #[test]
    fn test_multi_null_bucket_round_trip() {
        let setup = vec![PageOperation::NullBucketInit {
            kind: NullBucketKind::Multi,
        }];
        let ops = vec![
            PageOperation::NullAddValue {
                index: 0,
                rid: Rid::new(1, 5),
            },
            PageOperation::NullIncrementSize,
            PageOperation::NullAddValue {
                index: 0,
                rid: Rid::new(1, 2),
            },
            PageOperation::NullIncrementSize,
            PageOperation::NullRemoveValue {
                index: 1,
                rid: Rid::new(1, 5),
            },
            PageOperation::NullDecrementSize,
            PageOperation::NullSetMid { new: 42, old: 0 },
        ];
        check_round_trip(&setup, &ops);
    }

    #[test]
    fn test_write_bytes_round_trip() {
        let ops = vec![PageOperation::WriteBytes {
            offset: 100,
            new: vec![1, 2, 3],
            old: vec![0, 0, 0],
        }];
        check_round_trip(&[], &ops);

        let mut page = vec![0u8; PAGE_SIZE];
        let header_write = PageOperation::WriteBytes {
            offset: 0,
            new: vec![1],
            old: vec![0],
        };
        assert!(header_write.redo(&mut page).is_err());
    }

    #[test]
    fn test_mismatching_state_is_rejected() {
        let mut page = vec![0u8; PAGE_SIZE];
        PageOperation::BucketInit { leaf: true }
            .redo(&mut page)
            .unwrap();
        let remove = PageOperation::BucketRemoveLeafEntry {
            index: 0,
            entry: leaf_entry(b"a", b"1"),
        };
        assert!(remove.redo(&mut page).is_err());
        let sibling = PageOperation::BucketSetLeftSibling {
            new: Some(1),
            old: Some(2),
        };
        assert!(sibling.redo(&mut page).is_err());
    }
}
