//! Layout of a cell B-tree bucket page.
//!
//! ```text
//! 16  flags (bit 0 = leaf)
//! 20  entry count
//! 24  free pointer, the lowest byte used by entry data
//! 28  left sibling page, u64::MAX when none
//! 36  right sibling page, u64::MAX when none
//! 44  entry offsets, one u32 per entry
//! ..  free space, always zeroed
//! ..  entry data, entry 0 highest, entry n-1 at the free pointer
//! ```
//!
//! Entry data is kept in index order so the byte image of a bucket only depends on its entries.
//! Applying a mutation and then its inverse restores the page byte for byte.
//!
//! Leaf entry: `[key len u32][key][value len u32][value]`.
//! Non-leaf entry: `[left child u64][right child u64][key len u32][key]`.

use crate::bins::SliceExt;
use crate::page::PAGE_PAYLOAD_OFFSET;
use anyhow::anyhow;

const FLAGS_OFFSET: usize = PAGE_PAYLOAD_OFFSET;
const SIZE_OFFSET: usize = PAGE_PAYLOAD_OFFSET + 4;
const FREE_POINTER_OFFSET: usize = PAGE_PAYLOAD_OFFSET + 8;
const LEFT_SIBLING_OFFSET: usize = PAGE_PAYLOAD_OFFSET + 12;
const RIGHT_SIBLING_OFFSET: usize = PAGE_PAYLOAD_OFFSET + 20;
const OFFSETS_START: usize = PAGE_PAYLOAD_OFFSET + 28;
const HEADER_END: usize = OFFSETS_START;

const LEAF_FLAG: u32 = 1;
const NO_PAGE: u64 = u64::MAX;

/// Largest entry a bucket accepts, chosen so a split always leaves room for the pending insert.
pub(crate) fn max_entry_size(page_size: usize) -> usize {
    (page_size - HEADER_END) / 4 - 4
}

pub(crate) fn leaf_entry(key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut raw = Vec::with_capacity(8 + key.len() + value.len());
    raw.extend_from_slice(&(key.len() as u32).to_be_bytes());
    raw.extend_from_slice(key);
    raw.extend_from_slice(&(value.len() as u32).to_be_bytes());
    raw.extend_from_slice(value);
    raw
}

pub(crate) fn non_leaf_entry(key: &[u8], left: u64, right: u64) -> Vec<u8> {
    let mut raw = Vec::with_capacity(20 + key.len());
    raw.extend_from_slice(&left.to_be_bytes());
    raw.extend_from_slice(&right.to_be_bytes());
    raw.extend_from_slice(&(key.len() as u32).to_be_bytes());
    raw.extend_from_slice(key);
    raw
}

/// Splits a raw leaf entry into key and value.
pub(crate) fn split_leaf_entry(raw: &[u8]) -> (&[u8], &[u8]) {
    let key_len = raw.read_u32() as usize;
    let key = &raw[4..4 + key_len];
    let value_len = raw[4 + key_len..].read_u32() as usize;
    let value = &raw[8 + key_len..8 + key_len + value_len];
    (key, value)
}

pub(crate) fn non_leaf_entry_key(raw: &[u8]) -> &[u8] {
    let key_len = raw[16..].read_u32() as usize;
    &raw[20..20 + key_len]
}

fn sibling(value: u64) -> Option<u64> {
    if value == NO_PAGE {
        None
    } else {
        Some(value)
    }
}

pub(crate) struct BucketRead<'a> {
    buff: &'a [u8],
}

impl<'a> BucketRead<'a> {
    pub(crate) fn new(buff: &'a [u8]) -> Self {
        Self { buff }
    }

    pub(crate) fn is_leaf(&self) -> bool {
        self.buff[FLAGS_OFFSET..].read_u32() & LEAF_FLAG != 0
    }

    pub(crate) fn size(&self) -> usize {
        self.buff[SIZE_OFFSET..].read_u32() as usize
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.size() == 0
    }

    fn free_pointer(&self) -> usize {
        self.buff[FREE_POINTER_OFFSET..].read_u32() as usize
    }

    pub(crate) fn free_space(&self) -> usize {
        self.free_pointer() - (OFFSETS_START + 4 * self.size())
    }

    /// Whether an additional entry of `len` bytes fits without a split.
    pub(crate) fn fits(&self, len: usize) -> bool {
        self.free_space() >= len + 4
    }

    pub(crate) fn left_sibling(&self) -> Option<u64> {
        sibling(self.buff[LEFT_SIBLING_OFFSET..].read_u64())
    }

    pub(crate) fn right_sibling(&self) -> Option<u64> {
        sibling(self.buff[RIGHT_SIBLING_OFFSET..].read_u64())
    }

    fn offset(&self, index: usize) -> usize {
        self.buff[OFFSETS_START + index * 4..].read_u32() as usize
    }

    fn entry_len(&self, offset: usize) -> usize {
        let entry = &self.buff[offset..];
        if self.is_leaf() {
            let key_len = entry.read_u32() as usize;
            let value_len = entry[4 + key_len..].read_u32() as usize;
            8 + key_len + value_len
        } else {
            let key_len = entry[16..].read_u32() as usize;
            20 + key_len
        }
    }

    pub(crate) fn raw(&self, index: usize) -> &'a [u8] {
        let offset = self.offset(index);
        let len = self.entry_len(offset);
        &self.buff[offset..offset + len]
    }

    pub(crate) fn key(&self, index: usize) -> &'a [u8] {
        let raw = self.raw(index);
        if self.is_leaf() {
            split_leaf_entry(raw).0
        } else {
            non_leaf_entry_key(raw)
        }
    }

    pub(crate) fn value(&self, index: usize) -> &'a [u8] {
        debug_assert!(self.is_leaf());
        split_leaf_entry(self.raw(index)).1
    }

    pub(crate) fn left_child(&self, index: usize) -> u64 {
        debug_assert!(!self.is_leaf());
        self.buff[self.offset(index)..].read_u64()
    }

    pub(crate) fn right_child(&self, index: usize) -> u64 {
        debug_assert!(!self.is_leaf());
        self.buff[self.offset(index) + 8..].read_u64()
    }

    pub(crate) fn raw_entries(&self, from: usize, to: usize) -> Vec<Vec<u8>> {
        (from..to).map(|i| self.raw(i).to_vec()).collect()
    }
}

pub(crate) struct BucketWrite<'a> {
    buff: &'a mut [u8],
}

impl<'a> BucketWrite<'a> {
    pub(crate) fn new(buff: &'a mut [u8]) -> Self {
        Self { buff }
    }

    fn read(&self) -> BucketRead<'_> {
        BucketRead::new(self.buff)
    }

    fn set_u32(&mut self, offset: usize, value: u32) {
        self.buff[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
    }

    fn set_u64(&mut self, offset: usize, value: u64) {
        self.buff[offset..offset + 8].copy_from_slice(&value.to_be_bytes());
    }

    pub(crate) fn init(&mut self, leaf: bool) -> anyhow::Result<()> {
        if self.buff[HEADER_END..].iter().any(|b| *b != 0)
            || self.buff[FLAGS_OFFSET..HEADER_END].iter().any(|b| *b != 0)
        {
            return Err(anyhow!("bucket can only be initialized on an empty page"));
        }
        let page_size = self.buff.len() as u32;
        self.set_u32(FLAGS_OFFSET, if leaf { LEAF_FLAG } else { 0 });
        self.set_u32(SIZE_OFFSET, 0);
        self.set_u32(FREE_POINTER_OFFSET, page_size);
        self.set_u64(LEFT_SIBLING_OFFSET, NO_PAGE);
        self.set_u64(RIGHT_SIBLING_OFFSET, NO_PAGE);
        Ok(())
    }

    /// Reverts [`BucketWrite::init`], the bucket must be empty and without siblings.
    pub(crate) fn clear(&mut self, leaf: bool) -> anyhow::Result<()> {
        let bucket = self.read();
        if !bucket.is_empty() || bucket.is_leaf() != leaf {
            return Err(anyhow!("only an empty bucket of the same type can be cleared"));
        }
        self.buff[FLAGS_OFFSET..HEADER_END].fill(0);
        Ok(())
    }

    pub(crate) fn switch_type(&mut self, leaf: bool) -> anyhow::Result<()> {
        let bucket = self.read();
        if !bucket.is_empty() {
            return Err(anyhow!("cannot switch type of a non-empty bucket"));
        }
        if bucket.is_leaf() == leaf {
            return Err(anyhow!("bucket already has the requested type"));
        }
        self.set_u32(FLAGS_OFFSET, if leaf { LEAF_FLAG } else { 0 });
        Ok(())
    }

    pub(crate) fn set_left_sibling(&mut self, page: Option<u64>) {
        self.set_u64(LEFT_SIBLING_OFFSET, page.unwrap_or(NO_PAGE));
    }

    pub(crate) fn set_right_sibling(&mut self, page: Option<u64>) {
        self.set_u64(RIGHT_SIBLING_OFFSET, page.unwrap_or(NO_PAGE));
    }

    pub(crate) fn set_left_child(&mut self, index: usize, page: u64) {
        let offset = self.read().offset(index);
        self.set_u64(offset, page);
    }

    pub(crate) fn insert(&mut self, index: usize, raw: &[u8]) -> anyhow::Result<()> {
        let bucket = self.read();
        let size = bucket.size();
        if index > size {
            return Err(anyhow!("insert index {index} out of bounds, size is {size}"));
        }
        if !bucket.fits(raw.len()) {
            return Err(anyhow!(
                "entry of {} bytes does not fit, free space is {}",
                raw.len(),
                bucket.free_space()
            ));
        }

        let len = raw.len();
        let free_pointer = bucket.free_pointer();
        let top = if index == 0 {
            self.buff.len()
        } else {
            bucket.offset(index - 1)
        };

        self.buff.copy_within(free_pointer..top, free_pointer - len);
        self.buff[top - len..top].copy_from_slice(raw);

        for i in (index..size).rev() {
            let offset = self.read().offset(i) - len;
            self.set_u32(OFFSETS_START + (i + 1) * 4, offset as u32);
        }
        self.set_u32(OFFSETS_START + index * 4, (top - len) as u32);
        self.set_u32(FREE_POINTER_OFFSET, (free_pointer - len) as u32);
        self.set_u32(SIZE_OFFSET, (size + 1) as u32);
        Ok(())
    }

    pub(crate) fn remove(&mut self, index: usize) -> anyhow::Result<Vec<u8>> {
        let bucket = self.read();
        let size = bucket.size();
        if index >= size {
            return Err(anyhow!("remove index {index} out of bounds, size is {size}"));
        }

        let offset = bucket.offset(index);
        let raw = bucket.raw(index).to_vec();
        let len = raw.len();
        let free_pointer = bucket.free_pointer();

        self.buff.copy_within(free_pointer..offset, free_pointer + len);
        self.buff[free_pointer..free_pointer + len].fill(0);

        for i in index + 1..size {
            let moved = self.read().offset(i) + len;
            self.set_u32(OFFSETS_START + (i - 1) * 4, moved as u32);
        }
        self.set_u32(OFFSETS_START + (size - 1) * 4, 0);
        self.set_u32(FREE_POINTER_OFFSET, (free_pointer + len) as u32);
        self.set_u32(SIZE_OFFSET, (size - 1) as u32);
        Ok(raw)
    }

    pub(crate) fn replace(&mut self, index: usize, raw: &[u8]) -> anyhow::Result<Vec<u8>> {
        let bucket = self.read();
        if index >= bucket.size() {
            return Err(anyhow!("replace index {index} out of bounds"));
        }
        let old_len = bucket.raw(index).len();
        if bucket.free_space() + old_len < raw.len() {
            return Err(anyhow!("replacement entry does not fit"));
        }
        let old = self.remove(index)?;
        self.insert(index, raw)?;
        Ok(old)
    }

    pub(crate) fn append(&mut self, entries: &[Vec<u8>]) -> anyhow::Result<()> {
        for raw in entries {
            let size = self.read().size();
            self.insert(size, raw)?;
        }
        Ok(())
    }

    pub(crate) fn truncate(&mut self, new_size: usize) -> anyhow::Result<Vec<Vec<u8>>> {
        let size = self.read().size();
        if new_size > size {
            return Err(anyhow!("cannot truncate bucket of {size} entries to {new_size}"));
        }
        let mut removed = Vec::with_capacity(size - new_size);
        for i in (new_size..size).rev() {
            removed.push(self.remove(i)?);
        }
        removed.reverse();
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_page(keys: &[&str]) -> Vec<u8> {
        let mut page = vec![0u8; 4096];
        let mut bucket = BucketWrite::new(&mut page);
        bucket.init(true).unwrap();
        for (i, key) in keys.iter().enumerate() {
            bucket
                .insert(i, &leaf_entry(key.as_bytes(), b"v"))
                .unwrap();
        }
        page
    }

    #[test]
    fn test_insert_keeps_index_order() {
        let mut page = leaf_page(&["b", "d"]);
        let mut bucket = BucketWrite::new(&mut page);
        bucket.insert(0, &leaf_entry(b"a", b"1")).unwrap();
        bucket.insert(2, &leaf_entry(b"c", b"3")).unwrap();

        let bucket = BucketRead::new(&page);
        assert_eq!(4, bucket.size());
        let keys = (0..4).map(|i| bucket.key(i).to_vec()).collect::<Vec<_>>();
        assert_eq!(vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()], keys);
        assert_eq!(b"3", bucket.value(2));
    }

    #[test]
    fn test_remove_is_exact_inverse_of_insert() {
        let original = leaf_page(&["a", "c", "e"]);
        for index in 0..=3 {
            let mut page = original.clone();
            let mut bucket = BucketWrite::new(&mut page);
            bucket.insert(index, &leaf_entry(b"x", b"long value")).unwrap();
            assert_ne!(original, page);
            let mut bucket = BucketWrite::new(&mut page);
            let raw = bucket.remove(index).unwrap();
            assert_eq!(leaf_entry(b"x", b"long value"), raw);
            assert_eq!(original, page, "index {index}");
        }
    }

    #[test]
    fn test_insert_is_exact_inverse_of_remove() {
        let original = leaf_page(&["a", "c", "e", "g"]);
        for index in 0..4 {
            let mut page = original.clone();
            let raw = BucketWrite::new(&mut page).remove(index).unwrap();
            BucketWrite::new(&mut page).insert(index, &raw).unwrap();
            assert_eq!(original, page, "index {index}");
        }
    }

    #[test]
    fn test_truncate_and_append() {
        let original = leaf_page(&["a", "b", "c", "d", "e"]);
        let mut page = original.clone();
        let removed = BucketWrite::new(&mut page).truncate(2).unwrap();
        assert_eq!(3, removed.len());
        assert_eq!(2, BucketRead::new(&page).size());
        BucketWrite::new(&mut page).append(&removed).unwrap();
        assert_eq!(original, page);
    }

    #[test]
    fn test_non_leaf_children() {
        let mut page = vec![0u8; 4096];
        let mut bucket = BucketWrite::new(&mut page);
        bucket.init(false).unwrap();
        bucket.insert(0, &non_leaf_entry(b"m", 2, 3)).unwrap();
        bucket.set_left_child(0, 7);
        let bucket = BucketRead::new(&page);
        assert!(!bucket.is_leaf());
        assert_eq!(7, bucket.left_child(0));
        assert_eq!(3, bucket.right_child(0));
        assert_eq!(b"m", bucket.key(0));
    }

    #[test]
    fn test_entry_does_not_fit() {
        let mut page = leaf_page(&[]);
        let big = vec![1u8; 4096];
        assert!(BucketWrite::new(&mut page).insert(0, &big).is_err());
        assert!(max_entry_size(4096) < 4096 / 3);
    }
}
