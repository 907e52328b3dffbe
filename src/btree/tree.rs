//! B+ tree over byte keys and byte values stored in one file.
//!
//! Page 0 is the entry point, page 1 is the root and stays the root: when it splits its entries
//! move to two new children. Separators follow `left < separator <= right`. Leaves are chained by
//! sibling links in both directions. Removals never merge buckets, an empty leaf stays in the
//! chain and is skipped by scans.
//!
//! Keys are compared in their plain form. When the tree has an [`Encryption`], keys are stored
//! encrypted and decrypted before every comparison.

use super::bucket::{self, BucketRead};
use super::entry_point::{EntryPointRead, ENTRY_POINT_PAGE, ROOT_PAGE};
use super::key::{seal, unseal, Encryption};
use crate::atomic::AtomicOperation;
use crate::cache::{CacheEntry, PageSource};
use crate::error::StorageError;
use crate::id::FileId;
use crate::po::PageOperation;
use anyhow::anyhow;
use std::borrow::Cow;
use std::cmp::Ordering;
use std::sync::Arc;

/// Bound of a key range. A partial bound only compares the leading `key.len()` bytes of the keys,
/// so every key starting with the bound compares equal to it.
#[derive(Clone, Debug)]
pub(crate) struct KeyBound {
    pub(crate) key: Vec<u8>,
    pub(crate) inclusive: bool,
    pub(crate) partial: bool,
}

impl KeyBound {
    pub(crate) fn exact(key: Vec<u8>, inclusive: bool) -> Self {
        Self {
            key,
            inclusive,
            partial: false,
        }
    }

    pub(crate) fn prefix(key: Vec<u8>, inclusive: bool) -> Self {
        Self {
            key,
            inclusive,
            partial: true,
        }
    }

    fn compare(&self, key: &[u8]) -> Ordering {
        let key = if self.partial {
            &key[..key.len().min(self.key.len())]
        } else {
            key
        };
        key.cmp(&self.key)
    }
}

#[derive(Clone, Debug)]
pub(crate) struct KeyRange {
    pub(crate) lower: Option<KeyBound>,
    pub(crate) upper: Option<KeyBound>,
    pub(crate) ascending: bool,
}

impl KeyRange {
    pub(crate) fn all(ascending: bool) -> Self {
        Self {
            lower: None,
            upper: None,
            ascending,
        }
    }

    /// Every key starting with `prefix`.
    pub(crate) fn with_prefix(prefix: Vec<u8>, ascending: bool) -> Self {
        Self {
            lower: Some(KeyBound::prefix(prefix.clone(), true)),
            upper: Some(KeyBound::prefix(prefix, true)),
            ascending,
        }
    }

    fn above_lower(&self, key: &[u8]) -> bool {
        match &self.lower {
            None => true,
            Some(bound) => match bound.compare(key) {
                Ordering::Greater => true,
                Ordering::Equal => bound.inclusive,
                Ordering::Less => false,
            },
        }
    }

    fn below_upper(&self, key: &[u8]) -> bool {
        match &self.upper {
            None => true,
            Some(bound) => match bound.compare(key) {
                Ordering::Less => true,
                Ordering::Equal => bound.inclusive,
                Ordering::Greater => false,
            },
        }
    }

    /// Narrows the range to the keys after `key` in iteration order.
    fn resume_after(&mut self, key: Vec<u8>) {
        let bound = Some(KeyBound::exact(key, false));
        if self.ascending {
            self.lower = bound;
        } else {
            self.upper = bound;
        }
    }
}

/// Iteration state over a range. Every batch starts a fresh descent from the last returned key,
/// so no page stays referenced between batches.
#[derive(Clone, Debug)]
pub(crate) struct RawCursor {
    range: KeyRange,
    done: bool,
}

impl RawCursor {
    pub(crate) fn new(range: KeyRange) -> Self {
        Self { range, done: false }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done
    }

    pub(crate) fn next_batch<S: PageSource>(
        &mut self,
        tree: &CellTree,
        src: &mut S,
        limit: usize,
    ) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>> {
        if self.done {
            return Ok(Vec::new());
        }
        let batch = tree.fetch(src, &self.range, limit)?;
        if batch.len() < limit {
            self.done = true;
        }
        if let Some((key, _)) = batch.last() {
            self.range.resume_after(key.clone());
        }
        Ok(batch)
    }
}

/// Header of a tree file.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct TreeHeader {
    pub(crate) version: u32,
    pub(crate) size: u64,
    pub(crate) entry_id: u64,
}

#[derive(Clone)]
pub(crate) struct CellTree {
    name: String,
    file_id: FileId,
    encryption: Option<Arc<dyn Encryption>>,
}

/// First index in `0..n` for which `pred` holds, `pred` must be monotonic.
fn search(n: usize, pred: impl Fn(usize) -> anyhow::Result<bool>) -> anyhow::Result<usize> {
    let (mut low, mut high) = (0, n);
    while low < high {
        let mid = low + (high - low) / 2;
        if pred(mid)? {
            high = mid;
        } else {
            low = mid + 1;
        }
    }
    Ok(low)
}

pub(super) fn load(
    op: &mut AtomicOperation,
    file_id: FileId,
    page_index: u64,
) -> anyhow::Result<CacheEntry> {
    match op.load_page(file_id, page_index, false, 1)? {
        Some(entry) => Ok(entry),
        None => Err(StorageError::NotFound(format!("page {page_index} of file {file_id}")).into()),
    }
}

/// Applies `operations` to a page of the operation.
pub(super) fn modify(
    op: &mut AtomicOperation,
    file_id: FileId,
    page_index: u64,
    operations: impl IntoIterator<Item = PageOperation>,
) -> anyhow::Result<()> {
    let entry = load(op, file_id, page_index)?;
    let result = apply(op, &entry, operations);
    op.release_page(entry)?;
    result
}

fn apply(
    op: &mut AtomicOperation,
    entry: &CacheEntry,
    operations: impl IntoIterator<Item = PageOperation>,
) -> anyhow::Result<()> {
    let mut changes = op.changes(entry)?;
    for operation in operations {
        changes.apply(operation)?;
    }
    Ok(())
}

/// Appends a page to the file and applies `operations` to it, returns its index.
pub(super) fn append_page(
    op: &mut AtomicOperation,
    file_id: FileId,
    operations: impl IntoIterator<Item = PageOperation>,
) -> anyhow::Result<u64> {
    let entry = op.add_page(file_id)?;
    let page_index = entry.page_index();
    let result = apply(op, &entry, operations);
    op.release_page(entry)?;
    result.map(|_| page_index)
}

/// Content of a bucket needed to split it.
struct SplitPlan {
    leaf: bool,
    entries: Vec<Vec<u8>>,
    mid: usize,
    separator: Vec<u8>,
    right_sibling: Option<u64>,
}

impl SplitPlan {
    fn left_entries(&self) -> &[Vec<u8>] {
        &self.entries[..self.mid]
    }

    /// The separator itself moves up out of a non-leaf bucket.
    fn right_entries(&self) -> &[Vec<u8>] {
        if self.leaf {
            &self.entries[self.mid..]
        } else {
            &self.entries[self.mid + 1..]
        }
    }
}

impl CellTree {
    /// Creates the file with an entry point and an empty root leaf.
    pub(crate) fn create(
        op: &mut AtomicOperation,
        name: &str,
        version: u32,
        encryption: Option<Arc<dyn Encryption>>,
    ) -> anyhow::Result<Self> {
        let file_id = op.add_file(name)?;
        append_page(op, file_id, [PageOperation::EntryPointInit { version }])?;
        append_page(op, file_id, [PageOperation::BucketInit { leaf: true }])?;
        log::debug!("tree_created name={name} file_id={file_id} version={version}");
        Ok(Self {
            name: name.to_string(),
            file_id,
            encryption,
        })
    }

    pub(crate) fn open(
        name: &str,
        file_id: FileId,
        encryption: Option<Arc<dyn Encryption>>,
    ) -> Self {
        Self {
            name: name.to_string(),
            file_id,
            encryption,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn file_id(&self) -> FileId {
        self.file_id
    }

    fn plain<'a>(&self, stored: &'a [u8]) -> anyhow::Result<Cow<'a, [u8]>> {
        unseal(self.encryption.as_ref(), stored)
    }

    pub(crate) fn header<S: PageSource>(&self, src: &mut S) -> anyhow::Result<TreeHeader> {
        src.with_page(self.file_id, ENTRY_POINT_PAGE, |buff| {
            let entry_point = EntryPointRead::new(buff)?;
            Ok(TreeHeader {
                version: entry_point.version(),
                size: entry_point.tree_size(),
                entry_id: entry_point.entry_id(),
            })
        })
    }

    pub(crate) fn add_size(&self, op: &mut AtomicOperation, delta: i64) -> anyhow::Result<u64> {
        let old = self.header(op)?.size;
        let Some(new) = old.checked_add_signed(delta) else {
            return Err(anyhow!("size of tree {} would become negative", self.name));
        };
        modify(
            op,
            self.file_id,
            ENTRY_POINT_PAGE,
            [PageOperation::EntryPointSetTreeSize { new, old }],
        )?;
        Ok(new)
    }

    /// Increments the id counter of the entry point and returns the new id.
    pub(crate) fn next_entry_id(&self, op: &mut AtomicOperation) -> anyhow::Result<u64> {
        let old = self.header(op)?.entry_id;
        let new = old + 1;
        modify(
            op,
            self.file_id,
            ENTRY_POINT_PAGE,
            [PageOperation::EntryPointSetEntryId { new, old }],
        )?;
        Ok(new)
    }

    /// Walks from the root to a leaf. In every non-leaf bucket the walk takes the left child of
    /// the first separator for which `goes_left` holds, or the rightmost child.
    fn descend<S: PageSource>(
        &self,
        src: &mut S,
        goes_left: impl Fn(&[u8]) -> bool,
    ) -> anyhow::Result<Vec<u64>> {
        let mut path = vec![ROOT_PAGE];
        loop {
            let page_index = path[path.len() - 1];
            let next = src.with_page(self.file_id, page_index, |buff| {
                let bucket = BucketRead::new(buff);
                if bucket.is_leaf() {
                    return Ok(None);
                }
                let size = bucket.size();
                if size == 0 {
                    return Err(StorageError::PageCorrupted {
                        file_id: self.file_id,
                        page_index,
                    }
                    .into());
                }
                let index = search(size, |i| Ok(goes_left(&self.plain(bucket.key(i))?)))?;
                if index < size {
                    Ok(Some(bucket.left_child(index)))
                } else {
                    Ok(Some(bucket.right_child(size - 1)))
                }
            })?;
            match next {
                Some(child) => path.push(child),
                None => return Ok(path),
            }
        }
    }

    /// Path to the leaf which holds `key` if it is present.
    fn find_leaf<S: PageSource>(&self, src: &mut S, key: &[u8]) -> anyhow::Result<Vec<u64>> {
        self.descend(src, |separator| separator > key)
    }

    /// Position of `key` in a leaf, `Err` with the insertion point when it is absent.
    fn search_leaf(&self, bucket: &BucketRead, key: &[u8]) -> anyhow::Result<Result<usize, usize>> {
        let index = search(bucket.size(), |i| Ok(self.plain(bucket.key(i))?.as_ref() >= key))?;
        if index < bucket.size() && self.plain(bucket.key(index))?.as_ref() == key {
            Ok(Ok(index))
        } else {
            Ok(Err(index))
        }
    }

    pub(crate) fn get<S: PageSource>(
        &self,
        src: &mut S,
        key: &[u8],
    ) -> anyhow::Result<Option<Vec<u8>>> {
        let path = self.find_leaf(src, key)?;
        src.with_page(self.file_id, path[path.len() - 1], |buff| {
            let bucket = BucketRead::new(buff);
            Ok(match self.search_leaf(&bucket, key)? {
                Ok(index) => Some(bucket.value(index).to_vec()),
                Err(_) => None,
            })
        })
    }

    /// Inserts or replaces the value of `key` and returns the previous value.
    pub(crate) fn put(
        &self,
        op: &mut AtomicOperation,
        key: &[u8],
        value: &[u8],
    ) -> anyhow::Result<Option<Vec<u8>>> {
        let stored = seal(self.encryption.as_ref(), key);
        let entry = bucket::leaf_entry(&stored, value);
        let max = bucket::max_entry_size(op.page_size());
        if entry.len() > max {
            return Err(StorageError::KeyTooBig {
                size: entry.len(),
                max,
            }
            .into());
        }

        let mut previous = None;
        loop {
            let path = self.find_leaf(op, key)?;
            let leaf = path[path.len() - 1];
            let entry_ref = load(op, self.file_id, leaf)?;
            let (position, fits, old_raw) = {
                let page = op.read_page(&entry_ref)?;
                let bucket = BucketRead::new(&page);
                let position = self.search_leaf(&bucket, key)?;
                let old_raw = position.ok().map(|index| bucket.raw(index).to_vec());
                let fits = match &old_raw {
                    Some(old) => bucket.free_space() + old.len() >= entry.len(),
                    None => bucket.fits(entry.len()),
                };
                (position, fits, old_raw)
            };

            let result = match (position, old_raw) {
                (Ok(index), Some(old_raw)) => {
                    let (_, old_value) = bucket::split_leaf_entry(&old_raw);
                    previous = Some(old_value.to_vec());
                    if old_value == value {
                        op.release_page(entry_ref)?;
                        return Ok(previous);
                    }
                    let operation = if fits {
                        PageOperation::BucketUpdateValue {
                            index: index as u32,
                            new: value.to_vec(),
                            old: old_value.to_vec(),
                        }
                    } else {
                        PageOperation::BucketRemoveLeafEntry {
                            index: index as u32,
                            entry: old_raw.clone(),
                        }
                    };
                    apply(op, &entry_ref, [operation]).map(|_| fits)
                }
                (Err(index), _) if fits => apply(
                    op,
                    &entry_ref,
                    [PageOperation::BucketAddLeafEntry {
                        index: index as u32,
                        entry: entry.clone(),
                    }],
                )
                .map(|_| true),
                _ => Ok(false),
            };
            op.release_page(entry_ref)?;
            if result? {
                return Ok(previous);
            }
            if position.is_err() {
                self.split(op, &path, entry.len())?;
            }
        }
    }

    /// Removes `key` and returns its value.
    pub(crate) fn remove(
        &self,
        op: &mut AtomicOperation,
        key: &[u8],
    ) -> anyhow::Result<Option<Vec<u8>>> {
        let path = self.find_leaf(op, key)?;
        let leaf = path[path.len() - 1];
        let found = op.with_page(self.file_id, leaf, |buff| {
            let bucket = BucketRead::new(buff);
            Ok(match self.search_leaf(&bucket, key)? {
                Ok(index) => Some((index, bucket.raw(index).to_vec())),
                Err(_) => None,
            })
        })?;
        let Some((index, raw)) = found else {
            return Ok(None);
        };
        let value = bucket::split_leaf_entry(&raw).1.to_vec();
        modify(
            op,
            self.file_id,
            leaf,
            [PageOperation::BucketRemoveLeafEntry {
                index: index as u32,
                entry: raw,
            }],
        )?;
        Ok(Some(value))
    }

    fn plan_split(&self, op: &mut AtomicOperation, page_index: u64) -> anyhow::Result<SplitPlan> {
        op.with_page(self.file_id, page_index, |buff| {
            let bucket = BucketRead::new(buff);
            let size = bucket.size();
            let leaf = bucket.is_leaf();
            let min_size = if leaf { 2 } else { 3 };
            if size < min_size {
                return Err(anyhow!(
                    "bucket {page_index} of {} has {size} entries and cannot split",
                    self.name
                ));
            }
            let entries = bucket.raw_entries(0, size);
            let total: usize = entries.iter().map(Vec::len).sum();
            let mut mid = 0;
            let mut acc = 0;
            while mid < size && acc + entries[mid].len() <= total / 2 {
                acc += entries[mid].len();
                mid += 1;
            }
            let mid = if leaf {
                mid.clamp(1, size - 1)
            } else {
                mid.clamp(1, size - 2)
            };
            Ok(SplitPlan {
                leaf,
                separator: bucket.key(mid).to_vec(),
                right_sibling: if leaf { bucket.right_sibling() } else { None },
                entries,
                mid,
            })
        })
    }

    /// Makes room for an entry of `len` bytes in the leaf at the end of `path`. Splits the
    /// topmost bucket of the path that has to split, the caller descends again afterwards.
    fn split(&self, op: &mut AtomicOperation, path: &[u64], len: usize) -> anyhow::Result<()> {
        let mut level = path.len() - 1;
        loop {
            let page_index = path[level];
            let plan = self.plan_split(op, page_index)?;
            if level == 0 {
                return self.split_root(op, plan);
            }
            let parent = path[level - 1];
            let separator_len = 20 + plan.separator.len();
            let fits = op.with_page(self.file_id, parent, |buff| {
                Ok(BucketRead::new(buff).fits(separator_len))
            })?;
            if fits {
                return self.split_bucket(op, page_index, parent, plan);
            }
            log::trace!(
                "tree_split_parent_full name={} page={page_index} len={len}",
                self.name
            );
            level -= 1;
        }
    }

    fn split_bucket(
        &self,
        op: &mut AtomicOperation,
        page_index: u64,
        parent: u64,
        plan: SplitPlan,
    ) -> anyhow::Result<()> {
        let mut init = vec![
            PageOperation::BucketInit { leaf: plan.leaf },
            PageOperation::BucketAppendEntries {
                entries: plan.right_entries().to_vec(),
            },
        ];
        if plan.leaf {
            init.push(PageOperation::BucketSetLeftSibling {
                new: Some(page_index),
                old: None,
            });
            init.push(PageOperation::BucketSetRightSibling {
                new: plan.right_sibling,
                old: None,
            });
        }
        let right = append_page(op, self.file_id, init)?;

        let mut truncate = vec![PageOperation::BucketTruncate {
            removed: plan.entries[plan.mid..].to_vec(),
        }];
        if plan.leaf {
            truncate.push(PageOperation::BucketSetRightSibling {
                new: Some(right),
                old: plan.right_sibling,
            });
        }
        modify(op, self.file_id, page_index, truncate)?;

        if let Some(next) = plan.right_sibling {
            modify(
                op,
                self.file_id,
                next,
                [PageOperation::BucketSetLeftSibling {
                    new: Some(right),
                    old: Some(page_index),
                }],
            )?;
        }

        let separator_plain = self.plain(&plan.separator)?.into_owned();
        let (index, next_left_before) = op.with_page(self.file_id, parent, |buff| {
            let bucket = BucketRead::new(buff);
            let size = bucket.size();
            let index = search(size, |i| {
                Ok(self.plain(bucket.key(i))?.as_ref() > separator_plain.as_slice())
            })?;
            let next_left = if index < size {
                Some(bucket.left_child(index))
            } else {
                None
            };
            Ok((index, next_left))
        })?;
        modify(
            op,
            self.file_id,
            parent,
            [PageOperation::BucketAddNonLeafEntry {
                index: index as u32,
                key: plan.separator,
                left: page_index,
                right,
                next_left_before,
            }],
        )?;
        log::trace!(
            "tree_bucket_split name={} page={page_index} right={right} parent={parent}",
            self.name
        );
        Ok(())
    }

    fn split_root(&self, op: &mut AtomicOperation, plan: SplitPlan) -> anyhow::Result<()> {
        let left = append_page(
            op,
            self.file_id,
            [
                PageOperation::BucketInit { leaf: plan.leaf },
                PageOperation::BucketAppendEntries {
                    entries: plan.left_entries().to_vec(),
                },
            ],
        )?;
        let right = append_page(
            op,
            self.file_id,
            [
                PageOperation::BucketInit { leaf: plan.leaf },
                PageOperation::BucketAppendEntries {
                    entries: plan.right_entries().to_vec(),
                },
            ],
        )?;
        if plan.leaf {
            modify(
                op,
                self.file_id,
                left,
                [PageOperation::BucketSetRightSibling {
                    new: Some(right),
                    old: None,
                }],
            )?;
            modify(
                op,
                self.file_id,
                right,
                [PageOperation::BucketSetLeftSibling {
                    new: Some(left),
                    old: None,
                }],
            )?;
        }

        let mut root = vec![PageOperation::BucketTruncate {
            removed: plan.entries.clone(),
        }];
        if plan.leaf {
            root.push(PageOperation::BucketSwitchType { leaf: false });
        }
        root.push(PageOperation::BucketAddNonLeafEntry {
            index: 0,
            key: plan.separator,
            left,
            right,
            next_left_before: None,
        });
        modify(op, self.file_id, ROOT_PAGE, root)?;
        log::debug!(
            "tree_root_split name={} left={left} right={right}",
            self.name
        );
        Ok(())
    }

    /// Collects up to `limit` entries of `range` in iteration order, keys in plain form.
    pub(crate) fn fetch<S: PageSource>(
        &self,
        src: &mut S,
        range: &KeyRange,
        limit: usize,
    ) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let path = if range.ascending {
            self.descend(src, |separator| range.above_lower(separator))?
        } else {
            self.descend(src, |separator| !range.below_upper(separator))?
        };

        let mut out = Vec::new();
        let mut page = Some(path[path.len() - 1]);
        let mut first = true;
        while let Some(page_index) = page {
            if out.len() >= limit {
                break;
            }
            page = src.with_page(self.file_id, page_index, |buff| {
                let bucket = BucketRead::new(buff);
                let size = bucket.size();
                if range.ascending {
                    let start = if first {
                        search(size, |i| Ok(range.above_lower(&self.plain(bucket.key(i))?)))?
                    } else {
                        0
                    };
                    for i in start..size {
                        let key = self.plain(bucket.key(i))?;
                        if !range.below_upper(&key) {
                            return Ok(None);
                        }
                        out.push((key.into_owned(), bucket.value(i).to_vec()));
                        if out.len() >= limit {
                            return Ok(None);
                        }
                    }
                    Ok(bucket.right_sibling())
                } else {
                    let end = if first {
                        search(size, |i| Ok(!range.below_upper(&self.plain(bucket.key(i))?)))?
                    } else {
                        size
                    };
                    for i in (0..end).rev() {
                        let key = self.plain(bucket.key(i))?;
                        if !range.above_lower(&key) {
                            return Ok(None);
                        }
                        out.push((key.into_owned(), bucket.value(i).to_vec()));
                        if out.len() >= limit {
                            return Ok(None);
                        }
                    }
                    Ok(bucket.left_sibling())
                }
            })?;
            first = false;
        }
        Ok(out)
    }

    /// Every entry of `range`, fetched in batches.
    pub(crate) fn fetch_all<S: PageSource>(
        &self,
        src: &mut S,
        range: KeyRange,
    ) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut cursor = RawCursor::new(range);
        let mut out = Vec::new();
        while !cursor.is_done() {
            out.extend(cursor.next_batch(self, src, 256)?);
        }
        Ok(out)
    }

    pub(crate) fn first_key<S: PageSource>(&self, src: &mut S) -> anyhow::Result<Option<Vec<u8>>> {
        let mut entries = self.fetch(src, &KeyRange::all(true), 1)?;
        Ok(entries.pop().map(|(key, _)| key))
    }

    pub(crate) fn last_key<S: PageSource>(&self, src: &mut S) -> anyhow::Result<Option<Vec<u8>>> {
        let mut entries = self.fetch(src, &KeyRange::all(false), 1)?;
        Ok(entries.pop().map(|(key, _)| key))
    }

    pub(crate) fn delete(&self, op: &mut AtomicOperation) -> anyhow::Result<()> {
        op.delete_file(self.file_id)?;
        log::debug!("tree_deleted name={} file_id={}", self.name, self.file_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::key::tests::XorEncryption;
    use crate::btree::tests::{fixture, Fixture};
    use crate::cache::WriteCache;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeMap;

    fn key(i: u32) -> Vec<u8> {
        format!("key-{i:08}").into_bytes()
    }

    fn create(f: &Fixture, encryption: Option<Arc<dyn Encryption>>) -> CellTree {
        f.manager
            .execute(|op| CellTree::create(op, "test.cbt", 1, encryption))
            .unwrap()
    }

    fn all(f: &Fixture, tree: &CellTree, ascending: bool) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut pages = f.manager.shared_pages();
        let mut cursor = RawCursor::new(KeyRange::all(ascending));
        let mut out = Vec::new();
        while !cursor.is_done() {
            out.extend(cursor.next_batch(tree, &mut pages, 7).unwrap());
        }
        out
    }

    #[test]
    fn test_put_get_remove() {
        let f = fixture();
        let tree = create(&f, None);
        f.manager
            .execute(|op| {
                assert_eq!(None, tree.put(op, b"a", b"1")?);
                assert_eq!(None, tree.put(op, b"b", b"2")?);
                assert_eq!(Some(b"1".to_vec()), tree.put(op, b"a", b"11")?);
                assert_eq!(Some(b"11".to_vec()), tree.get(op, b"a")?);
                Ok(())
            })
            .unwrap();

        let mut pages = f.manager.shared_pages();
        assert_eq!(Some(b"2".to_vec()), tree.get(&mut pages, b"b").unwrap());
        assert_eq!(None, tree.get(&mut pages, b"c").unwrap());

        f.manager
            .execute(|op| {
                assert_eq!(Some(b"2".to_vec()), tree.remove(op, b"b")?);
                assert_eq!(None, tree.remove(op, b"b")?);
                Ok(())
            })
            .unwrap();
        assert_eq!(None, tree.get(&mut pages, b"b").unwrap());
        assert_eq!(Some(b"a".to_vec()), tree.first_key(&mut pages).unwrap());
        assert_eq!(Some(b"a".to_vec()), tree.last_key(&mut pages).unwrap());
    }

    #[test]
    fn test_overwrite_in_place_is_undone_on_rollback() {
        let f = fixture();
        let tree = create(&f, None);
        f.manager
            .execute(|op| {
                tree.put(op, b"k", b"1")?;
                Ok(())
            })
            .unwrap();

        let result: anyhow::Result<()> = f.manager.execute(|op| {
            assert_eq!(Some(b"1".to_vec()), tree.put(op, b"k", b"2")?);
            assert_eq!(Some(b"2".to_vec()), tree.get(op, b"k")?);
            Err(anyhow::anyhow!("abort"))
        });
        assert!(result.is_err());
        let mut pages = f.manager.shared_pages();
        assert_eq!(Some(b"1".to_vec()), tree.get(&mut pages, b"k").unwrap());

        f.manager
            .execute(|op| {
                assert_eq!(Some(b"1".to_vec()), tree.put(op, b"k", b"2")?);
                assert_eq!(Some(b"2".to_vec()), tree.put(op, b"k", b"3")?);
                Ok(())
            })
            .unwrap();
        assert_eq!(Some(b"3".to_vec()), tree.get(&mut pages, b"k").unwrap());
    }

    #[test]
    fn test_many_keys_split_and_stay_ordered() {
        let f = fixture();
        let tree = create(&f, None);
        let mut rng = StdRng::seed_from_u64(7);
        let mut ids = (0..3000).collect::<Vec<u32>>();
        ids.shuffle(&mut rng);

        let mut expected = BTreeMap::new();
        for chunk in ids.chunks(250) {
            f.manager
                .execute(|op| {
                    for i in chunk {
                        let value = vec![(*i % 251) as u8; rng.gen_range(1..40)];
                        tree.put(op, &key(*i), &value)?;
                        expected.insert(key(*i), value);
                    }
                    Ok(())
                })
                .unwrap();
        }

        let ascending = all(&f, &tree, true);
        assert_eq!(expected.clone().into_iter().collect::<Vec<_>>(), ascending);
        let mut descending = all(&f, &tree, false);
        descending.reverse();
        assert_eq!(ascending, descending);

        let mut pages = f.manager.shared_pages();
        for i in [0, 1234, 2999] {
            assert_eq!(expected.get(&key(i)).cloned(), tree.get(&mut pages, &key(i)).unwrap());
        }
    }

    #[test]
    fn test_large_values_grow_in_place_or_move() {
        let f = fixture();
        let tree = create(&f, None);
        f.manager
            .execute(|op| {
                for i in 0..50 {
                    tree.put(op, &key(i), b"x")?;
                }
                for i in 0..50 {
                    tree.put(op, &key(i), &vec![i as u8; 300])?;
                }
                Ok(())
            })
            .unwrap();
        let entries = all(&f, &tree, true);
        assert_eq!(50, entries.len());
        assert!(entries
            .iter()
            .enumerate()
            .all(|(i, (k, v))| *k == key(i as u32) && *v == vec![i as u8; 300]));
    }

    #[test]
    fn test_range_bounds() {
        let f = fixture();
        let tree = create(&f, None);
        f.manager
            .execute(|op| {
                for i in 0..500 {
                    tree.put(op, &key(i), &[])?;
                }
                Ok(())
            })
            .unwrap();

        let mut pages = f.manager.shared_pages();
        let range = KeyRange {
            lower: Some(KeyBound::exact(key(100), false)),
            upper: Some(KeyBound::exact(key(200), true)),
            ascending: true,
        };
        let keys = tree
            .fetch(&mut pages, &range, 1000)
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect::<Vec<_>>();
        assert_eq!((101..=200).map(key).collect::<Vec<_>>(), keys);

        let range = KeyRange {
            ascending: false,
            ..range
        };
        let keys = tree.fetch(&mut pages, &range, 1000).unwrap();
        assert_eq!(key(200), keys[0].0);
        assert_eq!(key(101), keys[keys.len() - 1].0);

        let prefix = KeyRange::with_prefix(b"key-0000012".to_vec(), true);
        let keys = tree.fetch(&mut pages, &prefix, 1000).unwrap();
        let keys = keys.into_iter().map(|(k, _)| k).collect::<Vec<_>>();
        assert_eq!((120..130).map(key).collect::<Vec<_>>(), keys);
    }

    #[test]
    fn test_removed_keys_leave_empty_leaves() {
        let f = fixture();
        let tree = create(&f, None);
        f.manager
            .execute(|op| {
                for i in 0..1000 {
                    tree.put(op, &key(i), &[1; 20])?;
                }
                Ok(())
            })
            .unwrap();
        f.manager
            .execute(|op| {
                for i in 100..900 {
                    assert!(tree.remove(op, &key(i))?.is_some());
                }
                Ok(())
            })
            .unwrap();
        let keys = all(&f, &tree, true)
            .into_iter()
            .map(|(k, _)| k)
            .collect::<Vec<_>>();
        let expected = (0..100).chain(900..1000).map(key).collect::<Vec<_>>();
        assert_eq!(expected, keys);
        let mut descending = all(&f, &tree, false);
        descending.reverse();
        assert_eq!(expected, descending.into_iter().map(|(k, _)| k).collect::<Vec<_>>());
    }

    #[test]
    fn test_encrypted_keys_keep_plain_order() {
        let f = fixture();
        let tree = create(&f, Some(Arc::new(XorEncryption(0x5a))));
        f.manager
            .execute(|op| {
                for i in (0..400).rev() {
                    tree.put(op, &key(i), &i.to_be_bytes())?;
                }
                Ok(())
            })
            .unwrap();
        let keys = all(&f, &tree, true)
            .into_iter()
            .map(|(k, _)| k)
            .collect::<Vec<_>>();
        assert_eq!((0..400).map(key).collect::<Vec<_>>(), keys);
        let mut pages = f.manager.shared_pages();
        assert_eq!(
            Some(17u32.to_be_bytes().to_vec()),
            tree.get(&mut pages, &key(17)).unwrap()
        );
    }

    #[test]
    fn test_header_counters() {
        let f = fixture();
        let tree = create(&f, None);
        f.manager
            .execute(|op| {
                assert_eq!(3, tree.add_size(op, 3)?);
                assert_eq!(2, tree.add_size(op, -1)?);
                assert_eq!(1, tree.next_entry_id(op)?);
                assert_eq!(2, tree.next_entry_id(op)?);
                assert!(tree.add_size(op, -5).is_err());
                Ok(())
            })
            .unwrap();
        let header = tree.header(&mut f.manager.shared_pages()).unwrap();
        assert_eq!(
            TreeHeader {
                version: 1,
                size: 2,
                entry_id: 2
            },
            header
        );
    }

    #[test]
    fn test_rollback_discards_splits() {
        let f = fixture();
        let tree = create(&f, None);
        let pages_before = f.write_cache.filled_up_to(tree.file_id()).unwrap();
        let result: anyhow::Result<()> = f.manager.execute(|op| {
            for i in 0..2000 {
                tree.put(op, &key(i), &[0; 16])?;
            }
            Err(anyhow!("abort"))
        });
        assert!(result.is_err());
        assert!(all(&f, &tree, true).is_empty());
        assert_eq!(pages_before, f.write_cache.filled_up_to(tree.file_id()).unwrap());
    }
}
