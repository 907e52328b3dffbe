use super::key::{decode_rid, KeyCodec, RID_KEY_SIZE};
use super::multi_value::{spilled_rids, StoredRids};
use super::tree::{CellTree, KeyRange, RawCursor};
use super::{Key, TreeContext};
use crate::id::Rid;
use anyhow::anyhow;
use std::collections::VecDeque;
use std::sync::Arc;

/// Entries fetched from the tree per batch.
const PREFETCH_SIZE: usize = 64;

/// How the cells of a tree map to `(key, rid)` pairs.
#[derive(Clone)]
pub(crate) enum CellLayout {
    /// The value is the rid.
    Single,
    /// The tree key ends with the encoded rid, the value is empty.
    Composite,
    /// The value holds the rids, or the id of a set in the container tree.
    Embedded { container: CellTree },
}

/// Splits a composite cell key into the index key and the rid.
pub(crate) fn split_composite(key: &[u8]) -> anyhow::Result<(&[u8], Rid)> {
    if key.len() < RID_KEY_SIZE {
        return Err(anyhow!("composite key of {} bytes has no rid", key.len()));
    }
    let (key, rid) = key.split_at(key.len() - RID_KEY_SIZE);
    Ok((key, decode_rid(rid)?))
}

pub(crate) fn decode_single(value: &[u8]) -> anyhow::Result<Rid> {
    if value.len() != Rid::SIZE {
        return Err(anyhow!("rid value of {} bytes", value.len()));
    }
    Ok(Rid::decode(value))
}

/// Iterates `(key, rid)` pairs of an index range.
///
/// Entries are prefetched in batches under the shared lock of the index. Between batches no lock
/// is held, changes committed meanwhile may or may not be observed but an entry is never returned
/// twice.
pub struct EntryCursor {
    context: TreeContext,
    component: String,
    tree: CellTree,
    codec: Arc<KeyCodec>,
    layout: CellLayout,
    ascending: bool,
    raw: RawCursor,
    pending: VecDeque<(Key, Rid)>,
    failed: bool,
}

impl EntryCursor {
    pub(crate) fn new(
        context: TreeContext,
        component: &str,
        tree: CellTree,
        codec: Arc<KeyCodec>,
        layout: CellLayout,
        range: KeyRange,
    ) -> Self {
        Self {
            context,
            component: component.to_string(),
            tree,
            codec,
            layout,
            ascending: range.ascending,
            raw: RawCursor::new(range),
            pending: VecDeque::new(),
            failed: false,
        }
    }

    fn fetch(&mut self) -> anyhow::Result<()> {
        let Self {
            context,
            component,
            tree,
            codec,
            layout,
            ascending,
            raw,
            pending,
            ..
        } = self;
        context.read(component, |pages| {
            for (key, value) in raw.next_batch(tree, pages, PREFETCH_SIZE)? {
                match layout {
                    CellLayout::Single => {
                        pending.push_back((codec.decode(&key)?, decode_single(&value)?));
                    }
                    CellLayout::Composite => {
                        let (key, rid) = split_composite(&key)?;
                        pending.push_back((codec.decode(key)?, rid));
                    }
                    CellLayout::Embedded { container } => {
                        let key = codec.decode(&key)?;
                        let mut rids = match StoredRids::decode(&value)? {
                            StoredRids::Embedded(rids) => rids,
                            StoredRids::Spilled { set_id, .. } => {
                                spilled_rids(container, pages, set_id)?
                            }
                        };
                        if !*ascending {
                            rids.reverse();
                        }
                        pending.extend(rids.into_iter().map(|rid| (key.clone(), rid)));
                    }
                }
            }
            Ok(())
        })
    }
}

impl Iterator for EntryCursor {
    type Item = anyhow::Result<(Key, Rid)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.pending.pop_front() {
                return Some(Ok(entry));
            }
            if self.failed || self.raw.is_done() {
                return None;
            }
            if let Err(err) = self.fetch() {
                self.failed = true;
                return Some(Err(err));
            }
        }
    }
}

/// Iterates the distinct keys of an index in ascending order.
pub struct KeyCursor {
    entries: EntryCursor,
    last: Option<Key>,
}

impl KeyCursor {
    pub(crate) fn new(entries: EntryCursor) -> Self {
        Self {
            entries,
            last: None,
        }
    }
}

impl Iterator for KeyCursor {
    type Item = anyhow::Result<Key>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.entries.next()? {
                Err(err) => return Some(Err(err)),
                Ok((key, _)) => {
                    if self.last.as_ref() != Some(&key) {
                        self.last = Some(key.clone());
                        return Some(Ok(key));
                    }
                }
            }
        }
    }
}
