//! Non-unique index: a key maps to a set of rids.
//!
//! Three on-disk layouts exist:
//!
//! * v1 stores one cell per `(key, rid)` pair, the rids of the null key are embedded in a null
//!   bucket page, which bounds how many of them there can be.
//! * v2 stores one cell per key. Up to [`EMBEDDED_RIDS_LIMIT`] rids are embedded in the value,
//!   larger sets move to a container tree keyed by `(set id, rid)`. The null key follows the same
//!   scheme in its null bucket. Set ids come from the counter of the entry point.
//! * v3 stores one cell per `(key, rid)` pair and the null key in a second tree keyed by rid.

use super::bucket::max_entry_size;
use super::cursor::{split_composite, CellLayout, EntryCursor, KeyCursor};
use super::engine::{
    index_error, load_file, range_between, range_major, range_minor, CellBTreeEngine, EngineKind,
    IndexDefinition, CONTAINER_EXTENSION, DATA_EXTENSION, NULL_EXTENSION, NULL_TREE_SUFFIX,
};
use super::key::{decode_rid, encode_rid, Key, KeyCodec, RID_KEY_SIZE};
use super::null_bucket::{page_capacity, NullBucketKind, NullBucketRead, NULL_BUCKET_PAGE};
use super::tree::{append_page, modify, CellTree, KeyRange};
use super::TreeContext;
use crate::atomic::AtomicOperation;
use crate::bins::SliceExt;
use crate::cache::PageSource;
use crate::error::StorageError;
use crate::id::{FileId, Rid};
use crate::po::PageOperation;
use anyhow::anyhow;
use std::sync::Arc;

/// Rids a v2 cell or null bucket holds before the set moves to the container.
pub(crate) const EMBEDDED_RIDS_LIMIT: usize = 64;

const EMBEDDED_TAG: u8 = 0;
const SPILLED_TAG: u8 = 1;

/// Largest encoded [`StoredRids`].
const MAX_STORED_RIDS_SIZE: usize = 5 + EMBEDDED_RIDS_LIMIT * Rid::SIZE;

/// Value of a v2 cell.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum StoredRids {
    /// Sorted.
    Embedded(Vec<Rid>),
    Spilled { set_id: u64, count: u64 },
}

impl StoredRids {
    pub(crate) fn encode(&self) -> Vec<u8> {
        match self {
            StoredRids::Embedded(rids) => {
                let mut buff = vec![0u8; 5 + rids.len() * Rid::SIZE];
                buff[0] = EMBEDDED_TAG;
                buff[1..5].copy_from_slice(&(rids.len() as u32).to_be_bytes());
                for (i, rid) in rids.iter().enumerate() {
                    rid.encode(&mut buff[5 + i * Rid::SIZE..]);
                }
                buff
            }
            StoredRids::Spilled { set_id, count } => {
                let mut buff = Vec::with_capacity(17);
                buff.push(SPILLED_TAG);
                buff.extend_from_slice(&set_id.to_be_bytes());
                buff.extend_from_slice(&count.to_be_bytes());
                buff
            }
        }
    }

    pub(crate) fn decode(buff: &[u8]) -> anyhow::Result<Self> {
        match buff.first() {
            Some(&EMBEDDED_TAG) if buff.len() >= 5 => {
                let count = buff[1..].read_u32() as usize;
                if buff.len() != 5 + count * Rid::SIZE {
                    return Err(anyhow!("embedded rid set of {} bytes", buff.len()));
                }
                Ok(StoredRids::Embedded(
                    (0..count)
                        .map(|i| Rid::decode(&buff[5 + i * Rid::SIZE..]))
                        .collect(),
                ))
            }
            Some(&SPILLED_TAG) if buff.len() == 17 => Ok(StoredRids::Spilled {
                set_id: buff[1..].read_u64(),
                count: buff[9..].read_u64(),
            }),
            _ => Err(anyhow!("invalid rid set value")),
        }
    }
}

fn container_key(set_id: u64, rid: &Rid) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + RID_KEY_SIZE);
    key.extend_from_slice(&set_id.to_be_bytes());
    encode_rid(rid, &mut key);
    key
}

fn rid_key(rid: &Rid) -> Vec<u8> {
    let mut key = Vec::with_capacity(RID_KEY_SIZE);
    encode_rid(rid, &mut key);
    key
}

fn composite_key(key: &[u8], rid: &Rid) -> Vec<u8> {
    let mut composite = Vec::with_capacity(key.len() + RID_KEY_SIZE);
    composite.extend_from_slice(key);
    encode_rid(rid, &mut composite);
    composite
}

/// Rids of a spilled set, ordered.
pub(crate) fn spilled_rids<S: PageSource>(
    container: &CellTree,
    src: &mut S,
    set_id: u64,
) -> anyhow::Result<Vec<Rid>> {
    container
        .fetch_all(src, KeyRange::with_prefix(set_id.to_be_bytes().to_vec(), true))?
        .into_iter()
        .map(|(key, _)| decode_rid(&key[8..]))
        .collect()
}

/// Null bucket state of the multi-value layouts.
struct NullState {
    mid: u64,
    size: u32,
    rids: Vec<Rid>,
}

fn null_state<S: PageSource>(src: &mut S, null_file: FileId) -> anyhow::Result<NullState> {
    src.with_page(null_file, NULL_BUCKET_PAGE, |buff| {
        let bucket = NullBucketRead::new(buff, NullBucketKind::Multi)?;
        Ok(NullState {
            mid: bucket.mid(),
            size: bucket.size(),
            rids: bucket.rids(),
        })
    })
}

fn init_null_bucket(op: &mut AtomicOperation, name: &str) -> anyhow::Result<FileId> {
    let null_file = op.add_file(&format!("{name}{NULL_EXTENSION}"))?;
    append_page(
        op,
        null_file,
        [PageOperation::NullBucketInit {
            kind: NullBucketKind::Multi,
        }],
    )?;
    Ok(null_file)
}

enum Layout {
    V1 { null_file: FileId },
    V2 { container: CellTree, null_file: FileId },
    V3 { null_tree: CellTree },
}

pub struct MultiValueTree {
    name: String,
    version: u32,
    context: TreeContext,
    codec: Arc<KeyCodec>,
    tree: CellTree,
    layout: Layout,
}

fn codec(definition: &IndexDefinition, page_size: usize) -> anyhow::Result<KeyCodec> {
    let value_size = if definition.version == 2 {
        MAX_STORED_RIDS_SIZE
    } else {
        RID_KEY_SIZE
    };
    definition.codec(max_entry_size(page_size) - 8 - value_size)
}

impl MultiValueTree {
    pub(crate) fn create(
        op: &mut AtomicOperation,
        context: &TreeContext,
        definition: &IndexDefinition,
    ) -> anyhow::Result<Self> {
        let name = definition.name.as_str();
        let version = definition.version;
        let codec = codec(definition, op.page_size())?;
        op.acquire_exclusive_lock(name)?;
        let tree = CellTree::create(
            op,
            &format!("{name}{DATA_EXTENSION}"),
            version,
            definition.encryption.clone(),
        )?;
        let layout = match version {
            1 => Layout::V1 {
                null_file: init_null_bucket(op, name)?,
            },
            2 => Layout::V2 {
                container: CellTree::create(
                    op,
                    &format!("{name}{CONTAINER_EXTENSION}"),
                    version,
                    None,
                )?,
                null_file: init_null_bucket(op, name)?,
            },
            3 => Layout::V3 {
                null_tree: CellTree::create(
                    op,
                    &format!("{name}{NULL_TREE_SUFFIX}{DATA_EXTENSION}"),
                    version,
                    None,
                )?,
            },
            _ => return Err(StorageError::UnsupportedVersion(version).into()),
        };
        Ok(Self {
            name: name.to_string(),
            version,
            context: context.clone(),
            codec: Arc::new(codec),
            tree,
            layout,
        })
    }

    pub(crate) fn load(
        context: &TreeContext,
        definition: &IndexDefinition,
    ) -> anyhow::Result<Self> {
        let name = definition.name.as_str();
        let version = definition.version;
        let open_tree = |file_name: String, encryption| -> anyhow::Result<CellTree> {
            let file_id = load_file(context, &file_name)?;
            Ok(CellTree::open(&file_name, file_id, encryption))
        };
        let tree = open_tree(
            format!("{name}{DATA_EXTENSION}"),
            definition.encryption.clone(),
        )?;
        let layout = match version {
            1 => Layout::V1 {
                null_file: load_file(context, &format!("{name}{NULL_EXTENSION}"))?,
            },
            2 => Layout::V2 {
                container: open_tree(format!("{name}{CONTAINER_EXTENSION}"), None)?,
                null_file: load_file(context, &format!("{name}{NULL_EXTENSION}"))?,
            },
            3 => Layout::V3 {
                null_tree: open_tree(format!("{name}{NULL_TREE_SUFFIX}{DATA_EXTENSION}"), None)?,
            },
            _ => return Err(StorageError::UnsupportedVersion(version).into()),
        };
        let header = context.read(name, |pages| tree.header(pages))?;
        if header.version != version {
            return Err(StorageError::InvalidState(format!(
                "index {name} has version {} on disk, {version} was requested",
                header.version
            ))
            .into());
        }
        Ok(Self {
            name: name.to_string(),
            version,
            context: context.clone(),
            codec: Arc::new(codec(definition, context.write_cache().page_size())?),
            tree,
            layout,
        })
    }

    fn files(&self) -> Vec<FileId> {
        let mut files = vec![self.tree.file_id()];
        match &self.layout {
            Layout::V1 { null_file } => files.push(*null_file),
            Layout::V2 {
                container,
                null_file,
            } => {
                files.push(container.file_id());
                files.push(*null_file);
            }
            Layout::V3 { null_tree } => files.push(null_tree.file_id()),
        }
        files
    }

    /// Rids of `key`, `None` being the null key.
    fn rids<S: PageSource>(&self, src: &mut S, key: Option<&[u8]>) -> anyhow::Result<Vec<Rid>> {
        match (&self.layout, key) {
            (Layout::V1 { .. } | Layout::V3 { .. }, Some(key)) => self
                .tree
                .fetch_all(src, KeyRange::with_prefix(key.to_vec(), true))?
                .into_iter()
                .map(|(cell, _)| Ok(split_composite(&cell)?.1))
                .collect(),
            (Layout::V2 { container, .. }, Some(key)) => match self.tree.get(src, key)? {
                None => Ok(Vec::new()),
                Some(value) => match StoredRids::decode(&value)? {
                    StoredRids::Embedded(rids) => Ok(rids),
                    StoredRids::Spilled { set_id, .. } => spilled_rids(container, src, set_id),
                },
            },
            (Layout::V1 { null_file }, None) => Ok(null_state(src, *null_file)?.rids),
            (
                Layout::V2 {
                    container,
                    null_file,
                },
                None,
            ) => {
                let state = null_state(src, *null_file)?;
                if state.mid == 0 {
                    Ok(state.rids)
                } else {
                    spilled_rids(container, src, state.mid)
                }
            }
            (Layout::V3 { null_tree }, None) => null_tree
                .fetch_all(src, KeyRange::all(true))?
                .into_iter()
                .map(|(key, _)| decode_rid(&key))
                .collect(),
        }
    }

    fn contains(
        &self,
        op: &mut AtomicOperation,
        key: Option<&[u8]>,
        rid: &Rid,
    ) -> anyhow::Result<bool> {
        match (&self.layout, key) {
            (Layout::V1 { .. } | Layout::V3 { .. }, Some(key)) => {
                Ok(self.tree.get(op, &composite_key(key, rid))?.is_some())
            }
            (Layout::V3 { null_tree }, None) => Ok(null_tree.get(op, &rid_key(rid))?.is_some()),
            _ => Ok(self.rids(op, key)?.binary_search(rid).is_ok()),
        }
    }

    fn insert(
        &self,
        op: &mut AtomicOperation,
        key: Option<&[u8]>,
        rid: Rid,
    ) -> anyhow::Result<bool> {
        if self.contains(op, key, &rid)? {
            return Ok(false);
        }
        match (&self.layout, key) {
            (Layout::V1 { .. } | Layout::V3 { .. }, Some(key)) => {
                self.tree.put(op, &composite_key(key, &rid), &[])?;
                self.tree.add_size(op, 1)?;
            }
            (Layout::V2 { container, .. }, Some(key)) => {
                self.insert_v2(op, container, key, rid)?;
                self.tree.add_size(op, 1)?;
            }
            (Layout::V1 { null_file }, None) => {
                let state = null_state(op, *null_file)?;
                let capacity = page_capacity(op.page_size());
                if state.rids.len() >= capacity {
                    return Err(StorageError::ResourceExhausted(format!(
                        "null bucket of index {} holds at most {capacity} rids",
                        self.name
                    ))
                    .into());
                }
                let index = state.rids.binary_search(&rid).unwrap_or_else(|i| i);
                modify(
                    op,
                    *null_file,
                    NULL_BUCKET_PAGE,
                    [
                        PageOperation::NullAddValue {
                            index: index as u32,
                            rid,
                        },
                        PageOperation::NullIncrementSize,
                    ],
                )?;
            }
            (
                Layout::V2 {
                    container,
                    null_file,
                },
                None,
            ) => self.insert_null_v2(op, container, *null_file, rid)?,
            (Layout::V3 { null_tree }, None) => {
                null_tree.put(op, &rid_key(&rid), &[])?;
                null_tree.add_size(op, 1)?;
            }
        }
        Ok(true)
    }

    fn insert_v2(
        &self,
        op: &mut AtomicOperation,
        container: &CellTree,
        key: &[u8],
        rid: Rid,
    ) -> anyhow::Result<()> {
        let stored = match self.tree.get(op, key)? {
            None => StoredRids::Embedded(vec![rid]),
            Some(value) => match StoredRids::decode(&value)? {
                StoredRids::Embedded(mut rids) if rids.len() < EMBEDDED_RIDS_LIMIT => {
                    let index = rids.binary_search(&rid).unwrap_or_else(|i| i);
                    rids.insert(index, rid);
                    StoredRids::Embedded(rids)
                }
                StoredRids::Embedded(rids) => {
                    let set_id = self.tree.next_entry_id(op)?;
                    for moved in rids.iter().chain([&rid]) {
                        container.put(op, &container_key(set_id, moved), &[])?;
                    }
                    log::debug!(
                        "index_rids_spilled name={} set_id={set_id} count={}",
                        self.name,
                        rids.len() + 1
                    );
                    StoredRids::Spilled {
                        set_id,
                        count: rids.len() as u64 + 1,
                    }
                }
                StoredRids::Spilled { set_id, count } => {
                    container.put(op, &container_key(set_id, &rid), &[])?;
                    StoredRids::Spilled {
                        set_id,
                        count: count + 1,
                    }
                }
            },
        };
        self.tree.put(op, key, &stored.encode())?;
        Ok(())
    }

    fn insert_null_v2(
        &self,
        op: &mut AtomicOperation,
        container: &CellTree,
        null_file: FileId,
        rid: Rid,
    ) -> anyhow::Result<()> {
        let state = null_state(op, null_file)?;
        if state.mid != 0 {
            container.put(op, &container_key(state.mid, &rid), &[])?;
            return modify(
                op,
                null_file,
                NULL_BUCKET_PAGE,
                [PageOperation::NullIncrementSize],
            );
        }
        if state.rids.len() < EMBEDDED_RIDS_LIMIT {
            let index = state.rids.binary_search(&rid).unwrap_or_else(|i| i);
            return modify(
                op,
                null_file,
                NULL_BUCKET_PAGE,
                [
                    PageOperation::NullAddValue {
                        index: index as u32,
                        rid,
                    },
                    PageOperation::NullIncrementSize,
                ],
            );
        }

        let set_id = self.tree.next_entry_id(op)?;
        for moved in state.rids.iter().chain([&rid]) {
            container.put(op, &container_key(set_id, moved), &[])?;
        }
        let mut operations = vec![PageOperation::NullSetMid {
            new: set_id,
            old: 0,
        }];
        for (index, moved) in state.rids.iter().enumerate().rev() {
            operations.push(PageOperation::NullRemoveValue {
                index: index as u32,
                rid: *moved,
            });
        }
        operations.push(PageOperation::NullIncrementSize);
        modify(op, null_file, NULL_BUCKET_PAGE, operations)?;
        log::debug!(
            "index_null_rids_spilled name={} set_id={set_id} count={}",
            self.name,
            state.rids.len() + 1
        );
        Ok(())
    }

    fn remove_entry(
        &self,
        op: &mut AtomicOperation,
        key: Option<&[u8]>,
        rid: Rid,
    ) -> anyhow::Result<bool> {
        match (&self.layout, key) {
            (Layout::V1 { .. } | Layout::V3 { .. }, Some(key)) => {
                if self.tree.remove(op, &composite_key(key, &rid))?.is_none() {
                    return Ok(false);
                }
                self.tree.add_size(op, -1)?;
            }
            (Layout::V2 { container, .. }, Some(key)) => {
                if !self.remove_v2(op, container, key, rid)? {
                    return Ok(false);
                }
                self.tree.add_size(op, -1)?;
            }
            (Layout::V1 { null_file }, None) => {
                let state = null_state(op, *null_file)?;
                let Ok(index) = state.rids.binary_search(&rid) else {
                    return Ok(false);
                };
                modify(
                    op,
                    *null_file,
                    NULL_BUCKET_PAGE,
                    [
                        PageOperation::NullRemoveValue {
                            index: index as u32,
                            rid,
                        },
                        PageOperation::NullDecrementSize,
                    ],
                )?;
            }
            (
                Layout::V2 {
                    container,
                    null_file,
                },
                None,
            ) => {
                let state = null_state(op, *null_file)?;
                let mut operations = Vec::new();
                if state.mid == 0 {
                    let Ok(index) = state.rids.binary_search(&rid) else {
                        return Ok(false);
                    };
                    operations.push(PageOperation::NullRemoveValue {
                        index: index as u32,
                        rid,
                    });
                } else {
                    if container
                        .remove(op, &container_key(state.mid, &rid))?
                        .is_none()
                    {
                        return Ok(false);
                    }
                    if state.size == 1 {
                        operations.push(PageOperation::NullSetMid {
                            new: 0,
                            old: state.mid,
                        });
                    }
                }
                operations.push(PageOperation::NullDecrementSize);
                modify(op, *null_file, NULL_BUCKET_PAGE, operations)?;
            }
            (Layout::V3 { null_tree }, None) => {
                if null_tree.remove(op, &rid_key(&rid))?.is_none() {
                    return Ok(false);
                }
                null_tree.add_size(op, -1)?;
            }
        }
        Ok(true)
    }

    fn remove_v2(
        &self,
        op: &mut AtomicOperation,
        container: &CellTree,
        key: &[u8],
        rid: Rid,
    ) -> anyhow::Result<bool> {
        let Some(value) = self.tree.get(op, key)? else {
            return Ok(false);
        };
        let stored = match StoredRids::decode(&value)? {
            StoredRids::Embedded(mut rids) => {
                let Ok(index) = rids.binary_search(&rid) else {
                    return Ok(false);
                };
                rids.remove(index);
                StoredRids::Embedded(rids)
            }
            StoredRids::Spilled { set_id, count } => {
                if container
                    .remove(op, &container_key(set_id, &rid))?
                    .is_none()
                {
                    return Ok(false);
                }
                StoredRids::Spilled {
                    set_id,
                    count: count - 1,
                }
            }
        };
        match stored {
            StoredRids::Embedded(rids) if rids.is_empty() => {
                self.tree.remove(op, key)?;
            }
            StoredRids::Spilled { count: 0, .. } => {
                self.tree.remove(op, key)?;
            }
            stored => {
                self.tree.put(op, key, &stored.encode())?;
            }
        }
        Ok(true)
    }

    fn null_size<S: PageSource>(&self, src: &mut S) -> anyhow::Result<u64> {
        match &self.layout {
            Layout::V1 { null_file } | Layout::V2 { null_file, .. } => {
                Ok(null_state(src, *null_file)?.size as u64)
            }
            Layout::V3 { null_tree } => Ok(null_tree.header(src)?.size),
        }
    }

    fn is_composite(&self) -> bool {
        !matches!(self.layout, Layout::V2 { .. })
    }

    fn decode_key(&self, cell: &[u8]) -> anyhow::Result<Key> {
        if self.is_composite() {
            self.codec.decode(split_composite(cell)?.0)
        } else {
            self.codec.decode(cell)
        }
    }

    fn cursor(&self, range: KeyRange) -> EntryCursor {
        let layout = match &self.layout {
            Layout::V2 { container, .. } => CellLayout::Embedded {
                container: container.clone(),
            },
            _ => CellLayout::Composite,
        };
        EntryCursor::new(
            self.context.clone(),
            &self.name,
            self.tree.clone(),
            self.codec.clone(),
            layout,
            range,
        )
    }
}

impl CellBTreeEngine for MultiValueTree {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn kind(&self) -> EngineKind {
        EngineKind::MultiValue
    }

    fn put(&self, op: &mut AtomicOperation, key: Option<&Key>, rid: Rid) -> anyhow::Result<bool> {
        self.validated_put(op, key, rid, &mut |_, rid| Ok(Some(rid)))
    }

    /// The validator sees `Some(rid)` when the pair is already present.
    fn validated_put(
        &self,
        op: &mut AtomicOperation,
        key: Option<&Key>,
        rid: Rid,
        validator: &mut dyn FnMut(Option<Rid>, Rid) -> anyhow::Result<Option<Rid>>,
    ) -> anyhow::Result<bool> {
        let encoded = key.map(|key| self.codec.encode(key)).transpose()?;
        op.acquire_exclusive_lock(&self.name)?;
        let mut put = || -> anyhow::Result<bool> {
            let present = self.contains(op, encoded.as_deref(), &rid)?;
            match validator(present.then_some(rid), rid)? {
                Some(rid) => self.insert(op, encoded.as_deref(), rid),
                None => Ok(false),
            }
        };
        put().map_err(|err| index_error(&self.name, key, err))
    }

    fn remove(
        &self,
        op: &mut AtomicOperation,
        key: Option<&Key>,
        rid: Option<Rid>,
    ) -> anyhow::Result<bool> {
        let encoded = key.map(|key| self.codec.encode(key)).transpose()?;
        op.acquire_exclusive_lock(&self.name)?;
        let mut remove = || -> anyhow::Result<bool> {
            let rids = match rid {
                Some(rid) => vec![rid],
                None => self.rids(op, encoded.as_deref())?,
            };
            let mut removed = false;
            for rid in rids {
                removed |= self.remove_entry(op, encoded.as_deref(), rid)?;
            }
            Ok(removed)
        };
        remove().map_err(|err| index_error(&self.name, key, err))
    }

    fn get(&self, key: Option<&Key>) -> anyhow::Result<Vec<Rid>> {
        let encoded = key.map(|key| self.codec.encode(key)).transpose()?;
        self.context
            .read(&self.name, |pages| self.rids(pages, encoded.as_deref()))
    }

    fn iterate_entries_between(
        &self,
        from: &Key,
        from_inclusive: bool,
        to: &Key,
        to_inclusive: bool,
        ascending: bool,
    ) -> anyhow::Result<EntryCursor> {
        let range = range_between(
            &self.codec,
            from,
            from_inclusive,
            to,
            to_inclusive,
            ascending,
            self.is_composite(),
        )?;
        Ok(self.cursor(range))
    }

    fn iterate_entries_major(
        &self,
        key: &Key,
        inclusive: bool,
        ascending: bool,
    ) -> anyhow::Result<EntryCursor> {
        let range = range_major(&self.codec, key, inclusive, ascending, self.is_composite())?;
        Ok(self.cursor(range))
    }

    fn iterate_entries_minor(
        &self,
        key: &Key,
        inclusive: bool,
        ascending: bool,
    ) -> anyhow::Result<EntryCursor> {
        let range = range_minor(&self.codec, key, inclusive, ascending, self.is_composite())?;
        Ok(self.cursor(range))
    }

    fn first_key(&self) -> anyhow::Result<Option<Key>> {
        let cell = self
            .context
            .read(&self.name, |pages| self.tree.first_key(pages))?;
        cell.map(|cell| self.decode_key(&cell)).transpose()
    }

    fn last_key(&self) -> anyhow::Result<Option<Key>> {
        let cell = self
            .context
            .read(&self.name, |pages| self.tree.last_key(pages))?;
        cell.map(|cell| self.decode_key(&cell)).transpose()
    }

    fn key_cursor(&self) -> anyhow::Result<KeyCursor> {
        Ok(KeyCursor::new(self.cursor(KeyRange::all(true))))
    }

    fn size(&self) -> anyhow::Result<u64> {
        self.context.read(&self.name, |pages| {
            Ok(self.tree.header(pages)?.size + self.null_size(pages)?)
        })
    }

    fn delete(&self, op: &mut AtomicOperation) -> anyhow::Result<()> {
        op.acquire_exclusive_lock(&self.name)?;
        let size = self.tree.header(op)?.size + self.null_size(op)?;
        if size > 0 {
            return Err(StorageError::NotEmpty(format!(
                "index {} with {size} entries",
                self.name
            ))
            .into());
        }
        for file_id in self.files() {
            op.delete_file(file_id)?;
        }
        log::debug!("index_deleted name={}", self.name);
        Ok(())
    }

    fn close(&self) -> anyhow::Result<()> {
        let write_cache = self.context.write_cache();
        for file_id in self.files() {
            self.context
                .read_cache()
                .close_file(file_id, true, write_cache.as_ref())?;
        }
        log::debug!("index_closed name={}", self.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::engine::create_engine;
    use crate::btree::key::KeyType;
    use crate::btree::tests::{fixture, Fixture};
    use crate::btree::IndexEngine;

    fn create(f: &Fixture, name: &str, version: u32) -> IndexEngine {
        let definition =
            IndexDefinition::new(name, EngineKind::MultiValue, version, vec![KeyType::Integer]);
        f.manager
            .execute(|op| create_engine(op, &f.context, &definition))
            .unwrap()
    }

    fn rid(position: i64) -> Rid {
        Rid::new(4, position)
    }

    fn entries(cursor: EntryCursor) -> Vec<(Key, Rid)> {
        cursor.collect::<anyhow::Result<Vec<_>>>().unwrap()
    }

    #[test]
    fn test_stored_rids_encoding() {
        let embedded = StoredRids::Embedded(vec![rid(1), rid(5)]);
        assert_eq!(embedded, StoredRids::decode(&embedded.encode()).unwrap());
        let spilled = StoredRids::Spilled {
            set_id: 3,
            count: 70,
        };
        assert_eq!(spilled, StoredRids::decode(&spilled.encode()).unwrap());
        assert!(StoredRids::decode(&[7, 0]).is_err());
        assert!(
            StoredRids::Embedded(vec![rid(0); EMBEDDED_RIDS_LIMIT])
                .encode()
                .len()
                <= MAX_STORED_RIDS_SIZE
        );
    }

    #[test]
    fn test_put_get_remove_every_version() {
        let f = fixture();
        for version in 1..=3 {
            let index = create(&f, &format!("multi{version}"), version);
            f.manager
                .execute(|op| {
                    for key in 0..50 {
                        for position in (0..3).rev() {
                            assert!(index.put(op, Some(&Key::from(key)), rid(position))?);
                        }
                    }
                    assert!(!index.put(op, Some(&Key::from(7)), rid(1))?);
                    assert!(index.put(op, None, rid(9))?);
                    assert!(index.put(op, None, rid(8))?);
                    assert!(!index.put(op, None, rid(8))?);
                    Ok(())
                })
                .unwrap();

            assert_eq!(152, index.size().unwrap(), "version {version}");
            assert_eq!(
                vec![rid(0), rid(1), rid(2)],
                index.get(Some(&Key::from(7))).unwrap()
            );
            assert_eq!(vec![rid(8), rid(9)], index.get(None).unwrap());
            assert!(index.get(Some(&Key::from(70))).unwrap().is_empty());

            f.manager
                .execute(|op| {
                    assert!(index.remove(op, Some(&Key::from(7)), Some(rid(1)))?);
                    assert!(!index.remove(op, Some(&Key::from(7)), Some(rid(1)))?);
                    assert!(index.remove(op, Some(&Key::from(8)), None)?);
                    assert!(index.remove(op, None, Some(rid(9)))?);
                    Ok(())
                })
                .unwrap();
            assert_eq!(147, index.size().unwrap(), "version {version}");
            assert_eq!(vec![rid(0), rid(2)], index.get(Some(&Key::from(7))).unwrap());
            assert!(index.get(Some(&Key::from(8))).unwrap().is_empty());
            assert_eq!(vec![rid(8)], index.get(None).unwrap());

            let keys = index
                .key_cursor()
                .unwrap()
                .collect::<anyhow::Result<Vec<_>>>()
                .unwrap();
            assert_eq!(49, keys.len());
            assert_eq!(Some(Key::from(0)), index.first_key().unwrap());
            assert_eq!(Some(Key::from(49)), index.last_key().unwrap());
        }
    }

    #[test]
    fn test_ranges_expand_every_rid() {
        let f = fixture();
        for version in 1..=3 {
            let index = create(&f, &format!("range{version}"), version);
            f.manager
                .execute(|op| {
                    for key in 0..20 {
                        for position in 0..2 {
                            let value = rid(key as i64 * 10 + position);
                            index.put(op, Some(&Key::from(key)), value)?;
                        }
                    }
                    Ok(())
                })
                .unwrap();

            let ascending = entries(
                index
                    .iterate_entries_between(&Key::from(3), true, &Key::from(5), true, true)
                    .unwrap(),
            );
            assert_eq!(
                vec![
                    (Key::from(3), rid(30)),
                    (Key::from(3), rid(31)),
                    (Key::from(4), rid(40)),
                    (Key::from(4), rid(41)),
                    (Key::from(5), rid(50)),
                    (Key::from(5), rid(51)),
                ],
                ascending
            );

            let mut descending = entries(
                index
                    .iterate_entries_between(&Key::from(3), true, &Key::from(5), true, false)
                    .unwrap(),
            );
            descending.reverse();
            assert_eq!(ascending, descending, "version {version}");

            let major = entries(index.iterate_entries_major(&Key::from(17), false, true).unwrap());
            assert_eq!(4, major.len());
            let minor = entries(index.iterate_entries_minor(&Key::from(1), false, false).unwrap());
            assert_eq!(vec![(Key::from(0), rid(1)), (Key::from(0), rid(0))], minor);
        }
    }

    #[test]
    fn test_v2_spills_large_sets() {
        let f = fixture();
        let index = create(&f, "spill", 2);
        let count = EMBEDDED_RIDS_LIMIT as i64 + 36;
        f.manager
            .execute(|op| {
                for position in (0..count).rev() {
                    index.put(op, Some(&Key::from(1)), rid(position))?;
                    index.put(op, None, rid(position))?;
                }
                index.put(op, Some(&Key::from(2)), rid(0))?;
                Ok(())
            })
            .unwrap();

        let expected = (0..count).map(rid).collect::<Vec<_>>();
        assert_eq!(expected, index.get(Some(&Key::from(1))).unwrap());
        assert_eq!(expected, index.get(None).unwrap());
        assert_eq!(2 * count as u64 + 1, index.size().unwrap());

        let all = entries(index.iterate_entries_major(&Key::from(0), true, true).unwrap());
        assert_eq!(count as usize + 1, all.len());
        assert_eq!((Key::from(2), rid(0)), all[all.len() - 1]);

        f.manager
            .execute(|op| {
                for position in 0..count {
                    assert!(index.remove(op, Some(&Key::from(1)), Some(rid(position)))?);
                    assert!(index.remove(op, None, Some(rid(position)))?);
                }
                Ok(())
            })
            .unwrap();
        assert!(index.get(Some(&Key::from(1))).unwrap().is_empty());
        assert!(index.get(None).unwrap().is_empty());
        assert_eq!(1, index.size().unwrap());

        f.manager
            .execute(|op| index.put(op, None, rid(5)))
            .unwrap();
        assert_eq!(vec![rid(5)], index.get(None).unwrap());
    }

    #[test]
    fn test_v1_null_bucket_is_bounded() {
        let f = fixture();
        let index = create(&f, "bounded", 1);
        let capacity = page_capacity(4096) as i64;
        f.manager
            .execute(|op| {
                for position in 0..capacity {
                    index.put(op, None, rid(position))?;
                }
                Ok(())
            })
            .unwrap();
        let err = f
            .manager
            .execute(|op| index.put(op, None, rid(capacity)))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::Index { .. })
        ));
        assert!(err.to_string().contains("resource exhausted"));
        assert_eq!(capacity as u64, index.size().unwrap());
    }

    #[test]
    fn test_delete_and_reload() {
        let f = fixture();
        let index = create(&f, "gone", 3);
        f.manager
            .execute(|op| index.put(op, None, rid(1)))
            .unwrap();
        assert!(f.manager.execute(|op| index.delete(op)).is_err());
        index.close().unwrap();

        let definition =
            IndexDefinition::new("gone", EngineKind::MultiValue, 3, vec![KeyType::Integer]);
        let index = MultiValueTree::load(&f.context, &definition).unwrap();
        assert_eq!(vec![rid(1)], index.get(None).unwrap());
        let wrong = IndexDefinition {
            version: 1,
            ..definition.clone()
        };
        assert!(MultiValueTree::load(&f.context, &wrong).is_err());

        f.manager
            .execute(|op| {
                index.remove(op, None, None)?;
                index.delete(op)
            })
            .unwrap();
        assert!(f.context.write_cache().file_id("gone$n.cbt").is_none());
    }
}
