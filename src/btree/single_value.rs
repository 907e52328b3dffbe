//! Unique index: every key maps to exactly one rid. The null key lives in a separate null bucket
//! file.

use super::bucket::max_entry_size;
use super::cursor::{decode_single, CellLayout, EntryCursor, KeyCursor};
use super::engine::{
    index_error, load_file, range_between, range_major, range_minor, CellBTreeEngine, EngineKind,
    IndexDefinition, DATA_EXTENSION, NULL_EXTENSION,
};
use super::key::{Key, KeyCodec};
use super::null_bucket::{NullBucketKind, NullBucketRead, NULL_BUCKET_PAGE};
use super::tree::{append_page, modify, CellTree, KeyRange};
use super::TreeContext;
use crate::atomic::AtomicOperation;
use crate::cache::PageSource;
use crate::error::StorageError;
use crate::id::{FileId, Rid};
use crate::po::PageOperation;
use std::sync::Arc;

pub struct SingleValueTree {
    name: String,
    version: u32,
    context: TreeContext,
    codec: Arc<KeyCodec>,
    tree: CellTree,
    null_file: FileId,
}

fn codec(definition: &IndexDefinition, page_size: usize) -> anyhow::Result<KeyCodec> {
    definition.codec(max_entry_size(page_size) - 8 - Rid::SIZE)
}

fn null_value<S: PageSource>(src: &mut S, null_file: FileId) -> anyhow::Result<Option<Rid>> {
    src.with_page(null_file, NULL_BUCKET_PAGE, |buff| {
        Ok(NullBucketRead::new(buff, NullBucketKind::Single)?.value())
    })
}

impl SingleValueTree {
    pub(crate) fn create(
        op: &mut AtomicOperation,
        context: &TreeContext,
        definition: &IndexDefinition,
    ) -> anyhow::Result<Self> {
        let name = definition.name.as_str();
        let codec = codec(definition, op.page_size())?;
        op.acquire_exclusive_lock(name)?;
        let tree = CellTree::create(
            op,
            &format!("{name}{DATA_EXTENSION}"),
            definition.version,
            definition.encryption.clone(),
        )?;
        let null_file = op.add_file(&format!("{name}{NULL_EXTENSION}"))?;
        append_page(
            op,
            null_file,
            [PageOperation::NullBucketInit {
                kind: NullBucketKind::Single,
            }],
        )?;
        Ok(Self {
            name: name.to_string(),
            version: definition.version,
            context: context.clone(),
            codec: Arc::new(codec),
            tree,
            null_file,
        })
    }

    pub(crate) fn load(
        context: &TreeContext,
        definition: &IndexDefinition,
    ) -> anyhow::Result<Self> {
        let name = definition.name.as_str();
        let data_name = format!("{name}{DATA_EXTENSION}");
        let tree = CellTree::open(
            &data_name,
            load_file(context, &data_name)?,
            definition.encryption.clone(),
        );
        let null_file = load_file(context, &format!("{name}{NULL_EXTENSION}"))?;
        let header = context.read(name, |pages| tree.header(pages))?;
        if header.version != definition.version {
            return Err(StorageError::InvalidState(format!(
                "index {name} has version {} on disk, {} was requested",
                header.version, definition.version
            ))
            .into());
        }
        Ok(Self {
            name: name.to_string(),
            version: definition.version,
            context: context.clone(),
            codec: Arc::new(codec(definition, context.write_cache().page_size())?),
            tree,
            null_file,
        })
    }

    fn put_null(
        &self,
        op: &mut AtomicOperation,
        rid: Rid,
        validator: &mut dyn FnMut(Option<Rid>, Rid) -> anyhow::Result<Option<Rid>>,
    ) -> anyhow::Result<bool> {
        let old = null_value(op, self.null_file)?;
        let Some(new) = validator(old, rid)? else {
            return Ok(false);
        };
        if old == Some(new) {
            return Ok(false);
        }
        modify(
            op,
            self.null_file,
            NULL_BUCKET_PAGE,
            [PageOperation::SingleNullSetValue { new, old }],
        )?;
        if old.is_none() {
            self.tree.add_size(op, 1)?;
        }
        Ok(true)
    }

    fn put_key(
        &self,
        op: &mut AtomicOperation,
        key: &[u8],
        rid: Rid,
        validator: &mut dyn FnMut(Option<Rid>, Rid) -> anyhow::Result<Option<Rid>>,
    ) -> anyhow::Result<bool> {
        let old = match self.tree.get(op, key)? {
            Some(value) => Some(decode_single(&value)?),
            None => None,
        };
        let Some(new) = validator(old, rid)? else {
            return Ok(false);
        };
        if old == Some(new) {
            return Ok(false);
        }
        let mut value = [0u8; Rid::SIZE];
        new.encode(&mut value);
        self.tree.put(op, key, &value)?;
        if old.is_none() {
            self.tree.add_size(op, 1)?;
        }
        Ok(true)
    }

    fn remove_null(&self, op: &mut AtomicOperation, rid: Option<Rid>) -> anyhow::Result<bool> {
        let Some(old) = null_value(op, self.null_file)? else {
            return Ok(false);
        };
        if rid.is_some_and(|rid| rid != old) {
            return Ok(false);
        }
        modify(
            op,
            self.null_file,
            NULL_BUCKET_PAGE,
            [PageOperation::SingleNullRemoveValue { old }],
        )?;
        self.tree.add_size(op, -1)?;
        Ok(true)
    }

    fn remove_key(
        &self,
        op: &mut AtomicOperation,
        key: &[u8],
        rid: Option<Rid>,
    ) -> anyhow::Result<bool> {
        if let Some(rid) = rid {
            match self.tree.get(op, key)? {
                Some(value) if decode_single(&value)? == rid => {}
                _ => return Ok(false),
            }
        }
        if self.tree.remove(op, key)?.is_none() {
            return Ok(false);
        }
        self.tree.add_size(op, -1)?;
        Ok(true)
    }

    fn cursor(&self, range: KeyRange) -> EntryCursor {
        EntryCursor::new(
            self.context.clone(),
            &self.name,
            self.tree.clone(),
            self.codec.clone(),
            CellLayout::Single,
            range,
        )
    }
}

impl CellBTreeEngine for SingleValueTree {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn kind(&self) -> EngineKind {
        EngineKind::SingleValue
    }

    fn put(&self, op: &mut AtomicOperation, key: Option<&Key>, rid: Rid) -> anyhow::Result<bool> {
        self.validated_put(op, key, rid, &mut |_, rid| Ok(Some(rid)))
    }

    fn validated_put(
        &self,
        op: &mut AtomicOperation,
        key: Option<&Key>,
        rid: Rid,
        validator: &mut dyn FnMut(Option<Rid>, Rid) -> anyhow::Result<Option<Rid>>,
    ) -> anyhow::Result<bool> {
        let encoded = key.map(|key| self.codec.encode(key)).transpose()?;
        op.acquire_exclusive_lock(&self.name)?;
        let result = match &encoded {
            Some(encoded) => self.put_key(op, encoded, rid, validator),
            None => self.put_null(op, rid, validator),
        };
        result.map_err(|err| index_error(&self.name, key, err))
    }

    fn remove(
        &self,
        op: &mut AtomicOperation,
        key: Option<&Key>,
        rid: Option<Rid>,
    ) -> anyhow::Result<bool> {
        let encoded = key.map(|key| self.codec.encode(key)).transpose()?;
        op.acquire_exclusive_lock(&self.name)?;
        let result = match &encoded {
            Some(encoded) => self.remove_key(op, encoded, rid),
            None => self.remove_null(op, rid),
        };
        result.map_err(|err| index_error(&self.name, key, err))
    }

    fn get(&self, key: Option<&Key>) -> anyhow::Result<Vec<Rid>> {
        let encoded = key.map(|key| self.codec.encode(key)).transpose()?;
        self.context.read(&self.name, |pages| {
            let rid = match &encoded {
                Some(encoded) => match self.tree.get(pages, encoded)? {
                    Some(value) => Some(decode_single(&value)?),
                    None => None,
                },
                None => null_value(pages, self.null_file)?,
            };
            Ok(rid.into_iter().collect())
        })
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
            false,
        )?;
        Ok(self.cursor(range))
    }

    fn iterate_entries_major(
        &self,
        key: &Key,
        inclusive: bool,
        ascending: bool,
    ) -> anyhow::Result<EntryCursor> {
        let range = range_major(&self.codec, key, inclusive, ascending, false)?;
        Ok(self.cursor(range))
    }

    fn iterate_entries_minor(
        &self,
        key: &Key,
        inclusive: bool,
        ascending: bool,
    ) -> anyhow::Result<EntryCursor> {
        let range = range_minor(&self.codec, key, inclusive, ascending, false)?;
        Ok(self.cursor(range))
    }

    fn first_key(&self) -> anyhow::Result<Option<Key>> {
        let key = self
            .context
            .read(&self.name, |pages| self.tree.first_key(pages))?;
        key.map(|key| self.codec.decode(&key)).transpose()
    }

    fn last_key(&self) -> anyhow::Result<Option<Key>> {
        let key = self
            .context
            .read(&self.name, |pages| self.tree.last_key(pages))?;
        key.map(|key| self.codec.decode(&key)).transpose()
    }

    fn key_cursor(&self) -> anyhow::Result<KeyCursor> {
        Ok(KeyCursor::new(self.cursor(KeyRange::all(true))))
    }

    fn size(&self) -> anyhow::Result<u64> {
        let header = self
            .context
            .read(&self.name, |pages| self.tree.header(pages))?;
        Ok(header.size)
    }

    fn delete(&self, op: &mut AtomicOperation) -> anyhow::Result<()> {
        op.acquire_exclusive_lock(&self.name)?;
        let size = self.tree.header(op)?.size;
        if size > 0 {
            return Err(StorageError::NotEmpty(format!(
                "index {} with {size} entries",
                self.name
            ))
            .into());
        }
        self.tree.delete(op)?;
        op.delete_file(self.null_file)?;
        Ok(())
    }

    fn close(&self) -> anyhow::Result<()> {
        let write_cache = self.context.write_cache();
        for file_id in [self.tree.file_id(), self.null_file] {
            self.context
                .read_cache()
                .close_file(file_id, true, write_cache.as_ref())?;
        }
        log::debug!("index_closed name={}", self.name);
        Ok(())
    }
}
