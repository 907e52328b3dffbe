use super::cursor::{EntryCursor, KeyCursor};
use super::key::{Encryption, Key, KeyCodec, KeySerializer, KeyType, MemcomparableSerializer};
use super::multi_value::MultiValueTree;
use super::single_value::SingleValueTree;
use super::tree::{KeyBound, KeyRange};
use super::TreeContext;
use crate::atomic::AtomicOperation;
use crate::error::StorageError;
use crate::id::Rid;
use std::sync::Arc;

pub(crate) const DATA_EXTENSION: &str = ".cbt";
pub(crate) const NULL_EXTENSION: &str = ".nbt";
pub(crate) const CONTAINER_EXTENSION: &str = ".mbt";
pub(crate) const NULL_TREE_SUFFIX: &str = "$n";

/// Engine versions that can be created and loaded.
pub const SUPPORTED_VERSIONS: [u32; 3] = [1, 2, 3];

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EngineKind {
    SingleValue,
    MultiValue,
}

/// What it takes to create or load an index.
#[derive(Clone)]
pub struct IndexDefinition {
    pub name: String,
    pub kind: EngineKind,
    pub version: u32,
    pub key_types: Vec<KeyType>,
    pub serializer: Arc<dyn KeySerializer>,
    pub encryption: Option<Arc<dyn Encryption>>,
}

impl IndexDefinition {
    pub fn new(name: &str, kind: EngineKind, version: u32, key_types: Vec<KeyType>) -> Self {
        Self {
            name: name.to_string(),
            kind,
            version,
            key_types,
            serializer: Arc::new(MemcomparableSerializer),
            encryption: None,
        }
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn KeySerializer>) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn with_encryption(mut self, encryption: Arc<dyn Encryption>) -> Self {
        self.encryption = Some(encryption);
        self
    }

    pub(crate) fn codec(&self, max_key_size: usize) -> anyhow::Result<KeyCodec> {
        KeyCodec::new(
            self.serializer.clone(),
            self.key_types.clone(),
            self.key_types.len(),
            self.encryption.clone(),
            max_key_size,
        )
    }
}

/// Operations every index engine provides. A `None` key is the null key.
///
/// Mutations run inside the caller's atomic operation and take the exclusive lock of the index
/// for the rest of it. Reads see the committed state under the shared lock of the index.
pub trait CellBTreeEngine: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> u32;

    fn kind(&self) -> EngineKind;

    /// Associates `rid` with `key`. Returns false when nothing changed.
    fn put(&self, op: &mut AtomicOperation, key: Option<&Key>, rid: Rid) -> anyhow::Result<bool>;

    /// Like [`CellBTreeEngine::put`], but `validator` sees the current value and decides what is
    /// stored. `Ok(None)` from the validator leaves the index untouched.
    fn validated_put(
        &self,
        op: &mut AtomicOperation,
        key: Option<&Key>,
        rid: Rid,
        validator: &mut dyn FnMut(Option<Rid>, Rid) -> anyhow::Result<Option<Rid>>,
    ) -> anyhow::Result<bool>;

    /// Removes the association of `key` with `rid`, or every association of `key` without a rid.
    fn remove(
        &self,
        op: &mut AtomicOperation,
        key: Option<&Key>,
        rid: Option<Rid>,
    ) -> anyhow::Result<bool>;

    /// Rids associated with `key`, ordered.
    fn get(&self, key: Option<&Key>) -> anyhow::Result<Vec<Rid>>;

    fn iterate_entries_between(
        &self,
        from: &Key,
        from_inclusive: bool,
        to: &Key,
        to_inclusive: bool,
        ascending: bool,
    ) -> anyhow::Result<EntryCursor>;

    /// Entries with keys above `key`.
    fn iterate_entries_major(
        &self,
        key: &Key,
        inclusive: bool,
        ascending: bool,
    ) -> anyhow::Result<EntryCursor>;

    /// Entries with keys below `key`.
    fn iterate_entries_minor(
        &self,
        key: &Key,
        inclusive: bool,
        ascending: bool,
    ) -> anyhow::Result<EntryCursor>;

    fn first_key(&self) -> anyhow::Result<Option<Key>>;

    fn last_key(&self) -> anyhow::Result<Option<Key>>;

    fn key_cursor(&self) -> anyhow::Result<KeyCursor>;

    /// Number of associations, null key included.
    fn size(&self) -> anyhow::Result<u64>;

    /// Deletes the files of an empty index.
    fn delete(&self, op: &mut AtomicOperation) -> anyhow::Result<()>;

    /// Flushes and closes the files of the index.
    fn close(&self) -> anyhow::Result<()>;
}

/// An index engine of either kind.
pub enum IndexEngine {
    Single(SingleValueTree),
    Multi(MultiValueTree),
}

impl IndexEngine {
    fn inner(&self) -> &dyn CellBTreeEngine {
        match self {
            IndexEngine::Single(tree) => tree,
            IndexEngine::Multi(tree) => tree,
        }
    }
}

impl CellBTreeEngine for IndexEngine {
    fn name(&self) -> &str {
        self.inner().name()
    }

    fn version(&self) -> u32 {
        self.inner().version()
    }

    fn kind(&self) -> EngineKind {
        self.inner().kind()
    }

    fn put(&self, op: &mut AtomicOperation, key: Option<&Key>, rid: Rid) -> anyhow::Result<bool> {
        self.inner().put(op, key, rid)
    }

    fn validated_put(
        &self,
        op: &mut AtomicOperation,
        key: Option<&Key>,
        rid: Rid,
        validator: &mut dyn FnMut(Option<Rid>, Rid) -> anyhow::Result<Option<Rid>>,
    ) -> anyhow::Result<bool> {
        self.inner().validated_put(op, key, rid, validator)
    }

    fn remove(
        &self,
        op: &mut AtomicOperation,
        key: Option<&Key>,
        rid: Option<Rid>,
    ) -> anyhow::Result<bool> {
        self.inner().remove(op, key, rid)
    }

    fn get(&self, key: Option<&Key>) -> anyhow::Result<Vec<Rid>> {
        self.inner().get(key)
    }

    fn iterate_entries_between(
        &self,
        from: &Key,
        from_inclusive: bool,
        to: &Key,
        to_inclusive: bool,
        ascending: bool,
    ) -> anyhow::Result<EntryCursor> {
        self.inner()
            .iterate_entries_between(from, from_inclusive, to, to_inclusive, ascending)
    }

    fn iterate_entries_major(
        &self,
        key: &Key,
        inclusive: bool,
        ascending: bool,
    ) -> anyhow::Result<EntryCursor> {
        self.inner().iterate_entries_major(key, inclusive, ascending)
    }

    fn iterate_entries_minor(
        &self,
        key: &Key,
        inclusive: bool,
        ascending: bool,
    ) -> anyhow::Result<EntryCursor> {
        self.inner().iterate_entries_minor(key, inclusive, ascending)
    }

    fn first_key(&self) -> anyhow::Result<Option<Key>> {
        self.inner().first_key()
    }

    fn last_key(&self) -> anyhow::Result<Option<Key>> {
        self.inner().last_key()
    }

    fn key_cursor(&self) -> anyhow::Result<KeyCursor> {
        self.inner().key_cursor()
    }

    fn size(&self) -> anyhow::Result<u64> {
        self.inner().size()
    }

    fn delete(&self, op: &mut AtomicOperation) -> anyhow::Result<()> {
        self.inner().delete(op)
    }

    fn close(&self) -> anyhow::Result<()> {
        self.inner().close()
    }
}

fn check_version(version: u32) -> anyhow::Result<()> {
    if !SUPPORTED_VERSIONS.contains(&version) {
        return Err(StorageError::UnsupportedVersion(version).into());
    }
    Ok(())
}

/// Creates the files of a new index inside `op`.
pub fn create_engine(
    op: &mut AtomicOperation,
    context: &TreeContext,
    definition: &IndexDefinition,
) -> anyhow::Result<IndexEngine> {
    check_version(definition.version)?;
    let engine = match definition.kind {
        EngineKind::SingleValue => {
            IndexEngine::Single(SingleValueTree::create(op, context, definition)?)
        }
        EngineKind::MultiValue => {
            IndexEngine::Multi(MultiValueTree::create(op, context, definition)?)
        }
    };
    log::debug!(
        "index_created name={} kind={:?} version={}",
        definition.name,
        definition.kind,
        definition.version
    );
    Ok(engine)
}

/// Opens an existing index.
pub fn load_engine(
    context: &TreeContext,
    definition: &IndexDefinition,
) -> anyhow::Result<IndexEngine> {
    check_version(definition.version)?;
    let engine = match definition.kind {
        EngineKind::SingleValue => IndexEngine::Single(SingleValueTree::load(context, definition)?),
        EngineKind::MultiValue => IndexEngine::Multi(MultiValueTree::load(context, definition)?),
    };
    log::debug!(
        "index_loaded name={} kind={:?} version={}",
        definition.name,
        definition.kind,
        definition.version
    );
    Ok(engine)
}

/// Wraps a failed mutation of index `name` into [`StorageError::Index`], once.
pub(crate) fn index_error(name: &str, key: Option<&Key>, err: anyhow::Error) -> anyhow::Error {
    if matches!(
        err.downcast_ref::<StorageError>(),
        Some(StorageError::Index { .. })
    ) {
        return err;
    }
    let key = key.map_or_else(|| "null".to_string(), |key| key.to_string());
    StorageError::index(name, key, err).into()
}

/// Bound of a user key. Partial when the key only has leading fields, or when cells append more
/// bytes to the key.
pub(crate) fn key_bound(
    codec: &KeyCodec,
    key: &Key,
    inclusive: bool,
    composite: bool,
) -> anyhow::Result<KeyBound> {
    let encoded = codec.encode_prefix(key)?;
    if composite || key.len() < codec.key_size() {
        Ok(KeyBound::prefix(encoded, inclusive))
    } else {
        Ok(KeyBound::exact(encoded, inclusive))
    }
}

pub(crate) fn range_between(
    codec: &KeyCodec,
    from: &Key,
    from_inclusive: bool,
    to: &Key,
    to_inclusive: bool,
    ascending: bool,
    composite: bool,
) -> anyhow::Result<KeyRange> {
    Ok(KeyRange {
        lower: Some(key_bound(codec, from, from_inclusive, composite)?),
        upper: Some(key_bound(codec, to, to_inclusive, composite)?),
        ascending,
    })
}

pub(crate) fn range_major(
    codec: &KeyCodec,
    key: &Key,
    inclusive: bool,
    ascending: bool,
    composite: bool,
) -> anyhow::Result<KeyRange> {
    Ok(KeyRange {
        lower: Some(key_bound(codec, key, inclusive, composite)?),
        upper: None,
        ascending,
    })
}

pub(crate) fn range_minor(
    codec: &KeyCodec,
    key: &Key,
    inclusive: bool,
    ascending: bool,
    composite: bool,
) -> anyhow::Result<KeyRange> {
    Ok(KeyRange {
        lower: None,
        upper: Some(key_bound(codec, key, inclusive, composite)?),
        ascending,
    })
}

/// Loads a file of an index, reopening it when it was closed.
pub(crate) fn load_file(context: &TreeContext, name: &str) -> anyhow::Result<crate::id::FileId> {
    context.write_cache().load_file(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::tests::fixture;
    use crate::btree::KeyValue;

    #[test]
    fn test_unsupported_version() {
        let f = fixture();
        let definition =
            IndexDefinition::new("idx", EngineKind::SingleValue, 4, vec![KeyType::Integer]);
        let err = f
            .manager
            .execute(|op| create_engine(op, &f.context, &definition))
            .err()
            .unwrap();
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::UnsupportedVersion(4))
        ));
        assert!(load_engine(&f.context, &definition).is_err());
    }

    #[test]
    fn test_factory_dispatch() {
        let f = fixture();
        for (i, kind) in [EngineKind::SingleValue, EngineKind::MultiValue]
            .into_iter()
            .enumerate()
        {
            for version in SUPPORTED_VERSIONS {
                let name = format!("idx{i}v{version}");
                let definition = IndexDefinition::new(&name, kind, version, vec![KeyType::Long]);
                let engine = f
                    .manager
                    .execute(|op| {
                        let engine = create_engine(op, &f.context, &definition)?;
                        engine.put(op, Some(&KeyValue::Long(5).into()), Rid::new(1, 1))?;
                        Ok(engine)
                    })
                    .unwrap();
                assert_eq!(kind, engine.kind());
                assert_eq!(version, engine.version());
                assert_eq!(1, engine.size().unwrap());
                engine.close().unwrap();

                let loaded = load_engine(&f.context, &definition).unwrap();
                assert_eq!(
                    vec![Rid::new(1, 1)],
                    loaded.get(Some(&KeyValue::Long(5).into())).unwrap()
                );
            }
        }
    }

    #[test]
    fn test_mutation_errors_are_wrapped_once() {
        let inner = anyhow::anyhow!("disk on fire");
        let wrapped = index_error("idx", Some(&Key::from(3)), inner);
        let twice = index_error("other", None, wrapped);
        let Some(StorageError::Index { name, key, .. }) = twice.downcast_ref::<StorageError>()
        else {
            panic!("expected an index error, got {twice}");
        };
        assert_eq!("idx", name);
        assert_eq!("3", key);
    }
}
