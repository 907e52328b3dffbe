//! Component operations: logical WAL records for cluster mutations. Unlike page operations they do
//! not depend on page layout; redo and undo call back into the cluster storage's internal
//! primitives, which must tolerate being replayed on an already applied state.

use crate::bins::{bytes_size, BuffExt, ByteReader};
use anyhow::anyhow;

/// The non-logging mutation primitives of the cluster layer.
pub trait ClusterStorage: Send + Sync {
    fn allocate_position_internal(&self, cluster_id: i32, record_type: u8) -> anyhow::Result<i64>;

    fn create_record_internal(
        &self,
        cluster_id: i32,
        content: &[u8],
        version: i32,
        record_type: u8,
        allocated_position: i64,
    ) -> anyhow::Result<i64>;

    fn delete_record_internal(&self, cluster_id: i32, position: i64) -> anyhow::Result<()>;

    fn update_record_internal(
        &self,
        cluster_id: i32,
        position: i64,
        content: &[u8],
        version: i32,
        record_type: u8,
    ) -> anyhow::Result<()>;

    fn add_cluster_internal(&self, name: &str, cluster_id: i32) -> anyhow::Result<()>;

    fn drop_cluster_internal(&self, cluster_id: i32) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentOperation {
    ClusterAllocatePosition {
        cluster_id: i32,
        record_type: u8,
    },
    ClusterCreateRecord {
        cluster_id: i32,
        content: Vec<u8>,
        version: i32,
        record_type: u8,
        allocated_position: i64,
        record_position: i64,
    },
    ClusterDeleteRecord {
        cluster_id: i32,
        record_position: i64,
        content: Vec<u8>,
        version: i32,
        record_type: u8,
    },
    ClusterUpdateRecord {
        cluster_id: i32,
        cluster_position: i64,
        new_content: Vec<u8>,
        new_version: i32,
        new_record_type: u8,
        old_content: Vec<u8>,
        old_version: i32,
        old_record_type: u8,
    },
    ClusterDelete {
        cluster_name: String,
        cluster_id: i32,
    },
}

const CO_CLUSTER_ALLOCATE_POSITION_KIND: u8 = 0;
const CO_CLUSTER_CREATE_RECORD_KIND: u8 = 1;
const CO_CLUSTER_DELETE_RECORD_KIND: u8 = 2;
const CO_CLUSTER_UPDATE_RECORD_KIND: u8 = 3;
const CO_CLUSTER_DELETE_KIND: u8 = 4;

pub(crate) const CO_KIND_LIMIT: u8 = 64;

impl ComponentOperation {
    pub(crate) fn kind(&self) -> u8 {
        match self {
            ComponentOperation::ClusterAllocatePosition { .. } => CO_CLUSTER_ALLOCATE_POSITION_KIND,
            ComponentOperation::ClusterCreateRecord { .. } => CO_CLUSTER_CREATE_RECORD_KIND,
            ComponentOperation::ClusterDeleteRecord { .. } => CO_CLUSTER_DELETE_RECORD_KIND,
            ComponentOperation::ClusterUpdateRecord { .. } => CO_CLUSTER_UPDATE_RECORD_KIND,
            ComponentOperation::ClusterDelete { .. } => CO_CLUSTER_DELETE_KIND,
        }
    }

    pub fn serialized_size(&self) -> usize {
        match self {
            ComponentOperation::ClusterAllocatePosition { .. } => 4 + 1,
            ComponentOperation::ClusterCreateRecord { content, .. } => {
                4 + bytes_size(content.len()) + 4 + 1 + 8 + 8
            }
            ComponentOperation::ClusterDeleteRecord { content, .. } => {
                4 + 8 + bytes_size(content.len()) + 4 + 1
            }
            ComponentOperation::ClusterUpdateRecord {
                new_content,
                old_content,
                ..
            } => {
                4
                    + 8
                    + bytes_size(new_content.len())
                    + 4
                    + 1
                    + bytes_size(old_content.len())
                    + 4
                    + 1
            }
            ComponentOperation::ClusterDelete { cluster_name, .. } => {
                bytes_size(cluster_name.len()) + 4
            }
        }
    }

    pub fn serialize(&self, buff: &mut Vec<u8>) {
        match self {
            ComponentOperation::ClusterAllocatePosition {
                cluster_id,
                record_type,
            } => {
                buff.put_i32(*cluster_id);
                buff.put_u8(*record_type);
            }
            ComponentOperation::ClusterCreateRecord {
                cluster_id,
                content,
                version,
                record_type,
                allocated_position,
                record_position,
            } => {
                buff.put_i32(*cluster_id);
                buff.put_bytes(content);
                buff.put_i32(*version);
                buff.put_u8(*record_type);
                buff.put_i64(*allocated_position);
                buff.put_i64(*record_position);
            }
            ComponentOperation::ClusterDeleteRecord {
                cluster_id,
                record_position,
                content,
                version,
                record_type,
            } => {
                buff.put_i32(*cluster_id);
                buff.put_i64(*record_position);
                buff.put_bytes(content);
                buff.put_i32(*version);
                buff.put_u8(*record_type);
            }
            ComponentOperation::ClusterUpdateRecord {
                cluster_id,
                cluster_position,
                new_content,
                new_version,
                new_record_type,
                old_content,
                old_version,
                old_record_type,
            } => {
                buff.put_i32(*cluster_id);
                buff.put_i64(*cluster_position);
                buff.put_bytes(new_content);
                buff.put_i32(*new_version);
                buff.put_u8(*new_record_type);
                buff.put_bytes(old_content);
                buff.put_i32(*old_version);
                buff.put_u8(*old_record_type);
            }
            ComponentOperation::ClusterDelete {
                cluster_name,
                cluster_id,
            } => {
                buff.put_str(cluster_name);
                buff.put_i32(*cluster_id);
            }
        }
    }

    pub(crate) fn deserialize(kind: u8, reader: &mut ByteReader) -> anyhow::Result<Self> {
        let operation = match kind {
            CO_CLUSTER_ALLOCATE_POSITION_KIND => ComponentOperation::ClusterAllocatePosition {
                cluster_id: reader.get_i32()?,
                record_type: reader.get_u8()?,
            },
            CO_CLUSTER_CREATE_RECORD_KIND => ComponentOperation::ClusterCreateRecord {
                cluster_id: reader.get_i32()?,
                content: reader.get_bytes()?,
                version: reader.get_i32()?,
                record_type: reader.get_u8()?,
                allocated_position: reader.get_i64()?,
                record_position: reader.get_i64()?,
            },
            CO_CLUSTER_DELETE_RECORD_KIND => ComponentOperation::ClusterDeleteRecord {
                cluster_id: reader.get_i32()?,
                record_position: reader.get_i64()?,
                content: reader.get_bytes()?,
                version: reader.get_i32()?,
                record_type: reader.get_u8()?,
            },
            CO_CLUSTER_UPDATE_RECORD_KIND => ComponentOperation::ClusterUpdateRecord {
                cluster_id: reader.get_i32()?,
                cluster_position: reader.get_i64()?,
                new_content: reader.get_bytes()?,
                new_version: reader.get_i32()?,
                new_record_type: reader.get_u8()?,
                old_content: reader.get_bytes()?,
                old_version: reader.get_i32()?,
                old_record_type: reader.get_u8()?,
            },
            CO_CLUSTER_DELETE_KIND => ComponentOperation::ClusterDelete {
                cluster_name: reader.get_str()?,
                cluster_id: reader.get_i32()?,
            },
            _ => return Err(anyhow!("invalid component operation kind {kind}")),
        };
        Ok(operation)
    }

    pub fn redo(&self, storage: &dyn ClusterStorage) -> anyhow::Result<()> {
        match self {
            ComponentOperation::ClusterAllocatePosition {
                cluster_id,
                record_type,
            } => {
                storage.allocate_position_internal(*cluster_id, *record_type)?;
            }
            ComponentOperation::ClusterCreateRecord {
                cluster_id,
                content,
                version,
                record_type,
                allocated_position,
                record_position,
            } => {
                let position = storage.create_record_internal(
                    *cluster_id,
                    content,
                    *version,
                    *record_type,
                    *allocated_position,
                )?;
                if position != *record_position {
                    return Err(anyhow!(
                        "record of cluster {cluster_id} was recreated at position {position} instead of {record_position}"
                    ));
                }
            }
            ComponentOperation::ClusterDeleteRecord {
                cluster_id,
                record_position,
                ..
            } => storage.delete_record_internal(*cluster_id, *record_position)?,
            ComponentOperation::ClusterUpdateRecord {
                cluster_id,
                cluster_position,
                new_content,
                new_version,
                new_record_type,
                ..
            } => storage.update_record_internal(
                *cluster_id,
                *cluster_position,
                new_content,
                *new_version,
                *new_record_type,
            )?,
            ComponentOperation::ClusterDelete { cluster_id, .. } => {
                storage.drop_cluster_internal(*cluster_id)?
            }
        }
        Ok(())
    }

    pub fn undo(&self, storage: &dyn ClusterStorage) -> anyhow::Result<()> {
        match self {
            // a bare allocation is reverted by the create or delete paired with it
            ComponentOperation::ClusterAllocatePosition { .. } => (),
            ComponentOperation::ClusterCreateRecord {
                cluster_id,
                record_position,
                ..
            } => storage.delete_record_internal(*cluster_id, *record_position)?,
            ComponentOperation::ClusterDeleteRecord {
                cluster_id,
                record_position,
                content,
                version,
                record_type,
            } => {
                let position = storage.create_record_internal(
                    *cluster_id,
                    content,
                    *version,
                    *record_type,
                    *record_position,
                )?;
                if position != *record_position {
                    return Err(anyhow!(
                        "deleted record of cluster {cluster_id} was restored at position {position} instead of {record_position}"
                    ));
                }
            }
            ComponentOperation::ClusterUpdateRecord {
                cluster_id,
                cluster_position,
                old_content,
                old_version,
                old_record_type,
                ..
            } => storage.update_record_internal(
                *cluster_id,
                *cluster_position,
                old_content,
                *old_version,
                *old_record_type,
            )?,
            ComponentOperation::ClusterDelete {
                cluster_name,
                cluster_id,
            } => storage.add_cluster_internal(cluster_name, *cluster_id)?,
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) struct StoredRecord {
        pub(crate) content: Vec<u8>,
        pub(crate) version: i32,
        pub(crate) record_type: u8,
    }

    /// Cluster layer kept in memory. Replaying a mutation that is already applied is accepted.
    #[derive(Default)]
    pub(crate) struct MemoryClusters {
        pub(crate) clusters: Mutex<BTreeMap<i32, (String, BTreeMap<i64, StoredRecord>)>>,
        pub(crate) next_position: Mutex<BTreeMap<i32, i64>>,
    }

    impl ClusterStorage for MemoryClusters {
        fn allocate_position_internal(&self, cluster_id: i32, _: u8) -> anyhow::Result<i64> {
            let mut next = self.next_position.lock();
            let position = next.entry(cluster_id).or_insert(0);
            *position += 1;
            Ok(*position - 1)
        }

        fn create_record_internal(
            &self,
            cluster_id: i32,
            content: &[u8],
            version: i32,
            record_type: u8,
            allocated_position: i64,
        ) -> anyhow::Result<i64> {
            let mut clusters = self.clusters.lock();
            let Some((_, records)) = clusters.get_mut(&cluster_id) else {
                return Err(anyhow!("cluster {cluster_id} does not exist"));
            };
            records.insert(
                allocated_position,
                StoredRecord {
                    content: content.to_vec(),
                    version,
                    record_type,
                },
            );
            Ok(allocated_position)
        }

        fn delete_record_internal(&self, cluster_id: i32, position: i64) -> anyhow::Result<()> {
            if let Some((_, records)) = self.clusters.lock().get_mut(&cluster_id) {
                records.remove(&position);
            }
            Ok(())
        }

        fn update_record_internal(
            &self,
            cluster_id: i32,
            position: i64,
            content: &[u8],
            version: i32,
            record_type: u8,
        ) -> anyhow::Result<()> {
            self.create_record_internal(cluster_id, content, version, record_type, position)?;
            Ok(())
        }

        fn add_cluster_internal(&self, name: &str, cluster_id: i32) -> anyhow::Result<()> {
            self.clusters
                .lock()
                .entry(cluster_id)
                .or_insert_with(|| (name.to_string(), BTreeMap::new()));
            Ok(())
        }

        fn drop_cluster_internal(&self, cluster_id: i32) -> anyhow::Result<()> {
            self.clusters.lock().remove(&cluster_id);
            Ok(())
        }
    }

    fn all_operations() -> Vec<ComponentOperation> {
        vec![
            ComponentOperation::ClusterAllocatePosition {
                cluster_id: 12,
                record_type: b'd',
            },
            ComponentOperation::ClusterCreateRecord {
                cluster_id: 12,
                content: vec![1, 2, 3, 4, 5],
                version: 1,
                record_type: b'd',
                allocated_position: 42,
                record_position: 42,
            },
            ComponentOperation::ClusterDeleteRecord {
                cluster_id: -3,
                record_position: i64::MAX,
                content: vec![],
                version: -1,
                record_type: b'b',
            },
            ComponentOperation::ClusterUpdateRecord {
                cluster_id: 7,
                cluster_position: 9,
                new_content: b"new content".to_vec(),
                new_version: 8,
                new_record_type: b'd',
                old_content: b"old".to_vec(),
                old_version: 7,
                old_record_type: b'b',
            },
            ComponentOperation::ClusterDelete {
                cluster_name: "person".to_string(),
                cluster_id: 17,
            },
        ]
    }

    #[test]
    fn test_serialization() {
        for operation in all_operations() {
            let mut buff = Vec::new();
            operation.serialize(&mut buff);
            assert_eq!(operation.serialized_size(), buff.len(), "{operation:?}");

            let mut reader = ByteReader::new(&buff);
            let decoded = ComponentOperation::deserialize(operation.kind(), &mut reader).unwrap();
            reader.finish().unwrap();
            assert_eq!(operation, decoded);
        }
        assert!(ComponentOperation::deserialize(99, &mut ByteReader::new(&[])).is_err());
    }

    #[test]
    fn test_redo_and_undo() {
        let clusters = MemoryClusters::default();
        clusters.add_cluster_internal("person", 1).unwrap();

        let create = ComponentOperation::ClusterCreateRecord {
            cluster_id: 1,
            content: b"alice".to_vec(),
            version: 1,
            record_type: b'd',
            allocated_position: 0,
            record_position: 0,
        };
        let update = ComponentOperation::ClusterUpdateRecord {
            cluster_id: 1,
            cluster_position: 0,
            new_content: b"bob".to_vec(),
            new_version: 2,
            new_record_type: b'd',
            old_content: b"alice".to_vec(),
            old_version: 1,
            old_record_type: b'd',
        };
        let delete = ComponentOperation::ClusterDeleteRecord {
            cluster_id: 1,
            record_position: 0,
            content: b"bob".to_vec(),
            version: 2,
            record_type: b'd',
        };

        let record = |clusters: &MemoryClusters| {
            clusters
                .clusters
                .lock()
                .get(&1)
                .and_then(|(_, records)| records.get(&0).cloned())
        };

        create.redo(&clusters).unwrap();
        update.redo(&clusters).unwrap();
        assert_eq!(b"bob".to_vec(), record(&clusters).unwrap().content);
        delete.redo(&clusters).unwrap();
        assert_eq!(None, record(&clusters));

        delete.undo(&clusters).unwrap();
        assert_eq!(2, record(&clusters).unwrap().version);
        update.undo(&clusters).unwrap();
        assert_eq!(
            StoredRecord {
                content: b"alice".to_vec(),
                version: 1,
                record_type: b'd'
            },
            record(&clusters).unwrap()
        );
        create.undo(&clusters).unwrap();
        assert_eq!(None, record(&clusters));

        let drop = ComponentOperation::ClusterDelete {
            cluster_name: "person".to_string(),
            cluster_id: 1,
        };
        drop.redo(&clusters).unwrap();
        assert!(clusters.clusters.lock().is_empty());
        drop.undo(&clusters).unwrap();
        assert_eq!("person", clusters.clusters.lock()[&1].0);
    }
}
