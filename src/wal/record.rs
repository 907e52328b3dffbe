use crate::bins::{BuffExt, ByteReader, SliceExt};
use crate::co::{ComponentOperation, CO_KIND_LIMIT};
use crate::id::{FileId, Lsn, OperationUnitId};
use crate::po::{PageOperation, PO_KIND_LIMIT};
use anyhow::anyhow;

/// A single WAL record.
///
/// Frame layout:
/// ```text
/// 0   kind (1 byte) + operation unit id (7 bytes, zero when the record has no unit)
/// 8   payload size u32
/// 12  payload
/// ..  zero padding up to a multiple of 8
/// ..  crc64 of everything before it
/// ..  total frame size u64, so the log can be walked backwards
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    AtomicUnitStart {
        unit: OperationUnitId,
    },
    AtomicUnitEnd {
        unit: OperationUnitId,
        rollback: bool,
        start_lsn: Option<Lsn>,
        metadata: Vec<(String, Vec<u8>)>,
    },
    FileCreated {
        unit: OperationUnitId,
        file_id: FileId,
        name: String,
    },
    FileDeleted {
        unit: OperationUnitId,
        file_id: FileId,
    },
    /// Written as the first record of a segment opened explicitly.
    Empty,
    Page {
        unit: OperationUnitId,
        file_id: FileId,
        page_index: u64,
        operation: PageOperation,
    },
    Component {
        unit: OperationUnitId,
        operation: ComponentOperation,
    },

    FullCheckpointStart {
        next_unit_id: u64,
    },
    FullCheckpointEnd {
        start: Lsn,
    },
    /// `redo_start` is the oldest LSN a dirty page still depends on.
    FuzzyCheckpointStart {
        redo_start: Option<Lsn>,
        next_unit_id: u64,
    },
    FuzzyCheckpointEnd {
        start: Lsn,
    },
}

const WAL_RECORD_ATOMIC_UNIT_START_KIND: u8 = 1;
const WAL_RECORD_ATOMIC_UNIT_END_KIND: u8 = 2;
const WAL_RECORD_FILE_CREATED_KIND: u8 = 3;
const WAL_RECORD_FILE_DELETED_KIND: u8 = 4;
const WAL_RECORD_EMPTY_KIND: u8 = 5;

const WAL_RECORD_FULL_CHECKPOINT_START_KIND: u8 = 10;
const WAL_RECORD_FULL_CHECKPOINT_END_KIND: u8 = 11;
const WAL_RECORD_FUZZY_CHECKPOINT_START_KIND: u8 = 12;
const WAL_RECORD_FUZZY_CHECKPOINT_END_KIND: u8 = 13;

const WAL_RECORD_PAGE_KIND_BASE: u8 = 64;
const WAL_RECORD_COMPONENT_KIND_BASE: u8 = 128;

const FRAME_HEADER_SIZE: usize = 12;

impl WalRecord {
    fn kind(&self) -> u8 {
        match self {
            WalRecord::AtomicUnitStart { .. } => WAL_RECORD_ATOMIC_UNIT_START_KIND,
            WalRecord::AtomicUnitEnd { .. } => WAL_RECORD_ATOMIC_UNIT_END_KIND,
            WalRecord::FileCreated { .. } => WAL_RECORD_FILE_CREATED_KIND,
            WalRecord::FileDeleted { .. } => WAL_RECORD_FILE_DELETED_KIND,
            WalRecord::Empty => WAL_RECORD_EMPTY_KIND,
            WalRecord::Page { operation, .. } => WAL_RECORD_PAGE_KIND_BASE + operation.kind(),
            WalRecord::Component { operation, .. } => {
                WAL_RECORD_COMPONENT_KIND_BASE + operation.kind()
            }
            WalRecord::FullCheckpointStart { .. } => WAL_RECORD_FULL_CHECKPOINT_START_KIND,
            WalRecord::FullCheckpointEnd { .. } => WAL_RECORD_FULL_CHECKPOINT_END_KIND,
            WalRecord::FuzzyCheckpointStart { .. } => WAL_RECORD_FUZZY_CHECKPOINT_START_KIND,
            WalRecord::FuzzyCheckpointEnd { .. } => WAL_RECORD_FUZZY_CHECKPOINT_END_KIND,
        }
    }

    /// The atomic operation this record belongs to, checkpoint markers have none.
    pub fn unit(&self) -> Option<OperationUnitId> {
        match self {
            WalRecord::AtomicUnitStart { unit }
            | WalRecord::AtomicUnitEnd { unit, .. }
            | WalRecord::FileCreated { unit, .. }
            | WalRecord::FileDeleted { unit, .. }
            | WalRecord::Page { unit, .. }
            | WalRecord::Component { unit, .. } => Some(*unit),
            WalRecord::Empty
            | WalRecord::FullCheckpointStart { .. }
            | WalRecord::FullCheckpointEnd { .. }
            | WalRecord::FuzzyCheckpointStart { .. }
            | WalRecord::FuzzyCheckpointEnd { .. } => None,
        }
    }

    pub(crate) fn is_checkpoint_end(&self) -> bool {
        matches!(
            self,
            WalRecord::FullCheckpointEnd { .. } | WalRecord::FuzzyCheckpointEnd { .. }
        )
    }

    fn encode_payload(&self, buff: &mut Vec<u8>) {
        match self {
            WalRecord::AtomicUnitStart { .. } | WalRecord::Empty => (),
            WalRecord::AtomicUnitEnd {
                rollback,
                start_lsn,
                metadata,
                ..
            } => {
                buff.put_u8(*rollback as u8);
                buff.put_u64(start_lsn.map(|lsn| lsn.get()).unwrap_or(0));
                buff.put_u32(metadata.len() as u32);
                for (key, value) in metadata {
                    buff.put_str(key);
                    buff.put_bytes(value);
                }
            }
            WalRecord::FileCreated { file_id, name, .. } => {
                buff.put_u32(file_id.get());
                buff.put_str(name);
            }
            WalRecord::FileDeleted { file_id, .. } => buff.put_u32(file_id.get()),
            WalRecord::Page {
                file_id,
                page_index,
                operation,
                ..
            } => {
                buff.put_u32(file_id.get());
                buff.put_u64(*page_index);
                operation.encode(buff);
            }
            WalRecord::Component { operation, .. } => operation.serialize(buff),
            WalRecord::FullCheckpointStart { next_unit_id } => buff.put_u64(*next_unit_id),
            WalRecord::FullCheckpointEnd { start } | WalRecord::FuzzyCheckpointEnd { start } => {
                buff.put_u64(start.get())
            }
            WalRecord::FuzzyCheckpointStart {
                redo_start,
                next_unit_id,
            } => {
                buff.put_u64(redo_start.map(|lsn| lsn.get()).unwrap_or(0));
                buff.put_u64(*next_unit_id);
            }
        }
    }

    fn decode_payload(
        kind: u8,
        unit: Option<OperationUnitId>,
        payload: &[u8],
    ) -> anyhow::Result<Self> {
        let mut reader = ByteReader::new(payload);
        let unit_id = || unit.ok_or_else(|| anyhow!("wal record of kind {kind} has no unit id"));

        let record = match kind {
            WAL_RECORD_ATOMIC_UNIT_START_KIND => WalRecord::AtomicUnitStart { unit: unit_id()? },
            WAL_RECORD_ATOMIC_UNIT_END_KIND => {
                let rollback = reader.get_bool()?;
                let start_lsn = Lsn::new(reader.get_u64()?);
                let count = reader.get_u32()? as usize;
                let mut metadata = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    let key = reader.get_str()?;
                    let value = reader.get_bytes()?;
                    metadata.push((key, value));
                }
                WalRecord::AtomicUnitEnd {
                    unit: unit_id()?,
                    rollback,
                    start_lsn,
                    metadata,
                }
            }
            WAL_RECORD_FILE_CREATED_KIND => WalRecord::FileCreated {
                unit: unit_id()?,
                file_id: FileId::new(reader.get_u32()?),
                name: reader.get_str()?,
            },
            WAL_RECORD_FILE_DELETED_KIND => WalRecord::FileDeleted {
                unit: unit_id()?,
                file_id: FileId::new(reader.get_u32()?),
            },
            WAL_RECORD_EMPTY_KIND => WalRecord::Empty,
            WAL_RECORD_FULL_CHECKPOINT_START_KIND => WalRecord::FullCheckpointStart {
                next_unit_id: reader.get_u64()?,
            },
            WAL_RECORD_FULL_CHECKPOINT_END_KIND => WalRecord::FullCheckpointEnd {
                start: Lsn::new(reader.get_u64()?)
                    .ok_or_else(|| anyhow!("checkpoint end without start"))?,
            },
            WAL_RECORD_FUZZY_CHECKPOINT_START_KIND => WalRecord::FuzzyCheckpointStart {
                redo_start: Lsn::new(reader.get_u64()?),
                next_unit_id: reader.get_u64()?,
            },
            WAL_RECORD_FUZZY_CHECKPOINT_END_KIND => WalRecord::FuzzyCheckpointEnd {
                start: Lsn::new(reader.get_u64()?)
                    .ok_or_else(|| anyhow!("checkpoint end without start"))?,
            },
            kind if (WAL_RECORD_PAGE_KIND_BASE..WAL_RECORD_PAGE_KIND_BASE + PO_KIND_LIMIT)
                .contains(&kind) =>
            {
                let file_id = FileId::new(reader.get_u32()?);
                let page_index = reader.get_u64()?;
                let operation =
                    PageOperation::decode(kind - WAL_RECORD_PAGE_KIND_BASE, &mut reader)?;
                WalRecord::Page {
                    unit: unit_id()?,
                    file_id,
                    page_index,
                    operation,
                }
            }
            kind if (WAL_RECORD_COMPONENT_KIND_BASE
                ..WAL_RECORD_COMPONENT_KIND_BASE + CO_KIND_LIMIT)
                .contains(&kind) =>
            {
                let operation = ComponentOperation::deserialize(
                    kind - WAL_RECORD_COMPONENT_KIND_BASE,
                    &mut reader,
                )?;
                WalRecord::Component {
                    unit: unit_id()?,
                    operation,
                }
            }
            _ => return Err(anyhow!("invalid wal record kind {kind}")),
        };
        reader.finish()?;
        Ok(record)
    }

    /// Encodes the whole frame.
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut buff = vec![0u8; FRAME_HEADER_SIZE];
        self.encode_payload(&mut buff);
        let payload_size = buff.len() - FRAME_HEADER_SIZE;

        let unit = self.unit().map(OperationUnitId::get).unwrap_or(0);
        buff[0..8].copy_from_slice(&unit.to_be_bytes());
        buff[0] = self.kind();
        buff[8..12].copy_from_slice(&(payload_size as u32).to_be_bytes());

        let padded = pad8(buff.len());
        buff.resize(padded, 0);
        let checksum = crc64::crc64(0x1d0f, &buff);
        buff.put_u64(checksum);
        let total = buff.len() + 8;
        buff.put_u64(total as u64);
        debug_assert_eq!(total, frame_size(payload_size));
        buff
    }

    pub(crate) fn decode(buff: &[u8]) -> WalDecodeResult {
        if buff.len() < FRAME_HEADER_SIZE {
            return WalDecodeResult::NeedMoreBytes;
        }

        let kind = buff[0];
        if kind == 0 {
            // zeroed space after the last record
            return WalDecodeResult::Incomplete;
        }

        let mut unit_buff = [0u8; 8];
        unit_buff.copy_from_slice(&buff[0..8]);
        unit_buff[0] = 0;
        let unit = OperationUnitId::new(u64::from_be_bytes(unit_buff));

        let payload_size = buff[8..].read_u32() as usize;
        let total = frame_size(payload_size);
        if buff.len() < total {
            return WalDecodeResult::NeedMoreBytes;
        }

        let padded = pad8(FRAME_HEADER_SIZE + payload_size);
        let calculated_checksum = crc64::crc64(0x1d0f, &buff[0..padded]);
        let stored_checksum = buff[padded..].read_u64();
        let stored_total = buff[padded + 8..].read_u64();
        if calculated_checksum != stored_checksum || stored_total != total as u64 {
            return WalDecodeResult::Incomplete;
        }

        match Self::decode_payload(
            kind,
            unit,
            &buff[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + payload_size],
        ) {
            Ok(record) => WalDecodeResult::Ok(record, total),
            Err(err) => WalDecodeResult::Err(err),
        }
    }
}

pub(crate) enum WalDecodeResult {
    Ok(WalRecord, usize),
    NeedMoreBytes,
    Incomplete,
    Err(anyhow::Error),
}

/// Size of a frame whose payload is `payload_size` bytes long.
pub(crate) fn frame_size(payload_size: usize) -> usize {
    pad8(FRAME_HEADER_SIZE + payload_size) + 8 + 8
}

/// Reads the total size of the frame starting at `buff`, only the header is needed.
pub(crate) fn frame_size_from_header(buff: &[u8]) -> Option<usize> {
    if buff.len() < FRAME_HEADER_SIZE || buff[0] == 0 {
        return None;
    }
    Some(frame_size(buff[8..].read_u32() as usize))
}

pub(crate) const MIN_FRAME_SIZE: usize = FRAME_HEADER_SIZE;

fn pad8(size: usize) -> usize {
    (size + 7) & !7
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::bucket::leaf_entry;

    fn unit(id: u64) -> OperationUnitId {
        OperationUnitId::new(id).unwrap()
    }

    #[test]
    fn test_encode_start_record() {
        let buff = WalRecord::AtomicUnitStart { unit: unit(1) }.encode();
        assert_eq!(32, buff.len());
        assert_eq!(
            &[
                0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, // kind=1, unit=1
                0x00, 0x00, 0x00, 0x00, // payload size
                0x00, 0x00, 0x00, 0x00, // pad to 8 bytes
            ],
            &buff[..16]
        );
        assert_eq!(&[0, 0, 0, 0, 0, 0, 0, 0x20], &buff[24..32]);
    }

    #[test]
    fn test_decode_records() {
        let records = vec![
            WalRecord::AtomicUnitStart { unit: unit(3) },
            WalRecord::AtomicUnitEnd {
                unit: unit(3),
                rollback: false,
                start_lsn: Lsn::new(32),
                metadata: vec![("tx".to_string(), vec![1, 2, 3])],
            },
            WalRecord::FileCreated {
                unit: unit(3),
                file_id: FileId::new(4),
                name: "people.cbt".to_string(),
            },
            WalRecord::FileDeleted {
                unit: unit(3),
                file_id: FileId::new(4),
            },
            WalRecord::Empty,
            WalRecord::Page {
                unit: unit((1 << 56) - 1),
                file_id: FileId::new(2),
                page_index: 17,
                operation: PageOperation::BucketAddLeafEntry {
                    index: 3,
                    entry: leaf_entry(b"key", b"value"),
                },
            },
            WalRecord::Component {
                unit: unit(9),
                operation: ComponentOperation::ClusterDelete {
                    cluster_name: "v".to_string(),
                    cluster_id: 5,
                },
            },
            WalRecord::FullCheckpointStart { next_unit_id: 10 },
            WalRecord::FullCheckpointEnd {
                start: Lsn::new(64).unwrap(),
            },
            WalRecord::FuzzyCheckpointStart {
                redo_start: None,
                next_unit_id: 11,
            },
            WalRecord::FuzzyCheckpointEnd {
                start: Lsn::new(96).unwrap(),
            },
        ];

        let mut stream = Vec::new();
        for record in &records {
            stream.extend_from_slice(&record.encode());
        }

        let mut offset = 0;
        for record in &records {
            let WalDecodeResult::Ok(decoded, size) = WalRecord::decode(&stream[offset..]) else {
                panic!("record {record:?} cannot be decoded");
            };
            assert_eq!(record, &decoded);
            assert_eq!(
                Some(size),
                frame_size_from_header(&stream[offset..offset + MIN_FRAME_SIZE])
            );
            offset += size;
        }
        assert_eq!(stream.len(), offset);
        assert!(matches!(
            WalRecord::decode(&stream[offset..]),
            WalDecodeResult::NeedMoreBytes
        ));
    }

    #[test]
    fn test_torn_record() {
        let mut buff = WalRecord::FileCreated {
            unit: unit(1),
            file_id: FileId::new(1),
            name: "x".to_string(),
        }
        .encode();

        assert!(matches!(
            WalRecord::decode(&buff[..buff.len() - 1]),
            WalDecodeResult::NeedMoreBytes
        ));

        let len = buff.len();
        buff[len - 12] ^= 0xff;
        assert!(matches!(
            WalRecord::decode(&buff),
            WalDecodeResult::Incomplete
        ));
        assert!(matches!(
            WalRecord::decode(&[0u8; 64]),
            WalDecodeResult::Incomplete
        ));
    }
}
