use std::fmt;
use std::num::NonZeroU64;

/// Position of a record in the write-ahead log. Zero is never a valid LSN, the first segment
/// header occupies the beginning of the log address space.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(NonZeroU64);

impl Lsn {
    #[inline]
    pub fn new(lsn: u64) -> Option<Self> {
        NonZeroU64::new(lsn).map(Self)
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.0.get()
    }

    #[inline]
    pub(crate) fn add(&self, offset: usize) -> Self {
        Self(
            self.0
                .checked_add(offset as u64)
                .expect("lsn should not overflow"),
        )
    }

    #[inline]
    pub(crate) fn from_be_bytes(lsn: [u8; 8]) -> Option<Self> {
        Self::new(u64::from_be_bytes(lsn))
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub(crate) trait LsnExt {
    fn to_be_bytes(&self) -> [u8; 8];
}

impl LsnExt for Lsn {
    #[inline]
    fn to_be_bytes(&self) -> [u8; 8] {
        self.0.get().to_be_bytes()
    }
}

impl LsnExt for Option<Lsn> {
    #[inline]
    fn to_be_bytes(&self) -> [u8; 8] {
        if let Some(lsn) = self {
            lsn.to_be_bytes()
        } else {
            0u64.to_be_bytes()
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileId(u32);

impl FileId {
    #[inline]
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    #[inline]
    pub fn get(&self) -> u32 {
        self.0
    }

    #[inline]
    pub(crate) fn from_be_bytes(id: [u8; 4]) -> Self {
        Self(u32::from_be_bytes(id))
    }

    #[inline]
    pub(crate) fn to_be_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an atomic operation. It is stored in the 7 low bytes of every WAL record header,
/// so it has to be smaller than 2^56.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OperationUnitId(NonZeroU64);

impl OperationUnitId {
    #[inline]
    pub fn new(id: u64) -> Option<Self> {
        if id >= 1 << 56 {
            None
        } else {
            NonZeroU64::new(id).map(Self)
        }
    }

    #[inline]
    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for OperationUnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Record id: the physical address of a record inside a cluster.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Rid {
    pub cluster_id: i16,
    pub cluster_position: i64,
}

impl Rid {
    pub const SIZE: usize = 10;

    pub fn new(cluster_id: i16, cluster_position: i64) -> Self {
        Self {
            cluster_id,
            cluster_position,
        }
    }

    pub(crate) fn encode(&self, buff: &mut [u8]) {
        buff[0..2].copy_from_slice(&self.cluster_id.to_be_bytes());
        buff[2..10].copy_from_slice(&self.cluster_position.to_be_bytes());
    }

    pub(crate) fn decode(buff: &[u8]) -> Self {
        let cluster_id = i16::from_be_bytes([buff[0], buff[1]]);
        let mut pos = [0u8; 8];
        pos.copy_from_slice(&buff[2..10]);
        Self {
            cluster_id,
            cluster_position: i64::from_be_bytes(pos),
        }
    }
}

impl fmt::Display for Rid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}:{}", self.cluster_id, self.cluster_position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_id() {
        assert_eq!(None, OperationUnitId::new(0), "unit id cannot be zero");
        assert_eq!(10, OperationUnitId::new(10).unwrap().get());
        let max = OperationUnitId::new(72057594037927935).unwrap();
        assert_eq!(0, max.get().to_be_bytes()[0], "first byte is reserved");
        assert_eq!(None, OperationUnitId::new(72057594037927936));
    }

    #[test]
    fn test_rid_order_and_encoding() {
        let a = Rid::new(1, 100);
        let b = Rid::new(1, 101);
        let c = Rid::new(2, 0);
        assert!(a < b && b < c);

        let mut buff = [0u8; Rid::SIZE];
        c.encode(&mut buff);
        assert_eq!(c, Rid::decode(&buff));
        assert_eq!("#2:0", c.to_string());
    }

    #[test]
    fn test_lsn_none_encoding() {
        let none: Option<Lsn> = None;
        assert_eq!([0u8; 8], none.to_be_bytes());
        let lsn = Lsn::new(64).unwrap();
        assert_eq!(Some(lsn), Lsn::from_be_bytes(lsn.to_be_bytes()));
        assert_eq!(96, lsn.add(32).get());
    }
}
