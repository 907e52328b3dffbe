//! Page 0 of every tree file: format marker, engine version, tree size and the id counter used by
//! multi-value trees to name their spilled value sets.

use crate::bins::SliceExt;
use crate::page::PAGE_PAYLOAD_OFFSET;
use anyhow::anyhow;

pub(crate) const ENTRY_POINT_PAGE: u64 = 0;
pub(crate) const ROOT_PAGE: u64 = 1;

const MARKER: u32 = 0x4345_4c4c;

const MARKER_OFFSET: usize = PAGE_PAYLOAD_OFFSET;
const VERSION_OFFSET: usize = PAGE_PAYLOAD_OFFSET + 4;
const TREE_SIZE_OFFSET: usize = PAGE_PAYLOAD_OFFSET + 8;
const ENTRY_ID_OFFSET: usize = PAGE_PAYLOAD_OFFSET + 16;
const END: usize = PAGE_PAYLOAD_OFFSET + 24;

pub(crate) struct EntryPointRead<'a> {
    buff: &'a [u8],
}

impl<'a> EntryPointRead<'a> {
    pub(crate) fn new(buff: &'a [u8]) -> anyhow::Result<Self> {
        if buff[MARKER_OFFSET..].read_u32() != MARKER {
            return Err(anyhow!("page is not a tree entry point"));
        }
        Ok(Self { buff })
    }

    pub(crate) fn version(&self) -> u32 {
        self.buff[VERSION_OFFSET..].read_u32()
    }

    pub(crate) fn tree_size(&self) -> u64 {
        self.buff[TREE_SIZE_OFFSET..].read_u64()
    }

    pub(crate) fn entry_id(&self) -> u64 {
        self.buff[ENTRY_ID_OFFSET..].read_u64()
    }
}

pub(crate) struct EntryPointWrite<'a> {
    buff: &'a mut [u8],
}

impl<'a> EntryPointWrite<'a> {
    pub(crate) fn new(buff: &'a mut [u8]) -> Self {
        Self { buff }
    }

    pub(crate) fn init(&mut self, version: u32) -> anyhow::Result<()> {
        if self.buff[MARKER_OFFSET..END].iter().any(|b| *b != 0) {
            return Err(anyhow!("entry point is already initialized"));
        }
        self.buff[MARKER_OFFSET..MARKER_OFFSET + 4].copy_from_slice(&MARKER.to_be_bytes());
        self.buff[VERSION_OFFSET..VERSION_OFFSET + 4].copy_from_slice(&version.to_be_bytes());
        Ok(())
    }

    pub(crate) fn clear(&mut self, version: u32) -> anyhow::Result<()> {
        let entry_point = EntryPointRead::new(self.buff)?;
        if entry_point.version() != version
            || entry_point.tree_size() != 0
            || entry_point.entry_id() != 0
        {
            return Err(anyhow!("only a fresh entry point can be cleared"));
        }
        self.buff[MARKER_OFFSET..END].fill(0);
        Ok(())
    }

    pub(crate) fn set_tree_size(&mut self, expected: u64, size: u64) -> anyhow::Result<()> {
        let current = EntryPointRead::new(self.buff)?.tree_size();
        if current != expected {
            return Err(anyhow!("tree size is {current}, expected {expected}"));
        }
        self.buff[TREE_SIZE_OFFSET..TREE_SIZE_OFFSET + 8].copy_from_slice(&size.to_be_bytes());
        Ok(())
    }

    pub(crate) fn set_entry_id(&mut self, expected: u64, id: u64) -> anyhow::Result<()> {
        let current = EntryPointRead::new(self.buff)?.entry_id();
        if current != expected {
            return Err(anyhow!("entry id is {current}, expected {expected}"));
        }
        self.buff[ENTRY_ID_OFFSET..ENTRY_ID_OFFSET + 8].copy_from_slice(&id.to_be_bytes());
        Ok(())
    }
}
