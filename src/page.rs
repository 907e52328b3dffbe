use crate::bins::SliceExt;
use crate::id::{Lsn, LsnExt};
use anyhow::anyhow;

pub(crate) const PAGE_LSN_OFFSET: usize = 0;
pub(crate) const PAGE_CHECKSUM_OFFSET: usize = 8;
/// First byte available to page formats. Everything before it belongs to the cache.
pub(crate) const PAGE_PAYLOAD_OFFSET: usize = 16;

pub(crate) const MINIMUM_PAGE_SIZE: usize = 4 * 1024;
pub(crate) const MAXIMUM_PAGE_SIZE: usize = 64 * 1024;
pub(crate) const DEFAULT_PAGE_SIZE: usize = 64 * 1024;

pub(crate) fn check_page_size(page_size: usize) -> anyhow::Result<()> {
    if page_size < MINIMUM_PAGE_SIZE {
        return Err(anyhow!(
            "page size {page_size} is too small, minimum is {MINIMUM_PAGE_SIZE}"
        ));
    }
    if page_size > MAXIMUM_PAGE_SIZE {
        return Err(anyhow!(
            "page size {page_size} is too large, maximum is {MAXIMUM_PAGE_SIZE}"
        ));
    }
    if !page_size.is_power_of_two() {
        return Err(anyhow!("page size {page_size} is not a power of two"));
    }
    Ok(())
}

pub(crate) fn page_lsn(buff: &[u8]) -> Option<Lsn> {
    Lsn::new(buff[PAGE_LSN_OFFSET..].read_u64())
}

pub(crate) fn set_page_lsn(buff: &mut [u8], lsn: Lsn) {
    buff[PAGE_LSN_OFFSET..PAGE_LSN_OFFSET + 8].copy_from_slice(&lsn.to_be_bytes());
}

fn checksum(buff: &[u8]) -> u64 {
    let crc = crc64::crc64(0x1d0f, &buff[..PAGE_CHECKSUM_OFFSET]);
    crc64::crc64(crc, &buff[PAGE_PAYLOAD_OFFSET..])
}

pub(crate) fn write_checksum(buff: &mut [u8]) {
    let crc = checksum(buff);
    buff[PAGE_CHECKSUM_OFFSET..PAGE_PAYLOAD_OFFSET].copy_from_slice(&crc.to_be_bytes());
}

/// A page that was never written is all zeros and is considered valid.
pub(crate) fn verify_checksum(buff: &[u8]) -> bool {
    let stored = buff[PAGE_CHECKSUM_OFFSET..].read_u64();
    if stored == checksum(buff) {
        return true;
    }
    buff.iter().all(|b| *b == 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_validation() {
        assert!(check_page_size(4096).is_ok());
        assert!(check_page_size(65536).is_ok());
        assert!(check_page_size(2048).is_err());
        assert!(check_page_size(6000).is_err());
        assert!(check_page_size(128 * 1024).is_err());
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let mut page = vec![0u8; 4096];
        assert!(verify_checksum(&page));

        set_page_lsn(&mut page, Lsn::new(99).unwrap());
        page[100] = 7;
        assert!(!verify_checksum(&page));
        write_checksum(&mut page);
        assert!(verify_checksum(&page));
        assert_eq!(Some(Lsn::new(99).unwrap()), page_lsn(&page));

        page[4000] ^= 1;
        assert!(!verify_checksum(&page));
    }
}
