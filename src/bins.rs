use anyhow::anyhow;

pub(crate) trait SliceExt {
    fn read_u16(&self) -> u16;
    fn read_u32(&self) -> u32;
    fn read_u64(&self) -> u64;
}

impl SliceExt for [u8] {
    fn read_u16(&self) -> u16 {
        u16::from_be_bytes([self[0], self[1]])
    }
    fn read_u32(&self) -> u32 {
        u32::from_be_bytes([self[0], self[1], self[2], self[3]])
    }
    fn read_u64(&self) -> u64 {
        let mut buff = [0u8; 8];
        buff.copy_from_slice(&self[..8]);
        u64::from_be_bytes(buff)
    }
}

/// Big-endian appenders used by the record encoders.
pub(crate) trait BuffExt {
    fn put_u8(&mut self, v: u8);
    fn put_u16(&mut self, v: u16);
    fn put_u32(&mut self, v: u32);
    fn put_u64(&mut self, v: u64);
    fn put_i16(&mut self, v: i16);
    fn put_i32(&mut self, v: i32);
    fn put_i64(&mut self, v: i64);
    fn put_bytes(&mut self, v: &[u8]);
    fn put_str(&mut self, v: &str);
}

impl BuffExt for Vec<u8> {
    fn put_u8(&mut self, v: u8) {
        self.push(v);
    }
    fn put_u16(&mut self, v: u16) {
        self.extend_from_slice(&v.to_be_bytes());
    }
    fn put_u32(&mut self, v: u32) {
        self.extend_from_slice(&v.to_be_bytes());
    }
    fn put_u64(&mut self, v: u64) {
        self.extend_from_slice(&v.to_be_bytes());
    }
    fn put_i16(&mut self, v: i16) {
        self.extend_from_slice(&v.to_be_bytes());
    }
    fn put_i32(&mut self, v: i32) {
        self.extend_from_slice(&v.to_be_bytes());
    }
    fn put_i64(&mut self, v: i64) {
        self.extend_from_slice(&v.to_be_bytes());
    }
    fn put_bytes(&mut self, v: &[u8]) {
        self.put_u32(v.len() as u32);
        self.extend_from_slice(v);
    }
    fn put_str(&mut self, v: &str) {
        self.put_bytes(v.as_bytes());
    }
}

/// Size of a length-prefixed byte string written by [`BuffExt::put_bytes`].
#[inline]
pub(crate) fn bytes_size(len: usize) -> usize {
    4 + len
}

pub(crate) struct ByteReader<'a> {
    buff: &'a [u8],
    offset: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(buff: &'a [u8]) -> Self {
        Self { buff, offset: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buff.len() - self.offset
    }

    fn take(&mut self, n: usize) -> anyhow::Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(anyhow!(
                "unexpected end of buffer, need {n} bytes at offset {} but only {} left",
                self.offset,
                self.remaining()
            ));
        }
        let slice = &self.buff[self.offset..self.offset + n];
        self.offset += n;
        Ok(slice)
    }

    pub(crate) fn get_u8(&mut self) -> anyhow::Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn get_bool(&mut self) -> anyhow::Result<bool> {
        match self.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            v => Err(anyhow!("invalid boolean byte {v}")),
        }
    }

    pub(crate) fn get_u16(&mut self) -> anyhow::Result<u16> {
        Ok(self.take(2)?.read_u16())
    }

    pub(crate) fn get_u32(&mut self) -> anyhow::Result<u32> {
        Ok(self.take(4)?.read_u32())
    }

    pub(crate) fn get_u64(&mut self) -> anyhow::Result<u64> {
        Ok(self.take(8)?.read_u64())
    }

    pub(crate) fn get_i16(&mut self) -> anyhow::Result<i16> {
        Ok(self.get_u16()? as i16)
    }

    pub(crate) fn get_i32(&mut self) -> anyhow::Result<i32> {
        Ok(self.get_u32()? as i32)
    }

    pub(crate) fn get_i64(&mut self) -> anyhow::Result<i64> {
        Ok(self.get_u64()? as i64)
    }

    pub(crate) fn get_bytes(&mut self) -> anyhow::Result<Vec<u8>> {
        let len = self.get_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub(crate) fn get_str(&mut self) -> anyhow::Result<String> {
        let raw = self.get_bytes()?;
        String::from_utf8(raw).map_err(|err| anyhow!("invalid utf-8 string: {err}"))
    }

    pub(crate) fn finish(&self) -> anyhow::Result<()> {
        if self.remaining() != 0 {
            return Err(anyhow!("{} trailing bytes left", self.remaining()));
        }
        Ok(())
    }
}
