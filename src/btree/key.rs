//! Index keys and their byte encoding.
//!
//! Trees compare keys as plain byte strings, so the default serializer produces an order
//! preserving ("memcomparable") encoding: the bytes of two keys compare like the keys themselves.
//! Every field is self-delimiting, which makes the encoding of a key prefix a byte prefix of the
//! encoding of every key starting with it.

use crate::error::StorageError;
use crate::id::Rid;
use anyhow::anyhow;
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum KeyType {
    Boolean,
    Byte,
    Short,
    Integer,
    Long,
    Float,
    Double,
    String,
    Binary,
    Link,
}

#[derive(Clone, Debug, PartialEq)]
pub enum KeyValue {
    Boolean(bool),
    Byte(i8),
    Short(i16),
    Integer(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    Binary(Vec<u8>),
    Link(Rid),
}

impl KeyValue {
    pub fn key_type(&self) -> KeyType {
        match self {
            KeyValue::Boolean(_) => KeyType::Boolean,
            KeyValue::Byte(_) => KeyType::Byte,
            KeyValue::Short(_) => KeyType::Short,
            KeyValue::Integer(_) => KeyType::Integer,
            KeyValue::Long(_) => KeyType::Long,
            KeyValue::Float(_) => KeyType::Float,
            KeyValue::Double(_) => KeyType::Double,
            KeyValue::String(_) => KeyType::String,
            KeyValue::Binary(_) => KeyType::Binary,
            KeyValue::Link(_) => KeyType::Link,
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Boolean(v) => write!(f, "{v}"),
            KeyValue::Byte(v) => write!(f, "{v}"),
            KeyValue::Short(v) => write!(f, "{v}"),
            KeyValue::Integer(v) => write!(f, "{v}"),
            KeyValue::Long(v) => write!(f, "{v}"),
            KeyValue::Float(v) => write!(f, "{v}"),
            KeyValue::Double(v) => write!(f, "{v}"),
            KeyValue::String(v) => write!(f, "{v:?}"),
            KeyValue::Binary(v) => write!(f, "{v:02x?}"),
            KeyValue::Link(v) => write!(f, "{v}"),
        }
    }
}

/// A possibly composite key. A key with fewer fields than the index declares is a prefix and
/// can only be used to search.
#[derive(Clone, Debug, PartialEq)]
pub struct Key(Vec<KeyValue>);

impl Key {
    pub fn new(values: Vec<KeyValue>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[KeyValue] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<KeyValue> for Key {
    fn from(value: KeyValue) -> Self {
        Self(vec![value])
    }
}

impl From<i32> for Key {
    fn from(value: i32) -> Self {
        KeyValue::Integer(value).into()
    }
}

impl From<i64> for Key {
    fn from(value: i64) -> Self {
        KeyValue::Long(value).into()
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        KeyValue::String(value.to_string()).into()
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        KeyValue::String(value).into()
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let [value] = self.0.as_slice() {
            return write!(f, "{value}");
        }
        write!(f, "[")?;
        for (i, value) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{value}")?;
        }
        write!(f, "]")
    }
}

/// Turns keys into the bytes stored in the tree. `types` holds the types of the fields present in
/// the key, which may be fewer than the index declares.
pub trait KeySerializer: Send + Sync {
    fn serialize(&self, types: &[KeyType], key: &Key, out: &mut Vec<u8>) -> anyhow::Result<()>;

    fn deserialize(&self, types: &[KeyType], buff: &[u8]) -> anyhow::Result<Key>;
}

/// Optional transformation of the stored key bytes. Trees decrypt keys before comparing them.
pub trait Encryption: Send + Sync {
    fn encrypt(&self, plain: &[u8]) -> Vec<u8>;

    fn decrypt(&self, stored: &[u8]) -> anyhow::Result<Vec<u8>>;
}

#[derive(Copy, Clone, Debug, Default)]
pub struct MemcomparableSerializer;

const ESCAPE: u8 = 0x00;
const ESCAPED_ZERO: u8 = 0xff;
const TERMINATOR: u8 = 0x01;

/// Size of an encoded rid.
pub(crate) const RID_KEY_SIZE: usize = 10;

pub(crate) fn encode_rid(rid: &Rid, out: &mut Vec<u8>) {
    out.extend_from_slice(&((rid.cluster_id as u16) ^ 0x8000).to_be_bytes());
    out.extend_from_slice(&((rid.cluster_position as u64) ^ (1 << 63)).to_be_bytes());
}

pub(crate) fn decode_rid(buff: &[u8]) -> anyhow::Result<Rid> {
    if buff.len() < RID_KEY_SIZE {
        return Err(anyhow!("encoded rid needs {RID_KEY_SIZE} bytes, got {}", buff.len()));
    }
    let cluster_id = (u16::from_be_bytes([buff[0], buff[1]]) ^ 0x8000) as i16;
    let mut position = [0u8; 8];
    position.copy_from_slice(&buff[2..10]);
    let cluster_position = (u64::from_be_bytes(position) ^ (1 << 63)) as i64;
    Ok(Rid::new(cluster_id, cluster_position))
}

fn encode_bytes(bytes: &[u8], out: &mut Vec<u8>) {
    for b in bytes {
        out.push(*b);
        if *b == ESCAPE {
            out.push(ESCAPED_ZERO);
        }
    }
    out.push(ESCAPE);
    out.push(TERMINATOR);
}

fn decode_bytes(buff: &[u8], offset: &mut usize) -> anyhow::Result<Vec<u8>> {
    let mut bytes = Vec::new();
    loop {
        let Some(b) = buff.get(*offset).copied() else {
            return Err(anyhow!("unterminated byte string"));
        };
        *offset += 1;
        if b != ESCAPE {
            bytes.push(b);
            continue;
        }
        let marker = buff.get(*offset).copied();
        *offset += 1;
        match marker {
            Some(ESCAPED_ZERO) => bytes.push(0),
            Some(TERMINATOR) => return Ok(bytes),
            _ => return Err(anyhow!("invalid escape in byte string")),
        }
    }
}

fn take<const N: usize>(buff: &[u8], offset: &mut usize) -> anyhow::Result<[u8; N]> {
    let Some(slice) = buff.get(*offset..*offset + N) else {
        return Err(anyhow!("key is truncated at offset {offset}"));
    };
    *offset += N;
    let mut bytes = [0u8; N];
    bytes.copy_from_slice(slice);
    Ok(bytes)
}

impl KeySerializer for MemcomparableSerializer {
    fn serialize(&self, types: &[KeyType], key: &Key, out: &mut Vec<u8>) -> anyhow::Result<()> {
        if key.len() != types.len() {
            return Err(StorageError::KeyTypeMismatch(format!(
                "key {key} has {} fields, expected {}",
                key.len(),
                types.len()
            ))
            .into());
        }
        for (value, expected) in key.values().iter().zip(types) {
            if value.key_type() != *expected {
                return Err(StorageError::KeyTypeMismatch(format!(
                    "{value} is {:?}, expected {expected:?}",
                    value.key_type()
                ))
                .into());
            }
            match value {
                KeyValue::Boolean(v) => out.push(*v as u8),
                KeyValue::Byte(v) => out.push((*v as u8) ^ 0x80),
                KeyValue::Short(v) => out.extend_from_slice(&((*v as u16) ^ 0x8000).to_be_bytes()),
                KeyValue::Integer(v) => {
                    out.extend_from_slice(&((*v as u32) ^ 0x8000_0000).to_be_bytes())
                }
                KeyValue::Long(v) => {
                    out.extend_from_slice(&((*v as u64) ^ (1 << 63)).to_be_bytes())
                }
                KeyValue::Float(v) => {
                    let bits = v.to_bits();
                    let bits = if bits >> 31 == 1 { !bits } else { bits ^ (1 << 31) };
                    out.extend_from_slice(&bits.to_be_bytes());
                }
                KeyValue::Double(v) => {
                    let bits = v.to_bits();
                    let bits = if bits >> 63 == 1 { !bits } else { bits ^ (1 << 63) };
                    out.extend_from_slice(&bits.to_be_bytes());
                }
                KeyValue::String(v) => encode_bytes(v.as_bytes(), out),
                KeyValue::Binary(v) => encode_bytes(v, out),
                KeyValue::Link(v) => encode_rid(v, out),
            }
        }
        Ok(())
    }

    fn deserialize(&self, types: &[KeyType], buff: &[u8]) -> anyhow::Result<Key> {
        let mut offset = 0;
        let mut values = Vec::with_capacity(types.len());
        for key_type in types {
            let value = match key_type {
                KeyType::Boolean => KeyValue::Boolean(take::<1>(buff, &mut offset)?[0] != 0),
                KeyType::Byte => KeyValue::Byte((take::<1>(buff, &mut offset)?[0] ^ 0x80) as i8),
                KeyType::Short => KeyValue::Short(
                    (u16::from_be_bytes(take(buff, &mut offset)?) ^ 0x8000) as i16,
                ),
                KeyType::Integer => KeyValue::Integer(
                    (u32::from_be_bytes(take(buff, &mut offset)?) ^ 0x8000_0000) as i32,
                ),
                KeyType::Long => KeyValue::Long(
                    (u64::from_be_bytes(take(buff, &mut offset)?) ^ (1 << 63)) as i64,
                ),
                KeyType::Float => {
                    let bits = u32::from_be_bytes(take(buff, &mut offset)?);
                    let bits = if bits >> 31 == 1 { bits ^ (1 << 31) } else { !bits };
                    KeyValue::Float(f32::from_bits(bits))
                }
                KeyType::Double => {
                    let bits = u64::from_be_bytes(take(buff, &mut offset)?);
                    let bits = if bits >> 63 == 1 { bits ^ (1 << 63) } else { !bits };
                    KeyValue::Double(f64::from_bits(bits))
                }
                KeyType::String => {
                    let bytes = decode_bytes(buff, &mut offset)?;
                    KeyValue::String(
                        String::from_utf8(bytes).map_err(|err| anyhow!("invalid key: {err}"))?,
                    )
                }
                KeyType::Binary => KeyValue::Binary(decode_bytes(buff, &mut offset)?),
                KeyType::Link => {
                    let rid = decode_rid(&buff[offset.min(buff.len())..])?;
                    offset += RID_KEY_SIZE;
                    KeyValue::Link(rid)
                }
            };
            values.push(value);
        }
        if offset != buff.len() {
            return Err(anyhow!("{} trailing bytes after key", buff.len() - offset));
        }
        Ok(Key::new(values))
    }
}

/// Key layout of one index: serializer, declared types, size limit and encryption.
pub(crate) struct KeyCodec {
    serializer: Arc<dyn KeySerializer>,
    types: Vec<KeyType>,
    encryption: Option<Arc<dyn Encryption>>,
    max_key_size: usize,
}

impl KeyCodec {
    pub(crate) fn new(
        serializer: Arc<dyn KeySerializer>,
        types: Vec<KeyType>,
        key_size: usize,
        encryption: Option<Arc<dyn Encryption>>,
        max_key_size: usize,
    ) -> anyhow::Result<Self> {
        if key_size == 0 || key_size != types.len() {
            return Err(anyhow!(
                "key size {key_size} does not match the {} declared key types",
                types.len()
            ));
        }
        Ok(Self {
            serializer,
            types,
            encryption,
            max_key_size,
        })
    }

    pub(crate) fn encryption(&self) -> Option<&Arc<dyn Encryption>> {
        self.encryption.as_ref()
    }

    pub(crate) fn key_size(&self) -> usize {
        self.types.len()
    }

    /// Encodes a complete key and checks it against the size limit.
    pub(crate) fn encode(&self, key: &Key) -> anyhow::Result<Vec<u8>> {
        if key.len() != self.types.len() {
            return Err(StorageError::KeyTypeMismatch(format!(
                "key {key} has {} fields, expected {}",
                key.len(),
                self.types.len()
            ))
            .into());
        }
        let plain = self.encode_prefix(key)?;
        let size = match &self.encryption {
            Some(encryption) => encryption.encrypt(&plain).len(),
            None => plain.len(),
        };
        if size > self.max_key_size {
            return Err(StorageError::KeyTooBig {
                size,
                max: self.max_key_size,
            }
            .into());
        }
        Ok(plain)
    }

    /// Encodes a key which may only hold the leading fields, for searches.
    pub(crate) fn encode_prefix(&self, key: &Key) -> anyhow::Result<Vec<u8>> {
        if key.is_empty() || key.len() > self.types.len() {
            return Err(StorageError::KeyTypeMismatch(format!(
                "key {key} has {} fields, expected 1 to {}",
                key.len(),
                self.types.len()
            ))
            .into());
        }
        let mut plain = Vec::new();
        self.serializer
            .serialize(&self.types[..key.len()], key, &mut plain)?;
        Ok(plain)
    }

    pub(crate) fn decode(&self, plain: &[u8]) -> anyhow::Result<Key> {
        self.serializer.deserialize(&self.types, plain)
    }
}

pub(crate) fn seal(encryption: Option<&Arc<dyn Encryption>>, plain: &[u8]) -> Vec<u8> {
    match encryption {
        Some(encryption) => encryption.encrypt(plain),
        None => plain.to_vec(),
    }
}

pub(crate) fn unseal<'a>(
    encryption: Option<&Arc<dyn Encryption>>,
    stored: &'a [u8],
) -> anyhow::Result<Cow<'a, [u8]>> {
    match encryption {
        Some(encryption) => Ok(Cow::Owned(encryption.decrypt(stored)?)),
        None => Ok(Cow::Borrowed(stored)),
    }
}
