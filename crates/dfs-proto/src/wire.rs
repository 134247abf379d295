use byteorder::{ByteOrder, LittleEndian};
use dfs_types::{BlockId, ServerAddress};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("insufficient data: need {need} bytes but only {have} remain")]
    InsufficientData { need: usize, have: usize },
    #[error("invalid enum variant for {enum_name}: {value}")]
    InvalidEnumVariant {
        enum_name: &'static str,
        value: u64,
    },
    #[error("invalid UTF-8 string")]
    InvalidUtf8,
    #[error("invalid server address {0:?}")]
    InvalidAddress(String),
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
}

pub trait WireSerialize {
    fn wire_serialize(&self, buf: &mut Vec<u8>) -> Result<(), WireError>;
}

pub trait WireDeserialize: Sized {
    fn wire_deserialize(buf: &[u8], offset: &mut usize) -> Result<Self, WireError>;
}

/// Serialize a value into a fresh buffer.
pub fn to_wire<T: WireSerialize>(value: &T) -> Result<Vec<u8>, WireError> {
    let mut buf = Vec::new();
    value.wire_serialize(&mut buf)?;
    Ok(buf)
}

/// Deserialize a value that must span the whole buffer.
pub fn from_wire<T: WireDeserialize>(buf: &[u8]) -> Result<T, WireError> {
    let mut offset = 0;
    let value = T::wire_deserialize(buf, &mut offset)?;
    if offset != buf.len() {
        return Err(WireError::TrailingBytes(buf.len() - offset));
    }
    Ok(value)
}

fn read_bytes<'a>(buf: &'a [u8], offset: &mut usize, n: usize) -> Result<&'a [u8], WireError> {
    if buf.len() - *offset < n {
        return Err(WireError::InsufficientData {
            need: n,
            have: buf.len() - *offset,
        });
    }
    let slice = &buf[*offset..*offset + n];
    *offset += n;
    Ok(slice)
}

// ---------------------------------------------------------------------------
// Integer types
// ---------------------------------------------------------------------------

macro_rules! impl_wire_for_int {
    ($ty:ty, $size:expr, $read:ident, $write:ident) => {
        impl WireSerialize for $ty {
            fn wire_serialize(&self, buf: &mut Vec<u8>) -> Result<(), WireError> {
                let mut tmp = [0u8; $size];
                LittleEndian::$write(&mut tmp, *self);
                buf.extend_from_slice(&tmp);
                Ok(())
            }
        }

        impl WireDeserialize for $ty {
            fn wire_deserialize(buf: &[u8], offset: &mut usize) -> Result<Self, WireError> {
                let bytes = read_bytes(buf, offset, $size)?;
                Ok(LittleEndian::$read(bytes))
            }
        }
    };
}

impl_wire_for_int!(u32, 4, read_u32, write_u32);
impl_wire_for_int!(i32, 4, read_i32, write_i32);
impl_wire_for_int!(i64, 8, read_i64, write_i64);

impl WireSerialize for u8 {
    fn wire_serialize(&self, buf: &mut Vec<u8>) -> Result<(), WireError> {
        buf.push(*self);
        Ok(())
    }
}

impl WireDeserialize for u8 {
    fn wire_deserialize(buf: &[u8], offset: &mut usize) -> Result<Self, WireError> {
        let bytes = read_bytes(buf, offset, 1)?;
        Ok(bytes[0])
    }
}

// ---------------------------------------------------------------------------
// String
// ---------------------------------------------------------------------------

impl WireSerialize for String {
    fn wire_serialize(&self, buf: &mut Vec<u8>) -> Result<(), WireError> {
        let len = self.len() as u32;
        len.wire_serialize(buf)?;
        buf.extend_from_slice(self.as_bytes());
        Ok(())
    }
}

impl WireDeserialize for String {
    fn wire_deserialize(buf: &[u8], offset: &mut usize) -> Result<Self, WireError> {
        let len = u32::wire_deserialize(buf, offset)? as usize;
        let bytes = read_bytes(buf, offset, len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| WireError::InvalidUtf8)
    }
}

// ---------------------------------------------------------------------------
// Vec<T>: u32 count followed by the elements
// ---------------------------------------------------------------------------

impl<T: WireSerialize> WireSerialize for Vec<T> {
    fn wire_serialize(&self, buf: &mut Vec<u8>) -> Result<(), WireError> {
        let len = self.len() as u32;
        len.wire_serialize(buf)?;
        for item in self {
            item.wire_serialize(buf)?;
        }
        Ok(())
    }
}

impl<T: WireDeserialize> WireDeserialize for Vec<T> {
    fn wire_deserialize(buf: &[u8], offset: &mut usize) -> Result<Self, WireError> {
        let len = u32::wire_deserialize(buf, offset)? as usize;
        // The count is untrusted; bound the preallocation.
        let mut result = Vec::with_capacity(len.min(1024));
        for _ in 0..len {
            result.push(T::wire_deserialize(buf, offset)?);
        }
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// Domain types
// ---------------------------------------------------------------------------

impl WireSerialize for BlockId {
    fn wire_serialize(&self, buf: &mut Vec<u8>) -> Result<(), WireError> {
        buf.extend_from_slice(&self.to_bytes());
        Ok(())
    }
}

impl WireDeserialize for BlockId {
    fn wire_deserialize(buf: &[u8], offset: &mut usize) -> Result<Self, WireError> {
        let bytes = read_bytes(buf, offset, 16)?;
        let mut raw = [0u8; 16];
        raw.copy_from_slice(bytes);
        Ok(BlockId::from_bytes(raw))
    }
}

impl WireSerialize for ServerAddress {
    fn wire_serialize(&self, buf: &mut Vec<u8>) -> Result<(), WireError> {
        self.to_string().wire_serialize(buf)
    }
}

impl WireDeserialize for ServerAddress {
    fn wire_deserialize(buf: &[u8], offset: &mut usize) -> Result<Self, WireError> {
        let s = String::wire_deserialize(buf, offset)?;
        s.parse().map_err(|_| WireError::InvalidAddress(s))
    }
}
