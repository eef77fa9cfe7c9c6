//! Binary serialization codec.
//!
//! Every value that crosses a process boundary (commands, statuses, events) or
//! lands on disk goes through the two traits defined here:
//!
//! - [`Serializer`]: an append-only byte sink.
//! - [`Deserializer`]: a byte source supporting consuming reads and non-consuming
//!   peeks ([`Deserializer::pre_deserialize`]).
//!
//! Values implement [`Encode`] / [`Decode`]. The canonical encoding is:
//!
//! | Type | Encoding |
//! |------|----------|
//! | `u8`, `i8`, `bool` | one byte |
//! | wider integers | little-endian, byte by byte |
//! | `f32`, `f64` | bit pattern as `u32`/`u64`, then the integer rule |
//! | `String` | `u32` byte length, raw UTF-8 bytes |
//! | `Vec<T>` | `u32` element count, then each element |
//! | `BTreeMap<K, V>` | `u32` entry count, then key/value pairs in key order |
//!
//! Polymorphic records (events) are read by peeking their leading `u32` type tag
//! and dispatching through the event registry, see [`crate::event`].
//!
//! # Example
//!
//! ```
//! use daq_runcontrol::codec::{BufferSerializer, Deserializer, Serializer};
//!
//! # fn main() -> daq_runcontrol::error::AppResult<()> {
//! let mut buf = BufferSerializer::new();
//! buf.write(&42u32)?;
//! buf.write(&"hello".to_string())?;
//!
//! assert_eq!(buf.read::<u32>()?, 42);
//! assert_eq!(buf.read::<String>()?, "hello");
//! # Ok(())
//! # }
//! ```

pub mod file;

use crate::error::{AppResult, DaqError};
use bytes::Bytes;
use std::collections::BTreeMap;

/// Append-only byte sink.
pub trait Serializer {
    /// Append raw bytes.
    fn serialize(&mut self, data: &[u8]) -> AppResult<()>;

    /// Push buffered bytes to the underlying medium.
    fn flush(&mut self) -> AppResult<()> {
        Ok(())
    }

    /// Encode `value` into this sink.
    fn write<T: Encode + ?Sized>(&mut self, value: &T) -> AppResult<()>
    where
        Self: Sized,
    {
        value.encode(self)
    }
}

/// Byte source with consuming reads and peeks.
pub trait Deserializer {
    /// Fill `dst` completely, consuming the bytes.
    fn deserialize(&mut self, dst: &mut [u8]) -> AppResult<()>;

    /// Fill `dst` completely without consuming the bytes.
    fn pre_deserialize(&mut self, dst: &mut [u8]) -> AppResult<()>;

    /// Whether at least one more byte can be read.
    fn has_data(&mut self) -> AppResult<bool>;

    /// Peek the next `u32` without consuming it.
    fn pre_read_u32(&mut self) -> AppResult<u32> {
        let mut buf = [0u8; 4];
        self.pre_deserialize(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Decode a `T` from this source.
    fn read<T: Decode>(&mut self) -> AppResult<T>
    where
        Self: Sized,
    {
        T::decode(self)
    }
}

/// Values with a canonical byte encoding.
pub trait Encode {
    /// Append the encoding of `self` to `ser`.
    fn encode(&self, ser: &mut dyn Serializer) -> AppResult<()>;
}

/// Values that can be rebuilt from their canonical encoding.
pub trait Decode: Sized {
    /// Consume exactly the bytes a matching [`Encode::encode`] produced.
    fn decode(de: &mut dyn Deserializer) -> AppResult<Self>;
}

macro_rules! impl_int_codec {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Encode for $ty {
                fn encode(&self, ser: &mut dyn Serializer) -> AppResult<()> {
                    ser.serialize(&self.to_le_bytes())
                }
            }

            impl Decode for $ty {
                fn decode(de: &mut dyn Deserializer) -> AppResult<Self> {
                    let mut buf = [0u8; std::mem::size_of::<$ty>()];
                    de.deserialize(&mut buf)?;
                    Ok(<$ty>::from_le_bytes(buf))
                }
            }
        )*
    };
}

impl_int_codec!(u8, i8, u16, i16, u32, i32, u64, i64);

impl Encode for bool {
    fn encode(&self, ser: &mut dyn Serializer) -> AppResult<()> {
        ser.serialize(&[u8::from(*self)])
    }
}

impl Decode for bool {
    fn decode(de: &mut dyn Deserializer) -> AppResult<Self> {
        Ok(u8::decode(de)? != 0)
    }
}

impl Encode for f32 {
    fn encode(&self, ser: &mut dyn Serializer) -> AppResult<()> {
        self.to_bits().encode(ser)
    }
}

impl Decode for f32 {
    fn decode(de: &mut dyn Deserializer) -> AppResult<Self> {
        Ok(f32::from_bits(u32::decode(de)?))
    }
}

impl Encode for f64 {
    fn encode(&self, ser: &mut dyn Serializer) -> AppResult<()> {
        self.to_bits().encode(ser)
    }
}

impl Decode for f64 {
    fn decode(de: &mut dyn Deserializer) -> AppResult<Self> {
        Ok(f64::from_bits(u64::decode(de)?))
    }
}

/// Convert a collection length to its `u32` wire prefix.
pub(crate) fn length_prefix(len: usize) -> AppResult<u32> {
    u32::try_from(len)
        .map_err(|_| DaqError::Protocol(format!("length {len} exceeds u32 prefix")))
}

impl Encode for str {
    fn encode(&self, ser: &mut dyn Serializer) -> AppResult<()> {
        length_prefix(self.len())?.encode(ser)?;
        if self.is_empty() {
            return Ok(());
        }
        ser.serialize(self.as_bytes())
    }
}

impl Encode for String {
    fn encode(&self, ser: &mut dyn Serializer) -> AppResult<()> {
        self.as_str().encode(ser)
    }
}

impl Decode for String {
    fn decode(de: &mut dyn Deserializer) -> AppResult<Self> {
        let len = u32::decode(de)? as usize;
        let mut raw = vec![0u8; len];
        if len > 0 {
            de.deserialize(&mut raw)?;
        }
        String::from_utf8(raw).map_err(|_| DaqError::InvalidUtf8)
    }
}

impl<T: Encode> Encode for [T] {
    fn encode(&self, ser: &mut dyn Serializer) -> AppResult<()> {
        length_prefix(self.len())?.encode(ser)?;
        for item in self {
            item.encode(ser)?;
        }
        Ok(())
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn encode(&self, ser: &mut dyn Serializer) -> AppResult<()> {
        self.as_slice().encode(ser)
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode(de: &mut dyn Deserializer) -> AppResult<Self> {
        let len = u32::decode(de)? as usize;
        // The prefix is untrusted; cap the up-front reservation.
        let mut out = Vec::with_capacity(len.min(4096));
        for _ in 0..len {
            out.push(T::decode(de)?);
        }
        Ok(out)
    }
}

impl<K: Encode, V: Encode> Encode for BTreeMap<K, V> {
    fn encode(&self, ser: &mut dyn Serializer) -> AppResult<()> {
        length_prefix(self.len())?.encode(ser)?;
        for (key, value) in self {
            key.encode(ser)?;
            value.encode(ser)?;
        }
        Ok(())
    }
}

impl<K: Decode + Ord, V: Decode> Decode for BTreeMap<K, V> {
    fn decode(de: &mut dyn Deserializer) -> AppResult<Self> {
        let len = u32::decode(de)?;
        let mut out = BTreeMap::new();
        for _ in 0..len {
            let key = K::decode(de)?;
            let value = V::decode(de)?;
            out.insert(key, value);
        }
        Ok(out)
    }
}

impl<A: Encode, B: Encode> Encode for (A, B) {
    fn encode(&self, ser: &mut dyn Serializer) -> AppResult<()> {
        self.0.encode(ser)?;
        self.1.encode(ser)
    }
}

impl<A: Decode, B: Decode> Decode for (A, B) {
    fn decode(de: &mut dyn Deserializer) -> AppResult<Self> {
        let a = A::decode(de)?;
        let b = B::decode(de)?;
        Ok((a, b))
    }
}

/// In-memory serializer and deserializer.
///
/// Writes append to the end of the buffer, reads consume from a cursor at the
/// front, so a single value can be written and read back in place. It is also
/// the unit of framing: one transport frame and one v2 file record are each the
/// contents of one `BufferSerializer`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferSerializer {
    data: Vec<u8>,
    offset: usize,
}

impl BufferSerializer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap already-encoded bytes for reading.
    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            offset: 0,
        }
    }

    /// Encode a single value into a fresh buffer.
    pub fn encode_value<T: Encode + ?Sized>(value: &T) -> AppResult<Self> {
        let mut buf = Self::new();
        value.encode(&mut buf)?;
        Ok(buf)
    }

    /// Decode a single value from `data`.
    pub fn decode_value<T: Decode>(data: &[u8]) -> AppResult<T> {
        let mut buf = Self::from_bytes(data.to_vec());
        T::decode(&mut buf)
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.offset..]
    }

    /// Number of bytes not yet consumed.
    pub fn len(&self) -> usize {
        self.data.len() - self.offset
    }

    /// Whether every byte has been consumed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unconsumed bytes as a shareable buffer.
    pub fn into_bytes(mut self) -> Bytes {
        if self.offset > 0 {
            self.data.drain(..self.offset);
        }
        Bytes::from(self.data)
    }
}

impl Serializer for BufferSerializer {
    fn serialize(&mut self, data: &[u8]) -> AppResult<()> {
        self.data.extend_from_slice(data);
        Ok(())
    }
}

impl Deserializer for BufferSerializer {
    fn deserialize(&mut self, dst: &mut [u8]) -> AppResult<()> {
        self.pre_deserialize(dst)?;
        self.offset += dst.len();
        Ok(())
    }

    fn pre_deserialize(&mut self, dst: &mut [u8]) -> AppResult<()> {
        let available = self.len();
        if dst.len() > available {
            return Err(DaqError::ReadUnderrun {
                needed: dst.len(),
                available,
            });
        }
        dst.copy_from_slice(&self.data[self.offset..self.offset + dst.len()]);
        Ok(())
    }

    fn has_data(&mut self) -> AppResult<bool> {
        Ok(!self.is_empty())
    }
}

/// A nested buffer is written as a byte vector, which is how v2 files wrap records.
impl Encode for BufferSerializer {
    fn encode(&self, ser: &mut dyn Serializer) -> AppResult<()> {
        let bytes = self.remaining();
        length_prefix(bytes.len())?.encode(ser)?;
        ser.serialize(bytes)
    }
}

impl Decode for BufferSerializer {
    fn decode(de: &mut dyn Deserializer) -> AppResult<Self> {
        let len = u32::decode(de)? as usize;
        let mut data = vec![0u8; len];
        if len > 0 {
            de.deserialize(&mut data)?;
        }
        Ok(Self::from_bytes(data))
    }
}
