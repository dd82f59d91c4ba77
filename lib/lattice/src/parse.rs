//! Typed payload encoding. Fields are concatenated without padding in little
//! endian byte order. A dynamic array carries a u64 element count, except
//! when it is the entire payload, in which case the count is omitted and the
//! array consumes the remainder.

use crate::shared::{NetError, NetResult, Violation};
use byteorder::{ByteOrder, LittleEndian};

/// Value types with a fixed byte layout and no indirections.
pub trait WireValue: Copy {
    const SIZE: usize;

    /// Reads a value from `buf`, which holds at least `SIZE` bytes.
    fn get(buf: &[u8]) -> Self;

    /// Appends the value to `out`.
    fn put(self, out: &mut Vec<u8>);
}

impl WireValue for u8 {
    const SIZE: usize = 1;

    #[inline]
    fn get(buf: &[u8]) -> Self {
        buf[0]
    }

    #[inline]
    fn put(self, out: &mut Vec<u8>) {
        out.push(self);
    }
}

macro_rules! int_wire_value {
    ($type:ty, $size:expr, $read:ident, $write:ident) => {
        impl WireValue for $type {
            const SIZE: usize = $size;

            #[inline]
            fn get(buf: &[u8]) -> Self {
                LittleEndian::$read(buf)
            }

            #[inline]
            fn put(self, out: &mut Vec<u8>) {
                let mut raw = [0u8; $size];
                LittleEndian::$write(&mut raw, self);
                out.extend_from_slice(&raw);
            }
        }
    };
}

int_wire_value!(u16, 2, read_u16, write_u16);
int_wire_value!(u32, 4, read_u32, write_u32);
int_wire_value!(u64, 8, read_u64, write_u64);
int_wire_value!(i32, 4, read_i32, write_i32);
int_wire_value!(i64, 8, read_i64, write_i64);

macro_rules! array_wire_value {
    ($size:expr) => {
        impl WireValue for [u8; $size] {
            const SIZE: usize = $size;

            #[inline]
            fn get(buf: &[u8]) -> Self {
                let mut raw = [0u8; $size];
                raw.copy_from_slice(&buf[..$size]);
                raw
            }

            #[inline]
            fn put(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self);
            }
        }
    };
}

array_wire_value!(16);
array_wire_value!(32);

/// Consumes a payload field by field. Every byte must be claimed: parsing
/// past the end or leaving bytes unconsumed is a protocol error.
pub struct MessageParser<'a> {
    data: &'a [u8],
}

impl<'a> MessageParser<'a> {
    #[inline]
    pub fn new(data: &'a [u8]) -> MessageParser<'a> {
        MessageParser { data }
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len()
    }

    pub fn get_value<T: WireValue>(&mut self) -> NetResult<T> {
        if self.data.len() < T::SIZE {
            return Err(NetError::Fatal(Violation::MessageTooShort {
                missing: T::SIZE - self.data.len(),
            }));
        }

        let value = T::get(self.data);
        self.data = &self.data[T::SIZE..];
        Ok(value)
    }

    pub fn get_array<T: WireValue>(&mut self) -> NetResult<Vec<T>> {
        let count = self.get_value::<u64>()? as usize;

        let byte_len = count
            .checked_mul(T::SIZE)
            .filter(|&len| len <= self.data.len())
            .ok_or_else(|| {
                NetError::Fatal(Violation::MessageTooShort {
                    missing: count.saturating_mul(T::SIZE).saturating_sub(self.data.len()),
                })
            })?;

        Ok(self.take_elements(byte_len, count))
    }

    /// Parses the remainder of the payload as one array. Used when the array
    /// is the only field, where the count prefix is omitted on the wire.
    pub fn get_tail<T: WireValue>(&mut self) -> NetResult<Vec<T>> {
        let len = self.data.len();

        if len % T::SIZE != 0 {
            return Err(NetError::Fatal(Violation::UnalignedTail {
                len,
                element: T::SIZE,
            }));
        }

        Ok(self.take_elements(len, len / T::SIZE))
    }

    /// Parses a length prefixed UTF-8 string field.
    pub fn get_string(&mut self) -> NetResult<String> {
        let raw = self.get_array::<u8>()?;
        String::from_utf8(raw).map_err(|_| NetError::Fatal(Violation::BadUtf8))
    }

    /// Validates that the payload was consumed exactly.
    pub fn finish(self) -> NetResult<()> {
        if self.data.is_empty() {
            Ok(())
        } else {
            Err(NetError::Fatal(Violation::MessageTooLong {
                extra: self.data.len(),
            }))
        }
    }

    fn take_elements<T: WireValue>(&mut self, byte_len: usize, count: usize) -> Vec<T> {
        let mut out = Vec::with_capacity(count);
        let mut slice = &self.data[..byte_len];

        while !slice.is_empty() {
            out.push(T::get(slice));
            slice = &slice[T::SIZE..];
        }

        self.data = &self.data[byte_len..];
        out
    }
}

/// Builds a payload field by field, mirroring `MessageParser`.
pub struct MessageBuilder {
    data: Vec<u8>,
}

impl MessageBuilder {
    #[inline]
    pub fn new() -> MessageBuilder {
        MessageBuilder { data: Vec::new() }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn add_value<T: WireValue>(&mut self, value: T) -> &mut Self {
        value.put(&mut self.data);
        self
    }

    pub fn add_array<T: WireValue>(&mut self, values: &[T]) -> &mut Self {
        self.add_value(values.len() as u64);
        for &value in values {
            value.put(&mut self.data);
        }
        self
    }

    /// Appends an array without a count prefix. Valid only as the last field,
    /// with no other field in the payload.
    pub fn add_tail<T: WireValue>(&mut self, values: &[T]) -> &mut Self {
        for &value in values {
            value.put(&mut self.data);
        }
        self
    }

    #[inline]
    pub fn add_string(&mut self, value: &str) -> &mut Self {
        self.add_array(value.as_bytes())
    }

    #[inline]
    pub fn into_payload(self) -> Vec<u8> {
        self.data
    }
}
