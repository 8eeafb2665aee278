//! Typed readers.
//!
//! Each type has a position-based decoder (`*_at`) that works on a shared
//! `&Stream` and returns the value with the position right after it, and a
//! cursor reader (`read_*`) on top. Cursor readers move the read cursor only
//! on success.
//!
//! Containers decode into views over an `Arc<Stream>`. The `shared_*_at`
//! functions index a buffer that is already shared, so nested containers are
//! views into the same bytes. A cursor reader on a plain `Stream` cannot lend
//! its frames out, so it copies the outermost container once.

use std::borrow::Cow;
use std::sync::Arc;

use crate::error::WireError;
use crate::protocol::{op, Stream, CONTAINER_INLINE_COUNT, STREAM_POS_BODY};

use super::array::RpcArray;
use super::map::RpcMap;
use super::value::Value;

/// Layout of a non-empty container on the wire.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ContainerSpan {
    /// First element byte.
    pub items: usize,
    /// Position right after the container.
    pub end: usize,
    /// Number of elements (entries for maps).
    pub count: usize,
}

impl Stream {
    #[inline]
    fn read_with<T>(
        &mut self,
        decode: impl FnOnce(&Self, usize) -> Result<(T, usize), WireError>,
    ) -> Result<T, WireError> {
        let (value, next) = decode(self, self.read_pos())?;
        self.set_read_pos_fast(next);
        Ok(value)
    }

    pub(crate) fn nil_at(&self, pos: usize) -> Result<((), usize), WireError> {
        match self.opcode_at(pos)? {
            op::NIL => Ok(((), pos + 1)),
            code => Err(WireError::Opcode(code)),
        }
    }

    pub(crate) fn bool_at(&self, pos: usize) -> Result<(bool, usize), WireError> {
        match self.opcode_at(pos)? {
            op::TRUE => Ok((true, pos + 1)),
            op::FALSE => Ok((false, pos + 1)),
            code => Err(WireError::Opcode(code)),
        }
    }

    pub(crate) fn f64_at(&self, pos: usize) -> Result<(f64, usize), WireError> {
        match self.opcode_at(pos)? {
            op::F64_ZERO => Ok((0.0, pos + 1)),
            op::F64 => Ok((f64::from_le_bytes(self.fixed_at(pos + 1)?), pos + 9)),
            code => Err(WireError::Opcode(code)),
        }
    }

    pub(crate) fn i64_at(&self, pos: usize) -> Result<(i64, usize), WireError> {
        match self.opcode_at(pos)? {
            code @ op::SMALL_I64_FIRST..=op::SMALL_I64_LAST => {
                Ok((code as i64 - op::SMALL_I64_BIAS, pos + 1))
            }
            op::I16 => Ok((i16::from_le_bytes(self.fixed_at(pos + 1)?) as i64, pos + 3)),
            op::I32 => Ok((i32::from_le_bytes(self.fixed_at(pos + 1)?) as i64, pos + 5)),
            op::I64 => Ok((i64::from_le_bytes(self.fixed_at(pos + 1)?), pos + 9)),
            code => Err(WireError::Opcode(code)),
        }
    }

    pub(crate) fn u64_at(&self, pos: usize) -> Result<(u64, usize), WireError> {
        match self.opcode_at(pos)? {
            code @ op::SMALL_U64_FIRST..=op::SMALL_U64_LAST => {
                Ok(((code - op::SMALL_U64_FIRST) as u64, pos + 1))
            }
            op::U16 => Ok((u16::from_le_bytes(self.fixed_at(pos + 1)?) as u64, pos + 3)),
            op::U32 => Ok((u32::from_le_bytes(self.fixed_at(pos + 1)?) as u64, pos + 5)),
            op::U64 => Ok((u64::from_le_bytes(self.fixed_at(pos + 1)?), pos + 9)),
            code => Err(WireError::Opcode(code)),
        }
    }

    /// Decode a string, borrowing from the frame when it does not straddle one.
    pub(crate) fn str_at(&self, pos: usize) -> Result<(Cow<'_, str>, usize), WireError> {
        let (start, len) = match self.opcode_at(pos)? {
            op::STRING_EMPTY => return Ok((Cow::Borrowed(""), pos + 1)),
            code @ 129..=190 => (pos + 1, (code - op::STRING_EMPTY) as usize),
            op::STRING_LONG => (pos + 5, self.u32_at(pos + 1)? as usize),
            code => return Err(WireError::Opcode(code)),
        };
        self.ensure_readable(start, len + 1)?;
        if self.byte_at(start + len) != 0 {
            return Err(WireError::Sentinel);
        }
        let text = match self.slice_at(start, len)? {
            Cow::Borrowed(raw) => {
                Cow::Borrowed(std::str::from_utf8(raw).map_err(|_| WireError::Utf8)?)
            }
            Cow::Owned(raw) => Cow::Owned(String::from_utf8(raw).map_err(|_| WireError::Utf8)?),
        };
        Ok((text, start + len + 1))
    }

    pub(crate) fn bytes_at(&self, pos: usize) -> Result<(Cow<'_, [u8]>, usize), WireError> {
        let (start, len) = match self.opcode_at(pos)? {
            op::BYTES_EMPTY => return Ok((Cow::Borrowed(&[][..]), pos + 1)),
            code @ 193..=254 => (pos + 1, (code - op::BYTES_EMPTY) as usize),
            op::BYTES_LONG => (pos + 5, self.u32_at(pos + 1)? as usize),
            code => return Err(WireError::Opcode(code)),
        };
        Ok((self.slice_at(start, len)?, start + len))
    }

    /// Locate the elements of a non-empty container whose empty opcode is `empty`.
    pub(crate) fn container_at(&self, pos: usize, empty: u8) -> Result<ContainerSpan, WireError> {
        let code = self.opcode_at(pos)?;
        let long = empty + CONTAINER_INLINE_COUNT as u8 + 1;
        if code <= empty || code > long {
            return Err(WireError::Opcode(code));
        }
        let total = self.u32_at(pos + 1)? as usize;
        let end = pos + total;
        let (items, count) = if code == long {
            (pos + 9, self.u32_at(pos + 5)? as usize)
        } else {
            (pos + 5, (code - empty) as usize)
        };
        if end < items || end > self.write_pos() {
            return Err(WireError::Overflow);
        }
        Ok(ContainerSpan { items, end, count })
    }

    /// Copy `start..end` into a fresh buffer, placed at the first body byte.
    fn detach(&self, start: usize, end: usize) -> Arc<Stream> {
        let mut own = Stream::new();
        own.put_stream_range(self, start, end - start);
        Arc::new(own)
    }

    pub(crate) fn array_at(&self, pos: usize) -> Result<(RpcArray, usize), WireError> {
        if self.opcode_at(pos)? == op::ARRAY_EMPTY {
            return Ok((RpcArray::new(), pos + 1));
        }
        let span = self.container_at(pos, op::ARRAY_EMPTY)?;
        let (array, _) = shared_array_at(&self.detach(pos, span.end), STREAM_POS_BODY)?;
        Ok((array, span.end))
    }

    pub(crate) fn map_at(&self, pos: usize) -> Result<(RpcMap, usize), WireError> {
        if self.opcode_at(pos)? == op::MAP_EMPTY {
            return Ok((RpcMap::new(), pos + 1));
        }
        let span = self.container_at(pos, op::MAP_EMPTY)?;
        let (map, _) = shared_map_at(&self.detach(pos, span.end), STREAM_POS_BODY)?;
        Ok((map, span.end))
    }

    /// Decode whatever value sits at `pos`.
    pub(crate) fn value_at(&self, pos: usize) -> Result<(Value, usize), WireError> {
        let code = self.opcode_at(pos)?;
        match code {
            op::NIL => Ok((Value::Nil, pos + 1)),
            op::TRUE | op::FALSE => self.bool_at(pos).map(|(v, n)| (Value::Bool(v), n)),
            op::F64_ZERO | op::F64 => self.f64_at(pos).map(|(v, n)| (Value::Float(v), n)),
            op::I16 | op::I32 | op::I64 | op::SMALL_I64_FIRST..=op::SMALL_I64_LAST => {
                self.i64_at(pos).map(|(v, n)| (Value::Int(v), n))
            }
            op::U16 | op::U32 | op::U64 | op::SMALL_U64_FIRST..=op::SMALL_U64_LAST => {
                self.u64_at(pos).map(|(v, n)| (Value::Uint(v), n))
            }
            op::ARRAY_EMPTY..=op::ARRAY_LONG => {
                self.array_at(pos).map(|(v, n)| (Value::Array(v), n))
            }
            op::MAP_EMPTY..=op::MAP_LONG => self.map_at(pos).map(|(v, n)| (Value::Map(v), n)),
            op::STRING_EMPTY..=op::STRING_LONG => self
                .str_at(pos)
                .map(|(v, n)| (Value::Str(v.into_owned()), n)),
            op::BYTES_EMPTY..=op::BYTES_LONG => self
                .bytes_at(pos)
                .map(|(v, n)| (Value::Bytes(v.into_owned()), n)),
            _ => Err(WireError::Opcode(code)),
        }
    }

    /// Read nil.
    pub fn read_nil(&mut self) -> Result<(), WireError> {
        self.read_with(Self::nil_at)
    }

    /// Read a bool.
    pub fn read_bool(&mut self) -> Result<bool, WireError> {
        self.read_with(Self::bool_at)
    }

    /// Read a float.
    pub fn read_f64(&mut self) -> Result<f64, WireError> {
        self.read_with(Self::f64_at)
    }

    /// Read a signed integer in any of its encodings.
    pub fn read_i64(&mut self) -> Result<i64, WireError> {
        self.read_with(Self::i64_at)
    }

    /// Read an unsigned integer in any of its encodings.
    pub fn read_u64(&mut self) -> Result<u64, WireError> {
        self.read_with(Self::u64_at)
    }

    /// Read a string into an owned `String`.
    pub fn read_string(&mut self) -> Result<String, WireError> {
        self.read_with(|s, pos| s.str_at(pos).map(|(v, n)| (v.into_owned(), n)))
    }

    /// Decode the string under the cursor without copying when it sits
    /// inside one frame.
    ///
    /// The cursor does not move; the position after the string is returned
    /// instead.
    ///
    /// ```
    /// use echowire::protocol::Stream;
    ///
    /// let mut stream = Stream::new();
    /// stream.write_string("hello").unwrap();
    /// let (text, next) = stream.peek_str().unwrap();
    /// assert_eq!(text, "hello");
    /// assert_eq!(next, stream.write_pos());
    /// ```
    pub fn peek_str(&self) -> Result<(Cow<'_, str>, usize), WireError> {
        self.str_at(self.read_pos())
    }

    /// Read a byte array into an owned `Vec`.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>, WireError> {
        self.read_with(|s, pos| s.bytes_at(pos).map(|(v, n)| (v.into_owned(), n)))
    }

    /// Decode the byte array under the cursor, borrowing when possible.
    pub fn peek_bytes(&self) -> Result<(Cow<'_, [u8]>, usize), WireError> {
        self.bytes_at(self.read_pos())
    }

    /// Read an array into a position-indexed view.
    ///
    /// The array's bytes are copied once; arrays and maps nested inside it
    /// are then read in place.
    pub fn read_array(&mut self) -> Result<RpcArray, WireError> {
        self.read_with(Self::array_at)
    }

    /// Read a map into a name-indexed view, copying its bytes once.
    pub fn read_map(&mut self) -> Result<RpcMap, WireError> {
        self.read_with(Self::map_at)
    }

    /// Read any value.
    pub fn read_value(&mut self) -> Result<Value, WireError> {
        self.read_with(Self::value_at)
    }
}

/// Decode the array at `pos` as a view into `buf`. No bytes are copied.
pub(crate) fn shared_array_at(
    buf: &Arc<Stream>,
    pos: usize,
) -> Result<(RpcArray, usize), WireError> {
    if buf.opcode_at(pos)? == op::ARRAY_EMPTY {
        return Ok((RpcArray::new(), pos + 1));
    }
    let span = buf.container_at(pos, op::ARRAY_EMPTY)?;
    Ok((RpcArray::load(buf, span)?, span.end))
}

/// Decode the map at `pos` as a view into `buf`. Only the key names are
/// copied, into the index.
pub(crate) fn shared_map_at(buf: &Arc<Stream>, pos: usize) -> Result<(RpcMap, usize), WireError> {
    if buf.opcode_at(pos)? == op::MAP_EMPTY {
        return Ok((RpcMap::new(), pos + 1));
    }
    let span = buf.container_at(pos, op::MAP_EMPTY)?;
    Ok((RpcMap::load(buf, span)?, span.end))
}

/// Decode any value at `pos`, sharing `buf` with container views.
pub(crate) fn shared_value_at(
    buf: &Arc<Stream>,
    pos: usize,
) -> Result<(Value, usize), WireError> {
    match buf.opcode_at(pos)? {
        op::ARRAY_EMPTY..=op::ARRAY_LONG => {
            shared_array_at(buf, pos).map(|(v, n)| (Value::Array(v), n))
        }
        op::MAP_EMPTY..=op::MAP_LONG => shared_map_at(buf, pos).map(|(v, n)| (Value::Map(v), n)),
        _ => buf.value_at(pos),
    }
}

#[cfg(test)]
mod tests {
    use crate::error::WireError;
    use crate::protocol::{Stream, STREAM_POS_BODY};

    fn stream_of(bytes: &[u8]) -> Stream {
        let mut stream = Stream::new();
        stream.put_bytes(bytes);
        stream
    }

    #[test]
    fn test_read_i64_accepts_every_width() {
        let mut stream = stream_of(&[14, 53, 6, 0xFF, 0x7F, 7, 0, 0x80, 0, 0]);
        assert_eq!(stream.read_i64().unwrap(), -7);
        assert_eq!(stream.read_i64().unwrap(), 32);
        assert_eq!(stream.read_i64().unwrap(), 32767);
        assert_eq!(stream.read_i64().unwrap(), 32768);
        assert_eq!(stream.remaining(), 0);
    }

    #[test]
    fn test_read_type_mismatch_keeps_cursor() {
        let mut stream = stream_of(&[54]);
        assert_eq!(stream.read_i64(), Err(WireError::Opcode(54)));
        assert_eq!(stream.read_pos(), STREAM_POS_BODY);
        assert_eq!(stream.read_u64().unwrap(), 0);
    }

    #[test]
    fn test_read_truncated_value_keeps_cursor() {
        let mut stream = stream_of(&[9, 0x01]);
        assert_eq!(stream.read_u64(), Err(WireError::Overflow));
        assert_eq!(stream.read_pos(), STREAM_POS_BODY);
    }

    #[test]
    fn test_read_string_checks_sentinel() {
        let mut stream = stream_of(&[130, b'h', b'i', 1]);
        assert_eq!(stream.read_string(), Err(WireError::Sentinel));
        assert_eq!(stream.read_pos(), STREAM_POS_BODY);
    }

    #[test]
    fn test_read_string_checks_utf8() {
        let mut stream = stream_of(&[130, 0xC3, 0x28, 0]);
        assert_eq!(stream.read_string(), Err(WireError::Utf8));
    }

    #[test]
    fn test_read_string_across_frame_boundary() {
        let mut stream = Stream::new();
        stream.set_write_pos(500);
        stream.set_read_pos(500).unwrap();
        let text = "x".repeat(40);
        stream.write_string(&text).unwrap();
        assert_eq!(stream.read_string().unwrap(), text);
    }

    #[test]
    fn test_read_reserved_opcode_fails() {
        for code in [0u8, 12, 13] {
            let mut stream = stream_of(&[code]);
            assert_eq!(stream.read_value(), Err(WireError::Opcode(code)));
        }
    }

    #[test]
    fn test_read_array_rejects_oversized_length() {
        // claims 100 total bytes but only 7 are present
        let mut stream = stream_of(&[0x42, 100, 0, 0, 0, 2, 3]);
        assert_eq!(stream.read_array().unwrap_err(), WireError::Overflow);
        assert_eq!(stream.read_pos(), STREAM_POS_BODY);
    }

    #[test]
    fn test_read_empty_sequences() {
        let mut stream = stream_of(&[128, 192, 64, 96]);
        assert_eq!(stream.read_string().unwrap(), "");
        assert!(stream.read_bytes().unwrap().is_empty());
        assert!(stream.read_array().unwrap().is_empty());
        assert!(stream.read_map().unwrap().is_empty());
    }
}
