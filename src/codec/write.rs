//! Typed writers.
//!
//! Every writer picks the tightest opcode for its value. Encoded bytes are
//! staged in a small stack buffer and appended with one [`Stream::put_bytes`],
//! which copies straight into the current frame when the bytes fit and
//! falls back to the cross-frame loop otherwise.

use crate::error::WireError;
use crate::protocol::{op, Stream, CONTAINER_INLINE_COUNT, INLINE_LEN};

use super::value::Encode;

impl Stream {
    /// Write nil.
    #[inline]
    pub fn write_nil(&mut self) {
        self.put_byte(op::NIL);
    }

    /// Write a bool.
    #[inline]
    pub fn write_bool(&mut self, v: bool) {
        self.put_byte(if v { op::TRUE } else { op::FALSE });
    }

    /// Write a float. `0.0` takes one byte.
    #[inline]
    pub fn write_f64(&mut self, v: f64) {
        if v == 0.0 && v.is_sign_positive() {
            self.put_byte(op::F64_ZERO);
            return;
        }
        let mut buf = [0u8; 9];
        buf[0] = op::F64;
        buf[1..].copy_from_slice(&v.to_le_bytes());
        self.put_bytes(&buf);
    }

    /// Write a signed integer.
    ///
    /// ```
    /// use echowire::protocol::Stream;
    ///
    /// let mut stream = Stream::new();
    /// stream.write_i64(32767);
    /// assert_eq!(&stream.to_bytes()[16..], &[6, 0xFF, 0x7F]);
    /// ```
    pub fn write_i64(&mut self, v: i64) {
        let mut buf = [0u8; 9];
        let len = if (op::SMALL_I64_MIN..=op::SMALL_I64_MAX).contains(&v) {
            buf[0] = (v + op::SMALL_I64_BIAS) as u8;
            1
        } else if let Ok(v) = i16::try_from(v) {
            buf[0] = op::I16;
            buf[1..3].copy_from_slice(&v.to_le_bytes());
            3
        } else if let Ok(v) = i32::try_from(v) {
            buf[0] = op::I32;
            buf[1..5].copy_from_slice(&v.to_le_bytes());
            5
        } else {
            buf[0] = op::I64;
            buf[1..9].copy_from_slice(&v.to_le_bytes());
            9
        };
        self.put_bytes(&buf[..len]);
    }

    /// Write an unsigned integer.
    pub fn write_u64(&mut self, v: u64) {
        let mut buf = [0u8; 9];
        let len = if v <= op::SMALL_U64_MAX {
            buf[0] = op::SMALL_U64_FIRST + v as u8;
            1
        } else if let Ok(v) = u16::try_from(v) {
            buf[0] = op::U16;
            buf[1..3].copy_from_slice(&v.to_le_bytes());
            3
        } else if let Ok(v) = u32::try_from(v) {
            buf[0] = op::U32;
            buf[1..5].copy_from_slice(&v.to_le_bytes());
            5
        } else {
            buf[0] = op::U64;
            buf[1..9].copy_from_slice(&v.to_le_bytes());
            9
        };
        self.put_bytes(&buf[..len]);
    }

    /// Write a string followed by its zero sentinel.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Overflow`] for strings longer than `u32::MAX`.
    pub fn write_string(&mut self, v: &str) -> Result<(), WireError> {
        let bytes = v.as_bytes();
        match bytes.len() {
            0 => self.put_byte(op::STRING_EMPTY),
            len if len <= INLINE_LEN => {
                self.put_byte(op::STRING_EMPTY + len as u8);
                self.put_bytes(bytes);
                self.put_byte(0);
            }
            len => {
                let len = u32::try_from(len).map_err(|_| WireError::Overflow)?;
                self.put_length_prefix(op::STRING_LONG, len);
                self.put_bytes(bytes);
                self.put_byte(0);
            }
        }
        Ok(())
    }

    /// Write a byte array.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Overflow`] for payloads longer than `u32::MAX`.
    pub fn write_bytes(&mut self, v: &[u8]) -> Result<(), WireError> {
        match v.len() {
            0 => self.put_byte(op::BYTES_EMPTY),
            len if len <= INLINE_LEN => {
                self.put_byte(op::BYTES_EMPTY + len as u8);
                self.put_bytes(v);
            }
            len => {
                let len = u32::try_from(len).map_err(|_| WireError::Overflow)?;
                self.put_length_prefix(op::BYTES_LONG, len);
                self.put_bytes(v);
            }
        }
        Ok(())
    }

    /// Write any encodable value.
    ///
    /// On failure the write cursor is restored, so a partially encoded
    /// container never stays on the stream.
    pub fn write<V: Encode + ?Sized>(&mut self, v: &V) -> Result<(), WireError> {
        let start = self.write_pos();
        let result = v.encode(self);
        if result.is_err() {
            self.set_write_pos_fast(start);
        }
        result
    }

    #[inline]
    fn put_length_prefix(&mut self, code: u8, len: u32) {
        let mut buf = [0u8; 5];
        buf[0] = code;
        buf[1..].copy_from_slice(&len.to_le_bytes());
        self.put_bytes(&buf);
    }

    /// Write a container header, run `body`, then backpatch the total length.
    ///
    /// `empty` is the container's empty opcode (`64` for arrays, `96` for
    /// maps); inline counts add to it and `empty + 31` marks the long form.
    pub(crate) fn write_container<F>(
        &mut self,
        empty: u8,
        count: usize,
        body: F,
    ) -> Result<(), WireError>
    where
        F: FnOnce(&mut Stream) -> Result<(), WireError>,
    {
        if count == 0 {
            self.put_byte(empty);
            return Ok(());
        }
        let start = self.write_pos();
        if count <= CONTAINER_INLINE_COUNT {
            self.put_length_prefix(empty + count as u8, 0);
        } else {
            let count = u32::try_from(count).map_err(|_| WireError::Overflow)?;
            self.put_length_prefix(empty + CONTAINER_INLINE_COUNT as u8 + 1, 0);
            self.put_bytes(&count.to_le_bytes());
        }

        if let Err(e) = body(self) {
            self.set_write_pos_fast(start);
            return Err(e);
        }

        match u32::try_from(self.write_pos() - start) {
            Ok(total) => {
                self.put_u32_at(start + 1, total);
                Ok(())
            }
            Err(_) => {
                self.set_write_pos_fast(start);
                Err(WireError::Overflow)
            }
        }
    }
}
