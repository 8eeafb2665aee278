//! Segmented byte stream with independent read and write cursors.
//!
//! A [`Stream`] is a list of pooled 512-byte frames. Positions are absolute
//! byte offsets; the frame of position `p` is `p >> 9` and its offset inside
//! the frame is `p & 511`.
//!
//! ```text
//! frame 0                              frame 1            frame N
//! ┌───┬──────────────┬───────────────┐ ┌────────────────┐ ┌──────────┐
//! │ 1 │ header (16)  │ body ...      │ │ body ...       │ │ body ... │
//! └───┴──────────────┴───────────────┘ └────────────────┘ └──────────┘
//!       ▲ 1            ▲ 17                  ▲ read_pos       ▲ write_pos
//! ```
//!
//! Typed readers and writers live in the [`codec`](crate::codec) module; this
//! file handles raw bytes, cursors, skipping, and copying values between streams.

use std::borrow::Cow;
use std::fmt;

use bytes::{Bytes, BytesMut};

use super::frame_pool::{
    acquire_frame, acquire_stream_frames, release_frames, release_stream_frames, Frame,
};
use super::wire_format::{
    op, Header, SkipRule, FRAME_MASK, FRAME_SHIFT, FRAME_SIZE, HEADER_SIZE, SKIP_TABLE,
    STREAM_POS_BODY, STREAM_POS_HEADER, STREAM_SENTINEL,
};
use crate::error::WireError;

/// Pooled, segmented read/write buffer carrying one request or reply.
///
/// Dropping a `Stream` returns its frames (and the stream body itself) to
/// the process-wide pools.
pub struct Stream {
    frames: Vec<Frame>,
    read_pos: usize,
    write_pos: usize,
}

impl Stream {
    /// Acquire an empty stream from the pool.
    ///
    /// The header is zeroed and both cursors sit at the first body byte.
    pub fn new() -> Self {
        let mut frames = acquire_stream_frames();
        let first = &mut frames[0];
        first[0] = STREAM_SENTINEL;
        first[STREAM_POS_HEADER..STREAM_POS_BODY].fill(0);
        Self {
            frames,
            read_pos: STREAM_POS_BODY,
            write_pos: STREAM_POS_BODY,
        }
    }

    /// Build a stream from one transport message (`header ‖ body`).
    ///
    /// The read cursor is placed at the first body byte.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Overflow`] if `data` is shorter than the header.
    pub fn from_frame(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < HEADER_SIZE {
            return Err(WireError::Overflow);
        }
        let mut stream = Self::new();
        stream.write_pos = STREAM_POS_HEADER;
        stream.put_bytes(data);
        stream.read_pos = STREAM_POS_BODY;
        Ok(stream)
    }

    /// Encode the stream as one transport message (`header ‖ body`).
    pub fn to_bytes(&self) -> Bytes {
        let len = self.write_pos.saturating_sub(STREAM_POS_HEADER);
        let mut out = BytesMut::with_capacity(len);
        self.for_each_chunk(STREAM_POS_HEADER, len, |chunk| out.extend_from_slice(chunk));
        out.freeze()
    }

    // ------------------------------------------------------------------
    // Header
    // ------------------------------------------------------------------

    /// Read the 16-byte header.
    pub fn header(&self) -> Header {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes.copy_from_slice(&self.frames[0][STREAM_POS_HEADER..STREAM_POS_BODY]);
        Header::from_bytes(bytes)
    }

    /// Overwrite the 16-byte header. Cursors are not touched.
    pub fn set_header(&mut self, header: &Header) {
        self.frames[0][STREAM_POS_HEADER..STREAM_POS_BODY].copy_from_slice(header.as_bytes());
    }

    // ------------------------------------------------------------------
    // Cursors
    // ------------------------------------------------------------------

    /// Current write position.
    #[inline]
    pub fn write_pos(&self) -> usize {
        self.write_pos
    }

    /// Move the write cursor, acquiring frames if `pos` is past the end.
    ///
    /// The read cursor is pulled back if it would pass the new write cursor.
    pub fn set_write_pos(&mut self, pos: usize) {
        while self.capacity() < pos {
            self.frames.push(acquire_frame());
        }
        self.write_pos = pos;
        if self.read_pos > pos {
            self.read_pos = pos;
        }
    }

    /// Move the write cursor without growing the stream.
    ///
    /// The caller guarantees `pos` lies inside already acquired frames and
    /// is not below the read cursor.
    #[inline]
    pub fn set_write_pos_fast(&mut self, pos: usize) {
        debug_assert!(pos <= self.capacity());
        debug_assert!(pos >= self.read_pos);
        self.write_pos = pos;
    }

    /// Current read position.
    #[inline]
    pub fn read_pos(&self) -> usize {
        self.read_pos
    }

    /// Move the read cursor.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Overflow`] if `pos` is past the write cursor.
    pub fn set_read_pos(&mut self, pos: usize) -> Result<(), WireError> {
        if pos > self.write_pos {
            return Err(WireError::Overflow);
        }
        self.read_pos = pos;
        Ok(())
    }

    /// Move the read cursor without checking against the write cursor.
    #[inline]
    pub fn set_read_pos_fast(&mut self, pos: usize) {
        debug_assert!(pos <= self.write_pos);
        self.read_pos = pos;
    }

    /// Number of unread bytes.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.write_pos - self.read_pos
    }

    /// Whether nothing has been written past the header.
    #[inline]
    pub fn is_body_empty(&self) -> bool {
        self.write_pos <= STREAM_POS_BODY
    }

    /// Bytes covered by acquired frames.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.frames.len() << FRAME_SHIFT
    }

    /// Number of acquired frames.
    #[inline]
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Return every frame but frame 0 to the pool and rewind both cursors
    /// to the first body byte. The header is preserved.
    pub fn reset(&mut self) {
        if self.frames.len() > 1 {
            release_frames(self.frames.drain(1..));
        }
        self.frames[0][0] = STREAM_SENTINEL;
        self.read_pos = STREAM_POS_BODY;
        self.write_pos = STREAM_POS_BODY;
    }

    /// Reset and hand the stream back to the pool.
    #[inline]
    pub fn release(self) {
        drop(self);
    }

    // ------------------------------------------------------------------
    // Raw writes
    // ------------------------------------------------------------------

    /// Whether `n` bytes fit in the frame under the write cursor.
    #[inline]
    pub(crate) fn has_bytes_in_current_frame(&self, n: usize) -> bool {
        (self.write_pos >> FRAME_SHIFT) < self.frames.len()
            && (self.write_pos & FRAME_MASK) + n <= FRAME_SIZE
    }

    /// Append one byte at the write cursor.
    #[inline]
    pub fn put_byte(&mut self, b: u8) {
        if self.has_bytes_in_current_frame(1) {
            self.frames[self.write_pos >> FRAME_SHIFT][self.write_pos & FRAME_MASK] = b;
            self.write_pos += 1;
        } else {
            self.put_bytes_slow(&[b]);
        }
    }

    /// Append raw bytes at the write cursor.
    #[inline]
    pub fn put_bytes(&mut self, buf: &[u8]) {
        if self.has_bytes_in_current_frame(buf.len()) {
            let off = self.write_pos & FRAME_MASK;
            self.frames[self.write_pos >> FRAME_SHIFT][off..off + buf.len()].copy_from_slice(buf);
            self.write_pos += buf.len();
        } else {
            self.put_bytes_slow(buf);
        }
    }

    /// Append the UTF-8 bytes of `s` (no opcode, no sentinel).
    #[inline]
    pub fn put_string(&mut self, s: &str) {
        self.put_bytes(s.as_bytes());
    }

    /// Cross-frame copy loop.
    fn put_bytes_slow(&mut self, mut buf: &[u8]) {
        while !buf.is_empty() {
            let index = self.write_pos >> FRAME_SHIFT;
            if index == self.frames.len() {
                self.frames.push(acquire_frame());
            }
            let off = self.write_pos & FRAME_MASK;
            let n = (FRAME_SIZE - off).min(buf.len());
            self.frames[index][off..off + n].copy_from_slice(&buf[..n]);
            self.write_pos += n;
            buf = &buf[n..];
        }
    }

    /// Overwrite a little-endian u32 at an already written position.
    pub(crate) fn put_u32_at(&mut self, pos: usize, v: u32) {
        debug_assert!(pos + 4 <= self.write_pos);
        for (i, b) in v.to_le_bytes().into_iter().enumerate() {
            let p = pos + i;
            self.frames[p >> FRAME_SHIFT][p & FRAME_MASK] = b;
        }
    }

    // ------------------------------------------------------------------
    // Raw reads
    // ------------------------------------------------------------------

    #[inline]
    pub(crate) fn byte_at(&self, pos: usize) -> u8 {
        self.frames[pos >> FRAME_SHIFT][pos & FRAME_MASK]
    }

    /// Opcode at `pos`, if `pos` is readable.
    #[inline]
    pub(crate) fn opcode_at(&self, pos: usize) -> Result<u8, WireError> {
        if pos >= self.write_pos {
            return Err(WireError::Overflow);
        }
        Ok(self.byte_at(pos))
    }

    /// Fail unless `len` bytes starting at `pos` are readable.
    #[inline]
    pub(crate) fn ensure_readable(&self, pos: usize, len: usize) -> Result<(), WireError> {
        match pos.checked_add(len) {
            Some(end) if end <= self.write_pos => Ok(()),
            _ => Err(WireError::Overflow),
        }
    }

    /// Read `N` bytes at `pos`.
    #[inline]
    pub(crate) fn fixed_at<const N: usize>(&self, pos: usize) -> Result<[u8; N], WireError> {
        self.ensure_readable(pos, N)?;
        let mut out = [0u8; N];
        let off = pos & FRAME_MASK;
        if off + N <= FRAME_SIZE {
            out.copy_from_slice(&self.frames[pos >> FRAME_SHIFT][off..off + N]);
        } else {
            self.copy_out(pos, &mut out);
        }
        Ok(out)
    }

    /// Little-endian u32 at `pos`.
    #[inline]
    pub(crate) fn u32_at(&self, pos: usize) -> Result<u32, WireError> {
        self.fixed_at::<4>(pos).map(u32::from_le_bytes)
    }

    fn copy_out(&self, pos: usize, out: &mut [u8]) {
        let mut written = 0;
        self.for_each_chunk(pos, out.len(), |chunk| {
            out[written..written + chunk.len()].copy_from_slice(chunk);
            written += chunk.len();
        });
    }

    /// Visit `len` bytes starting at `pos` one frame-sized chunk at a time.
    fn for_each_chunk(&self, mut pos: usize, len: usize, mut f: impl FnMut(&[u8])) {
        let end = pos + len;
        while pos < end {
            let off = pos & FRAME_MASK;
            let n = (FRAME_SIZE - off).min(end - pos);
            f(&self.frames[pos >> FRAME_SHIFT][off..off + n]);
            pos += n;
        }
    }

    /// Borrow `len` bytes at `pos` when they sit in one frame, copy otherwise.
    pub(crate) fn slice_at(&self, pos: usize, len: usize) -> Result<Cow<'_, [u8]>, WireError> {
        self.ensure_readable(pos, len)?;
        let off = pos & FRAME_MASK;
        if off + len <= FRAME_SIZE {
            return Ok(Cow::Borrowed(
                &self.frames[pos >> FRAME_SHIFT][off..off + len],
            ));
        }
        let mut out = vec![0u8; len];
        self.copy_out(pos, &mut out);
        Ok(Cow::Owned(out))
    }

    /// Read up to `buf.len()` unread bytes, advancing the read cursor.
    pub fn get_bytes(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.remaining());
        self.copy_out(self.read_pos, &mut buf[..n]);
        self.read_pos += n;
        n
    }

    /// Opcode under the read cursor without moving it.
    #[inline]
    pub fn peek_byte(&self) -> Option<u8> {
        self.opcode_at(self.read_pos).ok()
    }

    // ------------------------------------------------------------------
    // Skipping
    // ------------------------------------------------------------------

    /// Size of the value starting at `pos`, from the opcode skip table.
    ///
    /// Only the opcode (and the 4-byte length for variable-size values) must
    /// be readable; the value itself may extend past the write cursor.
    pub(crate) fn skip_at(&self, pos: usize) -> Result<usize, WireError> {
        let code = self.opcode_at(pos)?;
        match SKIP_TABLE[code as usize] {
            SkipRule::Invalid => Err(WireError::Opcode(code)),
            SkipRule::Fixed(n) => Ok(n as usize),
            SkipRule::Prefixed(extra) => {
                let len = self.u32_at(pos + 1)? as usize;
                let skip = len + extra as usize;
                // a container must at least cover its own framing
                let min = match code {
                    op::ARRAY_LONG | op::MAP_LONG => 9,
                    _ => 5,
                };
                if skip < min {
                    return Err(WireError::Overflow);
                }
                Ok(skip)
            }
        }
    }

    /// Number of bytes the value under the read cursor occupies.
    ///
    /// Returns `None` for a reserved opcode or when nothing is readable.
    #[inline]
    pub fn peek_skip(&self) -> Option<usize> {
        self.skip_at(self.read_pos).ok()
    }

    /// Advance past one value if it lies entirely before `limit`.
    ///
    /// Returns the position the value started at. On failure the cursor
    /// is left unchanged.
    pub fn read_skip_item(&mut self, limit: usize) -> Option<usize> {
        let limit = limit.min(self.write_pos);
        let start = self.read_pos;
        let skip = self.skip_at(start).ok()?;
        if start + skip > limit {
            return None;
        }
        self.read_pos = start + skip;
        Some(start)
    }

    // ------------------------------------------------------------------
    // Stream to stream copies
    // ------------------------------------------------------------------

    /// Copy `len` raw bytes of `src` starting at `pos` to the write cursor.
    pub(crate) fn put_stream_range(&mut self, src: &Stream, pos: usize, len: usize) {
        src.for_each_chunk(pos, len, |chunk| self.put_bytes(chunk));
    }

    /// Append the one value of `src` starting at `pos`.
    ///
    /// Returns the position just past the copied value in `src`. Nothing is
    /// written on failure.
    pub(crate) fn write_stream_at(&mut self, src: &Stream, pos: usize) -> Result<usize, WireError> {
        let skip = src.skip_at(pos)?;
        src.ensure_readable(pos, skip)?;
        self.put_stream_range(src, pos, skip);
        Ok(pos + skip)
    }

    /// Append exactly one value from the read cursor of `src`.
    ///
    /// On success the read cursor of `src` moves past the value. On failure
    /// neither stream changes.
    pub fn write_stream_next(&mut self, src: &mut Stream) -> Result<(), WireError> {
        let next = self.write_stream_at(src, src.read_pos)?;
        src.read_pos = next;
        Ok(())
    }
}

impl Default for Stream {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Stream {
    fn clone(&self) -> Self {
        let mut copy = Stream::new();
        copy.write_pos = 0;
        copy.put_stream_range(self, 0, self.write_pos);
        copy.read_pos = self.read_pos;
        copy
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if self.frames.is_empty() {
            return;
        }
        self.reset();
        release_stream_frames(std::mem::take(&mut self.frames));
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("frames", &self.frames.len())
            .field("read_pos", &self.read_pos)
            .field("write_pos", &self.write_pos)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_stream_layout() {
        let stream = Stream::new();
        assert_eq!(stream.read_pos(), STREAM_POS_BODY);
        assert_eq!(stream.write_pos(), STREAM_POS_BODY);
        assert_eq!(stream.byte_at(0), STREAM_SENTINEL);
        assert_eq!(stream.header(), Header::new());
        assert!(stream.is_body_empty());
    }

    #[test]
    fn test_put_bytes_across_frames() {
        let mut stream = Stream::new();
        let data: Vec<u8> = (0..1500u32).map(|i| (i % 251) as u8).collect();
        stream.put_bytes(&data);

        assert_eq!(stream.write_pos(), STREAM_POS_BODY + data.len());
        assert_eq!(stream.frame_count(), 4);

        let mut out = vec![0u8; data.len()];
        assert_eq!(stream.get_bytes(&mut out), data.len());
        assert_eq!(out, data);
        assert_eq!(stream.remaining(), 0);
    }

    #[test]
    fn test_set_read_pos_past_write_fails() {
        let mut stream = Stream::new();
        stream.put_bytes(b"abc");
        assert!(stream.set_read_pos(STREAM_POS_BODY + 3).is_ok());
        assert_eq!(
            stream.set_read_pos(STREAM_POS_BODY + 4),
            Err(WireError::Overflow)
        );
        assert_eq!(stream.read_pos(), STREAM_POS_BODY + 3);
    }

    #[test]
    fn test_set_write_pos_grows_frames() {
        let mut stream = Stream::new();
        stream.set_write_pos(1100);
        assert_eq!(stream.write_pos(), 1100);
        assert!(stream.capacity() >= 1100);
        stream.put_byte(7);
        assert_eq!(stream.byte_at(1100), 7);
    }

    #[test]
    fn test_set_write_pos_pulls_read_cursor_back() {
        let mut stream = Stream::new();
        stream.put_bytes(&[1, 1, 1, 1]);
        stream.set_read_pos(STREAM_POS_BODY + 4).unwrap();
        stream.set_write_pos(STREAM_POS_BODY + 2);
        assert_eq!(stream.read_pos(), STREAM_POS_BODY + 2);
    }

    #[test]
    fn test_reset_keeps_header_and_first_frame() {
        let mut stream = Stream::new();
        let mut header = Header::new();
        header.set_router_id(99);
        stream.set_header(&header);
        stream.put_bytes(&[0xAA; 2000]);
        assert!(stream.frame_count() > 1);

        stream.reset();
        assert_eq!(stream.frame_count(), 1);
        assert_eq!(stream.write_pos(), STREAM_POS_BODY);
        assert_eq!(stream.read_pos(), STREAM_POS_BODY);
        assert_eq!(stream.byte_at(0), STREAM_SENTINEL);
        assert_eq!(stream.header().router_id(), 99);
    }

    #[test]
    fn test_frame_round_trip() {
        let mut stream = Stream::new();
        let mut header = Header::new();
        header.set_client_callback_id(5);
        stream.set_header(&header);
        stream.put_bytes(b"payload");

        let bytes = stream.to_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE + 7);

        let decoded = Stream::from_frame(&bytes).unwrap();
        assert_eq!(decoded.header().client_callback_id(), 5);
        assert_eq!(decoded.read_pos(), STREAM_POS_BODY);
        assert_eq!(decoded.write_pos(), STREAM_POS_BODY + 7);
    }

    #[test]
    fn test_from_frame_too_short() {
        assert!(Stream::from_frame(&[0u8; 15]).is_err());
    }

    #[test]
    fn test_peek_skip_fixed_and_prefixed() {
        let mut stream = Stream::new();
        stream.put_bytes(&[op::I16, 0xFF, 0x7F]);
        assert_eq!(stream.peek_skip(), Some(3));

        let mut stream = Stream::new();
        // long string of 63 bytes: opcode + len + bytes + sentinel
        stream.put_bytes(&[op::STRING_LONG, 63, 0, 0, 0]);
        assert_eq!(stream.peek_skip(), Some(63 + 6));
    }

    #[test]
    fn test_peek_skip_reserved_opcode() {
        let mut stream = Stream::new();
        stream.put_bytes(&[12]);
        assert_eq!(stream.peek_skip(), None);
        assert_eq!(Stream::new().peek_skip(), None);
    }

    #[test]
    fn test_read_skip_item_respects_limit() {
        let mut stream = Stream::new();
        stream.put_bytes(&[op::I32, 1, 2, 3, 4, op::NIL]);

        assert_eq!(stream.read_skip_item(STREAM_POS_BODY + 4), None);
        assert_eq!(stream.read_pos(), STREAM_POS_BODY);

        assert_eq!(stream.read_skip_item(usize::MAX), Some(STREAM_POS_BODY));
        assert_eq!(stream.read_pos(), STREAM_POS_BODY + 5);
        assert_eq!(stream.read_skip_item(usize::MAX), Some(STREAM_POS_BODY + 5));
        assert_eq!(stream.read_skip_item(usize::MAX), None);
    }

    #[test]
    fn test_write_stream_next_copies_one_value() {
        let mut src = Stream::new();
        src.put_bytes(&[op::U16, 0x34, 0x12, op::TRUE]);

        let mut dst = Stream::new();
        dst.write_stream_next(&mut src).unwrap();
        assert_eq!(dst.write_pos(), STREAM_POS_BODY + 3);
        assert_eq!(src.read_pos(), STREAM_POS_BODY + 3);
        assert_eq!(dst.byte_at(STREAM_POS_BODY + 1), 0x34);
    }

    #[test]
    fn test_write_stream_next_truncated_is_atomic() {
        let mut src = Stream::new();
        src.put_bytes(&[op::I64, 1, 2, 3]);

        let mut dst = Stream::new();
        assert_eq!(dst.write_stream_next(&mut src), Err(WireError::Overflow));
        assert_eq!(dst.write_pos(), STREAM_POS_BODY);
        assert_eq!(src.read_pos(), STREAM_POS_BODY);
    }

    #[test]
    fn test_clone_copies_content_and_cursors() {
        let mut stream = Stream::new();
        stream.put_bytes(&[9u8; 700]);
        stream.set_read_pos(100).unwrap();

        let copy = stream.clone();
        assert_eq!(copy.write_pos(), stream.write_pos());
        assert_eq!(copy.read_pos(), 100);
        assert_eq!(copy.byte_at(600), 9);
    }

    #[test]
    fn test_put_u32_at_across_frame_boundary() {
        let mut stream = Stream::new();
        stream.set_write_pos(520);
        stream.put_u32_at(510, 0x0403_0201);
        assert_eq!(stream.u32_at(510).unwrap(), 0x0403_0201);
        assert_eq!(stream.byte_at(512), 3);
    }
}
