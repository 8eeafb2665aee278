//! Position-indexed array view.
//!
//! An [`RpcArray`] is a list of element start positions into a shared,
//! immutable [`Stream`]. Decoding records positions only; typed getters
//! decode one element on demand, and nested arrays and maps are views into
//! the same buffer.
//!
//! The first write to a view whose buffer is shared copies that view's
//! elements into a buffer of its own. Setting an element appends the new
//! encoding and repoints its position, so old bytes stay behind until the
//! view is dropped.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use crate::error::WireError;
use crate::protocol::{op, Stream};

use super::map::RpcMap;
use super::read::{shared_array_at, shared_map_at, shared_value_at, ContainerSpan};
use super::value::{Encode, Value};

/// Array of dynamically typed values.
///
/// # Example
///
/// ```
/// use echowire::codec::RpcArray;
///
/// let mut array = RpcArray::new();
/// array.push(&42i64).unwrap();
/// array.push("hi").unwrap();
/// array.set(0, &true).unwrap();
///
/// assert_eq!(array.get_bool(0), Some(true));
/// assert_eq!(array.get_str(1).as_deref(), Some("hi"));
/// assert_eq!(array.get_i64(1), None);
/// ```
#[derive(Clone)]
pub struct RpcArray {
    buf: Arc<Stream>,
    positions: Vec<usize>,
}

impl RpcArray {
    /// Create an empty array.
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Create an empty array with room for `n` element positions.
    pub fn with_capacity(n: usize) -> Self {
        Self {
            buf: Arc::new(Stream::new()),
            positions: Vec::with_capacity(n),
        }
    }

    /// Index the elements of an encoded container inside `buf`.
    pub(crate) fn load(buf: &Arc<Stream>, span: ContainerSpan) -> Result<Self, WireError> {
        let mut positions = Vec::with_capacity(span.count.min(span.end - span.items));
        let mut pos = span.items;
        for _ in 0..span.count {
            let skip = buf.skip_at(pos)?;
            if pos + skip > span.end {
                return Err(WireError::Overflow);
            }
            positions.push(pos);
            pos += skip;
        }
        if pos != span.end {
            return Err(WireError::TrailingBytes);
        }
        Ok(Self {
            buf: buf.clone(),
            positions,
        })
    }

    /// Number of elements.
    #[inline]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Whether the array has no elements.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Whether the view reads from a buffer it shares with other views.
    pub fn is_shared(&self) -> bool {
        Arc::strong_count(&self.buf) > 1
    }

    /// Writable buffer. A shared buffer is first replaced by a private copy
    /// of this view's elements.
    fn buf_mut(&mut self) -> Result<&mut Stream, WireError> {
        if Arc::get_mut(&mut self.buf).is_none() {
            let mut own = Stream::new();
            let mut positions = Vec::with_capacity(self.positions.len());
            for &pos in &self.positions {
                positions.push(own.write_pos());
                own.write_stream_at(&self.buf, pos)?;
            }
            self.buf = Arc::new(own);
            self.positions = positions;
        }
        Ok(Arc::make_mut(&mut self.buf))
    }

    /// Append an element.
    pub fn push<V: Encode + ?Sized>(&mut self, value: &V) -> Result<(), WireError> {
        let buf = self.buf_mut()?;
        let pos = buf.write_pos();
        buf.write(value)?;
        self.positions.push(pos);
        Ok(())
    }

    /// Replace the element at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Index`] if `index` is out of range.
    pub fn set<V: Encode + ?Sized>(&mut self, index: usize, value: &V) -> Result<(), WireError> {
        if index >= self.positions.len() {
            return Err(WireError::Index);
        }
        let buf = self.buf_mut()?;
        let pos = buf.write_pos();
        buf.write(value)?;
        self.positions[index] = pos;
        Ok(())
    }

    /// Append element `index` of `other` without decoding it.
    pub fn push_from(&mut self, other: &RpcArray, index: usize) -> Result<(), WireError> {
        let src = *other.positions.get(index).ok_or(WireError::Index)?;
        let buf = self.buf_mut()?;
        let pos = buf.write_pos();
        buf.write_stream_at(&other.buf, src)?;
        self.positions.push(pos);
        Ok(())
    }

    /// Remove all elements.
    pub fn clear(&mut self) {
        match Arc::get_mut(&mut self.buf) {
            Some(buf) => buf.reset(),
            None => self.buf = Arc::new(Stream::new()),
        }
        self.positions.clear();
    }

    #[inline]
    fn decode<'a, T>(
        &'a self,
        index: usize,
        decode: impl FnOnce(&'a Stream, usize) -> Result<(T, usize), WireError>,
    ) -> Option<T> {
        let pos = *self.positions.get(index)?;
        decode(&*self.buf, pos).ok().map(|(v, _)| v)
    }

    /// Whether element `index` is nil. `false` when out of range.
    pub fn is_nil(&self, index: usize) -> bool {
        self.decode(index, Stream::nil_at).is_some()
    }

    pub fn get_bool(&self, index: usize) -> Option<bool> {
        self.decode(index, Stream::bool_at)
    }

    pub fn get_i64(&self, index: usize) -> Option<i64> {
        self.decode(index, Stream::i64_at)
    }

    pub fn get_u64(&self, index: usize) -> Option<u64> {
        self.decode(index, Stream::u64_at)
    }

    pub fn get_f64(&self, index: usize) -> Option<f64> {
        self.decode(index, Stream::f64_at)
    }

    /// Borrow a string element (copied only when it straddles frames).
    pub fn get_str(&self, index: usize) -> Option<Cow<'_, str>> {
        self.decode(index, Stream::str_at)
    }

    /// Borrow a bytes element (copied only when it straddles frames).
    pub fn get_bytes(&self, index: usize) -> Option<Cow<'_, [u8]>> {
        self.decode(index, Stream::bytes_at)
    }

    /// View of a nested array. Shares this view's buffer.
    pub fn get_array(&self, index: usize) -> Option<RpcArray> {
        let pos = *self.positions.get(index)?;
        shared_array_at(&self.buf, pos).ok().map(|(v, _)| v)
    }

    /// View of a nested map. Shares this view's buffer.
    pub fn get_map(&self, index: usize) -> Option<RpcMap> {
        let pos = *self.positions.get(index)?;
        shared_map_at(&self.buf, pos).ok().map(|(v, _)| v)
    }

    /// Decode element `index` whatever its type.
    pub fn get(&self, index: usize) -> Option<Value> {
        let pos = *self.positions.get(index)?;
        shared_value_at(&self.buf, pos).ok().map(|(v, _)| v)
    }

    /// Decode every element in order.
    pub fn values(&self) -> impl Iterator<Item = Value> + '_ {
        (0..self.len()).filter_map(move |i| self.get(i))
    }

    /// Raw encoding of element `index`.
    fn raw(&self, index: usize) -> Option<Cow<'_, [u8]>> {
        let pos = *self.positions.get(index)?;
        let skip = self.buf.skip_at(pos).ok()?;
        self.buf.slice_at(pos, skip).ok()
    }
}

impl Encode for RpcArray {
    fn encode(&self, stream: &mut Stream) -> Result<(), WireError> {
        stream.write_container(op::ARRAY_EMPTY, self.positions.len(), |out| {
            for &pos in &self.positions {
                out.write_stream_at(&self.buf, pos)?;
            }
            Ok(())
        })
    }
}

impl Stream {
    /// Write an array.
    pub fn write_array(&mut self, v: &RpcArray) -> Result<(), WireError> {
        self.write(v)
    }
}

impl Default for RpcArray {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for RpcArray {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && (0..self.len()).all(|i| self.raw(i) == other.raw(i))
    }
}

impl fmt::Debug for RpcArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.values()).finish()
    }
}

impl RpcArray {
    /// Collect values into an array, stopping at the first one that cannot
    /// be encoded.
    ///
    /// ```
    /// use echowire::codec::RpcArray;
    ///
    /// let array = RpcArray::try_from_iter(["a", "b"]).unwrap();
    /// assert_eq!(array.len(), 2);
    /// ```
    pub fn try_from_iter<V, I>(iter: I) -> Result<Self, WireError>
    where
        V: Into<Value>,
        I: IntoIterator<Item = V>,
    {
        let mut array = RpcArray::new();
        for v in iter {
            array.push(&v.into())?;
        }
        Ok(array)
    }
}
