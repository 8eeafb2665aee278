//! Name-indexed map view.
//!
//! Like [`RpcArray`](super::RpcArray), an [`RpcMap`] is a view over a shared
//! buffer of encoded values; it indexes them by key instead of by position,
//! and copies its values out only on the first write to a shared buffer.
//!
//! Maps with up to 16 keys keep a linear list of `(name, position)` pairs;
//! the 17th insertion switches to a `HashMap`, and deleting back down to 16
//! switches back.
//!
//! When decoded bytes repeat a key, the first occurrence wins.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::WireError;
use crate::protocol::{op, Stream};

use super::array::RpcArray;
use super::read::{shared_array_at, shared_map_at, shared_value_at, ContainerSpan};
use super::value::{Encode, Value};

/// Maximum number of entries kept in the linear list.
pub const SMALL_MAP_CAPACITY: usize = 16;

#[derive(Clone)]
enum Index {
    Small(Vec<(String, usize)>),
    Large(HashMap<String, usize>),
}

impl Index {
    fn len(&self) -> usize {
        match self {
            Index::Small(list) => list.len(),
            Index::Large(map) => map.len(),
        }
    }

    fn get(&self, name: &str) -> Option<usize> {
        match self {
            Index::Small(list) => list.iter().find(|(k, _)| k == name).map(|(_, p)| *p),
            Index::Large(map) => map.get(name).copied(),
        }
    }

    /// Promote a full list to a hash map, keeping first occurrences.
    fn promote(list: &mut Vec<(String, usize)>) -> HashMap<String, usize> {
        let mut map = HashMap::with_capacity(SMALL_MAP_CAPACITY * 2);
        for (name, pos) in list.drain(..) {
            map.entry(name).or_insert(pos);
        }
        map
    }

    /// Add an entry read from the wire; existing names are kept.
    fn append(&mut self, name: String, pos: usize) {
        match self {
            Index::Small(list) if list.len() < SMALL_MAP_CAPACITY => list.push((name, pos)),
            Index::Small(list) => {
                let mut map = Self::promote(list);
                map.entry(name).or_insert(pos);
                *self = Index::Large(map);
            }
            Index::Large(map) => {
                map.entry(name).or_insert(pos);
            }
        }
    }

    /// Insert or overwrite an entry.
    fn insert(&mut self, name: &str, pos: usize) {
        match self {
            Index::Small(list) => {
                if let Some(i) = list.iter().position(|(k, _)| k == name) {
                    list[i].1 = pos;
                } else if list.len() < SMALL_MAP_CAPACITY {
                    list.push((name.to_owned(), pos));
                } else {
                    let mut map = Self::promote(list);
                    map.insert(name.to_owned(), pos);
                    *self = Index::Large(map);
                }
            }
            Index::Large(map) => {
                map.insert(name.to_owned(), pos);
            }
        }
    }

    /// Rewrite every value position, leaving the index untouched on failure.
    fn relocate(
        &self,
        mut f: impl FnMut(usize) -> Result<usize, WireError>,
    ) -> Result<Self, WireError> {
        let mut index = self.clone();
        match &mut index {
            Index::Small(list) => {
                for (_, pos) in list.iter_mut() {
                    *pos = f(*pos)?;
                }
            }
            Index::Large(map) => {
                for pos in map.values_mut() {
                    *pos = f(*pos)?;
                }
            }
        }
        Ok(index)
    }

    fn remove(&mut self, name: &str) -> bool {
        match self {
            Index::Small(list) => match list.iter().position(|(k, _)| k == name) {
                Some(i) => {
                    list.swap_remove(i);
                    true
                }
                None => false,
            },
            Index::Large(map) => {
                let removed = map.remove(name).is_some();
                if map.len() <= SMALL_MAP_CAPACITY {
                    *self = Index::Small(map.drain().collect());
                }
                removed
            }
        }
    }
}

/// Map from string keys to dynamically typed values.
///
/// ```
/// use echowire::codec::RpcMap;
///
/// let mut map = RpcMap::new();
/// map.set("name", "echo").unwrap();
/// map.set("port", &8080u64).unwrap();
///
/// assert_eq!(map.get_str("name").as_deref(), Some("echo"));
/// assert_eq!(map.get_u64("port"), Some(8080));
/// assert!(map.delete("port"));
/// assert_eq!(map.len(), 1);
/// ```
#[derive(Clone)]
pub struct RpcMap {
    buf: Arc<Stream>,
    index: Index,
}

impl RpcMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self {
            buf: Arc::new(Stream::new()),
            index: Index::Small(Vec::new()),
        }
    }

    /// Index the entries of an encoded container inside `buf`.
    pub(crate) fn load(buf: &Arc<Stream>, span: ContainerSpan) -> Result<Self, WireError> {
        let mut index = Index::Small(Vec::with_capacity(span.count.min(SMALL_MAP_CAPACITY)));
        let mut pos = span.items;
        for _ in 0..span.count {
            let (name, value_pos) = buf.str_at(pos)?;
            let skip = buf.skip_at(value_pos)?;
            if value_pos + skip > span.end {
                return Err(WireError::Overflow);
            }
            index.append(name.into_owned(), value_pos);
            pos = value_pos + skip;
        }
        if pos != span.end {
            return Err(WireError::TrailingBytes);
        }
        Ok(Self {
            buf: buf.clone(),
            index,
        })
    }

    /// Whether the view reads from a buffer it shares with other views.
    pub fn is_shared(&self) -> bool {
        Arc::strong_count(&self.buf) > 1
    }

    /// Writable buffer. A shared buffer is first replaced by a private copy
    /// of this map's values.
    fn buf_mut(&mut self) -> Result<&mut Stream, WireError> {
        if Arc::get_mut(&mut self.buf).is_none() {
            let mut own = Stream::new();
            let index = self.index.relocate(|pos| {
                let at = own.write_pos();
                own.write_stream_at(&self.buf, pos)?;
                Ok(at)
            })?;
            self.buf = Arc::new(own);
            self.index = index;
        }
        Ok(Arc::make_mut(&mut self.buf))
    }

    /// Number of entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `name` is present.
    pub fn contains_key(&self, name: &str) -> bool {
        self.index.get(name).is_some()
    }

    /// Entry names, in list order for small maps and arbitrary order otherwise.
    pub fn keys(&self) -> Vec<&str> {
        match &self.index {
            Index::Small(list) => list.iter().map(|(k, _)| k.as_str()).collect(),
            Index::Large(map) => map.keys().map(String::as_str).collect(),
        }
    }

    /// Insert or overwrite an entry.
    pub fn set<V: Encode + ?Sized>(&mut self, name: &str, value: &V) -> Result<(), WireError> {
        let buf = self.buf_mut()?;
        let pos = buf.write_pos();
        buf.write(value)?;
        self.index.insert(name, pos);
        Ok(())
    }

    /// Copy entry `name` of `other` without decoding it.
    ///
    /// Returns `Ok(false)` if `other` has no such entry.
    pub fn set_from(&mut self, name: &str, other: &RpcMap) -> Result<bool, WireError> {
        let Some(src) = other.index.get(name) else {
            return Ok(false);
        };
        let buf = self.buf_mut()?;
        let pos = buf.write_pos();
        buf.write_stream_at(&other.buf, src)?;
        self.index.insert(name, pos);
        Ok(true)
    }

    /// Remove an entry. Returns whether it existed.
    pub fn delete(&mut self, name: &str) -> bool {
        self.index.remove(name)
    }

    #[inline]
    fn decode<'a, T>(
        &'a self,
        name: &str,
        decode: impl FnOnce(&'a Stream, usize) -> Result<(T, usize), WireError>,
    ) -> Option<T> {
        let pos = self.index.get(name)?;
        decode(&*self.buf, pos).ok().map(|(v, _)| v)
    }

    pub fn is_nil(&self, name: &str) -> bool {
        self.decode(name, Stream::nil_at).is_some()
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.decode(name, Stream::bool_at)
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.decode(name, Stream::i64_at)
    }

    pub fn get_u64(&self, name: &str) -> Option<u64> {
        self.decode(name, Stream::u64_at)
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.decode(name, Stream::f64_at)
    }

    pub fn get_str(&self, name: &str) -> Option<Cow<'_, str>> {
        self.decode(name, Stream::str_at)
    }

    pub fn get_bytes(&self, name: &str) -> Option<Cow<'_, [u8]>> {
        self.decode(name, Stream::bytes_at)
    }

    /// View of a nested array. Shares this map's buffer.
    pub fn get_array(&self, name: &str) -> Option<RpcArray> {
        let pos = self.index.get(name)?;
        shared_array_at(&self.buf, pos).ok().map(|(v, _)| v)
    }

    /// View of a nested map. Shares this map's buffer.
    pub fn get_map(&self, name: &str) -> Option<RpcMap> {
        let pos = self.index.get(name)?;
        shared_map_at(&self.buf, pos).ok().map(|(v, _)| v)
    }

    /// Decode entry `name` whatever its type.
    pub fn get(&self, name: &str) -> Option<Value> {
        let pos = self.index.get(name)?;
        shared_value_at(&self.buf, pos).ok().map(|(v, _)| v)
    }

    fn raw(&self, name: &str) -> Option<Cow<'_, [u8]>> {
        let pos = self.index.get(name)?;
        let skip = self.buf.skip_at(pos).ok()?;
        self.buf.slice_at(pos, skip).ok()
    }

    fn entries(&self) -> Vec<(&str, usize)> {
        match &self.index {
            Index::Small(list) => list.iter().map(|(k, p)| (k.as_str(), *p)).collect(),
            Index::Large(map) => map.iter().map(|(k, p)| (k.as_str(), *p)).collect(),
        }
    }

    #[cfg(test)]
    fn is_small(&self) -> bool {
        matches!(self.index, Index::Small(_))
    }
}

impl Encode for RpcMap {
    fn encode(&self, stream: &mut Stream) -> Result<(), WireError> {
        let entries = self.entries();
        stream.write_container(op::MAP_EMPTY, entries.len(), |out| {
            for (name, pos) in entries {
                out.write_string(name)?;
                out.write_stream_at(&self.buf, pos)?;
            }
            Ok(())
        })
    }
}

impl Stream {
    /// Write a map.
    pub fn write_map(&mut self, v: &RpcMap) -> Result<(), WireError> {
        self.write(v)
    }
}

impl Default for RpcMap {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for RpcMap {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .entries()
                .into_iter()
                .all(|(name, _)| other.raw(name).is_some() && self.raw(name) == other.raw(name))
    }
}

impl fmt::Debug for RpcMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_map();
        for (name, _) in self.entries() {
            out.entry(&name, &self.get(name).unwrap_or_default());
        }
        out.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(map: &RpcMap) -> RpcMap {
        let mut stream = Stream::new();
        stream.write(map).unwrap();
        stream.read_map().unwrap()
    }

    #[test]
    fn test_set_get_overwrite() {
        let mut map = RpcMap::new();
        map.set("a", &1i64).unwrap();
        map.set("a", "now a string").unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map.get_i64("a"), None);
        assert_eq!(map.get_str("a").as_deref(), Some("now a string"));
        assert_eq!(map.get_str("missing"), None);
    }

    #[test]
    fn test_round_trip_keeps_entries() {
        let mut map = RpcMap::new();
        map.set("flag", &true).unwrap();
        map.set("data", &vec![1u8, 2, 3]).unwrap();
        map.set("nested", &RpcMap::new()).unwrap();

        let decoded = round_trip(&map);
        assert_eq!(decoded.get_bool("flag"), Some(true));
        assert_eq!(decoded.get_bytes("data").as_deref(), Some(&[1u8, 2, 3][..]));
        assert!(decoded.get_map("nested").unwrap().is_empty());
        assert_eq!(decoded, map);
    }

    #[test]
    fn test_switches_to_large_on_seventeenth_insert() {
        let mut map = RpcMap::new();
        for i in 0..SMALL_MAP_CAPACITY {
            map.set(&format!("k{i}"), &(i as u64)).unwrap();
        }
        assert!(map.is_small());

        map.set("k16", &16u64).unwrap();
        assert!(!map.is_small());
        assert_eq!(map.len(), 17);
        for i in 0..=16u64 {
            assert_eq!(map.get_u64(&format!("k{i}")), Some(i));
        }
    }

    #[test]
    fn test_shrinks_back_to_small_on_delete() {
        let mut map = RpcMap::new();
        for i in 0..17u64 {
            map.set(&format!("k{i}"), &i).unwrap();
        }
        assert!(map.delete("k3"));
        assert!(map.is_small());
        assert!(!map.delete("k3"));
        assert_eq!(map.len(), 16);
        assert_eq!(map.get_u64("k16"), Some(16));
    }

    #[test]
    fn test_large_map_round_trip() {
        let mut map = RpcMap::new();
        for i in 0..40u64 {
            map.set(&format!("key_{i}"), &i).unwrap();
        }
        let decoded = round_trip(&map);
        assert_eq!(decoded.len(), 40);
        assert_eq!(decoded.get_u64("key_39"), Some(39));
    }

    #[test]
    fn test_duplicate_keys_first_wins() {
        // {"a": 1, "a": 2}
        let mut stream = Stream::new();
        stream.put_bytes(&[0x62, 13, 0, 0, 0, 129, b'a', 0, 22, 129, b'a', 0, 23]);
        let map = stream.read_map().unwrap();
        assert_eq!(map.get_i64("a"), Some(1));
    }

    #[test]
    fn test_non_string_key_is_rejected() {
        let mut stream = Stream::new();
        stream.put_bytes(&[0x61, 7, 0, 0, 0, 22, 22]);
        assert_eq!(stream.read_map().unwrap_err(), WireError::Opcode(22));
    }

    #[test]
    fn test_set_from_copies_raw_value() {
        let mut src = RpcMap::new();
        src.set("v", &-5i64).unwrap();
        let mut dst = RpcMap::new();
        assert!(dst.set_from("v", &src).unwrap());
        assert!(!dst.set_from("w", &src).unwrap());
        assert_eq!(dst.get_i64("v"), Some(-5));
    }

    #[test]
    fn test_nested_map_is_a_view_until_written() {
        let mut inner = RpcMap::new();
        inner.set("x", &1i64).unwrap();
        let mut outer = RpcMap::new();
        outer.set("inner", &inner).unwrap();
        outer.set("name", "outer").unwrap();

        let decoded = round_trip(&outer);
        let mut nested = decoded.get_map("inner").unwrap();
        assert!(nested.is_shared());
        assert_eq!(nested.get_i64("x"), Some(1));

        nested.set("y", &2i64).unwrap();
        assert!(!nested.is_shared());
        assert_eq!(nested.get_i64("x"), Some(1));
        assert_eq!(nested.get_i64("y"), Some(2));
        assert!(!decoded.get_map("inner").unwrap().contains_key("y"));
        assert_eq!(decoded.get_str("name").as_deref(), Some("outer"));
    }

    #[test]
    fn test_shrink_keeps_key_set() {
        let mut map = RpcMap::new();
        for i in 0..20u64 {
            map.set(&format!("k{i}"), &i).unwrap();
        }
        for i in 16..20u64 {
            map.delete(&format!("k{i}"));
        }
        assert!(map.is_small());

        let mut keys = map.keys();
        keys.sort_unstable();
        let mut expected: Vec<String> = (0..16).map(|i| format!("k{i}")).collect();
        expected.sort_unstable();
        assert_eq!(keys, expected);
    }
}
