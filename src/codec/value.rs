//! Dynamic values and the [`Encode`] trait.
//!
//! The set of wire types is closed: anything that implements [`Encode`] can
//! be written, and nothing else compiles. Narrow integers widen to `i64` /
//! `u64`, `f32` widens to `f64`.

use std::fmt;

use crate::error::WireError;
use crate::protocol::Stream;

use super::array::RpcArray;
use super::map::RpcMap;

/// Types that can be written to a [`Stream`].
pub trait Encode {
    /// Append `self` at the write cursor.
    ///
    /// Implementations may leave partial bytes behind on failure;
    /// [`Stream::write`] rewinds them.
    fn encode(&self, stream: &mut Stream) -> Result<(), WireError>;
}

/// Any value the codec can carry.
#[derive(Clone, PartialEq, Default)]
pub enum Value {
    /// Nil.
    #[default]
    Nil,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Unsigned integer.
    Uint(u64),
    /// Float.
    Float(f64),
    /// UTF-8 string.
    Str(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// Array view.
    Array(RpcArray),
    /// Map view.
    Map(RpcMap),
}

impl Value {
    /// Wire type name, as used in signature diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int64",
            Value::Uint(_) => "uint64",
            Value::Float(_) => "float64",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
        }
    }

    /// Whether this is [`Value::Nil`].
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Uint(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&RpcArray> {
        match self {
            Value::Array(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&RpcMap> {
        match self {
            Value::Map(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => f.write_str("nil"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Uint(v) => write!(f, "{v}u"),
            Value::Float(v) => write!(f, "{v:?}"),
            Value::Str(v) => write!(f, "{v:?}"),
            Value::Bytes(v) => write!(f, "b{v:?}"),
            Value::Array(v) => v.fmt(f),
            Value::Map(v) => v.fmt(f),
        }
    }
}

impl Encode for Value {
    fn encode(&self, stream: &mut Stream) -> Result<(), WireError> {
        match self {
            Value::Nil => stream.write_nil(),
            Value::Bool(v) => stream.write_bool(*v),
            Value::Int(v) => stream.write_i64(*v),
            Value::Uint(v) => stream.write_u64(*v),
            Value::Float(v) => stream.write_f64(*v),
            Value::Str(v) => return stream.write_string(v),
            Value::Bytes(v) => return stream.write_bytes(v),
            Value::Array(v) => return v.encode(stream),
            Value::Map(v) => return v.encode(stream),
        }
        Ok(())
    }
}

macro_rules! encode_infallible {
    ($($ty:ty => $method:ident as $wide:ty),* $(,)?) => {
        $(
            impl Encode for $ty {
                #[inline]
                fn encode(&self, stream: &mut Stream) -> Result<(), WireError> {
                    stream.$method(*self as $wide);
                    Ok(())
                }
            }
        )*
    };
}

encode_infallible! {
    i8 => write_i64 as i64,
    i16 => write_i64 as i64,
    i32 => write_i64 as i64,
    i64 => write_i64 as i64,
    isize => write_i64 as i64,
    u8 => write_u64 as u64,
    u16 => write_u64 as u64,
    u32 => write_u64 as u64,
    u64 => write_u64 as u64,
    usize => write_u64 as u64,
    f32 => write_f64 as f64,
    f64 => write_f64 as f64,
}

impl Encode for bool {
    #[inline]
    fn encode(&self, stream: &mut Stream) -> Result<(), WireError> {
        stream.write_bool(*self);
        Ok(())
    }
}

impl Encode for () {
    #[inline]
    fn encode(&self, stream: &mut Stream) -> Result<(), WireError> {
        stream.write_nil();
        Ok(())
    }
}

impl Encode for str {
    #[inline]
    fn encode(&self, stream: &mut Stream) -> Result<(), WireError> {
        stream.write_string(self)
    }
}

impl Encode for String {
    #[inline]
    fn encode(&self, stream: &mut Stream) -> Result<(), WireError> {
        stream.write_string(self)
    }
}

impl Encode for [u8] {
    #[inline]
    fn encode(&self, stream: &mut Stream) -> Result<(), WireError> {
        stream.write_bytes(self)
    }
}

impl Encode for Vec<u8> {
    #[inline]
    fn encode(&self, stream: &mut Stream) -> Result<(), WireError> {
        stream.write_bytes(self)
    }
}

impl<T: Encode> Encode for Option<T> {
    fn encode(&self, stream: &mut Stream) -> Result<(), WireError> {
        match self {
            Some(v) => v.encode(stream),
            None => {
                stream.write_nil();
                Ok(())
            }
        }
    }
}

impl<T: Encode + ?Sized> Encode for &T {
    #[inline]
    fn encode(&self, stream: &mut Stream) -> Result<(), WireError> {
        (**self).encode(stream)
    }
}

impl<T: Encode + ?Sized> Encode for Box<T> {
    #[inline]
    fn encode(&self, stream: &mut Stream) -> Result<(), WireError> {
        (**self).encode(stream)
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident as $wide:ty),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v as $wide)
                }
            }
        )*
    };
}

value_from! {
    i8 => Int as i64,
    i16 => Int as i64,
    i32 => Int as i64,
    i64 => Int as i64,
    isize => Int as i64,
    u8 => Uint as u64,
    u16 => Uint as u64,
    u32 => Uint as u64,
    u64 => Uint as u64,
    usize => Uint as u64,
    f32 => Float as f64,
    f64 => Float as f64,
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Nil
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<RpcArray> for Value {
    fn from(v: RpcArray) -> Self {
        Value::Array(v)
    }
}

impl From<RpcMap> for Value {
    fn from(v: RpcMap) -> Self {
        Value::Map(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Nil, Into::into)
    }
}
