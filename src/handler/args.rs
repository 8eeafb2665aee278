//! Echo argument kinds.
//!
//! Handlers accept a closed set of argument types. Each one has a letter
//! used to build the signature fingerprint and a type name used in
//! diagnostics:
//!
//! | Rust type  | Letter | Name      |
//! |------------|--------|-----------|
//! | `i64`      | `I`    | `int64`   |
//! | `u64`      | `U`    | `uint64`  |
//! | `f64`      | `F`    | `float64` |
//! | `bool`     | `B`    | `bool`    |
//! | `String`   | `S`    | `string`  |
//! | `Vec<u8>`  | `X`    | `bytes`   |
//! | `RpcArray` | `A`    | `array`   |
//! | `RpcMap`   | `M`    | `map`     |

use std::fmt;
use std::sync::Arc;

use crate::codec::{shared_array_at, shared_map_at, shared_value_at, RpcArray, RpcMap, Value};
use crate::error::WireError;
use crate::protocol::{op, Stream};

/// Kind of one declared echo argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgKind {
    Int,
    Uint,
    Float,
    Bool,
    Str,
    Bytes,
    Array,
    Map,
}

impl ArgKind {
    /// Fingerprint letter.
    pub const fn letter(self) -> char {
        match self {
            ArgKind::Int => 'I',
            ArgKind::Uint => 'U',
            ArgKind::Float => 'F',
            ArgKind::Bool => 'B',
            ArgKind::Str => 'S',
            ArgKind::Bytes => 'X',
            ArgKind::Array => 'A',
            ArgKind::Map => 'M',
        }
    }

    /// Type name as shown in signatures.
    pub const fn type_name(self) -> &'static str {
        match self {
            ArgKind::Int => "int64",
            ArgKind::Uint => "uint64",
            ArgKind::Float => "float64",
            ArgKind::Bool => "bool",
            ArgKind::Str => "string",
            ArgKind::Bytes => "bytes",
            ArgKind::Array => "array",
            ArgKind::Map => "map",
        }
    }

    /// Read one argument of this kind with the matching typed reader.
    pub(crate) fn read_value(self, args: &mut ArgReader) -> Result<Value, WireError> {
        Ok(match self {
            ArgKind::Int => Value::Int(args.read_i64()?),
            ArgKind::Uint => Value::Uint(args.read_u64()?),
            ArgKind::Float => Value::Float(args.read_f64()?),
            ArgKind::Bool => Value::Bool(args.read_bool()?),
            ArgKind::Str => Value::Str(args.read_string()?),
            ArgKind::Bytes => Value::Bytes(args.read_bytes()?),
            ArgKind::Array => Value::Array(args.read_array()?),
            ArgKind::Map => Value::Map(args.read_map()?),
        })
    }
}

impl fmt::Display for ArgKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

/// Signature fingerprint, e.g. `"SI"` for `(ctx, String, i64)`.
pub fn fingerprint(kinds: &[ArgKind]) -> String {
    kinds.iter().map(|k| k.letter()).collect()
}

/// Type name of the value an opcode introduces.
pub fn wire_type_name(code: u8) -> &'static str {
    match code {
        op::NIL => "nil",
        op::TRUE | op::FALSE => "bool",
        op::F64_ZERO | op::F64 => "float64",
        op::I16 | op::I32 | op::I64 | op::SMALL_I64_FIRST..=op::SMALL_I64_LAST => "int64",
        op::U16 | op::U32 | op::U64 | op::SMALL_U64_FIRST..=op::SMALL_U64_LAST => "uint64",
        op::ARRAY_EMPTY..=op::ARRAY_LONG => "array",
        op::MAP_EMPTY..=op::MAP_LONG => "map",
        op::STRING_EMPTY..=op::STRING_LONG => "string",
        op::BYTES_EMPTY..=op::BYTES_LONG => "bytes",
        _ => "<invalid>",
    }
}

/// Render `path(ctx, a, b) Return`.
pub(crate) fn format_call<'a>(path: &str, types: impl IntoIterator<Item = &'a str>) -> String {
    let mut out = format!("{path}(ctx");
    for name in types {
        out.push_str(", ");
        out.push_str(name);
    }
    out.push_str(") Return");
    out
}

/// Read cursor over the arguments of one request.
///
/// The request stream is moved behind an `Arc`, so array and map arguments
/// are views into the request bytes rather than copies. A handler that keeps
/// such a view keeps the request frames alive with it.
pub struct ArgReader {
    buf: Arc<Stream>,
    pos: usize,
}

impl ArgReader {
    /// Start reading at the read cursor of `stream`.
    pub fn new(stream: Stream) -> Self {
        let pos = stream.read_pos();
        Self {
            buf: Arc::new(stream),
            pos,
        }
    }

    /// Position of the next argument.
    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Unread argument bytes.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.write_pos().saturating_sub(self.pos)
    }

    /// The request stream.
    pub fn stream(&self) -> &Stream {
        &self.buf
    }

    #[inline]
    fn read_with<T>(
        &mut self,
        decode: impl FnOnce(&Arc<Stream>, usize) -> Result<(T, usize), WireError>,
    ) -> Result<T, WireError> {
        let (value, next) = decode(&self.buf, self.pos)?;
        self.pos = next;
        Ok(value)
    }

    pub fn read_i64(&mut self) -> Result<i64, WireError> {
        self.read_with(|s, pos| s.i64_at(pos))
    }

    pub fn read_u64(&mut self) -> Result<u64, WireError> {
        self.read_with(|s, pos| s.u64_at(pos))
    }

    pub fn read_f64(&mut self) -> Result<f64, WireError> {
        self.read_with(|s, pos| s.f64_at(pos))
    }

    pub fn read_bool(&mut self) -> Result<bool, WireError> {
        self.read_with(|s, pos| s.bool_at(pos))
    }

    pub fn read_string(&mut self) -> Result<String, WireError> {
        self.read_with(|s, pos| s.str_at(pos).map(|(v, n)| (v.into_owned(), n)))
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>, WireError> {
        self.read_with(|s, pos| s.bytes_at(pos).map(|(v, n)| (v.into_owned(), n)))
    }

    /// Read an array as a view into the request.
    pub fn read_array(&mut self) -> Result<RpcArray, WireError> {
        self.read_with(shared_array_at)
    }

    /// Read a map as a view into the request.
    pub fn read_map(&mut self) -> Result<RpcMap, WireError> {
        self.read_with(shared_map_at)
    }

    pub fn read_value(&mut self) -> Result<Value, WireError> {
        self.read_with(shared_value_at)
    }
}

impl From<Stream> for ArgReader {
    fn from(stream: Stream) -> Self {
        Self::new(stream)
    }
}

impl fmt::Debug for ArgReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArgReader")
            .field("pos", &self.pos)
            .field("remaining", &self.remaining())
            .finish()
    }
}

/// A type a typed handler can take as an argument.
///
/// Implemented for the eight wire argument types only.
pub trait EchoArg: Sized + Send + 'static {
    /// Declared kind.
    const KIND: ArgKind;

    /// Read the argument under the cursor of `args`.
    fn read_arg(args: &mut ArgReader) -> Result<Self, WireError>;
}

macro_rules! echo_arg {
    ($($ty:ty => $kind:ident, $read:ident;)*) => {
        $(
            impl EchoArg for $ty {
                const KIND: ArgKind = ArgKind::$kind;

                #[inline]
                fn read_arg(args: &mut ArgReader) -> Result<Self, WireError> {
                    args.$read()
                }
            }
        )*
    };
}

echo_arg! {
    i64 => Int, read_i64;
    u64 => Uint, read_u64;
    f64 => Float, read_f64;
    bool => Bool, read_bool;
    String => Str, read_string;
    Vec<u8> => Bytes, read_bytes;
    RpcArray => Array, read_array;
    RpcMap => Map, read_map;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_letters() {
        let kinds = [
            ArgKind::Int,
            ArgKind::Uint,
            ArgKind::Float,
            ArgKind::Bool,
            ArgKind::Str,
            ArgKind::Bytes,
            ArgKind::Array,
            ArgKind::Map,
        ];
        assert_eq!(fingerprint(&kinds), "IUFBSXAM");
        assert_eq!(fingerprint(&[]), "");
    }

    #[test]
    fn test_format_call() {
        assert_eq!(
            format_call("$.user:sayHello", ["string"]),
            "$.user:sayHello(ctx, string) Return"
        );
        assert_eq!(format_call("$:ping", []), "$:ping(ctx) Return");
    }

    #[test]
    fn test_wire_type_names() {
        assert_eq!(wire_type_name(42), "int64");
        assert_eq!(wire_type_name(6), "int64");
        assert_eq!(wire_type_name(60), "uint64");
        assert_eq!(wire_type_name(130), "string");
        assert_eq!(wire_type_name(12), "<invalid>");
    }

    fn reader(write: impl FnOnce(&mut Stream)) -> ArgReader {
        let mut stream = Stream::new();
        write(&mut stream);
        ArgReader::new(stream)
    }

    #[test]
    fn test_read_value_by_kind() {
        let mut args = reader(|s| s.write_string("x").unwrap());
        assert_eq!(
            ArgKind::Str.read_value(&mut args).unwrap(),
            Value::Str("x".into())
        );

        let mut args = reader(|s| s.write_string("x").unwrap());
        assert!(ArgKind::Int.read_value(&mut args).is_err());
        assert_eq!(args.remaining(), 3);
    }

    #[test]
    fn test_container_arguments_borrow_the_request() {
        let items = RpcArray::try_from_iter([1i64, 2, 3]).unwrap();
        let mut args = reader(|s| {
            s.write(&items).unwrap();
            s.write_i64(9);
        });

        let array = args.read_array().unwrap();
        assert!(array.is_shared());
        assert_eq!(array.get_i64(2), Some(3));
        assert_eq!(args.read_i64().unwrap(), 9);
        assert_eq!(args.remaining(), 0);

        // the view outlives the reader and keeps the request bytes
        drop(args);
        assert!(!array.is_shared());
        assert_eq!(array.get_i64(0), Some(1));
    }
}
