//! Codec module - the self-describing binary value format.
//!
//! Every value opens with one opcode byte that names its type and, for small
//! values, the value itself:
//!
//! | Opcode     | Value                                             |
//! |------------|---------------------------------------------------|
//! | 1          | nil                                               |
//! | 2 / 3      | true / false                                      |
//! | 4 / 5      | float 0.0 / float + 8 bytes                       |
//! | 6 / 7 / 8  | int + 2 / 4 / 8 bytes                             |
//! | 9 / 10 / 11| uint + 2 / 4 / 8 bytes                            |
//! | 14..=53    | int -7..=32 inline                                |
//! | 54..=63    | uint 0..=9 inline                                 |
//! | 64..=95    | array (empty, 1..=30 inline count, long)          |
//! | 96..=127   | map (empty, 1..=30 inline count, long)            |
//! | 128..=191  | string (empty, 1..=62 inline length, long) + `\0` |
//! | 192..=255  | bytes (empty, 1..=62 inline length, long)         |
//!
//! Readers and writers are methods on [`Stream`](crate::protocol::Stream).
//! Containers decode into views, [`RpcArray`] and [`RpcMap`], that share the
//! decoded bytes and copy them only when written.
//!
//! # Example
//!
//! ```
//! use echowire::codec::Value;
//! use echowire::protocol::Stream;
//!
//! let mut stream = Stream::new();
//! stream.write_i64(-3);
//! stream.write("hello").unwrap();
//! stream.write(&[1u8, 2, 3][..]).unwrap();
//!
//! assert_eq!(stream.read_i64().unwrap(), -3);
//! assert_eq!(stream.read_string().unwrap(), "hello");
//! assert_eq!(stream.read_value().unwrap(), Value::Bytes(vec![1, 2, 3]));
//! ```

mod array;
mod map;
mod read;
mod value;
mod write;

pub use array::RpcArray;
pub(crate) use read::{shared_array_at, shared_map_at, shared_value_at};
pub use map::{RpcMap, SMALL_MAP_CAPACITY};
pub use value::{Encode, Value};
