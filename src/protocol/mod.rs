//! Protocol module - stream layout, header and frame pooling.
//!
//! This module implements the byte-level plumbing under the codec:
//! - 16-byte header behind a sentinel byte
//! - Opcode skip table
//! - Segmented [`Stream`] built from pooled 512-byte frames

pub mod frame_pool;
mod stream;
mod wire_format;

pub use stream::Stream;
pub use wire_format::{
    op, Header, SkipRule, CONTAINER_INLINE_COUNT, FRAME_SIZE, HEADER_SIZE, INLINE_LEN,
    SKIP_TABLE, STREAM_POS_BODY, STREAM_POS_HEADER, STREAM_SENTINEL,
};
