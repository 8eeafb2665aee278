//! Wire format constants, stream header and the opcode skip table.
//!
//! A stream starts with one sentinel byte followed by a 16-byte header:
//! ```text
//! ┌──────┬─────────────────────────────────────────────────────┬──────────┐
//! │ 0x01 │                    Header (16)                      │ Body ... │
//! │      ├──────────────┬──────────────┬───────────┬───────────┤          │
//! │      │ client cb id │ client conn  │ machine id│ router id │          │
//! │      │ u32 LE       │ u32 LE       │ u32 LE    │ u32 LE    │          │
//! │      │◄──── server callback id u64 LE ────────►│           │          │
//! └──────┴──────────────┴──────────────┴───────────┴───────────┴──────────┘
//!  0      1                                                      17
//! ```
//!
//! Every value in the body opens with one opcode byte. All multi-byte
//! integers are Little Endian.

/// Size of one stream frame in bytes.
pub const FRAME_SIZE: usize = 512;

pub(crate) const FRAME_SHIFT: usize = 9;
pub(crate) const FRAME_MASK: usize = FRAME_SIZE - 1;

const _: () = assert!(1 << FRAME_SHIFT == FRAME_SIZE);

/// Header size in bytes (fixed, exactly 16).
pub const HEADER_SIZE: usize = 16;

/// Offset of the header inside a stream.
pub const STREAM_POS_HEADER: usize = 1;

/// Offset of the first body byte inside a stream.
pub const STREAM_POS_BODY: usize = STREAM_POS_HEADER + HEADER_SIZE;

/// Value of the sentinel byte at stream offset 0.
pub const STREAM_SENTINEL: u8 = 1;

/// Containers with more elements than this carry an explicit 4-byte count.
pub const CONTAINER_INLINE_COUNT: usize = 30;

/// Strings and byte arrays longer than this carry an explicit 4-byte length.
pub const INLINE_LEN: usize = 62;

/// Opcode constants.
pub mod op {
    /// Nil.
    pub const NIL: u8 = 1;
    /// Boolean true.
    pub const TRUE: u8 = 2;
    /// Boolean false.
    pub const FALSE: u8 = 3;
    /// Float 0.0.
    pub const F64_ZERO: u8 = 4;
    /// Float, 8 bytes.
    pub const F64: u8 = 5;
    /// i64 that fits i16, 2 bytes.
    pub const I16: u8 = 6;
    /// i64 that fits i32, 4 bytes.
    pub const I32: u8 = 7;
    /// i64, 8 bytes.
    pub const I64: u8 = 8;
    /// u64 that fits u16, 2 bytes.
    pub const U16: u8 = 9;
    /// u64 that fits u32, 4 bytes.
    pub const U32: u8 = 10;
    /// u64, 8 bytes.
    pub const U64: u8 = 11;

    /// First small-i64 opcode (value -7).
    pub const SMALL_I64_FIRST: u8 = 14;
    /// Last small-i64 opcode (value 32).
    pub const SMALL_I64_LAST: u8 = 53;
    /// small i64 value = opcode - SMALL_I64_BIAS.
    pub const SMALL_I64_BIAS: i64 = 21;
    /// Smallest inline i64.
    pub const SMALL_I64_MIN: i64 = -7;
    /// Largest inline i64.
    pub const SMALL_I64_MAX: i64 = 32;

    /// First small-u64 opcode (value 0).
    pub const SMALL_U64_FIRST: u8 = 54;
    /// Last small-u64 opcode (value 9).
    pub const SMALL_U64_LAST: u8 = 63;
    /// Largest inline u64.
    pub const SMALL_U64_MAX: u64 = 9;

    /// Empty array.
    pub const ARRAY_EMPTY: u8 = 64;
    /// Array with more than 30 elements.
    pub const ARRAY_LONG: u8 = 95;
    /// Empty map.
    pub const MAP_EMPTY: u8 = 96;
    /// Map with more than 30 entries.
    pub const MAP_LONG: u8 = 127;
    /// Empty string.
    pub const STRING_EMPTY: u8 = 128;
    /// String longer than 62 bytes.
    pub const STRING_LONG: u8 = 191;
    /// Empty byte array.
    pub const BYTES_EMPTY: u8 = 192;
    /// Byte array longer than 62 bytes.
    pub const BYTES_LONG: u8 = 255;
}

/// How many bytes the value behind an opcode occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipRule {
    /// Reserved opcode (0, 12, 13).
    Invalid,
    /// The value has a fixed size, opcode included.
    Fixed(u8),
    /// Size is the 4-byte LE length after the opcode plus this constant.
    Prefixed(u8),
}

const fn build_skip_table() -> [SkipRule; 256] {
    let mut table = [SkipRule::Invalid; 256];
    let mut i = 0usize;
    while i < 256 {
        let code = i as u8;
        table[i] = match code {
            op::NIL | op::TRUE | op::FALSE | op::F64_ZERO => SkipRule::Fixed(1),
            op::F64 => SkipRule::Fixed(9),
            op::I16 => SkipRule::Fixed(3),
            op::I32 => SkipRule::Fixed(5),
            op::I64 => SkipRule::Fixed(9),
            op::U16 => SkipRule::Fixed(3),
            op::U32 => SkipRule::Fixed(5),
            op::U64 => SkipRule::Fixed(9),
            op::SMALL_I64_FIRST..=op::SMALL_U64_LAST => SkipRule::Fixed(1),
            op::ARRAY_EMPTY | op::MAP_EMPTY => SkipRule::Fixed(1),
            // container total-length counts from the opcode
            65..=op::ARRAY_LONG | 97..=op::MAP_LONG => SkipRule::Prefixed(0),
            op::STRING_EMPTY => SkipRule::Fixed(1),
            129..=190 => SkipRule::Fixed(code - op::STRING_EMPTY + 2),
            // opcode + length + bytes + sentinel
            op::STRING_LONG => SkipRule::Prefixed(6),
            op::BYTES_EMPTY => SkipRule::Fixed(1),
            193..=254 => SkipRule::Fixed(code - op::BYTES_EMPTY + 1),
            // opcode + length + bytes
            op::BYTES_LONG => SkipRule::Prefixed(5),
            _ => SkipRule::Invalid,
        };
        i += 1;
    }
    table
}

/// Opcode skip lookup table.
pub static SKIP_TABLE: [SkipRule; 256] = build_skip_table();

/// The 16-byte stream header.
///
/// Bytes 0..8 are read either as one server callback id (u64) or as a client
/// callback id (u32) followed by a client connection id (u32); the caller
/// picks the role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Header {
    bytes: [u8; HEADER_SIZE],
}

impl Header {
    /// Create a zeroed header.
    pub const fn new() -> Self {
        Self {
            bytes: [0u8; HEADER_SIZE],
        }
    }

    /// Wrap raw header bytes.
    pub const fn from_bytes(bytes: [u8; HEADER_SIZE]) -> Self {
        Self { bytes }
    }

    /// Decode a header from the front of `buf`.
    ///
    /// Returns `None` if the buffer is too short.
    ///
    /// # Example
    ///
    /// ```
    /// use echowire::protocol::Header;
    ///
    /// let bytes = [42, 0, 0, 0, 7, 0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0];
    /// let header = Header::decode(&bytes).unwrap();
    /// assert_eq!(header.client_callback_id(), 42);
    /// assert_eq!(header.client_conn_id(), 7);
    /// assert_eq!(header.router_id(), 2);
    /// ```
    pub fn decode(buf: &[u8]) -> Option<Self> {
        let bytes: [u8; HEADER_SIZE] = buf.get(..HEADER_SIZE)?.try_into().ok()?;
        Some(Self { bytes })
    }

    /// Raw header bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8; HEADER_SIZE] {
        &self.bytes
    }

    #[inline]
    fn u32_at(&self, at: usize) -> u32 {
        u32::from_le_bytes([
            self.bytes[at],
            self.bytes[at + 1],
            self.bytes[at + 2],
            self.bytes[at + 3],
        ])
    }

    #[inline]
    fn set_u32_at(&mut self, at: usize, v: u32) {
        self.bytes[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }

    /// Server callback id (bytes 0..8).
    #[inline]
    pub fn server_callback_id(&self) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.bytes[0..8]);
        u64::from_le_bytes(b)
    }

    /// Set the server callback id (bytes 0..8).
    #[inline]
    pub fn set_server_callback_id(&mut self, v: u64) {
        self.bytes[0..8].copy_from_slice(&v.to_le_bytes());
    }

    /// Client callback id (bytes 0..4).
    #[inline]
    pub fn client_callback_id(&self) -> u32 {
        self.u32_at(0)
    }

    /// Set the client callback id (bytes 0..4).
    #[inline]
    pub fn set_client_callback_id(&mut self, v: u32) {
        self.set_u32_at(0, v);
    }

    /// Client connection id (bytes 4..8).
    #[inline]
    pub fn client_conn_id(&self) -> u32 {
        self.u32_at(4)
    }

    /// Set the client connection id (bytes 4..8).
    #[inline]
    pub fn set_client_conn_id(&mut self, v: u32) {
        self.set_u32_at(4, v);
    }

    /// Machine id (bytes 8..12).
    #[inline]
    pub fn machine_id(&self) -> u32 {
        self.u32_at(8)
    }

    /// Set the machine id (bytes 8..12).
    #[inline]
    pub fn set_machine_id(&mut self, v: u32) {
        self.set_u32_at(8, v);
    }

    /// Router id (bytes 12..16).
    #[inline]
    pub fn router_id(&self) -> u32 {
        self.u32_at(12)
    }

    /// Set the router id (bytes 12..16).
    #[inline]
    pub fn set_router_id(&mut self, v: u32) {
        self.set_u32_at(12, v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_little_endian_byte_order() {
        let mut header = Header::new();
        header.set_client_callback_id(0x0403_0201);
        header.set_client_conn_id(0x0807_0605);
        header.set_machine_id(0x0C0B_0A09);
        header.set_router_id(0x100F_0E0D);

        let expected: Vec<u8> = (1..=16).collect();
        assert_eq!(&header.as_bytes()[..], &expected[..]);
        assert_eq!(header.server_callback_id(), 0x0807_0605_0403_0201);
    }

    #[test]
    fn test_header_roles_share_first_eight_bytes() {
        let mut header = Header::new();
        header.set_server_callback_id(u64::MAX - 1);
        assert_eq!(header.client_callback_id(), u32::MAX - 1);
        assert_eq!(header.client_conn_id(), u32::MAX);
        assert_eq!(header.machine_id(), 0);
    }

    #[test]
    fn test_decode_too_short_buffer() {
        let buf = [0u8; 15];
        assert!(Header::decode(&buf).is_none());
    }

    #[test]
    fn test_stream_layout_constants() {
        assert_eq!(HEADER_SIZE, 16);
        assert_eq!(STREAM_POS_BODY, 17);
        assert_eq!(FRAME_SIZE, 512);
    }

    #[test]
    fn test_reserved_opcodes_are_invalid() {
        for code in [0usize, 12, 13] {
            assert_eq!(SKIP_TABLE[code], SkipRule::Invalid);
        }
    }

    #[test]
    fn test_skip_table_matches_opcode_table() {
        assert_eq!(SKIP_TABLE[op::NIL as usize], SkipRule::Fixed(1));
        assert_eq!(SKIP_TABLE[op::F64 as usize], SkipRule::Fixed(9));
        assert_eq!(SKIP_TABLE[op::I16 as usize], SkipRule::Fixed(3));
        assert_eq!(SKIP_TABLE[op::U32 as usize], SkipRule::Fixed(5));
        assert_eq!(SKIP_TABLE[14], SkipRule::Fixed(1));
        assert_eq!(SKIP_TABLE[63], SkipRule::Fixed(1));
        for code in 65..=95usize {
            assert_eq!(SKIP_TABLE[code], SkipRule::Prefixed(0));
        }
        for code in 97..=127usize {
            assert_eq!(SKIP_TABLE[code], SkipRule::Prefixed(0));
        }
        // "a" = opcode + 1 byte + sentinel
        assert_eq!(SKIP_TABLE[129], SkipRule::Fixed(3));
        assert_eq!(SKIP_TABLE[190], SkipRule::Fixed(64));
        assert_eq!(SKIP_TABLE[191], SkipRule::Prefixed(6));
        assert_eq!(SKIP_TABLE[193], SkipRule::Fixed(2));
        assert_eq!(SKIP_TABLE[254], SkipRule::Fixed(63));
        assert_eq!(SKIP_TABLE[255], SkipRule::Prefixed(5));
    }
}
