// CAR file header, section tags and layout arithmetic.
//
// Every field in the format is 4-byte aligned and every integer is a
// little-endian u32, so the sizes below are all the layout code needs.

// ---------------------------------------------------------------------------
// Magic and version
// ---------------------------------------------------------------------------

/// Format version written into the fourth header byte.
pub const CAR_VERSION: u8 = 0x01;

/// The 4-byte file header: `'r' 'a' 'c' <version>`.
pub const CAR_MAGIC: [u8; 4] = [b'r', b'a', b'c', CAR_VERSION];

/// Size of the file header in bytes.
pub const HEADER_SIZE: usize = CAR_MAGIC.len();

/// Size of a `tag + length` frame header in bytes.
pub const TAG_HEADER_SIZE: usize = 8;

/// Size of an encoded `u32`.
pub const U32_SIZE: usize = 4;

/// Conventional file extension for compiled script chunks stored in archives.
pub const SCRIPT_EXTENSION: &str = "lu";

// ---------------------------------------------------------------------------
// Section tags
// ---------------------------------------------------------------------------

/// Discriminant of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    /// The index section: entry count followed by `(kind, offset, name)` records.
    Contents,
    /// One entry's payload block.
    Data,
    /// Terminal frame with a zero length.
    Eof,
    /// Any value this version does not define.
    Unknown(u32),
}

impl Tag {
    pub const CONTENTS: u32 = 1;
    pub const DATA: u32 = 2;
    pub const EOF: u32 = 0xFFFF_FFFF;

    pub fn from_u32(raw: u32) -> Self {
        match raw {
            Self::CONTENTS => Tag::Contents,
            Self::DATA => Tag::Data,
            Self::EOF => Tag::Eof,
            other => Tag::Unknown(other),
        }
    }

    pub fn to_u32(self) -> u32 {
        match self {
            Tag::Contents => Self::CONTENTS,
            Tag::Data => Self::DATA,
            Tag::Eof => Self::EOF,
            Tag::Unknown(raw) => raw,
        }
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tag::Contents => f.write_str("CONTENTS"),
            Tag::Data => f.write_str("DATA"),
            Tag::Eof => f.write_str("EOF"),
            Tag::Unknown(raw) => write!(f, "UNKNOWN({raw:#010X})"),
        }
    }
}

// ---------------------------------------------------------------------------
// Resource kinds
// ---------------------------------------------------------------------------

/// Kind of resource an entry holds. Only script objects are produced today;
/// other values read from foreign archives are carried through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ResourceKind {
    #[default]
    ScriptObject,
    Other(u32),
}

impl ResourceKind {
    pub const SCRIPT_OBJECT: u32 = 0;

    pub fn from_u32(raw: u32) -> Self {
        match raw {
            Self::SCRIPT_OBJECT => ResourceKind::ScriptObject,
            other => ResourceKind::Other(other),
        }
    }

    pub fn to_u32(self) -> u32 {
        match self {
            ResourceKind::ScriptObject => Self::SCRIPT_OBJECT,
            ResourceKind::Other(raw) => raw,
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::ScriptObject => f.write_str("script"),
            ResourceKind::Other(raw) => write!(f, "kind#{raw}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Layout helpers
// ---------------------------------------------------------------------------

/// Round `n` up to the next multiple of 4.
#[inline]
pub const fn aligned(n: usize) -> usize {
    (n + 3) & !3
}

/// Encoded size of a length-prefixed string of `len` bytes (prefix, bytes,
/// NUL terminator, padding).
#[inline]
pub const fn string_size(len: usize) -> usize {
    U32_SIZE + aligned(len + 1)
}

/// Encoded size of one Contents record with a name of `name_len` bytes.
#[inline]
pub const fn contents_record_size(name_len: usize) -> usize {
    2 * U32_SIZE + string_size(name_len)
}

/// Payload length stored in a Data frame header for a `payload_len`-byte entry.
#[inline]
pub const fn data_frame_len(payload_len: usize) -> usize {
    U32_SIZE + aligned(payload_len)
}

/// Total on-disk size of a Data frame, header included.
#[inline]
pub const fn data_frame_size(payload_len: usize) -> usize {
    TAG_HEADER_SIZE + data_frame_len(payload_len)
}

/// Check the 4-byte signature at the start of `bytes`.
///
/// The buffer must be strictly longer than the header: a bare header has no
/// room for the Contents frame and is not an archive.
pub fn has_car_magic(bytes: &[u8]) -> bool {
    bytes.len() > HEADER_SIZE && bytes[..HEADER_SIZE] == CAR_MAGIC
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
