// CAR binary format primitives.
//
// # Modules
//
// - `header`: magic, version, section tags, resource kinds, alignment math
// - `reader`: bounds-checked zero-copy cursor (`ByteReader`)
// - `writer`: position-tracking encoder (`TagWriter`)

pub mod header;
pub mod reader;
pub mod writer;

// Re-export key types for convenience.
pub use header::{CAR_MAGIC, CAR_VERSION, HEADER_SIZE, ResourceKind, TAG_HEADER_SIZE, Tag, aligned};
pub use reader::{ByteReader, ReadError};
pub use writer::TagWriter;
