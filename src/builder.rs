// Archive construction: two-pass layout and emission.
//
// The Contents section precedes every Data frame but records each frame's
// absolute offset, so all sizes are measured first (`layout`) and the
// offsets are written as forward references. While emitting the Data frames
// the writer's position is checked against every precomputed offset; a
// mismatch means the layout arithmetic is wrong and the build is abandoned
// rather than producing a file whose index lies.

use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};

use log::trace;

use crate::format::header::{
    self, CAR_MAGIC, HEADER_SIZE, ResourceKind, TAG_HEADER_SIZE, Tag, U32_SIZE,
};
use crate::format::writer::TagWriter;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("cannot open archive '{}' for writing: {source}", path.display())]
    DestinationUnwritable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("'{}' exists and is not a readable car archive: {source}", path.display())]
    Existing {
        path: PathBuf,
        #[source]
        source: crate::archive::OpenError,
    },
    #[error("archive would be {size} bytes; offsets are limited to 32 bits")]
    TooLarge { size: u64 },
    #[error("invalid entry name {name:?}")]
    InvalidName { name: String },
    /// The writer is not where the precomputed layout put the next frame.
    #[error(
        "layout invariant violated at '{name}': expected offset {expected}, writer at {actual}"
    )]
    LayoutMismatch {
        name: String,
        expected: u64,
        actual: u64,
    },
    /// A file-backed payload produced a different number of bytes than were
    /// measured for the layout.
    #[error("'{name}' changed size during the build: measured {expected} bytes, read {actual}")]
    PayloadSizeChanged {
        name: String,
        expected: u64,
        actual: u64,
    },
}

impl BuildError {
    /// True for the internal-consistency failures that must abort a build
    /// outright. These never come from bad input alone.
    pub fn is_layout_violation(&self) -> bool {
        matches!(
            self,
            BuildError::LayoutMismatch { .. } | BuildError::PayloadSizeChanged { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Pending entries
// ---------------------------------------------------------------------------

/// Where an entry's payload comes from at write time.
#[derive(Debug, Clone)]
pub enum EntrySource {
    Bytes(Vec<u8>),
    /// A file streamed into the archive; `len` is its size when it was added.
    File { path: PathBuf, len: u64 },
}

impl EntrySource {
    pub fn len(&self) -> u64 {
        match self {
            EntrySource::Bytes(b) => b.len() as u64,
            EntrySource::File { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
struct PendingEntry {
    name: String,
    kind: ResourceKind,
    source: EntrySource,
}

/// Frame positions computed before anything is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    /// Length field of the Contents frame.
    pub contents_len: u32,
    /// Absolute offset of each entry's Data frame, in entry order.
    pub offsets: Vec<u32>,
    /// Size of the finished archive, EOF frame included.
    pub total_size: u64,
}

// ---------------------------------------------------------------------------
// ArchiveBuilder
// ---------------------------------------------------------------------------

/// Ordered set of named entries to serialize.
///
/// Names are unique: adding a name that is already present replaces its
/// payload and keeps its position.
///
/// # Example
/// ```
/// use rescar::builder::ArchiveBuilder;
/// use rescar::archive::ArchiveIndex;
///
/// let mut builder = ArchiveBuilder::new();
/// builder.add("x.lu", b"AAAA".to_vec());
/// let bytes = builder.to_vec().unwrap();
///
/// let index = ArchiveIndex::open(&bytes[..]).unwrap();
/// assert_eq!(index.lookup("x.lu").unwrap(), Some(&b"AAAA"[..]));
/// ```
#[derive(Debug, Clone, Default)]
pub struct ArchiveBuilder {
    entries: Vec<PendingEntry>,
    kind: ResourceKind,
}

impl ArchiveBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder whose entries are tagged with `kind`.
    pub fn with_kind(kind: ResourceKind) -> Self {
        Self {
            entries: Vec::new(),
            kind,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    /// Add an in-memory payload. Returns `true` if it replaced an entry.
    pub fn add(&mut self, name: impl Into<String>, bytes: Vec<u8>) -> bool {
        self.insert(name.into(), EntrySource::Bytes(bytes))
    }

    /// Add a file, measuring its length now and streaming it at write time.
    /// Returns `true` if it replaced an entry.
    pub fn add_file(&mut self, name: impl Into<String>, path: &Path) -> io::Result<bool> {
        let len = std::fs::metadata(path)?.len();
        Ok(self.insert(
            name.into(),
            EntrySource::File {
                path: path.to_path_buf(),
                len,
            },
        ))
    }

    fn insert(&mut self, name: String, source: EntrySource) -> bool {
        let kind = self.kind;
        match self.entries.iter_mut().find(|e| e.name == name) {
            Some(existing) => {
                existing.source = source;
                existing.kind = kind;
                true
            }
            None => {
                self.entries.push(PendingEntry { name, kind, source });
                false
            }
        }
    }

    /// Compute the Contents length and every Data frame offset.
    pub fn layout(&self) -> Result<Layout, BuildError> {
        let mut contents_len = U32_SIZE as u64;
        for entry in &self.entries {
            if entry.name.is_empty() || entry.name.contains('\0') {
                return Err(BuildError::InvalidName {
                    name: entry.name.clone(),
                });
            }
            contents_len += header::contents_record_size(entry.name.len()) as u64;
        }

        let mut offset = (HEADER_SIZE + TAG_HEADER_SIZE) as u64 + contents_len;
        let mut offsets = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            offsets.push(offset);
            let len = entry.source.len();
            let len = usize::try_from(len).map_err(|_| BuildError::TooLarge {
                size: offset.saturating_add(len),
            })?;
            offset += header::data_frame_size(len) as u64;
        }
        let total_size = offset + TAG_HEADER_SIZE as u64;

        if total_size > u64::from(u32::MAX) {
            return Err(BuildError::TooLarge { size: total_size });
        }
        Ok(Layout {
            // Both fit: they are bounded by total_size.
            contents_len: contents_len as u32,
            offsets: offsets.into_iter().map(|o| o as u32).collect(),
            total_size,
        })
    }

    /// Serialize every entry into `sink` and hand the sink back.
    pub fn write_to<W: Write>(&self, sink: W) -> Result<W, BuildError> {
        let layout = self.layout()?;
        let mut w = TagWriter::new(sink);

        // Header + Contents
        w.write_raw(&CAR_MAGIC)?;
        w.write_tag(Tag::Contents, layout.contents_len)?;
        w.write_u32(self.entries.len() as u32)?;
        for (entry, &offset) in self.entries.iter().zip(&layout.offsets) {
            w.write_u32(entry.kind.to_u32())?;
            w.write_u32(offset)?;
            w.write_string(&entry.name)?;
            trace!("car: layout {} -> offset {offset}", entry.name);
        }

        // Data
        for (entry, &offset) in self.entries.iter().zip(&layout.offsets) {
            check_position(&w, &entry.name, u64::from(offset))?;

            let len = entry.source.len();
            let payload_len = len as usize;
            w.write_tag(Tag::Data, header::data_frame_len(payload_len) as u32)?;
            match &entry.source {
                EntrySource::Bytes(bytes) => w.write_block(bytes)?,
                EntrySource::File { path, .. } => {
                    let file = File::open(path)?;
                    let produced = w.write_block_from(len as u32, BufReader::new(file))?;
                    if produced != len {
                        return Err(BuildError::PayloadSizeChanged {
                            name: entry.name.clone(),
                            expected: len,
                            actual: produced,
                        });
                    }
                }
            }
        }

        // EOF
        check_position(&w, "<eof>", layout.total_size - TAG_HEADER_SIZE as u64)?;
        w.write_tag(Tag::Eof, 0)?;
        w.flush()?;
        Ok(w.into_inner())
    }

    /// Serialize into a fresh buffer.
    pub fn to_vec(&self) -> Result<Vec<u8>, BuildError> {
        self.write_to(Vec::new())
    }
}

fn check_position<W: Write>(w: &TagWriter<W>, name: &str, expected: u64) -> Result<(), BuildError> {
    let actual = w.position();
    debug_assert_eq!(actual, expected, "layout invariant violated at '{name}'");
    if actual != expected {
        return Err(BuildError::LayoutMismatch {
            name: name.to_string(),
            expected,
            actual,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn single_entry_bytes_are_exact() {
        let mut b = ArchiveBuilder::new();
        b.add("x.lu", b"AAAA".to_vec());
        let bytes = b.to_vec().unwrap();

        let mut expected = Vec::new();
        expected.extend_from_slice(b"rac\x01");
        // CONTENTS, len = 4 + (4 + 4 + 4 + 8)
        expected.extend_from_slice(&1u32.to_le_bytes());
        expected.extend_from_slice(&24u32.to_le_bytes());
        expected.extend_from_slice(&1u32.to_le_bytes());
        expected.extend_from_slice(&0u32.to_le_bytes());
        expected.extend_from_slice(&36u32.to_le_bytes());
        expected.extend_from_slice(&4u32.to_le_bytes());
        expected.extend_from_slice(b"x.lu\0\0\0\0");
        // DATA at 36, len = 4 + 4
        expected.extend_from_slice(&2u32.to_le_bytes());
        expected.extend_from_slice(&8u32.to_le_bytes());
        expected.extend_from_slice(&4u32.to_le_bytes());
        expected.extend_from_slice(b"AAAA");
        // EOF
        expected.extend_from_slice(&u32::MAX.to_le_bytes());
        expected.extend_from_slice(&0u32.to_le_bytes());

        assert_eq!(bytes, expected);
    }

    #[test]
    fn layout_matches_written_size() {
        let mut b = ArchiveBuilder::new();
        b.add("a", vec![1; 1]);
        b.add("bb", vec![2; 6]);
        b.add("ccc", vec![3; 8]);
        let layout = b.layout().unwrap();
        let bytes = b.to_vec().unwrap();
        assert_eq!(bytes.len() as u64, layout.total_size);
        assert_eq!(layout.offsets.len(), 3);
        // Consecutive offsets are exactly one Data frame apart.
        for (pair, len) in layout.offsets.windows(2).zip([1usize, 6]) {
            assert_eq!((pair[1] - pair[0]) as usize, header::data_frame_size(len));
        }
        for &offset in &layout.offsets {
            assert_eq!(offset % 4, 0);
            let at = offset as usize;
            assert_eq!(&bytes[at..at + 4], &Tag::DATA.to_le_bytes());
        }
    }

    #[test]
    fn empty_archive() {
        let bytes = ArchiveBuilder::new().to_vec().unwrap();
        // header + contents frame + count + eof frame
        assert_eq!(bytes.len(), 4 + 8 + 4 + 8);
    }

    #[test]
    fn add_replaces_in_place() {
        let mut b = ArchiveBuilder::new();
        assert!(!b.add("a.lu", b"old".to_vec()));
        assert!(!b.add("b.lu", b"b".to_vec()));
        assert!(b.add("a.lu", b"new".to_vec()));
        assert_eq!(b.len(), 2);
        assert_eq!(b.names().collect::<Vec<_>>(), ["a.lu", "b.lu"]);
    }

    #[test]
    fn names_with_nul_are_rejected() {
        let mut b = ArchiveBuilder::new();
        b.add("bad\0name", Vec::new());
        assert!(matches!(b.to_vec(), Err(BuildError::InvalidName { .. })));

        let mut b = ArchiveBuilder::new();
        b.add("", Vec::new());
        assert!(matches!(b.layout(), Err(BuildError::InvalidName { .. })));
    }

    #[test]
    fn file_sources_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("main.lu");
        std::fs::write(&path, b"return 42").unwrap();

        let mut from_file = ArchiveBuilder::new();
        from_file.add_file("main.lu", &path).unwrap();
        let mut from_bytes = ArchiveBuilder::new();
        from_bytes.add("main.lu", b"return 42".to_vec());

        assert_eq!(from_file.to_vec().unwrap(), from_bytes.to_vec().unwrap());
    }

    #[test]
    fn file_growing_after_add_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grow.lu");
        std::fs::write(&path, b"1234").unwrap();

        let mut b = ArchiveBuilder::new();
        b.add_file("grow.lu", &path).unwrap();
        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(b"5678")
            .unwrap();

        let err = b.to_vec().unwrap_err();
        assert!(err.is_layout_violation());
        assert!(matches!(
            err,
            BuildError::PayloadSizeChanged {
                expected: 4,
                actual: 5,
                ..
            }
        ));
    }

    #[test]
    fn file_shrinking_after_add_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shrink.lu");
        std::fs::write(&path, b"12345678").unwrap();

        let mut b = ArchiveBuilder::new();
        b.add_file("shrink.lu", &path).unwrap();
        std::fs::write(&path, b"12").unwrap();

        let err = b.to_vec().unwrap_err();
        assert!(matches!(
            err,
            BuildError::PayloadSizeChanged {
                expected: 8,
                actual: 2,
                ..
            }
        ));
    }

    #[test]
    fn oversized_archive_is_rejected_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("huge.bin");
        let file = std::fs::File::create(&path).unwrap();
        // Sparse; nothing is read because layout fails first.
        file.set_len(u64::from(u32::MAX)).unwrap();

        let mut b = ArchiveBuilder::new();
        b.add_file("huge.bin", &path).unwrap();
        assert!(matches!(b.layout(), Err(BuildError::TooLarge { .. })));

        let mut sink = Vec::new();
        assert!(b.write_to(&mut sink).is_err());
        assert!(sink.is_empty());
    }

    #[test]
    fn kind_is_recorded() {
        let mut b = ArchiveBuilder::with_kind(ResourceKind::Other(9));
        b.add("asset.bin", vec![0xAB]);
        let bytes = b.to_vec().unwrap();
        assert_eq!(&bytes[16..20], &9u32.to_le_bytes());
    }
}
