// Opened archives: header validation, the one-time Contents scan, and
// by-name lookup of Data frames.
//
// The index never copies entry names or payloads. Names are kept as spans
// into the backing buffer and payloads are returned as sub-slices of it, so
// an archive opened from a mapping serves every lookup straight from the
// page cache.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use log::{debug, trace, warn};

use crate::format::header::{
    self, HEADER_SIZE, ResourceKind, TAG_HEADER_SIZE, Tag, U32_SIZE, contents_record_size,
};
use crate::format::reader::{ByteReader, ReadError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Ways the bytes of an archive can disagree with its own index.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Corruption {
    #[error(transparent)]
    Read(#[from] ReadError),
    #[error("name of entry {index} is not valid UTF-8")]
    InvalidName { index: u32 },
    #[error("contents frame declares {declared} bytes but its records span {consumed}")]
    ContentsLength { declared: u32, consumed: usize },
    #[error("expected a DATA frame, found {tag}")]
    NotData { tag: Tag },
    #[error("data frame declares {declared} bytes for a {payload}-byte payload")]
    FrameLength { declared: u32, payload: usize },
    #[error("first data frame should start at {expected}, index says {found}")]
    Misplaced { expected: usize, found: u32 },
    #[error("data frame ends at {end} but the next entry starts at {next}")]
    Chain { end: usize, next: u32 },
    #[error("expected EOF after the last data frame, found {found}")]
    MissingEof { found: Tag },
}

/// Failure to open an archive.
#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Header signature or version mismatch, or a buffer too short to hold one.
    #[error("not a car archive")]
    NotAnArchive,
    /// The top-level frame is not the Contents section. Writers of this
    /// format never produce anything else there.
    #[error("unexpected top-level section {tag}")]
    UnexpectedSection { tag: Tag },
    #[error("archive index is corrupted: {0}")]
    Corrupted(#[from] Corruption),
}

impl From<ReadError> for OpenError {
    fn from(e: ReadError) -> Self {
        Self::Corrupted(Corruption::Read(e))
    }
}

/// Failure to resolve a named entry that is present in the index.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LookupError {
    #[error("archive is corrupted. could not resolve resource ({name}): {reason}")]
    Corrupted { name: String, reason: Corruption },
}

// ---------------------------------------------------------------------------
// Backing storage
// ---------------------------------------------------------------------------

/// How a path-opened archive holds its bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// Memory-map the file. Falls back to `Read` when the `mmap` feature is off.
    Map,
    /// Read the whole file into an owned buffer.
    Read,
}

impl Default for LoadMode {
    fn default() -> Self {
        if cfg!(feature = "mmap") {
            LoadMode::Map
        } else {
            LoadMode::Read
        }
    }
}

/// Options for opening an archive from a path.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenOptions {
    pub load: LoadMode,
}

/// Bytes behind a path-opened archive. The mapping is released on drop.
#[derive(Debug)]
pub enum Backing {
    Owned(Vec<u8>),
    #[cfg(feature = "mmap")]
    Mapped(memmap2::Mmap),
}

impl Backing {
    pub fn is_mapped(&self) -> bool {
        match self {
            Backing::Owned(_) => false,
            #[cfg(feature = "mmap")]
            Backing::Mapped(_) => true,
        }
    }
}

impl AsRef<[u8]> for Backing {
    fn as_ref(&self) -> &[u8] {
        match self {
            Backing::Owned(v) => v,
            #[cfg(feature = "mmap")]
            Backing::Mapped(m) => m,
        }
    }
}

/// An archive opened from a file or an owned buffer.
pub type Archive = ArchiveIndex<Backing>;

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct Entry {
    kind: ResourceKind,
    offset: u32,
    name_start: usize,
    name_len: usize,
}

/// Borrowed view of one index record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryRef<'a> {
    pub kind: ResourceKind,
    /// Absolute position of the entry's Data frame.
    pub offset: u32,
    pub name: &'a str,
}

/// One line of an archive listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListEntry<'a> {
    pub name: &'a str,
    pub length: usize,
}

// ---------------------------------------------------------------------------
// ArchiveIndex
// ---------------------------------------------------------------------------

/// Index of an archive held in `B`.
///
/// Built once by [`ArchiveIndex::open`]; immutable afterwards. Lookups take
/// `&self` and keep their cursor on the stack, so a shared index needs no
/// locking.
pub struct ArchiveIndex<B> {
    bytes: B,
    entries: Vec<Entry>,
    data_start: usize,
}

impl<B: AsRef<[u8]>> ArchiveIndex<B> {
    /// Validate the header and scan the Contents section.
    ///
    /// Data frames are not touched until they are looked up.
    pub fn open(bytes: B) -> Result<Self, OpenError> {
        let (entries, data_start) = scan_contents(bytes.as_ref())?;
        Ok(Self {
            bytes,
            entries,
            data_start,
        })
    }

    /// The full archive buffer.
    pub fn as_bytes(&self) -> &[u8] {
        self.bytes.as_ref()
    }

    pub fn backing(&self) -> &B {
        &self.bytes
    }

    pub fn into_backing(self) -> B {
        self.bytes
    }

    /// Number of entries in the index.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Position of the first Data frame (end of the Contents section).
    pub fn data_start(&self) -> usize {
        self.data_start
    }

    fn name_of(&self, entry: &Entry) -> &str {
        let raw = &self.as_bytes()[entry.name_start..entry.name_start + entry.name_len];
        // Validated in `scan_contents`.
        std::str::from_utf8(raw).unwrap_or_default()
    }

    fn view(&self, entry: &Entry) -> EntryRef<'_> {
        EntryRef {
            kind: entry.kind,
            offset: entry.offset,
            name: self.name_of(entry),
        }
    }

    pub fn entry(&self, index: usize) -> Option<EntryRef<'_>> {
        self.entries.get(index).map(|e| self.view(e))
    }

    /// Index records in archive order.
    pub fn entries(&self) -> impl ExactSizeIterator<Item = EntryRef<'_>> + '_ {
        self.entries.iter().map(|e| self.view(e))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|e| self.name_of(e) == name)
    }

    /// Payload of the entry named `name`.
    ///
    /// `Ok(None)` means no entry has that name; callers are expected to fall
    /// back to other resolution strategies. When several entries share the
    /// name, the first one that resolves cleanly wins.
    pub fn lookup(&self, name: &str) -> Result<Option<&[u8]>, LookupError> {
        let mut failure = None;
        for (index, entry) in self.entries.iter().enumerate() {
            if self.name_of(entry) != name {
                continue;
            }
            match self.resolve(index, entry) {
                Ok(bytes) => return Ok(Some(bytes)),
                Err(e) => {
                    debug!("car: entry {index} ({name}) is corrupted: {e}");
                    failure.get_or_insert(e);
                }
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }

    /// Payload of the entry at position `index` in the index, or `Ok(None)`
    /// past the end.
    ///
    /// Besides checking the Data tag, this verifies the frame is exactly
    /// where both of its neighbours say it is, so a damaged offset fails here
    /// instead of returning another frame's bytes.
    pub fn payload_at(&self, index: usize) -> Result<Option<&[u8]>, LookupError> {
        match self.entries.get(index) {
            Some(entry) => self.resolve(index, entry).map(Some),
            None => Ok(None),
        }
    }

    fn resolve(&self, index: usize, entry: &Entry) -> Result<&[u8], LookupError> {
        self.read_payload(index, entry)
            .map_err(|reason| LookupError::Corrupted {
                name: self.name_of(entry).to_string(),
                reason,
            })
    }

    fn read_payload(&self, index: usize, entry: &Entry) -> Result<&[u8], Corruption> {
        let bytes = self.as_bytes();
        let offset = entry.offset as usize;

        // The frame must start where the previous one ends.
        match index.checked_sub(1).and_then(|i| self.entries.get(i)) {
            None if offset != self.data_start => {
                return Err(Corruption::Misplaced {
                    expected: self.data_start,
                    found: entry.offset,
                });
            }
            None => {}
            Some(prev) => {
                // Only the previous frame's header is trusted here, so a
                // damaged payload in front does not hide this entry.
                let (_, prev_len) = ByteReader::at(bytes, prev.offset as usize)?.read_tag()?;
                let end = u64::from(prev.offset) + TAG_HEADER_SIZE as u64 + u64::from(prev_len);
                if end != u64::from(entry.offset) {
                    return Err(Corruption::Chain {
                        end: usize::try_from(end).unwrap_or(usize::MAX),
                        next: entry.offset,
                    });
                }
            }
        }

        // ...and end where the next one starts.
        let (payload, end) = data_frame(bytes, offset)?;
        match self.entries.get(index + 1) {
            Some(next) if next.offset as usize != end => Err(Corruption::Chain {
                end,
                next: next.offset,
            }),
            Some(_) => Ok(payload),
            None => {
                let (found, _) = ByteReader::at(bytes, end)?.read_tag()?;
                if found == Tag::Eof {
                    Ok(payload)
                } else {
                    Err(Corruption::MissingEof { found })
                }
            }
        }
    }

    /// `(name, length)` for every entry, in index order.
    ///
    /// Entries whose Data frame cannot be resolved are reported with a
    /// warning and left out.
    pub fn list(&self) -> Vec<ListEntry<'_>> {
        let mut out = Vec::with_capacity(self.entries.len());
        for (index, entry) in self.entries.iter().enumerate() {
            match self.resolve(index, entry) {
                Ok(payload) => out.push(ListEntry {
                    name: self.name_of(entry),
                    length: payload.len(),
                }),
                Err(e) => warn!("car: {e}"),
            }
        }
        out
    }
}

impl ArchiveIndex<Backing> {
    /// Open an archive file with the default load mode (mapped when available).
    pub fn open_path(path: &Path) -> Result<Self, OpenError> {
        Self::open_path_with(path, OpenOptions::default())
    }

    /// Open an archive file by reading it into memory.
    pub fn read_path(path: &Path) -> Result<Self, OpenError> {
        Self::open_path_with(
            path,
            OpenOptions {
                load: LoadMode::Read,
            },
        )
    }

    /// Index an owned buffer.
    pub fn from_vec(bytes: Vec<u8>) -> Result<Self, OpenError> {
        Self::open(Backing::Owned(bytes))
    }

    pub fn open_path_with(path: &Path, opts: OpenOptions) -> Result<Self, OpenError> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();

        // Files too short to be archives are never mapped; zero-length
        // mappings are not portable.
        let backing = if opts.load == LoadMode::Map && size > HEADER_SIZE as u64 {
            map_file(&file)?
        } else {
            let mut buf = Vec::with_capacity(usize::try_from(size).unwrap_or(0));
            (&file).read_to_end(&mut buf)?;
            Backing::Owned(buf)
        };

        let archive = Self::open(backing)?;
        debug!(
            "car: opened {} ({size} bytes, {} entries, mapped: {})",
            path.display(),
            archive.len(),
            archive.backing().is_mapped()
        );
        Ok(archive)
    }
}

#[cfg(feature = "mmap")]
fn map_file(file: &File) -> io::Result<Backing> {
    // SAFETY: the mapping is read-only and owned by the returned Backing.
    // Archives are write-once; callers must not truncate a file while an
    // index over it is alive.
    let map = unsafe { memmap2::Mmap::map(file)? };
    Ok(Backing::Mapped(map))
}

#[cfg(not(feature = "mmap"))]
fn map_file(mut file: &File) -> io::Result<Backing> {
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(Backing::Owned(buf))
}

/// Payload of the Data frame at `offset` and the position just past it.
fn data_frame(bytes: &[u8], offset: usize) -> Result<(&[u8], usize), Corruption> {
    let mut reader = ByteReader::at(bytes, offset)?;
    let (tag, frame_len) = reader.read_tag()?;
    if tag != Tag::Data {
        return Err(Corruption::NotData { tag });
    }
    let payload = reader.read_block()?;
    if frame_len as usize != header::data_frame_len(payload.len()) {
        return Err(Corruption::FrameLength {
            declared: frame_len,
            payload: payload.len(),
        });
    }
    Ok((payload, reader.position()))
}

// ---------------------------------------------------------------------------
// Contents scan
// ---------------------------------------------------------------------------

/// Smallest encoded Contents record: kind, offset and an empty name.
const MIN_RECORD_SIZE: usize = contents_record_size(0);

fn scan_contents(bytes: &[u8]) -> Result<(Vec<Entry>, usize), OpenError> {
    if !header::has_car_magic(bytes) {
        return Err(OpenError::NotAnArchive);
    }

    let mut reader = ByteReader::at(bytes, HEADER_SIZE)?;
    let (tag, contents_len) = reader.read_tag()?;
    if tag != Tag::Contents {
        return Err(OpenError::UnexpectedSection { tag });
    }
    let body_start = reader.position();

    let count = reader.read_u32()?;
    let capacity = (count as usize).min(reader.remaining() / MIN_RECORD_SIZE);
    let mut entries = Vec::with_capacity(capacity);
    for index in 0..count {
        let kind = ResourceKind::from_u32(reader.read_u32()?);
        let offset = reader.read_u32()?;
        let name_start = reader.position() + U32_SIZE;
        let name = reader.read_string()?;
        if std::str::from_utf8(name).is_err() {
            return Err(Corruption::InvalidName { index }.into());
        }
        trace!("car: entry {index}: kind={kind} offset={offset} name_len={}", name.len());
        entries.push(Entry {
            kind,
            offset,
            name_start,
            name_len: name.len(),
        });
    }

    let consumed = reader.position() - body_start;
    if consumed != contents_len as usize {
        return Err(Corruption::ContentsLength {
            declared: contents_len,
            consumed,
        }
        .into());
    }

    Ok((entries, HEADER_SIZE + TAG_HEADER_SIZE + consumed))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
