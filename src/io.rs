// File-level archive operations.
//
// Provides `build_archive()`, `extract_archive()` and `list_archive()`, the
// path-based counterparts of `ArchiveBuilder` and `ArchiveIndex`. Builds stage
// every input in a scratch directory first so that updating an archive and
// creating one go through the same code path, and the finished archive is
// renamed over the destination only once it has been written completely.

use std::fs;
use std::io::{self, BufWriter};
use std::path::{Component, Path, PathBuf};

use log::{debug, info, warn};

use crate::archive::{Archive, ArchiveIndex, OpenError, OpenOptions};
use crate::builder::{ArchiveBuilder, BuildError};
use crate::format::header::ResourceKind;

// ---------------------------------------------------------------------------
// Options and stats
// ---------------------------------------------------------------------------

/// Options for `build_archive()`.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Kind recorded for every entry.
    pub kind: ResourceKind,
    /// Directory under which the scratch directory is created. `None` uses
    /// the OS temp dir.
    pub scratch_root: Option<PathBuf>,
    /// How an existing destination archive is read before it is rebuilt.
    pub open: OpenOptions,
}

/// Statistics returned by `build_archive()`.
#[derive(Debug, Clone, Default)]
pub struct BuildStats {
    /// Entries in the written archive.
    pub entries: usize,
    /// Entries carried over from the previous archive.
    pub preserved: usize,
    /// Sources staged from the argument list.
    pub added: usize,
    /// Sources that replaced an entry already staged under the same name.
    pub replaced: usize,
    /// Sources that could not be read and were left out.
    pub skipped: Vec<PathBuf>,
    /// Entries of the previous archive that could not be carried over.
    pub dropped: usize,
    /// Size of the written archive in bytes.
    pub archive_size: u64,
}

/// Statistics returned by `extract_archive()` and `extract_all()`.
#[derive(Debug, Clone, Default)]
pub struct ExtractStats {
    /// Files written, in archive order.
    pub files: Vec<String>,
    /// Payload bytes written.
    pub bytes_written: u64,
    /// Entries left out: corrupted, unsafe name, or failed write.
    pub skipped: usize,
}

/// One line of `list_archive()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedEntry {
    pub name: String,
    pub length: usize,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Error type for file-level archive operations.
#[derive(Debug)]
pub enum IoError {
    /// I/O error (scratch dir, extraction dir, file copy).
    Io(io::Error),
    /// The archive could not be opened.
    Open(OpenError),
    /// The archive could not be built.
    Build(BuildError),
}

impl IoError {
    /// True when a build hit an internal layout inconsistency.
    pub fn is_layout_violation(&self) -> bool {
        matches!(self, Self::Build(e) if e.is_layout_violation())
    }
}

impl std::fmt::Display for IoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Open(e) => write!(f, "{e}"),
            Self::Build(e) => write!(f, "build error: {e}"),
        }
    }
}

impl std::error::Error for IoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Open(e) => Some(e),
            Self::Build(e) => Some(e),
        }
    }
}

impl From<io::Error> for IoError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<OpenError> for IoError {
    fn from(e: OpenError) -> Self {
        Self::Open(e)
    }
}

impl From<BuildError> for IoError {
    fn from(e: BuildError) -> Self {
        Self::Build(e)
    }
}

// ---------------------------------------------------------------------------
// Default buffer size
// ---------------------------------------------------------------------------

const BUF_SIZE: usize = 64 * 1024; // 64 KiB

// ---------------------------------------------------------------------------
// build_archive
// ---------------------------------------------------------------------------

/// Create `destination` from `sources`, or update it if it already exists.
///
/// Entries of an existing archive are kept in their order; each source is
/// stored under its base name, replacing an entry of the same name in place
/// or being appended after the existing ones. A source that cannot be read
/// is reported with a warning and recorded in [`BuildStats::skipped`].
///
/// An existing destination that is not a readable archive is never
/// overwritten.
pub fn build_archive<P: AsRef<Path>>(
    destination: &Path,
    sources: &[P],
    opts: &BuildOptions,
) -> Result<BuildStats, IoError> {
    let scratch = scratch_dir(opts)?;
    let mut stats = BuildStats::default();
    let mut staged: Vec<String> = Vec::new();

    if destination.exists() {
        let existing = Archive::open_path_with(destination, opts.open).map_err(|source| {
            BuildError::Existing {
                path: destination.to_path_buf(),
                source,
            }
        })?;
        let extracted = extract_all(&existing, scratch.path())?;
        stats.preserved = extracted.files.len();
        stats.dropped = extracted.skipped;
        if stats.dropped > 0 {
            warn!(
                "car: {} entries of {} could not be carried over",
                stats.dropped,
                destination.display()
            );
        }
        staged = extracted.files;
        // Release the mapping before the destination is replaced.
        drop(existing);
        debug!(
            "car: staged {} existing entries from {}",
            stats.preserved,
            destination.display()
        );
    }

    for source in sources {
        let source = source.as_ref();
        let Some(name) = base_name(source) else {
            warn!("car: no usable file name in '{}', skipped", source.display());
            stats.skipped.push(source.to_path_buf());
            continue;
        };
        if let Err(e) = fs::copy(source, scratch.path().join(&name)) {
            warn!("car: cannot open '{}' for reading: {e}", source.display());
            stats.skipped.push(source.to_path_buf());
            continue;
        }
        stats.added += 1;
        if staged.contains(&name) {
            stats.replaced += 1;
        } else {
            staged.push(name);
        }
    }

    let mut builder = ArchiveBuilder::with_kind(opts.kind);
    for name in &staged {
        builder.add_file(name.as_str(), &scratch.path().join(name))?;
    }
    stats.entries = builder.len();
    stats.archive_size = write_destination(&builder, destination)?;

    info!(
        "car: wrote {} ({} entries, {} bytes)",
        destination.display(),
        stats.entries,
        stats.archive_size
    );
    Ok(stats)
}

fn scratch_dir(opts: &BuildOptions) -> io::Result<tempfile::TempDir> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("car-");
    match &opts.scratch_root {
        Some(root) => builder.tempdir_in(root),
        None => builder.tempdir(),
    }
}

/// Write the archive into a sibling temp file, then rename it over
/// `destination`. On any failure the temp file is removed and the previous
/// destination, if any, is untouched.
fn write_destination(builder: &ArchiveBuilder, destination: &Path) -> Result<u64, IoError> {
    let unwritable = |source: io::Error| BuildError::DestinationUnwritable {
        path: destination.to_path_buf(),
        source,
    };

    let parent = match destination.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp_builder = tempfile::Builder::new();
    tmp_builder.prefix(".car-");
    // Temp files default to 0600; give the archive ordinary file permissions
    // (still filtered by the umask).
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp_builder.permissions(fs::Permissions::from_mode(0o666));
    }
    let tmp = tmp_builder.tempfile_in(parent).map_err(unwritable)?;

    let writer = BufWriter::with_capacity(BUF_SIZE, tmp);
    let writer = match builder.write_to(writer) {
        Ok(w) => w,
        Err(e) => {
            if e.is_layout_violation() {
                warn!("car: {e}; partial output removed");
            }
            return Err(e.into());
        }
    };
    let tmp = writer.into_inner().map_err(|e| e.into_error())?;
    let size = tmp.as_file().metadata()?.len();
    tmp.persist(destination).map_err(|e| unwritable(e.error))?;
    Ok(size)
}

/// Final path component as UTF-8, or `None` if there is none.
fn base_name(path: &Path) -> Option<String> {
    path.file_name()?.to_str().map(str::to_string)
}

// ---------------------------------------------------------------------------
// extract
// ---------------------------------------------------------------------------

/// Extract every entry of the archive at `archive` into `dir`.
pub fn extract_archive(
    dir: &Path,
    archive: &Path,
    opts: OpenOptions,
) -> Result<ExtractStats, IoError> {
    let index = Archive::open_path_with(archive, opts)?;
    Ok(extract_all(&index, dir)?)
}

/// Write each entry of `index` to `dir/<name>`, creating `dir` if needed.
///
/// Corrupted entries, names that would escape `dir`, and files that cannot
/// be written are skipped with a warning. Only the directory creation itself
/// is fatal.
pub fn extract_all<B: AsRef<[u8]>>(
    index: &ArchiveIndex<B>,
    dir: &Path,
) -> io::Result<ExtractStats> {
    fs::create_dir_all(dir)?;
    let mut stats = ExtractStats::default();

    for (i, entry) in index.entries().enumerate() {
        if !is_safe_entry_name(entry.name) {
            warn!("car: refusing to extract unsafe name {:?}", entry.name);
            stats.skipped += 1;
            continue;
        }
        let payload = match index.payload_at(i) {
            Ok(Some(p)) => p,
            Ok(None) => break,
            Err(e) => {
                warn!("car: {e}");
                stats.skipped += 1;
                continue;
            }
        };
        if let Err(e) = fs::write(dir.join(entry.name), payload) {
            warn!("car: could not write '{}': {e}", entry.name);
            stats.skipped += 1;
            continue;
        }
        stats.bytes_written += payload.len() as u64;
        if !stats.files.iter().any(|f| f == entry.name) {
            stats.files.push(entry.name.to_string());
        }
    }
    Ok(stats)
}

/// An entry name may only become a single plain file name inside the
/// extraction directory.
pub fn is_safe_entry_name(name: &str) -> bool {
    if name.is_empty() || name.contains(['/', '\\', '\0']) {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

// ---------------------------------------------------------------------------
// list
// ---------------------------------------------------------------------------

/// `(name, length)` of every resolvable entry of the archive at `archive`.
pub fn list_archive(archive: &Path, opts: OpenOptions) -> Result<Vec<ListedEntry>, IoError> {
    let index = Archive::open_path_with(archive, opts)?;
    Ok(index
        .list()
        .into_iter()
        .map(|e| ListedEntry {
            name: e.name.to_string(),
            length: e.length,
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
