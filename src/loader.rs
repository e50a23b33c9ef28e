// Script module resolution over archives and directories.
//
// A module name such as `game.level1` is looked up as the archive entry
// `game.level1.lu`. Sources are tried in order; a miss on one source is not
// an error until every source has missed, at which point the caller gets the
// full list of places that were tried.

use std::borrow::Cow;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, trace, warn};

use crate::archive::{ArchiveIndex, LookupError};
use crate::format::header::SCRIPT_EXTENSION;

/// Entry name under which module `module` is stored.
pub fn module_file_name(module: &str) -> String {
    format!("{module}.{SCRIPT_EXTENSION}")
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// No source had the module. `tried` holds one message per source.
    #[error("module '{module}' not found:{}", format_tried(tried))]
    NotFound { module: String, tried: Vec<String> },
    #[error(transparent)]
    Corrupted(#[from] LookupError),
    #[error("cannot read module '{module}' from {}: {source}", path.display())]
    Io {
        module: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn format_tried(tried: &[String]) -> String {
    tried.iter().map(|t| format!("\n\t{t}")).collect()
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// Something modules can be loaded from.
pub trait ModuleSource {
    /// Bytes of `module`, or `Ok(None)` if this source does not have it.
    fn load(&self, module: &str) -> Result<Option<Cow<'_, [u8]>>, LoadError>;

    /// Message recorded when `module` is not found here.
    fn describe_miss(&self, module: &str) -> String;

    /// Short label for logs.
    fn describe(&self) -> String;
}

impl<B: AsRef<[u8]>> ModuleSource for ArchiveIndex<B> {
    fn load(&self, module: &str) -> Result<Option<Cow<'_, [u8]>>, LoadError> {
        let name = module_file_name(module);
        Ok(self.lookup(&name)?.map(Cow::Borrowed))
    }

    fn describe_miss(&self, module: &str) -> String {
        format!(
            "resource ({}) does not exist in archive",
            module_file_name(module)
        )
    }

    fn describe(&self) -> String {
        format!("archive ({} entries)", self.len())
    }
}

/// Loose `.lu` files in a directory.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, module: &str) -> PathBuf {
        self.root.join(module_file_name(module))
    }
}

impl ModuleSource for DirectorySource {
    fn load(&self, module: &str) -> Result<Option<Cow<'_, [u8]>>, LoadError> {
        if !crate::io::is_safe_entry_name(&module_file_name(module)) {
            return Ok(None);
        }
        let path = self.path_for(module);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(Cow::Owned(bytes))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(LoadError::Io {
                module: module.to_string(),
                path,
                source,
            }),
        }
    }

    fn describe_miss(&self, module: &str) -> String {
        format!("no file '{}'", self.path_for(module).display())
    }

    fn describe(&self) -> String {
        format!("directory {}", self.root.display())
    }
}

// ---------------------------------------------------------------------------
// ModuleResolver
// ---------------------------------------------------------------------------

/// A module found by [`ModuleResolver::resolve`].
#[derive(Debug)]
pub struct Resolved<'a> {
    pub bytes: Cow<'a, [u8]>,
    /// Position of the source that had it.
    pub source: usize,
}

/// Ordered chain of module sources.
#[derive(Default)]
pub struct ModuleResolver<'s> {
    sources: Vec<Box<dyn ModuleSource + Send + Sync + 's>>,
}

impl<'s> ModuleResolver<'s> {
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
        }
    }

    /// Append a source; earlier sources take precedence.
    pub fn push(&mut self, source: impl ModuleSource + Send + Sync + 's) -> &mut Self {
        self.sources.push(Box::new(source));
        self
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// First source's bytes for `module`.
    ///
    /// A corrupted archive entry counts as a miss with its own message, so a
    /// later source can still provide the module. If none does, the first
    /// corruption is returned instead of `NotFound`.
    pub fn resolve(&self, module: &str) -> Result<Resolved<'_>, LoadError> {
        let mut tried = Vec::with_capacity(self.sources.len());
        let mut corrupted = None;
        for (i, source) in self.sources.iter().enumerate() {
            match source.load(module) {
                Ok(Some(bytes)) => {
                    debug!(
                        "car: module '{module}' resolved from {}",
                        source.describe()
                    );
                    return Ok(Resolved { bytes, source: i });
                }
                Ok(None) => {
                    trace!("car: module '{module}' not in {}", source.describe());
                    tried.push(source.describe_miss(module));
                }
                Err(LoadError::Corrupted(e)) => {
                    warn!("car: {e}");
                    tried.push(e.to_string());
                    corrupted.get_or_insert(e);
                }
                Err(e) => return Err(e),
            }
        }
        match corrupted {
            Some(e) => Err(LoadError::Corrupted(e)),
            None => Err(LoadError::NotFound {
                module: module.to_string(),
                tried,
            }),
        }
    }
}

impl std::fmt::Debug for ModuleResolver<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.sources.iter().map(|s| s.describe()))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ArchiveBuilder;

    fn archive_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut b = ArchiveBuilder::new();
        for (name, bytes) in entries {
            b.add(*name, bytes.to_vec());
        }
        b.to_vec().unwrap()
    }

    #[test]
    fn module_names_get_the_script_extension() {
        assert_eq!(module_file_name("main"), "main.lu");
        assert_eq!(module_file_name("game.level1"), "game.level1.lu");
    }

    #[test]
    fn archive_source_is_zero_copy() {
        let bytes = archive_bytes(&[("main.lu", b"chunk")]);
        let index = ArchiveIndex::open(&bytes[..]).unwrap();
        let loaded = index.load("main").unwrap().unwrap();
        assert!(matches!(loaded, Cow::Borrowed(_)));
        assert_eq!(&*loaded, b"chunk");
        assert!(index.load("other").unwrap().is_none());
    }

    #[test]
    fn resolver_tries_sources_in_order() {
        let first = archive_bytes(&[("a.lu", b"from-first")]);
        let second = archive_bytes(&[("a.lu", b"from-second"), ("b.lu", b"b")]);
        let first = ArchiveIndex::open(&first[..]).unwrap();
        let second = ArchiveIndex::open(&second[..]).unwrap();

        let mut resolver = ModuleResolver::new();
        resolver.push(first).push(second);
        assert_eq!(resolver.len(), 2);

        let a = resolver.resolve("a").unwrap();
        assert_eq!(&*a.bytes, b"from-first");
        assert_eq!(a.source, 0);
        let b = resolver.resolve("b").unwrap();
        assert_eq!(b.source, 1);
    }

    #[test]
    fn miss_lists_every_source() {
        let bytes = archive_bytes(&[("a.lu", b"a")]);
        let dir = tempfile::tempdir().unwrap();
        let mut resolver = ModuleResolver::new();
        resolver
            .push(ArchiveIndex::open(&bytes[..]).unwrap())
            .push(DirectorySource::new(dir.path()));

        let err = resolver.resolve("nope").unwrap_err();
        match &err {
            LoadError::NotFound { module, tried } => {
                assert_eq!(module, "nope");
                assert_eq!(tried.len(), 2);
                assert_eq!(tried[0], "resource (nope.lu) does not exist in archive");
                assert!(tried[1].starts_with("no file '"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.to_string().contains("does not exist in archive"));
    }

    #[test]
    fn directory_source_reads_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("util.lu"), b"util chunk").unwrap();
        let source = DirectorySource::new(dir.path());
        assert_eq!(source.root(), dir.path());
        let loaded = source.load("util").unwrap().unwrap();
        assert!(matches!(loaded, Cow::Owned(_)));
        assert_eq!(&*loaded, b"util chunk");
        assert!(source.load("absent").unwrap().is_none());
        assert!(source.load("../escape").unwrap().is_none());
    }

    fn corrupted_archive(name: &str) -> Vec<u8> {
        let mut bytes = archive_bytes(&[(name, b"payload")]);
        let data = ArchiveIndex::open(&bytes[..]).unwrap().data_start();
        bytes[data] = 0x55;
        bytes
    }

    #[test]
    fn corrupted_entry_falls_back_to_later_source() {
        let bytes = corrupted_archive("m.lu");
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("m.lu"), b"fallback").unwrap();

        let mut resolver = ModuleResolver::new();
        resolver
            .push(ArchiveIndex::open(&bytes[..]).unwrap())
            .push(DirectorySource::new(dir.path()));
        let found = resolver.resolve("m").unwrap();
        assert_eq!(&*found.bytes, b"fallback");
        assert_eq!(found.source, 1);
    }

    #[test]
    fn corrupted_entry_is_reported_when_nothing_else_has_it() {
        let bytes = corrupted_archive("m.lu");
        let dir = tempfile::tempdir().unwrap();

        let mut resolver = ModuleResolver::new();
        resolver
            .push(ArchiveIndex::open(&bytes[..]).unwrap())
            .push(DirectorySource::new(dir.path()));
        let err = resolver.resolve("m").unwrap_err();
        assert!(matches!(err, LoadError::Corrupted(_)));
        assert!(
            err.to_string()
                .starts_with("archive is corrupted. could not resolve resource (m.lu)")
        );
    }
}
