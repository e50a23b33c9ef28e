//! Rescar: the CAR resource archive format in Rust.
//!
//! A CAR file bundles named byte blobs (compiled script chunks and other
//! assets) behind a small index, and serves them straight out of a
//! memory-mapped buffer without copying.
//!
//! The crate provides:
//! - Format primitives (`format`)
//! - Archive construction (`builder`)
//! - Opening and by-name lookup (`archive`)
//! - File-level build/extract/list helpers (`io`)
//! - Script module resolution over archives (`loader`)
//! - An optional CLI (`cli` feature)
//!
//! # Quick Start
//!
//! ```
//! use rescar::archive::ArchiveIndex;
//! use rescar::builder::ArchiveBuilder;
//!
//! let mut builder = ArchiveBuilder::new();
//! builder.add("main.lu", b"print('hello')".to_vec());
//! let bytes = builder.to_vec().unwrap();
//!
//! let archive = ArchiveIndex::open(&bytes[..]).unwrap();
//! assert_eq!(archive.lookup("main.lu").unwrap(), Some(&b"print('hello')"[..]));
//! assert_eq!(archive.lookup("missing.lu").unwrap(), None);
//! ```

pub mod archive;
pub mod builder;
pub mod format;
pub mod io;
pub mod loader;

#[cfg(feature = "cli")]
pub mod cli;

pub use archive::{Archive, ArchiveIndex, LookupError, OpenError};
pub use builder::{ArchiveBuilder, BuildError};
