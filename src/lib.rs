//! grove - git-compatible object storage
//!
//! reads and writes repositories in the formats git itself uses on disk:
//! zlib-compressed loose objects, packfiles with offset and reference
//! deltas, version 2 pack indexes, the DIRC staging index and loose plus
//! packed refs.
//!
//! # Core concepts
//!
//! - **ObjectId**: SHA-1 (or SHA-256) of `"<type> <len>\0" + payload`
//! - **Odb**: loose objects, packs and alternates behind one lookup that
//!   falls back past a backend holding a damaged copy
//! - **Index**: the staging area, including merge conflict stages
//! - **RefStore**: branches, tags and symbolic refs, updated with
//!   compare-and-swap under `<ref>.lock`
//!
//! # Layout
//!
//! ```text
//! <repo>/config.toml
//! <repo>/HEAD
//! <repo>/index
//! <repo>/objects/xx/yyyy...
//! <repo>/objects/pack/pack-<checksum>.{pack,idx}
//! <repo>/objects/info/alternates
//! <repo>/refs/{heads,tags}/...
//! <repo>/packed-refs
//! ```
//!
//! # Example usage
//!
//! ```no_run
//! use grove::{ops, IndexEntry, Repo};
//! use grove::types::{EntryMode, Signature};
//! use std::path::Path;
//!
//! let repo = Repo::init(Path::new("/path/to/repo")).unwrap();
//!
//! let blob = repo.odb().write_blob(b"hello\n").unwrap();
//! repo.index().add(IndexEntry::new("README", EntryMode::Blob, blob)).unwrap();
//! repo.index().write().unwrap();
//!
//! let me = Signature::parse("A U Thor <author@example.com> 1112911993 -0700").unwrap();
//! let commit = ops::commit(&repo, "initial\n", &me, &me).unwrap();
//! assert_eq!(repo.head().unwrap(), commit);
//! ```

mod config;
mod error;
mod hash;
mod lock;
mod repo;

pub mod fs;
pub mod index;
pub mod object;
pub mod odb;
pub mod ops;
pub mod pack;
pub mod refs;
pub mod types;

pub use config::{Config, CoreConfig};
pub use error::{Error, ErrorKind, IoResultExt, Result};
pub use hash::{digest, hash_object, object_header, HashKind, HashWriter, Hasher, ObjectId, Prefix};
pub use index::{Conflict, Index, IndexEntry, Stage};
pub use lock::LockFile;
pub use odb::{Backend, Odb};
pub use refs::{RefStore, RefTarget, Reference};
pub use repo::{Repo, RepoLock};
pub use types::RawObject;
