use std::path::PathBuf;

use crate::hash::ObjectId;

/// error type for grove operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("repository not found at {0}")]
    NoRepo(PathBuf),

    #[error("repository already exists at {0}")]
    RepoExists(PathBuf),

    #[error("object not found: {0}")]
    ObjectNotFound(ObjectId),

    #[error("no object matches prefix {0}")]
    PrefixNotFound(String),

    #[error("ambiguous object prefix {prefix}: {candidates} candidates")]
    AmbiguousPrefix { prefix: String, candidates: usize },

    #[error("ref not found: {0}")]
    RefNotFound(String),

    #[error("ref already exists: {0}")]
    RefExists(String),

    #[error("ref {name} was modified: expected {expected}, found {found}")]
    RefModified {
        name: String,
        expected: String,
        found: String,
    },

    #[error("too many symbolic ref redirects while resolving {0}")]
    TooManyRedirects(String),

    #[error("invalid ref name: {0}")]
    InvalidRef(String),

    #[error("corrupt ref {name}: {message}")]
    CorruptRef { name: String, message: String },

    #[error("path not found in index: {0}")]
    PathNotFound(String),

    #[error("invalid index path: {0}")]
    InvalidPath(String),

    #[error("index contains unmerged entries (first: {0})")]
    Unmerged(String),

    #[error("corrupt object {id}: {message}")]
    CorruptObject { id: ObjectId, message: String },

    #[error("corrupt pack {path}: {message}")]
    CorruptPack { path: PathBuf, message: String },

    #[error("corrupt index file {path}: {message}")]
    CorruptIndex { path: PathBuf, message: String },

    #[error("object {id} has type {found}, expected {expected}")]
    UnexpectedType {
        id: ObjectId,
        expected: &'static str,
        found: &'static str,
    },

    #[error("invalid tree entry name: {0}")]
    InvalidEntryName(String),

    #[error("duplicate tree entry name: {0}")]
    DuplicateEntryName(String),

    #[error("invalid hash hex: {0}")]
    InvalidHashHex(String),

    #[error("invalid object type: {0}")]
    InvalidObjectType(String),

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("pack declares {expected} entries, {written} written")]
    PackEntryCount { expected: u32, written: usize },

    #[error("lock already held: {0}")]
    Locked(PathBuf),

    #[error("lock contention on repository")]
    LockContention,

    #[error("object backend is read-only")]
    ReadOnly,

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("config serialization error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),
}

/// coarse failure classes callers can match on
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Corrupt,
    Ambiguous,
    Modified,
    Unmerged,
    TooManyRedirects,
    Exists,
    Locked,
    ReadOnly,
    InvalidSpec,
    IoFailure,
}

impl Error {
    /// classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NoRepo(_)
            | Error::ObjectNotFound(_)
            | Error::PrefixNotFound(_)
            | Error::RefNotFound(_)
            | Error::PathNotFound(_) => ErrorKind::NotFound,

            Error::CorruptObject { .. }
            | Error::CorruptPack { .. }
            | Error::CorruptIndex { .. }
            | Error::CorruptRef { .. }
            | Error::UnexpectedType { .. }
            | Error::Config(_) => ErrorKind::Corrupt,

            Error::AmbiguousPrefix { .. } => ErrorKind::Ambiguous,
            Error::RefModified { .. } => ErrorKind::Modified,
            Error::Unmerged(_) => ErrorKind::Unmerged,
            Error::TooManyRedirects(_) => ErrorKind::TooManyRedirects,
            Error::RepoExists(_) | Error::RefExists(_) => ErrorKind::Exists,
            Error::Locked(_) | Error::LockContention => ErrorKind::Locked,
            Error::ReadOnly => ErrorKind::ReadOnly,

            Error::InvalidRef(_)
            | Error::InvalidPath(_)
            | Error::InvalidEntryName(_)
            | Error::DuplicateEntryName(_)
            | Error::InvalidHashHex(_)
            | Error::InvalidObjectType(_)
            | Error::InvalidSignature(_)
            | Error::PackEntryCount { .. } => ErrorKind::InvalidSpec,

            Error::Io { .. } | Error::ConfigSerialize(_) => ErrorKind::IoFailure,
        }
    }

    /// true when the error means "nothing there", as opposed to damage or io trouble
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub(crate) fn corrupt_object(id: ObjectId, message: impl Into<String>) -> Self {
        Error::CorruptObject {
            id,
            message: message.into(),
        }
    }

    pub(crate) fn corrupt_pack(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Error::CorruptPack {
            path: path.into(),
            message: message.into(),
        }
    }

    pub(crate) fn corrupt_index(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Error::CorruptIndex {
            path: path.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// helper to wrap io errors with path context
pub trait IoResultExt<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| Error::Io {
            path: path.into(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::HashKind;

    #[test]
    fn test_error_kinds() {
        let id = HashKind::Sha1.null_id();
        assert_eq!(Error::ObjectNotFound(id).kind(), ErrorKind::NotFound);
        assert_eq!(Error::corrupt_object(id, "bad").kind(), ErrorKind::Corrupt);
        assert_eq!(
            Error::AmbiguousPrefix {
                prefix: "abcd".into(),
                candidates: 2
            }
            .kind(),
            ErrorKind::Ambiguous
        );
        assert_eq!(
            Error::TooManyRedirects("HEAD".into()).kind(),
            ErrorKind::TooManyRedirects
        );
        assert_eq!(Error::InvalidRef("..".into()).kind(), ErrorKind::InvalidSpec);
        assert_eq!(Error::Unmerged("a".into()).kind(), ErrorKind::Unmerged);
    }

    #[test]
    fn test_io_with_path() {
        let result: std::io::Result<()> = Err(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "denied",
        ));
        let err = result.with_path("/some/path").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IoFailure);
        assert!(err.to_string().contains("/some/path"));
    }
}
