use std::fs::File;
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};
use parking_lot::{Mutex, MutexGuard};
use tracing::info;

use crate::config::Config;
use crate::error::{Error, IoResultExt, Result};
use crate::hash::{HashKind, ObjectId};
use crate::index::Index;
use crate::odb::Odb;
use crate::refs::RefStore;

/// branch HEAD points at in a fresh repository
pub const DEFAULT_BRANCH: &str = "refs/heads/main";

/// an open git directory
///
/// everything the storage layers need is reached through this handle; there
/// is no process-wide state.
pub struct Repo {
    path: PathBuf,
    config: Config,
    odb: Odb,
    refs: RefStore,
    index: Mutex<Index>,
}

impl Repo {
    /// initialize a new sha1 repository at the given path
    pub fn init(path: &Path) -> Result<Self> {
        Self::init_with(path, Config::default())
    }

    /// initialize a new repository with `config`
    pub fn init_with(path: &Path, config: Config) -> Result<Self> {
        let config_path = path.join("config.toml");
        if config_path.exists() {
            return Err(Error::RepoExists(path.to_path_buf()));
        }

        for dir in ["objects/info", "objects/pack", "refs/heads", "refs/tags"] {
            let dir = path.join(dir);
            std::fs::create_dir_all(&dir).with_path(&dir)?;
        }
        config.save(&config_path)?;

        let repo = Self::open(path)?;
        repo.refs.create_symbolic("HEAD", DEFAULT_BRANCH, true)?;
        info!(path = %path.display(), hash = %repo.hash_kind().as_str(), "initialized repository");
        Ok(repo)
    }

    /// open an existing repository
    pub fn open(path: &Path) -> Result<Self> {
        let config_path = path.join("config.toml");
        if !config_path.exists() {
            return Err(Error::NoRepo(path.to_path_buf()));
        }

        let config = Config::load(&config_path)?;
        let core = &config.core;
        let odb = Odb::open(&path.join("objects"), core)?;
        let refs = RefStore::new(path, core.hash, core.fsync, core.max_symref_depth);
        let index = Index::open(&path.join("index"), core.hash, core.fsync)?;

        Ok(Self {
            path: path.to_path_buf(),
            config,
            odb,
            refs,
            index: Mutex::new(index),
        })
    }

    /// repository root path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// repository configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn hash_kind(&self) -> HashKind {
        self.config.hash()
    }

    pub fn odb(&self) -> &Odb {
        &self.odb
    }

    pub fn refs(&self) -> &RefStore {
        &self.refs
    }

    /// the staging index, held for as long as the guard lives
    pub fn index(&self) -> MutexGuard<'_, Index> {
        self.index.lock()
    }

    /// commit HEAD currently resolves to
    pub fn head(&self) -> Result<ObjectId> {
        self.refs.resolve("HEAD")
    }

    /// path to config.toml
    pub fn config_path(&self) -> PathBuf {
        self.path.join("config.toml")
    }

    /// path to objects directory
    pub fn objects_path(&self) -> PathBuf {
        self.path.join("objects")
    }

    /// path to pack directory
    pub fn pack_path(&self) -> PathBuf {
        self.objects_path().join("pack")
    }

    /// path to the staging index file
    pub fn index_path(&self) -> PathBuf {
        self.path.join("index")
    }

    /// path to the repository-wide lock file
    pub fn lock_path(&self) -> PathBuf {
        self.path.join("repo.lock")
    }

    /// acquire exclusive lock on repository
    /// returns a guard that releases the lock on drop
    pub fn lock(&self) -> Result<RepoLock> {
        let lock_path = self.lock_path();
        let file = File::create(&lock_path).with_path(&lock_path)?;

        let flock = Flock::lock(file, FlockArg::LockExclusiveNonblock)
            .map_err(|_| Error::LockContention)?;

        Ok(RepoLock { _flock: flock })
    }

    /// try to acquire exclusive lock, returning None if already locked
    pub fn try_lock(&self) -> Result<Option<RepoLock>> {
        let lock_path = self.lock_path();
        let file = File::create(&lock_path).with_path(&lock_path)?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => Ok(Some(RepoLock { _flock: flock })),
            Err((_, nix::errno::Errno::EWOULDBLOCK)) => Ok(None),
            Err(_) => Err(Error::LockContention),
        }
    }
}

/// guard that holds repository lock until dropped
pub struct RepoLock {
    _flock: Flock<File>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexEntry;
    use crate::types::EntryMode;
    use tempfile::tempdir;

    #[test]
    fn test_repo_init() {
        let dir = tempdir().unwrap();
        let repo_path = dir.path().join("test-repo.git");

        let repo = Repo::init(&repo_path).unwrap();

        assert!(repo_path.join("objects/info").is_dir());
        assert!(repo_path.join("objects/pack").is_dir());
        assert!(repo_path.join("refs/heads").is_dir());
        assert!(repo_path.join("refs/tags").is_dir());
        assert!(repo_path.join("config.toml").is_file());
        assert_eq!(
            std::fs::read_to_string(repo_path.join("HEAD")).unwrap(),
            "ref: refs/heads/main\n"
        );

        // HEAD is unborn until the first commit
        assert!(matches!(repo.head(), Err(Error::RefNotFound(_))));
    }

    #[test]
    fn test_repo_init_already_exists() {
        let dir = tempdir().unwrap();
        let repo_path = dir.path().join("test-repo");

        Repo::init(&repo_path).unwrap();
        let result = Repo::init(&repo_path);

        assert!(matches!(result, Err(Error::RepoExists(_))));
    }

    #[test]
    fn test_repo_open() {
        let dir = tempdir().unwrap();
        let repo_path = dir.path().join("test-repo");

        Repo::init_with(&repo_path, Config::new(HashKind::Sha256)).unwrap();
        let repo = Repo::open(&repo_path).unwrap();

        assert_eq!(repo.path(), repo_path);
        assert_eq!(repo.hash_kind(), HashKind::Sha256);
        assert_eq!(repo.odb().hash_kind(), HashKind::Sha256);
    }

    #[test]
    fn test_repo_open_not_found() {
        let dir = tempdir().unwrap();
        let repo_path = dir.path().join("nonexistent");

        let result = Repo::open(&repo_path);
        assert!(matches!(result, Err(Error::NoRepo(_))));
    }

    #[test]
    fn test_index_persists_across_open() {
        let dir = tempdir().unwrap();
        let repo_path = dir.path().join("test-repo");
        let repo = Repo::init(&repo_path).unwrap();

        let blob = repo.odb().write_blob(b"hello").unwrap();
        {
            let mut index = repo.index();
            index.add(IndexEntry::new("hello.txt", EntryMode::Blob, blob)).unwrap();
            index.write().unwrap();
        }

        let reopened = Repo::open(&repo_path).unwrap();
        assert_eq!(reopened.index().len(), 1);
        assert_eq!(reopened.index_path(), repo_path.join("index"));
    }

    #[test]
    fn test_repo_lock() {
        let dir = tempdir().unwrap();
        let repo_path = dir.path().join("test-repo");
        let repo = Repo::init(&repo_path).unwrap();

        // acquire lock
        let lock = repo.lock().unwrap();

        // try to acquire again should fail
        let result = repo.try_lock().unwrap();
        assert!(result.is_none());
        assert!(matches!(repo.lock(), Err(Error::LockContention)));

        // drop lock
        drop(lock);

        // now should succeed
        let lock2 = repo.try_lock().unwrap();
        assert!(lock2.is_some());
    }
}
