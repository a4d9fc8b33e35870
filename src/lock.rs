use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, IoResultExt, Result};
use crate::fs::fsync_dir;

/// exclusive `<target>.lock` sibling used to publish a new version of `target`
///
/// the lock is created with O_EXCL, so a second writer fails with `Locked`.
/// `commit` renames it over the target; dropping it uncommitted removes it.
pub struct LockFile {
    target: PathBuf,
    lock_path: PathBuf,
    file: Option<File>,
    fsync: bool,
}

impl LockFile {
    /// take the lock for `target`
    pub fn acquire(target: &Path, fsync: bool) -> Result<Self> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).with_path(parent)?;
        }

        let lock_path = lock_path_for(target);
        let file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(Error::Locked(lock_path));
            }
            Err(e) => return Err(e).with_path(&lock_path),
        };

        debug!(path = %lock_path.display(), "acquired lock");
        Ok(Self {
            target: target.to_path_buf(),
            lock_path,
            file: Some(file),
            fsync,
        })
    }

    /// the file this lock guards
    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// append bytes to the pending content
    pub fn write_all(&mut self, data: &[u8]) -> Result<()> {
        match self.file.as_mut() {
            Some(file) => file.write_all(data).with_path(&self.lock_path),
            None => Err(Error::Locked(self.lock_path.clone())),
        }
    }

    /// make the pending content visible at the target path
    pub fn commit(mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            if self.fsync {
                file.sync_all().with_path(&self.lock_path)?;
            }
        }
        fs::rename(&self.lock_path, &self.target).with_path(&self.target)?;

        if self.fsync {
            if let Some(parent) = self.target.parent() {
                fsync_dir(parent)?;
            }
        }
        // renamed away, nothing left for drop to clean up
        self.lock_path.clear();
        Ok(())
    }

    /// release the lock without touching the target
    pub fn rollback(self) {
        drop(self)
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        self.file.take();
        if !self.lock_path.as_os_str().is_empty() {
            let _ = fs::remove_file(&self.lock_path);
        }
    }
}

/// `<path>.lock`
pub fn lock_path_for(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}
