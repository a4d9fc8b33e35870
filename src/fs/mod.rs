use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::error::{IoResultExt, Result};

/// sync a directory to disk
pub fn fsync_dir(path: &Path) -> Result<()> {
    let dir = File::open(path).with_path(path)?;
    dir.sync_all().with_path(path)?;
    Ok(())
}

/// unique temp path next to `target`, so the final rename stays on one filesystem
pub fn temp_path_for(target: &Path) -> PathBuf {
    let name = format!(".tmp-{}", uuid::Uuid::new_v4());
    match target.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}

/// publish `data` at `path`: temp file -> fsync -> rename -> fsync dir
pub fn write_atomic(path: &Path, data: &[u8], fsync: bool) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_path(parent)?;
    }

    let tmp_path = temp_path_for(path);
    let written = (|| {
        let mut tmp_file = File::create(&tmp_path).with_path(&tmp_path)?;
        tmp_file.write_all(data).with_path(&tmp_path)?;
        if fsync {
            tmp_file.sync_all().with_path(&tmp_path)?;
        }
        fs::rename(&tmp_path, path).with_path(path)
    })();

    if written.is_err() {
        let _ = fs::remove_file(&tmp_path);
        return written;
    }

    if fsync {
        if let Some(parent) = path.parent() {
            fsync_dir(parent)?;
        }
    }
    Ok(())
}

/// read a whole file, or `None` if it does not exist
pub fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_path(path),
    }
}

/// remove a file, reporting whether it was there
pub fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_path(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_atomic_replaces() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/file");

        write_atomic(&path, b"one", true).unwrap();
        write_atomic(&path, b"two", false).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"two");

        // no temp files left behind
        let leftovers: Vec<_> = fs::read_dir(dir.path().join("nested"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_read_optional_and_remove() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");

        assert!(read_optional(&path).unwrap().is_none());
        assert!(!remove_if_exists(&path).unwrap());

        fs::write(&path, b"x").unwrap();
        assert_eq!(read_optional(&path).unwrap().unwrap(), b"x");
        assert!(remove_if_exists(&path).unwrap());
        assert!(!path.exists());
    }
}
