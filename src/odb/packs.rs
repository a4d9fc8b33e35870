use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::{Error, IoResultExt, Result};
use crate::hash::{HashKind, ObjectId, Prefix};
use crate::object::LooseStore;
use crate::odb::Backend;
use crate::pack::{index_path_for, Pack, PackFile, PackIndex};
use crate::types::{ObjectType, RawObject};

/// every pack in `objects/pack`
///
/// the active set is an immutable snapshot behind a lock; `refresh` builds a
/// new snapshot and swaps it in, so readers never see a half-updated list.
pub struct PackDir {
    dir: PathBuf,
    hash: HashKind,
    max_delta_depth: usize,
    fsync: bool,
    /// where reference-delta bases missing from every pack are looked up
    loose: LooseStore,
    packs: RwLock<Arc<Vec<Arc<Pack>>>>,
}

impl PackDir {
    pub fn open(dir: &Path, loose: LooseStore, max_delta_depth: usize, fsync: bool) -> Result<Self> {
        let packs = Self {
            dir: dir.to_path_buf(),
            hash: loose.hash_kind(),
            max_delta_depth,
            fsync,
            loose,
            packs: RwLock::new(Arc::new(Vec::new())),
        };
        packs.refresh()?;
        Ok(packs)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// current snapshot of open packs
    pub fn packs(&self) -> Arc<Vec<Arc<Pack>>> {
        self.packs.read().clone()
    }

    /// rescan the directory and swap in the new pack set
    pub fn refresh(&self) -> Result<()> {
        let mut paths = self.pack_paths()?;
        paths.sort();

        let current = self.packs();
        let mut next = Vec::with_capacity(paths.len());
        for path in paths {
            // packs are immutable, keep the ones already open
            if let Some(open) = current.iter().find(|p| p.path() == path) {
                next.push(open.clone());
                continue;
            }
            match self.open_pack(&path) {
                Ok(Some(pack)) => next.push(Arc::new(pack)),
                Ok(None) => {}
                Err(e) => warn!(pack = %path.display(), error = %e, "skipping unreadable pack"),
            }
        }

        debug!(dir = %self.dir.display(), packs = next.len(), "refreshed pack list");
        *self.packs.write() = Arc::new(next);
        Ok(())
    }

    /// open one more pack without rescanning
    pub fn add_pack(&self, pack_path: &Path) -> Result<()> {
        let pack = self
            .open_pack(pack_path)?
            .ok_or_else(|| Error::corrupt_pack(pack_path, "pack has no index"))?;

        let mut guard = self.packs.write();
        if guard.iter().any(|p| p.path() == pack_path) {
            return Ok(());
        }
        let mut next = guard.as_ref().clone();
        next.push(Arc::new(pack));
        *guard = Arc::new(next);
        Ok(())
    }

    /// open a pack, rebuilding its index if the one on disk is stale or damaged;
    /// `None` when there is no index yet (a writer may still be publishing it)
    fn open_pack(&self, pack_path: &Path) -> Result<Option<Pack>> {
        let index_path = index_path_for(pack_path);
        if !index_path.exists() {
            debug!(pack = %pack_path.display(), "pack without index, ignoring");
            return Ok(None);
        }

        match Pack::open(pack_path, self.hash, self.max_delta_depth) {
            Ok(pack) => Ok(Some(pack)),
            Err(e @ Error::CorruptIndex { .. }) => {
                warn!(pack = %pack_path.display(), error = %e, "rebuilding pack index");
                let file = PackFile::open(pack_path, self.hash, self.max_delta_depth)?;
                file.verify_checksum()?;
                let index = PackIndex::build(&file, |id| self.loose_base(id))?;
                index.write_to(&index_path, self.fsync)?;
                Pack::from_parts(file, index).map(Some)
            }
            Err(e) => Err(e),
        }
    }

    fn pack_paths(&self) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e).with_path(&self.dir),
        };

        let mut paths = Vec::new();
        for entry in entries {
            let path = entry.with_path(&self.dir)?.path();
            let is_pack = path.extension().is_some_and(|ext| ext == "pack")
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("pack-"));
            if is_pack {
                paths.push(path);
            }
        }
        Ok(paths)
    }

    fn loose_base(&self, id: &ObjectId) -> Result<Option<RawObject>> {
        match self.loose.read(id) {
            Ok(object) => Ok(Some(object)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// base lookup for reference deltas: other packs, then the loose store
    fn external_base(&self, packs: &[Arc<Pack>], skip: usize, id: &ObjectId) -> Result<Option<RawObject>> {
        for (i, pack) in packs.iter().enumerate() {
            if i != skip && pack.contains(id) {
                return pack.read(id, |base| self.loose_base(base)).map(Some);
            }
        }
        self.loose_base(id)
    }

    /// try every pack holding `id`, falling back past damaged ones
    fn with_packs<T>(
        &self,
        id: &ObjectId,
        mut read: impl FnMut(usize, &Arc<Pack>, &[Arc<Pack>]) -> Result<T>,
    ) -> Result<T> {
        let packs = self.packs();
        let mut last_err = None;
        for (i, pack) in packs.iter().enumerate() {
            if !pack.contains(id) {
                continue;
            }
            match read(i, pack, &packs) {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(pack = %pack.path().display(), %id, error = %e, "pack read failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or(Error::ObjectNotFound(*id)))
    }
}

impl Backend for PackDir {
    fn describe(&self) -> String {
        format!("packs at {}", self.dir.display())
    }

    fn read(&self, id: &ObjectId) -> Result<RawObject> {
        self.with_packs(id, |i, pack, all| {
            pack.read(id, |base| self.external_base(all, i, base))
        })
    }

    fn read_header(&self, id: &ObjectId) -> Result<(ObjectType, u64)> {
        self.with_packs(id, |i, pack, all| {
            pack.read_header(id, |base| self.external_base(all, i, base))
        })
    }

    fn exists(&self, id: &ObjectId) -> bool {
        self.packs().iter().any(|p| p.contains(id))
    }

    fn find_prefix(&self, prefix: &Prefix) -> Result<Vec<ObjectId>> {
        Ok(self
            .packs()
            .iter()
            .flat_map(|p| p.find_prefix(prefix))
            .collect())
    }

    fn ids(&self) -> Box<dyn Iterator<Item = Result<ObjectId>> + '_> {
        let packs = self.packs();
        let ids: Vec<ObjectId> = packs
            .iter()
            .flat_map(|p| p.index().ids().iter().copied())
            .collect();
        Box::new(ids.into_iter().map(Ok))
    }

    fn refresh(&self) -> Result<()> {
        PackDir::refresh(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::{write_pack, PackInput};
    use flate2::Compression;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, LooseStore, PathBuf) {
        let dir = tempdir().unwrap();
        let objects = dir.path().join("objects");
        let loose = LooseStore::new(&objects, HashKind::Sha1, Compression::default(), false);
        let pack_dir = objects.join("pack");
        fs::create_dir_all(&pack_dir).unwrap();
        (dir, loose, pack_dir)
    }

    fn blob(content: &[u8]) -> RawObject {
        RawObject::new(ObjectType::Blob, content.to_vec())
    }

    #[test]
    fn test_refresh_picks_up_new_packs() {
        let (_dir, loose, pack_dir) = setup();
        let packs = PackDir::open(&pack_dir, loose, 50, false).unwrap();
        assert!(packs.packs().is_empty());

        let object = blob(b"in a pack");
        write_pack(&pack_dir, HashKind::Sha1, Compression::default(), false, &[PackInput::Full(object.clone())])
            .unwrap();

        let id = object.id(HashKind::Sha1);
        assert!(!packs.exists(&id));
        packs.refresh().unwrap();
        assert!(packs.exists(&id));
        assert_eq!(Backend::read(&packs, &id).unwrap(), object);
    }

    #[test]
    fn test_stale_index_is_rebuilt() {
        let (_dir, loose, pack_dir) = setup();
        let object = blob(b"rebuild me");
        let written =
            write_pack(&pack_dir, HashKind::Sha1, Compression::default(), false, &[PackInput::Full(object.clone())])
                .unwrap();

        // damage the index
        let mut idx = fs::read(&written.index_path).unwrap();
        let last = idx.len() - 1;
        idx[last] ^= 0xff;
        fs::write(&written.index_path, idx).unwrap();

        let packs = PackDir::open(&pack_dir, loose, 50, false).unwrap();
        assert_eq!(Backend::read(&packs, &object.id(HashKind::Sha1)).unwrap(), object);
        // the rebuilt index was written back
        PackIndex::open(&written.index_path, HashKind::Sha1).unwrap();
    }

    #[test]
    fn test_ref_delta_base_in_loose_store() {
        let (_dir, loose, pack_dir) = setup();
        let base = blob(b"the base lives loose");
        let target = blob(b"the base lives loose, the delta in a pack");
        loose.write(base.kind, &base.data).unwrap();

        write_pack(
            &pack_dir,
            HashKind::Sha1,
            Compression::default(),
            false,
            &[PackInput::RefDelta {
                base: base.clone(),
                object: target.clone(),
            }],
        )
        .unwrap();

        let packs = PackDir::open(&pack_dir, loose, 50, false).unwrap();
        assert_eq!(Backend::read(&packs, &target.id(HashKind::Sha1)).unwrap(), target);
    }

    #[test]
    fn test_pack_without_index_ignored() {
        let (_dir, loose, pack_dir) = setup();
        let written = write_pack(
            &pack_dir,
            HashKind::Sha1,
            Compression::default(),
            false,
            &[PackInput::Full(blob(b"x"))],
        )
        .unwrap();
        fs::remove_file(&written.index_path).unwrap();

        let packs = PackDir::open(&pack_dir, loose, 50, false).unwrap();
        assert!(packs.packs().is_empty());
    }
}
