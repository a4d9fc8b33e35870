//! loose refs under the git dir plus the `packed-refs` file

pub mod name;
pub mod packed;

pub use name::validate_ref_name;
pub use packed::{PackedRef, PackedRefs};

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use crate::error::{Error, IoResultExt, Result};
use crate::hash::{HashKind, ObjectId};
use crate::lock::LockFile;
use crate::odb::Odb;
use crate::types::ObjectType;

const SYMREF_PREFIX: &str = "ref: ";

/// what a ref points at
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefTarget {
    Direct(ObjectId),
    Symbolic(String),
}

impl RefTarget {
    fn describe(&self) -> String {
        match self {
            RefTarget::Direct(id) => id.to_hex(),
            RefTarget::Symbolic(target) => format!("{SYMREF_PREFIX}{target}"),
        }
    }
}

/// a named ref as stored, without following symbolic targets
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reference {
    pub name: String,
    pub target: RefTarget,
    /// peeled tag target, known for packed refs only
    pub peeled: Option<ObjectId>,
}

impl Reference {
    pub fn id(&self) -> Option<&ObjectId> {
        match &self.target {
            RefTarget::Direct(id) => Some(id),
            RefTarget::Symbolic(_) => None,
        }
    }

    pub fn symbolic_target(&self) -> Option<&str> {
        match &self.target {
            RefTarget::Symbolic(target) => Some(target),
            RefTarget::Direct(_) => None,
        }
    }
}

/// refs of one repository
pub struct RefStore {
    git_dir: PathBuf,
    hash: HashKind,
    fsync: bool,
    max_symref_depth: usize,
}

impl RefStore {
    pub fn new(git_dir: &Path, hash: HashKind, fsync: bool, max_symref_depth: usize) -> Self {
        Self {
            git_dir: git_dir.to_path_buf(),
            hash,
            fsync,
            max_symref_depth,
        }
    }

    pub fn packed_refs_path(&self) -> PathBuf {
        self.git_dir.join("packed-refs")
    }

    /// path of the loose file for `name`
    pub fn ref_path(&self, name: &str) -> PathBuf {
        self.git_dir.join(name)
    }

    /// read `name` as stored: loose file first, then `packed-refs`
    pub fn lookup(&self, name: &str) -> Result<Reference> {
        validate_ref_name(name)?;
        if let Some(target) = self.read_loose(name)? {
            return Ok(Reference {
                name: name.to_string(),
                target,
                peeled: None,
            });
        }

        let packed = self.load_packed()?;
        match packed.get(name) {
            Some(entry) => Ok(Reference {
                name: name.to_string(),
                target: RefTarget::Direct(entry.id),
                peeled: entry.peeled,
            }),
            None => Err(Error::RefNotFound(name.to_string())),
        }
    }

    pub fn exists(&self, name: &str) -> bool {
        self.lookup(name).is_ok()
    }

    /// follow symbolic refs to an object id
    pub fn resolve(&self, name: &str) -> Result<ObjectId> {
        let mut current = name.to_string();
        for _ in 0..=self.max_symref_depth {
            match self.lookup(&current)?.target {
                RefTarget::Direct(id) => return Ok(id),
                RefTarget::Symbolic(target) => current = target,
            }
        }
        Err(Error::TooManyRedirects(name.to_string()))
    }

    /// name of the direct ref a symbolic chain ends at, which need not exist
    /// yet (an unborn branch)
    pub fn follow(&self, name: &str) -> Result<String> {
        let mut current = name.to_string();
        for _ in 0..=self.max_symref_depth {
            match self.lookup(&current) {
                Ok(Reference {
                    target: RefTarget::Symbolic(target),
                    ..
                }) => current = target,
                Ok(_) => return Ok(current),
                Err(Error::RefNotFound(_)) => return Ok(current),
                Err(e) => return Err(e),
            }
        }
        Err(Error::TooManyRedirects(name.to_string()))
    }

    /// create `name` pointing at `id`; an existing ref is only replaced with
    /// `force`
    pub fn create(&self, name: &str, id: &ObjectId, force: bool) -> Result<()> {
        self.write_new(name, RefTarget::Direct(*id), force)
    }

    /// create `name` as a symbolic ref to `target`
    pub fn create_symbolic(&self, name: &str, target: &str, force: bool) -> Result<()> {
        validate_ref_name(target)?;
        self.write_new(name, RefTarget::Symbolic(target.to_string()), force)
    }

    /// point `name` at `new`
    ///
    /// with `expected_old` the write only happens if the ref still holds that
    /// id (a missing ref never matches); otherwise `Modified` and nothing
    /// changes.
    pub fn update(&self, name: &str, new: &ObjectId, expected_old: Option<&ObjectId>) -> Result<()> {
        validate_ref_name(name)?;
        self.check_name_conflict(name)?;

        let mut lock = LockFile::acquire(&self.ref_path(name), self.fsync)?;
        let current = self.current_target(name)?;
        if let Some(expected) = expected_old {
            check_expected(name, expected, current.as_ref())?;
        }

        lock.write_all(format!("{new}\n").as_bytes())?;
        lock.commit()?;
        debug!(name, id = %new, "updated ref");
        Ok(())
    }

    /// `update` applied to the ref a symbolic chain ends at
    pub fn update_resolved(&self, name: &str, new: &ObjectId, expected_old: Option<&ObjectId>) -> Result<String> {
        let target = self.follow(name)?;
        self.update(&target, new, expected_old)?;
        Ok(target)
    }

    /// remove `name` from both the loose and the packed store, with the same
    /// check against `expected_old` as `update`
    pub fn delete(&self, name: &str, expected_old: Option<&ObjectId>) -> Result<()> {
        validate_ref_name(name)?;
        let ref_path = self.ref_path(name);
        let lock = LockFile::acquire(&ref_path, self.fsync)?;

        let current = self.current_target(name)?;
        let Some(current) = current else {
            return Err(Error::RefNotFound(name.to_string()));
        };
        if let Some(expected) = expected_old {
            check_expected(name, expected, Some(&current))?;
        }

        let packed_path = self.packed_refs_path();
        let mut packed = self.load_packed()?;
        if packed.contains(name) {
            let mut packed_lock = LockFile::acquire(&packed_path, self.fsync)?;
            packed = self.load_packed()?;
            packed.remove(name);
            packed_lock.write_all(packed.encode().as_bytes())?;
            packed_lock.commit()?;
        }

        crate::fs::remove_if_exists(&ref_path)?;
        lock.rollback();
        self.prune_empty_parents(&ref_path);
        debug!(name, "deleted ref");
        Ok(())
    }

    /// every ref under `refs/`, sorted by name; loose refs shadow packed ones
    pub fn list(&self) -> Result<Vec<Reference>> {
        let mut refs: Vec<Reference> = Vec::new();
        for name in self.loose_names()? {
            if let Some(target) = self.read_loose(&name)? {
                refs.push(Reference {
                    name,
                    target,
                    peeled: None,
                });
            }
        }

        let packed = self.load_packed()?;
        for entry in packed.iter() {
            if !refs.iter().any(|r| r.name == entry.name) {
                refs.push(Reference {
                    name: entry.name.clone(),
                    target: RefTarget::Direct(entry.id),
                    peeled: entry.peeled,
                });
            }
        }

        refs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(refs)
    }

    /// refs whose name matches a glob such as `refs/tags/v1.*`
    pub fn list_matching(&self, pattern: &str) -> Result<Vec<Reference>> {
        let glob = glob::Pattern::new(pattern).map_err(|e| Error::InvalidRef(e.to_string()))?;
        Ok(self
            .list()?
            .into_iter()
            .filter(|r| glob.matches(&r.name))
            .collect())
    }

    /// move every direct loose ref into `packed-refs`
    ///
    /// annotated tags get their peeled target recorded. a loose file is only
    /// removed if it still holds the value that was packed. returns how many
    /// refs were packed.
    pub fn pack_refs(&self, odb: &Odb) -> Result<usize> {
        let packed_path = self.packed_refs_path();
        let mut lock = LockFile::acquire(&packed_path, self.fsync)?;
        let mut packed = self.load_packed()?;

        let mut moved = Vec::new();
        for name in self.loose_names()? {
            let Some(RefTarget::Direct(id)) = self.read_loose(&name)? else {
                continue;
            };
            let peeled = peel_tag(odb, &id)?;
            packed.insert(PackedRef {
                name: name.clone(),
                id,
                peeled,
            });
            moved.push((name, id));
        }

        lock.write_all(packed.encode().as_bytes())?;
        lock.commit()?;

        for (name, id) in &moved {
            let ref_path = self.ref_path(name);
            // a concurrent writer holds this ref; its new value stays loose
            let Ok(ref_lock) = LockFile::acquire(&ref_path, self.fsync) else {
                continue;
            };
            let unchanged = self.read_loose(name)? == Some(RefTarget::Direct(*id));
            if unchanged {
                crate::fs::remove_if_exists(&ref_path)?;
            }
            ref_lock.rollback();
            if unchanged {
                self.prune_empty_parents(&ref_path);
            }
        }

        debug!(packed = moved.len(), "packed refs");
        Ok(moved.len())
    }

    fn write_new(&self, name: &str, target: RefTarget, force: bool) -> Result<()> {
        validate_ref_name(name)?;
        self.check_name_conflict(name)?;

        let mut lock = LockFile::acquire(&self.ref_path(name), self.fsync)?;
        if !force && self.current_target(name)?.is_some() {
            return Err(Error::RefExists(name.to_string()));
        }
        lock.write_all(format!("{}\n", target.describe()).as_bytes())?;
        lock.commit()?;
        debug!(name, target = %target.describe(), "created ref");
        Ok(())
    }

    fn current_target(&self, name: &str) -> Result<Option<RefTarget>> {
        match self.lookup(name) {
            Ok(reference) => Ok(Some(reference.target)),
            Err(Error::RefNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn read_loose(&self, name: &str) -> Result<Option<RefTarget>> {
        let path = self.ref_path(name);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            // a directory of refs sharing this prefix
            Err(_) if path.is_dir() => return Ok(None),
            Err(e) => return Err(e).with_path(&path),
        };

        let content = content.trim_end();
        if let Some(target) = content.strip_prefix(SYMREF_PREFIX) {
            let target = target.trim();
            validate_ref_name(target).map_err(|_| Error::CorruptRef {
                name: name.to_string(),
                message: format!("bad symbolic target {target:?}"),
            })?;
            return Ok(Some(RefTarget::Symbolic(target.to_string())));
        }
        let id = ObjectId::from_hex_kind(self.hash, content).map_err(|_| Error::CorruptRef {
            name: name.to_string(),
            message: format!("expected an object id, found {content:?}"),
        })?;
        Ok(Some(RefTarget::Direct(id)))
    }

    fn load_packed(&self) -> Result<PackedRefs> {
        PackedRefs::load(&self.packed_refs_path(), self.hash)
    }

    /// names of every loose ref under `refs/`
    fn loose_names(&self) -> Result<Vec<String>> {
        let root = self.git_dir.join("refs");
        let mut names = Vec::new();
        for entry in WalkDir::new(&root).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) if e.io_error().is_some_and(|io| io.kind() == ErrorKind::NotFound) => continue,
                Err(e) => {
                    let path = e.path().unwrap_or(&root).to_path_buf();
                    return Err(Error::Io {
                        path,
                        source: e.into(),
                    });
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(&self.git_dir) else {
                continue;
            };
            let name = rel.to_string_lossy().replace('\\', "/");
            // skips `.lock` files and other strays
            if validate_ref_name(&name).is_ok() {
                names.push(name);
            }
        }
        Ok(names)
    }

    /// `refs/heads/a` and `refs/heads/a/b` cannot both exist
    fn check_name_conflict(&self, name: &str) -> Result<()> {
        let packed = self.load_packed()?;
        for (i, _) in name.match_indices('/').skip(1) {
            let parent = &name[..i];
            if self.ref_path(parent).is_file() || packed.contains(parent) {
                return Err(Error::RefExists(parent.to_string()));
            }
        }

        let below = format!("{name}/");
        if let Some(child) = packed.iter().find(|r| r.name.starts_with(&below)) {
            return Err(Error::RefExists(child.name.clone()));
        }
        let dir = self.ref_path(name);
        if dir.is_dir() {
            let has_refs = WalkDir::new(&dir)
                .into_iter()
                .filter_map(|e| e.ok())
                .any(|e| e.file_type().is_file());
            if has_refs {
                return Err(Error::RefExists(below));
            }
        }
        Ok(())
    }

    /// remove directories left empty by a deleted ref, stopping at `refs/<kind>`
    fn prune_empty_parents(&self, ref_path: &Path) {
        let stop = self.git_dir.join("refs");
        let mut dir = ref_path.parent();
        while let Some(d) = dir {
            if d == stop || d.parent() == Some(stop.as_path()) || !d.starts_with(&stop) {
                break;
            }
            if fs::remove_dir(d).is_err() {
                break;
            }
            dir = d.parent();
        }
    }
}

fn check_expected(name: &str, expected: &ObjectId, current: Option<&RefTarget>) -> Result<()> {
    match current {
        Some(RefTarget::Direct(id)) if id == expected => Ok(()),
        other => Err(Error::RefModified {
            name: name.to_string(),
            expected: expected.to_hex(),
            found: other.map(RefTarget::describe).unwrap_or_else(|| "nothing".to_string()),
        }),
    }
}

/// final non-tag object behind an annotated tag; `None` for anything else
fn peel_tag(odb: &Odb, id: &ObjectId) -> Result<Option<ObjectId>> {
    let mut current = *id;
    let mut peeled = None;
    // tag chains are short; the bound only stops cycles in corrupt data
    for _ in 0..64 {
        match odb.read_header(&current) {
            Ok((ObjectType::Tag, _)) => {
                current = odb.read_tag(&current)?.target;
                peeled = Some(current);
            }
            Ok(_) => return Ok(peeled),
            Err(e) if e.is_not_found() => return Ok(peeled),
            Err(e) => return Err(e),
        }
    }
    Err(Error::corrupt_object(*id, "tag chain does not end"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::hash::hash_object;
    use crate::types::{Signature, Tag};
    use tempfile::tempdir;

    fn id(n: u8) -> ObjectId {
        hash_object(HashKind::Sha1, ObjectType::Blob, &[n])
    }

    fn store(dir: &Path) -> RefStore {
        RefStore::new(dir, HashKind::Sha1, false, 5)
    }

    #[test]
    fn test_create_and_lookup() {
        let dir = tempdir().unwrap();
        let refs = store(dir.path());
        refs.create("refs/heads/main", &id(1), false).unwrap();

        let reference = refs.lookup("refs/heads/main").unwrap();
        assert_eq!(reference.id(), Some(&id(1)));
        assert_eq!(
            fs::read_to_string(dir.path().join("refs/heads/main")).unwrap(),
            format!("{}\n", id(1))
        );

        assert!(matches!(
            refs.create("refs/heads/main", &id(2), false),
            Err(Error::RefExists(_))
        ));
        refs.create("refs/heads/main", &id(2), true).unwrap();
        assert_eq!(refs.resolve("refs/heads/main").unwrap(), id(2));
    }

    #[test]
    fn test_lookup_validates_name() {
        let dir = tempdir().unwrap();
        let refs = store(dir.path());
        assert!(matches!(refs.lookup("refs/heads/a..b"), Err(Error::InvalidRef(_))));
        assert!(matches!(refs.lookup("refs/heads/x@{0}"), Err(Error::InvalidRef(_))));
        assert!(matches!(refs.lookup("refs/heads/none"), Err(Error::RefNotFound(_))));
    }

    #[test]
    fn test_symbolic_resolution() {
        let dir = tempdir().unwrap();
        let refs = store(dir.path());
        refs.create_symbolic("HEAD", "refs/heads/main", false).unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("HEAD")).unwrap(),
            "ref: refs/heads/main\n"
        );

        // unborn branch
        assert!(matches!(refs.resolve("HEAD"), Err(Error::RefNotFound(_))));
        assert_eq!(refs.follow("HEAD").unwrap(), "refs/heads/main");

        refs.create("refs/heads/main", &id(7), false).unwrap();
        assert_eq!(refs.resolve("HEAD").unwrap(), id(7));
        assert_eq!(
            refs.lookup("HEAD").unwrap().symbolic_target(),
            Some("refs/heads/main")
        );
    }

    #[test]
    fn test_too_many_redirects() {
        let dir = tempdir().unwrap();
        let refs = store(dir.path());
        for i in 0..7 {
            refs.create_symbolic(&format!("refs/chain/{i}"), &format!("refs/chain/{}", i + 1), false)
                .unwrap();
        }
        refs.create("refs/chain/7", &id(1), false).unwrap();

        // five hops are fine
        assert_eq!(refs.resolve("refs/chain/2").unwrap(), id(1));
        assert!(matches!(refs.resolve("refs/chain/0"), Err(Error::TooManyRedirects(_))));

        // and a cycle terminates
        refs.create_symbolic("refs/loop/a", "refs/loop/b", false).unwrap();
        refs.create_symbolic("refs/loop/b", "refs/loop/a", false).unwrap();
        assert!(matches!(refs.resolve("refs/loop/a"), Err(Error::TooManyRedirects(_))));
    }

    #[test]
    fn test_update_compare_and_swap() {
        let dir = tempdir().unwrap();
        let refs = store(dir.path());
        refs.create("refs/heads/main", &id(1), false).unwrap();

        let stale = refs.update("refs/heads/main", &id(3), Some(&id(2)));
        assert!(matches!(stale, Err(Error::RefModified { .. })));
        assert_eq!(refs.resolve("refs/heads/main").unwrap(), id(1));

        refs.update("refs/heads/main", &id(3), Some(&id(1))).unwrap();
        assert_eq!(refs.resolve("refs/heads/main").unwrap(), id(3));

        // expecting a value on a missing ref never matches
        assert!(matches!(
            refs.update("refs/heads/new", &id(1), Some(&id(1))),
            Err(Error::RefModified { .. })
        ));
        refs.update("refs/heads/new", &id(1), None).unwrap();
        assert!(!dir.path().join("refs/heads/main.lock").exists());
    }

    #[test]
    fn test_update_blocked_by_lock() {
        let dir = tempdir().unwrap();
        let refs = store(dir.path());
        refs.create("refs/heads/main", &id(1), false).unwrap();

        let held = LockFile::acquire(&refs.ref_path("refs/heads/main"), false).unwrap();
        assert!(matches!(
            refs.update("refs/heads/main", &id(2), None),
            Err(Error::Locked(_))
        ));
        drop(held);
        refs.update("refs/heads/main", &id(2), None).unwrap();
    }

    #[test]
    fn test_update_resolved_moves_branch() {
        let dir = tempdir().unwrap();
        let refs = store(dir.path());
        refs.create_symbolic("HEAD", "refs/heads/main", false).unwrap();

        let target = refs.update_resolved("HEAD", &id(4), None).unwrap();
        assert_eq!(target, "refs/heads/main");
        assert_eq!(refs.resolve("refs/heads/main").unwrap(), id(4));
        assert!(refs.lookup("HEAD").unwrap().symbolic_target().is_some());
    }

    #[test]
    fn test_delete() {
        let dir = tempdir().unwrap();
        let refs = store(dir.path());
        refs.create("refs/heads/topic/x", &id(1), false).unwrap();

        assert!(matches!(
            refs.delete("refs/heads/topic/x", Some(&id(2))),
            Err(Error::RefModified { .. })
        ));
        assert!(refs.exists("refs/heads/topic/x"));

        refs.delete("refs/heads/topic/x", Some(&id(1))).unwrap();
        assert!(!refs.exists("refs/heads/topic/x"));
        assert!(!dir.path().join("refs/heads/topic").exists());
        assert!(matches!(
            refs.delete("refs/heads/topic/x", None),
            Err(Error::RefNotFound(_))
        ));
    }

    #[test]
    fn test_directory_file_conflicts() {
        let dir = tempdir().unwrap();
        let refs = store(dir.path());
        refs.create("refs/heads/a", &id(1), false).unwrap();
        assert!(matches!(
            refs.create("refs/heads/a/b", &id(1), false),
            Err(Error::RefExists(_))
        ));

        refs.create("refs/heads/c/d", &id(1), false).unwrap();
        assert!(matches!(
            refs.create("refs/heads/c", &id(1), false),
            Err(Error::RefExists(_))
        ));
    }

    #[test]
    fn test_pack_refs_and_packed_lookup() {
        let dir = tempdir().unwrap();
        let odb = Odb::open(&dir.path().join("objects"), &CoreConfig::default()).unwrap();
        let refs = store(dir.path());

        let blob = odb.write_blob(b"tagged").unwrap();
        let tag = Tag::new(
            blob,
            ObjectType::Blob,
            "v1",
            Some(Signature::parse("T <t@example.com> 0 +0000").unwrap()),
            "release\n",
        );
        let tag_id = odb.write_tag(&tag).unwrap();

        refs.create("refs/heads/main", &blob, false).unwrap();
        refs.create("refs/tags/v1", &tag_id, false).unwrap();
        refs.create_symbolic("HEAD", "refs/heads/main", false).unwrap();

        assert_eq!(refs.pack_refs(&odb).unwrap(), 2);
        assert!(!dir.path().join("refs/heads/main").exists());
        assert!(dir.path().join("HEAD").exists());

        let v1 = refs.lookup("refs/tags/v1").unwrap();
        assert_eq!(v1.id(), Some(&tag_id));
        assert_eq!(v1.peeled, Some(blob));
        assert_eq!(refs.resolve("HEAD").unwrap(), blob);

        // a loose write shadows the packed value
        refs.update("refs/heads/main", &tag_id, Some(&blob)).unwrap();
        assert_eq!(refs.resolve("refs/heads/main").unwrap(), tag_id);

        // deleting removes both copies
        refs.delete("refs/heads/main", None).unwrap();
        assert!(matches!(refs.lookup("refs/heads/main"), Err(Error::RefNotFound(_))));
    }

    #[test]
    fn test_list_and_matching() {
        let dir = tempdir().unwrap();
        let odb = Odb::open(&dir.path().join("objects"), &CoreConfig::default()).unwrap();
        let refs = store(dir.path());
        refs.create("refs/heads/main", &id(1), false).unwrap();
        refs.create("refs/tags/v1.0", &id(2), false).unwrap();
        refs.pack_refs(&odb).unwrap();
        refs.create("refs/tags/v1.1", &id(3), false).unwrap();
        refs.create("refs/tags/v2.0", &id(4), false).unwrap();

        let names: Vec<_> = refs.list().unwrap().into_iter().map(|r| r.name).collect();
        assert_eq!(
            names,
            vec!["refs/heads/main", "refs/tags/v1.0", "refs/tags/v1.1", "refs/tags/v2.0"]
        );

        let v1: Vec<_> = refs
            .list_matching("refs/tags/v1.*")
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(v1, vec!["refs/tags/v1.0", "refs/tags/v1.1"]);
        assert!(matches!(refs.list_matching("[unclosed"), Err(Error::InvalidRef(_))));
    }

    #[test]
    fn test_corrupt_loose_ref() {
        let dir = tempdir().unwrap();
        let refs = store(dir.path());
        fs::create_dir_all(dir.path().join("refs/heads")).unwrap();
        fs::write(dir.path().join("refs/heads/bad"), "not a hash\n").unwrap();
        assert!(matches!(refs.lookup("refs/heads/bad"), Err(Error::CorruptRef { .. })));
    }
}
