pub mod alternates;
pub mod packs;

pub use alternates::{Alternate, MAX_ALTERNATE_DEPTH};
pub use packs::PackDir;

use std::collections::{BTreeSet, HashSet};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::warn;

use crate::config::CoreConfig;
use crate::error::{Error, Result};
use crate::hash::{HashKind, ObjectId, Prefix};
use crate::object::LooseStore;
use crate::types::{Commit, ObjectType, RawObject, Tag, Tree};

/// one place objects can come from
pub trait Backend: Send + Sync {
    /// short human description for logs
    fn describe(&self) -> String;

    fn read(&self, id: &ObjectId) -> Result<RawObject>;

    fn read_header(&self, id: &ObjectId) -> Result<(ObjectType, u64)>;

    fn exists(&self, id: &ObjectId) -> bool;

    /// ids starting with `prefix` (may repeat ids)
    fn find_prefix(&self, prefix: &Prefix) -> Result<Vec<ObjectId>>;

    /// every id this backend stores
    fn ids(&self) -> Box<dyn Iterator<Item = Result<ObjectId>> + '_>;

    fn write(&self, _kind: ObjectType, _data: &[u8]) -> Result<ObjectId> {
        Err(Error::ReadOnly)
    }

    /// pick up changes made by other writers
    fn refresh(&self) -> Result<()> {
        Ok(())
    }
}

impl Backend for LooseStore {
    fn describe(&self) -> String {
        format!("loose objects at {}", self.root().display())
    }

    fn read(&self, id: &ObjectId) -> Result<RawObject> {
        LooseStore::read(self, id)
    }

    fn read_header(&self, id: &ObjectId) -> Result<(ObjectType, u64)> {
        LooseStore::read_header(self, id)
    }

    fn exists(&self, id: &ObjectId) -> bool {
        LooseStore::exists(self, id)
    }

    fn find_prefix(&self, prefix: &Prefix) -> Result<Vec<ObjectId>> {
        LooseStore::find_prefix(self, prefix)
    }

    fn ids(&self) -> Box<dyn Iterator<Item = Result<ObjectId>> + '_> {
        Box::new(self.iter())
    }

    fn write(&self, kind: ObjectType, data: &[u8]) -> Result<ObjectId> {
        LooseStore::write(self, kind, data)
    }
}

/// the object database: loose store, packs and alternates behind one interface
///
/// reads try each backend in order; writes always go to the loose store.
pub struct Odb {
    objects_dir: PathBuf,
    hash: HashKind,
    loose: LooseStore,
    packs: Arc<PackDir>,
    backends: Vec<Arc<dyn Backend>>,
}

impl Odb {
    /// open the object database rooted at `objects_dir`
    pub fn open(objects_dir: &Path, config: &CoreConfig) -> Result<Self> {
        let canonical = objects_dir
            .canonicalize()
            .unwrap_or_else(|_| objects_dir.to_path_buf());
        Self::open_nested(objects_dir, config, &[canonical])
    }

    pub(crate) fn open_nested(objects_dir: &Path, config: &CoreConfig, chain: &[PathBuf]) -> Result<Self> {
        let loose = LooseStore::new(
            objects_dir,
            config.hash,
            flate2::Compression::new(config.compression.min(9)),
            config.fsync,
        );
        let packs = Arc::new(PackDir::open(
            &objects_dir.join("pack"),
            loose.clone(),
            config.max_delta_depth,
            config.fsync,
        )?);

        let mut backends: Vec<Arc<dyn Backend>> = vec![Arc::new(loose.clone()), packs.clone()];
        for alternate in alternates::load(objects_dir, config, chain)? {
            backends.push(Arc::new(alternate));
        }

        Ok(Self {
            objects_dir: objects_dir.to_path_buf(),
            hash: config.hash,
            loose,
            packs,
            backends,
        })
    }

    pub fn objects_dir(&self) -> &Path {
        &self.objects_dir
    }

    pub fn hash_kind(&self) -> HashKind {
        self.hash
    }

    /// the writable loose store
    pub fn loose(&self) -> &LooseStore {
        &self.loose
    }

    /// this repository's packs
    pub fn packs(&self) -> &PackDir {
        &self.packs
    }

    /// read an object from the first backend that has it
    ///
    /// a damaged backend is logged and skipped; if nothing else has the
    /// object, that damage is what gets reported rather than `NotFound`.
    pub fn read(&self, id: &ObjectId) -> Result<RawObject> {
        self.first_hit(id, |backend| backend.read(id))
    }

    /// type and size without the payload
    pub fn read_header(&self, id: &ObjectId) -> Result<(ObjectType, u64)> {
        self.first_hit(id, |backend| backend.read_header(id))
    }

    pub fn exists(&self, id: &ObjectId) -> bool {
        self.backends.iter().any(|b| b.exists(id))
    }

    /// every distinct id starting with `prefix`, in order
    pub fn find_prefix(&self, prefix: &Prefix) -> Result<Vec<ObjectId>> {
        let mut found = BTreeSet::new();
        for backend in &self.backends {
            match backend.find_prefix(prefix) {
                Ok(ids) => found.extend(ids),
                Err(e) => warn!(backend = %backend.describe(), error = %e, "prefix scan failed"),
            }
        }
        Ok(found.into_iter().collect())
    }

    /// expand an abbreviated id to the one object it names
    pub fn exists_prefix(&self, prefix: &Prefix) -> Result<ObjectId> {
        if prefix.is_full() {
            let id = *prefix.as_id();
            return if self.exists(&id) {
                Ok(id)
            } else {
                Err(Error::PrefixNotFound(prefix.to_string()))
            };
        }

        let found = self.find_prefix(prefix)?;
        match found.as_slice() {
            [] => Err(Error::PrefixNotFound(prefix.to_string())),
            [id] => Ok(*id),
            many => Err(Error::AmbiguousPrefix {
                prefix: prefix.to_string(),
                candidates: many.len(),
            }),
        }
    }

    /// parse and expand an abbreviated hex id
    pub fn resolve_hex(&self, hex: &str) -> Result<ObjectId> {
        self.exists_prefix(&Prefix::from_hex(self.hash, hex)?)
    }

    /// store an object in the loose store
    pub fn write(&self, kind: ObjectType, data: &[u8]) -> Result<ObjectId> {
        self.loose.write(kind, data)
    }

    /// every object id once, across all backends
    pub fn iter(&self) -> impl Iterator<Item = Result<ObjectId>> + '_ {
        let mut seen = HashSet::new();
        self.backends
            .iter()
            .flat_map(|b| b.ids())
            .filter(move |id| match id {
                Ok(id) => seen.insert(*id),
                Err(_) => true,
            })
    }

    /// visit every object id until `f` breaks; returns the break value
    pub fn for_each<B, F>(&self, mut f: F) -> Result<Option<B>>
    where
        F: FnMut(ObjectId) -> ControlFlow<B>,
    {
        for id in self.iter() {
            if let ControlFlow::Break(value) = f(id?) {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    /// rescan packs (and those of alternates)
    pub fn refresh(&self) -> Result<()> {
        for backend in &self.backends {
            backend.refresh()?;
        }
        Ok(())
    }

    /// make a freshly written pack visible
    pub fn add_pack(&self, pack_path: &Path) -> Result<()> {
        self.packs.add_pack(pack_path)
    }

    /// read and check the type in one go
    pub fn read_typed(&self, id: &ObjectId, expected: ObjectType) -> Result<Vec<u8>> {
        let object = self.read(id)?;
        if object.kind != expected {
            return Err(Error::UnexpectedType {
                id: *id,
                expected: expected.as_str(),
                found: object.kind.as_str(),
            });
        }
        Ok(object.data)
    }

    pub fn read_blob(&self, id: &ObjectId) -> Result<Vec<u8>> {
        self.read_typed(id, ObjectType::Blob)
    }

    pub fn read_tree(&self, id: &ObjectId) -> Result<Tree> {
        Tree::decode(id, &self.read_typed(id, ObjectType::Tree)?)
    }

    pub fn read_commit(&self, id: &ObjectId) -> Result<Commit> {
        Commit::decode(id, &self.read_typed(id, ObjectType::Commit)?)
    }

    pub fn read_tag(&self, id: &ObjectId) -> Result<Tag> {
        Tag::decode(id, &self.read_typed(id, ObjectType::Tag)?)
    }

    pub fn write_blob(&self, data: &[u8]) -> Result<ObjectId> {
        self.write(ObjectType::Blob, data)
    }

    pub fn write_tree(&self, tree: &Tree) -> Result<ObjectId> {
        self.write(ObjectType::Tree, &tree.encode())
    }

    pub fn write_commit(&self, commit: &Commit) -> Result<ObjectId> {
        self.write(ObjectType::Commit, &commit.encode())
    }

    pub fn write_tag(&self, tag: &Tag) -> Result<ObjectId> {
        self.write(ObjectType::Tag, &tag.encode())
    }

    fn first_hit<T>(&self, id: &ObjectId, read: impl Fn(&dyn Backend) -> Result<T>) -> Result<T> {
        let mut worst: Option<Error> = None;
        for backend in &self.backends {
            match read(backend.as_ref()) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(backend = %backend.describe(), %id, error = %e, "backend failed, trying next");
                    worst.get_or_insert(e);
                }
            }
        }
        Err(worst.unwrap_or(Error::ObjectNotFound(*id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::{write_pack, PackInput};
    use crate::types::{EntryMode, TreeEntry};
    use std::fs;
    use tempfile::tempdir;

    fn config() -> CoreConfig {
        CoreConfig {
            fsync: false,
            ..CoreConfig::default()
        }
    }

    fn open(dir: &Path) -> Odb {
        let objects = dir.join("objects");
        fs::create_dir_all(objects.join("pack")).unwrap();
        Odb::open(&objects, &config()).unwrap()
    }

    #[test]
    fn test_write_read_roundtrip() {
        let dir = tempdir().unwrap();
        let odb = open(dir.path());

        for kind in [ObjectType::Blob, ObjectType::Tree, ObjectType::Commit, ObjectType::Tag] {
            let id = odb.write(kind, b"payload bytes").unwrap();
            let object = odb.read(&id).unwrap();
            assert_eq!(object.kind, kind);
            assert_eq!(object.data, b"payload bytes");
            assert_eq!(odb.read_header(&id).unwrap(), (kind, 13));
        }
    }

    #[test]
    fn test_read_missing() {
        let dir = tempdir().unwrap();
        let odb = open(dir.path());
        let id = ObjectId::from_hex("1234567890123456789012345678901234567890").unwrap();
        assert!(!odb.exists(&id));
        assert!(matches!(odb.read(&id), Err(Error::ObjectNotFound(_))));
    }

    #[test]
    fn test_falls_back_past_corrupt_loose_copy() {
        let dir = tempdir().unwrap();
        let odb = open(dir.path());

        let object = RawObject::new(ObjectType::Blob, b"in both places".to_vec());
        let id = odb.write(object.kind, &object.data).unwrap();
        let written = write_pack(
            &odb.objects_dir().join("pack"),
            HashKind::Sha1,
            flate2::Compression::default(),
            false,
            &[PackInput::Full(object.clone())],
        )
        .unwrap();
        odb.add_pack(&written.pack_path).unwrap();

        fs::write(odb.loose().object_path(&id), b"garbage").unwrap();
        assert_eq!(odb.read(&id).unwrap(), object);
    }

    #[test]
    fn test_corruption_surfaces_when_only_copy() {
        let dir = tempdir().unwrap();
        let odb = open(dir.path());
        let id = odb.write(ObjectType::Blob, b"only here").unwrap();
        fs::write(odb.loose().object_path(&id), b"garbage").unwrap();

        let err = odb.read(&id).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Corrupt);
    }

    #[test]
    fn test_exists_prefix() {
        let dir = tempdir().unwrap();
        let odb = open(dir.path());

        let ids: Vec<_> = (0..64)
            .map(|i| odb.write_blob(format!("blob {i}").as_bytes()).unwrap())
            .collect();

        let target = ids[0];
        assert_eq!(odb.resolve_hex(&target.to_hex()[..12]).unwrap(), target);
        assert_eq!(odb.resolve_hex(&target.to_hex()).unwrap(), target);

        // keep writing until two ids share their first 4 hex digits
        let mut by_prefix = std::collections::HashMap::new();
        let mut i = 64;
        let (a, b) = loop {
            let id = odb.write_blob(format!("blob {i}").as_bytes()).unwrap();
            i += 1;
            if let Some(other) = by_prefix.insert(id.to_hex()[..4].to_string(), id) {
                break (other, id);
            }
        };
        let shared = &a.to_hex()[..4];
        assert!(b.to_hex().starts_with(shared));
        assert!(matches!(
            odb.resolve_hex(shared),
            Err(Error::AmbiguousPrefix { candidates, .. }) if candidates >= 2
        ));

        assert!(matches!(
            odb.resolve_hex(&"0".repeat(40)),
            Err(Error::PrefixNotFound(_))
        ));
        assert!(matches!(odb.resolve_hex("abc"), Err(Error::InvalidHashHex(_))));
    }

    #[test]
    fn test_iter_dedups_across_backends() {
        let dir = tempdir().unwrap();
        let odb = open(dir.path());

        let shared = RawObject::new(ObjectType::Blob, b"shared".to_vec());
        let loose_only = odb.write_blob(b"loose only").unwrap();
        let shared_id = odb.write(shared.kind, &shared.data).unwrap();
        let written = write_pack(
            &odb.objects_dir().join("pack"),
            HashKind::Sha1,
            flate2::Compression::default(),
            false,
            &[PackInput::Full(shared)],
        )
        .unwrap();
        odb.add_pack(&written.pack_path).unwrap();

        let mut ids: Vec<_> = odb.iter().collect::<Result<_>>().unwrap();
        ids.sort();
        let mut expected = vec![loose_only, shared_id];
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_for_each_stops_early() {
        let dir = tempdir().unwrap();
        let odb = open(dir.path());
        for i in 0..10 {
            odb.write_blob(format!("{i}").as_bytes()).unwrap();
        }

        let mut visited = 0;
        let stopped = odb
            .for_each(|id| {
                visited += 1;
                if visited == 3 {
                    ControlFlow::Break(id)
                } else {
                    ControlFlow::Continue(())
                }
            })
            .unwrap();
        assert!(stopped.is_some());
        assert_eq!(visited, 3);

        let mut all = 0;
        let none: Option<()> = odb
            .for_each(|_| {
                all += 1;
                ControlFlow::Continue(())
            })
            .unwrap();
        assert!(none.is_none());
        assert_eq!(all, 10);
    }

    #[test]
    fn test_alternates() {
        let dir = tempdir().unwrap();
        let shared = open(&dir.path().join("shared"));
        let borrowed = shared.write_blob(b"from the alternate").unwrap();

        let objects = dir.path().join("main/objects");
        fs::create_dir_all(objects.join("info")).unwrap();
        fs::write(
            objects.join("info/alternates"),
            format!("{}\n", shared.objects_dir().display()),
        )
        .unwrap();
        let odb = Odb::open(&objects, &config()).unwrap();

        assert!(odb.exists(&borrowed));
        assert_eq!(odb.read_blob(&borrowed).unwrap(), b"from the alternate");

        // writes never land in the alternate
        let own = odb.write_blob(b"own object").unwrap();
        assert!(!shared.exists(&own));
    }

    #[test]
    fn test_alternate_cycle_is_bounded() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a/objects");
        let b = dir.path().join("b/objects");
        fs::create_dir_all(a.join("info")).unwrap();
        fs::create_dir_all(b.join("info")).unwrap();
        fs::write(a.join("info/alternates"), format!("{}\n", b.display())).unwrap();
        fs::write(b.join("info/alternates"), format!("{}\n", a.display())).unwrap();

        let odb = Odb::open(&a, &config()).unwrap();
        assert_eq!(odb.iter().count(), 0);
    }

    #[test]
    fn test_typed_helpers() {
        let dir = tempdir().unwrap();
        let odb = open(dir.path());

        let blob = odb.write_blob(b"content").unwrap();
        let tree = Tree::new(vec![TreeEntry::new("file", EntryMode::Blob, blob)]).unwrap();
        let tree_id = odb.write_tree(&tree).unwrap();

        assert_eq!(odb.read_tree(&tree_id).unwrap(), tree);
        assert!(matches!(
            odb.read_tree(&blob),
            Err(Error::UnexpectedType { expected: "tree", found: "blob", .. })
        ));
    }
}
