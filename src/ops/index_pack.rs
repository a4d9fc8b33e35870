use std::path::Path;

use tracing::info;

use crate::error::{IoResultExt, Result};
use crate::pack::{index_path_for, Pack, PackFile, PackIndex, WrittenPack};
use crate::repo::Repo;

/// index a received pack and make its objects visible
///
/// the pack must be complete: every delta base has to be inside it. the
/// pack and its new index are checked against each other before anything is
/// moved; a pack outside `objects/pack` then goes there under its checksum
/// name.
pub fn index_pack(repo: &Repo, pack_path: &Path) -> Result<WrittenPack> {
    let hash = repo.hash_kind();
    let fsync = repo.config().core.fsync;
    let depth = repo.config().core.max_delta_depth;

    let file = PackFile::open(pack_path, hash, depth)?;
    file.verify_checksum()?;
    let checksum = file.checksum();
    let index = PackIndex::build(&file, |_| Ok(None))?;
    let pack = Pack::from_parts(file, index)?;

    let pack_dir = repo.pack_path();
    let final_path = pack_dir.join(format!("pack-{checksum}.pack"));
    if pack_path != final_path {
        std::fs::create_dir_all(&pack_dir).with_path(&pack_dir)?;
        if std::fs::rename(pack_path, &final_path).is_err() {
            // another filesystem; copy then remove
            std::fs::copy(pack_path, &final_path).with_path(&final_path)?;
            std::fs::remove_file(pack_path).with_path(pack_path)?;
        }
    }

    let index_path = index_path_for(&final_path);
    pack.index().write_to(&index_path, fsync)?;
    let num_objects = pack.index().len();
    drop(pack);
    repo.odb().add_pack(&final_path)?;

    info!(pack = %final_path.display(), objects = num_objects, "indexed pack");
    Ok(WrittenPack {
        pack_path: final_path,
        index_path,
        checksum,
        num_objects,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::hash::HashKind;
    use crate::pack::{write_pack, PackInput, PackWriter};
    use crate::types::{ObjectType, RawObject};
    use flate2::Compression;
    use tempfile::tempdir;

    #[test]
    fn test_index_received_pack() {
        let dir = tempdir().unwrap();
        let repo = Repo::init(&dir.path().join("repo")).unwrap();

        // a pack as a transport would leave it: no index, somewhere else
        let incoming = dir.path().join("incoming");
        let base = RawObject::new(ObjectType::Blob, b"base content for a delta".to_vec());
        let target = RawObject::new(ObjectType::Blob, b"base content for a delta, extended".to_vec());
        let written = write_pack(
            &incoming,
            HashKind::Sha1,
            Compression::default(),
            false,
            &[
                PackInput::Full(base.clone()),
                PackInput::OfsDelta {
                    base: 0,
                    object: target.clone(),
                },
            ],
        )
        .unwrap();
        std::fs::remove_file(&written.index_path).unwrap();

        let indexed = index_pack(&repo, &written.pack_path).unwrap();
        assert_eq!(indexed.num_objects, 2);
        assert_eq!(indexed.checksum, written.checksum);
        assert!(indexed.pack_path.starts_with(repo.pack_path()));
        assert!(!written.pack_path.exists());

        let target_id = target.id(HashKind::Sha1);
        assert_eq!(repo.odb().read(&target_id).unwrap(), target);
    }

    #[test]
    fn test_thin_pack_rejected() {
        let dir = tempdir().unwrap();
        let repo = Repo::init(&dir.path().join("repo")).unwrap();

        let base = RawObject::new(ObjectType::Blob, b"only the receiver has this".to_vec());
        let target = RawObject::new(ObjectType::Blob, b"only the receiver has this, and more".to_vec());
        repo.odb().write(base.kind, &base.data).unwrap();

        let incoming = dir.path().join("incoming");
        let written = write_pack(
            &incoming,
            HashKind::Sha1,
            Compression::default(),
            false,
            &[PackInput::RefDelta { base, object: target }],
        )
        .unwrap();

        assert!(matches!(
            index_pack(&repo, &written.pack_path),
            Err(Error::CorruptPack { .. })
        ));
    }

    #[test]
    fn test_index_pack_with_repeated_object() {
        let dir = tempdir().unwrap();
        let repo_path = dir.path().join("repo");
        let repo = Repo::init(&repo_path).unwrap();

        let mut writer = PackWriter::new(Vec::new(), HashKind::Sha1, 2, Compression::default());
        let (id, _) = writer.write_base(ObjectType::Blob, b"sent twice").unwrap();
        writer.write_base(ObjectType::Blob, b"sent twice").unwrap();
        let (bytes, _) = writer.finish().unwrap();
        let incoming = dir.path().join("incoming.pack");
        std::fs::write(&incoming, bytes).unwrap();

        let indexed = index_pack(&repo, &incoming).unwrap();
        assert_eq!(indexed.num_objects, 2);
        assert_eq!(repo.odb().read(&id).unwrap().data, b"sent twice");
        drop(repo);

        // a fresh handle opens the installed pack from disk
        let reopened = Repo::open(&repo_path).unwrap();
        assert_eq!(reopened.odb().read(&id).unwrap().data, b"sent twice");
    }
}
