use std::collections::HashSet;

use tracing::{debug, info};

use crate::error::Result;
use crate::hash::ObjectId;
use crate::pack::{diff, index_path_for, write_pack, PackInput, WrittenPack};
use crate::repo::Repo;
use crate::types::RawObject;

/// how far back to look for a delta base among objects of the same type
const DELTA_WINDOW: usize = 10;
/// longest delta chain repack will build
const MAX_CHAIN: usize = 50;

#[derive(Clone, Debug, Default)]
pub struct RepackOptions {
    /// delete loose copies of everything that went into the new pack
    pub prune_loose: bool,
    /// delete the packs the new one replaces
    pub prune_packs: bool,
    /// store every object whole
    pub no_deltas: bool,
}

/// repack statistics
#[derive(Debug, Default)]
pub struct RepackStats {
    pub objects: usize,
    pub deltas: usize,
    pub loose_removed: usize,
    pub packs_removed: usize,
    /// the pack written, if there was anything to pack
    pub pack: Option<WrittenPack>,
}

/// write every object of this repository into one new pack
///
/// runs under the repository lock. objects borrowed from alternates stay
/// where they are. the new pack becomes visible before anything is pruned,
/// so readers always find every object somewhere.
pub fn repack(repo: &Repo, opts: &RepackOptions) -> Result<RepackStats> {
    let _lock = repo.lock()?;
    let odb = repo.odb();
    let hash = repo.hash_kind();
    let mut stats = RepackStats::default();

    let old_packs = odb.packs().packs();
    let mut ids = HashSet::new();
    for id in odb.loose().iter() {
        ids.insert(id?);
    }
    for pack in old_packs.iter() {
        ids.extend(pack.index().ids().iter().copied());
    }
    if ids.is_empty() {
        debug!("nothing to repack");
        return Ok(stats);
    }

    let mut objects: Vec<(ObjectId, RawObject)> = Vec::with_capacity(ids.len());
    for id in ids {
        let object = odb.read(&id)?;
        objects.push((id, object));
    }
    // like objects next to each other, larger first, so deltas mostly shrink
    objects.sort_by(|(a_id, a), (b_id, b)| {
        a.kind
            .pack_code()
            .cmp(&b.kind.pack_code())
            .then(b.data.len().cmp(&a.data.len()))
            .then(a_id.cmp(b_id))
    });

    let inputs = plan_inputs(objects, opts.no_deltas, &mut stats);
    stats.objects = inputs.len();

    let written = write_pack(
        &repo.pack_path(),
        hash,
        repo.config().compression(),
        repo.config().core.fsync,
        &inputs,
    )?;
    odb.add_pack(&written.pack_path)?;

    if opts.prune_loose {
        for input in &inputs {
            if odb.loose().remove(&input.object().id(hash))? {
                stats.loose_removed += 1;
            }
        }
    }

    if opts.prune_packs {
        for pack in old_packs.iter() {
            if pack.path() == written.pack_path {
                continue;
            }
            // the idx goes first so a half-removed pack is simply ignored
            crate::fs::remove_if_exists(&index_path_for(pack.path()))?;
            crate::fs::remove_if_exists(pack.path())?;
            stats.packs_removed += 1;
        }
        odb.refresh()?;
    }

    info!(
        objects = stats.objects,
        deltas = stats.deltas,
        loose_removed = stats.loose_removed,
        packs_removed = stats.packs_removed,
        "repacked"
    );
    stats.pack = Some(written);
    Ok(stats)
}

/// choose a whole or delta encoding for each object, in order
fn plan_inputs(objects: Vec<(ObjectId, RawObject)>, no_deltas: bool, stats: &mut RepackStats) -> Vec<PackInput> {
    let mut inputs: Vec<PackInput> = Vec::with_capacity(objects.len());
    let mut depth: Vec<usize> = Vec::with_capacity(objects.len());

    for (_, object) in objects {
        let mut best: Option<(usize, usize)> = None;
        if !no_deltas && !object.data.is_empty() {
            let start = inputs.len().saturating_sub(DELTA_WINDOW);
            for (i, candidate) in inputs.iter().enumerate().skip(start) {
                let base = candidate.object();
                if base.kind != object.kind || depth[i] >= MAX_CHAIN {
                    continue;
                }
                let size = diff(&base.data, &object.data).encode().len();
                // only worth it when clearly smaller than the object itself
                if size < object.data.len() / 2 && best.map_or(true, |(_, s)| size < s) {
                    best = Some((i, size));
                }
            }
        }

        match best {
            Some((base, _)) => {
                depth.push(depth[base] + 1);
                stats.deltas += 1;
                inputs.push(PackInput::OfsDelta { base, object });
            }
            None => {
                depth.push(0);
                inputs.push(PackInput::Full(object));
            }
        }
    }
    inputs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ObjectType;
    use tempfile::tempdir;

    fn test_repo() -> (tempfile::TempDir, Repo) {
        let dir = tempdir().unwrap();
        let repo = Repo::init(&dir.path().join("repo")).unwrap();
        (dir, repo)
    }

    #[test]
    fn test_repack_moves_loose_objects() {
        let (_dir, repo) = test_repo();
        let base: Vec<u8> = (0..4000u32).flat_map(|i| i.to_le_bytes()).collect();
        let mut edited = base.clone();
        edited.extend_from_slice(b"appended line");

        let a = repo.odb().write_blob(&base).unwrap();
        let b = repo.odb().write_blob(&edited).unwrap();
        let c = repo.odb().write_blob(b"small").unwrap();

        let stats = repack(
            &repo,
            &RepackOptions {
                prune_loose: true,
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(stats.objects, 3);
        assert_eq!(stats.deltas, 1);
        assert_eq!(stats.loose_removed, 3);
        assert_eq!(repo.odb().loose().iter().count(), 0);

        for (id, content) in [(a, &base[..]), (b, &edited[..]), (c, &b"small"[..])] {
            assert_eq!(repo.odb().read_blob(&id).unwrap(), content);
        }
    }

    #[test]
    fn test_repack_replaces_old_packs() {
        let (_dir, repo) = test_repo();
        repo.odb().write_blob(b"first").unwrap();
        let first = repack(&repo, &RepackOptions { prune_loose: true, ..Default::default() }).unwrap();

        let second_id = repo.odb().write_blob(b"second").unwrap();
        let second = repack(
            &repo,
            &RepackOptions {
                prune_loose: true,
                prune_packs: true,
                no_deltas: true,
            },
        )
        .unwrap();

        assert_eq!(second.objects, 2);
        assert_eq!(second.packs_removed, 1);
        assert!(!first.pack.unwrap().pack_path.exists());
        assert_eq!(repo.odb().packs().packs().len(), 1);
        assert!(repo.odb().exists(&second_id));
    }

    #[test]
    fn test_repack_empty_repo() {
        let (_dir, repo) = test_repo();
        let stats = repack(&repo, &RepackOptions::default()).unwrap();
        assert!(stats.pack.is_none());
    }

    #[test]
    fn test_repack_needs_repo_lock() {
        let (_dir, repo) = test_repo();
        repo.odb().write(ObjectType::Blob, b"x").unwrap();
        let _held = repo.lock().unwrap();
        assert!(matches!(
            repack(&repo, &RepackOptions::default()),
            Err(crate::Error::LockContention)
        ));
    }
}
