use std::collections::HashSet;
use std::path::PathBuf;

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::hash::ObjectId;
use crate::repo::Repo;
use crate::types::{Commit, EntryMode, ObjectType, Tag, Tree};

/// fsck report
#[derive(Debug, Default)]
pub struct FsckReport {
    /// objects checked, loose and packed
    pub objects_checked: usize,
    pub packs_checked: usize,
    /// objects that fail to decode or hash to something else
    pub corrupt_objects: Vec<CorruptObject>,
    pub corrupt_packs: Vec<CorruptPack>,
    /// objects referenced by other objects, refs or the index
    pub missing_objects: Vec<MissingObject>,
    pub broken_refs: Vec<BrokenRef>,
    /// objects not reachable from any ref or the index
    pub dangling_objects: Vec<ObjectId>,
}

impl FsckReport {
    pub fn is_ok(&self) -> bool {
        self.corrupt_objects.is_empty()
            && self.corrupt_packs.is_empty()
            && self.missing_objects.is_empty()
            && self.broken_refs.is_empty()
    }
}

#[derive(Debug)]
pub struct CorruptObject {
    pub id: ObjectId,
    pub message: String,
}

#[derive(Debug)]
pub struct CorruptPack {
    pub path: PathBuf,
    pub message: String,
}

#[derive(Debug)]
pub struct MissingObject {
    pub id: ObjectId,
    pub object_type: Option<ObjectType>,
    pub referenced_by: String,
}

#[derive(Debug)]
pub struct BrokenRef {
    pub name: String,
    pub message: String,
}

/// verify repository integrity
///
/// damage is collected into the report instead of stopping the walk; only
/// failures to enumerate the repository itself are returned as errors.
pub fn fsck(repo: &Repo) -> Result<FsckReport> {
    let mut report = FsckReport::default();
    let mut own = HashSet::new();

    check_loose(repo, &mut report, &mut own)?;
    check_packs(repo, &mut report, &mut own);

    let mut walk = Walk::default();
    for (name, id) in ref_roots(repo, &mut report)? {
        walk.push(id, None, format!("ref {name}"));
    }
    for entry in repo.index().iter() {
        if entry.mode == EntryMode::Commit || entry.intent_to_add {
            continue;
        }
        walk.push(entry.id, Some(ObjectType::Blob), format!("index entry {}", entry.path));
    }
    walk.run(repo, &mut report);

    let mut dangling: Vec<ObjectId> = own.difference(&walk.seen).copied().collect();
    dangling.sort();
    report.dangling_objects = dangling;

    info!(
        objects = report.objects_checked,
        packs = report.packs_checked,
        ok = report.is_ok(),
        "fsck finished"
    );
    Ok(report)
}

fn check_loose(repo: &Repo, report: &mut FsckReport, own: &mut HashSet<ObjectId>) -> Result<()> {
    let loose = repo.odb().loose();
    for id in loose.iter() {
        let id = id?;
        report.objects_checked += 1;
        own.insert(id);
        if let Err(e) = loose.verify(&id) {
            warn!(%id, error = %e, "corrupt loose object");
            report.corrupt_objects.push(CorruptObject {
                id,
                message: e.to_string(),
            });
        }
    }
    Ok(())
}

fn check_packs(repo: &Repo, report: &mut FsckReport, own: &mut HashSet<ObjectId>) {
    let hash = repo.hash_kind();
    let external = |base: &ObjectId| match repo.odb().read(base) {
        Ok(object) => Ok(Some(object)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    };

    for pack in repo.odb().packs().packs().iter() {
        report.packs_checked += 1;
        if let Err(e) = pack.file().verify_checksum() {
            report.corrupt_packs.push(CorruptPack {
                path: pack.path().to_path_buf(),
                message: e.to_string(),
            });
        }

        for entry in pack.index().iter() {
            report.objects_checked += 1;
            own.insert(entry.id);

            let problem = match pack.file().entry_crc(entry.offset) {
                Ok(crc) if crc != entry.crc32 => Some(format!(
                    "crc mismatch at offset {}: index {:08x}, pack {crc:08x}",
                    entry.offset, entry.crc32
                )),
                Ok(_) => match pack.read(&entry.id, &external) {
                    Ok(object) if object.id(hash) != entry.id => {
                        Some(format!("entry hashes to {}", object.id(hash)))
                    }
                    Ok(_) => None,
                    Err(e) => Some(e.to_string()),
                },
                Err(e) => Some(e.to_string()),
            };

            if let Some(message) = problem {
                warn!(pack = %pack.path().display(), id = %entry.id, %message, "corrupt pack entry");
                report.corrupt_objects.push(CorruptObject { id: entry.id, message });
            }
        }
    }
}

/// HEAD plus every ref under refs/, resolved
fn ref_roots(repo: &Repo, report: &mut FsckReport) -> Result<Vec<(String, ObjectId)>> {
    let refs = repo.refs();
    let mut names = vec!["HEAD".to_string()];
    names.extend(refs.list()?.into_iter().map(|r| r.name));

    let mut roots = Vec::new();
    for name in names {
        match refs.resolve(&name) {
            Ok(id) => roots.push((name, id)),
            // an unborn HEAD is not damage
            Err(Error::RefNotFound(_)) if name == "HEAD" => {}
            Err(e) => report.broken_refs.push(BrokenRef {
                name,
                message: e.to_string(),
            }),
        }
    }
    Ok(roots)
}

/// reachability walk with an explicit stack
#[derive(Default)]
struct Walk {
    seen: HashSet<ObjectId>,
    pending: Vec<(ObjectId, Option<ObjectType>, String)>,
}

impl Walk {
    fn push(&mut self, id: ObjectId, expected: Option<ObjectType>, referenced_by: String) {
        self.pending.push((id, expected, referenced_by));
    }

    fn run(&mut self, repo: &Repo, report: &mut FsckReport) {
        let odb = repo.odb();
        while let Some((id, expected, referenced_by)) = self.pending.pop() {
            if !self.seen.insert(id) {
                continue;
            }

            // blob contents were already checked object by object
            if expected == Some(ObjectType::Blob) {
                if !odb.exists(&id) {
                    report.missing_objects.push(MissingObject {
                        id,
                        object_type: expected,
                        referenced_by,
                    });
                }
                continue;
            }

            let object = match odb.read(&id) {
                Ok(object) => object,
                Err(e) if e.is_not_found() => {
                    report.missing_objects.push(MissingObject {
                        id,
                        object_type: expected,
                        referenced_by,
                    });
                    continue;
                }
                Err(e) => {
                    if !report.corrupt_objects.iter().any(|c| c.id == id) {
                        report.corrupt_objects.push(CorruptObject {
                            id,
                            message: e.to_string(),
                        });
                    }
                    continue;
                }
            };

            if let Some(expected) = expected {
                if object.kind != expected {
                    report.corrupt_objects.push(CorruptObject {
                        id,
                        message: format!("{referenced_by} expects a {expected}, found a {}", object.kind),
                    });
                    continue;
                }
            }

            if let Err(e) = self.expand(&id, object.kind, &object.data) {
                report.corrupt_objects.push(CorruptObject {
                    id,
                    message: e.to_string(),
                });
            }
        }
    }

    fn expand(&mut self, id: &ObjectId, kind: ObjectType, data: &[u8]) -> Result<()> {
        let from = format!("{kind} {id}");
        match kind {
            ObjectType::Commit => {
                let commit = Commit::decode(id, data)?;
                self.push(commit.tree, Some(ObjectType::Tree), from.clone());
                for parent in commit.parents {
                    self.push(parent, Some(ObjectType::Commit), from.clone());
                }
            }
            ObjectType::Tree => {
                for entry in Tree::decode(id, data)?.entries() {
                    // submodule commits live in another repository
                    if entry.mode == EntryMode::Commit {
                        continue;
                    }
                    self.push(entry.id, Some(entry.mode.object_type()), format!("{from} entry {}", entry.name));
                }
            }
            ObjectType::Tag => {
                let tag = Tag::decode(id, data)?;
                self.push(tag.target, Some(tag.target_type), from);
            }
            ObjectType::Blob => {}
        }
        Ok(())
    }
}
