//! the staging index (`.git/index`, `DIRC` format)

pub mod entry;
pub mod extension;

pub use entry::{IndexEntry, Stage, Timestamp};
pub use extension::{RawExtension, ResolveUndoEntry};

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use bstr::{BStr, BString, ByteSlice};
use byteorder::{BigEndian, ByteOrder};
use tracing::debug;

use crate::error::{Error, IoResultExt, Result};
use crate::hash::{digest, HashKind, ObjectId};
use crate::lock::LockFile;
use crate::odb::Odb;
use crate::types::{EntryMode, Tree, TreeEntry};

/// `DIRC`
pub const INDEX_SIGNATURE: &[u8; 4] = b"DIRC";
const HEADER_LEN: usize = 12;

/// all sides of one conflicted path
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Conflict {
    pub path: BString,
    pub ancestor: Option<IndexEntry>,
    pub ours: Option<IndexEntry>,
    pub theirs: Option<IndexEntry>,
}

/// what the file looked like when last loaded or written
///
/// every write renames a new file into place, so the inode changes even
/// when mtime and size do not.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Stamp {
    mtime: Option<SystemTime>,
    len: u64,
    dev: u64,
    ino: u64,
}

impl Stamp {
    fn of(path: &Path) -> Result<Option<Self>> {
        use std::os::unix::fs::MetadataExt;
        match std::fs::metadata(path) {
            Ok(meta) => Ok(Some(Self {
                mtime: meta.modified().ok(),
                len: meta.len(),
                dev: meta.dev(),
                ino: meta.ino(),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_path(path),
        }
    }
}

/// in-memory staging index, kept sorted by (path, stage)
#[derive(Debug)]
pub struct Index {
    path: PathBuf,
    hash: HashKind,
    fsync: bool,
    entries: Vec<IndexEntry>,
    resolve_undo: Vec<ResolveUndoEntry>,
    extensions: Vec<RawExtension>,
    stamp: Option<Stamp>,
}

impl Index {
    /// empty index bound to `path`; nothing is read yet
    pub fn new(path: &Path, hash: HashKind, fsync: bool) -> Self {
        Self {
            path: path.to_path_buf(),
            hash,
            fsync,
            entries: Vec::new(),
            resolve_undo: Vec::new(),
            extensions: Vec::new(),
            stamp: None,
        }
    }

    /// load the index at `path`; a missing file is an empty index
    pub fn open(path: &Path, hash: HashKind, fsync: bool) -> Result<Self> {
        let mut index = Self::new(path, hash, fsync);
        index.read(true)?;
        Ok(index)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// reload from disk
    ///
    /// without `force` the file is only parsed again when its mtime, size or
    /// inode moved since the last load or write. returns whether anything was read.
    pub fn read(&mut self, force: bool) -> Result<bool> {
        let stamp = Stamp::of(&self.path)?;
        if !force && stamp == self.stamp {
            return Ok(false);
        }

        self.clear();
        if stamp.is_some() {
            let data = std::fs::read(&self.path).with_path(&self.path)?;
            self.parse(&data)?;
        }
        self.stamp = stamp;
        debug!(path = %self.path.display(), entries = self.entries.len(), "loaded index");
        Ok(true)
    }

    /// serialize and atomically replace the file on disk
    pub fn write(&mut self) -> Result<()> {
        let data = self.encode();
        let mut lock = LockFile::acquire(&self.path, self.fsync)?;
        lock.write_all(&data)?;
        lock.commit()?;
        self.stamp = Stamp::of(&self.path)?;
        debug!(path = %self.path.display(), entries = self.entries.len(), "wrote index");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// every entry in (path, stage) order
    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &IndexEntry> {
        self.entries.iter()
    }

    pub fn get(&self, path: impl AsRef<[u8]>, stage: Stage) -> Option<&IndexEntry> {
        self.position(path.as_ref(), stage).ok().map(|i| &self.entries[i])
    }

    pub fn resolve_undo(&self) -> &[ResolveUndoEntry] {
        &self.resolve_undo
    }

    /// optional extensions carried through unchanged
    pub fn extensions(&self) -> &[RawExtension] {
        &self.extensions
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.resolve_undo.clear();
        self.extensions.clear();
    }

    /// stage `entry` at stage 0
    ///
    /// conflict stages of the same path are dropped into the resolve-undo
    /// record, and entries that would make the path both a file and a
    /// directory are removed.
    pub fn add(&mut self, mut entry: IndexEntry) -> Result<()> {
        validate_entry(&entry)?;
        entry.stage = Stage::Normal;

        let path = entry.path.clone();
        self.record_resolve_undo(&path);
        self.remove_collisions(&path);
        match self.position(&entry.path, Stage::Normal) {
            Ok(i) => self.entries[i] = entry,
            Err(i) => self.entries.insert(i, entry),
        }
        Ok(())
    }

    /// remove every stage of `path`
    pub fn remove(&mut self, path: impl AsRef<[u8]>) -> Result<()> {
        let path = path.as_ref();
        let range = self.path_range(path);
        if range.is_empty() {
            return Err(Error::PathNotFound(path.as_bstr().to_string()));
        }
        self.entries.drain(range);
        Ok(())
    }

    /// remove everything below `dir`, returning how many entries went
    pub fn remove_directory(&mut self, dir: impl AsRef<[u8]>) -> Result<usize> {
        let dir = dir.as_ref().trim_end_with(|c| c == '/');
        validate_path(dir)?;
        let prefix = [dir, &b"/"[..]].concat();
        let before = self.entries.len();
        self.entries.retain(|e| !e.path.starts_with(&prefix));
        Ok(before - self.entries.len())
    }

    /// record a conflict; the sides must share one path and at least one
    /// must be present. any stage-0 entry for the path is replaced.
    pub fn conflict_add(
        &mut self,
        ancestor: Option<IndexEntry>,
        ours: Option<IndexEntry>,
        theirs: Option<IndexEntry>,
    ) -> Result<()> {
        let sides: Vec<IndexEntry> = [
            ancestor.map(|e| e.with_stage(Stage::Ancestor)),
            ours.map(|e| e.with_stage(Stage::Ours)),
            theirs.map(|e| e.with_stage(Stage::Theirs)),
        ]
        .into_iter()
        .flatten()
        .collect();

        let path = match sides.first() {
            Some(first) => first.path.clone(),
            None => return Err(Error::InvalidPath("conflict without any side".into())),
        };
        for side in &sides {
            if side.path != path {
                return Err(Error::InvalidPath(format!(
                    "conflict sides name different paths: {path} and {}",
                    side.path
                )));
            }
            validate_entry(side)?;
        }

        let range = self.path_range(&path);
        self.entries.drain(range);
        self.remove_collisions(&path);
        self.resolve_undo.retain(|r| r.path != path);

        for side in sides {
            match self.position(&side.path, side.stage) {
                Ok(i) => self.entries[i] = side,
                Err(i) => self.entries.insert(i, side),
            }
        }
        Ok(())
    }

    pub fn conflict_get(&self, path: impl AsRef<[u8]>) -> Result<Conflict> {
        let path = path.as_ref();
        let mut conflict = Conflict {
            path: BString::from(path),
            ancestor: None,
            ours: None,
            theirs: None,
        };
        let mut found = false;
        for entry in &self.entries[self.path_range(path)] {
            let slot = match entry.stage {
                Stage::Normal => continue,
                Stage::Ancestor => &mut conflict.ancestor,
                Stage::Ours => &mut conflict.ours,
                Stage::Theirs => &mut conflict.theirs,
            };
            *slot = Some(entry.clone());
            found = true;
        }
        if !found {
            return Err(Error::PathNotFound(path.as_bstr().to_string()));
        }
        Ok(conflict)
    }

    /// drop the conflict stages of `path` without staging a resolution
    pub fn conflict_remove(&mut self, path: impl AsRef<[u8]>) -> Result<()> {
        let path = path.as_ref();
        let before = self.entries.len();
        self.entries
            .retain(|e| e.path != path || !e.stage.is_conflict());
        if self.entries.len() == before {
            return Err(Error::PathNotFound(path.as_bstr().to_string()));
        }
        Ok(())
    }

    /// every conflicted path, in path order
    pub fn conflicts(&self) -> Vec<Conflict> {
        let mut paths: Vec<&[u8]> = self
            .entries
            .iter()
            .filter(|e| e.stage.is_conflict())
            .map(|e| e.path.as_slice())
            .collect();
        paths.dedup();
        paths
            .into_iter()
            .filter_map(|p| self.conflict_get(p).ok())
            .collect()
    }

    pub fn has_conflicts(&self) -> bool {
        self.entries.iter().any(|e| e.stage.is_conflict())
    }

    /// write the staged contents as trees, returning the root tree id
    pub fn write_tree(&self, odb: &Odb) -> Result<ObjectId> {
        if let Some(entry) = self.entries.iter().find(|e| e.stage.is_conflict()) {
            return Err(Error::Unmerged(entry.path.to_string()));
        }

        let staged: Vec<(&[u8], &IndexEntry)> = self
            .entries
            .iter()
            .filter(|e| !e.intent_to_add)
            .map(|e| (e.path.as_slice(), e))
            .collect();
        let id = write_subtree(odb, &staged)?;
        debug!(tree = %id, entries = staged.len(), "wrote tree from index");
        Ok(id)
    }

    /// replace the contents with the blobs reachable from `tree`
    pub fn read_tree(&mut self, odb: &Odb, tree: &ObjectId) -> Result<()> {
        let mut entries = Vec::new();
        collect_tree(odb, tree, b"", &mut entries)?;
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        self.entries = entries;
        self.resolve_undo.clear();
        Ok(())
    }

    fn position(&self, path: &[u8], stage: Stage) -> std::result::Result<usize, usize> {
        self.entries.binary_search_by(|e| e.cmp_key(path, stage))
    }

    /// all stages of `path`
    fn path_range(&self, path: &[u8]) -> std::ops::Range<usize> {
        let start = self.entries.partition_point(|e| e.path.as_slice() < path);
        let end = self.entries.partition_point(|e| e.path.as_slice() <= path);
        start..end
    }

    fn remove_collisions(&mut self, path: &[u8]) {
        let below = [path, &b"/"[..]].concat();
        self.entries.retain(|e| {
            let is_child = e.path.starts_with(&below);
            let is_parent = path.len() > e.path.len()
                && path.starts_with(&e.path)
                && path[e.path.len()] == b'/';
            !is_child && !is_parent
        });
    }

    fn record_resolve_undo(&mut self, path: &[u8]) {
        let range = self.path_range(path);
        let mut record = ResolveUndoEntry::new(path);
        let mut found = false;
        for entry in &self.entries[range] {
            if entry.stage.is_conflict() {
                let slot = entry.stage.as_u16() as usize - 1;
                record.modes[slot] = Some(entry.mode);
                record.ids[slot] = Some(entry.id);
                found = true;
            }
        }
        if !found {
            return;
        }

        self.entries
            .retain(|e| e.path != path || !e.stage.is_conflict());

        match self
            .resolve_undo
            .binary_search_by(|r| r.path.as_slice().cmp(path))
        {
            Ok(i) => self.resolve_undo[i] = record,
            Err(i) => self.resolve_undo.insert(i, record),
        }
    }

    fn encode(&self) -> Vec<u8> {
        let version: u32 = if self.entries.iter().any(IndexEntry::needs_extended) {
            3
        } else {
            2
        };

        let mut out = Vec::with_capacity(HEADER_LEN + self.entries.len() * 80);
        out.extend_from_slice(INDEX_SIGNATURE);
        out.extend_from_slice(&version.to_be_bytes());
        out.extend_from_slice(&(self.entries.len() as u32).to_be_bytes());
        for entry in &self.entries {
            entry.encode(&mut out);
        }

        if !self.resolve_undo.is_empty() {
            let mut body = Vec::new();
            extension::encode_resolve_undo(&self.resolve_undo, &mut body);
            push_extension(&mut out, &extension::RESOLVE_UNDO, &body);
        }
        for ext in &self.extensions {
            push_extension(&mut out, &ext.signature, &ext.data);
        }

        let checksum = digest(self.hash, &out);
        out.extend_from_slice(checksum.as_bytes());
        out
    }

    fn parse(&mut self, data: &[u8]) -> Result<()> {
        let corrupt = |message: &str| Error::corrupt_index(&self.path, message.to_string());
        let hash_len = self.hash.len();

        if data.len() < HEADER_LEN + hash_len || &data[..4] != INDEX_SIGNATURE {
            return Err(corrupt("not an index file"));
        }
        let version = BigEndian::read_u32(&data[4..8]);
        if !(2..=3).contains(&version) {
            return Err(corrupt(&format!("unsupported index version {version}")));
        }

        let body_end = data.len() - hash_len;
        let trailer = &data[body_end..];
        // an all-zero trailer means the writer skipped hashing
        if trailer.iter().any(|&b| b != 0) && digest(self.hash, &data[..body_end]).as_bytes() != trailer {
            return Err(corrupt("index checksum mismatch"));
        }

        let count = BigEndian::read_u32(&data[8..12]) as usize;
        let mut entries: Vec<IndexEntry> = Vec::with_capacity(count.min(body_end / 62));
        let mut pos = HEADER_LEN;
        for _ in 0..count {
            let (entry, len) =
                IndexEntry::decode(&data[pos..body_end], self.hash, version).map_err(corrupt)?;
            if let Some(prev) = entries.last() {
                if prev.cmp_key(&entry.path, entry.stage).is_ge() {
                    return Err(corrupt(&format!("entries out of order at {}", entry.path)));
                }
                if prev.path == entry.path && prev.stage == Stage::Normal {
                    return Err(corrupt(&format!("{} is both staged and conflicted", entry.path)));
                }
            }
            entries.push(entry);
            pos += len;
        }

        let mut resolve_undo = Vec::new();
        let mut extensions = Vec::new();
        while pos < body_end {
            if pos + 8 > body_end {
                return Err(corrupt("truncated extension header"));
            }
            let header = &data[pos..pos + 8];
            let mut signature = [0u8; 4];
            signature.copy_from_slice(&header[..4]);
            let size = BigEndian::read_u32(&header[4..8]) as usize;
            let start = pos + 8;
            let end = start
                .checked_add(size)
                .filter(|&end| end <= body_end)
                .ok_or_else(|| corrupt("truncated extension"))?;
            let body = &data[start..end];

            match signature {
                extension::RESOLVE_UNDO => {
                    resolve_undo = extension::parse_resolve_undo(body, self.hash).map_err(corrupt)?;
                }
                extension::CACHED_TREE => {}
                _ if RawExtension::is_optional(&signature) => extensions.push(RawExtension {
                    signature,
                    data: body.to_vec(),
                }),
                _ => {
                    return Err(corrupt(&format!(
                        "unsupported mandatory extension {}",
                        String::from_utf8_lossy(&signature)
                    )))
                }
            }
            pos = end;
        }

        self.entries = entries;
        self.resolve_undo = resolve_undo;
        self.extensions = extensions;
        Ok(())
    }
}

fn push_extension(out: &mut Vec<u8>, signature: &[u8; 4], body: &[u8]) {
    out.extend_from_slice(signature);
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(body);
}

/// write one directory level; `entries` carry the path below this level
fn write_subtree(odb: &Odb, entries: &[(&[u8], &IndexEntry)]) -> Result<ObjectId> {
    let mut tree_entries = Vec::new();
    let mut i = 0;
    while i < entries.len() {
        let (rest, entry) = entries[i];
        let Some((dir, _)) = rest.split_once_str("/") else {
            tree_entries.push(TreeEntry::new(rest, entry.mode, entry.id));
            i += 1;
            continue;
        };

        // sorted paths keep a directory's entries contiguous
        let mut children = Vec::new();
        while let Some((child_rest, child)) = entries.get(i) {
            match child_rest.split_once_str("/") {
                Some((d, below)) if d == dir => {
                    children.push((below, *child));
                    i += 1;
                }
                _ => break,
            }
        }
        let id = write_subtree(odb, &children)?;
        tree_entries.push(TreeEntry::new(dir, EntryMode::Tree, id));
    }
    odb.write_tree(&Tree::new(tree_entries)?)
}

fn collect_tree(odb: &Odb, id: &ObjectId, prefix: &[u8], out: &mut Vec<IndexEntry>) -> Result<()> {
    let tree = odb.read_tree(id)?;
    for entry in tree.entries() {
        let path = if prefix.is_empty() {
            entry.name.clone()
        } else {
            BString::from([prefix, &b"/"[..], entry.name.as_slice()].concat())
        };
        if entry.mode.is_tree() {
            collect_tree(odb, &entry.id, &path, out)?;
        } else {
            out.push(IndexEntry::new(path, entry.mode, entry.id));
        }
    }
    Ok(())
}

fn validate_entry(entry: &IndexEntry) -> Result<()> {
    validate_path(&entry.path)?;
    if entry.mode.is_tree() {
        return Err(Error::InvalidPath(format!("{}: directories cannot be staged", entry.path)));
    }
    Ok(())
}

/// relative, slash-separated, no empty, `.` or `..` components, no `.git`
///
/// any other byte but NUL is allowed; paths need not be utf-8.
pub fn validate_path(path: &[u8]) -> Result<()> {
    let invalid = || Error::InvalidPath(BStr::new(path).to_string());
    if path.is_empty() || path.contains(&0) {
        return Err(invalid());
    }
    for component in path.split(|&b| b == b'/') {
        match component {
            b"" | b"." | b".." => return Err(invalid()),
            c if c.eq_ignore_ascii_case(b".git") => return Err(invalid()),
            _ => {}
        }
    }
    Ok(())
}
