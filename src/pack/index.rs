use std::collections::HashMap;
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder};
use tracing::debug;

use crate::error::{Error, IoResultExt, Result};
use crate::hash::{digest, HashKind, ObjectId, Prefix};
use crate::pack::entry::EntryKind;
use crate::pack::file::{BaseLookup, PackFile};
use crate::types::RawObject;

/// `\377tOc`
const IDX_SIGNATURE: &[u8; 4] = b"\xfftOc";
const IDX_VERSION: u32 = 2;
const FANOUT_LEN: usize = 256 * 4;
const HEADER_LEN: usize = 8 + FANOUT_LEN;
/// offsets at or above this go to the 64-bit table
const LARGE_OFFSET_FLAG: u32 = 0x8000_0000;

/// one object's location inside a pack
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub id: ObjectId,
    pub offset: u64,
    pub crc32: u32,
}

/// sorted id -> offset table for one pack (idx version 2)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PackIndex {
    hash: HashKind,
    fanout: [u32; 256],
    ids: Vec<ObjectId>,
    crcs: Vec<u32>,
    offsets: Vec<u64>,
    pack_checksum: ObjectId,
}

impl PackIndex {
    /// index a set of entries
    ///
    /// an object stored twice keeps a row per copy, so the row count always
    /// matches the pack's entry count. lookups land on the lowest offset.
    pub fn from_entries(hash: HashKind, mut entries: Vec<IndexEntry>, pack_checksum: ObjectId) -> Self {
        entries.sort_by(|a, b| a.id.cmp(&b.id).then(a.offset.cmp(&b.offset)));

        let mut fanout = [0u32; 256];
        for entry in &entries {
            fanout[entry.id.first_byte() as usize] += 1;
        }
        for i in 1..256 {
            fanout[i] += fanout[i - 1];
        }

        Self {
            hash,
            fanout,
            ids: entries.iter().map(|e| e.id).collect(),
            crcs: entries.iter().map(|e| e.crc32).collect(),
            offsets: entries.iter().map(|e| e.offset).collect(),
            pack_checksum,
        }
    }

    /// index a pack by reading it once
    ///
    /// base entries are hashed as they stream past; deltas are resolved
    /// afterwards, with reference bases looked up in this pack first and in
    /// `external` second. any base that cannot be found is corruption.
    pub fn build<F>(pack: &PackFile, mut external: F) -> Result<Self>
    where
        F: FnMut(&ObjectId) -> Result<Option<RawObject>>,
    {
        let hash = pack.hash_kind();
        let mut entries = Vec::with_capacity(pack.num_objects() as usize);
        let mut by_id: HashMap<ObjectId, u64> = HashMap::new();
        let mut pending: Vec<(u64, u32)> = Vec::new();

        for scanned in pack.entries() {
            let scanned = scanned?;
            match scanned.header.kind {
                EntryKind::Base(kind) => {
                    let id = crate::hash::hash_object(hash, kind, &scanned.data);
                    by_id.entry(id).or_insert(scanned.offset);
                    entries.push(IndexEntry {
                        id,
                        offset: scanned.offset,
                        crc32: scanned.crc32,
                    });
                }
                _ => pending.push((scanned.offset, scanned.crc32)),
            }
        }

        // a ref delta may name a base that is itself a delta resolved later,
        // so keep sweeping until a pass makes no progress
        while !pending.is_empty() {
            let before = pending.len();
            let mut unresolved = Vec::new();

            for (offset, crc32) in pending {
                let mut missing = false;
                let result = pack.read_object(offset, |base| {
                    if let Some(&base_offset) = by_id.get(base) {
                        return Ok(BaseLookup::InPack(base_offset));
                    }
                    match external(base)? {
                        Some(object) => Ok(BaseLookup::External(object)),
                        None => {
                            missing = true;
                            Ok(BaseLookup::Missing)
                        }
                    }
                });

                match result {
                    Ok(object) => {
                        let id = object.id(hash);
                        by_id.entry(id).or_insert(offset);
                        entries.push(IndexEntry { id, offset, crc32 });
                    }
                    Err(_) if missing => unresolved.push((offset, crc32)),
                    Err(e) => return Err(e),
                }
            }

            if unresolved.len() == before {
                return Err(Error::corrupt_pack(
                    pack.path(),
                    format!("{} deltas have bases that cannot be found", unresolved.len()),
                ));
            }
            pending = unresolved;
        }

        debug!(pack = %pack.path().display(), objects = entries.len(), "indexed pack");
        Ok(Self::from_entries(hash, entries, pack.checksum()))
    }

    /// load and verify an index file
    pub fn open(path: &Path, hash: HashKind) -> Result<Self> {
        let data = std::fs::read(path).with_path(path)?;
        Self::parse(&data, hash, path)
    }

    fn parse(data: &[u8], hash: HashKind, path: &Path) -> Result<Self> {
        let corrupt = |msg: String| Error::corrupt_index(path, msg);
        let hl = hash.len();

        if data.len() < HEADER_LEN + 2 * hl {
            return Err(corrupt("file too short".into()));
        }
        if &data[..4] != IDX_SIGNATURE {
            return Err(corrupt("not a version 2 pack index".into()));
        }
        let version = BigEndian::read_u32(&data[4..8]);
        if version != IDX_VERSION {
            return Err(corrupt(format!("unsupported index version {version}")));
        }

        let (body, trailer) = data.split_at(data.len() - hl);
        if digest(hash, body).as_bytes() != trailer {
            return Err(corrupt("index checksum mismatch".into()));
        }

        let mut fanout = [0u32; 256];
        for (i, slot) in fanout.iter_mut().enumerate() {
            *slot = BigEndian::read_u32(&data[8 + i * 4..12 + i * 4]);
        }
        if fanout.windows(2).any(|w| w[0] > w[1]) {
            return Err(corrupt("fan-out table is not monotonic".into()));
        }
        let n = fanout[255] as usize;

        let ids_start = HEADER_LEN;
        let crcs_start = ids_start + n * hl;
        let offsets_start = crcs_start + n * 4;
        let large_start = offsets_start + n * 4;
        let large_end = data.len() - 2 * hl;
        if large_start > large_end || (large_end - large_start) % 8 != 0 {
            return Err(corrupt(format!("size does not fit {n} entries")));
        }
        let large: Vec<u64> = data[large_start..large_end]
            .chunks_exact(8)
            .map(BigEndian::read_u64)
            .collect();

        let ids = data[ids_start..crcs_start]
            .chunks_exact(hl)
            .map(|raw| ObjectId::from_bytes(hash, raw))
            .collect::<Result<Vec<_>>>()?;
        if ids.windows(2).any(|w| w[0] > w[1]) {
            return Err(corrupt("object ids are not sorted".into()));
        }

        let crcs = data[crcs_start..offsets_start]
            .chunks_exact(4)
            .map(BigEndian::read_u32)
            .collect();

        let offsets = data[offsets_start..large_start]
            .chunks_exact(4)
            .map(BigEndian::read_u32)
            .map(|raw| {
                if raw & LARGE_OFFSET_FLAG == 0 {
                    Ok(raw as u64)
                } else {
                    large
                        .get((raw & !LARGE_OFFSET_FLAG) as usize)
                        .copied()
                        .ok_or_else(|| corrupt("large offset index out of range".into()))
                }
            })
            .collect::<Result<Vec<_>>>()?;

        let pack_checksum = ObjectId::from_bytes(hash, &data[large_end..large_end + hl])?;

        let index = Self {
            hash,
            fanout,
            ids,
            crcs,
            offsets,
            pack_checksum,
        };
        if index.computed_fanout() != index.fanout {
            return Err(corrupt("fan-out table disagrees with ids".into()));
        }
        Ok(index)
    }

    /// serialize to the idx v2 layout
    pub fn encode(&self) -> Vec<u8> {
        let hl = self.hash.len();
        let n = self.ids.len();
        let mut out = Vec::with_capacity(HEADER_LEN + n * (hl + 8) + 2 * hl);

        out.extend_from_slice(IDX_SIGNATURE);
        out.extend_from_slice(&IDX_VERSION.to_be_bytes());
        for count in &self.fanout {
            out.extend_from_slice(&count.to_be_bytes());
        }
        for id in &self.ids {
            out.extend_from_slice(id.as_bytes());
        }
        for crc in &self.crcs {
            out.extend_from_slice(&crc.to_be_bytes());
        }

        let mut large = Vec::new();
        for &offset in &self.offsets {
            if offset < LARGE_OFFSET_FLAG as u64 {
                out.extend_from_slice(&(offset as u32).to_be_bytes());
            } else {
                out.extend_from_slice(&(LARGE_OFFSET_FLAG | large.len() as u32).to_be_bytes());
                large.push(offset);
            }
        }
        for offset in large {
            out.extend_from_slice(&offset.to_be_bytes());
        }

        out.extend_from_slice(self.pack_checksum.as_bytes());
        let checksum = digest(self.hash, &out);
        out.extend_from_slice(checksum.as_bytes());
        out
    }

    /// write atomically to `path`
    pub fn write_to(&self, path: &Path, fsync: bool) -> Result<()> {
        crate::fs::write_atomic(path, &self.encode(), fsync)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// checksum of the pack this index describes
    pub fn pack_checksum(&self) -> ObjectId {
        self.pack_checksum
    }

    /// offset of `id`, if indexed
    pub fn lookup(&self, id: &ObjectId) -> Option<u64> {
        self.position(id).map(|i| self.offsets[i])
    }

    /// offset of `id`, or `ObjectNotFound`
    pub fn find(&self, id: &ObjectId) -> Result<u64> {
        self.lookup(id).ok_or(Error::ObjectNotFound(*id))
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.position(id).is_some()
    }

    /// crc32 recorded for the raw entry of `id`
    pub fn crc_of(&self, id: &ObjectId) -> Option<u32> {
        self.position(id).map(|i| self.crcs[i])
    }

    /// ids starting with `prefix`, in order
    pub fn find_prefix(&self, prefix: &Prefix) -> Vec<ObjectId> {
        if prefix.as_id().kind() != self.hash {
            return vec![];
        }
        let bucket = self.bucket(prefix.first_byte());
        let ids = &self.ids[bucket.clone()];
        let start = ids.partition_point(|id| prefix.cmp_id(id) == std::cmp::Ordering::Greater);
        let mut found: Vec<ObjectId> = ids[start..]
            .iter()
            .take_while(|id| prefix.matches(id))
            .copied()
            .collect();
        found.dedup();
        found
    }

    /// every entry, in id order
    pub fn iter(&self) -> impl Iterator<Item = IndexEntry> + '_ {
        self.ids
            .iter()
            .zip(&self.offsets)
            .zip(&self.crcs)
            .map(|((&id, &offset), &crc32)| IndexEntry { id, offset, crc32 })
    }

    /// all object ids, in order
    pub fn ids(&self) -> &[ObjectId] {
        &self.ids
    }

    fn position(&self, id: &ObjectId) -> Option<usize> {
        if id.kind() != self.hash {
            return None;
        }
        let bucket = self.bucket(id.first_byte());
        let ids = &self.ids[bucket.clone()];
        let i = ids.partition_point(|candidate| candidate < id);
        (ids.get(i) == Some(id)).then_some(bucket.start + i)
    }

    fn bucket(&self, first: u8) -> std::ops::Range<usize> {
        let end = self.fanout[first as usize] as usize;
        let start = match first {
            0 => 0,
            b => self.fanout[b as usize - 1] as usize,
        };
        start..end
    }

    fn computed_fanout(&self) -> [u32; 256] {
        let mut fanout = [0u32; 256];
        for id in &self.ids {
            fanout[id.first_byte() as usize] += 1;
        }
        for i in 1..256 {
            fanout[i] += fanout[i - 1];
        }
        fanout
    }
}

/// `.idx` path for a `.pack` path
pub fn index_path_for(pack_path: &Path) -> PathBuf {
    pack_path.with_extension("idx")
}
