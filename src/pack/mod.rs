pub mod delta;
pub mod entry;
pub mod file;
pub mod index;
pub mod writer;

pub use delta::{apply_delta, diff, Delta, DeltaError, Instruction};
pub use entry::{EntryHeader, EntryKind};
pub use file::{BaseLookup, PackFile};
pub use index::{index_path_for, IndexEntry, PackIndex};
pub use writer::{write_pack, PackInput, PackSummary, PackWriter, WrittenPack};

use std::path::Path;

use crate::error::{Error, Result};
use crate::hash::{HashKind, ObjectId, Prefix};
use crate::types::{ObjectType, RawObject};

/// `PACK`
pub const PACK_SIGNATURE: &[u8; 4] = b"PACK";
/// signature, version and entry count
pub const PACK_HEADER_LEN: usize = 12;

/// a packfile together with its index
pub struct Pack {
    file: PackFile,
    index: PackIndex,
}

impl Pack {
    /// open `pack_path` and its sibling `.idx`
    ///
    /// an index recorded against a different pack checksum is stale and
    /// reported as corruption.
    pub fn open(pack_path: &Path, hash: HashKind, max_delta_depth: usize) -> Result<Self> {
        let file = PackFile::open(pack_path, hash, max_delta_depth)?;
        let index = PackIndex::open(&index_path_for(pack_path), hash)?;
        Self::from_parts(file, index)
    }

    /// pair an open pack with an index, checking they belong together
    pub fn from_parts(file: PackFile, index: PackIndex) -> Result<Self> {
        if index.pack_checksum() != file.checksum() {
            return Err(Error::corrupt_index(
                index_path_for(file.path()),
                format!(
                    "stale index: written for pack {}, pack is {}",
                    index.pack_checksum(),
                    file.checksum()
                ),
            ));
        }
        if index.len() as u64 != file.num_objects() as u64 {
            return Err(Error::corrupt_index(
                index_path_for(file.path()),
                format!(
                    "index lists {} objects, pack holds {}",
                    index.len(),
                    file.num_objects()
                ),
            ));
        }
        Ok(Self { file, index })
    }

    pub fn file(&self) -> &PackFile {
        &self.file
    }

    pub fn index(&self) -> &PackIndex {
        &self.index
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.index.contains(id)
    }

    /// read `id`, resolving reference-delta bases in this pack first and
    /// through `external` second
    pub fn read<F>(&self, id: &ObjectId, mut external: F) -> Result<RawObject>
    where
        F: FnMut(&ObjectId) -> Result<Option<RawObject>>,
    {
        let offset = self.index.find(id)?;
        self.file.read_object(offset, |base| self.locate_base(base, &mut external))
    }

    pub fn read_header<F>(&self, id: &ObjectId, mut external: F) -> Result<(ObjectType, u64)>
    where
        F: FnMut(&ObjectId) -> Result<Option<RawObject>>,
    {
        let offset = self.index.find(id)?;
        self.file.read_header(offset, |base| self.locate_base(base, &mut external))
    }

    pub fn find_prefix(&self, prefix: &Prefix) -> Vec<ObjectId> {
        self.index.find_prefix(prefix)
    }

    fn locate_base<F>(&self, base: &ObjectId, external: &mut F) -> Result<BaseLookup>
    where
        F: FnMut(&ObjectId) -> Result<Option<RawObject>>,
    {
        if let Some(offset) = self.index.lookup(base) {
            return Ok(BaseLookup::InPack(offset));
        }
        Ok(match external(base)? {
            Some(object) => BaseLookup::External(object),
            None => BaseLookup::Missing,
        })
    }
}
