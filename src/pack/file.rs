use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder};
use flate2::bufread::ZlibDecoder;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Error, IoResultExt, Result};
use crate::hash::{HashKind, Hasher, ObjectId};
use crate::pack::delta::{apply_delta, delta_sizes};
use crate::pack::entry::{decode_header, EntryHeader, EntryKind, MAX_ENTRY_HEADER_LEN};
use crate::pack::{PACK_HEADER_LEN, PACK_SIGNATURE};
use crate::types::{ObjectType, RawObject};

/// entries kept in the delta base cache
const BASE_CACHE_ENTRIES: usize = 64;
/// total payload bytes kept in the delta base cache
const BASE_CACHE_BYTES: usize = 32 << 20;

/// where the base of a reference delta can be found
pub enum BaseLookup {
    /// another entry of this pack
    InPack(u64),
    /// an object from outside the pack
    External(RawObject),
    Missing,
}

/// a raw entry as found by a sequential scan
#[derive(Clone, Debug)]
pub struct ScannedEntry {
    pub offset: u64,
    pub header: EntryHeader,
    /// inflated payload (delta stream for deltas)
    pub data: Vec<u8>,
    /// crc32 over the entry's raw bytes, header included
    pub crc32: u32,
    /// offset of the following entry
    pub next: u64,
}

/// an open packfile
///
/// entries are read with positional reads, so a `PackFile` can be shared
/// between threads.
pub struct PackFile {
    path: PathBuf,
    file: File,
    hash: HashKind,
    len: u64,
    version: u32,
    num_objects: u32,
    checksum: ObjectId,
    max_delta_depth: usize,
    cache: Mutex<BaseCache>,
}

impl PackFile {
    /// open a pack and validate its header and trailer shape
    pub fn open(path: &Path, hash: HashKind, max_delta_depth: usize) -> Result<Self> {
        let file = File::open(path).with_path(path)?;
        let len = file.metadata().with_path(path)?.len();

        if len < (PACK_HEADER_LEN + hash.len()) as u64 {
            return Err(Error::corrupt_pack(path, "file too short"));
        }

        let mut header = [0u8; PACK_HEADER_LEN];
        file.read_exact_at(&mut header, 0).with_path(path)?;
        if &header[..4] != PACK_SIGNATURE {
            return Err(Error::corrupt_pack(path, "bad signature"));
        }
        let version = BigEndian::read_u32(&header[4..8]);
        if version != 2 && version != 3 {
            return Err(Error::corrupt_pack(path, format!("unsupported version {version}")));
        }
        let num_objects = BigEndian::read_u32(&header[8..12]);

        let mut trailer = vec![0u8; hash.len()];
        file.read_exact_at(&mut trailer, len - hash.len() as u64)
            .with_path(path)?;
        let checksum = ObjectId::from_bytes(hash, &trailer)?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            hash,
            len,
            version,
            num_objects,
            checksum,
            max_delta_depth,
            cache: Mutex::new(BaseCache::default()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn hash_kind(&self) -> HashKind {
        self.hash
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn num_objects(&self) -> u32 {
        self.num_objects
    }

    /// trailing checksum as recorded in the file
    pub fn checksum(&self) -> ObjectId {
        self.checksum
    }

    /// offset where the trailer starts
    pub fn data_end(&self) -> u64 {
        self.len - self.hash.len() as u64
    }

    /// recompute the digest over the whole pack and compare with the trailer
    pub fn verify_checksum(&self) -> Result<()> {
        let mut hasher = Hasher::new(self.hash);
        let mut reader = BufReader::new(self.reader_at(0, self.data_end()));
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf).with_path(&self.path)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }

        let actual = hasher.finalize();
        if actual != self.checksum {
            return Err(Error::corrupt_pack(
                &self.path,
                format!("checksum mismatch: trailer {}, content {}", self.checksum, actual),
            ));
        }
        Ok(())
    }

    /// decode the header of the entry at `offset`
    pub fn entry_header(&self, offset: u64) -> Result<EntryHeader> {
        if offset < PACK_HEADER_LEN as u64 || offset >= self.data_end() {
            return Err(self.corrupt(offset, "offset outside the pack"));
        }
        let want = (self.data_end() - offset).min(MAX_ENTRY_HEADER_LEN as u64) as usize;
        let mut buf = vec![0u8; want];
        self.file.read_exact_at(&mut buf, offset).with_path(&self.path)?;
        decode_header(&buf, offset, self.hash).map_err(|msg| self.corrupt(offset, msg))
    }

    /// read the entry at `offset` as stored, returning the inflated payload
    /// and the number of compressed bytes consumed
    fn inflate_entry(&self, offset: u64, header: &EntryHeader) -> Result<(Vec<u8>, u64)> {
        let start = offset + header.header_len as u64;
        let reader = BufReader::new(self.reader_at(start, self.data_end()));
        let mut decoder = ZlibDecoder::new(reader);

        let mut data = Vec::with_capacity(header.size.min(16 << 20) as usize);
        (&mut decoder)
            .take(header.size)
            .read_to_end(&mut data)
            .map_err(|e| self.corrupt(offset, format!("inflate failed: {e}")))?;
        if data.len() as u64 != header.size {
            return Err(self.corrupt(
                offset,
                format!("entry inflates to {} bytes, header declares {}", data.len(), header.size),
            ));
        }

        // drive the stream to its end so the adler trailer is consumed too
        let mut probe = [0u8; 1];
        let extra = decoder
            .read(&mut probe)
            .map_err(|e| self.corrupt(offset, format!("inflate failed: {e}")))?;
        if extra != 0 {
            return Err(self.corrupt(offset, "entry inflates past its declared size"));
        }

        Ok((data, decoder.total_in()))
    }

    /// read one raw entry, with its crc, for sequential scans
    pub fn scan_entry(&self, offset: u64) -> Result<ScannedEntry> {
        let header = self.entry_header(offset)?;
        let (data, compressed_len) = self.inflate_entry(offset, &header)?;
        let next = offset + header.header_len as u64 + compressed_len;

        let mut raw = vec![0u8; (next - offset) as usize];
        self.file.read_exact_at(&mut raw, offset).with_path(&self.path)?;
        let mut crc = flate2::Crc::new();
        crc.update(&raw);

        Ok(ScannedEntry {
            offset,
            header,
            data,
            crc32: crc.sum(),
            next,
        })
    }

    /// iterate all entries front to back
    pub fn entries(&self) -> Entries<'_> {
        Entries {
            pack: self,
            offset: PACK_HEADER_LEN as u64,
            remaining: self.num_objects,
        }
    }

    /// crc32 of the raw entry at `offset`
    pub fn entry_crc(&self, offset: u64) -> Result<u32> {
        Ok(self.scan_entry(offset)?.crc32)
    }

    /// resolve the object stored at `offset`, following delta chains
    ///
    /// `lookup` locates the bases of reference deltas.
    pub fn read_object<F>(&self, offset: u64, mut lookup: F) -> Result<RawObject>
    where
        F: FnMut(&ObjectId) -> Result<BaseLookup>,
    {
        let mut chain: Vec<(u64, EntryHeader)> = Vec::new();
        let mut visited = HashSet::new();
        let mut current = offset;

        let mut object = loop {
            if !visited.insert(current) {
                return Err(self.corrupt(offset, "delta chain loops"));
            }
            if let Some(cached) = self.cache.lock().get(current) {
                break cached;
            }

            let header = self.entry_header(current)?;
            match header.kind {
                EntryKind::Base(kind) => {
                    let (data, _) = self.inflate_entry(current, &header)?;
                    break RawObject::new(kind, data);
                }
                EntryKind::OfsDelta { base_offset } => {
                    chain.push((current, header));
                    current = base_offset;
                }
                EntryKind::RefDelta { base } => {
                    chain.push((current, header));
                    match lookup(&base)? {
                        BaseLookup::InPack(base_offset) => current = base_offset,
                        BaseLookup::External(object) => break object,
                        BaseLookup::Missing => {
                            return Err(self.corrupt(current, format!("missing delta base {base}")))
                        }
                    }
                }
            }

            if chain.len() > self.max_delta_depth {
                return Err(self.corrupt(
                    offset,
                    format!("delta chain longer than {}", self.max_delta_depth),
                ));
            }
        };

        if !chain.is_empty() {
            debug!(pack = %self.path.display(), offset, depth = chain.len(), "resolving delta chain");
        }

        while let Some((delta_offset, header)) = chain.pop() {
            let (delta, _) = self.inflate_entry(delta_offset, &header)?;
            let data = apply_delta(&object.data, &delta)
                .map_err(|e| self.corrupt(delta_offset, e.to_string()))?;
            object = RawObject::new(object.kind, data);
            // intermediate results are likely bases of sibling deltas
            if !chain.is_empty() {
                self.cache.lock().insert(delta_offset, &object);
            }
        }

        Ok(object)
    }

    /// type and size of the object at `offset` without applying deltas
    pub fn read_header<F>(&self, offset: u64, mut lookup: F) -> Result<(ObjectType, u64)>
    where
        F: FnMut(&ObjectId) -> Result<BaseLookup>,
    {
        let first = self.entry_header(offset)?;
        let size = match first.kind {
            EntryKind::Base(kind) => return Ok((kind, first.size)),
            _ => {
                let (delta, _) = self.inflate_entry(offset, &first)?;
                delta_sizes(&delta)
                    .map_err(|e| self.corrupt(offset, e.to_string()))?
                    .1
            }
        };

        let mut visited = HashSet::from([offset]);
        let mut header = first;
        loop {
            let next = match header.kind {
                EntryKind::Base(kind) => return Ok((kind, size)),
                EntryKind::OfsDelta { base_offset } => base_offset,
                EntryKind::RefDelta { base } => match lookup(&base)? {
                    BaseLookup::InPack(base_offset) => base_offset,
                    BaseLookup::External(object) => return Ok((object.kind, size)),
                    BaseLookup::Missing => {
                        return Err(self.corrupt(offset, format!("missing delta base {base}")))
                    }
                },
            };
            if !visited.insert(next) || visited.len() > self.max_delta_depth + 1 {
                return Err(self.corrupt(offset, "delta chain loops or is too deep"));
            }
            header = self.entry_header(next)?;
        }
    }

    fn reader_at(&self, start: u64, end: u64) -> PackReader<'_> {
        PackReader {
            file: &self.file,
            pos: start,
            end,
        }
    }

    fn corrupt(&self, offset: u64, msg: impl std::fmt::Display) -> Error {
        Error::corrupt_pack(&self.path, format!("entry at {offset}: {msg}"))
    }
}

/// sequential iterator over a pack's entries
pub struct Entries<'a> {
    pack: &'a PackFile,
    offset: u64,
    remaining: u32,
}

impl Iterator for Entries<'_> {
    type Item = Result<ScannedEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        match self.pack.scan_entry(self.offset) {
            Ok(entry) => {
                self.offset = entry.next;
                if self.remaining == 0 && entry.next != self.pack.data_end() {
                    return Some(Err(self.pack.corrupt(entry.next, "trailing data after last entry")));
                }
                Some(Ok(entry))
            }
            Err(e) => {
                self.remaining = 0;
                Some(Err(e))
            }
        }
    }
}

/// positional reader over a byte range of the pack
struct PackReader<'a> {
    file: &'a File,
    pos: u64,
    end: u64,
}

impl Read for PackReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let left = self.end.saturating_sub(self.pos);
        if left == 0 {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(left) as usize;
        let n = self.file.read_at(&mut buf[..want], self.pos)?;
        self.pos += n as u64;
        Ok(n)
    }
}

/// small cache of resolved delta bases keyed by pack offset
#[derive(Default)]
struct BaseCache {
    objects: HashMap<u64, RawObject>,
    order: VecDeque<u64>,
    bytes: usize,
}

impl BaseCache {
    fn get(&self, offset: u64) -> Option<RawObject> {
        self.objects.get(&offset).cloned()
    }

    fn insert(&mut self, offset: u64, object: &RawObject) {
        if object.data.len() > BASE_CACHE_BYTES / 4 || self.objects.contains_key(&offset) {
            return;
        }
        self.bytes += object.data.len();
        self.objects.insert(offset, object.clone());
        self.order.push_back(offset);

        while self.order.len() > BASE_CACHE_ENTRIES || self.bytes > BASE_CACHE_BYTES {
            let Some(evicted) = self.order.pop_front() else {
                break;
            };
            if let Some(old) = self.objects.remove(&evicted) {
                self.bytes -= old.data.len();
            }
        }
    }
}
