use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::write::ZlibEncoder;
use flate2::Compression;
use tracing::info;

use crate::error::{Error, IoResultExt, Result};
use crate::fs::{fsync_dir, temp_path_for};
use crate::hash::{hash_object, HashKind, HashWriter, ObjectId};
use crate::pack::delta::diff;
use crate::pack::entry::{encode_header, encode_ofs_distance, OFS_DELTA, REF_DELTA};
use crate::pack::index::{IndexEntry, PackIndex};
use crate::pack::{PACK_HEADER_LEN, PACK_SIGNATURE};
use crate::types::RawObject;

/// what `finish` reports about a written pack
#[derive(Clone, Debug)]
pub struct PackSummary {
    /// trailing checksum, also the pack's name
    pub checksum: ObjectId,
    /// id, offset and crc of every entry, in write order
    pub entries: Vec<IndexEntry>,
}

/// streaming pack encoder
///
/// the entry count goes into the header up front, so it must be known before
/// the first entry; `finish` fails if a different number was written.
pub struct PackWriter<W: Write> {
    out: HashWriter<W>,
    label: PathBuf,
    hash: HashKind,
    compression: Compression,
    expected: u32,
    entries: Vec<IndexEntry>,
}

impl<W: Write> PackWriter<W> {
    pub fn new(inner: W, hash: HashKind, count: u32, compression: Compression) -> Self {
        Self {
            out: HashWriter::new(inner, hash),
            label: PathBuf::from("<pack stream>"),
            hash,
            compression,
            expected: count,
            entries: Vec::with_capacity(count as usize),
        }
    }

    /// name used for this stream in error messages
    pub fn with_label(mut self, label: impl Into<PathBuf>) -> Self {
        self.label = label.into();
        self
    }

    /// bytes written so far, i.e. the offset of the next entry
    pub fn offset(&self) -> u64 {
        if self.out.written() == 0 {
            PACK_HEADER_LEN as u64
        } else {
            self.out.written()
        }
    }

    /// write a whole object; returns its id and offset
    pub fn write_base(&mut self, kind: crate::types::ObjectType, data: &[u8]) -> Result<(ObjectId, u64)> {
        let id = hash_object(self.hash, kind, data);
        let mut header = Vec::new();
        encode_header(kind.pack_code(), data.len() as u64, &mut header);
        let offset = self.write_entry(id, &header, data)?;
        Ok((id, offset))
    }

    /// write `delta` against the earlier entry at `base_offset`
    pub fn write_ofs_delta(&mut self, id: ObjectId, base_offset: u64, delta: &[u8]) -> Result<u64> {
        let offset = self.offset();
        if base_offset < PACK_HEADER_LEN as u64 || base_offset >= offset {
            return Err(Error::corrupt_pack(
                &self.label,
                format!("delta base {base_offset} is not an earlier entry"),
            ));
        }

        let mut header = Vec::new();
        encode_header(OFS_DELTA, delta.len() as u64, &mut header);
        encode_ofs_distance(offset - base_offset, &mut header);
        self.write_entry(id, &header, delta)
    }

    /// write `delta` against the object `base`, wherever it lives
    pub fn write_ref_delta(&mut self, id: ObjectId, base: ObjectId, delta: &[u8]) -> Result<u64> {
        let mut header = Vec::new();
        encode_header(REF_DELTA, delta.len() as u64, &mut header);
        header.extend_from_slice(base.as_bytes());
        self.write_entry(id, &header, delta)
    }

    /// write the trailer and hand back the sink
    pub fn finish(mut self) -> Result<(W, PackSummary)> {
        self.ensure_header()?;
        if self.entries.len() as u64 != self.expected as u64 {
            return Err(Error::PackEntryCount {
                expected: self.expected,
                written: self.entries.len(),
            });
        }

        let (mut inner, checksum) = self.out.into_parts();
        inner.write_all(checksum.as_bytes()).with_path(&self.label)?;
        inner.flush().with_path(&self.label)?;

        Ok((
            inner,
            PackSummary {
                checksum,
                entries: self.entries,
            },
        ))
    }

    fn ensure_header(&mut self) -> Result<()> {
        if self.out.written() == 0 {
            let mut header = Vec::with_capacity(PACK_HEADER_LEN);
            header.extend_from_slice(PACK_SIGNATURE);
            header.extend_from_slice(&2u32.to_be_bytes());
            header.extend_from_slice(&self.expected.to_be_bytes());
            self.out.write_all(&header).with_path(&self.label)?;
        }
        Ok(())
    }

    fn write_entry(&mut self, id: ObjectId, header: &[u8], payload: &[u8]) -> Result<u64> {
        self.ensure_header()?;
        if self.entries.len() as u64 >= self.expected as u64 {
            return Err(Error::PackEntryCount {
                expected: self.expected,
                written: self.entries.len() + 1,
            });
        }

        let offset = self.out.written();
        let mut encoder = ZlibEncoder::new(Vec::new(), self.compression);
        encoder.write_all(payload).with_path(&self.label)?;
        let compressed = encoder.finish().with_path(&self.label)?;

        let mut crc = flate2::Crc::new();
        crc.update(header);
        crc.update(&compressed);

        self.out.write_all(header).with_path(&self.label)?;
        self.out.write_all(&compressed).with_path(&self.label)?;

        self.entries.push(IndexEntry {
            id,
            offset,
            crc32: crc.sum(),
        });
        Ok(offset)
    }
}

/// how one object should be stored by `write_pack`
#[derive(Clone, Debug)]
pub enum PackInput {
    /// store the object whole
    Full(RawObject),
    /// store as a delta against the input at position `base` (must come earlier)
    OfsDelta { base: usize, object: RawObject },
    /// store as a delta against `base`, addressed by id; the base may live
    /// outside the pack
    RefDelta { base: RawObject, object: RawObject },
}

impl PackInput {
    pub fn object(&self) -> &RawObject {
        match self {
            PackInput::Full(object)
            | PackInput::OfsDelta { object, .. }
            | PackInput::RefDelta { object, .. } => object,
        }
    }
}

/// paths and checksum of a pack written to disk
#[derive(Clone, Debug)]
pub struct WrittenPack {
    pub pack_path: PathBuf,
    pub index_path: PathBuf,
    pub checksum: ObjectId,
    pub num_objects: usize,
}

/// write `inputs` as `pack-<checksum>.pack` plus its `.idx` into `dir`
///
/// both files are written to temp names and renamed into place, index last,
/// so readers never see a pack without a matching index. every input must be
/// a distinct object, and a delta must share its base's type.
pub fn write_pack(
    dir: &Path,
    hash: HashKind,
    compression: Compression,
    fsync: bool,
    inputs: &[PackInput],
) -> Result<WrittenPack> {
    check_inputs(dir, hash, inputs)?;
    fs::create_dir_all(dir).with_path(dir)?;
    let tmp_path = temp_path_for(&dir.join("pack"));

    let result = (|| {
        let file = File::create(&tmp_path).with_path(&tmp_path)?;
        let mut writer = PackWriter::new(BufWriter::new(file), hash, inputs.len() as u32, compression)
            .with_label(&tmp_path);

        let mut offsets = Vec::with_capacity(inputs.len());
        for (i, input) in inputs.iter().enumerate() {
            let offset = match input {
                PackInput::Full(object) => writer.write_base(object.kind, &object.data)?.1,
                PackInput::OfsDelta { base, object } => {
                    let delta = diff(&inputs[*base].object().data, &object.data).encode();
                    writer.write_ofs_delta(object.id(hash), offsets[*base], &delta)?
                }
                PackInput::RefDelta { base, object } => {
                    let delta = diff(&base.data, &object.data).encode();
                    writer.write_ref_delta(object.id(hash), base.id(hash), &delta)?
                }
            };
            offsets.push(offset);
        }

        let (buffered, summary) = writer.finish()?;
        let file = buffered
            .into_inner()
            .map_err(|e| e.into_error())
            .with_path(&tmp_path)?;
        if fsync {
            file.sync_all().with_path(&tmp_path)?;
        }
        Ok(summary)
    })();

    let summary = match result {
        Ok(summary) => summary,
        Err(e) => {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }
    };

    let name = format!("pack-{}", summary.checksum);
    let pack_path = dir.join(format!("{name}.pack"));
    let index_path = dir.join(format!("{name}.idx"));

    fs::rename(&tmp_path, &pack_path).with_path(&pack_path)?;
    let index = PackIndex::from_entries(hash, summary.entries, summary.checksum);
    index.write_to(&index_path, fsync)?;
    if fsync {
        fsync_dir(dir)?;
    }

    info!(pack = %pack_path.display(), objects = index.len(), "wrote pack");
    Ok(WrittenPack {
        pack_path,
        index_path,
        checksum: summary.checksum,
        num_objects: index.len(),
    })
}

fn check_inputs(dir: &Path, hash: HashKind, inputs: &[PackInput]) -> Result<()> {
    let mut seen = HashSet::with_capacity(inputs.len());
    for (i, input) in inputs.iter().enumerate() {
        let object = input.object();
        let id = object.id(hash);
        if !seen.insert(id) {
            return Err(Error::corrupt_pack(dir, format!("input {i} repeats object {id}")));
        }

        let base_kind = match input {
            PackInput::Full(_) => continue,
            PackInput::OfsDelta { base, .. } => match inputs.get(*base).filter(|_| *base < i) {
                Some(base_input) => base_input.object().kind,
                None => {
                    return Err(Error::corrupt_pack(
                        dir,
                        format!("input {i} deltas against later input {base}"),
                    ))
                }
            },
            PackInput::RefDelta { base, .. } => base.kind,
        };
        if base_kind != object.kind {
            return Err(Error::corrupt_pack(
                dir,
                format!("input {i} is a {} but deltas against a {base_kind}", object.kind),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::file::{BaseLookup, PackFile};
    use crate::types::ObjectType;
    use tempfile::tempdir;

    #[test]
    fn test_entry_count_enforced() {
        let mut short = PackWriter::new(Vec::new(), HashKind::Sha1, 2, Compression::default());
        short.write_base(ObjectType::Blob, b"one").unwrap();
        assert!(matches!(short.finish(), Err(Error::PackEntryCount { .. })));

        let mut long = PackWriter::new(Vec::new(), HashKind::Sha1, 1, Compression::default());
        long.write_base(ObjectType::Blob, b"one").unwrap();
        assert!(matches!(
            long.write_base(ObjectType::Blob, b"two"),
            Err(Error::PackEntryCount { .. })
        ));
    }

    #[test]
    fn test_empty_pack() {
        let writer = PackWriter::new(Vec::new(), HashKind::Sha1, 0, Compression::default());
        let (bytes, summary) = writer.finish().unwrap();
        assert_eq!(bytes.len(), 12 + 20);
        assert_eq!(&bytes[..4], b"PACK");
        assert!(summary.entries.is_empty());
    }

    #[test]
    fn test_ofs_delta_must_point_backwards() {
        let mut writer = PackWriter::new(Vec::new(), HashKind::Sha1, 2, Compression::default());
        let (id, offset) = writer.write_base(ObjectType::Blob, b"base").unwrap();
        assert!(writer.write_ofs_delta(id, offset + 1000, b"").is_err());
    }

    #[test]
    fn test_write_pack_files() {
        let dir = tempdir().unwrap();
        let base = RawObject::new(ObjectType::Blob, b"0123456789".repeat(10));
        let mut edited = base.data.clone();
        edited.extend_from_slice(b"tail");
        let target = RawObject::new(ObjectType::Blob, edited);

        let written = write_pack(
            dir.path(),
            HashKind::Sha1,
            Compression::default(),
            true,
            &[
                PackInput::Full(base.clone()),
                PackInput::OfsDelta {
                    base: 0,
                    object: target.clone(),
                },
            ],
        )
        .unwrap();

        assert!(written.pack_path.is_file());
        assert!(written.index_path.is_file());
        assert_eq!(
            written.pack_path.file_name().unwrap().to_string_lossy(),
            format!("pack-{}.pack", written.checksum)
        );

        let pack = PackFile::open(&written.pack_path, HashKind::Sha1, 50).unwrap();
        pack.verify_checksum().unwrap();
        let index = PackIndex::open(&written.index_path, HashKind::Sha1).unwrap();
        let offset = index.find(&target.id(HashKind::Sha1)).unwrap();
        let object = pack.read_object(offset, |_| Ok(BaseLookup::Missing)).unwrap();
        assert_eq!(object, target);
    }

    #[test]
    fn test_write_pack_rejects_forward_base() {
        let dir = tempdir().unwrap();
        let object = RawObject::new(ObjectType::Blob, b"x".to_vec());
        let result = write_pack(
            dir.path(),
            HashKind::Sha1,
            Compression::default(),
            false,
            &[PackInput::OfsDelta { base: 0, object }],
        );
        assert!(result.is_err());
        // nothing left behind
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_write_pack_rejects_repeated_object() {
        let dir = tempdir().unwrap();
        let object = RawObject::new(ObjectType::Blob, b"twice".to_vec());
        let result = write_pack(
            dir.path(),
            HashKind::Sha1,
            Compression::default(),
            false,
            &[PackInput::Full(object.clone()), PackInput::Full(object)],
        );
        assert!(matches!(result, Err(Error::CorruptPack { .. })));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_write_pack_rejects_delta_across_types() {
        let dir = tempdir().unwrap();
        let blob = RawObject::new(ObjectType::Blob, b"shared bytes, shared bytes".to_vec());
        let tag = RawObject::new(ObjectType::Tag, b"shared bytes, shared bytes!".to_vec());

        let ofs = write_pack(
            dir.path(),
            HashKind::Sha1,
            Compression::default(),
            false,
            &[
                PackInput::Full(blob.clone()),
                PackInput::OfsDelta { base: 0, object: tag.clone() },
            ],
        );
        assert!(matches!(ofs, Err(Error::CorruptPack { .. })));

        let by_ref = write_pack(
            dir.path(),
            HashKind::Sha1,
            Compression::default(),
            false,
            &[PackInput::RefDelta { base: blob, object: tag }],
        );
        assert!(matches!(by_ref, Err(Error::CorruptPack { .. })));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_index_keeps_repeated_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dup.pack");
        let mut writer = PackWriter::new(Vec::new(), HashKind::Sha1, 3, Compression::default());
        let (id, first) = writer.write_base(ObjectType::Blob, b"stored twice").unwrap();
        writer.write_base(ObjectType::Blob, b"stored twice").unwrap();
        writer.write_base(ObjectType::Blob, b"stored once").unwrap();
        let (bytes, summary) = writer.finish().unwrap();
        fs::write(&path, bytes).unwrap();

        let index = PackIndex::from_entries(HashKind::Sha1, summary.entries, summary.checksum);
        assert_eq!(index.len(), 3);
        assert_eq!(index.lookup(&id), Some(first));
        let prefix = crate::hash::Prefix::from_hex(HashKind::Sha1, &id.to_hex()).unwrap();
        assert_eq!(index.find_prefix(&prefix), vec![id]);

        let index_path = crate::pack::index_path_for(&path);
        index.write_to(&index_path, false).unwrap();
        let pack = crate::pack::Pack::open(&path, HashKind::Sha1, 10).unwrap();
        assert_eq!(pack.read(&id, |_| Ok(None)).unwrap().data, b"stored twice");
    }
}
