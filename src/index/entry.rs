use std::cmp::Ordering;

use bstr::BString;
use byteorder::{BigEndian, ByteOrder};

use crate::hash::{HashKind, ObjectId};
use crate::types::EntryMode;

const FLAG_ASSUME_VALID: u16 = 0x8000;
const FLAG_EXTENDED: u16 = 0x4000;
const FLAG_STAGE_SHIFT: u16 = 12;
const FLAG_NAME_MASK: u16 = 0x0fff;

const EXT_SKIP_WORKTREE: u16 = 0x4000;
const EXT_INTENT_TO_ADD: u16 = 0x2000;

/// ten 32-bit stat fields precede the id
const STAT_LEN: usize = 40;

/// merge stage of an index entry
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    #[default]
    Normal = 0,
    /// common ancestor side of a conflict
    Ancestor = 1,
    /// our side of a conflict
    Ours = 2,
    /// their side of a conflict
    Theirs = 3,
}

impl Stage {
    pub fn from_u16(stage: u16) -> Self {
        match stage & 0x3 {
            1 => Stage::Ancestor,
            2 => Stage::Ours,
            3 => Stage::Theirs,
            _ => Stage::Normal,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn is_conflict(self) -> bool {
        self != Stage::Normal
    }
}

/// seconds and nanoseconds as stored in the index
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Timestamp {
    pub secs: u32,
    pub nanos: u32,
}

impl Timestamp {
    pub fn new(secs: u32, nanos: u32) -> Self {
        Self { secs, nanos }
    }
}

/// one staged path
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    /// slash-separated path relative to the worktree root, as raw bytes
    pub path: BString,
    pub stage: Stage,
    pub id: ObjectId,
    pub mode: EntryMode,
    pub ctime: Timestamp,
    pub mtime: Timestamp,
    pub dev: u32,
    pub ino: u32,
    pub uid: u32,
    pub gid: u32,
    /// file size, truncated to 32 bits
    pub size: u32,
    pub assume_valid: bool,
    pub intent_to_add: bool,
    pub skip_worktree: bool,
}

impl IndexEntry {
    /// stage-0 entry with empty stat data
    pub fn new(path: impl Into<BString>, mode: EntryMode, id: ObjectId) -> Self {
        Self {
            path: path.into(),
            stage: Stage::Normal,
            id,
            mode,
            ctime: Timestamp::default(),
            mtime: Timestamp::default(),
            dev: 0,
            ino: 0,
            uid: 0,
            gid: 0,
            size: 0,
            assume_valid: false,
            intent_to_add: false,
            skip_worktree: false,
        }
    }

    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stage = stage;
        self
    }

    /// fill the stat fields from filesystem metadata
    pub fn with_stat(mut self, meta: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        self.ctime = Timestamp::new(meta.ctime() as u32, meta.ctime_nsec() as u32);
        self.mtime = Timestamp::new(meta.mtime() as u32, meta.mtime_nsec() as u32);
        self.dev = meta.dev() as u32;
        self.ino = meta.ino() as u32;
        self.uid = meta.uid();
        self.gid = meta.gid();
        self.size = meta.size() as u32;
        self
    }

    /// ordering key: path bytes, then stage
    pub fn cmp_key(&self, path: &[u8], stage: Stage) -> Ordering {
        self.path
            .as_slice()
            .cmp(path)
            .then(self.stage.cmp(&stage))
    }

    /// needs the version 3 extended flag word
    pub fn needs_extended(&self) -> bool {
        self.intent_to_add || self.skip_worktree
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        let start = out.len();
        let mut stat = [0u8; STAT_LEN];
        let fields = [
            self.ctime.secs,
            self.ctime.nanos,
            self.mtime.secs,
            self.mtime.nanos,
            self.dev,
            self.ino,
            self.mode.as_u32(),
            self.uid,
            self.gid,
            self.size,
        ];
        for (i, field) in fields.iter().enumerate() {
            BigEndian::write_u32(&mut stat[i * 4..i * 4 + 4], *field);
        }
        out.extend_from_slice(&stat);
        out.extend_from_slice(self.id.as_bytes());

        let mut flags = (self.path.len().min(FLAG_NAME_MASK as usize)) as u16;
        flags |= self.stage.as_u16() << FLAG_STAGE_SHIFT;
        if self.assume_valid {
            flags |= FLAG_ASSUME_VALID;
        }
        let extended = self.needs_extended();
        if extended {
            flags |= FLAG_EXTENDED;
        }
        out.extend_from_slice(&flags.to_be_bytes());

        if extended {
            let mut ext = 0u16;
            if self.skip_worktree {
                ext |= EXT_SKIP_WORKTREE;
            }
            if self.intent_to_add {
                ext |= EXT_INTENT_TO_ADD;
            }
            out.extend_from_slice(&ext.to_be_bytes());
        }

        out.extend_from_slice(&self.path);
        // at least one NUL, then pad to a multiple of 8
        let len = out.len() - start;
        let padded = (len + 8) & !7;
        out.resize(start + padded, 0);
    }

    /// decode one entry from the front of `data`, returning it and its
    /// on-disk length
    pub(crate) fn decode(data: &[u8], hash: HashKind, version: u32) -> Result<(Self, usize), &'static str> {
        let fixed = STAT_LEN + hash.len() + 2;
        if data.len() < fixed {
            return Err("truncated entry");
        }

        let field = |i: usize| BigEndian::read_u32(&data[i * 4..i * 4 + 4]);
        let mode = EntryMode::from_u32(field(6)).ok_or("invalid entry mode")?;
        if mode.is_tree() {
            return Err("directory entry in index");
        }
        let id = ObjectId::from_bytes(hash, &data[STAT_LEN..STAT_LEN + hash.len()])
            .map_err(|_| "bad entry id")?;
        let flags = BigEndian::read_u16(&data[fixed - 2..fixed]);

        let mut pos = fixed;
        let mut intent_to_add = false;
        let mut skip_worktree = false;
        if flags & FLAG_EXTENDED != 0 {
            if version < 3 {
                return Err("extended flags in a version 2 index");
            }
            let ext = BigEndian::read_u16(data.get(pos..pos + 2).ok_or("truncated entry")?);
            intent_to_add = ext & EXT_INTENT_TO_ADD != 0;
            skip_worktree = ext & EXT_SKIP_WORKTREE != 0;
            pos += 2;
        }

        let name_len = (flags & FLAG_NAME_MASK) as usize;
        let name_end = if name_len < FLAG_NAME_MASK as usize {
            pos + name_len
        } else {
            // long names are NUL-terminated instead
            pos + data[pos..].iter().position(|&b| b == 0).ok_or("unterminated path")?
        };
        let name = data.get(pos..name_end).ok_or("truncated path")?;

        let padded = (name_end + 8) & !7;
        let padding = data.get(name_end..padded).ok_or("truncated entry padding")?;
        if padding.iter().any(|&b| b != 0) {
            return Err("entry padding is not NUL");
        }

        let entry = Self {
            path: BString::from(name),
            stage: Stage::from_u16(flags >> FLAG_STAGE_SHIFT),
            id,
            mode,
            ctime: Timestamp::new(field(0), field(1)),
            mtime: Timestamp::new(field(2), field(3)),
            dev: field(4),
            ino: field(5),
            uid: field(7),
            gid: field(8),
            size: field(9),
            assume_valid: flags & FLAG_ASSUME_VALID != 0,
            intent_to_add,
            skip_worktree,
        };
        Ok((entry, padded))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_object;
    use crate::types::ObjectType;

    fn blob_id() -> ObjectId {
        hash_object(HashKind::Sha1, ObjectType::Blob, b"")
    }

    #[test]
    fn test_entry_padding() {
        // 40 + 20 + 2 + 1 byte name = 63 -> 64
        let mut out = Vec::new();
        IndexEntry::new("a", EntryMode::Blob, blob_id()).encode(&mut out);
        assert_eq!(out.len(), 64);

        // 62 + 2 = 64 -> needs a NUL, so 72
        let mut out = Vec::new();
        IndexEntry::new("ab", EntryMode::Blob, blob_id()).encode(&mut out);
        assert_eq!(out.len(), 72);
        assert_eq!(out[64], 0);
    }

    #[test]
    fn test_entry_decode_fields() {
        let mut entry = IndexEntry::new("dir/file.txt", EntryMode::BlobExecutable, blob_id())
            .with_stage(Stage::Theirs);
        entry.mtime = Timestamp::new(1_700_000_000, 42);
        entry.size = 1234;
        entry.assume_valid = true;

        let mut out = Vec::new();
        entry.encode(&mut out);
        let (decoded, len) = IndexEntry::decode(&out, HashKind::Sha1, 2).unwrap();
        assert_eq!(decoded, entry);
        assert_eq!(len, out.len());
    }

    #[test]
    fn test_extended_flags_need_v3() {
        let mut entry = IndexEntry::new("new-file", EntryMode::Blob, blob_id());
        entry.intent_to_add = true;
        assert!(entry.needs_extended());

        let mut out = Vec::new();
        entry.encode(&mut out);
        assert!(IndexEntry::decode(&out, HashKind::Sha1, 2).is_err());
        let (decoded, _) = IndexEntry::decode(&out, HashKind::Sha1, 3).unwrap();
        assert!(decoded.intent_to_add);
        assert!(!decoded.skip_worktree);
    }

    #[test]
    fn test_long_path() {
        let path = "d/".repeat(2100) + "f";
        let entry = IndexEntry::new(path.clone(), EntryMode::Blob, blob_id());
        let mut out = Vec::new();
        entry.encode(&mut out);
        let (decoded, _) = IndexEntry::decode(&out, HashKind::Sha1, 2).unwrap();
        assert_eq!(decoded.path, path);
    }

    #[test]
    fn test_sha256_entry() {
        let id = hash_object(HashKind::Sha256, ObjectType::Blob, b"x");
        let entry = IndexEntry::new("x", EntryMode::Link, id);
        let mut out = Vec::new();
        entry.encode(&mut out);
        assert_eq!(out.len() % 8, 0);
        let (decoded, _) = IndexEntry::decode(&out, HashKind::Sha256, 2).unwrap();
        assert_eq!(decoded.id, id);
    }

    #[test]
    fn test_stage_ordering() {
        let a = IndexEntry::new("same", EntryMode::Blob, blob_id()).with_stage(Stage::Ours);
        assert_eq!(a.cmp_key(b"same", Stage::Ancestor), Ordering::Greater);
        assert_eq!(a.cmp_key(b"same", Stage::Theirs), Ordering::Less);
        assert_eq!(a.cmp_key(b"samf", Stage::Normal), Ordering::Less);
    }

    #[test]
    fn test_non_utf8_path() {
        let entry = IndexEntry::new(&b"caf\xe9.txt"[..], EntryMode::Blob, blob_id());
        let mut out = Vec::new();
        entry.encode(&mut out);
        let (decoded, _) = IndexEntry::decode(&out, HashKind::Sha1, 2).unwrap();
        assert_eq!(decoded.path, &b"caf\xe9.txt"[..]);
    }

    #[test]
    fn test_legacy_group_writable_mode() {
        let mut out = Vec::new();
        IndexEntry::new("f", EntryMode::Blob, blob_id()).encode(&mut out);
        BigEndian::write_u32(&mut out[24..28], 0o100664);
        let (decoded, _) = IndexEntry::decode(&out, HashKind::Sha1, 2).unwrap();
        assert_eq!(decoded.mode, EntryMode::Blob);
    }
}
