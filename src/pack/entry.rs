use crate::hash::{HashKind, ObjectId};
use crate::types::ObjectType;

/// pack type code of an offset delta
pub const OFS_DELTA: u8 = 6;
/// pack type code of a reference delta
pub const REF_DELTA: u8 = 7;

/// what a pack entry holds
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    /// a whole object of the given type
    Base(ObjectType),
    /// a delta against the entry at `base_offset`, earlier in the same pack
    OfsDelta { base_offset: u64 },
    /// a delta against the object `base`, located by id
    RefDelta { base: ObjectId },
}

impl EntryKind {
    pub fn is_delta(&self) -> bool {
        !matches!(self, EntryKind::Base(_))
    }
}

/// decoded entry header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryHeader {
    pub kind: EntryKind,
    /// inflated size of the payload (the delta stream for deltas)
    pub size: u64,
    /// bytes from the entry start to the zlib stream
    pub header_len: usize,
}

/// longest header we ever need to look at: size varint, then a 10-byte
/// offset or a raw id
pub const MAX_ENTRY_HEADER_LEN: usize = 10 + crate::hash::MAX_HASH_LEN;

/// append the type + size varint
pub fn encode_header(type_code: u8, size: u64, out: &mut Vec<u8>) {
    let mut remaining = size;
    let mut first = ((type_code & 0x07) << 4) | ((remaining & 0x0f) as u8);
    remaining >>= 4;
    if remaining != 0 {
        first |= 0x80;
    }
    out.push(first);
    while remaining != 0 {
        let mut byte = (remaining & 0x7f) as u8;
        remaining >>= 7;
        if remaining != 0 {
            byte |= 0x80;
        }
        out.push(byte);
    }
}

/// append the back-distance of an offset delta (big-endian base-128, +1 bias
/// on every continuation group)
pub fn encode_ofs_distance(distance: u64, out: &mut Vec<u8>) {
    let mut bytes = [0u8; 10];
    let mut pos = bytes.len() - 1;
    let mut dist = distance;
    bytes[pos] = (dist & 0x7f) as u8;
    dist >>= 7;
    while dist > 0 {
        dist -= 1;
        pos -= 1;
        bytes[pos] = 0x80 | (dist & 0x7f) as u8;
        dist >>= 7;
    }
    out.extend_from_slice(&bytes[pos..]);
}

/// decode the header of the entry starting at `offset`; `buf` holds the
/// bytes from `offset` onwards (at least `MAX_ENTRY_HEADER_LEN` unless the
/// pack ends sooner)
pub fn decode_header(buf: &[u8], offset: u64, hash: HashKind) -> Result<EntryHeader, &'static str> {
    let mut pos = 0;
    let first = *buf.first().ok_or("truncated entry header")?;
    pos += 1;

    let type_code = (first >> 4) & 0x07;
    let mut size = (first & 0x0f) as u64;
    let mut shift = 4;
    let mut byte = first;
    while byte & 0x80 != 0 {
        byte = *buf.get(pos).ok_or("truncated entry size")?;
        pos += 1;
        if shift > 57 {
            return Err("entry size overflows");
        }
        size |= ((byte & 0x7f) as u64) << shift;
        shift += 7;
    }

    let kind = match type_code {
        OFS_DELTA => {
            let mut byte = *buf.get(pos).ok_or("truncated delta offset")?;
            pos += 1;
            let mut distance = (byte & 0x7f) as u64;
            while byte & 0x80 != 0 {
                byte = *buf.get(pos).ok_or("truncated delta offset")?;
                pos += 1;
                distance = distance
                    .checked_add(1)
                    .and_then(|d| d.checked_mul(128))
                    .ok_or("delta offset overflows")?
                    | (byte & 0x7f) as u64;
            }
            if distance == 0 || distance > offset {
                return Err("delta base is not before the delta");
            }
            EntryKind::OfsDelta {
                base_offset: offset - distance,
            }
        }
        REF_DELTA => {
            let raw = buf.get(pos..pos + hash.len()).ok_or("truncated delta base id")?;
            pos += hash.len();
            let base = ObjectId::from_bytes(hash, raw).map_err(|_| "bad delta base id")?;
            EntryKind::RefDelta { base }
        }
        code => EntryKind::Base(ObjectType::from_pack_code(code).ok_or("unknown entry type")?),
    };

    Ok(EntryHeader {
        kind,
        size,
        header_len: pos,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_small_and_large() {
        for size in [0u64, 15, 16, 127, 128, 1 << 20, u32::MAX as u64 + 7] {
            let mut buf = Vec::new();
            encode_header(ObjectType::Blob.pack_code(), size, &mut buf);
            let header = decode_header(&buf, 12, HashKind::Sha1).unwrap();
            assert_eq!(header.kind, EntryKind::Base(ObjectType::Blob));
            assert_eq!(header.size, size);
            assert_eq!(header.header_len, buf.len());
        }
    }

    #[test]
    fn test_ofs_distance_bias() {
        // 128 is the first distance needing two bytes: 0x80 0x00 with the bias
        let mut buf = Vec::new();
        encode_ofs_distance(128, &mut buf);
        assert_eq!(buf, vec![0x80, 0x00]);

        for distance in [1u64, 127, 128, 16511, 16512, 1 << 35] {
            let mut buf = Vec::new();
            encode_header(OFS_DELTA, 3, &mut buf);
            encode_ofs_distance(distance, &mut buf);
            let offset = distance + 100;
            let header = decode_header(&buf, offset, HashKind::Sha1).unwrap();
            assert_eq!(header.kind, EntryKind::OfsDelta { base_offset: 100 });
            assert_eq!(header.header_len, buf.len());
        }
    }

    #[test]
    fn test_ofs_base_must_precede() {
        let mut buf = Vec::new();
        encode_header(OFS_DELTA, 3, &mut buf);
        encode_ofs_distance(50, &mut buf);
        assert!(decode_header(&buf, 40, HashKind::Sha1).is_err());
    }

    #[test]
    fn test_ref_delta_header() {
        let base = crate::hash::hash_object(HashKind::Sha256, ObjectType::Blob, b"base");
        let mut buf = Vec::new();
        encode_header(REF_DELTA, 9, &mut buf);
        buf.extend_from_slice(base.as_bytes());

        let header = decode_header(&buf, 12, HashKind::Sha256).unwrap();
        assert_eq!(header.kind, EntryKind::RefDelta { base });
        assert_eq!(header.header_len, 1 + 32);
    }

    #[test]
    fn test_reserved_types_rejected() {
        for code in [0u8, 5] {
            let mut buf = Vec::new();
            encode_header(code, 1, &mut buf);
            assert!(decode_header(&buf, 12, HashKind::Sha1).is_err());
        }
        assert!(decode_header(&[], 12, HashKind::Sha1).is_err());
        assert!(decode_header(&[0xb5], 12, HashKind::Sha1).is_err());
    }
}
