use serde::{Deserialize, Serialize};
use sha1::Digest;
use std::cmp::Ordering;
use std::fmt;
use std::io::{self, Write};

use crate::types::ObjectType;
use crate::Error;

/// longest digest we support (sha256)
pub const MAX_HASH_LEN: usize = 32;

/// digest algorithm a repository is addressed with
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashKind {
    #[default]
    Sha1,
    Sha256,
}

impl HashKind {
    /// raw digest length in bytes
    pub const fn len(self) -> usize {
        match self {
            HashKind::Sha1 => 20,
            HashKind::Sha256 => 32,
        }
    }

    /// digest length in hex characters
    pub const fn hex_len(self) -> usize {
        self.len() * 2
    }

    /// the all-zero id for this algorithm
    pub const fn null_id(self) -> ObjectId {
        ObjectId {
            kind: self,
            bytes: [0u8; MAX_HASH_LEN],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HashKind::Sha1 => "sha1",
            HashKind::Sha256 => "sha256",
        }
    }
}

/// content address of an object
///
/// ordering is byte-wise over the digest; ids of different algorithms never
/// compare equal.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId {
    kind: HashKind,
    bytes: [u8; MAX_HASH_LEN],
}

impl ObjectId {
    /// create from a raw digest; length selects nothing, it must match `kind`
    pub fn from_bytes(kind: HashKind, raw: &[u8]) -> crate::Result<Self> {
        if raw.len() != kind.len() {
            return Err(Error::InvalidHashHex(format!(
                "expected {} raw bytes for {}, got {}",
                kind.len(),
                kind.as_str(),
                raw.len()
            )));
        }
        let mut bytes = [0u8; MAX_HASH_LEN];
        bytes[..raw.len()].copy_from_slice(raw);
        Ok(Self { kind, bytes })
    }

    /// parse from hex string; 40 chars is sha1, 64 chars is sha256
    pub fn from_hex(s: &str) -> crate::Result<Self> {
        let kind = match s.len() {
            40 => HashKind::Sha1,
            64 => HashKind::Sha256,
            _ => return Err(Error::InvalidHashHex(s.to_string())),
        };
        let raw = hex::decode(s).map_err(|_| Error::InvalidHashHex(s.to_string()))?;
        Self::from_bytes(kind, &raw)
    }

    /// parse hex that must belong to `kind`
    pub fn from_hex_kind(kind: HashKind, s: &str) -> crate::Result<Self> {
        let id = Self::from_hex(s)?;
        if id.kind != kind {
            return Err(Error::InvalidHashHex(s.to_string()));
        }
        Ok(id)
    }

    /// the digest algorithm
    pub fn kind(&self) -> HashKind {
        self.kind
    }

    /// get raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.kind.len()]
    }

    /// first digest byte, the fan-out bucket
    pub fn first_byte(&self) -> u8 {
        self.bytes[0]
    }

    /// convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }

    /// abbreviated hex form
    pub fn to_short_hex(&self, len: usize) -> String {
        let mut hex = self.to_hex();
        hex.truncate(len.min(self.kind.hex_len()));
        hex
    }

    pub fn is_null(&self) -> bool {
        self.as_bytes().iter().all(|&b| b == 0)
    }

    /// split into path components for the loose object store
    /// returns (first 2 hex chars, remaining hex chars)
    pub fn to_path_components(&self) -> (String, String) {
        let hex = self.to_hex();
        (hex[..2].to_string(), hex[2..].to_string())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", &self.to_hex()[..12])
    }
}

impl Serialize for ObjectId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// abbreviated object id used for short-id resolution
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Prefix {
    id: ObjectId,
    hex_len: usize,
}

impl Prefix {
    /// shortest prefix we accept
    pub const MIN_HEX_LEN: usize = 4;

    /// parse an abbreviated hex id for a repository using `kind`
    pub fn from_hex(kind: HashKind, s: &str) -> crate::Result<Self> {
        if s.len() < Self::MIN_HEX_LEN
            || s.len() > kind.hex_len()
            || !s.bytes().all(|c| c.is_ascii_hexdigit())
        {
            return Err(Error::InvalidHashHex(s.to_string()));
        }

        let mut bytes = [0u8; MAX_HASH_LEN];
        for (i, c) in s.bytes().enumerate() {
            let nibble = hex_value(c.to_ascii_lowercase());
            if i % 2 == 0 {
                bytes[i / 2] = nibble << 4;
            } else {
                bytes[i / 2] |= nibble;
            }
        }

        Ok(Self {
            id: ObjectId { kind, bytes },
            hex_len: s.len(),
        })
    }

    /// a prefix covering a full id
    pub fn from_id(id: ObjectId) -> Self {
        Self {
            id,
            hex_len: id.kind.hex_len(),
        }
    }

    pub fn hex_len(&self) -> usize {
        self.hex_len
    }

    /// does this prefix span the whole id
    pub fn is_full(&self) -> bool {
        self.hex_len == self.id.kind.hex_len()
    }

    /// the id padded with zeros, i.e. the smallest id with this prefix
    pub fn as_id(&self) -> &ObjectId {
        &self.id
    }

    pub fn first_byte(&self) -> u8 {
        self.id.first_byte()
    }

    /// compare the prefix against the same leading nibbles of `id`
    pub fn cmp_id(&self, id: &ObjectId) -> Ordering {
        let full = self.hex_len / 2;
        match id.as_bytes()[..full].cmp(&self.id.bytes[..full]) {
            Ordering::Equal if self.hex_len % 2 == 1 => {
                (id.bytes[full] & 0xf0).cmp(&self.id.bytes[full])
            }
            other => other,
        }
        .reverse()
    }

    pub fn matches(&self, id: &ObjectId) -> bool {
        id.kind == self.id.kind && self.cmp_id(id) == Ordering::Equal
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id.to_short_hex(self.hex_len))
    }
}

impl fmt::Debug for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Prefix({})", self)
    }
}

fn hex_value(c: u8) -> u8 {
    match c {
        b'0'..=b'9' => c - b'0',
        b'a'..=b'f' => c - b'a' + 10,
        _ => 0,
    }
}

/// streaming digest over either supported algorithm
#[derive(Clone)]
pub struct Hasher {
    inner: HasherInner,
}

#[derive(Clone)]
enum HasherInner {
    Sha1(sha1::Sha1),
    Sha256(sha2::Sha256),
}

impl Hasher {
    pub fn new(kind: HashKind) -> Self {
        let inner = match kind {
            HashKind::Sha1 => HasherInner::Sha1(sha1::Sha1::new()),
            HashKind::Sha256 => HasherInner::Sha256(sha2::Sha256::new()),
        };
        Self { inner }
    }

    pub fn kind(&self) -> HashKind {
        match self.inner {
            HasherInner::Sha1(_) => HashKind::Sha1,
            HasherInner::Sha256(_) => HashKind::Sha256,
        }
    }

    /// feed bytes
    pub fn update(&mut self, data: &[u8]) {
        match &mut self.inner {
            HasherInner::Sha1(h) => h.update(data),
            HasherInner::Sha256(h) => h.update(data),
        }
    }

    /// finalize and return the digest as an id
    pub fn finalize(self) -> ObjectId {
        let kind = self.kind();
        let mut bytes = [0u8; MAX_HASH_LEN];
        match self.inner {
            HasherInner::Sha1(h) => bytes[..20].copy_from_slice(&h.finalize()),
            HasherInner::Sha256(h) => bytes[..32].copy_from_slice(&h.finalize()),
        }
        ObjectId { kind, bytes }
    }
}

impl Write for Hasher {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// writer that hashes and counts everything passing through it
pub struct HashWriter<W> {
    inner: W,
    hasher: Hasher,
    written: u64,
}

impl<W: Write> HashWriter<W> {
    pub fn new(inner: W, kind: HashKind) -> Self {
        Self {
            inner,
            hasher: Hasher::new(kind),
            written: 0,
        }
    }

    /// bytes written so far
    pub fn written(&self) -> u64 {
        self.written
    }

    /// digest of everything written so far, without consuming the writer
    pub fn digest(&self) -> ObjectId {
        self.hasher.clone().finalize()
    }

    pub fn into_parts(self) -> (W, ObjectId) {
        (self.inner, self.hasher.finalize())
    }
}

impl<W: Write> Write for HashWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// canonical `"<type> <len>\0"` header
pub fn object_header(ty: ObjectType, len: usize) -> Vec<u8> {
    format!("{} {}\0", ty.as_str(), len).into_bytes()
}

/// compute the id of an object: digest over header and payload
pub fn hash_object(kind: HashKind, ty: ObjectType, payload: &[u8]) -> ObjectId {
    let mut hasher = Hasher::new(kind);
    hasher.update(&object_header(ty, payload.len()));
    hasher.update(payload);
    hasher.finalize()
}

/// digest of arbitrary bytes (trailers, checksums)
pub fn digest(kind: HashKind, data: &[u8]) -> ObjectId {
    let mut hasher = Hasher::new(kind);
    hasher.update(data);
    hasher.finalize()
}
