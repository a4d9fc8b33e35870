use bstr::{BString, ByteSlice};

use crate::error::{Error, Result};
use crate::hash::ObjectId;
use crate::types::Signature;

/// a commit object pointing to a tree with history and identities
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Commit {
    /// root tree id
    pub tree: ObjectId,
    /// parent commit ids (empty for initial, 1 for linear, 2+ for merge)
    pub parents: Vec<ObjectId>,
    pub author: Signature,
    pub committer: Signature,
    /// message encoding when not utf-8
    pub encoding: Option<String>,
    /// other headers (e.g. gpgsig), kept in order; multi-line values use '\n'
    pub extra_headers: Vec<(BString, BString)>,
    /// message bytes, in `encoding` when set
    pub message: BString,
}

impl Commit {
    /// create a new commit
    pub fn new(
        tree: ObjectId,
        parents: Vec<ObjectId>,
        author: Signature,
        committer: Signature,
        message: impl Into<BString>,
    ) -> Self {
        Self {
            tree,
            parents,
            author,
            committer,
            encoding: None,
            extra_headers: vec![],
            message: message.into(),
        }
    }

    /// is this an initial commit (no parents)
    pub fn is_root(&self) -> bool {
        self.parents.is_empty()
    }

    /// is this a merge commit (multiple parents)
    pub fn is_merge(&self) -> bool {
        self.parents.len() > 1
    }

    /// serialize to the commit payload
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        push_header(&mut out, b"tree", self.tree.to_hex().as_bytes());
        for parent in &self.parents {
            push_header(&mut out, b"parent", parent.to_hex().as_bytes());
        }
        push_header(&mut out, b"author", &self.author.to_bytes());
        push_header(&mut out, b"committer", &self.committer.to_bytes());
        if let Some(encoding) = &self.encoding {
            push_header(&mut out, b"encoding", encoding.as_bytes());
        }
        for (key, value) in &self.extra_headers {
            push_header(&mut out, key, value);
        }
        out.push(b'\n');
        out.extend_from_slice(&self.message);
        out
    }

    /// parse a commit payload
    ///
    /// ids and the encoding name must be ascii; identities, other headers
    /// and the message are kept as bytes.
    pub fn decode(id: &ObjectId, data: &[u8]) -> Result<Self> {
        let corrupt = |msg: &str| Error::corrupt_object(*id, format!("commit: {msg}"));
        let (headers, message) = split_headers(data).ok_or_else(|| corrupt("missing header end"))?;

        let mut tree = None;
        let mut parents = Vec::new();
        let mut author = None;
        let mut committer = None;
        let mut encoding = None;
        let mut extra_headers = Vec::new();

        for (key, value) in headers {
            match key {
                b"tree" if tree.is_none() => {
                    tree = Some(parse_id(id, &value).map_err(|_| corrupt("bad tree id"))?)
                }
                b"parent" => {
                    parents.push(parse_id(id, &value).map_err(|_| corrupt("bad parent id"))?)
                }
                b"author" if author.is_none() => {
                    author = Some(Signature::parse(&value).map_err(|_| corrupt("bad author"))?)
                }
                b"committer" if committer.is_none() => {
                    committer =
                        Some(Signature::parse(&value).map_err(|_| corrupt("bad committer"))?)
                }
                b"encoding" if encoding.is_none() => {
                    let name = value.to_str().map_err(|_| corrupt("bad encoding name"))?;
                    encoding = Some(name.to_string());
                }
                _ => extra_headers.push((BString::from(key), value)),
            }
        }

        Ok(Self {
            tree: tree.ok_or_else(|| corrupt("missing tree"))?,
            parents,
            author: author.ok_or_else(|| corrupt("missing author"))?,
            committer: committer.ok_or_else(|| corrupt("missing committer"))?,
            encoding,
            extra_headers,
            message: BString::from(message),
        })
    }
}

fn parse_id(owner: &ObjectId, hex: &[u8]) -> Result<ObjectId> {
    let hex = hex
        .to_str()
        .map_err(|_| Error::InvalidHashHex(hex.to_str_lossy().into_owned()))?;
    ObjectId::from_hex_kind(owner.kind(), hex)
}

/// write `key value`, continuing multi-line values with a leading space
pub(crate) fn push_header(out: &mut Vec<u8>, key: &[u8], value: &[u8]) {
    out.extend_from_slice(key);
    out.push(b' ');
    out.extend_from_slice(&value.replace(b"\n", b"\n "));
    out.push(b'\n');
}

/// split `data` into (key, value) headers and the message body
pub(crate) fn split_headers(data: &[u8]) -> Option<(Vec<(&[u8], BString)>, &[u8])> {
    let mut headers: Vec<(&[u8], BString)> = Vec::new();
    let mut rest = data;

    loop {
        if rest.is_empty() {
            // headers with no message separator
            return Some((headers, rest));
        }
        if let Some(body) = rest.strip_prefix(b"\n") {
            return Some((headers, body));
        }
        let end = rest.find_byte(b'\n')?;
        let line = &rest[..end];
        rest = &rest[end + 1..];

        if let Some(continuation) = line.strip_prefix(b" ") {
            let (_, value) = headers.last_mut()?;
            value.push(b'\n');
            value.extend_from_slice(continuation);
        } else {
            let space = line.find_byte(b' ')?;
            headers.push((&line[..space], BString::from(&line[space + 1..])));
        }
    }
}
