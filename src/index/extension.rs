use bstr::BString;

use crate::hash::{HashKind, ObjectId};
use crate::types::EntryMode;

/// `REUC`: conflict stages remembered after a path was resolved
pub const RESOLVE_UNDO: [u8; 4] = *b"REUC";
/// `TREE`: cached tree ids, dropped on write
pub const CACHED_TREE: [u8; 4] = *b"TREE";

/// an extension kept byte-for-byte because nothing here interprets it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawExtension {
    pub signature: [u8; 4],
    pub data: Vec<u8>,
}

impl RawExtension {
    /// uppercase signatures mark extensions a reader may ignore
    pub fn is_optional(signature: &[u8; 4]) -> bool {
        signature[0].is_ascii_uppercase()
    }

    pub fn name(&self) -> String {
        String::from_utf8_lossy(&self.signature).into_owned()
    }
}

/// the three conflict sides of a path before it was resolved
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolveUndoEntry {
    pub path: BString,
    /// indexed by stage - 1
    pub modes: [Option<EntryMode>; 3],
    pub ids: [Option<ObjectId>; 3],
}

impl ResolveUndoEntry {
    pub fn new(path: impl Into<BString>) -> Self {
        Self {
            path: path.into(),
            modes: [None; 3],
            ids: [None; 3],
        }
    }
}

/// parse the body of a `REUC` extension
pub(crate) fn parse_resolve_undo(mut data: &[u8], hash: HashKind) -> Result<Vec<ResolveUndoEntry>, &'static str> {
    let mut entries = Vec::new();
    while !data.is_empty() {
        let (path, rest) = split_nul(data).ok_or("unterminated resolve-undo path")?;
        data = rest;

        let mut entry = ResolveUndoEntry::new(path);
        for slot in entry.modes.iter_mut() {
            let (octal, rest) = split_nul(data).ok_or("unterminated resolve-undo mode")?;
            data = rest;
            let mode = u32::from_str_radix(std::str::from_utf8(octal).unwrap_or(""), 8)
                .map_err(|_| "bad resolve-undo mode")?;
            if mode != 0 {
                *slot = Some(EntryMode::from_u32(mode).ok_or("bad resolve-undo mode")?);
            }
        }
        for (slot, mode) in entry.ids.iter_mut().zip(entry.modes.iter()) {
            if mode.is_none() {
                continue;
            }
            let raw = data.get(..hash.len()).ok_or("truncated resolve-undo id")?;
            *slot = Some(ObjectId::from_bytes(hash, raw).map_err(|_| "bad resolve-undo id")?);
            data = &data[hash.len()..];
        }
        entries.push(entry);
    }
    Ok(entries)
}

pub(crate) fn encode_resolve_undo(entries: &[ResolveUndoEntry], out: &mut Vec<u8>) {
    for entry in entries {
        out.extend_from_slice(&entry.path);
        out.push(0);
        for mode in &entry.modes {
            let mode = mode.map(|m| m.as_u32()).unwrap_or(0);
            out.extend_from_slice(format!("{mode:o}").as_bytes());
            out.push(0);
        }
        for (id, mode) in entry.ids.iter().zip(entry.modes.iter()) {
            if let (Some(id), Some(_)) = (id, mode) {
                out.extend_from_slice(id.as_bytes());
            }
        }
    }
}

fn split_nul(data: &[u8]) -> Option<(&[u8], &[u8])> {
    let nul = data.iter().position(|&b| b == 0)?;
    Some((&data[..nul], &data[nul + 1..]))
}
