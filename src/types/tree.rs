use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;

use bstr::{BString, ByteSlice};

use crate::error::{Error, Result};
use crate::hash::ObjectId;
use crate::types::ObjectType;

/// file mode of a tree or index entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntryMode {
    /// regular file (100644)
    Blob,
    /// executable file (100755)
    BlobExecutable,
    /// symbolic link (120000)
    Link,
    /// subdirectory (40000)
    Tree,
    /// submodule commit (160000)
    Commit,
}

impl EntryMode {
    pub fn as_u32(&self) -> u32 {
        match self {
            EntryMode::Blob => 0o100644,
            EntryMode::BlobExecutable => 0o100755,
            EntryMode::Link => 0o120000,
            EntryMode::Tree => 0o040000,
            EntryMode::Commit => 0o160000,
        }
    }

    pub fn from_u32(mode: u32) -> Option<Self> {
        match mode {
            // 100664 is a legacy group-writable file, read as a regular one
            0o100644 | 0o100664 => Some(EntryMode::Blob),
            0o100755 => Some(EntryMode::BlobExecutable),
            0o120000 => Some(EntryMode::Link),
            0o040000 => Some(EntryMode::Tree),
            0o160000 => Some(EntryMode::Commit),
            _ => None,
        }
    }

    /// octal form as written in tree objects (no leading zero for trees)
    pub fn as_octal_str(&self) -> &'static str {
        match self {
            EntryMode::Blob => "100644",
            EntryMode::BlobExecutable => "100755",
            EntryMode::Link => "120000",
            EntryMode::Tree => "40000",
            EntryMode::Commit => "160000",
        }
    }

    /// parse an octal mode from a tree entry
    pub fn from_octal(octal: &[u8]) -> Option<Self> {
        if octal.is_empty() || octal.len() > 7 {
            return None;
        }
        let mut mode = 0u32;
        for &c in octal {
            if !(b'0'..=b'7').contains(&c) {
                return None;
            }
            mode = (mode << 3) | u32::from(c - b'0');
        }
        Self::from_u32(mode)
    }

    pub fn is_tree(&self) -> bool {
        matches!(self, EntryMode::Tree)
    }

    /// object type the entry id refers to
    pub fn object_type(&self) -> ObjectType {
        match self {
            EntryMode::Tree => ObjectType::Tree,
            EntryMode::Commit => ObjectType::Commit,
            _ => ObjectType::Blob,
        }
    }
}

impl fmt::Display for EntryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06o}", self.as_u32())
    }
}

/// a single entry in a tree
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeEntry {
    /// raw name bytes; git does not require utf-8
    pub name: BString,
    pub mode: EntryMode,
    pub id: ObjectId,
}

impl TreeEntry {
    pub fn new(name: impl Into<BString>, mode: EntryMode, id: ObjectId) -> Self {
        Self {
            name: name.into(),
            mode,
            id,
        }
    }
}

/// order two entry names the way trees are sorted
///
/// names compare byte-wise, and a tree's name is compared as if it carried a
/// trailing '/'. so "foo.txt" < "foo" (tree) < "foo0", while the file "foo"
/// sorts before "foo.txt".
pub fn compare_entry_names(a: &[u8], a_is_tree: bool, b: &[u8], b_is_tree: bool) -> Ordering {
    let common = a.len().min(b.len());
    match a[..common].cmp(&b[..common]) {
        Ordering::Equal => {}
        other => return other,
    }
    let terminator = |is_tree: bool| if is_tree { b'/' } else { 0 };
    let c1 = a.get(common).copied().unwrap_or_else(|| terminator(a_is_tree));
    let c2 = b.get(common).copied().unwrap_or_else(|| terminator(b_is_tree));
    c1.cmp(&c2)
}

fn entry_order(a: &TreeEntry, b: &TreeEntry) -> Ordering {
    compare_entry_names(&a.name, a.mode.is_tree(), &b.name, b.mode.is_tree())
}

/// a directory tree - entries sorted in tree order
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tree {
    entries: Vec<TreeEntry>,
}

impl Tree {
    /// create a new tree, validating and sorting entries
    pub fn new(mut entries: Vec<TreeEntry>) -> Result<Self> {
        let mut seen = HashSet::with_capacity(entries.len());
        for entry in &entries {
            validate_entry_name(&entry.name)?;
            if !seen.insert(entry.name.as_slice()) {
                return Err(Error::DuplicateEntryName(entry.name.to_string()));
            }
        }

        entries.sort_by(entry_order);
        Ok(Self { entries })
    }

    /// create an empty tree
    pub fn empty() -> Self {
        Self { entries: vec![] }
    }

    /// get entries slice
    pub fn entries(&self) -> &[TreeEntry] {
        &self.entries
    }

    /// consume and return entries
    pub fn into_entries(self) -> Vec<TreeEntry> {
        self.entries
    }

    /// look up entry by name
    pub fn get(&self, name: impl AsRef<[u8]>) -> Option<&TreeEntry> {
        let name = name.as_ref();
        self.entries.iter().find(|e| e.name.as_slice() == name)
    }

    /// number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// is tree empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// serialize to the tree payload: `<mode> <name>\0<raw id>` per entry
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for entry in &self.entries {
            out.extend_from_slice(entry.mode.as_octal_str().as_bytes());
            out.push(b' ');
            out.extend_from_slice(&entry.name);
            out.push(0);
            out.extend_from_slice(entry.id.as_bytes());
        }
        out
    }

    /// parse a tree payload; `id` supplies the hash width and error context
    pub fn decode(id: &ObjectId, data: &[u8]) -> Result<Self> {
        let hash_len = id.kind().len();
        let corrupt = |msg: &str| Error::corrupt_object(*id, format!("tree: {msg}"));

        let mut entries = Vec::new();
        let mut rest = data;
        while !rest.is_empty() {
            let space = rest
                .iter()
                .position(|&b| b == b' ')
                .ok_or_else(|| corrupt("unterminated mode"))?;
            let mode = EntryMode::from_octal(&rest[..space])
                .ok_or_else(|| corrupt("invalid mode"))?;
            rest = &rest[space + 1..];

            let nul = rest
                .iter()
                .position(|&b| b == 0)
                .ok_or_else(|| corrupt("unterminated name"))?;
            let name = BString::from(&rest[..nul]);
            rest = &rest[nul + 1..];

            if rest.len() < hash_len {
                return Err(corrupt("truncated entry id"));
            }
            let entry_id = ObjectId::from_bytes(id.kind(), &rest[..hash_len])?;
            rest = &rest[hash_len..];

            validate_entry_name(&name).map_err(|_| corrupt("invalid entry name"))?;
            entries.push(TreeEntry::new(name, mode, entry_id));
        }

        for window in entries.windows(2) {
            if entry_order(&window[0], &window[1]) != Ordering::Less {
                return Err(corrupt("entries out of order"));
            }
        }

        Ok(Self { entries })
    }
}

/// validate an entry name
fn validate_entry_name(name: &[u8]) -> Result<()> {
    let invalid = |why: &str| Error::InvalidEntryName(format!("{why}: {}", name.as_bstr()));
    if name.is_empty() {
        return Err(Error::InvalidEntryName("empty name".to_string()));
    }
    if name.contains(&b'/') {
        return Err(invalid("name contains '/'"));
    }
    if name.contains(&0) {
        return Err(invalid("name contains null byte"));
    }
    if name == b"." || name == b".." {
        return Err(invalid("reserved name"));
    }
    Ok(())
}
