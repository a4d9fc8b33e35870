use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::hash::{HashKind, ObjectId};

/// first line written to `packed-refs`
pub const PACKED_HEADER: &str = "# pack-refs with: peeled fully-peeled sorted \n";

/// one line of `packed-refs`, with its `^` peel line if any
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PackedRef {
    pub name: String,
    pub id: ObjectId,
    /// what an annotated tag ultimately points at
    pub peeled: Option<ObjectId>,
}

/// the `packed-refs` file, sorted by name
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PackedRefs {
    refs: Vec<PackedRef>,
}

impl PackedRefs {
    /// read `path`; a missing file holds no refs
    pub fn load(path: &Path, hash: HashKind) -> Result<Self> {
        match crate::fs::read_optional(path)? {
            Some(data) => {
                let text = String::from_utf8(data).map_err(|_| corrupt(path, "not utf-8"))?;
                Self::parse(path, hash, &text)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn parse(path: &Path, hash: HashKind, text: &str) -> Result<Self> {
        let mut refs: Vec<PackedRef> = Vec::new();
        for (n, line) in text.lines().enumerate() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(hex) = line.strip_prefix('^') {
                let id = ObjectId::from_hex_kind(hash, hex)
                    .map_err(|_| corrupt(path, format!("line {}: bad peeled id", n + 1)))?;
                match refs.last_mut() {
                    Some(last) if last.peeled.is_none() => last.peeled = Some(id),
                    _ => return Err(corrupt(path, format!("line {}: stray peel line", n + 1))),
                }
                continue;
            }

            let (hex, name) = line
                .split_once(' ')
                .ok_or_else(|| corrupt(path, format!("line {}: expected '<id> <name>'", n + 1)))?;
            let id = ObjectId::from_hex_kind(hash, hex)
                .map_err(|_| corrupt(path, format!("line {}: bad id", n + 1)))?;
            refs.push(PackedRef {
                name: name.to_string(),
                id,
                peeled: None,
            });
        }

        // older writers did not promise sorted output
        refs.sort_by(|a, b| a.name.cmp(&b.name));
        refs.dedup_by(|a, b| a.name == b.name);
        Ok(Self { refs })
    }

    pub fn encode(&self) -> String {
        let mut out = String::from(PACKED_HEADER);
        for r in &self.refs {
            out.push_str(&format!("{} {}\n", r.id, r.name));
            if let Some(peeled) = &r.peeled {
                out.push_str(&format!("^{peeled}\n"));
            }
        }
        out
    }

    pub fn get(&self, name: &str) -> Option<&PackedRef> {
        self.position(name).ok().map(|i| &self.refs[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_ok()
    }

    /// insert or replace
    pub fn insert(&mut self, entry: PackedRef) {
        match self.position(&entry.name) {
            Ok(i) => self.refs[i] = entry,
            Err(i) => self.refs.insert(i, entry),
        }
    }

    pub fn remove(&mut self, name: &str) -> bool {
        match self.position(name) {
            Ok(i) => {
                self.refs.remove(i);
                true
            }
            Err(_) => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &PackedRef> {
        self.refs.iter()
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    fn position(&self, name: &str) -> std::result::Result<usize, usize> {
        self.refs.binary_search_by(|r| r.name.as_str().cmp(name))
    }
}

fn corrupt(path: &Path, message: impl Into<String>) -> Error {
    Error::CorruptRef {
        name: PathBuf::from(path).display().to_string(),
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "1111111111111111111111111111111111111111";
    const B: &str = "2222222222222222222222222222222222222222";
    const C: &str = "3333333333333333333333333333333333333333";

    #[test]
    fn test_parse_with_peel_lines() {
        let text = format!("{PACKED_HEADER}{A} refs/tags/v1\n^{B}\n{C} refs/heads/main\n");
        let packed = PackedRefs::parse(Path::new("packed-refs"), HashKind::Sha1, &text).unwrap();

        assert_eq!(packed.len(), 2);
        let tag = packed.get("refs/tags/v1").unwrap();
        assert_eq!(tag.id.to_hex(), A);
        assert_eq!(tag.peeled.unwrap().to_hex(), B);
        assert!(packed.get("refs/heads/main").unwrap().peeled.is_none());

        // sorted on the way back out
        let encoded = packed.encode();
        let reparsed = PackedRefs::parse(Path::new("packed-refs"), HashKind::Sha1, &encoded).unwrap();
        assert_eq!(reparsed, packed);
        assert!(encoded.find("refs/heads/main").unwrap() < encoded.find("refs/tags/v1").unwrap());
    }

    #[test]
    fn test_parse_errors() {
        let path = Path::new("packed-refs");
        assert!(matches!(
            PackedRefs::parse(path, HashKind::Sha1, &format!("^{A}\n")),
            Err(Error::CorruptRef { .. })
        ));
        assert!(matches!(
            PackedRefs::parse(path, HashKind::Sha1, "nonsense\n"),
            Err(Error::CorruptRef { .. })
        ));
        assert!(matches!(
            PackedRefs::parse(path, HashKind::Sha1, "abc refs/heads/x\n"),
            Err(Error::CorruptRef { .. })
        ));
    }

    #[test]
    fn test_insert_remove() {
        let mut packed = PackedRefs::default();
        let id = ObjectId::from_hex(A).unwrap();
        packed.insert(PackedRef {
            name: "refs/heads/b".into(),
            id,
            peeled: None,
        });
        packed.insert(PackedRef {
            name: "refs/heads/a".into(),
            id,
            peeled: None,
        });
        let names: Vec<_> = packed.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["refs/heads/a", "refs/heads/b"]);

        assert!(packed.remove("refs/heads/a"));
        assert!(!packed.remove("refs/heads/a"));
        assert!(!packed.contains("refs/heads/a"));
    }
}
