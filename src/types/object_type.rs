use std::fmt;

use crate::error::{Error, Result};

/// kind of a stored object
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectType {
    Commit,
    Tree,
    Blob,
    Tag,
}

impl ObjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::Commit => "commit",
            ObjectType::Tree => "tree",
            ObjectType::Blob => "blob",
            ObjectType::Tag => "tag",
        }
    }

    /// parse the type word used in object headers and tags
    pub fn from_bytes(word: &[u8]) -> Result<Self> {
        match word {
            b"commit" => Ok(ObjectType::Commit),
            b"tree" => Ok(ObjectType::Tree),
            b"blob" => Ok(ObjectType::Blob),
            b"tag" => Ok(ObjectType::Tag),
            _ => Err(Error::InvalidObjectType(
                String::from_utf8_lossy(word).into_owned(),
            )),
        }
    }

    /// 3-bit type code used in pack entry headers
    pub fn pack_code(&self) -> u8 {
        match self {
            ObjectType::Commit => 1,
            ObjectType::Tree => 2,
            ObjectType::Blob => 3,
            ObjectType::Tag => 4,
        }
    }

    pub fn from_pack_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(ObjectType::Commit),
            2 => Some(ObjectType::Tree),
            3 => Some(ObjectType::Blob),
            4 => Some(ObjectType::Tag),
            _ => None,
        }
    }
}

impl TryFrom<&str> for ObjectType {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        Self::from_bytes(value.as_bytes())
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_words() {
        for ty in [
            ObjectType::Commit,
            ObjectType::Tree,
            ObjectType::Blob,
            ObjectType::Tag,
        ] {
            assert_eq!(ObjectType::try_from(ty.as_str()).unwrap(), ty);
            assert_eq!(ObjectType::from_pack_code(ty.pack_code()), Some(ty));
        }
        assert!(ObjectType::try_from("blobby").is_err());
        assert_eq!(ObjectType::from_pack_code(6), None);
    }
}
