mod commit;
mod object_type;
mod signature;
mod tag;
mod tree;

pub use commit::Commit;
pub use object_type::ObjectType;
pub use signature::Signature;
pub use tag::Tag;
pub use tree::{compare_entry_names, EntryMode, Tree, TreeEntry};

use crate::hash::{hash_object, HashKind, ObjectId};

/// an object's type and payload, without the header
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawObject {
    pub kind: ObjectType,
    pub data: Vec<u8>,
}

impl RawObject {
    pub fn new(kind: ObjectType, data: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            data: data.into(),
        }
    }

    /// content address under `hash`
    pub fn id(&self, hash: HashKind) -> ObjectId {
        hash_object(hash, self.kind, &self.data)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
