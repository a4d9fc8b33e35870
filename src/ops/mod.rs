//! whole-repository operations built on the storage layers

mod commit;
mod fsck;
mod index_pack;
mod repack;

pub use commit::commit;
pub use fsck::{fsck, BrokenRef, CorruptObject, CorruptPack, FsckReport, MissingObject};
pub use index_pack::index_pack;
pub use repack::{repack, RepackOptions, RepackStats};
