use tracing::info;

use crate::error::{Error, Result};
use crate::hash::ObjectId;
use crate::repo::Repo;
use crate::types::{Commit, Signature};

/// commit the staged index on top of whatever HEAD points at
///
/// the tree is written from the index, the parent is the current tip of the
/// branch HEAD names (none on an unborn branch), and the branch is advanced
/// with a compare-and-swap against that parent. returns the new commit id.
pub fn commit(repo: &Repo, message: &str, author: &Signature, committer: &Signature) -> Result<ObjectId> {
    let tree = repo.index().write_tree(repo.odb())?;

    let branch = repo.refs().follow("HEAD")?;
    let parent = match repo.refs().resolve(&branch) {
        Ok(id) => Some(id),
        Err(Error::RefNotFound(_)) => None,
        Err(e) => return Err(e),
    };

    let commit = Commit::new(
        tree,
        parent.into_iter().collect(),
        author.clone(),
        committer.clone(),
        message,
    );
    let id = repo.odb().write_commit(&commit)?;

    match parent {
        Some(parent) => repo.refs().update(&branch, &id, Some(&parent))?,
        // someone else giving birth to the branch first shows up as RefExists
        None => repo.refs().create(&branch, &id, false)?,
    }

    info!(commit = %id, branch = %branch, "created commit");
    Ok(id)
}
