//! Lazy, lexicographically ordered traversal of either namespace
//!
//! Both walkers yield nodes in plain byte order of their names, the order
//! an object store lists keys in. Locally that means a directory `foo` is
//! descended into only once `foo/` is reached in sort order, after
//! siblings such as `foo.txt`.

mod local;
mod remote;

pub use local::LocalWalker;
pub use remote::RemoteWalker;

use async_trait::async_trait;

use crate::error::Result;
use crate::filter::ExcludeFilter;
use crate::location::Location;
use crate::node::Node;
use crate::session::SyncSession;

/// Pull-based node source: `Ok(None)` marks the end of the sequence
#[async_trait]
pub trait NodeWalker: Send {
    async fn next_node(&mut self) -> Result<Option<Node>>;
}

#[async_trait]
impl<W: NodeWalker + ?Sized> NodeWalker for Box<W> {
    async fn next_node(&mut self) -> Result<Option<Node>> {
        (**self).next_node().await
    }
}

/// Pre-sorted nodes already in memory
#[async_trait]
impl NodeWalker for std::vec::IntoIter<Node> {
    async fn next_node(&mut self) -> Result<Option<Node>> {
        Ok(self.next())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WalkOptions {
    pub recursive: bool,
    /// Hash local files when compared; markers are always tagged
    pub fingerprinting: bool,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            recursive: true,
            fingerprinting: true,
        }
    }
}

/// Walker matching the kind of `location`
pub fn walker_for<'a>(
    location: &Location,
    session: &'a SyncSession,
    filter: ExcludeFilter,
    options: WalkOptions,
) -> Box<dyn NodeWalker + 'a> {
    match &location.bucket {
        Some(bucket) => Box::new(RemoteWalker::new(
            session,
            bucket,
            &location.path,
            filter,
            options.recursive,
        )),
        None => Box::new(LocalWalker::new(
            location,
            filter,
            options,
            session.cancellation_token(),
        )),
    }
}

/// Drain a walker, keeping only names
pub async fn collect_names<W: NodeWalker + ?Sized>(walker: &mut W) -> Result<Vec<String>> {
    let mut names = Vec::new();
    while let Some(node) = walker.next_node().await? {
        names.push(node.name().to_string());
    }
    Ok(names)
}
