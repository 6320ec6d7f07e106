//! Sorted merge of two node sequences into create/update/unchanged/remove

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::comparator::{ComparisonResult, NodeComparator};
use crate::error::Result;
use crate::node::Node;
use crate::walker::NodeWalker;

/// Classification of one name
#[derive(Debug)]
pub enum DiffEntry {
    /// Present only in the source
    Create(Node),
    /// Present on both sides and different
    Update {
        source: Node,
        destination: Node,
        reason: ComparisonResult,
    },
    Unchanged {
        source: Node,
        destination: Node,
    },
    /// Present only in the destination
    Remove(Node),
}

impl DiffEntry {
    pub fn name(&self) -> &str {
        match self {
            DiffEntry::Create(node) | DiffEntry::Remove(node) => node.name(),
            DiffEntry::Update { source, .. } | DiffEntry::Unchanged { source, .. } => source.name(),
        }
    }
}

/// Single forward merge-join over a source and a destination walker.
///
/// Only the current head of each side is held. Destination-only
/// directory markers are parked on a stack and handed out after both
/// sides are exhausted, last-parked first, so a marker is always removed
/// after everything beneath it.
///
/// A folder placeholder `x/` stands for the same directory as a marker
/// `x`. It sorts after `x`, so each side keeps the marker names whose
/// placeholder could still come up.
pub struct MergeDiff<S, D> {
    source: S,
    destination: D,
    comparator: NodeComparator,
    primed: bool,
    source_head: Option<Node>,
    destination_head: Option<Node>,
    pending_directories: Vec<Node>,
    source_directories: Vec<String>,
    destination_directories: Vec<String>,
}

impl<S: NodeWalker, D: NodeWalker> MergeDiff<S, D> {
    pub fn new(source: S, destination: D, comparator: NodeComparator) -> Self {
        Self {
            source,
            destination,
            comparator,
            primed: false,
            source_head: None,
            destination_head: None,
            pending_directories: Vec::new(),
            source_directories: Vec::new(),
            destination_directories: Vec::new(),
        }
    }

    /// Drop directories whose placeholder would already have sorted before `name`
    fn forget_passed(&mut self, name: &str) {
        self.source_directories.retain(|dir| placeholder_ahead(dir, name));
        self.destination_directories.retain(|dir| placeholder_ahead(dir, name));
    }

    async fn advance_source(&mut self) -> Result<Option<Node>> {
        let current = self.source_head.take();
        self.source_head = self.source.next_node().await?;
        Ok(current)
    }

    async fn advance_destination(&mut self) -> Result<Option<Node>> {
        let current = self.destination_head.take();
        self.destination_head = self.destination.next_node().await?;
        Ok(current)
    }

    /// Next classified entry, or `None` once both sides and the pending stack are drained
    pub async fn next_entry(&mut self) -> Result<Option<DiffEntry>> {
        if !self.primed {
            self.source_head = self.source.next_node().await?;
            self.destination_head = self.destination.next_node().await?;
            self.primed = true;
        }

        loop {
            // Names pair by plain equality; a leaf meeting a marker of the
            // same name is a type change and surfaces as an update
            let order = match (&self.source_head, &self.destination_head) {
                (None, None) => {
                    return Ok(self.pending_directories.pop().map(DiffEntry::Remove));
                }
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some(source), Some(destination)) => source.name().cmp(destination.name()),
            };

            match order {
                Ordering::Less => {
                    if let Some(node) = self.advance_source().await? {
                        self.forget_passed(node.name());
                        if let Some(directory) = placeholder_of(&node) {
                            if let Some(index) =
                                self.pending_directories.iter().rposition(|d| d.name() == directory)
                            {
                                let destination = self.pending_directories.remove(index);
                                return Ok(Some(DiffEntry::Unchanged {
                                    source: node,
                                    destination,
                                }));
                            }
                            if self.destination_directories.iter().any(|d| d == directory) {
                                debug!("placeholder {} matches an existing directory", node.name());
                                continue;
                            }
                        }
                        if node.is_directory_marker() {
                            self.source_directories.push(node.name().to_string());
                        }
                        return Ok(Some(DiffEntry::Create(node)));
                    }
                }
                Ordering::Greater => {
                    if let Some(node) = self.advance_destination().await? {
                        self.forget_passed(node.name());
                        if let Some(directory) = placeholder_of(&node) {
                            if self.source_directories.iter().any(|d| d == directory) {
                                debug!("placeholder {} matches a source directory", node.name());
                                continue;
                            }
                        }
                        if node.is_directory_marker() {
                            debug!("deferring removal of directory {}", node.name());
                            self.pending_directories.push(node);
                            continue;
                        }
                        return Ok(Some(DiffEntry::Remove(node)));
                    }
                }
                Ordering::Equal => {
                    let source = self.advance_source().await?;
                    let destination = self.advance_destination().await?;
                    if let (Some(source), Some(destination)) = (source, destination) {
                        self.forget_passed(source.name());
                        if source.is_directory_marker() {
                            self.source_directories.push(source.name().to_string());
                        }
                        if destination.is_directory_marker() {
                            self.destination_directories.push(destination.name().to_string());
                        }
                        let reason = self.comparator.compare(&source, &destination).await;
                        return Ok(Some(if reason.is_identical() {
                            DiffEntry::Unchanged { source, destination }
                        } else {
                            DiffEntry::Update {
                                source,
                                destination,
                                reason,
                            }
                        }));
                    }
                }
            }
        }
    }
}

/// Directory named by a `name/` folder placeholder
fn placeholder_of(node: &Node) -> Option<&str> {
    if node.is_directory_marker() {
        node.name().strip_suffix('/')
    } else {
        None
    }
}

/// Whether `directory/` sorts at or after `name`
fn placeholder_ahead(directory: &str, name: &str) -> bool {
    directory.bytes().chain(std::iter::once(b'/')).cmp(name.bytes()) != Ordering::Less
}

/// Names of one merge, partitioned
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffResult {
    pub same: Vec<String>,
    pub to_create_or_update: Vec<String>,
    /// In the order removals must be applied
    pub to_remove: Vec<String>,
}

impl DiffResult {
    pub fn total(&self) -> usize {
        self.same.len() + self.to_create_or_update.len() + self.to_remove.len()
    }
}

/// Run a complete merge and collect the three partitions
pub async fn cmp<S: NodeWalker, D: NodeWalker>(
    source: S,
    destination: D,
    comparator: NodeComparator,
) -> Result<DiffResult> {
    let mut merge = MergeDiff::new(source, destination, comparator);
    let mut result = DiffResult::default();

    while let Some(entry) = merge.next_entry().await? {
        let name = entry.name().to_string();
        match entry {
            DiffEntry::Unchanged { .. } => result.same.push(name),
            DiffEntry::Create(_) | DiffEntry::Update { .. } => result.to_create_or_update.push(name),
            DiffEntry::Remove(_) => result.to_remove.push(name),
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::RemoteNode;
    use chrono::Utc;

    fn nodes(entries: &[(&str, u64)]) -> std::vec::IntoIter<Node> {
        let now = Utc::now();
        entries
            .iter()
            .map(|(name, size)| Node::Remote(RemoteNode::new("b", *name, *name, *size, "f", now)))
            .collect::<Vec<_>>()
            .into_iter()
    }

    #[tokio::test]
    async fn test_size_based_partition() {
        let result = cmp(
            nodes(&[("a", 10), ("b", 12), ("c", 12)]),
            nodes(&[("a", 10), ("b", 22), ("d", 22)]),
            NodeComparator::default(),
        )
        .await
        .unwrap();

        assert_eq!(result.same, vec!["a"]);
        assert_eq!(result.to_create_or_update, vec!["b", "c"]);
        assert_eq!(result.to_remove, vec!["d"]);
    }

    #[tokio::test]
    async fn test_empty_sides() {
        let result = cmp(nodes(&[]), nodes(&[]), NodeComparator::default())
            .await
            .unwrap();
        assert_eq!(result.total(), 0);

        let result = cmp(nodes(&[("x", 1)]), nodes(&[]), NodeComparator::default())
            .await
            .unwrap();
        assert_eq!(result.to_create_or_update, vec!["x"]);
    }
}
