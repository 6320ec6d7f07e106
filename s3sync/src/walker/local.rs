use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{NodeWalker, WalkOptions};
use crate::error::{Result, SyncError};
use crate::filter::ExcludeFilter;
use crate::location::Location;
use crate::node::{LocalNode, Node};

/// One pending step inside a directory listing
#[derive(Debug)]
enum Step {
    /// Describe the entry with this relative name
    Visit(String),
    /// List the directory with this relative name
    Descend(String),
}

/// Depth-first walk over a local tree with deferred recursion.
///
/// Each directory is listed once, its subdirectories are added a second
/// time as `name/`, and the whole listing is sorted. Plain names produce
/// nodes; `name/` entries trigger the descent at exactly the position the
/// store would list `name/...` keys.
pub struct LocalWalker {
    root: PathBuf,
    contents_only: bool,
    filter: ExcludeFilter,
    options: WalkOptions,
    cancel: CancellationToken,
    started: bool,
    stack: Vec<std::vec::IntoIter<Step>>,
}

impl LocalWalker {
    pub fn new(
        location: &Location,
        filter: ExcludeFilter,
        options: WalkOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            root: location.local_root(),
            contents_only: location.has_trailing_slash(),
            filter,
            options,
            cancel,
            started: false,
            stack: Vec::new(),
        }
    }

    fn relative(parent: &str, name: &str) -> String {
        if parent.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", parent, name)
        }
    }

    fn absolute(&self, relative: &str) -> PathBuf {
        if relative.is_empty() {
            self.root.clone()
        } else {
            self.root.join(relative)
        }
    }

    /// Sorted steps for one directory; unreadable entries are skipped
    async fn list(&self, relative: &str) -> std::io::Result<Vec<Step>> {
        let mut keyed = Vec::new();
        let mut entries = fs::read_dir(self.absolute(relative)).await?;

        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                warn!("skipping non-UTF-8 name {:?} in {}", file_name, relative);
                continue;
            };
            let name = Self::relative(relative, file_name);

            // file_type does not follow symlinks, so linked directories stay leaves
            let is_dir = match entry.file_type().await {
                Ok(file_type) => file_type.is_dir(),
                Err(e) => {
                    warn!("skipping {}: {}", name, e);
                    continue;
                }
            };

            if !self.filter.is_excluded(&name) {
                keyed.push((file_name.to_string(), Step::Visit(name.clone())));
            }
            if is_dir && self.options.recursive && !self.filter.is_excluded_dir(&name) {
                keyed.push((format!("{}/", file_name), Step::Descend(name)));
            }
        }

        keyed.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(keyed.into_iter().map(|(_, step)| step).collect())
    }

    /// Root handling: `dir/` means its contents, `dir` the directory itself first
    async fn start(&mut self) -> Option<Node> {
        self.started = true;
        if self.contents_only {
            self.stack.push(vec![Step::Descend(String::new())].into_iter());
            return None;
        }

        match LocalNode::from_path(&self.root, "", self.options.fingerprinting).await {
            Ok(Some(node)) => {
                if node.is_directory_marker() && self.options.recursive {
                    self.stack.push(vec![Step::Descend(String::new())].into_iter());
                }
                Some(Node::Local(node))
            }
            Ok(None) => None,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("local root {} does not exist", self.root.display());
                None
            }
            Err(e) => {
                warn!("skipping local root {}: {}", self.root.display(), e);
                None
            }
        }
    }
}

#[async_trait]
impl NodeWalker for LocalWalker {
    async fn next_node(&mut self) -> Result<Option<Node>> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        if !self.started {
            if let Some(root) = self.start().await {
                return Ok(Some(root));
            }
        }

        loop {
            if self.cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let Some(frame) = self.stack.last_mut() else {
                return Ok(None);
            };

            match frame.next() {
                None => {
                    self.stack.pop();
                }
                Some(Step::Visit(name)) => {
                    let path = self.absolute(&name);
                    match LocalNode::from_path(&path, name.as_str(), self.options.fingerprinting).await {
                        Ok(Some(node)) => {
                            debug!("local item {}", name);
                            return Ok(Some(Node::Local(node)));
                        }
                        Ok(None) => debug!("skipping special file {}", name),
                        Err(e) => warn!("skipping {}: {}", path.display(), e),
                    }
                }
                Some(Step::Descend(name)) => match self.list(&name).await {
                    Ok(steps) => self.stack.push(steps.into_iter()),
                    Err(e) if name.is_empty() && e.kind() == std::io::ErrorKind::NotFound => {
                        debug!("local root {} does not exist", self.root.display());
                    }
                    Err(e) => warn!("cannot list {}: {}", self.absolute(&name).display(), e),
                },
            }
        }
    }
}
