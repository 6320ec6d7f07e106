use std::collections::VecDeque;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::NodeWalker;
use crate::error::{Result, SyncError};
use crate::filter::ExcludeFilter;
use crate::node::{Node, RemoteNode};
use crate::session::SyncSession;
use crate::store::{ListPage, ListRequest, ObjectEntry};

const DELIMITER: &str = "/";

#[derive(Debug)]
enum Listed {
    Object(ObjectEntry),
    Prefix(String),
}

impl Listed {
    fn key(&self) -> &str {
        match self {
            Listed::Object(entry) => &entry.key,
            Listed::Prefix(prefix) => prefix,
        }
    }
}

/// Listing state of one prefix level
#[derive(Debug)]
struct Frame {
    prefix: String,
    /// Only the root key itself and `root/` are of interest at this level
    exact_root: bool,
    marker: Option<String>,
    exhausted: bool,
    items: VecDeque<Listed>,
}

impl Frame {
    fn new(prefix: String, exact_root: bool) -> Self {
        Self {
            prefix,
            exact_root,
            marker: None,
            exhausted: false,
            items: VecDeque::new(),
        }
    }
}

/// Paginated, delimiter-based walk over the keys under one prefix.
///
/// Each level is listed a page at a time; objects and sub-prefixes of a
/// page are merged by key, and a sub-prefix is descended into when it
/// comes up, before the rest of its parent level is fetched.
pub struct RemoteWalker<'a> {
    session: &'a SyncSession,
    bucket: String,
    root: String,
    /// `root` with a trailing delimiter, stripped from keys to form names
    root_dir: String,
    filter: ExcludeFilter,
    recursive: bool,
    started: bool,
    stack: Vec<Frame>,
}

impl<'a> RemoteWalker<'a> {
    pub fn new(
        session: &'a SyncSession,
        bucket: &str,
        root: &str,
        filter: ExcludeFilter,
        recursive: bool,
    ) -> Self {
        let root_dir = if root.is_empty() || root.ends_with(DELIMITER) {
            root.to_string()
        } else {
            format!("{}{}", root, DELIMITER)
        };
        Self {
            session,
            bucket: bucket.to_string(),
            root: root.to_string(),
            root_dir,
            filter,
            recursive,
            started: false,
            stack: Vec::new(),
        }
    }

    fn name_of<'k>(&self, key: &'k str) -> &'k str {
        if key == self.root {
            ""
        } else {
            key.strip_prefix(self.root_dir.as_str()).unwrap_or(key)
        }
    }

    async fn fetch(&self, prefix: &str, marker: Option<String>) -> Result<ListPage> {
        let request = ListRequest {
            prefix: prefix.to_string(),
            delimiter: Some(DELIMITER.to_string()),
            marker,
            max_keys: self.session.config().page_size,
        };

        let page = self
            .session
            .call(&self.bucket, "list", prefix, |conn| {
                let request = request.clone();
                async move { conn.list(&request).await }
            })
            .await
            .map_err(|e| match e {
                SyncError::RetryBudgetExhausted { .. } | SyncError::Cancelled => e,
                other => SyncError::RemoteUnavailable {
                    bucket: self.bucket.clone(),
                    prefix: prefix.to_string(),
                    message: other.to_string(),
                },
            })?;

        debug!(
            "listed {} objects and {} prefixes under {}:{}",
            page.entries.len(),
            page.common_prefixes.len(),
            self.bucket,
            prefix
        );
        Ok(page)
    }

    /// Fill the top frame with its next page
    async fn refill(&mut self) -> Result<()> {
        let Some(frame) = self.stack.last() else {
            return Ok(());
        };
        let prefix = frame.prefix.clone();
        let exact_root = frame.exact_root;
        let marker = frame.marker.clone();

        let page = self.fetch(&prefix, marker).await?;

        let mut items: Vec<Listed> = page
            .entries
            .into_iter()
            .map(Listed::Object)
            .chain(page.common_prefixes.into_iter().map(Listed::Prefix))
            .collect();
        items.sort_by(|a, b| a.key().cmp(b.key()));

        let next_marker = page
            .next_marker
            .or_else(|| items.last().map(|item| item.key().to_string()));
        if exact_root {
            items.retain(|item| self.is_root_item(item));
        }

        let Some(frame) = self.stack.last_mut() else {
            return Ok(());
        };
        frame.exhausted = !page.is_truncated;
        if page.is_truncated {
            match next_marker {
                Some(marker) if frame.marker.as_ref() != Some(&marker) => frame.marker = Some(marker),
                _ => {
                    warn!("listing of {} did not advance; stopping at this page", prefix);
                    frame.exhausted = true;
                }
            }
        }
        frame.items.extend(items);
        Ok(())
    }

    fn is_root_item(&self, item: &Listed) -> bool {
        match item {
            Listed::Object(entry) => entry.key == self.root,
            Listed::Prefix(prefix) => prefix == &self.root_dir,
        }
    }
}

#[async_trait]
impl NodeWalker for RemoteWalker<'_> {
    async fn next_node(&mut self) -> Result<Option<Node>> {
        if !self.started {
            self.started = true;
            let exact_root = self.root != self.root_dir;
            self.stack.push(Frame::new(self.root.clone(), exact_root));
        }

        loop {
            self.session.check_cancelled()?;

            let Some(frame) = self.stack.last_mut() else {
                return Ok(None);
            };

            match frame.items.pop_front() {
                Some(Listed::Object(entry)) => {
                    if entry.key == self.root_dir && !self.root_dir.is_empty() {
                        debug!("skipping folder placeholder for the root, {}", entry.key);
                        continue;
                    }
                    let name = self.name_of(&entry.key).to_string();
                    if !name.is_empty() && self.filter.is_excluded(&name) {
                        continue;
                    }
                    debug!("remote item {}", entry.key);
                    return Ok(Some(Node::Remote(RemoteNode::from_entry(
                        &self.bucket,
                        entry,
                        name,
                    ))));
                }
                Some(Listed::Prefix(prefix)) => {
                    let name = self.name_of(&prefix).trim_end_matches(DELIMITER).to_string();
                    if !self.recursive {
                        continue;
                    }
                    if !name.is_empty() && self.filter.is_excluded_dir(&name) {
                        continue;
                    }
                    debug!("prefix found: {}", prefix);
                    self.stack.push(Frame::new(prefix, false));
                }
                None if frame.exhausted => {
                    self.stack.pop();
                }
                None => self.refill().await?,
            }
        }
    }
}
