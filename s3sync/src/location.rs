//! Sync endpoints: a local path or a bucket plus key prefix

use std::fmt;
use std::path::PathBuf;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// One side of a sync. Remote iff `bucket` is present.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    /// Filesystem path, or key prefix for a remote location
    pub path: String,
    pub bucket: Option<String>,
}

impl Location {
    pub fn local(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            bucket: None,
        }
    }

    pub fn remote(bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            path: prefix.into(),
            bucket: Some(bucket.into()),
        }
    }

    /// Parse `bucket:prefix` or a local path. Drive-letter paths such as
    /// `C:\data` stay local.
    pub fn parse(argument: &str) -> Self {
        if is_remote_argument(argument) {
            let (bucket, prefix) = argument.split_once(':').unwrap_or((argument, ""));
            Self::remote(bucket, prefix)
        } else {
            Self::local(argument)
        }
    }

    pub fn is_local(&self) -> bool {
        self.bucket.is_none()
    }

    pub fn is_remote(&self) -> bool {
        self.bucket.is_some()
    }

    /// A trailing slash means "the contents of", otherwise "the item itself"
    pub fn has_trailing_slash(&self) -> bool {
        self.path.ends_with('/')
    }

    /// Local root with any trailing slash removed (`/` stays `/`)
    pub fn local_root(&self) -> PathBuf {
        let trimmed = self.path.trim_end_matches('/');
        if trimmed.is_empty() && self.path.starts_with('/') {
            PathBuf::from("/")
        } else {
            PathBuf::from(trimmed)
        }
    }

    /// Object key for a node name under this remote prefix
    pub fn key_for(&self, name: &str) -> String {
        if name.is_empty() {
            return self.path.clone();
        }
        if self.path.is_empty() || self.path.ends_with('/') {
            format!("{}{}", self.path, name)
        } else {
            format!("{}/{}", self.path, name)
        }
    }

    /// Local path for a node name under this root
    pub fn path_for(&self, name: &str) -> PathBuf {
        let root = self.local_root();
        if name.is_empty() {
            root
        } else {
            root.join(name.trim_end_matches('/'))
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.bucket {
            Some(bucket) => write!(f, "{}:{}", bucket, self.path),
            None => f.write_str(&self.path),
        }
    }
}

fn is_remote_argument(argument: &str) -> bool {
    let drive_letter = argument.len() >= 3
        && argument.as_bytes()[0].is_ascii_alphabetic()
        && argument.as_bytes()[1] == b':'
        && matches!(argument.as_bytes()[2], b'\\' | b'/');
    argument.contains(':') && !drive_letter
}

fn squeeze_slashes(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if c == '/' && out.ends_with('/') {
            continue;
        }
        out.push(c);
    }
    out
}

/// Turn the two command arguments into sync endpoints.
///
/// Exactly one side must be remote. A source without a trailing slash
/// means the item itself, so its last component is appended to the
/// destination; the destination never keeps a trailing slash.
pub fn resolve_endpoints(source: &str, destination: &str) -> Result<(Location, Location)> {
    match (is_remote_argument(source), is_remote_argument(destination)) {
        (true, true) => return Err(SyncError::config_error("Both arguments can't be on S3")),
        (false, false) => return Err(SyncError::config_error("One argument must be on S3")),
        _ => {}
    }

    let mut destination = destination.to_string();
    if !source.ends_with('/') {
        let last = Regex::new(r"([^/:]*)$")?
            .captures(source)
            .and_then(|captures| captures.get(1))
            .map(|m| m.as_str())
            .unwrap_or_default();
        if !(destination.is_empty() || destination.ends_with(':')) {
            destination.push('/');
        }
        destination.push_str(last);
    }

    let source = squeeze_slashes(source);
    let mut destination = squeeze_slashes(&destination);
    if destination.ends_with('/') {
        destination.pop();
    }

    Ok((Location::parse(&source), Location::parse(&destination)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("/etc/", "bucket:pre", "bucket", "pre" ; "contents into prefix")]
    #[test_case("/etc", "bucket:pre", "bucket", "pre/etc" ; "directory into prefix")]
    #[test_case("/etc", "bucket:", "bucket", "etc" ; "directory into bucket root")]
    #[test_case("/etc", "bucket:pre/", "bucket", "pre/etc" ; "destination slash")]
    #[test_case("/a//b/", "bucket:x//y/", "bucket", "x/y" ; "squeezed")]
    fn test_upload_endpoints(source: &str, destination: &str, bucket: &str, prefix: &str) {
        let (src, dst) = resolve_endpoints(source, destination).unwrap();
        assert!(src.is_local());
        assert_eq!(dst, Location::remote(bucket, prefix));
    }

    #[test_case("bucket:pre/etc", "/tmp", "/tmp/etc" ; "item into directory")]
    #[test_case("bucket:pre/etc/", "/tmp/", "/tmp" ; "contents into directory")]
    #[test_case("bucket:etc", "/tmp", "/tmp/etc" ; "top level prefix")]
    fn test_download_endpoints(source: &str, destination: &str, local: &str) {
        let (src, dst) = resolve_endpoints(source, destination).unwrap();
        assert!(src.is_remote());
        assert_eq!(dst, Location::local(local));
    }

    #[test]
    fn test_both_or_neither_remote_is_rejected() {
        assert!(matches!(
            resolve_endpoints("a:x", "b:y"),
            Err(SyncError::Configuration(message)) if message.contains("Both")
        ));
        assert!(matches!(
            resolve_endpoints("/x", "/y"),
            Err(SyncError::Configuration(message)) if message.contains("One argument")
        ));
    }

    #[test]
    fn test_drive_letters_are_local() {
        assert!(Location::parse(r"C:\data").is_local());
        assert!(Location::parse("c:/data").is_local());
        assert!(Location::parse("bucket:c:/data").is_remote());
    }

    #[test]
    fn test_key_and_path_joining() {
        let remote = Location::remote("b", "pre");
        assert_eq!(remote.key_for(""), "pre");
        assert_eq!(remote.key_for("a/b"), "pre/a/b");
        assert_eq!(Location::remote("b", "").key_for("a"), "a");
        assert_eq!(Location::remote("b", "pre/").key_for("a"), "pre/a");

        let local = Location::local("/tmp/dst/");
        assert_eq!(local.path_for(""), PathBuf::from("/tmp/dst"));
        assert_eq!(local.path_for("x/y"), PathBuf::from("/tmp/dst/x/y"));
        assert_eq!(Location::local("/").local_root(), PathBuf::from("/"));
    }

    #[test]
    fn test_display() {
        assert_eq!(Location::remote("b", "p").to_string(), "b:p");
        assert_eq!(Location::local("/x").to_string(), "/x");
    }
}
