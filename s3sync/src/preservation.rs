//! Ownership, permission and symlink metadata carried between namespaces

use std::collections::HashMap;
use std::path::Path;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{Result, SyncError};

/// Metadata header names stored alongside every uploaded object
pub const OWNER_HEADER: &str = "owner";
pub const GROUP_HEADER: &str = "group";
pub const PERMISSIONS_HEADER: &str = "permissions";
pub const SYMLINK_HEADER: &str = "symlink";

/// Permission bits assumed when an object carries none
pub const DEFAULT_PERMISSIONS: u32 = 0o600;

/// Options for attribute preservation on download
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreservationOptions {
    /// Apply recorded permission bits (not applied to symlinks)
    pub preserve_permissions: bool,
    /// Apply recorded owner and group (Unix only)
    pub preserve_ownership: bool,
}

impl Default for PreservationOptions {
    fn default() -> Self {
        Self {
            preserve_permissions: true,
            preserve_ownership: true,
        }
    }
}

/// Out-of-band attributes of one node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMetadata {
    pub owner: u32,
    pub group: u32,
    /// Full `st_mode` value, file type bits included
    pub permissions: u32,
    pub symlink: bool,
}

impl Default for NodeMetadata {
    fn default() -> Self {
        Self {
            owner: 0,
            group: 0,
            permissions: DEFAULT_PERMISSIONS,
            symlink: false,
        }
    }
}

impl NodeMetadata {
    /// Read attributes from `lstat` output
    pub fn from_std(metadata: &std::fs::Metadata) -> Self {
        let (owner, group) = get_ownership(metadata);
        Self {
            owner,
            group,
            permissions: get_permissions(metadata),
            symlink: metadata.file_type().is_symlink(),
        }
    }

    /// Parse object metadata headers, falling back to defaults for anything missing or malformed
    pub fn from_headers(headers: &HashMap<String, String>) -> Self {
        let number = |name: &str, default: u32| {
            headers
                .get(name)
                .and_then(|value| value.trim().parse::<u32>().ok())
                .unwrap_or(default)
        };

        Self {
            owner: number(OWNER_HEADER, 0),
            group: number(GROUP_HEADER, 0),
            permissions: number(PERMISSIONS_HEADER, DEFAULT_PERMISSIONS),
            symlink: headers
                .get(SYMLINK_HEADER)
                .is_some_and(|value| value == "true"),
        }
    }

    pub fn to_headers(&self) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        headers.insert(OWNER_HEADER.to_string(), self.owner.to_string());
        headers.insert(GROUP_HEADER.to_string(), self.group.to_string());
        headers.insert(PERMISSIONS_HEADER.to_string(), self.permissions.to_string());
        if self.symlink {
            headers.insert(SYMLINK_HEADER.to_string(), "true".to_string());
        }
        headers
    }

    /// Permission bits without the file type
    pub fn mode(&self) -> u32 {
        self.permissions & 0o7777
    }
}

/// Applies downloaded metadata to local paths
#[derive(Debug, Clone, Default)]
pub struct AttributePreserver {
    options: PreservationOptions,
}

impl AttributePreserver {
    pub fn new(options: PreservationOptions) -> Self {
        Self { options }
    }

    /// Apply ownership, then permissions. Symlinks get `lchown` and keep their mode.
    pub async fn apply(&self, path: &Path, metadata: &NodeMetadata) -> Result<()> {
        if self.options.preserve_ownership {
            let current = fs::symlink_metadata(path).await.map_err(|e| {
                SyncError::attribute_error(path, format!("Failed to read metadata: {}", e))
            })?;
            if get_ownership(&current) != (metadata.owner, metadata.group) {
                set_ownership(path, metadata.owner, metadata.group, metadata.symlink)?;
            }
        }

        if self.options.preserve_permissions && !metadata.symlink {
            set_permissions(path, metadata.mode()).await?;
        }

        Ok(())
    }
}

/// Set file permissions
async fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(mode);
        fs::set_permissions(path, perms)
            .await
            .map_err(|e| SyncError::attribute_error(path, format!("Failed to set permissions: {}", e)))
    }

    #[cfg(not(unix))]
    {
        let readonly = (mode & 0o200) == 0;
        let mut perms = fs::metadata(path)
            .await
            .map_err(|e| SyncError::attribute_error(path, format!("Failed to read metadata: {}", e)))?
            .permissions();
        perms.set_readonly(readonly);
        fs::set_permissions(path, perms)
            .await
            .map_err(|e| SyncError::attribute_error(path, format!("Failed to set permissions: {}", e)))
    }
}

/// Set file ownership, without following a final symlink when `no_follow` is set
fn set_ownership(path: &Path, uid: u32, gid: u32, no_follow: bool) -> Result<()> {
    #[cfg(unix)]
    {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let path_cstr = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| SyncError::attribute_error(path, format!("Invalid path: {}", e)))?;

        let result = if no_follow {
            unsafe { libc::lchown(path_cstr.as_ptr(), uid, gid) }
        } else {
            unsafe { libc::chown(path_cstr.as_ptr(), uid, gid) }
        };
        if result != 0 {
            return Err(SyncError::attribute_error(
                path,
                format!(
                    "Failed to set ownership to {}:{}: {}",
                    uid,
                    gid,
                    std::io::Error::last_os_error()
                ),
            ));
        }
    }

    #[cfg(not(unix))]
    {
        let _ = (path, uid, gid, no_follow);
    }

    Ok(())
}

#[cfg(unix)]
fn get_permissions(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode()
}

#[cfg(not(unix))]
fn get_permissions(metadata: &std::fs::Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o666
    }
}

#[cfg(unix)]
fn get_ownership(metadata: &std::fs::Metadata) -> (u32, u32) {
    use std::os::unix::fs::MetadataExt;
    (metadata.uid(), metadata.gid())
}

#[cfg(not(unix))]
fn get_ownership(_metadata: &std::fs::Metadata) -> (u32, u32) {
    (0, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_headers_fall_back_to_defaults() {
        let metadata = NodeMetadata::from_headers(&HashMap::new());
        assert_eq!(metadata, NodeMetadata::default());
        assert_eq!(metadata.mode(), 0o600);
    }

    #[test]
    fn test_headers_carry_symlink_flag_only_when_set() {
        let metadata = NodeMetadata {
            owner: 1000,
            group: 100,
            permissions: 0o100644,
            symlink: false,
        };
        let headers = metadata.to_headers();
        assert_eq!(headers.get(PERMISSIONS_HEADER).unwrap(), "33188");
        assert!(!headers.contains_key(SYMLINK_HEADER));

        let link = NodeMetadata { symlink: true, ..metadata };
        let parsed = NodeMetadata::from_headers(&link.to_headers());
        assert_eq!(parsed, link);
    }

    #[test]
    fn test_malformed_numbers_use_defaults() {
        let mut headers = HashMap::new();
        headers.insert(OWNER_HEADER.to_string(), "root".to_string());
        headers.insert(PERMISSIONS_HEADER.to_string(), "-1".to_string());
        let metadata = NodeMetadata::from_headers(&headers);
        assert_eq!(metadata.owner, 0);
        assert_eq!(metadata.permissions, DEFAULT_PERMISSIONS);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_apply_sets_mode_and_keeps_own_ownership() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("file.txt");
        fs::write(&path, b"content").await.unwrap();

        let current = NodeMetadata::from_std(&std::fs::symlink_metadata(&path).unwrap());
        let wanted = NodeMetadata {
            permissions: 0o100640,
            ..current
        };

        let preserver = AttributePreserver::default();
        preserver.apply(&path, &wanted).await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o7777, 0o640);
    }

    #[test]
    fn test_preservation_options() {
        let default_opts = PreservationOptions::default();
        assert!(default_opts.preserve_permissions);
        assert!(default_opts.preserve_ownership);
    }
}
