//! Name exclusion using a single regular expression

use regex::Regex;
use tracing::debug;

use crate::error::Result;

/// Exclusion rule shared by both walkers.
///
/// Candidates are names relative to the namespace root. Directories about
/// to be descended into are tested with a trailing `/`, so a pattern such
/// as `\.git/` prunes the whole subtree.
#[derive(Debug, Clone, Default)]
pub struct ExcludeFilter {
    pattern: Option<Regex>,
}

impl ExcludeFilter {
    /// Compile the pattern; an invalid expression is reported before any traversal
    pub fn new(pattern: Option<&str>) -> Result<Self> {
        let pattern = pattern.map(Regex::new).transpose()?;
        Ok(Self { pattern })
    }

    /// Filter that lets every name through
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_excluded(&self, candidate: &str) -> bool {
        match &self.pattern {
            Some(pattern) if pattern.is_match(candidate) => {
                debug!("skipping {} because of exclude pattern", candidate);
                true
            }
            _ => false,
        }
    }

    /// Test a directory before recursing into it
    pub fn is_excluded_dir(&self, name: &str) -> bool {
        if self.pattern.is_none() {
            return false;
        }
        self.is_excluded(&format!("{}/", name))
    }

    pub fn pattern(&self) -> Option<&str> {
        self.pattern.as_ref().map(Regex::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;

    #[test]
    fn test_no_pattern_excludes_nothing() {
        let filter = ExcludeFilter::none();
        assert!(!filter.is_excluded("anything"));
        assert!(!filter.is_excluded_dir("dir"));
    }

    #[test]
    fn test_pattern_matches_relative_names() {
        let filter = ExcludeFilter::new(Some(r"\.tmp$")).unwrap();
        assert!(filter.is_excluded("a/b/c.tmp"));
        assert!(!filter.is_excluded("a/b/c.tmp.keep"));
    }

    #[test]
    fn test_directory_candidates_carry_trailing_slash() {
        let filter = ExcludeFilter::new(Some(r"(^|/)\.git/")).unwrap();
        assert!(filter.is_excluded_dir(".git"));
        assert!(filter.is_excluded_dir("vendor/.git"));
        assert!(!filter.is_excluded(".git"));
        assert!(!filter.is_excluded_dir(".github"));
    }

    #[test]
    fn test_pattern_is_reported_as_given() {
        assert_eq!(ExcludeFilter::none().pattern(), None);
        let filter = ExcludeFilter::new(Some(r"^build/")).unwrap();
        assert_eq!(filter.pattern(), Some(r"^build/"));
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        let result = ExcludeFilter::new(Some("(unclosed"));
        assert!(matches!(result, Err(SyncError::FilterPattern(_))));
    }
}
