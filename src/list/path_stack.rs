//! Parallel path tracking during a list traversal
//!
//! Three path forms advance together: the agent-visible logical path
//! (`/`-separated), the sanitised on-disk path, and the agent's original
//! path using its native separator. The original path is a plain string
//! rather than a stack because list entries may override it wholesale via
//! their `orig_path` attribute.

use crate::error::{BackupError, Result};
use std::path::PathBuf;

/// Sanitise an entry name for the local filesystem
///
/// Total and deterministic; two distinct names may collide after
/// sanitisation, which the filesystem reports as an ordinary error.
#[must_use]
pub fn fix_for_os(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if (c as u32) < 0x20 => '_',
            c => c,
        })
        .collect();
    // "." and ".." would escape or collapse the tree
    if out.is_empty() || out == "." {
        out = "_".to_string();
    } else if out == ".." {
        out = "__".to_string();
    }
    out
}

/// The three parallel paths of the current traversal position
#[derive(Debug, Default)]
pub struct PathStack {
    logical: Vec<String>,
    os: Vec<String>,
    orig: String,
}

impl PathStack {
    /// Empty stack at the traversal root
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current depth; the logical path has exactly this many separators
    #[must_use]
    pub fn depth(&self) -> usize {
        self.logical.len()
    }

    /// Descend into `name`
    pub fn enter(&mut self, name: &str, os_name: &str) {
        self.logical.push(name.to_string());
        self.os.push(os_name.to_string());
    }

    /// Ascend one level
    ///
    /// # Errors
    ///
    /// Returns `ListCorrupt` when already at the root: every close event must
    /// be preceded by a matching open.
    pub fn leave(&mut self) -> Result<()> {
        if self.logical.pop().is_none() || self.os.pop().is_none() {
            return Err(BackupError::ListCorrupt(
                "directory close without matching open".to_string(),
            ));
        }
        Ok(())
    }

    /// Agent-visible path, `/`-separated with a leading slash (empty at root)
    #[must_use]
    pub fn logical(&self) -> String {
        join_slash(&self.logical)
    }

    /// Sanitised path in the same `/`-separated shape as [`logical`](Self::logical)
    #[must_use]
    pub fn os_str(&self) -> String {
        join_slash(&self.os)
    }

    /// Sanitised path relative to the backup root
    #[must_use]
    pub fn os_rel(&self) -> PathBuf {
        self.os.iter().collect()
    }

    /// Name of the depth-1 directory, if any
    #[must_use]
    pub fn top(&self) -> Option<&str> {
        self.logical.first().map(String::as_str)
    }

    /// Leaf segment of the logical path
    #[must_use]
    pub fn logical_leaf(&self) -> Option<&str> {
        self.logical.last().map(String::as_str)
    }

    /// Leaf segment of the sanitised path
    #[must_use]
    pub fn os_leaf(&self) -> Option<&str> {
        self.os.last().map(String::as_str)
    }

    /// Logical path of the containing directory (everything but the leaf)
    #[must_use]
    pub fn logical_container(&self) -> String {
        join_slash(&self.logical[..self.logical.len().saturating_sub(1)])
    }

    /// Sanitised path of the containing directory
    #[must_use]
    pub fn os_container(&self) -> String {
        join_slash(&self.os[..self.os.len().saturating_sub(1)])
    }

    /// Original (agent-side) path
    #[must_use]
    pub fn orig(&self) -> &str {
        &self.orig
    }

    /// Replace the original path wholesale (entry carried `orig_path`)
    pub fn set_orig(&mut self, path: String) {
        self.orig = path;
    }

    /// Append one segment to the original path with the agent's separator
    pub fn push_orig(&mut self, sep: &str, name: &str) {
        self.orig.push_str(sep);
        self.orig.push_str(name);
    }

    /// Drop the last segment of the original path
    pub fn pop_orig(&mut self, sep: &str) {
        if sep.is_empty() {
            return;
        }
        match self.orig.rfind(sep) {
            Some(idx) => self.orig.truncate(idx),
            None => self.orig.clear(),
        }
    }
}

fn join_slash(segments: &[String]) -> String {
    let mut out = String::new();
    for s in segments {
        out.push('/');
        out.push_str(s);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_advance_together() {
        let mut stack = PathStack::new();
        stack.enter("C?", &fix_for_os("C?"));
        stack.enter("sub", "sub");
        assert_eq!(stack.depth(), 2);
        assert_eq!(stack.logical(), "/C?/sub");
        assert_eq!(stack.os_str(), "/C_/sub");
        assert_eq!(stack.os_rel(), PathBuf::from("C_/sub"));
        stack.leave().expect("balanced");
        assert_eq!(stack.logical(), "/C?");
        assert_eq!(stack.top(), Some("C?"));
    }

    #[test]
    fn leave_at_root_is_corrupt() {
        let mut stack = PathStack::new();
        assert!(stack.leave().is_err());
    }

    #[test]
    fn depth_matches_separator_count() {
        let mut stack = PathStack::new();
        for name in ["a", "b", "c"] {
            stack.enter(name, name);
            let logical = stack.logical();
            assert_eq!(logical.matches('/').count(), stack.depth());
        }
    }

    #[test]
    fn orig_path_push_pop_and_override() {
        let mut stack = PathStack::new();
        stack.push_orig("\\", "C:");
        stack.push_orig("\\", "Users");
        assert_eq!(stack.orig(), "\\C:\\Users");
        stack.pop_orig("\\");
        assert_eq!(stack.orig(), "\\C:");
        stack.set_orig("D:\\data".to_string());
        assert_eq!(stack.orig(), "D:\\data");
    }

    #[rstest::rstest]
    #[case("a<b>c:d", "a_b_c_d")]
    #[case("tab\there", "tab_here")]
    #[case("back\\slash", "back_slash")]
    #[case("..", "__")]
    #[case(".", "_")]
    #[case("", "_")]
    #[case("plain-name.txt", "plain-name.txt")]
    fn sanitiser_replaces_reserved_characters(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(fix_for_os(input), expected);
    }

    #[test]
    fn container_and_leaf_views() {
        let mut stack = PathStack::new();
        stack.enter("Volume", "Volume");
        stack.enter("dir", "dir");
        assert_eq!(stack.logical_leaf(), Some("dir"));
        assert_eq!(stack.logical_container(), "/Volume");
        assert_eq!(stack.os_container(), "/Volume");
    }
}
