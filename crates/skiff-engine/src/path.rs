//! Server-side paths.
//!
//! The operation core only needs absolute Unix-syntax paths; VMS- or
//! DOS-style FTP path grammars are a dialect concern. Paths are kept as
//! normalized segment lists so parent checks and filename formatting do
//! not depend on string layout.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::server::ServerKind;

/// An absolute server-side directory path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemotePath {
    kind: ServerKind,
    segments: Vec<String>,
}

impl RemotePath {
    /// The root directory for a server kind.
    pub fn root(kind: ServerKind) -> RemotePath {
        RemotePath { kind, segments: Vec::new() }
    }

    /// Parse an absolute path. Returns `None` for relative or empty
    /// input; `.` and empty segments are dropped, `..` pops.
    pub fn parse(kind: ServerKind, raw: &str) -> Option<RemotePath> {
        if !raw.starts_with('/') {
            return None;
        }
        let mut segments = Vec::new();
        for segment in raw.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    segments.pop()?;
                }
                other => segments.push(other.to_string()),
            }
        }
        Some(RemotePath { kind, segments })
    }

    pub fn kind(&self) -> ServerKind {
        self.kind
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn has_parent(&self) -> bool {
        !self.segments.is_empty()
    }

    /// The parent directory, or `None` at the root.
    pub fn parent(&self) -> Option<RemotePath> {
        if self.segments.is_empty() {
            return None;
        }
        let mut parent = self.clone();
        parent.segments.pop();
        Some(parent)
    }

    /// Descend into a child directory.
    pub fn join(&self, segment: &str) -> RemotePath {
        let mut child = self.clone();
        child.segments.push(segment.to_string());
        child
    }

    /// Whether `self` is an ancestor of `other`. With `direct_only`, only
    /// the immediate parent qualifies.
    pub fn is_parent_of(&self, other: &RemotePath, direct_only: bool) -> bool {
        if other.segments.len() <= self.segments.len() {
            return false;
        }
        if direct_only && other.segments.len() != self.segments.len() + 1 {
            return false;
        }
        other.segments[..self.segments.len()] == self.segments[..]
    }

    /// Full path of a file inside this directory, for user messages.
    pub fn format_filename(&self, name: &str) -> String {
        if self.segments.is_empty() {
            format!("/{}", name)
        } else {
            format!("{}/{}", self, name)
        }
    }
}

impl fmt::Display for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("/");
        }
        for segment in &self.segments {
            write!(f, "/{}", segment)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(raw: &str) -> RemotePath {
        RemotePath::parse(ServerKind::Ftp, raw).unwrap()
    }

    #[test]
    fn parse_rejects_relative_and_empty() {
        assert!(RemotePath::parse(ServerKind::Ftp, "").is_none());
        assert!(RemotePath::parse(ServerKind::Ftp, "pub/files").is_none());
    }

    #[test]
    fn parse_normalizes_segments() {
        assert_eq!(path("/pub//files/./x").to_string(), "/pub/files/x");
        assert_eq!(path("/pub/files/..").to_string(), "/pub");
        assert_eq!(path("/").to_string(), "/");
    }

    #[test]
    fn dotdot_above_root_is_invalid() {
        assert!(RemotePath::parse(ServerKind::Ftp, "/..").is_none());
        assert!(RemotePath::parse(ServerKind::Ftp, "/a/../..").is_none());
    }

    #[test]
    fn parent_relationships() {
        let base = path("/pub");
        let deep = path("/pub/files/x");
        assert!(base.is_parent_of(&deep, false));
        assert!(!base.is_parent_of(&deep, true));
        assert!(path("/pub/files").is_parent_of(&deep, true));
        assert!(!deep.is_parent_of(&base, false));
        assert!(!base.is_parent_of(&base, false));
    }

    #[test]
    fn format_filename_handles_root() {
        assert_eq!(path("/").format_filename("a.txt"), "/a.txt");
        assert_eq!(path("/pub").format_filename("a.txt"), "/pub/a.txt");
    }

    #[test]
    fn parent_of_root_is_none() {
        assert!(path("/").parent().is_none());
        assert_eq!(path("/pub").parent().unwrap().to_string(), "/");
    }
}
