//! Directory cache interface.
//!
//! Listing storage is an external collaborator; the operation core only
//! needs lookups (to backfill overwrite prompts) and upload completions
//! (to patch the cached size). Lookups report whether the name matched
//! case-sensitively — case-insensitive hits are advisory only and the
//! core ignores them.

use std::time::SystemTime;

use crate::path::RemotePath;
use crate::server::ServerKey;

/// One cached directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Direntry {
    pub name: String,
    pub size: Option<u64>,
    pub time: Option<SystemTime>,
    pub is_dir: bool,
}

/// A lookup hit.
#[derive(Debug, Clone)]
pub struct CacheLookup {
    pub entry: Direntry,
    /// The stored name matches the query byte for byte.
    pub matched_case: bool,
}

/// Read/patch access to the embedder's listing cache.
pub trait DirectoryCache: Send + Sync {
    /// Find `name` in the cached listing of `path`.
    fn lookup_file(&self, server: &ServerKey, path: &RemotePath, name: &str) -> Option<CacheLookup>;

    /// Patch the size of `name` after a completed upload. Returns whether
    /// a cached listing was updated.
    fn update_file(
        &self,
        server: &ServerKey,
        path: &RemotePath,
        name: &str,
        size: Option<u64>,
    ) -> bool {
        let _ = (server, path, name, size);
        false
    }
}

/// A cache that knows nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyCache;

impl DirectoryCache for EmptyCache {
    fn lookup_file(
        &self,
        _server: &ServerKey,
        _path: &RemotePath,
        _name: &str,
    ) -> Option<CacheLookup> {
        None
    }
}
