//! Name-service mirror
//!
//! The coordinator reads service registrations through a local mirror that
//! exposes a pattern lookup and a generation counter bumped on every change.

use super::address::{default_service_path, node_path};
use crate::cluster::Node;
use crate::{Error, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

/// One registered service: its name and RPC spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub name: String,
    pub spec: String,
}

pub trait NameServiceMirror: Send + Sync {
    /// Whether the mirror has completed its initial sync.
    fn ready(&self) -> bool;

    /// Counter bumped whenever the mirrored registrations change.
    fn generation(&self) -> u64;

    /// Entries whose name matches `pattern`, where `*` matches exactly one
    /// path segment. Results are sorted by name.
    fn lookup(&self, pattern: &str) -> Result<Vec<ServiceEntry>>;
}

/// Segment-wise match of `name` against `pattern`.
pub fn pattern_matches(pattern: &str, name: &str) -> bool {
    let mut pattern_segments = pattern.split('/');
    let mut name_segments = name.split('/');
    loop {
        match (pattern_segments.next(), name_segments.next()) {
            (None, None) => return true,
            (Some(p), Some(n)) if p == "*" || p == n => continue,
            _ => return false,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MirrorFile {
    entries: Vec<ServiceEntry>,
}

#[derive(Debug)]
struct Inner {
    entries: BTreeMap<String, String>,
    generation: u64,
    ready: bool,
    fail_lookups: bool,
}

/// In-memory name-service mirror.
///
/// Used by tests and by deployments where registrations come from a static
/// JSON file (`{"entries": [{"name": ..., "spec": ...}]}`).
#[derive(Debug)]
pub struct StaticNameService {
    inner: RwLock<Inner>,
}

impl StaticNameService {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                entries: BTreeMap::new(),
                generation: 1,
                ready: true,
                fail_lookups: false,
            }),
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let file: MirrorFile = serde_json::from_str(json)?;
        let mirror = Self::new();
        {
            let mut inner = mirror.inner.write();
            for entry in file.entries {
                inner.entries.insert(entry.name, entry.spec);
            }
        }
        Ok(mirror)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            Error::NameService(format!("failed to read {}: {}", path.display(), e))
        })?;
        let mirror = Self::from_json(&json)?;
        info!(
            path = %path.display(),
            entries = mirror.len(),
            "Loaded name service registrations"
        );
        Ok(mirror)
    }

    pub fn register(&self, name: impl Into<String>, spec: impl Into<String>) {
        let mut inner = self.inner.write();
        inner.entries.insert(name.into(), spec.into());
        inner.generation += 1;
    }

    pub fn unregister(&self, name: &str) -> bool {
        let mut inner = self.inner.write();
        let removed = inner.entries.remove(name).is_some();
        if removed {
            inner.generation += 1;
        }
        removed
    }

    /// Register a node's base entry and its `default` sibling.
    pub fn register_node(&self, cluster_name: &str, node: Node, spec: impl Into<String>) {
        let base = node_path(cluster_name, node);
        let mut inner = self.inner.write();
        inner.entries.insert(default_service_path(&base), String::new());
        inner.entries.insert(base, spec.into());
        inner.generation += 1;
    }

    pub fn unregister_node(&self, cluster_name: &str, node: Node) -> bool {
        let base = node_path(cluster_name, node);
        let mut inner = self.inner.write();
        let removed = inner.entries.remove(&base).is_some();
        inner.entries.remove(&default_service_path(&base));
        if removed {
            inner.generation += 1;
        }
        removed
    }

    pub fn set_ready(&self, ready: bool) {
        self.inner.write().ready = ready;
    }

    /// Make every lookup fail until cleared.
    pub fn fail_lookups(&self, fail: bool) {
        self.inner.write().fail_lookups = fail;
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }
}

impl Default for StaticNameService {
    fn default() -> Self {
        Self::new()
    }
}

impl NameServiceMirror for StaticNameService {
    fn ready(&self) -> bool {
        self.inner.read().ready
    }

    fn generation(&self) -> u64 {
        self.inner.read().generation
    }

    fn lookup(&self, pattern: &str) -> Result<Vec<ServiceEntry>> {
        let inner = self.inner.read();
        if inner.fail_lookups {
            return Err(Error::NameService(format!("lookup of '{}' failed", pattern)));
        }
        Ok(inner
            .entries
            .iter()
            .filter(|(name, _)| pattern_matches(pattern, name))
            .map(|(name, spec)| ServiceEntry {
                name: name.clone(),
                spec: spec.clone(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_matches_whole_segments() {
        assert!(pattern_matches("a/*/c", "a/b/c"));
        assert!(!pattern_matches("a/*/c", "a/b/c/d"));
        assert!(!pattern_matches("a/*", "a"));
        assert!(!pattern_matches("a/*/c", "a/b/x"));
        assert!(pattern_matches("a/b", "a/b"));
    }

    #[test]
    fn test_generation_bumps_on_change() {
        let mirror = StaticNameService::new();
        let start = mirror.generation();
        mirror.register("x/y", "tcp/h:1");
        assert_eq!(mirror.generation(), start + 1);
        assert!(!mirror.unregister("x/z"));
        assert_eq!(mirror.generation(), start + 1);
        assert!(mirror.unregister("x/y"));
        assert_eq!(mirror.generation(), start + 2);
    }

    #[test]
    fn test_failed_lookup() {
        let mirror = StaticNameService::new();
        mirror.fail_lookups(true);
        assert!(mirror.lookup("*").is_err());
        mirror.fail_lookups(false);
        assert!(mirror.lookup("*").unwrap().is_empty());
    }

    #[test]
    fn test_from_json() {
        let mirror = StaticNameService::from_json(
            r#"{"entries": [
                {"name": "storage/cluster.c/storage/0", "spec": "tcp/h:1"},
                {"name": "storage/cluster.c/storage/0/default", "spec": ""}
            ]}"#,
        )
        .unwrap();
        let found = mirror.lookup("storage/cluster.c/storage/*").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].spec, "tcp/h:1");
        assert!(StaticNameService::from_json("{").is_err());
    }
}
