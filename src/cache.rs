//! Incremental build cache.
//!
//! Content hashes decide what changed; an import graph decides what else has
//! to be rebuilt because of it. Hashes and per-file outputs live in two
//! independent LRU tables.

use indexmap::IndexMap;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::hash::Hash;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::pipeline::FileArtifacts;

pub const DEFAULT_CAPACITY: usize = 1000;

/// Candidate extensions tried, in order, for extensionless specifiers.
pub const RESOLVE_EXTENSIONS: [&str; 6] = ["ts", "tsx", "js", "jsx", "mjs", "cjs"];

lazy_static::lazy_static! {
    static ref IMPORT_RE: regex::Regex = regex::Regex::new(
        r#"(?:import|export)\s[^'"`;]*?\bfrom\s*['"]([^'"]+)['"]|\bimport\s*['"]([^'"]+)['"]|\bimport\s*\(\s*['"]([^'"]+)['"]\s*\)|\brequire\s*\(\s*['"]([^'"]+)['"]\s*\)"#
    ).unwrap();

    static ref DEFAULT_CACHE: Arc<Mutex<BuildCache>> =
        Arc::new(Mutex::new(BuildCache::new(DEFAULT_CAPACITY)));
}

// ═══════════════════════════════════════════════════════════════════════════════
// LRU TABLE
// ═══════════════════════════════════════════════════════════════════════════════

/// Insertion-ordered map where the front is least recently used.
#[derive(Debug, Clone)]
pub struct LruTable<K: Hash + Eq, V> {
    entries: IndexMap<K, V>,
    capacity: usize,
}

impl<K: Hash + Eq, V> LruTable<K, V> {
    pub fn new(capacity: usize) -> Self {
        LruTable {
            entries: IndexMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn get(&mut self, key: &K) -> Option<&V> {
        let idx = self.entries.get_index_of(key)?;
        let last = self.entries.len() - 1;
        self.entries.move_index(idx, last);
        self.entries.get_index(last).map(|(_, v)| v)
    }

    /// Read without touching recency.
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, key: K, value: V) {
        if let Some(idx) = self.entries.get_index_of(&key) {
            self.entries.shift_remove_index(idx);
        }
        self.entries.insert(key, value);
        while self.entries.len() > self.capacity {
            self.entries.shift_remove_index(0);
        }
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.shift_remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DEPENDENCY GRAPH
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    pub dependencies: BTreeMap<PathBuf, BTreeSet<PathBuf>>,
    pub dependents: BTreeMap<PathBuf, BTreeSet<PathBuf>>,
}

impl DependencyGraph {
    pub fn add_file(&mut self, file: &Path) {
        self.dependencies.entry(file.to_path_buf()).or_default();
        self.dependents.entry(file.to_path_buf()).or_default();
    }

    pub fn add_edge(&mut self, importer: &Path, imported: &Path) {
        self.add_file(importer);
        self.add_file(imported);
        self.dependencies
            .entry(importer.to_path_buf())
            .or_default()
            .insert(imported.to_path_buf());
        self.dependents
            .entry(imported.to_path_buf())
            .or_default()
            .insert(importer.to_path_buf());
    }

    pub fn files(&self) -> impl Iterator<Item = &PathBuf> {
        self.dependencies.keys()
    }

    /// `changed` plus everything that transitively imports it.
    pub fn affected_files(&self, changed: &[PathBuf]) -> BTreeSet<PathBuf> {
        let mut affected: BTreeSet<PathBuf> = BTreeSet::new();
        let mut queue: VecDeque<PathBuf> = changed.iter().cloned().collect();
        while let Some(file) = queue.pop_front() {
            if !affected.insert(file.clone()) {
                continue;
            }
            if let Some(importers) = self.dependents.get(&file) {
                queue.extend(importers.iter().cloned());
            }
        }
        affected
    }
}

/// Specifiers a file imports, in source order, duplicates removed.
pub fn scan_imports(source: &str) -> Vec<String> {
    let mut specifiers: Vec<String> = Vec::new();
    for caps in IMPORT_RE.captures_iter(source) {
        let Some(spec) = (1..=4).find_map(|i| caps.get(i)) else {
            continue;
        };
        let spec = spec.as_str().to_string();
        if !specifiers.contains(&spec) {
            specifiers.push(spec);
        }
    }
    specifiers
}

/// Lexically resolve `.`/`..` without touching the filesystem.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Resolve a relative or absolute specifier to an existing file.
/// Package specifiers are never resolved.
pub fn resolve_import(importer: &Path, specifier: &str) -> Option<PathBuf> {
    let base = if specifier.starts_with("./") || specifier.starts_with("../") {
        normalize_lexically(&importer.parent()?.join(specifier))
    } else if specifier.starts_with('/') {
        normalize_lexically(Path::new(specifier))
    } else {
        return None;
    };

    if base.is_file() {
        return Some(base);
    }
    let file_name = base.file_name()?.to_string_lossy().to_string();
    for ext in RESOLVE_EXTENSIONS {
        let candidate = base.with_file_name(format!("{}.{}", file_name, ext));
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    for ext in RESOLVE_EXTENSIONS {
        let candidate = base.join(format!("index.{}", ext));
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

// ═══════════════════════════════════════════════════════════════════════════════
// BUILD CACHE
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct BuildCacheEntry {
    pub hash: String,
    pub output: FileArtifacts,
    pub dependency_files: Vec<PathBuf>,
    /// Seconds since the Unix epoch.
    pub timestamp: u64,
}

#[derive(Debug, Clone)]
pub struct BuildCache {
    hashes: LruTable<PathBuf, String>,
    outputs: LruTable<PathBuf, BuildCacheEntry>,
    graph: DependencyGraph,
}

impl Default for BuildCache {
    fn default() -> Self {
        BuildCache::new(DEFAULT_CAPACITY)
    }
}

impl BuildCache {
    pub fn new(capacity: usize) -> Self {
        BuildCache {
            hashes: LruTable::new(capacity),
            outputs: LruTable::new(capacity),
            graph: DependencyGraph::default(),
        }
    }

    pub fn compute_hash(source: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(source.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// True when no hash is recorded or the content hash differs.
    pub fn needs_rebuild(&mut self, file: &Path, source: &str) -> bool {
        let current = Self::compute_hash(source);
        match self.hashes.get(&file.to_path_buf()) {
            Some(cached) => *cached != current,
            None => true,
        }
    }

    pub fn update_hash(&mut self, file: &Path, source: &str) {
        self.hashes
            .insert(file.to_path_buf(), Self::compute_hash(source));
    }

    pub fn cached_hash(&self, file: &Path) -> Option<&String> {
        self.hashes.peek(&file.to_path_buf())
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Rebuild the import graph from `roots`, following resolved imports into
    /// non-root files. Returns the content of every file in the graph.
    pub fn build_dependency_graph(
        &mut self,
        roots: &[(PathBuf, String)],
    ) -> BTreeMap<PathBuf, String> {
        let mut graph = DependencyGraph::default();
        let mut contents: BTreeMap<PathBuf, String> = BTreeMap::new();
        let mut queue: VecDeque<(PathBuf, String)> = roots.iter().cloned().collect();

        while let Some((file, source)) = queue.pop_front() {
            if contents.contains_key(&file) {
                continue;
            }
            graph.add_file(&file);
            for specifier in scan_imports(&source) {
                let Some(resolved) = resolve_import(&file, &specifier) else {
                    continue;
                };
                graph.add_edge(&file, &resolved);
                if contents.contains_key(&resolved) || queue.iter().any(|(p, _)| *p == resolved) {
                    continue;
                }
                match std::fs::read_to_string(&resolved) {
                    Ok(text) => queue.push_back((resolved, text)),
                    Err(err) => {
                        tracing::debug!(file = %resolved.display(), error = %err, "unreadable dependency")
                    }
                }
            }
            contents.insert(file, source);
        }

        self.graph = graph;
        contents
    }

    pub fn affected_files(&self, changed: &[PathBuf]) -> BTreeSet<PathBuf> {
        self.graph.affected_files(changed)
    }

    /// Cached output, if it was produced from content with `hash`.
    pub fn get_output(&mut self, file: &Path, hash: &str) -> Option<&FileArtifacts> {
        self.outputs
            .get(&file.to_path_buf())
            .filter(|entry| entry.hash == hash)
            .map(|entry| &entry.output)
    }

    pub fn set_output(&mut self, file: &Path, hash: String, output: FileArtifacts) {
        let dependency_files = self
            .graph
            .dependencies
            .get(file)
            .map(|deps| deps.iter().cloned().collect())
            .unwrap_or_default();
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.outputs.insert(
            file.to_path_buf(),
            BuildCacheEntry {
                hash,
                output,
                dependency_files,
                timestamp,
            },
        );
    }

    pub fn output_entry(&self, file: &Path) -> Option<&BuildCacheEntry> {
        self.outputs.peek(&file.to_path_buf())
    }

    /// Drop cached outputs for every file in `files`.
    pub fn invalidate_outputs<'f>(&mut self, files: impl IntoIterator<Item = &'f PathBuf>) {
        for file in files {
            self.outputs.remove(file);
        }
    }

    pub fn clear(&mut self) {
        self.hashes.clear();
        self.outputs.clear();
        self.graph = DependencyGraph::default();
    }
}

/// Process-wide cache for callers that do not manage their own.
pub fn default_cache() -> Arc<Mutex<BuildCache>> {
    Arc::clone(&DEFAULT_CACHE)
}

pub fn reset_default_cache() {
    match DEFAULT_CACHE.lock() {
        Ok(mut cache) => cache.clear(),
        Err(poisoned) => poisoned.into_inner().clear(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_lru_evicts_least_recently_used() {
        let mut table: LruTable<String, u32> = LruTable::new(2);
        table.insert("a".to_string(), 1);
        table.insert("b".to_string(), 2);
        assert_eq!(table.get(&"a".to_string()), Some(&1));
        table.insert("c".to_string(), 3);
        assert!(table.peek(&"b".to_string()).is_none());
        assert!(table.peek(&"a".to_string()).is_some());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_scan_imports_tolerant() {
        let source = r#"
import a from "./a";
import {
  b,
  c as d,
} from '../lib/b';
import "./side.css";
export { e } from "./e";
const f = await import("./f");
const g = require('./g');
import h from "react";
// plain text mentioning import in a comment
"#;
        assert_eq!(
            scan_imports(source),
            vec!["./a", "../lib/b", "./side.css", "./e", "./f", "./g", "react"]
        );
    }

    #[test]
    fn test_resolve_import_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("lib/ui")).unwrap();
        fs::write(root.join("page.tsx"), "").unwrap();
        fs::write(root.join("lib/db.ts"), "").unwrap();
        fs::write(root.join("lib/ui/index.jsx"), "").unwrap();

        let importer = root.join("page.tsx");
        assert_eq!(resolve_import(&importer, "./lib/db"), Some(root.join("lib/db.ts")));
        assert_eq!(resolve_import(&importer, "./lib/db.ts"), Some(root.join("lib/db.ts")));
        assert_eq!(resolve_import(&importer, "./lib/ui"), Some(root.join("lib/ui/index.jsx")));
        assert_eq!(resolve_import(&importer, "./missing"), None);
        assert_eq!(resolve_import(&importer, "react"), None);
    }

    #[test]
    fn test_incremental_invalidation() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.ts");
        let b = dir.path().join("b.ts");
        let a_src = "import { value } from './b';\nexport const doubled = value * 2;".to_string();
        let b_src = "export const value = 1;".to_string();
        fs::write(&a, &a_src).unwrap();
        fs::write(&b, &b_src).unwrap();

        let mut cache = BuildCache::new(16);
        cache.build_dependency_graph(&[(a.clone(), a_src.clone()), (b.clone(), b_src.clone())]);
        cache.update_hash(&a, &a_src);
        cache.update_hash(&b, &b_src);
        assert!(!cache.needs_rebuild(&a, &a_src));
        assert!(!cache.needs_rebuild(&b, &b_src));

        let b_changed = "export const value = 2;";
        assert!(cache.needs_rebuild(&b, b_changed));
        let affected = cache.affected_files(&[b.clone()]);
        assert!(affected.contains(&a));
        assert!(affected.contains(&b));

        // Re-hashing unchanged content is a no-op
        cache.update_hash(&a, &a_src);
        cache.update_hash(&b, &b_src);
        assert!(!cache.needs_rebuild(&a, &a_src));
        assert!(!cache.needs_rebuild(&b, &b_src));
    }

    #[test]
    fn test_graph_follows_non_root_dependencies() {
        let dir = tempfile::tempdir().unwrap();
        let page = dir.path().join("page.tsx");
        let util = dir.path().join("util.ts");
        let leaf = dir.path().join("leaf.ts");
        fs::write(&util, "import { x } from './leaf';").unwrap();
        fs::write(&leaf, "export const x = 1;").unwrap();

        let mut cache = BuildCache::default();
        let contents =
            cache.build_dependency_graph(&[(page.clone(), "import './util';".to_string())]);
        assert_eq!(contents.len(), 3);
        assert!(cache.graph().dependents[&leaf].contains(&util));

        let affected = cache.affected_files(&[leaf.clone()]);
        assert_eq!(affected.len(), 3);
        assert!(affected.contains(&page));
    }

    #[test]
    fn test_output_cache_keyed_by_hash() {
        let mut cache = BuildCache::new(4);
        let file = PathBuf::from("/src/page.tsx");
        cache.set_output(&file, "h1".to_string(), FileArtifacts::default());
        assert!(cache.get_output(&file, "h1").is_some());
        assert!(cache.get_output(&file, "h2").is_none());
        assert!(cache.output_entry(&file).unwrap().timestamp > 0);

        cache.invalidate_outputs([&file]);
        assert!(cache.get_output(&file, "h1").is_none());
    }

    #[test]
    fn test_default_cache_reset() {
        let file = PathBuf::from("/singleton/page.tsx");
        default_cache().lock().unwrap().update_hash(&file, "x");
        reset_default_cache();
        assert!(default_cache().lock().unwrap().cached_hash(&file).is_none());
    }
}
