//! Discovery Module for the Duet compiler
//!
//! Recursively scans the source tree for special files and derives URL
//! patterns and per-route middleware/layout/error/loading chains from the
//! directory structure.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Recognized extensions, highest priority first.
pub const SPECIAL_EXTENSIONS: [&str; 4] = ["tsx", "ts", "jsx", "js"];

// ═══════════════════════════════════════════════════════════════════════════════
// SPECIAL FILES
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum SpecialFileKind {
    Page,
    Layout,
    Route,
    Middleware,
    Error,
    Loading,
}

impl SpecialFileKind {
    pub fn from_stem(stem: &str) -> Option<Self> {
        match stem {
            "page" => Some(SpecialFileKind::Page),
            "layout" => Some(SpecialFileKind::Layout),
            "route" => Some(SpecialFileKind::Route),
            "middleware" => Some(SpecialFileKind::Middleware),
            "error" => Some(SpecialFileKind::Error),
            "loading" => Some(SpecialFileKind::Loading),
            _ => None,
        }
    }

    /// Kinds that produce route entries in the manifest.
    pub fn is_routable(self) -> bool {
        matches!(self, SpecialFileKind::Page | SpecialFileKind::Route)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredFile {
    pub path: PathBuf,
    /// Forward-slash path relative to the source root.
    pub rel_path: String,
    pub kind: SpecialFileKind,
}

impl DiscoveredFile {
    /// Directory part of `rel_path`, empty for the source root.
    pub fn rel_dir(&self) -> &str {
        parent_dir(&self.rel_path)
    }
}

fn parent_dir(rel_path: &str) -> &str {
    rel_path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

fn extension_rank(file_name: &str) -> usize {
    let ext = file_name.rsplit_once('.').map(|(_, e)| e).unwrap_or("");
    SPECIAL_EXTENSIONS
        .iter()
        .position(|candidate| *candidate == ext)
        .unwrap_or(SPECIAL_EXTENSIONS.len())
}

/// Classify a path purely by its base file name.
pub fn special_file_kind(path: &Path) -> Option<SpecialFileKind> {
    let ext = path.extension()?.to_str()?;
    if !SPECIAL_EXTENSIONS.contains(&ext) {
        return None;
    }
    SpecialFileKind::from_stem(path.file_stem()?.to_str()?)
}

fn is_skipped_dir(name: &str) -> bool {
    name == "node_modules" || name.starts_with('.')
}

/// All special files under `src_dir`, sorted by relative path.
pub fn discover_special_files(src_dir: &Path) -> Vec<DiscoveredFile> {
    let mut files = Vec::new();
    if !src_dir.exists() {
        return files;
    }

    let walker = WalkDir::new(src_dir)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0
                || !entry.file_type().is_dir()
                || !is_skipped_dir(&entry.file_name().to_string_lossy())
        });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(error = %err, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let Some(kind) = special_file_kind(path) else {
            continue;
        };
        let Ok(relative) = path.strip_prefix(src_dir) else {
            continue;
        };
        files.push(DiscoveredFile {
            path: path.to_path_buf(),
            rel_path: relative.to_string_lossy().replace('\\', "/"),
            kind,
        });
    }

    files.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    files
}

// ═══════════════════════════════════════════════════════════════════════════════
// URL PATTERNS
// ═══════════════════════════════════════════════════════════════════════════════

fn is_special_segment(segment: &str) -> bool {
    let stem = segment.split('.').next().unwrap_or(segment);
    SpecialFileKind::from_stem(stem).is_some()
}

/// `blog/[slug]/page.tsx` becomes `/blog/:slug`.
///
/// Grouping segments `(name)` are dropped. Catch-all segments `[...name]` map
/// to `:name` exactly like single dynamic segments.
pub fn url_pattern(rel_path: &str) -> String {
    let mut segments: Vec<&str> = rel_path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.last().is_some_and(|last| is_special_segment(last)) {
        segments.pop();
    }

    let parts: Vec<String> = segments
        .into_iter()
        .filter(|seg| !(seg.starts_with('(') && seg.ends_with(')')))
        .map(|seg| {
            let inner = seg
                .strip_prefix("[[")
                .and_then(|s| s.strip_suffix("]]"))
                .or_else(|| seg.strip_prefix('[').and_then(|s| s.strip_suffix(']')));
            match inner {
                Some(name) => format!(":{}", name.trim_start_matches("...")),
                None => seg.to_string(),
            }
        })
        .collect();

    if parts.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", parts.join("/"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CHAIN RESOLUTION
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RouteChains {
    /// Outermost first.
    pub middleware: Vec<String>,
    /// Outermost first.
    pub layouts: Vec<String>,
    pub error: Option<String>,
    pub loading: Option<String>,
}

/// Special files indexed by directory, one per kind (extension priority decides ties).
#[derive(Debug, Clone, Default)]
pub struct SpecialFileIndex {
    by_dir: HashMap<String, HashMap<SpecialFileKind, String>>,
}

impl SpecialFileIndex {
    pub fn new(files: &[DiscoveredFile]) -> Self {
        let mut by_dir: HashMap<String, HashMap<SpecialFileKind, String>> = HashMap::new();
        for file in files {
            let slot = by_dir.entry(file.rel_dir().to_string()).or_default();
            match slot.get(&file.kind) {
                Some(existing) if extension_rank(existing) <= extension_rank(&file.rel_path) => {
                    tracing::debug!(ignored = %file.rel_path, kept = %existing, "duplicate special file");
                }
                _ => {
                    slot.insert(file.kind, file.rel_path.clone());
                }
            }
        }
        SpecialFileIndex { by_dir }
    }

    fn lookup(&self, dir: &str, kind: SpecialFileKind) -> Option<&String> {
        self.by_dir.get(dir).and_then(|kinds| kinds.get(&kind))
    }

    /// Walk from the file's directory up to the source root.
    pub fn resolve_chains(&self, file: &DiscoveredFile) -> RouteChains {
        let mut dirs = Vec::new();
        let mut dir = file.rel_dir();
        loop {
            dirs.push(dir);
            if dir.is_empty() {
                break;
            }
            dir = parent_dir(dir);
        }

        let mut chains = RouteChains::default();
        for dir in &dirs {
            if chains.error.is_none() {
                chains.error = self.lookup(dir, SpecialFileKind::Error).cloned();
            }
            if chains.loading.is_none() {
                chains.loading = self.lookup(dir, SpecialFileKind::Loading).cloned();
            }
        }

        // Root-most directory first
        for dir in dirs.iter().rev() {
            if let Some(mw) = self.lookup(dir, SpecialFileKind::Middleware) {
                chains.middleware.push(mw.clone());
            }
            let takes_layouts = !matches!(file.kind, SpecialFileKind::Layout | SpecialFileKind::Route);
            if takes_layouts {
                if let Some(layout) = self.lookup(dir, SpecialFileKind::Layout) {
                    chains.layouts.push(layout.clone());
                }
            }
        }
        chains
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn file(rel: &str) -> DiscoveredFile {
        DiscoveredFile {
            path: PathBuf::from(rel),
            rel_path: rel.to_string(),
            kind: special_file_kind(Path::new(rel)).unwrap(),
        }
    }

    #[test]
    fn test_url_pattern_derivation() {
        assert_eq!(url_pattern("/blog/[slug]/page"), "/blog/:slug");
        assert_eq!(url_pattern("/(marketing)/about/page"), "/about");
        assert_eq!(url_pattern("/page"), "/");
        assert_eq!(url_pattern("page.tsx"), "/");
        assert_eq!(url_pattern("api/users/[id]/route.ts"), "/api/users/:id");
        assert_eq!(url_pattern("(shop)/(cart)/layout.tsx"), "/");
    }

    #[test]
    fn test_catch_all_maps_like_single_segment() {
        // Catch-alls currently match exactly one path segment
        assert_eq!(url_pattern("docs/[...path]/page.tsx"), "/docs/:path");
        assert_eq!(url_pattern("docs/[[...path]]/page.tsx"), "/docs/:path");
        assert_eq!(url_pattern("docs/[...path]/page.tsx"), url_pattern("docs/[path]/page.tsx"));
    }

    #[test]
    fn test_special_file_kind() {
        assert_eq!(special_file_kind(Path::new("a/page.tsx")), Some(SpecialFileKind::Page));
        assert_eq!(special_file_kind(Path::new("route.js")), Some(SpecialFileKind::Route));
        assert_eq!(special_file_kind(Path::new("a/page.css")), None);
        assert_eq!(special_file_kind(Path::new("a/pages.tsx")), None);
        assert_eq!(special_file_kind(Path::new("a/page.test.tsx")), None);
    }

    #[test]
    fn test_chain_resolution_order() {
        let files = vec![
            file("layout.tsx"),
            file("middleware.ts"),
            file("error.tsx"),
            file("blog/layout.tsx"),
            file("blog/loading.tsx"),
            file("blog/middleware.ts"),
            file("blog/[slug]/page.tsx"),
            file("blog/[slug]/error.tsx"),
            file("blog/feed/route.ts"),
        ];
        let index = SpecialFileIndex::new(&files);

        let chains = index.resolve_chains(&file("blog/[slug]/page.tsx"));
        assert_eq!(chains.middleware, vec!["middleware.ts", "blog/middleware.ts"]);
        assert_eq!(chains.layouts, vec!["layout.tsx", "blog/layout.tsx"]);
        assert_eq!(chains.error.as_deref(), Some("blog/[slug]/error.tsx"));
        assert_eq!(chains.loading.as_deref(), Some("blog/loading.tsx"));

        let route = index.resolve_chains(&file("blog/feed/route.ts"));
        assert!(route.layouts.is_empty());
        assert_eq!(route.middleware.len(), 2);
        assert_eq!(route.error.as_deref(), Some("error.tsx"));

        let layout = index.resolve_chains(&file("blog/layout.tsx"));
        assert!(layout.layouts.is_empty());
    }

    #[test]
    fn test_missing_special_files_yield_empty_chains() {
        let index = SpecialFileIndex::new(&[file("about/page.tsx")]);
        assert_eq!(index.resolve_chains(&file("about/page.tsx")), RouteChains::default());
    }

    #[test]
    fn test_extension_priority_for_duplicates() {
        let index = SpecialFileIndex::new(&[file("layout.js"), file("layout.tsx"), file("page.tsx")]);
        assert_eq!(index.resolve_chains(&file("page.tsx")).layouts, vec!["layout.tsx"]);
    }

    #[test]
    fn test_discover_skips_node_modules_and_dot_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        for rel in [
            "page.tsx",
            "blog/[slug]/page.tsx",
            "blog/helpers.ts",
            "node_modules/pkg/page.js",
            ".cache/page.tsx",
        ] {
            let path = root.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, "export default function Page() { return null; }").unwrap();
        }

        let found: Vec<String> = discover_special_files(root)
            .into_iter()
            .map(|f| f.rel_path)
            .collect();
        assert_eq!(found, vec!["blog/[slug]/page.tsx", "page.tsx"]);
    }
}
