//! Build manifest: routes, chain modules and stream endpoints.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::analyze::DeclarationKind;
use crate::discovery::{DiscoveredFile, RouteChains, SpecialFileKind};
use crate::emit::StreamEndpoint;
use crate::error::{BuildError, CompilerError, ERR_EXPORT_COLLISION};
use crate::options::BuildMode;
use crate::transform::TransformedDeclaration;

pub const MANIFEST_FILE_NAME: &str = "manifest.json";
pub const SERVER_DIR: &str = "server";
pub const CLIENT_DIR: &str = "client";

pub fn server_module_path(stem: &str, ext: &str) -> String {
    format!("{}/{}.{}", SERVER_DIR, stem, ext)
}

pub fn client_module_path(stem: &str, ext: &str) -> String {
    format!("{}/{}.{}", CLIENT_DIR, stem, ext)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RouteEntry {
    pub url_pattern: String,
    pub export_name: String,
    pub kind: DeclarationKind,
    pub special_file_kind: SpecialFileKind,
    pub source_file: String,
    pub hydrate_props: Vec<String>,
    pub middleware_chain: Vec<String>,
    pub layout_chain: Vec<String>,
    pub error_module: Option<String>,
    pub loading_module: Option<String>,
    pub server_module: String,
    pub client_module: Option<String>,
    pub hydrate_export: Option<String>,
    pub has_loader: bool,
}

impl RouteEntry {
    pub fn new(
        file: &DiscoveredFile,
        url_pattern: &str,
        chains: &RouteChains,
        transformed: &TransformedDeclaration,
        ext: &str,
    ) -> Self {
        RouteEntry {
            url_pattern: url_pattern.to_string(),
            export_name: transformed.export_name.clone(),
            kind: transformed.kind,
            special_file_kind: file.kind,
            source_file: file.rel_path.clone(),
            hydrate_props: transformed.hydrate_props.clone(),
            middleware_chain: chains.middleware.clone(),
            layout_chain: chains.layouts.clone(),
            error_module: chains.error.clone(),
            loading_module: chains.loading.clone(),
            server_module: server_module_path(&transformed.module_stem, ext),
            client_module: transformed
                .client_code
                .as_ref()
                .map(|_| client_module_path(&transformed.module_stem, ext)),
            hydrate_export: transformed.hydrate_export.clone(),
            has_loader: transformed.has_loader,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LayoutEntry {
    pub module: String,
    pub has_loader: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BuildManifest {
    pub routes: Vec<RouteEntry>,
    /// Keyed by source-relative path of the layout file.
    pub layouts: BTreeMap<String, LayoutEntry>,
    pub middlewares: BTreeMap<String, String>,
    pub errors: BTreeMap<String, String>,
    pub loadings: BTreeMap<String, String>,
    pub streams: BTreeMap<String, StreamEndpoint>,
    pub mode: BuildMode,
    pub target: String,
}

impl BuildManifest {
    pub fn new(mode: BuildMode, target: &str) -> Self {
        BuildManifest {
            mode,
            target: target.to_string(),
            ..Default::default()
        }
    }

    /// Register a non-routable special file under its source path.
    pub fn add_chain_module(
        &mut self,
        file: &DiscoveredFile,
        transformed: &TransformedDeclaration,
        ext: &str,
    ) {
        let module = server_module_path(&transformed.module_stem, ext);
        let key = file.rel_path.clone();
        match file.kind {
            SpecialFileKind::Layout => {
                self.layouts.insert(
                    key,
                    LayoutEntry {
                        module,
                        has_loader: transformed.has_loader,
                    },
                );
            }
            SpecialFileKind::Middleware => {
                self.middlewares.insert(key, module);
            }
            SpecialFileKind::Error => {
                self.errors.insert(key, module);
            }
            SpecialFileKind::Loading => {
                self.loadings.insert(key, module);
            }
            SpecialFileKind::Page | SpecialFileKind::Route => {}
        }
    }

    /// Every hydration entry name must be unique across the build.
    pub fn check_export_collisions(
        exports: &[(String, String)],
    ) -> Result<(), CompilerError> {
        let mut seen: HashMap<&str, &str> = HashMap::new();
        for (name, file) in exports {
            if let Some(first) = seen.insert(name.as_str(), file.as_str()) {
                return Err(CompilerError::with_details(
                    ERR_EXPORT_COLLISION,
                    &format!("Hydration export \"{}\" is generated twice.", name),
                    file,
                    1,
                    1,
                    Some(format!("also generated for {}", first)),
                    vec!["Two exports resolve to the same URL pattern and export name.".to_string()],
                ));
            }
        }
        Ok(())
    }

    pub fn write(&self, out_dir: &Path) -> Result<PathBuf, BuildError> {
        let path = out_dir.join(MANIFEST_FILE_NAME);
        let json = serde_json::to_string_pretty(self)?;
        std::fs::create_dir_all(out_dir).map_err(|e| BuildError::io(out_dir, e))?;
        std::fs::write(&path, json).map_err(|e| BuildError::io(&path, e))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transformed(stem: &str, hydrated: bool) -> TransformedDeclaration {
        TransformedDeclaration {
            export_name: "default".to_string(),
            kind: DeclarationKind::Component,
            module_stem: stem.to_string(),
            server_code: String::new(),
            client_code: hydrated.then(String::new),
            hydrate_export: hydrated.then(|| format!("hydrate_{}", stem)),
            hydrate_props: if hydrated { vec!["greeting".to_string()] } else { vec![] },
            has_loader: hydrated,
            stream_ids: vec![],
        }
    }

    fn discovered(rel: &str, kind: SpecialFileKind) -> DiscoveredFile {
        DiscoveredFile {
            path: PathBuf::from(rel),
            rel_path: rel.to_string(),
            kind,
        }
    }

    #[test]
    fn test_route_entry_modules() {
        let chains = RouteChains {
            layouts: vec!["layout.tsx".to_string()],
            ..Default::default()
        };
        let file = discovered("blog/page.tsx", SpecialFileKind::Page);
        let entry = RouteEntry::new(&file, "/blog", &chains, &transformed("blog_page", true), "tsx");
        assert_eq!(entry.server_module, "server/blog_page.tsx");
        assert_eq!(entry.client_module.as_deref(), Some("client/blog_page.tsx"));
        assert_eq!(entry.layout_chain, vec!["layout.tsx"]);
        assert_eq!(entry.hydrate_props, vec!["greeting"]);

        let plain = RouteEntry::new(&file, "/blog", &chains, &transformed("x", false), "tsx");
        assert!(plain.client_module.is_none());
        assert!(plain.hydrate_export.is_none());
    }

    #[test]
    fn test_manifest_json_shape() {
        let mut manifest = BuildManifest::new(BuildMode::Production, "es2022");
        manifest.add_chain_module(
            &discovered("layout.tsx", SpecialFileKind::Layout),
            &transformed("layout", true),
            "tsx",
        );
        manifest.add_chain_module(
            &discovered("middleware.ts", SpecialFileKind::Middleware),
            &transformed("middleware", false),
            "ts",
        );

        let value = serde_json::to_value(&manifest).unwrap();
        assert_eq!(value["layouts"]["layout.tsx"]["module"], "server/layout.tsx");
        assert_eq!(value["layouts"]["layout.tsx"]["hasLoader"], true);
        assert_eq!(value["middlewares"]["middleware.ts"], "server/middleware.ts");
        assert_eq!(value["mode"], "production");
        assert!(value["routes"].as_array().unwrap().is_empty());
        assert!(value["streams"].as_object().unwrap().is_empty());
    }

    #[test]
    fn test_export_collision_is_fatal() {
        let ok = vec![
            ("hydrate_a_000000".to_string(), "a/page.tsx".to_string()),
            ("hydrate_b_000000".to_string(), "b/page.tsx".to_string()),
        ];
        assert!(BuildManifest::check_export_collisions(&ok).is_ok());

        let dup = vec![
            ("hydrate_a_000000".to_string(), "a/page.tsx".to_string()),
            ("hydrate_a_000000".to_string(), "(g)/a/page.tsx".to_string()),
        ];
        let err = BuildManifest::check_export_collisions(&dup).unwrap_err();
        assert_eq!(err.code, ERR_EXPORT_COLLISION);
        assert_eq!(err.file, "(g)/a/page.tsx");
        assert!(err.context.unwrap().contains("a/page.tsx"));
    }

    #[test]
    fn test_write_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("dist");
        let path = BuildManifest::new(BuildMode::Development, "es2022")
            .write(&out)
            .unwrap();
        let text = std::fs::read_to_string(path).unwrap();
        let back: BuildManifest = serde_json::from_str(&text).unwrap();
        assert_eq!(back.mode, BuildMode::Development);
    }
}
