//! Bundler invocation.
//!
//! The pipeline describes each side of the build as a [`BundlePlan`] and hands
//! it to a [`Bundler`] twice, once for the server and once for the client.
//! [`EntryBundler`] is the built-in implementation: it writes every module,
//! inlines environment defines, minifies through oxc when asked, and emits a
//! single entry module per side.

use oxc_allocator::Allocator;
use oxc_codegen::{Codegen, CodegenOptions};
use oxc_parser::Parser;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::BuildError;
use crate::parse::source_type_for;

lazy_static::lazy_static! {
    static ref ENV_ACCESS_RE: regex::Regex = regex::Regex::new(
        r"\b(?:process\.env|import\.meta\.env)\.([A-Za-z_$][A-Za-z0-9_$]*)"
    ).unwrap();
}

pub const ENTRY_NAME: &str = "entry";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Node,
    Browser,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualModule {
    /// File name relative to the plan's output directory.
    pub path: String,
    pub code: String,
    /// Names re-exported by the entry. Empty means a namespace re-export.
    pub entry_exports: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct BundlePlan {
    pub platform: Platform,
    pub out_dir: PathBuf,
    pub modules: Vec<VirtualModule>,
    pub minify: bool,
    pub sourcemap: bool,
    /// Language level for bundlers that downlevel. [`EntryBundler`] emits syntax as
    /// written and only logs it.
    pub target: String,
    pub define: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BundleOutput {
    pub entry: PathBuf,
    pub files: Vec<PathBuf>,
}

pub trait Bundler {
    fn bundle(&self, plan: &BundlePlan) -> Result<BundleOutput, BuildError>;
}

/// Replace `process.env.KEY` / `import.meta.env.KEY` with literal values.
/// Browser code sees unknown keys as `undefined`; node code keeps them live.
pub fn apply_defines(code: &str, define: &BTreeMap<String, String>, platform: Platform) -> String {
    ENV_ACCESS_RE
        .replace_all(code, |caps: &regex::Captures| {
            let key = &caps[1];
            match define.get(key) {
                Some(value) => serde_json::to_string(value).unwrap_or_default(),
                None if platform == Platform::Browser => "undefined".to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

pub struct MinifiedModule {
    pub code: String,
    pub map: Option<String>,
}

/// Re-print a module compactly. `None` when the module does not parse.
pub fn minify_module(code: &str, path: &Path, sourcemap: bool) -> Option<MinifiedModule> {
    let allocator = Allocator::default();
    let ret = Parser::new(&allocator, code, source_type_for(path)).parse();
    if !ret.errors.is_empty() || ret.panicked {
        return None;
    }
    let options = CodegenOptions {
        minify: true,
        source_map_path: sourcemap.then(|| path.to_path_buf()),
        ..CodegenOptions::default()
    };
    let printed = Codegen::new().with_options(options).build(&ret.program);
    Some(MinifiedModule {
        code: printed.code,
        map: printed.map.map(|map| map.to_json_string()),
    })
}

fn entry_alias(path: &str) -> String {
    let stem = path.split('.').next().unwrap_or(path);
    let mut alias = String::from("m_");
    for c in stem.chars() {
        alias.push(if c.is_ascii_alphanumeric() { c } else { '_' });
    }
    alias
}

pub fn entry_source(modules: &[VirtualModule]) -> String {
    let mut out = String::new();
    for module in modules {
        let spec = serde_json::to_string(&format!("./{}", module.path)).unwrap_or_default();
        if module.entry_exports.is_empty() {
            out.push_str(&format!("export * as {} from {};\n", entry_alias(&module.path), spec));
        } else {
            out.push_str(&format!(
                "export {{ {} }} from {};\n",
                module.entry_exports.join(", "),
                spec
            ));
        }
    }
    out
}

fn write_file(path: &Path, contents: &str) -> Result<(), BuildError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| BuildError::io(parent, e))?;
    }
    std::fs::write(path, contents).map_err(|e| BuildError::io(path, e))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EntryBundler;

impl Bundler for EntryBundler {
    fn bundle(&self, plan: &BundlePlan) -> Result<BundleOutput, BuildError> {
        let mut output = BundleOutput::default();

        for module in &plan.modules {
            let path = plan.out_dir.join(&module.path);
            let code = apply_defines(&module.code, &plan.define, plan.platform);
            let minified = if plan.minify {
                let result = minify_module(&code, &path, plan.sourcemap);
                if result.is_none() {
                    tracing::warn!(module = %module.path, "module failed to re-parse; written unminified");
                }
                result
            } else {
                None
            };

            match minified {
                Some(MinifiedModule { code, map }) => {
                    write_file(&path, &code)?;
                    if let Some(map) = map {
                        let map_path = PathBuf::from(format!("{}.map", path.display()));
                        write_file(&map_path, &map)?;
                        output.files.push(map_path);
                    }
                }
                None => write_file(&path, &code)?,
            }
            output.files.push(path);
        }

        let uses_typescript = plan
            .modules
            .iter()
            .any(|m| m.path.ends_with(".ts") || m.path.ends_with(".tsx"));
        let entry = plan
            .out_dir
            .join(format!("{}.{}", ENTRY_NAME, if uses_typescript { "ts" } else { "js" }));
        write_file(&entry, &entry_source(&plan.modules))?;

        tracing::debug!(
            platform = ?plan.platform,
            target = %plan.target,
            modules = plan.modules.len(),
            "bundle written"
        );
        output.entry = entry;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn define() -> BTreeMap<String, String> {
        let mut define = BTreeMap::new();
        define.insert("PUBLIC_API".to_string(), "https://api".to_string());
        define
    }

    #[test]
    fn test_apply_defines_per_platform() {
        let code = "const a = process.env.PUBLIC_API; const b = import.meta.env.SECRET;";
        assert_eq!(
            apply_defines(code, &define(), Platform::Browser),
            "const a = \"https://api\"; const b = undefined;"
        );
        assert_eq!(
            apply_defines(code, &define(), Platform::Node),
            "const a = \"https://api\"; const b = import.meta.env.SECRET;"
        );
    }

    #[test]
    fn test_entry_source() {
        let modules = vec![
            VirtualModule {
                path: "app_page_default_abc123.tsx".to_string(),
                code: String::new(),
                entry_exports: vec!["hydrate_root_abc123".to_string()],
            },
            VirtualModule {
                path: "2024_page_default_ffffff.js".to_string(),
                code: String::new(),
                entry_exports: vec![],
            },
        ];
        assert_eq!(
            entry_source(&modules),
            "export { hydrate_root_abc123 } from \"./app_page_default_abc123.tsx\";\n\
             export * as m_2024_page_default_ffffff from \"./2024_page_default_ffffff.js\";\n"
        );
    }

    #[test]
    fn test_minify_module() {
        let minified = minify_module(
            "export function add(a, b) {\n    return a + b;\n}\n",
            Path::new("x.js"),
            false,
        )
        .unwrap();
        assert!(minified.code.len() < 40);
        assert!(minified.code.contains("return a+b"));
        assert!(minify_module("export function (", Path::new("x.js"), false).is_none());
    }

    #[test]
    fn test_entry_bundler_writes_modules_and_entry() {
        let dir = tempfile::tempdir().unwrap();
        let plan = BundlePlan {
            platform: Platform::Browser,
            out_dir: dir.path().join("client"),
            modules: vec![VirtualModule {
                path: "page.tsx".to_string(),
                code: "export const api = process.env.PUBLIC_API;".to_string(),
                entry_exports: vec!["api".to_string()],
            }],
            minify: false,
            sourcemap: false,
            target: "es2022".to_string(),
            define: define(),
        };
        let output = EntryBundler.bundle(&plan).unwrap();
        assert_eq!(output.entry, dir.path().join("client/entry.ts"));
        let written = std::fs::read_to_string(dir.path().join("client/page.tsx")).unwrap();
        assert_eq!(written, "export const api = \"https://api\";");
        assert!(std::fs::read_to_string(output.entry).unwrap().contains("export { api }"));
    }

    #[test]
    fn test_entry_bundler_keeps_syntax_for_any_target() {
        let code = "export const read = (o) => o?.value ?? 0;";
        for target in ["es2015", "es2022"] {
            let dir = tempfile::tempdir().unwrap();
            let plan = BundlePlan {
                platform: Platform::Node,
                out_dir: dir.path().to_path_buf(),
                modules: vec![VirtualModule {
                    path: "read.js".to_string(),
                    code: code.to_string(),
                    entry_exports: vec![],
                }],
                minify: false,
                sourcemap: false,
                target: target.to_string(),
                define: BTreeMap::new(),
            };
            EntryBundler.bundle(&plan).unwrap();
            let written = std::fs::read_to_string(dir.path().join("read.js")).unwrap();
            assert_eq!(written, code, "target {}", target);
        }
    }
}
