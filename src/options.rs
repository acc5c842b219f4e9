//! Compiler options and `duet.toml` loading.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::BuildError;

pub const CONFIG_FILE_NAME: &str = "duet.toml";
pub const DEFAULT_RUNTIME_MODULE: &str = "duet/runtime";
pub const DEFAULT_SERVER_RUNTIME_MODULE: &str = "duet/server";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BuildMode {
    #[default]
    Development,
    Production,
}

impl BuildMode {
    pub fn as_str(self) -> &'static str {
        match self {
            BuildMode::Development => "development",
            BuildMode::Production => "production",
        }
    }
}

impl FromStr for BuildMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(BuildMode::Development),
            "production" | "prod" => Ok(BuildMode::Production),
            other => Err(format!(
                "unknown build mode '{}', expected development or production",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CompileOptions {
    pub src_dir: PathBuf,
    pub out_dir: PathBuf,
    pub mode: BuildMode,
    /// Language level handed to the bundler, e.g. `es2022`. Recorded in the manifest;
    /// the built-in bundler does not downlevel.
    pub target: String,
    pub env: BTreeMap<String, String>,
    /// Only keys with this prefix reach client bundles.
    pub public_env_prefix: String,
    pub runtime_module: String,
    pub server_runtime_module: String,
    pub cache_capacity: usize,
    /// Overrides the mode default when set.
    pub minify: Option<bool>,
    pub sourcemap: Option<bool>,
    /// Watch-mode coalescing window.
    pub debounce_ms: u64,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            src_dir: PathBuf::from("src"),
            out_dir: PathBuf::from("dist"),
            mode: BuildMode::Development,
            target: "es2022".to_string(),
            env: BTreeMap::new(),
            public_env_prefix: "PUBLIC_".to_string(),
            runtime_module: DEFAULT_RUNTIME_MODULE.to_string(),
            server_runtime_module: DEFAULT_SERVER_RUNTIME_MODULE.to_string(),
            cache_capacity: 1000,
            minify: None,
            sourcemap: None,
            debounce_ms: 100,
        }
    }
}

impl CompileOptions {
    pub fn minify(&self) -> bool {
        self.minify.unwrap_or(self.mode == BuildMode::Production)
    }

    pub fn sourcemap(&self) -> bool {
        self.sourcemap.unwrap_or(self.mode == BuildMode::Development)
    }

    /// Defines visible to server bundles: every configured key plus `NODE_ENV`.
    pub fn server_env(&self) -> BTreeMap<String, String> {
        let mut env = self.env.clone();
        env.insert("NODE_ENV".to_string(), self.mode.as_str().to_string());
        env
    }

    /// Defines visible to client bundles: public-prefixed keys plus `NODE_ENV`.
    pub fn client_env(&self) -> BTreeMap<String, String> {
        let mut env: BTreeMap<String, String> = self
            .env
            .iter()
            .filter(|(key, _)| key.starts_with(&self.public_env_prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.insert("NODE_ENV".to_string(), self.mode.as_str().to_string());
        env
    }

    /// Parse options from TOML text. Relative directories resolve against `base_dir`.
    pub fn from_toml_str(content: &str, base_dir: &Path) -> Result<Self, BuildError> {
        let mut options: CompileOptions =
            toml::from_str(content).map_err(|e| BuildError::Config {
                path: base_dir.join(CONFIG_FILE_NAME),
                reason: e.to_string(),
            })?;
        if options.src_dir.is_relative() {
            options.src_dir = base_dir.join(&options.src_dir);
        }
        if options.out_dir.is_relative() {
            options.out_dir = base_dir.join(&options.out_dir);
        }
        if options.cache_capacity == 0 {
            return Err(BuildError::Config {
                path: base_dir.join(CONFIG_FILE_NAME),
                reason: "cache_capacity must be at least 1".to_string(),
            });
        }
        Ok(options)
    }

    /// Load `path`, or defaults rooted at the current directory when it does not exist.
    pub fn load(path: &Path) -> Result<Self, BuildError> {
        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Self::from_toml_str("", base_dir);
        }
        let content = std::fs::read_to_string(path).map_err(|e| BuildError::io(path, e))?;
        Self::from_toml_str(&content, base_dir)
    }
}
