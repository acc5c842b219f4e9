//! # Duet Compiler
//!
//! Splits unified component files into server and client modules.
//!
//! A component file exports functions whose body runs on the server and whose
//! returned inner function runs in the browser. For every such export the
//! compiler emits:
//!
//! 1. a server module with a `loader` that computes the values the inner
//!    function needs, and a `render` that replays the component with them;
//! 2. a client module that receives exactly those values as props, plus a
//!    uniquely named `hydrate_*` entry.
//!
//! `new Stream(...)` expressions additionally become server endpoints under
//! `/__duet/streams/<id>`, fed only with the request parameters their
//! callbacks reference.
//!
//! ## Pipeline
//!
//! ```text
//! discovery → analyze (parse, scope, stream) → transform → emit → bundle → manifest
//! ```
//!
//! [`pipeline::Compiler`] drives a whole build; [`cache::BuildCache`] keeps
//! per-file artifacts between builds so watch mode only redoes affected files.

#[cfg(feature = "napi")]
use napi_derive::napi;

pub mod analyze;
pub mod bundle;
pub mod cache;
pub mod discovery;
pub mod emit;
pub mod error;
pub mod manifest;
pub mod options;
pub mod parse;
pub mod pipeline;
pub mod scope;
pub mod stream;
pub mod transform;

#[cfg(test)]
mod pipeline_tests;

pub use analyze::{analyze_source, DeclarationKind, ExportDeclaration, FileAnalysis, ParamPattern};
pub use bundle::{BundlePlan, Bundler, EntryBundler, Platform};
pub use cache::BuildCache;
pub use error::{BuildError, CompilerError};
pub use manifest::{BuildManifest, RouteEntry};
pub use options::{BuildMode, CompileOptions};
pub use pipeline::{BuildReport, Compiler, FileArtifacts};
pub use stream::StreamDeclaration;
pub use transform::TransformedDeclaration;

/// Build `src_dir` into `out_dir` and return the manifest as JSON.
///
/// Repeated calls share the process-wide cache, so only changed files are
/// reprocessed.
#[cfg(feature = "napi")]
#[napi]
pub fn compile_project_native(
    src_dir: String,
    out_dir: String,
    mode: Option<String>,
) -> napi::Result<serde_json::Value> {
    let mode = match mode {
        Some(raw) => raw.parse::<BuildMode>().map_err(napi::Error::from_reason)?,
        None => BuildMode::default(),
    };
    let options = CompileOptions {
        src_dir: src_dir.into(),
        out_dir: out_dir.into(),
        mode,
        ..CompileOptions::default()
    };

    let shared = cache::default_cache();
    let mut guard = shared
        .lock()
        .map_err(|_| napi::Error::from_reason("build cache poisoned".to_string()))?;
    let cache = std::mem::take(&mut *guard);

    let mut compiler = Compiler::with_cache(options, cache);
    let result = compiler.build();
    *guard = compiler.into_cache();

    let report = result.map_err(|e| napi::Error::from_reason(e.to_string()))?;
    serde_json::to_value(&report.manifest).map_err(|e| napi::Error::from_reason(e.to_string()))
}
