//! Build orchestration.
//!
//! One pass: discover special files, update the import graph, re-run analysis
//! and transformation for every affected file in parallel, check the
//! whole-project invariants, then emit modules, stream handlers, both bundles
//! and the manifest. Nothing is written before every invariant has passed.

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use crate::analyze::analyze_source;
use crate::bundle::{BundlePlan, Bundler, EntryBundler, Platform, VirtualModule};
use crate::cache::BuildCache;
use crate::discovery::{discover_special_files, url_pattern, DiscoveredFile, SpecialFileIndex};
use crate::emit::{emit_stream_handlers, StreamHandlerModule};
use crate::error::{BuildError, CompilerError, ERR_PARSE, ERR_READ};
use crate::manifest::{BuildManifest, RouteEntry, CLIENT_DIR, SERVER_DIR};
use crate::options::CompileOptions;
use crate::stream::{detect_stream_collisions, normalize_path, StreamDeclaration};
use crate::transform::{absolutize_import, transform_declaration, TransformContext, TransformedDeclaration};

/// Everything one source file contributes to a build. Cached between passes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileArtifacts {
    pub rel_path: String,
    pub ext: String,
    pub declarations: Vec<TransformedDeclaration>,
    pub streams: Vec<StreamDeclaration>,
    /// Imports and helper statements the file's stream handlers run with.
    pub stream_preamble: String,
}

#[derive(Debug, Clone)]
pub struct BuildReport {
    pub manifest: BuildManifest,
    pub manifest_path: PathBuf,
    /// Per-file failures that did not abort the pass.
    pub diagnostics: Vec<CompilerError>,
    pub rebuilt: Vec<String>,
    pub reused: Vec<String>,
    pub duration: Duration,
}

// ═══════════════════════════════════════════════════════════════════════════════
// PER-FILE WORK
// ═══════════════════════════════════════════════════════════════════════════════

/// Analyze and transform one special file. Pure apart from reading `options`.
pub fn process_file(
    file: &DiscoveredFile,
    source: &str,
    options: &CompileOptions,
) -> Result<FileArtifacts, CompilerError> {
    let rel_path = normalize_path(&file.rel_path);
    let mut analysis = analyze_source(&file.path, &rel_path, source)?;

    let file_dir = file.path.parent().unwrap_or_else(|| Path::new(""));
    for import in &mut analysis.imports {
        import.source = absolutize_import(&import.source, file_dir);
    }

    let pattern = url_pattern(&rel_path);
    let ctx = TransformContext {
        rel_path: &rel_path,
        url_pattern: &pattern,
        source,
        imports: &analysis.imports,
        module_statements: &analysis.module_statements,
        streams: &analysis.streams,
        runtime_module: &options.runtime_module,
        server_runtime_module: &options.server_runtime_module,
    };

    let declarations = analysis
        .declarations
        .iter()
        .map(|decl| transform_declaration(decl, &ctx))
        .collect::<Result<Vec<_>, _>>()?;

    let mut stream_preamble = String::new();
    if !analysis.streams.is_empty() {
        for line in analysis.imports.iter().filter_map(|i| i.render()) {
            stream_preamble.push_str(&line);
            stream_preamble.push('\n');
        }
        for stmt in &analysis.module_statements {
            stream_preamble.push_str(stmt.span.slice(source));
            stream_preamble.push('\n');
        }
    }

    tracing::debug!(
        file = %rel_path,
        exports = declarations.len(),
        streams = analysis.streams.len(),
        "processed"
    );

    Ok(FileArtifacts {
        ext: file
            .path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("js")
            .to_string(),
        rel_path,
        declarations,
        streams: analysis.streams,
        stream_preamble,
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// COMPILER
// ═══════════════════════════════════════════════════════════════════════════════

pub struct Compiler {
    options: CompileOptions,
    cache: BuildCache,
    bundler: Box<dyn Bundler + Send>,
}

impl Compiler {
    pub fn new(options: CompileOptions) -> Self {
        let cache = BuildCache::new(options.cache_capacity);
        Self::with_cache(options, cache)
    }

    pub fn with_cache(options: CompileOptions, cache: BuildCache) -> Self {
        Compiler {
            options,
            cache,
            bundler: Box::new(EntryBundler),
        }
    }

    pub fn with_bundler(mut self, bundler: impl Bundler + Send + 'static) -> Self {
        self.bundler = Box::new(bundler);
        self
    }

    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    pub fn cache(&self) -> &BuildCache {
        &self.cache
    }

    pub fn into_cache(self) -> BuildCache {
        self.cache
    }

    pub fn build(&mut self) -> Result<BuildReport, BuildError> {
        let started = Instant::now();
        let options = &self.options;
        let mut diagnostics = Vec::new();

        let discovered = discover_special_files(&options.src_dir);
        let mut sources: Vec<(DiscoveredFile, String)> = Vec::new();
        for file in discovered {
            match std::fs::read_to_string(&file.path) {
                Ok(source) => sources.push((file, source)),
                Err(err) => {
                    tracing::warn!(file = %file.rel_path, error = %err, "unreadable source");
                    diagnostics.push(CompilerError::new(
                        ERR_READ,
                        &format!("Failed to read source: {}", err),
                        &file.rel_path,
                        1,
                        1,
                    ));
                }
            }
        }

        // Incremental bookkeeping
        let roots: Vec<(PathBuf, String)> = sources
            .iter()
            .map(|(file, source)| (file.path.clone(), source.clone()))
            .collect();
        let contents = self.cache.build_dependency_graph(&roots);
        let changed: Vec<PathBuf> = contents
            .iter()
            .filter(|(path, source)| self.cache.needs_rebuild(path, source))
            .map(|(path, _)| path.clone())
            .collect();
        let affected: BTreeSet<PathBuf> = self.cache.affected_files(&changed);
        self.cache.invalidate_outputs(&affected);

        let mut artifacts: Vec<Option<FileArtifacts>> = vec![None; sources.len()];
        let mut pending: Vec<usize> = Vec::new();
        let mut reused = Vec::new();
        for (idx, (file, source)) in sources.iter().enumerate() {
            let hash = BuildCache::compute_hash(source);
            match self.cache.get_output(&file.path, &hash) {
                Some(cached) if !affected.contains(&file.path) => {
                    artifacts[idx] = Some(cached.clone());
                    reused.push(file.rel_path.clone());
                }
                _ => pending.push(idx),
            }
        }

        let results: Vec<(usize, Result<FileArtifacts, CompilerError>)> = pending
            .par_iter()
            .map(|&idx| {
                let (file, source) = &sources[idx];
                (idx, process_file(file, source, options))
            })
            .collect();

        let mut rebuilt = Vec::new();
        for (idx, result) in results {
            let (file, source) = &sources[idx];
            match result {
                Ok(output) => {
                    self.cache.set_output(
                        &file.path,
                        BuildCache::compute_hash(source),
                        output.clone(),
                    );
                    artifacts[idx] = Some(output);
                    rebuilt.push(file.rel_path.clone());
                }
                Err(err) if err.code == ERR_PARSE => {
                    tracing::error!("{}", err);
                    diagnostics.push(err);
                }
                Err(err) => return Err(err.into()),
            }
        }
        for (path, source) in &contents {
            self.cache.update_hash(path, source);
        }

        let files: Vec<(&DiscoveredFile, FileArtifacts)> = sources
            .iter()
            .zip(artifacts)
            .filter_map(|((file, _), output)| output.map(|o| (file, o)))
            .collect();

        // Whole-project invariants, before anything is written
        let all_streams: Vec<StreamDeclaration> = files
            .iter()
            .flat_map(|(_, output)| output.streams.iter().cloned())
            .collect();
        detect_stream_collisions(&all_streams)?;

        let hydrate_exports: Vec<(String, String)> = files
            .iter()
            .flat_map(|(_, output)| {
                output.declarations.iter().filter_map(move |decl| {
                    decl.hydrate_export
                        .clone()
                        .map(|name| (name, output.rel_path.clone()))
                })
            })
            .collect();
        BuildManifest::check_export_collisions(&hydrate_exports)?;

        let preambles: HashMap<String, String> = files
            .iter()
            .filter(|(_, output)| !output.streams.is_empty())
            .map(|(_, output)| (output.rel_path.clone(), output.stream_preamble.clone()))
            .collect();
        let handlers = emit_stream_handlers(&all_streams, &preambles)?;

        let manifest = self.assemble_manifest(&files, &handlers);
        self.emit(&files, &handlers)?;
        let manifest_path = manifest.write(&self.options.out_dir)?;

        let report = BuildReport {
            manifest,
            manifest_path,
            diagnostics,
            rebuilt,
            reused,
            duration: started.elapsed(),
        };
        tracing::info!(
            routes = report.manifest.routes.len(),
            streams = report.manifest.streams.len(),
            rebuilt = report.rebuilt.len(),
            reused = report.reused.len(),
            diagnostics = report.diagnostics.len(),
            elapsed_ms = report.duration.as_millis() as u64,
            "build complete"
        );
        Ok(report)
    }

    fn assemble_manifest(
        &self,
        files: &[(&DiscoveredFile, FileArtifacts)],
        handlers: &[StreamHandlerModule],
    ) -> BuildManifest {
        let mut manifest = BuildManifest::new(self.options.mode, &self.options.target);
        let discovered: Vec<DiscoveredFile> = files.iter().map(|(f, _)| (*f).clone()).collect();
        let index = SpecialFileIndex::new(&discovered);

        for (file, output) in files {
            if file.kind.is_routable() {
                let chains = index.resolve_chains(file);
                let pattern = url_pattern(&output.rel_path);
                for decl in &output.declarations {
                    manifest
                        .routes
                        .push(RouteEntry::new(file, &pattern, &chains, decl, &output.ext));
                }
            } else {
                let primary = output
                    .declarations
                    .iter()
                    .find(|d| d.export_name == "default")
                    .or_else(|| output.declarations.first());
                match primary {
                    Some(decl) => manifest.add_chain_module(file, decl, &output.ext),
                    None => tracing::warn!(file = %output.rel_path, "special file exports no function"),
                }
            }
        }

        for handler in handlers {
            for (id, endpoint) in &handler.endpoints {
                manifest.streams.insert(id.clone(), endpoint.clone());
            }
        }
        manifest
    }

    fn emit(
        &self,
        files: &[(&DiscoveredFile, FileArtifacts)],
        handlers: &[StreamHandlerModule],
    ) -> Result<(), BuildError> {
        let out_dir = &self.options.out_dir;
        for side in [SERVER_DIR, CLIENT_DIR] {
            let dir = out_dir.join(side);
            if dir.exists() {
                std::fs::remove_dir_all(&dir).map_err(|e| BuildError::io(&dir, e))?;
            }
        }

        let mut server_modules = Vec::new();
        let mut client_modules = Vec::new();
        for (_, output) in files {
            for decl in &output.declarations {
                let file_name = format!("{}.{}", decl.module_stem, output.ext);
                server_modules.push(VirtualModule {
                    path: file_name.clone(),
                    code: decl.server_code.clone(),
                    entry_exports: Vec::new(),
                });
                if let (Some(code), Some(export)) = (&decl.client_code, &decl.hydrate_export) {
                    client_modules.push(VirtualModule {
                        path: file_name,
                        code: code.clone(),
                        entry_exports: vec![export.clone()],
                    });
                }
            }
        }
        let streams_prefix = format!("{}/", SERVER_DIR);
        for handler in handlers {
            server_modules.push(VirtualModule {
                path: handler
                    .module_path
                    .strip_prefix(&streams_prefix)
                    .unwrap_or(&handler.module_path)
                    .to_string(),
                code: handler.code.clone(),
                entry_exports: Vec::new(),
            });
        }

        let options = &self.options;
        let plans = [
            BundlePlan {
                platform: Platform::Node,
                out_dir: out_dir.join(SERVER_DIR),
                modules: server_modules,
                minify: options.minify(),
                sourcemap: options.sourcemap(),
                target: options.target.clone(),
                define: options.server_env(),
            },
            BundlePlan {
                platform: Platform::Browser,
                out_dir: out_dir.join(CLIENT_DIR),
                modules: client_modules,
                minify: options.minify(),
                sourcemap: options.sourcemap(),
                target: options.target.clone(),
                define: options.client_env(),
            },
        ];
        for plan in &plans {
            let output = self.bundler.bundle(plan)?;
            tracing::debug!(entry = %output.entry.display(), files = output.files.len(), "bundled");
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // WATCH MODE
    // ═══════════════════════════════════════════════════════════════════════════

    /// Rebuild on every relevant change until `on_build` breaks.
    ///
    /// Builds run one at a time on this thread; events that arrive during a
    /// build or within the debounce window fold into a single rebuild.
    pub fn watch<F>(&mut self, mut on_build: F) -> Result<(), BuildError>
    where
        F: FnMut(&Result<BuildReport, BuildError>) -> ControlFlow<()>,
    {
        let (tx, rx) = mpsc::channel();
        let mut watcher = build_watcher(tx)?;
        watcher.watch(&self.options.src_dir, RecursiveMode::Recursive)?;
        tracing::info!(src = %self.options.src_dir.display(), "watching for changes");

        let window = Duration::from_millis(self.options.debounce_ms);
        loop {
            let result = self.build();
            if let Err(err) = &result {
                tracing::error!("build failed: {}", err);
            }
            if on_build(&result).is_break() {
                return Ok(());
            }

            // Block for the next relevant change
            loop {
                match rx.recv() {
                    Ok(Ok(event)) if is_relevant(&event, &self.options.out_dir) => break,
                    Ok(Ok(_)) => continue,
                    Ok(Err(err)) => tracing::warn!("watch error: {}", err),
                    Err(_) => return Ok(()),
                }
            }
            let folded = coalesce_events(&rx, window);
            tracing::debug!(folded, "change detected, rebuilding");
        }
    }
}

fn build_watcher(
    tx: mpsc::Sender<Result<Event, notify::Error>>,
) -> Result<RecommendedWatcher, BuildError> {
    let mut watcher = notify::recommended_watcher(move |res| {
        let _ = tx.send(res);
    })?;
    watcher.configure(Config::default().with_poll_interval(Duration::from_millis(200)))?;
    Ok(watcher)
}

/// Content changes outside the output directory.
pub fn is_relevant(event: &Event, out_dir: &Path) -> bool {
    matches!(
        event.kind,
        EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
    ) && event.paths.iter().any(|p| !p.starts_with(out_dir))
}

/// Drain events until the channel stays quiet for `window`. Returns how many were folded.
pub fn coalesce_events<T>(rx: &Receiver<T>, window: Duration) -> usize {
    let mut folded = 0;
    loop {
        match rx.recv_timeout(window) {
            Ok(_) => folded += 1,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => return folded,
        }
    }
}
