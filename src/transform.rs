//! Transformer: synthesizes server and client module text per export.
//!
//! All edits are positional over the original file text. Spans come from the
//! analyzer, including every `new Stream(` site; text is only scanned forward
//! from those sites to find the argument list, and for the body delimiter check.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::Path;

use crate::analyze::{
    select_module_statements, DeclarationKind, ExportDeclaration, ImportStatement,
    ModuleStatement,
};
use crate::cache::normalize_lexically;
use crate::emit::flatten_capture_key;
use crate::error::{CompilerError, ERR_INVALID_IDENTIFIER};
use crate::scope::is_valid_identifier;
use crate::stream::StreamDeclaration;

pub const STREAMS_PROP: &str = "__streams";
const DEFAULT_COMPONENT_NAME: &str = "Component";

lazy_static::lazy_static! {
    static ref STREAM_CALL_RE: regex::Regex = regex::Regex::new(r"\bnew\s+Stream\s*\(").unwrap();
}

pub struct TransformContext<'c> {
    /// Normalized, source-root-relative path of the file.
    pub rel_path: &'c str,
    pub url_pattern: &'c str,
    pub source: &'c str,
    /// File imports, relative specifiers already made absolute.
    pub imports: &'c [ImportStatement],
    pub module_statements: &'c [ModuleStatement],
    /// Every stream in the file.
    pub streams: &'c [StreamDeclaration],
    pub runtime_module: &'c str,
    pub server_runtime_module: &'c str,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransformedDeclaration {
    pub export_name: String,
    pub kind: DeclarationKind,
    pub module_stem: String,
    pub server_code: String,
    pub client_code: Option<String>,
    pub hydrate_export: Option<String>,
    pub hydrate_props: Vec<String>,
    pub has_loader: bool,
    pub stream_ids: Vec<String>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// NAMING
// ═══════════════════════════════════════════════════════════════════════════════

fn sanitize_name(raw: &str) -> String {
    let mut out = String::new();
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_matches('_').to_string()
}

fn short_hash(input: &str, len: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..len].to_string()
}

/// `hydrate_<sanitized pattern>_<6 hex>`; the hash covers pattern and export name.
pub fn hydrate_export_name(url_pattern: &str, export_name: &str) -> String {
    let mut pattern = sanitize_name(url_pattern);
    if pattern.is_empty() {
        pattern = "root".to_string();
    }
    format!(
        "hydrate_{}_{}",
        pattern,
        short_hash(&format!("{}#{}", url_pattern, export_name), 6)
    )
}

/// File stem shared by an export's server and client modules.
pub fn module_stem(rel_path: &str, export_name: &str) -> String {
    let without_ext = match rel_path.rfind('.') {
        Some(dot) if !rel_path[dot..].contains('/') => &rel_path[..dot],
        _ => rel_path,
    };
    format!(
        "{}_{}_{}",
        sanitize_name(without_ext),
        sanitize_name(export_name),
        short_hash(&format!("{}#{}", rel_path, export_name), 6)
    )
}

fn component_name(decl: &ExportDeclaration) -> &str {
    if decl.name == "default" {
        DEFAULT_COMPONENT_NAME
    } else {
        &decl.name
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TEXT SURGERY
// ═══════════════════════════════════════════════════════════════════════════════

/// Drop the body's opening brace when it is unambiguously the delimiter,
/// i.e. immediately followed by whitespace.
pub fn strip_body_brace(text: &str) -> &str {
    match text.strip_prefix('{') {
        Some(rest) if rest.is_empty() || rest.starts_with(char::is_whitespace) => rest,
        _ => text,
    }
}

enum ScanMode {
    Code,
    Template,
}

/// Index of the `)` closing the `(` at `open`. Skips strings, template
/// literals (including `${}` nesting) and comments.
pub fn find_matching_paren(code: &str, open: usize) -> Option<usize> {
    let b = code.as_bytes();
    if b.get(open) != Some(&b'(') {
        return None;
    }
    let mut mode = ScanMode::Code;
    let mut template_stack: Vec<usize> = Vec::new();
    let mut braces = 0usize;
    let mut parens = 0usize;
    let mut i = open;

    while i < b.len() {
        let c = b[i];
        let next = b.get(i + 1).copied();
        match mode {
            ScanMode::Template => match c {
                b'\\' => i += 2,
                b'`' => {
                    mode = ScanMode::Code;
                    i += 1;
                }
                b'$' if next == Some(b'{') => {
                    template_stack.push(braces);
                    braces += 1;
                    mode = ScanMode::Code;
                    i += 2;
                }
                _ => i += 1,
            },
            ScanMode::Code => match c {
                b'\'' | b'"' => {
                    i += 1;
                    while i < b.len() && b[i] != c && b[i] != b'\n' {
                        if b[i] == b'\\' {
                            i += 1;
                        }
                        i += 1;
                    }
                    i += 1;
                }
                b'`' => {
                    mode = ScanMode::Template;
                    i += 1;
                }
                b'/' if next == Some(b'/') => {
                    while i < b.len() && b[i] != b'\n' {
                        i += 1;
                    }
                }
                b'/' if next == Some(b'*') => {
                    i += 2;
                    while i + 1 < b.len() && !(b[i] == b'*' && b[i + 1] == b'/') {
                        i += 1;
                    }
                    i += 2;
                }
                b'{' => {
                    braces += 1;
                    i += 1;
                }
                b'}' => {
                    if braces > 0 && template_stack.last() == Some(&(braces - 1)) {
                        template_stack.pop();
                        mode = ScanMode::Template;
                    }
                    braces = braces.saturating_sub(1);
                    i += 1;
                }
                b'(' => {
                    parens += 1;
                    i += 1;
                }
                b')' => {
                    parens -= 1;
                    if parens == 0 {
                        return Some(i);
                    }
                    i += 1;
                }
                _ => i += 1,
            },
        }
    }
    None
}

/// Append an ID as the final argument of the `new Stream(...)` starting at each offset.
///
/// Offsets are relative to `text` and must point at the `new` keyword; anything
/// else (a stale offset, text that no longer matches) is skipped with a warning.
pub fn inject_stream_ids(text: &str, sites: &[(usize, &str)]) -> String {
    let mut insertions: Vec<(usize, String)> = Vec::new();
    for &(start, id) in sites {
        let call = text
            .get(start..)
            .and_then(|_| STREAM_CALL_RE.find_at(text, start))
            .filter(|m| m.start() == start);
        let Some(call) = call else {
            tracing::warn!(id = %id, offset = start, "no stream construction at recorded offset");
            continue;
        };
        let open = call.end() - 1;
        let Some(close) = find_matching_paren(text, open) else {
            tracing::warn!(id = %id, "unbalanced stream construction; ID not injected");
            continue;
        };
        let before = text[open + 1..close].trim_end();
        let literal = serde_json::to_string(id).unwrap_or_default();
        let insertion = if before.is_empty() {
            literal
        } else if before.ends_with(',') {
            format!(" {}", literal)
        } else {
            format!(", {}", literal)
        };
        insertions.push((open + 1 + before.len(), insertion));
    }

    // Apply back to front so earlier offsets stay valid
    insertions.sort_by(|a, b| b.0.cmp(&a.0));
    let mut result = text.to_string();
    for (pos, insertion) in insertions {
        result.insert_str(pos, &insertion);
    }
    result
}

/// Rewrite relative specifiers against the importing file's directory.
pub fn absolutize_import(specifier: &str, file_dir: &Path) -> String {
    if specifier.starts_with("./") || specifier.starts_with("../") {
        normalize_lexically(&file_dir.join(specifier))
            .to_string_lossy()
            .replace('\\', "/")
    } else {
        specifier.to_string()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DECLARATION TRANSFORM
// ═══════════════════════════════════════════════════════════════════════════════

pub fn transform_declaration(
    decl: &ExportDeclaration,
    ctx: &TransformContext,
) -> Result<TransformedDeclaration, CompilerError> {
    let mut scoped: Vec<&StreamDeclaration> = ctx
        .streams
        .iter()
        .filter(|s| decl.server_span.contains(&s.position))
        .collect();
    scoped.sort_by_key(|s| s.position.start);
    let stream_ids: Vec<String> = scoped.iter().map(|s| s.id.clone()).collect();

    for id in &stream_ids {
        if !is_valid_identifier(id) {
            return Err(invalid_identifier(ctx, decl, &format!("stream ID \"{}\"", id)));
        }
    }

    let sites: Vec<(usize, &str)> = scoped
        .iter()
        .map(|s| ((s.position.start - decl.server_span.start) as usize, s.id.as_str()))
        .collect();
    let server_text = inject_stream_ids(decl.server_span.slice(ctx.source), &sites);
    let stem = module_stem(ctx.rel_path, &decl.name);

    if !decl.is_hydrated() {
        return Ok(TransformedDeclaration {
            export_name: decl.name.clone(),
            kind: decl.kind,
            module_stem: stem,
            server_code: server_only_module(decl, ctx, &server_text),
            client_code: None,
            hydrate_export: None,
            hydrate_props: Vec::new(),
            has_loader: false,
            stream_ids,
        });
    }

    let hydrate_export = hydrate_export_name(ctx.url_pattern, &decl.name);
    let props = ComponentProps::new(decl, &scoped);
    let server_code = hydrated_server_module(decl, ctx, &server_text, &scoped, &props)?;
    let client_code = client_module(decl, ctx, &props, &hydrate_export);

    Ok(TransformedDeclaration {
        export_name: decl.name.clone(),
        kind: decl.kind,
        module_stem: stem,
        server_code,
        client_code: Some(client_code),
        hydrate_export: Some(hydrate_export),
        hydrate_props: props.values.clone(),
        has_loader: true,
        stream_ids,
    })
}

fn invalid_identifier(ctx: &TransformContext, decl: &ExportDeclaration, what: &str) -> CompilerError {
    let location = crate::error::SourceLocation::from_offset(
        ctx.source,
        decl.function_span.start as usize,
    );
    CompilerError::at(
        ERR_INVALID_IDENTIFIER,
        &format!("Refusing to emit {} as a binding in generated code.", what),
        ctx.rel_path,
        location,
    )
}

fn push_imports(out: &mut String, imports: &[ImportStatement], keep: impl Fn(&str) -> bool) {
    for import in imports {
        if let Some(line) = import.render_filtered(&keep) {
            out.push_str(&line);
            out.push('\n');
        }
    }
}

fn push_module_statements<'m>(
    out: &mut String,
    source: &str,
    statements: impl IntoIterator<Item = &'m ModuleStatement>,
) {
    for stmt in statements {
        out.push_str(stmt.span.slice(source));
        out.push('\n');
    }
}

fn function_head(decl: &ExportDeclaration) -> String {
    let async_kw = if decl.is_async { "async " } else { "" };
    let params = decl.param_pattern.render();
    if decl.name == "default" {
        format!("export default {}function ({})", async_kw, params)
    } else {
        format!("export {}function {}({})", async_kw, decl.name, params)
    }
}

fn server_only_module(decl: &ExportDeclaration, ctx: &TransformContext, body: &str) -> String {
    let mut out = String::new();
    push_imports(&mut out, ctx.imports, |_| true);
    push_module_statements(&mut out, ctx.source, ctx.module_statements);
    out.push('\n');
    out.push_str(&function_head(decl));
    if decl.server_is_expression {
        out.push_str(&format!(" {{\n  return ({});\n}}\n", body.trim()));
    } else {
        out.push(' ');
        out.push_str(body);
        out.push('\n');
    }
    out
}

fn client_body(decl: &ExportDeclaration, source: &str) -> String {
    let text = decl.client_span.map(|s| s.slice(source)).unwrap_or("");
    if decl.client_is_expression {
        format!("  return ({});", text.trim())
    } else {
        text.trim_matches('\n').to_string()
    }
}

/// How the component receives shared names: plain values from the loader, or
/// streams rebound from the restored `__streams` record.
struct ComponentProps {
    /// Serialized by the loader, in declaration order.
    values: Vec<String>,
    /// `(variable, stream id)`; the variable is read from `__streams`.
    streams: Vec<(String, String)>,
    has_streams: bool,
}

impl ComponentProps {
    fn new(decl: &ExportDeclaration, scoped: &[&StreamDeclaration]) -> Self {
        let mut streams: Vec<(String, String)> = Vec::new();
        for stream in scoped {
            if !decl.shared_names.contains(&stream.variable_name) {
                continue;
            }
            // A reassigned variable holds the later stream
            streams.retain(|(name, _)| *name != stream.variable_name);
            streams.push((stream.variable_name.clone(), stream.id.clone()));
        }
        let values = decl
            .shared_names
            .iter()
            .filter(|name| !streams.iter().any(|(stream_var, _)| stream_var == *name))
            .cloned()
            .collect();
        ComponentProps {
            values,
            streams,
            has_streams: !scoped.is_empty(),
        }
    }

    fn signature(&self) -> String {
        let mut props: Vec<&str> = self.values.iter().map(String::as_str).collect();
        if self.has_streams {
            props.push(STREAMS_PROP);
        }
        if props.is_empty() {
            "{}".to_string()
        } else {
            format!("{{ {} }}", props.join(", "))
        }
    }

    fn stream_bindings(&self) -> String {
        self.streams
            .iter()
            .map(|(name, id)| format!("  const {} = {}.{};\n", name, STREAMS_PROP, id))
            .collect()
    }
}

fn component_function(
    name: &str,
    decl: &ExportDeclaration,
    source: &str,
    props: &ComponentProps,
    exported: bool,
) -> String {
    format!(
        "{}function {}({}) {{\n{}{}\n}}\n",
        if exported { "export " } else { "" },
        name,
        props.signature(),
        props.stream_bindings(),
        client_body(decl, source)
    )
}

fn member_access(base: &str, properties: &[String]) -> String {
    let mut expr = base.to_string();
    for prop in properties {
        if is_valid_identifier(prop) {
            expr.push('.');
            expr.push_str(prop);
        } else {
            expr.push_str(&format!("[{}]", serde_json::to_string(prop).unwrap_or_default()));
        }
    }
    expr
}

fn capture_call(
    stream: &StreamDeclaration,
    server_scope: &HashSet<String>,
) -> Result<String, String> {
    let mut entries = Vec::new();
    if !stream.options.sendable {
        for capture in &stream.captured_vars {
            if !is_valid_identifier(&capture.base) {
                return Err(format!("capture base \"{}\"", capture.base));
            }
            if !server_scope.contains(&capture.base) {
                tracing::warn!(
                    stream = %stream.id,
                    base = %capture.base,
                    "captured variable is not bound in the server phase; skipped"
                );
                continue;
            }
            entries.push(format!(
                "{}: {}",
                flatten_capture_key(&capture.segments()),
                member_access(&capture.base, &capture.properties)
            ));
        }
    }

    let mut options = Vec::new();
    if let Some(initial) = &stream.options.initial_expr {
        options.push(format!("initial: () => ({})", initial));
    }
    if stream.options.once {
        options.push("once: true".to_string());
    }
    if stream.options.sendable {
        options.push("sendable: true".to_string());
    }

    let object = |parts: &[String]| {
        if parts.is_empty() {
            "{}".to_string()
        } else {
            format!("{{ {} }}", parts.join(", "))
        }
    };
    Ok(format!(
        "captureStream(\"{}\", {}, {})",
        stream.id,
        object(&entries),
        object(&options)
    ))
}

fn hydrated_server_module(
    decl: &ExportDeclaration,
    ctx: &TransformContext,
    server_text: &str,
    streams: &[&StreamDeclaration],
    props: &ComponentProps,
) -> Result<String, CompilerError> {
    let mut server_scope: HashSet<String> = decl.server_bindings.iter().cloned().collect();
    server_scope.extend(decl.param_pattern.bound_names());
    server_scope.extend(
        ctx.module_statements
            .iter()
            .flat_map(|s| s.declared.iter().cloned()),
    );

    let mut captures = Vec::new();
    for stream in streams {
        let call = capture_call(stream, &server_scope)
            .map_err(|what| invalid_identifier(ctx, decl, &what))?;
        captures.push((stream.id.as_str(), call));
    }

    let name = component_name(decl);
    let mut out = String::new();
    push_imports(&mut out, ctx.imports, |_| true);
    if !streams.is_empty() {
        out.push_str(&format!(
            "import {{ captureStream, restoreStreams }} from {};\n",
            serde_json::to_string(ctx.server_runtime_module).unwrap_or_default()
        ));
    }
    push_module_statements(&mut out, ctx.source, ctx.module_statements);

    out.push_str(&format!(
        "\nexport async function loader({}) {{\n",
        decl.param_pattern.render()
    ));
    let statements = strip_body_brace(server_text).trim_matches('\n').trim_end();
    if !statements.trim().is_empty() {
        out.push_str(statements);
        out.push('\n');
    }
    out.push_str("  return {\n");
    for shared in &props.values {
        out.push_str(&format!("    {},\n", shared));
    }
    if !captures.is_empty() {
        out.push_str(&format!("    {}: {{\n", STREAMS_PROP));
        for (id, call) in &captures {
            out.push_str(&format!("      {}: {},\n", id, call));
        }
        out.push_str("    },\n");
    }
    out.push_str("  };\n}\n\n");

    out.push_str("export function render(data) {\n");
    if streams.is_empty() {
        out.push_str(&format!("  return {}(data);\n", name));
    } else {
        out.push_str(&format!(
            "  return {}({{ ...data, {}: restoreStreams(data.{}) }});\n",
            name, STREAMS_PROP, STREAMS_PROP
        ));
    }
    out.push_str("}\n\n");

    out.push_str(&component_function(name, decl, ctx.source, props, false));
    Ok(out)
}

fn client_module(
    decl: &ExportDeclaration,
    ctx: &TransformContext,
    props: &ComponentProps,
    hydrate_export: &str,
) -> String {
    let (statements, needed) = select_module_statements(
        ctx.module_statements,
        decl.client_references.iter().cloned(),
    );
    let name = component_name(decl);
    let runtime = serde_json::to_string(ctx.runtime_module).unwrap_or_default();

    let mut out = String::new();
    push_imports(&mut out, ctx.imports, |local| needed.contains(local));
    if props.has_streams {
        out.push_str(&format!("import {{ hydrate, restoreStreams }} from {};\n", runtime));
    } else {
        out.push_str(&format!("import {{ hydrate }} from {};\n", runtime));
    }
    push_module_statements(&mut out, ctx.source, statements);

    out.push('\n');
    out.push_str(&component_function(name, decl, ctx.source, props, true));
    out.push('\n');
    if props.has_streams {
        out.push_str(&format!(
            "export function {}(root, data) {{\n  return hydrate({}, root, {{ ...data, {}: restoreStreams(data.{}) }});\n}}\n",
            hydrate_export, name, STREAMS_PROP, STREAMS_PROP
        ));
    } else {
        out.push_str(&format!(
            "export function {}(root, data) {{\n  return hydrate({}, root, data);\n}}\n",
            hydrate_export, name
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_body_brace_only_for_delimiter() {
        assert_eq!(strip_body_brace("{\n  const a = 1;"), "\n  const a = 1;");
        assert_eq!(strip_body_brace("{ a }"), " a }");
        assert_eq!(strip_body_brace("{a: 1}"), "{a: 1}");
        assert_eq!(strip_body_brace("const a = 1;"), "const a = 1;");
    }

    #[test]
    fn test_find_matching_paren_skips_literals() {
        let code = "new Stream(() => f(\")\", `a${g(\")\")}b`, /* ) */ 'x'), { once: true })";
        let open = code.find('(').unwrap();
        assert_eq!(find_matching_paren(code, open), Some(code.len() - 1));
        assert_eq!(find_matching_paren("f(a", 1), None);
    }

    #[test]
    fn test_inject_stream_ids() {
        let text = "const a = new Stream(() => g(1));\nconst b = new   Stream (\n  cb,\n  { once: true },\n);\nconst c = new Stream();";
        let sites: Vec<(usize, &str)> = text
            .match_indices("new")
            .map(|(pos, _)| pos)
            .zip(["s_1", "s_2", "s_3"])
            .collect();
        let out = inject_stream_ids(text, &sites);
        assert!(out.contains("new Stream(() => g(1), \"s_1\")"));
        assert!(out.contains("{ once: true }, \"s_2\"\n)"));
        assert!(out.contains("new Stream(\"s_3\")"));
    }

    #[test]
    fn test_inject_targets_recorded_sites_only() {
        let text = "// wraps new Stream(cb) below\nconst label = \"new Stream(x)\";\nconst feed = new Stream(() => 1);";
        let site = text.rfind("new Stream").unwrap();
        let out = inject_stream_ids(text, &[(site, "s_x")]);
        assert!(out.starts_with("// wraps new Stream(cb) below\nconst label = \"new Stream(x)\";"));
        assert!(out.ends_with("const feed = new Stream(() => 1, \"s_x\");"));

        // A stale offset is skipped, not applied to a neighbouring call
        assert_eq!(inject_stream_ids(text, &[(3, "s_y")]), text);
    }

    #[test]
    fn test_hydrate_export_name_is_stable_and_distinct() {
        let a = hydrate_export_name("/blog/:slug", "default");
        assert_eq!(a, hydrate_export_name("/blog/:slug", "default"));
        assert!(a.starts_with("hydrate_blog_slug_"));
        assert_eq!(a.len(), "hydrate_blog_slug_".len() + 6);
        assert_ne!(a, hydrate_export_name("/blog/:slug", "Sidebar"));
        assert!(hydrate_export_name("/", "default").starts_with("hydrate_root_"));
        assert!(is_valid_identifier(&a));
    }

    #[test]
    fn test_module_stem() {
        let stem = module_stem("app/blog/[slug]/page.tsx", "default");
        assert!(stem.starts_with("app_blog_slug_page_default_"));
        assert_ne!(stem, module_stem("app/blog-slug/page.tsx", "default"));
    }

    #[test]
    fn test_absolutize_import() {
        let dir = Path::new("/src/app/blog");
        assert_eq!(absolutize_import("./db", dir), "/src/app/blog/db");
        assert_eq!(absolutize_import("../../lib/x.ts", dir), "/src/lib/x.ts");
        assert_eq!(absolutize_import("react", dir), "react");
    }
}
