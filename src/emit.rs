//! Stream Emitter
//!
//! Turns stream declarations into standalone request-handler modules, one per
//! source file. Closure captures travel as flat request parameters and are
//! rebuilt into nested objects before the user callback runs.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::error::{CompilerError, ERR_INVALID_IDENTIFIER, ERR_STREAM_COLLISION};
use crate::scope::is_valid_identifier;
use crate::stream::{stream_file_hash, StreamDeclaration};

pub const STREAMS_DIR: &str = "server/streams";
const QUERY_PARAM: &str = "__query";

// ═══════════════════════════════════════════════════════════════════════════════
// CAPTURE KEYS
// ═══════════════════════════════════════════════════════════════════════════════

/// `["user", "id"]` becomes `user_id`. A literal `_` or `$` inside a segment is
/// escaped as `$_` / `$$`, so distinct paths never share a key.
pub fn flatten_capture_key(segments: &[String]) -> String {
    let mut key = String::new();
    for (idx, segment) in segments.iter().enumerate() {
        if idx > 0 {
            key.push('_');
        }
        for c in segment.chars() {
            match c {
                '_' => key.push_str("$_"),
                '$' => key.push_str("$$"),
                other => key.push(other),
            }
        }
    }
    key
}

pub fn decode_capture_key(key: &str) -> Vec<String> {
    let mut segments = vec![String::new()];
    let mut chars = key.chars();
    while let Some(c) = chars.next() {
        match c {
            '$' => {
                if let (Some(escaped), Some(current)) = (chars.next(), segments.last_mut()) {
                    current.push(escaped);
                }
            }
            '_' => segments.push(String::new()),
            other => {
                if let Some(current) = segments.last_mut() {
                    current.push(other);
                }
            }
        }
    }
    segments
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureNode {
    /// References a flat request-parameter key.
    Leaf(String),
    Branch(IndexMap<String, CaptureNode>),
}

/// Nested view over flat capture keys, keyed by base variable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureTree {
    pub roots: IndexMap<String, CaptureNode>,
}

impl CaptureTree {
    pub fn from_keys<'k>(keys: impl IntoIterator<Item = &'k str>) -> Self {
        let mut tree = CaptureTree::default();
        for key in keys {
            tree.insert(&decode_capture_key(key), key);
        }
        tree
    }

    fn insert(&mut self, segments: &[String], flat_key: &str) {
        let Some((first, rest)) = segments.split_first() else {
            return;
        };
        insert_node(&mut self.roots, first, rest, flat_key);
    }

    /// `const <base> = <expr>;` lines reading from `query_ident`.
    pub fn render_bindings(&self, query_ident: &str) -> Vec<String> {
        self.roots
            .iter()
            .map(|(base, node)| format!("const {} = {};", base, render_node(node, query_ident)))
            .collect()
    }

    pub fn materialize(&self, query: &Map<String, Value>) -> Map<String, Value> {
        self.roots
            .iter()
            .map(|(base, node)| (base.clone(), materialize_node(node, query)))
            .collect()
    }
}

fn insert_node(
    nodes: &mut IndexMap<String, CaptureNode>,
    segment: &str,
    rest: &[String],
    flat_key: &str,
) {
    if rest.is_empty() {
        nodes.insert(segment.to_string(), CaptureNode::Leaf(flat_key.to_string()));
        return;
    }
    let node = nodes
        .entry(segment.to_string())
        .or_insert_with(|| CaptureNode::Branch(IndexMap::new()));
    // A shorter captured path already carries the whole value
    if let CaptureNode::Branch(children) = node {
        insert_node(children, &rest[0], &rest[1..], flat_key);
    }
}

fn render_node(node: &CaptureNode, query_ident: &str) -> String {
    match node {
        CaptureNode::Leaf(key) => format!("{}.{}", query_ident, key),
        CaptureNode::Branch(children) => {
            let parts: Vec<String> = children
                .iter()
                .map(|(key, child)| {
                    let key = if is_valid_identifier(key) {
                        key.clone()
                    } else {
                        serde_json::to_string(key).unwrap_or_default()
                    };
                    format!("{}: {}", key, render_node(child, query_ident))
                })
                .collect();
            format!("{{ {} }}", parts.join(", "))
        }
    }
}

fn materialize_node(node: &CaptureNode, query: &Map<String, Value>) -> Value {
    match node {
        CaptureNode::Leaf(key) => query.get(key).cloned().unwrap_or(Value::Null),
        CaptureNode::Branch(children) => Value::Object(
            children
                .iter()
                .map(|(key, child)| (key.clone(), materialize_node(child, query)))
                .collect(),
        ),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HANDLER MODULES
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StreamEndpoint {
    pub path: String,
    /// Handler module, relative to the output directory.
    pub module: String,
    /// Flat request-parameter keys the handler reads.
    pub params: Vec<String>,
    pub sendable: bool,
    pub once: bool,
    pub source_file: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamHandlerModule {
    pub file_hash: String,
    /// Path relative to the output directory.
    pub module_path: String,
    pub code: String,
    pub endpoints: Vec<(String, StreamEndpoint)>,
}

fn extension_of(file: &str) -> &str {
    match file.rsplit_once('.') {
        Some((_, ext)) if !ext.contains('/') && !ext.is_empty() => ext,
        _ => "js",
    }
}

fn invalid(stream: &StreamDeclaration, what: &str) -> CompilerError {
    CompilerError::at(
        ERR_INVALID_IDENTIFIER,
        &format!(
            "Stream \"{}\" would splice {} into generated code.",
            stream.variable_name, what
        ),
        &stream.file,
        stream.location,
    )
}

fn stream_entry(stream: &StreamDeclaration) -> Result<(String, Vec<String>), CompilerError> {
    if !is_valid_identifier(&stream.id) {
        return Err(invalid(stream, &format!("the invalid ID \"{}\"", stream.id)));
    }

    let mut body = String::new();
    let mut params = Vec::new();
    let callback = stream.callback_source.trim();

    if callback.is_empty() {
        body.push_str("    return;\n");
        return Ok((body, params));
    }

    let invocation = if stream.options.sendable {
        format!("({})({})", callback, QUERY_PARAM)
    } else {
        for capture in &stream.captured_vars {
            if !is_valid_identifier(&capture.base) {
                return Err(invalid(stream, &format!("the capture base \"{}\"", capture.base)));
            }
            let key = flatten_capture_key(&capture.segments());
            if !is_valid_identifier(&key) {
                return Err(invalid(stream, &format!("the capture key \"{}\"", key)));
            }
            params.push(key);
        }
        let tree = CaptureTree::from_keys(params.iter().map(String::as_str));
        for binding in tree.render_bindings(QUERY_PARAM) {
            body.push_str("    ");
            body.push_str(&binding);
            body.push('\n');
        }
        format!("({})()", callback)
    };

    body.push_str(&format!("    const __source = {};\n", invocation));
    body.push_str(
        "    if (__source && typeof __source[Symbol.asyncIterator] === \"function\") {\n      yield* __source;\n    } else {\n      yield await __source;\n    }\n",
    );
    Ok((body, params))
}

/// One handler module per source file, grouped by the ID's file-hash segment.
///
/// `preambles` maps a stream's `file` to the imports and helper statements the
/// callbacks may rely on.
pub fn emit_stream_handlers(
    streams: &[StreamDeclaration],
    preambles: &HashMap<String, String>,
) -> Result<Vec<StreamHandlerModule>, CompilerError> {
    let mut groups: IndexMap<&str, Vec<&StreamDeclaration>> = IndexMap::new();
    for stream in streams {
        let group = groups.entry(stream_file_hash(&stream.id)).or_default();
        if let Some(first) = group.first() {
            if first.file != stream.file {
                return Err(CompilerError::with_details(
                    ERR_STREAM_COLLISION,
                    &format!(
                        "Stream handler module \"{}\" would be shared by two source files.",
                        stream.file_hash()
                    ),
                    &stream.file,
                    stream.location.line,
                    stream.location.column,
                    Some(format!("also generated for {}", first.file)),
                    vec!["Rename one of the files so their path hashes differ.".to_string()],
                ));
            }
        }
        group.push(stream);
    }

    let mut modules = Vec::new();
    for (file_hash, group) in groups {
        let source_file = group[0].file.as_str();
        let module_path = format!("{}/{}.{}", STREAMS_DIR, file_hash, extension_of(source_file));

        let mut code = String::new();
        if let Some(preamble) = preambles.get(source_file) {
            code.push_str(preamble);
            if !preamble.ends_with('\n') {
                code.push('\n');
            }
            code.push('\n');
        }
        code.push_str("export const streams = {\n");

        let mut endpoints = Vec::new();
        for stream in group {
            let (body, params) = stream_entry(stream)?;
            code.push_str(&format!(
                "  {}: async function* ({}) {{\n{}  }},\n",
                stream.id, QUERY_PARAM, body
            ));
            endpoints.push((
                stream.id.clone(),
                StreamEndpoint {
                    path: stream.endpoint_path(),
                    module: module_path.clone(),
                    params,
                    sendable: stream.options.sendable,
                    once: stream.options.once,
                    source_file: stream.file.clone(),
                },
            ));
        }
        code.push_str("};\n");

        modules.push(StreamHandlerModule {
            file_hash: file_hash.to_string(),
            module_path,
            code,
            endpoints,
        });
    }
    Ok(modules)
}
