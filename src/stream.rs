//! Stream Analyzer
//!
//! Finds every `new Stream(callback, options?)` in a module, names it from its
//! assignment context, resolves the closure variables its callback reads and
//! assigns it an ID that depends only on the file path and occurrence index.

use oxc_ast::ast::{
    ArrowFunctionExpression, AssignmentExpression, AssignmentTarget, BindingPattern,
    BlockStatement, CatchClause, Expression, ForInStatement, ForOfStatement, ForStatement,
    ForStatementInit, ForStatementLeft, FormalParameters, Function, IdentifierReference,
    NewExpression, ObjectProperty, ObjectPropertyKind, Program, PropertyKey, VariableDeclaration,
    VariableDeclarator,
};
use oxc_ast_visit::{walk, Visit};
use oxc_span::GetSpan;
use oxc_syntax::scope::ScopeFlags;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};

use crate::error::{CompilerError, SourceLocation, ERR_STREAM_COLLISION};
use crate::parse::{CodeSpan, SpanOffset};
use crate::scope::{
    collect_pattern_bindings, is_valid_identifier, scope_bindings, BindingCollector,
    RUNTIME_GLOBALS,
};

pub const STREAM_CONSTRUCTOR: &str = "Stream";
pub const STREAM_ENDPOINT_PREFIX: &str = "/__duet/streams/";

const FILE_HASH_LEN: usize = 8;
const FRAGMENT_MAX_LEN: usize = 24;

// ═══════════════════════════════════════════════════════════════════════════════
// TYPES
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CapturedVariable {
    /// Dotted access path, e.g. `params.user.id`.
    pub full_path: String,
    pub base: String,
    pub properties: Vec<String>,
}

impl CapturedVariable {
    pub fn from_segments(segments: &[String]) -> Option<Self> {
        let (base, properties) = segments.split_first()?;
        Some(CapturedVariable {
            full_path: segments.join("."),
            base: base.clone(),
            properties: properties.to_vec(),
        })
    }

    pub fn segments(&self) -> Vec<String> {
        std::iter::once(self.base.clone())
            .chain(self.properties.iter().cloned())
            .collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StreamOptions {
    /// Raw source of the `initial` option; never evaluated by the compiler.
    pub initial_expr: Option<String>,
    pub once: bool,
    pub sendable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StreamDeclaration {
    pub id: String,
    pub variable_name: String,
    /// Span of the whole `new Stream(...)` expression.
    pub position: CodeSpan,
    pub location: SourceLocation,
    /// Normalized, source-root-relative path of the declaring file.
    pub file: String,
    pub callback_source: String,
    pub captured_vars: Vec<CapturedVariable>,
    pub options: StreamOptions,
}

impl StreamDeclaration {
    pub fn endpoint_path(&self) -> String {
        format!("{}{}", STREAM_ENDPOINT_PREFIX, self.id)
    }

    pub fn file_hash(&self) -> &str {
        stream_file_hash(&self.id)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ID GENERATION
// ═══════════════════════════════════════════════════════════════════════════════

/// Forward slashes, no leading `./` or `/`.
pub fn normalize_path(path: &str) -> String {
    let unified = path.replace('\\', "/");
    let mut trimmed = unified.as_str();
    loop {
        if let Some(rest) = trimmed.strip_prefix("./") {
            trimmed = rest;
        } else if let Some(rest) = trimmed.strip_prefix('/') {
            trimmed = rest;
        } else {
            break;
        }
    }
    trimmed.to_string()
}

fn sanitize_fragment(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let tail = &segments[segments.len().saturating_sub(2)..];
    let raw = tail
        .iter()
        .map(|seg| seg.split('.').next().unwrap_or(seg))
        .collect::<Vec<_>>()
        .join("_");

    let mut out = String::new();
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    let out = out.trim_matches('_');
    let out: String = out.chars().take(FRAGMENT_MAX_LEN).collect();
    let out = out.trim_end_matches('_');
    if out.is_empty() {
        "root".to_string()
    } else {
        out.to_string()
    }
}

/// `s_<8 hex>_<fragment>_<index>`. Pure function of `(path, index)`.
pub fn generate_stream_id(path: &str, index: usize) -> String {
    let normalized = normalize_path(path);
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!(
        "s_{}_{}_{}",
        &digest[..FILE_HASH_LEN],
        sanitize_fragment(&normalized),
        index
    )
}

/// The file-hash segment embedded in a stream ID.
pub fn stream_file_hash(id: &str) -> &str {
    id.split('_').nth(1).unwrap_or(id)
}

// ═══════════════════════════════════════════════════════════════════════════════
// COLLISION DETECTION
// ═══════════════════════════════════════════════════════════════════════════════

pub fn detect_stream_collisions(streams: &[StreamDeclaration]) -> Result<(), CompilerError> {
    let mut seen: HashMap<&str, &StreamDeclaration> = HashMap::new();
    for stream in streams {
        if let Some(first) = seen.get(stream.id.as_str()) {
            return Err(CompilerError::with_details(
                ERR_STREAM_COLLISION,
                &format!("Stream ID \"{}\" is produced by two declarations.", stream.id),
                &stream.file,
                stream.location.line,
                stream.location.column,
                Some(format!(
                    "first declared at {}:{}:{}, again at {}:{}:{}",
                    first.file,
                    first.location.line,
                    first.location.column,
                    stream.file,
                    stream.location.line,
                    stream.location.column
                )),
                vec!["Stream IDs derive from the file path and occurrence index; two files normalizing to the same path will collide.".to_string()],
            ));
        }
        seen.insert(&stream.id, stream);
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// ANALYSIS
// ═══════════════════════════════════════════════════════════════════════════════

/// `module_bindings` holds the file's import locals and top-level helper names;
/// handler modules carry those themselves, so callbacks never capture them.
pub fn analyze_streams(
    program: &Program,
    source: &str,
    offset: SpanOffset,
    rel_path: &str,
    module_bindings: &HashSet<String>,
) -> Vec<StreamDeclaration> {
    let mut locator = StreamLocator {
        source,
        offset,
        file: normalize_path(rel_path),
        module_bindings,
        names: HashMap::new(),
        streams: Vec::new(),
    };
    locator.visit_program(program);
    locator.streams
}

fn is_stream_construction(expr: &Expression) -> bool {
    let mut expr = expr;
    while let Expression::ParenthesizedExpression(paren) = expr {
        expr = &paren.expression;
    }
    match expr {
        Expression::NewExpression(new_expr) => is_stream_callee(new_expr),
        _ => false,
    }
}

fn is_stream_callee(new_expr: &NewExpression) -> bool {
    matches!(&new_expr.callee, Expression::Identifier(id) if id.name == STREAM_CONSTRUCTOR)
}

fn property_key_name(key: &PropertyKey) -> Option<String> {
    match key {
        PropertyKey::StaticIdentifier(id) => Some(id.name.to_string()),
        PropertyKey::StringLiteral(lit) => Some(lit.value.to_string()),
        _ => None,
    }
}

struct StreamLocator<'s> {
    source: &'s str,
    offset: SpanOffset,
    file: String,
    module_bindings: &'s HashSet<String>,
    /// Assigned names keyed by the construction expression's start.
    names: HashMap<u32, String>,
    streams: Vec<StreamDeclaration>,
}

impl<'s> StreamLocator<'s> {
    fn name_construction(&mut self, expr: &Expression, name: String) {
        if is_stream_construction(expr) {
            let mut inner = expr;
            while let Expression::ParenthesizedExpression(paren) = inner {
                inner = &paren.expression;
            }
            self.names.insert(inner.span().start, name);
        }
    }

    fn record(&mut self, new_expr: &NewExpression) {
        let index = self.streams.len();
        let position = self.offset.span(new_expr.span);
        let variable_name = self
            .names
            .get(&new_expr.span.start)
            .cloned()
            .unwrap_or_else(|| format!("stream{}", index));

        let callback = new_expr.arguments.first().and_then(|arg| arg.as_expression());
        let callback_source = callback
            .map(|cb| self.offset.span(cb.span()).slice(self.source).to_string())
            .unwrap_or_default();
        let captured_vars = callback
            .map(|cb| collect_captures(cb, self.module_bindings))
            .unwrap_or_default();

        let options = new_expr
            .arguments
            .get(1)
            .and_then(|arg| arg.as_expression())
            .map(|opts| self.parse_options(opts))
            .unwrap_or_default();

        self.streams.push(StreamDeclaration {
            id: generate_stream_id(&self.file, index),
            variable_name,
            position,
            location: SourceLocation::from_offset(self.source, position.start as usize),
            file: self.file.clone(),
            callback_source,
            captured_vars,
            options,
        });
    }

    fn parse_options(&self, expr: &Expression) -> StreamOptions {
        let mut options = StreamOptions::default();
        let Expression::ObjectExpression(obj) = expr else {
            tracing::debug!(file = %self.file, "stream options are not an object literal; ignored");
            return options;
        };
        for prop in &obj.properties {
            let ObjectPropertyKind::ObjectProperty(prop) = prop else {
                continue;
            };
            let Some(key) = property_key_name(&prop.key) else {
                continue;
            };
            match key.as_str() {
                "initial" => {
                    let text = self.offset.span(prop.value.span()).slice(self.source).trim();
                    if !text.is_empty() {
                        options.initial_expr = Some(text.to_string());
                    }
                }
                "once" => options.once = boolean_literal(&prop.value),
                "sendable" => options.sendable = boolean_literal(&prop.value),
                _ => {}
            }
        }
        options
    }
}

fn boolean_literal(expr: &Expression) -> bool {
    matches!(expr, Expression::BooleanLiteral(lit) if lit.value)
}

impl<'a, 's> Visit<'a> for StreamLocator<'s> {
    fn visit_variable_declarator(&mut self, decl: &VariableDeclarator<'a>) {
        if let (BindingPattern::BindingIdentifier(id), Some(init)) = (&decl.id, &decl.init) {
            self.name_construction(init, id.name.to_string());
        }
        walk::walk_variable_declarator(self, decl);
    }

    fn visit_assignment_expression(&mut self, assign: &AssignmentExpression<'a>) {
        let name = match &assign.left {
            AssignmentTarget::AssignmentTargetIdentifier(id) => Some(id.name.to_string()),
            AssignmentTarget::StaticMemberExpression(member) => {
                Some(member.property.name.to_string())
            }
            _ => None,
        };
        if let Some(name) = name {
            self.name_construction(&assign.right, name);
        }
        walk::walk_assignment_expression(self, assign);
    }

    fn visit_object_property(&mut self, prop: &ObjectProperty<'a>) {
        if !prop.computed {
            if let Some(name) = property_key_name(&prop.key) {
                self.name_construction(&prop.value, name);
            }
        }
        walk::walk_object_property(self, prop);
    }

    fn visit_new_expression(&mut self, new_expr: &NewExpression<'a>) {
        if is_stream_callee(new_expr) {
            self.record(new_expr);
        }
        walk::walk_new_expression(self, new_expr);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CAPTURES
// ═══════════════════════════════════════════════════════════════════════════════

/// Resolve closure reads of `callback` into captured access paths.
///
/// A name bound by the callback itself (parameters, locals, nested functions)
/// only hides references inside the scope that binds it.
pub fn collect_captures(
    callback: &Expression,
    module_bindings: &HashSet<String>,
) -> Vec<CapturedVariable> {
    let mut collector = CaptureCollector::default();
    collector.visit_expression(callback);

    let candidates: Vec<Vec<String>> = collector
        .paths
        .into_iter()
        .filter(|path| {
            let base = path[0].as_str();
            !module_bindings.contains(base) && !RUNTIME_GLOBALS.contains(base)
        })
        .collect();

    let mut result: Vec<Vec<String>> = Vec::new();
    for path in &candidates {
        if result.contains(path) {
            continue;
        }
        let subsumed = candidates
            .iter()
            .any(|other| other.len() < path.len() && path.starts_with(other));
        if !subsumed {
            result.push(path.clone());
        }
    }

    result
        .iter()
        .filter_map(|segments| CapturedVariable::from_segments(segments))
        .collect()
}

#[derive(Default)]
struct CaptureCollector {
    /// Innermost last.
    scopes: Vec<HashSet<String>>,
    paths: Vec<Vec<String>>,
}

/// Literal keys usable as path segments: identifier-safe strings and integers.
fn literal_key(expr: &Expression) -> Option<String> {
    match expr {
        Expression::StringLiteral(lit) if is_valid_identifier(lit.value.as_str()) => {
            Some(lit.value.to_string())
        }
        Expression::NumericLiteral(lit) if lit.value.fract() == 0.0 && lit.value >= 0.0 => {
            Some(format!("{}", lit.value as u64))
        }
        _ => None,
    }
}

enum Chain {
    Resolved(Vec<String>),
    /// A computed access with a non-literal key.
    Unresolvable,
    /// Rooted in something other than an identifier (call result, `this`, literal).
    NotAPath,
}

fn resolve_chain(expr: &Expression) -> Chain {
    match expr {
        Expression::Identifier(id) => Chain::Resolved(vec![id.name.to_string()]),
        Expression::ParenthesizedExpression(paren) => resolve_chain(&paren.expression),
        Expression::StaticMemberExpression(member) => match resolve_chain(&member.object) {
            Chain::Resolved(mut path) => {
                path.push(member.property.name.to_string());
                Chain::Resolved(path)
            }
            other => other,
        },
        Expression::ComputedMemberExpression(member) => match resolve_chain(&member.object) {
            Chain::Resolved(mut path) => match literal_key(&member.expression) {
                Some(key) => {
                    path.push(key);
                    Chain::Resolved(path)
                }
                None => Chain::Unresolvable,
            },
            other => other,
        },
        _ => Chain::NotAPath,
    }
}

fn parameter_bindings(params: &FormalParameters) -> Vec<String> {
    let mut collector = BindingCollector::default();
    collector.visit_formal_parameters(params);
    collector.symbols.into_iter().collect()
}

fn declaration_bindings(decl: &VariableDeclaration) -> Vec<String> {
    let mut names = Vec::new();
    for declarator in &decl.declarations {
        collect_pattern_bindings(&declarator.id, &mut names);
    }
    names
}

impl CaptureCollector {
    fn is_bound(&self, name: &str) -> bool {
        self.scopes.iter().any(|scope| scope.contains(name))
    }

    fn push_path(&mut self, path: Vec<String>) {
        if !self.is_bound(&path[0]) {
            self.paths.push(path);
        }
    }

    fn scoped(&mut self, names: Vec<String>, body: impl FnOnce(&mut Self)) {
        self.scopes.push(names.into_iter().collect());
        body(self);
        self.scopes.pop();
    }

    fn record_chain(&mut self, expr: &Expression, drop_method: bool) {
        match resolve_chain(expr) {
            Chain::Resolved(mut path) => {
                if drop_method && path.len() > 1 {
                    path.pop();
                }
                self.push_path(path);
            }
            Chain::Unresolvable => {
                tracing::debug!("dropping capture with computed member access");
            }
            Chain::NotAPath => {}
        }
        self.visit_chain_parts(expr);
    }

    /// Visit computed keys and a non-identifier root inside a member chain.
    fn visit_chain_parts<'a>(&mut self, expr: &Expression<'a>) {
        match expr {
            Expression::Identifier(_) => {}
            Expression::ParenthesizedExpression(paren) => self.visit_chain_parts(&paren.expression),
            Expression::StaticMemberExpression(member) => self.visit_chain_parts(&member.object),
            Expression::ComputedMemberExpression(member) => {
                self.visit_chain_parts(&member.object);
                self.visit_expression(&member.expression);
            }
            other => self.visit_expression(other),
        }
    }
}

impl<'a> Visit<'a> for CaptureCollector {
    fn visit_expression(&mut self, expr: &Expression<'a>) {
        match expr {
            Expression::StaticMemberExpression(_) | Expression::ComputedMemberExpression(_) => {
                self.record_chain(expr, false);
            }
            Expression::CallExpression(call)
                if matches!(
                    &call.callee,
                    Expression::StaticMemberExpression(_) | Expression::ComputedMemberExpression(_)
                ) =>
            {
                self.record_chain(&call.callee, true);
                for arg in &call.arguments {
                    self.visit_argument(arg);
                }
            }
            _ => walk::walk_expression(self, expr),
        }
    }

    fn visit_identifier_reference(&mut self, ident: &IdentifierReference<'a>) {
        self.push_path(vec![ident.name.to_string()]);
    }

    fn visit_function(&mut self, func: &Function<'a>, flags: ScopeFlags) {
        let mut names: Vec<String> = func.id.iter().map(|id| id.name.to_string()).collect();
        names.extend(parameter_bindings(&func.params));
        if let Some(body) = &func.body {
            names.extend(scope_bindings(&body.statements));
        }
        self.scoped(names, |v| walk::walk_function(v, func, flags));
    }

    fn visit_arrow_function_expression(&mut self, arrow: &ArrowFunctionExpression<'a>) {
        let mut names = parameter_bindings(&arrow.params);
        names.extend(scope_bindings(&arrow.body.statements));
        self.scoped(names, |v| walk::walk_arrow_function_expression(v, arrow));
    }

    fn visit_block_statement(&mut self, block: &BlockStatement<'a>) {
        let names = scope_bindings(&block.body);
        self.scoped(names, |v| walk::walk_block_statement(v, block));
    }

    fn visit_catch_clause(&mut self, clause: &CatchClause<'a>) {
        let mut names = Vec::new();
        if let Some(param) = &clause.param {
            collect_pattern_bindings(&param.pattern, &mut names);
        }
        self.scoped(names, |v| walk::walk_catch_clause(v, clause));
    }

    fn visit_for_statement(&mut self, stmt: &ForStatement<'a>) {
        let names = match &stmt.init {
            Some(ForStatementInit::VariableDeclaration(decl)) => declaration_bindings(decl),
            _ => Vec::new(),
        };
        self.scoped(names, |v| walk::walk_for_statement(v, stmt));
    }

    fn visit_for_of_statement(&mut self, stmt: &ForOfStatement<'a>) {
        let names = match &stmt.left {
            ForStatementLeft::VariableDeclaration(decl) => declaration_bindings(decl),
            _ => Vec::new(),
        };
        self.scoped(names, |v| walk::walk_for_of_statement(v, stmt));
    }

    fn visit_for_in_statement(&mut self, stmt: &ForInStatement<'a>) {
        let names = match &stmt.left {
            ForStatementLeft::VariableDeclaration(decl) => declaration_bindings(decl),
            _ => Vec::new(),
        };
        self.scoped(names, |v| walk::walk_for_in_statement(v, stmt));
    }
}
