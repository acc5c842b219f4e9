//! Declaration analysis for unified component modules.
//!
//! Each exported function is classified as a request handler (kept whole on the
//! server) or a component. For components the first top-level `return` splits
//! the body: statements before it form the server phase, and a returned function
//! becomes the client phase. The names that cross that boundary are the
//! intersection of what the server phase declares and what the client phase
//! reads; nothing else is ever serialized.

use oxc_allocator::Allocator;
use oxc_ast::ast::{
    ArrowFunctionExpression, BindingPattern, Declaration, ExportDefaultDeclarationKind,
    Expression, FormalParameters, Function, FunctionBody, ImportDeclarationSpecifier,
    ModuleExportName, Program, PropertyKey, Statement,
};
use oxc_ast_visit::Visit;
use oxc_span::{GetSpan, Span};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::error::CompilerError;
use crate::parse::{parse_source, CodeSpan, SpanOffset};
use crate::scope::{declared_names, referenced_names, ReferenceCollector};
use crate::stream::{analyze_streams, StreamDeclaration};

pub const REQUEST_METHODS: [&str; 7] = ["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

/// Name used when a parameter shape cannot be reconstructed.
pub const CATCH_ALL_PARAM: &str = "props";

// ═══════════════════════════════════════════════════════════════════════════════
// DECLARATION TYPES
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeclarationKind {
    Handler,
    Component,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectParamProperty {
    pub key: String,
    pub value: ParamPattern,
    pub shorthand: bool,
}

/// Structural copy of a function's first parameter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ParamPattern {
    None,
    Identifier {
        name: String,
    },
    Object {
        properties: Vec<ObjectParamProperty>,
        rest: Option<Box<ParamPattern>>,
    },
    Array {
        elements: Vec<Option<ParamPattern>>,
        rest: Option<Box<ParamPattern>>,
    },
    Default {
        pattern: Box<ParamPattern>,
        default_expr: String,
    },
    CatchAll,
}

impl ParamPattern {
    pub fn render(&self) -> String {
        match self {
            ParamPattern::None => String::new(),
            ParamPattern::Identifier { name } => name.clone(),
            ParamPattern::CatchAll => CATCH_ALL_PARAM.to_string(),
            ParamPattern::Default {
                pattern,
                default_expr,
            } => format!("{} = {}", pattern.render(), default_expr),
            ParamPattern::Object { properties, rest } => {
                let mut parts: Vec<String> = properties
                    .iter()
                    .map(|prop| {
                        if prop.shorthand {
                            prop.value.render()
                        } else {
                            format!("{}: {}", prop.key, prop.value.render())
                        }
                    })
                    .collect();
                if let Some(rest) = rest {
                    parts.push(format!("...{}", rest.render()));
                }
                if parts.is_empty() {
                    "{}".to_string()
                } else {
                    format!("{{ {} }}", parts.join(", "))
                }
            }
            ParamPattern::Array { elements, rest } => {
                let mut parts: Vec<String> = elements
                    .iter()
                    .map(|el| el.as_ref().map(|p| p.render()).unwrap_or_default())
                    .collect();
                if let Some(rest) = rest {
                    parts.push(format!("...{}", rest.render()));
                }
                format!("[{}]", parts.join(", "))
            }
        }
    }

    /// Local names the pattern binds, in source order.
    pub fn bound_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        self.collect_names(&mut names);
        names
    }

    fn collect_names(&self, names: &mut Vec<String>) {
        match self {
            ParamPattern::None => {}
            ParamPattern::Identifier { name } => names.push(name.clone()),
            ParamPattern::CatchAll => names.push(CATCH_ALL_PARAM.to_string()),
            ParamPattern::Default { pattern, .. } => pattern.collect_names(names),
            ParamPattern::Object { properties, rest } => {
                for prop in properties {
                    prop.value.collect_names(names);
                }
                if let Some(rest) = rest {
                    rest.collect_names(names);
                }
            }
            ParamPattern::Array { elements, rest } => {
                for el in elements.iter().flatten() {
                    el.collect_names(names);
                }
                if let Some(rest) = rest {
                    rest.collect_names(names);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExportDeclaration {
    /// Exported name, `default` for default exports.
    pub name: String,
    pub kind: DeclarationKind,
    pub is_async: bool,
    pub returns_inner_function: bool,
    pub function_span: CodeSpan,
    pub server_span: CodeSpan,
    /// Server span holds a bare expression (arrow with expression body).
    pub server_is_expression: bool,
    pub client_span: Option<CodeSpan>,
    pub client_is_expression: bool,
    /// Names bound by server-phase variable declarations, in declaration order.
    pub server_bindings: Vec<String>,
    pub shared_names: Vec<String>,
    /// Every name the client phase references, sorted.
    pub client_references: Vec<String>,
    pub param_pattern: ParamPattern,
}

impl ExportDeclaration {
    pub fn is_hydrated(&self) -> bool {
        self.kind == DeclarationKind::Component && self.returns_inner_function
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// IMPORTS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImportBinding {
    pub imported: String,
    pub local: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImportStatement {
    pub source: String,
    pub default_name: Option<String>,
    pub namespace: Option<String>,
    pub named: Vec<ImportBinding>,
    pub side_effect: bool,
}

impl ImportStatement {
    pub fn local_names(&self) -> Vec<String> {
        self.default_name
            .iter()
            .chain(self.namespace.iter())
            .cloned()
            .chain(self.named.iter().map(|b| b.local.clone()))
            .collect()
    }

    /// Render the import, keeping only locals accepted by `keep`.
    /// Returns `None` when nothing survives (side-effect imports always survive).
    pub fn render_filtered(&self, keep: impl Fn(&str) -> bool) -> Option<String> {
        let source = serde_json::to_string(&self.source).unwrap_or_default();
        if self.side_effect {
            return Some(format!("import {};", source));
        }

        let default_name = self.default_name.as_deref().filter(|n| keep(n));
        let namespace = self.namespace.as_deref().filter(|n| keep(n));
        let named: Vec<String> = self
            .named
            .iter()
            .filter(|b| keep(&b.local))
            .map(|b| {
                if b.imported == b.local {
                    b.local.clone()
                } else {
                    format!("{} as {}", b.imported, b.local)
                }
            })
            .collect();

        let mut clauses = Vec::new();
        if let Some(name) = default_name {
            clauses.push(name.to_string());
        }
        if let Some(ns) = namespace {
            clauses.push(format!("* as {}", ns));
        }
        if !named.is_empty() {
            clauses.push(format!("{{ {} }}", named.join(", ")));
        }

        if clauses.is_empty() {
            None
        } else {
            Some(format!("import {} from {};", clauses.join(", "), source))
        }
    }

    pub fn render(&self) -> Option<String> {
        self.render_filtered(|_| true)
    }
}

fn collect_imports(program: &Program) -> Vec<ImportStatement> {
    let mut imports = Vec::new();
    for stmt in &program.body {
        let Statement::ImportDeclaration(import_decl) = stmt else {
            continue;
        };
        if import_decl.import_kind.is_type() {
            continue;
        }

        let mut statement = ImportStatement {
            source: import_decl.source.value.to_string(),
            default_name: None,
            namespace: None,
            named: Vec::new(),
            side_effect: import_decl.specifiers.is_none(),
        };

        if let Some(specifiers) = &import_decl.specifiers {
            for specifier in specifiers {
                match specifier {
                    ImportDeclarationSpecifier::ImportSpecifier(s) => {
                        if s.import_kind.is_type() {
                            continue;
                        }
                        let imported = match &s.imported {
                            ModuleExportName::IdentifierName(id) => id.name.to_string(),
                            ModuleExportName::IdentifierReference(id) => id.name.to_string(),
                            ModuleExportName::StringLiteral(lit) => {
                                serde_json::to_string(lit.value.as_str()).unwrap_or_default()
                            }
                        };
                        statement.named.push(ImportBinding {
                            imported,
                            local: s.local.name.to_string(),
                        });
                    }
                    ImportDeclarationSpecifier::ImportDefaultSpecifier(s) => {
                        statement.default_name = Some(s.local.name.to_string());
                    }
                    ImportDeclarationSpecifier::ImportNamespaceSpecifier(s) => {
                        statement.namespace = Some(s.local.name.to_string());
                    }
                }
            }
        }

        // `import {} from "x"` and fully type-only specifier lists carry no values
        if !statement.side_effect && statement.local_names().is_empty() {
            continue;
        }
        imports.push(statement);
    }
    imports
}

// ═══════════════════════════════════════════════════════════════════════════════
// MODULE STATEMENTS
// ═══════════════════════════════════════════════════════════════════════════════

/// A top-level statement that is neither an import nor an export (helpers, constants).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ModuleStatement {
    pub span: CodeSpan,
    pub declared: Vec<String>,
    pub references: Vec<String>,
}

fn collect_module_statements(
    program: &Program,
    offset: SpanOffset,
    default_local: Option<&str>,
) -> Vec<ModuleStatement> {
    let mut statements = Vec::new();
    for stmt in &program.body {
        let declared = match stmt {
            Statement::ImportDeclaration(_)
            | Statement::ExportNamedDeclaration(_)
            | Statement::ExportDefaultDeclaration(_)
            | Statement::ExportAllDeclaration(_) => continue,
            Statement::VariableDeclaration(_) => declared_names(std::slice::from_ref(stmt)),
            Statement::FunctionDeclaration(func) => {
                func.id.iter().map(|id| id.name.to_string()).collect()
            }
            Statement::ClassDeclaration(class) => {
                class.id.iter().map(|id| id.name.to_string()).collect()
            }
            Statement::TSTypeAliasDeclaration(alias) => vec![alias.id.name.to_string()],
            Statement::TSInterfaceDeclaration(iface) => vec![iface.id.name.to_string()],
            _ => Vec::new(),
        };
        // The function behind `export default Name;` is emitted as the declaration itself
        if let Some(local) = default_local {
            if declared.iter().any(|name| name == local) {
                continue;
            }
        }
        let mut references: Vec<String> = referenced_names(std::slice::from_ref(stmt))
            .into_iter()
            .collect();
        references.sort();
        statements.push(ModuleStatement {
            span: offset.span(stmt.span()),
            declared,
            references,
        });
    }
    statements
}

/// Module statements needed by code referencing `seed`, following helper-to-helper
/// references. Returns statements in source order and the closed name set.
pub fn select_module_statements<'m>(
    statements: &'m [ModuleStatement],
    seed: impl IntoIterator<Item = String>,
) -> (Vec<&'m ModuleStatement>, HashSet<String>) {
    let mut needed: HashSet<String> = seed.into_iter().collect();
    let mut selected = vec![false; statements.len()];
    loop {
        let mut changed = false;
        for (idx, stmt) in statements.iter().enumerate() {
            if selected[idx] || !stmt.declared.iter().any(|n| needed.contains(n)) {
                continue;
            }
            selected[idx] = true;
            changed = true;
            needed.extend(stmt.references.iter().cloned());
        }
        if !changed {
            break;
        }
    }
    let chosen = statements
        .iter()
        .zip(selected)
        .filter_map(|(stmt, keep)| keep.then_some(stmt))
        .collect();
    (chosen, needed)
}

// ═══════════════════════════════════════════════════════════════════════════════
// FILE ANALYSIS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileAnalysis {
    pub declarations: Vec<ExportDeclaration>,
    pub streams: Vec<StreamDeclaration>,
    pub imports: Vec<ImportStatement>,
    pub module_statements: Vec<ModuleStatement>,
}

/// Parse and analyze one module.
///
/// `rel_path` is the normalized, source-root-relative path; stream IDs derive from it.
pub fn analyze_source(
    path: &Path,
    rel_path: &str,
    source: &str,
) -> Result<FileAnalysis, CompilerError> {
    let allocator = Allocator::default();
    let parsed = parse_source(&allocator, source, path)?;

    let imports = collect_imports(&parsed.program);
    let declarations = analyze_declarations(&parsed.program, source, parsed.offset);
    let module_statements = collect_module_statements(
        &parsed.program,
        parsed.offset,
        default_export_local(&parsed.program),
    );

    let mut module_bindings: HashSet<String> =
        imports.iter().flat_map(|i| i.local_names()).collect();
    module_bindings.extend(
        module_statements
            .iter()
            .flat_map(|stmt| stmt.declared.iter().cloned()),
    );
    let streams = analyze_streams(
        &parsed.program,
        source,
        parsed.offset,
        rel_path,
        &module_bindings,
    );

    Ok(FileAnalysis {
        declarations,
        streams,
        imports,
        module_statements,
    })
}

fn default_export_local<'p>(program: &'p Program) -> Option<&'p str> {
    program.body.iter().find_map(|stmt| match stmt {
        Statement::ExportDefaultDeclaration(export) => match &export.declaration {
            ExportDefaultDeclarationKind::Identifier(ident) => Some(ident.name.as_str()),
            _ => None,
        },
        _ => None,
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// DECLARATION ANALYSIS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Clone, Copy)]
enum FunctionNode<'b, 'a> {
    Function(&'b Function<'a>),
    Arrow(&'b ArrowFunctionExpression<'a>),
}

impl<'b, 'a> FunctionNode<'b, 'a> {
    fn from_expression(expr: &'b Expression<'a>) -> Option<Self> {
        match unwrap_parens(expr) {
            Expression::FunctionExpression(func) => Some(FunctionNode::Function(func)),
            Expression::ArrowFunctionExpression(arrow) => Some(FunctionNode::Arrow(arrow)),
            _ => None,
        }
    }

    fn is_async(&self) -> bool {
        match self {
            FunctionNode::Function(func) => func.r#async,
            FunctionNode::Arrow(arrow) => arrow.r#async,
        }
    }

    fn span(&self) -> Span {
        match self {
            FunctionNode::Function(func) => func.span,
            FunctionNode::Arrow(arrow) => arrow.span,
        }
    }

    fn params(&self) -> &'b FormalParameters<'a> {
        match self {
            FunctionNode::Function(func) => &func.params,
            FunctionNode::Arrow(arrow) => &arrow.params,
        }
    }

    fn body(&self) -> Option<&'b FunctionBody<'a>> {
        match self {
            FunctionNode::Function(func) => func.body.as_deref(),
            FunctionNode::Arrow(arrow) => Some(&arrow.body),
        }
    }

    /// The body expression of an expression-bodied arrow.
    fn expression_body(&self) -> Option<&'b Expression<'a>> {
        match self {
            FunctionNode::Arrow(arrow) if arrow.expression => {
                match arrow.body.statements.first() {
                    Some(Statement::ExpressionStatement(stmt)) => Some(&stmt.expression),
                    _ => None,
                }
            }
            _ => None,
        }
    }
}

fn unwrap_parens<'b, 'a>(mut expr: &'b Expression<'a>) -> &'b Expression<'a> {
    while let Expression::ParenthesizedExpression(paren) = expr {
        expr = &paren.expression;
    }
    expr
}

pub fn analyze_declarations(
    program: &Program,
    source: &str,
    offset: SpanOffset,
) -> Vec<ExportDeclaration> {
    // Top-level functions, for `export default Page;`
    let mut local_functions: HashMap<String, FunctionNode> = HashMap::new();
    for stmt in &program.body {
        match stmt {
            Statement::FunctionDeclaration(func) => {
                if let Some(id) = &func.id {
                    local_functions.insert(id.name.to_string(), FunctionNode::Function(func));
                }
            }
            Statement::VariableDeclaration(var_decl) => {
                for decl in &var_decl.declarations {
                    if let (BindingPattern::BindingIdentifier(id), Some(init)) =
                        (&decl.id, &decl.init)
                    {
                        if let Some(node) = FunctionNode::from_expression(init) {
                            local_functions.insert(id.name.to_string(), node);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    let mut exported: Vec<(String, FunctionNode)> = Vec::new();
    for stmt in &program.body {
        match stmt {
            Statement::ExportNamedDeclaration(export) => match &export.declaration {
                Some(Declaration::FunctionDeclaration(func)) => {
                    if let Some(id) = &func.id {
                        exported.push((id.name.to_string(), FunctionNode::Function(func)));
                    }
                }
                Some(Declaration::VariableDeclaration(var_decl)) => {
                    for decl in &var_decl.declarations {
                        if let (BindingPattern::BindingIdentifier(id), Some(init)) =
                            (&decl.id, &decl.init)
                        {
                            if let Some(node) = FunctionNode::from_expression(init) {
                                exported.push((id.name.to_string(), node));
                            }
                        }
                    }
                }
                _ => {}
            },
            Statement::ExportDefaultDeclaration(export) => {
                let node = match &export.declaration {
                    ExportDefaultDeclarationKind::FunctionDeclaration(func) => {
                        Some(FunctionNode::Function(func))
                    }
                    ExportDefaultDeclarationKind::FunctionExpression(func) => {
                        Some(FunctionNode::Function(func))
                    }
                    ExportDefaultDeclarationKind::ArrowFunctionExpression(arrow) => {
                        Some(FunctionNode::Arrow(arrow))
                    }
                    ExportDefaultDeclarationKind::Identifier(ident) => {
                        local_functions.get(ident.name.as_str()).copied()
                    }
                    _ => None,
                };
                if let Some(node) = node {
                    exported.push(("default".to_string(), node));
                }
            }
            _ => {}
        }
    }

    exported
        .into_iter()
        .filter_map(|(name, node)| analyze_function(name, node, source, offset))
        .collect()
}

fn analyze_function(
    name: String,
    node: FunctionNode,
    source: &str,
    offset: SpanOffset,
) -> Option<ExportDeclaration> {
    let body = node.body()?;
    let kind = if REQUEST_METHODS.contains(&name.as_str()) {
        DeclarationKind::Handler
    } else {
        DeclarationKind::Component
    };
    let param_pattern = match node.params().items.first() {
        Some(param) => reconstruct_pattern(&param.pattern, source, offset)
            .unwrap_or(ParamPattern::CatchAll),
        None => ParamPattern::None,
    };

    let mut decl = ExportDeclaration {
        name,
        kind,
        is_async: node.is_async(),
        returns_inner_function: false,
        function_span: offset.span(node.span()),
        server_span: offset.span(body.span),
        server_is_expression: false,
        client_span: None,
        client_is_expression: false,
        server_bindings: Vec::new(),
        shared_names: Vec::new(),
        client_references: Vec::new(),
        param_pattern,
    };

    // Expression-bodied arrow: `() => () => <div/>` or `(req) => new Response()`
    if let Some(expr) = node.expression_body() {
        decl.server_span = offset.span(expr.span());
        decl.server_is_expression = true;
        if kind == DeclarationKind::Component {
            if let Some(inner) = FunctionNode::from_expression(expr) {
                decl.server_span = CodeSpan::empty_at(offset.pos(body.span.start));
                decl.server_is_expression = false;
                attach_client_phase(&mut decl, inner, &[], offset);
            }
        }
        return Some(decl);
    }

    if kind == DeclarationKind::Handler {
        return Some(decl);
    }

    let statements = &body.statements;
    let Some(ret_idx) = statements
        .iter()
        .position(|s| matches!(s, Statement::ReturnStatement(_)))
    else {
        return Some(decl);
    };
    let Statement::ReturnStatement(ret) = &statements[ret_idx] else {
        return Some(decl);
    };
    let Some(inner) = ret.argument.as_ref().and_then(FunctionNode::from_expression) else {
        // Server-only component: whole body stays put
        return Some(decl);
    };

    decl.server_span = CodeSpan::new(offset.pos(body.span.start), offset.pos(ret.span.start));
    attach_client_phase(&mut decl, inner, &statements[..ret_idx], offset);
    Some(decl)
}

fn attach_client_phase(
    decl: &mut ExportDeclaration,
    inner: FunctionNode,
    server_statements: &[Statement],
    offset: SpanOffset,
) {
    let Some(inner_body) = inner.body() else {
        return;
    };

    let references = match inner.expression_body() {
        Some(expr) => {
            decl.client_span = Some(offset.span(expr.span()));
            decl.client_is_expression = true;
            let mut collector = ReferenceCollector::default();
            collector.visit_expression(expr);
            collector.references
        }
        None => {
            // Contents between the braces
            let span = inner_body.span;
            decl.client_span = Some(CodeSpan::new(
                offset.pos(span.start + 1),
                offset.pos(span.end.saturating_sub(1).max(span.start + 1)),
            ));
            referenced_names(&inner_body.statements)
        }
    };

    let mut client_references: Vec<String> = references.iter().cloned().collect();
    client_references.sort();

    decl.returns_inner_function = true;
    decl.client_references = client_references;
    decl.server_bindings = declared_names(server_statements);
    decl.shared_names = decl
        .server_bindings
        .iter()
        .filter(|name| references.contains(name.as_str()))
        .cloned()
        .collect();
}

// ═══════════════════════════════════════════════════════════════════════════════
// PARAMETER PATTERNS
// ═══════════════════════════════════════════════════════════════════════════════

fn reconstruct_pattern(
    pattern: &BindingPattern,
    source: &str,
    offset: SpanOffset,
) -> Option<ParamPattern> {
    match pattern {
        BindingPattern::BindingIdentifier(id) => Some(ParamPattern::Identifier {
            name: id.name.to_string(),
        }),
        BindingPattern::ObjectPattern(obj) => {
            let mut properties = Vec::new();
            for prop in &obj.properties {
                if prop.computed {
                    return None;
                }
                let key = match &prop.key {
                    PropertyKey::StaticIdentifier(id) => id.name.to_string(),
                    PropertyKey::StringLiteral(lit) => {
                        serde_json::to_string(lit.value.as_str()).ok()?
                    }
                    _ => return None,
                };
                properties.push(ObjectParamProperty {
                    key,
                    value: reconstruct_pattern(&prop.value, source, offset)?,
                    shorthand: prop.shorthand,
                });
            }
            let rest = match &obj.rest {
                Some(rest) => Some(Box::new(reconstruct_pattern(
                    &rest.argument,
                    source,
                    offset,
                )?)),
                None => None,
            };
            Some(ParamPattern::Object { properties, rest })
        }
        BindingPattern::ArrayPattern(arr) => {
            let mut elements = Vec::new();
            for el in &arr.elements {
                elements.push(match el {
                    Some(p) => Some(reconstruct_pattern(p, source, offset)?),
                    None => None,
                });
            }
            let rest = match &arr.rest {
                Some(rest) => Some(Box::new(reconstruct_pattern(
                    &rest.argument,
                    source,
                    offset,
                )?)),
                None => None,
            };
            Some(ParamPattern::Array { elements, rest })
        }
        BindingPattern::AssignmentPattern(assign) => {
            let default_expr = offset.span(assign.right.span()).slice(source).trim();
            if default_expr.is_empty() {
                return None;
            }
            Some(ParamPattern::Default {
                pattern: Box::new(reconstruct_pattern(&assign.left, source, offset)?),
                default_expr: default_expr.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyze(code: &str) -> FileAnalysis {
        analyze_source(Path::new("app/page.tsx"), "app/page.tsx", code).unwrap()
    }

    #[test]
    fn test_request_methods_are_handlers() {
        let analysis = analyze(
            "export async function GET(req) { return new Response('ok'); }\n\
             export const POST = async (req) => new Response('made');",
        );
        assert_eq!(analysis.declarations.len(), 2);
        let get = &analysis.declarations[0];
        assert_eq!(get.kind, DeclarationKind::Handler);
        assert!(get.is_async);
        assert!(!get.returns_inner_function);
        assert!(get.client_span.is_none());

        let post = &analysis.declarations[1];
        assert_eq!(post.name, "POST");
        assert!(post.server_is_expression);
    }

    #[test]
    fn test_phase_boundary_spans() {
        let code = "export default async function Page({ params }) {\n  const user = await load(params.id);\n  const greeting = 'Hi ' + user.name;\n  return () => {\n    return <h1>{greeting}</h1>;\n  };\n}\n";
        let analysis = analyze(code);
        let decl = &analysis.declarations[0];
        assert_eq!(decl.name, "default");
        assert!(decl.is_hydrated());

        let server = decl.server_span.slice(code);
        assert!(server.starts_with('{'));
        assert!(server.contains("const greeting"));
        assert!(!server.contains("return"));

        let client = decl.client_span.unwrap().slice(code);
        assert!(client.contains("<h1>{greeting}</h1>"));
        assert!(!client.trim_start().starts_with('{'));

        assert_eq!(decl.server_bindings, vec!["user", "greeting"]);
        assert_eq!(decl.shared_names, vec!["greeting"]);
    }

    #[test]
    fn test_shared_props_across_binding_styles() {
        let declarations = [
            "const a = 1; const b = 2; const c = 3;",
            "const { a, b, c } = load();",
            "const [a, b, c] = load();",
            "const { a, nested: { b } } = load(); const [c = 0] = more();",
        ];
        for server in declarations {
            let code = format!(
                "export default function Page() {{\n  {}\n  return () => [b, c, d];\n}}",
                server
            );
            let decl = &analyze(&code).declarations[0];
            assert_eq!(decl.server_bindings, vec!["a", "b", "c"], "bindings for `{}`", server);
            assert_eq!(decl.shared_names, vec!["b", "c"], "shared for `{}`", server);
        }
    }

    #[test]
    fn test_streams_ignore_module_helpers() {
        let analysis = analyze(
            "import { db } from './db';\n\
             function fmt(m) { return m.toUpperCase(); }\n\
             const PREFIX = 'room:';\n\
             export default function Page({ room }) {\n\
               const feed = new Stream(async function* () { yield fmt(PREFIX + room) + db.name; });\n\
               return () => feed;\n\
             }",
        );
        let captured: Vec<&str> = analysis.streams[0]
            .captured_vars
            .iter()
            .map(|c| c.full_path.as_str())
            .collect();
        assert_eq!(captured, vec!["room"]);
    }

    #[test]
    fn test_server_only_component_has_no_client() {
        let analysis = analyze("export function About() { const x = 1; return <p>{x}</p>; }");
        let decl = &analysis.declarations[0];
        assert_eq!(decl.kind, DeclarationKind::Component);
        assert!(!decl.returns_inner_function);
        assert!(decl.client_span.is_none());
        assert!(decl.shared_names.is_empty());
    }

    #[test]
    fn test_expression_arrow_client_phase() {
        let code = "export default () => () => <div>static</div>;";
        let decl = &analyze(code).declarations[0];
        assert!(decl.returns_inner_function);
        assert!(decl.client_is_expression);
        assert!(decl.server_span.is_empty());
        assert_eq!(decl.client_span.unwrap().slice(code), "<div>static</div>");
    }

    #[test]
    fn test_parenthesized_return_function() {
        let code = "export function Counter() { const start = 3; return (function () { return start; }); }";
        let decl = &analyze(code).declarations[0];
        assert!(decl.returns_inner_function);
        assert_eq!(decl.shared_names, vec!["start"]);
    }

    #[test]
    fn test_export_default_identifier_resolves_local_function() {
        let code = "function Page() { const a = 1; return () => a; }\nexport default Page;";
        let decl = &analyze(code).declarations[0];
        assert_eq!(decl.name, "default");
        assert_eq!(decl.shared_names, vec!["a"]);
    }

    #[test]
    fn test_param_pattern_reconstruction() {
        let code = "export function Page({ params: { slug }, query = {}, ...rest }, ctx) { return () => slug; }";
        let decl = &analyze(code).declarations[0];
        assert_eq!(
            decl.param_pattern.render(),
            "{ params: { slug }, query = {}, ...rest }"
        );
        assert_eq!(decl.param_pattern.bound_names(), vec!["slug", "query", "rest"]);

        let code = "export function Page([first, , third], other) { return null; }";
        assert_eq!(analyze(code).declarations[0].param_pattern.render(), "[first, , third]");

        let code = "export function Page() { return null; }";
        assert_eq!(analyze(code).declarations[0].param_pattern, ParamPattern::None);
    }

    #[test]
    fn test_computed_param_key_degrades_to_catch_all() {
        let code = "export function Page({ [key]: value }) { return null; }";
        let decl = &analyze(code).declarations[0];
        assert_eq!(decl.param_pattern, ParamPattern::CatchAll);
        assert_eq!(decl.param_pattern.render(), "props");
    }

    #[test]
    fn test_module_statements_follow_helper_references() {
        let code = "const PREFIX = '>';\nfunction label(x) { return PREFIX + x; }\nconst secret = process.env.KEY;\nfunction Page() { return () => label(1); }\nexport default Page;";
        let analysis = analyze(code);
        assert_eq!(analysis.module_statements.len(), 3);
        let decl = &analysis.declarations[0];
        assert_eq!(decl.client_references, vec!["label"]);

        let (chosen, needed) = select_module_statements(
            &analysis.module_statements,
            decl.client_references.iter().cloned(),
        );
        let declared: Vec<&str> = chosen
            .iter()
            .flat_map(|s| s.declared.iter().map(String::as_str))
            .collect();
        assert_eq!(declared, vec!["PREFIX", "label"]);
        assert!(needed.contains("PREFIX"));
        assert!(!needed.contains("secret"));
    }

    #[test]
    fn test_imports_collected_without_types() {
        let analysis = analyze(
            "import type { User } from './types';\nimport db, { query as q, type Row } from './db';\nimport * as ui from 'duet/ui';\nimport './global.css';\nexport function Page() { return null; }",
        );
        assert_eq!(analysis.imports.len(), 3);
        assert_eq!(
            analysis.imports[0].render().unwrap(),
            "import db, { query as q } from \"./db\";"
        );
        assert_eq!(
            analysis.imports[1].render_filtered(|n| n != "ui"),
            None
        );
        assert_eq!(
            analysis.imports[2].render().unwrap(),
            "import \"./global.css\";"
        );
    }
}
