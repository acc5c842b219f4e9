use oxc_ast::ast::{BindingPattern, Statement};
use oxc_ast_visit::Visit;
use oxc_syntax::scope::ScopeFlags;
use std::collections::HashSet;

lazy_static::lazy_static! {
    /// Names that resolve in both execution contexts without being captured.
    pub static ref RUNTIME_GLOBALS: HashSet<&'static str> = {
        let mut s = HashSet::new();
        // Duet runtime primitives
        s.insert("Stream");

        // Standard JS Globals
        s.insert("Math");
        s.insert("console");
        s.insert("JSON");
        s.insert("Date");
        s.insert("String");
        s.insert("Number");
        s.insert("Boolean");
        s.insert("Array");
        s.insert("Object");
        s.insert("Promise");
        s.insert("Map");
        s.insert("Set");
        s.insert("Error");
        s.insert("Symbol");
        s.insert("undefined");
        s.insert("NaN");
        s.insert("Infinity");
        s.insert("parseInt");
        s.insert("parseFloat");
        s.insert("setTimeout");
        s.insert("clearTimeout");
        s.insert("setInterval");
        s.insert("clearInterval");
        s.insert("fetch");
        s.insert("URL");
        s.insert("Response");
        s.insert("Request");
        s.insert("globalThis");
        s.insert("crypto");
        s.insert("process");
        s
    };

    /// Reserved words that can never be spliced into generated code as a binding.
    static ref RESERVED_WORDS: HashSet<&'static str> = {
        [
            "break", "case", "catch", "class", "const", "continue", "debugger", "default",
            "delete", "do", "else", "enum", "export", "extends", "false", "finally", "for",
            "function", "if", "import", "in", "instanceof", "new", "null", "return", "super",
            "switch", "this", "throw", "true", "try", "typeof", "var", "void", "while", "with",
            "yield", "let", "static", "implements", "interface", "package", "private",
            "protected", "public", "await", "arguments", "eval",
        ]
        .into_iter()
        .collect()
    };

    static ref IDENTIFIER_RE: regex::Regex =
        regex::Regex::new(r"^[A-Za-z_$][A-Za-z0-9_$]*$").unwrap();
}

/// A plain, non-reserved JS identifier (ASCII only).
pub fn is_valid_identifier(name: &str) -> bool {
    IDENTIFIER_RE.is_match(name) && !RESERVED_WORDS.contains(name)
}

// ═══════════════════════════════════════════════════════════════════════════════
// BINDINGS
// ═══════════════════════════════════════════════════════════════════════════════

/// Push every name bound by `pattern`, in source order, skipping duplicates.
pub fn collect_pattern_bindings(pattern: &BindingPattern, names: &mut Vec<String>) {
    match pattern {
        BindingPattern::BindingIdentifier(id) => {
            let name = id.name.to_string();
            if !names.contains(&name) {
                names.push(name);
            }
        }
        BindingPattern::ObjectPattern(obj) => {
            for prop in &obj.properties {
                collect_pattern_bindings(&prop.value, names);
            }
            if let Some(rest) = &obj.rest {
                collect_pattern_bindings(&rest.argument, names);
            }
        }
        BindingPattern::ArrayPattern(arr) => {
            for pattern in arr.elements.iter().flatten() {
                collect_pattern_bindings(pattern, names);
            }
            if let Some(rest) = &arr.rest {
                collect_pattern_bindings(&rest.argument, names);
            }
        }
        BindingPattern::AssignmentPattern(assign) => {
            collect_pattern_bindings(&assign.left, names);
        }
    }
}

/// Names bound by top-level variable declarations among `statements`.
pub fn declared_names(statements: &[Statement]) -> Vec<String> {
    let mut names = Vec::new();
    for stmt in statements {
        if let Statement::VariableDeclaration(var_decl) = stmt {
            for decl in &var_decl.declarations {
                collect_pattern_bindings(&decl.id, &mut names);
            }
        }
    }
    names
}

/// Names a statement list binds in its own scope: variables, function and class declarations.
pub fn scope_bindings(statements: &[Statement]) -> Vec<String> {
    let mut names = declared_names(statements);
    for stmt in statements {
        match stmt {
            Statement::FunctionDeclaration(func) => {
                names.extend(func.id.iter().map(|id| id.name.to_string()));
            }
            Statement::ClassDeclaration(class) => {
                names.extend(class.id.iter().map(|id| id.name.to_string()));
            }
            _ => {}
        }
    }
    names
}

/// Every binding introduced anywhere inside the visited nodes, including nested
/// functions, classes and catch clauses.
#[derive(Default)]
pub struct BindingCollector {
    pub symbols: HashSet<String>,
}

impl<'a> Visit<'a> for BindingCollector {
    fn visit_binding_identifier(&mut self, ident: &oxc_ast::ast::BindingIdentifier<'a>) {
        self.symbols.insert(ident.name.to_string());
    }

    fn visit_function(&mut self, func: &oxc_ast::ast::Function<'a>, flags: ScopeFlags) {
        if let Some(id) = &func.id {
            self.symbols.insert(id.name.to_string());
        }
        oxc_ast_visit::walk::walk_function(self, func, flags);
    }

    fn visit_class(&mut self, class: &oxc_ast::ast::Class<'a>) {
        if let Some(id) = &class.id {
            self.symbols.insert(id.name.to_string());
        }
        oxc_ast_visit::walk::walk_class(self, class);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// REFERENCES
// ═══════════════════════════════════════════════════════════════════════════════

/// Every identifier referenced by the visited nodes (reads, writes, JSX tags).
#[derive(Default)]
pub struct ReferenceCollector {
    pub references: HashSet<String>,
}

impl<'a> Visit<'a> for ReferenceCollector {
    fn visit_identifier_reference(&mut self, ident: &oxc_ast::ast::IdentifierReference<'a>) {
        self.references.insert(ident.name.to_string());
    }
}

pub fn referenced_names(statements: &[Statement]) -> HashSet<String> {
    let mut collector = ReferenceCollector::default();
    for stmt in statements {
        collector.visit_statement(stmt);
    }
    collector.references
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxc_allocator::Allocator;
    use oxc_parser::Parser;
    use oxc_span::SourceType;

    fn parse_with<T>(code: &str, f: impl FnOnce(&[Statement]) -> T) -> T {
        let allocator = Allocator::default();
        let source_type = SourceType::default()
            .with_module(true)
            .with_typescript(true)
            .with_jsx(true);
        let ret = Parser::new(&allocator, code, source_type).parse();
        assert!(ret.errors.is_empty(), "{:?}", ret.errors);
        f(&ret.program.body)
    }

    #[test]
    fn test_declared_names_destructuring() {
        let names = parse_with(
            "const a = 1; const { b, c: renamed, ...rest } = obj; let [d, , [e = 2], ...f] = list; g();",
            declared_names,
        );
        assert_eq!(names, vec!["a", "b", "renamed", "rest", "d", "e", "f"]);
    }

    #[test]
    fn test_scope_bindings_include_hoisted_declarations() {
        let names = parse_with(
            "const a = 1; function helper() {} class Model {} if (x) { const nested = 2; }",
            scope_bindings,
        );
        assert_eq!(names, vec!["a", "helper", "Model"]);
    }

    #[test]
    fn test_referenced_names_include_jsx_and_shorthand() {
        let refs = parse_with(
            "const view = <Card title={title}>{count + 1}</Card>; send({ user });",
            referenced_names,
        );
        for name in ["Card", "title", "count", "send", "user"] {
            assert!(refs.contains(name), "missing {}", name);
        }
        assert!(!refs.contains("view"));
    }

    #[test]
    fn test_is_valid_identifier() {
        assert!(is_valid_identifier("params"));
        assert!(is_valid_identifier("$store"));
        assert!(is_valid_identifier("_x1"));
        assert!(!is_valid_identifier("1abc"));
        assert!(!is_valid_identifier("a-b"));
        assert!(!is_valid_identifier("class"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("a;alert(1)"));
    }
}
