use std::fs;
use std::path::{Path, PathBuf};

use crate::analyze::DeclarationKind;
use crate::discovery::SpecialFileKind;
use crate::error::{BuildError, ERR_EXPORT_COLLISION, ERR_PARSE};
use crate::manifest::{BuildManifest, MANIFEST_FILE_NAME};
use crate::options::{BuildMode, CompileOptions};
use crate::pipeline::Compiler;

struct Project {
    _dir: tempfile::TempDir,
    src: PathBuf,
    out: PathBuf,
}

impl Project {
    fn new(files: &[(&str, &str)]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let out = dir.path().join("dist");
        let project = Project { _dir: dir, src, out };
        for (rel, content) in files {
            project.write(rel, content);
        }
        project
    }

    fn write(&self, rel: &str, content: &str) {
        let path = self.src.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn options(&self) -> CompileOptions {
        CompileOptions {
            src_dir: self.src.clone(),
            out_dir: self.out.clone(),
            ..CompileOptions::default()
        }
    }

    fn read_out(&self, rel: &str) -> String {
        fs::read_to_string(self.out.join(rel)).unwrap()
    }
}

const GREETING_PAGE: &str = r#"export default async function Page({ user }) {
  const greeting = `Hello, ${user.name}`;
  return () => <h1>{greeting}</h1>;
}
"#;

fn route<'m>(manifest: &'m BuildManifest, source_file: &str) -> &'m crate::manifest::RouteEntry {
    manifest
        .routes
        .iter()
        .find(|r| r.source_file == source_file)
        .unwrap()
}

#[test]
fn test_client_receives_only_shared_values() {
    let project = Project::new(&[("page.tsx", GREETING_PAGE)]);
    let report = Compiler::new(project.options()).build().unwrap();

    assert!(report.diagnostics.is_empty());
    let entry = route(&report.manifest, "page.tsx");
    assert_eq!(entry.url_pattern, "/");
    assert_eq!(entry.hydrate_props, vec!["greeting"]);
    assert!(entry.has_loader);

    let server = project.read_out(&entry.server_module);
    assert!(server.contains("export async function loader({ user })"));
    assert!(server.contains("const greeting = `Hello, ${user.name}`;"));
    assert!(server.contains("    greeting,\n"));
    assert!(server.contains("export function render(data)"));

    let client = project.read_out(entry.client_module.as_deref().unwrap());
    assert!(client.contains("export function Component({ greeting })"));
    assert!(!client.contains("user"));
    let hydrate = entry.hydrate_export.as_deref().unwrap();
    assert!(client.contains(&format!("export function {}(root, data)", hydrate)));

    let client_entry = project.read_out("client/entry.ts");
    assert!(client_entry.contains(&format!("export {{ {} }}", hydrate)));
    assert!(report.manifest_path.ends_with(MANIFEST_FILE_NAME));
}

#[test]
fn test_parse_error_is_isolated_to_its_file() {
    let project = Project::new(&[
        ("page.tsx", GREETING_PAGE),
        ("broken/page.tsx", "export default function Page( {"),
    ]);
    let report = Compiler::new(project.options()).build().unwrap();

    assert_eq!(report.diagnostics.len(), 1);
    assert_eq!(report.diagnostics[0].code, ERR_PARSE);
    assert!(report.diagnostics[0].file.ends_with("page.tsx"));
    assert_eq!(report.manifest.routes.len(), 1);
    assert_eq!(report.manifest.routes[0].source_file, "page.tsx");
    assert!(project.out.join(MANIFEST_FILE_NAME).exists());
}

#[test]
fn test_incremental_rebuild_follows_imports() {
    let project = Project::new(&[
        ("page.tsx", GREETING_PAGE),
        ("lib/format.ts", "export function shout(s) { return s.toUpperCase(); }\n"),
        (
            "blog/page.tsx",
            "import { shout } from \"../lib/format\";\n\
             export default function Blog() {\n  const title = shout(\"hi\");\n  return () => <h1>{title}</h1>;\n}\n",
        ),
    ]);
    let mut compiler = Compiler::new(project.options());

    let first = compiler.build().unwrap();
    assert_eq!(first.rebuilt.len(), 2);
    assert!(first.reused.is_empty());

    let second = compiler.build().unwrap();
    assert!(second.rebuilt.is_empty());
    assert_eq!(second.reused.len(), 2);
    assert_eq!(second.manifest, first.manifest);

    project.write("lib/format.ts", "export function shout(s) { return s + \"!\"; }\n");
    let third = compiler.build().unwrap();
    assert_eq!(third.rebuilt, vec!["blog/page.tsx"]);
    assert_eq!(third.reused, vec!["page.tsx"]);

    let server = project.read_out(&route(&third.manifest, "blog/page.tsx").server_module);
    assert!(server.contains("import { shout } from"));
    assert!(server.contains("lib/format\";"));
}

#[test]
fn test_streams_become_endpoints() {
    let project = Project::new(&[(
        "chat/[roomId]/page.tsx",
        r#"import { subscribe } from "../../lib/chat";

export default function Room({ params }) {
  const messages = new Stream(() => subscribe(params.roomId));
  return () => <ul>{messages}</ul>;
}
"#,
    )]);
    let report = Compiler::new(project.options()).build().unwrap();

    let entry = route(&report.manifest, "chat/[roomId]/page.tsx");
    assert_eq!(entry.url_pattern, "/chat/:roomId");

    assert_eq!(report.manifest.streams.len(), 1);
    let (id, endpoint) = report.manifest.streams.iter().next().unwrap();
    assert!(id.starts_with("s_"));
    assert_eq!(endpoint.path, format!("/__duet/streams/{}", id));
    assert_eq!(endpoint.params, vec!["params_roomId"]);
    assert_eq!(endpoint.source_file, "chat/[roomId]/page.tsx");

    let handler = project.read_out(&endpoint.module);
    assert!(handler.contains("import { subscribe } from"));
    assert!(handler.contains("const params = { roomId: __query.params_roomId };"));

    let server = project.read_out(&entry.server_module);
    assert!(server.contains(&format!("\"{}\"", id)));
    assert!(server.contains(&format!(
        "captureStream(\"{}\", {{ params_roomId: params.roomId }}, {{}})",
        id
    )));
    assert!(server.contains("restoreStreams(data.__streams)"));

    assert!(!server.contains("    messages,\n"));
    let binding = format!("  const messages = __streams.{};\n", id);
    assert!(server.contains(&format!("function Component({{ __streams }}) {{\n{}", binding)));
    assert!(entry.hydrate_props.is_empty());

    let client = project.read_out(entry.client_module.as_deref().unwrap());
    assert!(client.contains(&format!("export function Component({{ __streams }}) {{\n{}", binding)));
    assert!(client.contains("__streams: restoreStreams(data.__streams)"));
    assert!(!client.contains("subscribe"));
}

#[test]
fn test_stream_handlers_carry_module_helpers() {
    let project = Project::new(&[(
        "rooms/page.tsx",
        r#"function fmt(message) {
  return `[${message}]`;
}

export default function Rooms({ room }) {
  const feed = new Stream(async function* () {
    yield fmt(room);
  });
  return () => <p>{feed}</p>;
}
"#,
    )]);
    let report = Compiler::new(project.options()).build().unwrap();

    let (id, endpoint) = report.manifest.streams.iter().next().unwrap();
    assert_eq!(endpoint.params, vec!["room"]);

    let handler = project.read_out(&endpoint.module);
    assert!(handler.contains("function fmt(message)"));
    assert!(!handler.contains("__query.fmt"));

    let server = project.read_out(&route(&report.manifest, "rooms/page.tsx").server_module);
    assert!(server.contains(&format!("captureStream(\"{}\", {{ room: room }}, {{}})", id)));
    assert!(!server.contains("fmt: "));
}

#[test]
fn test_hydrate_export_collision_aborts_before_writing() {
    let page = "export default function Page() {\n  const n = 1;\n  return () => n;\n}\n";
    let project = Project::new(&[("a/page.tsx", page), ("(marketing)/a/page.tsx", page)]);

    let err = Compiler::new(project.options()).build().unwrap_err();
    match err {
        BuildError::Compiler(err) => assert_eq!(err.code, ERR_EXPORT_COLLISION),
        other => panic!("unexpected error: {}", other),
    }
    assert!(!project.out.join(MANIFEST_FILE_NAME).exists());
    assert!(!project.out.join("client").exists());
}

#[test]
fn test_handlers_layouts_and_chains() {
    let project = Project::new(&[
        ("layout.tsx", "export default function Layout({ children }) {\n  return children;\n}\n"),
        ("middleware.ts", "export default async function auth(req) {\n  return req;\n}\n"),
        ("page.tsx", GREETING_PAGE),
        (
            "api/route.ts",
            "export async function GET({ params }) {\n  return Response.json(params);\n}\n",
        ),
    ]);
    let report = Compiler::new(project.options()).build().unwrap();
    let manifest = &report.manifest;

    assert!(!manifest.layouts["layout.tsx"].has_loader);
    assert!(manifest.middlewares.contains_key("middleware.ts"));

    let page = route(manifest, "page.tsx");
    assert_eq!(page.layout_chain, vec!["layout.tsx"]);
    assert_eq!(page.middleware_chain, vec!["middleware.ts"]);

    let api = route(manifest, "api/route.ts");
    assert_eq!(api.url_pattern, "/api");
    assert_eq!(api.export_name, "GET");
    assert_eq!(api.kind, DeclarationKind::Handler);
    assert_eq!(api.special_file_kind, SpecialFileKind::Route);
    assert!(api.layout_chain.is_empty());
    assert!(api.client_module.is_none());

    let handler = project.read_out(&api.server_module);
    assert!(handler.contains("export async function GET({ params })"));
    assert!(!project.out.join("client").join(Path::new(&api.server_module).file_name().unwrap()).exists());
}

#[test]
fn test_production_inlines_public_env_only() {
    let project = Project::new(&[(
        "page.jsx",
        "export default function Page() {\n  const api = process.env.PUBLIC_API;\n  const secret = process.env.SECRET;\n  return () => api + process.env.SECRET;\n}\n",
    )]);
    let mut options = project.options();
    options.mode = BuildMode::Production;
    options.env.insert("PUBLIC_API".to_string(), "https://api".to_string());
    options.env.insert("SECRET".to_string(), "hunter2".to_string());

    let report = Compiler::new(options).build().unwrap();
    assert_eq!(report.manifest.mode, BuildMode::Production);

    let entry = route(&report.manifest, "page.jsx");
    let client = project.read_out(entry.client_module.as_deref().unwrap());
    assert!(!client.contains("hunter2"));
    assert!(!client.contains("process.env"));

    let server = project.read_out(&entry.server_module);
    assert!(server.contains("https://api"));
    assert!(server.contains("hunter2"));
    assert!(project.read_out("client/entry.js").contains(entry.hydrate_export.as_deref().unwrap()));
}
