#[cfg(feature = "napi")]
use napi_derive::napi;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

// ═══════════════════════════════════════════════════════════════════════════════
// ERROR CODES
// ═══════════════════════════════════════════════════════════════════════════════

pub const ERR_PARSE: &str = "DUET-ERR-PARSE";
pub const ERR_STREAM_COLLISION: &str = "DUET-ERR-STREAM-COLLISION";
pub const ERR_INVALID_IDENTIFIER: &str = "DUET-ERR-IDENT";
pub const ERR_EXPORT_COLLISION: &str = "DUET-ERR-EXPORT-COLLISION";
pub const ERR_READ: &str = "DUET-ERR-READ";

// ═══════════════════════════════════════════════════════════════════════════════
// GUARANTEES
// ═══════════════════════════════════════════════════════════════════════════════

fn get_guarantee(code: &str) -> &'static str {
    match code {
        ERR_PARSE => "Every emitted module originates from a source file that parsed cleanly.",
        ERR_STREAM_COLLISION => {
            "Every stream ID is unique across the build and stable across rebuilds."
        }
        ERR_INVALID_IDENTIFIER => "Generated source only splices validated identifiers.",
        ERR_EXPORT_COLLISION => {
            "Hydration entry names never collide when routes are bundled together."
        }
        ERR_READ => "Every discovered source file is readable as UTF-8.",
        _ => "Unknown invariant.",
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SOURCE LOCATION
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[cfg_attr(feature = "napi", napi(object))]
#[serde(rename_all = "camelCase")]
pub struct SourceLocation {
    pub line: u32,
    pub column: u32,
}

impl SourceLocation {
    /// 1-based line/column for a byte offset into `source`.
    pub fn from_offset(source: &str, offset: usize) -> Self {
        let offset = offset.min(source.len());
        let mut line = 1;
        let mut line_start = 0;
        for (idx, byte) in source.as_bytes()[..offset].iter().enumerate() {
            if *byte == b'\n' {
                line += 1;
                line_start = idx + 1;
            }
        }
        let column = source[line_start..offset].chars().count() as u32 + 1;
        SourceLocation { line, column }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// COMPILER ERROR
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "napi", napi(object))]
#[serde(rename_all = "camelCase")]
pub struct CompilerError {
    pub code: String,
    pub message: String,
    pub guarantee: String,
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub context: Option<String>,
    pub hints: Vec<String>,
}

impl CompilerError {
    pub fn new(code: &str, message: &str, file: &str, line: u32, column: u32) -> Self {
        Self::with_details(code, message, file, line, column, None, vec![])
    }

    pub fn at(code: &str, message: &str, file: &str, location: SourceLocation) -> Self {
        Self::new(code, message, file, location.line, location.column)
    }

    pub fn with_details(
        code: &str,
        message: &str,
        file: &str,
        line: u32,
        column: u32,
        context: Option<String>,
        hints: Vec<String>,
    ) -> Self {
        CompilerError {
            code: code.to_string(),
            message: message.to_string(),
            guarantee: get_guarantee(code).to_string(),
            file: file.to_string(),
            line,
            column,
            context,
            hints,
        }
    }
}

impl fmt::Display for CompilerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} ({}:{}:{})",
            self.code, self.message, self.file, self.line, self.column
        )?;
        if let Some(context) = &self.context {
            write!(f, "\n  {}", context)?;
        }
        for hint in &self.hints {
            write!(f, "\n  hint: {}", hint)?;
        }
        Ok(())
    }
}

impl std::error::Error for CompilerError {}

// ═══════════════════════════════════════════════════════════════════════════════
// BUILD ERROR
// ═══════════════════════════════════════════════════════════════════════════════

/// Failures that abort a whole build pass.
///
/// Per-file problems (a file that fails to parse) are not represented here; they are
/// collected as [`CompilerError`] diagnostics on the build report instead.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{0}")]
    Compiler(CompilerError),

    #[error("invalid config {path}: {reason}")]
    Config { path: PathBuf, reason: String },

    #[error("failed to serialize build manifest: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("file watcher error: {0}")]
    Watch(#[from] notify::Error),
}

impl BuildError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BuildError::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<CompilerError> for BuildError {
    fn from(err: CompilerError) -> Self {
        BuildError::Compiler(err)
    }
}
