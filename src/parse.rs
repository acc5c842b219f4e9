//! Parse Module for the Duet compiler
//!
//! Thin adapter over the oxc parser. Every span consumer goes through a
//! [`SpanOffset`] captured once per file, so spans handed to the analyzers are
//! always relative to the file text exactly as it was read from disk.

use oxc_allocator::Allocator;
use oxc_ast::ast::Program;
use oxc_parser::Parser;
use oxc_span::{SourceType, Span};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{CompilerError, SourceLocation, ERR_PARSE};

const BYTE_ORDER_MARK: char = '\u{feff}';

// ═══════════════════════════════════════════════════════════════════════════════
// SPANS
// ═══════════════════════════════════════════════════════════════════════════════

/// Byte range into a single file's text. `start <= end` always holds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct CodeSpan {
    pub start: u32,
    pub end: u32,
}

impl CodeSpan {
    pub fn new(start: u32, end: u32) -> Self {
        if start <= end {
            CodeSpan { start, end }
        } else {
            CodeSpan {
                start: end,
                end: start,
            }
        }
    }

    pub fn empty_at(pos: u32) -> Self {
        CodeSpan {
            start: pos,
            end: pos,
        }
    }

    pub fn len(&self) -> u32 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, other: &CodeSpan) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Slice `source` by this span. Out-of-range spans yield an empty string.
    pub fn slice<'s>(&self, source: &'s str) -> &'s str {
        source
            .get(self.start as usize..self.end as usize)
            .unwrap_or("")
    }
}

/// Translation from parser-relative spans to file-relative spans.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpanOffset {
    base: u32,
}

impl SpanOffset {
    pub fn new(base: u32) -> Self {
        SpanOffset { base }
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn span(&self, span: Span) -> CodeSpan {
        CodeSpan::new(span.start + self.base, span.end + self.base)
    }

    pub fn pos(&self, pos: u32) -> u32 {
        pos + self.base
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PARSING
// ═══════════════════════════════════════════════════════════════════════════════

pub struct ParsedSource<'a> {
    pub program: Program<'a>,
    pub offset: SpanOffset,
}

pub fn source_type_for(path: &Path) -> SourceType {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("tsx")
        .to_ascii_lowercase();

    let source_type = SourceType::default().with_module(true);
    match ext.as_str() {
        // JSX stays off for plain .ts so generic arrows `<T>(x: T) => x` parse
        "ts" | "mts" | "cts" => source_type.with_typescript(true),
        "tsx" => source_type.with_typescript(true).with_jsx(true),
        _ => source_type.with_jsx(true),
    }
}

/// Parse a whole file. The first syntax error is reported with file and position.
pub fn parse_source<'a>(
    allocator: &'a Allocator,
    source: &'a str,
    path: &Path,
) -> Result<ParsedSource<'a>, CompilerError> {
    let (text, offset) = match source.strip_prefix(BYTE_ORDER_MARK) {
        Some(rest) => (rest, SpanOffset::new(BYTE_ORDER_MARK.len_utf8() as u32)),
        None => (source, SpanOffset::default()),
    };

    let ret = Parser::new(allocator, text, source_type_for(path)).parse();

    if let Some(error) = ret.errors.first() {
        let relative = error
            .labels
            .as_ref()
            .and_then(|labels| labels.first())
            .map(|label| label.offset())
            .unwrap_or(0);
        let location = SourceLocation::from_offset(source, offset.pos(relative as u32) as usize);
        return Err(CompilerError::at(
            ERR_PARSE,
            &format!("Failed to parse module: {}", error),
            &path.to_string_lossy(),
            location,
        ));
    }

    if ret.panicked {
        return Err(CompilerError::new(
            ERR_PARSE,
            "Parser aborted before reaching the end of the module.",
            &path.to_string_lossy(),
            1,
            1,
        ));
    }

    Ok(ParsedSource {
        program: ret.program,
        offset,
    })
}
