//! Source location metadata attached to AST nodes by the (external) parser.
//!
//! The core never produces a `SourceSpan` itself; it only carries the ones
//! handed to it so that errors can be reported with line context.

/// A half-open range of lines in the original source text, plus the line
/// the range starts on. Mirrors the shape of source maps used elsewhere in
/// this pipeline's tooling (one start line + a line count).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct SourceSpan {
    pub start_line: u32,
    pub line_count: u32,
}

impl SourceSpan {
    pub fn new(start_line: u32, line_count: u32) -> SourceSpan {
        SourceSpan {
            start_line,
            line_count,
        }
    }

    /// A span with no useful location, used for synthesized AST nodes
    /// (compiler-generated temporaries, desugared scopes) that have no
    /// corresponding source text.
    pub fn synthetic() -> SourceSpan {
        SourceSpan::default()
    }
}

impl std::fmt::Display for SourceSpan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.line_count <= 1 {
            write!(f, "line {}", self.start_line)
        } else {
            write!(
                f,
                "lines {}-{}",
                self.start_line,
                self.start_line + self.line_count - 1
            )
        }
    }
}
