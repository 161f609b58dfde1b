//! Source locations and user-facing diagnostics.
//!
//! Every compiled instruction carries a [`Span`] so that runtime faults can be
//! reported against the original source even though the AST is long gone at
//! execution time. [`Diagnostic`] is the rendered form the driver prints: a
//! severity header, the source line with an underline, and optional notes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A point in a source file. Both `line` and `column` are 1-based; `index` is
/// the 0-based byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Loc {
    pub line: usize,
    pub column: usize,
    pub index: usize,
}

impl Loc {
    pub fn new(line: usize, column: usize, index: usize) -> Self {
        Self {
            line,
            column,
            index,
        }
    }

    /// The first position of a file.
    pub fn start() -> Self {
        Self {
            line: 1,
            column: 1,
            index: 0,
        }
    }
}

/// An inclusive source range inside one module file.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Span {
    pub start: Loc,
    pub end: Loc,
    pub filename: String,
}

impl Span {
    pub fn new(start: Loc, end: Loc, filename: impl Into<String>) -> Self {
        Self {
            start,
            end,
            filename: filename.into(),
        }
    }

    /// A placeholder span for synthesized code (prologues, relocation glue).
    pub fn internal(filename: impl Into<String>) -> Self {
        Self {
            start: Loc::start(),
            end: Loc::start(),
            filename: filename.into(),
        }
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.filename, self.start.line, self.start.column
        )
    }
}

/// Severity of a rendered diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Hint,
    Info,
    Warning,
    Error,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Hint => write!(f, "hint"),
            Level::Info => write!(f, "info"),
            Level::Warning => write!(f, "warning"),
            Level::Error => write!(f, "error"),
        }
    }
}

/// A renderable message attached to a source span.
///
/// The VM produces these for runtime faults; the driver resolves the module
/// source (via the executor) and calls [`Diagnostic::render`] to obtain the
/// snippet form.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub level: Level,
    pub message: String,
    pub span: Span,
    pub notes: Vec<String>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>, span: Span) -> Self {
        Self {
            level: Level::Error,
            message: message.into(),
            span,
            notes: Vec::new(),
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    /// Render the diagnostic against the module source.
    ///
    /// Produces the header, the offending source line with a `^^^` underline,
    /// and any notes. When the span's line is missing from `source` (e.g. the
    /// host could not resolve the module), only the header and notes are
    /// rendered.
    pub fn render(&self, source: &str) -> String {
        let mut out = format!("{}: {}\n", self.level, self.message);

        if let Some(line) = source.lines().nth(self.span.start.line.saturating_sub(1)) {
            let width = self.span.start.line.to_string().len().max(1);
            out.push_str(&format!(
                " --> {}:{}:{}\n",
                self.span.filename, self.span.start.line, self.span.start.column
            ));
            out.push_str(&format!("{:width$} |\n", "", width = width));
            out.push_str(&format!(
                "{:width$} | {}\n",
                self.span.start.line,
                line,
                width = width
            ));

            let underline_len = if self.span.end.line == self.span.start.line {
                (self.span.end.column + 1).saturating_sub(self.span.start.column)
            } else {
                line.chars()
                    .count()
                    .saturating_sub(self.span.start.column.saturating_sub(1))
            }
            .max(1);
            out.push_str(&format!(
                "{:width$} | {:pad$}{}\n",
                "",
                "",
                "^".repeat(underline_len),
                width = width,
                pad = self.span.start.column.saturating_sub(1)
            ));
            out.push_str(&format!("{:width$} |\n", "", width = width));
        }

        for note in &self.notes {
            out.push_str(&format!("  = note: {}\n", note));
        }

        out
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} [{}]", self.level, self.message, self.span)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_with_source() {
        let span = Span::new(Loc::new(2, 5, 10), Loc::new(2, 8, 13), "main.hms");
        let diag = Diagnostic::error("division by zero", span).with_note("core 0 faulted");

        let rendered = diag.render("let a = 1;\nlet b = a / 0;\n");
        assert!(rendered.contains("error: division by zero"));
        assert!(rendered.contains("main.hms:2:5"));
        assert!(rendered.contains("let b = a / 0;"));
        assert!(rendered.contains("^^^^"));
        assert!(rendered.contains("note: core 0 faulted"));
    }

    #[test]
    fn test_render_without_source() {
        let diag = Diagnostic::error("boom", Span::default());
        let rendered = diag.render("");
        assert!(rendered.starts_with("error: boom"));
        assert!(!rendered.contains("-->"));
    }
}
