//! Source-annotated rendering of build errors.
//!
//! A [`Diagnostic`] prints the message, the source lines a build error was
//! raised in, an underline under the offending section and trailing notes:
//!
//! ```text
//! error: Branch cannot be emitted in the middle of an operation.
//!   |
//! 1 | return 1 + jump
//!   |            ^^^^ while building this section
//!   |
//!   = note: in source `demo.src`
//! ```
//!
//! Offsets are character indices, matching [`SourceSection`](crate::SourceSection).

use std::collections::BTreeMap;
use std::fmt;

/// A half-open range of character indices into a source text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }
}

/// A message attached to a span.
#[derive(Debug, Clone)]
pub struct Label {
    pub span: Span,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub message: String,
    /// Full text of the source the labels point into.
    pub source: String,
    pub labels: Vec<Label>,
    pub notes: Vec<String>,
}

impl Diagnostic {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: String::new(),
            labels: Vec::new(),
            notes: Vec::new(),
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_label(mut self, span: Span, message: impl Into<String>) -> Self {
        self.labels.push(Label {
            span,
            message: message.into(),
        });
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    /// 1-based line and column of a character index.
    fn line_col(&self, index: usize) -> (usize, usize) {
        let mut line = 1;
        let mut col = 1;
        for ch in self.source.chars().take(index) {
            if ch == '\n' {
                line += 1;
                col = 1;
            } else {
                col += 1;
            }
        }
        (line, col)
    }

    fn line(&self, line: usize) -> &str {
        self.source.lines().nth(line - 1).unwrap_or("")
    }

    fn gutter_width(&self) -> usize {
        self.source.lines().count().max(1).to_string().len()
    }

    fn write_notes(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for note in &self.notes {
            writeln!(f, "  = note: {}", note)?;
        }
        Ok(())
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "error: {}", self.message)?;
        if self.source.is_empty() || self.labels.is_empty() {
            return self.write_notes(f);
        }

        let width = self.gutter_width();
        let mut by_line: BTreeMap<usize, Vec<&Label>> = BTreeMap::new();
        for label in &self.labels {
            by_line
                .entry(self.line_col(label.span.start).0)
                .or_default()
                .push(label);
        }

        writeln!(f, "{:width$} |", "", width = width)?;
        for (&line, labels) in &by_line {
            writeln!(f, "{:width$} | {}", line, self.line(line), width = width)?;
            for label in labels {
                let (_, start_col) = self.line_col(label.span.start);
                let (end_line, end_col) = self.line_col(label.span.end);
                // Sections spanning lines are underlined to the end of the first.
                let len = if end_line == line {
                    end_col.saturating_sub(start_col).max(1)
                } else {
                    self.line(line).chars().count().saturating_sub(start_col - 1).max(1)
                };
                write!(f, "{:width$} | {:pad$}", "", "", width = width, pad = start_col - 1)?;
                write!(f, "{}", "^".repeat(len))?;
                if !label.message.is_empty() {
                    write!(f, " {}", label.message)?;
                }
                writeln!(f)?;
            }
        }
        writeln!(f, "{:width$} |", "", width = width)?;
        self.write_notes(f)
    }
}
