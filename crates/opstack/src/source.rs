//! Guest source text and the sections of it that bytecode maps back to.

use std::sync::Arc;

use crate::diagnostic::Span;

/// A named unit of guest source text.
#[derive(Debug, PartialEq, Eq)]
pub struct Source {
    name: String,
    text: String,
}

impl Source {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            text: text.into(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

/// A character range inside a [`Source`].
///
/// Two sections are equal when they point into the *same* source object
/// (by identity) at the same range.
#[derive(Debug, Clone)]
pub struct SourceSection {
    source: Arc<Source>,
    offset: usize,
    length: usize,
}

impl SourceSection {
    pub fn new(source: Arc<Source>, offset: usize, length: usize) -> Self {
        Self {
            source,
            offset,
            length,
        }
    }

    pub fn source(&self) -> &Arc<Source> {
        &self.source
    }

    pub fn char_index(&self) -> usize {
        self.offset
    }

    pub fn char_length(&self) -> usize {
        self.length
    }

    /// The section's text, or an empty string if the range is out of bounds.
    pub fn characters(&self) -> &str {
        let text = self.source.text();
        let Some(end) = self.offset.checked_add(self.length) else {
            return "";
        };
        match (byte_offset(text, self.offset), byte_offset(text, end)) {
            (Some(start), Some(end)) => &text[start..end],
            _ => "",
        }
    }

    pub(crate) fn span(&self) -> Span {
        Span::new(self.offset, self.offset.saturating_add(self.length))
    }
}

/// Byte position of character `index`; `index` may be one past the last
/// character.
fn byte_offset(text: &str, index: usize) -> Option<usize> {
    text.char_indices()
        .map(|(at, _)| at)
        .chain(std::iter::once(text.len()))
        .nth(index)
}

impl PartialEq for SourceSection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.source, &other.source)
            && self.offset == other.offset
            && self.length == other.length
    }
}
