use thiserror::Error;

use crate::diagnostic::Diagnostic;
use crate::source::SourceSection;
use crate::value::Value;

/// A structural error raised while building a root.
///
/// Build errors are fatal for the root under construction. The builder that
/// produced one refuses every later call with a clone of the same error.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct BuildError {
    /// Name of the operation that was being built or closed, if any.
    pub operation: Option<&'static str>,
    /// Human-readable reason.
    pub message: String,
    /// Innermost source section active when the error was raised.
    pub section: Option<SourceSection>,
}

impl BuildError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            operation: None,
            message: message.into(),
            section: None,
        }
    }

    pub fn in_operation(operation: &'static str, message: impl Into<String>) -> Self {
        Self {
            operation: Some(operation),
            message: message.into(),
            section: None,
        }
    }

    pub fn with_section(mut self, section: Option<SourceSection>) -> Self {
        if self.section.is_none() {
            self.section = section;
        }
        self
    }

    /// Render this error against the source text it was raised in.
    pub fn to_diagnostic(&self) -> Diagnostic {
        let mut diag = Diagnostic::new(self.message.clone());
        if let Some(section) = &self.section {
            diag = diag
                .with_source(section.source().text())
                .with_label(section.span(), "while building this section")
                .with_note(format!("in source `{}`", section.source().name()));
        }
        if let Some(op) = self.operation {
            diag = diag.with_note(format!("offending operation: {}", op));
        }
        diag
    }
}

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("Build error: {0}")]
    Build(#[from] BuildError),

    /// A guest-level exception. The payload is the thrown value, unmodified.
    #[error("Uncaught exception: {0}")]
    Thrown(Value),

    #[error("Type error: expected {expected}, got {got}")]
    Type { expected: String, got: String },

    #[error("Instruction limit exceeded (limit: {0})")]
    InstructionLimitExceeded(u64),

    #[error("Recursion limit exceeded (limit: {0})")]
    RecursionLimitExceeded(usize),

    #[error("Invalid continuation: {0}")]
    InvalidContinuation(String),
}

impl Error {
    /// The build error, if this is one.
    pub fn as_build(&self) -> Option<&BuildError> {
        match self {
            Error::Build(e) => Some(e),
            _ => None,
        }
    }

    /// The thrown guest value, if this is an uncaught guest exception.
    pub fn thrown_value(&self) -> Option<&Value> {
        match self {
            Error::Thrown(v) => Some(v),
            _ => None,
        }
    }

    /// Whether an exception handler table may intercept this error.
    ///
    /// Resource-limit errors always unwind to the caller of the image.
    pub fn is_catchable(&self) -> bool {
        matches!(self, Error::Thrown(_) | Error::Type { .. })
    }

    /// The value bound to a handler's exception slot when this error is caught.
    pub(crate) fn into_exception_value(self) -> Value {
        match self {
            Error::Thrown(v) => v,
            other => Value::Str(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
