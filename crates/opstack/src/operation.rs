//! Operation kinds and the child shape each one accepts.

use std::fmt;

/// The kind tag of a pending operation on the builder stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum OperationKind {
    Root,
    Block,
    IfThen,
    IfThenElse,
    Conditional,
    While,
    TryCatch,
    FinallyTry,
    FinallyTryCatch,
    ScAnd,
    ScOr,
    Yield,
    Return,
    Throw,
    Add,
    LessThan,
    NonNull,
    StoreLocal,
    TeeLocal,
    Invoke,
    Source,
    SourceSection,
    /// A relocated copy of a finally handler being spliced in. Only the
    /// builder opens and closes it.
    #[doc(hidden)]
    FinallyHandler,
}

/// How many children an operation takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Arity {
    Exact(usize),
    AtLeast(usize),
}

/// Whether the child at a position must leave a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Slot {
    Value,
    Any,
}

/// Whether the finished operation leaves a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Produces {
    Never,
    Always,
    /// Whatever its last child does.
    LastChild,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Shape {
    pub arity: Arity,
    /// Per-position rule; positions past the end reuse the last entry.
    pub slots: &'static [Slot],
    pub produces: Produces,
}

const ANY: &[Slot] = &[Slot::Any];
const VALUE: &[Slot] = &[Slot::Value];
const VALUE_ANY: &[Slot] = &[Slot::Value, Slot::Any];

impl OperationKind {
    pub const fn name(self) -> &'static str {
        match self {
            OperationKind::Root => "Root",
            OperationKind::Block => "Block",
            OperationKind::IfThen => "IfThen",
            OperationKind::IfThenElse => "IfThenElse",
            OperationKind::Conditional => "Conditional",
            OperationKind::While => "While",
            OperationKind::TryCatch => "TryCatch",
            OperationKind::FinallyTry => "FinallyTry",
            OperationKind::FinallyTryCatch => "FinallyTryCatch",
            OperationKind::ScAnd => "ScAnd",
            OperationKind::ScOr => "ScOr",
            OperationKind::Yield => "Yield",
            OperationKind::Return => "Return",
            OperationKind::Throw => "Throw",
            OperationKind::Add => "Add",
            OperationKind::LessThan => "LessThan",
            OperationKind::NonNull => "NonNull",
            OperationKind::StoreLocal => "StoreLocal",
            OperationKind::TeeLocal => "TeeLocal",
            OperationKind::Invoke => "Invoke",
            OperationKind::Source => "Source",
            OperationKind::SourceSection => "SourceSection",
            OperationKind::FinallyHandler => "FinallyHandler",
        }
    }

    pub(crate) const fn shape(self) -> Shape {
        use OperationKind::*;
        let (arity, slots, produces) = match self {
            Root | FinallyHandler => (Arity::AtLeast(0), ANY, Produces::Never),
            Block | Source | SourceSection => (Arity::AtLeast(0), ANY, Produces::LastChild),
            IfThen | While => (Arity::Exact(2), VALUE_ANY, Produces::Never),
            IfThenElse => (Arity::Exact(3), VALUE_ANY, Produces::Never),
            Conditional => (Arity::Exact(3), VALUE, Produces::Always),
            TryCatch | FinallyTryCatch => (Arity::Exact(2), ANY, Produces::Never),
            FinallyTry => (Arity::Exact(1), ANY, Produces::Never),
            ScAnd | ScOr | Invoke => (Arity::AtLeast(1), VALUE, Produces::Always),
            Return | Throw | StoreLocal => (Arity::Exact(1), VALUE, Produces::Never),
            Yield | TeeLocal | NonNull => (Arity::Exact(1), VALUE, Produces::Always),
            Add | LessThan => (Arity::Exact(2), VALUE, Produces::Always),
        };
        Shape {
            arity,
            slots,
            produces,
        }
    }

    /// Whether the child at `position` must produce a value.
    pub(crate) fn requires_value(self, position: usize) -> bool {
        let slots = self.shape().slots;
        let slot = slots.get(position).or(slots.last()).copied();
        slot == Some(Slot::Value)
    }

    /// Validate the final child count.
    pub(crate) fn check_arity(self, count: usize) -> Result<(), String> {
        match self.shape().arity {
            Arity::Exact(n) if n != count => Err(format!(
                "Operation {} expected exactly {} children, but {} provided.",
                self.name(),
                n,
                count
            )),
            Arity::AtLeast(n) if count < n => Err(format!(
                "Operation {} expected at least {} child(ren), but {} provided.",
                self.name(),
                n,
                count
            )),
            _ => Ok(()),
        }
    }

    /// Whether the finished operation leaves a value.
    pub(crate) fn produces_value(self, last_child_produced: bool) -> bool {
        match self.shape().produces {
            Produces::Never => false,
            Produces::Always => true,
            Produces::LastChild => last_child_produced,
        }
    }

    /// Block-like operations pop the value of every child but the last.
    pub(crate) fn is_block_like(self) -> bool {
        matches!(
            self,
            OperationKind::Root
                | OperationKind::Block
                | OperationKind::Source
                | OperationKind::SourceSection
                | OperationKind::FinallyHandler
        )
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
