//! Instruction set and the finished bytecode image.
//!
//! Instructions are encoded as a one-byte opcode, optionally followed by a
//! single little-endian `u32` operand. Branch operands are absolute bcis.

use crate::source::SourceSection;
use crate::value::Value;

// ---------------------------------------------------------------------------
// Opcodes
// ---------------------------------------------------------------------------

/// A single opcode byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Nop = 0x00,
    /// Discard TOS.
    Pop = 0x01,
    /// Duplicate TOS.
    Dup = 0x02,
    /// Push `constants[operand]`.
    LoadConstant = 0x10,
    /// Push argument `operand`, or null if the caller supplied fewer.
    LoadArgument = 0x11,
    /// Push the value of frame slot `operand`.
    LoadLocal = 0x12,
    /// Pop TOS into frame slot `operand`.
    StoreLocal = 0x13,
    /// Jump to `operand`.
    Branch = 0x20,
    /// Pop TOS; jump to `operand` if it is falsy.
    BranchFalse = 0x21,
    /// If TOS is falsy jump to `operand` keeping it, otherwise pop it.
    ScAnd = 0x22,
    /// If TOS is truthy jump to `operand` keeping it, otherwise pop it.
    ScOr = 0x23,
    /// Pop TOS and return it to the caller.
    Return = 0x30,
    /// Pop TOS and throw it.
    Throw = 0x31,
    /// Pop TOS and suspend; the resume value is pushed in its place.
    Yield = 0x32,
    Add = 0x40,
    LessThan = 0x41,
    NonNull = 0x42,
    /// Pop `operand` arguments and a callee below them; push the result.
    Invoke = 0x50,
}

impl Opcode {
    pub const ALL: [Opcode; 18] = [
        Opcode::Nop,
        Opcode::Pop,
        Opcode::Dup,
        Opcode::LoadConstant,
        Opcode::LoadArgument,
        Opcode::LoadLocal,
        Opcode::StoreLocal,
        Opcode::Branch,
        Opcode::BranchFalse,
        Opcode::ScAnd,
        Opcode::ScOr,
        Opcode::Return,
        Opcode::Throw,
        Opcode::Yield,
        Opcode::Add,
        Opcode::LessThan,
        Opcode::NonNull,
        Opcode::Invoke,
    ];

    pub const fn byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|op| op.byte() == b)
    }

    /// The name shown by the disassembler.
    pub const fn name(self) -> &'static str {
        match self {
            Opcode::Nop => "nop",
            Opcode::Pop => "pop",
            Opcode::Dup => "dup",
            Opcode::LoadConstant => "load.constant",
            Opcode::LoadArgument => "load.argument",
            Opcode::LoadLocal => "load.local",
            Opcode::StoreLocal => "store.local",
            Opcode::Branch => "branch",
            Opcode::BranchFalse => "branch.false",
            Opcode::ScAnd => "sc.and",
            Opcode::ScOr => "sc.or",
            Opcode::Return => "return",
            Opcode::Throw => "throw",
            Opcode::Yield => "yield",
            Opcode::Add => "add",
            Opcode::LessThan => "less.than",
            Opcode::NonNull => "non.null",
            Opcode::Invoke => "invoke",
        }
    }

    pub const fn has_operand(self) -> bool {
        matches!(
            self,
            Opcode::LoadConstant
                | Opcode::LoadArgument
                | Opcode::LoadLocal
                | Opcode::StoreLocal
                | Opcode::Branch
                | Opcode::BranchFalse
                | Opcode::ScAnd
                | Opcode::ScOr
                | Opcode::Invoke
        )
    }

    /// Whether the operand is a bci that must be patched once known.
    pub const fn is_branch(self) -> bool {
        matches!(
            self,
            Opcode::Branch | Opcode::BranchFalse | Opcode::ScAnd | Opcode::ScOr
        )
    }

    /// Encoded size in bytes.
    pub const fn length(self) -> usize {
        if self.has_operand() { 5 } else { 1 }
    }

    /// Values popped and pushed on the fall-through path, as `(pops, pushes)`.
    pub fn stack_io(self, operand: u32) -> (u32, u32) {
        match self {
            Opcode::Nop | Opcode::Branch => (0, 0),
            Opcode::LoadConstant | Opcode::LoadArgument | Opcode::LoadLocal => (0, 1),
            Opcode::Dup => (1, 2),
            Opcode::Yield | Opcode::NonNull => (1, 1),
            Opcode::Pop
            | Opcode::StoreLocal
            | Opcode::BranchFalse
            | Opcode::ScAnd
            | Opcode::ScOr
            | Opcode::Return
            | Opcode::Throw => (1, 0),
            Opcode::Add | Opcode::LessThan => (2, 1),
            Opcode::Invoke => (operand.saturating_add(1), 1),
        }
    }

    /// Net change to the operand stack depth on the fall-through path.
    pub(crate) fn stack_effect(self, operand: u32) -> i64 {
        let (pops, pushes) = self.stack_io(operand);
        pushes as i64 - pops as i64
    }
}

pub(crate) fn read_u32(code: &[u8], at: usize) -> Option<u32> {
    let bytes = code.get(at..at + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub(crate) fn write_u32(code: &mut [u8], at: usize, value: u32) {
    code[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

// ---------------------------------------------------------------------------
// Handler table and source map
// ---------------------------------------------------------------------------

/// One row of the exception handler table.
///
/// An exception raised at a bci in `[start_bci, end_bci)` resets the operand
/// stack to `stack_depth`, stores the exception in `exception_slot` (if any)
/// and continues at `handler_bci`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ExceptionHandlerEntry {
    pub start_bci: u32,
    pub end_bci: u32,
    pub handler_bci: u32,
    pub exception_slot: Option<u32>,
    pub stack_depth: u32,
}

impl ExceptionHandlerEntry {
    pub fn covers(&self, bci: usize) -> bool {
        (self.start_bci as usize) <= bci && bci < (self.end_bci as usize)
    }
}

/// A run of bytecode attributed to one source section.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SourceMapEntry {
    pub start_bci: u32,
    pub end_bci: u32,
    pub section: SourceSection,
}

// ---------------------------------------------------------------------------
// Bytecode image
// ---------------------------------------------------------------------------

/// The finished, immutable output of building one root.
///
/// Images are shared through `Arc` for execution. Cloning one makes an
/// independent deep copy that disassembles identically.
#[derive(Debug, Clone)]
pub struct BytecodeImage {
    pub(crate) name: String,
    pub(crate) code: Vec<u8>,
    pub(crate) constants: Vec<Value>,
    pub(crate) handlers: Vec<ExceptionHandlerEntry>,
    pub(crate) num_locals: u32,
    pub(crate) max_stack: u32,
    pub(crate) local_names: Vec<Option<String>>,
    pub(crate) source_map: Vec<SourceMapEntry>,
    pub(crate) section: Option<SourceSection>,
}

impl BytecodeImage {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The raw encoded instruction stream.
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn constants(&self) -> &[Value] {
        &self.constants
    }

    /// The handler table in registration order.
    pub fn exception_handlers(&self) -> &[ExceptionHandlerEntry] {
        &self.handlers
    }

    /// Number of frame slots reserved for locals, user and internal.
    pub fn num_locals(&self) -> u32 {
        self.num_locals
    }

    /// Deepest operand stack the builder computed for this root.
    pub fn max_stack(&self) -> u32 {
        self.max_stack
    }

    /// The first outermost source section entered while building the root.
    pub fn source_section(&self) -> Option<&SourceSection> {
        self.section.as_ref()
    }

    /// The innermost source section active when the instruction covering
    /// `bci` was emitted.
    pub fn source_section_at(&self, bci: usize) -> Option<&SourceSection> {
        self.source_map
            .iter()
            .find(|e| (e.start_bci as usize) <= bci && bci < (e.end_bci as usize))
            .map(|e| &e.section)
    }
}
