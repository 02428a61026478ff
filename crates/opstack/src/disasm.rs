//! Disassembly of finished images.
//!
//! [`BytecodeImage::instructions`] decodes the instruction stream into
//! structured records for tests and tooling. [`BytecodeImage::dump`] renders
//! the same stream, the handler table and the source map as text, one
//! instruction per line with the values it pops and pushes:
//!
//! ```text
//! root#7 (locals: 1, max stack: 1)
//!   0000  load.constant 0   [-0 +1]  ; 1
//!   0005  store.local 0     [-1 +0]  ; x
//!   0010  load.constant 1   [-0 +1]  ; null
//!   0015  return            [-1 +0]
//! ```

use std::fmt::{self, Write as _};

use crate::bytecode::{BytecodeImage, Opcode, read_u32};

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Instruction {
    pub bci: u32,
    pub name: &'static str,
    pub operands: Vec<u32>,
    /// Operand stack values consumed on the fall-through path.
    pub pops: u32,
    /// Operand stack values produced on the fall-through path.
    pub pushes: u32,
}

/// A run of bytecode attributed to one source section.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct SourceRange {
    pub start_bci: u32,
    pub end_bci: u32,
    pub source_name: String,
    pub char_index: usize,
    pub char_length: usize,
}

impl BytecodeImage {
    /// Decode the instruction stream. Decoding stops at the first byte that
    /// is not a valid instruction.
    pub fn instructions(&self) -> Vec<Instruction> {
        let mut out = Vec::new();
        let mut bci = 0;
        while bci < self.code.len() {
            let Some(op) = Opcode::from_byte(self.code[bci]) else {
                break;
            };
            let operand = if op.has_operand() {
                let Some(v) = read_u32(&self.code, bci + 1) else {
                    break;
                };
                Some(v)
            } else {
                None
            };
            let (pops, pushes) = op.stack_io(operand.unwrap_or(0));
            out.push(Instruction {
                bci: bci as u32,
                name: op.name(),
                operands: operand.into_iter().collect(),
                pops,
                pushes,
            });
            bci += op.length();
        }
        out
    }

    pub fn source_ranges(&self) -> Vec<SourceRange> {
        self.source_map
            .iter()
            .map(|e| SourceRange {
                start_bci: e.start_bci,
                end_bci: e.end_bci,
                source_name: e.section.source().name().to_string(),
                char_index: e.section.char_index(),
                char_length: e.section.char_length(),
            })
            .collect()
    }

    /// Human-readable listing of the image.
    pub fn dump(&self) -> String {
        self.to_string()
    }

    fn annotation(&self, instr: &Instruction) -> Option<String> {
        let operand = *instr.operands.first()?;
        match instr.name {
            "load.constant" => self.constants.get(operand as usize).map(|c| c.to_string()),
            "load.local" | "store.local" => self
                .local_names
                .get(operand as usize)
                .and_then(|n| n.clone()),
            "invoke" => Some(format!("{} arg(s)", operand)),
            _ => None,
        }
    }
}

impl fmt::Display for BytecodeImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} (locals: {}, max stack: {})",
            self.name, self.num_locals, self.max_stack
        )?;
        for instr in self.instructions() {
            let mut head = format!("  {:04}  {}", instr.bci, instr.name);
            for operand in &instr.operands {
                let _ = write!(head, " {}", operand);
            }
            let line = format!("{:<25} [-{} +{}]", head, instr.pops, instr.pushes);
            match self.annotation(&instr) {
                Some(note) => writeln!(f, "{:<34} ; {}", line, note)?,
                None => writeln!(f, "{}", line)?,
            }
        }

        if !self.handlers.is_empty() {
            writeln!(f, "handlers:")?;
            for h in &self.handlers {
                write!(
                    f,
                    "  [{:04}, {:04}) -> {:04}  depth {}",
                    h.start_bci, h.end_bci, h.handler_bci, h.stack_depth
                )?;
                match h.exception_slot {
                    Some(slot) => writeln!(f, "  slot {}", slot)?,
                    None => writeln!(f)?,
                }
            }
        }

        if !self.source_map.is_empty() {
            writeln!(f, "sources:")?;
            for r in self.source_ranges() {
                writeln!(
                    f,
                    "  [{:04}, {:04}) {}:{}+{}",
                    r.start_bci, r.end_bci, r.source_name, r.char_index, r.char_length
                )?;
            }
        }
        Ok(())
    }
}
