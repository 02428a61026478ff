//! Stack-based bytecode interpreter.
//!
//! Executes [`BytecodeImage`]s with a fetch-decode-execute loop. Each call
//! gets its own [`Frame`]; bytecode-to-bytecode calls recurse on the host
//! stack, bounded by [`ResourceLimits::max_recursion_depth`].
//!
//! Guest exceptions and type faults are routed through the image's handler
//! table. Resource-limit errors are never caught. Inconsistencies in the
//! image itself (stack underflow, unknown opcodes) are bugs in the builder,
//! not guest errors: they are logged and abort with a panic.

use std::sync::Arc;

use tracing::{debug, error, instrument, trace};

use crate::bytecode::{BytecodeImage, ExceptionHandlerEntry, Opcode, read_u32};
use crate::error::{Error, Result};
use crate::limits::ResourceLimits;
use crate::value::Value;

/// The outcome of running an image until it stops.
#[derive(Debug, Clone)]
pub enum Execution {
    Returned(Value),
    /// The image executed a `yield`; resume it with
    /// [`ContinuationResult::continue_with`].
    Suspended(ContinuationResult),
}

impl Execution {
    pub fn into_returned(self) -> Option<Value> {
        match self {
            Execution::Returned(v) => Some(v),
            Execution::Suspended(_) => None,
        }
    }

    pub fn into_suspended(self) -> Option<ContinuationResult> {
        match self {
            Execution::Suspended(c) => Some(c),
            Execution::Returned(_) => None,
        }
    }
}

/// A suspended execution: the yielded value plus a snapshot of the frame.
///
/// The snapshot is owned, so a continuation can be cloned, sent to another
/// thread, and resumed there. Each clone resumes independently.
#[derive(Debug, Clone)]
pub struct ContinuationResult {
    image: Arc<BytecodeImage>,
    frame: Frame,
    yielded: Value,
    budget: Budget,
}

impl ContinuationResult {
    /// The value passed to `yield`.
    pub fn result(&self) -> &Value {
        &self.yielded
    }

    pub fn image(&self) -> &Arc<BytecodeImage> {
        &self.image
    }

    /// Resume execution; `value` becomes the result of the `yield`.
    pub fn continue_with(mut self, value: Value) -> Result<Execution> {
        if self.frame.pc >= self.image.code().len() {
            return Err(Error::InvalidContinuation(format!(
                "resume point {} is outside {}",
                self.frame.pc,
                self.image.name()
            )));
        }
        trace!(root = %self.image.name(), pc = self.frame.pc, "resuming continuation");
        self.frame.push(&self.image, value);
        run(&self.image, &mut self.frame, &mut self.budget, 1)
    }
}

impl BytecodeImage {
    /// Run this image with no resource limits.
    pub fn call(self: &Arc<Self>, args: Vec<Value>) -> Result<Execution> {
        self.call_with_limits(args, &ResourceLimits::default())
    }

    #[instrument(skip_all, name = "call", fields(root = %self.name, args = args.len()))]
    pub fn call_with_limits(
        self: &Arc<Self>,
        args: Vec<Value>,
        limits: &ResourceLimits,
    ) -> Result<Execution> {
        let mut budget = Budget::new(*limits);
        let outcome = execute(self, args, &mut budget, 1);
        debug!(executed = budget.executed, ok = outcome.is_ok(), "call finished");
        outcome
    }
}

// ---------------------------------------------------------------------------
// Frames and budgets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Frame {
    /// bci of the next instruction.
    pc: usize,
    locals: Vec<Value>,
    stack: Vec<Value>,
    args: Vec<Value>,
}

impl Frame {
    fn new(image: &BytecodeImage, args: Vec<Value>) -> Self {
        Self {
            pc: 0,
            locals: vec![Value::Null; image.num_locals() as usize],
            stack: Vec::with_capacity(image.max_stack() as usize),
            args,
        }
    }

    fn push(&mut self, image: &BytecodeImage, value: Value) {
        if self.stack.len() >= image.max_stack() as usize {
            fault(image, self.pc, "operand stack overflow");
        }
        self.stack.push(value);
    }

    fn pop(&mut self, image: &BytecodeImage) -> Value {
        self.stack
            .pop()
            .unwrap_or_else(|| fault(image, self.pc, "operand stack underflow"))
    }

    fn peek(&self, image: &BytecodeImage) -> &Value {
        self.stack
            .last()
            .unwrap_or_else(|| fault(image, self.pc, "operand stack underflow"))
    }

    fn local(&self, image: &BytecodeImage, slot: u32) -> Value {
        self.locals
            .get(slot as usize)
            .cloned()
            .unwrap_or_else(|| fault(image, self.pc, "local slot out of range"))
    }

    fn set_local(&mut self, image: &BytecodeImage, slot: u32, value: Value) {
        match self.locals.get_mut(slot as usize) {
            Some(s) => *s = value,
            None => fault(image, self.pc, "local slot out of range"),
        }
    }
}

/// Instructions executed so far against the configured limits. Shared by
/// every frame of one call.
#[derive(Debug, Clone, Copy)]
struct Budget {
    limits: ResourceLimits,
    executed: u64,
}

impl Budget {
    fn new(limits: ResourceLimits) -> Self {
        Self { limits, executed: 0 }
    }

    fn tick(&mut self) -> Result<()> {
        self.executed += 1;
        if let Some(limit) = self.limits.max_instructions
            && self.executed > limit
        {
            return Err(Error::InstructionLimitExceeded(limit));
        }
        Ok(())
    }

    fn enter(&self, depth: usize) -> Result<()> {
        if let Some(limit) = self.limits.max_recursion_depth
            && depth > limit
        {
            return Err(Error::RecursionLimitExceeded(limit));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// The loop
// ---------------------------------------------------------------------------

enum Flow {
    Next,
    Return(Value),
    Yield(Value),
}

fn execute(
    image: &Arc<BytecodeImage>,
    args: Vec<Value>,
    budget: &mut Budget,
    depth: usize,
) -> Result<Execution> {
    budget.enter(depth)?;
    let mut frame = Frame::new(image, args);
    run(image, &mut frame, budget, depth)
}

fn run(
    image: &Arc<BytecodeImage>,
    frame: &mut Frame,
    budget: &mut Budget,
    depth: usize,
) -> Result<Execution> {
    loop {
        let pc = frame.pc;
        budget.tick()?;
        match dispatch_op(image, frame, budget, depth) {
            Ok(Flow::Next) => {}
            Ok(Flow::Return(value)) => return Ok(Execution::Returned(value)),
            Ok(Flow::Yield(value)) => {
                trace!(root = %image.name(), pc = frame.pc, "suspending at yield");
                return Ok(Execution::Suspended(ContinuationResult {
                    image: image.clone(),
                    frame: frame.clone(),
                    yielded: value,
                    budget: *budget,
                }));
            }
            Err(err) if err.is_catchable() => {
                let Some(entry) = find_handler(image.exception_handlers(), pc) else {
                    return Err(err);
                };
                debug!(
                    root = %image.name(),
                    fault = pc,
                    handler = entry.handler_bci,
                    "dispatching exception to handler"
                );
                frame.stack.truncate(entry.stack_depth as usize);
                if let Some(slot) = entry.exception_slot {
                    frame.set_local(image, slot, err.into_exception_value());
                }
                frame.pc = entry.handler_bci as usize;
            }
            Err(err) => return Err(err),
        }
    }
}

/// The first entry, in registration order, covering `bci`.
fn find_handler(handlers: &[ExceptionHandlerEntry], bci: usize) -> Option<ExceptionHandlerEntry> {
    handlers.iter().find(|e| e.covers(bci)).copied()
}

fn dispatch_op(
    image: &Arc<BytecodeImage>,
    frame: &mut Frame,
    budget: &mut Budget,
    depth: usize,
) -> Result<Flow> {
    let pc = frame.pc;
    let code = image.code();
    let Some(&byte) = code.get(pc) else {
        fault(image, pc, "program counter ran past the end of the code");
    };
    let Some(op) = Opcode::from_byte(byte) else {
        fault(image, pc, &format!("unknown opcode 0x{byte:02x}"));
    };
    let operand = if op.has_operand() {
        read_u32(code, pc + 1).unwrap_or_else(|| fault(image, pc, "truncated operand"))
    } else {
        0
    };
    frame.pc = pc + op.length();

    match op {
        Opcode::Nop => {}
        Opcode::Pop => {
            frame.pop(image);
        }
        Opcode::Dup => {
            let top = frame.peek(image).clone();
            frame.push(image, top);
        }
        Opcode::LoadConstant => {
            let value = image
                .constants()
                .get(operand as usize)
                .cloned()
                .unwrap_or_else(|| fault(image, pc, "constant index out of range"));
            frame.push(image, value);
        }
        Opcode::LoadArgument => {
            let value = frame.args.get(operand as usize).cloned().unwrap_or_default();
            frame.push(image, value);
        }
        Opcode::LoadLocal => {
            let value = frame.local(image, operand);
            frame.push(image, value);
        }
        Opcode::StoreLocal => {
            let value = frame.pop(image);
            frame.set_local(image, operand, value);
        }
        Opcode::Branch => frame.pc = operand as usize,
        Opcode::BranchFalse => {
            if !frame.pop(image).is_truthy() {
                frame.pc = operand as usize;
            }
        }
        Opcode::ScAnd | Opcode::ScOr => {
            let truthy = frame.peek(image).is_truthy();
            if truthy == (op == Opcode::ScOr) {
                frame.pc = operand as usize;
            } else {
                frame.pop(image);
            }
        }
        Opcode::Return => return Ok(Flow::Return(frame.pop(image))),
        Opcode::Throw => return Err(Error::Thrown(frame.pop(image))),
        Opcode::Yield => return Ok(Flow::Yield(frame.pop(image))),
        Opcode::Add => {
            let rhs = frame.pop(image);
            let lhs = frame.pop(image);
            let sum = add(lhs, rhs)?;
            frame.push(image, sum);
        }
        Opcode::LessThan => {
            let rhs = frame.pop(image);
            let lhs = frame.pop(image);
            let lt = match (&lhs, &rhs) {
                (Value::Int(a), Value::Int(b)) => a < b,
                _ => return Err(type_error("Int < Int", &lhs, &rhs)),
            };
            frame.push(image, Value::Bool(lt));
        }
        Opcode::NonNull => {
            let value = frame.pop(image);
            frame.push(image, Value::Bool(!value.is_null()));
        }
        Opcode::Invoke => {
            let argc = operand as usize;
            if frame.stack.len() < argc + 1 {
                fault(image, pc, "operand stack underflow");
            }
            let args = frame.stack.split_off(frame.stack.len() - argc);
            let callee = frame.pop(image);
            let result = invoke(callee, args, budget, depth)?;
            frame.push(image, result);
        }
    }
    Ok(Flow::Next)
}

fn invoke(callee: Value, args: Vec<Value>, budget: &mut Budget, depth: usize) -> Result<Value> {
    match callee {
        Value::Function(image) => match execute(&image, args, budget, depth + 1)? {
            Execution::Returned(value) => Ok(value),
            Execution::Suspended(cont) => Ok(Value::Continuation(Box::new(cont))),
        },
        Value::Host(host) => Ok(host.call(args)),
        other => Err(Error::Type {
            expected: "function".to_string(),
            got: other.type_name().to_string(),
        }),
    }
}

fn add(lhs: Value, rhs: Value) -> Result<Value> {
    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => a
            .checked_add(b)
            .map(Value::Int)
            .ok_or_else(|| Error::Thrown(Value::from("integer overflow"))),
        (Value::Str(mut a), Value::Str(b)) => {
            a.push_str(&b);
            Ok(Value::Str(a))
        }
        (lhs, rhs) => Err(type_error("Int + Int or Str + Str", &lhs, &rhs)),
    }
}

fn type_error(expected: &str, lhs: &Value, rhs: &Value) -> Error {
    Error::Type {
        expected: expected.to_string(),
        got: format!("{}, {}", lhs.type_name(), rhs.type_name()),
    }
}

/// Abort on an inconsistency in the image itself.
fn fault(image: &BytecodeImage, pc: usize, message: &str) -> ! {
    error!(root = %image.name(), pc, message, "internal interpreter fault");
    panic!("internal interpreter fault in {} at bci {}: {}", image.name(), pc, message);
}
