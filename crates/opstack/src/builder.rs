//! The operation stack builder.
//!
//! A front-end drives the builder with matched `begin_*`/`end_*` calls and
//! leaf `emit_*` calls. Each `begin_*` pushes a pending operation record;
//! children are lowered straight into the root's instruction buffer as they
//! arrive, and `end_*` validates the operation's shape and emits whatever
//! closing code it needs (patching forward branches, splicing handlers).
//!
//! # Finally handlers
//!
//! `begin_finally_try` takes a closure that describes the handler. It runs
//! exactly once, against a recording builder, and produces a [`Plan`]. The
//! plan is replayed to produce one physical copy of the handler at every exit
//! out of the protected body:
//!
//! - fall-through, at the end of the body;
//! - each `return` and each branch to a label outside the body, spliced in
//!   front of the exit, innermost handler first;
//! - exceptional exit, installed through the handler table and followed by a
//!   rethrow.
//!
//! While a copy is being spliced, every protected range from the top of the
//! operation stack down to (and including) its own `FinallyTry` is closed,
//! so a handler never guards itself and an outer handler is never guarded by
//! an inner try.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, instrument, trace};

use crate::bytecode::{BytecodeImage, ExceptionHandlerEntry, Opcode, SourceMapEntry, write_u32};
use crate::error::{BuildError, Error, Result};
use crate::operation::OperationKind;
use crate::plan::{Begin, Command, IdMap, Plan, Recorder};
use crate::registry::{Label, Local, RootRef};
use crate::source::{Source, SourceSection};
use crate::value::Value;

type BuildResult<T> = std::result::Result<T, BuildError>;

const LABEL_SCOPE: &str = "Label must be emitted inside the same operation it was created in.";
const BRANCH_SCOPE: &str = "Branch must target a label declared in an enclosing operation.";
const BRANCH_DEPTH: &str = "Branch cannot be emitted in the middle of an operation.";
const LABEL_DEPTH: &str = "Label cannot be emitted in the middle of an operation.";
const BACKWARD_BRANCH: &str =
    "Backward branches are unsupported. Use a While operation to model backward control flow.";
const NO_SOURCE: &str = "No enclosing Source operation found - each SourceSection must be enclosed in a Source operation.";
const LOCAL_SCOPE: &str = "Local must be used inside the root it was created in.";
const NO_ROOT: &str = "No root is open; call begin_root first.";

// ---------------------------------------------------------------------------
// Per-root state
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct LabelState {
    /// Serial of the operation the label was created in.
    declared_in: u32,
    emitted: bool,
    /// Operand positions of branches waiting for this label.
    pending: Vec<usize>,
}

/// The bytecode range an operation protects, split into segments wherever a
/// handler copy was spliced into it.
#[derive(Debug, Default)]
struct ProtectedRange {
    open_start: Option<u32>,
    segments: Vec<(u32, u32)>,
}

impl ProtectedRange {
    fn opened_at(bci: u32) -> Self {
        Self {
            open_start: Some(bci),
            segments: Vec::new(),
        }
    }

    /// Close the range at `bci`. Returns whether it was open.
    fn close(&mut self, bci: u32) -> bool {
        match self.open_start.take() {
            Some(start) => {
                if start < bci {
                    self.segments.push((start, bci));
                }
                true
            }
            None => false,
        }
    }

    fn reopen(&mut self, bci: u32) {
        self.open_start = Some(bci);
    }

    fn finish(&mut self, bci: u32) -> Vec<(u32, u32)> {
        self.close(bci);
        std::mem::take(&mut self.segments)
    }
}

#[derive(Debug)]
enum OpData {
    None,
    /// StoreLocal / TeeLocal target slot.
    Slot(u32),
    TryCatch {
        slot: Option<u32>,
        range: ProtectedRange,
    },
    /// FinallyTry and FinallyTryCatch.
    Finally {
        user_slot: Option<u32>,
        /// Internal slot holding the exception while the rethrow copy runs.
        exception_slot: Option<u32>,
        plan: Arc<Plan>,
        range: ProtectedRange,
    },
    /// A handler copy being spliced for the finally operation with this serial.
    Handler { finally: u32 },
}

impl OpData {
    fn range_mut(&mut self) -> Option<&mut ProtectedRange> {
        match self {
            OpData::TryCatch { range, .. } | OpData::Finally { range, .. } => Some(range),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct OpRecord {
    serial: u32,
    kind: OperationKind,
    entry_depth: u32,
    children: usize,
    last_produced: bool,
    /// bci at begin; the back-edge target for While.
    start_bci: u32,
    else_patch: Option<usize>,
    end_patches: Vec<usize>,
    data: OpData,
}

impl OpRecord {
    fn new(serial: u32, kind: OperationKind, entry_depth: u32, start_bci: u32, data: OpData) -> Self {
        Self {
            serial,
            kind,
            entry_depth,
            children: 0,
            last_produced: false,
            start_bci,
            else_patch: None,
            end_patches: Vec::new(),
            data,
        }
    }

    /// Whether exits from the current child must run this operation's
    /// finally handler.
    fn guards_exits(&self) -> bool {
        matches!(self.data, OpData::Finally { .. }) && self.children == 0
    }
}

#[derive(Debug)]
struct SourceFrame {
    source: Arc<Source>,
    sections: Vec<SourceSection>,
}

#[derive(Debug)]
struct RootState {
    root: RootRef,
    code: Vec<u8>,
    constants: Vec<Value>,
    handlers: Vec<ExceptionHandlerEntry>,
    slots: HashMap<u32, u32>,
    slot_names: Vec<Option<String>>,
    depth: u32,
    max_depth: u32,
    ops: Vec<OpRecord>,
    labels: HashMap<u32, LabelState>,
    sources: Vec<SourceFrame>,
    source_map: Vec<SourceMapEntry>,
    section: Option<SourceSection>,
}

impl RootState {
    fn new(root: RootRef, serial: u32) -> Self {
        Self {
            root,
            code: Vec::new(),
            constants: Vec::new(),
            handlers: Vec::new(),
            slots: HashMap::new(),
            slot_names: Vec::new(),
            depth: 0,
            max_depth: 0,
            ops: vec![OpRecord::new(serial, OperationKind::Root, 0, 0, OpData::None)],
            labels: HashMap::new(),
            sources: Vec::new(),
            source_map: Vec::new(),
            section: None,
        }
    }

    fn bci(&self) -> u32 {
        self.code.len() as u32
    }

    fn top(&self) -> BuildResult<&OpRecord> {
        self.ops.last().ok_or_else(|| BuildError::new(NO_ROOT))
    }

    fn top_mut(&mut self) -> BuildResult<&mut OpRecord> {
        self.ops.last_mut().ok_or_else(|| BuildError::new(NO_ROOT))
    }

    fn position_of(&self, serial: u32) -> Option<usize> {
        self.ops.iter().rposition(|op| op.serial == serial)
    }

    /// Emit one instruction. Returns the operand position, for patching.
    fn emit(&mut self, op: Opcode, operand: u32) -> usize {
        let start = self.code.len();
        self.code.push(op.byte());
        if op.has_operand() {
            self.code.extend_from_slice(&operand.to_le_bytes());
        }
        self.adjust_depth(op.stack_effect(operand));
        self.map_source(start as u32);
        start + 1
    }

    /// Point the branch operand at `at` to the current bci.
    fn patch(&mut self, at: usize) {
        let target = self.bci();
        write_u32(&mut self.code, at, target);
    }

    fn adjust_depth(&mut self, delta: i64) {
        self.depth = (self.depth as i64 + delta).max(0) as u32;
        self.max_depth = self.max_depth.max(self.depth);
    }

    fn constant(&mut self, value: Value) -> u32 {
        if let Some(i) = self.constants.iter().position(|c| *c == value) {
            return i as u32;
        }
        self.constants.push(value);
        (self.constants.len() - 1) as u32
    }

    fn alloc_slot(&mut self, name: Option<String>) -> u32 {
        self.slot_names.push(name);
        (self.slot_names.len() - 1) as u32
    }

    fn slot_of(&self, local: Local) -> BuildResult<u32> {
        self.slots
            .get(&local.id)
            .copied()
            .ok_or_else(|| BuildError::new(LOCAL_SCOPE))
    }

    fn current_section(&self) -> Option<SourceSection> {
        self.sources.last().and_then(|f| f.sections.last()).cloned()
    }

    fn map_source(&mut self, start: u32) {
        let Some(section) = self.current_section() else {
            return;
        };
        let end = self.bci();
        match self.source_map.last_mut() {
            Some(last) if last.end_bci == start && last.section == section => last.end_bci = end,
            _ => self.source_map.push(SourceMapEntry {
                start_bci: start,
                end_bci: end,
                section,
            }),
        }
    }

    /// Bookkeeping before a new child of the top operation starts.
    fn before_child(&mut self) -> BuildResult<()> {
        let top = self.top()?;
        let (kind, children, last_produced) = (top.kind, top.children, top.last_produced);
        if kind.is_block_like() && children > 0 && last_produced {
            self.emit(Opcode::Pop, 0);
            self.top_mut()?.last_produced = false;
        }
        match kind {
            // The else arm starts at the depth the condition left.
            OperationKind::Conditional if children == 2 => self.adjust_depth(-1),
            OperationKind::ScAnd | OperationKind::ScOr if children > 0 => {
                let op = if kind == OperationKind::ScAnd {
                    Opcode::ScAnd
                } else {
                    Opcode::ScOr
                };
                let at = self.emit(op, 0);
                self.top_mut()?.end_patches.push(at);
            }
            _ => {}
        }
        Ok(())
    }

    /// Walk the visible operations from the top of the stack, collecting the
    /// finally operations an exit must run, innermost first. The walk stops at
    /// the operation with serial `stop` (exclusive) or at the root. Returns
    /// whether `stop` was reached.
    ///
    /// Operations between a finally operation and a handler copy of it being
    /// spliced are not visible from inside the copy.
    fn exit_path(&self, stop: Option<u32>) -> BuildResult<(bool, Vec<usize>)> {
        let mut finallies = Vec::new();
        let mut i = self.ops.len();
        while i > 0 {
            i -= 1;
            let op = &self.ops[i];
            if Some(op.serial) == stop {
                return Ok((true, finallies));
            }
            if let OpData::Handler { finally } = op.data {
                i = self.ops[..i]
                    .iter()
                    .rposition(|o| o.serial == finally)
                    .ok_or_else(|| BuildError::new("Finally handler copy lost its operation."))?;
                continue;
            }
            if op.guards_exits() {
                finallies.push(i);
            }
        }
        Ok((false, finallies))
    }

    /// Close every open protected range from `from` to the top of the stack.
    fn close_ranges_from(&mut self, from: usize) -> Vec<usize> {
        let bci = self.bci();
        let mut closed = Vec::new();
        for (i, op) in self.ops.iter_mut().enumerate().skip(from) {
            if let Some(range) = op.data.range_mut()
                && range.close(bci)
            {
                closed.push(i);
            }
        }
        closed
    }

    fn reopen_ranges(&mut self, indices: &[usize]) {
        let bci = self.bci();
        for &i in indices {
            if let Some(range) = self.ops.get_mut(i).and_then(|op| op.data.range_mut()) {
                range.reopen(bci);
            }
        }
    }

    fn register_handler(
        &mut self,
        segments: Vec<(u32, u32)>,
        handler_bci: u32,
        exception_slot: Option<u32>,
        stack_depth: u32,
    ) {
        for (start_bci, end_bci) in segments {
            self.handlers.push(ExceptionHandlerEntry {
                start_bci,
                end_bci,
                handler_bci,
                exception_slot,
                stack_depth,
            });
        }
    }

    /// Check that the top operation is `kind` and may be closed.
    fn check_closable(&self, kind: OperationKind) -> BuildResult<()> {
        let top = self.top()?;
        if top.kind != kind {
            return Err(BuildError::in_operation(
                kind.name(),
                format!(
                    "Unexpected end{}: the innermost open operation is {}.",
                    kind, top.kind
                ),
            ));
        }
        kind.check_arity(top.children)
            .map_err(|msg| BuildError::in_operation(kind.name(), msg))?;
        if self
            .labels
            .values()
            .any(|l| l.declared_in == top.serial && !l.emitted)
        {
            return Err(BuildError::in_operation(
                kind.name(),
                format!(
                    "Operation {} ended without emitting one or more declared labels.",
                    kind
                ),
            ));
        }
        Ok(())
    }

    fn into_image(self) -> BytecodeImage {
        BytecodeImage {
            name: self.root.to_string(),
            code: self.code,
            constants: self.constants,
            handlers: self.handlers,
            num_locals: self.slot_names.len() as u32,
            max_stack: self.max_depth,
            local_names: self.slot_names,
            source_map: self.source_map,
            section: self.section,
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builds roots into [`BytecodeImage`]s.
///
/// Every method returns [`Error::Build`] on a structural violation. The first
/// such error poisons the builder: later calls return a clone of it.
#[derive(Debug, Default)]
pub struct Builder {
    roots: Vec<RootState>,
    images: HashMap<u32, Arc<BytecodeImage>>,
    recorders: Vec<Recorder>,
    poisoned: Option<BuildError>,
    next_serial: u32,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    /// The error that poisoned this builder, if any.
    pub fn error(&self) -> Option<&BuildError> {
        self.poisoned.as_ref()
    }

    /// The image of a finished root.
    pub fn image(&self, root: RootRef) -> Option<Arc<BytecodeImage>> {
        self.images.get(&root.id).cloned()
    }

    // -----------------------------------------------------------------------
    // Roots, labels and locals
    // -----------------------------------------------------------------------

    /// Start a new root. Roots may nest: a root begun while another is open
    /// is built independently and can be loaded with
    /// [`emit_load_function`](Self::emit_load_function) once finished.
    pub fn begin_root(&mut self) -> Result<()> {
        self.command(Command::BeginRoot)
    }

    #[instrument(skip_all, name = "end_root")]
    pub fn end_root(&mut self) -> Result<RootRef> {
        self.check_poisoned()?;
        if !self.recorders.is_empty() {
            let template = RootRef::fresh();
            self.command(Command::EndRoot(template))?;
            return Ok(template);
        }
        self.apply_end_root().map_err(|e| self.fail(e))
    }

    pub fn create_label(&mut self) -> Result<Label> {
        self.check_poisoned()?;
        let label = Label::fresh();
        self.command(Command::CreateLabel(label))?;
        Ok(label)
    }

    pub fn create_local(&mut self) -> Result<Local> {
        self.create_local_with_name(None)
    }

    /// Create a local that the disassembler shows by name.
    pub fn create_local_named(&mut self, name: impl Into<String>) -> Result<Local> {
        self.create_local_with_name(Some(name.into()))
    }

    fn create_local_with_name(&mut self, name: Option<String>) -> Result<Local> {
        self.check_poisoned()?;
        let local = Local::fresh();
        self.command(Command::CreateLocal(local, name))?;
        Ok(local)
    }

    pub fn emit_label(&mut self, label: Label) -> Result<()> {
        self.command(Command::EmitLabel(label))
    }

    /// Branch forward to `label`, running every finally handler between here
    /// and the label's operation first.
    pub fn emit_branch(&mut self, label: Label) -> Result<()> {
        self.command(Command::EmitBranch(label))
    }

    // -----------------------------------------------------------------------
    // Structured operations
    // -----------------------------------------------------------------------

    pub fn begin_block(&mut self) -> Result<()> {
        self.begin(Begin::Block)
    }

    pub fn end_block(&mut self) -> Result<()> {
        self.end(OperationKind::Block)
    }

    pub fn begin_if_then(&mut self) -> Result<()> {
        self.begin(Begin::IfThen)
    }

    pub fn end_if_then(&mut self) -> Result<()> {
        self.end(OperationKind::IfThen)
    }

    pub fn begin_if_then_else(&mut self) -> Result<()> {
        self.begin(Begin::IfThenElse)
    }

    pub fn end_if_then_else(&mut self) -> Result<()> {
        self.end(OperationKind::IfThenElse)
    }

    pub fn begin_conditional(&mut self) -> Result<()> {
        self.begin(Begin::Conditional)
    }

    pub fn end_conditional(&mut self) -> Result<()> {
        self.end(OperationKind::Conditional)
    }

    pub fn begin_while(&mut self) -> Result<()> {
        self.begin(Begin::While)
    }

    pub fn end_while(&mut self) -> Result<()> {
        self.end(OperationKind::While)
    }

    /// Protect the first child; the second runs if it throws, with the
    /// exception stored in `local`.
    pub fn begin_try_catch(&mut self, local: Option<Local>) -> Result<()> {
        self.begin(Begin::TryCatch(local))
    }

    pub fn end_try_catch(&mut self) -> Result<()> {
        self.end(OperationKind::TryCatch)
    }

    /// Protect the single child with a finally handler described by
    /// `handler`.
    ///
    /// On the exceptional exit `local` holds the exception while the handler
    /// runs; on every other exit it is reset to null.
    pub fn begin_finally_try<F>(&mut self, local: Option<Local>, handler: F) -> Result<()>
    where
        F: FnOnce(&mut Builder) -> Result<()>,
    {
        let plan = self.record_handler(handler)?;
        self.begin(Begin::FinallyTry(local, plan))
    }

    pub fn end_finally_try(&mut self) -> Result<()> {
        self.end(OperationKind::FinallyTry)
    }

    /// Like [`begin_finally_try`](Self::begin_finally_try), with a catch
    /// clause as the second child. An exception from the body runs the catch
    /// clause instead of the handler; exits from the catch clause run
    /// neither.
    pub fn begin_finally_try_catch<F>(&mut self, local: Option<Local>, handler: F) -> Result<()>
    where
        F: FnOnce(&mut Builder) -> Result<()>,
    {
        let plan = self.record_handler(handler)?;
        self.begin(Begin::FinallyTryCatch(local, plan))
    }

    pub fn end_finally_try_catch(&mut self) -> Result<()> {
        self.end(OperationKind::FinallyTryCatch)
    }

    pub fn begin_sc_and(&mut self) -> Result<()> {
        self.begin(Begin::ScAnd)
    }

    pub fn end_sc_and(&mut self) -> Result<()> {
        self.end(OperationKind::ScAnd)
    }

    pub fn begin_sc_or(&mut self) -> Result<()> {
        self.begin(Begin::ScOr)
    }

    pub fn end_sc_or(&mut self) -> Result<()> {
        self.end(OperationKind::ScOr)
    }

    pub fn begin_yield(&mut self) -> Result<()> {
        self.begin(Begin::Yield)
    }

    pub fn end_yield(&mut self) -> Result<()> {
        self.end(OperationKind::Yield)
    }

    pub fn begin_return(&mut self) -> Result<()> {
        self.begin(Begin::Return)
    }

    pub fn end_return(&mut self) -> Result<()> {
        self.end(OperationKind::Return)
    }

    pub fn begin_throw(&mut self) -> Result<()> {
        self.begin(Begin::Throw)
    }

    pub fn end_throw(&mut self) -> Result<()> {
        self.end(OperationKind::Throw)
    }

    pub fn begin_add(&mut self) -> Result<()> {
        self.begin(Begin::Add)
    }

    pub fn end_add(&mut self) -> Result<()> {
        self.end(OperationKind::Add)
    }

    pub fn begin_less_than(&mut self) -> Result<()> {
        self.begin(Begin::LessThan)
    }

    pub fn end_less_than(&mut self) -> Result<()> {
        self.end(OperationKind::LessThan)
    }

    pub fn begin_non_null(&mut self) -> Result<()> {
        self.begin(Begin::NonNull)
    }

    pub fn end_non_null(&mut self) -> Result<()> {
        self.end(OperationKind::NonNull)
    }

    pub fn begin_store_local(&mut self, local: Local) -> Result<()> {
        self.begin(Begin::StoreLocal(local))
    }

    pub fn end_store_local(&mut self) -> Result<()> {
        self.end(OperationKind::StoreLocal)
    }

    /// Store into `local` and keep the value.
    pub fn begin_tee_local(&mut self, local: Local) -> Result<()> {
        self.begin(Begin::TeeLocal(local))
    }

    pub fn end_tee_local(&mut self) -> Result<()> {
        self.end(OperationKind::TeeLocal)
    }

    /// Call the first child with the remaining children as arguments.
    pub fn begin_invoke(&mut self) -> Result<()> {
        self.begin(Begin::Invoke)
    }

    pub fn end_invoke(&mut self) -> Result<()> {
        self.end(OperationKind::Invoke)
    }

    // -----------------------------------------------------------------------
    // Source mapping
    // -----------------------------------------------------------------------

    /// Attribute the enclosed operations to `source`. No section is active
    /// until a [`begin_source_section`](Self::begin_source_section).
    pub fn begin_source(&mut self, source: Arc<Source>) -> Result<()> {
        self.begin(Begin::Source(source))
    }

    pub fn end_source(&mut self) -> Result<()> {
        self.end(OperationKind::Source)
    }

    pub fn begin_source_section(&mut self, offset: usize, length: usize) -> Result<()> {
        self.begin(Begin::SourceSection { offset, length })
    }

    pub fn end_source_section(&mut self) -> Result<()> {
        self.end(OperationKind::SourceSection)
    }

    // -----------------------------------------------------------------------
    // Leaves
    // -----------------------------------------------------------------------

    pub fn emit_load_constant(&mut self, value: impl Into<Value>) -> Result<()> {
        self.command(Command::EmitLoadConstant(value.into()))
    }

    pub fn emit_load_argument(&mut self, index: u32) -> Result<()> {
        self.command(Command::EmitLoadArgument(index))
    }

    pub fn emit_load_local(&mut self, local: Local) -> Result<()> {
        self.command(Command::EmitLoadLocal(local))
    }

    /// Push a finished root as a [`Value::Function`].
    pub fn emit_load_function(&mut self, root: RootRef) -> Result<()> {
        self.command(Command::EmitLoadFunction(root))
    }

    pub fn emit_nop(&mut self) -> Result<()> {
        self.command(Command::EmitNop)
    }

    /// Shorthand for a `Return` of a constant.
    pub fn emit_return(&mut self, value: impl Into<Value>) -> Result<()> {
        self.begin_return()?;
        self.emit_load_constant(value)?;
        self.end_return()
    }

    /// Shorthand for a `Throw` of a constant.
    pub fn emit_throw(&mut self, value: impl Into<Value>) -> Result<()> {
        self.begin_throw()?;
        self.emit_load_constant(value)?;
        self.end_throw()
    }

    // -----------------------------------------------------------------------
    // Dispatch between recording and applying
    // -----------------------------------------------------------------------

    fn begin(&mut self, begin: Begin) -> Result<()> {
        self.command(Command::Begin(begin))
    }

    fn end(&mut self, kind: OperationKind) -> Result<()> {
        self.command(Command::End(kind))
    }

    fn command(&mut self, command: Command) -> Result<()> {
        self.check_poisoned()?;
        let outcome = match self.recorders.last_mut() {
            Some(recorder) => recorder.record(command),
            None => self.apply(command),
        };
        outcome.map_err(|e| self.fail(e))
    }

    fn check_poisoned(&self) -> Result<()> {
        match &self.poisoned {
            Some(err) => Err(Error::Build(err.clone())),
            None => Ok(()),
        }
    }

    fn fail(&mut self, err: BuildError) -> Error {
        let section = self.roots.last().and_then(|r| r.current_section());
        let err = err.with_section(section);
        debug!(error = %err, operation = ?err.operation, "build failed");
        self.poisoned = Some(err.clone());
        Error::Build(err)
    }

    fn record_handler<F>(&mut self, handler: F) -> Result<Arc<Plan>>
    where
        F: FnOnce(&mut Builder) -> Result<()>,
    {
        self.check_poisoned()?;
        self.recorders.push(Recorder::default());
        let outcome = handler(self);
        let recorder = self.recorders.pop().unwrap_or_default();
        outcome?;
        let plan = recorder.finish().map_err(|e| self.fail(e))?;
        trace!(commands = plan.commands().len(), "recorded finally handler");
        Ok(Arc::new(plan))
    }

    fn next_serial(&mut self) -> u32 {
        self.next_serial += 1;
        self.next_serial
    }

    fn root(&self) -> BuildResult<&RootState> {
        self.roots.last().ok_or_else(|| BuildError::new(NO_ROOT))
    }

    fn root_mut(&mut self) -> BuildResult<&mut RootState> {
        self.roots.last_mut().ok_or_else(|| BuildError::new(NO_ROOT))
    }

    fn apply(&mut self, command: Command) -> BuildResult<()> {
        match command {
            Command::Begin(begin) => self.apply_begin(begin),
            Command::End(kind) => self.apply_end(kind),
            Command::BeginRoot => {
                self.apply_begin_root();
                Ok(())
            }
            Command::EndRoot(_) => self.apply_end_root().map(|_| ()),
            Command::CreateLabel(label) => self.apply_create_label(label),
            Command::CreateLocal(local, name) => self.apply_create_local(local, name),
            Command::EmitLabel(label) => self.apply_emit_label(label),
            Command::EmitBranch(label) => self.apply_emit_branch(label),
            Command::EmitLoadConstant(value) => {
                let root = self.root_mut()?;
                root.before_child()?;
                let index = root.constant(value);
                root.emit(Opcode::LoadConstant, index);
                self.after_child(true)
            }
            Command::EmitLoadArgument(index) => self.leaf(Opcode::LoadArgument, index, true),
            Command::EmitLoadLocal(local) => {
                let slot = self.root()?.slot_of(local)?;
                self.leaf(Opcode::LoadLocal, slot, true)
            }
            Command::EmitLoadFunction(root_ref) => {
                let image = self.images.get(&root_ref.id).cloned().ok_or_else(|| {
                    BuildError::new(format!("Root {} must be finished before it is loaded.", root_ref))
                })?;
                let root = self.root_mut()?;
                root.before_child()?;
                let index = root.constant(Value::Function(image));
                root.emit(Opcode::LoadConstant, index);
                self.after_child(true)
            }
            Command::EmitNop => self.leaf(Opcode::Nop, 0, false),
        }
    }

    /// Replay a recorded plan with fresh ids for everything it creates.
    fn replay(&mut self, plan: &Plan) -> BuildResult<()> {
        let mut ids = IdMap::default();
        for command in plan.commands() {
            match command {
                Command::CreateLabel(template) => {
                    let label = Label::fresh();
                    ids.insert(template.id, label.id);
                    self.apply_create_label(label)?;
                }
                Command::CreateLocal(template, name) => {
                    let local = Local::fresh();
                    ids.insert(template.id, local.id);
                    self.apply_create_local(local, name.clone())?;
                }
                Command::EndRoot(template) => {
                    let root = self.apply_end_root()?;
                    ids.insert(template.id, root.id);
                }
                other => self.apply(other.remapped(&ids))?,
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Applying commands
    // -----------------------------------------------------------------------

    fn apply_begin_root(&mut self) {
        let serial = self.next_serial();
        self.roots.push(RootState::new(RootRef::fresh(), serial));
    }

    fn apply_end_root(&mut self) -> BuildResult<RootRef> {
        let root = self.root_mut()?;
        root.check_closable(OperationKind::Root)?;
        let top = root.top()?;
        if top.children > 0 && top.last_produced {
            root.emit(Opcode::Pop, 0);
        }
        // Falling off the end returns null.
        let null = root.constant(Value::Null);
        root.emit(Opcode::LoadConstant, null);
        root.emit(Opcode::Return, 0);

        let state = self.roots.pop().ok_or_else(|| BuildError::new(NO_ROOT))?;
        let root_ref = state.root;
        let image = Arc::new(state.into_image());
        debug!(
            root = %root_ref,
            bytes = image.code.len(),
            handlers = image.handlers.len(),
            locals = image.num_locals,
            max_stack = image.max_stack,
            "root finalized"
        );
        self.images.insert(root_ref.id, image);
        Ok(root_ref)
    }

    fn apply_create_label(&mut self, label: Label) -> BuildResult<()> {
        let root = self.root_mut()?;
        let declared_in = root.top()?.serial;
        root.labels.insert(
            label.id,
            LabelState {
                declared_in,
                emitted: false,
                pending: Vec::new(),
            },
        );
        Ok(())
    }

    fn apply_create_local(&mut self, local: Local, name: Option<String>) -> BuildResult<()> {
        let root = self.root_mut()?;
        let slot = root.alloc_slot(name);
        root.slots.insert(local.id, slot);
        Ok(())
    }

    fn leaf(&mut self, op: Opcode, operand: u32, produces: bool) -> BuildResult<()> {
        let root = self.root_mut()?;
        root.before_child()?;
        root.emit(op, operand);
        self.after_child(produces)
    }

    fn apply_emit_label(&mut self, label: Label) -> BuildResult<()> {
        let root = self.root_mut()?;
        root.before_child()?;
        let top = root.top()?;
        let (serial, entry_depth) = (top.serial, top.entry_depth);
        let state = root
            .labels
            .get(&label.id)
            .ok_or_else(|| BuildError::new(LABEL_SCOPE))?;
        if state.declared_in != serial {
            return Err(BuildError::new(LABEL_SCOPE));
        }
        if state.emitted {
            return Err(BuildError::new(format!("{} was already emitted.", label)));
        }
        if root.depth != entry_depth {
            return Err(BuildError::new(LABEL_DEPTH));
        }
        let target = root.bci();
        if let Some(state) = root.labels.get_mut(&label.id) {
            state.emitted = true;
            for at in state.pending.drain(..) {
                write_u32(&mut root.code, at, target);
            }
        }
        self.after_child(false)
    }

    fn apply_emit_branch(&mut self, label: Label) -> BuildResult<()> {
        let root = self.root_mut()?;
        root.before_child()?;
        let state = root
            .labels
            .get(&label.id)
            .ok_or_else(|| BuildError::new(BRANCH_SCOPE))?;
        let (declared_in, emitted) = (state.declared_in, state.emitted);
        let (reachable, finallies) = root.exit_path(Some(declared_in))?;
        if !reachable {
            return Err(BuildError::new(BRANCH_SCOPE));
        }
        if emitted {
            return Err(BuildError::new(BACKWARD_BRANCH));
        }
        let target_depth = root
            .position_of(declared_in)
            .map(|i| root.ops[i].entry_depth)
            .unwrap_or(0);
        if root.depth != target_depth {
            return Err(BuildError::new(BRANCH_DEPTH));
        }
        for finally in finallies {
            self.inline_handler(finally, true)?;
        }
        let root = self.root_mut()?;
        let at = root.emit(Opcode::Branch, 0);
        if let Some(state) = root.labels.get_mut(&label.id) {
            state.pending.push(at);
        }
        self.after_child(false)
    }

    fn apply_begin(&mut self, begin: Begin) -> BuildResult<()> {
        let kind = begin.kind();
        let serial = self.next_serial();
        let root = self.root_mut()?;
        root.before_child()?;
        let bci = root.bci();
        let data = match begin {
            Begin::TryCatch(local) => OpData::TryCatch {
                slot: local.map(|l| root.slot_of(l)).transpose()?,
                range: ProtectedRange::opened_at(bci),
            },
            Begin::FinallyTry(local, plan) => OpData::Finally {
                user_slot: local.map(|l| root.slot_of(l)).transpose()?,
                exception_slot: Some(root.alloc_slot(None)),
                plan,
                range: ProtectedRange::opened_at(bci),
            },
            Begin::FinallyTryCatch(local, plan) => OpData::Finally {
                user_slot: local.map(|l| root.slot_of(l)).transpose()?,
                exception_slot: None,
                plan,
                range: ProtectedRange::opened_at(bci),
            },
            Begin::StoreLocal(local) | Begin::TeeLocal(local) => OpData::Slot(root.slot_of(local)?),
            Begin::Source(source) => {
                root.sources.push(SourceFrame {
                    source,
                    sections: Vec::new(),
                });
                OpData::None
            }
            Begin::SourceSection { offset, length } => {
                let frame = root
                    .sources
                    .last_mut()
                    .ok_or_else(|| BuildError::in_operation(kind.name(), NO_SOURCE))?;
                let section = SourceSection::new(frame.source.clone(), offset, length);
                frame.sections.push(section.clone());
                if root.section.is_none() {
                    root.section = Some(section);
                }
                OpData::None
            }
            _ => OpData::None,
        };
        let depth = root.depth;
        root.ops.push(OpRecord::new(serial, kind, depth, bci, data));
        Ok(())
    }

    fn apply_end(&mut self, kind: OperationKind) -> BuildResult<()> {
        if matches!(kind, OperationKind::Root | OperationKind::FinallyHandler) {
            return Err(BuildError::in_operation(
                kind.name(),
                format!("Operation {} cannot be ended here.", kind),
            ));
        }
        self.root()?.check_closable(kind)?;
        let produced = self.lower(kind)?;
        self.root_mut()?.ops.pop();
        self.after_child(produced)
    }

    /// Emit the closing code of the top operation. Returns whether it leaves
    /// a value.
    fn lower(&mut self, kind: OperationKind) -> BuildResult<bool> {
        match kind {
            OperationKind::FinallyTry => {
                self.lower_finally_try()?;
                return Ok(false);
            }
            OperationKind::Return => {
                self.lower_return()?;
                return Ok(false);
            }
            _ => {}
        }

        let root = self.root_mut()?;
        let top = root.top_mut()?;
        let (children, last_produced) = (top.children, top.last_produced);
        let slot = match top.data {
            OpData::Slot(slot) => slot,
            _ => 0,
        };
        let mut patches = std::mem::take(&mut top.end_patches);
        patches.extend(top.else_patch.take());

        match kind {
            OperationKind::Yield => {
                root.emit(Opcode::Yield, 0);
            }
            OperationKind::Throw => {
                root.emit(Opcode::Throw, 0);
            }
            OperationKind::Add => {
                root.emit(Opcode::Add, 0);
            }
            OperationKind::LessThan => {
                root.emit(Opcode::LessThan, 0);
            }
            OperationKind::NonNull => {
                root.emit(Opcode::NonNull, 0);
            }
            OperationKind::StoreLocal => {
                root.emit(Opcode::StoreLocal, slot);
            }
            OperationKind::TeeLocal => {
                root.emit(Opcode::Dup, 0);
                root.emit(Opcode::StoreLocal, slot);
            }
            OperationKind::Invoke => {
                root.emit(Opcode::Invoke, (children - 1) as u32);
            }
            OperationKind::Source => {
                root.sources.pop();
            }
            OperationKind::SourceSection => {
                if let Some(frame) = root.sources.last_mut() {
                    frame.sections.pop();
                }
            }
            _ => {}
        }
        for at in patches {
            root.patch(at);
        }
        Ok(kind.produces_value(children > 0 && last_produced))
    }

    /// Bookkeeping after a child of the top operation is complete.
    fn after_child(&mut self, produced: bool) -> BuildResult<()> {
        let root = self.root_mut()?;
        let top = root.top()?;
        let (kind, index, entry_depth) = (top.kind, top.children, top.entry_depth);

        if kind.requires_value(index) && !produced {
            return Err(BuildError::in_operation(
                kind.name(),
                format!(
                    "Operation {} expected a value-producing child at position {}, but a void one was provided.",
                    kind, index
                ),
            ));
        }
        if produced && !kind.requires_value(index) && !kind.is_block_like() {
            root.emit(Opcode::Pop, 0);
        }

        match (kind, index) {
            (OperationKind::IfThen | OperationKind::IfThenElse | OperationKind::Conditional, 0) => {
                let at = root.emit(Opcode::BranchFalse, 0);
                root.top_mut()?.else_patch = Some(at);
            }
            (OperationKind::IfThenElse | OperationKind::Conditional, 1) => {
                let at = root.emit(Opcode::Branch, 0);
                let top = root.top_mut()?;
                top.end_patches.push(at);
                if let Some(else_at) = top.else_patch.take() {
                    root.patch(else_at);
                }
            }
            (OperationKind::While, 0) => {
                let at = root.emit(Opcode::BranchFalse, 0);
                root.top_mut()?.end_patches.push(at);
            }
            (OperationKind::While, 1) => {
                let start = root.top()?.start_bci;
                root.emit(Opcode::Branch, start);
            }
            (OperationKind::TryCatch, 0) => {
                let bci = root.bci();
                let (segments, slot) = match &mut root.top_mut()?.data {
                    OpData::TryCatch { slot, range } => (range.finish(bci), *slot),
                    _ => (Vec::new(), None),
                };
                let at = root.emit(Opcode::Branch, 0);
                root.top_mut()?.end_patches.push(at);
                let handler_bci = root.bci();
                root.register_handler(segments, handler_bci, slot, entry_depth);
                root.depth = entry_depth;
            }
            (OperationKind::FinallyTryCatch, 0) => {
                self.finish_finally_try_catch_body(entry_depth)?;
            }
            _ => {}
        }

        let top = self.root_mut()?.top_mut()?;
        top.children += 1;
        top.last_produced = produced;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Finally relocation
    // -----------------------------------------------------------------------

    /// Splice a copy of the handler of the finally operation at `finally`
    /// (an index into the op stack) at the current position.
    fn inline_handler(&mut self, finally: usize, reset_local: bool) -> BuildResult<()> {
        let root = self.root_mut()?;
        let op = root
            .ops
            .get(finally)
            .ok_or_else(|| BuildError::new("Finally operation is no longer open."))?;
        let serial = op.serial;
        let (user_slot, plan) = match &op.data {
            OpData::Finally {
                user_slot, plan, ..
            } => (*user_slot, plan.clone()),
            _ => return Err(BuildError::new("Operation has no finally handler.")),
        };

        let closed = root.close_ranges_from(finally);
        if reset_local && let Some(slot) = user_slot {
            let null = root.constant(Value::Null);
            root.emit(Opcode::LoadConstant, null);
            root.emit(Opcode::StoreLocal, slot);
        }
        debug!(finally = serial, at = root.bci(), "splicing finally handler");
        self.replay_handler(serial, &plan)?;
        self.root_mut()?.reopen_ranges(&closed);
        Ok(())
    }

    fn replay_handler(&mut self, finally: u32, plan: &Plan) -> BuildResult<()> {
        let serial = self.next_serial();
        let root = self.root_mut()?;
        let (depth, bci) = (root.depth, root.bci());
        root.ops.push(OpRecord::new(
            serial,
            OperationKind::FinallyHandler,
            depth,
            bci,
            OpData::Handler { finally },
        ));

        self.replay(plan)?;

        let root = self.root_mut()?;
        root.check_closable(OperationKind::FinallyHandler)?;
        let top = root.top()?;
        if top.children > 0 && top.last_produced {
            root.emit(Opcode::Pop, 0);
        }
        root.ops.pop();
        Ok(())
    }

    /// A return value is parked in a fresh slot while the handler copies run,
    /// so a copy may branch away with a balanced stack.
    fn lower_return(&mut self) -> BuildResult<()> {
        let (_, finallies) = self.root()?.exit_path(None)?;
        if finallies.is_empty() {
            self.root_mut()?.emit(Opcode::Return, 0);
            return Ok(());
        }
        let root = self.root_mut()?;
        let slot = root.alloc_slot(None);
        root.emit(Opcode::StoreLocal, slot);
        for finally in finallies {
            self.inline_handler(finally, true)?;
        }
        let root = self.root_mut()?;
        root.emit(Opcode::LoadLocal, slot);
        root.emit(Opcode::Return, 0);
        Ok(())
    }

    /// Lower the end of a `FinallyTry`: the fall-through copy, then the
    /// exceptional copy reached through the handler table, which rethrows.
    fn lower_finally_try(&mut self) -> BuildResult<()> {
        let root = self.root_mut()?;
        let index = root.ops.len() - 1;
        let bci = root.bci();
        let entry_depth = root.ops[index].entry_depth;
        let (segments, user_slot, exception_slot) = match &mut root.ops[index].data {
            OpData::Finally {
                range,
                user_slot,
                exception_slot: Some(exception_slot),
                ..
            } => (range.finish(bci), *user_slot, *exception_slot),
            _ => return Err(BuildError::new("FinallyTry lost its exception slot.")),
        };

        self.inline_handler(index, true)?;
        let root = self.root_mut()?;
        let end = root.emit(Opcode::Branch, 0);

        let handler_bci = root.bci();
        root.register_handler(segments, handler_bci, Some(exception_slot), entry_depth);
        root.depth = entry_depth;
        if let Some(slot) = user_slot {
            root.emit(Opcode::LoadLocal, exception_slot);
            root.emit(Opcode::StoreLocal, slot);
        }
        self.inline_handler(index, false)?;

        let root = self.root_mut()?;
        root.emit(Opcode::LoadLocal, exception_slot);
        root.emit(Opcode::Throw, 0);
        root.patch(end);
        Ok(())
    }

    /// The body of a `FinallyTryCatch` just ended: splice the fall-through
    /// copy and open the catch clause.
    fn finish_finally_try_catch_body(&mut self, entry_depth: u32) -> BuildResult<()> {
        let root = self.root_mut()?;
        let index = root.ops.len() - 1;
        let bci = root.bci();
        let (segments, slot) = match &mut root.ops[index].data {
            OpData::Finally {
                range, user_slot, ..
            } => (range.finish(bci), *user_slot),
            _ => return Err(BuildError::new("FinallyTryCatch lost its handler.")),
        };

        self.inline_handler(index, true)?;
        let root = self.root_mut()?;
        let at = root.emit(Opcode::Branch, 0);
        root.ops[index].end_patches.push(at);
        let handler_bci = root.bci();
        root.register_handler(segments, handler_bci, slot, entry_depth);
        root.depth = entry_depth;
        Ok(())
    }
}
