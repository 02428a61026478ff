//! Replayable build plans for finally handlers.
//!
//! A handler closure runs once against a recording builder. Every call it
//! makes is captured as a [`Command`]; the resulting [`Plan`] is replayed at
//! each exit that needs a copy of the handler. Ids the plan creates are
//! templates: each replay maps them to fresh ids, so labels and locals are
//! distinct per copy. Ids created outside the plan pass through unchanged.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::BuildError;
use crate::operation::OperationKind;
use crate::registry::{Label, Local, RootRef};
use crate::source::Source;
use crate::value::Value;

/// Arguments of a `begin_*` call.
#[derive(Debug, Clone)]
pub(crate) enum Begin {
    Block,
    IfThen,
    IfThenElse,
    Conditional,
    While,
    TryCatch(Option<Local>),
    FinallyTry(Option<Local>, Arc<Plan>),
    FinallyTryCatch(Option<Local>, Arc<Plan>),
    ScAnd,
    ScOr,
    Yield,
    Return,
    Throw,
    Add,
    LessThan,
    NonNull,
    StoreLocal(Local),
    TeeLocal(Local),
    Invoke,
    Source(Arc<Source>),
    SourceSection { offset: usize, length: usize },
}

impl Begin {
    pub fn kind(&self) -> OperationKind {
        match self {
            Begin::Block => OperationKind::Block,
            Begin::IfThen => OperationKind::IfThen,
            Begin::IfThenElse => OperationKind::IfThenElse,
            Begin::Conditional => OperationKind::Conditional,
            Begin::While => OperationKind::While,
            Begin::TryCatch(_) => OperationKind::TryCatch,
            Begin::FinallyTry(..) => OperationKind::FinallyTry,
            Begin::FinallyTryCatch(..) => OperationKind::FinallyTryCatch,
            Begin::ScAnd => OperationKind::ScAnd,
            Begin::ScOr => OperationKind::ScOr,
            Begin::Yield => OperationKind::Yield,
            Begin::Return => OperationKind::Return,
            Begin::Throw => OperationKind::Throw,
            Begin::Add => OperationKind::Add,
            Begin::LessThan => OperationKind::LessThan,
            Begin::NonNull => OperationKind::NonNull,
            Begin::StoreLocal(_) => OperationKind::StoreLocal,
            Begin::TeeLocal(_) => OperationKind::TeeLocal,
            Begin::Invoke => OperationKind::Invoke,
            Begin::Source(_) => OperationKind::Source,
            Begin::SourceSection { .. } => OperationKind::SourceSection,
        }
    }

    fn remapped(&self, ids: &IdMap) -> Begin {
        match self {
            Begin::TryCatch(l) => Begin::TryCatch(l.map(|l| ids.local(l))),
            Begin::FinallyTry(l, plan) => {
                Begin::FinallyTry(l.map(|l| ids.local(l)), Arc::new(plan.remapped(ids)))
            }
            Begin::FinallyTryCatch(l, plan) => {
                Begin::FinallyTryCatch(l.map(|l| ids.local(l)), Arc::new(plan.remapped(ids)))
            }
            Begin::StoreLocal(l) => Begin::StoreLocal(ids.local(*l)),
            Begin::TeeLocal(l) => Begin::TeeLocal(ids.local(*l)),
            other => other.clone(),
        }
    }
}

/// One recorded builder call.
#[derive(Debug, Clone)]
pub(crate) enum Command {
    Begin(Begin),
    End(OperationKind),
    BeginRoot,
    EndRoot(RootRef),
    CreateLabel(Label),
    CreateLocal(Local, Option<String>),
    EmitLabel(Label),
    EmitBranch(Label),
    EmitLoadConstant(Value),
    EmitLoadArgument(u32),
    EmitLoadLocal(Local),
    EmitLoadFunction(RootRef),
    EmitNop,
}

impl Command {
    pub fn remapped(&self, ids: &IdMap) -> Command {
        match self {
            Command::Begin(b) => Command::Begin(b.remapped(ids)),
            Command::EndRoot(r) => Command::EndRoot(ids.root(*r)),
            Command::CreateLabel(l) => Command::CreateLabel(ids.label(*l)),
            Command::CreateLocal(l, name) => Command::CreateLocal(ids.local(*l), name.clone()),
            Command::EmitLabel(l) => Command::EmitLabel(ids.label(*l)),
            Command::EmitBranch(l) => Command::EmitBranch(ids.label(*l)),
            Command::EmitLoadLocal(l) => Command::EmitLoadLocal(ids.local(*l)),
            Command::EmitLoadFunction(r) => Command::EmitLoadFunction(ids.root(*r)),
            other => other.clone(),
        }
    }
}

/// A finally handler captured as data.
#[derive(Debug, Clone, Default)]
pub(crate) struct Plan {
    commands: Vec<Command>,
}

impl Plan {
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Rewrite every id in the plan (nested plans included) through `ids`.
    pub fn remapped(&self, ids: &IdMap) -> Plan {
        Plan {
            commands: self.commands.iter().map(|c| c.remapped(ids)).collect(),
        }
    }
}

/// Template id to replayed id.
#[derive(Debug, Default)]
pub(crate) struct IdMap {
    ids: HashMap<u32, u32>,
}

impl IdMap {
    pub fn insert(&mut self, template: u32, fresh: u32) {
        self.ids.insert(template, fresh);
    }

    fn get(&self, id: u32) -> u32 {
        self.ids.get(&id).copied().unwrap_or(id)
    }

    pub fn label(&self, l: Label) -> Label {
        Label { id: self.get(l.id) }
    }

    pub fn local(&self, l: Local) -> Local {
        Local { id: self.get(l.id) }
    }

    pub fn root(&self, r: RootRef) -> RootRef {
        RootRef { id: self.get(r.id) }
    }
}

/// Accumulates the commands of one handler closure and checks that its
/// begins and ends pair up.
#[derive(Debug, Default)]
pub(crate) struct Recorder {
    commands: Vec<Command>,
    open: Vec<OperationKind>,
}

impl Recorder {
    pub fn record(&mut self, command: Command) -> Result<(), BuildError> {
        match &command {
            Command::Begin(b) => self.open.push(b.kind()),
            Command::BeginRoot => self.open.push(OperationKind::Root),
            Command::End(kind) => self.close(*kind)?,
            Command::EndRoot(_) => self.close(OperationKind::Root)?,
            _ => {}
        }
        self.commands.push(command);
        Ok(())
    }

    fn close(&mut self, kind: OperationKind) -> Result<(), BuildError> {
        match self.open.last() {
            Some(top) if *top == kind => {
                self.open.pop();
                Ok(())
            }
            Some(top) => Err(BuildError::in_operation(
                kind.name(),
                format!(
                    "Unexpected end{}: the innermost open operation is {}.",
                    kind, top
                ),
            )),
            None => Err(BuildError::in_operation(
                kind.name(),
                format!(
                    "Unexpected end{}: the finally handler has no open operation.",
                    kind
                ),
            )),
        }
    }

    pub fn finish(self) -> Result<Plan, BuildError> {
        if let Some(top) = self.open.last() {
            return Err(BuildError::in_operation(
                top.name(),
                format!("Finally handler ended while operation {} was still open.", top),
            ));
        }
        Ok(Plan {
            commands: self.commands,
        })
    }
}
