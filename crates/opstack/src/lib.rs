//! Opstack - a structured-control-flow bytecode builder and stack interpreter
//!
//! A front-end describes a function as a tree of operations, streamed into a
//! [`Builder`] as matched `begin_*`/`end_*` calls with leaf `emit_*` calls in
//! between. The builder validates the tree as it arrives and lowers it
//! straight to a compact bytecode image with an exception handler table.
//! Images run on a small stack interpreter.
//!
//! # Features
//!
//! - **Structured control flow**: blocks, conditionals, `while` loops,
//!   short-circuit `and`/`or`, forward branches to labels
//! - **Exceptions**: try/catch, and finally handlers that run on every exit
//!   (fall-through, `return`, branch out, exception)
//! - **Coroutines**: `yield` suspends into a resumable [`ContinuationResult`]
//! - **Source mapping**: bytecode ranges map back to [`SourceSection`]s
//! - **Resource limits**: uncatchable instruction and recursion limits
//!
//! # Quick Start
//!
//! ```
//! use opstack::{Builder, Value};
//!
//! let mut b = Builder::new();
//! b.begin_root()?;
//! b.begin_return()?;
//! b.begin_add()?;
//! b.emit_load_argument(0)?;
//! b.emit_load_constant(1)?;
//! b.end_add()?;
//! b.end_return()?;
//! let root = b.end_root()?;
//!
//! let image = b.image(root).expect("root was finished");
//! let out = image.call(vec![Value::Int(41)])?.into_returned();
//! assert_eq!(out, Some(Value::Int(42)));
//! # Ok::<(), opstack::Error>(())
//! ```
//!
//! # Finally handlers
//!
//! A finally handler is described once, by a closure, and physically copied
//! to every exit out of its protected body:
//!
//! ```
//! use std::sync::{Arc, Mutex};
//! use opstack::{Builder, Value};
//!
//! let log = Arc::new(Mutex::new(Vec::new()));
//! let sink = log.clone();
//! let record = Value::host("record", move |args| {
//!     sink.lock().unwrap().push(args[0].to_string());
//!     Value::Null
//! });
//!
//! let mut b = Builder::new();
//! b.begin_root()?;
//! b.begin_finally_try(None, |b| {
//!     b.begin_invoke()?;
//!     b.emit_load_constant(record.clone())?;
//!     b.emit_load_constant("cleanup")?;
//!     b.end_invoke()
//! })?;
//! b.emit_return("done")?;
//! b.end_finally_try()?;
//! let root = b.end_root()?;
//!
//! let out = b.image(root).expect("finished").call(vec![])?.into_returned();
//! assert_eq!(out, Some(Value::from("done")));
//! assert_eq!(*log.lock().unwrap(), vec!["\"cleanup\"".to_string()]);
//! # Ok::<(), opstack::Error>(())
//! ```

mod builder;
mod bytecode;
mod diagnostic;
mod disasm;
mod error;
mod interpreter;
mod limits;
mod operation;
mod plan;
mod registry;
mod source;
mod value;

pub use builder::Builder;
pub use bytecode::{BytecodeImage, ExceptionHandlerEntry, Opcode};
pub use diagnostic::{Diagnostic, Span};
pub use disasm::{Instruction, SourceRange};
pub use error::{BuildError, Error, Result};
pub use interpreter::{ContinuationResult, Execution};
pub use limits::ResourceLimits;
pub use operation::OperationKind;
pub use registry::{Label, Local, RootRef};
pub use source::{Source, SourceSection};
pub use value::{HostFn, HostFunction, Value};
