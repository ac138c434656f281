//! Compiler worker session and message protocol.
//!
//! The pipeline never runs a compiler in-process. Compilation happens in an
//! external worker process that speaks a framed JSON protocol over
//! stdin/stdout; this module owns the worker lifecycle and the wire types.

mod protocol;
mod session;

pub use protocol::{
    read_message, write_message, AssemblyPayload, CompilePayload, ErrorPayload, MessageBody,
    ReferenceFile, SourceFile, WorkerMessage,
};
pub use session::{
    attribute_diagnostics, CompileJob, CompileOutcome, CompilerSession, Diagnostic, SessionConfig,
};
