//! Core of the Kiln toolchain.
//!
//! This crate provides an incrementally steppable compiler from Kiln
//! source to WebAssembly. Embedders create a [`Context`], register units,
//! call [`Context::step`] until it reports completion, then read the
//! diagnostics and the emitted module. Each step does one bounded piece
//! of work:
//!
//!   units (.kiln files, injected buffers, the core library)
//!     -> lexer      (tokens)
//!     -> parser     (AST, `#load` discovers more units)
//!     -> name_resolve + typecheck (symbols, types, HIR)
//!     -> lower      (wasm instructions, folded globals, data)
//!     -> codegen_wasm (wasm-encoder)
//!
//! Higher-level tools (the CLI, etc.) should depend on this crate rather
//! than reimplementing the pipeline.

// ---------------------------------------------------------------------
// Error handling and diagnostics
// ---------------------------------------------------------------------

pub mod span;
pub mod diagnostic;
pub mod error;

// ---------------------------------------------------------------------
// Configuration and units
// ---------------------------------------------------------------------

pub mod options;
pub mod registry;
pub mod corelib;

// ---------------------------------------------------------------------
// Front-end: lexing and parsing
// ---------------------------------------------------------------------

pub mod lexer;
pub mod parser;
pub mod ast;

// ---------------------------------------------------------------------
// Semantic layers: types, name resolution, type checking, HIR
// ---------------------------------------------------------------------

pub mod types;
pub mod builtins;
pub mod name_resolve;
pub mod typecheck;
pub mod hir;

// ---------------------------------------------------------------------
// Back-end: lowering and code generation
// ---------------------------------------------------------------------

pub mod lower;
pub mod codegen_wasm;

// ---------------------------------------------------------------------
// Driving: the pump, the context and one-shot compilation
// ---------------------------------------------------------------------

pub mod scheduler;
pub mod context;
pub mod compiler;

// ---------------------------------------------------------------------
// Public API re-exports
// ---------------------------------------------------------------------

pub use compiler::{CompilationArtifact, compile_wasm};
pub use context::Context;
pub use diagnostic::{DiagnosticRecord, Severity};
pub use error::KilnError;
pub use options::{OptionKey, OptionValue};
pub use scheduler::{PipelineState, PumpStatus};
pub use span::UnitId;
