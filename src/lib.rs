//! m32-compiler — compiler backend for the M32 machine.
//!
//! Consumes a typed, fully resolved program tree ([`ast::Program`]) and
//! produces M32 assembly text.  The pipeline per function is: code
//! generation into a virtual-register IR, peephole optimization, liveness
//! analysis, graph-coloring register allocation with move coalescing, a
//! final peephole pass, then assembly emission with one shared data
//! segment.  An IR interpreter doubles as the test oracle for the whole
//! pipeline.
//!
//! Lexing, parsing, and type checking are external collaborators; so are
//! the assembler and hardware simulator this crate's output feeds into.

pub mod ast;
pub mod backend;
pub mod ir;
pub mod session;

pub use session::Session;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CompileError {
    #[error("code generation failed: {0}")]
    Codegen(#[from] backend::codegen::CodegenError),

    #[error("register allocation failed: {0}")]
    Alloc(#[from] backend::regalloc::AllocError),

    #[error("assembly emission failed: {0}")]
    Emit(#[from] backend::emit::EmitError),

    #[error("external tool failed: {0}")]
    Tool(#[from] backend::tools::ToolError),
}

/// Compile a typed program to M32 assembly text.
pub fn compile(program: &ast::Program, session: &mut Session) -> Result<String, CompileError> {
    backend::compile_program(program, session)
}
