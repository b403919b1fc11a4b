//! M32 backend — lowers the typed program tree to M32 assembly.
//!
//! Module layout:
//! - `abi`      — register definitions and calling-convention constants
//! - `codegen`  — program tree → virtual-register IR
//! - `liveness` — per-instruction backward dataflow
//! - `optimize` — fixpoint peephole rewriting
//! - `regalloc` — interference-graph coloring with coalescing
//! - `emit`     — assembly text and data-segment emission
//! - `interp`   — direct IR interpretation (test oracle)
//! - `tools`    — external assembler / simulator wrappers

pub mod abi;
pub mod codegen;
pub mod emit;
pub mod interp;
pub mod liveness;
pub mod optimize;
pub mod regalloc;
pub mod tools;

use crate::ast::Program;
use crate::session::Session;
use crate::CompileError;
use log::debug;

/// Compile a program to M32 assembly text.
///
/// Resets the session, generates IR for every function, runs each through
/// the fixed per-function pass order (optimize → liveness → allocate →
/// optimize), and emits everything plus one data segment.
pub fn compile_program(prog: &Program, session: &mut Session) -> Result<String, CompileError> {
    session.reset();
    codegen::lower_program(prog, session)?;
    optimize_and_allocate(session)?;
    Ok(emit::emit_program(session)?)
}

/// Run the per-function backend passes over every generated function.
///
/// Liveness is recomputed after the first peephole pass because rewriting
/// shifts instruction indices and successor edges; the trailing peephole
/// pass cleans up the self-moves coalescing leaves behind.
pub fn optimize_and_allocate(session: &mut Session) -> Result<(), CompileError> {
    for i in 0..session.funcs.len() {
        let f = &mut session.funcs[i];
        debug!("backend passes for `{}` ({} instrs)", f.name, f.instrs.len());
        optimize::optimize(f);
        let live = liveness::compute(f);
        if let Err(e) = regalloc::allocate(f, &live) {
            session.error(e.to_string());
            return Err(e.into());
        }
        optimize::optimize(&mut session.funcs[i]);
    }
    Ok(())
}
