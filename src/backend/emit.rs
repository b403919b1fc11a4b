//! Assembly emission: fully-allocated IR → M32 assembly text.
//!
//! Emits each function with its prologue/epilogue, then one data segment
//! for the whole program: class descriptors, constant arrays, deduplicated
//! string literals, and module-level word slots.  Every operand must be a
//! physical register by now; anything else is an invariant violation in an
//! earlier pass and reported as [`EmitError::Malformed`].

use crate::ast::ElemWidth;
use crate::backend::abi::Register;
use crate::ir::{Addr, AluOp, Func, Instr, LabelId, RelOp, ValueId, ValueKind};
use crate::session::Session;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmitError {
    #[error("malformed instruction in `{func}`: {detail}")]
    Malformed { func: String, detail: String },
}

/// Emit the whole program: every function in session order, then the data
/// segment.
pub fn emit_program(session: &Session) -> Result<String, EmitError> {
    let mut out: Vec<String> = Vec::new();
    out.push("; m32 assembly".to_string());
    out.push(String::new());

    for f in &session.funcs {
        emit_func(f, session, &mut out)?;
        out.push(String::new());
    }

    emit_data(session, &mut out);
    Ok(out.join("\n") + "\n")
}

// ============================================================================
// Functions
// ============================================================================

fn emit_func(f: &Func, session: &Session, out: &mut Vec<String>) -> Result<(), EmitError> {
    // Callee-save area: every register from `$9` up to the highest the
    // allocator handed out, plus a link slot if the function calls anything.
    let saved: Vec<Register> = match f.max_reg_used {
        Some(max) => (Register::LAST_CALLER_SAVED + 1..=max.index() as u8)
            .map(Register::new)
            .collect(),
        None => Vec::new(),
    };
    let makes_call = f.instrs.iter().any(|i| matches!(i, Instr::Call { .. }));

    let locals = f.frame.high_water();
    let frame = locals + 4 * saved.len() as i32 + if makes_call { 4 } else { 0 };
    let link_off = locals + 4 * saved.len() as i32;

    out.push(format!("{}:", f.name));
    if frame > 0 {
        out.push(format!("  subi {}, {}, {frame}", Register::STACK_PTR, Register::STACK_PTR));
    }
    for (i, r) in saved.iter().enumerate() {
        out.push(format!("  sw {r}, {}({})", locals + 4 * i as i32, Register::STACK_PTR));
    }
    if makes_call {
        out.push(format!("  sw {}, {link_off}({})", Register::LINK, Register::STACK_PTR));
    }

    for instr in &f.instrs {
        emit_instr(f, session, instr, &saved, frame, link_off, makes_call, out)?;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn emit_instr(
    f: &Func,
    session: &Session,
    instr: &Instr,
    saved: &[Register],
    frame: i32,
    link_off: i32,
    makes_call: bool,
    out: &mut Vec<String>,
) -> Result<(), EmitError> {
    let sp = Register::STACK_PTR;
    let reg = |v: ValueId| -> Result<Register, EmitError> {
        match f.value_kind(v) {
            ValueKind::Reg(r) => Ok(*r),
            _ => Err(EmitError::Malformed {
                func: f.name.clone(),
                detail: format!("virtual value `{}` survived allocation", f.value_name(v)),
            }),
        }
    };

    match instr {
        Instr::Nop => {}

        Instr::Mov { dst, src } => {
            out.push(format!("  add {}, $0, {}", reg(*dst)?, reg(*src)?));
        }
        Instr::MovImm { dst, imm } => {
            out.push(format!("  addi {}, $0, {imm}", reg(*dst)?));
        }

        Instr::Alu { op, dst, lhs, rhs } => {
            let mn = alu_mnemonic(*op);
            match rhs {
                crate::ir::Operand::Val(v) => {
                    out.push(format!("  {mn} {}, {}, {}", reg(*dst)?, reg(*lhs)?, reg(*v)?));
                }
                crate::ir::Operand::Imm(k) => {
                    out.push(format!("  {mn}i {}, {}, {k}", reg(*dst)?, reg(*lhs)?));
                }
            }
        }

        Instr::Branch {
            op,
            lhs,
            rhs,
            target,
        } => {
            let a = reg(*lhs)?;
            let b = reg(*rhs)?;
            let t = local_label(f, *target);
            let scratch = Register::SCRATCH;
            // No direct two-register branches on M32: equality goes through
            // xor, orderings through a set-compare, then branch on zero.
            let (set, bz) = match op {
                RelOp::Eq => ("xor", "beqz"),
                RelOp::Ne => ("xor", "bnez"),
                RelOp::Lt => ("slt", "bnez"),
                RelOp::Ge => ("slt", "beqz"),
                RelOp::Gt => ("sgt", "bnez"),
                RelOp::Le => ("sgt", "beqz"),
            };
            out.push(format!("  {set} {scratch}, {a}, {b}"));
            out.push(format!("  {bz} {scratch}, {t}"));
        }

        Instr::Jump { target } => {
            out.push(format!("  j {}", local_label(f, *target)));
        }
        Instr::Bind(l) => {
            out.push(format!("{}:", local_label(f, *l)));
        }

        Instr::Call { callee, .. } => {
            out.push(format!("  jal {callee}"));
        }

        Instr::Ret { .. } => {
            if makes_call {
                out.push(format!("  lw {}, {link_off}({sp})", Register::LINK));
            }
            let locals = f.frame.high_water();
            for (i, r) in saved.iter().enumerate() {
                out.push(format!("  lw {r}, {}({sp})", locals + 4 * i as i32));
            }
            if frame > 0 {
                out.push(format!("  addi {sp}, {sp}, {frame}"));
            }
            out.push(format!("  jr {}", Register::LINK));
        }

        Instr::Load { dst, addr } => match addr {
            Addr::Off { base, off } => {
                out.push(format!("  lw {}, {off}({})", reg(*dst)?, reg(*base)?));
            }
            Addr::Global(sym) => {
                out.push(format!("  lw {}, {sym}($0)", reg(*dst)?));
            }
        },
        Instr::Store { src, addr } => match addr {
            Addr::Off { base, off } => {
                out.push(format!("  sw {}, {off}({})", reg(*src)?, reg(*base)?));
            }
            Addr::Global(sym) => {
                out.push(format!("  sw {}, {sym}($0)", reg(*src)?));
            }
        },

        Instr::LoadStr { dst, string } => {
            out.push(format!("  la {}, str_{}", reg(*dst)?, string.0));
        }
        Instr::LoadClass { dst, class } => {
            out.push(format!("  la {}, class_{}", reg(*dst)?, session.class(*class).name));
        }
        Instr::LoadArr { dst, arr } => {
            out.push(format!("  la {}, arr_{}", reg(*dst)?, arr.0));
        }
    }
    Ok(())
}

fn alu_mnemonic(op: AluOp) -> &'static str {
    match op {
        AluOp::Add => "add",
        AluOp::Sub => "sub",
        AluOp::Mul => "mul",
        AluOp::Div => "div",
        AluOp::Mod => "mod",
        AluOp::And => "and",
        AluOp::Or => "or",
        AluOp::Xor => "xor",
        AluOp::Shl => "sll",
        AluOp::Shr => "srl",
    }
}

fn local_label(f: &Func, l: LabelId) -> String {
    format!("{}_L{}", f.name, l.0)
}

// ============================================================================
// Data segment
// ============================================================================

fn emit_data(session: &Session, out: &mut Vec<String>) {
    out.push("; data segment".to_string());

    // Class descriptors: name reference, instance size, superclass or zero,
    // then the virtual table in declared order.
    for desc in session.classes() {
        out.push(format!("class_{}:", desc.name));
        out.push(format!("  dcw str_{}", desc.name_str.0));
        out.push(format!("  dcw {}", desc.size));
        match desc.superclass {
            Some(id) => out.push(format!("  dcw class_{}", session.class(id).name)),
            None => out.push("  dcw 0".to_string()),
        }
        for m in &desc.vtable {
            out.push(format!("  dcw {m}"));
        }
    }

    // Constant arrays: length word, then the labelled data in its element
    // width.
    for (i, arr) in session.const_arrays().iter().enumerate() {
        out.push(format!("  dcw {}", arr.values.len()));
        out.push(format!("arr_{i}:"));
        let directive = match arr.width {
            ElemWidth::Word => "dcw",
            ElemWidth::Half => "dch",
            ElemWidth::Byte => "dcb",
        };
        for v in &arr.values {
            out.push(format!("  {directive} {v}"));
        }
    }

    // Deduplicated strings: byte-length word, then the bytes packed four to
    // a little-endian word.
    for (i, s) in session.strings().iter().enumerate() {
        out.push(format!("  dcw {}", s.len()));
        out.push(format!("str_{i}: ; {:?}", s));
        for word in pack_string(s) {
            out.push(format!("  dcw 0x{word:08x}"));
        }
    }

    // Module-level word slots.
    for g in &session.globals {
        out.push(format!("{g}:"));
        out.push("  dcw 0".to_string());
    }
}

/// Pack a string's bytes little-endian, four per word, zero-padded.
pub(crate) fn pack_string(s: &str) -> Vec<u32> {
    s.as_bytes()
        .chunks(4)
        .map(|chunk| {
            let mut w = 0u32;
            for (i, &b) in chunk.iter().enumerate() {
                w |= (b as u32) << (8 * i);
            }
            w
        })
        .collect()
}
