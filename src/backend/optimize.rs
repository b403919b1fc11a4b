//! Peephole optimization: fixpoint local rewriting of the instruction list.
//!
//! Each iteration rebuilds a def/use snapshot, strips unreachable code,
//! applies per-instruction rewrite rules (first match wins), and compacts
//! no-ops out of the list.  The loop stops on the first iteration that
//! changes nothing; every rule either shrinks the list or replaces an
//! instruction with a simpler form, so the fixpoint is reached.
//!
//! Only per-value def/use lists are consulted — no global dataflow.  The
//! single-assignment property of temporaries is what makes "exactly one
//! constant-producing definition" a cheap, reliable test.

use crate::ir::{Addr, AluOp, Func, Instr, LabelId, Operand, ValueId};
use log::trace;
use std::collections::HashSet;

/// Smallest/largest constants the immediate instruction forms can carry.
const IMM_MIN: i32 = -32768;
const IMM_MAX: i32 = 32767;

fn fits_imm(k: i32) -> bool {
    (IMM_MIN..=IMM_MAX).contains(&k)
}

/// Run the optimizer to fixpoint.
pub fn optimize(f: &mut Func) {
    let mut passes = 0usize;
    loop {
        let snap = Snapshot::build(f);
        let mut changed = strip_unreachable(f);
        for i in 0..f.instrs.len() {
            changed |= rewrite_at(f, &snap, i);
        }
        changed |= compact(f);
        passes += 1;
        if !changed {
            break;
        }
    }
    trace!("peephole reached fixpoint on `{}` after {} passes", f.name, passes);
}

// ============================================================================
// Snapshot
// ============================================================================

/// Def/use information derived from one rebuild of the instruction list.
/// Valid until the list is next mutated; the optimizer rebuilds it at the
/// top of every iteration.
struct Snapshot {
    defs: Vec<Vec<usize>>,
    uses: Vec<Vec<usize>>,
    label_uses: Vec<Vec<usize>>,
}

impl Snapshot {
    fn build(f: &mut Func) -> Self {
        f.rebind_labels();
        let mut snap = Snapshot {
            defs: vec![Vec::new(); f.num_values()],
            uses: vec![Vec::new(); f.num_values()],
            label_uses: vec![Vec::new(); f.num_labels()],
        };
        // Parameters count as defined by the entry instruction.
        if !f.instrs.is_empty() {
            for &p in &f.params {
                snap.defs[p.0 as usize].push(0);
            }
        }
        for (i, instr) in f.instrs.iter().enumerate() {
            if let Some(d) = instr.writes() {
                snap.defs[d.0 as usize].push(i);
            }
            for v in instr.reads() {
                snap.uses[v.0 as usize].push(i);
            }
            if let Some(t) = instr.target() {
                snap.label_uses[t.0 as usize].push(i);
            }
        }
        snap
    }

    /// The constant a value is certain to hold: exactly one definition, and
    /// it is an immediate load.  Machine registers are redefined freely and
    /// never qualify.
    fn single_const_def(&self, f: &Func, v: ValueId) -> Option<i32> {
        if f.is_reg(v) {
            return None;
        }
        match self.defs[v.0 as usize].as_slice() {
            [d] => match &f.instrs[*d] {
                Instr::MovImm { dst, imm } if *dst == v => Some(*imm),
                _ => None,
            },
            _ => None,
        }
    }

    fn is_unused(&self, f: &Func, v: ValueId) -> bool {
        !f.is_reg(v) && self.uses[v.0 as usize].is_empty()
    }
}

// ============================================================================
// Reachability
// ============================================================================

/// Everything between an unconditional jump (or return) and the next label
/// marker cannot execute; convert it to no-ops without further inspection.
fn strip_unreachable(f: &mut Func) -> bool {
    let mut reachable = true;
    let mut changed = false;
    for instr in &mut f.instrs {
        match instr {
            Instr::Bind(_) => reachable = true,
            _ if !reachable => {
                if !matches!(instr, Instr::Nop) {
                    *instr = Instr::Nop;
                    changed = true;
                }
            }
            Instr::Jump { .. } | Instr::Ret { .. } => reachable = false,
            _ => {}
        }
    }
    changed
}

// ============================================================================
// Rewrite rules
// ============================================================================

/// Apply at most one rule at position `i`.
fn rewrite_at(f: &mut Func, snap: &Snapshot, i: usize) -> bool {
    // Dead result: the written value is never read (machine registers are
    // exempt — they carry the calling convention).
    if let Some(d) = f.instrs[i].writes() {
        if snap.is_unused(f, d) {
            f.instrs[i] = Instr::Nop;
            return true;
        }
    }

    match f.instrs[i].clone() {
        Instr::Mov { dst, src } => {
            if dst == src {
                f.instrs[i] = Instr::Nop;
                return true;
            }
            if let Some(k) = snap.single_const_def(f, src) {
                f.instrs[i] = Instr::MovImm { dst, imm: k };
                return true;
            }
            false
        }

        Instr::Alu { op, dst, lhs, rhs } => rewrite_alu(f, snap, i, op, dst, lhs, rhs),

        Instr::Jump { target } => {
            if f.label_at(target) == Some(i + 1) {
                f.instrs[i] = Instr::Nop;
                return true;
            }
            false
        }

        Instr::Branch {
            op,
            lhs,
            rhs,
            target,
        } => rewrite_branch(f, snap, i, op, lhs, rhs, target),

        Instr::Bind(l) => {
            if snap.label_uses[l.0 as usize].is_empty() {
                f.instrs[i] = Instr::Nop;
                return true;
            }
            false
        }

        Instr::Load { .. } | Instr::Store { .. } => refold_addr(f, snap, i),

        _ => false,
    }
}

fn rewrite_alu(
    f: &mut Func,
    snap: &Snapshot,
    i: usize,
    op: AluOp,
    dst: ValueId,
    lhs: ValueId,
    rhs: Operand,
) -> bool {
    if let Operand::Val(v) = rhs {
        // Strength-reduce a register operand to an inline constant.
        if let Some(k) = snap.single_const_def(f, v) {
            if fits_imm(k) {
                f.instrs[i] = Instr::Alu {
                    op,
                    dst,
                    lhs,
                    rhs: Operand::Imm(k),
                };
                return true;
            }
        }
        // A constant on the left moves right when the operator commutes.
        if op.commutes() {
            if let Some(k) = snap.single_const_def(f, lhs) {
                if fits_imm(k) {
                    f.instrs[i] = Instr::Alu {
                        op,
                        dst,
                        lhs: v,
                        rhs: Operand::Imm(k),
                    };
                    return true;
                }
            }
        }
        return false;
    }

    let Operand::Imm(k) = rhs else { return false };

    // Both operands constant: fold.
    if let Some(c) = snap.single_const_def(f, lhs) {
        if let Some(folded) = op.eval(c, k) {
            f.instrs[i] = Instr::MovImm { dst, imm: folded };
            return true;
        }
    }

    // Identities.
    let identity = match (op, k) {
        (AluOp::Add | AluOp::Sub | AluOp::Or | AluOp::Xor | AluOp::Shl | AluOp::Shr, 0) => true,
        (AluOp::Mul | AluOp::Div, 1) => true,
        _ => false,
    };
    if identity {
        f.instrs[i] = Instr::Mov { dst, src: lhs };
        return true;
    }

    // Powers of two: multiply/divide become shifts, remainder becomes a mask.
    if k > 1 && k & (k - 1) == 0 {
        let sh = k.trailing_zeros() as i32;
        let replacement = match op {
            AluOp::Mul => Some((AluOp::Shl, sh)),
            AluOp::Div => Some((AluOp::Shr, sh)),
            AluOp::Mod => Some((AluOp::And, k - 1)),
            _ => None,
        };
        if let Some((new_op, new_k)) = replacement {
            f.instrs[i] = Instr::Alu {
                op: new_op,
                dst,
                lhs,
                rhs: Operand::Imm(new_k),
            };
            return true;
        }
    }

    false
}

fn rewrite_branch(
    f: &mut Func,
    snap: &Snapshot,
    i: usize,
    op: crate::ir::RelOp,
    lhs: ValueId,
    rhs: ValueId,
    target: LabelId,
) -> bool {
    // Branch to the immediately following marker does nothing.
    if f.label_at(target) == Some(i + 1) {
        f.instrs[i] = Instr::Nop;
        return true;
    }

    // Branch threading: a target whose marker is immediately followed by an
    // unconditional jump might as well aim at the jump's destination.
    let threaded = thread_target(f, target);
    if threaded != target {
        f.instrs[i] = Instr::Branch {
            op,
            lhs,
            rhs,
            target: threaded,
        };
        return true;
    }

    // A constant-zero operand is the zero register.
    let zero = Func::reg(crate::backend::abi::Register::ZERO);
    if snap.single_const_def(f, lhs) == Some(0) {
        f.instrs[i] = Instr::Branch {
            op,
            lhs: zero,
            rhs,
            target,
        };
        return true;
    }
    if snap.single_const_def(f, rhs) == Some(0) {
        f.instrs[i] = Instr::Branch {
            op,
            lhs,
            rhs: zero,
            target,
        };
        return true;
    }

    // branch L; jump M; L:  ⇒  inverted branch M, dropping the jump.
    if i + 2 < f.instrs.len() && f.instrs[i + 2] == Instr::Bind(target) {
        if let Instr::Jump { target: m } = f.instrs[i + 1] {
            f.instrs[i] = Instr::Branch {
                op: op.negate(),
                lhs,
                rhs,
                target: m,
            };
            f.instrs[i + 1] = Instr::Nop;
            return true;
        }
    }

    false
}

/// Follow `label → jump` chains to their final destination.  A visited set
/// makes label cycles (unreachable self-loops) a no-op instead of an
/// oscillation.
fn thread_target(f: &Func, start: LabelId) -> LabelId {
    let mut seen = HashSet::new();
    let mut cur = start;
    while seen.insert(cur) {
        let Some(pos) = f.label_at(cur) else { break };
        match f.instrs.get(pos + 1) {
            Some(Instr::Jump { target }) => cur = *target,
            _ => break,
        }
    }
    cur
}

/// A load/store whose address was just computed by an `add constant` on the
/// previous instruction folds the constant into its displacement.
fn refold_addr(f: &mut Func, snap: &Snapshot, i: usize) -> bool {
    let (base, off) = match &f.instrs[i] {
        Instr::Load {
            addr: Addr::Off { base, off },
            ..
        }
        | Instr::Store {
            addr: Addr::Off { base, off },
            ..
        } => (*base, *off),
        _ => return false,
    };
    if i == 0 || snap.defs[base.0 as usize] != [i - 1] {
        return false;
    }
    let (b0, k) = match &f.instrs[i - 1] {
        Instr::Alu {
            op: AluOp::Add,
            dst,
            lhs,
            rhs: Operand::Imm(k),
        } if *dst == base => (*lhs, *k),
        _ => return false,
    };
    let folded = Addr::Off {
        base: b0,
        off: off + k,
    };
    match &mut f.instrs[i] {
        Instr::Load { addr, .. } | Instr::Store { addr, .. } => *addr = folded,
        _ => unreachable!(),
    }
    true
}

/// Remove the no-ops accumulated this iteration.
fn compact(f: &mut Func) -> bool {
    let before = f.instrs.len();
    f.instrs.retain(|instr| !matches!(instr, Instr::Nop));
    f.instrs.len() != before
}
