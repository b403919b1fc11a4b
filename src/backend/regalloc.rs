//! Register allocation by interference-graph coloring with move coalescing.
//!
//! Every virtual value gets one of the allocatable physical registers such
//! that no two simultaneously-live values share one.  There is no spill
//! path: if some value finds no free register, allocation fails and the
//! compilation aborts.  That is a known limitation, not a recoverable
//! condition.

use crate::backend::abi::Register;
use crate::backend::liveness::Liveness;
use crate::ir::{Addr, Func, Instr, Operand, ValueId};
use log::debug;
use std::cmp::Reverse;
use std::collections::HashSet;
use thiserror::Error;

#[derive(Error, Debug)]
#[error("no free register for `{value}` in `{func}` (spilling is not supported)")]
pub struct AllocError {
    pub func: String,
    pub value: String,
}

/// Allocate registers for `f` and rewrite every operand to its physical
/// register.  `live` must be fresh for the current instruction list.
pub fn allocate(f: &mut Func, live: &Liveness) -> Result<(), AllocError> {
    let n = f.num_values();
    let mut graph: Vec<HashSet<u32>> = vec![HashSet::new(); n];

    // Interference: a definition clashes with everything live after it,
    // except itself — and except a move's own source, which is what leaves
    // the door open for coalescing.  Calls clobber the caller-saved run, so
    // those registers clash with everything live across the call.
    for (i, instr) in f.instrs.iter().enumerate() {
        if let Some(d) = instr.writes() {
            let move_src = match instr {
                Instr::Mov { src, .. } => Some(*src),
                _ => None,
            };
            for &v in &live.live_out[i] {
                if v != d && Some(v) != move_src {
                    add_edge(&mut graph, d, v);
                }
            }
        }
        if matches!(instr, Instr::Call { .. }) {
            for r in Register::caller_saved() {
                let rv = Func::reg(r);
                for &v in &live.live_out[i] {
                    if v != rv {
                        add_edge(&mut graph, rv, v);
                    }
                }
            }
        }
    }

    // Physical registers are pre-colored with themselves.
    let mut assign: Vec<Option<Register>> = (0..n)
        .map(|i| match f.value_kind(ValueId(i as u32)) {
            crate::ir::ValueKind::Reg(r) => Some(*r),
            _ => None,
        })
        .collect();

    // Virtual values that actually appear in the instruction stream.
    let mut occurs: HashSet<u32> = HashSet::new();
    for instr in &f.instrs {
        for v in instr.reads() {
            occurs.insert(v.0);
        }
        if let Some(d) = instr.writes() {
            occurs.insert(d.0);
        }
    }
    let mut order: Vec<ValueId> = occurs
        .iter()
        .map(|&v| ValueId(v))
        .filter(|&v| !f.is_reg(v))
        .collect();
    // Highest interference degree first: constrained values choose while
    // registers are still plentiful.  Value index breaks ties so the
    // allocation is deterministic.
    order.sort_by_key(|v| (Reverse(graph[v.0 as usize].len()), v.0));

    coalesce(f, &graph, &mut assign);

    for &v in &order {
        if assign[v.0 as usize].is_some() {
            continue;
        }
        let taken: HashSet<Register> = graph[v.0 as usize]
            .iter()
            .filter_map(|&nb| assign[nb as usize])
            .collect();
        let reg = Register::allocatable().find(|r| !taken.contains(r));
        let Some(reg) = reg else {
            return Err(AllocError {
                func: f.name.clone(),
                value: f.value_name(v),
            });
        };
        assign[v.0 as usize] = Some(reg);
        // A fresh assignment can satisfy pending move constraints.
        coalesce(f, &graph, &mut assign);
    }

    debug!(
        "`{}`: {} virtual values colored onto {} registers",
        f.name,
        order.len(),
        assign
            .iter()
            .enumerate()
            .filter(|(i, a)| a.is_some() && !f.is_reg(ValueId(*i as u32)))
            .filter_map(|(_, a)| *a)
            .collect::<HashSet<_>>()
            .len()
    );

    rewrite(f, &assign);
    Ok(())
}

fn add_edge(graph: &mut [HashSet<u32>], a: ValueId, b: ValueId) {
    graph[a.0 as usize].insert(b.0);
    graph[b.0 as usize].insert(a.0);
}

/// For every move with one side assigned and the other not, give the
/// unassigned side the same register when interference allows it.  Loops
/// until no move makes progress.
fn coalesce(f: &Func, graph: &[HashSet<u32>], assign: &mut [Option<Register>]) {
    let mut changed = true;
    while changed {
        changed = false;
        for instr in &f.instrs {
            let Instr::Mov { dst, src } = instr else {
                continue;
            };
            let (open, reg) = match (assign[dst.0 as usize], assign[src.0 as usize]) {
                (None, Some(r)) => (*dst, r),
                (Some(r), None) => (*src, r),
                _ => continue,
            };
            if !reg.is_allocatable() {
                continue;
            }
            let blocked = graph[open.0 as usize]
                .iter()
                .any(|&nb| assign[nb as usize] == Some(reg));
            if !blocked {
                assign[open.0 as usize] = Some(reg);
                changed = true;
            }
        }
    }
}

/// Replace every operand and result with its physical register and record
/// the highest register the function touches.
fn rewrite(f: &mut Func, assign: &[Option<Register>]) {
    let mapped: Vec<ValueId> = (0..f.num_values())
        .map(|i| {
            let v = ValueId(i as u32);
            match assign[i] {
                Some(r) if !f.is_reg(v) => Func::reg(r),
                _ => v,
            }
        })
        .collect();
    let m = |v: &mut ValueId| *v = mapped[v.0 as usize];

    for instr in &mut f.instrs {
        match instr {
            Instr::Mov { dst, src } => {
                m(dst);
                m(src);
            }
            Instr::MovImm { dst, .. } => m(dst),
            Instr::Alu { dst, lhs, rhs, .. } => {
                m(dst);
                m(lhs);
                if let Operand::Val(v) = rhs {
                    m(v);
                }
            }
            Instr::Branch { lhs, rhs, .. } => {
                m(lhs);
                m(rhs);
            }
            Instr::Call { args, .. } => {
                for a in args {
                    m(a);
                }
            }
            Instr::Ret { value: Some(v) } => m(v),
            Instr::Load { dst, addr } => {
                m(dst);
                if let Addr::Off { base, .. } = addr {
                    m(base);
                }
            }
            Instr::Store { src, addr } => {
                m(src);
                if let Addr::Off { base, .. } = addr {
                    m(base);
                }
            }
            Instr::LoadStr { dst, .. }
            | Instr::LoadClass { dst, .. }
            | Instr::LoadArr { dst, .. } => m(dst),
            Instr::Nop | Instr::Jump { .. } | Instr::Bind(_) | Instr::Ret { value: None } => {}
        }
    }

    // Highest allocatable register touched; the emitter sizes the
    // callee-save area from this.
    let mut max_used: Option<Register> = None;
    for instr in &f.instrs {
        for v in instr.reads().into_iter().chain(instr.writes()) {
            if let crate::ir::ValueKind::Reg(r) = f.value_kind(v) {
                if r.is_allocatable() {
                    max_used = Some(max_used.map_or(*r, |m| m.max(*r)));
                }
            }
        }
    }
    f.max_reg_used = max_used;
}
