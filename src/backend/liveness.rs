//! Liveness analysis over a function's instruction list.
//!
//! Computes, for every instruction position, the set of values live
//! immediately *after* that instruction, by iterative backward dataflow.
//! The control-flow graph is per-instruction: the successor set is the next
//! instruction in program order (except after jumps and returns) plus the
//! bound target of any branch or jump.  Results are invalidated by any
//! mutation of the instruction list.

use crate::ir::{Func, Instr, ValueId};
use std::collections::HashSet;

/// Per-instruction liveness for one function.
pub struct Liveness {
    /// `live_out[i]` — values live after instruction `i` executes.
    pub live_out: Vec<HashSet<ValueId>>,
}

impl Liveness {
    pub fn is_live_after(&self, i: usize, v: ValueId) -> bool {
        self.live_out.get(i).is_some_and(|s| s.contains(&v))
    }
}

/// Compute liveness.  Rebinds the function's labels first, since successor
/// edges go through label positions.
pub fn compute(f: &mut Func) -> Liveness {
    f.rebind_labels();
    let n = f.instrs.len();

    let mut succs: Vec<Vec<usize>> = Vec::with_capacity(n);
    for (i, instr) in f.instrs.iter().enumerate() {
        let mut s = Vec::with_capacity(2);
        match instr {
            Instr::Jump { target } => {
                if let Some(t) = f.label_at(*target) {
                    s.push(t);
                }
            }
            Instr::Ret { .. } => {}
            Instr::Branch { target, .. } => {
                if i + 1 < n {
                    s.push(i + 1);
                }
                if let Some(t) = f.label_at(*target) {
                    s.push(t);
                }
            }
            _ => {
                if i + 1 < n {
                    s.push(i + 1);
                }
            }
        }
        succs.push(s);
    }

    let mut live_in: Vec<HashSet<ValueId>> = vec![HashSet::new(); n];
    let mut live_out: Vec<HashSet<ValueId>> = vec![HashSet::new(); n];

    // Backward fixpoint: sets only grow, so this terminates.
    let mut changed = true;
    while changed {
        changed = false;
        for i in (0..n).rev() {
            let mut new_out = HashSet::new();
            for &s in &succs[i] {
                for &v in &live_in[s] {
                    new_out.insert(v);
                }
            }

            // live_in = uses ∪ (live_out − defs)
            let instr = &f.instrs[i];
            let def = instr.writes();
            let mut new_in: HashSet<ValueId> = instr.reads().into_iter().collect();
            for &v in &new_out {
                if def != Some(v) {
                    new_in.insert(v);
                }
            }

            if new_in != live_in[i] || new_out != live_out[i] {
                changed = true;
                live_in[i] = new_in;
                live_out[i] = new_out;
            }
        }
    }

    Liveness { live_out }
}
