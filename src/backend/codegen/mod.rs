//! Code generation: typed program tree → virtual-register IR.
//!
//! One [`Codegen`] per function.  Statements are lowered here; expression
//! lowering and the boolean control-flow protocol live in `expr`.  The
//! generator emits everything later phases need — no pass after this one
//! looks at the program tree.

mod expr;

use crate::ast::{BinOp, FuncDecl, LValue, Program, Stmt, WhenCase};
use crate::backend::abi::Register;
use crate::ir::{Addr, AluOp, Callee, Func, Instr, LabelId, Operand, RelOp, RuntimeFn, ValueId};
use crate::session::Session;
use log::debug;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodegenError {
    #[error("`{construct}` is not yet supported (in `{func}`)")]
    Unsupported { construct: String, func: String },

    #[error("call to unknown function `{callee}` (in `{func}`)")]
    UnknownCallee { callee: String, func: String },

    #[error("call to `{callee}` needs more than {max} argument registers (in `{func}`)")]
    TooManyArgs {
        callee: String,
        max: usize,
        func: String,
    },

    #[error("`{func}` declares more than {max} register parameters")]
    TooManyParams { func: String, max: usize },
}

/// Call-site view of a function: how many argument registers to fill and
/// whether a result comes back in `$1`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FnSig {
    /// Fixed argument slots (receiver + declared parameters).
    pub fixed: usize,
    pub variadic: bool,
    pub returns: bool,
}

impl FnSig {
    fn of(decl: &FuncDecl) -> Self {
        Self {
            fixed: decl.receiver.is_some() as usize + decl.params.len(),
            variadic: decl.variadic.is_some(),
            returns: decl.returns,
        }
    }
}

/// Lower every function of a program into the session's function list.
pub fn lower_program(prog: &Program, session: &mut Session) -> Result<(), CodegenError> {
    session.register_classes(&prog.classes);
    session.globals = prog.globals.clone();

    let sigs: HashMap<String, FnSig> = prog
        .funcs
        .iter()
        .map(|d| (d.name.clone(), FnSig::of(d)))
        .collect();

    for decl in &prog.funcs {
        debug!("lowering function `{}`", decl.name);
        let cg = Codegen::new(session, &sigs);
        let f = cg.lower_function(decl)?;
        session.funcs.push(f);
    }
    Ok(())
}

/// Per-function code generation state.
pub struct Codegen<'a> {
    pub(crate) session: &'a mut Session,
    pub(crate) sigs: &'a HashMap<String, FnSig>,
    pub(crate) f: Func,
    /// Innermost loop's exit / re-test labels; saved and restored around
    /// nested loop bodies.
    break_label: Option<LabelId>,
    continue_label: Option<LabelId>,
    /// Counter for compiler-introduced mutable variables.
    hidden: u32,
}

impl<'a> Codegen<'a> {
    fn new(session: &'a mut Session, sigs: &'a HashMap<String, FnSig>) -> Self {
        Self {
            session,
            sigs,
            f: Func::new(""),
            break_label: None,
            continue_label: None,
            hidden: 0,
        }
    }

    fn lower_function(mut self, decl: &FuncDecl) -> Result<Func, CodegenError> {
        if decl.arg_slots() > Register::MAX_ARGS {
            return Err(CodegenError::TooManyParams {
                func: decl.name.clone(),
                max: Register::MAX_ARGS,
            });
        }
        self.f = Func::new(&decl.name);

        // Entry: copy the incoming argument registers into their variables.
        // Coalescing later folds these moves away where nothing interferes.
        let mut slot = 0;
        if decl.receiver.is_some() {
            self.bind_param("this", slot);
            slot += 1;
        }
        for p in &decl.params {
            self.bind_param(p, slot);
            slot += 1;
        }
        if let Some(pack) = &decl.variadic {
            self.bind_param(pack, slot);
        }
        if decl.returns {
            self.f.ret_val = Some(Func::reg(Register::RESULT));
        }

        for stmt in &decl.body {
            self.stmt(stmt)?;
        }

        let ret_label = self.f.ret_label;
        self.f.bind(ret_label);
        let value = self.f.ret_val;
        self.push(Instr::Ret { value });
        Ok(self.f)
    }

    fn bind_param(&mut self, name: &str, slot: usize) {
        let arg = Func::reg(Register::arg(slot));
        let var = self.f.var(name);
        self.push(Instr::Mov { dst: var, src: arg });
        self.f.params.push(arg);
    }

    // ── Small helpers ───────────────────────────────────────────────────

    pub(crate) fn push(&mut self, instr: Instr) {
        self.f.push(instr);
    }

    pub(crate) fn zero(&self) -> ValueId {
        Func::reg(Register::ZERO)
    }

    pub(crate) fn sp(&self) -> ValueId {
        Func::reg(Register::STACK_PTR)
    }

    /// Load a constant into a fresh temporary.
    pub(crate) fn imm(&mut self, imm: i32) -> ValueId {
        let t = self.f.temp();
        self.push(Instr::MovImm { dst: t, imm });
        t
    }

    /// A compiler-introduced mutable variable (loop cursors, materialised
    /// booleans) — these are reassigned, so they cannot be temporaries.
    pub(crate) fn hidden_var(&mut self, tag: &str) -> ValueId {
        self.hidden += 1;
        let name = format!("@{tag}{}", self.hidden);
        self.f.var(&name)
    }

    pub(crate) fn unsupported<T>(&self, construct: &str) -> Result<T, CodegenError> {
        Err(CodegenError::Unsupported {
            construct: construct.to_string(),
            func: self.f.name.clone(),
        })
    }

    // ── Statements ──────────────────────────────────────────────────────

    fn block(&mut self, stmts: &[Stmt]) -> Result<(), CodegenError> {
        for s in stmts {
            self.stmt(s)?;
        }
        Ok(())
    }

    /// Run a loop body with fresh break/continue labels, restoring the
    /// enclosing pair afterwards.
    fn loop_body(
        &mut self,
        body: &[Stmt],
        brk: LabelId,
        cont: LabelId,
    ) -> Result<(), CodegenError> {
        let saved = (self.break_label, self.continue_label);
        self.break_label = Some(brk);
        self.continue_label = Some(cont);
        let r = self.block(body);
        self.break_label = saved.0;
        self.continue_label = saved.1;
        r
    }

    fn stmt(&mut self, stmt: &Stmt) -> Result<(), CodegenError> {
        match stmt {
            Stmt::Expr(e) => {
                self.gen_expr(e)?;
                Ok(())
            }

            Stmt::Assign { target, value } => self.assign(target, value),
            Stmt::AugAssign { op, target, value } => self.aug_assign(*op, target, value),

            Stmt::If { arms, else_body } => self.if_stmt(arms, else_body.as_deref()),
            Stmt::When {
                scrutinee,
                cases,
                else_body,
            } => self.when_stmt(scrutinee, cases, else_body.as_deref()),

            Stmt::While { cond, body } => self.while_stmt(cond, body),
            Stmt::RepeatUntil { body, cond } => self.repeat_stmt(body, cond),
            Stmt::ForRange {
                var,
                from,
                to,
                down,
                body,
            } => self.for_range(var, from, to, *down, body),
            Stmt::ForEach { var, array, body } => self.for_each(var, array, body),

            Stmt::Break => match self.break_label {
                Some(target) => {
                    self.push(Instr::Jump { target });
                    Ok(())
                }
                None => self.unsupported("break outside loop"),
            },
            Stmt::Continue => match self.continue_label {
                Some(target) => {
                    self.push(Instr::Jump { target });
                    Ok(())
                }
                None => self.unsupported("continue outside loop"),
            },

            Stmt::Return(value) => {
                if let Some(e) = value {
                    let v = self.gen_expr(e)?;
                    let res = Func::reg(Register::RESULT);
                    self.push(Instr::Mov { dst: res, src: v });
                }
                let target = self.f.ret_label;
                self.push(Instr::Jump { target });
                Ok(())
            }

            Stmt::Delete { expr, destructor } => self.delete_stmt(expr, destructor.as_deref()),
        }
    }

    fn assign(&mut self, target: &LValue, value: &crate::ast::Expr) -> Result<(), CodegenError> {
        match target {
            LValue::Var(name) => {
                let v = self.gen_expr(value)?;
                let var = self.f.var(name);
                self.push(Instr::Mov { dst: var, src: v });
            }
            LValue::Global(sym) => {
                let v = self.gen_expr(value)?;
                self.push(Instr::Store {
                    src: v,
                    addr: Addr::Global(sym.clone()),
                });
            }
            LValue::Index { base, index } => {
                let addr = self.index_addr(base, index)?;
                let v = self.gen_expr(value)?;
                self.push(Instr::Store {
                    src: v,
                    addr: Addr::Off { base: addr, off: 0 },
                });
            }
            LValue::Field { base, offset } => {
                let b = self.gen_expr(base)?;
                let v = self.gen_expr(value)?;
                self.push(Instr::Store {
                    src: v,
                    addr: Addr::Off {
                        base: b,
                        off: *offset,
                    },
                });
            }
        }
        Ok(())
    }

    /// `target op= value` — the address is computed once, then
    /// load-modify-store.
    fn aug_assign(
        &mut self,
        op: BinOp,
        target: &LValue,
        value: &crate::ast::Expr,
    ) -> Result<(), CodegenError> {
        let alu = alu_op(op);
        match target {
            LValue::Var(name) => {
                let v = self.gen_expr(value)?;
                let var = self.f.var(name);
                self.push(Instr::Alu {
                    op: alu,
                    dst: var,
                    lhs: var,
                    rhs: Operand::Val(v),
                });
            }
            LValue::Global(sym) => {
                let old = self.f.temp();
                self.push(Instr::Load {
                    dst: old,
                    addr: Addr::Global(sym.clone()),
                });
                let v = self.gen_expr(value)?;
                let r = self.f.temp();
                self.push(Instr::Alu {
                    op: alu,
                    dst: r,
                    lhs: old,
                    rhs: Operand::Val(v),
                });
                self.push(Instr::Store {
                    src: r,
                    addr: Addr::Global(sym.clone()),
                });
            }
            LValue::Index { base, index } => {
                let addr = self.index_addr(base, index)?;
                self.load_modify_store(alu, addr, 0, value)?;
            }
            LValue::Field { base, offset } => {
                let b = self.gen_expr(base)?;
                self.load_modify_store(alu, b, *offset, value)?;
            }
        }
        Ok(())
    }

    fn load_modify_store(
        &mut self,
        op: AluOp,
        base: ValueId,
        off: i32,
        value: &crate::ast::Expr,
    ) -> Result<(), CodegenError> {
        let old = self.f.temp();
        self.push(Instr::Load {
            dst: old,
            addr: Addr::Off { base, off },
        });
        let v = self.gen_expr(value)?;
        let r = self.f.temp();
        self.push(Instr::Alu {
            op,
            dst: r,
            lhs: old,
            rhs: Operand::Val(v),
        });
        self.push(Instr::Store {
            src: r,
            addr: Addr::Off { base, off },
        });
        Ok(())
    }

    /// `if`/`elsif`/`else`: guards first, each jumping to its clause label,
    /// then the else body, then the clause bodies, all meeting at a shared
    /// end label.  The guard chain leaves a redundant jump or two for the
    /// peephole pass; that shape is kept as-is.
    fn if_stmt(
        &mut self,
        arms: &[(crate::ast::Expr, Vec<Stmt>)],
        else_body: Option<&[Stmt]>,
    ) -> Result<(), CodegenError> {
        let end = self.f.new_label();
        let mut clause_labels = Vec::with_capacity(arms.len());

        for (cond, _) in arms {
            let clause = self.f.new_label();
            let next = self.f.new_label();
            self.gen_cond(cond, clause, next)?;
            self.f.bind(next);
            clause_labels.push(clause);
        }

        if let Some(body) = else_body {
            self.block(body)?;
        }
        self.push(Instr::Jump { target: end });

        for ((_, body), clause) in arms.iter().zip(clause_labels) {
            self.f.bind(clause);
            self.block(body)?;
            self.push(Instr::Jump { target: end });
        }
        self.f.bind(end);
        Ok(())
    }

    /// `when`: equality tests against each clause's constant list, same
    /// guard/body layout as `if`.
    fn when_stmt(
        &mut self,
        scrutinee: &crate::ast::Expr,
        cases: &[WhenCase],
        else_body: Option<&[Stmt]>,
    ) -> Result<(), CodegenError> {
        use crate::ast::CaseVals;

        let s = self.gen_expr(scrutinee)?;
        let end = self.f.new_label();
        let mut clause_labels = Vec::with_capacity(cases.len());

        for case in cases {
            let clause = self.f.new_label();
            match &case.values {
                CaseVals::Ints(ks) => {
                    for &k in ks {
                        let c = self.imm(k);
                        self.push(Instr::Branch {
                            op: RelOp::Eq,
                            lhs: s,
                            rhs: c,
                            target: clause,
                        });
                    }
                }
                CaseVals::Strs(lits) => {
                    for lit in lits {
                        let id = self.session.intern_string(lit);
                        let t = self.f.temp();
                        self.push(Instr::LoadStr { dst: t, string: id });
                        let r = self
                            .call_runtime(RuntimeFn::StrEq, &[s, t], true)
                            .expect("str_eq returns a value");
                        let zero = self.zero();
                        self.push(Instr::Branch {
                            op: RelOp::Ne,
                            lhs: r,
                            rhs: zero,
                            target: clause,
                        });
                    }
                }
            }
            clause_labels.push(clause);
        }

        if let Some(body) = else_body {
            self.block(body)?;
        }
        self.push(Instr::Jump { target: end });

        for (case, clause) in cases.iter().zip(clause_labels) {
            self.f.bind(clause);
            self.block(&case.body)?;
            self.push(Instr::Jump { target: end });
        }
        self.f.bind(end);
        Ok(())
    }

    /// `while`: jump to the test at the bottom; one backward branch per
    /// iteration.
    fn while_stmt(&mut self, cond: &crate::ast::Expr, body: &[Stmt]) -> Result<(), CodegenError> {
        let start = self.f.new_label();
        let test = self.f.new_label();
        let end = self.f.new_label();

        self.push(Instr::Jump { target: test });
        self.f.bind(start);
        self.loop_body(body, end, test)?;
        self.f.bind(test);
        self.gen_cond(cond, start, end)?;
        self.f.bind(end);
        Ok(())
    }

    /// `repeat … until`: body first, test after it with inverted targets.
    fn repeat_stmt(&mut self, body: &[Stmt], cond: &crate::ast::Expr) -> Result<(), CodegenError> {
        let start = self.f.new_label();
        let test = self.f.new_label();
        let end = self.f.new_label();

        self.f.bind(start);
        self.loop_body(body, end, test)?;
        self.f.bind(test);
        self.gen_cond(cond, end, start)?;
        self.f.bind(end);
        Ok(())
    }

    fn for_range(
        &mut self,
        var: &str,
        from: &crate::ast::Expr,
        to: &crate::ast::Expr,
        down: bool,
        body: &[Stmt],
    ) -> Result<(), CodegenError> {
        let v = self.f.var(var);
        let init = self.gen_expr(from)?;
        self.push(Instr::Mov { dst: v, src: init });
        let limit = self.gen_expr(to)?;
        let limit = self.freeze(limit);

        let start = self.f.new_label();
        let step = self.f.new_label();
        let test = self.f.new_label();
        let end = self.f.new_label();

        self.push(Instr::Jump { target: test });
        self.f.bind(start);
        self.loop_body(body, end, step)?;
        self.f.bind(step);
        self.push(Instr::Alu {
            op: if down { AluOp::Sub } else { AluOp::Add },
            dst: v,
            lhs: v,
            rhs: Operand::Imm(1),
        });
        self.f.bind(test);
        self.push(Instr::Branch {
            op: if down { RelOp::Ge } else { RelOp::Le },
            lhs: v,
            rhs: limit,
            target: start,
        });
        self.f.bind(end);
        Ok(())
    }

    /// `for x in arr`: read the length header once, compute an end pointer,
    /// walk by element size.
    fn for_each(
        &mut self,
        var: &str,
        array: &crate::ast::Expr,
        body: &[Stmt],
    ) -> Result<(), CodegenError> {
        let arr = self.gen_expr(array)?;
        let len = self.f.temp();
        self.push(Instr::Load {
            dst: len,
            addr: Addr::Off { base: arr, off: -4 },
        });
        let bytes = self.f.temp();
        self.push(Instr::Alu {
            op: AluOp::Mul,
            dst: bytes,
            lhs: len,
            rhs: Operand::Imm(4),
        });
        let endp = self.f.temp();
        self.push(Instr::Alu {
            op: AluOp::Add,
            dst: endp,
            lhs: arr,
            rhs: Operand::Val(bytes),
        });
        let ptr = self.hidden_var("ptr");
        self.push(Instr::Mov { dst: ptr, src: arr });
        let x = self.f.var(var);

        let start = self.f.new_label();
        let step = self.f.new_label();
        let test = self.f.new_label();
        let end = self.f.new_label();

        self.push(Instr::Jump { target: test });
        self.f.bind(start);
        self.push(Instr::Load {
            dst: x,
            addr: Addr::Off { base: ptr, off: 0 },
        });
        self.loop_body(body, end, step)?;
        self.f.bind(step);
        self.push(Instr::Alu {
            op: AluOp::Add,
            dst: ptr,
            lhs: ptr,
            rhs: Operand::Imm(4),
        });
        self.f.bind(test);
        self.push(Instr::Branch {
            op: RelOp::Lt,
            lhs: ptr,
            rhs: endp,
            target: start,
        });
        self.f.bind(end);
        Ok(())
    }

    /// `delete e`: skip everything on null, run the destructor if the
    /// static class has one, then hand the block (header included) back to
    /// the runtime.
    fn delete_stmt(
        &mut self,
        expr: &crate::ast::Expr,
        destructor: Option<&str>,
    ) -> Result<(), CodegenError> {
        let v = self.gen_expr(expr)?;
        let skip = self.f.new_label();
        let zero = self.zero();
        self.push(Instr::Branch {
            op: RelOp::Eq,
            lhs: v,
            rhs: zero,
            target: skip,
        });
        if let Some(dtor) = destructor {
            let recv = Func::reg(Register::arg(0));
            self.push(Instr::Mov { dst: recv, src: v });
            self.push(Instr::Call {
                callee: Callee::Func(dtor.to_string()),
                args: vec![recv],
            });
        }
        let block = self.f.temp();
        self.push(Instr::Alu {
            op: AluOp::Sub,
            dst: block,
            lhs: v,
            rhs: Operand::Imm(4),
        });
        self.call_runtime(RuntimeFn::Free, &[block], false);
        self.f.bind(skip);
        Ok(())
    }

    /// Copy a named variable into a fresh temporary so later writes to the
    /// variable don't change a bound captured before the loop.
    fn freeze(&mut self, v: ValueId) -> ValueId {
        if self.f.is_reg(v) || matches!(self.f.value_kind(v), crate::ir::ValueKind::Temp) {
            return v;
        }
        let t = self.f.temp();
        self.push(Instr::Mov { dst: t, src: v });
        t
    }
}

pub(crate) fn alu_op(op: BinOp) -> AluOp {
    match op {
        BinOp::Add => AluOp::Add,
        BinOp::Sub => AluOp::Sub,
        BinOp::Mul => AluOp::Mul,
        BinOp::Div => AluOp::Div,
        BinOp::Mod => AluOp::Mod,
        BinOp::BitAnd => AluOp::And,
        BinOp::BitOr => AluOp::Or,
        BinOp::BitXor => AluOp::Xor,
        BinOp::Shl => AluOp::Shl,
        BinOp::Shr => AluOp::Shr,
    }
}
