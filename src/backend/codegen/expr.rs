//! Expression lowering.
//!
//! Every expression is evaluated fully when visited, left to right, and
//! returns the [`ValueId`] holding its result.  Boolean-valued expressions
//! are special: they compile against a (true-label, false-label) pair and
//! never materialise 0/1 unless a value is actually demanded.

use super::{Codegen, CodegenError};
use crate::ast::{Expr, UnOp};
use crate::backend::abi::Register;
use crate::ir::{Addr, AluOp, Callee, Func, Instr, LabelId, Operand, RelOp, RuntimeFn, ValueId};

impl<'a> Codegen<'a> {
    pub(crate) fn gen_expr(&mut self, e: &Expr) -> Result<ValueId, CodegenError> {
        match e {
            Expr::Int(k) => Ok(self.imm(*k)),
            Expr::Bool(b) => Ok(self.imm(*b as i32)),
            Expr::Null => Ok(self.imm(0)),

            Expr::Str(s) => {
                let id = self.session.intern_string(s);
                let t = self.f.temp();
                self.push(Instr::LoadStr { dst: t, string: id });
                Ok(t)
            }

            Expr::Var(name) => Ok(self.f.var(name)),

            Expr::Global(sym) => {
                let t = self.f.temp();
                self.push(Instr::Load {
                    dst: t,
                    addr: Addr::Global(sym.clone()),
                });
                Ok(t)
            }

            Expr::Unary { op: UnOp::Neg, expr } => {
                let v = self.gen_expr(expr)?;
                let t = self.f.temp();
                let zero = self.zero();
                self.push(Instr::Alu {
                    op: AluOp::Sub,
                    dst: t,
                    lhs: zero,
                    rhs: Operand::Val(v),
                });
                Ok(t)
            }

            Expr::Binary { op, lhs, rhs } => {
                let a = self.gen_expr(lhs)?;
                let b = self.gen_expr(rhs)?;
                let t = self.f.temp();
                self.push(Instr::Alu {
                    op: super::alu_op(*op),
                    dst: t,
                    lhs: a,
                    rhs: Operand::Val(b),
                });
                Ok(t)
            }

            // Boolean-valued in a value position: run the control-flow
            // protocol into a materialised 0/1.
            Expr::Unary { op: UnOp::Not, .. }
            | Expr::Cmp { .. }
            | Expr::And(..)
            | Expr::Or(..) => self.materialise_bool(e),

            Expr::Index { base, index } => {
                let addr = self.index_addr(base, index)?;
                let t = self.f.temp();
                self.push(Instr::Load {
                    dst: t,
                    addr: Addr::Off { base: addr, off: 0 },
                });
                Ok(t)
            }

            Expr::Field { base, offset } => {
                let b = self.gen_expr(base)?;
                let t = self.f.temp();
                self.push(Instr::Load {
                    dst: t,
                    addr: Addr::Off {
                        base: b,
                        off: *offset,
                    },
                });
                Ok(t)
            }

            Expr::Call { callee, args } => {
                let result = self.gen_call(callee, None, args)?;
                Ok(result.unwrap_or_else(|| self.zero()))
            }

            Expr::MethodCall { recv, callee, args } => {
                let result = self.gen_call(callee, Some(recv), args)?;
                Ok(result.unwrap_or_else(|| self.zero()))
            }

            Expr::New { class, local } => self.gen_new(class, *local),
            Expr::NewArray { len, local } => self.gen_new_array(len, *local),

            Expr::ArrayLit { width, values } => {
                let id = self.session.add_const_array(*width, values.clone());
                let t = self.f.temp();
                self.push(Instr::LoadArr { dst: t, arr: id });
                Ok(t)
            }
        }
    }

    /// Address of `base[index]` (word elements): `base + index * 4`.
    pub(crate) fn index_addr(
        &mut self,
        base: &Expr,
        index: &Expr,
    ) -> Result<ValueId, CodegenError> {
        let b = self.gen_expr(base)?;
        let i = self.gen_expr(index)?;
        let scaled = self.f.temp();
        self.push(Instr::Alu {
            op: AluOp::Mul,
            dst: scaled,
            lhs: i,
            rhs: Operand::Imm(4),
        });
        let addr = self.f.temp();
        self.push(Instr::Alu {
            op: AluOp::Add,
            dst: addr,
            lhs: b,
            rhs: Operand::Val(scaled),
        });
        Ok(addr)
    }

    // ── Boolean control flow ────────────────────────────────────────────

    /// Compile a boolean expression against a (true, false) label pair.
    pub(crate) fn gen_cond(
        &mut self,
        e: &Expr,
        on_true: LabelId,
        on_false: LabelId,
    ) -> Result<(), CodegenError> {
        match e {
            Expr::Bool(true) => {
                self.push(Instr::Jump { target: on_true });
                Ok(())
            }
            Expr::Bool(false) => {
                self.push(Instr::Jump { target: on_false });
                Ok(())
            }

            Expr::Unary { op: UnOp::Not, expr } => self.gen_cond(expr, on_false, on_true),

            Expr::And(lhs, rhs) => {
                let mid = self.f.new_label();
                self.gen_cond(lhs, mid, on_false)?;
                self.f.bind(mid);
                self.gen_cond(rhs, on_true, on_false)
            }

            Expr::Or(lhs, rhs) => {
                let mid = self.f.new_label();
                self.gen_cond(lhs, on_true, mid)?;
                self.f.bind(mid);
                self.gen_cond(rhs, on_true, on_false)
            }

            Expr::Cmp {
                op,
                lhs,
                rhs,
                strings,
            } => {
                let a = self.gen_expr(lhs)?;
                let b = self.gen_expr(rhs)?;
                if *strings {
                    self.string_cond(*op, a, b, on_true, on_false);
                } else {
                    self.push(Instr::Branch {
                        op: *op,
                        lhs: a,
                        rhs: b,
                        target: on_true,
                    });
                    self.push(Instr::Jump { target: on_false });
                }
                Ok(())
            }

            // Anything else: evaluate and branch on non-zero.
            _ => {
                let v = self.gen_expr(e)?;
                let zero = self.zero();
                self.push(Instr::Branch {
                    op: RelOp::Ne,
                    lhs: v,
                    rhs: zero,
                    target: on_true,
                });
                self.push(Instr::Jump { target: on_false });
                Ok(())
            }
        }
    }

    /// String comparison through the runtime helpers: equality via
    /// `str_eq` (1/0), ordering via `str_cmp` (-1/0/1), then branch on the
    /// helper's result.
    fn string_cond(
        &mut self,
        op: RelOp,
        a: ValueId,
        b: ValueId,
        on_true: LabelId,
        on_false: LabelId,
    ) {
        let zero = self.zero();
        let (helper, rel) = match op {
            RelOp::Eq => (RuntimeFn::StrEq, RelOp::Ne),
            RelOp::Ne => (RuntimeFn::StrEq, RelOp::Eq),
            ordered => (RuntimeFn::StrCmp, ordered),
        };
        let r = self
            .call_runtime(helper, &[a, b], true)
            .expect("string helpers return a value");
        self.push(Instr::Branch {
            op: rel,
            lhs: r,
            rhs: zero,
            target: on_true,
        });
        self.push(Instr::Jump { target: on_false });
    }

    /// Turn a boolean expression into a 0/1 value.  The slot is written on
    /// both paths, so it is a hidden variable rather than a temporary.
    fn materialise_bool(&mut self, e: &Expr) -> Result<ValueId, CodegenError> {
        let out = self.hidden_var("b");
        let on_true = self.f.new_label();
        let on_false = self.f.new_label();
        let end = self.f.new_label();

        self.gen_cond(e, on_true, on_false)?;
        self.f.bind(on_true);
        self.push(Instr::MovImm { dst: out, imm: 1 });
        self.push(Instr::Jump { target: end });
        self.f.bind(on_false);
        self.push(Instr::MovImm { dst: out, imm: 0 });
        self.f.bind(end);
        Ok(out)
    }

    // ── Calls ───────────────────────────────────────────────────────────

    /// Lower a call.  Arguments are evaluated left to right (receiver
    /// first), then moved into the ascending argument-register run; extra
    /// arguments to a variadic callee are packed into a length-prefixed
    /// stack buffer whose pointer rides in the final fixed slot.
    pub(crate) fn gen_call(
        &mut self,
        callee: &str,
        recv: Option<&Expr>,
        args: &[Expr],
    ) -> Result<Option<ValueId>, CodegenError> {
        if let Some((rf, returns)) = runtime_by_name(callee) {
            let mut vals = Vec::with_capacity(args.len());
            for a in args {
                vals.push(self.gen_expr(a)?);
            }
            return Ok(self.call_runtime(rf, &vals, returns));
        }

        let sig = *self
            .sigs
            .get(callee)
            .ok_or_else(|| CodegenError::UnknownCallee {
                callee: callee.to_string(),
                func: self.f.name.clone(),
            })?;

        let slots = sig.fixed + sig.variadic as usize;
        if slots > Register::MAX_ARGS {
            return Err(CodegenError::TooManyArgs {
                callee: callee.to_string(),
                max: Register::MAX_ARGS,
                func: self.f.name.clone(),
            });
        }

        let mut vals = Vec::with_capacity(args.len() + 1);
        if let Some(r) = recv {
            vals.push(self.gen_expr(r)?);
        }
        for a in args {
            vals.push(self.gen_expr(a)?);
        }

        let mut pack_region = None;
        let mut arg_regs = Vec::with_capacity(slots);

        if sig.variadic {
            let extra = vals.split_off(sig.fixed);
            let off = self.f.frame.alloc(4 * (extra.len() as i32 + 1));
            let sp = self.sp();
            let count = self.imm(extra.len() as i32);
            self.push(Instr::Store {
                src: count,
                addr: Addr::Off { base: sp, off },
            });
            for (i, &v) in extra.iter().enumerate() {
                self.push(Instr::Store {
                    src: v,
                    addr: Addr::Off {
                        base: sp,
                        off: off + 4 * (i as i32 + 1),
                    },
                });
            }
            let ptr = self.f.temp();
            self.push(Instr::Alu {
                op: AluOp::Add,
                dst: ptr,
                lhs: sp,
                rhs: Operand::Imm(off + 4),
            });
            vals.push(ptr);
            pack_region = Some(off);
        }

        for (i, &v) in vals.iter().enumerate() {
            let r = Func::reg(Register::arg(i));
            self.push(Instr::Mov { dst: r, src: v });
            arg_regs.push(r);
        }
        self.push(Instr::Call {
            callee: Callee::Func(callee.to_string()),
            args: arg_regs,
        });

        // The pack buffer lives exactly as long as the call.
        if let Some(off) = pack_region {
            self.f.frame.free(off);
        }

        Ok(if sig.returns {
            let t = self.f.temp();
            let res = Func::reg(Register::RESULT);
            self.push(Instr::Mov { dst: t, src: res });
            Some(t)
        } else {
            None
        })
    }

    /// Call a fixed runtime entry point with already-evaluated arguments.
    pub(crate) fn call_runtime(
        &mut self,
        rf: RuntimeFn,
        vals: &[ValueId],
        returns: bool,
    ) -> Option<ValueId> {
        let mut arg_regs = Vec::with_capacity(vals.len());
        for (i, &v) in vals.iter().enumerate() {
            let r = Func::reg(Register::arg(i));
            self.push(Instr::Mov { dst: r, src: v });
            arg_regs.push(r);
        }
        self.push(Instr::Call {
            callee: Callee::Runtime(rf),
            args: arg_regs,
        });
        returns.then(|| {
            let t = self.f.temp();
            let res = Func::reg(Register::RESULT);
            self.push(Instr::Mov { dst: t, src: res });
            t
        })
    }

    // ── Allocation ──────────────────────────────────────────────────────

    /// `ClassName()` — a descriptor word precedes the fields; `local`
    /// instances live in the frame, heap instances come from the runtime
    /// allocator.
    fn gen_new(&mut self, class: &str, local: bool) -> Result<ValueId, CodegenError> {
        let id = match self.session.class_id(class) {
            Some(id) => id,
            None => return self.unsupported(&format!("instantiation of unknown class `{class}`")),
        };
        let size = self.session.class(id).size;

        let obj = if local {
            let off = self.f.frame.alloc(size + 4);
            let sp = self.sp();
            let obj = self.f.temp();
            self.push(Instr::Alu {
                op: AluOp::Add,
                dst: obj,
                lhs: sp,
                rhs: Operand::Imm(off + 4),
            });
            obj
        } else {
            let bytes = self.imm(size + 4);
            let block = self
                .call_runtime(RuntimeFn::Alloc, &[bytes], true)
                .expect("alloc returns a value");
            let obj = self.f.temp();
            self.push(Instr::Alu {
                op: AluOp::Add,
                dst: obj,
                lhs: block,
                rhs: Operand::Imm(4),
            });
            obj
        };

        let desc = self.f.temp();
        self.push(Instr::LoadClass { dst: desc, class: id });
        self.push(Instr::Store {
            src: desc,
            addr: Addr::Off { base: obj, off: -4 },
        });
        Ok(obj)
    }

    /// `Int[n]` — a length word precedes the elements.  `local` arrays need
    /// a compile-time-constant length (the front end guarantees it; anything
    /// else is unsupported here).
    fn gen_new_array(&mut self, len: &Expr, local: bool) -> Result<ValueId, CodegenError> {
        if local {
            let n = match len {
                Expr::Int(n) => *n,
                _ => return self.unsupported("local array with non-constant length"),
            };
            let off = self.f.frame.alloc(4 * n + 4);
            let sp = self.sp();
            let arr = self.f.temp();
            self.push(Instr::Alu {
                op: AluOp::Add,
                dst: arr,
                lhs: sp,
                rhs: Operand::Imm(off + 4),
            });
            let count = self.imm(n);
            self.push(Instr::Store {
                src: count,
                addr: Addr::Off { base: arr, off: -4 },
            });
            return Ok(arr);
        }

        let n = self.gen_expr(len)?;
        let n = self.freeze(n);
        let scaled = self.f.temp();
        self.push(Instr::Alu {
            op: AluOp::Mul,
            dst: scaled,
            lhs: n,
            rhs: Operand::Imm(4),
        });
        let bytes = self.f.temp();
        self.push(Instr::Alu {
            op: AluOp::Add,
            dst: bytes,
            lhs: scaled,
            rhs: Operand::Imm(4),
        });
        let block = self
            .call_runtime(RuntimeFn::Alloc, &[bytes], true)
            .expect("alloc returns a value");
        let arr = self.f.temp();
        self.push(Instr::Alu {
            op: AluOp::Add,
            dst: arr,
            lhs: block,
            rhs: Operand::Imm(4),
        });
        self.push(Instr::Store {
            src: n,
            addr: Addr::Off { base: arr, off: -4 },
        });
        Ok(arr)
    }
}

/// Runtime entry points callable by name from the program tree, with
/// whether they produce a result.
fn runtime_by_name(name: &str) -> Option<(RuntimeFn, bool)> {
    match name {
        "alloc" => Some((RuntimeFn::Alloc, true)),
        "free" => Some((RuntimeFn::Free, false)),
        "str_eq" => Some((RuntimeFn::StrEq, true)),
        "str_cmp" => Some((RuntimeFn::StrCmp, true)),
        "print_int" => Some((RuntimeFn::PrintInt, false)),
        "print_str" => Some((RuntimeFn::PrintStr, false)),
        _ => None,
    }
}
