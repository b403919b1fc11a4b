use m32_compiler::ast::*;
use m32_compiler::backend::abi::Register;
use m32_compiler::backend::{codegen, interp::Interp, liveness, optimize, regalloc};
use m32_compiler::ir::{AluOp, Func, Instr, Operand, ValueId};
use m32_compiler::{compile, CompileError, Session};
use std::collections::{HashMap, HashSet};

// ── Tree-building helpers ────────────────────────────────────────────────

fn int(k: i32) -> Expr {
    Expr::Int(k)
}

fn var(name: &str) -> Expr {
    Expr::Var(name.to_string())
}

fn bin(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    }
}

fn cmp(op: RelOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Cmp {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
        strings: false,
    }
}

fn assign(name: &str, value: Expr) -> Stmt {
    Stmt::Assign {
        target: LValue::Var(name.to_string()),
        value,
    }
}

fn aug(name: &str, op: BinOp, value: Expr) -> Stmt {
    Stmt::AugAssign {
        op,
        target: LValue::Var(name.to_string()),
        value,
    }
}

fn call(callee: &str, args: Vec<Expr>) -> Expr {
    Expr::Call {
        callee: callee.to_string(),
        args,
    }
}

fn print_int(e: Expr) -> Stmt {
    Stmt::Expr(call("print_int", vec![e]))
}

fn print_str(s: &str) -> Stmt {
    Stmt::Expr(call("print_str", vec![Expr::Str(s.to_string())]))
}

fn func(name: &str, params: &[&str], returns: bool, body: Vec<Stmt>) -> FuncDecl {
    FuncDecl {
        name: name.to_string(),
        params: params.iter().map(|s| s.to_string()).collect(),
        receiver: None,
        variadic: None,
        returns,
        body,
    }
}

fn method(name: &str, class: &str, returns: bool, body: Vec<Stmt>) -> FuncDecl {
    FuncDecl {
        name: name.to_string(),
        params: Vec::new(),
        receiver: Some(class.to_string()),
        variadic: None,
        returns,
        body,
    }
}

fn program(funcs: Vec<FuncDecl>) -> Program {
    Program {
        classes: Vec::new(),
        funcs,
        globals: Vec::new(),
    }
}

/// `gcd(a, b)` by repeated remainder — a small function with loop-carried
/// values and variable-to-variable moves.
fn gcd_decl() -> FuncDecl {
    func(
        "gcd",
        &["a", "b"],
        true,
        vec![
            Stmt::While {
                cond: cmp(RelOp::Ne, var("b"), int(0)),
                body: vec![
                    assign("t", bin(BinOp::Mod, var("a"), var("b"))),
                    assign("a", var("b")),
                    assign("b", var("t")),
                ],
            },
            Stmt::Return(Some(var("a"))),
        ],
    )
}

/// Pass tracing for debugging: `RUST_LOG=trace cargo test`.
fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Run `main` on the session's current IR and collect (result, output).
fn interpret_main(session: &Session) -> (i32, String) {
    let mut it = Interp::new(session);
    let r = it.run("main", &[]).expect("interpretation should succeed");
    (r, it.output().to_string())
}

// ── Peephole fixpoint ────────────────────────────────────────────────────

#[test]
fn optimizer_is_idempotent_on_its_own_output() {
    let prog = program(vec![gcd_decl()]);
    let mut session = Session::new();
    codegen::lower_program(&prog, &mut session).expect("lowering should succeed");

    let f = &mut session.funcs[0];
    optimize::optimize(f);
    let once = f.instrs.clone();
    optimize::optimize(f);
    assert_eq!(f.instrs, once, "a second run must change nothing");
}

#[test]
fn optimizer_folds_constant_arithmetic() {
    // seven() = 3 + 4, via two literals
    let prog = program(vec![func(
        "seven",
        &[],
        true,
        vec![Stmt::Return(Some(bin(BinOp::Add, int(3), int(4))))],
    )]);
    let mut session = Session::new();
    codegen::lower_program(&prog, &mut session).expect("lowering should succeed");

    let f = &mut session.funcs[0];
    optimize::optimize(f);
    assert!(
        f.instrs
            .iter()
            .any(|i| matches!(i, Instr::MovImm { imm: 7, .. })),
        "3 + 4 should fold to 7: {:?}",
        f.instrs
    );
    assert!(
        !f.instrs.iter().any(|i| matches!(i, Instr::Alu { .. })),
        "no arithmetic should remain: {:?}",
        f.instrs
    );
}

#[test]
fn optimizer_strength_reduces_power_of_two_multiply() {
    let prog = program(vec![func(
        "scale",
        &["x"],
        true,
        vec![Stmt::Return(Some(bin(BinOp::Mul, var("x"), int(8))))],
    )]);
    let mut session = Session::new();
    codegen::lower_program(&prog, &mut session).expect("lowering should succeed");

    let f = &mut session.funcs[0];
    optimize::optimize(f);
    assert!(
        f.instrs.iter().any(|i| matches!(
            i,
            Instr::Alu {
                op: AluOp::Shl,
                rhs: Operand::Imm(3),
                ..
            }
        )),
        "x * 8 should become x << 3: {:?}",
        f.instrs
    );
}

// ── Liveness ─────────────────────────────────────────────────────────────

#[test]
fn liveness_tracks_values_to_their_last_use() {
    let mut f = Func::new("probe");
    let a = f.temp();
    let b = f.temp();
    let c = f.temp();
    let res = Func::reg(Register::RESULT);
    f.push(Instr::MovImm { dst: a, imm: 1 });
    f.push(Instr::MovImm { dst: b, imm: 2 });
    f.push(Instr::Alu {
        op: AluOp::Add,
        dst: c,
        lhs: a,
        rhs: Operand::Val(b),
    });
    f.push(Instr::Mov { dst: res, src: c });
    f.push(Instr::Ret { value: Some(res) });

    let live = liveness::compute(&mut f);
    assert!(live.is_live_after(0, a));
    assert!(live.is_live_after(1, a) && live.is_live_after(1, b));
    assert!(
        !live.is_live_after(2, a) && !live.is_live_after(2, b),
        "operands die at their last use"
    );
    assert!(live.is_live_after(2, c));
    assert!(!live.is_live_after(3, c));
    assert!(live.is_live_after(3, res));
}

#[test]
fn liveness_follows_backward_branches() {
    let mut f = Func::new("loop_probe");
    let i = f.var("i");
    let head = f.new_label();
    f.push(Instr::MovImm { dst: i, imm: 0 });
    f.bind(head);
    f.push(Instr::Alu {
        op: AluOp::Add,
        dst: i,
        lhs: i,
        rhs: Operand::Imm(1),
    });
    f.push(Instr::Branch {
        op: RelOp::Lt,
        lhs: i,
        rhs: Func::reg(Register::ZERO),
        target: head,
    });
    f.push(Instr::Ret { value: None });

    let live = liveness::compute(&mut f);
    // `i` flows around the back edge to its use in the increment.
    assert!(live.is_live_after(0, i));
    assert!(live.is_live_after(2, i));
    assert!(
        live.is_live_after(3, i),
        "the back edge keeps the counter live after the branch"
    );
    assert!(!live.is_live_after(4, i), "nothing is live after the return");
}

// ── Register allocation ──────────────────────────────────────────────────

#[test]
fn allocation_never_shares_a_register_between_live_values() {
    let prog = program(vec![gcd_decl()]);
    let mut session = Session::new();
    codegen::lower_program(&prog, &mut session).expect("lowering should succeed");

    let f = &mut session.funcs[0];
    optimize::optimize(f);
    let before = f.instrs.clone();
    let live = liveness::compute(f);
    regalloc::allocate(f, &live).expect("gcd should allocate");

    // The rewrite is positional, so zipping the old and new lists recovers
    // each virtual value's assigned register.
    let mut reg_of: HashMap<ValueId, ValueId> = HashMap::new();
    for (pre, post) in before.iter().zip(&f.instrs) {
        for (a, b) in pre.reads().into_iter().zip(post.reads()) {
            reg_of.insert(a, b);
        }
        if let (Some(a), Some(b)) = (pre.writes(), post.writes()) {
            reg_of.insert(a, b);
        }
    }
    let moves: HashSet<(ValueId, ValueId)> = before
        .iter()
        .filter_map(|i| match i {
            Instr::Mov { dst, src } => Some((*dst, *src)),
            _ => None,
        })
        .collect();

    for (at, set) in live.live_out.iter().enumerate() {
        let vals: Vec<ValueId> = set.iter().copied().collect();
        for x in 0..vals.len() {
            for y in x + 1..vals.len() {
                let (Some(&ra), Some(&rb)) = (reg_of.get(&vals[x]), reg_of.get(&vals[y])) else {
                    continue;
                };
                if ra == rb {
                    // Coalesced move partners hold the same value, so the
                    // shared register is by construction, not a clash.
                    assert!(
                        moves.contains(&(vals[x], vals[y])) || moves.contains(&(vals[y], vals[x])),
                        "values {:?} and {:?} share {ra:?} at instruction {at} \
                         without a connecting move",
                        vals[x],
                        vals[y],
                    );
                }
            }
        }
    }
}

#[test]
fn coalescing_eliminates_every_removable_move() {
    let prog = program(vec![func(
        "add",
        &["a", "b"],
        true,
        vec![Stmt::Return(Some(bin(
            BinOp::Add,
            bin(BinOp::Add, var("a"), var("b")),
            int(1),
        )))],
    )]);
    let mut session = Session::new();
    compile(&prog, &mut session).expect("add should compile");

    let f = &session.funcs[0];
    assert!(
        !f.instrs
            .iter()
            .any(|i| matches!(i, Instr::Mov { dst, src } if dst != src)),
        "no register-to-register move should survive: {:?}",
        f.instrs
    );
}

#[test]
fn allocation_fails_when_too_many_values_are_live() {
    // Thirty values derived from `n`, all live until the final sum, cannot
    // fit the allocatable registers; there is no spill path.
    let mut body = Vec::new();
    for k in 1..=30 {
        body.push(assign(&format!("x{k}"), bin(BinOp::Add, var("n"), int(k))));
    }
    let mut sum = var("x1");
    for k in 2..=30 {
        sum = bin(BinOp::Add, sum, var(&format!("x{k}")));
    }
    body.push(Stmt::Return(Some(sum)));

    let prog = program(vec![func("pressure", &["n"], true, body)]);
    let mut session = Session::new();
    let err = compile(&prog, &mut session).expect_err("allocation must fail, not miscompile");
    assert!(matches!(err, CompileError::Alloc(_)), "got: {err}");
    assert!(
        session.diagnostics().iter().any(|d| d.to_string().contains("pressure")),
        "failure should be logged against the offending function"
    );
}

// ── Semantic equivalence: oracle vs. optimized-and-allocated IR ──────────

#[test]
fn recursion_survives_the_whole_pipeline() {
    let fib = func(
        "fib",
        &["n"],
        true,
        vec![
            Stmt::If {
                arms: vec![(
                    cmp(RelOp::Lt, var("n"), int(2)),
                    vec![Stmt::Return(Some(var("n")))],
                )],
                else_body: None,
            },
            Stmt::Return(Some(bin(
                BinOp::Add,
                call("fib", vec![bin(BinOp::Sub, var("n"), int(1))]),
                call("fib", vec![bin(BinOp::Sub, var("n"), int(2))]),
            ))),
        ],
    );
    let main = func(
        "main",
        &[],
        true,
        vec![
            Stmt::ForRange {
                var: "i".to_string(),
                from: int(0),
                to: int(9),
                down: false,
                body: vec![print_int(call("fib", vec![var("i")]))],
            },
            print_int(call("gcd", vec![int(48), int(18)])),
            Stmt::Return(Some(int(0))),
        ],
    );
    let prog = program(vec![fib, gcd_decl(), main]);

    init_logs();
    let mut session = Session::new();
    codegen::lower_program(&prog, &mut session).expect("lowering should succeed");
    let (oracle_ret, oracle_out) = {
        let (r, o) = interpret_main(&session);
        (r, o)
    };
    assert_eq!(oracle_out, "0\n1\n1\n2\n3\n5\n8\n13\n21\n34\n6\n");

    m32_compiler::backend::optimize_and_allocate(&mut session).expect("backend passes");
    let (ret, out) = interpret_main(&session);
    assert_eq!(ret, oracle_ret);
    assert_eq!(out, oracle_out, "optimization must not change behavior");
}

#[test]
fn objects_strings_and_loops_survive_the_whole_pipeline() {
    let classes = vec![ClassDecl {
        name: "Point".to_string(),
        superclass: None,
        size: 8,
        methods: vec!["Point_sum".to_string()],
        destructor: Some("Point_free".to_string()),
    }];
    let point_sum = method(
        "Point_sum",
        "Point",
        true,
        vec![Stmt::Return(Some(bin(
            BinOp::Add,
            Expr::Field {
                base: Box::new(var("this")),
                offset: 0,
            },
            Expr::Field {
                base: Box::new(var("this")),
                offset: 4,
            },
        )))],
    );
    let point_free = method("Point_free", "Point", false, vec![print_str("bye")]);
    let total = FuncDecl {
        name: "total".to_string(),
        params: Vec::new(),
        receiver: None,
        variadic: Some("xs".to_string()),
        returns: true,
        body: vec![
            assign("t", int(0)),
            Stmt::ForEach {
                var: "x".to_string(),
                array: var("xs"),
                body: vec![aug("t", BinOp::Add, var("x"))],
            },
            Stmt::Return(Some(var("t"))),
        ],
    };
    let main = func(
        "main",
        &[],
        true,
        vec![
            Stmt::Assign {
                target: LValue::Global("g".to_string()),
                value: int(3),
            },
            assign(
                "p",
                Expr::New {
                    class: "Point".to_string(),
                    local: false,
                },
            ),
            Stmt::Assign {
                target: LValue::Field {
                    base: var("p"),
                    offset: 0,
                },
                value: int(4),
            },
            Stmt::Assign {
                target: LValue::Field {
                    base: var("p"),
                    offset: 4,
                },
                value: int(5),
            },
            print_int(Expr::MethodCall {
                recv: Box::new(var("p")),
                callee: "Point_sum".to_string(),
                args: Vec::new(),
            }),
            print_int(call("total", vec![int(1), int(2), int(3), int(4)])),
            assign("s", Expr::Str("hello".to_string())),
            Stmt::When {
                scrutinee: var("s"),
                cases: vec![WhenCase {
                    values: CaseVals::Strs(vec!["hello".to_string()]),
                    body: vec![print_str("yes")],
                }],
                else_body: Some(vec![print_str("no")]),
            },
            Stmt::If {
                arms: vec![(
                    Expr::Cmp {
                        op: RelOp::Lt,
                        lhs: Box::new(var("s")),
                        rhs: Box::new(Expr::Str("world".to_string())),
                        strings: true,
                    },
                    vec![print_str("lt")],
                )],
                else_body: None,
            },
            assign(
                "a",
                Expr::NewArray {
                    len: Box::new(int(3)),
                    local: false,
                },
            ),
            Stmt::ForRange {
                var: "i".to_string(),
                from: int(0),
                to: int(2),
                down: false,
                body: vec![Stmt::Assign {
                    target: LValue::Index {
                        base: var("a"),
                        index: var("i"),
                    },
                    value: bin(BinOp::Mul, var("i"), Expr::Global("g".to_string())),
                }],
            },
            assign("t", int(0)),
            Stmt::ForEach {
                var: "x".to_string(),
                array: var("a"),
                body: vec![aug("t", BinOp::Add, var("x"))],
            },
            print_int(var("t")),
            assign(
                "b",
                Expr::ArrayLit {
                    width: ElemWidth::Word,
                    values: vec![10, 20, 30],
                },
            ),
            assign("u", int(0)),
            Stmt::ForEach {
                var: "x".to_string(),
                array: var("b"),
                body: vec![aug("u", BinOp::Add, var("x"))],
            },
            print_int(var("u")),
            Stmt::RepeatUntil {
                body: vec![aug("t", BinOp::Sub, int(1))],
                cond: cmp(RelOp::Le, var("t"), int(5)),
            },
            print_int(var("t")),
            Stmt::Delete {
                expr: var("p"),
                destructor: Some("Point_free".to_string()),
            },
            Stmt::Return(Some(Expr::Global("g".to_string()))),
        ],
    );
    let prog = Program {
        classes,
        funcs: vec![point_sum, point_free, total, main],
        globals: vec!["g".to_string()],
    };

    init_logs();
    let mut session = Session::new();
    codegen::lower_program(&prog, &mut session).expect("lowering should succeed");
    let (oracle_ret, oracle_out) = interpret_main(&session);
    assert_eq!(oracle_out, "9\n10\nyes\nlt\n9\n60\n5\nbye\n");
    assert_eq!(oracle_ret, 3);

    m32_compiler::backend::optimize_and_allocate(&mut session).expect("backend passes");
    let (ret, out) = interpret_main(&session);
    assert_eq!(ret, oracle_ret);
    assert_eq!(out, oracle_out, "optimization must not change behavior");
}

#[test]
fn integer_when_dispatches_on_constant_lists() {
    let classify = func(
        "classify",
        &["x"],
        true,
        vec![Stmt::When {
            scrutinee: var("x"),
            cases: vec![
                WhenCase {
                    values: CaseVals::Ints(vec![1, 2]),
                    body: vec![Stmt::Return(Some(int(10)))],
                },
                WhenCase {
                    values: CaseVals::Ints(vec![3]),
                    body: vec![Stmt::Return(Some(int(20)))],
                },
            ],
            else_body: Some(vec![Stmt::Return(Some(int(30)))]),
        }],
    );
    let main = func(
        "main",
        &[],
        true,
        vec![
            print_int(call("classify", vec![int(1)])),
            print_int(call("classify", vec![int(2)])),
            print_int(call("classify", vec![int(3)])),
            print_int(call("classify", vec![int(9)])),
            Stmt::Return(Some(int(0))),
        ],
    );
    let prog = program(vec![classify, main]);

    let mut session = Session::new();
    codegen::lower_program(&prog, &mut session).expect("lowering should succeed");
    let (_, oracle_out) = interpret_main(&session);
    assert_eq!(oracle_out, "10\n10\n20\n30\n");

    m32_compiler::backend::optimize_and_allocate(&mut session).expect("backend passes");
    let (_, out) = interpret_main(&session);
    assert_eq!(out, oracle_out);
}

#[test]
fn booleans_materialise_and_negate() {
    // truthy(x) = (x < 3) and (x > 1); nonneg(x) = not (x < 0); flip(x) = -x
    let truthy = func(
        "truthy",
        &["x"],
        true,
        vec![Stmt::Return(Some(Expr::And(
            Box::new(cmp(RelOp::Lt, var("x"), int(3))),
            Box::new(cmp(RelOp::Gt, var("x"), int(1))),
        )))],
    );
    let nonneg = func(
        "nonneg",
        &["x"],
        true,
        vec![Stmt::Return(Some(Expr::Unary {
            op: UnOp::Not,
            expr: Box::new(cmp(RelOp::Lt, var("x"), int(0))),
        }))],
    );
    let flip = func(
        "flip",
        &["x"],
        true,
        vec![Stmt::Return(Some(Expr::Unary {
            op: UnOp::Neg,
            expr: Box::new(var("x")),
        }))],
    );
    let main = func(
        "main",
        &[],
        true,
        vec![
            print_int(call("truthy", vec![int(2)])),
            print_int(call("truthy", vec![int(5)])),
            print_int(call("truthy", vec![int(1)])),
            print_int(call("nonneg", vec![int(4)])),
            print_int(call("nonneg", vec![int(-4)])),
            print_int(call("flip", vec![int(7)])),
            Stmt::Return(Some(int(0))),
        ],
    );
    let prog = program(vec![truthy, nonneg, flip, main]);

    let mut session = Session::new();
    codegen::lower_program(&prog, &mut session).expect("lowering should succeed");
    let (_, oracle_out) = interpret_main(&session);
    assert_eq!(oracle_out, "1\n0\n0\n1\n0\n-7\n");

    m32_compiler::backend::optimize_and_allocate(&mut session).expect("backend passes");
    let (_, out) = interpret_main(&session);
    assert_eq!(out, oracle_out);
}
