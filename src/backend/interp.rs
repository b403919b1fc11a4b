//! Direct IR interpretation, used as the test oracle for the backend.
//!
//! Executes a function's instruction list against a flat byte-addressed
//! memory that holds the same data-segment layout the emitter produces.
//! Calls are an explicit frame stack rather than native recursion, so deep
//! program recursion cannot overflow the interpreter's own stack.
//!
//! Registers are ordinary arena values here, which means the same
//! interpreter runs fresh, optimized, and fully register-allocated IR — the
//! basis of the semantic-equivalence tests.

use crate::ast::ElemWidth;
use crate::ir::{Addr, Callee, Instr, RuntimeFn, ValueId};
use crate::session::Session;
use std::collections::HashMap;
use thiserror::Error;

const MEM_SIZE: usize = 1 << 20;
const DATA_BASE: u32 = 0x1000;
const STEP_LIMIT: u64 = 2_000_000;

#[derive(Error, Debug)]
pub enum InterpError {
    #[error("call to unknown function `{0}`")]
    UnknownFunction(String),

    #[error("jump through unbound label in `{func}`")]
    UnboundLabel { func: String },

    #[error("execution ran off the end of `{func}`")]
    MissingReturn { func: String },

    #[error("memory fault at address {addr:#x} in `{func}`")]
    MemoryFault { addr: i32, func: String },

    #[error("division by zero in `{func}`")]
    DivideByZero { func: String },

    #[error("unknown global `{sym}` in `{func}`")]
    UnknownGlobal { sym: String, func: String },

    #[error("step limit exceeded (runaway loop?)")]
    StepLimit,

    #[error("out of heap memory")]
    OutOfMemory,
}

struct Frame {
    func: usize,
    pc: usize,
    vals: Vec<i32>,
}

/// One interpreter instance over a generated session.
pub struct Interp<'a> {
    session: &'a Session,
    mem: Vec<u8>,
    heap_top: u32,
    output: String,
    func_index: HashMap<String, usize>,
    /// Per-function label positions, derived once from the instruction
    /// lists at construction.
    label_pos: Vec<Vec<Option<usize>>>,
    str_addr: Vec<u32>,
    class_addr: Vec<u32>,
    arr_addr: Vec<u32>,
    global_addr: HashMap<String, u32>,
}

impl<'a> Interp<'a> {
    pub fn new(session: &'a Session) -> Self {
        let func_index = session
            .funcs
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name.clone(), i))
            .collect();

        let label_pos = session
            .funcs
            .iter()
            .map(|f| {
                let mut pos = vec![None; f.num_labels()];
                for (i, instr) in f.instrs.iter().enumerate() {
                    if let Instr::Bind(l) = instr {
                        pos[l.0 as usize] = Some(i);
                    }
                }
                pos
            })
            .collect();

        let mut interp = Self {
            session,
            mem: vec![0; MEM_SIZE],
            heap_top: 0,
            output: String::new(),
            func_index,
            label_pos,
            str_addr: Vec::new(),
            class_addr: Vec::new(),
            arr_addr: Vec::new(),
            global_addr: HashMap::new(),
        };
        interp.layout_data();
        interp
    }

    /// Everything the simulator sees printed so far.
    pub fn output(&self) -> &str {
        &self.output
    }

    /// Mirror the emitter's data segment into memory: class descriptors,
    /// constant arrays, strings, then global slots.  Addresses are assigned
    /// in one pass and contents written in a second so forward references
    /// (a descriptor's name string) resolve.
    fn layout_data(&mut self) {
        let mut at = DATA_BASE;

        for desc in self.session.classes() {
            self.class_addr.push(at);
            at += 4 * (3 + desc.vtable.len() as u32);
        }
        for arr in self.session.const_arrays() {
            at += 4; // length word
            self.arr_addr.push(at);
            let width = elem_bytes(arr.width);
            at += pad4(arr.values.len() as u32 * width);
        }
        for s in self.session.strings() {
            at += 4;
            self.str_addr.push(at);
            at += pad4(s.len() as u32);
        }
        for g in self.session.globals.clone() {
            self.global_addr.insert(g, at);
            at += 4;
        }

        // Second pass: contents.
        for (i, desc) in self.session.classes().iter().enumerate() {
            let mut p = self.class_addr[i];
            self.poke(p, self.str_addr[desc.name_str.0 as usize] as i32);
            self.poke(p + 4, desc.size);
            let sup = desc
                .superclass
                .map_or(0, |id| self.class_addr[id.0 as usize] as i32);
            self.poke(p + 8, sup);
            p += 12;
            for _ in &desc.vtable {
                self.poke(p, 0); // entries are assembler symbols; never read here
                p += 4;
            }
        }
        for (i, arr) in self.session.const_arrays().iter().enumerate() {
            let base = self.arr_addr[i];
            self.poke(base - 4, arr.values.len() as i32);
            let width = elem_bytes(arr.width);
            for (j, &v) in arr.values.iter().enumerate() {
                let p = base + j as u32 * width;
                for b in 0..width {
                    self.mem[(p + b) as usize] = (v >> (8 * b)) as u8;
                }
            }
        }
        for (i, s) in self.session.strings().iter().enumerate() {
            let base = self.str_addr[i];
            self.poke(base - 4, s.len() as i32);
            self.mem[base as usize..base as usize + s.len()].copy_from_slice(s.as_bytes());
        }

        self.heap_top = pad4(at + 15) & !15;
    }

    fn poke(&mut self, addr: u32, v: i32) {
        self.mem[addr as usize..addr as usize + 4].copy_from_slice(&v.to_le_bytes());
    }

    // ── Execution ───────────────────────────────────────────────────────

    /// Execute `name` with the given arguments; returns the value left in
    /// the result register (0 for functions returning nothing).
    pub fn run(&mut self, name: &str, args: &[i32]) -> Result<i32, InterpError> {
        let session = self.session;
        let entry = *self
            .func_index
            .get(name)
            .ok_or_else(|| InterpError::UnknownFunction(name.to_string()))?;

        let top_sp = self.mem.len() as i32;
        let mut stack = vec![self.new_frame(entry, top_sp, args)];
        let mut steps = 0u64;

        loop {
            steps += 1;
            if steps > STEP_LIMIT {
                return Err(InterpError::StepLimit);
            }

            let frame = stack.last_mut().expect("frame stack never empty");
            let f = &session.funcs[frame.func];
            let Some(instr) = f.instrs.get(frame.pc) else {
                // Functions end in `Ret`; running off the end is malformed.
                return Err(InterpError::MissingReturn {
                    func: f.name.clone(),
                });
            };

            match instr {
                Instr::Nop | Instr::Bind(_) => frame.pc += 1,

                Instr::Mov { dst, src } => {
                    let v = frame.vals[src.0 as usize];
                    set(frame, *dst, v);
                    frame.pc += 1;
                }
                Instr::MovImm { dst, imm } => {
                    set(frame, *dst, *imm);
                    frame.pc += 1;
                }

                Instr::Alu { op, dst, lhs, rhs } => {
                    let a = frame.vals[lhs.0 as usize];
                    let b = match rhs {
                        crate::ir::Operand::Val(v) => frame.vals[v.0 as usize],
                        crate::ir::Operand::Imm(k) => *k,
                    };
                    let r = op.eval(a, b).ok_or_else(|| InterpError::DivideByZero {
                        func: f.name.clone(),
                    })?;
                    set(frame, *dst, r);
                    frame.pc += 1;
                }

                Instr::Branch {
                    op,
                    lhs,
                    rhs,
                    target,
                } => {
                    let a = frame.vals[lhs.0 as usize];
                    let b = frame.vals[rhs.0 as usize];
                    if op.eval(a, b) {
                        frame.pc = self.label_pos[frame.func][target.0 as usize].ok_or_else(
                            || InterpError::UnboundLabel {
                                func: f.name.clone(),
                            },
                        )?;
                    } else {
                        frame.pc += 1;
                    }
                }
                Instr::Jump { target } => {
                    frame.pc = self.label_pos[frame.func][target.0 as usize].ok_or_else(|| {
                        InterpError::UnboundLabel {
                            func: f.name.clone(),
                        }
                    })?;
                }

                Instr::Call { callee, .. } => {
                    frame.pc += 1;
                    match callee {
                        Callee::Runtime(rf) => {
                            let rf = *rf;
                            let func_name = f.name.clone();
                            self.runtime_call(stack.last_mut().unwrap(), rf, &func_name)?;
                        }
                        Callee::Func(target) => {
                            let ti = *self.func_index.get(target).ok_or_else(|| {
                                InterpError::UnknownFunction(target.clone())
                            })?;
                            let args: Vec<i32> = (1..=8).map(|i| frame.vals[i]).collect();
                            let sp = frame.vals[crate::backend::abi::Register::STACK_PTR.index()];
                            let callee_frame = self.new_frame(ti, sp, &args);
                            stack.push(callee_frame);
                        }
                    }
                }

                Instr::Ret { .. } => {
                    let result = frame.vals[1];
                    if stack.len() == 1 {
                        return Ok(result);
                    }
                    stack.pop();
                    // The scalar return value travels through `$1`.
                    stack.last_mut().unwrap().vals[1] = result;
                }

                Instr::Load { dst, addr } => {
                    let a = self.resolve(frame, addr, &f.name)?;
                    let v = self.read_word(a, &f.name)?;
                    set(frame, *dst, v);
                    frame.pc += 1;
                }
                Instr::Store { src, addr } => {
                    let a = self.resolve(frame, addr, &f.name)?;
                    let v = frame.vals[src.0 as usize];
                    self.write_word(a, v, &f.name)?;
                    frame.pc += 1;
                }

                Instr::LoadStr { dst, string } => {
                    let a = self.str_addr[string.0 as usize] as i32;
                    set(frame, *dst, a);
                    frame.pc += 1;
                }
                Instr::LoadClass { dst, class } => {
                    let a = self.class_addr[class.0 as usize] as i32;
                    set(frame, *dst, a);
                    frame.pc += 1;
                }
                Instr::LoadArr { dst, arr } => {
                    let a = self.arr_addr[arr.0 as usize] as i32;
                    set(frame, *dst, a);
                    frame.pc += 1;
                }
            }
        }
    }

    fn new_frame(&self, func: usize, caller_sp: i32, args: &[i32]) -> Frame {
        let f = &self.session.funcs[func];
        let mut vals = vec![0; f.num_values()];
        for (i, &a) in args.iter().enumerate().take(8) {
            vals[1 + i] = a;
        }
        vals[crate::backend::abi::Register::STACK_PTR.index()] =
            caller_sp - f.frame.high_water();
        Frame { func, pc: 0, vals }
    }

    fn resolve(&self, frame: &Frame, addr: &Addr, func: &str) -> Result<i32, InterpError> {
        match addr {
            Addr::Off { base, off } => Ok(frame.vals[base.0 as usize].wrapping_add(*off)),
            Addr::Global(sym) => self.global_addr.get(sym).map(|&a| a as i32).ok_or_else(|| {
                InterpError::UnknownGlobal {
                    sym: sym.clone(),
                    func: func.to_string(),
                }
            }),
        }
    }

    fn read_word(&self, addr: i32, func: &str) -> Result<i32, InterpError> {
        let a = addr as usize;
        if addr < 0 || addr % 4 != 0 || a + 4 > self.mem.len() {
            return Err(InterpError::MemoryFault {
                addr,
                func: func.to_string(),
            });
        }
        Ok(i32::from_le_bytes(self.mem[a..a + 4].try_into().unwrap()))
    }

    fn write_word(&mut self, addr: i32, v: i32, func: &str) -> Result<(), InterpError> {
        let a = addr as usize;
        if addr < 0 || addr % 4 != 0 || a + 4 > self.mem.len() {
            return Err(InterpError::MemoryFault {
                addr,
                func: func.to_string(),
            });
        }
        self.mem[a..a + 4].copy_from_slice(&v.to_le_bytes());
        Ok(())
    }

    // ── Runtime entry points ────────────────────────────────────────────

    fn runtime_call(
        &mut self,
        frame: &mut Frame,
        rf: RuntimeFn,
        func: &str,
    ) -> Result<(), InterpError> {
        match rf {
            RuntimeFn::Alloc => {
                let size = pad4(frame.vals[1].max(0) as u32);
                let addr = self.heap_top;
                if addr as usize + size as usize > self.mem.len() / 2 {
                    return Err(InterpError::OutOfMemory);
                }
                self.heap_top += size;
                frame.vals[1] = addr as i32;
            }
            RuntimeFn::Free => {
                // The bump allocator never reclaims; good enough for a
                // test oracle.
            }
            RuntimeFn::StrEq => {
                let a = self.read_bytes(frame.vals[1], func)?;
                let b = self.read_bytes(frame.vals[2], func)?;
                frame.vals[1] = (a == b) as i32;
            }
            RuntimeFn::StrCmp => {
                let a = self.read_bytes(frame.vals[1], func)?;
                let b = self.read_bytes(frame.vals[2], func)?;
                frame.vals[1] = match a.cmp(&b) {
                    std::cmp::Ordering::Less => -1,
                    std::cmp::Ordering::Equal => 0,
                    std::cmp::Ordering::Greater => 1,
                };
            }
            RuntimeFn::PrintInt => {
                self.output.push_str(&frame.vals[1].to_string());
                self.output.push('\n');
            }
            RuntimeFn::PrintStr => {
                let bytes = self.read_bytes(frame.vals[1], func)?;
                self.output.push_str(&String::from_utf8_lossy(&bytes));
                self.output.push('\n');
            }
        }
        Ok(())
    }

    /// Read a length-prefixed byte string (length word at `base - 4`).
    fn read_bytes(&self, base: i32, func: &str) -> Result<Vec<u8>, InterpError> {
        let len = self.read_word(base - 4, func)?;
        let (start, len) = (base as usize, len.max(0) as usize);
        if base < 4 || start + len > self.mem.len() {
            return Err(InterpError::MemoryFault {
                addr: base,
                func: func.to_string(),
            });
        }
        Ok(self.mem[start..start + len].to_vec())
    }
}

fn set(frame: &mut Frame, v: ValueId, val: i32) {
    // `$0` stays hard-wired to zero.
    if v.0 != 0 {
        frame.vals[v.0 as usize] = val;
    }
}

fn elem_bytes(w: ElemWidth) -> u32 {
    match w {
        ElemWidth::Word => 4,
        ElemWidth::Half => 2,
        ElemWidth::Byte => 1,
    }
}

fn pad4(n: u32) -> u32 {
    (n + 3) & !3
}
