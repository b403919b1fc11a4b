//! The compilation session.
//!
//! Everything that used to be process-wide — the ordered function list, the
//! string/class/constant-array pools behind the data segment, and the
//! diagnostic log — lives on an explicit [`Session`] passed into every
//! phase.  [`Session::reset`] clears it all, so independent compilations in
//! one process cannot leak into each other.

use crate::ast::{ClassDecl, ElemWidth};
use crate::ir::{ArrId, ClassId, Func, StrId};
use std::collections::HashMap;
use std::fmt;

/// A class descriptor destined for the data segment.
#[derive(Debug, Clone)]
pub struct ClassDesc {
    pub name: String,
    /// The class name as an interned string, referenced by the descriptor.
    pub name_str: StrId,
    /// Instance size in bytes, excluding the descriptor header word.
    pub size: i32,
    pub superclass: Option<ClassId>,
    /// Method labels in declared order.
    pub vtable: Vec<String>,
    pub destructor: Option<String>,
}

/// A constant array destined for the data segment.
#[derive(Debug, Clone)]
pub struct ConstArray {
    pub width: ElemWidth,
    pub values: Vec<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

/// One entry in the session's diagnostic log.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        write!(f, "{tag}: {}", self.message)
    }
}

/// Accumulated state of one compilation.
pub struct Session {
    /// Every generated function, in generation order; the emitter consumes
    /// this list as-is.
    pub funcs: Vec<Func>,
    strings: Vec<String>,
    string_index: HashMap<String, StrId>,
    classes: Vec<ClassDesc>,
    class_index: HashMap<String, ClassId>,
    consts: Vec<ConstArray>,
    pub globals: Vec<String>,
    diags: Vec<Diagnostic>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            funcs: Vec::new(),
            strings: Vec::new(),
            string_index: HashMap::new(),
            classes: Vec::new(),
            class_index: HashMap::new(),
            consts: Vec::new(),
            globals: Vec::new(),
            diags: Vec::new(),
        }
    }

    /// Drop all accumulated state; called at the start of every compilation.
    pub fn reset(&mut self) {
        self.funcs.clear();
        self.strings.clear();
        self.string_index.clear();
        self.classes.clear();
        self.class_index.clear();
        self.consts.clear();
        self.globals.clear();
        self.diags.clear();
    }

    // ── String pool ─────────────────────────────────────────────────────

    /// Intern a string literal; identical contents share one entry.
    pub fn intern_string(&mut self, s: &str) -> StrId {
        if let Some(&id) = self.string_index.get(s) {
            return id;
        }
        let id = StrId(self.strings.len() as u32);
        self.strings.push(s.to_string());
        self.string_index.insert(s.to_string(), id);
        id
    }

    pub fn strings(&self) -> &[String] {
        &self.strings
    }

    // ── Class descriptors ───────────────────────────────────────────────

    /// Register every class of a program.  Runs in two passes so a
    /// superclass may be declared after its subclass.
    pub fn register_classes(&mut self, decls: &[ClassDecl]) {
        for decl in decls {
            let id = ClassId(self.classes.len() as u32);
            let name_str = self.intern_string(&decl.name);
            self.class_index.insert(decl.name.clone(), id);
            self.classes.push(ClassDesc {
                name: decl.name.clone(),
                name_str,
                size: decl.size,
                superclass: None,
                vtable: decl.methods.clone(),
                destructor: decl.destructor.clone(),
            });
        }
        for (i, decl) in decls.iter().enumerate() {
            self.classes[i].superclass = decl
                .superclass
                .as_deref()
                .and_then(|s| self.class_index.get(s).copied());
        }
    }

    pub fn class_id(&self, name: &str) -> Option<ClassId> {
        self.class_index.get(name).copied()
    }

    pub fn class(&self, id: ClassId) -> &ClassDesc {
        &self.classes[id.0 as usize]
    }

    pub fn classes(&self) -> &[ClassDesc] {
        &self.classes
    }

    // ── Constant arrays ─────────────────────────────────────────────────

    pub fn add_const_array(&mut self, width: ElemWidth, values: Vec<i32>) -> ArrId {
        let id = ArrId(self.consts.len() as u32);
        self.consts.push(ConstArray { width, values });
        id
    }

    pub fn const_arrays(&self) -> &[ConstArray] {
        &self.consts
    }

    // ── Diagnostics ─────────────────────────────────────────────────────

    pub fn warn(&mut self, message: impl Into<String>) {
        self.diags.push(Diagnostic {
            severity: Severity::Warning,
            message: message.into(),
        });
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.diags.push(Diagnostic {
            severity: Severity::Error,
            message: message.into(),
        });
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diags
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
