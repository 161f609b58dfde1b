//! The instruction set and the compiled-program representation.
//!
//! Instructions carry their operands inline (there is no constant pool).
//! Jump-shaped operands start life as labels and are rewritten to absolute
//! instruction indices by the compiler's relocation pass; variable operands
//! start as mangled names and are rewritten to dense slot indices. Both
//! pre-relocation forms are compile-time only: a `Label` opcode or a
//! name-shaped operand surviving into a [`Program`] is a compiler bug.

use std::collections::HashMap;
use std::fmt;

use crate::ast::Type;
use crate::diagnostic::Span;
use crate::value::Value;

/// A jump operand: symbolic before relocation, absolute after.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Label(String),
    Ip(usize),
}

impl Target {
    /// The resolved instruction index. Unresolved labels after relocation are
    /// compiler bugs, hence the panic.
    pub fn ip(&self) -> usize {
        match self {
            Target::Ip(ip) => *ip,
            Target::Label(label) => panic!("unresolved jump label `{}`", label),
        }
    }
}

/// A variable operand: mangled name before renumbering, slot index after.
#[derive(Debug, Clone, PartialEq)]
pub enum Slot {
    Name(String),
    Index(i64),
}

impl Slot {
    pub fn index(&self) -> i64 {
        match self {
            Slot::Index(index) => *index,
            Slot::Name(name) => panic!("unrenumbered variable `{}`", name),
        }
    }
}

/// One bytecode instruction.
#[derive(Debug, Clone)]
pub enum Instruction {
    Nop,

    // --- stack ---
    /// Push an owned copy of the inline value.
    CopyPush(Value),
    /// Push a deep clone of the inline value (container literal prototypes).
    CloningPush(Value),
    /// Replace the top of the stack with its deep clone.
    Clone,
    /// Discard the top of the stack.
    Drop,
    /// Push a reference copy of the top of the stack.
    Duplicate,

    // --- calls ---
    /// Pop `n`, pop `n` args, start a new core running the named function.
    /// Pushes null as the handle placeholder.
    Spawn(String),
    /// Push a call frame for the named function.
    CallImm(String),
    /// Pop `n`, pop the callee, then dispatch: VM functions get a frame,
    /// builtins are invoked inline with the popped args.
    CallVal,
    /// Pop the current call frame; terminates the core when it was the last.
    Return,
    /// Replace the default on top of the stack with the host-owned singleton
    /// instance, when the host has one.
    LoadSingleton { name: String, module: String },
    /// Pop argc, pop argc args in reverse, invoke the named host reducer.
    HostCall(String),

    // --- control flow ---
    Jump(Target),
    JumpIfFalse(Target),

    // --- variables ---
    GetVar(Slot),
    SetVar(Slot),
    GetGlob(String),
    SetGlob(String),
    /// Adjust the memory pointer on frame entry/exit; overflowing the
    /// configured memory limit is fatal.
    AddMemPointer(i64),
    /// Pop `src`, pop `dest`, write `*dest <- *src`.
    Assign,

    // --- values ---
    Cast { ty: Type, allow_casts: bool },
    Neg,
    Not,
    BitNot,
    /// Wrap the top of the stack into an option.
    Some,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
    Shl,
    Shr,
    BitOr,
    BitAnd,
    BitXor,
    Eq,
    /// Equality that pops only one operand, leaving the match control value
    /// in place for the next arm.
    EqPopOnce,
    Lt,
    Le,
    Gt,
    Ge,
    /// Pop index, pop base; string/list indexing with negative wrapping.
    Index,
    /// Field read; missing fields are fatal.
    Member(String),
    /// Field read on an any-object, yielding an option.
    MemberAnyObj(String),
    /// Unwrap an option or fail with `OptionUnwrapErr`.
    MemberUnwrap,
    /// Pop a value, raise a catchable exception with its display text.
    Throw,
    /// Push a catch frame pointing into the named function.
    SetTryLabel { function: String, target: Target },
    PopTryLabel,
    /// Pop end, pop start, push a range.
    IntoRange { end_inclusive: bool },
    IntoIter,
    /// Advance the iterator under the top of the stack: push the `more?`
    /// flag, then the yielded value on top of it.
    IteratorAdvance,
    /// Resolve a builtin module member through the executor and publish it
    /// into globals under `item`.
    Import { module: String, item: String },

    /// Compile-time only; stripped by label relocation.
    Label(String),
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Nop => write!(f, "nop"),
            Instruction::CopyPush(value) => write!(f, "copy_push {}", operand(value)),
            Instruction::CloningPush(value) => write!(f, "cloning_push {}", operand(value)),
            Instruction::Clone => write!(f, "clone"),
            Instruction::Drop => write!(f, "drop"),
            Instruction::Duplicate => write!(f, "duplicate"),
            Instruction::Spawn(name) => write!(f, "spawn {}", name),
            Instruction::CallImm(name) => write!(f, "call_imm {}", name),
            Instruction::CallVal => write!(f, "call_val"),
            Instruction::Return => write!(f, "return"),
            Instruction::LoadSingleton { name, module } => {
                write!(f, "load_singleton {} {}", name, module)
            }
            Instruction::HostCall(name) => write!(f, "host_call {}", name),
            Instruction::Jump(target) => write!(f, "jump {}", target_operand(target)),
            Instruction::JumpIfFalse(target) => {
                write!(f, "jump_if_false {}", target_operand(target))
            }
            Instruction::GetVar(slot) => write!(f, "get_var {}", slot_operand(slot)),
            Instruction::SetVar(slot) => write!(f, "set_var {}", slot_operand(slot)),
            Instruction::GetGlob(name) => write!(f, "get_glob {}", name),
            Instruction::SetGlob(name) => write!(f, "set_glob {}", name),
            Instruction::AddMemPointer(amount) => write!(f, "add_mem_pointer {}", amount),
            Instruction::Assign => write!(f, "assign"),
            Instruction::Cast { ty, allow_casts } => write!(f, "cast {} {}", ty, allow_casts),
            Instruction::Neg => write!(f, "neg"),
            Instruction::Not => write!(f, "not"),
            Instruction::BitNot => write!(f, "bit_not"),
            Instruction::Some => write!(f, "some"),
            Instruction::Add => write!(f, "add"),
            Instruction::Sub => write!(f, "sub"),
            Instruction::Mul => write!(f, "mul"),
            Instruction::Div => write!(f, "div"),
            Instruction::Rem => write!(f, "rem"),
            Instruction::Pow => write!(f, "pow"),
            Instruction::Shl => write!(f, "shl"),
            Instruction::Shr => write!(f, "shr"),
            Instruction::BitOr => write!(f, "bit_or"),
            Instruction::BitAnd => write!(f, "bit_and"),
            Instruction::BitXor => write!(f, "bit_xor"),
            Instruction::Eq => write!(f, "eq"),
            Instruction::EqPopOnce => write!(f, "eq_pop_once"),
            Instruction::Lt => write!(f, "lt"),
            Instruction::Le => write!(f, "le"),
            Instruction::Gt => write!(f, "gt"),
            Instruction::Ge => write!(f, "ge"),
            Instruction::Index => write!(f, "index"),
            Instruction::Member(name) => write!(f, "member {}", name),
            Instruction::MemberAnyObj(name) => write!(f, "member_anyobj {}", name),
            Instruction::MemberUnwrap => write!(f, "member_unwrap"),
            Instruction::Throw => write!(f, "throw"),
            Instruction::SetTryLabel { function, target } => {
                write!(f, "set_try_label {} {}", function, target_operand(target))
            }
            Instruction::PopTryLabel => write!(f, "pop_try_label"),
            Instruction::IntoRange { end_inclusive } => {
                write!(f, "into_range {}", end_inclusive)
            }
            Instruction::IntoIter => write!(f, "into_iter"),
            Instruction::IteratorAdvance => write!(f, "iterator_advance"),
            Instruction::Import { module, item } => write!(f, "import {} {}", module, item),
            Instruction::Label(name) => write!(f, "label {}", name),
        }
    }
}

fn operand(value: &Value) -> String {
    let rendered = value.display();
    if rendered.contains('\n') {
        rendered.replace('\n', " ")
    } else {
        rendered
    }
}

fn target_operand(target: &Target) -> String {
    match target {
        Target::Label(label) => format!("@{}", label),
        Target::Ip(ip) => ip.to_string(),
    }
}

fn slot_operand(slot: &Slot) -> String {
    match slot {
        Slot::Name(name) => name.clone(),
        Slot::Index(index) => index.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Compiled program
// ---------------------------------------------------------------------------

/// A compiled routine.
///
/// `instructions` and `spans` are parallel vectors of equal length. `locals`
/// is the declared local-variable count; `cleanup_ip` points at the epilogue
/// label that restores the memory pointer before `Return`.
#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub instructions: Vec<Instruction>,
    pub spans: Vec<Span>,
    pub locals: usize,
    pub cleanup_ip: usize,
}

impl Function {
    /// The span for an instruction pointer; the last span when the pointer
    /// sits at the end of the stream.
    pub fn span_at(&self, ip: usize) -> Span {
        if ip < self.spans.len() {
            self.spans[ip].clone()
        } else {
            self.spans.last().cloned().unwrap_or_default()
        }
    }
}

/// Per-function compile-time annotations surfaced to the host.
#[derive(Debug, Clone, PartialEq)]
pub enum CompiledAnnotation {
    Trigger {
        /// Mangled name of the annotated callback function.
        callback_function: String,
        trigger_source: String,
        /// Mangled name of the synthesized function materializing the
        /// trigger arguments as a list.
        args_function: String,
    },
}

/// Source-name resolution tables, keyed by `(module, source identifier)`.
#[derive(Debug, Clone, Default)]
pub struct NameMappings {
    pub functions: HashMap<(String, String), String>,
    pub globals: HashMap<(String, String), String>,
    pub singletons: HashMap<(String, String), String>,
}

/// The compiler's output: every function of every module plus the name
/// mapping tables and compiled annotations.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub functions: HashMap<String, Function>,
    /// The mangled `@init` of the entry module; running it initializes every
    /// module's globals and singletons.
    pub entry_function: String,
    pub mappings: NameMappings,
    pub annotations: HashMap<String, Vec<CompiledAnnotation>>,
}

impl Program {
    /// Resolve a source-level function name of a module to its mangled name.
    pub fn resolve_function(&self, module: &str, name: &str) -> Option<&str> {
        self.mappings
            .functions
            .get(&(module.to_string(), name.to_string()))
            .map(String::as_str)
    }

    /// Resolve a source-level global name of a module to its mangled name.
    pub fn resolve_global(&self, module: &str, name: &str) -> Option<&str> {
        self.mappings
            .globals
            .get(&(module.to_string(), name.to_string()))
            .map(String::as_str)
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.functions.keys().collect();
        names.sort();
        for name in names {
            let function = &self.functions[name];
            writeln!(
                f,
                "fn {} (locals: {}, cleanup: {})",
                function.name, function.locals, function.cleanup_ip
            )?;
            for (ip, instruction) in function.instructions.iter().enumerate() {
                writeln!(f, "  {:04}  {}", ip, instruction)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instruction_rendering() {
        assert_eq!(Instruction::Jump(Target::Ip(5)).to_string(), "jump 5");
        assert_eq!(
            Instruction::Jump(Target::Label("loop_head0".into())).to_string(),
            "jump @loop_head0"
        );
        assert_eq!(
            Instruction::CopyPush(Value::Int(3)).to_string(),
            "copy_push 3"
        );
        assert_eq!(
            Instruction::GetVar(Slot::Index(2)).to_string(),
            "get_var 2"
        );
    }

    #[test]
    #[should_panic(expected = "unresolved jump label")]
    fn test_unresolved_target_panics() {
        Target::Label("oops".to_string()).ip();
    }

    #[test]
    fn test_span_at_end_returns_last() {
        let span = Span::internal("main.hms");
        let function = Function {
            name: "@main_f".into(),
            instructions: vec![Instruction::Nop],
            spans: vec![span.clone()],
            locals: 0,
            cleanup_ip: 0,
        };
        assert_eq!(function.span_at(0), span);
        assert_eq!(function.span_at(10), span);
    }
}
