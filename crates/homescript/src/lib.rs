//! Homescript: a bytecode compiler and stack VM for smart-home automation.
//!
//! Homescript programs arrive here already lexed, parsed, and type-analyzed;
//! this crate lowers the analyzed tree to a compact instruction stream and
//! executes it on one or more cooperating cores with shared globals,
//! structured exception handling, host-supplied builtins, cancellation, and
//! per-core resource limits.
//!
//! # Quick start
//!
//! ```
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! use homescript::{
//!     AnalyzedProgram, Block, BufferedExecutor, Expression, FunctionDefinition,
//!     FunctionInvocation, FunctionInvocationResult, Limits, Statement, Type, Vm, compile,
//! };
//!
//! // The analyzer normally produces this tree; built by hand it reads:
//! //   fn main() { println(1 + 2); }
//! let body = Block::new(vec![Statement::expr(Expression::call(
//!     "println",
//!     vec![Expression::infix(
//!         homescript::InfixOp::Add,
//!         Expression::int(1),
//!         Expression::int(2),
//!     )],
//!     Type::Null,
//! ))]);
//! let mut modules = HashMap::new();
//! modules.insert(
//!     "main".to_string(),
//!     AnalyzedProgram {
//!         functions: vec![FunctionDefinition::new("main", vec![], Type::Null, body)],
//!         ..AnalyzedProgram::default()
//!     },
//! );
//!
//! let program = compile(&modules, "main");
//! let main = program.resolve_function("main", "main").unwrap().to_string();
//!
//! let executor = Arc::new(BufferedExecutor::new());
//! let vm = Vm::new(program, executor.clone(), Limits::default(), HashMap::new());
//! vm.run_init().unwrap();
//! let result = vm.spawn_sync(FunctionInvocation::new(main), None);
//! assert!(matches!(result, FunctionInvocationResult::Value(_)));
//! assert_eq!(executor.output(), "3\n");
//! ```
//!
//! # Architecture
//!
//! - [`ast`]: the analyzed-program input model (an external analyzer fills
//!   it in; tests build it by hand).
//! - [`compile`]: name mangling, lowering, label relocation, and variable
//!   slot renumbering into a [`Program`].
//! - [`Vm`] / cores: one OS thread per core; operand stack, frame memory
//!   addressed relative to a memory pointer, call stack, and catch stack per
//!   core; globals and the live-core set behind reader-writer locks.
//! - [`Executor`]: the host boundary for singletons, builtin imports, module
//!   sources, the output sink, and the executing user.
//! - [`validate`]: the parallel golden-output harness the fuzzing driver
//!   builds on.
//!
//! Resource limits (operand stack depth, call depth, memory slots) and
//! cooperative cancellation are enforced at virtual-cycle boundaries; see
//! [`Limits`] and [`CancelToken`].

pub mod ast;
mod builtins;
mod bytecode;
mod cancel;
mod cast;
mod compiler;
mod core;
mod debugger;
mod diagnostic;
mod error;
mod executor;
mod json;
mod methods;
mod operators;
pub mod validate;
mod value;
mod vm;

pub use ast::{
    AnalyzedProgram, Block, CallBase, Expression, ExpressionKind, FunctionAnnotation,
    FunctionDefinition, ImplBlock, ImportItem, ImportStatement, InfixOp, LetDecl, MatchArm,
    MemberKind, ObjectTypeField, Parameter, ParameterKind, PrefixOp, SingletonDecl, Statement,
    Type,
};
pub use bytecode::{
    CompiledAnnotation, Function, Instruction, NameMappings, Program, Slot, Target,
};
pub use cancel::CancelToken;
pub use compiler::{LIST_PUSH, compile};
pub use self::core::{CallFrame, Core, CoreResult, INSTRUCTIONS_PER_CYCLE};
pub use debugger::{DebugClient, DebugCommand, DebugOutput, Debugger};
pub use diagnostic::{Diagnostic, Level, Loc, Span};
pub use error::{
    Exception, ExceptionOrigin, FatalError, FatalKind, HostError, Interrupt, RuntimeError,
    TraceFrame,
};
pub use executor::{BufferedExecutor, Executor, HostCtx};
pub use json::{marshal, parse as parse_json, to_json_string, unmarshal, unmarshal_typed};
pub use value::{Builtin, BuiltinFn, Value, ValueIterator, ValueKind, ValueRef, value_ref};
pub use vm::{
    FunctionInvocation, FunctionInvocationResult, FunctionSignature, Globals, Limits, Vm, VmInner,
    spawn_core,
};
