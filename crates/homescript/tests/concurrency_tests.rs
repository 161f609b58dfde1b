//! Multi-core behavior: spawning, shared globals, cancellation, deadlines.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common::{run_main_with, single_module};
use homescript::{
    AnalyzedProgram, Block, Builtin, BufferedExecutor, CallBase, Expression, ExpressionKind,
    FatalKind, FunctionDefinition, FunctionInvocation, FunctionInvocationResult, ImportItem,
    ImportStatement, InfixOp, Interrupt, LetDecl, Limits, Parameter, Span, Statement, Type, Value,
    Vm, compile, value_ref,
};

fn for_n(n: i64, body: Block) -> Statement {
    Statement::For {
        ident: "_".to_string(),
        iter: Expression::range(Expression::int(0), Expression::int(n), false),
        body,
        span: Span::default(),
    }
}

#[test]
fn test_two_cores_incrementing_a_global_under_lock() {
    // fn worker() { for _ in 0..1000 { incr() } }
    // fn main() { spawn worker(); spawn worker(); }
    let worker = FunctionDefinition::new(
        "worker",
        vec![],
        Type::Null,
        Block::new(vec![for_n(
            1000,
            Block::new(vec![Statement::expr(Expression::call(
                "incr",
                vec![],
                Type::Null,
            ))]),
        )]),
    );
    let main = FunctionDefinition::new(
        "main",
        vec![],
        Type::Null,
        Block::new(vec![
            Statement::expr(Expression::spawn("worker", vec![])),
            Statement::expr(Expression::spawn("worker", vec![])),
        ]),
    );
    let modules = single_module(AnalyzedProgram {
        globals: vec![LetDecl {
            ident: "counter".to_string(),
            value: Expression::int(0),
            check_type: None,
            span: Span::default(),
        }],
        functions: vec![worker, main],
        ..AnalyzedProgram::default()
    });

    let program = compile(&modules, "main");
    let counter = program.resolve_global("main", "counter").unwrap().to_string();
    let main = program.resolve_function("main", "main").unwrap().to_string();

    // `incr` performs its read-modify-write under the globals write lock.
    let counter_name = counter.clone();
    let mut additions = HashMap::new();
    additions.insert(
        "incr".to_string(),
        Value::BuiltinFunction(Builtin::new(move |ctx, _args| {
            ctx.globals.update(|map| {
                let current = map
                    .get(&counter_name)
                    .and_then(|handle| handle.read().as_int())
                    .unwrap_or(0);
                map.insert(counter_name.clone(), value_ref(Value::Int(current + 1)));
            });
            Ok(None)
        })),
    );

    let vm = Vm::new(
        program,
        Arc::new(BufferedExecutor::new()),
        Limits::default(),
        additions,
    );
    vm.run_init().unwrap();
    let result = vm.spawn_sync(FunctionInvocation::new(main), None);
    assert!(matches!(result, FunctionInvocationResult::Value(_)));

    let total = vm.globals().get(&counter).unwrap().read().clone();
    assert!(total.is_equal(&Value::Int(2000)), "got {}", total.display());
}

#[test]
fn test_concurrent_global_writes_are_not_torn() {
    // Two workers each hammer `g = <their value>`; the final value must be
    // exactly one of the written values.
    let worker = FunctionDefinition::new(
        "worker",
        vec![Parameter::new("val", Type::Int)],
        Type::Null,
        Block::new(vec![for_n(
            500,
            Block::new(vec![Statement::expr(Expression::assign(
                Expression::ident("g", Type::Int),
                Expression::ident("val", Type::Int),
            ))]),
        )]),
    );
    let main = FunctionDefinition::new(
        "main",
        vec![],
        Type::Null,
        Block::new(vec![
            Statement::expr(Expression::spawn("worker", vec![Expression::int(1)])),
            Statement::expr(Expression::spawn("worker", vec![Expression::int(2)])),
        ]),
    );
    let modules = single_module(AnalyzedProgram {
        globals: vec![LetDecl {
            ident: "g".to_string(),
            value: Expression::int(0),
            check_type: None,
            span: Span::default(),
        }],
        functions: vec![worker, main],
        ..AnalyzedProgram::default()
    });

    let program = compile(&modules, "main");
    let g = program.resolve_global("main", "g").unwrap().to_string();
    let main = program.resolve_function("main", "main").unwrap().to_string();
    let vm = Vm::new(
        program,
        Arc::new(BufferedExecutor::new()),
        Limits::default(),
        HashMap::new(),
    );
    vm.run_init().unwrap();
    let result = vm.spawn_sync(FunctionInvocation::new(main), None);
    assert!(matches!(result, FunctionInvocationResult::Value(_)));

    let value = vm.globals().get(&g).unwrap().read().as_int().unwrap();
    assert!(value == 1 || value == 2, "torn or lost write: {}", value);
}

#[test]
fn test_fault_cancels_sibling_cores() {
    // A worker spins forever; main throws. Wait must report the fault and
    // the spinning core must terminate cooperatively.
    let worker = FunctionDefinition::new(
        "worker",
        vec![],
        Type::Null,
        Block::new(vec![Statement::Loop {
            body: Block::new(vec![]),
            span: Span::default(),
        }]),
    );
    let main = FunctionDefinition::new(
        "main",
        vec![],
        Type::Null,
        Block::new(vec![
            Statement::expr(Expression::spawn("worker", vec![])),
            Statement::expr(Expression::call(
                "throw",
                vec![Expression::string("fatal")],
                Type::Null,
            )),
        ]),
    );
    let modules = single_module(AnalyzedProgram {
        functions: vec![worker, main],
        ..AnalyzedProgram::default()
    });

    let run = run_main_with(modules, Arc::new(BufferedExecutor::new()), HashMap::new());
    let FunctionInvocationResult::Exception { interrupt, .. } = run.result else {
        panic!("expected an exception result");
    };
    let Interrupt::Fatal(fatal) = interrupt else {
        panic!("expected fatal");
    };
    assert_eq!(fatal.kind, FatalKind::UncaughtThrow);
    // The first fault became the cancellation cause for everyone else.
    assert!(run.vm.cancel_token().is_cancelled());
    assert!(run.vm.cancel_token().cause().unwrap().contains("fatal"));
}

#[test]
fn test_deadline_terminates_spinning_program() {
    let main = FunctionDefinition::new(
        "main",
        vec![],
        Type::Null,
        Block::new(vec![Statement::Loop {
            body: Block::new(vec![]),
            span: Span::default(),
        }]),
    );
    let modules = single_module(AnalyzedProgram {
        functions: vec![main],
        ..AnalyzedProgram::default()
    });

    let program = compile(&modules, "main");
    let main = program.resolve_function("main", "main").unwrap().to_string();
    let vm = Vm::new(
        program,
        Arc::new(BufferedExecutor::new()),
        Limits::default(),
        HashMap::new(),
    );
    vm.run_init().unwrap();
    vm.set_deadline(Duration::from_millis(50));

    let result = vm.spawn_sync(FunctionInvocation::new(main), None);
    let FunctionInvocationResult::Exception { interrupt, .. } = result else {
        panic!("expected an exception result");
    };
    let Interrupt::Termination { reason, .. } = interrupt else {
        panic!("expected termination, got {}", interrupt);
    };
    assert!(reason.contains("maximum runtime"));
}

#[test]
fn test_sleep_observes_cancellation() {
    // import { time } from sys;  fn main() { time.sleep(30); }
    let sleep_call = Expression::new(
        ExpressionKind::Call {
            base: CallBase::Expr(Box::new(Expression::member(
                Expression::ident("time", Type::AnyObject),
                "sleep",
                Type::Function {
                    params: vec![Type::Int],
                    return_type: Box::new(Type::Null),
                },
            ))),
            args: vec![Expression::int(30)],
            spawn: false,
        },
        Type::Null,
        Span::default(),
    );
    let modules = single_module(AnalyzedProgram {
        imports: vec![ImportStatement {
            module: "sys".to_string(),
            items: vec![ImportItem {
                name: "time".to_string(),
                span: Span::default(),
            }],
            span: Span::default(),
        }],
        functions: vec![FunctionDefinition::new(
            "main",
            vec![],
            Type::Null,
            Block::new(vec![Statement::expr(sleep_call)]),
        )],
        ..AnalyzedProgram::default()
    });

    let program = compile(&modules, "main");
    let main = program.resolve_function("main", "main").unwrap().to_string();
    let vm = Vm::new(
        program,
        Arc::new(BufferedExecutor::new()),
        Limits::default(),
        HashMap::new(),
    );
    vm.run_init().unwrap();
    vm.set_deadline(Duration::from_millis(80));

    let started = std::time::Instant::now();
    let result = vm.spawn_sync(FunctionInvocation::new(main), None);
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "sleep did not observe cancellation"
    );
    let FunctionInvocationResult::Exception { interrupt, .. } = result else {
        panic!("expected an exception result");
    };
    assert!(matches!(interrupt, Interrupt::Termination { .. }));
}

#[test]
fn test_exit_cancels_sibling_cores() {
    let worker = FunctionDefinition::new(
        "worker",
        vec![],
        Type::Null,
        Block::new(vec![Statement::Loop {
            body: Block::new(vec![]),
            span: Span::default(),
        }]),
    );
    let main = FunctionDefinition::new(
        "main",
        vec![],
        Type::Null,
        Block::new(vec![
            Statement::expr(Expression::spawn("worker", vec![])),
            Statement::expr(Expression::call(
                "exit",
                vec![Expression::int(0)],
                Type::Null,
            )),
        ]),
    );
    let modules = single_module(AnalyzedProgram {
        functions: vec![worker, main],
        ..AnalyzedProgram::default()
    });

    let run = run_main_with(modules, Arc::new(BufferedExecutor::new()), HashMap::new());
    let FunctionInvocationResult::Exception { interrupt, .. } = run.result else {
        panic!("expected an exception result");
    };
    assert!(matches!(interrupt, Interrupt::Exit(0)));
}

#[test]
fn test_infix_used_in_both_workers() {
    // Regression-style check that spawned cores run real code: each worker
    // appends to its own region of a shared list through `push`.
    let worker = FunctionDefinition::new(
        "worker",
        vec![Parameter::new("val", Type::Int)],
        Type::Null,
        Block::new(vec![Statement::expr(Expression::new(
            ExpressionKind::Call {
                base: CallBase::Expr(Box::new(Expression::member(
                    Expression::ident("items", Type::List(Box::new(Type::Int))),
                    "push",
                    Type::Function {
                        params: vec![Type::Int],
                        return_type: Box::new(Type::Null),
                    },
                ))),
                args: vec![Expression::infix(
                    InfixOp::Mul,
                    Expression::ident("val", Type::Int),
                    Expression::int(10),
                )],
                spawn: false,
            },
            Type::Null,
            Span::default(),
        ))]),
    );
    let main = FunctionDefinition::new(
        "main",
        vec![],
        Type::Null,
        Block::new(vec![
            Statement::expr(Expression::spawn("worker", vec![Expression::int(1)])),
            Statement::expr(Expression::spawn("worker", vec![Expression::int(2)])),
        ]),
    );
    let modules = single_module(AnalyzedProgram {
        globals: vec![LetDecl {
            ident: "items".to_string(),
            value: Expression::list(vec![], Type::Int),
            check_type: None,
            span: Span::default(),
        }],
        functions: vec![worker, main],
        ..AnalyzedProgram::default()
    });

    let program = compile(&modules, "main");
    let items = program.resolve_global("main", "items").unwrap().to_string();
    let main = program.resolve_function("main", "main").unwrap().to_string();
    let vm = Vm::new(
        program,
        Arc::new(BufferedExecutor::new()),
        Limits::default(),
        HashMap::new(),
    );
    vm.run_init().unwrap();
    let result = vm.spawn_sync(FunctionInvocation::new(main), None);
    assert!(matches!(result, FunctionInvocationResult::Value(_)));

    let list = vm.globals().get(&items).unwrap().read().clone();
    let Value::List(elements) = list else {
        panic!("expected a list")
    };
    let mut seen: Vec<i64> = elements
        .iter()
        .map(|element| element.read().as_int().unwrap())
        .collect();
    seen.sort_unstable();
    assert_eq!(seen, vec![10, 20]);
}
