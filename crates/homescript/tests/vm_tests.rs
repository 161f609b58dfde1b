//! End-to-end scenarios: analyzed programs through the compiler and the VM.

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use pretty_assertions::assert_eq;

use common::{expect_value, main_only, run_main, run_main_with, single_module};
use homescript::{
    AnalyzedProgram, Block, BufferedExecutor, CallBase, Expression, ExpressionKind, FatalKind,
    FunctionAnnotation, FunctionDefinition, FunctionInvocation, FunctionInvocationResult,
    ImportItem, ImportStatement, InfixOp, Interrupt, Limits, Loc, MatchArm, ObjectTypeField,
    Parameter, SingletonDecl, Span, Statement, Type, Value, Vm, compile,
};

fn println_call(arg: Expression) -> Statement {
    Statement::expr(Expression::call("println", vec![arg], Type::Null))
}

fn method_call(base: Expression, method: &str, args: Vec<Expression>, result: Type) -> Expression {
    let member = Expression::member(
        base,
        method,
        Type::Function {
            params: vec![],
            return_type: Box::new(result.clone()),
        },
    );
    Expression::new(
        ExpressionKind::Call {
            base: CallBase::Expr(Box::new(member)),
            args,
            spawn: false,
        },
        result,
        Span::default(),
    )
}

#[test]
fn test_arithmetic_print() {
    let body = Block::new(vec![println_call(Expression::infix(
        InfixOp::Add,
        Expression::int(1),
        Expression::int(2),
    ))]);
    let run = run_main(main_only(body));
    expect_value(&run);
    assert_eq!(run.output, "3\n");
}

#[test]
fn test_for_range() {
    let body = Block::new(vec![Statement::For {
        ident: "i".to_string(),
        iter: Expression::range(Expression::int(0), Expression::int(3), false),
        body: Block::new(vec![println_call(Expression::ident("i", Type::Int))]),
        span: Span::default(),
    }]);
    let run = run_main(main_only(body));
    expect_value(&run);
    assert_eq!(run.output, "0\n1\n2\n");
}

#[test]
fn test_try_catch() {
    let try_block = Block::new(vec![Statement::expr(Expression::call(
        "throw",
        vec![Expression::string("oops")],
        Type::Null,
    ))]);
    let catch_block = Block::new(vec![println_call(Expression::member(
        Expression::ident("e", Type::AnyObject),
        "message",
        Type::String,
    ))]);
    let body = Block::new(vec![Statement::expr(Expression::new(
        ExpressionKind::Try {
            try_block,
            catch_ident: "e".to_string(),
            catch_block,
        },
        Type::Null,
        Span::default(),
    ))]);
    let run = run_main(main_only(body));
    expect_value(&run);
    assert_eq!(run.output, "oops\n");
}

#[test]
fn test_uncaught_throw() {
    let throw_span = Span::new(Loc::new(2, 5, 12), Loc::new(2, 16, 23), "main.hms");
    let body = Block::new(vec![Statement::expr(
        Expression::call("throw", vec![Expression::string("bad")], Type::Null).at(throw_span.clone()),
    )]);
    let run = run_main(main_only(body));

    let FunctionInvocationResult::Exception { interrupt, .. } = run.result else {
        panic!("expected an exception result");
    };
    let Interrupt::Fatal(fatal) = interrupt else {
        panic!("expected a fatal interrupt, got {}", interrupt);
    };
    assert_eq!(fatal.kind, FatalKind::UncaughtThrow);
    assert!(fatal.message.contains("bad"));
    assert_eq!(fatal.span, throw_span);
    assert!(fatal.to_string().contains("== Stacktrace =="));
}

#[test]
fn test_index_out_of_range() {
    let body = Block::new(vec![
        Statement::let_(
            "xs",
            Expression::list(
                vec![Expression::int(1), Expression::int(2)],
                Type::Int,
            ),
        ),
        println_call(Expression::index(
            Expression::ident("xs", Type::List(Box::new(Type::Int))),
            Expression::int(5),
            Type::Int,
        )),
    ]);
    let run = run_main(main_only(body));

    let FunctionInvocationResult::Exception { interrupt, .. } = run.result else {
        panic!("expected an exception result");
    };
    let Interrupt::Fatal(fatal) = interrupt else {
        panic!("expected a fatal interrupt");
    };
    assert_eq!(fatal.kind, FatalKind::IndexOutOfBounds);
    // The faulting index expression never reaches the print sink.
    assert_eq!(run.output, "");
}

#[test]
fn test_negative_index_wraps() {
    let body = Block::new(vec![
        Statement::let_(
            "xs",
            Expression::list(
                vec![Expression::int(10), Expression::int(20), Expression::int(30)],
                Type::Int,
            ),
        ),
        println_call(Expression::index(
            Expression::ident("xs", Type::List(Box::new(Type::Int))),
            Expression::int(-1),
            Type::Int,
        )),
    ]);
    let run = run_main(main_only(body));
    expect_value(&run);
    assert_eq!(run.output, "30\n");
}

#[test]
fn test_match_expression() {
    // match 2 { 1 => "one", 2 | 3 => "few", _ => "many" }
    let matched = Expression::new(
        ExpressionKind::Match {
            control: Box::new(Expression::int(2)),
            arms: vec![
                MatchArm {
                    literals: vec![Expression::int(1)],
                    action: Expression::string("one"),
                },
                MatchArm {
                    literals: vec![Expression::int(2), Expression::int(3)],
                    action: Expression::string("few"),
                },
            ],
            default: Some(Box::new(Expression::string("many"))),
        },
        Type::String,
        Span::default(),
    );
    let body = Block::new(vec![println_call(matched)]);
    let run = run_main(main_only(body));
    expect_value(&run);
    assert_eq!(run.output, "few\n");
}

#[test]
fn test_short_circuit_skips_rhs() {
    // false && (1 / 0 == 0) must not evaluate the division.
    let rhs = Expression::infix(
        InfixOp::Eq,
        Expression::infix(InfixOp::Div, Expression::int(1), Expression::int(0)),
        Expression::int(0),
    );
    let body = Block::new(vec![
        println_call(Expression::infix(
            InfixOp::And,
            Expression::bool(false),
            rhs.clone(),
        )),
        println_call(Expression::infix(InfixOp::Or, Expression::bool(true), rhs)),
    ]);
    let run = run_main(main_only(body));
    expect_value(&run);
    assert_eq!(run.output, "false\ntrue\n");
}

#[test]
fn test_while_break_continue() {
    // let i = 0; while true { i += 1; if i == 3 { continue }; if i > 5 { break }; println(i) }
    let i = || Expression::ident("i", Type::Int);
    let body = Block::new(vec![
        Statement::let_("i", Expression::int(0)),
        Statement::While {
            condition: Expression::bool(true),
            body: Block::new(vec![
                Statement::expr(Expression::compound_assign(
                    InfixOp::Add,
                    i(),
                    Expression::int(1),
                )),
                Statement::expr(Expression::if_else(
                    Expression::infix(InfixOp::Eq, i(), Expression::int(3)),
                    Block::new(vec![Statement::Continue {
                        span: Span::default(),
                    }]),
                    None,
                )),
                Statement::expr(Expression::if_else(
                    Expression::infix(InfixOp::Gt, i(), Expression::int(5)),
                    Block::new(vec![Statement::Break {
                        span: Span::default(),
                    }]),
                    None,
                )),
                println_call(i()),
            ]),
            span: Span::default(),
        },
    ]);
    let run = run_main(main_only(body));
    expect_value(&run);
    assert_eq!(run.output, "1\n2\n4\n5\n");
}

#[test]
fn test_option_methods() {
    let some = Expression::some(Expression::int(5));
    let none = Expression::none(Type::Int);
    let body = Block::new(vec![
        println_call(method_call(some, "unwrap", vec![], Type::Int)),
        println_call(method_call(
            none,
            "unwrap_or",
            vec![Expression::int(9)],
            Type::Int,
        )),
    ]);
    let run = run_main(main_only(body));
    expect_value(&run);
    assert_eq!(run.output, "5\n9\n");
}

#[test]
fn test_none_unwrap_is_fatal() {
    let body = Block::new(vec![println_call(method_call(
        Expression::none(Type::Int),
        "unwrap",
        vec![],
        Type::Int,
    ))]);
    let run = run_main(main_only(body));
    let FunctionInvocationResult::Exception { interrupt, .. } = run.result else {
        panic!("expected an exception result");
    };
    let Interrupt::Fatal(fatal) = interrupt else {
        panic!("expected a fatal interrupt");
    };
    assert_eq!(fatal.kind, FatalKind::OptionUnwrapError);
}

#[test]
fn test_string_methods() {
    let body = Block::new(vec![
        println_call(method_call(
            Expression::string("Hello World"),
            "to_upper",
            vec![],
            Type::String,
        )),
        println_call(method_call(
            Expression::string("42"),
            "parse_int",
            vec![],
            Type::Int,
        )),
    ]);
    let run = run_main(main_only(body));
    expect_value(&run);
    assert_eq!(run.output, "HELLO WORLD\n42\n");
}

#[test]
fn test_cast_success_and_catchable_failure() {
    let ok = Expression::cast(Expression::int(1), Type::Float);
    let try_block = Block::new(vec![Statement::let_(
        "x",
        Expression::cast(Expression::string("abc"), Type::Int),
    )]);
    let catch_block = Block::new(vec![println_call(Expression::member(
        Expression::ident("e", Type::AnyObject),
        "message",
        Type::String,
    ))]);
    let body = Block::new(vec![
        println_call(ok),
        Statement::expr(Expression::new(
            ExpressionKind::Try {
                try_block,
                catch_ident: "e".to_string(),
                catch_block,
            },
            Type::Null,
            Span::default(),
        )),
    ]);
    let run = run_main(main_only(body));
    expect_value(&run);
    assert!(run.output.starts_with("1.0\n"));
    assert!(run.output.contains("cannot cast str to int"));
}

#[test]
fn test_list_mutation_and_index_assignment() {
    let xs = || Expression::ident("xs", Type::List(Box::new(Type::Int)));
    let body = Block::new(vec![
        Statement::let_(
            "xs",
            Expression::list(vec![Expression::int(1), Expression::int(2)], Type::Int),
        ),
        Statement::expr(method_call(
            xs(),
            "push",
            vec![Expression::int(3)],
            Type::Null,
        )),
        Statement::expr(Expression::assign(
            Expression::index(xs(), Expression::int(0), Type::Int),
            Expression::int(9),
        )),
        println_call(xs()),
    ]);
    let run = run_main(main_only(body));
    expect_value(&run);
    assert_eq!(run.output, "[9, 2, 3]\n");
}

#[test]
fn test_object_member_assignment() {
    let o = || {
        Expression::ident(
            "o",
            Type::Object(vec![ObjectTypeField::new("a", Type::Int)]),
        )
    };
    let body = Block::new(vec![
        Statement::let_("o", Expression::object(vec![("a", Expression::int(1))])),
        Statement::expr(Expression::assign(
            Expression::member(o(), "a", Type::Int),
            Expression::int(5),
        )),
        println_call(Expression::member(o(), "a", Type::Int)),
    ]);
    let run = run_main(main_only(body));
    expect_value(&run);
    assert_eq!(run.output, "5\n");
}

#[test]
fn test_recursion_and_invocation_result() {
    // fn fib(n: int) -> int { if n < 2 { n } else { fib(n - 1) + fib(n - 2) } }
    let n = || Expression::ident("n", Type::Int);
    let fib_body = Block::expr(
        vec![],
        Expression::if_else(
            Expression::infix(InfixOp::Lt, n(), Expression::int(2)),
            Block::expr(vec![], n()),
            Some(Block::expr(
                vec![],
                Expression::infix(
                    InfixOp::Add,
                    Expression::call(
                        "fib",
                        vec![Expression::infix(InfixOp::Sub, n(), Expression::int(1))],
                        Type::Int,
                    ),
                    Expression::call(
                        "fib",
                        vec![Expression::infix(InfixOp::Sub, n(), Expression::int(2))],
                        Type::Int,
                    ),
                ),
            )),
        ),
    );
    let modules = single_module(AnalyzedProgram {
        functions: vec![
            FunctionDefinition::new(
                "fib",
                vec![Parameter::new("n", Type::Int)],
                Type::Int,
                fib_body,
            ),
            FunctionDefinition::new("main", vec![], Type::Null, Block::new(vec![])),
        ],
        ..AnalyzedProgram::default()
    });

    let program = compile(&modules, "main");
    let fib = program.resolve_function("main", "fib").unwrap().to_string();
    let vm = Vm::new(
        program,
        Arc::new(BufferedExecutor::new()),
        Limits::default(),
        HashMap::new(),
    );
    vm.run_init().unwrap();

    let mut invocation = FunctionInvocation::new(fib);
    invocation.args = vec![Value::Int(10)];
    invocation.signature.params = vec![("n".to_string(), Type::Int)];
    invocation.signature.return_type = Type::Int;
    let result = vm.spawn_sync(invocation, None);

    let FunctionInvocationResult::Value(value) = result else {
        panic!("expected a value result");
    };
    assert!(value.is_equal(&Value::Int(55)));
}

#[test]
fn test_exception_unwinds_nested_frames() {
    // main: try { outer() } catch e { println(e.message) }; outer calls inner,
    // which throws two frames below the catch site.
    let inner = FunctionDefinition::new(
        "inner",
        vec![],
        Type::Null,
        Block::new(vec![Statement::expr(Expression::call(
            "throw",
            vec![Expression::string("deep")],
            Type::Null,
        ))]),
    );
    let outer = FunctionDefinition::new(
        "outer",
        vec![],
        Type::Null,
        Block::new(vec![Statement::expr(Expression::call(
            "inner",
            vec![],
            Type::Null,
        ))]),
    );
    let body = Block::new(vec![
        Statement::expr(Expression::new(
            ExpressionKind::Try {
                try_block: Block::new(vec![Statement::expr(Expression::call(
                    "outer",
                    vec![],
                    Type::Null,
                ))]),
                catch_ident: "e".to_string(),
                catch_block: Block::new(vec![println_call(Expression::member(
                    Expression::ident("e", Type::AnyObject),
                    "message",
                    Type::String,
                ))]),
            },
            Type::Null,
            Span::default(),
        )),
        println_call(Expression::string("after")),
    ]);
    let modules = single_module(AnalyzedProgram {
        functions: vec![
            inner,
            outer,
            FunctionDefinition::new("main", vec![], Type::Null, body),
        ],
        ..AnalyzedProgram::default()
    });
    let run = run_main(modules);
    expect_value(&run);
    assert_eq!(run.output, "deep\nafter\n");
}

#[test]
fn test_singleton_default_and_host_instance() {
    let modules = || {
        single_module(AnalyzedProgram {
            singletons: vec![SingletonDecl {
                ident: "Config".to_string(),
                ty: Type::Object(vec![ObjectTypeField::new("on", Type::Bool)]),
                span: Span::default(),
            }],
            functions: vec![FunctionDefinition::new(
                "main",
                vec![],
                Type::Null,
                Block::new(vec![println_call(Expression::member(
                    Expression::ident(
                        "Config",
                        Type::Object(vec![ObjectTypeField::new("on", Type::Bool)]),
                    ),
                    "on",
                    Type::Bool,
                ))]),
            )],
            ..AnalyzedProgram::default()
        })
    };

    // Without a host instance the compiled default stays in place.
    let run = run_main(modules());
    expect_value(&run);
    assert_eq!(run.output, "false\n");

    // A host-persisted instance replaces the default at init time.
    let executor = Arc::new(BufferedExecutor::new());
    executor.set_singleton(
        "main",
        "Config",
        Value::Object(vec![(
            "on".to_string(),
            homescript::value_ref(Value::Bool(true)),
        )]),
    );
    let run = run_main_with(modules(), executor, HashMap::new());
    expect_value(&run);
    assert_eq!(run.output, "true\n");
}

#[test]
fn test_builtin_import() {
    let executor = Arc::new(BufferedExecutor::new());
    executor.set_import("net", "magic", Value::Int(42));

    let modules = single_module(AnalyzedProgram {
        imports: vec![ImportStatement {
            module: "net".to_string(),
            items: vec![ImportItem {
                name: "magic".to_string(),
                span: Span::default(),
            }],
            span: Span::default(),
        }],
        functions: vec![FunctionDefinition::new(
            "main",
            vec![],
            Type::Null,
            Block::new(vec![println_call(Expression::ident("magic", Type::Int))]),
        )],
        ..AnalyzedProgram::default()
    });
    let run = run_main_with(modules, executor, HashMap::new());
    expect_value(&run);
    assert_eq!(run.output, "42\n");
}

#[test]
fn test_missing_import_is_fatal() {
    let modules = single_module(AnalyzedProgram {
        imports: vec![ImportStatement {
            module: "net".to_string(),
            items: vec![ImportItem {
                name: "magic".to_string(),
                span: Span::default(),
            }],
            span: Span::default(),
        }],
        functions: vec![FunctionDefinition::new(
            "main",
            vec![],
            Type::Null,
            Block::new(vec![]),
        )],
        ..AnalyzedProgram::default()
    });

    let program = compile(&modules, "main");
    let vm = Vm::new(
        program,
        Arc::new(BufferedExecutor::new()),
        Limits::default(),
        HashMap::new(),
    );
    let (_, interrupt) = vm.run_init().unwrap_err();
    let Interrupt::Fatal(fatal) = interrupt else {
        panic!("expected fatal");
    };
    assert_eq!(fatal.kind, FatalKind::ImportError);
}

#[test]
fn test_cross_module_call() {
    // util: fn double(x: int) -> int { x * 2 }
    let double = FunctionDefinition::new(
        "double",
        vec![Parameter::new("x", Type::Int)],
        Type::Int,
        Block::expr(
            vec![],
            Expression::infix(
                InfixOp::Mul,
                Expression::ident("x", Type::Int),
                Expression::int(2),
            ),
        ),
    );
    let mut modules = HashMap::new();
    modules.insert(
        "util".to_string(),
        AnalyzedProgram {
            functions: vec![double],
            ..AnalyzedProgram::default()
        },
    );
    modules.insert(
        "main".to_string(),
        AnalyzedProgram {
            imports: vec![ImportStatement {
                module: "util".to_string(),
                items: vec![ImportItem {
                    name: "double".to_string(),
                    span: Span::default(),
                }],
                span: Span::default(),
            }],
            functions: vec![FunctionDefinition::new(
                "main",
                vec![],
                Type::Null,
                Block::new(vec![println_call(Expression::call(
                    "double",
                    vec![Expression::int(21)],
                    Type::Int,
                ))]),
            )],
            ..AnalyzedProgram::default()
        },
    );

    let run = run_main(modules);
    expect_value(&run);
    assert_eq!(run.output, "42\n");
}

#[test]
fn test_exit_code() {
    let body = Block::new(vec![Statement::expr(Expression::call(
        "exit",
        vec![Expression::int(4)],
        Type::Null,
    ))]);
    let run = run_main(main_only(body));
    let FunctionInvocationResult::Exception { interrupt, .. } = run.result else {
        panic!("expected an exception result");
    };
    assert!(matches!(interrupt, Interrupt::Exit(4)));
}

#[test]
fn test_stack_overflow_on_unbounded_recursion() {
    let rec = FunctionDefinition::new(
        "rec",
        vec![],
        Type::Null,
        Block::new(vec![Statement::expr(Expression::call(
            "rec",
            vec![],
            Type::Null,
        ))]),
    );
    let modules = single_module(AnalyzedProgram {
        functions: vec![
            rec,
            FunctionDefinition::new(
                "main",
                vec![],
                Type::Null,
                Block::new(vec![Statement::expr(Expression::call(
                    "rec",
                    vec![],
                    Type::Null,
                ))]),
            ),
        ],
        ..AnalyzedProgram::default()
    });
    let run = run_main(modules);
    let FunctionInvocationResult::Exception { interrupt, .. } = run.result else {
        panic!("expected an exception result");
    };
    let Interrupt::Fatal(fatal) = interrupt else {
        panic!("expected fatal");
    };
    assert_eq!(fatal.kind, FatalKind::StackOverflow);
    // The collapsed trace folds the recursive frames into one counted entry.
    assert!(fatal.trace.iter().any(|frame| frame.count > 1));
}

#[test]
fn test_trigger_annotation_surfaces_in_output() {
    let mut on_motion = FunctionDefinition::new(
        "on_motion",
        vec![],
        Type::Null,
        Block::new(vec![]),
    );
    on_motion.annotations.push(FunctionAnnotation::Trigger {
        trigger_source: "motion_sensor".to_string(),
        args: vec![Expression::string("hallway")],
        span: Span::default(),
    });
    let modules = single_module(AnalyzedProgram {
        functions: vec![
            on_motion,
            FunctionDefinition::new("main", vec![], Type::Null, Block::new(vec![])),
        ],
        ..AnalyzedProgram::default()
    });

    let program = compile(&modules, "main");
    let callback = program
        .resolve_function("main", "on_motion")
        .unwrap()
        .to_string();
    let annotations = &program.annotations[&callback];
    let homescript::CompiledAnnotation::Trigger {
        callback_function,
        trigger_source,
        args_function,
    } = &annotations[0];
    assert_eq!(callback_function, &callback);
    assert_eq!(trigger_source, "motion_sensor");
    assert!(program.functions.contains_key(args_function));
}

#[test]
fn test_debugger_observes_instructions() {
    let body = Block::new(vec![println_call(Expression::int(1))]);
    let modules = main_only(body);
    let program = compile(&modules, "main");
    let main = program.resolve_function("main", "main").unwrap().to_string();

    let executor = Arc::new(BufferedExecutor::new());
    let vm = Vm::new(program, executor, Limits::default(), HashMap::new());
    vm.run_init().unwrap();

    let (debugger, client) = homescript::Debugger::new(Default::default(), false);
    let result = vm.spawn_sync(FunctionInvocation::new(main), Some(debugger));
    assert!(matches!(result, FunctionInvocationResult::Value(_)));

    let outputs: Vec<_> = client.outputs.iter().collect();
    assert!(!outputs.is_empty());
    assert!(outputs
        .iter()
        .any(|output| matches!(output.current_instruction, homescript::Instruction::CallVal)));
}
