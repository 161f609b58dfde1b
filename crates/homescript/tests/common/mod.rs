//! Shared helpers for the integration suites: build analyzed modules by
//! hand (standing in for the analyzer), compile them, and run `main`.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use homescript::{
    AnalyzedProgram, Block, BufferedExecutor, FunctionDefinition, FunctionInvocation,
    FunctionInvocationResult, Limits, Type, Value, Vm, compile,
};

pub struct Run {
    pub output: String,
    pub result: FunctionInvocationResult,
    pub vm: Vm,
    pub executor: Arc<BufferedExecutor>,
}

pub fn single_module(program: AnalyzedProgram) -> HashMap<String, AnalyzedProgram> {
    let mut modules = HashMap::new();
    modules.insert("main".to_string(), program);
    modules
}

pub fn main_only(body: Block) -> HashMap<String, AnalyzedProgram> {
    single_module(AnalyzedProgram {
        functions: vec![FunctionDefinition::new("main", vec![], Type::Null, body)],
        ..AnalyzedProgram::default()
    })
}

pub fn run_main(modules: HashMap<String, AnalyzedProgram>) -> Run {
    run_main_with(modules, Arc::new(BufferedExecutor::new()), HashMap::new())
}

pub fn run_main_with(
    modules: HashMap<String, AnalyzedProgram>,
    executor: Arc<BufferedExecutor>,
    scope_additions: HashMap<String, Value>,
) -> Run {
    let program = compile(&modules, "main");
    let main = program
        .resolve_function("main", "main")
        .expect("module `main` must define `main`")
        .to_string();

    let vm = Vm::new(program, executor.clone(), Limits::default(), scope_additions);
    vm.run_init().expect("program init should succeed");
    let result = vm.spawn_sync(FunctionInvocation::new(main), None);

    Run {
        output: executor.output(),
        result,
        vm,
        executor,
    }
}

pub fn expect_value(run: &Run) {
    match &run.result {
        FunctionInvocationResult::Value(_) => {}
        FunctionInvocationResult::Exception { interrupt, .. } => {
            panic!("program faulted: {}", interrupt)
        }
    }
}
