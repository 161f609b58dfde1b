//! Lowering from the analyzed AST to bytecode.
//!
//! The compiler walks each module's analyzed program exactly once per pass:
//!
//! 1. a registration pass mangles every function, global, and singleton so
//!    cross-references (including cross-module imports) resolve before any
//!    body is compiled;
//! 2. a lowering pass emits each module's `@init` function (builtin imports,
//!    singleton seeding, top-level globals) and every function body;
//! 3. label relocation strips `Label` opcodes and rewrites symbolic jump
//!    targets to absolute instruction indices;
//! 4. variable renumbering flattens mangled variable names into dense,
//!    per-frame slot indices and patches the memory-pointer bookkeeping.
//!
//! The input is trusted (the analyzer validated it); inconsistencies found
//! here are compiler bugs and panic.

use std::collections::{HashMap, HashSet};

use crate::ast::{
    AnalyzedProgram, Block, CallBase, Expression, ExpressionKind, FunctionAnnotation,
    FunctionDefinition, InfixOp, LetDecl, MemberKind, ParameterKind, PrefixOp, Statement, Type,
};
use crate::bytecode::{
    CompiledAnnotation, Function, Instruction, NameMappings, Program, Slot, Target,
};
use crate::diagnostic::Span;
use crate::value::{Value, value_ref};

/// Name of the host reducer appending an element to a list; list literals
/// lower onto it.
pub const LIST_PUSH: &str = "__internal_list_push";

/// Compile a set of analyzed modules into a [`Program`].
///
/// `entry_module` decides which `@init` becomes the program entry; it calls
/// every other module's `@init` before running its own initialization code.
pub fn compile(modules: &HashMap<String, AnalyzedProgram>, entry_module: &str) -> Program {
    assert!(
        modules.contains_key(entry_module),
        "entry module `{}` is not part of the input",
        entry_module
    );
    let mut compiler = Compiler::new(modules, entry_module);
    compiler.register_declarations();
    compiler.compile_modules();
    compiler.finish()
}

/// How an identifier resolves at a use site.
enum Resolved {
    Local(String),
    Global(String),
    Function(String),
    /// Unknown to the compiler: a scope addition published by the VM under
    /// its source name.
    ScopeAddition,
}

struct LoopContext {
    continue_label: String,
    break_label: String,
}

/// State for the function currently being lowered.
struct CurrentFunction {
    name: String,
    instructions: Vec<Instruction>,
    spans: Vec<Span>,
    /// Count of variable slots introduced in this function.
    declared: usize,
    cleanup_label: String,
    loop_stack: Vec<LoopContext>,
}

struct Compiler<'a> {
    modules: &'a HashMap<String, AnalyzedProgram>,
    entry_module: String,
    current_module: String,

    /// (module, source ident) → mangled, for functions and impl methods.
    fn_table: HashMap<(String, String), String>,
    /// (module, source ident) → mangled global name (globals + singletons
    /// + imported items).
    global_table: HashMap<(String, String), String>,
    singleton_table: HashMap<(String, String), String>,
    used_names: HashSet<String>,

    scopes: Vec<HashMap<String, String>>,
    var_counter: usize,
    label_counter: usize,

    functions: HashMap<String, (Vec<Instruction>, Vec<Span>, String)>,
    annotations: HashMap<String, Vec<CompiledAnnotation>>,
    current: Option<CurrentFunction>,
}

impl<'a> Compiler<'a> {
    fn new(modules: &'a HashMap<String, AnalyzedProgram>, entry_module: &str) -> Self {
        Self {
            modules,
            entry_module: entry_module.to_string(),
            current_module: String::new(),
            fn_table: HashMap::new(),
            global_table: HashMap::new(),
            singleton_table: HashMap::new(),
            used_names: HashSet::new(),
            scopes: Vec::new(),
            var_counter: 0,
            label_counter: 0,
            functions: HashMap::new(),
            annotations: HashMap::new(),
            current: None,
        }
    }

    // -----------------------------------------------------------------------
    // Name mangling
    // -----------------------------------------------------------------------

    /// Mangle a module-level name, suffixing a counter on collision.
    fn mangle_item(&mut self, module: &str, ident: &str) -> String {
        let base = format!("@{}_{}", module, ident);
        let mut candidate = base.clone();
        let mut counter = 0usize;
        while self.used_names.contains(&candidate) {
            counter += 1;
            candidate = format!("{}{}", base, counter);
        }
        self.used_names.insert(candidate.clone());
        candidate
    }

    /// Mangle a variable: the per-introduction counter keeps shadowed
    /// bindings in distinct slots.
    fn mangle_var(&mut self, ident: &str) -> String {
        let mangled = format!("@{}_{}{}", self.current_module, ident, self.var_counter);
        self.var_counter += 1;
        mangled
    }

    fn fresh_label(&mut self, purpose: &str) -> String {
        let label = format!("{}{}", purpose, self.label_counter);
        self.label_counter += 1;
        label
    }

    fn init_name(&self, module: &str) -> String {
        format!("@{}_@init", module)
    }

    // -----------------------------------------------------------------------
    // Pass 1: declaration registration
    // -----------------------------------------------------------------------

    fn register_declarations(&mut self) {
        let mut module_names: Vec<&String> = self.modules.keys().collect();
        module_names.sort();
        let module_names: Vec<String> = module_names.into_iter().cloned().collect();

        for module in &module_names {
            self.used_names.insert(self.init_name(module));
            let program = self.modules[module].clone();

            for function in &program.functions {
                let mangled = self.mangle_item(module, &function.name);
                self.fn_table
                    .insert((module.clone(), function.name.clone()), mangled);
            }
            for block in &program.impl_blocks {
                for method in &block.methods {
                    let source = format!("{}.{}", block.singleton_ident, method.name);
                    let mangled =
                        self.mangle_item(module, &format!("{}_{}", block.singleton_ident, method.name));
                    self.fn_table.insert((module.clone(), source), mangled);
                }
            }
            for global in &program.globals {
                let mangled = self.mangle_item(module, &global.ident);
                self.global_table
                    .insert((module.clone(), global.ident.clone()), mangled);
            }
            for singleton in &program.singletons {
                let mangled = self.mangle_item(module, &singleton.ident);
                self.global_table
                    .insert((module.clone(), singleton.ident.clone()), mangled.clone());
                self.singleton_table
                    .insert((module.clone(), singleton.ident.clone()), mangled);
            }
        }

        // Imports resolve after every module's own names exist. Homescript
        // imports alias the target module's mangled name; builtin imports are
        // published into globals under their plain item name by `@init`.
        for module in &module_names {
            let program = self.modules[module].clone();
            for import in &program.imports {
                for item in &import.items {
                    if self.modules.contains_key(&import.module) {
                        let from = (import.module.clone(), item.name.clone());
                        if let Some(mangled) = self.fn_table.get(&from).cloned() {
                            self.fn_table
                                .insert((module.clone(), item.name.clone()), mangled);
                        } else if let Some(mangled) = self.global_table.get(&from).cloned() {
                            self.global_table
                                .insert((module.clone(), item.name.clone()), mangled);
                        } else {
                            panic!(
                                "import `{}` is not exported by module `{}`",
                                item.name, import.module
                            );
                        }
                    } else {
                        self.global_table
                            .insert((module.clone(), item.name.clone()), item.name.clone());
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Pass 2: lowering
    // -----------------------------------------------------------------------

    fn compile_modules(&mut self) {
        let mut module_names: Vec<String> = self.modules.keys().cloned().collect();
        module_names.sort();

        for module in &module_names {
            self.current_module = module.clone();
            self.compile_init(module);

            let program = self.modules[module].clone();
            for function in program.functions {
                let mangled = self.fn_table[&(module.clone(), function.name.clone())].clone();
                self.compile_function(&function, &mangled);
                self.compile_annotations(&function, &mangled);
            }
            for block in program.impl_blocks {
                for method in &block.methods {
                    let source = format!("{}.{}", block.singleton_ident, method.name);
                    let mangled = self.fn_table[&(module.clone(), source)].clone();
                    self.compile_function(method, &mangled);
                }
            }
        }
    }

    /// Emit a module's `@init`: builtin imports, singleton seeding, and
    /// top-level globals. The entry module first calls every other module's
    /// `@init` so cross-module state exists before its own initializers run.
    fn compile_init(&mut self, module: &str) {
        let init_name = self.init_name(module);
        let span = Span::internal(module);
        self.begin_function(&init_name, span.clone());

        if module == self.entry_module {
            let mut others: Vec<String> = self
                .modules
                .keys()
                .filter(|name| *name != module)
                .cloned()
                .collect();
            others.sort();
            for other in others {
                self.emit(Instruction::CallImm(self.init_name(&other)), span.clone());
            }
        }

        let program = self.modules[module].clone();
        for import in program.imports {
            if self.modules.contains_key(&import.module) {
                continue;
            }
            for item in &import.items {
                self.emit(
                    Instruction::Import {
                        module: import.module.clone(),
                        item: item.name.clone(),
                    },
                    item.span.clone(),
                );
            }
        }

        for singleton in program.singletons {
            let mangled = self.singleton_table[&(module.to_string(), singleton.ident.clone())]
                .clone();
            self.emit(
                Instruction::CloningPush(Value::default_of(&singleton.ty)),
                singleton.span.clone(),
            );
            self.emit(
                Instruction::LoadSingleton {
                    name: singleton.ident.clone(),
                    module: module.to_string(),
                },
                singleton.span.clone(),
            );
            self.emit(Instruction::SetGlob(mangled), singleton.span.clone());
        }

        for global in program.globals {
            let mangled = self.global_table[&(module.to_string(), global.ident.clone())].clone();
            self.compile_expr(&global.value);
            if global.value.result_type == Type::Null {
                self.emit(Instruction::CopyPush(Value::Null), global.span.clone());
            }
            if let Some(check) = &global.check_type {
                self.emit(
                    Instruction::Cast {
                        ty: check.clone(),
                        allow_casts: false,
                    },
                    global.span.clone(),
                );
            }
            self.emit(Instruction::SetGlob(mangled), global.span.clone());
        }

        self.end_function();
    }

    fn compile_annotations(&mut self, function: &FunctionDefinition, mangled: &str) {
        for (index, annotation) in function.annotations.iter().enumerate() {
            match annotation {
                FunctionAnnotation::Trigger {
                    trigger_source,
                    args,
                    span,
                } => {
                    let args_name = self.mangle_item(
                        &self.current_module.clone(),
                        &format!("{}_trigger_args{}", function.name, index),
                    );
                    self.begin_function(&args_name, span.clone());
                    let list = Expression::new(
                        ExpressionKind::List(args.clone()),
                        Type::List(Box::new(Type::Any)),
                        span.clone(),
                    );
                    self.compile_expr(&list);
                    self.end_function();

                    self.annotations
                        .entry(mangled.to_string())
                        .or_default()
                        .push(CompiledAnnotation::Trigger {
                            callback_function: mangled.to_string(),
                            trigger_source: trigger_source.clone(),
                            args_function: args_name,
                        });
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Function framing
    // -----------------------------------------------------------------------

    fn begin_function(&mut self, name: &str, span: Span) {
        let cleanup_label = self.fresh_label("cleanup");
        self.current = Some(CurrentFunction {
            name: name.to_string(),
            instructions: Vec::new(),
            spans: Vec::new(),
            declared: 0,
            cleanup_label,
            loop_stack: Vec::new(),
        });
        self.scopes.push(HashMap::new());
        // Placeholder; patched with the true local count after renumbering.
        self.emit(Instruction::AddMemPointer(0), span);
    }

    fn end_function(&mut self) {
        let current = self.current.as_ref().expect("no function in progress");
        let cleanup = current.cleanup_label.clone();
        let span = current
            .spans
            .last()
            .cloned()
            .unwrap_or_else(|| Span::internal(&self.current_module));
        self.emit(Instruction::Label(cleanup), span.clone());
        self.emit(Instruction::AddMemPointer(0), span.clone());
        self.emit(Instruction::Return, span);

        self.scopes.pop();
        let current = self.current.take().unwrap();
        assert_eq!(current.instructions.len(), current.spans.len());
        self.functions.insert(
            current.name.clone(),
            (current.instructions, current.spans, current.cleanup_label),
        );
    }

    fn compile_function(&mut self, function: &FunctionDefinition, mangled: &str) {
        self.begin_function(mangled, function.span.clone());

        // Normal parameters pop in reverse declaration order, so the call
        // site pushes them naturally.
        for param in function
            .params
            .iter()
            .filter(|param| param.kind == ParameterKind::Normal)
            .rev()
        {
            let slot = self.declare_var(&param.name);
            self.emit(Instruction::SetVar(Slot::Name(slot)), function.span.clone());
        }
        for param in &function.params {
            if let ParameterKind::SingletonExtraction { singleton_ident } = &param.kind {
                let global = self
                    .global_table
                    .get(&(self.current_module.clone(), singleton_ident.clone()))
                    .unwrap_or_else(|| {
                        panic!("unknown singleton `{}` in extraction", singleton_ident)
                    })
                    .clone();
                self.emit(Instruction::GetGlob(global), function.span.clone());
                let slot = self.declare_var(&param.name);
                self.emit(Instruction::SetVar(Slot::Name(slot)), function.span.clone());
            }
        }

        self.compile_block_inner(&function.body);
        self.end_function();
    }

    // -----------------------------------------------------------------------
    // Emission helpers
    // -----------------------------------------------------------------------

    fn emit(&mut self, instruction: Instruction, span: Span) {
        let current = self.current.as_mut().expect("no function in progress");
        current.instructions.push(instruction);
        current.spans.push(span);
    }

    fn declare_var(&mut self, ident: &str) -> String {
        let mangled = self.mangle_var(ident);
        self.scopes
            .last_mut()
            .expect("no open scope")
            .insert(ident.to_string(), mangled.clone());
        self.current.as_mut().expect("no function in progress").declared += 1;
        mangled
    }

    fn resolve(&self, ident: &str) -> Resolved {
        for scope in self.scopes.iter().rev() {
            if let Some(mangled) = scope.get(ident) {
                return Resolved::Local(mangled.clone());
            }
        }
        let key = (self.current_module.clone(), ident.to_string());
        if let Some(mangled) = self.fn_table.get(&key) {
            return Resolved::Function(mangled.clone());
        }
        if let Some(mangled) = self.global_table.get(&key) {
            return Resolved::Global(mangled.clone());
        }
        Resolved::ScopeAddition
    }

    fn current_fn_name(&self) -> String {
        self.current.as_ref().expect("no function in progress").name.clone()
    }

    // -----------------------------------------------------------------------
    // Statements
    // -----------------------------------------------------------------------

    fn compile_statement(&mut self, statement: &Statement) {
        match statement {
            Statement::Let(decl) => self.compile_let(decl),

            Statement::Return { value, span } => {
                if let Some(value) = value {
                    self.compile_expr(value);
                }
                let cleanup = self
                    .current
                    .as_ref()
                    .expect("return outside function")
                    .cleanup_label
                    .clone();
                self.emit(Instruction::Jump(Target::Label(cleanup)), span.clone());
            }

            Statement::Break { span } => {
                let target = self
                    .current
                    .as_ref()
                    .and_then(|f| f.loop_stack.last())
                    .expect("`break` outside of a loop")
                    .break_label
                    .clone();
                self.emit(Instruction::Jump(Target::Label(target)), span.clone());
            }

            Statement::Continue { span } => {
                let target = self
                    .current
                    .as_ref()
                    .and_then(|f| f.loop_stack.last())
                    .expect("`continue` outside of a loop")
                    .continue_label
                    .clone();
                self.emit(Instruction::Jump(Target::Label(target)), span.clone());
            }

            Statement::Loop { body, span } => {
                let head = self.fresh_label("loop_head");
                let end = self.fresh_label("loop_end");
                self.push_loop(&head, &end);
                self.emit(Instruction::Label(head.clone()), span.clone());
                self.compile_block_discarding(body);
                self.emit(Instruction::Jump(Target::Label(head)), span.clone());
                self.emit(Instruction::Label(end), span.clone());
                self.pop_loop();
            }

            Statement::While {
                condition,
                body,
                span,
            } => {
                let head = self.fresh_label("while_head");
                let end = self.fresh_label("while_end");
                self.push_loop(&head, &end);
                self.emit(Instruction::Label(head.clone()), span.clone());
                self.compile_expr(condition);
                self.emit(
                    Instruction::JumpIfFalse(Target::Label(end.clone())),
                    span.clone(),
                );
                self.compile_block_discarding(body);
                self.emit(Instruction::Jump(Target::Label(head)), span.clone());
                self.emit(Instruction::Label(end), span.clone());
                self.pop_loop();
            }

            Statement::For {
                ident,
                iter,
                body,
                span,
            } => {
                self.compile_expr(iter);
                self.emit(Instruction::IntoIter, span.clone());
                self.scopes.push(HashMap::new());
                let iter_slot = self.declare_var("$iter");
                self.emit(
                    Instruction::SetVar(Slot::Name(iter_slot.clone())),
                    span.clone(),
                );
                let binding = self.declare_var(ident);

                // `continue` re-enters at the iterator advance.
                let head = self.fresh_label("for_head");
                let end = self.fresh_label("for_end");
                self.push_loop(&head, &end);
                self.emit(Instruction::Label(head.clone()), span.clone());
                self.emit(Instruction::GetVar(Slot::Name(iter_slot)), span.clone());
                self.emit(Instruction::IteratorAdvance, span.clone());
                self.emit(Instruction::SetVar(Slot::Name(binding)), span.clone());
                self.emit(
                    Instruction::JumpIfFalse(Target::Label(end.clone())),
                    span.clone(),
                );
                self.compile_block_discarding(body);
                self.emit(Instruction::Jump(Target::Label(head)), span.clone());
                self.emit(Instruction::Label(end), span.clone());
                self.pop_loop();
                self.scopes.pop();
            }

            Statement::Expression(expression) => {
                self.compile_expr(expression);
                let is_spawn = matches!(
                    &expression.kind,
                    ExpressionKind::Call { spawn: true, .. }
                );
                // Spawn leaves its null handle placeholder behind; everything
                // else only pushes when its type is non-null.
                if expression.result_type != Type::Null || is_spawn {
                    self.emit(Instruction::Drop, expression.span.clone());
                }
            }
        }
    }

    fn compile_let(&mut self, decl: &LetDecl) {
        self.compile_expr(&decl.value);
        if decl.value.result_type == Type::Null {
            self.emit(Instruction::CopyPush(Value::Null), decl.span.clone());
        }
        if let Some(check) = &decl.check_type {
            self.emit(
                Instruction::Cast {
                    ty: check.clone(),
                    allow_casts: false,
                },
                decl.span.clone(),
            );
        }
        let slot = self.declare_var(&decl.ident);
        self.emit(Instruction::SetVar(Slot::Name(slot)), decl.span.clone());
    }

    fn push_loop(&mut self, continue_label: &str, break_label: &str) {
        self.current
            .as_mut()
            .expect("no function in progress")
            .loop_stack
            .push(LoopContext {
                continue_label: continue_label.to_string(),
                break_label: break_label.to_string(),
            });
    }

    fn pop_loop(&mut self) {
        self.current
            .as_mut()
            .expect("no function in progress")
            .loop_stack
            .pop();
    }

    // -----------------------------------------------------------------------
    // Blocks
    // -----------------------------------------------------------------------

    /// Compile a block; its trailing expression (when non-null) stays on the
    /// stack as the block's value.
    fn compile_block(&mut self, block: &Block) {
        self.scopes.push(HashMap::new());
        self.compile_block_inner_borrow(block);
        self.scopes.pop();
    }

    fn compile_block_inner(&mut self, block: &Block) {
        self.compile_block_inner_borrow(block);
    }

    fn compile_block_inner_borrow(&mut self, block: &Block) {
        for statement in &block.statements {
            self.compile_statement(statement);
        }
        if let Some(expression) = &block.expression {
            self.compile_expr(expression);
        }
    }

    /// Compile a block in statement position, dropping any produced value.
    fn compile_block_discarding(&mut self, block: &Block) {
        self.compile_block(block);
        if block.result_type != Type::Null {
            self.emit(Instruction::Drop, block.span.clone());
        }
    }

    // -----------------------------------------------------------------------
    // Expressions
    // -----------------------------------------------------------------------

    fn compile_expr(&mut self, expression: &Expression) {
        let span = expression.span.clone();
        match &expression.kind {
            ExpressionKind::Int(value) => {
                self.emit(Instruction::CopyPush(Value::Int(*value)), span)
            }
            ExpressionKind::Float(value) => {
                self.emit(Instruction::CopyPush(Value::Float(*value)), span)
            }
            ExpressionKind::Bool(value) => {
                self.emit(Instruction::CopyPush(Value::Bool(*value)), span)
            }
            ExpressionKind::String(value) => self.emit(
                Instruction::CopyPush(Value::String(value.clone())),
                span,
            ),
            // Null-typed expressions leave nothing on the stack.
            ExpressionKind::Null => {}
            ExpressionKind::None => {
                self.emit(Instruction::CopyPush(Value::Option(None)), span)
            }
            ExpressionKind::Some(inner) => {
                self.compile_expr(inner);
                self.emit(Instruction::Some, span);
            }

            ExpressionKind::Ident(ident) => match self.resolve(ident) {
                Resolved::Local(slot) => {
                    self.emit(Instruction::GetVar(Slot::Name(slot)), span)
                }
                Resolved::Global(name) => self.emit(Instruction::GetGlob(name), span),
                Resolved::Function(name) => {
                    self.emit(Instruction::CopyPush(Value::VmFunction(name)), span)
                }
                Resolved::ScopeAddition => {
                    self.emit(Instruction::GetGlob(ident.clone()), span)
                }
            },

            ExpressionKind::Range {
                start,
                end,
                inclusive,
            } => {
                self.compile_expr(start);
                self.compile_expr(end);
                self.emit(
                    Instruction::IntoRange {
                        end_inclusive: *inclusive,
                    },
                    span,
                );
            }

            ExpressionKind::List(elements) => {
                self.emit(
                    Instruction::CloningPush(Value::List(Vec::new())),
                    span.clone(),
                );
                for element in elements {
                    self.compile_expr(element);
                    self.emit(Instruction::CopyPush(Value::Int(2)), span.clone());
                    self.emit(Instruction::HostCall(LIST_PUSH.to_string()), span.clone());
                }
            }

            ExpressionKind::Object(fields) => {
                let any_object = expression.result_type == Type::AnyObject;
                let prototype: Vec<(String, crate::value::ValueRef)> = fields
                    .iter()
                    .map(|(name, _)| (name.clone(), value_ref(Value::Null)))
                    .collect();
                let prototype = if any_object {
                    Value::AnyObject(prototype)
                } else {
                    Value::Object(prototype)
                };
                self.emit(Instruction::CloningPush(prototype), span.clone());
                for (name, value) in fields {
                    self.emit(Instruction::Duplicate, span.clone());
                    if any_object {
                        self.emit(Instruction::MemberAnyObj(name.clone()), span.clone());
                        self.emit(Instruction::MemberUnwrap, span.clone());
                    } else {
                        self.emit(Instruction::Member(name.clone()), span.clone());
                    }
                    self.compile_expr(value);
                    self.emit(Instruction::Assign, span.clone());
                }
            }

            ExpressionKind::Prefix { op, rhs } => {
                self.compile_expr(rhs);
                let instruction = match op {
                    PrefixOp::Neg => Instruction::Neg,
                    PrefixOp::Not => Instruction::Not,
                    PrefixOp::BitNot => Instruction::BitNot,
                };
                self.emit(instruction, span);
            }

            ExpressionKind::Infix { op, lhs, rhs } => match op {
                InfixOp::And | InfixOp::Or => self.compile_logical(*op, lhs, rhs, span),
                _ => {
                    self.compile_expr(lhs);
                    self.compile_expr(rhs);
                    self.emit_infix(*op, span);
                }
            },

            ExpressionKind::Assign { lhs, op, rhs } => self.compile_assign(lhs, *op, rhs, span),

            ExpressionKind::Member { base, field, kind } => {
                self.compile_expr(base);
                match kind {
                    MemberKind::Dot => self.emit(Instruction::Member(field.clone()), span),
                    MemberKind::Arrow => {
                        self.emit(Instruction::MemberAnyObj(field.clone()), span)
                    }
                    MemberKind::TildeArrow => {
                        self.emit(Instruction::MemberAnyObj(field.clone()), span.clone());
                        self.emit(Instruction::MemberUnwrap, span);
                    }
                }
            }

            ExpressionKind::Index { base, index } => {
                self.compile_expr(base);
                self.compile_expr(index);
                self.emit(Instruction::Index, span);
            }

            ExpressionKind::Call { base, args, spawn } => {
                self.compile_call(base, args, *spawn, span)
            }

            ExpressionKind::Cast { base, as_type } => {
                self.compile_expr(base);
                if base.result_type == Type::Null {
                    self.emit(Instruction::CopyPush(Value::Null), span.clone());
                }
                self.emit(
                    Instruction::Cast {
                        ty: as_type.clone(),
                        allow_casts: true,
                    },
                    span,
                );
            }

            ExpressionKind::Block(block) => self.compile_block(block),

            ExpressionKind::If {
                condition,
                then_block,
                else_block,
            } => {
                self.compile_expr(condition);
                match else_block {
                    Some(else_block) => {
                        let else_label = self.fresh_label("if_else");
                        let end_label = self.fresh_label("if_end");
                        self.emit(
                            Instruction::JumpIfFalse(Target::Label(else_label.clone())),
                            span.clone(),
                        );
                        self.compile_block(then_block);
                        self.emit(
                            Instruction::Jump(Target::Label(end_label.clone())),
                            span.clone(),
                        );
                        self.emit(Instruction::Label(else_label), span.clone());
                        self.compile_block(else_block);
                        self.emit(Instruction::Label(end_label), span);
                    }
                    None => {
                        let end_label = self.fresh_label("if_end");
                        self.emit(
                            Instruction::JumpIfFalse(Target::Label(end_label.clone())),
                            span.clone(),
                        );
                        self.compile_block(then_block);
                        self.emit(Instruction::Label(end_label), span);
                    }
                }
            }

            ExpressionKind::Match {
                control,
                arms,
                default,
            } => self.compile_match(control, arms, default.as_deref(), span),

            ExpressionKind::Try {
                try_block,
                catch_ident,
                catch_block,
            } => self.compile_try(try_block, catch_ident, catch_block, span),
        }
    }

    fn emit_infix(&mut self, op: InfixOp, span: Span) {
        let instruction = match op {
            InfixOp::Add => Instruction::Add,
            InfixOp::Sub => Instruction::Sub,
            InfixOp::Mul => Instruction::Mul,
            InfixOp::Div => Instruction::Div,
            InfixOp::Rem => Instruction::Rem,
            InfixOp::Pow => Instruction::Pow,
            InfixOp::Shl => Instruction::Shl,
            InfixOp::Shr => Instruction::Shr,
            InfixOp::BitOr => Instruction::BitOr,
            InfixOp::BitAnd => Instruction::BitAnd,
            InfixOp::BitXor => Instruction::BitXor,
            InfixOp::Eq => Instruction::Eq,
            InfixOp::NotEq => {
                self.emit(Instruction::Eq, span.clone());
                Instruction::Not
            }
            InfixOp::Lt => Instruction::Lt,
            InfixOp::Le => Instruction::Le,
            InfixOp::Gt => Instruction::Gt,
            InfixOp::Ge => Instruction::Ge,
            InfixOp::And | InfixOp::Or => unreachable!("logical ops lower via labels"),
        };
        self.emit(instruction, span);
    }

    /// `&&` / `||` lower into jumps that push the short-circuit constant.
    fn compile_logical(&mut self, op: InfixOp, lhs: &Expression, rhs: &Expression, span: Span) {
        let short_label = self.fresh_label("logic_short");
        let end_label = self.fresh_label("logic_end");
        self.compile_expr(lhs);
        if op == InfixOp::Or {
            self.emit(Instruction::Not, span.clone());
        }
        self.emit(
            Instruction::JumpIfFalse(Target::Label(short_label.clone())),
            span.clone(),
        );
        self.compile_expr(rhs);
        self.emit(
            Instruction::Jump(Target::Label(end_label.clone())),
            span.clone(),
        );
        self.emit(Instruction::Label(short_label), span.clone());
        let short_value = op == InfixOp::Or;
        self.emit(Instruction::CopyPush(Value::Bool(short_value)), span.clone());
        self.emit(Instruction::Label(end_label), span);
    }

    fn compile_assign(
        &mut self,
        lhs: &Expression,
        op: Option<InfixOp>,
        rhs: &Expression,
        span: Span,
    ) {
        if let ExpressionKind::Ident(ident) = &lhs.kind {
            match self.resolve(ident) {
                Resolved::Local(slot) => {
                    if let Some(op) = op {
                        self.emit(
                            Instruction::GetVar(Slot::Name(slot.clone())),
                            span.clone(),
                        );
                        self.compile_expr(rhs);
                        self.emit_infix(op, span.clone());
                    } else {
                        self.compile_expr(rhs);
                        if rhs.result_type == Type::Null {
                            self.emit(Instruction::CopyPush(Value::Null), span.clone());
                        }
                    }
                    self.emit(Instruction::SetVar(Slot::Name(slot)), span);
                }
                Resolved::Global(name) => {
                    if let Some(op) = op {
                        self.emit(Instruction::GetGlob(name.clone()), span.clone());
                        self.compile_expr(rhs);
                        self.emit_infix(op, span.clone());
                    } else {
                        self.compile_expr(rhs);
                        if rhs.result_type == Type::Null {
                            self.emit(Instruction::CopyPush(Value::Null), span.clone());
                        }
                    }
                    self.emit(Instruction::SetGlob(name), span);
                }
                _ => panic!("cannot assign to `{}`", ident),
            }
            return;
        }

        // Member / index places: compile the place handle, then write
        // through it.
        self.compile_place(lhs);
        if let Some(op) = op {
            self.emit(Instruction::Duplicate, span.clone());
            self.compile_expr(rhs);
            self.emit_infix(op, span.clone());
        } else {
            self.compile_expr(rhs);
            if rhs.result_type == Type::Null {
                self.emit(Instruction::CopyPush(Value::Null), span.clone());
            }
        }
        self.emit(Instruction::Assign, span);
    }

    /// Compile an lvalue so that its storage handle ends up on the stack.
    fn compile_place(&mut self, place: &Expression) {
        match &place.kind {
            ExpressionKind::Member { base, field, kind } => {
                self.compile_expr(base);
                match kind {
                    MemberKind::Dot => {
                        self.emit(Instruction::Member(field.clone()), place.span.clone())
                    }
                    MemberKind::Arrow | MemberKind::TildeArrow => {
                        self.emit(
                            Instruction::MemberAnyObj(field.clone()),
                            place.span.clone(),
                        );
                        self.emit(Instruction::MemberUnwrap, place.span.clone());
                    }
                }
            }
            ExpressionKind::Index { base, index } => {
                self.compile_expr(base);
                self.compile_expr(index);
                self.emit(Instruction::Index, place.span.clone());
            }
            other => panic!("expression is not assignable: {:?}", std::mem::discriminant(other)),
        }
    }

    fn compile_call(&mut self, base: &CallBase, args: &[Expression], spawn: bool, span: Span) {
        if let CallBase::Ident(ident) = base {
            // `throw` is an opcode, not a callee.
            if ident == "throw" {
                let arg = args.first().expect("`throw` requires an argument");
                self.compile_expr(arg);
                self.emit(Instruction::Throw, span);
                return;
            }

            if let Resolved::Function(mangled) = self.resolve(ident) {
                for arg in args {
                    self.compile_expr(arg);
                }
                if spawn {
                    self.emit(
                        Instruction::CopyPush(Value::Int(args.len() as i64)),
                        span.clone(),
                    );
                    self.emit(Instruction::Spawn(mangled), span);
                } else {
                    self.emit(Instruction::CallImm(mangled), span);
                }
                return;
            }
        }
        assert!(!spawn, "spawn target must be a named function");

        // Value call: args first, then the callee, then the arg count.
        for arg in args {
            self.compile_expr(arg);
        }
        match base {
            CallBase::Ident(ident) => match self.resolve(ident) {
                Resolved::Local(slot) => {
                    self.emit(Instruction::GetVar(Slot::Name(slot)), span.clone())
                }
                Resolved::Global(name) => self.emit(Instruction::GetGlob(name), span.clone()),
                Resolved::ScopeAddition => {
                    self.emit(Instruction::GetGlob(ident.clone()), span.clone())
                }
                Resolved::Function(_) => unreachable!("handled above"),
            },
            CallBase::Expr(expr) => self.compile_expr(expr),
        }
        self.emit(
            Instruction::CopyPush(Value::Int(args.len() as i64)),
            span.clone(),
        );
        self.emit(Instruction::CallVal, span);
    }

    fn compile_match(
        &mut self,
        control: &Expression,
        arms: &[crate::ast::MatchArm],
        default: Option<&Expression>,
        span: Span,
    ) {
        self.compile_expr(control);

        let end_label = self.fresh_label("match_end");
        let no_match_label = self.fresh_label("match_default");
        let case_labels: Vec<String> = arms
            .iter()
            .map(|_| self.fresh_label("match_case"))
            .collect();

        for (arm, case_label) in arms.iter().zip(&case_labels) {
            for literal in &arm.literals {
                self.compile_expr(literal);
                self.emit(Instruction::EqPopOnce, span.clone());
                self.emit(Instruction::Not, span.clone());
                self.emit(
                    Instruction::JumpIfFalse(Target::Label(case_label.clone())),
                    span.clone(),
                );
            }
        }
        self.emit(
            Instruction::Jump(Target::Label(no_match_label.clone())),
            span.clone(),
        );

        for (arm, case_label) in arms.iter().zip(&case_labels) {
            self.emit(Instruction::Label(case_label.clone()), span.clone());
            // Discard the preserved control value.
            self.emit(Instruction::Drop, span.clone());
            self.compile_expr(&arm.action);
            self.emit(
                Instruction::Jump(Target::Label(end_label.clone())),
                span.clone(),
            );
        }

        self.emit(Instruction::Label(no_match_label), span.clone());
        self.emit(Instruction::Drop, span.clone());
        if let Some(default) = default {
            self.compile_expr(default);
        }
        self.emit(Instruction::Label(end_label), span);
    }

    fn compile_try(
        &mut self,
        try_block: &Block,
        catch_ident: &str,
        catch_block: &Block,
        span: Span,
    ) {
        let catch_label = self.fresh_label("catch");
        let after_label = self.fresh_label("try_after");

        self.emit(
            Instruction::SetTryLabel {
                function: self.current_fn_name(),
                target: Target::Label(catch_label.clone()),
            },
            span.clone(),
        );
        self.compile_block(try_block);
        self.emit(Instruction::PopTryLabel, span.clone());
        self.emit(
            Instruction::Jump(Target::Label(after_label.clone())),
            span.clone(),
        );

        // The core pops the catch frame while unwinding and pushes the error
        // object before resuming here.
        self.emit(Instruction::Label(catch_label), span.clone());
        self.scopes.push(HashMap::new());
        let binding = self.declare_var(catch_ident);
        self.emit(Instruction::SetVar(Slot::Name(binding)), span.clone());
        self.compile_block_inner_borrow(catch_block);
        self.scopes.pop();
        self.emit(Instruction::Label(after_label), span);
    }

    // -----------------------------------------------------------------------
    // Pass 3 + 4: relocation and renumbering
    // -----------------------------------------------------------------------

    fn finish(mut self) -> Program {
        let mut functions = HashMap::new();
        let names: Vec<String> = self.functions.keys().cloned().collect();
        for name in names {
            let (instructions, spans, cleanup_label) = self.functions.remove(&name).unwrap();
            let function = relocate_and_renumber(&name, instructions, spans, &cleanup_label);
            functions.insert(name, function);
        }

        let mut mappings = NameMappings::default();
        for ((module, ident), mangled) in self.fn_table {
            mappings.functions.insert((module, ident), mangled);
        }
        for ((module, ident), mangled) in self.global_table {
            mappings.globals.insert((module, ident), mangled);
        }
        for ((module, ident), mangled) in self.singleton_table {
            mappings.singletons.insert((module, ident), mangled);
        }

        Program {
            functions,
            entry_function: format!("@{}_@init", self.entry_module),
            mappings,
            annotations: self.annotations,
        }
    }
}

/// Strip labels, resolve jump targets, flatten variable names to slots, and
/// patch the frame's memory-pointer bookkeeping.
fn relocate_and_renumber(
    name: &str,
    instructions: Vec<Instruction>,
    spans: Vec<Span>,
    cleanup_label: &str,
) -> Function {
    // Pass 1: record label positions, drop the label pseudo-instructions.
    let mut labels: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<Instruction> = Vec::with_capacity(instructions.len());
    let mut out_spans: Vec<Span> = Vec::with_capacity(spans.len());
    for (instruction, span) in instructions.into_iter().zip(spans) {
        match instruction {
            Instruction::Label(label) => {
                let previous = labels.insert(label.clone(), out.len());
                assert!(previous.is_none(), "duplicate label `{}`", label);
            }
            other => {
                out.push(other);
                out_spans.push(span);
            }
        }
    }

    let resolve = |target: Target| -> Target {
        match target {
            Target::Label(label) => Target::Ip(
                *labels
                    .get(&label)
                    .unwrap_or_else(|| panic!("unresolved label `{}` in `{}`", label, name)),
            ),
            resolved @ Target::Ip(_) => resolved,
        }
    };

    // Pass 2: rewrite jumps and flatten variables. Slot numbering starts at
    // 1 per function so `memory_pointer - slot` stays inside the frame.
    let mut slots: HashMap<String, i64> = HashMap::new();
    let mut next_slot: i64 = 1;
    for instruction in &mut out {
        match std::mem::replace(instruction, Instruction::Nop) {
            Instruction::Jump(target) => *instruction = Instruction::Jump(resolve(target)),
            Instruction::JumpIfFalse(target) => {
                *instruction = Instruction::JumpIfFalse(resolve(target))
            }
            Instruction::SetTryLabel { function, target } => {
                *instruction = Instruction::SetTryLabel {
                    function,
                    target: resolve(target),
                }
            }
            Instruction::GetVar(slot) => {
                *instruction = Instruction::GetVar(Slot::Index(slot_index(
                    slot, &mut slots, &mut next_slot,
                )))
            }
            Instruction::SetVar(slot) => {
                *instruction = Instruction::SetVar(Slot::Index(slot_index(
                    slot, &mut slots, &mut next_slot,
                )))
            }
            other => *instruction = other,
        }
    }

    let locals = slots.len();
    let cleanup_ip = *labels
        .get(cleanup_label)
        .unwrap_or_else(|| panic!("missing cleanup label in `{}`", name));

    // Patch the prologue/epilogue memory-pointer adjustments.
    out[0] = Instruction::AddMemPointer(locals as i64);
    out[cleanup_ip] = Instruction::AddMemPointer(-(locals as i64));

    Function {
        name: name.to_string(),
        instructions: out,
        spans: out_spans,
        locals,
        cleanup_ip,
    }
}

fn slot_index(slot: Slot, slots: &mut HashMap<String, i64>, next: &mut i64) -> i64 {
    match slot {
        Slot::Index(index) => index,
        Slot::Name(name) => *slots.entry(name).or_insert_with(|| {
            let slot = *next;
            *next += 1;
            slot
        }),
    }
}
