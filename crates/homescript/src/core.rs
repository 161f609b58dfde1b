//! One execution unit of the VM.
//!
//! A core owns its operand stack, frame memory, call stack, and catch stack;
//! nothing here is shared with other cores except the program, the globals
//! table, and the cancellation token (all owned by the parent VM).
//!
//! Execution proceeds in *virtual cycles* of [`INSTRUCTIONS_PER_CYCLE`]
//! instructions; at every cycle boundary the core checks cancellation and the
//! configured stack/call-depth limits. Catchable exceptions consult the catch
//! stack; everything else terminates the core through its signal handle.

use std::sync::Arc;

use tracing::trace;

use crate::bytecode::{Function, Instruction};
use crate::cancel::CancelToken;
use crate::cast::deep_cast;
use crate::diagnostic::Span;
use crate::error::{
    Exception, ExceptionOrigin, FatalError, FatalKind, Interrupt, RuntimeError, TraceFrame,
};
use crate::executor::HostCtx;
use crate::methods;
use crate::operators::{self, BinaryOp, CompareOp};
use crate::value::{Value, ValueRef, value_ref};
use crate::vm::VmInner;

/// Instructions executed between two cancellation/limit checks.
pub const INSTRUCTIONS_PER_CYCLE: usize = 50;

/// An entry in the call stack: the active function and its instruction
/// pointer.
#[derive(Debug, Clone, PartialEq)]
pub struct CallFrame {
    pub function: String,
    pub ip: usize,
}

/// A catch frame records where to resume on a caught exception, plus the
/// state needed to unwind intervening frames.
#[derive(Debug, Clone)]
struct CatchFrame {
    frame: CallFrame,
    mem_ptr: i64,
    stack_depth: usize,
    call_depth: usize,
}

/// The final report a core sends through its signal handle.
#[derive(Debug, Clone)]
pub struct CoreResult {
    /// `None` on clean termination.
    pub interrupt: Option<Interrupt>,
    /// Top of the operand stack at clean termination, if any.
    pub value: Option<ValueRef>,
}

enum StepOutcome {
    Continue,
    Finished,
}

pub struct Core {
    vm: Arc<VmInner>,
    pub num: usize,
    stack: Vec<ValueRef>,
    memory: Vec<ValueRef>,
    mem_ptr: i64,
    call_stack: Vec<CallFrame>,
    catch_stack: Vec<CatchFrame>,
    debugger: Option<crate::debugger::Debugger>,
}

impl Core {
    pub fn new(vm: Arc<VmInner>, num: usize, debugger: Option<crate::debugger::Debugger>) -> Self {
        Self {
            vm,
            num,
            stack: Vec::new(),
            memory: Vec::new(),
            mem_ptr: 0,
            call_stack: Vec::new(),
            catch_stack: Vec::new(),
            debugger,
        }
    }

    /// Pre-push invocation arguments, in argument order.
    pub fn push_args(&mut self, args: Vec<ValueRef>) {
        self.stack.extend(args);
    }

    /// Execute `function` to completion.
    pub fn run(&mut self, function: &str) -> CoreResult {
        trace!(core = self.num, function, "core starting");
        self.call_stack.push(CallFrame {
            function: function.to_string(),
            ip: 0,
        });

        loop {
            for _ in 0..INSTRUCTIONS_PER_CYCLE {
                match self.step() {
                    Ok(StepOutcome::Continue) => {}
                    Ok(StepOutcome::Finished) => {
                        return CoreResult {
                            interrupt: None,
                            value: self.stack.pop(),
                        };
                    }
                    Err(interrupt) => match self.handle_interrupt(interrupt) {
                        Ok(()) => {}
                        Err(interrupt) => {
                            return CoreResult {
                                interrupt: Some(interrupt),
                                value: None,
                            };
                        }
                    },
                }
            }
            if let Err(interrupt) = self.check_cycle() {
                return CoreResult {
                    interrupt: Some(interrupt),
                    value: None,
                };
            }
        }
    }

    // -----------------------------------------------------------------------
    // Cycle boundary checks
    // -----------------------------------------------------------------------

    fn check_cycle(&self) -> Result<(), Interrupt> {
        if self.vm.cancel.is_cancelled() {
            let reason = self
                .vm
                .cancel
                .cause()
                .unwrap_or_else(|| "cancelled".to_string());
            return Err(Interrupt::Termination {
                reason,
                span: self.current_span(),
            });
        }
        let limits = &self.vm.limits;
        if self.stack.len() > limits.max_op_stack_depth {
            return Err(self.fatal_traced(
                FatalKind::StackOverflow,
                format!(
                    "maximum operand stack depth of {} exceeded",
                    limits.max_op_stack_depth
                ),
            ));
        }
        if self.call_stack.len() > limits.max_call_stack_depth {
            return Err(self.fatal_traced(
                FatalKind::StackOverflow,
                format!(
                    "maximum call stack depth of {} exceeded",
                    limits.max_call_stack_depth
                ),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    fn function(&self, name: &str) -> &Function {
        self.vm
            .program
            .functions
            .get(name)
            .unwrap_or_else(|| panic!("call to unknown function `{}`", name))
    }

    fn current_span(&self) -> Span {
        match self.call_stack.last() {
            Some(frame) => self
                .function(&frame.function)
                .span_at(frame.ip.saturating_sub(1)),
            None => Span::default(),
        }
    }

    fn step(&mut self) -> Result<StepOutcome, Interrupt> {
        let Some(frame) = self.call_stack.last() else {
            return Ok(StepOutcome::Finished);
        };
        let function = self.function(&frame.function);

        // Every compiled function ends in `Return`; running off the end only
        // happens for hand-built programs, and means the frame is done.
        if frame.ip >= function.instructions.len() {
            self.call_stack.pop();
            return Ok(if self.call_stack.is_empty() {
                StepOutcome::Finished
            } else {
                StepOutcome::Continue
            });
        }

        let instruction = function.instructions[frame.ip].clone();
        let span = function.spans[frame.ip].clone();

        if let Some(debugger) = &self.debugger {
            debugger.on_instruction(frame, &instruction, &span);
        }

        // The pointer advances first; control transfers overwrite it.
        self.call_stack.last_mut().unwrap().ip += 1;

        self.dispatch(instruction, &span)
    }

    fn dispatch(&mut self, instruction: Instruction, span: &Span) -> Result<StepOutcome, Interrupt> {
        match instruction {
            Instruction::Nop => {}

            // --- stack ---
            Instruction::CopyPush(value) => self.stack.push(value_ref(value)),
            Instruction::CloningPush(value) => self.stack.push(value_ref(value.deep_clone())),
            Instruction::Clone => {
                let top = self.pop(span)?;
                let cloned = top.read().deep_clone();
                self.stack.push(value_ref(cloned));
            }
            Instruction::Drop => {
                self.pop(span)?;
            }
            Instruction::Duplicate => {
                let top = self
                    .stack
                    .last()
                    .cloned()
                    .ok_or_else(|| self.underflow(span))?;
                self.stack.push(top);
            }

            // --- calls ---
            Instruction::Spawn(function) => {
                let argc = self.pop_int(span)?;
                let mut args = Vec::with_capacity(argc as usize);
                for _ in 0..argc {
                    args.push(self.pop(span)?);
                }
                args.reverse();
                crate::vm::spawn_core(self.vm.clone(), function, args, None);
                self.stack.push(value_ref(Value::Null));
            }
            Instruction::CallImm(function) => {
                self.call_stack.push(CallFrame { function, ip: 0 });
            }
            Instruction::CallVal => {
                let argc = self.pop_int(span)?;
                let callee = self.pop(span)?;
                let callee = callee.read().clone();
                match callee {
                    Value::VmFunction(function) => {
                        self.call_stack.push(CallFrame { function, ip: 0 });
                    }
                    Value::BuiltinFunction(builtin) => {
                        let mut args = Vec::with_capacity(argc as usize);
                        for _ in 0..argc {
                            args.push(self.pop(span)?);
                        }
                        args.reverse();
                        let ctx = self.host_ctx(span);
                        if let Some(result) = (builtin.0)(&ctx, args)? {
                            self.stack.push(value_ref(result));
                        }
                    }
                    other => {
                        return Err(self.fatal_traced(
                            FatalKind::ValueError,
                            format!("value of type {} is not callable", other.kind()),
                        ));
                    }
                }
            }
            Instruction::Return => {
                self.call_stack.pop();
                if self.call_stack.is_empty() {
                    return Ok(StepOutcome::Finished);
                }
            }
            Instruction::LoadSingleton { name, module } => {
                match self.vm.executor.load_singleton(&name, &module) {
                    Ok(Some(instance)) => {
                        self.pop(span)?;
                        self.stack.push(value_ref(instance));
                    }
                    Ok(None) => {}
                    Err(err) => {
                        return Err(self.fatal_traced(FatalKind::HostError, err.0));
                    }
                }
            }
            Instruction::HostCall(name) => {
                let argc = self.pop_int(span)?;
                let mut args = Vec::with_capacity(argc as usize);
                for _ in 0..argc {
                    args.push(self.pop(span)?);
                }
                let Some(reducer) = self.vm.host_calls.get(&name).cloned() else {
                    return Err(self.fatal_traced(
                        FatalKind::HostError,
                        format!("unknown host call `{}`", name),
                    ));
                };
                let ctx = self.host_ctx(span);
                if let Some(result) = (reducer)(&ctx, args)? {
                    self.stack.push(value_ref(result));
                }
            }

            // --- control flow ---
            Instruction::Jump(target) => {
                self.call_stack.last_mut().unwrap().ip = target.ip();
            }
            Instruction::JumpIfFalse(target) => {
                let condition = self.pop_bool(span)?;
                if !condition {
                    self.call_stack.last_mut().unwrap().ip = target.ip();
                }
            }

            // --- variables ---
            Instruction::GetVar(slot) => {
                let address = self.slot_address(slot.index());
                let handle = self.memory[address].clone();
                self.stack.push(handle);
            }
            Instruction::SetVar(slot) => {
                let handle = self.pop(span)?;
                let address = self.slot_address(slot.index());
                self.memory[address] = handle;
            }
            Instruction::GetGlob(name) => match self.vm.globals.get(&name) {
                Some(handle) => self.stack.push(handle),
                None => {
                    return Err(self.fatal_traced(
                        FatalKind::ValueError,
                        format!("global `{}` is not defined", name),
                    ));
                }
            },
            Instruction::SetGlob(name) => {
                let handle = self.pop(span)?;
                self.vm.globals.set(name, handle);
            }
            Instruction::AddMemPointer(amount) => {
                self.mem_ptr += amount;
                assert!(self.mem_ptr >= 0, "memory pointer underflow");
                if self.mem_ptr as usize > self.vm.limits.max_memory_size {
                    return Err(self.fatal_traced(
                        FatalKind::OutOfMemory,
                        format!(
                            "maximum memory size of {} slots exceeded",
                            self.vm.limits.max_memory_size
                        ),
                    ));
                }
                if amount > 0 {
                    while self.memory.len() < self.mem_ptr as usize {
                        self.memory.push(value_ref(Value::Null));
                    }
                } else {
                    self.memory.truncate(self.mem_ptr as usize);
                }
            }
            Instruction::Assign => {
                let src = self.pop(span)?;
                let dest = self.pop(span)?;
                let value = src.read().clone();
                *dest.write() = value;
            }

            // --- values ---
            Instruction::Cast { ty, allow_casts } => {
                let handle = self.pop(span)?;
                let input = handle.read().clone();
                match deep_cast(&input, &ty, allow_casts) {
                    Ok(cast) => self.stack.push(value_ref(cast)),
                    Err(err) => {
                        return Err(Interrupt::Exception(Exception {
                            message: err.to_string(),
                            span: span.clone(),
                            origin: ExceptionOrigin::Cast,
                        }));
                    }
                }
            }
            Instruction::Neg => self.unary(span, operators::negate)?,
            Instruction::Not => self.unary(span, operators::logical_not)?,
            Instruction::BitNot => self.unary(span, operators::bit_not)?,
            Instruction::Some => {
                let inner = self.pop(span)?;
                self.stack.push(value_ref(Value::Option(Some(inner))));
            }
            Instruction::Add => self.binary(span, BinaryOp::Add)?,
            Instruction::Sub => self.binary(span, BinaryOp::Sub)?,
            Instruction::Mul => self.binary(span, BinaryOp::Mul)?,
            Instruction::Div => self.binary(span, BinaryOp::Div)?,
            Instruction::Rem => self.binary(span, BinaryOp::Rem)?,
            Instruction::Pow => self.binary(span, BinaryOp::Pow)?,
            Instruction::Shl => self.binary(span, BinaryOp::Shl)?,
            Instruction::Shr => self.binary(span, BinaryOp::Shr)?,
            Instruction::BitOr => self.binary(span, BinaryOp::BitOr)?,
            Instruction::BitAnd => self.binary(span, BinaryOp::BitAnd)?,
            Instruction::BitXor => self.binary(span, BinaryOp::BitXor)?,
            Instruction::Eq => {
                let rhs = self.pop(span)?;
                let lhs = self.pop(span)?;
                let equal = lhs.read().is_equal(&rhs.read());
                self.stack.push(value_ref(Value::Bool(equal)));
            }
            Instruction::EqPopOnce => {
                let rhs = self.pop(span)?;
                let lhs = self
                    .stack
                    .last()
                    .cloned()
                    .ok_or_else(|| self.underflow(span))?;
                let equal = lhs.read().is_equal(&rhs.read());
                self.stack.push(value_ref(Value::Bool(equal)));
            }
            Instruction::Lt => self.compare(span, CompareOp::Lt)?,
            Instruction::Le => self.compare(span, CompareOp::Le)?,
            Instruction::Gt => self.compare(span, CompareOp::Gt)?,
            Instruction::Ge => self.compare(span, CompareOp::Ge)?,

            Instruction::Index => {
                let index = self.pop(span)?;
                let base = self.pop(span)?;
                let result = self.index_value(&base, &index)?;
                self.stack.push(result);
            }
            Instruction::Member(field) => {
                let base = self.pop(span)?;
                match methods::member(&base, &field) {
                    Ok(handle) => self.stack.push(handle),
                    Err(err) => return Err(self.fatal_from(err)),
                }
            }
            Instruction::MemberAnyObj(field) => {
                let base = self.pop(span)?;
                match methods::member_anyobj(&base, &field) {
                    Ok(option) => self.stack.push(value_ref(option)),
                    Err(err) => return Err(self.fatal_from(err)),
                }
            }
            Instruction::MemberUnwrap => {
                let handle = self.pop(span)?;
                let value = handle.read().clone();
                match value {
                    Value::Option(Some(inner)) => self.stack.push(inner),
                    Value::Option(None) => {
                        return Err(self.fatal_traced(
                            FatalKind::OptionUnwrapError,
                            "attempted to unwrap a none value",
                        ));
                    }
                    other => {
                        return Err(self.fatal_traced(
                            FatalKind::ValueError,
                            format!("cannot unwrap value of type {}", other.kind()),
                        ));
                    }
                }
            }
            Instruction::Throw => {
                let value = self.pop(span)?;
                let message = value.read().display();
                return Err(Interrupt::Exception(Exception::throw(message, span.clone())));
            }
            Instruction::SetTryLabel { function, target } => {
                self.catch_stack.push(CatchFrame {
                    frame: CallFrame {
                        function,
                        ip: target.ip(),
                    },
                    mem_ptr: self.mem_ptr,
                    stack_depth: self.stack.len(),
                    call_depth: self.call_stack.len(),
                });
            }
            Instruction::PopTryLabel => {
                self.catch_stack.pop();
            }

            Instruction::IntoRange { end_inclusive } => {
                let end = self.pop_int(span)?;
                let start = self.pop_int(span)?;
                self.stack.push(value_ref(Value::Range {
                    start,
                    end,
                    end_inclusive,
                }));
            }
            Instruction::IntoIter => {
                let iterable = self.pop(span)?;
                let iterator = iterable
                    .read()
                    .make_iterator()
                    .map_err(|err| self.fatal_from(err))?;
                self.stack.push(value_ref(Value::Iterator(iterator)));
            }
            Instruction::IteratorAdvance => {
                let handle = self.pop(span)?;
                let iterator = match &*handle.read() {
                    Value::Iterator(iterator) => iterator.clone(),
                    other => {
                        return Err(self.fatal_traced(
                            FatalKind::ValueError,
                            format!("cannot advance value of type {}", other.kind()),
                        ));
                    }
                };
                let (value, more) = iterator.advance();
                // The `more?` flag sits below the yielded value so the loop
                // head can bind the value first and branch afterwards.
                self.stack.push(value_ref(Value::Bool(more)));
                self.stack.push(value);
            }

            Instruction::Import { module, item } => {
                match self.vm.resolve_import(&module, &item) {
                    Some(resolved) => {
                        self.vm.globals.set(item, value_ref(resolved));
                    }
                    None => {
                        return Err(self.fatal_traced(
                            FatalKind::ImportError,
                            format!("module `{}` has no member `{}`", module, item),
                        ));
                    }
                }
            }

            Instruction::Label(label) => {
                panic!("label `{}` survived relocation", label)
            }
        }
        Ok(StepOutcome::Continue)
    }

    // -----------------------------------------------------------------------
    // Exception handling
    // -----------------------------------------------------------------------

    /// Route a catchable exception to the innermost catch frame, unwinding
    /// call frames, the operand stack, and the memory pointer to the state
    /// captured at `SetTryLabel`. Anything uncatchable passes through (with a
    /// stack trace attached to fatals).
    fn handle_interrupt(&mut self, interrupt: Interrupt) -> Result<(), Interrupt> {
        let exception = match interrupt {
            Interrupt::Exception(exception) => exception,
            Interrupt::Fatal(mut fatal) => {
                if fatal.trace.is_empty() {
                    fatal.trace = self.stack_trace();
                }
                return Err(Interrupt::Fatal(fatal));
            }
            other => return Err(other),
        };

        let Some(catch) = self.catch_stack.pop() else {
            let mut fatal = FatalError::new(
                exception.origin.fatal_kind(),
                exception.message,
                exception.span,
            );
            fatal.trace = self.stack_trace();
            return Err(Interrupt::Fatal(fatal));
        };

        // Unwind frames above the catch site.
        while self.call_stack.len() > catch.call_depth {
            self.call_stack.pop();
        }
        self.mem_ptr = catch.mem_ptr;
        self.memory.truncate(self.mem_ptr as usize);
        self.stack.truncate(catch.stack_depth);

        let top = self
            .call_stack
            .last_mut()
            .expect("catch frame below an empty call stack");
        *top = catch.frame.clone();

        self.stack.push(value_ref(error_object(&exception)));
        Ok(())
    }

    /// Collapse the call stack into rendered trace frames, innermost first.
    /// Adjacent repetitions of the same function fold into one entry with a
    /// count.
    fn stack_trace(&self) -> Vec<TraceFrame> {
        let mut trace: Vec<TraceFrame> = Vec::new();
        for frame in self.call_stack.iter().rev() {
            let span = self
                .function(&frame.function)
                .span_at(frame.ip.saturating_sub(1));
            match trace.last_mut() {
                Some(last) if last.function == frame.function => last.count += 1,
                _ => trace.push(TraceFrame {
                    function: frame.function.clone(),
                    span,
                    count: 1,
                }),
            }
        }
        trace
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn host_ctx(&self, span: &Span) -> HostCtx<'_> {
        HostCtx {
            executor: self.vm.executor.as_ref(),
            cancel: &self.vm.cancel,
            globals: &self.vm.globals,
            span: span.clone(),
        }
    }

    fn slot_address(&self, slot: i64) -> usize {
        let address = self.mem_ptr - slot;
        assert!(
            address >= 0 && (address as usize) < self.memory.len(),
            "slot {} outside frame (mem_ptr {})",
            slot,
            self.mem_ptr
        );
        address as usize
    }

    fn pop(&mut self, span: &Span) -> Result<ValueRef, Interrupt> {
        self.stack.pop().ok_or_else(|| self.underflow(span))
    }

    fn pop_int(&mut self, span: &Span) -> Result<i64, Interrupt> {
        let handle = self.pop(span)?;
        let guard = handle.read();
        guard.as_int().ok_or_else(|| {
            self.fatal_traced(
                FatalKind::ValueError,
                format!("expected int on the stack, got {}", guard.kind()),
            )
        })
    }

    fn pop_bool(&mut self, span: &Span) -> Result<bool, Interrupt> {
        let handle = self.pop(span)?;
        let guard = handle.read();
        guard.as_bool().ok_or_else(|| {
            self.fatal_traced(
                FatalKind::ValueError,
                format!("expected bool on the stack, got {}", guard.kind()),
            )
        })
    }

    fn underflow(&self, _span: &Span) -> Interrupt {
        self.fatal_traced(FatalKind::ValueError, "operand stack underflow")
    }

    fn fatal_traced(&self, kind: FatalKind, message: impl Into<String>) -> Interrupt {
        let mut fatal = FatalError::new(kind, message, self.current_span());
        fatal.trace = self.stack_trace();
        Interrupt::Fatal(fatal)
    }

    fn fatal_from(&self, err: RuntimeError) -> Interrupt {
        self.fatal_traced(err.kind, err.message)
    }

    fn unary(
        &mut self,
        span: &Span,
        op: fn(&Value) -> Result<Value, RuntimeError>,
    ) -> Result<(), Interrupt> {
        let operand = self.pop(span)?;
        let result = op(&operand.read()).map_err(|err| self.fatal_from(err))?;
        self.stack.push(value_ref(result));
        Ok(())
    }

    fn binary(&mut self, span: &Span, op: BinaryOp) -> Result<(), Interrupt> {
        let rhs = self.pop(span)?;
        let lhs = self.pop(span)?;
        let result = operators::apply_binary(op, &lhs.read(), &rhs.read())
            .map_err(|err| self.fatal_from(err))?;
        self.stack.push(value_ref(result));
        Ok(())
    }

    fn compare(&mut self, span: &Span, op: CompareOp) -> Result<(), Interrupt> {
        let rhs = self.pop(span)?;
        let lhs = self.pop(span)?;
        let result = operators::apply_compare(op, &lhs.read(), &rhs.read())
            .map_err(|err| self.fatal_from(err))?;
        self.stack.push(value_ref(result));
        Ok(())
    }

    /// String/list indexing with negative wrapping.
    fn index_value(&self, base: &ValueRef, index: &ValueRef) -> Result<ValueRef, Interrupt> {
        let index = index.read().as_int().ok_or_else(|| {
            self.fatal_traced(
                FatalKind::ValueError,
                format!("index must be an int, got {}", index.read().kind()),
            )
        })?;
        match &*base.read() {
            Value::List(items) => {
                let wrapped = if index < 0 {
                    items.len() as i64 + index
                } else {
                    index
                };
                if wrapped < 0 || wrapped as usize >= items.len() {
                    return Err(self.fatal_traced(
                        FatalKind::IndexOutOfBounds,
                        format!(
                            "index {} is out of bounds for a list of length {}",
                            index,
                            items.len()
                        ),
                    ));
                }
                Ok(items[wrapped as usize].clone())
            }
            Value::String(s) => {
                let chars: Vec<char> = s.chars().collect();
                let wrapped = if index < 0 {
                    chars.len() as i64 + index
                } else {
                    index
                };
                if wrapped < 0 || wrapped as usize >= chars.len() {
                    return Err(self.fatal_traced(
                        FatalKind::IndexOutOfBounds,
                        format!(
                            "index {} is out of bounds for a string of length {}",
                            index,
                            chars.len()
                        ),
                    ));
                }
                Ok(value_ref(Value::String(
                    chars[wrapped as usize].to_string(),
                )))
            }
            other => Err(self.fatal_traced(
                FatalKind::ValueError,
                format!("value of type {} cannot be indexed", other.kind()),
            )),
        }
    }
}

/// The structured error object bound by `catch`.
fn error_object(exception: &Exception) -> Value {
    Value::Object(vec![
        (
            "message".to_string(),
            value_ref(Value::String(exception.message.clone())),
        ),
        (
            "line".to_string(),
            value_ref(Value::Int(exception.span.start.line as i64)),
        ),
        (
            "column".to_string(),
            value_ref(Value::Int(exception.span.start.column as i64)),
        ),
        (
            "filename".to_string(),
            value_ref(Value::String(exception.span.filename.clone())),
        ),
    ])
}
