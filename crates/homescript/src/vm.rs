//! The process-wide owner of a compiled program.
//!
//! The VM holds the immutable [`Program`], the globals table behind a
//! readers-writer lock, the set of live cores, the executor, and one
//! cancellation token. Cores run on their own OS threads and report through
//! per-core signal handles (mpsc channels); [`Vm::wait`] polls those handles,
//! propagates the first non-nil interrupt, cancels the rest, and drains them.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, TryRecvError};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ast::Type;
use crate::bytecode::Program;
use crate::cancel::CancelToken;
use crate::core::{CallFrame, Core, CoreResult};
use crate::debugger::Debugger;
use crate::diagnostic::Span;
use crate::error::Interrupt;
use crate::executor::Executor;
use crate::methods::cast_value;
use crate::value::{BuiltinFn, Value, ValueRef, value_ref};

/// Per-core resource limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Limits {
    pub max_call_stack_depth: usize,
    pub max_op_stack_depth: usize,
    pub max_memory_size: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_call_stack_depth: 100,
            max_op_stack_depth: 500,
            max_memory_size: 100_000,
        }
    }
}

/// The shared globals table.
///
/// Reads take the shared lock and clone the value handle; writes are
/// serialized by the exclusive lock. [`Globals::update`] runs a closure under
/// the exclusive lock for atomic read-modify-write sequences (host builtins
/// use this to increment counters without losing writes).
#[derive(Default)]
pub struct Globals(RwLock<HashMap<String, ValueRef>>);

impl Globals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<ValueRef> {
        self.0.read().get(name).cloned()
    }

    pub fn set(&self, name: impl Into<String>, handle: ValueRef) {
        self.0.write().insert(name.into(), handle);
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut HashMap<String, ValueRef>) -> R) -> R {
        f(&mut self.0.write())
    }
}

/// The signal-handle side of one spawned core.
pub struct CoreHandle {
    pub num: usize,
    receiver: Mutex<Receiver<CoreResult>>,
    result: Mutex<Option<CoreResult>>,
}

impl CoreHandle {
    /// Non-blocking poll; caches the result once it arrives.
    fn poll(&self) -> Option<CoreResult> {
        if let Some(result) = self.result.lock().clone() {
            return Some(result);
        }
        match self.receiver.lock().try_recv() {
            Ok(result) => {
                *self.result.lock() = Some(result.clone());
                Some(result)
            }
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                // A panicked core thread reports as termination.
                let result = CoreResult {
                    interrupt: Some(Interrupt::Termination {
                        reason: "core thread died".to_string(),
                        span: Span::default(),
                    }),
                    value: None,
                };
                *self.result.lock() = Some(result.clone());
                Some(result)
            }
        }
    }

    /// Blocking drain with a grace period, for post-cancellation cleanup.
    fn drain(&self, timeout: Duration) -> Option<CoreResult> {
        if let Some(result) = self.result.lock().clone() {
            return Some(result);
        }
        match self.receiver.lock().recv_timeout(timeout) {
            Ok(result) => {
                *self.result.lock() = Some(result.clone());
                Some(result)
            }
            Err(_) => None,
        }
    }
}

/// Shared VM state, owned by [`Vm`] and referenced by every core.
pub struct VmInner {
    pub program: Program,
    pub globals: Globals,
    pub executor: Arc<dyn Executor>,
    pub cancel: CancelToken,
    pub limits: Limits,
    pub host_calls: HashMap<String, BuiltinFn>,
    builtin_imports: HashMap<(String, String), Value>,
    cores: RwLock<Vec<Arc<CoreHandle>>>,
    next_core: AtomicUsize,
}

impl VmInner {
    /// Resolve a builtin module member: the VM's own modules (`sys`) first,
    /// the executor second.
    pub fn resolve_import(&self, module: &str, item: &str) -> Option<Value> {
        if let Some(value) = self
            .builtin_imports
            .get(&(module.to_string(), item.to_string()))
        {
            return Some(value.clone());
        }
        self.executor.get_builtin_import(module, item)
    }
}

/// Start a new core for `function` with `args` pre-pushed, returning its
/// number. Shared by [`Vm::spawn_async`] and the `Spawn` opcode.
pub fn spawn_core(
    inner: Arc<VmInner>,
    function: String,
    args: Vec<ValueRef>,
    debugger: Option<Debugger>,
) -> usize {
    let num = inner.next_core.fetch_add(1, Ordering::SeqCst);
    let (sender, receiver) = std::sync::mpsc::channel();
    let handle = Arc::new(CoreHandle {
        num,
        receiver: Mutex::new(receiver),
        result: Mutex::new(None),
    });
    inner.cores.write().push(handle);

    debug!(core = num, function = %function, "spawning core");
    let thread_inner = inner.clone();
    std::thread::spawn(move || {
        let mut core = Core::new(thread_inner, num, debugger);
        core.push_args(args);
        let result = core.run(&function);
        let _ = sender.send(result);
    });
    num
}

// ---------------------------------------------------------------------------
// Invocation API
// ---------------------------------------------------------------------------

/// The declared signature of an invoked function.
#[derive(Debug, Clone)]
pub struct FunctionSignature {
    /// Ordered parameter names and types.
    pub params: Vec<(String, Type)>,
    pub return_type: Type,
}

impl FunctionSignature {
    /// `fn() -> null`, the shape of `@init` and most entry points.
    pub fn empty() -> Self {
        Self {
            params: Vec::new(),
            return_type: Type::Null,
        }
    }
}

/// A host-side request to run one compiled function.
#[derive(Debug, Clone)]
pub struct FunctionInvocation {
    /// Mangled function name (resolve source names through
    /// [`Program::resolve_function`]).
    pub function: String,
    pub args: Vec<Value>,
    pub signature: FunctionSignature,
}

impl FunctionInvocation {
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            args: Vec::new(),
            signature: FunctionSignature::empty(),
        }
    }
}

/// Outcome of a synchronous invocation.
#[derive(Debug, Clone)]
pub enum FunctionInvocationResult {
    Exception { core_num: usize, interrupt: Interrupt },
    Value(Value),
}

// ---------------------------------------------------------------------------
// Vm
// ---------------------------------------------------------------------------

pub struct Vm {
    inner: Arc<VmInner>,
}

impl Vm {
    /// Construct a VM over a compiled program.
    ///
    /// `scope_additions` are published into globals under their plain names,
    /// on top of the default additions (`print`, `println`, `debug`,
    /// `assert`, `assert_eq`, `exit`) and the `sys` builtin module.
    pub fn new(
        program: Program,
        executor: Arc<dyn Executor>,
        limits: Limits,
        scope_additions: HashMap<String, Value>,
    ) -> Self {
        let globals = Globals::new();
        for (name, value) in crate::builtins::scope_additions() {
            globals.set(name, value_ref(value));
        }
        for (name, value) in scope_additions {
            globals.set(name, value_ref(value));
        }

        let inner = Arc::new(VmInner {
            program,
            globals,
            executor,
            cancel: CancelToken::new(),
            limits,
            host_calls: crate::builtins::host_calls(),
            builtin_imports: crate::builtins::builtin_imports(),
            cores: RwLock::new(Vec::new()),
            next_core: AtomicUsize::new(0),
        });
        Self { inner }
    }

    pub fn program(&self) -> &Program {
        &self.inner.program
    }

    pub fn globals(&self) -> &Globals {
        &self.inner.globals
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.inner.cancel.clone()
    }

    /// Attach an external deadline to the run.
    pub fn set_deadline(&self, timeout: Duration) {
        self.inner.cancel.set_deadline(timeout);
    }

    /// Validate the invocation against its signature and start a core for
    /// it. Argument-count or argument-cast mismatches are host programming
    /// errors and panic.
    pub fn spawn_async(
        &self,
        invocation: FunctionInvocation,
        debugger: Option<Debugger>,
    ) -> usize {
        assert_eq!(
            invocation.args.len(),
            invocation.signature.params.len(),
            "invocation of `{}` expects {} argument(s), got {}",
            invocation.function,
            invocation.signature.params.len(),
            invocation.args.len(),
        );
        let mut args = Vec::with_capacity(invocation.args.len());
        for (value, (name, ty)) in invocation.args.iter().zip(&invocation.signature.params) {
            let cast = cast_value(value, ty, false).unwrap_or_else(|err| {
                panic!(
                    "invalid argument `{}` for `{}`: {}",
                    name, invocation.function, err
                )
            });
            args.push(value_ref(cast));
        }
        spawn_core(self.inner.clone(), invocation.function, args, debugger)
    }

    /// Spawn and wait. On clean termination the core's result value is
    /// deep-cast (non-lossy) to the declared return type.
    pub fn spawn_sync(
        &self,
        invocation: FunctionInvocation,
        debugger: Option<Debugger>,
    ) -> FunctionInvocationResult {
        let return_type = invocation.signature.return_type.clone();
        let num = self.spawn_async(invocation, debugger);

        let (core_num, interrupt) = self.wait();
        if let Some(interrupt) = interrupt {
            return FunctionInvocationResult::Exception {
                core_num,
                interrupt,
            };
        }

        if return_type == Type::Null {
            return FunctionInvocationResult::Value(Value::Null);
        }
        let value = self
            .core_value(num)
            .map(|handle| handle.read().clone())
            .unwrap_or(Value::Null);
        let cast = cast_value(&value, &return_type, false)
            .unwrap_or_else(|err| panic!("invalid return value: {}", err));
        FunctionInvocationResult::Value(cast)
    }

    /// Run the program's `@init` (module globals, singletons, imports).
    pub fn run_init(&self) -> Result<(), (usize, Interrupt)> {
        let invocation = FunctionInvocation::new(self.inner.program.entry_function.clone());
        match self.spawn_sync(invocation, None) {
            FunctionInvocationResult::Value(_) => Ok(()),
            FunctionInvocationResult::Exception {
                core_num,
                interrupt,
            } => Err((core_num, interrupt)),
        }
    }

    /// Poll every live core until one reports a non-nil interrupt or all
    /// report nil. On an interrupt the cancellation context triggers, the
    /// remaining cores are drained, and `(core_num, interrupt)` is returned.
    /// Normal completion returns `(0, None)`.
    pub fn wait(&self) -> (usize, Option<Interrupt>) {
        loop {
            let handles: Vec<Arc<CoreHandle>> = self.inner.cores.read().clone();
            let mut pending = false;

            for handle in &handles {
                match handle.poll() {
                    Some(result) => {
                        if let Some(interrupt) = result.interrupt {
                            debug!(core = handle.num, %interrupt, "core faulted; cancelling");
                            self.inner.cancel.cancel(interrupt.to_string());
                            self.drain_cores();
                            return (handle.num, Some(interrupt));
                        }
                    }
                    None => pending = true,
                }
            }

            if !pending {
                return (0, None);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn drain_cores(&self) {
        let handles: Vec<Arc<CoreHandle>> = self.inner.cores.read().clone();
        for handle in handles {
            let _ = handle.drain(Duration::from_secs(5));
        }
    }

    /// The result value a finished core left behind.
    pub fn core_value(&self, num: usize) -> Option<ValueRef> {
        let handles = self.inner.cores.read();
        let handle = handles.iter().find(|handle| handle.num == num)?;
        let result = handle.result.lock().clone()?;
        result.value
    }

    /// The source span for a call frame. Unknown functions are a host bug.
    pub fn source_map(&self, frame: &CallFrame) -> Span {
        self.inner
            .program
            .functions
            .get(&frame.function)
            .unwrap_or_else(|| panic!("unknown function `{}` in frame", frame.function))
            .span_at(frame.ip)
    }
}
