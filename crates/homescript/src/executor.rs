//! The host collaborator interface.
//!
//! The VM never talks to the outside world directly: singleton state, builtin
//! module members, module sources for diagnostics, text output, and the
//! executing user all go through [`Executor`]. [`BufferedExecutor`] is the
//! in-memory implementation used by tests and by the validation harness.

use std::collections::HashMap;

use parking_lot::{Mutex, RwLock};

use crate::cancel::CancelToken;
use crate::diagnostic::Span;
use crate::error::{FatalError, FatalKind, HostError, Interrupt, RuntimeError};
use crate::value::Value;
use crate::vm::Globals;

/// Host services available to the running VM.
pub trait Executor: Send + Sync {
    /// Fetch the host-persisted instance of a singleton. `Ok(None)` means the
    /// host has no instance and the compiled default stays in place.
    fn load_singleton(&self, name: &str, module: &str) -> Result<Option<Value>, HostError>;

    /// Resolve an item imported from a builtin (non-Homescript) module.
    fn get_builtin_import(&self, module: &str, item: &str) -> Option<Value>;

    /// Reconstruct a module's source text for diagnostic rendering.
    fn resolve_module_code(&self, module: &str) -> Result<Option<String>, HostError>;

    /// Sink for `print` / `println` / `debug` output.
    fn write_string(&self, text: &str) -> Result<(), HostError>;

    /// Identity of the executing principal.
    fn get_user(&self) -> String;
}

/// Call context handed to every builtin function and host reducer.
pub struct HostCtx<'a> {
    pub executor: &'a dyn Executor,
    pub cancel: &'a CancelToken,
    pub globals: &'a Globals,
    /// Span of the call site, for interrupts raised inside the builtin.
    pub span: Span,
}

impl HostCtx<'_> {
    /// Wrap a helper error into a fatal interrupt at the call-site span.
    pub fn fatal(&self, err: RuntimeError) -> Interrupt {
        Interrupt::Fatal(FatalError::new(err.kind, err.message, self.span.clone()))
    }

    pub fn fatal_kind(&self, kind: FatalKind, message: impl Into<String>) -> Interrupt {
        Interrupt::Fatal(FatalError::new(kind, message, self.span.clone()))
    }

    /// Raise a catchable exception at the call-site span.
    pub fn throw(&self, message: impl Into<String>) -> Interrupt {
        Interrupt::Exception(crate::error::Exception::throw(message, self.span.clone()))
    }

    /// Forward a host error as a fatal `HostError` interrupt.
    pub fn host_err(&self, err: HostError) -> Interrupt {
        self.fatal_kind(FatalKind::HostError, err.0)
    }
}

/// An in-memory executor capturing output into a buffer.
///
/// Singletons are keyed by `(module, name)`; builtin imports beyond the VM's
/// own `sys` module can be registered per `(module, item)`.
#[derive(Default)]
pub struct BufferedExecutor {
    output: Mutex<String>,
    user: String,
    singletons: RwLock<HashMap<(String, String), Value>>,
    imports: RwLock<HashMap<(String, String), Value>>,
    sources: RwLock<HashMap<String, String>>,
}

impl BufferedExecutor {
    pub fn new() -> Self {
        Self {
            user: "local".to_string(),
            ..Self::default()
        }
    }

    pub fn with_user(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            ..Self::default()
        }
    }

    /// Seed a singleton instance the VM will find at init time.
    pub fn set_singleton(&self, module: impl Into<String>, name: impl Into<String>, value: Value) {
        self.singletons
            .write()
            .insert((module.into(), name.into()), value);
    }

    /// Register an importable builtin module member.
    pub fn set_import(&self, module: impl Into<String>, item: impl Into<String>, value: Value) {
        self.imports
            .write()
            .insert((module.into(), item.into()), value);
    }

    /// Provide a module source for diagnostic rendering.
    pub fn set_source(&self, module: impl Into<String>, source: impl Into<String>) {
        self.sources.write().insert(module.into(), source.into());
    }

    /// A copy of everything written so far.
    pub fn output(&self) -> String {
        self.output.lock().clone()
    }

    /// Drain the output buffer.
    pub fn take_output(&self) -> String {
        std::mem::take(&mut self.output.lock())
    }
}

impl Executor for BufferedExecutor {
    fn load_singleton(&self, name: &str, module: &str) -> Result<Option<Value>, HostError> {
        Ok(self
            .singletons
            .read()
            .get(&(module.to_string(), name.to_string()))
            .map(Value::deep_clone))
    }

    fn get_builtin_import(&self, module: &str, item: &str) -> Option<Value> {
        self.imports
            .read()
            .get(&(module.to_string(), item.to_string()))
            .cloned()
    }

    fn resolve_module_code(&self, module: &str) -> Result<Option<String>, HostError> {
        Ok(self.sources.read().get(module).cloned())
    }

    fn write_string(&self, text: &str) -> Result<(), HostError> {
        self.output.lock().push_str(text);
        Ok(())
    }

    fn get_user(&self) -> String {
        self.user.clone()
    }
}
