//! Runtime interrupts and error plumbing.
//!
//! Anything that leaves the straight-line dispatch loop is an [`Interrupt`]:
//! cooperative termination, a structured `exit`, a catchable exception, or a
//! fatal fault. Stateless helpers (operators, methods, casts, JSON) return
//! [`RuntimeError`]s without spans; the core attaches the faulting span and
//! the unwound stack trace when it converts them into interrupts.

use std::fmt;

use thiserror::Error;

use crate::diagnostic::{Diagnostic, Span};

/// Sub-kinds of fatal faults. None of these are catchable by `try`/`catch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalKind {
    StackOverflow,
    OutOfMemory,
    ValueError,
    IndexOutOfBounds,
    CastError,
    ImportError,
    HostError,
    JsonError,
    UncaughtThrow,
    OptionUnwrapError,
}

impl fmt::Display for FatalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatalKind::StackOverflow => write!(f, "StackOverflow"),
            FatalKind::OutOfMemory => write!(f, "OutOfMemory"),
            FatalKind::ValueError => write!(f, "ValueError"),
            FatalKind::IndexOutOfBounds => write!(f, "IndexOutOfBounds"),
            FatalKind::CastError => write!(f, "CastError"),
            FatalKind::ImportError => write!(f, "ImportError"),
            FatalKind::HostError => write!(f, "HostError"),
            FatalKind::JsonError => write!(f, "JsonError"),
            FatalKind::UncaughtThrow => write!(f, "UncaughtThrow"),
            FatalKind::OptionUnwrapError => write!(f, "OptionUnwrapErr"),
        }
    }
}

/// A span-less runtime fault from a stateless helper.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct RuntimeError {
    pub kind: FatalKind,
    pub message: String,
}

impl RuntimeError {
    pub fn new(kind: FatalKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn value(message: impl Into<String>) -> Self {
        Self::new(FatalKind::ValueError, message)
    }

    pub fn out_of_bounds(message: impl Into<String>) -> Self {
        Self::new(FatalKind::IndexOutOfBounds, message)
    }

    pub fn json(message: impl Into<String>) -> Self {
        Self::new(FatalKind::JsonError, message)
    }
}

/// What raised a catchable exception; decides the fatal kind the exception
/// fatalizes to when no catch frame is on the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionOrigin {
    /// A `throw` in user code.
    Throw,
    /// A failed runtime cast.
    Cast,
}

impl ExceptionOrigin {
    pub fn fatal_kind(self) -> FatalKind {
        match self {
            ExceptionOrigin::Throw => FatalKind::UncaughtThrow,
            ExceptionOrigin::Cast => FatalKind::CastError,
        }
    }
}

/// A catchable exception travelling up the core's catch stack.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct Exception {
    pub message: String,
    pub span: Span,
    pub origin: ExceptionOrigin,
}

impl Exception {
    pub fn throw(message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
            origin: ExceptionOrigin::Throw,
        }
    }
}

/// One rendered frame of a collapsed stack trace.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceFrame {
    pub function: String,
    pub span: Span,
    /// How many directly adjacent identical frames this entry collapses.
    pub count: usize,
}

/// An uncatchable fault terminating its core.
#[derive(Debug, Clone)]
pub struct FatalError {
    pub kind: FatalKind,
    pub message: String,
    pub span: Span,
    pub trace: Vec<TraceFrame>,
}

impl FatalError {
    pub fn new(kind: FatalKind, message: impl Into<String>, span: Span) -> Self {
        Self {
            kind,
            message: message.into(),
            span,
            trace: Vec::new(),
        }
    }
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if !self.trace.is_empty() {
            writeln!(f)?;
            writeln!(f, "== Stacktrace ==")?;
            for (index, frame) in self.trace.iter().enumerate() {
                let repeat = if frame.count > 1 {
                    format!(" ({})", frame.count)
                } else {
                    String::new()
                };
                writeln!(
                    f,
                    "{:>3}: {}(){}    {}:{}:{}",
                    index,
                    frame.function,
                    repeat,
                    frame.span.filename,
                    frame.span.start.line,
                    frame.span.start.column,
                )?;
            }
            write!(f, "== Stacktrace ==")?;
        }
        Ok(())
    }
}

impl std::error::Error for FatalError {}

/// A non-local control transfer out of instruction dispatch.
#[derive(Debug, Clone, Error)]
pub enum Interrupt {
    /// Cooperative cancellation or deadline expiry.
    #[error("terminated: {reason}")]
    Termination { reason: String, span: Span },

    /// Structured, non-error exit requested by the program.
    #[error("exit with code {0}")]
    Exit(i64),

    /// A catchable exception that escaped its core's dispatch step. The core
    /// consults the catch stack before letting this propagate.
    #[error(transparent)]
    Exception(Exception),

    /// A fatal fault; terminates the core unconditionally.
    #[error(transparent)]
    Fatal(FatalError),
}

impl Interrupt {
    /// The source position the interrupt points at.
    pub fn span(&self) -> Span {
        match self {
            Interrupt::Termination { span, .. } => span.clone(),
            Interrupt::Exit(_) => Span::default(),
            Interrupt::Exception(exception) => exception.span.clone(),
            Interrupt::Fatal(fatal) => fatal.span.clone(),
        }
    }

    /// Whether the interrupt may be consumed by a `try`/`catch` frame.
    pub fn is_catchable(&self) -> bool {
        matches!(self, Interrupt::Exception(_))
    }

    /// Render the driver-facing diagnostic for this interrupt.
    pub fn into_diagnostic(self, core_num: usize) -> Diagnostic {
        let span = self.span();
        Diagnostic::error(self.to_string(), span)
            .with_note(format!("occurred on core {}", core_num))
    }
}

impl From<Exception> for Interrupt {
    fn from(exception: Exception) -> Self {
        Interrupt::Exception(exception)
    }
}

impl From<FatalError> for Interrupt {
    fn from(fatal: FatalError) -> Self {
        Interrupt::Fatal(fatal)
    }
}

/// An error reported by the host across the executor boundary.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct HostError(pub String);

impl HostError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}
