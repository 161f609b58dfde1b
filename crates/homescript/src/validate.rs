//! Golden-output validation harness.
//!
//! The fuzzing driver stores many mutated programs next to one reference
//! stdout. This module replays pre-analyzed entries across a worker pool,
//! captures each program's output through a buffering executor, and compares
//! it against the golden text. Progress is a serializable map keyed by entry
//! name, so an aborted validation resumes where it stopped; the driver
//! persists it (as `<archive>.prog.json`) through the progress callback.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ast::AnalyzedProgram;
use crate::compiler;
use crate::diagnostic::Span;
use crate::error::Interrupt;
use crate::executor::BufferedExecutor;
use crate::vm::{FunctionInvocation, FunctionInvocationResult, Limits, Vm};

/// Persisted validation state. `None` per entry means the replay matched the
/// reference output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressState {
    pub completed: HashMap<String, Option<EntryFailure>>,
}

/// Why an entry diverged from the reference.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntryFailure {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wrong_stdout: Option<WrongStdout>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrongStdout {
    pub expected: String,
    pub found: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub span: Span,
    pub message: String,
}

/// One program to replay: its analyzed modules plus the entry module name.
pub struct ValidationEntry {
    pub name: String,
    pub modules: HashMap<String, AnalyzedProgram>,
    pub entry_module: String,
}

/// Aggregate counts of one validation run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationSummary {
    pub total: usize,
    pub replayed: usize,
    pub skipped: usize,
    pub broken: usize,
}

/// Replay `entries` against `expected_stdout` on `workers` threads.
///
/// Entries already present in `progress` are skipped; `on_progress` fires
/// after every finished entry with the updated state so the driver can
/// persist it.
pub fn validate_entries(
    entries: Vec<ValidationEntry>,
    expected_stdout: &str,
    workers: usize,
    limits: &Limits,
    deadline: Option<Duration>,
    progress: &mut ProgressState,
    mut on_progress: impl FnMut(&ProgressState),
) -> ValidationSummary {
    let mut summary = ValidationSummary {
        total: entries.len(),
        ..ValidationSummary::default()
    };

    let queue: Mutex<VecDeque<ValidationEntry>> = Mutex::new(
        entries
            .into_iter()
            .filter(|entry| {
                if progress.completed.contains_key(&entry.name) {
                    summary.skipped += 1;
                    false
                } else {
                    true
                }
            })
            .collect(),
    );
    let pending = queue.lock().len();
    let workers = workers.clamp(1, pending.max(1));

    let (sender, receiver) = mpsc::channel::<(String, Option<EntryFailure>)>();

    std::thread::scope(|scope| {
        for _ in 0..workers {
            let sender = sender.clone();
            let queue = &queue;
            scope.spawn(move || {
                loop {
                    let Some(entry) = queue.lock().pop_front() else {
                        break;
                    };
                    let failure = run_entry(&entry, expected_stdout, limits, deadline);
                    if sender.send((entry.name, failure)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(sender);

        for (name, failure) in receiver {
            debug!(entry = %name, broken = failure.is_some(), "entry validated");
            summary.replayed += 1;
            if failure.is_some() {
                summary.broken += 1;
            }
            progress.completed.insert(name, failure);
            on_progress(progress);
        }
    });

    summary
}

/// Compile and run one entry, returning its divergence (if any).
fn run_entry(
    entry: &ValidationEntry,
    expected_stdout: &str,
    limits: &Limits,
    deadline: Option<Duration>,
) -> Option<EntryFailure> {
    let program = compiler::compile(&entry.modules, &entry.entry_module);
    let main = program
        .resolve_function(&entry.entry_module, "main")
        .map(str::to_string);

    let executor = Arc::new(BufferedExecutor::new());
    let vm = Vm::new(
        program,
        executor.clone(),
        limits.clone(),
        HashMap::new(),
    );
    if let Some(deadline) = deadline {
        vm.set_deadline(deadline);
    }

    if let Err((_, interrupt)) = vm.run_init() {
        if let Some(failure) = failure_for(interrupt) {
            return Some(failure);
        }
    } else if let Some(main) = main {
        match vm.spawn_sync(FunctionInvocation::new(main), None) {
            FunctionInvocationResult::Value(_) => {}
            FunctionInvocationResult::Exception { interrupt, .. } => {
                if let Some(failure) = failure_for(interrupt) {
                    return Some(failure);
                }
            }
        }
    }

    let found = executor.output();
    if found != expected_stdout {
        return Some(EntryFailure {
            wrong_stdout: Some(WrongStdout {
                expected: expected_stdout.to_string(),
                found,
            }),
            error: None,
        });
    }
    None
}

/// A structured `exit` is a clean termination; everything else is a fault.
fn failure_for(interrupt: Interrupt) -> Option<EntryFailure> {
    match interrupt {
        Interrupt::Exit(_) => None,
        other => Some(EntryFailure {
            wrong_stdout: None,
            error: Some(ErrorDetails {
                span: other.span(),
                message: other.to_string(),
            }),
        }),
    }
}
