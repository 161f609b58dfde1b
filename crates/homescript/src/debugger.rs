//! Optional per-instruction debug channel.
//!
//! A [`Debugger`] attaches to one core. Before every instruction the core
//! emits a [`DebugOutput`]; when the debugger is paused (single-stepping, or
//! a breakpoint hit) it blocks until the client sends a resume command. The
//! output channel closing signals core termination to the client.

use std::collections::HashSet;
use std::sync::mpsc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::bytecode::Instruction;
use crate::core::CallFrame;
use crate::diagnostic::Span;

/// One instruction-level observation.
#[derive(Debug, Clone)]
pub struct DebugOutput {
    pub current_instruction: Instruction,
    pub current_span: Span,
    pub current_frame: CallFrame,
}

/// Resume commands the client may send while the core is paused.
#[derive(Debug, Clone)]
pub enum DebugCommand {
    /// Execute exactly one instruction, then pause again.
    Step,
    /// Run until the next breakpoint.
    Continue,
    /// Run with an artificial per-instruction delay (the speed knob).
    Run { delay: Option<Duration> },
}

#[derive(Debug, Clone)]
enum Mode {
    Step,
    Run { delay: Option<Duration> },
}

/// The core-side half of the debug channel.
pub struct Debugger {
    output: mpsc::Sender<DebugOutput>,
    commands: Mutex<mpsc::Receiver<DebugCommand>>,
    mode: Mutex<Mode>,
    breakpoints: HashSet<(String, usize)>,
}

/// The caller-side half: receives outputs, sends resume commands.
pub struct DebugClient {
    pub outputs: mpsc::Receiver<DebugOutput>,
    commands: mpsc::Sender<DebugCommand>,
}

impl DebugClient {
    pub fn resume(&self, command: DebugCommand) {
        let _ = self.commands.send(command);
    }
}

impl Debugger {
    /// Create a connected debugger/client pair.
    ///
    /// `breakpoints` are `(mangled function name, instruction index)` pairs.
    /// With `start_paused` the core blocks before its first instruction.
    pub fn new(
        breakpoints: HashSet<(String, usize)>,
        start_paused: bool,
    ) -> (Self, DebugClient) {
        let (output_tx, output_rx) = mpsc::channel();
        let (command_tx, command_rx) = mpsc::channel();
        let debugger = Self {
            output: output_tx,
            commands: Mutex::new(command_rx),
            mode: Mutex::new(if start_paused {
                Mode::Step
            } else {
                Mode::Run { delay: None }
            }),
            breakpoints,
        };
        let client = DebugClient {
            outputs: output_rx,
            commands: command_tx,
        };
        (debugger, client)
    }

    /// Called by the core before executing each instruction.
    pub fn on_instruction(&self, frame: &CallFrame, instruction: &Instruction, span: &Span) {
        let _ = self.output.send(DebugOutput {
            current_instruction: instruction.clone(),
            current_span: span.clone(),
            current_frame: frame.clone(),
        });

        let mode = self.mode.lock().clone();
        let paused = matches!(mode, Mode::Step)
            || self
                .breakpoints
                .contains(&(frame.function.clone(), frame.ip));

        if paused {
            // Block until the client resumes; a disconnected client means
            // free-running.
            match self.commands.lock().recv() {
                Ok(DebugCommand::Step) => *self.mode.lock() = Mode::Step,
                Ok(DebugCommand::Continue) => *self.mode.lock() = Mode::Run { delay: None },
                Ok(DebugCommand::Run { delay }) => *self.mode.lock() = Mode::Run { delay },
                Err(_) => *self.mode.lock() = Mode::Run { delay: None },
            }
        } else if let Mode::Run { delay: Some(delay) } = mode {
            std::thread::sleep(delay);
        }
    }
}
