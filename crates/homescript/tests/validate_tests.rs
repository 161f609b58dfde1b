//! The golden-output validation harness, driven with in-memory entries.

mod common;

use std::collections::HashMap;

use common::main_only;
use homescript::validate::{ProgressState, ValidationEntry, validate_entries};
use homescript::{
    AnalyzedProgram, Block, Expression, Limits, Statement, Type,
};

fn print_program(text: &str) -> HashMap<String, AnalyzedProgram> {
    main_only(Block::new(vec![Statement::expr(Expression::call(
        "println",
        vec![Expression::string(text)],
        Type::Null,
    ))]))
}

fn faulting_program() -> HashMap<String, AnalyzedProgram> {
    main_only(Block::new(vec![Statement::expr(Expression::call(
        "throw",
        vec![Expression::string("boom")],
        Type::Null,
    ))]))
}

fn entry(name: &str, modules: HashMap<String, AnalyzedProgram>) -> ValidationEntry {
    ValidationEntry {
        name: name.to_string(),
        modules,
        entry_module: "main".to_string(),
    }
}

#[test]
fn test_validation_classifies_entries() {
    let entries = vec![
        entry("good", print_program("ok")),
        entry("wrong", print_program("different")),
        entry("broken", faulting_program()),
    ];

    let mut progress = ProgressState::default();
    let mut callbacks = 0;
    let summary = validate_entries(
        entries,
        "ok\n",
        2,
        &Limits::default(),
        None,
        &mut progress,
        |_| callbacks += 1,
    );

    assert_eq!(summary.total, 3);
    assert_eq!(summary.replayed, 3);
    assert_eq!(summary.skipped, 0);
    assert_eq!(summary.broken, 2);
    assert_eq!(callbacks, 3);

    assert!(progress.completed["good"].is_none());

    let wrong = progress.completed["wrong"].as_ref().unwrap();
    let mismatch = wrong.wrong_stdout.as_ref().unwrap();
    assert_eq!(mismatch.expected, "ok\n");
    assert_eq!(mismatch.found, "different\n");

    let broken = progress.completed["broken"].as_ref().unwrap();
    assert!(broken.error.as_ref().unwrap().message.contains("boom"));
}

#[test]
fn test_validation_resumes_from_progress() {
    let mut progress = ProgressState::default();
    progress.completed.insert("good".to_string(), None);

    let entries = vec![
        entry("good", print_program("ok")),
        entry("fresh", print_program("ok")),
    ];
    let summary = validate_entries(
        entries,
        "ok\n",
        1,
        &Limits::default(),
        None,
        &mut progress,
        |_| {},
    );

    assert_eq!(summary.total, 2);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.replayed, 1);
    assert_eq!(summary.broken, 0);
    assert!(progress.completed.contains_key("fresh"));
}
