//! Scenario tests for the step executor.
//!
//! Steps run against `MockEvaluator`: directive arguments registered with
//! `on` return file lists built from a temporary directory, everything else
//! follows the evaluator's JSON convention.

use std::fs::File;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use dispatch::{
    execute_task, BackendKind, Broker, BrokerError, TaskHandle, TaskOutcome, TaskRequest,
};
use eval::mock::MockEvaluator;
use eval::{EvalError, FileSet};
use serde_json::{json, Value};
use signatures::SignatureMode;

use crate::{
    DirectiveKind, EngineError, ExecutionContext, ExecutorConfig, Statement, Step, StepExecutor,
    StepInput,
};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

struct Fixture {
    dir: tempfile::TempDir,
}

impl Fixture {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn path(&self, name: &str) -> String {
        self.dir.path().join(name).display().to_string()
    }

    fn file(&self, name: &str) -> String {
        let path = self.path(name);
        std::fs::write(&path, name).unwrap();
        path
    }

    fn ctx(&self, mode: SignatureMode) -> ExecutionContext {
        self.ctx_with(ExecutorConfig {
            signature_mode: mode,
            ..ExecutorConfig::default()
        })
    }

    fn ctx_with(&self, config: ExecutorConfig) -> ExecutionContext {
        ExecutionContext::new(ExecutorConfig {
            signature_dir: self.dir.path().join("signatures"),
            ..config
        })
    }
}

fn input(kind_args: &str) -> Statement {
    Statement::directive(DirectiveKind::Input, kind_args)
}

fn output(args: &str) -> Statement {
    Statement::directive(DirectiveKind::Output, args)
}

fn task_options(args: &str) -> Statement {
    Statement::directive(DirectiveKind::Task, args)
}

/// Action that writes every file of `_output`.
fn write_outputs(ns: &mut eval::Namespace) -> Result<Value, EvalError> {
    if let Some(files) = ns.slots().step_output.as_ref().and_then(FileSet::files) {
        for file in files {
            std::fs::write(file, "done").map_err(|e| EvalError::Failed(e.to_string()))?;
        }
    }
    Ok(Value::Null)
}

fn bump_mtime(path: &str) {
    File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(SystemTime::now() + Duration::from_secs(10))
        .unwrap();
}

async fn run(
    evaluator: &MockEvaluator,
    ctx: &ExecutionContext,
    step: &Step,
    input: StepInput,
) -> Result<crate::StepResult, EngineError> {
    StepExecutor::new(Arc::new(evaluator.clone()))
        .run(ctx, step, input)
        .await
}

// ===========================================================================
// Unit tests
// ===========================================================================

#[tokio::test]
async fn unchanged_step_is_skipped_and_touched_input_reruns() {
    let fx = Fixture::new();
    let infile = fx.file("in.txt");
    let outfile = fx.path("out/result.txt");

    let evaluator = MockEvaluator::new()
        .on("outputs", {
            let outfile = outfile.clone();
            move |_| Ok(json!([outfile]))
        })
        .on("make", write_outputs);
    let step = Step::new("convert")
        .statement(input("input"))
        .statement(output("outputs"))
        .with_task("make");
    let ctx = fx.ctx(SignatureMode::Default);
    let seed = || StepInput::from_files(vec![infile.clone()]);

    let first = run(&evaluator, &ctx, &step, seed()).await.unwrap();
    assert_eq!(first.dispatched, vec![0]);
    assert_eq!(first.output, Some(FileSet::Files(vec![outfile.clone()])));
    assert!(Path::new(&outfile).exists());
    assert_eq!(evaluator.call_count("make"), 1);

    let second = run(&evaluator, &ctx, &step, seed()).await.unwrap();
    assert!(second.dispatched.is_empty());
    assert_eq!(second.skipped, vec![0]);
    assert_eq!(evaluator.call_count("make"), 1);

    bump_mtime(&infile);
    let third = run(&evaluator, &ctx, &step, seed()).await.unwrap();
    assert_eq!(third.dispatched, vec![0]);
    assert_eq!(evaluator.call_count("make"), 2);
}

#[tokio::test]
async fn ignore_mode_always_dispatches() {
    let fx = Fixture::new();
    let infile = fx.file("in.txt");
    let outfile = fx.path("out.txt");
    let evaluator = MockEvaluator::new()
        .on("outputs", move |_| Ok(json!(outfile)))
        .on("make", write_outputs);
    let step = Step::new("convert")
        .statement(output("outputs"))
        .with_task("make");
    let ctx = fx.ctx(SignatureMode::Ignore);

    for _ in 0..2 {
        run(&evaluator, &ctx, &step, StepInput::from_files(vec![infile.clone()]))
            .await
            .unwrap();
    }
    assert_eq!(evaluator.call_count("make"), 2);
    assert!(!fx.dir.path().join("signatures").exists());
}

#[tokio::test]
async fn changed_step_content_invalidates_the_signature() {
    let fx = Fixture::new();
    let infile = fx.file("in.txt");
    let outfile = fx.path("out.txt");
    let evaluator = MockEvaluator::new()
        .on("outputs", move |_| Ok(json!(outfile)))
        .on("make", write_outputs)
        .on("make --fast", write_outputs);
    let ctx = fx.ctx(SignatureMode::Default);
    let seed = || StepInput::from_files(vec![infile.clone()]);

    let step = Step::new("convert").statement(output("outputs")).with_task("make");
    run(&evaluator, &ctx, &step, seed()).await.unwrap();

    let edited = Step::new("convert")
        .statement(output("outputs"))
        .with_task("make --fast");
    let result = run(&evaluator, &ctx, &edited, seed()).await.unwrap();
    assert_eq!(result.dispatched, vec![0]);
}

#[tokio::test]
async fn variables_read_by_the_step_enter_the_signature() {
    let fx = Fixture::new();
    let infile = fx.file("in.txt");
    let outfile = fx.path("out.txt");
    let evaluator = MockEvaluator::new()
        .on("outputs", move |ns| {
            ns.read("threads");
            Ok(json!(outfile))
        })
        .on("make", write_outputs);
    let ctx = fx.ctx(SignatureMode::Default);
    let step = Step::new("convert").statement(output("outputs")).with_task("make");
    let seed = |threads: i64| StepInput {
        vars: [("threads".to_string(), json!(threads))].into_iter().collect(),
        ..StepInput::from_files(vec![infile.clone()])
    };

    let first = run(&evaluator, &ctx, &step, seed(4)).await.unwrap();
    assert!(first.signature_vars.contains("threads"));
    assert!(run(&evaluator, &ctx, &step, seed(4)).await.unwrap().dispatched.is_empty());
    assert_eq!(run(&evaluator, &ctx, &step, seed(8)).await.unwrap().dispatched, vec![0]);
}

#[tokio::test]
async fn skipped_groups_do_not_change_the_signature_of_later_groups() {
    let fx = Fixture::new();
    let files = vec![fx.file("a.txt"), fx.file("b.txt")];
    let dir = fx.dir.path().display().to_string();
    let evaluator = MockEvaluator::new()
        .on("outs", move |ns| {
            Ok(json!(format!("{dir}/out{}.txt", ns.slots().index)))
        })
        .on("note", |ns| {
            ns.read("flag");
            Ok(Value::Null)
        })
        .on("make", write_outputs);
    let step = Step::new("split")
        .statement(input(r#"{"group_by": "single"}"#))
        .statement(output("outs"))
        .statement(Statement::action("note"))
        .with_task("make");
    let ctx = fx.ctx(SignatureMode::Default);
    let seed = || StepInput {
        vars: [("flag".to_string(), json!(true))].into_iter().collect(),
        ..StepInput::from_files(files.clone())
    };

    let first = run(&evaluator, &ctx, &step, seed()).await.unwrap();
    assert_eq!(first.dispatched, vec![0, 1]);

    let second = run(&evaluator, &ctx, &step, seed()).await.unwrap();
    assert!(second.dispatched.is_empty());
    assert_eq!(second.skipped, vec![0, 1]);
    assert_eq!(evaluator.call_count("make"), 2);
}

#[tokio::test]
async fn variables_named_by_the_task_or_late_statements_enter_the_signature() {
    let fx = Fixture::new();
    let infile = fx.file("in.txt");
    let outfile = fx.path("out.txt");
    let evaluator = MockEvaluator::new()
        .on("outputs", move |_| Ok(json!(outfile)))
        .on("note level", |ns| {
            ns.read("level");
            Ok(Value::Null)
        })
        .on("make $n", write_outputs);
    let ctx = fx.ctx(SignatureMode::Default);
    let step = Step::new("tune")
        .statement(output("outputs"))
        .statement(Statement::action("note level"))
        .with_task("make $n");
    let seed = |n: i64, level: i64| StepInput {
        vars: [
            ("n".to_string(), json!(n)),
            ("level".to_string(), json!(level)),
        ]
        .into_iter()
        .collect(),
        ..StepInput::from_files(vec![infile.clone()])
    };

    let first = run(&evaluator, &ctx, &step, seed(5, 1)).await.unwrap();
    assert!(first.signature_vars.contains("n"));
    assert!(first.signature_vars.contains("level"));
    assert!(run(&evaluator, &ctx, &step, seed(5, 1)).await.unwrap().dispatched.is_empty());

    // read only by the task
    assert_eq!(run(&evaluator, &ctx, &step, seed(6, 1)).await.unwrap().dispatched, vec![0]);
    // read only after the output directive
    assert_eq!(run(&evaluator, &ctx, &step, seed(6, 2)).await.unwrap().dispatched, vec![0]);
    assert_eq!(evaluator.call_count("make $n"), 3);
}

#[tokio::test]
async fn assert_mode_rejects_a_missing_signature() {
    let fx = Fixture::new();
    let infile = fx.file("in.txt");
    let outfile = fx.path("out.txt");
    let evaluator = MockEvaluator::new().on("outputs", move |_| Ok(json!(outfile)));
    let step = Step::new("convert").statement(output("outputs")).with_task("make");

    let err = run(
        &evaluator,
        &fx.ctx(SignatureMode::Assert),
        &step,
        StepInput::from_files(vec![infile]),
    )
    .await
    .unwrap_err();
    assert!(matches!(err.root(), EngineError::SignatureMismatch { index: 0 }));
    assert_eq!(evaluator.call_count("make"), 0);
}

#[tokio::test]
async fn construct_mode_records_existing_outputs_without_running() {
    let fx = Fixture::new();
    let infile = fx.file("in.txt");
    let outfile = fx.file("out.txt");
    let evaluator = MockEvaluator::new().on("outputs", {
        let outfile = outfile.clone();
        move |_| Ok(json!(outfile))
    });
    let step = Step::new("convert").statement(output("outputs")).with_task("make");
    let seed = || StepInput::from_files(vec![infile.clone()]);

    let built = run(&evaluator, &fx.ctx(SignatureMode::Construct), &step, seed())
        .await
        .unwrap();
    assert_eq!(built.skipped, vec![0]);
    assert_eq!(evaluator.call_count("make"), 0);

    let checked = run(&evaluator, &fx.ctx(SignatureMode::Default), &step, seed())
        .await
        .unwrap();
    assert!(checked.dispatched.is_empty());
}

#[tokio::test]
async fn overlapping_output_fails_before_dispatch() {
    let fx = Fixture::new();
    let a = fx.file("a.txt");
    let b = fx.file("b.txt");
    let fresh = fx.path("fresh.txt");

    // group 0 writes a fresh file, group 1 declares its own input as output
    let evaluator = MockEvaluator::new()
        .on("outputs", move |ns| {
            if ns.slots().index == 0 {
                Ok(json!(fresh))
            } else {
                Ok(ns.read("_input").unwrap_or(Value::Null))
            }
        })
        .on("make", write_outputs);
    let step = Step::new("convert")
        .statement(input(r#"{"group_by": "single"}"#))
        .statement(output("outputs"))
        .with_task("make");

    let err = run(
        &evaluator,
        &fx.ctx(SignatureMode::Ignore),
        &step,
        StepInput::from_files(vec![a, b.clone()]),
    )
    .await
    .unwrap_err();
    match err.root() {
        EngineError::OverlappingFiles { index, files } => {
            assert_eq!(*index, 1);
            assert_eq!(files, &vec![b]);
        }
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(evaluator.call_count("make"), 1);
    assert!(matches!(err, EngineError::Directive { directive: DirectiveKind::Output, .. }));
}

#[tokio::test]
async fn abort_in_an_action_skips_only_that_group() {
    let fx = Fixture::new();
    let files = vec![fx.file("a.txt"), fx.file("b.txt")];
    let evaluator = MockEvaluator::new().on("check", |ns| {
        if ns.slots().index == 0 {
            Err(EvalError::Abort(Some("nothing to do for a".into())))
        } else {
            Ok(Value::Null)
        }
    });
    let step = Step::new("filter")
        .statement(input(r#"{"group_by": "single"}"#))
        .statement(Statement::action("check"))
        .with_task("work");

    let result = run(
        &evaluator,
        &fx.ctx(SignatureMode::Ignore),
        &step,
        StepInput::from_files(files),
    )
    .await
    .unwrap();
    assert_eq!(result.skipped, vec![0]);
    assert_eq!(result.dispatched, vec![1]);
    assert_eq!(evaluator.call_count("work"), 1);
}

#[tokio::test]
async fn silent_abort_before_input_ends_the_step() {
    let fx = Fixture::new();
    let a = fx.file("a.txt");
    let evaluator = MockEvaluator::new().aborting("stop", None);
    let step = Step::new("early")
        .statement(Statement::assign("n", "3"))
        .statement(Statement::action("stop"))
        .statement(input("null"))
        .with_task("work")
        .shared(&["n"]);

    let result = run(
        &evaluator,
        &fx.ctx(SignatureMode::Ignore),
        &step,
        StepInput::from_files(vec![a.clone()]),
    )
    .await
    .unwrap();
    assert!(result.dispatched.is_empty());
    assert_eq!(result.input, Some(FileSet::Files(vec![a])));
    assert_eq!(result.shared["n"], json!(3));
    assert_eq!(evaluator.call_count("work"), 0);
}

#[tokio::test]
async fn for_each_dispatches_one_task_per_value() {
    let fx = Fixture::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let evaluator = MockEvaluator::new().on("work", {
        let seen = Arc::clone(&seen);
        move |ns| {
            seen.lock().unwrap().push(ns.read("_x").unwrap());
            Ok(Value::Null)
        }
    });
    let step = Step::new("sweep")
        .statement(Statement::assign("x", "[1, 2, 3]"))
        .statement(input(r#"{"for_each": "x"}"#))
        .with_task("work");

    let result = run(
        &evaluator,
        &fx.ctx(SignatureMode::Ignore),
        &step,
        StepInput::default(),
    )
    .await
    .unwrap();
    assert_eq!(result.dispatched, vec![0, 1, 2]);
    assert_eq!(*seen.lock().unwrap(), vec![json!(1), json!(2), json!(3)]);
}

#[tokio::test]
async fn active_option_selects_groups() {
    let fx = Fixture::new();
    let files: Vec<_> = ["a", "b", "c", "d"].iter().map(|n| fx.file(n)).collect();
    let evaluator = MockEvaluator::new();
    let step = Step::new("pick")
        .statement(input(r#"{"group_by": 1}"#))
        .statement(task_options(r#"{"active": [0, -1]}"#))
        .with_task("work");

    let result = run(
        &evaluator,
        &fx.ctx(SignatureMode::Ignore),
        &step,
        StepInput::from_files(files),
    )
    .await
    .unwrap();
    assert_eq!(result.dispatched, vec![0, 3]);

    let bad = Step::new("pick")
        .statement(task_options(r#"{"active": "all"}"#))
        .with_task("work");
    let err = run(&evaluator, &fx.ctx(SignatureMode::Ignore), &bad, StepInput::default())
        .await
        .unwrap_err();
    assert!(matches!(err.root(), EngineError::InvalidOption { option, .. } if option == "active"));
}

#[tokio::test]
async fn failing_tasks_are_reported_together_with_the_partial_result() {
    let fx = Fixture::new();
    let files: Vec<_> = ["a", "b", "c"].iter().map(|n| fx.file(n)).collect();
    let evaluator = MockEvaluator::new().on("work", |ns| {
        if ns.slots().index == 1 {
            Ok(Value::Null)
        } else {
            Err(EvalError::Failed("exit status 2".into()))
        }
    });
    let step = Step::new("batch")
        .statement(input(r#"{"group_by": "single"}"#))
        .with_task("work");

    let err = run(
        &evaluator,
        &fx.ctx(SignatureMode::Ignore),
        &step,
        StepInput::from_files(files),
    )
    .await
    .unwrap_err();
    let EngineError::Execution { failures, partial, .. } = err else {
        panic!("expected an execution error");
    };
    let failed: Vec<_> = failures.iter().map(|f| f.index).collect();
    assert_eq!(failed, vec![0, 2]);
    assert_eq!(partial.dispatched, vec![0, 1, 2]);
    assert_eq!(evaluator.call_count("work"), 3);
}

#[tokio::test]
async fn concurrent_tasks_run_on_the_pool() {
    let fx = Fixture::new();
    let files: Vec<_> = ["a", "b", "c"].iter().map(|n| fx.file(n)).collect();
    let threads = Arc::new(Mutex::new(Vec::new()));
    let evaluator = MockEvaluator::new().on("work", {
        let threads = Arc::clone(&threads);
        move |_| {
            threads.lock().unwrap().push(std::thread::current().id());
            Ok(Value::Null)
        }
    });
    let step = Step::new("parallel")
        .statement(input(r#"{"group_by": "single"}"#))
        .statement(task_options(r#"{"concurrent": true}"#))
        .with_task("work");
    let ctx = fx.ctx_with(ExecutorConfig {
        backend: BackendKind::Pool,
        max_jobs: 2,
        signature_mode: SignatureMode::Ignore,
        ..ExecutorConfig::default()
    });

    let result = run(&evaluator, &ctx, &step, StepInput::from_files(files))
        .await
        .unwrap();
    assert_eq!(result.dispatched, vec![0, 1, 2]);
    let threads = threads.lock().unwrap();
    assert_eq!(threads.len(), 3);
    assert!(!threads.contains(&std::thread::current().id()));
}

#[tokio::test]
async fn shared_and_alias_export_step_variables() {
    let fx = Fixture::new();
    let a = fx.file("a.txt");
    let evaluator = MockEvaluator::new();
    let step = Step::new("stats")
        .with_index(2)
        .statement(Statement::assign("total", "42"))
        .statement(Statement::assign("label", "\"run\""))
        .shared(&["total"])
        .alias("summary");

    let result = run(
        &evaluator,
        &fx.ctx(SignatureMode::Ignore),
        &step,
        StepInput::from_files(vec![a.clone()]),
    )
    .await
    .unwrap();
    assert_eq!(result.step_name, "stats_2");
    assert_eq!(result.shared.len(), 1);
    assert_eq!(result.shared["total"], json!(42));

    let (alias, info) = result.alias.unwrap();
    assert_eq!(alias, "summary");
    assert_eq!(info.step_name, "stats_2");
    assert_eq!(info.input, Some(FileSet::Files(vec![a])));
    assert_eq!(info.vars["label"], json!("run"));

    let undefined = step.clone().shared(&["nope"]);
    let err = run(&evaluator, &fx.ctx(SignatureMode::Ignore), &undefined, StepInput::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::UndefinedVariable(name) if name == "nope"));
}

#[tokio::test]
async fn declared_output_must_exist_after_the_step() {
    let fx = Fixture::new();
    let never = fx.path("never.txt");
    let evaluator = MockEvaluator::new().on("outputs", {
        let never = never.clone();
        move |_| Ok(json!(never))
    });
    let step = Step::new("lazy").statement(output("outputs")).with_task("work");

    let err = run(&evaluator, &fx.ctx(SignatureMode::Default), &step, StepInput::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::MissingOutput { target, .. } if target == never));
}

#[tokio::test]
async fn dynamic_output_is_resolved_after_the_tasks() {
    let fx = Fixture::new();
    let infile = fx.file("in.txt");
    let produced = fx.path("sample.out");
    let pattern = format!("dynamic:{}", fx.path("*.out"));
    let evaluator = MockEvaluator::new()
        .on("outputs", move |_| Ok(json!(pattern)))
        .on("make", {
            let produced = produced.clone();
            move |_| {
                std::fs::write(&produced, "x").unwrap();
                Ok(Value::Null)
            }
        });
    let step = Step::new("split").statement(output("outputs")).with_task("make");
    let ctx = fx.ctx(SignatureMode::Default);
    let seed = || StepInput::from_files(vec![infile.clone()]);

    let first = run(&evaluator, &ctx, &step, seed()).await.unwrap();
    assert_eq!(first.output, Some(FileSet::Files(vec![produced.clone()])));

    // the recorded output stands in for the undetermined one
    let second = run(&evaluator, &ctx, &step, seed()).await.unwrap();
    assert!(second.dispatched.is_empty());
    assert_eq!(second.output, Some(FileSet::Files(vec![produced])));
    assert_eq!(evaluator.call_count("make"), 1);
}

#[tokio::test]
async fn depends_accumulates_across_groups() {
    let fx = Fixture::new();
    let files = vec![fx.file("a.txt"), fx.file("b.txt")];
    let reference = fx.file("ref.fa");
    let index = fx.file("ref.fai");
    let evaluator = MockEvaluator::new().on("deps", {
        let (reference, index) = (reference.clone(), index.clone());
        move |ns| {
            Ok(if ns.slots().index == 0 {
                json!(reference)
            } else {
                json!(index)
            })
        }
    });
    let step = Step::new("align")
        .statement(input(r#"{"group_by": "single"}"#))
        .statement(Statement::directive(DirectiveKind::Depends, "deps"));

    let result = run(
        &evaluator,
        &fx.ctx(SignatureMode::Ignore),
        &step,
        StepInput::from_files(files),
    )
    .await
    .unwrap();
    assert_eq!(result.depends, Some(FileSet::Files(vec![reference, index])));

    let missing = Step::new("align")
        .statement(Statement::directive(DirectiveKind::Depends, r#""/no/such/file""#));
    let err = run(&evaluator, &fx.ctx(SignatureMode::Ignore), &missing, StepInput::default())
        .await
        .unwrap_err();
    assert!(matches!(err.root(), EngineError::MissingFile(_)));
}

#[tokio::test]
async fn configuration_errors_are_fatal() {
    let fx = Fixture::new();
    let evaluator = MockEvaluator::new();
    let ctx = fx.ctx(SignatureMode::Ignore);

    let two_inputs = Step::new("bad").statement(input("null")).statement(input("null"));
    assert!(matches!(
        run(&evaluator, &ctx, &two_inputs, StepInput::default()).await,
        Err(EngineError::MultipleInputs { .. })
    ));

    let late_input = Step::new("bad")
        .statement(output(r#""x.txt""#))
        .statement(input("null"));
    assert!(matches!(
        run(&evaluator, &ctx, &late_input, StepInput::default()).await,
        Err(EngineError::DirectiveBeforeInput { directive: DirectiveKind::Output })
    ));

    let unknown = Step::new("bad").statement(input(r#"{"sort_by": "name"}"#));
    let err = run(&evaluator, &ctx, &unknown, StepInput::default())
        .await
        .unwrap_err();
    assert!(matches!(err.root(), EngineError::UnknownOption { .. }));

    let reserved = Step::new("bad").statement(Statement::assign("output", "[]"));
    let err = run(&evaluator, &ctx, &reserved, StepInput::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Statement { source: EvalError::Reserved(_), .. }
    ));
}

#[tokio::test]
async fn undetermined_input_stops_before_running_statements() {
    let fx = Fixture::new();
    let evaluator = MockEvaluator::new();
    let step = Step::new("next")
        .statement(input("null"))
        .statement(Statement::action("work"))
        .with_task("work");
    let seed = StepInput {
        input: Some(FileSet::Undetermined("*.bam".into())),
        ..StepInput::default()
    };

    let result = run(&evaluator, &fx.ctx(SignatureMode::Default), &step, seed)
        .await
        .unwrap();
    assert!(result.input.unwrap().is_undetermined());
    assert!(result.output.unwrap().is_undetermined());
    assert_eq!(evaluator.call_count("work"), 0);
}

// ---------------------------------------------------------------------------
// Remote dispatch
// ---------------------------------------------------------------------------

/// Broker that runs each request as soon as it is enqueued.
struct InlineBroker {
    evaluator: MockEvaluator,
    requests: Mutex<Vec<TaskRequest>>,
    outcomes: Mutex<Vec<TaskOutcome>>,
}

#[async_trait]
impl Broker for InlineBroker {
    async fn enqueue(&self, request: &TaskRequest) -> Result<String, BrokerError> {
        let outcome = execute_task(&self.evaluator, request);
        self.outcomes.lock().unwrap().push(outcome);
        self.requests.lock().unwrap().push(request.clone());
        Ok(request.id.clone())
    }

    async fn fetch_result(&self, handle: &TaskHandle) -> Result<Option<TaskOutcome>, BrokerError> {
        Ok(self
            .outcomes
            .lock()
            .unwrap()
            .iter()
            .find(|o| o.task_id == handle.task_id && o.index == handle.index)
            .cloned())
    }
}

#[tokio::test]
async fn remote_requests_carry_only_the_variables_the_step_uses() {
    let fx = Fixture::new();
    let files = vec![fx.file("a.txt"), fx.file("b.txt")];
    let broker = Arc::new(InlineBroker {
        evaluator: MockEvaluator::new(),
        requests: Mutex::default(),
        outcomes: Mutex::default(),
    });
    let evaluator = MockEvaluator::new();
    let step = Step::new("remote")
        .statement(input(r#"{"group_by": "single"}"#))
        .statement(Statement::assign("level", "9"))
        .statement(task_options(r#"{"tags": ["nightly"]}"#))
        .with_task("gzip -level $level");
    let ctx = fx.ctx_with(ExecutorConfig {
        backend: BackendKind::Remote,
        signature_mode: SignatureMode::Ignore,
        ..ExecutorConfig::default()
    });
    let seed = StepInput {
        vars: [
            ("genome".to_string(), json!("hg38")),
            ("unused".to_string(), json!([1, 2, 3])),
        ]
        .into_iter()
        .collect(),
        ..StepInput::from_files(files.clone())
    };

    let result = StepExecutor::new(Arc::new(evaluator.clone()))
        .with_broker(broker.clone())
        .run(&ctx, &step, seed)
        .await
        .unwrap();
    assert_eq!(result.dispatched, vec![0, 1]);

    let requests = broker.requests.lock().unwrap();
    assert_eq!(requests.len(), 2);
    let request = &requests[1];
    assert_eq!(request.index, 1);
    assert_eq!(request.tags, vec!["nightly"]);
    assert_eq!(request.namespace.vars.get("level"), Some(&json!(9)));
    assert!(request.namespace.vars.contains_key("step_name"));
    assert!(!request.namespace.vars.contains_key("unused"));
    assert!(!request.namespace.vars.contains_key("genome"));
    assert_eq!(
        request.namespace.slots.step_input,
        Some(FileSet::Files(vec![files[1].clone()]))
    );
    assert_ne!(requests[0].id, requests[1].id);
}

#[tokio::test]
async fn remote_backend_needs_a_broker() {
    let fx = Fixture::new();
    let ctx = fx.ctx_with(ExecutorConfig {
        backend: BackendKind::Remote,
        ..ExecutorConfig::default()
    });
    let step = Step::new("remote").with_task("work");
    let err = run(&MockEvaluator::new(), &ctx, &step, StepInput::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::MissingBroker));
}
