//! Step execution engine.
//!
//! `StepExecutor` runs one step:
//! 1. Seeds a fresh namespace from the previous step's output.
//! 2. Runs the statements before the input directive, then splits the
//!    input into work groups.
//! 3. For each group, runs the remaining statements; output directives
//!    consult the signature store, which may satisfy the group without
//!    running it.
//! 4. Dispatches the trailing task of every active group, awaits all of
//!    them, resolves late output, writes signatures and checks that every
//!    declared output exists.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use dispatch::{
    BackendKind, Broker, DispatchBackend, Interrupt, LocalPool, RemoteQueue, SyncBackend,
    TaskRequest,
};
use eval::{is_reserved, EvalError, Evaluator, FileSet, FileTarget, Namespace, Target};
use serde_json::Value;
use signatures::{SignatureHandle, SignatureMode, SignatureStore};
use tracing::{debug, error, info, instrument, warn};

use crate::error::{short_repr, TaskFailure};
use crate::files::{create_parent_dirs, expand_file_list, Missing};
use crate::input::{process_input, InputOptions, ProcessedInput, WorkGroup};
use crate::models::{DirectiveKind, Statement, Step, StepInfo, StepInput, StepResult, TaskOptions};
use crate::{EngineError, ExecutionContext};

// ---------------------------------------------------------------------------
// StepExecutor
// ---------------------------------------------------------------------------

/// Runs steps against one evaluator.
///
/// Construct one per process and call [`StepExecutor::run`] for every step;
/// no state is kept between runs.
pub struct StepExecutor {
    evaluator: Arc<dyn Evaluator>,
    broker: Option<Arc<dyn Broker>>,
    interrupt: Interrupt,
}

impl StepExecutor {
    pub fn new(evaluator: Arc<dyn Evaluator>) -> Self {
        Self {
            evaluator,
            broker: None,
            interrupt: Interrupt::new(),
        }
    }

    /// Broker used when the configured backend is [`BackendKind::Remote`].
    pub fn with_broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// Run `step` and return its result record.
    ///
    /// # Errors
    /// Configuration and data errors abort the step immediately. Failing
    /// tasks are collected and reported together as
    /// [`EngineError::Execution`], which also carries the partial result.
    #[instrument(skip(self, ctx, step, input), fields(step = %step.step_name(), run_id = %ctx.run_id))]
    pub async fn run(
        &self,
        ctx: &ExecutionContext,
        step: &Step,
        input: StepInput,
    ) -> Result<StepResult, EngineError> {
        StepRun::new(self, ctx, step, input).execute().await
    }

    /// Backend for this step. A pool is only worth it for a concurrent task
    /// spread over several groups.
    fn backend_for(
        &self,
        ctx: &ExecutionContext,
        options: &TaskOptions,
        groups: usize,
    ) -> Result<(BackendKind, Box<dyn DispatchBackend>), EngineError> {
        let config = &ctx.config;
        match config.backend {
            BackendKind::Remote => {
                let broker = self.broker.clone().ok_or(EngineError::MissingBroker)?;
                let queue = RemoteQueue::new(broker, config.remote.clone())
                    .with_interrupt(self.interrupt.clone());
                Ok((BackendKind::Remote, Box::new(queue)))
            }
            BackendKind::Pool if options.concurrent && config.max_jobs > 1 && groups > 1 => {
                let pool = LocalPool::new(Arc::clone(&self.evaluator), config.max_jobs)
                    .with_interrupt(self.interrupt.clone());
                Ok((BackendKind::Pool, Box::new(pool)))
            }
            _ => Ok((
                BackendKind::Sync,
                Box::new(SyncBackend::new(Arc::clone(&self.evaluator))),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// One step invocation
// ---------------------------------------------------------------------------

enum GroupFlow {
    Next,
    /// Inputs are not knowable yet; stop the step with what we have.
    Stop,
}

struct StepRun<'a> {
    executor: &'a StepExecutor,
    ctx: &'a ExecutionContext,
    step: &'a Step,
    step_name: String,
    ns: Namespace,
    /// `None` when signatures are ignored.
    store: Option<SignatureStore>,
    signature_vars: BTreeSet<String>,
    /// Reads made up to and including input resolution.
    base_vars: BTreeSet<String>,
    /// Reads made while running the current group.
    group_reads: BTreeSet<String>,
    /// Identifiers named by the statements after the input directive and
    /// by the task.
    mentioned: BTreeSet<String>,
    /// Names assigned after the input directive.
    body_assigned: BTreeSet<String>,
    handles: Vec<SignatureHandle>,
    backend: Option<(BackendKind, Box<dyn DispatchBackend>)>,
    dispatched: Vec<usize>,
    skipped: Vec<usize>,
    errors: Vec<String>,
}

/// `output` and `depends` grow across groups; re-declaring the same set
/// leaves them unchanged.
fn accumulate(slot: &mut Option<FileSet>, files: &FileSet) {
    if let (Some(FileSet::Files(existing)), FileSet::Files(new)) = (slot.as_mut(), files) {
        if existing != new {
            existing.extend(new.iter().cloned());
        }
        return;
    }
    *slot = Some(files.clone());
}

fn no_options(kind: DirectiveKind, options: &BTreeMap<String, Value>) -> Result<(), EngineError> {
    match options.keys().next() {
        Some(option) => Err(EngineError::UnknownOption {
            directive: kind,
            option: option.clone(),
        }),
        None => Ok(()),
    }
}

/// Identifier-like words of `text`.
fn identifiers(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| !(c == '_' || c.is_ascii_alphanumeric()))
        .filter(|w| !w.is_empty())
}

/// Identifiers mentioned by the body statements and the task, and the names
/// the body assigns.
fn body_names(body: &[Statement], task: Option<&str>) -> (BTreeSet<String>, BTreeSet<String>) {
    let mut mentioned = BTreeSet::new();
    let mut assigned = BTreeSet::new();
    for statement in body {
        let text = match statement {
            Statement::Assignment { name, expr } => {
                assigned.insert(name.clone());
                expr
            }
            Statement::Action { script } => script,
            Statement::Directive { args, .. } => args,
        };
        mentioned.extend(identifiers(text).map(str::to_owned));
    }
    if let Some(task) = task {
        mentioned.extend(identifiers(task).map(str::to_owned));
    }
    (mentioned, assigned)
}

fn compact(text: &str) -> String {
    text.split_whitespace().collect()
}

/// Whitespace-free text of the statements after the input directive plus
/// the task. Directives do not contribute.
fn step_tokens(body: &[Statement], task: Option<&str>) -> String {
    let mut tokens = String::new();
    for statement in body {
        match statement {
            Statement::Assignment { name, expr } => {
                tokens.push_str(name);
                tokens.push('=');
                tokens.push_str(&compact(expr));
            }
            Statement::Action { script } => tokens.push_str(&compact(script)),
            Statement::Directive { .. } => {}
        }
    }
    if let Some(task) = task {
        tokens.push_str(&compact(task));
    }
    tokens
}

fn describe(files: &Option<FileSet>) -> String {
    match files {
        None => "none".into(),
        Some(FileSet::Undetermined(text)) => format!("undetermined ({})", short_repr(text)),
        Some(FileSet::Files(files)) => short_repr(&files.join(", ")),
    }
}

impl<'a> StepRun<'a> {
    fn new(
        executor: &'a StepExecutor,
        ctx: &'a ExecutionContext,
        step: &'a Step,
        input: StepInput,
    ) -> Self {
        let step_name = step.step_name();
        let mut ns = Namespace::new();
        for (name, value) in input.vars {
            if is_reserved(&name) {
                warn!("ignoring seed variable {name}: the name is reserved");
                continue;
            }
            ns.bind(name, value);
        }
        ns.bind("step_name", Value::from(step_name.clone()));

        let slots = ns.slots_mut();
        slots.input = input.input.clone();
        slots.step_input = input.input;
        slots.output = input.default_output.clone();
        slots.step_output = input.default_output;
        slots.depends = None;
        slots.step_depends = None;
        slots.index = 0;

        let store = match ctx.config.signature_mode {
            SignatureMode::Ignore => None,
            _ => Some(SignatureStore::new(&ctx.config.signature_dir)),
        };

        Self {
            executor,
            ctx,
            step,
            step_name,
            ns,
            store,
            signature_vars: BTreeSet::new(),
            base_vars: BTreeSet::new(),
            group_reads: BTreeSet::new(),
            mentioned: BTreeSet::new(),
            body_assigned: BTreeSet::new(),
            handles: Vec::new(),
            backend: None,
            dispatched: Vec::new(),
            skipped: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn evaluator(&self) -> &'a dyn Evaluator {
        self.executor.evaluator.as_ref()
    }

    /// Fold the evaluator's recorded reads into the signature variables.
    fn track_reads(&mut self) {
        let reads = self.ns.take_accessed();
        for name in reads.into_iter().filter(|name| !is_reserved(name)) {
            self.group_reads.insert(name.clone());
            self.signature_vars.insert(name);
        }
    }

    async fn execute(mut self) -> Result<StepResult, EngineError> {
        let step = self.step;
        info!("Executing step {}", self.step_name);

        let inputs: Vec<(usize, &str)> = step
            .statements
            .iter()
            .enumerate()
            .filter_map(|(i, s)| match s {
                Statement::Directive {
                    kind: DirectiveKind::Input,
                    args,
                } => Some((i, args.as_str())),
                _ => None,
            })
            .collect();
        if inputs.len() > 1 {
            return Err(EngineError::MultipleInputs {
                step: self.step_name.clone(),
            });
        }

        let (body, groups) = match inputs.first() {
            Some(&(at, text)) => {
                for statement in &step.statements[..at] {
                    if !self.run_before_input(statement)? {
                        return self.collect(true);
                    }
                }
                debug!("input:    {}", short_repr(text));
                let processed = self
                    .resolve_input(text)
                    .map_err(|e| EngineError::directive(DirectiveKind::Input, text, e))?;
                (&step.statements[at + 1..], processed.groups)
            }
            None => {
                let files = self.ns.slots().input.clone().unwrap_or_else(FileSet::empty);
                (&step.statements[..], vec![WorkGroup::new(files)])
            }
        };
        info!("input:    {}", describe(&self.ns.slots().input));

        let tokens = step_tokens(body, step.task.as_deref());
        self.base_vars = self.signature_vars.clone();
        (self.mentioned, self.body_assigned) = body_names(body, step.task.as_deref());
        let total = groups.len();
        for (index, group) in groups.into_iter().enumerate() {
            if let GroupFlow::Stop = self.run_group(index, total, &group, body, &tokens).await? {
                return self.collect(true);
            }
        }

        self.await_tasks().await?;
        self.resolve_late_output()?;
        self.write_signatures();
        info!("output:   {}", describe(&self.ns.slots().output));
        self.verify_output()?;
        self.collect(true)
    }

    /// Statements ahead of the input directive. Returns `false` when an
    /// abort ends the step early.
    fn run_before_input(&mut self, statement: &Statement) -> Result<bool, EngineError> {
        match statement {
            Statement::Assignment { name, expr } => self.assign(name, expr)?,
            Statement::Directive { kind, .. } => {
                return Err(EngineError::DirectiveBeforeInput { directive: *kind })
            }
            Statement::Action { script } => {
                let result = self.evaluator().exec(script, &mut self.ns);
                self.track_reads();
                match result {
                    Ok(_) => {}
                    Err(EvalError::Abort(message)) => {
                        if let Some(message) = message {
                            warn!("{message}");
                        }
                        return Ok(false);
                    }
                    Err(e) => return Err(EngineError::statement(script, e)),
                }
            }
        }
        Ok(true)
    }

    fn assign(&mut self, name: &str, expr: &str) -> Result<(), EngineError> {
        let text = format!("{name} = {expr}");
        let value = self.evaluator().eval(expr, &mut self.ns);
        self.track_reads();
        let value = value.map_err(|e| EngineError::statement(&text, e))?;
        self.ns
            .assign(name, value)
            .map_err(|e| EngineError::statement(&text, e))
    }

    fn resolve_input(&mut self, text: &str) -> Result<ProcessedInput, EngineError> {
        let args = self.evaluator().eval_args(text, &mut self.ns);
        self.track_reads();
        let args = args?;
        let options = InputOptions::from_options(&args.options)?;

        let files = if args.args.is_empty() {
            self.ns.slots().input.clone().unwrap_or_else(FileSet::empty)
        } else {
            FileSet::Files(expand_file_list(&args.args, Missing::Error)?)
        };
        let processed = process_input(&files, &options, &mut self.ns)?;
        self.track_reads();

        let slots = self.ns.slots_mut();
        slots.input = Some(processed.input.clone());
        slots.step_input = Some(processed.input.clone());
        if processed.input.is_undetermined() {
            slots.output = Some(FileSet::Undetermined(text.to_owned()));
        }
        Ok(processed)
    }

    // -----------------------------------------------------------------------
    // Per-group loop
    // -----------------------------------------------------------------------

    async fn run_group(
        &mut self,
        index: usize,
        total: usize,
        group: &WorkGroup,
        body: &[Statement],
        tokens: &str,
    ) -> Result<GroupFlow, EngineError> {
        self.group_reads.clear();
        for (name, value) in &group.bindings {
            self.ns.bind(name.clone(), value.clone());
        }
        {
            let slots = self.ns.slots_mut();
            slots.step_input = Some(group.files.clone());
            slots.index = index;
        }
        if self.ctx.verbosity > 1 {
            info!("_input:   {}", describe(&Some(group.files.clone())));
        } else {
            debug!("_input:   {}", describe(&Some(group.files.clone())));
        }

        let mut options = TaskOptions::default();
        let mut skip = false;
        for statement in body {
            if group.is_undetermined() && !statement.is_directive() {
                debug!("input of {} is not determined yet", self.step_name);
                return Ok(GroupFlow::Stop);
            }
            match statement {
                Statement::Assignment { name, expr } => self.assign(name, expr)?,
                Statement::Directive { kind, args } => {
                    match self.directive(*kind, args, index, group, tokens, &mut options) {
                        Ok(true) => {
                            skip = true;
                            break;
                        }
                        Ok(false) => {}
                        Err(e) if group.is_undetermined() => {
                            debug!("{kind} directive deferred: {e}");
                            return Ok(GroupFlow::Stop);
                        }
                        Err(e) => return Err(EngineError::directive(*kind, args, e)),
                    }
                }
                Statement::Action { script } => {
                    let result = self.evaluator().exec(script, &mut self.ns);
                    self.track_reads();
                    match result {
                        Ok(_) => {}
                        Err(EvalError::Abort(message)) => {
                            if let Some(message) = message {
                                warn!("{message}");
                            }
                            skip = true;
                            break;
                        }
                        Err(e) => return Err(EngineError::statement(script, e)),
                    }
                }
            }
        }

        if skip {
            self.skipped.push(index);
            return Ok(GroupFlow::Next);
        }
        let step = self.step;
        let Some(task) = step.task.as_deref() else {
            return Ok(GroupFlow::Next);
        };
        if group.is_undetermined() {
            return Ok(GroupFlow::Stop);
        }
        if let Some(active) = &options.active {
            if !active.allows(index, total) {
                debug!("group {index} of {} is not active", self.step_name);
                return Ok(GroupFlow::Next);
            }
        }
        self.dispatch(task, index, total, group, &options).await?;
        Ok(GroupFlow::Next)
    }

    /// Returns `true` when the group is already satisfied by its signature.
    fn directive(
        &mut self,
        kind: DirectiveKind,
        text: &str,
        index: usize,
        group: &WorkGroup,
        tokens: &str,
        options: &mut TaskOptions,
    ) -> Result<bool, EngineError> {
        let args = self.evaluator().eval_args(text, &mut self.ns);
        self.track_reads();
        let args = args?;

        match kind {
            DirectiveKind::Input => Err(EngineError::MultipleInputs {
                step: self.step_name.clone(),
            }),
            DirectiveKind::Task => {
                if !args.args.is_empty() {
                    return Err(EngineError::UnexpectedArguments { directive: kind });
                }
                *options = TaskOptions::from_options(&args.options)?;
                if let Some(queue) = &options.queue {
                    debug!("task of group {index} requests queue {queue}");
                }
                Ok(false)
            }
            DirectiveKind::Depends => {
                no_options(kind, &args.options)?;
                let files = FileSet::Files(expand_file_list(&args.args, Missing::Error)?);
                let slots = self.ns.slots_mut();
                slots.step_depends = Some(files.clone());
                accumulate(&mut slots.depends, &files);
                Ok(false)
            }
            DirectiveKind::Output => {
                no_options(kind, &args.options)?;
                let output = if args.has_dynamic() {
                    FileSet::Undetermined(text.to_owned())
                } else {
                    FileSet::Files(expand_file_list(&args.args, Missing::Keep)?)
                };
                self.declare_output(index, group, output, tokens)
            }
        }
    }

    fn declare_output(
        &mut self,
        index: usize,
        group: &WorkGroup,
        output: FileSet,
        tokens: &str,
    ) -> Result<bool, EngineError> {
        if let (Some(inputs), Some(outputs)) = (group.files.files(), output.files()) {
            let overlap: Vec<String> = outputs
                .iter()
                .filter(|f| inputs.contains(f))
                .cloned()
                .collect();
            if !overlap.is_empty() {
                return Err(EngineError::OverlappingFiles {
                    index,
                    files: overlap,
                });
            }
        }
        if let Some(files) = output.files() {
            create_parent_dirs(files)?;
        }
        {
            let slots = self.ns.slots_mut();
            slots.step_output = Some(output.clone());
            accumulate(&mut slots.output, &output);
        }

        let (Some(store), Some(inputs)) = (&self.store, group.files.files()) else {
            return Ok(false);
        };
        let vars = self.group_signature_vars();
        let content = self.signature_content(&vars, tokens);
        let scope = format!("{}:{index}", self.step_name);
        let mut handle = store.open(
            &scope,
            &content,
            inputs,
            &output,
            self.ns.slots().step_depends.as_ref(),
        );
        self.signature_vars.extend(vars);

        let satisfied = match self.ctx.config.signature_mode {
            SignatureMode::Default => match store.validate(&handle)? {
                Some(record) => {
                    if output.is_undetermined() {
                        let recorded = FileSet::Files(record.output_files());
                        handle.set_output(recorded.clone());
                        let slots = self.ns.slots_mut();
                        slots.step_output = Some(recorded.clone());
                        if matches!(slots.output, Some(FileSet::Undetermined(_))) {
                            slots.output = None;
                        }
                        accumulate(&mut slots.output, &recorded);
                    }
                    info!("Step {} (index={index}) is ignored due to saved signature", self.step_name);
                    true
                }
                None => false,
            },
            SignatureMode::Assert => {
                if store.validate(&handle)?.is_none() {
                    return Err(EngineError::SignatureMismatch { index });
                }
                false
            }
            SignatureMode::Construct => {
                let written = store.write(&handle)?;
                if written {
                    info!("Step {} (index={index}) is ignored with signature constructed", self.step_name);
                }
                written
            }
            SignatureMode::Ignore => false,
        };
        self.handles.push(handle);
        Ok(satisfied)
    }

    /// Variables whose values enter the signature of the current group:
    /// the reads before the body, the reads of this group so far and the
    /// defined names the body or the task mention. Names the body assigns
    /// are derived from the others and left out.
    fn group_signature_vars(&self) -> BTreeSet<String> {
        let mut vars: BTreeSet<String> = self.base_vars.union(&self.group_reads).cloned().collect();
        vars.extend(
            self.ns
                .names()
                .filter(|n| self.mentioned.contains(*n))
                .map(str::to_owned),
        );
        vars.retain(|n| !self.body_assigned.contains(n) && !is_reserved(n));
        vars
    }

    /// `name = value` lines of `vars`, then the step tokens.
    fn signature_content(&self, vars: &BTreeSet<String>, tokens: &str) -> String {
        let mut content = String::new();
        for name in vars {
            if let Some(value) = self.ns.get(name) {
                content.push_str(&format!("{name} = {value}\n"));
            }
        }
        content.push_str("---\n");
        content.push_str(tokens);
        content
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Variables a worker may need: everything read so far, everything the
    /// step assigns, the group bindings and names mentioned by the task.
    fn task_variables(&self, task: &str, group: &WorkGroup) -> BTreeSet<String> {
        let mentioned: BTreeSet<&str> = identifiers(task).collect();
        let mut names = self.signature_vars.clone();
        names.extend(self.assigned_names());
        names.extend(group.bindings.keys().cloned());
        names.extend(
            self.ns
                .names()
                .filter(|n| mentioned.contains(n))
                .map(str::to_owned),
        );
        names.insert("step_name".into());
        names
    }

    fn assigned_names(&self) -> impl Iterator<Item = String> + 'a {
        let step: &'a Step = self.step;
        step.statements.iter().filter_map(|s| match s {
            Statement::Assignment { name, .. } => Some(name.clone()),
            _ => None,
        })
    }

    async fn dispatch(
        &mut self,
        task: &str,
        index: usize,
        total: usize,
        group: &WorkGroup,
        options: &TaskOptions,
    ) -> Result<(), EngineError> {
        if self.backend.is_none() {
            let (kind, mut backend) = self.executor.backend_for(self.ctx, options, total)?;
            backend.prepare(total);
            debug!("dispatching {} through the {} backend", self.step_name, backend.name());
            self.backend = Some((kind, backend));
        }

        let snapshot = match self.backend.as_ref().map(|(kind, _)| *kind) {
            Some(BackendKind::Sync) | None => self.ns.snapshot_all(),
            Some(_) => {
                let names = self.task_variables(task, group);
                self.ns.snapshot(names.iter().map(String::as_str))
            }
        };
        let request = TaskRequest::new(task, self.step.global_def.as_str(), snapshot)
            .with_tags(options.tags.clone())
            .with_workdir(options.workdir.clone());

        if let Some((_, backend)) = self.backend.as_mut() {
            let handle = backend.submit(request).await?;
            debug!("group {index} submitted as task {}", handle.task_id);
        }
        self.dispatched.push(index);
        Ok(())
    }

    async fn await_tasks(&mut self) -> Result<(), EngineError> {
        let Some((_, backend)) = self.backend.as_mut() else {
            return Ok(());
        };
        let outcomes = backend.await_all().await?;

        let failures: Vec<TaskFailure> = outcomes
            .iter()
            .filter(|o| !o.succeeded())
            .map(|o| TaskFailure {
                index: o.index,
                task_id: o.task_id.clone(),
                ret_code: o.ret_code,
                message: o.error.clone().unwrap_or_default(),
            })
            .collect();
        for outcome in outcomes.iter().filter(|o| o.skipped) {
            debug!("task {} of group {} stopped itself", outcome.task_id, outcome.index);
        }
        if failures.is_empty() {
            return Ok(());
        }

        for failure in &failures {
            error!(
                "task {} of group {} failed with {}: {}",
                failure.task_id, failure.index, failure.ret_code, failure.message
            );
        }
        Err(EngineError::Execution {
            step: self.step_name.clone(),
            failures,
            partial: Box::new(self.collect(false)?),
        })
    }

    // -----------------------------------------------------------------------
    // Completion
    // -----------------------------------------------------------------------

    /// Output that could only be known after the tasks ran.
    fn resolve_late_output(&mut self) -> Result<(), EngineError> {
        let Some(FileSet::Undetermined(text)) = self.ns.slots().output.clone() else {
            return Ok(());
        };
        let resolved = self
            .evaluator()
            .eval_args(&text, &mut self.ns)
            .map_err(EngineError::from)
            .and_then(|args| expand_file_list(&args.args, Missing::Keep))
            .map_err(|e| EngineError::directive(DirectiveKind::Output, &text, e))?;
        self.track_reads();

        let resolved = FileSet::Files(resolved);
        self.ns.slots_mut().output = Some(resolved.clone());
        for handle in &mut self.handles {
            handle.set_output(resolved.clone());
        }
        Ok(())
    }

    /// Failing to persist one signature does not affect the others.
    fn write_signatures(&mut self) {
        let Some(store) = &self.store else {
            return;
        };
        for handle in &self.handles {
            match store.write(handle) {
                Ok(true) => {}
                Ok(false) => debug!("signature {} not written", handle.key()),
                Err(e) => {
                    warn!("failed to write signature {}: {e}", handle.key());
                    self.errors.push(e.to_string());
                }
            }
        }
    }

    fn verify_output(&self) -> Result<(), EngineError> {
        match &self.ns.slots().output {
            Some(FileSet::Undetermined(_)) => {
                Err(EngineError::UndeterminedOutput(self.step_name.clone()))
            }
            Some(FileSet::Files(files)) => {
                for file in files {
                    if !FileTarget::new(file).exists() {
                        return Err(EngineError::MissingOutput {
                            step: self.step_name.clone(),
                            target: file.clone(),
                        });
                    }
                }
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// The result record. With `strict`, an undefined shared variable is
    /// an error; otherwise it is left out.
    fn collect(&self, strict: bool) -> Result<StepResult, EngineError> {
        let slots = self.ns.slots();
        let mut shared = BTreeMap::new();
        for name in &self.step.options.shared {
            match self.ns.get(name) {
                Some(value) => {
                    shared.insert(name.clone(), value);
                }
                None if strict => return Err(EngineError::UndefinedVariable(name.clone())),
                None => {}
            }
        }

        let alias = self.step.options.alias.as_ref().map(|alias| {
            let vars = self
                .assigned_names()
                .filter_map(|name| self.ns.get(&name).map(|value| (name, value)))
                .collect();
            let info = StepInfo {
                step_name: self.step_name.clone(),
                input: slots.input.clone(),
                output: slots.output.clone(),
                depends: slots.depends.clone(),
                vars,
            };
            (alias.clone(), info)
        });

        Ok(StepResult {
            step_name: self.step_name.clone(),
            input: slots.input.clone(),
            output: slots.output.clone(),
            depends: slots.depends.clone(),
            shared,
            alias,
            errors: self.errors.clone(),
            dispatched: self.dispatched.clone(),
            skipped: self.skipped.clone(),
            signature_vars: self.signature_vars.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulation_is_idempotent() {
        let a = FileSet::Files(vec!["a".into()]);
        let b = FileSet::Files(vec!["b".into()]);
        let mut slot = None;
        accumulate(&mut slot, &a);
        accumulate(&mut slot, &a);
        assert_eq!(slot, Some(a.clone()));
        accumulate(&mut slot, &b);
        assert_eq!(slot, Some(FileSet::Files(vec!["a".into(), "b".into()])));

        let mut undetermined = Some(FileSet::Undetermined("x".into()));
        accumulate(&mut undetermined, &a);
        assert_eq!(undetermined, Some(a));
    }

    #[test]
    fn tokens_skip_directives_and_whitespace() {
        let body = vec![
            Statement::assign("n", "  [1, 2]"),
            Statement::directive(DirectiveKind::Output, "\"out.txt\""),
            Statement::action("touch   out.txt"),
        ];
        assert_eq!(step_tokens(&body, Some("cat out.txt")), "n=[1,2]touchout.txtcatout.txt");
    }
}
