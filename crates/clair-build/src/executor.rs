//! Parallel execution of a build graph
//!
//! One coordinator (the calling thread) owns every piece of scheduling state
//! and the dependency indices. Work runs on a fixed-size rayon pool; each job
//! reports back over a channel. The coordinator never has more jobs in flight
//! than the pool has threads, so a ready node always starts immediately.
//!
//! Compile nodes of a target may start before its upstream targets finish.
//! The produce node waits for its own compiles and for every upstream target
//! to succeed.

use crate::build_order::BuildGraph;
use crate::cache::{DependencyIndex, DependencyRecord, IndexStore, ProductRecord};
use crate::error::{BuildError, BuildResult};
use crate::report::{BuildReport, TargetReport, TargetStatus};
use crate::targets::{CompileUnit, ProduceStep, TargetPlan};
use crate::toolchain::{Invocation, ToolRunner};
use crate::tracker::{DependencyTracker, Staleness};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::collections::{BTreeSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

/// Completion notice sent from a worker
enum Message {
    Compiled {
        target: usize,
        unit: usize,
        result: BuildResult<()>,
        record: Option<DependencyRecord>,
    },
    Produced {
        target: usize,
        result: BuildResult<()>,
    },
}

/// Runs the selected targets of a graph
///
/// When the timeout expires, `run` returns without waiting for subprocesses
/// already started; they finish on the worker threads and their results are
/// dropped. Their objects may still be written after the report is returned.
/// Every unfinished target loses its produce record, so the next build
/// produces it again.
pub struct Executor<'g> {
    graph: &'g BuildGraph,
    runner: Arc<dyn ToolRunner>,
    root: PathBuf,
    jobs: usize,
    timeout: Option<Duration>,
}

impl<'g> Executor<'g> {
    pub fn new(graph: &'g BuildGraph, runner: Arc<dyn ToolRunner>, root: impl Into<PathBuf>) -> Self {
        Self {
            graph,
            runner,
            root: root.into(),
            jobs: 1,
            timeout: None,
        }
    }

    /// Maximum number of concurrent subprocesses
    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Build `selected` (declaration indices, closed under upstream edges)
    pub fn run(&self, selected: &BTreeSet<usize>) -> BuildResult<BuildReport> {
        let start = Instant::now();
        let pool = ThreadPoolBuilder::new()
            .num_threads(self.jobs)
            .thread_name(|i| format!("clair-worker-{i}"))
            .build()
            .map_err(|e| BuildError::WorkerPool(e.to_string()))?;
        let (tx, rx) = mpsc::channel();

        let mut run = Run::new(self, selected);
        run.check_all();

        let deadline = self.timeout.map(|after| (start + after, after));
        loop {
            run.advance(&pool, &tx);
            if run.in_flight == 0 {
                break;
            }

            let message = match deadline {
                Some((deadline, after)) => {
                    match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                        Ok(message) => message,
                        Err(RecvTimeoutError::Timeout) => {
                            run.time_out(after);
                            break;
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match rx.recv() {
                    Ok(message) => message,
                    Err(_) => break,
                },
            };
            run.handle(message);
        }

        if run.store.flush_all().is_err() {
            log::warn!("some dependency indices were not saved; their sources will recompile");
        }

        Ok(run.into_report(start.elapsed()))
    }
}

#[derive(Debug, Default)]
struct TargetState {
    selected: bool,
    index_path: PathBuf,
    /// Stale units not yet dispatched
    pending: VecDeque<usize>,
    /// Compiles in flight
    running: usize,
    /// Whether any compile was dispatched
    compiled: bool,
    producing: bool,
    status: Option<TargetStatus>,
    error: Option<BuildError>,
    blocked_by: Option<String>,
    started: Option<Instant>,
    elapsed: Duration,
}

impl TargetState {
    fn is_active(&self) -> bool {
        self.selected && self.status.is_none()
    }
}

/// Mutable state of one execution, owned by the coordinator
struct Run<'e, 'g> {
    exec: &'e Executor<'g>,
    tracker: DependencyTracker,
    store: IndexStore,
    states: Vec<TargetState>,
    in_flight: usize,
}

impl<'e, 'g> Run<'e, 'g> {
    fn new(exec: &'e Executor<'g>, selected: &BTreeSet<usize>) -> Self {
        let states = exec
            .graph
            .targets()
            .iter()
            .map(|node| TargetState {
                selected: selected.contains(&node.index),
                index_path: DependencyIndex::path_for(&node.target.deps_dir, &node.target.module),
                ..Default::default()
            })
            .collect();

        Self {
            exec,
            tracker: DependencyTracker::new(&exec.root),
            store: IndexStore::new(&exec.root),
            states,
            in_flight: 0,
        }
    }

    /// Queue the stale units of every selected target
    fn check_all(&mut self) {
        let graph = self.exec.graph;
        for &i in graph.order() {
            if !self.states[i].is_active() {
                continue;
            }
            let node = graph.node(i);
            let name = node.qualified_name();
            let index = self.store.index(&self.states[i].index_path);

            match self.tracker.check_target(&name, &node.plan, index) {
                Ok(verdicts) => {
                    for (unit, verdict) in verdicts.iter().enumerate() {
                        if let Staleness::Stale(reason) = verdict {
                            log::debug!(
                                "[{name}] {} is stale: {reason}",
                                node.plan.units[unit].source.display()
                            );
                            self.states[i].pending.push_back(unit);
                        }
                    }
                }
                Err(e) => self.fail(i, e),
            }
        }
    }

    /// Dispatch everything ready and settle targets that need no work
    fn advance(&mut self, pool: &ThreadPool, tx: &Sender<Message>) {
        let graph = self.exec.graph;
        loop {
            let mut progressed = false;

            for &i in graph.order() {
                if !self.states[i].is_active() || self.states[i].producing {
                    continue;
                }

                while self.in_flight < self.exec.jobs {
                    let Some(unit) = self.states[i].pending.pop_front() else { break };
                    self.dispatch_compile(i, unit, pool, tx);
                    progressed = true;
                }

                let state = &self.states[i];
                if !state.pending.is_empty() || state.running > 0 {
                    continue;
                }

                let upstream = &graph.node(i).upstream;
                if upstream.iter().any(|&u| self.states[u].status.is_none()) {
                    continue;
                }
                if let Some(&bad) = upstream
                    .iter()
                    .find(|&&u| self.states[u].status.is_some_and(|s| !s.is_success()))
                {
                    let cause = self.states[bad]
                        .blocked_by
                        .clone()
                        .unwrap_or_else(|| graph.node(bad).qualified_name());
                    self.block(i, &cause);
                    progressed = true;
                    continue;
                }

                if self.needs_produce(i) {
                    if self.in_flight < self.exec.jobs {
                        self.dispatch_produce(i, pool, tx);
                        progressed = true;
                    }
                } else {
                    self.finish(i, TargetStatus::Skipped);
                    progressed = true;
                }
            }

            if !progressed {
                return;
            }
        }
    }

    fn dispatch_compile(&mut self, target: usize, unit: usize, pool: &ThreadPool, tx: &Sender<Message>) {
        let node = self.exec.graph.node(target);
        let name = node.qualified_name();
        let job = node.plan.units[unit].clone();
        let runner = Arc::clone(&self.exec.runner);
        let tracker = self.tracker.clone();
        let root = self.exec.root.clone();
        let tx = tx.clone();

        // objects are about to change, so the old output no longer matches them
        if !self.states[target].compiled {
            let index_path = self.states[target].index_path.clone();
            self.store.forget_product(&index_path, &name);
        }

        let state = &mut self.states[target];
        state.running += 1;
        state.compiled = true;
        state.started.get_or_insert_with(Instant::now);
        self.in_flight += 1;

        pool.spawn(move || {
            let result = compile(&root, runner.as_ref(), &name, &job);
            let record = tracker.snapshot(&job, result.is_ok());
            // the coordinator may have stopped listening after a timeout
            let _ = tx.send(Message::Compiled {
                target,
                unit,
                result,
                record,
            });
        });
    }

    fn dispatch_produce(&mut self, target: usize, pool: &ThreadPool, tx: &Sender<Message>) {
        let node = self.exec.graph.node(target);
        let name = node.qualified_name();
        let plan = node.plan.clone();
        let runner = Arc::clone(&self.exec.runner);
        let root = self.exec.root.clone();
        let tx = tx.clone();

        log::info!("[{name}] producing {} ({})", plan.output.display(), plan.recipe);

        let state = &mut self.states[target];
        state.producing = true;
        state.started.get_or_insert_with(Instant::now);
        self.in_flight += 1;

        pool.spawn(move || {
            let result = produce(&root, runner.as_ref(), &name, &plan);
            let _ = tx.send(Message::Produced { target, result });
        });
    }

    fn handle(&mut self, message: Message) {
        self.in_flight -= 1;
        match message {
            Message::Compiled {
                target,
                unit,
                result,
                record,
            } => {
                let source = self.exec.graph.node(target).plan.units[unit].source.clone();
                let index_path = self.states[target].index_path.clone();
                if let Some(record) = record {
                    self.store.record(&index_path, source, record);
                }

                let state = &mut self.states[target];
                state.running -= 1;
                let done = state.running == 0 && state.pending.is_empty();

                if let Err(e) = result {
                    self.fail(target, e);
                }
                if done {
                    if let Err(e) = self.store.flush(&index_path) {
                        log::warn!("could not save dependency index: {e}");
                    }
                }
            }
            Message::Produced { target, result } => {
                self.states[target].producing = false;
                let node = self.exec.graph.node(target);
                let record = ProductRecord {
                    command: node.plan.produce_signature(),
                    success: result.is_ok(),
                };
                let name = node.qualified_name();
                let index_path = self.states[target].index_path.clone();
                self.store.record_product(&index_path, &name, record);
                if let Err(e) = self.store.flush(&index_path) {
                    log::warn!("could not save dependency index: {e}");
                }

                match result {
                    Ok(()) => self.finish(target, TargetStatus::Rebuilt),
                    Err(e) => self.fail(target, e),
                }
            }
        }
    }

    /// Whether the output must be (re)produced
    fn needs_produce(&mut self, i: usize) -> bool {
        let graph = self.exec.graph;
        let node = graph.node(i);
        if self.states[i].compiled {
            return true;
        }

        let Some(ours) = modified(&self.exec.root.join(&node.target.output)) else {
            return true;
        };

        let index_path = self.states[i].index_path.clone();
        let produced = self
            .store
            .index(&index_path)
            .product(&node.qualified_name())
            .is_some_and(|p| p.success && p.command == node.plan.produce_signature());
        if !produced {
            return true;
        }

        let root = &self.exec.root;
        if node
            .plan
            .units
            .iter()
            .any(|unit| modified(&root.join(&unit.object)).is_some_and(|theirs| theirs > ours))
        {
            return true;
        }

        node.upstream.iter().any(|&u| {
            self.states[u].status == Some(TargetStatus::Rebuilt)
                || modified(&self.exec.root.join(&graph.node(u).target.output))
                    .is_some_and(|theirs| theirs > ours)
        })
    }

    fn finish(&mut self, i: usize, status: TargetStatus) {
        let name = self.exec.graph.node(i).qualified_name();
        let state = &mut self.states[i];
        state.status = Some(status);
        state.elapsed = state.started.map(|s| s.elapsed()).unwrap_or_default();
        log::info!("[{name}] {status} in {:.2}s", state.elapsed.as_secs_f64());
    }

    /// Mark a target failed and block everything downstream of it
    fn fail(&mut self, i: usize, error: BuildError) {
        if !self.states[i].is_active() {
            log::debug!("ignoring late failure: {error}");
            return;
        }

        let graph = self.exec.graph;
        let name = graph.node(i).qualified_name();
        log::error!("[{name}] failed: {error}");

        let state = &mut self.states[i];
        state.status = Some(TargetStatus::Failed);
        state.error = Some(error);
        state.pending.clear();
        state.elapsed = state.started.map(|s| s.elapsed()).unwrap_or_default();

        for dependent in graph.downstream_closure(i) {
            self.block(dependent, &name);
        }
    }

    fn block(&mut self, i: usize, cause: &str) {
        if !self.states[i].is_active() {
            return;
        }
        log::warn!("[{}] blocked by {cause}", self.exec.graph.node(i).qualified_name());

        let state = &mut self.states[i];
        state.status = Some(TargetStatus::Blocked);
        state.blocked_by = Some(cause.to_string());
        state.pending.clear();
    }

    /// Fail every unfinished target after the deadline passed
    fn time_out(&mut self, after: Duration) {
        let graph = self.exec.graph;
        for &i in graph.order() {
            if !self.states[i].is_active() {
                continue;
            }
            let target = graph.node(i).qualified_name();
            log::error!("[{target}] timed out after {after:?}");
            let index_path = self.states[i].index_path.clone();
            self.store.forget_product(&index_path, &target);

            let state = &mut self.states[i];
            state.status = Some(TargetStatus::Failed);
            state.error = Some(BuildError::Timeout { target, after });
            state.pending.clear();
            state.elapsed = state.started.map(|s| s.elapsed()).unwrap_or_default();
        }
    }

    fn into_report(self, total_time: Duration) -> BuildReport {
        let graph = self.exec.graph;
        let mut states = self.states;
        let mut targets = Vec::new();

        for &i in graph.order() {
            if !states[i].selected {
                continue;
            }
            let state = std::mem::take(&mut states[i]);
            targets.push(TargetReport {
                name: graph.node(i).qualified_name(),
                status: state.status.unwrap_or(TargetStatus::Blocked),
                elapsed: state.elapsed,
                error: state.error,
                blocked_by: state.blocked_by,
            });
        }

        BuildReport { targets, total_time }
    }
}

/// Compile one unit, creating the object directory first
fn compile(root: &Path, runner: &dyn ToolRunner, target: &str, unit: &CompileUnit) -> BuildResult<()> {
    ensure_parent(&root.join(&unit.object))?;
    run_tool(runner, target, &unit.invocation)
}

/// Produce a target output, then run its post-link commands in order
fn produce(root: &Path, runner: &dyn ToolRunner, target: &str, plan: &TargetPlan) -> BuildResult<()> {
    let output = root.join(&plan.output);
    ensure_parent(&output)?;

    match &plan.produce {
        ProduceStep::Link(invocation) => run_tool(runner, target, invocation)?,
        ProduceStep::Archive(invocation) => {
            // `ar rcs` appends to an existing archive
            match fs::remove_file(&output) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(BuildError::io(&output, e)),
            }
            run_tool(runner, target, invocation)?;
        }
        ProduceStep::Raw { objects } => {
            let mut bytes = Vec::new();
            for object in objects {
                let path = root.join(object);
                bytes.extend(fs::read(&path).map_err(|e| BuildError::io(&path, e))?);
            }
            fs::write(&output, bytes).map_err(|e| BuildError::io(&output, e))?;
        }
    }

    for command in &plan.post {
        run_tool(runner, target, command)?;
    }
    Ok(())
}

fn run_tool(runner: &dyn ToolRunner, target: &str, invocation: &Invocation) -> BuildResult<()> {
    log::debug!("[{target}] {invocation}");

    let output = runner.run(invocation).map_err(|e| BuildError::Toolchain {
        target: target.to_string(),
        program: invocation.program.clone(),
        exit_code: None,
        stderr: format!("could not start: {e}"),
    })?;

    if output.success() {
        Ok(())
    } else {
        Err(BuildError::Toolchain {
            target: target.to_string(),
            program: invocation.program.clone(),
            exit_code: output.exit_code,
            stderr: output.stderr,
        })
    }
}

fn ensure_parent(path: &Path) -> BuildResult<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            fs::create_dir_all(parent).map_err(|e| BuildError::io(parent, e))
        }
        _ => Ok(()),
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}
