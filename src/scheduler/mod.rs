//! The scheduler: coordinates target builds in dependency order with bounded
//! parallelism across pluggable dispatch backends.
//!
//! The master thread owns the graph, the target states, and the ready queue;
//! workers report back over a completion channel. Two strategies are
//! provided: staged (layer barriers) and dynamic (ready-queue pool).

pub mod backend;
pub mod external;
pub mod local;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::analyze::{Env, Import};
use crate::cache::{hash, Cache, Progress};
use crate::config::{Config, Strategy};
use crate::error::{EngineError, Result};
use crate::graph::{Graph, NodeKind};
use crate::lang::{eval, Scope, Value};
use crate::oracle::Oracle;

pub use backend::{
    BackendRegistry, CallbackBackend, Completion, CompletionSender, DispatchBackend, Outcome,
    WorkItem,
};
pub use external::ExternalJobBackend;
#[cfg(unix)]
pub use local::ForkBackend;
pub use local::{ProcessBackend, ThreadPoolBackend};

/// Per-target lifecycle within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TargetState {
    Pending,
    Building,
    /// Evaluated this run.
    Fresh,
    /// Cached result was valid; not evaluated.
    Current,
    /// A transitive dependency failed.
    Skipped,
    Failed,
}

/// What happened to each target over one run.
#[derive(Debug, Default)]
pub struct RunReport {
    pub built: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<(String, String)>,
}

pub struct Scheduler<'a> {
    pub graph: &'a Graph,
    pub env: &'a Env,
    pub config: &'a Config,
    pub cache: Arc<Cache>,
    pub registry: &'a BackendRegistry,
    pub cancel: Arc<AtomicBool>,
}

impl<'a> Scheduler<'a> {
    pub fn run(&self) -> Result<RunReport> {
        self.cache.clear_progress()?;

        let import_values = evaluate_imports(self.graph, self.env, &self.config.workdir)?;
        let oracle = Oracle::new(
            self.graph,
            self.env,
            &self.cache,
            &self.config.workdir,
            self.config.hash_files,
        );

        let outdated = oracle.outdated()?;
        for name in outdated.keys() {
            self.cache.set_progress(name, Progress::Queued)?;
        }

        let order: Vec<String> = self.graph.targets().map(|n| n.name.clone()).collect();
        let mut states: HashMap<String, TargetState> = HashMap::new();
        for name in &order {
            if outdated.contains_key(name) {
                states.insert(name.clone(), TargetState::Pending);
            } else {
                states.insert(name.clone(), TargetState::Current);
                debug!(target_name = %name, "up to date");
            }
        }
        debug!(
            outdated = outdated.len(),
            total = order.len(),
            "beginning run"
        );

        let (tx, rx) = mpsc::channel();
        let mut run = Run {
            scheduler: self,
            oracle,
            import_values,
            order,
            states,
            in_flight: HashMap::new(),
            tx,
            rx,
            report: RunReport::default(),
            fatal: None,
            draining: false,
        };

        match self.config.strategy {
            Strategy::Dynamic => run.run_dynamic()?,
            Strategy::Staged => run.run_staged()?,
        }
        run.finish()
    }
}

struct Run<'a, 'b> {
    scheduler: &'b Scheduler<'a>,
    oracle: Oracle<'b>,
    import_values: HashMap<String, Value>,
    order: Vec<String>,
    states: HashMap<String, TargetState>,
    in_flight: HashMap<String, WorkItem>,
    tx: Sender<Completion>,
    rx: Receiver<Completion>,
    report: RunReport,
    fatal: Option<EngineError>,
    draining: bool,
}

impl<'a, 'b> Run<'a, 'b> {
    fn config(&self) -> &Config {
        self.scheduler.config
    }

    fn cache(&self) -> &Cache {
        &self.scheduler.cache
    }

    fn building_count(&self) -> usize {
        self.states
            .values()
            .filter(|s| **s == TargetState::Building)
            .count()
    }

    fn pending_count(&self) -> usize {
        self.states
            .values()
            .filter(|s| **s == TargetState::Pending)
            .count()
    }

    fn effective_max_parallel(&self) -> Result<usize> {
        let backend = self
            .scheduler
            .registry
            .get(&self.config().parallelism)?;
        Ok(self
            .config()
            .resolved_max_parallel()
            .min(backend.max_parallel())
            .max(1))
    }

    fn check_cancel(&mut self) {
        if self.scheduler.cancel.load(Ordering::Relaxed) && !self.draining {
            warn!("cancel requested; draining outstanding work");
            self.draining = true;
        }
    }

    // ------------------------------------------------------------------
    // Dynamic strategy: ready-queue worker pool, no barrier between layers.
    // ------------------------------------------------------------------

    fn run_dynamic(&mut self) -> Result<()> {
        loop {
            self.check_cancel();
            if !self.draining && self.fatal.is_none() {
                self.cascade_skips();
                self.dispatch_ready()?;
            }

            if self.building_count() == 0 {
                if self.draining || self.fatal.is_some() || self.pending_count() == 0 {
                    break;
                }
                return Err(EngineError::BackendError(
                    "scheduler stalled with pending targets".to_string(),
                ));
            }

            let completion = match self.rx.recv_timeout(Duration::from_millis(200)) {
                Ok(completion) => completion,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(EngineError::BackendError(
                        "completion channel closed".to_string(),
                    ))
                }
            };
            self.handle_completion(completion)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Staged strategy: walk the topological layering with a barrier after
    // each layer.
    // ------------------------------------------------------------------

    fn run_staged(&mut self) -> Result<()> {
        let layers: Vec<Vec<String>> = self.scheduler.graph.target_layers().to_vec();
        'layers: for layer in layers {
            self.check_cancel();
            if self.draining || self.fatal.is_some() {
                break;
            }
            self.cascade_skips();

            let mut queue: Vec<String> = layer
                .iter()
                .filter(|name| self.states.get(*name) == Some(&TargetState::Pending))
                .cloned()
                .collect();

            loop {
                self.check_cancel();
                if !self.draining && self.fatal.is_none() {
                    let max = self.effective_max_parallel()?;
                    while let Some(name) = queue.first().cloned() {
                        if self.building_count() >= max {
                            break;
                        }
                        queue.remove(0);
                        if self.states.get(&name) != Some(&TargetState::Pending) {
                            continue;
                        }
                        self.dispatch_or_skip(&name)?;
                    }
                } else {
                    queue.clear();
                }

                if self.building_count() == 0 {
                    if queue.is_empty() {
                        continue 'layers;
                    }
                    continue;
                }

                let completion = match self.rx.recv_timeout(Duration::from_millis(200)) {
                    Ok(completion) => completion,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => {
                        return Err(EngineError::BackendError(
                            "completion channel closed".to_string(),
                        ))
                    }
                };
                self.handle_completion(completion)?;
            }
        }

        // Barrier on anything still in flight after an abort or cancel.
        while self.building_count() > 0 {
            match self.rx.recv_timeout(Duration::from_secs(60)) {
                Ok(completion) => self.handle_completion(completion)?,
                Err(_) => break,
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Shared plumbing
    // ------------------------------------------------------------------

    /// Targets whose failed or skipped dependencies rule them out.
    fn cascade_skips(&mut self) {
        loop {
            let mut to_skip = Vec::new();
            for name in &self.order {
                if self.states.get(name) != Some(&TargetState::Pending) {
                    continue;
                }
                let blocked = self
                    .scheduler
                    .graph
                    .target_deps(name)
                    .map(|deps| {
                        deps.iter().any(|dep| {
                            matches!(
                                self.states.get(dep),
                                Some(TargetState::Failed) | Some(TargetState::Skipped)
                            )
                        })
                    })
                    .unwrap_or(false);
                if blocked {
                    to_skip.push(name.clone());
                }
            }
            if to_skip.is_empty() {
                break;
            }
            for name in to_skip {
                info!(target_name = %name, "skipping; upstream failure");
                self.states.insert(name, TargetState::Skipped);
            }
        }
    }

    /// Dispatch every ready target, marking still-current ones as such.
    fn dispatch_ready(&mut self) -> Result<()> {
        let max = self.effective_max_parallel()?;
        loop {
            let ready: Vec<String> = self
                .order
                .iter()
                .filter(|name| self.states.get(*name) == Some(&TargetState::Pending))
                .filter(|name| self.deps_satisfied(name))
                .cloned()
                .collect();

            let mut progressed = false;
            for name in ready {
                if self.building_count() >= max {
                    // Re-checking currency is still useful at the cap; a
                    // dispatch slot is not.
                    if self.oracle.target_status(&name)?.is_none() {
                        self.mark_current(&name);
                        progressed = true;
                    }
                    continue;
                }
                progressed = true;
                self.dispatch_or_skip(&name)?;
            }
            if !progressed {
                return Ok(());
            }
        }
    }

    fn deps_satisfied(&self, name: &str) -> bool {
        self.scheduler
            .graph
            .target_deps(name)
            .map(|deps| {
                deps.iter().all(|dep| {
                    matches!(
                        self.states.get(dep),
                        Some(TargetState::Fresh) | Some(TargetState::Current)
                    )
                })
            })
            .unwrap_or(true)
    }

    fn mark_current(&mut self, name: &str) {
        debug!(target_name = %name, "up to date after upstream rebuild, skipping");
        self.states.insert(name.to_string(), TargetState::Current);
    }

    /// Re-check staleness now that all dependencies are committed, then
    /// dispatch if the target is genuinely outdated.
    fn dispatch_or_skip(&mut self, name: &str) -> Result<()> {
        if self.oracle.target_status(name)?.is_none() {
            self.mark_current(name);
            return Ok(());
        }
        let item = self.make_item(name, 0)?;
        let backend = self.backend_for(name)?;
        info!(target_name = %name, backend = backend.name(), "building");
        self.states.insert(name.to_string(), TargetState::Building);
        self.in_flight.insert(name.to_string(), item.clone());
        if let Err(e) = backend.dispatch(item, self.tx.clone()) {
            self.handle_completion(Completion {
                name: name.to_string(),
                attempt: 0,
                result: Err(e),
            })?;
        }
        Ok(())
    }

    fn backend_for(&self, name: &str) -> Result<Arc<dyn DispatchBackend>> {
        let node = self
            .scheduler
            .graph
            .node(name)
            .ok_or_else(|| EngineError::BackendError(format!("unknown target '{}'", name)))?;
        match &node.evaluator {
            Some(evaluator) => self.scheduler.registry.get(evaluator),
            None => self.scheduler.registry.get(&self.config().parallelism),
        }
    }

    fn make_item(&self, name: &str, attempt: u32) -> Result<WorkItem> {
        let node = self
            .scheduler
            .graph
            .node(name)
            .ok_or_else(|| EngineError::BackendError(format!("unknown target '{}'", name)))?;
        let command = node.command.clone().ok_or_else(|| {
            EngineError::BackendError(format!("target '{}' has no command", name))
        })?;
        let backend = self.backend_for(name)?;
        let caching = self
            .config()
            .caching
            .unwrap_or_else(|| backend.default_caching_site());
        let seed = hash::seed_for(self.cache().long_algo(), self.config().root_seed, name);
        let scope = prepare_scope(
            self.scheduler.graph,
            self.scheduler.env,
            self.cache(),
            &self.import_values,
            name,
            seed,
            &self.config().workdir,
        )?;
        Ok(WorkItem {
            name: name.to_string(),
            command,
            scope,
            seed,
            caching,
            timeout: self.config().timeout.map(Duration::from_secs),
            command_hash: self.oracle.command_hash(node),
            depends_hash: self.oracle.current_depends_hash(name)?,
            output_files: node.depset.writes.iter().cloned().collect(),
            hash_files: self.config().hash_files,
            attempt,
            extra: node.extra.clone(),
        })
    }

    fn handle_completion(&mut self, completion: Completion) -> Result<()> {
        let item = match self.in_flight.remove(&completion.name) {
            Some(item) => item,
            None => {
                warn!(target_name = %completion.name, "completion for unknown work item");
                return Ok(());
            }
        };

        match completion.result {
            Ok(outcome) => {
                if let Some(value) = &outcome.value {
                    // Master caching site: the value traveled in-band.
                    if let Err(e) = backend::commit_built(self.cache(), &item, value, outcome.elapsed_ms)
                    {
                        self.fatal = Some(e);
                        self.draining = true;
                        self.states
                            .insert(item.name.clone(), TargetState::Failed);
                        return Ok(());
                    }
                }
                info!(
                    target_name = %item.name,
                    elapsed_ms = outcome.elapsed_ms,
                    "built"
                );
                self.states.insert(item.name.clone(), TargetState::Fresh);
                self.report.built.push(item.name);
            }
            Err(e) => {
                if matches!(e, EngineError::BackendError(_)) && completion.attempt == 0 {
                    warn!(target_name = %item.name, error = %e, "backend error; retrying once");
                    let mut retry = item.clone();
                    retry.attempt = 1;
                    self.in_flight.insert(item.name.clone(), retry.clone());
                    let backend = self.backend_for(&item.name)?;
                    if let Err(redispatch) = backend.dispatch(retry, self.tx.clone()) {
                        self.in_flight.remove(&item.name);
                        self.fail_target(&item, escalate(redispatch, &item.name))?;
                    }
                    return Ok(());
                }
                if e.is_fatal() {
                    self.states.insert(item.name.clone(), TargetState::Failed);
                    self.fatal = Some(e);
                    self.draining = true;
                    return Ok(());
                }
                self.fail_target(&item, escalate(e, &item.name))?;
            }
        }
        Ok(())
    }

    fn fail_target(&mut self, item: &WorkItem, error: EngineError) -> Result<()> {
        warn!(target_name = %item.name, error = %error, "target failed");
        self.states.insert(item.name.clone(), TargetState::Failed);
        backend::record_failure(
            self.cache(),
            item,
            &error,
            0,
            self.config().record_failed_meta,
        )?;
        self.report
            .failed
            .push((item.name.clone(), error.to_string()));
        if !self.config().keep_going {
            self.fatal = Some(error);
            self.draining = true;
        }
        Ok(())
    }

    fn finish(mut self) -> Result<RunReport> {
        // Drain anything still in flight so workers never outlive the run.
        while self.building_count() > 0 {
            match self.rx.recv_timeout(Duration::from_secs(60)) {
                Ok(completion) => self.handle_completion(completion)?,
                Err(_) => break,
            }
        }

        if let Some(fatal) = self.fatal.take() {
            return Err(fatal);
        }
        // A cancel that arrived after the last target finished is not an
        // interrupted run.
        if self.scheduler.cancel.load(Ordering::Relaxed) && self.pending_count() > 0 {
            return Err(EngineError::Cancelled);
        }

        for name in &self.order {
            match self.states.get(name) {
                Some(TargetState::Current) | Some(TargetState::Skipped) | Some(TargetState::Pending) => {
                    self.report.skipped.push(name.clone())
                }
                _ => {}
            }
        }
        Ok(self.report)
    }
}

/// A `BackendError` that survives its one retry surfaces as an `EvalError`;
/// timeouts are already per-target.
fn escalate(error: EngineError, target: &str) -> EngineError {
    match error {
        EngineError::BackendError(message) => EngineError::EvalError {
            target: target.to_string(),
            message: format!("backend failed after retry: {}", message),
        },
        other => other,
    }
}

/// Evaluate every import once, in dependency order. Function imports see the
/// already-evaluated imports in scope.
pub fn evaluate_imports(
    graph: &Graph,
    env: &Env,
    workdir: &std::path::Path,
) -> Result<HashMap<String, Value>> {
    let mut values: HashMap<String, Value> = HashMap::new();
    for layer in graph.layers() {
        for name in layer {
            let import = match env.get(name) {
                Some(import) => import,
                None => continue,
            };
            let value = match import {
                Import::Value(value) => value.clone(),
                Import::File(path) => Value::Str(path.to_string_lossy().into_owned()),
                Import::Function { expr, .. } => {
                    let mut scope = Scope::new(name.clone()).with_workdir(workdir);
                    for (bound, value) in &values {
                        scope.bind(bound.clone(), value.clone());
                    }
                    eval::eval(expr, &scope)?
                }
            };
            values.insert(name.clone(), value);
        }
    }
    Ok(values)
}

/// Bind everything a target's command needs: built dependency values from
/// the object store, import values (transitively, so imported functions can
/// resolve their own dependencies at application time), and the seed.
pub fn prepare_scope(
    graph: &Graph,
    env: &Env,
    cache: &Cache,
    import_values: &HashMap<String, Value>,
    name: &str,
    seed: u64,
    workdir: &std::path::Path,
) -> Result<Scope> {
    let mut scope = Scope::new(name).with_seed(seed).with_workdir(workdir);

    let mut stack: Vec<String> = graph
        .deps(name)
        .map(|deps| deps.iter().cloned().collect())
        .unwrap_or_default();
    let mut seen: HashSet<String> = HashSet::new();

    while let Some(dep) = stack.pop() {
        if !seen.insert(dep.clone()) {
            continue;
        }
        if env.contains(&dep) {
            let value = import_values.get(&dep).cloned().ok_or_else(|| {
                EngineError::EvalError {
                    target: name.to_string(),
                    message: format!("import '{}' has no evaluated value", dep),
                }
            })?;
            scope.bind(dep.clone(), value);
            if let Some(transitive) = graph.deps(&dep) {
                stack.extend(transitive.iter().cloned());
            }
            continue;
        }
        match graph.node(&dep).map(|n| n.kind) {
            Some(NodeKind::Target) => {
                let meta = cache.get_meta(&dep)?.ok_or_else(|| {
                    EngineError::CacheError(format!(
                        "dependency '{}' of '{}' has no committed result",
                        dep, name
                    ))
                })?;
                let value_hash = meta.value_hash.ok_or_else(|| {
                    EngineError::CacheError(format!(
                        "dependency '{}' of '{}' has no cached value",
                        dep, name
                    ))
                })?;
                scope.bind(dep.clone(), cache.get_value(&value_hash)?);
            }
            // File and sub-document markers evaluate to their paths; nothing
            // to bind.
            _ => {}
        }
    }
    Ok(scope)
}
