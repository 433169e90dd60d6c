//! The dispatch contract between the scheduler and its execution backends,
//! plus the backend registry and the pluggable callback backend.

use std::collections::{BTreeMap, HashMap};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cache::{Cache, FileStamp, MetaRecord, Progress};
use crate::config::CachingSite;
use crate::error::{EngineError, Result};
use crate::lang::{eval, Expr, Scope, Value};
use crate::oracle::file_stamp;

/// A unit of work submitted to a backend.
#[derive(Clone)]
pub struct WorkItem {
    pub name: String,
    pub command: Expr,
    /// Evaluation scope with every dependency bound and the seed set.
    pub scope: Scope,
    pub seed: u64,
    pub caching: CachingSite,
    pub timeout: Option<Duration>,
    pub command_hash: String,
    pub depends_hash: String,
    pub output_files: Vec<String>,
    pub hash_files: bool,
    /// Which dispatch this is: 0 first try, 1 the single retry.
    pub attempt: u32,
    /// Unknown plan columns, passed through untouched.
    pub extra: BTreeMap<String, toml::Value>,
}

/// What a backend reports back for one work item.
#[derive(Debug, Clone)]
pub struct Outcome {
    /// The produced value, present only with `CachingSite::Master`.
    pub value: Option<Value>,
    /// Object-store hash, present when the worker cached the value itself.
    pub value_hash: Option<String>,
    pub elapsed_ms: u64,
}

/// Completion signal sent from a backend to the master.
pub struct Completion {
    pub name: String,
    pub attempt: u32,
    pub result: Result<Outcome>,
}

pub type CompletionSender = Sender<Completion>;

/// A pluggable execution strategy.
pub trait DispatchBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Start one work item; the completion must eventually arrive on `done`.
    /// Implementations block here only to apply backpressure against an
    /// external system.
    fn dispatch(&self, item: WorkItem, done: CompletionSender) -> Result<()>;

    /// The backend's own concurrency ceiling.
    fn max_parallel(&self) -> usize;

    fn default_caching_site(&self) -> CachingSite {
        CachingSite::Worker
    }
}

/// Named backends, resolved per run (and per plan row via the `evaluator`
/// column).
#[derive(Default)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn DispatchBackend>>,
}

impl BackendRegistry {
    pub fn register(&mut self, backend: Arc<dyn DispatchBackend>) {
        self.backends.insert(backend.name().to_string(), backend);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn DispatchBackend>> {
        self.backends.get(name).cloned().ok_or_else(|| {
            EngineError::BackendError(format!("unknown dispatch backend '{}'", name))
        })
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Evaluate a work item's command, timing it.
pub fn evaluate_item(item: &WorkItem) -> (u64, Result<Value>) {
    let start = Instant::now();
    let result = eval::eval(&item.command, &item.scope);
    (start.elapsed().as_millis() as u64, result)
}

/// Worker-side commit: value blob first, then the meta record, then the
/// progress sentinel. A reader that sees the meta can always read the value.
pub fn commit_built(
    cache: &Cache,
    item: &WorkItem,
    value: &Value,
    elapsed_ms: u64,
) -> Result<Outcome> {
    let value_hash = cache.put_value(value)?;
    let mut output_files = BTreeMap::new();
    for path in &item.output_files {
        output_files.insert(
            path.clone(),
            file_stamp(&item.scope.workdir, path, cache.short_algo(), item.hash_files),
        );
    }
    let meta = MetaRecord {
        target: item.name.clone(),
        command_hash: item.command_hash.clone(),
        depends_hash: item.depends_hash.clone(),
        value_hash: Some(value_hash.clone()),
        output_files,
        seed: item.seed,
        elapsed_ms,
        finished_at: chrono::Utc::now(),
        error: None,
    };
    cache.put_meta(&meta)?;
    cache.set_progress(&item.name, Progress::Built)?;
    Ok(Outcome {
        value: None,
        value_hash: Some(value_hash),
        elapsed_ms,
    })
}

/// Record a failure: progress sentinel and, when enabled, a meta record
/// without a value hash.
pub fn record_failure(
    cache: &Cache,
    item: &WorkItem,
    error: &EngineError,
    elapsed_ms: u64,
    record_failed_meta: bool,
) -> Result<()> {
    cache.set_progress(&item.name, Progress::Failed)?;
    if record_failed_meta {
        let meta = MetaRecord {
            target: item.name.clone(),
            command_hash: item.command_hash.clone(),
            depends_hash: item.depends_hash.clone(),
            value_hash: None,
            output_files: BTreeMap::<String, FileStamp>::new(),
            seed: item.seed,
            elapsed_ms,
            finished_at: chrono::Utc::now(),
            error: Some(error.to_string()),
        };
        cache.put_meta(&meta)?;
    }
    Ok(())
}

type Callback = dyn Fn(&WorkItem) -> Result<Value> + Send + Sync;

/// User-provided backend: an opaque callable plus the completion channel.
/// Results travel in-band, so the scheduler writes the cache.
pub struct CallbackBackend {
    name: String,
    callback: Arc<Callback>,
    max_parallel: usize,
}

impl CallbackBackend {
    pub fn new(
        name: impl Into<String>,
        max_parallel: usize,
        callback: impl Fn(&WorkItem) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        CallbackBackend {
            name: name.into(),
            callback: Arc::new(callback),
            max_parallel: max_parallel.max(1),
        }
    }
}

impl DispatchBackend for CallbackBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    fn default_caching_site(&self) -> CachingSite {
        CachingSite::Master
    }

    fn dispatch(&self, item: WorkItem, done: CompletionSender) -> Result<()> {
        let callback = self.callback.clone();
        std::thread::spawn(move || {
            let start = Instant::now();
            let result = callback(&item).map(|value| Outcome {
                value: Some(value),
                value_hash: None,
                elapsed_ms: start.elapsed().as_millis() as u64,
            });
            let _ = done.send(Completion {
                name: item.name.clone(),
                attempt: item.attempt,
                result,
            });
        });
        Ok(())
    }
}
