//! Single-target worker mode: the entry point behind the hidden `worker` CLI
//! subcommand. A worker process re-loads the plan and environment, reads its
//! dependencies from the shared cache, evaluates one target, and commits the
//! result worker-side. The supervising backend reads the report from stdout
//! or waits on the progress sentinel.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::analyze::{Analyzer, Env, MarkdownExtractor};
use crate::cache::{Cache, Progress};
use crate::config::CachingSite;
use crate::error::{EngineError, Result};
use crate::graph::{Graph, NodeKind};
use crate::oracle::Oracle;
use crate::plan::{Plan, Trigger};
use crate::scheduler::backend::{commit_built, evaluate_item, record_failure, WorkItem};
use crate::scheduler::{evaluate_imports, prepare_scope};

#[derive(Debug, Serialize, Deserialize)]
pub struct WorkerReport {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_hash: Option<String>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone)]
pub struct WorkerArgs {
    pub plan_path: PathBuf,
    pub env_path: Option<PathBuf>,
    pub target: String,
    pub cache_dir: PathBuf,
    pub workdir: PathBuf,
    pub seed: u64,
    pub hash_files: bool,
    pub record_failed_meta: bool,
}

/// Build one target end to end. Per-target evaluation failures are reported
/// in the returned record, not as errors; errors mean the worker itself could
/// not run (unreadable plan, missing cache) and surface as `BackendError`
/// in the supervising scheduler.
pub fn run_worker(args: &WorkerArgs) -> Result<WorkerReport> {
    let plan = Plan::load(&args.plan_path)?;
    let env = match &args.env_path {
        Some(path) => Env::load(path)?,
        None => Env::default(),
    };
    let extractor = MarkdownExtractor::default();
    let analyzer = Analyzer::new(&args.workdir).with_extractor(&extractor);
    let graph = Graph::build(&plan, &env, &analyzer, Trigger::Any, false)?;

    let node = graph
        .node(&args.target)
        .filter(|n| n.kind == NodeKind::Target)
        .ok_or_else(|| {
            EngineError::BackendError(format!("unknown target '{}'", args.target))
        })?;
    let command = node
        .command
        .clone()
        .ok_or_else(|| EngineError::BackendError(format!("target '{}' has no command", args.target)))?;

    let cache = Cache::open_existing(&args.cache_dir)?;
    let oracle = Oracle::new(&graph, &env, &cache, &args.workdir, args.hash_files);
    let import_values = evaluate_imports(&graph, &env, &args.workdir)?;
    let scope = prepare_scope(
        &graph,
        &env,
        &cache,
        &import_values,
        &args.target,
        args.seed,
        &args.workdir,
    )?;

    let item = WorkItem {
        name: args.target.clone(),
        command,
        scope,
        seed: args.seed,
        caching: CachingSite::Worker,
        timeout: None,
        command_hash: oracle.command_hash(node),
        depends_hash: oracle.current_depends_hash(&args.target)?,
        output_files: node.depset.writes.iter().cloned().collect(),
        hash_files: args.hash_files,
        attempt: 0,
        extra: node.extra.clone(),
    };

    cache.set_progress(&args.target, Progress::Building)?;
    let (elapsed_ms, evaluated) = evaluate_item(&item);
    match evaluated {
        Ok(value) => {
            let outcome = commit_built(&cache, &item, &value, elapsed_ms)?;
            Ok(WorkerReport {
                status: "built".to_string(),
                error: None,
                value_hash: outcome.value_hash,
                elapsed_ms,
            })
        }
        Err(e) => {
            record_failure(&cache, &item, &e, elapsed_ms, args.record_failed_meta)?;
            Ok(WorkerReport {
                status: "failed".to_string(),
                error: Some(e.to_string()),
                value_hash: None,
                elapsed_ms,
            })
        }
    }
}
