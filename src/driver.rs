//! The driver layer: wires plan, environment, config, cache, graph, and
//! backends together and runs a build.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::analyze::{Analyzer, Env, MarkdownExtractor};
use crate::cache::Cache;
use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::graph::Graph;
use crate::plan::Plan;
use crate::scheduler::{
    BackendRegistry, DispatchBackend, ExternalJobBackend, ProcessBackend, RunReport, Scheduler,
    ThreadPoolBackend,
};

/// Run summary; the CLI maps it to an exit code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildSummary {
    pub built: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl BuildSummary {
    pub fn from_report(report: &RunReport) -> Self {
        BuildSummary {
            built: report.built.len(),
            skipped: report.skipped.len(),
            failed: report.failed.len(),
        }
    }
}

/// Extra wiring the CLI provides beyond the plan/env/config triple.
#[derive(Default)]
pub struct BuildOptions {
    /// Plan file path; required for the process and external backends, which
    /// re-load the plan in workers.
    pub plan_path: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
    /// Cooperative cancel flag, usually wired to SIGINT.
    pub cancel: Option<Arc<AtomicBool>>,
    /// Additional user-provided backends to register.
    pub backends: Vec<Arc<dyn DispatchBackend>>,
}

/// Build a plan with default options.
pub fn build(plan: &Plan, env: &Env, config: &Config) -> Result<BuildSummary> {
    let report = build_with(plan, env, config, BuildOptions::default())?;
    Ok(BuildSummary::from_report(&report))
}

/// Build a plan, returning the per-target report.
pub fn build_with(
    plan: &Plan,
    env: &Env,
    config: &Config,
    options: BuildOptions,
) -> Result<RunReport> {
    let cache = Arc::new(open_cache(config)?);
    let extractor = MarkdownExtractor::default();
    let analyzer = Analyzer::new(&config.workdir).with_extractor(&extractor);
    let graph = Graph::build(plan, env, &analyzer, config.trigger_default, config.strict)?;

    let registry = make_registry(config, &cache, &options)?;
    let cancel = options
        .cancel
        .clone()
        .unwrap_or_else(|| Arc::new(AtomicBool::new(false)));

    let scheduler = Scheduler {
        graph: &graph,
        env,
        config,
        cache,
        registry: &registry,
        cancel,
    };
    let report = scheduler.run()?;
    info!(
        built = report.built.len(),
        skipped = report.skipped.len(),
        failed = report.failed.len(),
        "run finished"
    );
    Ok(report)
}

pub fn open_cache(config: &Config) -> Result<Cache> {
    Cache::open(
        &config.cache_dir,
        config.short_hash_algo,
        config.long_hash_algo,
    )
}

fn make_registry(
    config: &Config,
    cache: &Arc<Cache>,
    options: &BuildOptions,
) -> Result<BackendRegistry> {
    let max = config.resolved_max_parallel();
    let mut registry = BackendRegistry::default();
    registry.register(Arc::new(ThreadPoolBackend::new(cache.clone(), max)));

    #[cfg(unix)]
    registry.register(Arc::new(crate::scheduler::ForkBackend::new(
        cache.clone(),
        max,
    )));
    // No fork on this platform; run "fork" targets sequentially in-process.
    #[cfg(not(unix))]
    registry.register(Arc::new(ThreadPoolBackend::named("fork", cache.clone(), 1)));

    if let Some(plan_path) = &options.plan_path {
        if let Ok(program) = std::env::current_exe() {
            registry.register(Arc::new(ProcessBackend::new(
                program.clone(),
                plan_path.clone(),
                options.env_path.clone(),
                config.cache_dir.clone(),
                config.workdir.clone(),
                config.record_failed_meta,
                max,
            )));

            let external = config.external.clone().unwrap_or_default();
            let template = match &external.template_path {
                Some(path) => Some(std::fs::read_to_string(path).map_err(|e| {
                    EngineError::ConfigError(format!(
                        "cannot read job template {}: {}",
                        path.display(),
                        e
                    ))
                })?),
                None => None,
            };
            registry.register(Arc::new(ExternalJobBackend::new(
                cache.clone(),
                template,
                external.submit,
                program,
                plan_path.clone(),
                options.env_path.clone(),
                config.workdir.clone(),
                Duration::from_millis(external.poll_interval_ms.max(10)),
                max,
            )));
        }
    }

    for backend in &options.backends {
        registry.register(backend.clone());
    }
    Ok(registry)
}

#[cfg(unix)]
mod cancel {
    use std::os::raw::c_int;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, OnceLock};

    use crate::error::{EngineError, Result};

    static CANCEL_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();
    static CANCEL_COUNT: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn on_sigint(_: c_int) {
        // First signal drains; the second hard-aborts.
        if CANCEL_COUNT.fetch_add(1, Ordering::SeqCst) >= 1 {
            unsafe { libc::_exit(130) }
        }
        if let Some(flag) = CANCEL_FLAG.get() {
            flag.store(true, Ordering::SeqCst);
        }
    }

    /// Wire SIGINT to a cooperative cancel flag.
    pub fn install(flag: Arc<AtomicBool>) -> Result<()> {
        use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

        let _ = CANCEL_FLAG.set(flag);
        let action = SigAction::new(
            SigHandler::Handler(on_sigint),
            SaFlags::empty(),
            SigSet::empty(),
        );
        unsafe {
            sigaction(Signal::SIGINT, &action)
                .map_err(|e| EngineError::BackendError(format!("sigaction failed: {}", e)))?;
        }
        Ok(())
    }
}

#[cfg(unix)]
pub use cancel::install as install_cancel_handler;

#[cfg(not(unix))]
pub fn install_cancel_handler(_flag: Arc<AtomicBool>) -> Result<()> {
    Ok(())
}

/// The process exit code for a finished run.
pub fn exit_code(result: &Result<BuildSummary>) -> i32 {
    match result {
        Ok(summary) if summary.failed == 0 => 0,
        Ok(_) => 1,
        Err(EngineError::Cancelled) => 130,
        Err(_) => 2,
    }
}
