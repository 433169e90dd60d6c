//! Local dispatch backends: in-process worker threads, forked workers
//! sharing parent memory copy-on-write (POSIX only), and spawned worker
//! subprocesses driven through the `worker` CLI mode.

use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cache::{Cache, Progress};
use crate::config::CachingSite;
use crate::error::{EngineError, Result};

use super::backend::{
    commit_built, evaluate_item, Completion, CompletionSender, DispatchBackend, Outcome, WorkItem,
};
use crate::worker::WorkerReport;

/// In-process worker threads; the default backend.
pub struct ThreadPoolBackend {
    name: String,
    cache: Arc<Cache>,
    max_parallel: usize,
}

impl ThreadPoolBackend {
    pub fn new(cache: Arc<Cache>, max_parallel: usize) -> Self {
        Self::named("thread", cache, max_parallel)
    }

    /// Registered under an alternate name, e.g. as the sequential stand-in
    /// for the fork pool on platforms without fork.
    pub fn named(name: impl Into<String>, cache: Arc<Cache>, max_parallel: usize) -> Self {
        ThreadPoolBackend {
            name: name.into(),
            cache,
            max_parallel: max_parallel.max(1),
        }
    }
}

impl DispatchBackend for ThreadPoolBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    fn dispatch(&self, item: WorkItem, done: CompletionSender) -> Result<()> {
        let cache = self.cache.clone();
        std::thread::spawn(move || {
            let _ = cache.set_progress(&item.name, Progress::Building);
            let (elapsed_ms, evaluated) = run_with_timeout(&item);
            let result = match evaluated {
                Ok(value) => match item.caching {
                    CachingSite::Worker => commit_built(&cache, &item, &value, elapsed_ms),
                    CachingSite::Master => Ok(Outcome {
                        value: Some(value),
                        value_hash: None,
                        elapsed_ms,
                    }),
                },
                Err(e) => Err(e),
            };
            let _ = done.send(Completion {
                name: item.name.clone(),
                attempt: item.attempt,
                result,
            });
        });
        Ok(())
    }
}

/// Evaluate, racing the per-target timeout when one is set. The evaluation
/// thread cannot be killed; on timeout its eventual result is discarded.
fn run_with_timeout(item: &WorkItem) -> (u64, Result<crate::lang::Value>) {
    let limit = match item.timeout {
        None => return evaluate_item(item),
        Some(limit) => limit,
    };
    let (tx, rx) = mpsc::channel();
    let eval_item = item.clone();
    std::thread::spawn(move || {
        let _ = tx.send(evaluate_item(&eval_item));
    });
    match rx.recv_timeout(limit) {
        Ok(result) => result,
        Err(_) => (
            limit.as_millis() as u64,
            Err(EngineError::TargetTimeout {
                target: item.name.clone(),
                secs: limit.as_secs(),
            }),
        ),
    }
}

/// Forked worker pool: each work item runs in a forked child that shares
/// parent memory copy-on-write, so the prepared scope needs no serialization
/// on the way in. POSIX only; the driver registers it with `max_parallel`
/// capped to 1 elsewhere.
#[cfg(unix)]
pub struct ForkBackend {
    cache: Arc<Cache>,
    max_parallel: usize,
}

#[cfg(unix)]
impl ForkBackend {
    pub fn new(cache: Arc<Cache>, max_parallel: usize) -> Self {
        ForkBackend {
            cache,
            max_parallel: max_parallel.max(1),
        }
    }
}

#[cfg(unix)]
#[derive(serde::Serialize, serde::Deserialize)]
struct ForkReport {
    ok: bool,
    value: Option<crate::lang::Value>,
    value_hash: Option<String>,
    elapsed_ms: u64,
    error: Option<String>,
    cache_error: bool,
}

#[cfg(unix)]
impl DispatchBackend for ForkBackend {
    fn name(&self) -> &str {
        "fork"
    }

    fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    fn dispatch(&self, item: WorkItem, done: CompletionSender) -> Result<()> {
        let cache_root = self.cache.root().to_path_buf();
        std::thread::spawn(move || {
            let result = fork_and_supervise(&cache_root, &item);
            let _ = done.send(Completion {
                name: item.name.clone(),
                attempt: item.attempt,
                result,
            });
        });
        Ok(())
    }
}

#[cfg(unix)]
fn fork_and_supervise(cache_root: &std::path::Path, item: &WorkItem) -> Result<Outcome> {
    use nix::sys::signal::{kill, Signal};
    use nix::sys::wait::{waitpid, WaitPidFlag};
    use nix::unistd::{fork, ForkResult};
    use std::fs::File;
    use std::io::Read;

    let (read_fd, write_fd) =
        nix::unistd::pipe().map_err(|e| EngineError::BackendError(format!("pipe failed: {}", e)))?;

    match unsafe { fork() } {
        Err(e) => Err(EngineError::BackendError(format!("fork failed: {}", e))),
        Ok(ForkResult::Child) => {
            drop(read_fd);
            let report = fork_child_run(cache_root, item);
            let payload = serde_json::to_vec(&report).unwrap_or_default();
            {
                use std::io::Write;
                let mut pipe = File::from(write_fd);
                let _ = pipe.write_all(&payload);
                let _ = pipe.flush();
            }
            unsafe { libc::_exit(0) }
        }
        Ok(ForkResult::Parent { child }) => {
            drop(write_fd);

            // Read on a helper thread so a slow child cannot deadlock against
            // a full pipe buffer while we wait on it.
            let reader = std::thread::spawn(move || {
                let mut buffer = Vec::new();
                let mut pipe = File::from(read_fd);
                let _ = pipe.read_to_end(&mut buffer);
                buffer
            });

            if let Some(limit) = item.timeout {
                let start = Instant::now();
                loop {
                    match waitpid(child, Some(WaitPidFlag::WNOHANG)) {
                        Ok(nix::sys::wait::WaitStatus::StillAlive) => {}
                        Ok(_) => break,
                        Err(e) => {
                            return Err(EngineError::BackendError(format!(
                                "waitpid failed: {}",
                                e
                            )))
                        }
                    }
                    if start.elapsed() > limit {
                        let _ = kill(child, Signal::SIGKILL);
                        let _ = waitpid(child, None);
                        let _ = reader.join();
                        return Err(EngineError::TargetTimeout {
                            target: item.name.clone(),
                            secs: limit.as_secs(),
                        });
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
            } else {
                waitpid(child, None)
                    .map_err(|e| EngineError::BackendError(format!("waitpid failed: {}", e)))?;
            }

            let payload = reader
                .join()
                .map_err(|_| EngineError::BackendError("pipe reader panicked".to_string()))?;
            if payload.is_empty() {
                return Err(EngineError::BackendError(format!(
                    "forked worker for '{}' exited without reporting",
                    item.name
                )));
            }
            let report: ForkReport = serde_json::from_slice(&payload).map_err(|e| {
                EngineError::BackendError(format!("unreadable worker report: {}", e))
            })?;
            fork_report_to_outcome(item, report)
        }
    }
}

/// Runs inside the forked child. A fresh cache handle avoids inheriting lock
/// state from threads that did not survive the fork.
#[cfg(unix)]
fn fork_child_run(cache_root: &std::path::Path, item: &WorkItem) -> ForkReport {
    let cache = match Cache::open_existing(cache_root) {
        Ok(cache) => cache,
        Err(e) => {
            return ForkReport {
                ok: false,
                value: None,
                value_hash: None,
                elapsed_ms: 0,
                error: Some(e.to_string()),
                cache_error: true,
            }
        }
    };
    let _ = cache.set_progress(&item.name, Progress::Building);
    let (elapsed_ms, evaluated) = evaluate_item(item);
    match evaluated {
        Ok(value) => match item.caching {
            CachingSite::Worker => match commit_built(&cache, item, &value, elapsed_ms) {
                Ok(outcome) => ForkReport {
                    ok: true,
                    value: None,
                    value_hash: outcome.value_hash,
                    elapsed_ms,
                    error: None,
                    cache_error: false,
                },
                Err(e) => ForkReport {
                    ok: false,
                    value: None,
                    value_hash: None,
                    elapsed_ms,
                    error: Some(e.to_string()),
                    cache_error: true,
                },
            },
            CachingSite::Master => ForkReport {
                ok: true,
                value: Some(value),
                value_hash: None,
                elapsed_ms,
                error: None,
                cache_error: false,
            },
        },
        Err(e) => ForkReport {
            ok: false,
            value: None,
            value_hash: None,
            elapsed_ms,
            error: Some(e.to_string()),
            cache_error: false,
        },
    }
}

#[cfg(unix)]
fn fork_report_to_outcome(item: &WorkItem, report: ForkReport) -> Result<Outcome> {
    if report.ok {
        Ok(Outcome {
            value: report.value,
            value_hash: report.value_hash,
            elapsed_ms: report.elapsed_ms,
        })
    } else if report.cache_error {
        Err(EngineError::CacheError(
            report.error.unwrap_or_else(|| "unknown cache error".to_string()),
        ))
    } else {
        Err(EngineError::EvalError {
            target: item.name.clone(),
            message: report
                .error
                .unwrap_or_else(|| "unknown worker error".to_string()),
        })
    }
}

/// Spawned worker subprocesses: isolated, cross-platform, higher setup cost.
/// Each work item re-loads the plan and environment in a fresh process via
/// the hidden `worker` CLI mode and always caches worker-side.
pub struct ProcessBackend {
    program: PathBuf,
    plan_path: PathBuf,
    env_path: Option<PathBuf>,
    cache_dir: PathBuf,
    workdir: PathBuf,
    record_failed_meta: bool,
    max_parallel: usize,
}

impl ProcessBackend {
    pub fn new(
        program: PathBuf,
        plan_path: PathBuf,
        env_path: Option<PathBuf>,
        cache_dir: PathBuf,
        workdir: PathBuf,
        record_failed_meta: bool,
        max_parallel: usize,
    ) -> Self {
        ProcessBackend {
            program,
            plan_path,
            env_path,
            cache_dir,
            workdir,
            record_failed_meta,
            max_parallel: max_parallel.max(1),
        }
    }

    fn worker_command(&self, item: &WorkItem) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("worker")
            .arg("--plan")
            .arg(&self.plan_path)
            .arg("--target")
            .arg(&item.name)
            .arg("--cache-dir")
            .arg(&self.cache_dir)
            .arg("--workdir")
            .arg(&self.workdir)
            .arg("--seed")
            .arg(item.seed.to_string());
        if let Some(env_path) = &self.env_path {
            cmd.arg("--env").arg(env_path);
        }
        if !item.hash_files {
            cmd.arg("--mtime-only");
        }
        if self.record_failed_meta {
            cmd.arg("--record-failed-meta");
        }
        cmd.stdout(Stdio::piped()).stderr(Stdio::null());
        cmd
    }
}

impl DispatchBackend for ProcessBackend {
    fn name(&self) -> &str {
        "process"
    }

    fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    fn dispatch(&self, item: WorkItem, done: CompletionSender) -> Result<()> {
        let mut cmd = self.worker_command(&item);
        std::thread::spawn(move || {
            let result = supervise_process(&mut cmd, &item);
            let _ = done.send(Completion {
                name: item.name.clone(),
                attempt: item.attempt,
                result,
            });
        });
        Ok(())
    }
}

fn supervise_process(cmd: &mut Command, item: &WorkItem) -> Result<Outcome> {
    use std::io::Read;

    let mut child = cmd
        .spawn()
        .map_err(|e| EngineError::BackendError(format!("failed to spawn worker: {}", e)))?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| EngineError::BackendError("worker has no stdout".to_string()))?;
    let reader = std::thread::spawn(move || {
        let mut buffer = String::new();
        let _ = stdout.read_to_string(&mut buffer);
        buffer
    });

    if let Some(limit) = item.timeout {
        let start = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(_)) => break,
                Ok(None) => {
                    if start.elapsed() > limit {
                        let _ = child.kill();
                        let _ = child.wait();
                        let _ = reader.join();
                        return Err(EngineError::TargetTimeout {
                            target: item.name.clone(),
                            secs: limit.as_secs(),
                        });
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    return Err(EngineError::BackendError(format!(
                        "failed to wait on worker: {}",
                        e
                    )))
                }
            }
        }
    } else {
        child
            .wait()
            .map_err(|e| EngineError::BackendError(format!("failed to wait on worker: {}", e)))?;
    }

    let output = reader
        .join()
        .map_err(|_| EngineError::BackendError("stdout reader panicked".to_string()))?;
    let line = output
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .ok_or_else(|| {
            EngineError::BackendError(format!(
                "worker for '{}' produced no report",
                item.name
            ))
        })?;
    let report: WorkerReport = serde_json::from_str(line).map_err(|e| {
        EngineError::BackendError(format!("unreadable worker report: {}", e))
    })?;

    if report.status == "built" {
        Ok(Outcome {
            value: None,
            value_hash: report.value_hash,
            elapsed_ms: report.elapsed_ms,
        })
    } else {
        Err(EngineError::EvalError {
            target: item.name.clone(),
            message: report
                .error
                .unwrap_or_else(|| "unknown worker error".to_string()),
        })
    }
}
