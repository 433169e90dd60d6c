//! External job backend: renders a job script per target from a template,
//! hands it to a submit command (e.g. a cluster submission wrapper), and
//! waits on the target's progress sentinel in the shared cache.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::cache::{Cache, Progress};
use crate::error::{EngineError, Result};

use super::backend::{Completion, CompletionSender, DispatchBackend, Outcome, WorkItem};

/// Substitute `${VAR_NAME}` patterns in a script with values from the vars map.
pub fn substitute(script: &str, vars: &HashMap<String, String>) -> String {
    let mut result = script.to_string();
    for (key, value) in vars {
        let pattern = format!("${{{}}}", key);
        result = result.replace(&pattern, value);
    }
    result
}

const DEFAULT_TEMPLATE: &str = "#!/bin/sh\n${WORKER}\n";

pub struct ExternalJobBackend {
    cache: Arc<Cache>,
    template: String,
    submit: String,
    program: PathBuf,
    plan_path: PathBuf,
    env_path: Option<PathBuf>,
    workdir: PathBuf,
    poll_interval: Duration,
    max_parallel: usize,
}

impl ExternalJobBackend {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cache: Arc<Cache>,
        template: Option<String>,
        submit: String,
        program: PathBuf,
        plan_path: PathBuf,
        env_path: Option<PathBuf>,
        workdir: PathBuf,
        poll_interval: Duration,
        max_parallel: usize,
    ) -> Self {
        ExternalJobBackend {
            cache,
            template: template.unwrap_or_else(|| DEFAULT_TEMPLATE.to_string()),
            submit,
            program,
            plan_path,
            env_path,
            workdir,
            poll_interval,
            max_parallel: max_parallel.max(1),
        }
    }

    /// The per-target variable map available to job-script templates.
    fn variables(&self, item: &WorkItem) -> HashMap<String, String> {
        let mut worker = format!(
            "{} worker --plan {} --target {} --cache-dir {} --workdir {} --seed {}",
            self.program.display(),
            self.plan_path.display(),
            item.name,
            self.cache.root().display(),
            self.workdir.display(),
            item.seed
        );
        if let Some(env_path) = &self.env_path {
            worker.push_str(&format!(" --env {}", env_path.display()));
        }
        if !item.hash_files {
            worker.push_str(" --mtime-only");
        }

        let mut vars = HashMap::new();
        vars.insert("TARGET".to_string(), item.name.clone());
        vars.insert("CACHE_DIR".to_string(), self.cache.root().display().to_string());
        vars.insert("PLAN".to_string(), self.plan_path.display().to_string());
        vars.insert(
            "ENV".to_string(),
            self.env_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
        );
        vars.insert("WORKDIR".to_string(), self.workdir.display().to_string());
        vars.insert("SEED".to_string(), item.seed.to_string());
        vars.insert("WORKER".to_string(), worker);
        vars
    }

    fn submit_and_wait(&self, item: &WorkItem) -> Result<Outcome> {
        let script = substitute(&self.template, &self.variables(item));
        let mut file = tempfile::Builder::new()
            .prefix(&format!("taskwright-{}-", item.name))
            .suffix(".sh")
            .tempfile()
            .map_err(|e| EngineError::BackendError(format!("cannot create job script: {}", e)))?;
        file.write_all(script.as_bytes())
            .map_err(|e| EngineError::BackendError(format!("cannot write job script: {}", e)))?;
        debug!(target_name = %item.name, script = %file.path().display(), "submitting job script");

        // Blocking on the submit command is the backpressure mechanism:
        // when the external system refuses submission, dispatch stalls.
        let status = Command::new(&self.submit)
            .arg(file.path())
            .status()
            .map_err(|e| {
                EngineError::BackendError(format!("submit command '{}' failed: {}", self.submit, e))
            })?;
        if !status.success() {
            return Err(EngineError::BackendError(format!(
                "submit command '{}' exited with {}",
                self.submit, status
            )));
        }

        // Wait on the opaque job via the progress sentinel.
        let start = Instant::now();
        loop {
            match self.cache.get_progress(&item.name)? {
                Some(Progress::Built) => {
                    let value_hash = self
                        .cache
                        .get_meta(&item.name)?
                        .and_then(|m| m.value_hash);
                    return Ok(Outcome {
                        value: None,
                        value_hash,
                        elapsed_ms: start.elapsed().as_millis() as u64,
                    });
                }
                Some(Progress::Failed) => {
                    let message = self
                        .cache
                        .get_meta(&item.name)?
                        .and_then(|m| m.error)
                        .unwrap_or_else(|| "job failed".to_string());
                    return Err(EngineError::EvalError {
                        target: item.name.clone(),
                        message,
                    });
                }
                _ => {}
            }
            if let Some(limit) = item.timeout {
                if start.elapsed() > limit {
                    return Err(EngineError::TargetTimeout {
                        target: item.name.clone(),
                        secs: limit.as_secs(),
                    });
                }
            }
            std::thread::sleep(self.poll_interval);
        }
    }
}

impl DispatchBackend for ExternalJobBackend {
    fn name(&self) -> &str {
        "external"
    }

    fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    fn dispatch(&self, item: WorkItem, done: CompletionSender) -> Result<()> {
        let backend = ExternalJobBackend {
            cache: self.cache.clone(),
            template: self.template.clone(),
            submit: self.submit.clone(),
            program: self.program.clone(),
            plan_path: self.plan_path.clone(),
            env_path: self.env_path.clone(),
            workdir: self.workdir.clone(),
            poll_interval: self.poll_interval,
            max_parallel: self.max_parallel,
        };
        std::thread::spawn(move || {
            let result = backend.submit_and_wait(&item);
            let _ = done.send(Completion {
                name: item.name.clone(),
                attempt: item.attempt,
                result,
            });
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substitute_basic() {
        let mut vars = HashMap::new();
        vars.insert("TARGET".to_string(), "alpha".to_string());
        vars.insert("CACHE_DIR".to_string(), "/tmp/cache".to_string());

        let script = "run ${TARGET} with ${CACHE_DIR}";
        assert_eq!(substitute(script, &vars), "run alpha with /tmp/cache");
    }

    #[test]
    fn test_substitute_leaves_unknown_patterns() {
        let vars = HashMap::new();
        assert_eq!(substitute("echo ${NOPE}", &vars), "echo ${NOPE}");
    }
}
