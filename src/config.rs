use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::cache::{LongHashAlgo, ShortHashAlgo};
use crate::error::{EngineError, Result};
use crate::plan::Trigger;

/// Where a built value is written to the object store: by the worker that
/// produced it, or by the master after receiving it in-band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CachingSite {
    Worker,
    Master,
}

/// Scheduling strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Layer-by-layer with a barrier between stages.
    Staged,
    /// Ready-queue worker pool; no barrier.
    #[default]
    Dynamic,
}

impl std::str::FromStr for Strategy {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "staged" => Ok(Strategy::Staged),
            "dynamic" => Ok(Strategy::Dynamic),
            other => Err(EngineError::ConfigError(format!(
                "unknown strategy '{}'",
                other
            ))),
        }
    }
}

/// External job backend settings: a job-script template and the command that
/// submits a rendered script.
#[derive(Debug, Clone, Deserialize)]
pub struct ExternalJobConfig {
    pub template_path: Option<PathBuf>,
    #[serde(default = "default_submit")]
    pub submit: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for ExternalJobConfig {
    fn default() -> Self {
        Self {
            template_path: None,
            submit: default_submit(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// Base directory command file paths resolve against.
    #[serde(default = "default_workdir")]
    pub workdir: PathBuf,
    /// Default dispatch backend (registry name).
    #[serde(default = "default_backend")]
    pub parallelism: String,
    /// Upper bound on concurrent workers. 0 = auto-detect (CPU count).
    #[serde(default)]
    pub max_parallel: usize,
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default)]
    pub trigger_default: Trigger,
    /// Continue past per-target failures instead of aborting.
    #[serde(default)]
    pub keep_going: bool,
    /// Caching-site override; unset uses the backend's default.
    #[serde(default)]
    pub caching: Option<CachingSite>,
    /// Base seed for reproducible evaluation.
    #[serde(default)]
    pub root_seed: u64,
    #[serde(default)]
    pub short_hash_algo: ShortHashAlgo,
    #[serde(default)]
    pub long_hash_algo: LongHashAlgo,
    /// Escalate unknown identifiers from warning to error.
    #[serde(default)]
    pub strict: bool,
    /// Attach meta records (without value hash) to failed targets.
    #[serde(default)]
    pub record_failed_meta: bool,
    /// When false, file identity falls back to mtime.
    #[serde(default = "default_true")]
    pub hash_files: bool,
    /// Per-target timeout in seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub external: Option<ExternalJobConfig>,
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".taskwright/cache")
}
fn default_workdir() -> PathBuf {
    PathBuf::from(".")
}
fn default_backend() -> String {
    "thread".to_string()
}
fn default_true() -> bool {
    true
}
fn default_submit() -> String {
    "sh".to_string()
}
fn default_poll_interval() -> u64 {
    250
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            workdir: default_workdir(),
            parallelism: default_backend(),
            max_parallel: 0,
            strategy: Strategy::default(),
            trigger_default: Trigger::default(),
            keep_going: false,
            caching: None,
            root_seed: 0,
            short_hash_algo: ShortHashAlgo::default(),
            long_hash_algo: LongHashAlgo::default(),
            strict: false,
            record_failed_meta: false,
            hash_files: true,
            timeout: None,
            external: None,
        }
    }
}

impl Config {
    /// Effective worker bound: auto-detects the CPU count when unset.
    pub fn resolved_max_parallel(&self) -> usize {
        if self.max_parallel > 0 {
            return self.max_parallel;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

/// Fold `patch` into `base` in place. Tables combine key by key, recursing
/// into shared keys; a patch value of any other kind replaces whatever the
/// base held.
fn overlay_value(base: &mut toml::Value, patch: toml::Value) {
    match (base, patch) {
        (toml::Value::Table(base), toml::Value::Table(patch)) => {
            for (key, value) in patch {
                match base.entry(key) {
                    toml::map::Entry::Occupied(mut slot) => overlay_value(slot.get_mut(), value),
                    toml::map::Entry::Vacant(slot) => {
                        slot.insert(value);
                    }
                }
            }
        }
        (slot, patch) => *slot = patch,
    }
}

/// Search order for layered loading, least specific first.
fn config_layers() -> Vec<PathBuf> {
    let mut layers = vec![PathBuf::from("/etc/taskwright/config.toml")];
    let user_base = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| Path::new(&home).join(".config")));
    if let Some(base) = user_base {
        layers.push(base.join("taskwright").join("config.toml"));
    }
    layers.push(PathBuf::from("taskwright.toml"));
    layers
}

fn read_toml(path: &Path) -> Result<toml::Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        EngineError::ConfigError(format!("failed to read {}: {}", path.display(), e))
    })?;
    Ok(toml::from_str(&content)?)
}

impl Config {
    /// Load configuration.
    ///
    /// An explicit `--config` path loads that one file and nothing else.
    /// Without one, every file that exists along the search order is folded
    /// into a single document, later hits overriding earlier ones key by
    /// key: the system file under `/etc/taskwright`, the per-user file under
    /// `$XDG_CONFIG_HOME/taskwright`, then a project-local `taskwright.toml`.
    /// With no file anywhere, built-in defaults apply.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(p) = path {
            if !p.exists() {
                return Err(EngineError::ConfigError(format!(
                    "config file not found: {}",
                    p.display()
                )));
            }
            return Config::deserialize(read_toml(p)?).map_err(|e| {
                EngineError::ConfigError(format!("invalid config {}: {}", p.display(), e))
            });
        }

        let found: Vec<toml::Value> = config_layers()
            .iter()
            .filter(|layer| layer.exists())
            .map(|layer| read_toml(layer))
            .collect::<Result<_>>()?;
        if found.is_empty() {
            return Ok(Self::default());
        }

        let mut document = toml::Value::Table(toml::map::Map::new());
        for layer in found {
            overlay_value(&mut document, layer);
        }
        Config::deserialize(document)
            .map_err(|e| EngineError::ConfigError(format!("invalid config: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.parallelism, "thread");
        assert_eq!(config.strategy, Strategy::Dynamic);
        assert!(config.hash_files);
        assert!(config.resolved_max_parallel() >= 1);
    }

    #[test]
    fn test_parse_full_config() {
        let config: Config = toml::from_str(
            r#"
            cache_dir = "/tmp/cache"
            parallelism = "fork"
            max_parallel = 3
            strategy = "staged"
            trigger_default = "missing"
            keep_going = true
            caching = "master"
            root_seed = 42
            short_hash_algo = "fnv64"
            long_hash_algo = "sha512"
            "#,
        )
        .unwrap();
        assert_eq!(config.max_parallel, 3);
        assert_eq!(config.strategy, Strategy::Staged);
        assert_eq!(config.caching, Some(CachingSite::Master));
        assert_eq!(config.trigger_default, Trigger::Missing);
        assert_eq!(config.long_hash_algo, LongHashAlgo::Sha512);
    }

    #[test]
    fn test_overlay_later_layer_wins() {
        let mut document: toml::Value =
            toml::from_str("max_parallel = 2\nkeep_going = true").unwrap();
        overlay_value(&mut document, toml::from_str("max_parallel = 8").unwrap());
        let config = Config::deserialize(document).unwrap();
        assert_eq!(config.max_parallel, 8);
        assert!(config.keep_going);
    }

    #[test]
    fn test_overlay_merges_nested_tables() {
        let mut document: toml::Value =
            toml::from_str("[external]\nsubmit = \"qsub\"\npoll_interval_ms = 100").unwrap();
        overlay_value(
            &mut document,
            toml::from_str("[external]\npoll_interval_ms = 50").unwrap(),
        );
        let config = Config::deserialize(document).unwrap();
        let external = config.external.unwrap();
        assert_eq!(external.submit, "qsub");
        assert_eq!(external.poll_interval_ms, 50);
    }
}
