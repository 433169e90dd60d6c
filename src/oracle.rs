//! The staleness oracle: decides per target whether the cached result is
//! still valid, modulated by the target's trigger.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::Path;

use crate::analyze::{Env, Import};
use crate::cache::{hash, Cache, FileStamp};
use crate::error::Result;
use crate::graph::{Graph, Node, NodeKind};
use crate::lang::deparse::standardized;
use crate::plan::Trigger;

/// Hash contributed by a dependency that has no committed result yet; always
/// differs from any real hash, forcing the dependent outdated.
const UNBUILT_SENTINEL: &str = "<unbuilt>";
const MISSING_FILE_SENTINEL: &str = "<missing>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaleReason {
    NoMeta,
    AlwaysTrigger,
    CommandChanged,
    DependsChanged,
    FileChanged(String),
    MissingValue,
    /// Not directly stale, but a transitive dependency is.
    Upstream(String),
}

impl std::fmt::Display for StaleReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StaleReason::NoMeta => write!(f, "never built"),
            StaleReason::AlwaysTrigger => write!(f, "trigger is 'always'"),
            StaleReason::CommandChanged => write!(f, "command changed"),
            StaleReason::DependsChanged => write!(f, "dependencies changed"),
            StaleReason::FileChanged(path) => write!(f, "output file '{}' changed", path),
            StaleReason::MissingValue => write!(f, "cached value missing"),
            StaleReason::Upstream(name) => write!(f, "depends on outdated '{}'", name),
        }
    }
}

pub struct Oracle<'a> {
    graph: &'a Graph,
    env: &'a Env,
    cache: &'a Cache,
    workdir: &'a Path,
    /// When false, file identity falls back to mtime.
    hash_files: bool,
    /// Import hashes are pure within a run; memoized so the recursive
    /// evaluation stays linear in the import graph.
    import_memo: std::cell::RefCell<std::collections::HashMap<String, String>>,
}

impl<'a> Oracle<'a> {
    pub fn new(
        graph: &'a Graph,
        env: &'a Env,
        cache: &'a Cache,
        workdir: &'a Path,
        hash_files: bool,
    ) -> Self {
        Oracle {
            graph,
            env,
            cache,
            workdir,
            hash_files,
            import_memo: Default::default(),
        }
    }

    /// Hash of the standardized command text.
    pub fn command_hash(&self, node: &Node) -> String {
        let text = node
            .command
            .as_ref()
            .map(standardized)
            .unwrap_or_default();
        self.cache.hash_long(text.as_bytes())
    }

    /// The current identity hash of any graph node.
    pub fn node_current_hash(&self, name: &str) -> Result<String> {
        let node = match self.graph.node(name) {
            Some(node) => node,
            None => return Ok(UNBUILT_SENTINEL.to_string()),
        };
        match node.kind {
            NodeKind::Target => Ok(match self.cache.get_meta(name)? {
                Some(meta) => meta
                    .value_hash
                    .unwrap_or_else(|| UNBUILT_SENTINEL.to_string()),
                None => UNBUILT_SENTINEL.to_string(),
            }),
            NodeKind::ImportedFunction => self.import_function_hash(name),
            NodeKind::ImportedObject => {
                let value = match self.env.get(name) {
                    Some(Import::Value(value)) => value.clone(),
                    _ => crate::lang::Value::Null,
                };
                self.cache.value_hash(&value)
            }
            NodeKind::InputFile | NodeKind::OutputFile | NodeKind::SubDoc => {
                let path = node.path.clone().unwrap_or_else(|| name.to_string());
                Ok(self.file_identity(&path))
            }
        }
    }

    /// An imported function's identity covers its standardized source plus,
    /// recursively, the current hash of everything it depends on. Changing a
    /// value an imported function closes over invalidates its users.
    fn import_function_hash(&self, name: &str) -> Result<String> {
        if let Some(hit) = self.import_memo.borrow().get(name) {
            return Ok(hit.clone());
        }
        let source = match self.env.get(name) {
            Some(Import::Function { expr, .. }) => standardized(expr),
            _ => String::new(),
        };
        let mut buffer = format!("function:{}\n", source);
        if let Some(deps) = self.graph.deps(name) {
            for dep in deps {
                buffer.push_str(dep);
                buffer.push('=');
                buffer.push_str(&self.node_current_hash(dep)?);
                buffer.push('\n');
            }
        }
        let hash = self.cache.hash_long(buffer.as_bytes());
        self.import_memo
            .borrow_mut()
            .insert(name.to_string(), hash.clone());
        Ok(hash)
    }

    fn file_identity(&self, path: &str) -> String {
        let stamp = file_stamp(self.workdir, path, self.cache.short_algo(), self.hash_files);
        stamp_identity(&stamp)
    }

    /// Hash of the name-sorted `(dependency, hash)` pairs of a target.
    pub fn current_depends_hash(&self, name: &str) -> Result<String> {
        let deps = match self.graph.deps(name) {
            Some(deps) => deps,
            None => return Ok(self.cache.hash_long(b"")),
        };
        // BTreeSet iteration is already name-sorted.
        let mut buffer = String::new();
        for dep in deps {
            buffer.push_str(dep);
            buffer.push('=');
            buffer.push_str(&self.node_current_hash(dep)?);
            buffer.push('\n');
        }
        Ok(self.cache.hash_long(buffer.as_bytes()))
    }

    /// Why a target is outdated, or `None` when its cached result is valid.
    pub fn target_status(&self, name: &str) -> Result<Option<StaleReason>> {
        let node = match self.graph.node(name) {
            Some(node) if node.kind == NodeKind::Target => node,
            _ => return Ok(None),
        };
        let trigger = node.trigger;

        let meta = match self.cache.get_meta(name)? {
            Some(meta) => meta,
            None => return Ok(Some(StaleReason::NoMeta)),
        };
        if meta.is_failure() {
            return Ok(Some(StaleReason::NoMeta));
        }

        if trigger == Trigger::Always {
            return Ok(Some(StaleReason::AlwaysTrigger));
        }

        if matches!(trigger, Trigger::Any | Trigger::Command)
            && self.command_hash(node) != meta.command_hash
        {
            return Ok(Some(StaleReason::CommandChanged));
        }

        if matches!(trigger, Trigger::Any | Trigger::Depends)
            && self.current_depends_hash(name)? != meta.depends_hash
        {
            return Ok(Some(StaleReason::DependsChanged));
        }

        if matches!(trigger, Trigger::Any | Trigger::FileChange) {
            for path in &node.depset.writes {
                let current = file_stamp(self.workdir, path, self.cache.short_algo(), self.hash_files);
                let recorded = meta.output_files.get(path);
                let missing = !self.workdir.join(path).exists();
                if missing || recorded.map(stamp_identity) != Some(stamp_identity(&current)) {
                    return Ok(Some(StaleReason::FileChanged(path.clone())));
                }
            }
        }

        if trigger == Trigger::Missing {
            match &meta.value_hash {
                Some(hash) if !self.cache.has_value(hash) => {
                    return Ok(Some(StaleReason::MissingValue))
                }
                _ => {}
            }
        }

        Ok(None)
    }

    /// All outdated targets: directly stale ones plus their transitive
    /// dependents.
    pub fn outdated(&self) -> Result<BTreeMap<String, StaleReason>> {
        let mut out = BTreeMap::new();
        let mut queue = VecDeque::new();
        for node in self.graph.targets() {
            if let Some(reason) = self.target_status(&node.name)? {
                out.insert(node.name.clone(), reason);
                queue.push_back(node.name.clone());
            }
        }

        let mut seen: HashSet<String> = out.keys().cloned().collect();
        while let Some(name) = queue.pop_front() {
            if let Some(dependents) = self.graph.target_dependents(&name) {
                for dependent in dependents {
                    if seen.insert(dependent.clone()) {
                        out.insert(dependent.clone(), StaleReason::Upstream(name.clone()));
                        queue.push_back(dependent.clone());
                    }
                }
            }
        }
        Ok(out)
    }

    /// The outdated set as plain names, for stage/width computations.
    pub fn outdated_names(&self) -> Result<HashSet<String>> {
        Ok(self.outdated()?.into_keys().collect())
    }
}

/// Fingerprint a file for staleness decisions and meta records.
pub fn file_stamp(
    workdir: &Path,
    path: &str,
    algo: crate::cache::ShortHashAlgo,
    hash_files: bool,
) -> FileStamp {
    let full = workdir.join(path);
    let mtime_ms = std::fs::metadata(&full)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64);
    let hash = if hash_files {
        hash::file_fingerprint(algo, &full).ok()
    } else {
        None
    };
    FileStamp { mtime_ms, hash }
}

fn stamp_identity(stamp: &FileStamp) -> String {
    match (&stamp.hash, stamp.mtime_ms) {
        (Some(hash), _) => hash.clone(),
        (None, Some(mtime)) => format!("mtime:{}", mtime),
        (None, None) => MISSING_FILE_SENTINEL.to_string(),
    }
}
