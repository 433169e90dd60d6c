//! The dependency graph: targets, imports, files, and sub-documents merged
//! into one DAG with topological layering.

pub mod topo;

use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::warn;

use crate::analyze::{scan, Analyzer, DepSet, Env, Import};
use crate::error::{EngineError, Result};
use crate::lang::ast::is_namespaced;
use crate::lang::Expr;
use crate::plan::{Plan, Trigger};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Target,
    ImportedObject,
    ImportedFunction,
    InputFile,
    OutputFile,
    SubDoc,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub kind: NodeKind,
    pub command: Option<Expr>,
    pub trigger: Trigger,
    pub evaluator: Option<String>,
    /// Filesystem path for file and sub-document nodes.
    pub path: Option<String>,
    pub depset: DepSet,
    /// Unknown plan columns, passed through to backends.
    pub extra: std::collections::BTreeMap<String, toml::Value>,
}

pub fn file_id(path: &str) -> String {
    format!("file://{}", path)
}

pub fn subdoc_id(path: &str) -> String {
    format!("subdoc://{}", path)
}

#[derive(Debug, Default)]
pub struct Graph {
    nodes: HashMap<String, Node>,
    order: Vec<String>,
    deps: HashMap<String, BTreeSet<String>>,
    dependents: HashMap<String, BTreeSet<String>>,
    layers: Vec<Vec<String>>,
    target_deps: HashMap<String, BTreeSet<String>>,
    target_dependents: HashMap<String, BTreeSet<String>>,
    target_layers: Vec<Vec<String>>,
}

impl Graph {
    /// Merge target and import dependency sets into the run DAG.
    pub fn build(
        plan: &Plan,
        env: &Env,
        analyzer: &Analyzer<'_>,
        trigger_default: Trigger,
        strict: bool,
    ) -> Result<Self> {
        let mut graph = Graph::default();

        for row in plan.rows() {
            if env.contains(&row.name) {
                return Err(EngineError::NameCollision(format!(
                    "'{}' is both a target and an import",
                    row.name
                )));
            }
        }

        // Nodes first, in plan order then import order.
        for row in plan.rows() {
            let depset = analyzer.analyze_target(&row.name, &row.command);
            graph.add_node(Node {
                name: row.name.clone(),
                kind: NodeKind::Target,
                command: Some(row.command.clone()),
                trigger: row.trigger.unwrap_or(trigger_default),
                evaluator: row.evaluator.clone(),
                path: None,
                depset,
                extra: row.extra.clone(),
            });
        }

        let import_deps = scan(env, analyzer);
        for (name, import) in env.iter() {
            let (kind, path) = match import {
                Import::Function { .. } => (NodeKind::ImportedFunction, None),
                Import::Value(_) => (NodeKind::ImportedObject, None),
                Import::File(p) => (NodeKind::InputFile, Some(p.to_string_lossy().into_owned())),
            };
            graph.add_node(Node {
                name: name.clone(),
                kind,
                command: None,
                trigger: Trigger::Any,
                evaluator: None,
                path,
                depset: import_deps.get(name).cloned().unwrap_or_default(),
                extra: Default::default(),
            });
        }

        // Edges per the merge rules.
        let target_names: Vec<String> = plan.rows().iter().map(|r| r.name.clone()).collect();
        for name in &target_names {
            let depset = graph.nodes[name].depset.clone();
            for dep in depset.linkable_names() {
                graph.link_named(name, dep, env, strict)?;
            }
            for path in &depset.reads {
                graph.ensure_file_node(path, false);
                graph.insert_edge(name, &file_id(path));
            }
            for path in &depset.writes {
                graph.ensure_file_node(path, true);
                graph.insert_edge(&file_id(path), name);
            }
            for path in &depset.subdocs {
                graph.ensure_subdoc_node(path);
                graph.insert_edge(name, &subdoc_id(path));
            }
        }

        let import_names: Vec<String> = env.names().cloned().collect();
        for name in &import_names {
            let depset = graph.nodes[name].depset.clone();
            for dep in depset.linkable_names() {
                if env.contains(dep) {
                    graph.insert_edge(name, dep);
                } else if graph.nodes.get(dep).map(|n| n.kind) == Some(NodeKind::Target) {
                    warn!(
                        import = %name,
                        target_name = %dep,
                        "import references a target; imports cannot depend on targets"
                    );
                } else if !crate::lang::eval_builtin_exists(dep) && !is_namespaced(dep) {
                    missing_dependency(name, dep, strict)?;
                }
            }
            for path in &depset.reads {
                graph.ensure_file_node(path, false);
                graph.insert_edge(name, &file_id(path));
            }
        }

        topo::check_acyclic(&graph.order, &graph.deps)?;
        graph.layers = topo::layering(&graph.order, &graph.deps, &graph.dependents);
        graph.finish_target_projection(&target_names);
        Ok(graph)
    }

    fn add_node(&mut self, node: Node) {
        self.deps.entry(node.name.clone()).or_default();
        self.dependents.entry(node.name.clone()).or_default();
        self.order.push(node.name.clone());
        self.nodes.insert(node.name.clone(), node);
    }

    fn ensure_file_node(&mut self, path: &str, written: bool) {
        let id = file_id(path);
        if let Some(node) = self.nodes.get_mut(&id) {
            if written {
                node.kind = NodeKind::OutputFile;
            }
            return;
        }
        self.add_node(Node {
            name: id,
            kind: if written {
                NodeKind::OutputFile
            } else {
                NodeKind::InputFile
            },
            command: None,
            trigger: Trigger::Any,
            evaluator: None,
            path: Some(path.to_string()),
            depset: DepSet::default(),
            extra: Default::default(),
        });
    }

    fn ensure_subdoc_node(&mut self, path: &str) {
        let id = subdoc_id(path);
        if self.nodes.contains_key(&id) {
            return;
        }
        self.add_node(Node {
            name: id,
            kind: NodeKind::SubDoc,
            command: None,
            trigger: Trigger::Any,
            evaluator: None,
            path: Some(path.to_string()),
            depset: DepSet::default(),
            extra: Default::default(),
        });
    }

    fn link_named(&mut self, from: &str, dep: &str, env: &Env, strict: bool) -> Result<()> {
        let resolves = self
            .nodes
            .get(dep)
            .map(|n| {
                matches!(
                    n.kind,
                    NodeKind::Target
                        | NodeKind::ImportedObject
                        | NodeKind::ImportedFunction
                        | NodeKind::InputFile
                )
            })
            .unwrap_or(false)
            || env.contains(dep);
        if resolves {
            self.insert_edge(from, dep);
            return Ok(());
        }
        if crate::lang::eval_builtin_exists(dep) || is_namespaced(dep) {
            return Ok(());
        }
        missing_dependency(from, dep, strict)
    }

    /// Self-loops are dropped silently.
    fn insert_edge(&mut self, from: &str, to: &str) {
        if from == to {
            return;
        }
        self.deps.get_mut(from).expect("edge from unknown node").insert(to.to_string());
        self.dependents
            .get_mut(to)
            .expect("edge to unknown node")
            .insert(from.to_string());
    }

    /// Collapse file and import hops into direct target-to-target edges and
    /// compute the target-level layering used by the staged scheduler.
    fn finish_target_projection(&mut self, target_names: &[String]) {
        for name in target_names {
            let mut collected = BTreeSet::new();
            let mut visited = HashSet::new();
            self.collect_target_deps(name, name, &mut collected, &mut visited);
            self.target_deps.insert(name.clone(), collected);
        }
        for name in target_names {
            self.target_dependents.entry(name.clone()).or_default();
        }
        for (from, deps) in self.target_deps.clone() {
            for to in deps {
                self.target_dependents.entry(to).or_default().insert(from.clone());
            }
        }
        self.target_layers = topo::layering(
            target_names,
            &self.target_deps,
            &self.target_dependents,
        );
    }

    fn collect_target_deps(
        &self,
        root: &str,
        node: &str,
        collected: &mut BTreeSet<String>,
        visited: &mut HashSet<String>,
    ) {
        if !visited.insert(node.to_string()) {
            return;
        }
        if let Some(deps) = self.deps.get(node) {
            for dep in deps {
                if dep == root {
                    continue;
                }
                match self.nodes.get(dep).map(|n| n.kind) {
                    Some(NodeKind::Target) => {
                        collected.insert(dep.clone());
                    }
                    Some(_) => self.collect_target_deps(root, dep, collected, visited),
                    None => {}
                }
            }
        }
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.order.iter().filter_map(|name| self.nodes.get(name))
    }

    /// Targets in plan order.
    pub fn targets(&self) -> impl Iterator<Item = &Node> {
        self.nodes().filter(|n| n.kind == NodeKind::Target)
    }

    pub fn deps(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.deps.get(name)
    }

    pub fn dependents(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.dependents.get(name)
    }

    /// Direct target-level dependencies, file and import hops collapsed.
    pub fn target_deps(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.target_deps.get(name)
    }

    pub fn target_dependents(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.target_dependents.get(name)
    }

    /// Topological layering over every node in the graph.
    pub fn layers(&self) -> &[Vec<String>] {
        &self.layers
    }

    /// Topological layering over targets only.
    pub fn target_layers(&self) -> &[Vec<String>] {
        &self.target_layers
    }

    /// The layers of the staged schedule restricted to outdated targets;
    /// empty when everything is current.
    pub fn parallel_stages(&self, outdated: &HashSet<String>) -> Vec<Vec<String>> {
        self.target_layers
            .iter()
            .map(|layer| {
                layer
                    .iter()
                    .filter(|name| outdated.contains(*name))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .filter(|layer| !layer.is_empty())
            .collect()
    }

    /// Widest stage that still contains outdated targets; caps worker counts.
    pub fn max_useful_parallelism(&self, outdated: &HashSet<String>) -> usize {
        self.parallel_stages(outdated)
            .iter()
            .map(|layer| layer.len())
            .max()
            .unwrap_or(0)
    }
}

fn missing_dependency(referrer: &str, name: &str, strict: bool) -> Result<()> {
    if strict {
        return Err(EngineError::MissingDependency {
            referrer: referrer.to_string(),
            name: name.to_string(),
        });
    }
    warn!(
        referrer = %referrer,
        name = %name,
        "unknown identifier; not a target, import, or builtin"
    );
    Ok(())
}
