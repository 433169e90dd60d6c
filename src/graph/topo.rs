//! Cycle detection and topological layering over the dependency map.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::error::{EngineError, Result};

/// Tri-color depth-first search. Returns `CyclicPlan` with the offending
/// cycle as a name sequence.
pub fn check_acyclic(
    order: &[String],
    deps: &HashMap<String, BTreeSet<String>>,
) -> Result<()> {
    let mut visited: HashSet<&str> = HashSet::new();
    let mut visiting: Vec<&str> = Vec::new();
    let mut on_stack: HashSet<&str> = HashSet::new();

    for name in order {
        if !visited.contains(name.as_str()) {
            visit(name, deps, &mut visited, &mut visiting, &mut on_stack)?;
        }
    }
    Ok(())
}

fn visit<'a>(
    name: &'a str,
    deps: &'a HashMap<String, BTreeSet<String>>,
    visited: &mut HashSet<&'a str>,
    visiting: &mut Vec<&'a str>,
    on_stack: &mut HashSet<&'a str>,
) -> Result<()> {
    visiting.push(name);
    on_stack.insert(name);

    if let Some(children) = deps.get(name) {
        for dep in children {
            if on_stack.contains(dep.as_str()) {
                let start = visiting
                    .iter()
                    .position(|n| *n == dep.as_str())
                    .unwrap_or(0);
                let mut cycle: Vec<String> =
                    visiting[start..].iter().map(|s| s.to_string()).collect();
                cycle.push(dep.to_string());
                return Err(EngineError::CyclicPlan(cycle));
            }
            if !visited.contains(dep.as_str()) {
                visit(dep, deps, visited, visiting, on_stack)?;
            }
        }
    }

    visiting.pop();
    on_stack.remove(name);
    visited.insert(name);
    Ok(())
}

/// Kahn's algorithm: layer 0 holds nodes with no prerequisites; layer k+1
/// holds nodes whose remaining prerequisites all live in layers <= k.
pub fn layering(
    order: &[String],
    deps: &HashMap<String, BTreeSet<String>>,
    dependents: &HashMap<String, BTreeSet<String>>,
) -> Vec<Vec<String>> {
    let mut remaining: HashMap<&str, usize> = order
        .iter()
        .map(|name| (name.as_str(), deps.get(name).map_or(0, |d| d.len())))
        .collect();

    let mut current: Vec<String> = order
        .iter()
        .filter(|name| remaining[name.as_str()] == 0)
        .cloned()
        .collect();

    let mut layers = Vec::new();
    while !current.is_empty() {
        let mut next = Vec::new();
        for name in &current {
            if let Some(successors) = dependents.get(name) {
                for successor in successors {
                    let count = remaining
                        .get_mut(successor.as_str())
                        .expect("successor not in node set");
                    *count -= 1;
                    if *count == 0 {
                        next.push(successor.clone());
                    }
                }
            }
        }
        layers.push(std::mem::take(&mut current));
        current = next;
    }
    layers
}
