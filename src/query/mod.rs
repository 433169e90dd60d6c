//! Query and inspection operations — outdated report, dependency tree
//! rendering, parallel stages.

use owo_colors::OwoColorize;

use crate::error::Result;
use crate::graph::{Graph, NodeKind};
use crate::oracle::Oracle;

/// Print which targets are outdated and why.
pub fn print_outdated(graph: &Graph, oracle: &Oracle<'_>) -> Result<()> {
    let outdated = oracle.outdated()?;
    let total = graph.targets().count();
    if outdated.is_empty() {
        println!("{} ({} targets)", "All targets are up to date.".green(), total);
        return Ok(());
    }
    println!("{} of {} targets outdated:", outdated.len(), total);
    for (name, reason) in &outdated {
        println!("  {:<24} {}", name.yellow(), reason);
    }
    Ok(())
}

/// Print the forward dependency tree for a node.
pub fn print_dep_tree(
    graph: &Graph,
    name: &str,
    prefix: &str,
    current_depth: usize,
    max_depth: usize,
) {
    if current_depth > max_depth {
        return;
    }

    let deps = match graph.deps(name) {
        Some(deps) => deps,
        None => return,
    };
    let children: Vec<_> = deps.iter().collect();

    for (i, dep_name) in children.iter().enumerate() {
        let is_last_child = i == children.len() - 1;
        let connector = if is_last_child { "└── " } else { "├── " };
        let kind_mark = match graph.node(dep_name).map(|n| n.kind) {
            Some(NodeKind::Target) => "",
            Some(NodeKind::ImportedFunction) => " [function]",
            Some(NodeKind::ImportedObject) => " [value]",
            Some(NodeKind::InputFile) => " [file]",
            Some(NodeKind::OutputFile) => " [file out]",
            Some(NodeKind::SubDoc) => " [subdoc]",
            None => " [unknown]",
        };

        println!("{}{}{}{}", prefix, connector, dep_name, kind_mark.dimmed());

        let new_prefix = format!("{}{}", prefix, if is_last_child { "    " } else { "│   " });
        print_dep_tree(graph, dep_name, &new_prefix, current_depth + 1, max_depth);
    }
}

/// Print every target's dependency tree, roots (targets nothing depends on)
/// first.
pub fn print_graph(graph: &Graph, max_depth: usize) {
    let mut roots: Vec<&str> = graph
        .targets()
        .filter(|n| {
            graph
                .target_dependents(&n.name)
                .map(|d| d.is_empty())
                .unwrap_or(true)
        })
        .map(|n| n.name.as_str())
        .collect();
    if roots.is_empty() {
        roots = graph.targets().map(|n| n.name.as_str()).collect();
    }
    for root in roots {
        println!("{}", root.bold());
        print_dep_tree(graph, root, "", 0, max_depth);
    }
}

/// Print the staged schedule restricted to outdated targets.
pub fn print_stages(graph: &Graph, oracle: &Oracle<'_>) -> Result<()> {
    let outdated = oracle.outdated_names()?;
    let stages = graph.parallel_stages(&outdated);
    if stages.is_empty() {
        println!("No stages to run; everything is up to date.");
        return Ok(());
    }
    for (i, stage) in stages.iter().enumerate() {
        println!("stage {}: {}", i, stage.join(" "));
    }
    println!(
        "max useful parallelism: {}",
        graph.max_useful_parallelism(&outdated)
    );
    Ok(())
}
