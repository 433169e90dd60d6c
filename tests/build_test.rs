//! End-to-end build scenarios: chains, caching, invalidation scoping,
//! triggers, and failure handling.

use std::path::Path;

use assert_matches::assert_matches;

use taskwright::analyze::{Analyzer, Env, MarkdownExtractor};
use taskwright::config::Config;
use taskwright::driver::{self, BuildOptions, BuildSummary};
use taskwright::error::EngineError;
use taskwright::graph::Graph;
use taskwright::lang::Value;
use taskwright::oracle::{Oracle, StaleReason};
use taskwright::plan::Plan;

fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.cache_dir = dir.join("cache");
    config.workdir = dir.join("work");
    std::fs::create_dir_all(&config.workdir).unwrap();
    config.max_parallel = 2;
    config
}

fn target_value(config: &Config, name: &str) -> Value {
    let cache = driver::open_cache(config).unwrap();
    let meta = cache.get_meta(name).unwrap().unwrap();
    cache.get_value(&meta.value_hash.unwrap()).unwrap()
}

fn build_graph(plan: &Plan, env: &Env, config: &Config) -> Graph {
    let extractor = MarkdownExtractor::default();
    let analyzer = Analyzer::new(&config.workdir).with_extractor(&extractor);
    Graph::build(plan, env, &analyzer, config.trigger_default, config.strict).unwrap()
}

#[test]
fn test_basic_chain() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let plan = Plan::from_rows([("a", "1"), ("b", "a + 1"), ("c", "b * 2")]).unwrap();
    let env = Env::default();

    let summary = driver::build(&plan, &env, &config).unwrap();
    assert_eq!(
        summary,
        BuildSummary {
            built: 3,
            skipped: 0,
            failed: 0
        }
    );
    assert_eq!(target_value(&config, "a"), Value::Int(1));
    assert_eq!(target_value(&config, "b"), Value::Int(2));
    assert_eq!(target_value(&config, "c"), Value::Int(4));

    let graph = build_graph(&plan, &env, &config);
    assert_eq!(graph.target_layers(), &[vec!["a"], vec!["b"], vec!["c"]]);
}

#[test]
fn test_second_run_evaluates_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let plan = Plan::from_rows([("a", "1"), ("b", "a + 1"), ("c", "b * 2")]).unwrap();
    let env = Env::default();

    driver::build(&plan, &env, &config).unwrap();
    let second = driver::build(&plan, &env, &config).unwrap();
    assert_eq!(
        second,
        BuildSummary {
            built: 0,
            skipped: 3,
            failed: 0
        }
    );

    // With everything current the staged view is empty.
    let graph = build_graph(&plan, &env, &config);
    let cache = driver::open_cache(&config).unwrap();
    let oracle = Oracle::new(&graph, &env, &cache, &config.workdir, config.hash_files);
    let outdated = oracle.outdated_names().unwrap();
    assert!(graph.parallel_stages(&outdated).is_empty());
    assert_eq!(graph.max_useful_parallelism(&outdated), 0);
}

#[test]
fn test_command_edit_invalidates_subtree() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let env = Env::default();

    let plan = Plan::from_rows([("a", "1"), ("b", "a + 1"), ("c", "b * 2")]).unwrap();
    driver::build(&plan, &env, &config).unwrap();

    let edited = Plan::from_rows([("a", "1"), ("b", "a + 10"), ("c", "b * 2")]).unwrap();

    // The oracle sees exactly b (directly) and c (transitively) as outdated.
    let graph = build_graph(&edited, &env, &config);
    let cache = driver::open_cache(&config).unwrap();
    let oracle = Oracle::new(&graph, &env, &cache, &config.workdir, config.hash_files);
    let outdated = oracle.outdated().unwrap();
    assert_eq!(outdated.len(), 2);
    assert_eq!(outdated.get("b"), Some(&StaleReason::CommandChanged));
    assert_eq!(outdated.get("c"), Some(&StaleReason::Upstream("b".to_string())));
    drop(cache);

    let report = driver::build_with(&edited, &env, &config, BuildOptions::default()).unwrap();
    let mut built = report.built.clone();
    built.sort();
    assert_eq!(built, vec!["b", "c"]);
    assert_eq!(target_value(&config, "c"), Value::Int(22));
}

#[test]
fn test_import_function_change_invalidates_user() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let plan = Plan::from_rows([("y", "f(3)")]).unwrap();

    let mut env = Env::default();
    env.insert_function("f", "fn(x) x + 1").unwrap();
    driver::build(&plan, &env, &config).unwrap();
    assert_eq!(target_value(&config, "y"), Value::Int(4));

    let mut env2 = Env::default();
    env2.insert_function("f", "fn(x) x + 100").unwrap();
    let report = driver::build_with(&plan, &env2, &config, BuildOptions::default()).unwrap();
    assert_eq!(report.built, vec!["y"]);
    assert_eq!(target_value(&config, "y"), Value::Int(103));

    // Unchanged redefinition does not invalidate.
    let second = driver::build(&plan, &env2, &config).unwrap();
    assert_eq!(second.built, 0);
}

#[test]
fn test_import_value_change_propagates_through_functions() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let plan = Plan::from_rows([("y", "f(3)")]).unwrap();

    let mut env = Env::default();
    env.insert_function("f", "fn(x) x + offset").unwrap();
    env.insert_value("offset", Value::Int(1));
    driver::build(&plan, &env, &config).unwrap();
    assert_eq!(target_value(&config, "y"), Value::Int(4));

    // Only the value the function closes over changes; its source does not.
    let mut env2 = Env::default();
    env2.insert_function("f", "fn(x) x + offset").unwrap();
    env2.insert_value("offset", Value::Int(50));
    let report = driver::build_with(&plan, &env2, &config, BuildOptions::default()).unwrap();
    assert_eq!(report.built, vec!["y"]);
    assert_eq!(target_value(&config, "y"), Value::Int(53));
}

#[test]
fn test_file_dependency_invalidates_on_content_change() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let plan = Plan::from_rows([
        ("y", "read_file(file_in('in.txt'))"),
        ("z", "1"),
    ])
    .unwrap();
    let env = Env::default();

    std::fs::write(config.workdir.join("in.txt"), "hello").unwrap();
    driver::build(&plan, &env, &config).unwrap();
    assert_eq!(target_value(&config, "y"), Value::Str("hello".into()));

    std::fs::write(config.workdir.join("in.txt"), "world").unwrap();
    let report = driver::build_with(&plan, &env, &config, BuildOptions::default()).unwrap();
    assert_eq!(report.built, vec!["y"]);
    assert_eq!(report.skipped, vec!["z"]);
    assert_eq!(target_value(&config, "y"), Value::Str("world".into()));
}

#[test]
fn test_output_file_chain() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let plan = Plan::from_rows([
        ("producer", "write_file(file_out('data.txt'), 'payload')"),
        ("consumer", "read_file(file_in('data.txt'))"),
    ])
    .unwrap();
    let env = Env::default();

    let summary = driver::build(&plan, &env, &config).unwrap();
    assert_eq!(summary.built, 2);
    assert_eq!(
        target_value(&config, "consumer"),
        Value::Str("payload".into())
    );

    // Deleting the produced file makes the producer (and its consumer)
    // outdated again.
    std::fs::remove_file(config.workdir.join("data.txt")).unwrap();
    let report = driver::build_with(&plan, &env, &config, BuildOptions::default()).unwrap();
    assert!(report.built.contains(&"producer".to_string()));
}

#[test]
fn test_parallel_width() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.max_parallel = 4;
    let plan = Plan::from_rows([
        ("a", "1"),
        ("b", "2"),
        ("c", "3"),
        ("d", "4"),
        ("e", "a + b + c + d"),
    ])
    .unwrap();
    let env = Env::default();

    let graph = build_graph(&plan, &env, &config);
    let cache = driver::open_cache(&config).unwrap();
    let oracle = Oracle::new(&graph, &env, &cache, &config.workdir, config.hash_files);
    let outdated = oracle.outdated_names().unwrap();
    assert_eq!(graph.max_useful_parallelism(&outdated), 4);
    assert_eq!(graph.parallel_stages(&outdated).len(), 2);
    drop(cache);

    let summary = driver::build(&plan, &env, &config).unwrap();
    assert_eq!(summary.built, 5);
    assert_eq!(target_value(&config, "e"), Value::Int(10));
}

#[test]
fn test_empty_plan_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let summary = driver::build(&Plan::from_toml("").unwrap(), &Env::default(), &config).unwrap();
    assert_eq!(summary, BuildSummary::default());
}

#[test]
fn test_always_trigger_rebuilds_every_run() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let plan = Plan::from_toml(
        r#"
        [[target]]
        name = "stamp"
        command = "seed()"
        trigger = "always"

        [[target]]
        name = "fixed"
        command = "7"
        "#,
    )
    .unwrap();
    let env = Env::default();

    driver::build(&plan, &env, &config).unwrap();
    let second = driver::build_with(&plan, &env, &config, BuildOptions::default()).unwrap();
    assert_eq!(second.built, vec!["stamp"]);
    assert_eq!(second.skipped, vec!["fixed"]);
}

#[test]
fn test_missing_trigger_ignores_command_edits() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let env = Env::default();
    let plan = Plan::from_toml(
        r#"
        [[target]]
        name = "x"
        command = "1"
        trigger = "missing"
        "#,
    )
    .unwrap();
    driver::build(&plan, &env, &config).unwrap();

    let edited = Plan::from_toml(
        r#"
        [[target]]
        name = "x"
        command = "2"
        trigger = "missing"
        "#,
    )
    .unwrap();
    let second = driver::build(&edited, &env, &config).unwrap();
    assert_eq!(second.built, 0);

    // But a cleaned value rebuilds.
    let cache = driver::open_cache(&config).unwrap();
    cache.clean(Some("x")).unwrap();
    drop(cache);
    let third = driver::build(&edited, &env, &config).unwrap();
    assert_eq!(third.built, 1);
    assert_eq!(target_value(&config, "x"), Value::Int(2));
}

#[test]
fn test_ignore_block_edits_do_not_invalidate() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let env = Env::default();

    let plan = Plan::from_rows([("x", "1 + ignore(2)")]).unwrap();
    driver::build(&plan, &env, &config).unwrap();

    let edited = Plan::from_rows([("x", "1 + ignore(999)")]).unwrap();
    let second = driver::build(&edited, &env, &config).unwrap();
    assert_eq!(second.built, 0);
}

#[test]
fn test_keep_going_skips_dependents_of_failures() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.keep_going = true;
    let plan = Plan::from_rows([("x", "1 / 0"), ("y", "x + 1"), ("z", "5")]).unwrap();
    let env = Env::default();

    let report = driver::build_with(&plan, &env, &config, BuildOptions::default()).unwrap();
    assert_eq!(report.built, vec!["z"]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "x");
    assert!(report.skipped.contains(&"y".to_string()));

    let summary = BuildSummary::from_report(&report);
    assert_eq!(driver::exit_code(&Ok(summary)), 1);
}

#[test]
fn test_fail_fast_aborts() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let plan = Plan::from_rows([("x", "1 / 0"), ("y", "x + 1")]).unwrap();
    let env = Env::default();

    let result = driver::build(&plan, &env, &config);
    assert_matches!(result, Err(EngineError::EvalError { .. }));
    assert_eq!(driver::exit_code(&result), 2);
}

#[test]
fn test_record_failed_meta() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.keep_going = true;
    config.record_failed_meta = true;
    let plan = Plan::from_rows([("x", "1 / 0")]).unwrap();

    driver::build_with(&plan, &Env::default(), &config, BuildOptions::default()).unwrap();
    let cache = driver::open_cache(&config).unwrap();
    let meta = cache.get_meta("x").unwrap().unwrap();
    assert!(meta.is_failure());
    assert!(meta.error.unwrap().contains("division by zero"));
}

#[test]
fn test_missing_value_rebuilds_only_under_missing_trigger() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    // Identical commands share one object blob; only the missing-trigger
    // target re-derives it when the blob disappears.
    let plan = Plan::from_toml(
        r#"
        [[target]]
        name = "pinned"
        command = "41 + 1"

        [[target]]
        name = "volatile"
        command = "41 + 1"
        trigger = "missing"
        "#,
    )
    .unwrap();
    let env = Env::default();

    driver::build(&plan, &env, &config).unwrap();
    let cache = driver::open_cache(&config).unwrap();
    let hash = cache
        .get_meta("volatile")
        .unwrap()
        .unwrap()
        .value_hash
        .unwrap();
    std::fs::remove_file(config.cache_dir.join("objects").join(&hash)).unwrap();
    drop(cache);

    let report = driver::build_with(&plan, &env, &config, BuildOptions::default()).unwrap();
    assert_eq!(report.built, vec!["volatile"]);
    assert!(report.skipped.contains(&"pinned".to_string()));
    assert_eq!(target_value(&config, "volatile"), Value::Int(42));
}

#[test]
fn test_strict_mode_fails_on_unknown_identifier() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.strict = true;
    let plan = Plan::from_rows([("a", "nope + 1")]).unwrap();

    let result = driver::build(&plan, &Env::default(), &config);
    assert_matches!(result, Err(EngineError::MissingDependency { .. }));
}

#[test]
fn test_cycle_is_fatal_at_build() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let plan = Plan::from_rows([("a", "b + 1"), ("b", "a + 1")]).unwrap();

    let result = driver::build(&plan, &Env::default(), &config);
    assert_matches!(result, Err(EngineError::CyclicPlan(_)));
    assert_eq!(driver::exit_code(&result), 2);
}

#[test]
fn test_subdoc_dependencies() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    std::fs::write(
        config.workdir.join("report.md"),
        "# Report\n```\nresult = read(alpha)\n```\n",
    )
    .unwrap();
    let plan = Plan::from_rows([
        ("alpha", "11"),
        ("doc", "subdoc_in('report.md')"),
    ])
    .unwrap();
    let env = Env::default();

    let graph = build_graph(&plan, &env, &config);
    // The sub-document's extracted reference links doc -> alpha.
    assert!(graph.deps("doc").unwrap().contains("alpha"));
    assert!(graph.deps("doc").unwrap().contains("subdoc://report.md"));

    let summary = driver::build(&plan, &env, &config).unwrap();
    assert_eq!(summary.built, 2);
    assert_eq!(target_value(&config, "doc"), Value::Str("report.md".into()));

    // Editing the sub-document invalidates the referencing target.
    std::fs::write(
        config.workdir.join("report.md"),
        "# Report v2\n```\nresult = read(alpha)\n```\n",
    )
    .unwrap();
    let report = driver::build_with(&plan, &env, &config, BuildOptions::default()).unwrap();
    assert_eq!(report.built, vec!["doc"]);
}

#[test]
fn test_vectorized_import() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let mut env = Env::default();
    env.insert_value("scale", Value::Int(10));
    env.insert_function("grow", "vectorize(fn(x) x * scale)").unwrap();
    let plan = Plan::from_rows([("ys", "grow([1, 2, 3])")]).unwrap();

    driver::build(&plan, &env, &config).unwrap();
    assert_eq!(
        target_value(&config, "ys"),
        Value::List(vec![Value::Int(10), Value::Int(20), Value::Int(30)])
    );

    // Changing the wrapped function's dependency invalidates the target.
    let mut env2 = Env::default();
    env2.insert_value("scale", Value::Int(100));
    env2.insert_function("grow", "vectorize(fn(x) x * scale)").unwrap();
    let report = driver::build_with(&plan, &env2, &config, BuildOptions::default()).unwrap();
    assert_eq!(report.built, vec!["ys"]);
}

#[cfg(unix)]
#[test]
fn test_fork_backend_builds_chain() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.parallelism = "fork".to_string();
    let plan = Plan::from_rows([("a", "20"), ("b", "a * 2 + 2")]).unwrap();

    let summary = driver::build(&plan, &Env::default(), &config).unwrap();
    assert_eq!(summary.built, 2);
    assert_eq!(target_value(&config, "b"), Value::Int(42));
}

#[test]
fn test_reproducible_seeds() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.root_seed = 7;
    let plan = Plan::from_rows([("s", "seed()")]).unwrap();

    driver::build(&plan, &Env::default(), &config).unwrap();
    let first = target_value(&config, "s");

    // Same root seed reproduces; a different root seed re-derives.
    let cache = driver::open_cache(&config).unwrap();
    cache.clean(Some("s")).unwrap();
    drop(cache);
    driver::build(&plan, &Env::default(), &config).unwrap();
    assert_eq!(target_value(&config, "s"), first);
}
