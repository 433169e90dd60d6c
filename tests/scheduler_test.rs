//! Scheduler behavior observed through a recording callback backend:
//! concurrency bounds, dependency ordering, retry semantics, per-row
//! evaluator overrides, and cancellation.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use taskwright::analyze::Env;
use taskwright::config::{Config, Strategy};
use taskwright::driver::{self, BuildOptions};
use taskwright::error::{EngineError, Result};
use taskwright::lang::{eval, Value};
use taskwright::plan::Plan;
use taskwright::scheduler::{CallbackBackend, WorkItem};

fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.cache_dir = dir.join("cache");
    config.workdir = dir.join("work");
    std::fs::create_dir_all(&config.workdir).unwrap();
    config
}

fn evaluate(item: &WorkItem) -> Result<Value> {
    eval::eval(&item.command, &item.scope)
}

fn target_value(config: &Config, name: &str) -> Value {
    let cache = driver::open_cache(config).unwrap();
    let meta = cache.get_meta(name).unwrap().unwrap();
    cache.get_value(&meta.value_hash.unwrap()).unwrap()
}

#[test]
fn test_concurrent_building_never_exceeds_max_parallel() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.parallelism = "probe".to_string();
    config.max_parallel = 3;

    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let backend = {
        let active = active.clone();
        let peak = peak.clone();
        CallbackBackend::new("probe", 3, move |item: &WorkItem| {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(30));
            let value = evaluate(item);
            active.fetch_sub(1, Ordering::SeqCst);
            value
        })
    };

    let plan = Plan::from_rows([
        ("t1", "1"),
        ("t2", "2"),
        ("t3", "3"),
        ("t4", "4"),
        ("t5", "5"),
        ("t6", "6"),
    ])
    .unwrap();
    let options = BuildOptions {
        backends: vec![Arc::new(backend)],
        ..Default::default()
    };
    let report = driver::build_with(&plan, &Env::default(), &config, options).unwrap();
    assert_eq!(report.built.len(), 6);
    assert!(peak.load(Ordering::SeqCst) <= 3, "peak = {}", peak.load(Ordering::SeqCst));
}

#[test]
fn test_dependents_start_only_after_dependencies_finish() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.parallelism = "recorder".to_string();
    config.max_parallel = 4;

    let events: Arc<Mutex<Vec<(String, &'static str)>>> = Arc::new(Mutex::new(Vec::new()));
    let backend = {
        let events = events.clone();
        CallbackBackend::new("recorder", 4, move |item: &WorkItem| {
            events.lock().unwrap().push((item.name.clone(), "start"));
            let value = evaluate(item);
            events.lock().unwrap().push((item.name.clone(), "end"));
            value
        })
    };

    let plan = Plan::from_rows([
        ("a", "1"),
        ("b", "a + 1"),
        ("c", "a + 2"),
        ("d", "b + c"),
    ])
    .unwrap();
    let options = BuildOptions {
        backends: vec![Arc::new(backend)],
        ..Default::default()
    };
    driver::build_with(&plan, &Env::default(), &config, options).unwrap();

    let events = events.lock().unwrap();
    let position = |name: &str, what: &str| {
        events
            .iter()
            .position(|(n, w)| n == name && *w == what)
            .unwrap_or_else(|| panic!("no {} event for {}", what, name))
    };
    for (dependent, dependency) in [("b", "a"), ("c", "a"), ("d", "b"), ("d", "c")] {
        assert!(
            position(dependency, "end") < position(dependent, "start"),
            "{} started before {} finished",
            dependent,
            dependency
        );
    }
    assert_eq!(target_value(&config, "d"), Value::Int(5));
}

#[test]
fn test_backend_error_is_retried_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.parallelism = "flaky".to_string();

    let calls = Arc::new(AtomicUsize::new(0));
    let backend = {
        let calls = calls.clone();
        CallbackBackend::new("flaky", 1, move |item: &WorkItem| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(EngineError::BackendError("transient".to_string()))
            } else {
                evaluate(item)
            }
        })
    };

    let plan = Plan::from_rows([("t", "40 + 2")]).unwrap();
    let options = BuildOptions {
        backends: vec![Arc::new(backend)],
        ..Default::default()
    };
    let report = driver::build_with(&plan, &Env::default(), &config, options).unwrap();
    assert_eq!(report.built, vec!["t"]);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(target_value(&config, "t"), Value::Int(42));
}

#[test]
fn test_persistent_backend_error_escalates_after_one_retry() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.parallelism = "down".to_string();
    config.keep_going = true;

    let calls = Arc::new(AtomicUsize::new(0));
    let backend = {
        let calls = calls.clone();
        CallbackBackend::new("down", 1, move |_item: &WorkItem| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(EngineError::BackendError("still down".to_string()))
        })
    };

    let plan = Plan::from_rows([("t", "1")]).unwrap();
    let options = BuildOptions {
        backends: vec![Arc::new(backend)],
        ..Default::default()
    };
    let report = driver::build_with(&plan, &Env::default(), &config, options).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(report.failed.len(), 1);
    assert!(report.failed[0].1.contains("backend failed after retry"));
}

#[test]
fn test_per_row_evaluator_override() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());

    let handled: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let backend = {
        let handled = handled.clone();
        CallbackBackend::new("special", 2, move |item: &WorkItem| {
            handled.lock().unwrap().push(item.name.clone());
            evaluate(item)
        })
    };

    let plan = Plan::from_toml(
        r#"
        [[target]]
        name = "ordinary"
        command = "1"

        [[target]]
        name = "offloaded"
        command = "ordinary + 1"
        evaluator = "special"
        "#,
    )
    .unwrap();
    let options = BuildOptions {
        backends: vec![Arc::new(backend)],
        ..Default::default()
    };
    let report = driver::build_with(&plan, &Env::default(), &config, options).unwrap();
    assert_eq!(report.built.len(), 2);
    assert_eq!(handled.lock().unwrap().as_slice(), ["offloaded"]);
}

#[test]
fn test_staged_strategy_builds_diamond() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.strategy = Strategy::Staged;
    config.max_parallel = 2;

    let plan = Plan::from_rows([
        ("a", "1"),
        ("b", "a + 1"),
        ("c", "a + 2"),
        ("d", "b + c"),
    ])
    .unwrap();
    let summary = driver::build(&plan, &Env::default(), &config).unwrap();
    assert_eq!(summary.built, 4);
    assert_eq!(target_value(&config, "d"), Value::Int(5));

    // Staged runs reach the same cached fixpoint.
    let second = driver::build(&plan, &Env::default(), &config).unwrap();
    assert_eq!(second.built, 0);
}

#[test]
fn test_staged_strategy_skips_failed_subtrees() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.strategy = Strategy::Staged;
    config.keep_going = true;

    let plan = Plan::from_rows([("x", "1 / 0"), ("y", "x + 1"), ("z", "3")]).unwrap();
    let report = driver::build_with(&plan, &Env::default(), &config, BuildOptions::default()).unwrap();
    assert_eq!(report.built, vec!["z"]);
    assert_eq!(report.failed[0].0, "x");
    assert!(report.skipped.contains(&"y".to_string()));
}

#[test]
fn test_pre_cancelled_run_dispatches_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let plan = Plan::from_rows([("a", "1"), ("b", "a + 1")]).unwrap();

    let cancel = Arc::new(AtomicBool::new(true));
    let options = BuildOptions {
        cancel: Some(cancel),
        ..Default::default()
    };
    let result = driver::build_with(&plan, &Env::default(), &config, options)
        .map(|r| driver::BuildSummary::from_report(&r));
    assert!(matches!(result, Err(EngineError::Cancelled)));
    assert_eq!(driver::exit_code(&result), 130);

    // Nothing was committed.
    let cache = driver::open_cache(&config).unwrap();
    assert!(cache.get_meta("a").unwrap().is_none());
}

#[test]
fn test_master_caching_site_commits_in_band_values() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.parallelism = "inband".to_string();

    // CallbackBackend returns values in-band; the master writes the store.
    let backend = CallbackBackend::new("inband", 2, |item: &WorkItem| evaluate(item));
    let plan = Plan::from_rows([("a", "2"), ("b", "a * a")]).unwrap();
    let options = BuildOptions {
        backends: vec![Arc::new(backend)],
        ..Default::default()
    };
    driver::build_with(&plan, &Env::default(), &config, options).unwrap();
    assert_eq!(target_value(&config, "b"), Value::Int(4));
}
