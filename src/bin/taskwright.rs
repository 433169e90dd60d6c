use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use owo_colors::OwoColorize;
use tracing_subscriber::EnvFilter;

use taskwright::analyze::{Analyzer, Env, MarkdownExtractor};
use taskwright::config::{Config, Strategy};
use taskwright::driver::{self, BuildOptions, BuildSummary};
use taskwright::graph::Graph;
use taskwright::oracle::Oracle;
use taskwright::plan::Plan;
use taskwright::query;
use taskwright::worker::{run_worker, WorkerArgs};

#[derive(Parser)]
#[command(name = "taskwright", about = "declarative, cached, parallel target builds")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file (skips layered config loading)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log every target start/finish, not just warnings and failures
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Args, Clone)]
struct PlanArgs {
    /// Plan file
    #[arg(long, default_value = "plan.toml")]
    plan: PathBuf,

    /// Environment file (imports)
    #[arg(long)]
    env: Option<PathBuf>,

    /// Cache root directory
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Base directory for file dependencies
    #[arg(long)]
    workdir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Build every outdated target in the plan
    Build {
        #[command(flatten)]
        plan_args: PlanArgs,

        /// Max concurrent workers (0 = auto-detect)
        #[arg(short, long)]
        jobs: Option<usize>,

        /// Dispatch backend: thread, fork, process, external
        #[arg(long)]
        backend: Option<String>,

        /// Use the staged (layer-barrier) scheduler
        #[arg(long)]
        staged: bool,

        /// Continue past per-target failures
        #[arg(long)]
        keep_going: bool,

        /// Default trigger for targets that do not set one
        #[arg(long)]
        trigger: Option<String>,

        /// Base seed for reproducible evaluation
        #[arg(long)]
        seed: Option<u64>,

        /// Treat unknown identifiers as errors
        #[arg(long)]
        strict: bool,
    },

    /// Show which targets are outdated and why
    Outdated {
        #[command(flatten)]
        plan_args: PlanArgs,
    },

    /// Print the dependency tree and the parallel stages
    Graph {
        #[command(flatten)]
        plan_args: PlanArgs,

        /// Maximum tree depth
        #[arg(long, default_value_t = 8)]
        depth: usize,
    },

    /// Remove cached results for the named targets (or everything)
    Clean {
        /// Cache root directory
        #[arg(long)]
        cache_dir: Option<PathBuf>,

        /// Targets to clean; empty cleans the whole cache
        targets: Vec<String>,
    },

    /// Internal single-target worker mode
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        plan: PathBuf,

        #[arg(long)]
        env: Option<PathBuf>,

        #[arg(long)]
        target: String,

        #[arg(long)]
        cache_dir: PathBuf,

        #[arg(long, default_value = ".")]
        workdir: PathBuf,

        #[arg(long, default_value_t = 0)]
        seed: u64,

        /// Fingerprint files by mtime instead of content
        #[arg(long)]
        mtime_only: bool,

        #[arg(long)]
        record_failed_meta: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "taskwright=info"
    } else {
        "taskwright=warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    // Logs go to stderr; stdout carries reports (and the worker protocol).
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            2
        }
    };
    std::process::exit(code);
}

fn load_config(cli_config: Option<&PathBuf>, plan_args: &PlanArgs) -> Result<Config> {
    let mut config = Config::load(cli_config.map(|p| p.as_path()))
        .context("failed to load configuration")?;
    if let Some(cache_dir) = &plan_args.cache_dir {
        config.cache_dir = cache_dir.clone();
    }
    if let Some(workdir) = &plan_args.workdir {
        config.workdir = workdir.clone();
    }
    Ok(config)
}

fn load_plan_env(plan_args: &PlanArgs) -> Result<(Plan, Env)> {
    let plan = Plan::load(&plan_args.plan)
        .with_context(|| format!("failed to load plan {}", plan_args.plan.display()))?;
    let env = match &plan_args.env {
        Some(path) => {
            Env::load(path).with_context(|| format!("failed to load env {}", path.display()))?
        }
        None => Env::default(),
    };
    Ok((plan, env))
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Build {
            plan_args,
            jobs,
            backend,
            staged,
            keep_going,
            trigger,
            seed,
            strict,
        } => {
            let mut config = load_config(cli.config.as_ref(), &plan_args)?;
            if let Some(jobs) = jobs {
                config.max_parallel = jobs;
            }
            if let Some(backend) = backend {
                config.parallelism = backend;
            }
            if staged {
                config.strategy = Strategy::Staged;
            }
            if keep_going {
                config.keep_going = true;
            }
            if let Some(trigger) = trigger {
                config.trigger_default = trigger.parse()?;
            }
            if let Some(seed) = seed {
                config.root_seed = seed;
            }
            if strict {
                config.strict = true;
            }

            let (plan, env) = load_plan_env(&plan_args)?;

            let cancel = Arc::new(AtomicBool::new(false));
            driver::install_cancel_handler(cancel.clone())?;
            let options = BuildOptions {
                plan_path: Some(plan_args.plan.clone()),
                env_path: plan_args.env.clone(),
                cancel: Some(cancel),
                backends: Vec::new(),
            };

            let result = driver::build_with(&plan, &env, &config, options);
            let summary_result = match result {
                Ok(report) => {
                    let summary = BuildSummary::from_report(&report);
                    println!(
                        "{} {} built, {} skipped, {} failed",
                        if summary.failed == 0 {
                            "done:".green().to_string()
                        } else {
                            "done:".yellow().to_string()
                        },
                        summary.built,
                        summary.skipped,
                        summary.failed
                    );
                    for (name, error) in &report.failed {
                        eprintln!("  {} {}: {}", "failed".red(), name, error);
                    }
                    Ok(summary)
                }
                Err(e) => {
                    eprintln!("{} {}", "aborted:".red().bold(), e);
                    Err(e)
                }
            };
            Ok(driver::exit_code(&summary_result))
        }

        Commands::Outdated { plan_args } => {
            let config = load_config(cli.config.as_ref(), &plan_args)?;
            let (plan, env) = load_plan_env(&plan_args)?;
            let cache = driver::open_cache(&config)?;
            let extractor = MarkdownExtractor::default();
            let analyzer = Analyzer::new(&config.workdir).with_extractor(&extractor);
            let graph = Graph::build(&plan, &env, &analyzer, config.trigger_default, config.strict)?;
            let oracle = Oracle::new(&graph, &env, &cache, &config.workdir, config.hash_files);
            query::print_outdated(&graph, &oracle)?;
            Ok(0)
        }

        Commands::Graph { plan_args, depth } => {
            let config = load_config(cli.config.as_ref(), &plan_args)?;
            let (plan, env) = load_plan_env(&plan_args)?;
            let cache = driver::open_cache(&config)?;
            let extractor = MarkdownExtractor::default();
            let analyzer = Analyzer::new(&config.workdir).with_extractor(&extractor);
            let graph = Graph::build(&plan, &env, &analyzer, config.trigger_default, config.strict)?;
            let oracle = Oracle::new(&graph, &env, &cache, &config.workdir, config.hash_files);
            query::print_graph(&graph, depth);
            println!();
            query::print_stages(&graph, &oracle)?;
            Ok(0)
        }

        Commands::Clean { cache_dir, targets } => {
            let mut config = Config::load(cli.config.as_ref().map(|p| p.as_path()))?;
            if let Some(cache_dir) = cache_dir {
                config.cache_dir = cache_dir;
            }
            let cache = driver::open_cache(&config)?;
            if targets.is_empty() {
                cache.clean(None)?;
                println!("cache cleaned: {}", config.cache_dir.display());
            } else {
                for target in &targets {
                    cache.clean(Some(target))?;
                    println!("cleaned {}", target);
                }
            }
            Ok(0)
        }

        Commands::Worker {
            plan,
            env,
            target,
            cache_dir,
            workdir,
            seed,
            mtime_only,
            record_failed_meta,
        } => {
            let report = run_worker(&WorkerArgs {
                plan_path: plan,
                env_path: env,
                target,
                cache_dir,
                workdir,
                seed,
                hash_files: !mtime_only,
                record_failed_meta,
            })?;
            println!("{}", serde_json::to_string(&report)?);
            Ok(0)
        }
    }
}
