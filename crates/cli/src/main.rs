use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use skiff_apply::{load_manifests, DeployOptions, Reconciler};
use skiff_core::{DeployResult, Document};
use skiff_diff::MergePolicy;
use skiff_kubehub::{ApplyMode, Connector, KubeConnector, MemoryStore};
use skiff_persist::{ResultStore, SqliteStore};
use skiff_target::{parse_args, TargetResolver};
use tokio::signal;
use tracing::{info, warn};

mod report;

#[derive(Parser, Debug)]
#[command(name = "skiffctl", version, about = "Skiff: declarative deploys to Kubernetes targets")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Project root containing .skiff.yml
    #[arg(long = "project-dir", global = true, env = "SKIFF_PROJECT_DIR", default_value = ".")]
    project_dir: PathBuf,

    /// Manifest directory, relative to the project root
    #[arg(long = "manifests", global = true, env = "SKIFF_MANIFESTS", default_value = "deployment")]
    manifests: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Args, Debug)]
struct TargetArgs {
    /// Target name from .skiff.yml
    #[arg(short = 't', long = "target")]
    target: String,
    /// Override a target argument (key=value), repeatable
    #[arg(short = 'a', long = "arg")]
    args: Vec<String>,
    /// Kube context override
    #[arg(long = "context")]
    context: Option<String>,
    /// Default namespace override
    #[arg(long = "namespace")]
    namespace: Option<String>,
    /// Concurrent cluster calls
    #[arg(long = "workers", env = "SKIFF_WORKERS")]
    workers: Option<usize>,
    /// Compare the full object instead of declared fields only
    #[arg(long = "replace", action = ArgAction::SetTrue)]
    replace: bool,
    /// Run against an empty in-memory cluster
    #[arg(long = "offline", action = ArgAction::SetTrue)]
    offline: bool,
    /// Store the result in the history database
    #[arg(long = "write-result", action = ArgAction::SetTrue)]
    write_result: bool,
    /// Exit non-zero on any per-resource error
    #[arg(long = "strict", action = ArgAction::SetTrue)]
    strict: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply the manifests to a target
    Deploy {
        #[command(flatten)]
        target: TargetArgs,
        /// Compute and report, write nothing
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
        /// Delete orphaned objects
        #[arg(long = "prune", action = ArgAction::SetTrue)]
        prune: bool,
        /// Skip the confirmation prompt
        #[arg(short = 'y', long = "yes", action = ArgAction::SetTrue)]
        yes: bool,
        /// Stop scheduling later waves after the first error
        #[arg(long = "abort-on-error", action = ArgAction::SetTrue)]
        abort_on_error: bool,
        /// Take over fields owned by other managers
        #[arg(long = "force-conflicts", action = ArgAction::SetTrue)]
        force_conflicts: bool,
        /// Retry refused updates as a full replace
        #[arg(long = "replace-on-error", action = ArgAction::SetTrue)]
        replace_on_error: bool,
        /// As --replace-on-error, then delete and re-create if that is refused too
        #[arg(long = "force-replace-on-error", action = ArgAction::SetTrue)]
        force_replace_on_error: bool,
    },
    /// Show what a deploy would change, including field patches
    Diff {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// List targets declared in .skiff.yml
    Targets,
    /// Show stored deploy results for a target
    History {
        #[arg(short = 't', long = "target")]
        target: String,
        #[arg(long = "limit")]
        limit: Option<usize>,
    },
}

fn init_tracing() {
    let env = std::env::var("SKIFF_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("SKIFF_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid SKIFF_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let resolver = TargetResolver::from_dir(&cli.project_dir).with_context(|| format!("loading project from {}", cli.project_dir.display()))?;

    match cli.command {
        Commands::Targets => {
            match cli.output {
                Output::Human => {
                    println!("{:<16} {:<24} {}", "TARGET", "CONTEXT", "NAMESPACE");
                    for t in resolver.targets() {
                        println!(
                            "{:<16} {:<24} {}",
                            t.name,
                            t.context.as_deref().unwrap_or("(current)"),
                            t.namespace.as_deref().unwrap_or(skiff_target::DEFAULT_NAMESPACE)
                        );
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(resolver.targets())?),
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::History { target, limit } => {
            let store = SqliteStore::open_default()?;
            let rows = store.get_results(resolver.project(), &target, limit)?;
            match cli.output {
                Output::Human => {
                    for row in &rows {
                        report::print_history_row(row);
                    }
                    if rows.is_empty() {
                        println!("no stored results for {}/{}", resolver.project(), target);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Diff { target } => {
            let documents = load_documents(&cli.project_dir, &cli.manifests)?;
            let opts = DeployOptions { dry_run: true, ..deploy_options(&target) };
            let result = run_deploy(&resolver, &target, documents, &opts).await?;
            emit(cli.output, &result, true)?;
            Ok(exit_code(&result, target.strict))
        }
        Commands::Deploy { target, dry_run, prune, yes, abort_on_error, force_conflicts, replace_on_error, force_replace_on_error } => {
            let documents = load_documents(&cli.project_dir, &cli.manifests)?;
            let opts = DeployOptions {
                dry_run,
                prune,
                abort_on_error,
                force_conflicts,
                replace_on_error,
                force_replace_on_error,
                ..deploy_options(&target)
            };

            if !dry_run && !yes {
                let plan = run_deploy(&resolver, &target, documents.clone(), &DeployOptions { dry_run: true, ..opts.clone() }).await?;
                report::print_result(&plan, true);
                if plan.changes().next().is_none() && (plan.orphans.is_empty() || !prune) {
                    println!("nothing to do");
                    return Ok(ExitCode::SUCCESS);
                }
                if !confirm("Apply these changes?")? {
                    println!("aborted");
                    return Ok(ExitCode::FAILURE);
                }
            }

            let result = run_deploy(&resolver, &target, documents, &opts).await?;
            emit(cli.output, &result, dry_run)?;
            Ok(exit_code(&result, target.strict))
        }
    }
}

fn load_documents(project_dir: &Path, manifests: &Path) -> Result<Vec<Document>> {
    let dir = project_dir.join(manifests);
    load_manifests(&dir).with_context(|| format!("loading manifests from {}", dir.display()))
}

fn deploy_options(args: &TargetArgs) -> DeployOptions {
    let base = DeployOptions::from_env();
    let (merge_policy, apply_mode) = if args.replace {
        (MergePolicy::Replace, ApplyMode::Replace)
    } else {
        (MergePolicy::FieldOwnership, ApplyMode::ServerSide)
    };
    DeployOptions { workers: args.workers.unwrap_or(base.workers).max(1), merge_policy, apply_mode, ..base }
}

/// Resolve, deploy, optionally record; Ctrl-C cancels the deploy.
async fn run_deploy(resolver: &TargetResolver, args: &TargetArgs, documents: Vec<Document>, opts: &DeployOptions) -> Result<DeployResult> {
    let mut overrides = parse_args(&args.args)?;
    if let Some(ctx) = &args.context {
        overrides.insert("context".into(), ctx.clone());
    }
    if let Some(ns) = &args.namespace {
        overrides.insert("namespace".into(), ns.clone());
    }

    let connector: Arc<dyn Connector> = if args.offline { Arc::new(MemoryStore::new()) } else { Arc::new(KubeConnector) };
    let reconciler = Reconciler::new(resolver.clone(), connector);

    let cancel = opts.cancel.clone();
    let interrupt = tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling deploy");
            cancel.cancel();
        }
    });
    info!(target = %args.target, dry_run = opts.dry_run, prune = opts.prune, offline = args.offline, "deploy invoked");
    let res = reconciler.deploy(&args.target, &overrides, documents, opts).await;
    interrupt.abort();
    let result = res?;

    if args.write_result && !result.dry_run {
        match SqliteStore::open_default() {
            Ok(store) => {
                if let Err(e) = store.put_result(&result) {
                    warn!(error = %e, "storing deploy result failed");
                }
            }
            Err(e) => warn!(error = %e, "result store open failed; skipping history"),
        }
    }
    Ok(result)
}

fn emit(output: Output, result: &DeployResult, show_patches: bool) -> Result<()> {
    match output {
        Output::Human => report::print_result(result, show_patches),
        Output::Json => println!("{}", serde_json::to_string_pretty(result)?),
    }
    Ok(())
}

fn exit_code(result: &DeployResult, strict: bool) -> ExitCode {
    if result.is_success(strict) { ExitCode::SUCCESS } else { ExitCode::from(2) }
}

fn confirm(question: &str) -> Result<bool> {
    print!("{} [y/N] ", question);
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}
