use std::io::{BufRead, Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use kade_api::{DeployOptions, DeployRequest, ExitStatus, InProcApi, KadeApi};
use kade_apply::ServerSide;
use kade_core::{parse_duration, Config, Resource, TracingUi};
use kade_diff::DiffFilter;
use kade_kubehub::KubeClient;

#[derive(Parser, Debug)]
#[command(name = "kadectl", version, about = "kade: deploy groups of Kubernetes resources as apps")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace holding app records
    #[arg(long = "app-namespace", global = true, env = "KADE_APP_NAMESPACE", default_value = "default")]
    app_namespace: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Deploy resources from files as an app
    Deploy(DeployArgs),
    /// Delete every resource of an app, then the app record
    Delete {
        #[arg(short = 'a', long = "app")]
        app: String,
        #[arg(short = 'y', long = "yes", action = ArgAction::SetTrue)]
        yes: bool,
        #[command(flatten)]
        exec: ExecArgs,
    },
    /// List the live resources of an app
    Inspect {
        #[arg(short = 'a', long = "app")]
        app: String,
    },
    /// Show the change history of an app
    History {
        #[arg(short = 'a', long = "app")]
        app: String,
    },
    /// List apps
    Ls,
}

#[derive(Args, Debug)]
struct DeployArgs {
    #[arg(short = 'a', long = "app")]
    app: String,
    /// YAML files or directories; `-` reads stdin
    #[arg(short = 'f', long = "file", required = true)]
    files: Vec<PathBuf>,
    /// Show the diff and exit (2: no changes, 3: pending changes)
    #[arg(long = "diff-run", action = ArgAction::SetTrue)]
    diff_run: bool,
    /// Skip the confirmation prompt
    #[arg(short = 'y', long = "yes", action = ArgAction::SetTrue)]
    yes: bool,
    /// Allow deploying no resources (deletes everything the app owns)
    #[arg(long = "allow-empty", action = ArgAction::SetTrue)]
    allow_empty: bool,
    /// Extra engine config files
    #[arg(short = 'c', long = "config")]
    configs: Vec<PathBuf>,
    /// Namespace for namespaced resources without one
    #[arg(short = 'n', long = "namespace", default_value = "default")]
    namespace: String,
    /// Force every namespaced resource into this namespace
    #[arg(long = "into-ns")]
    into_ns: Option<String>,
    /// Rename namespaces, `src=dst`
    #[arg(long = "map-ns")]
    map_ns: Vec<String>,
    /// Restrict namespaced resources to these namespaces
    #[arg(long = "allowed-ns")]
    allowed_ns: Vec<String>,
    #[arg(long = "deny-cluster-scoped", action = ArgAction::SetTrue)]
    deny_cluster_scoped: bool,
    /// Diff filter (YAML or JSON), e.g. `{ops: [create, update]}`
    #[arg(long = "filter")]
    filter: Option<String>,
    /// Reuse the newest matching version even after a failed deploy
    #[arg(long = "latest-versions", action = ArgAction::SetTrue)]
    latest_versions: bool,
    #[arg(long = "diff-context", default_value_t = 2)]
    diff_context: usize,
    /// Show secret values in diffs
    #[arg(long = "no-mask", action = ArgAction::SetTrue)]
    no_mask: bool,
    #[command(flatten)]
    exec: ExecArgs,
}

#[derive(Args, Debug)]
struct ExecArgs {
    /// Changes applied or waited on at once
    #[arg(long = "concurrency", default_value_t = 5)]
    concurrency: usize,
    /// Do not wait for resources to reconcile
    #[arg(long = "no-wait", action = ArgAction::SetTrue)]
    no_wait: bool,
    /// Per-change reconcile timeout
    #[arg(long = "wait-timeout", default_value = "15m")]
    wait_timeout: String,
    /// Whole-deploy timeout
    #[arg(long = "timeout")]
    timeout: Option<String>,
    /// Keep scheduling after an apply error
    #[arg(long = "keep-going-on-apply-error", action = ArgAction::SetTrue)]
    keep_going_on_apply_error: bool,
    /// Keep scheduling after a wait error
    #[arg(long = "keep-going-on-wait-error", action = ArgAction::SetTrue)]
    keep_going_on_wait_error: bool,
    /// Write with server-side apply under this field manager
    #[arg(long = "server-side")]
    server_side: Option<String>,
    #[arg(long = "force-conflicts", action = ArgAction::SetTrue)]
    force_conflicts: bool,
}

fn init_tracing() {
    let env = std::env::var("KADE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KADE_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KADE_METRICS_ADDR; expected host:port");
        }
    }
}

fn max_yaml_bytes() -> u64 {
    std::env::var("KADE_MAX_YAML_BYTES").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(8_000_000)
}

fn read_input(path: &Path) -> Result<String> {
    let limit = max_yaml_bytes();
    let mut buf = String::new();
    if path.as_os_str() == "-" {
        std::io::stdin().take(limit + 1).read_to_string(&mut buf).context("read stdin")?;
    } else {
        std::fs::File::open(path).with_context(|| format!("open {}", path.display()))?.take(limit + 1).read_to_string(&mut buf).with_context(|| format!("read {}", path.display()))?;
    }
    if buf.len() as u64 > limit {
        bail!("{} exceeds KADE_MAX_YAML_BYTES ({limit} bytes)", path.display());
    }
    Ok(buf)
}

/// Files in argument order; directories contribute their `.yaml`/`.yml`
/// files sorted by name.
fn load_resources(paths: &[PathBuf]) -> Result<Vec<Resource>> {
    let mut out = Vec::new();
    for path in paths {
        let mut files = Vec::new();
        if path.is_dir() {
            for entry in std::fs::read_dir(path).with_context(|| format!("read dir {}", path.display()))? {
                let p = entry?.path();
                if matches!(p.extension().and_then(|e| e.to_str()), Some("yaml" | "yml")) {
                    files.push(p);
                }
            }
            files.sort();
        } else {
            files.push(path.clone());
        }
        for f in files {
            let docs = Resource::from_yaml_documents(&read_input(&f)?).with_context(|| format!("parse {}", f.display()))?;
            out.extend(docs);
        }
    }
    Ok(out)
}

fn load_config(paths: &[PathBuf]) -> Result<Config> {
    let mut cfg = Config::default();
    for p in paths {
        cfg.merge(Config::from_yaml(&read_input(p)?).with_context(|| format!("config {}", p.display()))?);
    }
    Ok(cfg)
}

impl ExecArgs {
    fn apply_to(&self, opts: &mut DeployOptions) -> Result<()> {
        let exec = &mut opts.exec;
        exec.concurrency = self.concurrency.max(1);
        exec.wait = !self.no_wait;
        exec.change_timeout = parse_duration(&self.wait_timeout)?;
        exec.global_timeout = self.timeout.as_deref().map(parse_duration).transpose()?;
        exec.exit_early_on_apply_error = !self.keep_going_on_apply_error;
        exec.exit_early_on_wait_error = !self.keep_going_on_wait_error;
        exec.server_side = self.server_side.as_ref().map(|m| ServerSide { field_manager: m.clone(), force: self.force_conflicts });
        Ok(())
    }
}

fn deploy_options(args: &DeployArgs) -> Result<DeployOptions> {
    let mut opts = DeployOptions { config: load_config(&args.configs)?, allow_empty: args.allow_empty, latest_versions: args.latest_versions, ..DeployOptions::default() };
    opts.prepare.default_namespace = args.namespace.clone();
    opts.prepare.into_namespace = args.into_ns.clone();
    opts.prepare.namespace_map = kade_prepare::parse_namespace_map(&args.map_ns)?;
    opts.prepare.allowed_namespaces = args.allowed_ns.clone();
    opts.prepare.allow_cluster_scoped = !args.deny_cluster_scoped;
    if let Some(f) = &args.filter {
        opts.filter = DiffFilter::parse(f)?;
    }
    opts.context_lines = args.diff_context;
    opts.mask_diffs = !args.no_mask;
    args.exec.apply_to(&mut opts)?;
    Ok(opts)
}

async fn confirm(prompt: String) -> Result<bool> {
    tokio::task::spawn_blocking(move || {
        eprint!("{prompt} [y/N]: ");
        std::io::stderr().flush()?;
        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line)?;
        Ok(matches!(line.trim(), "y" | "Y" | "yes"))
    })
    .await?
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; canceling");
            child.cancel();
        }
    });
    token
}

async fn run(cli: Cli) -> Result<ExitStatus> {
    let client = Arc::new(KubeClient::try_default().await.context("connect to cluster")?);
    let api = InProcApi::new(client, cli.app_namespace.clone(), Arc::new(TracingUi));

    match cli.command {
        Commands::Deploy(args) => {
            let t0 = Instant::now();
            let resources = load_resources(&args.files)?;
            info!(app = %args.app, resources = resources.len(), "deploy invoked");
            let plan = api.plan(DeployRequest::new(&args.app, resources).with_options(deploy_options(&args)?)).await?;
            match cli.output {
                Output::Human => println!("{}", plan.render()),
                Output::Json => {
                    let changes: Vec<serde_json::Value> = plan
                        .changes
                        .iter()
                        .map(|c| serde_json::json!({"op": c.op, "resource": c.resource().description(), "ignored": c.ignored, "diff": c.diff.text}))
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&changes)?);
                }
            }
            if args.diff_run {
                return Ok(plan.diff_status());
            }
            if plan.has_pending() && !args.yes && !confirm(format!("Apply {} to app '{}'?", plan.summary, args.app)).await? {
                bail!("deploy declined");
            }
            let out = api.apply(plan, &cancel_on_ctrl_c()).await?;
            info!(app = %args.app, change = %out.change.name, took_ms = %t0.elapsed().as_millis(), "deploy ok");
            println!("{}", out.report.summary());
        }
        Commands::Delete { app, yes, exec } => {
            if !yes && !confirm(format!("Delete app '{app}' and all of its resources?")).await? {
                bail!("delete declined");
            }
            let mut opts = DeployOptions::default();
            exec.apply_to(&mut opts)?;
            let out = api.delete(&app, opts, &cancel_on_ctrl_c()).await?;
            println!("{}", out.report.summary());
        }
        Commands::Inspect { app } => {
            let resources = api.inspect(&app).await?;
            match cli.output {
                Output::Human => {
                    for r in &resources {
                        println!("{}", r.description());
                    }
                }
                Output::Json => {
                    let raw: Vec<&serde_json::Value> = resources.iter().map(Resource::raw).collect();
                    println!("{}", serde_json::to_string_pretty(&raw)?);
                }
            }
        }
        Commands::History { app } => {
            let changes = api.history(&app).await?;
            match cli.output {
                Output::Human => {
                    for c in &changes {
                        let state = match c.meta.successful {
                            Some(true) => "succeeded",
                            Some(false) => "failed",
                            None => "running",
                        };
                        println!("{}  {}  {}  {}", c.name, c.meta.started_at, state, c.meta.description);
                    }
                }
                Output::Json => {
                    let metas: Vec<_> = changes.iter().map(|c| serde_json::json!({"name": c.name, "meta": c.meta})).collect();
                    println!("{}", serde_json::to_string_pretty(&metas)?);
                }
            }
        }
        Commands::Ls => {
            for app in api.apps().await? {
                let last = match app.last_change_successful() {
                    Some(true) => "succeeded",
                    Some(false) => "failed",
                    None => "-",
                };
                println!("{}  {}={}  {last}", app.name, app.spec.label_key, app.spec.label_value);
            }
        }
    }
    Ok(ExitStatus::Success)
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(status) => ExitCode::from(status.code() as u8),
        Err(e) => {
            error!(error = %e, "kadectl failed");
            eprintln!("kadectl: {e:#}");
            ExitCode::from(ExitStatus::Failure.code() as u8)
        }
    }
}
